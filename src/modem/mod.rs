/// AT dialect context operations.
pub mod context;
/// AT dialect packet-service driver.
pub mod gprs;
/// AT response line scanning.
pub mod result;
/// Framed AT command transport.
pub mod transport;
/// Vendor dialect tables.
pub mod vendor;

#[cfg(test)]
pub(crate) mod testutil;

pub use context::AtContextDriver;
pub use gprs::{AtGprsDriver, ProbeError};
pub use transport::{AtChannel, AtMux, AtResponse, ChannelError};
pub use vendor::Vendor;
