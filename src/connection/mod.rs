/// Driver binding and per-context IP settings.
pub mod binding;
/// Per-APN primary context entity.
pub mod context;
/// D-Bus surface for the connection manager and its contexts.
pub mod dbus;
/// Operation tables implemented by modem back-ends.
pub mod driver;
/// Connection core errors.
pub mod error;
/// Bounded integer id allocation.
pub mod idset;
/// Attach state machine and context arbitration.
pub mod manager;
/// Network-interface side effects of context transitions.
pub mod netif;
/// Per-IMSI settings store.
pub mod persistence;
/// APN template lookup.
pub mod provisioning;
/// Enums and limits shared across the connection core.
pub mod types;
/// APN and proxy validation.
pub mod validation;

pub use error::{DriverError, Error};
pub use manager::{ConnectionManager, ManagerEvent, ModemIdentity};
pub use types::{AuthMethod, Bearer, ContextType, Protocol, RegistrationStatus};
