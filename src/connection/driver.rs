//! Operation tables implemented by modem back-ends.
//!
//! Optional operations are advertised through `supports_*` probes; a
//! back-end that does not implement one keeps the default, which reports
//! the capability as absent and fails the call.

use async_trait::async_trait;

use super::error::DriverError;
use super::types::{AuthMethod, Protocol, RegistrationStatus};

/// Parameters handed to the back-end when activating a primary context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryConfig {
    /// Modem context identifier to program.
    pub cid: u32,
    /// Access point name.
    pub apn: String,
    /// Username, empty for none.
    pub username: String,
    /// Password, empty for none.
    pub password: String,
    /// Requested PDP type.
    pub proto: Protocol,
    /// Authentication scheme.
    pub auth_method: AuthMethod,
}

/// IPv4 configuration reported by the back-end for an activated context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawIpv4Config {
    /// Assigned address.
    pub address: Option<String>,
    /// Whether the address is static rather than DHCP-acquired.
    pub static_ip: bool,
    /// Dotted netmask, when the modem reports one.
    pub netmask: Option<String>,
    /// Prefix length, when the modem reports one instead of a netmask.
    pub prefix_length: Option<u8>,
    /// Default gateway.
    pub gateway: Option<String>,
    /// Name servers.
    pub dns: Vec<String>,
}

/// IPv6 configuration reported by the back-end for an activated context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawIpv6Config {
    /// Assigned address.
    pub address: Option<String>,
    /// Prefix length.
    pub prefix_length: Option<u8>,
    /// Default gateway.
    pub gateway: Option<String>,
    /// Name servers.
    pub dns: Vec<String>,
}

/// Everything a back-end reports about an activated context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawIpConfig {
    /// IPv4 block, if negotiated.
    pub ipv4: Option<RawIpv4Config>,
    /// IPv6 block, if negotiated.
    pub ipv6: Option<RawIpv6Config>,
}

/// Packet-service operations of a modem back-end.
#[async_trait]
pub trait GprsDriver: Send + Sync {
    /// Drive the packet attach state.
    async fn set_attached(&self, attached: bool) -> Result<(), DriverError>;

    /// Whether [`GprsDriver::attached_status`] is implemented.
    fn supports_attached_status(&self) -> bool {
        false
    }

    /// Query the current packet registration status.
    async fn attached_status(&self) -> Result<RegistrationStatus, DriverError> {
        Err(DriverError::failure())
    }

    /// Whether [`GprsDriver::list_active_contexts`] is implemented.
    fn supports_list_active_contexts(&self) -> bool {
        false
    }

    /// Scan for contexts already active on the modem; each one found is
    /// reported through the manager's event channel.
    async fn list_active_contexts(&self) -> Result<(), DriverError> {
        Err(DriverError::failure())
    }
}

/// Per-context operations of a modem back-end.
#[async_trait]
pub trait ContextDriver: Send + Sync {
    /// OS network interface carrying this back-end's traffic.
    fn interface(&self) -> Option<String>;

    /// Activate a primary context and report its IP configuration.
    async fn activate_primary(&self, config: &PrimaryConfig) -> Result<RawIpConfig, DriverError>;

    /// Deactivate an active primary context.
    async fn deactivate_primary(&self, cid: u32) -> Result<(), DriverError>;

    /// Whether [`ContextDriver::read_settings`] is implemented.
    fn supports_read_settings(&self) -> bool {
        false
    }

    /// Read the IP configuration of a context the modem activated on its
    /// own.
    async fn read_settings(&self, _cid: u32) -> Result<RawIpConfig, DriverError> {
        Err(DriverError::failure())
    }

    /// Whether [`ContextDriver::detach_shutdown`] is implemented.
    fn supports_detach_shutdown(&self) -> bool {
        false
    }

    /// Forcibly tear a context down while the attach state is being
    /// cleaned up. Best-effort; no completion is reported.
    async fn detach_shutdown(&self, _cid: u32) {}
}
