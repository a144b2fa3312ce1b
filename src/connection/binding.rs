//! Driver binding and per-context IP settings.

use std::sync::Arc;

use super::driver::{ContextDriver, RawIpConfig};
use super::types::BindingType;

/// IPv4 settings block populated during activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ipv4Settings {
    /// Whether the address is static rather than DHCP-acquired.
    pub static_ip: bool,
    /// Assigned address.
    pub address: Option<String>,
    /// Dotted netmask.
    pub netmask: Option<String>,
    /// Default gateway.
    pub gateway: Option<String>,
    /// Name servers.
    pub dns: Vec<String>,
    /// MMS proxy carried verbatim in the settings dictionary.
    pub proxy: Option<String>,
}

/// IPv6 settings block populated during activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ipv6Settings {
    /// Assigned address.
    pub address: Option<String>,
    /// Prefix length.
    pub prefix_length: Option<u8>,
    /// Default gateway.
    pub gateway: Option<String>,
    /// Name servers.
    pub dns: Vec<String>,
}

/// IP settings of the context currently using a binding.
///
/// Family blocks are pre-allocated according to the context's protocol
/// before activation; setters for a family that was not allocated are
/// silent no-ops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextSettings {
    /// IPv4 block, present when the protocol carries IPv4.
    pub ipv4: Option<Ipv4Settings>,
    /// IPv6 block, present when the protocol carries IPv6.
    pub ipv6: Option<Ipv6Settings>,
}

impl ContextSettings {
    /// Set the IPv4 address.
    pub fn set_ipv4_address(&mut self, address: &str, static_ip: bool) {
        if let Some(ipv4) = self.ipv4.as_mut() {
            ipv4.address = Some(address.to_string());
            ipv4.static_ip = static_ip;
        }
    }

    /// Set the IPv4 netmask.
    pub fn set_ipv4_netmask(&mut self, netmask: &str) {
        if let Some(ipv4) = self.ipv4.as_mut() {
            ipv4.netmask = Some(netmask.to_string());
        }
    }

    /// Set the IPv4 netmask from a prefix length.
    pub fn set_ipv4_prefix_length(&mut self, length: u8) {
        if let Some(ipv4) = self.ipv4.as_mut() {
            ipv4.netmask = Some(netmask_from_prefix(length));
        }
    }

    /// Set the IPv4 gateway.
    pub fn set_ipv4_gateway(&mut self, gateway: &str) {
        if let Some(ipv4) = self.ipv4.as_mut() {
            ipv4.gateway = Some(gateway.to_string());
        }
    }

    /// Set the IPv4 name servers.
    pub fn set_ipv4_dns_servers(&mut self, dns: &[String]) {
        if let Some(ipv4) = self.ipv4.as_mut() {
            ipv4.dns = dns.to_vec();
        }
    }

    /// Set the IPv6 address.
    pub fn set_ipv6_address(&mut self, address: &str) {
        if let Some(ipv6) = self.ipv6.as_mut() {
            ipv6.address = Some(address.to_string());
        }
    }

    /// Set the IPv6 prefix length.
    pub fn set_ipv6_prefix_length(&mut self, length: u8) {
        if let Some(ipv6) = self.ipv6.as_mut() {
            ipv6.prefix_length = Some(length);
        }
    }

    /// Set the IPv6 gateway.
    pub fn set_ipv6_gateway(&mut self, gateway: &str) {
        if let Some(ipv6) = self.ipv6.as_mut() {
            ipv6.gateway = Some(gateway.to_string());
        }
    }

    /// Set the IPv6 name servers.
    pub fn set_ipv6_dns_servers(&mut self, dns: &[String]) {
        if let Some(ipv6) = self.ipv6.as_mut() {
            ipv6.dns = dns.to_vec();
        }
    }

    /// Ingest the configuration a back-end reported, honouring the
    /// family gating of the individual setters.
    pub fn apply_raw(&mut self, raw: &RawIpConfig) {
        if let Some(v4) = raw.ipv4.as_ref() {
            if let Some(address) = v4.address.as_deref() {
                self.set_ipv4_address(address, v4.static_ip);
            }
            if let Some(netmask) = v4.netmask.as_deref() {
                self.set_ipv4_netmask(netmask);
            } else if let Some(length) = v4.prefix_length {
                self.set_ipv4_prefix_length(length);
            }
            if let Some(gateway) = v4.gateway.as_deref() {
                self.set_ipv4_gateway(gateway);
            }
            if !v4.dns.is_empty() {
                self.set_ipv4_dns_servers(&v4.dns);
            }
        }

        if let Some(v6) = raw.ipv6.as_ref() {
            if let Some(address) = v6.address.as_deref() {
                self.set_ipv6_address(address);
            }
            if let Some(length) = v6.prefix_length {
                self.set_ipv6_prefix_length(length);
            }
            if let Some(gateway) = v6.gateway.as_deref() {
                self.set_ipv6_gateway(gateway);
            }
            if !v6.dns.is_empty() {
                self.set_ipv6_dns_servers(&v6.dns);
            }
        }
    }

    /// Drop both family blocks.
    pub fn clear(&mut self) {
        self.ipv4 = None;
        self.ipv6 = None;
    }
}

fn netmask_from_prefix(length: u8) -> String {
    let bits: u32 = if length == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(length.min(32)))
    };
    std::net::Ipv4Addr::from(bits).to_string()
}

/// A registered context back-end and the settings of the context using
/// it.
///
/// `inuse` acts as a 0/1 mutex: at most one primary context refers to a
/// binding, and the binding may not be reassigned until that context has
/// fully returned to inactive.
pub struct ContextBinding {
    /// Context type this binding accepts.
    pub binding_type: BindingType,
    /// Whether a primary context currently owns this binding.
    pub inuse: bool,
    /// The back-end operation table.
    pub driver: Arc<dyn ContextDriver>,
    /// Settings populated by the back-end during activation.
    pub settings: ContextSettings,
    /// OS network interface, fixed at registration.
    pub interface: Option<String>,
}

impl ContextBinding {
    /// Create a binding for a back-end.
    pub fn new(binding_type: BindingType, driver: Arc<dyn ContextDriver>) -> Self {
        let interface = driver.interface();
        Self {
            binding_type,
            inuse: false,
            driver,
            settings: ContextSettings::default(),
            interface,
        }
    }
}

impl std::fmt::Debug for ContextBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBinding")
            .field("binding_type", &self.binding_type)
            .field("inuse", &self.inuse)
            .field("interface", &self.interface)
            .finish()
    }
}
