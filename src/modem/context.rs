//! AT dialect context operations.
//!
//! Programs PDP contexts over the common dialect: `+CGDCONT` and
//! `+CGAUTH` to define them, `+CGACT` to (de)activate and `+CGCONTRDP`
//! to read the negotiated addressing back. Network-initiated
//! deactivations are picked up from `+CGEV` and reported upward.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::connection::driver::{
    ContextDriver, PrimaryConfig, RawIpConfig, RawIpv4Config, RawIpv6Config,
};
use crate::connection::error::DriverError;
use crate::connection::manager::EventSender;
use crate::connection::types::{AuthMethod, Protocol};

use super::result::AtResultLine;
use super::transport::AtChannel;

/// Context driver speaking the common AT dialect.
pub struct AtContextDriver {
    channel: Arc<dyn AtChannel>,
    events: EventSender,
    interface: Option<String>,
    active_cid: AtomicU32,
}

impl AtContextDriver {
    /// Create the driver and start watching for network-initiated
    /// deactivations.
    pub fn new(
        channel: Arc<dyn AtChannel>,
        events: EventSender,
        interface: Option<String>,
    ) -> Arc<Self> {
        let driver = Arc::new(Self {
            channel: channel.clone(),
            events,
            interface,
            active_cid: AtomicU32::new(0),
        });

        let monitor = driver.clone();
        let mut cgev = channel.subscribe("+CGEV:");
        tokio::spawn(async move {
            while let Some(line) = cgev.recv().await {
                monitor.handle_packet_event(&line);
            }
        });

        driver
    }

    fn handle_packet_event(&self, line: &str) {
        let Some(scan) = AtResultLine::new(line, "+CGEV:") else {
            return;
        };
        let event = scan.remainder();

        let deactivated = event
            .strip_prefix("NW PDN DEACT")
            .or_else(|| event.strip_prefix("ME PDN DEACT"))
            .and_then(|rest| rest.trim().parse::<u32>().ok())
            .or_else(|| {
                // "NW DEACT <PDP_type>, <PDP_addr>[, <cid>]"
                event
                    .strip_prefix("NW DEACT")?
                    .rsplit(',')
                    .next()?
                    .trim()
                    .parse::<u32>()
                    .ok()
            });

        let Some(cid) = deactivated else {
            return;
        };

        if self
            .active_cid
            .compare_exchange(cid, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!(cid, "network deactivated our context");
            self.events.context_deactivated(cid);
        }
    }

    async fn read_addressing(&self, cid: u32) -> Result<RawIpConfig, DriverError> {
        let response = self
            .channel
            .send(&format!("AT+CGCONTRDP={cid}"), "+CGCONTRDP:")
            .await
            .map_err(|_| DriverError::failure())?;
        response.check()?;

        let mut config = RawIpConfig::default();

        for line in &response.lines {
            let Some(mut scan) = AtResultLine::new(line, "+CGCONTRDP:") else {
                continue;
            };
            let Some(read_cid) = scan.next_number() else {
                continue;
            };
            if read_cid != cid as i32 {
                continue;
            }

            // Bearer id and APN.
            scan.next_number();
            scan.next_string();

            let Some(local) = scan.next_string() else {
                continue;
            };
            let gateway = scan.next_string().map(str::to_string);
            let mut dns = Vec::new();
            while let Some(server) = scan.next_string() {
                if let Some(RdpAddress::V4 { address, .. } | RdpAddress::V6 { address }) =
                    parse_rdp_address(server)
                {
                    dns.push(address);
                }
            }

            match parse_rdp_address(local) {
                Some(RdpAddress::V4 { address, netmask }) => {
                    config.ipv4 = Some(RawIpv4Config {
                        address: Some(address),
                        static_ip: true,
                        netmask,
                        prefix_length: None,
                        gateway: gateway
                            .as_deref()
                            .and_then(parse_rdp_address)
                            .and_then(RdpAddress::into_v4),
                        dns: dns.iter().filter(|d| d.contains('.')).cloned().collect(),
                    });
                }
                Some(RdpAddress::V6 { address }) => {
                    config.ipv6 = Some(RawIpv6Config {
                        address: Some(address),
                        prefix_length: None,
                        gateway: gateway
                            .as_deref()
                            .and_then(parse_rdp_address)
                            .and_then(RdpAddress::into_v6),
                        dns: dns.iter().filter(|d| d.contains(':')).cloned().collect(),
                    });
                }
                None => {}
            }
        }

        Ok(config)
    }
}

enum RdpAddress {
    V4 {
        address: String,
        netmask: Option<String>,
    },
    V6 {
        address: String,
    },
}

impl RdpAddress {
    fn into_v4(self) -> Option<String> {
        match self {
            Self::V4 { address, .. } => Some(address),
            Self::V6 { .. } => None,
        }
    }

    fn into_v6(self) -> Option<String> {
        match self {
            Self::V6 { address } => Some(address),
            Self::V4 { .. } => None,
        }
    }
}

/// Decode the dotted-decimal addressing of `+CGCONTRDP`: 4 octets for
/// a bare IPv4 address, 8 for address plus subnet mask, 16 or 32 for
/// their IPv6 counterparts.
fn parse_rdp_address(field: &str) -> Option<RdpAddress> {
    let octets: Option<Vec<u8>> = field.split('.').map(|part| part.parse().ok()).collect();
    let octets = octets?;

    match octets.len() {
        4 => Some(RdpAddress::V4 {
            address: field.to_string(),
            netmask: None,
        }),
        8 => {
            let address = octets[..4]
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(".");
            let netmask = octets[4..]
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(".");
            Some(RdpAddress::V4 {
                address,
                netmask: Some(netmask),
            })
        }
        16 | 32 => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&octets[..16]);
            Some(RdpAddress::V6 {
                address: std::net::Ipv6Addr::from(bytes).to_string(),
            })
        }
        _ => None,
    }
}

fn pdp_type(proto: Protocol) -> &'static str {
    match proto {
        Protocol::Ip => "IP",
        Protocol::Ipv6 => "IPV6",
        Protocol::Dual => "IPV4V6",
    }
}

#[async_trait]
impl ContextDriver for AtContextDriver {
    fn interface(&self) -> Option<String> {
        self.interface.clone()
    }

    async fn activate_primary(&self, config: &PrimaryConfig) -> Result<RawIpConfig, DriverError> {
        let define = format!(
            "AT+CGDCONT={},\"{}\",\"{}\"",
            config.cid,
            pdp_type(config.proto),
            config.apn
        );
        self.channel
            .send(&define, "")
            .await
            .map_err(|_| DriverError::failure())?
            .check()?;

        if config.auth_method != AuthMethod::None && !config.username.is_empty() {
            let protocol = match config.auth_method {
                AuthMethod::Pap => 1,
                _ => 2,
            };
            let auth = format!(
                "AT+CGAUTH={},{},\"{}\",\"{}\"",
                config.cid, protocol, config.username, config.password
            );
            self.channel
                .send(&auth, "")
                .await
                .map_err(|_| DriverError::failure())?
                .check()?;
        }

        self.channel
            .send(&format!("AT+CGACT=1,{}", config.cid), "")
            .await
            .map_err(|_| DriverError::failure())?
            .check()?;

        // Addressing read-back is best effort; activation stands even
        // when the modem cannot report it.
        let addressing = self.read_addressing(config.cid).await.unwrap_or_default();

        self.active_cid.store(config.cid, Ordering::SeqCst);
        Ok(addressing)
    }

    async fn deactivate_primary(&self, cid: u32) -> Result<(), DriverError> {
        self.channel
            .send(&format!("AT+CGACT=0,{cid}"), "")
            .await
            .map_err(|_| DriverError::failure())?
            .check()?;

        let _ = self
            .active_cid
            .compare_exchange(cid, 0, Ordering::SeqCst, Ordering::SeqCst);
        Ok(())
    }

    fn supports_read_settings(&self) -> bool {
        true
    }

    async fn read_settings(&self, cid: u32) -> Result<RawIpConfig, DriverError> {
        let addressing = self.read_addressing(cid).await?;
        self.active_cid.store(cid, Ordering::SeqCst);
        Ok(addressing)
    }

    fn supports_detach_shutdown(&self) -> bool {
        true
    }

    async fn detach_shutdown(&self, cid: u32) {
        let _ = self.channel.send(&format!("AT+CGACT=0,{cid}"), "").await;
        let _ = self
            .active_cid
            .compare_exchange(cid, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}
