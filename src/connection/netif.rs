//! Network-interface side effects of context transitions.
//!
//! Activation brings the interface up; MMS contexts additionally get the
//! reported IPv4 address assigned and a host route installed towards the
//! message proxy. Failures are logged and otherwise ignored, matching
//! the best-effort nature of these side effects.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

/// Interface operations driven by the connection manager.
#[async_trait]
pub trait NetifOps: Send + Sync {
    /// Bring an interface up or down.
    async fn set_up(&self, interface: &str, up: bool);

    /// Assign an IPv4 address, or flush addressing when `None`.
    async fn set_ipv4_address(&self, interface: &str, address: Option<&str>);

    /// Install a host route through an interface.
    async fn add_host_route(&self, interface: &str, host: &str);
}

/// Production implementation shelling out to `ip`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpCommand;

impl IpCommand {
    async fn run(args: &[&str]) {
        match Command::new("ip").args(args).output().await {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                warn!(
                    ?args,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "ip command failed"
                );
            }
            Err(err) => warn!(?args, %err, "failed to spawn ip"),
        }
    }
}

#[async_trait]
impl NetifOps for IpCommand {
    async fn set_up(&self, interface: &str, up: bool) {
        let state = if up { "up" } else { "down" };
        Self::run(&["link", "set", "dev", interface, state]).await;
    }

    async fn set_ipv4_address(&self, interface: &str, address: Option<&str>) {
        Self::run(&["addr", "flush", "dev", interface]).await;

        if let Some(address) = address {
            let cidr = format!("{address}/32");
            Self::run(&["addr", "add", &cidr, "dev", interface]).await;
        }
    }

    async fn add_host_route(&self, interface: &str, host: &str) {
        Self::run(&["route", "add", host, "dev", interface]).await;
    }
}
