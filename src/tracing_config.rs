//! Tracing initialization for the daemon binary.

use std::env;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for the daemon.
///
/// Uses the `RUST_LOG` environment variable if set, otherwise defaults
/// to "info". `PACKETD_LOG_FORMAT=json` switches to JSON output.
///
/// # Errors
/// Returns error if tracing subscriber initialization fails.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let format = env::var("PACKETD_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let registry = tracing_subscriber::registry().with(env_filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_target(true).with_level(true))
                .try_init()?;
        }
        _ => {
            registry
                .with(fmt::layer().with_target(true).with_level(true))
                .try_init()?;
        }
    }

    Ok(())
}
