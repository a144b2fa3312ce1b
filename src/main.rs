//! packetd daemon - serves the connection core for one modem.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use zbus::zvariant::OwnedObjectPath;

use packetd::connection::dbus;
use packetd::connection::manager::{
    ConnectionManager, EventSender, ManagerChannel, ManagerConfig, ModemIdentity,
};
use packetd::connection::netif::IpCommand;
use packetd::connection::provisioning::ProvisionDb;
use packetd::connection::types::{AccessTechnology, BindingType, RegistrationStatus};
use packetd::modem::result::AtResultLine;
use packetd::modem::{AtChannel, AtContextDriver, AtGprsDriver, AtMux, Vendor};

#[derive(Parser, Debug)]
#[command(name = "packetd", about = "Cellular packet-data connection daemon")]
struct Args {
    /// Modem control device (AT command port).
    #[arg(long, default_value = "/dev/ttyUSB0")]
    device: PathBuf,

    /// Vendor dialect.
    #[arg(long, default_value = "generic")]
    vendor: String,

    /// Modem identifier used in the object path.
    #[arg(long, default_value = "modem0")]
    modem_id: String,

    /// Network interface carrying the packet data.
    #[arg(long)]
    interface: Option<String>,

    /// Base directory for per-IMSI settings.
    #[arg(long, default_value = "/var/lib/packetd")]
    storage_dir: PathBuf,

    /// Provisioning database file.
    #[arg(long)]
    provision_db: Option<PathBuf>,

    /// Subscriber identity; enables settings persistence.
    #[arg(long)]
    imsi: Option<String>,

    /// Mobile country code, for provisioning.
    #[arg(long, default_value = "")]
    mcc: String,

    /// Mobile network code, for provisioning.
    #[arg(long, default_value = "")]
    mnc: String,

    /// Service provider name, for provisioning.
    #[arg(long)]
    spn: Option<String>,

    /// Connect to the system bus instead of the session bus.
    #[arg(long)]
    system_bus: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    packetd::tracing_config::init()?;

    let args = Args::parse();

    let vendor = Vendor::from_name(&args.vendor)
        .ok_or_else(|| format!("unknown vendor dialect '{}'", args.vendor))?;

    let device = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&args.device)
        .await?;
    let channel: Arc<dyn AtChannel> = Arc::new(AtMux::new(device));

    let provision_db = match &args.provision_db {
        Some(path) => Arc::new(ProvisionDb::load(path)?),
        None => Arc::new(ProvisionDb::empty()),
    };

    let manager_channel = ManagerChannel::new();
    let events = manager_channel.events();

    // A failed probe means the packet service is unusable on this
    // modem; there is nothing to serve.
    let gprs_driver = AtGprsDriver::probe(channel.clone(), vendor, events.clone()).await?;
    let context_driver =
        AtContextDriver::new(channel.clone(), events.clone(), args.interface.clone());

    watch_netreg(channel.clone(), events.clone()).await;

    let manager = ConnectionManager::start(
        ManagerConfig {
            identity: ModemIdentity {
                imsi: args.imsi.clone(),
                mcc: args.mcc.clone(),
                mnc: args.mnc.clone(),
                spn: args.spn.clone(),
            },
            driver: gprs_driver,
            context_drivers: vec![(BindingType::Any, context_driver)],
            netif: Arc::new(IpCommand),
            provision_db,
            storage_dir: args.storage_dir.clone(),
        },
        manager_channel,
    );

    let connection = if args.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    }
    .name("org.packetd")?
    .build()
    .await?;

    let base_path = OwnedObjectPath::try_from(format!("/org/packetd/{}", args.modem_id))?;
    dbus::serve(&connection, base_path.clone(), manager.handle, manager.signals).await?;

    info!(path = %base_path, "connection manager running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    Ok(())
}

/// Minimal circuit-domain registration mirror.
///
/// The netreg collaborator proper lives elsewhere; all the connection
/// core needs from it is the registration status and the current access
/// technology, both of which `+CREG: 2` reports carry.
async fn watch_netreg(channel: Arc<dyn AtChannel>, events: EventSender) {
    let mut creg = channel.subscribe("+CREG:");

    let _ = channel.send("AT+CREG=2", "").await;

    // Seed from the current state before relying on unsolicited
    // updates.
    if let Ok(response) = channel.send("AT+CREG?", "+CREG:").await {
        if let Some(line) = response.lines.first() {
            if let Some(mut scan) = AtResultLine::new(line, "+CREG:") {
                scan.next_number();
                if let Some((status, technology)) = parse_netreg_fields(&mut scan) {
                    events.netreg_status_changed(status, technology);
                }
            }
        }
    }

    tokio::spawn(async move {
        while let Some(line) = creg.recv().await {
            let Some(mut scan) = AtResultLine::new(&line, "+CREG:") else {
                continue;
            };
            match parse_netreg_fields(&mut scan) {
                Some((status, technology)) => events.netreg_status_changed(status, technology),
                None => warn!(line, "unparseable registration report"),
            }
        }
    });
}

fn parse_netreg_fields(
    scan: &mut AtResultLine<'_>,
) -> Option<(RegistrationStatus, Option<AccessTechnology>)> {
    let status = RegistrationStatus::from_i32(scan.next_number()?);

    // Location fields, then the access technology.
    scan.skip_next();
    scan.skip_next();
    let technology = scan.next_number().and_then(AccessTechnology::from_i32);

    Some((status, technology))
}
