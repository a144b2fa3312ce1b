//! End-to-end exercise of the connection core against a scripted modem:
//! transport framing, dialect probe, attach sequence and context
//! activation, without a bus in between.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use zbus::zvariant::OwnedValue;

use packetd::connection::manager::{ConnectionManager, ManagerChannel, ManagerConfig, ModemIdentity};
use packetd::connection::netif::NetifOps;
use packetd::connection::provisioning::ProvisionDb;
use packetd::connection::types::{AccessTechnology, BindingType, RegistrationStatus};
use packetd::modem::{AtChannel, AtContextDriver, AtGprsDriver, AtMux, Vendor};

struct NullNetif;

#[async_trait]
impl NetifOps for NullNetif {
    async fn set_up(&self, _interface: &str, _up: bool) {}
    async fn set_ipv4_address(&self, _interface: &str, _address: Option<&str>) {}
    async fn add_host_route(&self, _interface: &str, _host: &str) {}
}

/// Answer commands from a fixed script; anything unscripted gets a
/// plain OK. Lines handed to the returned sender are emitted as
/// unsolicited events.
fn scripted_modem(
    io: tokio::io::DuplexStream,
    script: Vec<(&'static str, Vec<&'static str>)>,
) -> mpsc::UnboundedSender<&'static str> {
    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<&'static str>();

    tokio::spawn(async move {
        let script: HashMap<&str, Vec<&str>> = script.into_iter().collect();
        let (read_half, mut write_half) = tokio::io::split(io);
        let mut lines = BufReader::new(read_half).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    let command = line.trim();
                    if command.is_empty() {
                        continue;
                    }

                    if let Some(response) = script.get(command) {
                        for response_line in response {
                            let _ = write_half
                                .write_all(format!("{response_line}\r\n").as_bytes())
                                .await;
                        }
                    }
                    let _ = write_half.write_all(b"OK\r\n").await;
                }
                injected = inject_rx.recv() => {
                    let Some(line) = injected else { break };
                    let _ = write_half.write_all(format!("{line}\r\n").as_bytes()).await;
                }
            }
        }
    });

    inject_tx
}

async fn wait_for<F>(mut cond: F)
where
    F: AsyncFnMut() -> bool,
{
    for _ in 0..500 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn attach_and_activate_against_a_scripted_modem() {
    let (modem_end, daemon_end) = tokio::io::duplex(4096);

    let inject = scripted_modem(
        modem_end,
        vec![
            ("AT+CGDCONT=?", vec!["+CGDCONT: (1-16),\"IP\",,,,(0-2)"]),
            ("AT+CGREG=?", vec!["+CGREG: (0-2)"]),
            ("AT+CGEREP=?", vec!["+CGEREP: (0-2),(0-1)"]),
            ("AT+CGREG?", vec!["+CGREG: 2,1"]),
            ("AT+CGACT?", vec![]),
            (
                "AT+CGCONTRDP=1",
                vec!["+CGCONTRDP: 1,5,\"internet\",\"10.0.0.2.255.255.255.0\",\"10.0.0.1\",\"8.8.8.8\""],
            ),
        ],
    );

    let channel: Arc<dyn AtChannel> = Arc::new(AtMux::new(daemon_end));

    let manager_channel = ManagerChannel::new();
    let events = manager_channel.events();

    let gprs = AtGprsDriver::probe(channel.clone(), Vendor::Generic, events.clone())
        .await
        .expect("probe against a capable modem succeeds");
    let context_driver = AtContextDriver::new(channel.clone(), events.clone(), Some("wwan0".into()));

    let storage = tempfile::tempdir().unwrap();
    let manager = ConnectionManager::start(
        ManagerConfig {
            identity: ModemIdentity {
                imsi: Some("001010123456789".into()),
                mcc: "001".into(),
                mnc: "01".into(),
                spn: None,
            },
            driver: gprs,
            context_drivers: vec![(BindingType::Any, context_driver)],
            netif: Arc::new(NullNetif),
            provision_db: Arc::new(ProvisionDb::empty()),
            storage_dir: storage.path().to_path_buf(),
        },
        manager_channel,
    );
    let handle = manager.handle;

    // Registration arrives; the manager drives one attach transition.
    events.netreg_status_changed(RegistrationStatus::Registered, Some(AccessTechnology::Gsm));
    wait_for(async || {
        let props = handle.get_properties().await.unwrap();
        props["Attached"].downcast_ref::<bool>().unwrap()
    })
    .await;

    // Configure and activate the stub context created at startup.
    let id = handle.get_contexts().await.unwrap()[0].0;
    handle
        .set_context_property(id, "AccessPointName", string_value("internet"))
        .await
        .unwrap();
    handle
        .set_context_property(id, "Active", bool_value(true))
        .await
        .unwrap();

    let props = handle.context_properties(id).await.unwrap();
    assert!(props["Active"].downcast_ref::<bool>().unwrap());

    let settings: HashMap<String, OwnedValue> = props["Settings"].clone().try_into().unwrap();
    assert_eq!(settings["Interface"].downcast_ref::<&str>().unwrap(), "wwan0");
    assert_eq!(settings["Method"].downcast_ref::<&str>().unwrap(), "static");
    assert_eq!(settings["Address"].downcast_ref::<&str>().unwrap(), "10.0.0.2");
    assert_eq!(
        settings["Netmask"].downcast_ref::<&str>().unwrap(),
        "255.255.255.0"
    );

    // The network tears the context down behind our back.
    inject.send("+CGEV: NW PDN DEACT 1").unwrap();
    wait_for(async || {
        let props = handle.context_properties(id).await.unwrap();
        !props["Active"].downcast_ref::<bool>().unwrap()
    })
    .await;
}

fn string_value(value: &str) -> OwnedValue {
    zbus::zvariant::Value::from(value).try_to_owned().unwrap()
}

fn bool_value(value: bool) -> OwnedValue {
    zbus::zvariant::Value::from(value).try_to_owned().unwrap()
}
