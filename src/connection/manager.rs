//! Attach state machine and context arbitration.
//!
//! One manager task per modem owns every piece of mutable core state.
//! The bus layer and the modem dialect layer reach it exclusively
//! through the input channel; replies travel back over oneshot senders
//! and property changes over the signal channel. All state transitions
//! happen inside the task, so no transition is ever observed half-done.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zbus::zvariant::OwnedValue;

use super::binding::ContextBinding;
use super::context::{owned, PrimaryContext, PropertyChange};
use super::driver::{ContextDriver, GprsDriver, PrimaryConfig, RawIpConfig};
use super::error::{DriverError, Error};
use super::idset::IdSet;
use super::netif::NetifOps;
use super::persistence::{parse_group_id, ContextRecord, SettingsStore, SETTINGS_GROUP};
use super::provisioning::{ProvisionDb, ProvisionEntry};
use super::types::{
    AccessTechnology, Bearer, BindingType, ContextType, RegistrationStatus, SuspendCause,
    MAX_APN_LENGTH, MAX_CONTEXTS, MAX_CONTEXT_NAME_LENGTH, MAX_CREDENTIAL_LENGTH,
    MAX_MESSAGE_CENTER_LENGTH, MAX_MESSAGE_PROXY_LENGTH,
};
use super::validation::{is_valid_apn, ProxyAddress};

/// Debounce applied to ambiguous suspend causes.
const SUSPEND_TIMEOUT: Duration = Duration::from_secs(8);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u32 {
        /// A `set_attached` transition is in flight.
        const ATTACHING = 1 << 0;
        /// Inputs changed during the transition; re-evaluate afterwards.
        const RECHECK = 1 << 1;
        /// Attached=true is deferred until active contexts are released.
        const ATTACHED_UPDATE = 1 << 2;
    }
}

/// SIM-derived identity of the modem this manager serves.
#[derive(Debug, Clone, Default)]
pub struct ModemIdentity {
    /// Subscriber identity; without one no settings are persisted.
    pub imsi: Option<String>,
    /// Mobile country code, for provisioning.
    pub mcc: String,
    /// Mobile network code, for provisioning.
    pub mnc: String,
    /// Service provider name, for provisioning.
    pub spn: Option<String>,
}

/// Everything needed to start a manager.
pub struct ManagerConfig {
    /// SIM identity.
    pub identity: ModemIdentity,
    /// Packet-service back-end.
    pub driver: Arc<dyn GprsDriver>,
    /// Context back-ends with the context type each accepts.
    pub context_drivers: Vec<(BindingType, Arc<dyn ContextDriver>)>,
    /// Interface side-effect implementation.
    pub netif: Arc<dyn NetifOps>,
    /// Provisioning database.
    pub provision_db: Arc<ProvisionDb>,
    /// Base directory of the per-IMSI settings stores.
    pub storage_dir: PathBuf,
}

/// Notifications fed into the manager by the dialect layer, the netreg
/// collaborator and internal timers.
#[derive(Debug)]
pub enum ManagerEvent {
    /// Packet registration status reported by the driver.
    StatusNotify(RegistrationStatus),
    /// Circuit-domain registration mirrored from the netreg collaborator.
    NetregStatusChanged {
        /// New registration status.
        status: RegistrationStatus,
        /// Current access technology, when known.
        technology: Option<AccessTechnology>,
    },
    /// The netreg collaborator went away.
    NetregRemoved,
    /// The network or modem detached the packet service.
    DetachedNotify,
    /// Bearer change reported by a vendor notification.
    BearerNotify(Bearer),
    /// Packet service suspension.
    SuspendNotify(SuspendCause),
    /// Packet service resumption.
    ResumeNotify,
    /// The modem reports a context as already activated.
    CidActivated {
        /// Modem context id.
        cid: u32,
        /// APN the context is activated for.
        apn: String,
    },
    /// The modem reports a context as deactivated.
    ContextDeactivated {
        /// Modem context id.
        cid: u32,
    },
    /// Supported context-id range learned at probe.
    SetCidRange {
        /// Lowest usable cid.
        min: u32,
        /// Highest usable cid.
        max: u32,
    },
    /// The modem (or its transport) is gone.
    ModemLost,
    /// Completion of a `set_attached` driver call.
    AttachComplete {
        /// Driver outcome.
        result: Result<(), DriverError>,
    },
    /// Completion of the follow-up `attached_status` query.
    AttachStatusComplete {
        /// Driver outcome.
        result: Result<RegistrationStatus, DriverError>,
    },
    /// Completion of a context activation.
    ActivateComplete {
        /// Context path id.
        id: u32,
        /// Driver outcome.
        result: Result<RawIpConfig, DriverError>,
    },
    /// Completion of a context deactivation.
    DeactivateComplete {
        /// Context path id.
        id: u32,
        /// Why the deactivation was issued.
        purpose: DeactivatePurpose,
        /// Driver outcome.
        result: Result<(), DriverError>,
    },
    /// Completion of an auto-context settings read.
    ReadSettingsComplete {
        /// Context path id.
        id: u32,
        /// Driver outcome.
        result: Result<RawIpConfig, DriverError>,
    },
    /// The suspend debounce elapsed.
    SuspendTimeout {
        /// Timer generation, to discard stale timers.
        generation: u64,
    },
}

/// Why a deactivation was issued, deciding what happens on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivatePurpose {
    /// User toggled `Active` off.
    UserToggle,
    /// `RemoveContext` on an active context.
    Remove,
    /// One step of `DeactivateAll`.
    DeactivateAll,
}

/// Bus requests handled by the manager.
enum Command {
    GetProperties {
        reply: oneshot::Sender<HashMap<String, OwnedValue>>,
    },
    SetProperty {
        name: String,
        value: OwnedValue,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    AddContext {
        type_str: String,
        reply: oneshot::Sender<Result<u32, Error>>,
    },
    RemoveContext {
        id: u32,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    DeactivateAll {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    GetContexts {
        reply: oneshot::Sender<Vec<(u32, HashMap<String, OwnedValue>)>>,
    },
    ResetContexts {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    GetContextProperties {
        id: u32,
        reply: oneshot::Sender<Result<HashMap<String, OwnedValue>, Error>>,
    },
    SetContextProperty {
        id: u32,
        name: String,
        value: OwnedValue,
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

/// One message on the manager's input channel.
pub struct Input(InputKind);

#[cfg(test)]
impl Input {
    pub(crate) fn into_event(self) -> Option<ManagerEvent> {
        match self.0 {
            InputKind::Event(event) => Some(event),
            InputKind::Command(_) => None,
        }
    }
}

enum InputKind {
    Command(Command),
    Event(ManagerEvent),
}

/// Property changes and context lifecycle notifications, in transition
/// order.
#[derive(Debug)]
pub enum BusSignal {
    /// Manager-level `PropertyChanged`.
    ManagerProperty {
        /// Property name.
        name: &'static str,
        /// New value.
        value: OwnedValue,
    },
    /// Context-level `PropertyChanged`.
    ContextProperty {
        /// Context path id.
        id: u32,
        /// Property name.
        name: &'static str,
        /// New value.
        value: OwnedValue,
    },
    /// A context came into existence.
    ContextAdded {
        /// Context path id.
        id: u32,
        /// Full property dictionary.
        properties: HashMap<String, OwnedValue>,
        /// Whether `ContextAdded` is emitted on the bus; contexts bound
        /// by modem-initiated activation are served without a signal.
        announce: bool,
    },
    /// A context was removed.
    ContextRemoved {
        /// Context path id.
        id: u32,
    },
}

/// Input channel endpoints, created before the dialect layer so probe
/// results are buffered until the manager runs.
pub struct ManagerChannel {
    tx: mpsc::UnboundedSender<Input>,
    rx: mpsc::UnboundedReceiver<Input>,
}

impl ManagerChannel {
    /// Create the channel.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Event-side handle for drivers and collaborators.
    pub fn events(&self) -> EventSender {
        EventSender(self.tx.clone())
    }
}

impl Default for ManagerChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl ManagerChannel {
    pub(crate) fn split(self) -> (EventSender, mpsc::UnboundedReceiver<Input>) {
        (EventSender(self.tx), self.rx)
    }
}

/// Handle used by drivers and collaborators to notify the manager.
#[derive(Clone)]
pub struct EventSender(mpsc::UnboundedSender<Input>);

impl EventSender {
    fn send(&self, event: ManagerEvent) {
        let _ = self.0.send(Input(InputKind::Event(event)));
    }

    /// Report a packet registration status.
    pub fn status_notify(&self, status: RegistrationStatus) {
        self.send(ManagerEvent::StatusNotify(status));
    }

    /// Mirror a circuit-domain registration change.
    pub fn netreg_status_changed(
        &self,
        status: RegistrationStatus,
        technology: Option<AccessTechnology>,
    ) {
        self.send(ManagerEvent::NetregStatusChanged { status, technology });
    }

    /// Report the netreg collaborator as gone.
    pub fn netreg_removed(&self) {
        self.send(ManagerEvent::NetregRemoved);
    }

    /// Report a network or mobile detach.
    pub fn detached_notify(&self) {
        self.send(ManagerEvent::DetachedNotify);
    }

    /// Report a bearer change.
    pub fn bearer_notify(&self, bearer: Bearer) {
        self.send(ManagerEvent::BearerNotify(bearer));
    }

    /// Report a packet service suspension.
    pub fn suspend_notify(&self, cause: SuspendCause) {
        self.send(ManagerEvent::SuspendNotify(cause));
    }

    /// Report a packet service resumption.
    pub fn resume_notify(&self) {
        self.send(ManagerEvent::ResumeNotify);
    }

    /// Report a modem-initiated context activation.
    pub fn cid_activated(&self, cid: u32, apn: &str) {
        self.send(ManagerEvent::CidActivated {
            cid,
            apn: apn.to_string(),
        });
    }

    /// Report a modem-initiated context deactivation.
    pub fn context_deactivated(&self, cid: u32) {
        self.send(ManagerEvent::ContextDeactivated { cid });
    }

    /// Install the context-id range learned from the modem.
    pub fn set_cid_range(&self, min: u32, max: u32) {
        self.send(ManagerEvent::SetCidRange { min, max });
    }

    /// Report the modem as gone.
    pub fn modem_lost(&self) {
        self.send(ManagerEvent::ModemLost);
    }
}

/// Request-side handle served to the bus layer.
#[derive(Clone)]
pub struct ConnectionManager {
    input: mpsc::UnboundedSender<Input>,
}

/// A started manager: the request handle, the signal stream and the
/// task driving it.
pub struct Manager {
    /// Request-side handle.
    pub handle: ConnectionManager,
    /// Property-change and lifecycle signal stream.
    pub signals: mpsc::UnboundedReceiver<BusSignal>,
    /// The manager task.
    pub task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Start a manager: load settings, provision if needed and spawn the
    /// state task.
    pub fn start(config: ManagerConfig, channel: ManagerChannel) -> Manager {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let mut state = ManagerState::new(config, channel.tx.clone(), signal_tx);
        state.load();

        // Find any context activated during modem init.
        if state.driver.supports_list_active_contexts() {
            let driver = state.driver.clone();
            tokio::spawn(async move {
                if let Err(err) = driver.list_active_contexts().await {
                    debug!(?err, "active context scan failed");
                }
            });
        }

        let handle = ConnectionManager {
            input: channel.tx.clone(),
        };
        let task = tokio::spawn(state.run(channel.rx));

        Manager {
            handle,
            signals: signal_rx,
            task,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, Error>>) -> Command,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.input
            .send(Input(InputKind::Command(make(tx))))
            .map_err(|_| Error::Failed)?;
        rx.await.map_err(|_| Error::Failed)?
    }

    /// Manager `GetProperties`.
    pub async fn get_properties(&self) -> Result<HashMap<String, OwnedValue>, Error> {
        let (tx, rx) = oneshot::channel();
        self.input
            .send(Input(InputKind::Command(Command::GetProperties { reply: tx })))
            .map_err(|_| Error::Failed)?;
        rx.await.map_err(|_| Error::Failed)
    }

    /// Manager `SetProperty`.
    pub async fn set_property(&self, name: &str, value: OwnedValue) -> Result<(), Error> {
        self.request(|reply| Command::SetProperty {
            name: name.to_string(),
            value,
            reply,
        })
        .await
    }

    /// Manager `AddContext`; returns the new context id.
    pub async fn add_context(&self, type_str: &str) -> Result<u32, Error> {
        self.request(|reply| Command::AddContext {
            type_str: type_str.to_string(),
            reply,
        })
        .await
    }

    /// Manager `RemoveContext`.
    pub async fn remove_context(&self, id: u32) -> Result<(), Error> {
        self.request(|reply| Command::RemoveContext { id, reply }).await
    }

    /// Manager `DeactivateAll`.
    pub async fn deactivate_all(&self) -> Result<(), Error> {
        self.request(|reply| Command::DeactivateAll { reply }).await
    }

    /// Manager `GetContexts`.
    pub async fn get_contexts(&self) -> Result<Vec<(u32, HashMap<String, OwnedValue>)>, Error> {
        let (tx, rx) = oneshot::channel();
        self.input
            .send(Input(InputKind::Command(Command::GetContexts { reply: tx })))
            .map_err(|_| Error::Failed)?;
        rx.await.map_err(|_| Error::Failed)
    }

    /// Manager `ResetContexts`.
    pub async fn reset_contexts(&self) -> Result<(), Error> {
        self.request(|reply| Command::ResetContexts { reply }).await
    }

    /// Context `GetProperties`.
    pub async fn context_properties(&self, id: u32) -> Result<HashMap<String, OwnedValue>, Error> {
        self.request(|reply| Command::GetContextProperties { id, reply })
            .await
    }

    /// Context `SetProperty`.
    pub async fn set_context_property(
        &self,
        id: u32,
        name: &str,
        value: OwnedValue,
    ) -> Result<(), Error> {
        self.request(|reply| Command::SetContextProperty {
            id,
            name: name.to_string(),
            value,
            reply,
        })
        .await
    }
}

struct PendingManagerOp {
    kind: DeactivatePurpose,
    reply: oneshot::Sender<Result<(), Error>>,
}

struct ManagerState {
    identity: ModemIdentity,
    attached: bool,
    driver_attached: bool,
    roaming_allowed: bool,
    powered: bool,
    suspended: bool,
    status: RegistrationStatus,
    netreg_status: Option<RegistrationStatus>,
    technology: Option<AccessTechnology>,
    bearer: Option<Bearer>,
    flags: Flags,
    used_pids: IdSet,
    last_context_id: u32,
    used_cids: Option<IdSet>,
    contexts: Vec<PrimaryContext>,
    bindings: Vec<ContextBinding>,
    driver: Arc<dyn GprsDriver>,
    netif: Arc<dyn NetifOps>,
    store: Option<SettingsStore>,
    provision_db: Arc<ProvisionDb>,
    storage_dir: PathBuf,
    pending: Option<PendingManagerOp>,
    suspend_generation: u64,
    suspend_timer_armed: bool,
    input_tx: mpsc::UnboundedSender<Input>,
    signal_tx: mpsc::UnboundedSender<BusSignal>,
}

impl ManagerState {
    fn new(
        config: ManagerConfig,
        input_tx: mpsc::UnboundedSender<Input>,
        signal_tx: mpsc::UnboundedSender<BusSignal>,
    ) -> Self {
        let bindings = config
            .context_drivers
            .into_iter()
            .map(|(binding_type, driver)| ContextBinding::new(binding_type, driver))
            .collect();

        Self {
            identity: config.identity,
            attached: false,
            driver_attached: false,
            roaming_allowed: false,
            powered: true,
            suspended: false,
            status: RegistrationStatus::Unknown,
            netreg_status: None,
            technology: None,
            bearer: None,
            flags: Flags::empty(),
            used_pids: IdSet::new(1, MAX_CONTEXTS),
            last_context_id: 0,
            used_cids: None,
            contexts: Vec::new(),
            bindings,
            driver: config.driver,
            netif: config.netif,
            store: None,
            provision_db: config.provision_db,
            storage_dir: config.storage_dir,
            pending: None,
            suspend_generation: 0,
            suspend_timer_armed: false,
            input_tx,
            signal_tx,
        }
    }

    async fn run(mut self, mut input: mpsc::UnboundedReceiver<Input>) {
        while let Some(Input(kind)) = input.recv().await {
            match kind {
                InputKind::Command(command) => self.handle_command(command).await,
                InputKind::Event(event) => self.handle_event(event).await,
            }
        }
    }

    /// Load settings and provision the initial context set.
    fn load(&mut self) {
        self.load_settings();

        if self.contexts.is_empty() {
            self.provision_contexts();
        }

        // Automatic provisioning failed; leave an empty stub the user
        // can fill in.
        if self.contexts.is_empty() {
            self.add_context(None, ContextType::Internet);
        }
    }

    fn load_settings(&mut self) {
        let Some(imsi) = self.identity.imsi.clone() else {
            return;
        };

        let mut store = SettingsStore::open(&self.storage_dir, &imsi);

        match store.get_bool(SETTINGS_GROUP, "Powered") {
            Some(powered) => self.powered = powered,
            None => {
                self.powered = true;
                store.set_bool(SETTINGS_GROUP, "Powered", true);
            }
        }

        match store.get_bool(SETTINGS_GROUP, "RoamingAllowed") {
            Some(allowed) => self.roaming_allowed = allowed,
            None => {
                self.roaming_allowed = false;
                store.set_bool(SETTINGS_GROUP, "RoamingAllowed", false);
            }
        }

        let mut migrated = false;

        for group in store.group_names() {
            if group == SETTINGS_GROUP {
                continue;
            }

            let loaded = parse_group_id(&group).and_then(|(id, legacy)| {
                if self.used_pids.contains(id) {
                    return None;
                }
                let record = ContextRecord::load(id, store.group(&group)?)?;
                Some((record, legacy))
            });

            match loaded {
                Some((record, legacy)) => {
                    if legacy {
                        record.store(&mut store);
                        store.remove_group(&group);
                        migrated = true;
                    }
                    self.used_pids.put(record.id);
                    self.last_context_id = record.id;
                    self.contexts.push(PrimaryContext::from_record(record));
                }
                None => store.remove_group(&group),
            }
        }

        if migrated {
            if let Err(err) = store.sync() {
                warn!(%err, "failed to sync migrated settings");
            }
        }

        self.store = Some(store);
    }

    fn signal(&self, signal: BusSignal) {
        let _ = self.signal_tx.send(signal);
    }

    fn sync_store(&mut self) {
        if let Some(store) = &self.store {
            if let Err(err) = store.sync() {
                warn!(%err, "failed to sync settings store");
            }
        }
    }

    fn persist_context(&mut self, index: usize) {
        let record = self.contexts[index].to_record();
        if let Some(store) = &mut self.store {
            record.store(store);
        }
        self.sync_store();
    }

    fn context_index(&self, id: u32) -> Option<usize> {
        self.contexts.iter().position(|ctx| ctx.id == id)
    }

    fn context_index_by_cid(&self, cid: u32) -> Option<usize> {
        self.contexts.iter().position(|ctx| ctx.cid == cid)
    }

    fn context_properties(&self, index: usize) -> HashMap<String, OwnedValue> {
        let ctx = &self.contexts[index];
        let binding = ctx.binding.map(|b| &self.bindings[b]);
        ctx.properties(
            binding.map(|b| &b.settings),
            binding.and_then(|b| b.interface.as_deref()),
        )
    }

    fn have_active_contexts(&self) -> bool {
        self.contexts.iter().any(|ctx| ctx.active)
    }

    fn have_detachable_active_contexts(&self) -> bool {
        self.contexts.iter().any(|ctx| {
            ctx.active
                && ctx
                    .binding
                    .is_some_and(|b| self.bindings[b].driver.supports_detach_shutdown())
        })
    }

    fn have_read_settings(&self) -> bool {
        self.bindings
            .iter()
            .any(|binding| binding.driver.supports_read_settings())
    }

    /// On LTE the attach state mirrors context activation instead of the
    /// classic attach sequence.
    fn on_lte(&self) -> bool {
        self.technology == Some(AccessTechnology::Eutran) && self.have_read_settings()
    }

    fn set_attached_property(&mut self, attached: bool) {
        if self.attached == attached {
            return;
        }

        self.attached = attached;
        self.signal(BusSignal::ManagerProperty {
            name: "Attached",
            value: owned(attached),
        });
    }

    async fn attached_update(&mut self) {
        let attached = if self.on_lte() {
            // On LTE the gprs status may well be unknown while a context
            // is active; that must not detach us.
            self.have_active_contexts()
        } else {
            self.driver_attached && self.status.is_registered()
        };

        if attached == self.attached {
            return;
        }

        // An active context may still hold a data session at driver
        // level; it has to be released before Attached=true can be
        // signalled. Skipped on LTE where activation is what attaches.
        if self.have_detachable_active_contexts() && !self.on_lte() {
            self.detach_active_contexts().await;

            if attached {
                // A context can activate between a detach event and the
                // following attach; close it to avoid surprises.
                self.flags |= Flags::ATTACHED_UPDATE;
                return;
            }
        }

        if !attached {
            self.bearer = None;
        }

        self.set_attached_property(attached);
    }

    async fn detach_active_contexts(&mut self) {
        for index in 0..self.contexts.len() {
            if !self.contexts[index].active {
                continue;
            }

            // This context is already being messed with.
            if self.contexts[index].pending.is_some() {
                continue;
            }

            let Some(b) = self.contexts[index].binding else {
                continue;
            };

            if self.bindings[b].driver.supports_detach_shutdown() {
                let driver = self.bindings[b].driver.clone();
                let cid = self.contexts[index].cid;
                tokio::spawn(async move { driver.detach_shutdown(cid).await });
            }

            self.reset_context_settings(index).await;
            self.release_context(index);
            self.signal_context_active(index);
        }
    }

    async fn netreg_update(&mut self) {
        // No valid netreg status yet; nothing to decide until the first
        // observation arrives.
        let Some(netreg_status) = self.netreg_status else {
            return;
        };

        let mut want = netreg_status.is_home()
            || (self.roaming_allowed && netreg_status.is_roaming());
        want = want && self.powered;

        debug!(want, driver_attached = self.driver_attached, "attach re-evaluation");

        if self.on_lte() {
            // Attached follows context activation on LTE; the context
            // may even have been registered before this netreg update.
            self.attached_update().await;
            return;
        }

        if self.driver_attached == want {
            return;
        }

        if self.flags.contains(Flags::ATTACHING) {
            self.flags |= Flags::RECHECK;
            return;
        }

        self.flags |= Flags::ATTACHING;
        self.driver_attached = want;
        self.spawn_set_attached(want);
    }

    fn spawn_set_attached(&self, attached: bool) {
        let driver = self.driver.clone();
        let tx = self.input_tx.clone();
        tokio::spawn(async move {
            let result = driver.set_attached(attached).await;
            let _ = tx.send(Input(InputKind::Event(ManagerEvent::AttachComplete { result })));
        });
    }

    async fn handle_attach_complete(&mut self, result: Result<(), DriverError>) {
        if result.is_err() {
            self.driver_attached = !self.driver_attached;
        }

        if self.driver.supports_attached_status() {
            let driver = self.driver.clone();
            let tx = self.input_tx.clone();
            tokio::spawn(async move {
                let result = driver.attached_status().await;
                let _ = tx.send(Input(InputKind::Event(ManagerEvent::AttachStatusComplete {
                    result,
                })));
            });
        } else {
            // Treated as a synthetic failure, leaving the public state
            // to be recomputed from what we already know.
            self.handle_attach_status(Err(DriverError::failure())).await;
        }
    }

    async fn handle_attach_status(&mut self, result: Result<RegistrationStatus, DriverError>) {
        self.flags.remove(Flags::ATTACHING);

        match result {
            Ok(status) => self.status_notify(status).await,
            Err(_) => self.attached_update().await,
        }

        if self.flags.contains(Flags::RECHECK) {
            self.flags.remove(Flags::RECHECK);
            self.netreg_update().await;
        }
    }

    async fn status_notify(&mut self, status: RegistrationStatus) {
        debug!(?status, "packet registration status");

        self.status = status;

        // Already attaching or detaching; the completion path will take
        // the appropriate action for the status it finds.
        if self.flags.contains(Flags::ATTACHING) {
            return;
        }

        if !status.is_registered() {
            self.detached_notify().await;
            return;
        }

        let detach = !self.powered
            || (!self.roaming_allowed && status == RegistrationStatus::Roaming);

        if detach {
            self.flags |= Flags::ATTACHING;
            self.spawn_set_attached(false);
            return;
        }

        self.driver_attached = true;
        self.attached_update().await;
    }

    async fn detached_notify(&mut self) {
        // If an attach is in flight let it finish; it will land on the
        // correct status. Fiddling with driver_attached here would leave
        // the wrong state behind when the attach fails and inverts it.
        if self.flags.contains(Flags::ATTACHING) {
            return;
        }

        self.driver_attached = false;
        self.attached_update().await;
    }

    fn bearer_notify(&mut self, bearer: Bearer) {
        if self.bearer == Some(bearer) {
            return;
        }

        self.bearer = Some(bearer);
        self.signal(BusSignal::ManagerProperty {
            name: "Bearer",
            value: owned(bearer.as_str()),
        });
    }

    fn cancel_suspend_timer(&mut self) {
        self.suspend_generation += 1;
        self.suspend_timer_armed = false;
    }

    fn update_suspended(&mut self, suspended: bool) {
        self.cancel_suspend_timer();

        if self.suspended == suspended {
            return;
        }

        debug!(suspended, "packet service suspension change");
        self.suspended = suspended;

        if self.attached {
            self.signal(BusSignal::ManagerProperty {
                name: "Suspended",
                value: owned(suspended),
            });
        }
    }

    fn suspend_notify(&mut self, cause: SuspendCause) {
        if cause.is_definite() {
            self.update_suspended(true);
            return;
        }

        // Ambiguous causes frequently resolve by themselves; only
        // surface them when they persist.
        self.suspend_generation += 1;
        self.suspend_timer_armed = true;

        let generation = self.suspend_generation;
        let tx = self.input_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SUSPEND_TIMEOUT).await;
            let _ = tx.send(Input(InputKind::Event(ManagerEvent::SuspendTimeout {
                generation,
            })));
        });
    }

    fn signal_context_active(&self, index: usize) {
        let ctx = &self.contexts[index];
        self.signal(BusSignal::ContextProperty {
            id: ctx.id,
            name: "Active",
            value: owned(ctx.active),
        });
    }

    fn signal_context_settings(&self, index: usize, ipv4: bool, ipv6: bool) {
        let ctx = &self.contexts[index];
        let binding = ctx.binding.map(|b| &self.bindings[b]);
        let settings = binding.map(|b| &b.settings);
        let interface = binding.and_then(|b| b.interface.as_deref());

        if ipv4 {
            self.signal(BusSignal::ContextProperty {
                id: ctx.id,
                name: "Settings",
                value: owned(super::context::ipv4_settings_dict(settings, interface)),
            });
        }

        if ipv6 {
            self.signal(BusSignal::ContextProperty {
                id: ctx.id,
                name: "IPv6.Settings",
                value: owned(super::context::ipv6_settings_dict(settings, interface)),
            });
        }
    }

    /// Allocate a cid and an available binding for a context about to
    /// activate. `use_cid` of zero picks the minimum unused cid.
    fn assign_context(&mut self, index: usize, use_cid: u32) -> bool {
        let Some(cids) = self.used_cids.as_mut() else {
            return false;
        };

        let cid = if use_cid != 0 {
            use_cid
        } else {
            match cids.find_unused_min() {
                Some(cid) => cid,
                None => return false,
            }
        };

        if cid > cids.max() {
            return false;
        }

        let ctx_type = self.contexts[index].ctx_type;
        let Some(b) = self
            .bindings
            .iter()
            .position(|binding| !binding.inuse && binding.binding_type.accepts(ctx_type))
        else {
            return false;
        };

        cids.put(cid);

        let ctx = &mut self.contexts[index];
        ctx.cid = cid;
        ctx.binding = Some(b);

        let binding = &mut self.bindings[b];
        binding.inuse = true;
        binding.settings.ipv4 = ctx.proto.wants_ipv4().then(Default::default);
        binding.settings.ipv6 = ctx.proto.wants_ipv6().then(Default::default);

        true
    }

    fn release_context(&mut self, index: usize) {
        let ctx = &mut self.contexts[index];

        if let Some(cids) = self.used_cids.as_mut() {
            cids.take(ctx.cid);
        }
        ctx.cid = 0;

        if let Some(b) = ctx.binding.take() {
            self.bindings[b].inuse = false;
        }

        ctx.active = false;
    }

    /// Undo the interface side effects and clear the binding settings,
    /// signalling the now-empty dictionaries.
    async fn reset_context_settings(&mut self, index: usize) {
        let Some(b) = self.contexts[index].binding else {
            return;
        };

        let interface = self.bindings[b].interface.clone();
        let had_ipv4 = self.bindings[b].settings.ipv4.is_some();
        let had_ipv6 = self.bindings[b].settings.ipv6.is_some();

        self.bindings[b].settings.clear();
        self.signal_context_settings(index, had_ipv4, had_ipv6);

        let is_mms = self.contexts[index].ctx_type == ContextType::Mms;
        if is_mms {
            self.contexts[index].proxy = None;
        }

        if let Some(interface) = interface {
            if is_mms {
                self.netif.set_ipv4_address(&interface, None).await;
            }
            self.netif.set_up(&interface, false).await;
        }
    }

    fn spawn_activate(&self, index: usize, b: usize) {
        let ctx = &self.contexts[index];
        let config = PrimaryConfig {
            cid: ctx.cid,
            apn: ctx.apn.clone(),
            username: ctx.username.clone(),
            password: ctx.password.clone(),
            proto: ctx.proto,
            auth_method: ctx.auth_method,
        };
        let id = ctx.id;
        let driver = self.bindings[b].driver.clone();
        let tx = self.input_tx.clone();

        tokio::spawn(async move {
            let result = driver.activate_primary(&config).await;
            let _ = tx.send(Input(InputKind::Event(ManagerEvent::ActivateComplete {
                id,
                result,
            })));
        });
    }

    fn spawn_deactivate(&self, index: usize, purpose: DeactivatePurpose) {
        let ctx = &self.contexts[index];
        let Some(b) = ctx.binding else {
            return;
        };
        let id = ctx.id;
        let cid = ctx.cid;
        let driver = self.bindings[b].driver.clone();
        let tx = self.input_tx.clone();

        tokio::spawn(async move {
            let result = driver.deactivate_primary(cid).await;
            let _ = tx.send(Input(InputKind::Event(ManagerEvent::DeactivateComplete {
                id,
                purpose,
                result,
            })));
        });
    }

    async fn handle_activate_complete(&mut self, id: u32, result: Result<RawIpConfig, DriverError>) {
        let Some(index) = self.context_index(id) else {
            return;
        };

        let reply = self.contexts[index].pending.take();

        let raw = match result {
            Ok(raw) => raw,
            Err(err) => {
                debug!(?err, id, "context activation failed");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(Error::Failed));
                }
                if let Some(b) = self.contexts[index].binding {
                    self.bindings[b].settings.clear();
                }
                self.release_context(index);
                return;
            }
        };

        let Some(b) = self.contexts[index].binding else {
            // Released underneath us, e.g. by a modem loss.
            if let Some(reply) = reply {
                let _ = reply.send(Err(Error::Failed));
            }
            return;
        };
        self.bindings[b].settings.apply_raw(&raw);

        self.contexts[index].active = true;
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }

        if let Some(interface) = self.bindings[b].interface.clone() {
            self.netif.set_up(&interface, true).await;

            if self.contexts[index].ctx_type == ContextType::Mms
                && self.bindings[b].settings.ipv4.is_some()
            {
                self.apply_mms_settings(index, b, &interface).await;
            }

            let ipv4 = self.bindings[b].settings.ipv4.is_some();
            let ipv6 = self.bindings[b].settings.ipv6.is_some();
            self.signal_context_settings(index, ipv4, ipv6);
        }

        self.signal_context_active(index);
    }

    async fn apply_mms_settings(&mut self, index: usize, b: usize, interface: &str) {
        let message_proxy = self.contexts[index].message_proxy.clone();

        let settings = &mut self.bindings[b].settings;
        if let Some(ipv4) = settings.ipv4.as_mut() {
            ipv4.proxy = Some(message_proxy.clone());
        }

        let proxy = ProxyAddress::parse(&message_proxy);
        debug!(?proxy, "MMS proxy");
        self.contexts[index].proxy = proxy;

        let address = self.bindings[b]
            .settings
            .ipv4
            .as_ref()
            .and_then(|ipv4| ipv4.address.clone());
        self.netif
            .set_ipv4_address(interface, address.as_deref())
            .await;

        if let Some(host) = self.contexts[index].proxy.as_ref().map(|p| p.host.clone()) {
            self.netif.add_host_route(interface, &host).await;
        }
    }

    async fn handle_deactivate_complete(
        &mut self,
        id: u32,
        purpose: DeactivatePurpose,
        result: Result<(), DriverError>,
    ) {
        let Some(index) = self.context_index(id) else {
            return;
        };

        match purpose {
            DeactivatePurpose::UserToggle => {
                let reply = self.contexts[index].pending.take();

                if let Err(err) = result {
                    debug!(?err, id, "context deactivation failed");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(Error::Failed));
                    }
                    return;
                }

                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }

                self.reset_context_settings(index).await;
                self.release_context(index);
                self.signal_context_active(index);

                // Attached=true may have been deferred until the active
                // contexts were gone; follow up now.
                if self.flags.contains(Flags::ATTACHED_UPDATE) {
                    self.flags.remove(Flags::ATTACHED_UPDATE);
                    self.attached_update().await;
                }
            }
            DeactivatePurpose::Remove => {
                let pending = self
                    .pending
                    .take_if(|p| p.kind == DeactivatePurpose::Remove);

                if let Err(err) = result {
                    debug!(?err, id, "deactivation for removal failed");
                    if let Some(pending) = pending {
                        let _ = pending.reply.send(Err(Error::Failed));
                    }
                    return;
                }

                self.reset_context_settings(index).await;
                self.release_context(index);
                self.signal_context_active(index);

                self.remove_context_storage(index);
                let removed_id = self.contexts[index].id;
                self.used_pids.take(removed_id);
                self.contexts.remove(index);

                if let Some(pending) = pending {
                    let _ = pending.reply.send(Ok(()));
                }
                self.signal(BusSignal::ContextRemoved { id: removed_id });
            }
            DeactivatePurpose::DeactivateAll => {
                if let Err(err) = result {
                    debug!(?err, id, "deactivate-all step failed");
                    if let Some(pending) = self
                        .pending
                        .take_if(|p| p.kind == DeactivatePurpose::DeactivateAll)
                    {
                        let _ = pending.reply.send(Err(Error::Failed));
                    }
                    return;
                }

                self.reset_context_settings(index).await;
                self.release_context(index);
                self.signal_context_active(index);

                self.deactivate_next();
            }
        }
    }

    fn deactivate_next(&mut self) {
        if let Some(index) = self.contexts.iter().position(|ctx| ctx.active) {
            self.spawn_deactivate(index, DeactivatePurpose::DeactivateAll);
            return;
        }

        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Ok(()));
        }
    }

    fn remove_context_storage(&mut self, index: usize) {
        let key = format!("context{}", self.contexts[index].id);
        if let Some(store) = &mut self.store {
            store.remove_group(&key);
        }
        self.sync_store();
    }

    /// Create a context with the minimum unused id, biased to continue
    /// after the most recent allocation.
    fn add_context(&mut self, name: Option<&str>, ctx_type: ContextType) -> Option<usize> {
        let id = if self.last_context_id != 0 {
            self.used_pids.find_unused_after(self.last_context_id)
        } else {
            self.used_pids.find_unused_min()
        }?;

        let name = name.unwrap_or_else(|| ctx_type.default_name());
        let ctx = PrimaryContext::new(id, name, ctx_type);

        self.used_pids.put(id);
        self.last_context_id = id;
        self.contexts.push(ctx);
        self.persist_context(self.contexts.len() - 1);

        Some(self.contexts.len() - 1)
    }

    fn provision_contexts(&mut self) {
        let entries = self.provision_db.lookup(
            &self.identity.mcc,
            &self.identity.mnc,
            self.identity.spn.as_deref(),
        );

        if entries.is_empty() {
            warn!("provisioning yielded no contexts");
        }

        for entry in entries {
            self.provision_context(&entry);
        }
    }

    fn provision_context(&mut self, entry: &ProvisionEntry) {
        if entry.name.len() > MAX_CONTEXT_NAME_LENGTH
            || !is_valid_apn(&entry.apn)
            || entry.username.len() > MAX_CREDENTIAL_LENGTH
            || entry.password.len() > MAX_CREDENTIAL_LENGTH
            || entry.message_proxy.len() > MAX_MESSAGE_PROXY_LENGTH
            || entry.message_center.len() > MAX_MESSAGE_CENTER_LENGTH
        {
            return;
        }

        let Some(ctx_type) = entry.type_mask().primary() else {
            return;
        };
        let Some(proto) = entry.protocol() else {
            return;
        };
        let Some(auth_method) = entry.auth_method() else {
            return;
        };

        let name = if entry.name.is_empty() {
            None
        } else {
            Some(entry.name.as_str())
        };

        let Some(index) = self.add_context(name, ctx_type) else {
            return;
        };

        let ctx = &mut self.contexts[index];
        ctx.apn = entry.apn.clone();
        ctx.username = entry.username.clone();
        ctx.password = entry.password.clone();
        ctx.proto = proto;
        ctx.auth_method = auth_method;

        if ctx_type == ContextType::Mms {
            ctx.message_proxy = entry.message_proxy.clone();
            ctx.message_center = entry.message_center.clone();
        }

        self.persist_context(index);
    }

    /// Reconcile a context the modem activated on its own with the
    /// user-visible context list.
    async fn cid_activated(&mut self, cid: u32, apn: &str) {
        debug!(cid, apn, "modem-activated context");

        if self
            .used_cids
            .as_ref()
            .is_some_and(|cids| cids.contains(cid))
        {
            debug!(cid, "already activated");
            return;
        }

        if apn.len() > MAX_APN_LENGTH || !is_valid_apn(apn) {
            warn!(cid, "context activated with an invalid APN");
            return;
        }

        let index = match self.find_usable_context(apn) {
            Some(index) => index,
            None => match self.add_context(Some(apn), ContextType::Internet) {
                Some(index) => index,
                None => {
                    warn!(cid, apn, "cannot create automatic context");
                    return;
                }
            },
        };

        if !self.assign_context(index, cid) {
            warn!(cid, "cannot assign automatic context to a driver");
            return;
        }

        let Some(b) = self.contexts[index].binding else {
            return;
        };
        if !self.bindings[b].driver.supports_read_settings() {
            warn!(cid, "driver does not support automatic context activation");
            self.release_context(index);
            return;
        }

        // A brand new context was allocated; adopt the reported APN.
        if self.contexts[index].apn.is_empty() {
            self.contexts[index].apn = apn.to_string();
            self.signal(BusSignal::ContextProperty {
                id: self.contexts[index].id,
                name: "AccessPointName",
                value: owned(apn),
            });
        }

        let id = self.contexts[index].id;
        let driver = self.bindings[b].driver.clone();
        let tx = self.input_tx.clone();
        tokio::spawn(async move {
            let result = driver.read_settings(cid).await;
            let _ = tx.send(Input(InputKind::Event(ManagerEvent::ReadSettingsComplete {
                id,
                result,
            })));
        });
    }

    fn find_usable_context(&self, apn: &str) -> Option<usize> {
        // Prefix match covers the LTE case where a user APN of
        // web.provider.com is reported as web.provider.com.mncX.mccY.gprs.
        self.contexts
            .iter()
            .position(|ctx| apn.starts_with(&ctx.apn))
            .or_else(|| {
                // Fall back to a provisioning-failed stub.
                self.contexts.iter().position(|ctx| ctx.apn.is_empty())
            })
    }

    async fn handle_read_settings_complete(
        &mut self,
        id: u32,
        result: Result<RawIpConfig, DriverError>,
    ) {
        let Some(index) = self.context_index(id) else {
            return;
        };

        let raw = match result {
            Ok(raw) => raw,
            Err(err) => {
                debug!(?err, id, "reading context settings failed");
                if let Some(b) = self.contexts[index].binding {
                    self.bindings[b].settings.clear();
                }
                self.release_context(index);
                return;
            }
        };

        let Some(b) = self.contexts[index].binding else {
            return;
        };
        self.bindings[b].settings.apply_raw(&raw);

        self.contexts[index].active = true;

        if let Some(interface) = self.bindings[b].interface.clone() {
            self.netif.set_up(&interface, true).await;

            let ipv4 = self.bindings[b].settings.ipv4.is_some();
            let ipv6 = self.bindings[b].settings.ipv6.is_some();
            self.signal_context_settings(index, ipv4, ipv6);
        }

        self.set_attached_property(true);
        self.signal_context_active(index);
    }

    async fn context_deactivated(&mut self, cid: u32) {
        if let Some(index) = self.context_index_by_cid(cid) {
            if self.contexts[index].active {
                self.reset_context_settings(index).await;
                self.release_context(index);
                self.signal_context_active(index);
            }
        }

        // Attached follows context activation on LTE, and a deferred
        // Attached=true may be waiting on this release.
        if self.on_lte() || self.flags.contains(Flags::ATTACHED_UPDATE) {
            self.flags.remove(Flags::ATTACHED_UPDATE);
            self.attached_update().await;
        }
    }

    async fn modem_lost(&mut self) {
        debug!("modem lost, releasing contexts");

        for index in 0..self.contexts.len() {
            if let Some(reply) = self.contexts[index].pending.take() {
                let _ = reply.send(Err(Error::Failed));
            }

            if !self.contexts[index].active {
                continue;
            }

            self.reset_context_settings(index).await;
            self.release_context(index);
            self.signal_context_active(index);
        }

        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(Error::Failed));
        }

        self.bindings.clear();
    }

    async fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::StatusNotify(status) => self.status_notify(status).await,
            ManagerEvent::NetregStatusChanged { status, technology } => {
                if status != RegistrationStatus::Unknown || self.netreg_status.is_some() {
                    self.netreg_status = Some(status);
                }
                self.technology = technology;
                self.netreg_update().await;
            }
            ManagerEvent::NetregRemoved => {
                self.netreg_status = Some(RegistrationStatus::NotRegistered);
                self.technology = None;
                self.flags.remove(Flags::RECHECK | Flags::ATTACHING);
                self.driver_attached = false;
                self.attached_update().await;
            }
            ManagerEvent::DetachedNotify => self.detached_notify().await,
            ManagerEvent::BearerNotify(bearer) => self.bearer_notify(bearer),
            ManagerEvent::SuspendNotify(cause) => self.suspend_notify(cause),
            ManagerEvent::ResumeNotify => self.update_suspended(false),
            ManagerEvent::CidActivated { cid, apn } => self.cid_activated(cid, &apn).await,
            ManagerEvent::ContextDeactivated { cid } => self.context_deactivated(cid).await,
            ManagerEvent::SetCidRange { min, max } => {
                self.used_cids = Some(IdSet::new(min, max));
            }
            ManagerEvent::ModemLost => self.modem_lost().await,
            ManagerEvent::AttachComplete { result } => self.handle_attach_complete(result).await,
            ManagerEvent::AttachStatusComplete { result } => {
                self.handle_attach_status(result).await;
            }
            ManagerEvent::ActivateComplete { id, result } => {
                self.handle_activate_complete(id, result).await;
            }
            ManagerEvent::DeactivateComplete { id, purpose, result } => {
                self.handle_deactivate_complete(id, purpose, result).await;
            }
            ManagerEvent::ReadSettingsComplete { id, result } => {
                self.handle_read_settings_complete(id, result).await;
            }
            ManagerEvent::SuspendTimeout { generation } => {
                if self.suspend_timer_armed && generation == self.suspend_generation {
                    self.suspend_timer_armed = false;
                    self.update_suspended(true);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::GetProperties { reply } => {
                let _ = reply.send(self.manager_properties());
            }
            Command::SetProperty { name, value, reply } => {
                let result = self.set_manager_property(&name, &value).await;
                let _ = reply.send(result);
            }
            Command::AddContext { type_str, reply } => {
                let result = self.handle_add_context(&type_str);
                match result {
                    Ok(index) => {
                        let id = self.contexts[index].id;
                        let _ = reply.send(Ok(id));
                        self.signal(BusSignal::ContextAdded {
                            id,
                            properties: self.context_properties(index),
                            announce: true,
                        });
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::RemoveContext { id, reply } => self.handle_remove_context(id, reply),
            Command::DeactivateAll { reply } => self.handle_deactivate_all(reply),
            Command::GetContexts { reply } => {
                let contexts = (0..self.contexts.len())
                    .map(|index| (self.contexts[index].id, self.context_properties(index)))
                    .collect();
                let _ = reply.send(contexts);
            }
            Command::ResetContexts { reply } => self.handle_reset_contexts(reply),
            Command::GetContextProperties { id, reply } => {
                let result = self
                    .context_index(id)
                    .map(|index| self.context_properties(index))
                    .ok_or(Error::NotFound);
                let _ = reply.send(result);
            }
            Command::SetContextProperty {
                id,
                name,
                value,
                reply,
            } => self.handle_set_context_property(id, &name, value, reply),
        }
    }

    fn manager_properties(&self) -> HashMap<String, OwnedValue> {
        let mut dict = HashMap::new();

        dict.insert("Attached".to_string(), owned(self.attached));

        if let Some(bearer) = self.bearer {
            dict.insert("Bearer".to_string(), owned(bearer.as_str()));
        }

        dict.insert("RoamingAllowed".to_string(), owned(self.roaming_allowed));
        dict.insert("Powered".to_string(), owned(self.powered));

        if self.attached {
            dict.insert("Suspended".to_string(), owned(self.suspended));
        }

        dict
    }

    async fn set_manager_property(&mut self, name: &str, value: &OwnedValue) -> Result<(), Error> {
        if self.pending.is_some() {
            return Err(Error::Busy);
        }

        let signal_name = match name {
            "RoamingAllowed" => "RoamingAllowed",
            "Powered" => "Powered",
            _ => return Err(Error::InvalidArguments),
        };

        let value = value
            .downcast_ref::<bool>()
            .map_err(|_| Error::InvalidArguments)?;

        let current = if signal_name == "Powered" {
            &mut self.powered
        } else {
            &mut self.roaming_allowed
        };

        if *current == value {
            return Ok(());
        }
        *current = value;

        if let Some(store) = &mut self.store {
            store.set_bool(SETTINGS_GROUP, signal_name, value);
        }
        self.sync_store();
        self.netreg_update().await;

        self.signal(BusSignal::ManagerProperty {
            name: signal_name,
            value: owned(value),
        });

        Ok(())
    }

    fn handle_add_context(&mut self, type_str: &str) -> Result<usize, Error> {
        let ctx_type = ContextType::from_str(type_str).ok_or(Error::InvalidFormat)?;

        self.add_context(None, ctx_type).ok_or(Error::Failed)
    }

    fn handle_remove_context(&mut self, id: u32, reply: oneshot::Sender<Result<(), Error>>) {
        if self.pending.is_some() {
            let _ = reply.send(Err(Error::Busy));
            return;
        }

        let Some(index) = self.context_index(id) else {
            let _ = reply.send(Err(Error::NotFound));
            return;
        };

        // This context is already being messed with.
        if self.contexts[index].pending.is_some() {
            let _ = reply.send(Err(Error::Busy));
            return;
        }

        if self.contexts[index].active {
            self.pending = Some(PendingManagerOp {
                kind: DeactivatePurpose::Remove,
                reply,
            });
            self.spawn_deactivate(index, DeactivatePurpose::Remove);
            return;
        }

        debug!(id, "unregistering context");
        self.remove_context_storage(index);
        self.used_pids.take(id);
        self.contexts.remove(index);

        let _ = reply.send(Ok(()));
        self.signal(BusSignal::ContextRemoved { id });
    }

    fn handle_deactivate_all(&mut self, reply: oneshot::Sender<Result<(), Error>>) {
        if self.pending.is_some() {
            let _ = reply.send(Err(Error::Busy));
            return;
        }

        if self.contexts.iter().any(|ctx| ctx.pending.is_some()) {
            let _ = reply.send(Err(Error::Busy));
            return;
        }

        self.pending = Some(PendingManagerOp {
            kind: DeactivatePurpose::DeactivateAll,
            reply,
        });
        self.deactivate_next();
    }

    fn handle_reset_contexts(&mut self, reply: oneshot::Sender<Result<(), Error>>) {
        // Busy takes precedence over not-allowed.
        if self.pending.is_some() {
            let _ = reply.send(Err(Error::Busy));
            return;
        }

        if self.contexts.iter().any(|ctx| ctx.pending.is_some()) {
            let _ = reply.send(Err(Error::Busy));
            return;
        }

        if self.powered || self.contexts.iter().any(|ctx| ctx.active) {
            let _ = reply.send(Err(Error::NotAllowed));
            return;
        }

        // Remove the current contexts first, re-provision after.
        while !self.contexts.is_empty() {
            self.remove_context_storage(0);
            let id = self.contexts[0].id;
            self.used_pids.take(id);
            self.contexts.remove(0);
            self.signal(BusSignal::ContextRemoved { id });
        }

        self.last_context_id = 0;
        self.provision_contexts();

        if self.contexts.is_empty() {
            self.add_context(None, ContextType::Internet);
        }

        for index in 0..self.contexts.len() {
            self.signal(BusSignal::ContextAdded {
                id: self.contexts[index].id,
                properties: self.context_properties(index),
                announce: true,
            });
        }

        let _ = reply.send(Ok(()));
    }

    fn handle_set_context_property(
        &mut self,
        id: u32,
        name: &str,
        value: OwnedValue,
        reply: oneshot::Sender<Result<(), Error>>,
    ) {
        let Some(index) = self.context_index(id) else {
            let _ = reply.send(Err(Error::NotFound));
            return;
        };

        if name == "Active" {
            if self.pending.is_some() || self.contexts[index].pending.is_some() {
                let _ = reply.send(Err(Error::Busy));
                return;
            }

            let active = match value.downcast_ref::<bool>() {
                Ok(active) => active,
                Err(_) => {
                    let _ = reply.send(Err(Error::InvalidArguments));
                    return;
                }
            };

            if self.contexts[index].active == active {
                let _ = reply.send(Ok(()));
                return;
            }

            if active && !self.attached {
                let _ = reply.send(Err(Error::NotAttached));
                return;
            }

            if self.flags.contains(Flags::ATTACHING) {
                let _ = reply.send(Err(Error::AttachInProgress));
                return;
            }

            if active && !self.assign_context(index, 0) {
                let _ = reply.send(Err(Error::NotImplemented));
                return;
            }

            self.contexts[index].pending = Some(reply);

            if active {
                if let Some(b) = self.contexts[index].binding {
                    self.spawn_activate(index, b);
                }
            } else {
                self.spawn_deactivate(index, DeactivatePurpose::UserToggle);
            }
            return;
        }

        // All other properties are read-only while the context is
        // active.
        if self.contexts[index].active {
            let _ = reply.send(Err(Error::InUse));
            return;
        }

        match self.contexts[index].set_config_property(name, &value) {
            Err(err) => {
                let _ = reply.send(Err(err));
            }
            Ok(PropertyChange::Unchanged) => {
                let _ = reply.send(Ok(()));
            }
            Ok(PropertyChange::Applied {
                storage_key,
                storage_value,
                signal_value,
            }) => {
                let key = format!("context{id}");
                if let Some(store) = &mut self.store {
                    store.set_str(&key, storage_key, &storage_value);
                }
                self.sync_store();

                let _ = reply.send(Ok(()));
                self.signal(BusSignal::ContextProperty {
                    id,
                    name: storage_key,
                    value: signal_value,
                });
            }
        }
    }
}
