//! D-Bus surface for the connection manager and its contexts.
//!
//! Two interfaces are served: `ConnectionManager` at the modem path and
//! one `ConnectionContext` per context at `<modem>/context<N>`. Method
//! calls forward to the manager task; property changes stream back and
//! are re-emitted as `PropertyChanged` signals here.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};
use zbus::{interface, Connection};

use super::error::Error;
use super::manager::{BusSignal, ConnectionManager};

/// Interface name of the manager object.
pub const MANAGER_INTERFACE: &str = "org.packetd.ConnectionManager";
/// Interface name of the per-context objects.
pub const CONTEXT_INTERFACE: &str = "org.packetd.ConnectionContext";

/// Errors crossing the bus, one name per core error kind.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.packetd.Error")]
pub enum DbusError {
    /// Transport-level failure.
    #[zbus(error)]
    ZBus(zbus::Error),
    /// Arguments have the wrong shape or type.
    InvalidArguments(String),
    /// Arguments carry an invalid value.
    InvalidFormat(String),
    /// The referenced object does not exist.
    NotFound(String),
    /// The packet service is not attached.
    NotAttached(String),
    /// An attach transition is in flight.
    AttachInProgress(String),
    /// Another request is outstanding.
    Busy(String),
    /// The object is active and read-only.
    InUse(String),
    /// Not allowed in the current state.
    NotAllowed(String),
    /// No back-end implements the operation.
    NotImplemented(String),
    /// The operation failed.
    Failed(String),
}

impl From<Error> for DbusError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::InvalidArguments => Self::InvalidArguments(message),
            Error::InvalidFormat => Self::InvalidFormat(message),
            Error::NotFound => Self::NotFound(message),
            Error::NotAttached => Self::NotAttached(message),
            Error::AttachInProgress => Self::AttachInProgress(message),
            Error::Busy => Self::Busy(message),
            Error::InUse => Self::InUse(message),
            Error::NotAllowed => Self::NotAllowed(message),
            Error::NotImplemented => Self::NotImplemented(message),
            Error::Failed => Self::Failed(message),
        }
    }
}

fn context_path(base: &OwnedObjectPath, id: u32) -> zbus::Result<OwnedObjectPath> {
    Ok(OwnedObjectPath::try_from(format!("{base}/context{id}"))?)
}

fn context_id_from_path(base: &OwnedObjectPath, path: &str) -> Option<u32> {
    path.strip_prefix(base.as_str())?
        .strip_prefix("/context")?
        .parse()
        .ok()
}

/// The `ConnectionManager` object.
pub struct ManagerInterface {
    manager: ConnectionManager,
    base_path: OwnedObjectPath,
}

#[interface(name = "org.packetd.ConnectionManager")]
impl ManagerInterface {
    async fn get_properties(&self) -> Result<HashMap<String, OwnedValue>, DbusError> {
        Ok(self.manager.get_properties().await?)
    }

    async fn set_property(&self, name: String, value: Value<'_>) -> Result<(), DbusError> {
        let value = value
            .try_to_owned()
            .map_err(|_| DbusError::InvalidArguments("invalid arguments".to_string()))?;
        Ok(self.manager.set_property(&name, value).await?)
    }

    async fn add_context(&self, r#type: String) -> Result<OwnedObjectPath, DbusError> {
        let id = self.manager.add_context(&r#type).await?;
        Ok(context_path(&self.base_path, id).map_err(DbusError::ZBus)?)
    }

    async fn remove_context(&self, path: OwnedObjectPath) -> Result<(), DbusError> {
        let id = context_id_from_path(&self.base_path, path.as_str())
            .ok_or_else(|| DbusError::NotFound("not found".to_string()))?;
        Ok(self.manager.remove_context(id).await?)
    }

    async fn deactivate_all(&self) -> Result<(), DbusError> {
        Ok(self.manager.deactivate_all().await?)
    }

    async fn get_contexts(
        &self,
    ) -> Result<Vec<(OwnedObjectPath, HashMap<String, OwnedValue>)>, DbusError> {
        let contexts = self.manager.get_contexts().await?;

        let mut out = Vec::with_capacity(contexts.len());
        for (id, properties) in contexts {
            out.push((
                context_path(&self.base_path, id).map_err(DbusError::ZBus)?,
                properties,
            ));
        }
        Ok(out)
    }

    async fn reset_contexts(&self) -> Result<(), DbusError> {
        Ok(self.manager.reset_contexts().await?)
    }

    #[zbus(signal)]
    async fn property_changed(
        emitter: &SignalEmitter<'_>,
        name: &str,
        value: OwnedValue,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn context_added(
        emitter: &SignalEmitter<'_>,
        path: OwnedObjectPath,
        properties: HashMap<String, OwnedValue>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn context_removed(
        emitter: &SignalEmitter<'_>,
        path: OwnedObjectPath,
    ) -> zbus::Result<()>;
}

/// One `ConnectionContext` object.
pub struct ContextInterface {
    manager: ConnectionManager,
    id: u32,
}

#[interface(name = "org.packetd.ConnectionContext")]
impl ContextInterface {
    async fn get_properties(&self) -> Result<HashMap<String, OwnedValue>, DbusError> {
        Ok(self.manager.context_properties(self.id).await?)
    }

    async fn set_property(&self, name: String, value: Value<'_>) -> Result<(), DbusError> {
        let value = value
            .try_to_owned()
            .map_err(|_| DbusError::InvalidArguments("invalid arguments".to_string()))?;
        Ok(self
            .manager
            .set_context_property(self.id, &name, value)
            .await?)
    }

    #[zbus(signal)]
    async fn property_changed(
        emitter: &SignalEmitter<'_>,
        name: &str,
        value: OwnedValue,
    ) -> zbus::Result<()>;
}

/// Serve both interfaces and keep forwarding manager signals until the
/// manager goes away.
pub async fn serve(
    connection: &Connection,
    base_path: OwnedObjectPath,
    manager: ConnectionManager,
    mut signals: mpsc::UnboundedReceiver<BusSignal>,
) -> zbus::Result<()> {
    connection
        .object_server()
        .at(
            base_path.as_str(),
            ManagerInterface {
                manager: manager.clone(),
                base_path: base_path.clone(),
            },
        )
        .await?;

    // Contexts loaded from settings or provisioning exist before the
    // interface does; serve them now.
    if let Ok(contexts) = manager.get_contexts().await {
        for (id, _) in contexts {
            add_context_object(connection, &base_path, &manager, id).await?;
        }
    }

    let connection = connection.clone();
    let manager_for_signals = manager.clone();
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            if let Err(err) =
                forward_signal(&connection, &base_path, &manager_for_signals, signal).await
            {
                debug!(%err, "failed to forward a bus signal");
            }
        }
    });

    Ok(())
}

async fn add_context_object(
    connection: &Connection,
    base_path: &OwnedObjectPath,
    manager: &ConnectionManager,
    id: u32,
) -> zbus::Result<()> {
    let path = context_path(base_path, id)?;
    connection
        .object_server()
        .at(
            path.as_str(),
            ContextInterface {
                manager: manager.clone(),
                id,
            },
        )
        .await?;
    Ok(())
}

async fn forward_signal(
    connection: &Connection,
    base_path: &OwnedObjectPath,
    manager: &ConnectionManager,
    signal: BusSignal,
) -> zbus::Result<()> {
    match signal {
        BusSignal::ManagerProperty { name, value } => {
            let iface = connection
                .object_server()
                .interface::<_, ManagerInterface>(base_path.as_str())
                .await?;
            ManagerInterface::property_changed(iface.signal_emitter(), name, value).await?;
        }
        BusSignal::ContextProperty { id, name, value } => {
            let path = context_path(base_path, id)?;
            let iface = connection
                .object_server()
                .interface::<_, ContextInterface>(path.as_str())
                .await?;
            ContextInterface::property_changed(iface.signal_emitter(), name, value).await?;
        }
        BusSignal::ContextAdded {
            id,
            properties,
            announce,
        } => {
            add_context_object(connection, base_path, manager, id).await?;

            if announce {
                let iface = connection
                    .object_server()
                    .interface::<_, ManagerInterface>(base_path.as_str())
                    .await?;
                ManagerInterface::context_added(
                    iface.signal_emitter(),
                    context_path(base_path, id)?,
                    properties,
                )
                .await?;
            }
        }
        BusSignal::ContextRemoved { id } => {
            let path = context_path(base_path, id)?;
            if let Err(err) = connection
                .object_server()
                .remove::<ContextInterface, _>(path.as_str())
                .await
            {
                warn!(%err, %path, "failed to remove a context object");
            }

            let iface = connection
                .object_server()
                .interface::<_, ManagerInterface>(base_path.as_str())
                .await?;
            ManagerInterface::context_removed(iface.signal_emitter(), path).await?;
        }
    }
    Ok(())
}
