//! Per-APN primary context entity.

use std::collections::HashMap;

use zbus::zvariant::{OwnedValue, Value};

use super::binding::ContextSettings;
use super::error::Error;
use super::persistence::ContextRecord;
use super::types::{
    AuthMethod, ContextType, Protocol, MAX_APN_LENGTH, MAX_CONTEXT_NAME_LENGTH,
    MAX_CREDENTIAL_LENGTH, MAX_MESSAGE_CENTER_LENGTH, MAX_MESSAGE_PROXY_LENGTH,
};
use super::validation::{is_valid_apn, ProxyAddress};

/// Convert a value that carries no file descriptors.
pub(crate) fn owned<'a>(value: impl Into<Value<'a>>) -> OwnedValue {
    let value: Value<'a> = value.into();
    // Only file-descriptor values can fail this conversion and no
    // property value carries one.
    value.try_to_owned().unwrap_or_else(|_| OwnedValue::from(false))
}

/// A user-visible APN configuration, also the unit of activation on the
/// modem.
#[derive(Debug)]
pub struct PrimaryContext {
    /// Stable path id, 1-based.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Context purpose.
    pub ctx_type: ContextType,
    /// Access point name; empty until configured or auto-assigned.
    pub apn: String,
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
    /// PDP type.
    pub proto: Protocol,
    /// Authentication scheme.
    pub auth_method: AuthMethod,
    /// MMS proxy string, meaningful for MMS contexts.
    pub message_proxy: String,
    /// MMS message center, meaningful for MMS contexts.
    pub message_center: String,
    /// Whether the context is activated on the modem.
    pub active: bool,
    /// Modem context id; 0 while inactive.
    pub cid: u32,
    /// Index of the owned driver binding while assigned.
    pub binding: Option<usize>,
    /// Proxy parsed from `message_proxy` during MMS activation.
    pub proxy: Option<ProxyAddress>,
    /// Reply slot of the in-flight request on this context.
    pub pending: Option<tokio::sync::oneshot::Sender<Result<(), Error>>>,
}

/// Outcome of a configuration property write.
#[derive(Debug)]
pub enum PropertyChange {
    /// The value already matched; nothing to persist or signal.
    Unchanged,
    /// The value was applied.
    Applied {
        /// Storage key under the context group.
        storage_key: &'static str,
        /// Value to persist.
        storage_value: String,
        /// Value for the `PropertyChanged` signal.
        signal_value: OwnedValue,
    },
}

impl PrimaryContext {
    /// Create a fresh inactive context.
    pub fn new(id: u32, name: &str, ctx_type: ContextType) -> Self {
        Self {
            id,
            name: name.to_string(),
            ctx_type,
            apn: String::new(),
            username: String::new(),
            password: String::new(),
            proto: Protocol::default(),
            auth_method: AuthMethod::default(),
            message_proxy: String::new(),
            message_center: String::new(),
            active: false,
            cid: 0,
            binding: None,
            proxy: None,
            pending: None,
        }
    }

    /// Recreate a context from its stored record.
    pub fn from_record(record: ContextRecord) -> Self {
        let mut ctx = Self::new(record.id, &record.name, record.ctx_type);
        ctx.apn = record.apn;
        ctx.username = record.username;
        ctx.password = record.password;
        ctx.proto = record.proto;
        ctx.auth_method = record.auth_method;
        ctx.message_proxy = record.message_proxy;
        ctx.message_center = record.message_center;
        ctx
    }

    /// Snapshot for the settings store.
    pub fn to_record(&self) -> ContextRecord {
        ContextRecord {
            id: self.id,
            name: self.name.clone(),
            ctx_type: self.ctx_type,
            proto: self.proto,
            apn: self.apn.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            auth_method: self.auth_method,
            message_proxy: self.message_proxy.clone(),
            message_center: self.message_center.clone(),
        }
    }

    /// Apply a configuration property write. `Active` is not handled
    /// here; the manager drives activation itself.
    pub fn set_config_property(
        &mut self,
        property: &str,
        value: &OwnedValue,
    ) -> Result<PropertyChange, Error> {
        let str_value = || -> Result<&str, Error> {
            value.downcast_ref::<&str>().map_err(|_| Error::InvalidArguments)
        };

        match property {
            "AccessPointName" => {
                let apn = str_value()?;
                if self.apn == apn {
                    return Ok(PropertyChange::Unchanged);
                }
                if apn.len() > MAX_APN_LENGTH || !is_valid_apn(apn) {
                    return Err(Error::InvalidFormat);
                }
                self.apn = apn.to_string();
                Ok(applied("AccessPointName", apn))
            }
            "Type" => {
                let type_str = str_value()?;
                let ctx_type = ContextType::from_str(type_str).ok_or(Error::InvalidFormat)?;
                if self.ctx_type == ctx_type {
                    return Ok(PropertyChange::Unchanged);
                }
                self.ctx_type = ctx_type;
                Ok(applied("Type", type_str))
            }
            "Protocol" => {
                let proto_str = str_value()?;
                let proto = Protocol::from_str(proto_str).ok_or(Error::InvalidFormat)?;
                if self.proto == proto {
                    return Ok(PropertyChange::Unchanged);
                }
                self.proto = proto;
                Ok(applied("Protocol", proto_str))
            }
            "Username" => {
                let username = str_value()?;
                if username.len() > MAX_CREDENTIAL_LENGTH {
                    return Err(Error::InvalidFormat);
                }
                if self.username == username {
                    return Ok(PropertyChange::Unchanged);
                }
                self.username = username.to_string();
                Ok(applied("Username", username))
            }
            "Password" => {
                let password = str_value()?;
                if password.len() > MAX_CREDENTIAL_LENGTH {
                    return Err(Error::InvalidFormat);
                }
                if self.password == password {
                    return Ok(PropertyChange::Unchanged);
                }
                self.password = password.to_string();
                Ok(applied("Password", password))
            }
            "Name" => {
                let name = str_value()?;
                if name.len() > MAX_CONTEXT_NAME_LENGTH {
                    return Err(Error::InvalidFormat);
                }
                if self.name == name {
                    return Ok(PropertyChange::Unchanged);
                }
                self.name = name.to_string();
                Ok(applied("Name", name))
            }
            "AuthenticationMethod" => {
                let auth_str = str_value()?;
                let auth = AuthMethod::from_str(auth_str).ok_or(Error::InvalidFormat)?;
                if self.auth_method == auth {
                    return Ok(PropertyChange::Unchanged);
                }
                self.auth_method = auth;
                Ok(applied("AuthenticationMethod", auth_str))
            }
            "MessageProxy" if self.ctx_type == ContextType::Mms => {
                let proxy = str_value()?;
                if proxy.len() > MAX_MESSAGE_PROXY_LENGTH {
                    return Err(Error::InvalidFormat);
                }
                if self.message_proxy == proxy {
                    return Ok(PropertyChange::Unchanged);
                }
                self.message_proxy = proxy.to_string();
                Ok(applied("MessageProxy", proxy))
            }
            "MessageCenter" if self.ctx_type == ContextType::Mms => {
                let center = str_value()?;
                if center.len() > MAX_MESSAGE_CENTER_LENGTH {
                    return Err(Error::InvalidFormat);
                }
                if self.message_center == center {
                    return Ok(PropertyChange::Unchanged);
                }
                self.message_center = center.to_string();
                Ok(applied("MessageCenter", center))
            }
            _ => Err(Error::InvalidArguments),
        }
    }

    /// Full property dictionary for `GetProperties`, `GetContexts` and
    /// `ContextAdded`.
    pub fn properties(
        &self,
        settings: Option<&ContextSettings>,
        interface: Option<&str>,
    ) -> HashMap<String, OwnedValue> {
        let mut dict = HashMap::new();

        dict.insert("Name".to_string(), owned(self.name.as_str()));
        dict.insert("Active".to_string(), owned(self.active));
        dict.insert("Type".to_string(), owned(self.ctx_type.as_str()));
        dict.insert("Protocol".to_string(), owned(self.proto.as_str()));
        dict.insert("AccessPointName".to_string(), owned(self.apn.as_str()));
        dict.insert("Username".to_string(), owned(self.username.as_str()));
        dict.insert("Password".to_string(), owned(self.password.as_str()));
        dict.insert(
            "AuthenticationMethod".to_string(),
            owned(self.auth_method.as_str()),
        );

        if self.ctx_type == ContextType::Mms {
            dict.insert(
                "MessageProxy".to_string(),
                owned(self.message_proxy.as_str()),
            );
            dict.insert(
                "MessageCenter".to_string(),
                owned(self.message_center.as_str()),
            );
        }

        dict.insert(
            "Settings".to_string(),
            owned(ipv4_settings_dict(settings, interface)),
        );
        dict.insert(
            "IPv6.Settings".to_string(),
            owned(ipv6_settings_dict(settings, interface)),
        );

        dict
    }
}

fn applied(storage_key: &'static str, value: &str) -> PropertyChange {
    PropertyChange::Applied {
        storage_key,
        storage_value: value.to_string(),
        signal_value: owned(value),
    }
}

/// IPv4 settings dictionary as exposed on the bus.
///
/// An MMS proxy collapses the dictionary to `Interface` plus a single
/// `Proxy` entry; ordinary contexts carry the addressing keys.
pub fn ipv4_settings_dict(
    settings: Option<&ContextSettings>,
    interface: Option<&str>,
) -> HashMap<String, OwnedValue> {
    let mut dict = HashMap::new();

    let Some(ipv4) = settings.and_then(|s| s.ipv4.as_ref()) else {
        return dict;
    };

    if let Some(interface) = interface {
        dict.insert("Interface".to_string(), owned(interface));
    }

    if let Some(proxy) = ipv4.proxy.as_deref() {
        dict.insert("Proxy".to_string(), owned(proxy));
        return dict;
    }

    let method = if ipv4.static_ip { "static" } else { "dhcp" };
    dict.insert("Method".to_string(), owned(method));

    if let Some(address) = ipv4.address.as_deref() {
        dict.insert("Address".to_string(), owned(address));
    }
    if let Some(netmask) = ipv4.netmask.as_deref() {
        dict.insert("Netmask".to_string(), owned(netmask));
    }
    if let Some(gateway) = ipv4.gateway.as_deref() {
        dict.insert("Gateway".to_string(), owned(gateway));
    }
    if !ipv4.dns.is_empty() {
        dict.insert("DomainNameServers".to_string(), owned(ipv4.dns.clone()));
    }

    dict
}

/// IPv6 settings dictionary as exposed on the bus.
pub fn ipv6_settings_dict(
    settings: Option<&ContextSettings>,
    interface: Option<&str>,
) -> HashMap<String, OwnedValue> {
    let mut dict = HashMap::new();

    let Some(ipv6) = settings.and_then(|s| s.ipv6.as_ref()) else {
        return dict;
    };

    if let Some(interface) = interface {
        dict.insert("Interface".to_string(), owned(interface));
    }
    if let Some(address) = ipv6.address.as_deref() {
        dict.insert("Address".to_string(), owned(address));
    }
    if let Some(length) = ipv6.prefix_length {
        dict.insert("PrefixLength".to_string(), owned(length));
    }
    if let Some(gateway) = ipv6.gateway.as_deref() {
        dict.insert("Gateway".to_string(), owned(gateway));
    }
    if !ipv6.dns.is_empty() {
        dict.insert("DomainNameServers".to_string(), owned(ipv6.dns.clone()));
    }

    dict
}
