//! Per-IMSI settings store.
//!
//! Settings live in one TOML document per IMSI: a reserved `Settings`
//! table holding the user preferences, plus one `context<N>` table per
//! stored context. The legacy `primarycontext<N>` group name is migrated
//! on load. The document is written back after every mutation.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use toml::Table;
use toml::Value;
use tracing::warn;

use super::types::{
    AuthMethod, ContextType, Protocol, MAX_CONTEXTS, MAX_CONTEXT_NAME_LENGTH,
    MAX_CREDENTIAL_LENGTH, MAX_MESSAGE_CENTER_LENGTH, MAX_MESSAGE_PROXY_LENGTH,
};
use super::validation::is_valid_apn;

/// Reserved group holding the manager preferences.
pub const SETTINGS_GROUP: &str = "Settings";

const STORE_FILE: &str = "connection.toml";

/// Keyed per-IMSI settings document.
pub struct SettingsStore {
    path: PathBuf,
    groups: BTreeMap<String, Table>,
}

impl SettingsStore {
    /// Open the store for an IMSI, creating an empty document if none
    /// exists yet. A corrupt document is discarded with a warning, and
    /// top-level keys that are not group tables are dropped.
    pub fn open(base_dir: &Path, imsi: &str) -> Self {
        let path = base_dir.join(imsi).join(STORE_FILE);

        let groups = match fs::read_to_string(&path) {
            Ok(text) => match text.parse::<Table>() {
                Ok(table) => table
                    .into_iter()
                    .filter_map(|(name, value)| match value {
                        Value::Table(group) => Some((name, group)),
                        _ => None,
                    })
                    .collect(),
                Err(err) => {
                    warn!(path = %path.display(), %err, "discarding corrupt settings store");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };

        Self { path, groups }
    }

    /// Write the document back to disk.
    pub fn sync(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut document = Table::new();
        for (name, group) in &self.groups {
            document.insert(name.clone(), Value::Table(group.clone()));
        }

        let text = toml::to_string_pretty(&document)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fs::write(&self.path, text)
    }

    /// Names of all groups in the document.
    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Look up a group table.
    pub fn group(&self, name: &str) -> Option<&Table> {
        self.groups.get(name)
    }

    /// Remove a group.
    pub fn remove_group(&mut self, name: &str) {
        self.groups.remove(name);
    }

    /// Read a boolean key.
    pub fn get_bool(&self, group: &str, key: &str) -> Option<bool> {
        self.group(group)?.get(key)?.as_bool()
    }

    /// Write a boolean key.
    pub fn set_bool(&mut self, group: &str, key: &str, value: bool) {
        self.group_mut(group).insert(key.to_string(), Value::Boolean(value));
    }

    /// Write a string key.
    pub fn set_str(&mut self, group: &str, key: &str, value: &str) {
        self.group_mut(group)
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    fn group_mut(&mut self, name: &str) -> &mut Table {
        self.groups.entry(name.to_string()).or_insert_with(Table::new)
    }
}

/// Parse a context group name into its id, flagging the legacy form.
pub fn parse_group_id(group: &str) -> Option<(u32, bool)> {
    let (id_str, legacy) = match group.strip_prefix("context") {
        Some(rest) => (rest, false),
        None => (group.strip_prefix("primarycontext")?, true),
    };

    let id: u32 = id_str.parse().ok()?;
    if id < 1 || id > MAX_CONTEXTS {
        return None;
    }

    Some((id, legacy))
}

/// A context as stored in the settings document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRecord {
    /// Context path id.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Context purpose.
    pub ctx_type: ContextType,
    /// PDP type.
    pub proto: Protocol,
    /// Access point name; empty for freshly-created stubs.
    pub apn: String,
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
    /// Authentication scheme.
    pub auth_method: AuthMethod,
    /// MMS proxy, stored for MMS contexts only.
    pub message_proxy: String,
    /// MMS message center, stored for MMS contexts only.
    pub message_center: String,
}

impl ContextRecord {
    /// Load and validate a context group. `None` means the group is
    /// unusable and should be removed from the store.
    pub fn load(id: u32, group: &Table) -> Option<Self> {
        let get = |key: &str| group.get(key).and_then(Value::as_str);

        let name = get("Name")?;
        if name.len() > MAX_CONTEXT_NAME_LENGTH {
            return None;
        }

        let ctx_type = ContextType::from_str(get("Type")?)?;
        let proto = Protocol::from_str(get("Protocol").unwrap_or("ip"))?;
        let auth_method = AuthMethod::from_str(get("AuthenticationMethod").unwrap_or("chap"))?;

        let username = get("Username")?;
        let password = get("Password")?;
        if username.len() > MAX_CREDENTIAL_LENGTH || password.len() > MAX_CREDENTIAL_LENGTH {
            return None;
        }

        // Empty (just created) APNs are acceptable, other invalid ones
        // are not.
        let apn = get("AccessPointName")?;
        if !apn.is_empty() && !is_valid_apn(apn) {
            return None;
        }

        let (message_proxy, message_center) = if ctx_type == ContextType::Mms {
            let proxy = get("MessageProxy").unwrap_or_default();
            let center = get("MessageCenter").unwrap_or_default();
            if proxy.len() > MAX_MESSAGE_PROXY_LENGTH || center.len() > MAX_MESSAGE_CENTER_LENGTH {
                return None;
            }
            (proxy.to_string(), center.to_string())
        } else {
            (String::new(), String::new())
        };

        Some(Self {
            id,
            name: name.to_string(),
            ctx_type,
            proto,
            apn: apn.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            auth_method,
            message_proxy,
            message_center,
        })
    }

    /// Write this context under its `context<N>` group.
    pub fn store(&self, store: &mut SettingsStore) {
        let key = format!("context{}", self.id);

        store.set_str(&key, "Name", &self.name);
        store.set_str(&key, "AccessPointName", &self.apn);
        store.set_str(&key, "Username", &self.username);
        store.set_str(&key, "Password", &self.password);
        store.set_str(&key, "AuthenticationMethod", self.auth_method.as_str());
        store.set_str(&key, "Type", self.ctx_type.as_str());
        store.set_str(&key, "Protocol", self.proto.as_str());

        if self.ctx_type == ContextType::Mms {
            store.set_str(&key, "MessageProxy", &self.message_proxy);
            store.set_str(&key, "MessageCenter", &self.message_center);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn record(id: u32) -> ContextRecord {
        ContextRecord {
            id,
            name: "Internet".into(),
            ctx_type: ContextType::Internet,
            proto: Protocol::Ip,
            apn: "web.provider.com".into(),
            username: "user".into(),
            password: "pass".into(),
            auth_method: AuthMethod::Chap,
            message_proxy: String::new(),
            message_center: String::new(),
        }
    }

    #[test]
    fn group_id_parsing() {
        assert_eq!(parse_group_id("context1"), Some((1, false)));
        assert_eq!(parse_group_id("context256"), Some((256, false)));
        assert_eq!(parse_group_id("primarycontext3"), Some((3, true)));
        assert_eq!(parse_group_id("context0"), None);
        assert_eq!(parse_group_id("context257"), None);
        assert_eq!(parse_group_id("contextx"), None);
        assert_eq!(parse_group_id("Settings"), None);
    }

    #[test]
    fn record_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SettingsStore::open(dir.path(), "001010123456789");

        let original = record(1);
        original.store(&mut store);
        store.sync().unwrap();

        let store = SettingsStore::open(dir.path(), "001010123456789");
        let loaded = ContextRecord::load(1, store.group("context1").unwrap()).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn mms_record_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SettingsStore::open(dir.path(), "001010123456789");

        let original = ContextRecord {
            ctx_type: ContextType::Mms,
            message_proxy: "http://mmsc.op.com:8080".into(),
            message_center: "http://mmsc.op.com/mms".into(),
            ..record(2)
        };
        original.store(&mut store);
        store.sync().unwrap();

        let store = SettingsStore::open(dir.path(), "001010123456789");
        let loaded = ContextRecord::load(2, store.group("context2").unwrap()).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn load_applies_defaults() {
        let mut group = Table::new();
        group.insert("Name".into(), Value::String("Internet".into()));
        group.insert("Type".into(), Value::String("internet".into()));
        group.insert("Username".into(), Value::String(String::new()));
        group.insert("Password".into(), Value::String(String::new()));
        group.insert("AccessPointName".into(), Value::String("internet".into()));

        let loaded = ContextRecord::load(1, &group).unwrap();
        assert_eq!(loaded.proto, Protocol::Ip);
        assert_eq!(loaded.auth_method, AuthMethod::Chap);
    }

    #[test]
    fn load_rejects_invalid_groups() {
        let mut group = Table::new();
        group.insert("Name".into(), Value::String("X".into()));
        assert!(ContextRecord::load(1, &group).is_none());

        group.insert("Type".into(), Value::String("internet".into()));
        group.insert("Username".into(), Value::String(String::new()));
        group.insert("Password".into(), Value::String(String::new()));
        group.insert("AccessPointName".into(), Value::String("not an apn!".into()));
        assert!(ContextRecord::load(1, &group).is_none());

        // Empty APN is the freshly-created stub form.
        group.insert("AccessPointName".into(), Value::String(String::new()));
        assert!(ContextRecord::load(1, &group).is_some());
    }

    #[test]
    fn manager_preferences_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SettingsStore::open(dir.path(), "724050000000000");
        store.set_bool(SETTINGS_GROUP, "Powered", true);
        store.set_bool(SETTINGS_GROUP, "RoamingAllowed", false);
        store.sync().unwrap();

        let store = SettingsStore::open(dir.path(), "724050000000000");
        assert_eq!(store.get_bool(SETTINGS_GROUP, "Powered"), Some(true));
        assert_eq!(store.get_bool(SETTINGS_GROUP, "RoamingAllowed"), Some(false));
    }

    #[test]
    fn corrupt_store_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let imsi_dir = dir.path().join("310150123456789");
        std::fs::create_dir_all(&imsi_dir).unwrap();
        std::fs::write(imsi_dir.join(STORE_FILE), "not = [valid").unwrap();

        let store = SettingsStore::open(dir.path(), "310150123456789");
        assert!(store.group_names().is_empty());
    }
}
