//! APN template lookup.
//!
//! The provisioning database is a TOML file of templates keyed by
//! `(mcc, mnc)` with an optional service-provider name. It is consulted
//! when a SIM has no stored contexts, and again by `ResetContexts`.

use std::fs;
use std::path::Path;

use bitflags::bitflags;
use serde::Deserialize;
use thiserror::Error;

use super::types::{AuthMethod, ContextType, Protocol};

bitflags! {
    /// Context purposes a provisioning template applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextTypeFlags: u32 {
        /// General internet connectivity.
        const INTERNET = 1 << 0;
        /// Multimedia messaging.
        const MMS = 1 << 1;
        /// WAP browsing.
        const WAP = 1 << 2;
        /// IMS signalling.
        const IMS = 1 << 3;
        /// Secure user-plane location.
        const SUPL = 1 << 4;
        /// LTE initial attach.
        const IA = 1 << 5;
    }
}

impl ContextTypeFlags {
    /// Resolve a multi-typed mask to the context type actually
    /// provisioned: the lowest set bit wins.
    pub fn primary(self) -> Option<ContextType> {
        for (flag, ctx_type) in [
            (Self::INTERNET, ContextType::Internet),
            (Self::MMS, ContextType::Mms),
            (Self::WAP, ContextType::Wap),
            (Self::IMS, ContextType::Ims),
            (Self::SUPL, ContextType::Supl),
            (Self::IA, ContextType::Ia),
        ] {
            if self.contains(flag) {
                return Some(ctx_type);
            }
        }
        None
    }

    fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "internet" => Some(Self::INTERNET),
            "mms" => Some(Self::MMS),
            "wap" => Some(Self::WAP),
            "ims" => Some(Self::IMS),
            "supl" => Some(Self::SUPL),
            "ia" => Some(Self::IA),
            _ => None,
        }
    }
}

/// One provisioning template.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionEntry {
    /// Mobile country code the template applies to.
    pub mcc: String,
    /// Mobile network code the template applies to.
    pub mnc: String,
    /// Service provider name; absent templates match any SPN.
    #[serde(default)]
    pub spn: Option<String>,
    /// Context name.
    #[serde(default)]
    pub name: String,
    /// Access point name.
    pub apn: String,
    /// Context purposes; defaults to internet.
    #[serde(default)]
    pub types: Vec<String>,
    /// PDP type, defaults to IPv4.
    #[serde(default)]
    pub protocol: Option<String>,
    /// Username.
    #[serde(default)]
    pub username: String,
    /// Password.
    #[serde(default)]
    pub password: String,
    /// Authentication scheme, defaults to chap.
    #[serde(default)]
    pub auth_method: Option<String>,
    /// MMS proxy.
    #[serde(default)]
    pub message_proxy: String,
    /// MMS message center.
    #[serde(default)]
    pub message_center: String,
}

impl ProvisionEntry {
    /// Bitmask of the template's declared types.
    pub fn type_mask(&self) -> ContextTypeFlags {
        let mut mask = ContextTypeFlags::empty();
        for name in &self.types {
            if let Some(flag) = ContextTypeFlags::from_type_name(name) {
                mask |= flag;
            }
        }
        if mask.is_empty() {
            mask = ContextTypeFlags::INTERNET;
        }
        mask
    }

    /// PDP type with the database default applied.
    pub fn protocol(&self) -> Option<Protocol> {
        match self.protocol.as_deref() {
            Some(p) => Protocol::from_str(p),
            None => Some(Protocol::Ip),
        }
    }

    /// Authentication scheme with the database default applied.
    pub fn auth_method(&self) -> Option<AuthMethod> {
        match self.auth_method.as_deref() {
            Some(a) => AuthMethod::from_str(a),
            None => Some(AuthMethod::Chap),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ProvisionFile {
    #[serde(default)]
    entries: Vec<ProvisionEntry>,
}

/// Loaded provisioning database.
#[derive(Debug, Default)]
pub struct ProvisionDb {
    entries: Vec<ProvisionEntry>,
}

/// Failure to read the provisioning database file.
#[derive(Error, Debug)]
pub enum ProvisionDbError {
    /// The file could not be read.
    #[error("failed to read provisioning database: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid TOML.
    #[error("failed to parse provisioning database: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ProvisionDb {
    /// Load the database from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ProvisionDbError> {
        let text = fs::read_to_string(path)?;
        let file: ProvisionFile = toml::from_str(&text)?;
        Ok(Self {
            entries: file.entries,
        })
    }

    /// Database with no templates; every lookup comes back empty.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Templates matching the SIM identity. Templates carrying an SPN
    /// match only when it equals the SIM's; templates without one match
    /// any.
    pub fn lookup(&self, mcc: &str, mnc: &str, spn: Option<&str>) -> Vec<ProvisionEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.mcc == mcc && entry.mnc == mnc)
            .filter(|entry| match (&entry.spn, spn) {
                (Some(want), Some(have)) => want == have,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn db() -> ProvisionDb {
        let text = r#"
            [[entries]]
            mcc = "262"
            mnc = "02"
            name = "Internet"
            apn = "web.provider.com"
            types = ["internet"]

            [[entries]]
            mcc = "262"
            mnc = "02"
            name = "MMS"
            apn = "mms.provider.com"
            types = ["mms"]
            protocol = "ip"
            message_proxy = "http://mmsc.provider.com:8080"
            message_center = "http://mmsc.provider.com/mms"

            [[entries]]
            mcc = "262"
            mnc = "02"
            spn = "BrandX"
            name = "BrandX Internet"
            apn = "brandx.provider.com"
        "#;
        let file: ProvisionFile = toml::from_str(text).unwrap();
        ProvisionDb {
            entries: file.entries,
        }
    }

    #[test]
    fn lookup_matches_plmn() {
        let found = db().lookup("262", "02", None);
        assert_eq!(found.len(), 2);
        assert!(db().lookup("262", "03", None).is_empty());
    }

    #[test]
    fn lookup_honours_spn() {
        let found = db().lookup("262", "02", Some("BrandX"));
        assert_eq!(found.len(), 3);

        let found = db().lookup("262", "02", Some("Other"));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn lowest_set_bit_wins() {
        let mask = ContextTypeFlags::MMS | ContextTypeFlags::INTERNET;
        assert_eq!(mask.primary(), Some(ContextType::Internet));

        let mask = ContextTypeFlags::SUPL | ContextTypeFlags::IA;
        assert_eq!(mask.primary(), Some(ContextType::Supl));

        assert_eq!(ContextTypeFlags::empty().primary(), None);
    }

    #[test]
    fn entry_defaults() {
        let entry: ProvisionEntry = toml::from_str(
            r#"
            mcc = "310"
            mnc = "260"
            apn = "fast.t-mobile.com"
            "#,
        )
        .unwrap();

        assert_eq!(entry.type_mask(), ContextTypeFlags::INTERNET);
        assert_eq!(entry.protocol(), Some(Protocol::Ip));
        assert_eq!(entry.auth_method(), Some(AuthMethod::Chap));
    }
}
