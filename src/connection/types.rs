//! Enums and limits shared across the connection core.

use serde::{Deserialize, Serialize};

/// Longest accepted context name.
pub const MAX_CONTEXT_NAME_LENGTH: usize = 127;
/// Longest accepted access point name.
pub const MAX_APN_LENGTH: usize = 100;
/// Longest accepted username or password.
pub const MAX_CREDENTIAL_LENGTH: usize = 63;
/// Longest accepted MMS proxy string.
pub const MAX_MESSAGE_PROXY_LENGTH: usize = 255;
/// Longest accepted MMS message center string.
pub const MAX_MESSAGE_CENTER_LENGTH: usize = 255;
/// Number of assignable context path ids.
pub const MAX_CONTEXTS: u32 = 256;

/// Packet-domain (and mirrored circuit-domain) registration state.
///
/// Numeric codes follow the 27.007 `+CGREG` convention, with the two
/// SMS-over-EUTRAN variants appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// Not registered, not searching.
    NotRegistered = 0,
    /// Registered on the home network.
    Registered = 1,
    /// Not registered, searching for an operator.
    Searching = 2,
    /// Registration denied by the network.
    Denied = 3,
    /// State not known.
    Unknown = 4,
    /// Registered on a visited network.
    Roaming = 5,
    /// Registered at home, SMS only over EUTRAN.
    RegisteredSmsEutran = 6,
    /// Roaming, SMS only over EUTRAN.
    RoamingSmsEutran = 7,
}

impl RegistrationStatus {
    /// Convert from the wire representation.
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::NotRegistered,
            1 => Self::Registered,
            2 => Self::Searching,
            3 => Self::Denied,
            5 => Self::Roaming,
            6 => Self::RegisteredSmsEutran,
            7 => Self::RoamingSmsEutran,
            _ => Self::Unknown,
        }
    }

    /// Whether this state counts as registered for packet purposes.
    pub fn is_registered(self) -> bool {
        matches!(
            self,
            Self::Registered | Self::RegisteredSmsEutran | Self::Roaming | Self::RoamingSmsEutran
        )
    }

    /// Whether this state is a home-network registration.
    pub fn is_home(self) -> bool {
        matches!(self, Self::Registered | Self::RegisteredSmsEutran)
    }

    /// Whether this state is a roaming registration.
    pub fn is_roaming(self) -> bool {
        matches!(self, Self::Roaming | Self::RoamingSmsEutran)
    }
}

/// Radio technology currently carrying packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bearer {
    /// No packet bearer.
    #[default]
    None = 0,
    /// GPRS.
    Gprs = 1,
    /// EDGE (EGPRS).
    Edge = 2,
    /// UMTS.
    Umts = 3,
    /// HSUPA only.
    Hsupa = 4,
    /// HSDPA only.
    Hsdpa = 5,
    /// HSDPA and HSUPA.
    Hspa = 6,
    /// LTE (EPS).
    Lte = 7,
}

impl Bearer {
    /// Convert from the common numeric bearer code; unknown codes fall
    /// back to no bearer.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Gprs,
            2 => Self::Edge,
            3 => Self::Umts,
            4 => Self::Hsupa,
            5 => Self::Hsdpa,
            6 => Self::Hspa,
            7 => Self::Lte,
            _ => Self::None,
        }
    }

    /// Bus representation of the bearer.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gprs => "gprs",
            Self::Edge => "edge",
            Self::Umts => "umts",
            Self::Hsupa => "hsupa",
            Self::Hsdpa => "hsdpa",
            Self::Hspa => "hspa",
            Self::Lte => "lte",
        }
    }
}

/// Access technology as reported by registration updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTechnology {
    /// GSM / GSM compact / EGPRS.
    Gsm,
    /// UTRAN, with or without HSPA.
    Utran,
    /// EUTRAN (LTE).
    Eutran,
}

impl AccessTechnology {
    /// Convert from the 27.007 `<AcT>` code, if known.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 | 1 | 3 => Some(Self::Gsm),
            2 | 4 | 5 | 6 => Some(Self::Utran),
            7 => Some(Self::Eutran),
            _ => None,
        }
    }
}

/// Purpose of a primary context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    /// General internet connectivity.
    Internet,
    /// Multimedia messaging.
    Mms,
    /// WAP browsing.
    Wap,
    /// IMS signalling.
    Ims,
    /// Secure user-plane location.
    Supl,
    /// LTE initial-attach context.
    Ia,
}

impl ContextType {
    /// Bus and storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internet => "internet",
            Self::Mms => "mms",
            Self::Wap => "wap",
            Self::Ims => "ims",
            Self::Supl => "supl",
            Self::Ia => "ia",
        }
    }

    /// Parse the bus and storage representation.
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "internet" => Some(Self::Internet),
            "mms" => Some(Self::Mms),
            "wap" => Some(Self::Wap),
            "ims" => Some(Self::Ims),
            "supl" => Some(Self::Supl),
            "ia" => Some(Self::Ia),
            _ => None,
        }
    }

    /// Name given to contexts of this type created without one.
    pub fn default_name(self) -> &'static str {
        match self {
            Self::Internet => "Internet",
            Self::Mms => "MMS",
            Self::Wap => "WAP",
            Self::Ims => "IMS",
            Self::Supl => "SUPL",
            Self::Ia => "Initial Attach",
        }
    }
}

/// Context type accepted by a driver binding.
///
/// `Any` bindings accept every primary context as long as the driver
/// implements both activation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingType {
    /// Accept any primary context.
    Any,
    /// Accept only contexts of one type.
    Only(ContextType),
}

impl BindingType {
    /// Whether a context of `ctx_type` may use a binding of this type.
    pub fn accepts(self, ctx_type: ContextType) -> bool {
        match self {
            Self::Any => true,
            Self::Only(t) => t == ctx_type,
        }
    }
}

/// PDP type requested for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// IPv4 only.
    #[default]
    Ip,
    /// IPv6 only.
    Ipv6,
    /// Dual-stack IPv4v6.
    #[serde(rename = "ipv4v6")]
    Dual,
}

impl Protocol {
    /// Bus and storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Ipv6 => "ipv6",
            Self::Dual => "ipv4v6",
        }
    }

    /// Parse the bus and storage representation.
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "ip" => Some(Self::Ip),
            "ipv6" => Some(Self::Ipv6),
            "ipv4v6" => Some(Self::Dual),
            _ => None,
        }
    }

    /// Whether an IPv4 settings block is carried for this protocol.
    pub fn wants_ipv4(self) -> bool {
        matches!(self, Self::Ip | Self::Dual)
    }

    /// Whether an IPv6 settings block is carried for this protocol.
    pub fn wants_ipv6(self) -> bool {
        matches!(self, Self::Ipv6 | Self::Dual)
    }
}

/// Authentication scheme used when activating a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Challenge-handshake authentication.
    #[default]
    Chap,
    /// Plain password authentication.
    Pap,
    /// No authentication.
    None,
}

impl AuthMethod {
    /// Bus and storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chap => "chap",
            Self::Pap => "pap",
            Self::None => "none",
        }
    }

    /// Parse the bus and storage representation.
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "chap" => Some(Self::Chap),
            "pap" => Some(Self::Pap),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Why the packet service reported a suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendCause {
    /// The mobile detached from the packet service.
    Detached,
    /// A circuit-switched call pre-empted packet data.
    Call,
    /// Coverage was lost.
    NoCoverage,
    /// Signalling activity; often resolves by itself.
    Signalling,
    /// Cause not reported by the modem.
    Unknown,
}

impl SuspendCause {
    /// Whether this cause suspends immediately, without debounce.
    pub fn is_definite(self) -> bool {
        matches!(self, Self::Detached | Self::Call | Self::NoCoverage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_status_from_wire() {
        assert_eq!(RegistrationStatus::from_i32(1), RegistrationStatus::Registered);
        assert_eq!(RegistrationStatus::from_i32(5), RegistrationStatus::Roaming);
        assert_eq!(RegistrationStatus::from_i32(42), RegistrationStatus::Unknown);
        assert_eq!(RegistrationStatus::from_i32(-1), RegistrationStatus::Unknown);
    }

    #[test]
    fn registration_classification() {
        assert!(RegistrationStatus::Registered.is_home());
        assert!(RegistrationStatus::RegisteredSmsEutran.is_home());
        assert!(RegistrationStatus::Roaming.is_roaming());
        assert!(!RegistrationStatus::Searching.is_registered());
        assert!(RegistrationStatus::RoamingSmsEutran.is_registered());
    }

    #[test]
    fn context_type_round_trip() {
        for t in [
            ContextType::Internet,
            ContextType::Mms,
            ContextType::Wap,
            ContextType::Ims,
            ContextType::Supl,
            ContextType::Ia,
        ] {
            assert_eq!(ContextType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(ContextType::from_str("bogus"), None);
    }

    #[test]
    fn protocol_families() {
        assert!(Protocol::Ip.wants_ipv4());
        assert!(!Protocol::Ip.wants_ipv6());
        assert!(Protocol::Dual.wants_ipv4() && Protocol::Dual.wants_ipv6());
        assert_eq!(Protocol::from_str("ipv4v6"), Some(Protocol::Dual));
        assert_eq!(Protocol::Dual.as_str(), "ipv4v6");
    }

    #[test]
    fn binding_type_acceptance() {
        assert!(BindingType::Any.accepts(ContextType::Mms));
        assert!(BindingType::Only(ContextType::Mms).accepts(ContextType::Mms));
        assert!(!BindingType::Only(ContextType::Mms).accepts(ContextType::Internet));
    }
}
