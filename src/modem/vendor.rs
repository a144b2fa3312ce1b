//! Vendor dialect tables.
//!
//! The packet dialect is common 27.007; vendors differ in the bearer
//! notifications they emit, the event-report flavours they accept and a
//! couple of behavioural quirks. All per-vendor knowledge lives here.

use crate::connection::types::Bearer;

/// Modem vendor dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Vendor {
    /// Plain 27.007 modem.
    #[default]
    Generic,
    /// Huawei data cards.
    Huawei,
    /// Telit modules.
    Telit,
    /// SIMCom A76xx series.
    SimcomA76xx,
    /// u-blox modules.
    Ublox,
    /// Intel IFX baseband.
    Ifx,
    /// Ericsson MBM and ST-E data cards.
    Mbm,
    /// Nokia data cards.
    Nokia,
}

/// How packet-event reporting is configured at probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReportStyle {
    /// Query `+CGEREP=?` and pick the richest supported combination.
    Negotiate,
    /// Known-good fixed setting; the vendor rejects the query result.
    Fixed(&'static str),
}

impl Vendor {
    /// Parse a vendor name as given on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "generic" => Some(Self::Generic),
            "huawei" => Some(Self::Huawei),
            "telit" => Some(Self::Telit),
            "simcom-a76xx" => Some(Self::SimcomA76xx),
            "ublox" => Some(Self::Ublox),
            "ifx" => Some(Self::Ifx),
            "mbm" => Some(Self::Mbm),
            "nokia" => Some(Self::Nokia),
            _ => None,
        }
    }

    /// Event-report configuration for this vendor.
    pub fn event_report_style(self) -> EventReportStyle {
        match self {
            // MBM and ST-E modems reject +CGEREP=2,1.
            Self::Mbm => EventReportStyle::Fixed("AT+CGEREP=1,0"),
            // Nokia data cards accept only the one-argument form.
            Self::Nokia => EventReportStyle::Fixed("AT+CGEREP=1"),
            _ => EventReportStyle::Negotiate,
        }
    }

    /// Whether auto-answering of context activation requests is left
    /// alone at probe.
    pub fn skips_cgauto(self) -> bool {
        self == Self::SimcomA76xx
    }

    /// Whether a spurious detach is answered with a single silent
    /// re-attach request.
    pub fn reattaches_after_spurious_detach(self) -> bool {
        self == Self::Telit
    }
}

/// Bearer from a Huawei `^MODE` sub-mode.
pub fn huawei_mode_bearer(submode: i32) -> Bearer {
    match submode {
        1 | 2 => Bearer::Gprs,
        3 => Bearer::Edge,
        4 => Bearer::Umts,
        5 => Bearer::Hsdpa,
        6 => Bearer::Hsupa,
        7 | 9 => Bearer::Hspa,
        _ => Bearer::None,
    }
}

/// Bearer from a Huawei `^HCSQ` mode; only LTE is reported here, the
/// other modes use `^MODE`.
pub fn huawei_hcsq_bearer(mode: &str) -> Option<Bearer> {
    (mode == "LTE").then_some(Bearer::Lte)
}

/// Bearer from a Telit `#PSNT` network type.
pub fn telit_psnt_bearer(network_type: i32) -> Bearer {
    match network_type {
        0 => Bearer::Gprs,
        1 => Bearer::Edge,
        2 => Bearer::Umts,
        3 => Bearer::Hsdpa,
        4 => Bearer::Lte,
        _ => Bearer::None,
    }
}

/// Bearer from a SIMCom `+CNSMOD` state.
pub fn simcom_cnsmod_bearer(state: i32) -> Bearer {
    match state {
        1 | 2 => Bearer::Gprs,
        3 => Bearer::Edge,
        4 => Bearer::Umts,
        5 => Bearer::Hsdpa,
        6 => Bearer::Hsupa,
        7 => Bearer::Hspa,
        8 => Bearer::Lte,
        _ => Bearer::None,
    }
}

/// Bearer from a u-blox `+UREG` state.
pub fn ublox_ureg_bearer(state: i32) -> Bearer {
    match state {
        4 => Bearer::Hsdpa,
        5 => Bearer::Hsupa,
        8 => Bearer::Gprs,
        9 => Bearer::Edge,
        other => Bearer::from_code(other),
    }
}

/// Bearer from the generic `+CPSB` report, which carries the common
/// bearer code directly.
pub fn cpsb_bearer(code: i32) -> Bearer {
    Bearer::from_code(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_maps_are_total() {
        for value in -16..32 {
            huawei_mode_bearer(value);
            telit_psnt_bearer(value);
            simcom_cnsmod_bearer(value);
            ublox_ureg_bearer(value);
            cpsb_bearer(value);
        }
    }

    #[test]
    fn unknown_inputs_map_to_none() {
        assert_eq!(huawei_mode_bearer(42), Bearer::None);
        assert_eq!(telit_psnt_bearer(-3), Bearer::None);
        assert_eq!(simcom_cnsmod_bearer(99), Bearer::None);
        assert_eq!(cpsb_bearer(99), Bearer::None);
        assert_eq!(huawei_hcsq_bearer("WCDMA"), None);
    }

    #[test]
    fn known_mappings() {
        assert_eq!(huawei_mode_bearer(7), Bearer::Hspa);
        assert_eq!(huawei_hcsq_bearer("LTE"), Some(Bearer::Lte));
        assert_eq!(telit_psnt_bearer(4), Bearer::Lte);
        assert_eq!(simcom_cnsmod_bearer(8), Bearer::Lte);
        assert_eq!(ublox_ureg_bearer(4), Bearer::Hsdpa);
        assert_eq!(ublox_ureg_bearer(5), Bearer::Hsupa);
        assert_eq!(ublox_ureg_bearer(3), Bearer::Umts);
        assert_eq!(cpsb_bearer(3), Bearer::Umts);
    }

    #[test]
    fn vendor_quirk_tables() {
        assert_eq!(
            Vendor::Mbm.event_report_style(),
            EventReportStyle::Fixed("AT+CGEREP=1,0")
        );
        assert_eq!(
            Vendor::Nokia.event_report_style(),
            EventReportStyle::Fixed("AT+CGEREP=1")
        );
        assert_eq!(Vendor::Generic.event_report_style(), EventReportStyle::Negotiate);
        assert!(Vendor::SimcomA76xx.skips_cgauto());
        assert!(!Vendor::Generic.skips_cgauto());
        assert!(Vendor::Telit.reattaches_after_spurious_detach());
        assert_eq!(Vendor::from_name("huawei"), Some(Vendor::Huawei));
        assert_eq!(Vendor::from_name("unknown"), None);
    }
}
