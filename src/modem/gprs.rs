//! AT dialect packet-service driver.
//!
//! Probes the modem's packet capabilities, keeps the unsolicited
//! notification set subscribed and translates wire lines into the
//! semantic events the connection manager consumes.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{select_all, StreamExt};
use thiserror::Error;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::connection::driver::GprsDriver;
use crate::connection::error::DriverError;
use crate::connection::manager::EventSender;
use crate::connection::types::{RegistrationStatus, SuspendCause};

use super::result::AtResultLine;
use super::transport::{AtChannel, ChannelError};
use super::vendor::{
    cpsb_bearer, huawei_hcsq_bearer, huawei_mode_bearer, simcom_cnsmod_bearer, telit_psnt_bearer,
    ublox_ureg_bearer, EventReportStyle, Vendor,
};

/// The initial dialect probe failed; the packet service is unusable on
/// this modem and the core instance must be torn down.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The transport died mid-probe.
    #[error("transport failed during probe: {0}")]
    Channel(#[from] ChannelError),
    /// The modem lacks a required packet capability.
    #[error("packet service not supported: {0}")]
    Unsupported(&'static str),
}

/// Packet-service driver speaking the common AT dialect with vendor
/// overlays.
pub struct AtGprsDriver {
    channel: Arc<dyn AtChannel>,
    vendor: Vendor,
    events: EventSender,
    attached: AtomicBool,
    try_reattach: AtomicBool,
    last_auto_cid: AtomicI32,
}

impl std::fmt::Debug for AtGprsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtGprsDriver")
            .field("vendor", &self.vendor)
            .field("attached", &self.attached)
            .field("try_reattach", &self.try_reattach)
            .field("last_auto_cid", &self.last_auto_cid)
            .finish_non_exhaustive()
    }
}

impl AtGprsDriver {
    /// Probe the modem and bring up event reporting. On success the
    /// returned driver is already monitoring unsolicited events.
    pub async fn probe(
        channel: Arc<dyn AtChannel>,
        vendor: Vendor,
        events: EventSender,
    ) -> Result<Arc<Self>, ProbeError> {
        let (min, max) = Self::probe_context_range(channel.as_ref()).await?;
        events.set_cid_range(min, max);

        Self::probe_registration_reports(channel.as_ref()).await?;

        if !vendor.skips_cgauto() {
            let _ = channel.send("AT+CGAUTO=0", "").await;
        }

        Self::configure_event_reports(channel.as_ref(), vendor).await?;

        let driver = Arc::new(Self {
            channel,
            vendor,
            events,
            attached: AtomicBool::new(false),
            try_reattach: AtomicBool::new(false),
            last_auto_cid: AtomicI32::new(-1),
        });

        driver.clone().start_monitor().await;

        Ok(driver)
    }

    /// Query the supported context-id range; at least one IPv4-capable
    /// PDP type is required.
    async fn probe_context_range(channel: &dyn AtChannel) -> Result<(u32, u32), ProbeError> {
        let response = channel.send("AT+CGDCONT=?", "+CGDCONT:").await?;
        if !response.ok {
            return Err(ProbeError::Unsupported("context capability query failed"));
        }

        for line in &response.lines {
            let Some(mut scan) = AtResultLine::new(line, "+CGDCONT:") else {
                continue;
            };

            if !scan.open_list() {
                continue;
            }
            let Some((min, max)) = scan.next_range() else {
                continue;
            };
            scan.close_list();

            let in_list = scan.open_list();
            let Some(pdp_type) = scan.next_string() else {
                continue;
            };
            let pdp_type = pdp_type.to_string();
            if in_list {
                scan.close_list();
            }

            // We look for IP PDPs.
            if pdp_type == "IP" && min >= 0 && max >= min {
                return Ok((min as u32, max as u32));
            }
        }

        Err(ProbeError::Unsupported("no IPv4-capable PDP type"))
    }

    /// Pick the richest supported registration report mode.
    async fn probe_registration_reports(channel: &dyn AtChannel) -> Result<(), ProbeError> {
        let response = channel.send("AT+CGREG=?", "+CGREG:").await?;
        if !response.ok {
            return Err(ProbeError::Unsupported("registration capability query failed"));
        }

        let mut with_location = false;
        let mut basic = false;

        for line in &response.lines {
            let Some(mut scan) = AtResultLine::new(line, "+CGREG:") else {
                continue;
            };
            if !scan.open_list() {
                continue;
            }
            while let Some((min, max)) = scan.next_range() {
                if (min..=max).contains(&1) {
                    basic = true;
                }
                if (min..=max).contains(&2) {
                    with_location = true;
                }
            }
        }

        let command = if with_location {
            "AT+CGREG=2"
        } else if basic {
            "AT+CGREG=1"
        } else {
            return Err(ProbeError::Unsupported("no usable registration reports"));
        };

        let _ = channel.send(command, "").await;
        Ok(())
    }

    /// Configure packet-event reporting, tolerating vendors that accept
    /// only one argument or reject specific combinations.
    async fn configure_event_reports(
        channel: &dyn AtChannel,
        vendor: Vendor,
    ) -> Result<(), ProbeError> {
        if let EventReportStyle::Fixed(command) = vendor.event_report_style() {
            let _ = channel.send(command, "").await;
            return Ok(());
        }

        let response = channel.send("AT+CGEREP=?", "+CGEREP:").await?;
        if !response.ok {
            return Err(ProbeError::Unsupported("event report query failed"));
        }

        let line = response
            .lines
            .first()
            .ok_or(ProbeError::Unsupported("empty event report reply"))?;
        let mut scan = AtResultLine::new(line, "+CGEREP:")
            .ok_or(ProbeError::Unsupported("malformed event report reply"))?;

        if !scan.open_list() {
            return Err(ProbeError::Unsupported("malformed event report reply"));
        }

        let mut mode = 0;
        while let Some((min, max)) = scan.next_range() {
            if (min..=max).contains(&1) && mode < 1 {
                mode = 1;
            }
            if (min..=max).contains(&2) {
                mode = 2;
            }
        }
        scan.close_list();

        let command = if scan.open_list() {
            let mut buffered = 0;
            while let Some((min, max)) = scan.next_range() {
                if (min..=max).contains(&1) {
                    buffered = 1;
                }
            }
            format!("AT+CGEREP={mode},{buffered}")
        } else {
            format!("AT+CGEREP={mode}")
        };

        let _ = channel.send(&command, "").await;
        Ok(())
    }

    /// Subscribe the vendor's notification set, enable the matching
    /// reports and spawn the monitoring task.
    async fn start_monitor(self: Arc<Self>) {
        let mut prefixes = vec!["+CGEV:", "+CGREG:"];

        match self.vendor {
            Vendor::Huawei => prefixes.extend(["^MODE:", "^HCSQ:"]),
            Vendor::Ublox => prefixes.push("+UREG:"),
            Vendor::Telit => prefixes.push("#PSNT:"),
            Vendor::SimcomA76xx => prefixes.push("+CNSMOD:"),
            _ => prefixes.push("+CPSB:"),
        }
        if self.vendor == Vendor::Ifx {
            prefixes.push("+XDATASTAT:");
        }

        let streams: Vec<_> = prefixes
            .into_iter()
            .map(|prefix| {
                UnboundedReceiverStream::new(self.channel.subscribe(prefix))
                    .map(move |line| (prefix, line))
                    .boxed()
            })
            .collect();

        match self.vendor {
            Vendor::Ublox => {
                let _ = self.channel.send("AT+UREG=1", "").await;
            }
            Vendor::Telit => {
                let _ = self.channel.send("AT#PSNT=1", "").await;
            }
            Vendor::SimcomA76xx => {
                let _ = self.channel.send("AT+CNSMOD=1", "").await;
            }
            Vendor::Huawei => {}
            _ => {
                let _ = self.channel.send("AT+CPSB=1", "").await;
            }
        }
        if self.vendor == Vendor::Ifx {
            let _ = self.channel.send("AT+XDATASTAT=1", "").await;
        }

        tokio::spawn(async move {
            let mut lines = select_all(streams);
            while let Some((prefix, line)) = lines.next().await {
                self.handle_line(prefix, &line).await;
            }
            self.events.modem_lost();
        });
    }

    async fn handle_line(&self, prefix: &str, line: &str) {
        match prefix {
            "+CGREG:" => self.handle_registration(line).await,
            "+CGEV:" => self.handle_packet_event(line).await,
            "^MODE:" => {
                let Some(mut scan) = AtResultLine::new(line, "^MODE:") else {
                    return;
                };
                let Some(_mode) = scan.next_number() else { return };
                let Some(submode) = scan.next_number() else { return };
                self.events.bearer_notify(huawei_mode_bearer(submode));
            }
            "^HCSQ:" => {
                let Some(mut scan) = AtResultLine::new(line, "^HCSQ:") else {
                    return;
                };
                let Some(mode) = scan.next_string() else { return };
                if let Some(bearer) = huawei_hcsq_bearer(mode) {
                    self.events.bearer_notify(bearer);
                }
            }
            "#PSNT:" => {
                let Some(mut scan) = AtResultLine::new(line, "#PSNT:") else {
                    return;
                };
                let Some(network_type) = scan.next_number() else { return };
                self.events.bearer_notify(telit_psnt_bearer(network_type));
            }
            "+CNSMOD:" => {
                let Some(mut scan) = AtResultLine::new(line, "+CNSMOD:") else {
                    return;
                };
                let Some(state) = scan.next_number() else { return };
                self.events.bearer_notify(simcom_cnsmod_bearer(state));
            }
            "+UREG:" => {
                let Some(mut scan) = AtResultLine::new(line, "+UREG:") else {
                    return;
                };
                let Some(state) = scan.next_number() else { return };
                self.events.bearer_notify(ublox_ureg_bearer(state));
            }
            "+CPSB:" => {
                let Some(mut scan) = AtResultLine::new(line, "+CPSB:") else {
                    return;
                };
                let Some(_n) = scan.next_number() else { return };
                let Some(code) = scan.next_number() else { return };
                self.events.bearer_notify(cpsb_bearer(code));
            }
            "+XDATASTAT:" => {
                let Some(mut scan) = AtResultLine::new(line, "+XDATASTAT:") else {
                    return;
                };
                // An unreadable state field means no state change.
                let Some(state) = scan.next_number() else { return };
                match state {
                    0 => self.events.suspend_notify(SuspendCause::Unknown),
                    1 => self.events.resume_notify(),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    async fn handle_registration(&self, line: &str) {
        let Some(mut scan) = AtResultLine::new(line, "+CGREG:") else {
            return;
        };
        let Some(status) = scan.next_number() else {
            return;
        };

        // Some firmware drops to unregistered after a context teardown
        // and re-registers much later on its own. One silent re-attach
        // request brings the registration right back when the network is
        // still there.
        if self.vendor.reattaches_after_spurious_detach() {
            if self.attached.load(Ordering::SeqCst)
                && status == 0
                && !self.try_reattach.load(Ordering::SeqCst)
            {
                debug!("trying to re-attach packet service");
                self.try_reattach.store(true, Ordering::SeqCst);
                let _ = self.channel.send("AT+CGATT=1", "").await;
                return;
            }

            self.try_reattach.store(false, Ordering::SeqCst);
        }

        self.events
            .status_notify(RegistrationStatus::from_i32(status));
    }

    async fn handle_packet_event(&self, line: &str) {
        let Some(scan) = AtResultLine::new(line, "+CGEV:") else {
            return;
        };
        let event = scan.remainder();

        if event == "NW DETACH" || event == "ME DETACH" {
            if self.vendor.reattaches_after_spurious_detach()
                && self.try_reattach.load(Ordering::SeqCst)
            {
                return;
            }

            self.attached.store(false, Ordering::SeqCst);
            self.events.detached_notify();
        } else if let Some(rest) = event.strip_prefix("ME PDN ACT") {
            let Ok(cid) = rest.trim().parse::<i32>() else {
                return;
            };
            self.last_auto_cid.store(cid, Ordering::SeqCst);
            self.refresh_auto_context().await;
        } else if let Some(rest) = event.strip_prefix("ME PDN DEACT") {
            if let Ok(cid) = rest.trim().parse::<i32>() {
                // This cid is not activated anymore.
                let _ = self.last_auto_cid.compare_exchange(
                    cid,
                    -1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }
    }

    /// Read the context definitions back and report the auto-activated
    /// one upward.
    async fn refresh_auto_context(&self) {
        let response = match self.channel.send("AT+CGDCONT?", "+CGDCONT:").await {
            Ok(response) if response.ok => response,
            _ => {
                warn!("cannot read context definitions");
                return;
            }
        };

        let activated = self.last_auto_cid.load(Ordering::SeqCst);
        if activated == -1 {
            debug!("context deactivated while reading definitions");
            return;
        }

        self.report_definitions(&response.lines, &[activated]);
    }

    fn report_definitions(&self, lines: &[String], cids: &[i32]) {
        for line in lines {
            let Some(mut scan) = AtResultLine::new(line, "+CGDCONT:") else {
                continue;
            };
            let Some(cid) = scan.next_number() else {
                continue;
            };
            if !cids.contains(&cid) {
                continue;
            }

            // Skip the PDP type.
            scan.skip_next();

            match scan.next_string() {
                Some(apn) => self.events.cid_activated(cid as u32, apn),
                None => warn!(cid, "context activated but no apn present"),
            }
        }
    }
}

#[async_trait]
impl GprsDriver for AtGprsDriver {
    async fn set_attached(&self, attached: bool) -> Result<(), DriverError> {
        self.attached.store(attached, Ordering::SeqCst);

        let command = if attached { "AT+CGATT=1" } else { "AT+CGATT=0" };
        let response = self
            .channel
            .send(command, "")
            .await
            .map_err(|_| DriverError::failure())?;
        response.check()
    }

    fn supports_attached_status(&self) -> bool {
        true
    }

    async fn attached_status(&self) -> Result<RegistrationStatus, DriverError> {
        let response = self
            .channel
            .send("AT+CGREG?", "+CGREG:")
            .await
            .map_err(|_| DriverError::failure())?;
        response.check()?;

        let line = response.lines.first().ok_or_else(DriverError::failure)?;
        let mut scan =
            AtResultLine::new(line, "+CGREG:").ok_or_else(DriverError::failure)?;

        // The solicited reply carries the report mode first.
        scan.next_number();
        let status = scan.next_number().ok_or_else(DriverError::failure)?;

        Ok(RegistrationStatus::from_i32(status))
    }

    fn supports_list_active_contexts(&self) -> bool {
        true
    }

    async fn list_active_contexts(&self) -> Result<(), DriverError> {
        let response = self
            .channel
            .send("AT+CGACT?", "+CGACT:")
            .await
            .map_err(|_| DriverError::failure())?;
        response.check()?;

        let mut active = Vec::new();
        for line in &response.lines {
            let Some(mut scan) = AtResultLine::new(line, "+CGACT:") else {
                continue;
            };
            let Some(cid) = scan.next_number() else { continue };
            let Some(state) = scan.next_number() else { continue };

            if state != 1 {
                continue;
            }

            // Obviously active already, so flag it as the auto context.
            let _ = self.last_auto_cid.compare_exchange(
                -1,
                cid,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            active.push(cid);
        }

        if active.is_empty() {
            return Ok(());
        }

        let definitions = self
            .channel
            .send("AT+CGDCONT?", "+CGDCONT:")
            .await
            .map_err(|_| DriverError::failure())?;
        definitions.check()?;

        self.report_definitions(&definitions.lines, &active);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use crate::connection::manager::{ManagerChannel, ManagerEvent};
    use crate::connection::types::Bearer;
    use crate::modem::testutil::MockChannel;

    async fn probe_with(
        channel: Arc<MockChannel>,
        vendor: Vendor,
    ) -> (
        Arc<AtGprsDriver>,
        tokio::sync::mpsc::UnboundedReceiver<crate::connection::manager::Input>,
    ) {
        let (events, rx) = ManagerChannel::new().split();
        let driver = AtGprsDriver::probe(channel, vendor, events).await.unwrap();
        (driver, rx)
    }

    async fn next_event(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<crate::connection::manager::Input>,
    ) -> ManagerEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
            .into_event()
            .expect("expected an event")
    }

    fn capable_channel() -> Arc<MockChannel> {
        let channel = MockChannel::new();
        channel.script("AT+CGDCONT=?", &["+CGDCONT: (1-16),\"IP\",,,,(0-2),(0-4)"]);
        channel.script("AT+CGREG=?", &["+CGREG: (0-2)"]);
        channel.script("AT+CGEREP=?", &["+CGEREP: (0-2),(0-1)"]);
        Arc::new(channel)
    }

    #[tokio::test]
    async fn probe_negotiates_reports() {
        let channel = capable_channel();
        let (_driver, mut rx) = probe_with(channel.clone(), Vendor::Generic).await;

        match next_event(&mut rx).await {
            ManagerEvent::SetCidRange { min, max } => {
                assert_eq!((min, max), (1, 16));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let sent = channel.sent();
        assert!(sent.contains(&"AT+CGREG=2".to_string()));
        assert!(sent.contains(&"AT+CGAUTO=0".to_string()));
        assert!(sent.contains(&"AT+CGEREP=2,1".to_string()));
        assert!(sent.contains(&"AT+CPSB=1".to_string()));
    }

    #[tokio::test]
    async fn probe_fails_without_ipv4_pdp() {
        let channel = MockChannel::new();
        channel.script("AT+CGDCONT=?", &["+CGDCONT: (1-16),\"PPP\""]);
        let (events, _rx) = ManagerChannel::new().split();

        let err = AtGprsDriver::probe(Arc::new(channel), Vendor::Generic, events)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Unsupported(_)));
    }

    #[tokio::test]
    async fn probe_respects_vendor_event_report_quirks() {
        let channel = capable_channel();
        let (_driver, _rx) = probe_with(channel.clone(), Vendor::Mbm).await;

        let sent = channel.sent();
        assert!(sent.contains(&"AT+CGEREP=1,0".to_string()));
        assert!(!sent.contains(&"AT+CGEREP=?".to_string()));

        let channel = capable_channel();
        let (_driver, _rx) = probe_with(channel.clone(), Vendor::Nokia).await;
        assert!(channel.sent().contains(&"AT+CGEREP=1".to_string()));
    }

    #[tokio::test]
    async fn simcom_leaves_auto_answer_alone() {
        let channel = capable_channel();
        let (_driver, _rx) = probe_with(channel.clone(), Vendor::SimcomA76xx).await;

        let sent = channel.sent();
        assert!(!sent.contains(&"AT+CGAUTO=0".to_string()));
        assert!(sent.contains(&"AT+CNSMOD=1".to_string()));
    }

    #[tokio::test]
    async fn registration_updates_are_forwarded() {
        let channel = capable_channel();
        let (_driver, mut rx) = probe_with(channel.clone(), Vendor::Generic).await;
        next_event(&mut rx).await; // cid range

        channel.inject("+CGREG: 1,\"00AF\",\"001F0012\",7");

        match next_event(&mut rx).await {
            ManagerEvent::StatusNotify(status) => {
                assert_eq!(status, RegistrationStatus::Registered);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn spurious_detach_triggers_one_silent_reattach() {
        let channel = capable_channel();
        let (driver, mut rx) = probe_with(channel.clone(), Vendor::Telit).await;
        next_event(&mut rx).await; // cid range

        driver.set_attached(true).await.unwrap();
        let baseline = channel.sent_count("AT+CGATT=1");

        // First spurious drop: exactly one silent re-attach, no status
        // event reaches the manager.
        channel.inject("+CGREG: 0");
        channel.wait_sent_count("AT+CGATT=1", baseline + 1).await;

        // The detach event that accompanies the drop is swallowed too.
        channel.inject("+CGEV: NW DETACH");

        // A second drop without an intervening recovery is the real
        // thing: no further re-attach, the status goes through.
        channel.inject("+CGREG: 0");
        match next_event(&mut rx).await {
            ManagerEvent::StatusNotify(status) => {
                assert_eq!(status, RegistrationStatus::NotRegistered);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(channel.sent_count("AT+CGATT=1"), baseline + 1);
    }

    #[tokio::test]
    async fn detach_events_are_forwarded() {
        let channel = capable_channel();
        let (_driver, mut rx) = probe_with(channel.clone(), Vendor::Generic).await;
        next_event(&mut rx).await; // cid range

        channel.inject("+CGEV: NW DETACH");
        assert!(matches!(
            next_event(&mut rx).await,
            ManagerEvent::DetachedNotify
        ));
    }

    #[tokio::test]
    async fn pdn_activation_reports_the_context() {
        let channel = capable_channel();
        channel.script(
            "AT+CGDCONT?",
            &[
                "+CGDCONT: 1,\"IP\",\"internet\",\"\",0,0",
                "+CGDCONT: 5,\"IP\",\"ims\",\"\",0,0",
            ],
        );
        let (_driver, mut rx) = probe_with(channel.clone(), Vendor::Generic).await;
        next_event(&mut rx).await; // cid range

        channel.inject("+CGEV: ME PDN ACT 5");

        match next_event(&mut rx).await {
            ManagerEvent::CidActivated { cid, apn } => {
                assert_eq!(cid, 5);
                assert_eq!(apn, "ims");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn vendor_bearer_lines_are_translated() {
        let channel = capable_channel();
        let (_driver, mut rx) = probe_with(channel.clone(), Vendor::Huawei).await;
        next_event(&mut rx).await; // cid range

        channel.inject("^MODE: 5,7");
        match next_event(&mut rx).await {
            ManagerEvent::BearerNotify(bearer) => assert_eq!(bearer, Bearer::Hspa),
            other => panic!("unexpected event {other:?}"),
        }

        channel.inject("^HCSQ: \"LTE\",46");
        match next_event(&mut rx).await {
            ManagerEvent::BearerNotify(bearer) => assert_eq!(bearer, Bearer::Lte),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn ifx_data_status_drives_suspension() {
        let channel = capable_channel();
        let (_driver, mut rx) = probe_with(channel.clone(), Vendor::Ifx).await;
        next_event(&mut rx).await; // cid range

        channel.inject("+XDATASTAT: 0");
        assert!(matches!(
            next_event(&mut rx).await,
            ManagerEvent::SuspendNotify(SuspendCause::Unknown)
        ));

        channel.inject("+XDATASTAT: 1");
        assert!(matches!(
            next_event(&mut rx).await,
            ManagerEvent::ResumeNotify
        ));

        // An unreadable state field causes no state change.
        channel.inject("+XDATASTAT:");
        channel.inject("+XDATASTAT: 1");
        assert!(matches!(
            next_event(&mut rx).await,
            ManagerEvent::ResumeNotify
        ));
    }

    #[tokio::test]
    async fn attached_status_skips_the_report_mode() {
        let channel = capable_channel();
        channel.script("AT+CGREG?", &["+CGREG: 2,5"]);
        let (driver, _rx) = probe_with(channel.clone(), Vendor::Generic).await;

        let status = driver.attached_status().await.unwrap();
        assert_eq!(status, RegistrationStatus::Roaming);
    }

    #[tokio::test]
    async fn active_context_scan_reports_each_active_cid() {
        let channel = capable_channel();
        channel.script("AT+CGACT?", &["+CGACT: 3,1", "+CGACT: 4,0"]);
        channel.script(
            "AT+CGDCONT?",
            &[
                "+CGDCONT: 3,\"IP\",\"internet\",\"\",0,0",
                "+CGDCONT: 4,\"IP\",\"other\",\"\",0,0",
            ],
        );
        let (driver, mut rx) = probe_with(channel.clone(), Vendor::Generic).await;
        next_event(&mut rx).await; // cid range

        driver.list_active_contexts().await.unwrap();

        match next_event(&mut rx).await {
            ManagerEvent::CidActivated { cid, apn } => {
                assert_eq!(cid, 3);
                assert_eq!(apn, "internet");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
