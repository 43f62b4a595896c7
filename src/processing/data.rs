//! Data uplink pipeline.

use super::{
    finalize, BackgroundTasks, DownlinkSummary, DownstreamSkip, FailedReason, FrameKind, ProcessingResult,
    ProcessingSummary, Services,
};
use crate::adr::{AdrOutcome, AdrRequest};
use crate::config::{DeduplicationStrategy, DeviceClass};
use crate::dedup::{DedupKey, DedupResult};
use crate::downlink::{AppDisposition, DownlinkContext, DownlinkError};
use crate::fcnt::{infer_fcnt32, MAX_FCNT_GAP};
use crate::logging::{log_device_debug, log_device_info, log_device_warn};
use crate::lorawan::crypto::crypt_frm_payload;
use crate::lorawan::mac::parse_uplink_commands;
use crate::lorawan::{DataFrame, DevAddr, Direction, DownlinkMacCommand, SessionKeys, UplinkMacCommand};
use crate::session::DeviceSession;
use crate::timing::OperationTimeWatcher;
use crate::transport::{ApplicationDownlink, Telemetry, UplinkRequest};
use log::{debug, info, warn};
use std::sync::Arc;

/// Process one data uplink for `session`. Runs on the session's queue.
pub(crate) async fn process_data_uplink(
    services: Arc<Services>,
    session: Arc<DeviceSession>,
    frame: DataFrame,
    uplink: UplinkRequest,
) -> ProcessingResult {
    let mut background = BackgroundTasks::default();
    let pipeline = DataPipeline {
        services: &services,
        session: &session,
        frame: &frame,
        uplink: &uplink,
    };
    let result = pipeline.run(&mut background).await;
    finalize(&services, &session, background).await;

    match &result {
        Ok(summary) => log_device_debug(
            session.dev_eui(),
            &format!("uplink {:?} processed, dedup {:?}", summary.fcnt_up, summary.dedup),
        ),
        Err(reason) => log_device_info(session.dev_eui(), &format!("uplink {} dropped: {reason}", frame.fcnt)),
    }
    result
}

/// How the counter check classified the uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterCheck {
    /// New uplink, FCntUp advances
    Advance,
    /// Report of an uplink already accepted through another station
    SoftDuplicate,
    /// The device repeated a confirmed uplink it got no ACK for
    ConfirmedResubmit,
}

struct DataPipeline<'a> {
    services: &'a Services,
    session: &'a DeviceSession,
    frame: &'a DataFrame,
    uplink: &'a UplinkRequest,
}

impl DataPipeline<'_> {
    async fn run(&self, background: &mut BackgroundTasks) -> ProcessingResult {
        let services = self.services;
        let session = self.session;
        let frame = self.frame;
        let uplink = self.uplink;
        let dev_eui = session.dev_eui();

        session.set_region(Arc::clone(&uplink.region));
        let (Some(dev_addr), Some(keys)) = (session.dev_addr(), session.keys()) else {
            return Err(FailedReason::DeviceNotJoined);
        };
        let watcher = OperationTimeWatcher::new(uplink.region.window_delays(), uplink.received_at)
            .with_rx_delay(session.provision().rx_delay);

        // An ABP device without persisted counters restarts from 0 or 1. Just
        // past a 16-bit rollover the inferred counter is the one that verifies.
        let last_up = session.fcnt_up();
        let wire = u32::from(frame.fcnt);
        let inferred = infer_fcnt32(last_up, frame.fcnt);
        let restart = session.is_abp_relaxed() && frame.fcnt <= 1 && last_up > wire;
        let newly_started = restart && (inferred == wire || !frame.verify_mic(&keys.nwk_s_key, inferred));
        let fcnt_up = if newly_started { wire } else { inferred };
        if !frame.verify_mic(&keys.nwk_s_key, fcnt_up) {
            return Err(FailedReason::InvalidMic);
        }

        let dedup = services.deduplicator.check(
            DedupKey::Data {
                dev_eui,
                fcnt: fcnt_up,
                mic: frame.mic,
            },
            uplink.station,
            watcher.last_window_deadline(false),
        );
        if dedup == DedupResult::Duplicate {
            return Err(FailedReason::DeduplicationDrop);
        }

        if newly_started && dedup == DedupResult::NotDuplicate {
            log_device_info(dev_eui, &format!("restarted at fcnt {fcnt_up}, resetting counters"));
            session.strategy().reset(session).await;
            services.adr.reset(dev_eui).await;
        }

        let check = self.check_counter(fcnt_up, newly_started, dedup)?;

        let mut skip = if !(services.config.downlink_enabled && session.provision().downlink_enabled) {
            Some(DownstreamSkip::DownlinkDisabled)
        } else if dedup == DedupResult::SoftDuplicate {
            Some(DownstreamSkip::SoftDuplicate)
        } else {
            None
        };

        // Settings that cannot reach the device are not computed
        let adr = if frame.adr() {
            let request = AdrRequest {
                fcnt_up,
                snr: uplink.snr,
                station: uplink.station,
                data_rate: uplink.data_rate,
                compute: frame.adr_ack_requested() && skip.is_none(),
            };
            Some(services.adr.process(request, session).await)
        } else {
            None
        };

        let decrypted = self.decrypt(&keys, dev_addr, fcnt_up);
        let commands = match frame.fport {
            Some(0) => decrypted.as_deref().map(parse_uplink_commands).unwrap_or_default(),
            _ => parse_uplink_commands(&frame.fopts),
        };
        let mac_answers = self.answer_mac_commands(&commands);

        let reply_owed =
            frame.is_confirmed() || adr.is_some_and(|a| a.can_confirm) || !mac_answers.is_empty();

        let mut fcnt_down = adr.map_or(0, |a| a.reserved_fcnt_down);
        if reply_owed && skip.is_none() && fcnt_down == 0 {
            fcnt_down = session.strategy().next_down(session, fcnt_up, uplink.station).await;
            if fcnt_down == 0 {
                if services.deduplicator.strategy() == DeduplicationStrategy::Drop {
                    session.release_connection();
                    return Err(FailedReason::HandledByAnotherGateway);
                }
                skip = Some(DownstreamSkip::ReservationLost);
            }
        }

        let (decoded, embedded_reply) = self.decode(decrypted.as_deref());
        let delivered_upstream = check != CounterCheck::ConfirmedResubmit;
        if delivered_upstream {
            let telemetry = Telemetry {
                dev_eui,
                dev_addr,
                fcnt: fcnt_up,
                fport: frame.fport,
                raw: decrypted.as_deref().map(hex::encode_upper),
                decoded,
                station: uplink.station,
                frequency: uplink.frequency,
                data_rate: uplink.data_rate,
                snr: uplink.snr,
                received_at: uplink.received_at_utc,
                dup_msg: (dedup == DedupResult::SoftDuplicate
                    && services.deduplicator.strategy() == DeduplicationStrategy::Mark)
                    .then_some(true),
            };
            if let Err(e) = services.upstream.deliver(telemetry).await {
                log_device_warn(dev_eui, &format!("upstream delivery of fcnt {fcnt_up} failed: {e}"));
                return Err(FailedReason::UpstreamDeliveryProblem);
            }
        }

        if check == CounterCheck::Advance {
            session.set_up(fcnt_up);
        }
        session.set_preferred_station(uplink.station);

        if skip.is_none() && session.class() != DeviceClass::C && !watcher.in_time_for_any_window() {
            log_device_debug(dev_eui, "too late for any receive window, skipping downlink");
            skip = Some(DownstreamSkip::WindowMissed);
        }

        let mut downlink = None;
        if skip.is_none() {
            let step = DownlinkStep {
                pipeline: self,
                watcher: &watcher,
                dev_addr,
                keys: &keys,
                fcnt_up,
                reply_owed,
                mac_answers: &mac_answers,
                adr: adr.as_ref(),
            };
            match step.run(fcnt_down, embedded_reply, background).await {
                Ok(sent) => downlink = sent,
                Err(reason) => skip = Some(reason),
            }
        }
        if downlink.is_none() && skip.is_none() {
            skip = Some(DownstreamSkip::NotNeeded);
        }

        Ok(ProcessingSummary {
            dev_eui,
            kind: FrameKind::Data,
            station: uplink.station,
            fcnt_up: Some(fcnt_up),
            dedup,
            delivered_upstream,
            adr,
            downlink,
            downstream_skipped: skip,
        })
    }

    fn check_counter(&self, fcnt_up: u32, newly_started: bool, dedup: DedupResult) -> Result<CounterCheck, FailedReason> {
        let session = self.session;
        let current = session.fcnt_up();

        if newly_started || (session.counters_fresh() && fcnt_up >= current) {
            return Ok(CounterCheck::Advance);
        }
        if fcnt_up > current {
            if fcnt_up - current > MAX_FCNT_GAP {
                log_device_warn(
                    session.dev_eui(),
                    &format!("fcnt {fcnt_up} is too far ahead of {current}"),
                );
                return Err(FailedReason::InvalidFrameCounter);
            }
            return Ok(CounterCheck::Advance);
        }
        if dedup == DedupResult::SoftDuplicate {
            return Ok(CounterCheck::SoftDuplicate);
        }
        if fcnt_up == current && self.frame.is_confirmed() {
            let max = self.services.config.max_confirmation_resubmits;
            if !session.register_confirmation_resubmit(fcnt_up, max) {
                return Err(FailedReason::ConfirmationResubmitThresholdExceeded);
            }
            debug!("{}: confirmed resubmit of fcnt {fcnt_up}", session.dev_eui());
            return Ok(CounterCheck::ConfirmedResubmit);
        }

        debug!("{}: stale fcnt {fcnt_up}, expected above {current}", session.dev_eui());
        Err(FailedReason::InvalidFrameCounter)
    }

    /// Decrypted FRMPayload, if the frame carries one on a usable port.
    fn decrypt(&self, keys: &SessionKeys, dev_addr: DevAddr, fcnt_up: u32) -> Option<Vec<u8>> {
        let frame = self.frame;
        let port = frame.fport?;
        if port >= 224 {
            self.services.throttled_warn(format_args!(
                "{}: payload on reserved port {port} ignored",
                self.session.dev_eui()
            ));
            return None;
        }
        let key = if port == 0 { &keys.nwk_s_key } else { &keys.app_s_key };
        Some(crypt_frm_payload(key, Direction::Up, dev_addr, fcnt_up, &frame.frm_payload))
    }

    fn answer_mac_commands(&self, commands: &[UplinkMacCommand]) -> Vec<DownlinkMacCommand> {
        let dev_eui = self.session.dev_eui();
        let uplink = self.uplink;
        let mut answers = Vec::new();

        for command in commands {
            match command {
                UplinkMacCommand::LinkCheckReq => {
                    let floor = uplink.region.required_snr(uplink.data_rate).unwrap_or(0.0);
                    let margin = (uplink.snr - floor).round().clamp(0.0, 254.0) as u8;
                    answers.push(DownlinkMacCommand::LinkCheckAns {
                        margin,
                        gateway_count: 1,
                    });
                }
                UplinkMacCommand::DeviceTimeReq => {
                    answers.push(DownlinkMacCommand::device_time_at(uplink.received_at_utc));
                }
                UplinkMacCommand::LinkAdrAns {
                    power_ack,
                    data_rate_ack,
                    channel_mask_ack,
                } => {
                    if !(*power_ack && *data_rate_ack && *channel_mask_ack) {
                        info!(
                            "{dev_eui}: LinkADRReq refused (power {power_ack}, rate {data_rate_ack}, mask {channel_mask_ack})"
                        );
                    }
                }
                UplinkMacCommand::DevStatusAns { battery, margin } => {
                    info!("{dev_eui}: battery {battery}, margin {margin} dB");
                }
                other => debug!("{dev_eui}: MAC command 0x{:02X} received", other.cid()),
            }
        }

        answers
    }

    fn decode(&self, payload: Option<&[u8]>) -> (Option<serde_json::Value>, Option<ApplicationDownlink>) {
        let (Some(payload), Some(port), Some(decoder)) = (payload, self.frame.fport, self.session.decoder()) else {
            return (None, None);
        };
        if port == 0 {
            return (None, None);
        }
        match decoder.decode(self.session.dev_eui(), payload, port) {
            Ok(decoded) => (Some(decoded.value), decoded.reply),
            Err(e) => {
                log_device_warn(self.session.dev_eui(), &format!("decoder failed: {e}"));
                (None, None)
            }
        }
    }
}

/// Reserve, build and send the answer to an uplink.
struct DownlinkStep<'a> {
    pipeline: &'a DataPipeline<'a>,
    watcher: &'a OperationTimeWatcher,
    dev_addr: DevAddr,
    keys: &'a SessionKeys,
    fcnt_up: u32,
    reply_owed: bool,
    mac_answers: &'a [DownlinkMacCommand],
    adr: Option<&'a AdrOutcome>,
}

impl DownlinkStep<'_> {
    async fn run(
        &self,
        mut fcnt_down: u32,
        embedded_reply: Option<ApplicationDownlink>,
        background: &mut BackgroundTasks,
    ) -> Result<Option<DownlinkSummary>, DownstreamSkip> {
        let services = self.pipeline.services;
        let session = self.pipeline.session;
        let uplink = self.pipeline.uplink;
        let dev_eui = session.dev_eui();

        // A reply produced by the decoder takes precedence over queued messages
        let (application, queued) = match embedded_reply {
            Some(reply) => (Some(reply), false),
            None => match services.downlink_source.next_pending(dev_eui).await {
                Ok(message) => (message, true),
                Err(e) => {
                    warn!("{dev_eui}: could not fetch pending downlink: {e}");
                    (None, false)
                }
            },
        };
        let abandon = |background: &mut BackgroundTasks| {
            if let Some(message) = application.as_ref().filter(|_| queued) {
                background.abandon(&services.downlink_source, dev_eui, message.id.clone());
            }
        };

        if !self.reply_owed && application.is_none() {
            return Ok(None);
        }
        if fcnt_down == 0 {
            fcnt_down = session.strategy().next_down(session, self.fcnt_up, uplink.station).await;
            if fcnt_down == 0 {
                abandon(background);
                return Err(DownstreamSkip::ReservationLost);
            }
        }

        let ctx = DownlinkContext {
            session,
            uplink,
            watcher: self.watcher,
            dev_addr: self.dev_addr,
            keys: self.keys,
            fcnt_down,
            ack: self.pipeline.frame.is_confirmed(),
            adr_enabled: self.pipeline.frame.adr(),
            mac_answers: self.mac_answers,
            adr: self.adr,
            application: application.as_ref(),
        };
        let built = match services.builder.build(&ctx) {
            Ok(built) => built,
            Err(DownlinkError::ReceiveWindowMissed) => {
                log_device_debug(dev_eui, "receive window passed while building the downlink");
                abandon(background);
                return Err(DownstreamSkip::WindowMissed);
            }
            Err(e) => {
                log_device_warn(dev_eui, &format!("could not build downlink: {e}"));
                abandon(background);
                return Err(DownstreamSkip::SendFailed);
            }
        };

        let carries_application = built.application == Some(AppDisposition::Included);
        let worth_sending = self.reply_owed || carries_application;
        if worth_sending {
            if let Err(e) = services.downlink_sender.send_downlink(built.message.clone()) {
                log_device_warn(dev_eui, &format!("downlink fcnt {fcnt_down} not sent: {e}"));
                abandon(background);
                return Err(DownstreamSkip::SendFailed);
            }
        }

        if let Some(message) = application.as_ref().filter(|_| queued) {
            let source = &services.downlink_source;
            let id = message.id.clone();
            match built.application {
                Some(AppDisposition::Included) => background.complete(source, dev_eui, id),
                Some(AppDisposition::TooLong | AppDisposition::Rejected) => {
                    log_device_warn(dev_eui, &format!("application downlink {} can never be sent", message.id));
                    background.reject(source, dev_eui, id);
                }
                Some(AppDisposition::Deferred) | None => background.abandon(source, dev_eui, id),
            }
        }

        if !worth_sending {
            return Ok(None);
        }
        Ok(Some(DownlinkSummary {
            window: built.message.window,
            fcnt_down: built.message.fcnt_down,
            payload_len: built.payload_len,
            mac_commands: built.mac_commands.len(),
            application: built.application,
        }))
    }
}
