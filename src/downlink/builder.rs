use super::{AppDisposition, DownlinkError, DOWNLINK_OVERHEAD};
use crate::adr::AdrOutcome;
use crate::config::{DeviceClass, PreferredWindow};
use crate::lorawan::frame::{self, DataFrameFields, JoinAcceptFields, MAX_FOPTS_LEN};
use crate::lorawan::mac::{encode_commands, DownlinkMacCommand};
use crate::lorawan::{AesKey, DevAddr, FCtrl, MType, SessionKeys};
use crate::region::{RadioParams, Region};
use crate::session::DeviceSession;
use crate::timing::{OperationTimeWatcher, ReceiveWindow};
use crate::transport::{ApplicationDownlink, DownlinkMessage, DownlinkTiming, UplinkRequest};
use log::{debug, warn};
use std::time::Instant;

/// Everything needed to answer one data uplink.
#[derive(Debug)]
pub struct DownlinkContext<'a> {
    pub session: &'a DeviceSession,
    pub uplink: &'a UplinkRequest,
    pub watcher: &'a OperationTimeWatcher,
    pub dev_addr: DevAddr,
    pub keys: &'a SessionKeys,
    pub fcnt_down: u32,
    /// Acknowledge a confirmed uplink
    pub ack: bool,
    /// Echo the ADR bit of the uplink
    pub adr_enabled: bool,
    pub mac_answers: &'a [DownlinkMacCommand],
    pub adr: Option<&'a AdrOutcome>,
    pub application: Option<&'a ApplicationDownlink>,
}

/// Downlink ready to send.
#[derive(Debug, Clone)]
pub struct BuiltDownlink {
    pub message: DownlinkMessage,
    pub mac_commands: Vec<DownlinkMacCommand>,
    pub application: Option<AppDisposition>,
    /// FOpts plus FRMPayload bytes
    pub payload_len: usize,
    pub budget: usize,
}

/// Assembles downlink frames within the window and payload budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownlinkBuilder {
    rx2_override: Option<RadioParams>,
}

impl DownlinkBuilder {
    pub fn new(rx2_override: Option<RadioParams>) -> Self {
        Self { rx2_override }
    }

    /// RX2 parameters for a device, honouring server and device overrides.
    pub fn rx2_params(&self, region: &dyn Region, session: &DeviceSession) -> RadioParams {
        let mut params = self.rx2_override.unwrap_or_else(|| region.rx2_default());
        if let Some(dr) = session.provision().rx2_data_rate {
            params.data_rate = dr;
        }
        params
    }

    pub fn build(&self, ctx: &DownlinkContext<'_>) -> Result<BuiltDownlink, DownlinkError> {
        self.build_at(ctx, Instant::now())
    }

    pub fn build_at(&self, ctx: &DownlinkContext<'_>, now: Instant) -> Result<BuiltDownlink, DownlinkError> {
        let session = ctx.session;
        let dev_eui = session.dev_eui();
        let region = session.region();
        let provision = session.provision();
        let class = session.class();

        let rx2 = self.rx2_params(region.as_ref(), session);
        let (window, rx1, timing) = if class == DeviceClass::C {
            (ReceiveWindow::Rx2, None, DownlinkTiming::Immediate)
        } else {
            let preferred = match provision.preferred_window {
                PreferredWindow::Rx1 => ReceiveWindow::Rx1,
                PreferredWindow::Rx2 => ReceiveWindow::Rx2,
            };
            let window = ctx
                .watcher
                .resolve_window_at(preferred, now)
                .ok_or(DownlinkError::ReceiveWindowMissed)?;
            let rx1 = region.downstream_rx1(ctx.uplink.frequency, ctx.uplink.data_rate, provision.rx1_dr_offset)?;
            let rx_delay = ctx.watcher.delays().rx1.as_secs() as u8;
            (window, Some(rx1), DownlinkTiming::AfterUplink { rx_delay })
        };

        let data_rate = match (window, rx1) {
            (ReceiveWindow::Rx1, Some(params)) => params.data_rate,
            _ => rx2.data_rate,
        };
        let max_payload = region.max_payload_size(data_rate, provision.dwell_time_limited)?;
        let budget = max_payload.saturating_sub(DOWNLINK_OVERHEAD);

        let mut candidates = dedup_by_cid(ctx.mac_answers);
        if let Some(adr) = ctx.adr.filter(|a| a.can_confirm) {
            candidates.push(DownlinkMacCommand::LinkAdrReq {
                data_rate: adr.data_rate.0,
                tx_power: adr.tx_power,
                channel_mask: region.adr_channel_mask(),
                channel_mask_control: 0,
                nb_rep: adr.nb_rep,
            });
        }

        let mut mac_commands = Vec::with_capacity(candidates.len());
        let mut mac_len = 0;
        for cmd in candidates {
            if mac_len + cmd.encoded_len() > budget {
                warn!("{dev_eui}: no room for MAC command 0x{:02X} at {data_rate}", cmd.cid());
                continue;
            }
            mac_len += cmd.encoded_len();
            mac_commands.push(cmd);
        }
        let mac_bytes = encode_commands(&mac_commands);

        let disposition = ctx.application.map(|app| {
            if app.fport == 0 || app.fport >= 224 {
                AppDisposition::Rejected
            } else if app.payload.len() > budget {
                AppDisposition::TooLong
            } else if mac_len <= MAX_FOPTS_LEN && mac_len + app.payload.len() <= budget {
                AppDisposition::Included
            } else {
                AppDisposition::Deferred
            }
        });

        let included = ctx.application.filter(|_| disposition == Some(AppDisposition::Included));
        let (fopts, fport, frm_payload): (&[u8], Option<u8>, &[u8]) = match included {
            Some(app) => (&mac_bytes, Some(app.fport), &app.payload),
            None if mac_len > MAX_FOPTS_LEN => (&[], Some(0), &mac_bytes),
            None => (&mac_bytes, None, &[]),
        };

        let mut fctrl = FCtrl::empty();
        fctrl.set(FCtrl::ACK, ctx.ack);
        fctrl.set(FCtrl::ADR, ctx.adr_enabled);
        let mtype = if included.is_some_and(|app| app.confirmed) {
            MType::ConfirmedDataDown
        } else {
            MType::UnconfirmedDataDown
        };

        let payload = frame::encode_data_frame(
            &DataFrameFields {
                mtype,
                dev_addr: ctx.dev_addr,
                fctrl,
                fcnt: ctx.fcnt_down,
                fopts,
                fport,
                frm_payload,
            },
            ctx.keys,
        )?;
        let payload_len = fopts.len() + frm_payload.len();
        debug!(
            "{dev_eui}: downlink fcnt {} on {window:?} at {data_rate}, {payload_len}/{budget} bytes",
            ctx.fcnt_down
        );

        Ok(BuiltDownlink {
            message: DownlinkMessage {
                dev_eui,
                station: ctx.uplink.station,
                payload,
                fcnt_down: Some(ctx.fcnt_down),
                window,
                rx1,
                rx2,
                class,
                timing,
            },
            mac_commands,
            application: disposition,
            payload_len,
            budget,
        })
    }

    /// Join accept for `session`, in the first reachable join-accept window.
    pub fn build_join_accept_at(
        &self,
        session: &DeviceSession,
        uplink: &UplinkRequest,
        watcher: &OperationTimeWatcher,
        fields: &JoinAcceptFields,
        app_key: &AesKey,
        now: Instant,
    ) -> Result<DownlinkMessage, DownlinkError> {
        let region = session.region();
        let window = watcher
            .resolve_join_accept_window_at(now)
            .ok_or(DownlinkError::ReceiveWindowMissed)?;
        let rx1 = region.downstream_rx1(uplink.frequency, uplink.data_rate, 0)?;
        let rx2 = self.rx2_params(region.as_ref(), session);
        let payload = frame::encode_join_accept(fields, app_key)?;

        Ok(DownlinkMessage {
            dev_eui: session.dev_eui(),
            station: uplink.station,
            payload,
            fcnt_down: None,
            window,
            rx1: Some(rx1),
            rx2,
            class: session.class(),
            timing: DownlinkTiming::AfterUplink {
                rx_delay: watcher.delays().join_accept1.as_secs() as u8,
            },
        })
    }
}

/// Keep the first command of each CID, in order.
fn dedup_by_cid(commands: &[DownlinkMacCommand]) -> Vec<DownlinkMacCommand> {
    let mut seen = [false; 256];
    commands
        .iter()
        .filter(|cmd| !std::mem::replace(&mut seen[cmd.cid() as usize], true))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adr::AdrReason;
    use crate::config::DeviceProvision;
    use crate::fcnt::FrameCounterStrategy;
    use crate::lorawan::{parse_phy_payload, DataRate, Eui64, PhyPayload};
    use crate::region::Eu868;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn session(class: &str) -> DeviceSession {
        let provision: DeviceProvision = serde_json::from_str(&format!(
            r#"{{"dev_eui": "0000000000000002", "activation": "abp", "dev_addr": "26011BDA",
                "nwk_s_key": "11111111111111111111111111111111",
                "app_s_key": "22222222222222222222222222222222", "class": "{class}"}}"#
        ))
        .unwrap();
        DeviceSession::new(provision, Arc::new(Eu868), FrameCounterStrategy::SingleGateway, None, 10)
    }

    fn uplink(dr: u8) -> UplinkRequest {
        UplinkRequest::now(Eui64(1), 868_100_000, DataRate(dr), 5.0, vec![], Arc::new(Eu868))
    }

    fn app(len: usize) -> ApplicationDownlink {
        ApplicationDownlink {
            id: "m".to_string(),
            fport: 1,
            payload: vec![0xAA; len],
            confirmed: false,
        }
    }

    fn build(
        session: &DeviceSession,
        up: &UplinkRequest,
        answers: &[DownlinkMacCommand],
        application: Option<&ApplicationDownlink>,
    ) -> Result<BuiltDownlink, DownlinkError> {
        let watcher = OperationTimeWatcher::new(Eu868.window_delays(), up.received_at);
        let keys = session.keys().unwrap();
        DownlinkBuilder::default().build_at(
            &DownlinkContext {
                session,
                uplink: up,
                watcher: &watcher,
                dev_addr: DevAddr(0x2601_1BDA),
                keys: &keys,
                fcnt_down: 1,
                ack: true,
                adr_enabled: false,
                mac_answers: answers,
                adr: None,
                application,
            },
            up.received_at,
        )
    }

    #[test]
    fn test_ack_only_frame() {
        let s = session("A");
        let built = build(&s, &uplink(5), &[], None).unwrap();
        assert_eq!(built.message.window, ReceiveWindow::Rx1);
        assert_eq!(built.payload_len, 0);
        let PhyPayload::Data(frame) = parse_phy_payload(&built.message.payload).unwrap() else {
            panic!("expected data frame");
        };
        assert!(frame.fctrl.contains(FCtrl::ACK));
        assert_eq!(frame.mtype, MType::UnconfirmedDataDown);
    }

    #[test]
    fn test_mac_answers_deduplicated() {
        let s = session("A");
        let answers = [
            DownlinkMacCommand::LinkCheckAns { margin: 5, gateway_count: 1 },
            DownlinkMacCommand::LinkCheckAns { margin: 9, gateway_count: 2 },
            DownlinkMacCommand::DevStatusReq,
        ];
        let built = build(&s, &uplink(5), &answers, None).unwrap();
        assert_eq!(
            built.mac_commands,
            vec![
                DownlinkMacCommand::LinkCheckAns { margin: 5, gateway_count: 1 },
                DownlinkMacCommand::DevStatusReq
            ]
        );
    }

    #[test]
    fn test_application_too_long_for_dr0() {
        let s = session("A");
        // DR0 budget: 59 - 13 = 46 bytes
        let too_long = app(47);
        let built = build(&s, &uplink(0), &[], Some(&too_long)).unwrap();
        assert_eq!(built.application, Some(AppDisposition::TooLong));
        let fits = app(46);
        let built = build(&s, &uplink(0), &[], Some(&fits)).unwrap();
        assert_eq!(built.application, Some(AppDisposition::Included));
        assert_eq!(built.payload_len, 46);
    }

    #[test]
    fn test_adr_command_added_when_confirmable() {
        let s = session("A");
        let up = uplink(2);
        let watcher = OperationTimeWatcher::new(Eu868.window_delays(), up.received_at);
        let keys = s.keys().unwrap();
        let adr = AdrOutcome {
            data_rate: DataRate(5),
            tx_power: 1,
            nb_rep: 1,
            can_confirm: true,
            reserved_fcnt_down: 1,
            sample_count: 20,
            reason: AdrReason::Computed,
        };
        let built = DownlinkBuilder::default()
            .build_at(
                &DownlinkContext {
                    session: &s,
                    uplink: &up,
                    watcher: &watcher,
                    dev_addr: DevAddr(0x2601_1BDA),
                    keys: &keys,
                    fcnt_down: 1,
                    ack: false,
                    adr_enabled: true,
                    mac_answers: &[],
                    adr: Some(&adr),
                    application: None,
                },
                up.received_at,
            )
            .unwrap();
        assert!(matches!(
            built.mac_commands.as_slice(),
            [DownlinkMacCommand::LinkAdrReq { data_rate: 5, tx_power: 1, channel_mask: 0x00FF, nb_rep: 1, .. }]
        ));
    }

    #[test]
    fn test_class_c_uses_rx2_immediately() {
        let s = session("C");
        let up = uplink(5);
        let watcher = OperationTimeWatcher::new(Eu868.window_delays(), up.received_at);
        let keys = s.keys().unwrap();
        let late = up.received_at + std::time::Duration::from_secs(10);
        let built = DownlinkBuilder::default()
            .build_at(
                &DownlinkContext {
                    session: &s,
                    uplink: &up,
                    watcher: &watcher,
                    dev_addr: DevAddr(0x2601_1BDA),
                    keys: &keys,
                    fcnt_down: 1,
                    ack: true,
                    adr_enabled: false,
                    mac_answers: &[],
                    adr: None,
                    application: None,
                },
                late,
            )
            .unwrap();
        assert_eq!(built.message.window, ReceiveWindow::Rx2);
        assert_eq!(built.message.timing, DownlinkTiming::Immediate);
        assert_eq!(built.message.rx2.frequency, 869_525_000);
    }

    #[test]
    fn test_missed_windows() {
        let s = session("A");
        let up = uplink(5);
        let watcher = OperationTimeWatcher::new(Eu868.window_delays(), up.received_at);
        let keys = s.keys().unwrap();
        let result = DownlinkBuilder::default().build_at(
            &DownlinkContext {
                session: &s,
                uplink: &up,
                watcher: &watcher,
                dev_addr: DevAddr(0x2601_1BDA),
                keys: &keys,
                fcnt_down: 1,
                ack: true,
                adr_enabled: false,
                mac_answers: &[],
                adr: None,
                application: None,
            },
            up.received_at + std::time::Duration::from_secs(3),
        );
        assert!(matches!(result, Err(DownlinkError::ReceiveWindowMissed)));
    }

    proptest! {
        #[test]
        fn prop_payload_within_budget(dr in 0u8..6, app_len in 0usize..260, n_answers in 0usize..4) {
            let s = session("A");
            let answers: Vec<_> = [
                DownlinkMacCommand::LinkCheckAns { margin: 5, gateway_count: 1 },
                DownlinkMacCommand::DeviceTimeAns { gps_seconds: 1, fractional: 0 },
                DownlinkMacCommand::RxTimingSetupReq { delay: 1 },
                DownlinkMacCommand::DevStatusReq,
            ][..n_answers].to_vec();
            let application = app(app_len);
            let built = build(&s, &uplink(dr), &answers, Some(&application)).unwrap();
            let max = Eu868.max_payload_size(DataRate(dr), false).unwrap();
            prop_assert!(built.payload_len <= max - DOWNLINK_OVERHEAD);
            prop_assert!(built.message.payload.len() <= max);
        }
    }
}
