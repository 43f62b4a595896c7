//! Join request pipeline (OTAA).

use super::{finalize, BackgroundTasks, DownlinkSummary, FailedReason, FrameKind, ProcessingResult, ProcessingSummary, Services};
use crate::dedup::{DedupKey, DedupResult};
use crate::downlink::DownlinkError;
use crate::logging::{log_device_info, log_device_warn};
use crate::lorawan::crypto::derive_session_keys;
use crate::lorawan::frame::JoinAcceptFields;
use crate::lorawan::{AppNonce, DevAddr, JoinRequestFrame};
use crate::session::{DeviceSession, JoinedSession};
use crate::timing::OperationTimeWatcher;
use crate::transport::UplinkRequest;
use log::{debug, info};
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;

/// Process one join request for `session`. Runs on the session's queue.
pub(crate) async fn process_join_request(
    services: Arc<Services>,
    session: Arc<DeviceSession>,
    request: JoinRequestFrame,
    uplink: UplinkRequest,
) -> ProcessingResult {
    let result = run(&services, &session, &request, &uplink).await;
    finalize(&services, &session, BackgroundTasks::default()).await;

    if let Err(reason) = &result {
        log_device_info(
            session.dev_eui(),
            &format!("join request with DevNonce {} refused: {reason}", request.dev_nonce.0),
        );
    }
    result
}

async fn run(
    services: &Services,
    session: &DeviceSession,
    request: &JoinRequestFrame,
    uplink: &UplinkRequest,
) -> ProcessingResult {
    let dev_eui = session.dev_eui();
    session.set_region(Arc::clone(&uplink.region));
    let Some((app_key, _)) = session.join_credentials() else {
        return Err(FailedReason::InvalidJoinRequest);
    };

    let watcher = OperationTimeWatcher::new(uplink.region.window_delays(), uplink.received_at);
    if watcher.resolve_join_accept_window_at(Instant::now()).is_none() {
        return Err(FailedReason::ReceiveWindowMissed);
    }

    if session.last_dev_nonce() == Some(request.dev_nonce) {
        return Err(FailedReason::JoinDevNonceAlreadyUsed);
    }

    let dedup = services.deduplicator.check(
        DedupKey::Join {
            dev_eui,
            dev_nonce: request.dev_nonce,
            mic: request.mic,
        },
        uplink.station,
        watcher.last_window_deadline(true),
    );
    if dedup != DedupResult::NotDuplicate {
        debug!("{dev_eui}: join request already seen ({dedup:?})");
        return Err(FailedReason::DeduplicationDrop);
    }

    if !session
        .strategy()
        .claim_join(dev_eui, request.dev_nonce, uplink.station)
        .await
    {
        session.release_connection();
        return Err(FailedReason::HandledByAnotherGateway);
    }

    let net_id = services.config.net_id;
    let (app_nonce, dev_addr) = {
        let mut rng = rand::thread_rng();
        let app_nonce = AppNonce(rng.gen_range(0..=0x00FF_FFFF));
        let nwk_addr: u32 = rng.gen_range(0..=0x01FF_FFFF);
        (app_nonce, DevAddr::from_nwk_id(net_id, nwk_addr))
    };
    let keys = derive_session_keys(app_key, app_nonce, net_id, request.dev_nonce);

    if watcher.resolve_join_accept_window_at(Instant::now()).is_none() {
        return Err(FailedReason::ReceiveWindowMissed);
    }

    let old_addr = session.dev_addr();
    let joined = JoinedSession {
        dev_addr,
        keys,
        dev_nonce: request.dev_nonce,
        station: uplink.station,
    };
    if let Err(e) = session.commit_join(services.store.as_ref(), joined).await {
        log_device_warn(dev_eui, &format!("could not save joined session: {e}"));
        return Err(FailedReason::SessionConnectionFailed);
    }
    services.registry.reassign_dev_addr(dev_eui, old_addr, dev_addr);
    services.adr.reset(dev_eui).await;
    session.strategy().reset(session).await;
    info!("{dev_eui}: joined as {dev_addr}");

    let provision = session.provision();
    let region = session.region();
    let rx2 = services.builder.rx2_params(region.as_ref(), session);
    let fields = JoinAcceptFields {
        app_nonce,
        net_id,
        dev_addr,
        rx1_dr_offset: provision.rx1_dr_offset,
        rx2_data_rate: rx2.data_rate.0,
        rx_delay: provision
            .rx_delay
            .unwrap_or_else(|| region.window_delays().rx1.as_secs() as u8),
    };

    let message = match services
        .builder
        .build_join_accept_at(session, uplink, &watcher, &fields, app_key, Instant::now())
    {
        Ok(message) => message,
        Err(DownlinkError::ReceiveWindowMissed) => return Err(FailedReason::ReceiveWindowMissed),
        Err(e) => {
            log_device_warn(dev_eui, &format!("could not build join accept: {e}"));
            return Err(FailedReason::ApplicationError);
        }
    };
    let summary = DownlinkSummary {
        window: message.window,
        fcnt_down: None,
        payload_len: message.payload.len(),
        mac_commands: 0,
        application: None,
    };
    if let Err(e) = services.downlink_sender.send_downlink(message) {
        log_device_warn(dev_eui, &format!("join accept not sent: {e}"));
        return Err(FailedReason::ApplicationError);
    }

    Ok(ProcessingSummary {
        dev_eui,
        kind: FrameKind::Join,
        station: uplink.station,
        fcnt_up: None,
        dedup,
        delivered_upstream: false,
        adr: None,
        downlink: Some(summary),
        downstream_skipped: None,
    })
}
