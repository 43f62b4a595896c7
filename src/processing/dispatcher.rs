//! # Message Dispatcher
//!
//! Entry point for uplinks. Parses the frame, finds the device session it
//! belongs to and queues the matching pipeline on that session, so uplinks
//! of one device are processed one at a time in arrival order while
//! different devices proceed concurrently.

use super::data::process_data_uplink;
use super::join::process_join_request;
use super::{FailedReason, ProcessingResult, Services};
use crate::fcnt::infer_fcnt32;
use crate::lorawan::{parse_phy_payload, DataFrame, JoinRequestFrame, PhyPayload};
use crate::session::DeviceSession;
use crate::transport::UplinkRequest;
use crate::util::log_frame_hex;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Pending result of a dispatched uplink.
#[derive(Debug)]
pub struct ProcessingHandle {
    inner: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Ready(ProcessingResult),
    Queued(oneshot::Receiver<ProcessingResult>),
}

impl ProcessingHandle {
    fn ready(result: ProcessingResult) -> Self {
        Self {
            inner: HandleState::Ready(result),
        }
    }

    fn queued(rx: oneshot::Receiver<ProcessingResult>) -> Self {
        Self {
            inner: HandleState::Queued(rx),
        }
    }

    /// Whether the uplink was refused before reaching a device queue.
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, HandleState::Ready(_))
    }

    /// Wait for the pipeline to finish.
    pub async fn outcome(self) -> ProcessingResult {
        match self.inner {
            HandleState::Ready(result) => result,
            HandleState::Queued(rx) => rx.await.unwrap_or(Err(FailedReason::ProcessingFault)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageDispatcher {
    services: Arc<Services>,
}

impl MessageDispatcher {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Hand an uplink to its device queue. Must be called inside a tokio
    /// runtime; never blocks on device processing.
    pub fn dispatch(&self, uplink: UplinkRequest) -> ProcessingHandle {
        if let Err(e) = uplink.region.validate_upstream(uplink.frequency, uplink.data_rate) {
            warn!("uplink from {} refused: {e}", uplink.station);
            return ProcessingHandle::ready(Err(FailedReason::InvalidFrame));
        }

        match parse_phy_payload(&uplink.payload) {
            Ok(PhyPayload::JoinRequest(request)) => self.dispatch_join(request, uplink),
            Ok(PhyPayload::Data(frame)) if frame.mtype.is_data_uplink() => self.dispatch_data(frame, uplink),
            Ok(PhyPayload::Data(frame)) => {
                debug!("{:?} from {} is not an uplink", frame.mtype, uplink.station);
                ProcessingHandle::ready(Err(FailedReason::InvalidFrame))
            }
            Err(e) => {
                debug!("unparsable uplink from {}: {e}", uplink.station);
                log_frame_hex("unparsable uplink", &uplink.payload);
                ProcessingHandle::ready(Err(FailedReason::InvalidFrame))
            }
        }
    }

    fn dispatch_join(&self, request: JoinRequestFrame, uplink: UplinkRequest) -> ProcessingHandle {
        let session = match self.resolve_join_session(&request) {
            Ok(session) => session,
            Err(reason) => return ProcessingHandle::ready(Err(reason)),
        };
        session.claim_connection();
        let job = process_join_request(Arc::clone(&self.services), Arc::clone(&session), request, uplink);
        ProcessingHandle::queued(session.queue().enqueue(job))
    }

    fn dispatch_data(&self, frame: DataFrame, uplink: UplinkRequest) -> ProcessingHandle {
        let session = match self.resolve_data_session(&frame) {
            Ok(session) => session,
            Err(reason) => return ProcessingHandle::ready(Err(reason)),
        };
        session.claim_connection();
        let job = process_data_uplink(Arc::clone(&self.services), Arc::clone(&session), frame, uplink);
        ProcessingHandle::queued(session.queue().enqueue(job))
    }

    fn resolve_join_session(&self, request: &JoinRequestFrame) -> Result<Arc<DeviceSession>, FailedReason> {
        let session = self
            .services
            .registry
            .by_dev_eui(request.dev_eui)
            .ok_or(FailedReason::UnknownDevice)?;

        let Some((app_key, join_eui)) = session.join_credentials() else {
            debug!("{}: join request from an ABP device", request.dev_eui);
            return Err(FailedReason::InvalidJoinRequest);
        };
        if join_eui != request.join_eui {
            debug!(
                "{}: join EUI {} does not match provisioned {join_eui}",
                request.dev_eui, request.join_eui
            );
            return Err(FailedReason::InvalidJoinRequest);
        }
        if !request.verify_mic(app_key) {
            self.services
                .throttled_warn(format_args!("{}: join request with invalid MIC", request.dev_eui));
            return Err(FailedReason::InvalidJoinRequest);
        }

        Ok(session)
    }

    /// Several devices may share a DevAddr; the MIC picks the right one.
    fn resolve_data_session(&self, frame: &DataFrame) -> Result<Arc<DeviceSession>, FailedReason> {
        let candidates = self.services.registry.by_dev_addr(frame.dev_addr);
        if candidates.is_empty() {
            return Err(FailedReason::UnknownDevice);
        }

        let mut any_joined = false;
        for candidate in candidates {
            let Some(keys) = candidate.keys() else {
                continue;
            };
            any_joined = true;

            let inferred = infer_fcnt32(candidate.fcnt_up(), frame.fcnt);
            let restarted = candidate.is_abp_relaxed() && frame.fcnt <= 1;
            if frame.verify_mic(&keys.nwk_s_key, inferred)
                || (restarted && frame.verify_mic(&keys.nwk_s_key, u32::from(frame.fcnt)))
            {
                return Ok(candidate);
            }
        }

        if !any_joined {
            return Err(FailedReason::DeviceNotJoined);
        }
        self.services.throttled_warn(format_args!(
            "{}: no device matches the MIC of fcnt {}",
            frame.dev_addr, frame.fcnt
        ));
        Err(FailedReason::InvalidMic)
    }
}
