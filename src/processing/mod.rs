//! # Uplink Processing
//!
//! [`Services`] bundles the shared collaborators of one server instance.
//! The [`dispatcher`] resolves the device of an uplink and queues the
//! [`data`] or [`join`] pipeline on the device session; every pipeline run
//! ends in [`finalize`], whatever step it stopped at.

pub mod data;
pub mod dispatcher;
pub mod join;

pub use dispatcher::{MessageDispatcher, ProcessingHandle};

use crate::adr::{AdrManager, AdrOutcome};
use crate::config::{DeviceProvision, FrameCounterMode, ServerConfig};
use crate::decoder::DecoderRegistry;
use crate::dedup::{ConcentratorDeduplicator, DedupResult};
use crate::downlink::{AppDisposition, DownlinkBuilder};
use crate::error::{ConfigError, LnsError};
use crate::fcnt::{CounterCoordinator, FrameCounterStrategy};
use crate::logging::log_device_error;
use crate::lorawan::{DevEui, StationEui};
use crate::session::{DeviceRegistry, DeviceSession, SessionStore};
use crate::timing::ReceiveWindow;
use crate::transport::{DownlinkSender, DownlinkSource, TransportError, UpstreamSink};
use crate::util::throttle::LogThrottle;
use log::{info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;

/// Why an uplink was not processed to the end.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailedReason {
    #[error("application error")]
    ApplicationError,
    #[error("unknown device")]
    UnknownDevice,
    #[error("device not joined")]
    DeviceNotJoined,
    #[error("invalid MIC")]
    InvalidMic,
    #[error("invalid frame counter")]
    InvalidFrameCounter,
    #[error("confirmation resubmit threshold exceeded")]
    ConfirmationResubmitThresholdExceeded,
    #[error("dropped as duplicate")]
    DeduplicationDrop,
    #[error("handled by another gateway")]
    HandledByAnotherGateway,
    #[error("receive window missed")]
    ReceiveWindowMissed,
    #[error("invalid join request")]
    InvalidJoinRequest,
    #[error("join DevNonce already used")]
    JoinDevNonceAlreadyUsed,
    #[error("upstream delivery problem")]
    UpstreamDeliveryProblem,
    #[error("session connection failed")]
    SessionConnectionFailed,
    #[error("invalid frame")]
    InvalidFrame,
    /// The pipeline task panicked.
    #[error("processing fault")]
    ProcessingFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameKind {
    Join,
    Data,
}

/// Why no downlink was sent although processing succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DownstreamSkip {
    /// Nothing to send
    NotNeeded,
    DownlinkDisabled,
    /// Another station's report of this uplink gets the answer
    SoftDuplicate,
    /// Another gateway reserved the downlink counter
    ReservationLost,
    WindowMissed,
    SendFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownlinkSummary {
    pub window: ReceiveWindow,
    pub fcnt_down: Option<u32>,
    pub payload_len: usize,
    pub mac_commands: usize,
    pub application: Option<AppDisposition>,
}

/// Outcome of a successfully processed uplink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingSummary {
    pub dev_eui: DevEui,
    pub kind: FrameKind,
    pub station: StationEui,
    pub fcnt_up: Option<u32>,
    pub dedup: DedupResult,
    pub delivered_upstream: bool,
    pub adr: Option<AdrOutcome>,
    pub downlink: Option<DownlinkSummary>,
    pub downstream_skipped: Option<DownstreamSkip>,
}

pub type ProcessingResult = Result<ProcessingSummary, FailedReason>;

/// Collaborators injected into a server instance.
pub struct Collaborators {
    pub store: Arc<dyn SessionStore>,
    pub downlink_sender: Arc<dyn DownlinkSender>,
    pub upstream: Arc<dyn UpstreamSink>,
    pub downlink_source: Arc<dyn DownlinkSource>,
    /// Required in multi-gateway mode
    pub coordinator: Option<Arc<dyn CounterCoordinator>>,
    pub decoders: DecoderRegistry,
}

/// Shared state of one network-server instance.
#[derive(Debug)]
pub struct Services {
    pub config: ServerConfig,
    pub registry: DeviceRegistry,
    pub store: Arc<dyn SessionStore>,
    pub deduplicator: ConcentratorDeduplicator,
    pub adr: AdrManager,
    pub decoders: DecoderRegistry,
    pub downlink_sender: Arc<dyn DownlinkSender>,
    pub upstream: Arc<dyn UpstreamSink>,
    pub downlink_source: Arc<dyn DownlinkSource>,
    pub coordinator: Option<Arc<dyn CounterCoordinator>>,
    pub builder: DownlinkBuilder,
    warn_throttle: Mutex<LogThrottle>,
}

impl Services {
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.frame_counter_mode == FrameCounterMode::MultiGateway && collaborators.coordinator.is_none() {
            return Err(ConfigError::Invalid(
                "multi_gateway frame counter mode needs a counter coordinator".to_string(),
            ));
        }

        Ok(Self {
            registry: DeviceRegistry::new(),
            deduplicator: ConcentratorDeduplicator::new(config.deduplication_strategy),
            adr: AdrManager::new(config.adr_installation_margin_db),
            builder: DownlinkBuilder::new(config.rx2),
            store: collaborators.store,
            decoders: collaborators.decoders,
            downlink_sender: collaborators.downlink_sender,
            upstream: collaborators.upstream,
            downlink_source: collaborators.downlink_source,
            coordinator: collaborators.coordinator,
            warn_throttle: Mutex::new(LogThrottle::new(10_000, 20)),
            config,
        })
    }

    /// Register a device. Devices pinned to another server instance are
    /// skipped and `None` is returned.
    pub async fn provision(&self, device: DeviceProvision) -> Result<Option<Arc<DeviceSession>>, LnsError> {
        device.validate()?;
        if let Some(owner) = device.gateway_id.as_deref() {
            if owner != self.config.gateway_id {
                info!("{}: belongs to gateway {owner}, skipping", device.dev_eui);
                return Ok(None);
            }
        }

        let decoder = device
            .decoder
            .as_deref()
            .map(|name| self.decoders.resolve(name))
            .transpose()?;

        let strategy = match (&device.gateway_id, self.config.frame_counter_mode) {
            (Some(_), _) | (None, FrameCounterMode::SingleGateway) => FrameCounterStrategy::SingleGateway,
            (None, FrameCounterMode::MultiGateway) => {
                let coordinator = self.coordinator.clone().ok_or_else(|| {
                    ConfigError::Invalid("multi_gateway frame counter mode needs a counter coordinator".to_string())
                })?;
                FrameCounterStrategy::MultiGateway(coordinator)
            }
        };

        let dev_eui = device.dev_eui;
        let session = Arc::new(DeviceSession::new(
            device,
            self.config.region()?,
            strategy,
            decoder,
            self.config.fcnt_persist_delta,
        ));

        match self.store.load(dev_eui).await {
            Ok(Some(snapshot)) => {
                session.restore(&snapshot);
                info!(
                    "{dev_eui}: restored session (fcnt up {}, down {})",
                    session.fcnt_up(),
                    session.fcnt_down()
                );
            }
            Ok(None) => {}
            Err(e) => warn!("{dev_eui}: could not load stored session: {e}"),
        }

        self.registry.register(Arc::clone(&session))?;
        Ok(Some(session))
    }

    /// Warn unless the throttle window is exhausted.
    pub(crate) fn throttled_warn(&self, message: std::fmt::Arguments<'_>) {
        let allowed = self
            .warn_throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allow();
        if allowed {
            warn!("{message}");
        }
    }
}

/// Secondary operations started by a pipeline run, awaited at finalization.
#[derive(Debug, Default)]
pub(crate) struct BackgroundTasks {
    tasks: Vec<(&'static str, JoinHandle<Result<(), TransportError>>)>,
}

impl BackgroundTasks {
    pub(crate) fn complete(&mut self, source: &Arc<dyn DownlinkSource>, dev_eui: DevEui, id: String) {
        let source = Arc::clone(source);
        let handle = tokio::spawn(async move { source.complete(dev_eui, &id).await });
        self.tasks.push(("complete", handle));
    }

    pub(crate) fn abandon(&mut self, source: &Arc<dyn DownlinkSource>, dev_eui: DevEui, id: String) {
        let source = Arc::clone(source);
        let handle = tokio::spawn(async move { source.abandon(dev_eui, &id).await });
        self.tasks.push(("abandon", handle));
    }

    pub(crate) fn reject(&mut self, source: &Arc<dyn DownlinkSource>, dev_eui: DevEui, id: String) {
        let source = Arc::clone(source);
        let handle = tokio::spawn(async move { source.reject(dev_eui, &id).await });
        self.tasks.push(("reject", handle));
    }

    /// Await every task and log the failures together.
    async fn finish(self, dev_eui: DevEui) {
        let mut failures = Vec::new();
        for (operation, handle) in self.tasks {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(format!("{operation}: {e}")),
                Err(e) => failures.push(format!("{operation}: {e}")),
            }
        }
        if !failures.is_empty() {
            log_device_error(
                dev_eui,
                &format!("{} background operation(s) failed: {}", failures.len(), failures.join("; ")),
            );
        }
    }
}

/// Common end of every pipeline run: settle background operations and save
/// the session if this instance owns its connection.
pub(crate) async fn finalize(services: &Services, session: &DeviceSession, background: BackgroundTasks) {
    background.finish(session.dev_eui()).await;
    if session.owns_connection() {
        session.persist(services.store.as_ref(), false).await;
    }
}
