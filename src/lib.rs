//! # lorans-rs - Session and Protocol Processing Core of a LoRaWAN Network Server
//!
//! The lorans-rs crate implements the part of a LoRaWAN 1.0.x network server
//! that sits between the station transport and the application side: it
//! validates uplinks, keeps per-device session state and frame counters,
//! deduplicates reports from several stations, runs adaptive data rate and
//! answers devices within their receive windows.
//!
//! ## Features
//!
//! - PHYPayload parsing and encoding, MIC and FRMPayload crypto, key derivation
//! - Per-device FIFO processing queues with panic isolation
//! - Frame counter validation with 32-bit inference and confirmed-resubmit handling
//! - Single- and multi-gateway downlink counter reservation
//! - Concentrator deduplication with drop, mark and none strategies
//! - ADR history and recommendations
//! - Downlink assembly within the receive-window and payload budget
//! - OTAA joins with DevNonce replay protection
//! - Debounced session persistence to pluggable stores
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lorans_rs::{
//!     ChannelDownlinkSender, Collaborators, CollectingUpstreamSink, DecoderRegistry,
//!     InMemoryDownlinkSource, InMemorySessionStore, MessageDispatcher, ServerConfig, Services,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), lorans_rs::LnsError> {
//! let (sender, _downlinks) = ChannelDownlinkSender::new();
//! let services = Services::new(
//!     ServerConfig::default(),
//!     Collaborators {
//!         store: Arc::new(InMemorySessionStore::new()),
//!         downlink_sender: Arc::new(sender),
//!         upstream: Arc::new(CollectingUpstreamSink::new()),
//!         downlink_source: Arc::new(InMemoryDownlinkSource::new()),
//!         coordinator: None,
//!         decoders: DecoderRegistry::with_builtins(),
//!     },
//! )?;
//! let dispatcher = MessageDispatcher::new(Arc::new(services));
//! # let _ = dispatcher;
//! # Ok(())
//! # }
//! ```

pub mod adr;
pub mod config;
pub mod decoder;
pub mod dedup;
pub mod downlink;
pub mod error;
pub mod fcnt;
pub mod logging;
pub mod lorawan;
pub mod processing;
pub mod region;
pub mod session;
pub mod timing;
pub mod transport;
pub mod util;

pub use crate::error::LnsError;
pub use crate::logging::{init_logger, init_logging_with_filter};

// Configuration and provisioning
pub use config::{
    load_devices, Activation, DeduplicationStrategy, DeviceClass, DeviceProvision, FrameCounterMode,
    PreferredWindow, ServerConfig,
};

// Protocol types
pub use lorawan::{AesKey, DataRate, DevAddr, DevEui, DevNonce, Eui64, JoinEui, NetId, StationEui};

// Processing
pub use processing::{
    Collaborators, FailedReason, MessageDispatcher, ProcessingHandle, ProcessingResult, ProcessingSummary, Services,
};

// Collaborator seams and their in-process implementations
pub use decoder::{DecoderRegistry, PayloadDecoder};
pub use fcnt::{CounterCoordinator, InMemoryCounterCoordinator};
pub use region::{Eu868, Region};
pub use session::{InMemorySessionStore, JsonFileSessionStore, SessionStore};
pub use transport::{
    ApplicationDownlink, ChannelDownlinkSender, CollectingUpstreamSink, DownlinkMessage, DownlinkSender,
    DownlinkSource, InMemoryDownlinkSource, Telemetry, UplinkRequest, UpstreamSink,
};
