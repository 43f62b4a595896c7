//! # Transport Boundary
//!
//! Types and traits at the edge of the core: the uplink handed in by the
//! station transport, the downlink handed back to it, telemetry delivered to
//! the application side and application downlinks waiting for a device.
//! Channel and in-memory implementations serve tests and the replay tool.

use crate::config::DeviceClass;
use crate::lorawan::{DataRate, DevAddr, DevEui, StationEui};
use crate::region::{RadioParams, Region};
use crate::timing::ReceiveWindow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Downlink channel closed")]
    ChannelClosed,

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Unknown application downlink {0}")]
    UnknownMessage(String),
}

/// Uplink as received from a station.
#[derive(Clone)]
pub struct UplinkRequest {
    pub station: StationEui,
    /// Hz
    pub frequency: u32,
    pub data_rate: DataRate,
    /// dB
    pub snr: f32,
    /// dBm
    pub rssi: f32,
    pub received_at: Instant,
    pub received_at_utc: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub region: Arc<dyn Region>,
}

impl fmt::Debug for UplinkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UplinkRequest")
            .field("station", &self.station)
            .field("frequency", &self.frequency)
            .field("data_rate", &self.data_rate)
            .field("snr", &self.snr)
            .field("region", &self.region.name())
            .field("payload", &hex::encode_upper(&self.payload))
            .finish()
    }
}

impl UplinkRequest {
    /// Uplink received just now.
    pub fn now(
        station: StationEui,
        frequency: u32,
        data_rate: DataRate,
        snr: f32,
        payload: Vec<u8>,
        region: Arc<dyn Region>,
    ) -> Self {
        Self {
            station,
            frequency,
            data_rate,
            snr,
            rssi: 0.0,
            received_at: Instant::now(),
            received_at_utc: Utc::now(),
            payload,
            region,
        }
    }
}

/// When the station transmits a downlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DownlinkTiming {
    /// Class A: `rx_delay` seconds after the uplink ended (RX2 one second later)
    AfterUplink { rx_delay: u8 },
    /// Class C: as soon as possible on RX2 parameters
    Immediate,
}

/// Downlink handed to the station transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownlinkMessage {
    pub dev_eui: DevEui,
    pub station: StationEui,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub fcnt_down: Option<u32>,
    pub window: ReceiveWindow,
    pub rx1: Option<RadioParams>,
    pub rx2: RadioParams,
    pub class: DeviceClass,
    pub timing: DownlinkTiming,
}

mod hex_bytes {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }
}

/// Fire-and-forget downlink submission.
pub trait DownlinkSender: Send + Sync + fmt::Debug {
    fn send_downlink(&self, message: DownlinkMessage) -> Result<(), TransportError>;
}

/// Sends downlinks into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDownlinkSender {
    tx: mpsc::UnboundedSender<DownlinkMessage>,
}

impl ChannelDownlinkSender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DownlinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DownlinkSender for ChannelDownlinkSender {
    fn send_downlink(&self, message: DownlinkMessage) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::ChannelClosed)
    }
}

/// Uplink data delivered to the application side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Telemetry {
    pub dev_eui: DevEui,
    pub dev_addr: DevAddr,
    pub fcnt: u32,
    pub fport: Option<u8>,
    /// Decrypted FRMPayload as uppercase hex
    pub raw: Option<String>,
    pub decoded: Option<serde_json::Value>,
    pub station: StationEui,
    pub frequency: u32,
    pub data_rate: DataRate,
    pub snr: f32,
    pub received_at: DateTime<Utc>,
    /// Set on duplicates under the mark strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dup_msg: Option<bool>,
}

#[async_trait]
pub trait UpstreamSink: Send + Sync + fmt::Debug {
    async fn deliver(&self, telemetry: Telemetry) -> Result<(), TransportError>;
}

/// Keeps delivered telemetry in memory.
#[derive(Debug, Default)]
pub struct CollectingUpstreamSink {
    delivered: Mutex<Vec<Telemetry>>,
    unavailable: AtomicBool,
}

impl CollectingUpstreamSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<Telemetry> {
        self.delivered.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl UpstreamSink for CollectingUpstreamSink {
    async fn deliver(&self, telemetry: Telemetry) -> Result<(), TransportError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::UpstreamUnavailable(telemetry.dev_eui.to_string()));
        }
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(telemetry);
        Ok(())
    }
}

/// Application message waiting for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDownlink {
    pub id: String,
    pub fport: u8,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub confirmed: bool,
}

/// Queue of application downlinks. A fetched message is in flight until it
/// is completed (sent), abandoned (returned to the queue) or rejected
/// (dropped because it can never be delivered).
#[async_trait]
pub trait DownlinkSource: Send + Sync + fmt::Debug {
    async fn next_pending(&self, dev_eui: DevEui) -> Result<Option<ApplicationDownlink>, TransportError>;

    async fn complete(&self, dev_eui: DevEui, id: &str) -> Result<(), TransportError>;

    async fn abandon(&self, dev_eui: DevEui, id: &str) -> Result<(), TransportError>;

    async fn reject(&self, dev_eui: DevEui, id: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct DeviceQueue {
    pending: VecDeque<ApplicationDownlink>,
    in_flight: HashMap<String, ApplicationDownlink>,
    completed: Vec<String>,
    rejected: Vec<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryDownlinkSource {
    queues: Mutex<HashMap<DevEui, DeviceQueue>>,
}

impl InMemoryDownlinkSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, dev_eui: DevEui, message: ApplicationDownlink) {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(dev_eui)
            .or_default()
            .pending
            .push_back(message);
    }

    pub fn pending_len(&self, dev_eui: DevEui) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dev_eui)
            .map_or(0, |q| q.pending.len())
    }

    pub fn completed(&self, dev_eui: DevEui) -> Vec<String> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dev_eui)
            .map(|q| q.completed.clone())
            .unwrap_or_default()
    }

    pub fn rejected(&self, dev_eui: DevEui) -> Vec<String> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dev_eui)
            .map(|q| q.rejected.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DownlinkSource for InMemoryDownlinkSource {
    async fn next_pending(&self, dev_eui: DevEui) -> Result<Option<ApplicationDownlink>, TransportError> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(queue) = queues.get_mut(&dev_eui) else {
            return Ok(None);
        };
        let next = queue.pending.pop_front();
        if let Some(message) = &next {
            queue.in_flight.insert(message.id.clone(), message.clone());
        }
        Ok(next)
    }

    async fn complete(&self, dev_eui: DevEui, id: &str) -> Result<(), TransportError> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.entry(dev_eui).or_default();
        queue
            .in_flight
            .remove(id)
            .ok_or_else(|| TransportError::UnknownMessage(id.to_string()))?;
        queue.completed.push(id.to_string());
        Ok(())
    }

    async fn abandon(&self, dev_eui: DevEui, id: &str) -> Result<(), TransportError> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.entry(dev_eui).or_default();
        let message = queue
            .in_flight
            .remove(id)
            .ok_or_else(|| TransportError::UnknownMessage(id.to_string()))?;
        queue.pending.push_front(message);
        Ok(())
    }

    async fn reject(&self, dev_eui: DevEui, id: &str) -> Result<(), TransportError> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.entry(dev_eui).or_default();
        queue
            .in_flight
            .remove(id)
            .ok_or_else(|| TransportError::UnknownMessage(id.to_string()))?;
        queue.rejected.push(id.to_string());
        Ok(())
    }
}
