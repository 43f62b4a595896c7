//! # Server and Device Configuration
//!
//! [`ServerConfig`] holds the settings of one network-server instance and
//! [`DeviceProvision`] describes a device known to it. Both are read from
//! JSON; every server field falls back to its default when omitted.
//!
//! ```json
//! {
//!   "net_id": 19,
//!   "gateway_id": "edge-01",
//!   "deduplication_strategy": "drop",
//!   "frame_counter_mode": "single_gateway"
//! }
//! ```

use crate::error::ConfigError;
use crate::lorawan::{AesKey, DataRate, DevAddr, DevEui, JoinEui, NetId};
use crate::region::{Eu868, RadioParams, Region};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// How uplinks heard by several stations are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeduplicationStrategy {
    /// Duplicates are neither delivered upstream nor answered.
    #[default]
    Drop,
    /// Duplicates are delivered upstream flagged as duplicates.
    Mark,
    /// Duplicates are delivered upstream unflagged.
    None,
}

/// How downlink frame counters are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameCounterMode {
    #[default]
    SingleGateway,
    /// Requires an injected counter coordinator.
    MultiGateway,
}

/// LoRaWAN device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceClass {
    #[default]
    A,
    B,
    C,
}

/// Receive window a device prefers for replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredWindow {
    #[default]
    Rx1,
    Rx2,
}

/// Settings of one network-server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub net_id: NetId,
    /// Identity of this instance, matched against device `gateway_id`
    pub gateway_id: String,
    pub deduplication_strategy: DeduplicationStrategy,
    pub frame_counter_mode: FrameCounterMode,
    /// Margin in dB kept above the demodulation floor by the ADR
    pub adr_installation_margin_db: f32,
    /// Resubmits of the same confirmed uplink answered before giving up
    pub max_confirmation_resubmits: u32,
    /// Unsaved counter steps tolerated before a counter write
    pub fcnt_persist_delta: u32,
    pub downlink_enabled: bool,
    /// Overrides the region's RX2 frequency and data rate
    pub rx2: Option<RadioParams>,
    pub region: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            net_id: NetId(1),
            gateway_id: "lorans".to_string(),
            deduplication_strategy: DeduplicationStrategy::Drop,
            frame_counter_mode: FrameCounterMode::SingleGateway,
            adr_installation_margin_db: 5.0,
            max_confirmation_resubmits: 3,
            fcnt_persist_delta: 10,
            downlink_enabled: true,
            rx2: None,
            region: "EU868".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.net_id.0 > 0x00FF_FFFF {
            return Err(ConfigError::Invalid(format!("net_id 0x{:X} exceeds 24 bits", self.net_id.0)));
        }
        if self.gateway_id.is_empty() {
            return Err(ConfigError::Invalid("gateway_id must not be empty".to_string()));
        }
        if !(0.0..=30.0).contains(&self.adr_installation_margin_db) {
            return Err(ConfigError::Invalid(format!(
                "adr_installation_margin_db {} out of range 0..=30",
                self.adr_installation_margin_db
            )));
        }
        if self.max_confirmation_resubmits == 0 {
            return Err(ConfigError::Invalid("max_confirmation_resubmits must be positive".to_string()));
        }
        if let Some(rx2) = self.rx2 {
            self.region()?
                .max_payload_size(rx2.data_rate, false)
                .map_err(|e| ConfigError::Invalid(format!("rx2 override: {e}")))?;
        }
        Ok(())
    }

    /// Region table named by `region`.
    pub fn region(&self) -> Result<Arc<dyn Region>, ConfigError> {
        match self.region.to_ascii_uppercase().as_str() {
            "EU868" => Ok(Arc::new(Eu868)),
            other => Err(ConfigError::Invalid(format!("unsupported region {other}"))),
        }
    }
}

/// Activation material of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "activation", rename_all = "lowercase")]
pub enum Activation {
    Otaa {
        app_key: AesKey,
        join_eui: JoinEui,
    },
    Abp {
        dev_addr: DevAddr,
        nwk_s_key: AesKey,
        app_s_key: AesKey,
        /// Accept a counter restart from 0/1 (devices without NVRAM)
        #[serde(default)]
        relaxed_fcnt: bool,
    },
}

fn default_true() -> bool {
    true
}

/// A device known to this server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProvision {
    pub dev_eui: DevEui,
    #[serde(flatten)]
    pub activation: Activation,
    #[serde(default)]
    pub decoder: Option<String>,
    #[serde(default)]
    pub class: DeviceClass,
    /// Pins the device to one server instance
    #[serde(default)]
    pub gateway_id: Option<String>,
    /// RX1 delay override in seconds
    #[serde(default)]
    pub rx_delay: Option<u8>,
    #[serde(default)]
    pub rx1_dr_offset: u8,
    #[serde(default)]
    pub rx2_data_rate: Option<DataRate>,
    #[serde(default)]
    pub preferred_window: PreferredWindow,
    #[serde(default = "default_true")]
    pub downlink_enabled: bool,
    #[serde(default)]
    pub dwell_time_limited: bool,
}

impl DeviceProvision {
    pub fn is_abp(&self) -> bool {
        matches!(self.activation, Activation::Abp { .. })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.rx_delay, Some(d) if d > 15) {
            return Err(ConfigError::Invalid(format!("{}: rx_delay must be 0..=15 s", self.dev_eui)));
        }
        if self.rx1_dr_offset > 5 {
            return Err(ConfigError::Invalid(format!("{}: rx1_dr_offset must be 0..=5", self.dev_eui)));
        }
        Ok(())
    }
}

/// Load a JSON array of device provisions.
pub fn load_devices<P: AsRef<Path>>(path: P) -> Result<Vec<DeviceProvision>, ConfigError> {
    let json = fs::read_to_string(path)?;
    let devices: Vec<DeviceProvision> = serde_json::from_str(&json)?;
    for device in &devices {
        device.validate()?;
    }
    Ok(devices)
}
