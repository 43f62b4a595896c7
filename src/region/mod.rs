//! # Regional Parameters
//!
//! The [`Region`] trait is the read-only capability the pipeline consults for
//! downstream radio parameters, payload limits, receive-window delays and
//! ADR bounds. Regions are shared as `Arc<dyn Region>` between sessions.

pub mod eu868;

pub use eu868::Eu868;

use crate::error::RegionError;
use crate::lorawan::DataRate;
use std::fmt;
use std::time::Duration;

/// Fixed delays between the end of an uplink and the opening of each window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDelays {
    pub rx1: Duration,
    pub rx2: Duration,
    pub join_accept1: Duration,
    pub join_accept2: Duration,
}

/// Frequency and data rate of one downlink window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RadioParams {
    /// Hz
    pub frequency: u32,
    pub data_rate: DataRate,
}

/// Regional parameter table.
pub trait Region: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn window_delays(&self) -> WindowDelays;

    /// RX1 parameters for an uplink received on `up_frequency` at `up_data_rate`.
    fn downstream_rx1(
        &self,
        up_frequency: u32,
        up_data_rate: DataRate,
        rx1_dr_offset: u8,
    ) -> Result<RadioParams, RegionError>;

    fn rx2_default(&self) -> RadioParams;

    /// Maximum MACPayload size for `data_rate`.
    fn max_payload_size(&self, data_rate: DataRate, dwell_time_limited: bool) -> Result<usize, RegionError>;

    /// Demodulation floor in dB for `data_rate`.
    fn required_snr(&self, data_rate: DataRate) -> Result<f32, RegionError>;

    fn max_adr_data_rate(&self) -> DataRate;

    /// Highest (weakest) tx-power index the ADR may command.
    fn max_tx_power_index(&self) -> u8;

    /// Channel mask sent with every `LinkADRReq`.
    fn adr_channel_mask(&self) -> u16;

    fn validate_upstream(&self, frequency: u32, data_rate: DataRate) -> Result<(), RegionError>;
}
