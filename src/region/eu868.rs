use super::{RadioParams, Region, WindowDelays};
use crate::error::RegionError;
use crate::lorawan::DataRate;
use std::time::Duration;

const NAME: &str = "EU868";
const BAND_MIN_HZ: u32 = 863_000_000;
const BAND_MAX_HZ: u32 = 870_000_000;
const RX2_FREQUENCY_HZ: u32 = 869_525_000;
const MAX_UPSTREAM_DR: u8 = 7;

/// Maximum MACPayload size (M) per data rate, repeater-compatible.
const MAX_PAYLOAD: [usize; 8] = [59, 59, 59, 123, 230, 230, 230, 230];

/// Demodulation floor per LoRa spreading factor (SF12..SF7).
const REQUIRED_SNR: [f32; 7] = [-20.0, -17.5, -15.0, -12.5, -10.0, -7.5, -7.5];

/// EU 863-870 MHz ISM band.
#[derive(Debug, Clone, Copy, Default)]
pub struct Eu868;

impl Eu868 {
    fn check_dr(data_rate: DataRate) -> Result<usize, RegionError> {
        if data_rate.0 > MAX_UPSTREAM_DR {
            return Err(RegionError::UnsupportedDataRate(data_rate.0, NAME));
        }
        Ok(data_rate.0 as usize)
    }
}

impl Region for Eu868 {
    fn name(&self) -> &'static str {
        NAME
    }

    fn window_delays(&self) -> WindowDelays {
        WindowDelays {
            rx1: Duration::from_secs(1),
            rx2: Duration::from_secs(2),
            join_accept1: Duration::from_secs(5),
            join_accept2: Duration::from_secs(6),
        }
    }

    fn downstream_rx1(
        &self,
        up_frequency: u32,
        up_data_rate: DataRate,
        rx1_dr_offset: u8,
    ) -> Result<RadioParams, RegionError> {
        if rx1_dr_offset > 5 {
            return Err(RegionError::InvalidRx1Offset(rx1_dr_offset));
        }
        self.validate_upstream(up_frequency, up_data_rate)?;
        Ok(RadioParams {
            frequency: up_frequency,
            data_rate: DataRate(up_data_rate.0.saturating_sub(rx1_dr_offset)),
        })
    }

    fn rx2_default(&self) -> RadioParams {
        RadioParams {
            frequency: RX2_FREQUENCY_HZ,
            data_rate: DataRate(0),
        }
    }

    // EU868 has no dwell-time limit
    fn max_payload_size(&self, data_rate: DataRate, _dwell_time_limited: bool) -> Result<usize, RegionError> {
        Ok(MAX_PAYLOAD[Self::check_dr(data_rate)?])
    }

    fn required_snr(&self, data_rate: DataRate) -> Result<f32, RegionError> {
        REQUIRED_SNR
            .get(data_rate.0 as usize)
            .copied()
            .ok_or(RegionError::UnsupportedDataRate(data_rate.0, NAME))
    }

    fn max_adr_data_rate(&self) -> DataRate {
        DataRate(5)
    }

    fn max_tx_power_index(&self) -> u8 {
        7
    }

    fn adr_channel_mask(&self) -> u16 {
        0x00FF
    }

    fn validate_upstream(&self, frequency: u32, data_rate: DataRate) -> Result<(), RegionError> {
        if !(BAND_MIN_HZ..=BAND_MAX_HZ).contains(&frequency) {
            return Err(RegionError::FrequencyOutOfBand(frequency, NAME));
        }
        Self::check_dr(data_rate).map(|_| ())
    }
}
