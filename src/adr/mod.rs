//! # Adaptive Data Rate
//!
//! Network-side ADR: every uplink's best SNR is recorded in a per-device
//! [`AdrTable`]. When the device sets ADRACKReq and the table is full, the
//! SNR margin above the data rate's demodulation floor is turned into data
//! rate and tx power steps, and the repetition count follows packet loss.
//!
//! A recommendation is only confirmable when a downlink counter could be
//! reserved to carry it; otherwise the previous settings stay in force.

pub mod table;

pub use table::{AdrEntry, AdrTable, ADR_HISTORY_CAPACITY};

use crate::lorawan::{DataRate, DevEui, StationEui};
use crate::region::Region;
use crate::session::DeviceSession;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// dB of margin per data rate or tx power step
const ADR_STEP_DB: f32 = 3.0;
const MAX_NB_REP: u8 = 3;

/// Radio settings commanded through `LinkADRReq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdrSettings {
    pub data_rate: DataRate,
    /// Region tx power index; 0 is the maximum power
    pub tx_power: u8,
    pub nb_rep: u8,
}

/// Reason for an ADR outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdrReason {
    /// Sample recorded, no recommendation requested
    Recorded,
    /// Fewer than a full table of samples
    InsufficientHistory,
    /// New settings computed
    Computed,
    /// Settings computed but no downlink counter could be reserved
    ReservationFailed,
}

/// Inputs for one uplink.
#[derive(Debug, Clone, Copy)]
pub struct AdrRequest {
    pub fcnt_up: u32,
    pub snr: f32,
    pub station: StationEui,
    pub data_rate: DataRate,
    /// ADRACKReq bit of the uplink
    pub compute: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdrOutcome {
    pub data_rate: DataRate,
    pub tx_power: u8,
    pub nb_rep: u8,
    pub can_confirm: bool,
    /// Downlink counter reserved to carry the settings, 0 if none
    pub reserved_fcnt_down: u32,
    pub sample_count: usize,
    pub reason: AdrReason,
}

impl AdrOutcome {
    pub fn settings(&self) -> AdrSettings {
        AdrSettings {
            data_rate: self.data_rate,
            tx_power: self.tx_power,
            nb_rep: self.nb_rep,
        }
    }
}

/// Compute new settings from the table, starting from `current`.
pub fn compute_recommendation(
    table: &AdrTable,
    current: AdrSettings,
    installation_margin_db: f32,
    region: &dyn Region,
) -> AdrSettings {
    let Some(max_snr) = table.max_snr() else {
        return current;
    };
    let Ok(required) = region.required_snr(current.data_rate) else {
        return current;
    };

    let margin = max_snr - required - installation_margin_db;
    let mut steps = (margin / ADR_STEP_DB).floor() as i32;
    let mut data_rate = current.data_rate.0;
    let mut tx_power = current.tx_power;
    let max_dr = region.max_adr_data_rate().0;
    let max_tx = region.max_tx_power_index();

    while steps > 0 && data_rate < max_dr {
        data_rate += 1;
        steps -= 1;
    }
    while steps > 0 && tx_power < max_tx {
        tx_power += 1;
        steps -= 1;
    }
    while steps < 0 && tx_power > 0 {
        tx_power -= 1;
        steps += 1;
    }

    let loss = table.packet_loss();
    let nb_rep = if loss < 0.05 {
        current.nb_rep.saturating_sub(1).max(1)
    } else if loss < 0.10 {
        current.nb_rep
    } else if loss < 0.30 {
        (current.nb_rep + 1).min(MAX_NB_REP)
    } else {
        MAX_NB_REP
    };

    AdrSettings {
        data_rate: DataRate(data_rate),
        tx_power,
        nb_rep,
    }
}

/// Per-device ADR state, shared by all sessions of a server instance.
#[derive(Debug)]
pub struct AdrManager {
    tables: Mutex<HashMap<DevEui, AdrTable>>,
    installation_margin_db: f32,
}

impl AdrManager {
    pub fn new(installation_margin_db: f32) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            installation_margin_db,
        }
    }

    /// Record the sample and, when requested, compute and try to confirm
    /// new settings.
    pub async fn process(&self, request: AdrRequest, session: &DeviceSession) -> AdrOutcome {
        let dev_eui = session.dev_eui();
        let current = session.adr_settings().unwrap_or(AdrSettings {
            data_rate: request.data_rate,
            tx_power: 0,
            nb_rep: 1,
        });
        let unconfirmed = |sample_count, reason| AdrOutcome {
            data_rate: current.data_rate,
            tx_power: current.tx_power,
            nb_rep: current.nb_rep,
            can_confirm: false,
            reserved_fcnt_down: 0,
            sample_count,
            reason,
        };

        let (recommendation, sample_count) = {
            let mut tables = self.tables.lock().await;
            let table = tables.entry(dev_eui).or_insert_with(AdrTable::new);
            table.add(request.fcnt_up, request.snr, request.station);
            let sample_count = table.len();

            if !request.compute {
                return unconfirmed(sample_count, AdrReason::Recorded);
            }
            if !table.is_complete() {
                debug!("{dev_eui}: ADR has {sample_count} samples, keeping current settings");
                return unconfirmed(sample_count, AdrReason::InsufficientHistory);
            }

            // Start from the rate the device actually used
            let base = AdrSettings {
                data_rate: request.data_rate,
                ..current
            };
            (
                compute_recommendation(table, base, self.installation_margin_db, session.region().as_ref()),
                sample_count,
            )
        };

        let fcnt_down = session
            .strategy()
            .next_down(session, request.fcnt_up, request.station)
            .await;
        if fcnt_down == 0 {
            return unconfirmed(sample_count, AdrReason::ReservationFailed);
        }

        session.set_adr_settings(recommendation);
        info!(
            "{dev_eui}: ADR recommends {} tx power {} nb_rep {}",
            recommendation.data_rate, recommendation.tx_power, recommendation.nb_rep
        );

        AdrOutcome {
            data_rate: recommendation.data_rate,
            tx_power: recommendation.tx_power,
            nb_rep: recommendation.nb_rep,
            can_confirm: true,
            reserved_fcnt_down: fcnt_down,
            sample_count,
            reason: AdrReason::Computed,
        }
    }

    /// Drop the history of `dev_eui` after a join or a device restart.
    pub async fn reset(&self, dev_eui: DevEui) {
        self.tables.lock().await.remove(&dev_eui);
    }

    /// Samples currently held for `dev_eui`.
    pub async fn sample_count(&self, dev_eui: DevEui) -> usize {
        self.tables.lock().await.get(&dev_eui).map_or(0, AdrTable::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::Eui64;
    use crate::region::Eu868;

    fn full_table(snr: f32) -> AdrTable {
        let mut table = AdrTable::new();
        for fcnt in 0..ADR_HISTORY_CAPACITY as u32 {
            table.add(fcnt, snr, Eui64(1));
        }
        table
    }

    fn settings(dr: u8, tx: u8, nb: u8) -> AdrSettings {
        AdrSettings {
            data_rate: DataRate(dr),
            tx_power: tx,
            nb_rep: nb,
        }
    }

    #[test]
    fn test_strong_signal_raises_rate_then_lowers_power() {
        // DR0 needs -20 dB: margin 10 - (-20) - 5 = 25 dB, 8 steps
        let rec = compute_recommendation(&full_table(10.0), settings(0, 0, 1), 5.0, &Eu868);
        assert_eq!(rec.data_rate, DataRate(5));
        assert_eq!(rec.tx_power, 3);
        assert_eq!(rec.nb_rep, 1);
    }

    #[test]
    fn test_weak_signal_raises_power() {
        // DR5 needs -7.5 dB: margin -12 + 7.5 - 5 = -9.5 dB, -4 steps
        let rec = compute_recommendation(&full_table(-12.0), settings(5, 2, 1), 5.0, &Eu868);
        assert_eq!(rec.data_rate, DataRate(5));
        assert_eq!(rec.tx_power, 0);
    }

    #[test]
    fn test_loss_raises_repetitions() {
        let mut table = AdrTable::new();
        for fcnt in (0..40).step_by(2) {
            table.add(fcnt, 0.0, Eui64(1));
        }
        let rec = compute_recommendation(&table, settings(2, 0, 1), 5.0, &Eu868);
        assert_eq!(rec.nb_rep, 3);
    }
}
