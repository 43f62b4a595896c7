//! Bounded per-device signal history used by the ADR algorithm.

use crate::lorawan::StationEui;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Samples kept per device; a recommendation needs a full table.
pub const ADR_HISTORY_CAPACITY: usize = 20;

/// One uplink as seen by the best station that heard it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdrEntry {
    /// 32-bit uplink counter
    pub fcnt: u32,

    /// Best SNR over all stations that heard this uplink (dB)
    pub gateway_snr: f32,

    /// Station that reported `gateway_snr`
    pub gateway_id: StationEui,

    /// Number of stations that heard this uplink
    pub gateway_count: u32,
}

/// Ring buffer of the latest [`ADR_HISTORY_CAPACITY`] uplinks
#[derive(Debug, Clone, Default)]
pub struct AdrTable {
    entries: VecDeque<AdrEntry>,
}

impl AdrTable {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(ADR_HISTORY_CAPACITY),
        }
    }

    /// Add a sample. A second report of the same uplink only bumps the
    /// station count and keeps the better SNR.
    pub fn add(&mut self, fcnt: u32, snr: f32, station: StationEui) {
        if let Some(entry) = self.entries.iter_mut().rev().find(|e| e.fcnt == fcnt) {
            entry.gateway_count += 1;
            if snr > entry.gateway_snr {
                entry.gateway_snr = snr;
                entry.gateway_id = station;
            }
            return;
        }

        self.entries.push_back(AdrEntry {
            fcnt,
            gateway_snr: snr,
            gateway_id: station,
            gateway_count: 1,
        });
        while self.entries.len() > ADR_HISTORY_CAPACITY {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.entries.len() >= ADR_HISTORY_CAPACITY
    }

    pub fn entries(&self) -> impl Iterator<Item = &AdrEntry> {
        self.entries.iter()
    }

    pub fn max_snr(&self) -> Option<f32> {
        self.entries.iter().map(|e| e.gateway_snr).reduce(f32::max)
    }

    /// Share of uplinks missing between the oldest and newest sample.
    pub fn packet_loss(&self) -> f32 {
        let (Some(first), Some(last)) = (self.entries.front(), self.entries.back()) else {
            return 0.0;
        };
        let expected = last.fcnt.saturating_sub(first.fcnt) as f32 + 1.0;
        let received = self.entries.len() as f32;
        ((expected - received) / expected).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::Eui64;
    use proptest::prelude::*;

    #[test]
    fn test_same_uplink_merges() {
        let mut table = AdrTable::new();
        table.add(1, -5.0, Eui64(1));
        table.add(1, 2.0, Eui64(2));
        table.add(1, -1.0, Eui64(3));
        assert_eq!(table.len(), 1);
        let entry = table.entries().next().unwrap();
        assert_eq!(entry.gateway_count, 3);
        assert_eq!(entry.gateway_snr, 2.0);
        assert_eq!(entry.gateway_id, Eui64(2));
    }

    #[test]
    fn test_twenty_first_sample_evicts_oldest() {
        let mut table = AdrTable::new();
        for fcnt in 0..21 {
            table.add(fcnt, 0.0, Eui64(1));
        }
        assert_eq!(table.len(), ADR_HISTORY_CAPACITY);
        assert_eq!(table.entries().next().map(|e| e.fcnt), Some(1));
    }

    #[test]
    fn test_packet_loss() {
        let mut table = AdrTable::new();
        for fcnt in [0, 1, 3, 4, 9] {
            table.add(fcnt, 0.0, Eui64(1));
        }
        assert!((table.packet_loss() - 0.5).abs() < f32::EPSILON);
    }

    proptest! {
        #[test]
        fn prop_table_is_bounded(counters in proptest::collection::vec(0u32..100, 0..200)) {
            let mut table = AdrTable::new();
            for fcnt in counters {
                table.add(fcnt, 0.0, Eui64(1));
                prop_assert!(table.len() <= ADR_HISTORY_CAPACITY);
            }
        }
    }
}
