//! # Concentrator Deduplication
//!
//! A device's uplink is often heard by several stations. The first report
//! of an uplink is processed normally; later reports of the same uplink are
//! classified according to the configured [`DeduplicationStrategy`]. An
//! uplink is identified by device, 32-bit counter and MIC, and is remembered
//! until its last receive window opens.

use crate::config::DeduplicationStrategy;
use crate::lorawan::{DevEui, DevNonce, StationEui};
use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

const PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Classification of an uplink report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DedupResult {
    /// First report of this uplink.
    NotDuplicate,
    /// The same station reported the uplink again.
    DuplicateDueToResubmission,
    /// Another station reported it; deliver upstream but do not answer.
    SoftDuplicate,
    /// Another station reported it; drop.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Data { dev_eui: DevEui, fcnt: u32, mic: [u8; 4] },
    Join { dev_eui: DevEui, dev_nonce: DevNonce, mic: [u8; 4] },
}

#[derive(Debug, Clone, Copy)]
struct Seen {
    station: StationEui,
    expires: Instant,
}

#[derive(Debug)]
struct DedupState {
    seen: HashMap<DedupKey, Seen>,
    last_purge: Instant,
}

#[derive(Debug)]
pub struct ConcentratorDeduplicator {
    strategy: DeduplicationStrategy,
    state: Mutex<DedupState>,
}

impl ConcentratorDeduplicator {
    pub fn new(strategy: DeduplicationStrategy) -> Self {
        Self {
            strategy,
            state: Mutex::new(DedupState {
                seen: HashMap::new(),
                last_purge: Instant::now(),
            }),
        }
    }

    pub fn strategy(&self) -> DeduplicationStrategy {
        self.strategy
    }

    /// Classify a report heard by `station`; `deadline` is when the last
    /// receive window of the uplink opens.
    pub fn check(&self, key: DedupKey, station: StationEui, deadline: Instant) -> DedupResult {
        self.check_at(key, station, deadline, Instant::now())
    }

    pub fn check_at(&self, key: DedupKey, station: StationEui, deadline: Instant, now: Instant) -> DedupResult {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if now.saturating_duration_since(state.last_purge) >= PURGE_INTERVAL {
            state.seen.retain(|_, seen| seen.expires > now);
            state.last_purge = now;
        }

        let previous = state.seen.get(&key).filter(|seen| seen.expires > now).copied();
        let Some(previous) = previous else {
            state.seen.insert(key, Seen { station, expires: deadline });
            return DedupResult::NotDuplicate;
        };

        let result = match key {
            DedupKey::Join { .. } => DedupResult::Duplicate,
            DedupKey::Data { .. } if previous.station == station => DedupResult::DuplicateDueToResubmission,
            DedupKey::Data { .. } => match self.strategy {
                DeduplicationStrategy::Drop => DedupResult::Duplicate,
                DeduplicationStrategy::Mark | DeduplicationStrategy::None => DedupResult::SoftDuplicate,
            },
        };
        debug!(
            "{key:?} from {station} already seen from {}: {result:?}",
            previous.station
        );
        result
    }

    /// Entries currently remembered.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::Eui64;

    fn key(fcnt: u32) -> DedupKey {
        DedupKey::Data {
            dev_eui: Eui64(1),
            fcnt,
            mic: [1, 2, 3, 4],
        }
    }

    #[test]
    fn test_drop_policy() {
        let dedup = ConcentratorDeduplicator::new(DeduplicationStrategy::Drop);
        let now = Instant::now();
        let deadline = now + Duration::from_secs(2);
        assert_eq!(dedup.check_at(key(1), Eui64(1), deadline, now), DedupResult::NotDuplicate);
        assert_eq!(dedup.check_at(key(1), Eui64(2), deadline, now), DedupResult::Duplicate);
        assert_eq!(
            dedup.check_at(key(1), Eui64(1), deadline, now),
            DedupResult::DuplicateDueToResubmission
        );
        assert_eq!(dedup.check_at(key(2), Eui64(2), deadline, now), DedupResult::NotDuplicate);
    }

    #[test]
    fn test_mark_and_none_are_soft() {
        for strategy in [DeduplicationStrategy::Mark, DeduplicationStrategy::None] {
            let dedup = ConcentratorDeduplicator::new(strategy);
            let now = Instant::now();
            let deadline = now + Duration::from_secs(2);
            dedup.check_at(key(1), Eui64(1), deadline, now);
            assert_eq!(dedup.check_at(key(1), Eui64(2), deadline, now), DedupResult::SoftDuplicate);
        }
    }

    #[test]
    fn test_entry_expires_at_deadline() {
        let dedup = ConcentratorDeduplicator::new(DeduplicationStrategy::Drop);
        let now = Instant::now();
        let deadline = now + Duration::from_secs(2);
        dedup.check_at(key(1), Eui64(1), deadline, now);
        let later = now + Duration::from_secs(3);
        assert_eq!(
            dedup.check_at(key(1), Eui64(2), later + Duration::from_secs(2), later),
            DedupResult::NotDuplicate
        );
        // The expired entry was purged and replaced
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_join_repeat_is_duplicate() {
        let dedup = ConcentratorDeduplicator::new(DeduplicationStrategy::None);
        let now = Instant::now();
        let join = DedupKey::Join {
            dev_eui: Eui64(1),
            dev_nonce: DevNonce(3),
            mic: [0; 4],
        };
        let deadline = now + Duration::from_secs(6);
        assert_eq!(dedup.check_at(join, Eui64(1), deadline, now), DedupResult::NotDuplicate);
        assert_eq!(dedup.check_at(join, Eui64(1), deadline, now), DedupResult::Duplicate);
    }
}
