//! # Frame Counters
//!
//! Rollover inference from the 16-bit wire counter and the downlink counter
//! reservation strategies.
//!
//! A downlink counter must be reserved at most once per uplink across every
//! server instance that heard it. With a single gateway that is a local
//! increment. With several gateways the reservation goes through a
//! [`CounterCoordinator`], an atomic compare-and-reserve service shared by
//! all instances; a reservation of `0` means another instance already
//! answers this uplink.

use crate::error::StoreError;
use crate::lorawan::{DevEui, DevNonce, StationEui};
use crate::session::DeviceSession;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Largest forward jump of the uplink counter accepted (LoRaWAN MAX_FCNT_GAP).
pub const MAX_FCNT_GAP: u32 = 16_384;

/// Reconstruct the 32-bit counter from its 16 low bits, choosing the value
/// nearest to `last` among the current, previous and next 16-bit epochs.
pub fn infer_fcnt32(last: u32, wire: u16) -> u32 {
    let candidate = (last & 0xFFFF_0000) | u32::from(wire);
    let distance = |value: u32| value.abs_diff(last);

    let mut best = candidate;
    if let Some(next) = candidate.checked_add(0x1_0000) {
        if distance(next) < distance(best) {
            best = next;
        }
    }
    if let Some(prev) = candidate.checked_sub(0x1_0000) {
        if distance(prev) < distance(best) {
            best = prev;
        }
    }
    best
}

/// Fleet-wide downlink counter and join arbitration.
#[async_trait]
pub trait CounterCoordinator: Send + Sync + fmt::Debug {
    /// Reserve the downlink counter answering uplink `fcnt_up`. `None` when
    /// another station already holds the reservation for this uplink.
    async fn reserve_next_down(
        &self,
        dev_eui: DevEui,
        fcnt_up: u32,
        current_down: u32,
        station: StationEui,
    ) -> Result<Option<u32>, StoreError>;

    /// Forget all reservations of `dev_eui`.
    async fn reset(&self, dev_eui: DevEui) -> Result<(), StoreError>;

    /// Claim the join with `dev_nonce`; false if another station has it.
    async fn try_claim_join(&self, dev_eui: DevEui, dev_nonce: DevNonce, station: StationEui) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    fcnt_up: u32,
    fcnt_down: u32,
    station: StationEui,
}

/// Coordinator for server instances sharing one process.
#[derive(Debug, Default)]
pub struct InMemoryCounterCoordinator {
    reservations: Mutex<HashMap<DevEui, Reservation>>,
    /// Latest join claim per device
    joins: Mutex<HashMap<DevEui, (DevNonce, StationEui)>>,
}

impl InMemoryCounterCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterCoordinator for InMemoryCounterCoordinator {
    async fn reserve_next_down(
        &self,
        dev_eui: DevEui,
        fcnt_up: u32,
        current_down: u32,
        station: StationEui,
    ) -> Result<Option<u32>, StoreError> {
        let mut reservations = self.reservations.lock().unwrap_or_else(PoisonError::into_inner);
        let last_down = match reservations.get(&dev_eui) {
            Some(r) if fcnt_up < r.fcnt_up => return Ok(None),
            Some(r) if fcnt_up == r.fcnt_up && r.station != station => return Ok(None),
            Some(r) => r.fcnt_down,
            None => 0,
        };

        let fcnt_down = last_down.max(current_down) + 1;
        reservations.insert(
            dev_eui,
            Reservation {
                fcnt_up,
                fcnt_down,
                station,
            },
        );
        Ok(Some(fcnt_down))
    }

    async fn reset(&self, dev_eui: DevEui) -> Result<(), StoreError> {
        self.reservations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&dev_eui);
        Ok(())
    }

    async fn try_claim_join(&self, dev_eui: DevEui, dev_nonce: DevNonce, station: StationEui) -> Result<bool, StoreError> {
        let mut joins = self.joins.lock().unwrap_or_else(PoisonError::into_inner);
        match joins.get(&dev_eui) {
            Some(&(nonce, owner)) if nonce == dev_nonce => Ok(owner == station),
            _ => {
                joins.insert(dev_eui, (dev_nonce, station));
                Ok(true)
            }
        }
    }
}

/// Downlink counter strategy, chosen per device at provisioning time.
#[derive(Debug, Clone)]
pub enum FrameCounterStrategy {
    /// Device served by this instance only.
    SingleGateway,
    /// Device heard by several instances sharing a coordinator.
    MultiGateway(Arc<dyn CounterCoordinator>),
}

impl FrameCounterStrategy {
    /// Reserve the downlink counter for uplink `fcnt_up`; 0 if another actor
    /// already answers it or the coordinator is unreachable.
    pub async fn next_down(&self, session: &DeviceSession, fcnt_up: u32, station: StationEui) -> u32 {
        match self {
            Self::SingleGateway => session.increment_down(),
            Self::MultiGateway(coordinator) => {
                let dev_eui = session.dev_eui();
                match coordinator
                    .reserve_next_down(dev_eui, fcnt_up, session.fcnt_down(), station)
                    .await
                {
                    Ok(Some(fcnt_down)) => {
                        session.set_down(fcnt_down);
                        fcnt_down
                    }
                    Ok(None) => {
                        debug!("{dev_eui}: uplink {fcnt_up} already answered by another gateway");
                        0
                    }
                    Err(e) => {
                        warn!("{dev_eui}: counter coordinator unavailable: {e}");
                        0
                    }
                }
            }
        }
    }

    /// Reset counters after a device restart.
    pub async fn reset(&self, session: &DeviceSession) {
        if let Self::MultiGateway(coordinator) = self {
            if let Err(e) = coordinator.reset(session.dev_eui()).await {
                warn!("{}: failed to reset shared counters: {e}", session.dev_eui());
            }
        }
        session.reset();
    }

    /// Whether this instance may answer the join with `dev_nonce`.
    pub async fn claim_join(&self, dev_eui: DevEui, dev_nonce: DevNonce, station: StationEui) -> bool {
        match self {
            Self::SingleGateway => true,
            Self::MultiGateway(coordinator) => match coordinator.try_claim_join(dev_eui, dev_nonce, station).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!("{dev_eui}: counter coordinator unavailable for join: {e}");
                    false
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::Eui64;
    use proptest::prelude::*;

    #[test]
    fn test_infer_within_epoch() {
        assert_eq!(infer_fcnt32(10, 11), 11);
        assert_eq!(infer_fcnt32(10, 5), 5);
        assert_eq!(infer_fcnt32(0x0001_0010, 0x0020), 0x0001_0020);
    }

    #[test]
    fn test_infer_across_rollover() {
        assert_eq!(infer_fcnt32(0xFFFE, 0x0001), 0x0001_0001);
        assert_eq!(infer_fcnt32(0x0001_0002, 0xFFFF), 0xFFFF);
        assert_eq!(infer_fcnt32(u32::MAX - 1, 0xFFFF), u32::MAX);
    }

    proptest! {
        #[test]
        fn prop_inference_recovers_nearby_counters(last in 0u32..0xFFF0_0000, step in 0u32..0x8000) {
            let next = last + step;
            prop_assert_eq!(infer_fcnt32(last, next as u16), next);
        }
    }

    #[tokio::test]
    async fn test_coordinator_single_reservation_per_uplink() {
        let coordinator = InMemoryCounterCoordinator::new();
        let a = Eui64(0xA);
        let b = Eui64(0xB);

        assert_eq!(coordinator.reserve_next_down(Eui64(1), 5, 0, a).await.unwrap(), Some(1));
        assert_eq!(coordinator.reserve_next_down(Eui64(1), 5, 0, b).await.unwrap(), None);
        // Same station retrying its own uplink gets a fresh counter
        assert_eq!(coordinator.reserve_next_down(Eui64(1), 5, 1, a).await.unwrap(), Some(2));
        assert_eq!(coordinator.reserve_next_down(Eui64(1), 6, 0, b).await.unwrap(), Some(3));
        assert_eq!(coordinator.reserve_next_down(Eui64(1), 4, 0, b).await.unwrap(), None);

        coordinator.reset(Eui64(1)).await.unwrap();
        assert_eq!(coordinator.reserve_next_down(Eui64(1), 1, 0, b).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_coordinator_join_claim() {
        let coordinator = InMemoryCounterCoordinator::new();
        assert!(coordinator.try_claim_join(Eui64(1), DevNonce(9), Eui64(1)).await.unwrap());
        assert!(!coordinator.try_claim_join(Eui64(1), DevNonce(9), Eui64(2)).await.unwrap());
        assert!(coordinator.try_claim_join(Eui64(1), DevNonce(10), Eui64(2)).await.unwrap());
        assert!(!coordinator.try_claim_join(Eui64(1), DevNonce(10), Eui64(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_coordinator_keeps_one_join_claim_per_device() {
        let coordinator = InMemoryCounterCoordinator::new();
        for nonce in 0..100 {
            assert!(coordinator.try_claim_join(Eui64(1), DevNonce(nonce), Eui64(1)).await.unwrap());
        }
        coordinator.try_claim_join(Eui64(2), DevNonce(1), Eui64(1)).await.unwrap();
        assert_eq!(coordinator.joins.lock().unwrap().len(), 2);

        // The claim outlives a counter reset, which follows every accepted join
        coordinator.reset(Eui64(1)).await.unwrap();
        assert!(!coordinator.try_claim_join(Eui64(1), DevNonce(99), Eui64(2)).await.unwrap());
    }
}
