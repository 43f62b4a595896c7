//! # Receive-Window Timing
//!
//! A class A device opens two short receive windows after each uplink. The
//! [`OperationTimeWatcher`] compares time elapsed since the uplink arrived
//! against the regional window delays so the pipeline can skip downstream
//! work once a window can no longer be reached. All queries are pure reads
//! of the clock.

use crate::region::WindowDelays;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Time needed to build a downlink and hand it to the station.
pub const EXPECTED_TIME_TO_PACKAGE_AND_SEND: Duration = Duration::from_millis(300);

/// Receive window used for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReceiveWindow {
    Rx1,
    Rx2,
}

/// Elapsed-time calculator for one uplink.
#[derive(Debug, Clone, Copy)]
pub struct OperationTimeWatcher {
    started: Instant,
    delays: WindowDelays,
}

impl OperationTimeWatcher {
    pub fn new(delays: WindowDelays, started: Instant) -> Self {
        Self { started, delays }
    }

    /// Apply a per-device RX1 delay in seconds; RX2 follows one second later.
    /// A delay of 0 means 1 second, as on the device.
    pub fn with_rx_delay(mut self, rx_delay: Option<u8>) -> Self {
        if let Some(secs) = rx_delay {
            let rx1 = Duration::from_secs(u64::from(secs.max(1)));
            self.delays.rx1 = rx1;
            self.delays.rx2 = rx1 + Duration::from_secs(1);
        }
        self
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn delays(&self) -> WindowDelays {
        self.delays
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    fn window_delay(&self, window: ReceiveWindow, join: bool) -> Duration {
        match (window, join) {
            (ReceiveWindow::Rx1, false) => self.delays.rx1,
            (ReceiveWindow::Rx2, false) => self.delays.rx2,
            (ReceiveWindow::Rx1, true) => self.delays.join_accept1,
            (ReceiveWindow::Rx2, true) => self.delays.join_accept2,
        }
    }

    /// Time left to start packaging a reply for `window`.
    pub fn remaining_at(&self, window: ReceiveWindow, join: bool, now: Instant) -> Duration {
        self.window_delay(window, join)
            .saturating_sub(self.elapsed_at(now))
            .saturating_sub(EXPECTED_TIME_TO_PACKAGE_AND_SEND)
    }

    pub fn in_time_for_at(&self, window: ReceiveWindow, join: bool, now: Instant) -> bool {
        self.elapsed_at(now) + EXPECTED_TIME_TO_PACKAGE_AND_SEND < self.window_delay(window, join)
    }

    pub fn in_time_for(&self, window: ReceiveWindow) -> bool {
        self.in_time_for_at(window, false, Instant::now())
    }

    pub fn in_time_for_join_accept(&self, window: ReceiveWindow) -> bool {
        self.in_time_for_at(window, true, Instant::now())
    }

    /// Whether any data window can still be reached.
    pub fn in_time_for_any_window(&self) -> bool {
        self.in_time_for(ReceiveWindow::Rx2)
    }

    /// Earliest reachable data window, honouring the device preference.
    pub fn resolve_window_at(&self, preferred: ReceiveWindow, now: Instant) -> Option<ReceiveWindow> {
        self.resolve(preferred, false, now)
    }

    pub fn resolve_window(&self, preferred: ReceiveWindow) -> Option<ReceiveWindow> {
        self.resolve(preferred, false, Instant::now())
    }

    pub fn resolve_join_accept_window_at(&self, now: Instant) -> Option<ReceiveWindow> {
        self.resolve(ReceiveWindow::Rx1, true, now)
    }

    fn resolve(&self, preferred: ReceiveWindow, join: bool, now: Instant) -> Option<ReceiveWindow> {
        if preferred == ReceiveWindow::Rx1 && self.in_time_for_at(ReceiveWindow::Rx1, join, now) {
            return Some(ReceiveWindow::Rx1);
        }
        self.in_time_for_at(ReceiveWindow::Rx2, join, now)
            .then_some(ReceiveWindow::Rx2)
    }

    /// Instant at which the last window of this uplink opens; duplicates of
    /// the uplink are irrelevant after it.
    pub fn last_window_deadline(&self, join: bool) -> Instant {
        self.started + self.window_delay(ReceiveWindow::Rx2, join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Eu868, Region};

    fn watcher() -> (OperationTimeWatcher, Instant) {
        let start = Instant::now();
        (OperationTimeWatcher::new(Eu868.window_delays(), start), start)
    }

    #[test]
    fn test_fresh_uplink_prefers_rx1() {
        let (w, start) = watcher();
        assert!(w.in_time_for_at(ReceiveWindow::Rx1, false, start));
        assert_eq!(w.resolve_window_at(ReceiveWindow::Rx1, start), Some(ReceiveWindow::Rx1));
        assert_eq!(w.resolve_window_at(ReceiveWindow::Rx2, start), Some(ReceiveWindow::Rx2));
        assert_eq!(w.remaining_at(ReceiveWindow::Rx1, false, start), Duration::from_millis(700));
    }

    #[test]
    fn test_falls_back_to_rx2_then_none() {
        let (w, start) = watcher();
        let late = start + Duration::from_millis(800);
        assert_eq!(w.resolve_window_at(ReceiveWindow::Rx1, late), Some(ReceiveWindow::Rx2));
        let too_late = start + Duration::from_millis(1_750);
        assert_eq!(w.resolve_window_at(ReceiveWindow::Rx1, too_late), None);
        assert_eq!(w.remaining_at(ReceiveWindow::Rx2, false, too_late), Duration::ZERO);
    }

    #[test]
    fn test_join_windows_are_longer() {
        let (w, start) = watcher();
        let at = start + Duration::from_secs(4);
        assert_eq!(w.resolve_window_at(ReceiveWindow::Rx1, at), None);
        assert_eq!(w.resolve_join_accept_window_at(at), Some(ReceiveWindow::Rx1));
        assert_eq!(w.last_window_deadline(true), start + Duration::from_secs(6));
    }

    #[test]
    fn test_rx_delay_override() {
        let (w, start) = watcher();
        let w = w.with_rx_delay(Some(3));
        assert_eq!(w.delays().rx2, Duration::from_secs(4));
        assert_eq!(
            w.resolve_window_at(ReceiveWindow::Rx1, start + Duration::from_millis(2_500)),
            Some(ReceiveWindow::Rx1)
        );
        let zero = watcher().0.with_rx_delay(Some(0));
        assert_eq!(zero.delays().rx1, Duration::from_secs(1));
    }
}
