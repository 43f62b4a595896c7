//! # Rate-Limited Logging
//!
//! A network server hears every frame in radio range, including frames of
//! devices that belong to other networks. MIC mismatches and decoder failures
//! for those would flood the log, so such warnings go through a [`LogThrottle`].

use super::hex::encode_hex_upper;
use log::debug;
use std::time::{Duration, Instant};

/// Throttling structure for rate-limiting log messages
#[derive(Debug)]
pub struct LogThrottle {
    /// Time window for throttling
    window: Duration,
    /// Maximum messages allowed per window
    cap: u32,
    /// Current message count in window
    count: u32,
    /// Messages suppressed in the current window
    suppressed: u32,
    /// Start time of current window
    t0: Instant,
}

impl LogThrottle {
    /// Create new throttle with time window (milliseconds) and message cap
    ///
    /// # Examples
    /// ```rust
    /// use lorans_rs::util::throttle::LogThrottle;
    ///
    /// // Allow 5 messages per second
    /// let mut throttle = LogThrottle::new(1000, 5);
    /// assert!(throttle.allow());
    /// ```
    pub fn new(window_ms: u64, cap: u32) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            cap,
            count: 0,
            suppressed: 0,
            t0: Instant::now(),
        }
    }

    /// Check if logging is allowed (resets counter after window expires)
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Same as [`LogThrottle::allow`] with an explicit clock reading.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.t0) > self.window {
            if self.suppressed > 0 {
                debug!("{} log messages suppressed in last window", self.suppressed);
            }
            self.t0 = now;
            self.count = 0;
            self.suppressed = 0;
        }

        self.count += 1;
        let allowed = self.count <= self.cap;
        if !allowed {
            self.suppressed += 1;
        }
        allowed
    }

    /// Number of messages dropped in the current window
    pub fn suppressed(&self) -> u32 {
        self.suppressed
    }
}

/// Log a frame as hex at debug level, prefixed with its context.
pub fn log_frame_hex(prefix: &str, data: &[u8]) {
    if log::log_enabled!(log::Level::Debug) {
        debug!("{prefix} ({} bytes): {}", data.len(), encode_hex_upper(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_throttle_cap() {
        let mut throttle = LogThrottle::new(10_000, 2);
        let now = Instant::now();
        assert!(throttle.allow_at(now));
        assert!(throttle.allow_at(now));
        assert!(!throttle.allow_at(now));
        assert_eq!(throttle.suppressed(), 1);
    }

    #[test]
    fn test_log_throttle_window_reset() {
        let mut throttle = LogThrottle::new(100, 1);
        let now = Instant::now();
        assert!(throttle.allow_at(now));
        assert!(!throttle.allow_at(now));
        assert!(throttle.allow_at(now + Duration::from_millis(150)));
        assert_eq!(throttle.suppressed(), 0);
    }
}
