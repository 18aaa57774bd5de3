//! Periodic liveness tracking (§4.F). Fires on the 5-second timer
//! bound into the event loop; the actual ping frame is built here, the
//! actual write happens in `link.rs`.

use std::time::{Duration, Instant};

/// What the watchdog decided to do on one tick. The caller applies the
/// side effect (send a frame, or tear the link down).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    SendPing,
    CloseDown,
    Nothing,
}

#[derive(Debug)]
pub struct Watchdog {
    pub ping_max: u32,
    pub silence_timeout: Duration,
    pub pings_outstanding: u32,
    pub last_frame_time: Instant,
}

impl Watchdog {
    pub fn new(ping_max: u32, silence_timeout: Duration, now: Instant) -> Self {
        Self {
            ping_max,
            silence_timeout,
            pings_outstanding: 0,
            last_frame_time: now,
        }
    }

    /// Call on receipt of any valid frame: clears the liveness counters.
    pub fn note_frame_received(&mut self, now: Instant) {
        self.last_frame_time = now;
        self.pings_outstanding = 0;
    }

    /// Call once per 5-second tick while MUXING.
    pub fn tick(&mut self, now: Instant) -> WatchdogAction {
        if self.silence_timeout > Duration::ZERO
            && now.duration_since(self.last_frame_time) > self.silence_timeout
        {
            return WatchdogAction::CloseDown;
        }
        if self.ping_max > 0 && self.pings_outstanding >= self.ping_max {
            return WatchdogAction::CloseDown;
        }
        if self.ping_max > 0 {
            self.pings_outstanding += 1;
            return WatchdogAction::SendPing;
        }
        WatchdogAction::Nothing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pings_when_max_is_set() {
        let now = Instant::now();
        let mut wd = Watchdog::new(3, Duration::ZERO, now);
        assert_eq!(wd.tick(now), WatchdogAction::SendPing);
        assert_eq!(wd.pings_outstanding, 1);
    }

    #[test]
    fn closes_down_after_ping_max_exceeded() {
        let now = Instant::now();
        let mut wd = Watchdog::new(2, Duration::ZERO, now);
        wd.tick(now); // outstanding = 1
        wd.tick(now); // outstanding = 2
        assert_eq!(wd.tick(now), WatchdogAction::CloseDown);
    }

    #[test]
    fn receiving_a_frame_resets_counters() {
        let now = Instant::now();
        let mut wd = Watchdog::new(2, Duration::ZERO, now);
        wd.tick(now);
        wd.tick(now);
        wd.note_frame_received(now);
        assert_eq!(wd.pings_outstanding, 0);
        assert_eq!(wd.tick(now), WatchdogAction::SendPing);
    }

    #[test]
    fn disabled_watchdog_does_nothing() {
        let now = Instant::now();
        let mut wd = Watchdog::new(0, Duration::ZERO, now);
        assert_eq!(wd.tick(now), WatchdogAction::Nothing);
    }

    #[test]
    fn silence_timeout_closes_down_even_without_ping_max() {
        let t0 = Instant::now();
        let mut wd = Watchdog::new(0, Duration::from_secs(10), t0);
        let later = t0 + Duration::from_secs(11);
        assert_eq!(wd.tick(later), WatchdogAction::CloseDown);
    }
}
