//! Black-box coverage of the crate's public surface: what a supervisor
//! sees without any real modem attached. Exercises the `SupervisorApi`/
//! `SupervisorNotify` contract end to end; the protocol-level scenarios
//! (frame round-trips, watchdog ping/close-down, per-DLCI teardown) are
//! covered next to the code they exercise, inside each module's own
//! `#[cfg(test)]` block.

use std::sync::{Arc, Mutex};

use ts0710_mux::{Config, Muxer, NullPower, SupervisorApi, SupervisorNotify};

#[derive(Clone, Default)]
struct SharedLog(Arc<Mutex<Vec<bool>>>);

impl SupervisorNotify for SharedLog {
    fn trigger(&mut self, active: bool) {
        self.0.lock().unwrap().push(active);
    }
}

#[test]
fn fresh_session_is_powered_off_and_has_no_channels() {
    let muxer = Muxer::new(Config::new("/dev/null"), NullPower::default(), SharedLog::default());
    assert!(!muxer.get_power());
}

#[test]
fn alloc_channel_is_rejected_before_muxing() {
    let mut muxer = Muxer::new(Config::new("/dev/null"), NullPower::default(), SharedLog::default());
    let err = muxer.alloc_channel("ppp0".to_string()).unwrap_err();
    assert!(matches!(err, ts0710_mux::Error::NotMuxing));
}

#[test]
fn set_power_on_reports_power_up_immediately() {
    let mut muxer = Muxer::new(Config::new("/dev/null"), NullPower::default(), SharedLog::default());
    assert!(!muxer.get_power());
    muxer.set_power(true);
    assert!(muxer.get_power());
}

#[test]
fn set_power_off_when_already_off_does_not_notify() {
    let log = SharedLog::default();
    let mut muxer = Muxer::new(Config::new("/dev/null"), NullPower::default(), log.clone());
    muxer.set_power(false);
    assert!(log.0.lock().unwrap().is_empty());
}
