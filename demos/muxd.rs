//! Minimal daemon wiring: opens a real serial device, powers the link on,
//! and runs the event loop forever. No GPIO control and no supervisor
//! wire protocol are implemented here — both stay behind `NullPower`/
//! `NullNotify`, same as the library's own tests. A real deployment
//! swaps those two for whatever talks to the actual hardware and
//! control channel.

use std::time::Duration;

use ts0710_mux::{CmuxMode, Config, Muxer, NullNotify, NullPower, SupervisorApi};

fn main() {
    env_logger::init();

    let device_path = std::env::args().nth(1).unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    let mut config = Config::new(device_path);
    config.cmux_mode = CmuxMode::Basic;
    config.ping_max = 3;
    config.silence_timeout = Duration::from_secs(30);

    let mut muxer = Muxer::new(config, NullPower::default(), NullNotify);
    muxer.set_power(true);

    log::info!("muxd starting, device={:?}", std::env::args().nth(1));

    loop {
        if let Err(e) = muxer.step() {
            log::error!("event loop step failed: {e}");
        }
    }
}
