//! Single-threaded cooperative readiness multiplexer (§4.G, §5). Polls
//! the serial fd, every open pty fd, and a 5-second timer in one loop.
//! Supervisor calls land as ordinary method calls on `Muxer` rather
//! than through a thread handoff — there's only ever the one thread.

use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::channel::ChannelTable;
use crate::config::Config;
use crate::error::Result;
use crate::link::Link;
use crate::power::ModemPower;
use crate::supervisor::{SupervisorApi, SupervisorNotify};

const WATCHDOG_PERIOD: Duration = Config::WATCHDOG_PERIOD;

/// Owns the whole session: the link, the channel table, the modem power
/// capability, and the supervisor's MUXING-entry/exit notification sink.
/// This is the type a supervisor actually talks to.
pub struct Muxer<P: ModemPower, N: SupervisorNotify> {
    link: Link,
    channels: ChannelTable,
    power: P,
    notify: N,
    next_watchdog: Instant,
}

impl<P: ModemPower, N: SupervisorNotify> Muxer<P, N> {
    pub fn new(config: Config, power: P, notify: N) -> Self {
        let next_watchdog = Instant::now() + WATCHDOG_PERIOD;
        Self {
            link: Link::new(config),
            channels: ChannelTable::new(),
            power,
            notify,
            next_watchdog,
        }
    }

    /// Runs one pass: ticks the watchdog if due, then polls every live
    /// source and handles whatever's ready. The caller (the daemon's
    /// `main`) is expected to call this in a loop for the process
    /// lifetime, interleaving it with `SupervisorApi` calls.
    pub fn step(&mut self) -> Result<()> {
        let now = Instant::now();
        if now >= self.next_watchdog {
            let was_muxing = self.link.is_muxing();
            self.link.on_watchdog_tick(now, &mut self.power, &mut self.channels);
            self.fire_trigger(was_muxing);
            self.next_watchdog = now + WATCHDOG_PERIOD;
        }

        self.poll_and_dispatch(now)
    }

    fn fire_trigger(&mut self, was_muxing: bool) {
        let is_muxing = self.link.is_muxing();
        if was_muxing != is_muxing {
            self.notify.trigger(is_muxing);
        }
    }

    /// Polls every live source and returns which ones are ready. Kept
    /// separate from dispatch so the borrows the `PollFd`s hold on
    /// `self.link`/`self.channels` end before we need `&mut` access to
    /// either to handle what came back.
    fn poll_ready(&self, remaining_ms: u16) -> Result<(bool, Vec<(u8, PollFlags)>)> {
        let serial_fd = self.link.serial_fd();
        let pty_ids: Vec<u8> = self
            .channels
            .iter()
            .filter(|c| c.fd().is_some())
            .map(|c| c.id)
            .collect();

        let mut fds = Vec::with_capacity(pty_ids.len() + 1);
        if let Some(fd) = serial_fd {
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }
        let has_serial = !fds.is_empty();
        for &id in &pty_ids {
            if let Some(raw) = self.channels.get(id).and_then(|c| c.fd()) {
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(raw) };
                fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
            }
        }

        if fds.is_empty() {
            return Ok((false, vec![]));
        }

        let n = poll(&mut fds, PollTimeout::from(remaining_ms)).map_err(std::io::Error::from)?;
        if n <= 0 {
            return Ok((false, vec![]));
        }

        let mut idx = 0;
        let serial_ready = if has_serial {
            let revents = fds[idx].revents().unwrap_or(PollFlags::empty());
            idx += 1;
            revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
        } else {
            false
        };

        let mut pty_ready = Vec::new();
        for &id in &pty_ids {
            if idx >= fds.len() {
                break;
            }
            if let Some(revents) = fds[idx].revents() {
                if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                    pty_ready.push((id, revents));
                }
            }
            idx += 1;
        }

        Ok((serial_ready, pty_ready))
    }

    fn poll_and_dispatch(&mut self, now: Instant) -> Result<()> {
        let remaining = self
            .next_watchdog
            .saturating_duration_since(now)
            .as_millis()
            .min(u16::MAX as u128) as u16;

        let (serial_ready, pty_ready) = self.poll_ready(remaining)?;

        if serial_ready {
            let was_muxing = self.link.is_muxing();
            if let Err(e) = self.link.on_serial_readable(&mut self.channels, &mut self.power) {
                log::warn!("serial link error, closing: {e}");
                self.link.state = crate::link::LinkState::Closing;
            }
            self.fire_trigger(was_muxing);
        }

        for (id, revents) in pty_ready {
            if revents.intersects(PollFlags::POLLIN) {
                if let Err(e) = self.link.pump_pty_output(&mut self.channels, id, &mut self.power) {
                    log::debug!("pty {id} read error: {e}, closing channel");
                    let _ = self.link.close_channel(&mut self.channels, id, &mut self.power);
                }
            }
            if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                let _ = self.link.close_channel(&mut self.channels, id, &mut self.power);
            }
        }

        Ok(())
    }
}

impl<P: ModemPower, N: SupervisorNotify> SupervisorApi for Muxer<P, N> {
    fn get_power(&self) -> bool {
        self.link.state != crate::link::LinkState::Off
    }

    fn set_power(&mut self, on: bool) {
        let was_muxing = self.link.is_muxing();
        if on {
            self.link.power_on(&mut self.power);
        } else {
            self.link.power_off(&mut self.power, &mut self.channels);
        }
        self.fire_trigger(was_muxing);
    }

    fn alloc_channel(&mut self, purpose: String) -> Result<std::path::PathBuf> {
        if !self.link.is_muxing() {
            return Err(crate::error::Error::NotMuxing);
        }
        let (id, path) = self.channels.alloc(purpose)?;
        self.link.send_sabm_for(id, &mut self.power)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::NullPower;
    use crate::supervisor::NullNotify;

    #[test]
    fn fresh_muxer_reports_power_off() {
        let muxer = Muxer::new(Config::new("/dev/null"), NullPower::default(), NullNotify);
        assert!(!muxer.get_power());
    }

    #[test]
    fn alloc_channel_fails_outside_muxing() {
        let mut muxer = Muxer::new(Config::new("/dev/null"), NullPower::default(), NullNotify);
        let err = SupervisorApi::alloc_channel(&mut muxer, "ppp".to_string()).unwrap_err();
        assert!(matches!(err, crate::error::Error::NotMuxing));
    }

    #[test]
    fn set_power_applies_immediately() {
        let mut muxer = Muxer::new(Config::new("/dev/null"), NullPower::default(), NullNotify);
        SupervisorApi::set_power(&mut muxer, true);
        assert!(muxer.get_power());
    }

    #[derive(Default)]
    struct RecordingNotify {
        calls: Vec<bool>,
    }

    impl SupervisorNotify for RecordingNotify {
        fn trigger(&mut self, active: bool) {
            self.calls.push(active);
        }
    }

    #[test]
    fn trigger_fires_on_leaving_muxing() {
        let mut muxer = Muxer::new(Config::new("/dev/null"), NullPower::default(), RecordingNotify::default());
        muxer.link.force_muxing_for_test();
        SupervisorApi::set_power(&mut muxer, false);
        assert_eq!(muxer.notify.calls, vec![false]);
    }

    #[test]
    fn trigger_does_not_fire_without_a_muxing_transition() {
        let mut muxer = Muxer::new(Config::new("/dev/null"), NullPower::default(), RecordingNotify::default());
        SupervisorApi::set_power(&mut muxer, false);
        assert!(muxer.notify.calls.is_empty());
    }
}
