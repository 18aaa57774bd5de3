//! Synchronous AT command/response exchange run once, during
//! `INITIALIZING` (§4.D, §4.G). This is the one place in the whole
//! session allowed to block: a bounded `poll`+`read` per command, each
//! with its own deadline.

use std::os::unix::io::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{read, write};

use crate::error::{AtChatError, Result};

/// One issued command and the outcome the caller cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtOutcome {
    Ok,
    Error,
    Timeout,
}

/// Drives one `command\r\n` → response exchange over `fd`, blocking up
/// to `deadline`. Accumulates read bytes looking for a line containing
/// "OK", "ERROR", or the vendor-specific "*MRDY: 1" ready indication
/// (also success, per the AT surface note).
pub fn send_command(fd: BorrowedFd<'_>, command: &str, deadline: Duration) -> Result<AtOutcome> {
    let mut line = String::with_capacity(command.len() + 2);
    line.push_str(command);
    line.push_str("\r\n");
    write(fd, line.as_bytes())?;
    log::debug!("AT> {command}");

    let start = Instant::now();
    let mut response = Vec::new();
    let mut buf = [0u8; 256];

    loop {
        let elapsed = start.elapsed();
        if elapsed >= deadline {
            log::debug!("AT< (timeout waiting for {command:?})");
            log::info!("AT command {command:?} -> Timeout");
            return Ok(AtOutcome::Timeout);
        }
        let remaining = deadline - elapsed;
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let timeout_ms = remaining.as_millis().min(u16::MAX as u128) as u16;
        let n = poll(&mut fds, PollTimeout::from(timeout_ms)).map_err(std::io::Error::from)?;
        if n == 0 {
            continue; // re-check the deadline on the next loop iteration
        }
        let n = read(fd, &mut buf).map_err(std::io::Error::from)?;
        if n == 0 {
            return Ok(AtOutcome::Timeout);
        }
        response.extend_from_slice(&buf[..n]);

        if let Some(outcome) = scan_response(&response) {
            log_response(&response);
            log::info!("AT command {command:?} -> {outcome:?}");
            return Ok(outcome);
        }
    }
}

fn scan_response(buf: &[u8]) -> Option<AtOutcome> {
    let text = String::from_utf8_lossy(buf);
    if text.contains("ERROR") {
        Some(AtOutcome::Error)
    } else if text.contains("OK") || text.contains("*MRDY: 1") {
        Some(AtOutcome::Ok)
    } else {
        None
    }
}

fn log_response(buf: &[u8]) {
    let text = String::from_utf8_lossy(buf);
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        log::debug!("AT< {line}");
    }
}

/// Runs the full init sequence from §4.D and returns once
/// `AT+CMUX=...` has been acknowledged, or the first failure.
///
/// `on_first_at_timeout` fires once, between a failed first "AT" and the
/// retry, so the caller can nudge a possibly-already-muxing peer with
/// close-down frames before trying plain AT chat again.
pub fn run_init_sequence(
    fd: impl AsFd,
    config: &crate::config::Config,
    deadline_per_command: Duration,
    mut on_first_at_timeout: impl FnMut() -> Result<()>,
) -> Result<()> {
    let fd = fd.as_fd();

    match send_command(fd, "AT", deadline_per_command)? {
        AtOutcome::Ok => {}
        _ => {
            // No reply: nudge with close-down frames, then retry once,
            // per §4.D.
            on_first_at_timeout()?;
            if send_command(fd, "AT", deadline_per_command)? != AtOutcome::Ok {
                return Err(AtChatError::Timeout.into());
            }
        }
    }

    if config.flags.contains(crate::config::Flags::SHORT_INIT) {
        return expect_ok(fd, &cmux_command(config), deadline_per_command);
    }

    expect_ok(fd, "ATZ", deadline_per_command)?;
    expect_ok(fd, "ATE0", deadline_per_command)?;

    if config.flags.contains(crate::config::Flags::SIEMENS_C35) {
        if let Some(bps) = config.port_speed.bps() {
            expect_ok(fd, &format!("AT+IPR={bps}"), deadline_per_command)?;
        }
        expect_ok(fd, "AT&S0", deadline_per_command)?;
        expect_ok(fd, "AT\\Q3", deadline_per_command)?;
    }
    if let Some(pin) = &config.pin {
        expect_ok(fd, &format!("AT+CPIN={pin}"), deadline_per_command)?;
    }

    expect_ok(fd, "AT+CFUN=0", deadline_per_command)?;
    expect_ok(fd, &cmux_command(config), deadline_per_command)
}

fn cmux_command(config: &crate::config::Config) -> String {
    format!(
        "AT+CMUX={},{},{},{}",
        config.cmux_mode as u8,
        config.cmux_subset,
        config.at_speed.index(),
        config.n1
    )
}

fn expect_ok(fd: BorrowedFd<'_>, command: &str, deadline: Duration) -> Result<()> {
    match send_command(fd, command, deadline)? {
        AtOutcome::Ok => Ok(()),
        AtOutcome::Error => Err(AtChatError::ModemError(command.to_string()).into()),
        AtOutcome::Timeout => Err(AtChatError::Timeout.into()),
    }
}
