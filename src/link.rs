//! Per-link session state machine (§4.D). Owns the serial fd and the
//! ingress `RingBuffer`; the sibling `ChannelTable` is passed in by
//! reference wherever a transition needs to touch it, per the
//! ownership split in the data model.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::time::Instant;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg};
use nix::unistd::{read, write};

use crate::atchat;
use crate::channel::ChannelTable;
use crate::config::{CmuxMode, Config, Flags};
use crate::control::{self, ControlAction};
use crate::error::{Error, Result};
use crate::fcs;
use crate::frame::{AdvancedCodec, BasicCodec, Decoded, Frame, FrameCodec, FrameType, Role};
use crate::power::ModemPower;
use crate::ringbuf::RingBuffer;
use crate::watchdog::{Watchdog, WatchdogAction};

const MAX_WRITE_RETRIES: u32 = 5;

/// Asserts DTR and RTS on a freshly opened serial fd (`TIOCMBIS`), so the
/// modem sees the line up before we start talking AT commands.
fn assert_dtr_rts(fd: &OwnedFd) -> Result<()> {
    let status: libc::c_int = libc::TIOCM_DTR | libc::TIOCM_RTS;
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCMBIS as _, &status) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Off,
    Opening,
    Initializing,
    Muxing,
    Closing,
}

/// The two codec implementations behind one call surface, selected once
/// at construction time per `cmux_mode` (the "polymorphism as a tagged
/// variant" note in the redesign flags).
enum Codec {
    Basic(BasicCodec),
    Advanced(AdvancedCodec),
}

impl Codec {
    fn for_mode(mode: CmuxMode) -> Self {
        match mode {
            CmuxMode::Basic => Codec::Basic(BasicCodec),
            CmuxMode::Advanced => Codec::Advanced(AdvancedCodec),
        }
    }

    fn decode(&mut self, buf: &mut RingBuffer) -> Decoded {
        match self {
            Codec::Basic(c) => c.decode(buf),
            Codec::Advanced(c) => c.decode(buf),
        }
    }

    fn encode(&self, frame: &Frame, role: Role, out: &mut Vec<u8>) {
        match self {
            Codec::Basic(c) => c.encode(frame, role, out),
            Codec::Advanced(c) => c.encode(frame, role, out),
        }
    }
}

pub struct Link {
    serial_fd: Option<OwnedFd>,
    pub state: LinkState,
    codec: Codec,
    in_buf: RingBuffer,
    watchdog: Watchdog,
    dlci0_open: bool,
    config: Config,
    dropped_frames: u64,
}

impl Link {
    pub fn new(config: Config) -> Self {
        let codec = Codec::for_mode(config.cmux_mode);
        let now = Instant::now();
        let watchdog = Watchdog::new(config.ping_max, config.silence_timeout, now);
        Self {
            serial_fd: None,
            state: LinkState::Off,
            codec,
            in_buf: RingBuffer::new(),
            watchdog,
            dlci0_open: false,
            config,
            dropped_frames: 0,
        }
    }

    pub fn serial_fd(&self) -> Option<BorrowedFd<'_>> {
        self.serial_fd.as_ref().map(|fd| fd.as_fd())
    }

    pub fn is_muxing(&self) -> bool {
        self.state == LinkState::Muxing && self.dlci0_open
    }

    /// Cumulative count of frames dropped for bad framing (FCS mismatch,
    /// desync, oversized frame) since the link was created.
    pub fn dropped_frame_count(&self) -> u64 {
        self.dropped_frames
    }

    #[cfg(test)]
    pub(crate) fn force_muxing_for_test(&mut self) {
        self.state = LinkState::Muxing;
        self.dlci0_open = true;
    }

    /// Supervisor `set_power(true)`: OFF -> OPENING.
    pub fn power_on(&mut self, power: &mut impl ModemPower) {
        if self.state == LinkState::Off {
            power.power_on();
            self.state = LinkState::Opening;
            log::info!("link powering on");
        }
    }

    /// Supervisor `set_power(false)`: tear down from any state, then OFF.
    pub fn power_off(&mut self, power: &mut impl ModemPower, channels: &mut ChannelTable) {
        if self.state == LinkState::Muxing {
            self.close_down_all_channels(channels, power);
        }
        self.close_serial();
        power.power_off();
        self.state = LinkState::Off;
        self.dlci0_open = false;
        log::info!("link powered off");
    }

    /// Called once per watchdog tick (5s). Drives OPENING -> INITIALIZING
    /// -> MUXING, and CLOSING -> OPENING.
    pub fn on_watchdog_tick(
        &mut self,
        now: Instant,
        power: &mut impl ModemPower,
        channels: &mut ChannelTable,
    ) {
        match self.state {
            LinkState::Opening => {
                power.power_off();
                power.power_on();
                match self.open_serial_raw() {
                    Ok(()) => {
                        self.state = LinkState::Initializing;
                    }
                    Err(e) => {
                        log::warn!("failed to open serial device: {e}");
                        self.state = LinkState::Closing;
                    }
                }
            }
            LinkState::Initializing => {
                if let Err(e) = self.run_at_init_and_sabm(power) {
                    log::warn!("AT init failed: {e}");
                    self.state = LinkState::Closing;
                } else {
                    self.state = LinkState::Muxing;
                    self.watchdog.note_frame_received(now);
                    log::info!("link muxing");
                }
            }
            LinkState::Muxing => match self.watchdog.tick(now) {
                WatchdogAction::SendPing => {
                    let _ = self.send_ping(power);
                }
                WatchdogAction::CloseDown => {
                    log::warn!("liveness check failed, closing link");
                    self.state = LinkState::Closing;
                }
                WatchdogAction::Nothing => {}
            },
            LinkState::Closing => {
                self.close_down_all_channels(channels, power);
                self.close_serial();
                power.power_off();
                self.state = LinkState::Opening;
                self.dlci0_open = false;
            }
            LinkState::Off => {}
        }
    }

    fn open_serial_raw(&mut self) -> Result<()> {
        let fd = open(
            self.config.device_path.as_path(),
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )?;
        let owned: OwnedFd = unsafe { OwnedFd::from_raw_fd(fd) };
        let mut tio = termios::tcgetattr(&owned)?;
        termios::cfmakeraw(&mut tio);
        if let Some(speed) = self.config.port_speed.bps() {
            if let Ok(baud) = termios::BaudRate::try_from(speed) {
                let _ = termios::cfsetispeed(&mut tio, baud);
                let _ = termios::cfsetospeed(&mut tio, baud);
            }
        }
        termios::tcsetattr(&owned, SetArg::TCSANOW, &tio)?;
        assert_dtr_rts(&owned)?;
        self.serial_fd = Some(owned);
        self.in_buf = RingBuffer::new();
        Ok(())
    }

    fn close_serial(&mut self) {
        self.serial_fd = None;
    }

    fn run_at_init_and_sabm(&mut self, power: &mut impl ModemPower) -> Result<()> {
        let Some(fd) = &self.serial_fd else {
            return Err(Error::Protocol("serial not open"));
        };
        let fd = fd.as_fd();

        // We don't yet know whether the peer is already stuck in basic
        // or advanced mux mode from a previous session, so a failed
        // first "AT" gets nudged with a close-down attempt encoded both
        // ways before the retry.
        let close_frame = Frame::new(0, FrameType::Disc.to_control(true), vec![]);
        let mut basic_close = Vec::new();
        BasicCodec.encode(&close_frame, Role::Command, &mut basic_close);
        let mut advanced_close = Vec::new();
        AdvancedCodec.encode(&close_frame, Role::Command, &mut advanced_close);

        atchat::run_init_sequence(fd, &self.config, Config::AT_INIT_TIMEOUT, || {
            let _ = write(fd, &basic_close);
            let _ = write(fd, &advanced_close);
            Ok(())
        })?;
        self.send_control_frame(0, FrameType::Sabm, true, &[], power)?;
        Ok(())
    }

    /// Sends a raw control/UI/UIH frame on `channel`, applying the
    /// configured wake-up preamble/line first. A frame that can't be
    /// fully flushed within the retry budget is dropped and logged
    /// (§7 "Transient I/O"), not propagated as an error.
    fn send_control_frame(
        &mut self,
        channel: u8,
        frame_type: FrameType,
        poll_final: bool,
        payload: &[u8],
        power: &mut impl ModemPower,
    ) -> Result<()> {
        if !self.try_send_control_frame(channel, frame_type, poll_final, payload, power)? {
            log::warn!("dropped frame on channel {channel} after exhausting write retries");
        }
        Ok(())
    }

    /// Same as `send_control_frame`, but reports whether the frame was
    /// fully flushed instead of logging a drop — for callers that need
    /// to stash the unsent payload themselves (`pump_pty_output`).
    fn try_send_control_frame(
        &mut self,
        channel: u8,
        frame_type: FrameType,
        poll_final: bool,
        payload: &[u8],
        power: &mut impl ModemPower,
    ) -> Result<bool> {
        let frame = Frame::new(channel, frame_type.to_control(poll_final), payload.to_vec());
        let mut wire = Vec::new();
        self.codec.encode(&frame, Role::Command, &mut wire);
        self.write_wire(&wire, power)
    }

    /// Attempts to flush `wire` in full, retrying a short write up to
    /// `MAX_WRITE_RETRIES` times. Returns whether it fully sent. Wakes
    /// the modem for the duration of the write: either a sysfs line held
    /// for the whole call, or a one-byte `0x7E` preamble, per whichever
    /// `Flags::WAKEUP_*` bit is set.
    fn write_wire(&mut self, wire: &[u8], power: &mut impl ModemPower) -> Result<bool> {
        let flags = self.config.flags;
        let Some(fd) = &self.serial_fd else {
            return Err(Error::Protocol("serial not open"));
        };
        if flags.contains(Flags::WAKEUP_SEQUENCE) {
            write(fd, &[fcs::FLAG])?;
        }
        let do_write = |fd: &OwnedFd| -> Result<bool> {
            let mut offset = 0;
            let mut retries = 0;
            while offset < wire.len() && retries < MAX_WRITE_RETRIES {
                match write(fd, &wire[offset..]) {
                    Ok(0) => retries += 1,
                    Ok(n) => offset += n,
                    Err(nix::errno::Errno::EAGAIN) => retries += 1,
                    Err(e) => return Err(std::io::Error::from(e).into()),
                }
            }
            Ok(offset == wire.len())
        };
        if flags.contains(Flags::WAKEUP_SYSFS) {
            power.with_wake_asserted(|| do_write(fd))
        } else {
            do_write(fd)
        }
    }

    fn send_ping(&mut self, power: &mut impl ModemPower) -> Result<()> {
        let payload = vec![control::MuxCommandType::Test.type_octet(true), 0x01];
        self.send_control_frame(0, FrameType::Ui, false, &payload, power)
    }

    /// Sends a close-down frame on `channel`: a CLD UIH in the common
    /// case, matching the per-DLCI legacy wart only when that
    /// compatibility flag is set.
    fn send_close_down(&mut self, channel: u8, power: &mut impl ModemPower) -> Result<()> {
        if channel != 0 && !self.config.flags.contains(Flags::LEGACY_PER_DLCI_CLD) {
            self.send_control_frame(channel, FrameType::Disc, true, &[], power)
        } else {
            let payload = vec![control::MuxCommandType::Cld.type_octet(true)];
            self.send_control_frame(channel, FrameType::Uih, false, &payload, power)
        }
    }

    fn close_down_all_channels(&mut self, channels: &mut ChannelTable, power: &mut impl ModemPower) {
        let open_ids: Vec<u8> = channels
            .iter()
            .filter(|c| !c.is_free())
            .map(|c| c.id)
            .collect();
        for id in open_ids {
            let _ = self.send_close_down(id, power);
            channels.free(id);
        }
        let _ = self.send_close_down(0, power);
    }

    /// Reads whatever is ready on the serial fd into the ring, then
    /// drains as many frames as are fully buffered. Returns `Err` on a
    /// real I/O failure or HUP; `Ok(())` (possibly having read zero
    /// bytes) otherwise.
    pub fn on_serial_readable(
        &mut self,
        channels: &mut ChannelTable,
        power: &mut impl ModemPower,
    ) -> Result<()> {
        let Some(fd) = &self.serial_fd else {
            return Ok(());
        };
        let mut scratch = [0u8; 1024];
        loop {
            let free = self.in_buf.free();
            if free == 0 {
                break; // backpressure: leave remaining bytes in the kernel buffer
            }
            let want = free.min(scratch.len());
            match read(fd, &mut scratch[..want]) {
                Ok(0) => return Err(Error::Protocol("serial hung up")),
                Ok(n) => {
                    self.in_buf.write(&scratch[..n]);
                }
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        }

        loop {
            match self.codec.decode(&mut self.in_buf) {
                Decoded::NeedMore => break,
                Decoded::Dropped => {
                    self.dropped_frames += 1;
                    log::debug!("{}", Error::Framing { dropped: self.dropped_frames });
                    continue;
                }
                Decoded::Frame(frame) => {
                    self.watchdog.note_frame_received(Instant::now());
                    self.handle_frame(frame, channels, power)?;
                }
            }
        }
        Ok(())
    }

    fn handle_frame(
        &mut self,
        frame: Frame,
        channels: &mut ChannelTable,
        power: &mut impl ModemPower,
    ) -> Result<()> {
        let Some(frame_type) = frame.frame_type() else {
            return Ok(());
        };
        if frame.channel == 0 {
            match frame_type {
                FrameType::Ua => {
                    self.dlci0_open = true;
                }
                FrameType::Dm => {
                    self.state = LinkState::Closing;
                }
                FrameType::Uih | FrameType::Ui => {
                    let enfora = self.config.flags.contains(Flags::ENFORA);
                    for action in control::handle(&frame.payload, enfora) {
                        self.apply_control_action(action, channels, power)?;
                    }
                }
                _ => {}
            }
            return Ok(());
        }

        match frame_type {
            FrameType::Ua => {
                if let Some(c) = channels.get_mut(frame.channel) {
                    c.state = crate::channel::ChannelState::Open;
                }
            }
            FrameType::Dm | FrameType::Disc => {
                channels.free(frame.channel);
            }
            FrameType::Uih | FrameType::Ui => {
                if let Some(c) = channels.get_mut(frame.channel) {
                    if c.opened() {
                        let unsent = c.write_pty(&frame.payload)?;
                        let written = frame.payload.len() - unsent.len();
                        c.bytes_from_modem += written as u64;
                        if !unsent.is_empty() {
                            // No per-DLCI flow control in UIH mode: a local
                            // reader not keeping up just loses the tail.
                            log::debug!(
                                "dropped {} unsent byte(s) on channel {} (reader not draining)",
                                unsent.len(),
                                frame.channel
                            );
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn apply_control_action(
        &mut self,
        action: ControlAction,
        channels: &mut ChannelTable,
        power: &mut impl ModemPower,
    ) -> Result<()> {
        match action {
            ControlAction::CloseDown => {
                self.state = LinkState::Closing;
            }
            ControlAction::UpdateSignals { channel, signals } => {
                if let Some(c) = channels.get_mut(channel) {
                    c.v24_signals = signals;
                }
            }
            ControlAction::SendReply(payload) => {
                self.send_control_frame(0, FrameType::Uih, false, &payload, power)?;
            }
        }
        Ok(())
    }

    /// Sends a newly allocated channel's opening SABM. Called right
    /// after `ChannelTable::alloc`.
    pub fn send_sabm_for(&mut self, channel: u8, power: &mut impl ModemPower) -> Result<()> {
        self.send_control_frame(channel, FrameType::Sabm, true, &[], power)
    }

    /// Drains one pty's pending output, chunked to N1, over the wire.
    pub fn pump_pty_output(
        &mut self,
        channels: &mut ChannelTable,
        channel: u8,
        power: &mut impl ModemPower,
    ) -> Result<()> {
        let Some(c) = channels.get(channel) else {
            return Ok(());
        };
        if !c.opened() {
            // Not open yet: drop whatever showed up and re-nudge the peer.
            self.send_sabm_for(channel, power)?;
            return Ok(());
        }

        let mut read_buf = [0u8; 4096];
        let n = c.read_pty(&mut read_buf)?;
        if n == 0 {
            return Ok(());
        }

        let mut pending = c.pending_tail.clone();
        pending.extend_from_slice(&read_buf[..n]);

        let n1 = self.config.n1.max(1);
        let mut sent_bytes = 0;
        for chunk in pending.chunks(n1) {
            if !self.try_send_control_frame(channel, FrameType::Uih, false, chunk, power)? {
                break; // short write even after retries: stop and stash the rest
            }
            sent_bytes += chunk.len();
        }

        if let Some(c) = channels.get_mut(channel) {
            c.pending_tail = pending[sent_bytes..].to_vec();
            c.bytes_to_modem += sent_bytes as u64;
        }
        Ok(())
    }

    /// Closes `channel` down (peer-visible close-down frame) and frees
    /// the slot — used on pty read error/HUP.
    pub fn close_channel(
        &mut self,
        channels: &mut ChannelTable,
        channel: u8,
        power: &mut impl ModemPower,
    ) -> Result<()> {
        self.send_close_down(channel, power)?;
        channels.free(channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::NullPower;

    fn test_config() -> Config {
        let mut c = Config::new("/dev/null");
        c.cmux_mode = CmuxMode::Basic;
        c
    }

    #[test]
    fn starts_off() {
        let link = Link::new(test_config());
        assert_eq!(link.state, LinkState::Off);
        assert!(!link.is_muxing());
        assert_eq!(link.dropped_frame_count(), 0);
    }

    #[test]
    fn power_on_transitions_to_opening() {
        let mut link = Link::new(test_config());
        let mut power = NullPower::default();
        link.power_on(&mut power);
        assert_eq!(link.state, LinkState::Opening);
        assert!(power.is_powered());
    }

    #[test]
    fn power_off_from_off_is_idempotent() {
        let mut link = Link::new(test_config());
        let mut power = NullPower::default();
        let mut channels = ChannelTable::new();
        link.power_off(&mut power, &mut channels);
        assert_eq!(link.state, LinkState::Off);
    }

    #[test]
    fn ua_on_dlci_zero_opens_control_channel() {
        let mut link = Link::new(test_config());
        link.state = LinkState::Muxing;
        let mut channels = ChannelTable::new();
        let mut power = NullPower::default();
        let frame = Frame::new(0, FrameType::Ua.to_control(false), vec![]);
        link.handle_frame(frame, &mut channels, &mut power).unwrap();
        assert!(link.dlci0_open);
    }

    #[test]
    fn dm_on_dlci_zero_closes_down() {
        let mut link = Link::new(test_config());
        link.state = LinkState::Muxing;
        let mut channels = ChannelTable::new();
        let mut power = NullPower::default();
        let frame = Frame::new(0, FrameType::Dm.to_control(false), vec![]);
        link.handle_frame(frame, &mut channels, &mut power).unwrap();
        assert_eq!(link.state, LinkState::Closing);
    }

    #[test]
    fn cld_on_control_channel_closes_down() {
        let mut link = Link::new(test_config());
        link.state = LinkState::Muxing;
        let mut channels = ChannelTable::new();
        let mut power = NullPower::default();
        let payload = vec![control::MuxCommandType::Cld.type_octet(true)];
        let frame = Frame::new(0, FrameType::Uih.to_control(false), payload);
        link.handle_frame(frame, &mut channels, &mut power).unwrap();
        assert_eq!(link.state, LinkState::Closing);
    }

    #[test]
    fn ua_on_data_channel_opens_it() {
        let mut link = Link::new(test_config());
        link.state = LinkState::Muxing;
        let mut channels = ChannelTable::new();
        let id = 5u8;
        // A real `alloc()` needs a pty, unavailable in a sandboxed test
        // run; set the bookkeeping directly, as `free_resets_state_but_keeps_id`
        // does in channel.rs.
        if let Some(c) = channels.get_mut(id) {
            c.state = crate::channel::ChannelState::Allocated;
        }
        let mut power = NullPower::default();
        let frame = Frame::new(id, FrameType::Ua.to_control(false), vec![]);
        link.handle_frame(frame, &mut channels, &mut power).unwrap();
        assert_eq!(
            channels.get(id).unwrap().state,
            crate::channel::ChannelState::Open
        );
    }

    #[test]
    fn power_off_while_muxing_closes_every_open_channel_then_dlci_zero() {
        let mut link = Link::new(test_config());
        link.force_muxing_for_test();
        let mut channels = ChannelTable::new();
        for id in [5u8, 9u8] {
            if let Some(c) = channels.get_mut(id) {
                c.state = crate::channel::ChannelState::Open;
            }
        }
        let mut power = NullPower::default();

        link.power_off(&mut power, &mut channels);

        assert!(channels.get(5).unwrap().is_free());
        assert!(channels.get(9).unwrap().is_free());
        assert_eq!(link.state, LinkState::Off);
        assert!(!power.is_powered());
    }
}
