//! Per-DLCI state and pseudo-terminal plumbing (§4.E).
//!
//! `ChannelTable` owns DLCIs 1..31. Allocation mirrors the fixed-slot
//! scan used for link IDs on the embedded side this crate grew out of:
//! walk the table, claim the first free entry.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg};
use nix::unistd::{close, read, write};

use crate::error::{Error, Result};

pub const MIN_DLCI: u8 = 1;
pub const MAX_DLCI: u8 = 31;
const SLOT_COUNT: usize = (MAX_DLCI - MIN_DLCI + 1) as usize;

/// Initial V.24 signal byte sent with a fresh channel: DV | RTR | RTC | EA.
pub const INITIAL_V24_SIGNALS: u8 = 0x8D;

const MAX_WRITE_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Free,
    Allocated,
    Open,
    Closing,
}

pub struct Channel {
    pub id: u8,
    pub state: ChannelState,
    pub purpose: String,
    pub pty_path: PathBuf,
    pty_fd: Option<OwnedFd>,
    pub v24_signals: u8,
    /// Unsent bytes left over from a pty read that didn't divide evenly
    /// into N1-sized UIH frames, or that a short write couldn't flush.
    pub pending_tail: Vec<u8>,
    /// Bytes read from the pty and handed to the wire (app -> modem).
    pub bytes_to_modem: u64,
    /// Bytes received over the wire and written to the pty (modem -> app).
    pub bytes_from_modem: u64,
}

impl Channel {
    fn empty(id: u8) -> Self {
        Self {
            id,
            state: ChannelState::Free,
            purpose: String::new(),
            pty_path: PathBuf::new(),
            pty_fd: None,
            v24_signals: INITIAL_V24_SIGNALS,
            pending_tail: Vec::new(),
            bytes_to_modem: 0,
            bytes_from_modem: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.state == ChannelState::Free
    }

    pub fn opened(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.pty_fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Opens a fresh pty master/slave pair, puts the slave side in raw
    /// mode, and claims this slot for `purpose`. The caller still has to
    /// send SABM and flip the state to `Allocated`.
    fn open_pty(&mut self, purpose: String) -> Result<()> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)?;
        grantpt(&master)?;
        unlockpt(&master)?;
        let slave_name = unsafe { ptsname_r(&master)? };

        let slave_fd = open(
            slave_name.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY,
            Mode::empty(),
        )?;
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(slave_fd) };
        configure_raw_mode(&borrowed)?;
        let _ = close(slave_fd);

        self.pty_fd = Some(master.into());
        self.pty_path = PathBuf::from(slave_name);
        self.purpose = purpose;
        self.v24_signals = INITIAL_V24_SIGNALS;
        self.pending_tail.clear();
        self.bytes_to_modem = 0;
        self.bytes_from_modem = 0;
        self.state = ChannelState::Allocated;
        Ok(())
    }

    /// Drops the pty and resets every field but `id`.
    pub fn free(&mut self) {
        self.pty_fd = None;
        self.pty_path = PathBuf::new();
        self.purpose.clear();
        self.pending_tail.clear();
        self.v24_signals = INITIAL_V24_SIGNALS;
        self.bytes_to_modem = 0;
        self.bytes_from_modem = 0;
        self.state = ChannelState::Free;
    }

    /// Reads whatever is available from the pty master into `out`,
    /// non-blocking. Returns `Ok(0)` on EAGAIN (nothing to do), `Ok(n)`
    /// for `n` bytes read, or an error on real failure/HUP.
    pub fn read_pty(&self, out: &mut [u8]) -> Result<usize> {
        let Some(fd) = &self.pty_fd else {
            return Ok(0);
        };
        match read(fd, out) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Ok(0),
            Err(e) => Err(Error::Io(std::io::Error::from(e))),
        }
    }

    /// Writes `data` to the pty master, retrying short writes up to
    /// `MAX_WRITE_RETRIES` times. Returns the unwritten remainder, which
    /// the caller folds back into `pending_tail`.
    pub fn write_pty(&self, data: &[u8]) -> Result<Vec<u8>> {
        let Some(fd) = &self.pty_fd else {
            return Ok(data.to_vec());
        };
        let mut offset = 0;
        let mut retries = 0;
        while offset < data.len() && retries < MAX_WRITE_RETRIES {
            match write(fd, &data[offset..]) {
                Ok(n) => {
                    offset += n;
                    if n == 0 {
                        retries += 1;
                    }
                }
                Err(Errno::EAGAIN) => retries += 1,
                Err(e) => return Err(Error::Io(std::io::Error::from(e))),
            }
        }
        Ok(data[offset..].to_vec())
    }
}

fn configure_raw_mode(fd: &impl std::os::fd::AsFd) -> Result<()> {
    let mut tio = termios::tcgetattr(fd)?;
    termios::cfmakeraw(&mut tio);
    termios::tcsetattr(fd, SetArg::TCSANOW, &tio)?;
    Ok(())
}

/// Splits `data` into UIH-sized chunks of at most `n1` bytes, for
/// framing onto the serial link.
pub fn chunk_for_uih(data: &[u8], n1: usize) -> Vec<&[u8]> {
    if n1 == 0 {
        return vec![];
    }
    data.chunks(n1).collect()
}

pub struct ChannelTable {
    slots: Vec<Channel>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            slots: (0..SLOT_COUNT)
                .map(|i| Channel::empty(MIN_DLCI + i as u8))
                .collect(),
        }
    }

    pub fn get(&self, id: u8) -> Option<&Channel> {
        self.index_of(id).map(|i| &self.slots[i])
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Channel> {
        self.index_of(id).map(move |i| &mut self.slots[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.slots.iter_mut()
    }

    fn index_of(&self, id: u8) -> Option<usize> {
        if (MIN_DLCI..=MAX_DLCI).contains(&id) {
            Some((id - MIN_DLCI) as usize)
        } else {
            None
        }
    }

    /// Scans for the first free slot, opens a pty for it, and returns
    /// the slave path. Caller still owns sending SABM.
    pub fn alloc(&mut self, purpose: String) -> Result<(u8, PathBuf)> {
        let slot = self
            .slots
            .iter_mut()
            .find(|c| c.is_free())
            .ok_or(Error::NoFreeChannel)?;
        slot.open_pty(purpose)?;
        Ok((slot.id, slot.pty_path.clone()))
    }

    pub fn free(&mut self, id: u8) {
        if let Some(c) = self.get_mut(id) {
            c.free();
        }
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_is_all_free() {
        let table = ChannelTable::new();
        assert_eq!(table.iter().count(), SLOT_COUNT);
        assert!(table.iter().all(|c| c.is_free()));
    }

    #[test]
    fn dlci_zero_and_above_range_are_not_addressable() {
        let table = ChannelTable::new();
        assert!(table.get(0).is_none());
        assert!(table.get(32).is_none());
        assert!(table.get(1).is_some());
        assert!(table.get(31).is_some());
    }

    #[test]
    fn chunk_for_uih_respects_n1() {
        let data = vec![0u8; 130];
        let chunks = chunk_for_uih(&data, 64);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 64);
        assert_eq!(chunks[1].len(), 64);
        assert_eq!(chunks[2].len(), 2);
    }

    #[test]
    fn chunk_for_uih_empty_input_yields_no_chunks() {
        assert!(chunk_for_uih(&[], 64).is_empty());
    }

    #[test]
    fn free_resets_state_but_keeps_id() {
        let mut table = ChannelTable::new();
        // Can't actually open a pty in a sandboxed test environment, so
        // exercise the bookkeeping path directly.
        if let Some(c) = table.get_mut(5) {
            c.state = ChannelState::Open;
            c.purpose = "test".into();
            c.pending_tail = vec![1, 2, 3];
            c.bytes_to_modem = 42;
            c.bytes_from_modem = 7;
        }
        table.free(5);
        let c = table.get(5).unwrap();
        assert_eq!(c.id, 5);
        assert!(c.is_free());
        assert!(c.purpose.is_empty());
        assert!(c.pending_tail.is_empty());
        assert_eq!(c.bytes_to_modem, 0);
        assert_eq!(c.bytes_from_modem, 0);
    }
}
