use std::path::PathBuf;
use std::time::Duration;

use bitflags::bitflags;

bitflags! {
    /// Additional-functionality flags (§6). Each gates one documented
    /// compatibility behavior; all default off.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u32 {
        /// Wake the modem by asserting a sysfs GPIO line around each write.
        const WAKEUP_SYSFS = 1 << 0;
        /// Wake the modem by prefixing each write with a `0x7E` byte.
        const WAKEUP_SEQUENCE = 1 << 1;
        /// Siemens C35-family init quirks.
        const SIEMENS_C35 = 1 << 2;
        /// Enfora modem: echo MSC's P/F bit and re-send MSC as a command.
        const ENFORA = 1 << 3;
        /// Skip the full AT init sequence; send only `AT+CMUX=1`.
        const SHORT_INIT = 1 << 4;
        /// Close a DLCI by sending the control-channel CLD command *on
        /// that DLCI* instead of DISC, matching an older peer quirk.
        const LEGACY_PER_DLCI_CLD = 1 << 5;
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::empty()
    }
}

/// 07.10 operating mode, fixed for the lifetime of a `Link`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmuxMode {
    Basic = 0,
    Advanced = 1,
}

/// Baud rate index table from §6. `Unset` leaves the port at whatever
/// speed the OS default/previous session left it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaudRate {
    #[default]
    Unset,
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
    B230400,
    B460800,
}

impl BaudRate {
    /// The index value sent in `AT+CMUX=...` and `AT+IPR=...`.
    pub fn index(self) -> u8 {
        match self {
            BaudRate::Unset => 0,
            BaudRate::B9600 => 1,
            BaudRate::B19200 => 2,
            BaudRate::B38400 => 3,
            BaudRate::B57600 => 4,
            BaudRate::B115200 => 5,
            BaudRate::B230400 => 6,
            BaudRate::B460800 => 7,
        }
    }

    pub fn bps(self) -> Option<u32> {
        match self {
            BaudRate::Unset => None,
            BaudRate::B9600 => Some(9_600),
            BaudRate::B19200 => Some(19_200),
            BaudRate::B38400 => Some(38_400),
            BaudRate::B57600 => Some(57_600),
            BaudRate::B115200 => Some(115_200),
            BaudRate::B230400 => Some(230_400),
            BaudRate::B460800 => Some(460_800),
        }
    }
}

/// Everything the session needs to know; populated by the caller (a CLI,
/// a config file reader, a supervisor) — argument parsing is out of
/// scope here.
#[derive(Debug, Clone)]
pub struct Config {
    pub device_path: PathBuf,
    /// Base directory for power-management sysfs nodes, if any.
    pub power_dir: Option<PathBuf>,
    pub pin: Option<String>,

    /// Consecutive unanswered pings before the link is torn down. `0`
    /// disables the ping watchdog.
    pub ping_max: u32,
    /// Seconds of total silence before the link is torn down. `0`
    /// disables the silence watchdog.
    pub silence_timeout: Duration,

    pub cmux_mode: CmuxMode,
    pub cmux_subset: u8,
    pub port_speed: BaudRate,
    pub at_speed: BaudRate,
    /// Maximum information-field length per frame.
    pub n1: usize,

    pub flags: Flags,
}

impl Config {
    pub const DEFAULT_N1: usize = 64;
    pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(5);
    pub const AT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            power_dir: None,
            pin: None,
            ping_max: 0,
            silence_timeout: Duration::ZERO,
            cmux_mode: CmuxMode::Basic,
            cmux_subset: 0,
            port_speed: BaudRate::Unset,
            at_speed: BaudRate::Unset,
            n1: Self::DEFAULT_N1,
            flags: Flags::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_index_table_matches_spec() {
        assert_eq!(BaudRate::Unset.index(), 0);
        assert_eq!(BaudRate::B9600.index(), 1);
        assert_eq!(BaudRate::B460800.index(), 7);
    }

    #[test]
    fn flags_default_to_empty() {
        assert!(Flags::default().is_empty());
        assert!(Config::new("/dev/ttyUSB0").flags.is_empty());
    }
}
