//! Userspace 3GPP TS 07.10 (GSM 07.10) serial multiplexer.
//!
//! Splits one AT-command-capable serial port into up to 31 DLCI channels,
//! each exposed as a pseudo-terminal. See [`Muxer`] for the session type
//! a caller actually drives, and [`SupervisorApi`] for the control
//! surface it exposes.

mod atchat;
mod channel;
mod config;
mod control;
mod error;
mod event_loop;
mod fcs;
mod frame;
mod link;
mod power;
mod ringbuf;
mod supervisor;
mod watchdog;

pub use channel::{ChannelState, MAX_DLCI, MIN_DLCI};
pub use config::{BaudRate, CmuxMode, Config, Flags};
pub use error::{AtChatError, Error, Result};
pub use event_loop::Muxer;
pub use link::LinkState;
pub use power::{ModemPower, NullPower};
pub use supervisor::{NullNotify, SupervisorApi, SupervisorNotify};
