//! The abstract interface a supervisor process uses to drive a `Link`
//! (§6 "Supervisor API"). There's only ever the one thread, so calls
//! land as ordinary method dispatch rather than a cross-thread queue.

use std::path::PathBuf;

use crate::error::Result;

pub trait SupervisorApi {
    /// True iff the link's state is anything other than OFF.
    fn get_power(&self) -> bool;

    /// Requests a transition to OPENING (on=true, from OFF) or directly
    /// to OFF (on=false, tearing down first if MUXING).
    fn set_power(&mut self, on: bool);

    /// Allocates a new DLCI/pty pair. Fails outside MUXING or when all
    /// 31 slots are in use.
    fn alloc_channel(&mut self, purpose: String) -> Result<PathBuf>;
}

/// Notification sink for the muxer entering/leaving MUXING. The other
/// three `SupervisorApi` calls flow supervisor-to-muxer; `trigger` is the
/// one notification that flows the other way, so it's a capability the
/// caller supplies rather than a method on `Muxer` itself — the same
/// shape as `ModemPower`.
pub trait SupervisorNotify {
    fn trigger(&mut self, active: bool);
}

/// A `SupervisorNotify` that does nothing, for tests and hosts with no
/// supervisor listening.
#[derive(Debug, Default)]
pub struct NullNotify;

impl SupervisorNotify for NullNotify {
    fn trigger(&mut self, _active: bool) {}
}
