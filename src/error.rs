use thiserror::Error;

/// Errors that can be returned from the public API. Per-frame recoverable
/// conditions (bad FCS, short write, unknown control command) never reach
/// here — they're logged and handled in place inside the event loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("AT chat failed: {0}")]
    AtChat(#[from] AtChatError),

    #[error("no free DLCI slot")]
    NoFreeChannel,

    #[error("operation requires the link to be muxing")]
    NotMuxing,

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Never returned from the hot path — frame drops are recoverable and
    /// handled in place. Exists so the running count can be logged through
    /// the same typed-error `Display` as everything else.
    #[error("{dropped} frame(s) dropped for bad framing")]
    Framing { dropped: u64 },
}

/// Errors specific to the synchronous AT command/response exchange run
/// during `INITIALIZING`.
#[derive(Debug, Error)]
pub enum AtChatError {
    #[error("no reply within the command deadline")]
    Timeout,
    #[error("modem replied ERROR to {0:?}")]
    ModemError(String),
}

pub type Result<T> = std::result::Result<T, Error>;
