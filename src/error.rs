//! Error types for the driver core.
//!
//! Mirrors the taxonomy in SPEC_FULL.md §7: config errors abort startup,
//! transport/protocol errors are local-recovery-only and never surface to a
//! caller as anything but a freshness flip, command-rejected errors become a
//! socket `ERR` reply, and fatal errors bubble all the way to `Lifecycle`,
//! the only place allowed to translate an error into a process exit.

use thiserror::Error;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, NutError>;

/// Socket error codes from SPEC_FULL.md §4.4 / §6.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    InvalidArgument,
    UnknownCommand,
    ReadOnly,
    TooLong,
    InvalidValue,
    CmdFailed,
    DriverNotConnected,
}

impl ReplyCode {
    pub fn as_wire(&self) -> &'static str {
        match self {
            ReplyCode::InvalidArgument => "INVALID-ARGUMENT",
            ReplyCode::UnknownCommand => "UNKNOWN-COMMAND",
            ReplyCode::ReadOnly => "READONLY",
            ReplyCode::TooLong => "TOO-LONG",
            ReplyCode::InvalidValue => "INVALID-VALUE",
            ReplyCode::CmdFailed => "CMD-FAILED",
            ReplyCode::DriverNotConnected => "DRIVER-NOT-CONNECTED",
        }
    }
}

/// Main error type for the driver core.
#[derive(Debug, Error)]
pub enum NutError {
    /// Unknown `-x` option, type mismatch, bad `ups.conf` syntax. Aborts
    /// startup before any device interaction (exit code 2).
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Device read timeout, disappeared device, link down. Never surfaced
    /// beyond a freshness flip; recovery is the plug-in's responsibility.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Framing/CRC/malformed-response errors from a plug-in's transport.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// A `SET`/`INSTCMD` was rejected. Carries the socket reply code so
    /// `CtrlSocket` doesn't have to re-derive it from the message text.
    #[error("command rejected: {message}")]
    CommandRejected { message: String, code: ReplyCode },

    /// Out-of-memory, lost control socket after repeated retries, corrupt
    /// pidfile. Triggers `cleanup` then process exit.
    #[error("fatal error: {message}")]
    Fatal { message: String },

    /// Catch-all for errors that don't cleanly fit the above, including
    /// plain I/O failures surfaced from `From<std::io::Error>`.
    #[error("error: {message}")]
    Generic { message: String },
}

impl NutError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        NutError::Config {
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        NutError::Transport {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        NutError::Protocol {
            message: message.into(),
        }
    }

    pub fn command_rejected<S: Into<String>>(message: S, code: ReplyCode) -> Self {
        NutError::CommandRejected {
            message: message.into(),
            code,
        }
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        NutError::Fatal {
            message: message.into(),
        }
    }

    pub fn generic<S: Into<String>>(message: S) -> Self {
        NutError::Generic {
            message: message.into(),
        }
    }

    /// Whether `Lifecycle` must terminate the process for this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NutError::Fatal { .. } | NutError::Config { .. })
    }

    /// Maps a fatal/config error onto the exit codes from SPEC_FULL.md §6.3.
    /// `None` for errors that must not terminate the process.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            NutError::Config { .. } => Some(2),
            NutError::Fatal { .. } => Some(1),
            _ => None,
        }
    }

    /// The socket reply code for a command-rejected error, if applicable.
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            NutError::CommandRejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NutError {
    fn from(err: std::io::Error) -> Self {
        NutError::Generic {
            message: err.to_string(),
        }
    }
}

impl From<std::num::ParseIntError> for NutError {
    fn from(err: std::num::ParseIntError) -> Self {
        NutError::config(err.to_string())
    }
}
