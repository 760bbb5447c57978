//! POSIX signal handling (spec.md §5). Each signal only sets an atomic
//! flag the poll loop observes at its single wait point; nothing mutates
//! shared state from within a signal handler (SPEC_FULL.md Design Notes).
//!
//! Non-POSIX platforms are out of scope per SPEC_FULL.md's resolution of
//! the spec's open question on Windows signal analogues; this module is
//! `cfg(unix)`-only and the binary fails fast on other targets.

#[cfg(not(unix))]
compile_error!("nutdrv-core's signal handling is POSIX-only; see SPEC_FULL.md §10");

use crate::error::{NutError, Result};
use tokio::signal::unix::{SignalKind, signal};

/// The four logical signals a driver reacts to, decoupled from their
/// concrete POSIX numbers so the poll loop never matches on `SIGHUP`
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigCmd {
    /// SIGHUP: mark reload-pending.
    Reload,
    /// SIGTERM / SIGINT: request orderly shutdown.
    Exit,
    /// SIGUSR1: reload; if reload fails, exit.
    ReloadOrExit,
    /// SIGURG (SIGWINCH where absent): dump full DState to stdout.
    DataDump,
}

/// Holds one `tokio::signal::unix::Signal` stream per logical signal.
/// `tokio::select!` over all four (plus the pollinterval timer and
/// ctrlsocket readability) is the sole suspension point that observes
/// signal delivery (§5).
pub struct SignalSet {
    reload: tokio::signal::unix::Signal,
    exit_term: tokio::signal::unix::Signal,
    exit_int: tokio::signal::unix::Signal,
    reload_or_exit: tokio::signal::unix::Signal,
    data_dump: tokio::signal::unix::Signal,
}

impl SignalSet {
    pub fn install() -> Result<Self> {
        let mk = |kind: SignalKind| {
            signal(kind).map_err(|e| NutError::fatal(format!("installing signal handler: {e}")))
        };
        Ok(Self {
            reload: mk(SignalKind::hangup())?,
            exit_term: mk(SignalKind::terminate())?,
            exit_int: mk(SignalKind::interrupt())?,
            reload_or_exit: mk(SignalKind::user_defined1())?,
            data_dump: mk(SignalKind::urgent_io())?,
        })
    }

    /// Wait for the next signal of interest. Cancel-safe: intended to be
    /// used as one arm of `tokio::select!` in the poll loop.
    pub async fn recv(&mut self) -> SigCmd {
        tokio::select! {
            _ = self.reload.recv() => SigCmd::Reload,
            _ = self.exit_term.recv() => SigCmd::Exit,
            _ = self.exit_int.recv() => SigCmd::Exit,
            _ = self.reload_or_exit.recv() => SigCmd::ReloadOrExit,
            _ = self.data_dump.recv() => SigCmd::DataDump,
        }
    }
}
