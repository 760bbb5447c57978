//! Shutdown-command dispatcher: resolves a user-configured logical intent
//! into an ordered-fallback walk of concrete driver INSTCMDs
//! (spec.md §4.5).

use crate::driver::InstcmdResult;

/// Default intent table applied when the user did not override
/// `sdcommands` (spec.md §4.5). Resolved at the granularity of
/// `shutdown.default`; the dispatcher itself stays generic so a tool can
/// invoke a specific variant directly.
pub const DEFAULT_SDCOMMANDS: &str = "shutdown.return,shutdown.stayoff,shutdown.reboot,load.off";

/// Outcome of a `do_loop_shutdown_commands` walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdCmdOutcome {
    /// A command in the list succeeded; carries the name that succeeded.
    Handled(String),
    /// No command in the list succeeded (or the list was empty).
    Invalid,
}

/// Resolves shutdown-intent CSV lists into an INSTCMD walk. Holds no
/// state of its own: every call takes the invocation closure explicitly,
/// matching the single-threaded ownership model (§5) where `instcmd`
/// dispatch always goes through the owning `Lifecycle`/driver context.
#[derive(Debug, Default)]
pub struct SdCmdDispatcher;

impl SdCmdDispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Split `csv_list` on commas, trim whitespace, skip empties, and walk
    /// left-to-right invoking `instcmd` until one reports `Handled`.
    ///
    /// `instcmd` is given the bare command name; it returns the same
    /// result enum the control socket uses for `INSTCMD` dispatch.
    pub fn walk<F>(&self, csv_list: &str, mut instcmd: F) -> SdCmdOutcome
    where
        F: FnMut(&str) -> InstcmdResult,
    {
        for name in Self::split(csv_list) {
            if instcmd(name) == InstcmdResult::Handled {
                return SdCmdOutcome::Handled(name.to_string());
            }
        }
        SdCmdOutcome::Invalid
    }

    /// `sdcommands` if the user configured an override, else
    /// [`DEFAULT_SDCOMMANDS`]. The user's list replaces the driver default
    /// entirely rather than being merged with it — see SPEC_FULL.md's
    /// resolution of the spec's open precedence question.
    pub fn resolve(sdcommands_override: Option<&str>) -> String {
        sdcommands_override
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_SDCOMMANDS.to_string())
    }

    /// Convenience wrapper implementing
    /// `upsdrv_shutdown_sdcommands_or_default`: resolves the effective CSV
    /// list and walks it in one call.
    pub fn shutdown_or_default<F>(
        &self,
        sdcommands_override: Option<&str>,
        instcmd: F,
    ) -> SdCmdOutcome
    where
        F: FnMut(&str) -> InstcmdResult,
    {
        let list = Self::resolve(sdcommands_override);
        self.walk(&list, instcmd)
    }

    fn split(csv_list: &str) -> impl Iterator<Item = &str> {
        csv_list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_instcmd_fallback_scenario() {
        let dispatcher = SdCmdDispatcher::new();
        let mut calls = Vec::new();

        let outcome = dispatcher.walk("shutdown.return,shutdown.stayoff,load.off", |name| {
            calls.push(name.to_string());
            match name {
                "shutdown.return" => InstcmdResult::Unknown,
                "shutdown.stayoff" => InstcmdResult::Handled,
                _ => InstcmdResult::Handled,
            }
        });

        assert_eq!(outcome, SdCmdOutcome::Handled("shutdown.stayoff".to_string()));
        assert_eq!(calls, vec!["shutdown.return", "shutdown.stayoff"]);
    }

    #[test]
    fn empty_entries_and_whitespace_are_skipped() {
        let dispatcher = SdCmdDispatcher::new();
        let mut calls = Vec::new();
        let outcome = dispatcher.walk(" a ,, b ,", |name| {
            calls.push(name.to_string());
            InstcmdResult::Unknown
        });
        assert_eq!(calls, vec!["a", "b"]);
        assert_eq!(outcome, SdCmdOutcome::Invalid);
    }

    #[test]
    fn resolve_prefers_user_override_over_default() {
        assert_eq!(SdCmdDispatcher::resolve(Some("foo,bar")), "foo,bar");
        assert_eq!(SdCmdDispatcher::resolve(None), DEFAULT_SDCOMMANDS);
    }

    #[test]
    fn no_success_yields_invalid() {
        let dispatcher = SdCmdDispatcher::new();
        let outcome = dispatcher.walk("a,b", |_| InstcmdResult::Unknown);
        assert_eq!(outcome, SdCmdOutcome::Invalid);
    }
}
