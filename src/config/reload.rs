//! Reload-discipline primitives (spec.md §4.1 reloadability rule;
//! SPEC_FULL.md §4 clarification on `testval_reloadable` /
//! `testinfo_reloadable` / `testvar_reloadable`).
//!
//! `original_source/drivers/main.h` documents these as three *related but
//! distinct* helpers: `testval_reloadable` is the primitive, parameterized
//! with the caller's own notion of "old value"; `testinfo_reloadable`
//! specializes it for a name backed by [`crate::dstate::DState`];
//! `testvar_reloadable` specializes it for a name backed by
//! [`super::ParamTable`]. [`ParamTable::apply`] already implements the
//! `testvar_reloadable` shape inline (it owns both halves of the
//! comparison); this module exposes the primitive and the `DState`
//! specialization for callers (e.g. a plug-in's own reloadable settings)
//! that aren't routed through `ParamTable`.

use super::ParamTable;
use crate::dstate::DState;

pub use super::paramtable::ReloadOutcome;

/// The raw primitive: given the caller's own `oldval`/`newval` pair and
/// whether this name is reloadable, decide whether a (re-)assignment may
/// proceed. `is_reload = false` means "initial load", where any new value
/// wins regardless of `reloadable`.
pub fn testval_reloadable(
    oldval: Option<&str>,
    newval: Option<&str>,
    reloadable: bool,
    is_reload: bool,
) -> ReloadOutcome {
    if !is_reload {
        return ReloadOutcome::Applied;
    }
    if oldval == newval {
        return ReloadOutcome::Unchanged;
    }
    if reloadable || oldval.is_none() {
        ReloadOutcome::Applied
    } else {
        ReloadOutcome::Rejected
    }
}

/// Specializes [`testval_reloadable`] for a value saved into
/// [`DState`] via `setinfo`, rather than into `ParamTable`. Several
/// original drivers mirror a config-derived value straight into a dstate
/// entry (e.g. `battery.charge.low`) and need the same reload discipline
/// applied there instead of to a `vartab_t` entry.
pub fn testinfo_reloadable(
    dstate: &DState,
    name: &str,
    newval: &str,
    reloadable: bool,
    is_reload: bool,
) -> ReloadOutcome {
    testval_reloadable(dstate.getinfo(name), Some(newval), reloadable, is_reload)
}

/// Specializes [`testval_reloadable`] for a name registered in
/// [`ParamTable`]. Equivalent to what [`ParamTable::apply`] already does
/// internally; exposed standalone for callers that want to check before
/// committing (e.g. to decide whether to log a "kept old value" warning
/// without mutating the table yet).
pub fn testvar_reloadable(
    params: &ParamTable,
    name: &str,
    newval: Option<&str>,
    is_reload: bool,
) -> ReloadOutcome {
    testval_reloadable(
        params.getval(name),
        newval,
        params.is_reloadable(name),
        is_reload,
    )
}
