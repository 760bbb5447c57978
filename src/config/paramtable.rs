//! The registered `-x`/`ups.conf` option table (spec.md §3 "Parameter
//! record", §4.1).

use crate::error::{NutError, Result};
use std::collections::BTreeMap;

/// `(name, type, value?, description, reloadable?, was_seen_this_load)`.
#[derive(Debug, Clone)]
pub enum ParamKind {
    /// A bare switch; present or absent, never carries a value.
    Flag,
    /// A `name=value` option.
    Value,
    /// A `name=value` option whose value is suppressed from any mirrored
    /// `driver.parameter.*` DState entry.
    Sensitive,
}

#[derive(Debug, Clone)]
struct ParamRecord {
    kind: ParamKind,
    description: String,
    reloadable: bool,
    value: Option<String>,
    seen_this_load: bool,
}

/// Outcome of attempting to apply a new value to a registered parameter,
/// per spec.md §4.1's `-1`/`0`/`1` reloadability rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// No-op: the new value is unchanged from the stored one.
    Unchanged,
    /// Rejected: a reload attempted to overwrite a non-reloadable value
    /// that was already set.
    Rejected,
    /// Applied, possibly for the first time.
    Applied,
}

/// Registry of recognized options plus their current values. Built once
/// via `addvar`/`addvar_reloadable` at startup (core options first, then
/// the plug-in's `makevartable`), then fed values from argv `-x` and
/// `ups.conf` during load/reload.
#[derive(Debug, Default)]
pub struct ParamTable {
    params: BTreeMap<String, ParamRecord>,
}

impl ParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn addvar(&mut self, kind: ParamKind, name: &str, description: &str) {
        self.params.insert(
            name.to_string(),
            ParamRecord {
                kind,
                description: description.to_string(),
                reloadable: false,
                value: None,
                seen_this_load: false,
            },
        );
    }

    pub fn addvar_reloadable(&mut self, kind: ParamKind, name: &str, description: &str) {
        self.params.insert(
            name.to_string(),
            ParamRecord {
                kind,
                description: description.to_string(),
                reloadable: true,
                value: None,
                seen_this_load: false,
            },
        );
    }

    /// `getval(name)`: current string value, or `None` if unset/flag-type.
    pub fn getval(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|p| p.value.as_deref())
    }

    /// `testvar(name)`: whether a flag-type option was given at all.
    pub fn testvar(&self, name: &str) -> bool {
        self.params
            .get(name)
            .is_some_and(|p| matches!(p.kind, ParamKind::Flag) && p.seen_this_load)
    }

    pub fn is_reloadable(&self, name: &str) -> bool {
        self.params.get(name).is_some_and(|p| p.reloadable)
    }

    /// Apply one `name[=value]` assignment during either the initial load
    /// (`is_reload = false`) or a subsequent reload (`is_reload = true`).
    ///
    /// Returns the concrete decision so callers (`SignalReload`) can log
    /// exactly what happened, per spec.md S6.
    pub fn apply(&mut self, name: &str, value: Option<&str>, is_reload: bool) -> Result<ReloadOutcome> {
        let record = self
            .params
            .get_mut(name)
            .ok_or_else(|| NutError::config(format!("unknown option: {name}")))?;

        match record.kind {
            ParamKind::Flag if value.is_some() => {
                return Err(NutError::config(format!(
                    "option {name} is a flag and takes no value"
                )));
            }
            ParamKind::Value | ParamKind::Sensitive if value.is_none() => {
                return Err(NutError::config(format!(
                    "option {name} requires a value"
                )));
            }
            _ => {}
        }

        record.seen_this_load = true;

        if !is_reload {
            record.value = value.map(str::to_string);
            return Ok(ReloadOutcome::Applied);
        }

        let new_value = value.map(str::to_string);
        if record.value == new_value {
            return Ok(ReloadOutcome::Unchanged);
        }
        if record.reloadable || record.value.is_none() {
            record.value = new_value;
            Ok(ReloadOutcome::Applied)
        } else {
            Ok(ReloadOutcome::Rejected)
        }
    }

    /// Reset the `seen_this_load` bookkeeping ahead of a fresh load pass,
    /// so `testvar` reflects only flags present in the new parse.
    pub fn begin_load(&mut self) {
        for record in self.params.values_mut() {
            record.seen_this_load = false;
        }
    }

    pub fn description(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|p| p.description.as_str())
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.params
            .get(name)
            .is_some_and(|p| matches!(p.kind, ParamKind::Sensitive))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }
}

/// Registers the options every driver gets for free (spec.md §4.1's core
/// option table), before the plug-in's own `makevartable` runs.
pub fn register_core_options(params: &mut ParamTable) {
    params.addvar(ParamKind::Value, "port", "device locator");
    params.addvar_reloadable(ParamKind::Value, "pollinterval", "seconds between updateinfo calls");
    params.addvar(ParamKind::Value, "user", "privilege-drop target user");
    params.addvar(ParamKind::Value, "group", "privilege-drop target group");
    params.addvar(ParamKind::Value, "chroot", "directory to chroot into");
    params.addvar_reloadable(ParamKind::Value, "synchronous", "yes/no/auto ctrlsocket flow control");
    params.addvar_reloadable(ParamKind::Value, "sdcommands", "shutdown-intent override list");
    params.addvar(ParamKind::Value, "maxstartdelay", "init time budget in seconds");
    params.addvar(ParamKind::Value, "retry", "initups attempt count");
    params.addvar(ParamKind::Flag, "nolock", "skip advisory device-path locking");
    params.addvar_reloadable(ParamKind::Value, "debug_min", "minimum verbosity floor");
}
