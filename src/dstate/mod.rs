//! The dstate fabric: a versioned, change-tracked store mapping dotted
//! variable names to string values, plus the instant-command registry.
//!
//! This owns no I/O. `Lifecycle` drains dirty variables and hands the
//! resulting wire lines to `CtrlSocket`; see SPEC_FULL.md §4.2.

mod variable;
mod wire;

pub use variable::{Flag, FlagSet, Variable};
pub use wire::{WireLine, escape_value, unescape_value};

use std::collections::BTreeMap;

/// The in-memory variable store owned exclusively by the poll loop.
#[derive(Debug, Default)]
pub struct DState {
    variables: BTreeMap<String, Variable>,
    commands: BTreeMap<String, bool>, // name -> dirty (added/removed since last drain)
    freshness: Freshness,
    freshness_dirty: bool,
    /// Queue of wire lines produced by mutations since the last drain, in
    /// call order. `DUMPALL` replays the live state directly rather than
    /// from this queue.
    pending: Vec<WireLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Ok,
    Stale,
}

impl Default for Freshness {
    fn default() -> Self {
        Freshness::Ok
    }
}

impl DState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a variable's value. A no-op (no dirty event) if
    /// the formatted result is byte-identical to the current value.
    pub fn setinfo(&mut self, name: &str, value: &str) {
        let entry = self.variables.entry(name.to_string()).or_default();
        if entry.value.as_deref() == Some(value) {
            return;
        }
        entry.value = Some(value.to_string());
        self.pending.push(WireLine::SetInfo {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    /// Remove a variable. Idempotent: removing an absent name is a no-op.
    pub fn delinfo(&mut self, name: &str) {
        if self.variables.remove(name).is_some() {
            self.pending.push(WireLine::DelInfo {
                name: name.to_string(),
            });
        }
    }

    pub fn getinfo(&self, name: &str) -> Option<&str> {
        self.variables.get(name).and_then(|v| v.value.as_deref())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn flags(&self, name: &str) -> Option<FlagSet> {
        self.variables.get(name).map(|v| v.flags)
    }

    pub fn setflags(&mut self, name: &str, flags: FlagSet) {
        let entry = self.variables.entry(name.to_string()).or_default();
        entry.flags = flags;
        self.pending.push(WireLine::SetFlags {
            name: name.to_string(),
            flags,
        });
    }

    pub fn setaux(&mut self, name: &str, aux: u32) {
        let entry = self.variables.entry(name.to_string()).or_default();
        entry.aux = aux;
        self.pending.push(WireLine::SetAux {
            name: name.to_string(),
            aux,
        });
    }

    /// Append an enum entry. Duplicates are silently dropped.
    pub fn addenum(&mut self, name: &str, value: &str) {
        let entry = self.variables.entry(name.to_string()).or_default();
        if entry.enums.iter().any(|e| e == value) {
            return;
        }
        entry.enums.push(value.to_string());
        self.pending.push(WireLine::AddEnum {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    pub fn delenum(&mut self, name: &str, value: &str) {
        if let Some(entry) = self.variables.get_mut(name) {
            let before = entry.enums.len();
            entry.enums.retain(|e| e != value);
            if entry.enums.len() != before {
                self.pending.push(WireLine::DelEnum {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }

    pub fn addrange(&mut self, name: &str, lo: i64, hi: i64) {
        let entry = self.variables.entry(name.to_string()).or_default();
        entry.ranges.push((lo, hi));
        self.pending.push(WireLine::AddRange {
            name: name.to_string(),
            lo,
            hi,
        });
    }

    pub fn addcmd(&mut self, name: &str) {
        if !self.commands.contains_key(name) {
            self.commands.insert(name.to_string(), false);
            self.pending.push(WireLine::AddCmd {
                name: name.to_string(),
            });
        }
    }

    pub fn delcmd(&mut self, name: &str) {
        if self.commands.remove(name).is_some() {
            self.pending.push(WireLine::DelCmd {
                name: name.to_string(),
            });
        }
    }

    pub fn has_cmd(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn dataok(&mut self) {
        if self.freshness != Freshness::Ok {
            self.freshness = Freshness::Ok;
            self.freshness_dirty = true;
            self.pending.push(WireLine::DataOk);
        }
    }

    pub fn datastale(&mut self) {
        if self.freshness != Freshness::Stale {
            self.freshness = Freshness::Stale;
            self.freshness_dirty = true;
            self.pending.push(WireLine::DataStale);
        }
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    /// Validate a candidate value against a variable's RW/enum/range/aux
    /// constraints, per SPEC_FULL.md §4.2 / spec.md Testable Property 3.
    /// Returns `Ok(())` if the SET would be accepted.
    pub fn validate_set(&self, name: &str, value: &str) -> Result<(), SetRejection> {
        let var = self.variables.get(name).ok_or(SetRejection::NoSuchName)?;
        if !var.flags.contains(Flag::Rw) {
            return Err(SetRejection::ReadOnly);
        }
        if !var.enums.is_empty() && !var.enums.iter().any(|e| e == value) {
            return Err(SetRejection::InvalidValue);
        }
        if !var.ranges.is_empty() {
            let parsed: i64 = value.parse().map_err(|_| SetRejection::InvalidValue)?;
            if !var.ranges.iter().any(|&(lo, hi)| parsed >= lo && parsed <= hi) {
                return Err(SetRejection::InvalidValue);
            }
        }
        if var.flags.contains(Flag::String) && var.aux > 0 && value.len() as u32 > var.aux {
            return Err(SetRejection::TooLong);
        }
        Ok(())
    }

    /// Drain all wire lines produced since the last drain, in call order.
    /// Must be invoked after every `updateinfo` and after every accepted
    /// `instcmd`/`setvar` so no change is ever silently dropped
    /// (spec.md Testable Property 2).
    pub fn drain(&mut self) -> Vec<WireLine> {
        std::mem::take(&mut self.pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Stream the complete current state as wire lines, terminated by
    /// `DUMPDONE`, for a newly-connected peer (spec.md S1).
    pub fn dump_all(&self) -> Vec<WireLine> {
        let mut lines = Vec::new();
        for (name, var) in &self.variables {
            if let Some(value) = &var.value {
                lines.push(WireLine::SetInfo {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
            if var.flags != FlagSet::empty() {
                lines.push(WireLine::SetFlags {
                    name: name.clone(),
                    flags: var.flags,
                });
            }
            if var.aux > 0 {
                lines.push(WireLine::SetAux {
                    name: name.clone(),
                    aux: var.aux,
                });
            }
            for e in &var.enums {
                lines.push(WireLine::AddEnum {
                    name: name.clone(),
                    value: e.clone(),
                });
            }
            for &(lo, hi) in &var.ranges {
                lines.push(WireLine::AddRange {
                    name: name.clone(),
                    lo,
                    hi,
                });
            }
        }
        for name in self.commands.keys() {
            lines.push(WireLine::AddCmd { name: name.clone() });
        }
        lines.push(WireLine::DumpDone);
        lines
    }

    /// Replay previously-dumped wire lines into this (presumably fresh)
    /// store. Used both by the round-trip test property and by any tool
    /// that wants to reconstruct a mirror of driver state.
    pub fn replay(&mut self, lines: &[WireLine]) {
        for line in lines {
            match line {
                WireLine::SetInfo { name, value } => self.setinfo(name, value),
                WireLine::DelInfo { name } => self.delinfo(name),
                WireLine::SetFlags { name, flags } => self.setflags(name, *flags),
                WireLine::SetAux { name, aux } => self.setaux(name, *aux),
                WireLine::AddEnum { name, value } => self.addenum(name, value),
                WireLine::DelEnum { name, value } => self.delenum(name, value),
                WireLine::AddRange { name, lo, hi } => self.addrange(name, *lo, *hi),
                WireLine::AddCmd { name } => self.addcmd(name),
                WireLine::DelCmd { name } => self.delcmd(name),
                WireLine::DataOk => self.dataok(),
                WireLine::DataStale => self.datastale(),
                WireLine::DumpDone => {}
            }
        }
        // Replay itself produces pending lines via the individual setters;
        // a true "fresh" reconstruction doesn't care about that queue.
        self.pending.clear();
    }
}

/// Why a `SET` was rejected, mapped to the socket `ERR` codes in
/// `crate::ctrlsocket` at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetRejection {
    NoSuchName,
    ReadOnly,
    InvalidValue,
    TooLong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setinfo_is_idempotent_for_identical_value() {
        let mut ds = DState::new();
        ds.setinfo("ups.status", "OL");
        assert_eq!(ds.drain().len(), 1);
        ds.setinfo("ups.status", "OL");
        assert_eq!(ds.drain().len(), 0, "identical value must not re-dirty");
    }

    #[test]
    fn delinfo_is_idempotent() {
        let mut ds = DState::new();
        ds.setinfo("battery.charge", "80");
        ds.drain();
        ds.delinfo("battery.charge");
        assert_eq!(ds.drain().len(), 1);
        ds.delinfo("battery.charge");
        assert_eq!(ds.drain().len(), 0);
    }

    #[test]
    fn validate_set_checks_rw_enum_range_aux() {
        let mut ds = DState::new();
        ds.setinfo("input.transfer.low", "90");
        ds.setflags("input.transfer.low", FlagSet::from(Flag::Rw) | Flag::Number);
        ds.addrange("input.transfer.low", 80, 120);
        ds.drain();

        assert!(ds.validate_set("input.transfer.low", "95").is_ok());
        assert_eq!(
            ds.validate_set("input.transfer.low", "200"),
            Err(SetRejection::InvalidValue)
        );
        assert_eq!(
            ds.validate_set("no.such.var", "x"),
            Err(SetRejection::NoSuchName)
        );
    }

    #[test]
    fn validate_set_rejects_readonly() {
        let mut ds = DState::new();
        ds.setinfo("ups.status", "OL");
        ds.drain();
        assert_eq!(
            ds.validate_set("ups.status", "OB"),
            Err(SetRejection::ReadOnly)
        );
    }

    #[test]
    fn dump_all_s1_scenario() {
        let mut ds = DState::new();
        ds.setinfo("ups.status", "OL");
        ds.addcmd("shutdown.return");
        let lines: Vec<String> = ds.dump_all().iter().map(WireLine::to_wire).collect();
        assert_eq!(
            lines,
            vec![
                "SETINFO ups.status \"OL\"".to_string(),
                "ADDCMD shutdown.return".to_string(),
                "DUMPDONE".to_string(),
            ]
        );
    }

    #[test]
    fn round_trip_dump_and_replay_match() {
        let mut ds = DState::new();
        ds.setinfo("ups.status", "OL");
        ds.setflags("ups.status", FlagSet::from(Flag::Rw));
        ds.addcmd("shutdown.return");
        ds.addenum("input.transfer.low", "90");
        ds.addrange("battery.charge", 0, 100);

        let dumped = ds.dump_all();
        let mut replayed = DState::new();
        replayed.replay(&dumped);

        assert_eq!(replayed.getinfo("ups.status"), ds.getinfo("ups.status"));
        assert_eq!(replayed.flags("ups.status"), ds.flags("ups.status"));
        assert!(replayed.has_cmd("shutdown.return"));
        assert_eq!(replayed.dump_all(), dumped);
    }

    #[test]
    fn dataok_datastale_only_dirty_on_transition() {
        let mut ds = DState::new();
        ds.dataok(); // already Ok by default; no event
        assert_eq!(ds.drain().len(), 0);
        ds.datastale();
        assert_eq!(ds.drain().len(), 1);
        ds.datastale();
        assert_eq!(ds.drain().len(), 0);
    }
}
