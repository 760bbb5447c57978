//! Three-phase barrier for `ups.status`/`ups.alarm`, preventing upsd from
//! ever observing a partially-recomputed status string (spec.md §4.3,
//! Testable Property 1).

use crate::dstate::DState;

/// Accumulates status tokens across one `updateinfo` call before
/// publishing them atomically to `ups.status`.
#[derive(Debug, Default)]
pub struct StatusBuffer {
    scratch: Vec<String>,
}

impl StatusBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty the scratch buffer. Call once at the start of `updateinfo`.
    pub fn init(&mut self) {
        self.scratch.clear();
    }

    /// Append a token (`OL`, `OB`, `LB`, ...). Duplicates are silently
    /// collapsed; insertion order is preserved.
    pub fn set(&mut self, token: &str) {
        if !self.scratch.iter().any(|t| t == token) {
            self.scratch.push(token.to_string());
        }
    }

    /// Atomically publish the scratch buffer to `ups.status`. An empty
    /// buffer clears the variable rather than setting it to `""`.
    pub fn commit(&mut self, dstate: &mut DState) {
        if self.scratch.is_empty() {
            dstate.delinfo("ups.status");
        } else {
            dstate.setinfo("ups.status", &self.scratch.join(" "));
        }
    }
}

/// Same barrier shape as [`StatusBuffer`], targeting `ups.alarm` with
/// free-form bracketed messages instead of a fixed token vocabulary.
#[derive(Debug, Default)]
pub struct AlarmBuffer {
    scratch: Vec<String>,
}

impl AlarmBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&mut self) {
        self.scratch.clear();
    }

    pub fn set(&mut self, message: &str) {
        if !self.scratch.iter().any(|m| m == message) {
            self.scratch.push(message.to_string());
        }
    }

    pub fn commit(&mut self, dstate: &mut DState) {
        if self.scratch.is_empty() {
            dstate.delinfo("ups.alarm");
        } else {
            dstate.setinfo("ups.alarm", &self.scratch.join(" "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_publishes_atomically_and_collapses_duplicates() {
        let mut buf = StatusBuffer::new();
        let mut ds = DState::new();

        buf.init();
        buf.set("OL");
        buf.set("CHRG");
        buf.set("OL");
        buf.commit(&mut ds);

        assert_eq!(ds.getinfo("ups.status"), Some("OL CHRG"));
    }

    #[test]
    fn empty_commit_clears_the_variable() {
        let mut buf = StatusBuffer::new();
        let mut ds = DState::new();
        buf.init();
        buf.set("OL");
        buf.commit(&mut ds);
        assert!(ds.exists("ups.status"));

        buf.init();
        buf.commit(&mut ds);
        assert!(!ds.exists("ups.status"));
    }

    #[test]
    fn peer_never_sees_partial_concatenation() {
        // Mid-accumulation, ups.status reflects only the prior commit, not
        // a half-built scratch buffer: this is what makes the barrier
        // atomic from a concurrent DUMPALL reader's perspective.
        let mut buf = StatusBuffer::new();
        let mut ds = DState::new();

        buf.init();
        buf.set("OL");
        buf.commit(&mut ds);
        assert_eq!(ds.getinfo("ups.status"), Some("OL"));

        buf.init();
        buf.set("OB");
        buf.set("LB");
        // Not yet committed: a DUMPALL here must still see "OL".
        assert_eq!(ds.getinfo("ups.status"), Some("OL"));
        buf.commit(&mut ds);
        assert_eq!(ds.getinfo("ups.status"), Some("OB LB"));
    }

    #[test]
    fn alarm_buffer_same_shape() {
        let mut buf = AlarmBuffer::new();
        let mut ds = DState::new();
        buf.init();
        buf.set("[battery.charge is low]");
        buf.commit(&mut ds);
        assert_eq!(ds.getinfo("ups.alarm"), Some("[battery.charge is low]"));
    }
}
