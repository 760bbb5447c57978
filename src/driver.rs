//! The five-function plug-in contract (spec.md §4.6, §6.2).
//!
//! A per-device driver implements [`DriverCallbacks`] against a
//! [`DriverContext`] that owns the dstate fabric, the parameter table and
//! the status/alarm buffers. The core invokes the trait; the plug-in
//! never reaches back into the core's poll loop directly (SPEC_FULL.md
//! Design Notes, "Global mutable state").

use crate::config::ParamTable;
use crate::dstate::DState;
use crate::error::Result;
use crate::status::{AlarmBuffer, StatusBuffer};
use async_trait::async_trait;

/// Result of an `instcmd`/shutdown-walk dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstcmdResult {
    Handled,
    Unknown,
    Invalid,
    Failed,
    ConversionFailed,
}

/// Result of a `setvar` dispatch. Same shape as [`InstcmdResult`] but kept
/// distinct per SPEC_FULL.md Design Notes ("sum type per handler, not a
/// shared enum reused by accident").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetvarResult {
    Handled,
    Unknown,
    Invalid,
    Failed,
    ConversionFailed,
}

/// A request arriving over the control socket, replacing the original
/// function-pointer table (`upsh.instcmd`, `upsh.setvar`) with an
/// explicit sum type (SPEC_FULL.md Design Notes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    InstCmd { name: String, arg: Option<String> },
    SetVar { name: String, value: String },
}

/// Driver maturity/stability, mirrored from `upsdrv_info_t` in
/// `original_source/drivers/main.h` and exposed to operators via
/// `driver.version.data`-style DState mirrors (SPEC_FULL.md §10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStability {
    Broken,
    Experimental,
    Beta,
    Stable,
    Complete,
}

/// Static identity a plug-in reports about itself, analogous to the
/// C `upsdrv_info_t` structure.
#[derive(Debug, Clone)]
pub struct DriverInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub author: &'static str,
    pub stability: DriverStability,
}

/// Mutable tables threaded explicitly into every plug-in callback instead
/// of living behind process-global statics.
pub struct DriverContext {
    pub dstate: DState,
    pub params: ParamTable,
    pub status: StatusBuffer,
    pub alarm: AlarmBuffer,
}

impl DriverContext {
    pub fn new(params: ParamTable) -> Self {
        Self {
            dstate: DState::new(),
            params,
            status: StatusBuffer::new(),
            alarm: AlarmBuffer::new(),
        }
    }
}

/// The fixed registry of plug-in entry points. `initups`, `initinfo`,
/// `updateinfo`, `shutdown` and `cleanup` are required; the rest default
/// to a no-op/unknown response so a minimal driver only has to implement
/// five methods.
#[async_trait]
pub trait DriverCallbacks: Send {
    /// Identity/stability metadata, shown by `-h`/`-V` and mirrored into
    /// `driver.*` DState entries.
    fn info(&self) -> DriverInfo;

    /// Register recognized `-x` options before the config file is parsed.
    /// Called once, before `makevartable`'s caller loads `ups.conf`.
    fn makevartable(&self, _params: &mut ParamTable) {}

    /// Open the device and perform any protocol handshake. Called after
    /// config load, before privilege drop.
    async fn initups(&mut self, ctx: &mut DriverContext) -> Result<()>;

    /// Populate the initial DState/instant-command set. Called once,
    /// after `initups` succeeds.
    async fn initinfo(&mut self, ctx: &mut DriverContext) -> Result<()>;

    /// Poll the device and refresh DState/status/alarm. Called every
    /// `pollinterval` seconds.
    async fn updateinfo(&mut self, ctx: &mut DriverContext) -> Result<()>;

    /// Drive the device into a powered-down state. Called in `-k` mode and
    /// as the terminal leaf of a shutdown INSTCMD walk.
    async fn shutdown(&mut self, ctx: &mut DriverContext) -> Result<()>;

    /// Release the device handle. Called exactly once, on any exit path.
    async fn cleanup(&mut self, ctx: &mut DriverContext);

    /// Free-form usage text for `-h`.
    fn help(&self) -> Option<String> {
        None
    }

    /// Free-form banner text printed alongside `info()` on `-V`, mirroring
    /// `upsdrv_banner()` in `original_source/drivers/main.h` (a sixth
    /// callback slot the distilled spec's five-function table omits; see
    /// SPEC_FULL.md §10).
    fn banner(&self) -> Option<String> {
        None
    }

    /// Dispatch a driver-specific instant command. The core's
    /// `main_instcmd_fallback` is tried first for universally-supported
    /// commands; this is only reached for driver-owned names.
    async fn instcmd(
        &mut self,
        _ctx: &mut DriverContext,
        _name: &str,
        _arg: Option<&str>,
    ) -> InstcmdResult {
        InstcmdResult::Unknown
    }

    /// Dispatch a driver-specific `SET`. Reached only after DState
    /// validation (`DState::validate_set`) has already accepted the value.
    async fn setvar(&mut self, _ctx: &mut DriverContext, _name: &str, _value: &str) -> SetvarResult {
        SetvarResult::Unknown
    }
}

/// `main_instcmd_fallback`: universally-supported commands any driver
/// gets for free, tried before the plug-in's own `instcmd`. Recognizes
/// the names so `DState`-backed instant-command lookups don't need every
/// driver to register them, but performing their actual effect (reload,
/// exit, kill-power) needs `&mut Lifecycle`, not just `&mut DriverContext`
/// — see `Lifecycle::handle_core_instcmd`, which intercepts these four
/// names before this stateless fallback is ever consulted on the live
/// control-socket path.
pub fn main_instcmd_fallback(name: &str) -> Option<InstcmdResult> {
    match name {
        "driver.reload" | "driver.reload-or-error" | "driver.exit" | "driver.killpower" => {
            Some(InstcmdResult::Handled)
        }
        _ => None,
    }
}

/// `main_setvar`: core-owned writable variables (`driver.debug` and
/// friends), tried before the plug-in's own `setvar`.
pub fn main_setvar(name: &str, _value: &str) -> Option<SetvarResult> {
    match name {
        "driver.debug" => Some(SetvarResult::Handled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_instcmd_fallback_covers_core_owned_commands() {
        assert_eq!(
            main_instcmd_fallback("driver.reload"),
            Some(InstcmdResult::Handled)
        );
        assert_eq!(
            main_instcmd_fallback("driver.killpower"),
            Some(InstcmdResult::Handled)
        );
        assert_eq!(main_instcmd_fallback("shutdown.return"), None);
    }

    #[test]
    fn main_setvar_covers_driver_debug() {
        assert_eq!(
            main_setvar("driver.debug", "1"),
            Some(SetvarResult::Handled)
        );
        assert_eq!(main_setvar("battery.charge.low", "10"), None);
    }
}
