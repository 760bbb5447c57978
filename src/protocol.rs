//! Inbound verb parsing and dispatch for the control socket
//! (spec.md §4.4). Sits between `ctrlsocket::tokenize` and the
//! `DriverCallbacks`/`DState` state that actually answers each request.

use crate::driver::{DriverCallbacks, DriverContext, InstcmdResult, SetvarResult, main_instcmd_fallback, main_setvar};
use crate::dstate::SetRejection;
use crate::error::ReplyCode;
use crate::shutdown::SdCmdDispatcher;

/// A parsed inbound request, independent of its wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    DumpAll,
    Set { name: String, value: String },
    InstCmd { name: String, arg: Option<String> },
    Tracking { id: String },
    Ping,
}

/// Parse already-tokenized input into a [`Verb`]. Verbs are
/// case-insensitive; unrecognized first tokens map to `UNKNOWN-COMMAND`.
pub fn parse_verb(tokens: &[String]) -> Result<Verb, ReplyCode> {
    let Some(verb) = tokens.first() else {
        return Err(ReplyCode::InvalidArgument);
    };

    match verb.to_ascii_uppercase().as_str() {
        "DUMPALL" => Ok(Verb::DumpAll),
        "PING" => Ok(Verb::Ping),
        "SET" => {
            let name = tokens.get(1).ok_or(ReplyCode::InvalidArgument)?;
            let value = tokens.get(2).ok_or(ReplyCode::InvalidArgument)?;
            Ok(Verb::Set {
                name: name.clone(),
                value: value.clone(),
            })
        }
        "INSTCMD" => {
            let name = tokens.get(1).ok_or(ReplyCode::InvalidArgument)?;
            Ok(Verb::InstCmd {
                name: name.clone(),
                arg: tokens.get(2).cloned(),
            })
        }
        "TRACKING" => {
            let id = tokens.get(1).ok_or(ReplyCode::InvalidArgument)?;
            Ok(Verb::Tracking { id: id.clone() })
        }
        _ => Err(ReplyCode::UnknownCommand),
    }
}

/// Render a completion result as the wire reply, folding in a pending
/// TRACKING id if one was set for this peer (spec.md §4.4 `TRACKING`).
pub fn render_reply(result: Result<(), ReplyCode>, tracking_id: Option<&str>) -> String {
    match (result, tracking_id) {
        (Ok(()), Some(id)) => format!("OK {id}"),
        (Ok(()), None) => "OK".to_string(),
        (Err(code), Some(id)) => format!("ERR {} {id}", code.as_wire()),
        (Err(code), None) => format!("ERR {}", code.as_wire()),
    }
}

/// Handle a `SET name "value"` request: validate against `DState`
/// constraints, then dispatch to the driver's `setvar` (falling back to
/// the core-owned `driver.*` variables first).
pub async fn handle_set<D: DriverCallbacks + ?Sized>(
    ctx: &mut DriverContext,
    driver: &mut D,
    name: &str,
    value: &str,
) -> Result<(), ReplyCode> {
    ctx.dstate.validate_set(name, value).map_err(|rejection| match rejection {
        SetRejection::NoSuchName => ReplyCode::InvalidArgument,
        SetRejection::ReadOnly => ReplyCode::ReadOnly,
        SetRejection::InvalidValue => ReplyCode::InvalidValue,
        SetRejection::TooLong => ReplyCode::TooLong,
    })?;

    let result = if let Some(result) = main_setvar(name, value) {
        result
    } else {
        driver.setvar(ctx, name, value).await
    };

    match result {
        SetvarResult::Handled => {
            ctx.dstate.setinfo(name, value);
            Ok(())
        }
        SetvarResult::Unknown => Err(ReplyCode::InvalidArgument),
        SetvarResult::Invalid => Err(ReplyCode::InvalidValue),
        SetvarResult::Failed | SetvarResult::ConversionFailed => Err(ReplyCode::CmdFailed),
    }
}

/// Handle an `INSTCMD name [arg]` request against the registered
/// instant-command set, trying the core fallback before the plug-in.
pub async fn handle_instcmd<D: DriverCallbacks + ?Sized>(
    ctx: &mut DriverContext,
    driver: &mut D,
    name: &str,
    arg: Option<&str>,
) -> Result<(), ReplyCode> {
    if !ctx.dstate.has_cmd(name) && main_instcmd_fallback(name).is_none() {
        return Err(ReplyCode::UnknownCommand);
    }

    let result = if let Some(result) = main_instcmd_fallback(name) {
        result
    } else {
        driver.instcmd(ctx, name, arg).await
    };

    match result {
        InstcmdResult::Handled => Ok(()),
        InstcmdResult::Unknown => Err(ReplyCode::UnknownCommand),
        InstcmdResult::Invalid => Err(ReplyCode::InvalidArgument),
        InstcmdResult::Failed | InstcmdResult::ConversionFailed => Err(ReplyCode::CmdFailed),
    }
}

/// Drive `shutdown.default` by walking the effective `sdcommands` list
/// against `handle_instcmd`, per spec.md §4.5.
pub async fn shutdown_default<D: DriverCallbacks + ?Sized>(
    ctx: &mut DriverContext,
    driver: &mut D,
    sdcommands_override: Option<&str>,
) -> crate::shutdown::SdCmdOutcome {
    let list = SdCmdDispatcher::resolve(sdcommands_override);
    let mut outcome = crate::shutdown::SdCmdOutcome::Invalid;
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let result = if !ctx.dstate.has_cmd(name) {
            InstcmdResult::Unknown
        } else if let Some(result) = main_instcmd_fallback(name) {
            result
        } else {
            driver.instcmd(ctx, name, None).await
        };
        if result == InstcmdResult::Handled {
            outcome = crate::shutdown::SdCmdOutcome::Handled(name.to_string());
            break;
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_verb_recognizes_case_insensitively() {
        assert_eq!(
            parse_verb(&["dumpall".to_string()]).unwrap(),
            Verb::DumpAll
        );
        assert_eq!(parse_verb(&["PING".to_string()]).unwrap(), Verb::Ping);
    }

    #[test]
    fn parse_verb_set_requires_name_and_value() {
        assert_eq!(
            parse_verb(&["SET".to_string(), "x".to_string()]),
            Err(ReplyCode::InvalidArgument)
        );
        assert_eq!(
            parse_verb(&[
                "SET".to_string(),
                "input.transfer.low".to_string(),
                "95".to_string()
            ])
            .unwrap(),
            Verb::Set {
                name: "input.transfer.low".to_string(),
                value: "95".to_string(),
            }
        );
    }

    #[test]
    fn parse_verb_unknown_command() {
        assert_eq!(
            parse_verb(&["BOGUS".to_string()]),
            Err(ReplyCode::UnknownCommand)
        );
    }

    #[test]
    fn render_reply_folds_in_tracking_id() {
        assert_eq!(render_reply(Ok(()), None), "OK");
        assert_eq!(render_reply(Ok(()), Some("abc")), "OK abc");
        assert_eq!(
            render_reply(Err(ReplyCode::InvalidValue), Some("abc")),
            "ERR INVALID-VALUE abc"
        );
    }

    use crate::config::ParamTable;
    use crate::driver::{DriverInfo, DriverStability};
    use crate::error::Result;
    use async_trait::async_trait;

    struct StubDriver {
        instcmd_script: Vec<(&'static str, InstcmdResult)>,
        instcmd_calls: Vec<String>,
    }

    #[async_trait]
    impl DriverCallbacks for StubDriver {
        fn info(&self) -> DriverInfo {
            DriverInfo {
                name: "stub",
                version: "0",
                author: "test",
                stability: DriverStability::Stable,
            }
        }

        async fn initups(&mut self, _ctx: &mut DriverContext) -> Result<()> {
            Ok(())
        }

        async fn initinfo(&mut self, _ctx: &mut DriverContext) -> Result<()> {
            Ok(())
        }

        async fn updateinfo(&mut self, _ctx: &mut DriverContext) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&mut self, _ctx: &mut DriverContext) -> Result<()> {
            Ok(())
        }

        async fn cleanup(&mut self, _ctx: &mut DriverContext) {}

        async fn instcmd(
            &mut self,
            _ctx: &mut DriverContext,
            name: &str,
            _arg: Option<&str>,
        ) -> InstcmdResult {
            self.instcmd_calls.push(name.to_string());
            self.instcmd_script
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, r)| *r)
                .unwrap_or(InstcmdResult::Unknown)
        }

        async fn setvar(
            &mut self,
            _ctx: &mut DriverContext,
            _name: &str,
            _value: &str,
        ) -> SetvarResult {
            SetvarResult::Handled
        }
    }

    fn make_ctx() -> DriverContext {
        DriverContext::new(ParamTable::new())
    }

    #[tokio::test]
    async fn s2_set_happy_path() {
        let mut ctx = make_ctx();
        ctx.dstate.setinfo("input.transfer.low", "90");
        ctx.dstate
            .setflags("input.transfer.low", crate::dstate::FlagSet::from(crate::dstate::Flag::Rw));
        ctx.dstate.addrange("input.transfer.low", 80, 120);
        ctx.dstate.drain();

        let mut driver = StubDriver {
            instcmd_script: vec![],
            instcmd_calls: vec![],
        };

        let result = handle_set(&mut ctx, &mut driver, "input.transfer.low", "95").await;
        assert_eq!(result, Ok(()));
        assert_eq!(render_reply(result, None), "OK");
    }

    #[tokio::test]
    async fn s3_set_rejected_does_not_invoke_setvar() {
        let mut ctx = make_ctx();
        ctx.dstate.setinfo("input.transfer.low", "90");
        ctx.dstate
            .setflags("input.transfer.low", crate::dstate::FlagSet::from(crate::dstate::Flag::Rw));
        ctx.dstate.addrange("input.transfer.low", 80, 120);
        ctx.dstate.drain();

        let mut driver = StubDriver {
            instcmd_script: vec![],
            instcmd_calls: vec![],
        };

        let result = handle_set(&mut ctx, &mut driver, "input.transfer.low", "200").await;
        assert_eq!(result, Err(ReplyCode::InvalidValue));
        assert_eq!(render_reply(result, None), "ERR INVALID-VALUE");
        // setvar was never reached: the value stays at the pre-SET reading.
        assert_eq!(ctx.dstate.getinfo("input.transfer.low"), Some("90"));
    }

    #[tokio::test]
    async fn s4_instcmd_fallback_via_shutdown_default() {
        let mut ctx = make_ctx();
        ctx.dstate.addcmd("shutdown.stayoff");
        ctx.dstate.addcmd("load.off");
        ctx.dstate.drain();

        let mut driver = StubDriver {
            instcmd_script: vec![("shutdown.stayoff", InstcmdResult::Handled)],
            instcmd_calls: vec![],
        };

        let outcome = shutdown_default(&mut ctx, &mut driver, None).await;
        assert_eq!(
            outcome,
            crate::shutdown::SdCmdOutcome::Handled("shutdown.stayoff".to_string())
        );
        // shutdown.return was never registered so it's skipped as Unknown
        // without reaching the driver at all; load.off is never invoked.
        assert_eq!(driver.instcmd_calls, vec!["shutdown.stayoff"]);
    }
}
