//! `nutdrv-skeleton`: a minimal demonstration driver linked against the
//! shared runtime, the Rust equivalent of `drivers/skel.c` wired up to
//! `drivers/main.c` in the original corpus. Real per-device drivers copy
//! this shape and replace the body of [`SkeletonDriver`]'s five required
//! methods with actual transport I/O.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{CommandFactory, Parser};
use nutdrv_core::cli::Cli;
use nutdrv_core::config::{ParamKind, ParamTable};
use nutdrv_core::driver::{
    DriverCallbacks, DriverContext, DriverInfo, DriverStability, InstcmdResult, SetvarResult,
};
use nutdrv_core::dstate::{Flag, FlagSet};
use nutdrv_core::error::Result as NutResult;
use nutdrv_core::lifecycle::Lifecycle;
use nutdrv_core::logging::{LogTarget, init_logging, resolve_level};

/// Stand-in for a real device transport: a skeleton driver has nothing to
/// poll, so it just reports a fixed "on line" status once connected.
struct SkeletonDriver {
    connected: bool,
}

impl SkeletonDriver {
    fn new() -> Self {
        Self { connected: false }
    }
}

#[async_trait]
impl DriverCallbacks for SkeletonDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo {
            name: "nutdrv-skeleton",
            version: env!("APP_VERSION"),
            author: "nutdrv-core contributors",
            stability: DriverStability::Stable,
        }
    }

    fn makevartable(&self, params: &mut ParamTable) {
        params.addvar(ParamKind::Flag, "xyzzy", "enable xyzzy mode");
        params.addvar(ParamKind::Value, "cable", "cable revision override");
    }

    async fn initups(&mut self, _ctx: &mut DriverContext) -> NutResult<()> {
        // A real driver opens the device handle here. The skeleton has
        // nothing to open, so this always succeeds.
        self.connected = true;
        Ok(())
    }

    async fn initinfo(&mut self, ctx: &mut DriverContext) -> NutResult<()> {
        ctx.dstate.setinfo("ups.mfr", "skel manufacturer");
        ctx.dstate.setinfo("ups.model", "longrun 15000");
        ctx.dstate.setinfo("device.mfr", "skel manufacturer");
        ctx.dstate.setinfo("device.model", "longrun 15000");

        ctx.dstate.setinfo("battery.charge", "100");
        ctx.dstate
            .setflags("battery.charge", FlagSet::from(Flag::Number));

        ctx.dstate.setinfo("input.transfer.low", "90");
        ctx.dstate.setflags(
            "input.transfer.low",
            FlagSet::from(Flag::Rw) | Flag::Number,
        );
        ctx.dstate.addrange("input.transfer.low", 80, 120);

        ctx.dstate.addcmd("shutdown.return");
        ctx.dstate.addcmd("shutdown.stayoff");
        ctx.dstate.addcmd("load.off");
        ctx.dstate.addcmd("test.battery.start.quick");

        Ok(())
    }

    async fn updateinfo(&mut self, ctx: &mut DriverContext) -> NutResult<()> {
        if !self.connected {
            ctx.dstate.datastale();
            return Ok(());
        }

        ctx.status.init();
        ctx.status.set("OL");
        ctx.status.commit(&mut ctx.dstate);
        ctx.dstate.dataok();
        Ok(())
    }

    async fn shutdown(&mut self, ctx: &mut DriverContext) -> NutResult<()> {
        ctx.status.init();
        ctx.status.set("FSD");
        ctx.status.set("OFF");
        ctx.status.commit(&mut ctx.dstate);
        Ok(())
    }

    async fn cleanup(&mut self, _ctx: &mut DriverContext) {
        self.connected = false;
    }

    fn help(&self) -> Option<String> {
        Some("no additional options".to_string())
    }

    async fn instcmd(
        &mut self,
        _ctx: &mut DriverContext,
        name: &str,
        _arg: Option<&str>,
    ) -> InstcmdResult {
        match name {
            "shutdown.return" | "shutdown.stayoff" | "load.off" => InstcmdResult::Handled,
            "test.battery.start.quick" => InstcmdResult::Handled,
            _ => InstcmdResult::Unknown,
        }
    }

    async fn setvar(&mut self, _ctx: &mut DriverContext, name: &str, _value: &str) -> SetvarResult {
        match name {
            "input.transfer.low" => SetvarResult::Handled,
            _ => SetvarResult::Unknown,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.help {
        Cli::command().print_help().ok();
        println!();
        if let Some(text) = SkeletonDriver::new().help() {
            println!("{text}");
        }
        std::process::exit(0);
    }

    if cli.version {
        let info = SkeletonDriver::new().info();
        println!(
            "{} {} ({}, stability: {:?})",
            info.name, info.version, info.author, info.stability
        );
        if let Some(banner) = SkeletonDriver::new().banner() {
            println!("{banner}");
        }
        std::process::exit(0);
    }

    let level = resolve_level(cli.debug, 0);
    let target = if cli.foreground() {
        LogTarget::Stderr
    } else {
        LogTarget::File {
            directory: "/var/log/nut".to_string(),
        }
    };
    init_logging(&target, level).context("initializing logging")?;

    let mut driver = SkeletonDriver::new();
    let mut ctx = DriverContext::new(ParamTable::new());

    let lifecycle = match Lifecycle::boot(&cli, &mut driver, &mut ctx).await {
        Ok(lifecycle) => lifecycle,
        Err(e) => {
            tracing::error!(error = %e, "driver boot failed");
            std::process::exit(e.exit_code().unwrap_or(nutdrv_core::lifecycle::exit_code::INIT_FAILURE));
        }
    };

    let code = lifecycle.run(&mut driver, &mut ctx).await;
    std::process::exit(code);
}
