//! The driver lifecycle state machine (spec.md §4.7): argv parsing having
//! already happened in [`crate::cli`], this module owns everything from
//! config load through the poll loop to process exit.
//!
//! `Lifecycle` is the only thing in this crate allowed to call
//! `std::process::exit`-equivalent (it returns an exit code from
//! [`Lifecycle::run`] instead; `main.rs` is the one place that actually
//! calls `std::process::exit`) per SPEC_FULL.md's "Pervasive fatalx/exit"
//! design note — nothing below this module terminates the process.

use crate::cli::Cli;
use crate::config::{ConfSection, ParamTable, load_conf, register_core_options};
use crate::ctrlsocket::{CtrlSocket, PeerEvent, PeerId, SyncMode};
use crate::driver::{DriverCallbacks, DriverContext, DriverStability};
use crate::error::{NutError, Result};
use crate::protocol::{self, Verb};
use crate::signal::{SigCmd, SignalSet};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::time::{Duration, interval};

/// `spec.md` §3 "Driver-lifecycle state": one of nine single-threaded,
/// synchronous states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Booting,
    InitUps,
    InitInfo,
    Running,
    Reconnecting,
    Reloading,
    Shutdown,
    Cleanup,
    Exited,
}

/// Exit codes from spec.md §6.3.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const INIT_FAILURE: i32 = 1;
    pub const USAGE_ERROR: i32 = 2;
    pub const SHUTDOWN_FAILED: i32 = 3;
}

/// Number of consecutive `datastale()` observations that trips
/// Running -> Reconnecting (spec.md S5). Not user-configurable: the
/// corpus hard-codes small retry counts at this layer and leaves real
/// backoff tuning to the plug-in's own transport retry logic.
const RECONNECT_THRESHOLD: u32 = 3;

/// Where pidfiles and the control socket live by default
/// (spec.md §6.4). Overridable via `NUT_RUNDIR` for test fixtures and
/// non-FHS installs, the same escape hatch `statepath()` provides in the
/// original `common.c`.
fn rundir() -> PathBuf {
    std::env::var("NUT_RUNDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run/nut"))
}

fn pidfile_path(rundir: &Path, progname: &str, upsname: &str) -> PathBuf {
    rundir.join(format!("{progname}-{upsname}.pid"))
}

fn ctrlsocket_path(rundir: &Path, progname: &str, upsname: &str) -> PathBuf {
    rundir.join(format!("{progname}-{upsname}"))
}

/// Advisory, process-exclusive pidfile: opened, `flock`ed, and written
/// with the current PID, mirroring the single-instance-per-path
/// discipline every long-running NUT daemon relies on (grounded in
/// `other_examples/.../stratisd.rs`'s `trylock_pid_file`).
struct PidFile {
    path: PathBuf,
    file: std::fs::File,
}

impl PidFile {
    fn acquire(path: &Path) -> Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| NutError::fatal(format!("opening pidfile {}: {e}", path.display())))?;

        nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusiveNonblock)
            .map_err(|_| NutError::fatal(format!("pidfile {} is held by another instance", path.display())))?;

        let mut file = file;
        file.set_len(0)
            .map_err(|e| NutError::fatal(format!("truncating pidfile: {e}")))?;
        writeln!(file, "{}", std::process::id())
            .map_err(|e| NutError::fatal(format!("writing pidfile: {e}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = &self.file;
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Advisory lock on the device path itself, skipped entirely when the
/// `nolock` option is given (spec.md §4.7 boot step 5). Distinct from
/// `PidFile`: this guards the physical device node, not the driver
/// process's own identity.
struct DeviceLock {
    _file: Option<std::fs::File>,
}

impl DeviceLock {
    fn acquire(device_path: Option<&str>, nolock: bool) -> Result<Self> {
        if nolock {
            return Ok(Self { _file: None });
        }
        let Some(path) = device_path else {
            return Ok(Self { _file: None });
        };
        use std::os::unix::io::AsRawFd;
        let file = match std::fs::OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            // A plug-in may still be about to create/own the node itself
            // (e.g. a TCP/Modbus "device" with no filesystem presence);
            // absence here is not fatal, only a best-effort lock.
            Err(_) => return Ok(Self { _file: None }),
        };
        if nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusiveNonblock).is_err() {
            return Err(NutError::fatal(format!("device {path} is locked by another driver instance")));
        }
        Ok(Self { _file: Some(file) })
    }
}

/// Drop privileges to `user`/`group` and optionally `chroot`, in that
/// order reversed: chroot must happen before the uid switch so the
/// process still has the privilege needed to perform it (spec.md §4.7
/// boot step 8; §5 "Privilege drop happens after the device handle is
/// opened").
fn drop_privileges(user: Option<&str>, group: Option<&str>, chroot_dir: Option<&str>) -> Result<()> {
    if let Some(dir) = chroot_dir {
        nix::unistd::chdir(dir).map_err(|e| NutError::fatal(format!("chdir into {dir}: {e}")))?;
        nix::unistd::chroot(dir).map_err(|e| NutError::fatal(format!("chroot into {dir}: {e}")))?;
    }

    if let Some(group) = group {
        let group = nix::unistd::Group::from_name(group)
            .map_err(|e| NutError::fatal(format!("looking up group {group}: {e}")))?
            .ok_or_else(|| NutError::fatal(format!("no such group: {group}")))?;
        nix::unistd::setgid(group.gid).map_err(|e| NutError::fatal(format!("setgid: {e}")))?;
    }

    if let Some(user) = user {
        let user = nix::unistd::User::from_name(user)
            .map_err(|e| NutError::fatal(format!("looking up user {user}: {e}")))?
            .ok_or_else(|| NutError::fatal(format!("no such user: {user}")))?;
        nix::unistd::setuid(user.uid).map_err(|e| NutError::fatal(format!("setuid: {e}")))?;
    }

    Ok(())
}

/// Owns everything the poll loop touches: the plug-in's mutable tables
/// (via `DriverContext`), the control socket, the signal set, and the
/// bookkeeping the spec calls out as Lifecycle-owned (pidfile, device
/// lock, per-peer TRACKING ids).
pub struct Lifecycle {
    state: LifecycleState,
    progname: String,
    upsname: String,
    conf_path: PathBuf,
    section: String,
    pollinterval: u64,
    kill_power: bool,
    foreground: bool,
    sdcommands_override: Option<String>,
    consecutive_stale: u32,
    _pidfile: Option<PidFile>,
    _device_lock: Option<DeviceLock>,
    ctrlsocket: Option<CtrlSocket>,
    tracking_ids: HashMap<PeerId, String>,
    /// Set by a core-owned `driver.exit`/`driver.killpower` INSTCMD
    /// (SPEC_FULL.md §10's socket-carried analogues of SIGTERM and `-k`);
    /// the poll loop checks this after every control-socket dispatch and
    /// winds down through the same `enter_shutdown` path a real signal
    /// would take.
    exit_requested: bool,
    requested_exit_code: Option<i32>,
}

impl Lifecycle {
    /// Boot sequence steps 1-9 (spec.md §4.7): parse config, load the
    /// `ups.conf` section, acquire locks, call `makevartable`/`initups`
    /// with retry, drop privileges, then `initinfo`. Returns a `Lifecycle`
    /// positioned to either run `-k` shutdown or enter the poll loop.
    pub async fn boot<D: DriverCallbacks + ?Sized>(
        cli: &Cli,
        driver: &mut D,
        ctx: &mut DriverContext,
    ) -> Result<Self> {
        let info = driver.info();
        if info.stability == DriverStability::Broken {
            tracing::warn!(driver = info.name, "running a driver marked DRV_BROKEN");
        }

        let progname = info.name.to_string();
        let upsname = cli
            .upsname
            .clone()
            .ok_or_else(|| NutError::config("missing -a <upsname>"))?;
        let section = cli.effective_section().unwrap_or(&upsname).to_string();

        register_core_options(&mut ctx.params);
        driver.makevartable(&mut ctx.params);

        let conf_path = PathBuf::from(
            std::env::var("NUT_CONFPATH").unwrap_or_else(|_| "/etc/nut/ups.conf".to_string()),
        );
        let conf_section = load_conf_or_default(&conf_path, &section)?;
        apply_section(&mut ctx.params, &conf_section, false)?;
        apply_cli_vars(&mut ctx.params, cli, false)?;

        if let Some(port) = conf_section.get("port") {
            ctx.params.apply("port", Some(port), false).ok();
        }

        let pollinterval: u64 = ctx
            .params
            .getval("pollinterval")
            .map(str::parse)
            .transpose()
            .map_err(|_| NutError::config("pollinterval must be an integer"))?
            .unwrap_or(2)
            .max(1);
        let maxstartdelay: u64 = ctx
            .params
            .getval("maxstartdelay")
            .map(str::parse)
            .transpose()
            .map_err(|_| NutError::config("maxstartdelay must be an integer"))?
            .unwrap_or(45);
        let retry: u32 = ctx
            .params
            .getval("retry")
            .map(str::parse)
            .transpose()
            .map_err(|_| NutError::config("retry must be an integer"))?
            .unwrap_or(1)
            .max(1);
        let nolock = cli.vars.iter().any(|v| v == "nolock") || ctx.params.testvar("nolock");

        ctx.dstate.setinfo("driver.name", &progname);
        ctx.dstate.setinfo("driver.version", info.version);
        ctx.dstate.setinfo("driver.state", "init");

        let device_path = cli.device_path.clone().or_else(|| ctx.params.getval("port").map(str::to_string));
        let device_lock = DeviceLock::acquire(device_path.as_deref(), nolock)?;

        let socket_path = ctrlsocket_path(&rundir(), &progname, &upsname);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let mut ctrlsocket = CtrlSocket::bind(&socket_path)?;
        if let Some(sync) = ctx.params.getval("synchronous").and_then(SyncMode::parse) {
            ctrlsocket.set_synchronous(sync);
        }

        let mut last_err = None;
        let mut succeeded = false;
        for attempt in 1..=retry {
            let start = tokio::time::Instant::now();
            match tokio::time::timeout(Duration::from_secs(maxstartdelay), driver.initups(ctx)).await {
                Ok(Ok(())) => {
                    succeeded = true;
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(attempt, error = %e, "initups failed");
                    last_err = Some(e);
                }
                Err(_) => {
                    last_err = Some(NutError::fatal("initups exceeded maxstartdelay"));
                }
            }
            let elapsed = start.elapsed();
            if elapsed < Duration::from_secs(1) {
                tokio::time::sleep(Duration::from_secs(1) - elapsed).await;
            }
        }
        if !succeeded {
            return Err(last_err.unwrap_or_else(|| NutError::fatal("initups failed")));
        }

        drop_privileges(
            cli.user.as_deref().or_else(|| ctx.params.getval("user")),
            cli.group.as_deref().or_else(|| ctx.params.getval("group")),
            cli.chroot.as_deref().or_else(|| ctx.params.getval("chroot")),
        )?;

        driver.initinfo(ctx).await?;
        ctx.dstate.dataok();
        ctx.dstate.setinfo("driver.state", "quiet");

        let pidfile = PidFile::acquire(&pidfile_path(&rundir(), &progname, &upsname))?;

        Ok(Self {
            state: LifecycleState::Running,
            progname,
            upsname,
            conf_path,
            section,
            pollinterval,
            kill_power: cli.kill_power,
            foreground: cli.foreground(),
            sdcommands_override: ctx.params.getval("sdcommands").map(str::to_string),
            consecutive_stale: 0,
            _pidfile: Some(pidfile),
            _device_lock: Some(device_lock),
            ctrlsocket: Some(ctrlsocket),
            tracking_ids: HashMap::new(),
            exit_requested: false,
            requested_exit_code: None,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Steps 10-12: optionally run `-k` shutdown-and-exit, otherwise fork
    /// to background (unless foreground was requested) and enter the poll
    /// loop until an exit signal or a fatal error ends it.
    pub async fn run<D: DriverCallbacks + ?Sized>(mut self, driver: &mut D, ctx: &mut DriverContext) -> i32 {
        if self.kill_power {
            return self.run_kill_power(driver, ctx).await;
        }

        if !self.foreground {
            tracing::info!("daemonizing");
            // `daemonize` forks and detaches stdio; the pidfile is already
            // held by the parent's fd table entry, which survives fork.
            if let Err(e) = daemonize::Daemonize::new().start() {
                tracing::warn!(error = %e, "failed to daemonize, continuing in foreground");
            }
        }

        match self.poll_loop(driver, ctx).await {
            Ok(()) => self.requested_exit_code.take().unwrap_or(exit_code::SUCCESS),
            Err(e) => {
                tracing::error!(error = %e, "poll loop exited with error");
                driver.cleanup(ctx).await;
                e.exit_code().unwrap_or(exit_code::INIT_FAILURE)
            }
        }
    }

    async fn run_kill_power<D: DriverCallbacks + ?Sized>(mut self, driver: &mut D, ctx: &mut DriverContext) -> i32 {
        self.state = LifecycleState::Shutdown;
        let outcome = protocol::shutdown_default(ctx, driver, self.sdcommands_override.as_deref()).await;
        let code = match outcome {
            crate::shutdown::SdCmdOutcome::Handled(cmd) => {
                tracing::info!(command = %cmd, "shutdown command succeeded");
                exit_code::SUCCESS
            }
            crate::shutdown::SdCmdOutcome::Invalid => {
                if let Err(e) = driver.shutdown(ctx).await {
                    tracing::error!(error = %e, "shutdown() failed");
                }
                exit_code::SHUTDOWN_FAILED
            }
        };
        self.state = LifecycleState::Cleanup;
        driver.cleanup(ctx).await;
        self.state = LifecycleState::Exited;
        code
    }

    /// The poll loop (spec.md §4.7): wakes on whichever of the timer,
    /// control-socket readability, or a signal fires first (§5's single
    /// suspension point), services the control socket, handles any
    /// pending reload/exit/dump, then calls `updateinfo` and streams the
    /// resulting dirty delta.
    async fn poll_loop<D: DriverCallbacks + ?Sized>(&mut self, driver: &mut D, ctx: &mut DriverContext) -> Result<()> {
        let mut ticker = interval(Duration::from_secs(self.pollinterval));
        let mut signals = SignalSet::install()?;
        let mut reload_pending = false;

        loop {
            let mut ctrlsocket = self
                .ctrlsocket
                .take()
                .ok_or_else(|| NutError::fatal("control socket missing"))?;

            tokio::select! {
                _ = ticker.tick() => {
                    self.ctrlsocket = Some(ctrlsocket);
                    if reload_pending {
                        reload_pending = false;
                        self.reload(ctx)?;
                    }
                    self.run_update(driver, ctx).await?;
                }
                event = ctrlsocket.next_event() => {
                    self.handle_peer_event(&mut ctrlsocket, event, driver, ctx).await?;
                    self.ctrlsocket = Some(ctrlsocket);
                    if self.exit_requested {
                        return self.enter_shutdown(driver, ctx).await;
                    }
                }
                sig = signals.recv() => {
                    self.ctrlsocket = Some(ctrlsocket);
                    match sig {
                        SigCmd::Reload => reload_pending = true,
                        SigCmd::ReloadOrExit => {
                            if self.reload(ctx).is_err() {
                                return self.enter_shutdown(driver, ctx).await;
                            }
                        }
                        SigCmd::Exit => return self.enter_shutdown(driver, ctx).await,
                        SigCmd::DataDump => self.dump_to_stdout(ctx),
                    }
                }
            }
        }
    }

    async fn run_update<D: DriverCallbacks + ?Sized>(&mut self, driver: &mut D, ctx: &mut DriverContext) -> Result<()> {
        match driver.updateinfo(ctx).await {
            Ok(()) => {
                if self.state == LifecycleState::Reconnecting {
                    ctx.dstate.setinfo("driver.state", "quiet");
                    self.state = LifecycleState::Running;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "updateinfo failed");
            }
        }

        if ctx.dstate.freshness() == crate::dstate::Freshness::Stale {
            self.consecutive_stale += 1;
            if self.consecutive_stale >= RECONNECT_THRESHOLD && self.state != LifecycleState::Reconnecting {
                self.state = LifecycleState::Reconnecting;
                ctx.dstate.setinfo("driver.state", "reconnect.trying");
                tracing::warn!("data stale {} times in a row, reconnecting", self.consecutive_stale);
            }
        } else {
            self.consecutive_stale = 0;
        }

        self.drain_to_all_peers(ctx).await
    }

    async fn handle_peer_event<D: DriverCallbacks + ?Sized>(
        &mut self,
        ctrlsocket: &mut CtrlSocket,
        event: Option<PeerEvent>,
        driver: &mut D,
        ctx: &mut DriverContext,
    ) -> Result<()> {
        match event {
            Some(PeerEvent::Connected { id, outbound_tx }) => {
                ctrlsocket.register(id, outbound_tx);
                let lines: Vec<String> = ctx.dstate.dump_all().iter().map(|l| l.to_wire()).collect();
                ctrlsocket.send_all(id, &lines).await?;
            }
            Some(PeerEvent::Closed { id }) => {
                ctrlsocket.forget(id);
                self.tracking_ids.remove(&id);
            }
            Some(PeerEvent::Line { id, line }) => {
                self.handle_line(ctrlsocket, id, &line, driver, ctx).await?;
            }
            None => return Err(NutError::fatal("control socket accept loop died")),
        }
        Ok(())
    }

    async fn handle_line<D: DriverCallbacks + ?Sized>(
        &mut self,
        ctrlsocket: &mut CtrlSocket,
        id: PeerId,
        line: &str,
        driver: &mut D,
        ctx: &mut DriverContext,
    ) -> Result<()> {
        let tokens = match crate::ctrlsocket::tokenize(line) {
            Ok(tokens) => tokens,
            Err(_) => {
                ctrlsocket.send_line(id, "ERR INVALID-ARGUMENT").await?;
                return Ok(());
            }
        };

        let verb = match protocol::parse_verb(&tokens) {
            Ok(verb) => verb,
            Err(code) => {
                ctrlsocket
                    .send_line(id, &protocol::render_reply(Err(code), None))
                    .await?;
                return Ok(());
            }
        };

        match verb {
            Verb::Ping => {
                ctrlsocket.send_line(id, "PONG").await?;
            }
            Verb::DumpAll => {
                let lines: Vec<String> = ctx.dstate.dump_all().iter().map(|l| l.to_wire()).collect();
                ctrlsocket.send_all(id, &lines).await?;
            }
            Verb::Tracking { id: tracking_id } => {
                self.tracking_ids.insert(id, tracking_id);
            }
            Verb::Set { name, value } => {
                let result = protocol::handle_set(ctx, driver, &name, &value).await;
                let tracking = self.tracking_ids.remove(&id);
                ctrlsocket
                    .send_line(id, &protocol::render_reply(result, tracking.as_deref()))
                    .await?;
                broadcast_pending(ctrlsocket, ctx).await?;
            }
            Verb::InstCmd { name, arg } => {
                let result = if let Some(result) = self.handle_core_instcmd(&name, driver, ctx).await {
                    result
                } else {
                    protocol::handle_instcmd(ctx, driver, &name, arg.as_deref()).await
                };
                let tracking = self.tracking_ids.remove(&id);
                ctrlsocket
                    .send_line(id, &protocol::render_reply(result, tracking.as_deref()))
                    .await?;
                broadcast_pending(ctrlsocket, ctx).await?;
            }
        }
        Ok(())
    }

    /// Streams the dirty delta produced by the just-completed
    /// `updateinfo` call to every connected peer (spec.md §4.2, Testable
    /// Property 2 "dirty-drain completeness").
    async fn drain_to_all_peers(&mut self, ctx: &mut DriverContext) -> Result<()> {
        let Some(ctrlsocket) = self.ctrlsocket.as_mut() else {
            return Ok(());
        };
        broadcast_pending(ctrlsocket, ctx).await
    }

    /// Gives real effect to the socket-carried analogues of a signal
    /// (SPEC_FULL.md §10 / `original_source/drivers/main.h`'s
    /// `SIGCMD_*` string constants): `driver.reload` and
    /// `driver.reload-or-error` behave like SIGHUP, `driver.exit` like
    /// SIGTERM, and `driver.killpower` like `-k`. These need `&mut self`
    /// (to reload config or wind down the poll loop), so they're handled
    /// here rather than in the stateless `protocol::handle_instcmd` path.
    /// Returns `None` for any other name, leaving it to the generic
    /// dispatch.
    async fn handle_core_instcmd<D: DriverCallbacks + ?Sized>(
        &mut self,
        name: &str,
        driver: &mut D,
        ctx: &mut DriverContext,
    ) -> Option<std::result::Result<(), crate::error::ReplyCode>> {
        use crate::error::ReplyCode;

        match name {
            "driver.reload" => {
                // Fire-and-forget, like SIGHUP: a rejected reloadable value
                // is only ever a warning, never a socket-visible failure.
                if let Err(e) = self.reload(ctx) {
                    tracing::warn!(error = %e, "driver.reload failed");
                }
                Some(Ok(()))
            }
            "driver.reload-or-error" => {
                // Same reload, but failure is surfaced to the caller
                // instead of only logged — the socket-carried variant can
                // report a result a bare signal cannot.
                match self.reload(ctx) {
                    Ok(()) => Some(Ok(())),
                    Err(e) => {
                        tracing::warn!(error = %e, "driver.reload-or-error failed");
                        Some(Err(ReplyCode::CmdFailed))
                    }
                }
            }
            "driver.exit" => {
                self.exit_requested = true;
                self.requested_exit_code = Some(exit_code::SUCCESS);
                Some(Ok(()))
            }
            "driver.killpower" => {
                let outcome = protocol::shutdown_default(ctx, driver, self.sdcommands_override.as_deref()).await;
                self.exit_requested = true;
                match outcome {
                    crate::shutdown::SdCmdOutcome::Handled(cmd) => {
                        tracing::info!(command = %cmd, "driver.killpower succeeded");
                        self.requested_exit_code = Some(exit_code::SUCCESS);
                        Some(Ok(()))
                    }
                    crate::shutdown::SdCmdOutcome::Invalid => {
                        self.requested_exit_code = Some(exit_code::SHUTDOWN_FAILED);
                        Some(Err(ReplyCode::CmdFailed))
                    }
                }
            }
            _ => None,
        }
    }

    /// Re-reads `ups.conf` and re-applies every entry through
    /// `ParamTable::apply(.., is_reload = true)`, honoring the
    /// reloadability rule (spec.md S6).
    fn reload(&mut self, ctx: &mut DriverContext) -> Result<()> {
        self.state = LifecycleState::Reloading;
        ctx.params.begin_load();
        let section = load_conf_or_default(&self.conf_path, &self.section)?;
        apply_section(&mut ctx.params, &section, true)?;
        self.sdcommands_override = ctx.params.getval("sdcommands").map(str::to_string);
        if let Some(p) = ctx.params.getval("pollinterval").and_then(|v| v.parse().ok()) {
            self.pollinterval = p;
        }
        self.state = LifecycleState::Running;
        Ok(())
    }

    /// SIGURG/SIGWINCH `DATA-DUMP`: print the complete DState to stdout
    /// for debugging (spec.md §5 signal table), distinct from the
    /// control-socket `DUMPALL` verb which targets a connected peer.
    fn dump_to_stdout(&self, ctx: &DriverContext) {
        for line in ctx.dstate.dump_all() {
            println!("{}", line.to_wire());
        }
    }

    async fn enter_shutdown<D: DriverCallbacks + ?Sized>(&mut self, driver: &mut D, ctx: &mut DriverContext) -> Result<()> {
        self.state = LifecycleState::Shutdown;
        tracing::info!(
            progname = %self.progname,
            upsname = %self.upsname,
            "exit requested, running to completion then cleaning up"
        );
        self.state = LifecycleState::Cleanup;
        driver.cleanup(ctx).await;
        self.state = LifecycleState::Exited;
        Ok(())
    }
}

/// Drains whatever wire lines a mutation produced and broadcasts them to
/// every connected peer, not just the one that triggered the mutation
/// (spec.md Testable Property 2 "dirty-drain completeness"): `DState`
/// keeps a single shared pending queue, so draining it on behalf of one
/// peer would silently starve every other peer of that delta.
async fn broadcast_pending(ctrlsocket: &mut CtrlSocket, ctx: &mut DriverContext) -> Result<()> {
    if !ctx.dstate.has_pending() {
        return Ok(());
    }
    let lines: Vec<String> = ctx.dstate.drain().iter().map(|l| l.to_wire()).collect();
    ctrlsocket.broadcast(&lines).await
}

fn load_conf_or_default(path: &Path, section: &str) -> Result<ConfSection> {
    match load_conf(path, section) {
        Ok(section) => Ok(section),
        Err(_) if !path.exists() => Ok(ConfSection {
            name: section.to_string(),
            entries: Vec::new(),
        }),
        Err(e) => Err(e),
    }
}

fn apply_section(params: &mut ParamTable, section: &ConfSection, is_reload: bool) -> Result<()> {
    for (key, value) in &section.entries {
        if key == "driver" || key == "desc" {
            continue;
        }
        if params.names().any(|n| n == key) {
            params.apply(key, value.as_deref(), is_reload)?;
        } else if !is_reload {
            // A real plug-in registers everything it cares about via
            // `makevartable` before this point, so reaching here means the
            // config carries a key nothing ever declared.
            return Err(NutError::config(format!("unknown option: {key}")));
        }
    }
    Ok(())
}

fn apply_cli_vars(params: &mut ParamTable, cli: &Cli, is_reload: bool) -> Result<()> {
    for (name, value) in cli.parsed_vars() {
        if params.names().any(|n| n == name) {
            params.apply(&name, value.as_deref(), is_reload)?;
        } else {
            return Err(NutError::config(format!("unknown -x option: {name}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::paramtable::ParamKind as PK;

    #[test]
    fn apply_section_skips_reserved_keys() {
        let mut params = ParamTable::new();
        params.addvar(PK::Value, "pollinterval", "");
        let section = ConfSection {
            name: "ups1".to_string(),
            entries: vec![
                ("driver".to_string(), Some("skel".to_string())),
                ("desc".to_string(), Some("Test UPS".to_string())),
                ("pollinterval".to_string(), Some("5".to_string())),
            ],
        };
        apply_section(&mut params, &section, false).unwrap();
        assert_eq!(params.getval("pollinterval"), Some("5"));
    }

    #[test]
    fn apply_section_rejects_unknown_key_on_initial_load() {
        let mut params = ParamTable::new();
        let section = ConfSection {
            name: "ups1".to_string(),
            entries: vec![("bogus".to_string(), Some("1".to_string()))],
        };
        assert!(apply_section(&mut params, &section, false).is_err());
    }

    #[test]
    fn pidfile_and_ctrlsocket_paths_match_spec_naming() {
        let rundir = PathBuf::from("/tmp/nutdrv-test-rundir");
        assert_eq!(
            pidfile_path(&rundir, "nutdrv-skeleton", "ups1"),
            PathBuf::from("/tmp/nutdrv-test-rundir/nutdrv-skeleton-ups1.pid")
        );
        assert_eq!(
            ctrlsocket_path(&rundir, "nutdrv-skeleton", "ups1"),
            PathBuf::from("/tmp/nutdrv-test-rundir/nutdrv-skeleton-ups1")
        );
    }

    use crate::driver::{DriverInfo, InstcmdResult, SetvarResult};
    use async_trait::async_trait;

    struct NoopDriver {
        instcmd_script: Vec<(&'static str, InstcmdResult)>,
    }

    #[async_trait]
    impl DriverCallbacks for NoopDriver {
        fn info(&self) -> DriverInfo {
            DriverInfo {
                name: "noop",
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
            self.instcmd_script
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, r)| *r)
                .unwrap_or(InstcmdResult::Unknown)
        }

        async fn setvar(&mut self, _ctx: &mut DriverContext, _name: &str, _value: &str) -> SetvarResult {
            SetvarResult::Unknown
        }
    }

    fn make_lifecycle() -> Lifecycle {
        Lifecycle {
            state: LifecycleState::Running,
            progname: "nutdrv-skeleton".to_string(),
            upsname: "ups1".to_string(),
            conf_path: PathBuf::from("/nonexistent/ups.conf"),
            section: "ups1".to_string(),
            pollinterval: 2,
            kill_power: false,
            foreground: true,
            sdcommands_override: None,
            consecutive_stale: 0,
            _pidfile: None,
            _device_lock: None,
            ctrlsocket: None,
            tracking_ids: HashMap::new(),
            exit_requested: false,
            requested_exit_code: None,
        }
    }

    #[tokio::test]
    async fn driver_reload_instcmd_actually_reloads_config() {
        let mut lifecycle = make_lifecycle();
        let mut ctx = DriverContext::new(ParamTable::new());
        ctx.params.addvar_reloadable(PK::Value, "pollinterval", "");
        ctx.params.apply("pollinterval", Some("2"), false).unwrap();
        let mut driver = NoopDriver { instcmd_script: vec![] };

        let result = lifecycle
            .handle_core_instcmd("driver.reload", &mut driver, &mut ctx)
            .await;
        assert_eq!(result, Some(Ok(())));
        assert!(!lifecycle.exit_requested);
        assert_eq!(lifecycle.state, LifecycleState::Running);
    }

    #[tokio::test]
    async fn driver_exit_instcmd_requests_process_exit() {
        let mut lifecycle = make_lifecycle();
        let mut ctx = DriverContext::new(ParamTable::new());
        let mut driver = NoopDriver { instcmd_script: vec![] };

        let result = lifecycle
            .handle_core_instcmd("driver.exit", &mut driver, &mut ctx)
            .await;
        assert_eq!(result, Some(Ok(())));
        assert!(lifecycle.exit_requested);
        assert_eq!(lifecycle.requested_exit_code, Some(exit_code::SUCCESS));
    }

    #[tokio::test]
    async fn driver_killpower_instcmd_walks_shutdown_commands_and_requests_exit() {
        let mut lifecycle = make_lifecycle();
        let mut ctx = DriverContext::new(ParamTable::new());
        ctx.dstate.addcmd("shutdown.return");
        ctx.dstate.drain();
        let mut driver = NoopDriver {
            instcmd_script: vec![("shutdown.return", InstcmdResult::Handled)],
        };

        let result = lifecycle
            .handle_core_instcmd("driver.killpower", &mut driver, &mut ctx)
            .await;
        assert_eq!(result, Some(Ok(())));
        assert!(lifecycle.exit_requested);
        assert_eq!(lifecycle.requested_exit_code, Some(exit_code::SUCCESS));
    }

    #[tokio::test]
    async fn driver_killpower_instcmd_reports_failure_when_no_command_succeeds() {
        let mut lifecycle = make_lifecycle();
        let mut ctx = DriverContext::new(ParamTable::new());
        let mut driver = NoopDriver { instcmd_script: vec![] };

        let result = lifecycle
            .handle_core_instcmd("driver.killpower", &mut driver, &mut ctx)
            .await;
        assert_eq!(result, Some(Err(crate::error::ReplyCode::CmdFailed)));
        assert!(lifecycle.exit_requested);
        assert_eq!(lifecycle.requested_exit_code, Some(exit_code::SHUTDOWN_FAILED));
    }

    #[tokio::test]
    async fn unrecognized_name_falls_through_to_generic_dispatch() {
        let mut lifecycle = make_lifecycle();
        let mut ctx = DriverContext::new(ParamTable::new());
        let mut driver = NoopDriver { instcmd_script: vec![] };

        let result = lifecycle
            .handle_core_instcmd("shutdown.return", &mut driver, &mut ctx)
            .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn s5_three_consecutive_stale_updates_trip_reconnecting() {
        let mut lifecycle = make_lifecycle();
        let mut ctx = DriverContext::new(ParamTable::new());
        let mut driver = NoopDriver { instcmd_script: vec![] };

        // `updateinfo` itself succeeds every time; staleness is a separate
        // signal it leaves behind in `DState`, same as the skeleton
        // driver's disconnected path.
        for n in 1..RECONNECT_THRESHOLD {
            ctx.dstate.datastale();
            lifecycle.run_update(&mut driver, &mut ctx).await.unwrap();
            assert_eq!(
                lifecycle.state,
                LifecycleState::Running,
                "must stay Running before the {n}th consecutive stale reading resolves"
            );
        }

        ctx.dstate.datastale();
        lifecycle.run_update(&mut driver, &mut ctx).await.unwrap();
        assert_eq!(lifecycle.state, LifecycleState::Reconnecting);
        assert_eq!(lifecycle.consecutive_stale, RECONNECT_THRESHOLD);
    }
}
