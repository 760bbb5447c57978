//! Argv surface every driver binary exposes (spec.md §6.3).

use clap::Parser;

/// `driver [-a upsname] [-s section] [-D…] [-d duration] [-q] [-k] [-V] [-h]
/// [-x name[=value]…] [-u user] [-g group] [-r chroot] [device_path]`
///
/// `-V` and `-h` are handled manually in `main.rs` rather than via clap's
/// built-in flags: both need to append driver-supplied text
/// (`DriverCallbacks::banner`/`help`) that clap's derive has no way to
/// reach, so the auto-generated version/help flags are disabled here and
/// re-declared as plain booleans.
#[derive(Debug, Parser)]
#[command(author, about, disable_version_flag = true, disable_help_flag = true)]
pub struct Cli {
    /// UPS instance name; also used to derive pidfile/ctrlsocket paths.
    #[arg(short = 'a', long = "ups-name")]
    pub upsname: Option<String>,

    /// `ups.conf` section name, defaults to `upsname` when omitted.
    #[arg(short = 's', long = "section")]
    pub section: Option<String>,

    /// Raise verbosity; repeatable (`-D -D -D`).
    #[arg(short = 'D', action = clap::ArgAction::Count)]
    pub debug: u8,

    /// Run `-k` shutdown then exit after at most this many seconds.
    #[arg(short = 'd', long = "duration")]
    pub duration: Option<u64>,

    /// Quiet mode: suppress non-essential startup chatter.
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Kill-power mode: drive the shutdown sequence then exit.
    #[arg(short = 'k', long = "kill-power")]
    pub kill_power: bool,

    /// Print driver name/version (plus `DriverCallbacks::banner`) and exit.
    #[arg(short = 'V', long = "version", action = clap::ArgAction::SetTrue)]
    pub version: bool,

    /// Print usage (plus `DriverCallbacks::help`) and exit.
    #[arg(short = 'h', long = "help", action = clap::ArgAction::SetTrue)]
    pub help: bool,

    /// `-x name[=value]`, repeatable.
    #[arg(short = 'x', long = "var", value_name = "name[=value]")]
    pub vars: Vec<String>,

    /// Privilege-drop target user.
    #[arg(short = 'u', long = "user")]
    pub user: Option<String>,

    /// Privilege-drop target group.
    #[arg(short = 'g', long = "group")]
    pub group: Option<String>,

    /// Directory to chroot into before the poll loop.
    #[arg(short = 'r', long = "chroot")]
    pub chroot: Option<String>,

    /// Positional device path, consumed by the plug-in via `port`.
    pub device_path: Option<String>,
}

impl Cli {
    /// Split every `-x name[=value]` into `(name, value)` pairs, ready to
    /// feed into `ParamTable::apply`.
    pub fn parsed_vars(&self) -> Vec<(String, Option<String>)> {
        self.vars
            .iter()
            .map(|raw| match raw.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (raw.clone(), None),
            })
            .collect()
    }

    /// The effective `ups.conf` section name: `-s` if given, else `-a`.
    pub fn effective_section(&self) -> Option<&str> {
        self.section.as_deref().or(self.upsname.as_deref())
    }

    /// Whether the process should stay in the foreground rather than fork
    /// to background (spec.md §4.7 boot step 11).
    pub fn foreground(&self) -> bool {
        self.debug > 0 || self.quiet
    }
}
