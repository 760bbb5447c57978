//! # nutdrv-core — shared UPS/PDU driver runtime
//!
//! The language-neutral contract every Network UPS Tools driver binary
//! exposes to `upsd` and to the process supervisor: the lifecycle state
//! machine, the dstate fabric, the control-socket protocol, the
//! shutdown-command dispatcher, the configuration loader, and the
//! status/alarm aggregation primitives. See `SPEC_FULL.md` for the full
//! contract this crate implements.
//!
//! Per-device protocol drivers (Modbus, serial Q1, USB HID, ...) depend
//! on this crate and implement [`driver::DriverCallbacks`]; none of those
//! transports live here.
//!
//! ## Modules
//!
//! - `cli`: the `-a`/`-s`/`-D`/`-x`/... argv surface (spec.md §6.3).
//! - `config`: `ParamTable`, `ups.conf` loading, reload discipline.
//! - `dstate`: the versioned variable store and instant-command registry.
//! - `status`: the three-phase `ups.status`/`ups.alarm` commit barrier.
//! - `ctrlsocket`: the Unix control-socket listener and line tokenizer.
//! - `protocol`: inbound verb parsing/dispatch over the control socket.
//! - `shutdown`: the ordered-fallback shutdown-command dispatcher.
//! - `driver`: the five-function plug-in contract (`DriverCallbacks`).
//! - `lifecycle`: the boot sequence and poll loop tying it all together.
//! - `signal`: POSIX signal handling for reload/exit/data-dump.
//! - `logging`: structured tracing setup.
//! - `error`: the crate's error taxonomy.

pub mod cli;
pub mod config;
pub mod ctrlsocket;
pub mod driver;
pub mod dstate;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod protocol;
pub mod shutdown;
pub mod signal;
pub mod status;

pub use driver::{DriverCallbacks, DriverContext, DriverInfo, DriverStability};
pub use error::{NutError, Result};
pub use lifecycle::Lifecycle;
