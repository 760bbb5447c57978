//! Parameter table: typed `addvar`-based registration, reload-vs-initial
//! discipline, and `ups.conf` loading (spec.md §4.1, §6.4).

pub(crate) mod paramtable;
pub mod reload;
mod upsconf;

pub use paramtable::{ParamKind, ParamTable, ReloadOutcome, register_core_options};
pub use reload::{testinfo_reloadable, testval_reloadable, testvar_reloadable};
pub use upsconf::{ConfSection, load_conf, parse_conf};
