//! libc forwarding module
//!
//! Exposes the host C standard library to compiled ASTC programs under
//! stable names and `LIBC_CALL` ids:
//! - **ids**: the append-only id table (the wire contract)
//! - **wrappers**: null-checked, counted forwarding functions
//! - **table**: name/id lookup, the `LibcResolver` implementation, and the
//!   `get_stats` export
//! - **stats**: per-category call counters and allocation accounting

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod ids;
pub mod stats;
pub mod table;
pub mod wrappers;

pub use ids::Category;
pub use stats::{LibcStats, StatsSnapshot};
pub use table::{astc_libc_get_stats, default_table, LibcEntry, LibcTable, RawStats};
