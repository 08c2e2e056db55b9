//! SQLite-backed inventory store: hosts, ports, service slots and the scan event log.

mod open;
mod models;
mod insert;
mod query;
mod schema;

pub use open::{Db, DEFAULT_WRITE_WAIT};
pub use models::*;
pub use insert::*;
pub use query::*;
