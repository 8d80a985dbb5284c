//! Sentinel State Module
//!
//! SQLite-backed persistent state: the notification log, cycle records,
//! per-attempt audit rows, schedule entries, and metric state.

mod database;
mod schema;

pub use database::Database;
pub use schema::{CREATE_TABLES, SCHEMA_VERSION};
