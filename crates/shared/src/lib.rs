//! Shared infrastructure for the Parley billing services
//!
//! Database pool construction and embedded migrations, used by the API
//! server and the background worker.

mod db;

pub use db::{create_pool, run_migrations};
