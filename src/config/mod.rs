//! Application configuration
//!
//! Persisted as one JSON row in SQLite; command line flags override it for
//! the current run only.

mod schema;
mod store;

pub use schema::*;
pub use store::ConfigStore;
