//! Durable persistence for alert instance state.

pub mod error;
pub mod sqlite;
pub mod traits;

pub use error::PersistenceError;
pub use sqlite::SqliteInstanceStore;
pub use traits::{InstanceQuery, InstanceStore};
