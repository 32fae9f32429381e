//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Keyed state storage used to carry consumer state across restarts.
#![warn(missing_docs)]

use std::fmt::Debug;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing state files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reported when a stored envelope fails integrity verification.
    #[error("state hash mismatch for key `{0}`")]
    HashMismatch(String),
    /// Reported when a key cannot be mapped onto the backing store.
    #[error("invalid state key `{0}`")]
    InvalidKey(String),
}

/// Keyed store for opaque JSON state.
///
/// Implementations must be safe to call from the scheduler cycle while other
/// tasks hold references to the store.
pub trait StateStore: Send + Sync + Debug {
    /// Persist `state` under `key`, replacing any previous value.
    fn save_state(&self, key: &str, state: &serde_json::Value) -> Result<()>;
    /// Fetch the value stored under `key`, or `None` when nothing was saved yet.
    fn load_state(&self, key: &str) -> Result<Option<serde_json::Value>>;
}

pub mod file;
pub mod memory;

pub use file::{JsonFileStateStore, STATE_VERSION};
pub use memory::MemoryStateStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_key() {
        let err = PersistenceError::HashMismatch("consumer.boiler".into());
        assert_eq!(format!("{err}"), "state hash mismatch for key `consumer.boiler`");
    }
}
