//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{PersistenceError, Result, StateStore};

/// Current state envelope version.
pub const STATE_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateEnvelope {
    version: u16,
    saved_at: DateTime<Utc>,
    key: String,
    hash: String,
    blob: serde_json::Value,
}

/// Stores one JSON envelope per key inside a directory.
///
/// Every envelope carries a SHA-256 digest of its payload; a mismatch on load
/// surfaces as [`PersistenceError::HashMismatch`].
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    directory: PathBuf,
}

impl JsonFileStateStore {
    /// Open (and create if needed) a store rooted at `directory`.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    /// Directory backing this store.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.directory.join(format!("{key}.json")))
    }
}

impl StateStore for JsonFileStateStore {
    fn save_state(&self, key: &str, state: &serde_json::Value) -> Result<()> {
        let path = self.path_for(key)?;
        let envelope = StateEnvelope {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            key: key.to_string(),
            hash: compute_hash(state)?,
            blob: state.clone(),
        };

        let staging = path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&staging)?);
            serde_json::to_writer_pretty(&mut writer, &envelope)?;
            writer.flush()?;
        }
        fs::rename(&staging, &path)?;
        debug!(key, path = %path.display(), "state saved");
        Ok(())
    }

    fn load_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let envelope: StateEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.hash != compute_hash(&envelope.blob)? {
            return Err(PersistenceError::HashMismatch(key.to_string()));
        }
        Ok(Some(envelope.blob))
    }
}

fn compute_hash(blob: &serde_json::Value) -> Result<String> {
    let serialized = serde_json::to_vec(blob)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}
