//! Client state that survives restarts: the identity and last known position

use bincode::{deserialize, serialize};
use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const ID_PREFIX: &str = "user_";
const ID_LENGTH: usize = 9;
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("state file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CachedPosition {
    pub latitude: f64,
    pub longitude: f64,
    /// Milliseconds since the UNIX epoch when the fix was taken
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalState {
    pub identity: Option<String>,
    pub last_position: Option<CachedPosition>,
}

/// File-backed [`LocalState`]
///
/// Write failures are logged and otherwise ignored: the client keeps working
/// from memory and simply starts fresh next time.
pub struct LocalStore {
    path: PathBuf,
    state: LocalState,
}

impl LocalStore {
    /// Opens the store at `path`; a missing or unreadable file yields empty state
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match Self::load(&path) {
            Ok(state) => state,
            Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                LocalState::default()
            }
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                LocalState::default()
            }
        };
        Self { path, state }
    }

    pub fn load(path: &Path) -> Result<LocalState, StorageError> {
        let bytes = fs::read(path)?;
        Ok(deserialize(&bytes)?)
    }

    pub fn save(&self) -> Result<(), StorageError> {
        let bytes = serialize(&self.state)?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }

    pub fn state(&self) -> &LocalState {
        &self.state
    }

    /// Returns the stored identity, generating and persisting one on first use
    pub fn identity_or_generate(&mut self) -> String {
        if let Some(identity) = &self.state.identity {
            info!("Using stored user ID: {}", identity);
            return identity.clone();
        }

        let identity = generate_user_id();
        self.state.identity = Some(identity.clone());
        if let Err(e) = self.save() {
            warn!("Could not save user ID: {}", e);
        }
        identity
    }

    pub fn remember_position(&mut self, latitude: f64, longitude: f64, timestamp: u64) {
        self.state.last_position = Some(CachedPosition {
            latitude,
            longitude,
            timestamp,
        });
        if let Err(e) = self.save() {
            warn!("Could not save position: {}", e);
        }
    }

    pub fn cached_position(&self) -> Option<&CachedPosition> {
        self.state.last_position.as_ref()
    }

    pub fn forget_position(&mut self) {
        if self.state.last_position.take().is_some() {
            if let Err(e) = self.save() {
                warn!("Could not save state: {}", e);
            }
        }
    }
}

/// Generates `user_` followed by nine random base-36 characters
pub fn generate_user_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_LENGTH)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", ID_PREFIX, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "location-relay-{}-{}-{}",
            name,
            std::process::id(),
            generate_user_id()
        ))
    }

    #[test]
    fn test_generated_id_format() {
        let id = generate_user_id();
        assert!(id.starts_with("user_"));
        assert_eq!(id.len(), ID_PREFIX.len() + ID_LENGTH);
        assert!(id[ID_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(generate_user_id(), generate_user_id());
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let store = LocalStore::open(temp_path("missing"));
        assert_eq!(store.state(), &LocalState::default());
    }

    #[test]
    fn test_identity_persists_across_reopen() {
        let path = temp_path("identity");

        let first = LocalStore::open(&path).identity_or_generate();
        let second = LocalStore::open(&path).identity_or_generate();
        assert_eq!(first, second);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_position_persists_across_reopen() {
        let path = temp_path("position");

        let mut store = LocalStore::open(&path);
        store.remember_position(59.91, 10.75, 1234);

        let reopened = LocalStore::open(&path);
        assert_eq!(
            reopened.cached_position(),
            Some(&CachedPosition {
                latitude: 59.91,
                longitude: 10.75,
                timestamp: 1234,
            })
        );

        let mut reopened = reopened;
        reopened.forget_position();
        assert!(LocalStore::open(&path).cached_position().is_none());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_is_empty_state() {
        let path = temp_path("corrupt");
        fs::write(&path, [0xff, 0xff, 0xff]).unwrap();

        let store = LocalStore::open(&path);
        assert_eq!(store.state(), &LocalState::default());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_unwritable_path_keeps_identity_in_memory() {
        let dir = temp_path("dir");
        fs::create_dir_all(&dir).unwrap();

        // Writing to a directory path fails
        let mut store = LocalStore::open(&dir);
        let identity = store.identity_or_generate();
        assert_eq!(store.identity_or_generate(), identity);

        let _ = fs::remove_dir_all(&dir);
    }
}
