//! Durable snapshots of a node's account table.
//!
//! The whole [`NodeState`] is rewritten on every mutation. Writes go to a
//! sibling `.tmp` file which is synced and then renamed over the canonical
//! path, so a reader never observes a half-written snapshot.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// A single account as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub number: u32,
    pub balance: i64,
}

/// Everything a node persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub last_assigned_number: u32,
    #[serde(default)]
    pub accounts: Vec<AccountRecord>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read snapshot {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("snapshot {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write snapshot {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// The outcome of [`SnapshotStore::load`].
#[derive(Debug)]
pub struct Loaded {
    pub state: NodeState,
    /// Set when an existing snapshot could not be used and the node starts empty.
    pub discarded: Option<SnapshotError>,
}

/// File-backed snapshot storage.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        sibling(&self.path, "tmp")
    }

    fn corrupt_path(&self) -> PathBuf {
        sibling(&self.path, "corrupt")
    }

    /// Reads the last snapshot, telling a missing file apart from a bad one.
    pub fn try_load(&self) -> Result<Option<NodeState>, SnapshotError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SnapshotError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SnapshotError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Reads the last snapshot, starting fresh when there is none.
    ///
    /// An unreadable snapshot is moved aside to `<path>.corrupt` (when it
    /// could be read at all) and replaced by an empty state rather than
    /// failing start-up. The returned [`Loaded::discarded`] says why.
    pub fn load(&self) -> Loaded {
        match self.try_load() {
            Ok(state) => Loaded {
                state: state.unwrap_or_default(),
                discarded: None,
            },
            Err(error) => {
                if let SnapshotError::Corrupt { .. } = error {
                    let aside = self.corrupt_path();
                    if let Err(err) = fs::rename(&self.path, &aside) {
                        warn!(error = ?err, path = %aside.display(), "failed to keep corrupt snapshot");
                    }
                }
                Loaded {
                    state: NodeState::default(),
                    discarded: Some(error),
                }
            }
        }
    }

    /// Replaces the snapshot with `state` via write-to-temp then rename.
    pub fn save_atomic(&self, state: &NodeState) -> Result<(), SnapshotError> {
        let tmp = self.temp_path();
        self.write_temp(&tmp, state)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|source| SnapshotError::Write {
                path: self.path.clone(),
                source,
            })
    }

    fn write_temp(&self, tmp: &Path, state: &NodeState) -> io::Result<()> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let encoded = serde_json::to_vec_pretty(state)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut file = File::create(tmp)?;
        file.write_all(&encoded)?;
        file.flush()?;
        file.sync_all()
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}
