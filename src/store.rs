use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::ledger::{LedgerError, LedgerSnapshot, WorldState};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cannot access ledger file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger file {path} is not a valid snapshot: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Loads the world state, or an empty one when the file does not exist yet.
pub fn load_state(path: &Path) -> Result<WorldState, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no ledger file, starting empty");
            return Ok(WorldState::new());
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let snapshot: LedgerSnapshot =
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(WorldState::from_snapshot(snapshot)?)
}

/// Writes the snapshot next to `path` and renames it into place.
pub fn save_state(path: &Path, state: &WorldState) -> Result<(), StoreError> {
    let io_err = |source: io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let snapshot = state.snapshot()?;
    let json = serde_json::to_vec_pretty(&snapshot).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    debug!(path = %path.display(), height = state.height(), "ledger saved");
    Ok(())
}
