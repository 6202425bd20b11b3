//! On-disk layout of a project store.
//!
//! ```text
//! <state_dir>/<project>/<stack>/
//!     .vault.lock
//!     secrets/<name>.sealed.json
//!     public/<name>.json
//! ```
//!
//! Names may contain `/`, which maps to subdirectories.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{TrustError, TrustResult};
use crate::persist::write_atomic;

pub(crate) const SEALED_SUFFIX: &str = ".sealed.json";
pub(crate) const PUBLIC_SUFFIX: &str = ".json";
const LOCK_FILE: &str = ".vault.lock";

/// Lock purpose used by trust anchor rotation.
pub const ROTATE_PURPOSE: &str = "rotate";

/// Check a record name: `/`-separated segments of `[A-Za-z0-9._-]`.
pub fn validate_name(name: &str) -> TrustResult<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(TrustError::invalid_request(format!(
            "invalid record name '{}'",
            name
        )));
    }
    for segment in name.split('/') {
        let valid = !segment.is_empty()
            && segment != "."
            && segment != ".."
            && !segment.starts_with('.')
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(TrustError::invalid_request(format!(
                "invalid record name '{}'",
                name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub(crate) struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sealed_path(&self, name: &str) -> PathBuf {
        self.root
            .join("secrets")
            .join(format!("{}{}", name, SEALED_SUFFIX))
    }

    pub fn public_path(&self, name: &str) -> PathBuf {
        self.root
            .join("public")
            .join(format!("{}{}", name, PUBLIC_SUFFIX))
    }

    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> TrustResult<Option<T>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> TrustResult<()> {
        let json = serde_json::to_vec_pretty(value)?;
        write_atomic(path, &json)?;
        Ok(())
    }

    pub fn remove(&self, path: &Path) -> TrustResult<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all records under `secrets/`, sorted.
    pub fn list_sealed(&self) -> TrustResult<Vec<String>> {
        let base = self.root.join("secrets");
        let mut names = Vec::new();
        collect_names(&base, &base, SEALED_SUFFIX, &mut names)?;
        names.sort();
        Ok(names)
    }

    /// Take the advisory writer lock for this store.
    ///
    /// The lock is held by the operating system on the open lock file, so it
    /// goes away with the process that holds it. The file's contents only
    /// name the holder for error reporting.
    pub fn lock(&self, purpose: &str) -> TrustResult<LockGuard> {
        fs::create_dir_all(&self.root)?;
        let path = self.root.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() != fs2::lock_contended_error().raw_os_error() {
                return Err(e.into());
            }
            let holder = fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<LockInfo>(&bytes).ok());
            return match holder {
                Some(holder) if holder.purpose == ROTATE_PURPOSE => Err(TrustError::RotationInProgress),
                Some(holder) => Err(TrustError::VaultLocked(holder.purpose)),
                None => Err(TrustError::VaultLocked("unknown".to_string())),
            };
        }

        let info = LockInfo {
            purpose: purpose.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        file.set_len(0)?;
        file.write_all(&serde_json::to_vec(&info)?)?;
        file.sync_all()?;
        debug!(purpose, path = %path.display(), "Acquired vault lock");
        Ok(LockGuard { path, file })
    }
}

fn collect_names(base: &Path, dir: &Path, suffix: &str, out: &mut Vec<String>) -> TrustResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_names(base, &path, suffix, out)?;
            continue;
        }
        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        if let Some(name) = relative.strip_suffix(suffix) {
            if validate_name(name).is_ok() {
                out.push(name.to_string());
            }
        }
    }
    Ok(())
}

/// Contents of the lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    purpose: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Held advisory lock, released on drop.
///
/// The lock file itself stays in place; deleting it would let a process that
/// already opened it lock an unlinked file.
#[derive(Debug)]
pub(crate) struct LockGuard {
    path: PathBuf,
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.set_len(0) {
            debug!(path = %self.path.display(), error = %e, "Failed to clear vault lock holder");
        }
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release vault lock");
        }
    }
}
