//! Crash-safe file replacement.
//!
//! Every persisted record is replaced as a whole: the new content is written to
//! a uniquely named sibling, flushed, and renamed over the target. Readers see
//! either the old or the new file, never a partial write.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use uuid::Uuid;

/// Atomically replace `path` with `data`.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp_path = dir.join(format!(".{}.tmp-{}", file_name, Uuid::new_v4()));

    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        sync_dir(dir)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Flush directory metadata so the rename itself is durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
