//! Atomic file replacement for persisted state

use crate::error::{Error, Result};
use rand::Rng;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

fn temp_path(path: &Path) -> PathBuf {
    let suffix: u64 = rand::thread_rng().gen();
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{suffix:016x}.tmp"));
    path.with_file_name(name)
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
///
/// Readers see either the old file or the new one, never a torn write. The
/// temp file is removed on failure.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| Error::persist(path.display().to_string(), e.to_string()))?;
    }

    let tmp = temp_path(path);
    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(Error::persist(path.display().to_string(), e.to_string()));
    }
    Ok(())
}

/// Serialize `value` as indented JSON and write it atomically
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}
