use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::AqError;

pub fn ensure_parent(path: &Path) -> Result<(), AqError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| AqError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// Writes through a sibling temp file and renames it into place.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), AqError> {
    ensure_parent(path)?;
    let tmp_path = path.with_extension("tmp");
    let mut file =
        fs::File::create(&tmp_path).map_err(|err| AqError::Filesystem(err.to_string()))?;
    file.write_all(content)
        .and_then(|_| file.sync_all())
        .map_err(|err| AqError::Filesystem(err.to_string()))?;
    fs::rename(&tmp_path, path).map_err(|err| AqError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Appends `content` with a single write and flushes it to disk.
pub fn append_durable(path: &Path, content: &[u8]) -> Result<(), AqError> {
    let mut file = fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|err| AqError::Filesystem(format!("open {}: {err}", path.display())))?;
    file.write_all(content)
        .and_then(|_| file.sync_data())
        .map_err(|err| AqError::Filesystem(format!("append {}: {err}", path.display())))
}
