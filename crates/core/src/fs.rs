//! Filesystem utilities

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info};

/// Ensure a directory exists, creating it and its parents if necessary
///
/// Returns true if the directory exists afterwards.
pub fn ensure_dir_exists(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();

    if path.is_dir() {
        return true;
    }

    match fs::create_dir_all(path) {
        Ok(_) => {
            info!("Created directory: {}", path.display());
            true
        }
        Err(e) => {
            error!("Failed to create directory {}: {}", path.display(), e);
            false
        }
    }
}

/// Temp path next to `target` (same directory, so a rename stays on one filesystem)
pub fn sibling_temp_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(target.file_name().unwrap_or_default());
    name.push(format!(".{}.tmp", std::process::id()));
    target.with_file_name(name)
}

/// Move a fully written temp file over `target` in one rename
///
/// Readers see either the old file or the new one, never a partial write.
/// On failure the temp file is removed and `target` is left untouched.
pub fn replace_file(temp: &Path, target: &Path) -> std::io::Result<()> {
    if let Err(e) = fs::rename(temp, target) {
        let _ = fs::remove_file(temp);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        assert!(ensure_dir_exists(&nested));
        assert!(nested.is_dir());
    }

    #[test]
    fn temp_path_is_hidden_sibling() {
        let temp = sibling_temp_path(Path::new("/data/air_quality.parquet"));
        assert_eq!(temp.parent(), Some(Path::new("/data")));
        let name = temp.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".air_quality.parquet."));
        assert!(name.ends_with(".tmp"));
    }

    #[test]
    fn replace_overwrites_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("table");
        fs::write(&target, b"old").unwrap();
        let temp = sibling_temp_path(&target);
        fs::write(&temp, b"new").unwrap();

        replace_file(&temp, &target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(!temp.exists());
    }
}
