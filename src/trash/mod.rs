use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::error::{CatalogError, Result};

/// Holding area for files that are about to be removed.
///
/// Deletion moves files here first so that a later failure can put them back;
/// once the deletion is final the staged copies are purged.
pub struct TrashBin {
    path: PathBuf,
}

/// A file moved into the trash, with the location it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrashedFile {
    pub trash_path: PathBuf,
    pub original_path: PathBuf,
}

impl TrashBin {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.path).map_err(|e| CatalogError::storage_write(&self.path, e))
    }

    /// Unique name inside the trash. The counter keeps names distinct within
    /// the same second.
    fn trash_name(&self, original: &Path) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let timestamp = Utc::now().timestamp();
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let stem = original
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let extension = original
            .extension()
            .map(|s| format!(".{}", s.to_string_lossy()))
            .unwrap_or_default();

        self.path.join(format!("{}_{}_{}{}", stem, timestamp, seq, extension))
    }

    /// Moves `path` into the trash.
    pub fn move_to_trash(&self, path: &Path) -> Result<TrashedFile> {
        self.ensure_dir()?;
        let trash_path = self.trash_name(path);
        move_file(path, &trash_path)?;
        debug!("Trashed {:?} as {:?}", path, trash_path);
        Ok(TrashedFile {
            trash_path,
            original_path: path.to_path_buf(),
        })
    }

    /// Puts a trashed file back where it came from. Refuses to overwrite.
    pub fn restore(&self, file: &TrashedFile) -> Result<()> {
        if file.original_path.exists() {
            return Err(CatalogError::Validation(format!(
                "cannot restore: {} already exists",
                file.original_path.display()
            )));
        }
        if let Some(parent) = file.original_path.parent() {
            fs::create_dir_all(parent).map_err(|e| CatalogError::storage_write(parent, e))?;
        }
        move_file(&file.trash_path, &file.original_path)
    }

    pub fn purge(&self, file: &TrashedFile) -> Result<()> {
        fs::remove_file(&file.trash_path)
            .map_err(|e| CatalogError::storage_write(&file.trash_path, e))
    }

    /// Files currently held in the trash.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Rename, falling back to copy and delete across file systems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| CatalogError::storage_write(to, e))?;
    fs::remove_file(from).map_err(|e| CatalogError::storage_write(from, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_move_and_restore() {
        let dir = tempdir().unwrap();
        let bin = TrashBin::new(dir.path().join(".trash"));
        let original = dir.path().join("山水图.jpg");
        fs::write(&original, b"pixels").unwrap();

        let trashed = bin.move_to_trash(&original).unwrap();
        assert!(!original.exists());
        assert!(trashed.trash_path.starts_with(dir.path().join(".trash")));
        assert_eq!(bin.list().unwrap().len(), 1);

        bin.restore(&trashed).unwrap();
        assert_eq!(fs::read(&original).unwrap(), b"pixels");
        assert!(bin.list().unwrap().is_empty());
    }

    #[test]
    fn test_same_name_twice_gets_distinct_trash_names() {
        let dir = tempdir().unwrap();
        let bin = TrashBin::new(dir.path().join(".trash"));
        let original = dir.path().join("a.json");

        fs::write(&original, b"1").unwrap();
        let first = bin.move_to_trash(&original).unwrap();
        fs::write(&original, b"2").unwrap();
        let second = bin.move_to_trash(&original).unwrap();

        assert_ne!(first.trash_path, second.trash_path);
        bin.purge(&first).unwrap();
        assert_eq!(bin.list().unwrap(), vec![second.trash_path]);
    }

    #[test]
    fn test_restore_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let bin = TrashBin::new(dir.path().join(".trash"));
        let original = dir.path().join("a.jpg");
        fs::write(&original, b"old").unwrap();

        let trashed = bin.move_to_trash(&original).unwrap();
        fs::write(&original, b"new").unwrap();
        assert!(matches!(bin.restore(&trashed), Err(CatalogError::Validation(_))));
        assert_eq!(fs::read(&original).unwrap(), b"new");
    }

    #[test]
    fn test_moving_missing_file_fails() {
        let dir = tempdir().unwrap();
        let bin = TrashBin::new(dir.path().join(".trash"));
        assert!(bin.move_to_trash(&dir.path().join("absent.jpg")).is_err());
    }
}
