//! Path-scoped storage for original images and their sidecar documents.
//!
//! Every read, serve or delete of a stored file goes through
//! [`AssetStore::check_image`] or [`AssetStore::check_sidecar`], which refuse
//! paths that resolve outside the configured directories.

use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::{CatalogError, Result};
use crate::scanner::discovery;

pub const SIDECAR_EXTENSION: &str = "json";

pub struct AssetStore {
    images_dir: PathBuf,
    metadata_dir: PathBuf,
}

/// Bytes written next to their destination, not yet visible under the final name.
#[derive(Debug)]
pub struct StagedAsset {
    temp: PathBuf,
    dest: PathBuf,
}

impl StagedAsset {
    /// Atomically moves the staged bytes onto the destination, replacing any
    /// existing file.
    pub fn commit(self) -> Result<PathBuf> {
        fs::rename(&self.temp, &self.dest).map_err(|e| {
            let _ = fs::remove_file(&self.temp);
            CatalogError::storage_write(&self.dest, e)
        })?;
        Ok(self.dest)
    }

    pub fn discard(self) {
        if let Err(e) = fs::remove_file(&self.temp) {
            debug!("Could not remove staged file {:?}: {}", self.temp, e);
        }
    }
}

/// File count and size of the stored images.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageSummary {
    pub total_files: usize,
    pub total_size_mb: f64,
}

impl AssetStore {
    pub fn new(images_dir: impl Into<PathBuf>, metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
            metadata_dir: metadata_dir.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.images_dir(), config.metadata_dir())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.images_dir, &self.metadata_dir] {
            fs::create_dir_all(dir).map_err(|e| CatalogError::storage_write(dir, e))?;
        }
        Ok(())
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    /// Destination of an uploaded file. The name must be a bare file name.
    pub fn asset_path(&self, filename: &str) -> Result<PathBuf> {
        validate_file_name(filename)?;
        Ok(self.images_dir.join(filename))
    }

    /// Sidecar location for an asset stem.
    pub fn sidecar_path(&self, stem: &str) -> PathBuf {
        self.metadata_dir
            .join(format!("{}.{}", stem, SIDECAR_EXTENSION))
    }

    /// Writes `bytes` to a temporary file beside the destination.
    pub fn stage(&self, filename: &str, bytes: &[u8]) -> Result<StagedAsset> {
        let dest = self.asset_path(filename)?;
        let temp = self.images_dir.join(format!(".{}.part", filename));
        write_synced(&temp, bytes)?;
        Ok(StagedAsset { temp, dest })
    }

    /// Writes `bytes` under the images directory. Existing files with the same
    /// name are replaced; callers dedup by fingerprint first.
    pub fn save(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        self.stage(filename, bytes)?.commit()
    }

    /// Resolves `candidate` and confirms it lies under the images directory.
    pub fn check_image(&self, candidate: &Path) -> Result<PathBuf> {
        check_within(candidate, &self.images_dir)
    }

    /// Resolves `candidate` and confirms it lies under the metadata directory.
    pub fn check_sidecar(&self, candidate: &Path) -> Result<PathBuf> {
        check_within(candidate, &self.metadata_dir)
    }

    /// Reads a stored image after the path-safety check.
    pub fn read_image(&self, path: &Path) -> Result<Vec<u8>> {
        let path = self.check_image(path)?;
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CatalogError::not_found(path.display().to_string()),
            _ => CatalogError::Io(e),
        })
    }

    /// Image files under the images directory, lazily.
    pub fn list_images<'a>(&self, extensions: &'a [String]) -> impl Iterator<Item = PathBuf> + 'a {
        discovery::list_under(&self.images_dir, extensions)
            .filter(|p| !is_staging_file(p))
    }

    /// Sidecar documents under the metadata directory, lazily.
    pub fn list_sidecars(&self) -> impl Iterator<Item = PathBuf> {
        discovery::list_under(&self.metadata_dir, discovery::ANY_EXTENSION)
            .filter(|p| p.extension().is_some_and(|e| e == SIDECAR_EXTENSION))
    }

    pub fn storage_summary(&self, extensions: &[String]) -> StorageSummary {
        let mut total_files = 0;
        let mut total_bytes = 0u64;
        for path in self.list_images(extensions) {
            if let Ok(meta) = fs::metadata(&path) {
                total_files += 1;
                total_bytes += meta.len();
            }
        }
        let mb = total_bytes as f64 / (1024.0 * 1024.0);
        StorageSummary {
            total_files,
            total_size_mb: (mb * 100.0).round() / 100.0,
        }
    }
}

fn is_staging_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| {
            let n = n.to_string_lossy();
            n.starts_with('.') && n.ends_with(".part")
        })
        .unwrap_or(false)
}

fn check_within(candidate: &Path, root: &Path) -> Result<PathBuf> {
    match resolve_within(candidate, root) {
        Some(resolved) => Ok(resolved),
        None => {
            warn!(target: "security", "Refused path outside {:?}: {:?}", root, candidate);
            Err(CatalogError::Permission {
                path: candidate.to_path_buf(),
            })
        }
    }
}

/// True when `candidate` resolves to a path strictly below `root`.
///
/// Symlinks and `..` components are resolved before the ancestry check, and
/// the candidate need not exist yet.
pub fn path_is_safe(candidate: &Path, root: &Path) -> bool {
    resolve_within(candidate, root).is_some()
}

fn resolve_within(candidate: &Path, root: &Path) -> Option<PathBuf> {
    let root = root.canonicalize().ok()?;
    let resolved = resolve(candidate)?;
    (resolved != root && resolved.starts_with(&root)).then_some(resolved)
}

/// Absolute, symlink-free form of `path`. Missing trailing components are
/// appended to the canonical form of the deepest existing ancestor.
fn resolve(path: &Path) -> Option<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Some(canonical);
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    let normalized = normalize(&absolute)?;

    let mut existing = normalized.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            for part in missing.iter().rev() {
                resolved.push(part);
            }
            return Some(resolved);
        }
        missing.push(existing.file_name()?.to_os_string());
        existing = existing.parent()?;
    }
}

/// Lexically removes `.` and `..` components. `None` if `..` climbs past the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn validate_file_name(filename: &str) -> Result<()> {
    let invalid = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\', '\0']);
    if invalid {
        return Err(CatalogError::Validation(format!(
            "not a plain file name: {:?}",
            filename
        )));
    }
    Ok(())
}

/// Writes a file and flushes it to disk.
pub(crate) fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let write = || -> std::io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(bytes)?;
        file.sync_all()
    };
    write().map_err(|e| CatalogError::storage_write(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> AssetStore {
        let store = AssetStore::new(dir.join("images"), dir.join("metadata"));
        store.ensure_directories().unwrap();
        store
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let path = store.save("a.jpg", b"one").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"one");
        store.save("a.jpg", b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert_eq!(store.list_images(&[]).count(), 1);
    }

    #[test]
    fn test_staged_asset_is_invisible_until_commit() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let staged = store.stage("b.jpg", b"bytes").unwrap();
        assert!(!store.images_dir().join("b.jpg").exists());
        assert_eq!(store.list_images(&[]).count(), 0);
        staged.discard();
        assert_eq!(fs::read_dir(store.images_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_non_plain_names() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        for name in ["", ".", "..", "../escape.jpg", "sub/dir.jpg", "a\\b.jpg"] {
            assert!(
                matches!(store.save(name, b"x"), Err(CatalogError::Validation(_))),
                "{:?}",
                name
            );
        }
    }

    #[test]
    fn test_path_is_safe() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let root = store.images_dir();
        let inside = store.save("inside.jpg", b"x").unwrap();

        assert!(path_is_safe(&inside, root));
        assert!(path_is_safe(&root.join("not-yet-written.jpg"), root));
        assert!(!path_is_safe(root, root));
        assert!(!path_is_safe(&root.join("../metadata/x.json"), root));
        assert!(!path_is_safe(&dir.path().join("outside.jpg"), root));
        assert!(!path_is_safe(Path::new("/etc/passwd"), root));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_refused() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let secret = dir.path().join("secret.jpg");
        fs::write(&secret, b"s").unwrap();
        let link = store.images_dir().join("link.jpg");
        std::os::unix::fs::symlink(&secret, &link).unwrap();

        assert!(matches!(
            store.read_image(&link),
            Err(CatalogError::Permission { .. })
        ));
    }

    #[test]
    fn test_read_missing_image_is_not_found() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let missing = store.images_dir().join("gone.jpg");
        assert!(matches!(store.read_image(&missing), Err(CatalogError::NotFound(_))));
    }

    #[test]
    fn test_storage_summary() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.save("a.jpg", &vec![0u8; 1024 * 1024]).unwrap();
        store.save("b.png", &vec![0u8; 512 * 1024]).unwrap();
        store.save("c.txt", b"ignored").unwrap();

        let summary = store.storage_summary(&["jpg".to_string(), "png".to_string()]);
        assert_eq!(summary.total_files, 2);
        assert_eq!(summary.total_size_mb, 1.5);
    }
}
