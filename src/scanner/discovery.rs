use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extension filter that accepts every file.
pub const ANY_EXTENSION: &[String] = &[];

/// Lazily yields files under `root` whose extension is in `extensions`
/// (case-insensitive). An empty extension list matches every file.
///
/// Unreadable entries are skipped. The iterator is finite and single-pass;
/// call again to restart.
pub fn list_under<'a>(root: &Path, extensions: &'a [String]) -> impl Iterator<Item = PathBuf> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(move |path| has_extension(path, extensions))
}

/// Sorted list of matching files, for callers that need a stable order.
pub fn discover_images(directory: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = list_under(directory, extensions).collect();
    images.sort();
    images
}

pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    match path.extension() {
        Some(ext) => {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext_lower)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn test_discover_images() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();

        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();

        let extensions = vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()];
        let images = discover_images(dir.path(), &extensions);

        assert_eq!(images.len(), 3);
        assert!(images.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_list_under_is_restartable_by_reinvocation() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("a.json")).unwrap();
        File::create(dir.path().join("b.jpg")).unwrap();

        let json = vec!["json".to_string()];
        assert_eq!(list_under(dir.path(), &json).count(), 1);
        assert_eq!(list_under(dir.path(), &json).count(), 1);
        assert_eq!(list_under(dir.path(), &[]).count(), 2);
    }

    #[test]
    fn test_missing_root_yields_nothing() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(list_under(&missing, &[]).count(), 0);
    }
}
