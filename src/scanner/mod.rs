pub mod discovery;
pub mod filename;
pub mod hashing;

use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::mpsc;
use tracing::{info, warn};

use crate::catalog::{Catalog, UploadFields, UploadOutcome};
use crate::error::{CatalogError, Result};

pub use discovery::discover_images;

#[derive(Debug, Clone)]
pub enum ImportProgress {
    Started { total_files: usize },
    Importing { current: usize, total: usize, path: String },
    Completed { summary: ImportSummary },
    Error { message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub found: usize,
    pub uploaded: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Uploads every image under `directory` whose extension the catalog accepts.
///
/// Each file goes through the regular upload flow, so duplicates are skipped
/// and metadata is parsed from the file name. A failing file is counted and
/// reported on the progress channel; it does not stop the import.
pub fn import_directory(
    catalog: &Catalog,
    directory: &Path,
    progress_tx: Option<mpsc::Sender<ImportProgress>>,
) -> Result<ImportSummary> {
    if !directory.is_dir() {
        return Err(CatalogError::not_found(format!("directory {}", directory.display())));
    }

    let image_paths = discover_images(directory, &catalog.upload_config().allowed_extensions);
    let total = image_paths.len();
    if let Some(ref tx) = progress_tx {
        let _ = tx.send(ImportProgress::Started { total_files: total });
    }

    let mut summary = ImportSummary {
        found: total,
        ..Default::default()
    };

    for (index, path) in image_paths.iter().enumerate() {
        if let Some(ref tx) = progress_tx {
            let _ = tx.send(ImportProgress::Importing {
                current: index + 1,
                total,
                path: path.to_string_lossy().to_string(),
            });
        }

        match import_file(catalog, path) {
            Ok(UploadOutcome::Uploaded { .. }) => summary.uploaded += 1,
            Ok(UploadOutcome::Replaced { .. }) => summary.replaced += 1,
            Ok(UploadOutcome::Skipped { .. }) => summary.skipped += 1,
            Err(e) => {
                summary.failed += 1;
                warn!("Import of {:?} failed: {}", path, e);
                if let Some(ref tx) = progress_tx {
                    let _ = tx.send(ImportProgress::Error {
                        message: format!("Error importing {}: {}", path.display(), e),
                    });
                }
            }
        }
    }

    info!(
        "Imported {:?}: {} found, {} uploaded, {} replaced, {} skipped, {} failed",
        directory, summary.found, summary.uploaded, summary.replaced, summary.skipped, summary.failed
    );
    if let Some(ref tx) = progress_tx {
        let _ = tx.send(ImportProgress::Completed {
            summary: summary.clone(),
        });
    }

    Ok(summary)
}

fn import_file(catalog: &Catalog, path: &Path) -> Result<UploadOutcome> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let bytes = fs::read(path)?;
    catalog.upload(&filename, &bytes, &UploadFields::default())
}
