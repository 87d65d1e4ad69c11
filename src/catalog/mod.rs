//! The reconciliation pipeline tying the catalog store, the asset store and
//! the sidecar documents together.
//!
//! Writes happen in a fixed order: asset file, then catalog row, then
//! sidecar. When a later step fails the earlier ones are undone, so a failed
//! upload leaves neither a row nor a file behind. A replaced asset is staged
//! next to its destination and only renamed into place once the row and the
//! sidecar have been rewritten.

use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{Config, UploadConfig};
use crate::db::{
    CatalogBackend, Category, InkColorStyle, Page, Painting, PaintingFilter, PaintingPatch,
    SearchResult, SqliteCatalog, Technique,
};
use crate::error::{CatalogError, Result};
use crate::scanner::discovery::has_extension;
use crate::scanner::filename::{file_stem, parse_filename};
use crate::scanner::hashing::fingerprint;
use crate::sidecar::{self, merge, Sidecar};
use crate::storage::{AssetStore, StorageSummary};
use crate::trash::{TrashBin, TrashedFile};

/// Descriptive fields supplied with an upload. They take precedence over
/// values parsed from the file name but never overwrite a stored sidecar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadFields {
    pub title: Option<String>,
    pub author: Option<String>,
    pub dynasty: Option<String>,
    pub category: Option<Category>,
    pub technique: Option<Technique>,
    pub ink_color_style: Option<InkColorStyle>,
}

impl UploadFields {
    fn to_sidecar(&self) -> Sidecar {
        Sidecar {
            title: non_blank(&self.title),
            author: non_blank(&self.author),
            dynasty: non_blank(&self.dynasty),
            category: self.category,
            technique: self.technique,
            ink_color_style: self.ink_color_style,
            ..Default::default()
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadOutcome {
    /// A new record was created.
    Uploaded {
        id: i64,
        file_hash: String,
        sidecar_path: PathBuf,
    },
    /// The file name was already cataloged with other bytes; the record was
    /// rebound to the new content.
    Replaced {
        id: i64,
        file_hash: String,
        sidecar_path: PathBuf,
    },
    /// These exact bytes are already cataloged.
    Skipped { existing_id: i64, file_hash: String },
}

impl UploadOutcome {
    pub fn id(&self) -> i64 {
        match self {
            UploadOutcome::Uploaded { id, .. } | UploadOutcome::Replaced { id, .. } => *id,
            UploadOutcome::Skipped { existing_id, .. } => *existing_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteOutcome {
    pub id: i64,
    pub removed: Vec<PathBuf>,
    /// Companion files that were already gone when the record was deleted.
    pub missing: Vec<PathBuf>,
}

/// One stored image read back out of the images directory.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredImage {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Files under the storage root that no catalog row accounts for.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub orphan_images: Vec<PathBuf>,
    pub orphan_sidecars: Vec<PathBuf>,
    pub trashed: usize,
}

pub struct Catalog {
    store: Box<dyn CatalogBackend>,
    assets: AssetStore,
    trash: TrashBin,
    upload: UploadConfig,
}

impl Catalog {
    pub fn new(
        store: Box<dyn CatalogBackend>,
        assets: AssetStore,
        trash: TrashBin,
        upload: UploadConfig,
    ) -> Result<Self> {
        store.initialize()?;
        assets.ensure_directories()?;
        Ok(Self {
            store,
            assets,
            trash,
            upload,
        })
    }

    /// Opens the SQLite catalog and storage directories named by `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let store = SqliteCatalog::open(&config.db_path)?;
        Self::new(
            Box::new(store),
            AssetStore::from_config(&config.storage),
            TrashBin::new(config.storage.trash_dir()),
            config.upload.clone(),
        )
    }

    pub fn assets(&self) -> &AssetStore {
        &self.assets
    }

    pub fn upload_config(&self) -> &UploadConfig {
        &self.upload
    }

    #[cfg(test)]
    pub(crate) fn backend(&self) -> &dyn CatalogBackend {
        self.store.as_ref()
    }

    fn validate_upload(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        self.assets.asset_path(filename)?;
        if bytes.is_empty() {
            return Err(CatalogError::Validation(format!("{} is empty", filename)));
        }
        if !has_extension(Path::new(filename), &self.upload.allowed_extensions) {
            return Err(CatalogError::Validation(format!(
                "{}: extension not allowed (expected one of {})",
                filename,
                self.upload.allowed_extensions.join(", ")
            )));
        }
        if bytes.len() as u64 > self.upload.max_upload_bytes() {
            return Err(CatalogError::Validation(format!(
                "{} exceeds the {} MB upload limit",
                filename, self.upload.max_upload_mb
            )));
        }
        image::guess_format(bytes).map_err(|_| {
            CatalogError::Validation(format!("{} is not a recognised image", filename))
        })?;
        Ok(())
    }

    /// Stores an uploaded image and catalogs it.
    ///
    /// Identical bytes already in the catalog yield `Skipped` without touching
    /// anything. Otherwise the file name is parsed, merged with `fields` and
    /// with any sidecar sharing the stem, and the asset, row and sidecar are
    /// written.
    pub fn upload(&self, filename: &str, bytes: &[u8], fields: &UploadFields) -> Result<UploadOutcome> {
        self.validate_upload(filename, bytes)?;

        let digest = fingerprint(bytes);
        if let Some(existing) = self.store.find_by_fingerprint(&digest)? {
            info!("Skipping {}: already cataloged as {}", filename, existing.id);
            return Ok(UploadOutcome::Skipped {
                existing_id: existing.id,
                file_hash: digest,
            });
        }

        let dest = self.assets.asset_path(filename)?;
        self.reconcile(filename, &dest, &digest, Some(bytes), fields)
    }

    /// Catalogs a file already present under the images directory, without
    /// rewriting it.
    pub fn register(&self, path: &Path, fields: &UploadFields) -> Result<UploadOutcome> {
        let resolved = self.assets.check_image(path)?;
        let filename = resolved
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| CatalogError::Validation(format!("{} has no file name", path.display())))?;

        let bytes = fs::read(&resolved).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CatalogError::not_found(resolved.display().to_string()),
            _ => CatalogError::Io(e),
        })?;
        self.validate_upload(&filename, &bytes)?;

        let digest = fingerprint(&bytes);
        if let Some(existing) = self.store.find_by_fingerprint(&digest)? {
            return Ok(UploadOutcome::Skipped {
                existing_id: existing.id,
                file_hash: digest,
            });
        }

        // Keep stored paths in the same form as uploads: rooted at the
        // configured images directory rather than its canonical form.
        let images_root = self.assets.images_dir().canonicalize()?;
        let dest = match resolved.strip_prefix(&images_root) {
            Ok(relative) => self.assets.images_dir().join(relative),
            Err(_) => resolved.clone(),
        };
        self.reconcile(&filename, &dest, &digest, None, fields)
    }

    fn reconcile(
        &self,
        filename: &str,
        dest: &Path,
        digest: &str,
        bytes: Option<&[u8]>,
        fields: &UploadFields,
    ) -> Result<UploadOutcome> {
        let stem = file_stem(filename);
        let dest_str = dest.to_string_lossy().to_string();
        let sidecar_path = self.assets.sidecar_path(&stem);

        let previous_sidecar = fs::read(&sidecar_path).ok();
        let existing_doc = sidecar::load_or_default(&sidecar_path)?;
        self.check_stem_owner(&existing_doc, &dest_str, &sidecar_path)?;

        let incoming = merge(&fields.to_sidecar(), &Sidecar::from_filename(&parse_filename(filename)));

        match self.store.find_by_path(&dest_str)? {
            None => {
                let merged = merge(&existing_doc, &incoming);
                self.create_record(filename, &stem, &dest_str, digest, bytes, merged, &sidecar_path)
            }
            Some(record) => {
                let mut base = existing_doc;
                base.assign_record(&record);
                let merged = merge(&base, &incoming);
                self.replace_record(filename, record, digest, bytes, merged, &sidecar_path, previous_sidecar)
            }
        }
    }

    /// A sidecar whose id names a live record stored under another path
    /// belongs to that record; reusing its stem would merge two paintings.
    fn check_stem_owner(&self, doc: &Sidecar, dest_str: &str, sidecar_path: &Path) -> Result<()> {
        let Some(owner_id) = doc.id else {
            return Ok(());
        };
        match self.store.get(owner_id) {
            Ok(owner) if owner.file_path != dest_str => Err(CatalogError::Validation(format!(
                "sidecar {} already belongs to painting {} ({})",
                sidecar_path.display(),
                owner.id,
                owner.file_path
            ))),
            Ok(_) => Ok(()),
            Err(CatalogError::NotFound(_)) => {
                debug!("Sidecar {:?} refers to deleted painting {}", sidecar_path, owner_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_record(
        &self,
        filename: &str,
        stem: &str,
        dest_str: &str,
        digest: &str,
        bytes: Option<&[u8]>,
        merged: Sidecar,
        sidecar_path: &Path,
    ) -> Result<UploadOutcome> {
        let written = match bytes {
            Some(bytes) => Some(self.assets.save(filename, bytes)?),
            None => None,
        };
        let remove_written = || {
            if let Some(ref path) = written {
                if let Err(e) = fs::remove_file(path) {
                    warn!("Could not remove {:?} after failed upload: {}", path, e);
                }
            }
        };

        let new = merged.to_new_painting(digest, dest_str, stem);
        let id = match self.store.insert(&new) {
            Ok(id) => id,
            Err(CatalogError::DuplicateFingerprint { existing_id, .. }) => {
                // Lost a race with a concurrent upload of the same bytes.
                if self.store.get(existing_id).map(|p| p.file_path != dest_str).unwrap_or(true) {
                    remove_written();
                }
                return Ok(UploadOutcome::Skipped {
                    existing_id,
                    file_hash: digest.to_string(),
                });
            }
            Err(e) => {
                remove_written();
                return Err(e);
            }
        };

        let written_doc = self.store.get(id).and_then(|painting| {
            let mut doc = merged;
            doc.assign_record(&painting);
            sidecar::write(sidecar_path, &doc)
        });
        if let Err(e) = written_doc {
            warn!("Sidecar write for {} failed, rolling back: {}", filename, e);
            if let Err(undo) = self.store.delete(id) {
                warn!("Could not remove row {} during rollback: {}", id, undo);
            }
            remove_written();
            return Err(e);
        }

        info!("Cataloged {} as painting {}", filename, id);
        Ok(UploadOutcome::Uploaded {
            id,
            file_hash: digest.to_string(),
            sidecar_path: sidecar_path.to_path_buf(),
        })
    }

    /// Rebinds an existing record to new bytes, writing file, row and
    /// sidecar in that order. The previous file is parked in the trash until
    /// the sidecar is written, so every failure can put the old state back.
    #[allow(clippy::too_many_arguments)]
    fn replace_record(
        &self,
        filename: &str,
        record: Painting,
        digest: &str,
        bytes: Option<&[u8]>,
        merged: Sidecar,
        sidecar_path: &Path,
        previous_sidecar: Option<Vec<u8>>,
    ) -> Result<UploadOutcome> {
        let dest = PathBuf::from(&record.file_path);
        let (written, parked) = match bytes {
            Some(bytes) => {
                let staged = self.assets.stage(filename, bytes)?;
                let parked = if dest.exists() {
                    match self.trash.move_to_trash(&dest) {
                        Ok(file) => Some(file),
                        Err(e) => {
                            staged.discard();
                            return Err(e);
                        }
                    }
                } else {
                    None
                };
                match staged.commit() {
                    Ok(path) => (Some(path), parked),
                    Err(e) => {
                        self.restore_all(parked.as_slice());
                        return Err(e);
                    }
                }
            }
            None => (None, None),
        };
        let undo_file = || {
            if let Some(ref path) = written {
                if let Err(e) = fs::remove_file(path) {
                    warn!("Could not remove {:?} during rollback: {}", path, e);
                }
            }
            self.restore_all(parked.as_slice());
        };

        let mut patch = merged.record_patch(&record);
        patch.file_hash = Some(digest.to_string());
        let updated = match self.store.update(record.id, &patch) {
            Ok(updated) => updated,
            Err(e) => {
                undo_file();
                return Err(e);
            }
        };

        let mut doc = merged;
        doc.assign_record(&updated);
        if let Err(e) = sidecar::write(sidecar_path, &doc) {
            warn!("Sidecar write for {} failed, rolling back: {}", filename, e);
            if let Err(undo) = self.store.update(record.id, &PaintingPatch::restoring(&record)) {
                warn!("Could not revert row {}: {}", record.id, undo);
            }
            if let Err(undo) = sidecar::restore(sidecar_path, previous_sidecar.as_deref()) {
                warn!("Could not restore sidecar {:?}: {}", sidecar_path, undo);
            }
            undo_file();
            return Err(e);
        }

        if let Some(ref file) = parked {
            if let Err(e) = self.trash.purge(file) {
                warn!("Could not purge {:?}: {}", file.trash_path, e);
            }
        }

        info!("Replaced asset of painting {} with {}", record.id, filename);
        Ok(UploadOutcome::Replaced {
            id: record.id,
            file_hash: digest.to_string(),
            sidecar_path: sidecar_path.to_path_buf(),
        })
    }

    pub fn get(&self, id: i64) -> Result<Painting> {
        self.store.get(id)
    }

    pub fn find_by_fingerprint(&self, digest: &str) -> Result<Option<Painting>> {
        self.store.find_by_fingerprint(digest)
    }

    pub fn list(&self, filter: &PaintingFilter, offset: usize, limit: usize) -> Result<Page> {
        let (total, items) = self.store.list(filter, offset, limit)?;
        Ok(Page::new(total, offset, limit, items))
    }

    pub fn search(&self, filter: &PaintingFilter) -> Result<SearchResult> {
        let items = self.store.search(filter)?;
        Ok(SearchResult {
            total: items.len(),
            items,
        })
    }

    /// Every record, for aggregation and export.
    pub fn snapshot(&self) -> Result<Vec<Painting>> {
        self.store.search(&PaintingFilter::default())
    }

    pub fn count(&self) -> Result<usize> {
        self.store.count()
    }

    pub fn authors(&self, dynasty: Option<&str>) -> Result<Vec<String>> {
        self.store.authors(dynasty)
    }

    pub fn works_by_author(&self, author: &str) -> Result<Vec<Painting>> {
        let filter = PaintingFilter {
            author: Some(author.to_string()),
            ..Default::default()
        };
        let works = self.store.search(&filter)?;
        if works.is_empty() {
            return Err(CatalogError::not_found(format!("works by {}", author)));
        }
        Ok(works)
    }

    pub fn storage_summary(&self) -> StorageSummary {
        self.assets.storage_summary(&self.upload.allowed_extensions)
    }

    /// Reads one stored image, addressed by record id or by file name.
    /// A target that parses as an integer is taken as an id.
    pub fn read_asset(&self, target: &str) -> Result<StoredImage> {
        let path = match target.parse::<i64>() {
            Ok(id) => PathBuf::from(self.store.get(id)?.file_path),
            Err(_) => self.assets.asset_path(target)?,
        };
        let bytes = self.assets.read_image(&path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| target.to_string());
        Ok(StoredImage { filename, bytes })
    }

    /// Files the trash currently holds.
    pub fn trash_contents(&self) -> Result<Vec<PathBuf>> {
        self.trash.list()
    }

    fn sidecar_path_for(&self, painting: &Painting) -> PathBuf {
        self.assets.sidecar_path(&file_stem(&painting.file_path))
    }

    /// The sidecar document of a record.
    pub fn sidecar(&self, id: i64) -> Result<Sidecar> {
        let painting = self.store.get(id)?;
        let path = self.assets.check_sidecar(&self.sidecar_path_for(&painting))?;
        sidecar::read(&path)
    }

    pub fn sidecar_by_fingerprint(&self, digest: &str) -> Result<Sidecar> {
        let painting = self
            .store
            .find_by_fingerprint(digest)?
            .ok_or_else(|| CatalogError::not_found(format!("fingerprint {}", digest)))?;
        self.sidecar(painting.id)
    }

    /// Overwrites the patched row fields and rewrites the sidecar to match.
    /// The row is reverted when the sidecar cannot be written.
    pub fn update(&self, id: i64, patch: &PaintingPatch) -> Result<Painting> {
        if patch.file_hash.is_some() {
            return Err(CatalogError::Validation(
                "the content fingerprint cannot be edited".to_string(),
            ));
        }
        if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(CatalogError::Validation("title must not be empty".to_string()));
        }

        let previous = self.store.get(id)?;
        let updated = self.store.update(id, patch)?;
        self.sync_sidecar(&previous, &updated, None)?;
        Ok(updated)
    }

    /// Applies explicit edits to the extended sidecar fields. Values in
    /// `changes` replace stored ones; row fields among them update the row too.
    pub fn edit_metadata(&self, id: i64, changes: &Sidecar) -> Result<Sidecar> {
        let previous = self.store.get(id)?;
        let path = self.assets.check_sidecar(&self.sidecar_path_for(&previous))?;

        let mut existing = sidecar::load_or_default(&path)?;
        existing.assign_record(&previous);
        let mut edits = changes.clone();
        edits.id = None;
        edits.file_hash = None;
        edits.file_path = None;
        edits.created_at = None;
        let overlay = merge(&edits, &existing);

        let patch = overlay.record_patch(&previous);
        let updated = if patch.is_empty() {
            previous.clone()
        } else {
            self.store.update(id, &patch)?
        };
        self.sync_sidecar(&previous, &updated, Some(overlay))
    }

    /// Writes the sidecar of `updated`, reverting the row to `previous` on failure.
    fn sync_sidecar(&self, previous: &Painting, updated: &Painting, doc: Option<Sidecar>) -> Result<Sidecar> {
        let result = self
            .assets
            .check_sidecar(&self.sidecar_path_for(updated))
            .and_then(|path| {
                let mut doc = match doc {
                    Some(doc) => doc,
                    None => sidecar::load_or_default(&path)?,
                };
                doc.assign_record(updated);
                sidecar::write(&path, &doc)?;
                Ok(doc)
            });

        if let Err(ref e) = result {
            if previous != updated {
                warn!("Sidecar sync for painting {} failed, reverting row: {}", updated.id, e);
                if let Err(undo) = self.store.update(updated.id, &PaintingPatch::restoring(previous)) {
                    warn!("Could not revert row {}: {}", updated.id, undo);
                }
            }
        }
        result
    }

    /// Merges an enrichment suggestion into a record's sidecar without
    /// overwriting anything, and fills row fields that are still empty.
    /// Returns the names of the fields that gained a value.
    pub fn apply_enrichment(&self, id: i64, suggestion: &Sidecar) -> Result<Vec<&'static str>> {
        let painting = self.store.get(id)?;
        let path = self.assets.check_sidecar(&self.sidecar_path_for(&painting))?;

        let mut existing = sidecar::load_or_default(&path)?;
        existing.assign_record(&painting);

        let mut suggestion = suggestion.clone();
        suggestion.id = None;
        suggestion.file_hash = None;
        suggestion.file_path = None;
        suggestion.created_at = None;
        suggestion.unrecognized.clear();

        let merged = merge(&existing, &suggestion);
        let filled = merged.filled_since(&existing);
        if filled.is_empty() {
            return Ok(filled);
        }

        let patch = merged.record_patch(&painting);
        let updated = if patch.is_empty() {
            painting.clone()
        } else {
            self.store.update(id, &patch)?
        };
        self.sync_sidecar(&painting, &updated, Some(merged))?;
        Ok(filled)
    }

    /// Removes a record together with its image and sidecar.
    ///
    /// Both files are moved to the trash before the row is deleted and put
    /// back if the delete fails. Files that were already missing are reported.
    pub fn delete(&self, id: i64) -> Result<DeleteOutcome> {
        let painting = self.store.get(id)?;
        let image = self.assets.check_image(Path::new(&painting.file_path))?;
        let sidecar_path = self.assets.check_sidecar(&self.sidecar_path_for(&painting))?;

        let mut trashed: Vec<TrashedFile> = Vec::new();
        let mut missing = Vec::new();
        for path in [image, sidecar_path] {
            if !path.exists() {
                warn!("Painting {} references missing file {:?}", id, path);
                missing.push(path);
                continue;
            }
            match self.trash.move_to_trash(&path) {
                Ok(file) => trashed.push(file),
                Err(e) => {
                    self.restore_all(&trashed);
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.store.delete(id) {
            self.restore_all(&trashed);
            return Err(e);
        }

        for file in &trashed {
            if let Err(e) = self.trash.purge(file) {
                warn!("Could not purge {:?}: {}", file.trash_path, e);
            }
        }

        info!("Deleted painting {}", id);
        Ok(DeleteOutcome {
            id,
            removed: trashed.into_iter().map(|f| f.original_path).collect(),
            missing,
        })
    }

    fn restore_all(&self, trashed: &[TrashedFile]) {
        for file in trashed {
            if let Err(e) = self.trash.restore(file) {
                warn!("Could not restore {:?}: {}", file.original_path, e);
            }
        }
    }

    /// Finds images and sidecars with no catalog row. With `apply`, moves them
    /// to the trash directory.
    pub fn sweep(&self, apply: bool) -> Result<SweepReport> {
        let paintings = self.snapshot()?;
        let paths: HashSet<&str> = paintings.iter().map(|p| p.file_path.as_str()).collect();
        let stems: HashSet<String> = paintings.iter().map(|p| file_stem(&p.file_path)).collect();

        let mut report = SweepReport {
            orphan_images: self
                .assets
                .list_images(&self.upload.allowed_extensions)
                .filter(|p| !paths.contains(&*p.to_string_lossy()))
                .collect(),
            orphan_sidecars: self
                .assets
                .list_sidecars()
                .filter(|p| {
                    let stem = p.file_stem().map(|s| s.to_string_lossy().to_string());
                    !stem.is_some_and(|s| stems.contains(&s))
                })
                .collect(),
            trashed: 0,
        };
        report.orphan_images.sort();
        report.orphan_sidecars.sort();

        if apply {
            for path in report.orphan_images.iter().chain(&report.orphan_sidecars) {
                match self.trash.move_to_trash(path) {
                    Ok(_) => report.trashed += 1,
                    Err(e) => warn!("Could not trash orphan {:?}: {}", path, e),
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::db::MemoryCatalog;

    /// Catalog over an in-memory store with storage rooted at `root`.
    pub fn catalog(root: &Path) -> Catalog {
        Catalog::new(
            Box::new(MemoryCatalog::new()),
            AssetStore::new(root.join("images"), root.join("metadata")),
            TrashBin::new(root.join(".trash")),
            UploadConfig::default(),
        )
        .unwrap()
    }

    /// A small PNG whose bytes differ per seed.
    pub fn png(seed: u8) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([seed, 255 - seed, 7]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }
}
