//! Catalog store abstraction.
//!
//! Callers depend only on this trait. Two implementations exist: the
//! SQLite-backed [`SqliteCatalog`](super::SqliteCatalog) and the in-memory
//! [`MemoryCatalog`](super::MemoryCatalog) used by tests.

use crate::error::Result;

use super::{NewPainting, Painting, PaintingFilter, PaintingPatch};

/// Trait for catalog store implementations.
pub trait CatalogBackend: Send {
    /// Create tables and indexes if they do not exist yet.
    fn initialize(&self) -> Result<()>;

    /// Insert a row and return its id.
    ///
    /// Fails with `DuplicateFingerprint` when the fingerprint is already
    /// present. The check is part of the insert itself, not a prior lookup.
    fn insert(&self, painting: &NewPainting) -> Result<i64>;

    /// Look up a row by content fingerprint.
    fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Painting>>;

    /// Look up a row by the stored asset path.
    fn find_by_path(&self, file_path: &str) -> Result<Option<Painting>>;

    /// Fetch a row by id, failing with `NotFound`.
    fn get(&self, id: i64) -> Result<Painting>;

    /// Apply the keys present in `patch` and bump `updated_at`.
    fn update(&self, id: i64, patch: &PaintingPatch) -> Result<Painting>;

    /// Remove a row. Companion files are the caller's concern.
    fn delete(&self, id: i64) -> Result<()>;

    /// Filtered page of rows ordered by id, plus the unpaginated match count.
    fn list(&self, filter: &PaintingFilter, offset: usize, limit: usize) -> Result<(usize, Vec<Painting>)>;

    /// Every row matching the filter, ordered by id.
    fn search(&self, filter: &PaintingFilter) -> Result<Vec<Painting>>;

    /// Total number of rows.
    fn count(&self) -> Result<usize>;

    /// Distinct non-null authors, optionally restricted to one dynasty.
    fn authors(&self, dynasty: Option<&str>) -> Result<Vec<String>>;
}
