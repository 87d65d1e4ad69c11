//! In-memory catalog store, used by tests and dry runs.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::backend::CatalogBackend;
use super::{NewPainting, Painting, PaintingFilter, PaintingPatch};
use crate::error::{CatalogError, Result};

#[derive(Default)]
struct State {
    next_id: i64,
    rows: BTreeMap<i64, Painting>,
}

#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<State>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Rows are replaced whole, so a poisoned map is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl State {
    fn holder_of(&self, fingerprint: &str) -> Option<&Painting> {
        self.rows.values().find(|p| p.file_hash == fingerprint)
    }
}

impl CatalogBackend for MemoryCatalog {
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn insert(&self, painting: &NewPainting) -> Result<i64> {
        let mut state = self.state();
        if let Some(existing) = state.holder_of(&painting.file_hash) {
            return Err(CatalogError::DuplicateFingerprint {
                fingerprint: painting.file_hash.clone(),
                existing_id: existing.id,
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        let now = Utc::now();
        state.rows.insert(
            id,
            Painting {
                id,
                file_hash: painting.file_hash.clone(),
                file_path: painting.file_path.clone(),
                title: painting.title.clone(),
                author: painting.author.clone(),
                dynasty: painting.dynasty.clone(),
                category: painting.category,
                technique: painting.technique,
                ink_color_style: painting.ink_color_style,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Painting>> {
        Ok(self.state().holder_of(fingerprint).cloned())
    }

    fn find_by_path(&self, file_path: &str) -> Result<Option<Painting>> {
        Ok(self
            .state()
            .rows
            .values()
            .find(|p| p.file_path == file_path)
            .cloned())
    }

    fn get(&self, id: i64) -> Result<Painting> {
        self.state()
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| CatalogError::not_found(format!("painting {}", id)))
    }

    fn update(&self, id: i64, patch: &PaintingPatch) -> Result<Painting> {
        let mut state = self.state();
        if let Some(ref hash) = patch.file_hash {
            if let Some(holder) = state.holder_of(hash) {
                if holder.id != id {
                    return Err(CatalogError::DuplicateFingerprint {
                        fingerprint: hash.clone(),
                        existing_id: holder.id,
                    });
                }
            }
        }

        let painting = state
            .rows
            .get_mut(&id)
            .ok_or_else(|| CatalogError::not_found(format!("painting {}", id)))?;
        patch.apply_to(painting);
        painting.updated_at = Utc::now();
        Ok(painting.clone())
    }

    fn delete(&self, id: i64) -> Result<()> {
        self.state()
            .rows
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CatalogError::not_found(format!("painting {}", id)))
    }

    fn list(&self, filter: &PaintingFilter, offset: usize, limit: usize) -> Result<(usize, Vec<Painting>)> {
        let matches = self.search(filter)?;
        let total = matches.len();
        let page = matches.into_iter().skip(offset).take(limit).collect();
        Ok((total, page))
    }

    fn search(&self, filter: &PaintingFilter) -> Result<Vec<Painting>> {
        Ok(self
            .state()
            .rows
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.state().rows.len())
    }

    fn authors(&self, dynasty: Option<&str>) -> Result<Vec<String>> {
        let mut authors: Vec<String> = self
            .state()
            .rows
            .values()
            .filter(|p| dynasty.is_none() || p.dynasty.as_deref() == dynasty)
            .filter_map(|p| p.author.clone())
            .collect();
        authors.sort();
        authors.dedup();
        Ok(authors)
    }
}
