mod schema;
pub mod backend;
pub mod memory;
pub mod sqlite;
pub mod vocabulary;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use backend::CatalogBackend;
pub use memory::MemoryCatalog;
pub use schema::SCHEMA;
pub use sqlite::SqliteCatalog;
pub use vocabulary::{Category, InkColorStyle, Technique};

/// One cataloged painting: the queryable index row for an asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Painting {
    pub id: i64,
    pub file_hash: String,
    pub file_path: String,
    pub title: String,
    pub author: Option<String>,
    pub dynasty: Option<String>,
    pub category: Option<Category>,
    pub technique: Option<Technique>,
    pub ink_color_style: Option<InkColorStyle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a row that does not exist yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPainting {
    pub file_hash: String,
    pub file_path: String,
    pub title: String,
    pub author: Option<String>,
    pub dynasty: Option<String>,
    pub category: Option<Category>,
    pub technique: Option<Technique>,
    pub ink_color_style: Option<InkColorStyle>,
}

/// Partial update. `None` leaves a column untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaintingPatch {
    pub title: Option<String>,
    pub author: Option<Option<String>>,
    pub dynasty: Option<Option<String>>,
    pub category: Option<Option<Category>>,
    pub technique: Option<Option<Technique>>,
    pub ink_color_style: Option<Option<InkColorStyle>>,
    /// Rebinds the row to new content. Used when an asset file is replaced.
    pub file_hash: Option<String>,
}

impl PaintingPatch {
    pub fn is_empty(&self) -> bool {
        *self == PaintingPatch::default()
    }

    /// Patch that restores every mutable column of `previous`.
    pub fn restoring(previous: &Painting) -> Self {
        Self {
            title: Some(previous.title.clone()),
            author: Some(previous.author.clone()),
            dynasty: Some(previous.dynasty.clone()),
            category: Some(previous.category),
            technique: Some(previous.technique),
            ink_color_style: Some(previous.ink_color_style),
            file_hash: Some(previous.file_hash.clone()),
        }
    }

    /// Applies the patch to an in-memory row. Timestamps are left to the store.
    pub(crate) fn apply_to(&self, painting: &mut Painting) {
        if let Some(ref title) = self.title {
            painting.title = title.clone();
        }
        if let Some(ref author) = self.author {
            painting.author = author.clone();
        }
        if let Some(ref dynasty) = self.dynasty {
            painting.dynasty = dynasty.clone();
        }
        if let Some(category) = self.category {
            painting.category = category;
        }
        if let Some(technique) = self.technique {
            painting.technique = technique;
        }
        if let Some(style) = self.ink_color_style {
            painting.ink_color_style = style;
        }
        if let Some(ref hash) = self.file_hash {
            painting.file_hash = hash.clone();
        }
    }
}

/// Conjunctive filter shared by listing, search and export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaintingFilter {
    pub dynasty: Option<String>,
    pub category: Option<Category>,
    pub author: Option<String>,
}

impl PaintingFilter {
    pub fn matches(&self, painting: &Painting) -> bool {
        if let Some(ref dynasty) = self.dynasty {
            if painting.dynasty.as_ref() != Some(dynasty) {
                return false;
            }
        }
        if let Some(category) = self.category {
            if painting.category != Some(category) {
                return false;
            }
        }
        if let Some(ref author) = self.author {
            if painting.author.as_ref() != Some(author) {
                return false;
            }
        }
        true
    }
}

/// One page of a filtered listing.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub total: usize,
    pub page: usize,
    pub total_pages: usize,
    pub items: Vec<Painting>,
}

impl Page {
    pub fn new(total: usize, offset: usize, limit: usize, items: Vec<Painting>) -> Self {
        let (page, total_pages) = if limit == 0 {
            (1, 0)
        } else {
            (offset / limit + 1, total.div_ceil(limit))
        };
        Self {
            total,
            page,
            total_pages,
            items,
        }
    }
}

/// Unpaginated search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub total: usize,
    pub items: Vec<Painting>,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn new_painting(hash: &str, title: &str, dynasty: Option<&str>) -> NewPainting {
        NewPainting {
            file_hash: hash.to_string(),
            file_path: format!("/data/images/{}.jpg", hash),
            title: title.to_string(),
            author: None,
            dynasty: dynasty.map(str::to_string),
            category: None,
            technique: None,
            ink_color_style: None,
        }
    }
}
