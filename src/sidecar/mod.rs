//! JSON sidecar documents and the non-destructive merge policy.
//!
//! A sidecar is the long-form record of one painting, stored as
//! `<metadata_dir>/<stem>.json` next to the catalog row that indexes it.
//! Documents are combined with [`merge`]: a field is taken from the incoming
//! document only when the existing document has no value for it, so values
//! already written are never overwritten by a later parse or enrichment pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::db::vocabulary::lenient;
use crate::db::{Category, InkColorStyle, NewPainting, Painting, PaintingPatch, Technique};
use crate::error::{CatalogError, Result};
use crate::scanner::filename::FilenameFields;
use crate::storage::write_synced;

/// Where a tag came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagSource {
    #[default]
    Auto,
    Manual,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub tag_name: String,
    #[serde(default = "full_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub source: TagSource,
}

fn full_confidence() -> f32 {
    1.0
}

impl Tag {
    pub fn auto(name: &str) -> Self {
        Self {
            tag_name: name.to_string(),
            confidence: 1.0,
            source: TagSource::Auto,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reference {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub author: String,
    pub year: Option<i32>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewStatus {
    pub is_approved: bool,
    pub reviewer: Option<String>,
    pub review_date: Option<DateTime<Utc>>,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Annotations {
    pub scene_elements: Vec<String>,
    pub technique_details: Vec<String>,
    pub composition: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoricalContext {
    pub era_background: Option<String>,
    pub artist_biography: Option<String>,
}

/// The sidecar document. Every field is optional; an empty list or map
/// counts as "no value" for merging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sidecar {
    // Identity
    pub id: Option<i64>,
    pub file_hash: Option<String>,
    pub file_path: Option<String>,

    // Descriptive fields mirrored by the catalog row
    pub title: Option<String>,
    #[serde(deserialize_with = "author_lenient")]
    pub author: Option<String>,
    pub dynasty: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub category: Option<Category>,
    #[serde(deserialize_with = "lenient")]
    pub technique: Option<Technique>,
    #[serde(deserialize_with = "lenient")]
    pub ink_color_style: Option<InkColorStyle>,

    // Extended fields
    pub artwork_form: Option<String>,
    pub material: Option<String>,
    pub dimensions: Option<String>,
    pub source_institution: Option<String>,
    pub tags: Vec<Tag>,
    pub date_of_creation: Option<String>,
    pub cultural_context: Option<String>,
    pub description: Option<String>,
    pub annotations: Option<Annotations>,
    pub historical_context: Option<HistoricalContext>,
    pub references: Vec<Reference>,
    pub review_status: Option<ReviewStatus>,
    pub ext_fields: BTreeMap<String, Value>,
    pub created_at: Option<DateTime<Utc>>,

    /// Keys this schema does not know. Kept as read, never merged in.
    #[serde(flatten)]
    pub unrecognized: Map<String, Value>,
}

/// Authors may be recorded as a list of names; they are joined with `、`.
fn author_lenient<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Array(items)) => {
            let names: Vec<&str> = items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .collect();
            (!names.is_empty()).then(|| names.join("、"))
        }
        _ => None,
    })
}

fn fill<T: Clone>(existing: &Option<T>, incoming: &Option<T>) -> Option<T> {
    existing.clone().or_else(|| incoming.clone())
}

fn fill_list<T: Clone>(existing: &[T], incoming: &[T]) -> Vec<T> {
    if existing.is_empty() {
        incoming.to_vec()
    } else {
        existing.to_vec()
    }
}

fn fill_map(existing: &BTreeMap<String, Value>, incoming: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    let mut merged = existing.clone();
    for (key, value) in incoming {
        if value.is_null() {
            continue;
        }
        match merged.get(key) {
            Some(current) if !current.is_null() => {}
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Non-destructive merge: each field of `existing` that holds a value is
/// kept; each field without one takes the value from `incoming`.
///
/// Extension fields merge per key under the same rule. Unrecognized keys are
/// carried over from `existing` only.
pub fn merge(existing: &Sidecar, incoming: &Sidecar) -> Sidecar {
    // Exhaustive destructuring: adding a field to `Sidecar` must be reflected here.
    let Sidecar {
        id,
        file_hash,
        file_path,
        title,
        author,
        dynasty,
        category,
        technique,
        ink_color_style,
        artwork_form,
        material,
        dimensions,
        source_institution,
        tags,
        date_of_creation,
        cultural_context,
        description,
        annotations,
        historical_context,
        references,
        review_status,
        ext_fields,
        created_at,
        unrecognized,
    } = existing;

    Sidecar {
        id: fill(id, &incoming.id),
        file_hash: fill(file_hash, &incoming.file_hash),
        file_path: fill(file_path, &incoming.file_path),
        title: fill(title, &incoming.title),
        author: fill(author, &incoming.author),
        dynasty: fill(dynasty, &incoming.dynasty),
        category: fill(category, &incoming.category),
        technique: fill(technique, &incoming.technique),
        ink_color_style: fill(ink_color_style, &incoming.ink_color_style),
        artwork_form: fill(artwork_form, &incoming.artwork_form),
        material: fill(material, &incoming.material),
        dimensions: fill(dimensions, &incoming.dimensions),
        source_institution: fill(source_institution, &incoming.source_institution),
        tags: fill_list(tags, &incoming.tags),
        date_of_creation: fill(date_of_creation, &incoming.date_of_creation),
        cultural_context: fill(cultural_context, &incoming.cultural_context),
        description: fill(description, &incoming.description),
        annotations: fill(annotations, &incoming.annotations),
        historical_context: fill(historical_context, &incoming.historical_context),
        references: fill_list(references, &incoming.references),
        review_status: fill(review_status, &incoming.review_status),
        ext_fields: fill_map(ext_fields, &incoming.ext_fields),
        created_at: fill(created_at, &incoming.created_at),
        unrecognized: unrecognized.clone(),
    }
}

impl Sidecar {
    /// Candidate document from a parsed file name.
    pub fn from_filename(fields: &FilenameFields) -> Self {
        Self {
            title: Some(fields.title.clone()),
            author: fields.author.clone(),
            dynasty: fields.dynasty.clone(),
            category: fields.category,
            technique: fields.technique,
            ink_color_style: fields.ink_color_style,
            dimensions: fields.dimensions.clone(),
            material: fields.material.clone(),
            source_institution: fields.museum.clone(),
            tags: fields.tags.iter().map(|t| Tag::auto(t)).collect(),
            ..Default::default()
        }
    }

    /// Document holding the identity and descriptive fields of a row.
    pub fn from_painting(painting: &Painting) -> Self {
        let mut doc = Self::default();
        doc.assign_record(painting);
        doc
    }

    /// Overwrites identity, descriptive fields and the creation time with the
    /// row's values so the document agrees with the catalog.
    pub fn assign_record(&mut self, painting: &Painting) {
        self.id = Some(painting.id);
        self.file_hash = Some(painting.file_hash.clone());
        self.file_path = Some(painting.file_path.clone());
        self.title = Some(painting.title.clone());
        self.author = painting.author.clone();
        self.dynasty = painting.dynasty.clone();
        self.category = painting.category;
        self.technique = painting.technique;
        self.ink_color_style = painting.ink_color_style;
        self.created_at = Some(painting.created_at);
    }

    /// Row fields for a new catalog entry, taken from this document.
    pub fn to_new_painting(&self, file_hash: &str, file_path: &str, fallback_title: &str) -> NewPainting {
        NewPainting {
            file_hash: file_hash.to_string(),
            file_path: file_path.to_string(),
            title: self
                .title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| fallback_title.to_string()),
            author: self.author.clone(),
            dynasty: self.dynasty.clone(),
            category: self.category,
            technique: self.technique,
            ink_color_style: self.ink_color_style,
        }
    }

    /// Patch that brings `painting`'s descriptive columns in line with this
    /// document. Columns that already agree are left out.
    pub fn record_patch(&self, painting: &Painting) -> PaintingPatch {
        let mut patch = PaintingPatch::default();
        if let Some(ref title) = self.title {
            if !title.trim().is_empty() && *title != painting.title {
                patch.title = Some(title.clone());
            }
        }
        if self.author != painting.author {
            patch.author = Some(self.author.clone());
        }
        if self.dynasty != painting.dynasty {
            patch.dynasty = Some(self.dynasty.clone());
        }
        if self.category != painting.category {
            patch.category = Some(self.category);
        }
        if self.technique != painting.technique {
            patch.technique = Some(self.technique);
        }
        if self.ink_color_style != painting.ink_color_style {
            patch.ink_color_style = Some(self.ink_color_style);
        }
        patch
    }

    /// Names of the fields that hold a value.
    pub fn populated_fields(&self) -> Vec<&'static str> {
        let Sidecar {
            id,
            file_hash,
            file_path,
            title,
            author,
            dynasty,
            category,
            technique,
            ink_color_style,
            artwork_form,
            material,
            dimensions,
            source_institution,
            tags,
            date_of_creation,
            cultural_context,
            description,
            annotations,
            historical_context,
            references,
            review_status,
            ext_fields,
            created_at,
            unrecognized: _,
        } = self;

        let flags = [
            ("id", id.is_some()),
            ("file_hash", file_hash.is_some()),
            ("file_path", file_path.is_some()),
            ("title", title.is_some()),
            ("author", author.is_some()),
            ("dynasty", dynasty.is_some()),
            ("category", category.is_some()),
            ("technique", technique.is_some()),
            ("ink_color_style", ink_color_style.is_some()),
            ("artwork_form", artwork_form.is_some()),
            ("material", material.is_some()),
            ("dimensions", dimensions.is_some()),
            ("source_institution", source_institution.is_some()),
            ("tags", !tags.is_empty()),
            ("date_of_creation", date_of_creation.is_some()),
            ("cultural_context", cultural_context.is_some()),
            ("description", description.is_some()),
            ("annotations", annotations.is_some()),
            ("historical_context", historical_context.is_some()),
            ("references", !references.is_empty()),
            ("review_status", review_status.is_some()),
            ("ext_fields", ext_fields.values().any(|v| !v.is_null())),
            ("created_at", created_at.is_some()),
        ];
        flags
            .into_iter()
            .filter_map(|(name, set)| set.then_some(name))
            .collect()
    }

    /// Fields populated in `self` that were not populated in `before`.
    pub fn filled_since(&self, before: &Sidecar) -> Vec<&'static str> {
        let previous = before.populated_fields();
        self.populated_fields()
            .into_iter()
            .filter(|f| !previous.contains(f))
            .collect()
    }
}

/// Reads a sidecar, failing with `NotFound` when the file is absent.
pub fn read(path: &Path) -> Result<Sidecar> {
    let content = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            CatalogError::not_found(format!("sidecar {}", path.display()))
        }
        _ => CatalogError::Io(e),
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// Reads a sidecar for merging. A missing file yields an empty document.
///
/// An unparseable file is copied to `<name>.bak` and treated as empty so the
/// upload can proceed.
pub fn load_or_default(path: &Path) -> Result<Sidecar> {
    match read(path) {
        Ok(doc) => Ok(doc),
        Err(CatalogError::NotFound(_)) => Ok(Sidecar::default()),
        Err(CatalogError::Serialization(e)) => {
            let backup = backup_path(path);
            warn!("Unreadable sidecar {:?} ({}), preserved as {:?}", path, e, backup);
            fs::copy(path, &backup).map_err(|e| CatalogError::storage_write(&backup, e))?;
            Ok(Sidecar::default())
        }
        Err(e) => Err(e),
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

/// Writes the document as pretty-printed UTF-8 JSON, replacing the file atomically.
pub fn write(path: &Path, doc: &Sidecar) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)?;
    replace_file(path, json.as_bytes())
}

/// Puts a sidecar back to its earlier raw contents, or removes it when there
/// was none.
pub(crate) fn restore(path: &Path, previous: Option<&[u8]>) -> Result<()> {
    match previous {
        Some(bytes) => replace_file(path, bytes),
        None => match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CatalogError::storage_write(path, e)),
        },
    }
}

fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CatalogError::storage_write(parent, e))?;
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp = path.with_file_name(temp_name);

    write_synced(&temp, bytes)?;
    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        CatalogError::storage_write(path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn populated(seed: &str) -> Sidecar {
        Sidecar {
            id: Some(seed.len() as i64),
            file_hash: Some(format!("{}-hash", seed)),
            file_path: Some(format!("/images/{}.jpg", seed)),
            title: Some(format!("{}-title", seed)),
            author: Some(format!("{}-author", seed)),
            dynasty: Some(format!("{}-dynasty", seed)),
            category: Some(Category::Landscape),
            technique: Some(Technique::Freehand),
            ink_color_style: Some(InkColorStyle::InkWash),
            artwork_form: Some("立轴".to_string()),
            material: Some(format!("{}-material", seed)),
            dimensions: Some("180x96".to_string()),
            source_institution: Some(format!("{}-museum", seed)),
            tags: vec![Tag::auto(seed)],
            date_of_creation: Some(format!("{}-date", seed)),
            cultural_context: Some(format!("{}-context", seed)),
            description: Some(format!("{}-description", seed)),
            annotations: Some(Annotations {
                composition: Some(seed.to_string()),
                ..Default::default()
            }),
            historical_context: Some(HistoricalContext {
                era_background: Some(seed.to_string()),
                artist_biography: None,
            }),
            references: vec![Reference {
                kind: "book".to_string(),
                title: seed.to_string(),
                author: seed.to_string(),
                year: Some(1990),
                link: None,
            }],
            review_status: Some(ReviewStatus::default()),
            ext_fields: BTreeMap::from([("seals".to_string(), json!([seed]))]),
            created_at: Some(Utc::now()),
            unrecognized: Map::new(),
        }
    }

    #[test]
    fn test_merge_never_overwrites_values() {
        let existing = populated("old");
        let mut incoming = populated("newer");
        incoming.category = Some(Category::Person);
        incoming.technique = Some(Technique::FineBrush);

        assert_eq!(merge(&existing, &incoming), existing);
    }

    #[test]
    fn test_merge_fills_missing_values() {
        let incoming = populated("new");
        assert_eq!(merge(&Sidecar::default(), &incoming), incoming);
    }

    #[test]
    fn test_merge_is_per_field() {
        let existing = Sidecar {
            title: Some("清明上河图".to_string()),
            author: None,
            ..Default::default()
        };
        let incoming = Sidecar {
            title: Some("别名".to_string()),
            author: Some("张择端".to_string()),
            dynasty: None,
            ..Default::default()
        };

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.title.as_deref(), Some("清明上河图"));
        assert_eq!(merged.author.as_deref(), Some("张择端"));
        assert_eq!(merged.dynasty, None);
    }

    #[test]
    fn test_extension_fields_merge_per_key() {
        let existing = Sidecar {
            ext_fields: BTreeMap::from([
                ("seals".to_string(), json!(["闲章"])),
                ("inscriptions".to_string(), Value::Null),
            ]),
            ..Default::default()
        };
        let incoming = Sidecar {
            ext_fields: BTreeMap::from([
                ("seals".to_string(), json!(["收藏印"])),
                ("inscriptions".to_string(), json!("淡墨题跋四行")),
                ("colophons".to_string(), json!(2)),
            ]),
            ..Default::default()
        };

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.ext_fields["seals"], json!(["闲章"]));
        assert_eq!(merged.ext_fields["inscriptions"], json!("淡墨题跋四行"));
        assert_eq!(merged.ext_fields["colophons"], json!(2));
    }

    #[test]
    fn test_unrecognized_keys_survive_but_are_not_absorbed() {
        let existing: Sidecar = serde_json::from_value(json!({
            "title": "山水图",
            "legacy_note": "kept"
        }))
        .unwrap();
        let mut incoming = Sidecar::default();
        incoming
            .unrecognized
            .insert("injected".to_string(), json!("dropped"));

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.unrecognized.get("legacy_note"), Some(&json!("kept")));
        assert!(merged.unrecognized.get("injected").is_none());
    }

    #[test]
    fn test_lenient_reading() {
        let doc: Sidecar = serde_json::from_value(json!({
            "author": ["王时敏", "王鉴"],
            "category": "山水",
            "technique": "泼墨",
            "ink_color_style": "light_crimson",
            "tags": [{"tag_name": "山水"}]
        }))
        .unwrap();

        assert_eq!(doc.author.as_deref(), Some("王时敏、王鉴"));
        assert_eq!(doc.category, Some(Category::Landscape));
        assert_eq!(doc.technique, None);
        assert_eq!(doc.ink_color_style, Some(InkColorStyle::LightCrimson));
        assert_eq!(doc.tags[0].confidence, 1.0);
        assert_eq!(doc.tags[0].source, TagSource::Auto);
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta").join("清明上河图.json");
        let doc = populated("scroll");

        write(&path, &doc).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"ink_color_style\": \"水墨\""));
        assert_eq!(read(&path).unwrap(), doc);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempdir().unwrap();
        let doc = load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(doc, Sidecar::default());
        assert!(matches!(
            read(&dir.path().join("absent.json")),
            Err(CatalogError::NotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_sidecar_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();

        let doc = load_or_default(&path).unwrap();
        assert_eq!(doc, Sidecar::default());
        assert_eq!(
            fs::read_to_string(dir.path().join("broken.json.bak")).unwrap(),
            "{not json"
        );
    }

    #[test]
    fn test_restore_previous_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.json");
        fs::write(&path, "{broken").unwrap();

        write(&path, &populated("a")).unwrap();
        restore(&path, Some(b"{broken")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{broken");

        restore(&path, None).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_filled_since() {
        let before = Sidecar {
            title: Some("t".to_string()),
            ..Default::default()
        };
        let after = Sidecar {
            title: Some("t".to_string()),
            description: Some("d".to_string()),
            tags: vec![Tag::auto("x")],
            ..Default::default()
        };
        assert_eq!(after.filled_since(&before), vec!["tags", "description"]);
    }

    #[test]
    fn test_record_patch_only_lists_differences() {
        let now = Utc::now();
        let painting = Painting {
            id: 3,
            file_hash: "h".to_string(),
            file_path: "/images/a.jpg".to_string(),
            title: "山水图".to_string(),
            author: None,
            dynasty: Some("清代".to_string()),
            category: None,
            technique: None,
            ink_color_style: None,
            created_at: now,
            updated_at: now,
        };
        let mut doc = Sidecar::from_painting(&painting);
        assert!(doc.record_patch(&painting).is_empty());

        doc.author = Some("石涛".to_string());
        let patch = doc.record_patch(&painting);
        assert_eq!(patch.author, Some(Some("石涛".to_string())));
        assert_eq!(patch.dynasty, None);
    }
}
