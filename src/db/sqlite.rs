//! SQLite backend implementation.

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;

use super::backend::CatalogBackend;
use super::schema::SCHEMA;
use super::{Category, InkColorStyle, NewPainting, Painting, PaintingFilter, PaintingPatch, Technique};
use crate::error::{CatalogError, Result};

const COLUMNS: &str = "id, file_hash, file_path, title, author, dynasty, \
                       category, technique, ink_color_style, created_at, updated_at";

pub struct SqliteCatalog {
    pub(crate) conn: Connection,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CatalogError::storage_write(parent, e))?;
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// Maps a unique-constraint failure on `file_hash` to `DuplicateFingerprint`.
    fn constraint_error(&self, err: rusqlite::Error, fingerprint: &str) -> CatalogError {
        if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
            if failure.code == ErrorCode::ConstraintViolation {
                if let Ok(Some(existing)) = self.find_by_fingerprint(fingerprint) {
                    return CatalogError::DuplicateFingerprint {
                        fingerprint: fingerprint.to_string(),
                        existing_id: existing.id,
                    };
                }
            }
        }
        err.into()
    }

    fn query_paintings(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Painting>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), row_to_painting)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_painting(row: &Row<'_>) -> rusqlite::Result<Painting> {
    Ok(Painting {
        id: row.get(0)?,
        file_hash: row.get(1)?,
        file_path: row.get(2)?,
        title: row.get(3)?,
        author: row.get(4)?,
        dynasty: row.get(5)?,
        category: row
            .get::<_, Option<String>>(6)?
            .as_deref()
            .and_then(Category::from_key),
        technique: row
            .get::<_, Option<String>>(7)?
            .as_deref()
            .and_then(Technique::from_key),
        ink_color_style: row
            .get::<_, Option<String>>(8)?
            .as_deref()
            .and_then(InkColorStyle::from_key),
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Builds a `WHERE` clause for the filter; conditions are joined with AND.
fn where_clause(filter: &PaintingFilter) -> (String, Vec<Value>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();

    if let Some(ref dynasty) = filter.dynasty {
        conditions.push("dynasty = ?");
        values.push(Value::Text(dynasty.clone()));
    }
    if let Some(category) = filter.category {
        conditions.push("category = ?");
        values.push(Value::Text(category.key().to_string()));
    }
    if let Some(ref author) = filter.author {
        conditions.push("author = ?");
        values.push(Value::Text(author.clone()));
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

impl CatalogBackend for SqliteCatalog {
    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn insert(&self, painting: &NewPainting) -> Result<i64> {
        let now = Utc::now();
        let result = self.conn.execute(
            r#"
            INSERT INTO paintings (file_hash, file_path, title, author, dynasty,
                                   category, technique, ink_color_style, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            "#,
            params![
                painting.file_hash,
                painting.file_path,
                painting.title,
                painting.author,
                painting.dynasty,
                painting.category.map(Category::key),
                painting.technique.map(Technique::key),
                painting.ink_color_style.map(InkColorStyle::key),
                now,
            ],
        );

        match result {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(e) => Err(self.constraint_error(e, &painting.file_hash)),
        }
    }

    fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Painting>> {
        let sql = format!("SELECT {} FROM paintings WHERE file_hash = ?", COLUMNS);
        let painting = self
            .conn
            .query_row(&sql, [fingerprint], row_to_painting)
            .optional()?;
        Ok(painting)
    }

    fn find_by_path(&self, file_path: &str) -> Result<Option<Painting>> {
        let sql = format!(
            "SELECT {} FROM paintings WHERE file_path = ? ORDER BY id LIMIT 1",
            COLUMNS
        );
        let painting = self
            .conn
            .query_row(&sql, [file_path], row_to_painting)
            .optional()?;
        Ok(painting)
    }

    fn get(&self, id: i64) -> Result<Painting> {
        let sql = format!("SELECT {} FROM paintings WHERE id = ?", COLUMNS);
        self.conn
            .query_row(&sql, [id], row_to_painting)
            .optional()?
            .ok_or_else(|| CatalogError::not_found(format!("painting {}", id)))
    }

    fn update(&self, id: i64, patch: &PaintingPatch) -> Result<Painting> {
        let mut painting = self.get(id)?;
        patch.apply_to(&mut painting);
        painting.updated_at = Utc::now();

        let result = self.conn.execute(
            r#"
            UPDATE paintings
            SET file_hash = ?1, title = ?2, author = ?3, dynasty = ?4,
                category = ?5, technique = ?6, ink_color_style = ?7, updated_at = ?8
            WHERE id = ?9
            "#,
            params![
                painting.file_hash,
                painting.title,
                painting.author,
                painting.dynasty,
                painting.category.map(Category::key),
                painting.technique.map(Technique::key),
                painting.ink_color_style.map(InkColorStyle::key),
                painting.updated_at,
                id,
            ],
        );

        match result {
            Ok(_) => Ok(painting),
            Err(e) => Err(self.constraint_error(e, &painting.file_hash)),
        }
    }

    fn delete(&self, id: i64) -> Result<()> {
        let affected = self.conn.execute("DELETE FROM paintings WHERE id = ?", [id])?;
        if affected == 0 {
            return Err(CatalogError::not_found(format!("painting {}", id)));
        }
        Ok(())
    }

    fn list(&self, filter: &PaintingFilter, offset: usize, limit: usize) -> Result<(usize, Vec<Painting>)> {
        let (clause, values) = where_clause(filter);

        let count_sql = format!("SELECT COUNT(*) FROM paintings{}", clause);
        let total: i64 = self.conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let mut page_values = values;
        page_values.push(Value::Integer(limit as i64));
        page_values.push(Value::Integer(offset as i64));
        let sql = format!(
            "SELECT {} FROM paintings{} ORDER BY id LIMIT ? OFFSET ?",
            COLUMNS, clause
        );
        let items = self.query_paintings(&sql, page_values)?;

        Ok((total as usize, items))
    }

    fn search(&self, filter: &PaintingFilter) -> Result<Vec<Painting>> {
        let (clause, values) = where_clause(filter);
        let sql = format!("SELECT {} FROM paintings{} ORDER BY id", COLUMNS, clause);
        self.query_paintings(&sql, values)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM paintings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn authors(&self, dynasty: Option<&str>) -> Result<Vec<String>> {
        let mut sql = String::from("SELECT DISTINCT author FROM paintings WHERE author IS NOT NULL");
        let mut values = Vec::new();
        if let Some(dynasty) = dynasty {
            sql.push_str(" AND dynasty = ?");
            values.push(Value::Text(dynasty.to_string()));
        }
        sql.push_str(" ORDER BY author");

        let mut stmt = self.conn.prepare(&sql)?;
        let authors = stmt
            .query_map(rusqlite::params_from_iter(values), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(authors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::new_painting;

    fn catalog() -> SqliteCatalog {
        let db = SqliteCatalog::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_insert_and_get() {
        let db = catalog();
        let mut painting = new_painting("abc", "清明上河图", Some("宋代"));
        painting.category = Some(Category::Person);
        painting.ink_color_style = Some(InkColorStyle::Colored);

        let id = db.insert(&painting).unwrap();
        let stored = db.get(id).unwrap();

        assert_eq!(stored.title, "清明上河图");
        assert_eq!(stored.category, Some(Category::Person));
        assert_eq!(stored.ink_color_style, Some(InkColorStyle::Colored));
        assert_eq!(stored.technique, None);
        assert_eq!(stored.created_at, stored.updated_at);
    }

    #[test]
    fn test_duplicate_fingerprint_rejected_by_insert() {
        let db = catalog();
        let first = db.insert(&new_painting("same", "甲", None)).unwrap();

        match db.insert(&new_painting("same", "乙", None)) {
            Err(CatalogError::DuplicateFingerprint { existing_id, .. }) => {
                assert_eq!(existing_id, first)
            }
            other => panic!("expected duplicate error, got {:?}", other),
        }
        assert_eq!(db.count().unwrap(), 1);
    }

    #[test]
    fn test_update_applies_only_present_keys() {
        let db = catalog();
        let mut painting = new_painting("h1", "山水图", Some("清代"));
        painting.author = Some("石涛".to_string());
        let id = db.insert(&painting).unwrap();
        let before = db.get(id).unwrap();

        let patch = PaintingPatch {
            technique: Some(Some(Technique::Freehand)),
            dynasty: Some(None),
            ..Default::default()
        };
        let after = db.update(id, &patch).unwrap();

        assert_eq!(after.author.as_deref(), Some("石涛"));
        assert_eq!(after.dynasty, None);
        assert_eq!(after.technique, Some(Technique::Freehand));
        assert!(after.updated_at >= before.updated_at);
        assert_eq!(db.get(id).unwrap(), after);
    }

    #[test]
    fn test_missing_rows() {
        let db = catalog();
        assert!(matches!(db.get(42), Err(CatalogError::NotFound(_))));
        assert!(matches!(
            db.update(42, &PaintingPatch::default()),
            Err(CatalogError::NotFound(_))
        ));
        assert!(matches!(db.delete(42), Err(CatalogError::NotFound(_))));
    }

    #[test]
    fn test_list_filters_and_paginates() {
        let db = catalog();
        for i in 0..15 {
            db.insert(&new_painting(&format!("song{}", i), "宋画", Some("宋代")))
                .unwrap();
        }
        for i in 0..5 {
            db.insert(&new_painting(&format!("ming{}", i), "明画", Some("明代")))
                .unwrap();
        }

        let filter = PaintingFilter {
            dynasty: Some("宋代".to_string()),
            ..Default::default()
        };
        let (total, items) = db.list(&filter, 0, 10).unwrap();
        assert_eq!(total, 15);
        assert_eq!(items.len(), 10);
        assert!(items.iter().all(|p| p.dynasty.as_deref() == Some("宋代")));

        let (_, rest) = db.list(&filter, 10, 10).unwrap();
        assert_eq!(rest.len(), 5);
        assert_eq!(db.search(&PaintingFilter::default()).unwrap().len(), 20);
    }

    #[test]
    fn test_filters_are_conjunctive() {
        let db = catalog();
        let mut a = new_painting("a", "甲", Some("宋代"));
        a.category = Some(Category::Landscape);
        let mut b = new_painting("b", "乙", Some("宋代"));
        b.category = Some(Category::Person);
        db.insert(&a).unwrap();
        db.insert(&b).unwrap();

        let filter = PaintingFilter {
            dynasty: Some("宋代".to_string()),
            category: Some(Category::Landscape),
            author: None,
        };
        let found = db.search(&filter).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_hash, "a");
    }

    #[test]
    fn test_authors() {
        let db = catalog();
        let mut a = new_painting("a", "甲", Some("元代"));
        a.author = Some("黄公望".to_string());
        let mut b = new_painting("b", "乙", Some("清代"));
        b.author = Some("石涛".to_string());
        db.insert(&a).unwrap();
        db.insert(&b).unwrap();
        db.insert(&new_painting("c", "丙", Some("清代"))).unwrap();

        assert_eq!(db.authors(None).unwrap().len(), 2);
        assert_eq!(db.authors(Some("清代")).unwrap(), vec!["石涛".to_string()]);
    }
}
