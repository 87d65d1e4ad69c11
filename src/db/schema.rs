pub const SCHEMA: &str = r#"
-- Paintings table: one row per cataloged asset
CREATE TABLE IF NOT EXISTS paintings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_hash TEXT NOT NULL UNIQUE,   -- MD5 of the asset bytes
    file_path TEXT NOT NULL,
    title TEXT NOT NULL,
    author TEXT,
    dynasty TEXT,

    -- Vocabulary keys (see db::vocabulary)
    category TEXT,
    technique TEXT,
    ink_color_style TEXT,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_paintings_title ON paintings(title);
CREATE INDEX IF NOT EXISTS idx_paintings_author ON paintings(author);
CREATE INDEX IF NOT EXISTS idx_paintings_dynasty ON paintings(dynasty);
CREATE INDEX IF NOT EXISTS idx_paintings_category ON paintings(category);
CREATE INDEX IF NOT EXISTS idx_paintings_file_path ON paintings(file_path);
"#;
