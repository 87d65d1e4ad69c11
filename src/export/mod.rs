//! Batch export: zip archives of stored images and record manifests.

use anyhow::Result as AnyResult;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::catalog::Catalog;
use crate::db::{Painting, PaintingFilter};
use crate::error::{CatalogError, Result};

/// Why a matched record was left out of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Missing,
    OutsideRoot,
    DuplicateName,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArchiveSummary {
    pub matched: usize,
    pub included: Vec<String>,
    pub skipped: Vec<SkippedEntry>,
}

/// Default archive name for a filter, e.g. `paintings_山水.zip`.
pub fn archive_name(filter: &PaintingFilter) -> String {
    let label = filter
        .category
        .map(|c| c.token().to_string())
        .or_else(|| filter.dynasty.clone())
        .or_else(|| filter.author.clone())
        .unwrap_or_else(|| "all".to_string());
    format!("paintings_{}.zip", label)
}

struct ArchiveBuilder<W: Write + Seek> {
    zip: ZipWriter<W>,
    options: SimpleFileOptions,
    names: HashSet<String>,
    summary: ArchiveSummary,
}

impl<W: Write + Seek> ArchiveBuilder<W> {
    fn new(writer: W, matched: usize) -> Self {
        Self {
            zip: ZipWriter::new(writer),
            options: SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
            names: HashSet::new(),
            summary: ArchiveSummary {
                matched,
                ..Default::default()
            },
        }
    }

    fn skip(&mut self, path: &Path, reason: SkipReason) {
        warn!("Leaving {:?} out of archive: {:?}", path, reason);
        self.summary.skipped.push(SkippedEntry {
            path: path.to_path_buf(),
            reason,
        });
    }

    /// Adds `path` under its base name unless it is unsafe, missing or a
    /// duplicate name.
    fn add(&mut self, catalog: &Catalog, path: &Path) -> Result<()> {
        let resolved = match catalog.assets().check_image(path) {
            Ok(resolved) => resolved,
            Err(CatalogError::Permission { .. }) => {
                self.skip(path, SkipReason::OutsideRoot);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mut file = match File::open(&resolved) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.skip(path, SkipReason::Missing);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !self.names.insert(name.clone()) {
            self.skip(path, SkipReason::DuplicateName);
            return Ok(());
        }

        self.zip.start_file(name.as_str(), self.options)?;
        io::copy(&mut file, &mut self.zip)?;
        self.summary.included.push(name);
        Ok(())
    }

    fn finish(self) -> Result<(W, ArchiveSummary)> {
        let writer = self.zip.finish()?;
        Ok((writer, self.summary))
    }
}

/// Writes the images of every record matching `filter` into a deflated zip
/// archive on `writer`.
///
/// Records whose file is missing or lies outside the images directory are
/// skipped and reported. Fails with `NotFound` only when nothing matches.
pub fn export_archive<W: Write + Seek>(
    catalog: &Catalog,
    filter: &PaintingFilter,
    writer: W,
) -> Result<(W, ArchiveSummary)> {
    let paintings = catalog.search(filter)?.items;
    if paintings.is_empty() {
        return Err(CatalogError::not_found("paintings matching the filter"));
    }

    let mut builder = ArchiveBuilder::new(writer, paintings.len());
    for painting in &paintings {
        builder.add(catalog, Path::new(&painting.file_path))?;
    }
    let (writer, summary) = builder.finish()?;
    info!(
        "Archived {} of {} matching paintings",
        summary.included.len(),
        summary.matched
    );
    Ok((writer, summary))
}

/// Archives stored images by file name. Names that are not plain file names
/// are rejected; files that do not exist are skipped.
pub fn export_named<W: Write + Seek>(
    catalog: &Catalog,
    filenames: &[String],
    writer: W,
) -> Result<(W, ArchiveSummary)> {
    let mut builder = ArchiveBuilder::new(writer, filenames.len());
    for filename in filenames {
        let path = catalog.assets().asset_path(filename)?;
        builder.add(catalog, &path)?;
    }
    builder.finish()
}

/// Creates `output` and fills it with `build`. A failed build removes the
/// partial file.
pub fn write_archive_file<F>(output: &Path, build: F) -> Result<ArchiveSummary>
where
    F: FnOnce(BufWriter<File>) -> Result<(BufWriter<File>, ArchiveSummary)>,
{
    let file = File::create(output).map_err(|e| CatalogError::storage_write(output, e))?;
    let written = build(BufWriter::new(file)).and_then(|(mut writer, summary)| {
        writer.flush()?;
        Ok(summary)
    });

    if written.is_err() {
        if let Err(e) = fs::remove_file(output) {
            warn!("Could not remove partial archive {:?}: {}", output, e);
        }
    } else {
        info!("Wrote archive {:?}", output);
    }
    written
}

/// Copies one stored image to `output`. When `output` is a directory the
/// image keeps its stored name inside it.
pub fn download(catalog: &Catalog, target: &str, output: &Path) -> Result<PathBuf> {
    let image = catalog.read_asset(target)?;
    let dest = if output.is_dir() {
        output.join(&image.filename)
    } else {
        output.to_path_buf()
    };
    fs::write(&dest, &image.bytes).map_err(|e| CatalogError::storage_write(&dest, e))?;
    info!("Downloaded {} to {:?}", image.filename, dest);
    Ok(dest)
}

/// Record manifest formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Json => "JSON",
            ExportFormat::Csv => "CSV",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> AnyResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => anyhow::bail!("unknown export format: {}", other),
        }
    }
}

/// One catalog row as written to a manifest.
#[derive(Debug, Serialize)]
pub struct ExportedPainting {
    pub id: i64,
    pub file_hash: String,
    pub file_path: String,
    pub filename: String,
    pub title: String,
    pub author: Option<String>,
    pub dynasty: Option<String>,
    pub category: Option<String>,
    pub technique: Option<String>,
    pub ink_color_style: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Painting> for ExportedPainting {
    fn from(p: &Painting) -> Self {
        let filename = Path::new(&p.file_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Self {
            id: p.id,
            file_hash: p.file_hash.clone(),
            file_path: p.file_path.clone(),
            filename,
            title: p.title.clone(),
            author: p.author.clone(),
            dynasty: p.dynasty.clone(),
            category: p.category.map(|c| c.token().to_string()),
            technique: p.technique.map(|t| t.token().to_string()),
            ink_color_style: p.ink_color_style.map(|s| s.token().to_string()),
            created_at: p.created_at.to_rfc3339(),
            updated_at: p.updated_at.to_rfc3339(),
        }
    }
}

/// Writes `paintings` to `output_path` as a JSON or CSV manifest.
pub fn export_records(paintings: &[Painting], output_path: &Path, format: ExportFormat) -> AnyResult<usize> {
    let rows: Vec<ExportedPainting> = paintings.iter().map(ExportedPainting::from).collect();

    match format {
        ExportFormat::Json => export_json(&rows, output_path)?,
        ExportFormat::Csv => export_csv(&rows, output_path)?,
    }

    Ok(rows.len())
}

fn export_json(rows: &[ExportedPainting], output_path: &Path) -> AnyResult<()> {
    let json = serde_json::to_string_pretty(rows)?;
    let mut file = File::create(output_path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

fn export_csv(rows: &[ExportedPainting], output_path: &Path) -> AnyResult<()> {
    let mut wtr = csv::Writer::from_path(output_path)?;

    wtr.write_record([
        "id",
        "file_hash",
        "file_path",
        "filename",
        "title",
        "author",
        "dynasty",
        "category",
        "technique",
        "ink_color_style",
        "created_at",
        "updated_at",
    ])?;

    for row in rows {
        wtr.write_record([
            row.id.to_string().as_str(),
            row.file_hash.as_str(),
            row.file_path.as_str(),
            row.filename.as_str(),
            row.title.as_str(),
            row.author.as_deref().unwrap_or(""),
            row.dynasty.as_deref().unwrap_or(""),
            row.category.as_deref().unwrap_or(""),
            row.technique.as_deref().unwrap_or(""),
            row.ink_color_style.as_deref().unwrap_or(""),
            row.created_at.as_str(),
            row.updated_at.as_str(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::{catalog, png};
    use crate::catalog::UploadFields;
    use crate::db::{testing::new_painting, Category, NewPainting};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn archive_names(bytes: Vec<u8>) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_archive_skips_missing_files() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());
        let fields = UploadFields::default();
        for (i, name) in ["宋代_甲_一.jpg", "宋代_乙_二.jpg", "宋代_丙_三.jpg"].iter().enumerate() {
            catalog.upload(name, &png(i as u8), &fields).unwrap();
        }
        catalog.upload("元代_丁_四.jpg", &png(9), &fields).unwrap();
        std::fs::remove_file(catalog.assets().images_dir().join("宋代_乙_二.jpg")).unwrap();

        let filter = PaintingFilter {
            dynasty: Some("宋代".to_string()),
            ..Default::default()
        };
        let (cursor, summary) = export_archive(&catalog, &filter, Cursor::new(Vec::new())).unwrap();

        assert_eq!(summary.matched, 3);
        assert_eq!(summary.included.len(), 2);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].reason, SkipReason::Missing);
        assert_eq!(
            archive_names(cursor.into_inner()),
            vec!["宋代_丙_三.jpg", "宋代_甲_一.jpg"]
        );
    }

    #[test]
    fn test_archive_with_no_matches_is_not_found() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());
        catalog.upload("宋代_甲_一.jpg", &png(1), &UploadFields::default()).unwrap();

        let filter = PaintingFilter {
            category: Some(Category::FlowerBird),
            ..Default::default()
        };
        assert!(matches!(
            export_archive(&catalog, &filter, Cursor::new(Vec::new())),
            Err(CatalogError::NotFound(_))
        ));
    }

    #[test]
    fn test_archive_matches_with_all_files_gone_is_empty() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());
        let id = catalog.upload("a.jpg", &png(1), &UploadFields::default()).unwrap().id();
        std::fs::remove_file(&catalog.get(id).unwrap().file_path).unwrap();

        let (cursor, summary) =
            export_archive(&catalog, &PaintingFilter::default(), Cursor::new(Vec::new())).unwrap();
        assert_eq!(summary.matched, 1);
        assert!(summary.included.is_empty());
        assert!(archive_names(cursor.into_inner()).is_empty());
    }

    #[test]
    fn test_archive_refuses_paths_outside_root() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());
        let outside = dir.path().join("secret.jpg");
        std::fs::write(&outside, png(3)).unwrap();
        catalog
            .backend()
            .insert(&NewPainting {
                file_path: outside.to_string_lossy().to_string(),
                ..new_painting("secret", "外部", None)
            })
            .unwrap();

        let (cursor, summary) =
            export_archive(&catalog, &PaintingFilter::default(), Cursor::new(Vec::new())).unwrap();
        assert_eq!(summary.skipped[0].reason, SkipReason::OutsideRoot);
        assert!(archive_names(cursor.into_inner()).is_empty());
    }

    #[test]
    fn test_export_named() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());
        catalog.upload("a.jpg", &png(1), &UploadFields::default()).unwrap();

        let names = vec!["a.jpg".to_string(), "gone.jpg".to_string()];
        let (cursor, summary) = export_named(&catalog, &names, Cursor::new(Vec::new())).unwrap();
        assert_eq!(summary.included, vec!["a.jpg"]);
        assert_eq!(archive_names(cursor.into_inner()), vec!["a.jpg"]);

        let bad = vec!["../a.jpg".to_string()];
        assert!(matches!(
            export_named(&catalog, &bad, Cursor::new(Vec::new())),
            Err(CatalogError::Validation(_))
        ));
    }

    #[test]
    fn test_failed_archive_leaves_no_file() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());
        catalog.upload("宋代_甲_一.jpg", &png(1), &UploadFields::default()).unwrap();
        let output = dir.path().join("out.zip");

        let filter = PaintingFilter {
            dynasty: Some("清代".to_string()),
            ..Default::default()
        };
        let result = write_archive_file(&output, |w| export_archive(&catalog, &filter, w));
        assert!(matches!(result, Err(CatalogError::NotFound(_))));
        assert!(!output.exists());

        let summary = write_archive_file(&output, |w| {
            export_archive(&catalog, &PaintingFilter::default(), w)
        })
        .unwrap();
        assert_eq!(summary.included, vec!["宋代_甲_一.jpg"]);
        assert_eq!(archive_names(std::fs::read(&output).unwrap()), vec!["宋代_甲_一.jpg"]);
    }

    #[test]
    fn test_download_by_id_and_name() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());
        let id = catalog.upload("宋代_甲_一.jpg", &png(4), &UploadFields::default()).unwrap().id();
        let out = tempdir().unwrap();

        let written = download(&catalog, &id.to_string(), out.path()).unwrap();
        assert_eq!(written, out.path().join("宋代_甲_一.jpg"));
        assert_eq!(std::fs::read(&written).unwrap(), png(4));

        let named = out.path().join("copy.jpg");
        download(&catalog, "宋代_甲_一.jpg", &named).unwrap();
        assert_eq!(std::fs::read(&named).unwrap(), png(4));
    }

    #[test]
    fn test_download_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());
        let id = catalog.upload("a.jpg", &png(5), &UploadFields::default()).unwrap().id();
        std::fs::remove_file(&catalog.get(id).unwrap().file_path).unwrap();
        let out = tempdir().unwrap();

        assert!(matches!(
            download(&catalog, &id.to_string(), out.path()),
            Err(CatalogError::NotFound(_))
        ));
        assert!(matches!(
            download(&catalog, "never.jpg", out.path()),
            Err(CatalogError::NotFound(_))
        ));
        assert!(!out.path().join("a.jpg").exists());
    }

    #[test]
    fn test_download_refuses_paths_outside_root() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());
        let outside = dir.path().join("secret.jpg");
        std::fs::write(&outside, png(6)).unwrap();
        let id = catalog
            .backend()
            .insert(&NewPainting {
                file_path: outside.to_string_lossy().to_string(),
                ..new_painting("secret", "外部", None)
            })
            .unwrap();
        let out = tempdir().unwrap();

        assert!(matches!(
            download(&catalog, &id.to_string(), out.path()),
            Err(CatalogError::Permission { .. })
        ));
        assert!(matches!(
            download(&catalog, "../secret.jpg", out.path()),
            Err(CatalogError::Validation(_))
        ));
        assert!(!out.path().join("secret.jpg").exists());
    }

    #[test]
    fn test_archive_name() {
        let filter = PaintingFilter {
            category: Some(Category::Landscape),
            ..Default::default()
        };
        assert_eq!(archive_name(&filter), "paintings_山水.zip");
        assert_eq!(archive_name(&PaintingFilter::default()), "paintings_all.zip");
    }

    #[test]
    fn test_export_records_csv_and_json() {
        let dir = tempdir().unwrap();
        let catalog = catalog(dir.path());
        catalog
            .upload("宋代_张择端_清明上河图_人物.jpg", &png(1), &UploadFields::default())
            .unwrap();
        let paintings = catalog.snapshot().unwrap();

        let csv_path = dir.path().join("paintings.csv");
        assert_eq!(export_records(&paintings, &csv_path, ExportFormat::Csv).unwrap(), 1);
        let mut reader = csv::Reader::from_path(&csv_path).unwrap();
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(&record[4], "清明上河图");
        assert_eq!(&record[7], "人物");

        let json_path = dir.path().join("paintings.json");
        export_records(&paintings, &json_path, ExportFormat::Json).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(value[0]["author"], "张择端");
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
    }
}
