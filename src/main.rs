use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use guohua::catalog::{Catalog, UploadFields};
use guohua::config::Config;
use guohua::db::{Category, InkColorStyle, PaintingFilter, PaintingPatch, Technique};
use guohua::enrichment::Enricher;
use guohua::export::{self, ExportFormat};
use guohua::logging;
use guohua::scanner;
use guohua::sidecar::{self, Sidecar};
use guohua::stats::{StatsKind, Statistics};

/// Flags that take no value.
const SWITCHES: &[&str] = &["--apply", "--enrich"];

struct Args {
    config_path: Option<PathBuf>,
    command: String,
    positional: Vec<String>,
    options: HashMap<String, String>,
}

impl Args {
    fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    fn switch(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    fn arg(&self, index: usize, what: &str) -> Result<&str> {
        self.positional
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("{} requires a {} argument", self.command, what))
    }

    fn id(&self) -> Result<i64> {
        let raw = self.arg(0, "painting id")?;
        raw.parse()
            .with_context(|| format!("invalid painting id: {}", raw))
    }

    fn usize_option(&self, name: &str, default: usize) -> Result<usize> {
        match self.option(name) {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("{} expects a number, got {}", name, raw)),
            None => Ok(default),
        }
    }

    fn filter(&self) -> Result<PaintingFilter> {
        Ok(PaintingFilter {
            dynasty: self.option("--dynasty").map(str::to_string),
            category: self.option("--category").map(parse_category).transpose()?,
            author: self.option("--author").map(str::to_string),
        })
    }
}

fn parse_category(value: &str) -> Result<Category> {
    Category::parse(value).ok_or_else(|| anyhow!("unknown category: {}", value))
}

fn parse_technique(value: &str) -> Result<Technique> {
    Technique::parse(value).ok_or_else(|| anyhow!("unknown technique: {}", value))
}

fn parse_ink_color(value: &str) -> Result<InkColorStyle> {
    InkColorStyle::parse(value).ok_or_else(|| anyhow!("unknown ink color style: {}", value))
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config_path: None,
        command: String::new(),
        positional: Vec::new(),
        options: HashMap::new(),
    };

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("guohua {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            _ if SWITCHES.contains(&arg) => {
                parsed.options.insert(arg.to_string(), String::new());
            }
            _ if arg.starts_with("--") => {
                if i + 1 < args.len() {
                    parsed.options.insert(arg.to_string(), args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: {} requires a value", arg);
                    std::process::exit(1);
                }
            }
            _ if parsed.command.is_empty() => parsed.command = arg.to_string(),
            _ => parsed.positional.push(arg.to_string()),
        }
        i += 1;
    }

    if parsed.command.is_empty() {
        print_help();
        std::process::exit(1);
    }
    parsed
}

fn print_help() {
    println!(
        r#"guohua - catalog for digitized Chinese paintings

USAGE:
    guohua [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    upload FILE [FIELDS] [--enrich]   Upload an image into the catalog
    import DIR                        Upload every image under a directory
    register FILE [FIELDS]            Catalog a file already in the images directory
    list [FILTER] [--offset N] [--limit N]
    search [FILTER]                   All records matching the filter
    get ID                            Show a record
    metadata ID | --hash DIGEST       Show a record's sidecar document
    update ID [FIELDS]                Overwrite record fields ("" clears a field)
    edit ID JSON_FILE                 Apply sidecar edits from a JSON file
    delete ID                         Delete a record with its files
    authors [--dynasty D]             Distinct authors
    works AUTHOR                      Records by one author
    stats [KIND]                      summary, daily, categories, trends[:monthly|:yearly],
                                      correlations, authors, time, quality
    storage                           File count and size of the images directory
    export [OUTPUT.zip] [FILTER] [--files A,B]
                                      Archive images (default paintings_<filter>.zip)
    export-records [OUTPUT] [FILTER] [--format json|csv]
    download ID|FILENAME [OUTPUT]     Copy one stored image out (default: current directory)
    trash                             List files held in the trash
    enrich ID                         Fill missing fields from the enrichment service
    validate ID                       Check a record with the enrichment service
    sweep [--apply]                   Report (or trash) files no record refers to

FIELDS:
    --title T  --author A  --dynasty D  --category C  --technique T  --ink-color I

FILTER:
    --dynasty D  --category C  --author A

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    GUOHUA_CONFIG       Path to config file (overrides default location)
    GUOHUA_LOG          Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/guohua/config.toml"#
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn upload_fields(args: &Args) -> Result<UploadFields> {
    Ok(UploadFields {
        title: args.option("--title").map(str::to_string),
        author: args.option("--author").map(str::to_string),
        dynasty: args.option("--dynasty").map(str::to_string),
        category: args.option("--category").map(parse_category).transpose()?,
        technique: args.option("--technique").map(parse_technique).transpose()?,
        ink_color_style: args.option("--ink-color").map(parse_ink_color).transpose()?,
    })
}

/// An empty value clears the field.
fn clearable<T>(value: Option<&str>, parse: impl Fn(&str) -> Result<T>) -> Result<Option<Option<T>>> {
    match value {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(Some(None)),
        Some(v) => Ok(Some(Some(parse(v)?))),
    }
}

fn text(value: &str) -> Result<String> {
    Ok(value.to_string())
}

fn update_patch(args: &Args) -> Result<PaintingPatch> {
    let patch = PaintingPatch {
        title: args.option("--title").map(str::to_string),
        author: clearable(args.option("--author"), text)?,
        dynasty: clearable(args.option("--dynasty"), text)?,
        category: clearable(args.option("--category"), parse_category)?,
        technique: clearable(args.option("--technique"), parse_technique)?,
        ink_color_style: clearable(args.option("--ink-color"), parse_ink_color)?,
        file_hash: None,
    };
    if patch.is_empty() {
        bail!("update needs at least one field to change");
    }
    Ok(patch)
}

async fn run(args: &Args, config: &Config, catalog: &Catalog) -> Result<()> {
    match args.command.as_str() {
        "upload" => {
            let path = PathBuf::from(args.arg(0, "file")?);
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| anyhow!("not a file: {}", path.display()))?;
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let outcome = catalog.upload(&filename, &bytes, &upload_fields(args)?)?;
            print_json(&outcome)?;

            if config.enrichment.enabled || args.switch("--enrich") {
                let enricher = Enricher::from_config(&config.enrichment);
                if let Some(enriched) = enricher.enrich_upload(catalog, &outcome).await {
                    print_json(&enriched)?;
                }
            }
        }
        "import" => {
            let dir = PathBuf::from(args.arg(0, "directory")?);
            print_json(&scanner::import_directory(catalog, &dir, None)?)?;
        }
        "register" => {
            let path = PathBuf::from(args.arg(0, "file")?);
            print_json(&catalog.register(&path, &upload_fields(args)?)?)?;
        }
        "list" => {
            let offset = args.usize_option("--offset", 0)?;
            let limit = args.usize_option("--limit", 20)?;
            print_json(&catalog.list(&args.filter()?, offset, limit)?)?;
        }
        "search" => print_json(&catalog.search(&args.filter()?)?)?,
        "get" => print_json(&catalog.get(args.id()?)?)?,
        "metadata" => {
            let doc = match args.option("--hash") {
                Some(digest) => catalog.sidecar_by_fingerprint(digest)?,
                None => catalog.sidecar(args.id()?)?,
            };
            print_json(&doc)?;
        }
        "update" => print_json(&catalog.update(args.id()?, &update_patch(args)?)?)?,
        "edit" => {
            let id = args.id()?;
            let changes: Sidecar = sidecar::read(Path::new(args.arg(1, "JSON file")?))?;
            print_json(&catalog.edit_metadata(id, &changes)?)?;
        }
        "delete" => print_json(&catalog.delete(args.id()?)?)?,
        "authors" => print_json(&catalog.authors(args.option("--dynasty"))?)?,
        "works" => print_json(&catalog.works_by_author(args.arg(0, "author")?)?)?,
        "stats" => {
            let kind: StatsKind = args.positional.first().map_or("summary", String::as_str).parse()?;
            print_json(&Statistics::new(catalog).report(kind)?)?;
        }
        "storage" => print_json(&catalog.storage_summary())?,
        "export" => {
            let filter = args.filter()?;
            let output = args
                .positional
                .first()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(export::archive_name(&filter)));
            let summary = match args.option("--files") {
                Some(list) => {
                    let names: Vec<String> = list
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                    export::write_archive_file(&output, |w| export::export_named(catalog, &names, w))?
                }
                None => export::write_archive_file(&output, |w| export::export_archive(catalog, &filter, w))?,
            };
            print_json(&summary)?;
        }
        "export-records" => {
            let format: ExportFormat = args.option("--format").unwrap_or("json").parse()?;
            let output = args
                .positional
                .first()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(format!("paintings.{}", format.extension())));
            let paintings = catalog.search(&args.filter()?)?.items;
            let written = export::export_records(&paintings, &output, format)?;
            println!("Exported {} records as {} to {}", written, format.name(), output.display());
        }
        "download" => {
            let target = args.arg(0, "painting id or file name")?;
            let output = args.positional.get(1).map_or_else(|| PathBuf::from("."), PathBuf::from);
            let written = export::download(catalog, target, &output)?;
            println!("Saved {}", written.display());
        }
        "trash" => print_json(&catalog.trash_contents()?)?,
        "enrich" => {
            let enricher = Enricher::from_config(&config.enrichment);
            print_json(&enricher.enrich_painting(catalog, args.id()?).await)?;
        }
        "validate" => {
            let enricher = Enricher::from_config(&config.enrichment);
            print_json(&enricher.validate_painting(catalog, args.id()?).await)?;
        }
        "sweep" => print_json(&catalog.sweep(args.switch("--apply"))?)?,
        other => {
            print_help();
            bail!("unknown command: {}", other);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    // journald on Linux, daily log files otherwise
    if let Err(e) = logging::init(Some(Config::config_dir().join("logs"))) {
        eprintln!("Warning: logging disabled: {:#}", e);
    }

    let config = match args.config_path {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.ensure_directories()?;

    let catalog = Catalog::open(&config)?;
    run(&args, &config, &catalog).await
}
