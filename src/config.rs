use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "GUOHUA_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub enrichment: EnrichmentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory. Relative `images_dir`/`metadata_dir`/`trash_dir` are
    /// resolved against it.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    #[serde(default = "default_images_dir")]
    pub images_dir: PathBuf,

    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,

    #[serde(default = "default_trash_dir")]
    pub trash_dir: PathBuf,
}

fn default_storage_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("guohua")
}

fn default_images_dir() -> PathBuf {
    PathBuf::from("images")
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("metadata")
}

fn default_trash_dir() -> PathBuf {
    PathBuf::from(".trash")
}

impl StorageConfig {
    /// Storage rooted at `root` with the default sub-directory names.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(&self.images_dir)
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join(&self.metadata_dir)
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.root.join(&self.trash_dir)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            images_dir: default_images_dir(),
            metadata_dir: default_metadata_dir(),
            trash_dir: default_trash_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,
}

fn default_allowed_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "gif".to_string(),
    ]
}

fn default_max_upload_mb() -> u64 {
    50
}

impl UploadConfig {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentProviderType {
    /// Any OpenAI-compatible chat completions endpoint (DeepSeek, LM Studio, ...).
    #[default]
    OpenAI,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Run enrichment after each successful upload.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub provider: EnrichmentProviderType,

    #[serde(default = "default_enrichment_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_enrichment_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_enrichment_endpoint() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_enrichment_model() -> String {
    "deepseek-chat".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: EnrichmentProviderType::default(),
            endpoint: default_enrichment_endpoint(),
            model: default_enrichment_model(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("guohua")
        .join("guohua.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            storage: StorageConfig::default(),
            upload: UploadConfig::default(),
            enrichment: EnrichmentConfig::default(),
        }
    }
}

impl Config {
    /// Loads the config from `$GUOHUA_CONFIG` or the user config directory,
    /// writing the defaults there on first run.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Creates the storage directories and the database's parent directory.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.storage.images_dir(),
            self.storage.metadata_dir(),
            self.storage.trash_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("guohua")
    }

    fn config_path() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => Self::config_dir().join("config.toml"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[storage]
root = "/srv/paintings"

[enrichment]
enabled = true
api_key = "sk-test"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.storage.images_dir(), PathBuf::from("/srv/paintings/images"));
        assert_eq!(config.storage.metadata_dir(), PathBuf::from("/srv/paintings/metadata"));
        assert_eq!(config.upload.allowed_extensions, vec!["jpg", "jpeg", "png", "gif"]);
        assert_eq!(config.upload.max_upload_bytes(), 50 * 1024 * 1024);
        assert!(config.enrichment.enabled);
        assert_eq!(config.enrichment.model, "deepseek-chat");
        assert_eq!(config.enrichment.timeout_secs, 30);
        assert_eq!(config.enrichment.provider, EnrichmentProviderType::OpenAI);
    }

    #[test]
    fn test_upload_limit_saturates() {
        let upload = UploadConfig {
            max_upload_mb: u64::MAX,
            ..UploadConfig::default()
        };
        assert_eq!(upload.max_upload_bytes(), u64::MAX);
    }

    #[test]
    fn test_absolute_subdirectories_ignore_root() {
        let storage = StorageConfig {
            images_dir: PathBuf::from("/mnt/scans"),
            ..StorageConfig::rooted_at("/srv/paintings")
        };
        assert_eq!(storage.images_dir(), PathBuf::from("/mnt/scans"));
        assert_eq!(storage.trash_dir(), PathBuf::from("/srv/paintings/.trash"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.upload.max_upload_mb = 10;
        config.storage = StorageConfig::rooted_at(dir.path());

        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.upload.max_upload_mb, 10);
        assert_eq!(loaded.storage.root, dir.path());
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config {
            db_path: dir.path().join("db").join("guohua.db"),
            storage: StorageConfig::rooted_at(dir.path().join("data")),
            ..Default::default()
        };

        config.ensure_directories().unwrap();
        assert!(config.storage.images_dir().is_dir());
        assert!(config.storage.metadata_dir().is_dir());
        assert!(config.storage.trash_dir().is_dir());
        assert!(dir.path().join("db").is_dir());
    }
}
