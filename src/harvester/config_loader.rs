use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// Environment variable that overrides the configured API access key.
pub const ACCESS_KEY_ENV: &str = "UNSPLASH_ACCESS_KEY";

const CONFIG_FILE: &str = "harvester.toml";
const ACCESS_KEY_PLACEHOLDER: &str = "your_access_key_here";

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Config structs for harvester.toml
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub access_key: String,
    pub timeout_secs: u64,
    /// Collection ids queried under the collections strategy.
    pub collections: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HarvestSection {
    pub batch_size: u32,
    pub batch_interval_secs: u64,
    pub item_interval_secs: u64,
    pub error_threshold: u32,
    pub error_cooldown_secs: u64,
    pub stagnation_threshold: u32,
    pub stagnation_cooldown_secs: u64,
    /// Vocabulary for the search strategy, drawn without replacement.
    pub keywords: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QualityConfig {
    pub min_width: u32,
    pub min_height: u32,
    pub min_likes: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub download_directory: String,
    pub database_file: String,
    pub log_url_access: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_directory: String,
}

/// Optional overrides for the built-in category table. Empty maps keep the
/// compiled-in slug list, display names, and classifier term lists.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CategoriesSection {
    pub names: BTreeMap<String, String>,
    pub terms: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub harvest: HarvestSection,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub categories: CategoriesSection,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.unsplash.com".to_string(),
            access_key: ACCESS_KEY_PLACEHOLDER.to_string(),
            timeout_secs: 30,
            collections: vec![317_099, 1_053_828],
        }
    }
}

impl Default for HarvestSection {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_interval_secs: 60,
            item_interval_secs: 2,
            error_threshold: 5,
            error_cooldown_secs: 600,
            stagnation_threshold: 5,
            stagnation_cooldown_secs: 300,
            keywords: vec![
                "sunset".to_string(),
                "mountains".to_string(),
                "ocean".to_string(),
                "forest".to_string(),
                "city night".to_string(),
                "coffee".to_string(),
                "workspace".to_string(),
                "architecture".to_string(),
                "flowers".to_string(),
                "wildlife".to_string(),
                "street photography".to_string(),
                "minimalism".to_string(),
                "texture".to_string(),
                "aerial view".to_string(),
                "portrait".to_string(),
                "technology".to_string(),
                "food photography".to_string(),
                "rain".to_string(),
                "stars".to_string(),
                "winter".to_string(),
            ],
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_width: 1920,
            min_height: 1080,
            min_likes: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_directory: "./data/unsplash_images".to_string(),
            database_file: "./data/unsplash.db".to_string(),
            log_url_access: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_directory: "./logs".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            harvest: HarvestSection::default(),
            quality: QualityConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            categories: CategoriesSection::default(),
        }
    }
}

// Config manager owning the loaded configuration
pub struct ConfigManager {
    config: AppConfig,
    config_dir: PathBuf,
}

impl ConfigManager {
    // Create a new ConfigManager instance
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        // Create the directory if it doesn't exist
        if !config_dir.exists() {
            info!("Creating config directory: {}", config_dir.display());
            fs::create_dir_all(&config_dir)?;
        }

        let mut config = Self::load_config(&config_dir)?;
        Self::apply_env_overrides(&mut config);
        Self::validate(&config)?;

        Ok(Self { config, config_dir })
    }

    // Load config from harvester.toml, creating a default file on first run
    fn load_config(config_dir: &Path) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            warn!("Config file not found: {}", config_path.display());
            let default_config = AppConfig::default();
            let toml_string = toml::to_string_pretty(&default_config)
                .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
            fs::write(&config_path, toml_string)?;
            info!("Created {} with default values", config_path.display());
            return Ok(default_config);
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                error!("Failed to parse {}: {}", CONFIG_FILE, e);
                info!("Backing up old config and creating a new one with default values");

                if let Err(backup_err) =
                    fs::rename(&config_path, config_path.with_extension("toml.backup"))
                {
                    warn!("Failed to backup old config: {}", backup_err);
                }

                let default_config = AppConfig::default();
                if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                    if let Err(write_err) = fs::write(&config_path, toml_string) {
                        error!("Failed to write new config file: {}", write_err);
                    } else {
                        info!("Created new {} with default values", CONFIG_FILE);
                    }
                }

                Ok(default_config)
            }
        }
    }

    fn apply_env_overrides(config: &mut AppConfig) {
        if let Ok(key) = std::env::var(ACCESS_KEY_ENV) {
            if !key.is_empty() {
                config.api.access_key = key;
            }
        }
    }

    // Reject settings the loop cannot run with
    fn validate(config: &AppConfig) -> ConfigResult<()> {
        if !(1..=30).contains(&config.harvest.batch_size) {
            return Err(ConfigError::Invalid(format!(
                "harvest.batch_size must be between 1 and 30, got {}",
                config.harvest.batch_size
            )));
        }
        Ok(())
    }

    // Get the loaded config
    pub fn get(&self) -> AppConfig {
        self.config.clone()
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    // Check if an API access key is configured
    pub fn has_valid_credentials(&self) -> bool {
        !self.config.api.access_key.is_empty()
            && self.config.api.access_key != ACCESS_KEY_PLACEHOLDER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_default_config_on_first_run() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(dir.path()).unwrap();

        assert!(manager.config_path().exists());
        let config = manager.get();
        assert_eq!(config.harvest.batch_size, 10);
        assert_eq!(config.quality.min_width, 1920);
        assert_eq!(config.harvest.error_threshold, 5);
    }

    #[test]
    fn partial_config_falls_back_to_section_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[quality]\nmin_width = 2560\n\n[storage]\nlog_url_access = false\n",
        )
        .unwrap();

        let config = ConfigManager::new(dir.path()).unwrap().get();
        // configured fields win, their section siblings default
        assert_eq!(config.quality.min_width, 2560);
        assert_eq!(config.quality.min_height, 1080);
        assert_eq!(config.quality.min_likes, 0);
        assert!(!config.storage.log_url_access);
        assert_eq!(config.storage.database_file, "./data/unsplash.db");
        // untouched sections keep their defaults
        assert_eq!(config.harvest.batch_interval_secs, 60);
        assert_eq!(config.api.base_url, "https://api.unsplash.com");
        // a valid partial file is kept, not backed up and replaced
        assert!(!dir.path().join("harvester.toml.backup").exists());
    }

    #[test]
    fn rejects_out_of_range_batch_size() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.harvest.batch_size = 40;
        fs::write(
            dir.path().join(CONFIG_FILE),
            toml::to_string_pretty(&config).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            ConfigManager::new(dir.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unparsable_config_is_backed_up_and_replaced() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "not valid toml [[[").unwrap();

        let config = ConfigManager::new(dir.path()).unwrap().get();
        assert_eq!(config.harvest.batch_size, 10);
        assert!(dir.path().join("harvester.toml.backup").exists());
    }
}
