use std::{
    collections::HashSet,
    fs,
    path::PathBuf,
    sync::{LazyLock, RwLock},
};

use deltarepo_utils::{
    compression::CompressionType,
    hash::ChecksumType,
    path::{resolve_path, xdg_cache_home, xdg_config_home},
};
use documented::{Documented, DocumentedFields};
use serde::{Deserialize, Serialize};
use toml_edit::DocumentMut;
use tracing::info;

use crate::{
    annotations::{annotate_toml_array_of_tables, annotate_toml_table},
    error::{ConfigError, Result},
};

pub const DEFAULT_INDEX_FILENAME: &str = "deltarepos.xml.xz";

/// Overrides the location of `config.toml`.
pub const CONFIG_PATH_ENV: &str = "DELTAREPO_CONFIG";
/// Overrides the cache directory, taking precedence over `cache_path`.
pub const CACHE_PATH_ENV: &str = "DELTAREPO_CACHE";

/// Application's configuration
#[derive(Clone, Debug, Deserialize, Serialize, Documented, DocumentedFields)]
pub struct Config {
    /// Checksum algorithm used for repository content hashes.
    /// Default: sha256
    pub contenthash_type: Option<String>,

    /// Compression applied to generated metadata files.
    /// Default: xz
    pub compression: Option<String>,

    /// Checksum algorithm of generated repomd records.
    /// Default: same as the primary metadata of the new repository
    pub checksum_type: Option<String>,

    /// Always generate sqlite databases, even for repositories without them.
    /// Default: false
    pub force_database: Option<bool>,

    /// Only warn when a file referenced by repomd.xml is missing.
    /// Default: false
    pub ignore_missing: Option<bool>,

    /// Name of the delta index file published next to the deltas.
    /// Default: deltarepos.xml.xz
    pub index_filename: Option<String>,

    /// Scratch directory for downloaded deltas.
    /// Default: $XDG_CACHE_HOME/deltarepo
    pub cache_path: Option<String>,

    /// Timeout in seconds for a single download. Unset waits indefinitely.
    pub timeout: Option<u64>,

    /// User agent sent with mirror requests.
    /// Default: deltarepo/<version>
    pub user_agent: Option<String>,

    /// Delta mirrors consulted when resolving and applying updates.
    #[serde(default)]
    pub mirror: Vec<Mirror>,
}

/// A location publishing deltas and their index
#[derive(Clone, Debug, Deserialize, Serialize, Documented, DocumentedFields)]
pub struct Mirror {
    /// Name used in log output.
    pub name: String,

    /// Base URL of the mirror, the index is expected at <url>/<index_filename>.
    pub url: String,

    /// Whether the mirror is used.
    /// Default: true
    pub enabled: Option<bool>,
}

impl Mirror {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

pub static CONFIG: LazyLock<RwLock<Option<Config>>> = LazyLock::new(|| RwLock::new(None));

pub static CONFIG_PATH: LazyLock<RwLock<PathBuf>> = LazyLock::new(|| {
    RwLock::new(match std::env::var(CONFIG_PATH_ENV) {
        Ok(path_str) => PathBuf::from(path_str),
        Err(_) => xdg_config_home().join("deltarepo").join("config.toml"),
    })
});

pub fn init() -> Result<()> {
    let config = Config::new()?;
    let mut global_config = CONFIG.write().unwrap();
    *global_config = Some(config);
    Ok(())
}

pub fn get_config() -> Config {
    {
        let config_guard = CONFIG.read().unwrap();
        if let Some(config) = config_guard.as_ref() {
            return config.clone();
        }
    }

    let mut config_guard = CONFIG.write().unwrap();
    config_guard
        .get_or_insert_with(|| Config::default_config::<&str>(&[]))
        .clone()
}

impl Config {
    pub fn default_config<T: AsRef<str>>(mirror_urls: &[T]) -> Self {
        let mirror = mirror_urls
            .iter()
            .enumerate()
            .map(|(idx, url)| {
                Mirror {
                    name: format!("mirror-{}", idx + 1),
                    url: url.as_ref().to_string(),
                    enabled: Some(true),
                }
            })
            .collect();

        Self {
            contenthash_type: Some(ChecksumType::Sha256.name().to_string()),
            compression: Some(CompressionType::Xz.name().to_string()),
            checksum_type: None,
            force_database: Some(false),
            ignore_missing: Some(false),
            index_filename: Some(DEFAULT_INDEX_FILENAME.to_string()),
            cache_path: Some(
                xdg_cache_home()
                    .join("deltarepo")
                    .to_string_lossy()
                    .into_owned(),
            ),
            timeout: None,
            user_agent: None,
            mirror,
        }
    }

    /// Creates a new configuration by loading it from the configuration file.
    /// If the configuration file is not found, it uses the default configuration.
    pub fn new() -> Result<Self> {
        let config_path = CONFIG_PATH.read().unwrap().to_path_buf();

        let mut config = match fs::read_to_string(&config_path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::default_config::<&str>(&[])
            }
            Err(err) => return Err(ConfigError::IoError(err)),
        };

        config.resolve()?;

        Ok(config)
    }

    pub fn resolve(&mut self) -> Result<()> {
        self.contenthash_type
            .get_or_insert_with(|| ChecksumType::Sha256.name().to_string());
        self.compression
            .get_or_insert_with(|| CompressionType::Xz.name().to_string());
        self.index_filename
            .get_or_insert_with(|| DEFAULT_INDEX_FILENAME.to_string());
        self.force_database.get_or_insert(false);
        self.ignore_missing.get_or_insert(false);

        self.contenthash_type()?;
        self.compression()?;
        self.checksum_type()?;

        let mut seen = HashSet::new();
        for mirror in &mut self.mirror {
            if !seen.insert(mirror.name.clone()) {
                return Err(ConfigError::DuplicateMirrorName(mirror.name.clone()));
            }
            if url::Url::parse(&mirror.url).is_err() {
                return Err(ConfigError::InvalidMirrorUrl(mirror.url.clone()));
            }
            mirror.enabled.get_or_insert(true);
        }

        Ok(())
    }

    pub fn contenthash_type(&self) -> Result<ChecksumType> {
        let name = self.contenthash_type.as_deref().unwrap_or("sha256");
        name.parse()
            .map_err(|_| ConfigError::InvalidChecksumType(name.to_string()))
    }

    pub fn checksum_type(&self) -> Result<Option<ChecksumType>> {
        self.checksum_type
            .as_deref()
            .map(|name| {
                name.parse()
                    .map_err(|_| ConfigError::InvalidChecksumType(name.to_string()))
            })
            .transpose()
    }

    pub fn compression(&self) -> Result<CompressionType> {
        let name = self.compression.as_deref().unwrap_or("xz");
        match name.parse::<CompressionType>() {
            Ok(CompressionType::Bz2) | Err(_) => {
                Err(ConfigError::InvalidCompression(name.to_string()))
            }
            Ok(compression) => Ok(compression),
        }
    }

    pub fn index_filename(&self) -> &str {
        self.index_filename
            .as_deref()
            .unwrap_or(DEFAULT_INDEX_FILENAME)
    }

    pub fn get_cache_path(&self) -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var(CACHE_PATH_ENV) {
            return Ok(resolve_path(&env_path)?);
        }
        if let Some(cache_path) = &self.cache_path {
            return Ok(resolve_path(cache_path)?);
        }
        Ok(xdg_cache_home().join("deltarepo"))
    }

    pub fn enabled_mirrors(&self) -> impl Iterator<Item = &Mirror> {
        self.mirror.iter().filter(|m| m.is_enabled())
    }

    pub fn save(&self) -> Result<()> {
        let config_path = CONFIG_PATH.read().unwrap().to_path_buf();
        let serialized = toml::to_string_pretty(self)?;
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&config_path, serialized)?;
        info!("Configuration saved to {}", config_path.display());
        Ok(())
    }

    pub fn to_annotated_document(&self) -> Result<DocumentMut> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut doc = toml_string.parse::<DocumentMut>()?;

        annotate_toml_table::<Config>(doc.as_table_mut(), true)?;

        if let Some(mirrors_item) = doc.get_mut("mirror") {
            if let Some(mirrors_array) = mirrors_item.as_array_of_tables_mut() {
                annotate_toml_array_of_tables::<Mirror>(mirrors_array)?;
            }
        }

        Ok(doc)
    }
}

pub fn generate_default_config<T: AsRef<str>>(mirror_urls: &[T]) -> Result<()> {
    let config_path = CONFIG_PATH.read().unwrap().to_path_buf();

    if config_path.exists() {
        return Err(ConfigError::ConfigAlreadyExists);
    }

    let def_config = Config::default_config(mirror_urls);
    let annotated_doc = def_config.to_annotated_document()?;

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(&config_path, annotated_doc.to_string())?;
    info!(
        "Default configuration file generated with documentation at: {}",
        config_path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::{error::ConfigError, test_utils::EnvOverride};

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config::<&str>(&[]);

        assert_eq!(config.contenthash_type().unwrap(), ChecksumType::Sha256);
        assert_eq!(config.compression().unwrap(), CompressionType::Xz);
        assert_eq!(config.checksum_type().unwrap(), None);
        assert_eq!(config.index_filename(), "deltarepos.xml.xz");
        assert_eq!(config.force_database, Some(false));
        assert!(config.mirror.is_empty());
    }

    #[test]
    fn test_default_config_with_mirrors() {
        let config = Config::default_config(&["https://a.example/", "https://b.example/"]);

        assert_eq!(config.mirror.len(), 2);
        assert_eq!(config.mirror[1].name, "mirror-2");
        assert_eq!(config.enabled_mirrors().count(), 2);
    }

    #[test]
    fn test_config_resolve_invalid_contenthash() {
        let mut config = Config::default_config::<&str>(&[]);
        config.contenthash_type = Some("crc32".to_string());

        let result = config.resolve();
        assert!(matches!(result, Err(ConfigError::InvalidChecksumType(_))));
    }

    #[test]
    fn test_config_resolve_rejects_bz2_output() {
        let mut config = Config::default_config::<&str>(&[]);
        config.compression = Some("bz2".to_string());

        let result = config.resolve();
        assert!(matches!(result, Err(ConfigError::InvalidCompression(_))));
    }

    #[test]
    fn test_config_resolve_duplicate_mirror() {
        let mut config = Config::default_config(&["https://a.example/"]);
        config.mirror.push(Mirror {
            name: "mirror-1".to_string(),
            url: "https://b.example/".to_string(),
            enabled: None,
        });

        let result = config.resolve();
        assert!(matches!(result, Err(ConfigError::DuplicateMirrorName(_))));
    }

    #[test]
    fn test_config_resolve_invalid_mirror_url() {
        let mut config = Config::default_config(&["not a url"]);

        let result = config.resolve();
        assert!(matches!(result, Err(ConfigError::InvalidMirrorUrl(_))));
    }

    #[test]
    fn test_config_resolve_sets_defaults() {
        let mut config: Config = toml::from_str("").unwrap();

        config.resolve().unwrap();

        assert_eq!(config.contenthash_type.as_deref(), Some("sha256"));
        assert_eq!(config.compression.as_deref(), Some("xz"));
        assert_eq!(config.index_filename.as_deref(), Some(DEFAULT_INDEX_FILENAME));
        assert_eq!(config.ignore_missing, Some(false));
    }

    #[test]
    fn test_disabled_mirror_is_skipped() {
        let config: Config = toml::from_str(
            r#"
            [[mirror]]
            name = "primary"
            url = "https://a.example/"

            [[mirror]]
            name = "backup"
            url = "https://b.example/"
            enabled = false
            "#,
        )
        .unwrap();

        let names: Vec<_> = config.enabled_mirrors().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["primary"]);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config(&["https://a.example/"]);
        let serialized = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.mirror.len(), 1);
        assert_eq!(deserialized.contenthash_type, config.contenthash_type);
    }

    #[test]
    #[serial]
    fn test_cache_path_env_override() {
        let _env = EnvOverride::default().cache_path(Some("/custom/cache"));
        let mut config = Config::default_config::<&str>(&[]);
        config.cache_path = Some("/srv/deltarepo-cache".to_string());
        let cache_path = config.get_cache_path().unwrap();
        assert_eq!(cache_path, PathBuf::from("/custom/cache"));
    }

    #[test]
    #[serial]
    fn test_cache_path_from_config() {
        let _env = EnvOverride::default().cache_path(None);
        let mut config = Config::default_config::<&str>(&[]);
        config.cache_path = Some("/srv/deltarepo-cache".to_string());
        let cache_path = config.get_cache_path().unwrap();
        assert_eq!(cache_path, PathBuf::from("/srv/deltarepo-cache"));
    }

    #[test]
    #[serial]
    fn test_env_override_restores_previous_values() {
        std::env::set_var(CACHE_PATH_ENV, "/before");
        std::env::remove_var(CONFIG_PATH_ENV);
        {
            let _env = EnvOverride::default()
                .cache_path(None)
                .config_path(Some("/tmp/deltarepo.toml"));
            assert!(std::env::var(CACHE_PATH_ENV).is_err());
            assert_eq!(std::env::var(CONFIG_PATH_ENV).unwrap(), "/tmp/deltarepo.toml");
        }
        assert_eq!(std::env::var(CACHE_PATH_ENV).unwrap(), "/before");
        assert!(std::env::var(CONFIG_PATH_ENV).is_err());
        std::env::remove_var(CACHE_PATH_ENV);
    }
}
