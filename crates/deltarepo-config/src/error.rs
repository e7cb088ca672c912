use deltarepo_utils::error::{PathError, UtilsError};
use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("TOML serialization error: {0}")]
    #[diagnostic(
        code(deltarepo_config::toml_serialize),
        help("Check your configuration structure for invalid values")
    )]
    TomlSerError(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    #[diagnostic(
        code(deltarepo_config::toml_deserialize),
        help("Check your config.toml syntax and structure")
    )]
    TomlDeError(#[from] toml::de::Error),

    #[error("Configuration file already exists")]
    #[diagnostic(
        code(deltarepo_config::already_exists),
        help("Remove the existing config file or use a different location")
    )]
    ConfigAlreadyExists,

    #[error("Invalid checksum type: {0}")]
    #[diagnostic(
        code(deltarepo_config::invalid_checksum),
        help("Use one of: md5, sha1, sha224, sha256, sha384, sha512")
    )]
    InvalidChecksumType(String),

    #[error("Invalid compression: {0}")]
    #[diagnostic(
        code(deltarepo_config::invalid_compression),
        help("Use one of: none, gz, xz, zstd")
    )]
    InvalidCompression(String),

    #[error("Invalid mirror URL: {0}")]
    #[diagnostic(
        code(deltarepo_config::invalid_mirror_url),
        help("Mirror URLs must be absolute, e.g. https://example.com/deltarepos/")
    )]
    InvalidMirrorUrl(String),

    #[error("Duplicate mirror name: {0}")]
    #[diagnostic(
        code(deltarepo_config::duplicate_mirror),
        help("Each mirror must have a unique name")
    )]
    DuplicateMirrorName(String),

    #[error("IO error: {0}")]
    #[diagnostic(code(deltarepo_config::io))]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(code(deltarepo_config::utils))]
    Utils(#[from] UtilsError),

    #[error("Failed to parse TOML: {0}")]
    #[diagnostic(code(deltarepo_config::toml))]
    Toml(#[from] toml_edit::TomlError),

    #[error("Encountered unexpected TOML item: {0}")]
    #[diagnostic(code(deltarepo_config::unexpected_toml_item))]
    UnexpectedTomlItem(String),
}

impl From<PathError> for ConfigError {
    fn from(err: PathError) -> Self {
        Self::Utils(UtilsError::Path(err))
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
