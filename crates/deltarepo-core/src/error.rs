//! Error types for deltarepo-core.

use std::path::PathBuf;

use deltarepo_config::error::ConfigError;
use deltarepo_dl::error::DownloadError;
use deltarepo_metadata::MetadataError;
use deltarepo_utils::error::{
    CompressionError, FileSystemError, HashError, LockError, PathError, UtilsError,
};
use miette::Diagnostic;
use thiserror::Error;

/// Which side of a delta a content hash belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashSide {
    Src,
    Dst,
}

impl std::fmt::Display for HashSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashSide::Src => write!(f, "source"),
            HashSide::Dst => write!(f, "destination"),
        }
    }
}

#[derive(Error, Diagnostic, Debug)]
pub enum DeltaRepoError {
    #[error("{0}")]
    #[diagnostic(code(deltarepo::configuration))]
    Configuration(String),

    #[error("Missing primary metadata in {}", path.display())]
    #[diagnostic(
        code(deltarepo::missing_primary),
        help("A repository without primary metadata cannot be diffed or patched")
    )]
    MissingPrimary { path: PathBuf },

    #[error("Not a repository: {}", path.display())]
    #[diagnostic(
        code(deltarepo::not_a_repository),
        help("The directory must contain repodata/repomd.xml")
    )]
    NotARepository { path: PathBuf },

    #[error("Bad delta identifier: {0}")]
    #[diagnostic(
        code(deltarepo::bad_delta_id),
        help("The delta repomd.xml contenthash must look like <src>-<dst>")
    )]
    BadDeltaIdentifier(String),

    #[error("Delta lists {0:?}, which is outside of the delta directory")]
    #[diagnostic(
        code(deltarepo::unsafe_location),
        help("Locations in a delta repomd.xml must be relative and stay inside the delta")
    )]
    UnsafeLocation(String),

    #[error("Delta is not suitable for this repository (expected {expected}, found {found})")]
    #[diagnostic(
        code(deltarepo::source_hash_mismatch),
        help("Resolve a delta path starting at the repository's current content hash")
    )]
    SourceHashMismatch { expected: String, found: String },

    #[error("Content hash of the {side} repository doesn't match ({expected} != {calculated})")]
    #[diagnostic(
        code(deltarepo::contenthash_mismatch),
        help("The delta is corrupted or does not belong to this repository")
    )]
    ContentHashMismatch {
        side: HashSide,
        expected: String,
        calculated: String,
    },

    #[error("Plugin {plugin}: {reason}")]
    #[diagnostic(
        code(deltarepo::plugin_contract),
        help("This is an internal error, please report it")
    )]
    PluginContractViolation { plugin: String, reason: String },

    #[error(
        "Delta of {kinds} was generated by {plugin} version {found}, only version {supported} \
         is available"
    )]
    #[diagnostic(
        code(deltarepo::plugin_version),
        help("Upgrade deltarepo to apply this delta")
    )]
    PluginVersion {
        plugin: String,
        kinds: String,
        found: u32,
        supported: u32,
    },

    #[error("Unknown checksum or compression: {0}")]
    #[diagnostic(code(deltarepo::unknown_checksum_or_compression))]
    UnknownChecksumOrCompression(String),

    #[error("File {} doesn't exist in the {repo} repository", path.display())]
    #[diagnostic(
        code(deltarepo::missing_file),
        help("Use --ignore-missing to ignore this error")
    )]
    MissingFile { repo: &'static str, path: PathBuf },

    #[error("Invalid deltametadata: {0}")]
    #[diagnostic(code(deltarepo::deltametadata))]
    DeltaMetadata(String),

    #[error("No delta path from {src} to {dst}")]
    #[diagnostic(
        code(deltarepo::unreachable),
        help("Fall back to downloading the full repository metadata")
    )]
    UnreachableTarget { src: String, dst: String },

    #[error("Checksum mismatch of downloaded file {}", path.display())]
    #[diagnostic(
        code(deltarepo::corrupt_download),
        help("The mirror may be out of sync, try again later or use another one")
    )]
    CorruptDownload { path: PathBuf },

    #[error("Error while {action}")]
    #[diagnostic(code(deltarepo::io), help("Check file permissions and disk space"))]
    IoError {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    #[diagnostic(code(deltarepo::utils))]
    Utils(#[from] UtilsError),
}

impl From<HashError> for DeltaRepoError {
    fn from(err: HashError) -> Self {
        match err {
            HashError::UnknownType { name } => Self::UnknownChecksumOrCompression(name),
            other => Self::Utils(other.into()),
        }
    }
}

impl From<CompressionError> for DeltaRepoError {
    fn from(err: CompressionError) -> Self {
        match err {
            CompressionError::UnknownType { name } => Self::UnknownChecksumOrCompression(name),
            CompressionError::Unsupported { name } => {
                Self::UnknownChecksumOrCompression(name.to_string())
            }
            other => Self::Utils(other.into()),
        }
    }
}

impl From<FileSystemError> for DeltaRepoError {
    fn from(err: FileSystemError) -> Self {
        Self::Utils(err.into())
    }
}

impl From<PathError> for DeltaRepoError {
    fn from(err: PathError) -> Self {
        Self::Utils(err.into())
    }
}

impl From<LockError> for DeltaRepoError {
    fn from(err: LockError) -> Self {
        Self::Utils(err.into())
    }
}

/// Trait for adding context to IO errors.
pub trait ErrorContext<T> {
    fn with_context<C>(self, context: C) -> std::result::Result<T, DeltaRepoError>
    where
        C: FnOnce() -> String;
}

impl<T> ErrorContext<T> for std::io::Result<T> {
    fn with_context<C>(self, context: C) -> std::result::Result<T, DeltaRepoError>
    where
        C: FnOnce() -> String,
    {
        self.map_err(|err| {
            DeltaRepoError::IoError {
                action: context(),
                source: err,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contenthash_mismatch_message() {
        let err = DeltaRepoError::ContentHashMismatch {
            side: HashSide::Dst,
            expected: "aaa".to_string(),
            calculated: "bbb".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Content hash of the destination repository doesn't match (aaa != bbb)"
        );
    }

    #[test]
    fn test_unknown_hash_maps_to_unknown_checksum() {
        let err: DeltaRepoError = HashError::UnknownType {
            name: "crc64".to_string(),
        }
        .into();
        assert!(
            matches!(err, DeltaRepoError::UnknownChecksumOrCompression(name) if name == "crc64")
        );
    }

    #[test]
    fn test_with_context() {
        let io: std::io::Result<()> = Err(std::io::Error::other("boom"));
        let err = io.with_context(|| "copying primary.xml".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "Error while copying primary.xml");
    }
}
