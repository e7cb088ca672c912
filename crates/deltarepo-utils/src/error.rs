use std::{error::Error, fmt, path::PathBuf};

#[derive(Debug)]
pub enum HashError {
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    UnknownType {
        name: String,
    },
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashError::ReadFailed { path, source } => {
                write!(f, "Failed to read file `{}`: {source}", path.display())
            }
            HashError::UnknownType { name } => {
                write!(f, "Unknown checksum type `{name}`")
            }
        }
    }
}

impl Error for HashError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HashError::ReadFailed { source, .. } => Some(source),
            HashError::UnknownType { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum CompressionError {
    UnknownType {
        name: String,
    },

    Unsupported {
        name: &'static str,
    },

    Codec {
        path: PathBuf,
        action: &'static str,
        source: std::io::Error,
    },
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionError::UnknownType { name } => {
                write!(f, "Unknown compression type `{name}`")
            }
            CompressionError::Unsupported { name } => {
                write!(f, "Compression `{name}` is recognized but not supported")
            }
            CompressionError::Codec {
                path,
                action,
                source,
            } => {
                write!(f, "Failed to {action} `{}`: {source}", path.display())
            }
        }
    }
}

impl Error for CompressionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CompressionError::Codec { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum PathError {
    CurrentDir { source: std::io::Error },

    Empty,

    MissingEnvVar { var: String, input: String },

    UnclosedVariable { input: String },
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathError::Empty => write!(f, "Path is empty"),
            PathError::CurrentDir { source } => {
                write!(f, "Failed to get current directory: {source}")
            }
            PathError::UnclosedVariable { input } => {
                write!(f, "Unclosed variable expression starting at `{input}`")
            }
            PathError::MissingEnvVar { var, input } => {
                write!(f, "Environment variable `{var}` not set in `{input}`")
            }
        }
    }
}

impl Error for PathError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PathError::CurrentDir { source } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum FileSystemError {
    File {
        path: PathBuf,
        action: &'static str,
        source: std::io::Error,
    },

    Directory {
        path: PathBuf,
        action: &'static str,
        source: std::io::Error,
    },

    NotADirectory {
        path: PathBuf,
    },
}

impl fmt::Display for FileSystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSystemError::File {
                path,
                action,
                source,
            } => {
                write!(f, "Failed to {action} file `{}`: {source}", path.display())
            }
            FileSystemError::Directory {
                path,
                action,
                source,
            } => {
                write!(
                    f,
                    "Failed to {action} directory `{}`: {source}",
                    path.display()
                )
            }
            FileSystemError::NotADirectory { path } => {
                write!(f, "`{}` is not a directory", path.display())
            }
        }
    }
}

impl Error for FileSystemError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FileSystemError::File { source, .. } => Some(source),
            FileSystemError::Directory { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum LockError {
    Io(std::io::Error),

    AcquireFailed(String),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Io(err) => write!(f, "Lock file error: {err}"),
            LockError::AcquireFailed(msg) => write!(f, "Failed to acquire lock on {msg}"),
        }
    }
}

impl Error for LockError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LockError::Io(err) => Some(err),
            LockError::AcquireFailed(_) => None,
        }
    }
}

impl From<std::io::Error> for LockError {
    fn from(err: std::io::Error) -> Self {
        LockError::Io(err)
    }
}

#[derive(Debug)]
pub enum UtilsError {
    Hash(HashError),
    Compression(CompressionError),
    Path(PathError),
    FileSystem(FileSystemError),
    Lock(LockError),
}

impl fmt::Display for UtilsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UtilsError::Hash(err) => write!(f, "{err}"),
            UtilsError::Compression(err) => write!(f, "{err}"),
            UtilsError::Path(err) => write!(f, "{err}"),
            UtilsError::FileSystem(err) => write!(f, "{err}"),
            UtilsError::Lock(err) => write!(f, "{err}"),
        }
    }
}

impl Error for UtilsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            UtilsError::Hash(err) => Some(err),
            UtilsError::Compression(err) => Some(err),
            UtilsError::Path(err) => Some(err),
            UtilsError::FileSystem(err) => Some(err),
            UtilsError::Lock(err) => Some(err),
        }
    }
}

impl From<HashError> for UtilsError {
    fn from(err: HashError) -> Self {
        UtilsError::Hash(err)
    }
}

impl From<CompressionError> for UtilsError {
    fn from(err: CompressionError) -> Self {
        UtilsError::Compression(err)
    }
}

impl From<PathError> for UtilsError {
    fn from(err: PathError) -> Self {
        UtilsError::Path(err)
    }
}

impl From<FileSystemError> for UtilsError {
    fn from(err: FileSystemError) -> Self {
        UtilsError::FileSystem(err)
    }
}

impl From<LockError> for UtilsError {
    fn from(err: LockError) -> Self {
        UtilsError::Lock(err)
    }
}

pub type CompressionResult<T> = std::result::Result<T, CompressionError>;
pub type FileSystemResult<T> = std::result::Result<T, FileSystemError>;
pub type HashResult<T> = std::result::Result<T, HashError>;
pub type LockResult<T> = std::result::Result<T, LockError>;
pub type PathResult<T> = std::result::Result<T, PathError>;

pub type UtilsResult<T> = std::result::Result<T, UtilsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_hash_error_display_and_source() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error = HashError::ReadFailed {
            path: PathBuf::from("/test"),
            source: io_error,
        };
        assert_eq!(
            error.to_string(),
            "Failed to read file `/test`: file not found"
        );
        assert!(error.source().is_some());

        let unknown = HashError::UnknownType {
            name: "crc32".to_string(),
        };
        assert_eq!(unknown.to_string(), "Unknown checksum type `crc32`");
        assert!(unknown.source().is_none());
    }

    #[test]
    fn test_compression_error_display_and_source() {
        let unknown = CompressionError::UnknownType {
            name: "lzfoo".to_string(),
        };
        assert_eq!(unknown.to_string(), "Unknown compression type `lzfoo`");
        assert!(unknown.source().is_none());

        let unsupported = CompressionError::Unsupported { name: "bz2" };
        assert_eq!(
            unsupported.to_string(),
            "Compression `bz2` is recognized but not supported"
        );

        let codec = CompressionError::Codec {
            path: PathBuf::from("/repodata/primary.xml.xz"),
            action: "decompress",
            source: io::Error::other("corrupt stream"),
        };
        assert_eq!(
            codec.to_string(),
            "Failed to decompress `/repodata/primary.xml.xz`: corrupt stream"
        );
        assert!(codec.source().is_some());
    }

    #[test]
    fn test_path_error_display_and_source() {
        let io_error = io::Error::other("some error");
        let current_dir_error = PathError::CurrentDir { source: io_error };
        assert_eq!(
            current_dir_error.to_string(),
            "Failed to get current directory: some error"
        );
        assert!(current_dir_error.source().is_some());

        let empty_error = PathError::Empty;
        assert_eq!(empty_error.to_string(), "Path is empty");
        assert!(empty_error.source().is_none());

        let missing_env_var_error = PathError::MissingEnvVar {
            var: "VAR".to_string(),
            input: "$VAR".to_string(),
        };
        assert_eq!(
            missing_env_var_error.to_string(),
            "Environment variable `VAR` not set in `$VAR`"
        );
    }

    #[test]
    fn test_file_system_error_display_and_source() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "permission denied");
        let file_error = FileSystemError::File {
            path: PathBuf::from("/file"),
            action: "read",
            source: io_error,
        };
        assert_eq!(
            file_error.to_string(),
            "Failed to read file `/file`: permission denied"
        );
        assert!(file_error.source().is_some());

        let not_a_dir_error = FileSystemError::NotADirectory {
            path: PathBuf::from("/path"),
        };
        assert_eq!(not_a_dir_error.to_string(), "`/path` is not a directory");
        assert!(not_a_dir_error.source().is_none());
    }

    #[test]
    fn test_utils_error_from() {
        let utils_error = UtilsError::from(HashError::UnknownType {
            name: "foo".to_string(),
        });
        assert_eq!(utils_error.to_string(), "Unknown checksum type `foo`");
        assert!(utils_error.source().is_some());

        let utils_error = UtilsError::from(LockError::AcquireFailed("/repo".into()));
        assert_eq!(utils_error.to_string(), "Failed to acquire lock on /repo");
    }
}
