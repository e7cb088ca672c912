use std::path::PathBuf;

use url::Url;

use crate::error::DownloadError;

/// Progress events emitted while a download is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Starting { total: u64 },
    Chunk { current: u64, total: u64 },
    Complete { total: u64 },
}

/// Where a download reads its bytes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Remote(Url),
    Local(PathBuf),
}

impl Source {
    /// Resolve a location string into a source.
    ///
    /// `http`, `https` and `file` URLs are accepted, and anything that does not
    /// parse as a URL is treated as a local filesystem path.
    pub fn parse(location: &str) -> Result<Self, DownloadError> {
        match Url::parse(location) {
            Ok(url) => {
                match url.scheme() {
                    "http" | "https" => Ok(Self::Remote(url)),
                    "file" => {
                        url.to_file_path().map(Self::Local).map_err(|_| {
                            DownloadError::InvalidLocation {
                                location: location.to_string(),
                            }
                        })
                    }
                    scheme => {
                        Err(DownloadError::UnsupportedScheme {
                            scheme: scheme.to_string(),
                        })
                    }
                }
            }
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok(Self::Local(PathBuf::from(location)))
            }
            Err(source) => {
                Err(DownloadError::InvalidUrl {
                    url: location.to_string(),
                    source,
                })
            }
        }
    }

    /// Join a relative path onto this source.
    pub fn join(&self, relative: &str) -> Result<Self, DownloadError> {
        match self {
            Self::Remote(url) => {
                let mut base = url.clone();
                if !base.path().ends_with('/') {
                    base.set_path(&format!("{}/", base.path()));
                }
                base.join(relative)
                    .map(Self::Remote)
                    .map_err(|source| {
                        DownloadError::InvalidUrl {
                            url: format!("{}{}", base, relative),
                            source,
                        }
                    })
            }
            Self::Local(path) => Ok(Self::Local(path.join(relative))),
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(url) => write!(f, "{}", url),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_parse_remote() {
        let source = Source::parse("https://example.com/deltarepos").unwrap();
        assert!(matches!(source, Source::Remote(_)));
    }

    #[test]
    fn test_source_parse_file_url() {
        let source = Source::parse("file:///srv/deltarepos").unwrap();
        assert_eq!(source, Source::Local(PathBuf::from("/srv/deltarepos")));
    }

    #[test]
    fn test_source_parse_plain_path() {
        let source = Source::parse("/srv/deltarepos").unwrap();
        assert_eq!(source, Source::Local(PathBuf::from("/srv/deltarepos")));

        let source = Source::parse("relative/dir").unwrap();
        assert_eq!(source, Source::Local(PathBuf::from("relative/dir")));
    }

    #[test]
    fn test_source_parse_unsupported_scheme() {
        let err = Source::parse("ftp://example.com/repo").unwrap_err();
        assert!(matches!(err, DownloadError::UnsupportedScheme { .. }));
    }

    #[test]
    fn test_source_join_remote_without_trailing_slash() {
        let source = Source::parse("https://example.com/deltarepos").unwrap();
        let joined = source.join("deltarepos.xml.xz").unwrap();
        assert_eq!(
            joined.to_string(),
            "https://example.com/deltarepos/deltarepos.xml.xz"
        );
    }

    #[test]
    fn test_source_join_local() {
        let source = Source::parse("/srv/deltarepos").unwrap();
        let joined = source.join("a-b/repodata/repomd.xml").unwrap();
        assert_eq!(
            joined,
            Source::Local(PathBuf::from("/srv/deltarepos/a-b/repodata/repomd.xml"))
        );
    }
}
