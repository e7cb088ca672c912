use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum DownloadError {
    #[error("Invalid URL: {url}")]
    #[diagnostic(code(deltarepo_dl::invalid_url))]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Invalid location: {location}")]
    #[diagnostic(code(deltarepo_dl::invalid_location))]
    InvalidLocation { location: String },

    #[error("Unsupported URL scheme: {scheme}")]
    #[diagnostic(
        code(deltarepo_dl::unsupported_scheme),
        help("Use an http, https or file URL, or a plain filesystem path")
    )]
    UnsupportedScheme { scheme: String },

    #[error(transparent)]
    #[diagnostic(
        code(deltarepo_dl::network),
        help("Check your internet connection or try again later")
    )]
    Network(#[from] Box<ureq::Error>),

    #[error("HTTP {status}: {url}")]
    #[diagnostic(code(deltarepo_dl::http_error))]
    HttpError { status: u16, url: String },

    #[error("Failed to {action}")]
    #[diagnostic(code(deltarepo_dl::io))]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid response from server")]
    #[diagnostic(code(deltarepo_dl::invalid_response))]
    InvalidResponse,
}

pub type Result<T> = std::result::Result<T, DownloadError>;

impl From<ureq::Error> for DownloadError {
    fn from(e: ureq::Error) -> Self {
        Self::Network(Box::new(e))
    }
}

pub(crate) trait IoContext<T> {
    fn io_context<F>(self, action: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, action: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| {
            DownloadError::Io {
                action: action(),
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_invalid_url() {
        let err = DownloadError::InvalidUrl {
            url: "invalid".to_string(),
            source: url::ParseError::EmptyHost,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid URL"));
        assert!(msg.contains("invalid"));
    }

    #[test]
    fn test_download_error_http_error() {
        let err = DownloadError::HttpError {
            status: 404,
            url: "https://example.com/repodata/repomd.xml".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("HTTP 404"));
        assert!(msg.contains("repomd.xml"));
    }

    #[test]
    fn test_download_error_unsupported_scheme() {
        let err = DownloadError::UnsupportedScheme {
            scheme: "ftp".to_string(),
        };
        assert_eq!(err.to_string(), "Unsupported URL scheme: ftp");
    }

    #[test]
    fn test_from_ureq_error() {
        let download_err: DownloadError = ureq::Error::ConnectionFailed.into();
        assert!(matches!(download_err, DownloadError::Network(_)));
    }

    #[test]
    fn test_io_context_keeps_source() {
        let io: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        let err = io.io_context(|| "read /tmp/x".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "Failed to read /tmp/x");
        assert!(std::error::Error::source(&err).is_some());
    }
}
