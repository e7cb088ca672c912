use std::path::PathBuf;

use deltarepo_utils::error::{CompressionError, HashError, UtilsError};
use miette::Diagnostic;
use quick_xml::events::attributes::AttrError;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum MetadataError {
    #[error("XML error: {0}")]
    #[diagnostic(
        code(deltarepo_metadata::xml),
        help("The metadata file is not well-formed XML")
    )]
    Xml(#[from] quick_xml::Error),

    #[error("Invalid XML attribute: {0}")]
    #[diagnostic(code(deltarepo_metadata::xml_attribute))]
    XmlAttribute(#[from] AttrError),

    #[error("Unexpected end of document while reading <{element}>")]
    #[diagnostic(
        code(deltarepo_metadata::unexpected_eof),
        help("The metadata file is truncated")
    )]
    UnexpectedEof { element: String },

    #[error("Element <{element}> is missing attribute `{attribute}`")]
    #[diagnostic(code(deltarepo_metadata::missing_attribute))]
    MissingAttribute { element: String, attribute: String },

    #[error("Invalid value `{value}` in <{element}>")]
    #[diagnostic(code(deltarepo_metadata::invalid_value))]
    InvalidValue { element: String, value: String },

    #[error("Unexpected root element <{found}>, expected <{expected}>")]
    #[diagnostic(code(deltarepo_metadata::unexpected_root))]
    UnexpectedRoot { expected: String, found: String },

    #[error("Metadata file not found: {0}")]
    #[diagnostic(code(deltarepo_metadata::not_found))]
    NotFound(PathBuf),

    #[error("SQLite error: {0}")]
    #[diagnostic(
        code(deltarepo_metadata::sqlite),
        help("Check that the output directory is writable")
    )]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to {action}: {source}")]
    #[diagnostic(code(deltarepo_metadata::io))]
    IoError {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(code(deltarepo_metadata::utils))]
    Utils(#[from] UtilsError),
}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            action: "write metadata".to_string(),
            source: err,
        }
    }
}

impl From<CompressionError> for MetadataError {
    fn from(err: CompressionError) -> Self {
        Self::Utils(UtilsError::Compression(err))
    }
}

impl From<HashError> for MetadataError {
    fn from(err: HashError) -> Self {
        Self::Utils(UtilsError::Hash(err))
    }
}

pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

pub(crate) trait IoContext<T> {
    fn io_context<C>(self, context: C) -> MetadataResult<T>
    where
        C: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<C>(self, context: C) -> MetadataResult<T>
    where
        C: FnOnce() -> String,
    {
        self.map_err(|err| {
            MetadataError::IoError {
                action: context(),
                source: err,
            }
        })
    }
}
