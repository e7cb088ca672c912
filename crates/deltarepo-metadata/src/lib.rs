//! Readers and writers for rpm-md repository metadata.
//!
//! This crate knows how `repomd.xml`, `primary.xml`, `filelists.xml` and
//! `other.xml` look on disk and how their sqlite companions are laid out.
//! Higher level crates work with [`Package`] values and never touch XML.

pub mod error;
pub mod filelists;
pub mod other;
pub mod package;
pub mod primary;
pub mod repomd;
pub mod sqlite;
pub mod xml;

pub use error::{MetadataError, MetadataResult};
pub use package::{Changelog, Dependency, Package, PackageFile};
pub use repomd::{Repomd, RepomdRecord};

/// Name of the directory holding repository metadata.
pub const REPODATA_DIR: &str = "repodata";

/// File name of the repository descriptor.
pub const REPOMD_FILENAME: &str = "repomd.xml";

pub const XML_COMMON_NS: &str = "http://linux.duke.edu/metadata/common";
pub const XML_FILELISTS_NS: &str = "http://linux.duke.edu/metadata/filelists";
pub const XML_OTHER_NS: &str = "http://linux.duke.edu/metadata/other";
pub const XML_REPO_NS: &str = "http://linux.duke.edu/metadata/repo";
pub const XML_RPM_NS: &str = "http://linux.duke.edu/metadata/rpm";
