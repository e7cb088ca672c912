//! Read-only view of a repository on disk.

use std::path::{Path, PathBuf};

use deltarepo_metadata::{repomd::has_checksum_prefix, Repomd, RepomdRecord};
use deltarepo_utils::hash::ChecksumType;
use tracing::debug;

use crate::{
    constants::PRIMARY,
    error::DeltaRepoError,
    identity::content_hash_of_primary,
    utils::{ensure_repository, repomd_path},
    DeltaRepoResult,
};

#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    pub path: PathBuf,
    pub repomd: Repomd,
    pub revision: Option<String>,
    /// Latest timestamp of all metadata records.
    pub timestamp: i64,
    pub contenthash: String,
    pub contenthash_type: ChecksumType,
}

impl RepoSnapshot {
    /// Loads the repository at `path` and calculates its content hash.
    pub fn load<P: AsRef<Path>>(path: P, contenthash_type: ChecksumType) -> DeltaRepoResult<Self> {
        Self::load_with(path, contenthash_type, true)
    }

    /// Like [`RepoSnapshot::load`], but trusts a `contenthash` of the same
    /// type already present in `repomd.xml` unless `calculate` is set.
    pub fn load_with<P: AsRef<Path>>(
        path: P,
        contenthash_type: ChecksumType,
        calculate: bool,
    ) -> DeltaRepoResult<Self> {
        let path = path.as_ref();
        ensure_repository(path)?;
        let repomd = Repomd::parse_file(repomd_path(path))?;
        let primary = primary_record(&repomd, path)?;

        let declared = repomd
            .contenthash
            .as_ref()
            .filter(|_| repomd.contenthash_type.as_deref() == Some(contenthash_type.name()));

        let contenthash = match declared {
            Some(hash) if !calculate => {
                debug!("Using contenthash from {}", repomd_path(path).display());
                hash.clone()
            }
            _ => content_hash_of_primary(existing_primary(primary, path)?, contenthash_type)?,
        };

        Ok(Self {
            path: path.to_path_buf(),
            revision: repomd.revision.clone(),
            timestamp: repomd.max_timestamp(),
            repomd,
            contenthash,
            contenthash_type,
        })
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.repomd.kinds()
    }

    pub fn record(&self, kind: &str) -> Option<&RepomdRecord> {
        self.repomd.record(kind)
    }

    pub fn primary(&self) -> DeltaRepoResult<&RepomdRecord> {
        primary_record(&self.repomd, &self.path)
    }

    /// Whether the metadata files carry a checksum prefix in their names.
    pub fn unique_md_filenames(&self) -> bool {
        self.record(PRIMARY)
            .is_some_and(|rec| has_checksum_prefix(rec.file_name()))
    }
}

pub(crate) fn primary_record<'a>(
    repomd: &'a Repomd,
    repo: &Path,
) -> DeltaRepoResult<&'a RepomdRecord> {
    repomd.record(PRIMARY).ok_or_else(|| {
        DeltaRepoError::MissingPrimary {
            path: repo.to_path_buf(),
        }
    })
}

fn existing_primary<'a>(record: &'a RepomdRecord, repo: &Path) -> DeltaRepoResult<&'a Path> {
    match record.location_real.as_deref() {
        Some(path) if path.is_file() => Ok(path),
        _ => {
            Err(DeltaRepoError::MissingPrimary {
                path: repo.to_path_buf(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::test_utils::{package, write_repo, RepoFixture};

    #[test]
    fn test_load_not_a_repository() {
        let dir = tempdir().unwrap();
        let err = RepoSnapshot::load(dir.path(), ChecksumType::Sha256).unwrap_err();
        assert!(matches!(err, DeltaRepoError::NotARepository { .. }));
    }

    #[test]
    fn test_load_without_primary() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("repodata")).unwrap();
        fs::write(repomd_path(dir.path()), "<repomd/>").unwrap();

        let err = RepoSnapshot::load(dir.path(), ChecksumType::Sha256).unwrap_err();
        assert!(matches!(err, DeltaRepoError::MissingPrimary { .. }));
    }

    #[test]
    fn test_load_calculates_contenthash() {
        let dir = tempdir().unwrap();
        let packages = vec![package("aaa", "p1"), package("bbb", "p2")];
        write_repo(dir.path(), &RepoFixture::new(&packages));

        let snapshot = RepoSnapshot::load(dir.path(), ChecksumType::Sha256).unwrap();
        let expected =
            crate::identity::compute_content_hash(&packages, ChecksumType::Sha256);
        assert_eq!(snapshot.contenthash, expected);
        assert!(snapshot.kinds().any(|k| k == "filelists"));
        assert!(snapshot.timestamp > 0);
        assert!(!snapshot.unique_md_filenames());
    }

    #[test]
    fn test_load_trusts_declared_contenthash() {
        let dir = tempdir().unwrap();
        let packages = vec![package("aaa", "p1")];
        let mut fixture = RepoFixture::new(&packages);
        fixture.contenthash = Some("declared".to_string());
        write_repo(dir.path(), &fixture);

        let trusted = RepoSnapshot::load_with(dir.path(), ChecksumType::Sha256, false).unwrap();
        assert_eq!(trusted.contenthash, "declared");

        let calculated = RepoSnapshot::load(dir.path(), ChecksumType::Sha256).unwrap();
        assert_ne!(calculated.contenthash, "declared");

        let other_type = RepoSnapshot::load_with(dir.path(), ChecksumType::Sha1, false).unwrap();
        assert_eq!(other_type.contenthash.len(), 40);
    }
}
