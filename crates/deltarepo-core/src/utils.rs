//! Utility functions for deltarepo-core.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use deltarepo_metadata::{REPODATA_DIR, REPOMD_FILENAME};

use crate::{
    constants::SCRATCH_PREFIX,
    error::{DeltaRepoError, ErrorContext},
    DeltaRepoResult,
};

/// `<repo>/repodata/repomd.xml`.
pub fn repomd_path<P: AsRef<Path>>(repo: P) -> PathBuf {
    repo.as_ref().join(REPODATA_DIR).join(REPOMD_FILENAME)
}

/// Whether `path` looks like a repository.
pub fn is_repository<P: AsRef<Path>>(path: P) -> bool {
    repomd_path(path).is_file()
}

/// Checks that `path` is a repository, failing with `NotARepository` otherwise.
pub fn ensure_repository<P: AsRef<Path>>(path: P) -> DeltaRepoResult<()> {
    let path = path.as_ref();
    if !path.is_dir() || !is_repository(path) {
        return Err(DeltaRepoError::NotARepository {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Scratch directory for a run writing into `out_dir`, unique per process.
pub fn scratch_dir<P: AsRef<Path>>(out_dir: P) -> PathBuf {
    out_dir
        .as_ref()
        .join(format!("{SCRATCH_PREFIX}-{}", std::process::id()))
}

/// Byte-wise file comparison.
pub fn files_identical<P: AsRef<Path>, Q: AsRef<Path>>(a: P, b: Q) -> DeltaRepoResult<bool> {
    let (a, b) = (a.as_ref(), b.as_ref());
    let meta_a = a
        .metadata()
        .with_context(|| format!("reading metadata of {}", a.display()))?;
    let meta_b = b
        .metadata()
        .with_context(|| format!("reading metadata of {}", b.display()))?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let open = |path: &Path| {
        File::open(path)
            .map(BufReader::new)
            .with_context(|| format!("opening {}", path.display()))
    };
    let (mut ra, mut rb) = (open(a)?, open(b)?);
    let mut buf_a = [0u8; 8192];
    let mut buf_b = [0u8; 8192];

    loop {
        let n = ra
            .read(&mut buf_a)
            .with_context(|| format!("reading {}", a.display()))?;
        if n == 0 {
            return Ok(true);
        }
        rb.read_exact(&mut buf_b[..n])
            .with_context(|| format!("reading {}", b.display()))?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

/// Splits a delta identifier `<src>-<dst>` into its two halves.
pub fn split_delta_id(id: &str) -> DeltaRepoResult<(&str, &str)> {
    let mut parts = id.split('-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(src), Some(dst), None) if !src.is_empty() && !dst.is_empty() => Ok((src, dst)),
        _ => Err(DeltaRepoError::BadDeltaIdentifier(id.to_string())),
    }
}
