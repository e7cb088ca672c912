use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::error::{FileSystemError, FileSystemResult};

/// Removes a file or a whole directory tree. A missing path is not an error.
///
/// # Example
///
/// ```no_run
/// use deltarepo_utils::fs::safe_remove;
///
/// safe_remove("/tmp/deltarepo-doc/.repodata.tmp-1").unwrap();
/// ```
pub fn safe_remove<P: AsRef<Path>>(path: P) -> FileSystemResult<()> {
    let path = path.as_ref();
    let result = match fs::symlink_metadata(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        _ => fs::remove_file(path),
    };

    result.map_err(|err| {
        FileSystemError::File {
            path: path.to_path_buf(),
            action: "remove",
            source: err,
        }
    })
}

/// Creates `path` and its parents unless it already is a directory.
///
/// # Errors
///
/// * [`FileSystemError::Directory`] if the directory could not be created.
/// * [`FileSystemError::NotADirectory`] if something else exists at `path`.
pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> FileSystemResult<()> {
    let path = path.as_ref();
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(FileSystemError::NotADirectory {
            path: path.to_path_buf(),
        });
    }

    fs::create_dir_all(path).map_err(|err| {
        FileSystemError::Directory {
            path: path.to_path_buf(),
            action: "create",
            source: err,
        }
    })
}

/// Copies a file, wrapping failures in [`FileSystemError::File`].
pub fn copy_file<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dst: Q) -> FileSystemResult<u64> {
    let src = src.as_ref();
    fs::copy(src, dst.as_ref()).map_err(|err| FileSystemError::File {
        path: src.to_path_buf(),
        action: "copy",
        source: err,
    })
}

/// Replaces the directory `target` with `replacement`.
///
/// The existing directory is first renamed aside, then `replacement` is renamed into
/// place and only after that is the old copy deleted. A crash between the two renames
/// leaves the previous content recoverable next to `target` instead of losing it.
///
/// # Errors
///
/// * [`FileSystemError::Directory`] if any of the renames fails. When the second rename
///   fails the previous directory is moved back.
pub fn replace_dir<P: AsRef<Path>, Q: AsRef<Path>>(
    replacement: P,
    target: Q,
) -> FileSystemResult<()> {
    let (replacement, target) = (replacement.as_ref(), target.as_ref());

    let rename = |from: &Path, to: &Path| {
        fs::rename(from, to).map_err(|err| FileSystemError::Directory {
            path: from.to_path_buf(),
            action: "rename",
            source: err,
        })
    };

    if !target.exists() {
        return rename(replacement, target);
    }

    let backup = backup_path(target);
    safe_remove(&backup)?;
    rename(target, &backup)?;

    if let Err(err) = rename(replacement, target) {
        let _ = fs::rename(&backup, target);
        return Err(err);
    }

    safe_remove(&backup)
}

fn backup_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.old-{}", std::process::id()))
}
