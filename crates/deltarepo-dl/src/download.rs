use std::{
    fs::{self, File},
    io::{Read, Write as _},
    path::{Path, PathBuf},
};

use tracing::debug;
use ureq::{
    http::{
        header::{CONTENT_LENGTH, CONTENT_RANGE},
        Response,
    },
    Body,
};

use crate::{
    error::{DownloadError, IoContext},
    http::Http,
    types::{Progress, Source},
};

const PART_SUFFIX: &str = ".part";

pub struct Download {
    pub source: String,
    pub output: Option<PathBuf>,
    pub on_progress: Option<Box<dyn Fn(Progress) + Send + Sync>>,
}

impl Download {
    /// Creates a download for a URL or local path.
    ///
    /// # Examples
    ///
    /// ```
    /// use deltarepo_dl::download::Download;
    ///
    /// let dl = Download::new("https://example.com/repodata/repomd.xml")
    ///     .output("/tmp/repomd.xml");
    /// // `dl` is ready to call `execute()`
    /// ```
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            output: None,
            on_progress: None,
        }
    }

    /// Sets the destination file. Without one, the file name is taken from
    /// the last segment of the source and written to the current directory.
    pub fn output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn progress<F>(mut self, on_progress: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(on_progress));
        self
    }

    /// Performs the download and returns the final output path.
    ///
    /// Bytes are streamed into a sibling `.part` file which is renamed into
    /// place once the transfer completes, so an interrupted download never
    /// leaves a truncated file at the destination.
    pub fn execute(self) -> Result<PathBuf, DownloadError> {
        let source = Source::parse(&self.source)?;
        let output_path = match &self.output {
            Some(path) => path.clone(),
            None => PathBuf::from(file_name_of_source(&self.source)),
        };

        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .io_context(|| format!("create directory {}", parent.display()))?;
            }
        }

        let part_path = part_path_for(&output_path);
        debug!("fetching {} -> {}", source, output_path.display());

        let result = match &source {
            Source::Remote(url) => {
                let resp = Http::fetch(url.as_str())?;
                let total = parse_content_length(&resp);
                let reader = resp.into_body().into_reader();
                self.stream_to_file(reader, total, &part_path)
            }
            Source::Local(path) => {
                let file =
                    File::open(path).io_context(|| format!("open {}", path.display()))?;
                let total = file.metadata().map(|m| m.len()).unwrap_or(0);
                self.stream_to_file(file, total, &part_path)
            }
        };

        if let Err(err) = result {
            let _ = fs::remove_file(&part_path);
            return Err(err);
        }

        fs::rename(&part_path, &output_path).io_context(|| {
            format!(
                "rename {} to {}",
                part_path.display(),
                output_path.display()
            )
        })?;

        Ok(output_path)
    }

    fn stream_to_file<R: Read>(
        &self,
        mut reader: R,
        total: u64,
        path: &Path,
    ) -> Result<u64, DownloadError> {
        if let Some(ref cb) = self.on_progress {
            cb(Progress::Starting {
                total,
            });
        }

        let mut file = File::create(path).io_context(|| format!("create {}", path.display()))?;
        let mut buffer = [0u8; 8192];
        let mut downloaded = 0u64;

        loop {
            let n = reader
                .read(&mut buffer)
                .io_context(|| format!("read {}", self.source))?;
            if n == 0 {
                break;
            }

            file.write_all(&buffer[..n])
                .io_context(|| format!("write {}", path.display()))?;
            downloaded += n as u64;

            if let Some(ref cb) = self.on_progress {
                cb(Progress::Chunk {
                    current: downloaded,
                    total,
                });
            }
        }
        file.flush()
            .io_context(|| format!("flush {}", path.display()))?;

        if let Some(ref cb) = self.on_progress {
            cb(Progress::Complete {
                total: downloaded,
            });
        }

        Ok(downloaded)
    }
}

/// Read a small file, such as a `repomd.xml` or a delta index, fully into memory.
pub fn fetch_bytes(location: &str) -> Result<Vec<u8>, DownloadError> {
    match Source::parse(location)? {
        Source::Remote(url) => Http::bytes(url.as_str()),
        Source::Local(path) => fs::read(&path).io_context(|| format!("read {}", path.display())),
    }
}

fn part_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

fn file_name_of_source(source: &str) -> String {
    source
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// Total size of the response body from `Content-Range` or `Content-Length`,
/// or `0` when neither is usable.
fn parse_content_length(resp: &Response<Body>) -> u64 {
    resp.headers()
        .get(CONTENT_RANGE)
        .and_then(|h| h.to_str().ok())
        .and_then(|range| range.rsplit_once('/').and_then(|(_, tot)| tot.parse().ok()))
        .or_else(|| {
            resp.headers()
                .get(CONTENT_LENGTH)
                .and_then(|h| h.to_str().ok())
                .and_then(|len| len.parse::<u64>().ok())
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_download_local_file() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("primary.xml.xz");
        fs::write(&src, b"compressed bytes").unwrap();

        let dst = dir.path().join("out/nested/primary.xml.xz");
        let path = Download::new(src.to_string_lossy())
            .output(&dst)
            .execute()
            .unwrap();

        assert_eq!(path, dst);
        assert_eq!(fs::read(&dst).unwrap(), b"compressed bytes");
        assert!(!part_path_for(&dst).exists());
    }

    #[test]
    fn test_download_reports_progress() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("blob");
        fs::write(&src, vec![7u8; 20_000]).unwrap();

        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = Arc::clone(&seen);
        Download::new(format!("file://{}", src.display()))
            .output(dir.path().join("copy"))
            .progress(move |event| {
                if let Progress::Complete { total } = event {
                    seen_cb.store(total, Ordering::SeqCst);
                }
            })
            .execute()
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 20_000);
    }

    #[test]
    fn test_download_missing_source_leaves_nothing() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("out");
        let err = Download::new(dir.path().join("missing").to_string_lossy())
            .output(&dst)
            .execute()
            .unwrap_err();

        assert!(matches!(err, DownloadError::Io { .. }));
        assert!(!dst.exists());
        assert!(!part_path_for(&dst).exists());
    }

    #[test]
    fn test_fetch_bytes_local() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("repomd.xml");
        fs::write(&src, b"<repomd/>").unwrap();

        let data = fetch_bytes(&src.to_string_lossy()).unwrap();
        assert_eq!(data, b"<repomd/>");
    }

    #[test]
    fn test_file_name_of_source() {
        assert_eq!(
            file_name_of_source("https://example.com/a/deltarepos.xml.xz"),
            "deltarepos.xml.xz"
        );
        assert_eq!(file_name_of_source("https://example.com/a/"), "a");
    }
}
