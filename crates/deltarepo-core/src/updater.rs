//! Brings a local repository up to date by applying a chain of deltas
//! fetched from mirrors.

use std::path::{Component, Path, PathBuf};

use deltarepo_config::config::Config;
use deltarepo_dl::{download::Download, types::Source};
use deltarepo_metadata::{Repomd, REPODATA_DIR, REPOMD_FILENAME};
use deltarepo_utils::{
    compression::CompressionType,
    fs::{ensure_dir_exists, replace_dir, safe_remove},
    hash::{verify_checksum, ChecksumType},
    lock::DirLock,
};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    applicator::{ApplyOptions, DeltaApplicator},
    constants::UPDATE_PREFIX,
    error::DeltaRepoError,
    graph::{DeltaMirror, Link, ResolvedPath, Solver, UpdateGraph},
    plugins::PluginRegistry,
    repo::RepoSnapshot,
    utils::repomd_path,
    DeltaRepoResult,
};

/// Copies a remote or local file into place.
pub trait DeltaFetcher: Send + Sync {
    fn fetch(&self, location: &str, dest: &Path) -> DeltaRepoResult<()>;
}

/// Fetches through the shared HTTP agent, or from disk for local paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpFetcher;

impl DeltaFetcher for HttpFetcher {
    fn fetch(&self, location: &str, dest: &Path) -> DeltaRepoResult<()> {
        Download::new(location).output(dest).execute()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub contenthash_type: ChecksumType,
    pub force_database: bool,
    pub ignore_missing: bool,
    pub compression: CompressionType,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            contenthash_type: ChecksumType::Sha256,
            force_database: false,
            ignore_missing: false,
            compression: CompressionType::Xz,
        }
    }
}

impl UpdateOptions {
    pub fn from_config(config: &Config) -> DeltaRepoResult<Self> {
        Ok(Self {
            contenthash_type: config.contenthash_type()?,
            force_database: config.force_database.unwrap_or(false),
            ignore_missing: config.ignore_missing.unwrap_or(false),
            compression: config.compression()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate { contenthash: String },
    /// Nothing was fetched. `dst` is `None` when no target could be chosen.
    NoPath { src: String, dst: Option<String> },
    Updated {
        applied: Vec<Link>,
        final_hash: String,
    },
}

pub struct Updater<'r> {
    registry: &'r PluginRegistry,
    local: PathBuf,
    mirrors: Vec<DeltaMirror>,
    target: Option<String>,
    fetcher: Box<dyn DeltaFetcher>,
    /// Where fetched deltas are kept while they're applied.
    cache_dir: Option<PathBuf>,
    options: UpdateOptions,
}

impl<'r> Updater<'r> {
    pub fn new<P: AsRef<Path>>(
        registry: &'r PluginRegistry,
        local: P,
        options: UpdateOptions,
    ) -> Self {
        Self {
            registry,
            local: local.as_ref().to_path_buf(),
            mirrors: Vec::new(),
            target: None,
            fetcher: Box::new(HttpFetcher),
            cache_dir: None,
            options,
        }
    }

    pub fn mirror(mut self, mirror: DeltaMirror) -> Self {
        self.mirrors.push(mirror);
        self
    }

    pub fn mirrors<I: IntoIterator<Item = DeltaMirror>>(mut self, mirrors: I) -> Self {
        self.mirrors.extend(mirrors);
        self
    }

    /// Content hash to update to. Defaults to the newest delta destination.
    pub fn target<S: Into<String>>(mut self, contenthash: S) -> Self {
        self.target = Some(contenthash.into());
        self
    }

    pub fn fetcher<F: DeltaFetcher + 'static>(mut self, fetcher: F) -> Self {
        self.fetcher = Box::new(fetcher);
        self
    }

    /// Directory for downloaded deltas. Defaults to a work directory inside
    /// the local repository.
    pub fn cache_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cache_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    fn solver(&self) -> Solver {
        let mut solver = Solver::new(UpdateGraph::new(self.options.contenthash_type));
        for mirror in &self.mirrors {
            solver.load_mirror(mirror);
        }
        solver
    }

    /// Resolves the delta path for the local repository without fetching
    /// anything.
    pub fn resolve(&self) -> DeltaRepoResult<(String, Option<String>, Option<ResolvedPath>)> {
        let snapshot = RepoSnapshot::load(&self.local, self.options.contenthash_type)?;
        let mut solver = self.solver();

        let target = self
            .target
            .clone()
            .or_else(|| solver.graph().latest_target().map(str::to_string));
        let path = target
            .as_deref()
            .and_then(|dst| solver.solve(&snapshot.contenthash, dst));
        Ok((snapshot.contenthash, target, path))
    }

    pub fn update(&self) -> DeltaRepoResult<UpdateOutcome> {
        let _lock = DirLock::acquire(&self.local)?;

        let (src, target, path) = self.resolve()?;
        let Some(dst) = target else {
            warn!("No deltas available for {}", self.local.display());
            return Ok(UpdateOutcome::NoPath { src, dst: None });
        };
        if src == dst {
            info!("{} is up to date ({src})", self.local.display());
            return Ok(UpdateOutcome::UpToDate { contenthash: src });
        }
        let Some(path) = path else {
            warn!("No delta path from {src} to {dst}");
            return Ok(UpdateOutcome::NoPath {
                src,
                dst: Some(dst),
            });
        };

        info!(
            "Updating {} to {dst} through {} deltas ({} bytes)",
            self.local.display(),
            path.links.len(),
            path.cost
        );

        let workdir = self
            .local
            .join(format!("{UPDATE_PREFIX}-{}", std::process::id()));
        safe_remove(&workdir)?;
        ensure_dir_exists(&workdir)?;

        let final_repo = match self.apply_path(&path, &workdir) {
            Ok(repo) => repo,
            Err(err) => {
                if let Err(cleanup) = safe_remove(&workdir) {
                    warn!("Failed to remove {}: {cleanup}", workdir.display());
                }
                return Err(err);
            }
        };

        replace_dir(final_repo.join(REPODATA_DIR), self.local.join(REPODATA_DIR))?;
        safe_remove(&workdir)?;
        info!("{} updated to {dst}", self.local.display());

        Ok(UpdateOutcome::Updated {
            applied: path.links,
            final_hash: dst,
        })
    }

    /// Applies every hop in order, each result feeding the next one.
    fn apply_path(&self, path: &ResolvedPath, workdir: &Path) -> DeltaRepoResult<PathBuf> {
        let mut current = self.local.clone();
        let downloads = match &self.cache_dir {
            Some(dir) => dir.join(format!("{UPDATE_PREFIX}-{}", std::process::id())),
            None => workdir.to_path_buf(),
        };

        for (step, link) in path.links.iter().enumerate() {
            let delta_dir = downloads.join(format!("delta-{step}"));
            self.fetch_delta(link, &delta_dir)?;

            let options = ApplyOptions {
                force_database: self.options.force_database,
                ignore_missing: self.options.ignore_missing,
                compression: self.options.compression,
                contenthash_type: self.options.contenthash_type,
                out_path: workdir.join(format!("repo-{step}")),
            };
            let applied =
                DeltaApplicator::new(self.registry, options).apply(&current, &delta_dir)?;
            debug!("Step {} reached {}", step + 1, applied.contenthash);

            safe_remove(&delta_dir)?;
            if current != self.local {
                safe_remove(&current)?;
            }
            current = applied.path;
        }
        if self.cache_dir.is_some() {
            safe_remove(&downloads)?;
        }

        Ok(current)
    }

    /// Downloads the delta's `repomd.xml` and every file it lists.
    fn fetch_delta(&self, link: &Link, dest: &Path) -> DeltaRepoResult<()> {
        let root = Source::parse(&link.download_url()?)?;
        let repomd_location = root.join(&format!("{REPODATA_DIR}/{REPOMD_FILENAME}"))?;
        debug!("Fetching {repomd_location}");

        self.fetcher.fetch(&repomd_location.to_string(), &repomd_path(dest))?;
        let repomd = Repomd::parse_file(repomd_path(dest))?;

        let files = repomd
            .records
            .iter()
            .map(|record| -> DeltaRepoResult<_> {
                let path = location_in(dest, &record.location_href)?;
                let location = root.join(&record.location_href)?.to_string();
                Ok((location, path, record))
            })
            .collect::<DeltaRepoResult<Vec<_>>>()?;

        files.par_iter().try_for_each(|(location, path, record)| {
            self.fetcher.fetch(location, path)?;
            if !verify_checksum(path, record.checksum_type()?, &record.checksum)? {
                return Err(DeltaRepoError::CorruptDownload { path: path.clone() });
            }
            Ok(())
        })
    }
}

/// Local path of a file listed in a downloaded repomd.xml. Absolute hrefs and
/// `..` components are rejected.
fn location_in(dest: &Path, href: &str) -> DeltaRepoResult<PathBuf> {
    let relative = Path::new(href);
    let contained = !href.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !contained {
        return Err(DeltaRepoError::UnsafeLocation(href.to_string()));
    }
    Ok(dest.join(relative))
}
