//! Generation of a delta repository from two versions of a repository.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use deltarepo_config::config::Config;
use deltarepo_metadata::{repomd::has_checksum_prefix, Repomd, RepomdRecord, REPODATA_DIR};
use deltarepo_utils::{
    compression::CompressionType,
    fs::{ensure_dir_exists, replace_dir, safe_remove},
    hash::ChecksumType,
};
use tracing::{debug, info, warn};

use crate::{
    constants::{DELTAMETADATA, REMOVED},
    deltametadata::DeltaMetadata,
    error::{DeltaRepoError, HashSide},
    identity::content_hash_of_primary,
    plugins::{run_generate, JobSettings, MetadataUnit, PluginContext, PluginRegistry, Units},
    removed::RemovedSet,
    repo::primary_record,
    utils::{ensure_repository, repomd_path, scratch_dir},
    DeltaRepoResult,
};

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub contenthash_type: ChecksumType,
    pub force_database: bool,
    /// Only warn about metadata files listed in repomd.xml but missing on disk.
    pub ignore_missing: bool,
    /// Compression of the notes and removed-set files.
    pub compression: CompressionType,
    /// Checksum of delta records. Defaults to the one of each new record.
    pub checksum_type: Option<ChecksumType>,
    pub skip_kinds: Vec<String>,
    pub only_kinds: Vec<String>,
    pub out_path: PathBuf,
    /// Write into `<out_path>/repodata` instead of `<out_path>/<src>-<dst>/repodata`.
    pub fixed_output: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            contenthash_type: ChecksumType::Sha256,
            force_database: false,
            ignore_missing: false,
            compression: CompressionType::Xz,
            checksum_type: None,
            skip_kinds: Vec::new(),
            only_kinds: Vec::new(),
            out_path: PathBuf::from("."),
            fixed_output: false,
        }
    }
}

impl GenerateOptions {
    pub fn from_config<P: AsRef<Path>>(config: &Config, out_path: P) -> DeltaRepoResult<Self> {
        Ok(Self {
            contenthash_type: config.contenthash_type()?,
            force_database: config.force_database.unwrap_or(false),
            ignore_missing: config.ignore_missing.unwrap_or(false),
            compression: config.compression()?,
            checksum_type: config.checksum_type()?,
            out_path: out_path.as_ref().to_path_buf(),
            ..Default::default()
        })
    }

    fn validate(&self) -> DeltaRepoResult<()> {
        if !self.skip_kinds.is_empty() && !self.only_kinds.is_empty() {
            return Err(DeltaRepoError::Configuration(
                "Options --skip and --only are mutually exclusive".to_string(),
            ));
        }
        if self.skip_kinds.iter().any(|k| k == crate::constants::PRIMARY) {
            return Err(DeltaRepoError::Configuration(
                "Primary metadata cannot be skipped".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a metadata kind takes part in the delta.
    fn wants(&self, kind: &str) -> bool {
        if kind == DELTAMETADATA || kind == REMOVED {
            return false;
        }
        if kind == crate::constants::PRIMARY {
            return true;
        }
        if !self.only_kinds.is_empty() {
            return self.only_kinds.iter().any(|k| k == kind);
        }
        !self.skip_kinds.iter().any(|k| k == kind)
    }
}

/// Result of a successful generation.
#[derive(Debug, Clone)]
pub struct GeneratedDelta {
    /// Root of the delta repository (the parent of its `repodata`).
    pub path: PathBuf,
    pub src_contenthash: String,
    pub dst_contenthash: String,
    pub contenthash_type: ChecksumType,
    pub repomd: Repomd,
}

impl GeneratedDelta {
    /// `<src>-<dst>`, also the default name of the delta directory.
    pub fn id(&self) -> String {
        format!("{}-{}", self.src_contenthash, self.dst_contenthash)
    }
}

pub struct DeltaGenerator<'r> {
    registry: &'r PluginRegistry,
    options: GenerateOptions,
}

impl<'r> DeltaGenerator<'r> {
    pub fn new(registry: &'r PluginRegistry, options: GenerateOptions) -> Self {
        Self {
            registry,
            options,
        }
    }

    pub fn options(&self) -> &GenerateOptions {
        &self.options
    }

    /// Generates the delta turning the repository at `old` into the one at
    /// `new`.
    ///
    /// Everything is written into a scratch directory inside `out_path` and
    /// only moved to its final location once the content hashes check out.
    pub fn generate<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        old: P,
        new: Q,
    ) -> DeltaRepoResult<GeneratedDelta> {
        let (old, new) = (old.as_ref(), new.as_ref());
        let opts = &self.options;
        opts.validate()?;

        ensure_repository(old)?;
        ensure_repository(new)?;
        let old_repomd = Repomd::parse_file(repomd_path(old))?;
        let new_repomd = Repomd::parse_file(repomd_path(new))?;
        primary_record(&old_repomd, old)?;
        let new_primary = primary_record(&new_repomd, new)?;
        let unique_md_filenames = has_checksum_prefix(new_primary.file_name());

        info!("Generating delta {} -> {}", old.display(), new.display());
        debug!("Unique md filenames: {unique_md_filenames}");

        ensure_dir_exists(&opts.out_path)?;
        let scratch = scratch_dir(&opts.out_path);
        safe_remove(&scratch)?;
        ensure_dir_exists(&scratch)?;

        let kinds: BTreeSet<&str> = old_repomd
            .kinds()
            .chain(new_repomd.kinds())
            .filter(|kind| opts.wants(kind))
            .collect();
        let mut units = Units::new();
        for kind in kinds {
            units.insert(kind.to_string(), self.unit(kind, &old_repomd, &new_repomd)?);
        }

        let mut removed_files = RemovedSet::new();
        for unit in units.values() {
            if let (Some(old_rec), None) = (&unit.old_rec, &unit.new_rec) {
                debug!("{} is gone from the new repository", unit.kind);
                removed_files.add_file(&old_rec.location_href, old_rec.location_base.clone());
            }
        }

        let settings = JobSettings {
            out_dir: scratch.clone(),
            compression: opts.compression,
            unique_md_filenames,
            force_database: opts.force_database,
            ignore_missing: opts.ignore_missing,
            removed_files,
        };

        let mut context = PluginContext::with_contenthash_type(opts.contenthash_type);
        let mut notes = DeltaMetadata::new();
        let records = run_generate(self.registry, units, &mut context, &mut notes, &settings)?;
        if context.no_database == Some(true) {
            debug!("The new repository has no sqlite databases");
        }

        let src = match context.src_contenthash.take() {
            Some(hash) => hash,
            None => repo_hash(&old_repomd, old, opts.contenthash_type)?,
        };
        let dst = match context.dst_contenthash.take() {
            Some(hash) => hash,
            None => repo_hash(&new_repomd, new, opts.contenthash_type)?,
        };
        check_declared_hash(&old_repomd, opts.contenthash_type, &src, HashSide::Src)?;
        check_declared_hash(&new_repomd, opts.contenthash_type, &dst, HashSide::Dst)?;
        info!("Content hashes {src} -> {dst}");

        notes.revision_src = old_repomd.revision.clone();
        notes.revision_dst = new_repomd.revision.clone();
        notes.contenthash_src = Some(src.clone());
        notes.contenthash_dst = Some(dst.clone());
        notes.contenthash_type = Some(opts.contenthash_type.name().to_string());
        notes.timestamp_src = Some(old_repomd.max_timestamp());
        notes.timestamp_dst = Some(new_repomd.max_timestamp());

        let notes_path = notes.write_into(&scratch, opts.compression)?;
        let mut notes_record = RepomdRecord::new(DELTAMETADATA, &notes_path);
        let checksum_type = match opts.checksum_type {
            Some(checksum_type) => checksum_type,
            None => new_primary.checksum_type.parse()?,
        };
        settings.finish_record(&mut notes_record, checksum_type)?;

        let mut repomd = Repomd {
            revision: new_repomd.revision.clone(),
            repo_tags: new_repomd.repo_tags.clone(),
            content_tags: new_repomd.content_tags.clone(),
            distro_tags: new_repomd.distro_tags.clone(),
            ..Default::default()
        };
        for record in records {
            repomd.set_record(record);
        }
        repomd.set_record(notes_record);
        repomd.set_contenthash(format!("{src}-{dst}"), opts.contenthash_type);
        repomd.records.sort_by(|a, b| a.kind.cmp(&b.kind));
        repomd.write_file(scratch.join(deltarepo_metadata::REPOMD_FILENAME))?;

        let delta_root = if opts.fixed_output {
            opts.out_path.clone()
        } else {
            opts.out_path.join(format!("{src}-{dst}"))
        };
        let target = delta_root.join(REPODATA_DIR);
        if target.exists() {
            warn!("{} already exists, replacing it", target.display());
        }
        ensure_dir_exists(&delta_root)?;
        replace_dir(&scratch, &target)?;
        relocate(&mut repomd, &delta_root);
        info!("Delta written to {}", delta_root.display());

        Ok(GeneratedDelta {
            path: delta_root,
            src_contenthash: src,
            dst_contenthash: dst,
            contenthash_type: opts.contenthash_type,
            repomd,
        })
    }

    fn unit(&self, kind: &str, old: &Repomd, new: &Repomd) -> DeltaRepoResult<MetadataUnit> {
        let mut unit = MetadataUnit::new(kind);
        unit.old_rec = old.record(kind).cloned();
        unit.new_rec = new.record(kind).cloned();

        check_present(unit.old_rec.as_ref(), "old", self.options.ignore_missing)?;
        check_present(unit.new_rec.as_ref(), "new", self.options.ignore_missing)?;

        unit.checksum_type = match (self.options.checksum_type, &unit.new_rec) {
            (Some(checksum_type), _) => checksum_type,
            (None, Some(rec)) => rec.checksum_type.parse()?,
            (None, None) => ChecksumType::default(),
        };
        unit.compression = match unit.new_path().filter(|_| unit.new_exists()) {
            Some(path) => CompressionType::detect_file(path)?,
            None => self.options.compression,
        };
        Ok(unit)
    }
}

/// Fails with `MissingFile` when a listed metadata file is absent, unless
/// missing files are tolerated.
pub(crate) fn check_present(
    record: Option<&RepomdRecord>,
    repo: &'static str,
    ignore_missing: bool,
) -> DeltaRepoResult<()> {
    let Some(record) = record else {
        return Ok(());
    };
    if record.exists() {
        return Ok(());
    }

    let path = record
        .location_real
        .clone()
        .unwrap_or_else(|| PathBuf::from(&record.location_href));
    if ignore_missing {
        warn!(
            "File {} doesn't exist in the {repo} repository",
            path.display()
        );
        return Ok(());
    }
    Err(DeltaRepoError::MissingFile {
        repo,
        path,
    })
}

/// Content hash of a repository calculated from its primary metadata.
pub(crate) fn repo_hash(
    repomd: &Repomd,
    repo: &Path,
    contenthash_type: ChecksumType,
) -> DeltaRepoResult<String> {
    let primary = primary_record(repomd, repo)?;
    match primary.location_real.as_deref() {
        Some(path) if path.is_file() => content_hash_of_primary(path, contenthash_type),
        _ => {
            Err(DeltaRepoError::MissingPrimary {
                path: repo.to_path_buf(),
            })
        }
    }
}

/// Compares a calculated hash with the `contenthash` of a repomd.xml when
/// both are of the same type.
fn check_declared_hash(
    repomd: &Repomd,
    contenthash_type: ChecksumType,
    calculated: &str,
    side: HashSide,
) -> DeltaRepoResult<()> {
    if repomd.contenthash_type.as_deref() != Some(contenthash_type.name()) {
        return Ok(());
    }
    match repomd.contenthash.as_deref() {
        Some(expected) if expected != calculated => {
            Err(DeltaRepoError::ContentHashMismatch {
                side,
                expected: expected.to_string(),
                calculated: calculated.to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// Points the real paths of records at their final location.
pub(crate) fn relocate(repomd: &mut Repomd, repo_root: &Path) {
    for record in &mut repomd.records {
        record.location_real = Some(repo_root.join(&record.location_href));
    }
}
