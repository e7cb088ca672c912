//! Reconstruction of a new repository from an old one plus a delta.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use deltarepo_config::config::Config;
use deltarepo_metadata::{repomd::has_checksum_prefix, Repomd, REPODATA_DIR, REPOMD_FILENAME};
use deltarepo_utils::{
    compression::CompressionType,
    fs::{ensure_dir_exists, replace_dir, safe_remove},
    hash::ChecksumType,
};
use tracing::{debug, info, warn};

use crate::{
    constants::{DELTAMETADATA, PRIMARY, REMOVED},
    deltametadata::DeltaMetadata,
    error::{DeltaRepoError, HashSide},
    generator::{check_present, relocate, repo_hash},
    plugins::{
        run_apply, JobSettings, MainPlugin, MetadataUnit, PluginContext, PluginRegistry, Units,
    },
    removed::RemovedSet,
    repo::primary_record,
    utils::{ensure_repository, repomd_path, scratch_dir, split_delta_id},
    DeltaRepoResult,
};

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Regenerate sqlite databases even if the delta doesn't ask for them.
    pub force_database: bool,
    pub ignore_missing: bool,
    /// Compression of files written without a delta counterpart, like
    /// regenerated databases.
    pub compression: CompressionType,
    /// Used only when the delta doesn't declare its content hash type.
    pub contenthash_type: ChecksumType,
    /// The new repository is written to `<out_path>/repodata`.
    pub out_path: PathBuf,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            force_database: false,
            ignore_missing: false,
            compression: CompressionType::Xz,
            contenthash_type: ChecksumType::Sha256,
            out_path: PathBuf::from("."),
        }
    }
}

impl ApplyOptions {
    pub fn from_config<P: AsRef<Path>>(config: &Config, out_path: P) -> DeltaRepoResult<Self> {
        Ok(Self {
            force_database: config.force_database.unwrap_or(false),
            ignore_missing: config.ignore_missing.unwrap_or(false),
            compression: config.compression()?,
            contenthash_type: config.contenthash_type()?,
            out_path: out_path.as_ref().to_path_buf(),
        })
    }
}

/// Result of a successful application.
#[derive(Debug, Clone)]
pub struct AppliedDelta {
    /// Root of the produced repository.
    pub path: PathBuf,
    pub contenthash: String,
    pub contenthash_type: ChecksumType,
    pub repomd: Repomd,
}

pub struct DeltaApplicator<'r> {
    registry: &'r PluginRegistry,
    options: ApplyOptions,
}

impl<'r> DeltaApplicator<'r> {
    pub fn new(registry: &'r PluginRegistry, options: ApplyOptions) -> Self {
        Self {
            registry,
            options,
        }
    }

    pub fn options(&self) -> &ApplyOptions {
        &self.options
    }

    /// Applies the delta repository at `delta` on the repository at `old`.
    ///
    /// Nothing outside the scratch directory is touched until both content
    /// hashes have been verified.
    pub fn apply<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        old: P,
        delta: Q,
    ) -> DeltaRepoResult<AppliedDelta> {
        let (old, delta) = (old.as_ref(), delta.as_ref());
        let opts = &self.options;

        ensure_repository(old)?;
        ensure_repository(delta)?;
        let old_repomd = Repomd::parse_file(repomd_path(old))?;
        let delta_repomd = Repomd::parse_file(repomd_path(delta))?;

        let delta_id = delta_repomd.contenthash.as_deref().unwrap_or_default();
        let (src, dst) = split_delta_id(delta_id)?;
        let contenthash_type = match delta_repomd.contenthash_type.as_deref() {
            Some(name) => name.parse()?,
            None => opts.contenthash_type,
        };
        debug!("Delta {src} -> {dst}");

        if old_repomd.contenthash_type.as_deref() == Some(contenthash_type.name()) {
            if let Some(current) = old_repomd.contenthash.as_deref() {
                if current != src {
                    return Err(DeltaRepoError::SourceHashMismatch {
                        expected: src.to_string(),
                        found: current.to_string(),
                    });
                }
            }
        } else {
            debug!(
                "Different contenthash types, repo: {:?} vs delta: {}",
                old_repomd.contenthash_type, contenthash_type
            );
        }

        let old_primary = primary_record(&old_repomd, old)?;

        let notes = match delta_repomd.record(DELTAMETADATA) {
            Some(rec) => DeltaMetadata::parse_file(rec.real_path()?)?,
            None => {
                warn!("\"{DELTAMETADATA}\" record is missing in repomd.xml of the delta");
                DeltaMetadata::new()
            }
        };

        // An unchanged primary leaves no primary record in the delta.
        let primary_unchanged = notes
            .bundle(MainPlugin::NAME)
            .and_then(|bundle| bundle.metadata_notes(PRIMARY))
            .is_some_and(|n| n.flag("unchanged"));
        let reference_primary = match delta_repomd.record(PRIMARY) {
            Some(rec) => rec,
            None if primary_unchanged => old_primary,
            None => {
                return Err(DeltaRepoError::MissingPrimary {
                    path: delta.to_path_buf(),
                })
            }
        };
        let unique_md_filenames = has_checksum_prefix(reference_primary.file_name());

        info!("Applying delta {} on {}", delta.display(), old.display());

        ensure_dir_exists(&opts.out_path)?;
        let scratch = scratch_dir(&opts.out_path);
        safe_remove(&scratch)?;
        ensure_dir_exists(&scratch)?;

        let settings = JobSettings {
            out_dir: scratch.clone(),
            compression: opts.compression,
            unique_md_filenames,
            force_database: opts.force_database,
            ignore_missing: opts.ignore_missing,
            removed_files: RemovedSet::new(),
        };

        let kinds: BTreeSet<&str> = delta_repomd
            .kinds()
            .chain(old_repomd.kinds())
            .filter(|kind| *kind != DELTAMETADATA && *kind != REMOVED)
            .collect();
        let mut units = Units::new();
        for kind in kinds {
            units.insert(kind.to_string(), self.unit(kind, &old_repomd, &delta_repomd)?);
        }

        let mut context = PluginContext::with_contenthash_type(contenthash_type);
        let records = run_apply(
            self.registry,
            units,
            &mut context,
            &notes,
            &delta_repomd,
            &settings,
        )?;

        let mut repomd = Repomd {
            revision: delta_repomd.revision.clone(),
            repo_tags: delta_repomd.repo_tags.clone(),
            content_tags: delta_repomd.content_tags.clone(),
            distro_tags: delta_repomd.distro_tags.clone(),
            ..Default::default()
        };
        for record in records {
            repomd.set_record(record);
        }

        let calculated_src = match context.src_contenthash.take() {
            Some(hash) => hash,
            None => repo_hash(&old_repomd, old, contenthash_type)?,
        };
        let calculated_dst = match context.dst_contenthash.take() {
            Some(hash) => hash,
            None => repo_hash(&repomd, &opts.out_path, contenthash_type)?,
        };
        check_hash(src, &calculated_src, HashSide::Src)?;
        check_hash(dst, &calculated_dst, HashSide::Dst)?;

        repomd.set_contenthash(dst, contenthash_type);
        repomd.records.sort_by(|a, b| a.kind.cmp(&b.kind));
        repomd.write_file(scratch.join(REPOMD_FILENAME))?;

        let target = opts.out_path.join(REPODATA_DIR);
        if target.exists() {
            warn!("{} already exists, replacing it", target.display());
        }
        replace_dir(&scratch, &target)?;
        relocate(&mut repomd, &opts.out_path);
        info!("Repository {dst} written to {}", opts.out_path.display());

        Ok(AppliedDelta {
            path: opts.out_path.clone(),
            contenthash: dst.to_string(),
            contenthash_type,
            repomd,
        })
    }

    fn unit(&self, kind: &str, old: &Repomd, delta: &Repomd) -> DeltaRepoResult<MetadataUnit> {
        let mut unit = MetadataUnit::new(kind);
        unit.old_rec = old.record(kind).cloned();
        unit.delta_rec = delta.record(kind).cloned();

        check_present(unit.old_rec.as_ref(), "old", self.options.ignore_missing)?;
        check_present(unit.delta_rec.as_ref(), "delta", self.options.ignore_missing)?;

        if let Some(rec) = &unit.delta_rec {
            unit.checksum_type = rec.checksum_type.parse()?;
        } else if let Some(rec) = &unit.old_rec {
            unit.checksum_type = rec.checksum_type.parse()?;
        }
        unit.compression = match unit.delta_path().filter(|_| unit.delta_exists()) {
            Some(path) => CompressionType::detect_file(path)?,
            None => self.options.compression,
        };
        Ok(unit)
    }
}

fn check_hash(expected: &str, calculated: &str, side: HashSide) -> DeltaRepoResult<()> {
    if expected != calculated {
        return Err(DeltaRepoError::ContentHashMismatch {
            side,
            expected: expected.to_string(),
            calculated: calculated.to_string(),
        });
    }
    debug!("Calculated {side} content hash matches ({expected})");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Read};

    use deltarepo_metadata::{filelists::FilelistsReader, primary::PrimaryReader};
    use deltarepo_utils::compression::open_reader;
    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::{
        generator::{DeltaGenerator, GenerateOptions, GeneratedDelta},
        identity::compute_content_hash,
        repo::RepoSnapshot,
        test_utils::{package, write_repo, RepoFixture, COMPS},
    };

    struct Case {
        dir: TempDir,
        old: PathBuf,
        new: PathBuf,
        delta: GeneratedDelta,
    }

    fn case(old: &RepoFixture<'_>, new: &RepoFixture<'_>) -> Case {
        let dir = tempdir().unwrap();
        let (old_path, new_path) = (dir.path().join("old"), dir.path().join("new"));
        write_repo(&old_path, old);
        write_repo(&new_path, new);

        let registry = PluginRegistry::with_defaults();
        let options = GenerateOptions {
            out_path: dir.path().join("deltas"),
            ..Default::default()
        };
        let delta = DeltaGenerator::new(&registry, options)
            .generate(&old_path, &new_path)
            .unwrap();

        Case {
            dir,
            old: old_path,
            new: new_path,
            delta,
        }
    }

    fn apply_to(old: &Path, delta: &Path, out: &Path) -> DeltaRepoResult<AppliedDelta> {
        let registry = PluginRegistry::with_defaults();
        let options = ApplyOptions {
            out_path: out.to_path_buf(),
            ..Default::default()
        };
        DeltaApplicator::new(&registry, options).apply(old, delta)
    }

    fn pkgids(repomd: &Repomd) -> Vec<String> {
        let primary = repomd.record(PRIMARY).unwrap().real_path().unwrap();
        PrimaryReader::open(primary)
            .unwrap()
            .map(|p| p.unwrap().pkgid)
            .collect()
    }

    #[test]
    fn test_apply_added_package() {
        let p1 = package("aaa", "p1");
        let p2 = package("bbb", "p2");
        let old = [p1.clone()];
        let new = [p1.clone(), p2.clone()];
        let mut new_fixture = RepoFixture::new(&new);
        new_fixture.revision = Some("2".to_string());
        let c = case(&RepoFixture::new(&old), &new_fixture);

        let out = c.dir.path().join("out");
        let applied = apply_to(&c.old, &c.delta.path, &out).unwrap();

        let expected = compute_content_hash([&p1, &p2], ChecksumType::Sha256);
        assert_eq!(applied.contenthash, expected);
        assert_eq!(applied.path, out);
        assert_eq!(pkgids(&applied.repomd), ["aaa", "bbb"]);
        assert_eq!(applied.repomd.revision.as_deref(), Some("2"));

        let snapshot = RepoSnapshot::load(&out, ChecksumType::Sha256).unwrap();
        assert_eq!(snapshot.contenthash, expected);
        assert_eq!(snapshot.repomd.contenthash.as_deref(), Some(expected.as_str()));
        assert_eq!(
            snapshot.kinds().collect::<Vec<_>>(),
            ["filelists", "other", "primary"]
        );
        assert!(!out.join(format!(".repodata.tmp-{}", std::process::id())).exists());
    }

    #[test]
    fn test_apply_removes_exactly_the_removed_set() {
        let packages = [package("aaa", "p1"), package("bbb", "p2"), package("ccc", "p3")];
        let new = [packages[0].clone(), packages[2].clone(), package("ddd", "p4")];
        let c = case(&RepoFixture::new(&packages), &RepoFixture::new(&new));

        let applied = apply_to(&c.old, &c.delta.path, &c.dir.path().join("out")).unwrap();
        assert_eq!(pkgids(&applied.repomd), ["aaa", "ccc", "ddd"]);
        assert_eq!(applied.contenthash, c.delta.dst_contenthash);

        let new_snapshot = RepoSnapshot::load(&c.new, ChecksumType::Sha256).unwrap();
        assert_eq!(applied.contenthash, new_snapshot.contenthash);
    }

    #[test]
    fn test_apply_same_build_under_two_hrefs() {
        let p1 = package("aaa", "p1");
        let mut mirrored = p1.clone();
        mirrored.location_href = "mirror/p1.rpm".to_string();
        let old = [p1.clone()];
        let new = [p1.clone(), mirrored.clone(), package("bbb", "p2")];
        let c = case(&RepoFixture::new(&old), &RepoFixture::new(&new));

        let out = c.dir.path().join("out");
        let applied = apply_to(&c.old, &c.delta.path, &out).unwrap();

        let primary = applied.repomd.record(PRIMARY).unwrap().real_path().unwrap();
        let hrefs: Vec<String> = PrimaryReader::open(primary)
            .unwrap()
            .map(|p| p.unwrap().location_href)
            .collect();
        assert_eq!(hrefs, ["mirror/p1.rpm", "p1.rpm", "p2.rpm"]);

        let filelists = applied.repomd.record("filelists").unwrap().real_path().unwrap();
        let with_files = FilelistsReader::open(filelists)
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.pkgid == "aaa" && !e.files.is_empty())
            .count();
        assert_eq!(with_files, 2);

        let expected = compute_content_hash(&new, ChecksumType::Sha256);
        assert_eq!(applied.contenthash, expected);
        let snapshot = RepoSnapshot::load(&out, ChecksumType::Sha256).unwrap();
        assert_eq!(snapshot.contenthash, expected);
    }

    #[test]
    fn test_apply_unchanged_copies_old_files() {
        let packages = [package("aaa", "p1"), package("bbb", "p2")];
        let c = case(&RepoFixture::new(&packages), &RepoFixture::new(&packages));
        let out = c.dir.path().join("out");

        let applied = apply_to(&c.old, &c.delta.path, &out).unwrap();
        assert_eq!(applied.contenthash, c.delta.src_contenthash);

        let old_repomd = Repomd::parse_file(repomd_path(&c.old)).unwrap();
        for kind in ["primary", "filelists", "other"] {
            let read = |repomd: &Repomd| {
                fs::read(repomd.record(kind).unwrap().real_path().unwrap()).unwrap()
            };
            assert_eq!(read(&old_repomd), read(&applied.repomd), "{kind}");
        }
    }

    #[test]
    fn test_apply_group_and_databases() {
        let old = [package("aaa", "p1")];
        let new = [package("aaa", "p1"), package("bbb", "p2")];
        let new_comps = COMPS.replace("<id>core</id>", "<id>base</id>");

        let mut old_fixture = RepoFixture::new(&old);
        old_fixture.group = Some(COMPS);
        old_fixture.databases = true;
        let mut new_fixture = RepoFixture::new(&new);
        new_fixture.group = Some(new_comps.as_str());
        new_fixture.databases = true;
        let c = case(&old_fixture, &new_fixture);

        let applied = apply_to(&c.old, &c.delta.path, &c.dir.path().join("out")).unwrap();
        let group = applied.repomd.record("group").unwrap().real_path().unwrap();
        assert_eq!(fs::read_to_string(group).unwrap(), new_comps);
        for kind in ["primary_db", "filelists_db", "other_db"] {
            let record = applied.repomd.record(kind).unwrap();
            assert!(record.exists(), "{kind}");
            assert_eq!(record.database_version, Some(10));
        }
    }

    fn read_group(repomd: &Repomd, kind: &str) -> String {
        let path = repomd.record(kind).unwrap().real_path().unwrap().to_path_buf();
        let mut content = String::new();
        open_reader(path).unwrap().read_to_string(&mut content).unwrap();
        content
    }

    #[test]
    fn test_apply_regenerates_group_gz() {
        let packages = [package("aaa", "p1")];
        let new_comps = COMPS.replace("<id>core</id>", "<id>base</id>");
        let mut old_fixture = RepoFixture::new(&packages);
        old_fixture.group = Some(COMPS);
        old_fixture.group_gz = Some(COMPS);
        let mut new_fixture = RepoFixture::new(&packages);
        new_fixture.group = Some(new_comps.as_str());
        new_fixture.group_gz = Some(new_comps.as_str());
        let c = case(&old_fixture, &new_fixture);

        let notes = DeltaMetadata::parse_file(
            c.delta.repomd.record(DELTAMETADATA).unwrap().real_path().unwrap(),
        )
        .unwrap();
        let bundle = notes.bundle("GroupDeltaRepoPlugin").unwrap();
        assert!(bundle.metadata_notes("group").unwrap().flag("gen_group_gz"));
        assert!(c.delta.repomd.record("group_gz").is_none());

        let applied = apply_to(&c.old, &c.delta.path, &c.dir.path().join("out")).unwrap();
        assert_eq!(read_group(&applied.repomd, "group"), new_comps);
        assert_eq!(read_group(&applied.repomd, "group_gz"), new_comps);
    }

    #[test]
    fn test_apply_group_gz_kept_after_plain_group_removed() {
        let packages = [package("aaa", "p1")];
        let new_comps = COMPS.replace("<id>core</id>", "<id>base</id>");
        let mut old_fixture = RepoFixture::new(&packages);
        old_fixture.group = Some(COMPS);
        old_fixture.group_gz = Some(COMPS);
        let mut new_fixture = RepoFixture::new(&packages);
        new_fixture.group_gz = Some(new_comps.as_str());
        let c = case(&old_fixture, &new_fixture);

        let applied = apply_to(&c.old, &c.delta.path, &c.dir.path().join("out")).unwrap();
        assert!(applied.repomd.record("group").is_none());
        assert_eq!(read_group(&applied.repomd, "group_gz"), new_comps);
    }

    #[test]
    fn test_apply_group_gz_only_repository() {
        let old = [package("aaa", "p1")];
        let new = [package("aaa", "p1"), package("bbb", "p2")];
        let new_comps = COMPS.replace("<id>core</id>", "<id>base</id>");
        let mut old_fixture = RepoFixture::new(&old);
        old_fixture.group_gz = Some(COMPS);
        let mut new_fixture = RepoFixture::new(&new);
        new_fixture.group_gz = Some(new_comps.as_str());
        let c = case(&old_fixture, &new_fixture);

        let applied = apply_to(&c.old, &c.delta.path, &c.dir.path().join("out")).unwrap();
        assert!(applied.repomd.record("group").is_none());
        assert_eq!(read_group(&applied.repomd, "group_gz"), new_comps);
        assert_eq!(pkgids(&applied.repomd), ["aaa", "bbb"]);
    }

    #[test]
    fn test_apply_keeps_unique_md_filenames() {
        let old = [package("aaa", "p1")];
        let new = [package("bbb", "p2")];
        let mut old_fixture = RepoFixture::new(&old);
        old_fixture.unique_md_filenames = true;
        let mut new_fixture = RepoFixture::new(&new);
        new_fixture.unique_md_filenames = true;
        let c = case(&old_fixture, &new_fixture);

        let applied = apply_to(&c.old, &c.delta.path, &c.dir.path().join("out")).unwrap();
        for record in &applied.repomd.records {
            assert!(has_checksum_prefix(record.file_name()), "{}", record.location_href);
            assert!(record.exists());
        }
    }

    #[test]
    fn test_apply_on_wrong_repository() {
        let c = case(
            &RepoFixture::new(&[package("aaa", "p1")]),
            &RepoFixture::new(&[package("bbb", "p2")]),
        );
        let other = c.dir.path().join("other");
        write_repo(&other, &RepoFixture::new(&[package("zzz", "p9")]));

        let out = c.dir.path().join("out");
        let err = apply_to(&other, &c.delta.path, &out).unwrap_err();
        assert!(matches!(
            err,
            DeltaRepoError::ContentHashMismatch {
                side: HashSide::Src,
                ..
            }
        ));
        assert!(!out.join(REPODATA_DIR).exists());
    }

    #[test]
    fn test_apply_declared_source_hash_mismatch() {
        let c = case(
            &RepoFixture::new(&[package("aaa", "p1")]),
            &RepoFixture::new(&[package("bbb", "p2")]),
        );
        let declared = c.dir.path().join("declared");
        let packages = [package("aaa", "p1")];
        let mut fixture = RepoFixture::new(&packages);
        fixture.contenthash = Some("0123".to_string());
        write_repo(&declared, &fixture);

        let out = c.dir.path().join("out");
        let err = apply_to(&declared, &c.delta.path, &out).unwrap_err();
        assert!(matches!(err, DeltaRepoError::SourceHashMismatch { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn test_apply_bad_delta_identifier() {
        let c = case(
            &RepoFixture::new(&[package("aaa", "p1")]),
            &RepoFixture::new(&[package("bbb", "p2")]),
        );
        let mut repomd = Repomd::parse_file(repomd_path(&c.delta.path)).unwrap();
        repomd.set_contenthash("nodashes", ChecksumType::Sha256);
        repomd.write_file(repomd_path(&c.delta.path)).unwrap();

        let err = apply_to(&c.old, &c.delta.path, &c.dir.path().join("out")).unwrap_err();
        assert!(matches!(err, DeltaRepoError::BadDeltaIdentifier(_)));
    }

    #[test]
    fn test_apply_requires_old_repository() {
        let c = case(
            &RepoFixture::new(&[package("aaa", "p1")]),
            &RepoFixture::new(&[package("bbb", "p2")]),
        );
        let err = apply_to(&c.dir.path().join("missing"), &c.delta.path, c.dir.path())
            .unwrap_err();
        assert!(matches!(err, DeltaRepoError::NotARepository { .. }));
    }
}
