//! Package-level deltas of primary, filelists and other metadata.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use deltarepo_metadata::{
    filelists::{FilelistsReader, FilelistsWriter},
    other::{OtherReader, OtherWriter},
    primary::{PrimaryReader, PrimaryWriter},
    sqlite::{build_database, DbKind},
    Package, RepomdRecord,
};
use deltarepo_utils::{compression::CompressionType, hash::ChecksumType};
use tracing::{debug, warn};

use super::{
    apply_basic_delta, gen_basic_delta, ApplyJob, BasicApply, BasicGen, ContextKey, DeltaPlugin,
    GenJob, JobSettings, MetadataUnit,
};
use crate::{
    constants::{FILELISTS, OTHER, PRIMARY, REMOVED, REMOVED_FILENAME},
    deltametadata::{MetadataNotes, PluginBundle},
    error::DeltaRepoError,
    identity::{
        compute_content_hash, content_hash_of_primary, sort_packages, ContentHasher,
        PackageIdentity,
    },
    removed::RemovedSet,
    DeltaRepoResult,
};

const XML_KINDS: [&str; 3] = [PRIMARY, FILELISTS, OTHER];

pub struct MainPlugin;

impl MainPlugin {
    pub const NAME: &'static str = "MainDeltaPlugin";
    pub const VERSION: u32 = 1;
}

impl DeltaPlugin for MainPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn version(&self) -> u32 {
        Self::VERSION
    }

    fn metadata_kinds(&self) -> &'static [&'static str] {
        &[
            "primary",
            "filelists",
            "other",
            "primary_db",
            "filelists_db",
            "other_db",
        ]
    }

    fn prerequisites(&self, kind: &str) -> &'static [&'static str] {
        match kind {
            "primary" | "primary_db" => &["primary"],
            "filelists" | "filelists_db" => &["primary", "filelists"],
            "other" | "other_db" => &["primary", "other"],
            _ => &[],
        }
    }

    fn gen_required_keys(&self) -> &'static [ContextKey] {
        &[ContextKey::ContentHashType]
    }

    fn gen_contributed_keys(&self) -> &'static [ContextKey] {
        &[
            ContextKey::SrcContentHash,
            ContextKey::DstContentHash,
            ContextKey::NoDatabase,
        ]
    }

    fn apply_required_keys(&self) -> &'static [ContextKey] {
        &[ContextKey::ContentHashType]
    }

    fn apply_contributed_keys(&self) -> &'static [ContextKey] {
        &[ContextKey::SrcContentHash, ContextKey::DstContentHash]
    }

    fn generate(&self, job: &mut GenJob<'_>) -> DeltaRepoResult<Vec<RepomdRecord>> {
        let hash_type = job.context.contenthash_type()?;
        let settings = job.settings;

        let db_available: BTreeMap<&str, bool> = XML_KINDS
            .iter()
            .map(|kind| {
                let db_kind = format!("{kind}_db");
                let available = job.units.get(&db_kind).is_some_and(MetadataUnit::new_exists);
                (*kind, available)
            })
            .collect();

        let mut primary = take_primary(&mut job.units)?;
        let mut filelists = job.units.remove(FILELISTS);
        let mut other = job.units.remove(OTHER);
        let mut records = Vec::new();

        let mut simple = |unit: Option<&mut MetadataUnit>, force_gen: bool| {
            match unit {
                Some(unit) => {
                    let bundle = &mut *job.bundle;
                    try_simple_gen(unit, force_gen, &db_available, bundle, settings, &mut records)
                }
                None => Ok(true),
            }
        };
        let simple_pri = simple(Some(&mut primary), false)?;
        let simple_fil = simple(filelists.as_mut(), simple_pri)?;
        let simple_oth = simple(other.as_mut(), simple_pri)?;

        let no_database = !db_available.values().any(|available| *available);

        if simple_pri {
            let src = primary_hash(primary.old_path(), hash_type)?;
            let dst = primary_hash(primary.new_path(), hash_type)?;
            store_hashes(job.bundle, hash_type, &src, &dst);
            job.context.set_src_contenthash(src)?;
            job.context.set_dst_contenthash(dst)?;
            job.context.set_no_database(no_database)?;
            return Ok(records);
        }

        let mut filelists = filelists.filter(|_| !simple_fil);
        let mut other = other.filter(|_| !simple_oth);

        let old_primary = existing_path(primary.old_path(), "old")?;
        let new_primary = existing_path(primary.new_path(), "new")?;

        let mut old_packages = BTreeSet::new();
        let mut src_hasher = ContentHasher::new(hash_type);
        for pkg in PrimaryReader::open(&old_primary)?.with_files(false) {
            let pkg = pkg?;
            src_hasher.add(&pkg);
            old_packages.insert(PackageIdentity::of(&pkg));
        }

        let mut added = Vec::new();
        let mut dst_hasher = ContentHasher::new(hash_type);
        for pkg in PrimaryReader::open(&new_primary)?.with_files(filelists.is_none()) {
            let pkg = pkg?;
            dst_hasher.add(&pkg);
            if !old_packages.remove(&PackageIdentity::of(&pkg)) {
                added.push(pkg);
            }
        }

        let src = src_hasher.finish();
        let dst = dst_hasher.finish();
        debug!(
            "{} added and {} removed packages",
            added.len(),
            old_packages.len()
        );

        let mut removed = settings.removed_files.clone();
        for id in old_packages {
            removed.add_package(id.location_href, id.location_base);
        }
        records.push(write_removed(&removed, settings, primary.checksum_type)?);

        let index = pkgid_index(&added);
        if let Some(unit) = &filelists {
            attach_files(&mut added, &index, &existing_path(unit.new_path(), "new")?)?;
        }
        if let Some(unit) = &other {
            attach_changelogs(&mut added, &index, &existing_path(unit.new_path(), "new")?)?;
        }

        for unit in [Some(&mut primary), filelists.as_mut(), other.as_mut()]
            .into_iter()
            .flatten()
        {
            let database = db_available
                .get(unit.kind.as_str())
                .copied()
                .unwrap_or(false)
                || settings.force_database;
            let mut notes = MetadataNotes::new();
            notes.set_flag("database", database);
            job.bundle.set_metadata_notes(&unit.kind, notes);

            let path = xml_path(settings, &unit.kind, unit.compression);
            write_packages(&unit.kind, &path, unit.compression, &added)?;

            let mut record = RepomdRecord::new(&unit.kind, &path);
            settings.finish_record(&mut record, unit.checksum_type)?;
            unit.delta_rec = Some(record.clone());
            records.push(record);
        }

        store_hashes(job.bundle, hash_type, &src, &dst);
        job.context.set_src_contenthash(src)?;
        job.context.set_dst_contenthash(dst)?;
        job.context.set_no_database(no_database)?;
        Ok(records)
    }

    fn apply(&self, job: &mut ApplyJob<'_>) -> DeltaRepoResult<Vec<RepomdRecord>> {
        let hash_type = job.context.contenthash_type()?;
        let settings = job.settings;
        let bundle = job.bundle;

        let mut primary = take_primary(&mut job.units)?;
        let mut filelists = job.units.remove(FILELISTS);
        let mut other = job.units.remove(OTHER);
        let mut records = Vec::new();

        let simple_pri = try_simple_apply(&mut primary, bundle, settings, &mut records)?;
        let simple_fil = match filelists.as_mut() {
            Some(unit) => try_simple_apply(unit, bundle, settings, &mut records)?,
            None => true,
        };
        let simple_oth = match other.as_mut() {
            Some(unit) => try_simple_apply(unit, bundle, settings, &mut records)?,
            None => true,
        };

        if simple_pri {
            if !simple_fil || !simple_oth {
                return Err(DeltaRepoError::DeltaMetadata(
                    "primary is stored as a copy but its companions are not".to_string(),
                ));
            }
            let src = primary_hash(primary.old_path(), hash_type)?;
            let dst = primary_hash(primary.new_path(), hash_type)?;
            job.context.set_src_contenthash(src)?;
            job.context.set_dst_contenthash(dst)?;
            return Ok(records);
        }

        let mut filelists = filelists.filter(|_| !simple_fil);
        let mut other = other.filter(|_| !simple_oth);

        let removed = match job.delta_repomd.record(REMOVED) {
            Some(rec) => RemovedSet::parse_file(rec.real_path()?)?,
            None => {
                warn!("\"{REMOVED}\" record is missing in the delta, no package is removed");
                RemovedSet::new()
            }
        };

        let with_files = filelists.is_none();
        let mut src_hasher = ContentHasher::new(hash_type);
        let mut all_packages: BTreeMap<PackageIdentity, Package> = BTreeMap::new();

        let old_primary = existing_path(primary.old_path(), "old")?;
        for pkg in PrimaryReader::open(&old_primary)?.with_files(with_files) {
            let pkg = pkg?;
            src_hasher.add(&pkg);
            if removed.contains_package(&pkg) {
                continue;
            }
            all_packages.insert(PackageIdentity::of(&pkg), pkg);
        }
        let delta_primary = existing_path(primary.delta_path(), "delta")?;
        for pkg in PrimaryReader::open(&delta_primary)?.with_files(with_files) {
            let pkg = pkg?;
            all_packages.insert(PackageIdentity::of(&pkg), pkg);
        }

        let mut packages: Vec<Package> = all_packages.into_values().collect();
        sort_packages(&mut packages);

        let index = pkgid_index(&packages);
        if let Some(unit) = &filelists {
            debug!("merging filelists");
            let old_path = existing_path(unit.old_path(), "old")?;
            let delta_path = existing_path(unit.delta_path(), "delta")?;
            for path in [old_path, delta_path] {
                attach_files(&mut packages, &index, &path)?;
            }
        }
        if let Some(unit) = &other {
            debug!("merging other");
            let old_path = existing_path(unit.old_path(), "old")?;
            let delta_path = existing_path(unit.delta_path(), "delta")?;
            for path in [old_path, delta_path] {
                attach_changelogs(&mut packages, &index, &path)?;
            }
        }

        for unit in [Some(&mut primary), filelists.as_mut(), other.as_mut()]
            .into_iter()
            .flatten()
        {
            let Some(notes) = bundle.metadata_notes(&unit.kind) else {
                warn!("{}: no record in deltametadata, ignoring", unit.kind);
                continue;
            };

            let path = xml_path(settings, &unit.kind, unit.compression);
            debug!("writing {}", path.display());
            write_packages(&unit.kind, &path, unit.compression, &packages)?;

            let mut record = RepomdRecord::new(&unit.kind, &path);
            record.fill(unit.checksum_type)?;

            if settings.force_database || notes.flag("database") {
                records.push(database_record(
                    &unit.kind,
                    &packages,
                    &record,
                    settings,
                    unit.checksum_type,
                )?);
            }

            if settings.unique_md_filenames {
                record.rename_file()?;
            }
            unit.new_rec = Some(record.clone());
            records.push(record);
        }

        job.context.set_src_contenthash(src_hasher.finish())?;
        job.context.set_dst_contenthash(compute_content_hash(&packages, hash_type))?;
        Ok(records)
    }
}

fn take_primary(units: &mut super::Units) -> DeltaRepoResult<MetadataUnit> {
    units.remove(PRIMARY).ok_or_else(|| {
        DeltaRepoError::PluginContractViolation {
            plugin: MainPlugin::NAME.to_string(),
            reason: "invoked without primary metadata".to_string(),
        }
    })
}

fn existing_path(path: Option<&Path>, repo: &'static str) -> DeltaRepoResult<PathBuf> {
    match path {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => {
            Err(DeltaRepoError::MissingFile {
                repo,
                path: path.to_path_buf(),
            })
        }
        None => {
            Err(DeltaRepoError::MissingPrimary {
                path: PathBuf::from(PRIMARY),
            })
        }
    }
}

fn primary_hash(path: Option<&Path>, hash_type: ChecksumType) -> DeltaRepoResult<String> {
    match path {
        Some(path) if path.is_file() => content_hash_of_primary(path, hash_type),
        other => {
            Err(DeltaRepoError::MissingPrimary {
                path: other.map(Path::to_path_buf).unwrap_or_default(),
            })
        }
    }
}

fn store_hashes(bundle: &mut PluginBundle, hash_type: ChecksumType, src: &str, dst: &str) {
    bundle.set("contenthash_type", hash_type.name());
    bundle.set("src_contenthash", src);
    bundle.set("dst_contenthash", dst);
}

fn xml_path(settings: &JobSettings, kind: &str, compression: CompressionType) -> PathBuf {
    settings
        .out_dir
        .join(format!("{kind}.xml{}", compression.suffix()))
}

fn try_simple_gen(
    unit: &mut MetadataUnit,
    force_gen: bool,
    db_available: &BTreeMap<&str, bool>,
    bundle: &mut PluginBundle,
    settings: &JobSettings,
    records: &mut Vec<RepomdRecord>,
) -> DeltaRepoResult<bool> {
    match gen_basic_delta(unit, settings, force_gen)? {
        BasicGen::NeedsDiff => Ok(false),
        BasicGen::Done { record, notes } => {
            records.extend(record);
            let mut notes = notes.unwrap_or_default();
            let database = db_available
                .get(unit.kind.as_str())
                .copied()
                .unwrap_or(false);
            notes.set_flag("database", database);
            bundle.set_metadata_notes(&unit.kind, notes);
            Ok(true)
        }
    }
}

fn try_simple_apply(
    unit: &mut MetadataUnit,
    bundle: &PluginBundle,
    settings: &JobSettings,
    records: &mut Vec<RepomdRecord>,
) -> DeltaRepoResult<bool> {
    let Some(notes) = bundle.metadata_notes(&unit.kind) else {
        warn!("{}: no record in deltametadata, ignoring", unit.kind);
        return Ok(true);
    };

    match apply_basic_delta(unit, Some(&notes), settings)? {
        BasicApply::NeedsMerge => Ok(false),
        BasicApply::Done(record) => {
            records.extend(record);
            if unit.new_exists() && (settings.force_database || notes.flag("database")) {
                let xml_record = unit.new_rec.clone().unwrap_or_default();
                let new_path = existing_path(unit.new_path(), "new")?;
                let packages = read_packages(&unit.kind, &new_path)?;
                records.push(database_record(
                    &unit.kind,
                    &packages,
                    &xml_record,
                    settings,
                    unit.checksum_type,
                )?);
            }
            Ok(true)
        }
    }
}

fn database_record(
    kind: &str,
    packages: &[Package],
    xml_record: &RepomdRecord,
    settings: &JobSettings,
    checksum_type: ChecksumType,
) -> DeltaRepoResult<RepomdRecord> {
    let db_kind = DbKind::from_metadata_kind(kind).ok_or_else(|| {
        DeltaRepoError::PluginContractViolation {
            plugin: MainPlugin::NAME.to_string(),
            reason: format!("no database exists for {kind}"),
        }
    })?;
    debug!("generating {}", db_kind.record_kind());

    let mut record = build_database(
        db_kind,
        &settings.out_dir,
        packages,
        xml_record,
        settings.compression,
        checksum_type,
    )?;
    if settings.unique_md_filenames {
        record.rename_file()?;
    }
    Ok(record)
}

fn write_removed(
    removed: &RemovedSet,
    settings: &JobSettings,
    checksum_type: ChecksumType,
) -> DeltaRepoResult<RepomdRecord> {
    let path = settings.out_dir.join(format!(
        "{REMOVED_FILENAME}{}",
        settings.compression.suffix()
    ));
    removed.write_file(&path)?;

    let mut record = RepomdRecord::new(REMOVED, &path);
    settings.finish_record(&mut record, checksum_type)?;
    Ok(record)
}

fn write_packages(
    kind: &str,
    path: &Path,
    compression: CompressionType,
    packages: &[Package],
) -> DeltaRepoResult<()> {
    match kind {
        PRIMARY => {
            let mut writer = PrimaryWriter::create(path, compression, packages.len())?;
            for pkg in packages {
                writer.add_package(pkg)?;
            }
            writer.finish()?;
        }
        FILELISTS => {
            let mut writer = FilelistsWriter::create(path, compression, packages.len())?;
            for pkg in packages {
                writer.add_package(pkg)?;
            }
            writer.finish()?;
        }
        OTHER => {
            let mut writer = OtherWriter::create(path, compression, packages.len())?;
            for pkg in packages {
                writer.add_package(pkg)?;
            }
            writer.finish()?;
        }
        other => {
            return Err(DeltaRepoError::PluginContractViolation {
                plugin: MainPlugin::NAME.to_string(),
                reason: format!("cannot write {other} metadata"),
            })
        }
    }
    Ok(())
}

/// Reads a whole XML metadata file into package records.
fn read_packages(kind: &str, path: &Path) -> DeltaRepoResult<Vec<Package>> {
    let mut packages = Vec::new();
    match kind {
        PRIMARY => {
            for pkg in PrimaryReader::open(path)?.with_files(true) {
                packages.push(pkg?);
            }
        }
        FILELISTS => {
            for entry in FilelistsReader::open(path)? {
                let entry = entry?;
                packages.push(Package {
                    pkgid: entry.pkgid,
                    name: entry.name,
                    arch: entry.arch,
                    files: entry.files,
                    ..Default::default()
                });
            }
        }
        OTHER => {
            for entry in OtherReader::open(path)? {
                let entry = entry?;
                packages.push(Package {
                    pkgid: entry.pkgid,
                    name: entry.name,
                    arch: entry.arch,
                    changelogs: entry.changelogs,
                    ..Default::default()
                });
            }
        }
        _ => {}
    }
    Ok(packages)
}

/// Positions of the packages sharing each pkgid. The same build may be
/// published under several hrefs.
fn pkgid_index(packages: &[Package]) -> HashMap<String, Vec<usize>> {
    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, pkg) in packages.iter().enumerate() {
        index.entry(pkg.pkgid.clone()).or_default().push(idx);
    }
    index
}

fn attach_files(
    packages: &mut [Package],
    index: &HashMap<String, Vec<usize>>,
    path: &Path,
) -> DeltaRepoResult<()> {
    for entry in FilelistsReader::open(path)? {
        let entry = entry?;
        for &idx in index.get(&entry.pkgid).into_iter().flatten() {
            packages[idx].files = entry.files.clone();
        }
    }
    Ok(())
}

fn attach_changelogs(
    packages: &mut [Package],
    index: &HashMap<String, Vec<usize>>,
    path: &Path,
) -> DeltaRepoResult<()> {
    for entry in OtherReader::open(path)? {
        let entry = entry?;
        for &idx in index.get(&entry.pkgid).into_iter().flatten() {
            packages[idx].changelogs = entry.changelogs.clone();
        }
    }
    Ok(())
}
