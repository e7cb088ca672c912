//! Copy-or-reuse handling shared by every plugin.
//!
//! These cover every situation where no package-level diff is needed:
//! metadata that was added, removed, left untouched, or whose old copy is
//! missing. Plugins fall back to a real diff only on [`BasicGen::NeedsDiff`].

use std::path::{Path, PathBuf};

use deltarepo_metadata::RepomdRecord;
use deltarepo_utils::{
    compression::{compress_file, decompress_file, is_compressed_name, CompressionType},
    fs::copy_file,
    hash::ChecksumType,
    path::file_name_of,
};
use tracing::{debug, warn};

use super::{JobSettings, MetadataUnit};
use crate::{deltametadata::MetadataNotes, utils::files_identical, DeltaRepoResult};

#[derive(Debug)]
pub enum BasicGen {
    Done {
        record: Option<RepomdRecord>,
        notes: Option<MetadataNotes>,
    },
    /// Both files exist and differ.
    NeedsDiff,
}

impl BasicGen {
    fn nothing() -> Self {
        BasicGen::Done {
            record: None,
            notes: None,
        }
    }
}

#[derive(Debug)]
pub enum BasicApply {
    Done(Option<RepomdRecord>),
    /// Old file and a real delta are both present.
    NeedsMerge,
}

fn existing(path: Option<&Path>, exists: bool) -> Option<PathBuf> {
    path.filter(|_| exists).map(Path::to_path_buf)
}

pub fn gen_basic_delta(
    unit: &mut MetadataUnit,
    settings: &JobSettings,
    force_gen: bool,
) -> DeltaRepoResult<BasicGen> {
    unit.delta_rec = None;

    if unit.old_rec.is_none() && unit.new_rec.is_none() {
        debug!("{}: doesn't exist in any repository", unit.kind);
        return Ok(BasicGen::nothing());
    }

    if unit.new_rec.is_none() {
        debug!("{}: removed in the new version of repodata", unit.kind);
        return Ok(BasicGen::nothing());
    }

    let Some(new_path) = existing(unit.new_path(), unit.new_exists()) else {
        warn!("{}: delta cannot be generated, new metadata is missing", unit.kind);
        return Ok(BasicGen::nothing());
    };

    let old_path = existing(unit.old_path(), unit.old_exists());
    let identical = match &old_path {
        Some(old_path) => files_identical(old_path, &new_path)?,
        None => false,
    };

    if old_path.is_none() || (force_gen && !identical) {
        if unit.old_rec.is_none() {
            debug!("{}: newly added in the new version of repodata", unit.kind);
        } else if old_path.is_none() {
            warn!(
                "{}: old metadata is missing, using a copy of the new one",
                unit.kind
            );
        } else {
            debug!("{}: delta is a copy of the new metadata", unit.kind);
        }

        let compress = !is_compressed_name(&file_name_of(&new_path));
        let record = gen_use_original(unit, &new_path, settings, compress)?;

        let mut notes = MetadataNotes::new();
        notes.set_flag("original", true);
        if compress {
            notes.set_flag("compressed", true);
        }

        unit.delta_rec = Some(record.clone());
        return Ok(BasicGen::Done {
            record: Some(record),
            notes: Some(notes),
        });
    }

    if identical {
        debug!("{}: same in both versions of repodata", unit.kind);
        let mut notes = MetadataNotes::new();
        let old_name = old_path.as_deref().map(file_name_of).unwrap_or_default();
        let new_name = file_name_of(&new_path);
        if old_name != new_name {
            notes.set("new_name", new_name);
        }
        notes.set_flag("unchanged", true);
        notes.set("checksum_name", unit.checksum_type.name());
        return Ok(BasicGen::Done {
            record: None,
            notes: Some(notes),
        });
    }

    Ok(BasicGen::NeedsDiff)
}

/// Puts the new file into the delta as is, xz-compressed unless it already is.
fn gen_use_original(
    unit: &MetadataUnit,
    new_path: &Path,
    settings: &JobSettings,
    compress: bool,
) -> DeltaRepoResult<RepomdRecord> {
    let name = file_name_of(new_path);
    let delta_path = if compress {
        let path = settings
            .out_dir
            .join(format!("{name}{}", CompressionType::Xz.suffix()));
        compress_file(new_path, &path, CompressionType::Xz)?;
        path
    } else {
        let path = settings.out_dir.join(&name);
        copy_file(new_path, &path)?;
        path
    };

    let mut record = RepomdRecord::new(&unit.kind, &delta_path);
    settings.finish_record(&mut record, unit.checksum_type)?;
    Ok(record)
}

pub fn apply_basic_delta(
    unit: &mut MetadataUnit,
    notes: Option<&MetadataNotes>,
    settings: &JobSettings,
) -> DeltaRepoResult<BasicApply> {
    unit.new_rec = None;

    let Some(notes) = notes else {
        return Ok(BasicApply::Done(None));
    };

    if unit.old_rec.is_none() && unit.delta_rec.is_none() {
        debug!("{}: doesn't exist in any repository", unit.kind);
        return Ok(BasicApply::Done(None));
    }

    let old_path = existing(unit.old_path(), unit.old_exists());

    if unit.delta_rec.is_none() {
        if !notes.flag("unchanged") {
            debug!("{}: removed in the new version of repodata", unit.kind);
            return Ok(BasicApply::Done(None));
        }

        let Some(old_path) = old_path else {
            warn!(
                "{}: should be copied from the old repository, but it is missing",
                unit.kind
            );
            return Ok(BasicApply::Done(None));
        };

        let name = notes
            .get("new_name")
            .map(str::to_string)
            .unwrap_or_else(|| file_name_of(&old_path));
        let checksum_type = notes
            .get("checksum_name")
            .map(str::parse::<ChecksumType>)
            .transpose()?
            .unwrap_or_default();

        let new_path = settings.out_dir.join(name);
        copy_file(&old_path, &new_path)?;

        let mut record = RepomdRecord::new(&unit.kind, &new_path);
        settings.finish_record(&mut record, checksum_type)?;
        unit.new_rec = Some(record.clone());
        return Ok(BasicApply::Done(Some(record)));
    }

    let Some(delta_path) = existing(unit.delta_path(), unit.delta_exists()) else {
        warn!("{}: delta file is missing", unit.kind);
        return Ok(BasicApply::Done(None));
    };

    if notes.flag("original") {
        debug!("{}: delta is a copy of the new metadata", unit.kind);
        let record = apply_use_original(unit, &delta_path, settings, notes.flag("compressed"))?;
        unit.new_rec = Some(record.clone());
        return Ok(BasicApply::Done(Some(record)));
    }

    if old_path.is_none() {
        warn!("{}: old file is missing", unit.kind);
        return Ok(BasicApply::Done(None));
    }

    Ok(BasicApply::NeedsMerge)
}

fn apply_use_original(
    unit: &MetadataUnit,
    delta_path: &Path,
    settings: &JobSettings,
    decompress: bool,
) -> DeltaRepoResult<RepomdRecord> {
    let name = file_name_of(delta_path);
    let new_path = if decompress {
        let stem = name.rsplit_once('.').map_or(name.as_str(), |(stem, _)| stem);
        let path = settings.out_dir.join(stem);
        decompress_file(delta_path, &path)?;
        path
    } else {
        let path = settings.out_dir.join(&name);
        copy_file(delta_path, &path)?;
        path
    };

    let mut record = RepomdRecord::new(&unit.kind, &new_path);
    settings.finish_record(&mut record, unit.checksum_type)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::removed::RemovedSet;

    struct Dirs {
        _root: TempDir,
        old: PathBuf,
        new: PathBuf,
        out: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = tempdir().unwrap();
        let old = root.path().join("old");
        let new = root.path().join("new");
        let out = root.path().join("out");
        for dir in [&old, &new, &out] {
            fs::create_dir_all(dir).unwrap();
        }
        Dirs {
            _root: root,
            old,
            new,
            out,
        }
    }

    fn settings(out: &Path) -> JobSettings {
        JobSettings {
            out_dir: out.to_path_buf(),
            compression: CompressionType::Xz,
            unique_md_filenames: false,
            force_database: false,
            ignore_missing: false,
            removed_files: RemovedSet::new(),
        }
    }

    fn record(kind: &str, path: &Path, content: &str) -> RepomdRecord {
        fs::write(path, content).unwrap();
        RepomdRecord::new(kind, path)
    }

    fn done(outcome: BasicGen) -> (Option<RepomdRecord>, Option<MetadataNotes>) {
        match outcome {
            BasicGen::Done { record, notes } => (record, notes),
            BasicGen::NeedsDiff => panic!("expected a basic delta"),
        }
    }

    #[test]
    fn test_identical_files_are_unchanged() {
        let d = dirs();
        let mut unit = MetadataUnit::new("group");
        unit.old_rec = Some(record("group", &d.old.join("comps.xml"), "<comps/>"));
        unit.new_rec = Some(record("group", &d.new.join("comps-new.xml"), "<comps/>"));

        let (record, notes) = done(gen_basic_delta(&mut unit, &settings(&d.out), true).unwrap());
        assert!(record.is_none());
        let notes = notes.unwrap();
        assert!(notes.flag("unchanged"));
        assert_eq!(notes.get("checksum_name"), Some("sha256"));
        assert_eq!(notes.get("new_name"), Some("comps-new.xml"));
    }

    #[test]
    fn test_differing_files_need_diff_unless_forced() {
        let d = dirs();
        let mut unit = MetadataUnit::new("primary");
        unit.old_rec = Some(record("primary", &d.old.join("primary.xml"), "a"));
        unit.new_rec = Some(record("primary", &d.new.join("primary.xml"), "b"));

        let outcome = gen_basic_delta(&mut unit, &settings(&d.out), false).unwrap();
        assert!(matches!(outcome, BasicGen::NeedsDiff));

        let (record, notes) = done(gen_basic_delta(&mut unit, &settings(&d.out), true).unwrap());
        let notes = notes.unwrap();
        assert!(notes.flag("original"));
        assert!(notes.flag("compressed"));
        let record = record.unwrap();
        assert_eq!(record.location_href, "repodata/primary.xml.xz");
        assert!(d.out.join("primary.xml.xz").is_file());
    }

    #[test]
    fn test_compressed_new_file_is_copied() {
        let d = dirs();
        let mut unit = MetadataUnit::new("group_gz");
        unit.new_rec = Some(record("group_gz", &d.new.join("comps.xml.gz"), "gz"));

        let (record, notes) = done(gen_basic_delta(&mut unit, &settings(&d.out), true).unwrap());
        let notes = notes.unwrap();
        assert!(notes.flag("original"));
        assert!(!notes.flag("compressed"));
        assert_eq!(record.unwrap().file_name(), "comps.xml.gz");
        assert_eq!(fs::read(d.out.join("comps.xml.gz")).unwrap(), b"gz");
    }

    #[test]
    fn test_removed_metadata_needs_nothing() {
        let d = dirs();
        let mut unit = MetadataUnit::new("updateinfo");
        unit.old_rec = Some(record("updateinfo", &d.old.join("updateinfo.xml"), "u"));

        let (record, notes) = done(gen_basic_delta(&mut unit, &settings(&d.out), true).unwrap());
        assert!(record.is_none());
        assert!(notes.is_none());
    }

    #[test]
    fn test_apply_unchanged_copies_old_file() {
        let d = dirs();
        let mut unit = MetadataUnit::new("group");
        unit.old_rec = Some(record("group", &d.old.join("comps.xml"), "<comps/>"));

        let mut notes = MetadataNotes::new();
        notes.set_flag("unchanged", true);
        notes.set("checksum_name", "sha1");
        notes.set("new_name", "renamed.xml");

        let outcome = apply_basic_delta(&mut unit, Some(&notes), &settings(&d.out)).unwrap();
        let BasicApply::Done(Some(record)) = outcome else {
            panic!("expected a record");
        };
        assert_eq!(record.checksum_type, "sha1");
        assert_eq!(fs::read(d.out.join("renamed.xml")).unwrap(), b"<comps/>");
        assert!(unit.new_exists());
    }

    #[test]
    fn test_apply_original_decompresses() {
        let d = dirs();
        let mut gen_unit = MetadataUnit::new("updateinfo");
        gen_unit.new_rec = Some(record("updateinfo", &d.new.join("updateinfo.xml"), "data"));
        let delta_dir = d.old.join("delta");
        fs::create_dir_all(&delta_dir).unwrap();
        let (record, notes) =
            done(gen_basic_delta(&mut gen_unit, &settings(&delta_dir), false).unwrap());

        let mut unit = MetadataUnit::new("updateinfo");
        unit.delta_rec = record;
        let outcome = apply_basic_delta(&mut unit, notes.as_ref(), &settings(&d.out)).unwrap();
        assert!(matches!(outcome, BasicApply::Done(Some(_))));
        assert_eq!(fs::read(d.out.join("updateinfo.xml")).unwrap(), b"data");
    }

    #[test]
    fn test_apply_without_notes_does_nothing() {
        let d = dirs();
        let mut unit = MetadataUnit::new("group");
        unit.old_rec = Some(record("group", &d.old.join("comps.xml"), "<comps/>"));

        let outcome = apply_basic_delta(&mut unit, None, &settings(&d.out)).unwrap();
        assert!(matches!(outcome, BasicApply::Done(None)));
        assert!(fs::read_dir(&d.out).unwrap().next().is_none());
    }

    #[test]
    fn test_apply_real_delta_needs_merge() {
        let d = dirs();
        let mut unit = MetadataUnit::new("primary");
        unit.old_rec = Some(record("primary", &d.old.join("primary.xml"), "a"));
        unit.delta_rec = Some(record("primary", &d.new.join("primary.xml"), "b"));

        let mut notes = MetadataNotes::new();
        notes.set_flag("database", false);
        let outcome = apply_basic_delta(&mut unit, Some(&notes), &settings(&d.out)).unwrap();
        assert!(matches!(outcome, BasicApply::NeedsMerge));
    }
}
