//! Comps (group) metadata, plain and gzip-compressed.

use deltarepo_metadata::RepomdRecord;
use deltarepo_utils::compression::{compress_file, CompressionType};
use tracing::debug;

use super::{
    apply_basic_delta, gen_basic_delta, ApplyJob, BasicApply, BasicGen, DeltaPlugin, GenJob,
    MetadataUnit,
};
use crate::{
    constants::{GROUP, GROUP_GZ},
    error::DeltaRepoError,
    DeltaRepoResult,
};

pub struct GroupsPlugin;

impl GroupsPlugin {
    pub const NAME: &'static str = "GroupDeltaRepoPlugin";
    pub const VERSION: u32 = 1;
}

fn no_diff(kind: &str) -> DeltaRepoError {
    DeltaRepoError::PluginContractViolation {
        plugin: GroupsPlugin::NAME.to_string(),
        reason: format!("{kind} has no package-level delta"),
    }
}

impl DeltaPlugin for GroupsPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn version(&self) -> u32 {
        Self::VERSION
    }

    fn metadata_kinds(&self) -> &'static [&'static str] {
        &["group", "group_gz"]
    }

    fn prerequisites(&self, kind: &str) -> &'static [&'static str] {
        match kind {
            "group" => &["group"],
            "group_gz" => &["group", "group_gz"],
            _ => &[],
        }
    }

    fn generate(&self, job: &mut GenJob<'_>) -> DeltaRepoResult<Vec<RepomdRecord>> {
        let group_gz_available = job.units.get(GROUP_GZ).is_some_and(MetadataUnit::new_exists);

        // The gzip variant is rebuilt from the plain one when both exist.
        let (kind, gen_group_gz) = match job.units.get(GROUP) {
            Some(unit) if unit.new_exists() => (GROUP, Some(group_gz_available)),
            _ if group_gz_available => (GROUP_GZ, None),
            _ => return Ok(Vec::new()),
        };
        let Some(unit) = job.units.get_mut(kind) else {
            return Ok(Vec::new());
        };

        let BasicGen::Done { record, notes } = gen_basic_delta(unit, job.settings, true)? else {
            return Err(no_diff(kind));
        };
        if let Some(mut notes) = notes {
            if let Some(gen_group_gz) = gen_group_gz {
                notes.set_flag("gen_group_gz", gen_group_gz);
            }
            job.bundle.set_metadata_notes(kind, notes);
        }
        Ok(record.into_iter().collect())
    }

    fn apply(&self, job: &mut ApplyJob<'_>) -> DeltaRepoResult<Vec<RepomdRecord>> {
        // Generation notes exactly one of the two kinds.
        let Some((kind, notes)) = [GROUP, GROUP_GZ]
            .into_iter()
            .find_map(|kind| job.bundle.metadata_notes(kind).map(|notes| (kind, notes)))
        else {
            debug!("no group metadata in the new repository");
            return Ok(Vec::new());
        };
        let Some(unit) = job.units.get_mut(kind) else {
            return Ok(Vec::new());
        };

        let BasicApply::Done(record) = apply_basic_delta(unit, Some(&notes), job.settings)?
        else {
            return Err(no_diff(kind));
        };
        let Some(record) = record else {
            return Ok(Vec::new());
        };

        let mut records = vec![record];
        if kind == GROUP && notes.flag("gen_group_gz") {
            let group_path = records[0].real_path()?.to_path_buf();
            let mut gz_name = group_path.as_os_str().to_owned();
            gz_name.push(CompressionType::Gz.suffix());
            let gz_path = std::path::PathBuf::from(gz_name);
            debug!("regenerating {GROUP_GZ} from {}", group_path.display());

            compress_file(&group_path, &gz_path, CompressionType::Gz)?;
            let mut gz_record = RepomdRecord::new(GROUP_GZ, &gz_path);
            job.settings.finish_record(&mut gz_record, unit.checksum_type)?;
            records.push(gz_record);
        }
        Ok(records)
    }
}
