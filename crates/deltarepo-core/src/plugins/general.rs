//! Fallback for metadata no specialized plugin claims.

use deltarepo_metadata::RepomdRecord;

use super::{
    apply_basic_delta, gen_basic_delta, ApplyJob, BasicApply, BasicGen, DeltaPlugin, GenJob,
};
use crate::{error::DeltaRepoError, DeltaRepoResult};

/// Copies new metadata into the delta, or records that the old copy can be
/// reused. Never registered; the generator and applicator run it last over
/// whatever kinds are left.
pub struct GeneralPlugin;

impl GeneralPlugin {
    pub const NAME: &'static str = "GeneralDeltaPlugin";
    pub const VERSION: u32 = 1;
}

fn no_diff(kind: &str) -> DeltaRepoError {
    DeltaRepoError::PluginContractViolation {
        plugin: GeneralPlugin::NAME.to_string(),
        reason: format!("{kind} has no package-level delta"),
    }
}

impl DeltaPlugin for GeneralPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn version(&self) -> u32 {
        Self::VERSION
    }

    fn metadata_kinds(&self) -> &'static [&'static str] {
        &[]
    }

    fn generate(&self, job: &mut GenJob<'_>) -> DeltaRepoResult<Vec<RepomdRecord>> {
        let mut records = Vec::new();
        for (kind, unit) in job.units.iter_mut() {
            let BasicGen::Done { record, notes } = gen_basic_delta(unit, job.settings, true)?
            else {
                return Err(no_diff(kind));
            };
            records.extend(record);
            if let Some(notes) = notes {
                job.bundle.set_metadata_notes(kind, notes);
            }
        }
        Ok(records)
    }

    fn apply(&self, job: &mut ApplyJob<'_>) -> DeltaRepoResult<Vec<RepomdRecord>> {
        let mut records = Vec::new();
        for (kind, unit) in job.units.iter_mut() {
            let notes = job.bundle.metadata_notes(kind);
            let BasicApply::Done(record) = apply_basic_delta(unit, notes.as_ref(), job.settings)?
            else {
                return Err(no_diff(kind));
            };
            records.extend(record);
        }
        Ok(records)
    }
}
