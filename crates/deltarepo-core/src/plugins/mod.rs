//! Delta plugins and the loop that dispatches metadata kinds to them.
//!
//! Every plugin claims a fixed set of metadata kinds and declares which
//! [`ContextKey`]s it needs before running and which ones it fills in. The
//! driver runs plugins until no more progress is possible; whatever kinds are
//! left afterwards go to the [`GeneralPlugin`].

mod basic;
mod general;
mod groups;
mod main;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
};

pub use basic::{apply_basic_delta, gen_basic_delta, BasicApply, BasicGen};
use deltarepo_metadata::{Repomd, RepomdRecord};
use deltarepo_utils::{compression::CompressionType, hash::ChecksumType};
pub use general::GeneralPlugin;
pub use groups::GroupsPlugin;
pub use main::MainPlugin;
use tracing::debug;

use crate::{
    deltametadata::{DeltaMetadata, PluginBundle},
    error::DeltaRepoError,
    removed::RemovedSet,
    DeltaRepoResult,
};

/// Keys of the context shared between plugins during one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContextKey {
    ContentHashType,
    SrcContentHash,
    DstContentHash,
    NoDatabase,
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextKey::ContentHashType => "contenthash_type",
            ContextKey::SrcContentHash => "src_contenthash",
            ContextKey::DstContentHash => "dst_contenthash",
            ContextKey::NoDatabase => "no_database",
        };
        write!(f, "{name}")
    }
}

/// Values shared between plugins and the generator/applicator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginContext {
    pub contenthash_type: Option<ChecksumType>,
    pub src_contenthash: Option<String>,
    pub dst_contenthash: Option<String>,
    pub no_database: Option<bool>,
}

impl PluginContext {
    pub fn with_contenthash_type(contenthash_type: ChecksumType) -> Self {
        Self {
            contenthash_type: Some(contenthash_type),
            ..Default::default()
        }
    }

    pub fn has(&self, key: ContextKey) -> bool {
        match key {
            ContextKey::ContentHashType => self.contenthash_type.is_some(),
            ContextKey::SrcContentHash => self.src_contenthash.is_some(),
            ContextKey::DstContentHash => self.dst_contenthash.is_some(),
            ContextKey::NoDatabase => self.no_database.is_some(),
        }
    }
}

/// Write access to the context restricted to the keys a plugin declared.
#[derive(Debug)]
pub struct ContextWriter {
    plugin: &'static str,
    values: PluginContext,
    allowed: BTreeSet<ContextKey>,
    written: BTreeSet<ContextKey>,
    violation: Option<ContextKey>,
}

impl ContextWriter {
    fn new(plugin: &'static str, values: PluginContext, allowed: &[ContextKey]) -> Self {
        Self {
            plugin,
            values,
            allowed: allowed.iter().copied().collect(),
            written: BTreeSet::new(),
            violation: None,
        }
    }

    pub fn get(&self) -> &PluginContext {
        &self.values
    }

    /// The content hash type every run is seeded with.
    pub fn contenthash_type(&self) -> DeltaRepoResult<ChecksumType> {
        self.values.contenthash_type.ok_or_else(|| {
            DeltaRepoError::PluginContractViolation {
                plugin: self.plugin.to_string(),
                reason: format!("{} is not available", ContextKey::ContentHashType),
            }
        })
    }

    fn claim(&mut self, key: ContextKey) -> DeltaRepoResult<()> {
        if !self.allowed.contains(&key) {
            self.violation.get_or_insert(key);
            return Err(undeclared_write(self.plugin, key));
        }
        self.written.insert(key);
        Ok(())
    }

    pub fn set_contenthash_type(&mut self, value: ChecksumType) -> DeltaRepoResult<()> {
        self.claim(ContextKey::ContentHashType)?;
        self.values.contenthash_type = Some(value);
        Ok(())
    }

    pub fn set_src_contenthash<S: Into<String>>(&mut self, value: S) -> DeltaRepoResult<()> {
        self.claim(ContextKey::SrcContentHash)?;
        self.values.src_contenthash = Some(value.into());
        Ok(())
    }

    pub fn set_dst_contenthash<S: Into<String>>(&mut self, value: S) -> DeltaRepoResult<()> {
        self.claim(ContextKey::DstContentHash)?;
        self.values.dst_contenthash = Some(value.into());
        Ok(())
    }

    pub fn set_no_database(&mut self, value: bool) -> DeltaRepoResult<()> {
        self.claim(ContextKey::NoDatabase)?;
        self.values.no_database = Some(value);
        Ok(())
    }

    /// Checks the plugin wrote exactly what it declared and hands back the
    /// updated context.
    fn finish(self) -> DeltaRepoResult<PluginContext> {
        if let Some(key) = self.violation {
            return Err(undeclared_write(self.plugin, key));
        }
        let missing: Vec<String> = self
            .allowed
            .difference(&self.written)
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(DeltaRepoError::PluginContractViolation {
                plugin: self.plugin.to_string(),
                reason: format!("declared context keys were not set: {}", missing.join(", ")),
            });
        }
        Ok(self.values)
    }
}

fn undeclared_write(plugin: &str, key: ContextKey) -> DeltaRepoError {
    DeltaRepoError::PluginContractViolation {
        plugin: plugin.to_string(),
        reason: format!("wrote undeclared context key {key}"),
    }
}

/// One metadata kind as seen by a single generate or apply run.
#[derive(Debug, Clone, Default)]
pub struct MetadataUnit {
    pub kind: String,
    pub old_rec: Option<RepomdRecord>,
    pub delta_rec: Option<RepomdRecord>,
    pub new_rec: Option<RepomdRecord>,
    pub checksum_type: ChecksumType,
    pub compression: CompressionType,
}

fn record_path(rec: &Option<RepomdRecord>) -> Option<&Path> {
    rec.as_ref().and_then(|r| r.location_real.as_deref())
}

fn record_exists(rec: &Option<RepomdRecord>) -> bool {
    rec.as_ref().is_some_and(RepomdRecord::exists)
}

impl MetadataUnit {
    pub fn new<S: Into<String>>(kind: S) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn old_path(&self) -> Option<&Path> {
        record_path(&self.old_rec)
    }

    pub fn delta_path(&self) -> Option<&Path> {
        record_path(&self.delta_rec)
    }

    pub fn new_path(&self) -> Option<&Path> {
        record_path(&self.new_rec)
    }

    pub fn old_exists(&self) -> bool {
        record_exists(&self.old_rec)
    }

    pub fn delta_exists(&self) -> bool {
        record_exists(&self.delta_rec)
    }

    pub fn new_exists(&self) -> bool {
        record_exists(&self.new_rec)
    }
}

pub type Units = BTreeMap<String, MetadataUnit>;

/// Settings every plugin invocation of a run shares.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Scratch `repodata` directory the plugin writes into.
    pub out_dir: PathBuf,
    /// Compression of files the run writes besides per-kind metadata.
    pub compression: CompressionType,
    pub unique_md_filenames: bool,
    pub force_database: bool,
    pub ignore_missing: bool,
    /// Metadata files of the old repository the new one no longer lists.
    /// Only filled when generating.
    pub removed_files: RemovedSet,
}

impl JobSettings {
    /// Fills a freshly written record and applies the file naming policy.
    pub fn finish_record(
        &self,
        record: &mut RepomdRecord,
        checksum_type: ChecksumType,
    ) -> DeltaRepoResult<()> {
        record.fill(checksum_type)?;
        if self.unique_md_filenames {
            record.rename_file()?;
        }
        Ok(())
    }
}

pub struct GenJob<'a> {
    pub units: Units,
    pub bundle: &'a mut PluginBundle,
    pub settings: &'a JobSettings,
    pub context: &'a mut ContextWriter,
}

pub struct ApplyJob<'a> {
    pub units: Units,
    pub bundle: &'a PluginBundle,
    pub delta_repomd: &'a Repomd,
    pub settings: &'a JobSettings,
    pub context: &'a mut ContextWriter,
}

pub trait DeltaPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> u32;

    /// Metadata kinds this plugin takes care of.
    fn metadata_kinds(&self) -> &'static [&'static str];

    /// Delta kinds needed to reconstruct `kind`.
    fn prerequisites(&self, _kind: &str) -> &'static [&'static str] {
        &[]
    }

    fn gen_required_keys(&self) -> &'static [ContextKey] {
        &[]
    }

    fn gen_contributed_keys(&self) -> &'static [ContextKey] {
        &[]
    }

    fn apply_required_keys(&self) -> &'static [ContextKey] {
        &[]
    }

    fn apply_contributed_keys(&self) -> &'static [ContextKey] {
        &[]
    }

    fn generate(&self, job: &mut GenJob<'_>) -> DeltaRepoResult<Vec<RepomdRecord>>;

    fn apply(&self, job: &mut ApplyJob<'_>) -> DeltaRepoResult<Vec<RepomdRecord>>;
}

/// Ordered set of specialized plugins. The general plugin is not part of it.
pub struct PluginRegistry {
    plugins: Vec<Box<dyn DeltaPlugin>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(MainPlugin));
        registry.register(Box::new(GroupsPlugin));
        registry
    }

    pub fn register(&mut self, plugin: Box<dyn DeltaPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn plugins(&self) -> impl Iterator<Item = &dyn DeltaPlugin> {
        self.plugins.iter().map(|p| p.as_ref())
    }

    /// Delta kinds that must be fetched to reconstruct `wanted` kinds.
    pub fn needed_delta_kinds<S: AsRef<str>>(&self, wanted: &[S]) -> BTreeSet<String> {
        let mut needed = BTreeSet::from([
            crate::constants::DELTAMETADATA.to_string(),
            crate::constants::REMOVED.to_string(),
            crate::constants::PRIMARY.to_string(),
        ]);
        for kind in wanted {
            let kind = kind.as_ref();
            let owner = self
                .plugins()
                .find(|p| p.metadata_kinds().iter().any(|k| *k == kind));
            match owner {
                Some(plugin) => {
                    needed.extend(plugin.prerequisites(kind).iter().map(|k| k.to_string()))
                }
                None => {
                    needed.insert(kind.to_string());
                }
            }
        }
        needed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Generate,
    Apply,
}

impl Phase {
    fn required_keys(self, plugin: &dyn DeltaPlugin) -> &'static [ContextKey] {
        match self {
            Phase::Generate => plugin.gen_required_keys(),
            Phase::Apply => plugin.apply_required_keys(),
        }
    }

    fn contributed_keys(self, plugin: &dyn DeltaPlugin) -> &'static [ContextKey] {
        match self {
            Phase::Generate => plugin.gen_contributed_keys(),
            Phase::Apply => plugin.apply_contributed_keys(),
        }
    }
}

/// Runs one plugin with a guarded context and validates its contract.
fn invoke<F>(
    plugin: &dyn DeltaPlugin,
    phase: Phase,
    context: &mut PluginContext,
    run: F,
) -> DeltaRepoResult<Vec<RepomdRecord>>
where
    F: FnOnce(&mut ContextWriter) -> DeltaRepoResult<Vec<RepomdRecord>>,
{
    let mut writer = ContextWriter::new(
        plugin.name(),
        context.clone(),
        phase.contributed_keys(plugin),
    );
    let records = run(&mut writer)?;
    *context = writer.finish()?;
    Ok(records)
}

fn generate_with(
    plugin: &dyn DeltaPlugin,
    units: Units,
    context: &mut PluginContext,
    notes: &mut DeltaMetadata,
    settings: &JobSettings,
) -> DeltaRepoResult<Vec<RepomdRecord>> {
    let mut bundle = PluginBundle::new(plugin.name(), plugin.version());
    let records = invoke(plugin, Phase::Generate, context, |writer| {
        plugin.generate(&mut GenJob {
            units,
            bundle: &mut bundle,
            settings,
            context: writer,
        })
    })?;
    notes.add_bundle(bundle);
    Ok(records)
}

fn apply_with(
    plugin: &dyn DeltaPlugin,
    units: Units,
    context: &mut PluginContext,
    notes: &DeltaMetadata,
    delta_repomd: &Repomd,
    settings: &JobSettings,
) -> DeltaRepoResult<Vec<RepomdRecord>> {
    let Some(bundle) = notes.bundle(plugin.name()) else {
        debug!("{}: skipped, no record in deltametadata", plugin.name());
        return Ok(Vec::new());
    };
    check_bundle_version(plugin, bundle, &units)?;
    invoke(plugin, Phase::Apply, context, |writer| {
        plugin.apply(&mut ApplyJob {
            units,
            bundle,
            delta_repomd,
            settings,
            context: writer,
        })
    })
}

/// Drives the registry over `units` during generation, then hands what is
/// left to the general plugin.
pub(crate) fn run_generate(
    registry: &PluginRegistry,
    mut units: Units,
    context: &mut PluginContext,
    notes: &mut DeltaMetadata,
    settings: &JobSettings,
) -> DeltaRepoResult<Vec<RepomdRecord>> {
    let generate = |plugin: &dyn DeltaPlugin, claimed: Units, context: &mut PluginContext| {
        generate_with(plugin, claimed, context, notes, settings)
    };
    let mut records = drive(registry, Phase::Generate, &mut units, context, generate)?;
    if !units.is_empty() {
        debug!("{}: active for {:?}", GeneralPlugin::NAME, units.keys());
        records.extend(generate_with(&GeneralPlugin, units, context, notes, settings)?);
    }
    Ok(records)
}

/// Application counterpart of [`run_generate`].
pub(crate) fn run_apply(
    registry: &PluginRegistry,
    mut units: Units,
    context: &mut PluginContext,
    notes: &DeltaMetadata,
    delta_repomd: &Repomd,
    settings: &JobSettings,
) -> DeltaRepoResult<Vec<RepomdRecord>> {
    let apply = |plugin: &dyn DeltaPlugin, claimed: Units, context: &mut PluginContext| {
        apply_with(plugin, claimed, context, notes, delta_repomd, settings)
    };
    let mut records = drive(registry, Phase::Apply, &mut units, context, apply)?;
    if !units.is_empty() {
        debug!("{}: active for {:?}", GeneralPlugin::NAME, units.keys());
        records.extend(apply_with(&GeneralPlugin, units, context, notes, delta_repomd, settings)?);
    }
    Ok(records)
}

pub(crate) fn check_bundle_version(
    plugin: &dyn DeltaPlugin,
    bundle: &PluginBundle,
    units: &Units,
) -> DeltaRepoResult<()> {
    if bundle.version > plugin.version() {
        return Err(DeltaRepoError::PluginVersion {
            plugin: plugin.name().to_string(),
            kinds: units.keys().cloned().collect::<Vec<_>>().join(", "),
            found: bundle.version,
            supported: plugin.version(),
        });
    }
    Ok(())
}

fn drive<F>(
    registry: &PluginRegistry,
    phase: Phase,
    units: &mut Units,
    context: &mut PluginContext,
    mut run: F,
) -> DeltaRepoResult<Vec<RepomdRecord>>
where
    F: FnMut(&dyn DeltaPlugin, Units, &mut PluginContext) -> DeltaRepoResult<Vec<RepomdRecord>>,
{
    let plugins: Vec<&dyn DeltaPlugin> = registry.plugins().collect();
    let mut used = vec![false; plugins.len()];
    let mut claimed_by: BTreeMap<String, &'static str> = BTreeMap::new();
    let mut records = Vec::new();

    loop {
        let mut progress = false;

        for (idx, plugin) in plugins.iter().enumerate() {
            if used[idx] {
                continue;
            }

            let kinds: Vec<&str> = plugin
                .metadata_kinds()
                .iter()
                .copied()
                .filter(|k| units.contains_key(*k) || claimed_by.contains_key(*k))
                .collect();
            if kinds.is_empty() {
                debug!(
                    "{}: skipped, none of {:?} available",
                    plugin.name(),
                    plugin.metadata_kinds()
                );
                used[idx] = true;
                progress = true;
                continue;
            }

            if let Some((kind, owner)) = kinds
                .iter()
                .find_map(|k| claimed_by.get(*k).map(|owner| (*k, *owner)))
            {
                return Err(DeltaRepoError::PluginContractViolation {
                    plugin: plugin.name().to_string(),
                    reason: format!("metadata {kind} is already handled by {owner}"),
                });
            }

            if let Some(key) = phase
                .required_keys(*plugin)
                .iter()
                .find(|k| !context.has(**k))
            {
                debug!("{}: deferred, waiting for {}", plugin.name(), key);
                continue;
            }

            let mut claimed = Units::new();
            for kind in &kinds {
                claimed_by.insert(kind.to_string(), plugin.name());
                if let Some(unit) = units.remove(*kind) {
                    claimed.insert(kind.to_string(), unit);
                }
            }

            debug!("{}: active for {:?}", plugin.name(), kinds);
            let produced = run(*plugin, claimed, context)?;
            for rec in &produced {
                debug!("{}: produced {}", plugin.name(), rec.kind);
            }
            records.extend(produced);

            used[idx] = true;
            progress = true;
        }

        if !progress {
            break;
        }
    }

    if let Some(idx) = used.iter().position(|u| !u) {
        let plugin = plugins[idx];
        let missing: Vec<String> = phase
            .required_keys(plugin)
            .iter()
            .filter(|k| !context.has(**k))
            .map(ToString::to_string)
            .collect();
        return Err(DeltaRepoError::PluginContractViolation {
            plugin: plugin.name().to_string(),
            reason: format!("required context keys never became available: {}", missing.join(", ")),
        });
    }

    Ok(records)
}
