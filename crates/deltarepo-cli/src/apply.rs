use std::path::Path;

use deltarepo_core::{
    applicator::{ApplyOptions, DeltaApplicator},
    plugins::PluginRegistry,
    DeltaRepoResult,
};
use nu_ansi_term::Color::{Blue, Cyan, Green};
use serde::Serialize;
use tracing::info;

use crate::{
    progress::create_spinner_job,
    utils::{json_enabled, print_json, Colored},
};

#[derive(Serialize)]
struct AppliedReport<'a> {
    path: &'a Path,
    contenthash: &'a str,
    contenthash_type: &'static str,
    revision: Option<&'a str>,
    records: Vec<&'a str>,
}

pub fn apply_delta(old: &Path, delta: &Path, options: ApplyOptions) -> DeltaRepoResult<()> {
    let registry = PluginRegistry::with_defaults();
    let spinner = create_spinner_job(&format!(
        "Applying {} on {}",
        delta.display(),
        old.display()
    ));

    let result = DeltaApplicator::new(&registry, options).apply(old, delta);
    spinner.finish_and_clear();
    let applied = result?;

    let report = AppliedReport {
        path: &applied.path,
        contenthash: &applied.contenthash,
        contenthash_type: applied.contenthash_type.name(),
        revision: applied.repomd.revision.as_deref(),
        records: applied.repomd.kinds().collect(),
    };
    if json_enabled() {
        print_json(&report);
        return Ok(());
    }

    info!(
        "{} {} ({})",
        Colored(Green, "Built"),
        Colored(Blue, applied.path.display()),
        report.records.join(", ")
    );
    info!(
        "  Content hash: {} ({})",
        Colored(Cyan, report.contenthash),
        report.contenthash_type
    );
    Ok(())
}
