use std::path::Path;

use deltarepo_core::{
    generator::{DeltaGenerator, GenerateOptions, GeneratedDelta},
    index::generate_into_index_dir,
    plugins::PluginRegistry,
    DeltaRepoResult,
};
use deltarepo_utils::bytes::format_bytes;
use nu_ansi_term::Color::{Blue, Cyan, Green};
use serde::Serialize;
use tracing::info;

use crate::{
    progress::create_spinner_job,
    utils::{json_enabled, print_json, Colored},
};

#[derive(Serialize)]
struct DeltaReport<'a> {
    id: String,
    path: &'a Path,
    src: &'a str,
    dst: &'a str,
    contenthash_type: &'static str,
    records: Vec<&'a str>,
    size: u64,
}

impl<'a> From<&'a GeneratedDelta> for DeltaReport<'a> {
    fn from(delta: &'a GeneratedDelta) -> Self {
        Self {
            id: delta.id(),
            path: &delta.path,
            src: &delta.src_contenthash,
            dst: &delta.dst_contenthash,
            contenthash_type: delta.contenthash_type.name(),
            records: delta.repomd.kinds().collect(),
            size: delta.repomd.records.iter().map(|r| r.size).sum(),
        }
    }
}

fn report(delta: &GeneratedDelta) {
    let report = DeltaReport::from(delta);
    if json_enabled() {
        print_json(&report);
        return;
    }

    info!(
        "{} {} -> {}",
        Colored(Green, "Generated"),
        Colored(Cyan, report.src),
        Colored(Cyan, report.dst)
    );
    info!("  Location: {}", Colored(Blue, delta.path.display()));
    info!("  Records:  {}", report.records.join(", "));
    info!("  Size:     {}", format_bytes(report.size, 2));
}

pub fn generate_delta(old: &Path, new: &Path, options: GenerateOptions) -> DeltaRepoResult<()> {
    let registry = PluginRegistry::with_defaults();
    let spinner = create_spinner_job(&format!(
        "Generating delta {} -> {}",
        old.display(),
        new.display()
    ));

    let result = DeltaGenerator::new(&registry, options).generate(old, new);
    spinner.finish_and_clear();

    report(&result?);
    Ok(())
}

/// Generates a delta below `dir` and records it in the index kept there.
pub fn add_delta(
    old: &Path,
    new: &Path,
    dir: &Path,
    index_filename: &str,
    options: GenerateOptions,
) -> DeltaRepoResult<()> {
    let registry = PluginRegistry::with_defaults();
    let spinner = create_spinner_job(&format!("Adding delta to {}", dir.display()));

    let result = generate_into_index_dir(&registry, options, old, new, dir, index_filename);
    spinner.finish_and_clear();

    let (delta, _) = result?;
    report(&delta);
    if !json_enabled() {
        info!(
            "  Indexed:  {}",
            Colored(Blue, dir.join(index_filename).display())
        );
    }
    Ok(())
}
