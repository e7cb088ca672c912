use std::path::Path;

use deltarepo_core::{index::rebuild_index, DeltaRepoResult};
use deltarepo_utils::bytes::format_bytes;
use nu_ansi_term::Color::{Blue, Cyan};
use serde::Serialize;
use tracing::info;

use crate::{
    progress::create_spinner_job,
    utils::{json_enabled, print_json, Colored},
};

#[derive(Serialize)]
struct IndexEntry<'a> {
    location: &'a str,
    src: Option<&'a str>,
    dst: Option<&'a str>,
    size: u64,
}

pub fn index_deltas(dir: &Path, index_filename: &str, force: bool) -> DeltaRepoResult<()> {
    let spinner = create_spinner_job(&format!("Indexing {}", dir.display()));
    let result = rebuild_index(dir, index_filename, force);
    spinner.finish_and_clear();
    let index = result?;

    let entries: Vec<IndexEntry> = index
        .records
        .iter()
        .map(|record| {
            IndexEntry {
                location: &record.location_href,
                src: record.contenthash_src.as_deref(),
                dst: record.contenthash_dst.as_deref(),
                size: record.size_total,
            }
        })
        .collect();

    if json_enabled() {
        print_json(&entries);
        return Ok(());
    }

    for entry in &entries {
        info!(
            "{}  {} -> {}  {}",
            Colored(Blue, entry.location),
            Colored(Cyan, entry.src.unwrap_or("-")),
            Colored(Cyan, entry.dst.unwrap_or("-")),
            format_bytes(entry.size, 2)
        );
    }
    Ok(())
}
