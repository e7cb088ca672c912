use std::path::Path;

use deltarepo_core::{repo::RepoSnapshot, DeltaRepoResult};
use deltarepo_utils::hash::ChecksumType;
use serde::Serialize;
use tracing::info;

use crate::utils::{json_enabled, print_json};

#[derive(Serialize)]
struct ContentHashReport<'a> {
    path: &'a Path,
    contenthash: &'a str,
    contenthash_type: &'static str,
    revision: Option<&'a str>,
    timestamp: i64,
}

pub fn print_contenthash(repo: &Path, hash_type: ChecksumType) -> DeltaRepoResult<()> {
    let snapshot = RepoSnapshot::load(repo, hash_type)?;

    if json_enabled() {
        print_json(&ContentHashReport {
            path: &snapshot.path,
            contenthash: &snapshot.contenthash,
            contenthash_type: snapshot.contenthash_type.name(),
            revision: snapshot.revision.as_deref(),
            timestamp: snapshot.timestamp,
        });
    } else {
        info!("{}", snapshot.contenthash);
    }
    Ok(())
}
