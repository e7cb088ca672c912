use std::path::Path;

use deltarepo_config::config::Config;
use deltarepo_core::{
    error::DeltaRepoError,
    graph::{DeltaMirror, Link, ResolvedPath},
    plugins::PluginRegistry,
    updater::{DeltaFetcher, UpdateOptions, UpdateOutcome, Updater},
    DeltaRepoResult,
};
use deltarepo_dl::download::Download;
use deltarepo_utils::{bytes::format_bytes, path::file_name_of};
use nu_ansi_term::Color::{Blue, Cyan, Green, Yellow};
use serde::Serialize;
use tracing::info;

use crate::{
    progress::{create_download_job, create_spinner_job, handle_download_progress},
    utils::{json_enabled, print_json, Colored},
};

/// Placeholder target reported when no mirror offers any delta.
const NO_TARGET: &str = "<none>";

/// Downloads with a progress bar per file.
struct ProgressFetcher;

impl DeltaFetcher for ProgressFetcher {
    fn fetch(&self, location: &str, dest: &Path) -> DeltaRepoResult<()> {
        let pb = create_download_job(&file_name_of(dest));
        let bar = pb.clone();
        let result = Download::new(location)
            .output(dest)
            .progress(move |state| handle_download_progress(state, &bar))
            .execute();
        pb.finish_and_clear();
        result?;
        Ok(())
    }
}

#[derive(Serialize)]
struct LinkReport<'a> {
    location: &'a str,
    src: Option<&'a str>,
    dst: Option<&'a str>,
    size: u64,
    mirror: &'a str,
}

impl<'a> From<&'a Link> for LinkReport<'a> {
    fn from(link: &'a Link) -> Self {
        Self {
            location: &link.record.location_href,
            src: link.src(),
            dst: link.dst(),
            size: link.cost(),
            mirror: &link.mirror_url,
        }
    }
}

#[derive(Serialize)]
struct PathReport<'a> {
    src: &'a str,
    dst: &'a str,
    cost: u64,
    deltas: Vec<LinkReport<'a>>,
}

fn print_path(src: &str, dst: &str, path: &ResolvedPath) {
    let report = PathReport {
        src,
        dst,
        cost: path.cost,
        deltas: path.links.iter().map(LinkReport::from).collect(),
    };
    if json_enabled() {
        print_json(&report);
        return;
    }

    for (idx, delta) in report.deltas.iter().enumerate() {
        info!(
            "{}. {} -> {}  {}  {}",
            idx + 1,
            Colored(Cyan, delta.src.unwrap_or("-")),
            Colored(Cyan, delta.dst.unwrap_or("-")),
            format_bytes(delta.size, 2),
            Colored(Blue, delta.location)
        );
    }
    info!(
        "Total: {} deltas, {}",
        report.deltas.len(),
        format_bytes(report.cost, 2)
    );
}

fn updater<'r>(
    registry: &'r PluginRegistry,
    local: &Path,
    mirrors: Vec<DeltaMirror>,
    target: Option<String>,
    config: &Config,
) -> DeltaRepoResult<Updater<'r>> {
    let mut updater = Updater::new(registry, local, UpdateOptions::from_config(config)?)
        .mirrors(mirrors)
        .fetcher(ProgressFetcher)
        .cache_dir(config.get_cache_path()?);
    if let Some(target) = target {
        updater = updater.target(target);
    }
    Ok(updater)
}

pub fn resolve_update(
    local: &Path,
    mirrors: Vec<DeltaMirror>,
    target: Option<String>,
    config: &Config,
) -> DeltaRepoResult<()> {
    let registry = PluginRegistry::with_defaults();
    let spinner = create_spinner_job(&format!("Resolving {}", local.display()));
    let result = updater(&registry, local, mirrors, target, config)?.resolve();
    spinner.finish_and_clear();

    let (src, dst, path) = result?;
    let Some(dst) = dst else {
        return Err(DeltaRepoError::UnreachableTarget {
            src,
            dst: NO_TARGET.to_string(),
        });
    };
    let Some(path) = path else {
        return Err(DeltaRepoError::UnreachableTarget {
            src,
            dst,
        });
    };

    if path.is_empty() && !json_enabled() {
        info!("{} is up to date ({})", local.display(), Colored(Cyan, &src));
        return Ok(());
    }
    print_path(&src, &dst, &path);
    Ok(())
}

pub fn update_repo(
    local: &Path,
    mirrors: Vec<DeltaMirror>,
    target: Option<String>,
    config: &Config,
) -> DeltaRepoResult<()> {
    let registry = PluginRegistry::with_defaults();
    let outcome = updater(&registry, local, mirrors, target, config)?.update()?;

    match outcome {
        UpdateOutcome::UpToDate {
            contenthash,
        } => {
            if json_enabled() {
                print_json(&serde_json::json!({
                    "status": "up-to-date",
                    "contenthash": contenthash,
                }));
            } else {
                info!(
                    "{} {} ({})",
                    Colored(Yellow, "Up to date:"),
                    local.display(),
                    Colored(Cyan, contenthash)
                );
            }
            Ok(())
        }
        UpdateOutcome::NoPath {
            src,
            dst,
        } => {
            Err(DeltaRepoError::UnreachableTarget {
                src,
                dst: dst.unwrap_or_else(|| NO_TARGET.to_string()),
            })
        }
        UpdateOutcome::Updated {
            applied,
            final_hash,
        } => {
            if json_enabled() {
                let deltas: Vec<LinkReport> = applied.iter().map(LinkReport::from).collect();
                print_json(&serde_json::json!({
                    "status": "updated",
                    "contenthash": final_hash,
                    "deltas": deltas,
                }));
            } else {
                let size: u64 = applied.iter().map(Link::cost).sum();
                info!(
                    "{} {} to {} through {} deltas ({})",
                    Colored(Green, "Updated"),
                    local.display(),
                    Colored(Cyan, final_hash),
                    applied.len(),
                    format_bytes(size, 2)
                );
            }
            Ok(())
        }
    }
}
