use std::{
    fmt::Display,
    path::PathBuf,
    sync::{LazyLock, RwLock},
};

use deltarepo_config::config::Config;
use deltarepo_core::{graph::DeltaMirror, DeltaRepoResult};
use deltarepo_utils::{compression::CompressionType, hash::ChecksumType, path::resolve_path};
use nu_ansi_term::Color;
use serde::Serialize;
use tracing::{debug, warn};

pub static COLOR: LazyLock<RwLock<bool>> = LazyLock::new(|| RwLock::new(true));
pub static PROGRESS: LazyLock<RwLock<bool>> = LazyLock::new(|| RwLock::new(true));
pub static JSON: LazyLock<RwLock<bool>> = LazyLock::new(|| RwLock::new(false));

pub fn progress_enabled() -> bool {
    *PROGRESS.read().unwrap() && !json_enabled()
}

pub fn json_enabled() -> bool {
    *JSON.read().unwrap()
}

pub struct Colored<T: Display>(pub Color, pub T);

impl<T: Display> Display for Colored<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let color = COLOR.read().unwrap();
        if *color {
            write!(f, "{}", self.0.prefix())?;
            self.1.fmt(f)?;
            write!(f, "{}", self.0.suffix())
        } else {
            self.1.fmt(f)
        }
    }
}

/// Prints a command result as a single JSON document on stdout.
pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(out) => crate::progress::suspend(|| println!("{out}")),
        Err(err) => warn!("Failed to serialize output: {err}"),
    }
}

pub fn parse_path(path: &str) -> DeltaRepoResult<PathBuf> {
    Ok(resolve_path(path)?)
}

pub fn parse_checksum(name: Option<&str>, default: ChecksumType) -> DeltaRepoResult<ChecksumType> {
    match name {
        Some(name) => Ok(name.parse()?),
        None => Ok(default),
    }
}

pub fn parse_compression(
    name: Option<&str>,
    default: CompressionType,
) -> DeltaRepoResult<CompressionType> {
    match name {
        Some(name) => Ok(name.parse()?),
        None => Ok(default),
    }
}

/// Loads the mirrors given on the command line, or the enabled ones from
/// the config. Mirrors whose index can't be read are skipped.
pub fn load_mirrors(urls: &[String], config: &Config) -> Vec<DeltaMirror> {
    let urls: Vec<&str> = if urls.is_empty() {
        config.enabled_mirrors().map(|m| m.url.as_str()).collect()
    } else {
        urls.iter().map(String::as_str).collect()
    };
    if urls.is_empty() {
        warn!("No delta mirrors configured");
    }

    urls.into_iter()
        .filter_map(|url| {
            match DeltaMirror::load(url, config.index_filename()) {
                Ok(mirror) => {
                    debug!("Loaded {} deltas from {url}", mirror.index.len());
                    Some(mirror)
                }
                Err(err) => {
                    warn!("Skipping mirror {url}: {err}");
                    None
                }
            }
        })
        .collect()
}
