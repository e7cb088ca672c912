use std::{env, time::Duration};

use apply::apply_delta;
use clap::Parser;
use cli::{Args, Commands};
use contenthash::print_contenthash;
use deltarepo_config::config::{self, generate_default_config, get_config, Config, CONFIG_PATH};
use deltarepo_core::{
    applicator::ApplyOptions,
    error::{DeltaRepoError, ErrorContext},
    generator::GenerateOptions,
    DeltaRepoResult,
};
use deltarepo_dl::http_client::configure_http_client;
use generate::{add_delta, generate_delta};
use index::index_deltas;
use logging::setup_logging;
use tracing::debug;
use update::{resolve_update, update_repo};
use ureq::{
    http::{HeaderMap, HeaderName, HeaderValue},
    Proxy,
};
use utils::{load_mirrors, parse_checksum, parse_compression, parse_path, COLOR, JSON, PROGRESS};

mod apply;
mod cli;
mod contenthash;
mod generate;
mod index;
mod logging;
mod progress;
mod update;
mod utils;

fn parse_headers(headers: &[String]) -> DeltaRepoResult<HeaderMap> {
    headers
        .iter()
        .map(|header| {
            let invalid = || {
                DeltaRepoError::Configuration(format!(
                    "Invalid header '{header}', expected 'Name: value'"
                ))
            };
            let (key, value) = header.split_once(':').ok_or_else(invalid)?;
            let key = HeaderName::from_bytes(key.trim().as_bytes()).map_err(|_| invalid())?;
            let value = HeaderValue::from_str(value.trim()).map_err(|_| invalid())?;
            Ok((key, value))
        })
        .collect()
}

/// Applies command line overrides on top of the configured HTTP settings.
fn setup_http_client(
    proxy: Option<&str>,
    headers: Option<&[String]>,
    user_agent: Option<String>,
    config: &Config,
) -> DeltaRepoResult<()> {
    let proxy = proxy
        .map(|proxy| {
            Proxy::new(proxy)
                .map_err(|err| DeltaRepoError::Configuration(format!("Invalid proxy: {err}")))
        })
        .transpose()?;
    let headers = headers.map(parse_headers).transpose()?;
    let user_agent = user_agent.or_else(|| config.user_agent.clone());
    let timeout = config.timeout.map(Duration::from_secs);

    configure_http_client(|client| {
        if proxy.is_some() {
            client.proxy = proxy;
        }
        if user_agent.is_some() {
            client.user_agent = user_agent;
        }
        if headers.is_some() {
            client.headers = headers;
        }
        client.timeout = timeout;
    });
    Ok(())
}

fn handle_cli() -> DeltaRepoResult<()> {
    let args = Args::parse();

    setup_logging(&args);

    if args.no_color {
        let mut color = COLOR.write().unwrap();
        *color = false;
    }

    if args.no_progress {
        let mut progress = PROGRESS.write().unwrap();
        *progress = false;
    }

    if args.json {
        let mut json = JSON.write().unwrap();
        *json = true;
    }

    if let Some(ref c) = args.config {
        let mut config_path = CONFIG_PATH.write().unwrap();
        let path = parse_path(c)?;
        let path = if path.is_absolute() {
            path
        } else {
            env::current_dir()
                .with_context(|| "retrieving current directory".into())?
                .join(path)
        };
        *config_path = path;
    }

    match args.command {
        Commands::DefConfig {
            mirror,
        } => generate_default_config(mirror.as_slice())?,
        command => {
            config::init()?;
            let config = get_config();
            debug!("Using config {}", CONFIG_PATH.read().unwrap().display());

            setup_http_client(
                args.proxy.as_deref(),
                args.header.as_deref(),
                args.user_agent.clone(),
                &config,
            )?;

            match command {
                Commands::Generate {
                    old,
                    new,
                    outdir,
                    id_type,
                    skip,
                    only,
                    database,
                    ignore_missing,
                    compression,
                    checksum,
                } => {
                    let outdir = parse_path(outdir.as_deref().unwrap_or("."))?;
                    let mut options = GenerateOptions::from_config(&config, outdir)?;
                    options.contenthash_type =
                        parse_checksum(id_type.as_deref(), options.contenthash_type)?;
                    options.compression =
                        parse_compression(compression.as_deref(), options.compression)?;
                    if let Some(checksum) = checksum {
                        options.checksum_type = Some(checksum.parse()?);
                    }
                    options.force_database |= database;
                    options.ignore_missing |= ignore_missing;
                    options.skip_kinds = skip;
                    options.only_kinds = only;

                    generate_delta(&parse_path(&old)?, &parse_path(&new)?, options)?;
                }
                Commands::Apply {
                    old,
                    delta,
                    outdir,
                    database,
                    ignore_missing,
                } => {
                    let outdir = parse_path(outdir.as_deref().unwrap_or("."))?;
                    let mut options = ApplyOptions::from_config(&config, outdir)?;
                    options.force_database |= database;
                    options.ignore_missing |= ignore_missing;

                    apply_delta(&parse_path(&old)?, &parse_path(&delta)?, options)?;
                }
                Commands::Index {
                    dir,
                    force,
                } => {
                    index_deltas(&parse_path(&dir)?, config.index_filename(), force)?;
                }
                Commands::Add {
                    old,
                    new,
                    dir,
                } => {
                    let dir = parse_path(&dir)?;
                    let options = GenerateOptions::from_config(&config, &dir)?;
                    add_delta(
                        &parse_path(&old)?,
                        &parse_path(&new)?,
                        &dir,
                        config.index_filename(),
                        options,
                    )?;
                }
                Commands::Resolve {
                    local,
                    mirror,
                    target,
                } => {
                    let mirrors = load_mirrors(&mirror, &config);
                    resolve_update(&parse_path(&local)?, mirrors, target, &config)?;
                }
                Commands::Update {
                    local,
                    mirror,
                    target,
                } => {
                    let mirrors = load_mirrors(&mirror, &config);
                    update_repo(&parse_path(&local)?, mirrors, target, &config)?;
                }
                Commands::Contenthash {
                    repo,
                    hash_type,
                } => {
                    let default = config.contenthash_type()?;
                    let hash_type = parse_checksum(hash_type.as_deref(), default)?;
                    print_contenthash(&parse_path(&repo)?, hash_type)?;
                }
                Commands::DefConfig {
                    ..
                } => unreachable!(),
            }

            progress::stop();
        }
    }

    Ok(())
}

fn main() {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .build(),
        )
    }))
    .ok();

    if let Err(err) = handle_cli() {
        progress::stop();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(&[
            "Authorization: Bearer token".to_string(),
            "X-Mirror:primary".to_string(),
        ])
        .unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["authorization"], "Bearer token");
        assert_eq!(headers["x-mirror"], "primary");
    }

    #[test]
    fn test_parse_headers_rejects_missing_separator() {
        let err = parse_headers(&["NoSeparator".to_string()]).unwrap_err();
        assert!(matches!(err, DeltaRepoError::Configuration(_)));
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn test_gen_arguments() {
        let args = Args::try_parse_from([
            "deltarepo",
            "gen",
            "old",
            "new",
            "-o",
            "out",
            "--skip",
            "group,updateinfo",
        ])
        .unwrap();
        match args.command {
            Commands::Generate {
                skip,
                outdir,
                ..
            } => {
                assert_eq!(skip, ["group", "updateinfo"]);
                assert_eq!(outdir.as_deref(), Some("out"));
            }
            _ => panic!("expected gen"),
        }
    }

    #[test]
    fn test_skip_and_only_conflict() {
        let result = Args::try_parse_from([
            "deltarepo", "gen", "old", "new", "--skip", "group", "--only", "other",
        ]);
        assert!(result.is_err());
    }
}
