use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ingest_client::{IngestClient, RequestTimeouts};
use socialsync_common::normalize::{normalize_community, parse_window_token, to_window_token};
use socialsync_common::{ContainerKey, CoverageMode, EngineConfig, Platform, Window};
use socialsync_engine::{
    CacheParams, CacheRequest, ConvergeRequest, ConvergenceEngine, DiscoveryCache, EngineDeps,
    Prefetcher, SessionOutcome, WindowResolver, WindowViews,
};

#[derive(Parser)]
#[command(name = "socialsync", about = "Coverage convergence for social ingestion windows")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve and print every window of a season
    Windows {
        #[arg(long)]
        season: String,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Run passes for one window until coverage converges
    Sync {
        #[arg(long)]
        season: String,
        /// Subreddit name or URL
        #[arg(long)]
        community: String,
        /// Window token: w0, e3, w-postseason, episode-3, ...
        #[arg(long)]
        window: String,
        /// Comma-separated platforms (default: all)
        #[arg(long, value_delimiter = ',')]
        platforms: Vec<Platform>,
        #[arg(long = "flair")]
        flairs: Vec<String>,
        #[arg(long)]
        full_sync: bool,
        #[arg(long)]
        max_passes: Option<u32>,
    },
    /// Warm the discovery cache for several windows
    Prefetch {
        #[arg(long)]
        season: String,
        #[arg(long)]
        community: String,
        /// Window tokens (default: every window of the season)
        #[arg(long, value_delimiter = ',')]
        windows: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env()
        .add_directive("socialsync=info".parse()?)
        .add_directive("ingest_client=info".parse()?);
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    let config = EngineConfig::from_env()?;

    let client = Arc::new(
        IngestClient::new(config.api_url.clone(), config.api_token.clone()).with_timeouts(
            RequestTimeouts {
                create_run: config.timeouts.create_run,
                run_status: config.timeouts.run_status,
                cache: config.timeouts.cache,
                coverage: config.timeouts.coverage,
                metadata: config.timeouts.metadata,
            },
        ),
    );
    let resolver = WindowResolver::from_config(&config);

    match cli.command {
        Command::Windows { season, json } => {
            let windows = resolver.load(client.as_ref(), &season).await;
            if json {
                let list: Vec<&Window> = windows.values().collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                for (key, window) in &windows {
                    println!(
                        "{:<14} {:<18} {:<26} {:<26} {:?}",
                        to_window_token(*key),
                        window.label,
                        window.start.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                        window.end.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
                        window.provenance,
                    );
                }
            }
        }

        Command::Sync {
            season,
            community,
            window,
            platforms,
            flairs,
            full_sync,
            max_passes,
        } => {
            let community = normalize_community(&community)
                .with_context(|| format!("Not a community name: {community}"))?;
            let key = parse_window_token(&window)
                .with_context(|| format!("Unknown window token: {window}"))?;
            let windows = resolver.load(client.as_ref(), &season).await;
            let window = windows
                .get(&key)
                .cloned()
                .with_context(|| format!("Season {season} has no window {key}"))?;

            let platforms: BTreeSet<Platform> = if platforms.is_empty() {
                Platform::ALL.iter().copied().collect()
            } else {
                platforms.into_iter().collect()
            };

            let mut engine_config = config.clone();
            if let Some(max) = max_passes {
                if max == 0 {
                    bail!("--max-passes must be at least 1");
                }
                engine_config.max_passes = max;
            }

            let engine = ConvergenceEngine::new(
                EngineDeps::builder()
                    .backend(Arc::clone(&client))
                    .coverage(Arc::clone(&client))
                    .config(engine_config)
                    .build(),
            );

            let mut request = ConvergeRequest::new(community, window, platforms);
            request.flairs = flairs.into_iter().collect();
            if full_sync {
                request.coverage_mode = CoverageMode::FullSync;
            }

            let outcome = tokio::select! {
                outcome = engine.converge(&request) => outcome?,
                _ = tokio::signal::ctrl_c() => {
                    engine.cancel(&request.window.key);
                    tracing::warn!("Interrupted, session cancelled");
                    return Ok(());
                }
            };
            report(&outcome);
            if let SessionOutcome::Failed { error, .. } = outcome {
                return Err(error.into());
            }
        }

        Command::Prefetch {
            season,
            community,
            windows: tokens,
        } => {
            let community = normalize_community(&community)
                .with_context(|| format!("Not a community name: {community}"))?;
            let windows = resolver.load(client.as_ref(), &season).await;

            let keys: Vec<ContainerKey> = if tokens.is_empty() {
                windows.keys().copied().collect()
            } else {
                tokens
                    .iter()
                    .map(|t| parse_window_token(t).with_context(|| format!("Unknown window token: {t}")))
                    .collect::<Result<_>>()?
            };

            let requests: Vec<CacheRequest> = keys
                .iter()
                .filter_map(|key| windows.get(key))
                .map(|w| {
                    CacheRequest::new(community.clone(), w.key.clone()).with_params(CacheParams {
                        start: w.start,
                        end: w.end,
                        ..CacheParams::default()
                    })
                })
                .collect();

            let cache = Arc::new(DiscoveryCache::new(
                Arc::clone(&client),
                Arc::new(WindowViews::default()),
            ));
            let epochs = socialsync_engine::EpochRegistry::new();
            let token = epochs.advance("prefetch");
            let summary = Prefetcher::new(cache, config.prefetch_concurrency)
                .warm(requests, &token)
                .await;
            println!(
                "hits={} misses={} errors={} skipped={}",
                summary.hits, summary.misses, summary.errors, summary.skipped
            );
        }
    }

    Ok(())
}

fn report(outcome: &SessionOutcome) {
    match outcome {
        SessionOutcome::Succeeded { passes, coverage, .. } => {
            println!("Up to date after {passes} pass(es) · Coverage {}", coverage.label());
        }
        SessionOutcome::Incomplete {
            passes,
            reason,
            coverage,
            ..
        } => {
            let label = coverage.as_ref().map(|c| c.label()).unwrap_or_else(|| "-".into());
            println!("Stalled ({reason} reached after {passes} passes) · Coverage {label}");
        }
        SessionOutcome::StillRunning { run_id, .. } => {
            println!("Run {run_id} is still running. Check back later.");
        }
        SessionOutcome::Failed { error, fallback } => {
            let cached = fallback.as_ref().map_or(0, |d| d.items.len());
            println!("Failed: {error} ({cached} cached item(s) available)");
        }
    }
}
