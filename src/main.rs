use std::{io::IsTerminal, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use tiler_bench::{
    benchmark::{measure, ReqwestFetcher},
    boundary::{load_collection, resolve},
    cli::Cli,
    config::{Mode, Settings},
    ledger::ResumeLedger,
    logging,
    seed::seed,
    sink::{benchmark_log, performance_log},
    tiles::{enumerate, tasks},
    upload::{upload_logs, Uploader},
};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbosity.tracing_level_filter(), cli.log_file.as_deref())?;
    debug!(config = ?cli);

    let mut settings = Settings::load(cli.config.as_deref())?;
    cli.apply(&mut settings);
    settings.validate()?;

    let logs = run(&settings).await?;

    if let Some(bucket) = settings.upload.bucket.as_deref() {
        match Uploader::s3(bucket) {
            Ok(uploader) => {
                upload_logs(&uploader, &logs, &settings.upload.prefix).await;
            }
            Err(e) => warn!(bucket, error = %e, "cannot upload logs"),
        }
    }
    Ok(())
}

/// Runs the configured mode, returning the logs it wrote.
async fn run(settings: &Settings) -> anyhow::Result<Vec<PathBuf>> {
    let source = settings
        .geojson_url
        .as_deref()
        .context("no boundary given; pass --geojson-url")?;

    let client = reqwest::Client::new();
    let collection = load_collection(&client, source)
        .await
        .with_context(|| format!("failed to load boundary from {source}"))?;
    let Some(boundary) = resolve(&collection, settings.feature_kind, settings.buffer_radius)? else {
        info!("no geometry found in boundary; nothing to do");
        return Ok(vec![]);
    };

    let tiles = enumerate(Some(&boundary), &settings.zoom_levels)?;
    info!(tiles = tiles.len(), zoom_levels = ?settings.zoom_levels, "enumerated tiles");

    match settings.mode {
        Mode::Seed => {
            let command = settings.tegola_command();
            let mut ledger = ResumeLedger::load(&settings.seed.ledger_path)?;
            let mut log = performance_log(&settings.seed.performance_log)?;
            seed(&command, &tiles, &mut ledger, &mut log, &settings.seed_options()).await?;
            Ok(vec![log.path().to_path_buf(), ledger.path().to_path_buf()])
        }
        Mode::Request => {
            let template = settings.url_template()?;
            let tasks = tasks(&tiles, Some(&template));
            let fetcher = ReqwestFetcher::new()?;
            let mut log = benchmark_log(&settings.request.output_file)?;
            let options = settings.benchmark_options(std::io::stderr().is_terminal());
            measure(&fetcher, &tasks, &settings.zoom_levels, &mut log, &options).await?;
            info!(path = %log.path().display(), "all results saved");
            Ok(vec![log.path().to_path_buf()])
        }
    }
}
