use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::{
    boundary::FeatureKind,
    config::{Mode, Settings},
    ledger::LedgerPolicy,
    seed::SeedStrategy,
};

/// Request or seed the map tiles covering a GeoJSON boundary.
///
/// In `request` mode every tile is fetched from the tile endpoint and its
/// response time logged to CSV. In `seed` mode each tile is rendered into the
/// cache with `tegola cache seed`; tiles that fail are remembered and skipped
/// on the next run.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// TOML settings file. Flags override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// URL or path of the GeoJSON FeatureCollection defining the area of interest.
    #[arg(long)]
    pub geojson_url: Option<String>,

    /// Features making up the area of interest: `polygon` or `point`.
    #[arg(long, value_parser = FeatureKind::from_str)]
    pub feature_kind: Option<FeatureKind>,

    /// Radius in degrees of the disk drawn around each point feature.
    #[arg(long)]
    pub buffer_radius: Option<f64>,

    /// Comma-separated list of zoom levels.
    #[arg(long, value_delimiter = ',')]
    pub zoom_levels: Option<Vec<u8>>,

    /// Operation type.
    #[arg(long = "type", value_enum)]
    pub mode: Option<Mode>,

    /// Worker count handed to the seeding tool.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Output CSV file name for response times.
    #[arg(long)]
    pub output_file: Option<PathBuf>,

    /// Tile URL with `{z}`, `{x}` and `{y}` placeholders.
    #[arg(long)]
    pub url_template: Option<String>,

    /// Requests in flight at once while benchmarking.
    #[arg(long)]
    pub request_concurrency: Option<usize>,

    /// Per-request timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seeding tool executable.
    #[arg(long)]
    pub tegola: Option<PathBuf>,

    /// Config file passed to the seeding tool.
    #[arg(long)]
    pub tegola_config: Option<PathBuf>,

    /// Map name passed to the seeding tool.
    #[arg(long)]
    pub map: Option<String>,

    /// One tool invocation per tile, or per batch of tiles.
    #[arg(long, value_enum)]
    pub strategy: Option<SeedStrategy>,

    /// Tiles per invocation with the batch strategy.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Tool invocations allowed to run at the same time.
    #[arg(long)]
    pub parallel_invocations: Option<usize>,

    /// Seconds before a hung tool invocation is killed. 0 waits forever.
    #[arg(long)]
    pub watchdog: Option<u64>,

    /// CSV log of per-tile render times reported by the seeding tool.
    #[arg(long)]
    pub performance_log: Option<PathBuf>,

    /// File listing tiles to skip because they failed before.
    #[arg(long)]
    pub ledger: Option<PathBuf>,

    /// Whether the ledger keeps earlier failures or only this run's.
    #[arg(long, value_enum)]
    pub ledger_policy: Option<LedgerPolicy>,

    /// S3 bucket to upload the result logs to.
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Key prefix for uploaded logs.
    #[arg(long)]
    pub upload_prefix: Option<String>,

    /// Path to log file.
    ///
    /// Logs go to stderr when not set.
    #[arg(short, long)]
    pub log_file: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

impl Cli {
    /// Writes every flag that was given over `settings`.
    pub fn apply(&self, settings: &mut Settings) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }

        if self.geojson_url.is_some() {
            settings.geojson_url = self.geojson_url.clone();
        }
        set(&mut settings.feature_kind, &self.feature_kind);
        set(&mut settings.buffer_radius, &self.buffer_radius);
        set(&mut settings.zoom_levels, &self.zoom_levels);
        set(&mut settings.mode, &self.mode);

        set(&mut settings.request.output_file, &self.output_file);
        set(&mut settings.request.url_template, &self.url_template);
        set(&mut settings.request.concurrency, &self.request_concurrency);
        set(
            &mut settings.request.timeout,
            &self.timeout.map(Duration::from_secs),
        );

        set(&mut settings.seed.concurrency, &self.concurrency);
        set(&mut settings.seed.program, &self.tegola);
        set(&mut settings.seed.config_path, &self.tegola_config);
        set(&mut settings.seed.map, &self.map);
        set(&mut settings.seed.strategy, &self.strategy);
        set(&mut settings.seed.batch_size, &self.batch_size);
        set(&mut settings.seed.parallel_invocations, &self.parallel_invocations);
        set(
            &mut settings.seed.watchdog,
            &self.watchdog.map(Duration::from_secs),
        );
        set(&mut settings.seed.performance_log, &self.performance_log);
        set(&mut settings.seed.ledger_path, &self.ledger);
        set(&mut settings.seed.ledger_policy, &self.ledger_policy);

        if self.s3_bucket.is_some() {
            settings.upload.bucket = self.s3_bucket.clone();
        }
        set(&mut settings.upload.prefix, &self.upload_prefix);
    }
}
