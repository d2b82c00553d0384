//! Run settings: built-in defaults, then an optional TOML file, then
//! `TILER_BENCH_*` environment variables. Command-line flags are applied on
//! top by the binary.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{
    benchmark::BenchmarkOptions,
    boundary::FeatureKind,
    command::TegolaCommand,
    error::{Error, Result},
    ledger::LedgerPolicy,
    seed::{SeedOptions, SeedStrategy},
    tiles::{check_zoom, UrlTemplate, DEFAULT_URL_TEMPLATE},
    upload::DEFAULT_PREFIX,
};

pub const ENV_PREFIX: &str = "TILER_BENCH_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Render tiles into the cache through the external tool.
    #[default]
    Seed,
    /// Request tiles over HTTP and record response times.
    Request,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// URL or local path of the boundary FeatureCollection.
    pub geojson_url: Option<String>,
    pub feature_kind: FeatureKind,
    /// Disk radius, in degrees, for point features.
    pub buffer_radius: f64,
    pub zoom_levels: Vec<u8>,
    pub mode: Mode,
    pub request: RequestSettings,
    pub seed: SeedSettings,
    pub upload: UploadSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            geojson_url: None,
            feature_kind: FeatureKind::Polygon,
            buffer_radius: 0.01,
            zoom_levels: vec![8, 9, 10],
            mode: Mode::Seed,
            request: RequestSettings::default(),
            seed: SeedSettings::default(),
            upload: UploadSettings::default(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestSettings {
    pub url_template: String,

    /// Per-request timeout in seconds.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub timeout: Duration,

    pub concurrency: usize,
    pub output_file: PathBuf,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_URL_TEMPLATE.to_string(),
            timeout: Duration::from_secs(600),
            concurrency: 64,
            output_file: PathBuf::from("dc_tile_response_times.csv"),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SeedSettings {
    pub program: PathBuf,
    pub config_path: PathBuf,
    pub map: String,
    pub concurrency: usize,
    pub strategy: SeedStrategy,
    pub batch_size: usize,
    pub parallel_invocations: usize,

    /// Longest a single invocation may run, in seconds. Zero disables it.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub watchdog: Duration,

    pub performance_log: PathBuf,
    pub ledger_path: PathBuf,
    pub ledger_policy: LedgerPolicy,
}

impl Default for SeedSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("tegola"),
            config_path: PathBuf::from("/opt/tegola_config/config.toml"),
            map: "osm".to_string(),
            concurrency: 32,
            strategy: SeedStrategy::PerTile,
            batch_size: 1000,
            parallel_invocations: 1,
            watchdog: Duration::from_secs(60 * 60),
            performance_log: PathBuf::from("seed_performance.csv"),
            ledger_path: PathBuf::from("skipped_tiles.log"),
            ledger_policy: LedgerPolicy::Replace,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadSettings {
    /// Destination bucket; nothing is uploaded when unset.
    pub bucket: Option<String>,
    pub prefix: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            bucket: None,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl Settings {
    /// Layers the optional TOML file and the environment over the defaults.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(file) = file {
            if !file.is_file() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("config file {} not found", file.display()),
                )));
            }
            figment = figment.merge(Toml::file(file));
        }
        let settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Rejects settings that would make a run meaningless before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.zoom_levels.is_empty() {
            return Err(Error::NoZoomLevels);
        }
        for zoom in &self.zoom_levels {
            check_zoom(*zoom)?;
        }
        if self.feature_kind == FeatureKind::Point
            && !(self.buffer_radius.is_finite() && self.buffer_radius > 0.0)
        {
            return Err(Error::InvalidBufferRadius(self.buffer_radius));
        }
        match self.mode {
            Mode::Request => {
                UrlTemplate::new(self.request.url_template.as_str())?;
                if self.request.concurrency == 0 {
                    return Err(Error::InvalidConcurrency);
                }
            }
            Mode::Seed => {
                if self.seed.concurrency == 0
                    || self.seed.parallel_invocations == 0
                    || self.seed.batch_size == 0
                {
                    return Err(Error::InvalidConcurrency);
                }
            }
        }
        Ok(())
    }

    pub fn url_template(&self) -> Result<UrlTemplate> {
        UrlTemplate::new(self.request.url_template.as_str())
    }

    pub fn benchmark_options(&self, show_progress: bool) -> BenchmarkOptions {
        BenchmarkOptions {
            concurrency: self.request.concurrency,
            timeout: self.request.timeout,
            show_progress,
        }
    }

    pub fn seed_options(&self) -> SeedOptions {
        SeedOptions {
            concurrency: self.seed.concurrency,
            strategy: self.seed.strategy,
            batch_size: self.seed.batch_size,
            parallel_invocations: self.seed.parallel_invocations,
            ledger_policy: self.seed.ledger_policy,
        }
    }

    pub fn tegola_command(&self) -> TegolaCommand {
        TegolaCommand {
            program: self.seed.program.clone(),
            config_path: self.seed.config_path.clone(),
            map: self.seed.map.clone(),
            watchdog: Some(self.seed.watchdog).filter(|watchdog| !watchdog.is_zero()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_match_reference_driver() {
        let settings = Settings::default();
        assert_eq!(settings.zoom_levels, vec![8, 9, 10]);
        assert_eq!(settings.mode, Mode::Seed);
        assert_eq!(settings.request.timeout, Duration::from_secs(600));
        assert_eq!(settings.seed.concurrency, 32);
        assert_eq!(settings.seed.ledger_path, PathBuf::from("skipped_tiles.log"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn file_and_environment_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "tiler.toml",
                r#"
                    zoom_levels = [12, 13]
                    mode = "request"
                    feature_kind = "point"

                    [request]
                    timeout = 30

                    [seed]
                    strategy = "batch"
                    ledger_policy = "merge"
                    watchdog = 0
                "#,
            )?;
            jail.set_env("TILER_BENCH_SEED__CONCURRENCY", "4");
            jail.set_env("TILER_BENCH_GEOJSON_URL", "boundary.geojson");

            let settings = Settings::load(Some(Path::new("tiler.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(settings.zoom_levels, vec![12, 13]);
            assert_eq!(settings.mode, Mode::Request);
            assert_eq!(settings.feature_kind, FeatureKind::Point);
            assert_eq!(settings.request.timeout, Duration::from_secs(30));
            assert_eq!(settings.seed.strategy, SeedStrategy::Batch);
            assert_eq!(settings.seed.ledger_policy, LedgerPolicy::Merge);
            assert_eq!(settings.seed.concurrency, 4);
            assert_eq!(settings.geojson_url.as_deref(), Some("boundary.geojson"));
            assert_eq!(settings.tegola_command().watchdog, None);
            Ok(())
        });
    }

    #[test]
    fn unknown_feature_kind_in_file_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("tiler.toml", r#"feature_kind = "linestring""#)?;
            let result = Settings::load(Some(Path::new("tiler.toml")));
            assert!(matches!(result, Err(Error::Config(_))));
            Ok(())
        });
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(matches!(
            Settings::load(Some(Path::new("/nonexistent/tiler.toml"))),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn validation_catches_bad_settings() {
        let mut settings = Settings {
            zoom_levels: vec![8, 31],
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::InvalidZoom(31))));

        settings.zoom_levels.clear();
        assert!(matches!(settings.validate(), Err(Error::NoZoomLevels)));

        settings.zoom_levels = vec![8];
        settings.mode = Mode::Request;
        settings.request.url_template = "https://example.com/tiles".to_string();
        assert!(matches!(settings.validate(), Err(Error::InvalidUrlTemplate(_))));

        settings.mode = Mode::Seed;
        settings.seed.concurrency = 0;
        assert!(matches!(settings.validate(), Err(Error::InvalidConcurrency)));

        settings.seed.concurrency = 1;
        settings.feature_kind = FeatureKind::Point;
        settings.buffer_radius = -1.0;
        assert!(matches!(settings.validate(), Err(Error::InvalidBufferRadius(_))));
    }
}
