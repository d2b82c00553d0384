//! Tile response-time benchmarking over HTTP.
//!
//! Zoom levels are measured one group at a time. Inside a group up to
//! `concurrency` requests are in flight; each carries its own timeout, so a slow
//! tile only ever cancels its own request. Outcomes are matched back to tiles by
//! their position in the group, never by completion order.

use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    time::Duration,
};

use futures::{stream, StreamExt};
use indicatif::ProgressBar;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    sink::{benchmark_row, CsvLog},
    tiles::{TileCoordinate, TileTask},
};

/// Default User-Agent for tile requests.
const USER_AGENT: &str = concat!("tiler-bench/", env!("CARGO_PKG_VERSION"));

/// Issues a single tile request.
///
/// Implementations resolve once the whole body has been read and the status
/// checked, so the measured time covers the complete response.
pub trait TileFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<()>> + Send;
}

/// [`TileFetcher`] backed by a shared reqwest connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl TileFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Http(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http(format!("HTTP {status} from {url}")));
        }

        response
            .bytes()
            .await
            .map_err(|e| Error::Http(format!("failed to read response: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Timeout,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TileOutcome {
    pub tile: TileCoordinate,
    /// Wall-clock time to a validated response; `None` unless successful.
    pub elapsed: Option<Duration>,
    pub status: OutcomeStatus,
}

impl TileOutcome {
    fn success(tile: TileCoordinate, elapsed: Duration) -> Self {
        Self {
            tile,
            elapsed: Some(elapsed),
            status: OutcomeStatus::Success,
        }
    }

    fn failed(tile: TileCoordinate, status: OutcomeStatus) -> Self {
        Self {
            tile,
            elapsed: None,
            status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarkOptions {
    /// Requests in flight at once within a zoom group.
    pub concurrency: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    pub show_progress: bool,
}

impl Default for BenchmarkOptions {
    fn default() -> Self {
        Self {
            concurrency: 64,
            timeout: Duration::from_secs(600),
            show_progress: false,
        }
    }
}

/// Latency statistics for one zoom level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoomStats {
    pub tiles: usize,
    pub succeeded: usize,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    total: Duration,
}

impl ZoomStats {
    pub fn mean(&self) -> Option<Duration> {
        u32::try_from(self.succeeded)
            .ok()
            .filter(|succeeded| *succeeded > 0)
            .map(|succeeded| self.total / succeeded)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BenchmarkSummary {
    pub succeeded: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub zooms: BTreeMap<u8, ZoomStats>,
}

impl BenchmarkSummary {
    fn record(&mut self, outcome: &TileOutcome) {
        let stats = self.zooms.entry(outcome.tile.z).or_default();
        stats.tiles += 1;
        match outcome.status {
            OutcomeStatus::Success => self.succeeded += 1,
            OutcomeStatus::Timeout => self.timed_out += 1,
            OutcomeStatus::Error => self.failed += 1,
        }
        if let Some(elapsed) = outcome.elapsed {
            stats.succeeded += 1;
            stats.total += elapsed;
            stats.min = Some(stats.min.map_or(elapsed, |min| min.min(elapsed)));
            stats.max = Some(stats.max.map_or(elapsed, |max| max.max(elapsed)));
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.timed_out + self.failed
    }
}

/// Requests every task, zoom group by zoom group, appending one row per tile to
/// `log` once its group has finished.
///
/// Tile failures are recorded in the log and summary; only log I/O errors are
/// returned.
pub async fn measure<F: TileFetcher>(
    fetcher: &F,
    tasks: &[TileTask],
    zoom_levels: &[u8],
    log: &mut CsvLog,
    options: &BenchmarkOptions,
) -> Result<BenchmarkSummary> {
    let mut summary = BenchmarkSummary::default();
    let mut seen = HashSet::new();

    for &zoom in zoom_levels {
        if !seen.insert(zoom) {
            continue;
        }
        let group: Vec<&TileTask> = tasks.iter().filter(|task| task.tile.z == zoom).collect();
        if group.is_empty() {
            info!(zoom, "no tiles for zoom level");
            continue;
        }

        info!(zoom, tiles = group.len(), "measuring zoom level");
        let progress = if options.show_progress {
            ProgressBar::new(group.len() as u64)
        } else {
            ProgressBar::hidden()
        };

        let timeout = options.timeout;
        let mut outcomes: Vec<(usize, TileOutcome)> = stream::iter(group.iter().enumerate())
            .map(|(index, task)| async move { (index, fetch_one(fetcher, task, timeout).await) })
            .buffer_unordered(options.concurrency.max(1))
            .inspect(|_| progress.inc(1))
            .collect()
            .await;
        progress.finish_and_clear();
        outcomes.sort_unstable_by_key(|(index, _)| *index);

        for (task, (_, outcome)) in group.iter().zip(&outcomes) {
            log.append(benchmark_row(task, outcome.elapsed))?;
            summary.record(outcome);
        }

        if let Some(stats) = summary.zooms.get(&zoom) {
            info!(
                zoom,
                tiles = stats.tiles,
                succeeded = stats.succeeded,
                mean_ms = stats.mean().map(|mean| mean.as_millis() as u64),
                max_ms = stats.max.map(|max| max.as_millis() as u64),
                "zoom level complete"
            );
        }
    }

    info!(
        path = %log.path().display(),
        succeeded = summary.succeeded,
        timed_out = summary.timed_out,
        failed = summary.failed,
        "benchmark complete"
    );
    Ok(summary)
}

async fn fetch_one<F: TileFetcher>(fetcher: &F, task: &TileTask, timeout: Duration) -> TileOutcome {
    let tile = task.tile;
    let Some(url) = task.url.as_deref() else {
        warn!(%tile, "tile has no request URL");
        return TileOutcome::failed(tile, OutcomeStatus::Error);
    };

    let started = Instant::now();
    match tokio::time::timeout(timeout, fetcher.fetch(url)).await {
        Ok(Ok(())) => {
            let elapsed = started.elapsed();
            debug!(%tile, url, elapsed_ms = elapsed.as_millis() as u64, "tile fetched");
            TileOutcome::success(tile, elapsed)
        }
        Ok(Err(e)) => {
            warn!(%tile, url, error = %e, "failed to fetch tile");
            TileOutcome::failed(tile, OutcomeStatus::Error)
        }
        Err(_) => {
            warn!(%tile, url, timeout_secs = timeout.as_secs(), "tile request timed out");
            TileOutcome::failed(tile, OutcomeStatus::Timeout)
        }
    }
}
