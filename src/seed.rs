//! Cache seeding through the external tile cache service.
//!
//! Tiles listed in the resume ledger are skipped without invoking anything.
//! The rest are handed to the [`SeedCommand`] one tile per invocation, or in
//! chunks with the batch strategy. Completion lines are appended to the
//! performance log as they stream in. A failed invocation only marks its own
//! tiles as failed, and once every tile has been tried the ledger is rewritten
//! from this run's failures.

use std::collections::HashSet;

use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::RuntimeFlavor;
use tracing::{debug, info, trace, warn};

use crate::{
    command::{parse_took_line, SeedCommand, SeedInvocation},
    error::Result,
    ledger::{LedgerPolicy, ResumeLedger},
    sink::CsvLog,
    tiles::TileCoordinate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SeedStrategy {
    /// One invocation per tile, zoom range pinned to the tile's zoom.
    #[default]
    PerTile,
    /// One invocation per chunk of `batch_size` tiles fed through stdin.
    Batch,
}

#[derive(Debug, Clone)]
pub struct SeedOptions {
    /// Worker count passed to the external tool.
    pub concurrency: usize,
    pub strategy: SeedStrategy,
    pub batch_size: usize,
    /// External invocations allowed to run at the same time.
    pub parallel_invocations: usize,
    pub ledger_policy: LedgerPolicy,
}

impl Default for SeedOptions {
    fn default() -> Self {
        Self {
            concurrency: 32,
            strategy: SeedStrategy::PerTile,
            batch_size: 1000,
            parallel_invocations: 1,
            ledger_policy: LedgerPolicy::Replace,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Tiles handed to the external tool.
    pub attempted: usize,
    /// Tiles skipped because the ledger listed them.
    pub skipped: usize,
    /// Completion lines written to the performance log.
    pub completed: usize,
    pub failed: Vec<TileCoordinate>,
}

struct InvocationOutcome {
    completed: usize,
    failed: Vec<TileCoordinate>,
}

/// Seeds `tiles`, returning the report whose `failed` list has also been
/// committed to the ledger.
///
/// Only ledger persistence errors are returned; everything that goes wrong
/// with an individual invocation is absorbed into the failed list.
pub async fn seed<C: SeedCommand>(
    command: &C,
    tiles: &[TileCoordinate],
    ledger: &mut ResumeLedger,
    log: &mut CsvLog,
    options: &SeedOptions,
) -> Result<SeedReport> {
    let mut report = SeedReport::default();

    let mut seen = HashSet::with_capacity(tiles.len());
    let mut pending = Vec::with_capacity(tiles.len());
    for tile in tiles {
        if !seen.insert(*tile) {
            debug!(%tile, "tile listed more than once");
        } else if ledger.contains(tile) {
            info!(%tile, "skipping previously failed tile");
            report.skipped += 1;
        } else {
            pending.push(*tile);
        }
    }
    report.attempted = pending.len();

    let batches: Vec<Vec<TileCoordinate>> = match options.strategy {
        SeedStrategy::PerTile => pending.iter().map(|tile| vec![*tile]).collect(),
        SeedStrategy::Batch => by_zoom(&pending)
            .iter()
            .flat_map(|group| group.chunks(options.batch_size.max(1)))
            .map(<[TileCoordinate]>::to_vec)
            .collect(),
    };
    info!(
        tiles = pending.len(),
        invocations = batches.len(),
        skipped = report.skipped,
        strategy = ?options.strategy,
        "starting seeding"
    );

    let log = Mutex::new(log);
    let mut outcomes: Vec<(usize, InvocationOutcome)> = stream::iter(batches.into_iter().enumerate())
        .map(|(index, batch)| {
            let log = &log;
            async move { (index, run_invocation(command, batch, log, options).await) }
        })
        .buffer_unordered(options.parallel_invocations.max(1))
        .collect()
        .await;
    outcomes.sort_unstable_by_key(|(index, _)| *index);

    for (_, outcome) in outcomes {
        report.completed += outcome.completed;
        report.failed.extend(outcome.failed);
    }

    ledger.commit(&report.failed, options.ledger_policy)?;

    info!(
        attempted = report.attempted,
        skipped = report.skipped,
        completed = report.completed,
        failed = report.failed.len(),
        "seeding complete"
    );
    if !report.failed.is_empty() {
        let failed: Vec<String> = report.failed.iter().map(ToString::to_string).collect();
        warn!(tiles = ?failed, "failed tiles");
    }
    Ok(report)
}

/// Splits tiles into one group per zoom level, in order of first appearance,
/// so every invocation covers exactly one zoom.
fn by_zoom(tiles: &[TileCoordinate]) -> Vec<Vec<TileCoordinate>> {
    let mut groups: Vec<Vec<TileCoordinate>> = vec![];
    for tile in tiles {
        match groups.iter_mut().find(|group| group[0].z == tile.z) {
            Some(group) => group.push(*tile),
            None => groups.push(vec![*tile]),
        }
    }
    groups
}

/// Runs a synchronous, fsync-heavy step from inside the async runtime.
///
/// On a multi-threaded runtime the worker is handed off first so other
/// invocations keep streaming; a current-thread runtime cannot do that.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

async fn run_invocation<C: SeedCommand>(
    command: &C,
    tiles: Vec<TileCoordinate>,
    log: &Mutex<&mut CsvLog>,
    options: &SeedOptions,
) -> InvocationOutcome {
    let invocation = SeedInvocation::new(tiles, options.concurrency);
    if let [tile] = invocation.tiles.as_slice() {
        info!(%tile, concurrency = invocation.concurrency, "seeding tile");
    } else {
        info!(
            tiles = invocation.tiles.len(),
            min_zoom = invocation.min_zoom,
            max_zoom = invocation.max_zoom,
            concurrency = invocation.concurrency,
            "seeding batch"
        );
    }

    let mut reported = HashSet::new();
    let mut log_failed = false;
    let result = {
        let mut on_line = |line: &str| match parse_took_line(line) {
            Ok(Some(took)) => {
                let row = [took.tile.to_string(), took.elapsed];
                if let Err(e) = blocking(|| log.lock().append(row)) {
                    warn!(tile = %took.tile, error = %e, "failed to append performance row");
                    log_failed = true;
                } else {
                    reported.insert(took.tile);
                }
            }
            Ok(None) => trace!(line, "seed output"),
            Err(e) => warn!(error = %e, "ignoring malformed completion line"),
        };
        command.run(&invocation, &mut on_line).await
    };

    let succeeded = match result {
        Ok(exit) if exit.success() && !log_failed => true,
        Ok(exit) => {
            warn!(%exit, tiles = invocation.tiles.len(), "seed command failed");
            false
        }
        Err(e) => {
            warn!(error = %e, tiles = invocation.tiles.len(), "error running seed command");
            false
        }
    };

    let failed = if succeeded {
        debug!(tiles = invocation.tiles.len(), "seeded successfully");
        vec![]
    } else {
        match options.strategy {
            SeedStrategy::PerTile => invocation.tiles.clone(),
            SeedStrategy::Batch => invocation
                .tiles
                .iter()
                .filter(|tile| !reported.contains(*tile))
                .copied()
                .collect(),
        }
    };

    InvocationOutcome {
        completed: reported.len(),
        failed,
    }
}
