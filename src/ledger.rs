//! Durable record of tiles to skip because they failed on an earlier run.
//!
//! The backing file is a flat list of `z/x/y` identifiers, one per line. A
//! missing file is an empty ledger. Saving writes a sibling temporary file and
//! renames it over the original so a crash never leaves a half-written ledger.

use std::{
    collections::BTreeSet,
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{error::Result, tiles::TileCoordinate};

/// What to do with entries from the previous run when saving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LedgerPolicy {
    /// Keep only the failures of the current run.
    #[default]
    Replace,
    /// Keep previous entries alongside the current run's failures.
    Merge,
}

#[derive(Debug, Clone)]
pub struct ResumeLedger {
    path: PathBuf,
    entries: BTreeSet<String>,
}

impl ResumeLedger {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = load(&path)?;
        info!(path = %path.display(), entries = entries.len(), "loaded resume ledger");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, tile: &TileCoordinate) -> bool {
        self.entries.contains(&tile.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeSet<String> {
        &self.entries
    }

    /// Persists the outcome of a finished run and makes it the in-memory state.
    pub fn commit<'a>(
        &mut self,
        failed: impl IntoIterator<Item = &'a TileCoordinate>,
        policy: LedgerPolicy,
    ) -> Result<()> {
        let mut next: BTreeSet<String> = failed.into_iter().map(ToString::to_string).collect();
        if policy == LedgerPolicy::Merge {
            next.extend(self.entries.iter().cloned());
        }
        save(&self.path, &next)?;
        info!(
            path = %self.path.display(),
            entries = next.len(),
            dropped = self.entries.difference(&next).count(),
            ?policy,
            "saved resume ledger"
        );
        self.entries = next;
        Ok(())
    }
}

pub fn load(path: &Path) -> Result<BTreeSet<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no ledger file; starting empty");
            Ok(BTreeSet::new())
        }
        Err(e) => Err(e.into()),
    }
}

pub fn save(path: &Path, entries: &BTreeSet<String>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    let file = File::create(&staging)?;
    let mut writer = BufWriter::new(file);
    for entry in entries {
        writeln!(writer, "{entry}")?;
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&staging, path)?;
    Ok(())
}
