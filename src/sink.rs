//! CSV result logs.
//!
//! A [`CsvLog`] is the only writer of its file. Creating one truncates the file
//! and writes the header; every appended row is flushed and synced before
//! `append` returns so rows survive a crash right after being written.

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{error::Result, tiles::TileTask};

pub const BENCHMARK_COLUMNS: [&str; 5] = ["URL", "lon", "lat", "response_time", "zoom"];
pub const PERFORMANCE_COLUMNS: [&str; 2] = ["tile", "elapsed"];

/// Written in the response time column for tiles that timed out or failed.
pub const FAILED_MARKER: &str = "failed";

#[derive(Debug)]
pub struct CsvLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl CsvLog {
    pub fn create(path: impl Into<PathBuf>, columns: &[&str]) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        let mut log = Self {
            path,
            writer: csv::Writer::from_writer(file),
            rows: 0,
        };
        log.write(columns)?;
        Ok(log)
    }

    pub fn append<I, T>(&mut self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.write(row)?;
        self.rows += 1;
        Ok(())
    }

    fn write<I, T>(&mut self, record: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.writer.write_record(record)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended since the header.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

/// Creates the benchmarking log with its header.
pub fn benchmark_log(path: impl Into<PathBuf>) -> Result<CsvLog> {
    CsvLog::create(path, &BENCHMARK_COLUMNS)
}

/// Creates the seeding performance log with its header.
pub fn performance_log(path: impl Into<PathBuf>) -> Result<CsvLog> {
    CsvLog::create(path, &PERFORMANCE_COLUMNS)
}

pub fn benchmark_row(task: &TileTask, response_time: Option<Duration>) -> [String; 5] {
    [
        task.url.clone().unwrap_or_default(),
        task.centroid.x().to_string(),
        task.centroid.y().to_string(),
        response_time
            .map(|elapsed| elapsed.as_secs_f64().to_string())
            .unwrap_or_else(|| FAILED_MARKER.to_string()),
        task.tile.z.to_string(),
    ]
}
