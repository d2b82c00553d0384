//! # tiler-bench
//! Benchmarks and seeds a map tile cache for the area covered by a GeoJSON boundary.
//!
//! ## Usage
//! A boundary is loaded with [`boundary::load_collection`] and merged into one shape with
//! [`boundary::resolve`]. [`tiles::enumerate`] turns it into the tiles that actually touch the
//! shape at each zoom level, which are then either requested over HTTP with
//! [`benchmark::measure`] or rendered into the cache with [`seed::seed`].
//!
//! Results go to CSV logs written through [`sink::CsvLog`]. Seeding remembers the tiles that
//! failed in a [`ledger::ResumeLedger`] so the next run can skip them. Finished logs can be
//! copied to object storage with [`upload::upload_logs`].

pub mod benchmark;
pub mod boundary;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod seed;
pub mod sink;
pub mod tiles;
pub mod upload;

pub use error::{Error, Result};
