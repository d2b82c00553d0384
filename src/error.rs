use std::{path::PathBuf, time::Duration};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported feature kind `{0}` (expected `polygon` or `point`)")]
    UnsupportedFeatureKind(String),

    #[error("buffer radius must be a positive number of degrees, got {0}")]
    InvalidBufferRadius(f64),

    #[error("zoom level {0} is outside the supported range 0..={max}", max = crate::tiles::MAX_ZOOM)]
    InvalidZoom(u8),

    #[error("no zoom levels were given")]
    NoZoomLevels,

    #[error("concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("url template `{0}` must contain {{z}}, {{x}} and {{y}}")]
    InvalidUrlTemplate(String),

    #[error("invalid tile identifier `{0}`")]
    InvalidTile(String),

    #[error("failed to fetch boundary document: {0}")]
    BoundaryFetch(#[from] reqwest::Error),

    #[error("failed to parse GeoJSON: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("boundary document is not a FeatureCollection")]
    NotAFeatureCollection,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("failed to launch `{program}`: {source}")]
    SeedSpawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("seed command exceeded its watchdog of {0:?}")]
    SeedWatchdog(Duration),

    #[error("upload failed: {0}")]
    StorageUpload(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}
