//! Copies finished logs to object storage.
//!
//! Upload problems never fail a run: [`upload_logs`] reports them and moves on.

use std::path::{Path, PathBuf};

use object_store::{aws::AmazonS3Builder, path::Path as ObjectPath, ObjectStore, PutPayload};
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const DEFAULT_PREFIX: &str = "tiler_benchmark";

#[derive(Debug)]
pub struct Uploader<S> {
    store: S,
    /// Printable root of the destination, e.g. `s3://osmseed-dev`.
    location: String,
}

impl Uploader<object_store::aws::AmazonS3> {
    /// S3 bucket uploader using credentials and region from the environment.
    pub fn s3(bucket: &str) -> Result<Self> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| Error::StorageUpload(e.to_string()))?;
        Ok(Self::new(store, format!("s3://{bucket}")))
    }
}

impl<S: ObjectStore> Uploader<S> {
    pub fn new(store: S, location: impl Into<String>) -> Self {
        Self {
            store,
            location: location.into(),
        }
    }

    pub async fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let bytes = tokio::fs::read(local).await?;
        self.store
            .put(&ObjectPath::from(key), PutPayload::from(bytes))
            .await
            .map_err(|e| Error::StorageUpload(e.to_string()))?;
        Ok(())
    }

    pub fn location(&self, key: &str) -> String {
        format!("{}/{key}", self.location)
    }
}

/// Destination key for a local file: `{prefix}/{file name}`.
pub fn destination_key(prefix: &str, local: &Path) -> String {
    let name = local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    }
}

/// Uploads every file, returning how many made it.
pub async fn upload_logs<S: ObjectStore>(uploader: &Uploader<S>, paths: &[PathBuf], prefix: &str) -> usize {
    let mut uploaded = 0;
    for path in paths {
        let key = destination_key(prefix, path);
        match uploader.upload(path, &key).await {
            Ok(()) => {
                info!(file = %path.display(), destination = %uploader.location(&key), "uploaded log");
                uploaded += 1;
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(file = %path.display(), "log file not found; skipping upload");
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "failed to upload log");
            }
        }
    }
    uploaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[test]
    fn key_uses_prefix_and_file_name() {
        assert_eq!(
            destination_key("tiler_benchmark", Path::new("/tmp/out/times.csv")),
            "tiler_benchmark/times.csv"
        );
        assert_eq!(destination_key("/nested/", Path::new("times.csv")), "nested/times.csv");
        assert_eq!(destination_key("", Path::new("times.csv")), "times.csv");
    }

    #[tokio::test]
    async fn uploads_existing_files_and_skips_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("times.csv");
        std::fs::write(&present, "URL,lon,lat,response_time,zoom\n").unwrap();
        let missing = dir.path().join("absent.csv");

        let uploader = Uploader::new(InMemory::new(), "memory://test");
        let uploaded = upload_logs(&uploader, &[present, missing], DEFAULT_PREFIX).await;
        assert_eq!(uploaded, 1);

        let stored = uploader
            .store
            .get(&ObjectPath::from("tiler_benchmark/times.csv"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&stored[..], b"URL,lon,lat,response_time,zoom\n");
        assert_eq!(
            uploader.location("tiler_benchmark/times.csv"),
            "memory://test/tiler_benchmark/times.csv"
        );
    }
}
