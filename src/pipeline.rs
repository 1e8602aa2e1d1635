//! Per-job pipeline: fetch the result stream and write it to the run's cache directory
//!
//! Each step fails fast. A failure while copying may leave a partial file behind;
//! removing it is up to the caller's purge policy.

use crate::config::{Config, OutputFormat};
use crate::error::{Error, Result};
use crate::fetch::FetchClient;
use crate::types::Job;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// What a successful pipeline run produced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineOutput {
    /// Bytes copied from the agent (before compression)
    pub bytes: u64,
    /// Time spent fetching and writing
    pub elapsed: Duration,
}

/// Artifact file name for a job
///
/// The `.gz` suffix is always present, whether or not compression is enabled.
pub fn cache_file_name(job_name: &str, format: OutputFormat) -> String {
    format!("{job_name}.{}.gz", format.extension())
}

/// Fetch `job` from the agent and write it to `cache_file`
pub async fn run_pipeline(
    fetch: &FetchClient,
    config: &Config,
    job: &Job,
    cache_file: &Path,
    cancel: &CancellationToken,
) -> Result<PipelineOutput> {
    let start = Instant::now();

    let mut stream = fetch.fetch(job, cancel).await?;

    let file = File::create(cache_file).await.map_err(|source| Error::Write {
        path: cache_file.to_path_buf(),
        source,
    })?;
    let mut writer = CacheWriter::new(cache_file, file, config.gzip);

    let mut bytes = 0u64;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            chunk = stream.chunk() => chunk?,
        };
        let Some(chunk) = chunk else {
            break;
        };
        writer.write(&chunk).await?;
        bytes += chunk.len() as u64;
    }

    writer.finish().await?;

    Ok(PipelineOutput {
        bytes,
        elapsed: start.elapsed(),
    })
}

/// Writes a cache file, optionally through a maximum-ratio gzip encoder
///
/// The encoder writes into an in-memory buffer that is drained to the file after every
/// chunk, so memory use stays bounded by the encoder's own window.
pub(crate) struct CacheWriter {
    path: PathBuf,
    file: File,
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl CacheWriter {
    pub(crate) fn new(path: &Path, file: File, gzip: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            encoder: gzip.then(|| GzEncoder::new(Vec::new(), Compression::best())),
        }
    }

    pub(crate) async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        match &mut self.encoder {
            None => self.write_file(chunk).await,
            Some(encoder) => {
                encoder
                    .write_all(chunk)
                    .map_err(|source| Error::Compression {
                        path: self.path.clone(),
                        source,
                    })?;
                let pending = std::mem::take(encoder.get_mut());
                if pending.is_empty() {
                    return Ok(());
                }
                self.write_file(&pending).await
            }
        }
    }

    /// Finalize the compressor (if any) and flush the file
    pub(crate) async fn finish(mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            let tail = encoder.finish().map_err(|source| Error::Compression {
                path: self.path.clone(),
                source,
            })?;
            self.write_file(&tail).await?;
        }
        self.file.flush().await.map_err(|source| Error::Write {
            path: self.path.clone(),
            source,
        })
    }

    async fn write_file(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).await.map_err(|source| Error::Write {
            path: self.path.clone(),
            source,
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Connection;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::Arc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn write_through(data: &[u8], gzip: bool, chunk_size: usize) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv.gz");
        let file = File::create(&path).await.unwrap();
        let mut writer = CacheWriter::new(&path, file, gzip);
        for chunk in data.chunks(chunk_size.max(1)) {
            writer.write(chunk).await.unwrap();
        }
        writer.finish().await.unwrap();
        std::fs::read(&path).unwrap()
    }

    fn gunzip(compressed: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(compressed).read_to_end(&mut out).unwrap();
        out
    }

    fn multi_buffer_input() -> Vec<u8> {
        (0..300_000u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
    }

    #[test]
    fn cache_file_name_always_has_gz_suffix() {
        assert_eq!(cache_file_name("users", OutputFormat::Csv), "users.csv.gz");
        assert_eq!(
            cache_file_name("orders", OutputFormat::Ldjson),
            "orders.ldjson.gz"
        );
    }

    #[tokio::test]
    async fn gzip_round_trip_empty() {
        let compressed = write_through(b"", true, 8).await;
        assert!(!compressed.is_empty(), "gzip header and trailer expected");
        assert!(gunzip(&compressed).is_empty());
    }

    #[tokio::test]
    async fn gzip_round_trip_small() {
        let data = b"id,name\n1,ada\n2,grace\n";
        let compressed = write_through(data, true, 5).await;
        assert_eq!(gunzip(&compressed), data);
    }

    #[tokio::test]
    async fn gzip_round_trip_multi_buffer() {
        let data = multi_buffer_input();
        let compressed = write_through(&data, true, 8192).await;
        assert_eq!(gunzip(&compressed), data);
    }

    #[tokio::test]
    async fn plain_write_is_verbatim() {
        let data = multi_buffer_input();
        assert_eq!(write_through(&data, false, 4096).await, data);
    }

    fn test_config(addr: String, gzip: bool) -> Config {
        let mut config = Config {
            gzip,
            ..Config::default()
        };
        config.sql_agent.addr = addr;
        config
    }

    fn job() -> Job {
        Job::new(
            "users",
            Arc::new(Connection {
                driver: "sqlite".into(),
                info: serde_json::Map::new(),
            }),
            "select * from users",
        )
    }

    #[tokio::test]
    async fn pipeline_writes_compressed_file_and_counts_raw_bytes() {
        let body = "id,name\n1,ada\n".repeat(1000);
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.clone()))
            .mount(&mock_server)
            .await;

        let config = test_config(mock_server.uri(), true);
        let fetch = FetchClient::new(&config);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(cache_file_name("users", config.format));

        let output = run_pipeline(&fetch, &config, &job(), &path, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.bytes, body.len() as u64);
        let written = std::fs::read(&path).unwrap();
        assert!(written.len() < body.len());
        assert_eq!(gunzip(&written), body.as_bytes());
    }

    #[tokio::test]
    async fn pipeline_without_compression_copies_verbatim() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("a,b\n"))
            .mount(&mock_server)
            .await;

        let config = test_config(mock_server.uri(), false);
        let fetch = FetchClient::new(&config);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.csv.gz");

        let output = run_pipeline(&fetch, &config, &job(), &path, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.bytes, 4);
        assert_eq!(std::fs::read(&path).unwrap(), b"a,b\n");
    }

    #[tokio::test]
    async fn fetch_failure_creates_no_file() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let config = test_config(mock_server.uri(), true);
        let fetch = FetchClient::new(&config);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.csv.gz");

        let err = run_pipeline(&fetch, &config, &job(), &path, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RemoteStatus { status: 500, .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unwritable_destination_is_write_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x"))
            .mount(&mock_server)
            .await;

        let config = test_config(mock_server.uri(), false);
        let fetch = FetchClient::new(&config);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-run-dir").join("users.csv.gz");

        let err = run_pipeline(&fetch, &config, &job(), &path, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Write { .. }));
    }
}
