//! Document fetching + immutable snapshot archive for Popolo sources.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "popolo-sources-storage";

const FETCH_LOG: &str = "fetches.tsv";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedSnapshot {
    pub sha256: String,
    pub path: PathBuf,
    /// The body was already on disk from an earlier fetch.
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRecord {
    pub fetched_at: DateTime<Utc>,
    pub sha256: String,
}

/// Per-source archive of fetched documents.
///
/// Bodies live at `source-<id>/<sha256>.json`, so a source that republishes
/// an unchanged document costs one file. Every fetch, reused or not, appends
/// a line to the source's `fetches.tsv`.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn source_dir(&self, source_id: i64) -> PathBuf {
        self.root.join(format!("source-{source_id}"))
    }

    pub async fn archive(
        &self,
        source_id: i64,
        fetched_at: DateTime<Utc>,
        body: &[u8],
    ) -> anyhow::Result<ArchivedSnapshot> {
        let sha256 = Self::sha256_hex(body);
        let dir = self.source_dir(source_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let path = dir.join(format!("{sha256}.json"));
        let reused = match fs::metadata(&path).await {
            Ok(_) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                write_via_rename(&dir, &path, body).await?;
                false
            }
            Err(err) => {
                return Err(err).with_context(|| format!("inspecting {}", path.display()));
            }
        };

        let log_path = dir.join(FETCH_LOG);
        let mut log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .with_context(|| format!("opening {}", log_path.display()))?;
        log.write_all(format!("{}\t{sha256}\n", fetched_at.to_rfc3339()).as_bytes())
            .await
            .with_context(|| format!("appending to {}", log_path.display()))?;
        log.flush()
            .await
            .with_context(|| format!("flushing {}", log_path.display()))?;

        Ok(ArchivedSnapshot {
            sha256,
            path,
            reused,
        })
    }

    /// Fetches recorded for a source, oldest first.
    pub async fn history(&self, source_id: i64) -> anyhow::Result<Vec<FetchRecord>> {
        let log_path = self.source_dir(source_id).join(FETCH_LOG);
        let text = match fs::read_to_string(&log_path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", log_path.display())),
        };

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| -> anyhow::Result<FetchRecord> {
                let (stamp, sha256) = line
                    .split_once('\t')
                    .with_context(|| format!("malformed fetch log line {line:?}"))?;
                let fetched_at = DateTime::parse_from_rfc3339(stamp)
                    .with_context(|| format!("bad timestamp in fetch log: {stamp}"))?
                    .with_timezone(&Utc);
                Ok(FetchRecord {
                    fetched_at,
                    sha256: sha256.to_string(),
                })
            })
            .collect()
    }
}

async fn write_via_rename(dir: &Path, path: &Path, body: &[u8]) -> anyhow::Result<()> {
    let partial = dir.join(format!(".{}.partial", Uuid::new_v4()));
    fs::write(&partial, body)
        .await
        .with_context(|| format!("writing {}", partial.display()))?;
    if let Err(err) = fs::rename(&partial, path).await {
        let _ = fs::remove_file(&partial).await;
        return Err(err).with_context(|| format!("moving snapshot into {}", path.display()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Transport used by the update cycle to retrieve a source document.
///
/// Any non-success response must surface as an error; the cycle never sees a
/// partial body.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched source document");
            Ok(FetchedDocument {
                status: status.as_u16(),
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Serves documents from a fixture directory instead of the network.
///
/// The URL path maps onto a file name with `/` replaced by `_`, so
/// `http://example.com/two-people.json` reads `<root>/two-people.json`.
/// Unknown paths answer 404.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    root: PathBuf,
}

impl FixtureFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn fixture_path(&self, url: &str) -> Option<PathBuf> {
        let parsed = reqwest::Url::parse(url).ok()?;
        let name = parsed.path().trim_start_matches('/').replace('/', "_");
        if name.is_empty() {
            return None;
        }
        Some(self.root.join(name))
    }
}

#[async_trait]
impl DocumentFetcher for FixtureFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let not_found = || FetchError::HttpStatus {
            status: StatusCode::NOT_FOUND.as_u16(),
            url: url.to_string(),
        };
        let path = self.fixture_path(url).ok_or_else(not_found)?;
        match fs::read(&path).await {
            Ok(body) => Ok(FetchedDocument {
                status: StatusCode::OK.as_u16(),
                final_url: url.to_string(),
                body,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(source) => Err(FetchError::Io { path, source }),
        }
    }
}
