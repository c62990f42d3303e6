//! Master dataset persistence + HTTP fetch utilities.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local};
use jobharvest_core::{MasterDataset, MasterRow};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobharvest-storage";

pub const BACKUP_PREFIX: &str = "backup_new_jobs_";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error on {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{} has no `{}` column", path.display(), MasterRow::ID_COLUMN)]
    MissingIdColumn { path: PathBuf },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Persisted tabular store holding the master dataset.
///
/// A single run owns the store exclusively; nothing here guards against concurrent runs.
pub trait MasterStore: Send + Sync {
    /// Location shown in logs and notifications.
    fn location(&self) -> &Path;

    fn exists(&self) -> bool;

    fn load(&self) -> Result<MasterDataset, StoreError>;

    /// Replaces the stored dataset. The previous contents survive any failure.
    fn save(&self, rows: &[MasterRow]) -> Result<(), StoreError>;

    /// Writes `rows` to a new timestamped file next to the master and returns its path.
    fn write_backup(&self, rows: &[MasterRow], at: DateTime<Local>) -> Result<PathBuf, StoreError>;
}

#[derive(Debug, Clone)]
pub struct CsvMasterStore {
    path: PathBuf,
}

impl CsvMasterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn directory(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn backup_path_for(&self, at: DateTime<Local>) -> PathBuf {
        let stamp = at.format("%Y%m%d_%H%M%S").to_string();
        let dir = self.directory();
        let mut candidate = dir.join(format!("{BACKUP_PREFIX}{stamp}.csv"));
        let mut n = 1;
        while candidate.exists() {
            candidate = dir.join(format!("{BACKUP_PREFIX}{stamp}_{n}.csv"));
            n += 1;
        }
        candidate
    }
}

impl MasterStore for CsvMasterStore {
    fn location(&self) -> &Path {
        &self.path
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn load(&self) -> Result<MasterDataset, StoreError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::Headers)
            .from_path(&self.path)
            .map_err(|e| StoreError::csv(&self.path, e))?;
        let headers = reader
            .headers()
            .map_err(|e| StoreError::csv(&self.path, e))?
            .clone();
        if !headers.iter().any(|h| h == MasterRow::ID_COLUMN) {
            return Err(StoreError::MissingIdColumn {
                path: self.path.clone(),
            });
        }
        let extra_columns: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !is_fixed_column(h))
            .map(|(i, h)| (i, h.to_string()))
            .collect();

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|e| StoreError::csv(&self.path, e))?;
            let mut row: MasterRow = record
                .deserialize(Some(&headers))
                .map_err(|e| StoreError::csv(&self.path, e))?;
            row.extra = extra_columns
                .iter()
                .map(|(i, h)| (h.clone(), record.get(*i).unwrap_or_default().to_string()))
                .collect();
            rows.push(row);
        }
        debug!(path = %self.path.display(), rows = rows.len(), "loaded master dataset");
        Ok(rows)
    }

    fn save(&self, rows: &[MasterRow]) -> Result<(), StoreError> {
        let bytes = encode_rows(rows).map_err(|e| StoreError::csv(&self.path, e))?;
        write_atomically(&self.path, &bytes)?;
        debug!(path = %self.path.display(), rows = rows.len(), "saved master dataset");
        Ok(())
    }

    fn write_backup(&self, rows: &[MasterRow], at: DateTime<Local>) -> Result<PathBuf, StoreError> {
        let backup_path = self.backup_path_for(at);
        let bytes = encode_rows(rows).map_err(|e| StoreError::csv(&backup_path, e))?;
        write_atomically(&backup_path, &bytes)?;
        Ok(backup_path)
    }
}

fn is_fixed_column(header: &str) -> bool {
    MasterRow::COLUMNS.iter().any(|column| *column == header)
}

/// Serialises rows under the fixed master header, including when `rows` is empty.
///
/// Columns carried in [`MasterRow::extra`] follow the fixed ones, in first-seen order.
pub fn encode_rows(rows: &[MasterRow]) -> Result<Vec<u8>, csv::Error> {
    let mut extra_columns: Vec<&str> = Vec::new();
    for (header, _) in rows.iter().flat_map(|row| &row.extra) {
        let header = header.as_str();
        if !is_fixed_column(header) && !extra_columns.contains(&header) {
            extra_columns.push(header);
        }
    }

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(MasterRow::COLUMNS.iter().chain(&extra_columns))?;
    for row in rows {
        let fixed = row.cells().into_iter().map(Option::unwrap_or_default);
        let extra = extra_columns
            .iter()
            .map(|column| row.extra_value(column).unwrap_or_default());
        writer.write_record(fixed.chain(extra))?;
    }
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

/// Writes through a sibling temp file and an atomic rename, so readers see old or new bytes only.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.flush()?;
            file.sync_all()
        });
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::io(&temp_path, err));
    }

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// One-request-at-a-time HTTP client. Callers own pacing.
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

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_inner(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_inner(&self, url: &str) -> Result<FetchedResponse, FetchError> {
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
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
