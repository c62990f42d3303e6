//! Incremental sync: id reconciliation, master merge, and run orchestration.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use jobharvest_adapters::{
    BoardDetailSource, BoardListingSource, DetailSource, FixtureDetailSource,
    FixtureListingSource, ListingSource, DEFAULT_DETAIL_URL_TEMPLATE,
    DEFAULT_LISTING_URL_TEMPLATE,
};
use jobharvest_core::{CanonicalId, JobRecord, MasterRow, RawId, DEFAULT_LINK_TEMPLATE};
use jobharvest_notify::{MailRelayNotifier, MailRelayOptions, NoopNotifier, Notifier};
use jobharvest_storage::{CsvMasterStore, HttpClientConfig, HttpFetcher, MasterStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobharvest-sync";

pub const SUBJECT_NO_NEW_JOBS: &str = "Job harvest: no new jobs";
pub const SUBJECT_COMPLETED: &str = "Job harvest: completed";
pub const SUBJECT_MERGE_FAILED: &str = "Job harvest: merge failed";
pub const SUBJECT_CRASHED: &str = "Job harvest: CRASHED";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub page_count: u32,
    pub page_size: u32,
    pub request_delay: Duration,
    pub storage_path: PathBuf,
    pub log_dir: PathBuf,
    pub notify_enabled: bool,
    pub recipients: Vec<String>,
    pub notify_endpoint: Option<String>,
    pub notify_sender: String,
    pub notify_token: Option<String>,
    pub listing_url_template: String,
    pub detail_url_template: String,
    pub link_template: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_count: 3,
            page_size: 10,
            request_delay: Duration::from_millis(300),
            storage_path: PathBuf::from("./data/jobs_master.csv"),
            log_dir: PathBuf::from("./data/logs"),
            notify_enabled: false,
            recipients: Vec::new(),
            notify_endpoint: None,
            notify_sender: "jobharvest@localhost".to_string(),
            notify_token: None,
            listing_url_template: DEFAULT_LISTING_URL_TEMPLATE.to_string(),
            detail_url_template: DEFAULT_DETAIL_URL_TEMPLATE.to_string(),
            link_template: DEFAULT_LINK_TEMPLATE.to_string(),
            user_agent: "Mozilla/5.0 (compatible; jobharvest/0.1)".to_string(),
            http_timeout_secs: 10,
            scheduler_enabled: false,
            sync_cron: "0 0 8 * * *".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parse_recipients(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            page_count: env_parse("JOBHARVEST_PAGE_COUNT", defaults.page_count),
            page_size: env_parse("JOBHARVEST_PAGE_SIZE", defaults.page_size),
            request_delay: Duration::from_millis(env_parse(
                "JOBHARVEST_REQUEST_DELAY_MS",
                defaults.request_delay.as_millis() as u64,
            )),
            storage_path: env_opt("JOBHARVEST_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_path),
            log_dir: env_opt("JOBHARVEST_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            notify_enabled: env_flag("JOBHARVEST_NOTIFY_ENABLED", defaults.notify_enabled),
            recipients: env_opt("JOBHARVEST_NOTIFY_RECIPIENTS")
                .map(|v| parse_recipients(&v))
                .unwrap_or(defaults.recipients),
            notify_endpoint: env_opt("JOBHARVEST_NOTIFY_ENDPOINT"),
            notify_sender: env_opt("JOBHARVEST_NOTIFY_SENDER").unwrap_or(defaults.notify_sender),
            notify_token: env_opt("JOBHARVEST_NOTIFY_TOKEN"),
            listing_url_template: env_opt("JOBHARVEST_LISTING_URL")
                .unwrap_or(defaults.listing_url_template),
            detail_url_template: env_opt("JOBHARVEST_DETAIL_URL")
                .unwrap_or(defaults.detail_url_template),
            link_template: env_opt("JOBHARVEST_LINK_URL").unwrap_or(defaults.link_template),
            user_agent: env_opt("JOBHARVEST_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("JOBHARVEST_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            scheduler_enabled: env_flag("JOBHARVEST_SCHEDULER_ENABLED", defaults.scheduler_enabled),
            sync_cron: env_opt("JOBHARVEST_SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn notifier(&self) -> Result<Box<dyn Notifier>> {
        if !self.notify_enabled {
            return Ok(Box::new(NoopNotifier));
        }
        let Some(endpoint) = self.notify_endpoint.clone() else {
            bail!("JOBHARVEST_NOTIFY_ENABLED is set but JOBHARVEST_NOTIFY_ENDPOINT is missing");
        };
        let notifier = MailRelayNotifier::new(MailRelayOptions {
            endpoint,
            sender: self.notify_sender.clone(),
            recipients: self.recipients.clone(),
            api_token: self.notify_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
        })
        .context("building mail relay notifier")?;
        Ok(Box::new(notifier))
    }
}

/// Canonicalises discovered ids, dropping blanks and repeats (first occurrence kept).
pub fn dedupe_discovered(discovered: &[RawId]) -> Vec<CanonicalId> {
    let mut seen = HashSet::new();
    discovered
        .iter()
        .map(RawId::canonical)
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// New work for this run: discovered ids not already in `existing`, without duplicates.
pub fn reconcile(discovered: &[RawId], existing: &HashSet<CanonicalId>) -> Vec<CanonicalId> {
    dedupe_discovered(discovered)
        .into_iter()
        .filter(|id| !existing.contains(id))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub discovered: usize,
    pub unique: usize,
    pub existing: usize,
    pub new: usize,
}

impl ReconcileStats {
    pub fn filtered(&self) -> usize {
        self.unique - self.new
    }
}

pub fn reconcile_with_stats(
    discovered: &[RawId],
    existing: &HashSet<CanonicalId>,
) -> (Vec<CanonicalId>, ReconcileStats) {
    let unique = dedupe_discovered(discovered);
    let unique_len = unique.len();
    let new_ids: Vec<_> = unique
        .into_iter()
        .filter(|id| !existing.contains(id))
        .collect();
    let stats = ReconcileStats {
        discovered: discovered.len(),
        unique: unique_len,
        existing: existing.len(),
        new: new_ids.len(),
    };
    (new_ids, stats)
}

/// Ids already in the master dataset.
///
/// An absent or unreadable store yields an empty set so every discovered id is fetched again.
pub fn load_existing_ids(store: &dyn MasterStore) -> HashSet<CanonicalId> {
    if !store.exists() {
        warn!(path = %store.location().display(), "master dataset not found; treating all ids as new");
        return HashSet::new();
    }
    match store.load() {
        Ok(rows) => rows.iter().filter_map(MasterRow::canonical_id).collect(),
        Err(err) => {
            error!(error = %err, "could not read master dataset; treating all ids as new");
            HashSet::new()
        }
    }
}

/// Drops every row whose id appears again later; rows without an id are kept.
pub fn dedupe_last_wins(rows: Vec<MasterRow>) -> Vec<MasterRow> {
    let ids: Vec<Option<CanonicalId>> = rows.iter().map(MasterRow::canonical_id).collect();
    let mut last_index: HashMap<&CanonicalId, usize> = HashMap::new();
    for (index, id) in ids.iter().enumerate() {
        if let Some(id) = id {
            last_index.insert(id, index);
        }
    }
    let keep: Vec<bool> = ids
        .iter()
        .enumerate()
        .map(|(index, id)| match id {
            Some(id) => last_index.get(id) == Some(&index),
            None => true,
        })
        .collect();
    rows.into_iter()
        .zip(keep)
        .filter_map(|(row, keep)| keep.then_some(row))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeReport {
    /// No master existed; it now holds the incoming rows.
    Created { rows: usize },
    /// Incoming rows were appended; `replaced` existing rows lost to a newer row with the same id.
    Merged {
        total_rows: usize,
        added: usize,
        replaced: usize,
    },
}

impl MergeReport {
    pub fn total_rows(&self) -> usize {
        match self {
            MergeReport::Created { rows } => *rows,
            MergeReport::Merged { total_rows, .. } => *total_rows,
        }
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    /// The master was left untouched and the incoming rows were written to `backup_path`.
    #[error("merge into master failed ({cause}); new rows saved to {}", backup_path.display())]
    Degraded {
        backup_path: PathBuf,
        #[source]
        cause: StoreError,
    },
    #[error("merge into master failed ({cause}) and the backup write failed too")]
    BackupFailed {
        cause: StoreError,
        #[source]
        backup_error: StoreError,
    },
}

/// Appends `incoming` to the master dataset under the one-row-per-id rule (last write wins).
///
/// The master file is never partially written; on any read or write failure the incoming
/// rows go to a separate backup file instead.
pub fn merge(
    store: &dyn MasterStore,
    incoming: &[JobRecord],
    link_template: &str,
    now: DateTime<Local>,
) -> Result<MergeReport, MergeError> {
    let incoming_rows = dedupe_last_wins(
        incoming
            .iter()
            .map(|record| record.to_master_row(link_template))
            .collect(),
    );

    let attempt = if store.exists() {
        store.load().and_then(|existing| {
            let existing_ids: HashSet<CanonicalId> =
                existing.iter().filter_map(MasterRow::canonical_id).collect();
            let replaced = incoming_rows
                .iter()
                .filter_map(MasterRow::canonical_id)
                .filter(|id| existing_ids.contains(id))
                .count();

            let mut combined = existing;
            combined.extend(incoming_rows.iter().cloned());
            let combined = dedupe_last_wins(combined);
            store.save(&combined)?;
            Ok(MergeReport::Merged {
                total_rows: combined.len(),
                added: incoming_rows.len() - replaced,
                replaced,
            })
        })
    } else {
        store
            .save(&incoming_rows)
            .map(|()| MergeReport::Created {
                rows: incoming_rows.len(),
            })
    };

    attempt.or_else(|cause| match store.write_backup(&incoming_rows, now) {
        Ok(backup_path) => Err(MergeError::Degraded { backup_path, cause }),
        Err(backup_error) => Err(MergeError::BackupFailed {
            cause,
            backup_error,
        }),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    NoNewJobs,
    Completed { report: MergeReport },
    MergeDegraded { backup_path: PathBuf, cause: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_attempted: u32,
    pub pages_failed: u32,
    pub ids: ReconcileStats,
    pub records_fetched: usize,
    pub records_unavailable: usize,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, Copy, Default)]
struct RunCounters {
    pages_failed: u32,
    records_unavailable: usize,
}

/// Runs discovery, reconciliation, detail fetch, merge and notification strictly in sequence.
pub struct SyncPipeline {
    config: SyncConfig,
    listing: Box<dyn ListingSource>,
    detail: Box<dyn DetailSource>,
    store: Box<dyn MasterStore>,
    notifier: Box<dyn Notifier>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        listing: Box<dyn ListingSource>,
        detail: Box<dyn DetailSource>,
        store: Box<dyn MasterStore>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            listing,
            detail,
            store,
            notifier,
        }
    }

    /// Pipeline against the live job board.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let listing = BoardListingSource::new(http.clone(), config.listing_url_template.clone());
        let detail = BoardDetailSource::new(http, config.detail_url_template.clone());
        let store = CsvMasterStore::new(config.storage_path.clone());
        let notifier = config.notifier()?;
        Ok(Self::new(
            config,
            Box::new(listing),
            Box::new(detail),
            Box::new(store),
            notifier,
        ))
    }

    /// Pipeline reading listing pages and detail payloads captured under `fixtures_dir`.
    pub fn from_fixtures(config: SyncConfig, fixtures_dir: impl Into<PathBuf>) -> Result<Self> {
        let fixtures_dir = fixtures_dir.into();
        let store = CsvMasterStore::new(config.storage_path.clone());
        let notifier = config.notifier()?;
        Ok(Self::new(
            config,
            Box::new(FixtureListingSource::new(fixtures_dir.clone())),
            Box::new(FixtureDetailSource::new(fixtures_dir)),
            Box::new(store),
            notifier,
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    /// Runs once; an error is logged, reported as a crash notification, and returned.
    pub async fn run_reporting_crash(&self) -> Result<RunSummary> {
        match self.run_once().await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                error!(error = %format!("{err:#}"), "sync run crashed");
                self.notifier
                    .notify(
                        SUBJECT_CRASHED,
                        &format!("Sync run crashed with error:\n\n{err:#}"),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let mut counters = RunCounters::default();
        info!(store = %self.store.location().display(), "sync started");

        let discovered = self.discover(&mut counters).await;
        let existing = load_existing_ids(self.store.as_ref());
        let (new_ids, ids) = reconcile_with_stats(&discovered, &existing);
        info!(
            discovered = ids.discovered,
            unique = ids.unique,
            existing = ids.existing,
            new = ids.new,
            "reconciled ids against master"
        );
        if ids.existing > 0 && ids.unique > 0 && ids.filtered() == 0 {
            warn!("no discovered id matched the master dataset; possible id mismatch");
        }

        let summary = |counters: RunCounters, fetched: usize, outcome: RunOutcome| RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages_attempted: self.config.page_count,
            pages_failed: counters.pages_failed,
            ids,
            records_fetched: fetched,
            records_unavailable: counters.records_unavailable,
            outcome,
        };

        if new_ids.is_empty() {
            info!("no new jobs found");
            self.notifier
                .notify(
                    SUBJECT_NO_NEW_JOBS,
                    &format!(
                        "No new jobs found. {} ids discovered, all already in the master dataset.",
                        ids.unique
                    ),
                )
                .await;
            return Ok(summary(counters, 0, RunOutcome::NoNewJobs));
        }

        let records = self.fetch_details(&new_ids, &mut counters).await;
        if records.is_empty() {
            warn!(
                unavailable = counters.records_unavailable,
                "no job details could be fetched"
            );
            self.notifier
                .notify(
                    SUBJECT_NO_NEW_JOBS,
                    &format!(
                        "No new jobs stored. {} new ids found but none had details available.",
                        new_ids.len()
                    ),
                )
                .await;
            return Ok(summary(counters, 0, RunOutcome::NoNewJobs));
        }

        let fetched = records.len();
        let outcome = match merge(
            self.store.as_ref(),
            &records,
            &self.config.link_template,
            Local::now(),
        ) {
            Ok(report) => {
                info!(new = fetched, total = report.total_rows(), "merged into master");
                self.notifier
                    .notify(
                        SUBJECT_COMPLETED,
                        &format!(
                            "Sync completed.\n\nNew jobs scraped: {}\nTotal master jobs: {}",
                            fetched,
                            report.total_rows()
                        ),
                    )
                    .await;
                RunOutcome::Completed { report }
            }
            Err(MergeError::Degraded { backup_path, cause }) => {
                error!(error = %cause, backup = %backup_path.display(), "merge failed; new rows saved to backup");
                self.notifier
                    .notify(
                        SUBJECT_MERGE_FAILED,
                        &format!(
                            "Merge failed: {cause}\n\nBackup saved at:\n{}",
                            backup_path.display()
                        ),
                    )
                    .await;
                RunOutcome::MergeDegraded {
                    backup_path,
                    cause: cause.to_string(),
                }
            }
            Err(err @ MergeError::BackupFailed { .. }) => {
                return Err(err).context("persisting new job records");
            }
        };

        info!("sync finished");
        Ok(summary(counters, fetched, outcome))
    }

    async fn discover(&self, counters: &mut RunCounters) -> Vec<RawId> {
        let mut discovered = Vec::new();
        info!(pages = self.config.page_count, "collecting job ids");
        for page in 1..=self.config.page_count {
            match self.listing.fetch_page(page, self.config.page_size).await {
                Ok(ids) => {
                    let found = ids.len();
                    discovered.extend(ids);
                    info!(page, found, total = discovered.len(), "listing page collected");
                }
                Err(err) => {
                    counters.pages_failed += 1;
                    warn!(page, error = %err, "skipping listing page");
                }
            }
        }
        discovered
    }

    async fn fetch_details(
        &self,
        new_ids: &[CanonicalId],
        counters: &mut RunCounters,
    ) -> Vec<JobRecord> {
        let mut records = Vec::new();
        for (index, id) in new_ids.iter().enumerate() {
            if index > 0 && !self.config.request_delay.is_zero() {
                tokio::time::sleep(self.config.request_delay).await;
            }
            let result = self
                .detail
                .fetch_detail(id)
                .instrument(info_span!("fetch_detail", %id))
                .await;
            match result {
                Ok(record) => {
                    info!(
                        progress = %format!("{}/{}", index + 1, new_ids.len()),
                        title = record.title.as_deref().unwrap_or("untitled"),
                        "fetched job"
                    );
                    records.push(record);
                }
                Err(reason) => {
                    counters.records_unavailable += 1;
                    warn!(%id, %reason, "job details unavailable; skipping");
                }
            }
        }
        records
    }
}

/// Schedules `pipeline` to run on `cron`, one run per tick.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            if let Err(err) = pipeline.run_reporting_crash().await {
                warn!(error = %format!("{err:#}"), "scheduled sync run failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[derive(Debug, Clone, Serialize)]
pub struct MasterStatus {
    pub path: PathBuf,
    pub exists: bool,
    pub rows: Option<usize>,
    pub unique_ids: Option<usize>,
    pub error: Option<String>,
}

pub fn master_status(store: &dyn MasterStore) -> MasterStatus {
    let path = store.location().to_path_buf();
    if !store.exists() {
        return MasterStatus {
            path,
            exists: false,
            rows: None,
            unique_ids: None,
            error: None,
        };
    }
    match store.load() {
        Ok(rows) => {
            let unique: HashSet<_> = rows.iter().filter_map(MasterRow::canonical_id).collect();
            MasterStatus {
                path,
                exists: true,
                rows: Some(rows.len()),
                unique_ids: Some(unique.len()),
                error: None,
            }
        }
        Err(err) => MasterStatus {
            path,
            exists: true,
            rows: None,
            unique_ids: None,
            error: Some(err.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use jobharvest_adapters::{ListingError, Unavailable};
    use jobharvest_notify::MemoryNotifier;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn ids(values: &[&str]) -> HashSet<CanonicalId> {
        values.iter().map(|v| CanonicalId::from_text(v)).collect()
    }

    fn record(id: &str, title: &str) -> JobRecord {
        let mut record = JobRecord::new(CanonicalId::from_text(id));
        record.title = Some(title.to_string());
        record.skills_required = vec!["Python".to_string(), "SQL".to_string()];
        record
    }

    fn fixed_time() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 3, 1, 9, 15, 0)
            .single()
            .expect("ts")
    }

    fn titles(rows: &[MasterRow]) -> Vec<(String, String)> {
        rows.iter()
            .map(|r| {
                (
                    r.job_id.clone().unwrap_or_default(),
                    r.job_title.clone().unwrap_or_default(),
                )
            })
            .collect()
    }

    fn backups_in(dir: &Path) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = fs::read_dir(dir)
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(jobharvest_storage::BACKUP_PREFIX))
            })
            .collect();
        found.sort();
        found
    }

    #[test]
    fn reconcile_excludes_existing_and_duplicates() {
        let discovered = vec![
            RawId::Integer(1),
            RawId::Text("2".into()),
            RawId::Integer(2),
            RawId::Float(3.0),
            RawId::Text(" 4 ".into()),
            RawId::Integer(1),
        ];
        let existing = ids(&["2", "4"]);

        let new_ids = reconcile(&discovered, &existing);
        let mut sorted: Vec<&str> = new_ids.iter().map(CanonicalId::as_str).collect();
        sorted.sort();
        assert_eq!(sorted, vec!["1", "3"]);
        assert!(new_ids.iter().all(|id| !existing.contains(id)));
        let unique: HashSet<_> = new_ids.iter().collect();
        assert_eq!(unique.len(), new_ids.len());
    }

    #[test]
    fn reconcile_with_empty_existing_is_deduplicated_discovery() {
        let discovered = vec![
            RawId::Integer(7),
            RawId::Text("7".into()),
            RawId::Text("".into()),
            RawId::Integer(8),
        ];
        let new_ids = reconcile(&discovered, &HashSet::new());
        assert_eq!(new_ids, dedupe_discovered(&discovered));
        assert_eq!(new_ids.len(), 2);
    }

    #[test]
    fn reconcile_stats_count_each_stage() {
        let discovered = vec![RawId::Integer(1), RawId::Integer(1), RawId::Integer(2)];
        let (new_ids, stats) = reconcile_with_stats(&discovered, &ids(&["1"]));
        assert_eq!(new_ids, vec![CanonicalId::from_text("2")]);
        assert_eq!(
            stats,
            ReconcileStats {
                discovered: 3,
                unique: 2,
                existing: 1,
                new: 1
            }
        );
        assert_eq!(stats.filtered(), 1);
    }

    #[test]
    fn existing_ids_degrade_to_empty_when_store_is_absent_or_unreadable() {
        let dir = tempdir().expect("tempdir");
        let store = CsvMasterStore::new(dir.path().join("master.csv"));
        assert!(load_existing_ids(&store).is_empty());

        fs::write(store.path(), "Title\nno id column here\n").expect("write");
        assert!(load_existing_ids(&store).is_empty());

        fs::write(store.path(), "Job ID,Job Title\n101,A\n 102 ,B\n,C\n").expect("write");
        assert_eq!(load_existing_ids(&store), ids(&["101", "102"]));
    }

    #[test]
    fn last_write_wins_keeps_position_of_last_occurrence() {
        let row = |id: Option<&str>, title: &str| MasterRow {
            job_id: id.map(ToString::to_string),
            job_title: Some(title.to_string()),
            ..Default::default()
        };
        let deduped = dedupe_last_wins(vec![
            row(Some("1"), "A"),
            row(Some("2"), "B"),
            row(None, "orphan"),
            row(Some(" 1"), "C"),
        ]);
        assert_eq!(
            titles(&deduped),
            vec![
                ("2".to_string(), "B".to_string()),
                (String::new(), "orphan".to_string()),
                (" 1".to_string(), "C".to_string()),
            ]
        );
    }

    #[test]
    fn merge_into_absent_store_writes_exactly_incoming() {
        let dir = tempdir().expect("tempdir");
        let store = CsvMasterStore::new(dir.path().join("master.csv"));

        let report = merge(
            &store,
            &[record("1", "Analyst"), record("2", "Engineer")],
            DEFAULT_LINK_TEMPLATE,
            fixed_time(),
        )
        .expect("merge");

        assert_eq!(report, MergeReport::Created { rows: 2 });
        let rows = store.load().expect("load");
        assert_eq!(
            titles(&rows),
            vec![
                ("1".to_string(), "Analyst".to_string()),
                ("2".to_string(), "Engineer".to_string()),
            ]
        );
        assert_eq!(rows[0].skills_required.as_deref(), Some("Python; SQL"));
        assert_eq!(
            rows[1].job_link.as_deref(),
            Some("https://jobs.bdjobs.com/jobdetails.asp?id=2")
        );
    }

    #[test]
    fn merge_replaces_existing_row_with_same_id() {
        let dir = tempdir().expect("tempdir");
        let store = CsvMasterStore::new(dir.path().join("master.csv"));
        merge(&store, &[record("1", "A"), record("5", "Kept")], DEFAULT_LINK_TEMPLATE, fixed_time())
            .expect("seed");

        let report = merge(&store, &[record("1", "B")], DEFAULT_LINK_TEMPLATE, fixed_time())
            .expect("merge");

        assert_eq!(
            report,
            MergeReport::Merged {
                total_rows: 2,
                added: 0,
                replaced: 1
            }
        );
        let rows = store.load().expect("load");
        assert_eq!(
            titles(&rows),
            vec![
                ("5".to_string(), "Kept".to_string()),
                ("1".to_string(), "B".to_string()),
            ]
        );
    }

    #[test]
    fn merge_keeps_columns_it_does_not_manage() {
        let dir = tempdir().expect("tempdir");
        let master_path = dir.path().join("master.csv");
        fs::write(&master_path, "Job ID,Job Title,Notes\n1,A,keep me\n").expect("write");
        let store = CsvMasterStore::new(&master_path);

        let report = merge(&store, &[record("2", "B")], DEFAULT_LINK_TEMPLATE, fixed_time())
            .expect("merge");

        assert_eq!(report.total_rows(), 2);
        let rows = store.load().expect("load");
        assert_eq!(rows[0].extra_value("Notes"), Some("keep me"));
        assert_eq!(rows[1].extra_value("Notes"), Some(""));
        assert!(fs::read_to_string(&master_path)
            .expect("read")
            .contains("keep me"));
    }

    #[test]
    fn decimal_ids_in_master_match_integer_discoveries() {
        let dir = tempdir().expect("tempdir");
        let store = CsvMasterStore::new(dir.path().join("master.csv"));
        fs::write(store.path(), "Job ID,Job Title\n1001.0,A\n").expect("write");

        let existing = load_existing_ids(&store);
        assert!(reconcile(&[RawId::Integer(1001), RawId::Float(1001.0)], &existing).is_empty());

        let report = merge(&store, &[record("1001", "A2")], DEFAULT_LINK_TEMPLATE, fixed_time())
            .expect("merge");
        assert_eq!(
            report,
            MergeReport::Merged {
                total_rows: 1,
                added: 0,
                replaced: 1
            }
        );
        let rows = store.load().expect("load");
        assert_eq!(titles(&rows), vec![("1001".to_string(), "A2".to_string())]);
    }

    #[test]
    fn unreadable_master_is_left_untouched_and_incoming_backed_up() {
        let dir = tempdir().expect("tempdir");
        let master_path = dir.path().join("master.csv");
        let original = "Title,Company\nLegacy export,Acme\n";
        fs::write(&master_path, original).expect("write");
        let store = CsvMasterStore::new(&master_path);

        let err = merge(
            &store,
            &[record("1", "Analyst"), record("2", "Engineer")],
            DEFAULT_LINK_TEMPLATE,
            fixed_time(),
        )
        .unwrap_err();

        let MergeError::Degraded { backup_path, cause } = err else {
            panic!("expected degraded merge, got {err:?}");
        };
        assert!(matches!(cause, StoreError::MissingIdColumn { .. }));
        assert_eq!(fs::read_to_string(&master_path).expect("read"), original);
        assert_eq!(backups_in(dir.path()), vec![backup_path.clone()]);

        let backed_up = CsvMasterStore::new(&backup_path).load().expect("load backup");
        assert_eq!(
            titles(&backed_up),
            vec![
                ("1".to_string(), "Analyst".to_string()),
                ("2".to_string(), "Engineer".to_string()),
            ]
        );
    }

    /// Store whose every write fails, optionally including backups.
    struct BrokenStore {
        location: PathBuf,
        backup_fails: bool,
    }

    fn io_failure(path: &Path) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only volume"),
        }
    }

    impl MasterStore for BrokenStore {
        fn location(&self) -> &Path {
            &self.location
        }

        fn exists(&self) -> bool {
            true
        }

        fn load(&self) -> Result<Vec<MasterRow>, StoreError> {
            Ok(vec![record("1", "A").to_master_row(DEFAULT_LINK_TEMPLATE)])
        }

        fn save(&self, _rows: &[MasterRow]) -> Result<(), StoreError> {
            Err(io_failure(&self.location))
        }

        fn write_backup(
            &self,
            _rows: &[MasterRow],
            _at: DateTime<Local>,
        ) -> Result<PathBuf, StoreError> {
            if self.backup_fails {
                Err(io_failure(&self.location))
            } else {
                Ok(self.location.with_file_name("backup_new_jobs_test.csv"))
            }
        }
    }

    #[test]
    fn write_failure_takes_backup_path() {
        let store = BrokenStore {
            location: PathBuf::from("/mnt/ro/master.csv"),
            backup_fails: false,
        };
        let err = merge(&store, &[record("2", "B")], DEFAULT_LINK_TEMPLATE, fixed_time())
            .unwrap_err();
        assert!(matches!(err, MergeError::Degraded { .. }));

        let store = BrokenStore {
            location: PathBuf::from("/mnt/ro/master.csv"),
            backup_fails: true,
        };
        let err = merge(&store, &[record("2", "B")], DEFAULT_LINK_TEMPLATE, fixed_time())
            .unwrap_err();
        assert!(matches!(err, MergeError::BackupFailed { .. }));
    }

    struct StaticListing {
        pages: HashMap<u32, Vec<RawId>>,
    }

    #[async_trait]
    impl ListingSource for StaticListing {
        async fn fetch_page(&self, page: u32, _page_size: u32) -> Result<Vec<RawId>, ListingError> {
            self.pages
                .get(&page)
                .cloned()
                .ok_or(ListingError::MissingIdList)
        }
    }

    struct StaticDetails {
        records: HashMap<String, JobRecord>,
    }

    #[async_trait]
    impl DetailSource for StaticDetails {
        async fn fetch_detail(&self, id: &CanonicalId) -> Result<JobRecord, Unavailable> {
            self.records
                .get(id.as_str())
                .cloned()
                .ok_or_else(|| Unavailable::ApiStatus("1".to_string()))
        }
    }

    fn test_config(storage_path: PathBuf) -> SyncConfig {
        SyncConfig {
            page_count: 3,
            request_delay: Duration::ZERO,
            storage_path,
            ..SyncConfig::default()
        }
    }

    fn pipeline(
        config: SyncConfig,
        store: Box<dyn MasterStore>,
        notifier: Arc<MemoryNotifier>,
    ) -> SyncPipeline {
        let listing = StaticListing {
            pages: HashMap::from([
                (1, vec![RawId::Integer(1), RawId::Integer(2), RawId::Integer(2)]),
                (3, vec![RawId::Text("2".into()), RawId::Text("3".into())]),
            ]),
        };
        let details = StaticDetails {
            records: HashMap::from([
                ("1".to_string(), record("1", "Analyst")),
                ("2".to_string(), record("2", "Engineer")),
            ]),
        };
        SyncPipeline::new(
            config,
            Box::new(listing),
            Box::new(details),
            store,
            Box::new(notifier),
        )
    }

    #[tokio::test]
    async fn first_run_creates_master_and_skips_failed_pages_and_records() {
        let dir = tempdir().expect("tempdir");
        let master_path = dir.path().join("master.csv");
        let notifier = Arc::new(MemoryNotifier::new());
        let pipeline = pipeline(
            test_config(master_path.clone()),
            Box::new(CsvMasterStore::new(&master_path)),
            notifier.clone(),
        );

        let summary = pipeline.run_reporting_crash().await.expect("run");

        assert_eq!(summary.pages_failed, 1);
        assert_eq!(summary.ids.unique, 3);
        assert_eq!(summary.ids.new, 3);
        assert_eq!(summary.records_fetched, 2);
        assert_eq!(summary.records_unavailable, 1);
        assert_eq!(
            summary.outcome,
            RunOutcome::Completed {
                report: MergeReport::Created { rows: 2 }
            }
        );
        assert_eq!(CsvMasterStore::new(&master_path).load().expect("load").len(), 2);

        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, SUBJECT_COMPLETED);
        assert!(messages[0].body.contains("New jobs scraped: 2"));
        assert!(messages[0].body.contains("Total master jobs: 2"));
    }

    #[tokio::test]
    async fn second_run_with_only_unavailable_new_ids_reports_no_new_jobs() {
        let dir = tempdir().expect("tempdir");
        let master_path = dir.path().join("master.csv");
        let notifier = Arc::new(MemoryNotifier::new());
        let pipeline = pipeline(
            test_config(master_path.clone()),
            Box::new(CsvMasterStore::new(&master_path)),
            notifier.clone(),
        );

        pipeline.run_once().await.expect("first run");
        let before = fs::read(&master_path).expect("read");
        let summary = pipeline.run_once().await.expect("second run");

        assert_eq!(summary.ids.existing, 2);
        assert_eq!(summary.ids.new, 1);
        assert_eq!(summary.records_fetched, 0);
        assert_eq!(summary.outcome, RunOutcome::NoNewJobs);
        assert_eq!(fs::read(&master_path).expect("read"), before);
        assert_eq!(
            notifier.messages().last().map(|m| m.subject.as_str()),
            Some(SUBJECT_NO_NEW_JOBS)
        );
    }

    #[tokio::test]
    async fn unreadable_master_refetches_everything_and_backs_up() {
        let dir = tempdir().expect("tempdir");
        let master_path = dir.path().join("master.csv");
        let original = "Title\ncorrupted export\n";
        fs::write(&master_path, original).expect("write");
        let notifier = Arc::new(MemoryNotifier::new());
        let pipeline = pipeline(
            test_config(master_path.clone()),
            Box::new(CsvMasterStore::new(&master_path)),
            notifier.clone(),
        );

        let summary = pipeline.run_once().await.expect("run");

        assert_eq!(summary.ids.existing, 0);
        assert_eq!(summary.ids.new, 3);
        let RunOutcome::MergeDegraded { backup_path, .. } = &summary.outcome else {
            panic!("expected degraded outcome, got {:?}", summary.outcome);
        };
        assert_eq!(fs::read_to_string(&master_path).expect("read"), original);
        assert_eq!(
            CsvMasterStore::new(backup_path).load().expect("backup").len(),
            2
        );

        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, SUBJECT_MERGE_FAILED);
        assert!(messages[0].body.contains(&backup_path.display().to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn request_delay_separates_consecutive_detail_fetches() {
        let dir = tempdir().expect("tempdir");
        let master_path = dir.path().join("master.csv");
        let config = SyncConfig {
            request_delay: Duration::from_millis(300),
            ..test_config(master_path.clone())
        };
        let pipeline = pipeline(
            config,
            Box::new(CsvMasterStore::new(&master_path)),
            Arc::new(MemoryNotifier::new()),
        );

        let started = tokio::time::Instant::now();
        let summary = pipeline.run_once().await.expect("run");
        let elapsed = started.elapsed();

        // Three detail requests: two gaps, none before the first.
        assert_eq!(summary.records_fetched + summary.records_unavailable, 3);
        assert!(elapsed >= Duration::from_millis(600), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(900), "{elapsed:?}");
    }

    #[tokio::test]
    async fn failed_backup_is_reported_as_crash() {
        let notifier = Arc::new(MemoryNotifier::new());
        let store = BrokenStore {
            location: PathBuf::from("/mnt/ro/master.csv"),
            backup_fails: true,
        };
        let pipeline = pipeline(
            test_config(PathBuf::from("/mnt/ro/master.csv")),
            Box::new(store),
            notifier.clone(),
        );

        let err = pipeline.run_reporting_crash().await.unwrap_err();
        assert!(format!("{err:#}").contains("backup write failed"));

        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, SUBJECT_CRASHED);
    }

    #[test]
    fn master_status_reports_rows_and_read_errors() {
        let dir = tempdir().expect("tempdir");
        let store = CsvMasterStore::new(dir.path().join("master.csv"));
        let status = master_status(&store);
        assert!(!status.exists);
        assert_eq!(status.rows, None);

        fs::write(store.path(), "Job ID\n1\n1\n2\n").expect("write");
        let status = master_status(&store);
        assert_eq!(status.rows, Some(3));
        assert_eq!(status.unique_ids, Some(2));

        fs::write(store.path(), "Nope\n1\n").expect("write");
        assert!(master_status(&store).error.is_some());
    }

    #[test]
    fn recipients_are_split_on_commas() {
        assert_eq!(
            parse_recipients(" a@example.test, ,b@example.test "),
            vec!["a@example.test".to_string(), "b@example.test".to_string()]
        );
    }

    #[test]
    fn enabled_notifications_require_an_endpoint() {
        let config = SyncConfig {
            notify_enabled: true,
            ..SyncConfig::default()
        };
        assert!(config.notifier().is_err());
        assert!(SyncConfig::default().notifier().is_ok());
    }
}
