//! Batch classification of ingested files against one provider.
//!
//! Each file moves `Pending -> InProgress -> {Succeeded, FailedRetryable, FailedTerminal}`;
//! a retryable failure loops back to `InProgress` after a backoff. A success only
//! counts once the record has been indexed.

use crate::classifier::classify_file;
use crate::config::{IngestConfig, JobConfig};
use crate::indexer::{IndexError, Indexer};
use crate::models::{ClassificationRecord, RecordKey, SourceFile};
use crate::scanner;
use providers::{ClassificationProvider, ProviderError, TargetSchema};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    InProgress,
    FailedRetryable,
    Succeeded,
    FailedTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Auth,
    RateLimited,
    Timeout,
    MalformedOutput,
    Transport,
    Rejected,
    UnknownProvider,
    Embedding,
    Store,
    Panicked,
}

impl From<&ProviderError> for FailureKind {
    fn from(e: &ProviderError) -> Self {
        match e {
            ProviderError::AuthFailure(_) => FailureKind::Auth,
            ProviderError::RateLimited { .. } => FailureKind::RateLimited,
            ProviderError::Timeout => FailureKind::Timeout,
            ProviderError::MalformedOutput(_) => FailureKind::MalformedOutput,
            ProviderError::TransportFailure(_) => FailureKind::Transport,
            ProviderError::Rejected(_) => FailureKind::Rejected,
            ProviderError::UnknownProvider(_) => FailureKind::UnknownProvider,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Succeeded(ClassificationRecord),
    FailedTerminal {
        kind: FailureKind,
        message: String,
    },
    /// A record for this fingerprint and provider already existed.
    Skipped,
    /// Never dispatched, or abandoned during a backoff, because the job was cancelled.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReport {
    pub path: String,
    pub fingerprint: String,
    pub attempts: u32,
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobReport {
    pub provider: String,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub pruned: usize,
    pub files: Vec<FileReport>,
}

impl JobReport {
    fn new(provider: &str, files: Vec<FileReport>) -> Self {
        let mut report = JobReport {
            provider: provider.to_string(),
            ..Default::default()
        };
        for f in &files {
            match f.outcome {
                FileOutcome::Succeeded(_) => report.succeeded += 1,
                FileOutcome::FailedTerminal { .. } => report.failed += 1,
                FileOutcome::Skipped => report.skipped += 1,
                FileOutcome::Cancelled => report.cancelled += 1,
            }
        }
        report.files = files;
        report
    }

    pub fn total(&self) -> usize {
        self.files.len()
    }
}

/// Delay before retry number `attempt` (1-based count of attempts already made).
/// A provider hint wins over the exponential schedule; both are capped at `max_ms`.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64, hint: Option<Duration>) -> Duration {
    let cap = Duration::from_millis(max_ms);
    if let Some(hint) = hint {
        return hint.min(cap);
    }
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(cap)
}

#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn ClassificationProvider>,
    indexer: Indexer,
    schema: Arc<TargetSchema>,
    config: JobConfig,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ClassificationProvider>,
        indexer: Indexer,
        schema: TargetSchema,
        config: JobConfig,
    ) -> Self {
        Self {
            provider,
            indexer,
            schema: Arc::new(schema),
            config,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Classifies and indexes `files`. Never fails as a whole; every file gets
    /// an outcome in the report, in input order.
    pub async fn run(&self, files: Vec<SourceFile>, cancel: CancellationToken) -> JobReport {
        let provider = self.provider.name().to_string();
        info!(provider = %provider, files = files.len(), "classification job started");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let live: Arc<HashSet<String>> =
            Arc::new(files.iter().map(|f| f.fingerprint.clone()).collect());
        let mut reports = Vec::with_capacity(files.len());

        for batch in files.chunks(self.config.batch_size.max(1)) {
            let mut slots: Vec<(String, String, Option<JoinHandle<FileReport>>)> =
                Vec::with_capacity(batch.len());
            for file in batch {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                };
                let handle = permit.map(|permit| {
                    let this = self.clone();
                    let file = file.clone();
                    let cancel = cancel.clone();
                    let live = live.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        this.process(file, &live, cancel).await
                    })
                });
                slots.push((file.relative_path.clone(), file.fingerprint.clone(), handle));
            }

            for (path, fingerprint, handle) in slots {
                let report = match handle {
                    None => FileReport {
                        path,
                        fingerprint,
                        attempts: 0,
                        outcome: FileOutcome::Cancelled,
                    },
                    Some(handle) => match handle.await {
                        Ok(report) => report,
                        Err(e) => {
                            warn!(path = %path, error = %e, "classification task aborted");
                            FileReport {
                                path,
                                fingerprint,
                                attempts: 0,
                                outcome: FileOutcome::FailedTerminal {
                                    kind: FailureKind::Panicked,
                                    message: e.to_string(),
                                },
                            }
                        }
                    },
                };
                reports.push(report);
            }
        }

        let report = JobReport::new(&provider, reports);
        info!(
            provider = %provider,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "classification job finished"
        );
        report
    }

    /// Ingests `ingest`, classifies everything found, then drops this provider's
    /// records for content that no longer exists. Pruning is skipped after a cancel.
    ///
    /// `ingest` must cover everything indexed for this provider; use
    /// [`Orchestrator::run_partial_pass`] for a subset of the tree.
    pub async fn run_full_pass(
        &self,
        ingest: &IngestConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<JobReport> {
        let files = scanner::ingest(ingest).await?;
        let live: HashSet<String> = files.iter().map(|f| f.fingerprint.clone()).collect();
        let mut report = self.run(files, cancel.clone()).await;
        if cancel.is_cancelled() {
            info!("job cancelled, skipping prune");
            return Ok(report);
        }
        report.pruned = self.indexer.prune(self.provider.name(), &live).await?;
        Ok(report)
    }

    /// Like [`Orchestrator::run_full_pass`] over some of the roots: records
    /// outside them are left alone, so nothing is pruned.
    pub async fn run_partial_pass(
        &self,
        ingest: &IngestConfig,
        cancel: CancellationToken,
    ) -> anyhow::Result<JobReport> {
        let files = scanner::ingest(ingest).await?;
        Ok(self.run(files, cancel).await)
    }

    async fn process(
        &self,
        file: SourceFile,
        live: &HashSet<String>,
        cancel: CancellationToken,
    ) -> FileReport {
        let key = RecordKey::new(&file.fingerprint, self.provider.name());
        let report = |attempts: u32, outcome: FileOutcome| FileReport {
            path: file.relative_path.clone(),
            fingerprint: file.fingerprint.clone(),
            attempts,
            outcome,
        };
        debug!(key = %key, state = ?FileState::Pending, "file queued");

        if cancel.is_cancelled() {
            return report(0, FileOutcome::Cancelled);
        }
        match self.indexer.contains(&key).await {
            Ok(true) => {
                debug!(key = %key, "already classified, skipping");
                return report(0, FileOutcome::Skipped);
            }
            Ok(false) => {}
            Err(e) => {
                return report(
                    0,
                    FileOutcome::FailedTerminal {
                        kind: FailureKind::Store,
                        message: e.to_string(),
                    },
                )
            }
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(key = %key, attempt, state = ?FileState::InProgress, "calling provider");
            match classify_file(self.provider.as_ref(), &file, &self.schema).await {
                Ok(record) => {
                    debug!(key = %key, state = ?FileState::Succeeded, "classified, indexing");
                    return match self.indexer.index(&record).await {
                        Ok(()) => {
                            if let Err(e) = self.indexer.supersede(&record, live).await {
                                warn!(key = %key, error = %e, "could not drop superseded records");
                            }
                            report(attempt, FileOutcome::Succeeded(record))
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "indexing failed, record dropped");
                            let kind = match e {
                                IndexError::Embedding(_) => FailureKind::Embedding,
                                IndexError::Store(_) => FailureKind::Store,
                            };
                            report(
                                attempt,
                                FileOutcome::FailedTerminal {
                                    kind,
                                    message: e.to_string(),
                                },
                            )
                        }
                    };
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff_delay(
                        attempt,
                        self.config.backoff_base_ms,
                        self.config.backoff_max_ms,
                        e.retry_after(),
                    );
                    debug!(
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        state = ?FileState::FailedRetryable,
                        "retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return report(attempt, FileOutcome::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(
                        key = %key,
                        attempt,
                        error = %e,
                        state = ?FileState::FailedTerminal,
                        "classification failed"
                    );
                    return report(
                        attempt,
                        FileOutcome::FailedTerminal {
                            kind: FailureKind::from(&e),
                            message: e.to_string(),
                        },
                    );
                }
            }
        }
    }
}
