//! Client-side delivery: bounded concurrency, per-fragment retry, drain.

mod transport;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{watch, OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::UploaderSection;
use crate::fragment::{Fragment, FragmentSink, SinkClosed};
use crate::retry::RetryPolicy;

pub use transport::{FragmentTransport, HttpIngestClient, UploadError, UploadResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl FragmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FragmentStatus::Uploaded | FragmentStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FragmentRecord {
    pub index: u64,
    pub size: u64,
    pub status: FragmentStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Snapshot published after every ledger change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub current_index: Option<u64>,
    pub bytes_transferred: u64,
    pub total_fragments: u64,
    pub uploaded: u64,
    pub failed_fragments: u64,
    pub in_flight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub total: u64,
    pub uploaded: u64,
    pub failed_indices: Vec<u64>,
    pub bytes_transferred: u64,
}

impl DrainReport {
    pub fn failed(&self) -> u64 {
        self.failed_indices.len() as u64
    }
}

#[derive(Debug, Clone)]
pub struct UploaderSettings {
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
}

impl From<&UploaderSection> for UploaderSettings {
    fn from(section: &UploaderSection) -> Self {
        Self {
            max_concurrent: section.max_concurrent.max(1),
            retry: RetryPolicy::from(&section.retry),
        }
    }
}

#[derive(Default)]
struct Ledger {
    records: BTreeMap<u64, FragmentRecord>,
    current_index: Option<u64>,
    bytes_transferred: u64,
}

impl Ledger {
    fn progress(&self) -> UploadProgress {
        let mut progress = UploadProgress {
            current_index: self.current_index,
            bytes_transferred: self.bytes_transferred,
            total_fragments: self.records.len() as u64,
            ..UploadProgress::default()
        };
        for record in self.records.values() {
            match record.status {
                FragmentStatus::Uploaded => progress.uploaded += 1,
                FragmentStatus::Failed => progress.failed_fragments += 1,
                FragmentStatus::Uploading => progress.in_flight += 1,
                FragmentStatus::Pending => {}
            }
        }
        progress
    }
}

#[derive(Default)]
struct Tasks {
    sealed: bool,
    set: JoinSet<()>,
}

struct Inner {
    transport: Arc<dyn FragmentTransport>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    ledger: Mutex<Ledger>,
    progress: watch::Sender<UploadProgress>,
}

impl Inner {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update<F>(&self, index: u64, change: F)
    where
        F: FnOnce(&mut Ledger, &mut FragmentRecord),
    {
        let mut ledger = self.ledger();
        let Some(mut record) = ledger.records.remove(&index) else {
            return;
        };
        change(&mut ledger, &mut record);
        ledger.records.insert(index, record);
        self.progress.send_replace(ledger.progress());
    }

    async fn deliver(self: Arc<Self>, fragment: Fragment) {
        let index = fragment.index;
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                self.update(index, |_, record| {
                    record.status = FragmentStatus::Failed;
                    record.last_error = Some(err.to_string());
                });
                return;
            }
        };
        self.update(index, |ledger, record| {
            record.status = FragmentStatus::Uploading;
            ledger.current_index = Some(index);
        });

        let inner = &self;
        let fragment = &fragment;
        let outcome = self
            .retry
            .run_if(
                "fragment_upload",
                move |attempt| {
                    inner.update(index, |_, record| record.attempts = attempt);
                    inner.transport.deliver(fragment)
                },
                UploadError::is_retryable,
            )
            .await;
        drop(permit);

        match outcome {
            Ok(delivered) => {
                let bytes = delivered.result.bytes;
                self.update(index, |ledger, record| {
                    record.status = FragmentStatus::Uploaded;
                    record.last_error = None;
                    ledger.bytes_transferred += bytes;
                });
            }
            Err(exhausted) => {
                warn!(
                    session_id = %fragment.session_id,
                    index,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "fragment permanently failed"
                );
                self.update(index, |_, record| {
                    record.status = FragmentStatus::Failed;
                    record.last_error = Some(exhausted.last_error.to_string());
                });
            }
        }
    }
}

/// Queues fragments and delivers them in the background. Cloning shares the
/// same queue.
#[derive(Clone)]
pub struct Uploader {
    inner: Arc<Inner>,
    tasks: Arc<Mutex<Tasks>>,
    drained: Arc<OnceCell<DrainReport>>,
}

impl Uploader {
    pub fn new(transport: Arc<dyn FragmentTransport>, settings: UploaderSettings) -> Self {
        let (progress, _) = watch::channel(UploadProgress::default());
        Self {
            inner: Arc::new(Inner {
                transport,
                retry: settings.retry,
                permits: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
                ledger: Mutex::new(Ledger::default()),
                progress,
            }),
            tasks: Arc::new(Mutex::new(Tasks::default())),
            drained: Arc::new(OnceCell::new()),
        }
    }

    /// Accepts a fragment for delivery without waiting for the network.
    pub fn enqueue(&self, fragment: Fragment) -> UploadResult<()> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if tasks.sealed {
            return Err(UploadError::Sealed);
        }
        {
            let mut ledger = self.inner.ledger();
            if ledger.records.contains_key(&fragment.index) {
                return Err(UploadError::Duplicate {
                    session_id: fragment.session_id.clone(),
                    index: fragment.index,
                });
            }
            ledger.records.insert(
                fragment.index,
                FragmentRecord {
                    index: fragment.index,
                    size: fragment.len() as u64,
                    status: FragmentStatus::Pending,
                    attempts: 0,
                    last_error: None,
                },
            );
            self.inner.progress.send_replace(ledger.progress());
        }
        tasks.set.spawn(Arc::clone(&self.inner).deliver(fragment));
        Ok(())
    }

    pub fn progress(&self) -> UploadProgress {
        self.inner.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadProgress> {
        self.inner.progress.subscribe()
    }

    pub fn records(&self) -> Vec<FragmentRecord> {
        self.inner.ledger().records.values().cloned().collect()
    }

    /// Seals the queue and resolves once every fragment is uploaded or
    /// permanently failed. Repeated calls return the same report.
    pub async fn drain(&self) -> DrainReport {
        self.drained
            .get_or_init(|| async {
                let mut pending = {
                    let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    tasks.sealed = true;
                    std::mem::take(&mut tasks.set)
                };
                while let Some(joined) = pending.join_next().await {
                    if let Err(err) = joined {
                        warn!(error = %err, "upload task aborted");
                    }
                }
                let report = self.report();
                info!(
                    total = report.total,
                    uploaded = report.uploaded,
                    failed = report.failed(),
                    bytes = report.bytes_transferred,
                    "uploader drained"
                );
                report
            })
            .await
            .clone()
    }

    fn report(&self) -> DrainReport {
        let mut ledger = self.inner.ledger();
        let mut report = DrainReport {
            total: ledger.records.len() as u64,
            uploaded: 0,
            failed_indices: Vec::new(),
            bytes_transferred: ledger.bytes_transferred,
        };
        for record in ledger.records.values_mut() {
            if record.status == FragmentStatus::Uploaded {
                report.uploaded += 1;
            } else {
                if !record.status.is_terminal() {
                    record.status = FragmentStatus::Failed;
                    record.last_error.get_or_insert_with(|| "upload task aborted".into());
                }
                report.failed_indices.push(record.index);
            }
        }
        self.inner.progress.send_replace(ledger.progress());
        report
    }
}

impl FragmentSink for Uploader {
    fn submit(&self, fragment: Fragment) -> Result<(), SinkClosed> {
        let (session_id, index) = (fragment.session_id.clone(), fragment.index);
        self.enqueue(fragment).map_err(|err| {
            warn!(session_id = %session_id, index, error = %err, "fragment not queued");
            SinkClosed { session_id, index }
        })
    }
}
