//! Outcome recording.
//!
//! Closed runs are handed to an [`OutcomeSink`]. The production sink is a
//! [`BoundedRecorder`]: enqueue never blocks and never fails. When the
//! buffer is full the oldest unrecorded run is dropped and counted. A
//! background drain task moves buffered runs into a [`RecordStore`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use quillgate_core::ClosedRun;

/// Errors from the record store. Fatal to the drain task.
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Record storage failed: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Failed to serialize run record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Anything that accepts closed runs.
///
/// Implementations must return promptly and must not fail.
pub trait OutcomeSink: Send + Sync {
    fn enqueue(&self, run: ClosedRun);
}

/// Durable destination for run records.
#[async_trait]
pub trait RecordStore: Send {
    async fn append(&mut self, run: &ClosedRun) -> Result<(), RecorderError>;

    async fn flush(&mut self) -> Result<(), RecorderError> {
        Ok(())
    }
}

/// Appends one JSON record per line.
pub struct JsonlStore {
    writer: BufWriter<tokio::fs::File>,
}

impl JsonlStore {
    /// Open (or create) a file for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

#[async_trait]
impl RecordStore for JsonlStore {
    async fn append(&mut self, run: &ClosedRun) -> Result<(), RecorderError> {
        let mut line = serde_json::to_vec(run)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), RecorderError> {
        self.writer.flush().await?;
        Ok(())
    }
}

struct Shared {
    queue: Mutex<VecDeque<ClosedRun>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

/// Bounded, drop-oldest outcome queue.
#[derive(Clone)]
pub struct BoundedRecorder {
    shared: Arc<Shared>,
}

impl BoundedRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Runs lost to overload since creation.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Runs waiting to be stored.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Take every buffered run.
    pub fn take_all(&self) -> Vec<ClosedRun> {
        self.shared.queue.lock().drain(..).collect()
    }

    /// Ask the drain task to finish once the queue is empty.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    /// Spawn the background task that moves runs into `store`.
    ///
    /// The task ends with the number of runs written after [`close`] is
    /// called, or with the first storage error.
    ///
    /// [`close`]: BoundedRecorder::close
    pub fn spawn_drain<S>(&self, mut store: S) -> JoinHandle<Result<u64, RecorderError>>
    where
        S: RecordStore + 'static,
    {
        let recorder = self.clone();
        tokio::spawn(async move {
            let mut written = 0u64;
            loop {
                let batch = recorder.take_all();
                for run in &batch {
                    if let Err(e) = store.append(run).await {
                        tracing::error!(error = %e, run_id = %run.run.run_id, "Outcome store failed");
                        return Err(e);
                    }
                    written += 1;
                }
                if !batch.is_empty() {
                    store.flush().await?;
                    tracing::debug!(records = batch.len(), "Outcome records stored");
                }

                if recorder.shared.closed.load(Ordering::SeqCst) && recorder.pending() == 0 {
                    return Ok(written);
                }
                recorder.shared.notify.notified().await;
            }
        })
    }
}

impl OutcomeSink for BoundedRecorder {
    fn enqueue(&self, run: ClosedRun) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity {
                if let Some(lost) = queue.pop_front() {
                    let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        run_id = %lost.run.run_id,
                        dropped,
                        "Outcome queue full, dropped oldest record"
                    );
                }
            }
            queue.push_back(run);
        }
        self.shared.notify.notify_one();
    }
}

/// Keeps every run in memory. Useful for tests and one-shot tools.
#[derive(Default)]
pub struct CapturingSink {
    runs: Mutex<Vec<ClosedRun>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<ClosedRun> {
        self.runs.lock().clone()
    }
}

impl OutcomeSink for CapturingSink {
    fn enqueue(&self, run: ClosedRun) {
        self.runs.lock().push(run);
    }
}

/// Discards every run.
pub struct NullSink;

impl OutcomeSink for NullSink {
    fn enqueue(&self, _run: ClosedRun) {}
}
