//! Suspension Queue (§4.F).
//!
//! A bounded FIFO of requests waiting for a group to recover. Grounded on
//! the teacher's retry-loop structure in `shared/query.rs`, pulled out into
//! its own component and given the resume-channel shape the source notes
//! recommend (§9): one bounded channel per suspended entry, consumed by the
//! caller via `tokio::select!` against the entry's own deadline and the
//! client's cancellation signal.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use uuid::Uuid;

use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeSignal {
    Resumed,
    TimedOut,
}

struct Entry {
    request_id: Uuid,
    tx: Option<oneshot::Sender<ResumeSignal>>,
}

pub struct SuspensionQueue {
    entries: Mutex<VecDeque<Entry>>,
    max_suspended: usize,
    metrics: Arc<Metrics>,
}

impl SuspensionQueue {
    pub fn new(max_suspended: usize, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self { entries: Mutex::new(VecDeque::new()), max_suspended, metrics })
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Enqueues `request_id` with `timeout`; returns a receiver the caller
    /// awaits for `Resumed`/`TimedOut`. Fails fast at capacity (§4.F,
    /// `max_suspended_requests=0` behaves as disabled — see `suspend` below).
    pub async fn enqueue(self: &Arc<Self>, request_id: Uuid, timeout: Duration) -> Result<oneshot::Receiver<ResumeSignal>, ()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut entries = self.entries.lock().await;
            if entries.len() >= self.max_suspended {
                self.metrics.suspension_rejected();
                return Err(());
            }
            entries.push_back(Entry { request_id, tx: Some(tx) });
            self.metrics.set_suspension_queue_depth(entries.len());
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            queue.timeout(request_id).await;
        });

        Ok(rx)
    }

    /// Deadline fired for `request_id`: remove it (if still queued) and
    /// signal timeout. A no-op if the entry already resumed or was removed.
    async fn timeout(&self, request_id: Uuid) {
        let mut entries = self.entries.lock().await;
        if let Some(pos) = entries.iter().position(|e| e.request_id == request_id) {
            if let Some(mut entry) = entries.remove(pos) {
                self.metrics.set_suspension_queue_depth(entries.len());
                if let Some(tx) = entry.tx.take() {
                    let _ = tx.send(ResumeSignal::TimedOut);
                }
            }
        }
    }

    /// Client disconnected: remove the entry without signaling (the caller
    /// already knows the request is cancelled and owns the terminal status).
    pub async fn cancel(&self, request_id: Uuid) {
        let mut entries = self.entries.lock().await;
        entries.retain(|e| e.request_id != request_id);
        self.metrics.set_suspension_queue_depth(entries.len());
    }

    /// A group recovered: pop every waiting entry in strict FIFO order and
    /// signal resume (§8 invariant 4). Resumed requests re-run group
    /// selection from scratch; if nothing is actually selectable yet they
    /// will simply re-suspend.
    pub async fn notify_recovery(&self) {
        let mut entries = self.entries.lock().await;
        let drained: Vec<Entry> = entries.drain(..).collect();
        self.metrics.set_suspension_queue_depth(0);
        drop(entries);
        for mut entry in drained {
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(ResumeSignal::Resumed);
            }
        }
    }
}
