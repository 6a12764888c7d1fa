use super::model::AuditEntry;
use super::store::AuditStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, warn};

const BATCH_SIZE: usize = 10;
const DRAIN_INTERVAL_MS: u64 = 1000;
const FLUSH_POLL_MS: u64 = 100;

/// Bounded in-memory queue draining into the audit store, per spec.md §4.6.
/// Asynchronous mode: `enqueue` is `try_send` (non-blocking, drop-on-full)
/// and a single background drainer task is the sole writer. Synchronous
/// mode: `enqueue` awaits the insert directly, no drainer runs — intended
/// for tests and small deployments, per §4.6 "Mode selection".
pub struct AuditQueue {
    sender: Option<mpsc::Sender<AuditEntry>>,
    store: Arc<dyn AuditStore>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
    synchronous: bool,
}

impl AuditQueue {
    /// Spawns the background drainer and returns the queue handle.
    /// `capacity` bounds the channel (spec default 1000).
    pub fn spawn_async(store: Arc<dyn AuditStore>, capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity);
        let depth = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(Self {
            sender: Some(tx),
            store: store.clone(),
            depth: depth.clone(),
            capacity,
            synchronous: false,
        });
        tokio::spawn(drain_loop(rx, store, depth));
        queue
    }

    /// Synchronous mode: no channel, no drainer; `enqueue` awaits the insert.
    pub fn synchronous(store: Arc<dyn AuditStore>) -> Arc<Self> {
        Arc::new(Self { sender: None, store, depth: Arc::new(AtomicUsize::new(0)), capacity: 0, synchronous: true })
    }

    /// Non-blocking in async mode: drops the entry with a warning if the
    /// queue is full. The request is never delayed or failed by this call.
    pub async fn enqueue(&self, entry: AuditEntry) {
        if self.synchronous {
            if let Err(err) = self.store.insert(entry).await {
                warn!(?err, "synchronous audit insert failed");
            }
            return;
        }

        let sender = self.sender.as_ref().expect("async queue always has a sender");
        match sender.try_send(entry) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(capacity = self.capacity, "audit queue full, dropping entry");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("audit queue drainer is gone, dropping entry");
            }
        }
    }

    pub fn size(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Drains synchronously, sleeping between iterations, until the queue is
    /// empty or the sender side is closed. Called during shutdown.
    pub async fn flush(&self) {
        if self.synchronous {
            return;
        }
        while self.size() > 0 {
            tokio::time::sleep(Duration::from_millis(FLUSH_POLL_MS)).await;
        }
    }
}

async fn drain_loop(mut rx: mpsc::Receiver<AuditEntry>, store: Arc<dyn AuditStore>, depth: Arc<AtomicUsize>) {
    let mut ticker = interval(Duration::from_millis(DRAIN_INTERVAL_MS));
    loop {
        ticker.tick().await;
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        while batch.len() < BATCH_SIZE {
            match rx.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(_) => break,
            }
        }
        if batch.is_empty() {
            if rx.is_closed() {
                return;
            }
            continue;
        }

        depth.fetch_sub(batch.len(), Ordering::Relaxed);

        // Up to BATCH_SIZE concurrent inserts; one bad entry must not poison
        // the batch, so per-entry failures are logged and swallowed.
        let inserts = batch.into_iter().map(|entry| {
            let store = store.clone();
            async move {
                if let Err(err) = store.insert(entry).await {
                    warn!(?err, "audit insert failed, entry dropped");
                }
            }
        });
        futures_join_all(inserts).await;
    }
}

/// Small local stand-in for `futures::future::join_all` so the drainer does
/// not need an extra crate just for this one call site.
async fn futures_join_all<I>(iter: I)
where
    I: IntoIterator,
    I::Item: std::future::Future<Output = ()>,
{
    let mut handles = Vec::new();
    for fut in iter {
        handles.push(tokio::spawn(fut));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::model::AuditEntry;
    use crate::audit::store::InMemoryAuditStore;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_entry() -> AuditEntry {
        let now = Utc::now();
        AuditEntry {
            id: None,
            request_id: Uuid::new_v4().to_string(),
            timestamp: now,
            method: "POST".into(),
            path: "/v1/chat/completions".into(),
            caller_fingerprint: Some("caller-hash".into()),
            user_agent_fingerprint: None,
            key_fingerprint: None,
            request_bytes: 10,
            response_status: 200,
            response_bytes: 20,
            latency_ms: 5,
            is_blocked: false,
            block_reason: None,
            detected_issues_count: 0,
            security_confidence: None,
            llm_provider: None,
            llm_model: None,
            metadata: serde_json::json!({}),
            retention_until: now + chrono::Duration::days(90),
        }
    }

    #[tokio::test]
    async fn enqueue_beyond_capacity_drops_the_overflow() {
        let store = Arc::new(InMemoryAuditStore::new());
        let capacity = 4;
        let (tx, _rx) = mpsc::channel(capacity);
        let depth = Arc::new(AtomicUsize::new(0));
        // Build directly (not spawn_async) so no drainer competes for slots.
        let queue = Arc::new(AuditQueue { sender: Some(tx), store, depth, capacity, synchronous: false });

        let total = 10;
        for _ in 0..total {
            queue.enqueue(sample_entry()).await;
        }
        assert_eq!(queue.size(), capacity);
    }

    #[tokio::test]
    async fn synchronous_mode_inserts_directly() {
        let store = Arc::new(InMemoryAuditStore::new());
        let queue = AuditQueue::synchronous(store.clone());
        queue.enqueue(sample_entry()).await;
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn async_mode_drains_into_the_store() {
        let store = Arc::new(InMemoryAuditStore::new());
        let queue = AuditQueue::spawn_async(store.clone(), 1000);
        queue.enqueue(sample_entry()).await;
        queue.flush().await;
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(store.all().await.len(), 1);
    }
}
