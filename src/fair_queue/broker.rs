use std::collections::HashSet;
use std::str;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use crossbeam_skiplist::SkipMap;
use slatedb::Db;
use tokio::sync::Notify;
use tracing::debug;

use crate::keys::{end_bound, worker_queue_prefix};

/// A worker-queue entry buffered in memory.
#[derive(Debug, Clone)]
pub struct BrokerEntry {
    pub key: String,
    /// Raw wire-encoded entry (legacy or optimized), decoded by the consumer.
    pub raw: String,
}

/// Lock-free in-memory worker-queue broker backed by the store.
///
/// - Maintains a sorted buffer of deliverable entries in a skiplist keyed by
///   the full entry key, so one buffer serves every worker queue and a range
///   scan over the key prefix isolates a single queue.
/// - Populates from the store in the background with exponential backoff when
///   no work is found.
/// - Entries claimed but not yet durably removed are tracked as in-flight and
///   not reinserted by the scanner.
pub struct WorkerQueueBroker {
    db: Arc<Db>,
    buffer: Arc<SkipMap<String, BrokerEntry>>,
    inflight: Arc<Mutex<HashSet<String>>>,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    scan_requested: Arc<AtomicBool>,
    target_buffer: usize,
    scan_batch: usize,
}

impl WorkerQueueBroker {
    pub fn new(db: Arc<Db>) -> Arc<Self> {
        Arc::new(Self {
            db,
            buffer: Arc::new(SkipMap::new()),
            inflight: Arc::new(Mutex::new(HashSet::new())),
            running: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            scan_requested: Arc::new(AtomicBool::new(false)),
            target_buffer: 4096,
            scan_batch: 1024,
        })
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    /// Scan deliverable entries from the store into the buffer, skipping
    /// in-flight ones.
    async fn scan_entries(&self) -> usize {
        let start: Vec<u8> = b"wq/".to_vec();
        let mut end: Vec<u8> = b"wq/".to_vec();
        end.push(0xFF);

        let Ok(mut iter) = self.db.scan::<Vec<u8>, _>(start..=end).await else {
            return 0;
        };

        let mut inserted = 0;
        while inserted < self.scan_batch && self.buffer.len() < self.target_buffer {
            let Ok(Some(kv)) = iter.next().await else {
                break;
            };

            let Ok(key_str) = str::from_utf8(&kv.key) else {
                continue;
            };

            if self.inflight.lock().unwrap().contains(key_str) {
                continue;
            }

            let Ok(raw) = str::from_utf8(&kv.value) else {
                continue; // skip malformed entries
            };
            let entry = BrokerEntry {
                key: key_str.to_string(),
                raw: raw.to_string(),
            };

            if self.buffer.get(&entry.key).is_none() {
                self.buffer.insert(entry.key.clone(), entry);
                inserted += 1;

                // Yield periodically to avoid starving other tasks
                if inserted % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }

        inserted
    }

    /// Start the background scanning loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let min_sleep_ms = 5;
            let max_sleep_ms = 1000;
            let mut sleep_ms = min_sleep_ms;

            loop {
                if !broker.running.load(Ordering::SeqCst) {
                    break;
                }

                if broker.buffer.len() >= broker.target_buffer {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }

                let inserted = broker.scan_entries().await;

                // Stay aggressive while the buffer needs filling
                if broker.buffer.len() < broker.target_buffer / 2 && inserted > 0 {
                    sleep_ms = min_sleep_ms;
                } else if inserted == 0 {
                    sleep_ms = (sleep_ms * 2).min(max_sleep_ms);
                } else {
                    sleep_ms = min_sleep_ms;
                }

                if broker.scan_requested.swap(false, Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    continue;
                }

                let delay = tokio::time::sleep(Duration::from_millis(sleep_ms));
                tokio::pin!(delay);
                tokio::select! {
                    _ = &mut delay => {},
                    _ = broker.notify.notified() => {
                        debug!("broker woken by notification");
                    }
                }
            }
        });
    }

    /// Stop the background loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Claim the oldest buffered entry for one worker queue, if any.
    pub fn claim_one(&self, worker_queue: &str) -> Option<BrokerEntry> {
        let prefix = worker_queue_prefix(worker_queue);
        let end = String::from_utf8(end_bound(&prefix)).ok()?;

        loop {
            let candidate_key = self
                .buffer
                .range(prefix.clone()..end.clone())
                .find_map(|entry| {
                    let key = entry.key();
                    if self.inflight.lock().unwrap().contains(key) {
                        return None;
                    }
                    Some(key.clone())
                })?;

            if !self.inflight.lock().unwrap().insert(candidate_key.clone()) {
                continue; // lost race, try again
            }

            if let Some(entry) = self.buffer.remove(&candidate_key) {
                return Some(entry.value().clone());
            }
            // Removal failed, clear the in-flight reservation and retry
            self.inflight.lock().unwrap().remove(&candidate_key);
        }
    }

    /// Requeue an entry back into the buffer after a failed durable removal.
    pub fn requeue(&self, entry: BrokerEntry) {
        let mut inflight = self.inflight.lock().unwrap();
        inflight.remove(&entry.key);
        self.buffer.insert(entry.key.clone(), entry);
    }

    /// The entry's durable removal committed; drop the in-flight reservation.
    pub fn ack_durable(&self, key: &str) {
        self.inflight.lock().unwrap().remove(key);
    }

    /// Wake the scanner to refill promptly.
    pub fn wakeup(&self) {
        self.scan_requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

impl Drop for WorkerQueueBroker {
    fn drop(&mut self) {
        self.stop();
    }
}
