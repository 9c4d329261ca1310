//! Persistence scheduler (C6) — debounces saves so a burst of
//! edits produces one write, while bounding worst-case staleness with a hard
//! ceiling measured from the first dirty event.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Pending {
    first_dirty_at: Instant,
    task: JoinHandle<()>,
}

/// Schedules a debounced save per document name. `mark_dirty` is cheap and
/// non-blocking to call from the hot update path; the actual save runs on a
/// spawned task after the debounce window elapses.
pub struct PersistenceScheduler {
    debounce: Duration,
    max_debounce: Duration,
    pending: DashMap<String, Arc<Mutex<Option<Pending>>>>,
}

impl PersistenceScheduler {
    pub fn new(debounce: Duration, max_debounce: Duration) -> Self {
        Self {
            debounce,
            max_debounce,
            pending: DashMap::new(),
        }
    }

    /// Record a dirty event for `doc_name` and (re)schedule its save.
    ///
    /// If the max-debounce ceiling (measured from the first dirty event in
    /// the current burst) has already been reached, the save runs
    /// immediately instead of being pushed out further — otherwise a
    /// continuous stream of edits would starve persistence entirely.
    pub async fn mark_dirty<F, Fut>(&self, doc_name: &str, save: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let slot = self
            .pending
            .entry(doc_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let now = Instant::now();
        let mut guard = slot.lock().await;

        let first_dirty_at = match guard.as_ref() {
            Some(p) => p.first_dirty_at,
            None => now,
        };

        if let Some(p) = guard.take() {
            p.task.abort();
        }

        let overdue = now.duration_since(first_dirty_at) >= self.max_debounce;
        let delay = if overdue { Duration::ZERO } else { self.debounce };

        let slot_for_task = slot.clone();
        let debounce_window = self.debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            save().await;
            let mut guard = slot_for_task.lock().await;
            // Only clear if nobody re-dirtied us while we were saving.
            if let Some(p) = guard.as_ref() {
                if p.first_dirty_at.elapsed() >= debounce_window || overdue {
                    *guard = None;
                }
            }
        });

        *guard = Some(Pending {
            first_dirty_at,
            task,
        });
    }

    /// Force a document's pending save to run now, bypassing the debounce
    /// window. Used on document unload and server shutdown.
    pub async fn flush<F, Fut>(&self, doc_name: &str, save: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        if let Some(slot) = self.pending.get(doc_name) {
            let mut guard = slot.lock().await;
            if let Some(p) = guard.take() {
                p.task.abort();
            }
        }
        save().await;
        self.pending.remove(doc_name);
    }

    /// Cancel a document's pending save without running it. Exposed for
    /// tests and for callers that know the in-memory state was discarded.
    pub async fn cancel(&self, doc_name: &str) {
        if let Some((_, slot)) = self.pending.remove(doc_name) {
            let mut guard = slot.lock().await;
            if let Some(p) = guard.take() {
                p.task.abort();
            }
        }
    }

    pub fn has_pending(&self, doc_name: &str) -> bool {
        self.pending.contains_key(doc_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn burst_of_dirty_events_produces_one_save() {
        let scheduler = PersistenceScheduler::new(Duration::from_millis(20), Duration::from_secs(10));
        let saves = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let saves = saves.clone();
            scheduler
                .mark_dirty("doc", move || async move {
                    saves.fetch_add(1, Ordering::SeqCst);
                })
                .await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flush_runs_immediately() {
        let scheduler = PersistenceScheduler::new(Duration::from_secs(10), Duration::from_secs(60));
        let saves = Arc::new(AtomicUsize::new(0));

        let saves2 = saves.clone();
        scheduler
            .mark_dirty("doc", move || async move {
                saves2.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        let saves3 = saves.clone();
        scheduler.flush("doc", move || async move {
            saves3.fetch_add(1, Ordering::SeqCst);
        }).await;

        assert_eq!(saves.load(Ordering::SeqCst), 1);
        assert!(!scheduler.has_pending("doc"));
    }
}
