//! Per-query lifecycle tracking.
//!
//! Handlers for the same query arrive on independent connections, so shared
//! state is created by whichever handler gets there first and dropped when
//! the last one releases it. A watchdog sweeps the registry and aborts
//! queries whose activity counter has not moved for too many sweeps, so a
//! stalled peer cannot pin memory forever.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::wire::QueryId;

/// A monotone activity counter. Handlers touch it whenever they make
/// progress; the watchdog only compares successive snapshots.
#[derive(Debug, Default)]
pub struct Activity {
    counter: AtomicU64,
}

impl Activity {
    /// Records one unit of progress.
    pub fn touch(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// The tasks serving one query, kept so the whole query can be aborted.
#[derive(Debug, Default)]
pub struct Tasks {
    handles: Mutex<Vec<AbortHandle>>,
}

impl Tasks {
    /// Registers a spawned handler.
    pub fn register(&self, handle: AbortHandle) {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Aborts every registered handler.
    pub fn abort_all(&self) {
        for handle in self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
    }
}

/// State the registry needs from every shared query record.
pub trait Tracked {
    /// The query's activity counter.
    fn activity(&self) -> &Activity;
    /// The query's task set.
    fn tasks(&self) -> &Tasks;
}

struct Entry<S> {
    shared: Arc<S>,
    remaining: usize,
    last_seen: u64,
    stale_sweeps: u32,
}

/// The shared records of all in-flight queries on this node.
pub struct Registry<S> {
    inner: Mutex<HashMap<QueryId, Entry<S>>>,
}

impl<S: Tracked> Registry<S> {
    /// An empty registry.
    pub fn new() -> Registry<S> {
        Registry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the record for `id`, creating it with `init` if this is the
    /// first handler to arrive. `releases` is the number of [`Registry::release`]
    /// calls that will retire the record.
    pub fn create_or_get<E>(
        &self,
        id: QueryId,
        releases: usize,
        init: impl FnOnce() -> Result<S, E>,
    ) -> Result<Arc<S>, E> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.get(&id) {
            return Ok(Arc::clone(&entry.shared));
        }
        let shared = Arc::new(init()?);
        inner.insert(
            id,
            Entry {
                shared: Arc::clone(&shared),
                remaining: releases,
                last_seen: 0,
                stale_sweeps: 0,
            },
        );
        Ok(shared)
    }

    /// The record for `id`, if it is still in flight.
    pub fn get(&self, id: QueryId) -> Option<Arc<S>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|entry| Arc::clone(&entry.shared))
    }

    /// One handler is done with `id`. The record is dropped when the last
    /// handler releases it; returns whether that just happened.
    pub fn release(&self, id: QueryId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = inner.get_mut(&id) else {
            return false;
        };
        entry.remaining = entry.remaining.saturating_sub(1);
        if entry.remaining == 0 {
            inner.remove(&id);
            debug!(query = %id, "query record retired");
            return true;
        }
        false
    }

    /// Aborts every handler of `id` and drops the record. Used when one
    /// handler hits a fatal error and the rest must not keep waiting.
    pub fn abort(&self, id: QueryId) {
        let entry = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(entry) = entry {
            entry.shared.tasks().abort_all();
        }
    }

    /// One watchdog pass. Queries idle for `threshold` consecutive sweeps
    /// are aborted; their ids are returned.
    pub fn sweep(&self, threshold: u32) -> Vec<QueryId> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut zombies = Vec::new();
        for (&id, entry) in inner.iter_mut() {
            let now = entry.shared.activity().snapshot();
            if now != entry.last_seen {
                entry.last_seen = now;
                entry.stale_sweeps = 0;
            } else {
                entry.stale_sweeps += 1;
                if entry.stale_sweeps >= threshold {
                    zombies.push(id);
                }
            }
        }
        for id in &zombies {
            if let Some(entry) = inner.remove(id) {
                entry.shared.tasks().abort_all();
            }
        }
        zombies
    }
}

impl<S: Tracked> Default for Registry<S> {
    fn default() -> Registry<S> {
        Registry::new()
    }
}

/// Runs zombie sweeps forever. Spawned once per node when the cooldown is
/// nonzero.
pub async fn watchdog<S: Tracked>(registry: Arc<Registry<S>>, cooldown: Duration, threshold: u32) {
    let mut ticker = tokio::time::interval(cooldown);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for id in registry.sweep(threshold) {
            warn!(query = %id, "aborted zombie query");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Record {
        activity: Activity,
        tasks: Tasks,
    }

    impl Tracked for Record {
        fn activity(&self) -> &Activity {
            &self.activity
        }

        fn tasks(&self) -> &Tasks {
            &self.tasks
        }
    }

    fn id(b: u8) -> QueryId {
        QueryId([b; 16])
    }

    #[test]
    fn second_caller_gets_the_first_record() {
        let registry: Registry<Record> = Registry::new();
        let a = registry
            .create_or_get::<()>(id(1), 2, || Ok(Record::default()))
            .unwrap();
        let b = registry
            .create_or_get::<()>(id(1), 2, || panic!("record already exists"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!registry.release(id(1)));
        assert!(registry.release(id(1)));
        assert!(registry.get(id(1)).is_none());
    }

    #[test]
    fn idle_queries_are_swept_after_the_threshold() {
        let registry: Registry<Record> = Registry::new();
        let record = registry
            .create_or_get::<()>(id(2), 4, || Ok(Record::default()))
            .unwrap();
        assert!(registry.sweep(2).is_empty()); // idle, but below the threshold
        record.activity.touch();
        assert!(registry.sweep(2).is_empty()); // progress resets the count
        assert!(registry.sweep(2).is_empty());
        assert_eq!(registry.sweep(2), vec![id(2)]);
        assert!(registry.get(id(2)).is_none());
    }

    #[tokio::test]
    async fn abort_stops_registered_tasks() {
        let registry: Registry<Record> = Registry::new();
        let record = registry
            .create_or_get::<()>(id(3), 1, || Ok(Record::default()))
            .unwrap();
        let task = tokio::spawn(std::future::pending::<()>());
        record.tasks.register(task.abort_handle());
        registry.abort(id(3));
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
