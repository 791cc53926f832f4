//! Job System Module
//!
//! An in-flight job registry with request deduplication. The first caller for a
//! key becomes the leader and owns a [`JobTicket`]; later callers join and
//! await the same outcome through a [`JobWaiter`]. The entry leaves the
//! registry exactly once, on completion or when the ticket is dropped.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::{JobId, Percent};

// =============================================================================
// Job Types
// =============================================================================

/// Job lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    /// Registered, work not started yet
    Registered,
    /// Work in progress
    Running,
}

/// Point-in-time view of a registered job
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot<K> {
    pub id: JobId,
    pub key: K,
    pub state: JobState,
    pub progress: Percent,
    pub created_at: String,
}

struct JobEntry<K, T> {
    id: JobId,
    key: K,
    created_at: String,
    running: AtomicBool,
    progress: Arc<AtomicU8>,
    outcome: watch::Sender<Option<T>>,
}

impl<K: Clone, T> JobEntry<K, T> {
    fn snapshot(&self) -> JobSnapshot<K> {
        JobSnapshot {
            id: self.id.clone(),
            key: self.key.clone(),
            state: if self.running.load(Ordering::Acquire) {
                JobState::Running
            } else {
                JobState::Registered
            },
            progress: self.progress.load(Ordering::Relaxed),
            created_at: self.created_at.clone(),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Result of [`JobRegistry::claim`]
pub enum JobClaim<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    /// No job existed; the caller must run it and settle the ticket.
    Leader(JobTicket<K, T>, JobWaiter<T>),
    /// A job for the key is already running.
    Joined(JobWaiter<T>),
}

/// Registry of in-flight jobs keyed by `K`, each settling with a `T`.
pub struct JobRegistry<K, T> {
    jobs: Arc<Mutex<HashMap<K, Arc<JobEntry<K, T>>>>>,
}

impl<K, T> Clone for JobRegistry<K, T> {
    fn clone(&self) -> Self {
        Self {
            jobs: Arc::clone(&self.jobs),
        }
    }
}

impl<K, T> Default for JobRegistry<K, T> {
    fn default() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T> JobRegistry<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the job for `key`, or registers a new one.
    ///
    /// The lookup and the insert happen under one lock, so two concurrent
    /// claims for the same key always produce exactly one leader.
    pub fn claim(&self, key: K) -> JobClaim<K, T> {
        let mut jobs = self.lock();

        if let Some(entry) = jobs.get(&key) {
            debug!(job_id = %entry.id, "Joining in-flight job");
            return JobClaim::Joined(JobWaiter {
                id: entry.id.clone(),
                rx: entry.outcome.subscribe(),
            });
        }

        let (tx, rx) = watch::channel(None);
        let entry = Arc::new(JobEntry {
            id: ulid::Ulid::new().to_string(),
            key: key.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            running: AtomicBool::new(false),
            progress: Arc::new(AtomicU8::new(0)),
            outcome: tx,
        });
        jobs.insert(key, Arc::clone(&entry));
        debug!(job_id = %entry.id, "Registered job");

        let waiter = JobWaiter {
            id: entry.id.clone(),
            rx,
        };
        JobClaim::Leader(
            JobTicket {
                registry: self.clone(),
                entry,
                settled: false,
            },
            waiter,
        )
    }

    /// Progress of the job for `key`
    pub fn progress(&self, key: &K) -> Option<Percent> {
        self.lock()
            .get(key)
            .map(|e| e.progress.load(Ordering::Relaxed))
    }

    /// Highest progress among jobs whose key matches `pred`
    pub fn progress_where(&self, pred: impl Fn(&K) -> bool) -> Option<Percent> {
        self.lock()
            .values()
            .filter(|e| pred(&e.key))
            .map(|e| e.progress.load(Ordering::Relaxed))
            .max()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All registered jobs, oldest first
    pub fn snapshot(&self) -> Vec<JobSnapshot<K>> {
        let mut jobs: Vec<_> = self.lock().values().map(|e| e.snapshot()).collect();
        // ULIDs sort by creation time
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    fn remove(&self, entry: &Arc<JobEntry<K, T>>) {
        let mut jobs = self.lock();
        if jobs
            .get(&entry.key)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            jobs.remove(&entry.key);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Arc<JobEntry<K, T>>>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// =============================================================================
// Ticket / Waiter
// =============================================================================

/// Leader handle for a registered job.
///
/// Dropping an unsettled ticket removes the job; its waiters then observe
/// abandonment.
pub struct JobTicket<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    registry: JobRegistry<K, T>,
    entry: Arc<JobEntry<K, T>>,
    settled: bool,
}

impl<K, T> JobTicket<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn key(&self) -> &K {
        &self.entry.key
    }

    pub fn set_running(&self) {
        self.entry.running.store(true, Ordering::Release);
    }

    pub fn set_progress(&self, progress: Percent) {
        self.entry.progress.store(progress.min(100), Ordering::Relaxed);
    }

    /// A callback that updates this job's progress, for subprocess supervisors.
    pub fn progress_reporter(&self) -> impl Fn(Percent) + Send + Sync + 'static {
        let progress = Arc::clone(&self.entry.progress);
        move |p| progress.store(p.min(100), Ordering::Relaxed)
    }

    /// Removes the job and hands `outcome` to every waiter.
    pub fn complete(mut self, outcome: T) {
        self.registry.remove(&self.entry);
        self.settled = true;
        self.entry.outcome.send_replace(Some(outcome));
        debug!(job_id = %self.entry.id, "Job settled");
    }
}

impl<K, T> Drop for JobTicket<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn drop(&mut self) {
        if !self.settled {
            self.registry.remove(&self.entry);
            debug!(job_id = %self.entry.id, "Job abandoned");
        }
    }
}

/// Awaits the outcome of a job.
pub struct JobWaiter<T> {
    id: JobId,
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> JobWaiter<T> {
    pub fn job_id(&self) -> &str {
        &self.id
    }

    /// The job's outcome, or `None` if the leader went away without settling.
    pub async fn wait(mut self) -> Option<T> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        }
    }
}
