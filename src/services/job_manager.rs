use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::config::DEFAULT_MAX_CONCURRENT_CHATS;
use crate::services::thinking_segmenter::ThinkingSegmenter;

/// Per-generation state handed to the task that drives the stream.
///
/// The registry only keeps the job id and a clone of the cancellation token;
/// the accumulators live here and are owned exclusively by the running task.
#[derive(Debug)]
pub struct JobState {
    pub session_id: String,
    pub job_id: Uuid,
    pub cancel: CancellationToken,
    pub segmenter: ThinkingSegmenter,
}

impl JobState {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug)]
struct JobEntry {
    job_id: Uuid,
    cancel: CancellationToken,
    started_at: Instant,
}

impl JobEntry {
    fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Bounded registry of in-flight generations, at most one per session.
///
/// When full, registering a new session evicts and cancels the least recently
/// used one. The lock is only held for map mutations.
pub struct ChatJobManager {
    jobs: Mutex<LruCache<String, JobEntry>>,
    capacity: NonZeroUsize,
}

impl Default for ChatJobManager {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_MAX_CONCURRENT_CHATS).unwrap_or(NonZeroUsize::MIN))
    }
}

impl ChatJobManager {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            // Unbounded cache: eviction is done by hand so the evicted job can be cancelled.
            jobs: Mutex::new(LruCache::unbounded()),
            capacity,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Register a generation for `session_id`.
    ///
    /// An existing job for the same session is cancelled and replaced.
    pub async fn add_job(&self, session_id: &str) -> JobState {
        let job_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let mut jobs = self.jobs.lock().await;

        if let Some(previous) = jobs.pop(session_id) {
            debug!(
                target: "app::chat::jobs",
                session_id,
                replaced_job_id = %previous.job_id,
                "replacing active job for session"
            );
            previous.cancel();
        } else if jobs.len() >= self.capacity.get() {
            if let Some((evicted_session, evicted)) = jobs.pop_lru() {
                info!(
                    target: "app::chat::jobs",
                    evicted_session = %evicted_session,
                    evicted_job_id = %evicted.job_id,
                    running_ms = evicted.started_at.elapsed().as_millis() as u64,
                    "evicting least recently used job"
                );
                evicted.cancel();
            }
        }

        jobs.push(
            session_id.to_string(),
            JobEntry {
                job_id,
                cancel: cancel.clone(),
                started_at: Instant::now(),
            },
        );

        debug!(
            target: "app::chat::jobs",
            session_id,
            job_id = %job_id,
            active = jobs.len(),
            "job registered"
        );

        JobState {
            session_id: session_id.to_string(),
            job_id,
            cancel,
            segmenter: ThinkingSegmenter::new(),
        }
    }

    /// Mark the session most recently used. Returns false if it has no job.
    pub async fn touch(&self, session_id: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        jobs.promote(session_id);
        jobs.contains(session_id)
    }

    /// Cancel and unregister the session's job; no-op when absent.
    pub async fn remove_job(&self, session_id: &str) {
        let removed = self.jobs.lock().await.pop(session_id);
        if let Some(entry) = removed {
            entry.cancel();
            debug!(target: "app::chat::jobs", session_id, job_id = %entry.job_id, "job removed");
        }
    }

    /// Unregister a job that finished on its own.
    ///
    /// Only removes the entry when it still belongs to `job_id`, so a job that
    /// was replaced cannot unregister its successor.
    pub async fn complete_job(&self, session_id: &str, job_id: Uuid) -> bool {
        let mut jobs = self.jobs.lock().await;
        let matches = jobs
            .peek(session_id)
            .map(|entry| entry.job_id == job_id)
            .unwrap_or(false);
        if matches {
            if let Some(entry) = jobs.pop(session_id) {
                entry.cancel();
            }
            debug!(target: "app::chat::jobs", session_id, job_id = %job_id, "job completed");
        }
        matches
    }

    pub async fn cancel_all(&self) {
        let mut jobs = self.jobs.lock().await;
        let count = jobs.len();
        for (_, entry) in jobs.iter() {
            entry.cancel();
        }
        jobs.clear();
        if count > 0 {
            info!(target: "app::chat::jobs", cancelled = count, "cancelled all jobs");
        }
    }

    pub async fn active_session_ids(&self) -> HashSet<String> {
        self.jobs
            .lock()
            .await
            .iter()
            .map(|(session_id, _)| session_id.clone())
            .collect()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.jobs.lock().await.contains(session_id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}
