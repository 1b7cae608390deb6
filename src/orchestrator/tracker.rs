//! Session-to-job tracking shared by both backends.
//!
//! The map holds at most one slot per session key. A slot is either a
//! reservation for a creation that is still talking to the backend, or an
//! active record. Reservation happens under a synchronous lock, before the
//! creating task reaches its first `.await`, so concurrent creations for the
//! same new session can never both pass the existence check.
//!
//! ```text
//!   reserve() ──▶ Reserved ──commit()──▶ Active ──remove_if()──▶ (vacant)
//!                    │                     ▲
//!                    └── fail() / drop ────┘ (vacant, waiters get the error)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::error::{OrchestratorError, Result};
use crate::orchestrator::{JobHandle, JobStatus};

/// What waiters on a reservation eventually observe.
type Outcome = std::result::Result<JobHandle, String>;

/// Reason given when a creation finishes after its slot was taken over.
pub(crate) const SUPERSEDED: &str = "session was claimed by a newer job";

/// A tracked job for one session.
#[derive(Debug)]
pub(crate) struct ActiveJob {
    pub session_key: String,
    pub handle: JobHandle,
    pub actor_id: String,
    pub created_at: DateTime<Utc>,
    /// Terminal status seen by the monitor, kept for the grace period.
    pub outcome: Option<JobStatus>,
    monitor: Option<AbortHandle>,
}

impl ActiveJob {
    pub fn new(
        session_key: impl Into<String>,
        handle: JobHandle,
        actor_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            handle,
            actor_id: actor_id.into(),
            created_at,
            outcome: None,
            monitor: None,
        }
    }

    fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

/// Copy of an active record's identity.
#[derive(Debug, Clone)]
pub(crate) struct TrackedJob {
    pub session_key: String,
    pub handle: JobHandle,
    pub actor_id: String,
    pub created_at: DateTime<Utc>,
}

enum Slot {
    Reserved {
        token: u64,
        ready: watch::Receiver<Option<Outcome>>,
    },
    Active(ActiveJob),
}

/// Result of trying to claim a session key.
pub(crate) enum Reservation {
    /// A job is already tracked for this session.
    Existing(JobHandle),
    /// Another caller is creating the job right now.
    InFlight(InFlight),
    /// The caller owns the slot and must create the job.
    Reserved(SlotGuard),
}

/// Owned `sessionKey -> job` map for one manager instance.
#[derive(Default)]
pub(crate) struct JobTracker {
    slots: Mutex<HashMap<String, Slot>>,
    next_token: AtomicU64,
}

impl JobTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `session_key`. Never suspends.
    pub fn reserve(self: &Arc<Self>, session_key: &str) -> Reservation {
        let mut slots = self.slots();
        match slots.get(session_key) {
            Some(Slot::Active(job)) => Reservation::Existing(job.handle.clone()),
            Some(Slot::Reserved { ready, .. }) => Reservation::InFlight(InFlight {
                session_key: session_key.to_string(),
                ready: ready.clone(),
            }),
            None => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                slots.insert(
                    session_key.to_string(),
                    Slot::Reserved { token, ready: rx },
                );
                Reservation::Reserved(SlotGuard {
                    tracker: Arc::clone(self),
                    session_key: session_key.to_string(),
                    token,
                    tx,
                    resolved: false,
                })
            }
        }
    }

    /// Track a job discovered on the backend. Returns false if the session
    /// already has a slot.
    pub fn adopt(&self, job: ActiveJob) -> bool {
        let mut slots = self.slots();
        if slots.contains_key(&job.session_key) {
            return false;
        }
        slots.insert(job.session_key.clone(), Slot::Active(job));
        true
    }

    /// Attach the monitor task of a tracked job so it can be cancelled.
    pub fn attach_monitor(&self, session_key: &str, handle: &JobHandle, monitor: AbortHandle) {
        match self.slots().get_mut(session_key) {
            Some(Slot::Active(job)) if &job.handle == handle => job.monitor = Some(monitor),
            _ => monitor.abort(),
        }
    }

    /// Whether `handle` is still the tracked job for `session_key`.
    pub fn is_tracking(&self, session_key: &str, handle: &JobHandle) -> bool {
        matches!(
            self.slots().get(session_key),
            Some(Slot::Active(job)) if &job.handle == handle
        )
    }

    /// Store the terminal status the monitor observed.
    pub fn record_outcome(&self, session_key: &str, handle: &JobHandle, status: JobStatus) {
        if let Some(Slot::Active(job)) = self.slots().get_mut(session_key)
            && &job.handle == handle
        {
            job.outcome = Some(status);
        }
    }

    /// Terminal status recorded for `handle`, if any.
    pub fn outcome_for(&self, handle: &JobHandle) -> Option<JobStatus> {
        self.slots().values().find_map(|slot| match slot {
            Slot::Active(job) if &job.handle == handle => job.outcome,
            _ => None,
        })
    }

    /// Stop tracking `handle` if it is still the job for `session_key`.
    ///
    /// Does not abort the monitor; this is the monitor's own exit path.
    pub fn remove_if(&self, session_key: &str, handle: &JobHandle) -> bool {
        let mut slots = self.slots();
        match slots.get(session_key) {
            Some(Slot::Active(job)) if &job.handle == handle => {
                slots.remove(session_key);
                true
            }
            _ => false,
        }
    }

    /// Stop tracking `handle` wherever it is, cancelling its monitor.
    pub fn remove_handle(&self, handle: &JobHandle) -> Option<ActiveJob> {
        let mut slots = self.slots();
        let key = slots.iter().find_map(|(key, slot)| match slot {
            Slot::Active(job) if &job.handle == handle => Some(key.clone()),
            _ => None,
        })?;
        match slots.remove(&key) {
            Some(Slot::Active(mut job)) => {
                job.stop_monitor();
                Some(job)
            }
            _ => None,
        }
    }

    /// Cancel every monitor task without touching the map.
    pub fn abort_monitors(&self) {
        for slot in self.slots().values_mut() {
            if let Slot::Active(job) = slot {
                job.stop_monitor();
            }
        }
    }

    /// Every active record, ordered by session key.
    pub fn snapshot(&self) -> Vec<TrackedJob> {
        let mut out: Vec<TrackedJob> = self
            .slots()
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(job) => Some(TrackedJob {
                    session_key: job.session_key.clone(),
                    handle: job.handle.clone(),
                    actor_id: job.actor_id.clone(),
                    created_at: job.created_at,
                }),
                Slot::Reserved { .. } => None,
            })
            .collect();
        out.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        out
    }

    /// Number of slots, in-flight reservations included.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    /// Empty the map, cancelling every monitor. Returns the active records.
    ///
    /// In-flight reservations are dropped from the map; their creators will
    /// still commit into the now-vacant slot.
    pub fn drain(&self) -> Vec<ActiveJob> {
        let drained: Vec<Slot> = self.slots().drain().map(|(_, slot)| slot).collect();
        drained
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Active(mut job) => {
                    job.stop_monitor();
                    Some(job)
                }
                Slot::Reserved { .. } => None,
            })
            .collect()
    }
}

/// Exclusive right to create the job for one session.
///
/// Dropping the guard without calling [`commit`](Self::commit) or
/// [`fail`](Self::fail) releases the slot.
pub(crate) struct SlotGuard {
    tracker: Arc<JobTracker>,
    session_key: String,
    token: u64,
    tx: watch::Sender<Option<Outcome>>,
    resolved: bool,
}

impl SlotGuard {
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    fn owns(&self, slot: Option<&Slot>) -> bool {
        matches!(slot, Some(Slot::Reserved { token, .. }) if *token == self.token)
    }

    /// Replace the reservation with an active record and wake waiters.
    ///
    /// Returns false when the slot was taken over (e.g. by `cleanup()`
    /// followed by a new creation). The job is then untracked, the caller
    /// owns getting rid of it, and waiters are told creation failed.
    pub fn commit(mut self, job: ActiveJob) -> bool {
        self.resolved = true;
        let handle = job.handle.clone();
        let tracked = {
            let mut slots = self.tracker.slots();
            let slot = slots.get(&self.session_key);
            if slot.is_none() || self.owns(slot) {
                slots.insert(self.session_key.clone(), Slot::Active(job));
                true
            } else {
                false
            }
        };
        let outcome = if tracked {
            Ok(handle)
        } else {
            Err(SUPERSEDED.to_string())
        };
        self.tx.send_replace(Some(outcome));
        tracked
    }

    /// Release the reservation and hand `reason` to waiters.
    pub fn fail(mut self, reason: impl Into<String>) {
        self.resolved = true;
        self.release();
        self.tx.send_replace(Some(Err(reason.into())));
    }

    fn release(&self) {
        let mut slots = self.tracker.slots();
        if self.owns(slots.get(&self.session_key)) {
            slots.remove(&self.session_key);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.resolved {
            self.release();
            self.tx
                .send_replace(Some(Err("job creation was abandoned".to_string())));
        }
    }
}

/// A pending creation started by another caller.
pub(crate) struct InFlight {
    session_key: String,
    ready: watch::Receiver<Option<Outcome>>,
}

impl InFlight {
    /// Wait for the owning caller to finish and share its outcome.
    pub async fn wait(mut self) -> Result<JobHandle> {
        let outcome = match self.ready.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(handle)) => Ok(handle),
            Some(Err(reason)) => Err(OrchestratorError::JobCreationFailed {
                session_key: self.session_key,
                operation: "await concurrent creation",
                reason,
            }),
            None => Err(OrchestratorError::JobCreationFailed {
                session_key: self.session_key,
                operation: "await concurrent creation",
                reason: "job creation was abandoned".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(key: &str, handle: &str) -> ActiveJob {
        ActiveJob::new(key, JobHandle::from(handle), "U1", Utc::now())
    }

    #[test]
    fn test_reserve_then_commit() {
        let tracker = JobTracker::new();
        let guard = match tracker.reserve("s1") {
            Reservation::Reserved(guard) => guard,
            _ => panic!("expected a fresh reservation"),
        };
        assert_eq!(tracker.len(), 1);
        assert!(tracker.snapshot().is_empty());

        assert!(matches!(tracker.reserve("s1"), Reservation::InFlight(_)));

        assert!(guard.commit(job("s1", "job-a")));
        match tracker.reserve("s1") {
            Reservation::Existing(handle) => assert_eq!(handle.as_str(), "job-a"),
            _ => panic!("expected the committed handle"),
        }
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_dropped_guard_releases_slot() {
        let tracker = JobTracker::new();
        {
            let _guard = match tracker.reserve("s1") {
                Reservation::Reserved(guard) => guard,
                _ => panic!("expected a fresh reservation"),
            };
            assert_eq!(tracker.len(), 1);
        }
        assert_eq!(tracker.len(), 0);
        assert!(matches!(tracker.reserve("s1"), Reservation::Reserved(_)));
    }

    #[tokio::test]
    async fn test_waiter_sees_commit() {
        let tracker = JobTracker::new();
        let guard = match tracker.reserve("s1") {
            Reservation::Reserved(guard) => guard,
            _ => panic!("expected a fresh reservation"),
        };
        let waiter = match tracker.reserve("s1") {
            Reservation::InFlight(waiter) => waiter,
            _ => panic!("expected an in-flight reservation"),
        };
        let wait = tokio::spawn(waiter.wait());
        tokio::task::yield_now().await;
        guard.commit(job("s1", "job-a"));
        assert_eq!(wait.await.unwrap().unwrap().as_str(), "job-a");
    }

    #[tokio::test]
    async fn test_waiter_sees_failure() {
        let tracker = JobTracker::new();
        let guard = match tracker.reserve("s1") {
            Reservation::Reserved(guard) => guard,
            _ => panic!("expected a fresh reservation"),
        };
        let waiter = match tracker.reserve("s1") {
            Reservation::InFlight(waiter) => waiter,
            _ => panic!("expected an in-flight reservation"),
        };
        guard.fail("quota exceeded");
        let err = waiter.wait().await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_commit_after_drain_retracks() {
        let tracker = JobTracker::new();
        let guard = match tracker.reserve("s1") {
            Reservation::Reserved(guard) => guard,
            _ => panic!("expected a fresh reservation"),
        };
        assert!(tracker.drain().is_empty());
        assert!(guard.commit(job("s1", "job-a")));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_does_not_clobber_new_owner() {
        let tracker = JobTracker::new();
        let first = match tracker.reserve("s1") {
            Reservation::Reserved(guard) => guard,
            _ => panic!("expected a fresh reservation"),
        };
        tracker.drain();
        let second = match tracker.reserve("s1") {
            Reservation::Reserved(guard) => guard,
            _ => panic!("expected a fresh reservation"),
        };
        let waiter = match tracker.reserve("s1") {
            Reservation::InFlight(waiter) => waiter,
            _ => panic!("expected an in-flight reservation"),
        };
        assert!(second.commit(job("s1", "job-b")));
        assert!(!first.commit(job("s1", "job-a")));
        assert_eq!(tracker.snapshot()[0].handle.as_str(), "job-b");
        assert_eq!(waiter.wait().await.unwrap().as_str(), "job-b");
    }

    #[tokio::test]
    async fn test_superseded_commit_fails_its_waiters() {
        let tracker = JobTracker::new();
        let first = match tracker.reserve("s1") {
            Reservation::Reserved(guard) => guard,
            _ => panic!("expected a fresh reservation"),
        };
        let waiter = match tracker.reserve("s1") {
            Reservation::InFlight(waiter) => waiter,
            _ => panic!("expected an in-flight reservation"),
        };
        tracker.drain();
        let _second = match tracker.reserve("s1") {
            Reservation::Reserved(guard) => guard,
            _ => panic!("expected a fresh reservation"),
        };

        assert!(!first.commit(job("s1", "job-a")));
        let err = waiter.wait().await.unwrap_err();
        assert!(err.to_string().contains(SUPERSEDED));
    }

    #[tokio::test]
    async fn test_abort_monitors_keeps_records() {
        let tracker = JobTracker::new();
        tracker.adopt(job("s1", "job-a"));
        let monitor = tokio::spawn(std::future::pending::<()>());
        tracker.attach_monitor("s1", &JobHandle::from("job-a"), monitor.abort_handle());

        tracker.abort_monitors();
        assert!(monitor.await.unwrap_err().is_cancelled());
        assert!(tracker.is_tracking("s1", &JobHandle::from("job-a")));
    }

    #[test]
    fn test_remove_if_checks_handle() {
        let tracker = JobTracker::new();
        assert!(tracker.adopt(job("s1", "job-a")));
        assert!(!tracker.adopt(job("s1", "job-b")));

        assert!(!tracker.remove_if("s1", &JobHandle::from("job-b")));
        assert!(tracker.is_tracking("s1", &JobHandle::from("job-a")));
        assert!(tracker.remove_if("s1", &JobHandle::from("job-a")));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_outcome_recorded_per_handle() {
        let tracker = JobTracker::new();
        tracker.adopt(job("s1", "job-a"));
        let handle = JobHandle::from("job-a");
        assert_eq!(tracker.outcome_for(&handle), None);
        tracker.record_outcome("s1", &handle, JobStatus::Succeeded);
        assert_eq!(tracker.outcome_for(&handle), Some(JobStatus::Succeeded));

        let removed = tracker.remove_handle(&handle).unwrap();
        assert_eq!(removed.session_key, "s1");
        assert_eq!(tracker.outcome_for(&handle), None);
    }
}
