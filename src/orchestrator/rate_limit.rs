//! Per-actor admission control for job creation.
//!
//! Fixed window per actor: the first request opens a window of length `W`,
//! up to `C` requests are admitted inside it, and the next request after the
//! window elapses opens a fresh one. A periodic sweep drops elapsed windows so
//! memory stays bounded by the number of recently active actors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::OrchestratorError;

/// Bucket shared by every request without an actor id.
pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed {
        /// Requests left in the current window.
        remaining: u32,
    },
    Denied {
        /// Time until the window resets.
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    count: u32,
    window_start: Instant,
}

/// In-memory sliding admission window keyed by actor.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, RateLimitWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<String, RateLimitWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit one request for `actor_id` and record it if allowed.
    pub fn try_admit(&self, actor_id: Option<&str>) -> Admission {
        let actor = actor_key(actor_id);
        let now = Instant::now();
        let mut windows = self.windows();

        let window = windows.entry(actor.to_string()).or_insert(RateLimitWindow {
            count: 0,
            window_start: now,
        });

        if now.duration_since(window.window_start) >= self.config.window {
            window.count = 0;
            window.window_start = now;
        }

        if window.count < self.config.max_jobs {
            window.count += 1;
            Admission::Allowed {
                remaining: self.config.max_jobs - window.count,
            }
        } else {
            let elapsed = now.duration_since(window.window_start);
            Admission::Denied {
                retry_after: self.config.window.saturating_sub(elapsed),
            }
        }
    }

    /// Boolean form of [`try_admit`](Self::try_admit).
    pub fn admit(&self, actor_id: Option<&str>) -> bool {
        self.try_admit(actor_id).is_allowed()
    }

    /// Admit or fail with [`OrchestratorError::RateLimitExceeded`].
    pub fn check(&self, actor_id: Option<&str>) -> Result<(), OrchestratorError> {
        match self.try_admit(actor_id) {
            Admission::Allowed { remaining } => {
                tracing::debug!(actor_id = %actor_key(actor_id), remaining, "Job request admitted");
                Ok(())
            }
            Admission::Denied { retry_after } => {
                let actor = actor_key(actor_id);
                tracing::info!(
                    actor_id = %actor,
                    retry_after_secs = retry_after.as_secs(),
                    "Job request rate limited"
                );
                Err(OrchestratorError::RateLimitExceeded {
                    actor_id: actor.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Requests `actor_id` may still make in its current window.
    pub fn remaining(&self, actor_id: Option<&str>) -> u32 {
        let now = Instant::now();
        match self.windows().get(actor_key(actor_id)) {
            Some(w) if now.duration_since(w.window_start) < self.config.window => {
                self.config.max_jobs.saturating_sub(w.count)
            }
            _ => self.config.max_jobs,
        }
    }

    /// Number of actors with a window in memory.
    pub fn tracked_actors(&self) -> usize {
        self.windows().len()
    }

    /// Drop windows that have fully elapsed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows();
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.window_start) < self.config.window);
        before - windows.len()
    }

    /// Sweep every `sweep_interval` until the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let swept = limiter.sweep();
                if swept > 0 {
                    tracing::debug!(swept, "Swept stale rate limit windows");
                }
            }
        })
    }
}

/// Rate limit bucket for `actor_id`: the trimmed id, or [`ANONYMOUS_ACTOR`].
pub fn actor_key(actor_id: Option<&str>) -> &str {
    match actor_id.map(str::trim) {
        Some(id) if !id.is_empty() => id,
        _ => ANONYMOUS_ACTOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_jobs: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            window: Duration::from_secs(900),
            max_jobs,
            sweep_interval: Duration::from_secs(300),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_then_deny_then_reset() {
        let limiter = limiter(5);
        for _ in 0..5 {
            assert!(limiter.admit(Some("U1")));
        }
        assert!(!limiter.admit(Some("U1")));
        assert_eq!(limiter.remaining(Some("U1")), 0);

        tokio::time::advance(Duration::from_secs(900)).await;

        assert_eq!(
            limiter.try_admit(Some("U1")),
            Admission::Allowed { remaining: 4 }
        );
        assert_eq!(limiter.remaining(Some("U1")), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_counts_down() {
        let limiter = limiter(1);
        assert!(limiter.admit(Some("U1")));
        tokio::time::advance(Duration::from_secs(600)).await;

        let err = limiter.check(Some("U1")).unwrap_err();
        match err {
            OrchestratorError::RateLimitExceeded {
                actor_id,
                retry_after,
            } => {
                assert_eq!(actor_id, "U1");
                assert_eq!(retry_after, Duration::from_secs(300));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_actors_are_isolated() {
        let limiter = limiter(2);
        assert!(limiter.admit(Some("A")));
        assert!(limiter.admit(Some("A")));
        assert!(!limiter.admit(Some("A")));

        assert!(limiter.admit(Some("B")));
        assert_eq!(limiter.remaining(Some("B")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_anonymous_actors_share_a_bucket() {
        let limiter = limiter(2);
        assert!(limiter.admit(None));
        assert!(limiter.admit(Some("  ")));
        assert!(!limiter.admit(Some("")));
        assert!(!limiter.admit(Some(ANONYMOUS_ACTOR)));
        assert_eq!(limiter.tracked_actors(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_elapsed_windows() {
        let limiter = limiter(5);
        limiter.admit(Some("old"));
        tokio::time::advance(Duration::from_secs(600)).await;
        limiter.admit(Some("fresh"));
        tokio::time::advance(Duration::from_secs(300)).await;

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_actors(), 1);
        assert_eq!(limiter.remaining(Some("fresh")), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_and_stops() {
        let limiter = Arc::new(limiter(5));
        let task = limiter.spawn_sweeper();
        limiter.admit(Some("U1"));

        tokio::time::sleep(Duration::from_secs(901)).await;
        assert_eq!(limiter.tracked_actors(), 0);

        drop(limiter);
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(task.is_finished());
    }
}
