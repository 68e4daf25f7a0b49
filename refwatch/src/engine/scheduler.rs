// refwatch/src/engine/scheduler.rs
//
// Deferred verification of clean joins.
//
// One cancellable tokio task per joined user, registered in a DashMap keyed
// by user id. Each registration carries a generation number; a firing task
// only removes the entry if the generation still matches, so a timer that
// fires concurrently with a reschedule never evicts its replacement.
//
// On firing the task re-reads the attribution and verifies it only when it
// is still pending with an empty note. Anything else (revoked, verified,
// flagged meanwhile) is a silent no-op. Errors are logged and swallowed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::clock::{Clock, SharedClock};
use crate::error::EngineResult;
use crate::events::{AttributionStatus, EventKind};
use crate::state::store::Repository;

pub const VERIFICATION_DELAY_SECS: u64 = 600;

struct Armed {
    generation: u64,
    handle:     JoinHandle<()>,
}

pub struct VerificationScheduler<R: Repository> {
    repo:       Arc<R>,
    clock:      SharedClock,
    delay:      Duration,
    tasks:      Arc<DashMap<i64, Armed>>,
    generation: AtomicU64,
}

impl<R: Repository> VerificationScheduler<R> {
    #[cfg(test)]
    pub fn new(repo: Arc<R>, clock: SharedClock) -> Self {
        Self::with_delay(repo, clock, Duration::from_secs(VERIFICATION_DELAY_SECS))
    }

    pub fn with_delay(repo: Arc<R>, clock: SharedClock, delay: Duration) -> Self {
        Self {
            repo,
            clock,
            delay,
            tasks:      Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Arm (or re-arm) the verification timer for `user_id`.
    pub fn schedule(&self, user_id: i64) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        // Hold the entry lock across spawn + insert so the new task can never
        // observe the map before its own registration lands.
        let entry  = self.tasks.entry(user_id);
        let handle = tokio::spawn(fire(
            Arc::clone(&self.repo),
            Arc::clone(&self.clock),
            Arc::clone(&self.tasks),
            user_id,
            generation,
            self.delay,
        ));
        let armed = Armed { generation, handle };

        let replaced = match entry {
            Entry::Occupied(mut slot) => Some(slot.insert(armed)),
            Entry::Vacant(slot) => {
                slot.insert(armed);
                None
            }
        };
        if let Some(previous) = replaced {
            previous.handle.abort();
        }
        debug!(user_id, generation, delay_secs = self.delay.as_secs(), "verification armed");
    }

    /// Disarm the timer for `user_id`. Safe when none is armed.
    pub fn cancel(&self, user_id: i64) -> bool {
        match self.tasks.remove(&user_id) {
            Some((_, armed)) => {
                armed.handle.abort();
                debug!(user_id, "verification disarmed");
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, user_id: i64) -> bool {
        self.tasks.contains_key(&user_id)
    }

    #[cfg(test)]
    pub fn n_armed(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every outstanding timer and wait for each task to wind down.
    pub async fn shutdown(&self) {
        let users: Vec<i64> = self.tasks.iter().map(|e| *e.key()).collect();
        let mut handles = Vec::with_capacity(users.len());
        for user_id in users {
            if let Some((_, armed)) = self.tasks.remove(&user_id) {
                armed.handle.abort();
                handles.push(armed.handle);
            }
        }
        let n = handles.len();
        for handle in handles {
            // cancelled tasks resolve to a JoinError; that is the expected outcome
            let _ = handle.await;
        }
        info!(cancelled = n, "verification scheduler drained");
    }
}

async fn fire<R: Repository>(
    repo:       Arc<R>,
    clock:      SharedClock,
    tasks:      Arc<DashMap<i64, Armed>>,
    user_id:    i64,
    generation: u64,
    delay:      Duration,
) {
    tokio::time::sleep(delay).await;

    match verify_if_clean(&*repo, &*clock, user_id) {
        Ok(Some(attribution_id)) => info!(user_id, attribution_id, "attribution verified"),
        Ok(None) => debug!(user_id, "verification skipped: no longer eligible"),
        Err(e) => error!(user_id, error = %e, "verification failed"),
    }

    tasks.remove_if(&user_id, |_, armed| armed.generation == generation);
}

/// Verify the user's attribution if it is still pending and unflagged.
/// Returns the verified attribution id, or None when nothing changed.
pub fn verify_if_clean<R: Repository>(repo: &R, clock: &dyn Clock, user_id: i64) -> EngineResult<Option<i64>> {
    let now = clock.now();
    repo.transaction(|tx| {
        let Some(attribution) = tx.attribution_by_user(user_id)? else {
            return Ok(None);
        };
        if !attribution.awaiting_auto_verify() {
            return Ok(None);
        }
        tx.update_attribution_status(attribution.id, AttributionStatus::Verified, Some(now))?;
        tx.log_event(
            EventKind::Promote,
            user_id,
            Some(attribution.affiliate_id),
            json!({ "attribution_id": attribution.id, "source": "timer" }),
            now,
        )?;
        Ok(Some(attribution.id))
    })
}
