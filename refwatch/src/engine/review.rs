// refwatch/src/engine/review.rs
//
// Manual review of attributions withheld from automatic verification.
//
// Admins see pending, flagged attributions oldest first and resolve each with
// a verify or revoke button. Authorization is checked against the gateway
// before any state is touched; every resolution disarms the user's timer.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::engine::scheduler::VerificationScheduler;
use crate::error::{EngineError, EngineResult};
use crate::events::{Attribution, AttributionStatus, EventKind, RiskReason, UserRecord};
use crate::gateway::{Button, Gateway};
use crate::state::store::Repository;

pub const CALLBACK_PREFIX: &str = "review:";
pub const DEFAULT_REVIEW_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Verify,
    Revoke,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Revoke => "revoke",
        }
    }
}

// ── Callback payloads ─────────────────────────────────────────────────────────
// Wire format: "review:<verify|revoke>:<attribution id>"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewCallback {
    pub action:         ReviewAction,
    pub attribution_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    Malformed,
    /// Well-formed, but the action is neither verify nor revoke.
    UnsupportedAction { action: String, attribution_id: i64 },
}

impl ReviewCallback {
    pub fn encode(&self) -> String {
        format!("{}{}:{}", CALLBACK_PREFIX, self.action.as_str(), self.attribution_id)
    }

    pub fn parse(data: &str) -> Result<Self, CallbackError> {
        let parts: Vec<&str> = data.split(':').collect();
        let [prefix, action, id] = parts.as_slice() else {
            return Err(CallbackError::Malformed);
        };
        if format!("{}:", prefix) != CALLBACK_PREFIX {
            return Err(CallbackError::Malformed);
        }
        let attribution_id = id.trim().parse::<i64>().map_err(|_| CallbackError::Malformed)?;
        let action = match *action {
            "verify" => ReviewAction::Verify,
            "revoke" => ReviewAction::Revoke,
            other => {
                return Err(CallbackError::UnsupportedAction { action: other.to_string(), attribution_id })
            }
        };
        Ok(Self { action, attribution_id })
    }

    pub fn button(&self) -> Button {
        let verb = match self.action {
            ReviewAction::Verify => "Verify",
            ReviewAction::Revoke => "Revoke",
        };
        Button { text: format!("{} #{}", verb, self.attribution_id), callback_data: self.encode() }
    }
}

// ── Review queue ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReviewItem {
    pub attribution: Attribution,
    pub user:        Option<UserRecord>,
    pub owner:       Option<UserRecord>,
}

impl ReviewItem {
    pub fn user_label(&self) -> String {
        match self.user {
            Some(ref u) => u.label(),
            None => self.attribution.joined_user_id.to_string(),
        }
    }

    pub fn affiliate_label(&self) -> String {
        match self.owner {
            Some(ref o) => o.label(),
            None => format!("Affiliate #{}", self.attribution.affiliate_id),
        }
    }

    /// Verify + revoke buttons for this item.
    pub fn buttons(&self) -> [Button; 2] {
        let id = self.attribution.id;
        [
            ReviewCallback { action: ReviewAction::Verify, attribution_id: id }.button(),
            ReviewCallback { action: ReviewAction::Revoke, attribution_id: id }.button(),
        ]
    }
}

pub struct ReviewWorkflow<R: Repository> {
    repo:      Arc<R>,
    scheduler: Arc<VerificationScheduler<R>>,
    gateway:   Arc<dyn Gateway>,
    clock:     SharedClock,
}

impl<R: Repository> ReviewWorkflow<R> {
    pub fn new(
        repo:      Arc<R>,
        scheduler: Arc<VerificationScheduler<R>>,
        gateway:   Arc<dyn Gateway>,
        clock:     SharedClock,
    ) -> Self {
        Self { repo, scheduler, gateway, clock }
    }

    pub fn list_pending_review(&self, limit: usize) -> EngineResult<Vec<ReviewItem>> {
        self.repo.transaction(|tx| {
            let mut items = Vec::new();
            for attribution in tx.list_pending_reviews(limit)? {
                let user      = tx.user(attribution.joined_user_id)?;
                let owner = match tx.affiliate(attribution.affiliate_id)? {
                    Some(a) => tx.user(a.owner_user_id)?,
                    None => None,
                };
                items.push(ReviewItem { attribution, user, owner });
            }
            Ok(items)
        })
    }

    pub async fn authorize(&self, actor_id: i64) -> EngineResult<()> {
        if self.gateway.is_admin(actor_id).await {
            Ok(())
        } else {
            warn!(actor_id, "review action rejected: not an administrator");
            Err(EngineError::Unauthorized(format!("user {} is not an administrator", actor_id)))
        }
    }

    /// Confirm the referral: verified now, note cleared.
    pub async fn verify(&self, actor_id: i64, attribution_id: i64) -> EngineResult<Attribution> {
        self.authorize(actor_id).await?;
        let now = self.clock.now();
        let attribution = self.repo.transaction(|tx| {
            let current = tx.require_attribution(attribution_id)?;
            tx.update_attribution_status(current.id, AttributionStatus::Verified, Some(now))?;
            let updated = tx.clear_attribution_note(current.id)?;
            tx.log_event(
                EventKind::Promote,
                updated.joined_user_id,
                Some(updated.affiliate_id),
                json!({ "attribution_id": updated.id, "source": "review", "actor_id": actor_id }),
                now,
            )?;
            Ok(updated)
        })?;
        self.scheduler.cancel(attribution.joined_user_id);
        info!(actor_id, attribution_id, user_id = attribution.joined_user_id, "attribution verified by review");
        Ok(attribution)
    }

    /// Reject the referral: revoked, `manual_revoke` merged into the note.
    /// Any earlier verification timestamp is kept.
    pub async fn revoke(&self, actor_id: i64, attribution_id: i64) -> EngineResult<Attribution> {
        self.authorize(actor_id).await?;
        let now = self.clock.now();
        let attribution = self.repo.transaction(|tx| {
            let current = tx.require_attribution(attribution_id)?;
            tx.update_attribution_status(current.id, AttributionStatus::Revoked, current.verified_at)?;
            let updated = tx.merge_attribution_note(current.id, RiskReason::ManualRevoke)?;
            tx.log_event(
                EventKind::Revoke,
                updated.joined_user_id,
                Some(updated.affiliate_id),
                json!({ "attribution_id": updated.id, "source": "review", "actor_id": actor_id }),
                now,
            )?;
            Ok(updated)
        })?;
        self.scheduler.cancel(attribution.joined_user_id);
        info!(actor_id, attribution_id, user_id = attribution.joined_user_id, "attribution revoked by review");
        Ok(attribution)
    }

    pub async fn apply(&self, actor_id: i64, callback: ReviewCallback) -> EngineResult<Attribution> {
        match callback.action {
            ReviewAction::Verify => self.verify(actor_id, callback.attribution_id).await,
            ReviewAction::Revoke => self.revoke(actor_id, callback.attribution_id).await,
        }
    }
}
