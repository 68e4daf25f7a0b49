// refwatch/src/engine/membership.rs
//
// Join / leave orchestration.
//
//   join  → heuristics (burst window updated first) → one transaction:
//           upsert user, gate on the invite, create the attribution, reopen
//           the subnet on a burst, append the join event → then arm or
//           disarm timers for everyone touched.
//   leave → one transaction: upsert user, revoke a live attribution keeping
//           its verification timestamp, append the leave event → disarm.
//
// Timer calls happen only after commit, so a rolled-back join never leaves
// a timer armed for an attribution that does not exist.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::engine::heuristics::Heuristics;
use crate::engine::scheduler::VerificationScheduler;
use crate::error::{EngineError, EngineResult};
use crate::events::{AttributionStatus, EventKind, JoinEvent, LeaveEvent, NewAttribution};
use crate::state::store::{extract_link_code, Repository};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Attributed {
        attribution_id: i64,
        affiliate_id:   i64,
        flagged:        bool,
        /// Other users whose attributions the burst reopened.
        reopened:       Vec<i64>,
    },
    /// The user already has an attribution; it is left untouched.
    AlreadyAttributed {
        attribution_id: i64,
        status:         AttributionStatus,
    },
    NoInvite,
    UnknownInvite,
    InactiveAffiliate,
    SelfReferral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Revoked { attribution_id: i64 },
    NotLive,
    Unattributed,
}

pub struct MembershipHandler<R: Repository> {
    repo:       Arc<R>,
    heuristics: Heuristics,
    scheduler:  Arc<VerificationScheduler<R>>,
}

impl<R: Repository> MembershipHandler<R> {
    pub fn new(repo: Arc<R>, heuristics: Heuristics, scheduler: Arc<VerificationScheduler<R>>) -> Self {
        Self { repo, heuristics, scheduler }
    }

    pub fn handle_join(&self, join: &JoinEvent) -> EngineResult<JoinOutcome> {
        let link = join.invite_reference.trim();
        if link.is_empty() {
            return Ok(JoinOutcome::NoInvite);
        }
        let code       = extract_link_code(link);
        let assessment = self.heuristics.assess(join);
        let user_id    = join.target_user_id;
        let since      = join.timestamp - self.heuristics.burst_window();

        let result = self.repo.transaction(|tx| {
            tx.upsert_user(
                user_id,
                join.username.as_deref(),
                join.first_name.as_deref(),
                join.last_name.as_deref(),
                join.timestamp,
            )?;

            let Some(affiliate) = tx.affiliate_by_code(&code)? else {
                return Ok(JoinOutcome::UnknownInvite);
            };
            if affiliate.owner_user_id == user_id {
                return Ok(JoinOutcome::SelfReferral);
            }
            if !affiliate.is_active {
                return Ok(JoinOutcome::InactiveAffiliate);
            }
            if let Some(existing) = tx.attribution_by_user(user_id)? {
                return Ok(JoinOutcome::AlreadyAttributed {
                    attribution_id: existing.id,
                    status:         existing.status,
                });
            }

            let attribution = tx.create_attribution(NewAttribution {
                affiliate_id:   affiliate.id,
                joined_user_id: user_id,
                joined_at:      join.timestamp,
                source_ip:      join.source_ip.clone(),
                source_subnet:  assessment.subnet.clone(),
                note:           assessment.reasons.clone(),
            })?;

            let mut reopened = Vec::new();
            if let (true, Some(subnet)) = (assessment.is_burst(), assessment.subnet.as_deref()) {
                reopened = tx.flag_subnet_burst(subnet, since)?;
                reopened.retain(|&u| u != user_id);
            }

            let flags: Vec<String> = assessment.reasons.reasons().map(|r| r.to_string()).collect();
            tx.log_event(
                EventKind::Join,
                user_id,
                Some(affiliate.id),
                json!({
                    "invite_link":    link,
                    "link_code":      code,
                    "attribution_id": attribution.id,
                    "flags":          flags,
                    "source_ip":      join.source_ip,
                    "source_subnet":  assessment.subnet,
                }),
                join.timestamp,
            )?;

            Ok(JoinOutcome::Attributed {
                attribution_id: attribution.id,
                affiliate_id:   affiliate.id,
                flagged:        !assessment.is_clean(),
                reopened,
            })
        });

        let outcome = match result {
            Ok(outcome) => outcome,
            // lost a race with a concurrent creator; same as already attributed
            Err(e) if e.is_conflict() => {
                debug!(user_id, error = %e, "attribution conflict");
                let existing = self.repo.transaction(|tx| tx.attribution_by_user(user_id))?.ok_or_else(|| {
                    EngineError::NotFound(format!("attribution for user {}", user_id))
                })?;
                JoinOutcome::AlreadyAttributed { attribution_id: existing.id, status: existing.status }
            }
            Err(e) => return Err(e),
        };

        match outcome {
            JoinOutcome::Attributed { attribution_id, affiliate_id, flagged, ref reopened } => {
                if flagged {
                    self.scheduler.cancel(user_id);
                } else {
                    self.scheduler.schedule(user_id);
                }
                for &other in reopened {
                    self.scheduler.cancel(other);
                }
                if reopened.is_empty() {
                    info!(user_id, attribution_id, affiliate_id, flagged, "join attributed");
                } else {
                    warn!(
                        user_id, attribution_id, affiliate_id,
                        subnet   = ?assessment.subnet,
                        reopened = reopened.len(),
                        "join attributed; subnet burst reopened attributions"
                    );
                }
            }
            ref other => debug!(user_id, outcome = ?other, code = %code, "join not attributed"),
        }
        Ok(outcome)
    }

    pub fn handle_leave(&self, leave: &LeaveEvent) -> EngineResult<LeaveOutcome> {
        let user_id = leave.target_user_id;
        let outcome = self.repo.transaction(|tx| {
            tx.upsert_user(
                user_id,
                leave.username.as_deref(),
                leave.first_name.as_deref(),
                leave.last_name.as_deref(),
                leave.timestamp,
            )?;
            let Some(attribution) = tx.attribution_by_user(user_id)? else {
                return Ok(LeaveOutcome::Unattributed);
            };
            if !attribution.status.is_live() {
                return Ok(LeaveOutcome::NotLive);
            }
            tx.update_attribution_status(attribution.id, AttributionStatus::Revoked, attribution.verified_at)?;
            tx.log_event(
                EventKind::Leave,
                user_id,
                Some(attribution.affiliate_id),
                json!({
                    "reason":         leave.reason.as_deref().unwrap_or("left"),
                    "attribution_id": attribution.id,
                }),
                leave.timestamp,
            )?;
            Ok(LeaveOutcome::Revoked { attribution_id: attribution.id })
        })?;

        match outcome {
            LeaveOutcome::Revoked { attribution_id } => {
                self.scheduler.cancel(user_id);
                info!(user_id, attribution_id, "attribution revoked on leave");
            }
            other => debug!(user_id, outcome = ?other, "leave without live attribution"),
        }
        Ok(outcome)
    }
}
