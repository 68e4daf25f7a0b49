// refwatch/src/admin.rs
//
// Command surface: parses slash commands and review button presses, applies
// them through the store / leaderboard / review workflow, and replies via
// the gateway.
//
// Affiliate commands (/mylink, /deactivate, /reactivate, /mystats) only work
// in private chats. Admin commands check rights through the gateway first.
// A handful of cheap commands share a per-user rolling rate limit.
//
// Handler errors never escape: Unauthorized becomes the admin-only reply,
// everything else the generic apology.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::engine::leaderboard::{
    clamp_limit, LeaderboardCache, LeaderboardWindow, RankedAffiliate, DEFAULT_LIMIT,
};
use crate::engine::review::{CallbackError, ReviewAction, ReviewCallback, ReviewWorkflow, CALLBACK_PREFIX, DEFAULT_REVIEW_LIMIT};
use crate::error::{EngineError, EngineResult};
use crate::events::{Actor, CallbackQuery, CommandMessage, StatusCounts, UserRecord};
use crate::gateway::{CallbackAnswer, Gateway, OutboundMessage};
use crate::state::store::{extract_link_code, Repository, UnitOfWork};

pub const APOLOGY:          &str = "Something went wrong. Please try again later.";
pub const ADMIN_ONLY:       &str = "Only chat administrators can use this command.";
pub const TOO_MANY:         &str = "Too many requests. Please try again shortly.";
pub const RATE_LIMIT_CALLS: usize = 5;
pub const RATE_LIMIT_SECS:  i64 = 60;

const LINK_INSTRUCTIONS: &str = "Share this link to attribute new members to you.\n\
                                 Use /deactivate to pause attribution or /reactivate to resume.";
const NO_LINK_YET: &str = "You do not have an affiliate link yet. Send /mylink to create one.";
const NEWEST_AFFILIATES: usize = 5;
const NO_LINK_FOUND: &str = "No affiliate link found. Use /mylink to create one.";

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

// ── Command parsing ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    MyLink,
    Deactivate,
    Reactivate,
    MyStats,
    Top { window: LeaderboardWindow, limit: usize },
    Affiliates,
    PauseLinks,
    ResumeLinks,
    RebuildCounts,
    ReviewPending,
    WhoInvited { target: Option<String> },
    Unknown(String),
}

impl Command {
    /// None when the text is not a slash command.
    pub fn parse(text: &str) -> Option<Self> {
        let body = text.trim().strip_prefix('/')?;
        let (head, args) = match body.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (body, ""),
        };
        // "/top@refwatch_bot" addresses a specific bot
        let name = head.split('@').next().unwrap_or_default().to_ascii_lowercase();

        Some(match name.as_str() {
            "ping" => Self::Ping,
            "mylink" => Self::MyLink,
            "deactivate" => Self::Deactivate,
            "reactivate" => Self::Reactivate,
            "mystats" => Self::MyStats,
            "top" => Self::parse_top(args),
            "affiliates" => Self::Affiliates,
            "pause_links" => Self::PauseLinks,
            "resume_links" => Self::ResumeLinks,
            "rebuild_counts" => Self::RebuildCounts,
            "review_pending" => Self::ReviewPending,
            "who_invited" => Self::WhoInvited {
                target: (!args.is_empty()).then(|| args.to_string()),
            },
            other => Self::Unknown(other.to_string()),
        })
    }

    /// `/top [7d|30d] [N]`; a bad N keeps the default.
    fn parse_top(args: &str) -> Self {
        let mut tokens = args.split_whitespace().peekable();
        let mut window = LeaderboardWindow::All;
        if let Some(first) = tokens.peek() {
            match LeaderboardWindow::parse(first) {
                Some(w @ (LeaderboardWindow::SevenDays | LeaderboardWindow::ThirtyDays)) => {
                    window = w;
                    tokens.next();
                }
                _ => {}
            }
        }
        let limit = tokens
            .next()
            .and_then(|t| t.parse::<i64>().ok())
            .map(clamp_limit)
            .unwrap_or(DEFAULT_LIMIT);
        Self::Top { window, limit }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::MyLink => "mylink",
            Self::Deactivate => "deactivate",
            Self::Reactivate => "reactivate",
            Self::MyStats => "mystats",
            Self::Top { .. } => "top",
            Self::Affiliates => "affiliates",
            Self::PauseLinks => "pause_links",
            Self::ResumeLinks => "resume_links",
            Self::RebuildCounts => "rebuild_counts",
            Self::ReviewPending => "review_pending",
            Self::WhoInvited { .. } => "who_invited",
            Self::Unknown(name) => name.as_str(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Self::Ping | Self::MyLink | Self::Deactivate | Self::Reactivate | Self::MyStats | Self::Top { .. }
        )
    }

    pub fn is_private_only(&self) -> bool {
        matches!(self, Self::MyLink | Self::Deactivate | Self::Reactivate | Self::MyStats)
    }

    pub fn is_admin_only(&self) -> bool {
        matches!(
            self,
            Self::Affiliates
                | Self::PauseLinks
                | Self::ResumeLinks
                | Self::RebuildCounts
                | Self::ReviewPending
                | Self::WhoInvited { .. }
        )
    }
}

// ── Rate limiter ──────────────────────────────────────────────────────────────

/// Rolling-window limiter: at most `max_calls` per user per `window`.
/// Denied calls are not counted.
pub struct RateLimiter {
    buckets:   DashMap<i64, VecDeque<DateTime<Utc>>>,
    window:    Duration,
    max_calls: usize,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self { buckets: DashMap::new(), window, max_calls }
    }

    pub fn hit(&self, user_id: i64, now: DateTime<Utc>) -> bool {
        let start = now - self.window;
        let mut bucket = self.buckets.entry(user_id).or_default();
        while bucket.front().is_some_and(|&t| t <= start) {
            bucket.pop_front();
        }
        if bucket.len() < self.max_calls {
            bucket.push_back(now);
            true
        } else {
            false
        }
    }
}

impl RateLimiter {
    /// Drop buckets whose newest call has aged out of the window.
    pub fn prune(&self, now: DateTime<Utc>) {
        let start = now - self.window;
        self.buckets.retain(|_, q| q.back().is_some_and(|&last| last > start));
    }

    pub fn n_users(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_CALLS, Duration::seconds(RATE_LIMIT_SECS))
    }
}

// ── Handler ───────────────────────────────────────────────────────────────────

pub struct CommandHandler<R: Repository> {
    repo:        Arc<R>,
    leaderboard: Arc<LeaderboardCache<R>>,
    review:      Arc<ReviewWorkflow<R>>,
    gateway:     Arc<dyn Gateway>,
    clock:       SharedClock,
    limiter:     RateLimiter,
}

impl<R: Repository> CommandHandler<R> {
    pub fn new(
        repo:        Arc<R>,
        leaderboard: Arc<LeaderboardCache<R>>,
        review:      Arc<ReviewWorkflow<R>>,
        gateway:     Arc<dyn Gateway>,
        clock:       SharedClock,
    ) -> Self {
        Self { repo, leaderboard, review, gateway, clock, limiter: RateLimiter::default() }
    }

    /// Periodically evict idle rate-limit buckets.
    pub async fn housekeeping_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(RATE_LIMIT_SECS as u64)).await;
            let before = self.limiter.n_users();
            self.limiter.prune(self.clock.now());
            debug!(before, after = self.limiter.n_users(), "pruned rate-limit buckets");
        }
    }

    pub async fn handle_command(&self, msg: &CommandMessage) {
        let Some(command) = Command::parse(&msg.text) else {
            info!(chat_id = msg.chat_id, from_user = msg.from.id, "message received with no command handler");
            return;
        };
        if matches!(command, Command::Unknown(_)) || (command.is_private_only() && !msg.private) {
            info!(
                chat_id   = msg.chat_id,
                from_user = msg.from.id,
                command   = command.name(),
                private   = msg.private,
                "message received with no command handler"
            );
            return;
        }
        if command.is_rate_limited() && !self.limiter.hit(msg.from.id, self.clock.now()) {
            warn!(user_id = msg.from.id, command = command.name(), "rate limited");
            self.send(OutboundMessage::text(msg.chat_id, TOO_MANY)).await;
            return;
        }

        let reply = match self.execute(&command, msg).await {
            Ok(reply) => reply,
            Err(EngineError::Unauthorized(_)) => OutboundMessage::text(msg.chat_id, ADMIN_ONLY),
            Err(e) => {
                error!(command = command.name(), user_id = msg.from.id, error = %e, "command failed");
                OutboundMessage::text(msg.chat_id, APOLOGY)
            }
        };
        self.send(reply).await;
    }

    async fn send(&self, message: OutboundMessage) {
        let chat_id = message.chat_id;
        if let Err(e) = self.gateway.send_message(message).await {
            error!(chat_id, error = %e, "reply delivery failed");
        }
    }

    async fn execute(&self, command: &Command, msg: &CommandMessage) -> EngineResult<OutboundMessage> {
        if command.is_admin_only() {
            self.review.authorize(msg.from.id).await?;
        }
        let chat = msg.chat_id;
        let text = match command {
            Command::Ping => "pong".to_string(),
            Command::MyLink => self.my_link(&msg.from).await?,
            Command::Deactivate => self.set_own_link_active(msg.from.id, false)?,
            Command::Reactivate => self.set_own_link_active(msg.from.id, true)?,
            Command::MyStats => self.my_stats(msg.from.id)?,
            Command::Top { window, limit } => return self.top(chat, *window, *limit),
            Command::Affiliates => self.affiliates_overview()?,
            Command::PauseLinks => {
                let n = self.repo.transaction(|tx| tx.bulk_set_active(false))?;
                info!(actor_id = msg.from.id, affiliates = n, "all links paused");
                format!("Paused {} affiliate link(s). Existing attributions remain intact.", n)
            }
            Command::ResumeLinks => {
                let n = self.repo.transaction(|tx| tx.bulk_set_active(true))?;
                info!(actor_id = msg.from.id, affiliates = n, "all links resumed");
                format!("Reactivated {} affiliate link(s).", n)
            }
            Command::RebuildCounts => self.rebuild_counts()?,
            Command::ReviewPending => return self.review_pending(chat),
            Command::WhoInvited { target } => self.who_invited(target.as_deref())?,
            Command::Unknown(name) => {
                return Err(EngineError::InvalidInput(format!("unknown command {}", name)))
            }
        };
        Ok(OutboundMessage::text(chat, text))
    }

    // ── Affiliate commands ────────────────────────────────────────────────────

    async fn my_link(&self, actor: &Actor) -> EngineResult<String> {
        enum Found {
            Existing { link: String, code: String, reactivated: bool },
            Missing,
        }

        let now = self.clock.now();
        let found = self.repo.transaction(|tx| {
            upsert_actor(tx, actor, now)?;
            Ok(match tx.affiliate_by_owner(actor.id)? {
                Some(affiliate) => {
                    let reactivated = !affiliate.is_active;
                    if reactivated {
                        tx.set_affiliate_active(affiliate.id, true)?;
                    }
                    Found::Existing { link: affiliate.invite_link, code: affiliate.link_code, reactivated }
                }
                None => Found::Missing,
            })
        })?;

        let (headline, link, code) = match found {
            Found::Existing { link, code, reactivated: true } => {
                info!(user_id = actor.id, "affiliate link reactivated via /mylink");
                ("Your affiliate link has been reactivated.", link, code)
            }
            Found::Existing { link, code, reactivated: false } => ("Your affiliate link is active.", link, code),
            Found::Missing => {
                let link = match self.gateway.create_invite_link(&format!("AFF_{}", actor.id)).await {
                    Ok(link) => link,
                    Err(e) => {
                        warn!(user_id = actor.id, error = %e, "invite link creation failed");
                        return Ok("I could not create your invite link. \
                                   Ensure the bot has permission to manage invite links."
                            .to_string());
                    }
                };
                let affiliate = self.repo.transaction(|tx| {
                    upsert_actor(tx, actor, now)?;
                    tx.create_affiliate(actor.id, &link, now)
                })?;
                info!(user_id = actor.id, affiliate_id = affiliate.id, "affiliate created");
                ("Your affiliate link is ready!", affiliate.invite_link, affiliate.link_code)
            }
        };

        let code = if code.is_empty() { extract_link_code(&link) } else { code };
        Ok(format!("{}\n{}\nCode: `{}`\n\n{}", headline, link, code, LINK_INSTRUCTIONS))
    }

    fn set_own_link_active(&self, user_id: i64, active: bool) -> EngineResult<String> {
        self.repo.transaction(|tx| {
            let Some(affiliate) = tx.affiliate_by_owner(user_id)? else {
                return Ok(NO_LINK_YET.to_string());
            };
            Ok(match (affiliate.is_active, active) {
                (false, false) => "Your affiliate link is already deactivated.".to_string(),
                (true, false) => {
                    tx.set_affiliate_active(affiliate.id, false)?;
                    "Your affiliate link has been deactivated. \
                     Use /reactivate when you are ready to share it again."
                        .to_string()
                }
                (true, true) => format!("Your affiliate link is already active.\n{}", affiliate.invite_link),
                (false, true) => {
                    tx.set_affiliate_active(affiliate.id, true)?;
                    format!("Your affiliate link is active again!\n{}", affiliate.invite_link)
                }
            })
        })
    }

    fn my_stats(&self, user_id: i64) -> EngineResult<String> {
        self.repo.transaction(|tx| {
            let Some(affiliate) = tx.affiliate_by_owner(user_id)? else {
                return Ok(NO_LINK_FOUND.to_string());
            };
            let stats = tx.affiliate_stats(affiliate.id)?;
            let mut text = format!(
                "Your referral stats:\nVerified: {}\nPending: {}\nRevoked: {}\nLink: {}",
                stats.verified, stats.pending, stats.revoked, affiliate.invite_link
            );
            if let Some(last) = tx.events_for_affiliate(affiliate.id, 1)?.first() {
                text.push_str(&format!("\nLast activity: {} at {}", last.kind, format_timestamp(last.created_at)));
            }
            Ok(text)
        })
    }

    // ── Leaderboard ───────────────────────────────────────────────────────────

    fn top(&self, chat: i64, window: LeaderboardWindow, limit: usize) -> EngineResult<OutboundMessage> {
        let rows = self.leaderboard.top_affiliates(window, limit, true)?;
        if rows.is_empty() {
            return Ok(OutboundMessage::text(chat, "No verified referrals yet."));
        }
        let footer = self
            .leaderboard
            .generated_at(window)
            .map(|at| format!("\n\nCached: {}", format_timestamp(at)))
            .unwrap_or_default();
        let text = format!("<pre>{}</pre>{}", escape_html(&format_table(&rows)), footer);
        Ok(OutboundMessage::text(chat, text).html())
    }

    fn rebuild_counts(&self) -> EngineResult<String> {
        self.leaderboard.recompute()?;
        let lines: Vec<String> = LeaderboardWindow::ALL
            .iter()
            .map(|w| {
                let label = if *w == LeaderboardWindow::All { "all_time" } else { w.key() };
                let at = self.leaderboard.generated_at(*w).map(format_timestamp);
                format!("{}: {}", label, at.as_deref().unwrap_or("unknown"))
            })
            .collect();
        Ok(format!("Leaderboard counts rebuilt.\n{}", lines.join("\n")))
    }

    // ── Admin overview / lookups ──────────────────────────────────────────────

    fn affiliates_overview(&self) -> EngineResult<String> {
        let now = self.clock.now();
        let (summary, last_7d, last_30d, newest) = self.repo.transaction(|tx| {
            let mut newest = Vec::new();
            for affiliate in tx.list_affiliates(true)?.into_iter().take(NEWEST_AFFILIATES) {
                let owner = tx
                    .user(affiliate.owner_user_id)?
                    .map(|u| u.label())
                    .unwrap_or_else(|| format!("Affiliate #{}", affiliate.id));
                newest.push(format!("{} {}", owner, affiliate.invite_link));
            }
            Ok((
                tx.count_affiliates()?,
                tx.count_by_status_since(now - Duration::days(7))?,
                tx.count_by_status_since(now - Duration::days(30))?,
                newest,
            ))
        })?;
        let mut text = format!(
            "Affiliate overview:\nActive: {} of {} total\nInactive: {}\n{}\n{}",
            summary.active,
            summary.total,
            summary.inactive,
            status_summary("Last 7d", &last_7d),
            status_summary("Last 30d", &last_30d),
        );
        if !newest.is_empty() {
            text.push_str("\nNewest active:\n");
            text.push_str(&newest.join("\n"));
        }
        Ok(text)
    }

    fn review_pending(&self, chat: i64) -> EngineResult<OutboundMessage> {
        let items = self.review.list_pending_review(DEFAULT_REVIEW_LIMIT)?;
        if items.is_empty() {
            return Ok(OutboundMessage::text(chat, "No pending suspected attributions."));
        }
        let mut lines   = Vec::with_capacity(items.len());
        let mut buttons = Vec::with_capacity(items.len() * 2);
        for item in &items {
            let note = if item.attribution.note.is_empty() {
                "pending_review".to_string()
            } else {
                item.attribution.note.to_string()
            };
            lines.push(format!(
                "#{} {} via {} [{}] at {}",
                item.attribution.id,
                item.user_label(),
                item.affiliate_label(),
                note,
                format_timestamp(item.attribution.joined_at),
            ));
            buttons.extend(item.buttons());
        }
        Ok(OutboundMessage::text(chat, lines.join("\n")).with_buttons(buttons))
    }

    fn who_invited(&self, target: Option<&str>) -> EngineResult<String> {
        let Some(target) = target else {
            return Ok("Usage: /who_invited <@username|user_id>".to_string());
        };
        self.repo.transaction(|tx| {
            let bare = target.trim_start_matches('@');
            let user = match bare.parse::<i64>() {
                Ok(id) if bare.chars().all(|c| c.is_ascii_digit()) => tx.user(id)?,
                _ => tx.user_by_username(target)?,
            };
            let Some(user) = user else {
                return Ok("No records found for that user.".to_string());
            };
            let Some(attribution) = tx.attribution_by_user(user.id)? else {
                return Ok("No affiliate attribution found for that user.".to_string());
            };
            let owner = match tx.affiliate(attribution.affiliate_id)? {
                Some(affiliate) => tx.user(affiliate.owner_user_id)?,
                None => None,
            };
            let inviter = owner
                .map(|o| o.label())
                .unwrap_or_else(|| format!("Affiliate #{}", attribution.affiliate_id));
            let verified = attribution
                .verified_at
                .map(|at| format!(", verified at {}", format_timestamp(at)))
                .unwrap_or_default();
            let mut text = format!(
                "{} was invited by {} (status: {}{}).",
                user.label(),
                inviter,
                attribution.status,
                verified
            );
            if let Some(last) = tx.events_for_user(user.id, 1)?.first() {
                text.push_str(&format!("\nLast event: {} at {}", last.kind, format_timestamp(last.created_at)));
            }
            Ok(text)
        })
    }

    // ── Review buttons ────────────────────────────────────────────────────────

    pub async fn handle_callback(&self, query: &CallbackQuery) {
        if !query.data.starts_with(CALLBACK_PREFIX) {
            info!(user_id = query.from.id, data = %query.data, "callback with no handler");
            return;
        }
        let (text, alert) = self.review_callback(query).await;
        let answer = CallbackAnswer { user_id: query.from.id, text, show_alert: alert };
        if let Err(e) = self.gateway.answer_callback(answer).await {
            error!(user_id = query.from.id, error = %e, "callback answer failed");
        }
    }

    async fn review_callback(&self, query: &CallbackQuery) -> (String, bool) {
        let actor = query.from.id;
        if !self.gateway.is_admin(actor).await {
            return ("Admin only.".into(), true);
        }
        let callback = match ReviewCallback::parse(&query.data) {
            Ok(cb) => cb,
            Err(CallbackError::Malformed) => return ("Invalid data.".into(), true),
            Err(CallbackError::UnsupportedAction { action, attribution_id }) => {
                return match self.repo.transaction(|tx| tx.attribution(attribution_id)) {
                    Ok(None) => ("Attribution not found.".into(), true),
                    Ok(Some(_)) => {
                        warn!(actor, attribution_id, action = %action, "unsupported review action");
                        ("Unsupported action.".into(), true)
                    }
                    Err(e) => {
                        error!(actor, attribution_id, error = %e, "review lookup failed");
                        (APOLOGY.into(), true)
                    }
                };
            }
        };
        match self.review.apply(actor, callback).await {
            Ok(_) => {
                let verb = match callback.action {
                    ReviewAction::Verify => "verified",
                    ReviewAction::Revoke => "revoked",
                };
                (format!("Attribution #{} {}.", callback.attribution_id, verb), false)
            }
            Err(EngineError::NotFound(_)) => ("Attribution not found.".into(), true),
            Err(EngineError::Unauthorized(_)) => ("Admin only.".into(), true),
            Err(e) => {
                error!(actor, attribution_id = callback.attribution_id, error = %e, "review action failed");
                (APOLOGY.into(), true)
            }
        }
    }
}

fn upsert_actor(tx: &mut dyn UnitOfWork, actor: &Actor, at: DateTime<Utc>) -> EngineResult<UserRecord> {
    tx.upsert_user(
        actor.id,
        actor.username.as_deref(),
        actor.first_name.as_deref(),
        actor.last_name.as_deref(),
        at,
    )
}

fn format_table(rows: &[RankedAffiliate]) -> String {
    let mut lines = vec!["Rank Affiliate            Verified".to_string()];
    for (index, row) in rows.iter().enumerate() {
        lines.push(format!("{:>4} {:<20.20} {:>9}", index + 1, row.label(), row.verified));
    }
    lines.join("\n")
}

fn status_summary(label: &str, counts: &StatusCounts) -> String {
    format!("{}: V {} | P {} | R {}", label, counts.verified, counts.pending, counts.revoked)
}
