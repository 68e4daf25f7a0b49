// refwatch/src/engine/leaderboard.rs
//
// Leaderboard cache: affiliate id → verified attribution count, per window.
//
// Each window's mapping is replaced wholesale on recompute (an Arc swap under
// a short write lock), so readers always see one consistent generation.
// The cache is derived data only; dropping it costs staleness, never
// correctness, and every read falls back to a live aggregate when a window
// has not been computed yet.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::error::EngineResult;
use crate::events::{Affiliate, UserRecord};
use crate::state::store::{Repository, UnitOfWork};

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT:     usize = 50;
pub const ROLLUP_INTERVAL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaderboardWindow {
    All,
    SevenDays,
    ThirtyDays,
}

impl LeaderboardWindow {
    pub const ALL: [LeaderboardWindow; 3] = [Self::All, Self::SevenDays, Self::ThirtyDays];

    pub fn key(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::SevenDays => "7d",
            Self::ThirtyDays => "30d",
        }
    }

    /// Unknown keys give None; callers fall back to `All`.
    pub fn parse(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Self::All),
            "7d" => Some(Self::SevenDays),
            "30d" => Some(Self::ThirtyDays),
            _ => None,
        }
    }

    pub fn span(&self) -> Option<chrono::Duration> {
        match self {
            Self::All => None,
            Self::SevenDays => Some(chrono::Duration::days(7)),
            Self::ThirtyDays => Some(chrono::Duration::days(30)),
        }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.span().map(|span| now - span)
    }
}

impl fmt::Display for LeaderboardWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

pub fn clamp_limit(limit: i64) -> usize {
    limit.clamp(1, MAX_LIMIT as i64) as usize
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedAffiliate {
    pub affiliate: Affiliate,
    pub owner:     Option<UserRecord>,
    pub verified:  u64,
}

impl RankedAffiliate {
    pub fn label(&self) -> String {
        match self.owner {
            Some(ref owner) => owner.label(),
            None => format!("Affiliate #{}", self.affiliate.id),
        }
    }
}

#[derive(Debug)]
struct WindowCounts {
    counts:       HashMap<i64, u64>,
    generated_at: DateTime<Utc>,
}

/// Count-descending, ties by ascending affiliate id.
fn rank(counts: &HashMap<i64, u64>, limit: usize) -> Vec<(i64, u64)> {
    let mut ranked: Vec<(i64, u64)> = counts.iter().map(|(&id, &n)| (id, n)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

/// Resolve display records for exactly the ranked ids, keeping rank order.
/// Affiliates that vanished since the counts were taken are skipped.
fn resolve(tx: &dyn UnitOfWork, ranked: Vec<(i64, u64)>) -> EngineResult<Vec<RankedAffiliate>> {
    let mut rows = Vec::with_capacity(ranked.len());
    for (affiliate_id, verified) in ranked {
        let Some(affiliate) = tx.affiliate(affiliate_id)? else {
            continue;
        };
        let owner = tx.user(affiliate.owner_user_id)?;
        rows.push(RankedAffiliate { affiliate, owner, verified });
    }
    Ok(rows)
}

pub struct LeaderboardCache<R: Repository> {
    repo:    Arc<R>,
    clock:   SharedClock,
    windows: RwLock<HashMap<LeaderboardWindow, Arc<WindowCounts>>>,
}

impl<R: Repository> LeaderboardCache<R> {
    pub fn new(repo: Arc<R>, clock: SharedClock) -> Self {
        Self { repo, clock, windows: RwLock::new(HashMap::new()) }
    }

    /// Rebuild every window from the attribution ledger.
    pub fn recompute(&self) -> EngineResult<()> {
        for window in LeaderboardWindow::ALL {
            let now    = self.clock.now();
            let counts = self.repo.transaction(|tx| tx.verified_counts(window.cutoff(now)))?;
            let n      = counts.len();
            self.windows
                .write()
                .insert(window, Arc::new(WindowCounts { counts, generated_at: now }));
            info!(window = %window, affiliates = n, "leaderboard window recomputed");
        }
        Ok(())
    }

    pub fn top_affiliates(
        &self,
        window:    LeaderboardWindow,
        limit:     usize,
        use_cache: bool,
    ) -> EngineResult<Vec<RankedAffiliate>> {
        let limit  = limit.clamp(1, MAX_LIMIT);
        let cached = if use_cache { self.windows.read().get(&window).cloned() } else { None };

        match cached {
            Some(snapshot) => {
                let ranked = rank(&snapshot.counts, limit);
                self.repo.transaction(|tx| resolve(tx, ranked))
            }
            None => {
                let cutoff = window.cutoff(self.clock.now());
                self.repo.transaction(|tx| {
                    let counts = tx.verified_counts(cutoff)?;
                    resolve(tx, rank(&counts, limit))
                })
            }
        }
    }

    pub fn generated_at(&self, window: LeaderboardWindow) -> Option<DateTime<Utc>> {
        self.windows.read().get(&window).map(|w| w.generated_at)
    }

    /// Recompute, then log the integrity report. Errors are logged only.
    pub fn refresh(&self) {
        if let Err(e) = self.recompute() {
            error!(error = %e, "leaderboard recompute failed");
            return;
        }
        match self.repo.transaction(|tx| tx.integrity_report()) {
            Ok(report) if report.inactive_affiliates_with_verified > 0 || report.dangling_attributions > 0 => {
                warn!(
                    inactive_with_verified = report.inactive_affiliates_with_verified,
                    dangling               = report.dangling_attributions,
                    "integrity report"
                );
            }
            Ok(_) => info!("integrity report clean"),
            Err(e) => error!(error = %e, "integrity report failed"),
        }
    }

    /// Periodic rollup. The eager startup recompute is the caller's job.
    pub async fn rollup_loop(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.refresh();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{AttributionStatus, NewAttribution, RiskNote};
    use crate::state::store::MemoryRepository;
    use chrono::{Duration as Span, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    struct Seeder {
        repo:   Arc<MemoryRepository>,
        joiner: i64,
    }

    impl Seeder {
        fn affiliate(&self, owner: i64) -> i64 {
            self.repo
                .transaction(|tx| {
                    let handle = format!("owner{}", owner);
                    tx.upsert_user(owner, Some(handle.as_str()), None, None, t0())?;
                    tx.create_affiliate(owner, &format!("https://t.me/+aff{}", owner), t0())
                })
                .unwrap()
                .id
        }

        fn verified(&mut self, affiliate_id: i64, joined_at: DateTime<Utc>) {
            self.joiner += 1;
            let user = self.joiner;
            self.repo
                .transaction(|tx| {
                    tx.upsert_user(user, None, Some("Joiner"), None, joined_at)?;
                    let a = tx.create_attribution(NewAttribution {
                        affiliate_id,
                        joined_user_id: user,
                        joined_at,
                        source_ip: None,
                        source_subnet: None,
                        note: RiskNote::new(),
                    })?;
                    tx.update_attribution_status(a.id, AttributionStatus::Verified, Some(joined_at))
                })
                .unwrap();
        }
    }

    fn seeded() -> (Arc<MemoryRepository>, Arc<ManualClock>, Vec<i64>) {
        let repo = Arc::new(MemoryRepository::new());
        let mut seeder = Seeder { repo: Arc::clone(&repo), joiner: 1000 };
        let ids: Vec<i64> = (1..=5).map(|owner| seeder.affiliate(owner)).collect();

        // 7-day counts: a=5, b=4 (one of them six days old), c=3, d=2; e has
        // six verified joins, all ten days old.
        for _ in 0..5 { seeder.verified(ids[0], t0() - Span::hours(1)); }
        for _ in 0..3 { seeder.verified(ids[1], t0() - Span::hours(2)); }
        seeder.verified(ids[1], t0() - Span::days(6));
        for _ in 0..3 { seeder.verified(ids[2], t0() - Span::days(1)); }
        for _ in 0..2 { seeder.verified(ids[3], t0() - Span::days(2)); }
        for _ in 0..6 { seeder.verified(ids[4], t0() - Span::days(10)); }

        (repo, ManualClock::new(t0()), ids)
    }

    fn counts(rows: &[RankedAffiliate]) -> Vec<(i64, u64)> {
        rows.iter().map(|r| (r.affiliate.id, r.verified)).collect()
    }

    #[test]
    fn top_three_over_seven_days() {
        let (repo, clock, ids) = seeded();
        let board = LeaderboardCache::new(repo, clock);
        board.recompute().unwrap();

        let top = board.top_affiliates(LeaderboardWindow::SevenDays, 3, true).unwrap();
        assert_eq!(counts(&top), vec![(ids[0], 5), (ids[1], 4), (ids[2], 3)]);
        assert_eq!(top[0].label(), "@owner1");
        assert_eq!(board.generated_at(LeaderboardWindow::SevenDays), Some(t0()));

        let all = board.top_affiliates(LeaderboardWindow::All, 1, true).unwrap();
        assert_eq!(counts(&all), vec![(ids[4], 6)]);
    }

    #[test]
    fn aging_out_reduces_count_after_recompute() {
        let (repo, clock, ids) = seeded();
        let board = LeaderboardCache::new(repo, clock.clone());
        board.recompute().unwrap();

        clock.advance(Span::days(2));
        // stale until recomputed
        let stale = board.top_affiliates(LeaderboardWindow::SevenDays, 3, true).unwrap();
        assert_eq!(stale[1].verified, 4);

        board.recompute().unwrap();
        let fresh = board.top_affiliates(LeaderboardWindow::SevenDays, 3, true).unwrap();
        // b drops to 3 and ties c; ascending id breaks the tie
        assert_eq!(counts(&fresh), vec![(ids[0], 5), (ids[1], 3), (ids[2], 3)]);
    }

    #[test]
    fn bypass_and_empty_cache_use_live_counts() {
        let (repo, clock, ids) = seeded();
        let board = LeaderboardCache::new(Arc::clone(&repo), clock);

        // nothing computed yet
        assert_eq!(board.generated_at(LeaderboardWindow::ThirtyDays), None);
        let live = board.top_affiliates(LeaderboardWindow::ThirtyDays, 1, true).unwrap();
        assert_eq!(counts(&live), vec![(ids[4], 6)]);

        board.recompute().unwrap();
        let mut seeder = Seeder { repo, joiner: 5000 };
        for _ in 0..4 { seeder.verified(ids[3], t0()); }

        let cached = board.top_affiliates(LeaderboardWindow::SevenDays, 1, true).unwrap();
        assert_eq!(counts(&cached), vec![(ids[0], 5)]);
        let bypass = board.top_affiliates(LeaderboardWindow::SevenDays, 1, false).unwrap();
        assert_eq!(counts(&bypass), vec![(ids[3], 6)]);
        assert_eq!(bypass, board.top_affiliates(LeaderboardWindow::SevenDays, 1, false).unwrap());
    }

    #[test]
    fn limit_is_clamped() {
        let (repo, clock, _) = seeded();
        let board = LeaderboardCache::new(repo, clock);
        assert_eq!(board.top_affiliates(LeaderboardWindow::All, 0, false).unwrap().len(), 1);
        assert_eq!(board.top_affiliates(LeaderboardWindow::All, 500, false).unwrap().len(), 5);
        assert_eq!(clamp_limit(-3), 1);
        assert_eq!(clamp_limit(99), MAX_LIMIT);
    }

    #[test]
    fn window_keys_round_trip() {
        for window in LeaderboardWindow::ALL {
            assert_eq!(LeaderboardWindow::parse(window.key()), Some(window));
        }
        assert_eq!(LeaderboardWindow::parse("7D"), Some(LeaderboardWindow::SevenDays));
        assert_eq!(LeaderboardWindow::parse("90d"), None);
    }
}
