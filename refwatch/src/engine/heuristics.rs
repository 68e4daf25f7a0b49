// refwatch/src/engine/heuristics.rs
//
// Join-time fraud heuristics. Two fixed rules, additive:
//
//   ip_burst       — more than BURST_THRESHOLD joins from the same IPv4 /24
//                    inside a sliding BURST_WINDOW. The 4th and later joins
//                    in the window trip the rule; the caller then reopens
//                    every attribution from that subnet in the window.
//   fresh_account  — bot accounts always; otherwise non-premium accounts
//                    with no public handle and a first name of ≤ 2 chars.
//
// The only shared state is the per-subnet queue of recent join timestamps.
// DashMap shards it so concurrent joins on different subnets never contend;
// joins on the same subnet serialize on the entry lock.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::clock::SharedClock;
use crate::events::{JoinEvent, RiskNote, RiskReason};

pub const BURST_WINDOW_SECS: i64   = 5 * 60;
pub const BURST_THRESHOLD:   usize = 3; // flag when count exceeds this

/// IPv4 → "a.b.c.0/24". IPv6 and unparseable input give None.
pub fn subnet_of(ip: Option<&str>) -> Option<String> {
    match ip?.trim().parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            Some(format!("{}.{}.{}.0/24", o[0], o[1], o[2]))
        }
        IpAddr::V6(_) => None,
    }
}

pub fn is_fresh_account(join: &JoinEvent) -> bool {
    if join.is_bot {
        return true;
    }
    if join.is_premium {
        return false;
    }
    if join.username.as_deref().is_some_and(|u| !u.is_empty()) {
        return false;
    }
    let first = join.first_name.as_deref().unwrap_or_default().trim();
    first.chars().count() <= 2
}

// ── Burst detector ────────────────────────────────────────────────────────────

pub struct BurstDetector {
    windows:   DashMap<String, VecDeque<DateTime<Utc>>>,
    window:    Duration,
    threshold: usize,
}

impl BurstDetector {
    pub fn new() -> Self {
        Self::with_limits(Duration::seconds(BURST_WINDOW_SECS), BURST_THRESHOLD)
    }

    pub fn with_limits(window: Duration, threshold: usize) -> Self {
        Self { windows: DashMap::new(), window, threshold }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a join and report whether the subnet is now bursting.
    pub fn record(&self, subnet: &str, at: DateTime<Utc>) -> bool {
        let mut queue = self.windows.entry(subnet.to_string()).or_default();
        while queue.front().is_some_and(|&first| at - first > self.window) {
            queue.pop_front();
        }
        queue.push_back(at);
        queue.len() > self.threshold
    }

    pub fn n_subnets(&self) -> usize {
        self.windows.len()
    }

    /// Drop queues whose newest entry has aged out of the window.
    pub fn prune(&self, now: DateTime<Utc>) {
        self.windows.retain(|_, q| q.back().is_some_and(|&last| now - last <= self.window));
    }

    pub async fn housekeeping_loop(self: Arc<Self>, clock: SharedClock) {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(BURST_WINDOW_SECS as u64)).await;
            let before = self.n_subnets();
            self.prune(clock.now());
            debug!(before, after = self.n_subnets(), "pruned burst windows");
        }
    }
}

impl Default for BurstDetector { fn default() -> Self { Self::new() } }

// ── Assessment ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Assessment {
    pub subnet:  Option<String>,
    pub reasons: RiskNote,
}

impl Assessment {
    pub fn is_burst(&self) -> bool {
        self.reasons.contains(&RiskReason::IpBurst)
    }

    pub fn is_clean(&self) -> bool {
        self.reasons.is_empty()
    }
}

pub struct Heuristics {
    burst: Arc<BurstDetector>,
}

impl Heuristics {
    pub fn new(burst: Arc<BurstDetector>) -> Self {
        Self { burst }
    }

    pub fn burst_window(&self) -> Duration {
        self.burst.window()
    }

    /// Score one join. Records the join in the subnet window as a side effect.
    pub fn assess(&self, join: &JoinEvent) -> Assessment {
        let subnet = subnet_of(join.source_ip.as_deref());
        let mut reasons = RiskNote::new();

        if let Some(ref s) = subnet {
            if self.burst.record(s, join.timestamp) {
                reasons.insert(RiskReason::IpBurst);
            }
        }
        if is_fresh_account(join) {
            reasons.insert(RiskReason::FreshAccount);
        }

        if !reasons.is_empty() {
            debug!(user_id = join.target_user_id, subnet = ?subnet, reasons = %reasons, "join flagged");
        }
        Assessment { subnet, reasons }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn join(id: i64, username: Option<&str>, first: Option<&str>, bot: bool, premium: bool) -> JoinEvent {
        JoinEvent {
            target_user_id:   id,
            username:         username.map(str::to_string),
            first_name:       first.map(str::to_string),
            last_name:        None,
            is_bot:           bot,
            is_premium:       premium,
            invite_reference: "https://t.me/+code".into(),
            source_ip:        None,
            timestamp:        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn subnet_groups_ipv4_by_24() {
        assert_eq!(subnet_of(Some("10.0.0.17")).as_deref(), Some("10.0.0.0/24"));
        assert_eq!(subnet_of(Some(" 192.168.5.200 ")).as_deref(), Some("192.168.5.0/24"));
        assert_eq!(subnet_of(Some("2001:db8::1")), None);
        assert_eq!(subnet_of(Some("not-an-ip")), None);
        assert_eq!(subnet_of(None), None);
    }

    #[test]
    fn bots_are_always_fresh() {
        assert!(is_fresh_account(&join(1, Some("handle"), Some("Alexander"), true, true)));
    }

    #[test]
    fn premium_is_never_fresh() {
        assert!(!is_fresh_account(&join(1, None, Some("A"), false, true)));
    }

    #[test]
    fn handle_exempts() {
        assert!(!is_fresh_account(&join(1, Some("al"), Some("Al"), false, false)));
    }

    #[test]
    fn short_first_name_without_handle_is_fresh() {
        assert!(is_fresh_account(&join(1, None, Some("Al"), false, false)));
        assert!(is_fresh_account(&join(1, None, Some("  Al  "), false, false)));
        assert!(is_fresh_account(&join(1, Some(""), None, false, false)));
        assert!(!is_fresh_account(&join(1, None, Some("Alex"), false, false)));
    }

    #[test]
    fn fourth_join_in_window_bursts() {
        let detector = BurstDetector::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert!(!detector.record("10.0.0.0/24", t0));
        assert!(!detector.record("10.0.0.0/24", t0 + Duration::seconds(60)));
        assert!(!detector.record("10.0.0.0/24", t0 + Duration::seconds(120)));
        assert!(detector.record("10.0.0.0/24", t0 + Duration::seconds(180)));
        assert!(detector.record("10.0.0.0/24", t0 + Duration::seconds(200)));
        // other subnets are independent
        assert!(!detector.record("10.0.1.0/24", t0 + Duration::seconds(200)));
    }

    #[test]
    fn joins_older_than_window_expire() {
        let detector = BurstDetector::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        for i in 0..3 {
            detector.record("10.0.0.0/24", t0 + Duration::seconds(i));
        }
        // exactly at the window edge the first entry still counts
        assert!(detector.record("10.0.0.0/24", t0 + Duration::seconds(BURST_WINDOW_SECS)));
        // well past it, only the most recent join remains
        assert!(!detector.record("10.0.0.0/24", t0 + Duration::seconds(BURST_WINDOW_SECS * 3)));
    }

    #[test]
    fn prune_drops_idle_subnets() {
        let detector = BurstDetector::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        detector.record("10.0.0.0/24", t0);
        detector.record("10.0.1.0/24", t0 + Duration::seconds(400));
        detector.prune(t0 + Duration::seconds(500));
        assert_eq!(detector.n_subnets(), 1);
    }

    #[test]
    fn reasons_are_additive() {
        let heuristics = Heuristics::new(Arc::new(BurstDetector::with_limits(Duration::minutes(5), 0)));
        let mut ev = join(9, None, Some("X"), false, false);
        ev.source_ip = Some("10.0.0.1".into());
        let assessment = heuristics.assess(&ev);
        assert!(assessment.is_burst());
        assert_eq!(assessment.reasons.to_string(), "fresh_account,ip_burst");
        assert_eq!(assessment.subnet.as_deref(), Some("10.0.0.0/24"));
    }

    #[test]
    fn ipv6_joins_skip_burst_rule() {
        let heuristics = Heuristics::new(Arc::new(BurstDetector::with_limits(Duration::minutes(5), 0)));
        let mut ev = join(9, Some("someone"), Some("Someone"), false, false);
        ev.source_ip = Some("2001:db8::1".into());
        let assessment = heuristics.assess(&ev);
        assert!(assessment.is_clean());
        assert!(assessment.subnet.is_none());
    }
}
