// refwatch/src/state/store.rs
//
// Attribution store — the only owner of user / affiliate / attribution /
// event mutation.
//
// Design:
//   - `UnitOfWork` is the repository contract: a handful of row primitives
//     (get / insert / save per entity) plus default methods that implement
//     the domain operations on top of them, so any backend gets identical
//     invariants.
//   - `Repository::transaction` scopes a unit of work: Ok commits, Err (or a
//     panic) rolls every primitive write back.
//   - `MemoryRepository` keeps all tables behind one mutex. Writes go through
//     an undo journal instead of copying tables per transaction.
//
// Uniqueness (one affiliate per owner, unique invite link + code, one
// attribution per joined user) is enforced by the insert primitives and
// surfaces as EngineError::Conflict.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::events::{
    Affiliate, AffiliateSummary, Attribution, AttributionStatus, EventKind, IntegrityReport,
    LedgerEvent, NewAttribution, RiskReason, StatusCounts, UserRecord,
};

/// Last non-empty path segment of an invite URL; the input itself when there
/// is no path (bare codes pass through unchanged).
pub fn extract_link_code(invite_link: &str) -> String {
    let trimmed = invite_link.trim();
    let path = match trimmed.find("://") {
        Some(scheme_end) => {
            let rest = &trimmed[scheme_end + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "",
            }
        }
        None => trimmed,
    };
    let path = path.split(['?', '#']).next().unwrap_or_default();
    match path.trim_matches('/').rsplit('/').next() {
        Some(code) if !code.is_empty() => code.to_string(),
        _ => trimmed.to_string(),
    }
}

// ── Repository contract ───────────────────────────────────────────────────────

pub trait UnitOfWork {
    // Users
    fn user(&self, id: i64) -> EngineResult<Option<UserRecord>>;
    fn user_by_username(&self, username: &str) -> EngineResult<Option<UserRecord>>;
    fn put_user(&mut self, user: UserRecord) -> EngineResult<()>;

    // Affiliates
    fn affiliate(&self, id: i64) -> EngineResult<Option<Affiliate>>;
    fn affiliate_by_code(&self, link_code: &str) -> EngineResult<Option<Affiliate>>;
    fn affiliate_by_owner(&self, owner_user_id: i64) -> EngineResult<Option<Affiliate>>;
    fn affiliates(&self) -> EngineResult<Vec<Affiliate>>;
    fn insert_affiliate(
        &mut self,
        owner_user_id: i64,
        invite_link: &str,
        link_code: &str,
        is_active: bool,
        created_at: DateTime<Utc>,
    ) -> EngineResult<Affiliate>;
    fn save_affiliate(&mut self, affiliate: &Affiliate) -> EngineResult<()>;

    // Attributions
    fn attribution(&self, id: i64) -> EngineResult<Option<Attribution>>;
    fn attribution_by_user(&self, joined_user_id: i64) -> EngineResult<Option<Attribution>>;
    fn scan_attributions(&self, filter: &dyn Fn(&Attribution) -> bool) -> EngineResult<Vec<Attribution>>;
    fn insert_attribution(&mut self, new: NewAttribution) -> EngineResult<Attribution>;
    fn save_attribution(&mut self, attribution: &Attribution) -> EngineResult<()>;

    // Event ledger (append-only)
    fn append_event(
        &mut self,
        kind: EventKind,
        user_id: i64,
        affiliate_id: Option<i64>,
        raw: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> EngineResult<LedgerEvent>;
    fn events_for_user(&self, user_id: i64, limit: usize) -> EngineResult<Vec<LedgerEvent>>;
    fn events_for_affiliate(&self, affiliate_id: i64, limit: usize) -> EngineResult<Vec<LedgerEvent>>;

    // ── Domain operations ─────────────────────────────────────────────────────

    /// Insert or refresh a user. Mutable fields are last-write-wins.
    fn upsert_user(
        &mut self,
        id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
        at: DateTime<Utc>,
    ) -> EngineResult<UserRecord> {
        let created_at = self.user(id)?.map(|u| u.created_at).unwrap_or(at);
        let user = UserRecord {
            id,
            username: username.map(str::to_string),
            first_name: first_name.map(str::to_string),
            last_name: last_name.map(str::to_string),
            created_at,
        };
        self.put_user(user.clone())?;
        Ok(user)
    }

    fn create_affiliate(
        &mut self,
        owner_user_id: i64,
        invite_link: &str,
        at: DateTime<Utc>,
    ) -> EngineResult<Affiliate> {
        let code = extract_link_code(invite_link);
        self.insert_affiliate(owner_user_id, invite_link, &code, true, at)
    }

    fn set_affiliate_active(&mut self, affiliate_id: i64, is_active: bool) -> EngineResult<Affiliate> {
        let mut affiliate = self
            .affiliate(affiliate_id)?
            .ok_or_else(|| EngineError::NotFound(format!("affiliate {}", affiliate_id)))?;
        affiliate.is_active = is_active;
        self.save_affiliate(&affiliate)?;
        Ok(affiliate)
    }

    /// Pause / resume every link. Returns the number of rows touched.
    fn bulk_set_active(&mut self, is_active: bool) -> EngineResult<usize> {
        let all = self.affiliates()?;
        for mut affiliate in all.iter().cloned() {
            affiliate.is_active = is_active;
            self.save_affiliate(&affiliate)?;
        }
        Ok(all.len())
    }

    /// Newest first.
    fn list_affiliates(&self, active_only: bool) -> EngineResult<Vec<Affiliate>> {
        let mut list: Vec<Affiliate> = self
            .affiliates()?
            .into_iter()
            .filter(|a| !active_only || a.is_active)
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(list)
    }

    fn affiliate_stats(&self, affiliate_id: i64) -> EngineResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for a in self.scan_attributions(&|a| a.affiliate_id == affiliate_id)? {
            counts.add(a.status);
        }
        Ok(counts)
    }

    fn count_affiliates(&self) -> EngineResult<AffiliateSummary> {
        let all = self.affiliates()?;
        let active = all.iter().filter(|a| a.is_active).count() as u64;
        let total = all.len() as u64;
        Ok(AffiliateSummary { active, inactive: total.saturating_sub(active), total })
    }

    /// Conflict when the joined user already has an attribution.
    fn create_attribution(&mut self, new: NewAttribution) -> EngineResult<Attribution> {
        self.insert_attribution(new)
    }

    fn require_attribution(&self, attribution_id: i64) -> EngineResult<Attribution> {
        self.attribution(attribution_id)?
            .ok_or_else(|| EngineError::NotFound(format!("attribution {}", attribution_id)))
    }

    /// Sets status and verification timestamp exactly as given.
    fn update_attribution_status(
        &mut self,
        attribution_id: i64,
        status: AttributionStatus,
        verified_at: Option<DateTime<Utc>>,
    ) -> EngineResult<Attribution> {
        let mut attribution = self.require_attribution(attribution_id)?;
        attribution.status = status;
        attribution.verified_at = verified_at;
        self.save_attribution(&attribution)?;
        Ok(attribution)
    }

    fn merge_attribution_note(&mut self, attribution_id: i64, reason: RiskReason) -> EngineResult<Attribution> {
        let mut attribution = self.require_attribution(attribution_id)?;
        if attribution.note.insert(reason) {
            self.save_attribution(&attribution)?;
        }
        Ok(attribution)
    }

    fn clear_attribution_note(&mut self, attribution_id: i64) -> EngineResult<Attribution> {
        let mut attribution = self.require_attribution(attribution_id)?;
        attribution.note.clear();
        self.save_attribution(&attribution)?;
        Ok(attribution)
    }

    /// Reopen every attribution from `subnet` joined at or after `since`:
    /// status back to pending, verification cleared, `ip_burst` merged in —
    /// whatever the current status. Returns the joined user ids so callers
    /// can disarm their timers.
    fn flag_subnet_burst(&mut self, subnet: &str, since: DateTime<Utc>) -> EngineResult<Vec<i64>> {
        let hits = self.scan_attributions(&|a| {
            a.source_subnet.as_deref() == Some(subnet) && a.joined_at >= since
        })?;
        let mut users = Vec::with_capacity(hits.len());
        for mut attribution in hits {
            if attribution.status == AttributionStatus::Verified {
                warn!(
                    attribution_id = attribution.id,
                    user_id = attribution.joined_user_id,
                    subnet,
                    "burst reopening verified attribution"
                );
            }
            attribution.status = AttributionStatus::Pending;
            attribution.verified_at = None;
            attribution.note.insert(RiskReason::IpBurst);
            self.save_attribution(&attribution)?;
            users.push(attribution.joined_user_id);
        }
        debug!(subnet, flagged = users.len(), "subnet burst flagged");
        Ok(users)
    }

    /// Pending attributions carrying a risk note, oldest join first.
    fn list_pending_reviews(&self, limit: usize) -> EngineResult<Vec<Attribution>> {
        let mut rows = self.scan_attributions(&|a| {
            a.status == AttributionStatus::Pending && !a.note.is_empty()
        })?;
        rows.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.id.cmp(&b.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn count_by_status_since(&self, since: DateTime<Utc>) -> EngineResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for a in self.scan_attributions(&|a| a.joined_at >= since)? {
            counts.add(a.status);
        }
        Ok(counts)
    }

    /// affiliate id → verified attributions joined at or after `since`.
    fn verified_counts(&self, since: Option<DateTime<Utc>>) -> EngineResult<HashMap<i64, u64>> {
        let rows = self.scan_attributions(&|a| {
            a.status == AttributionStatus::Verified && since.map_or(true, |s| a.joined_at >= s)
        })?;
        let mut counts: HashMap<i64, u64> = HashMap::new();
        for a in rows {
            *counts.entry(a.affiliate_id).or_default() += 1;
        }
        Ok(counts)
    }

    fn log_event(
        &mut self,
        kind: EventKind,
        user_id: i64,
        affiliate_id: Option<i64>,
        raw: serde_json::Value,
        at: DateTime<Utc>,
    ) -> EngineResult<LedgerEvent> {
        self.append_event(kind, user_id, affiliate_id, raw, at)
    }

    fn integrity_report(&self) -> EngineResult<IntegrityReport> {
        let mut report = IntegrityReport::default();
        for a in self.scan_attributions(&|_| true)? {
            match self.affiliate(a.affiliate_id)? {
                None => report.dangling_attributions += 1,
                Some(aff) if !aff.is_active && a.status == AttributionStatus::Verified => {
                    report.inactive_affiliates_with_verified += 1
                }
                Some(_) => {}
            }
        }
        Ok(report)
    }
}

pub trait Repository: Send + Sync + 'static {
    /// Run `f` as one unit of work. Ok commits, Err rolls back and propagates.
    fn transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> EngineResult<T>;
}

// ── In-memory tables ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct IdSeq {
    affiliate:   i64,
    attribution: i64,
    event:       i64,
}

#[derive(Debug, Clone, Default)]
struct Indexes {
    affiliate_by_owner: HashMap<i64, i64>,
    affiliate_by_code:  HashMap<String, i64>,
    affiliate_by_link:  HashMap<String, i64>,
    attribution_by_user: HashMap<i64, i64>,
}

/// Full table set. Serializable for snapshots; indexes are rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    users:        BTreeMap<i64, UserRecord>,
    affiliates:   BTreeMap<i64, Affiliate>,
    attributions: BTreeMap<i64, Attribution>,
    events:       Vec<LedgerEvent>,
    seq:          IdSeq,
    #[serde(skip)]
    idx:          Indexes,
}

impl Tables {
    fn rebuild_indexes(&mut self) {
        let mut idx = Indexes::default();
        for a in self.affiliates.values() {
            idx.affiliate_by_owner.insert(a.owner_user_id, a.id);
            idx.affiliate_by_code.insert(a.link_code.clone(), a.id);
            idx.affiliate_by_link.insert(a.invite_link.clone(), a.id);
        }
        for a in self.attributions.values() {
            idx.attribution_by_user.insert(a.joined_user_id, a.id);
        }
        self.idx = idx;
    }

    pub fn n_users(&self) -> usize { self.users.len() }
    pub fn n_attributions(&self) -> usize { self.attributions.len() }
    pub fn n_events(&self) -> usize { self.events.len() }

    fn set_user(&mut self, id: i64, row: Option<UserRecord>) -> Option<UserRecord> {
        match row {
            Some(u) => self.users.insert(id, u),
            None    => self.users.remove(&id),
        }
    }

    fn set_affiliate(&mut self, id: i64, row: Option<Affiliate>) -> Option<Affiliate> {
        let old = match row {
            Some(a) => self.affiliates.insert(id, a),
            None    => self.affiliates.remove(&id),
        };
        if let Some(ref o) = old {
            self.idx.affiliate_by_owner.remove(&o.owner_user_id);
            self.idx.affiliate_by_code.remove(&o.link_code);
            self.idx.affiliate_by_link.remove(&o.invite_link);
        }
        if let Some(a) = self.affiliates.get(&id) {
            self.idx.affiliate_by_owner.insert(a.owner_user_id, id);
            self.idx.affiliate_by_code.insert(a.link_code.clone(), id);
            self.idx.affiliate_by_link.insert(a.invite_link.clone(), id);
        }
        old
    }

    fn set_attribution(&mut self, id: i64, row: Option<Attribution>) -> Option<Attribution> {
        let old = match row {
            Some(a) => self.attributions.insert(id, a),
            None    => self.attributions.remove(&id),
        };
        if let Some(ref o) = old {
            self.idx.attribution_by_user.remove(&o.joined_user_id);
        }
        if let Some(a) = self.attributions.get(&id) {
            self.idx.attribution_by_user.insert(a.joined_user_id, id);
        }
        old
    }
}

enum Undo {
    User(i64, Option<UserRecord>),
    Affiliate(i64, Option<Affiliate>),
    Attribution(i64, Option<Attribution>),
    Event,
    Seq(IdSeq),
}

/// Unit of work over locked tables. Rolls back on drop unless committed.
pub struct MemoryTx<'a> {
    tables:    &'a mut Tables,
    undo:      Vec<Undo>,
    committed: bool,
}

impl MemoryTx<'_> {
    fn commit(mut self) {
        self.committed = true;
    }

    fn rollback(&mut self) {
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::User(id, row)        => { self.tables.set_user(id, row); }
                Undo::Affiliate(id, row)   => { self.tables.set_affiliate(id, row); }
                Undo::Attribution(id, row) => { self.tables.set_attribution(id, row); }
                Undo::Event                => { self.tables.events.pop(); }
                Undo::Seq(seq)             => self.tables.seq = seq,
            }
        }
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.undo.is_empty() {
            debug!(steps = self.undo.len(), "rolling back transaction");
            self.rollback();
        }
    }
}

impl UnitOfWork for MemoryTx<'_> {
    fn user(&self, id: i64) -> EngineResult<Option<UserRecord>> {
        Ok(self.tables.users.get(&id).cloned())
    }

    fn user_by_username(&self, username: &str) -> EngineResult<Option<UserRecord>> {
        let wanted = username.trim_start_matches('@').to_lowercase();
        if wanted.is_empty() {
            return Ok(None);
        }
        Ok(self.tables.users.values()
            .find(|u| u.username.as_deref().map(str::to_lowercase).as_deref() == Some(wanted.as_str()))
            .cloned())
    }

    fn put_user(&mut self, user: UserRecord) -> EngineResult<()> {
        let id = user.id;
        let old = self.tables.set_user(id, Some(user));
        self.undo.push(Undo::User(id, old));
        Ok(())
    }

    fn affiliate(&self, id: i64) -> EngineResult<Option<Affiliate>> {
        Ok(self.tables.affiliates.get(&id).cloned())
    }

    fn affiliate_by_code(&self, link_code: &str) -> EngineResult<Option<Affiliate>> {
        Ok(self.tables.idx.affiliate_by_code.get(link_code)
            .and_then(|id| self.tables.affiliates.get(id))
            .cloned())
    }

    fn affiliate_by_owner(&self, owner_user_id: i64) -> EngineResult<Option<Affiliate>> {
        Ok(self.tables.idx.affiliate_by_owner.get(&owner_user_id)
            .and_then(|id| self.tables.affiliates.get(id))
            .cloned())
    }

    fn affiliates(&self) -> EngineResult<Vec<Affiliate>> {
        Ok(self.tables.affiliates.values().cloned().collect())
    }

    fn insert_affiliate(
        &mut self,
        owner_user_id: i64,
        invite_link: &str,
        link_code: &str,
        is_active: bool,
        created_at: DateTime<Utc>,
    ) -> EngineResult<Affiliate> {
        if !self.tables.users.contains_key(&owner_user_id) {
            return Err(EngineError::NotFound(format!("user {}", owner_user_id)));
        }
        if self.tables.idx.affiliate_by_owner.contains_key(&owner_user_id) {
            return Err(EngineError::Conflict(format!("user {} already owns an affiliate", owner_user_id)));
        }
        if self.tables.idx.affiliate_by_link.contains_key(invite_link) {
            return Err(EngineError::Conflict(format!("invite link {} already registered", invite_link)));
        }
        if self.tables.idx.affiliate_by_code.contains_key(link_code) {
            return Err(EngineError::Conflict(format!("link code {} already registered", link_code)));
        }

        self.undo.push(Undo::Seq(self.tables.seq));
        self.tables.seq.affiliate += 1;
        let affiliate = Affiliate {
            id: self.tables.seq.affiliate,
            owner_user_id,
            invite_link: invite_link.to_string(),
            link_code: link_code.to_string(),
            is_active,
            created_at,
        };
        let old = self.tables.set_affiliate(affiliate.id, Some(affiliate.clone()));
        self.undo.push(Undo::Affiliate(affiliate.id, old));
        Ok(affiliate)
    }

    fn save_affiliate(&mut self, affiliate: &Affiliate) -> EngineResult<()> {
        let Some(current) = self.tables.affiliates.get(&affiliate.id) else {
            return Err(EngineError::NotFound(format!("affiliate {}", affiliate.id)));
        };
        let clash = |idx: &HashMap<String, i64>, key: &str| idx.get(key).is_some_and(|&id| id != affiliate.id);
        if current.owner_user_id != affiliate.owner_user_id
            && self.tables.idx.affiliate_by_owner.get(&affiliate.owner_user_id).is_some_and(|&id| id != affiliate.id)
        {
            return Err(EngineError::Conflict(format!("user {} already owns an affiliate", affiliate.owner_user_id)));
        }
        if clash(&self.tables.idx.affiliate_by_code, &affiliate.link_code)
            || clash(&self.tables.idx.affiliate_by_link, &affiliate.invite_link)
        {
            return Err(EngineError::Conflict(format!("invite link {} already registered", affiliate.invite_link)));
        }
        let old = self.tables.set_affiliate(affiliate.id, Some(affiliate.clone()));
        self.undo.push(Undo::Affiliate(affiliate.id, old));
        Ok(())
    }

    fn attribution(&self, id: i64) -> EngineResult<Option<Attribution>> {
        Ok(self.tables.attributions.get(&id).cloned())
    }

    fn attribution_by_user(&self, joined_user_id: i64) -> EngineResult<Option<Attribution>> {
        Ok(self.tables.idx.attribution_by_user.get(&joined_user_id)
            .and_then(|id| self.tables.attributions.get(id))
            .cloned())
    }

    fn scan_attributions(&self, filter: &dyn Fn(&Attribution) -> bool) -> EngineResult<Vec<Attribution>> {
        Ok(self.tables.attributions.values().filter(|a| filter(a)).cloned().collect())
    }

    fn insert_attribution(&mut self, new: NewAttribution) -> EngineResult<Attribution> {
        if !self.tables.users.contains_key(&new.joined_user_id) {
            return Err(EngineError::NotFound(format!("user {}", new.joined_user_id)));
        }
        if !self.tables.affiliates.contains_key(&new.affiliate_id) {
            return Err(EngineError::NotFound(format!("affiliate {}", new.affiliate_id)));
        }
        if self.tables.idx.attribution_by_user.contains_key(&new.joined_user_id) {
            return Err(EngineError::Conflict(format!("user {} already attributed", new.joined_user_id)));
        }

        self.undo.push(Undo::Seq(self.tables.seq));
        self.tables.seq.attribution += 1;
        let attribution = Attribution {
            id:             self.tables.seq.attribution,
            joined_user_id: new.joined_user_id,
            affiliate_id:   new.affiliate_id,
            joined_at:      new.joined_at,
            verified_at:    None,
            status:         AttributionStatus::Pending,
            note:           new.note,
            last_seen_ip:   new.source_ip,
            source_subnet:  new.source_subnet,
        };
        let old = self.tables.set_attribution(attribution.id, Some(attribution.clone()));
        self.undo.push(Undo::Attribution(attribution.id, old));
        Ok(attribution)
    }

    fn save_attribution(&mut self, attribution: &Attribution) -> EngineResult<()> {
        let Some(current) = self.tables.attributions.get(&attribution.id) else {
            return Err(EngineError::NotFound(format!("attribution {}", attribution.id)));
        };
        if current.joined_user_id != attribution.joined_user_id
            && self.tables.idx.attribution_by_user.contains_key(&attribution.joined_user_id)
        {
            return Err(EngineError::Conflict(format!("user {} already attributed", attribution.joined_user_id)));
        }
        let old = self.tables.set_attribution(attribution.id, Some(attribution.clone()));
        self.undo.push(Undo::Attribution(attribution.id, old));
        Ok(())
    }

    fn append_event(
        &mut self,
        kind: EventKind,
        user_id: i64,
        affiliate_id: Option<i64>,
        raw: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> EngineResult<LedgerEvent> {
        if !self.tables.users.contains_key(&user_id) {
            return Err(EngineError::NotFound(format!("user {}", user_id)));
        }
        self.undo.push(Undo::Seq(self.tables.seq));
        self.tables.seq.event += 1;
        let event = LedgerEvent {
            id: self.tables.seq.event,
            kind,
            user_id,
            affiliate_id,
            raw,
            created_at,
        };
        self.tables.events.push(event.clone());
        self.undo.push(Undo::Event);
        Ok(event)
    }

    fn events_for_user(&self, user_id: i64, limit: usize) -> EngineResult<Vec<LedgerEvent>> {
        Ok(self.tables.events.iter().rev()
            .filter(|e| e.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn events_for_affiliate(&self, affiliate_id: i64, limit: usize) -> EngineResult<Vec<LedgerEvent>> {
        Ok(self.tables.events.iter().rev()
            .filter(|e| e.affiliate_id == Some(affiliate_id))
            .take(limit)
            .cloned()
            .collect())
    }
}

// ── Repository ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(mut tables: Tables) -> Self {
        tables.rebuild_indexes();
        Self { tables: Mutex::new(tables) }
    }

    /// Consistent copy of every table, taken between transactions.
    pub fn export(&self) -> Tables {
        self.tables.lock().clone()
    }
}

impl Repository for MemoryRepository {
    fn transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> EngineResult<T>,
    {
        let mut guard = self.tables.lock();
        let mut tx = MemoryTx { tables: &mut *guard, undo: Vec::new(), committed: false };
        let result = f(&mut tx);
        if result.is_ok() {
            tx.commit();
        }
        // dropping an uncommitted tx rolls it back
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RiskNote;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn seed_affiliate(repo: &MemoryRepository, owner: i64, link: &str) -> Affiliate {
        repo.transaction(|tx| {
            tx.upsert_user(owner, Some("owner"), Some("Owner"), None, t0())?;
            tx.create_affiliate(owner, link, t0())
        })
        .unwrap()
    }

    fn join(repo: &MemoryRepository, affiliate_id: i64, user: i64, at: DateTime<Utc>, subnet: Option<&str>) -> EngineResult<Attribution> {
        repo.transaction(|tx| {
            tx.upsert_user(user, None, Some("Joiner"), None, at)?;
            tx.create_attribution(NewAttribution {
                affiliate_id,
                joined_user_id: user,
                joined_at: at,
                source_ip: None,
                source_subnet: subnet.map(str::to_string),
                note: RiskNote::new(),
            })
        })
    }

    #[test]
    fn link_code_is_last_path_segment() {
        assert_eq!(extract_link_code("https://t.me/+AbCdEf"), "+AbCdEf");
        assert_eq!(extract_link_code("https://t.me/joinchat/xyz/"), "xyz");
        assert_eq!(extract_link_code("https://t.me"), "https://t.me");
        assert_eq!(extract_link_code("rawcode"), "rawcode");
    }

    #[test]
    fn upsert_user_is_last_write_wins() {
        let repo = MemoryRepository::new();
        repo.transaction(|tx| tx.upsert_user(1, Some("old"), Some("A"), None, t0())).unwrap();
        let later = t0() + Duration::days(1);
        let user = repo.transaction(|tx| tx.upsert_user(1, None, Some("B"), Some("C"), later)).unwrap();
        assert_eq!(user.username, None);
        assert_eq!(user.first_name.as_deref(), Some("B"));
        assert_eq!(user.created_at, t0());
    }

    #[test]
    fn username_lookup_is_case_insensitive() {
        let repo = MemoryRepository::new();
        repo.transaction(|tx| tx.upsert_user(5, Some("Alice"), None, None, t0())).unwrap();
        let found = repo.transaction(|tx| tx.user_by_username("@alice")).unwrap();
        assert_eq!(found.map(|u| u.id), Some(5));
        assert!(repo.transaction(|tx| tx.user_by_username("@")).unwrap().is_none());
    }

    #[test]
    fn one_affiliate_per_owner_and_unique_codes() {
        let repo = MemoryRepository::new();
        seed_affiliate(&repo, 1, "https://t.me/+one");
        let again = repo.transaction(|tx| tx.create_affiliate(1, "https://t.me/+two", t0()));
        assert!(matches!(again, Err(EngineError::Conflict(_))));

        let same_code = repo.transaction(|tx| {
            tx.upsert_user(2, None, None, None, t0())?;
            tx.create_affiliate(2, "https://t.me/joinchat/+one", t0())
        });
        assert!(matches!(same_code, Err(EngineError::Conflict(_))));
        // the failed transaction rolled back the user upsert too
        assert!(repo.transaction(|tx| tx.user(2)).unwrap().is_none());
    }

    #[test]
    fn second_attribution_for_user_conflicts() {
        let repo = MemoryRepository::new();
        let aff = seed_affiliate(&repo, 1, "https://t.me/+one");
        let first = join(&repo, aff.id, 10, t0(), None).unwrap();
        let second = join(&repo, aff.id, 10, t0() + Duration::minutes(1), None);
        assert!(second.unwrap_err().is_conflict());
        let stored = repo.transaction(|tx| tx.attribution_by_user(10)).unwrap().unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(repo.export().n_attributions(), 1);
    }

    #[test]
    fn rollback_restores_sequences_and_rows() {
        let repo = MemoryRepository::new();
        let aff = seed_affiliate(&repo, 1, "https://t.me/+one");
        let failed: EngineResult<()> = repo.transaction(|tx| {
            tx.upsert_user(20, None, None, None, t0())?;
            tx.create_attribution(NewAttribution {
                affiliate_id: aff.id,
                joined_user_id: 20,
                joined_at: t0(),
                source_ip: None,
                source_subnet: None,
                note: RiskNote::new(),
            })?;
            tx.log_event(EventKind::Join, 20, Some(aff.id), serde_json::json!({}), t0())?;
            Err(EngineError::TransientIo("disk full".into()))
        });
        assert!(failed.is_err());
        let tables = repo.export();
        assert_eq!(tables.n_attributions(), 0);
        assert_eq!(tables.n_events(), 0);

        let next = join(&repo, aff.id, 21, t0(), None).unwrap();
        assert_eq!(next.id, 1);
    }

    #[test]
    fn subnet_burst_reopens_everything_in_window() {
        let repo = MemoryRepository::new();
        let aff = seed_affiliate(&repo, 1, "https://t.me/+one");
        let old = join(&repo, aff.id, 10, t0() - Duration::minutes(10), Some("10.0.0.0/24")).unwrap();
        let a = join(&repo, aff.id, 11, t0(), Some("10.0.0.0/24")).unwrap();
        let b = join(&repo, aff.id, 12, t0() + Duration::minutes(1), Some("10.0.0.0/24")).unwrap();
        let other = join(&repo, aff.id, 13, t0(), Some("10.0.1.0/24")).unwrap();

        repo.transaction(|tx| {
            tx.update_attribution_status(a.id, AttributionStatus::Verified, Some(t0()))?;
            tx.merge_attribution_note(b.id, RiskReason::FreshAccount)
        })
        .unwrap();

        let mut users = repo.transaction(|tx| tx.flag_subnet_burst("10.0.0.0/24", t0())).unwrap();
        users.sort();
        assert_eq!(users, vec![11, 12]);

        repo.transaction(|tx| {
            let a = tx.require_attribution(a.id)?;
            assert_eq!(a.status, AttributionStatus::Pending);
            assert_eq!(a.verified_at, None);
            assert_eq!(a.note.to_string(), "ip_burst");
            let b = tx.require_attribution(b.id)?;
            assert_eq!(b.note.to_string(), "fresh_account,ip_burst");
            assert!(tx.require_attribution(old.id)?.note.is_empty());
            assert!(tx.require_attribution(other.id)?.note.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn pending_reviews_are_flagged_oldest_first() {
        let repo = MemoryRepository::new();
        let aff = seed_affiliate(&repo, 1, "https://t.me/+one");
        let late = join(&repo, aff.id, 10, t0() + Duration::minutes(5), None).unwrap();
        let early = join(&repo, aff.id, 11, t0(), None).unwrap();
        let clean = join(&repo, aff.id, 12, t0() - Duration::minutes(5), None).unwrap();
        repo.transaction(|tx| {
            tx.merge_attribution_note(late.id, RiskReason::IpBurst)?;
            tx.merge_attribution_note(early.id, RiskReason::FreshAccount)
        })
        .unwrap();

        let rows = repo.transaction(|tx| tx.list_pending_reviews(10)).unwrap();
        let ids: Vec<i64> = rows.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
        assert!(!ids.contains(&clean.id));
        assert_eq!(repo.transaction(|tx| tx.list_pending_reviews(1)).unwrap().len(), 1);
    }

    #[test]
    fn stats_and_summaries() {
        let repo = MemoryRepository::new();
        let aff = seed_affiliate(&repo, 1, "https://t.me/+one");
        seed_affiliate(&repo, 2, "https://t.me/+two");
        let a = join(&repo, aff.id, 10, t0(), None).unwrap();
        join(&repo, aff.id, 11, t0() - Duration::days(10), None).unwrap();
        repo.transaction(|tx| tx.update_attribution_status(a.id, AttributionStatus::Verified, Some(t0()))).unwrap();

        let stats = repo.transaction(|tx| tx.affiliate_stats(aff.id)).unwrap();
        assert_eq!(stats, StatusCounts { pending: 1, verified: 1, revoked: 0 });

        let recent = repo.transaction(|tx| tx.count_by_status_since(t0() - Duration::days(7))).unwrap();
        assert_eq!(recent.verified, 1);
        assert_eq!(recent.pending, 0);

        let touched = repo.transaction(|tx| tx.bulk_set_active(false)).unwrap();
        assert_eq!(touched, 2);
        let summary = repo.transaction(|tx| tx.count_affiliates()).unwrap();
        assert_eq!(summary, AffiliateSummary { active: 0, inactive: 2, total: 2 });

        let report = repo.transaction(|tx| tx.integrity_report()).unwrap();
        assert_eq!(report.inactive_affiliates_with_verified, 1);
        assert_eq!(report.dangling_attributions, 0);
    }

    #[test]
    fn list_affiliates_newest_first_with_active_filter() {
        let repo = MemoryRepository::new();
        let ids = repo
            .transaction(|tx| {
                let mut ids = Vec::new();
                for (owner, hours) in [(1, 3), (2, 1), (3, 2)] {
                    tx.upsert_user(owner, None, None, None, t0())?;
                    let link = format!("https://t.me/+o{}", owner);
                    ids.push(tx.create_affiliate(owner, &link, t0() - Duration::hours(hours))?.id);
                }
                tx.set_affiliate_active(ids[1], false)?;
                Ok(ids)
            })
            .unwrap();

        let all: Vec<i64> = repo.transaction(|tx| tx.list_affiliates(false)).unwrap().iter().map(|a| a.id).collect();
        assert_eq!(all, vec![ids[1], ids[2], ids[0]]);
        let active: Vec<i64> = repo.transaction(|tx| tx.list_affiliates(true)).unwrap().iter().map(|a| a.id).collect();
        assert_eq!(active, vec![ids[2], ids[0]]);
    }

    #[test]
    fn events_are_newest_first() {
        let repo = MemoryRepository::new();
        let aff = seed_affiliate(&repo, 1, "https://t.me/+one");
        repo.transaction(|tx| {
            tx.upsert_user(10, None, None, None, t0())?;
            tx.log_event(EventKind::Join, 10, Some(aff.id), serde_json::json!({"n": 1}), t0())?;
            tx.log_event(EventKind::Leave, 10, Some(aff.id), serde_json::json!({"n": 2}), t0())
        })
        .unwrap();
        let events = repo.transaction(|tx| tx.events_for_user(10, 50)).unwrap();
        assert_eq!(events.iter().map(|e| e.kind).collect::<Vec<_>>(), vec![EventKind::Leave, EventKind::Join]);
        assert_eq!(repo.transaction(|tx| tx.events_for_affiliate(aff.id, 1)).unwrap().len(), 1);
    }
}
