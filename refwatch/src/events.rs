// refwatch/src/events.rs
//
// Shared domain types flowing through refwatch.
//
// Records (User, Affiliate, Attribution, LedgerEvent) are owned by the
// attribution store and referenced by id only; there are no object graphs.
// The membership contract (JoinEvent / LeaveEvent) and the inbound update
// envelope are what the intake deserializes from the gateway feed.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── Attribution status ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributionStatus {
    Pending,
    Verified,
    Revoked,
}

impl AttributionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Revoked => "revoked",
        }
    }

    /// Pending or verified — the states a membership leave revokes.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Verified)
    }
}

impl fmt::Display for AttributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Risk reasons / notes ──────────────────────────────────────────────────────
// The note column is a comma-joined, sorted, deduplicated tag list. In memory
// it is a set of reasons; the string form only exists at the storage edge.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RiskReason {
    FreshAccount,
    IpBurst,
    ManualRevoke,
    Other(OtherTag), // tags written by older deployments / operators
}

/// Free-form tag. Only built by `RiskReason::parse`, so it never spells a
/// known reason and never contains a comma; equality and ordering by tag
/// text then agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OtherTag(String);

impl RiskReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::FreshAccount => "fresh_account",
            Self::IpBurst => "ip_burst",
            Self::ManualRevoke => "manual_revoke",
            Self::Other(tag) => &tag.0,
        }
    }

    /// Parse one tag. Blank input, or anything holding a comma, yields None.
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        match tag {
            "" => None,
            "fresh_account" => Some(Self::FreshAccount),
            "ip_burst" => Some(Self::IpBurst),
            "manual_revoke" => Some(Self::ManualRevoke),
            other if other.contains(',') => None,
            other => Some(Self::Other(OtherTag(other.to_string()))),
        }
    }
}

// Ordered by tag text so the serialized note is alphabetically sorted.
impl Ord for RiskReason {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl PartialOrd for RiskReason {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RiskReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RiskNote(BTreeSet<RiskReason>);

impl RiskNote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a stored note. `None`, `""` and `" , "` all give an empty note.
    pub fn parse(raw: Option<&str>) -> Self {
        Self(raw.unwrap_or_default().split(',').filter_map(RiskReason::parse).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, reason: &RiskReason) -> bool {
        self.0.contains(reason)
    }

    /// Returns false when the reason was already present.
    pub fn insert(&mut self, reason: RiskReason) -> bool {
        self.0.insert(reason)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn reasons(&self) -> impl Iterator<Item = &RiskReason> {
        self.0.iter()
    }

    /// Storage form: None when empty, otherwise the sorted comma-joined tags.
    pub fn to_stored(&self) -> Option<String> {
        if self.is_empty() { None } else { Some(self.to_string()) }
    }
}

impl fmt::Display for RiskNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.0.iter().map(|r| r.as_str()).collect();
        f.write_str(&tags.join(","))
    }
}

impl FromIterator<RiskReason> for RiskNote {
    fn from_iter<I: IntoIterator<Item = RiskReason>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for RiskNote {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_stored().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RiskNote {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(Self::parse(raw.as_deref()))
    }
}

// ── Stored records ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    /// `@handle`, else the joined names, else the numeric id.
    pub fn label(&self) -> String {
        if let Some(ref username) = self.username {
            if !username.is_empty() {
                return format!("@{}", username);
            }
        }
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let name = name.trim();
        if name.is_empty() { self.id.to_string() } else { name.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affiliate {
    pub id: i64,
    pub owner_user_id: i64,
    pub invite_link: String,
    pub link_code: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub id: i64,
    pub joined_user_id: i64,
    pub affiliate_id: i64,
    pub joined_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub status: AttributionStatus,
    pub note: RiskNote,
    pub last_seen_ip: Option<String>,
    pub source_subnet: Option<String>,
}

impl Attribution {
    /// Eligible for automatic confirmation: still pending and not flagged.
    pub fn awaiting_auto_verify(&self) -> bool {
        self.status == AttributionStatus::Pending && self.note.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct NewAttribution {
    pub affiliate_id: i64,
    pub joined_user_id: i64,
    pub joined_at: DateTime<Utc>,
    pub source_ip: Option<String>,
    pub source_subnet: Option<String>,
    pub note: RiskNote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Join,
    Leave,
    Promote,
    Revoke,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join => write!(f, "join"),
            Self::Leave => write!(f, "leave"),
            Self::Promote => write!(f, "promote"),
            Self::Revoke => write!(f, "revoke"),
        }
    }
}

/// Append-only ledger entry. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: i64,
    pub kind: EventKind,
    pub user_id: i64,
    pub affiliate_id: Option<i64>,
    pub raw: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub verified: u64,
    pub revoked: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: AttributionStatus) {
        match status {
            AttributionStatus::Pending => self.pending += 1,
            AttributionStatus::Verified => self.verified += 1,
            AttributionStatus::Revoked => self.revoked += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AffiliateSummary {
    pub active: u64,
    pub inactive: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub inactive_affiliates_with_verified: u64,
    pub dangling_attributions: u64,
}

// ── Membership contract (consumed) ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinEvent {
    pub target_user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub is_premium: bool,
    /// Invite link URL or bare code the member joined through.
    pub invite_reference: String,
    #[serde(default)]
    pub source_ip: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveEvent {
    pub target_user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    /// "left" / "kicked" as reported by the gateway.
    #[serde(default)]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ── Inbound update envelope ───────────────────────────────────────────────────

/// The user behind a command or button press.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub from: Actor,
    pub chat_id: i64,
    #[serde(default)]
    pub private: bool,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub from: Actor,
    pub chat_id: i64,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Update {
    Join(JoinEvent),
    Leave(LeaveEvent),
    Command(CommandMessage),
    Callback(CallbackQuery),
}
