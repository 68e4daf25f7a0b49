// refwatch/src/config.rs
//
// Daemon settings. Every flag can also come from a REFWATCH_* environment
// variable, so the same binary runs from a shell or a service unit.
//
// Usage:
//   refwatch --target-chat-id -1001234 --admin-ids 11,12
//   refwatch --mode replay --path captured.jsonl --speed 10.0
//   REFWATCH_SNAPSHOT=/var/lib/refwatch/state.json refwatch --target-chat-id -1001234

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use crate::engine::leaderboard::ROLLUP_INTERVAL_SECS;
use crate::engine::scheduler::VERIFICATION_DELAY_SECS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Tail,    // follow a live JSONL update feed
    Replay,  // replay a captured feed at scaled speed
}

#[derive(Debug, Clone, Parser)]
#[command(
    name    = "refwatch",
    about   = "Referral attribution with fraud scoring, deferred verification and cached leaderboards",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Settings {
    #[arg(long, env = "REFWATCH_TARGET_CHAT_ID", allow_hyphen_values = true,
          help = "Chat whose memberships are tracked")]
    pub target_chat_id: i64,

    #[arg(long, env = "REFWATCH_ADMIN_IDS", default_value = "",
          help = "Comma-separated administrator user ids")]
    pub admin_ids: String,

    #[arg(long, env = "REFWATCH_MODE", value_enum, default_value = "tail")]
    pub mode: Mode,

    #[arg(long, env = "REFWATCH_FEED", default_value = "/tmp/refwatch_updates.jsonl",
          help = "JSONL update feed (tail/replay)")]
    pub path: PathBuf,

    #[arg(long, default_value = "1.0", help = "Replay speed multiplier")]
    pub speed: f64,

    #[arg(long, env = "REFWATCH_OUTPUT", default_value = "/tmp/refwatch_output",
          help = "Outbox directory")]
    pub output: PathBuf,

    #[arg(long, env = "REFWATCH_SNAPSHOT",
          help = "JSON snapshot path; state stays in memory only when unset")]
    pub snapshot: Option<String>,

    #[arg(long, default_value = "300", help = "Snapshot checkpoint interval")]
    pub checkpoint_secs: u64,

    #[arg(long, env = "REFWATCH_HEALTH_ADDR", default_value = "127.0.0.1:8080")]
    pub health_addr: SocketAddr,

    #[arg(long, default_value_t = ROLLUP_INTERVAL_SECS, help = "Leaderboard refresh interval")]
    pub rollup_secs: u64,

    #[arg(long, default_value_t = VERIFICATION_DELAY_SECS, help = "Delay before a clean join is verified")]
    pub verify_delay_secs: u64,

    #[arg(long, help = "Emit JSON log lines")]
    pub log_json: bool,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.target_chat_id == 0 {
            bail!("target chat id must be non-zero");
        }
        if !(self.speed.is_finite() && self.speed > 0.0) {
            bail!("replay speed must be positive, got {}", self.speed);
        }
        self.admin_ids()?;
        Ok(())
    }

    pub fn admin_ids(&self) -> Result<Vec<i64>> {
        self.admin_ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<i64>().with_context(|| format!("invalid admin id {:?}", s)))
            .collect()
    }

    /// Blank values count as unset.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.snapshot
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_secs(self.verify_delay_secs)
    }

    pub fn rollup_interval(&self) -> Duration {
        Duration::from_secs(self.rollup_secs.max(1))
    }
}
