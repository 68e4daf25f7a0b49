// refwatch/src/gateway.rs
//
// Messaging-gateway boundary.
//
// `Gateway` is everything refwatch needs from the chat platform: send a
// message (optionally with inline buttons), answer a button press, mint an
// invite link, and check administrator rights in the tracked chat.
//
// `OutboxGateway` writes every outbound action as one JSON line under the
// output directory; a delivery process tails those files and talks to the
// real platform API:
//
//   messages.jsonl          replies and notifications
//   callback_answers.jsonl  button-press acknowledgements
//   invite_links.jsonl      links minted for affiliates

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::error::EngineResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Button {
    pub text:          String,
    pub callback_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub chat_id: i64,
    pub text:    String,
    /// Rendered two per row by the delivery side.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
    /// Text carries HTML markup.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub html:    bool,
}

impl OutboundMessage {
    pub fn text(chat_id: i64, text: impl Into<String>) -> Self {
        Self { chat_id, text: text.into(), buttons: Vec::new(), html: false }
    }

    pub fn with_buttons(mut self, buttons: Vec<Button>) -> Self {
        self.buttons = buttons;
        self
    }

    pub fn html(mut self) -> Self {
        self.html = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackAnswer {
    pub user_id:    i64,
    pub text:       String,
    pub show_alert: bool,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send_message(&self, message: OutboundMessage) -> EngineResult<()>;

    async fn answer_callback(&self, answer: CallbackAnswer) -> EngineResult<()>;

    /// Mint a new invite link for the tracked chat. Returns the full URL.
    async fn create_invite_link(&self, name: &str) -> EngineResult<String>;

    /// Lookup failures count as "not an admin".
    async fn is_admin(&self, user_id: i64) -> bool;
}

// ── JSONL outbox ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct OutboxRecord<'a, T: Serialize> {
    #[serde(flatten)]
    body:      &'a T,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct InviteRecord<'a> {
    chat_id:     i64,
    name:        &'a str,
    invite_link: &'a str,
}

pub struct OutboxGateway {
    out:            PathBuf,
    target_chat_id: i64,
    admins:         HashSet<i64>,
    clock:          SharedClock,
}

impl OutboxGateway {
    pub fn new(
        output_dir:     impl Into<PathBuf>,
        target_chat_id: i64,
        admins:         impl IntoIterator<Item = i64>,
        clock:          SharedClock,
    ) -> anyhow::Result<Self> {
        let out: PathBuf = output_dir.into();
        std::fs::create_dir_all(&out)
            .with_context(|| format!("creating output directory {}", out.display()))?;
        let admins: HashSet<i64> = admins.into_iter().collect();
        info!(out = %out.display(), admins = admins.len(), "outbox gateway ready");
        Ok(Self { out, target_chat_id, admins, clock })
    }

    /// `+` followed by 16 hex chars of SHA-256 over chat, name and time.
    fn invite_code(&self, name: &str) -> String {
        let mut h = Sha256::new();
        h.update(b"refwatch_invite:");
        h.update(self.target_chat_id.to_le_bytes());
        h.update(b":");
        h.update(name.as_bytes());
        h.update(self.clock.now().timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
        format!("+{}", hex::encode(&h.finalize()[..8]))
    }

    async fn append<T: Serialize>(&self, file: &str, body: &T) -> EngineResult<()> {
        let record = OutboxRecord { body, timestamp: self.clock.now() };
        let line   = serde_json::to_string(&record)? + "\n";
        let mut f  = OpenOptions::new().create(true).append(true)
            .open(self.out.join(file)).await?;
        f.write_all(line.as_bytes()).await?;
        // tokio finishes writes in the background unless flushed
        f.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Gateway for OutboxGateway {
    async fn send_message(&self, message: OutboundMessage) -> EngineResult<()> {
        debug!(chat_id = message.chat_id, buttons = message.buttons.len(), "outbound message");
        self.append("messages.jsonl", &message).await
    }

    async fn answer_callback(&self, answer: CallbackAnswer) -> EngineResult<()> {
        self.append("callback_answers.jsonl", &answer).await
    }

    async fn create_invite_link(&self, name: &str) -> EngineResult<String> {
        let link = format!("https://t.me/{}", self.invite_code(name));
        self.append(
            "invite_links.jsonl",
            &InviteRecord { chat_id: self.target_chat_id, name, invite_link: &link },
        )
        .await?;
        info!(name, link = %link, "invite link minted");
        Ok(link)
    }

    async fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }
}

// ── Test double ───────────────────────────────────────────────────────────────
