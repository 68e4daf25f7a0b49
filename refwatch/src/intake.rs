// refwatch/src/intake.rs
//
// Inbound update feed. The gateway side writes one `Update` per JSON line
// (membership changes, commands, button presses); refwatch follows the file
// and pushes parsed updates into the consumer channel.
//
//   tail    follow a live feed, starting at its current end
//   replay  read a captured feed once, pacing timestamped updates at `speed`
//
// Unparseable lines are logged and skipped; they never stop the feed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::Update;

const POLL_INTERVAL_MS: u64 = 50;

pub fn parse_line(line: &str) -> Option<Update> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Update>(line) {
        Ok(update) => Some(update),
        Err(e) => {
            warn!(error = %e, "unparseable update line");
            None
        }
    }
}

fn timestamp_of(update: &Update) -> Option<DateTime<Utc>> {
    match update {
        Update::Join(j) => Some(j.timestamp),
        Update::Leave(l) => Some(l.timestamp),
        Update::Command(_) | Update::Callback(_) => None,
    }
}

/// Follow `path` forever. With `seek_end`, lines already in the file are skipped.
pub async fn tail_jsonl(path: PathBuf, tx: mpsc::Sender<Update>, seek_end: bool) -> Result<()> {
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("opening update feed {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    if seek_end {
        let mut skipped = 0u64;
        while lines.next_line().await?.is_some() {
            skipped += 1;
        }
        debug!(skipped, "skipped existing feed lines");
    }

    info!(path = %path.display(), "tailing update feed");
    loop {
        match lines.next_line().await? {
            Some(line) => {
                if let Some(update) = parse_line(&line) {
                    if tx.send(update).await.is_err() {
                        break;
                    }
                }
            }
            None => tokio::time::sleep(tokio::time::Duration::from_millis(POLL_INTERVAL_MS)).await,
        }
    }
    Ok(())
}

/// Send every update in `path` in file order. Gaps between timestamped
/// updates are replayed divided by `speed`; untimestamped ones go out
/// immediately.
pub async fn replay_jsonl(path: PathBuf, tx: mpsc::Sender<Update>, speed: f64) -> Result<()> {
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading update feed {}", path.display()))?;
    let updates: Vec<Update> = content.lines().filter_map(parse_line).collect();
    info!(path = %path.display(), updates = updates.len(), speed, "replaying update feed");

    let mut last: Option<DateTime<Utc>> = None;
    for update in updates {
        if let Some(ts) = timestamp_of(&update) {
            if let Some(prev) = last {
                let gap = (ts - prev).num_milliseconds();
                if gap > 0 {
                    let secs = gap as f64 / 1000.0 / speed;
                    tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
                }
            }
            last = Some(ts);
        }
        if tx.send(update).await.is_err() {
            break;
        }
    }
    info!("replay complete");
    Ok(())
}
