// refwatch/src/main.rs
//
// refwatch — referral attribution with fraud scoring, deferred verification
// and cached leaderboards.
//
// Members join a tracked chat through affiliate invite links. refwatch
// attributes each join to the owning affiliate, flags suspicious joins
// (fresh accounts, subnet bursts), confirms clean ones after a delay, and
// answers affiliate/admin commands from a JSONL update feed.
//
// Two intake modes:
//   tail    — follow a live JSONL update feed (production)
//   replay  — replay a captured feed at scaled speed (testing/research)
//
// Usage:
//   refwatch --target-chat-id -1001234 --admin-ids 11,12
//   refwatch --target-chat-id -1001234 --mode replay --path captured.jsonl --speed 10.0

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod admin;
mod clock;
mod config;
mod engine;
mod error;
mod events;
mod gateway;
mod health;
mod intake;
mod state;

use admin::CommandHandler;
use clock::{SharedClock, SystemClock};
use config::{Mode, Settings};
use engine::heuristics::{BurstDetector, Heuristics};
use engine::leaderboard::LeaderboardCache;
use engine::membership::{JoinOutcome, LeaveOutcome, MembershipHandler};
use engine::review::ReviewWorkflow;
use engine::scheduler::VerificationScheduler;
use events::Update;
use gateway::{Gateway, OutboxGateway};
use health::HealthServer;
use state::snapshot::{SnapshotConfig, SnapshotPersistence};
use state::store::MemoryRepository;

const CHANNEL_CAPACITY: usize = 4096;

// ── Pipeline ──────────────────────────────────────────────────────────────────

struct Pipeline {
    membership: MembershipHandler<MemoryRepository>,
    commands:   Arc<CommandHandler<MemoryRepository>>,
}

impl Pipeline {
    /// One update at a time, in feed order.
    async fn process(&self, update: Update) {
        match update {
            Update::Join(join) => match self.membership.handle_join(&join) {
                Ok(JoinOutcome::Attributed { attribution_id, affiliate_id, flagged, reopened }) => {
                    info!(
                        user_id = join.target_user_id,
                        attribution_id,
                        affiliate_id,
                        flagged,
                        reopened = reopened.len(),
                        "join attributed"
                    );
                }
                Ok(outcome) => info!(user_id = join.target_user_id, ?outcome, "join not attributed"),
                Err(e) => error!(user_id = join.target_user_id, error = %e, "join handling failed"),
            },
            Update::Leave(leave) => match self.membership.handle_leave(&leave) {
                Ok(LeaveOutcome::Revoked { attribution_id }) => {
                    info!(user_id = leave.target_user_id, attribution_id, "attribution revoked on leave");
                }
                Ok(_) => {}
                Err(e) => error!(user_id = leave.target_user_id, error = %e, "leave handling failed"),
            },
            Update::Command(msg) => self.commands.handle_command(&msg).await,
            Update::Callback(query) => self.commands.handle_callback(&query).await,
        }
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("refwatch=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::parse();
    init_tracing(settings.log_json)?;
    settings.validate()?;

    let clock: SharedClock = Arc::new(SystemClock);

    // Restore before accepting any update
    let snapshot_path = settings.snapshot_path();
    let repo = Arc::new(match snapshot_path {
        Some(ref path) => SnapshotPersistence::restore(path).await?,
        None => {
            warn!("no snapshot path configured — state is in memory only");
            MemoryRepository::new()
        }
    });
    let persistence = snapshot_path.map(|path| {
        Arc::new(SnapshotPersistence::new(
            SnapshotConfig { path, interval_secs: settings.checkpoint_secs },
            Arc::clone(&repo),
        ))
    });

    let gateway: Arc<dyn Gateway> = Arc::new(OutboxGateway::new(
        settings.output.clone(),
        settings.target_chat_id,
        settings.admin_ids()?,
        Arc::clone(&clock),
    )?);
    let scheduler = Arc::new(VerificationScheduler::with_delay(
        Arc::clone(&repo),
        Arc::clone(&clock),
        settings.verify_delay(),
    ));
    let burst       = Arc::new(BurstDetector::new());
    let leaderboard = Arc::new(LeaderboardCache::new(Arc::clone(&repo), Arc::clone(&clock)));
    let review      = Arc::new(ReviewWorkflow::new(
        Arc::clone(&repo),
        Arc::clone(&scheduler),
        Arc::clone(&gateway),
        Arc::clone(&clock),
    ));
    let pipeline = Pipeline {
        membership: MembershipHandler::new(
            Arc::clone(&repo),
            Heuristics::new(Arc::clone(&burst)),
            Arc::clone(&scheduler),
        ),
        commands: Arc::new(CommandHandler::new(
            Arc::clone(&repo),
            Arc::clone(&leaderboard),
            review,
            gateway,
            Arc::clone(&clock),
        )),
    };

    info!(
        target_chat_id = settings.target_chat_id,
        mode           = ?settings.mode,
        feed           = %settings.path.display(),
        output         = %settings.output.display(),
        "refwatch starting"
    );

    // Eager rollup so the first /top is served from cache
    leaderboard.refresh();
    tokio::spawn(Arc::clone(&leaderboard).rollup_loop(settings.rollup_interval()));
    tokio::spawn(Arc::clone(&burst).housekeeping_loop(Arc::clone(&clock)));
    tokio::spawn(Arc::clone(&pipeline.commands).housekeeping_loop());
    if let Some(ref p) = persistence {
        tokio::spawn(Arc::clone(p).checkpoint_loop());
    }

    let health = HealthServer::bind(settings.health_addr).await?;
    info!(addr = %health.local_addr()?, "health probe listening");
    tokio::spawn(async move {
        if let Err(e) = health.serve().await {
            error!(error = %e, "health probe stopped");
        }
    });

    // Update source
    let (tx, mut rx) = mpsc::channel::<Update>(CHANNEL_CAPACITY);
    let path = settings.path.clone();
    let source = match settings.mode {
        Mode::Tail => tokio::spawn(async move {
            if let Err(e) = intake::tail_jsonl(path, tx, true).await {
                error!(error = %e, "update feed stopped");
            }
        }),
        Mode::Replay => {
            let speed = settings.speed;
            tokio::spawn(async move {
                if let Err(e) = intake::replay_jsonl(path, tx, speed).await {
                    error!(error = %e, "update replay failed");
                }
            })
        }
    };

    // Main consumer — sequential, so store transactions never interleave
    let consume = async {
        while let Some(update) = rx.recv().await {
            pipeline.process(update).await;
        }
    };
    tokio::select! {
        _ = consume => info!("update feed closed"),
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "signal handler failed");
            }
            info!("shutdown requested");
        }
    }

    // Graceful shutdown
    source.abort();
    scheduler.shutdown().await;
    if let Some(p) = persistence {
        if let Err(e) = p.save_checkpoint().await {
            error!("final snapshot failed: {:#}", e);
        }
    }
    info!("refwatch stopped");
    Ok(())
}
