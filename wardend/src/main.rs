//! wardend: single-operator host administration daemon.
//!
//! One sequential control loop per host: long-poll the Telegram Bot API,
//! authorize, dispatch, advance the offset. Slow work (shell commands,
//! tasks, confirmed actions, deploys) runs detached and is delivered from
//! the completion channel at the top of each cycle.

mod commands;
mod config;
mod confirm;
mod cursor;
mod dispatch;
mod errors;
mod journal;
mod lock;
mod release;
mod session;
mod supervise;
mod tasks;
mod telegram;

use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");
const TRANSPORT_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "wardend", version = DAEMON_VERSION)]
#[command(about = "Telegram host administration daemon")]
struct Cli {
    /// Path to wardend.toml (or set WARDEND_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config_path = config::resolve_config_path(cli.config).context(
        "no configuration found: pass --config, set WARDEND_CONFIG, or put wardend.toml in the working directory",
    )?;
    let mut cfg = config::load_config(&config_path)?;
    if let Some(data_dir) = cli.data_dir {
        cfg.data_dir = data_dir;
    }

    info!(
        "wardend {} starting with config {}",
        DAEMON_VERSION,
        config_path.display()
    );

    // Deploys shell out to git; refuse to start half-working.
    if !cfg.projects.is_empty() {
        which::which("git")
            .context("git is required for the configured projects but was not found in PATH")?;
    }

    let _instance_lock = match lock::acquire(&cfg.data_dir)? {
        lock::LockOutcome::Acquired(instance_lock) => instance_lock,
        lock::LockOutcome::AlreadyHeld => {
            // The running instance is authoritative; this is not an error.
            info!("another wardend instance holds the lock; exiting");
            return Ok(());
        }
    };

    let bot = telegram::BotClient::new(&cfg.bot_token, cfg.poll_timeout_secs)?;
    let cursor = cursor::CursorStore::new(&cfg.data_dir);
    let confirm = confirm::ConfirmStore::new(&cfg.data_dir);
    let home = std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/root"));
    let session = session::SessionManager::new(&cfg.data_dir, home);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tasks = tasks::TaskQueue::new(&cfg.data_dir, cfg.max_concurrent_tasks, tx.clone());
    let releases = release::ReleaseManager::new(&cfg.data_dir);
    let journal = journal::Journal::open(&cfg.data_dir.join("journal.jsonl"), cfg.journal_key())?;

    let poll_timeout = cfg.poll_timeout_secs;
    let mut app = dispatch::App::new(cfg, bot, confirm, session, tasks, releases, journal, tx);

    let mut offset = cursor.load_or_zero();
    info!(offset, "entering control loop");

    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        // Deliver whatever finished since the last cycle.
        while let Ok(completion) = rx.try_recv() {
            app.deliver(completion).await;
        }

        let swept = app.confirm.sweep();
        if swept > 0 {
            debug!(swept, "stale confirmation tokens removed");
        }

        let updates = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            result = app.bot.get_updates(offset + 1, poll_timeout) => match result {
                Ok(updates) => updates,
                Err(err) => {
                    // Same cursor next time: duplicates are possible, loss is not.
                    warn!("poll failed, backing off: {}", err);
                    tokio::time::sleep(TRANSPORT_BACKOFF).await;
                    continue;
                }
            },
        };

        for update in updates {
            let update_id = update.update_id;
            app.handle_update(update).await;
            offset = update_id;
            if let Err(err) = cursor.save(offset) {
                warn!("failed to persist offset {}: {:#}", offset, err);
            }
        }
    }

    info!("shutting down");
    Ok(())
}
