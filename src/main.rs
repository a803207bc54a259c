use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use regex::Regex;
use tokio::{
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use rollcall::{
    attendance::{AttendanceTracker, CommitStatus, LinkResolution},
    config::{Config, POLL_INTERVAL},
    directory::NullDirectory,
    identity::IdentityResolver,
    query::A2sQuery,
    rcon::RconClient,
};

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Game-server attendance daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the presence-polling daemon.
    Run,
    /// Preview which buffered identities would qualify.
    Review {
        #[arg(long)]
        threshold: Option<u64>,
    },
    /// Submit qualifying attendance for an event and clear processed entries.
    Commit {
        #[arg(long)]
        event: String,
        #[arg(long)]
        threshold: Option<u64>,
    },
    /// Drop the attendance buffer without submitting anything.
    Discard,
}

fn build_tracker(config: &Config) -> (Arc<RconClient>, Arc<AttendanceTracker>) {
    let console = Arc::new(RconClient::new(
        config.server_host.clone(),
        config.console_port,
        config.console_password.clone(),
    ));
    let query = Arc::new(A2sQuery::new(config.server_host.clone(), config.query_port));
    let resolver = IdentityResolver::new(query.clone(), console.clone(), None);
    let tracker = Arc::new(AttendanceTracker::new(
        config.window,
        query,
        resolver,
        Arc::new(NullDirectory),
        config.buffer_path.clone(),
    ));
    (console, tracker)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Reads RUST_LOG, defaults to info.
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let (console, tracker) = build_tracker(&config);

    match cli.command {
        Command::Run => run_daemon(&config, console, tracker).await,
        Command::Review { threshold } => {
            let threshold = threshold.unwrap_or(config.window.min_minutes);
            let report = tracker.review(threshold).await;
            if report.qualified.is_empty() {
                println!(
                    "no one met the {threshold}m threshold (max buffered: {}m)",
                    report.max_minutes
                );
                return Ok(());
            }
            for entry in &report.qualified {
                match &entry.resolution {
                    LinkResolution::Linked(profile) => {
                        println!("{} ({}): {}m", profile.alias, entry.identifier, entry.minutes);
                    }
                    LinkResolution::Rejected(reason) => {
                        println!("{} ({}m): {reason}", entry.identifier, entry.minutes);
                    }
                }
            }
            Ok(())
        }
        Command::Commit { event, threshold } => {
            let threshold = threshold.unwrap_or(config.window.min_minutes);
            let report = tracker.commit(&event, threshold).await;
            for entry in &report.entries {
                let who = entry.alias.as_deref().unwrap_or(&entry.identifier);
                match &entry.status {
                    CommitStatus::Submitted => println!("{who}: submitted ({}m)", entry.minutes),
                    CommitStatus::SubmissionFailed => println!("{who}: submission failed"),
                    CommitStatus::Rejected(reason) => println!("{who}: {reason}"),
                }
            }
            println!(
                "event {}: {} of {} submitted",
                report.event_id,
                report.submitted,
                report.entries.len()
            );
            Ok(())
        }
        Command::Discard => {
            tracker.discard().await;
            println!("attendance buffer discarded");
            Ok(())
        }
    }
}

async fn run_daemon(
    config: &Config,
    console: Arc<RconClient>,
    tracker: Arc<AttendanceTracker>,
) -> Result<()> {
    info!(
        "rollcall starting: server {}:{} (query {}), window day {} {:02}:00-{:02}:00",
        config.server_host,
        config.console_port,
        config.query_port,
        config.window.day,
        config.window.start_hour,
        config.window.end_hour,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    let (stream_tx, mut stream_rx) = mpsc::unbounded_channel::<String>();
    let console_task = console.start(stream_tx, cancel.clone());

    let stream_task = tokio::spawn(async move {
        let mut seen = RecentCommands::new();
        while let Some(line) = stream_rx.recv().await {
            handle_stream_line(&line, &mut seen);
        }
    });

    // Baseline poll so a restart mid-window resumes tracking immediately.
    tracker.poll(true).await;

    let mut ticker = interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; the forced poll covered it
    loop {
        tokio::select! {
            _ = ticker.tick() => tracker.poll(false).await,
            _ = cancel.cancelled() => break,
        }
    }

    stream_task.abort();
    if let Some(task) = console_task {
        let _ = task.await;
    }
    info!("rollcall stopped");
    Ok(())
}

static CHAT_COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\((Global|Side|Command|Group|Vehicle)\)\s+(.+?):\s+!(\S+)").unwrap()
});

static MISSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Mission\s+(.+?)\s+read\.").unwrap());

/// Suppresses the duplicate chat lines the console emits when a player's
/// message reaches multiple channels.
struct RecentCommands {
    seen: HashMap<String, Instant>,
}

impl RecentCommands {
    const WINDOW: Duration = Duration::from_secs(2);

    fn new() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }

    fn is_duplicate(&mut self, key: &str) -> bool {
        let now = Instant::now();
        self.seen.retain(|_, at| now.duration_since(*at) < Self::WINDOW);
        match self.seen.get(key) {
            Some(_) => true,
            None => {
                self.seen.insert(key.to_string(), now);
                false
            }
        }
    }
}

fn handle_stream_line(line: &str, seen: &mut RecentCommands) {
    if let Some(captures) = CHAT_COMMAND_RE.captures(line) {
        let player = &captures[2];
        let command = &captures[3];
        let key = format!("{player}:{command}");
        if seen.is_duplicate(&key) {
            return;
        }
        info!("in-game command: {player} -> !{command}");
        return;
    }
    if let Some(captures) = MISSION_RE.captures(line) {
        info!("mission loaded: {}", &captures[1]);
        return;
    }
    log::debug!("console: {line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_command_lines_are_recognized() {
        let captures = CHAT_COMMAND_RE
            .captures("(Side) Sgt Smith: !status now")
            .unwrap();
        assert_eq!(&captures[2], "Sgt Smith");
        assert_eq!(&captures[3], "status");

        assert!(CHAT_COMMAND_RE.captures("(Side) Sgt Smith: hello").is_none());
        assert!(CHAT_COMMAND_RE.captures("garbage").is_none());
    }

    #[test]
    fn duplicate_commands_are_suppressed_within_the_window() {
        let mut seen = RecentCommands::new();
        assert!(!seen.is_duplicate("smith:status"));
        assert!(seen.is_duplicate("smith:status"));
        assert!(!seen.is_duplicate("smith:sync"));
    }

    #[test]
    fn mission_lines_are_recognized() {
        let captures = MISSION_RE.captures("Mission co40_domination.Altis read.").unwrap();
        assert_eq!(&captures[1], "co40_domination.Altis");
    }
}
