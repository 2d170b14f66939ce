use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use shared::domain::{StaffRole, ThreadId};
use sync_engine::{
    load_config, AttachmentUpload, ComposeDraft, ConsoleAdapter, EngineHandle, EngineNotice,
    EngineSeams, Identity, StoreSnapshot,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Role {
    ClinicConsultant,
    HealthExpert,
    NutritionSpecialist,
}

impl From<Role> for StaffRole {
    fn from(role: Role) -> Self {
        match role {
            Role::ClinicConsultant => StaffRole::ClinicConsultant,
            Role::HealthExpert => StaffRole::HealthExpert,
            Role::NutritionSpecialist => StaffRole::NutritionSpecialist,
        }
    }
}

#[derive(Parser, Debug)]
struct Args {
    /// TOML config file. Defaults to ./consult_sync.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    push_url: Option<String>,
    /// Staff user id the console runs as.
    #[arg(long)]
    actor: String,
    #[arg(long, value_enum, default_value = "clinic-consultant")]
    role: Role,
    /// Thread to open after hydrate.
    #[arg(long)]
    thread: Option<String>,
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_filter)),
        )
        .init();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        config.server_url = server_url;
    }
    if let Some(push_url) = args.push_url {
        config.push_url = Some(push_url);
    }

    let identity = Identity::new(args.actor.as_str(), args.role.into());
    let seams = EngineSeams::from_config(&config, &identity.actor)?;
    let engine = EngineHandle::start(&config, identity, seams);
    let console = ConsoleAdapter::new(engine.clone());
    println!(
        "Console for {} ({}) against {}",
        console.actor(),
        console.role().label(),
        config.server_url
    );

    engine.connect().await;
    match engine.hydrate().await {
        Ok(report) => println!(
            "Hydrated {} threads, {} messages",
            report.threads_created, report.messages_merged
        ),
        Err(err) => warn!("console: initial hydrate failed, use /hydrate to retry: {err:#}"),
    }
    print_threads(&console.snapshot());
    if let Some(thread) = args.thread {
        open(&console, &ThreadId::new(thread)).await;
    }

    let notices = tokio::spawn(print_notices(engine.clone()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if !handle_line(&console, line.trim()).await {
                    break;
                }
            }
        }
    }

    notices.abort();
    engine.shutdown().await;
    Ok(())
}

/// Returns false when the console should exit.
async fn handle_line(console: &ConsoleAdapter, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "/quit" => return false,
        "/threads" => print_threads(&console.snapshot()),
        "/hydrate" => match console.engine().hydrate().await {
            Ok(report) => println!("Hydrated: {report:?}"),
            Err(err) => println!("Hydrate failed: {err:#}"),
        },
        "/open" => open(console, &ThreadId::new(rest.trim())).await,
        "/close" => console.engine().close_thread().await,
        "/read" => {
            if let Some(thread_id) = active(console).await {
                match console.mark_read(&thread_id).await {
                    Ok(changed) => println!("Marked read (changed: {changed})"),
                    Err(err) => println!("Mark read failed: {err}"),
                }
            }
        }
        "/attach" => {
            let (path, text) = rest.split_once(' ').unwrap_or((rest, ""));
            match read_upload(Path::new(path.trim())).await {
                Ok(upload) => {
                    send(console, ComposeDraft::text(text).with_attachment(upload)).await
                }
                Err(err) => println!("Could not read attachment: {err:#}"),
            }
        }
        _ => send(console, ComposeDraft::text(line)).await,
    }
    true
}

async fn active(console: &ConsoleAdapter) -> Option<ThreadId> {
    let thread_id = console.engine().active_thread().await;
    if thread_id.is_none() {
        println!("No thread open, use /open <thread id>");
    }
    thread_id
}

async fn open(console: &ConsoleAdapter, thread_id: &ThreadId) {
    match console.open_thread(thread_id).await {
        Ok(thread) => {
            println!("== {} ({} unread)", thread.title(), thread.unread_count);
            for message in &thread.messages {
                println!(
                    "[{}] {}: {}",
                    message.created_at.format("%Y-%m-%d %H:%M"),
                    message.sender_id,
                    message.text.as_deref().unwrap_or("")
                );
            }
        }
        Err(err) => println!("Cannot open {thread_id}: {err}"),
    }
}

async fn send(console: &ConsoleAdapter, draft: ComposeDraft) {
    let Some(thread_id) = active(console).await else {
        return;
    };
    match console.send(&thread_id, &draft).await {
        Ok(message) => println!("Sent {}", message.id),
        Err(err) if err.is_retryable() => println!("Send failed, draft kept, try again: {err}"),
        Err(err) => println!("Send rejected: {err}"),
    }
}

async fn read_upload(path: &Path) -> Result<AttachmentUpload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .context("attachment path has no file name")?
        .to_string();
    Ok(AttachmentUpload {
        file_name,
        mime_type: None,
        bytes,
    })
}

fn print_threads(snapshot: &StoreSnapshot) {
    if snapshot.threads.is_empty() {
        println!("No threads yet");
    }
    for thread in &snapshot.threads {
        println!(
            "{}  {}  unread={}  last={}",
            thread.id,
            thread.title(),
            thread.unread_count,
            thread.last_activity.format("%Y-%m-%d %H:%M")
        );
    }
}

async fn print_notices(engine: EngineHandle) {
    let mut notices = engine.subscribe_notices();
    let mut snapshots = engine.subscribe();
    loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Ok(EngineNotice::ConnectionChanged(state)) => println!("* connection {state}"),
                Ok(EngineNotice::ConnectivityWarning { thread_id }) => {
                    println!("* live updates for {thread_id} may be delayed")
                }
                Ok(EngineNotice::ServerError(err)) => println!("* server error: {err}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let unread = snapshots.borrow_and_update().total_unread();
                println!("* {unread} unread");
            }
        }
    }
}
