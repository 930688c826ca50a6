//! fieldsync CLI - Command line front end for the sync engine.
//!
//! Keeps a local datastore and a file-backed backend under one data
//! directory, edits records offline and runs sync turns on demand.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fieldsync_common::{ActorId, EntityId, EntityType};
use fieldsync_remote::MemoryRemote;
use fieldsync_sync::model::{Listing, Task, TaskAssignee, User};
use fieldsync_sync::{
    DelayMode, LocalStore, StaticIdentity, SyncConfig, SyncManager, SyncState, SyncableEntity,
    TurnReport,
};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "fieldsync - Local-first record sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the local store, backend snapshot and config.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Identity used for remote calls and audit records.
    #[arg(long, global = true, default_value = "local-user")]
    actor: String,

    /// Simulate a lost connection for this invocation.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage users.
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Manage listings.
    Listing {
        #[command(subcommand)]
        command: ListingCommands,
    },

    /// Manage tasks.
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Delete a record locally and queue the remote delete.
    Delete {
        #[arg(short, long, value_parser = parse_entity_type)]
        entity: EntityType,

        #[arg(short, long, value_parser = parse_id)]
        id: EntityId,
    },

    /// Run one sync turn and print its report.
    Sync,

    /// Show per-type sync state counts and cursors.
    Status,

    /// Run one retry pass over failed records.
    RetryFailed,

    /// Reset the retry budget of a failed record.
    Reset {
        #[arg(short, long, value_parser = parse_entity_type)]
        entity: EntityType,

        #[arg(short, long, value_parser = parse_id)]
        id: EntityId,
    },

    /// Show the audit trail of a record.
    History {
        #[arg(short, long, value_parser = parse_entity_type)]
        entity: EntityType,

        #[arg(short, long, value_parser = parse_id)]
        id: EntityId,
    },

    /// Restore a deleted record from the audit log.
    Restore {
        #[arg(short, long, value_parser = parse_entity_type)]
        entity: EntityType,

        #[arg(short, long, value_parser = parse_id)]
        id: EntityId,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Add a user.
    Add {
        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        email: Option<String>,
    },
}

#[derive(Subcommand)]
enum ListingCommands {
    /// Add a listing.
    Add {
        #[arg(short, long)]
        title: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Add a task.
    Add {
        #[arg(short, long)]
        title: String,

        /// Listing the task belongs to.
        #[arg(short, long, value_parser = parse_id)]
        listing: Option<EntityId>,
    },

    /// List local tasks with their sync state.
    List,

    /// Assign a user to a task.
    Assign {
        #[arg(short, long, value_parser = parse_id)]
        task: EntityId,

        #[arg(short, long, value_parser = parse_id)]
        user: EntityId,
    },
}

fn parse_entity_type(s: &str) -> std::result::Result<EntityType, String> {
    s.parse().map_err(|e: fieldsync_common::Error| e.to_string())
}

fn parse_id(s: &str) -> std::result::Result<EntityId, String> {
    EntityId::parse(s).map_err(|e| e.to_string())
}

/// Everything one invocation works on.
struct Workspace {
    manager: SyncManager,
    remote: Arc<MemoryRemote>,
    remote_path: PathBuf,
}

impl Workspace {
    async fn open(cli: &Cli) -> Result<Self> {
        let data_dir = match &cli.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .context("No data directory on this platform; pass --data-dir")?
                .join("fieldsync"),
        };
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;
        info!("Using data directory: {}", data_dir.display());

        let config = SyncConfig::load(data_dir.join("config.json"))
            .await
            .context("Failed to load config")?;
        let store = LocalStore::open(data_dir.join("local.json"))
            .await
            .context("Failed to open local store")?;
        let remote_path = data_dir.join("remote.json");
        let remote = Arc::new(
            MemoryRemote::load(&remote_path)
                .await
                .context("Failed to load backend snapshot")?,
        );
        if cli.offline {
            remote.set_offline(true).await;
        }

        let actor = ActorId::new(cli.actor.as_str()).context("Invalid actor")?;
        let manager = SyncManager::new(
            store,
            remote.clone(),
            Arc::new(StaticIdentity::new(actor)),
            config,
            DelayMode::Real,
        )
        .context("Failed to create sync manager")?;

        Ok(Self {
            manager,
            remote,
            remote_path,
        })
    }

    /// Let queued turns finish, then persist the backend.
    async fn close(self) -> Result<()> {
        self.manager.shutdown().await;
        self.remote
            .save(&self.remote_path)
            .await
            .context("Failed to save backend snapshot")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let workspace = Workspace::open(&cli).await?;
    let result = run(&workspace.manager, cli.command).await;
    workspace.close().await?;
    result
}

async fn run(manager: &SyncManager, command: Commands) -> Result<()> {
    match command {
        Commands::User {
            command: UserCommands::Add { name, email },
        } => cmd_user_add(manager, name, email).await,
        Commands::Listing {
            command: ListingCommands::Add { title },
        } => cmd_listing_add(manager, title).await,
        Commands::Task { command } => match command {
            TaskCommands::Add { title, listing } => cmd_task_add(manager, title, listing).await,
            TaskCommands::List => cmd_task_list(manager).await,
            TaskCommands::Assign { task, user } => cmd_task_assign(manager, task, user).await,
        },
        Commands::Delete { entity, id } => cmd_delete(manager, entity, id).await,
        Commands::Sync => cmd_sync(manager).await,
        Commands::Status => cmd_status(manager).await,
        Commands::RetryFailed => cmd_retry_failed(manager).await,
        Commands::Reset { entity, id } => cmd_reset(manager, entity, id).await,
        Commands::History { entity, id } => cmd_history(manager, entity, id).await,
        Commands::Restore { entity, id } => cmd_restore(manager, entity, id).await,
    }
}

async fn cmd_user_add(manager: &SyncManager, name: String, email: Option<String>) -> Result<()> {
    let mut user = User::new(name);
    if let Some(email) = email {
        user = user.with_email(email);
    }
    let user = manager.save(user).await.context("Failed to save user")?;
    println!("User added: {} ({})", user.name, user.id());
    Ok(())
}

async fn cmd_listing_add(manager: &SyncManager, title: String) -> Result<()> {
    let listing = manager
        .save(Listing::new(title))
        .await
        .context("Failed to save listing")?;
    println!("Listing added: {} ({})", listing.title, listing.id());
    Ok(())
}

async fn cmd_task_add(manager: &SyncManager, title: String, listing: Option<EntityId>) -> Result<()> {
    let mut task = Task::new(title);
    if let Some(listing_id) = listing {
        if manager.get::<Listing>(listing_id).await?.is_none() {
            anyhow::bail!("No listing {}", listing_id);
        }
        task = task.for_listing(listing_id);
    }
    let task = manager.save(task).await.context("Failed to save task")?;
    println!("Task added: {} ({})", task.title, task.id());
    Ok(())
}

async fn cmd_task_list(manager: &SyncManager) -> Result<()> {
    let mut tasks = manager.all::<Task>().await.context("Failed to read tasks")?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    tasks.sort_by_key(|t| t.meta().updated_at());

    for task in tasks {
        let meta = task.meta();
        println!(
            "  {} {} [{:?}] {} assignees, {}",
            task.id(),
            task.title,
            task.status,
            task.assignees().len(),
            meta.sync_state()
        );
        if meta.sync_state() == SyncState::Failed {
            println!(
                "      retries: {}, error: {}",
                meta.retry_count(),
                meta.last_sync_error().unwrap_or("unknown")
            );
        }
    }
    Ok(())
}

async fn cmd_task_assign(manager: &SyncManager, task: EntityId, user: EntityId) -> Result<()> {
    let link = manager
        .link(TaskAssignee::new(task, user))
        .await
        .context("Failed to assign task")?;
    println!("Assigned user {} to task {} ({})", user, task, link.id());
    Ok(())
}

async fn cmd_delete(manager: &SyncManager, entity: EntityType, id: EntityId) -> Result<()> {
    if manager.delete(entity, id).await.context("Failed to delete")? {
        println!("Deleted {} {}", entity, id);
    } else {
        println!("No {} {}", entity, id);
    }
    Ok(())
}

async fn cmd_sync(manager: &SyncManager) -> Result<()> {
    let report = manager.sync_now().await.context("Sync did not run")?;
    print_report(&report);
    match report.first_error() {
        Some(error) => anyhow::bail!("Sync finished with errors: {}", error),
        None => Ok(()),
    }
}

fn print_report(report: &TurnReport) {
    println!("Sync turn:");
    if let (Some(started), Some(finished)) = (report.started_at, report.finished_at) {
        println!(
            "  Duration: {} ms",
            (finished - started).num_milliseconds()
        );
    }
    if report.phantoms_repaired > 0 {
        println!("  Phantom rows repaired: {}", report.phantoms_repaired);
    }
    for entity_type in EntityType::DEPENDENCY_ORDER {
        let down = report.down.get(&entity_type);
        let up = report.up.get(&entity_type);
        if down.is_none() && up.is_none() {
            continue;
        }
        let mut line = format!("  {}:", entity_type);
        if let Some(down) = down {
            line.push_str(&format!(
                " fetched {}, applied {}, kept local {}, skipped {}",
                down.fetched, down.applied, down.kept_local, down.skipped
            ));
        }
        if let Some(up) = up {
            line.push_str(&format!(
                "; pushed {}, deleted {}, failed {}",
                up.pushed, up.deleted, up.failed
            ));
            if up.exhausted > 0 {
                line.push_str(&format!(", exhausted {}", up.exhausted));
            }
            if up.deduplicated > 0 {
                line.push_str(&format!(", deduplicated {}", up.deduplicated));
            }
        }
        println!("{}", line);
    }
    for (entity_type, error) in &report.errors {
        match entity_type {
            Some(t) => println!("  Error ({}): {}", t, error),
            None => println!("  Error: {}", error),
        }
    }
    if let Some(fatal) = &report.fatal {
        println!("  Aborted: {}", fatal);
    }
}

async fn cmd_status(manager: &SyncManager) -> Result<()> {
    let store = manager.store();
    println!("Local store: {}", display_path(store.path()));
    for entity_type in EntityType::DEPENDENCY_ORDER {
        let states = store.sync_states(entity_type).await?;
        let tombstones = store.tombstones(entity_type).await?.len();
        if states.is_empty() && tombstones == 0 {
            continue;
        }
        let count = |state: SyncState| states.iter().filter(|(_, m)| m.sync_state() == state).count();
        let cursor = store
            .cursor(entity_type)
            .await?
            .map(|c| c.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {}: {} synced, {} pending, {} failed, {} deletes queued (cursor: {})",
            entity_type,
            count(SyncState::Synced),
            count(SyncState::Pending),
            count(SyncState::Failed),
            tombstones,
            cursor
        );
    }
    Ok(())
}

fn display_path(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "in memory".to_string())
}

async fn cmd_retry_failed(manager: &SyncManager) -> Result<()> {
    let summary = manager
        .retry_failed_entities()
        .await
        .context("Retry pass failed")?;
    println!(
        "Retried {} records: {} recovered, {} exhausted",
        summary.attempted, summary.recovered, summary.exhausted
    );
    Ok(())
}

async fn cmd_reset(manager: &SyncManager, entity: EntityType, id: EntityId) -> Result<()> {
    if manager.reset_retries(entity, id).await? {
        println!("Reset {} {}; it will be pushed on the next turn", entity, id);
    } else {
        println!("{} {} is not failed", entity, id);
    }
    Ok(())
}

async fn cmd_history(manager: &SyncManager, entity: EntityType, id: EntityId) -> Result<()> {
    let records = manager
        .history(entity, id)
        .await
        .context("Failed to read audit trail")?;
    if records.is_empty() {
        println!("No history for {} {}", entity, id);
        return Ok(());
    }
    println!("History of {} {}:", entity, id);
    for record in records {
        println!(
            "  {} {:?} by {}",
            record.at.to_rfc3339(),
            record.action,
            record
                .actor
                .as_ref()
                .map(|a| a.as_str())
                .unwrap_or("system")
        );
    }
    Ok(())
}

async fn cmd_restore(manager: &SyncManager, entity: EntityType, id: EntityId) -> Result<()> {
    let row = manager
        .restore(entity, id)
        .await
        .with_context(|| format!("Failed to restore {} {}", entity, id))?;
    println!(
        "Restored {} {} (updated {})",
        entity,
        row.id,
        row.updated_at.to_rfc3339()
    );
    Ok(())
}
