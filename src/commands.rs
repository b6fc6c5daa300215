//! Subcommand handlers for taskqueue.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value};
use tracing::{info, warn};

use taskqueue_config::{Config, ConfigLoader, ConfigValidator};
use taskqueue_core::{Event, QueueManager, TaskInfo, TaskRegistry};
use taskqueue_store::SqliteTaskStore;

use crate::cli::{Commands, OutputFormat};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Handle a subcommand.
pub(crate) async fn handle_command(
    command: Commands,
    config: &Config,
    config_path: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::CheckConfig => check_config(config_path),
        Commands::Queues => list_queues(&open_manager(config).await?).await,
        Commands::Tasks { format } => list_tasks(&open_manager(config).await?, format).await,
        Commands::Task { id } => show_task(&open_manager(config).await?, id).await,
        Commands::Events { task, format } => {
            list_events(&open_manager(config).await?, task, format).await
        }
        Commands::DeleteTask { id } => delete_task(&open_manager(config).await?, id).await,
        Commands::DeleteEvent { id } => delete_event(&open_manager(config).await?, id).await,
        Commands::Purge {
            task_days,
            event_days,
        } => {
            let task_days = task_days.unwrap_or(config.retention.task_days);
            let event_days = event_days.unwrap_or(config.retention.event_days);
            purge(&open_manager(config).await?, task_days, event_days).await
        }
    }
}

/// Open the configured store without starting any queue workers.
async fn open_manager(config: &Config) -> anyhow::Result<QueueManager> {
    let warnings = ConfigValidator::validate(config).into_result()?;
    for warning in warnings {
        warn!("Config {}: {}", warning.path, warning.message);
    }

    let store = SqliteTaskStore::open(&config.store.path)
        .await
        .with_context(|| format!("Failed to open store at {}", config.store.path.display()))?
        .with_retry_limit(config.queues.retry_limit);
    info!("Using store at {}", config.store.path.display());

    Ok(QueueManager::new(Arc::new(store), TaskRegistry::new()))
}

async fn list_queues(manager: &QueueManager) -> anyhow::Result<()> {
    let names = manager.queue_names().await?;
    if names.is_empty() {
        println!("No queues found.");
        return Ok(());
    }

    let tasks = manager.tasks().await?;
    println!("{:<20} {:>8} {:>8}", "QUEUE", "QUEUED", "TOTAL");
    println!("{}", "-".repeat(38));
    for name in names {
        let total = tasks.iter().filter(|t| t.queue == name).count();
        let queued = tasks
            .iter()
            .filter(|t| t.queue == name && !t.status.is_terminal())
            .count();
        println!("{:<20} {:>8} {:>8}", name, queued, total);
    }
    Ok(())
}

async fn list_tasks(manager: &QueueManager, format: OutputFormat) -> anyhow::Result<()> {
    let tasks = manager.tasks().await?;

    match format {
        OutputFormat::Json => {
            let tasks: Vec<Value> = tasks.iter().map(task_json).collect();
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
        OutputFormat::Table => {
            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }
            println!(
                "{:<8} {:<12} {:<10} {:>7} {:>6} {:<19} {}",
                "ID", "QUEUE", "STATUS", "RETRIES", "EVENTS", "NEXT RUN", "DESCRIPTION"
            );
            println!("{}", "-".repeat(100));
            for task in &tasks {
                println!("{}", task_row(task));
            }
        }
    }
    Ok(())
}

async fn show_task(manager: &QueueManager, id: i64) -> anyhow::Result<()> {
    let Some(task) = manager.task(id).await? else {
        println!("Task {} not found.", id);
        return Ok(());
    };

    println!("Task: {}", task.description);
    println!("{}", "=".repeat(50));
    println!("ID:          {}", task.id);
    println!("Queue:       {}", task.queue);
    println!("Status:      {}", task.status);
    println!("Category:    {}", task.category);
    println!("Priority:    {}", task.priority);
    println!("Retries:     {}", task.retries);
    println!("Queued at:   {}", task.queued_at.format(TIME_FORMAT));
    println!("Next run:    {}", task.retry_at.format(TIME_FORMAT));
    if let Some(reason) = &task.failure_reason {
        println!("Failure:     {}", reason);
    }
    if let Some(exception) = &task.exception {
        println!("\nException:\n{}", exception);
    }

    let events = manager.events_for_task(id).await?;
    if !events.is_empty() {
        println!("\nEvents:");
        for event in &events {
            println!("  {}", event);
        }
    }
    Ok(())
}

async fn list_events(
    manager: &QueueManager,
    task: Option<i64>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let events = match task {
        Some(id) => manager.events_for_task(id).await?,
        None => manager.events().await?,
    };

    match format {
        OutputFormat::Json => {
            let events: Vec<Value> = events.iter().map(event_json).collect();
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        OutputFormat::Table => {
            if events.is_empty() {
                println!("No events found.");
                return Ok(());
            }
            println!(
                "{:<8} {:<8} {:<19} {:<12} {}",
                "ID", "TASK", "OCCURRED", "KIND", "DESCRIPTION"
            );
            println!("{}", "-".repeat(80));
            for event in &events {
                println!("{}", event_row(event));
            }
        }
    }
    Ok(())
}

async fn delete_task(manager: &QueueManager, id: i64) -> anyhow::Result<()> {
    if manager.task(id).await?.is_none() {
        println!("Task {} not found.", id);
        return Ok(());
    }
    manager.delete_task(id).await?;
    println!("Deleted task {}.", id);
    Ok(())
}

async fn delete_event(manager: &QueueManager, id: i64) -> anyhow::Result<()> {
    manager.delete_event(id).await?;
    println!("Deleted event {}.", id);
    Ok(())
}

async fn purge(manager: &QueueManager, task_days: u32, event_days: u32) -> anyhow::Result<()> {
    let tasks = manager.purge_tasks_older_than(task_days).await?;
    let events = manager.purge_events_older_than(event_days).await?;
    println!(
        "Purged {} tasks older than {} days and {} events older than {} days.",
        tasks, task_days, events, event_days
    );
    Ok(())
}

/// Validate the configuration file and report problems.
fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = if path.exists() {
        ConfigLoader::load(path)?
    } else {
        println!("{} not found, checking defaults.", path.display());
        Config::default()
    };

    let result = ConfigValidator::validate(&config);
    for error in &result.errors {
        println!("error:   {}: {}", error.path, error.message);
    }
    for warning in &result.warnings {
        println!("warning: {}: {}", warning.path, warning.message);
    }

    if !result.is_valid() {
        anyhow::bail!("configuration has {} error(s)", result.errors.len());
    }
    println!("Configuration OK.");
    Ok(())
}

fn task_row(task: &TaskInfo) -> String {
    format!(
        "{:<8} {:<12} {:<10} {:>7} {:>6} {:<19} {}",
        task.id,
        task.queue,
        task.status.to_string(),
        task.retries,
        task.event_count,
        task.retry_at.format(TIME_FORMAT).to_string(),
        task.description
    )
}

fn task_json(task: &TaskInfo) -> Value {
    json!({
        "id": task.id,
        "queue": task.queue,
        "status": task.status.to_string(),
        "category": task.category,
        "priority": task.priority,
        "retries": task.retries,
        "queued_at": task.queued_at,
        "retry_at": task.retry_at,
        "failure_reason": task.failure_reason,
        "exception": task.exception,
        "event_count": task.event_count,
        "description": task.description,
        "readable": task.readable,
    })
}

fn event_row(event: &Event) -> String {
    let task = event
        .task_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<8} {:<8} {:<19} {:<12} {}",
        event.id.unwrap_or_default(),
        task,
        event.occurred_at.format(TIME_FORMAT).to_string(),
        event.kind,
        event.description
    )
}

fn event_json(event: &Event) -> Value {
    json!({
        "id": event.id,
        "task_id": event.task_id,
        "kind": event.kind,
        "description": event.description,
        "data": event.data,
        "occurred_at": event.occurred_at,
    })
}
