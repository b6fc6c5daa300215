//! CLI definitions for taskqueue.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Inspect and maintain a taskqueue database.
#[derive(Parser)]
#[command(name = "taskqueue")]
#[command(about = "Durable background task queue administration")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/taskqueue.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List queues
    Queues,

    /// List tasks, newest first
    Tasks {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Show a single task with its events
    Task {
        /// Task ID
        id: i64,
    },

    /// List events, oldest first
    Events {
        /// Only events of this task
        #[arg(long)]
        task: Option<i64>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Delete a task and its events
    DeleteTask {
        /// Task ID
        id: i64,
    },

    /// Delete a single event
    DeleteEvent {
        /// Event ID
        id: i64,
    },

    /// Delete old tasks and events
    Purge {
        /// Delete tasks last scheduled more than this many days ago
        #[arg(long)]
        task_days: Option<u32>,

        /// Delete events older than this many days
        #[arg(long)]
        event_days: Option<u32>,
    },

    /// Validate the configuration file
    CheckConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Table,
    Json,
}
