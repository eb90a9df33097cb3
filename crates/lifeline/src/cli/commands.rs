//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Outbox inspection commands.
#[derive(Debug, Subcommand)]
pub enum OutboxCommand {
    /// List queued alerts, oldest first
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Drop alerts older than the dead-letter age
    Sweep,
}

/// Contact cache commands.
#[derive(Debug, Subcommand)]
pub enum ContactsCommand {
    /// Show the cached contacts of a user
    Show {
        /// User identifier
        user: String,
    },
}

/// Offline mode switch.
#[derive(Debug, Args)]
pub struct OfflineCommand {
    /// Turn offline mode on or off
    #[arg(value_enum)]
    pub mode: Toggle,
}

/// On/off argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    /// Enable
    On,
    /// Disable
    Off,
}

impl From<Toggle> for bool {
    fn from(toggle: Toggle) -> Self {
        toggle == Toggle::On
    }
}

/// Delivery log command arguments.
#[derive(Debug, Args)]
pub struct LogCommand {
    /// Only show attempts for this alert
    #[arg(short, long)]
    pub alert: Option<String>,

    /// Maximum number of rows
    #[arg(short, long, default_value = "20")]
    pub limit: usize,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
