//! Command-line interface for lifeline.
//!
//! The `lifeline` binary is an operator tool: it inspects and maintains the
//! local state that the emergency flow leaves behind.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    ConfigCommand, ContactsCommand, LogCommand, OfflineCommand, OutboxCommand, StatusCommand,
    Toggle,
};

/// lifeline - Offline-first emergency alert state
///
/// Inspect the alert outbox, the contact cache and the delivery log, and
/// switch offline mode.
#[derive(Debug, Parser)]
#[command(name = "lifeline")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show connectivity, outbox and tracking status
    Status(StatusCommand),

    /// Inspect or sweep the alert outbox
    #[command(subcommand)]
    Outbox(OutboxCommand),

    /// Inspect the contact cache
    #[command(subcommand)]
    Contacts(ContactsCommand),

    /// Force offline mode on or off
    Offline(OfflineCommand),

    /// Show the delivery log
    Log(LogCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}
