//! `lifeline` - operator CLI for the emergency alert state
//!
//! This binary inspects and maintains the local state the emergency flow
//! relies on: the alert outbox, the contact cache, the delivery log and
//! the offline mode flag.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;

use lifeline::cli::{Cli, Command, ConfigCommand, ContactsCommand, LogCommand, OutboxCommand};
use lifeline::model::{GeoSample, TrackingSessionDescriptor};
use lifeline::storage::keys;
use lifeline::{init_logging, AlertOutbox, Config, ConnectivityMonitor, ConnectivityProbe, Storage};

// Platform-specific imports using conditional compilation
#[cfg(target_os = "linux")]
use lifeline_linux as platform;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone()).context("loading configuration")?;

    // Execute the command
    match cli.command {
        Command::Status(status_cmd) => handle_status(&config, status_cmd.json),
        Command::Outbox(outbox_cmd) => handle_outbox(&config, &outbox_cmd),
        Command::Contacts(ContactsCommand::Show { user }) => handle_contacts(&config, &user),
        Command::Offline(offline_cmd) => {
            let enabled = bool::from(offline_cmd.mode);
            connectivity(&open_storage(&config)?).set_offline_mode(enabled)?;
            println!("Offline mode {}.", if enabled { "enabled" } else { "disabled" });
            Ok(())
        }
        Command::Log(log_cmd) => handle_log(&config, &log_cmd),
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
    }
}

fn open_storage(config: &Config) -> anyhow::Result<Arc<Storage>> {
    let path = config.database_path();
    let storage = Storage::open(&path)
        .with_context(|| format!("opening state database {}", path.display()))?;
    Ok(Arc::new(storage))
}

#[cfg(target_os = "linux")]
fn link_probe() -> Box<dyn ConnectivityProbe> {
    let probe = platform::LinkProbe::new();
    Box::new(move || probe.link_is_up())
}

// No link probe on this platform; only the offline mode flag applies
#[cfg(not(target_os = "linux"))]
fn link_probe() -> Box<dyn ConnectivityProbe> {
    Box::new(|| true)
}

#[cfg(target_os = "linux")]
fn platform_name() -> &'static str {
    platform::platform_name()
}

#[cfg(not(target_os = "linux"))]
fn platform_name() -> &'static str {
    std::env::consts::OS
}

fn connectivity(storage: &Arc<Storage>) -> ConnectivityMonitor {
    ConnectivityMonitor::new(link_probe(), Arc::clone(storage))
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let monitor = connectivity(&storage);
    let outbox = AlertOutbox::new(Arc::clone(&storage), config.dead_letter_age());
    let queued = outbox.list()?;
    let last_sync: Option<DateTime<Utc>> = storage.get_json(keys::LAST_SYNC_AT)?;
    let session: Option<TrackingSessionDescriptor> = storage.get_json(keys::TRACKING_SESSION)?;
    let location: Option<GeoSample> = storage.get_json(keys::LAST_KNOWN_LOCATION)?;
    let stats = storage.stats()?;

    if json {
        let status = serde_json::json!({
            "platform": platform_name(),
            "online": monitor.is_online(),
            "offline_mode": monitor.offline_mode(),
            "queued_alerts": queued.len(),
            "last_sync_at": last_sync,
            "tracking_session": session,
            "last_known_location": location,
            "database_path": storage.path(),
            "storage": stats,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("lifeline status");
        println!("---------------");
        println!("Platform:      {}", platform_name());
        println!(
            "Connectivity:  {}{}",
            if monitor.is_online() { "online" } else { "offline" },
            if monitor.offline_mode() { " (forced)" } else { "" }
        );
        println!("Queued alerts: {}", queued.len());
        match last_sync {
            Some(at) => println!("Last sync:     {}", at.to_rfc3339()),
            None => println!("Last sync:     never"),
        }
        match &session {
            Some(s) => println!(
                "Tracking:      session {} for {} since {}",
                s.session_id,
                s.owner_user_id,
                s.started_at.to_rfc3339()
            ),
            None => println!("Tracking:      inactive"),
        }
        match &location {
            Some(l) => println!("Last location: {} at {}", l.map_link(), l.captured_at.to_rfc3339()),
            None => println!("Last location: unknown"),
        }
        println!("Database:      {}", storage.path().display());
        println!("Delivery log:  {} rows", stats.delivery_rows);
    }
    Ok(())
}

fn handle_outbox(config: &Config, cmd: &OutboxCommand) -> anyhow::Result<()> {
    let outbox = AlertOutbox::new(open_storage(config)?, config.dead_letter_age());
    match cmd {
        OutboxCommand::List { json } => {
            let queued = outbox.list()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&queued)?);
            } else if queued.is_empty() {
                println!("Outbox is empty.");
            } else {
                for alert in &queued {
                    println!(
                        "{}  {}  {:<7}  user={}  recipients={}  location={}",
                        alert.id,
                        alert.created_at.to_rfc3339(),
                        alert.status.to_string(),
                        alert.owner_user_id,
                        alert.recipients.len(),
                        if alert.location.is_some() { "yes" } else { "no" }
                    );
                }
            }
        }
        OutboxCommand::Sweep => {
            let dropped = outbox.sweep_expired()?;
            println!(
                "Dropped {dropped} alert(s) older than {} hours.",
                config.outbox.dead_letter_hours
            );
        }
    }
    Ok(())
}

fn handle_contacts(config: &Config, user: &str) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    match lifeline::contacts::load_valid(&storage, user, config.cache_ttl())? {
        Some(set) => {
            println!(
                "{} cached contact(s) for {user}, fetched {}",
                set.contacts.len(),
                set.cached_at.to_rfc3339()
            );
            for contact in &set.contacts {
                println!(
                    "  {:<12} {:<24} {:<16} {}",
                    contact.id,
                    contact.name,
                    contact.phone_number,
                    contact.email.as_deref().unwrap_or("-")
                );
            }
        }
        None => println!("No usable cached contacts for {user}."),
    }
    Ok(())
}

fn handle_log(config: &Config, cmd: &LogCommand) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let rows = storage.deliveries(cmd.alert.as_deref(), cmd.limit)?;
    if rows.is_empty() {
        println!("No deliveries recorded.");
    }
    for row in rows {
        println!(
            "{}  alert={}  contact={}  sms={}  email={}{}",
            row.recorded_at.to_rfc3339(),
            row.alert_id,
            row.contact_id,
            row.sms_ok,
            row.email_ok,
            row.error.map(|e| format!("  error={e}")).unwrap_or_default()
        );
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:        {}", config.database_path().display());
                println!();
                println!("[Cache]");
                println!("  TTL (days):           {}", config.cache.ttl_days);
                println!("  Fetch timeout (s):    {}", config.cache.fetch_timeout_secs);
                println!();
                println!("[Outbox]");
                println!("  Dead letter (hours):  {}", config.outbox.dead_letter_hours);
                println!("  Sweep every (min):    {}", config.outbox.sweep_interval_minutes);
                println!("  Retry every (s):      {}", config.outbox.retry_interval_secs);
                println!();
                println!("[Tracking]");
                println!("  History capacity:     {}", config.tracking.history_capacity);
                println!("  High accuracy:        {}", config.tracking.high_accuracy);
                println!(
                    "  Position timeout (ms): {}",
                    config.tracking.position_timeout_ms
                );
                println!(
                    "  Auto-share (min):     {}",
                    config.tracking.auto_share_interval_minutes
                );
                println!();
                println!("[Retry]");
                println!("  Max attempts:         {}", config.retry.max_attempts);
                println!("  Base delay (ms):      {}", config.retry.base_delay_ms);
                println!("  Write timeout (s):    {}", config.retry.write_timeout_secs);
                println!();
                println!("[Connectivity]");
                println!("  Poll interval (ms):   {}", config.connectivity.poll_interval_ms);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
