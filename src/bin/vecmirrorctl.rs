//! vecmirrorctl - Command line tool for operating vecmirror
//!
//! Usage:
//!   vecmirrorctl status                 - Show write log counts and instance health
//!   vecmirrorctl entries --status failed - Inspect write log entries
//!   vecmirrorctl cleanup                - Delete old terminal entries
//!   vecmirrorctl reset <write_id>       - Return a failed entry to pending
//!   vecmirrorctl mappings list          - Show collection mappings

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use vecmirror::api::{CleanupRequest, CleanupResponse, MappingRequest, ResetResponse, StatusResponse};
use vecmirror::mapping::CollectionMapping;
use vecmirror::wal::EntrySummary;

/// vecmirror Control Tool
#[derive(Parser)]
#[command(name = "vecmirrorctl")]
#[command(about = "Inspect and repair vecmirror replication", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "vecmirror.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show write log counts, instance health and replay stats
    Status,
    /// List write log entries
    Entries {
        /// Only entries in this status (pending, executed, synced, failed, cleanup_pending)
        #[arg(short, long)]
        status: Option<String>,
        /// Maximum entries to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Delete terminal entries older than the given age
    Cleanup {
        /// Minimum age in hours
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
        /// Reset failed entries to pending before deleting
        #[arg(long)]
        reset_failed: bool,
    },
    /// Return a failed entry to pending with its retry budget restored
    Reset {
        write_id: String,
    },
    /// Collection mapping commands
    Mappings {
        #[command(subcommand)]
        action: MappingsCommand,
    },
}

#[derive(Subcommand)]
enum MappingsCommand {
    /// List all mappings
    List,
    /// Insert or repair a mapping
    Set {
        name: String,
        #[arg(long)]
        primary_id: Option<String>,
        #[arg(long)]
        replica_id: Option<String>,
    },
    /// Remove a mapping
    Remove {
        name: String,
    },
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:8090".to_string()
}

/// Operator API base URL from the config file, with 0.0.0.0 mapped to loopback
fn endpoint_from_config(path: &PathBuf) -> String {
    let addr = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(default_api_bind);

    match addr.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", addr),
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));
    let client = reqwest::Client::new();

    let result = match cli.command {
        Commands::Status => show_status(&client, &endpoint).await,
        Commands::Entries { status, limit } => list_entries(&client, &endpoint, status, limit).await,
        Commands::Cleanup {
            max_age_hours,
            reset_failed,
        } => cleanup(&client, &endpoint, max_age_hours, reset_failed).await,
        Commands::Reset { write_id } => reset(&client, &endpoint, &write_id).await,
        Commands::Mappings { action } => match action {
            MappingsCommand::List => list_mappings(&client, &endpoint).await,
            MappingsCommand::Set {
                name,
                primary_id,
                replica_id,
            } => set_mapping(&client, &endpoint, name, primary_id, replica_id).await,
            MappingsCommand::Remove { name } => remove_mapping(&client, &endpoint, &name).await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Decode a JSON body, turning API errors into readable messages
async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("API error {}: {}", status, body);
    }
    response.json().await.context("invalid response from vecmirror")
}

// ============ Commands ============

async fn show_status(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let response = client
        .get(format!("{}/status", endpoint))
        .send()
        .await
        .with_context(|| format!("cannot reach vecmirror at {}", endpoint))?;
    let status: StatusResponse = decode(response).await?;

    println!();
    println!("vecmirror Status (vecmirrorctl v{})", env!("CARGO_PKG_VERSION"));
    println!("==================================");
    println!();
    println!("Primary:   {}", up_down(status.health.primary_healthy));
    println!("Replica:   {}", up_down(status.health.replica_healthy));
    println!();
    println!("Write log:");
    println!("  Pending:         {}", status.counts.pending);
    println!("  Executed:        {}", status.counts.executed);
    println!("  Synced:          {}", status.counts.synced);
    println!("  Failed:          {}", status.counts.failed);
    println!("  Cleanup pending: {}", status.counts.cleanup_pending);
    println!("  Outstanding:     {}", status.outstanding);
    if let Some(failures) = status.capture_failures {
        if failures > 0 {
            println!("  \x1b[31mNot logged:      {}\x1b[0m (see server log)", failures);
        } else {
            println!("  Not logged:      0");
        }
    }

    match status.replay {
        Some(replay) => {
            println!();
            println!("Replay (since start):");
            println!("  Synced:   {}", replay.synced);
            println!("  Retried:  {}", replay.retried);
            println!("  Failed:   {}", replay.failed);
            println!("  Deferred: {}", replay.deferred);
            println!("  Cycles:   {} ({} errors)", replay.cycles, replay.cycle_errors);
            if let Some(last) = replay.last_cycle_at {
                println!("  Last:     {}", last.to_rfc3339());
            }
        }
        None => {
            println!();
            println!("Replay: disabled");
        }
    }
    println!();
    Ok(())
}

fn up_down(healthy: bool) -> &'static str {
    if healthy {
        "\x1b[32mUP\x1b[0m"
    } else {
        "\x1b[31mDOWN\x1b[0m"
    }
}

async fn list_entries(
    client: &reqwest::Client,
    endpoint: &str,
    status: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let mut request = client
        .get(format!("{}/wal/entries", endpoint))
        .query(&[("limit", limit.to_string())]);
    if let Some(status) = status {
        request = request.query(&[("status", status)]);
    }
    let entries: Vec<EntrySummary> = decode(request.send().await?).await?;

    println!(
        "{:<38} {:<8} {:<9} {:<10} {:>5} {:>9}  PATH",
        "WRITE ID", "METHOD", "TARGET", "STATUS", "TRIES", "BYTES"
    );
    println!("{}", "-".repeat(100));
    for entry in &entries {
        println!(
            "{:<38} {:<8} {:<9} {:<10} {:>5} {:>9}  {}",
            entry.write_id,
            entry.method.as_str(),
            entry.target_instance.as_str(),
            entry.status.as_str(),
            entry.retry_count,
            entry.data_len,
            entry.path
        );
        if let Some(error) = &entry.error_message {
            println!("    └─ {}", error);
        }
    }
    println!();
    println!("{} entries", entries.len());
    Ok(())
}

async fn cleanup(
    client: &reqwest::Client,
    endpoint: &str,
    max_age_hours: u64,
    reset_failed: bool,
) -> anyhow::Result<()> {
    let response = client
        .post(format!("{}/wal/cleanup", endpoint))
        .json(&CleanupRequest {
            max_age_hours,
            reset_failed,
        })
        .send()
        .await?;
    let result: CleanupResponse = decode(response).await?;
    println!("Deleted {} entries, reset {} failed entries", result.deleted, result.reset);
    Ok(())
}

async fn reset(client: &reqwest::Client, endpoint: &str, write_id: &str) -> anyhow::Result<()> {
    let response = client
        .post(format!("{}/wal/entries/{}/reset", endpoint, write_id))
        .send()
        .await?;
    let result: ResetResponse = decode(response).await?;
    if result.reset == 0 {
        bail!("entry {} was not reset", result.write_id);
    }
    println!("✓ Entry {} reset to pending", result.write_id);
    Ok(())
}

async fn list_mappings(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let response = client
        .get(format!("{}/collection/mappings", endpoint))
        .send()
        .await?;
    let mappings: Vec<CollectionMapping> = decode(response).await?;

    println!("{:<30} {:<38} {:<38}", "COLLECTION", "PRIMARY ID", "REPLICA ID");
    println!("{}", "-".repeat(106));
    for mapping in &mappings {
        println!(
            "{:<30} {:<38} {:<38}",
            mapping.collection_name,
            mapping.primary_collection_id.as_deref().unwrap_or("-"),
            mapping.replica_collection_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn set_mapping(
    client: &reqwest::Client,
    endpoint: &str,
    name: String,
    primary_id: Option<String>,
    replica_id: Option<String>,
) -> anyhow::Result<()> {
    if primary_id.is_none() && replica_id.is_none() {
        bail!("give --primary-id, --replica-id, or both");
    }
    let response = client
        .post(format!("{}/admin/mappings", endpoint))
        .json(&MappingRequest {
            collection_name: name,
            primary_collection_id: primary_id,
            replica_collection_id: replica_id,
            collection_config: serde_json::Value::Null,
        })
        .send()
        .await?;
    let mapping: CollectionMapping = decode(response).await?;
    println!(
        "✓ {}: primary={} replica={}",
        mapping.collection_name,
        mapping.primary_collection_id.as_deref().unwrap_or("-"),
        mapping.replica_collection_id.as_deref().unwrap_or("-")
    );
    Ok(())
}

async fn remove_mapping(client: &reqwest::Client, endpoint: &str, name: &str) -> anyhow::Result<()> {
    let response = client
        .delete(format!("{}/admin/mappings/{}", endpoint, name))
        .send()
        .await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        bail!("no mapping for collection {}", name);
    }
    let _: serde_json::Value = decode(response).await?;
    println!("✓ Mapping for {} removed", name);
    Ok(())
}
