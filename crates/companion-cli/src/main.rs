// ============================================================================
// companion-mem — memory viewer and maintenance tool for the companion
// ============================================================================
// Usage:
//   companion-mem stats                      Show memory statistics
//   companion-mem show [--kind K] [--limit N] List facts, summaries, insights
//   companion-mem export --format json       Export all memory as JSON
//   companion-mem clear --yes                Forget everything
//   companion-mem maintain [--force]         Run aging / consolidation / cleanup
//   companion-mem retrieve <MESSAGE>         Show what a message would recall
//   companion-mem remember --user .. --ai .. Ingest an exchange (rule-based)
//   companion-mem config                     Print the effective configuration
// ============================================================================

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use companion_core::memory::MemoryManager;
use companion_core::{MemoryConfig, MemoryRecord, RecordKind};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Companion memory inspection tool
#[derive(Parser)]
#[command(name = "companion-mem", version, about = "Inspect and manage the companion's memory")]
struct Cli {
    /// Path to the memory store (default: ~/.companion/memory.redb)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show memory statistics (fact, summary and insight counts)
    Stats,

    /// List stored memory
    Show {
        /// Only this kind: profile, summary or insight
        #[arg(long)]
        kind: Option<String>,

        /// Show at most this many summaries / insights (newest first)
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Export all memory
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Permanently delete every fact, summary and insight
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Run maintenance
    Maintain {
        /// Run even if no trigger is due
        #[arg(long)]
        force: bool,
    },

    /// Show the memory that would be injected for a message
    Retrieve {
        message: String,
    },

    /// Ingest one exchange with the rule-based analyzer
    Remember {
        #[arg(long)]
        user: String,

        #[arg(long)]
        ai: String,
    },

    /// Print the effective configuration as JSON (secrets omitted)
    Config,
}

enum ShowFilter {
    All,
    Profile,
    Records(RecordKind),
}

fn parse_kind(s: &str) -> Result<ShowFilter> {
    match s.to_lowercase().as_str() {
        "profile" | "facts" | "fact" => Ok(ShowFilter::Profile),
        other => match other.parse::<RecordKind>() {
            Ok(kind) => Ok(ShowFilter::Records(kind)),
            Err(_) => anyhow::bail!(
                "Unknown kind '{}'. Valid values: profile, summary, insight",
                s
            ),
        },
    }
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("companion_core=info".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal
    let _ = dotenvy::dotenv();
    init_logging()?;

    let cli = Cli::parse();

    let mut config = MemoryConfig::from_env();
    if cli.db_path.is_some() {
        config.db_path = cli.db_path.clone();
    }

    if let Commands::Config = cli.command {
        return cmd_config(&config);
    }

    let manager = MemoryManager::open_heuristic(&config)?;

    match cli.command {
        Commands::Stats => cmd_stats(&manager),
        Commands::Show { kind, limit } => {
            let filter = kind.as_deref().map(parse_kind).transpose()?;
            cmd_show(&manager, filter.unwrap_or(ShowFilter::All), limit)
        }
        Commands::Export { format } => cmd_export(&manager, &format),
        Commands::Clear { yes } => cmd_clear(&manager, yes),
        Commands::Maintain { force } => cmd_maintain(&manager, force),
        Commands::Retrieve { message } => cmd_retrieve(&manager, &message),
        Commands::Remember { user, ai } => cmd_remember(&manager, &user, &ai).await,
        Commands::Config => cmd_config(&config),
    }
}

fn cmd_stats(manager: &MemoryManager) -> Result<()> {
    let stats = manager.stats()?;

    println!("=== Companion Memory Stats ===");
    println!("Store: {}", manager.store().path().display());
    println!();
    println!("Profile facts: {}", stats.profile_facts);
    println!("Summaries:     {}", stats.summaries);
    println!("Insights:      {}", stats.insights);

    let mut tags: Vec<_> = stats.tag_counts.iter().collect();
    tags.sort();
    for (category, count) in tags {
        println!("  {:14} {}", category, count);
    }

    println!(
        "Last maintenance: {}",
        stats
            .last_maintenance_at
            .map(format_timestamp)
            .unwrap_or_else(|| "never".into())
    );

    Ok(())
}

fn print_records(kind: RecordKind, mut records: Vec<MemoryRecord>, limit: usize) {
    records.reverse();

    println!(
        "{:<6}  {:<6}  {:<22}  {}",
        "ID", "IMP", "CREATED AT", kind.as_str().to_uppercase()
    );
    println!("{}", "-".repeat(90));

    for record in records.iter().take(limit) {
        let text = record.text.chars().take(60).collect::<String>();
        let tags = if record.tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", record.tags.join(", "))
        };
        println!(
            "{:<6}  {:<6.2}  {:<22}  {}{}",
            record.id.0,
            record.importance,
            format_timestamp(record.created_at),
            text,
            tags
        );
    }

    println!("\nShowing {} of {} {}s\n", records.len().min(limit), records.len(), kind);
}

fn cmd_show(manager: &MemoryManager, filter: ShowFilter, limit: usize) -> Result<()> {
    let store = manager.store();

    if matches!(filter, ShowFilter::All | ShowFilter::Profile) {
        let facts = store.list_profile_facts()?;
        if facts.is_empty() {
            println!("No profile facts.\n");
        } else {
            println!("{:<24}  {:<6}  {}", "KEY", "CONF", "VALUE");
            println!("{}", "-".repeat(60));
            for fact in &facts {
                println!("{:<24}  {:<6.2}  {}", fact.key, fact.confidence, fact.value);
            }
            println!();
        }
    }

    for kind in RecordKind::ALL {
        let wanted = match filter {
            ShowFilter::All => true,
            ShowFilter::Records(k) => k == kind,
            ShowFilter::Profile => false,
        };
        if wanted {
            print_records(kind, store.all(kind)?, limit);
        }
    }

    Ok(())
}

fn cmd_export(manager: &MemoryManager, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let export = manager.export_all()?;
    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

fn cmd_clear(manager: &MemoryManager, yes: bool) -> Result<()> {
    if !yes {
        let stats = manager.stats()?;
        println!(
            "This would delete {} facts, {} summaries and {} insights.",
            stats.profile_facts, stats.summaries, stats.insights
        );
        println!("Re-run with --yes to confirm.");
        return Ok(());
    }

    manager.clear_all()?;
    println!("All memory cleared.");
    Ok(())
}

fn cmd_maintain(manager: &MemoryManager, force: bool) -> Result<()> {
    let report = if force {
        Some(manager.maintain()?)
    } else {
        manager.maybe_maintain()?
    };

    match report {
        Some(report) => println!(
            "Maintenance: {} decayed, {} consolidated, {} deleted",
            report.decayed, report.consolidated, report.deleted
        ),
        None => println!("Maintenance not due (use --force to run anyway)."),
    }
    Ok(())
}

fn cmd_retrieve(manager: &MemoryManager, message: &str) -> Result<()> {
    let bundle = manager.retrieve(message)?;

    if bundle.is_empty() {
        println!("Nothing stored yet.");
        return Ok(());
    }

    print!("{}", bundle.format_for_prompt());
    Ok(())
}

async fn cmd_remember(manager: &MemoryManager, user: &str, ai: &str) -> Result<()> {
    match manager.record_exchange(user, ai).await {
        Some(report) => println!(
            "Stored {} facts, {} summaries, {} insights",
            report.facts_written, report.summaries_written, report.insights_written
        ),
        None => anyhow::bail!("Failed to store exchange (see log)"),
    }
    Ok(())
}

fn cmd_config(config: &MemoryConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
