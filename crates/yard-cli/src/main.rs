mod logging;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use yard_sync::{read_health, SourceRegistry, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "yardwatch")]
#[command(about = "Salvage yard inventory watcher")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source once and reconcile the store.
    Sync {
        /// Only run these sources (may be repeated).
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Use an in-memory store and log notifications instead of sending them.
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List the configured sources and partitions.
    Sources,
    /// Print the last persisted health token per partition.
    Health {
        #[arg(long)]
        partition: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    logging::init_logging(cli.json_logs);

    let command = cli.command.unwrap_or(Commands::Sync {
        sources: Vec::new(),
        dry_run: false,
        json: false,
    });
    let config = SyncConfig::from_env();

    match command {
        Commands::Sync {
            sources,
            dry_run,
            json,
        } => {
            let config = config.with_sources(sources).with_dry_run(dry_run);
            let summary = SyncPipeline::new(config).await?.run_once().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for partition in &summary.partitions {
                    println!("{partition}");
                }
                println!(
                    "sync complete: run_id={} partitions={} healthy={}",
                    summary.run_id,
                    summary.partitions.len(),
                    summary.all_healthy()
                );
            }
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(&config.registry_path).await?;
            for source in &registry.sources {
                let partitions: Vec<_> = source
                    .effective_partitions()
                    .into_iter()
                    .map(|p| p.partition_id)
                    .collect();
                println!(
                    "{:<14} {:<5} adapter={:<13} partitions={}  {}",
                    source.source_id,
                    if source.enabled { "on" } else { "off" },
                    source.adapter_name(),
                    partitions.join(","),
                    source.display_name
                );
            }
        }
        Commands::Health { partition } => {
            let registry = SourceRegistry::load(&config.registry_path).await?;
            let tokens = read_health(&config, &registry).await?;
            if let Some(wanted) = &partition {
                if !tokens.iter().any(|(id, _)| id == wanted) {
                    bail!("unknown partition {wanted}; not present in the registry");
                }
            }
            for (id, token) in tokens {
                if partition.as_ref().is_some_and(|wanted| *wanted != id) {
                    continue;
                }
                println!("{id}: {}", token.as_deref().unwrap_or("never run"));
            }
        }
    }

    Ok(())
}
