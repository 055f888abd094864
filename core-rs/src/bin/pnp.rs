//! pnp - UDRAL plug-and-play port ID allocator
//!
//! Command-line front end over the allocation engine

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pnp_core::port::detect_service_instances;
use pnp_core::{
    Allocator, AllocationRecord, AllocationStore, AllocatorConfig, ApplyOutcome, CycleReport,
    MemoryBus, PeerInventory, RecordStatus, DEFAULT_CONFIG_FILE,
};

#[derive(Parser)]
#[command(name = "pnp")]
#[command(version)]
#[command(about = "Automatic port ID allocation for UDRAL nodes", long_about = None)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run allocation cycles against a simulated network
    Simulate {
        /// Network description (YAML)
        #[arg(long)]
        network: PathBuf,
        /// Allocator configuration (YAML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the configured store path
        #[arg(long)]
        store: Option<PathBuf>,
        /// Number of cycles to run
        #[arg(long, default_value_t = 1)]
        cycles: u32,
        /// Keep cycling until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Show persisted allocation records
    Records {
        /// Allocation store file
        #[arg(long, default_value = "pnp-allocations.json")]
        store: PathBuf,
        /// Print raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Write a configuration file with every default spelled out
    InitConfig {
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Check a configuration file
    ValidateConfig { path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "pnp_core=info",
        1 => "pnp_core=debug",
        _ => "pnp_core=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?),
        )
        .init();

    match cli.command {
        Commands::Simulate {
            network,
            config,
            store,
            cycles,
            watch,
        } => simulate(&network, config.as_deref(), store, cycles, watch).await?,

        Commands::Records { store, json } => {
            let store = AllocationStore::open(&store)
                .with_context(|| format!("Failed to open {}", store.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(store.records())?);
            } else {
                print_records(store.records());
            }
        }

        Commands::InitConfig { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            AllocatorConfig::default()
                .save(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("{} Wrote {}", "✓".green(), path.display());
        }

        Commands::ValidateConfig { path } => {
            let config = AllocatorConfig::load(&path)
                .with_context(|| format!("Invalid configuration {}", path.display()))?;
            println!("{} {} is valid", "✓".green(), path.display());
            println!(
                "  nodes {}..={} (local {}), subject [{}, {}], service [{}, {}], policy {:?}",
                config.node_id_range.start,
                config.node_id_range.end,
                config.local_node_id,
                config.subject_space.min,
                config.subject_space.max,
                config.service_space.min,
                config.service_space.max,
                config.collision_policy
            );
        }
    }

    Ok(())
}

async fn simulate(
    network: &Path,
    config_path: Option<&Path>,
    store_path: Option<PathBuf>,
    cycles: u32,
    watch: bool,
) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => AllocatorConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => AllocatorConfig::load_or_default(DEFAULT_CONFIG_FILE)?,
    };
    if let Some(path) = store_path {
        config.store_path = path;
    }

    let bus = Arc::new(
        MemoryBus::load(network)
            .with_context(|| format!("Failed to load network {}", network.display()))?,
    );
    let store = AllocationStore::open(&config.store_path)
        .with_context(|| format!("Failed to open {}", config.store_path.display()))?;
    let mut allocator = Allocator::new(config.clone(), bus.clone(), store)?;

    print_services(bus.clone(), &config, allocator.expected_cookie()).await;

    if watch {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        ctrlc::set_handler(move || {
            eprintln!("[pnp] Received SIGTERM/SIGINT, shutting down gracefully...");
            shutdown_clone.store(true, Ordering::SeqCst);
        })?;

        allocator.run(shutdown, None).await?;
    } else {
        for _ in 0..cycles {
            let report = allocator.run_cycle().await?;
            print_report(&report);
            for err in allocator.exhaustion_errors(&report) {
                eprintln!("{} {}", "✗".red(), err);
            }
        }
    }

    let store = allocator.into_store()?;
    print_records(store.records());
    Ok(())
}

async fn print_services(bus: Arc<MemoryBus>, config: &AllocatorConfig, cookie: &str) {
    let inventory = PeerInventory::from_bus(bus, config, cookie);
    let nodes = inventory.discover().await;
    let snapshot = inventory.snapshot(&nodes).await;

    for (node, peer) in &snapshot.peers {
        let services =
            detect_service_instances(peer.requirements.iter().map(|r| (r.role, r.name.as_str())));
        if services.is_empty() {
            continue;
        }
        println!("{} {} ({:?})", "Node".bold(), node, peer.cookie);
        for service in services {
            let instance = if service.instance.is_empty() {
                "-"
            } else {
                service.instance.as_str()
            };
            println!("  {:<24} {:<16}", service.service, instance);
        }
    }
}

fn print_report(report: &CycleReport) {
    println!(
        "\n{} {}: {} peers, {} new, {} reused, {} committed, {} rejected, {} unreachable, {} deferred, {} conflicts, {} malformed",
        "Cycle".bold(),
        report.cycle,
        report.peers,
        report.newly_assigned,
        report.reused,
        report.committed,
        report.rejected,
        report.unreachable.len(),
        report.deferred,
        report.conflicts,
        report.malformed
    );

    for outcome in &report.outcomes {
        let status = match &outcome.outcome {
            ApplyOutcome::Committed => "committed".green(),
            ApplyOutcome::Rejected(reason) => format!("rejected: {}", reason).red(),
            ApplyOutcome::Unreachable => "unreachable".yellow(),
        };
        println!(
            "  node {:<4} {:<40} -> {:<5} {}",
            outcome.target.node, outcome.target.register, outcome.target.port_id, status
        );
    }
}

/// Print records table
fn print_records(records: &[AllocationRecord]) {
    if records.is_empty() {
        println!("\nNo allocation records");
        return;
    }

    println!(
        "\n{:<8} {:<32} {:<48} {:<6} {:<8} {:<10} {:<16}",
        "SPACE", "NAME", "TYPE", "ID", "VERSION", "STATUS", "OWNERS"
    );
    println!("{}", "-".repeat(134));

    for record in records {
        let status = match record.status {
            RecordStatus::Active => "active".green(),
            RecordStatus::Archived { .. } => "archived".yellow(),
        };
        let owners: Vec<String> = record.owners.iter().map(|n| n.to_string()).collect();
        let status = if record.rejections.is_empty() {
            status
        } else {
            format!("{}*", status).red()
        };
        println!(
            "{:<8} {:<32} {:<48} {:<6} {:<8} {:<10} {:<16}",
            record.space,
            record.name,
            record.data_type,
            record.port_id,
            record.version,
            status,
            owners.join(",")
        );
    }
}
