//! invrefresh CLI - Dependency-ordered inventory persistence

use clap::{Parser, Subcommand};
use invrefresh::config::{self, RefreshConfig};
use invrefresh::persister::StoreConnector;
use invrefresh::refresh::{PartCounts, RefreshCoordinator, SweepOutcome, SweepScope};
use invrefresh::transfer::RefreshPayload;
use invrefresh::ui::{self, CollectionTable, Icons, ProgressManager, Spinner};
use invrefresh::{PersistOptions, Persister, RecordStore, RefreshReport, SqliteStore};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "invrefresh")]
#[command(version = "0.1.0")]
#[command(about = "Persist provider inventory in dependency order, then sweep what was not seen")]
#[command(long_about = r#"
invrefresh saves loosely-typed inventory records with lazy cross-references:
  • References decide the save order; cycles are broken by deferring attributes
  • Each collection is reconciled against stored rows (create/update/delete)
  • Multi-part refreshes sweep unseen rows once every part finished

Example usage:
  invrefresh init
  invrefresh plan --payload part-1.json
  invrefresh ingest --payload part-1.json --refresh 6f1c... --part 2a9e...
  invrefresh sweep --payload part-1.json --refresh 6f1c... --total-parts 3 --wait
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the database file (overrides the config)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the database
    Init {
        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Show the save layers and broken cycles of a payload
    Plan {
        /// Refresh payload (JSON)
        #[arg(short, long)]
        payload: PathBuf,
    },

    /// Save one refresh part
    Ingest {
        /// Refresh payload (JSON)
        #[arg(short, long)]
        payload: PathBuf,

        /// Refresh this part belongs to; omit for a standalone save
        #[arg(short, long)]
        refresh: Option<Uuid>,

        /// Part identifier (random if omitted)
        #[arg(long)]
        part: Option<Uuid>,

        /// Provider the refresh belongs to
        #[arg(long, default_value = "0")]
        ems_id: i64,

        /// Worker threads per layer (overrides the config)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Request a sweep and attempt it
    Sweep {
        /// Payload whose collection definitions drive the sweep
        #[arg(short, long)]
        payload: PathBuf,

        #[arg(short, long)]
        refresh: Uuid,

        /// Number of parts the refresh was split into
        #[arg(short, long)]
        total_parts: u32,

        /// Collections the sweep may touch (all if omitted)
        #[arg(short, long)]
        scope: Vec<String>,

        /// Keep attempting until the sweep runs or fails
        #[arg(short, long)]
        wait: bool,

        /// Delay between attempts with --wait
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Show a refresh state and its parts
    State {
        #[arg(short, long)]
        refresh: Uuid,
    },

    /// Show row counts per collection
    Stats,
}

fn open_store(path: &Path) -> anyhow::Result<SqliteStore> {
    config::ensure_db_dir(path)?;
    Ok(SqliteStore::open(path)?)
}

fn build_persister(payload: &Path, options: PersistOptions) -> anyhow::Result<Persister> {
    let mut persister = Persister::new(options);
    for collection in RefreshPayload::load(payload)?.into_collections()? {
        persister.add(collection)?;
    }
    Ok(persister)
}

fn print_report(report: &RefreshReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("{}", CollectionTable::save_stats(&report.collections));
    for edge in &report.unconnected {
        ui::warn(&format!(
            "{}.{} of {} -> {} not found",
            edge.collection, edge.attribute, edge.identity, edge.reference
        ));
    }
    for target in &report.unknown_targets {
        ui::warn(&format!(
            "{}.{} points at {}, which is not part of this refresh",
            target.collection, target.attribute, target.target
        ));
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut settings = config::load_config(cli.config.as_deref())?.unwrap_or_default();
    if let Some(database) = &cli.database {
        settings.database = Some(database.to_string_lossy().to_string());
    }
    let db_path = settings.database_path();

    match cli.command {
        Commands::Init { force } => {
            let path = cli.config.clone().unwrap_or_else(config::default_config_path);
            config::write_config(&path, &settings, force)?;
            open_store(&db_path)?;
            ui::success(&format!("Wrote {}", path.display()));
            ui::status(Icons::DATABASE, "Database", &db_path.display().to_string());
        }

        Commands::Plan { payload } => {
            let mut persister = build_persister(&payload, PersistOptions::from_config(&settings))?;
            let plan = persister.plan()?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
                return Ok(());
            }

            ui::header(&format!("Plan for {}", payload.display()));
            ui::section("Layers");
            for (i, layer) in plan.schedule.layers.iter().enumerate() {
                ui::layer(i, layer);
            }
            if !plan.graph.feedback.is_empty() {
                ui::section("Deferred attributes");
                for feedback in &plan.graph.feedback {
                    ui::summary_row(
                        &format!("{} -> {}", feedback.from, feedback.to),
                        &feedback.attributes.iter().cloned().collect::<Vec<_>>().join(", "),
                    );
                }
            }
            for reference in &plan.scan.unconnected {
                ui::warn(&format!(
                    "{}.{} points at unknown collection {}",
                    reference.collection, reference.attribute, reference.target
                ));
            }
            println!();
            println!("{}", plan.graph.stats());
        }

        Commands::Ingest {
            payload,
            refresh,
            part,
            ems_id,
            workers,
        } => {
            if let Some(workers) = workers {
                settings.workers = workers;
            }
            let options = PersistOptions::from_config(&settings);
            let mut persister = build_persister(&payload, options)?;
            let store = open_store(&db_path)?;
            let start = Instant::now();

            if !cli.json {
                ui::header(&format!("Ingesting {}", payload.display()));
                ui::status(Icons::DATABASE, "Database", &db_path.display().to_string());
            }

            let (progress, tx) = ProgressManager::new(persister.collections().len());
            persister = persister.with_progress(tx);

            let connect_path = db_path.clone();
            let connect = move || -> invrefresh::Result<Box<dyn RecordStore>> {
                Ok(Box::new(SqliteStore::open(&connect_path)?))
            };
            let parallel = settings.workers > 1;
            let mut run = |store: &SqliteStore| {
                if parallel {
                    persister.persist_parallel(&connect as &StoreConnector)
                } else {
                    persister.persist(store)
                }
            };

            let report = match refresh {
                Some(refresh) => {
                    let coordinator = RefreshCoordinator::new(&store)
                        .with_batch_size(settings.batch_size)
                        .with_retry_ceiling(settings.sweep_retry_ceiling);
                    coordinator.start(&refresh, ems_id)?;
                    let part = part.unwrap_or_else(Uuid::new_v4);
                    coordinator.save_part(&refresh, &part, run)?
                }
                None => run(&store)?,
            };

            if cli.json {
                progress.clear();
            } else {
                progress.finish_with_summary(start.elapsed(), &report);
            }
            print_report(&report, cli.json)?;
        }

        Commands::Sweep {
            payload,
            refresh,
            total_parts,
            scope,
            wait,
            interval_ms,
        } => {
            let definitions: Vec<_> = RefreshPayload::load(&payload)?
                .collections
                .into_iter()
                .map(|entry| entry.definition)
                .collect();
            let store = open_store(&db_path)?;
            let coordinator = RefreshCoordinator::new(&store)
                .with_batch_size(settings.batch_size)
                .with_retry_ceiling(settings.sweep_retry_ceiling);

            let scope = if scope.is_empty() {
                SweepScope::All
            } else {
                scope.into_iter().collect()
            };
            coordinator.request_sweep(&refresh, total_parts, scope)?;

            let spinner = Spinner::new("Waiting for refresh parts");
            let outcome = loop {
                let outcome = coordinator.attempt_sweep(&refresh, &definitions)?;
                match &outcome {
                    SweepOutcome::Requeue { completed, total, .. } if wait => {
                        spinner.set_message(&format!("Waiting for refresh parts ({}/{})", completed, total));
                        std::thread::sleep(Duration::from_millis(interval_ms));
                    }
                    _ => break outcome,
                }
            };
            spinner.finish_with_message("Done");

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                return Ok(());
            }
            match outcome {
                SweepOutcome::Requeue { completed, total, attempt } => ui::info(
                    "Requeued",
                    &format!("{}/{} parts finished (attempt {})", completed, total, attempt),
                ),
                SweepOutcome::Swept(stats) => {
                    ui::success(&format!("Swept: {}", stats));
                    for (collection, removed) in &stats.collections {
                        ui::summary_row(collection, &removed.to_string());
                    }
                }
                SweepOutcome::Failed { message } => ui::error(&format!("Refresh failed: {}", message)),
                SweepOutcome::AlreadyFinished => ui::info("Refresh", "already finished"),
            }
        }

        Commands::State { refresh } => {
            let store = open_store(&db_path)?;
            let coordinator = RefreshCoordinator::new(&store);
            let state = coordinator.state(&refresh)?;
            let parts = store.refresh_state_parts(state.id)?;

            if cli.json {
                let value = serde_json::json!({ "state": state, "parts": parts });
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }

            let counts = PartCounts::from_parts(&parts);
            let total = state.total_parts.map(|t| t.to_string()).unwrap_or_else(|| "?".to_string());
            let progress = format!("{}/{} finished, {} error", counts.finished, total, counts.error);
            let retries = state.sweep_retry_count.to_string();
            let created = state.created_at.to_rfc3339();
            let mut rows = vec![
                ("Status", state.status.as_str()),
                ("Parts", progress.as_str()),
                ("Sweep retries", retries.as_str()),
                ("Started", created.as_str()),
            ];
            if let Some(message) = &state.error_message {
                rows.push(("Error", message.as_str()));
            }
            ui::header(&format!("Refresh {}", state.uuid));
            println!("{}", ui::stats_table(&rows));
            for part in &parts {
                ui::summary_row(&part.uuid.to_string(), part.status.as_str());
            }
        }

        Commands::Stats => {
            let store = open_store(&db_path)?;
            let stats = store.stats()?;
            let counts = store.collection_counts()?;

            if cli.json {
                let value = serde_json::json!({ "stats": stats, "collections": counts });
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }

            ui::status(Icons::STATS, "Database", &db_path.display().to_string());
            println!("{}", stats);
            println!("{}", CollectionTable::counts(&counts));
        }
    }

    Ok(())
}
