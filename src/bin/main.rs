use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipeline_engine::dispatcher::{EchoTaskHandler, LocalWorker};
use pipeline_engine::{DatabaseConfig, Engine, EngineConfig, Plan, RunStatus, create_engine};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipeline-engine")]
#[command(about = "Distributed pipeline execution engine")]
struct Cli {
    /// JSON engine configuration; environment defaults apply when omitted
    #[arg(long, global = true, env = "PIPELINE_ENGINE_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan to completion and print the outcome
    Run {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        db_url: Option<String>,
        /// Local workers to start for remote steps
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Capability tag served by the local workers (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
        /// Setup abstraction as key=value (repeatable)
        #[arg(long = "set", value_parser = parse_abstraction)]
        abstractions: Vec<(String, String)>,
    },
    /// Check a plan without running it
    Validate {
        #[arg(long)]
        plan: PathBuf,
    },
    /// Start the HTTP transport for remote workers and operators
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Initialize the database
    Init {
        #[arg(long)]
        db_url: Option<String>,
    },
}

fn parse_abstraction(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got `{}`", raw))
}

fn load_config(path: Option<&Path>, db_url: Option<String>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(url) = db_url {
        config.database = DatabaseConfig {
            url,
            ..config.database
        };
    }
    Ok(config)
}

fn spawn_workers(
    engine: &Arc<Engine>,
    count: usize,
    capabilities: &[String],
    shutdown: &watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count)
        .map(|i| {
            LocalWorker::new(
                format!("local-{}", i),
                capabilities.iter().cloned(),
                engine.dispatcher().clone(),
                Arc::new(EchoTaskHandler),
            )
            .spawn(shutdown.clone())
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pipeline_engine=info".parse()?))
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            plan,
            db_url,
            workers,
            capabilities,
            abstractions,
        } => {
            let config = load_config(cli.config.as_deref(), db_url)?;
            info!("Using database url for run: {}", config.database.url);
            let plan = Plan::from_file(&plan)?;

            let engine = create_engine(&config).await?;
            let sweeper = engine.spawn_sweeper(config.sweep_interval());
            let (stop, shutdown) = watch::channel(false);
            let handles = spawn_workers(&engine, workers, &capabilities, &shutdown);

            let abstractions: BTreeMap<String, String> = abstractions.into_iter().collect();
            let handle = engine.start_run(plan, abstractions).await?;
            info!("Run {} started", handle.run_id());
            let outcome = handle.wait().await?;

            stop.send(true)?;
            for handle in handles {
                handle.await?;
            }
            sweeper.abort();

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if outcome.status != RunStatus::Succeeded {
                anyhow::bail!("run {} finished {:?}", outcome.run_id, outcome.status);
            }
        }
        Commands::Validate { plan } => {
            let path = plan;
            let plan = Plan::from_file(&path)?;
            match plan.validate() {
                Ok(()) => println!("Plan {} is valid ({} nodes)", plan.plan_id, plan.nodes.len()),
                Err(e) => {
                    warn!("Plan {} rejected", path.display());
                    anyhow::bail!(e);
                }
            }
        }
        Commands::Serve { bind, db_url } => {
            let config = load_config(cli.config.as_deref(), db_url)?;
            info!("Using database url for HTTP transport: {}", config.database.url);

            let engine = create_engine(&config).await?;
            let recovered = engine.recover_unfinished().await?;
            info!("Recovered {} unfinished runs", recovered.len());
            let _sweeper = engine.spawn_sweeper(config.sweep_interval());
            let app = pipeline_engine::api::create_router(engine);

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("HTTP transport listening on http://{}", bind);
            axum::serve(listener, app).await?;
        }
        Commands::Init { db_url } => {
            let config = load_config(cli.config.as_deref(), db_url)?;
            info!("Using database url for initialization: {}", config.database.url);

            info!("Initializing database...");
            let db = pipeline_engine::create_connection(config.database).await?;
            pipeline_engine::ensure_schema(&db).await?;
            info!("Database initialized successfully");
        }
    }

    Ok(())
}
