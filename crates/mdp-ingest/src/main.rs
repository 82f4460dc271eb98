//! MDP Ingest - marine data ingestion tool

use anyhow::{Context, Result};
use clap::Parser;
use mdp_common::logging::{init_logging, LogConfig, LogLevel};
use mdp_ingest::config::{IngestConfig, ResilienceConfig};
use mdp_ingest::resilience::Resilience;
use mdp_ingest::source::{erddap, http, ErddapCatalog};
use mdp_ingest::stats::RunStats;
use mdp_ingest::{source, DataCatalog, JsonLinesSink, KeyIndex, Orchestrator, RunState};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mdp-ingest")]
#[command(author, version, about = "Marine data ingestion and validation")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run every enabled source once
    Run {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Output directory for observations, rejections and run report
        #[arg(short, long, default_value = "./data/ingest")]
        output_dir: PathBuf,

        /// observations.jsonl of a previous run, to suppress already stored records
        #[arg(long)]
        existing_keys: Option<PathBuf>,
    },

    /// Search an ERDDAP server for datasets, one JSON object per line on stdout
    Datasets {
        /// Search keywords, e.g. "sea surface temperature"
        #[arg(short, long)]
        search: String,

        /// ERDDAP base URL
        #[arg(long, default_value = erddap::DEFAULT_ERDDAP_URL)]
        base_url: String,

        /// Maximum number of datasets
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("mdp-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Run {
            config,
            output_dir,
            existing_keys,
        } => run(&config, &output_dir, existing_keys.as_deref()).await,
        Command::Datasets {
            search,
            base_url,
            limit,
        } => datasets(&search, &base_url, limit).await,
    }
}

async fn datasets(keywords: &str, base_url: &str, limit: usize) -> Result<()> {
    let resilience_config = ResilienceConfig::default();
    let client = http::build_client(resilience_config.call_timeout())?;
    let catalog = ErddapCatalog::new(base_url, client)?;
    let resilience = Resilience::new(
        "erddap",
        resilience_config,
        Arc::new(RunStats::new()),
        tokio_util::sync::CancellationToken::new(),
    );

    let found = catalog
        .search(&resilience, keywords, limit)
        .await
        .with_context(|| format!("ERDDAP search for '{}' failed", keywords))?;

    let mut stdout = std::io::stdout().lock();
    for dataset in &found {
        serde_json::to_writer(&mut stdout, dataset)?;
        writeln!(stdout)?;
    }
    Ok(())
}

async fn run(
    config_path: &std::path::Path,
    output_dir: &std::path::Path,
    existing_keys: Option<&std::path::Path>,
) -> Result<()> {
    let config = IngestConfig::load(Some(config_path))?;
    let config_snapshot = config.clone();
    let adapters = source::build_adapters(&config)?;
    let sink = Arc::new(JsonLinesSink::create(output_dir)?);

    let mut builder = Orchestrator::builder(config).sources(adapters).sink(sink);
    if let Some(path) = existing_keys {
        builder = builder.existing_keys(Arc::new(KeyIndex::load(path)?));
    }
    let orchestrator = builder.build()?;

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    info!(run_id = %orchestrator.run_id(), output = %output_dir.display(), "Ingesting");
    let report = orchestrator.run().await?;

    let report_path = output_dir.join("run_report.json");
    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(&report_path, json)
        .with_context(|| format!("Failed to write {}", report_path.display()))?;

    let catalog_path = output_dir.join("catalog.json");
    DataCatalog::from_report(&report, &config_snapshot)
        .write(&catalog_path)
        .with_context(|| format!("Failed to write {}", catalog_path.display()))?;

    for failed in report.failed_sources() {
        error!(
            source_id = %failed.source_id,
            error = failed.last_error.as_deref().unwrap_or("unknown"),
            "Source failed"
        );
    }
    info!(
        state = %report.state,
        outcome = ?report.outcome(),
        report = %report_path.display(),
        "Ingestion complete"
    );

    if report.state == RunState::Failed {
        anyhow::bail!(
            "run failed: {}",
            report.failure.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
