//! Equiflow CLI: daily price pipeline commands.
//!
//! Commands:
//! - `run` runs the pipeline over CSV files, a fetched run, or a fresh fetch
//! - `fetch` pulls the configured universe and stores it as a raw artifact
//! - `init-warehouse` creates the staging and enterprise tables
//! - `show-run` prints a run manifest

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use equiflow_core::data::{
    fetch_universe, read_csv_batch, AlphaVantageProvider, CircuitBreaker, LogProgress,
};
use equiflow_core::domain::RawBatch;
use equiflow_runner::logging::LOG_FILE_NAME;
use equiflow_runner::{
    init_logging, init_warehouse, ArtifactStore, Pipeline, PipelineConfig, RunId, RunManifest,
    RunReport,
};

#[derive(Parser)]
#[command(name = "equiflow", about = "Equiflow: daily equity price ETL")]
struct Cli {
    /// Path to a TOML config file. Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline and upsert the result into the warehouse.
    Run {
        /// Raw CSV files to process instead of fetching from the provider.
        #[arg(long, num_args = 1.., conflicts_with = "from_run")]
        input: Vec<PathBuf>,

        /// Process the raw artifact of an earlier `fetch` run.
        #[arg(long)]
        from_run: Option<String>,
    },
    /// Fetch the configured symbols and store them as a raw artifact.
    Fetch,
    /// Create the warehouse tables if they do not exist.
    InitWarehouse,
    /// Print the manifest of a run.
    ShowRun {
        /// Run id, as printed by `run` or `fetch`.
        run_id: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let log_file = config.paths.working_dir.join(LOG_FILE_NAME);

    match cli.command {
        Commands::Run { input, from_run } => {
            init_logging(Some(log_file.as_path()))?;
            run_pipeline(&config, &input, from_run.as_deref())
        }
        Commands::Fetch => {
            init_logging(Some(log_file.as_path()))?;
            run_fetch(&config)
        }
        Commands::InitWarehouse => {
            init_logging(None)?;
            init_warehouse(&config.warehouse)?;
            println!("Warehouse ready: {}", config.warehouse.path.display());
            Ok(())
        }
        Commands::ShowRun { run_id } => show_run(&config, &run_id),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    match RunId::parse(raw) {
        Some(id) => Ok(id),
        None => bail!("'{raw}' is not a run id (expected YYYYMMDD_HHMMSS-xxxxxxxx)"),
    }
}

fn run_pipeline(config: &PipelineConfig, inputs: &[PathBuf], from_run: Option<&str>) -> Result<()> {
    let artifacts = ArtifactStore::from_config(&config.paths);
    let store = init_warehouse(&config.warehouse)?;
    let mut pipeline = Pipeline::new(store, artifacts.clone(), config.quality.clone());

    let report = if !inputs.is_empty() {
        let batches = inputs
            .iter()
            .map(|path| read_csv_batch(path))
            .collect::<Result<Vec<_>, _>>()?;
        pipeline.run(&batches)?
    } else if let Some(raw) = from_run {
        let run_id = parse_run_id(raw)?;
        let path = artifacts.raw_artifact(&run_id)?;
        let batch = read_csv_batch(&path)?;
        pipeline.run(&[batch])?
    } else {
        let batches = fetch_batches(config)?;
        pipeline.run_persisting_raw(&batches)?
    };

    print_report(&report);
    Ok(())
}

/// Fetch the universe. Fails only when nothing at all came back.
fn fetch_batches(config: &PipelineConfig) -> Result<Vec<RawBatch>> {
    let breaker = Arc::new(CircuitBreaker::default_provider());
    let provider = AlphaVantageProvider::new(config.provider.settings(), breaker)?;
    let summary = fetch_universe(
        &provider,
        &config.symbols,
        config.provider.request_delay(),
        &LogProgress,
    );

    for (symbol, err) in &summary.errors {
        eprintln!("Error for {symbol}: {err}");
    }
    if summary.batches.is_empty() {
        bail!("no data fetched for any of {} symbol(s)", summary.total);
    }
    Ok(summary.batches)
}

fn run_fetch(config: &PipelineConfig) -> Result<()> {
    let batches = fetch_batches(config)?;
    let artifacts = ArtifactStore::from_config(&config.paths);

    let started_at = chrono::Utc::now();
    let fingerprint: Vec<u8> = batches.iter().flat_map(|b| b.label.bytes()).collect();
    let mut manifest = RunManifest::new(RunId::generate(started_at, &fingerprint), started_at);
    let path = artifacts.write_raw(&mut manifest, &batches)?;
    artifacts.save_manifest(&manifest)?;
    tracing::info!(run_id = %manifest.run_id, path = %path.display(), "raw artifact written");

    let rows: usize = batches.iter().map(RawBatch::len).sum();
    println!("Run:      {}", manifest.run_id);
    println!("Symbols:  {}", batches.len());
    println!("Rows:     {rows}");
    println!("Raw file: {}", path.display());
    println!();
    println!("Process with: equiflow run --from-run {}", manifest.run_id);
    Ok(())
}

fn show_run(config: &PipelineConfig, raw: &str) -> Result<()> {
    let run_id = parse_run_id(raw)?;
    let artifacts = ArtifactStore::from_config(&config.paths);
    let manifest = artifacts
        .load_manifest(&run_id)
        .with_context(|| format!("reading manifest under {}", artifacts.working_dir().display()))?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

fn fmt_opt(value: Option<f64>, digits: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.digits$}"))
}

fn print_report(report: &RunReport) {
    println!();
    println!("=== Pipeline Run ===");
    println!("Run:            {}", report.run_id);
    println!("State:          {}", report.state);
    println!(
        "Rows:           {} in, {} out ({} dropped, {} duplicates)",
        report.normalize.input_rows,
        report.normalize.output_rows,
        report.normalize.dropped_rows(),
        report.normalize.duplicates_collapsed
    );
    if report.skipped_incomplete > 0 {
        println!("Not loaded:     {} incomplete record(s)", report.skipped_incomplete);
    }
    println!(
        "Warehouse:      {} staged, {} inserted, {} updated",
        report.merge.staged, report.merge.inserted, report.merge.updated
    );
    println!();
    println!(
        "{:<8} {:>10} {:>14} {:>10} {:>10} {:>10} {:>10} {:>11}",
        "Symbol", "Avg Close", "Volume", "Mean Ret", "Vol", "MA5", "MA10", "Last Date"
    );
    println!("{}", "-".repeat(90));
    for s in &report.summaries {
        println!(
            "{:<8} {:>10} {:>14} {:>10} {:>10} {:>10} {:>10} {:>11}",
            s.symbol,
            fmt_opt(s.average_price, 2),
            s.total_volume,
            fmt_opt(s.mean_daily_return, 5),
            fmt_opt(s.volatility, 5),
            fmt_opt(s.moving_avg_5, 2),
            fmt_opt(s.moving_avg_10, 2),
            s.max_date.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
        );
    }
    println!();
}
