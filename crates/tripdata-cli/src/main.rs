//! CLI driver for the incremental trip-record pipeline.

mod error;

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use snafu::{ResultExt, ensure};
use tripdata_core::{
    fetch::{FetchOptions, HttpFetcher, SourceTemplates, UrlTemplate},
    period::Period,
    pipeline::{Pipeline, PipelineConfig, RunOptions, RunReport},
};

use crate::error::{
    CliResult, HttpClientSnafu, InvalidAsOfSnafu, InvalidTemplateSnafu, RunFailedSnafu,
    ZeroWorkersSnafu,
};

const DEFAULT_YELLOW_URL: &str =
    "https://d37ci6vzurychx.cloudfront.net/trip-data/yellow_tripdata_{year}-{month:02d}.parquet";
const DEFAULT_GREEN_URL: &str =
    "https://d37ci6vzurychx.cloudfront.net/trip-data/green_tripdata_{year}-{month:02d}.parquet";

#[derive(Debug, Args)]
struct RunArgs {
    /// Root directory for raw, processed and combined artifacts
    #[arg(long, env = "DATA_ROOT", default_value = "data")]
    data_root: PathBuf,

    /// Watermark record (relative paths resolve against the data root)
    #[arg(long = "watermark-file", env = "METADATA_FILE", default_value = "last_processed.txt")]
    watermark_file: PathBuf,

    /// Avro record schema used by --export-avro
    #[arg(long = "avro-schema", env = "AVRO_SCHEMA_FILE")]
    avro_schema: Option<PathBuf>,

    /// Yellow source URL template ({year}, {month}, {month:02d})
    #[arg(long = "yellow-url", env = "BASE_URL_YELLOW", default_value = DEFAULT_YELLOW_URL)]
    yellow_url: String,

    /// Green source URL template ({year}, {month}, {month:02d})
    #[arg(long = "green-url", env = "BASE_URL_GREEN", default_value = DEFAULT_GREEN_URL)]
    green_url: String,

    /// Years to look back when no watermark exists
    #[arg(long = "lookback-years", env = "LOOKBACK_YEARS", default_value_t = 3)]
    lookback_years: u32,

    /// Maximum concurrent downloads
    #[arg(long = "fetch-concurrency", env = "FETCH_CONCURRENCY", default_value_t = 4)]
    fetch_concurrency: usize,

    /// Per-download timeout in seconds
    #[arg(long = "fetch-timeout-secs", env = "FETCH_TIMEOUT_SECS", default_value_t = 300)]
    fetch_timeout_secs: u64,

    /// Harmonizer worker threads (default: available parallelism)
    #[arg(long, env = "HARMONIZE_THREADS")]
    threads: Option<usize>,

    /// Treat this month (YYYY-MM) as the current calendar period
    #[arg(long = "as-of")]
    as_of: Option<String>,

    /// Also export the combined dataset as CSV
    #[arg(long = "export-csv", default_value_t = false)]
    export_csv: bool,

    /// Also export the combined dataset as Avro
    #[arg(long = "export-avro", default_value_t = false)]
    export_avro: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one incremental pipeline pass
    Run(RunArgs),
}

#[derive(Debug, Parser)]
#[command(name = "tripdata", version, about = "Incremental monthly trip-record pipeline")]
struct Cli {
    /// Log level (error, warn, info, debug, trace); RUST_LOG overrides
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    cmd: Command,
}

fn parse_template(flag: &'static str, raw: &str) -> CliResult<UrlTemplate> {
    UrlTemplate::parse(raw).context(InvalidTemplateSnafu { flag })
}

fn current_period(as_of: Option<&str>) -> CliResult<Period> {
    match as_of {
        Some(input) => input.parse::<Period>().context(InvalidAsOfSnafu { input }),
        None => Ok(Period::from_date(chrono::Local::now())),
    }
}

fn build_config(args: &RunArgs) -> CliResult<PipelineConfig> {
    let templates = SourceTemplates {
        yellow: parse_template("--yellow-url", &args.yellow_url)?,
        green: parse_template("--green-url", &args.green_url)?,
    };

    let mut config = PipelineConfig::new(&args.data_root, templates);
    config.watermark_path = args.watermark_file.clone();
    config.avro_schema_path = args.avro_schema.clone();
    config.lookback_years = args.lookback_years;
    ensure!(args.fetch_concurrency > 0, ZeroWorkersSnafu);
    config.fetch = FetchOptions {
        concurrency: args.fetch_concurrency,
        timeout: Duration::from_secs(args.fetch_timeout_secs),
    };
    if let Some(threads) = args.threads {
        ensure!(threads > 0, ZeroWorkersSnafu);
        config.harmonize_threads = threads;
    }
    Ok(config)
}

fn print_summary(report: &RunReport) {
    if report.is_up_to_date() {
        if let Some((watermark, _)) = &report.watermark {
            println!("Up to date at {watermark}; nothing to do.");
        }
        return;
    }

    if let Some(range) = report.range {
        println!("Range: {range}");
    }
    if let Some(fetch) = &report.fetch {
        println!(
            "Fetched {} artifact(s), {} not published, {} failed",
            fetch.fetched_count(),
            fetch.missing_count(),
            fetch.failed_count()
        );
        for entry in fetch.failures() {
            println!("  failed: {}", entry.url);
        }
    }
    if let Some(h) = &report.harmonize {
        println!(
            "Normalized {} artifact(s), rejected {}, dropped {} row(s)",
            h.normalized_count(),
            h.rejected_count(),
            h.rows_dropped()
        );
    }
    if let Some(c) = &report.combine {
        println!(
            "Combined {} artifact(s) into {} ({} rows)",
            c.artifacts,
            c.output.display(),
            c.rows
        );
    }
    for export in &report.exports {
        println!(
            "Exported {} rows as {} to {}",
            export.rows,
            export.format,
            export.output.display()
        );
    }
    if let Some(period) = report.committed {
        println!("Watermark advanced to {period}");
    }
}

async fn cmd_run(args: RunArgs) -> CliResult<()> {
    let now = current_period(args.as_of.as_deref())?;
    let config = build_config(&args)?;
    log::debug!("running as of {now} with {config:?}");
    let fetcher = HttpFetcher::new().context(HttpClientSnafu)?;

    let pipeline = Pipeline::new(config, Arc::new(fetcher));
    let mut report = pipeline
        .run(
            now,
            RunOptions {
                export_csv: args.export_csv,
                export_avro: args.export_avro,
            },
        )
        .await;

    print_summary(&report);
    match report.error.take() {
        Some(e) => {
            let stage = e.stage();
            Err(e).context(RunFailedSnafu { stage })
        }
        None => Ok(()),
    }
}

fn init_logging(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    env_logger::Builder::from_env(env).init();
}

async fn run() -> CliResult<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.cmd {
        Command::Run(args) => cmd_run(args).await,
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
