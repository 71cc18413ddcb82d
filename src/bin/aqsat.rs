use std::process::ExitCode;

use camino::Utf8PathBuf;
use chrono::{Datelike, Local};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use aqsat_extract::config::{Config, ConfigLoader, ResolvedConfig};
use aqsat_extract::driver::{CancelToken, ExtractionDriver, ProgressSink};
use aqsat_extract::error::AqError;
use aqsat_extract::fetcher::ThreadSleeper;
use aqsat_extract::fs_util::write_atomic;
use aqsat_extract::hyperlocal::HyperlocalDriver;
use aqsat_extract::join::FeatureJoin;
use aqsat_extract::osm::{BoundingBox, FeatureClient, OsmFeature, OverpassClient, TagFilter};
use aqsat_extract::output::{JsonOutput, LogSink, OutputMode, PlanReport};
use aqsat_extract::region::{EarthEngineHttpClient, RegionClient, RegionQuery, RegionTable};

#[derive(Parser)]
#[command(name = "aqsat")]
#[command(about = "Resumable satellite and OSM feature extraction for air-quality stations")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Extract daily satellite series for every location and month")]
    Satellite(RunArgs),
    #[command(about = "Compute OSM context features around each station")]
    Hyperlocal(RunArgs),
    #[command(about = "Show the resume state and pending units without fetching")]
    Plan(PlanArgs),
    #[command(about = "Join hyperlocal features onto the satellite series by station")]
    Merge(RunArgs),
    #[command(about = "Write the default aqsat.json")]
    Init(InitArgs),
}

#[derive(Args, Clone)]
struct RunArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    output: Option<Utf8PathBuf>,

    #[arg(long)]
    start_year: Option<i32>,
}

#[derive(Args)]
struct PlanArgs {
    #[command(flatten)]
    run: RunArgs,

    #[arg(long, help = "Plan the hyperlocal station run instead")]
    hyperlocal: bool,
}

#[derive(Args)]
struct InitArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    force: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<AqError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &AqError) -> u8 {
    match error {
        err if err.is_configuration() => 2,
        AqError::BackendInit(_) => 3,
        AqError::Cancelled => 130,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Satellite(args) => run_satellite(args, output_mode),
        Commands::Hyperlocal(args) => run_hyperlocal(args, output_mode),
        Commands::Plan(args) => run_plan(args),
        Commands::Merge(args) => run_merge(args, output_mode),
        Commands::Init(args) => run_init(args),
    }
}

#[derive(Clone, Copy)]
enum Target {
    Satellite,
    Hyperlocal,
    Merge,
}

fn resolve(args: &RunArgs, target: Target) -> Result<ResolvedConfig, AqError> {
    let mut config = ConfigLoader::resolve(args.config.as_deref())?;
    if let Some(output) = &args.output {
        match target {
            Target::Satellite => config.output = output.clone(),
            Target::Hyperlocal => config.hyperlocal.output = output.clone(),
            Target::Merge => config.merge.output = output.clone(),
        }
    }
    if let Some(start_year) = args.start_year {
        let current_year = Local::now().date_naive().year();
        if start_year > current_year {
            return Err(AqError::InvalidConfig(format!(
                "start year {start_year} is after the current year {current_year}"
            )));
        }
        config.start_year = start_year;
    }
    Ok(config)
}

fn cancel_on_interrupt() -> miette::Result<CancelToken> {
    let cancel = CancelToken::new();
    let handle = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("got SIGINT, stopping after the current unit");
        handle.cancel();
    })
    .into_diagnostic()?;
    Ok(cancel)
}

fn sink_for(output_mode: OutputMode) -> Box<dyn ProgressSink> {
    match output_mode {
        OutputMode::Interactive => Box::new(LogSink),
        OutputMode::NonInteractive => Box::new(JsonOutput),
    }
}

fn run_satellite(args: RunArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = resolve(&args, Target::Satellite)?;
    let client = EarthEngineHttpClient::connect(&config.backend)?;
    let driver = ExtractionDriver::new(&config, client, ThreadSleeper);
    let cancel = cancel_on_interrupt()?;
    let sink = sink_for(output_mode);

    let summary = driver.run(Local::now().date_naive(), &cancel, sink.as_ref())?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_run(&summary).into_diagnostic()?,
        OutputMode::Interactive => info!(
            output = %summary.output,
            processed = summary.units_processed,
            skipped = summary.units_skipped,
            records = summary.records_written,
            failed_calls = summary.failed_signal_calls,
            "satellite run finished"
        ),
    }
    if summary.cancelled {
        return Err(AqError::Cancelled.into());
    }
    Ok(())
}

fn run_hyperlocal(args: RunArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = resolve(&args, Target::Hyperlocal)?;
    let client = OverpassClient::new(&config.hyperlocal.overpass_url)?;
    let driver = HyperlocalDriver::new(&config, client, ThreadSleeper);
    let cancel = cancel_on_interrupt()?;
    let sink = sink_for(output_mode);

    let summary = driver.run(&cancel, sink.as_ref())?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_hyperlocal(&summary).into_diagnostic()?,
        OutputMode::Interactive => info!(
            output = %summary.output,
            processed = summary.stations_processed,
            skipped = summary.stations_skipped,
            failed_queries = summary.failed_queries,
            "hyperlocal run finished"
        ),
    }
    if summary.cancelled {
        return Err(AqError::Cancelled.into());
    }
    Ok(())
}

fn run_plan(args: PlanArgs) -> miette::Result<()> {
    if args.hyperlocal {
        return run_hyperlocal_plan(&args.run);
    }
    let config = resolve(&args.run, Target::Satellite)?;
    let driver = ExtractionDriver::new(&config, NopRegion, ThreadSleeper);
    let plan = driver.plan(Local::now().date_naive())?;
    let report = PlanReport {
        output: driver.store().path().to_string(),
        resume: plan.state,
        units_total: plan.skipped + plan.pending.len(),
        units_skipped: plan.skipped,
        pending: plan.pending.iter().map(ToString::to_string).collect(),
    };
    JsonOutput::print_plan(&report).into_diagnostic()?;
    Ok(())
}

fn run_hyperlocal_plan(args: &RunArgs) -> miette::Result<()> {
    let config = resolve(args, Target::Hyperlocal)?;
    let driver = HyperlocalDriver::new(&config, NopOverpass, ThreadSleeper);
    let (resume, pending) = driver.plan()?;
    let total = config.hyperlocal.stations.len();
    let report = PlanReport {
        output: driver.store().path().to_string(),
        resume,
        units_total: total,
        units_skipped: total - pending.len(),
        pending: pending.into_iter().map(|station| station.name).collect(),
    };
    JsonOutput::print_plan(&report).into_diagnostic()?;
    Ok(())
}

fn run_merge(args: RunArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = resolve(&args, Target::Merge)?;
    let report = FeatureJoin::new(&config).run()?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_join(&report).into_diagnostic()?,
        OutputMode::Interactive => info!(
            output = %report.output,
            rows = report.rows_written,
            with_features = report.rows_with_features,
            common = report.common.len(),
            only_features = ?report.only_features,
            "merge finished"
        ),
    }
    Ok(())
}

fn run_init(args: InitArgs) -> miette::Result<()> {
    let path = args
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(ConfigLoader::default_path);
    if path.exists() && !args.force {
        return Err(miette::Report::msg(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    let json = serde_json::to_string_pretty(&Config::default_document()).into_diagnostic()?;
    write_atomic(&path, format!("{json}\n").as_bytes())?;
    info!(path = %path.display(), "wrote default configuration");
    Ok(())
}

struct NopRegion;

impl RegionClient for NopRegion {
    fn get_region(&self, _query: &RegionQuery) -> Result<RegionTable, AqError> {
        Err(AqError::BackendInit(
            "region backend not available in plan mode".to_string(),
        ))
    }
}

struct NopOverpass;

impl FeatureClient for NopOverpass {
    fn query(&self, _bbox: &BoundingBox, _filter: &TagFilter) -> Result<Vec<OsmFeature>, AqError> {
        Err(AqError::OverpassHttp(
            "overpass not available in plan mode".to_string(),
        ))
    }
}
