//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{info, warn};

use prospector_core::pipeline::{self, PipelineDeps, ProgressReporter, RunReport};
use prospector_core::{AssemblyResult, ScrapedCompanyUrls};
use prospector_discovery::{DiscoveryService, IdentifierRegistry};
use prospector_providers::{
    GeocodeCache, GeocodingProvider, GeocodingService, HttpMapCenter, HttpScrapeProvider,
    HubApiClient, MapCenterProvider, NominatimGeocoder,
};
use prospector_shared::{AppConfig, Project, RunConfig, init_config, load_config, validate_api_token};
use prospector_storage::Storage;

const DB_FILE: &str = "prospector.db";

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Prospector: discover mining projects and the companies behind them.
#[derive(Parser)]
#[command(
    name = "prospector",
    version,
    about = "Discover mining projects, resolve their companies, and audit the identifier registry.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Discover, assemble and reconcile in one run.
    Run(RunArgs),

    /// Discover candidate ids only and write a summary.
    Discover(RunArgs),

    /// Re-audit previously exported projects against the registry.
    Reconcile {
        /// Projects JSON written by `run` (defaults to <output>/projects.json).
        #[arg(long)]
        projects: Option<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Show recorded run history.
    Runs {
        /// Number of runs to show.
        #[arg(long, default_value = "10")]
        limit: u32,

        /// Output directory holding the cache database.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Geocoding cache maintenance.
    Cache {
        /// Cache subcommand.
        #[command(subcommand)]
        action: CacheAction,

        /// Output directory holding the cache database.
        #[arg(short, long, global = true)]
        output: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Flags overriding the config file for one run.
#[derive(Args, Clone, Default)]
pub(crate) struct RunArgs {
    /// Partitions (countries) to query, comma-separated.
    #[arg(long, value_delimiter = ',')]
    pub partitions: Vec<String>,

    /// Cap on the number of discovered ids.
    #[arg(long)]
    pub max_projects: Option<usize>,

    /// Concurrent per-id workers.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Ids per batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Skip geocoding enrichment.
    #[arg(long)]
    pub no_geocode: bool,

    /// Skip map-centre coordinate lookup.
    #[arg(long)]
    pub no_map_center: bool,

    /// Keep cached geocoding misses instead of retrying them this run.
    #[arg(long)]
    pub keep_geocode_misses: bool,

    /// Identifier registry JSON file.
    #[arg(long)]
    pub registry: Option<PathBuf>,

    /// Output directory for JSON exports and the cache database.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, config: &AppConfig) -> RunConfig {
        let mut run = RunConfig::from(config);
        if !self.partitions.is_empty() {
            run.partitions = self.partitions.clone();
        }
        if self.max_projects.is_some() {
            run.max_projects = self.max_projects;
        }
        if let Some(workers) = self.workers {
            run.max_workers = workers;
        }
        if let Some(size) = self.batch_size {
            run.batch_size = size;
        }
        run.enable_geocoding &= !self.no_geocode;
        run.enable_map_center &= !self.no_map_center;
        run.retry_geocode_misses &= !self.keep_geocode_misses;
        run
    }

    fn output_dir(&self, config: &AppConfig) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.output_dir))
    }

    fn registry_path(&self, config: &AppConfig) -> PathBuf {
        self.registry
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.discovery.registry_path))
    }
}

/// Geocoding cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Drop cached misses so those lookups are retried.
    Prune,
    /// Show the number of cached entries.
    Stats,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "prospector=info",
        1 => "prospector=debug",
        _ => "prospector=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => cmd_run(&args).await,
        Command::Discover(args) => cmd_discover(&args).await,
        Command::Reconcile { projects, run } => cmd_reconcile(projects, &run).await,
        Command::Runs { limit, output } => cmd_runs(limit, output).await,
        Command::Cache { action, output } => cmd_cache(action, output).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(args: &RunArgs) -> Result<()> {
    let config = load_config()?;
    let token = validate_api_token(&config)?;
    let run_config = args.apply(&config);
    let output = args.output_dir(&config);
    ensure_dir(&output)?;

    let storage = Arc::new(Storage::open(&output.join(DB_FILE)).await?);
    let api = Arc::new(HubApiClient::new(&config.api, token)?);
    if !api.health_check().await {
        warn!(base_url = %config.api.base_url, "API health check failed, continuing");
    }

    let map_center: Option<Arc<dyn MapCenterProvider>> = if run_config.enable_map_center {
        Some(Arc::new(HttpMapCenter::new(
            &config.scraper,
            Duration::from_millis(run_config.map_center_timeout_ms),
        )?))
    } else {
        None
    };
    let geocoder: Option<Arc<dyn GeocodingProvider>> = if run_config.enable_geocoding {
        let cache: Arc<dyn GeocodeCache> = storage.clone();
        Some(Arc::new(GeocodingService::new(
            Arc::new(NominatimGeocoder::new(&config.geocoding)?),
            cache,
            Duration::from_millis(config.geocoding.min_interval_ms),
        )))
    } else {
        None
    };

    let deps = PipelineDeps {
        query: api.clone(),
        relationships: api,
        scraper: Arc::new(HttpScrapeProvider::new(&config.scraper)?),
        map_center,
        geocoder,
        registry: Arc::new(IdentifierRegistry::load(&args.registry_path(&config))?),
        storage: Some(storage),
        site_url: config.scraper.base_url.clone(),
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current batch");
            flag.store(true, Ordering::SeqCst);
        }
    });

    info!(partitions = ?run_config.partitions, output = %output.display(), "starting run");
    let reporter = CliProgress::new();
    let report = pipeline::run(&run_config, deps, &reporter, &cancel).await?;

    write_json(&output.join("projects.json"), &report.projects)?;
    write_json(&output.join("audit.json"), &report.audit)?;
    write_json(&output.join("metrics.json"), &report.metrics)?;

    print_summary(&report, &output);
    Ok(())
}

/// Summary written by `discover`.
#[derive(Serialize)]
struct DiscoverySummary {
    partitions: Vec<String>,
    failed_partitions: Vec<String>,
    source_ids: usize,
    registry_ids: usize,
    selected: usize,
    ids: Vec<String>,
}

async fn cmd_discover(args: &RunArgs) -> Result<()> {
    let config = load_config()?;
    let token = validate_api_token(&config)?;
    let run_config = args.apply(&config);
    let output = args.output_dir(&config);
    ensure_dir(&output)?;

    let registry = Arc::new(IdentifierRegistry::load(&args.registry_path(&config))?);
    let api = Arc::new(HubApiClient::new(&config.api, token)?);
    let service = DiscoveryService::new(api, registry, run_config.max_projects);
    let report = service.discover(&run_config.partitions).await;

    let summary = DiscoverySummary {
        partitions: run_config.partitions.clone(),
        failed_partitions: report.failed_partitions.clone(),
        source_ids: report.source_ids.len(),
        registry_ids: report.registry_ids.len(),
        selected: report.ids.len(),
        ids: report.ids.iter().cloned().collect(),
    };
    let path = output.join("discovery.json");
    write_json(&path, &summary)?;

    println!();
    println!("  Discovery complete");
    println!("  Source ids:   {}", summary.source_ids);
    println!("  Registry ids: {}", summary.registry_ids);
    println!("  Selected:     {}", summary.selected);
    if !summary.failed_partitions.is_empty() {
        println!("  Failed:       {}", summary.failed_partitions.join(", "));
    }
    println!("  Written to:   {}", path.display());
    println!();
    Ok(())
}

async fn cmd_reconcile(projects_path: Option<PathBuf>, args: &RunArgs) -> Result<()> {
    let config = load_config()?;
    let token = validate_api_token(&config)?;
    let run_config = args.apply(&config);
    let output = args.output_dir(&config);
    let projects_path = projects_path.unwrap_or_else(|| output.join("projects.json"));

    let content = std::fs::read_to_string(&projects_path)
        .wrap_err_with(|| format!("cannot read {}", projects_path.display()))?;
    let projects: Vec<Project> = serde_json::from_str(&content)
        .wrap_err_with(|| format!("malformed projects file {}", projects_path.display()))?;

    let registry = Arc::new(IdentifierRegistry::load(&args.registry_path(&config))?);
    let api = Arc::new(HubApiClient::new(&config.api, token)?);
    let service = DiscoveryService::new(api, Arc::clone(&registry), run_config.max_projects);
    let report = service.discover(&run_config.partitions).await;

    let audit = pipeline::audit(
        &report,
        &projects,
        &registry,
        &ScrapedCompanyUrls::default(),
        &config.scraper.base_url,
    );
    ensure_dir(&output)?;
    let path = output.join("audit.json");
    write_json(&path, &audit)?;

    println!();
    println!("  Reconciliation complete");
    println!("  Audit rows: {}", audit.rows.len());
    println!("  Orphans:    {}", audit.orphans.len());
    println!("  Written to: {}", path.display());
    println!();
    Ok(())
}

async fn cmd_runs(limit: u32, output: Option<PathBuf>) -> Result<()> {
    let storage = open_existing_db(output).await?;
    let runs = storage.list_runs(limit).await?;
    println!("{}", serde_json::to_string_pretty(&runs)?);
    Ok(())
}

async fn cmd_cache(action: CacheAction, output: Option<PathBuf>) -> Result<()> {
    let storage = open_existing_db(output).await?;
    match action {
        CacheAction::Prune => {
            let evicted = storage.evict_geocode_misses().await?;
            let remaining = storage.count_geocode().await?;
            info!(evicted, remaining, "pruned geocoding cache");
            println!("Removed {evicted} cached misses, {remaining} entries remain.");
        }
        CacheAction::Stats => {
            println!("Geocoding cache entries: {}", storage.count_geocode().await?);
        }
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Open the cache database under `output` (or the configured output dir).
/// A missing database is an error rather than a fresh one.
async fn open_existing_db(output: Option<PathBuf>) -> Result<Storage> {
    let config = load_config()?;
    let output = output.unwrap_or_else(|| PathBuf::from(&config.output_dir));
    let db_path = output.join(DB_FILE);
    if !db_path.exists() {
        return Err(eyre!("no cache database at {}", db_path.display()));
    }
    Ok(Storage::open(&db_path).await?)
}

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).wrap_err_with(|| format!("cannot create {}", dir.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).wrap_err_with(|| format!("cannot write {}", path.display()))
}

fn print_summary(report: &RunReport, output: &Path) {
    let m = &report.metrics;
    println!();
    if report.cancelled {
        println!("  Run cancelled after the current batch.");
    } else {
        println!("  Run complete!");
    }
    if let Some(id) = &report.run_id {
        println!("  Run:        {id}");
    }
    println!("  Discovered: {}", report.discovered);
    println!("  Completed:  {}", m.completed);
    println!("  Failed:     {}", m.failed);
    println!("  Skipped:    {}", m.skipped);
    println!("  Success:    {:.1}%", m.success_rate);
    println!("  Audit rows: {}", report.audit.rows.len());
    println!("  Orphans:    {}", report.audit.orphans.len());
    println!("  Output:     {}", output.display());
    println!("  Time:       {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter: a spinner for phases, a bar once ids are known.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn discovered(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
    }

    fn batch_done(&self, result: &AssemblyResult, processed: usize, _total: usize) {
        self.bar.set_position(processed as u64);
        if result.failed > 0 {
            self.bar
                .set_message(format!("Assembling projects ({} failed in last batch)", result.failed));
        }
    }

    fn done(&self, _report: &RunReport) {
        self.bar.finish_and_clear();
    }
}
