//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use harvester_core::{Harvester, ProgressReporter, RunScope, RunSummary, failure_log};
use harvester_search::SearchClient;
use harvester_shared::{
    AppConfig, Entity, JobId, RetryPolicy, expand_home, init_config, load_config,
    load_config_from, load_credentials,
};
use harvester_storage::{MentionStore, Storage};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

/// Exit code reported when a run is interrupted with Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Mention harvester: collect web mentions for a roster of named entities.
#[derive(Parser)]
#[command(
    name = "harvester",
    version,
    about = "Search, fetch, clean, and store web mentions for a roster of entities.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.harvester/harvester.toml).
    #[arg(long, env = "HARVESTER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Database path, overriding `storage.db_path`.
    #[arg(long, env = "HARVESTER_DB", global = true)]
    pub db: Option<PathBuf>,

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
    /// Harvest mentions for the roster, one entity, or a resumed range.
    Run(RunArgs),

    /// Check that the database and the search provider are reachable.
    Test {
        /// Query used for the search probe.
        #[arg(long, default_value = "周杰倫")]
        query: String,
    },

    /// Manage the entity roster in the local database.
    Roster {
        #[command(subcommand)]
        action: RosterAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
pub(crate) struct RunArgs {
    #[command(flatten)]
    pub target: RunTarget,

    /// Concurrent entity units per batch, overriding `pipeline.worker_count`.
    #[arg(short, long, env = "HARVESTER_WORKERS")]
    pub workers: Option<usize>,

    /// Entities per batch, overriding `pipeline.batch_size`.
    #[arg(long)]
    pub batch_size: Option<usize>,
}

/// Exactly one of the run targets must be given.
#[derive(Args)]
#[group(required = true, multiple = false)]
pub(crate) struct RunTarget {
    /// Process every entity on the roster.
    #[arg(long)]
    pub all: bool,

    /// Process a single entity by id.
    #[arg(long, value_name = "ID")]
    pub entity: Option<i64>,

    /// Resume: process roster entries with id >= ID.
    #[arg(long, value_name = "ID")]
    pub from: Option<i64>,
}

impl RunTarget {
    fn scope(&self) -> RunScope {
        match (self.entity, self.from) {
            (Some(id), _) => RunScope::Entity(id),
            (None, Some(start)) => RunScope::FromEntity(start),
            (None, None) => RunScope::All,
        }
    }
}

/// Roster subcommands.
#[derive(Subcommand)]
pub(crate) enum RosterAction {
    /// Import entities from a JSON array of `{"id": .., "name": ..}` objects.
    Import {
        /// Path to the JSON file.
        file: PathBuf,
    },
    /// List the roster.
    List,
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
        0 => "warn,harvester=info",
        1 => "warn,harvester=debug",
        _ => "info,harvester=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    match &cli.command {
        Command::Run(args) => cmd_run(&cli, args).await,
        Command::Test { query } => cmd_test(&cli, query).await,
        Command::Roster { action } => match action {
            RosterAction::Import { file } => cmd_roster_import(&cli, file).await,
            RosterAction::List => cmd_roster_list(&cli).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&cli),
        },
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

async fn open_storage(cli: &Cli, config: &AppConfig) -> Result<Arc<Storage>> {
    let path = match &cli.db {
        Some(path) => path.clone(),
        None => expand_home(&config.storage.db_path)?,
    };
    let storage = Storage::open(&path)
        .await
        .wrap_err_with(|| format!("cannot open database at {}", path.display()))?;
    Ok(Arc::new(storage))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<ExitCode> {
    let mut config = resolve_config(cli)?;
    if let Some(workers) = args.workers {
        config.pipeline.worker_count = workers;
    }
    if let Some(batch_size) = args.batch_size {
        config.pipeline.batch_size = batch_size;
    }
    config.validate()?;

    let credentials = load_credentials(&config.search)?;
    let storage = open_storage(cli, &config).await?;
    let store: Arc<dyn MentionStore> = storage.clone();
    let harvester = Harvester::from_config(&config, store, credentials)?;

    let scope = args.target.scope();
    info!(
        ?scope,
        workers = config.pipeline.worker_count,
        batch_size = config.pipeline.batch_size,
        "starting run"
    );

    let prepared = harvester.prepare(scope).await?;
    let reporter = CliProgress::new();

    let summary = tokio::select! {
        summary = harvester.execute(&prepared, &reporter) => summary,
        _ = tokio::signal::ctrl_c() => {
            reporter.spinner.abandon_with_message("Interrupted");
            if let Err(e) = harvester.abort(&prepared, "interrupted").await {
                warn!(error = %e, "failed to mark interrupted job");
            }
            eprintln!("Interrupted. Job {} marked failed.", prepared.job_id);
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
    };

    let log_path = expand_home(&config.logging.failed_urls_log)?;
    if let Err(e) = failure_log::append(&log_path, &summary.failed_urls) {
        warn!(error = %e, "could not write failed URL log");
    }

    print_summary(&summary, &log_path);

    if let RunScope::Entity(id) = scope {
        let stored = storage.count_mentions(id).await?;
        println!("  Stored for entity {id}: {stored} mentions total");
        println!();
    }

    if summary.is_total_failure() {
        eprintln!("No mentions were harvested; see the log for details.");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &RunSummary, log_path: &Path) {
    println!();
    println!("  Harvest finished");
    println!("  Job:          {}", summary.job_id);
    println!("  Entities:     {} ({} batches)", summary.entities, summary.batches);
    println!("  New mentions: {}", summary.mentions_inserted);
    println!("  Duplicates:   {}", summary.mentions_skipped);
    println!("  URLs tried:   {}", summary.urls_processed);
    println!("  Failed URLs:  {}", summary.failed_urls.len());
    if summary.entities_failed > 0 {
        println!("  Failed searches: {}", summary.entities_failed);
    }
    if !summary.failed_urls.is_empty() {
        println!("  Failure log:  {}", log_path.display());
    }
    println!("  Time:         {:.1}s", summary.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn run_started(&self, job_id: &JobId, entities: usize, batches: usize) {
        self.spinner
            .set_message(format!("Job {job_id}: {entities} entities in {batches} batches"));
    }

    fn batch_started(&self, index: usize, total: usize, size: usize) {
        self.spinner
            .set_message(format!("Batch [{index}/{total}] {size} entities"));
    }

    fn entity_finished(&self, entity: &Entity, inserted: u64, failed_urls: usize) {
        self.spinner.println(format!(
            "  {} ({}): {inserted} new mentions, {failed_urls} failed URLs",
            entity.name, entity.id
        ));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// test
// ---------------------------------------------------------------------------

async fn cmd_test(cli: &Cli, query: &str) -> Result<ExitCode> {
    let config = resolve_config(cli)?;
    let mut healthy = true;

    match open_storage(cli, &config).await {
        Ok(storage) => match storage.ping().await {
            Ok(()) => {
                let roster = storage.list_entities().await.map(|r| r.len()).unwrap_or(0);
                println!("  Database:  ok ({roster} entities on roster)");
            }
            Err(e) => {
                println!("  Database:  FAILED ({e})");
                healthy = false;
            }
        },
        Err(e) => {
            println!("  Database:  FAILED ({e})");
            healthy = false;
        }
    }

    let search = load_credentials(&config.search)
        .map_err(|e| eyre!(e))
        .and_then(|credentials| {
            let keys = credentials.len();
            SearchClient::google(
                &config.search,
                credentials,
                RetryPolicy::from_config(&config.retry),
                &config.fetch.user_agent,
            )
            .map(|client| (client, keys))
            .map_err(|e| eyre!(e))
        });

    match search {
        Ok((client, keys)) => match client.search(query).await {
            Ok(urls) => println!("  Search:    ok ({} results, {keys} credential pairs)", urls.len()),
            Err(e) => {
                println!("  Search:    FAILED ({e})");
                healthy = false;
            }
        },
        Err(e) => {
            println!("  Search:    FAILED ({e})");
            healthy = false;
        }
    }

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// ---------------------------------------------------------------------------
// roster
// ---------------------------------------------------------------------------

async fn cmd_roster_import(cli: &Cli, file: &Path) -> Result<ExitCode> {
    let config = resolve_config(cli)?;
    let content = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("cannot read {}", file.display()))?;
    let entities: Vec<Entity> = serde_json::from_str(&content)
        .wrap_err_with(|| format!("{} is not a JSON array of {{id, name}}", file.display()))?;

    let storage = open_storage(cli, &config).await?;
    let count = storage.import_entities(&entities).await?;
    println!("Imported {count} entities.");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_roster_list(cli: &Cli) -> Result<ExitCode> {
    let config = resolve_config(cli)?;
    let storage = open_storage(cli, &config).await?;
    let roster = storage.list_entities().await?;

    if roster.is_empty() {
        println!("Roster is empty. Import one with `harvester roster import <file>`.");
        return Ok(ExitCode::SUCCESS);
    }
    for entity in &roster {
        let mentions = storage.count_mentions(entity.id).await?;
        println!("{:>6}  {}  ({mentions} mentions)", entity.id, entity.name);
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<ExitCode> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_config_show(cli: &Cli) -> Result<ExitCode> {
    let config = resolve_config(cli)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(ExitCode::SUCCESS)
}
