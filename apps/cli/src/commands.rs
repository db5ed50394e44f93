//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use leadflow_connectors::{
    ContactNotifier, CrmClient, CrmClientOptions, EmailNotifier, EmailNotifierOptions, LeadSink,
    RegistryClient, RegistryClientOptions, RegistrySource,
};
use leadflow_core::{
    BatchProcessor, CandidateOutcome, ProgressReporter, RunOptions, RunReport, RunSummary, emit,
};
use leadflow_shared::{
    AppConfig, CompanyId, LedgerEntry, LedgerOutcome, init_config, init_config_at, load_config,
    load_config_from, resolve_secret,
};
use leadflow_storage::Ledger;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Leadflow: register newly opened companies as CRM leads, exactly once.
#[derive(Parser)]
#[command(
    name = "leadflow",
    version,
    about = "Daily lead acquisition: registry → CRM → contact email, with a duplicate ledger.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.leadflow/leadflow.toml).
    #[arg(long, global = true, env = "LEADFLOW_CONFIG")]
    pub config: Option<PathBuf>,

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

/// Report output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process every company registered on the target date.
    Run {
        /// Target date (YYYY-MM-DD). Defaults to the configured days back from today.
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Maximum candidates processed concurrently.
        #[arg(long)]
        max_in_flight: Option<usize>,

        /// Run budget in seconds; 0 disables it.
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Report format on stdout.
        #[arg(long, default_value = "text")]
        output: OutputFormat,
    },

    /// Inspect or amend the duplicate ledger.
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },

    /// Probe every provider and the ledger.
    Check,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Ledger subcommands.
#[derive(Subcommand)]
pub(crate) enum LedgerAction {
    /// Show the entry for one identifier.
    Show {
        /// Company identifier, punctuated or not.
        identifier: String,
    },
    /// List recent entries.
    List {
        /// Only entries with this outcome (registered, duplicate_skip, failed).
        #[arg(long)]
        outcome: Option<LedgerOutcome>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Count entries per outcome.
    Stats,
    /// Stop retrying a failed identifier.
    Abandon {
        identifier: String,

        #[arg(long, default_value = "abandoned by operator")]
        note: String,
    },
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
        0 => "leadflow=info",
        1 => "leadflow=debug",
        _ => "leadflow=trace",
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
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Run {
            date,
            max_in_flight,
            timeout_secs,
            output,
        } => {
            let config = resolve_config(config_path.as_ref())?;
            cmd_run(&config, date, max_in_flight, timeout_secs, output).await
        }
        Command::Ledger { action } => {
            let config = resolve_config(config_path.as_ref())?;
            match action {
                LedgerAction::Show { identifier } => cmd_ledger_show(&config, &identifier).await,
                LedgerAction::List { outcome, limit } => {
                    cmd_ledger_list(&config, outcome, limit).await
                }
                LedgerAction::Stats => cmd_ledger_stats(&config).await,
                LedgerAction::Abandon { identifier, note } => {
                    cmd_ledger_abandon(&config, &identifier, &note).await
                }
            }
        }
        Command::Check => {
            let config = resolve_config(config_path.as_ref())?;
            cmd_check(&config).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path.as_ref()).await,
            ConfigAction::Show => {
                let config = resolve_config(config_path.as_ref())?;
                cmd_config_show(&config).await
            }
        },
    }
}

fn resolve_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Provider wiring
// ---------------------------------------------------------------------------

struct Providers {
    registry: Arc<RegistryClient>,
    crm: Arc<CrmClient>,
    notifier: Arc<EmailNotifier>,
}

fn build_providers(config: &AppConfig) -> Result<Providers> {
    let retries = config.run.max_rate_limit_retries;

    let registry = RegistryClient::new(RegistryClientOptions::from_config(
        &config.registry,
        resolve_secret(&config.registry.token_env)?,
        retries,
    ))?;
    let crm = CrmClient::new(CrmClientOptions::from_config(
        &config.crm,
        resolve_secret(&config.crm.api_key_env)?,
        retries,
    ))?;
    let notifier = EmailNotifier::new(EmailNotifierOptions::from_config(
        &config.notifier,
        resolve_secret(&config.notifier.token_env)?,
        retries,
    ))?;

    Ok(Providers {
        registry: Arc::new(registry),
        crm: Arc::new(crm),
        notifier: Arc::new(notifier),
    })
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: &AppConfig,
    date: Option<NaiveDate>,
    max_in_flight: Option<usize>,
    timeout_secs: Option<u64>,
    output: OutputFormat,
) -> Result<()> {
    let target_date = date.unwrap_or_else(|| config.run.target_date(Local::now().date_naive()));
    let max_in_flight = max_in_flight.unwrap_or(config.run.max_in_flight);
    if max_in_flight == 0 {
        return Err(eyre!("--max-in-flight must be at least 1"));
    }
    let run_timeout = match timeout_secs {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.run.run_timeout(),
    };

    let providers = build_providers(config)?;
    let ledger = Ledger::open(&config.ledger.path)
        .await
        .wrap_err_with(|| format!("ledger unavailable at {}", config.ledger.path.display()))?;

    info!(
        %target_date,
        max_in_flight,
        timeout_secs = run_timeout.map(|t| t.as_secs()),
        ledger = %config.ledger.path.display(),
        "starting lead run"
    );

    let processor = BatchProcessor::new(
        Arc::new(ledger),
        providers.registry as Arc<dyn RegistrySource>,
        providers.crm as Arc<dyn LeadSink>,
        providers.notifier as Arc<dyn ContactNotifier>,
        RunOptions {
            max_in_flight,
            run_timeout,
        },
    );

    let report = if output == OutputFormat::Text {
        processor.run(target_date, &CliProgress::new()).await?
    } else {
        processor
            .run(target_date, &leadflow_core::SilentProgress)
            .await?
    };

    emit(&report);
    print_report(&report, output)?;
    Ok(())
}

fn print_report(report: &RunReport, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            println!();
            println!("{}", RunSummary::from(report));
            for failure in &report.failures {
                println!(
                    "  ✗ {} [{}{}] {}",
                    failure.identifier,
                    failure.kind,
                    if failure.retryable { ", retryable" } else { "" },
                    failure.reason
                );
            }
            for warning in &report.warnings {
                println!(
                    "  ! {} (lead {}) email not sent: {}",
                    warning.identifier,
                    warning.lead_id,
                    warning.detail.as_deref().unwrap_or("no address on record")
                );
            }
            println!();
        }
    }
    Ok(())
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
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn candidate_done(&self, outcome: &CandidateOutcome, current: usize, total: usize) {
        self.spinner.set_message(format!(
            "[{current}/{total}] {} {}",
            outcome.identifier(),
            outcome.label()
        ));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// ledger
// ---------------------------------------------------------------------------

async fn open_ledger_readonly(config: &AppConfig) -> Result<Ledger> {
    Ledger::open_readonly(&config.ledger.path)
        .await
        .wrap_err_with(|| format!("cannot open ledger at {}", config.ledger.path.display()))
}

fn print_entry(entry: &LedgerEntry) {
    println!(
        "{}  {:<14}  {:<20}  {}  attempts={}{}",
        entry.identifier.formatted(),
        entry.outcome,
        entry.lead_id.as_ref().map_or("-", |id| id.as_str()),
        entry.attempted_at.format("%Y-%m-%d %H:%M:%S"),
        entry.attempts,
        entry
            .failure_reason
            .as_deref()
            .or(entry.note.as_deref())
            .map(|r| format!("  ({r})"))
            .unwrap_or_default()
    );
}

async fn cmd_ledger_show(config: &AppConfig, identifier: &str) -> Result<()> {
    let id = CompanyId::normalize(identifier)?;
    let ledger = open_ledger_readonly(config).await?;
    match ledger.get(&id).await? {
        Some(entry) => print_entry(&entry),
        None => println!("{} has never been processed", id.formatted()),
    }
    Ok(())
}

async fn cmd_ledger_list(
    config: &AppConfig,
    outcome: Option<LedgerOutcome>,
    limit: u32,
) -> Result<()> {
    let ledger = open_ledger_readonly(config).await?;
    let entries = ledger.list(outcome, limit).await?;
    if entries.is_empty() {
        println!("no ledger entries");
    }
    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

async fn cmd_ledger_stats(config: &AppConfig) -> Result<()> {
    let ledger = open_ledger_readonly(config).await?;
    let stats = ledger.stats().await?;
    println!("  registered:     {}", stats.registered);
    println!("  duplicate_skip: {}", stats.duplicate_skip);
    println!("  failed:         {}", stats.failed);
    println!("  total:          {}", stats.total());
    Ok(())
}

async fn cmd_ledger_abandon(config: &AppConfig, identifier: &str, note: &str) -> Result<()> {
    let id = CompanyId::normalize(identifier)?;
    let ledger = Ledger::open(&config.ledger.path).await?;
    ledger.mark_duplicate(&id, note, Utc::now()).await?;
    info!(identifier = %id, note, "identifier abandoned");
    println!("{} will be skipped by future runs", id.formatted());
    Ok(())
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

async fn cmd_check(config: &AppConfig) -> Result<()> {
    let providers = build_providers(config)?;

    let (registry, crm, notifier) = tokio::join!(
        providers.registry.health_check(),
        providers.crm.health_check(),
        providers.notifier.health_check(),
    );
    let ledger = Ledger::open(&config.ledger.path).await.map(|_| ());

    let results = [
        ("registry", registry.map_err(|e| e.to_string())),
        ("crm", crm.map_err(|e| e.to_string())),
        ("notifier", notifier.map_err(|e| e.to_string())),
        ("ledger", ledger.map_err(|e| e.to_string())),
    ];

    let mut failed = 0;
    for (name, result) in &results {
        match result {
            Ok(()) => println!("  ✓ {name}"),
            Err(e) => {
                failed += 1;
                println!("  ✗ {name}: {e}");
            }
        }
    }

    if failed > 0 {
        return Err(eyre!("{failed} health check(s) failed"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init(path: Option<&PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => init_config_at(path)?,
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}
