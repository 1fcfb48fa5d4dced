//! certpilot - Main entry point
//!
//! ACME certificate bootstrap and renewal for a single domain behind a
//! reverse proxy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use certpilot::acme::{CertificateStore, RenewalScheduler};
use certpilot::proxy::ProxyState;
use certpilot::{Orchestrator, RunMode, RunOutcome, RunReport, SignalManager};
use certpilot_config::{validate_all, Config, ValidationOpts, EXAMPLE_CONFIG_KDL};

const DEFAULT_CONFIG_PATH: &str = "/etc/certpilot/certpilot.kdl";

/// certpilot - ACME certificate orchestrator for a reverse-proxied domain
#[derive(Parser, Debug)]
#[command(name = "certpilot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTPILOT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Domain to manage, overriding the configuration file
    #[arg(long = "domain", env = "CERTPILOT_DOMAIN", global = true)]
    domain: Option<String>,

    /// ACME contact email, overriding the configuration file
    #[arg(long = "email", env = "CERTPILOT_EMAIL", global = true)]
    email: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring the proxy up, obtain a certificate if needed and switch to HTTPS
    Bootstrap {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Renew the certificate when inside the renewal window
    Renew {
        /// Renew regardless of the remaining validity
        #[arg(long)]
        force: bool,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the stored certificate and proxy state
    Status,
    /// Show recent issuance attempts
    History {
        /// Number of entries to show
        #[arg(short = 'n', long = "limit", default_value_t = 10)]
        limit: usize,
    },
    /// Bootstrap, then keep renewing until SIGTERM/SIGINT
    Daemon,
    /// Validate configuration file and exit
    Test {
        /// Print the example configuration instead
        #[arg(long)]
        example: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("certpilot: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if let Commands::Test { example } = cli.command {
        if example {
            print!("{}", EXAMPLE_CONFIG_KDL);
            return Ok(0);
        }
        return test_config(&config_path, &cli);
    }

    let config = load_config(&config_path, &cli)?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    match cli.command {
        Commands::Bootstrap { json } => runtime.block_on(run_once(&config, RunMode::Bootstrap, json)),
        Commands::Renew { force, json } => {
            runtime.block_on(run_once(&config, RunMode::Renew { force }, json))
        }
        Commands::Status => show_status(&config),
        Commands::History { limit } => show_history(&config, limit),
        Commands::Daemon => runtime.block_on(run_daemon(&config)),
        Commands::Test { .. } => Ok(0),
    }
}

/// Load the configuration file and apply command-line overrides
fn load_config(path: &Path, cli: &Cli) -> Result<Config> {
    info!("Loading configuration from: {}", path.display());

    let mut config = Config::from_file(path).context("Failed to load configuration file")?;
    if let Some(ref domain) = cli.domain {
        config.domain.name = domain.clone();
    }
    if let Some(ref email) = cli.email {
        config.domain.email = email.clone();
    }

    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

/// Test configuration file and exit
fn test_config(path: &Path, cli: &Cli) -> Result<i32> {
    info!("Testing configuration file: {}", path.display());

    let mut config = Config::from_file(path).context("Failed to load configuration file")?;
    if let Some(ref domain) = cli.domain {
        config.domain.name = domain.clone();
    }
    if let Some(ref email) = cli.email {
        config.domain.email = email.clone();
    }

    let result = validate_all(&config, &ValidationOpts::default());
    for warning in &result.warnings {
        warn!("{}", warning);
    }

    if !result.is_valid() {
        for e in &result.errors {
            error!("{}", e);
            eprintln!("certpilot: {}", e);
        }
        eprintln!("certpilot: configuration file {} test failed", path.display());
        return Ok(1);
    }

    info!("Configuration test successful:");
    info!("  - domain {}", config.domain.name);
    info!("  - {} challenge strateg(ies)", config.acme.strategies.len());
    info!("  - directory {}", config.directory_url());

    println!(
        "certpilot: configuration file {} test is successful",
        path.display()
    );
    Ok(0)
}

/// Execute a single bootstrap or renewal run
async fn run_once(config: &Config, mode: RunMode, json: bool) -> Result<i32> {
    let signals = SignalManager::new();
    signals.install().context("Failed to install signal handlers")?;

    let orchestrator = Orchestrator::from_config(config, signals.shutdown_token())?;
    let report = orchestrator.run(mode).await;

    print_report(&report, json)?;
    Ok(report.exit_code())
}

/// Bootstrap, then run the renewal scheduler until shutdown
async fn run_daemon(config: &Config) -> Result<i32> {
    let signals = SignalManager::new();
    signals.install().context("Failed to install signal handlers")?;
    let shutdown = signals.shutdown_token();

    let orchestrator = Arc::new(Orchestrator::from_config(config, shutdown.clone())?);

    let report = orchestrator.run(RunMode::Bootstrap).await;
    print_report(&report, false)?;
    if report.outcome == RunOutcome::Interrupted {
        return Ok(report.exit_code());
    }
    if !matches!(report.outcome, RunOutcome::Issued | RunOutcome::AlreadyValid) {
        warn!(
            outcome = report.outcome.as_str(),
            "Initial bootstrap did not complete, the scheduler will retry"
        );
    }

    RenewalScheduler::new(Arc::clone(&orchestrator), config.acme.check_interval())
        .with_trigger(signals.reload_trigger())
        .run(shutdown)
        .await;

    info!("certpilot daemon stopped");
    Ok(0)
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        let rendered =
            serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
        println!("{}", rendered);
        return Ok(());
    }

    let path: Vec<&str> = report.path().iter().map(|s| s.as_str()).collect();
    println!(
        "certpilot: {} {} (state {}, exit {})",
        report.domain,
        report.outcome.as_str(),
        report.final_state,
        report.exit_code()
    );
    println!("  path: {}", path.join(" -> "));
    if let Some(expires) = report.certificate_expires_at {
        println!("  certificate expires: {}", expires);
    }
    for attempt in &report.attempts {
        println!(
            "  attempt: {} {:?}{}",
            attempt.method.as_str(),
            attempt.outcome,
            attempt
                .error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn show_status(config: &Config) -> Result<i32> {
    let domain = config.domain();
    let store = CertificateStore::new(&config.acme.storage)
        .with_context(|| format!("Failed to open storage at {}", config.acme.storage.display()))?;

    println!("domain: {}", domain);
    println!("directory: {}", config.directory_url());

    match store.load_bundle(&domain.name)? {
        Some(bundle) => {
            let now = Utc::now();
            let remaining = bundle.remaining(now);
            println!("certificate: {}", bundle.cert_path.display());
            println!("  issued: {}", bundle.issued_at);
            println!("  expires: {}", bundle.expires_at);
            println!("  remaining: {} day(s)", remaining.as_secs() / 86_400);
            println!(
                "  renewal due: {}",
                bundle.needs_renewal(now, config.acme.renew_threshold())
            );
        }
        None => println!("certificate: none"),
    }

    let state = ProxyState::load(&store.domain_path(&domain.name));
    println!("proxy variant: {}", state.variant.as_str());
    println!("proxy running: {}", state.running);
    if let Some(pid) = state.pid {
        println!("proxy pid: {}", pid);
    }
    if let Some(reload) = state.last_reload {
        println!("last reload: {}", reload);
    }

    Ok(0)
}

fn show_history(config: &Config, limit: usize) -> Result<i32> {
    let domain = config.domain();
    let store = CertificateStore::new(&config.acme.storage)
        .with_context(|| format!("Failed to open storage at {}", config.acme.storage.display()))?;

    let attempts = store.recent_attempts(&domain.name, limit)?;
    if attempts.is_empty() {
        println!("no issuance attempts recorded for {}", domain);
        return Ok(0);
    }

    for attempt in attempts {
        println!(
            "{} {} {:<10} {:?} {}",
            attempt.started_at.format("%Y-%m-%dT%H:%M:%SZ"),
            attempt.run_id.short(),
            attempt.method.as_str(),
            attempt.outcome,
            attempt.error.as_deref().unwrap_or("")
        );
    }
    Ok(0)
}
