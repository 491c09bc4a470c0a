//! guestfarm CLI - Provision guests and run multi-host test schedules.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use guestfarm::config::{self, Config, ProviderConfig};
use guestfarm::environment::TestingEnvironment;
use guestfarm::lifecycle::{GuestRequest, Provisioner, ProvisionerSettings};
use guestfarm::orchestrator::{Orchestrator, RunContext};
use guestfarm::provider;
use guestfarm::report::{ConsoleReporter, write_results};
use guestfarm::schedule::load_schedule;
use guestfarm::session::log_channel;
use guestfarm::session::ssh::SshConnector;

#[derive(Parser)]
#[command(name = "guestfarm")]
#[command(about = "Provision guests and run multi-host test schedules", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "guestfarm.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test schedule
    Run {
        /// Schedule file path
        #[arg(short, long, default_value = "schedule.toml")]
        schedule: PathBuf,

        /// Override the number of concurrent guest acquisitions
        #[arg(short, long)]
        parallel: Option<usize>,
    },

    /// Acquire guests, print how to reach them, then release them
    Provision {
        #[arg(long, default_value = "x86_64")]
        arch: String,

        #[arg(long)]
        compose: String,

        #[arg(long)]
        pool: Option<String>,

        /// Number of guests
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,

        /// Keep the guests until Ctrl-C
        #[arg(long)]
        hold: bool,
    },

    /// Validate the configuration file and, optionally, a schedule
    Validate {
        #[arg(short, long)]
        schedule: Option<PathBuf>,
    },

    /// Initialize a new configuration file
    Init {
        /// Provider type (artemis, static)
        #[arg(short, long, default_value = "artemis")]
        provider: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { schedule, parallel } => {
            run_schedule(&cli.config, &schedule, parallel, cli.verbose).await
        }
        Commands::Provision {
            arch,
            compose,
            pool,
            count,
            hold,
        } => {
            let mut environment = TestingEnvironment::new(arch, compose);
            if let Some(pool) = pool {
                environment = environment.with_pool(pool);
            }
            provision_guests(&cli.config, environment, count, hold).await
        }
        Commands::Validate { schedule } => validate(&cli.config, schedule.as_deref()),
        Commands::Init { provider } => init_config(&cli.config, &provider),
    }
}

/// Cancels `cancel` on the first Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling and releasing guests");
            cancel.cancel();
        }
    });
}

async fn run_schedule(
    config_path: &Path,
    schedule_path: &Path,
    parallel_override: Option<usize>,
    verbose: bool,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(parallel) = parallel_override {
        config.farm.max_concurrent_acquisitions = parallel;
    }
    info!("Loaded configuration from {}", config_path.display());

    let schedule = load_schedule(schedule_path)?;
    info!(
        "Loaded {} schedule entries from {}",
        schedule.len(),
        schedule_path.display()
    );

    let client = provider::connect(&config.provider)
        .await
        .context("Failed to set up the provisioning client")?;

    let (logs, mut stream) = log_channel();
    let stream_output = config.runner.stream_output;
    let printer = tokio::spawn(async move {
        while let Some(record) = stream.next().await {
            if stream_output {
                println!("[{}] {}", record.entry_id, record.line);
            }
        }
    });

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let ctx = RunContext::from_config(&config, client, logs)?.with_cancel(cancel);
    let orchestrator = Orchestrator::new(ctx, ConsoleReporter::new(verbose));
    let report = orchestrator.run(&schedule).await?;

    // The orchestrator owned the last sender; the printer drains and exits.
    drop(orchestrator);
    if let Err(e) = printer.await {
        warn!("Output printer failed: {}", e);
    }

    let results_path = config.report.results_path();
    write_results(&report, &results_path)?;
    info!("Results written to {}", results_path.display());

    std::process::exit(report.exit_code());
}

async fn provision_guests(
    config_path: &Path,
    environment: TestingEnvironment,
    count: usize,
    hold: bool,
) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let client = provider::connect(&config.provider)
        .await
        .context("Failed to set up the provisioning client")?;
    let provisioner = Arc::new(
        Provisioner::new(client, ProvisionerSettings::from_config(&config)?)
            .with_connector(Arc::new(SshConnector::new(&config.runner.ssh))),
    );
    let options = config.provider.provision_options();

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    info!("Provisioning {} guest(s) of {}", count, environment);
    let mut guests: Vec<GuestRequest> = (0..count)
        .map(|i| GuestRequest::new(format!("provision-{}", i + 1), environment.clone()))
        .collect();

    let results = futures::future::join_all(guests.iter_mut().map(|guest| {
        let options = options.clone().tag("entry-id", guest.owner());
        let provisioner = Arc::clone(&provisioner);
        let cancel = cancel.clone();
        async move { provisioner.acquire(guest, &options, &cancel).await }
    }))
    .await;

    let mut failed = 0;
    for (guest, result) in guests.iter().zip(results) {
        match result {
            Ok(()) => {
                if let Some(summary) = guest.summary() {
                    let hint = summary.ssh_hint().unwrap_or_default();
                    println!("{}  {}", console::style(&summary.guestname).green(), hint);
                }
            }
            Err(e) => {
                failed += 1;
                eprintln!("{} {}: {}", console::style("ERR").red(), guest.owner(), e);
            }
        }
    }

    if hold && failed < count {
        println!();
        println!("Guests are held. Press Ctrl-C to release them.");
        cancel.cancelled().await;
    }

    for guest in &mut guests {
        provisioner.release_quietly(guest).await;
    }
    info!("Released {} guest(s)", count);

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn validate(config_path: &Path, schedule_path: Option<&Path>) -> Result<()> {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };
    print_settings(&config);

    if let Some(path) = schedule_path {
        match load_schedule(path) {
            Ok(schedule) => {
                println!();
                println!("Schedule is valid: {} entries", schedule.len());
            }
            Err(e) => {
                eprintln!("Schedule error: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn print_settings(config: &Config) {
    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!(
        "  Max concurrent acquisitions: {}",
        config.farm.max_concurrent_acquisitions
    );
    println!("  Max parallel groups: {}", config.farm.max_parallel_groups);
    println!("  Step timeout: {}s", config.runner.step_timeout_secs);
    println!("  Retry attempts: {}", config.retry.max_attempts);

    let provider_name = match &config.provider {
        ProviderConfig::Artemis(_) => "artemis",
        ProviderConfig::Static(_) => "static",
    };
    println!("  Provider: {}", provider_name);
}

fn init_config(path: &Path, provider: &str) -> Result<()> {
    let provider_config = match provider {
        "artemis" => {
            r#"[provider]
type = "artemis"
api_url = "http://artemis.example.com/v0.0.56"
keyname = "ci"
priority_group = "default-priority"

[provider.user_data]
team = "qa""#
        }
        "static" => {
            r#"[provider]
type = "static"

[[provider.guests]]
hostname = "10.0.0.5"
arch = "x86_64"
compose = "RHEL-9.4""#
        }
        _ => {
            eprintln!("Unknown provider: {}. Use: artemis, static", provider);
            std::process::exit(1);
        }
    };

    let config = format!(
        r#"# guestfarm configuration file

[farm]
max_concurrent_acquisitions = 8
max_parallel_groups = 0

{}

[polling]
ready_timeout_secs = 300
ready_tick_secs = 3
alive_timeout_secs = 300
alive_tick_secs = 5

[retry]
max_attempts = 3
initial_backoff_secs = 5

[runner]
step_timeout_secs = 3600
stream_output = false

[report]
output_dir = "results"
results_file = "results.json"
"#,
        provider_config
    );

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, config)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  guestfarm run --schedule schedule.toml");

    Ok(())
}
