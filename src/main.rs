mod config;
mod crash;
mod data_dir;
mod exec;
mod guard;
mod notify;
mod orchestrator;
mod probe;
mod repair;
mod restart;
mod retry;
mod state;
mod status;
mod supervisor;

use clap::{Parser, Subcommand};
use config::WatchdogConfig;
use data_dir::DataDir;
use orchestrator::{Orchestrator, RemediationSettings};
use probe::GatewayProbe;
use repair::{CommandRepairAgent, RepairAgent};
use std::path::PathBuf;
use std::time::Duration;

/// Exit code when the configuration cannot be loaded.
const EXIT_CONFIG: i32 = 2;

/// A self-healing watchdog for a supervised gateway process: detect repeated
/// crashes, hand the fix to a repair agent, validate, restart, and record.
#[derive(Parser, Debug)]
#[command(name = "gateway-watchdog", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file path [default: ~/.gateway-watchdog/config.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long, global = true)]
    dry_run: bool,

    /// Extra logging (probe results, crash counting, agent output)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the watchdog once (default; meant to be called by a scheduler)
    Run,
    /// Probe the gateway and print what a run would decide, without acting
    Check,
    /// Print the persisted watchdog state and remaining cooldown
    Status,
    /// Validate the gateway config, restart it, and verify it comes back
    Restart,
    /// Clear the persisted state, ending any cooldown
    Reset,
    /// Write a default config file into the data directory
    Init,
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "gateway_watchdog=debug"
    } else if cli.quiet {
        "gateway_watchdog=warn"
    } else {
        "gateway_watchdog=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli, home: &std::path::Path) -> Result<WatchdogConfig, config::ConfigError> {
    let path = match &cli.config {
        Some(p) => config::expand_home(p, home),
        None => DataDir::new(config::expand_home(
            &WatchdogConfig::default().storage.data_dir,
            home,
        ))
        .config(),
    };
    tracing::debug!(path = %path.display(), "loading config");
    let mut config = WatchdogConfig::load(&path)?;
    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    config.expand_paths(home);
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let home = config::home_dir();
    let config = match load_config(&cli, &home) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => print!("{rendered}"),
            Err(e) => {
                tracing::error!(error = %e, "failed to render configuration");
                std::process::exit(EXIT_CONFIG);
            }
        }
        return;
    }

    let command = cli.command.unwrap_or(Command::Run);
    let code = dispatch(command, &config).await;
    std::process::exit(code);
}

async fn dispatch(command: Command, config: &WatchdogConfig) -> i32 {
    let data_dir = DataDir::new(&config.storage.data_dir);

    match command {
        Command::Init => match data_dir.init() {
            Ok(true) => {
                println!("Wrote {}", data_dir.config().display());
                0
            }
            Ok(false) => {
                println!(
                    "{} already exists in {}",
                    data_dir.config().display(),
                    data_dir.root().display()
                );
                0
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to initialize data directory");
                1
            }
        },
        Command::Status => {
            let store = state::StateStore::new(data_dir.state());
            let loaded = match store.load() {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read watchdog state");
                    return 1;
                }
            };
            let cooldown = state::cooldown_remaining(
                loaded.as_ref(),
                config.remediation.cooldown_secs,
                chrono::Utc::now(),
            );
            print!("{}", status::render_state(store.path(), loaded.as_ref(), cooldown));
            0
        }
        Command::Reset => {
            let lock = match state::StateLock::try_acquire(&data_dir.lock()) {
                Ok(Some(lock)) => lock,
                Ok(None) => {
                    eprintln!("A watchdog run is in progress; try again later.");
                    return 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to take run lock");
                    return 1;
                }
            };
            let result = state::StateStore::new(data_dir.state()).clear();
            drop(lock);
            match result {
                Ok(true) => {
                    println!("Watchdog state cleared.");
                    0
                }
                Ok(false) => {
                    println!("No watchdog state to clear.");
                    0
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to clear watchdog state");
                    1
                }
            }
        }
        Command::Run | Command::Check | Command::Restart => {
            run_with_collaborators(command, config, &data_dir).await
        }
    }
}

async fn run_with_collaborators(
    command: Command,
    config: &WatchdogConfig,
    data_dir: &DataDir,
) -> i32 {
    let supervisor = supervisor::from_config(&config.supervisor);
    let gateway = &config.gateway;
    let probe = GatewayProbe::new(
        supervisor.as_ref(),
        &gateway.label,
        gateway.health_port,
        &gateway.health_path,
        Duration::from_secs(gateway.health_timeout_secs),
    );
    let validator = guard::validator_from_config(&config.validator);
    let notifier = notify::from_config(&config.notify);
    let settings = RemediationSettings::from_config(config, data_dir);

    if command == Command::Restart {
        return manual_restart(
            &settings,
            supervisor.as_ref(),
            &probe,
            validator.as_ref(),
            notifier.as_ref(),
        )
        .await;
    }

    let agent = CommandRepairAgent::detect(&config.repair_agent);
    let repair = agent.as_ref().map(|a| a as &dyn RepairAgent);
    let orchestrator = Orchestrator::new(
        settings,
        &probe,
        supervisor.as_ref(),
        repair,
        validator.as_ref(),
        notifier.as_ref(),
    );
    let now = chrono::Utc::now();

    if command == Command::Check {
        let assessment = orchestrator.assess(now).await;
        print!("{}", status::render_assessment(&gateway.label, &assessment));
        let state_report = status::render_state(
            &data_dir.state(),
            assessment.last_state.as_ref(),
            assessment.cooldown,
        );
        print!("{state_report}");
        return 0;
    }

    tracing::debug!(health_url = probe.health_url(), "watchdog run starting");
    let outcome = orchestrator.run(now).await;
    tracing::info!(outcome = %outcome, exit_code = outcome.exit_code(), "watchdog run finished");
    outcome.exit_code()
}

/// Validate, restart, verify. Does not touch the watchdog state.
async fn manual_restart(
    settings: &RemediationSettings,
    supervisor: &dyn supervisor::Supervisor,
    probe: &dyn probe::LivenessProbe,
    validator: &dyn guard::ConfigValidator,
    notifier: &dyn notify::Notifier,
) -> i32 {
    let label = &settings.label;
    if let Err(reason) = validator.validate(&settings.config_file).await {
        eprintln!("Refusing to restart {label}: {reason}");
        return 1;
    }
    match restart::restart_and_verify(supervisor, probe, label, settings.restart).await {
        Ok(()) => {
            println!("{label} restarted and running.");
            notifier.notify(&format!("Gateway {label} restarted manually.")).await;
            0
        }
        Err(reason) => {
            eprintln!("{label} restart failed: {reason}");
            notifier
                .notify(&format!("Gateway {label} manual restart failed: {reason}"))
                .await;
            1
        }
    }
}
