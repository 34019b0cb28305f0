use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use powered_up_trains::domain::models::SessionEvent;
use powered_up_trains::domain::settings::SettingsService;
use powered_up_trains::error::HubError;
use powered_up_trains::infrastructure::bluetooth::connection::BtleplugLinkFactory;
use powered_up_trains::infrastructure::bluetooth::scanner::BtleplugScanner;
use powered_up_trains::infrastructure::bluetooth::simulated::SimulatedFleet;
use powered_up_trains::infrastructure::bluetooth::{BleScan, LinkFactory};
use powered_up_trains::infrastructure::logging::init_logger;
use powered_up_trains::lessons::Lesson;
use powered_up_trains::orchestrator::{KeepDefaultNames, NamePrompt, Orchestrator, StdinPrompt};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "powered_up_trains", version, about = "Drive LEGO Powered Up trains over BLE")]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hub mapping file
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// How long a discovery scan listens, in milliseconds
    #[arg(long, global = true)]
    scan_timeout_ms: Option<u64>,

    /// Use simulated hubs instead of the Bluetooth adapter
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LessonArg {
    /// Accelerate forwards, stop, then run backwards
    ForwardBack,
    /// Run until yellow, reverse, stop on blue
    ColourStop,
}

impl From<LessonArg> for Lesson {
    fn from(arg: LessonArg) -> Self {
        match arg {
            LessonArg::ForwardBack => Lesson::ForwardBack,
            LessonArg::ColourStop => Lesson::ColourStop,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Scan for hubs and add new ones to the mapping file
    Discover,
    /// Run a lesson on every hub in the mapping file
    Run {
        #[arg(long, value_enum, default_value = "forward-back")]
        lesson: LessonArg,
        /// Keep default names for new hubs instead of asking
        #[arg(long)]
        yes: bool,
        /// Do not scan for new hubs first
        #[arg(long)]
        no_scan: bool,
    },
    /// Write the current settings to the settings file
    InitConfig,
}

fn load_settings(cli: &Cli) -> anyhow::Result<SettingsService> {
    let mut service = match &cli.config {
        Some(path) => SettingsService::from_path(path.clone()),
        None => SettingsService::new()?,
    };
    let settings = service.get_mut();
    if let Some(path) = &cli.registry {
        settings.registry_path = path.clone();
    }
    if let Some(ms) = cli.scan_timeout_ms {
        settings.scan_timeout_ms = ms;
    }
    if let Command::Run { no_scan: true, .. } = cli.command {
        settings.scan_before_run = false;
    }
    Ok(service)
}

fn backends(simulate: bool) -> (Arc<dyn BleScan>, Arc<dyn LinkFactory>) {
    if simulate {
        let fleet = SimulatedFleet::demo();
        (Arc::new(fleet.clone()), Arc::new(fleet))
    } else {
        (Arc::new(BtleplugScanner), Arc::new(BtleplugLinkFactory))
    }
}

async fn execute(cli: Cli, service: SettingsService) -> anyhow::Result<ExitCode> {
    if let Command::InitConfig = cli.command {
        service
            .save()
            .with_context(|| format!("writing {}", service.path().display()))?;
        info!("Settings written to {}", service.path().display());
        return Ok(ExitCode::SUCCESS);
    }

    let (scan, links) = backends(cli.simulate);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let orchestrator =
        Orchestrator::new(service.into_settings(), scan, links).with_events(events_tx);
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                SessionEvent::StateChanged { identity, state } => {
                    debug!("{} is now {:?}", identity, state)
                }
                SessionEvent::SensorChanged {
                    identity,
                    capability,
                    value,
                } => debug!("{} {}: {:?}", identity, capability, value),
            }
        }
    });

    match cli.command {
        Command::Discover => {
            let report = orchestrator.discover().await?;
            for hub in &report.found {
                info!("Found {} ({})", hub.advertised_name, hub.identity);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { lesson, yes, .. } => {
            let stopper = orchestrator.stopper();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping hubs");
                    stopper.stop_all();
                }
            });

            let mut prompt: Box<dyn NamePrompt> = if yes {
                Box::new(KeepDefaultNames)
            } else {
                Box::new(StdinPrompt::new())
            };
            let report = match orchestrator.run(lesson.into(), prompt.as_mut()).await {
                Ok(report) => report,
                // already reported by the orchestrator
                Err(
                    HubError::RegistryMissing(_)
                    | HubError::RegistryEmpty(_)
                    | HubError::RegistryCorrupt { .. },
                ) => return Ok(ExitCode::FAILURE),
                Err(e) => return Err(e.into()),
            };

            let failures = report.failures();
            info!(
                "{} of {} hubs finished cleanly",
                report.outcomes.len() - failures,
                report.outcomes.len()
            );
            Ok(if failures == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::InitConfig => Ok(ExitCode::SUCCESS),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let service = load_settings(&cli)?;

    let _logging_guard = init_logger(&service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Powered Up trains");
    execute(cli, service).await
}
