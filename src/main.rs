//! Command-line front end for the pipette engine.

use anyhow::{Context, Result};
use autopipette::config::Settings;
use autopipette::controller::{ControllerHandle, MockController, RemoteController};
use autopipette::dispatch::Dispatcher;
use autopipette::monitor::{AlertEvent, AlertMonitor};
use autopipette::persist::DeckSnapshot;
use autopipette::runner::{Program, RunStatus, Runner, RunnerHandle};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "autopipette", version, about = "Liquid-handling protocol engine")]
struct Cli {
    /// Pipette profile to load.
    #[arg(short, long, default_value = "config/p100.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a protocol program on the machine.
    Run {
        /// Path to the program JSON.
        program: PathBuf,
        /// Ignore any persisted deck snapshot and start with fresh cursors.
        #[arg(long)]
        fresh: bool,
    },
    /// Validate a program against a simulated machine, printing the
    /// command stream it would produce.
    Check {
        /// Path to the program JSON.
        program: PathBuf,
    },
    /// Show the plunger actuation a volume maps to under this profile.
    Vol {
        /// Requested volume in microliters.
        volume: f64,
    },
    /// Reset every consumable cursor in the persisted deck snapshot.
    ResetPlates,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading profile {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new(&settings.application.log_level)
                }),
        )
        .init();

    match cli.command {
        Command::Run { program, fresh } => run(&settings, &program, fresh).await,
        Command::Check { program } => check(&settings, &program).await,
        Command::Vol { volume } => vol(&settings, volume),
        Command::ResetPlates => reset_plates(&settings),
    }
}

fn build_dispatcher(settings: &Settings, controller: ControllerHandle) -> Result<Dispatcher> {
    let deck = settings.build_deck()?;
    let calibration = settings.build_calibration()?;
    Ok(Dispatcher::new(
        controller,
        deck,
        calibration,
        settings.speed.clone(),
        settings.servo.clone(),
        settings.wait.clone(),
        settings.dispatch.clone(),
    ))
}

async fn run(settings: &Settings, program_path: &PathBuf, fresh: bool) -> Result<()> {
    let program = Program::from_path(program_path)
        .with_context(|| format!("loading program {}", program_path.display()))?;

    let controller: ControllerHandle = Arc::new(
        RemoteController::connect(&settings.network.host, settings.network.port).await?,
    );
    let mut dispatcher = build_dispatcher(settings, controller.clone())?;

    let snapshot_path = settings.application.snapshot_path.clone();
    if fresh {
        info!("starting with fresh cursors");
    } else if let Some(snapshot) = DeckSnapshot::load(&snapshot_path)? {
        info!(saved_at = %snapshot.saved_at, "restoring deck snapshot");
        snapshot.apply(dispatcher.deck_mut())?;
    }

    dispatcher.initialize().await?;

    let handle = Runner::spawn(dispatcher, controller.clone(), Some(snapshot_path));
    let (alert_monitor, mut alerts) = AlertMonitor::spawn(
        handle.subscribe(),
        controller,
        settings.monitor.clone(),
    );
    tokio::spawn(async move {
        while let Some(alert) = alerts.recv().await {
            match alert {
                AlertEvent::StatusChanged { from, to } => info!(?from, ?to, "run status"),
                AlertEvent::RunFaulted => error!("run faulted"),
                AlertEvent::ControllerFault { message } => error!(%message, "machine fault"),
                AlertEvent::StatusUnavailable { message } => {
                    warn!(%message, "machine status unavailable")
                }
            }
        }
    });

    // Ctrl-C is the operator's emergency stop.
    let estop_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, emergency stopping");
            estop_handle.emergency_stop();
        }
    });

    handle.start(program).await?;
    let outcome = wait_for_terminal(&handle).await;
    alert_monitor.stop();

    let report = handle.query().await?;
    info!(?outcome, cursors = ?report.cursors, "run ended");
    match outcome {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => {
            info!("run cancelled by operator");
            Ok(())
        }
        other => anyhow::bail!(
            "run ended {:?}: {}",
            other,
            report.last_error.unwrap_or_else(|| "unknown error".into())
        ),
    }
}

async fn check(settings: &Settings, program_path: &PathBuf) -> Result<()> {
    let program = Program::from_path(program_path)
        .with_context(|| format!("loading program {}", program_path.display()))?;

    let mock = Arc::new(MockController::new());
    let dispatcher = build_dispatcher(settings, mock.clone())?;
    let handle = Runner::spawn(dispatcher, mock.clone(), None);

    handle.start(program).await?;
    let outcome = wait_for_terminal(&handle).await;
    let report = handle.query().await?;

    for line in mock.commands() {
        println!("{line}");
    }
    match outcome {
        RunStatus::Completed => {
            info!(cursors = ?report.cursors, "program is valid");
            Ok(())
        }
        other => anyhow::bail!(
            "program failed {:?}: {}",
            other,
            report.last_error.unwrap_or_else(|| "unknown error".into())
        ),
    }
}

fn vol(settings: &Settings, volume: f64) -> Result<()> {
    let table = settings.build_calibration()?;
    let steps = table.vol_to_steps(volume)?;
    println!("{volume} uL -> {steps:.2} steps (max {} uL)", table.max_vol());
    Ok(())
}

fn reset_plates(settings: &Settings) -> Result<()> {
    let mut deck = settings.build_deck()?;
    let path = &settings.application.snapshot_path;
    if let Some(snapshot) = DeckSnapshot::load(path)? {
        snapshot.apply(&mut deck)?;
    }
    deck.reset_all_cursors();
    DeckSnapshot::capture(&deck, None).save(path)?;
    info!(path = %path.display(), "cursors reset");
    Ok(())
}

/// Waits until the runner reaches a terminal status.
async fn wait_for_terminal(handle: &RunnerHandle) -> RunStatus {
    let mut status = handle.subscribe();
    loop {
        let current = *status.borrow_and_update();
        if matches!(
            current,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Faulted
        ) {
            return current;
        }
        if status.changed().await.is_err() {
            return current;
        }
    }
}
