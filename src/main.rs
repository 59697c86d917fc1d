use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cosmy::transport::BluestTransport;
use cosmy::{ChannelRegistry, Coordinator, CoordinatorConfig, CoordinatorHandle, DeviceState};
use tracing_subscriber::EnvFilter;

/// Talk to a BWT Cosmy pool cleaning robot over Bluetooth Low Energy
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Bluetooth address of the robot
    #[arg(long)]
    addr: String,

    /// TOML file overriding the default timings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds to wait for the robot to answer
    #[arg(long, default_value_t = 20.0)]
    timeout: f64,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Action {
    /// Print whether the robot is cleaning and the minutes left (default)
    Status,
    /// Power the robot on
    On,
    /// Power the robot off
    Off,
    /// Start a cleaning cycle
    Start,
    /// Stop the cleaning cycle
    Stop,
    /// Keep the robot's state up to date and print every change until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => CoordinatorConfig::from_file(path)?,
        None => CoordinatorConfig::default(),
    };
    let wait = Duration::try_from_secs_f64(cli.timeout).context("invalid --timeout")?;

    let transport = Arc::new(BluestTransport::new().await.context("failed to open the Bluetooth adapter")?);
    let registry = ChannelRegistry::default();
    let handle = Coordinator::new(&cli.addr, transport, &registry, config)?.start();

    let result = run(&handle, cli.action.unwrap_or(Action::Status), wait).await;
    handle.stop().await;
    result
}

async fn run(handle: &CoordinatorHandle, action: Action, wait: Duration) -> anyhow::Result<()> {
    match action {
        Action::Status => {
            println!("{}", result_line(&first_status(handle, wait).await));
            return Ok(());
        }
        Action::Watch => return watch(handle).await,
        _ => {}
    }
    let command = async {
        match action {
            Action::On => handle.power_on().await,
            Action::Off => handle.power_off().await,
            Action::Start => handle.start_cleaning().await,
            Action::Stop => handle.stop_cleaning().await,
            Action::Status | Action::Watch => Ok(()),
        }
    };
    tokio::time::timeout(wait, command)
        .await
        .context("the robot did not answer in time")??;
    println!("{}", result_line(&handle.state()));
    Ok(())
}

/// Wait until the robot reported its status, or give up and return what is known
async fn first_status(handle: &CoordinatorHandle, wait: Duration) -> DeviceState {
    let mut snapshots = handle.channels().watch();
    let reported = tokio::time::timeout(wait, async {
        loop {
            {
                let state = snapshots.borrow_and_update();
                if state.available && state.cleaning.is_some() {
                    return;
                }
            }
            if snapshots.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    if reported.is_err() {
        tracing::debug!("no status within {wait:?}");
    }
    handle.state()
}

async fn watch(handle: &CoordinatorHandle) -> anyhow::Result<()> {
    let mut updates = handle.channels().subscribe_state();
    let mut in_water = handle.channels().subscribe_in_water();
    println!("{}", result_line(&handle.state()));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            update = updates.recv() => match update {
                Some(_) => println!("{}", result_line(&handle.state())),
                None => return Ok(()),
            },
            wet = in_water.recv() => match wet {
                Some(wet) => println!("IN_WATER={}", wet.map_or("UNKNOWN", |w| if w { "YES" } else { "NO" })),
                None => return Ok(()),
            },
        }
    }
}

fn result_line(state: &DeviceState) -> String {
    if !state.available {
        return "RESULT=UNKNOWN".to_string();
    }
    let cleaning = match state.cleaning {
        Some(true) => "ON",
        Some(false) => "OFF",
        None => "UNKNOWN",
    };
    if state.minutes_remaining > 0 {
        format!("RESULT={cleaning} {}min", state.minutes_remaining)
    } else {
        format!("RESULT={cleaning}")
    }
}
