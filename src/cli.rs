//! Command-line interface.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::capture::{self, DeviceSource, FrameSource, ReplaySource};
use crate::config::Config;
use crate::monitor::Monitor;
use crate::sink::{ErrorLog, FlowLog, PacketDump};

#[derive(Parser, Debug)]
#[command(name = "netmon", version, about = "Per-flow network traffic accountant")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Capture live traffic and account flows
    Run {
        /// Interface to capture on (overrides the config file)
        #[arg(short = 'i', long)]
        device: Option<String>,
    },
    /// Re-run accounting over a recorded packet dump
    Replay {
        /// A dated .dat file from a previous run
        file: PathBuf,
    },
    /// List capture-capable interfaces
    Devices,
    /// Write a default configuration file
    GenConfig {
        /// Destination path
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
}

pub async fn run_command(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run { device } => {
            let device = device
                .or_else(|| {
                    (!config.capture.device.is_empty()).then(|| config.capture.device.clone())
                })
                .context("no capture device given; pass --device or set capture.device")?;
            let source = DeviceSource::open(
                &device,
                config.capture.snaplen,
                config.capture.read_timeout_ms,
                config.capture.promiscuous,
            )?;
            run_monitor(Box::new(source), &config).await
        }
        Commands::Replay { file } => {
            let source = ReplaySource::open(&file)?;
            run_monitor(Box::new(source), &config).await
        }
        Commands::Devices => {
            for name in capture::list_devices()? {
                println!("{name}");
            }
            Ok(())
        }
        Commands::GenConfig { output } => Config::default().save(&output),
    }
}

/// Drive the blocking monitor loop on a worker thread and wire Ctrl-C to its
/// stop flag. The loop notices the flag within one capture read timeout.
async fn run_monitor(source: Box<dyn FrameSource>, config: &Config) -> Result<()> {
    let log = FlowLog::new(&config.accounting.log_dir);
    let dump = config.packet_dump_dir().map(PacketDump::new);
    let errors = ErrorLog::new(&config.accounting.log_dir);
    let mut monitor = Monitor::new(source, log, dump, errors, config.accounting.expiry_ticks);
    let stop = monitor.stop_flag();

    let mut worker = tokio::task::spawn_blocking(move || monitor.run());
    let report = tokio::select! {
        res = &mut worker => res.context("monitor thread panicked")??,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping");
            stop.store(true, Ordering::Relaxed);
            (&mut worker).await.context("monitor thread panicked")??
        }
    };
    info!(
        frames = report.frames,
        flows = report.flows_logged,
        dissect_errors = report.dissect_errors,
        "run complete"
    );
    Ok(())
}
