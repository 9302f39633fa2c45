//! CLI entry point for pvscan.
//!
//! Headless-first interface for the acquisition core:
//! - `run` executes a full acquisition against simulated hardware from a
//!   settings file, streaming CSV output and writing a JSON run summary
//! - `grid` prints the substrate numbering map for a holder size
//! - `check` validates a settings file without touching hardware
//!
//! Real instrument drivers implement the capability traits in
//! `pvscan::hardware` and are wired in place of the mocks by integrators;
//! the sequencer itself is identical in both cases.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pvscan::config::Settings;
use pvscan::hardware::mock::{MockShutter, MockSourceMeter, MockStage, MockSwitchMatrix};
use pvscan::hardware::InstrumentRack;
use pvscan::sequencer::Sequencer;
use pvscan::sink::ResultSink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pvscan")]
#[command(about = "JV characterization and MPP tracking for photovoltaic device arrays", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an acquisition against simulated hardware
    Run {
        /// Path to a settings TOML file
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,

        /// Directory for CSV output and the run summary
        #[arg(long, default_value = "output")]
        output: PathBuf,

        /// Short-circuit current of the simulated devices, amperes (signed)
        #[arg(long, default_value_t = -0.02)]
        isc: f64,

        /// Open-circuit voltage of the simulated devices, volts
        #[arg(long, default_value_t = 0.6)]
        voc: f64,
    },

    /// Print the substrate numbering map of a holder
    Grid {
        /// Holder row count
        #[arg(long, default_value_t = 4)]
        rows: usize,

        /// Holder column count
        #[arg(long, default_value_t = 4)]
        cols: usize,
    },

    /// Validate a settings file
    Check {
        /// Path to a settings TOML file
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,
    },
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            output,
            isc,
            voc,
        } => {
            let settings = Settings::from_file(&config)
                .with_context(|| format!("loading settings from {}", config.display()))?;
            init_logging(&settings.log_level);
            run_acquisition(&settings, &output, isc, voc).await
        }
        Commands::Grid { rows, cols } => {
            init_logging("info");
            print_grid(rows, cols)
        }
        Commands::Check { config } => {
            init_logging("info");
            let settings = Settings::from_file(&config)
                .with_context(|| format!("loading settings from {}", config.display()))?;
            settings.to_acquisition_config()?;
            println!("{} is valid", config.display());
            Ok(())
        }
    }
}

async fn run_acquisition(settings: &Settings, output: &Path, isc: f64, voc: f64) -> Result<()> {
    let acquisition = settings.to_acquisition_config()?;

    let rack = InstrumentRack {
        stage: Arc::new(MockStage::new()),
        switch: Arc::new(MockSwitchMatrix::new()),
        smu: Arc::new(
            MockSourceMeter::linear_photodiode(isc, voc).with_noise(isc.abs() * 1e-3),
        ),
        shutter: Arc::new(MockShutter::new()),
    };

    let sink = make_sink(output)?;
    let handle = Sequencer::start(acquisition, rack, sink)?;

    // Ctrl-c cancels cooperatively; teardown still runs before exit.
    let canceller = handle.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("ctrl-c received, cancelling acquisition");
            canceller.cancel();
        }
    });

    let summary = handle.wait().await?;

    std::fs::create_dir_all(output)?;
    let summary_path = output.join("summary.json");
    let file = std::fs::File::create(&summary_path)?;
    serde_json::to_writer_pretty(file, &summary)?;

    println!(
        "run {} finished in state {:?}: {} device(s), summary at {}",
        summary.run_id,
        summary.state,
        summary.devices.len(),
        summary_path.display()
    );
    for outcome in &summary.devices {
        let perf = &outcome.light.perf_reverse;
        println!(
            "  {}: Voc {:.3} V, Jsc {:.4} A/cm2, FF {:.3}, PCE {:.2} %{}",
            outcome.device,
            perf.voc,
            perf.jsc,
            perf.fill_factor,
            perf.efficiency,
            if outcome.tracking.is_some() {
                " [tracked]"
            } else {
                ""
            }
        );
    }
    Ok(())
}

#[cfg(feature = "storage_csv")]
fn make_sink(output: &Path) -> Result<Arc<dyn ResultSink>> {
    Ok(Arc::new(pvscan::sink::CsvSink::create(output)?))
}

#[cfg(not(feature = "storage_csv"))]
fn make_sink(_output: &Path) -> Result<Arc<dyn ResultSink>> {
    Ok(Arc::new(pvscan::sink::NullSink))
}

fn print_grid(rows: usize, cols: usize) -> Result<()> {
    let grid = pvscan::addressing::SubstrateGrid::new(rows, cols);
    println!("substrate numbering for a {rows}x{cols} holder (row 0 at top):");
    for row in 0..rows {
        let line: Vec<String> = (0..cols)
            .map(|col| {
                grid.substrate_number(row, col)
                    .map(|n| format!("{n:>3}"))
                    .unwrap_or_else(|_| "  ?".to_string())
            })
            .collect();
        println!("  {}", line.join(" "));
    }
    Ok(())
}
