//! CLI entry point for mdacq.
//!
//! Provides a command-line interface for exercising the acquisition
//! scheduler against simulated hardware:
//!
//! - `run`: execute a multi-dimensional acquisition with mock devices and
//!   report what was captured.
//! - `summary`: print the verbose protocol summary for a sweep without
//!   running it.
//!
//! Real hardware frontends link against the library and provide their own
//! gateway implementations; this binary exists for development and smoke
//! testing without physical devices.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use mdacq::config::Settings;
use mdacq::engine::AcquisitionEngine;
use mdacq::gateway::mock::{MockDisplay, MockGateway, MockStorage};
use mdacq::sequence::{ChannelSpec, PositionMode, SequenceSpec, SliceMode, StagePosition};

#[derive(Parser)]
#[command(name = "mdacq")]
#[command(about = "Multi-dimensional acquisition engine", long_about = None)]
struct Cli {
    /// Config name under config/ (without extension)
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an acquisition against mock hardware
    Run {
        /// Number of frames
        #[arg(long, default_value = "3")]
        frames: u32,

        /// Frame interval in milliseconds
        #[arg(long, default_value = "100")]
        interval_ms: f64,

        /// Channel preset names
        #[arg(long, value_delimiter = ',', default_value = "DAPI,FITC")]
        channels: Vec<String>,

        /// Z stack as bottom,top,step in micrometers
        #[arg(long, num_args = 3, value_names = ["BOTTOM", "TOP", "STEP"])]
        slices: Option<Vec<f64>>,

        /// Stage position labels (multi-position run)
        #[arg(long, value_delimiter = ',')]
        positions: Option<Vec<String>>,

        /// Run positions in multi-field (position-major) order
        #[arg(long)]
        multi_field: bool,

        /// Acquire slices before switching channels
        #[arg(long)]
        slices_first: bool,
    },

    /// Print the verbose protocol summary without running
    Summary {
        #[arg(long, default_value = "10")]
        frames: u32,

        #[arg(long, default_value = "1000")]
        interval_ms: f64,

        #[arg(long, value_delimiter = ',', default_value = "DAPI,FITC")]
        channels: Vec<String>,

        #[arg(long, num_args = 3, value_names = ["BOTTOM", "TOP", "STEP"])]
        slices: Option<Vec<f64>>,
    },
}

#[allow(clippy::too_many_arguments)]
fn build_spec(
    frames: u32,
    interval_ms: f64,
    channels: &[String],
    slices: Option<&Vec<f64>>,
    positions: Option<&Vec<String>>,
    multi_field: bool,
    slices_first: bool,
) -> SequenceSpec {
    let mut spec = SequenceSpec {
        frame_count: frames,
        frame_interval_ms: interval_ms,
        channels: channels.iter().map(|c| ChannelSpec::named(c)).collect(),
        ..SequenceSpec::default()
    };
    if let Some(s) = slices {
        spec.use_slices = true;
        spec.slice_bottom_um = s[0];
        spec.slice_top_um = s[1];
        spec.slice_step_um = s[2];
    }
    if let Some(labels) = positions {
        spec.use_positions = true;
        spec.positions = labels
            .iter()
            .enumerate()
            .map(|(i, label)| StagePosition::new(label, i as f64 * 100.0, 0.0))
            .collect();
    }
    if multi_field {
        spec.position_mode = PositionMode::MultiField;
    }
    if slices_first {
        spec.slice_mode = SliceMode::SlicesFirst;
    }
    spec
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log_level.clone()),
    )
    .init();

    match cli.command {
        Commands::Run {
            frames,
            interval_ms,
            channels,
            slices,
            positions,
            multi_field,
            slices_first,
        } => {
            let spec = build_spec(
                frames,
                interval_ms,
                &channels,
                slices.as_ref(),
                positions.as_ref(),
                multi_field,
                slices_first,
            );

            let gateway = Arc::new(MockGateway::new(512, 512, 2));
            let storage = Arc::new(MockStorage::new());
            let display = Arc::new(MockDisplay::new());
            let engine = AcquisitionEngine::new(
                settings,
                gateway.clone(),
                storage.clone(),
                display.clone(),
            );

            println!("{}", engine.verbose_summary(&spec));
            println!();

            engine.acquire(&spec).await?;
            engine.wait_for_completion().await;

            if let Some(err) = engine.state().last_error() {
                eprintln!("Run failed: {err}");
                std::process::exit(1);
            }

            let records = storage.records().await;
            println!("Captured {} images ({} snaps)", records.len(), gateway.total_snaps());
            if let Some(last) = records.last() {
                println!(
                    "Last image: frame {} channel {} slice {} position {} at z {:.2} um",
                    last.frame, last.channel, last.slice, last.position, last.z_um
                );
            }
            Ok(())
        }

        Commands::Summary {
            frames,
            interval_ms,
            channels,
            slices,
        } => {
            let spec = build_spec(
                frames,
                interval_ms,
                &channels,
                slices.as_ref(),
                None,
                false,
                false,
            );
            println!("{}", spec.verbose_summary(settings.min_z_step_um));
            Ok(())
        }
    }
}
