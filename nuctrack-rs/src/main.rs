use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, IsTerminal, Write};

use nuctrack::{infection, metadata, pipeline, pyramid, stats};

#[derive(Parser)]
#[command(
    name = "nuctrack",
    about = "nuctrack CLI: describe, pyramid, segment, stats, infection"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the structure of an OME-Zarr plate
    Describe(metadata::DescribeArgs),
    /// Write mean-downsampled resolution levels for every selected position
    Pyramid(pyramid::PyramidArgs),
    /// Segment and track nuclei in every selected position
    Segment(pipeline::SegmentArgs),
    /// Per-object statistics from the tracked labels
    Stats(stats::StatsArgs),
    /// Heuristic infection calls on a stats CSV
    Infection(infection::InfectionArgs),
}

/// Progress sink: JSON lines for front ends reading stderr, a bar otherwise.
enum Progress {
    Json,
    Bar(ProgressBar),
}

impl Progress {
    fn new() -> Self {
        if !io::stderr().is_terminal() {
            return Progress::Json;
        }
        let bar = ProgressBar::new(1000);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Progress::Bar(bar)
    }

    fn report(&self, prog: f64, msg: &str) {
        match self {
            Progress::Json => {
                let _ = writeln!(
                    io::stderr(),
                    "{}",
                    serde_json::json!({"progress": prog, "message": msg})
                );
                let _ = io::stderr().flush();
            }
            Progress::Bar(bar) => {
                bar.set_position((prog.clamp(0.0, 1.0) * 1000.0) as u64);
                bar.set_message(msg.to_string());
            }
        }
    }

    fn finish(&self) {
        if let Progress::Bar(bar) = self {
            bar.finish();
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let progress = Progress::new();
    let report = |p: f64, msg: &str| progress.report(p, msg);
    let result = match cli.command {
        Commands::Describe(args) => metadata::run(args),
        Commands::Pyramid(args) => pyramid::run(args, report),
        Commands::Segment(args) => pipeline::run(args, report),
        Commands::Stats(args) => stats::run(args, report),
        Commands::Infection(args) => infection::run(args, report),
    };
    progress.finish();
    result?;
    Ok(())
}
