//! melt-rs: melt redundant layers in a docker-save image archive.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use melt_rs::{MeltOutcome, melt_archive};

#[derive(Parser)]
#[command(name = "melt-rs")]
#[command(about = "Melt redundant layers in a docker-save image archive", long_about = None)]
struct Cli {
    /// Tarball of the image to melt.
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Name of the output tarball.
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Directory to hold temporary data.
    #[arg(short = 't', long = "tmpdir")]
    tmpdir: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("melt-rs_");
    let work = match &cli.tmpdir {
        Some(hint) => builder.tempdir_in(hint),
        None => builder.tempdir(),
    }
    .context("creating working directory")?;

    let outcome = melt_archive(&cli.input, &cli.output, work.path())
        .with_context(|| format!("melting {}", cli.input.display()))?;

    match outcome {
        MeltOutcome::Melted {
            input_layers,
            output_layers,
        } => {
            println!(
                "Melted {} layers down to {} in {}.",
                input_layers,
                output_layers,
                cli.output.display()
            );
        }
        MeltOutcome::NothingToDo(reason) => {
            println!("{reason}. There is nothing to be done.");
        }
    }
    Ok(())
}
