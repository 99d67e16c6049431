use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use intercomp::manager::Manager;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    #[arg(long)]
    run_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compare both records over every window with Monte Carlo smoothing.
    Compare {
        /// Also save every realization as MessagePack.
        #[arg(long)]
        save_ensemble: bool,
    },

    /// Pair the monthly means of both records.
    Monthly,

    /// Merge the offset-corrected candidate with the reference and smooth it.
    Harmonize,

    /// Remove every output file.
    Clean,
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(args.run_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Compare { save_ensemble } => mgr.compare(save_ensemble)?,
        Command::Monthly => mgr.monthly()?,
        Command::Harmonize => mgr.harmonize()?,
        Command::Clean => mgr.clean()?,
    }

    Ok(())
}
