// Import from library crate
use idr_engine::config::RunConfig;
use idr_engine::orchestrator::{Orchestrator, RunOptions};
use idr_engine::table::{CsvTableStore, TableStore};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "idr-engine")]
#[command(about = "Consent-gated identifier resolution and hashing for tabular data files")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every unprocessed configuration row
    Run {
        /// Path to the configuration CSV
        config: PathBuf,

        /// Ledger file (default: id_lookup_table.csv beside the configuration)
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Base directory for file discovery (default: the configuration's directory)
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
    /// Clear processed flags so files can be explicitly reprocessed
    Reset {
        /// Path to the configuration CSV
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let store = CsvTableStore::new();

    match args.command {
        Commands::Run {
            config,
            ledger,
            base_dir,
        } => {
            info!("starting run from {}", config.display());
            let orchestrator = Orchestrator::new(&store);
            let options = RunOptions {
                ledger_path: ledger,
                base_dir,
            };
            let summary = orchestrator.run(&config, &options)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Reset { config } => {
            let table = store.read_table(&config)?;
            let mut run_config = RunConfig::load(&table, &config)?;
            run_config.reset();
            store.write_table(&config, &run_config.to_table())?;
            info!("reset processed flags in {}", config.display());
        }
    }

    Ok(())
}
