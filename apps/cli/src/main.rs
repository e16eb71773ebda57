//! lorabatch CLI - LoRA training batches on a rented GPU box
//!
//! Provides the `lorabatch` command: pull datasets from remote storage, train
//! one LoRA per dataset directory and push the results back.

mod commands;

use clap::{Parser, Subcommand};
use lorabatch_core::settings::DEFAULT_ENV_FILE;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{download, remote, run};

/// lorabatch - batch LoRA training orchestrator
#[derive(Parser, Debug)]
#[command(
    name = "lorabatch",
    author,
    version,
    about = "Train one LoRA per dataset directory and upload the results"
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Environment settings document
    #[arg(short, long, default_value = DEFAULT_ENV_FILE, global = true)]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a training batch
    ///
    /// Downloads new datasets, extracts archives, trains every dataset
    /// directory in the working directory and uploads the LoRA files.
    Run {
        /// Override document merged onto the base training config
        /// (relative to the program directory)
        #[arg(long)]
        add: Option<PathBuf>,

        /// Keep input directories after a successful run
        #[arg(long)]
        test: bool,

        /// Print the batch report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the rclone remote is reachable
    CheckRemote,

    /// Download the pretrained model from the Hugging Face Hub
    ///
    /// Fetches `paths.pretrained_model_name_or_path` from every repository
    /// listed in `[modeldownload].models` into `paths.model_dir`.
    DownloadModel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber =
        FmtSubscriber::builder().with_max_level(level).without_time().with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Run { add, test, json } => {
            run::execute(run::RunArgs { env_file: args.env_file, add, test, json }).await
        }
        Command::CheckRemote => remote::execute(&args.env_file).await,
        Command::DownloadModel => download::execute(&args.env_file).await,
    }
}
