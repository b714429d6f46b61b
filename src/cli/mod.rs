pub mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "volley-worker")]
#[command(about = "Worker node for a distributed HTTP load-testing fleet", long_about = None)]
pub struct Cli {
    /// Log filter (e.g. "info", "volley_worker=debug"). RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to the controller and execute the tasks it assigns
    Worker {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },
    /// Run a test case file locally and print each result as a JSON line (debug mode)
    Exec {
        /// Path to a test case JSON file
        testcase: PathBuf,

        /// Path to the configuration file (sandbox limits)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
