//! Command-line interface for the speaking test client
//!
//! Handles argument parsing and logging configuration.

use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

use crate::api::{Mode, TestType};

/// Take a timed speaking test against the scoring backend
#[derive(Parser, Debug)]
#[command(name = "speaking-test")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Test to take: toefl or ielts
    #[arg(long, default_value = "toefl")]
    pub test_type: TestType,

    /// full or practice
    #[arg(long, default_value = "practice")]
    pub mode: Mode,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Bearer token for the backend
    #[arg(long, env = "SPEAKING_TEST_TOKEN")]
    pub token: Option<String>,

    /// Sign in with this account when no token is given
    #[arg(long, env = "SPEAKING_TEST_EMAIL", requires = "password")]
    pub email: Option<String>,

    #[arg(long, env = "SPEAKING_TEST_PASSWORD", hide_env_values = true, requires = "email")]
    pub password: Option<String>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    pub save_settings: bool,

    /// Override each task's preparation time, in seconds
    #[arg(long)]
    pub prep_secs: Option<u32>,

    /// Override each task's response time, in seconds
    #[arg(long)]
    pub response_secs: Option<u32>,

    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Keep dependencies quiet unless asked
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module("speaking_test", args.log_level());

    if args.verbose >= 4 {
        builder.filter_module("tokio_tungstenite", args.log_level());
        builder.filter_module("tungstenite", args.log_level());
        builder.filter_module("reqwest", args.log_level());
    }

    builder.format_timestamp_millis().init();
}
