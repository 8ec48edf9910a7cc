#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use siphon::config::Config;
use siphon::{logging, supervisor};

#[derive(Parser)]
#[command(name = "siphon")]
#[command(about = "Mirror compressed log objects from an object-store bucket to HTTP endpoints", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short)]
    config: PathBuf,

    /// Copy the local watermark file into the Redis backend and exit.
    #[arg(long)]
    migrate_state: bool,

    /// Validate the configuration, print a summary, and exit.
    #[arg(long)]
    check_config: bool,
}

fn print_config_summary(config: &Config) {
    println!(
        "configuration ok: bucket {}, {} endpoint(s), {} user format(s)",
        config.bucket(),
        config.http.endpoints.len(),
        config.processing.log_formats.len()
    );
    for format in &config.processing.log_formats {
        println!(
            "  format {}: pattern {}, layout {}, content-type {}",
            format.name, format.filename_pattern, format.timestamp_format, format.content_type
        );
    }
    println!("default format: {}", config.processing.default_format);
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    if cli.check_config {
        print_config_summary(&config);
        return ExitCode::SUCCESS;
    }

    logging::init(&config.logging);

    if cli.migrate_state {
        return match supervisor::migrate_state(&config).await {
            Ok(()) => {
                info!("state migration complete");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("state migration failed: {e}");
                ExitCode::FAILURE
            }
        };
    }

    match supervisor::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
