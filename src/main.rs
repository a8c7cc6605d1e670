use clap::Parser;
use log::*;
use std::{
    path::PathBuf,
    process::ExitCode,
    };

use motorlink::{agent, settings::AgentSettings};


/// bridge a uart motor board to an mqtt bus
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// settings file, values can be overridden by MOTORLINK_* environment variables
    #[arg(short, long, default_value = "motorlink.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let settings = match AgentSettings::load(&args.config) {
        Ok(settings) => settings,
        Err(error) => {
            error!("invalid settings: {}", error);
            return ExitCode::FAILURE
        },
    };
    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!("cannot listen for shutdown signal: {}", error);
            std::future::pending::<()>().await;
        }
    };
    match agent::run(settings, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{}", error);
            ExitCode::FAILURE
        },
    }
}
