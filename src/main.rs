mod api;
mod commands;
mod config;
mod db;
mod error;
mod models;
mod push;
mod session;
mod tasks;
mod voting;

use clap::Parser;
use commands::Cli;
use log::error;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();

    match commands::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
