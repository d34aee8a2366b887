mod results;
mod vote;

use crate::api::HttpPollApi;
use crate::config::ClientConfig;
use crate::db::VoterStore;
use crate::error::PollResult;
use crate::session::VoteSession;
use crate::tasks::refresher::spawn_refresh_task;
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "noodle-vote", about = "Vote in the current poll and follow live results")]
pub struct Cli {
    /// REST base URL (overrides POLL_API_BASE_URL)
    #[arg(long, global = true)]
    pub api_base: Option<String>,

    /// Live channel base URL (overrides POLL_WS_BASE_URL)
    #[arg(long, global = true)]
    pub ws_base: Option<String>,

    /// Local storage URL, or `none` (overrides POLL_STORAGE_URL)
    #[arg(long, global = true)]
    pub storage: Option<String>,

    #[command(subcommand)]
    pub command: PollCommand,
}

#[derive(Debug, Subcommand)]
pub enum PollCommand {
    /// Show the current results once
    Results,
    /// Vote for an option; voting for your current choice again cancels it
    Vote {
        option_id: i64,
    },
    /// Follow results as they change until interrupted
    Watch,
}

impl Cli {
    pub fn resolve_config(&self, mut config: ClientConfig) -> ClientConfig {
        if let Some(base) = &self.api_base {
            config = config.with_api_base(base);
        }
        if let Some(base) = &self.ws_base {
            config = config.with_ws_base(base);
        }
        if let Some(storage) = &self.storage {
            config = config.with_storage(storage);
        }
        config
    }
}

pub async fn run(cli: Cli) -> PollResult<()> {
    let config = cli.resolve_config(ClientConfig::from_env()?);

    let api = Arc::new(HttpPollApi::new(config.clone())?);
    let store = VoterStore::open(config.storage_url.as_deref()).await?;
    let session = Arc::new(VoteSession::new(api, store));

    session.load().await?;

    let refresher = config
        .refresh_interval
        .map(|every| spawn_refresh_task(Arc::clone(&session), every));

    let outcome = match cli.command {
        PollCommand::Results => results::handle_results(&session),
        PollCommand::Vote { option_id } => vote::handle_vote(&session, option_id).await,
        PollCommand::Watch => results::handle_watch(Arc::clone(&session), &config).await,
    };

    session.shutdown();
    if let Some(task) = refresher {
        task.abort();
    }
    outcome
}
