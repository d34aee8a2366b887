use crate::config::ClientConfig;
use crate::error::PollResult;
use crate::push::{ConnectionState, PushListener};
use crate::session::{SessionSnapshot, VoteSession};
use crate::voting::summarize;
use log::info;
use std::sync::Arc;

const BAR_WIDTH: f64 = 30.0;

fn print_snapshot(snapshot: &SessionSnapshot) {
    if snapshot.is_loading {
        println!("Loading poll...");
        return;
    }
    if let Some(poll) = &snapshot.poll {
        println!("{}", poll.title);
        if !poll.description.is_empty() {
            println!("{}", poll.description);
        }
        println!();
    }

    match &snapshot.results {
        Some(results) => {
            let summary = summarize(results, snapshot.last_voted_option_id);
            for share in &summary.shares {
                let filled = (share.percent / 100.0 * BAR_WIDTH).round() as usize;
                println!("{:>12} |{:<30}| {}%", share.label, "#".repeat(filled), share.percent);
            }
            println!();
            println!("{}", summary.summary);
        }
        None => println!("No results yet."),
    }

    if snapshot.last_voted_option_id.is_some() {
        println!("You already voted. Voting again changes or cancels your vote.");
    }
    if let Some(error) = &snapshot.error {
        println!("(last refresh failed: {})", error);
    }
}

pub fn handle_results(session: &VoteSession) -> PollResult<()> {
    print_snapshot(&session.snapshot());
    Ok(())
}

pub async fn handle_watch(session: Arc<VoteSession>, config: &ClientConfig) -> PollResult<()> {
    let push = PushListener::spawn(Arc::clone(&session), config);
    let mut updates = session.subscribe_results();
    let mut live_state = push.subscribe_state();

    print_snapshot(&session.snapshot());
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("----");
                print_snapshot(&session.snapshot());
            }
            changed = live_state.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *live_state.borrow_and_update();
                match (state, push.last_diagnostic()) {
                    (ConnectionState::Disconnected, Some(diagnostic)) => println!(
                        "(live updates paused at {}: {})",
                        diagnostic.at.format("%H:%M:%S"),
                        diagnostic.message
                    ),
                    (state, _) => info!("Live channel {:?}", state),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; closing live channel");
                break;
            }
        }
    }

    push.shutdown().await;
    Ok(())
}
