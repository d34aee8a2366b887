use crate::error::PollResult;
use crate::models::VoteAction;
use crate::session::VoteSession;
use crate::voting::summarize;
use log::warn;

pub async fn handle_vote(session: &VoteSession, option_id: i64) -> PollResult<()> {
    let snapshot = session.snapshot();
    if let Some(poll) = &snapshot.poll {
        if poll.option(option_id).is_none() {
            warn!("Option {} is not part of poll {}", option_id, poll.id);
        }
    }

    let record = match session.vote(option_id).await {
        Ok(record) => record,
        Err(e) => {
            // A vote that went through but could not be followed by a refresh
            // is still recorded locally
            let after = session.snapshot();
            if after.last_voted_option_id != snapshot.last_voted_option_id {
                println!("Your vote was recorded, but results could not be refreshed.");
            }
            return Err(e);
        }
    };

    let label = snapshot
        .poll
        .as_ref()
        .and_then(|poll| poll.option(record.option_id))
        .map(|option| option.label.clone())
        .unwrap_or_else(|| format!("option {}", record.option_id));

    match record.action {
        VoteAction::Created => println!("Voted for {} (vote #{}).", label, record.vote_id),
        VoteAction::Updated => println!("Changed your vote to {}.", label),
        VoteAction::Canceled => println!("Canceled your vote for {}.", label),
    }

    let after = session.snapshot();
    if let Some(results) = &after.results {
        println!();
        println!("{}", summarize(results, after.last_voted_option_id).summary);
    }
    Ok(())
}
