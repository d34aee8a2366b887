use crate::session::VoteSession;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Refreshes results on a fixed interval until the session is shut down.
/// A failed refresh is logged and left in the session's error slot; the
/// next tick tries again.
pub fn spawn_refresh_task(session: Arc<VoteSession>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting background results refresh every {:?}", every);
        let mut interval = interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately and the caller has just loaded
        interval.tick().await;

        loop {
            interval.tick().await;
            if !session.is_alive() {
                break;
            }
            match session.refresh_results().await {
                Ok(results) => debug!(
                    "Background refresh for poll {}: {} votes",
                    results.poll_id, results.total_votes
                ),
                Err(e) => error!("Background refresh failed: {}", e),
            }
        }
        info!("Background results refresh stopped");
    })
}
