use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::{PollError, PollResult};
use crate::models::{AggregateResults, PushFrame};
use crate::session::VoteSession;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What became of one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Applied,
    /// A results update the session declined (torn down, or older than what it holds).
    Discarded,
    /// Any frame type other than a results update.
    Ignored,
}

/// Non-fatal problem on the live channel, kept for display.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Decodes a text frame. `Ok(None)` for frame types the client does not act on.
pub fn decode_frame(text: &str) -> PollResult<Option<AggregateResults>> {
    let frame: PushFrame = serde_json::from_str(text)
        .map_err(|e| PollError::PushChannel(format!("Malformed frame: {}", e)))?;
    if !frame.is_results_update() {
        return Ok(None);
    }

    let results = frame.into_results().ok_or_else(|| {
        PollError::PushChannel("Results update is missing pollId, totalVotes or results".to_string())
    })?;
    if !results.is_consistent() {
        return Err(PollError::PushChannel(format!(
            "Results update for poll {} totals {} but options sum to {}",
            results.poll_id,
            results.total_votes,
            results.counted_votes()
        )));
    }
    Ok(Some(results))
}

/// Feeds one frame into the session. Errors are returned, never raised.
pub fn handle_frame(session: &VoteSession, text: &str) -> PollResult<FrameOutcome> {
    match decode_frame(text)? {
        None => Ok(FrameOutcome::Ignored),
        Some(results) => {
            if session.apply_pushed_results(results) {
                Ok(FrameOutcome::Applied)
            } else {
                Ok(FrameOutcome::Discarded)
            }
        }
    }
}

struct ListenerStatus {
    state_tx: watch::Sender<ConnectionState>,
    diagnostic: Mutex<Option<Diagnostic>>,
}

impl ListenerStatus {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn record(&self, error: &PollError) {
        warn!("{}", error);
        *self.diagnostic.lock().unwrap_or_else(|e| e.into_inner()) = Some(Diagnostic {
            at: Utc::now(),
            message: error.to_string(),
        });
    }
}

/// Keeps a live connection open for whichever poll the session has loaded.
///
/// The connection is reopened when the poll id changes and, after a close or
/// error, with exponential backoff. Problems end up in `last_diagnostic`
/// and never reach the session's error slot.
pub struct PushListener {
    status: Arc<ListenerStatus>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PushListener {
    pub fn spawn(session: Arc<VoteSession>, config: &ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let status = Arc::new(ListenerStatus {
            state_tx,
            diagnostic: Mutex::new(None),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            session,
            config.clone(),
            Arc::clone(&status),
            shutdown_rx,
        ));

        Self {
            status,
            shutdown_tx,
            task: Some(task),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.status.state_tx.subscribe()
    }

    pub fn last_diagnostic(&self) -> Option<Diagnostic> {
        self.status
            .diagnostic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Closes the connection and waits for the listener task to finish.
    pub async fn shutdown(mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Live channel task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for PushListener {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

async fn run(
    session: Arc<VoteSession>,
    config: ClientConfig,
    status: Arc<ListenerStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let policy: ReconnectPolicy = config.reconnect;
    let mut poll_ids = session.subscribe_poll_id();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let current = *poll_ids.borrow_and_update();
        let Some(poll_id) = current else {
            // Nothing loaded yet
            tokio::select! {
                changed = poll_ids.changed() => if changed.is_err() { break },
                _ = shutdown.changed() => break,
            }
            continue;
        };

        let url = config.ws_url(poll_id);
        let mut connected = false;
        status.set_state(ConnectionState::Connecting);

        let outcome = tokio::select! {
            outcome = listen(&session, &status, &url, &mut connected) => outcome,
            changed = poll_ids.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("Poll changed; reopening live channel");
                status.set_state(ConnectionState::Disconnected);
                attempt = 0;
                continue;
            }
            _ = shutdown.changed() => break,
        };
        status.set_state(ConnectionState::Disconnected);

        match outcome {
            Ok(()) => info!("Live channel for poll {} closed", poll_id),
            Err(e) => status.record(&e),
        }
        if connected {
            attempt = 0;
        }

        if !policy.allows(attempt) {
            warn!(
                "Giving up on live channel for poll {} after {} attempts",
                poll_id, attempt
            );
            tokio::select! {
                changed = poll_ids.changed() => if changed.is_err() { break },
                _ = shutdown.changed() => break,
            }
            attempt = 0;
            continue;
        }

        let delay = policy.delay_for(attempt);
        attempt += 1;
        debug!("Reconnecting to {} in {:?} (attempt {})", url, delay, attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = poll_ids.changed() => {
                if changed.is_err() {
                    break;
                }
                attempt = 0;
            }
            _ = shutdown.changed() => break,
        }
    }

    status.set_state(ConnectionState::Disconnected);
    debug!("Live channel listener stopped");
}

async fn listen(
    session: &VoteSession,
    status: &ListenerStatus,
    url: &str,
    connected: &mut bool,
) -> PollResult<()> {
    let (mut stream, _) = connect_async(url).await?;
    *connected = true;
    status.set_state(ConnectionState::Connected);
    info!("Live channel connected: {}", url);

    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => match handle_frame(session, &text) {
                Ok(outcome) => debug!("Live frame: {:?}", outcome),
                Err(e) => status.record(&e),
            },
            Message::Close(frame) => {
                debug!("Live channel close frame: {:?}", frame);
                return Ok(());
            }
            _ => {}
        }
    }
    Ok(())
}
