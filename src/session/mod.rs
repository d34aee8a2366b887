use crate::api::PollApi;
use crate::db::VoterStore;
use crate::error::{PollError, PollResult};
use crate::models::{AggregateResults, LocalSelection, Poll, VoteRecord, VoteRequest};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

/// Read-only view of the session handed to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub poll: Option<Poll>,
    pub results: Option<AggregateResults>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub voter_token: Option<String>,
    pub last_voted_option_id: Option<i64>,
}

struct SessionState {
    view: SessionSnapshot,
    // Ticket of the write currently held in the results slot
    results_revision: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            view: SessionSnapshot {
                is_loading: true,
                ..SessionSnapshot::default()
            },
            results_revision: 0,
        }
    }
}

/// Owns the poll, its aggregate results and this voter's identity.
///
/// Only `refresh_results` and `vote` change the poll or the voter state.
/// Results may additionally be replaced by the live channel through
/// `apply_pushed_results`. Every results write carries a ticket taken when
/// the write originates; a write older than the one already applied is
/// dropped, so a refresh issued before a push arrived cannot overwrite it.
pub struct VoteSession {
    api: Arc<dyn PollApi>,
    store: VoterStore,
    state: RwLock<SessionState>,
    revision: AtomicU64,
    alive: AtomicBool,
    poll_id_tx: watch::Sender<Option<i64>>,
    results_tx: watch::Sender<Option<AggregateResults>>,
}

impl VoteSession {
    pub fn new(api: Arc<dyn PollApi>, store: VoterStore) -> Self {
        let (poll_id_tx, _) = watch::channel(None);
        let (results_tx, _) = watch::channel(None);
        Self {
            api,
            store,
            state: RwLock::new(SessionState::new()),
            revision: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            poll_id_tx,
            results_tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.read().view.clone()
    }

    /// Notified whenever a different poll becomes the loaded one.
    pub fn subscribe_poll_id(&self) -> watch::Receiver<Option<i64>> {
        self.poll_id_tx.subscribe()
    }

    /// Notified whenever the results slot is replaced.
    pub fn subscribe_results(&self) -> watch::Receiver<Option<AggregateResults>> {
        self.results_tx.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Marks the session as torn down. Fetches still in flight complete but
    /// no longer touch the state.
    pub fn shutdown(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            info!("Vote session shut down");
        }
    }

    /// Initial load: like `refresh_results`, with the loading flag raised
    /// for its duration.
    pub async fn load(&self) -> PollResult<AggregateResults> {
        if self.is_alive() {
            self.write().view.is_loading = true;
        }
        let outcome = self.refresh_results().await;
        if self.is_alive() {
            self.write().view.is_loading = false;
        }
        outcome
    }

    /// Fetches the current results, then the poll they belong to, then this
    /// voter's local markers for that poll, and commits all three at once.
    /// On failure nothing but the error slot changes.
    pub async fn refresh_results(&self) -> PollResult<AggregateResults> {
        if self.is_alive() {
            self.write().view.error = None;
        }
        let ticket = self.next_revision();

        match self.fetch_current(ticket).await {
            Ok(results) => Ok(results),
            Err(e) => {
                warn!("Failed to refresh poll results: {}", e);
                if self.is_alive() {
                    self.write().view.error = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn fetch_current(&self, ticket: u64) -> PollResult<AggregateResults> {
        let results = self.api.get_results().await?;
        if !results.is_consistent() {
            return Err(PollError::Network(format!(
                "Inconsistent results for poll {}: total {} but options sum to {}",
                results.poll_id,
                results.total_votes,
                results.counted_votes()
            )));
        }
        let poll = self.api.get_poll(results.poll_id).await?;
        if !results.matches_poll(&poll) {
            warn!("Results for poll {} reference options the poll does not list", poll.id);
        }
        let selection = self.store.hydrate(poll.id).await?;

        if !self.is_alive() {
            debug!("Discarding refresh for poll {} after shutdown", poll.id);
            return Ok(results);
        }
        self.commit_refresh(ticket, poll, results.clone(), selection);
        Ok(results)
    }

    fn commit_refresh(
        &self,
        ticket: u64,
        poll: Poll,
        results: AggregateResults,
        selection: Option<LocalSelection>,
    ) {
        let poll_id = poll.id;
        let results_applied = {
            let mut state = self.write();
            let same_poll = state.view.poll.as_ref().map(|p| p.id) == Some(poll_id);
            // Without a medium the in-memory markers stand, but only for their own poll
            let selection = selection.or_else(|| {
                if same_poll {
                    None
                } else {
                    Some(LocalSelection::default())
                }
            });
            state.view.poll = Some(poll);
            if let Some(selection) = selection {
                state.view.voter_token = selection.voter_token;
                state.view.last_voted_option_id = selection.last_voted_option_id;
            }
            if ticket > state.results_revision {
                state.results_revision = ticket;
                state.view.results = Some(results.clone());
                true
            } else {
                debug!(
                    "Refresh {} superseded by newer results {} for poll {}",
                    ticket, state.results_revision, poll_id
                );
                false
            }
        };

        self.poll_id_tx.send_if_modified(|current| {
            if *current == Some(poll_id) {
                false
            } else {
                *current = Some(poll_id);
                true
            }
        });
        if results_applied {
            self.results_tx.send_replace(Some(results));
        }
    }

    /// Replaces the results slot with a frame from the live channel.
    /// Returns whether the frame was applied.
    pub fn apply_pushed_results(&self, results: AggregateResults) -> bool {
        if !self.is_alive() {
            return false;
        }
        let ticket = self.next_revision();
        {
            let mut state = self.write();
            if ticket <= state.results_revision {
                return false;
            }
            state.results_revision = ticket;
            state.view.results = Some(results.clone());
        }
        debug!(
            "Applied pushed results for poll {} (total {})",
            results.poll_id, results.total_votes
        );
        self.results_tx.send_replace(Some(results));
        true
    }

    /// Submits a vote for the loaded poll. The server decides whether this
    /// creates, changes or cancels the voter's ballot; the local selection
    /// follows the returned action. The token and selection are stored
    /// before results are refreshed, so a failing refresh does not undo them.
    pub async fn vote(&self, option_id: i64) -> PollResult<VoteRecord> {
        let (poll_id, voter_token) = {
            let state = self.read();
            let poll = state.view.poll.as_ref().ok_or_else(|| {
                PollError::InvalidState("No active poll is loaded".to_string())
            })?;
            (poll.id, state.view.voter_token.clone())
        };

        let request = VoteRequest::new(option_id, voter_token.as_deref());
        let record = self.api.post_vote(poll_id, &request).await?;
        let selection = record.selected_option();
        info!(
            "Vote on poll {} for option {}: {:?}",
            poll_id, record.option_id, record.action
        );

        let issued_token = Some(record.voter_token.as_str()).filter(|token| !token.is_empty());
        if self.is_alive() {
            let mut state = self.write();
            if let Some(token) = issued_token {
                state.view.voter_token = Some(token.to_string());
            }
            state.view.last_voted_option_id = selection;
        }
        self.store.persist(poll_id, issued_token, selection).await?;

        self.refresh_results().await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LocalStorage, MemoryStorage};
    use crate::models::{PollOption, ResultItem, VoteAction};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Ledger {
        counts: HashMap<i64, u64>,
        ballots: HashMap<String, i64>,
        issued_tokens: Vec<String>,
        requests: Vec<VoteRequest>,
        next_vote_id: i64,
    }

    /// Server double that applies create/update/cancel the way the real one does.
    struct FakeServer {
        poll: Poll,
        ledger: Mutex<Ledger>,
        fail_results: AtomicBool,
        fail_votes: AtomicBool,
    }

    impl FakeServer {
        fn new(counts: &[(i64, u64)], tokens: &[&str]) -> Arc<Self> {
            let poll = Poll {
                id: 1,
                title: "Noodle battle".into(),
                description: "Pick your lunch".into(),
                options: vec![
                    PollOption { id: 1, label: "A".into() },
                    PollOption { id: 2, label: "B".into() },
                ],
            };
            let ledger = Ledger {
                counts: counts.iter().copied().collect(),
                issued_tokens: tokens.iter().rev().map(|t| t.to_string()).collect(),
                next_vote_id: 9,
                ..Ledger::default()
            };
            Arc::new(Self {
                poll,
                ledger: Mutex::new(ledger),
                fail_results: AtomicBool::new(false),
                fail_votes: AtomicBool::new(false),
            })
        }

        fn requests(&self) -> Vec<VoteRequest> {
            self.ledger.lock().unwrap().requests.clone()
        }
    }

    #[async_trait]
    impl PollApi for FakeServer {
        async fn get_poll(&self, poll_id: i64) -> PollResult<Poll> {
            if poll_id == self.poll.id {
                Ok(self.poll.clone())
            } else {
                Err(PollError::Network("HTTP 404".into()))
            }
        }

        async fn get_results(&self) -> PollResult<AggregateResults> {
            if self.fail_results.load(Ordering::SeqCst) {
                return Err(PollError::Network("results unavailable".into()));
            }
            let ledger = self.ledger.lock().unwrap();
            let results: Vec<ResultItem> = self
                .poll
                .options
                .iter()
                .map(|option| ResultItem {
                    option_id: option.id,
                    label: option.label.clone(),
                    count: ledger.counts.get(&option.id).copied().unwrap_or(0),
                })
                .collect();
            Ok(AggregateResults {
                poll_id: self.poll.id,
                total_votes: results.iter().map(|item| item.count).sum(),
                results,
            })
        }

        async fn post_vote(&self, poll_id: i64, request: &VoteRequest) -> PollResult<VoteRecord> {
            if self.fail_votes.load(Ordering::SeqCst) {
                return Err(PollError::Network("HTTP 500".into()));
            }
            let mut ledger = self.ledger.lock().unwrap();
            ledger.requests.push(request.clone());
            let token = match &request.voter_token {
                Some(token) => token.clone(),
                None => ledger.issued_tokens.pop().unwrap_or_else(|| "tok-fallback".into()),
            };

            let action = match ledger.ballots.get(&token).copied() {
                None => {
                    *ledger.counts.entry(request.option_id).or_insert(0) += 1;
                    ledger.ballots.insert(token.clone(), request.option_id);
                    VoteAction::Created
                }
                Some(previous) if previous == request.option_id => {
                    *ledger.counts.entry(previous).or_insert(1) -= 1;
                    ledger.ballots.remove(&token);
                    VoteAction::Canceled
                }
                Some(previous) => {
                    *ledger.counts.entry(previous).or_insert(1) -= 1;
                    *ledger.counts.entry(request.option_id).or_insert(0) += 1;
                    ledger.ballots.insert(token.clone(), request.option_id);
                    VoteAction::Updated
                }
            };

            let vote_id = ledger.next_vote_id;
            ledger.next_vote_id += 1;
            Ok(VoteRecord {
                vote_id,
                poll_id,
                option_id: request.option_id,
                voter_token: token,
                action,
            })
        }
    }

    fn session_with(server: Arc<FakeServer>) -> (VoteSession, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let session = VoteSession::new(server, VoterStore::new(storage.clone()));
        (session, storage)
    }

    #[tokio::test]
    async fn loading_until_first_load() {
        let server = FakeServer::new(&[], &[]);
        let (session, _) = session_with(server);
        assert!(session.snapshot().is_loading);

        session.load().await.unwrap();
        assert!(!session.snapshot().is_loading);
    }

    #[tokio::test]
    async fn fresh_load_has_no_selection() {
        let server = FakeServer::new(&[(1, 142), (2, 128)], &[]);
        let (session, _) = session_with(server);

        let results = session.load().await.unwrap();
        assert_eq!(results.total_votes, 270);
        assert!(results.is_consistent());

        let snapshot = session.snapshot();
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.poll.as_ref().map(|p| p.id), Some(1));
        assert_eq!(snapshot.voter_token, None);
        assert_eq!(snapshot.last_voted_option_id, None);
        assert_eq!(*session.subscribe_poll_id().borrow(), Some(1));
    }

    #[tokio::test]
    async fn vote_before_load_is_invalid_state() {
        let server = FakeServer::new(&[], &[]);
        let (session, _) = session_with(server.clone());

        let err = session.vote(1).await.unwrap_err();
        assert!(matches!(err, PollError::InvalidState(_)));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn first_vote_stores_token_and_selection() {
        let server = FakeServer::new(&[(1, 142), (2, 128)], &["tok-abc"]);
        let (session, storage) = session_with(server.clone());
        session.load().await.unwrap();

        let record = session.vote(2).await.unwrap();
        assert_eq!(record.action, VoteAction::Created);
        assert_eq!(record.vote_id, 9);

        assert_eq!(storage.get_item("voterToken:1").await.unwrap().as_deref(), Some("tok-abc"));
        assert_eq!(storage.get_item("votedOptionId:1").await.unwrap().as_deref(), Some("2"));
        assert_eq!(server.requests()[0].voter_token, None);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.voter_token.as_deref(), Some("tok-abc"));
        assert_eq!(snapshot.last_voted_option_id, Some(2));
        assert_eq!(snapshot.results.map(|r| r.total_votes), Some(271));
    }

    #[tokio::test]
    async fn same_option_twice_cancels() {
        let server = FakeServer::new(&[(1, 142), (2, 128)], &["tok-abc"]);
        let (session, storage) = session_with(server.clone());
        session.load().await.unwrap();

        session.vote(2).await.unwrap();
        let record = session.vote(2).await.unwrap();
        assert_eq!(record.action, VoteAction::Canceled);

        assert_eq!(server.requests()[1].voter_token.as_deref(), Some("tok-abc"));
        assert_eq!(storage.get_item("votedOptionId:1").await.unwrap(), None);
        assert_eq!(storage.get_item("voterToken:1").await.unwrap().as_deref(), Some("tok-abc"));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.last_voted_option_id, None);
        assert_eq!(snapshot.results.map(|r| r.total_votes), Some(270));
    }

    #[tokio::test]
    async fn different_option_updates() {
        let server = FakeServer::new(&[], &["tok-abc"]);
        let (session, _) = session_with(server);
        session.load().await.unwrap();

        session.vote(1).await.unwrap();
        let record = session.vote(2).await.unwrap();
        assert_eq!(record.action, VoteAction::Updated);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.last_voted_option_id, Some(2));
        let results = snapshot.results.unwrap();
        assert_eq!(results.total_votes, 1);
        assert_eq!(results.results[1].count, 1);
    }

    #[tokio::test]
    async fn token_is_kept_in_memory_without_storage() {
        let server = FakeServer::new(&[(1, 142), (2, 128)], &["tok-abc"]);
        let session = VoteSession::new(server.clone(), VoterStore::unavailable());
        session.load().await.unwrap();

        assert_eq!(session.vote(2).await.unwrap().action, VoteAction::Created);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.voter_token.as_deref(), Some("tok-abc"));
        assert_eq!(snapshot.last_voted_option_id, Some(2));

        assert_eq!(session.vote(2).await.unwrap().action, VoteAction::Canceled);
        assert_eq!(server.requests()[1].voter_token.as_deref(), Some("tok-abc"));
        assert_eq!(session.snapshot().last_voted_option_id, None);
        assert_eq!(session.snapshot().results.map(|r| r.total_votes), Some(270));
    }

    #[tokio::test]
    async fn empty_issued_token_is_not_kept() {
        let server = FakeServer::new(&[], &[""]);
        let (session, storage) = session_with(server.clone());
        session.load().await.unwrap();

        let record = session.vote(1).await.unwrap();
        assert_eq!(record.voter_token, "");
        assert_eq!(session.snapshot().voter_token, None);
        assert_eq!(session.snapshot().last_voted_option_id, Some(1));
        assert_eq!(storage.get_item("voterToken:1").await.unwrap(), None);

        session.vote(2).await.unwrap();
        assert_eq!(server.requests()[1].voter_token, None);
    }

    #[tokio::test]
    async fn stored_markers_are_hydrated_on_load() {
        let server = FakeServer::new(&[(1, 1)], &[]);
        let (session, storage) = session_with(server.clone());
        storage.set_item("voterToken:1", "tok-old").await.unwrap();
        storage.set_item("votedOptionId:1", "1").await.unwrap();

        session.load().await.unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.voter_token.as_deref(), Some("tok-old"));
        assert_eq!(snapshot.last_voted_option_id, Some(1));

        session.vote(2).await.unwrap();
        assert_eq!(server.requests()[0].voter_token.as_deref(), Some("tok-old"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_state() {
        let server = FakeServer::new(&[(1, 3)], &[]);
        let (session, _) = session_with(server.clone());
        session.load().await.unwrap();
        let before = session.snapshot();

        server.fail_results.store(true, Ordering::SeqCst);
        let err = session.refresh_results().await.unwrap_err();
        assert_eq!(err, PollError::Network("results unavailable".into()));

        let after = session.snapshot();
        assert_eq!(after.poll, before.poll);
        assert_eq!(after.results, before.results);
        assert_eq!(after.error.as_deref(), Some("results unavailable"));

        server.fail_results.store(false, Ordering::SeqCst);
        session.refresh_results().await.unwrap();
        assert_eq!(session.snapshot().error, None);
    }

    #[tokio::test]
    async fn failed_initial_load_reports_error() {
        let server = FakeServer::new(&[], &[]);
        server.fail_results.store(true, Ordering::SeqCst);
        let (session, _) = session_with(server);

        assert!(session.load().await.is_err());
        let snapshot = session.snapshot();
        assert!(!snapshot.is_loading);
        assert!(snapshot.poll.is_none());
        assert_eq!(snapshot.error.as_deref(), Some("results unavailable"));
    }

    #[tokio::test]
    async fn refresh_failure_after_vote_keeps_vote() {
        let server = FakeServer::new(&[], &["tok-abc"]);
        let (session, storage) = session_with(server.clone());
        session.load().await.unwrap();

        server.fail_results.store(true, Ordering::SeqCst);
        assert!(session.vote(1).await.is_err());

        assert_eq!(storage.get_item("votedOptionId:1").await.unwrap().as_deref(), Some("1"));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.voter_token.as_deref(), Some("tok-abc"));
        assert_eq!(snapshot.last_voted_option_id, Some(1));
        assert!(snapshot.error.is_some());
    }

    #[tokio::test]
    async fn failed_submission_changes_nothing() {
        let server = FakeServer::new(&[], &["tok-abc"]);
        let (session, storage) = session_with(server.clone());
        session.load().await.unwrap();

        server.fail_votes.store(true, Ordering::SeqCst);
        assert_eq!(session.vote(1).await.unwrap_err(), PollError::Network("HTTP 500".into()));
        assert_eq!(storage.get_item("voterToken:1").await.unwrap(), None);
        assert_eq!(session.snapshot().last_voted_option_id, None);
    }

    #[tokio::test]
    async fn pushed_results_replace_slot() {
        let server = FakeServer::new(&[(1, 142), (2, 128)], &[]);
        let (session, _) = session_with(server);
        session.load().await.unwrap();
        let mut updates = session.subscribe_results();

        let pushed = AggregateResults {
            poll_id: 1,
            total_votes: 271,
            results: vec![
                ResultItem { option_id: 1, label: "A".into(), count: 143 },
                ResultItem { option_id: 2, label: "B".into(), count: 128 },
            ],
        };
        assert!(session.apply_pushed_results(pushed.clone()));
        assert_eq!(session.snapshot().results, Some(pushed.clone()));
        assert!(updates.has_changed().unwrap());
        assert_eq!(*updates.borrow_and_update(), Some(pushed));
    }

    #[tokio::test]
    async fn nothing_changes_after_shutdown() {
        let server = FakeServer::new(&[(1, 1)], &[]);
        let (session, _) = session_with(server);
        session.shutdown();

        session.load().await.unwrap();
        let snapshot = session.snapshot();
        assert!(snapshot.poll.is_none());
        assert!(snapshot.results.is_none());
        assert!(!session.apply_pushed_results(AggregateResults {
            poll_id: 1,
            total_votes: 0,
            results: vec![],
        }));
    }

    /// Holds `get_results` open until released so a push can land mid-refresh.
    struct GatedServer {
        inner: Arc<FakeServer>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PollApi for GatedServer {
        async fn get_poll(&self, poll_id: i64) -> PollResult<Poll> {
            self.inner.get_poll(poll_id).await
        }

        async fn get_results(&self) -> PollResult<AggregateResults> {
            let results = self.inner.get_results().await;
            self.entered.notify_one();
            self.release.notified().await;
            results
        }

        async fn post_vote(&self, poll_id: i64, request: &VoteRequest) -> PollResult<VoteRecord> {
            self.inner.post_vote(poll_id, request).await
        }
    }

    #[tokio::test]
    async fn older_refresh_does_not_overwrite_newer_push() {
        let server = Arc::new(GatedServer {
            inner: FakeServer::new(&[(1, 142), (2, 128)], &[]),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let session = Arc::new(VoteSession::new(server.clone(), VoterStore::unavailable()));

        let refreshing = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.refresh_results().await })
        };
        server.entered.notified().await;

        let pushed = AggregateResults {
            poll_id: 1,
            total_votes: 272,
            results: vec![
                ResultItem { option_id: 1, label: "A".into(), count: 144 },
                ResultItem { option_id: 2, label: "B".into(), count: 128 },
            ],
        };
        assert!(session.apply_pushed_results(pushed.clone()));
        server.release.notify_one();

        let fetched = refreshing.await.unwrap().unwrap();
        assert_eq!(fetched.total_votes, 270);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.results, Some(pushed));
        assert_eq!(snapshot.poll.map(|p| p.id), Some(1));
    }
}
