use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub options: Vec<PollOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub id: i64,
    pub label: String,
}

impl Poll {
    pub fn option(&self, option_id: i64) -> Option<&PollOption> {
        self.options.iter().find(|option| option.id == option_id)
    }
}

// Aggregate counts for one poll, always replaced as a whole on the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResults {
    pub poll_id: i64,
    pub total_votes: u64,
    pub results: Vec<ResultItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItem {
    pub option_id: i64,
    pub label: String,
    pub count: u64,
}

impl AggregateResults {
    /// Sum of the per-option counts.
    pub fn counted_votes(&self) -> u64 {
        self.results.iter().map(|item| item.count).sum()
    }

    /// `total_votes` agrees with the per-option counts.
    pub fn is_consistent(&self) -> bool {
        self.total_votes == self.counted_votes()
    }

    /// Every option referenced by the results exists in `poll`.
    pub fn matches_poll(&self, poll: &Poll) -> bool {
        self.poll_id == poll.id
            && self
                .results
                .iter()
                .all(|item| poll.option(item.option_id).is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteAction {
    Created,
    Updated,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub option_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voter_token: Option<String>,
}

impl VoteRequest {
    // An empty token is treated the same as no token at all
    pub fn new(option_id: i64, voter_token: Option<&str>) -> Self {
        Self {
            option_id,
            voter_token: voter_token
                .filter(|token| !token.is_empty())
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    pub vote_id: i64,
    pub poll_id: i64,
    pub option_id: i64,
    pub voter_token: String,
    pub action: VoteAction,
}

impl VoteRecord {
    /// The voter's selection after this submission; a cancel clears it.
    pub fn selected_option(&self) -> Option<i64> {
        match self.action {
            VoteAction::Canceled => None,
            VoteAction::Created | VoteAction::Updated => Some(self.option_id),
        }
    }
}

/// Local belief about this voter for one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalSelection {
    pub voter_token: Option<String>,
    pub last_voted_option_id: Option<i64>,
}

pub const RESULTS_UPDATED: &str = "poll_results_updated";

/// Inbound frame on the live channel. Only the type tag is required; the
/// payload fields are checked once the tag is known to be a results update.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub poll_id: Option<i64>,
    pub total_votes: Option<u64>,
    pub results: Option<Vec<ResultItem>>,
}

impl PushFrame {
    pub fn is_results_update(&self) -> bool {
        self.kind == RESULTS_UPDATED
    }

    pub fn into_results(self) -> Option<AggregateResults> {
        Some(AggregateResults {
            poll_id: self.poll_id?,
            total_votes: self.total_votes?,
            results: self.results?,
        })
    }
}
