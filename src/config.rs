use crate::error::{PollError, PollResult};
use lazy_static::lazy_static;
use regex::Regex;
use std::env;
use std::time::Duration;

lazy_static! {
    static ref HTTP_SCHEME: Regex = Regex::new(r"^http").unwrap();
}

const DEFAULT_PAGE_ORIGIN: &str = "http://localhost:8080";
const DEFAULT_STORAGE_URL: &str = "sqlite:noodle_vote.db";
const DISABLED_STORAGE: &str = "none";

/// Client configuration, normally loaded from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base for REST calls, without trailing slash. Empty means "same origin".
    pub api_base: String,
    /// Base for the live channel, without trailing slash. Empty means derived.
    pub ws_base: String,
    /// Origin standing in for the page that hosts the client.
    pub page_origin: String,
    /// Where voter markers are kept. `None` disables local persistence.
    pub storage_url: Option<String>,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub refresh_interval: Option<Duration>,
}

/// Exponential backoff for reopening the live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given (zero-based) reconnect attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            ws_base: String::new(),
            page_origin: DEFAULT_PAGE_ORIGIN.to_string(),
            storage_url: Some(DEFAULT_STORAGE_URL.to_string()),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            refresh_interval: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// - `POLL_API_BASE_URL`: REST base, defaults to the page origin.
    /// - `POLL_WS_BASE_URL`: live channel base, defaults to the REST base with a `ws` scheme.
    /// - `POLL_PAGE_ORIGIN`: defaults to `http://localhost:8080`.
    /// - `POLL_STORAGE_URL`: defaults to `sqlite:noodle_vote.db`, `none` disables storage.
    /// - `POLL_REQUEST_TIMEOUT_SECS`, `POLL_RECONNECT_INITIAL_MS`, `POLL_RECONNECT_MAX_MS`,
    ///   `POLL_RECONNECT_MAX_ATTEMPTS`, `POLL_REFRESH_INTERVAL_SECS`.
    pub fn from_env() -> PollResult<Self> {
        let defaults = Self::default();

        let api_base = env::var("POLL_API_BASE_URL").unwrap_or_default();
        let ws_base = env::var("POLL_WS_BASE_URL").unwrap_or_default();
        let page_origin =
            env::var("POLL_PAGE_ORIGIN").unwrap_or_else(|_| DEFAULT_PAGE_ORIGIN.to_string());
        let storage_url =
            env::var("POLL_STORAGE_URL").unwrap_or_else(|_| DEFAULT_STORAGE_URL.to_string());

        let request_timeout = parse_var::<u64>("POLL_REQUEST_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);

        let reconnect = ReconnectPolicy {
            initial_delay: parse_var::<u64>("POLL_RECONNECT_INITIAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect.initial_delay),
            max_delay: parse_var::<u64>("POLL_RECONNECT_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect.max_delay),
            max_attempts: parse_var::<u32>("POLL_RECONNECT_MAX_ATTEMPTS")?,
        };

        let refresh_interval = parse_var::<u64>("POLL_REFRESH_INTERVAL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            request_timeout,
            reconnect,
            refresh_interval,
            ..defaults
        }
        .with_api_base(&api_base)
        .with_ws_base(&ws_base)
        .with_page_origin(&page_origin)
        .with_storage(&storage_url))
    }

    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = trim_base(base);
        self
    }

    pub fn with_ws_base(mut self, base: &str) -> Self {
        self.ws_base = trim_base(base);
        self
    }

    pub fn with_page_origin(mut self, origin: &str) -> Self {
        self.page_origin = trim_base(origin);
        self
    }

    /// `none` (or an empty value) turns local persistence off.
    pub fn with_storage(mut self, url: &str) -> Self {
        let url = url.trim();
        self.storage_url = if url.is_empty() || url.eq_ignore_ascii_case(DISABLED_STORAGE) {
            None
        } else {
            Some(url.to_string())
        };
        self
    }

    /// Base used for REST calls: the configured base, or the page origin.
    pub fn http_base(&self) -> &str {
        if self.api_base.is_empty() {
            &self.page_origin
        } else {
            &self.api_base
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.http_base(), path)
        } else {
            format!("{}/{}", self.http_base(), path)
        }
    }

    /// Live channel URL for one poll.
    pub fn ws_url(&self, poll_id: i64) -> String {
        let base = if self.ws_base.is_empty() {
            HTTP_SCHEME.replace(self.http_base(), "ws").into_owned()
        } else {
            self.ws_base.clone()
        };
        format!("{}/ws/polls/{}", base, poll_id)
    }
}

fn trim_base(base: &str) -> String {
    base.trim().trim_end_matches('/').to_string()
}

fn parse_var<T: std::str::FromStr>(name: &str) -> PollResult<Option<T>> {
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| PollError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
