use crate::config::ClientConfig;
use crate::error::{PollError, PollResult};
use crate::models::{AggregateResults, Poll, VoteRecord, VoteRequest};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

/// REST surface of the poll server.
#[async_trait]
pub trait PollApi: Send + Sync {
    async fn get_poll(&self, poll_id: i64) -> PollResult<Poll>;
    /// Results of whichever poll the server considers current.
    async fn get_results(&self) -> PollResult<AggregateResults>;
    async fn post_vote(&self, poll_id: i64, request: &VoteRequest) -> PollResult<VoteRecord>;
}

pub struct HttpPollApi {
    client: Client,
    config: ClientConfig,
}

impl HttpPollApi {
    pub fn new(config: ClientConfig) -> PollResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PollError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn fetch_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> PollResult<T> {
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PollError::Network(if message.trim().is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                message
            }));
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl PollApi for HttpPollApi {
    async fn get_poll(&self, poll_id: i64) -> PollResult<Poll> {
        let url = self.config.api_url(&format!("/polls/{}", poll_id));
        debug!("GET {}", url);
        self.fetch_json(self.client.get(url)).await
    }

    async fn get_results(&self) -> PollResult<AggregateResults> {
        let url = self.config.api_url("/polls/results");
        debug!("GET {}", url);
        self.fetch_json(self.client.get(url)).await
    }

    async fn post_vote(&self, poll_id: i64, request: &VoteRequest) -> PollResult<VoteRecord> {
        let url = self.config.api_url(&format!("/polls/{}/votes", poll_id));
        debug!("POST {} option={}", url, request.option_id);
        self.fetch_json(self.client.post(url).json(request)).await
    }
}
