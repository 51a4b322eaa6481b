//! Upstream HTTP fetcher.
//!
//! Stateless and cheap to clone (the inner `reqwest::Client` is an `Arc`);
//! the download pool shares one fetcher across all workers.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::MirrorError;

#[derive(Clone)]
pub struct RemoteFetcher {
    client: reqwest::Client,
}

impl RemoteFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// GET `url` and decode the JSON body into `T`. One attempt; any
    /// transport error or non-2xx status fails.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, MirrorError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MirrorError::FetchFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(MirrorError::FetchFailed {
                url: url.to_string(),
                reason: format!("upstream returned {status}"),
            });
        }

        resp.json::<T>().await.map_err(|e| MirrorError::FetchFailed {
            url: url.to_string(),
            reason: format!("invalid JSON body: {e}"),
        })
    }

    /// GET `url` with up to `1 + retries` attempts and no backoff. Each
    /// failure is logged; the last error is returned once the budget is
    /// exhausted.
    pub async fn fetch_json_retry<T: DeserializeOwned>(
        &self,
        url: &str,
        retries: u32,
    ) -> Result<T, MirrorError> {
        let mut last = MirrorError::FetchFailed {
            url: url.to_string(),
            reason: "no attempts made".to_string(),
        };

        for attempt in 0..=retries {
            match self.fetch_json(url).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(%url, attempt = attempt + 1, error = %e, "fetch attempt failed");
                    last = e;
                }
            }
        }

        Err(last)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize)]
    struct Probe {
        value: u32,
    }

    #[tokio::test]
    async fn decodes_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/probe.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": 7
            })))
            .mount(&server)
            .await;

        let fetcher = RemoteFetcher::new(reqwest::Client::new());
        let probe: Probe = fetcher
            .fetch_json(&format!("{}/probe.json", server.uri()))
            .await
            .unwrap();
        assert_eq!(probe.value, 7);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fetcher = RemoteFetcher::new(reqwest::Client::new());
        let result: Result<Probe, _> = fetcher
            .fetch_json(&format!("{}/gone.json", server.uri()))
            .await;
        assert!(matches!(result, Err(MirrorError::FetchFailed { .. })));
    }

    #[tokio::test]
    async fn retry_exhausts_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky.json"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = RemoteFetcher::new(reqwest::Client::new());
        let result: Result<Probe, _> = fetcher
            .fetch_json_retry(&format!("{}/flaky.json", server.uri()), 2)
            .await;
        assert!(result.is_err());
    }
}
