use std::time::Duration;

use gridclaim_shared::{RankingEntry, RawCell, WorldRect};
use tracing::warn;

use crate::error::FetchError;
use crate::fetch::{FetchFuture, RangeSource};

const USER_AGENT: &str = "gridclaim-viewer/0.1";
const CONNECT_TIMEOUT_SECS: u64 = 5;
const RANKING_TIMEOUT_SECS: u64 = 10;
const BODY_PREVIEW_CHARS: usize = 200;

/// Build the shared HTTP client. Per-request timeouts are applied by callers,
/// since the live event stream stays open indefinitely.
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to build configured HTTP client, using defaults");
            reqwest::Client::new()
        })
}

/// Range queries against `GET /api/cells/chunk`.
#[derive(Clone)]
pub struct HttpRangeSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRangeSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub async fn fetch(&self, rect: WorldRect) -> Result<Vec<RawCell>, FetchError> {
        let url = format!("{}/api/cells/chunk", self.base_url);
        let resp = self
            .client
            .get(url)
            .query(&[
                ("minX", rect.min_x.floor() as i64),
                ("minY", rect.min_y.floor() as i64),
                ("maxX", rect.max_x.ceil() as i64),
                ("maxY", rect.max_y.ceil() as i64),
            ])
            .send()
            .await?;
        decode_json(resp).await
    }
}

impl RangeSource for HttpRangeSource {
    fn fetch_range<'a>(&'a self, rect: WorldRect) -> FetchFuture<'a> {
        Box::pin(self.fetch(rect))
    }
}

/// Server-side group ranking from `GET /api/ranking`.
pub async fn fetch_ranking(
    client: &reqwest::Client,
    base_url: &str,
) -> Result<Vec<RankingEntry>, FetchError> {
    let resp = client
        .get(format!("{base_url}/api/ranking"))
        .timeout(Duration::from_secs(RANKING_TIMEOUT_SECS))
        .send()
        .await?;
    decode_json(resp).await
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, FetchError> {
    let status = resp.status();
    let bytes = resp.bytes().await?;
    if !status.is_success() {
        return Err(FetchError::Status(status.as_u16()));
    }
    serde_json::from_slice(&bytes).map_err(|e| {
        let preview = String::from_utf8_lossy(&bytes)
            .chars()
            .take(BODY_PREVIEW_CHARS)
            .collect::<String>();
        FetchError::Decode(format!("{e}; body preview: {preview}"))
    })
}
