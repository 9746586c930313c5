//! Authenticated REST client for the contract exchange.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::auth::RequestSigner;
use crate::models::Market;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_LIMIT: &str = "200";

#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection failures, timeouts and 5xx responses. Recoverable by retry.
    #[error("transient http error: {0}")]
    Transient(String),

    /// 401/403 — credentials rejected.
    #[error("auth rejected ({status}): {body}")]
    AuthRejected { status: u16, body: String },

    /// Anything else: unexpected status or an unparseable body.
    #[error("decode error: {0}")]
    Decode(String),
}

pub struct ExchangeClient {
    http: reqwest::Client,
    signer: Arc<RequestSigner>,
    base_url: String,
    /// Path prefix of the base URL, included in signed paths.
    sign_prefix: String,
}

impl ExchangeClient {
    pub fn new(base_url: &str, signer: Arc<RequestSigner>) -> anyhow::Result<Self> {
        let parsed = reqwest::Url::parse(base_url)?;
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            signer,
            base_url: base_url.trim_end_matches('/').to_string(),
            sign_prefix: parsed.path().trim_end_matches('/').to_string(),
        })
    }

    /// All markets in a series with the given status, following pagination
    /// cursors until the server stops returning one.
    pub async fn markets(&self, series: &str, status: &str) -> Result<Vec<Market>, ClientError> {
        #[derive(Deserialize)]
        struct Resp {
            #[serde(default)]
            markets: Vec<Market>,
            #[serde(default)]
            cursor: String,
        }

        let mut all = Vec::new();
        let mut cursor = String::new();

        loop {
            let mut query: Vec<(&str, String)> = vec![("limit", PAGE_LIMIT.to_string())];
            if !series.is_empty() {
                query.push(("series_ticker", series.to_string()));
            }
            if !status.is_empty() {
                query.push(("status", status.to_string()));
            }
            if !cursor.is_empty() {
                query.push(("cursor", cursor.clone()));
            }

            let page: Resp = self.get("/markets", &query).await?;
            let count = page.markets.len();
            all.extend(page.markets);

            if page.cursor.is_empty() || count == 0 {
                return Ok(all);
            }
            cursor = page.cursor;
        }
    }

    pub async fn market(&self, ticker: &str) -> Result<Market, ClientError> {
        #[derive(Deserialize)]
        struct Resp {
            market: Market,
        }
        let resp: Resp = self.get(&format!("/markets/{}", ticker), &[]).await?;
        Ok(resp.market)
    }

    /// Cash balance in cents. Used only for the startup readiness probe.
    pub async fn balance(&self) -> Result<i64, ClientError> {
        #[derive(Deserialize)]
        struct Resp {
            balance: i64,
        }
        let resp: Resp = self.get("/portfolio/balance", &[]).await?;
        Ok(resp.balance)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "exchange request");

        let sign_path = format!("{}{}", self.sign_prefix, path);
        let headers = self
            .signer
            .headers("GET", &sign_path)
            .map_err(|e| ClientError::Decode(format!("signing failed: {e:#}")))?;

        let mut req = self.http.get(&url).query(query);
        for (k, v) in headers {
            req = req.header(k, v);
        }

        let resp = req.send().await.map_err(|e| {
            ClientError::Transient(format!("request failed: {e}"))
        })?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::AuthRejected {
                status: status.as_u16(),
                body,
            });
        }
        if status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Transient(format!(
                "server error {}: {}",
                status, body
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Decode(format!(
                "unexpected status {}: {}",
                status, body
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|e| ClientError::Decode(format!("decoding response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;

    fn test_client() -> ExchangeClient {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let signer = Arc::new(RequestSigner::new("k", key));
        ExchangeClient::new("https://api.elections.kalshi.com/trade-api/v2", signer).unwrap()
    }

    #[test]
    fn test_sign_prefix_from_base_url() {
        let client = test_client();
        assert_eq!(client.sign_prefix, "/trade-api/v2");
    }

    #[test]
    fn test_error_variants_display() {
        let e = ClientError::AuthRejected {
            status: 401,
            body: "unauthorized".to_string(),
        };
        assert!(e.to_string().contains("401"));

        let e = ClientError::Transient("timeout".to_string());
        assert!(e.to_string().contains("transient"));
    }
}
