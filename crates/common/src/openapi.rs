use std::collections::HashMap;
use std::time::Duration;

use reqwest::{StatusCode, Url};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::types::{TokenId, TokenItem};

/// Error at the provider fetch boundary. Every failure here is transient
/// from the pipeline's point of view: the affected phase is skipped and the
/// last good state is retained.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("malformed provider response for {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// HTTP client for the remote token-data provider.
///
/// All requests share a per-request timeout, a flat rate-limit delay, and
/// bounded retries with exponential backoff.
pub struct OpenapiClient {
    api_url: String,
    http: reqwest::Client,
    rate_limit_delay: Duration,
    max_retries: u32,
    backoff_base: Duration,
}

#[derive(Debug, Deserialize)]
struct HistoryPriceRow {
    #[serde(default)]
    token_id: String,
    price: Option<Decimal>,
}

impl OpenapiClient {
    pub fn new(api_url: &str) -> Self {
        Self::new_with_settings(
            api_url,
            Duration::from_secs(15),
            Duration::from_millis(200),
            3,
            Duration::from_secs(1),
        )
    }

    pub fn new_with_settings(
        api_url: &str,
        request_timeout: Duration,
        rate_limit_delay: Duration,
        max_retries: u32,
        backoff_base: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("reqwest client construction must not fail");
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            http,
            rate_limit_delay,
            max_retries,
            backoff_base,
        }
    }

    pub fn token_list_url(&self, address: &str, chain: Option<&str>) -> String {
        let mut url = Url::parse(&format!("{}/v1/user/token_list", self.api_url))
            .expect("api_url must be a valid absolute URL");
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("id", address);
            if let Some(c) = chain {
                qp.append_pair("chain_id", c);
            }
            qp.append_pair("is_all", "false");
        }
        url.to_string()
    }

    pub fn history_token_list_url(&self, address: &str, time_at: i64) -> String {
        let mut url = Url::parse(&format!("{}/v1/user/history_token_list", self.api_url))
            .expect("api_url must be a valid absolute URL");
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("id", address);
            qp.append_pair("time_at", &time_at.to_string());
        }
        url.to_string()
    }

    /// All tokens currently held by `address`, optionally scoped to one chain.
    pub async fn fetch_token_list(
        &self,
        address: &str,
        chain: Option<&str>,
    ) -> Result<Vec<TokenItem>, ProviderError> {
        let url = self.token_list_url(address, chain);
        self.get_json(&url).await
    }

    /// Current metadata/price for specific token identities, regardless of
    /// balance. Used for zero-balance customized/blocked lookups.
    pub async fn fetch_tokens_by_ids(
        &self,
        address: &str,
        ids: &[TokenId],
    ) -> Result<Vec<TokenItem>, ProviderError> {
        let url = format!("{}/v1/user/specific_token_list", self.api_url);
        let uuids: Vec<String> = ids.iter().map(TokenId::as_query_param).collect();
        let body = serde_json::json!({ "id": address, "uuids": uuids });
        self.post_json(&url, &body).await
    }

    /// Token balances held by `address` as of `time_at` (unix seconds).
    pub async fn fetch_history_token_list(
        &self,
        address: &str,
        time_at: i64,
    ) -> Result<Vec<TokenItem>, ProviderError> {
        let url = self.history_token_list_url(address, time_at);
        self.get_json(&url).await
    }

    /// Historical unit prices for the given tokens on one chain, keyed by
    /// lowercased token id. Tokens the provider has no record for are simply
    /// absent from the map.
    pub async fn fetch_history_price_list(
        &self,
        chain: &str,
        token_ids: &[String],
        time_at: i64,
    ) -> Result<HashMap<String, Decimal>, ProviderError> {
        let url = format!("{}/v1/token/history_price_list", self.api_url);
        let body = serde_json::json!({
            "chain_id": chain,
            "token_ids": token_ids,
            "time_at": time_at,
        });
        let rows: Vec<HistoryPriceRow> = self.post_json(&url, &body).await?;
        Ok(rows
            .into_iter()
            .filter(|r| !r.token_id.is_empty())
            .filter_map(|r| r.price.map(|p| (r.token_id.to_ascii_lowercase(), p)))
            .collect())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, ProviderError> {
        self.request_json(url, None).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, ProviderError> {
        self.request_json(url, Some(body)).await
    }

    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, ProviderError> {
        let mut backoff = self.backoff_base;
        let mut attempt = 0;

        loop {
            tokio::time::sleep(self.rate_limit_delay).await;
            let start = std::time::Instant::now();
            let result = self.request_once(url, body).await;
            let ms = start.elapsed().as_secs_f64() * 1000.0;
            metrics::histogram!("portfolio_api_latency_ms").record(ms);
            metrics::counter!("portfolio_api_requests_total").increment(1);

            match result {
                Ok(text) => {
                    return serde_json::from_str(&text).map_err(|source| ProviderError::Decode {
                        url: url.to_string(),
                        source,
                    });
                }
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(url, attempt, error = %err, "provider request failed; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => {
                    metrics::counter!("portfolio_api_errors_total").increment(1);
                    return Err(err);
                }
            }
        }
    }

    async fn request_once(
        &self,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<String, ProviderError> {
        let request = match body {
            Some(json) => self.http.post(url).json(json),
            None => self.http.get(url),
        };
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                status,
                url: url.to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_constructs_token_list_url() {
        let client = OpenapiClient::new("https://openapi.debank.com/");
        let url = client.token_list_url("0xAbC123", Some("eth"));
        assert!(url.starts_with("https://openapi.debank.com/v1/user/token_list"));
        assert!(url.contains("id=0xAbC123"));
        assert!(url.contains("chain_id=eth"));
        assert!(url.contains("is_all=false"));
    }

    #[test]
    fn test_token_list_url_without_chain_filter() {
        let client = OpenapiClient::new("https://openapi.debank.com");
        let url = client.token_list_url("0xabc", None);
        assert!(!url.contains("chain_id"));
    }

    #[test]
    fn test_history_token_list_url() {
        let client = OpenapiClient::new("https://openapi.debank.com");
        let url = client.history_token_list_url("0xabc", 1700000000);
        assert!(url.contains("time_at=1700000000"));
    }

    #[test]
    fn test_parse_token_list_response() {
        let json = r#"[
            {"id":"0xa","chain":"eth","symbol":"AAA","amount":2.0,"price":10.0,"is_core":true},
            {"id":"0xb","chain":"bsc","symbol":"BBB","amount":"0.5","price":null,"is_core":false}
        ]"#;
        let tokens: Vec<TokenItem> = serde_json::from_str(json).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].chain, "eth");
        assert!(tokens[1].price.is_none());
    }

    #[test]
    fn test_parse_history_price_rows() {
        let json = r#"[{"token_id":"0xA","price":1.25},{"token_id":"0xb","price":null},{"price":3.0}]"#;
        let rows: Vec<HistoryPriceRow> = serde_json::from_str(json).unwrap();
        let dict: HashMap<String, Decimal> = rows
            .into_iter()
            .filter(|r| !r.token_id.is_empty())
            .filter_map(|r| r.price.map(|p| (r.token_id.to_ascii_lowercase(), p)))
            .collect();
        // Row without a price and row without an id are both dropped.
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get("0xa"), Some(&Decimal::new(125, 2)));
    }
}
