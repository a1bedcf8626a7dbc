//! HTTP client for the availability store's edge API

use super::backoff::ExponentialBackoff;
use super::queue::{Deliverer, UpdateResponse};
use crate::config::{ConfigError, LoaderConfig};
use crate::errors::DeliveryError;
use crate::model::{DeliveryOptions, LocationRecord};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Statuses that mean the request probably never reached the API server
/// (load balancer, CDN or gateway trouble), so a POST is safe to retry.
pub const GATEWAY_RETRY_STATUSES: &[u16] = &[502, 503, 504, 521, 522, 524];

const RETRY_INITIAL_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 5_000;
const MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_delay_ms: u64,
}

/// One page of a paginated API listing.
#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    links: Option<PageLinks>,
}

#[derive(Debug, Deserialize)]
struct PageLinks {
    #[serde(default)]
    next: Option<String>,
}

impl ApiClient {
    pub fn new(
        url: &str,
        key: &str,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, ConfigError> {
        if url.trim().is_empty() || key.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "You must set an API URL and key".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        let key_header = HeaderValue::from_str(key)
            .map_err(|_| ConfigError::InvalidValue("API_KEY is not a valid header".to_string()))?;
        headers.insert("x-api-key", key_header);
        if let Ok(value) = HeaderValue::from_str(user_agent) {
            headers.insert(USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::InvalidValue(format!("could not build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            client,
            max_retries: MAX_RETRIES,
            retry_delay_ms: RETRY_INITIAL_DELAY_MS,
        })
    }

    /// Build a client from `API_URL` / `API_KEY` in the loaded config.
    pub fn from_config(config: &LoaderConfig) -> Result<Self, ConfigError> {
        let (url, key) = config.api_credentials()?;
        Self::new(url, key, config.http_timeout, &config.user_agent())
    }

    /// Override the gateway retry policy.
    pub fn with_retries(mut self, max_retries: u32, initial_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = initial_delay_ms;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// Send one record to `/api/edge/update`.
    pub async fn send_update(
        &self,
        record: &LocationRecord,
        options: DeliveryOptions,
    ) -> Result<UpdateResponse, DeliveryError> {
        let url = self.url_for("/api/edge/update");
        let mut backoff =
            ExponentialBackoff::new(self.retry_delay_ms, RETRY_MAX_DELAY_MS, self.max_retries);

        loop {
            let mut request = self.client.post(&url).json(record);
            if options.update_location {
                request = request.query(&[("update_location", "true")]);
            }

            let response = request.send().await?;
            let status = response.status().as_u16();

            if GATEWAY_RETRY_STATUSES.contains(&status) && backoff.sleep().await.is_ok() {
                log::debug!("Retrying update for {} after HTTP {}", record.describe(), status);
                continue;
            }

            let text = response.text().await?;
            let body: Value = serde_json::from_str(&text).map_err(|_| DeliveryError::Rejected {
                status,
                code: None,
                message: format!("non-JSON response: {}", truncate(&text, 200)),
            })?;

            return interpret_update_body(status, body, backoff.attempts());
        }
    }

    /// List locations from `/api/edge/locations`, following `links.next`
    /// until the last page.
    pub async fn get_locations(&self, query: &[(&str, &str)]) -> Result<Vec<Value>, DeliveryError> {
        let mut results = Vec::new();
        let mut request = self.client.get(self.url_for("/api/edge/locations")).query(query);

        loop {
            let response = request.send().await?.error_for_status()?;
            let page: Page = response.json().await?;
            results.extend(page.data);

            match page.links.and_then(|links| links.next) {
                Some(next) => request = self.client.get(self.url_for(&next)),
                None => break,
            }
        }

        Ok(results)
    }
}

#[async_trait]
impl Deliverer for ApiClient {
    async fn send_update(
        &self,
        record: &LocationRecord,
        options: DeliveryOptions,
    ) -> Result<UpdateResponse, DeliveryError> {
        ApiClient::send_update(self, record, options).await
    }
}

/// Turn a parsed update response into success or a rejection.
///
/// The API reports failures as `{"error": {"message", "code"}}` (sometimes
/// a bare string) or `{"success": false}`.
pub fn interpret_update_body(
    status: u16,
    body: Value,
    retries: u32,
) -> Result<UpdateResponse, DeliveryError> {
    let error = body.get("error").filter(|e| !e.is_null());
    let declined = body.get("success").and_then(Value::as_bool) == Some(false);
    let http_ok = (200..300).contains(&status);

    if error.is_none() && !declined && http_ok {
        return Ok(UpdateResponse {
            status,
            body,
            retries,
        });
    }

    let (code, message) = match error {
        Some(Value::String(message)) => (None, message.clone()),
        Some(Value::Object(details)) => (
            details.get("code").and_then(Value::as_str).map(str::to_string),
            details
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown reason")
                .to_string(),
        ),
        Some(other) => (None, other.to_string()),
        None => (None, "unknown reason".to_string()),
    };

    Err(DeliveryError::Rejected {
        status,
        code,
        message,
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_body_is_accepted() {
        let ok = interpret_update_body(200, json!({"data": {"id": "abc"}}), 1).unwrap();
        assert_eq!(ok.status, 200);
        assert_eq!(ok.retries, 1);
        assert_eq!(ok.body["data"]["id"], json!("abc"));
    }

    #[test]
    fn test_out_of_date_rejection_is_recognized() {
        let err = interpret_update_body(
            409,
            json!({"error": {"message": "Newer data exists", "code": "out_of_date"}}),
            0,
        )
        .unwrap_err();
        assert!(err.is_out_of_date());
        assert_eq!(err.status(), Some(409));
    }

    #[test]
    fn test_other_failures_are_rejections() {
        let declined = interpret_update_body(200, json!({"success": false}), 0).unwrap_err();
        assert!(matches!(declined, DeliveryError::Rejected { status: 200, .. }));
        assert!(!declined.is_out_of_date());

        let string_error = interpret_update_body(500, json!({"error": "boom"}), 0).unwrap_err();
        assert!(matches!(
            string_error,
            DeliveryError::Rejected { ref message, .. } if message == "boom"
        ));

        let bare_status = interpret_update_body(503, json!({}), 2).unwrap_err();
        assert_eq!(bare_status.status(), Some(503));
    }

    #[test]
    fn test_client_requires_url_and_key() {
        let config = LoaderConfig::default();
        assert!(matches!(
            ApiClient::from_config(&config),
            Err(ConfigError::MissingVariable(_))
        ));

        let client = ApiClient::new(
            "https://api.test/",
            "secret",
            Duration::from_secs(5),
            "availflow/test",
        )
        .unwrap();
        assert_eq!(client.base_url(), "https://api.test");
        assert_eq!(client.url_for("/api/edge/update"), "https://api.test/api/edge/update");
        assert_eq!(
            client.url_for("https://api.test/api/edge/locations?page=2"),
            "https://api.test/api/edge/locations?page=2"
        );
    }

    #[test]
    fn test_truncate_long_bodies() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    mod http {
        use super::*;
        use wiremock::matchers::{header, method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn client_for(server: &MockServer) -> ApiClient {
            ApiClient::new(&server.uri(), "secret", Duration::from_secs(5), "availflow/test")
                .unwrap()
                .with_retries(2, 1)
        }

        fn store() -> LocationRecord {
            LocationRecord {
                name: "Store 1".to_string(),
                ..Default::default()
            }
        }

        #[tokio::test]
        async fn test_update_sends_key_and_location_flag() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/edge/update"))
                .and(query_param("update_location", "true"))
                .and(header("x-api-key", "secret"))
                .and(header("user-agent", "availflow/test"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "loc-1"}})))
                .expect(1)
                .mount(&server)
                .await;

            let response = client_for(&server)
                .send_update(&store(), DeliveryOptions::update_location())
                .await
                .unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(response.retries, 0);
            assert_eq!(response.body["data"]["id"], json!("loc-1"));
        }

        #[tokio::test]
        async fn test_gateway_errors_are_retried() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/edge/update"))
                .respond_with(ResponseTemplate::new(503))
                .up_to_n_times(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/api/edge/update"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
                .mount(&server)
                .await;

            let response = client_for(&server)
                .send_update(&store(), DeliveryOptions::default())
                .await
                .unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(response.retries, 1);
        }

        #[tokio::test]
        async fn test_retry_budget_then_rejection() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/edge/update"))
                .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
                .expect(3)
                .mount(&server)
                .await;

            let error = client_for(&server)
                .send_update(&store(), DeliveryOptions::default())
                .await
                .unwrap_err();
            assert_eq!(error.status(), Some(502));
            assert!(matches!(
                error,
                DeliveryError::Rejected { ref message, .. } if message.contains("non-JSON")
            ));
        }

        #[tokio::test]
        async fn test_non_json_success_is_rejected() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/edge/update"))
                .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
                .mount(&server)
                .await;

            let error = client_for(&server)
                .send_update(&store(), DeliveryOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(error, DeliveryError::Rejected { status: 200, code: None, .. }));
        }

        #[tokio::test]
        async fn test_out_of_date_body_from_server() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/edge/update"))
                .respond_with(ResponseTemplate::new(409).set_body_json(
                    json!({"error": {"code": "out_of_date", "message": "Newer data exists"}}),
                ))
                .mount(&server)
                .await;

            let error = client_for(&server)
                .send_update(&store(), DeliveryOptions::default())
                .await
                .unwrap_err();
            assert!(error.is_out_of_date());
        }

        #[tokio::test]
        async fn test_get_locations_follows_next_links() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/edge/locations"))
                .and(query_param("page", "2"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"id": "c"}]})))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/api/edge/locations"))
                .and(query_param("state", "NJ"))
                .and(header("x-api-key", "secret"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "data": [{"id": "a"}, {"id": "b"}],
                    "links": {"next": "/api/edge/locations?page=2"}
                })))
                .expect(1)
                .mount(&server)
                .await;

            let locations = client_for(&server).get_locations(&[("state", "NJ")]).await.unwrap();
            let ids: Vec<&str> = locations.iter().filter_map(|l| l["id"].as_str()).collect();
            assert_eq!(ids, vec!["a", "b", "c"]);
        }

        #[tokio::test]
        async fn test_get_locations_error_status() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/api/edge/locations"))
                .respond_with(ResponseTemplate::new(500))
                .mount(&server)
                .await;

            let error = client_for(&server).get_locations(&[]).await.unwrap_err();
            assert_eq!(error.status(), Some(500));
        }
    }
}
