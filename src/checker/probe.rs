//! Probe client: one HTTP exchange per key, classified into a verdict

use crate::checker::error::CheckError;
use crate::checker::models::{KeyResult, KeyStatus};
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Default endpoint keys are tested against
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/models";

/// Default extra headers sent with every probe
pub const DEFAULT_HEADERS: &str = "Content-Type: application/json";

/// Default timeout for each probe in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default connect timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 120;

const USER_AGENT: &str = concat!("key-checker/", env!("CARGO_PKG_VERSION"));

/// One `Name: Value` entry of a header list
static HEADER_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:]*):(.*)$").expect("Invalid header entry regex"));

/// HTTP method used for probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    /// Whether the configured body goes out with this method
    pub fn sends_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }

    fn as_reqwest(&self) -> Method {
        match self {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Patch => Method::PATCH,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
            HttpMethod::Patch => write!(f, "PATCH"),
        }
    }
}

impl FromStr for HttpMethod {
    type Err = CheckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            _ => Err(CheckError::UnsupportedMethod(s.to_string())),
        }
    }
}

/// Request configuration shared by every probe of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestConfig {
    /// URL each key is tested against
    pub endpoint: String,
    pub method: HttpMethod,
    /// Extra headers as `Name: Value` entries separated by `;`
    pub headers: String,
    /// Body sent with POST, PUT and PATCH
    pub body: String,
    /// Whole-exchange timeout for one probe
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            method: HttpMethod::Get,
            headers: DEFAULT_HEADERS.to_string(),
            body: String::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl RequestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_headers(mut self, headers: impl Into<String>) -> Self {
        self.headers = headers.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Reject configurations no run should start with
    pub fn validate(&self) -> Result<(), CheckError> {
        let url = Url::parse(self.endpoint.trim())
            .map_err(|e| CheckError::InvalidEndpoint(self.endpoint.clone(), e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CheckError::InvalidEndpoint(
                self.endpoint.clone(),
                format!("unsupported scheme {}", url.scheme()),
            ));
        }

        let secs = self.timeout.as_secs();
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) {
            return Err(CheckError::InvalidTimeout {
                value: secs,
                min: MIN_TIMEOUT_SECS,
                max: MAX_TIMEOUT_SECS,
            });
        }

        Ok(())
    }
}

/// Split a `Name: Value; Name: Value` list into trimmed pairs.
///
/// Entries without a `:` or with an empty name are dropped.
pub fn parse_headers(headers: &str) -> Vec<(String, String)> {
    headers
        .split(';')
        .filter_map(|entry| {
            let caps = HEADER_ENTRY.captures(entry.trim())?;
            let name = caps[1].trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), caps[2].trim().to_string()))
        })
        .collect()
}

/// Map an HTTP status code to a verdict and message
pub fn classify_status(code: u16) -> (KeyStatus, String) {
    match code {
        200 | 201 | 204 => (KeyStatus::Valid, "valid".to_string()),
        401 => (KeyStatus::Invalid, "authentication failed".to_string()),
        403 => (KeyStatus::Invalid, "access denied".to_string()),
        404 => (KeyStatus::Invalid, "resource not found".to_string()),
        429 => (KeyStatus::Error, "rate limited, retry later".to_string()),
        code if code >= 500 => (KeyStatus::Error, format!("server error {}", code)),
        code => (KeyStatus::Invalid, format!("HTTP {}", code)),
    }
}

/// A transport able to test one key.
///
/// Implementations never fail: every problem is folded into an
/// `Error` outcome.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, key: &str) -> KeyResult;
}

/// Probe backed by a shared reqwest client
pub struct HttpProbe {
    config: RequestConfig,
    client: Client,
    extra_headers: HeaderMap,
}

impl HttpProbe {
    pub fn new(config: RequestConfig) -> Result<Self, CheckError> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(USER_AGENT)
            .build()?;

        let mut extra_headers = HeaderMap::new();
        for (name, value) in parse_headers(&config.headers) {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    extra_headers.append(name, value);
                }
                _ => tracing::warn!(header = %name, "skipping malformed header"),
            }
        }
        // The probed key always supplies Authorization
        extra_headers.remove(AUTHORIZATION);

        Ok(Self {
            config,
            client,
            extra_headers,
        })
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    fn build_request(&self, key: &str) -> RequestBuilder {
        let mut request = self
            .client
            .request(self.config.method.as_reqwest(), self.config.endpoint.trim())
            .headers(self.extra_headers.clone())
            .bearer_auth(key);

        if self.config.method.sends_body() {
            request = request.body(self.config.body.clone());
        }

        request
    }

    fn timed_out(&self, key: &str) -> KeyResult {
        KeyResult::error(
            key.to_string(),
            format!("request timed out after {}s", self.config.timeout.as_secs()),
        )
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, key: &str) -> KeyResult {
        let checked_at = Utc::now();
        let start = Instant::now();

        let result = match tokio::time::timeout(self.config.timeout, self.build_request(key).send())
            .await
        {
            Ok(Ok(response)) => {
                let (status, message) = classify_status(response.status().as_u16());
                KeyResult::new(key.to_string(), status, message)
            }
            Ok(Err(e)) if e.is_timeout() => self.timed_out(key),
            Ok(Err(e)) => KeyResult::error(key.to_string(), format!("request failed: {}", e)),
            Err(_) => self.timed_out(key),
        };

        result
            .with_checked_at(checked_at)
            .with_response_time(start.elapsed().as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_valid_codes() {
        for code in [200, 201, 204] {
            assert_eq!(classify_status(code).0, KeyStatus::Valid, "code {}", code);
        }
    }

    #[test]
    fn test_classify_invalid_codes() {
        for code in [401, 403, 404, 400, 202, 302, 418] {
            assert_eq!(classify_status(code).0, KeyStatus::Invalid, "code {}", code);
        }
        assert_eq!(classify_status(418).1, "HTTP 418");
    }

    #[test]
    fn test_classify_error_codes() {
        assert_eq!(classify_status(429).0, KeyStatus::Error);
        let (status, message) = classify_status(503);
        assert_eq!(status, KeyStatus::Error);
        assert_eq!(message, "server error 503");
    }

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(" Content-Type: application/json ;X-Org:acme; broken ; :empty;");
        assert_eq!(
            headers,
            vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("X-Org".to_string(), "acme".to_string()),
            ]
        );
        assert!(parse_headers("").is_empty());
    }

    #[test]
    fn test_parse_headers_value_with_colon() {
        let headers = parse_headers("X-Trace: a:b:c");
        assert_eq!(headers, vec![("X-Trace".to_string(), "a:b:c".to_string())]);
    }

    #[test]
    fn test_http_method_from_str() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("PATCH".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!("HEAD".parse::<HttpMethod>().is_err());
        assert!(HttpMethod::Post.sends_body());
        assert!(!HttpMethod::Delete.sends_body());
    }

    #[test]
    fn test_request_config_builder() {
        let config = RequestConfig::new()
            .with_endpoint("http://localhost:8080/v1/me")
            .with_method(HttpMethod::Post)
            .with_body("{}")
            .with_timeout(Duration::from_secs(30));

        assert_eq!(config.endpoint, "http://localhost:8080/v1/me");
        assert_eq!(config.method, HttpMethod::Post);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_request_config_rejects_bad_endpoint() {
        let config = RequestConfig::new().with_endpoint("not a url");
        assert!(matches!(config.validate(), Err(CheckError::InvalidEndpoint(..))));

        let config = RequestConfig::new().with_endpoint("ftp://example.com");
        assert!(matches!(config.validate(), Err(CheckError::InvalidEndpoint(..))));
    }

    #[test]
    fn test_request_config_rejects_bad_timeout() {
        let config = RequestConfig::new().with_timeout(Duration::from_secs(0));
        assert!(matches!(config.validate(), Err(CheckError::InvalidTimeout { .. })));

        let config = RequestConfig::new().with_timeout(Duration::from_secs(121));
        assert!(matches!(config.validate(), Err(CheckError::InvalidTimeout { .. })));
    }

    #[tokio::test]
    async fn test_repeated_header_keeps_every_value() {
        let config = RequestConfig::new()
            .with_headers("X-Tag: one; X-Tag: two; Authorization: Bearer other");
        let probe = HttpProbe::new(config).unwrap();

        let values: Vec<_> = probe
            .extra_headers
            .get_all("x-tag")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(values, vec!["one", "two"]);
        assert!(probe.extra_headers.get(AUTHORIZATION).is_none());
    }
}
