use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::model::{IdempotencyKey, UnixTimeMs};
use crate::remote::{
    classify_status, CreateReportRequest, DeliveryError, DeliveryReceipt, ErrorCategory,
    OfficerProfile, ReportApi,
};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("invalid api base url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct CreateReportResponse {
    #[serde(default)]
    report: Option<ReportBody>,
    #[serde(default)]
    duplicate: bool,
}

#[derive(Deserialize)]
struct ReportBody {
    #[serde(default)]
    id: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ProfileResponse {
    #[serde(default)]
    data: Option<OfficerProfile>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// `ReportApi` over the SiPatrol JSON endpoints.
pub struct HttpReportApi {
    client: Client,
    base: Url,
    token: Option<SecretString>,
}

impl HttpReportApi {
    pub fn new(
        base_url: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, HttpClientError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, DeliveryError> {
        self.base.join(path).map_err(|e| {
            DeliveryError::new(ErrorCategory::Unknown, "bad_url", e.to_string(), UnixTimeMs::now())
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }

    /// Cheap reachability check used by the connectivity probe.
    pub async fn ping(&self) -> bool {
        match self.client.head(self.base.clone()).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "api ping failed");
                false
            }
        }
    }
}

fn transport_error(e: &reqwest::Error) -> DeliveryError {
    let category = if e.is_timeout() {
        ErrorCategory::Timeout
    } else if e.is_connect() || e.is_request() {
        ErrorCategory::Network
    } else if e.is_decode() || e.is_body() {
        // Request went out, response was mangled: outcome unknown.
        ErrorCategory::Timeout
    } else {
        ErrorCategory::Unknown
    };
    DeliveryError::new(category, "transport", e.to_string(), UnixTimeMs::now())
}

async fn status_error(status: StatusCode, resp: reqwest::Response) -> DeliveryError {
    let category = classify_status(status.as_u16()).unwrap_or(ErrorCategory::Unknown);
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    DeliveryError::new(category, format!("http_{}", status.as_u16()), message, UnixTimeMs::now())
}

#[async_trait]
impl ReportApi for HttpReportApi {
    #[instrument(skip(self, request), fields(idempotency_key = %key))]
    async fn submit(
        &self,
        key: &IdempotencyKey,
        request: &CreateReportRequest,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let url = self.endpoint("api/reports")?;
        let resp = self
            .authorize(self.client.post(url))
            .header(IDEMPOTENCY_HEADER, key.as_str())
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = resp.status();
        if status == StatusCode::CONFLICT {
            debug!("server already has this report");
            return Ok(DeliveryReceipt {
                report_id: None,
                duplicate: true,
            });
        }
        if !status.is_success() {
            return Err(status_error(status, resp).await);
        }

        let body: CreateReportResponse = resp.json().await.map_err(|e| transport_error(&e))?;
        let report_id = body.report.and_then(|r| r.id).map(|id| match id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        Ok(DeliveryReceipt {
            report_id,
            duplicate: body.duplicate,
        })
    }

    async fn current_officer(&self) -> Result<Option<OfficerProfile>, DeliveryError> {
        let url = self.endpoint("api/profile")?;
        let resp = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, resp).await);
        }

        let body: ProfileResponse = resp.json().await.map_err(|e| transport_error(&e))?;
        Ok(body.data)
    }
}

impl std::fmt::Debug for HttpReportApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpReportApi")
            .field("base", &self.base.as_str())
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        let api = HttpReportApi::new("https://patrol.example.com/app", None, Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            api.endpoint("api/reports").unwrap().as_str(),
            "https://patrol.example.com/app/api/reports"
        );
    }

    #[test]
    fn rejects_invalid_base() {
        assert!(matches!(
            HttpReportApi::new("not a url", None, Duration::from_secs(5)),
            Err(HttpClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn debug_hides_token() {
        let api = HttpReportApi::new(
            "https://patrol.example.com",
            Some(SecretString::new("hunter2".into())),
            Duration::from_secs(5),
        )
        .unwrap();
        let rendered = format!("{api:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("authenticated: true"));
    }

    #[test]
    fn create_response_tolerates_numeric_ids() {
        let body: CreateReportResponse =
            serde_json::from_str(r#"{"success":true,"report":{"id":42}}"#).unwrap();
        assert!(!body.duplicate);
        assert_eq!(body.report.unwrap().id, Some(serde_json::json!(42)));
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let api = HttpReportApi::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let err = api.current_officer().await.unwrap_err();
        assert!(matches!(
            err.category,
            ErrorCategory::Network | ErrorCategory::Timeout
        ));
    }
}
