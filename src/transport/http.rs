//! HTTP gateway transport: posts each message as JSON to a configured URL.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::debug;

use super::MessageSender;
use crate::error::SendError;

/// Request timeout for a single gateway call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct OutboundMessage<'a> {
    phone: &'a str,
    message: &'a str,
}

/// Gateway client.
pub struct HttpSender {
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
}

impl HttpSender {
    pub fn new(url: impl Into<String>, token: Option<SecretString>) -> Result<Self, SendError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SendError::Fatal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }
}

/// Map a gateway status code to the send error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> Result<(), SendError> {
    if status.is_success() {
        return Ok(());
    }
    let detail = format!("gateway returned {status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(SendError::Transient(detail))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(SendError::Fatal(detail))
    } else {
        Err(SendError::Rejected(detail))
    }
}

fn classify_transport_error(err: &reqwest::Error) -> SendError {
    if err.is_timeout() {
        SendError::Timeout(REQUEST_TIMEOUT)
    } else {
        SendError::Transient(err.to_string())
    }
}

#[async_trait]
impl MessageSender for HttpSender {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, phone: &str, body: &str) -> Result<(), SendError> {
        let response = self
            .request(reqwest::Method::POST, &self.url)
            .json(&OutboundMessage {
                phone,
                message: body,
            })
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        debug!(phone = %phone, status = %status, "Gateway responded");
        classify_status(status, &text)
    }

    async fn health_check(&self) -> Result<(), SendError> {
        match self.request(reqwest::Method::HEAD, &self.url).send().await {
            Ok(response) if response.status() == StatusCode::UNAUTHORIZED => Err(
                SendError::Fatal("gateway rejected credentials".to_string()),
            ),
            Ok(_) => Ok(()),
            Err(e) if e.is_connect() => Err(SendError::Fatal(e.to_string())),
            Err(e) => Err(classify_transport_error(&e)),
        }
    }
}
