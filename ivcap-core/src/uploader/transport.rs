use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::UploaderSection;
use crate::coordinator::{CreateSessionRequest, FinalizeOutcome, FinalizeRequest};
use crate::fragment::{Fragment, FragmentAck};
use crate::session::Session;

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("uploader is drained; no further fragments accepted")]
    Sealed,
    #[error("fragment {index} of session {session_id} was already submitted")]
    Duplicate { session_id: String, index: u64 },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Http { status: u16, body: String },
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),
}

impl UploadError {
    /// Server faults, throttling and rejected-but-resendable payloads are
    /// worth another attempt. Other client errors will fail the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Transport(_) => true,
            UploadError::Http { status, .. } => {
                *status >= 500 || matches!(*status, 408 | 422 | 429)
            }
            UploadError::Sealed | UploadError::Duplicate { .. } | UploadError::Url(_) => false,
        }
    }
}

/// Delivers one fragment to the ingest side and returns its acknowledgement.
#[async_trait]
pub trait FragmentTransport: Send + Sync {
    async fn deliver(&self, fragment: &Fragment) -> UploadResult<FragmentAck>;
}

/// Client for the ingest HTTP routes.
#[derive(Debug, Clone)]
pub struct HttpIngestClient {
    client: Client,
    base: Url,
}

impl HttpIngestClient {
    pub fn new(endpoint: &str, timeout: Duration) -> UploadResult<Self> {
        let mut raw = endpoint.to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ivcap/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, base })
    }

    pub fn from_config(section: &UploaderSection) -> UploadResult<Self> {
        Self::new(
            &section.endpoint,
            Duration::from_secs(section.request_timeout_seconds),
        )
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub async fn create_session(&self, request: &CreateSessionRequest) -> UploadResult<Session> {
        let url = self.base.join("sessions")?;
        let response = self.client.post(url).json(request).send().await?;
        decode(response).await
    }

    pub async fn finalize(
        &self,
        session_id: &str,
        request: &FinalizeRequest,
    ) -> UploadResult<FinalizeOutcome> {
        let url = self.base.join(&format!("sessions/{session_id}/finalize"))?;
        let response = self.client.post(url).json(request).send().await?;
        decode(response).await
    }

    pub async fn session(&self, session_id: &str) -> UploadResult<Session> {
        let url = self.base.join(&format!("sessions/{session_id}"))?;
        let response = self.client.get(url).send().await?;
        decode(response).await
    }
}

#[async_trait]
impl FragmentTransport for HttpIngestClient {
    async fn deliver(&self, fragment: &Fragment) -> UploadResult<FragmentAck> {
        let url = self.base.join(&format!(
            "sessions/{}/fragments/{}",
            fragment.session_id, fragment.index
        ))?;
        debug!(session_id = %fragment.session_id, index = fragment.index, %url, "delivering fragment");
        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(fragment.payload.clone())
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> UploadResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UploadError::Http {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_gains_trailing_slash() {
        let client = HttpIngestClient::new("http://127.0.0.1:8080/api", Duration::from_secs(5))
            .unwrap();
        assert_eq!(client.base_url().as_str(), "http://127.0.0.1:8080/api/");
        let joined = client.base_url().join("sessions/abc/fragments/3").unwrap();
        assert_eq!(joined.path(), "/api/sessions/abc/fragments/3");
    }

    fn http(status: u16) -> UploadError {
        UploadError::Http {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn server_faults_are_retryable() {
        for status in [500, 502, 503, 408, 422, 429] {
            assert!(http(status).is_retryable(), "{status}");
        }
    }

    #[test]
    fn client_rejections_are_final() {
        for status in [400, 403, 404, 409, 413] {
            assert!(!http(status).is_retryable(), "{status}");
        }
        assert!(!UploadError::Sealed.is_retryable());
        assert!(!UploadError::Duplicate {
            session_id: "s".into(),
            index: 1
        }
        .is_retryable());
    }

    #[test]
    fn rejects_unparseable_endpoint() {
        let err = HttpIngestClient::new("not a url", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, UploadError::Url(_)));
    }
}
