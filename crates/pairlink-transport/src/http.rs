//! HTTP client for direct signaling (`POST /signal/{session_id}`).

#![cfg(feature = "http")]

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::error::TransportError;
use crate::traits::{DirectRequest, DirectResponse, DirectSignalClient, DirectTarget};

pub const HEADER_SIGNATURE: &str = "X-Signature";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";

/// HTTP client configuration
#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    pub connection_timeout: Duration,
    pub request_timeout: Duration,
    pub use_tls: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
            use_tls: false,
        }
    }
}

/// Direct signaling over plain HTTP to the host's LAN address.
#[derive(Clone)]
pub struct HttpDirectClient {
    client: reqwest::Client,
    use_tls: bool,
}

impl HttpDirectClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(config.connection_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self {
            client,
            use_tls: config.use_tls,
        })
    }

    fn signal_url(&self, target: &DirectTarget, session_id: &str) -> Result<url::Url, TransportError> {
        let scheme = if self.use_tls { "https" } else { "http" };
        let mut url = url::Url::parse(&format!("{}://{}:{}/", scheme, target.host, target.port))
            .map_err(|e| TransportError::Other(format!("bad direct target: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| TransportError::Other("bad direct target".into()))?
            .clear()
            .push("signal")
            .push(session_id);
        Ok(url)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))
    } else {
        TransportError::Other(e.to_string())
    }
}

#[async_trait]
impl DirectSignalClient for HttpDirectClient {
    async fn post_signal(
        &self,
        target: &DirectTarget,
        request: &DirectRequest,
    ) -> Result<DirectResponse, TransportError> {
        let url = self.signal_url(target, &request.session_id)?;
        debug!(host = %target.host, port = target.port, "posting direct signal");

        let resp = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "text/plain")
            .header(HEADER_SIGNATURE, &request.signature)
            .header(HEADER_TIMESTAMP, request.timestamp.to_string())
            .body(request.body.clone())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(map_reqwest_error)?;
        Ok(DirectResponse { status, body })
    }
}
