use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use thiserror::Error;

use super::parser::ParseError;
use crate::config::Config;
use crate::storage::CacheMetadata;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_REDIRECTS: usize = 5;

/// Errors that can end a single fetch attempt.
///
/// Every variant feeds the retry state machine; none of them reach the
/// engine's callers except as event text.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a status other than 2xx or 304
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The attempt's deadline passed before the body was fully read
    #[error("Request timed out")]
    Timeout,
    /// Body was neither RSS nor Atom, or held no valid items
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Connection closed before Content-Length bytes arrived
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Conditional-GET validators remembered from the last successful response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl From<&CacheMetadata> for Validators {
    fn from(metadata: &CacheMetadata) -> Self {
        Self {
            etag: metadata.etag.clone(),
            last_modified: metadata.last_modified.clone(),
        }
    }
}

/// What came back from the server.
#[derive(Debug)]
pub enum Payload {
    /// 304: the cached copy is current.
    NotModified,
    /// 2xx with the full body and any validators it carried.
    Body {
        bytes: Vec<u8>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

#[derive(Debug)]
pub struct FetchResponse {
    pub payload: Payload,
    /// Set when the transfer only succeeded after certificate checks were relaxed.
    pub tls_warning: Option<String>,
}

impl FetchResponse {
    pub fn not_modified() -> Self {
        Self {
            payload: Payload::NotModified,
            tls_warning: None,
        }
    }

    pub fn body(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: Payload::Body {
                bytes: bytes.into(),
                etag: None,
                last_modified: None,
            },
            tls_warning: None,
        }
    }
}

/// One conditional GET. The engine owns timeouts and retries; a transport only
/// performs the exchange.
pub trait FeedTransport: Clone + Send + Sync + 'static {
    fn fetch(
        &self,
        url: &str,
        validators: &Validators,
    ) -> impl Future<Output = Result<FetchResponse, FetchError>> + Send;
}

/// `reqwest`-backed transport.
///
/// Keeps a second client with certificate verification disabled; it is only
/// used to repeat a request whose first try failed certificate validation.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    strict: reqwest::Client,
    lenient: Option<reqwest::Client>,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let strict = build_client(&config.user_agent, false)?;
        let lenient = if config.accept_invalid_certs {
            Some(build_client(&config.user_agent, true)?)
        } else {
            None
        };
        Ok(Self { strict, lenient })
    }

    async fn send(
        client: &reqwest::Client,
        url: &str,
        validators: &Validators,
    ) -> Result<FetchResponse, FetchError> {
        let mut request = client.get(url);
        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchResponse::not_modified());
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let etag = header_value(response.headers(), ETAG);
        let last_modified = header_value(response.headers(), LAST_MODIFIED);
        let bytes = read_limited_bytes(response, MAX_FEED_SIZE).await?;

        Ok(FetchResponse {
            payload: Payload::Body {
                bytes,
                etag,
                last_modified,
            },
            tls_warning: None,
        })
    }
}

impl FeedTransport for HttpTransport {
    async fn fetch(&self, url: &str, validators: &Validators) -> Result<FetchResponse, FetchError> {
        match Self::send(&self.strict, url, validators).await {
            Err(FetchError::Network(e)) if is_certificate_error(&e) => {
                let Some(lenient) = &self.lenient else {
                    return Err(FetchError::Network(e));
                };
                let reason = root_cause(&e);
                tracing::warn!(url = %url, error = %reason, "Certificate validation failed, retrying without verification");

                let mut response = Self::send(lenient, url, validators).await?;
                response.tls_warning = Some(format!(
                    "certificate for {url} could not be verified ({reason})"
                ));
                Ok(response)
            }
            other => other,
        }
    }
}

fn build_client(user_agent: &str, accept_invalid_certs: bool) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .redirect(redirect_policy())
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60));
    if accept_invalid_certs {
        builder = builder.danger_accept_invalid_certs(true);
    }
    Ok(builder.build()?)
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("Too many redirects");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following feed redirect"
        );
        attempt.follow()
    })
}

fn header_value(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Whether a request failed because the peer's certificate was rejected.
///
/// rustls reports handshake failures wrapped in an `io::Error`, whose
/// `source()` skips the wrapped error, so each link is also unwrapped by hand.
fn is_certificate_error(error: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = source {
        let tls = err.downcast_ref::<rustls::Error>().or_else(|| {
            err.downcast_ref::<std::io::Error>()
                .and_then(|io| io.get_ref())
                .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        });
        if matches!(tls, Some(rustls::Error::InvalidCertificate(_))) {
            return true;
        }
        source = err.source();
    }
    false
}

fn root_cause(error: &reqwest::Error) -> String {
    let mut current: &(dyn std::error::Error + 'static) = error;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
