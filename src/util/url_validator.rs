use thiserror::Error;
use url::Url;

/// Reasons a string cannot be registered as a feed URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
}

/// Validates a feed URL before it enters the registry.
///
/// Only absolute `http`/`https` URLs with a host are accepted. Loopback and
/// private addresses are allowed: self-hosted feed mirrors are a normal setup
/// for a desktop reader.
///
/// # Examples
///
/// ```
/// use paddock::util::validate_url;
///
/// let url = validate_url("https://www.motorsport.com/rss/f1/news/").unwrap();
/// assert_eq!(url.host_str(), Some("www.motorsport.com"));
///
/// assert!(validate_url("file:///etc/passwd").is_err());
/// assert!(validate_url("not a url").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(UrlValidationError::MissingHost),
    }
}
