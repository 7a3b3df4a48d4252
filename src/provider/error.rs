use serde_json::Value;
use thiserror::Error;

/// Upstream provider failures, categorized so the HTTP boundary can map
/// them onto sensible status codes.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider network error: {0}")]
    Network(String),

    #[error("Provider authentication failed")]
    Auth,

    #[error("Provider rate limit exceeded")]
    RateLimited,

    #[error("Provider API error ({status}): {message}")]
    Api { status: u16, message: String, body: Option<Value> },

    /// A mid-stream decode failure. Delivered as one failed stream item;
    /// already-delivered events stand and the stream continues.
    #[error("Provider stream decode error: {0}")]
    Stream(String),
}

impl ProviderError {
    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, body_text: &str) -> Self {
        match status {
            401 | 403 => ProviderError::Auth,
            429 => ProviderError::RateLimited,
            _ => {
                let body: Option<Value> = serde_json::from_str(body_text).ok();
                let message = body
                    .as_ref()
                    .and_then(|b| b.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or(body_text)
                    .to_string();
                ProviderError::Api { status, message, body }
            }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return ProviderError::from_status(status.as_u16(), &e.to_string());
        }
        ProviderError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(ProviderError::from_status(401, ""), ProviderError::Auth));
        assert!(matches!(ProviderError::from_status(429, ""), ProviderError::RateLimited));

        let api = ProviderError::from_status(500, r#"{"message":"upstream exploded"}"#);
        match api {
            ProviderError::Api { status, message, body } => {
                assert_eq!(status, 500);
                assert_eq!(message, "upstream exploded");
                assert!(body.is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn non_json_body_becomes_message() {
        match ProviderError::from_status(502, "Bad Gateway") {
            ProviderError::Api { message, body, .. } => {
                assert_eq!(message, "Bad Gateway");
                assert!(body.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
