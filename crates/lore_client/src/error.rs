use std::time::Duration;

use reqwest_retry::RetryError;
use thiserror::Error;

/// Failure of a refresh exchange. Cloned into every continuation waiting on the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("refresh endpoint rejected the exchange with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("refresh exchange failed: {0}")]
    Transport(String),

    #[error("refresh response carried no access token: {0}")]
    MalformedResponse(String),

    #[error("failed to persist refreshed access token: {0}")]
    Storage(String),

    #[error("refresh exchange timed out after {0:?}")]
    TimedOut(Duration),

    #[error("refresh exchange was abandoned before it settled")]
    Abandoned,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Middleware error: {0}")]
    Middleware(anyhow::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Unauthorized request to {url}")]
    Unauthorized { url: String },

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Session refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest_middleware::Error> for ClientError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(err) => ClientError::Http(err),
            reqwest_middleware::Error::Middleware(err) => {
                let err = match err.downcast::<RefreshError>() {
                    Ok(refresh) => return ClientError::Refresh(refresh),
                    Err(other) => other,
                };
                // The transient retry layer wraps whatever the transport returned.
                match err.downcast::<RetryError>() {
                    Ok(RetryError::WithRetries { err, .. } | RetryError::Error(err)) => {
                        ClientError::from(err)
                    }
                    Err(other) => match other.downcast::<reqwest::Error>() {
                        Ok(transport) => ClientError::Http(transport),
                        Err(other) => ClientError::Middleware(other),
                    },
                }
            }
        }
    }
}

impl ClientError {
    /// True when the refresh failed and the stored session was cleared.
    ///
    /// An abandoned attempt is not fatal: its leader was cancelled before the
    /// exchange settled, and the stored session was left as it was.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ClientError::Refresh(err) if *err != RefreshError::Abandoned)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn middleware_refresh_error_is_recovered() {
        let original = RefreshError::Rejected {
            status: 401,
            body: "expired".to_string(),
        };
        let wrapped = reqwest_middleware::Error::Middleware(anyhow::Error::new(original.clone()));

        let err = ClientError::from(wrapped);
        assert!(err.is_session_fatal());
        assert!(matches!(err, ClientError::Refresh(inner) if inner == original));
    }

    #[test]
    fn other_middleware_errors_stay_opaque() {
        let wrapped = reqwest_middleware::Error::Middleware(anyhow::anyhow!("boom"));
        let err = ClientError::from(wrapped);
        assert!(!err.is_session_fatal());
        assert!(matches!(err, ClientError::Middleware(_)));
    }

    #[test]
    fn abandoned_refresh_is_not_session_fatal() {
        let err = ClientError::Refresh(RefreshError::Abandoned);
        assert!(!err.is_session_fatal());
        let timed_out = ClientError::Refresh(RefreshError::TimedOut(Duration::from_secs(1)));
        assert!(timed_out.is_session_fatal());
    }

    #[tokio::test]
    async fn transport_error_is_unwrapped_from_retry_layer() {
        let transport = reqwest::Client::builder()
            .no_proxy()
            .build()
            .expect("client")
            .get("http://127.0.0.1:1/unreachable")
            .send()
            .await
            .expect_err("nothing listens on port 1");
        let wrapped = reqwest_middleware::Error::Middleware(anyhow::Error::new(
            RetryError::WithRetries {
                retries: 2,
                err: reqwest_middleware::Error::Reqwest(transport),
            },
        ));

        let err = ClientError::from(wrapped);
        assert!(matches!(err, ClientError::Http(ref inner) if inner.is_connect()));
        assert!(!err.is_session_fatal());
    }
}
