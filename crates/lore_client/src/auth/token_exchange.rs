use log::{error, info};
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;

use super::refresh::RefreshOutcome;
use crate::error::RefreshError;

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
}

/// Trades the refresh cookie for a new access token.
///
/// `client` must share its cookie jar with the business client and must not carry
/// the bearer or retry middleware.
#[derive(Debug, Clone)]
pub struct TokenExchanger {
    client: ClientWithMiddleware,
    url: Url,
}

impl TokenExchanger {
    pub fn new(client: ClientWithMiddleware, url: Url) -> Self {
        TokenExchanger { client, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn exchange(&self) -> RefreshOutcome {
        info!("Exchanging refresh credential at {}", self.url);
        let response = self
            .client
            .post(self.url.clone())
            .send()
            .await
            .map_err(|e| {
                error!("Refresh exchange to {} failed: {}", self.url, e);
                RefreshError::Transport(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Refresh exchange rejected with status {}", status);
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;
        let parsed = serde_json::from_slice::<RefreshResponse>(&body)
            .map_err(|e| RefreshError::MalformedResponse(e.to_string()))?;
        match parsed.access_token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(RefreshError::MalformedResponse(format!(
                "missing accessToken in {}",
                String::from_utf8_lossy(&body)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest_middleware::ClientBuilder;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn exchanger_for(server: &MockServer) -> TokenExchanger {
        let client = reqwest::Client::builder().no_proxy().build().expect("client");
        let url = Url::parse(&format!("{}/api/v1/auth/refresh", server.uri())).expect("url");
        TokenExchanger::new(ClientBuilder::new(client).build(), url)
    }

    #[tokio::test]
    async fn returns_access_token_from_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "accessToken": "T2" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(exchanger_for(&server).exchange().await, Ok("T2".to_string()));
    }

    #[tokio::test]
    async fn non_success_status_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/refresh"))
            .respond_with(ResponseTemplate::new(401).set_body_string("refresh expired"))
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(
            exchanger_for(&server).exchange().await,
            Err(RefreshError::Rejected {
                status: 401,
                body: "refresh expired".to_string()
            })
        );
    }

    #[tokio::test]
    async fn body_without_token_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })))
            .mount(&server)
            .await;

        let outcome = exchanger_for(&server).exchange().await;
        assert!(matches!(outcome, Err(RefreshError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn unreachable_authority_is_transport_failure() {
        let client = reqwest::Client::builder().no_proxy().build().expect("client");
        let url = Url::parse("http://127.0.0.1:1/api/v1/auth/refresh").expect("url");
        let exchanger = TokenExchanger::new(ClientBuilder::new(client).build(), url);

        assert!(matches!(
            exchanger.exchange().await,
            Err(RefreshError::Transport(_))
        ));
    }
}
