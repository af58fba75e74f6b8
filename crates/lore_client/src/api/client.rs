use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, Method, Proxy, Response, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::policies::ExponentialBackoff;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::api::middleware::{
    BearerAuthMiddleware, RefreshOnUnauthorizedMiddleware, TransientRetryMiddleware,
};
use crate::auth::credential_store::{CredentialStore, KeyValueStore};
use crate::auth::refresh::RefreshCoordinator;
use crate::auth::session::SessionSink;
use crate::auth::token_exchange::TokenExchanger;
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::utils::http_utils::{endpoint_url, ensure_success, log_transport_error};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub user_type: String,
}

/// HTTP client for the studio API that keeps its session alive.
///
/// Every request carries the stored bearer token. A 401 triggers one refresh
/// exchange shared by all concurrent callers, after which the request is
/// replayed once. If the exchange fails the stored session is cleared and the
/// session sink is told to send the user to the login page.
#[derive(Clone)]
pub struct ApiClient {
    client: Arc<ClientWithMiddleware>,
    plain: ClientWithMiddleware,
    credentials: CredentialStore,
    coordinator: Arc<RefreshCoordinator>,
    refresher: Arc<RefreshOnUnauthorizedMiddleware>,
    config: Config,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("api_base", &self.config.api_base)
            .field("credentials", &self.credentials)
            .field("refreshing", &self.coordinator.is_refreshing())
            .finish()
    }
}

impl ApiClient {
    pub fn new(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        session: Arc<dyn SessionSink>,
    ) -> Result<Self> {
        let coordinator =
            Arc::new(RefreshCoordinator::new().with_exchange_timeout(config.refresh_timeout()));
        Self::with_coordinator(config, store, session, coordinator)
    }

    /// Builds a client that shares `coordinator` (and so its single-flight scope)
    /// with whoever else holds it.
    ///
    /// Each client applies a shared attempt's outcome to its own `store` and,
    /// on failure, notifies its own `session` sink.
    pub fn with_coordinator(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        session: Arc<dyn SessionSink>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Result<Self> {
        let http = Self::build_http_client(&config)?;
        let credentials = CredentialStore::new(store);

        // Shares the cookie jar with `http`, so the refresh cookie rides along.
        let plain = ClientBuilder::new(http.clone()).build();
        let exchanger = TokenExchanger::new(
            plain.clone(),
            endpoint_url(&config.api_base, &config.refresh_path)?,
        );
        let refresher = Arc::new(RefreshOnUnauthorizedMiddleware::new(
            Arc::clone(&coordinator),
            exchanger,
            credentials.clone(),
            session,
            config.login_redirect.clone(),
        ));

        let client = ClientBuilder::new(http)
            .with_arc(refresher.clone())
            .with(BearerAuthMiddleware::new(credentials.clone()))
            .with(TransientRetryMiddleware::new(Self::build_retry_policy(
                config.max_retries,
            )))
            .build();

        Ok(ApiClient {
            client: Arc::new(client),
            plain,
            credentials,
            coordinator,
            refresher,
            config,
        })
    }

    fn build_http_client(config: &Config) -> Result<Client> {
        let mut builder = Client::builder()
            .default_headers(Self::get_default_headers())
            .cookie_store(true);
        if !config.http_proxy.is_empty() {
            builder = builder.proxy(Proxy::http(&config.http_proxy)?);
        }
        if !config.https_proxy.is_empty() {
            builder = builder.proxy(Proxy::https(&config.https_proxy)?);
        }
        builder
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to build HTTP client: {e}")))
    }

    fn build_retry_policy(max_retries: u32) -> ExponentialBackoff {
        ExponentialBackoff::builder().build_with_max_retries(max_retries)
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut header = HeaderMap::new();
        header.insert(ACCEPT, HeaderValue::from_static("application/json"));
        header
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn url(&self, path: &str) -> Result<Url> {
        endpoint_url(&self.config.api_base, path)
    }

    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        Ok(self.client.request(method, self.url(path)?))
    }

    pub fn get(&self, path: &str) -> Result<RequestBuilder> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> Result<RequestBuilder> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> Result<RequestBuilder> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: &str) -> Result<RequestBuilder> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: &str) -> Result<RequestBuilder> {
        self.request(Method::DELETE, path)
    }

    /// Sends through the auth stack.
    ///
    /// A 401 that survives the refresh-and-replay cycle becomes
    /// [`ClientError::Unauthorized`]; any other status is returned as-is.
    pub async fn execute(&self, builder: RequestBuilder) -> Result<Response> {
        let request = builder.build()?;
        let method = request.method().clone();
        let url = request.url().to_string();
        info!("Sending {} request to {}", method, url);

        let start_time = Instant::now();
        let response = self.client.execute(request).await.map_err(|e| {
            let err = ClientError::from(e);
            if let ClientError::Http(inner) = &err {
                log_transport_error(&url, inner);
            }
            err
        })?;
        info!(
            "Got response from {} after {:?} with status {}",
            url,
            start_time.elapsed(),
            response.status()
        );

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized { url });
        }
        Ok(response)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = ensure_success(self.execute(self.get(path)?).await?).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = ensure_success(self.execute(self.post(path)?.json(body)).await?).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = ensure_success(self.execute(self.put(path)?.json(body)).await?).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = ensure_success(self.execute(self.patch(path)?.json(body)).await?).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn delete_path(&self, path: &str) -> Result<()> {
        ensure_success(self.execute(self.delete(path)?).await?).await?;
        Ok(())
    }

    /// Posts `body` to the login endpoint and stores the returned session.
    ///
    /// Sent outside the auth stack: bad credentials must not trigger a refresh.
    pub async fn login<B: Serialize + ?Sized>(&self, body: &B) -> Result<LoginResponse> {
        let url = self.url(&self.config.login_path)?;
        info!("Logging in at {}", url);
        let response = self.plain.post(url).json(body).send().await?;
        let session = ensure_success(response)
            .await?
            .json::<LoginResponse>()
            .await?;
        self.credentials
            .store_session(&session.access_token, &session.user_type)?;
        Ok(session)
    }

    /// Stores credentials obtained outside this client.
    pub fn establish_session(&self, access_token: &str, user_type: &str) -> Result<()> {
        self.credentials.store_session(access_token, user_type)
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_authenticated()
    }

    /// Tells the server the session is over (best effort) and clears local credentials.
    pub async fn logout(&self) -> Result<()> {
        let url = self.url(&self.config.logout_path)?;
        let mut request = self.plain.post(url.clone());
        if let Some(token) = self.credentials.access_token() {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) if !response.status().is_success() => {
                warn!("Logout at {} returned {}", url, response.status());
            }
            Err(e) => warn!("Logout at {} failed: {}", url, e),
            Ok(_) => {}
        }
        self.credentials.clear()
    }

    /// Refreshes the access token now, joining any refresh already in flight.
    ///
    /// Failure ends the session exactly like a failed refresh after a 401.
    pub async fn refresh_session(&self) -> Result<String> {
        Ok(self.refresher.refresh_now().await?)
    }
}
