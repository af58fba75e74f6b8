use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use http::Extensions;
use log::{debug, error, warn};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use crate::auth::credential_store::CredentialStore;
use crate::auth::refresh::{RefreshCoordinator, RefreshOutcome};
use crate::auth::session::SessionSink;
use crate::auth::token_exchange::TokenExchanger;
use crate::error::RefreshError;

/// Credential obtained by a refresh, pinned onto the replay of one request so it
/// is sent with exactly that token regardless of later store changes.
#[derive(Debug, Clone)]
struct PinnedCredential(String);

/// Sets `Authorization: Bearer <token>` from the credential store.
///
/// Requests go out unauthenticated when no token is stored; the server decides.
#[derive(Debug, Clone)]
pub struct BearerAuthMiddleware {
    credentials: CredentialStore,
}

impl BearerAuthMiddleware {
    pub fn new(credentials: CredentialStore) -> Self {
        BearerAuthMiddleware { credentials }
    }
}

#[async_trait]
impl Middleware for BearerAuthMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let token = match extensions.get::<PinnedCredential>() {
            Some(pinned) => Some(pinned.0.clone()),
            None => self.credentials.access_token(),
        };

        if let Some(token) = token {
            match HeaderValue::from_str(&format!("Bearer {}", token)) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    req.headers_mut().insert(AUTHORIZATION, value);
                }
                Err(e) => {
                    warn!("Stored access token is not a valid header value, sending without it: {}", e);
                }
            }
        }

        next.run(req, extensions).await
    }
}

/// Transient retries for requests that can be resent.
///
/// Streamed bodies cannot be cloned, which `RetryTransientMiddleware` rejects
/// outright; those requests go out once without retries instead.
pub struct TransientRetryMiddleware {
    inner: RetryTransientMiddleware<ExponentialBackoff>,
}

impl TransientRetryMiddleware {
    pub fn new(policy: ExponentialBackoff) -> Self {
        TransientRetryMiddleware {
            inner: RetryTransientMiddleware::new_with_policy(policy),
        }
    }
}

#[async_trait]
impl Middleware for TransientRetryMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        if req.try_clone().is_none() {
            debug!("Sending streamed request to {} without transient retries", req.url());
            return next.run(req, extensions).await;
        }
        self.inner.handle(req, extensions, next).await
    }
}

/// An outbound call captured before sending so it can be replayed once.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    replay: Option<Request>,
    retried: bool,
}

impl PendingRequest {
    /// `replay` is `None` when the body is a stream and cannot be cloned.
    pub fn capture(id: u64, req: &Request) -> Self {
        PendingRequest {
            id,
            replay: req.try_clone(),
            retried: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// Marks the request retried and hands out its replay. Yields at most once.
    pub fn begin_retry(&mut self) -> Option<Request> {
        if self.retried {
            return None;
        }
        self.retried = true;
        self.replay.take()
    }
}

/// Recovers from 401 by refreshing the access token through the shared
/// [`RefreshCoordinator`] and replaying the request once.
///
/// A successful exchange is written to this middleware's credential store even
/// when another client sharing the coordinator ran it. A failed exchange clears
/// the store and notifies the session sink, once per attempt no matter how many
/// requests queued.
pub struct RefreshOnUnauthorizedMiddleware {
    coordinator: Arc<RefreshCoordinator>,
    exchanger: TokenExchanger,
    credentials: CredentialStore,
    session: Arc<dyn SessionSink>,
    login_redirect: String,
    next_request_id: AtomicU64,
    /// Latest attempt whose failure already ended this session.
    ended_attempt: AtomicU64,
}

impl RefreshOnUnauthorizedMiddleware {
    pub fn new(
        coordinator: Arc<RefreshCoordinator>,
        exchanger: TokenExchanger,
        credentials: CredentialStore,
        session: Arc<dyn SessionSink>,
        login_redirect: impl Into<String>,
    ) -> Self {
        RefreshOnUnauthorizedMiddleware {
            coordinator,
            exchanger,
            credentials,
            session,
            login_redirect: login_redirect.into(),
            next_request_id: AtomicU64::new(1),
            ended_attempt: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Joins or leads a refresh and applies its outcome to this session.
    pub(crate) async fn refresh(&self, request_id: u64) -> RefreshOutcome {
        let settlement = self
            .coordinator
            .refresh(request_id, || {
                exchange_and_persist(&self.exchanger, &self.credentials)
            })
            .await;

        match settlement.outcome {
            Ok(token) if !settlement.led => self.adopt(token),
            Err(RefreshError::Abandoned) => Err(RefreshError::Abandoned),
            Err(err) => {
                if self.ended_attempt.fetch_max(settlement.attempt, Ordering::SeqCst)
                    < settlement.attempt
                {
                    self.end_session(&err);
                }
                Err(err)
            }
            outcome => outcome,
        }
    }

    /// Stores a token refreshed by another caller, unless this store already has it.
    fn adopt(&self, token: String) -> RefreshOutcome {
        if self.credentials.access_token().as_deref() != Some(token.as_str()) {
            debug!("Storing access token refreshed by a shared coordinator");
            self.credentials
                .set_access_token(&token)
                .map_err(|e| RefreshError::Storage(e.to_string()))?;
        }
        Ok(token)
    }

    /// Proactive refresh not tied to a failed request.
    pub(crate) async fn refresh_now(&self) -> RefreshOutcome {
        self.refresh(self.next_id()).await
    }

    fn end_session(&self, cause: &RefreshError) {
        error!("Session could not be refreshed, logging out: {}", cause);
        if let Err(e) = self.credentials.clear() {
            error!("Failed to clear stored credentials: {}", e);
        }
        self.session.session_expired(&self.login_redirect);
    }
}

async fn exchange_and_persist(
    exchanger: &TokenExchanger,
    credentials: &CredentialStore,
) -> RefreshOutcome {
    let token = exchanger.exchange().await?;
    credentials
        .set_access_token(&token)
        .map_err(|e| RefreshError::Storage(e.to_string()))?;
    Ok(token)
}

#[async_trait]
impl Middleware for RefreshOnUnauthorizedMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let mut pending = PendingRequest::capture(self.next_id(), &req);
        let response = next.clone().run(req, extensions).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(replay) = pending.begin_retry() else {
            // Renew the session for later calls, but hand this 401 back as-is.
            warn!(
                "Request {} to {} got 401 and cannot be replayed",
                pending.id(),
                response.url()
            );
            return match self.refresh(pending.id()).await {
                Ok(_) => Ok(response),
                Err(err) => Err(reqwest_middleware::Error::Middleware(anyhow::Error::new(err))),
            };
        };
        debug!("Request {} to {} got 401, refreshing", pending.id(), response.url());
        drop(response);

        match self.refresh(pending.id()).await {
            Ok(token) => {
                debug!("Replaying request {} with refreshed credential", pending.id());
                extensions.insert(PinnedCredential(token));
                next.run(replay, extensions).await
            }
            Err(err) => Err(reqwest_middleware::Error::Middleware(anyhow::Error::new(err))),
        }
    }
}
