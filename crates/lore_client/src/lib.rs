pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod utils;

pub use api::client::{ApiClient, LoginResponse};
pub use api::middleware::{
    BearerAuthMiddleware, PendingRequest, RefreshOnUnauthorizedMiddleware, TransientRetryMiddleware,
};
pub use auth::credential_store::{CredentialStore, FileStore, KeyValueStore, MemoryStore};
pub use auth::refresh::{RefreshCoordinator, Settlement};
pub use auth::session::{ChannelSessionSink, LoggingSessionSink, SessionEvent, SessionSink};
pub use auth::token_exchange::TokenExchanger;
pub use config::Config;
pub use error::{ClientError, RefreshError, Result};
