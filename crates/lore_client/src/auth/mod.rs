//! Session credentials and their renewal
//!
//! Refresh flow:
//! 1. A business call comes back 401
//! 2. The first such caller exchanges the refresh cookie for a new access token
//! 3. Callers arriving meanwhile queue behind it
//! 4. Everyone replays with the new token, or the session is torn down

pub mod credential_store;
pub mod refresh;
pub mod session;
pub mod token_exchange;

pub use credential_store::{CredentialStore, FileStore, KeyValueStore, MemoryStore};
pub use refresh::{Continuation, RefreshCoordinator, RefreshOutcome, Settlement};
pub use session::{ChannelSessionSink, LoggingSessionSink, SessionEvent, SessionSink};
pub use token_exchange::TokenExchanger;
