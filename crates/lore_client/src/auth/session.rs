use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session could not be refreshed; the user has to log in again at `redirect`.
    Expired { redirect: String },
}

/// Receives the forced-logout signal raised when a refresh exchange fails.
pub trait SessionSink: Send + Sync {
    fn session_expired(&self, redirect: &str);
}

#[derive(Debug, Default, Clone)]
pub struct LoggingSessionSink;

impl SessionSink for LoggingSessionSink {
    fn session_expired(&self, redirect: &str) {
        warn!("Session expired, login required at {}", redirect);
    }
}

/// Forwards session events to whoever owns navigation.
#[derive(Debug, Clone)]
pub struct ChannelSessionSink {
    tx: UnboundedSender<SessionEvent>,
}

impl ChannelSessionSink {
    pub fn new(tx: UnboundedSender<SessionEvent>) -> Self {
        ChannelSessionSink { tx }
    }
}

impl SessionSink for ChannelSessionSink {
    fn session_expired(&self, redirect: &str) {
        let event = SessionEvent::Expired {
            redirect: redirect.to_string(),
        };
        if self.tx.send(event).is_err() {
            debug!("Session event receiver dropped; expiry to {} not delivered", redirect);
        }
    }
}
