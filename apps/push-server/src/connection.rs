//! The connection contract the push core sends through.
//!
//! A connection's lifecycle belongs to the transport (see [`crate::gateway`]);
//! the routing table and broadcast tasks only hold `Arc<dyn Connection>`
//! handles and must treat every handle as possibly stale.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

/// Client families. A user holds at most one route per client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Mobile,
    Pc,
    Web,
    Unknown,
}

impl ClientType {
    /// Derive the client type from the OS name reported at handshake.
    pub fn from_os_name(os_name: Option<&str>) -> Self {
        let Some(os) = os_name.map(str::to_ascii_lowercase) else {
            return ClientType::Unknown;
        };
        if os.contains("android") || os.contains("ios") {
            ClientType::Mobile
        } else if os.contains("windows") || os.contains("mac") || os.contains("linux") {
            ClientType::Pc
        } else if os.contains("web") || os.contains("h5") || os.contains("browser") {
            ClientType::Web
        } else {
            ClientType::Unknown
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientType::Mobile => "mobile",
            ClientType::Pc => "pc",
            ClientType::Web => "web",
            ClientType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Session attributes established when a client completes its handshake.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: String,
    pub tags: HashSet<String>,
    pub client_version: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub client_type: ClientType,
    pub heartbeat: Duration,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tags: HashSet::new(),
            client_version: None,
            os_name: None,
            os_version: None,
            client_type: ClientType::Unknown,
            heartbeat: Duration::ZERO,
        }
    }
}

/// The content of a push as handed to a connection.
#[derive(Debug, Clone, Serialize)]
pub struct PushPayload {
    pub message_id: String,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    Backpressure,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("send dropped before completion")]
    Dropped,
}

type CompletionFn = Box<dyn FnOnce(Result<(), SendError>) + Send + 'static>;

/// One-shot completion handle for a single send.
///
/// Whoever ends up holding the handle must call [`SendCompletion::complete`].
/// If it is dropped instead (a queue torn down with sends still in it), the
/// callback runs with [`SendError::Dropped`], so every issued send resolves
/// exactly once.
pub struct SendCompletion {
    callback: Option<CompletionFn>,
}

impl SendCompletion {
    pub fn new(callback: impl FnOnce(Result<(), SendError>) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn complete(mut self, result: Result<(), SendError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for SendCompletion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(SendError::Dropped));
        }
    }
}

impl fmt::Debug for SendCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendCompletion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// A live client connection as seen by the push core.
pub trait Connection: Send + Sync {
    fn id(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Transport-level backpressure signal: false while the outbound queue
    /// is above its high-water mark.
    fn is_writable(&self) -> bool;

    fn session_context(&self) -> &SessionContext;

    /// Hand a push to the transport. Never blocks; the outcome is reported
    /// through `completion`, possibly from another task.
    fn send(&self, payload: Arc<PushPayload>, completion: SendCompletion);

    /// Ask the transport to close the connection.
    fn close(&self, reason: &str);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn client_type_from_os_name() {
        assert_eq!(ClientType::from_os_name(Some("Android")), ClientType::Mobile);
        assert_eq!(ClientType::from_os_name(Some("iOS")), ClientType::Mobile);
        assert_eq!(ClientType::from_os_name(Some("Windows 11")), ClientType::Pc);
        assert_eq!(ClientType::from_os_name(Some("macOS")), ClientType::Pc);
        assert_eq!(ClientType::from_os_name(Some("web")), ClientType::Web);
        assert_eq!(ClientType::from_os_name(Some("toaster")), ClientType::Unknown);
        assert_eq!(ClientType::from_os_name(None), ClientType::Unknown);
    }

    #[test]
    fn completion_runs_once_with_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let completion = SendCompletion::new(move |result| {
            assert_eq!(result, Ok(()));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        completion.complete(Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_completion_reports_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let completion = SendCompletion::new(move |result| {
            assert_eq!(result, Err(SendError::Dropped));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        drop(completion);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
