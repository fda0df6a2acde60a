#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use push_server::config::Config;
use push_server::connection::{
    ClientType, Connection, PushPayload, SendCompletion, SendError, SessionContext,
};
use push_server::push::{BroadcastListener, BroadcastReport, PushMessage};
use push_server::router::{LocalRouter, RoutingTable};
use push_server::AppState;

/// How a [`MockConnection`] resolves the sends it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Succeed,
    Fail,
    /// Hold the completion until the test resolves it.
    Defer,
    /// Drop the completion without resolving it.
    Drop,
}

pub struct MockConnection {
    id: String,
    context: SessionContext,
    connected: AtomicBool,
    writable: AtomicBool,
    mode: Mutex<SendMode>,
    sends: AtomicUsize,
    received: Mutex<Vec<String>>,
    deferred: Mutex<Vec<SendCompletion>>,
    closed_with: Mutex<Option<String>>,
}

impl MockConnection {
    pub fn new(id: &str, user_id: &str) -> Self {
        Self::with_context(id, SessionContext::new(user_id))
    }

    pub fn with_context(id: &str, mut context: SessionContext) -> Self {
        if context.client_type == ClientType::Unknown {
            context.client_type = ClientType::from_os_name(context.os_name.as_deref());
        }
        Self {
            id: id.to_string(),
            context,
            connected: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            mode: Mutex::new(SendMode::Succeed),
            sends: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
            closed_with: Mutex::new(None),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    pub fn set_mode(&self, mode: SendMode) {
        *self.mode.lock() = mode;
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    pub fn take_deferred(&self) -> Vec<SendCompletion> {
        std::mem::take(&mut *self.deferred.lock())
    }

    pub fn closed_with(&self) -> Option<String> {
        self.closed_with.lock().clone()
    }
}

impl Connection for MockConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    fn session_context(&self) -> &SessionContext {
        &self.context
    }

    fn send(&self, payload: Arc<PushPayload>, completion: SendCompletion) {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.received.lock().push(payload.message_id.clone());
        let mode = *self.mode.lock();
        match mode {
            SendMode::Succeed => completion.complete(Ok(())),
            SendMode::Fail => completion.complete(Err(SendError::Transport("boom".into()))),
            SendMode::Defer => self.deferred.lock().push(completion),
            SendMode::Drop => drop(completion),
        }
    }

    fn close(&self, reason: &str) {
        self.set_connected(false);
        *self.closed_with.lock() = Some(reason.to_string());
    }
}

/// Register `count` users `u0..` with one connection each.
pub fn populate(table: &RoutingTable, count: usize) -> Vec<Arc<MockConnection>> {
    (0..count)
        .map(|i| register(table, &format!("u{i}"), None))
        .collect()
}

/// Register one connection for `user_id`, optionally with an OS name.
pub fn register(table: &RoutingTable, user_id: &str, os_name: Option<&str>) -> Arc<MockConnection> {
    let mut context = SessionContext::new(user_id);
    context.os_name = os_name.map(String::from);
    let conn = Arc::new(MockConnection::with_context(
        &format!("conn_{user_id}_{}", os_name.unwrap_or("none")),
        context,
    ));
    table.register(user_id, LocalRouter::new(conn.clone()));
    conn
}

/// Listener that keeps every report and lets async tests wait for them.
#[derive(Default)]
pub struct RecordingListener {
    reports: Mutex<Vec<BroadcastReport>>,
    notify: Notify,
}

impl RecordingListener {
    pub fn reports(&self) -> Vec<BroadcastReport> {
        self.reports.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.reports.lock().len()
    }

    /// Wait until at least `n` reports arrived.
    pub async fn wait_for(&self, n: usize) -> Vec<BroadcastReport> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self.count() >= n {
                    return self.reports();
                }
                self.notify.notified().await;
            }
        })
        .await
        .expect("broadcast report did not arrive in time")
    }
}

impl BroadcastListener for RecordingListener {
    fn on_broadcast_complete(&self, _message: &PushMessage, report: BroadcastReport) {
        self.reports.lock().push(report);
        self.notify.notify_one();
    }
}

/// Config suited for tests: two lanes, short delays, small report history.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.lanes = 2;
    config.flow.min_delay = Duration::from_millis(5);
    config.flow.max_delay = Duration::from_millis(50);
    config.flow.window = Duration::from_millis(10);
    config.report_history = 16;
    config
}

/// Build a test AppState. Must run inside a tokio runtime.
pub fn test_state() -> AppState {
    AppState::new(test_config())
}
