//! The broadcast push task.
//!
//! One task per broadcast. Each scheduler invocation runs one pass: it walks
//! the routing cursor from where the previous pass stopped, filters
//! recipients, heals stale routes, issues sends until the flow policy says
//! the pass is full, and then either asks to be re-run after a delay or
//! closes the send phase. Completion of the individual sends is tracked in
//! [`BroadcastState`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::condition::{Condition, RecipientContext};
use crate::connection::{Connection, PushPayload};
use crate::router::{RouteCursor, RoutingTable};

use super::completion::{BroadcastListener, BroadcastState};
use super::flow::FlowControl;
use super::message::PushMessage;
use super::scheduler::{PushTask, TaskOutcome};

/// Passes beyond this one don't get their own timeline checkpoint.
const MAX_PASS_CHECKPOINTS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed, not yet run.
    Idle,
    /// A pass is in progress.
    Running,
    /// The last pass hit the ceiling; waiting to be re-run.
    AwaitingRetry,
    /// No more sends will be issued; waiting for issued sends to resolve.
    Draining,
    /// The report has fired.
    Done,
}

/// Why a pass stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassEnd {
    Exhausted,
    CeilingReached,
    LimitReached,
    Cancelled,
}

pub struct BroadcastPushTask {
    shared: Arc<BroadcastState>,
    payload: Arc<PushPayload>,
    cursor: RouteCursor,
    routers: Arc<RoutingTable>,
    cancel: CancellationToken,
    issued: u64,
    phase: TaskState,
}

impl BroadcastPushTask {
    /// Snapshot the routing table and prepare the broadcast. Nothing is sent
    /// until the task is run.
    pub fn new(
        message: Arc<PushMessage>,
        routers: Arc<RoutingTable>,
        flow: Box<dyn FlowControl>,
        listener: Arc<dyn BroadcastListener>,
        cancel: CancellationToken,
    ) -> Self {
        let payload = message.payload();
        let cursor = routers.routers();
        Self {
            shared: BroadcastState::new(message, flow, listener),
            payload,
            cursor,
            routers,
            cancel,
            issued: 0,
            phase: TaskState::Idle,
        }
    }

    pub fn state(&self) -> TaskState {
        match self.phase {
            TaskState::Draining if self.shared.is_reported() => TaskState::Done,
            phase => phase,
        }
    }

    pub fn shared(&self) -> &Arc<BroadcastState> {
        &self.shared
    }

    /// Sends issued so far, across all passes.
    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn snapshot_len(&self) -> usize {
        self.cursor.snapshot_len()
    }

    fn broadcast(&mut self) -> PassEnd {
        let shared = self.shared.clone();
        let message = shared.message();
        let mut flow = shared.flow();
        flow.reset_pass();

        let mut end = PassEnd::Exhausted;
        while let Some(entry) = self.cursor.next() {
            let connection = entry.router.connection();

            if !matches_condition(&message.condition, connection.as_ref()) {
                continue;
            }

            if !connection.is_connected() {
                tracing::warn!(
                    message_id = %message.id,
                    user_id = %entry.user_id,
                    client_type = %entry.client_type,
                    connection_id = %connection.id(),
                    "route found but connection is disconnected, removing it"
                );
                self.routers.unregister_connection(
                    &entry.user_id,
                    entry.client_type,
                    connection.id(),
                );
                continue;
            }

            // Backpressured recipients are skipped for the whole broadcast:
            // the cursor never comes back to them.
            if !connection.is_writable() {
                tracing::debug!(
                    message_id = %message.id,
                    user_id = %entry.user_id,
                    connection_id = %connection.id(),
                    "connection not writable, skipping"
                );
                continue;
            }

            let completion = shared.completion_for(entry.user_id);
            connection.send(self.payload.clone(), completion);

            let within_ceiling = flow.check_qps();
            if flow.limit_reached() {
                end = PassEnd::LimitReached;
                break;
            }
            if !within_ceiling {
                end = PassEnd::CeilingReached;
                break;
            }
        }

        self.issued += flow.total();
        end
    }
}

impl PushTask for BroadcastPushTask {
    fn run(&mut self) -> TaskOutcome {
        if matches!(self.phase, TaskState::Draining | TaskState::Done) {
            return TaskOutcome::Finished;
        }
        self.phase = TaskState::Running;
        let pass = self.shared.record_pass();

        let end = if self.cancel.is_cancelled() {
            PassEnd::Cancelled
        } else {
            self.broadcast()
        };

        if pass <= MAX_PASS_CHECKPOINTS {
            self.shared.checkpoint(&format!("pass-{pass}"));
        }

        let send_phase_done = match end {
            PassEnd::Exhausted | PassEnd::LimitReached => true,
            PassEnd::Cancelled => {
                tracing::info!(
                    message_id = %self.shared.message().id,
                    issued = self.issued,
                    "broadcast cancelled"
                );
                self.shared.mark_cancelled();
                true
            }
            PassEnd::CeilingReached => !self.cursor.has_next(),
        };

        if send_phase_done {
            self.phase = TaskState::Draining;
            self.shared.seal(self.issued);
            return TaskOutcome::Finished;
        }

        self.phase = TaskState::AwaitingRetry;
        let delay = self.shared.flow().delay();
        tracing::debug!(
            message_id = %self.shared.message().id,
            pass,
            issued = self.issued,
            delay_ms = delay.as_millis() as u64,
            "broadcast pass hit flow ceiling, rescheduling"
        );
        TaskOutcome::Retry(delay)
    }

    fn lane_key(&self) -> u64 {
        self.shared.message().lane_key
    }
}

/// `Always` is decided without looking at the session at all.
fn matches_condition(condition: &Condition, connection: &dyn Connection) -> bool {
    if condition.is_always() {
        return true;
    }
    condition.test(&RecipientContext::from(connection.session_context()))
}
