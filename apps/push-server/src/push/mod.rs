//! Broadcast push engine: flow control, the per-broadcast task, completion
//! accounting and the lane scheduler that runs it all.

pub mod completion;
pub mod flow;
pub mod message;
pub mod scheduler;
pub mod task;

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

pub use completion::{BroadcastListener, BroadcastReport, BroadcastState, ReportStore};
pub use flow::{FastFlowControl, FlowControl, FlowSettings, UnlimitedFlowControl};
pub use message::PushMessage;
pub use scheduler::{PushScheduler, PushTask, SchedulerError, TaskOutcome};
pub use task::{BroadcastPushTask, TaskState};

use crate::router::RoutingTable;

/// Entry point for starting broadcasts.
///
/// Builds a fresh flow policy and task per broadcast, hands the task to the
/// scheduler, and keeps a cancellation handle for every broadcast that has
/// not reported yet.
pub struct PushCenter {
    routers: Arc<RoutingTable>,
    scheduler: Arc<PushScheduler>,
    default_flow: FlowSettings,
    active: Arc<DashMap<String, CancellationToken>>,
    listener: Arc<TrackingListener>,
}

/// Passes the report on, then drops the broadcast's cancellation handle.
struct TrackingListener {
    active: Arc<DashMap<String, CancellationToken>>,
    downstream: Arc<dyn BroadcastListener>,
}

impl BroadcastListener for TrackingListener {
    fn on_broadcast_complete(&self, message: &PushMessage, report: BroadcastReport) {
        self.downstream.on_broadcast_complete(message, report);
        self.active.remove(&message.id);
    }
}

impl PushCenter {
    pub fn new(
        routers: Arc<RoutingTable>,
        scheduler: Arc<PushScheduler>,
        default_flow: FlowSettings,
        listener: Arc<dyn BroadcastListener>,
    ) -> Self {
        let active = Arc::new(DashMap::new());
        Self {
            routers,
            scheduler,
            default_flow,
            listener: Arc::new(TrackingListener {
                active: active.clone(),
                downstream: listener,
            }),
            active,
        }
    }

    /// Start broadcasting `message`. Returns its id; the report arrives at
    /// the listener later.
    pub fn broadcast(&self, message: PushMessage) -> Result<String, SchedulerError> {
        let message = Arc::new(message);
        let message_id = message.id.clone();
        let flow = message.flow.unwrap_or(self.default_flow).build();
        let cancel = CancellationToken::new();

        self.active.insert(message_id.clone(), cancel.clone());
        let task = BroadcastPushTask::new(
            message,
            self.routers.clone(),
            flow,
            self.listener.clone(),
            cancel,
        );

        tracing::info!(
            message_id = %message_id,
            users = task.snapshot_len(),
            "broadcast submitted"
        );

        if let Err(err) = self.scheduler.run_now(Box::new(task)) {
            self.active.remove(&message_id);
            return Err(err);
        }
        Ok(message_id)
    }

    /// Request cancellation. Takes effect at the start of the broadcast's
    /// next pass; sends already issued still resolve and the report still
    /// fires. Returns false if the broadcast is unknown or already reported.
    pub fn cancel(&self, message_id: &str) -> bool {
        match self.active.get(message_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(message_id = %message_id, "broadcast cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, message_id: &str) -> bool {
        self.active.contains_key(message_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn default_flow(&self) -> FlowSettings {
        self.default_flow
    }

    pub fn scheduler(&self) -> &Arc<PushScheduler> {
        &self.scheduler
    }
}
