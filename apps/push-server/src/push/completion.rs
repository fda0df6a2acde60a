//! Completion accounting for a broadcast.
//!
//! Sends complete on the connections' writer tasks while the broadcast's
//! passes run on a scheduler lane. Both sides meet in [`BroadcastState`]:
//! completions decrement an atomic outstanding counter, and the pass that
//! exhausts the cursor adds the total number of issued sends to it exactly
//! once. The one transition that lands the counter on zero after that
//! addition fires the report, behind a compare-and-set latch.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use push_common::{TimeLine, TimePoint};
use serde::Serialize;

use crate::connection::{SendCompletion, SendError};

use super::flow::FlowControl;
use super::message::PushMessage;

/// Summary delivered to the broadcast's originator once every issued send
/// has resolved.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    pub message_id: String,
    pub timeline: Vec<TimePoint>,
    pub elapsed_ms: u64,
    pub success_user_ids: Vec<String>,
    pub issued: u64,
    pub failed: u64,
    pub passes: u32,
    pub cancelled: bool,
    pub finished_at: DateTime<Utc>,
}

/// Receives the completion report of every broadcast, exactly once each.
pub trait BroadcastListener: Send + Sync {
    fn on_broadcast_complete(&self, message: &PushMessage, report: BroadcastReport);
}

/// State shared between a broadcast task and its in-flight sends.
pub struct BroadcastState {
    message: Arc<PushMessage>,
    outstanding: AtomicI64,
    issued: AtomicU64,
    sealed: AtomicBool,
    reported: AtomicBool,
    cancelled: AtomicBool,
    passes: AtomicU32,
    failed: AtomicU64,
    successes: Mutex<HashSet<String>>,
    timeline: Mutex<TimeLine>,
    flow: Mutex<Box<dyn FlowControl>>,
    listener: Arc<dyn BroadcastListener>,
}

impl BroadcastState {
    pub fn new(
        message: Arc<PushMessage>,
        flow: Box<dyn FlowControl>,
        listener: Arc<dyn BroadcastListener>,
    ) -> Arc<Self> {
        let mut timeline = TimeLine::new();
        timeline.begin();
        Arc::new(Self {
            message,
            outstanding: AtomicI64::new(0),
            issued: AtomicU64::new(0),
            sealed: AtomicBool::new(false),
            reported: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            passes: AtomicU32::new(0),
            failed: AtomicU64::new(0),
            successes: Mutex::new(HashSet::with_capacity(1024)),
            timeline: Mutex::new(timeline),
            flow: Mutex::new(flow),
            listener,
        })
    }

    pub fn message(&self) -> &Arc<PushMessage> {
        &self.message
    }

    /// The broadcast's flow policy. Only the lane running the broadcast's
    /// passes locks this, plus the reporter once at the very end.
    pub fn flow(&self) -> MutexGuard<'_, Box<dyn FlowControl>> {
        self.flow.lock()
    }

    pub fn checkpoint(&self, name: &str) {
        self.timeline.lock().add(name);
    }

    pub fn record_pass(&self) -> u32 {
        self.passes.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn passes(&self) -> u32 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_reported(&self) -> bool {
        self.reported.load(Ordering::Acquire)
    }

    /// Completion handle for a send to `user_id`.
    pub fn completion_for(self: &Arc<Self>, user_id: String) -> SendCompletion {
        let state = self.clone();
        SendCompletion::new(move |result| state.on_send_complete(user_id, result))
    }

    fn on_send_complete(&self, user_id: String, result: Result<(), SendError>) {
        match result {
            Ok(()) => {
                tracing::debug!(
                    message_id = %self.message.id,
                    user_id = %user_id,
                    "broadcast push delivered"
                );
                self.successes.lock().insert(user_id);
            }
            Err(err) => {
                tracing::warn!(
                    message_id = %self.message.id,
                    user_id = %user_id,
                    error = %err,
                    "broadcast push failed"
                );
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    /// Close the send phase: no more sends will be issued for this
    /// broadcast. Adds `issued` to the outstanding counter once; fires the
    /// report right away if every send has already resolved.
    pub fn seal(&self, issued: u64) {
        if self.sealed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.issued.store(issued, Ordering::Relaxed);
        self.checkpoint("sent");
        let issued = issued as i64;
        if self.outstanding.fetch_add(issued, Ordering::AcqRel) + issued == 0 {
            self.fire();
        }
    }

    fn fire(&self) {
        if self
            .reported
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let successes = std::mem::take(&mut *self.successes.lock());
        {
            let mut flow = self.flow.lock();
            flow.end(&successes);
        }

        let (timeline, elapsed_ms) = {
            let mut timeline = self.timeline.lock();
            timeline.end();
            (
                timeline.points().to_vec(),
                timeline.elapsed_ms().max(0) as u64,
            )
        };

        let mut success_user_ids: Vec<String> = successes.into_iter().collect();
        success_user_ids.sort();

        let report = BroadcastReport {
            message_id: self.message.id.clone(),
            timeline,
            elapsed_ms,
            success_user_ids,
            issued: self.issued.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            passes: self.passes(),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            finished_at: Utc::now(),
        };

        tracing::info!(
            message_id = %report.message_id,
            elapsed_ms = report.elapsed_ms,
            issued = report.issued,
            delivered = report.success_user_ids.len(),
            failed = report.failed,
            passes = report.passes,
            cancelled = report.cancelled,
            "broadcast finished"
        );

        self.listener.on_broadcast_complete(&self.message, report);
    }
}

/// Keeps the most recent broadcast reports for lookup by message id.
pub struct ReportStore {
    capacity: usize,
    reports: Mutex<VecDeque<Arc<BroadcastReport>>>,
}

impl ReportStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            reports: Mutex::new(VecDeque::new()),
        }
    }

    pub fn get(&self, message_id: &str) -> Option<Arc<BroadcastReport>> {
        self.reports
            .lock()
            .iter()
            .rev()
            .find(|r| r.message_id == message_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl BroadcastListener for ReportStore {
    fn on_broadcast_complete(&self, _message: &PushMessage, report: BroadcastReport) {
        let mut reports = self.reports.lock();
        reports.push_back(Arc::new(report));
        while reports.len() > self.capacity {
            reports.pop_front();
        }
    }
}
