//! Lane scheduler for push tasks.
//!
//! A fixed set of lanes, each a tokio task draining its own queue. A task is
//! pinned to the lane its key maps to, so passes of one broadcast never run
//! concurrently and tasks sharing a key run in submission order. Delayed
//! re-runs go through a timer and land back on the same lane. Each pass runs
//! on tokio's blocking pool while its lane waits for it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a task wants after one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Run again on the same lane after the delay.
    Retry(Duration),
    Finished,
}

pub trait PushTask: Send + 'static {
    fn run(&mut self) -> TaskOutcome;

    /// Key of the resource the task belongs to. Picks the lane.
    fn lane_key(&self) -> u64;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("push scheduler is shut down")]
    ShutDown,
}

type Lane = mpsc::UnboundedSender<Box<dyn PushTask>>;

pub struct PushScheduler {
    lanes: Vec<Lane>,
    shutdown: CancellationToken,
}

impl PushScheduler {
    /// Spawn `lane_count` lanes on the current tokio runtime.
    pub fn start(lane_count: usize) -> Arc<Self> {
        let lane_count = lane_count.max(1);
        let shutdown = CancellationToken::new();
        let mut lanes = Vec::with_capacity(lane_count);

        for index in 0..lane_count {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_lane(index, rx, tx.clone(), shutdown.clone()));
            lanes.push(tx);
        }

        tracing::info!(lanes = lane_count, "push scheduler started");
        Arc::new(Self { lanes, shutdown })
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane_for(&self, key: u64) -> usize {
        (key % self.lanes.len() as u64) as usize
    }

    pub fn run_now(&self, task: Box<dyn PushTask>) -> Result<(), SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        let lane = &self.lanes[self.lane_for(task.lane_key())];
        lane.send(task).map_err(|_| SchedulerError::ShutDown)
    }

    pub fn run_after_delay(
        &self,
        delay: Duration,
        task: Box<dyn PushTask>,
    ) -> Result<(), SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        let lane = self.lanes[self.lane_for(task.lane_key())].clone();
        resubmit_after(delay, task, lane, self.shutdown.clone());
        Ok(())
    }

    /// Stop every lane. Queued and delayed tasks are dropped without running.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("push scheduler shutting down");
            self.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for PushScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_lane(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<Box<dyn PushTask>>,
    lane: Lane,
    shutdown: CancellationToken,
) {
    loop {
        let mut task: Box<dyn PushTask> = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(task) => task,
                None => break,
            },
        };

        // Passes are synchronous; keep them off the async workers.
        let pass = tokio::task::spawn_blocking(move || {
            let outcome = task.run();
            (task, outcome)
        });
        let (task, outcome) = match pass.await {
            Ok(finished) => finished,
            Err(err) => {
                tracing::error!(lane = index, error = %err, "push task panicked");
                continue;
            }
        };

        match outcome {
            TaskOutcome::Finished => {}
            TaskOutcome::Retry(delay) => {
                resubmit_after(delay, task, lane.clone(), shutdown.clone());
            }
        }
    }
    tracing::debug!(lane = index, "push lane stopped");
}

fn resubmit_after(
    delay: Duration,
    task: Box<dyn PushTask>,
    lane: Lane,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                let _ = lane.send(task);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    struct RetryingTask {
        key: u64,
        retries_left: u32,
        delay: Duration,
        runs: Arc<Mutex<Vec<Instant>>>,
        done: Option<oneshot::Sender<()>>,
    }

    impl PushTask for RetryingTask {
        fn run(&mut self) -> TaskOutcome {
            self.runs.lock().push(Instant::now());
            if self.retries_left == 0 {
                if let Some(done) = self.done.take() {
                    let _ = done.send(());
                }
                return TaskOutcome::Finished;
            }
            self.retries_left -= 1;
            TaskOutcome::Retry(self.delay)
        }

        fn lane_key(&self) -> u64 {
            self.key
        }
    }

    struct LabelTask {
        key: u64,
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        done: Option<oneshot::Sender<()>>,
    }

    impl PushTask for LabelTask {
        fn run(&mut self) -> TaskOutcome {
            self.log.lock().push(self.label);
            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }
            TaskOutcome::Finished
        }

        fn lane_key(&self) -> u64 {
            self.key
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_for_requested_delay() {
        let scheduler = PushScheduler::start(2);
        let runs = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();
        scheduler
            .run_now(Box::new(RetryingTask {
                key: 7,
                retries_left: 2,
                delay: Duration::from_millis(200),
                runs: runs.clone(),
                done: Some(tx),
            }))
            .unwrap();

        rx.await.unwrap();
        let runs = runs.lock();
        assert_eq!(runs.len(), 3);
        assert!(runs[1] - runs[0] >= Duration::from_millis(200));
        assert!(runs[2] - runs[1] >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn same_key_runs_in_submission_order() {
        let scheduler = PushScheduler::start(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();
        for (label, done) in [("a", None), ("b", None), ("c", Some(tx))] {
            scheduler
                .run_now(Box::new(LabelTask {
                    key: 42,
                    label,
                    log: log.clone(),
                    done,
                }))
                .unwrap();
        }
        rx.await.unwrap();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn lane_assignment_is_key_modulo_lanes() {
        let scheduler = PushScheduler::start(3);
        assert_eq!(scheduler.lane_count(), 3);
        assert_eq!(scheduler.lane_for(0), 0);
        assert_eq!(scheduler.lane_for(4), 1);
        assert_eq!(scheduler.lane_for(u64::MAX), (u64::MAX % 3) as usize);
    }

    #[tokio::test]
    async fn run_after_delay_defers_first_run() {
        let scheduler = PushScheduler::start(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();
        let started = Instant::now();
        scheduler
            .run_after_delay(
                Duration::from_millis(30),
                Box::new(LabelTask {
                    key: 1,
                    label: "late",
                    log: log.clone(),
                    done: Some(tx),
                }),
            )
            .unwrap();
        rx.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(*log.lock(), vec!["late"]);
    }

    /// Blocks its pass until released from the async side.
    struct BlockingTask {
        release: std::sync::mpsc::Receiver<()>,
        done: Option<oneshot::Sender<()>>,
    }

    impl PushTask for BlockingTask {
        fn run(&mut self) -> TaskOutcome {
            let _ = self.release.recv();
            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }
            TaskOutcome::Finished
        }

        fn lane_key(&self) -> u64 {
            0
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn long_pass_does_not_stall_the_runtime() {
        let scheduler = PushScheduler::start(1);
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let (tx, rx) = oneshot::channel();
        scheduler
            .run_now(Box::new(BlockingTask {
                release: release_rx,
                done: Some(tx),
            }))
            .unwrap();

        // Only completes if the single runtime thread is free while the
        // pass is blocked.
        tokio::time::sleep(Duration::from_millis(20)).await;
        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("pass finished")
            .unwrap();
    }

    #[tokio::test]
    async fn submissions_after_shutdown_are_rejected() {
        let scheduler = PushScheduler::start(1);
        scheduler.shutdown();
        let err = scheduler
            .run_now(Box::new(LabelTask {
                key: 1,
                label: "x",
                log: Arc::new(Mutex::new(Vec::new())),
                done: None,
            }))
            .unwrap_err();
        assert_eq!(err, SchedulerError::ShutDown);
        assert!(scheduler.is_shut_down());
    }
}
