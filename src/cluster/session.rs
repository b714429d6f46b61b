use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::protocol::{Message, WorkerStatus};
use crate::engine::control::TaskControl;
use crate::engine::task::TestCase;
use crate::engine::LoadGenerator;

/// The task assigned on one connection and the run driving it, if any.
pub struct TaskSession {
    generator: Arc<LoadGenerator>,
    outbound: UnboundedSender<Message>,
    task: Option<Arc<TestCase>>,
    control: Arc<TaskControl>,
    run: Option<JoinHandle<()>>,
}

impl TaskSession {
    pub fn new(generator: Arc<LoadGenerator>, outbound: UnboundedSender<Message>) -> Self {
        Self {
            generator,
            outbound,
            task: None,
            control: Arc::new(TaskControl::new()),
            run: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.is_finished())
    }

    fn reply(&self, status: WorkerStatus) {
        let _ = self.outbound.send(Message::status(status));
    }

    /// Replace the current task. A run of the previous task is stopped and reports nothing
    /// further.
    pub fn assign(&mut self, test_case: TestCase) {
        if self.control.stop() && self.is_running() {
            info!("New task received, stopping the current run");
        }
        // The stopped run may still finish an in-flight request; it no longer blocks Start.
        self.run = None;
        info!(
            "Task assigned: {} requests, repeat={}, concurrency={}, qps={}",
            test_case.request_body_list.len(),
            test_case.repeat,
            test_case.concurrency_count,
            test_case.qps
        );
        self.task = Some(Arc::new(test_case));
        self.control = Arc::new(TaskControl::new());
        self.reply(WorkerStatus::Ready);
    }

    /// Start the assigned task in the background and stream its results. `Finished` follows
    /// when the run completes on its own.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!("Start received while a run is in progress, ignoring");
            return;
        }
        let Some(task) = self.task.clone() else {
            warn!("Start received without a task");
            self.reply(WorkerStatus::Finished);
            return;
        };

        self.control = Arc::new(TaskControl::new());
        self.reply(WorkerStatus::Working);

        let generator = self.generator.clone();
        let control = self.control.clone();
        let outbound = self.outbound.clone();

        self.run = Some(tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let forward = async {
                while let Some(result) = rx.recv().await {
                    if outbound.send(Message::run_result(result)).is_err() {
                        break;
                    }
                }
            };
            let (summary, _) = tokio::join!(generator.run(task, control, tx), forward);

            if !summary.stopped {
                let _ = outbound.send(Message::status(WorkerStatus::Finished));
            }
        }));
    }

    /// Stop the current run and report `Finished`. Repeated stops are ignored.
    pub fn stop(&mut self) {
        if self.control.stop() {
            info!("Stop received");
            self.reply(WorkerStatus::Finished);
        } else {
            info!("Stop received, task already stopped");
        }
    }

    /// Connection lost or worker shutting down: stop without reporting.
    pub fn abort(&mut self) {
        if self.control.stop() && self.is_running() {
            warn!("Stopping the current run");
        }
    }
}
