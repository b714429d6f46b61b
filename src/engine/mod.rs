pub mod batch;
pub mod control;
pub mod cookies;
pub mod executor;
pub mod http_client;
pub mod pacer;
pub mod task;
pub mod template;

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::bridge::{QuickJsSandbox, ScriptEvaluator};
use crate::cli::config::Config;
use crate::engine::batch::BatchRunner;
use crate::engine::control::{RunSummary, TaskControl};
use crate::engine::executor::RequestExecutor;
use crate::engine::http_client::{tls_config, HttpClient};
use crate::engine::pacer::RatePacer;
use crate::engine::task::{RunResult, TestCase};

/// Everything a worker process shares between connections and runs. Built once in `main`.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub evaluator: Arc<dyn ScriptEvaluator>,
}

impl WorkerContext {
    pub fn new(config: Config) -> Self {
        let evaluator = Arc::new(QuickJsSandbox::new(config.sandbox.clone()));
        Self::with_evaluator(config, evaluator)
    }

    pub fn with_evaluator(config: Config, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        Self {
            config: Arc::new(config),
            evaluator,
        }
    }
}

/// Fans a task out over its workers under the shared pacer.
pub struct LoadGenerator {
    evaluator: Arc<dyn ScriptEvaluator>,
    tls: rustls::ClientConfig,
}

impl LoadGenerator {
    pub fn new(ctx: &WorkerContext) -> Self {
        Self {
            evaluator: ctx.evaluator.clone(),
            tls: tls_config(),
        }
    }

    /// Run `task` until every worker used up its share of iterations or saw `control` stop.
    ///
    /// Results are sent as they complete; a dropped receiver does not end the run early.
    pub async fn run(
        &self,
        task: Arc<TestCase>,
        control: Arc<TaskControl>,
        results: UnboundedSender<RunResult>,
    ) -> RunSummary {
        let pacer = RatePacer::new(task.qps).map(Arc::new);
        info!(
            "Starting run: {} requests x {} iterations over {} workers (qps={})",
            task.request_body_list.len(),
            task.iterations(),
            task.workers(),
            task.qps
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..task.active_workers() {
            let share = task.share_of(worker_id);

            let executor = RequestExecutor::new(
                HttpClient::new(self.tls.clone(), task.keep_alive),
                self.evaluator.clone(),
                task.request_timeout(),
            );
            let task = task.clone();
            let control = control.clone();
            let results = results.clone();
            let pacer = pacer.clone();

            workers.spawn(async move {
                run_worker(
                    worker_id,
                    share,
                    &task,
                    &executor,
                    pacer.as_deref(),
                    &control,
                    &results,
                )
                .await
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Load worker failed: {}", e);
            }
        }

        let summary = control.summary();
        info!(
            "Run finished: {} batches, {} results in {:?}{}",
            summary.batches,
            summary.results,
            summary.elapsed,
            if summary.stopped { " (stopped)" } else { "" }
        );
        summary
    }
}

async fn run_worker(
    worker_id: usize,
    iterations: u64,
    task: &TestCase,
    executor: &RequestExecutor,
    pacer: Option<&RatePacer>,
    control: &TaskControl,
    results: &UnboundedSender<RunResult>,
) {
    let runner = BatchRunner::new(executor, &task.request_body_list, &task.env_variables);
    let mut completed = 0u64;

    while completed < iterations {
        if control.is_stopped() {
            break;
        }
        if let Some(pacer) = pacer {
            tokio::select! {
                biased;
                _ = control.stopped() => break,
                _ = pacer.wait_one() => {}
            }
            if control.is_stopped() {
                break;
            }
        }

        control.record_batch();
        runner.run_once(control, results).await;
        completed += 1;
    }

    debug!("Worker {} done after {}/{} iterations", worker_id, completed, iterations);
}
