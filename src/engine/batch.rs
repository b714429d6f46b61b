use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::engine::control::TaskControl;
use crate::engine::cookies::CookieJar;
use crate::engine::executor::RequestExecutor;
use crate::engine::task::{RequestSpec, RunResult};
use crate::engine::template::resolve;

/// Runs the request list of a task once, in order, for one worker.
pub struct BatchRunner<'a> {
    executor: &'a RequestExecutor,
    requests: &'a [RequestSpec],
    env: &'a HashMap<String, String>,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        executor: &'a RequestExecutor,
        requests: &'a [RequestSpec],
        env: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            executor,
            requests,
            env,
        }
    }

    /// One pass with a fresh variable context and cookie jar. Each result is sent before the
    /// next request is templated. A closed receiver does not stop the pass.
    pub async fn run_once(&self, control: &TaskControl, results: &UnboundedSender<RunResult>) {
        let mut variables: HashMap<String, String> = HashMap::new();
        let mut jar = CookieJar::new();

        for spec in self.requests {
            let resolved = self.resolve_spec(spec, &variables, &jar);
            let execution = self.executor.execute(&resolved, &mut jar).await;

            variables.extend(execution.variables);
            debug!(
                "Request {} finished: status={} success={}",
                execution.result.id, execution.result.status, execution.result.success
            );
            control.record_result();
            let _ = results.send(execution.result);
        }
    }

    fn resolve_spec(
        &self,
        spec: &RequestSpec,
        variables: &HashMap<String, String>,
        jar: &CookieJar,
    ) -> RequestSpec {
        let apply = |s: &str| resolve(s, variables, self.env);

        let headers = spec
            .headers
            .iter()
            .map(|(name, value)| {
                let name = apply(name);
                let mut value = apply(value);
                if name.eq_ignore_ascii_case("cookie") {
                    value = jar.apply(&value);
                }
                (name, value)
            })
            .collect();

        RequestSpec {
            id: spec.id.clone(),
            param: spec.param.clone(),
            method: apply(&spec.method),
            url: apply(&spec.url),
            body: apply(&spec.body),
            headers,
            tests: apply(&spec.tests),
        }
    }
}
