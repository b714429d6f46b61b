use rquickjs::convert::Coerced;
use rquickjs::{CatchResultExt, CaughtError, Context, Runtime};
use std::time::Instant;

use super::{ResponseView, ScriptEvaluator, ScriptOutcome};
use crate::cli::config::SandboxConfig;
use crate::error::ScriptError;

// Bindings every assertion script can rely on. The raw values are injected as globals
// before this runs.
const HARNESS: &str = r#"
var responseObj = {};
try {
    responseObj = JSON.parse(responseBody);
} catch (e) {
    responseObj = e;
}
var responseCode = { code: __responseStatus, name: __responseMessage };
var responseHeaders = {};
try {
    responseHeaders = JSON.parse(__responseHeaders);
} catch (e) {
    responseHeaders = e;
}
var tests = {};
var $variables$ = {};
var $export$ = function (obj) {};
"#;

const COLLECT: &str = r#"
(function () {
    var out = { tests: {}, variables: {} };
    for (var name in tests) {
        out.tests[name] = !!tests[name];
    }
    for (var name in $variables$) {
        var value = $variables$[name];
        if (typeof value === 'string') {
            out.variables[name] = value;
        } else {
            var encoded = JSON.stringify(value);
            out.variables[name] = encoded === undefined ? String(value) : encoded;
        }
    }
    return JSON.stringify(out);
})()
"#;

/// QuickJS evaluator. Each call gets its own runtime and context, dropped on return.
#[derive(Debug, Clone)]
pub struct QuickJsSandbox {
    limits: SandboxConfig,
}

impl QuickJsSandbox {
    pub fn new(limits: SandboxConfig) -> Self {
        Self { limits }
    }

    fn runtime(&self) -> Result<Runtime, ScriptError> {
        let runtime = Runtime::new()?;
        runtime.set_memory_limit(self.limits.memory_limit);
        runtime.set_max_stack_size(self.limits.max_stack_size);

        let deadline = Instant::now() + self.limits.timeout();
        runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));
        Ok(runtime)
    }
}

impl Default for QuickJsSandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

impl ScriptEvaluator for QuickJsSandbox {
    fn evaluate(
        &self,
        script: &str,
        response: &ResponseView<'_>,
    ) -> Result<ScriptOutcome, ScriptError> {
        let headers = serde_json::to_string(response.headers)
            .map_err(|e| ScriptError::Setup(e.to_string()))?;
        let elapsed_ms = response.elapsed.as_nanos() as f64 / 1_000_000.0;

        let runtime = self.runtime()?;
        let context = Context::full(&runtime)?;

        let raw = context.with(|ctx| -> Result<String, ScriptError> {
            let globals = ctx.globals();
            globals.set("responseBody", response.body)?;
            globals.set("responseTime", elapsed_ms)?;
            globals.set("__responseStatus", response.status as i32)?;
            globals.set("__responseMessage", response.status_message)?;
            globals.set("__responseHeaders", headers.as_str())?;

            ctx.eval::<(), _>(HARNESS)
                .catch(&ctx)
                .map_err(|e| ScriptError::Setup(describe(e)))?;
            ctx.eval::<(), _>(script)
                .catch(&ctx)
                .map_err(|e| ScriptError::Evaluation(describe(e)))?;
            ctx.eval::<String, _>(COLLECT)
                .catch(&ctx)
                .map_err(|e| ScriptError::Evaluation(describe(e)))
        })?;

        serde_json::from_str(&raw).map_err(|e| ScriptError::Output(e.to_string()))
    }
}

// "Name: message" for thrown errors, the coerced value for anything else thrown.
fn describe(err: CaughtError<'_>) -> String {
    match err {
        CaughtError::Exception(ex) => {
            let name = ex
                .as_object()
                .get::<_, Option<String>>("name")
                .ok()
                .flatten()
                .unwrap_or_else(|| "Error".to_string());
            match ex.message() {
                Some(message) if !message.is_empty() => format!("{name}: {message}"),
                _ => name,
            }
        }
        CaughtError::Value(value) => value
            .get::<Coerced<String>>()
            .map(|s| s.0)
            .unwrap_or_else(|_| "uncaught exception".to_string()),
        CaughtError::Error(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn run(script: &str, body: &str) -> Result<ScriptOutcome, ScriptError> {
        let headers = HashMap::from([("Content-Type".to_string(), "application/json".to_string())]);
        let view = ResponseView {
            body,
            status: 200,
            status_message: "OK",
            headers: &headers,
            elapsed: Duration::from_millis(42),
        };
        QuickJsSandbox::default().evaluate(script, &view)
    }

    #[test]
    fn test_tests_are_coerced_to_booleans() {
        let out = run(
            "tests['status ok'] = responseCode.code === 200;\n\
             tests['truthy'] = 1;\n\
             tests['falsy'] = '';",
            "{}",
        )
        .unwrap();
        assert_eq!(out.tests["status ok"], true);
        assert_eq!(out.tests["truthy"], true);
        assert_eq!(out.tests["falsy"], false);
    }

    #[test]
    fn test_variables_exported_as_strings() {
        let out = run(
            "$variables$.token = responseObj.token;\n\
             $variables$.count = responseObj.items.length;\n\
             $variables$.obj = { a: 1 };",
            r#"{"token": "abc", "items": [1, 2, 3]}"#,
        )
        .unwrap();
        assert_eq!(out.variables["token"], "abc");
        assert_eq!(out.variables["count"], "3");
        assert_eq!(out.variables["obj"], r#"{"a":1}"#);
    }

    #[test]
    fn test_invalid_json_body_binds_parse_error() {
        let out = run(
            "tests['is error'] = responseObj instanceof SyntaxError;\n\
             tests['body kept'] = responseBody === 'not json';",
            "not json",
        )
        .unwrap();
        assert_eq!(out.tests["is error"], true);
        assert_eq!(out.tests["body kept"], true);
    }

    #[test]
    fn test_headers_message_and_time_bound() {
        let out = run(
            "tests['ct'] = responseHeaders['Content-Type'] === 'application/json';\n\
             tests['msg'] = responseCode.name === 'OK';\n\
             tests['time'] = responseTime === 42;\n\
             $export$({ ignored: true });",
            "",
        )
        .unwrap();
        assert!(out.tests.values().all(|v| *v), "{:?}", out.tests);
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let err = run("tests['a'] = ;", "").unwrap_err();
        match err {
            ScriptError::Evaluation(msg) => assert!(msg.starts_with("SyntaxError"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_thrown_value_is_reported() {
        let err = run("throw 'boom';", "").unwrap_err();
        assert_eq!(err, ScriptError::Evaluation("boom".into()));

        let err = run("throw new TypeError('bad type');", "").unwrap_err();
        assert_eq!(err, ScriptError::Evaluation("TypeError: bad type".into()));
    }

    #[test]
    fn test_runaway_script_is_interrupted() {
        let sandbox = QuickJsSandbox::new(SandboxConfig {
            timeout_ms: 50,
            ..SandboxConfig::default()
        });
        let headers = HashMap::new();
        let view = ResponseView {
            body: "",
            status: 200,
            status_message: "OK",
            headers: &headers,
            elapsed: Duration::ZERO,
        };
        assert!(sandbox.evaluate("while (true) {}", &view).is_err());
    }

    #[test]
    fn test_no_state_leaks_between_calls() {
        run("globalThis.leaked = 1;", "").unwrap();
        let out = run("tests['clean'] = typeof leaked === 'undefined';", "").unwrap();
        assert_eq!(out.tests["clean"], true);
    }
}
