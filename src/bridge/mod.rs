//! Assertion script evaluation.
//!
//! The executor only sees [`ScriptEvaluator`]; [`sandbox::QuickJsSandbox`] is the embedded
//! JavaScript implementation used by the worker.

pub mod sandbox;

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::ScriptError;

pub use sandbox::QuickJsSandbox;

/// Response data bound into a script.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub body: &'a str,
    pub status: u16,
    pub status_message: &'a str,
    pub headers: &'a HashMap<String, String>,
    /// Sum of the DNS, connect and request phases.
    pub elapsed: Duration,
}

/// What a script left in `tests` and `$variables$`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScriptOutcome {
    pub tests: HashMap<String, bool>,
    pub variables: HashMap<String, String>,
}

impl ScriptOutcome {
    /// Outcome reported when the script itself could not run: one failing test named after
    /// the error, no variables.
    pub fn failed(err: &ScriptError) -> Self {
        Self {
            tests: HashMap::from([(err.to_string(), false)]),
            variables: HashMap::new(),
        }
    }
}

pub trait ScriptEvaluator: Send + Sync {
    fn evaluate(&self, script: &str, response: &ResponseView<'_>)
        -> Result<ScriptOutcome, ScriptError>;
}
