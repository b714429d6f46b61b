use base64::{engine::general_purpose, Engine as _};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, COOKIE, SET_COOKIE};
use http::{Method, Request, Uri};
use http_body_util::Full;
use hyper::body::Bytes;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::bridge::{ResponseView, ScriptEvaluator, ScriptOutcome};
use crate::engine::cookies::CookieJar;
use crate::engine::http_client::{HttpClient, TimedResponse};
use crate::engine::task::{RequestSpec, RunResult};
use crate::error::{RequestError, ScriptError};
use crate::utils::{canonical_header_name, strip_status_code};

/// A finished request plus the variables its script exported.
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: RunResult,
    pub variables: HashMap<String, String>,
}

/// Runs one fully resolved request on a worker's client and evaluates its assertion script.
pub struct RequestExecutor {
    client: HttpClient,
    evaluator: Arc<dyn ScriptEvaluator>,
    timeout: Option<Duration>,
}

impl RequestExecutor {
    pub fn new(
        client: HttpClient,
        evaluator: Arc<dyn ScriptEvaluator>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            client,
            evaluator,
            timeout,
        }
    }

    /// Never fails: construction, transport and script problems all end up in the result.
    pub async fn execute(&self, spec: &RequestSpec, jar: &mut CookieJar) -> Execution {
        let result = RunResult::new(spec);

        let request = match build_request(spec) {
            Ok(r) => r,
            Err(e) => return Execution::without_variables(result.failed(e.to_string())),
        };

        let response = match self.client.request(request, self.timeout).await {
            Ok(r) => r,
            Err(e) => {
                debug!("Request {} failed: {}", spec.id, e);
                return Execution::without_variables(result.failed(e.to_string()));
            }
        };

        let mut result = capture_response(result, response, jar);
        let mut variables = HashMap::new();

        if !spec.tests.trim().is_empty() {
            let outcome = match self.evaluate(&spec.tests, &result).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!("Script for request {} failed: {}", spec.id, e);
                    ScriptOutcome::failed(&e)
                }
            };
            result.tests.extend(outcome.tests);
            variables = outcome.variables;
        }

        Execution { result, variables }
    }

    // QuickJS runs until the script returns or hits its deadline, so it runs on the blocking
    // pool rather than on the worker's async thread.
    async fn evaluate(&self, script: &str, result: &RunResult) -> Result<ScriptOutcome, ScriptError> {
        let evaluator = self.evaluator.clone();
        let script = script.to_string();
        let body = result.body.clone();
        let status = result.status;
        let status_message = result.status_message.clone();
        let headers = result.headers.clone();
        let elapsed = result.duration.total();

        tokio::task::spawn_blocking(move || {
            let view = ResponseView {
                body: &body,
                status,
                status_message: &status_message,
                headers: &headers,
                elapsed,
            };
            evaluator.evaluate(&script, &view)
        })
        .await
        .map_err(|e| ScriptError::Setup(format!("script task failed: {e}")))?
    }
}

impl Execution {
    fn without_variables(result: RunResult) -> Self {
        Self {
            result,
            variables: HashMap::new(),
        }
    }
}

fn build_request(spec: &RequestSpec) -> Result<Request<Full<Bytes>>, RequestError> {
    let method = match spec.method.trim() {
        "" => Method::GET,
        m => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
            .map_err(|_| RequestError::InvalidMethod(spec.method.clone()))?,
    };

    let target = parse_target(&spec.url)?;

    let mut builder = Request::builder().method(method).uri(target.uri);
    let explicit_auth = spec
        .headers
        .keys()
        .any(|name| name.trim().eq_ignore_ascii_case(AUTHORIZATION.as_str()));
    if let (Some(credentials), false) = (target.credentials, explicit_auth) {
        let encoded = general_purpose::STANDARD.encode(credentials);
        builder = builder.header(AUTHORIZATION, format!("Basic {encoded}"));
    }
    for (name, value) in &spec.headers {
        if name.trim().is_empty() {
            continue;
        }
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(http::Error::from)?;
        let value = HeaderValue::from_str(value).map_err(http::Error::from)?;
        builder = builder.header(name, value);
    }

    Ok(builder.body(Full::new(Bytes::from(spec.body.clone())))?)
}

struct Target {
    uri: Uri,
    /// Decoded `user:password` from the URL's userinfo, sent as Basic auth.
    credentials: Option<String>,
}

// Parse the URL and re-encode every query pair so templated values with reserved
// characters still produce a well-formed request target.
fn parse_target(raw: &str) -> Result<Target, RequestError> {
    let invalid = |reason: String| RequestError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    let mut url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
    }

    if url.query().is_some() {
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let credentials = (!url.username().is_empty() || url.password().is_some()).then(|| {
        let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
        format!(
            "{}:{}",
            decode(url.username()),
            decode(url.password().unwrap_or_default())
        )
    });

    let uri = url_to_uri(&url).ok_or_else(|| invalid("cannot be expressed as a request URI".into()))?;
    Ok(Target { uri, credentials })
}

fn url_to_uri(url: &Url) -> Option<Uri> {
    let host = url.host_str()?;

    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let path_and_query = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    Uri::builder()
        .scheme(url.scheme())
        .authority(authority.as_str())
        .path_and_query(path_and_query.as_str())
        .build()
        .ok()
}

fn capture_response(mut result: RunResult, response: TimedResponse, jar: &mut CookieJar) -> RunResult {
    let TimedResponse {
        parts,
        body,
        timings,
    } = response;

    let reason = parts
        .extensions
        .get::<hyper::ext::ReasonPhrase>()
        .map(|r| String::from_utf8_lossy(r.as_bytes()).into_owned())
        .or_else(|| parts.status.canonical_reason().map(str::to_string))
        .unwrap_or_default();
    let status_line = format!("{} {}", parts.status.as_u16(), reason);

    result.success = true;
    result.status = parts.status.as_u16();
    result.status_message = strip_status_code(&status_line).to_string();
    result.duration = timings;

    for name in parts.headers.keys() {
        let values: Vec<String> = parts
            .headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();

        if name == SET_COOKIE {
            values.iter().for_each(|v| jar.observe_set_cookie(v));
        } else if name == COOKIE {
            values.iter().for_each(|v| jar.observe_cookie_header(v));
        }

        result
            .headers
            .insert(canonical_header_name(name.as_str()), values.join(";"));
    }

    result.body = String::from_utf8_lossy(&body).into_owned();
    result
}
