use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use http::header::{HeaderValue, CONNECTION};
use http::{Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::{ConfigBuilderExt, HttpsConnector};
use hyper_util::client::legacy::connect::dns::{GaiResolver, Name};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tower::Service;
use tracing::warn;

use crate::engine::task::PhaseDurations;
use crate::error::RequestError;
use crate::utils::error_chain;

// Connection phase timings, written by the resolver/connector of one worker's client.
// A worker issues its requests strictly one after another, so the values read after a
// response always belong to that response's connection.
#[derive(Clone, Default)]
struct TimingContext {
    dns_nanos: Arc<AtomicU64>,
    connect_nanos: Arc<AtomicU64>,
}

impl TimingContext {
    fn reset(&self) {
        self.dns_nanos.store(0, Ordering::Release);
        self.connect_nanos.store(0, Ordering::Release);
    }

    fn set_dns(&self, d: Duration) {
        self.dns_nanos.store(d.as_nanos() as u64, Ordering::Release);
    }

    fn set_connect(&self, d: Duration) {
        self.connect_nanos.store(d.as_nanos() as u64, Ordering::Release);
    }

    fn dns(&self) -> Duration {
        Duration::from_nanos(self.dns_nanos.load(Ordering::Acquire))
    }

    fn connect(&self) -> Duration {
        Duration::from_nanos(self.connect_nanos.load(Ordering::Acquire))
    }
}

// 1. Resolver measuring DNS lookups
#[derive(Clone)]
struct MeasuredResolver {
    inner: GaiResolver,
    timing_ctx: TimingContext,
}

impl Service<Name> for MeasuredResolver {
    type Response = <GaiResolver as Service<Name>>::Response;
    type Error = <GaiResolver as Service<Name>>::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let mut inner = self.inner.clone();
        let timing_ctx = self.timing_ctx.clone();
        let start = Instant::now();

        Box::pin(async move {
            let res = inner.call(name).await;
            timing_ctx.set_dns(start.elapsed());
            res
        })
    }
}

type HttpsStack = HttpsConnector<HttpConnector<MeasuredResolver>>;

// 2. Connector stack measuring connection establishment (DNS + TCP + TLS)
#[derive(Clone)]
struct MeasuredConnector {
    inner: HttpsStack,
    timing_ctx: TimingContext,
}

impl Service<Uri> for MeasuredConnector {
    type Response = <HttpsStack as Service<Uri>>::Response;
    type Error = <HttpsStack as Service<Uri>>::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let mut inner = self.inner.clone();
        let timing_ctx = self.timing_ctx.clone();
        let start = Instant::now();

        Box::pin(async move {
            let res = inner.call(uri).await;
            timing_ctx.set_connect(start.elapsed());
            res
        })
    }
}

/// TLS settings shared by every client of a run. Loading native roots is expensive, so this
/// is built once and cloned into each worker's client.
pub fn tls_config() -> rustls::ClientConfig {
    let _ = rustls::crypto::ring::default_provider().install_default();
    match rustls::ClientConfig::builder().with_native_roots() {
        Ok(builder) => builder.with_no_client_auth(),
        Err(e) => {
            warn!("Failed to load native root certificates, HTTPS targets will not verify: {}", e);
            rustls::ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth()
        }
    }
}

/// Fully received response plus its phase timings.
#[derive(Debug)]
pub struct TimedResponse {
    pub parts: http::response::Parts,
    pub body: Bytes,
    pub timings: PhaseDurations,
}

/// HTTP client owned by a single load worker.
pub struct HttpClient {
    client: Client<MeasuredConnector, Full<Bytes>>,
    timing_ctx: TimingContext,
    keep_alive: bool,
}

impl HttpClient {
    pub fn new(tls: rustls::ClientConfig, keep_alive: bool) -> Self {
        let timing_ctx = TimingContext::default();
        let resolver = MeasuredResolver {
            inner: GaiResolver::new(),
            timing_ctx: timing_ctx.clone(),
        };
        let mut http = HttpConnector::new_with_resolver(resolver);
        http.enforce_http(false);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);
        let connector = MeasuredConnector {
            inner: https,
            timing_ctx: timing_ctx.clone(),
        };

        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_idle_timeout(Duration::from_secs(90));
        if !keep_alive {
            builder.pool_max_idle_per_host(0);
        }
        let client = builder.build(connector);

        Self {
            client,
            timing_ctx,
            keep_alive,
        }
    }

    /// Send `req` and read the whole response body. `timeout` covers the complete exchange.
    pub async fn request(
        &self,
        mut req: Request<Full<Bytes>>,
        timeout: Option<Duration>,
    ) -> Result<TimedResponse, RequestError> {
        if !self.keep_alive {
            req.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }

        self.timing_ctx.reset();
        let request_start = Instant::now();

        let exchange = async {
            let response = self
                .client
                .request(req)
                .await
                .map_err(|e| RequestError::Transport(error_chain(&e)))?;
            let headers_received = Instant::now();
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| RequestError::Transport(error_chain(&e)))?
                .to_bytes();
            Ok::<_, RequestError>((parts, body, headers_received))
        };

        let (parts, body, headers_received) = match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| RequestError::Timeout(limit))??,
            None => exchange.await?,
        };

        // The dial time covers the lookup; report the phases without overlap.
        let dns = self.timing_ctx.dns();
        let dial = self.timing_ctx.connect();
        let timings = PhaseDurations {
            dns,
            connect: dial.saturating_sub(dns),
            request: headers_received
                .duration_since(request_start)
                .saturating_sub(dial),
        };

        Ok(TimedResponse {
            parts,
            body,
            timings,
        })
    }
}
