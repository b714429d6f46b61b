//! Control connection to the controller: dial/retry loop, framing and message dispatch.

pub mod file;
pub mod protocol;
pub mod session;

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{LoadGenerator, WorkerContext};
use crate::error::ConnectionError;
use file::FileReceiver;
use protocol::{is_file_finish, Message, MessageType, WorkerStatus};
use session::TaskSession;

type ControlStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Keeps the worker registered with its controller until shutdown.
pub struct ConnectionManager {
    ctx: WorkerContext,
    generator: Arc<LoadGenerator>,
}

impl ConnectionManager {
    pub fn new(ctx: WorkerContext) -> Self {
        let generator = Arc::new(LoadGenerator::new(&ctx));
        Self { ctx, generator }
    }

    /// Dial, serve, and redial after every failure. Each attempt is preceded by one retry
    /// interval. Returns once `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let url = self.ctx.config.controller_url();
        let interval = self.ctx.config.retry_interval();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            info!("Connecting to controller at {}", url);
            let dialed = tokio::select! {
                _ = shutdown.cancelled() => break,
                dialed = connect_async(url.as_str()) => dialed,
            };

            match dialed {
                Ok((ws, _)) => {
                    info!("Connected to controller");
                    match self.serve(ws, &shutdown).await {
                        Ok(()) => info!("Control connection closed"),
                        Err(e) => warn!("Control connection lost: {}", e),
                    }
                }
                Err(e) => error!("Failed to connect to {}: {}", url, e),
            }

            if shutdown.is_cancelled() {
                break;
            }
            info!("Reconnecting in {:?}", interval);
        }
        info!("Connection manager stopped");
    }

    async fn serve(
        &self,
        ws: ControlStream,
        shutdown: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        let (mut sink, mut frames) = ws.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
        let closed = CancellationToken::new();

        // Single writer per connection; everything outbound goes through `outbound`.
        let writer_closed = closed.clone();
        let mut writer = tokio::spawn(async move {
            let mut status: Option<WorkerStatus> = None;
            while let Some(msg) = queue.recv().await {
                if msg.kind != MessageType::RunResult && status != Some(msg.status) {
                    match status {
                        Some(prev) => info!("Worker status: {} -> {}", prev, msg.status),
                        None => info!("Worker status: {}", msg.status),
                    }
                    status = Some(msg.status);
                }
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode {:?} message: {}", msg.kind, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Frame::text(text)).await {
                    warn!("Failed to write to controller: {}", e);
                    break;
                }
            }
            writer_closed.cancel();
            let _ = sink.close().await;
        });

        let mut conn = ConnectionState {
            outbound: outbound.clone(),
            files: FileReceiver::new(self.ctx.config.transfer.clone()),
            session: TaskSession::new(self.generator.clone(), outbound),
        };
        conn.send(Message::hardware(num_cpus::get()));

        let outcome = loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = closed.cancelled() => break Err(ConnectionError::WriterGone),
                frame = frames.next() => frame,
            };
            let frame = match frame {
                None => break Err(ConnectionError::Closed),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(frame)) => frame,
            };
            if let Err(e) = conn.handle_frame(frame).await {
                break Err(e);
            }
        };

        conn.session.abort();
        drop(conn);

        match outcome {
            Ok(()) => {
                // Let queued messages and the close frame go out.
                if tokio::time::timeout(Duration::from_secs(1), &mut writer)
                    .await
                    .is_err()
                {
                    debug!("Writer did not drain in time");
                    writer.abort();
                }
            }
            Err(_) => writer.abort(),
        }
        outcome
    }
}

// Per-connection state, rebuilt on every reconnect.
struct ConnectionState {
    outbound: UnboundedSender<Message>,
    files: FileReceiver,
    session: TaskSession,
}

impl ConnectionState {
    fn send(&self, msg: Message) {
        let _ = self.outbound.send(msg);
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        match frame {
            Frame::Binary(data) => self.handle_data(&data).await,
            Frame::Text(text) if self.files.is_receiving() => self.handle_data(text.as_bytes()).await,
            Frame::Text(text) => {
                self.handle_message(text.as_str()).await;
                Ok(())
            }
            Frame::Close(reason) => {
                debug!("Close frame from controller: {:?}", reason);
                Err(ConnectionError::Closed)
            }
            _ => Ok(()),
        }
    }

    async fn handle_data(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if !self.files.is_receiving() {
            warn!("Ignoring {} byte data frame outside of a file transfer", data.len());
            return Ok(());
        }

        if is_file_finish(data) {
            match self.files.finish().await {
                Ok(_) => self.send(Message::status(WorkerStatus::FileReady)),
                Err(e) => {
                    error!("Failed to unpack data archive: {}", e);
                    self.send(Message::status(WorkerStatus::Down));
                }
            }
            return Ok(());
        }

        self.files.push(data).await?;
        Ok(())
    }

    async fn handle_message(&mut self, text: &str) {
        let msg: Message = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Ignoring malformed control message: {}", e);
                return;
            }
        };
        debug!("Received {:?} message", msg.kind);

        match msg.kind {
            MessageType::Task => self.session.assign(msg.test_case.unwrap_or_default()),
            MessageType::Start => self.session.start(),
            MessageType::Stop => self.session.stop(),
            MessageType::FileStart => {
                if let Err(e) = self.files.begin().await {
                    error!("Failed to open data archive: {}", e);
                    self.send(Message::status(WorkerStatus::Down));
                }
            }
            other => debug!("Ignoring {:?} message from controller", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::{Config, TransferConfig};
    use crate::engine::task::{RequestSpec, TestCase};
    use httpmock::Method::GET;
    use httpmock::{Mock, MockServer};
    use std::io::Write;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::{timeout, Instant};

    type ServerSide = WebSocketStream<TcpStream>;

    const INTERVAL: Duration = Duration::from_millis(50);

    struct Harness {
        listener: TcpListener,
        shutdown: CancellationToken,
        handle: JoinHandle<()>,
        _dir: tempfile::TempDir,
        extract_dir: std::path::PathBuf,
    }

    impl Harness {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let dir = tempfile::tempdir().unwrap();
            let config = Config {
                address: listener.local_addr().unwrap().to_string(),
                interval: INTERVAL.as_secs_f64(),
                transfer: TransferConfig {
                    archive_path: dir.path().join("global_data.zip"),
                    extract_dir: dir.path().join("data"),
                },
                ..Config::default()
            };
            let extract_dir = config.transfer.extract_dir.clone();
            let manager = ConnectionManager::new(WorkerContext::new(config));
            let shutdown = CancellationToken::new();
            let token = shutdown.clone();
            let handle = tokio::spawn(async move { manager.run(token).await });
            Self {
                listener,
                shutdown,
                handle,
                _dir: dir,
                extract_dir,
            }
        }

        /// Accept the worker's next connection and consume its hardware hello.
        async fn accept(&self) -> ServerSide {
            let (tcp, _) = timeout(Duration::from_secs(5), self.listener.accept())
                .await
                .expect("worker dialed")
                .unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let hello = recv(&mut ws).await;
            assert_eq!(hello.kind, MessageType::Hardware);
            assert_eq!(hello.status, WorkerStatus::Idle);
            assert_eq!(hello.cpu_num, Some(num_cpus::get() as u32));
            ws
        }

        async fn stop(self) {
            self.shutdown.cancel();
            timeout(Duration::from_secs(5), self.handle)
                .await
                .expect("manager stopped")
                .unwrap();
        }
    }

    async fn recv(ws: &mut ServerSide) -> Message {
        loop {
            let frame = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame in time")
                .expect("stream open")
                .unwrap();
            if let Frame::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn send(ws: &mut ServerSide, msg: &Message) {
        ws.send(Frame::text(serde_json::to_string(msg).unwrap()))
            .await
            .unwrap();
    }

    async fn ok_target(server: &MockServer, delay: Duration) -> Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200).delay(delay);
            })
            .await
    }

    fn test_case(url: String, repeat: i64, qps: i64) -> TestCase {
        TestCase {
            request_body_list: vec![RequestSpec {
                id: "status".into(),
                method: "GET".into(),
                url,
                tests: "tests['ok'] = responseCode.code === 200;".into(),
                ..Default::default()
            }],
            repeat,
            concurrency_count: 2,
            qps,
            timeout: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_task_then_stop_without_start() {
        let server = MockServer::start_async().await;
        let target = ok_target(&server, Duration::ZERO).await;
        let harness = Harness::start().await;
        let mut ws = harness.accept().await;

        send(&mut ws, &Message::task(test_case(server.url("/"), 4, 0))).await;
        assert_eq!(recv(&mut ws).await, Message::status(WorkerStatus::Ready));

        send(&mut ws, &Message::new(MessageType::Stop, WorkerStatus::Idle)).await;
        assert_eq!(recv(&mut ws).await, Message::status(WorkerStatus::Finished));

        assert_eq!(target.hits_async().await, 0);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_task_start_streams_results() {
        let server = MockServer::start_async().await;
        ok_target(&server, Duration::ZERO).await;
        let harness = Harness::start().await;
        let mut ws = harness.accept().await;

        send(&mut ws, &Message::task(test_case(server.url("/status/200"), 4, 0))).await;
        assert_eq!(recv(&mut ws).await.status, WorkerStatus::Ready);
        send(&mut ws, &Message::new(MessageType::Start, WorkerStatus::Idle)).await;
        assert_eq!(recv(&mut ws).await, Message::status(WorkerStatus::Working));

        for _ in 0..4 {
            let msg = recv(&mut ws).await;
            assert_eq!(msg.kind, MessageType::RunResult);
            let result = msg.run_result.unwrap();
            assert_eq!(result.status, 200);
            assert_eq!(result.tests.get("ok"), Some(&true));
        }
        assert_eq!(recv(&mut ws).await, Message::status(WorkerStatus::Finished));
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_message_is_ignored() {
        let harness = Harness::start().await;
        let mut ws = harness.accept().await;

        ws.send(Frame::text("{not json")).await.unwrap();
        ws.send(Frame::text(r#"{"type": 99}"#)).await.unwrap();
        send(&mut ws, &Message::task(TestCase::default())).await;
        assert_eq!(recv(&mut ws).await, Message::status(WorkerStatus::Ready));
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_file_transfer() {
        let harness = Harness::start().await;
        let mut ws = harness.accept().await;

        let mut archive = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut archive);
            writer
                .start_file("users.csv", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"id\n1\n").unwrap();
            writer.finish().unwrap();
        }
        let archive = archive.into_inner();

        send(&mut ws, &Message::new(MessageType::FileStart, WorkerStatus::Idle)).await;
        for chunk in archive.chunks(16) {
            ws.send(Frame::binary(chunk.to_vec())).await.unwrap();
        }
        ws.send(Frame::binary(vec![36u8, 36, 36])).await.unwrap();

        assert_eq!(recv(&mut ws).await, Message::status(WorkerStatus::FileReady));
        assert_eq!(
            std::fs::read_to_string(harness.extract_dir.join("users.csv")).unwrap(),
            "id\n1\n"
        );

        // Back in message mode afterwards.
        send(&mut ws, &Message::task(TestCase::default())).await;
        assert_eq!(recv(&mut ws).await, Message::status(WorkerStatus::Ready));
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_corrupt_archive_reports_down() {
        let harness = Harness::start().await;
        let mut ws = harness.accept().await;

        send(&mut ws, &Message::new(MessageType::FileStart, WorkerStatus::Idle)).await;
        ws.send(Frame::binary(b"garbage".to_vec())).await.unwrap();
        ws.send(Frame::binary(vec![36u8, 0, 0])).await.unwrap();

        assert_eq!(recv(&mut ws).await, Message::status(WorkerStatus::Down));
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_drop_without_replaying_results() {
        let server = MockServer::start_async().await;
        let target = ok_target(&server, Duration::ZERO).await;
        let harness = Harness::start().await;
        let mut ws = harness.accept().await;

        send(&mut ws, &Message::task(test_case(server.url("/"), 10_000, 50))).await;
        recv(&mut ws).await;
        send(&mut ws, &Message::new(MessageType::Start, WorkerStatus::Idle)).await;
        recv(&mut ws).await;
        assert_eq!(recv(&mut ws).await.kind, MessageType::RunResult);

        drop(ws);
        let dropped_at = Instant::now();
        let mut ws = harness.accept().await;
        assert!(dropped_at.elapsed() >= INTERVAL);

        // The old run is stopped and nothing from it reaches the new connection.
        let quiet = timeout(Duration::from_millis(300), ws.next()).await;
        assert!(quiet.is_err(), "unexpected frame {quiet:?}");

        let count = target.hits_async().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(target.hits_async().await, count);
        assert!(count < 10_000);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_socket_while_request_in_flight() {
        let server = MockServer::start_async().await;
        ok_target(&server, Duration::from_secs(10)).await;
        let harness = Harness::start().await;
        let mut ws = harness.accept().await;

        send(&mut ws, &Message::task(test_case(server.url("/"), 1, 0))).await;
        recv(&mut ws).await;
        send(&mut ws, &Message::new(MessageType::Start, WorkerStatus::Idle)).await;
        assert_eq!(recv(&mut ws).await, Message::status(WorkerStatus::Working));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The stopped run still holds an outbound sender; the writer must not outlive shutdown.
        harness.stop().await;
        let closed = timeout(Duration::from_secs(3), async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
        assert!(closed.is_ok(), "socket still open after shutdown");
    }

    #[tokio::test]
    async fn test_retries_until_controller_is_up() {
        let harness = Harness::start().await;
        let addr = harness.listener.local_addr().unwrap();

        // First attempt fails during the handshake.
        let (first, _) = harness.listener.accept().await.unwrap();
        drop(first);

        let mut ws = harness.accept().await;
        send(&mut ws, &Message::task(TestCase::default())).await;
        assert_eq!(recv(&mut ws).await.status, WorkerStatus::Ready);
        assert_eq!(ws.get_ref().local_addr().unwrap(), addr);
        harness.stop().await;
    }
}
