//! Unix socket server for one served function.
//!
//! Binds `<namespace>/lipcm-<name>.sock`, accepts connections, and hands each
//! decoded request to a [`Dispatch`] implementation.
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime. Each connection is handled in its own
//! spawned task and owns its stream, so responses are never interleaved. A
//! connection reads one request, writes the full response, then reads the
//! next. The dispatcher is shared via `Arc` and serializes its own cache
//! access.
//!
//! # Shutdown
//!
//! Stopping (through [`LipServerHandle::terminate`], a wire `exit` request or
//! dropping the handle) closes the listener and unlinks the endpoint first.
//! In-flight requests then get `shutdown_grace` to finish; whatever is still
//! running afterwards is answered with a `Terminated` error and aborted.

use super::endpoint::{bind_endpoint, EndpointGuard};
use super::naming::endpoint_for;
use super::protocol::{
    decode_request, encode_response, read_frame, write_frame, write_message, ErrorDescriptor,
    Response,
};
use crate::config::{ProtocolConfig, ServerConfig};
use crate::dispatch::{Dispatch, Dispatcher};
use crate::service::Service;
use crate::{LipError, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Lifecycle phase broadcast to connection tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// No new requests; in-flight ones may finish.
    Draining,
    /// In-flight requests are answered with `Terminated`.
    Aborting,
}

/// Handle to a running server. Dropping stops the server without waiting.
pub struct LipServerHandle {
    pub endpoint: PathBuf,
    name: String,
    stop: Arc<Notify>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl LipServerHandle {
    /// Path of the bound endpoint.
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Name of the served function.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the accept loop is still running.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Ask the server to stop without waiting for it.
    pub fn shutdown(&self) {
        self.stop.notify_one();
    }

    /// Stop the server and wait until its endpoint has been released.
    ///
    /// Bounded by the configured shutdown grace plus a short abort window,
    /// even if a function call hangs.
    pub async fn terminate(&mut self) -> Result<()> {
        self.shutdown();
        self.wait().await
    }

    /// Wait for the server to stop for any reason. Cancel safe.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.task_handle.as_mut() else {
            return Ok(());
        };
        let joined = handle.await;
        self.task_handle = None;
        joined.map_err(|e| LipError::Io {
            message: format!("Server task for '{}' failed: {}", self.name, e),
            path: Some(self.endpoint.clone()),
            source: None,
        })
    }
}

impl Drop for LipServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for LipServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LipServerHandle")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Server entry points.
pub struct LipServer;

impl LipServer {
    /// Serve `service` at its endpoint.
    ///
    /// Fails with [`LipError::Bind`] if a live server already holds the
    /// endpoint. A stale endpoint file left by a dead server is replaced.
    pub async fn start(service: Service, config: ServerConfig) -> Result<LipServerHandle> {
        Self::start_with(Arc::new(Dispatcher::new(service)), config).await
    }

    /// Serve an arbitrary [`Dispatch`] implementation.
    pub async fn start_with<D: Dispatch>(
        dispatch: Arc<D>,
        config: ServerConfig,
    ) -> Result<LipServerHandle> {
        let name = dispatch.function_name().to_string();
        let endpoint = endpoint_for(&config.namespace_dir, &name)?;
        let (listener, guard) = bind_endpoint(&endpoint).await?;

        info!("Starting server for function {} at {}", name, endpoint.display());

        let stop = Arc::new(Notify::new());
        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            guard,
            dispatch,
            stop.clone(),
            config,
        ));

        Ok(LipServerHandle {
            endpoint,
            name,
            stop,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: Dispatch>(
        listener: UnixListener,
        guard: EndpointGuard,
        dispatch: Arc<D>,
        stop: Arc<Notify>,
        config: ServerConfig,
    ) {
        let (phase_tx, phase_rx) = watch::channel(Phase::Running);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = stop.notified() => {
                    info!("Server for {} shutting down", dispatch.function_name());
                    break;
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            if connections.len() >= config.max_connections {
                                warn!(
                                    "Rejecting connection to {}: at max capacity ({})",
                                    dispatch.function_name(),
                                    config.max_connections
                                );
                                continue;
                            }

                            let dispatch = dispatch.clone();
                            let stop = stop.clone();
                            let phase = phase_rx.clone();

                            connections.spawn(async move {
                                debug!("Connection to {}", dispatch.function_name());
                                if let Err(e) = Self::handle_connection(stream, &*dispatch, &stop, phase).await {
                                    log_connection_error(dispatch.function_name(), &e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error on {}: {}", guard.path().display(), e);
                        }
                    }
                }
            }
        }

        // Stop accepting and release the endpoint before draining.
        drop(listener);
        drop(guard);

        Self::drain(&mut connections, &phase_tx, config.shutdown_grace).await;
        info!("Server for {} stopped", dispatch.function_name());
    }

    async fn drain(connections: &mut JoinSet<()>, phase: &watch::Sender<Phase>, grace: Duration) {
        phase.send_replace(Phase::Draining);
        if tokio::time::timeout(grace, join_all(connections)).await.is_ok() {
            return;
        }

        warn!(
            "{} connections still busy after {:?}, terminating them",
            connections.len(),
            grace
        );
        phase.send_replace(Phase::Aborting);
        if tokio::time::timeout(ProtocolConfig::ABORT_FLUSH_TIMEOUT, join_all(connections))
            .await
            .is_err()
        {
            connections.abort_all();
            join_all(connections).await;
        }
    }

    async fn handle_connection<D: Dispatch>(
        mut stream: UnixStream,
        dispatch: &D,
        stop: &Notify,
        mut phase: watch::Receiver<Phase>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            // Wait for either a frame or the end of the running phase
            // Shutdown wins over a frame that is already buffered.
            let frame = tokio::select! {
                biased;
                _ = phase.wait_for(|p| *p != Phase::Running) => {
                    return Ok(()); // Server shutting down
                }
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()), // Clean disconnect
                    }
                }
            };

            // Undecodable requests close the connection without a response.
            let request = decode_request(&frame)?;

            if request.flags.exit {
                info!("Exit requested for {}", dispatch.function_name());
                write_message(&mut writer, &Response::success(Value::Bool(true))).await?;
                stop.notify_one();
                return Ok(());
            }

            let response = tokio::select! {
                response = dispatch.dispatch(request) => response,
                _ = phase.wait_for(|p| *p == Phase::Aborting) => {
                    Response::error(ErrorDescriptor::TERMINATED, "server is shutting down")
                }
            };

            write_frame(&mut writer, &encode_response(&response)?).await?;
        }
    }
}

async fn join_all(connections: &mut JoinSet<()>) {
    while connections.join_next().await.is_some() {}
}

fn log_connection_error(name: &str, err: &LipError) {
    match err {
        LipError::Io {
            source: Some(source),
            ..
        } if matches!(
            source.kind(),
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
        ) =>
        {
            warn!("Client of {} disconnected", name);
        }
        LipError::Protocol { message } => {
            warn!("Protocol error on {}: {}", name, message);
        }
        other => debug!("Connection to {} ended: {}", name, other),
    }
}

/// Resolve on SIGINT or, on Unix, SIGTERM.
///
/// Hosting binaries select on this to release their endpoints when
/// interrupted.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{decode_response, write_frame, Request};
    use serde_json::{json, Map};
    use tempfile::TempDir;

    struct EchoDispatch;

    #[async_trait::async_trait]
    impl Dispatch for EchoDispatch {
        fn function_name(&self) -> &str {
            "echo"
        }

        async fn dispatch(&self, request: Request) -> Response {
            match request.args.first() {
                Some(Value::String(s)) if s == "sleep" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Response::success(Value::Null)
                }
                Some(Value::String(s)) if s == "nap" => {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Response::success(json!("rested"))
                }
                Some(Value::String(s)) if s == "big" => Response::success(Value::String(
                    "x".repeat(ProtocolConfig::MAX_MESSAGE_SIZE + 1),
                )),
                Some(Value::String(s)) if s == "fail" => Response::error("Failure", "test failure"),
                _ => Response::success(Value::Array(request.args)),
            }
        }
    }

    fn test_config(dir: &TempDir) -> ServerConfig {
        ServerConfig::default()
            .with_namespace_dir(dir.path())
            .with_shutdown_grace(Duration::from_millis(200))
    }

    async fn roundtrip(stream: &mut UnixStream, request: &Request) -> Option<Response> {
        let (mut reader, mut writer) = stream.split();
        write_message(&mut writer, request).await.unwrap();
        read_frame(&mut reader)
            .await
            .unwrap()
            .map(|bytes| decode_response(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_server_start_and_terminate() {
        let dir = TempDir::new().unwrap();
        let mut handle = LipServer::start_with(Arc::new(EchoDispatch), test_config(&dir))
            .await
            .unwrap();

        assert_eq!(handle.endpoint(), dir.path().join("lipcm-echo.sock"));
        assert!(handle.endpoint().exists());
        assert!(handle.is_running());

        handle.terminate().await.unwrap();
        assert!(!handle.endpoint().exists());
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_server_echo_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut handle = LipServer::start_with(Arc::new(EchoDispatch), test_config(&dir))
            .await
            .unwrap();

        let mut stream = UnixStream::connect(handle.endpoint()).await.unwrap();
        let request = Request::call("echo", vec![json!({"hello": "world"})], Map::new());
        let response = roundtrip(&mut stream, &request).await;
        assert_eq!(response, Some(Response::success(json!([{"hello": "world"}]))));

        // Same connection serves further requests
        let request = Request::call("echo", vec![json!("fail")], Map::new());
        let response = roundtrip(&mut stream, &request).await;
        assert_eq!(response, Some(Response::error("Failure", "test failure")));

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_invalid_json_closes_connection() {
        let dir = TempDir::new().unwrap();
        let mut handle = LipServer::start_with(Arc::new(EchoDispatch), test_config(&dir))
            .await
            .unwrap();

        let mut stream = UnixStream::connect(handle.endpoint()).await.unwrap();
        let (mut reader, mut writer) = stream.split();
        write_frame(&mut writer, b"not valid json").await.unwrap();
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);

        // The server keeps serving other connections
        let mut stream = UnixStream::connect(handle.endpoint()).await.unwrap();
        let response = roundtrip(&mut stream, &Request::call("echo", vec![json!(1)], Map::new())).await;
        assert_eq!(response, Some(Response::success(json!([1]))));

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_server_on_same_name_fails() {
        let dir = TempDir::new().unwrap();
        let mut first = LipServer::start_with(Arc::new(EchoDispatch), test_config(&dir))
            .await
            .unwrap();

        let second = LipServer::start_with(Arc::new(EchoDispatch), test_config(&dir)).await;
        assert!(matches!(second, Err(LipError::Bind { .. })));
        assert!(first.endpoint().exists());

        first.terminate().await.unwrap();
        let mut third = LipServer::start_with(Arc::new(EchoDispatch), test_config(&dir))
            .await
            .unwrap();
        third.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_request_stops_server() {
        let dir = TempDir::new().unwrap();
        let mut handle = LipServer::start_with(Arc::new(EchoDispatch), test_config(&dir))
            .await
            .unwrap();

        let mut stream = UnixStream::connect(handle.endpoint()).await.unwrap();
        let response = roundtrip(&mut stream, &Request::exit()).await;
        assert_eq!(response, Some(Response::success(json!(true))));

        handle.wait().await.unwrap();
        assert!(!handle.endpoint().exists());
    }

    #[tokio::test]
    async fn test_terminate_answers_hung_request_with_terminated() {
        let dir = TempDir::new().unwrap();
        let mut handle = LipServer::start_with(Arc::new(EchoDispatch), test_config(&dir))
            .await
            .unwrap();

        let mut stream = UnixStream::connect(handle.endpoint()).await.unwrap();
        let pending = tokio::spawn(async move {
            roundtrip(&mut stream, &Request::call("echo", vec![json!("sleep")], Map::new())).await
        });

        // Let the request reach the dispatcher before shutting down
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        handle.terminate().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let response = pending.await.unwrap();
        assert_eq!(
            response,
            Some(Response::error(
                ErrorDescriptor::TERMINATED,
                "server is shutting down"
            ))
        );
    }

    #[tokio::test]
    async fn test_drop_handle_releases_endpoint() {
        let dir = TempDir::new().unwrap();
        let handle = LipServer::start_with(Arc::new(EchoDispatch), test_config(&dir))
            .await
            .unwrap();
        let endpoint = handle.endpoint().to_path_buf();

        drop(handle);

        let mut released = false;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if !endpoint.exists() {
                released = true;
                break;
            }
        }
        assert!(released, "Endpoint should be removed after the handle is dropped");
    }

    #[tokio::test]
    async fn test_oversized_response_becomes_error() {
        let dir = TempDir::new().unwrap();
        let mut handle = LipServer::start_with(Arc::new(EchoDispatch), test_config(&dir))
            .await
            .unwrap();

        let mut stream = UnixStream::connect(handle.endpoint()).await.unwrap();
        let response = roundtrip(&mut stream, &Request::call("echo", vec![json!("big")], Map::new()))
            .await
            .unwrap();
        match response {
            Response::Error { error } => assert_eq!(error.kind, ErrorDescriptor::RESULT_TOO_LARGE),
            other => panic!("Expected an error response, got: {:?}", other),
        }

        // The connection stays usable
        let response = roundtrip(&mut stream, &Request::call("echo", vec![json!(2)], Map::new())).await;
        assert_eq!(response, Some(Response::success(json!([2]))));

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_new_request_starts_while_draining() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_shutdown_grace(Duration::from_secs(5));
        let mut handle = LipServer::start_with(Arc::new(EchoDispatch), config)
            .await
            .unwrap();

        let mut stream = UnixStream::connect(handle.endpoint()).await.unwrap();
        let (mut reader, mut writer) = stream.split();
        write_message(&mut writer, &Request::call("echo", vec![json!("nap")], Map::new()))
            .await
            .unwrap();

        // Shut down while the first request runs, then queue a second one
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        write_message(&mut writer, &Request::call("echo", vec![json!(7)], Map::new()))
            .await
            .unwrap();

        let first = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(decode_response(&first).unwrap(), Response::success(json!("rested")));

        // The queued request is never dispatched. The close may surface as
        // EOF or as a reset, since the server leaves that frame unread.
        let next = read_frame(&mut reader).await;
        assert!(!matches!(next, Ok(Some(_))), "unexpected response: {:?}", next);

        handle.wait().await.unwrap();
    }
}
