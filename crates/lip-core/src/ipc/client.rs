//! Client for discovering and calling function servers.
//!
//! The client keeps an index of function name → endpoint built by
//! [`LipClient::discover`]. The index is never refreshed implicitly: call
//! `discover()` (or its alias `refresh_sockets()`) before first use and again
//! after servers come and go.
//!
//! Every operation opens a fresh connection, sends one request and reads one
//! response.

use super::endpoint::probe_endpoint;
use super::naming::function_name_from_path;
use super::protocol::{decode_response, read_frame, write_message, Request};
use crate::config::ClientConfig;
use crate::{LipError, Result};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tracing::debug;

/// Client for function servers in one namespace directory.
#[derive(Debug, Clone)]
pub struct LipClient {
    config: ClientConfig,
    index: BTreeMap<String, PathBuf>,
}

impl LipClient {
    /// Create a client with an empty index.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            index: BTreeMap::new(),
        }
    }

    /// Create a client for `namespace_dir` with default settings.
    pub fn for_namespace(namespace_dir: impl Into<PathBuf>) -> Self {
        Self::new(ClientConfig::default().with_namespace_dir(namespace_dir))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Rebuild the index from the namespace directory.
    ///
    /// Only sockets following the naming convention and answering a connect
    /// probe are kept. Returns the number of live endpoints found.
    pub async fn discover(&mut self) -> Result<usize> {
        let dir = &self.config.namespace_dir;
        let entries = std::fs::read_dir(dir).map_err(|e| LipError::io_with_path(e, dir))?;

        let mut index = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| LipError::io_with_path(e, dir))?;
            let path = entry.path();

            let Some(name) = function_name_from_path(&path) else {
                continue;
            };
            let is_socket = entry
                .file_type()
                .map(|t| t.is_socket())
                .unwrap_or(false);
            if !is_socket {
                continue;
            }

            if probe_endpoint(&path, self.config.connect_timeout).await {
                index.insert(name, path);
            } else {
                debug!("Skipping stale endpoint {}", path.display());
            }
        }

        debug!("Discovered {} functions in {}", index.len(), dir.display());
        self.index = index;
        Ok(self.index.len())
    }

    /// Alias of [`LipClient::discover`].
    pub async fn refresh_sockets(&mut self) -> Result<usize> {
        self.discover().await
    }

    /// Names in the current index, in ascending order.
    pub fn list_functions(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    /// Endpoint indexed for `name`.
    pub fn endpoint(&self, name: &str) -> Option<&Path> {
        self.index.get(name).map(PathBuf::as_path)
    }

    fn resolve(&self, name: &str) -> Result<&Path> {
        self.endpoint(name).ok_or_else(|| LipError::NotFound {
            name: name.to_string(),
        })
    }

    /// Docstring of `name`; empty when the function has none.
    pub async fn get_docstring(&self, name: &str) -> Result<String> {
        let endpoint = self.resolve(name)?;
        match self.request(endpoint, &Request::docstring(name)).await? {
            Value::String(doc) => Ok(doc),
            Value::Null => Ok(String::new()),
            other => Err(LipError::Protocol {
                message: format!("Expected a docstring, got {}", other),
            }),
        }
    }

    /// Call `name` with positional and keyword arguments.
    ///
    /// Errors raised by the function come back as
    /// [`LipError::RemoteExecution`] carrying the remote kind and message.
    pub async fn call_function(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        let endpoint = self.resolve(name)?;
        self.request(endpoint, &Request::call(name, args, kwargs)).await
    }

    /// Like [`LipClient::call_function`], deserializing the result into `T`.
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<T> {
        let value = self.call_function(name, args, kwargs).await?;
        serde_json::from_value(value).map_err(|e| LipError::Json {
            message: format!("Failed to decode result of '{}': {}", name, e),
            source: Some(e),
        })
    }

    /// Ask the endpoint indexed for `name` which functions it serves.
    pub async fn remote_functions(&self, name: &str) -> Result<Vec<String>> {
        let endpoint = self.resolve(name)?;
        let value = self.request(endpoint, &Request::list()).await?;
        serde_json::from_value(value).map_err(|e| LipError::Protocol {
            message: format!("Expected a list of names: {}", e),
        })
    }

    /// Ask the server for `name` to shut down and release its endpoint.
    pub async fn shutdown_function(&self, name: &str) -> Result<()> {
        let endpoint = self.resolve(name)?;
        self.request(endpoint, &Request::exit()).await?;
        Ok(())
    }

    async fn request(&self, endpoint: &Path, request: &Request) -> Result<Value> {
        match self.config.call_timeout {
            Some(limit) => tokio::time::timeout(limit, self.roundtrip(endpoint, request))
                .await
                .map_err(|_| LipError::Timeout(limit))?,
            None => self.roundtrip(endpoint, request).await,
        }
    }

    async fn roundtrip(&self, endpoint: &Path, request: &Request) -> Result<Value> {
        let mut stream = self.connect(endpoint).await?;
        let (mut reader, mut writer) = stream.split();

        write_message(&mut writer, request)
            .await
            .map_err(|e| transport_error(e, endpoint))?;

        let response_bytes = read_frame(&mut reader)
            .await
            .map_err(|e| transport_error(e, endpoint))?
            .ok_or_else(|| LipError::Connection {
                path: endpoint.to_path_buf(),
                message: "server closed the connection without a response".to_string(),
                source: None,
            })?;

        decode_response(&response_bytes)?.into_result()
    }

    async fn connect(&self, endpoint: &Path) -> Result<UnixStream> {
        let limit = self.config.connect_timeout;
        let stream = tokio::time::timeout(limit, UnixStream::connect(endpoint))
            .await
            .map_err(|_| LipError::Timeout(limit))?
            .map_err(|e| LipError::connection(e, endpoint))?;

        debug!("Connected to {}", endpoint.display());
        Ok(stream)
    }
}

fn transport_error(err: LipError, endpoint: &Path) -> LipError {
    match err {
        LipError::Io {
            source: Some(source),
            ..
        } => LipError::connection(source, endpoint),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::ipc::protocol::{ErrorDescriptor, Response};
    use crate::ipc::server::LipServer;
    use crate::Dispatch;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestDispatch(&'static str);

    #[async_trait::async_trait]
    impl Dispatch for TestDispatch {
        fn function_name(&self) -> &str {
            self.0
        }

        async fn dispatch(&self, request: Request) -> Response {
            if request.flags.list {
                return Response::success(json!([self.0]));
            }
            if request.flags.docstring {
                return Response::success(json!("test docs"));
            }
            match request.args.first() {
                Some(Value::String(s)) if s == "ping" => Response::success(json!("pong")),
                Some(Value::String(s)) if s == "slow" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Response::success(Value::Null)
                }
                Some(Value::String(s)) if s == "gone" => {
                    Response::error(ErrorDescriptor::TERMINATED, "bye")
                }
                _ => {
                    let a = request.kwargs["a"].as_i64().unwrap_or(0);
                    let b = request.kwargs["b"].as_i64().unwrap_or(0);
                    Response::success(json!(a + b))
                }
            }
        }
    }

    fn server_config(dir: &TempDir) -> ServerConfig {
        ServerConfig::default()
            .with_namespace_dir(dir.path())
            .with_shutdown_grace(Duration::from_millis(100))
    }

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[tokio::test]
    async fn test_client_call_success() {
        let dir = TempDir::new().unwrap();
        let mut handle = LipServer::start_with(Arc::new(TestDispatch("ping")), server_config(&dir))
            .await
            .unwrap();

        let mut client = LipClient::for_namespace(dir.path());
        assert_eq!(client.discover().await.unwrap(), 1);

        let result = client
            .call_function("ping", vec![json!("ping")], Map::new())
            .await
            .unwrap();
        assert_eq!(result, json!("pong"));

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_call_with_kwargs_and_typed_result() {
        let dir = TempDir::new().unwrap();
        let mut handle = LipServer::start_with(Arc::new(TestDispatch("add")), server_config(&dir))
            .await
            .unwrap();

        let mut client = LipClient::for_namespace(dir.path());
        client.discover().await.unwrap();

        let result: i64 = client
            .call_typed("add", vec![], kwargs(json!({"a": 3, "b": 4})))
            .await
            .unwrap();
        assert_eq!(result, 7);

        assert_eq!(client.get_docstring("add").await.unwrap(), "test docs");
        assert_eq!(client.remote_functions("add").await.unwrap(), vec!["add"]);

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_index_is_not_refreshed_implicitly() {
        let dir = TempDir::new().unwrap();
        let mut client = LipClient::for_namespace(dir.path());
        client.discover().await.unwrap();

        let mut handle = LipServer::start_with(Arc::new(TestDispatch("late")), server_config(&dir))
            .await
            .unwrap();

        assert!(client.list_functions().is_empty());
        let result = client.call_function("late", vec![], Map::new()).await;
        assert!(matches!(result, Err(LipError::NotFound { .. })));

        client.refresh_sockets().await.unwrap();
        assert_eq!(client.list_functions(), vec!["late"]);

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminated_server_reports_connection_error() {
        let dir = TempDir::new().unwrap();
        let mut handle = LipServer::start_with(Arc::new(TestDispatch("ping")), server_config(&dir))
            .await
            .unwrap();

        let mut client = LipClient::for_namespace(dir.path());
        client.discover().await.unwrap();
        handle.terminate().await.unwrap();

        let result = client.call_function("ping", vec![json!("ping")], Map::new()).await;
        match result {
            Err(err @ LipError::Connection { .. }) => assert!(!err.is_remote()),
            other => panic!("Expected Connection error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_terminated_is_rehydrated() {
        let dir = TempDir::new().unwrap();
        let mut handle = LipServer::start_with(Arc::new(TestDispatch("ping")), server_config(&dir))
            .await
            .unwrap();

        let mut client = LipClient::for_namespace(dir.path());
        client.discover().await.unwrap();

        let result = client.call_function("ping", vec![json!("gone")], Map::new()).await;
        assert!(matches!(result, Err(LipError::Terminated)));

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let dir = TempDir::new().unwrap();
        let mut handle = LipServer::start_with(Arc::new(TestDispatch("ping")), server_config(&dir))
            .await
            .unwrap();

        let config = ClientConfig::default()
            .with_namespace_dir(dir.path())
            .with_call_timeout(Some(Duration::from_millis(100)));
        let mut client = LipClient::new(config);
        client.discover().await.unwrap();

        let result = client.call_function("ping", vec![json!("slow")], Map::new()).await;
        assert!(matches!(result, Err(LipError::Timeout(_))));

        handle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_discover_missing_directory_is_io_error() {
        let mut client = LipClient::for_namespace("/nonexistent/path/that/does/not/exist");
        let result = client.discover().await;
        assert!(matches!(result, Err(LipError::Io { .. })));
    }
}
