//! Subcommand implementations.

use crate::demo;
use anyhow::{bail, Context, Result};
use lip_core::{shutdown_signal, ClientConfig, LipClient, LipServer, LipServerHandle, ServerConfig};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Host the demo functions until a shutdown signal arrives or every server
/// has been stopped over the wire.
pub async fn serve(namespace: PathBuf, lru: usize, only: &[String]) -> Result<()> {
    if let Some(unknown) = only
        .iter()
        .find(|name| !demo::DEMO_FUNCTIONS.contains(&name.as_str()))
    {
        bail!(
            "Unknown demo function '{}' (available: {})",
            unknown,
            demo::DEMO_FUNCTIONS.join(", ")
        );
    }

    let config = ServerConfig::default().with_namespace_dir(namespace);
    let mut handles = Vec::new();
    for service in demo::services(lru)? {
        if !only.is_empty() && !only.iter().any(|name| name == service.name()) {
            continue;
        }
        let handle = LipServer::start(service, config.clone()).await?;
        // Read by scripts driving this binary
        println!("ENDPOINT={}", handle.endpoint().display());
        handles.push(handle);
    }

    info!("Serving {} functions", handles.len());

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = wait_all(&mut handles) => info!("All servers exited"),
    }

    for handle in &mut handles {
        handle.terminate().await?;
    }
    info!("Shutdown complete");
    Ok(())
}

async fn wait_all(handles: &mut [LipServerHandle]) {
    for handle in handles.iter_mut() {
        if let Err(e) = handle.wait().await {
            warn!("{}", e);
        }
    }
}

async fn connect(namespace: PathBuf, timeout: Option<Duration>) -> Result<LipClient> {
    let config = ClientConfig::default()
        .with_namespace_dir(namespace)
        .with_call_timeout(timeout);
    let mut client = LipClient::new(config);
    client.discover().await?;
    Ok(client)
}

pub async fn list(namespace: PathBuf) -> Result<()> {
    let client = connect(namespace, None).await?;
    for name in client.list_functions() {
        println!("{}", name);
    }
    Ok(())
}

pub async fn doc(namespace: PathBuf, name: &str) -> Result<()> {
    let client = connect(namespace, None).await?;
    println!("{}", client.get_docstring(name).await?);
    Ok(())
}

pub async fn call(
    namespace: PathBuf,
    name: &str,
    args: &[String],
    kwargs: Option<&str>,
    timeout: Option<Duration>,
) -> Result<()> {
    let args = args.iter().map(|arg| parse_arg(arg)).collect();
    let kwargs = match kwargs {
        Some(raw) => parse_kwargs(raw)?,
        None => Map::new(),
    };

    let client = connect(namespace, timeout).await?;
    let result = client.call_function(name, args, kwargs).await?;
    println!("{}", result);
    Ok(())
}

pub async fn stop(namespace: PathBuf, name: &str) -> Result<()> {
    let client = connect(namespace, None).await?;
    client.shutdown_function(name).await?;
    info!("Stopped {}", name);
    Ok(())
}

/// JSON when it parses, a plain string otherwise.
pub fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub fn parse_kwargs(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw).context("--kwargs is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--kwargs must be a JSON object, got {}", other),
    }
}
