//! LIP - local inter-process function calls.
//!
//! A process publishes a function under a name with [`LipServer`]; any other
//! process on the same host finds it through [`LipClient::discover`] and calls
//! it with JSON arguments. Results can be memoized per function with a bounded
//! LRU cache.
//!
//! # Example
//!
//! ```rust,ignore
//! use lip_core::{LipClient, LipServer, ServerConfig, ClientConfig, Service, Signature};
//! use serde_json::{json, Map};
//!
//! #[tokio::main]
//! async fn main() -> lip_core::Result<()> {
//!     let service = Service::builder("add_ints", |args| {
//!         let a: i64 = args.value("a")?;
//!         let b: i64 = args.value("b")?;
//!         Ok(json!(a + b))
//!     })
//!     .signature(Signature::new(["a", "b"]))
//!     .lru(128)
//!     .build()?;
//!
//!     let mut server = LipServer::start(service, ServerConfig::default()).await?;
//!
//!     let mut client = LipClient::new(ClientConfig::default());
//!     client.discover().await?;
//!     let sum = client.call_function("add_ints", vec![json!(2), json!(3)], Map::new()).await?;
//!     assert_eq!(sum, json!(5));
//!
//!     server.terminate().await
//! }
//! ```

#[cfg(not(unix))]
compile_error!("lip-core requires Unix domain sockets");

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod service;

// Re-export commonly used types
pub use cache::{cache_key, CachePolicy, ResultCache};
pub use config::{default_namespace_dir, ClientConfig, ProtocolConfig, ServerConfig};
pub use dispatch::{Dispatch, Dispatcher};
pub use error::{LipError, Result};
pub use ipc::{
    shutdown_signal, ErrorDescriptor, LipClient, LipServer, LipServerHandle, Request,
    RequestFlags, Response,
};
pub use service::{
    Arguments, FunctionDescriptor, Parameter, Service, ServiceBuilder, ServiceFunction, Signature,
};
