//! Local IPC over Unix domain sockets.
//!
//! One server hosts one function at a well-known endpoint in a namespace
//! directory. Messages are length-prefixed JSON.
//!
//! # Architecture
//!
//! - **Server**: Binds the endpoint, accepts connections, hands each request to a [`crate::Dispatch`]
//! - **Client**: Discovers endpoints in the namespace directory and issues one request per connection
//! - **Protocol**: Shared framing and message types used by both

pub mod client;
pub mod endpoint;
pub mod naming;
pub mod protocol;
pub mod server;

pub use client::LipClient;
pub use endpoint::{bind_endpoint, probe_endpoint, EndpointGuard};
pub use naming::{endpoint_for, function_name_from_path, validate_function_name};
pub use protocol::{ErrorDescriptor, Request, RequestFlags, Response};
pub use server::{shutdown_signal, LipServer, LipServerHandle};
