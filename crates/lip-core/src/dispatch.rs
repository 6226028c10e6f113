//! Request dispatch for a single served function.
//!
//! The [`Dispatcher`] turns a decoded [`Request`] into a [`Response`]: it
//! answers directory and docstring queries, validates arguments, consults the
//! result cache and runs the function. It holds no socket and can be driven
//! directly in tests.

use crate::cache::{cache_key, ResultCache};
use crate::ipc::protocol::{ErrorDescriptor, Request, Response};
use crate::service::{Arguments, FunctionDescriptor, Service, ServiceFunction, Signature};
use serde_json::Value;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error};

/// Turns requests into responses.
///
/// The server calls this for every decoded request except `exit`, which it
/// handles itself.
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Name of the function behind the endpoint. Determines the endpoint path.
    fn function_name(&self) -> &str;

    /// Handle one request. Failures are reported in the response, never by
    /// panicking.
    async fn dispatch(&self, request: Request) -> Response;
}

/// Dispatcher for one [`Service`].
pub struct Dispatcher {
    descriptor: FunctionDescriptor,
    signature: Option<Arc<Signature>>,
    function: Arc<dyn ServiceFunction>,
    /// Present only when caching is enabled.
    cache: Option<Mutex<ResultCache>>,
}

impl Dispatcher {
    /// Build a dispatcher with a cold cache.
    pub fn new(service: Service) -> Self {
        let descriptor = service.descriptor().clone();
        let cache = descriptor
            .cache
            .enabled
            .then(|| Mutex::new(ResultCache::new(descriptor.cache.capacity)));

        Self {
            signature: descriptor.signature.clone().map(Arc::new),
            function: service.function(),
            descriptor,
            cache,
        }
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    /// Names answered to a `list` query.
    pub fn function_names(&self) -> Vec<String> {
        vec![self.descriptor.name.clone()]
    }

    /// Number of cached results (`0` when caching is off).
    pub fn cache_len(&self) -> usize {
        self.lock_cache().map_or(0, |cache| cache.len())
    }

    fn lock_cache(&self) -> Option<MutexGuard<'_, ResultCache>> {
        // A panic while holding the lock cannot leave the map half-written.
        self.cache
            .as_ref()
            .map(|cache| cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn handle_call(&self, request: &Request) -> std::result::Result<Option<String>, ErrorDescriptor> {
        if let Some(signature) = &self.signature {
            signature.bind(&request.args, &request.kwargs)?;
        }
        Ok(self
            .cache
            .as_ref()
            .map(|_| cache_key(&request.args, &request.kwargs)))
    }

    async fn invoke(&self, args: Arguments) -> std::result::Result<Value, ErrorDescriptor> {
        let function = self.function.clone();
        match tokio::task::spawn_blocking(move || function.call(&args)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ErrorDescriptor::new(
                ErrorDescriptor::PANIC,
                panic_message(e.into_panic()),
            )),
            Err(_) => Err(ErrorDescriptor::new(
                ErrorDescriptor::TERMINATED,
                "function call was cancelled",
            )),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "function panicked".to_string()
    }
}

#[async_trait::async_trait]
impl Dispatch for Dispatcher {
    fn function_name(&self) -> &str {
        &self.descriptor.name
    }

    async fn dispatch(&self, request: Request) -> Response {
        if request.flags.list {
            return Response::success(Value::from(self.function_names()));
        }

        if let Some(name) = &request.function {
            if *name != self.descriptor.name {
                return Response::error(ErrorDescriptor::NOT_FOUND, name.clone());
            }
        }

        if request.flags.docstring {
            return Response::success(Value::String(self.descriptor.docstring.clone()));
        }

        let key = match self.handle_call(&request) {
            Ok(key) => key,
            Err(e) => {
                debug!("{} rejected arguments: {}", self.descriptor.name, e.message);
                return e.into();
            }
        };

        if let Some(key) = &key {
            if let Some(cached) = self.lock_cache().and_then(|mut cache| cache.get(key)) {
                debug!("{} served from cache", self.descriptor.name);
                return Response::success(cached);
            }
        }

        let Request { args, kwargs, .. } = request;
        let log_args = tracing::enabled!(tracing::Level::DEBUG)
            .then(|| format!("args: {:?}, kwargs: {:?}", args, kwargs));
        let arguments = Arguments::new(args, kwargs).with_signature(self.signature.clone());

        let start = Instant::now();
        let result = self.invoke(arguments).await;
        let elapsed = start.elapsed();

        match result {
            Ok(value) => {
                debug!(
                    "{} called with {}, time: {:.4} seconds",
                    self.descriptor.name,
                    log_args.unwrap_or_default(),
                    elapsed.as_secs_f64()
                );
                let response = Response::success(value);
                // Results that cannot be framed are reported, never cached.
                if let Some(e) = response.oversize_error() {
                    error!("{} failed: {}", self.descriptor.name, e);
                    return e.into();
                }
                if let (Some(key), Some(mut cache), Response::Ok { result }) =
                    (key, self.lock_cache(), &response)
                {
                    cache.put(key, result.clone());
                }
                response
            }
            Err(e) => {
                error!("{} failed: {}", self.descriptor.name, e);
                e.into()
            }
        }
    }
}
