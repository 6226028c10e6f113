//! Describing a function as a service.
//!
//! A [`Service`] pairs a callable with its [`FunctionDescriptor`]. It does not
//! bind anything by itself; hand it to [`crate::LipServer::start`] to serve it
//! or to [`crate::Dispatcher::new`] to exercise it in-process.
//!
//! # Example
//!
//! ```rust,ignore
//! use lip_core::{ErrorDescriptor, Service, Signature};
//! use serde_json::json;
//!
//! let service = Service::builder("divide", |args: &lip_core::Arguments| {
//!     let a: f64 = args.value("a")?;
//!     let b: f64 = args.value("b")?;
//!     if b == 0.0 {
//!         return Err(ErrorDescriptor::new("ZeroDivision", "division by zero"));
//!     }
//!     Ok(json!(a / b))
//! })
//! .docstring("Divide a by b.")
//! .signature(Signature::new(["a", "b"]))
//! .build()?;
//! ```

use crate::cache::CachePolicy;
use crate::ipc::naming::validate_function_name;
use crate::ipc::protocol::ErrorDescriptor;
use crate::{LipError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    /// Value used when the caller omits the argument. `None` means required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Parameter {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Parameter list of a served function.
///
/// Parameters bind positionally first, then by keyword. `variadic` accepts
/// extra positional arguments; `extra_keywords` accepts unknown keywords.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Parameter>,
    #[serde(default)]
    pub variadic: bool,
    #[serde(default)]
    pub extra_keywords: bool,
}

impl Signature {
    /// Signature made of required parameters only.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: names.into_iter().map(Parameter::required).collect(),
            ..Default::default()
        }
    }

    /// Signature accepting any number of positional arguments and nothing else.
    pub fn variadic() -> Self {
        Self {
            variadic: true,
            ..Default::default()
        }
    }

    pub fn with_param(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_variadic(mut self, variadic: bool) -> Self {
        self.variadic = variadic;
        self
    }

    pub fn with_extra_keywords(mut self, extra: bool) -> Self {
        self.extra_keywords = extra;
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut saw_default = false;

        for param in &self.params {
            if !seen.insert(param.name.as_str()) {
                return Err(LipError::Validation {
                    field: "signature".to_string(),
                    message: format!("Duplicate parameter '{}'", param.name),
                });
            }
            if param.is_required() && saw_default {
                return Err(LipError::Validation {
                    field: "signature".to_string(),
                    message: format!(
                        "Required parameter '{}' follows a parameter with a default",
                        param.name
                    ),
                });
            }
            saw_default |= !param.is_required();
        }

        Ok(())
    }

    /// Check that a call's arguments bind to this signature.
    pub fn bind(
        &self,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> std::result::Result<(), ErrorDescriptor> {
        if args.len() > self.params.len() && !self.variadic {
            return Err(ErrorDescriptor::invalid_arguments(format!(
                "too many positional arguments: expected at most {}, got {}",
                self.params.len(),
                args.len()
            )));
        }

        for key in kwargs.keys() {
            match self.params.iter().position(|p| &p.name == key) {
                Some(index) if index < args.len() => {
                    return Err(ErrorDescriptor::invalid_arguments(format!(
                        "multiple values for argument '{}'",
                        key
                    )));
                }
                Some(_) => {}
                None if self.extra_keywords => {}
                None => {
                    return Err(ErrorDescriptor::invalid_arguments(format!(
                        "got an unexpected keyword argument '{}'",
                        key
                    )));
                }
            }
        }

        if let Some(missing) = self
            .params
            .iter()
            .skip(args.len())
            .find(|p| p.is_required() && !kwargs.contains_key(&p.name))
        {
            return Err(ErrorDescriptor::invalid_arguments(format!(
                "missing a required argument: '{}'",
                missing.name
            )));
        }

        Ok(())
    }
}

/// Immutable metadata of a served function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    /// Empty when the function has no documentation.
    #[serde(default)]
    pub docstring: String,
    #[serde(default)]
    pub signature: Option<Signature>,
    #[serde(default)]
    pub cache: CachePolicy,
}

/// Arguments of one call as seen by the served function.
#[derive(Debug, Clone)]
pub struct Arguments {
    positional: Vec<Value>,
    keywords: Map<String, Value>,
    signature: Option<Arc<Signature>>,
}

impl Arguments {
    pub fn new(positional: Vec<Value>, keywords: Map<String, Value>) -> Self {
        Self {
            positional,
            keywords,
            signature: None,
        }
    }

    pub(crate) fn with_signature(mut self, signature: Option<Arc<Signature>>) -> Self {
        self.signature = signature;
        self
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keywords(&self) -> &Map<String, Value> {
        &self.keywords
    }

    /// Positional arguments beyond the declared parameters.
    pub fn rest(&self) -> &[Value] {
        let declared = self.signature.as_ref().map_or(0, |s| s.params.len());
        self.positional.get(declared..).unwrap_or(&[])
    }

    /// Value bound to the parameter `name`.
    ///
    /// Resolution order: the positional slot of a declared parameter, then a
    /// keyword argument, then the parameter's default.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let declared = self
            .signature
            .as_ref()
            .and_then(|s| s.params.iter().enumerate().find(|(_, p)| p.name == name));

        if let Some((index, _)) = declared {
            if let Some(value) = self.positional.get(index) {
                return Some(value);
            }
        }

        self.keywords
            .get(name)
            .or_else(|| declared.and_then(|(_, p)| p.default.as_ref()))
    }

    /// Deserialize the parameter `name` into `T`.
    pub fn value<T: DeserializeOwned>(&self, name: &str) -> std::result::Result<T, ErrorDescriptor> {
        let value = self.get(name).ok_or_else(|| {
            ErrorDescriptor::invalid_arguments(format!("missing a required argument: '{}'", name))
        })?;
        decode_argument(value, name)
    }

    /// Deserialize the positional argument at `index` into `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, ErrorDescriptor> {
        let value = self.positional.get(index).ok_or_else(|| {
            ErrorDescriptor::invalid_arguments(format!("missing positional argument {}", index))
        })?;
        decode_argument(value, &index.to_string())
    }
}

fn decode_argument<T: DeserializeOwned>(
    value: &Value,
    name: &str,
) -> std::result::Result<T, ErrorDescriptor> {
    T::deserialize(value).map_err(|e| {
        ErrorDescriptor::invalid_arguments(format!("argument '{}': {}", name, e))
    })
}

/// A callable that can be served.
///
/// Implemented for every `Fn(&Arguments) -> Result<Value, ErrorDescriptor>`
/// closure. Calls run on the blocking thread pool, so implementations may
/// block freely.
pub trait ServiceFunction: Send + Sync + 'static {
    fn call(&self, args: &Arguments) -> std::result::Result<Value, ErrorDescriptor>;
}

impl<F> ServiceFunction for F
where
    F: Fn(&Arguments) -> std::result::Result<Value, ErrorDescriptor> + Send + Sync + 'static,
{
    fn call(&self, args: &Arguments) -> std::result::Result<Value, ErrorDescriptor> {
        self(args)
    }
}

/// A function together with its descriptor.
#[derive(Clone)]
pub struct Service {
    descriptor: FunctionDescriptor,
    function: Arc<dyn ServiceFunction>,
}

impl Service {
    /// Start describing the closure `function` as a service named `name`.
    ///
    /// For types implementing [`ServiceFunction`] directly use
    /// [`ServiceBuilder::new`].
    pub fn builder<F>(name: impl Into<String>, function: F) -> ServiceBuilder
    where
        F: Fn(&Arguments) -> std::result::Result<Value, ErrorDescriptor> + Send + Sync + 'static,
    {
        ServiceBuilder::new(name, function)
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub(crate) fn function(&self) -> Arc<dyn ServiceFunction> {
        self.function.clone()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Service`].
pub struct ServiceBuilder {
    name: String,
    docstring: String,
    signature: Option<Signature>,
    cache: CachePolicy,
    function: Arc<dyn ServiceFunction>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>, function: impl ServiceFunction) -> Self {
        Self {
            name: name.into(),
            docstring: String::new(),
            signature: None,
            cache: CachePolicy::disabled(),
            function: Arc::new(function),
        }
    }

    /// Documentation returned to docstring queries.
    ///
    /// Default: empty
    pub fn docstring(mut self, docstring: impl Into<String>) -> Self {
        self.docstring = docstring.into();
        self
    }

    /// Declare parameters. Calls are validated against them before the
    /// function runs.
    ///
    /// Default: none (any arguments are passed through)
    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Cache results, keeping at most `capacity` of them (`0` for no limit).
    ///
    /// Default: caching disabled
    pub fn lru(mut self, capacity: usize) -> Self {
        self.cache = CachePolicy::lru(capacity);
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = policy;
        self
    }

    /// Validate and build the service.
    pub fn build(self) -> Result<Service> {
        validate_function_name(&self.name)?;
        if let Some(signature) = &self.signature {
            signature.validate()?;
        }

        Ok(Service {
            descriptor: FunctionDescriptor {
                name: self.name,
                docstring: self.docstring,
                signature: self.signature,
                cache: self.cache,
            },
            function: self.function,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn sum_signature() -> Signature {
        Signature::new(["a", "b"])
    }

    #[test]
    fn test_bind_accepts_positional_and_keyword() {
        let sig = sum_signature();
        assert!(sig.bind(&[json!(1), json!(2)], &Map::new()).is_ok());
        assert!(sig.bind(&[json!(1)], &kwargs(json!({"b": 2}))).is_ok());
        assert!(sig.bind(&[], &kwargs(json!({"b": 2, "a": 1}))).is_ok());
    }

    #[test]
    fn test_bind_missing_argument() {
        let err = sum_signature().bind(&[json!(1)], &Map::new()).unwrap_err();
        assert_eq!(err.kind, ErrorDescriptor::INVALID_ARGUMENTS);
        assert_eq!(err.message, "missing a required argument: 'b'");
    }

    #[test]
    fn test_bind_too_many_positional() {
        let err = sum_signature()
            .bind(&[json!(1), json!(2), json!(3)], &Map::new())
            .unwrap_err();
        assert!(err.message.starts_with("too many positional arguments"));
    }

    #[test]
    fn test_bind_unexpected_and_duplicate_keywords() {
        let sig = sum_signature();

        let err = sig
            .bind(&[json!(1), json!(2)], &kwargs(json!({"c": 3})))
            .unwrap_err();
        assert_eq!(err.message, "got an unexpected keyword argument 'c'");

        let err = sig.bind(&[json!(1)], &kwargs(json!({"a": 3}))).unwrap_err();
        assert_eq!(err.message, "multiple values for argument 'a'");
    }

    #[test]
    fn test_bind_defaults_and_variadic() {
        let sig = Signature::new(["n"]).with_param(Parameter::optional("step", json!(1)));
        assert!(sig.bind(&[json!(5)], &Map::new()).is_ok());

        let sig = Signature::variadic();
        assert!(sig.bind(&[json!(1), json!(2), json!(3)], &Map::new()).is_ok());
        assert!(sig.bind(&[], &kwargs(json!({"x": 1}))).is_err());
    }

    #[test]
    fn test_arguments_resolution() {
        let sig = Arc::new(Signature::new(["a"]).with_param(Parameter::optional("b", json!(10))));

        let args = Arguments::new(vec![json!(1)], Map::new()).with_signature(Some(sig.clone()));
        assert_eq!(args.value::<i64>("a").unwrap(), 1);
        assert_eq!(args.value::<i64>("b").unwrap(), 10);

        let args = Arguments::new(vec![], kwargs(json!({"a": 2, "b": 3}))).with_signature(Some(sig));
        assert_eq!(args.value::<i64>("a").unwrap(), 2);
        assert_eq!(args.value::<i64>("b").unwrap(), 3);
    }

    #[test]
    fn test_arguments_rest_and_type_errors() {
        let sig = Arc::new(Signature::new(["first"]).with_variadic(true));
        let args = Arguments::new(vec![json!("x"), json!(1), json!(2)], Map::new())
            .with_signature(Some(sig));

        assert_eq!(args.rest(), &[json!(1), json!(2)]);
        let err = args.value::<i64>("first").unwrap_err();
        assert_eq!(err.kind, ErrorDescriptor::INVALID_ARGUMENTS);
        assert!(err.message.starts_with("argument 'first'"));
    }

    #[test]
    fn test_builder_defaults() {
        let service = Service::builder("noop", |_| Ok(Value::Null))
            .build()
            .unwrap();

        let descriptor = service.descriptor();
        assert_eq!(descriptor.name, "noop");
        assert_eq!(descriptor.docstring, "");
        assert!(descriptor.signature.is_none());
        assert!(!descriptor.cache.enabled);
    }

    #[test]
    fn test_builder_rejects_bad_name_and_signature() {
        let result = Service::builder("a/b", |_| Ok(Value::Null)).build();
        assert!(matches!(result, Err(LipError::Validation { .. })));

        let result = Service::builder("f", |_| Ok(Value::Null))
            .signature(Signature::new(["a", "a"]))
            .build();
        assert!(matches!(result, Err(LipError::Validation { .. })));

        let result = Service::builder("f", |_| Ok(Value::Null))
            .signature(
                Signature::default()
                    .with_param(Parameter::optional("a", json!(0)))
                    .with_param(Parameter::required("b")),
            )
            .build();
        assert!(matches!(result, Err(LipError::Validation { .. })));
    }
}
