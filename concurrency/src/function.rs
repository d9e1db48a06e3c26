//! The seam between the runtime and the embedding interpreter.
//!
//! The runtime never looks inside a process body. It asks the embedder's
//! [`Function`] for a fresh [`Environment`] and then for a future that runs
//! the body against it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::{Environment, ProcessContext};
use crate::error::{ProcessError, RuntimeError};
use crate::value::Value;

/// The future a process body runs as. It resolves once, when the body ends.
pub type ProcessFuture = BoxFuture<'static, Result<Value, ProcessError>>;

/// A callable the runtime can run as a process body.
///
/// Functions are immutable once built, which is what lets a [`FunctionRef`]
/// cross process boundaries without being copied.
pub trait Function: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Parameter names, bound positionally to the spawn arguments.
    fn params(&self) -> &[String] {
        &[]
    }

    /// Declarations nested lexically inside the function body.
    fn declarations(&self) -> Vec<(String, Value)> {
        Vec::new()
    }

    /// Build the isolated environment a new process starts with.
    ///
    /// The environment is derived from this function and `args` alone; the
    /// spawning process's bindings are never consulted.
    fn fresh_context(&self, args: Vec<Value>) -> Result<Environment, RuntimeError> {
        Environment::for_call(self.name(), self.params(), args, self.declarations())
    }

    /// Run the body. `cx` carries the environment built by `fresh_context`.
    fn execute(&self, cx: ProcessContext) -> ProcessFuture;
}

/// Shared, immutable handle to a [`Function`].
#[derive(Clone)]
pub struct FunctionRef(Arc<dyn Function>);

impl FunctionRef {
    pub fn new(function: impl Function) -> Self {
        FunctionRef(Arc::new(function))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub(crate) fn fresh_context(&self, args: Vec<Value>) -> Result<Environment, RuntimeError> {
        self.0.fresh_context(args)
    }

    pub(crate) fn execute(&self, cx: ProcessContext) -> ProcessFuture {
        self.0.execute(cx)
    }
}

impl From<Arc<dyn Function>> for FunctionRef {
    fn from(function: Arc<dyn Function>) -> Self {
        FunctionRef(function)
    }
}

impl PartialEq for FunctionRef {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FunctionRef").field(&self.name()).finish()
    }
}

type Body = dyn Fn(ProcessContext) -> ProcessFuture + Send + Sync;

/// A [`Function`] backed by a Rust closure.
///
/// ```ignore
/// let echo = NativeFunction::new("echo", |mut cx| async move {
///     cx.receive().await
/// })
/// .into_ref();
/// ```
pub struct NativeFunction {
    name: String,
    params: Vec<String>,
    declarations: Vec<(String, Value)>,
    body: Box<Body>,
}

impl NativeFunction {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(ProcessContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProcessError>> + Send + 'static,
    {
        NativeFunction {
            name: name.into(),
            params: Vec::new(),
            declarations: Vec::new(),
            body: Box::new(move |cx| Box::pin(body(cx))),
        }
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_declaration(mut self, name: impl Into<String>, value: Value) -> Self {
        self.declarations.push((name.into(), value));
        self
    }

    pub fn into_ref(self) -> FunctionRef {
        FunctionRef::new(self)
    }
}

impl Function for NativeFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> &[String] {
        &self.params
    }

    fn declarations(&self) -> Vec<(String, Value)> {
        self.declarations
            .iter()
            .map(|(name, value)| (name.clone(), value.deep_copy()))
            .collect()
    }

    fn execute(&self, cx: ProcessContext) -> ProcessFuture {
        (self.body)(cx)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}
