//! User function shapes, invocation context and the thrown-error value.

use crate::function::callback::Callback;
use crate::function::session::Session;
use crate::http::{Event, Reply, INTERNAL_SERVER_ERROR};
use crate::runtime::telemetry::Tracer;
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Execution context handed to user functions.
#[derive(Clone, Serialize)]
pub struct FunctionContext {
    /// Function name reported to the user code.
    #[serde(rename = "function-name")]
    pub function_name: String,
    /// Runtime identifier.
    pub runtime: Option<String>,
    /// Namespace the function runs in.
    pub namespace: String,
    /// Memory limit, as configured.
    #[serde(rename = "memory-limit")]
    pub memory_limit: Option<String>,
    /// Advisory time budget. The host does not enforce it.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Tracer for user-created spans.
    #[serde(skip)]
    pub tracer: Arc<dyn Tracer>,
}

impl FunctionContext {
    /// Create a context for `function_name` using `tracer`.
    pub fn new(function_name: impl Into<String>, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            function_name: function_name.into(),
            runtime: None,
            namespace: String::new(),
            memory_limit: None,
            timeout: Duration::from_secs(180),
            tracer,
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the runtime identifier.
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }
}

impl fmt::Debug for FunctionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionContext")
            .field("function_name", &self.function_name)
            .field("runtime", &self.runtime)
            .field("namespace", &self.namespace)
            .field("memory_limit", &self.memory_limit)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

/// A value thrown by a user function.
///
/// `status` and `msg` are both optional; the host falls back to 500 and a
/// generic message when they are missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionError {
    /// HTTP status to answer with.
    pub status: Option<u16>,
    /// Message to answer with.
    pub msg: Option<String>,
}

impl FunctionError {
    /// An error carrying only a message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            status: None,
            msg: Some(msg.into()),
        }
    }

    /// An error carrying a status and a message.
    pub fn with_status(status: u16, msg: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            msg: Some(msg.into()),
        }
    }

    /// An error carrying neither status nor message.
    pub fn opaque() -> Self {
        Self::default()
    }

    /// Status to answer with.
    pub fn status_code(&self) -> u16 {
        self.status.unwrap_or(500)
    }

    /// Message to answer with.
    pub fn message(&self) -> &str {
        self.msg.as_deref().unwrap_or(INTERNAL_SERVER_ERROR)
    }
}

impl fmt::Display for FunctionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.status_code(), self.message())
    }
}

impl std::error::Error for FunctionError {}

impl From<&FunctionError> for Reply {
    fn from(err: &FunctionError) -> Self {
        Reply::new(err.status_code(), err.message())
    }
}

impl From<String> for FunctionError {
    fn from(msg: String) -> Self {
        FunctionError::new(msg)
    }
}

impl From<&str> for FunctionError {
    fn from(msg: &str) -> Self {
        FunctionError::new(msg)
    }
}

impl From<serde_json::Error> for FunctionError {
    fn from(err: serde_json::Error) -> Self {
        FunctionError::with_status(400, err.to_string())
    }
}

/// Result of the arity 0-2 protocols. `Ok(None)` means "no result", which the
/// host treats as a malformed outcome.
pub type FunctionResult = Result<Option<Reply>, FunctionError>;

/// What a callback-style function hands back synchronously.
pub enum Returned {
    /// No return value; the function answers through the callback.
    Nothing,
    /// A plain return value. Delivered as a 200 body when truthy.
    Value(Value),
    /// A pending result. Delivered as a 200 body when it resolves truthy.
    Pending(BoxFuture<'static, Result<Option<Value>, FunctionError>>),
}

impl Returned {
    /// Wrap a future as a pending result.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<Option<Value>, FunctionError>> + Send + 'static,
    {
        Returned::Pending(future.boxed())
    }
}

impl fmt::Debug for Returned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Returned::Nothing => f.write_str("Nothing"),
            Returned::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Returned::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

pub type NullaryFn = Arc<dyn Fn() -> BoxFuture<'static, FunctionResult> + Send + Sync>;
pub type EventFn = Arc<dyn Fn(Event) -> BoxFuture<'static, FunctionResult> + Send + Sync>;
pub type EventContextFn =
    Arc<dyn Fn(Event, FunctionContext) -> BoxFuture<'static, FunctionResult> + Send + Sync>;
pub type CallbackFn =
    Arc<dyn Fn(Event, FunctionContext, Callback) -> Result<Returned, FunctionError> + Send + Sync>;
pub type SessionFn = Arc<
    dyn Fn(Session, FunctionContext) -> BoxFuture<'static, Result<(), FunctionError>>
        + Send
        + Sync,
>;

/// Invocation protocol of a loaded function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Nullary,
    EventOnly,
    EventContext,
    CallbackStyle,
    Session,
}

impl Protocol {
    /// Classify by declared parameter count.
    pub fn from_arity(arity: usize) -> Self {
        match arity {
            0 => Protocol::Nullary,
            1 => Protocol::EventOnly,
            2 => Protocol::EventContext,
            _ => Protocol::CallbackStyle,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Nullary => write!(f, "nullary"),
            Protocol::EventOnly => write!(f, "event"),
            Protocol::EventContext => write!(f, "event+context"),
            Protocol::CallbackStyle => write!(f, "callback"),
            Protocol::Session => write!(f, "session"),
        }
    }
}

/// A loaded user function, tagged with its invocation protocol.
#[derive(Clone)]
pub enum Handler {
    Nullary(NullaryFn),
    Event(EventFn),
    EventContext(EventContextFn),
    Callback(CallbackFn),
    Session(SessionFn),
}

impl Handler {
    /// `f()`, returning a reply.
    pub fn nullary<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult> + Send + 'static,
    {
        Handler::Nullary(Arc::new(move || f().boxed()))
    }

    /// `f(event)`, returning a reply.
    pub fn event<F, Fut>(f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult> + Send + 'static,
    {
        Handler::Event(Arc::new(move |event| f(event).boxed()))
    }

    /// `f(event, context)`, returning a reply.
    pub fn event_context<F, Fut>(f: F) -> Self
    where
        F: Fn(Event, FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult> + Send + 'static,
    {
        Handler::EventContext(Arc::new(move |event, ctx| f(event, ctx).boxed()))
    }

    /// `f(event, context, callback)`, answering through the callback or its
    /// return value.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Event, FunctionContext, Callback) -> Result<Returned, FunctionError>
            + Send
            + Sync
            + 'static,
    {
        Handler::Callback(Arc::new(f))
    }

    /// `f(session, context)`, driving one realtime session.
    pub fn session<F, Fut>(f: F) -> Self
    where
        F: Fn(Session, FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), FunctionError>> + Send + 'static,
    {
        Handler::Session(Arc::new(move |session, ctx| f(session, ctx).boxed()))
    }

    /// The protocol this handler speaks.
    pub fn protocol(&self) -> Protocol {
        match self {
            Handler::Nullary(_) => Protocol::Nullary,
            Handler::Event(_) => Protocol::EventOnly,
            Handler::EventContext(_) => Protocol::EventContext,
            Handler::Callback(_) => Protocol::CallbackStyle,
            Handler::Session(_) => Protocol::Session,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({})", self.protocol())
    }
}
