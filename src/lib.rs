//! # fnhost - Generic Function Host
//!
//! fnhost starts as a *generic container*: an HTTP server with no function
//! bound. It is then *specialized*, exactly once, to a single user function,
//! and from that point serves every request by invoking it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         FunctionServer                              │
//! │   accept ──► ConnectionTracker (idle/busy, graceful drain)          │
//! │                     │                                               │
//! │                     ▼                                               │
//! │   /healthz   /specialize   OPTIONS   everything else                │
//! │                     │                     │                         │
//! │                     ▼                     ▼                         │
//! │               Specializer ──► bound Handler ──► adapter::invoke     │
//! │               (FunctionLoader: ModuleTable, DylibResolver)          │
//! │                                                                     │
//! │   WebSocket ──► SessionTracker (liveness sweep, warm/cold activity) │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fnhost::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let modules = ModuleTable::new().with_module(
//!         "function/handler",
//!         Module::new().export(
//!             "main",
//!             Handler::event(|event: Event| async move {
//!                 Ok(Some(Reply::ok(format!("hello from {}", event.path))))
//!             }),
//!         ),
//!     );
//!
//!     let loader = FunctionLoader::new().with_resolver(modules);
//!     let host = Host::new(HostConfig::from_env()?, loader);
//!     FunctionServer::new(host).run().await
//! }
//! ```
//!
//! ## Calling conventions
//!
//! A function is classified when it is bound:
//!
//! 1. **Nullary**: `f()`
//! 2. **Event**: `f(event)`
//! 3. **Event + context**: `f(event, context)`
//! 4. **Callback**: `f(event, context, callback)`, answering through the
//!    callback, a truthy return value, or a pending result
//! 5. **Session**: `f(session, context)` for WebSocket sessions
//!
//! Every invocation produces exactly one reply. Thrown errors become their own
//! status and message; anything else becomes `500 Internal server error`.

pub mod function;
pub mod http;
pub mod runtime;

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::function::{
        Callback, FunctionContext, FunctionError, FunctionLoader, FunctionResult, Handler,
        Module, ModuleTable, Returned, Session, SessionMessage,
    };
    pub use crate::http::{Event, Reply};
    pub use crate::runtime::{FunctionServer, Host, HostConfig, SpecializationMode};
    pub use fnhost_macro::export;
    pub use serde_json::{json, Value};
}

// Re-export for convenience
pub use function::{FunctionContext, FunctionError, Handler};
pub use http::{Event, Reply};
pub use runtime::{FunctionServer, Host, HostConfig};
