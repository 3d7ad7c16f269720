//! Host runtime: configuration, connection and session lifecycle, and the
//! HTTP server.

pub mod activity;
pub mod config;
pub mod connections;
pub mod host;
pub mod server;
pub mod sessions;
pub mod signals;
pub mod telemetry;

pub use activity::{
    Activity, ActivityError, ActivityNotifier, HttpActivityNotifier, LogActivityNotifier,
};
pub use config::{ConfigError, HostConfig, SpecializationMode};
pub use connections::ConnectionTracker;
pub use host::Host;
pub use server::{FunctionServer, GENERIC_CONTAINER};
pub use sessions::SessionTracker;
pub use telemetry::{Span, SpanStatus, SpanTracer, Tracer};
