//! HTTP-facing types: the invocation event and the unified reply.

mod event;
mod response;

pub use event::{CloudEventAttributes, Event};
pub use response::{is_truthy, render, Reply, INTERNAL_SERVER_ERROR};
