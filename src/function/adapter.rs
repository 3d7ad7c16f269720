//! Calling-convention adapter.
//!
//! Invokes a bound [`Handler`] under its protocol and unifies every way it can
//! answer into a single [`Reply`]:
//!
//! ```text
//!  Nullary / Event / EventContext ──► await ──► Some(reply) ─────────┐
//!                                          └──► None / Err / panic ──┤
//!  Callback ──► callback(..) ───────────────────────────────────────┤──► Callback slot ──► Reply
//!           └─► return value (truthy) ──────────────────────────────┤    (first wins)
//!           └─► pending ──► resolve (truthy) / reject / panic ──────┘
//! ```

use crate::function::callback::{Callback, Delivery};
use crate::function::handler::{
    CallbackFn, FunctionContext, FunctionError, FunctionResult, Handler, Protocol, Returned,
};
use crate::http::{is_truthy, Event, Reply, INTERNAL_SERVER_ERROR};
use crate::runtime::telemetry::SpanStatus;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Name of the span covering one invocation.
pub const INVOCATION_SPAN: &str = "userFunction";

/// Ways an invocation can fail to produce a regular outcome.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The function threw or rejected.
    #[error("function failed: {0}")]
    Failed(FunctionError),
    /// The function panicked.
    #[error("function panicked: {0}")]
    Panicked(String),
    /// A returning protocol resolved without a result.
    #[error("{protocol} function produced no result")]
    MissingResult { protocol: Protocol },
    /// A returning protocol resolved with a status HTTP cannot carry.
    #[error("{protocol} function answered with invalid status {status}")]
    InvalidStatus { protocol: Protocol, status: u16 },
    /// Every callback handle was dropped without a delivery.
    #[error("function finished without delivering a result")]
    Undelivered,
    /// The handler cannot serve this kind of request.
    #[error("{protocol} function cannot serve plain HTTP requests")]
    WrongProtocol { protocol: Protocol },
}

impl InvocationError {
    /// Status to answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            InvocationError::Failed(err) => err.status_code(),
            _ => 500,
        }
    }

    /// Message to answer with. Only thrown values expose their own message.
    pub fn message(&self) -> &str {
        match self {
            InvocationError::Failed(err) => err.message(),
            _ => INTERNAL_SERVER_ERROR,
        }
    }

    /// The reply this error turns into.
    pub fn to_reply(&self) -> Reply {
        Reply::new(self.status_code(), self.message())
    }
}

/// Invoke `handler` for one request and wait for its single outcome.
///
/// A `userFunction` span covers the whole invocation; it is ended on every
/// path and carries an error status when the outcome is a failure.
pub async fn invoke(handler: &Handler, event: Event, context: FunctionContext) -> Reply {
    let protocol = handler.protocol();
    let mut span = context.tracer.start_span(INVOCATION_SPAN);
    let (callback, delivered) = Callback::channel();

    debug!("Invoking {} function", protocol);

    match handler {
        Handler::Nullary(f) => {
            let future = guarded(|| f());
            settle(protocol, future, callback).await;
        }
        Handler::Event(f) => {
            let future = guarded(|| f(event));
            settle(protocol, future, callback).await;
        }
        Handler::EventContext(f) => {
            let future = guarded(|| f(event, context));
            settle(protocol, future, callback).await;
        }
        Handler::Callback(f) => dispatch_callback(f, event, context, callback),
        Handler::Session(_) => fail(&callback, InvocationError::WrongProtocol { protocol }),
    }

    let (reply, failure) = match delivered.await {
        Ok(Delivery { reply, error, .. }) => (reply, error),
        Err(_) => {
            let err = InvocationError::Undelivered;
            warn!("{} function: {}", protocol, err);
            (err.to_reply(), Some(err.to_string()))
        }
    };

    span.set_status(match failure {
        Some(message) => SpanStatus::Error { message },
        None => SpanStatus::Ok,
    });
    span.end();

    reply
}

/// Call `f`, turning a synchronous panic into a failed result.
fn guarded<F>(f: F) -> Result<BoxFuture<'static, FunctionResult>, String>
where
    F: FnOnce() -> BoxFuture<'static, FunctionResult>,
{
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|panic| panic_message(&*panic))
}

/// Await a returning protocol and deliver its result.
async fn settle(
    protocol: Protocol,
    future: Result<BoxFuture<'static, FunctionResult>, String>,
    callback: Callback,
) {
    let future = match future {
        Ok(future) => future,
        Err(panic) => return fail(&callback, InvocationError::Panicked(panic)),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(Some(reply))) if !reply.has_valid_status() => fail(
            &callback,
            InvocationError::InvalidStatus {
                protocol,
                status: reply.status,
            },
        ),
        Ok(Ok(Some(reply))) => {
            callback.succeed(reply);
        }
        Ok(Ok(None)) => fail(&callback, InvocationError::MissingResult { protocol }),
        Ok(Err(err)) => fail(&callback, InvocationError::Failed(err)),
        Err(panic) => fail(&callback, InvocationError::Panicked(panic_message(&*panic))),
    }
}

/// Run a callback-style function.
///
/// The synchronous part runs inline. A pending result resolves on a detached
/// task, so a callback fired before the future settles answers immediately.
fn dispatch_callback(f: &CallbackFn, event: Event, context: FunctionContext, callback: Callback) {
    let returned =
        std::panic::catch_unwind(AssertUnwindSafe(|| f(event, context, callback.clone())));

    match returned {
        Err(panic) => fail(&callback, InvocationError::Panicked(panic_message(&*panic))),
        Ok(Err(err)) => fail(&callback, InvocationError::Failed(err)),
        Ok(Ok(Returned::Nothing)) => {}
        Ok(Ok(Returned::Value(value))) => {
            if is_truthy(&value) {
                callback.succeed(Reply::ok(value));
            }
        }
        Ok(Ok(Returned::Pending(future))) => {
            tokio::spawn(async move {
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(Ok(Some(value))) if is_truthy(&value) => {
                        callback.succeed(Reply::ok(value));
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => fail(&callback, InvocationError::Failed(err)),
                    Err(panic) => {
                        fail(&callback, InvocationError::Panicked(panic_message(&*panic)))
                    }
                }
            });
        }
    }
}

fn fail(callback: &Callback, err: InvocationError) {
    match &err {
        InvocationError::Failed(inner) => warn!("User function error: {}", inner),
        other => error!("User function error: {}", other),
    }
    callback.fail(err.to_reply(), err.to_string());
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::telemetry::tests::RecordingTracer;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn context(tracer: &RecordingTracer) -> FunctionContext {
        FunctionContext::new("test-fn", Arc::new(tracer.clone()))
    }

    async fn run(handler: Handler) -> (Reply, RecordingTracer) {
        let tracer = RecordingTracer::default();
        let reply = invoke(&handler, Event::new("GET", "/"), context(&tracer)).await;
        (reply, tracer)
    }

    fn single_span(tracer: &RecordingTracer) -> (String, SpanStatus, bool) {
        let spans = tracer.spans.lock().unwrap();
        assert_eq!(spans.len(), 1);
        spans[0].clone()
    }

    #[tokio::test]
    async fn test_every_protocol_succeeds_with_200() {
        let handlers = vec![
            Handler::nullary(|| async { Ok(Some(Reply::ok("hello"))) }),
            Handler::event(|_event| async { Ok(Some(Reply::ok("hello"))) }),
            Handler::event_context(|_event, _ctx| async { Ok(Some(Reply::ok("hello"))) }),
            Handler::callback(|_event, _ctx, callback| {
                callback.send(200, "hello");
                Ok(Returned::Nothing)
            }),
        ];

        for handler in handlers {
            let protocol = handler.protocol();
            let (reply, tracer) = run(handler).await;
            assert_eq!(reply, Reply::ok("hello"), "protocol {}", protocol);

            let (name, status, ended) = single_span(&tracer);
            assert_eq!(name, INVOCATION_SPAN);
            assert_eq!(status, SpanStatus::Ok);
            assert!(ended);
        }
    }

    #[tokio::test]
    async fn test_every_protocol_maps_thrown_status_and_msg() {
        let handlers = vec![
            Handler::nullary(|| async { Err(FunctionError::with_status(404, "nope")) }),
            Handler::event(|_event| async { Err(FunctionError::with_status(404, "nope")) }),
            Handler::event_context(|_event, _ctx| async {
                Err(FunctionError::with_status(404, "nope"))
            }),
            Handler::callback(|_event, _ctx, _callback| {
                Err(FunctionError::with_status(404, "nope"))
            }),
        ];

        for handler in handlers {
            let protocol = handler.protocol();
            let (reply, tracer) = run(handler).await;
            assert_eq!(reply, Reply::new(404, "nope"), "protocol {}", protocol);

            let (_, status, ended) = single_span(&tracer);
            assert!(matches!(status, SpanStatus::Error { .. }));
            assert!(ended);
        }
    }

    #[tokio::test]
    async fn test_bare_throw_is_500_internal_server_error() {
        let handlers = vec![
            Handler::nullary(|| async { Err(FunctionError::opaque()) }),
            Handler::callback(|_event, _ctx, _callback| Err(FunctionError::opaque())),
        ];

        for handler in handlers {
            let (reply, _) = run(handler).await;
            assert_eq!(reply, Reply::new(500, "Internal server error"));
        }
    }

    #[tokio::test]
    async fn test_missing_result_is_not_an_implicit_200() {
        let (reply, tracer) = run(Handler::event(|_event| async { Ok(None) })).await;
        assert_eq!(reply.status, 500);

        let (_, status, _) = single_span(&tracer);
        assert_eq!(
            status,
            SpanStatus::Error {
                message: "event function produced no result".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_status_is_recorded_as_failure() {
        for status in [0, 1000] {
            let (reply, tracer) =
                run(Handler::nullary(move || async move { Ok(Some(Reply::empty(status))) }))
                    .await;
            assert_eq!(reply, Reply::new(500, "Internal server error"));

            let (_, span_status, ended) = single_span(&tracer);
            assert_eq!(
                span_status,
                SpanStatus::Error {
                    message: format!("nullary function answered with invalid status {}", status)
                }
            );
            assert!(ended);
        }
    }

    async fn explode(_event: Event) -> FunctionResult {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn test_panics_become_500() {
        let (reply, _) = run(Handler::event(explode)).await;
        assert_eq!(reply, Reply::new(500, "Internal server error"));

        let (reply, _) = run(Handler::callback(|_event, _ctx, _callback| panic!("kaboom"))).await;
        assert_eq!(reply, Reply::new(500, "Internal server error"));
    }

    #[tokio::test]
    async fn test_callback_return_value_is_an_implicit_200() {
        let (reply, _) = run(Handler::callback(|_event, _ctx, _callback| {
            Ok(Returned::Value(json!({"id": 7})))
        }))
        .await;
        assert_eq!(reply, Reply::ok(json!({"id": 7})));
    }

    #[tokio::test]
    async fn test_callback_pending_resolution_and_rejection() {
        let (reply, _) = run(Handler::callback(|_event, _ctx, _callback| {
            Ok(Returned::pending(async { Ok(Some(Value::from("later"))) }))
        }))
        .await;
        assert_eq!(reply, Reply::ok("later"));

        let (reply, tracer) = run(Handler::callback(|_event, _ctx, _callback| {
            Ok(Returned::pending(async {
                Err(FunctionError::with_status(409, "conflict"))
            }))
        }))
        .await;
        assert_eq!(reply, Reply::new(409, "conflict"));
        let (_, status, ended) = single_span(&tracer);
        assert!(matches!(status, SpanStatus::Error { .. }));
        assert!(ended);
    }

    #[tokio::test]
    async fn test_falsy_return_leaves_delivery_to_the_callback() {
        let (reply, _) = run(Handler::callback(|_event, _ctx, callback| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                callback.send(201, "from callback");
            });
            Ok(Returned::Value(Value::from("")))
        }))
        .await;
        assert_eq!(reply, Reply::new(201, "from callback"));
    }

    #[tokio::test]
    async fn test_explicit_callback_beats_resolved_value() {
        let (reply, _) = run(Handler::callback(|_event, _ctx, callback| {
            callback.send(202, "first");
            Ok(Returned::pending(async { Ok(Some(Value::from("second"))) }))
        }))
        .await;
        assert_eq!(reply, Reply::new(202, "first"));
    }

    #[tokio::test]
    async fn test_early_callback_answers_before_pending_settles() {
        let settled = Arc::new(Mutex::new(false));
        let flag = settled.clone();
        let (reply, _) = run(Handler::callback(move |_event, _ctx, callback| {
            callback.send(200, "early");
            let flag = flag.clone();
            Ok(Returned::pending(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                *flag.lock().unwrap() = true;
                Ok(None)
            }))
        }))
        .await;
        assert_eq!(reply, Reply::ok("early"));
        assert!(!*settled.lock().unwrap());
    }

    #[tokio::test]
    async fn test_dropped_callback_without_delivery_is_500() {
        let (reply, tracer) = run(Handler::callback(|_event, _ctx, _callback| {
            Ok(Returned::Nothing)
        }))
        .await;
        assert_eq!(reply.status, 500);
        let (_, status, ended) = single_span(&tracer);
        assert!(matches!(status, SpanStatus::Error { .. }));
        assert!(ended);
    }

    #[tokio::test]
    async fn test_session_handler_rejects_plain_requests() {
        let (reply, _) = run(Handler::session(|_session, _ctx| async { Ok(()) })).await;
        assert_eq!(reply.status, 500);
    }

    #[tokio::test]
    async fn test_event_and_context_are_passed_through() {
        let handler = Handler::event_context(|event: Event, ctx: FunctionContext| async move {
            Ok(Some(Reply::ok(json!({
                "path": event.path,
                "function": ctx.function_name,
            }))))
        });
        let tracer = RecordingTracer::default();
        let reply = invoke(&handler, Event::new("POST", "/orders"), context(&tracer)).await;
        assert_eq!(reply.body, json!({"path": "/orders", "function": "test-fn"}));
    }
}
