//! Function host HTTP server.

use crate::function::handler::{Handler, SessionFn};
use crate::function::{invoke, SpecializeError, SpecializeRequest};
use crate::http::{render, Event, Reply};
use crate::runtime::config::SpecializationMode;
use crate::runtime::connections::{ConnectionHandle, TrackedBody};
use crate::runtime::host::Host;
use crate::runtime::sessions::run_session;
use crate::runtime::signals::ShutdownSignals;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::FromRequestParts;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD,
    UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Body of every request reaching an unspecialized host.
pub const GENERIC_CONTAINER: &str = "Generic container: no requests supported";

/// Serves the bound function over HTTP/1.
pub struct FunctionServer {
    host: Arc<Host>,
}

impl FunctionServer {
    pub fn new(host: Host) -> Self {
        Self {
            host: Arc::new(host),
        }
    }

    /// Shared host context.
    pub fn host(&self) -> Arc<Host> {
        self.host.clone()
    }

    /// Bind the configured address, install signal handlers and serve until
    /// shutdown.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = self.host.config().bind_addr().parse()?;
        let listener = TcpListener::bind(addr).await?;

        let mut signals = ShutdownSignals::new()?;
        let host = self.host.clone();
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                info!("Received {}", signal);
                host.shutdown();
            }
        });

        self.serve(listener).await
    }

    /// Serve on `listener` until shutdown, then wait for every connection to
    /// finish.
    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let host = self.host;
        let config = host.config();
        info!(
            "Function host listening on {} ({} specialization)",
            listener.local_addr()?,
            config.specialization
        );

        if config.specialization == SpecializationMode::Eager {
            if let Err(err) = host.specialize_configured().await {
                error!("Staying generic: {}", err);
            }
        }

        let mut shutdown = host.connections().subscribe();
        let sweeper = config.websocket.then(|| {
            host.sessions()
                .spawn_sweeper(config.liveness_period(), shutdown.clone())
        });

        let mut tasks = JoinSet::new();
        while !*shutdown.borrow() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let handle = host.connections().accept();
                        tasks.spawn(serve_connection(host.clone(), stream, remote_addr, handle));
                    }
                    Err(err) => warn!("Failed to accept connection: {}", err),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            while tasks.try_join_next().is_some() {}
        }

        drop(listener);
        host.sessions().terminate_all();
        info!("Waiting for {} connection(s) to drain", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!("Connection task failed: {}", err);
            }
        }
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        info!("Server stopped");
        Ok(())
    }
}

async fn serve_connection(
    host: Arc<Host>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    handle: ConnectionHandle,
) {
    let conn_id = handle.id();
    let service_host = host.clone();
    let service = service_fn(move |req| {
        let host = service_host.clone();
        async move { handle_request(req, host, conn_id, remote_addr).await }
    });

    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    let result = tokio::select! {
        served = conn.as_mut() => served,
        _ = handle.signal().requested() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    if let Err(err) = result {
        debug!("Error serving connection {}: {:?}", conn_id, err);
    }
}

/// Handle an incoming HTTP request.
async fn handle_request(
    req: Request<Incoming>,
    host: Arc<Host>,
    conn_id: u64,
    remote_addr: SocketAddr,
) -> Result<Response<TrackedBody>, Infallible> {
    let exchange = host.connections().request_started(conn_id);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let span = info_span!("request", method = %method, path = %path, conn = conn_id);
    let response = route(req, &host).instrument(span).await;

    if host.config().request_logging {
        info!(
            "{} \"{} {}\" {} {:?}",
            remote_addr,
            method,
            path,
            response.status().as_u16(),
            started.elapsed()
        );
    }

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, TrackedBody::new(body, exchange)))
}

async fn route(req: Request<Incoming>, host: &Arc<Host>) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();

    if path == "/healthz" {
        return render(Reply::empty(200));
    }

    if host.config().specialization == SpecializationMode::OnDemand && req.method() == Method::POST
    {
        match path.as_str() {
            "/specialize" => {
                let request = SpecializeRequest::Static {
                    module_path: host.config().module_path.clone(),
                    entrypoint: host.config().entrypoint.clone(),
                };
                return specialize(host, Ok(request)).await;
            }
            "/v2/specialize" => {
                let request = match collect_body(req, host.config().body_limit_bytes()).await {
                    Ok((_, body)) => SpecializeRequest::from_v2_body(&body),
                    Err(response) => return response,
                };
                return specialize(host, request).await;
            }
            _ => {}
        }
    }

    if req.method() == Method::OPTIONS {
        return cors_preflight(req.headers());
    }

    let mut response = dispatch(req, host).await;
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

async fn specialize(
    host: &Host,
    request: Result<SpecializeRequest, SpecializeError>,
) -> Response<Full<Bytes>> {
    let outcome = match request {
        Ok(request) => host.specializer().specialize(request).await.map(|_| ()),
        Err(err) => Err(err),
    };
    match outcome {
        Ok(()) => render(Reply::empty(202)),
        Err(err) => {
            warn!("Specialization failed: {}", err);
            render(err.to_reply())
        }
    }
}

/// Preflight answer mirroring the requested method and headers.
fn cors_preflight(headers: &HeaderMap) -> Response<Full<Bytes>> {
    let mut response = render(Reply::empty(200));
    let out = response.headers_mut();
    out.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    if let Some(method) = headers.get(ACCESS_CONTROL_REQUEST_METHOD) {
        out.insert(ACCESS_CONTROL_ALLOW_METHODS, method.clone());
    }
    if let Some(requested) = headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
        out.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
    response
}

async fn dispatch(req: Request<Incoming>, host: &Arc<Host>) -> Response<Full<Bytes>> {
    let bound = match host.specializer().bound() {
        Some(bound) => bound,
        None => return render(Reply::new(500, GENERIC_CONTAINER)),
    };

    if let Handler::Session(handler) = &bound.handler {
        if host.config().websocket && is_websocket_upgrade(&req) {
            return upgrade(req, host, handler.clone()).await;
        }
    }

    let (parts, body) = match collect_body(req, host.config().body_limit_bytes()).await {
        Ok(collected) => collected,
        Err(response) => return response,
    };
    let event = Event::from_parts(&parts, body);
    render(invoke(&bound.handler, event, host.function_context()).await)
}

async fn collect_body(
    req: Request<Incoming>,
    limit: usize,
) -> Result<(hyper::http::request::Parts, Bytes), Response<Full<Bytes>>> {
    let (parts, body) = req.into_parts();
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok((parts, collected.to_bytes())),
        Err(err) if err.is::<LengthLimitError>() => {
            warn!("Request body exceeds {} bytes", limit);
            Err(render(Reply::new(413, "Payload too large")))
        }
        Err(err) => {
            warn!("Failed to read request body: {}", err);
            Err(render(Reply::new(400, "Bad request")))
        }
    }
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

async fn upgrade(
    req: Request<Incoming>,
    host: &Arc<Host>,
    handler: SessionFn,
) -> Response<Full<Bytes>> {
    let (mut parts, _body) = req.into_parts();
    let ws: WebSocketUpgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!("Rejected WebSocket upgrade: {}", rejection);
            return render(Reply::new(400, "Invalid WebSocket upgrade"));
        }
    };

    let sessions = host.sessions().clone();
    let context = host.function_context();
    let response = ws.on_upgrade(move |socket| run_session(socket, sessions, handler, context));
    let (parts, _body) = response.into_parts();
    Response::from_parts(parts, Full::new(Bytes::new()))
}
