//! Connection lifecycle tracking and graceful-shutdown draining.
//!
//! Every accepted connection is recorded as idle or busy. On shutdown idle
//! connections are closed at once; busy ones are closed as soon as their
//! response has been written.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::{Body, Frame, SizeHint};
use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

/// Asks one connection to close.
#[derive(Debug, Default)]
pub struct CloseSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    fn request(&self) {
        if !self.requested.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Resolves once a close has been requested.
    pub async fn requested(&self) {
        if self.is_requested() {
            return;
        }
        self.notify.notified().await;
    }
}

#[derive(Debug)]
struct ConnectionRecord {
    idle: bool,
    signal: Arc<CloseSignal>,
}

#[derive(Debug, Default)]
struct TrackerState {
    shutting_down: bool,
    connections: HashMap<u64, ConnectionRecord>,
}

/// Table of open connections plus the shutdown flag.
#[derive(Debug)]
pub struct ConnectionTracker {
    next_id: AtomicU64,
    state: Mutex<TrackerState>,
    shutdown: watch::Sender<bool>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(TrackerState::default()),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a new idle connection.
    ///
    /// A connection accepted after shutdown began is asked to close at once.
    pub fn accept(self: &Arc<Self>) -> ConnectionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let signal = Arc::new(CloseSignal::default());
        let mut state = self.lock();
        if state.shutting_down {
            signal.request();
        }
        state.connections.insert(
            id,
            ConnectionRecord {
                idle: true,
                signal: signal.clone(),
            },
        );
        debug!("Connection {} accepted ({} open)", id, state.connections.len());
        ConnectionHandle {
            id,
            signal,
            tracker: self.clone(),
        }
    }

    /// Forget a connection whose transport has closed.
    pub fn remove(&self, id: u64) {
        let mut state = self.lock();
        if state.connections.remove(&id).is_some() {
            debug!("Connection {} closed ({} open)", id, state.connections.len());
        }
    }

    /// Mark a connection busy. The returned guard marks it idle again when
    /// dropped.
    pub fn request_started(self: &Arc<Self>, id: u64) -> ExchangeGuard {
        if let Some(record) = self.lock().connections.get_mut(&id) {
            record.idle = false;
        }
        ExchangeGuard {
            tracker: self.clone(),
            id,
        }
    }

    /// Mark a connection idle; close it if the host is shutting down.
    pub fn response_finished(&self, id: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(record) = state.connections.get_mut(&id) {
            record.idle = true;
            if state.shutting_down {
                debug!("Closing connection {} after its response", id);
                record.signal.request();
            }
        }
    }

    /// Begin shutdown: close every idle connection now and leave busy ones to
    /// close when their response finishes. Returns the number closed now.
    pub fn shutdown(&self) -> usize {
        let mut state = self.lock();
        if state.shutting_down {
            info!("Shutdown already in progress");
        } else {
            info!("Shutting down: no longer accepting connections");
            state.shutting_down = true;
        }

        let mut closed = 0;
        for record in state.connections.values().filter(|r| r.idle) {
            if !record.signal.is_requested() {
                closed += 1;
            }
            record.signal.request();
        }
        let busy = state.connections.values().filter(|r| !r.idle).count();
        info!(
            "Closed {} idle connection(s), {} busy connection(s) draining",
            closed, busy
        );
        drop(state);

        self.shutdown.send_replace(true);
        closed
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Receiver that flips to `true` when shutdown begins.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of open connections not serving a request.
    pub fn idle_count(&self) -> usize {
        self.lock().connections.values().filter(|r| r.idle).count()
    }
}

/// A tracked connection. Dropping it removes the record.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    signal: Arc<CloseSignal>,
    tracker: Arc<ConnectionTracker>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signal(&self) -> &CloseSignal {
        &self.signal
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.tracker.remove(self.id);
    }
}

/// Marks the end of one request/response exchange when dropped.
#[derive(Debug)]
pub struct ExchangeGuard {
    tracker: Arc<ConnectionTracker>,
    id: u64,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.tracker.response_finished(self.id);
    }
}

/// Response body that releases its exchange once hyper is done with it.
#[derive(Debug)]
pub struct TrackedBody {
    inner: Full<Bytes>,
    guard: Option<ExchangeGuard>,
}

impl TrackedBody {
    pub fn new(inner: Full<Bytes>, guard: ExchangeGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }

    /// A body not tied to any exchange.
    pub fn untracked(inner: Full<Bytes>) -> Self {
        Self { inner, guard: None }
    }
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        if let Poll::Ready(None) = polled {
            self.guard.take();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
