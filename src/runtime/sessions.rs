//! Realtime session tracking: liveness sweeps and warm/cold activity.
//!
//! The first session ever opened marks the process warm. From then on a
//! periodic sweep pings every open session and terminates those that missed
//! the previous ping. A sweep that finds no sessions reports the process idle.

use crate::function::handler::{FunctionContext, SessionFn};
use crate::function::session::{Session, SessionMessage};
use crate::runtime::activity::{Activity, ActivityNotifier};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// Command sent from the tracker to a session pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Ping,
    Terminate,
}

#[derive(Debug)]
struct SessionRecord {
    alive: bool,
    control: mpsc::UnboundedSender<Control>,
}

/// Outcome of one liveness sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub terminated: usize,
    pub ended: bool,
}

#[derive(Debug)]
pub struct SessionTracker {
    warm: AtomicBool,
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, SessionRecord>>,
    notifier: Arc<dyn ActivityNotifier>,
}

impl SessionTracker {
    pub fn new(notifier: Arc<dyn ActivityNotifier>) -> Self {
        Self {
            warm: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, SessionRecord>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a session has ever been opened.
    pub fn is_warm(&self) -> bool {
        self.warm.load(Ordering::Acquire)
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a new live session. Returns its id and the control channel its
    /// pump must follow.
    pub fn open(&self) -> (u64, mpsc::UnboundedReceiver<Control>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (control, commands) = mpsc::unbounded_channel();
        self.lock().insert(
            id,
            SessionRecord {
                alive: true,
                control,
            },
        );
        debug!("Session {} opened", id);

        if !self.warm.swap(true, Ordering::AcqRel) {
            info!("First session opened, process is warm");
            self.emit(Activity::SessionStarted);
        }
        (id, commands)
    }

    /// The peer answered a ping.
    pub fn pong(&self, id: u64) {
        if let Some(record) = self.lock().get_mut(&id) {
            record.alive = true;
        }
    }

    /// Forget a closed session.
    pub fn close(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            debug!("Session {} closed", id);
        }
    }

    /// Run one liveness sweep. Does nothing until the process is warm.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.is_warm() {
            return report;
        }

        let mut sessions = self.lock();
        if sessions.is_empty() {
            drop(sessions);
            debug!("No open sessions");
            self.emit(Activity::SessionEnded);
            report.ended = true;
            return report;
        }

        let mut silent = Vec::new();
        for (id, record) in sessions.iter_mut() {
            if record.alive {
                record.alive = false;
                if record.control.send(Control::Ping).is_ok() {
                    report.pinged += 1;
                }
            } else {
                silent.push(*id);
            }
        }
        for id in silent {
            if let Some(record) = sessions.remove(&id) {
                info!("Terminating session {}: no answer to the last ping", id);
                let _ = record.control.send(Control::Terminate);
                report.terminated += 1;
            }
        }
        report
    }

    /// Terminate every open session.
    pub fn terminate_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, record) in &drained {
            let _ = record.control.send(Control::Terminate);
        }
        if !drained.is_empty() {
            info!("Terminated {} open session(s)", drained.len());
        }
        drained.len()
    }

    /// Sweep every `period` until `shutdown` flips.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        let report = tracker.sweep();
                        debug!("Liveness sweep: {:?}", report);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Fire-and-forget notification; failures are logged and dropped.
    fn emit(&self, activity: Activity) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(activity).await {
                warn!("Failed to report '{}' activity: {}", activity, err);
            }
        });
    }
}

fn to_message(message: SessionMessage) -> Message {
    match message {
        SessionMessage::Text(text) => Message::Text(text),
        SessionMessage::Binary(bytes) => Message::Binary(bytes.to_vec()),
    }
}

/// Pump one upgraded socket: peer frames go to the user's [`Session`],
/// user messages go to the peer, and tracker commands are executed.
pub async fn run_session(
    socket: WebSocket,
    tracker: Arc<SessionTracker>,
    handler: SessionFn,
    context: FunctionContext,
) {
    let (id, mut control) = tracker.open();
    let (mut sink, mut stream) = socket.split();
    let (inbound, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound) = mpsc::unbounded_channel();

    let mut user = tokio::spawn(handler(Session::new(id, inbound_rx, outbound_tx), context));
    let mut outbound_open = true;

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send(SessionMessage::Text(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = inbound.send(SessionMessage::Binary(Bytes::from(data)));
                }
                Some(Ok(Message::Pong(_))) => tracker.pong(id),
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Session {} closed by peer", id);
                    break;
                }
                Some(Err(err)) => {
                    debug!("Session {} socket error: {}", id, err);
                    break;
                }
            },
            message = outbound.recv(), if outbound_open => match message {
                Some(message) => {
                    if sink.send(to_message(message)).await.is_err() {
                        break;
                    }
                }
                None => outbound_open = false,
            },
            command = control.recv() => match command {
                Some(Control::Ping) => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Some(Control::Terminate) | None => {
                    debug!("Session {} terminated", id);
                    break;
                }
            },
            finished = &mut user => {
                match finished {
                    Ok(Ok(())) => debug!("Session {} handler returned", id),
                    Ok(Err(err)) => warn!("Session {} handler failed: {}", id, err),
                    Err(join_err) if join_err.is_panic() => {
                        error!("Session {} handler panicked", id)
                    }
                    Err(join_err) => warn!("Session {} handler aborted: {}", id, join_err),
                }
                break;
            }
        }
    }

    while let Ok(message) = outbound.try_recv() {
        if sink.send(to_message(message)).await.is_err() {
            break;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    tracker.close(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::ActivityError;
    use async_trait::async_trait;

    #[derive(Debug, Default, Clone)]
    pub(crate) struct RecordingNotifier {
        pub activities: Arc<Mutex<Vec<Activity>>>,
    }

    #[async_trait]
    impl ActivityNotifier for RecordingNotifier {
        async fn notify(&self, activity: Activity) -> Result<(), ActivityError> {
            self.activities.lock().unwrap().push(activity);
            Ok(())
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_sweep_is_idle_until_warm() {
        let notifier = RecordingNotifier::default();
        let tracker = SessionTracker::new(Arc::new(notifier.clone()));

        assert_eq!(tracker.sweep(), SweepReport::default());
        settle().await;
        assert!(notifier.activities.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_open_starts_and_empty_sweep_ends() {
        let notifier = RecordingNotifier::default();
        let tracker = SessionTracker::new(Arc::new(notifier.clone()));

        let (a, _ca) = tracker.open();
        let (_b, _cb) = tracker.open();
        assert!(tracker.is_warm());
        tracker.close(a);
        tracker.terminate_all();

        let report = tracker.sweep();
        assert!(report.ended);
        settle().await;
        assert_eq!(
            *notifier.activities.lock().unwrap(),
            vec![Activity::SessionStarted, Activity::SessionEnded]
        );
    }

    #[tokio::test]
    async fn test_sweep_terminates_silent_and_repings_answering() {
        let tracker = SessionTracker::new(Arc::new(RecordingNotifier::default()));
        let (silent, mut silent_ctl) = tracker.open();
        let (answering, mut answering_ctl) = tracker.open();

        let first = tracker.sweep();
        assert_eq!(first.pinged, 2);
        assert_eq!(silent_ctl.recv().await, Some(Control::Ping));
        assert_eq!(answering_ctl.recv().await, Some(Control::Ping));

        tracker.pong(answering);
        let second = tracker.sweep();
        assert_eq!(second.terminated, 1);
        assert_eq!(second.pinged, 1);
        assert_eq!(silent_ctl.recv().await, Some(Control::Terminate));
        assert_eq!(answering_ctl.recv().await, Some(Control::Ping));
        assert_eq!(tracker.len(), 1);

        tracker.close(silent);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let tracker = Arc::new(SessionTracker::new(Arc::new(RecordingNotifier::default())));
        let (_id, mut control) = tracker.open();
        let (tx, rx) = watch::channel(false);
        let sweeper = tracker.spawn_sweeper(Duration::from_millis(20), rx);

        let first = tokio::time::timeout(Duration::from_secs(2), control.recv()).await;
        assert_eq!(first.unwrap(), Some(Control::Ping));

        tx.send_replace(true);
        sweeper.await.unwrap();
    }
}
