//! One-shot result sink shared by every delivery path of an invocation.
//!
//! An invocation may try to answer from several places: the function calling
//! its callback, a synchronous return value, a resolved future, or an error.
//! The first delivery wins; later ones are dropped and logged.

use crate::http::Reply;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Where a delivery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySource {
    /// The function called the callback.
    Callback,
    /// The function returned or resolved a value.
    Returned,
    /// The function failed.
    Failure,
}

/// The single outcome of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub reply: Reply,
    pub source: DeliverySource,
    /// Failure description, for failed invocations.
    pub error: Option<String>,
}

struct Slot {
    sender: Mutex<Option<oneshot::Sender<Delivery>>>,
}

/// Result sink handed to callback-style functions.
///
/// Cloning is cheap; all clones share one slot. Once every clone is dropped
/// without a delivery, the waiting side observes the invocation as
/// undelivered.
#[derive(Clone)]
pub struct Callback {
    slot: Arc<Slot>,
}

impl Callback {
    /// Create a sink and the receiver the host waits on.
    pub fn channel() -> (Callback, oneshot::Receiver<Delivery>) {
        let (tx, rx) = oneshot::channel();
        let callback = Callback {
            slot: Arc::new(Slot {
                sender: Mutex::new(Some(tx)),
            }),
        };
        (callback, rx)
    }

    /// Answer with `status` and `body`. A zero status is ignored.
    ///
    /// Returns `true` if this call delivered the outcome.
    pub fn send(&self, status: u16, body: impl Into<Value>) -> bool {
        if status == 0 {
            return false;
        }
        self.deliver(Reply::new(status, body), DeliverySource::Callback, None)
    }

    /// Answer with `status`, `body` and extra headers. A zero status is ignored.
    pub fn send_with_headers(
        &self,
        status: u16,
        body: impl Into<Value>,
        headers: HashMap<String, String>,
    ) -> bool {
        if status == 0 {
            return false;
        }
        let mut reply = Reply::new(status, body);
        reply.headers = headers;
        self.deliver(reply, DeliverySource::Callback, None)
    }

    /// Answer with a complete reply.
    pub fn reply(&self, reply: Reply) -> bool {
        if reply.status == 0 {
            return false;
        }
        self.deliver(reply, DeliverySource::Callback, None)
    }

    /// Whether an outcome has already been delivered.
    pub fn is_delivered(&self) -> bool {
        match self.slot.sender.lock() {
            Ok(guard) => guard.is_none(),
            Err(_) => true,
        }
    }

    pub(crate) fn succeed(&self, reply: Reply) -> bool {
        self.deliver(reply, DeliverySource::Returned, None)
    }

    pub(crate) fn fail(&self, reply: Reply, error: String) -> bool {
        self.deliver(reply, DeliverySource::Failure, Some(error))
    }

    fn deliver(&self, reply: Reply, source: DeliverySource, error: Option<String>) -> bool {
        let sender = match self.slot.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };

        match sender {
            Some(tx) => {
                if tx.send(Delivery { reply, source, error }).is_err() {
                    debug!("Invocation outcome arrived after the request was abandoned");
                }
                true
            }
            None => {
                warn!(
                    "Dropping second delivery ({:?}, status {}): outcome already delivered",
                    source, reply.status
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("delivered", &self.is_delivered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::handler::FunctionError;

    #[tokio::test]
    async fn test_first_delivery_wins() {
        let (callback, rx) = Callback::channel();

        assert!(callback.send(200, "ok"));
        assert!(!callback.send(500, "late"));
        assert!(!callback.fail(Reply::from(&FunctionError::opaque()), "late".to_string()));

        let delivery = rx.await.unwrap();
        assert_eq!(delivery.reply, Reply::new(200, "ok"));
        assert_eq!(delivery.source, DeliverySource::Callback);
        assert!(delivery.error.is_none());
    }

    #[tokio::test]
    async fn test_zero_status_is_a_noop() {
        let (callback, rx) = Callback::channel();

        assert!(!callback.send(0, "ignored"));
        assert!(!callback.is_delivered());
        assert!(callback.send(201, "created"));
        assert!(!callback.send(0, "ignored again"));

        assert_eq!(rx.await.unwrap().reply.status, 201);
    }

    #[tokio::test]
    async fn test_dropping_all_clones_closes_the_channel() {
        let (callback, rx) = Callback::channel();
        let clone = callback.clone();
        drop(callback);
        drop(clone);

        assert!(rx.await.is_err());
    }

    #[test]
    fn test_headers_are_carried() {
        let (callback, mut rx) = Callback::channel();
        let mut headers = HashMap::new();
        headers.insert("X-Trace".to_string(), "abc".to_string());

        assert!(callback.send_with_headers(202, "queued", headers));
        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.reply.headers["X-Trace"], "abc");
        assert!(callback.is_delivered());
    }
}
