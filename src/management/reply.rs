//! Handler results and completion continuations
//!
//! A handler answers a management request with a [`Reply`], which is either
//! already available or a future. Notification-mode requests carry a
//! [`Done`] whose paired reply resolves when the application calls it.

use crate::error::{DeviceError, DeviceResult};
use crate::protocol::CorrelationId;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Outcome of a handler: response data or an error message
pub type ReplyResult = Result<Value, String>;

/// Handler result that is either ready or pending
pub enum Reply {
    Ready(ReplyResult),
    Pending(Pin<Box<dyn Future<Output = ReplyResult> + Send + 'static>>),
}

impl Reply {
    pub fn ok(value: impl Into<Value>) -> Self {
        Reply::Ready(Ok(value.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Ready(Err(message.into()))
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = ReplyResult> + Send + 'static,
    {
        Reply::Pending(Box::pin(future))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Reply::Ready(_))
    }

    /// Wait for the outcome
    pub async fn resolve(self) -> ReplyResult {
        match self {
            Reply::Ready(result) => result,
            Reply::Pending(future) => future.await,
        }
    }
}

impl From<ReplyResult> for Reply {
    fn from(result: ReplyResult) -> Self {
        Reply::Ready(result)
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Reply::Pending(_) => f.write_str("Pending"),
        }
    }
}

const DROPPED_WITHOUT_REPLY: &str = "request dropped without reply";

/// Continuation handed to the application with a control or config notification
///
/// Clones share one slot; the first `complete` wins and later calls return
/// false.
#[derive(Clone)]
pub struct Done {
    sender: Arc<Mutex<Option<oneshot::Sender<ReplyResult>>>>,
}

impl Done {
    /// Create a continuation and the reply it resolves
    ///
    /// If every clone is dropped without completing, the reply resolves to an
    /// error.
    pub fn channel() -> (Done, Reply) {
        let (tx, rx) = oneshot::channel();
        let reply = Reply::pending(async move {
            rx.await
                .unwrap_or_else(|_| Err(DROPPED_WITHOUT_REPLY.to_string()))
        });
        (
            Done {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            reply,
        )
    }

    pub fn complete(&self, result: ReplyResult) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => {
                // The receiver may be gone if the dispatcher shut down
                let _ = sender.send(result);
                true
            }
            None => false,
        }
    }

    pub fn ok(&self, value: impl Into<Value>) -> bool {
        self.complete(Ok(value.into()))
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.complete(Err(message.into()))
    }

    pub fn is_completed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl std::fmt::Debug for Done {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Done")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Future for the outcome of a device-initiated request
#[derive(Debug)]
pub struct PendingReply {
    id: CorrelationId,
    receiver: oneshot::Receiver<DeviceResult<Value>>,
}

impl PendingReply {
    pub(crate) fn new(id: CorrelationId, receiver: oneshot::Receiver<DeviceResult<Value>>) -> Self {
        Self { id, receiver }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }
}

impl Future for PendingReply {
    type Output = DeviceResult<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let id = this.id;
        Pin::new(&mut this.receiver).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(DeviceError::Cancelled {
                    id,
                    reason: "transaction dropped".to_string(),
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_reply() {
        let reply = Reply::ok("pong");
        assert!(reply.is_ready());
        assert_eq!(reply.resolve().await, Ok(Value::from("pong")));

        let reply = Reply::error("unsupported");
        assert_eq!(reply.resolve().await, Err("unsupported".to_string()));
    }

    #[tokio::test]
    async fn test_pending_reply() {
        let reply = Reply::pending(async { Ok(Value::from(42)) });
        assert!(!reply.is_ready());
        assert_eq!(reply.resolve().await, Ok(Value::from(42)));
    }

    #[tokio::test]
    async fn test_done_first_completion_wins() {
        let (done, reply) = Done::channel();
        let other = done.clone();

        assert!(done.ok("ok"));
        assert!(!other.fail("too late"));
        assert!(!done.ok("again"));
        assert!(other.is_completed());
        assert_eq!(reply.resolve().await, Ok(Value::from("ok")));
    }

    #[tokio::test]
    async fn test_done_dropped_resolves_to_error() {
        let (done, reply) = Done::channel();
        drop(done);
        assert_eq!(
            reply.resolve().await,
            Err(DROPPED_WITHOUT_REPLY.to_string())
        );
    }

    #[tokio::test]
    async fn test_pending_reply_future() {
        let (tx, rx) = oneshot::channel();
        let pending = PendingReply::new(9, rx);
        assert_eq!(pending.correlation_id(), 9);

        tx.send(Ok(Value::from("cfg"))).unwrap();
        assert_eq!(pending.await.unwrap(), Value::from("cfg"));
    }

    #[tokio::test]
    async fn test_pending_reply_sender_dropped() {
        let (tx, rx) = oneshot::channel::<DeviceResult<Value>>();
        let pending = PendingReply::new(9, rx);
        drop(tx);
        assert!(pending.await.unwrap_err().is_cancelled());
    }
}
