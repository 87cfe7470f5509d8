//! Cancelable operations

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::driver::QueryCanceler;
use crate::session::SessionId;

/// Identifier of an operation, unique for the lifetime of its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Query,
    Command,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The operation was running and has now stopped
    Cancelled,
    /// The operation had already reached a terminal state
    AlreadyFinished,
}

/// An in-flight statement that can be stopped from another task
///
/// The canceler is attached once the driver has issued the statement. A
/// cancel that arrives earlier is remembered through the token and applied
/// at attach time, so an operation registered before its statement was issued
/// can never miss a cancel.
///
/// The task running the statement calls [`CancelableOperation::settle`]
/// before emitting its terminal event. Settling and cancelling take the same
/// lock, so a cancel reported as [`CancelOutcome::Cancelled`] always ends in a
/// cancellation event.
pub struct CancelableOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub correlation_id: String,
    pub session_id: SessionId,
    token: CancellationToken,
    control: Mutex<Control>,
    finished: watch::Sender<bool>,
}

#[derive(Default)]
struct Control {
    canceler: Option<Arc<dyn QueryCanceler>>,
    settled: bool,
}

impl fmt::Debug for CancelableOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelableOperation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("correlation_id", &self.correlation_id)
            .field("session_id", &self.session_id)
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl CancelableOperation {
    pub fn new(
        id: OperationId,
        kind: OperationKind,
        correlation_id: impl Into<String>,
        session_id: impl Into<SessionId>,
    ) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            id,
            kind,
            correlation_id: correlation_id.into(),
            session_id: session_id.into(),
            token: CancellationToken::new(),
            control: Mutex::new(Control::default()),
            finished,
        }
    }

    /// Attach the driver's canceler; applies a cancel that arrived first
    pub fn attach(&self, canceler: Arc<dyn QueryCanceler>) {
        let mut control = self.control.lock();
        if self.token.is_cancelled() && !control.settled {
            canceler.cancel();
        }
        control.canceler = Some(canceler);
    }

    /// Signal the operation to stop
    ///
    /// Idempotent. Returns [`CancelOutcome::AlreadyFinished`] when the
    /// operation had already settled on a natural outcome.
    pub fn cancel(&self) -> CancelOutcome {
        let control = self.control.lock();
        if control.settled && !self.token.is_cancelled() {
            return CancelOutcome::AlreadyFinished;
        }
        if !self.token.is_cancelled() {
            self.token.cancel();
            if let Some(canceler) = control.canceler.as_ref() {
                canceler.cancel();
            }
        }
        CancelOutcome::Cancelled
    }

    /// Fix the terminal outcome; returns whether a cancel got there first
    ///
    /// Later calls to [`CancelableOperation::cancel`] report
    /// [`CancelOutcome::AlreadyFinished`] unless the operation was cancelled.
    pub fn settle(&self) -> bool {
        let mut control = self.control.lock();
        control.settled = true;
        self.token.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a cancel has been requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Record that the terminal event has been emitted
    pub fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Wait until the operation acknowledges its terminal state
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        let mut rx = self.finished.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|done| *done))
            .await
            .is_ok()
    }
}
