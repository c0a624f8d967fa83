use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Why a pipeline or session began shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The input side reached its end normally.
    EndOfInput,
    /// A queue wait exceeded its bound.
    Timeout(&'static str),
    /// Socket read/write failure or short read.
    ConnectionFault(String),
    /// Malformed payload; the stream cannot be resynchronized.
    ProtocolFault(String),
    /// The capture source failed after it was opened.
    CaptureFault(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndOfInput => write!(f, "end of input"),
            StopReason::Timeout(what) => write!(f, "timed out waiting for {what}"),
            StopReason::ConnectionFault(e) => write!(f, "connection fault: {e}"),
            StopReason::ProtocolFault(e) => write!(f, "protocol fault: {e}"),
            StopReason::CaptureFault(e) => write!(f, "capture fault: {e}"),
        }
    }
}

struct Inner {
    stopped: AtomicBool,
    reason: Mutex<Option<StopReason>>,
}

/// Cooperative cancellation shared by every stage of one pipeline or session.
///
/// Stages check [`StopToken::is_stopped`] at each wait boundary. Only the
/// first reason passed to [`StopToken::stop`] is kept.
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<Inner>,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                stopped: AtomicBool::new(false),
                reason: Mutex::new(None),
            }),
        }
    }

    /// Request shutdown. Returns `true` if this call was the first.
    pub fn stop(&self, reason: StopReason) -> bool {
        let mut slot = self.inner.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        self.inner.stopped.store(true, Ordering::Release);
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopToken")
            .field("stopped", &self.is_stopped())
            .field("reason", &self.reason())
            .finish()
    }
}

/// How a stage loop ended. Returned from the stage thread and logged by
/// whoever joins it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageExit {
    pub stage: &'static str,
    pub reason: StopReason,
    /// Items the stage handled before exiting.
    pub processed: u64,
}

impl StageExit {
    pub fn new(stage: &'static str, reason: StopReason, processed: u64) -> Self {
        Self {
            stage,
            reason,
            processed,
        }
    }

    /// `true` when the stage ran to the natural end of its input.
    pub fn is_clean(&self) -> bool {
        self.reason == StopReason::EndOfInput
    }
}
