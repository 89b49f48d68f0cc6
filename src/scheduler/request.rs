//! Request types shared across the scheduler.

use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Priority tier for a scheduled request.
///
/// Ordered so that `High > Normal`; the heap dispatches higher tiers first.
/// New tiers can be added without touching the scheduling algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Normal = 0,
    High = 1,
}

impl Priority {
    /// Parse the `X-Priority` request marker.
    ///
    /// Only `"high"` is recognized; an absent or unrecognized marker falls
    /// back to `Normal` rather than being rejected.
    pub fn from_marker(marker: Option<&str>) -> Self {
        match marker {
            Some("high") => Priority::High,
            _ => Priority::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

/// Opaque unit of work to forward upstream.
///
/// The scheduler never interprets the body; `model` is carried for
/// telemetry labels only.
#[derive(Debug, Clone)]
pub struct ProxyPayload {
    /// Upstream path, e.g. `/api/generate`.
    pub path: String,
    /// Raw request body, forwarded unchanged.
    pub body: Bytes,
    /// Model name extracted by the HTTP layer, `"unknown"` if absent.
    pub model: String,
}

/// Why a request was rejected without being serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    ShuttingDown,
}

/// Handle to an accepted upstream response stream.
///
/// Dropping the receiver aborts the relay and the upstream call.
#[derive(Debug)]
pub struct UpstreamStream {
    /// HTTP status returned by the backend.
    pub status: u16,
    /// Backend `Content-Type`, if present.
    pub content_type: Option<String>,
    /// Response bytes, delivered as they arrive.
    pub chunks: mpsc::Receiver<Result<Bytes, std::io::Error>>,
}

/// Terminal result delivered to a request's original caller, exactly once.
#[derive(Debug)]
pub enum Outcome {
    /// Backend accepted the request; body streams through `UpstreamStream`.
    Stream(UpstreamStream),
    /// Backend returned an error or the connection failed mid-exchange.
    UpstreamError {
        status: Option<u16>,
        message: String,
    },
    /// The request never reached the backend.
    Rejected(RejectReason),
    /// The per-request deadline elapsed before completion.
    TimedOut,
}

/// Outcome classification used for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Ok,
    UpstreamError,
    /// The caller hung up before the backend answered.
    Cancelled,
    TimedOut,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Ok => "ok",
            OutcomeKind::UpstreamError => "upstream_error",
            OutcomeKind::Cancelled => "cancelled",
            OutcomeKind::TimedOut => "timed_out",
        }
    }
}

/// Single-use handoff for a request's outcome.
///
/// Wraps the oneshot sender so delivery consumes the slot; writing twice is
/// unrepresentable.
#[derive(Debug)]
pub struct ReplySlot {
    tx: oneshot::Sender<Outcome>,
}

impl ReplySlot {
    pub(crate) fn new(tx: oneshot::Sender<Outcome>) -> Self {
        Self { tx }
    }

    /// Deliver the outcome. Returns `false` if the caller is gone.
    pub fn deliver(self, outcome: Outcome) -> bool {
        self.tx.send(outcome).is_ok()
    }

    /// Whether the caller has stopped waiting.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One admitted unit of work, alive from enqueue until its outcome is
/// delivered. Never re-enqueued.
#[derive(Debug)]
pub struct ScheduledRequest {
    pub id: Uuid,
    pub priority: Priority,
    /// Monotonic tie-breaker, unique for the process lifetime.
    pub sequence: u64,
    pub enqueued_at: Instant,
    pub payload: ProxyPayload,
    pub reply: ReplySlot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_marker_parsing() {
        assert_eq!(Priority::from_marker(Some("high")), Priority::High);
        assert_eq!(Priority::from_marker(Some("normal")), Priority::Normal);
        assert_eq!(Priority::from_marker(None), Priority::Normal);
        // Unrecognized markers degrade to normal, never reject
        assert_eq!(Priority::from_marker(Some("urgent")), Priority::Normal);
        assert_eq!(Priority::from_marker(Some("HIGH")), Priority::Normal);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
    }

    #[tokio::test]
    async fn test_reply_slot_single_use() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let slot = ReplySlot::new(tx);
        assert!(!slot.is_closed());
        assert!(slot.deliver(Outcome::TimedOut));

        match rx.await {
            Ok(Outcome::TimedOut) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_slot_closed_when_caller_gone() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let slot = ReplySlot::new(tx);
        drop(rx);
        assert!(slot.is_closed());
        assert!(!slot.deliver(Outcome::TimedOut));
    }
}
