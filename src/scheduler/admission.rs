//! Admission control for the request scheduler.
//!
//! The [`AdmissionController`] is the single entry and exit point for the
//! pending-request heap. Queue-full is a hard rejection decided at enqueue
//! time; the caller is never held open waiting for queue space.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::{oneshot, Notify};
use tracing::debug;
use uuid::Uuid;

use super::heap::RequestHeap;
use super::request::{
    Outcome, Priority, ProxyPayload, RejectReason, ReplySlot, ScheduledRequest,
};
use crate::metrics::recorder::MetricsRecorder;

/// Error returned by [`AdmissionController::enqueue`].
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue is full (max: {max})")]
    QueueFull { max: usize },

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Marker returned to dispatch workers once shutdown has drained the queue.
#[derive(Debug)]
pub struct ShutdownInProgress;

struct Inner {
    heap: RequestHeap,
    shutting_down: bool,
}

/// Owns the heap and the queue-depth bound.
///
/// The heap and the shutdown flag form one logical unit behind a single
/// mutex; every critical section is O(log n) or O(n) and never spans an
/// await point.
pub struct AdmissionController {
    inner: Mutex<Inner>,
    notify: Notify,
    max_queue_size: usize,
    sequence: AtomicU64,
    in_flight: Arc<AtomicUsize>,
    recorder: Arc<MetricsRecorder>,
}

impl AdmissionController {
    pub fn new(max_queue_size: usize, recorder: Arc<MetricsRecorder>) -> Self {
        Self {
            inner: Mutex::new(Inner { heap: RequestHeap::new(), shutting_down: false }),
            notify: Notify::new(),
            max_queue_size,
            sequence: AtomicU64::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            recorder,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        // Poisoning means a panic inside a critical section: an invariant
        // violation, not an operational error.
        self.inner.lock().expect("scheduler state poisoned")
    }

    /// Admit a request, or reject it immediately when the queue is at
    /// capacity. The capacity check and the push are one critical section.
    pub fn enqueue(
        self: &Arc<Self>,
        payload: ProxyPayload,
        priority: Priority,
    ) -> Result<Ticket, EnqueueError> {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();

        {
            let mut inner = self.lock_inner();
            if inner.shutting_down {
                self.recorder.record_rejected(priority, RejectReason::ShuttingDown);
                return Err(EnqueueError::ShuttingDown);
            }
            if inner.heap.len() >= self.max_queue_size {
                self.recorder.record_rejected(priority, RejectReason::QueueFull);
                return Err(EnqueueError::QueueFull { max: self.max_queue_size });
            }

            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            inner.heap.push(ScheduledRequest {
                id,
                priority,
                sequence,
                enqueued_at: Instant::now(),
                payload,
                reply: ReplySlot::new(tx),
            });
        }

        self.recorder.record_received(priority);
        self.notify.notify_one();

        debug!(id = %id, priority = priority.as_str(), "request enqueued");

        Ok(Ticket { id, rx: Some(rx), admission: Arc::clone(self) })
    }

    /// Block cooperatively until a request is available, then pop the
    /// highest-precedence one. Returns `Err` once shutdown has begun and
    /// the queue is empty.
    pub async fn next_for_dispatch(&self) -> Result<ScheduledRequest, ShutdownInProgress> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the heap so a notify between
            // the check and the await is not lost.
            notified.as_mut().enable();

            {
                let mut inner = self.lock_inner();
                if let Some(req) = inner.heap.pop() {
                    return Ok(req);
                }
                if inner.shutting_down {
                    return Err(ShutdownInProgress);
                }
            }

            notified.await;
        }
    }

    /// Remove a still-queued request whose caller went away.
    ///
    /// A no-op when the request has already been dispatched; the in-flight
    /// relay notices the dropped receiver on its own.
    pub fn cancel(&self, id: Uuid) {
        let removed = self.lock_inner().heap.remove(id);
        if let Some(req) = removed {
            debug!(id = %id, "caller gone before dispatch, dropping queued request");
            self.recorder.record_cancelled(req.priority);
        }
    }

    /// Begin shutdown: refuse new work, drain the queue, and deliver
    /// `Rejected(ShuttingDown)` to every still-waiting caller.
    pub fn shutdown(&self) {
        let drained = {
            let mut inner = self.lock_inner();
            inner.shutting_down = true;
            inner.heap.drain()
        };

        for req in drained {
            self.recorder.record_rejected(req.priority, RejectReason::ShuttingDown);
            req.reply.deliver(Outcome::Rejected(RejectReason::ShuttingDown));
        }

        self.notify.notify_waiters();
    }

    /// Number of requests waiting, not yet dispatched.
    pub fn queue_depth(&self) -> usize {
        self.lock_inner().heap.len()
    }

    /// Number of requests dispatched but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Mark a request as in flight for the lifetime of the returned guard.
    pub(crate) fn dispatch_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { counter: Arc::clone(&self.in_flight) }
    }
}

/// Decrements the in-flight gauge on drop, so every dispatch path releases
/// its count exactly once, including panics and early returns.
pub(crate) struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle an accepted caller awaits for its outcome.
///
/// Dropping the ticket before the outcome arrives withdraws the request
/// from the queue if it has not been dispatched yet.
#[derive(Debug)]
pub struct Ticket {
    id: Uuid,
    rx: Option<oneshot::Receiver<Outcome>>,
    admission: Arc<AdmissionController>,
}

impl Ticket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the single terminal outcome.
    ///
    /// Awaits the receiver in place so that dropping this future mid-wait
    /// (the caller's connection went away) drops a ticket that still
    /// withdraws its queued request.
    pub async fn wait(mut self) -> Outcome {
        let outcome = match self.rx.as_mut() {
            Some(rx) => match rx.await {
                Ok(outcome) => outcome,
                // Sender dropped without delivering: only possible when the
                // scheduler tore down mid-request.
                Err(_) => Outcome::Rejected(RejectReason::ShuttingDown),
            },
            None => Outcome::Rejected(RejectReason::ShuttingDown),
        };
        self.rx = None;
        outcome
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.admission.cancel(self.id);
        }
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("max_queue_size", &self.max_queue_size)
            .field("queue_depth", &self.queue_depth())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
