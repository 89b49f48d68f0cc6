//! Priority-aware request scheduler.
//!
//! Admits inbound inference requests, orders them by `(priority tier,
//! arrival sequence)`, bounds concurrent forwards to the backend, rejects
//! at capacity, and records queueing telemetry for every request.
//!
//! Data flow: `Scheduler::enqueue` → heap → dispatcher worker pops →
//! forwarder executes against the backend → outcome delivered once to the
//! caller's [`Ticket`].

pub mod admission;
pub mod dispatcher;
pub mod heap;
pub mod request;

use std::sync::{Arc, Mutex};

pub use admission::{AdmissionController, EnqueueError, Ticket};
pub use request::{
    Outcome, OutcomeKind, Priority, ProxyPayload, RejectReason, ReplySlot, ScheduledRequest,
    UpstreamStream,
};

use dispatcher::Dispatcher;

use crate::forward::Forward;
use crate::metrics::recorder::MetricsRecorder;

/// Scheduler tunables.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum requests waiting for dispatch before hard rejection.
    pub max_queue_size: usize,
    /// Maximum requests in flight to the backend.
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_queue_size: 100, max_concurrency: 10 }
    }
}

/// Facade over admission control and the dispatch pool.
pub struct Scheduler {
    admission: Arc<AdmissionController>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl Scheduler {
    /// Build the admission state and start the worker pool.
    pub fn start(
        config: SchedulerConfig,
        forwarder: Arc<dyn Forward>,
        recorder: Arc<MetricsRecorder>,
    ) -> Self {
        let admission = Arc::new(AdmissionController::new(
            config.max_queue_size,
            Arc::clone(&recorder),
        ));
        let dispatcher = Dispatcher::start(
            config.max_concurrency,
            Arc::clone(&admission),
            forwarder,
            recorder,
        );

        Self { admission, dispatcher: Mutex::new(Some(dispatcher)) }
    }

    /// Admit a request or reject it immediately. On success the returned
    /// [`Ticket`] resolves to exactly one terminal [`Outcome`].
    pub fn enqueue(
        &self,
        payload: ProxyPayload,
        priority: Priority,
    ) -> Result<Ticket, EnqueueError> {
        self.admission.enqueue(payload, priority)
    }

    /// Requests waiting for dispatch.
    pub fn queue_depth(&self) -> usize {
        self.admission.queue_depth()
    }

    /// Requests currently being forwarded.
    pub fn in_flight(&self) -> usize {
        self.admission.in_flight()
    }

    /// Drain the queue, reject waiting callers, and wait for workers to
    /// finish their current request.
    pub async fn shutdown(&self) {
        self.admission.shutdown();
        let dispatcher = self
            .dispatcher
            .lock()
            .expect("dispatcher handle poisoned")
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.join().await;
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue_depth", &self.queue_depth())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::{mpsc, Semaphore};

    use super::*;
    use crate::scheduler::request::UpstreamStream;

    /// Backend stub whose completions are released one at a time through a
    /// semaphore, so tests control exactly when each request finishes.
    struct MockBackend {
        dispatched: std::sync::Mutex<Vec<String>>,
        gate: Semaphore,
        active: AtomicUsize,
        max_active: AtomicUsize,
        fail_with_status: Option<u16>,
        times_out: bool,
    }

    impl MockBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self::bare())
        }

        fn failing(status: u16) -> Arc<Self> {
            Arc::new(Self { fail_with_status: Some(status), ..Self::bare() })
        }

        fn timing_out() -> Arc<Self> {
            Arc::new(Self { times_out: true, ..Self::bare() })
        }

        fn bare() -> Self {
            Self {
                dispatched: std::sync::Mutex::new(Vec::new()),
                gate: Semaphore::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                fail_with_status: None,
                times_out: false,
            }
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }

        fn dispatched(&self) -> Vec<String> {
            self.dispatched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Forward for MockBackend {
        async fn forward(&self, payload: ProxyPayload, reply: ReplySlot) -> OutcomeKind {
            self.dispatched.lock().unwrap().push(payload.model);

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            // Hold the request until the test releases it
            self.gate.acquire().await.unwrap().forget();
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.times_out {
                reply.deliver(Outcome::TimedOut);
                return OutcomeKind::TimedOut;
            }

            if let Some(status) = self.fail_with_status {
                reply.deliver(Outcome::UpstreamError {
                    status: Some(status),
                    message: "backend failure".to_string(),
                });
                return OutcomeKind::UpstreamError;
            }

            let (tx, rx) = mpsc::channel(4);
            let delivered = reply.deliver(Outcome::Stream(UpstreamStream {
                status: 200,
                content_type: None,
                chunks: rx,
            }));
            if delivered {
                let _ = tx.send(Ok(Bytes::from_static(b"{\"done\":true}"))).await;
            }
            OutcomeKind::Ok
        }
    }

    fn payload(model: &str) -> ProxyPayload {
        ProxyPayload {
            path: "/api/generate".to_string(),
            body: Bytes::from_static(b"{}"),
            model: model.to_string(),
        }
    }

    fn scheduler_over(
        backend: Arc<MockBackend>,
        max_queue_size: usize,
        max_concurrency: usize,
    ) -> Scheduler {
        Scheduler::start(
            SchedulerConfig { max_queue_size, max_concurrency },
            backend as Arc<dyn Forward>,
            Arc::new(MetricsRecorder::new(64)),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[tokio::test]
    async fn test_high_priority_overtakes_queued_normal() {
        let backend = MockBackend::new();
        let scheduler = scheduler_over(Arc::clone(&backend), 2, 1);

        // First request occupies the only slot
        let n1 = scheduler.enqueue(payload("n1"), Priority::Normal).unwrap();
        {
            let backend = Arc::clone(&backend);
            wait_until(move || backend.dispatched().len() == 1).await;
        }

        // Queue fills while the worker is busy
        let n2 = scheduler.enqueue(payload("n2"), Priority::Normal).unwrap();
        let h1 = scheduler.enqueue(payload("h1"), Priority::High).unwrap();

        // Capacity is two, so a third waiting request is turned away
        assert!(matches!(
            scheduler.enqueue(payload("n3"), Priority::Normal),
            Err(EnqueueError::QueueFull { max: 2 })
        ));

        backend.release(3);
        for ticket in [n1, h1, n2] {
            assert!(matches!(ticket.wait().await, Outcome::Stream(_)));
        }

        // The late high-priority request is serviced before the earlier normal one
        assert_eq!(backend.dispatched(), vec!["n1", "h1", "n2"]);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_bound() {
        let backend = MockBackend::new();
        let scheduler = scheduler_over(Arc::clone(&backend), 16, 2);

        let tickets: Vec<_> = (0..8)
            .map(|i| {
                scheduler
                    .enqueue(payload(&format!("m{i}")), Priority::Normal)
                    .unwrap()
            })
            .collect();

        backend.release(8);
        for ticket in tickets {
            assert!(matches!(ticket.wait().await, Outcome::Stream(_)));
        }

        assert!(backend.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(backend.dispatched().len(), 8);
    }

    #[tokio::test]
    async fn test_backend_error_reaches_caller_and_frees_slot() {
        let backend = MockBackend::failing(500);
        let scheduler = scheduler_over(Arc::clone(&backend), 4, 1);

        let first = scheduler.enqueue(payload("a"), Priority::Normal).unwrap();
        backend.release(1);
        match first.wait().await {
            Outcome::UpstreamError { status: Some(500), .. } => {}
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The failure released the slot; the next request is serviced
        let second = scheduler.enqueue(payload("b"), Priority::Normal).unwrap();
        backend.release(1);
        assert!(matches!(
            second.wait().await,
            Outcome::UpstreamError { status: Some(500), .. }
        ));
        assert_eq!(backend.dispatched(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_timeout_reaches_caller_and_frees_slot() {
        let backend = MockBackend::timing_out();
        let scheduler = scheduler_over(Arc::clone(&backend), 4, 1);

        let first = scheduler.enqueue(payload("a"), Priority::Normal).unwrap();
        backend.release(1);
        assert!(matches!(first.wait().await, Outcome::TimedOut));

        // The timeout released the slot; the next request is dispatched
        let second = scheduler.enqueue(payload("b"), Priority::Normal).unwrap();
        backend.release(1);
        assert!(matches!(second.wait().await, Outcome::TimedOut));
        assert_eq!(backend.dispatched(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_dropped_ticket_never_reaches_backend() {
        let backend = MockBackend::new();
        let scheduler = scheduler_over(Arc::clone(&backend), 4, 1);

        let busy = scheduler.enqueue(payload("busy"), Priority::Normal).unwrap();
        {
            let backend = Arc::clone(&backend);
            wait_until(move || backend.dispatched().len() == 1).await;
        }

        let abandoned = scheduler.enqueue(payload("gone"), Priority::Normal).unwrap();
        drop(abandoned);
        assert_eq!(scheduler.queue_depth(), 0);

        backend.release(2);
        assert!(matches!(busy.wait().await, Outcome::Stream(_)));
        assert_eq!(backend.dispatched(), vec!["busy"]);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_queued_and_finishes_in_flight() {
        let backend = MockBackend::new();
        let scheduler = scheduler_over(Arc::clone(&backend), 4, 1);

        let in_flight = scheduler.enqueue(payload("running"), Priority::Normal).unwrap();
        {
            let backend = Arc::clone(&backend);
            wait_until(move || backend.dispatched().len() == 1).await;
        }
        let queued = scheduler.enqueue(payload("waiting"), Priority::High).unwrap();

        // Drain begins while the worker is still held on the gate, so the
        // queued request can only be rejected, never dispatched
        let shutdown = tokio::spawn(async move { scheduler.shutdown().await });
        assert!(matches!(
            queued.wait().await,
            Outcome::Rejected(RejectReason::ShuttingDown)
        ));

        // Let the in-flight request complete so the workers can exit
        backend.release(1);
        assert!(matches!(in_flight.wait().await, Outcome::Stream(_)));
        shutdown.await.unwrap();

        assert_eq!(backend.dispatched(), vec!["running"]);
    }
}
