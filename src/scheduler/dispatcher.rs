//! Worker pool that executes admitted requests against the backend.
//!
//! A fixed pool of tasks started at scheduler construction. Each worker
//! acquires a concurrency slot, pulls the highest-precedence request from
//! admission, hands it to the forwarder, and releases the slot once the
//! request is fully serviced. The semaphore itself is the in-flight bound;
//! there is no counter check to race against.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::admission::AdmissionController;
use crate::forward::Forward;
use crate::metrics::recorder::MetricsRecorder;

pub struct Dispatcher {
    handles: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start `max_concurrency` workers against the shared admission state.
    pub fn start(
        max_concurrency: usize,
        admission: Arc<AdmissionController>,
        forwarder: Arc<dyn Forward>,
        recorder: Arc<MetricsRecorder>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let handles = (0..max_concurrency)
            .map(|worker| {
                let admission = Arc::clone(&admission);
                let semaphore = Arc::clone(&semaphore);
                let forwarder = Arc::clone(&forwarder);
                let recorder = Arc::clone(&recorder);
                tokio::spawn(worker_loop(worker, admission, semaphore, forwarder, recorder))
            })
            .collect();

        Self { handles }
    }

    /// Wait for every worker to finish its current request and exit.
    /// Workers stop pulling once admission reports shutdown.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatch worker panicked");
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    admission: Arc<AdmissionController>,
    semaphore: Arc<Semaphore>,
    forwarder: Arc<dyn Forward>,
    recorder: Arc<MetricsRecorder>,
) {
    loop {
        // Slot acquisition blocks the worker, never the caller.
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let req = match admission.next_for_dispatch().await {
            Ok(req) => req,
            Err(_) => break,
        };

        let guard = admission.dispatch_guard();
        recorder.record_wait(req.priority, req.enqueued_at.elapsed());

        // The caller may have hung up between cancellation and pop; skip
        // dead work instead of hitting the backend for nobody.
        if req.reply.is_closed() {
            recorder.record_cancelled(req.priority);
            drop(guard);
            drop(permit);
            continue;
        }

        debug!(
            worker,
            id = %req.id,
            priority = req.priority.as_str(),
            model = %req.payload.model,
            "dispatching request"
        );

        let started = Instant::now();
        let kind = forwarder.forward(req.payload, req.reply).await;
        recorder.record_service(req.priority, started.elapsed(), kind);

        // Slot released exactly once per dispatched request.
        drop(guard);
        drop(permit);
    }

    debug!(worker, "dispatch worker exiting");
}
