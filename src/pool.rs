//! Worker pool that fans partitions out to independent workers.
//!
//! Each worker runs on its own thread of a dedicated rayon pool, opens its
//! own store connection and checks out its own routing session; nothing
//! mutable is shared between workers except the dispatch cursor. Workers
//! take one partition at a time from the shared queue, so a slow partition
//! only ever occupies the worker that holds it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::StoreConfig;
use crate::error::PipelineError;
use crate::handler::PartitionHandler;
use crate::model::PartitionId;
use crate::progress::EtaEstimator;
use crate::store::ResultStore;
use crate::traits::{PartitionCatalog, RoutingEngine};

/// Why a worker stopped taking partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The queue ran dry.
    Drained,
    /// The worker could not open its store connection.
    StoreUnavailable(String),
    /// The routing engine could not be checked out or became unusable.
    RoutingUnavailable(String),
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub index: usize,
    pub partitions: usize,
    pub processed: u64,
    pub errors: usize,
    pub exit: WorkerExit,
}

impl WorkerReport {
    fn new(index: usize) -> Self {
        Self {
            index,
            partitions: 0,
            processed: 0,
            errors: 0,
            exit: WorkerExit::Drained,
        }
    }
}

/// Aggregate of one pass over the partitions.
#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    pub partitions: usize,
    /// Partitions taken off the queue and handled (successfully or with
    /// logged errors).
    pub handled: usize,
    pub processed: u64,
    pub errors: usize,
    pub workers: Vec<WorkerReport>,
}

impl PoolReport {
    pub fn aborted_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|worker| worker.exit != WorkerExit::Drained)
            .count()
    }

    /// Partitions nobody took because every worker had stopped.
    pub fn undispatched(&self) -> usize {
        self.partitions.saturating_sub(self.handled)
    }

    pub fn had_failures(&self) -> bool {
        self.errors > 0 || self.aborted_workers() > 0
    }
}

impl std::fmt::Display for PoolReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Partitions: {}/{} handled, Units: {}, Errors: {}, Aborted workers: {}",
            self.handled,
            self.partitions,
            self.processed,
            self.errors,
            self.aborted_workers()
        )
    }
}

/// Hands out partitions one at a time.
struct PartitionQueue<'a> {
    partitions: &'a [PartitionId],
    next: AtomicUsize,
}

impl<'a> PartitionQueue<'a> {
    fn new(partitions: &'a [PartitionId]) -> Self {
        Self {
            partitions,
            next: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> Option<PartitionId> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.partitions.get(index).copied()
    }
}

pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Runs `handler` over every partition and waits for all of them.
    ///
    /// Failures are contained per partition (run log, panics included) or
    /// per worker (the worker stops, the others carry on); only a failure to
    /// build the thread pool itself is returned as an error.
    pub fn run<C, E>(
        &self,
        partitions: &[PartitionId],
        store_config: &StoreConfig,
        engine: &E,
        handler: &PartitionHandler<'_, C>,
        eta: &EtaEstimator,
    ) -> Result<PoolReport, PipelineError>
    where
        C: PartitionCatalog,
        E: RoutingEngine,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|index| format!("distance-worker-{index}"))
            .build()?;

        tracing::info!(
            "Dispatching {} partitions to {} workers",
            partitions.len(),
            self.workers
        );

        let queue = PartitionQueue::new(partitions);
        let workers = pool.broadcast(|ctx| run_worker(ctx.index(), &queue, store_config, engine, handler, eta));

        let mut report = PoolReport {
            partitions: partitions.len(),
            ..PoolReport::default()
        };
        for worker in &workers {
            report.handled += worker.partitions;
            report.processed += worker.processed;
            report.errors += worker.errors;
        }
        report.workers = workers;

        if report.undispatched() > 0 {
            tracing::error!(
                undispatched = report.undispatched(),
                "Every worker stopped before the queue was drained"
            );
        }
        Ok(report)
    }
}

fn run_worker<C, E>(
    index: usize,
    queue: &PartitionQueue<'_>,
    store_config: &StoreConfig,
    engine: &E,
    handler: &PartitionHandler<'_, C>,
    eta: &EtaEstimator,
) -> WorkerReport
where
    C: PartitionCatalog,
    E: RoutingEngine,
{
    let span = tracing::info_span!("worker", index);
    let _enter = span.enter();
    let mut report = WorkerReport::new(index);

    let mut store = match ResultStore::open(store_config) {
        Ok(store) => store,
        Err(err) => {
            tracing::error!(error = %err, "Worker could not open the result store");
            report.exit = WorkerExit::StoreUnavailable(err.to_string());
            return report;
        }
    };

    // Held until this function returns; dropping it releases the license.
    let mut session = match engine.checkout() {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(error = %err, "Worker could not check out a routing session");
            report.exit = WorkerExit::RoutingUnavailable(err.to_string());
            return report;
        }
    };

    while let Some(partition) = queue.next() {
        let handled = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&mut store, &mut session, partition)));
        let outcome = match handled {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(&*payload);
                tracing::error!(partition, %message, "Partition handler panicked");
                handler.record_panic(&store, partition, &message)
            }
        };
        report.partitions += 1;
        report.processed += outcome.processed;
        report.errors += outcome.errors;

        match store.progress().current() {
            Ok(current) => tracing::info!(partition, skipped = outcome.skipped, "Progress {}", eta.report(current)),
            Err(err) => tracing::warn!(error = %err, "Could not read progress"),
        }

        if let Some(err) = outcome.fatal {
            tracing::error!(error = %err, "Routing session unusable; worker stopping");
            report.exit = WorkerExit::RoutingUnavailable(err.to_string());
            break;
        }
    }

    tracing::debug!(partitions = report.partitions, processed = report.processed, "Worker finished");
    report
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
