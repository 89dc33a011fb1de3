//! Worker pool and submission API
//!
//! [`ConcurrentExecutor`] owns a fixed set of worker threads. Each worker:
//! 1. Takes a transaction from the handoff queue
//! 2. Runs it to a terminal result, retrying the whole task after aborts
//! 3. Hands the result back while taking its next transaction
//!
//! A worker that hits a fatal condition (including a panic) reports it,
//! poisons the resource monitor so no other worker stays blocked, and
//! exits. The error then surfaces through every pending future and
//! through [`ConcurrentExecutor::shutdown`].

use crate::config::{EngineConfig, Environment};
use crate::effects::TransactionResult;
use crate::executor::{EngineError, Result, TransactionExecutor};
use crate::module::ModuleLoader;
use crate::monitor::{MonitorStats, ResourceMonitor};
use crate::queue::{FutureResult, HandoffQueue};
use crate::task::Task;
use crate::types::Transaction;
use crate::world::WorldState;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Shared handles every worker needs
#[derive(Clone)]
struct WorkerContext {
    executor: TransactionExecutor,
    world: Arc<dyn WorldState>,
    monitor: Arc<ResourceMonitor>,
    queue: Arc<HandoffQueue>,
}

/// Concurrent transaction executor
///
/// Transactions run in parallel while results stay equal to running them
/// one by one in submission order.
pub struct ConcurrentExecutor {
    env: Arc<Environment>,
    monitor: Arc<ResourceMonitor>,
    queue: Arc<HandoffQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConcurrentExecutor {
    /// Create an executor and start its workers
    ///
    /// # Arguments
    /// * `config` - Engine configuration
    /// * `loader` - Instantiates contract modules
    /// * `world` - World state the transactions run against
    pub fn new(
        config: EngineConfig,
        loader: Arc<dyn ModuleLoader>,
        world: Arc<dyn WorldState>,
    ) -> Result<Self> {
        let worker_threads = config.worker_threads.max(1);
        let env = Arc::new(Environment::new(config, loader));
        let monitor = Arc::new(ResourceMonitor::new());
        let queue = Arc::new(HandoffQueue::new());

        info!("Starting concurrent executor with {} workers", worker_threads);

        let context = WorkerContext {
            executor: TransactionExecutor::new(Arc::clone(&env)),
            world,
            monitor: Arc::clone(&monitor),
            queue: Arc::clone(&queue),
        };

        let mut workers = Vec::with_capacity(worker_threads);
        for worker_id in 0..worker_threads {
            let context = context.clone();
            let spawned = thread::Builder::new()
                .name(format!("silver-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, context));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    queue.close();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(EngineError::Spawn(e.to_string()));
                }
            }
        }

        Ok(Self {
            env,
            monitor,
            queue,
            workers: Mutex::new(workers),
        })
    }

    /// Execution environment
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Submit an ordered batch
    ///
    /// # Returns
    /// One future per transaction, index-aligned with the input
    pub fn submit(&self, transactions: Vec<Transaction>) -> Result<Vec<FutureResult>> {
        self.queue.submit(transactions)
    }

    /// Submit a batch and wait for every result
    ///
    /// # Arguments
    /// * `transactions` - Transactions to execute
    ///
    /// # Returns
    /// Results in the same order as the input
    pub fn execute_transactions(&self, transactions: Vec<Transaction>) -> Result<Vec<TransactionResult>> {
        if transactions.is_empty() {
            return Ok(Vec::new());
        }

        let count = transactions.len();
        info!("Concurrent execution of {} transactions", count);

        let results = self
            .submit(transactions)?
            .into_iter()
            .map(FutureResult::get)
            .collect::<Result<Vec<_>>>()?;

        let successful = results.iter().filter(|r| r.is_success()).count();
        info!(
            "Batch complete: {} successful, {} failed",
            successful,
            count - successful
        );
        Ok(results)
    }

    /// Acquisition counters of the resource monitor
    pub fn monitor_stats(&self) -> MonitorStats {
        self.monitor.stats()
    }

    /// Drain the queue and stop every worker
    ///
    /// # Returns
    /// - `Ok(())` after a clean stop
    /// - `Err(EngineError::Fatal)` if a worker hit a fatal condition
    pub fn shutdown(&self) -> Result<()> {
        self.queue.close();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                error!("Worker thread panicked outside a task");
            }
        }

        info!("Concurrent executor stopped");
        match self.queue.fatal() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for ConcurrentExecutor {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Worker thread loop
fn worker_loop(worker_id: usize, context: WorkerContext) {
    debug!("Worker {} started", worker_id);

    let mut executed = 0usize;
    let mut finished = None;

    while let Some(item) = context.queue.exchange(finished.take()) {
        let mut task = Task::new(
            item.ticket,
            item.transaction,
            Arc::clone(&context.world),
            Arc::clone(&context.monitor),
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            context.executor.execute_with_retry(&mut task)
        }));

        let reason = match outcome {
            Ok(Ok(result)) => {
                executed += 1;
                finished = Some((item.ticket, result));
                continue;
            }
            Ok(Err(trap)) => trap.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };

        error!(
            "Worker {} stopping on ticket {}: {}",
            worker_id, item.ticket, reason
        );
        context.monitor.poison(&reason);
        context.queue.report_fatal(EngineError::Fatal(reason));
        return;
    }

    debug!("Worker {} finished: {} executed", worker_id, executed);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("worker panicked: {}", message)
    } else {
        "worker panicked".to_string()
    }
}
