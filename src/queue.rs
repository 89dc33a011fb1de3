//! Handoff queue and futures
//!
//! Ordered, blocking exchange of work between submitters and workers:
//! - [`HandoffQueue::submit`] assigns tickets in submission order and
//!   returns one [`FutureResult`] per transaction, index-aligned
//! - [`HandoffQueue::exchange`] delivers a worker's previous result and
//!   takes its next work item under one lock
//! - A fatal error reported by any worker is kept and returned by every
//!   later read, so it is never dropped
//! - Results are only kept for tickets whose future is still alive

use crate::effects::TransactionResult;
use crate::executor::{EngineError, Result};
use crate::monitor::Ticket;
use crate::types::Transaction;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error};

/// Transaction handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Submission order across all batches
    pub ticket: Ticket,

    /// Position in the submitted batch
    pub index: usize,

    /// Transaction to execute
    pub transaction: Transaction,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Work not yet taken by a worker
    pending: VecDeque<WorkItem>,

    /// Results not yet read by a future
    results: HashMap<Ticket, TransactionResult>,

    /// Tickets whose future has not been dropped
    live: HashSet<Ticket>,

    next_ticket: Ticket,

    /// No more work is accepted; workers exit once `pending` is empty
    closed: bool,

    /// First fatal error reported by a worker
    fatal: Option<EngineError>,
}

/// Blocking exchange between submitters and workers
#[derive(Debug, Default)]
pub struct HandoffQueue {
    state: Mutex<QueueState>,

    /// Signalled when work arrives or the queue closes
    work_available: Condvar,

    /// Signalled when a result is delivered or a fatal error recorded
    result_ready: Condvar,
}

impl HandoffQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit an ordered batch
    ///
    /// # Returns
    /// One future per transaction, in input order
    pub fn submit(self: &Arc<Self>, transactions: Vec<Transaction>) -> Result<Vec<FutureResult>> {
        let mut state = self.state.lock();
        if let Some(fatal) = &state.fatal {
            return Err(fatal.clone());
        }
        if state.closed {
            return Err(EngineError::ShutDown);
        }

        let mut futures = Vec::with_capacity(transactions.len());
        for (index, transaction) in transactions.into_iter().enumerate() {
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.live.insert(ticket);
            state.pending.push_back(WorkItem {
                ticket,
                index,
                transaction,
            });
            futures.push(FutureResult {
                queue: Arc::clone(self),
                ticket,
                index,
            });
        }

        debug!("Queued {} transactions", futures.len());
        self.work_available.notify_all();
        Ok(futures)
    }

    /// Deliver a finished result and take the next work item
    ///
    /// Blocks until work is available.
    ///
    /// # Returns
    /// `None` once the queue is closed and drained, or after a fatal error
    pub fn exchange(&self, finished: Option<(Ticket, TransactionResult)>) -> Option<WorkItem> {
        let mut state = self.state.lock();

        if let Some((ticket, result)) = finished {
            if state.live.contains(&ticket) {
                state.results.insert(ticket, result);
                self.result_ready.notify_all();
            } else {
                debug!("Discarding result of abandoned ticket {}", ticket);
            }
        }

        loop {
            if state.fatal.is_some() {
                return None;
            }
            if let Some(item) = state.pending.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.work_available.wait(&mut state);
        }
    }

    /// Record a fatal error and wake everyone
    ///
    /// Only the first error is kept.
    pub fn report_fatal(&self, err: EngineError) {
        let mut state = self.state.lock();
        if state.fatal.is_none() {
            error!("Engine stopped: {}", err);
            state.fatal = Some(err);
        }
        self.work_available.notify_all();
        self.result_ready.notify_all();
    }

    /// Stop accepting work; workers exit after draining what is queued
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.work_available.notify_all();
    }

    /// Fatal error reported by a worker, if any
    pub fn fatal(&self) -> Option<EngineError> {
        self.state.lock().fatal.clone()
    }

    /// Number of work items not yet taken
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of delivered results not yet read
    pub fn retained(&self) -> usize {
        self.state.lock().results.len()
    }

    fn release(&self, ticket: Ticket) {
        let mut state = self.state.lock();
        state.live.remove(&ticket);
        state.results.remove(&ticket);
    }

    fn wait_for(&self, ticket: Ticket) -> Result<TransactionResult> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.results.remove(&ticket) {
                return Ok(result);
            }
            if let Some(fatal) = &state.fatal {
                return Err(fatal.clone());
            }
            self.result_ready.wait(&mut state);
        }
    }
}

/// Read-once handle to the result of one submitted transaction
#[derive(Debug)]
pub struct FutureResult {
    queue: Arc<HandoffQueue>,
    ticket: Ticket,
    index: usize,
}

impl FutureResult {
    /// Submission order of the transaction
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Position of the transaction in its batch
    pub fn index(&self) -> usize {
        self.index
    }

    /// Block until the result is available
    ///
    /// # Returns
    /// - `Ok(TransactionResult)` with a terminal outcome
    /// - `Err(EngineError::Fatal)` if the engine stopped first
    pub fn get(self) -> Result<TransactionResult> {
        self.queue.wait_for(self.ticket)
    }
}

impl Drop for FutureResult {
    fn drop(&mut self) {
        self.queue.release(self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::TransactionStatus;
    use crate::types::Address;
    use std::thread;

    fn tx(nonce: u64) -> Transaction {
        Transaction::call(
            Address::repeat_byte(1),
            nonce,
            Address::repeat_byte(2),
            0,
            Vec::new(),
            21_000,
            1,
        )
    }

    fn result() -> TransactionResult {
        TransactionResult::rejected(TransactionStatus::RejectedInvalidNonce)
    }

    #[test]
    fn test_tickets_follow_submission_order() {
        let queue = Arc::new(HandoffQueue::new());

        let first = queue.submit(vec![tx(0), tx(1)]).unwrap();
        let second = queue.submit(vec![tx(2)]).unwrap();

        assert_eq!(first.iter().map(FutureResult::ticket).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(second[0].ticket(), 2);
        assert_eq!(second[0].index(), 0);

        let item = queue.exchange(None).unwrap();
        assert_eq!(item.ticket, 0);
        assert_eq!(item.transaction.nonce, 0);
    }

    #[test]
    fn test_exchange_delivers_previous_result() {
        let queue = Arc::new(HandoffQueue::new());
        let mut futures = queue.submit(vec![tx(0), tx(1)]).unwrap();

        let first = queue.exchange(None).unwrap();
        let second = queue.exchange(Some((first.ticket, result()))).unwrap();
        queue.close();
        assert_eq!(queue.exchange(Some((second.ticket, result()))), None);

        let second_future = futures.pop().unwrap();
        let first_future = futures.pop().unwrap();
        assert_eq!(second_future.get().unwrap(), result());
        assert_eq!(first_future.get().unwrap(), result());
    }

    #[test]
    fn test_fatal_error_reaches_waiting_future() {
        let queue = Arc::new(HandoffQueue::new());
        let future = queue.submit(vec![tx(0)]).unwrap().pop().unwrap();

        let reader = thread::spawn(move || future.get());
        queue.report_fatal(EngineError::Fatal("worker died".to_string()));

        assert_eq!(
            reader.join().unwrap(),
            Err(EngineError::Fatal("worker died".to_string()))
        );
        assert_eq!(queue.exchange(None), None);
        assert!(queue.submit(vec![tx(1)]).is_err());
    }

    #[test]
    fn test_dropped_futures_do_not_retain_results() {
        let queue = Arc::new(HandoffQueue::new());
        drop(queue.submit((0..100).map(tx).collect()).unwrap());
        let kept = queue.submit(vec![tx(100)]).unwrap().pop().unwrap();
        queue.close();

        let mut finished = None;
        while let Some(item) = queue.exchange(finished.take()) {
            finished = Some((item.ticket, result()));
        }

        // Only the result with a live future is kept
        assert_eq!(queue.retained(), 1);
        drop(kept);
        assert_eq!(queue.retained(), 0);
    }

    #[test]
    fn test_closed_queue_drains_before_exit() {
        let queue = Arc::new(HandoffQueue::new());
        queue.submit(vec![tx(0)]).unwrap();
        queue.close();

        assert!(queue.exchange(None).is_some());
        assert_eq!(queue.exchange(None), None);
        assert_eq!(queue.submit(vec![tx(1)]).err(), Some(EngineError::ShutDown));
    }
}
