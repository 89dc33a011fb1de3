//! Execution context of one transaction
//!
//! A [`Task`] carries everything one transaction attempt mutates: the
//! call depth, the side-effect log, the reentrant call stack, and the
//! transactional view of world state. It is created once per submitted
//! transaction, owned by the worker running it, and reset between
//! attempts when the transaction is retried after an abort.

use crate::effects::{SideEffects, SideEffectsCheckpoint};
use crate::monitor::{ResourceMonitor, Ticket};
use crate::overlay::{StateCheckpoint, TransactionalState};
use crate::stack::{ReentrantStack, StackCheckpoint};
use crate::trap::Trap;
use crate::types::{Address, Transaction};
use crate::world::WorldState;
use std::sync::Arc;
use tracing::debug;

/// Position of every journal of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    state: StateCheckpoint,
    stack: StackCheckpoint,
    effects: SideEffectsCheckpoint,
}

/// Execution context of one transaction attempt
#[derive(Debug)]
pub struct Task {
    /// Submission order
    ticket: Ticket,

    /// Transaction being executed
    transaction: Transaction,

    /// Number of frames on the call chain
    depth: usize,

    /// Logs and internal transactions
    pub(crate) side_effects: SideEffects,

    /// Contracts active on the call chain
    pub(crate) stack: ReentrantStack,

    /// Buffered world state
    pub(crate) state: TransactionalState,

    /// Attempts started, including the current one
    attempts: u32,
}

impl Task {
    /// Create a task for a submitted transaction
    pub fn new(
        ticket: Ticket,
        transaction: Transaction,
        world: Arc<dyn WorldState>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            ticket,
            transaction,
            depth: 0,
            side_effects: SideEffects::new(),
            stack: ReentrantStack::new(),
            state: TransactionalState::new(world, monitor, ticket),
            attempts: 1,
        }
    }

    /// Submission order of the transaction
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Transaction being executed
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Sender of the transaction
    pub fn origin(&self) -> &Address {
        &self.transaction.sender
    }

    /// Current call depth
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of attempts started
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Logs and internal transactions recorded so far
    pub fn side_effects(&self) -> &SideEffects {
        &self.side_effects
    }

    pub(crate) fn enter_frame(&mut self) -> usize {
        self.depth += 1;
        self.depth
    }

    pub(crate) fn exit_frame(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Mark the current position of every journal
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            state: self.state.checkpoint(),
            stack: self.stack.checkpoint(),
            effects: self.side_effects.checkpoint(),
        }
    }

    /// Undo everything recorded since `checkpoint`
    pub fn revert_to(&mut self, checkpoint: Checkpoint) -> Result<(), Trap> {
        self.state.revert_to(checkpoint.state);
        self.side_effects.rollback(checkpoint.effects);
        self.stack.revert_to(checkpoint.stack)?;
        Ok(())
    }

    /// Clear the attempt so the transaction can run again from scratch
    ///
    /// Releases every address the attempt acquired and clears its abort
    /// signal.
    pub fn reset(&mut self) {
        self.depth = 0;
        self.side_effects.clear();
        self.stack.clear();
        self.state.reset();
        self.attempts += 1;
        debug!("Ticket {} reset for attempt {}", self.ticket, self.attempts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockContext, Log};
    use crate::world::InMemoryWorldState;

    fn task() -> Task {
        let sender = Address::repeat_byte(1);
        let world = Arc::new(InMemoryWorldState::with_balances(
            BlockContext::default(),
            &[(sender, 1_000)],
        ));
        let tx = Transaction::call(sender, 0, Address::repeat_byte(2), 0, Vec::new(), 50_000, 1);
        Task::new(0, tx, world, Arc::new(ResourceMonitor::new()))
    }

    #[test]
    fn test_revert_to_checkpoint() {
        let mut task = task();
        let sender = *task.origin();

        let checkpoint = task.checkpoint();
        task.state.set_balance(&sender, 1).unwrap();
        task.side_effects.add_log(Log {
            address: sender,
            topics: Vec::new(),
            data: vec![1],
        });
        task.revert_to(checkpoint).unwrap();

        assert_eq!(task.state.balance(&sender).unwrap(), 1_000);
        assert!(task.side_effects().logs().is_empty());
    }

    #[test]
    fn test_reset_clears_the_attempt() {
        let mut task = task();
        let sender = *task.origin();
        task.enter_frame();
        task.state.set_balance(&sender, 1).unwrap();

        task.reset();

        assert_eq!(task.depth(), 0);
        assert_eq!(task.attempts(), 2);
        assert_eq!(task.state.touched(), 0);
    }
}
