//! Resource monitor
//!
//! Per-address optimistic concurrency control. Every transaction gets a
//! ticket from its submission order; tickets define the total order the
//! batch must appear to execute in.
//!
//! Rules of [`ResourceMonitor::acquire`]:
//! - an unowned address, or one already owned by the caller, is taken at once
//! - an address owned by a lower ticket makes the caller wait for its release
//! - an address owned by a higher ticket signals that owner to abort, and
//!   the caller waits for the owner to release it
//!
//! Owners release everything at once: at their commit, which happens
//! strictly in ticket order, or when they abort. A waiting task also wakes
//! when it is signalled itself, so waits never form a cycle.

use crate::trap::Trap;
use crate::types::Address;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, warn};

/// Submission order of a transaction
pub type Ticket = u64;

/// Acquisition counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    /// Acquisitions granted without waiting
    pub acquired: u64,

    /// Acquisitions that had to wait for a lower ticket
    pub waited: u64,

    /// Abort signals sent to higher tickets
    pub aborted: u64,
}

#[derive(Debug, Default)]
struct MonitorState {
    /// Current owner of each address
    owners: HashMap<Address, Ticket>,

    /// Addresses held by each ticket
    held: HashMap<Ticket, Vec<Address>>,

    /// Tickets signalled to abort
    abort_requested: HashSet<Ticket>,

    /// Ticket allowed to commit next
    next_commit: Ticket,

    /// Set once the engine hit a fatal condition
    poisoned: Option<String>,

    stats: MonitorStats,
}

impl MonitorState {
    fn check(&self, ticket: Ticket) -> Result<(), Trap> {
        if let Some(reason) = &self.poisoned {
            return Err(Trap::Fatal(reason.clone()));
        }
        if self.abort_requested.contains(&ticket) {
            return Err(Trap::Abort);
        }
        Ok(())
    }

    fn release(&mut self, ticket: Ticket) {
        for address in self.held.remove(&ticket).unwrap_or_default() {
            if self.owners.get(&address) == Some(&ticket) {
                self.owners.remove(&address);
            }
        }
    }
}

/// Resource monitor shared by all workers
#[derive(Debug, Default)]
pub struct ResourceMonitor {
    state: Mutex<MonitorState>,
    changed: Condvar,
}

impl ResourceMonitor {
    /// Create a monitor whose first commit is ticket 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `address` for `ticket`
    ///
    /// Must be called before a task reads or mutates anything stored
    /// under `address`. Once acquired, the address stays held until the
    /// attempt commits or aborts.
    ///
    /// # Returns
    /// - `Ok(())` once the caller owns the address
    /// - `Err(Trap::Abort)` if the caller was signalled to abort
    /// - `Err(Trap::Fatal)` if the monitor was poisoned
    pub fn acquire(&self, address: &Address, ticket: Ticket) -> Result<(), Trap> {
        let mut state = self.state.lock();
        let mut counted = false;

        loop {
            state.check(ticket)?;

            match state.owners.get(address).copied() {
                None => {
                    state.owners.insert(*address, ticket);
                    state.held.entry(ticket).or_default().push(*address);
                    if !counted {
                        state.stats.acquired += 1;
                    }
                    return Ok(());
                }
                Some(owner) if owner == ticket => return Ok(()),
                Some(owner) if owner < ticket => {
                    if !counted {
                        state.stats.waited += 1;
                        counted = true;
                    }
                    debug!("Ticket {} waits for {} on {}", ticket, owner, address);
                }
                Some(owner) => {
                    if state.abort_requested.insert(owner) {
                        state.stats.aborted += 1;
                        warn!("Ticket {} aborts ticket {} on {}", ticket, owner, address);
                        self.changed.notify_all();
                    }
                    counted = true;
                }
            }

            self.changed.wait(&mut state);
        }
    }

    /// Check whether `ticket` has been signalled to abort
    pub fn abort_requested(&self, ticket: Ticket) -> Result<(), Trap> {
        self.state.lock().check(ticket)
    }

    /// Commit `ticket` once every lower ticket has committed
    ///
    /// Blocks until it is `ticket`'s turn, then runs `flush` to publish the
    /// task's writes, releases everything the ticket holds, and lets the
    /// next ticket commit.
    ///
    /// # Returns
    /// - `Ok(())` after a successful commit
    /// - `Err(Trap::Abort)` if the ticket was signalled before its turn;
    ///   the caller must call [`ResourceMonitor::reset`] and retry
    /// - `Err(Trap::Fatal)` if `flush` failed or the monitor was poisoned
    pub fn commit<F>(&self, ticket: Ticket, flush: F) -> Result<(), Trap>
    where
        F: FnOnce() -> Result<(), Trap>,
    {
        {
            let mut state = self.state.lock();
            loop {
                state.check(ticket)?;
                if state.next_commit == ticket {
                    break;
                }
                self.changed.wait(&mut state);
            }
        }

        // Every lower ticket has committed, so nothing can signal us now
        // and the addresses we hold cannot change hands during the flush.
        let flushed = flush();

        let mut state = self.state.lock();
        if let Err(trap) = flushed {
            error!("Ticket {} failed to flush: {}", ticket, trap);
            let reason = trap.to_string();
            state.poisoned = Some(reason.clone());
            self.changed.notify_all();
            return Err(Trap::Fatal(reason));
        }

        state.release(ticket);
        state.next_commit = ticket + 1;
        debug!("Ticket {} committed", ticket);
        self.changed.notify_all();
        Ok(())
    }

    /// Release everything `ticket` holds and clear its abort signal
    ///
    /// Called when an attempt aborts, before it is retried. Both happen
    /// under one lock so a signal aimed at the next attempt is never lost
    /// and a stale one never reaches it.
    pub fn reset(&self, ticket: Ticket) {
        let mut state = self.state.lock();
        state.release(ticket);
        state.abort_requested.remove(&ticket);
        self.changed.notify_all();
    }

    /// Stop all waiting and future acquisitions with a fatal error
    pub fn poison(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.poisoned.is_none() {
            state.poisoned = Some(reason.to_string());
        }
        self.changed.notify_all();
    }

    /// Ticket allowed to commit next
    pub fn next_commit(&self) -> Ticket {
        self.state.lock().next_commit
    }

    /// Current owner of an address
    pub fn owner(&self, address: &Address) -> Option<Ticket> {
        self.state.lock().owners.get(address).copied()
    }

    /// Get acquisition counters
    pub fn stats(&self) -> MonitorStats {
        self.state.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_acquire_is_reentrant() {
        let monitor = ResourceMonitor::new();
        let address = Address::repeat_byte(1);

        monitor.acquire(&address, 0).unwrap();
        monitor.acquire(&address, 0).unwrap();

        assert_eq!(monitor.owner(&address), Some(0));
        assert_eq!(monitor.stats().acquired, 1);
    }

    #[test]
    fn test_lower_ticket_aborts_higher_owner() {
        let monitor = Arc::new(ResourceMonitor::new());
        let address = Address::repeat_byte(2);
        monitor.acquire(&address, 1).unwrap();

        let waiter = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.acquire(&address, 0))
        };

        // The owner notices the signal at its next monitor interaction.
        let mut signalled = false;
        for _ in 0..1_000 {
            if monitor.abort_requested(1) == Err(Trap::Abort) {
                signalled = true;
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert!(signalled);
        assert_eq!(monitor.acquire(&Address::repeat_byte(3), 1), Err(Trap::Abort));

        monitor.reset(1);
        waiter.join().unwrap().unwrap();

        assert_eq!(monitor.owner(&address), Some(0));
        assert_eq!(monitor.stats().aborted, 1);
    }

    #[test]
    fn test_higher_ticket_waits_for_lower_commit() {
        let monitor = Arc::new(ResourceMonitor::new());
        let address = Address::repeat_byte(4);
        monitor.acquire(&address, 0).unwrap();

        let waiter = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || {
                monitor.acquire(&address, 1)?;
                monitor.commit(1, || Ok(()))
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(monitor.owner(&address), Some(0));

        monitor.commit(0, || Ok(())).unwrap();
        waiter.join().unwrap().unwrap();

        assert_eq!(monitor.next_commit(), 2);
        assert_eq!(monitor.owner(&address), None);
        assert_eq!(monitor.stats().waited, 1);
    }

    #[test]
    fn test_commit_happens_in_ticket_order() {
        let monitor = Arc::new(ResourceMonitor::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..4u64)
            .rev()
            .map(|ticket| {
                let monitor = Arc::clone(&monitor);
                let order = Arc::clone(&order);
                thread::spawn(move || {
                    monitor.commit(ticket, || {
                        order.lock().push(ticket);
                        Ok(())
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_signalled_ticket_cannot_commit() {
        let monitor = ResourceMonitor::new();
        let address = Address::repeat_byte(5);
        monitor.acquire(&address, 1).unwrap();
        monitor.state.lock().abort_requested.insert(1);
        monitor.commit(0, || Ok(())).unwrap();

        assert_eq!(monitor.commit(1, || Ok(())), Err(Trap::Abort));

        monitor.reset(1);
        assert_eq!(monitor.owner(&address), None);
        monitor.commit(1, || Ok(())).unwrap();
    }

    #[test]
    fn test_poison_wakes_waiters() {
        let monitor = Arc::new(ResourceMonitor::new());
        let address = Address::repeat_byte(6);
        monitor.acquire(&address, 0).unwrap();

        let waiter = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.acquire(&address, 1))
        };

        thread::sleep(Duration::from_millis(50));
        monitor.poison("substrate corrupted");

        assert_eq!(
            waiter.join().unwrap(),
            Err(Trap::Fatal("substrate corrupted".to_string()))
        );
    }

    #[test]
    fn test_failed_flush_poisons() {
        let monitor = ResourceMonitor::new();

        let result = monitor.commit(0, || Err(Trap::Fatal("disk gone".to_string())));

        assert!(matches!(result, Err(Trap::Fatal(_))));
        assert!(matches!(
            monitor.acquire(&Address::repeat_byte(7), 1),
            Err(Trap::Fatal(_))
        ));
    }
}
