//! Transaction execution engine
//!
//! This module runs one transaction attempt:
//! - Pre-checks (energy limit, nonce, balance) and up-front energy purchase
//! - Call frames with per-frame energy meters and a call-depth limit
//! - State acquisition through the reentrant call stack
//! - Capture, commit and revert of contract object graphs at frame exit
//! - Energy charging by failure kind and refund of unused energy
//!
//! The invoke step returns a [`Trap`] on failure. Defined failures are
//! turned into a [`TransactionResult`] here; only [`Trap::Abort`] and
//! [`Trap::Fatal`] leave [`TransactionExecutor::execute`].

use crate::billing::{FrameFees, StorageFeeProcessor};
use crate::config::Environment;
use crate::effects::{TransactionResult, TransactionStatus};
use crate::energy::{EnergyMeter, EnergyResult};
use crate::module::Module;
use crate::runtime::{CallOutcome, Runtime};
use crate::snapshot::{GraphDelta, ObjectGraph, ObjectId, Snapshot};
use crate::stack::{ReentrantState, StackEntry};
use crate::task::Task;
use crate::trap::Trap;
use crate::types::{Address, BlockContext, InternalTransaction, Log, TransactionKind};
use crossbeam::utils::Backoff;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The execution substrate is corrupted; no further work is accepted
    #[error("Fatal engine error: {0}")]
    Fatal(String),

    /// The engine no longer accepts work
    #[error("Engine is shut down")]
    ShutDown,

    /// A worker thread could not be started
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// What a frame runs
#[derive(Debug, Clone, Copy)]
enum CallKind<'a> {
    /// Invoke the entry point of deployed code
    Call { args: &'a [u8] },

    /// Deploy code and run its initializer
    Create { code: &'a [u8], args: &'a [u8] },
}

/// Request to enter a frame
#[derive(Debug, Clone, Copy)]
struct CallRequest<'a> {
    target: Address,
    caller: Address,
    value: u128,
    kind: CallKind<'a>,
}

impl CallRequest<'_> {
    fn internal_transaction(&self, energy_limit: u64) -> InternalTransaction {
        let (destination, data) = match self.kind {
            CallKind::Call { args } => (Some(self.target), args.to_vec()),
            CallKind::Create { code, .. } => (None, code.to_vec()),
        };
        InternalTransaction {
            sender: self.caller,
            destination,
            value: self.value,
            data,
            energy_limit,
            rejected: false,
        }
    }
}

/// Transaction executor
///
/// Stateless apart from the shared [`Environment`]; every mutable piece
/// of an attempt lives in the [`Task`] passed in.
#[derive(Debug, Clone)]
pub struct TransactionExecutor {
    env: Arc<Environment>,
}

impl TransactionExecutor {
    /// Create a new executor
    pub fn new(env: Arc<Environment>) -> Self {
        Self { env }
    }

    /// Execution environment
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Execute one attempt of a task's transaction
    ///
    /// # Returns
    /// - `Ok(TransactionResult)` for every terminal outcome
    /// - `Err(Trap::Abort)` if the attempt lost a resource conflict
    /// - `Err(Trap::Fatal)` if the engine cannot continue
    pub fn execute(&self, task: &mut Task) -> std::result::Result<TransactionResult, Trap> {
        task.state.check_abort()?;

        let tx = task.transaction().clone();
        let billing = self.env.billing();
        let block_limit = task.state.block_context().energy_limit;

        debug!(
            "Executing ticket {} from {} (attempt {})",
            task.ticket(),
            tx.sender,
            task.attempts()
        );

        let basic_cost = billing.basic_transaction_cost(&tx.data());
        let minimum = match &tx.kind {
            TransactionKind::Deploy { code, .. } => basic_cost
                .saturating_add(billing.deployment_fee(0, code.len()))
                .saturating_add(billing.code_storage_fee(code.len())),
            TransactionKind::Call { .. } => basic_cost,
        };
        if tx.energy_limit > block_limit || tx.energy_limit < minimum {
            warn!(
                "Rejected ticket {}: energy limit {} outside [{}, {}]",
                task.ticket(),
                tx.energy_limit,
                minimum,
                block_limit
            );
            return Ok(TransactionResult::rejected(
                TransactionStatus::RejectedInvalidEnergyLimit,
            ));
        }

        let nonce = task.state.nonce(&tx.sender)?;
        if nonce != tx.nonce {
            warn!(
                "Rejected ticket {}: nonce {} does not match {}",
                task.ticket(),
                tx.nonce,
                nonce
            );
            return Ok(TransactionResult::rejected(
                TransactionStatus::RejectedInvalidNonce,
            ));
        }

        let balance = task.state.balance(&tx.sender)?;
        let upfront = tx.max_energy_cost();
        if balance < upfront.saturating_add(tx.value) {
            warn!(
                "Rejected ticket {}: balance {} cannot cover {} + {}",
                task.ticket(),
                balance,
                upfront,
                tx.value
            );
            return Ok(TransactionResult::rejected(
                TransactionStatus::RejectedInsufficientBalance,
            ));
        }

        // Buy the full energy limit; the unused part is refunded below.
        task.state.set_balance(&tx.sender, balance - upfront)?;
        task.state.increment_nonce(&tx.sender)?;

        let mut meter = EnergyMeter::new(tx.energy_limit);
        meter
            .consume(basic_cost)
            .map_err(|e| Trap::Fatal(format!("basic cost exceeds checked limit: {}", e)))?;

        let outcome = match &tx.kind {
            TransactionKind::Deploy { code, args } => {
                let request = CallRequest {
                    target: Address::derive(&tx.sender, tx.nonce),
                    caller: tx.sender,
                    value: tx.value,
                    kind: CallKind::Create { code, args },
                };
                self.enter(task, request, meter)?
            }
            TransactionKind::Call { to, args } => {
                let request = CallRequest {
                    target: *to,
                    caller: tx.sender,
                    value: tx.value,
                    kind: CallKind::Call { args },
                };
                self.enter(task, request, meter)?
            }
        };

        let refund = u128::from(tx.energy_limit - outcome.energy_used) * u128::from(tx.energy_price);
        task.state.credit(&tx.sender, refund)?;

        let (logs, internal_transactions) = task.side_effects.take();
        info!(
            "Ticket {} finished: {:?}, energy used {}",
            task.ticket(),
            outcome.status,
            outcome.energy_used
        );

        Ok(TransactionResult {
            status: outcome.status,
            energy_used: outcome.energy_used,
            return_data: outcome.return_data,
            logs,
            internal_transactions,
            exception: outcome.exception,
        })
    }

    /// Execute one attempt and commit it on the task's turn
    pub fn execute_and_commit(&self, task: &mut Task) -> std::result::Result<TransactionResult, Trap> {
        let result = self.execute(task)?;
        task.state.commit()?;
        Ok(result)
    }

    /// Execute a task to a terminal result, retrying it after every abort
    ///
    /// # Returns
    /// - `Ok(TransactionResult)` once the task committed
    /// - `Err(Trap::Fatal)` if the engine cannot continue
    pub fn execute_with_retry(&self, task: &mut Task) -> std::result::Result<TransactionResult, Trap> {
        let backoff = Backoff::new();
        loop {
            match self.execute_and_commit(task) {
                Err(Trap::Abort) => {
                    warn!(
                        "Ticket {} aborted on attempt {}, retrying",
                        task.ticket(),
                        task.attempts()
                    );
                    task.reset();
                    backoff.snooze();
                }
                Err(trap) => {
                    error!("Ticket {} hit a fatal condition: {}", task.ticket(), trap);
                    return Err(trap);
                }
                Ok(result) => return Ok(result),
            }
        }
    }

    /// Run a frame and convert its trap into an outcome
    ///
    /// Everything the frame did is reverted on failure. Only traps that
    /// unwind the whole task are returned as errors.
    fn enter(
        &self,
        task: &mut Task,
        request: CallRequest<'_>,
        mut meter: EnergyMeter,
    ) -> std::result::Result<CallOutcome, Trap> {
        let checkpoint = task.checkpoint();
        let depth = task.enter_frame();
        if depth > 1 {
            task.side_effects
                .add_internal_transaction(request.internal_transaction(meter.limit()));
        }

        let result = self.run(task, &request, &mut meter, depth);
        task.exit_frame();

        match result {
            Ok(data) => {
                debug!(
                    "Frame {} at depth {} succeeded, energy used {}",
                    request.target,
                    depth,
                    meter.consumed()
                );
                Ok(CallOutcome {
                    status: TransactionStatus::Success,
                    energy_used: meter.consumed(),
                    return_data: Some(data),
                    exception: None,
                })
            }
            Err(trap) => {
                let Some(status) = trap.status() else {
                    return Err(trap);
                };
                task.revert_to(checkpoint)
                    .map_err(|e| Trap::Fatal(format!("failed to revert frame: {}", e)))?;
                debug!(
                    "Frame {} at depth {} failed: {}",
                    request.target, depth, trap
                );
                let exception = match trap {
                    Trap::Exception(cause) => Some(cause),
                    _ => None,
                };
                Ok(CallOutcome {
                    status,
                    energy_used: meter.charge_for(status),
                    return_data: None,
                    exception,
                })
            }
        }
    }

    /// Frame body: transfer value, acquire contract state, invoke, exit
    fn run(
        &self,
        task: &mut Task,
        request: &CallRequest<'_>,
        meter: &mut EnergyMeter,
        depth: usize,
    ) -> std::result::Result<Vec<u8>, Trap> {
        task.state.check_abort()?;
        let target = request.target;

        if !task.state.transfer(&request.caller, &target, request.value)? {
            return Err(Trap::Invalid);
        }

        let module = match request.kind {
            CallKind::Call { .. } => match task.state.code(&target)? {
                Some(code) => self.load_module(&code)?,
                // Plain value transfer
                None => return Ok(Vec::new()),
            },
            CallKind::Create { code, .. } => {
                if task.state.code(&target)?.is_some() {
                    return Err(Trap::Invalid);
                }
                let module = self.load_module(code)?;
                let billing = self.env.billing();
                meter.consume(billing.deployment_fee(module.class_count(), code.len()))?;
                meter.consume(billing.code_storage_fee(code.len()))?;
                task.state.set_code(&target, Arc::new(code.to_vec()))?;
                module
            }
        };

        let reentry = self.acquire_state(task, &target, &module, meter)?;
        let result = self
            .invoke(task, request, meter, depth, &module)
            .and_then(|data| self.exit(task, &target, reentry, meter).map(|()| data));
        task.stack.pop();
        result
    }

    /// Push the contract's state on the reentrant stack
    ///
    /// # Returns
    /// Journal position of the caller's view for a reentrant entry
    fn acquire_state(
        &self,
        task: &mut Task,
        target: &Address,
        module: &Arc<dyn Module>,
        meter: &mut EnergyMeter,
    ) -> std::result::Result<Option<usize>, Trap> {
        let billing = self.env.billing();

        if let Some(state) = task.stack.try_share(target) {
            let statics = state.graph().statics().len();
            let snapshot = state.graph().capture(self.env.config().max_graph_bytes)?;
            FrameFees::new(billing, meter).read_static_from_cache(statics)?;
            let position = task.stack.record_reentry(*target, snapshot);
            task.stack.push(StackEntry::Shared(*target));
            debug!("Re-entered {} at stack height {}", target, task.stack.height());
            return Ok(Some(position));
        }

        let graph = match task.state.object_graph(target)? {
            Some(bytes) => {
                FrameFees::new(billing, meter).read_static_from_storage(bytes.len())?;
                ObjectGraph::load(&Snapshot::from_bytes(bytes.to_vec()))?
            }
            None => ObjectGraph::new(),
        };
        task.stack.push(StackEntry::Owned(ReentrantState::new(
            *target,
            Arc::clone(module),
            graph,
        )));
        Ok(None)
    }

    fn invoke(
        &self,
        task: &mut Task,
        request: &CallRequest<'_>,
        meter: &mut EnergyMeter,
        depth: usize,
        module: &Arc<dyn Module>,
    ) -> std::result::Result<Vec<u8>, Trap> {
        let mut frame = Frame {
            executor: self,
            task,
            meter,
            address: request.target,
            caller: request.caller,
            value: request.value,
            depth,
            unwind: None,
        };

        let result = match request.kind {
            CallKind::Call { args } => module.invoke(&mut frame, args),
            CallKind::Create { args, .. } => module
                .deploy(&mut frame, args)
                .map(|()| request.target.to_vec()),
        };

        match frame.unwind.take() {
            Some(trap) => Err(trap),
            None => result,
        }
    }

    /// Publish a successful frame's graph
    ///
    /// A reentrant frame merges into the caller's live graph and pays
    /// cache write rates. The owning frame persists its graph to world
    /// state and pays storage write rates.
    fn exit(
        &self,
        task: &mut Task,
        target: &Address,
        reentry: Option<usize>,
        meter: &mut EnergyMeter,
    ) -> std::result::Result<(), Trap> {
        let mut fees = FrameFees::new(self.env.billing(), meter);

        match reentry {
            Some(position) => {
                let caller_view = match task.stack.reentry_snapshot(position) {
                    Some(snapshot) => ObjectGraph::load(snapshot)?,
                    None => return Err(missing_state(target)),
                };
                let state = task
                    .stack
                    .state_mut(target)
                    .ok_or_else(|| missing_state(target))?;
                let live = std::mem::take(state.graph_mut());
                let delta = live.delta_since(&caller_view);
                state.replace_graph(ObjectGraph::commit(caller_view, live));
                bill_delta(
                    &delta,
                    &mut fees,
                    |fees, bytes| fees.first_write_to_cache(bytes),
                    |fees, bytes| fees.update_write_to_cache(bytes),
                )?;
            }
            None => {
                let state = task
                    .stack
                    .try_share(target)
                    .ok_or_else(|| missing_state(target))?;
                let delta = state.graph().delta_since(state.persisted());
                if delta.is_empty() {
                    return Ok(());
                }
                let snapshot = state.graph().capture(self.env.config().max_graph_bytes)?;
                bill_delta(
                    &delta,
                    &mut fees,
                    |fees, bytes| fees.first_write_to_storage(bytes),
                    |fees, bytes| fees.update_write_to_storage(bytes),
                )?;
                task.state
                    .put_object_graph(target, Arc::new(snapshot.into_bytes()))?;
            }
        }
        Ok(())
    }

    fn load_module(&self, code: &[u8]) -> std::result::Result<Arc<dyn Module>, Trap> {
        self.env
            .modules()
            .get_or_instantiate(code)
            .map_err(|e| Trap::RejectedModule(e.to_string()))
    }
}

fn bill_delta<P, F, U>(
    delta: &GraphDelta,
    fees: &mut P,
    first_write: F,
    update: U,
) -> EnergyResult<()>
where
    P: StorageFeeProcessor,
    F: Fn(&mut P, usize) -> EnergyResult<()>,
    U: Fn(&mut P, usize) -> EnergyResult<()>,
{
    for bytes in &delta.first_writes {
        first_write(fees, *bytes)?;
    }
    for bytes in &delta.updates {
        update(fees, *bytes)?;
    }
    Ok(())
}

fn missing_state(address: &Address) -> Trap {
    Trap::Fatal(format!("No reentrant state for {}", address))
}

/// One call frame, as seen by the running contract
struct Frame<'a> {
    executor: &'a TransactionExecutor,
    task: &'a mut Task,
    meter: &'a mut EnergyMeter,
    address: Address,
    caller: Address,
    value: u128,
    depth: usize,

    /// Trap the frame must end with, whatever the contract returns
    unwind: Option<Trap>,
}

impl Frame<'_> {
    fn check(&self) -> std::result::Result<(), Trap> {
        match &self.unwind {
            Some(trap) => Err(trap.clone()),
            None => Ok(()),
        }
    }

    /// Record a trap that ends the frame
    fn fail(&mut self, trap: Trap) -> Trap {
        let ends_frame = trap.unwinds_task()
            || matches!(trap, Trap::OutOfEnergy | Trap::CallDepthLimitExceeded);
        if ends_frame && self.unwind.is_none() {
            self.unwind = Some(trap.clone());
        }
        trap
    }

    fn guard<T>(&mut self, result: std::result::Result<T, Trap>) -> std::result::Result<T, Trap> {
        result.map_err(|trap| self.fail(trap))
    }

    fn charge(&mut self, amount: u64) -> std::result::Result<(), Trap> {
        self.check()?;
        let signalled = self.task.state.check_abort();
        self.guard(signalled)?;
        let result = self.meter.consume(amount).map_err(Trap::from);
        self.guard(result)
    }

    fn bill<F>(&mut self, f: F) -> std::result::Result<(), Trap>
    where
        F: FnOnce(&mut FrameFees<'_>) -> EnergyResult<()>,
    {
        self.check()?;
        let executor = self.executor;
        let result = f(&mut FrameFees::new(executor.env.billing(), &mut *self.meter))
            .map_err(Trap::from);
        self.guard(result)
    }

    fn with_state<T, F>(&mut self, f: F) -> std::result::Result<T, Trap>
    where
        F: FnOnce(&mut ReentrantState) -> std::result::Result<T, Trap>,
    {
        self.check()?;
        let address = self.address;
        let result = match self.task.stack.state_mut(&address) {
            Some(state) if state.loader().is_active() => f(state),
            Some(_) => Err(Trap::Fatal(format!(
                "Instance loader of {} used while inactive",
                address
            ))),
            None => Err(missing_state(&address)),
        };
        self.guard(result)
    }

    fn dispatch(
        &mut self,
        target: Address,
        value: u128,
        kind: CallKind<'_>,
        energy_limit: u64,
    ) -> std::result::Result<CallOutcome, Trap> {
        let executor = self.executor;
        let env = &executor.env;
        self.charge(env.billing().internal_call)?;

        let max_depth = env.config().max_call_depth;
        if self.depth >= max_depth {
            warn!(
                "Call depth limit {} reached in {}",
                max_depth, self.address
            );
            return Err(self.fail(Trap::CallDepthLimitExceeded));
        }

        let request = CallRequest {
            target,
            caller: self.address,
            value,
            kind,
        };
        let grant = self.meter.restrict_sub_call(energy_limit);

        let balance = self.task.state.balance(&self.address);
        if self.guard(balance)? < value {
            let mut rejected = request.internal_transaction(grant);
            rejected.rejected = true;
            self.task.side_effects.add_internal_transaction(rejected);
            return Ok(CallOutcome::rejected(
                TransactionStatus::RejectedInsufficientBalance,
            ));
        }

        let outcome = executor.enter(&mut *self.task, request, EnergyMeter::new(grant));
        let outcome = self.guard(outcome)?;
        self.charge(outcome.energy_used)?;
        Ok(outcome)
    }
}

impl Runtime for Frame<'_> {
    fn address(&self) -> Address {
        self.address
    }

    fn caller(&self) -> Address {
        self.caller
    }

    fn origin(&self) -> Address {
        *self.task.origin()
    }

    fn value(&self) -> u128 {
        self.value
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn block_context(&self) -> BlockContext {
        self.task.state.block_context().clone()
    }

    fn energy_remaining(&self) -> u64 {
        self.meter.remaining()
    }

    fn charge_energy(&mut self, amount: u64) -> std::result::Result<(), Trap> {
        self.charge(amount)
    }

    fn balance(&mut self, address: &Address) -> std::result::Result<u128, Trap> {
        self.check()?;
        let balance = self.task.state.balance(address);
        self.guard(balance)
    }

    fn statics(&mut self) -> std::result::Result<Vec<u8>, Trap> {
        let statics = self.with_state(|state| Ok(state.graph().statics().to_vec()))?;
        self.bill(|fees| fees.read_static_from_cache(statics.len()))?;
        Ok(statics)
    }

    fn set_statics(&mut self, data: Vec<u8>) -> std::result::Result<(), Trap> {
        self.with_state(|state| {
            state.graph_mut().set_statics(data);
            Ok(())
        })
    }

    fn allocate(&mut self, data: Vec<u8>) -> std::result::Result<ObjectId, Trap> {
        self.with_state(|state| Ok(state.graph_mut().allocate(data)))
    }

    fn object(&mut self, id: ObjectId) -> std::result::Result<Vec<u8>, Trap> {
        let data = self.with_state(|state| {
            state
                .graph()
                .instance(id)
                .map(<[u8]>::to_vec)
                .ok_or(Trap::Invalid)
        })?;
        self.bill(|fees| fees.read_instance_from_cache(data.len()))?;
        Ok(data)
    }

    fn update_object(&mut self, id: ObjectId, data: Vec<u8>) -> std::result::Result<(), Trap> {
        self.with_state(|state| Ok(state.graph_mut().update_instance(id, data)?))
    }

    fn intern(&mut self, name: &str) -> std::result::Result<u32, Trap> {
        self.with_state(|state| Ok(state.symbols_mut().intern(name)))
    }

    fn get_storage(&mut self, key: &[u8]) -> std::result::Result<Option<Vec<u8>>, Trap> {
        self.check()?;
        let address = self.address;
        let value = self.task.state.storage(&address, key);
        let value = self.guard(value)?;
        let bytes = value.as_ref().map_or(0, Vec::len);
        self.bill(|fees| fees.read_instance_from_storage(bytes))?;
        Ok(value)
    }

    fn put_storage(&mut self, key: &[u8], value: Option<Vec<u8>>) -> std::result::Result<(), Trap> {
        self.check()?;
        let address = self.address;
        let previous = self.task.state.storage(&address, key);
        let exists = self.guard(previous)?.is_some();
        let bytes = value.as_ref().map_or(0, Vec::len);
        self.bill(|fees| {
            if exists {
                fees.update_write_to_storage(bytes)
            } else {
                fees.first_write_to_storage(bytes)
            }
        })?;
        let written = self.task.state.put_storage(&address, key, value);
        self.guard(written)
    }

    fn log(&mut self, topics: Vec<Vec<u8>>, data: Vec<u8>) -> std::result::Result<(), Trap> {
        let cost = self
            .executor
            .env
            .billing()
            .log_cost(topics.len(), data.len());
        self.charge(cost)?;
        self.task.side_effects.add_log(Log {
            address: self.address,
            topics,
            data,
        });
        Ok(())
    }

    fn call(
        &mut self,
        target: &Address,
        value: u128,
        args: &[u8],
        energy_limit: u64,
    ) -> std::result::Result<CallOutcome, Trap> {
        self.dispatch(*target, value, CallKind::Call { args }, energy_limit)
    }

    fn create(
        &mut self,
        code: &[u8],
        args: &[u8],
        value: u128,
        energy_limit: u64,
    ) -> std::result::Result<CallOutcome, Trap> {
        self.check()?;
        let address = self.address;
        let nonce = self.task.state.increment_nonce(&address);
        let nonce = self.guard(nonce)?;
        let target = Address::derive(&address, nonce);
        self.dispatch(target, value, CallKind::Create { code, args }, energy_limit)
    }

    fn self_destruct(&mut self, beneficiary: &Address) -> std::result::Result<(), Trap> {
        let cost = self.executor.env.billing().self_destruct;
        self.charge(cost)?;

        let address = self.address;
        let result = (|| {
            let balance = self.task.state.balance(&address)?;
            if *beneficiary != address {
                self.task.state.credit(beneficiary, balance)?;
            }
            self.task.state.delete_account(&address)
        })();
        self.guard(result)?;
        info!("Contract {} self-destructed to {}", address, beneficiary);
        Ok(())
    }
}
