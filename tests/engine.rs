//! End-to-end tests through the worker pool

use silver_engine::{
    Address, BillingSchedule, BlockContext, ConcurrentExecutor, EngineConfig, InMemoryWorldState,
    Module, ModuleError, ModuleLoader, ObjectGraph, Runtime, Snapshot, Transaction,
    TransactionResult, TransactionStatus, Trap, WorldState,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type Script = fn(&mut dyn Runtime, &[u8]) -> Result<Vec<u8>, Trap>;

struct ScriptModule(Script);

impl Module for ScriptModule {
    fn invoke(&self, rt: &mut dyn Runtime, args: &[u8]) -> Result<Vec<u8>, Trap> {
        (self.0)(rt, args)
    }
}

/// Calls itself `args[0]` times and returns the depth it bottomed out at
fn recurser(rt: &mut dyn Runtime, args: &[u8]) -> Result<Vec<u8>, Trap> {
    match args.first().copied().unwrap_or(0) {
        0 => Ok(vec![rt.depth() as u8]),
        n => {
            let me = rt.address();
            rt.call(&me, 0, &[n - 1], u64::MAX)?.into_result()
        }
    }
}

/// Returns the energy it was granted
fn report_grant(rt: &mut dyn Runtime, _args: &[u8]) -> Result<Vec<u8>, Trap> {
    Ok(rt.energy_remaining().to_le_bytes().to_vec())
}

fn forwarder(rt: &mut dyn Runtime, args: &[u8]) -> Result<Vec<u8>, Trap> {
    let target = Address::from_slice(args).ok_or(Trap::Invalid)?;
    rt.call(&target, 0, &[], u64::MAX)?.into_result()
}

/// Increments a u64 kept in the statics and returns the new value
///
/// Holds the counter for a couple of milliseconds so that concurrent
/// callers overlap.
fn counter(rt: &mut dyn Runtime, _args: &[u8]) -> Result<Vec<u8>, Trap> {
    let statics = rt.statics()?;
    let current = match statics.as_slice().try_into() {
        Ok(bytes) => u64::from_le_bytes(bytes),
        Err(_) => 0,
    };
    thread::sleep(Duration::from_millis(2));
    let next = (current + 1).to_le_bytes().to_vec();
    rt.set_statics(next.clone())?;
    Ok(next)
}

/// Op 0: write 1, call B, return statics. Op 1: write 2.
fn reentrant(rt: &mut dyn Runtime, args: &[u8]) -> Result<Vec<u8>, Trap> {
    match args.first() {
        Some(0) => {
            rt.set_statics(vec![1])?;
            let b = Address::from_slice(&args[1..]).ok_or(Trap::Invalid)?;
            let me = rt.address().to_vec();
            rt.call(&b, 0, &me, u64::MAX)?;
            rt.statics()
        }
        _ => {
            rt.set_statics(vec![2])?;
            Ok(Vec::new())
        }
    }
}

fn revert_after_callback(rt: &mut dyn Runtime, args: &[u8]) -> Result<Vec<u8>, Trap> {
    let a = Address::from_slice(args).ok_or(Trap::Invalid)?;
    rt.call(&a, 0, &[1], u64::MAX)?.into_result()?;
    Err(Trap::Revert)
}

struct ScriptLoader;

impl ModuleLoader for ScriptLoader {
    fn instantiate(&self, code: &[u8]) -> silver_engine::module::Result<Arc<dyn Module>> {
        let script: Script = match code {
            b"recurser" => recurser,
            b"granted" => report_grant,
            b"forwarder" => forwarder,
            b"counter" => counter,
            b"reentrant" => reentrant,
            b"revert_after_callback" => revert_after_callback,
            _ => return Err(ModuleError::Rejected("unknown script".to_string())),
        };
        Ok(Arc::new(ScriptModule(script)))
    }
}

const LIMIT: u64 = 1_000_000;
const FUNDS: u128 = 1_000_000_000_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sender(i: u8) -> Address {
    Address::repeat_byte(0x10 + i)
}

fn world(senders: u8) -> Arc<InMemoryWorldState> {
    let balances: Vec<_> = (0..senders).map(|i| (sender(i), FUNDS)).collect();
    Arc::new(InMemoryWorldState::with_balances(
        BlockContext::default(),
        &balances,
    ))
}

fn engine(world: Arc<InMemoryWorldState>, workers: usize, billing: BillingSchedule) -> ConcurrentExecutor {
    let config = EngineConfig::default()
        .with_worker_threads(workers)
        .with_billing(billing);
    ConcurrentExecutor::new(config, Arc::new(ScriptLoader), world).unwrap()
}

fn deploy(from: Address, nonce: u64, code: &[u8]) -> Transaction {
    Transaction::deploy(from, nonce, code.to_vec(), Vec::new(), LIMIT, 1)
}

fn call(from: Address, nonce: u64, to: Address, args: Vec<u8>) -> Transaction {
    Transaction::call(from, nonce, to, 0, args, LIMIT, 1)
}

fn statics_of(world: &InMemoryWorldState, address: &Address) -> Vec<u8> {
    let bytes = world.get_object_graph(address).unwrap().unwrap();
    ObjectGraph::load(&Snapshot::from_bytes(bytes.to_vec()))
        .unwrap()
        .statics()
        .to_vec()
}

#[test]
fn test_depth_boundary() {
    init_tracing();
    let alice = sender(0);
    let world = world(1);
    let engine = engine(world.clone(), 4, BillingSchedule::default());
    let recurser = Address::derive(&alice, 0);

    let results = engine
        .execute_transactions(vec![
            deploy(alice, 0, b"recurser"),
            call(alice, 1, recurser, vec![9]),
            call(alice, 2, recurser, vec![10]),
        ])
        .unwrap();

    assert_eq!(results[0].return_data, Some(recurser.to_vec()));
    assert_eq!(results[1].status, TransactionStatus::Success);
    assert_eq!(results[1].return_data, Some(vec![10]));
    assert_eq!(results[2].status, TransactionStatus::CallDepthLimitExceeded);
    assert_eq!(results[2].energy_used, LIMIT);
    assert_eq!(world.get_nonce(&alice).unwrap(), 3);
    engine.shutdown().unwrap();
}

#[test]
fn test_sub_call_keeps_a_sixty_fourth() {
    init_tracing();
    let alice = sender(0);
    let engine = engine(world(1), 2, BillingSchedule::free());
    let granted_contract = Address::derive(&alice, 0);
    let forwarder = Address::derive(&alice, 1);

    let results = engine
        .execute_transactions(vec![
            deploy(alice, 0, b"granted"),
            deploy(alice, 1, b"forwarder"),
            call(alice, 2, forwarder, granted_contract.to_vec()),
        ])
        .unwrap();

    let granted = u64::from_le_bytes(results[2].return_data.clone().unwrap().try_into().unwrap());
    assert_eq!(granted, LIMIT - LIMIT / 64);
}

#[test]
fn test_reentrant_revert_is_isolated() {
    init_tracing();
    let alice = sender(0);
    let world = world(1);
    let engine = engine(world.clone(), 2, BillingSchedule::default());
    let a = Address::derive(&alice, 0);
    let b = Address::derive(&alice, 1);

    let mut args = vec![0];
    args.extend_from_slice(b.as_bytes());
    let results = engine
        .execute_transactions(vec![
            deploy(alice, 0, b"reentrant"),
            deploy(alice, 1, b"revert_after_callback"),
            call(alice, 2, a, args),
        ])
        .unwrap();

    assert_eq!(results[2].status, TransactionStatus::Success);
    assert_eq!(results[2].return_data, Some(vec![1]));
    assert_eq!(statics_of(&world, &a), vec![1]);
}

#[test]
fn test_invalid_nonce_is_rejected_in_order() {
    init_tracing();
    let alice = sender(0);
    let bob = Address::repeat_byte(0xB0);
    let world = world(1);
    let engine = engine(world.clone(), 4, BillingSchedule::default());

    let results = engine
        .execute_transactions(vec![
            Transaction::call(alice, 0, bob, 1, Vec::new(), LIMIT, 1),
            Transaction::call(alice, 2, bob, 1, Vec::new(), LIMIT, 1),
            Transaction::call(alice, 1, bob, 1, Vec::new(), LIMIT, 1),
        ])
        .unwrap();

    let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            TransactionStatus::Success,
            TransactionStatus::RejectedInvalidNonce,
            TransactionStatus::Success,
        ]
    );
    assert_eq!(results[1].energy_used, 0);
    assert_eq!(world.get_balance(&bob).unwrap(), 2);
    assert_eq!(world.get_nonce(&alice).unwrap(), 2);
}

/// Deploys a counter and increments it once from each of `senders` accounts
fn contended_batch(senders: u8) -> (Address, Vec<Transaction>) {
    let deployer = sender(0);
    let counter = Address::derive(&deployer, 0);
    let mut batch = vec![deploy(deployer, 0, b"counter")];
    for i in 0..senders {
        let nonce = if i == 0 { 1 } else { 0 };
        batch.push(call(sender(i), nonce, counter, Vec::new()));
    }
    (counter, batch)
}

#[test]
fn test_contended_counter_matches_submission_order() {
    init_tracing();
    const SENDERS: u8 = 32;
    let world = world(SENDERS);
    let engine = engine(world.clone(), 8, BillingSchedule::default());
    let (counter, batch) = contended_batch(SENDERS);

    let results = engine.execute_transactions(batch).unwrap();

    for (i, result) in results.iter().enumerate().skip(1) {
        assert_eq!(result.status, TransactionStatus::Success);
        assert_eq!(result.return_data, Some((i as u64).to_le_bytes().to_vec()));
    }
    assert_eq!(
        statics_of(&world, &counter),
        u64::from(SENDERS).to_le_bytes().to_vec()
    );

    let stats = engine.monitor_stats();
    assert!(stats.acquired > 0);
    assert!(stats.waited + stats.aborted > 0);
    engine.shutdown().unwrap();
}

#[test]
fn test_parallel_results_equal_sequential_results() {
    init_tracing();
    const SENDERS: u8 = 16;

    let run = |workers: usize| -> (Vec<TransactionResult>, Arc<InMemoryWorldState>) {
        let world = world(SENDERS);
        let engine = engine(world.clone(), workers, BillingSchedule::default());
        let (_, batch) = contended_batch(SENDERS);
        let results = engine.execute_transactions(batch).unwrap();
        engine.shutdown().unwrap();
        (results, world)
    };

    let (sequential, sequential_world) = run(1);
    let (parallel, parallel_world) = run(8);

    assert_eq!(sequential, parallel);
    for i in 0..SENDERS {
        assert_eq!(
            sequential_world.get_balance(&sender(i)).unwrap(),
            parallel_world.get_balance(&sender(i)).unwrap()
        );
        assert_eq!(
            sequential_world.get_nonce(&sender(i)).unwrap(),
            parallel_world.get_nonce(&sender(i)).unwrap()
        );
    }
}

#[test]
fn test_batches_keep_global_order() {
    init_tracing();
    let world = world(4);
    let engine = engine(world.clone(), 4, BillingSchedule::default());
    let (counter, batch) = contended_batch(4);

    let first = engine.submit(batch).unwrap();
    let second = engine
        .submit((0..4).map(|i| call(sender(i), if i == 0 { 2 } else { 1 }, counter, Vec::new())).collect())
        .unwrap();

    let second: Vec<_> = second.into_iter().map(|f| f.get().unwrap()).collect();
    let first: Vec<_> = first.into_iter().map(|f| f.get().unwrap()).collect();

    assert!(first.iter().all(TransactionResult::is_success));
    assert_eq!(second[3].return_data, Some(8u64.to_le_bytes().to_vec()));
    engine.shutdown().unwrap();
}
