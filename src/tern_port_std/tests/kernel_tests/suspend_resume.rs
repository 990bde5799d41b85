//! Suspension composes with the Ready state only: self-suspension and
//! suspension of a Waiting task are rejected.
use std::sync::atomic::{AtomicBool, Ordering};

use tern_kernel::{
    error::SuspendTaskError, semaphore::Semaphore, task::Task, task::TaskOptions, task::TaskSt,
    Affinity, Config, WAIT_FOREVER,
};

use crate::utils;

tern_kernel::build! {
    pub struct SystemTraits;

    priority_levels: 16,
    num_cores: 1,
    max_tasks: 8,
    max_mutexes: 1,
    max_semaphores: 2,
    max_queues: 1,
    max_event_groups: 1,
    max_stream_buffers: 1,
    max_timers: 2,
    ipc_ring_depth: 4,
    error_history_len: 4,
    trace_buffer_len: 0,
    idle_stack_size: 16384,
}
tern_port_std::use_port!(unsafe SystemTraits);

type System = tern_kernel::System<SystemTraits>;

static WORKER_RAN: AtomicBool = AtomicBool::new(false);
static WORKER_DONE: AtomicBool = AtomicBool::new(false);
static DONE: AtomicBool = AtomicBool::new(false);
static SEM_ID: std::sync::OnceLock<tern_kernel::Id> = std::sync::OnceLock::new();
static WORKER_ID: std::sync::OnceLock<tern_kernel::Id> = std::sync::OnceLock::new();

fn worker(_: usize) {
    WORKER_RAN.store(true, Ordering::Release);
    let sem = Semaphore::<SystemTraits>::from_id(*SEM_ID.get().unwrap());
    sem.take(WAIT_FOREVER).unwrap();
    WORKER_DONE.store(true, Ordering::Release);
}

fn controller(_: usize) {
    let sem = Semaphore::<SystemTraits>::create(0, 1).unwrap();
    SEM_ID.set(sem.id()).unwrap();

    // The worker ranks below us: it's created Ready but doesn't run
    let worker = Task::<SystemTraits>::create(&TaskOptions {
        priority: 2,
        stack: utils::leak_stack(65536),
        entry: worker,
        param: 0,
        affinity: Affinity::Any,
        name: Some("worker"),
    })
    .unwrap();
    WORKER_ID.set(worker.id()).unwrap();
    assert_eq!(worker.stats().unwrap().state, TaskSt::Ready);

    // Ready → Suspended → Ready
    worker.suspend().unwrap();
    assert_eq!(worker.stats().unwrap().state, TaskSt::Suspended);
    assert_eq!(worker.suspend(), Err(SuspendTaskError::BadObjectState));
    worker.resume().unwrap();
    assert_eq!(worker.stats().unwrap().state, TaskSt::Ready);
    assert!(!WORKER_RAN.load(Ordering::Acquire));

    // A task cannot suspend itself
    let me = Task::<SystemTraits>::current().unwrap();
    assert_eq!(me.suspend(), Err(SuspendTaskError::SelfSuspend));

    DONE.store(true, Ordering::Release);
    // The controller exits; the worker finally runs and parks on the
    // semaphore
}

#[test]
fn suspension_state_machine() {
    utils::init_logger();

    System::init(&Config::default()).unwrap();
    Task::<SystemTraits>::create(&TaskOptions {
        priority: 5,
        stack: utils::leak_stack(65536),
        entry: controller,
        param: 0,
        affinity: Affinity::Any,
        name: Some("controller"),
    })
    .unwrap();

    tern_port_std::start_kernel::<SystemTraits>();
    utils::wait_until(|| DONE.load(Ordering::Acquire));

    let worker = Task::<SystemTraits>::from_id(*WORKER_ID.get().unwrap());

    // Wait for the worker to park on the semaphore, then verify a Waiting
    // task can't be suspended
    utils::wait_until(|| worker.stats().map_or(false, |s| s.state == TaskSt::Waiting));
    assert_eq!(worker.suspend(), Err(SuspendTaskError::BadObjectState));

    // Releasing the semaphore lets it finish
    Semaphore::<SystemTraits>::from_id(*SEM_ID.get().unwrap())
        .give()
        .unwrap();
    utils::wait_until(|| WORKER_DONE.load(Ordering::Acquire));
}
