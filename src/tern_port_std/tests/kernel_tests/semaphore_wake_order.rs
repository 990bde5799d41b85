//! Waiters parked on a semaphore are released strictly in effective-
//! priority order, one per `give`.
use std::sync::atomic::{AtomicBool, Ordering};

use tern_kernel::{
    semaphore::Semaphore, task::Task, task::TaskOptions, Affinity, Config, WAIT_FOREVER,
};

use crate::utils;

tern_kernel::build! {
    pub struct SystemTraits;

    priority_levels: 16,
    num_cores: 1,
    max_tasks: 16,
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

const NUM_WAITERS: usize = 10;

static ORDER: utils::OrderLog = utils::OrderLog::new();
static DONE: AtomicBool = AtomicBool::new(false);
static SEM_ID: std::sync::OnceLock<tern_kernel::Id> = std::sync::OnceLock::new();

fn waiter(priority: usize) {
    let sem = Semaphore::<SystemTraits>::from_id(*SEM_ID.get().unwrap());
    sem.take(WAIT_FOREVER).unwrap();
    ORDER.push(priority);
}

fn controller(_: usize) {
    let sem = Semaphore::<SystemTraits>::create(0, NUM_WAITERS as u32).unwrap();
    SEM_ID.set(sem.id()).unwrap();

    // Each waiter outranks us, runs immediately, and parks on the semaphore
    for priority in 2..2 + NUM_WAITERS {
        Task::<SystemTraits>::create(&TaskOptions {
            priority: priority as u8,
            stack: utils::leak_stack(65536),
            entry: waiter,
            param: priority,
            affinity: Affinity::Any,
            name: None,
        })
        .unwrap();
    }
    assert_eq!(ORDER.len(), 0);

    // Every `give` hands the permit to the most urgent remaining waiter,
    // which preempts us and records itself before exiting
    for expected_len in 1..=NUM_WAITERS {
        sem.give().unwrap();
        assert_eq!(ORDER.len(), expected_len);
    }

    DONE.store(true, Ordering::Release);
}

#[test]
fn wake_order_is_descending_priority() {
    utils::init_logger();

    System::init(&Config::default()).unwrap();
    Task::<SystemTraits>::create(&TaskOptions {
        priority: 1,
        stack: utils::leak_stack(65536),
        entry: controller,
        param: 0,
        affinity: Affinity::Any,
        name: Some("controller"),
    })
    .unwrap();

    tern_port_std::start_kernel::<SystemTraits>();
    utils::wait_until(|| DONE.load(Ordering::Acquire));

    let expected: Vec<usize> = (2..2 + NUM_WAITERS).rev().collect();
    assert_eq!(ORDER.snapshot(), expected);
}
