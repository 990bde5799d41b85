//! A timed-out semaphore take leaves the count untouched and no stray
//! waiter behind.
use std::sync::atomic::{AtomicBool, Ordering};

use tern_kernel::{semaphore::Semaphore, task::Task, task::TaskOptions, Affinity, Config};

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

static ABOUT_TO_BLOCK: AtomicBool = AtomicBool::new(false);
static WOKE: AtomicBool = AtomicBool::new(false);
static DONE: AtomicBool = AtomicBool::new(false);

fn driver(_: usize) {
    let sem = Semaphore::<SystemTraits>::create(0, 1).unwrap();

    ABOUT_TO_BLOCK.store(true, Ordering::Release);
    let result = sem.take(100);
    WOKE.store(true, Ordering::Release);

    assert_eq!(
        result,
        Err(tern_kernel::error::TakeSemaphoreError::Timeout)
    );
    // The wake happened on the deadline tick, not before or after
    assert_eq!(System::tick_count(), 100);
    // A take that timed out must not have decremented the count
    assert_eq!(sem.value().unwrap(), 0);
    // ... and must not have left a waiter behind: this give banks a permit
    // instead of waking anything
    sem.give().unwrap();
    assert_eq!(sem.value().unwrap(), 1);

    DONE.store(true, Ordering::Release);
}

#[test]
fn timeout_restores_semaphore_invariants() {
    utils::init_logger();

    System::init(&Config::default()).unwrap();
    Task::<SystemTraits>::create(&TaskOptions {
        priority: 5,
        stack: utils::leak_stack(65536),
        entry: driver,
        param: 0,
        affinity: Affinity::Any,
        name: Some("driver"),
    })
    .unwrap();

    tern_port_std::start_kernel::<SystemTraits>();

    // Let the driver park itself with its 100-tick deadline
    utils::wait_until(|| ABOUT_TO_BLOCK.load(Ordering::Acquire));
    std::thread::sleep(std::time::Duration::from_millis(20));

    // 99 ticks: still waiting
    for _ in 0..99 {
        tern_port_std::inject_tick::<SystemTraits>();
    }
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(!WOKE.load(Ordering::Acquire));

    // The 100th tick expires the deadline
    tern_port_std::inject_tick::<SystemTraits>();
    utils::wait_until(|| DONE.load(Ordering::Acquire));
}
