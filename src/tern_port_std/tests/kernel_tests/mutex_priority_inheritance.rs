//! A low-priority mutex holder inherits the priority of a blocked
//! high-priority task, shutting out the middle-priority task until release.
use std::sync::atomic::{AtomicBool, Ordering};

use tern_kernel::{mutex::Mutex, task::Task, task::TaskOptions, Affinity, Config, WAIT_FOREVER};

use crate::utils;

tern_kernel::build! {
    pub struct SystemTraits;

    priority_levels: 16,
    num_cores: 1,
    max_tasks: 8,
    max_mutexes: 2,
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

static LOG: utils::EventLog = utils::EventLog::new();
static DONE: AtomicBool = AtomicBool::new(false);
static MUTEX_ID: std::sync::OnceLock<tern_kernel::Id> = std::sync::OnceLock::new();

fn low_task(_: usize) {
    let mutex = Mutex::<SystemTraits>::create().unwrap();
    MUTEX_ID.set(mutex.id()).unwrap();

    mutex.lock(WAIT_FOREVER).unwrap();
    LOG.push("low:locked");

    // The high-priority task preempts immediately and blocks on the mutex,
    // boosting us to its priority
    Task::<SystemTraits>::create(&TaskOptions {
        priority: 10,
        stack: utils::leak_stack(65536),
        entry: high_task,
        param: 0,
        affinity: Affinity::Any,
        name: Some("high"),
    })
    .unwrap();

    let me = Task::<SystemTraits>::current().unwrap();
    assert_eq!(me.stats().unwrap().effective_priority, 10);

    // A middle-priority task must *not* preempt the boosted holder
    Task::<SystemTraits>::create(&TaskOptions {
        priority: 5,
        stack: utils::leak_stack(65536),
        entry: middle_task,
        param: 0,
        affinity: Affinity::Any,
        name: Some("middle"),
    })
    .unwrap();
    LOG.push("low:critical-section");

    // Releasing hands the mutex to the high-priority waiter and drops our
    // effective priority back to the base
    mutex.unlock().unwrap();
    assert_eq!(me.stats().unwrap().effective_priority, 1);

    LOG.push("low:done");
    DONE.store(true, Ordering::Release);
}

fn high_task(_: usize) {
    LOG.push("high:start");
    let mutex = Mutex::<SystemTraits>::from_id(*MUTEX_ID.get().unwrap());
    mutex.lock(WAIT_FOREVER).unwrap();
    LOG.push("high:locked");
    mutex.unlock().unwrap();
    LOG.push("high:done");
}

fn middle_task(_: usize) {
    LOG.push("middle:run");
}

#[test]
fn priority_inheritance_bounds_inversion() {
    utils::init_logger();

    System::init(&Config::default()).unwrap();
    Task::<SystemTraits>::create(&TaskOptions {
        priority: 1,
        stack: utils::leak_stack(65536),
        entry: low_task,
        param: 0,
        affinity: Affinity::Any,
        name: Some("low"),
    })
    .unwrap();

    tern_port_std::start_kernel::<SystemTraits>();

    utils::wait_until(|| DONE.load(Ordering::Acquire));

    assert_eq!(
        LOG.snapshot(),
        [
            "low:locked",
            "high:start",
            "low:critical-section",
            "high:locked",
            "high:done",
            "middle:run",
            "low:done",
        ],
    );
}
