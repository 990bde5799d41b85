//! Terminated tasks are harvested by the idle task, and their slots become
//! creatable again.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tern_kernel::{
    error::CreateTaskError, task::Task, task::TaskOptions, Affinity, Config,
};

use crate::utils;

tern_kernel::build! {
    pub struct SystemTraits;

    priority_levels: 16,
    num_cores: 1,
    // One slot for the idle task, one for each of the two short-lived
    // workers that must share a slot over time
    max_tasks: 3,
    max_mutexes: 1,
    max_semaphores: 1,
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

static FIRST_RAN: AtomicBool = AtomicBool::new(false);
static RUNS: AtomicU32 = AtomicU32::new(0);

fn short_lived(_: usize) {
    FIRST_RAN.store(true, Ordering::Release);
    RUNS.fetch_add(1, Ordering::AcqRel);
    // Returning from the entry function terminates the task
}

fn options() -> TaskOptions {
    TaskOptions {
        priority: 5,
        stack: utils::leak_stack(65536),
        entry: short_lived,
        param: 0,
        affinity: Affinity::Any,
        name: Some("short-lived"),
    }
}

#[test]
fn exited_task_slot_is_recycled() {
    utils::init_logger();

    System::init(&Config::default()).unwrap();

    // idle + both workers would need 4 slots without reaping
    Task::<SystemTraits>::create(&options()).unwrap();
    Task::<SystemTraits>::create(&options()).unwrap();
    assert_eq!(
        Task::<SystemTraits>::create(&options()),
        Err(CreateTaskError::PoolExhausted)
    );

    tern_port_std::start_kernel::<SystemTraits>();
    utils::wait_until(|| RUNS.load(Ordering::Acquire) == 2);

    // Once the idle task has reaped the Terminated slots, creation works
    // again
    utils::wait_until(|| Task::<SystemTraits>::create(&options()).is_ok());
    utils::wait_until(|| RUNS.load(Ordering::Acquire) == 3);
}
