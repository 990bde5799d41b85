//! Equal-priority tasks rotate in FIFO order when the running task yields.
use std::sync::atomic::{AtomicBool, Ordering};

use tern_kernel::{task, task::Task, task::TaskOptions, Affinity, Config};

use crate::utils;

tern_kernel::build! {
    pub struct SystemTraits;

    priority_levels: 16,
    num_cores: 1,
    max_tasks: 8,
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

static LOG: utils::OrderLog = utils::OrderLog::new();
static DONE: AtomicBool = AtomicBool::new(false);

const ROUNDS: usize = 3;

fn spinner(id: usize) {
    for _ in 0..ROUNDS {
        LOG.push(id);
        task::yield_now::<SystemTraits>().unwrap();
    }
    if LOG.len() == 2 * ROUNDS {
        DONE.store(true, Ordering::Release);
    }
}

#[test]
fn yield_rotates_equal_priorities_fifo() {
    utils::init_logger();

    System::init(&Config::default()).unwrap();
    for id in [1, 2] {
        Task::<SystemTraits>::create(&TaskOptions {
            priority: 5,
            stack: utils::leak_stack(65536),
            entry: spinner,
            param: id,
            affinity: Affinity::Any,
            name: None,
        })
        .unwrap();
    }

    tern_port_std::start_kernel::<SystemTraits>();
    utils::wait_until(|| DONE.load(Ordering::Acquire));

    assert_eq!(LOG.snapshot(), [1, 2, 1, 2, 1, 2]);
}
