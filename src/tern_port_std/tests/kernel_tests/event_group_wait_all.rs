//! A wait-all waiter completes only when the last of its bits arrives, and
//! clear-on-exit consumes exactly the requested bits.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tern_kernel::{
    event_group::{EventGroup, EventGroupWaitFlags},
    task::Task,
    task::TaskOptions,
    Affinity, Config, NO_WAIT, WAIT_FOREVER,
};

use crate::utils;

tern_kernel::build! {
    pub struct SystemTraits;

    priority_levels: 16,
    num_cores: 1,
    max_tasks: 8,
    max_mutexes: 1,
    max_semaphores: 1,
    max_queues: 1,
    max_event_groups: 2,
    max_stream_buffers: 1,
    max_timers: 2,
    ipc_ring_depth: 4,
    error_history_len: 4,
    trace_buffer_len: 0,
    idle_stack_size: 16384,
}
tern_port_std::use_port!(unsafe SystemTraits);

type System = tern_kernel::System<SystemTraits>;

static WAIT_RESULT: AtomicU32 = AtomicU32::new(0);
static WOKE: AtomicBool = AtomicBool::new(false);
static DONE: AtomicBool = AtomicBool::new(false);
static EG_ID: std::sync::OnceLock<tern_kernel::Id> = std::sync::OnceLock::new();

fn waiter(_: usize) {
    let eg = EventGroup::<SystemTraits>::from_id(*EG_ID.get().unwrap());
    let observed = eg
        .wait(
            0x0f,
            EventGroupWaitFlags::ALL | EventGroupWaitFlags::CLEAR,
            WAIT_FOREVER,
        )
        .unwrap();
    WAIT_RESULT.store(observed, Ordering::Release);
    WOKE.store(true, Ordering::Release);
}

fn controller(_: usize) {
    let eg = EventGroup::<SystemTraits>::create().unwrap();
    EG_ID.set(eg.id()).unwrap();

    // The waiter outranks us: it runs now and parks on the event group
    Task::<SystemTraits>::create(&TaskOptions {
        priority: 5,
        stack: utils::leak_stack(65536),
        entry: waiter,
        param: 0,
        affinity: Affinity::Any,
        name: Some("waiter"),
    })
    .unwrap();

    // A partial set must not release a wait-all waiter
    eg.set(0x03).unwrap();
    assert!(!WOKE.load(Ordering::Acquire));
    assert_eq!(eg.get().unwrap(), 0x03);

    // Completing the mask releases it; clear-on-exit consumes the bits
    eg.set(0x0c).unwrap();
    assert!(WOKE.load(Ordering::Acquire));
    assert_eq!(WAIT_RESULT.load(Ordering::Acquire) & 0x0f, 0x0f);
    assert_eq!(eg.get().unwrap(), 0);

    // Waiting for the empty mask with wait-all holds vacuously
    let current = eg.wait(0, EventGroupWaitFlags::ALL, NO_WAIT).unwrap();
    assert_eq!(current, 0);

    DONE.store(true, Ordering::Release);
}

#[test]
fn wait_all_with_clear_on_exit() {
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
}
