//! Software timers: one-shot expiry, periodic re-arm, stop, and the
//! `start; stop; start` equivalence.
use std::sync::atomic::{AtomicU32, Ordering};

use tern_kernel::{
    timer::{Timer, TimerOptions, TimerSt},
    Config,
};

use crate::utils;

tern_kernel::build! {
    pub struct SystemTraits;

    priority_levels: 16,
    num_cores: 1,
    max_tasks: 4,
    max_mutexes: 1,
    max_semaphores: 1,
    max_queues: 1,
    max_event_groups: 1,
    max_stream_buffers: 1,
    max_timers: 4,
    ipc_ring_depth: 4,
    error_history_len: 4,
    trace_buffer_len: 0,
    idle_stack_size: 16384,
}
tern_port_std::use_port!(unsafe SystemTraits);

type System = tern_kernel::System<SystemTraits>;

static ONE_SHOT_FIRES: AtomicU32 = AtomicU32::new(0);
static PERIODIC_FIRES: AtomicU32 = AtomicU32::new(0);

fn one_shot_callback(_: usize) {
    ONE_SHOT_FIRES.fetch_add(1, Ordering::AcqRel);
}

fn periodic_callback(_: usize) {
    PERIODIC_FIRES.fetch_add(1, Ordering::AcqRel);
}

fn tick(n: u32) {
    for _ in 0..n {
        tern_port_std::inject_tick::<SystemTraits>();
    }
}

#[test]
fn timer_state_machine_and_dispatch() {
    utils::init_logger();

    System::init(&Config::default()).unwrap();
    tern_port_std::start_kernel::<SystemTraits>();

    let one_shot = Timer::<SystemTraits>::create(&TimerOptions {
        period: 5,
        periodic: false,
        callback: one_shot_callback,
        param: 0,
    })
    .unwrap();
    let periodic = Timer::<SystemTraits>::create(&TimerOptions {
        period: 10,
        periodic: true,
        callback: periodic_callback,
        param: 0,
    })
    .unwrap();

    assert_eq!(one_shot.state().unwrap(), TimerSt::Stopped);

    // `start; stop; start` is equivalent to a single start
    one_shot.start().unwrap();
    one_shot.stop().unwrap();
    one_shot.start().unwrap();
    periodic.start().unwrap();
    assert_eq!(one_shot.state().unwrap(), TimerSt::Running);

    // Nothing fires before the first deadline
    tick(4);
    assert_eq!(ONE_SHOT_FIRES.load(Ordering::Acquire), 0);

    // The one-shot fires at its 5th tick and expires
    tick(1);
    assert_eq!(ONE_SHOT_FIRES.load(Ordering::Acquire), 1);
    assert_eq!(one_shot.state().unwrap(), TimerSt::Expired);

    // The periodic timer fires every 10 ticks and stays Running
    tick(5);
    assert_eq!(PERIODIC_FIRES.load(Ordering::Acquire), 1);
    assert_eq!(periodic.state().unwrap(), TimerSt::Running);
    tick(10);
    assert_eq!(PERIODIC_FIRES.load(Ordering::Acquire), 2);

    // A stopped periodic timer no longer fires, and an expired one-shot
    // stays expired
    periodic.stop().unwrap();
    assert_eq!(periodic.state().unwrap(), TimerSt::Stopped);
    tick(20);
    assert_eq!(PERIODIC_FIRES.load(Ordering::Acquire), 2);
    assert_eq!(ONE_SHOT_FIRES.load(Ordering::Acquire), 1);

    // Restarting measures the period from now
    periodic.start().unwrap();
    tick(9);
    assert_eq!(PERIODIC_FIRES.load(Ordering::Acquire), 2);
    tick(1);
    assert_eq!(PERIODIC_FIRES.load(Ordering::Acquire), 3);
}
