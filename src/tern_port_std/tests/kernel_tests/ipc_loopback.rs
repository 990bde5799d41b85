//! The inter-core channel on a single core: direct hand-off to a parked
//! receiver, ring buffering, FIFO order, and the dropped-message counter.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tern_kernel::{
    error::IpcSendError, ipc, semaphore::Semaphore, task::Task, task::TaskOptions, Affinity,
    Config, NO_WAIT, WAIT_FOREVER,
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

static RECEIVED: Mutex<Vec<u32>> = Mutex::new(Vec::new());
static DONE: AtomicBool = AtomicBool::new(false);
static GATE_ID: std::sync::OnceLock<tern_kernel::Id> = std::sync::OnceLock::new();

fn msg(tag: u32) -> ipc::Message {
    ipc::Message::new(tag, [tag, 0, 0])
}

fn receiver(_: usize) {
    let gate = Semaphore::<SystemTraits>::create(0, 1).unwrap();
    GATE_ID.set(gate.id()).unwrap();

    // Direct hand-off: we park first, the sender completes our wait
    let first = ipc::receive::<SystemTraits>(WAIT_FOREVER).unwrap();
    RECEIVED.lock().unwrap().push(first.tag);

    // Let the controller fill the ring while we're not receiving
    gate.take(WAIT_FOREVER).unwrap();

    // Drain the ring: strict FIFO
    for _ in 0..4 {
        let message = ipc::receive::<SystemTraits>(NO_WAIT).unwrap();
        RECEIVED.lock().unwrap().push(message.tag);
    }

    DONE.store(true, Ordering::Release);
}

fn controller(_: usize) {
    // The receiver outranks us and parks in `ipc::receive` first
    Task::<SystemTraits>::create(&TaskOptions {
        priority: 5,
        stack: utils::leak_stack(65536),
        entry: receiver,
        param: 0,
        affinity: Affinity::Any,
        name: Some("receiver"),
    })
    .unwrap();

    // Wakes the parked receiver directly, without touching the ring
    ipc::send::<SystemTraits>(0, msg(1), NO_WAIT).unwrap();

    // The receiver is now parked on the gate semaphore: these fill the ring
    for tag in 2..=5 {
        ipc::send::<SystemTraits>(0, msg(tag), NO_WAIT).unwrap();
    }

    // The ring holds four messages; the fifth non-blocking send is dropped
    // and counted
    assert_eq!(
        ipc::send::<SystemTraits>(0, msg(99), NO_WAIT),
        Err(IpcSendError::IpcFull)
    );
    assert_eq!(ipc::dropped_count::<SystemTraits>(0), 1);

    // Sending to a core that doesn't exist is rejected
    assert_eq!(
        ipc::send::<SystemTraits>(1, msg(0), NO_WAIT),
        Err(IpcSendError::BadParam)
    );

    Semaphore::<SystemTraits>::from_id(*GATE_ID.get().unwrap())
        .give()
        .unwrap();
}

#[test]
fn loopback_delivery_order_and_overflow() {
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

    assert_eq!(*RECEIVED.lock().unwrap(), [1, 2, 3, 4, 5]);
}
