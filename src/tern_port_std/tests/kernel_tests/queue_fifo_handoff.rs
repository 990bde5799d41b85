//! When a receiver drains a full queue, the highest-priority blocked
//! sender's payload is accepted next - payload order follows the
//! sender-side wait queue.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tern_kernel::{queue::Queue, task::Task, task::TaskOptions, Affinity, Config, WAIT_FOREVER};

use crate::utils;

tern_kernel::build! {
    pub struct SystemTraits;

    priority_levels: 16,
    num_cores: 1,
    max_tasks: 8,
    max_mutexes: 1,
    max_semaphores: 1,
    max_queues: 2,
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

static RECEIVED: Mutex<Vec<[u8; 2]>> = Mutex::new(Vec::new());
static DONE: AtomicBool = AtomicBool::new(false);
static QUEUE_ID: std::sync::OnceLock<tern_kernel::Id> = std::sync::OnceLock::new();

fn sender_a(_: usize) {
    let queue = Queue::<SystemTraits>::from_id(*QUEUE_ID.get().unwrap());
    // The first item fills the single-slot queue; the second parks us
    queue.send(b"a0", WAIT_FOREVER).unwrap();
    queue.send(b"a1", WAIT_FOREVER).unwrap();
}

fn sender_b(_: usize) {
    let queue = Queue::<SystemTraits>::from_id(*QUEUE_ID.get().unwrap());
    queue.send(b"b1", WAIT_FOREVER).unwrap();
}

fn consumer(_: usize) {
    let queue =
        Queue::<SystemTraits>::create(utils::leak_storage(2), 2, 1).unwrap();
    QUEUE_ID.set(queue.id()).unwrap();

    // Sender A (priority 3) fills the queue and blocks on its second item
    Task::<SystemTraits>::create(&TaskOptions {
        priority: 3,
        stack: utils::leak_stack(65536),
        entry: sender_a,
        param: 0,
        affinity: Affinity::Any,
        name: Some("sender-a"),
    })
    .unwrap();

    // Sender B (priority 7) blocks after A, but outranks it
    Task::<SystemTraits>::create(&TaskOptions {
        priority: 7,
        stack: utils::leak_stack(65536),
        entry: sender_b,
        param: 0,
        affinity: Affinity::Any,
        name: Some("sender-b"),
    })
    .unwrap();

    assert!(queue.is_full().unwrap());

    for _ in 0..3 {
        let mut item = [0u8; 2];
        queue.receive(&mut item, WAIT_FOREVER).unwrap();
        RECEIVED.lock().unwrap().push(item);
    }

    assert!(queue.is_empty().unwrap());
    DONE.store(true, Ordering::Release);
}

#[test]
fn blocked_sender_handoff_follows_waiter_priority() {
    utils::init_logger();

    System::init(&Config::default()).unwrap();
    Task::<SystemTraits>::create(&TaskOptions {
        priority: 1,
        stack: utils::leak_stack(65536),
        entry: consumer,
        param: 0,
        affinity: Affinity::Any,
        name: Some("consumer"),
    })
    .unwrap();

    tern_port_std::start_kernel::<SystemTraits>();
    utils::wait_until(|| DONE.load(Ordering::Acquire));

    // B's payload entered the queue before A's even though A blocked first
    assert_eq!(*RECEIVED.lock().unwrap(), [*b"a0", *b"b1", *b"a1"]);
}
