//! Stream buffers: the trigger level gates the receiver, and message mode
//! frames whole messages.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tern_kernel::{
    stream_buffer::StreamBuffer, task::Task, task::TaskOptions, Affinity, Config, NO_WAIT,
    WAIT_FOREVER,
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
    max_event_groups: 1,
    max_stream_buffers: 2,
    max_timers: 2,
    ipc_ring_depth: 4,
    error_history_len: 4,
    trace_buffer_len: 0,
    idle_stack_size: 16384,
}
tern_port_std::use_port!(unsafe SystemTraits);

type System = tern_kernel::System<SystemTraits>;

static RECEIVED_LEN: AtomicUsize = AtomicUsize::new(0);
static RECEIVED_OK: AtomicBool = AtomicBool::new(false);
static DONE: AtomicBool = AtomicBool::new(false);
static BYTE_SB: std::sync::OnceLock<tern_kernel::Id> = std::sync::OnceLock::new();

fn receiver(_: usize) {
    let sb = StreamBuffer::<SystemTraits>::create(utils::leak_storage(8), 4).unwrap();
    BYTE_SB.set(sb.id()).unwrap();

    // Parks until four bytes have accumulated
    let mut buffer = [0u8; 8];
    let got = sb.receive(&mut buffer, WAIT_FOREVER).unwrap();
    RECEIVED_LEN.store(got, Ordering::Release);
    RECEIVED_OK.store(got == 4 && &buffer[..4] == b"abcd", Ordering::Release);
}

fn controller(_: usize) {
    // The receiver outranks us: it creates the buffer and parks
    Task::<SystemTraits>::create(&TaskOptions {
        priority: 5,
        stack: utils::leak_stack(65536),
        entry: receiver,
        param: 0,
        affinity: Affinity::Any,
        name: Some("receiver"),
    })
    .unwrap();

    let sb = StreamBuffer::<SystemTraits>::from_id(*BYTE_SB.get().unwrap());

    // Two bytes sit below the trigger level: no wake-up
    assert_eq!(sb.send(b"ab", NO_WAIT).unwrap(), 2);
    assert_eq!(RECEIVED_LEN.load(Ordering::Acquire), 0);
    assert_eq!(sb.bytes_available().unwrap(), 2);

    // Two more reach the trigger level: the receiver takes all four
    assert_eq!(sb.send(b"cd", NO_WAIT).unwrap(), 2);
    assert!(RECEIVED_OK.load(Ordering::Acquire));
    assert_eq!(sb.bytes_available().unwrap(), 0);

    // A non-blocking send accepts only what fits
    assert_eq!(sb.send(b"0123456789", NO_WAIT).unwrap(), 8);
    assert_eq!(sb.send(b"x", NO_WAIT).unwrap(), 0);

    // Message mode: sends are framed, receives return whole messages
    let msb = StreamBuffer::<SystemTraits>::create_message_mode(utils::leak_storage(32)).unwrap();
    assert_eq!(msb.send(b"hello", NO_WAIT).unwrap(), 5);
    assert_eq!(msb.send(b"ok", NO_WAIT).unwrap(), 2);
    let mut buffer = [0u8; 16];
    assert_eq!(msb.receive(&mut buffer, NO_WAIT).unwrap(), 5);
    assert_eq!(&buffer[..5], b"hello");
    assert_eq!(msb.receive(&mut buffer, NO_WAIT).unwrap(), 2);
    assert_eq!(&buffer[..2], b"ok");

    DONE.store(true, Ordering::Release);
}

#[test]
fn trigger_level_and_message_framing() {
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
