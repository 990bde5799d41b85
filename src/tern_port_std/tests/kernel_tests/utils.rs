//! Shared helpers for the kernel test suite.
use std::{
    mem::MaybeUninit,
    sync::Mutex,
    time::{Duration, Instant},
};

use tern_kernel::Region;

/// Allocate a task stack for the lifetime of the test process. Backed by
/// `u64`s so the region meets the port's alignment requirement.
pub fn leak_stack(size: usize) -> Region {
    let buffer = vec![MaybeUninit::<u64>::uninit(); size.div_ceil(8)].into_boxed_slice();
    let slice = Box::leak(buffer);
    // Safety: the leaked allocation is exclusively owned and lives forever
    unsafe { Region::from_raw_parts(slice.as_mut_ptr().cast(), slice.len() * 8) }
}

/// Allocate storage for a queue or stream buffer.
pub fn leak_storage(size: usize) -> Region {
    leak_stack(size)
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Spin (with a real-time cap) until the condition holds. Panics if five
/// seconds pass without it becoming true.
#[track_caller]
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// An append-only sequence of numeric markers shared between test tasks
/// and the harness.
pub struct OrderLog {
    values: Mutex<Vec<usize>>,
}

impl OrderLog {
    pub const fn new() -> Self {
        Self {
            values: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, value: usize) {
        self.values.lock().unwrap().push(value);
    }

    pub fn snapshot(&self) -> Vec<usize> {
        self.values.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
    }
}

/// An append-only event log shared between test tasks and the harness.
pub struct EventLog {
    events: Mutex<Vec<&'static str>>,
}

impl EventLog {
    pub const fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}
