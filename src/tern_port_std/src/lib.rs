//! Simulation environment for running the Tern kernel on a hosted target.
//!
//! Each task is backed by an OS thread that only ever runs while the kernel
//! considers it the running task; every other task thread is parked on a
//! gate. A context switch wakes the incoming task's gate and parks the
//! outgoing thread, so kernel semantics (priority order, wake order,
//! blocking) are exercised exactly as on hardware, minus asynchronous
//! preemption.
//!
//! There is no real tick source: tests drive time deterministically with
//! [`inject_tick`]. Threads that aren't task threads (the test harness, the
//! `System::start` caller) count as interrupt context, mirroring how a tick
//! handler would interleave with tasks on hardware.
//!
//! The simulated kernel is single-core; SMP behavior is exercised on real
//! hardware and through the kernel's unit tests.
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Instant,
};

use tern_kernel::{KernelTraits, PortToKernel, TaskCb};

#[doc(hidden)]
pub use once_cell;

/// Implemented on the kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by `use_port!`.
pub unsafe trait PortInstance: KernelTraits {
    fn port_state() -> &'static State;
}

/// A task thread's wake-up gate.
struct Gate {
    runnable: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            runnable: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn wake(&self) {
        *self.runnable.lock().unwrap() = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut runnable = self.runnable.lock().unwrap();
        while !*runnable {
            runnable = self.cond.wait(runnable).unwrap();
        }
        *runnable = false;
    }
}

/// Per-kernel-instance port state, created by [`use_port!`].
pub struct State {
    /// The CPU Lock. A blocking mutex stands in for "interrupts masked":
    /// a second context contending for it simply waits, like an interrupt
    /// held off by PRIMASK.
    cpu_lock: Mutex<()>,

    /// Task-thread registry, keyed by control-block address.
    threads: spin::Mutex<HashMap<usize, Arc<Gate>>>,

    /// The origin of the simulated microsecond clock.
    epoch: Instant,
}

impl State {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            cpu_lock: Mutex::new(()),
            threads: spin::Mutex::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }
}

thread_local! {
    /// The CPU Lock guard, when held by this thread.
    static CPU_LOCK_GUARD: RefCell<Option<MutexGuard<'static, ()>>> = const { RefCell::new(None) };

    /// The control-block address of the task this thread backs, if it is a
    /// task thread.
    static TASK_KEY: Cell<usize> = const { Cell::new(0) };
}

// ---------------------------------------------------------------------------
// CPU Lock

pub fn enter_cpu_lock<Traits: PortInstance>() {
    let guard = Traits::port_state().cpu_lock.lock().unwrap();
    CPU_LOCK_GUARD.with(|slot| {
        let prev = slot.borrow_mut().replace(guard);
        assert!(prev.is_none(), "CPU Lock is not re-entrant");
    });
}

pub fn leave_cpu_lock() {
    CPU_LOCK_GUARD.with(|slot| {
        slot.borrow_mut()
            .take()
            .expect("CPU Lock released by a context that does not hold it");
    });
}

pub fn try_enter_cpu_lock<Traits: PortInstance>() -> bool {
    if is_cpu_lock_active() {
        false
    } else {
        enter_cpu_lock::<Traits>();
        true
    }
}

pub fn is_cpu_lock_active() -> bool {
    CPU_LOCK_GUARD.with(|slot| slot.borrow().is_some())
}

pub fn is_task_context() -> bool {
    TASK_KEY.with(|key| key.get() != 0)
}

// ---------------------------------------------------------------------------
// Dispatching

fn gate_of<Traits: PortInstance>(key: usize) -> Arc<Gate> {
    Traits::port_state()
        .threads
        .lock()
        .get(&key)
        .expect("no thread registered for the running task")
        .clone()
}

fn running_key<Traits: PortInstance>() -> Option<usize> {
    // Safety: reading the slot is benign; the value is only dereferenced by
    // the kernel
    let slot = tern_kernel::running_task_slot::<Traits>(0);
    let ptr = unsafe { slot.read() };
    (!ptr.is_null()).then_some(ptr as usize)
}

/// Elect the next running task and transfer control to it. If the calling
/// thread is a task thread losing the processor, it parks until it regains
/// it; any other caller (the "interrupt" side) just wakes the winner.
pub fn yield_cpu<Traits: PortInstance>() {
    assert!(!is_cpu_lock_active());

    enter_cpu_lock::<Traits>();
    // Safety: CPU Lock active
    unsafe { <Traits as PortToKernel>::choose_running_task() };
    let next = running_key::<Traits>();
    leave_cpu_lock();

    let me = TASK_KEY.with(|key| key.get());

    match next {
        Some(next) if next == me => {}
        Some(next) => {
            gate_of::<Traits>(next).wake();
            if me != 0 {
                // This task thread lost the processor; park until a future
                // dispatch elects it again
                gate_of::<Traits>(me).wait();
            }
        }
        None => {
            // No runnable task (pre-`init` only: afterwards the idle tasks
            // are always runnable)
        }
    }
}

pub fn dispatch_first_task<Traits: PortInstance>() -> ! {
    leave_cpu_lock();

    let first = running_key::<Traits>().expect("no task elected");
    gate_of::<Traits>(first).wake();

    // This thread has discarded its kernel role; it idles forever like a
    // dead boot stack
    loop {
        std::thread::park();
    }
}

pub fn exit_and_dispatch<Traits: PortInstance>() -> ! {
    let me = TASK_KEY.with(|key| key.get());
    Traits::port_state().threads.lock().remove(&me);

    leave_cpu_lock();

    enter_cpu_lock::<Traits>();
    // Safety: CPU Lock active
    unsafe { <Traits as PortToKernel>::choose_running_task() };
    let next = running_key::<Traits>();
    leave_cpu_lock();

    if let Some(next) = next {
        gate_of::<Traits>(next).wake();
    }

    // The task is gone; its thread only remains as an artifact of the
    // simulation
    loop {
        std::thread::park();
    }
}

/// Spawn (or respawn) the backing thread for a task slot. The thread stays
/// parked until the dispatcher elects the task.
pub fn initialize_task_state<Traits: PortInstance>(task: &'static TaskCb<Traits>) {
    let key = task as *const TaskCb<Traits> as usize;
    let gate = Gate::new();

    Traits::port_state().threads.lock().insert(key, gate.clone());

    std::thread::spawn(move || {
        TASK_KEY.with(|slot| slot.set(key));
        gate.wait();

        // Safety: the attributes are stable while the slot is occupied, and
        // the slot can't be recycled while its task is the running task
        let attr = unsafe { task.attr() };
        (attr.entry)(attr.param);

        // Safety: we are the running task whose entry function returned
        unsafe { tern_kernel::task::exit_current_task::<Traits>() };
    });
}

// ---------------------------------------------------------------------------
// Time

pub fn hires_us<Traits: PortInstance>() -> u64 {
    Traits::port_state().epoch.elapsed().as_micros() as u64
}

pub fn idle_wait() {
    // Nothing to do until the test injects a tick or another thread acts
    std::thread::sleep(std::time::Duration::from_micros(100));
}

pub fn halt() -> ! {
    panic!("kernel halted after an unrecoverable error");
}

// ---------------------------------------------------------------------------
// Test driver surface

/// Deliver one kernel tick, exactly as the hardware tick interrupt would.
/// Call from a non-task thread (the test body).
pub fn inject_tick<Traits: PortInstance>() {
    assert!(
        !is_task_context(),
        "ticks must be injected from the harness thread"
    );
    // Safety: CPU Lock inactive, non-task ("interrupt") context
    unsafe { <Traits as PortToKernel>::timer_tick() };
}

/// Run `System::start` on a fresh thread and give the scheduler a moment to
/// dispatch the first task.
pub fn start_kernel<Traits: PortInstance>() {
    std::thread::spawn(|| {
        tern_kernel::System::<Traits>::start();
    });
    // `start` never returns; wait until the idle task (at least) exists and
    // something was dispatched
    while running_key::<Traits>().is_none() {
        std::thread::yield_now();
    }
}

/// Bind the simulation port to a kernel trait type.
///
/// # Safety
///
/// Apply to exactly one type per test binary section; the type's
/// `NUM_CORES` must be 1.
#[macro_export]
macro_rules! use_port {
    (unsafe $Traits:ty) => {
        const _: () = {
            use tern_kernel::{PortThreading, PortTimer};

            static PORT_STATE: $crate::once_cell::sync::Lazy<$crate::State> =
                $crate::once_cell::sync::Lazy::new($crate::State::new);

            // Safety: this macro is the intended implementor
            unsafe impl $crate::PortInstance for $Traits {
                fn port_state() -> &'static $crate::State {
                    &PORT_STATE
                }
            }

            // The simulation is single-core
            const _: () = assert!(<$Traits as tern_kernel::KernelCfg1>::NUM_CORES == 1);

            // Safety: this macro provides a complete port implementation
            unsafe impl PortThreading for $Traits {
                type PortTaskState = ();

                unsafe fn dispatch_first_task() -> ! {
                    $crate::dispatch_first_task::<$Traits>()
                }

                unsafe fn yield_cpu() {
                    $crate::yield_cpu::<$Traits>()
                }

                unsafe fn exit_and_dispatch(
                    _task: &'static tern_kernel::TaskCb<Self>,
                ) -> ! {
                    $crate::exit_and_dispatch::<$Traits>()
                }

                unsafe fn enter_cpu_lock() {
                    $crate::enter_cpu_lock::<$Traits>()
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    $crate::try_enter_cpu_lock::<$Traits>()
                }

                unsafe fn leave_cpu_lock() {
                    $crate::leave_cpu_lock()
                }

                unsafe fn initialize_task_state(task: &'static tern_kernel::TaskCb<Self>) {
                    $crate::initialize_task_state::<$Traits>(task)
                }

                fn is_cpu_lock_active() -> bool {
                    $crate::is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    $crate::is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    !$crate::is_task_context()
                }

                fn core_id() -> usize {
                    0
                }

                unsafe fn notify_core(_core: usize) {
                    unreachable!("single-core simulation")
                }

                unsafe fn start_secondary_core() {
                    unreachable!("single-core simulation")
                }

                fn halt() -> ! {
                    $crate::halt()
                }
            }

            impl PortTimer for $Traits {
                unsafe fn start_tick(_rate_hz: u32) {
                    // Ticks are injected by the test driver
                }

                unsafe fn hires_us() -> u64 {
                    $crate::hires_us::<$Traits>()
                }

                fn idle_wait() {
                    $crate::idle_wait()
                }
            }
        };
    };
}
