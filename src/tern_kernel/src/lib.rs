//! The Tern kernel: a preemptive, priority-based real-time kernel for the
//! dual-core RP2040 (Arm Cortex-M0+).
//!
//! The kernel is generic over a *kernel trait type* (`Traits`), which carries
//! the compile-time configuration (object pool capacities, priority levels,
//! core count) and the port bindings (context switching, CPU Lock, tick
//! source). An application instantiates the static kernel structures with
//! [`build!`] and binds a port with the port crate's `use_port!` macro, then
//! talks to the kernel through [`System`]`<Traits>` and the handle types
//! ([`task::Task`], [`mutex::Mutex`], [`semaphore::Semaphore`], ...).
//!
//! # Contexts
//!
//! - **Task context** - code running on a task's stack. Blocking calls are
//!   allowed here (and only here).
//! - **Interrupt context** - interrupt handlers and timer callbacks.
//!   Only the `*_isr` variants and non-blocking calls are allowed.
//! - **CPU Lock** - while CPU Lock is active (interrupts masked and, on SMP,
//!   the kernel spinlock held), kernel calls are not allowed at all; this is
//!   how the kernel serializes access to its own state.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::{borrow::BorrowMut, fmt, marker::PhantomData, mem::MaybeUninit, num::NonZeroUsize};

#[doc(hidden)]
pub extern crate arrayvec;

pub mod utils;
pub mod error;
mod klock;
mod state;
pub mod event_group;
pub mod health;
pub mod ipc;
pub mod mem;
pub mod mutex;
pub mod queue;
pub mod semaphore;
pub mod smp;
pub mod stream_buffer;
pub mod task;
pub mod timer;
pub mod trace;
mod readyqueue;
mod timeout;
mod wait;
pub mod cfg;

pub use crate::{
    cfg::Config,
    error::{ErrorCategory, ErrorCode, ErrorRecord},
    smp::{Affinity, AssignmentStrategy},
    task::TaskCb,
};

/// Numeric identifier of a kernel object: the index into the object's pool,
/// plus one.
pub type Id = NonZeroUsize;

/// Task priority. `0` is reserved for the per-core idle tasks; larger values
/// are more urgent.
pub type Priority = u8;

/// A duration or point of time measured in kernel ticks.
pub type Ticks = u32;

/// Timeout value indicating a non-blocking operation.
pub const NO_WAIT: Ticks = 0;

/// Timeout value indicating an unbounded wait.
pub const WAIT_FOREVER: Ticks = Ticks::MAX;

/// The longest representable finite timeout. Half of the tick counter's
/// range is reserved so that wrap-around comparison stays unambiguous.
pub const MAX_TIMEOUT: Ticks = 0x7fff_fffe;

/// A reference to a task control block in the static task pool.
pub type TaskRef<Traits> = &'static task::TaskCb<Traits>;

/// Construct a `BadIdError`, logging the event.
///
/// Object IDs are never forged in safe code, so a bad ID usually indicates a
/// handle that outlived its object.
#[cold]
pub(crate) fn bad_id<Traits: KernelTraits>() -> error::BadIdError {
    log::warn!("operation on a dangling or invalid object id");
    error::BadIdError::BadId
}

// ---------------------------------------------------------------------------
// Storage regions

/// An untyped region of memory provided by the application for a task stack,
/// a queue buffer, a stream buffer, or a block pool.
///
/// The region must outlive the object it backs and must not be accessed by
/// the application while the object exists. The safe constructor
/// [`Region::from_static`] enforces both through the `'static mut` borrow.
#[derive(Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

// Safety: `Region` is just a pointer-and-length pair. Whoever constructed it
// promised the pointee is valid for the object's lifetime; the kernel only
// dereferences it under CPU Lock.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl utils::Init for Region {
    const INIT: Self = Self {
        base: core::ptr::null_mut(),
        len: 0,
    };
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Region({:p}, {})", self.base, self.len)
    }
}

impl Region {
    /// Construct a `Region` from raw parts.
    ///
    /// # Safety
    ///
    /// `base .. base + len` must be valid for reads and writes for the
    /// lifetime of the kernel object this region is given to, and must not
    /// be aliased during that time.
    pub const unsafe fn from_raw_parts(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Construct a `Region` from an exclusively borrowed static buffer.
    pub fn from_static(buffer: &'static mut [MaybeUninit<u8>]) -> Self {
        Self {
            base: buffer.as_mut_ptr().cast(),
            len: buffer.len(),
        }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn is_null(&self) -> bool {
        self.base.is_null()
    }
}

// ---------------------------------------------------------------------------
// Kernel trait types

/// The first level of compile-time kernel configuration, implemented on a
/// kernel trait type by [`build!`].
///
/// # Safety
///
/// This is only intended to be implemented by `build!`.
pub unsafe trait KernelCfg1: Sized + Send + Sync + 'static {
    /// The number of task priority levels, including the reserved idle
    /// level `0`. Must be in range `2..=`[`utils::PRIO_LEVEL_CAP`].
    const NUM_TASK_PRIORITY_LEVELS: usize;

    /// The number of processor cores the scheduler manages (`1` or `2`).
    const NUM_CORES: usize;
}

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation. These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: KernelCfg1 {
    /// Port-specific per-task state, stored at the very beginning of each
    /// task control block (the saved stack pointer, typically).
    type PortTaskState: Send + Sync + utils::Init + 'static;

    /// The alignment requirement for task stack regions.
    const STACK_ALIGN: usize = 8;

    /// The minimum stack size the port can build an initial context in.
    const STACK_MIN_SIZE: usize = 128;

    /// Transfer the control to the current core's running task, discarding
    /// the current (startup) context.
    ///
    /// Precondition: CPU Lock active, scheduler started
    unsafe fn dispatch_first_task() -> !;

    /// Yield the processor. In a task context this transfers control to the
    /// dispatcher; in an interrupt context the dispatch is deferred to the
    /// end of interrupt processing.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Destroy the state of the previously running task (which might already
    /// have been removed from the running-task slot) and proceed to the
    /// dispatcher.
    ///
    /// Precondition: CPU Lock active
    unsafe fn exit_and_dispatch(task: &'static task::TaskCb<Self>) -> !;

    /// Mask kernel-managed interrupts and, on SMP, acquire the kernel
    /// spinlock (this combined state is called *CPU Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Enter CPU Lock unless it's already active on the current core.
    /// Returns `true` on success.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Deactivate CPU Lock: release the kernel spinlock and restore the
    /// interrupt mask state saved by `enter_cpu_lock`.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Prepare the task for execution: construct an initial context on the
    /// task's stack so that the task starts from its entry point next time
    /// it's dispatched.
    ///
    /// Precondition: CPU Lock active; the task is not running on any core
    unsafe fn initialize_task_state(task: &'static task::TaskCb<Self>);

    /// Return a flag indicating whether CPU Lock is active on the current
    /// core.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context.
    fn is_task_context() -> bool;

    /// Return a flag indicating whether the current context is an interrupt
    /// context.
    fn is_interrupt_context() -> bool;

    /// The saved stack pointer of a task that is not currently running, for
    /// the stack bounds check. `None` if the port doesn't expose it.
    fn saved_stack_pointer(task: &task::TaskCb<Self>) -> Option<usize> {
        let _ = task;
        None
    }

    /// The zero-based index of the core this code is running on.
    fn core_id() -> usize;

    /// Send a reschedule doorbell (an IPI) to the specified core.
    ///
    /// No-op on a single-core configuration.
    unsafe fn notify_core(core: usize);

    /// Launch the secondary core, which must eventually call
    /// [`System::enter_secondary_core`].
    ///
    /// Precondition: scheduler started, called exactly once from core 0
    unsafe fn start_secondary_core();

    /// Halt the system after an unrecoverable error. Never returns.
    fn halt() -> !;
}

/// Implemented by a port. This trait contains items related to the tick
/// source and the high-resolution clock.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub trait PortTimer {
    /// Start the periodic tick interrupt at the specified rate. The port
    /// calls [`PortToKernel::timer_tick`] on every tick thereafter.
    ///
    /// Precondition: CPU Lock active, called once during startup
    unsafe fn start_tick(rate_hz: u32);

    /// Read the monotonic 64-bit microsecond clock.
    unsafe fn hires_us() -> u64;

    /// Block cheaply until an interrupt is likely to have occurred (e.g.
    /// `wfi`). Called by the idle tasks with CPU Lock inactive.
    fn idle_wait() {}
}

/// Represents a particular group of traits that a port should implement.
pub trait Port: PortThreading + PortTimer {}

impl<T: PortThreading + PortTimer> Port for T {}

/// Represents the complete set of traits a fully-configured kernel trait
/// type implements.
pub trait KernelTraits: Port + KernelCfg2 + 'static {}

impl<T: Port + KernelCfg2 + 'static> KernelTraits for T {}

/// Associates a kernel trait type with the kernel's static storage.
/// Implemented by [`build!`].
///
/// # Safety
///
/// This is only intended to be implemented by `build!`.
pub unsafe trait KernelCfg2: Port + Sized {
    /// Backing storage of the sleep queue (a binary heap of task references
    /// ordered by wake deadline). Sized to hold every task.
    type SleepHeap: utils::binary_heap::VecLike<Element = TaskRef<Self>>
        + utils::Init
        + 'static;

    /// Per-core scheduler state.
    type CoreStates: core::borrow::Borrow<[CoreState<Self>]> + utils::Init + 'static;

    /// Backing storage of one core's inter-core message ring.
    type IpcSlots: BorrowMut<[ipc::Slot]> + utils::Init + Copy + 'static;

    /// Backing storage of the error-history ring.
    type ErrorRing: BorrowMut<[ErrorRecord]> + utils::Init + 'static;

    /// Backing storage of the event-trace ring. May be zero-length, which
    /// disables tracing.
    type TraceRing: BorrowMut<[trace::Record]> + utils::Init + 'static;

    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;

    fn task_cb_pool() -> &'static [task::TaskCb<Self>];

    #[inline(always)]
    fn get_task_cb(i: usize) -> Option<&'static task::TaskCb<Self>> {
        Self::task_cb_pool().get(i)
    }

    fn mutex_cb_pool() -> &'static [mutex::MutexCb<Self>];

    #[inline(always)]
    fn get_mutex_cb(i: usize) -> Option<&'static mutex::MutexCb<Self>> {
        Self::mutex_cb_pool().get(i)
    }

    fn semaphore_cb_pool() -> &'static [semaphore::SemaphoreCb<Self>];

    #[inline(always)]
    fn get_semaphore_cb(i: usize) -> Option<&'static semaphore::SemaphoreCb<Self>> {
        Self::semaphore_cb_pool().get(i)
    }

    fn queue_cb_pool() -> &'static [queue::QueueCb<Self>];

    #[inline(always)]
    fn get_queue_cb(i: usize) -> Option<&'static queue::QueueCb<Self>> {
        Self::queue_cb_pool().get(i)
    }

    fn event_group_cb_pool() -> &'static [event_group::EventGroupCb<Self>];

    #[inline(always)]
    fn get_event_group_cb(i: usize) -> Option<&'static event_group::EventGroupCb<Self>> {
        Self::event_group_cb_pool().get(i)
    }

    fn stream_buffer_cb_pool() -> &'static [stream_buffer::StreamBufferCb<Self>];

    #[inline(always)]
    fn get_stream_buffer_cb(i: usize) -> Option<&'static stream_buffer::StreamBufferCb<Self>> {
        Self::stream_buffer_cb_pool().get(i)
    }

    fn timer_cb_pool() -> &'static [timer::TimerCb<Self>];

    #[inline(always)]
    fn get_timer_cb(i: usize) -> Option<&'static timer::TimerCb<Self>> {
        Self::timer_cb_pool().get(i)
    }

    /// The stack region reserved for the specified core's idle task.
    fn idle_stack(core: usize) -> Region;
}

// ---------------------------------------------------------------------------
// Global state

/// Global kernel state. One instance per kernel trait type, instantiated by
/// [`build!`].
pub struct State<Traits: KernelCfg2> {
    /// Per-core scheduler instances.
    pub(crate) cores: Traits::CoreStates,

    /// The tick counters and the sleep queue.
    pub(crate) time: timeout::TimeGlobals<Traits>,

    /// The active software timer list.
    pub(crate) timers: timer::TimerGlobals<Traits>,

    /// The runtime configuration, stored by `System::init` and never mutated
    /// after `System::start`.
    pub(crate) cfg: klock::CpuLockCell<Traits, cfg::Config>,

    /// The kernel lifecycle phase.
    pub(crate) phase: klock::CpuLockCell<Traits, Phase>,

    /// `true` once `System::start` has committed to dispatching.
    pub(crate) started: core::sync::atomic::AtomicBool,

    pub(crate) errors: error::ErrorGlobals<Traits>,

    pub(crate) trace: trace::TraceGlobals<Traits>,

    pub(crate) mem: mem::MemGlobals<Traits>,

    pub(crate) smp: smp::SmpGlobals<Traits>,

    pub(crate) health: health::HealthGlobals<Traits>,
}

impl<Traits: KernelCfg2> utils::Init for State<Traits> {
    const INIT: Self = Self {
        cores: utils::Init::INIT,
        time: utils::Init::INIT,
        timers: utils::Init::INIT,
        cfg: klock::CpuLockCell::new(cfg::Config::DEFAULT),
        phase: klock::CpuLockCell::new(Phase::Uninit),
        started: core::sync::atomic::AtomicBool::new(false),
        errors: utils::Init::INIT,
        trace: utils::Init::INIT,
        mem: utils::Init::INIT,
        smp: utils::Init::INIT,
        health: utils::Init::INIT,
    };
}

impl<Traits: KernelCfg2> State<Traits> {
    /// Get the scheduler state of the specified core.
    #[inline]
    pub(crate) fn core(&self, core: usize) -> &CoreState<Traits> {
        &core::borrow::Borrow::borrow(&self.cores)[core]
    }

    /// Get the scheduler states of all cores.
    #[inline]
    pub(crate) fn cores(&self) -> &[CoreState<Traits>] {
        core::borrow::Borrow::borrow(&self.cores)
    }
}

/// Kernel lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Uninit,
    Inited,
    Started,
}

/// Per-core scheduler state.
pub struct CoreState<Traits: KernelCfg2> {
    /// The currently or recently running task on this core. Also read
    /// directly by the port's context-switch code, hence the atomic pointer
    /// representation.
    pub(crate) running_task: core::sync::atomic::AtomicPtr<task::TaskCb<Traits>>,

    /// The set of Ready tasks eligible for this core.
    pub(crate) ready: readyqueue::ReadyQueue<Traits>,

    /// This core's idle task, created by `System::init`.
    pub(crate) idle_task: klock::CpuLockCell<Traits, Option<TaskRef<Traits>>>,

    /// This core's inter-core message channel (this core is the consumer).
    pub(crate) ipc: ipc::Channel<Traits>,

    /// Sliding-window CPU load tracking.
    pub(crate) load: klock::CpuLockCell<Traits, smp::LoadWindow>,

    /// The number of context switches performed on this core.
    pub(crate) switches: klock::CpuLockCell<Traits, u32>,
}

impl<Traits: KernelCfg2> utils::Init for CoreState<Traits> {
    const INIT: Self = Self {
        running_task: utils::Init::INIT,
        ready: utils::Init::INIT,
        idle_task: utils::Init::INIT,
        ipc: utils::Init::INIT,
        load: utils::Init::INIT,
        switches: utils::Init::INIT,
    };
}

impl<Traits: KernelCfg2> CoreState<Traits> {
    /// The location of the running-task pointer, for the port's
    /// context-switch code.
    #[inline]
    pub fn running_task_ptr(&self) -> *mut *mut task::TaskCb<Traits> {
        self.running_task.as_ptr()
    }

    /// Get the currently running task. The returned reference is only
    /// meaningful while CPU Lock is held.
    #[inline]
    pub(crate) fn running_task(&self) -> Option<TaskRef<Traits>> {
        let ptr = self
            .running_task
            .load(core::sync::atomic::Ordering::Relaxed);
        // Safety: the pointer is either null or points into the static task
        // pool
        unsafe { ptr.as_ref() }
    }

    #[inline]
    pub(crate) fn set_running_task(&self, task: Option<TaskRef<Traits>>) {
        let ptr = match task {
            Some(t) => t as *const task::TaskCb<Traits> as *mut _,
            None => core::ptr::null_mut(),
        };
        self.running_task
            .store(ptr, core::sync::atomic::Ordering::Relaxed);
    }
}

/// The address of the running-task slot of the specified core. Exposed for
/// port context-switch code.
pub fn running_task_slot<Traits: KernelTraits>(core: usize) -> *mut *mut task::TaskCb<Traits> {
    Traits::state().core(core).running_task_ptr()
}

// ---------------------------------------------------------------------------

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
#[allow(clippy::missing_safety_doc)]
pub trait PortToKernel {
    /// Determine the next task to run on the current core and store it in
    /// the core's running-task slot.
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active
    unsafe fn choose_running_task();

    /// Called by the port timer driver to announce a new tick.
    ///
    /// Precondition: CPU Lock inactive, interrupt context, core 0
    unsafe fn timer_tick();

    /// Called by the port's IPI handler on the core that received the
    /// doorbell.
    ///
    /// Precondition: CPU Lock inactive, interrupt context
    unsafe fn ipi_notified();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn choose_running_task() {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        task::choose_next_running_task(lock.borrow_mut(), Traits::core_id());

        // Postcondition: CPU Lock active
        core::mem::forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }

    unsafe fn ipi_notified() {
        ipc::handle_ipi::<Traits>();
    }
}

// ---------------------------------------------------------------------------

/// The interface to a kernel instance configured by the kernel trait type
/// `Traits`.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits: KernelTraits> System<Traits> {
    /// Initialize the kernel: validate and store the configuration and
    /// create the per-core idle tasks. Must be called exactly once before
    /// any other kernel call.
    pub fn init(config: &cfg::Config) -> Result<(), error::InitError> {
        cfg::init::<Traits>(config)
    }

    /// Start the scheduler. Transfers control to the highest-priority Ready
    /// task and never returns.
    ///
    /// On a two-core configuration this also launches core 1.
    pub fn start() -> ! {
        cfg::start::<Traits>()
    }

    /// The entry point for the secondary core, called by the port once the
    /// core is up.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port, on core 1, after [`Self::start`]
    /// was called on core 0.
    pub unsafe fn enter_secondary_core() -> ! {
        cfg::enter_secondary_core::<Traits>()
    }

    /// Activate CPU Lock: mask interrupts and, on SMP, take the kernel
    /// spinlock. Nestable through the port's depth counter.
    pub fn acquire_cpu_lock() -> Result<(), error::CpuLockError> {
        if Traits::is_cpu_lock_active() {
            return Err(error::CpuLockError::BadContext);
        }
        // Safety: CPU Lock inactive
        unsafe { Traits::enter_cpu_lock() };
        Ok(())
    }

    /// Deactivate CPU Lock.
    ///
    /// # Safety
    ///
    /// The caller must own an active CPU Lock acquired by
    /// [`Self::acquire_cpu_lock`].
    pub unsafe fn release_cpu_lock() -> Result<(), error::CpuLockError> {
        if !Traits::is_cpu_lock_active() {
            return Err(error::CpuLockError::BadContext);
        }
        // Safety: CPU Lock active, owned by the caller
        unsafe { Traits::leave_cpu_lock() };
        Ok(())
    }

    /// The current value of the kernel tick counter. Wraps around at
    /// `u32::MAX` ticks.
    pub fn tick_count() -> Ticks {
        timeout::tick_count::<Traits>()
    }

    /// Milliseconds elapsed since the scheduler started. Derived from the
    /// 64-bit tick counter, so it doesn't wrap within device uptime.
    pub fn uptime_ms() -> u64 {
        timeout::uptime_ms::<Traits>()
    }

    /// The monotonic 64-bit microsecond clock.
    pub fn time_us() -> u64 {
        // Safety: `hires_us` has no precondition beyond being called after
        // the port initialized its clock
        unsafe { Traits::hires_us() }
    }

    /// The most recently recorded kernel error, if any.
    pub fn last_error() -> Option<ErrorRecord> {
        error::last_error::<Traits>()
    }

    /// Per-category error counters.
    pub fn error_stats() -> error::ErrorStats {
        error::stats::<Traits>()
    }

    /// Global memory accounting statistics.
    pub fn memory_stats() -> mem::MemoryStats {
        mem::stats::<Traits>()
    }

    /// The load of the specified core as a percentage over the sliding
    /// sampling window.
    pub fn core_load(core: usize) -> Result<u8, error::BadParamError> {
        smp::core_load::<Traits>(core)
    }

    /// Load balancer statistics (migration count, last migration time).
    pub fn balancer_stats() -> smp::BalancerStats {
        smp::balancer_stats::<Traits>()
    }
}
