//! Runtime configuration and the static configuration macro.
use crate::{
    error::{ErrorCode, ErrorRecord, InitError},
    health, klock, smp, task, Id, KernelTraits, Phase, Ticks,
};

/// Runtime kernel configuration, passed to [`System::init`] and never
/// mutated after [`System::start`].
///
/// [`System::init`]: crate::System::init
/// [`System::start`]: crate::System::start
#[derive(Clone, Copy)]
pub struct Config {
    /// Tick interrupt rate in Hz. Supported range: 100 to 10 000.
    pub tick_rate_hz: u32,

    /// Called by the idle tasks between reaper passes. Must not block.
    pub idle_hook: Option<fn()>,

    /// Called on every tick with the new tick count. Runs in tick-handler
    /// context with CPU Lock released; must not block.
    pub tick_hook: Option<fn(Ticks)>,

    /// Called when the kernel hits an unrecoverable error, right before it
    /// halts.
    pub error_hook: Option<fn(&ErrorRecord)>,

    /// Called when the health monitor crosses a threshold.
    pub alert_hook: Option<fn(&ErrorRecord)>,

    /// Called when a stack overflow is detected, with the offending task's
    /// id, right before the kernel halts.
    pub stack_overflow_hook: Option<fn(Id)>,

    /// Called by the health monitor when all checks pass; wire this to the
    /// board's watchdog-feed routine. The kernel never feeds the watchdog
    /// through any other path.
    pub watchdog_feed: Option<fn()>,

    /// Initial-placement strategy for `Any`-affinity tasks.
    pub assignment_strategy: smp::AssignmentStrategy,

    /// Minimum per-core load difference (in percent) before the balancer
    /// migrates a task. `0` disables load balancing.
    pub load_balance_threshold: u8,

    /// Balancer pass period in ticks.
    pub load_balance_period: Ticks,

    /// Health monitor period in ticks. `0` disables the monitor (and the
    /// watchdog feed).
    pub health_check_period: Ticks,

    /// Stack high-water alert threshold in percent of the stack size.
    pub stack_alert_pct: u8,

    /// Per-core load alert threshold in percent.
    pub load_alert_pct: u8,

    /// Heap usage alert threshold in percent of `heap_capacity`.
    pub heap_alert_pct: u8,

    /// Capacity of the application's tracked heap in bytes; `0` if no heap
    /// is tracked.
    pub heap_capacity: usize,
}

impl Config {
    pub const DEFAULT: Self = Self {
        tick_rate_hz: 1000,
        idle_hook: None,
        tick_hook: None,
        error_hook: None,
        alert_hook: None,
        stack_overflow_hook: None,
        watchdog_feed: None,
        assignment_strategy: smp::AssignmentStrategy::RoundRobin,
        load_balance_threshold: 25,
        load_balance_period: 100,
        health_check_period: 0,
        stack_alert_pct: 90,
        load_alert_pct: 95,
        heap_alert_pct: 90,
        heap_capacity: 0,
    };
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Implements `System::init`.
pub(crate) fn init<Traits: KernelTraits>(config: &Config) -> Result<(), InitError> {
    if !(100..=10_000).contains(&config.tick_rate_hz) {
        return Err(InitError::BadTickRate);
    }
    if config.stack_alert_pct > 100
        || config.load_alert_pct > 100
        || config.heap_alert_pct > 100
        || config.load_balance_period == 0
        || config.health_check_period > crate::MAX_TIMEOUT
    {
        return Err(InitError::BadConfig);
    }

    {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let state = Traits::state();

        if state.phase.get(&*lock) != Phase::Uninit {
            return Err(InitError::AlreadyInited);
        }

        state.cfg.replace(&mut *lock, *config);

        // One idle task per core, at the reserved priority level 0
        for core in 0..Traits::NUM_CORES {
            task::create_idle_task(lock.borrow_mut(), core)
                .map_err(|_| InitError::BadConfig)?;
        }

        state.phase.replace(&mut *lock, Phase::Inited);
    }

    // The health monitor allocates its timer through the public surface, so
    // this happens outside the init critical section
    health::start_monitor::<Traits>()?;

    log::info!(
        "kernel initialized: {} priority levels, {} core(s), tick {} Hz",
        Traits::NUM_TASK_PRIORITY_LEVELS,
        Traits::NUM_CORES,
        config.tick_rate_hz,
    );

    Ok(())
}

/// Implements `System::start`.
pub(crate) fn start<Traits: KernelTraits>() -> ! {
    let mut lock = match klock::lock_cpu::<Traits>() {
        Ok(lock) => lock,
        Err(_) => {
            // `start` cannot report an error to anyone; misuse is fatal
            unreachable_start_failure::<Traits>();
        }
    };

    let state = Traits::state();
    if state.phase.get(&*lock) != Phase::Inited {
        let code = if state.phase.get(&*lock) == Phase::Started {
            ErrorCode::AlreadyInited
        } else {
            ErrorCode::NotReady
        };
        crate::error::fatal::<Traits>(lock, code, 0);
    }

    state.phase.replace(&mut *lock, Phase::Started);
    state
        .started
        .store(true, core::sync::atomic::Ordering::Release);

    let tick_rate_hz = state.cfg.read(&*lock).tick_rate_hz;

    // Safety: CPU Lock active, called once during startup
    unsafe { Traits::start_tick(tick_rate_hz) };

    if Traits::NUM_CORES > 1 {
        // Safety: scheduler started, called exactly once from core 0
        unsafe { Traits::start_secondary_core() };
    }

    task::choose_next_running_task(lock.borrow_mut(), Traits::core_id());

    core::mem::forget(lock);

    // Safety: CPU Lock active, a running task has been elected. The
    // dispatcher releases CPU Lock as part of dispatching.
    unsafe { Traits::dispatch_first_task() }
}

#[cold]
fn unreachable_start_failure<Traits: KernelTraits>() -> ! {
    log::error!("System::start called with CPU Lock already active");
    Traits::halt()
}

/// Implements `System::enter_secondary_core`.
pub(crate) fn enter_secondary_core<Traits: KernelTraits>() -> ! {
    // Spins until core 0 finishes its startup critical section
    let mut lock = loop {
        if let Ok(lock) = klock::lock_cpu::<Traits>() {
            break lock;
        }
    };

    debug_assert!(Traits::state()
        .started
        .load(core::sync::atomic::Ordering::Acquire));

    task::choose_next_running_task(lock.borrow_mut(), Traits::core_id());

    core::mem::forget(lock);

    // Safety: CPU Lock active, a running task has been elected
    unsafe { Traits::dispatch_first_task() }
}

/// Instantiate the kernel's static storage for a kernel trait type and
/// implement [`KernelCfg1`] and [`KernelCfg2`] on it.
///
/// ```ignore
/// tern_kernel::build! {
///     pub struct SystemTraits;
///
///     priority_levels: 16,
///     num_cores: 2,
///     max_tasks: 8,
///     max_mutexes: 4,
///     max_semaphores: 4,
///     max_queues: 4,
///     max_event_groups: 4,
///     max_stream_buffers: 2,
///     max_timers: 4,
///     ipc_ring_depth: 8,
///     error_history_len: 8,
///     trace_buffer_len: 0,
///     idle_stack_size: 1024,
/// }
/// ```
///
/// The port crate's `use_port!` macro must also be applied to the same type.
///
/// [`KernelCfg1`]: crate::KernelCfg1
/// [`KernelCfg2`]: crate::KernelCfg2
#[macro_export]
macro_rules! build {
    (
        $( #[$meta:meta] )*
        $vis:vis struct $Traits:ident;

        priority_levels: $levels:expr,
        num_cores: $cores:expr,
        max_tasks: $tasks:expr,
        max_mutexes: $mutexes:expr,
        max_semaphores: $semaphores:expr,
        max_queues: $queues:expr,
        max_event_groups: $event_groups:expr,
        max_stream_buffers: $stream_buffers:expr,
        max_timers: $timers:expr,
        ipc_ring_depth: $ipc_depth:expr,
        error_history_len: $error_len:expr,
        trace_buffer_len: $trace_len:expr,
        idle_stack_size: $idle_stack:expr $(,)?
    ) => {
        $( #[$meta] )*
        $vis struct $Traits;

        // Safety: this macro is the intended implementor
        unsafe impl $crate::KernelCfg1 for $Traits {
            const NUM_TASK_PRIORITY_LEVELS: usize = $levels;
            const NUM_CORES: usize = $cores;
        }

        const _: () = {
            use $crate::utils::{AlignedStorage, Init, RawCell};

            // The bucket bitmap is one word wide; the per-core count is
            // baked into several data structures
            assert!($levels >= 2 && $levels <= $crate::utils::PRIO_LEVEL_CAP);
            assert!($cores == 1 || $cores == 2);
            assert!($tasks >= $cores, "need a slot for each idle task");

            static KERNEL_STATE: $crate::State<$Traits> = Init::INIT;

            const TASK_CB: $crate::task::TaskCb<$Traits> = Init::INIT;
            static TASK_CB_POOL: [$crate::task::TaskCb<$Traits>; $tasks] = [TASK_CB; $tasks];

            const MUTEX_CB: $crate::mutex::MutexCb<$Traits> = Init::INIT;
            static MUTEX_CB_POOL: [$crate::mutex::MutexCb<$Traits>; $mutexes] =
                [MUTEX_CB; $mutexes];

            const SEMAPHORE_CB: $crate::semaphore::SemaphoreCb<$Traits> = Init::INIT;
            static SEMAPHORE_CB_POOL: [$crate::semaphore::SemaphoreCb<$Traits>; $semaphores] =
                [SEMAPHORE_CB; $semaphores];

            const QUEUE_CB: $crate::queue::QueueCb<$Traits> = Init::INIT;
            static QUEUE_CB_POOL: [$crate::queue::QueueCb<$Traits>; $queues] =
                [QUEUE_CB; $queues];

            const EVENT_GROUP_CB: $crate::event_group::EventGroupCb<$Traits> = Init::INIT;
            static EVENT_GROUP_CB_POOL:
                [$crate::event_group::EventGroupCb<$Traits>; $event_groups] =
                [EVENT_GROUP_CB; $event_groups];

            const STREAM_BUFFER_CB: $crate::stream_buffer::StreamBufferCb<$Traits> = Init::INIT;
            static STREAM_BUFFER_CB_POOL:
                [$crate::stream_buffer::StreamBufferCb<$Traits>; $stream_buffers] =
                [STREAM_BUFFER_CB; $stream_buffers];

            const TIMER_CB: $crate::timer::TimerCb<$Traits> = Init::INIT;
            static TIMER_CB_POOL: [$crate::timer::TimerCb<$Traits>; $timers] =
                [TIMER_CB; $timers];

            const IDLE_STACK: RawCell<AlignedStorage<$idle_stack, 8>> = RawCell::new(Init::INIT);
            static IDLE_STACKS: [RawCell<AlignedStorage<$idle_stack, 8>>; $cores] =
                [IDLE_STACK; $cores];

            // Safety: this macro is the intended implementor
            unsafe impl $crate::KernelCfg2 for $Traits {
                type SleepHeap = $crate::arrayvec::ArrayVec<$crate::TaskRef<$Traits>, $tasks>;
                type CoreStates = [$crate::CoreState<$Traits>; $cores];
                type IpcSlots = [$crate::ipc::Slot; $ipc_depth];
                type ErrorRing = [$crate::ErrorRecord; $error_len];
                type TraceRing = [$crate::trace::Record; $trace_len];

                #[inline(always)]
                fn state() -> &'static $crate::State<$Traits> {
                    &KERNEL_STATE
                }

                #[inline(always)]
                fn task_cb_pool() -> &'static [$crate::task::TaskCb<$Traits>] {
                    &TASK_CB_POOL
                }

                #[inline(always)]
                fn mutex_cb_pool() -> &'static [$crate::mutex::MutexCb<$Traits>] {
                    &MUTEX_CB_POOL
                }

                #[inline(always)]
                fn semaphore_cb_pool() -> &'static [$crate::semaphore::SemaphoreCb<$Traits>] {
                    &SEMAPHORE_CB_POOL
                }

                #[inline(always)]
                fn queue_cb_pool() -> &'static [$crate::queue::QueueCb<$Traits>] {
                    &QUEUE_CB_POOL
                }

                #[inline(always)]
                fn event_group_cb_pool() -> &'static [$crate::event_group::EventGroupCb<$Traits>]
                {
                    &EVENT_GROUP_CB_POOL
                }

                #[inline(always)]
                fn stream_buffer_cb_pool(
                ) -> &'static [$crate::stream_buffer::StreamBufferCb<$Traits>] {
                    &STREAM_BUFFER_CB_POOL
                }

                #[inline(always)]
                fn timer_cb_pool() -> &'static [$crate::timer::TimerCb<$Traits>] {
                    &TIMER_CB_POOL
                }

                fn idle_stack(core: usize) -> $crate::Region {
                    // Safety: the storage is static, exclusively reserved
                    // for this core's idle task
                    unsafe {
                        $crate::Region::from_raw_parts(
                            IDLE_STACKS[core].get() as *mut u8,
                            $idle_stack,
                        )
                    }
                }
            }
        };
    };
}
