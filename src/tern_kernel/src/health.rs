//! Health monitoring: periodic sampling of stack, CPU, and heap usage,
//! threshold alerts, and the watchdog feed contract.
//!
//! The monitor rides on a kernel-owned software timer created during
//! `System::init`. Each pass samples the observables, raises an alert for
//! every threshold crossed, and - only when everything passed - invokes the
//! configured watchdog feed callback. A starved watchdog therefore resets
//! the system both when the kernel stops ticking and when a health check
//! keeps failing.
use crate::{
    error::ErrorCode,
    klock::{self, CpuLockCell},
    mem, task, timer, trace,
    utils::Init,
    Id, KernelTraits, TaskRef,
};

pub(crate) struct HealthGlobals<Traits> {
    /// The kernel-owned monitor timer, if health checks are enabled.
    pub(crate) timer: CpuLockCell<Traits, Option<Id>>,
}

impl<Traits> Init for HealthGlobals<Traits> {
    const INIT: Self = Self { timer: Init::INIT };
}

/// Create and arm the monitor timer. Called by `System::init` (outside the
/// init critical section) when `health_check_period` is non-zero.
pub(crate) fn start_monitor<Traits: KernelTraits>() -> Result<(), crate::error::InitError> {
    let period = {
        let lock = klock::lock_cpu::<Traits>().map_err(|_| crate::error::InitError::BadContext)?;
        Traits::state().cfg.read(&*lock).health_check_period
    };
    if period == 0 {
        return Ok(());
    }

    let monitor = timer::Timer::<Traits>::create(&timer::TimerOptions {
        period,
        periodic: true,
        callback: health_tick::<Traits>,
        param: 0,
    })
    .map_err(|_| crate::error::InitError::BadConfig)?;
    monitor.start().map_err(|_| crate::error::InitError::BadConfig)?;

    let mut lock = klock::lock_cpu::<Traits>().map_err(|_| crate::error::InitError::BadContext)?;
    Traits::state()
        .health
        .timer
        .replace(&mut *lock, Some(monitor.id()));
    Ok(())
}

/// One monitor pass. Runs as a timer callback: tick-handler context, CPU
/// Lock released.
fn health_tick<Traits: KernelTraits>(_param: usize) {
    let mut healthy = true;

    let (alert_hook, watchdog_feed) = {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            return;
        };
        let cfg = *Traits::state().cfg.read(&*lock);

        // Stack high-water marks of every occupied slot
        for cb in Traits::task_cb_pool() {
            if *cb.st.read(&*lock) == task::TaskSt::Vacant {
                continue;
            }
            if let Some(pct) = stack_usage_pct::<Traits>(cb) {
                if pct >= cfg.stack_alert_pct {
                    healthy = false;
                    raise_alert::<Traits>(
                        lock.borrow_mut(),
                        ErrorCode::StackWatermarkAlert,
                        pct as u32,
                    );
                }
            }
        }

        // Per-core load
        for core in 0..Traits::NUM_CORES {
            let pct = Traits::state().core(core).load.read(&*lock).percent();
            if pct >= cfg.load_alert_pct {
                healthy = false;
                raise_alert::<Traits>(lock.borrow_mut(), ErrorCode::CpuLoadAlert, pct as u32);
            }
        }

        // Heap usage, when the application declared its heap capacity
        let stats = Traits::state().mem.stats.get(&*lock);
        let heap_pct = mem::heap_usage_pct(&stats, cfg.heap_capacity);
        if cfg.heap_capacity != 0 && heap_pct >= cfg.heap_alert_pct {
            healthy = false;
            raise_alert::<Traits>(lock.borrow_mut(), ErrorCode::HeapUsageAlert, heap_pct as u32);
        }

        (cfg.alert_hook, cfg.watchdog_feed)
    };

    if !healthy {
        if let (Some(hook), Some(record)) = (alert_hook, crate::error::last_error::<Traits>()) {
            hook(&record);
        }
        return;
    }

    // All checks passed: keep the hardware watchdog fed
    if let Some(feed) = watchdog_feed {
        feed();
    }
}

fn raise_alert<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    code: ErrorCode,
    value: u32,
) {
    crate::error::record::<Traits>(lock.borrow_mut(), code, value);
    trace::record::<Traits>(lock.borrow_mut(), trace::Event::Alert, code as u32, value);
}

/// The task's stack high-water mark as a percentage of its stack size.
fn stack_usage_pct<Traits: KernelTraits>(cb: TaskRef<Traits>) -> Option<u8> {
    // Safety: CPU Lock is held by the caller
    let stack = unsafe { cb.attr() }.stack;
    if stack.is_null() || stack.len() == 0 {
        return None;
    }
    Some((task::stack_high_water(&stack) * 100 / stack.len()) as u8)
}
