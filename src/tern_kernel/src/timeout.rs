//! Time management: the tick counters, wake deadlines, and per-tick
//! processing.
//!
//! # Ticks and deadlines
//!
//! The kernel clock is a 32-bit tick counter advancing at the configured
//! tick rate. It wraps around roughly every 49 days at the default 1 kHz; a
//! 64-bit shadow counter backs the uptime queries so applications don't have
//! to care.
//!
//! Wake deadlines are absolute tick values compared with wrap-around
//! arithmetic. Relative timeouts are capped at [`MAX_TIMEOUT`] (half the
//! counter range minus headroom) so the chronological order of any two
//! outstanding deadlines is unambiguous relative to the *anchor* - the tick
//! at which the sleep queue was last drained. Every outstanding deadline
//! lies in `anchor ..= anchor + MAX_TIMEOUT + 1`, which keeps the heap's
//! ordering stable as time advances.
//!
//! [`MAX_TIMEOUT`]: crate::MAX_TIMEOUT
use core::fmt;

use crate::{
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    smp, task, timer,
    utils::{
        binary_heap::{BinaryHeap, BinaryHeapCtx},
        Init,
    },
    KernelCfg2, KernelTraits, TaskRef, Ticks, MAX_TIMEOUT,
};

// ---------------------------------------------------------------------------
// A singleton token permitting access to `TaskCb::{wake_at, heap_pos}`.
//
// The sleep queue's heap operations need to update the position
// back-references stored in task control blocks *while* the heap itself is
// mutably borrowed out of its `CpuLockCell`. The CPU Lock token is consumed
// by that outer borrow, so the back-references are guarded by this second
// token, which lives right next to the heap inside the same cell.

pub(crate) struct SleepPropTag;

type SleepPropToken = tokenlock::UnsyncSingletonToken<SleepPropTag>;
type SleepPropKeyhole = tokenlock::SingletonTokenId<SleepPropTag>;

/// Cell type guarded by the token stored in [`SleepQueue::prop_token`].
pub(crate) type SleepPropCell<T> = tokenlock::UnsyncTokenLock<T, SleepPropKeyhole>;

// ---------------------------------------------------------------------------

/// Kernel-global time state.
pub(crate) struct TimeGlobals<Traits: KernelCfg2> {
    /// The 32-bit tick counter. Wraps around.
    tick: CpuLockCell<Traits, Ticks>,

    /// The 64-bit shadow tick counter. Doesn't wrap within device uptime.
    tick64: CpuLockCell<Traits, u64>,

    /// Tasks with a registered wake deadline, and the token for their
    /// heap back-references.
    sleep: CpuLockCell<Traits, SleepQueue<Traits>>,
}

impl<Traits: KernelCfg2> Init for TimeGlobals<Traits> {
    const INIT: Self = Self {
        tick: Init::INIT,
        tick64: Init::INIT,
        sleep: CpuLockCell::new(SleepQueue {
            heap: Init::INIT,
            anchor: 0,
            // Safety: for each particular `Traits` this is the only instance
            // of `SleepPropToken`. Multiple `Traits` types in one program
            // technically break the singleton property, but each kernel
            // instance only ever uses its own token to unlock its own cells.
            prop_token: unsafe { SleepPropToken::new_unchecked() },
        }),
    };
}

impl<Traits: KernelCfg2> fmt::Debug for TimeGlobals<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeGlobals")
            .field("tick", &self.tick)
            .field("tick64", &self.tick64)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelCfg2> TimeGlobals<Traits> {
    /// The current tick count.
    #[inline]
    pub(crate) fn tick_count(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Ticks {
        self.tick.get(&*lock)
    }
}

struct SleepQueue<Traits: KernelCfg2> {
    /// Binary min-heap of waiting tasks keyed by wake deadline.
    heap: Traits::SleepHeap,

    /// The tick at which the queue was last drained. All outstanding
    /// deadlines are at or after this point.
    anchor: Ticks,

    prop_token: SleepPropToken,
}

/// Heap-ordering context: compares wake deadlines relative to the anchor
/// and maintains the `heap_pos` back-references.
struct SleepCtx<'a> {
    anchor: Ticks,
    prop_token: &'a mut SleepPropToken,
}

impl<'a, Traits: KernelTraits> BinaryHeapCtx<TaskRef<Traits>> for SleepCtx<'a> {
    fn lt(&mut self, x: &TaskRef<Traits>, y: &TaskRef<Traits>) -> bool {
        let key = |t: &TaskRef<Traits>| {
            t.wake_at
                .get(&*self.prop_token)
                // `None` can't occur for a task inside the heap
                .unwrap_or(0)
                .wrapping_sub(self.anchor)
        };
        key(x) < key(y)
    }

    fn on_move(&mut self, e: TaskRef<Traits>, new_index: usize) {
        e.heap_pos.replace(&mut *self.prop_token, new_index);
    }
}

/// Has `deadline` been reached at tick `now`?
#[inline]
pub(crate) fn deadline_reached(deadline: Ticks, now: Ticks) -> bool {
    now.wrapping_sub(deadline) < 0x8000_0000
}

/// The deadline of a periodic event with the given period, advanced past
/// `now`. If multiple periods elapsed (the event is handled late), the
/// intermediate occurrences are coalesced into one.
pub(crate) fn next_period_after(deadline: Ticks, period: Ticks, now: Ticks) -> Ticks {
    let next = deadline.wrapping_add(period);
    if !deadline_reached(next, now) {
        return next;
    }
    // Skip to the first future multiple to avoid a dispatch storm
    let behind = now.wrapping_sub(deadline);
    let missed = behind / period + 1;
    deadline.wrapping_add(missed.wrapping_mul(period))
}

// ---------------------------------------------------------------------------

/// Register a wake deadline `duration` ticks from now for `task`, which is
/// about to enter the Waiting state.
pub(super) fn register_wake<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
    duration: Ticks,
) {
    let state = Traits::state();
    let now = state.time.tick.get(&*lock);
    let deadline = now.wrapping_add(duration.min(MAX_TIMEOUT));

    let sleep = state.time.sleep.write(&mut *lock);
    debug_assert!(task.wake_at.get(&sleep.prop_token).is_none());
    task.wake_at.replace(&mut sleep.prop_token, Some(deadline));
    sleep.heap.heap_push(
        task,
        SleepCtx {
            anchor: sleep.anchor,
            prop_token: &mut sleep.prop_token,
        },
    );
}

/// Unregister `task`'s wake deadline, if one is outstanding.
pub(super) fn cancel_wake<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    let sleep = Traits::state().time.sleep.write(&mut *lock);
    if task.wake_at.replace(&mut sleep.prop_token, None).is_some() {
        let pos = task.heap_pos.get(&sleep.prop_token);
        let removed = sleep.heap.heap_remove(
            pos,
            SleepCtx {
                anchor: sleep.anchor,
                prop_token: &mut sleep.prop_token,
            },
        );
        debug_assert!(removed.is_some());
    }
}

/// Move every task whose wake deadline has been reached back to Ready with
/// a `Timeout` result.
fn wake_expired<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>, now: Ticks) {
    loop {
        let expired = {
            let sleep = Traits::state().time.sleep.write(&mut *lock);
            let top = match sleep.heap.heap_peek() {
                Some(&top) => top,
                None => break,
            };
            let deadline = top.wake_at.get(&sleep.prop_token).unwrap_or(0);
            if !deadline_reached(deadline, now) {
                break;
            }
            let top = sleep.heap.heap_pop(SleepCtx {
                anchor: sleep.anchor,
                prop_token: &mut sleep.prop_token,
            });
            let top = top.unwrap();
            top.wake_at.replace(&mut sleep.prop_token, None);
            top
        };

        crate::wait::interrupt_task(
            lock.borrow_mut(),
            expired,
            Err(crate::error::TimeoutError::Timeout),
        );
    }

    // Every remaining deadline is in the future, so the anchor can advance
    // without perturbing the heap order
    Traits::state().time.sleep.write(&mut *lock).anchor = now;
}

/// The tick handler. Called by the port's tick interrupt on core 0 with CPU
/// Lock inactive.
pub(super) fn handle_tick<Traits: KernelTraits>() {
    let mut lock = match klock::lock_cpu::<Traits>() {
        Ok(lock) => lock,
        // A tick that fires while the startup code still holds CPU Lock is
        // dropped; the counters haven't started to matter yet
        Err(_) => return,
    };

    let state = Traits::state();
    if !state
        .started
        .load(core::sync::atomic::Ordering::Relaxed)
    {
        return;
    }

    // Advance the clock
    let now = state.time.tick.get(&*lock).wrapping_add(1);
    state.time.tick.replace(&mut *lock, now);
    state
        .time
        .tick64
        .replace_with(&mut *lock, |t| t.wrapping_add(1));

    crate::trace::record::<Traits>(lock.borrow_mut(), crate::trace::Event::Tick, now, 0);

    // Sample per-core load and charge CPU time to the running tasks
    smp::sample_tick(lock.borrow_mut());

    // Dispatch expired software timers. Their callbacks run with CPU Lock
    // released, so this hands the guard back and forth.
    lock = timer::process_tick(lock, now);

    // Wake tasks whose sleep deadline has been reached
    wake_expired(lock.borrow_mut(), now);

    // Round-robin rotation among equal-priority tasks (time slice: 1 tick)
    task::round_robin_tick(lock.borrow_mut());

    // Periodic load balancing
    smp::balance_if_due(lock.borrow_mut(), now);

    // The application's tick hook runs with CPU Lock released
    let hook = state.cfg.read(&*lock).tick_hook;
    if let Some(hook) = hook {
        lock = klock::release_and_call(lock, || hook(now));
    }

    task::unlock_cpu_and_check_preemption(lock);
}

/// Implements `System::tick_count`.
pub(crate) fn tick_count<Traits: KernelTraits>() -> Ticks {
    match klock::lock_cpu::<Traits>() {
        Ok(lock) => Traits::state().time.tick.get(&*lock),
        Err(_) => 0,
    }
}

/// Implements `System::uptime_ms`.
pub(crate) fn uptime_ms<Traits: KernelTraits>() -> u64 {
    match klock::lock_cpu::<Traits>() {
        Ok(lock) => {
            let ticks = Traits::state().time.tick64.get(&*lock);
            let rate = Traits::state().cfg.read(&*lock).tick_rate_hz as u64;
            ticks * 1000 / rate
        }
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_comparison_handles_wrap_around() {
        assert!(deadline_reached(100, 100));
        assert!(deadline_reached(100, 101));
        assert!(!deadline_reached(101, 100));
        // Near the wrap-around point
        assert!(deadline_reached(u32::MAX, 0));
        assert!(!deadline_reached(0, u32::MAX));
        assert!(deadline_reached(u32::MAX - 10, 5));
    }

    #[test]
    fn periodic_rearm_is_drift_free() {
        // On-time dispatch: the next deadline is exactly one period later
        assert_eq!(next_period_after(1000, 10, 1000), 1010);
        // Slightly late dispatch does not shift the phase
        assert_eq!(next_period_after(1000, 10, 1004), 1010);
    }

    #[test]
    fn late_periodic_skips_to_future_multiple() {
        // Three periods missed: fire once, then resume at the next future
        // multiple of the period
        let next = next_period_after(1000, 10, 1035);
        assert_eq!(next, 1040);
        // Exactly on a multiple boundary
        let next = next_period_after(1000, 10, 1020);
        assert_eq!(next, 1030);
    }

    #[test]
    fn periodic_rearm_wraps() {
        let deadline = u32::MAX - 3;
        let next = next_period_after(deadline, 10, u32::MAX - 3);
        assert_eq!(next, 6);
    }
}
