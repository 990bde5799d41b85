//! Software timers: one-shot and periodic callbacks driven by the tick.
//!
//! Active timers sit in a deadline-sorted singly-linked list; the tick
//! handler dispatches the expired prefix. Callbacks run in tick-handler
//! context with CPU Lock *released*, so they may call the interrupt-safe
//! kernel operations (`give_isr`, `set_isr`, `send_isr`) but must not
//! block.
use core::{fmt, marker::PhantomData};

use crate::{
    error::{BadIdError, CreateSyncError, TimerError},
    klock, timeout, trace,
    utils::Init,
    Id, KernelTraits, PortThreading, Ticks,
};

/// The type of a timer callback function.
pub type TimerCallback = fn(usize);

/// Timer state machine: `Stopped → Running → (Expired | Stopped)`.
/// Periodic timers re-enter `Running` after each fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSt {
    Stopped,
    Running,
    /// A one-shot timer that has fired and was not restarted.
    Expired,
}

impl Init for TimerSt {
    const INIT: Self = Self::Stopped;
}

/// *Timer control block* - the state data of a software timer.
#[doc(hidden)]
pub struct TimerCb<Traits: PortThreading> {
    pub(super) live: klock::CpuLockCell<Traits, bool>,

    pub(super) st: klock::CpuLockCell<Traits, TimerSt>,

    pub(super) callback: klock::CpuLockCell<Traits, TimerCallback>,
    pub(super) param: klock::CpuLockCell<Traits, usize>,

    pub(super) period: klock::CpuLockCell<Traits, Ticks>,
    pub(super) periodic: klock::CpuLockCell<Traits, bool>,

    /// Absolute next-fire deadline. Meaningful while Running.
    pub(super) deadline: klock::CpuLockCell<Traits, Ticks>,

    /// The next timer in the active list (sorted by deadline).
    pub(super) next: klock::CpuLockCell<Traits, Option<&'static TimerCb<Traits>>>,

    /// Lifetime number of dispatches.
    pub(super) fires: klock::CpuLockCell<Traits, u32>,
}

fn callback_nop(_: usize) {}

impl<Traits: PortThreading> Init for TimerCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        live: Init::INIT,
        st: Init::INIT,
        callback: klock::CpuLockCell::new(callback_nop),
        param: Init::INIT,
        period: Init::INIT,
        periodic: Init::INIT,
        deadline: Init::INIT,
        next: Init::INIT,
        fires: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("st", &self.st)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

/// The kernel-global timer list.
pub(crate) struct TimerGlobals<Traits: PortThreading> {
    /// The soonest-expiring active timer.
    head: klock::CpuLockCell<Traits, Option<&'static TimerCb<Traits>>>,
}

impl<Traits: PortThreading> Init for TimerGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { head: Init::INIT };
}

/// Options for [`Timer::create`].
#[derive(Clone, Copy)]
pub struct TimerOptions {
    /// Delay (one-shot) or period (periodic) in ticks. Must be non-zero.
    pub period: Ticks,
    /// Re-arm automatically after each fire.
    pub periodic: bool,
    pub callback: TimerCallback,
    pub param: usize,
}

/// An owned handle to a software timer.
pub struct Timer<Traits> {
    id: Id,
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for Timer<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits> Copy for Timer<Traits> {}

impl<Traits> fmt::Debug for Timer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Timer").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Timer<Traits> {
    pub const fn from_id(id: Id) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub const fn id(&self) -> Id {
        self.id
    }

    /// Create a timer in the Stopped state.
    pub fn create(options: &TimerOptions) -> Result<Self, CreateSyncError> {
        if options.period == 0 || options.period > crate::MAX_TIMEOUT {
            return Err(CreateSyncError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;

        let (i, cb) = Traits::timer_cb_pool()
            .iter()
            .enumerate()
            .find(|(_, cb)| !cb.live.get(&*lock))
            .ok_or(CreateSyncError::PoolExhausted)?;

        cb.st.replace(&mut *lock, TimerSt::Stopped);
        cb.callback.replace(&mut *lock, options.callback);
        cb.param.replace(&mut *lock, options.param);
        cb.period.replace(&mut *lock, options.period);
        cb.periodic.replace(&mut *lock, options.periodic);
        cb.next.replace(&mut *lock, None);
        cb.fires.replace(&mut *lock, 0);
        cb.live.replace(&mut *lock, true);

        Ok(Self::from_id(Id::new(i + 1).unwrap()))
    }

    /// Arm the timer to fire one period from now. Starting a Running timer
    /// re-arms it (equivalent to [`Self::reset`]).
    pub fn start(&self) -> Result<(), TimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = timer_cb::<Traits>(self.id, lock.borrow_mut())?;
        start_timer(lock.borrow_mut(), cb);
        Ok(())
    }

    /// Disarm the timer. A stopped timer keeps its configuration and can be
    /// started again.
    pub fn stop(&self) -> Result<(), TimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = timer_cb::<Traits>(self.id, lock.borrow_mut())?;
        stop_timer(lock.borrow_mut(), cb);
        Ok(())
    }

    /// Restart the timer's period from now.
    pub fn reset(&self) -> Result<(), TimerError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = timer_cb::<Traits>(self.id, lock.borrow_mut())?;
        stop_timer(lock.borrow_mut(), cb);
        start_timer(lock.borrow_mut(), cb);
        Ok(())
    }

    /// Change the period. A Running timer is re-armed with the new period
    /// measured from now.
    pub fn change_period(&self, period: Ticks) -> Result<(), TimerError> {
        if period == 0 || period > crate::MAX_TIMEOUT {
            return Err(TimerError::BadParam);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = timer_cb::<Traits>(self.id, lock.borrow_mut())?;

        cb.period.replace(&mut *lock, period);
        if cb.st.get(&*lock) == TimerSt::Running {
            stop_timer(lock.borrow_mut(), cb);
            start_timer(lock.borrow_mut(), cb);
        }
        Ok(())
    }

    /// The timer's current state.
    pub fn state(&self) -> Result<TimerSt, BadIdError> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| BadIdError::BadId)?;
        let cb = timer_cb::<Traits>(self.id, lock.borrow_mut())?;
        Ok(cb.st.get(&*lock))
    }
}

fn timer_cb<Traits: KernelTraits>(
    id: Id,
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static TimerCb<Traits>, BadIdError> {
    Traits::get_timer_cb(id.get() - 1)
        .filter(|cb| cb.live.get(&*lock))
        .ok_or_else(crate::bad_id::<Traits>)
}

fn start_timer<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    cb: &'static TimerCb<Traits>,
) {
    if cb.st.get(&*lock) == TimerSt::Running {
        unlink(lock.borrow_mut(), cb);
    }

    let now = Traits::state().time.tick_count(lock.borrow_mut());
    let deadline = now.wrapping_add(cb.period.get(&*lock));
    cb.deadline.replace(&mut *lock, deadline);
    cb.st.replace(&mut *lock, TimerSt::Running);

    insert_sorted(lock, cb, now);
}

fn stop_timer<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    cb: &'static TimerCb<Traits>,
) {
    if cb.st.get(&*lock) == TimerSt::Running {
        unlink(lock.borrow_mut(), cb);
    }
    cb.st.replace(&mut *lock, TimerSt::Stopped);
}

/// Insert `cb` into the active list, keeping it sorted by time-to-deadline
/// relative to `now`. The list is short in practice, so the linear walk is
/// acceptable.
fn insert_sorted<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    cb: &'static TimerCb<Traits>,
    now: Ticks,
) {
    let key = |deadline: Ticks| deadline.wrapping_sub(now);
    let cb_key = key(cb.deadline.get(&*lock));

    let globals = &Traits::state().timers;
    let mut prev: Option<&'static TimerCb<Traits>> = None;
    let mut cur = globals.head.get(&*lock);

    while let Some(t) = cur {
        if cb_key < key(t.deadline.get(&*lock)) {
            break;
        }
        prev = Some(t);
        cur = t.next.get(&*lock);
    }

    cb.next.replace(&mut *lock, cur);
    match prev {
        Some(p) => {
            p.next.replace(&mut *lock, Some(cb));
        }
        None => {
            globals.head.replace(&mut *lock, Some(cb));
        }
    }
}

/// Remove `cb` from the active list.
fn unlink<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    cb: &'static TimerCb<Traits>,
) {
    let globals = &Traits::state().timers;
    let mut prev: Option<&'static TimerCb<Traits>> = None;
    let mut cur = globals.head.get(&*lock);

    while let Some(t) = cur {
        if core::ptr::eq(t, cb) {
            let next = cb.next.get(&*lock);
            match prev {
                Some(p) => {
                    p.next.replace(&mut *lock, next);
                }
                None => {
                    globals.head.replace(&mut *lock, next);
                }
            }
            cb.next.replace(&mut *lock, None);
            return;
        }
        prev = Some(t);
        cur = t.next.get(&*lock);
    }
}

/// Dispatch the expired prefix of the timer list. Called from the tick
/// handler; returns the re-acquired CPU Lock guard.
pub(crate) fn process_tick<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    now: Ticks,
) -> klock::CpuLockGuard<Traits> {
    loop {
        let fired = {
            let globals = &Traits::state().timers;
            match globals.head.get(&*lock) {
                Some(cb) if timeout::deadline_reached(cb.deadline.get(&*lock), now) => {
                    unlink(lock.borrow_mut(), cb);

                    if cb.periodic.get(&*lock) {
                        // Re-arm before the callback so the period is
                        // measured deadline-to-deadline, bounding drift to
                        // one tick regardless of callback latency
                        let deadline = timeout::next_period_after(
                            cb.deadline.get(&*lock),
                            cb.period.get(&*lock),
                            now,
                        );
                        cb.deadline.replace(&mut *lock, deadline);
                        insert_sorted(lock.borrow_mut(), cb, now);
                    } else {
                        cb.st.replace(&mut *lock, TimerSt::Expired);
                    }

                    cb.fires.replace_with(&mut *lock, |x| x.wrapping_add(1));
                    let deadline = cb.deadline.get(&*lock);
                    trace::record::<Traits>(
                        lock.borrow_mut(),
                        trace::Event::TimerFired,
                        deadline,
                        0,
                    );

                    Some((cb.callback.get(&*lock), cb.param.get(&*lock)))
                }
                _ => None,
            }
        };

        match fired {
            Some((callback, param)) => {
                // User callbacks run with interrupts enabled and may use the
                // interrupt-safe kernel surface
                lock = klock::release_and_call(lock, || callback(param));
            }
            None => return lock,
        }
    }
}
