//! Counting semaphores.
use core::{fmt, marker::PhantomData};

use crate::{
    error::{BadIdError, CreateSyncError, GiveSemaphoreError, TakeSemaphoreError, TimeoutError},
    klock, state, task,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    Id, KernelTraits, PortThreading, Ticks, NO_WAIT, WAIT_FOREVER,
};

/// Semaphore counts.
pub type SemaphoreValue = u32;

/// *Semaphore control block* - the state data of a semaphore.
#[doc(hidden)]
pub struct SemaphoreCb<Traits: PortThreading> {
    pub(super) live: klock::CpuLockCell<Traits, bool>,

    pub(super) value: klock::CpuLockCell<Traits, SemaphoreValue>,
    pub(super) max_value: klock::CpuLockCell<Traits, SemaphoreValue>,

    pub(super) wait_queue: WaitQueue<Traits>,

    pub(super) ops: klock::CpuLockCell<Traits, u32>,
    pub(super) timeouts: klock::CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Init for SemaphoreCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        live: Init::INIT,
        value: Init::INIT,
        max_value: Init::INIT,
        wait_queue: Init::INIT,
        ops: Init::INIT,
        timeouts: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("max_value", &self.max_value)
            .field("wait_queue", &self.wait_queue)
            .finish_non_exhaustive()
    }
}

/// An owned handle to a counting semaphore.
pub struct Semaphore<Traits> {
    id: Id,
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for Semaphore<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits> Copy for Semaphore<Traits> {}

impl<Traits> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Semaphore").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    pub const fn from_id(id: Id) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub const fn id(&self) -> Id {
        self.id
    }

    /// Create a semaphore with the given initial and maximum counts.
    pub fn create(
        initial: SemaphoreValue,
        max: SemaphoreValue,
    ) -> Result<Self, CreateSyncError> {
        if max == 0 || initial > max {
            return Err(CreateSyncError::BadParam);
        }
        let mut lock = klock::lock_cpu::<Traits>()?;

        let (i, cb) = Traits::semaphore_cb_pool()
            .iter()
            .enumerate()
            .find(|(_, cb)| !cb.live.get(&*lock))
            .ok_or(CreateSyncError::PoolExhausted)?;

        cb.value.replace(&mut *lock, initial);
        cb.max_value.replace(&mut *lock, max);
        cb.ops.replace(&mut *lock, 0);
        cb.timeouts.replace(&mut *lock, 0);
        cb.live.replace(&mut *lock, true);

        Ok(Self::from_id(Id::new(i + 1).unwrap()))
    }

    /// Take one permit, blocking up to `timeout` ticks while the count is
    /// zero.
    pub fn take(&self, timeout: Ticks) -> Result<(), TakeSemaphoreError> {
        take::<Traits>(self.id, timeout)
    }

    /// Return one permit. If a task is waiting, the permit goes straight to
    /// the most urgent waiter; otherwise the count is incremented, failing
    /// with [`GiveSemaphoreError::Overflow`] at the maximum.
    pub fn give(&self) -> Result<(), GiveSemaphoreError> {
        give::<Traits>(self.id)
    }

    /// An interrupt-safe [`Self::give`]: never blocks, defers the dispatch
    /// to the end of interrupt processing.
    pub fn give_isr(&self) -> Result<(), GiveSemaphoreError> {
        // `give` never blocks; the only difference in an interrupt context
        // is that `yield_cpu` pends the dispatch instead of taking it
        give::<Traits>(self.id)
    }

    /// Whether a `take(NO_WAIT)` would currently succeed.
    pub fn is_available(&self) -> Result<bool, BadIdError> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| BadIdError::BadId)?;
        let cb = semaphore_cb::<Traits>(self.id, lock.borrow_mut())?;
        Ok(cb.value.get(&*lock) > 0)
    }

    /// The current count.
    pub fn value(&self) -> Result<SemaphoreValue, BadIdError> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| BadIdError::BadId)?;
        let cb = semaphore_cb::<Traits>(self.id, lock.borrow_mut())?;
        Ok(cb.value.get(&*lock))
    }
}

fn semaphore_cb<Traits: KernelTraits>(
    id: Id,
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static SemaphoreCb<Traits>, BadIdError> {
    Traits::get_semaphore_cb(id.get() - 1)
        .filter(|cb| cb.live.get(&*lock))
        .ok_or_else(crate::bad_id::<Traits>)
}

/// Check if the semaphore has a permit to take. Decrements and returns
/// `true` if so.
#[inline]
fn poll_core(value: &mut SemaphoreValue) -> bool {
    if *value > 0 {
        *value -= 1;
        true
    } else {
        false
    }
}

fn take<Traits: KernelTraits>(id: Id, timeout: Ticks) -> Result<(), TakeSemaphoreError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let mut lock = state::expect_waitable_context::<Traits>(lock)?;
    let cb = semaphore_cb::<Traits>(id, lock.borrow_mut())?;

    cb.ops.replace_with(&mut *lock, |x| x.wrapping_add(1));

    if poll_core(cb.value.write(&mut *lock)) {
        return Ok(());
    }
    if timeout == NO_WAIT {
        return Err(TakeSemaphoreError::Timeout);
    }

    // Start waiting. The giver hands the permit to the woken task directly,
    // so a successful return means the take already happened.
    let result = if timeout == WAIT_FOREVER {
        cb.wait_queue
            .wait(lock.borrow_mut(), WaitPayload::Semaphore);
        Ok(())
    } else {
        cb.wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Semaphore, timeout)
            .map(|_| ())
    };

    result.map_err(|TimeoutError::Timeout| {
        cb.timeouts.replace_with(&mut *lock, |x| x.wrapping_add(1));
        TakeSemaphoreError::Timeout
    })
}

fn give<Traits: KernelTraits>(id: Id) -> Result<(), GiveSemaphoreError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let cb = semaphore_cb::<Traits>(id, lock.borrow_mut())?;

    cb.ops.replace_with(&mut *lock, |x| x.wrapping_add(1));

    if cb.wait_queue.wake_up_one(lock.borrow_mut()) {
        // The permit went straight to the woken task; the count stays zero
        debug_assert_eq!(cb.value.get(&*lock), 0);
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    let value = cb.value.get(&*lock);
    if value >= cb.max_value.get(&*lock) {
        return Err(GiveSemaphoreError::Overflow);
    }
    cb.value.replace(&mut *lock, value + 1);
    Ok(())
}

/// Per-object operation counters: `(operations, timed-out waits)`.
pub fn semaphore_stats<Traits: KernelTraits>(
    object: &Semaphore<Traits>,
) -> Result<(u32, u32), BadIdError> {
    let mut lock = klock::lock_cpu::<Traits>().map_err(|_| BadIdError::BadId)?;
    let cb = semaphore_cb::<Traits>(object.id(), lock.borrow_mut())?;
    Ok((cb.ops.get(&*lock), cb.timeouts.get(&*lock)))
}
