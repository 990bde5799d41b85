//! Event groups: 32 independent event bits with any-of / all-of waits.
use core::{fmt, marker::PhantomData};

use bitflags::bitflags;

use crate::{
    error::{BadIdError, CreateSyncError, TimeoutError, UpdateEventGroupError, WaitEventGroupError},
    klock, state, task,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    Id, KernelTraits, PortThreading, Ticks, NO_WAIT, WAIT_FOREVER,
};

/// The bit word of an event group.
pub type EventBits = u32;

bitflags! {
    /// Options for [`EventGroup::wait`].
    pub struct EventGroupWaitFlags: u8 {
        /// Wait until *all* of the requested bits are set, instead of any.
        const ALL = 1 << 0;

        /// Atomically clear the requested bits on a successful wait.
        const CLEAR = 1 << 1;
    }
}

impl Init for EventGroupWaitFlags {
    const INIT: Self = Self::empty();
}

/// *Event group control block* - the state data of an event group.
#[doc(hidden)]
pub struct EventGroupCb<Traits: PortThreading> {
    pub(super) live: klock::CpuLockCell<Traits, bool>,

    pub(super) bits: klock::CpuLockCell<Traits, EventBits>,

    pub(super) wait_queue: WaitQueue<Traits>,

    pub(super) ops: klock::CpuLockCell<Traits, u32>,
    pub(super) timeouts: klock::CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Init for EventGroupCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        live: Init::INIT,
        bits: Init::INIT,
        wait_queue: Init::INIT,
        ops: Init::INIT,
        timeouts: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for EventGroupCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventGroupCb")
            .field("self", &(self as *const _))
            .field("bits", &self.bits)
            .field("wait_queue", &self.wait_queue)
            .finish_non_exhaustive()
    }
}

/// An owned handle to an event group.
pub struct EventGroup<Traits> {
    id: Id,
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for EventGroup<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits> Copy for EventGroup<Traits> {}

impl<Traits> fmt::Debug for EventGroup<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("EventGroup").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> EventGroup<Traits> {
    pub const fn from_id(id: Id) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub const fn id(&self) -> Id {
        self.id
    }

    /// Create an event group with all bits clear.
    pub fn create() -> Result<Self, CreateSyncError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let (i, cb) = Traits::event_group_cb_pool()
            .iter()
            .enumerate()
            .find(|(_, cb)| !cb.live.get(&*lock))
            .ok_or(CreateSyncError::PoolExhausted)?;

        cb.bits.replace(&mut *lock, 0);
        cb.ops.replace(&mut *lock, 0);
        cb.timeouts.replace(&mut *lock, 0);
        cb.live.replace(&mut *lock, true);

        Ok(Self::from_id(Id::new(i + 1).unwrap()))
    }

    /// OR `bits` into the event word, waking every waiter whose condition
    /// is now satisfied, in priority order. Bits consumed by a clear-on-exit
    /// waiter are not seen by the waiters evaluated after it.
    pub fn set(&self, bits: EventBits) -> Result<(), UpdateEventGroupError> {
        set::<Traits>(self.id, bits)
    }

    /// An interrupt-safe [`Self::set`].
    pub fn set_isr(&self, bits: EventBits) -> Result<(), UpdateEventGroupError> {
        // `set` never blocks; in an interrupt context the dispatch is
        // deferred to the end of interrupt processing
        set::<Traits>(self.id, bits)
    }

    /// AND-NOT `bits` out of the event word. No wake-ups.
    pub fn clear(&self, bits: EventBits) -> Result<(), UpdateEventGroupError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = event_group_cb::<Traits>(self.id, lock.borrow_mut())?;
        cb.ops.replace_with(&mut *lock, |x| x.wrapping_add(1));
        cb.bits.replace_with(&mut *lock, |b| *b & !bits);
        Ok(())
    }

    /// The current event word.
    pub fn get(&self) -> Result<EventBits, BadIdError> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| BadIdError::BadId)?;
        let cb = event_group_cb::<Traits>(self.id, lock.borrow_mut())?;
        Ok(cb.bits.get(&*lock))
    }

    /// Wait until the condition `(bits, flags)` is satisfied, blocking up to
    /// `timeout` ticks. Returns the event word observed at the moment the
    /// condition held (before any clear-on-exit).
    pub fn wait(
        &self,
        bits: EventBits,
        flags: EventGroupWaitFlags,
        timeout: Ticks,
    ) -> Result<EventBits, WaitEventGroupError> {
        wait::<Traits>(self.id, bits, flags, timeout)
    }
}

fn event_group_cb<Traits: KernelTraits>(
    id: Id,
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static EventGroupCb<Traits>, BadIdError> {
    Traits::get_event_group_cb(id.get() - 1)
        .filter(|cb| cb.live.get(&*lock))
        .ok_or_else(crate::bad_id::<Traits>)
}

/// Given a wait condition `(bits, flags)`, check if the current state of an
/// event group, `event_bits`, satisfies the wait condition.
///
/// If so, this function clears some bits of `event_bits` (if requested by
/// `flags`) and returns `Some(original_value)`. Otherwise it returns `None`.
fn poll_core(
    event_bits: &mut EventBits,
    bits: EventBits,
    flags: EventGroupWaitFlags,
) -> Option<EventBits> {
    let satisfied = if flags.contains(EventGroupWaitFlags::ALL) {
        (*event_bits & bits) == bits
    } else {
        (*event_bits & bits) != 0
    };

    if satisfied {
        let original = *event_bits;
        if flags.contains(EventGroupWaitFlags::CLEAR) {
            *event_bits &= !bits;
        }
        Some(original)
    } else {
        None
    }
}

fn wait<Traits: KernelTraits>(
    id: Id,
    bits: EventBits,
    flags: EventGroupWaitFlags,
    timeout: Ticks,
) -> Result<EventBits, WaitEventGroupError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let mut lock = state::expect_waitable_context::<Traits>(lock)?;
    let cb = event_group_cb::<Traits>(id, lock.borrow_mut())?;

    cb.ops.replace_with(&mut *lock, |x| x.wrapping_add(1));

    if let Some(original) = poll_core(cb.bits.write(&mut *lock), bits, flags) {
        return Ok(original);
    }
    if timeout == NO_WAIT {
        return Err(WaitEventGroupError::Timeout);
    }

    // Start waiting. The task that satisfies the condition runs `poll_core`
    // on our behalf and records the observed word in the payload.
    let payload = WaitPayload::EventGroup {
        bits,
        flags,
        orig: 0,
    };
    let result = if timeout == WAIT_FOREVER {
        Ok(cb.wait_queue.wait(lock.borrow_mut(), payload))
    } else {
        cb.wait_queue
            .wait_timeout(lock.borrow_mut(), payload, timeout)
    };

    match result {
        Ok(WaitPayload::EventGroup { orig, .. }) => Ok(orig),
        Ok(_) => unreachable!(),
        Err(TimeoutError::Timeout) => {
            cb.timeouts.replace_with(&mut *lock, |x| x.wrapping_add(1));
            Err(WaitEventGroupError::Timeout)
        }
    }
}

fn set<Traits: KernelTraits>(id: Id, added_bits: EventBits) -> Result<(), UpdateEventGroupError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let cb = event_group_cb::<Traits>(id, lock.borrow_mut())?;

    cb.ops.replace_with(&mut *lock, |x| x.wrapping_add(1));

    let mut event_bits = cb.bits.get(&*lock);

    // Return early if no bits will change
    if (event_bits | added_bits) == event_bits {
        return Ok(());
    }

    event_bits |= added_bits;

    // Wake up tasks whose conditions are now fulfilled. A clear-on-exit
    // waiter consumes bits from `event_bits` as it's evaluated, hiding them
    // from the waiters after it.
    let mut woke_up_any = false;

    cb.wait_queue
        .wake_up_all_conditional(lock.borrow_mut(), |mut lock, waiter| {
            let payload = waiter.wait.payload.get(&*lock);
            let WaitPayload::EventGroup { bits, flags, .. } = payload else {
                unreachable!()
            };
            if let Some(orig) = poll_core(&mut event_bits, bits, flags) {
                woke_up_any = true;
                waiter.wait.payload.replace(
                    &mut *lock,
                    WaitPayload::EventGroup { bits, flags, orig },
                );
                true
            } else {
                false
            }
        });

    cb.bits.replace(&mut *lock, event_bits);

    if woke_up_any {
        task::unlock_cpu_and_check_preemption(lock);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_of_matches_any_bit() {
        let mut word = 0b0101;
        assert_eq!(
            poll_core(&mut word, 0b0001, EventGroupWaitFlags::empty()),
            Some(0b0101)
        );
        assert_eq!(word, 0b0101);
        assert_eq!(poll_core(&mut word, 0b1010, EventGroupWaitFlags::empty()), None);
    }

    #[test]
    fn all_of_requires_every_bit() {
        let mut word = 0b0111;
        assert_eq!(poll_core(&mut word, 0b1111, EventGroupWaitFlags::ALL), None);
        word |= 0b1000;
        assert_eq!(
            poll_core(&mut word, 0b1111, EventGroupWaitFlags::ALL),
            Some(0b1111)
        );
    }

    #[test]
    fn clear_on_exit_consumes_matched_bits() {
        let mut word = 0b1111;
        let flags = EventGroupWaitFlags::ALL | EventGroupWaitFlags::CLEAR;
        assert_eq!(poll_core(&mut word, 0b0011, flags), Some(0b1111));
        assert_eq!(word, 0b1100);
    }

    #[test]
    fn empty_all_mask_matches_immediately() {
        // `bits == 0` with ALL: `word & 0 == 0` vacuously holds
        let mut word = 0b1001;
        assert_eq!(poll_core(&mut word, 0, EventGroupWaitFlags::ALL), Some(0b1001));
        assert_eq!(word, 0b1001);
    }
}

/// Per-object operation counters: `(operations, timed-out waits)`.
pub fn eventgroup_stats<Traits: KernelTraits>(
    object: &EventGroup<Traits>,
) -> Result<(u32, u32), BadIdError> {
    let mut lock = klock::lock_cpu::<Traits>().map_err(|_| BadIdError::BadId)?;
    let cb = event_group_cb::<Traits>(object.id(), lock.borrow_mut())?;
    Ok((cb.ops.get(&*lock), cb.timeouts.get(&*lock)))
}
