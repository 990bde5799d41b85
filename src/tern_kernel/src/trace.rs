//! Kernel event tracing.
//!
//! Every scheduler-visible event can emit a fixed-size record into a ring
//! buffer sized by [`build!`]. A zero-length ring (the default) compiles the
//! recording down to a no-op.
//!
//! [`build!`]: crate::build

use core::borrow::{Borrow, BorrowMut};

use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
    KernelCfg2, KernelTraits, Ticks,
};

/// The kind of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    Tick,
    /// A context switch; `a` = incoming task id (0 = none), `b` = core.
    Switch,
    TaskCreated,
    TaskReady,
    TaskBlocked,
    TaskSuspended,
    TaskResumed,
    TaskExited,
    TaskReaped,
    TimerFired,
    /// An inter-core message was sent; `a` = tag, `b` = target core.
    IpcMessage,
    /// The load balancer moved a task; `a` = task id, `b` = new core.
    Migration,
    /// A health monitor threshold was crossed; `a` = error code.
    Alert,
}

/// A fixed-size trace record.
#[derive(Debug, Clone, Copy)]
pub struct Record {
    pub event: Event,
    pub tick: Ticks,
    pub a: u32,
    pub b: u32,
}

impl Init for Record {
    const INIT: Self = Self {
        event: Event::Tick,
        tick: 0,
        a: 0,
        b: 0,
    };
}

pub(crate) struct TraceGlobals<Traits: KernelCfg2> {
    ring: CpuLockCell<Traits, TraceRing<Traits>>,
}

impl<Traits: KernelCfg2> Init for TraceGlobals<Traits> {
    const INIT: Self = Self { ring: Init::INIT };
}

struct TraceRing<Traits: KernelCfg2> {
    slots: Traits::TraceRing,
    next: usize,
    /// Total records ever emitted, including overwritten ones.
    emitted: u32,
}

impl<Traits: KernelCfg2> Init for TraceRing<Traits> {
    const INIT: Self = Self {
        slots: Init::INIT,
        next: 0,
        emitted: 0,
    };
}

/// Emit a trace record. No-op when the ring has zero length.
#[inline]
pub(crate) fn record<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    event: Event,
    a: u32,
    b: u32,
) {
    let state = Traits::state();
    let tick = state.time.tick_count((*lock).borrow_mut());

    let ring = state.trace.ring.write(&mut *lock);
    let slots = ring.slots.borrow_mut();
    if slots.is_empty() {
        return;
    }

    slots[ring.next] = Record { event, tick, a, b };
    ring.next = (ring.next + 1) % slots.len();
    ring.emitted = ring.emitted.wrapping_add(1);

    log::trace!("[{tick}] {event:?} a={a} b={b}");
}

/// Copy out the most recent trace records, oldest first. Returns the number
/// of records written to `out`.
pub fn read_trace<Traits: KernelTraits>(out: &mut [Record]) -> usize {
    let mut lock = match crate::klock::lock_cpu::<Traits>() {
        Ok(lock) => lock,
        Err(_) => return 0,
    };

    let ring = Traits::state().trace.ring.write(&mut *lock);
    let slots = ring.slots.borrow();
    if slots.is_empty() {
        return 0;
    }

    let stored = (ring.emitted as usize).min(slots.len());
    let n = stored.min(out.len());
    // Start of the oldest surviving record
    let start = (ring.next + slots.len() - stored) % slots.len();
    for (i, slot) in out.iter_mut().take(n).enumerate() {
        *slot = slots[(start + i) % slots.len()];
    }
    n
}
