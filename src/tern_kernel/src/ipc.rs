//! Inter-core message passing.
//!
//! Each core owns one bounded multi-producer single-consumer ring of
//! fixed-size messages; tasks on that core are the only consumers. A sender
//! either hands its message straight to a parked receiver, or deposits it in
//! the ring and rings the target core's doorbell (an IPI). The doorbell
//! doubles as the cross-core reschedule request: the target core's IPI
//! handler drains deliverable messages and then re-runs its scheduler.
use core::fmt;

use crate::{
    error::{IpcReceiveError, IpcSendError, TimeoutError},
    klock, state, task,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    KernelCfg2, KernelTraits, Ticks, NO_WAIT, WAIT_FOREVER,
};

/// A fixed-size inter-core message: a tag word and three payload words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub tag: u32,
    pub payload: [u32; 3],
}

impl Init for Message {
    const INIT: Self = Self {
        tag: 0,
        payload: [0; 3],
    };
}

impl Message {
    pub const fn new(tag: u32, payload: [u32; 3]) -> Self {
        Self { tag, payload }
    }
}

/// A ring slot. The ring only ever stores user messages; kernel-internal
/// cross-core requests are carried by the doorbell itself.
pub type Slot = Message;

/// One core's inbound message ring.
pub(crate) struct Ring<Traits: KernelCfg2> {
    slots: Traits::IpcSlots,
    head: usize,
    len: usize,
}

impl<Traits: KernelCfg2> Init for Ring<Traits> {
    const INIT: Self = Self {
        slots: Init::INIT,
        head: 0,
        len: 0,
    };
}

impl<Traits: KernelCfg2> Ring<Traits> {
    fn capacity(&self) -> usize {
        core::borrow::Borrow::<[Slot]>::borrow(&self.slots).len()
    }

    fn push(&mut self, msg: Message) -> bool {
        let cap = self.capacity();
        if self.len == cap {
            return false;
        }
        let tail = (self.head + self.len) % cap;
        core::borrow::BorrowMut::<[Slot]>::borrow_mut(&mut self.slots)[tail] = msg;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<Message> {
        if self.len == 0 {
            return None;
        }
        let msg = core::borrow::Borrow::<[Slot]>::borrow(&self.slots)[self.head];
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        Some(msg)
    }
}

/// One core's inter-core channel: the inbound ring plus its wait queues.
pub(crate) struct Channel<Traits: KernelCfg2> {
    pub(crate) ring: klock::CpuLockCell<Traits, Ring<Traits>>,

    /// Tasks on the owning core blocked in `receive`.
    recv_wait: WaitQueue<Traits>,

    /// Tasks (on any core) blocked in `send` because the ring was full.
    send_wait: WaitQueue<Traits>,

    /// Messages discarded because a non-blocking send found the ring full.
    dropped: klock::CpuLockCell<Traits, u32>,
}

impl<Traits: KernelCfg2> Init for Channel<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        ring: Init::INIT,
        recv_wait: Init::INIT,
        send_wait: Init::INIT,
        dropped: Init::INIT,
    };
}

impl<Traits: KernelCfg2> fmt::Debug for Channel<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

/// Send `msg` to a task on `target_core`, blocking up to `timeout` ticks
/// while the target's ring is full.
pub fn send<Traits: KernelTraits>(
    target_core: usize,
    msg: Message,
    timeout: Ticks,
) -> Result<(), IpcSendError> {
    if target_core >= Traits::NUM_CORES {
        return Err(IpcSendError::BadParam);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    if timeout != NO_WAIT {
        lock = state::expect_waitable_context::<Traits>(lock)?;
    }

    let channel = &Traits::state().core(target_core).ipc;

    crate::trace::record::<Traits>(
        lock.borrow_mut(),
        crate::trace::Event::IpcMessage,
        msg.tag,
        target_core as u32,
    );

    // Fast path: a receiver is already parked on the target core
    if let Some(receiver) = channel.recv_wait.first_waiting_task(lock.borrow_mut()) {
        receiver
            .wait
            .payload
            .replace(&mut *lock, WaitPayload::IpcReceive { msg: Some(msg) });
        let woke = channel.recv_wait.wake_up_one(lock.borrow_mut());
        debug_assert!(woke);
        task::unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    if channel.ring.write(&mut *lock).push(msg) {
        ring_doorbell::<Traits>(target_core);
        return Ok(());
    }

    if timeout == NO_WAIT {
        channel
            .dropped
            .replace_with(&mut *lock, |x| x.wrapping_add(1));
        return Err(IpcSendError::IpcFull);
    }

    // Park until the consumer frees a slot; it moves our message into the
    // ring before waking us
    let payload = WaitPayload::IpcSend { msg };
    let result = if timeout == WAIT_FOREVER {
        channel.send_wait.wait(lock.borrow_mut(), payload);
        Ok(())
    } else {
        channel
            .send_wait
            .wait_timeout(lock.borrow_mut(), payload, timeout)
            .map(|_| ())
    };

    result.map_err(|TimeoutError::Timeout| IpcSendError::Timeout)
}

/// Receive the next message addressed to the calling task's core, blocking
/// up to `timeout` ticks while none is available.
pub fn receive<Traits: KernelTraits>(timeout: Ticks) -> Result<Message, IpcReceiveError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if timeout != NO_WAIT {
        lock = state::expect_waitable_context::<Traits>(lock)?;
    }

    let core = Traits::core_id();
    let channel = &Traits::state().core(core).ipc;

    if let Some(msg) = channel.ring.write(&mut *lock).pop() {
        if service_senders::<Traits>(channel, lock.borrow_mut()) {
            task::unlock_cpu_and_check_preemption(lock);
        }
        return Ok(msg);
    }

    if timeout == NO_WAIT {
        return Err(IpcReceiveError::QueueEmpty);
    }

    let payload = WaitPayload::IpcReceive { msg: None };
    let result = if timeout == WAIT_FOREVER {
        Ok(channel.recv_wait.wait(lock.borrow_mut(), payload))
    } else {
        channel
            .recv_wait
            .wait_timeout(lock.borrow_mut(), payload, timeout)
    };

    match result {
        Ok(WaitPayload::IpcReceive { msg: Some(msg) }) => Ok(msg),
        Ok(_) => unreachable!(),
        Err(TimeoutError::Timeout) => Err(IpcReceiveError::Timeout),
    }
}

/// The number of messages dropped on `core`'s channel by non-blocking
/// sends.
pub fn dropped_count<Traits: KernelTraits>(core: usize) -> u32 {
    if core >= Traits::NUM_CORES {
        return 0;
    }
    match klock::lock_cpu::<Traits>() {
        Ok(lock) => Traits::state().core(core).ipc.dropped.get(&*lock),
        Err(_) => 0,
    }
}

/// Move messages from parked senders into freed ring slots, most urgent
/// sender first. Returns `true` if any sender was woken.
fn service_senders<Traits: KernelTraits>(
    channel: &'static Channel<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    let mut woke_any = false;

    while let Some(sender) = channel.send_wait.first_waiting_task(lock.borrow_mut()) {
        let WaitPayload::IpcSend { msg } = sender.wait.payload.get(&*lock) else {
            unreachable!()
        };
        if !channel.ring.write(&mut *lock).push(msg) {
            break;
        }
        let woke = channel.send_wait.wake_up_one(lock.borrow_mut());
        debug_assert!(woke);
        woke_any = true;
    }

    woke_any
}

/// Ring the target core's doorbell unless the message is already consumable
/// locally.
fn ring_doorbell<Traits: KernelTraits>(target_core: usize) {
    if target_core != Traits::core_id() {
        // Safety: under CPU Lock
        unsafe { Traits::notify_core(target_core) };
    }
}

/// The IPI handler body: deliver ring messages to parked receivers, then
/// let the scheduler honor whatever the doorbell was rung for.
pub(crate) fn handle_ipi<Traits: KernelTraits>() {
    let mut lock = match klock::lock_cpu::<Traits>() {
        Ok(lock) => lock,
        Err(_) => return,
    };

    let core = Traits::core_id();
    let channel = &Traits::state().core(core).ipc;

    loop {
        let Some(receiver) = channel.recv_wait.first_waiting_task(lock.borrow_mut()) else {
            break;
        };
        let Some(msg) = channel.ring.write(&mut *lock).pop() else {
            break;
        };
        receiver
            .wait
            .payload
            .replace(&mut *lock, WaitPayload::IpcReceive { msg: Some(msg) });
        let woke = channel.recv_wait.wake_up_one(lock.borrow_mut());
        debug_assert!(woke);

        service_senders::<Traits>(channel, lock.borrow_mut());
    }

    // The doorbell may also stand for a remote wake or migration; check for
    // a pending dispatch either way
    task::unlock_cpu_and_check_preemption(lock);
}
