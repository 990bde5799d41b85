//! Bounded FIFO queues of fixed-size items.
//!
//! Item payloads are copied into the queue on send and out of it on
//! receive; no aliasing crosses the boundary. When a receiver drains a full
//! queue, the most urgent blocked sender's item is copied into the freed
//! slot before that sender is woken, so payload order follows the
//! sender-side wait queue's (priority, FIFO) order.
use core::{fmt, marker::PhantomData, ptr};

use crate::{
    error::{BadIdError, CreateSyncError, ReceiveQueueError, SendQueueError, TimeoutError},
    klock, state, task,
    utils::Init,
    wait::{WaitPayload, WaitQueue},
    Id, KernelTraits, PortThreading, Region, Ticks, NO_WAIT, WAIT_FOREVER,
};

/// *Queue control block* - the state data of a message queue.
#[doc(hidden)]
pub struct QueueCb<Traits: PortThreading> {
    pub(super) live: klock::CpuLockCell<Traits, bool>,

    /// Item storage provided by the application at creation.
    pub(super) storage: klock::CpuLockCell<Traits, Region>,
    pub(super) item_size: klock::CpuLockCell<Traits, usize>,
    pub(super) capacity: klock::CpuLockCell<Traits, usize>,

    /// Index of the oldest item.
    pub(super) head: klock::CpuLockCell<Traits, usize>,
    /// Number of items currently stored.
    pub(super) len: klock::CpuLockCell<Traits, usize>,

    /// Tasks blocked in `send` (the queue was full).
    pub(super) send_wait: WaitQueue<Traits>,
    /// Tasks blocked in `receive` (the queue was empty).
    pub(super) recv_wait: WaitQueue<Traits>,

    pub(super) ops: klock::CpuLockCell<Traits, u32>,
    pub(super) timeouts: klock::CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Init for QueueCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        live: Init::INIT,
        storage: Init::INIT,
        item_size: Init::INIT,
        capacity: Init::INIT,
        head: Init::INIT,
        len: Init::INIT,
        send_wait: Init::INIT,
        recv_wait: Init::INIT,
        ops: Init::INIT,
        timeouts: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for QueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueCb")
            .field("self", &(self as *const _))
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// An owned handle to a message queue.
pub struct Queue<Traits> {
    id: Id,
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for Queue<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits> Copy for Queue<Traits> {}

impl<Traits> fmt::Debug for Queue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Queue").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Queue<Traits> {
    pub const fn from_id(id: Id) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub const fn id(&self) -> Id {
        self.id
    }

    /// Create a queue of `capacity` items of `item_size` bytes each, backed
    /// by `storage` (at least `capacity * item_size` bytes).
    pub fn create(
        storage: Region,
        item_size: usize,
        capacity: usize,
    ) -> Result<Self, CreateSyncError> {
        if item_size == 0 || capacity == 0 || storage.is_null() {
            return Err(CreateSyncError::BadParam);
        }
        if storage.len() < item_size.checked_mul(capacity).ok_or(CreateSyncError::BadParam)? {
            return Err(CreateSyncError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;

        let (i, cb) = Traits::queue_cb_pool()
            .iter()
            .enumerate()
            .find(|(_, cb)| !cb.live.get(&*lock))
            .ok_or(CreateSyncError::PoolExhausted)?;

        cb.storage.replace(&mut *lock, storage);
        cb.item_size.replace(&mut *lock, item_size);
        cb.capacity.replace(&mut *lock, capacity);
        cb.head.replace(&mut *lock, 0);
        cb.len.replace(&mut *lock, 0);
        cb.ops.replace(&mut *lock, 0);
        cb.timeouts.replace(&mut *lock, 0);
        cb.live.replace(&mut *lock, true);

        Ok(Self::from_id(Id::new(i + 1).unwrap()))
    }

    /// Copy `item` into the queue, blocking up to `timeout` ticks while the
    /// queue is full. `item` must be exactly `item_size` bytes.
    pub fn send(&self, item: &[u8], timeout: Ticks) -> Result<(), SendQueueError> {
        send::<Traits>(self.id, item, timeout)
    }

    /// An interrupt-safe, never-blocking [`Self::send`].
    pub fn send_isr(&self, item: &[u8]) -> Result<(), SendQueueError> {
        send::<Traits>(self.id, item, NO_WAIT)
    }

    /// Copy the oldest item into `buffer`, blocking up to `timeout` ticks
    /// while the queue is empty. `buffer` must be exactly `item_size` bytes.
    pub fn receive(&self, buffer: &mut [u8], timeout: Ticks) -> Result<(), ReceiveQueueError> {
        receive::<Traits>(self.id, buffer, timeout)
    }

    pub fn is_empty(&self) -> Result<bool, BadIdError> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| BadIdError::BadId)?;
        let cb = queue_cb::<Traits>(self.id, lock.borrow_mut())?;
        Ok(cb.len.get(&*lock) == 0)
    }

    pub fn is_full(&self) -> Result<bool, BadIdError> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| BadIdError::BadId)?;
        let cb = queue_cb::<Traits>(self.id, lock.borrow_mut())?;
        Ok(cb.len.get(&*lock) == cb.capacity.get(&*lock))
    }
}

fn queue_cb<Traits: KernelTraits>(
    id: Id,
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static QueueCb<Traits>, BadIdError> {
    Traits::get_queue_cb(id.get() - 1)
        .filter(|cb| cb.live.get(&*lock))
        .ok_or_else(crate::bad_id::<Traits>)
}

/// The address of slot `index` within the queue's storage.
fn slot_ptr<Traits: KernelTraits>(
    cb: &QueueCb<Traits>,
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    index: usize,
) -> *mut u8 {
    let storage = cb.storage.get(&*lock);
    let item_size = cb.item_size.get(&*lock);
    // Safety: `index < capacity` and the storage covers
    // `capacity * item_size` bytes (checked at creation)
    unsafe { storage.base().add(index * item_size) }
}

/// Copy an item into the tail slot. The caller has verified there is room.
fn push_item<Traits: KernelTraits>(
    cb: &QueueCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    src: *const u8,
) {
    let capacity = cb.capacity.get(&*lock);
    let head = cb.head.get(&*lock);
    let len = cb.len.get(&*lock);
    debug_assert!(len < capacity);

    let tail = (head + len) % capacity;
    let item_size = cb.item_size.get(&*lock);
    let dst = slot_ptr(cb, lock.borrow_mut(), tail);
    // Safety: `src` is a live item buffer of `item_size` bytes; `dst` is an
    // in-bounds slot; queue storage never aliases caller buffers
    unsafe { ptr::copy_nonoverlapping(src, dst, item_size) };

    cb.len.replace(&mut *lock, len + 1);
}

/// Copy the head item out and pop it. The caller has verified `len > 0`.
fn pop_item<Traits: KernelTraits>(
    cb: &QueueCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    dst: *mut u8,
) {
    let capacity = cb.capacity.get(&*lock);
    let head = cb.head.get(&*lock);
    let len = cb.len.get(&*lock);
    debug_assert!(len > 0);

    let item_size = cb.item_size.get(&*lock);
    let src = slot_ptr(cb, lock.borrow_mut(), head);
    // Safety: as in `push_item`
    unsafe { ptr::copy_nonoverlapping(src, dst, item_size) };

    cb.head.replace(&mut *lock, (head + 1) % capacity);
    cb.len.replace(&mut *lock, len - 1);
}

fn send<Traits: KernelTraits>(
    id: Id,
    item: &[u8],
    timeout: Ticks,
) -> Result<(), SendQueueError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if timeout != NO_WAIT {
        lock = state::expect_waitable_context::<Traits>(lock)?;
    }
    let cb = queue_cb::<Traits>(id, lock.borrow_mut())?;

    if item.len() != cb.item_size.get(&*lock) {
        return Err(SendQueueError::BadParam);
    }

    cb.ops.replace_with(&mut *lock, |x| x.wrapping_add(1));

    // A receiver may be parked on an empty queue: hand the item over
    // directly, bypassing the storage
    if cb.len.get(&*lock) == 0 {
        if let Some(receiver) = cb.recv_wait.first_waiting_task(lock.borrow_mut()) {
            let WaitPayload::QueueReceive { slot } = receiver.wait.payload.get(&*lock) else {
                unreachable!()
            };
            // Safety: `slot` points at the parked receiver's buffer of
            // `item_size` bytes
            unsafe { ptr::copy_nonoverlapping(item.as_ptr(), slot, item.len()) };
            let woke = cb.recv_wait.wake_up_one(lock.borrow_mut());
            debug_assert!(woke);
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }
    }

    if cb.len.get(&*lock) < cb.capacity.get(&*lock) {
        push_item(cb, lock.borrow_mut(), item.as_ptr());
        return Ok(());
    }

    if timeout == NO_WAIT {
        return Err(SendQueueError::QueueFull);
    }

    // The queue is full: park on the send side. The receiver that frees a
    // slot copies our item in before waking us.
    let payload = WaitPayload::QueueSend {
        item: item.as_ptr(),
    };
    let result = if timeout == WAIT_FOREVER {
        cb.send_wait.wait(lock.borrow_mut(), payload);
        Ok(())
    } else {
        cb.send_wait
            .wait_timeout(lock.borrow_mut(), payload, timeout)
            .map(|_| ())
    };

    result.map_err(|TimeoutError::Timeout| {
        cb.timeouts.replace_with(&mut *lock, |x| x.wrapping_add(1));
        SendQueueError::Timeout
    })
}

fn receive<Traits: KernelTraits>(
    id: Id,
    buffer: &mut [u8],
    timeout: Ticks,
) -> Result<(), ReceiveQueueError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    if timeout != NO_WAIT {
        lock = state::expect_waitable_context::<Traits>(lock)?;
    }
    let cb = queue_cb::<Traits>(id, lock.borrow_mut())?;

    if buffer.len() != cb.item_size.get(&*lock) {
        return Err(ReceiveQueueError::BadParam);
    }

    cb.ops.replace_with(&mut *lock, |x| x.wrapping_add(1));

    if cb.len.get(&*lock) > 0 {
        pop_item(cb, lock.borrow_mut(), buffer.as_mut_ptr());

        // A sender may be parked on the formerly-full queue: accept the most
        // urgent sender's item into the slot we just freed
        if let Some(sender) = cb.send_wait.first_waiting_task(lock.borrow_mut()) {
            let WaitPayload::QueueSend { item } = sender.wait.payload.get(&*lock) else {
                unreachable!()
            };
            push_item(cb, lock.borrow_mut(), item);
            let woke = cb.send_wait.wake_up_one(lock.borrow_mut());
            debug_assert!(woke);
            task::unlock_cpu_and_check_preemption(lock);
        }
        return Ok(());
    }

    if timeout == NO_WAIT {
        return Err(ReceiveQueueError::QueueEmpty);
    }

    // The queue is empty: park on the receive side. Whoever sends next
    // copies the item straight into `buffer` before waking us.
    let payload = WaitPayload::QueueReceive {
        slot: buffer.as_mut_ptr(),
    };
    let result = if timeout == WAIT_FOREVER {
        cb.recv_wait.wait(lock.borrow_mut(), payload);
        Ok(())
    } else {
        cb.recv_wait
            .wait_timeout(lock.borrow_mut(), payload, timeout)
            .map(|_| ())
    };

    result.map_err(|TimeoutError::Timeout| {
        cb.timeouts.replace_with(&mut *lock, |x| x.wrapping_add(1));
        ReceiveQueueError::Timeout
    })
}

/// Per-object operation counters: `(operations, timed-out waits)`.
pub fn queue_stats<Traits: KernelTraits>(
    object: &Queue<Traits>,
) -> Result<(u32, u32), BadIdError> {
    let mut lock = klock::lock_cpu::<Traits>().map_err(|_| BadIdError::BadId)?;
    let cb = queue_cb::<Traits>(object.id(), lock.borrow_mut())?;
    Ok((cb.ops.get(&*lock), cb.timeouts.get(&*lock)))
}
