//! The blocking subsystem: priority-ordered wait queues with constant-time
//! wake-up.
//!
//! Every waitable primitive owns one or two [`WaitQueue`]s. A task parks on
//! a queue through [`WaitQueue::wait`] / [`WaitQueue::wait_timeout`] and a
//! *wake-upper* releases it through [`WaitQueue::wake_up_one`] or
//! [`WaitQueue::wake_up_all_conditional`].
//!
//! The wake-upper is responsible for completing the effect of the wait
//! operation *before* waking the task (handing over a mutex, copying a queue
//! item, recording the matched event bits). The woken task merely reads the
//! outcome back from its wait payload. This is what makes the "wake order ==
//! priority order" guarantee watertight: a woken task can't lose its claim
//! to a resource to a task that snuck in between wake-up and dispatch.
use core::fmt;

use crate::{
    error::TimeoutError,
    event_group::{EventBits, EventGroupWaitFlags},
    ipc::Message,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    mutex::MutexCb,
    readyqueue::PrioSet,
    task,
    task::{TaskCb, TaskSt},
    timeout,
    utils::Init,
    KernelTraits, PortThreading, Priority, TaskRef, Ticks,
};

/// Additional information stored in a waiting task's control block,
/// discriminated by the kind of primitive the task is blocked on.
///
/// Variants carrying raw pointers refer to buffers owned by the *waiting*
/// task (on its stack). They stay valid for the whole wait: the task cannot
/// resume before a wake-upper or the tick handler completes the wait.
pub(crate) enum WaitPayload<Traits: PortThreading> {
    /// `task::delay`
    Sleep,
    /// Waiting to acquire the referenced mutex.
    Mutex(&'static MutexCb<Traits>),
    /// Waiting for a semaphore permit.
    Semaphore,
    /// Waiting for event bits. `orig` is filled in by the wake-upper with
    /// the event word observed at the moment the condition held.
    EventGroup {
        bits: EventBits,
        flags: EventGroupWaitFlags,
        orig: EventBits,
    },
    /// Waiting to deposit an item into a full queue. `item` points at the
    /// sender's payload; the wake-upper copies it into the freed slot.
    QueueSend { item: *const u8 },
    /// Waiting to fetch an item from an empty queue. `slot` points at the
    /// receiver's buffer; the wake-upper copies the item directly into it.
    QueueReceive { slot: *mut u8 },
    /// Waiting for free space in a stream buffer.
    StreamSend {
        src: *const u8,
        len: usize,
        /// Bytes accepted so far, updated by wake-uppers.
        written: usize,
    },
    /// Waiting for the stream buffer to reach its trigger level.
    StreamReceive {
        dst: *mut u8,
        cap: usize,
        /// Bytes delivered, filled in by the wake-upper.
        got: usize,
    },
    /// Waiting for an inter-core message. The wake-upper stores the
    /// delivered message inline.
    IpcReceive { msg: Option<Message> },
    /// Waiting to deposit an inter-core message into a full ring.
    IpcSend { msg: Message },
}

// Safety: the raw pointers inside a payload are only dereferenced under CPU
// Lock, and only while the owning task is parked in the Waiting state.
unsafe impl<Traits: PortThreading> Send for WaitPayload<Traits> {}
unsafe impl<Traits: PortThreading> Sync for WaitPayload<Traits> {}

impl<Traits: PortThreading> Clone for WaitPayload<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for WaitPayload<Traits> {}

impl<Traits: PortThreading> fmt::Debug for WaitPayload<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Sleep => f.write_str("Sleep"),
            Self::Mutex(mutex) => write!(f, "Mutex({mutex:p})"),
            Self::Semaphore => f.write_str("Semaphore"),
            Self::EventGroup { bits, flags, orig } => f
                .debug_struct("EventGroup")
                .field("bits", bits)
                .field("flags", flags)
                .field("orig", orig)
                .finish(),
            Self::QueueSend { .. } => f.write_str("QueueSend"),
            Self::QueueReceive { .. } => f.write_str("QueueReceive"),
            Self::StreamSend { len, written, .. } => f
                .debug_struct("StreamSend")
                .field("len", len)
                .field("written", written)
                .finish(),
            Self::StreamReceive { cap, got, .. } => f
                .debug_struct("StreamReceive")
                .field("cap", cap)
                .field("got", got)
                .finish(),
            Self::IpcReceive { .. } => f.write_str("IpcReceive"),
            Self::IpcSend { .. } => f.write_str("IpcSend"),
        }
    }
}

/// The wait state of a task, embedded in its control block.
pub(crate) struct TaskWait<Traits: PortThreading> {
    /// The wait queue the task is currently parked on. `None` while the task
    /// is not Waiting, or waits with no queue (`task::delay`).
    pub(super) wait_queue: CpuLockCell<Traits, Option<&'static WaitQueue<Traits>>>,

    /// The payload of the ongoing wait. Only meaningful while Waiting.
    pub(super) payload: CpuLockCell<Traits, WaitPayload<Traits>>,

    /// The result of the last wait operation, set by the wake-upper.
    pub(super) result: CpuLockCell<Traits, Result<(), TimeoutError>>,
}

impl<Traits: PortThreading> Init for TaskWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        wait_queue: Init::INIT,
        payload: CpuLockCell::new(WaitPayload::Sleep),
        result: CpuLockCell::new(Ok(())),
    };
}

impl<Traits: PortThreading> fmt::Debug for TaskWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskWait")
            .field("payload", &self.payload)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// A queue of tasks waiting on a particular waitable condition, sorted by
/// (effective priority, FIFO arrival).
pub(crate) struct WaitQueue<Traits: PortThreading> {
    /// The waiting tasks. All members are in the Waiting state.
    waiters: PrioSet<Traits>,
}

impl<Traits: PortThreading> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        waiters: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue").finish_non_exhaustive()
    }
}

impl<Traits: KernelTraits> WaitQueue<Traits> {
    /// Park the currently running task on `self` until a wake-upper releases
    /// it. Returns the final payload, possibly updated by the wake-upper.
    ///
    /// The current context must be waitable (the caller checks with
    /// `expect_waitable_context`).
    pub(super) fn wait(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
    ) -> WaitPayload<Traits> {
        let task = task::running_task_on_current_core::<Traits>(lock.borrow_mut()).unwrap();
        self.start_wait(lock.borrow_mut(), task, payload);

        task::wait_until_woken_up(lock.borrow_mut());

        // A forever-wait can only end through a wake-upper
        debug_assert!(task.wait.result.get(&*lock).is_ok());
        task.wait.payload.get(&*lock)
    }

    /// Like [`Self::wait`], but gives up after `duration` ticks.
    pub(super) fn wait_timeout(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        payload: WaitPayload<Traits>,
        duration: Ticks,
    ) -> Result<WaitPayload<Traits>, TimeoutError> {
        let task = task::running_task_on_current_core::<Traits>(lock.borrow_mut()).unwrap();
        self.start_wait(lock.borrow_mut(), task, payload);

        // Register the wake deadline so the tick handler can interrupt the
        // wait even if no wake-upper ever shows up
        timeout::register_wake(lock.borrow_mut(), task, duration);

        task::wait_until_woken_up(lock.borrow_mut());

        match task.wait.result.get(&*lock) {
            Ok(()) => Ok(task.wait.payload.get(&*lock)),
            Err(e) => Err(e),
        }
    }

    fn start_wait(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskRef<Traits>,
        payload: WaitPayload<Traits>,
    ) {
        task.wait.payload.replace(&mut *lock, payload);
        task.wait.wait_queue.replace(&mut *lock, Some(self));
        task.wait.result.replace(&mut *lock, Ok(()));

        let prio = task.effective_priority.get(&*lock);
        self.waiters.push_back(lock, task, prio);
    }

    /// The next task to be woken up, if any.
    pub(super) fn first_waiting_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<TaskRef<Traits>> {
        self.waiters.front(lock)
    }

    /// The effective priority of the most urgent waiter.
    pub(super) fn highest_waiter_priority(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<Priority> {
        self.waiters.highest_priority(lock)
    }

    /// Wake up up to one waiting task. Returns `true` if it has woken up a
    /// task.
    ///
    /// This method may make a task Ready, but doesn't yield the processor.
    /// Call `unlock_cpu_and_check_preemption` as needed.
    pub(super) fn wake_up_one(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        if let Some(task) = self.waiters.pop_highest(lock.borrow_mut()) {
            complete_wait(lock, task, Ok(()));
            true
        } else {
            false
        }
    }

    /// Wake up every waiting task for which `cond` returns `true`,
    /// evaluating waiters in (priority, FIFO) order.
    ///
    /// `cond` typically inspects and updates the waiter's payload; effects
    /// it applies (such as consuming event bits) are visible to the waiters
    /// evaluated after it.
    pub(super) fn wake_up_all_conditional(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mut cond: impl FnMut(CpuLockTokenRefMut<'_, Traits>, TaskRef<Traits>) -> bool,
    ) {
        let mut cur = self.waiters.front(lock.borrow_mut());

        while let Some(task) = cur {
            // Find the next waiter before we possibly unlink `task`
            cur = self.waiters.next_after(lock.borrow_mut(), task);

            if !cond(lock.borrow_mut(), task) {
                continue;
            }

            self.waiters.remove(lock.borrow_mut(), task);
            complete_wait(lock.borrow_mut(), task, Ok(()));
        }
    }

    /// Reposition `task` after a change of its effective priority.
    pub(super) fn reorder_waiter(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskRef<Traits>,
        effective_priority: Priority,
    ) {
        self.waiters.remove(lock.borrow_mut(), task);
        self.waiters.push_back(lock, task, effective_priority);
    }
}

/// Park the currently running task without a wait queue. Only the tick
/// handler (timeout) or task deletion can end such a wait.
pub(super) fn wait_no_queue_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    payload: WaitPayload<Traits>,
    duration: Ticks,
) -> Result<WaitPayload<Traits>, TimeoutError> {
    let task = task::running_task_on_current_core::<Traits>(lock.borrow_mut()).unwrap();

    task.wait.payload.replace(&mut *lock, payload);
    task.wait.wait_queue.replace(&mut *lock, None);
    task.wait.result.replace(&mut *lock, Ok(()));

    timeout::register_wake(lock.borrow_mut(), task, duration);

    task::wait_until_woken_up(lock.borrow_mut());

    match task.wait.result.get(&*lock) {
        Ok(()) => Ok(task.wait.payload.get(&*lock)),
        Err(e) => Err(e),
    }
}

/// Deassociate `task` from its ongoing wait and make it Ready with the
/// specified wait result.
///
/// The caller must have already unlinked `task` from the wait queue it was
/// parked on (if any).
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(super) fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
    result: Result<(), TimeoutError>,
) {
    debug_assert_eq!(*task.st.read(&*lock), TaskSt::Waiting);

    task.wait.wait_queue.replace(&mut *lock, None);
    task.wait.result.replace(&mut *lock, result);

    // The wake deadline is no longer needed
    timeout::cancel_wake(lock.borrow_mut(), task);

    // Safety: the task is Waiting, so its saved context is valid and its
    // wait state was just cleaned up
    unsafe { task::make_ready(lock, task) };
}

/// Interrupt the ongoing wait operation of `task` with the specified result.
/// Used by the tick handler (timeout expiry) and by task deletion.
///
/// Does nothing if the task is not Waiting.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(super) fn interrupt_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
    result: Result<(), TimeoutError>,
) {
    if *task.st.read(&*lock) != TaskSt::Waiting {
        return;
    }

    // Remove the task from the wait queue it's parked on
    if let Some(wait_queue) = task.wait.wait_queue.get(&*lock) {
        wait_queue.waiters.remove(lock.borrow_mut(), task);
    }

    complete_wait(lock, task, result);
}

/// Abort the ongoing wait of a task that is being deleted: unlink it from
/// its wait queue and the sleep queue without making it Ready.
pub(super) fn abort_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    debug_assert_eq!(*task.st.read(&*lock), TaskSt::Waiting);

    if let Some(wait_queue) = task.wait.wait_queue.replace(&mut *lock, None) {
        wait_queue.waiters.remove(lock.borrow_mut(), task);
    }
    timeout::cancel_wake(lock, task);
}

/// Reposition the task within its wait queue after a change of its
/// effective priority. No-op if the task isn't parked on a queue.
pub(super) fn reorder_wait_of_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
    effective_priority: Priority,
) {
    if let Some(wait_queue) = task.wait.wait_queue.get(&*lock) {
        wait_queue.reorder_waiter(lock, task, effective_priority);
    }
}

/// Inspect the payload of the task's ongoing wait, if it is Waiting.
pub(super) fn current_wait_payload<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &TaskCb<Traits>,
) -> Option<WaitPayload<Traits>> {
    if *task.st.read(&*lock) == TaskSt::Waiting {
        Some(task.wait.payload.get(&*lock))
    } else {
        None
    }
}
