//! Mutexes: ownership-tracked recursive locks with priority inheritance.
use core::{fmt, marker::PhantomData};

use crate::{
    error::{
        BadIdError, CreateSyncError, ErrorCode, LockMutexError, TimeoutError, TryLockMutexError,
        UnlockMutexError,
    },
    klock, state, task,
    task::TaskSt,
    utils::Init,
    wait::{self, WaitPayload, WaitQueue},
    Id, KernelTraits, PortThreading, Priority, TaskRef, Ticks, NO_WAIT, WAIT_FOREVER,
};

/// *Mutex control block* - the state data of a mutex.
#[doc(hidden)]
pub struct MutexCb<Traits: PortThreading> {
    /// Whether this slot is in use.
    pub(super) live: klock::CpuLockCell<Traits, bool>,

    /// The task that currently owns the mutex lock.
    pub(super) owning_task: klock::CpuLockCell<Traits, Option<TaskRef<Traits>>>,

    /// Recursive acquisition count. Non-zero iff `owning_task` is `Some`.
    pub(super) recursion: klock::CpuLockCell<Traits, u32>,

    pub(super) wait_queue: WaitQueue<Traits>,

    /// The next element in the singly-linked list headed by
    /// `TaskCb::last_mutex_held`, containing all mutexes currently held by
    /// the owning task.
    pub(super) prev_mutex_held: klock::CpuLockCell<Traits, Option<&'static MutexCb<Traits>>>,

    /// Lifetime lock operations and timed-out waits on this mutex.
    pub(super) ops: klock::CpuLockCell<Traits, u32>,
    pub(super) timeouts: klock::CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> Init for MutexCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        live: Init::INIT,
        owning_task: Init::INIT,
        recursion: Init::INIT,
        wait_queue: Init::INIT,
        prev_mutex_held: Init::INIT,
        ops: Init::INIT,
        timeouts: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("recursion", &self.recursion)
            .field("wait_queue", &self.wait_queue)
            .finish_non_exhaustive()
    }
}

/// An owned handle to a mutex.
pub struct Mutex<Traits> {
    id: Id,
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for Mutex<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits> Copy for Mutex<Traits> {}

impl<Traits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Mutex").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    pub const fn from_id(id: Id) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    pub const fn id(&self) -> Id {
        self.id
    }

    /// Create a mutex in the unlocked state.
    pub fn create() -> Result<Self, CreateSyncError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let (i, cb) = Traits::mutex_cb_pool()
            .iter()
            .enumerate()
            .find(|(_, cb)| !cb.live.get(&*lock))
            .ok_or(CreateSyncError::PoolExhausted)?;

        cb.owning_task.replace(&mut *lock, None);
        cb.recursion.replace(&mut *lock, 0);
        cb.prev_mutex_held.replace(&mut *lock, None);
        cb.ops.replace(&mut *lock, 0);
        cb.timeouts.replace(&mut *lock, 0);
        cb.live.replace(&mut *lock, true);

        Ok(Self::from_id(Id::new(i + 1).unwrap()))
    }

    /// Acquire the mutex, blocking up to `timeout` ticks. The owner may
    /// re-acquire recursively; each acquisition needs a matching
    /// [`Self::unlock`].
    ///
    /// While a more urgent task waits for the mutex, the owner's effective
    /// priority is raised to match (priority inheritance), transitively
    /// through any mutex the owner itself is blocked on.
    pub fn lock(&self, timeout: Ticks) -> Result<(), LockMutexError> {
        lock_mutex::<Traits>(self.id, timeout)
    }

    /// Acquire the mutex without blocking.
    pub fn try_lock(&self) -> Result<(), TryLockMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let cb = mutex_cb::<Traits>(self.id, lock.borrow_mut())?;
        let running_task = task::running_task_on_current_core::<Traits>(lock.borrow_mut())
            .ok_or(TryLockMutexError::BadContext)?;

        cb.ops.replace_with(&mut *lock, |x| x.wrapping_add(1));

        if poll_core(cb, running_task, lock.borrow_mut()) {
            Ok(())
        } else {
            Err(TryLockMutexError::Busy)
        }
    }

    /// Release the mutex. Only the owner may call this; a release by any
    /// other task, or of an unlocked mutex, is an unrecoverable error.
    pub fn unlock(&self) -> Result<(), UnlockMutexError> {
        unlock_mutex::<Traits>(self.id)
    }
}

fn mutex_cb<Traits: KernelTraits>(
    id: Id,
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static MutexCb<Traits>, BadIdError> {
    Traits::get_mutex_cb(id.get() - 1)
        .filter(|cb| cb.live.get(&*lock))
        .ok_or_else(crate::bad_id::<Traits>)
}

/// Check if the mutex is free and, if so, give its ownership to
/// `running_task`. Returns `true` on acquisition (including recursive).
#[inline]
fn poll_core<Traits: KernelTraits>(
    cb: &'static MutexCb<Traits>,
    running_task: TaskRef<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    match cb.owning_task.get(&*lock) {
        None => {
            lock_core(cb, running_task, lock.borrow_mut());
            true
        }
        Some(owner) if core::ptr::eq(owner, running_task) => {
            cb.recursion.replace_with(&mut *lock, |x| x.saturating_add(1));
            true
        }
        Some(_) => false,
    }
}

/// Give the ownership of the mutex to `task`, which must be in the Running
/// or Waiting state.
#[inline]
fn lock_core<Traits: KernelTraits>(
    cb: &'static MutexCb<Traits>,
    task: TaskRef<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert!(matches!(
        *task.st.read(&*lock),
        TaskSt::Running | TaskSt::Waiting
    ));
    debug_assert_eq!(cb.recursion.get(&*lock), 0);

    cb.owning_task.replace(&mut *lock, Some(task));
    cb.recursion.replace(&mut *lock, 1);

    // Push `cb` onto the list of mutexes held by the task
    let prev = task.last_mutex_held.replace(&mut *lock, Some(cb));
    cb.prev_mutex_held.replace(&mut *lock, prev);
}

fn lock_mutex<Traits: KernelTraits>(id: Id, timeout: Ticks) -> Result<(), LockMutexError> {
    let lock = klock::lock_cpu::<Traits>()?;
    let mut lock = state::expect_waitable_context::<Traits>(lock)?;
    let cb = mutex_cb::<Traits>(id, lock.borrow_mut())?;
    let running_task = task::running_task_on_current_core::<Traits>(lock.borrow_mut()).unwrap();

    cb.ops.replace_with(&mut *lock, |x| x.wrapping_add(1));

    if poll_core(cb, running_task, lock.borrow_mut()) {
        return Ok(());
    }
    if timeout == NO_WAIT {
        return Err(LockMutexError::Timeout);
    }

    // The owner (and, transitively, whatever the owner waits on) must not
    // run at a lower priority than us while we wait
    boost_owner_chain(cb, lock.borrow_mut());

    // Park on the wait queue. The releasing task passes the ownership to
    // the most urgent waiter before waking it, so a successful return means
    // the mutex is ours.
    let result = if timeout == WAIT_FOREVER {
        cb.wait_queue.wait(lock.borrow_mut(), WaitPayload::Mutex(cb));
        Ok(())
    } else {
        cb.wait_queue
            .wait_timeout(lock.borrow_mut(), WaitPayload::Mutex(cb), timeout)
            .map(|_| ())
    };

    match result {
        Ok(()) => {
            debug_assert!(cb
                .owning_task
                .get(&*lock)
                .map_or(false, |t| core::ptr::eq(t, running_task)));
            Ok(())
        }
        Err(TimeoutError::Timeout) => {
            cb.timeouts.replace_with(&mut *lock, |x| x.wrapping_add(1));
            Err(LockMutexError::Timeout)
        }
    }
}

fn unlock_mutex<Traits: KernelTraits>(id: Id) -> Result<(), UnlockMutexError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let cb = mutex_cb::<Traits>(id, lock.borrow_mut())?;
    let running_task = task::running_task_on_current_core::<Traits>(lock.borrow_mut())
        .ok_or(UnlockMutexError::BadContext)?;

    match cb.owning_task.get(&*lock) {
        None => {
            // Releasing an unlocked mutex leaves no sane state to continue
            // from
            crate::error::fatal::<Traits>(lock, ErrorCode::MutexNotLocked, id.get() as u32);
        }
        Some(owner) if !core::ptr::eq(owner, running_task) => {
            crate::error::fatal::<Traits>(lock, ErrorCode::NotOwner, id.get() as u32);
        }
        Some(_) => {}
    }

    let recursion = cb.recursion.replace_with(&mut *lock, |x| *x - 1);
    if recursion > 1 {
        return Ok(());
    }

    // Remove `cb` from the list of mutexes held by the task
    remove_from_held_list(cb, running_task, lock.borrow_mut());

    // Restore the releaser's effective priority to its base, raised by the
    // inheritance floors of the mutexes it still holds
    let base = running_task.base_priority.get(&*lock);
    let effective = evaluate_task_effective_priority(lock.borrow_mut(), running_task, base);
    running_task.effective_priority.replace(&mut *lock, effective);

    // Wake up the next waiter
    unlock_mutex_unchecked(cb, lock.borrow_mut());

    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Pass the mutex to its most urgent waiter, or mark it free.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
fn unlock_mutex_unchecked<Traits: KernelTraits>(
    cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    cb.owning_task.replace(&mut *lock, None);
    cb.recursion.replace(&mut *lock, 0);

    if let Some(next_task) = cb.wait_queue.first_waiting_task(lock.borrow_mut()) {
        // Give the ownership of the mutex to `next_task` before waking it
        lock_core(cb, next_task, lock.borrow_mut());
        let woke = cb.wait_queue.wake_up_one(lock.borrow_mut());
        debug_assert!(woke);
    }
}

fn remove_from_held_list<Traits: KernelTraits>(
    cb: &'static MutexCb<Traits>,
    task: TaskRef<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let mut cur = task.last_mutex_held.get(&*lock);
    if cur.map_or(false, |m| core::ptr::eq(m, cb)) {
        let new_prev = cb.prev_mutex_held.get(&*lock);
        task.last_mutex_held.replace(&mut *lock, new_prev);
        return;
    }

    // Mutexes may be released in any order, so walk for the predecessor
    while let Some(m) = cur {
        let prev = m.prev_mutex_held.get(&*lock);
        if prev.map_or(false, |p| core::ptr::eq(p, cb)) {
            let new_prev = cb.prev_mutex_held.get(&*lock);
            m.prev_mutex_held.replace(&mut *lock, new_prev);
            return;
        }
        cur = prev;
    }

    debug_assert!(false, "mutex not found in the owner's held list");
}

/// Reevaluate the task's effective priority: the given base, raised by the
/// most urgent waiter of every mutex the task holds. (This function doesn't
/// update `TaskCb::effective_priority`.)
pub(super) fn evaluate_task_effective_priority<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
    base_priority: Priority,
) -> Priority {
    let mut effective = base_priority;
    let mut maybe_cb = task.last_mutex_held.get(&*lock);

    while let Some(cb) = maybe_cb {
        if let Some(floor) = cb.wait_queue.highest_waiter_priority(lock.borrow_mut()) {
            effective = effective.max(floor);
        }
        maybe_cb = cb.prev_mutex_held.get(&*lock);
    }

    effective
}

/// Raise the effective priority of `cb`'s owner to match the most urgent
/// waiter, repositioning the owner in whatever queue it occupies, and
/// propagate transitively if the owner is itself blocked on another mutex.
///
/// The boost either completes for the whole chain or (on a consistent
/// kernel) not at all; every step only raises priorities, so a partial
/// failure mode does not exist.
fn boost_owner_chain<Traits: KernelTraits>(
    cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let mut mutex = cb;
    loop {
        let Some(owner) = mutex.owning_task.get(&*lock) else {
            return;
        };
        let Some(floor) = mutex.wait_queue.highest_waiter_priority(lock.borrow_mut()) else {
            return;
        };
        if floor <= owner.effective_priority.get(&*lock) {
            return;
        }

        owner.effective_priority.replace(&mut *lock, floor);

        match *owner.st.read(&*lock) {
            TaskSt::Ready => {
                let core = owner.assigned_core.get(&*lock) as usize;
                Traits::state()
                    .core(core)
                    .ready
                    .reorder_task(lock.borrow_mut(), owner, floor);
                return;
            }
            TaskSt::Waiting => {
                wait::reorder_wait_of_task(lock.borrow_mut(), owner, floor);

                // If the owner waits on another mutex, the boost must reach
                // that mutex's owner as well
                if let Some(WaitPayload::Mutex(next)) =
                    wait::current_wait_payload(lock.borrow_mut(), owner)
                {
                    mutex = next;
                    continue;
                }
                return;
            }
            // A Running owner already has the CPU; the raised priority
            // matters the next time it's preemptible
            _ => return,
        }
    }
}

/// Called when a task blocked on a mutex had its priority raised: the boost
/// must be re-propagated to the owner.
pub(super) fn on_waiter_priority_changed<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    if let Some(WaitPayload::Mutex(cb)) = wait::current_wait_payload(lock.borrow_mut(), task) {
        boost_owner_chain(cb, lock);
    }
}

/// Release every mutex held by `task`, passing each to its next waiter.
/// Used when a task exits or is deleted.
///
/// This method may make tasks Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(super) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    let mut maybe_cb = task.last_mutex_held.replace(&mut *lock, None);
    while let Some(cb) = maybe_cb {
        maybe_cb = cb.prev_mutex_held.get(&*lock);
        cb.prev_mutex_held.replace(&mut *lock, None);
        unlock_mutex_unchecked(cb, lock.borrow_mut());
    }
}

/// Per-mutex operation counters: `(operations, timed-out waits)`.
pub fn mutex_stats<Traits: KernelTraits>(mutex: &Mutex<Traits>) -> Result<(u32, u32), BadIdError> {
    let mut lock = klock::lock_cpu::<Traits>().map_err(|_| BadIdError::BadId)?;
    let cb = mutex_cb::<Traits>(mutex.id, lock.borrow_mut())?;
    Ok((cb.ops.get(&*lock), cb.timeouts.get(&*lock)))
}
