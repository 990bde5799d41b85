//! Tasks: control blocks, lifecycle, and the per-core scheduler core.
use core::{fmt, marker::PhantomData, sync::atomic::Ordering};

use crate::{
    error::{
        BadContextError, BadIdError, CreateTaskError, DeleteTaskError, ErrorCode, ResumeTaskError,
        SetTaskPriorityError, SleepError, SuspendTaskError, TimeoutError,
    },
    klock, mutex,
    readyqueue::{QueueLink, ScheduleDecision},
    smp, state, timeout, trace,
    utils::{Init, RawCell},
    wait, Id, KernelTraits, PortThreading, Priority, Region, TaskRef, Ticks, WAIT_FOREVER,
};

/// The type of a task entry function. The argument is the opaque parameter
/// given at creation.
pub type TaskEntry = fn(usize);

/// The byte used to pre-fill task stacks. The stack high-water mark is
/// measured by scanning for the first byte that no longer holds it, and the
/// word at the stack base doubles as the overflow canary.
const STACK_FILL: u8 = 0xa5;
const STACK_CANARY: u32 = u32::from_le_bytes([STACK_FILL; 4]);

/// Task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// The control block is unused.
    Vacant,
    Ready,
    Running,
    /// Parked on a wait queue or sleeping.
    Waiting,
    Suspended,
    /// Exited or deleted; awaiting the idle reaper.
    Terminated,
}

impl Init for TaskSt {
    const INIT: Self = Self::Vacant;
}

/// The properties of a task fixed at creation time.
#[derive(Clone, Copy)]
pub struct TaskAttr {
    /// The entry point of the task.
    ///
    /// # Safety
    ///
    /// This is only meant to be used by a kernel port, as a task entry
    /// point, not by user code.
    pub entry: TaskEntry,

    /// The parameter supplied to `entry`.
    pub param: usize,

    /// The stack region exclusively owned by the task until it terminates
    /// and the idle reaper recycles the slot.
    pub stack: Region,

    /// Human-readable task name for diagnostics.
    pub name: Option<&'static str>,
}

fn entry_nop(_: usize) {}

impl Init for TaskAttr {
    const INIT: Self = Self {
        entry: entry_nop,
        param: 0,
        stack: Init::INIT,
        name: None,
    };
}

/// *Task control block* - the state data of a task.
#[repr(C)]
pub struct TaskCb<Traits: PortThreading> {
    /// Port-specific state (the saved stack pointer). Placed at the
    /// beginning of the struct so the port's context-switch code can refer
    /// to it with a zero offset.
    pub port_task_state: Traits::PortTaskState,

    /// The creation-time properties. Written during `create` under CPU Lock;
    /// stable while the slot is occupied.
    pub(crate) attr: RawCell<TaskAttr>,

    pub(crate) st: klock::CpuLockCell<Traits, TaskSt>,

    pub(crate) base_priority: klock::CpuLockCell<Traits, Priority>,

    /// The priority the task is currently scheduled at. Equals
    /// `base_priority` except while boosted by priority inheritance.
    pub(crate) effective_priority: klock::CpuLockCell<Traits, Priority>,

    /// Membership in the ready queue or a wait queue (never both).
    pub(crate) link: klock::CpuLockCell<Traits, Option<QueueLink<Traits>>>,

    /// The wait state of the task.
    pub(crate) wait: wait::TaskWait<Traits>,

    /// The task's wake deadline, maintained by the sleep queue.
    pub(crate) wake_at: timeout::SleepPropCell<Option<Ticks>>,

    /// The task's position in the sleep queue's heap.
    pub(crate) heap_pos: timeout::SleepPropCell<usize>,

    /// The head of the singly-linked list of mutexes held by this task,
    /// linked through `MutexCb::prev_mutex_held`.
    pub(crate) last_mutex_held: klock::CpuLockCell<Traits, Option<&'static mutex::MutexCb<Traits>>>,

    pub(crate) affinity: klock::CpuLockCell<Traits, smp::Affinity>,

    /// The core whose ready queue this task goes to when it becomes Ready.
    pub(crate) assigned_core: klock::CpuLockCell<Traits, u8>,

    /// Lifetime count of context switches into this task.
    pub(crate) switches: klock::CpuLockCell<Traits, u32>,

    /// Ticks during which this task was observed running.
    pub(crate) cpu_ticks: klock::CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> TaskCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    pub(crate) const INIT: Self = Self {
        port_task_state: Traits::PortTaskState::INIT,
        attr: RawCell::new(TaskAttr::INIT),
        st: Init::INIT,
        base_priority: Init::INIT,
        effective_priority: Init::INIT,
        link: Init::INIT,
        wait: Init::INIT,
        wake_at: tokenlock::UnsyncTokenLock::new(Init::INIT, None),
        heap_pos: tokenlock::UnsyncTokenLock::new(Init::INIT, 0),
        last_mutex_held: Init::INIT,
        affinity: klock::CpuLockCell::new(smp::Affinity::Any),
        assigned_core: Init::INIT,
        switches: Init::INIT,
        cpu_ticks: Init::INIT,
    };

    /// Read the creation-time attributes.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active, or the task must be known not to be
    /// concurrently re-created.
    pub unsafe fn attr(&self) -> &TaskAttr {
        // Safety: per this method's contract, nobody is writing `attr`
        unsafe { &*self.attr.get() }
    }
}

impl<Traits: PortThreading> Init for TaskCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::INIT;
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("st", &self.st)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a task's statistics and scheduling state.
#[derive(Debug, Clone, Copy)]
pub struct TaskStats {
    pub state: TaskSt,
    pub base_priority: Priority,
    pub effective_priority: Priority,
    /// Context switches into the task.
    pub switches: u32,
    /// Ticks during which the task was observed running.
    pub cpu_ticks: u32,
    /// Stack high-water mark: the most stack bytes ever in use.
    pub stack_high_water: usize,
    pub stack_size: usize,
}

// ---------------------------------------------------------------------------
// Public handle

/// Options for [`Task::create`].
#[derive(Clone, Copy)]
pub struct TaskOptions {
    /// Fixed base priority. `1` (least urgent) up to the configured
    /// maximum; `0` is reserved for the idle tasks.
    pub priority: Priority,
    /// Stack region. Must be aligned to `PortThreading::STACK_ALIGN` and at
    /// least `PortThreading::STACK_MIN_SIZE` bytes long.
    pub stack: Region,
    pub entry: TaskEntry,
    pub param: usize,
    pub affinity: smp::Affinity,
    pub name: Option<&'static str>,
}

/// An owned handle to a task.
pub struct Task<Traits> {
    id: Id,
    _phantom: PhantomData<Traits>,
}

impl<Traits> Clone for Task<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits> Copy for Task<Traits> {}

impl<Traits> fmt::Debug for Task<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Task").field(&self.id).finish()
    }
}

impl<Traits: KernelTraits> Task<Traits> {
    /// Construct a handle from a numeric id previously obtained through
    /// [`Self::id`].
    pub const fn from_id(id: Id) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }

    /// The numeric id of this task.
    pub const fn id(&self) -> Id {
        self.id
    }

    /// Create a task. The task becomes Ready immediately and will preempt
    /// the caller if it outranks it.
    pub fn create(options: &TaskOptions) -> Result<Self, CreateTaskError> {
        create::<Traits>(options)
    }

    /// The currently running task.
    pub fn current() -> Result<Self, BadContextError> {
        state::expect_task_context::<Traits>()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let task = running_task_on_current_core::<Traits>(lock.borrow_mut()).unwrap();
        Ok(Self::from_id(task_ref_to_id::<Traits>(task)))
    }

    /// Suspend the task. A task cannot suspend itself, and a Waiting task
    /// cannot be suspended.
    pub fn suspend(&self) -> Result<(), SuspendTaskError> {
        suspend::<Traits>(self.id)
    }

    /// Resume a previously suspended task.
    pub fn resume(&self) -> Result<(), ResumeTaskError> {
        resume::<Traits>(self.id)
    }

    /// Change the task's base priority, repositioning it in whatever queue
    /// it occupies.
    pub fn set_priority(&self, priority: Priority) -> Result<(), SetTaskPriorityError> {
        set_task_base_priority::<Traits>(self.id, priority)
    }

    /// Delete the task. A Waiting task is unlinked from its wait queue
    /// first; mutexes it held are released and their waiters woken.
    ///
    /// Deleting the calling task never returns.
    pub fn delete(&self) -> Result<(), DeleteTaskError> {
        delete::<Traits>(self.id)
    }

    /// Statistics and scheduling state of the task.
    pub fn stats(&self) -> Result<TaskStats, BadIdError> {
        stats::<Traits>(self.id)
    }
}

/// Block the calling task for the specified number of ticks.
///
/// `delay(0)` returns immediately; [`WAIT_FOREVER`] is not a valid delay.
pub fn delay<Traits: KernelTraits>(ticks: Ticks) -> Result<(), SleepError> {
    if ticks == WAIT_FOREVER {
        return Err(SleepError::BadParam);
    }
    let lock = klock::lock_cpu::<Traits>()?;
    let mut lock = state::expect_waitable_context::<Traits>(lock)?;
    if ticks == 0 {
        return Ok(());
    }

    match wait::wait_no_queue_timeout(lock.borrow_mut(), wait::WaitPayload::Sleep, ticks) {
        // A sleep can only end by timing out
        Ok(_) => unreachable!(),
        Err(TimeoutError::Timeout) => Ok(()),
    }
}

/// Yield the processor to a Ready task of the same (or higher) priority, if
/// one exists.
pub fn yield_now<Traits: KernelTraits>() -> Result<(), BadContextError> {
    state::expect_task_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;

    let core = Traits::core_id();
    let core_state = Traits::state().core(core);
    let task = core_state.running_task().unwrap();
    let prio = task.effective_priority.get(&*lock);

    if core_state.ready.has_task_at(lock.borrow_mut(), prio)
        || core_state
            .ready
            .has_ready_task_above(lock.borrow_mut(), Some(prio))
    {
        debug_assert_eq!(*task.st.read(&*lock), TaskSt::Running);
        task.st.replace(&mut *lock, TaskSt::Ready);
        core_state
            .ready
            .push_back_task(lock.borrow_mut(), task, prio);
        drop(lock);
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lookup helpers

pub(crate) fn task_cb<Traits: KernelTraits>(
    id: Id,
) -> Result<&'static TaskCb<Traits>, BadIdError> {
    Traits::get_task_cb(id.get() - 1).ok_or_else(crate::bad_id::<Traits>)
}

pub(crate) fn task_ref_to_id<Traits: KernelTraits>(task: TaskRef<Traits>) -> Id {
    let offset_bytes =
        task as *const TaskCb<Traits> as usize - Traits::task_cb_pool().as_ptr() as usize;
    let offset = offset_bytes / core::mem::size_of::<TaskCb<Traits>>();
    Id::new(offset + 1).unwrap()
}

/// The currently running task on the core this code is running on.
pub(crate) fn running_task_on_current_core<Traits: KernelTraits>(
    _lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Option<TaskRef<Traits>> {
    Traits::state().core(Traits::core_id()).running_task()
}

/// The id of the currently running task, for error records.
pub(crate) fn current_task_id<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Option<Id> {
    running_task_on_current_core::<Traits>(lock).map(task_ref_to_id::<Traits>)
}

// ---------------------------------------------------------------------------
// Creation and deletion

fn create<Traits: KernelTraits>(options: &TaskOptions) -> Result<Task<Traits>, CreateTaskError> {
    if options.priority == 0 || options.priority as usize >= Traits::NUM_TASK_PRIORITY_LEVELS {
        return Err(CreateTaskError::BadPriority);
    }
    validate_stack::<Traits>(&options.stack)?;
    if !options.affinity.allows_any_of(Traits::NUM_CORES) {
        return Err(CreateTaskError::BadParam);
    }

    // Pre-fill the stack with the fill pattern for high-water measurement
    // and overflow detection. The region is exclusively ours by `Region`'s
    // contract, and the slot hasn't been claimed yet.
    unsafe {
        core::ptr::write_bytes(options.stack.base(), STACK_FILL, options.stack.len());
    }

    let mut lock = klock::lock_cpu::<Traits>()?;

    let attr = TaskAttr {
        entry: options.entry,
        param: options.param,
        stack: options.stack,
        name: options.name,
    };
    let task = claim_slot::<Traits>(lock.borrow_mut(), &attr, options.priority, options.affinity)
        .ok_or(CreateTaskError::PoolExhausted)?;

    // Safety: CPU Lock active, the slot was just claimed and is not running
    unsafe { Traits::initialize_task_state(task) };

    trace::record::<Traits>(
        lock.borrow_mut(),
        trace::Event::TaskCreated,
        task_ref_to_id::<Traits>(task).get() as u32,
        options.priority as u32,
    );

    // Safety: the task state was just initialized
    unsafe { make_ready(lock.borrow_mut(), task) };

    let id = task_ref_to_id::<Traits>(task);

    // If the new task has a higher priority, perform a context switch
    unlock_cpu_and_check_preemption(lock);

    Ok(Task::from_id(id))
}

fn validate_stack<Traits: KernelTraits>(stack: &Region) -> Result<(), CreateTaskError> {
    if stack.is_null() || stack.base() as usize % Traits::STACK_ALIGN != 0 {
        return Err(CreateTaskError::BadParam);
    }
    if stack.len() < Traits::STACK_MIN_SIZE || stack.len() % Traits::STACK_ALIGN != 0 {
        return Err(CreateTaskError::StackTooSmall);
    }
    Ok(())
}

fn claim_slot<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    attr: &TaskAttr,
    priority: Priority,
    affinity: smp::Affinity,
) -> Option<TaskRef<Traits>> {
    let task = Traits::task_cb_pool()
        .iter()
        .find(|cb| *cb.st.read(&*lock) == TaskSt::Vacant)?;

    // Safety: CPU Lock active and the slot is vacant; nobody else reads
    // `attr` until the state leaves `Vacant` below
    unsafe { *task.attr.get() = *attr };

    task.base_priority.replace(&mut *lock, priority);
    task.effective_priority.replace(&mut *lock, priority);
    task.affinity.replace(&mut *lock, affinity);
    task.last_mutex_held.replace(&mut *lock, None);
    task.switches.replace(&mut *lock, 0);
    task.cpu_ticks.replace(&mut *lock, 0);
    debug_assert!(task.link.read(&*lock).is_none());

    Some(task)
}

/// Create one core's idle task. Called by `System::init` with the reserved
/// priority level `0`.
pub(crate) fn create_idle_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    core: usize,
) -> Result<(), CreateTaskError> {
    let stack = Traits::idle_stack(core);
    unsafe {
        core::ptr::write_bytes(stack.base(), STACK_FILL, stack.len());
    }

    let attr = TaskAttr {
        entry: idle_entry::<Traits>,
        param: core,
        stack,
        name: Some(match core {
            0 => "idle0",
            _ => "idle1",
        }),
    };
    let task = claim_slot::<Traits>(
        lock.borrow_mut(),
        &attr,
        0,
        smp::Affinity::pinned_to(core),
    )
    .ok_or(CreateTaskError::PoolExhausted)?;

    // Safety: CPU Lock active, the slot was just claimed
    unsafe { Traits::initialize_task_state(task) };

    Traits::state()
        .core(core)
        .idle_task
        .replace(&mut *lock, Some(task));

    // Safety: the task state was just initialized
    unsafe { make_ready(lock.borrow_mut(), task) };
    Ok(())
}

/// The idle tasks' entry function: reap Terminated slots, run the idle
/// hook, and wait for an interrupt.
fn idle_entry<Traits: KernelTraits>(core: usize) {
    let _ = core;
    loop {
        reap_terminated::<Traits>();

        let hook = {
            match klock::lock_cpu::<Traits>() {
                Ok(lock) => Traits::state().cfg.read(&*lock).idle_hook,
                Err(_) => None,
            }
        };
        if let Some(hook) = hook {
            hook();
        }

        Traits::idle_wait();
    }
}

/// Recycle the slots of Terminated tasks. Their stack regions return to the
/// application's ownership the moment the slot becomes Vacant.
fn reap_terminated<Traits: KernelTraits>() {
    let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
        return;
    };

    for cb in Traits::task_cb_pool() {
        if *cb.st.read(&*lock) != TaskSt::Terminated {
            continue;
        }
        // Don't touch a task that a core hasn't fully switched away from
        let still_current = Traits::state()
            .cores()
            .iter()
            .any(|c| c.running_task().map_or(false, |t| core::ptr::eq(t, cb)));
        if still_current {
            continue;
        }

        cb.st.replace(&mut *lock, TaskSt::Vacant);
        trace::record::<Traits>(
            lock.borrow_mut(),
            trace::Event::TaskReaped,
            task_ref_to_id::<Traits>(cb).get() as u32,
            0,
        );
    }
}

/// Terminate the currently running task. Exposed for ports: a task entry
/// function returning lands here via the port's exit trampoline.
///
/// # Safety
///
/// Must be called from a task context. All data on the task's stack is
/// invalidated.
pub unsafe fn exit_current_task<Traits: KernelTraits>() -> ! {
    // If CPU Lock is inactive, activate it
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<Traits>()
    };

    let core_state = Traits::state().core(Traits::core_id());
    let running_task = core_state.running_task().unwrap();

    // Abandon held mutexes, waking up their next waiters (if any)
    mutex::abandon_held_mutexes(lock.borrow_mut(), running_task);
    debug_assert!(running_task.last_mutex_held.read(&*lock).is_none());

    debug_assert_eq!(*running_task.st.read(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Terminated);

    core_state.set_running_task(None);

    trace::record::<Traits>(
        lock.borrow_mut(),
        trace::Event::TaskExited,
        task_ref_to_id::<Traits>(running_task).get() as u32,
        0,
    );

    core::mem::forget(lock);

    // Safety: (1) the task stack is abandoned for good; (2) CPU Lock active
    unsafe { Traits::exit_and_dispatch(running_task) }
}

fn delete<Traits: KernelTraits>(id: Id) -> Result<(), DeleteTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let task = task_cb::<Traits>(id)?;

    match *task.st.read(&*lock) {
        TaskSt::Vacant => return Err(BadIdError::BadId.into()),
        TaskSt::Running => {
            let current = running_task_on_current_core::<Traits>(lock.borrow_mut());
            if current.map_or(false, |t| core::ptr::eq(t, task)) {
                drop(lock);
                // Deleting the calling task is an exit
                // Safety: task context (we are the running task)
                unsafe { exit_current_task::<Traits>() };
            }
            // Running on the other core; there's no safe point to stop it at
            return Err(DeleteTaskError::BadObjectState);
        }
        TaskSt::Ready => {
            let core = task.assigned_core.get(&*lock) as usize;
            Traits::state()
                .core(core)
                .ready
                .remove(lock.borrow_mut(), task);
        }
        TaskSt::Waiting => {
            // Unlink from whatever it was waiting for, including the sleep
            // queue
            wait::abort_wait(lock.borrow_mut(), task);
        }
        TaskSt::Suspended => {}
        TaskSt::Terminated => return Err(DeleteTaskError::BadObjectState),
    }

    // Release whatever the victim held
    mutex::abandon_held_mutexes(lock.borrow_mut(), task);

    task.st.replace(&mut *lock, TaskSt::Terminated);
    trace::record::<Traits>(
        lock.borrow_mut(),
        trace::Event::TaskExited,
        id.get() as u32,
        1,
    );

    // Waking mutex waiters may call for a dispatch
    unlock_cpu_and_check_preemption(lock);
    Ok(())
}

// ---------------------------------------------------------------------------
// Suspension

fn suspend<Traits: KernelTraits>(id: Id) -> Result<(), SuspendTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let task = task_cb::<Traits>(id)?;

    match *task.st.read(&*lock) {
        TaskSt::Vacant => Err(BadIdError::BadId.into()),
        TaskSt::Running => {
            let current = running_task_on_current_core::<Traits>(lock.borrow_mut());
            if current.map_or(false, |t| core::ptr::eq(t, task)) {
                // Suspending yourself would lose your own return path; the
                // kernel rejects it rather than guessing
                Err(SuspendTaskError::SelfSuspend)
            } else {
                Err(SuspendTaskError::BadObjectState)
            }
        }
        TaskSt::Ready => {
            let core = task.assigned_core.get(&*lock) as usize;
            Traits::state()
                .core(core)
                .ready
                .remove(lock.borrow_mut(), task);
            task.st.replace(&mut *lock, TaskSt::Suspended);
            trace::record::<Traits>(
                lock.borrow_mut(),
                trace::Event::TaskSuspended,
                id.get() as u32,
                0,
            );
            Ok(())
        }
        TaskSt::Waiting | TaskSt::Suspended | TaskSt::Terminated => {
            Err(SuspendTaskError::BadObjectState)
        }
    }
}

fn resume<Traits: KernelTraits>(id: Id) -> Result<(), ResumeTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let task = task_cb::<Traits>(id)?;

    match *task.st.read(&*lock) {
        TaskSt::Vacant => Err(BadIdError::BadId.into()),
        TaskSt::Suspended => {
            trace::record::<Traits>(
                lock.borrow_mut(),
                trace::Event::TaskResumed,
                id.get() as u32,
                0,
            );
            // Safety: the task was Suspended; its saved context is intact
            unsafe { make_ready(lock.borrow_mut(), task) };
            unlock_cpu_and_check_preemption(lock);
            Ok(())
        }
        _ => Err(ResumeTaskError::BadObjectState),
    }
}

// ---------------------------------------------------------------------------
// Priority

fn set_task_base_priority<Traits: KernelTraits>(
    id: Id,
    base_priority: Priority,
) -> Result<(), SetTaskPriorityError> {
    if base_priority == 0 || base_priority as usize >= Traits::NUM_TASK_PRIORITY_LEVELS {
        return Err(SetTaskPriorityError::BadParam);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;
    let task = task_cb::<Traits>(id)?;

    let st = *task.st.read(&*lock);
    if matches!(st, TaskSt::Vacant | TaskSt::Terminated) {
        return Err(SetTaskPriorityError::BadObjectState);
    }

    let old_base = task.base_priority.replace(&mut *lock, base_priority);
    if old_base == base_priority {
        return Ok(());
    }

    // Recalculate the effective priority: the base, raised by the
    // inheritance floors of any held mutexes
    let effective =
        mutex::evaluate_task_effective_priority(lock.borrow_mut(), task, base_priority);
    let old_effective = task.effective_priority.replace(&mut *lock, effective);

    if old_effective == effective {
        return Ok(());
    }

    match st {
        TaskSt::Ready => {
            let core = task.assigned_core.get(&*lock) as usize;
            Traits::state()
                .core(core)
                .ready
                .reorder_task(lock.borrow_mut(), task, effective);
        }
        TaskSt::Running | TaskSt::Suspended => {}
        TaskSt::Waiting => {
            wait::reorder_wait_of_task(lock.borrow_mut(), task, effective);
            // If the task is waiting on a mutex, its new priority may have
            // to propagate to the mutex owner
            mutex::on_waiter_priority_changed(lock.borrow_mut(), task);
        }
        TaskSt::Vacant | TaskSt::Terminated => unreachable!(),
    }

    if matches!(st, TaskSt::Running | TaskSt::Ready) {
        // Lowering the running task's priority or raising a Ready task's may
        // call for a dispatch
        unlock_cpu_and_check_preemption(lock);
    }
    Ok(())
}

fn stats<Traits: KernelTraits>(id: Id) -> Result<TaskStats, BadIdError> {
    let lock = match klock::lock_cpu::<Traits>() {
        Ok(lock) => lock,
        Err(_) => return Err(BadIdError::BadId),
    };
    let task = task_cb::<Traits>(id)?;
    if *task.st.read(&*lock) == TaskSt::Vacant {
        return Err(BadIdError::BadId);
    }

    // Safety: CPU Lock active
    let attr = unsafe { task.attr() };

    Ok(TaskStats {
        state: *task.st.read(&*lock),
        base_priority: task.base_priority.get(&*lock),
        effective_priority: task.effective_priority.get(&*lock),
        switches: task.switches.get(&*lock),
        cpu_ticks: task.cpu_ticks.get(&*lock),
        stack_high_water: stack_high_water(&attr.stack),
        stack_size: attr.stack.len(),
    })
}

/// Measure how much of `stack` has ever been used by scanning for the first
/// byte that no longer holds the fill pattern. Stacks grow downward.
pub(crate) fn stack_high_water(stack: &Region) -> usize {
    if stack.is_null() {
        return 0;
    }
    let mut untouched = 0;
    while untouched < stack.len() {
        // Safety: within the region, which is valid while the task exists
        let byte = unsafe { stack.base().add(untouched).read() };
        if byte != STACK_FILL {
            break;
        }
        untouched += 1;
    }
    stack.len() - untouched
}

// ---------------------------------------------------------------------------
// Scheduler core

/// Transition the task into the Ready state and enqueue it on its core,
/// ringing the doorbell if that's not the current core. This function
/// doesn't do any cleanup for a previous state.
///
/// # Safety
///
/// The task's execution state must be valid (freshly initialized, or
/// previously saved by a context switch).
pub(super) unsafe fn make_ready<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    task.st.replace(&mut *lock, TaskSt::Ready);

    let core = smp::assign_core_for_ready(lock.borrow_mut(), task);
    let prio = task.effective_priority.get(&*lock);
    Traits::state()
        .core(core)
        .ready
        .push_back_task(lock.borrow_mut(), task, prio);

    trace::record::<Traits>(
        lock.borrow_mut(),
        trace::Event::TaskReady,
        task_ref_to_id::<Traits>(task).get() as u32,
        core as u32,
    );

    if core != Traits::core_id() {
        // Safety: waking another core is always permissible under CPU Lock
        unsafe { Traits::notify_core(core) };
    }
}

/// Relinquish CPU Lock. After that, if there's a Ready task outranking the
/// current one on this core, call `yield_cpu`.
///
/// Kernel services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(super) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
) {
    // Nothing to dispatch before `System::start` takes over
    if !Traits::state()
        .started
        .load(core::sync::atomic::Ordering::Relaxed)
    {
        return;
    }

    let core_state = Traits::state().core(Traits::core_id());

    let prev_task_priority = match core_state.running_task() {
        Some(task) if *task.st.read(&*lock) == TaskSt::Running => {
            Some(task.effective_priority.get(&*lock))
        }
        _ => None,
    };

    let has_preempting_task = core_state
        .ready
        .has_ready_task_above(lock.borrow_mut(), prev_task_priority);

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Implements `PortToKernel::choose_running_task` for one core.
pub(super) fn choose_next_running_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    core: usize,
) {
    let core_state = Traits::state().core(core);
    let prev_running_task = core_state.running_task();

    let prev_task_priority = match prev_running_task {
        Some(task) if *task.st.read(&*lock) == TaskSt::Running => {
            Some(task.effective_priority.get(&*lock))
        }
        _ => None,
    };

    let decision = core_state
        .ready
        .pop_front_task(lock.borrow_mut(), prev_task_priority);

    let next_running_task = match decision {
        ScheduleDecision::SwitchTo(task) => task,
        // There's no task willing to take over, and the current one can
        // still run
        ScheduleDecision::Keep => return,
    };

    if let Some(task) = next_running_task {
        task.st.replace(&mut *lock, TaskSt::Running);

        if prev_running_task.map_or(false, |prev| core::ptr::eq(prev, task)) {
            // Nothing further to do if the same task was re-elected
            return;
        }

        task.switches
            .replace_with(&mut *lock, |x| x.wrapping_add(1));
        core_state
            .switches
            .replace_with(&mut *lock, |x| x.wrapping_add(1));
    }

    // `prev_running_task` now loses control of the processor
    if let Some(prev) = prev_running_task {
        if *prev.st.read(&*lock) == TaskSt::Running {
            // Preempted while still runnable
            // Safety: the task was Running; its context is being saved by
            // the dispatcher right now
            unsafe { make_ready(lock.borrow_mut(), prev) };
        }

        // Outgoing task stack check: canary intact and saved SP in bounds
        check_stack::<Traits>(lock.borrow_mut(), prev);
    }

    trace::record::<Traits>(
        lock.borrow_mut(),
        trace::Event::Switch,
        next_running_task.map_or(0, |t| task_ref_to_id::<Traits>(t).get() as u32),
        core as u32,
    );

    core_state.set_running_task(next_running_task);
}

/// Verify the outgoing task's stack canary and saved stack pointer.
/// A violation is a fatal per-task error.
fn check_stack<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    // Safety: CPU Lock active
    let stack = unsafe { task.attr() }.stack;
    if stack.is_null() {
        return;
    }

    // Safety: the canary word lies within the task's stack region
    let canary = unsafe { (stack.base() as *const u32).read() };
    let sp_ok = match Traits::saved_stack_pointer(task) {
        Some(sp) => sp >= stack.base() as usize && sp <= stack.base() as usize + stack.len(),
        None => true,
    };

    if canary != STACK_CANARY || !sp_ok {
        let id = task_ref_to_id::<Traits>(task);
        let hook = Traits::state().cfg.read(&*lock).stack_overflow_hook;
        if let Some(hook) = hook {
            hook(id);
        }
        crate::error::fatal_in_place::<Traits>(
            lock.borrow_mut(),
            ErrorCode::StackOverflow,
            id.get() as u32,
        );
    }
}

/// Transition the currently running task into the Waiting state. Returns
/// when the task is woken up.
pub(super) fn wait_until_woken_up<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    // Transition the current task to Waiting
    let running_task = running_task_on_current_core::<Traits>(lock.borrow_mut()).unwrap();
    debug_assert_eq!(*running_task.st.read(&*lock), TaskSt::Running);
    running_task.st.replace(&mut *lock, TaskSt::Waiting);

    trace::record::<Traits>(
        lock.borrow_mut(),
        trace::Event::TaskBlocked,
        task_ref_to_id::<Traits>(running_task).get() as u32,
        0,
    );

    loop {
        // Temporarily release CPU Lock before calling `yield_cpu`
        // Safety: (1) we don't access resources protected by CPU Lock,
        //         (2) we currently have CPU Lock, and (3) we re-acquire it
        //         before returning from this function
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        if *running_task.st.read(&*lock) == TaskSt::Running {
            break;
        }

        debug_assert_eq!(*running_task.st.read(&*lock), TaskSt::Waiting);
    }
}

/// Rotate the running task of every core to the back of its priority FIFO
/// if another task of equal priority is Ready (round-robin; time slice is
/// one tick).
pub(super) fn round_robin_tick<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    for core in 0..Traits::NUM_CORES {
        let core_state = Traits::state().core(core);
        let task = match core_state.running_task() {
            Some(task) if *task.st.read(&*lock) == TaskSt::Running => task,
            _ => continue,
        };

        // Charge one tick of CPU time to the task observed running
        task.cpu_ticks
            .replace_with(&mut *lock, |x| x.wrapping_add(1));

        let prio = task.effective_priority.get(&*lock);
        if !core_state.ready.has_task_at(lock.borrow_mut(), prio) {
            continue;
        }

        task.st.replace(&mut *lock, TaskSt::Ready);
        core_state
            .ready
            .push_back_task(lock.borrow_mut(), task, prio);

        if core != Traits::core_id() {
            // Safety: under CPU Lock
            unsafe { Traits::notify_core(core) };
        }
        // For the local core, the caller (the tick handler) requests a
        // dispatch when it releases CPU Lock
    }
}
