//! Error taxonomy, last-error record, and the bounded error history.
//!
//! Errors are split into three response tiers:
//!
//! 1. *Recoverable, expected* (timeout, `QueueFull` with [`NO_WAIT`], ...):
//!    returned to the caller, never recorded.
//! 2. *Recoverable, anomalous* (pool exhaustion, allocation failure): logged
//!    to the error ring with code, task id, location, and a context word;
//!    the caller receives a distinct error code.
//! 3. *Unrecoverable* (unlock of a foreign mutex, blocking call from an
//!    interrupt handler, stack overflow): routed through [`fatal`], which
//!    records the error, invokes the registered error hook, and halts.
//!
//! [`NO_WAIT`]: crate::NO_WAIT
use core::{borrow::BorrowMut, fmt, panic::Location};

use crate::{
    klock::{CpuLockCell, CpuLockGuard},
    utils::Init,
    Id, KernelTraits, Ticks,
};

/// The numeric error code taxonomy. Codes are partitioned into ranges by
/// [`ErrorCategory`].
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCode {
    // Task errors (100–199)
    TaskPoolExhausted = 100,
    BadTaskState = 101,
    SelfSuspend = 102,
    StackTooSmall = 103,
    BadPriority = 104,

    // Memory errors (200–299)
    PoolExhausted = 200,
    BadRegion = 201,
    OutOfMemory = 202,

    // Synchronization errors (300–399)
    Timeout = 300,
    QueueFull = 301,
    QueueEmpty = 302,
    SemaphoreOverflow = 303,
    NotOwner = 304,
    MutexNotLocked = 305,
    SyncPoolExhausted = 306,
    MessageTooLarge = 307,
    IpcFull = 308,
    Busy = 309,

    // System errors (400–499)
    NotReady = 400,
    AlreadyInited = 401,
    BadContext = 402,
    NoAccess = 403,
    BadParam = 404,
    BadObjectState = 405,

    // Hardware errors (500–599)
    StackOverflow = 500,
    IsrBlockingCall = 501,
    StackWatermarkAlert = 502,
    CpuLoadAlert = 503,
    HeapUsageAlert = 504,

    // Configuration errors (600–699)
    BadTickRate = 600,
    BadConfig = 601,
}

impl ErrorCode {
    /// The category this code's numeric range belongs to.
    pub fn category(self) -> ErrorCategory {
        match self as u16 / 100 {
            1 => ErrorCategory::Task,
            2 => ErrorCategory::Memory,
            3 => ErrorCategory::Sync,
            4 => ErrorCategory::System,
            5 => ErrorCategory::Hardware,
            _ => ErrorCategory::Config,
        }
    }

    /// A short static description of the code.
    pub fn description(self) -> &'static str {
        match self {
            Self::TaskPoolExhausted => "task pool exhausted",
            Self::BadTaskState => "operation invalid in the task's current state",
            Self::SelfSuspend => "a task may not suspend itself",
            Self::StackTooSmall => "stack region too small or misaligned",
            Self::BadPriority => "priority out of range",
            Self::PoolExhausted => "block pool exhausted",
            Self::BadRegion => "invalid storage region",
            Self::OutOfMemory => "allocation failed",
            Self::Timeout => "operation timed out",
            Self::QueueFull => "queue full",
            Self::QueueEmpty => "queue empty",
            Self::SemaphoreOverflow => "semaphore given past its maximum",
            Self::NotOwner => "mutex released by a task that does not own it",
            Self::MutexNotLocked => "mutex released while unlocked",
            Self::SyncPoolExhausted => "synchronization object pool exhausted",
            Self::MessageTooLarge => "message exceeds buffer capacity",
            Self::IpcFull => "inter-core message ring full",
            Self::Busy => "object is owned by another task",
            Self::NotReady => "kernel not initialized",
            Self::AlreadyInited => "kernel already initialized",
            Self::BadContext => "operation not allowed in the current context",
            Self::NoAccess => "invalid or dangling object id",
            Self::BadParam => "invalid parameter",
            Self::BadObjectState => "operation invalid in the object's current state",
            Self::StackOverflow => "stack overflow detected",
            Self::IsrBlockingCall => "blocking call from an interrupt handler",
            Self::StackWatermarkAlert => "stack high-water mark above threshold",
            Self::CpuLoadAlert => "cpu load above threshold",
            Self::HeapUsageAlert => "heap usage above threshold",
            Self::BadTickRate => "tick rate out of the supported range",
            Self::BadConfig => "invalid configuration",
        }
    }
}

/// Error category, derived from the numeric range of an [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Task = 0,
    Memory = 1,
    Sync = 2,
    System = 3,
    Hardware = 4,
    Config = 5,
}

pub(crate) const NUM_CATEGORIES: usize = 6;

/// A recorded kernel error.
#[derive(Debug, Clone, Copy)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    /// The task that was running when the error was recorded.
    pub task: Option<Id>,
    /// The kernel tick at which the error was recorded.
    pub tick: Ticks,
    /// The source location that reported the error.
    pub location: Option<&'static Location<'static>>,
    /// A free-form context word (object id, measured value, ...).
    pub context: u32,
}

impl Init for ErrorRecord {
    const INIT: Self = Self {
        code: ErrorCode::BadParam,
        task: None,
        tick: 0,
        location: None,
        context: 0,
    };
}

/// Per-category error counters, indexed by [`ErrorCategory`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorStats {
    pub counts: [u32; NUM_CATEGORIES],
}

// ---------------------------------------------------------------------------
// Per-operation error types

macro_rules! define_error {
    (
        $( #[doc = $doc:expr] )*
        pub enum $Name:ident {
            $(
                $( #[doc = $vdoc:expr] )*
                $Variant:ident => $code:expr,
            )*
        }
    ) => {
        $( #[doc = $doc] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $Name {
            $(
                $( #[doc = $vdoc] )*
                $Variant,
            )*
        }

        impl From<$Name> for ErrorCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => $code ),*
                }
            }
        }
    };
}

define_error! {
    /// Error type for [`System::init`](crate::System::init).
    pub enum InitError {
        AlreadyInited => ErrorCode::AlreadyInited,
        BadTickRate => ErrorCode::BadTickRate,
        BadConfig => ErrorCode::BadConfig,
        BadContext => ErrorCode::BadContext,
    }
}

define_error! {
    /// Error type for [`Task::create`](crate::task::Task::create).
    pub enum CreateTaskError {
        PoolExhausted => ErrorCode::TaskPoolExhausted,
        BadPriority => ErrorCode::BadPriority,
        StackTooSmall => ErrorCode::StackTooSmall,
        BadParam => ErrorCode::BadParam,
        BadContext => ErrorCode::BadContext,
    }
}

define_error! {
    /// Error type for [`Task::delete`](crate::task::Task::delete).
    pub enum DeleteTaskError {
        BadId => ErrorCode::NoAccess,
        BadObjectState => ErrorCode::BadTaskState,
        BadContext => ErrorCode::BadContext,
    }
}

define_error! {
    /// Error type for [`Task::suspend`](crate::task::Task::suspend).
    pub enum SuspendTaskError {
        BadId => ErrorCode::NoAccess,
        BadObjectState => ErrorCode::BadTaskState,
        SelfSuspend => ErrorCode::SelfSuspend,
        BadContext => ErrorCode::BadContext,
    }
}

define_error! {
    /// Error type for [`Task::resume`](crate::task::Task::resume).
    pub enum ResumeTaskError {
        BadId => ErrorCode::NoAccess,
        BadObjectState => ErrorCode::BadTaskState,
        BadContext => ErrorCode::BadContext,
    }
}

define_error! {
    /// Error type for [`Task::set_priority`](crate::task::Task::set_priority).
    pub enum SetTaskPriorityError {
        BadId => ErrorCode::NoAccess,
        BadParam => ErrorCode::BadPriority,
        BadObjectState => ErrorCode::BadTaskState,
        BadContext => ErrorCode::BadContext,
    }
}

define_error! {
    /// Error type for [`task::delay`](crate::task::delay).
    pub enum SleepError {
        BadParam => ErrorCode::BadParam,
        BadContext => ErrorCode::BadContext,
    }
}

define_error! {
    /// Error type for the `create` operation of synchronization objects.
    pub enum CreateSyncError {
        PoolExhausted => ErrorCode::SyncPoolExhausted,
        BadParam => ErrorCode::BadParam,
        BadContext => ErrorCode::BadContext,
    }
}

define_error! {
    /// Error type for [`Mutex::lock`](crate::mutex::Mutex::lock).
    pub enum LockMutexError {
        BadId => ErrorCode::NoAccess,
        BadContext => ErrorCode::BadContext,
        Timeout => ErrorCode::Timeout,
    }
}

define_error! {
    /// Error type for [`Mutex::try_lock`](crate::mutex::Mutex::try_lock).
    pub enum TryLockMutexError {
        BadId => ErrorCode::NoAccess,
        BadContext => ErrorCode::BadContext,
        /// The mutex is held by another task.
        Busy => ErrorCode::Busy,
    }
}

define_error! {
    /// Error type for [`Mutex::unlock`](crate::mutex::Mutex::unlock).
    ///
    /// Releasing a mutex the calling task does not own is not an error the
    /// caller can observe - it is a tier-3 fault and never returns.
    pub enum UnlockMutexError {
        BadId => ErrorCode::NoAccess,
        BadContext => ErrorCode::BadContext,
    }
}

define_error! {
    /// Error type for [`Semaphore::take`](crate::semaphore::Semaphore::take).
    pub enum TakeSemaphoreError {
        BadId => ErrorCode::NoAccess,
        BadContext => ErrorCode::BadContext,
        Timeout => ErrorCode::Timeout,
    }
}

define_error! {
    /// Error type for [`Semaphore::give`](crate::semaphore::Semaphore::give).
    pub enum GiveSemaphoreError {
        BadId => ErrorCode::NoAccess,
        BadContext => ErrorCode::BadContext,
        /// The semaphore already holds its maximum count.
        Overflow => ErrorCode::SemaphoreOverflow,
    }
}

define_error! {
    /// Error type for [`Queue::send`](crate::queue::Queue::send).
    pub enum SendQueueError {
        BadId => ErrorCode::NoAccess,
        BadContext => ErrorCode::BadContext,
        /// The item length does not match the queue's item size.
        BadParam => ErrorCode::BadParam,
        Timeout => ErrorCode::Timeout,
        /// The queue was full and the operation was non-blocking.
        QueueFull => ErrorCode::QueueFull,
    }
}

define_error! {
    /// Error type for [`Queue::receive`](crate::queue::Queue::receive).
    pub enum ReceiveQueueError {
        BadId => ErrorCode::NoAccess,
        BadContext => ErrorCode::BadContext,
        /// The buffer length does not match the queue's item size.
        BadParam => ErrorCode::BadParam,
        Timeout => ErrorCode::Timeout,
        /// The queue was empty and the operation was non-blocking.
        QueueEmpty => ErrorCode::QueueEmpty,
    }
}

define_error! {
    /// Error type for [`EventGroup::set`](crate::event_group::EventGroup::set)
    /// and [`EventGroup::clear`](crate::event_group::EventGroup::clear).
    pub enum UpdateEventGroupError {
        BadId => ErrorCode::NoAccess,
        BadContext => ErrorCode::BadContext,
    }
}

define_error! {
    /// Error type for [`EventGroup::wait`](crate::event_group::EventGroup::wait).
    pub enum WaitEventGroupError {
        BadId => ErrorCode::NoAccess,
        BadContext => ErrorCode::BadContext,
        Timeout => ErrorCode::Timeout,
    }
}

define_error! {
    /// Error type for [`StreamBuffer::send`](crate::stream_buffer::StreamBuffer::send).
    pub enum SendStreamError {
        BadId => ErrorCode::NoAccess,
        BadContext => ErrorCode::BadContext,
        Timeout => ErrorCode::Timeout,
        /// The message can never fit the buffer.
        MessageTooLarge => ErrorCode::MessageTooLarge,
    }
}

define_error! {
    /// Error type for [`StreamBuffer::receive`](crate::stream_buffer::StreamBuffer::receive).
    pub enum ReceiveStreamError {
        BadId => ErrorCode::NoAccess,
        BadContext => ErrorCode::BadContext,
        Timeout => ErrorCode::Timeout,
        /// The destination is too small for the next framed message.
        BadParam => ErrorCode::BadParam,
    }
}

define_error! {
    /// Error type for [`Timer`](crate::timer::Timer) operations.
    pub enum TimerError {
        BadId => ErrorCode::NoAccess,
        BadContext => ErrorCode::BadContext,
        BadParam => ErrorCode::BadParam,
    }
}

define_error! {
    /// Error type for [`ipc::send`](crate::ipc::send).
    pub enum IpcSendError {
        BadParam => ErrorCode::BadParam,
        BadContext => ErrorCode::BadContext,
        Timeout => ErrorCode::Timeout,
        /// The destination ring was full and the operation was non-blocking.
        IpcFull => ErrorCode::IpcFull,
    }
}

define_error! {
    /// Error type for [`ipc::receive`](crate::ipc::receive).
    pub enum IpcReceiveError {
        BadContext => ErrorCode::BadContext,
        Timeout => ErrorCode::Timeout,
        /// The ring was empty and the operation was non-blocking.
        QueueEmpty => ErrorCode::QueueEmpty,
    }
}

define_error! {
    /// Error type for [`System::acquire_cpu_lock`](crate::System::acquire_cpu_lock).
    pub enum CpuLockError {
        BadContext => ErrorCode::BadContext,
    }
}

define_error! {
    /// Error type for [`BlockPool`](crate::mem::BlockPool) operations.
    pub enum PoolError {
        Exhausted => ErrorCode::PoolExhausted,
        BadParam => ErrorCode::BadRegion,
    }
}

define_error! {
    /// `BadParam`
    pub enum BadParamError {
        BadParam => ErrorCode::BadParam,
    }
}

// ---------------------------------------------------------------------------
// Internal sub-errors shared by many operations

macro_rules! define_suberror {
    (
        $( #[doc = $doc:expr] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $Variant:ident,
        }
    ) => {
        $( #[doc = $doc] )*
        #[derive(Debug, PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $Variant,
        }

        $(
            impl From<$Name> for $Supererror {
                #[inline]
                fn from(_: $Name) -> Self {
                    Self::$Variant
                }
            }
        )*
    };
}

define_suberror! {
    /// `BadContext`
    #[into(InitError)]
    #[into(CreateTaskError)]
    #[into(DeleteTaskError)]
    #[into(SuspendTaskError)]
    #[into(ResumeTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(SleepError)]
    #[into(CreateSyncError)]
    #[into(LockMutexError)]
    #[into(TryLockMutexError)]
    #[into(UnlockMutexError)]
    #[into(TakeSemaphoreError)]
    #[into(GiveSemaphoreError)]
    #[into(SendQueueError)]
    #[into(ReceiveQueueError)]
    #[into(UpdateEventGroupError)]
    #[into(WaitEventGroupError)]
    #[into(SendStreamError)]
    #[into(ReceiveStreamError)]
    #[into(TimerError)]
    #[into(IpcSendError)]
    #[into(IpcReceiveError)]
    #[into(CpuLockError)]
    pub enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadId`
    #[into(DeleteTaskError)]
    #[into(SuspendTaskError)]
    #[into(ResumeTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(LockMutexError)]
    #[into(TryLockMutexError)]
    #[into(UnlockMutexError)]
    #[into(TakeSemaphoreError)]
    #[into(GiveSemaphoreError)]
    #[into(SendQueueError)]
    #[into(ReceiveQueueError)]
    #[into(UpdateEventGroupError)]
    #[into(WaitEventGroupError)]
    #[into(SendStreamError)]
    #[into(ReceiveStreamError)]
    #[into(TimerError)]
    pub enum BadIdError {
        BadId,
    }
}

define_suberror! {
    /// `Timeout`
    #[into(LockMutexError)]
    #[into(TakeSemaphoreError)]
    #[into(SendQueueError)]
    #[into(ReceiveQueueError)]
    #[into(WaitEventGroupError)]
    #[into(SendStreamError)]
    #[into(ReceiveStreamError)]
    #[into(IpcSendError)]
    #[into(IpcReceiveError)]
    pub(crate) enum TimeoutError {
        Timeout,
    }
}

// ---------------------------------------------------------------------------
// Recording

pub(crate) struct ErrorGlobals<Traits: crate::KernelCfg2> {
    /// The most recently recorded error.
    last: CpuLockCell<Traits, Option<ErrorRecord>>,

    /// Bounded history of recorded errors, oldest overwritten first.
    ring: CpuLockCell<Traits, HistoryRing<Traits>>,

    /// Per-category counters.
    counts: CpuLockCell<Traits, [u32; NUM_CATEGORIES]>,
}

impl<Traits: crate::KernelCfg2> Init for ErrorGlobals<Traits> {
    const INIT: Self = Self {
        last: Init::INIT,
        ring: Init::INIT,
        counts: Init::INIT,
    };
}

struct HistoryRing<Traits: crate::KernelCfg2> {
    slots: Traits::ErrorRing,
    /// The next slot to overwrite.
    next: usize,
    len: usize,
}

impl<Traits: crate::KernelCfg2> Init for HistoryRing<Traits> {
    const INIT: Self = Self {
        slots: Init::INIT,
        next: 0,
        len: 0,
    };
}

impl<Traits: crate::KernelCfg2> HistoryRing<Traits> {
    fn push(&mut self, record: ErrorRecord) {
        let slots = self.slots.borrow_mut();
        if slots.is_empty() {
            return;
        }
        slots[self.next] = record;
        self.next = (self.next + 1) % slots.len();
        if self.len < slots.len() {
            self.len += 1;
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for ErrorGlobals<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ErrorGlobals")
            .field("last", &self.last)
            .field("counts", &self.counts)
            .finish_non_exhaustive()
    }
}

/// Record a tier-2 (recoverable, anomalous) error.
#[track_caller]
pub(crate) fn record<Traits: KernelTraits>(
    lock: crate::klock::CpuLockTokenRefMut<'_, Traits>,
    code: ErrorCode,
    context: u32,
) {
    record_inner::<Traits>(lock, code, context, Location::caller());
}

fn record_inner<Traits: KernelTraits>(
    mut lock: crate::klock::CpuLockTokenRefMut<'_, Traits>,
    code: ErrorCode,
    context: u32,
    location: &'static Location<'static>,
) {
    let state = Traits::state();
    let record = ErrorRecord {
        code,
        task: crate::task::current_task_id::<Traits>((*lock).borrow_mut()),
        tick: state.time.tick_count((*lock).borrow_mut()),
        location: Some(location),
        context,
    };

    log::error!(
        "kernel error {}: {} (context {:#x})",
        code as u16,
        code.description(),
        context
    );

    let globals = &state.errors;
    globals.last.replace(&mut *lock, Some(record));
    globals.ring.write(&mut *lock).push(record);
    let counts = globals.counts.write(&mut *lock);
    counts[code.category() as usize] = counts[code.category() as usize].saturating_add(1);
}

/// Record a tier-3 (unrecoverable) error, invoke the error hook, and halt.
///
/// The kernel does not attempt to continue in a potentially inconsistent
/// state.
#[track_caller]
pub(crate) fn fatal<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    code: ErrorCode,
    context: u32,
) -> ! {
    record_inner::<Traits>(lock.borrow_mut(), code, context, Location::caller());

    let record = Traits::state().errors.last.get(&*lock).unwrap();
    let hook = Traits::state().cfg.read(&*lock).error_hook;

    // Release CPU Lock so that the hook runs with interrupts enabled. The
    // system is going down; nothing else will touch kernel state.
    drop(lock);

    if let Some(hook) = hook {
        hook(&record);
    }

    Traits::halt()
}

/// Like [`fatal`], for call sites that only hold a borrowed CPU Lock token.
/// The error hook runs with interrupts still masked; the system is halting
/// either way.
#[track_caller]
pub(crate) fn fatal_in_place<Traits: KernelTraits>(
    mut lock: crate::klock::CpuLockTokenRefMut<'_, Traits>,
    code: ErrorCode,
    context: u32,
) -> ! {
    record_inner::<Traits>((*lock).borrow_mut(), code, context, Location::caller());

    let record = Traits::state().errors.last.get(&*lock).unwrap();
    if let Some(hook) = Traits::state().cfg.read(&*lock).error_hook {
        hook(&record);
    }

    Traits::halt()
}

/// Implements `System::last_error`.
pub(crate) fn last_error<Traits: KernelTraits>() -> Option<ErrorRecord> {
    let lock = crate::klock::lock_cpu::<Traits>().ok()?;
    Traits::state().errors.last.get(&*lock)
}

/// Implements `System::error_stats`.
pub(crate) fn stats<Traits: KernelTraits>() -> ErrorStats {
    if let Ok(lock) = crate::klock::lock_cpu::<Traits>() {
        ErrorStats {
            counts: Traits::state().errors.counts.get(&*lock),
        }
    } else {
        ErrorStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_ranges() {
        assert_eq!(ErrorCode::TaskPoolExhausted.category(), ErrorCategory::Task);
        assert_eq!(ErrorCode::OutOfMemory.category(), ErrorCategory::Memory);
        assert_eq!(ErrorCode::Timeout.category(), ErrorCategory::Sync);
        assert_eq!(ErrorCode::BadContext.category(), ErrorCategory::System);
        assert_eq!(ErrorCode::StackOverflow.category(), ErrorCategory::Hardware);
        assert_eq!(ErrorCode::BadTickRate.category(), ErrorCategory::Config);
    }

    #[test]
    fn suberror_fanout() {
        assert_eq!(
            LockMutexError::from(BadContextError::BadContext),
            LockMutexError::BadContext
        );
        assert_eq!(
            SendQueueError::from(TimeoutError::Timeout),
            SendQueueError::Timeout
        );
        assert_eq!(ErrorCode::from(GiveSemaphoreError::Overflow), ErrorCode::SemaphoreOverflow);
    }

    #[test]
    fn every_code_has_a_description() {
        for code in [
            ErrorCode::TaskPoolExhausted,
            ErrorCode::Timeout,
            ErrorCode::StackOverflow,
            ErrorCode::BadTickRate,
        ] {
            assert!(!code.description().is_empty());
        }
    }
}
