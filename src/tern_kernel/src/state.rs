//! Execution-context checks.
use crate::{
    error::{BadContextError, ErrorCode},
    klock, KernelTraits,
};

/// If the current context is not a task context, return `Err(BadContext)`.
pub(super) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// Ensure the current context may perform a blocking operation.
///
/// A blocking call from an interrupt handler cannot be honored and cannot be
/// safely ignored either, so it is a tier-3 fault (the kernel would
/// otherwise corrupt the interrupted task's wait state). Non-task,
/// non-interrupt contexts (the startup code) get a plain `BadContext`.
pub(super) fn expect_waitable_context<Traits: KernelTraits>(
    lock: klock::CpuLockGuard<Traits>,
) -> Result<klock::CpuLockGuard<Traits>, BadContextError> {
    if Traits::is_interrupt_context() {
        crate::error::fatal::<Traits>(lock, ErrorCode::IsrBlockingCall, 0);
    }
    if !Traits::is_task_context() {
        return Err(BadContextError::BadContext);
    }
    Ok(lock)
}
