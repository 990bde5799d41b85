//! Kernel behavior tests, one simulated kernel instance per module.
pub mod utils;

mod event_group_wait_all;
mod ipc_loopback;
mod mutex_priority_inheritance;
mod queue_fifo_handoff;
mod semaphore_wake_order;
mod stream_buffer_trigger;
mod suspend_resume;
mod task_exit_reap;
mod timeout_preserves_invariants;
mod timer_dispatch;
mod yield_round_robin;
