//! RP2040 (dual-core Arm Cortex-M0+) port for the Tern kernel.
//!
//! The port owns the hardware resources the kernel contract reserves:
//!
//! - **PendSV** - the context-switch exception, configured to the lowest
//!   priority on both cores so it can never preempt another handler.
//! - **SVCall** - used once per core to dispatch the first task.
//! - **SysTick (core 0)** - the kernel tick, clocked from the 1 MHz
//!   watchdog tick reference.
//! - **SIO spinlock 31** - the kernel spinlock backing cross-core CPU Lock.
//! - **The inter-core FIFOs and `SIO_IRQ_PROC{0,1}`** - the reschedule
//!   doorbell.
//! - **TIMER** - the 64-bit 1 µs clock behind `System::time_us`.
//! - Optionally the watchdog, through [`watchdog`].
//!
//! Everything else is the application's.
#![cfg_attr(target_os = "none", no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(target_os = "none")]
mod clock;
#[cfg(target_os = "none")]
mod mc;
#[cfg(target_os = "none")]
mod threading;
#[cfg(target_os = "none")]
pub mod watchdog;

#[cfg(target_os = "none")]
pub use self::{
    clock::init_clock,
    mc::{core1_launch, enable_core0_doorbell},
    threading::{enter_critical, exit_critical, TaskState},
};

/// Port tuning knobs, implemented on the kernel trait type alongside
/// [`use_port!`].
pub trait PortOptions {
    /// The interrupt (MSP) stack size reserved for core 1. Core 0's MSP
    /// stack comes from the linker script as usual.
    const CORE1_STACK_SIZE: usize = 2048;

    /// Let the idle tasks execute `wfi`. Disable when attaching a debugger
    /// that dislikes sleeping cores.
    const USE_WFI: bool = true;
}

/// Bind this port to a kernel trait type: implements [`PortThreading`] and
/// [`PortTimer`] and installs the `PendSV`, `SVCall`, `SysTick`, and
/// `SIO_IRQ_PROC{0,1}` handlers.
///
/// ```ignore
/// tern_kernel::build! { pub struct SystemTraits; /* ... */ }
/// tern_port_rp2040::use_port!(unsafe SystemTraits);
/// impl tern_port_rp2040::PortOptions for SystemTraits {}
/// ```
///
/// # Safety
///
/// The macro installs exception handlers by symbol name; the application
/// must not define any of them elsewhere, and must apply the macro to
/// exactly one type.
///
/// [`PortThreading`]: tern_kernel::PortThreading
/// [`PortTimer`]: tern_kernel::PortTimer
#[cfg(target_os = "none")]
#[macro_export]
macro_rules! use_port {
    (unsafe $Traits:ty) => {
        const _: () = {
            use $crate::{imp, PortOptions};
            use tern_kernel::{PortThreading, PortTimer, PortToKernel};

            unsafe impl PortThreading for $Traits {
                type PortTaskState = imp::TaskState;

                unsafe fn dispatch_first_task() -> ! {
                    // Safety: forwarded contract
                    unsafe { imp::dispatch_first_task::<$Traits>() }
                }

                unsafe fn yield_cpu() {
                    // Safety: forwarded contract
                    unsafe { imp::yield_cpu() }
                }

                unsafe fn exit_and_dispatch(
                    _task: &'static tern_kernel::TaskCb<Self>,
                ) -> ! {
                    // Safety: forwarded contract
                    unsafe { imp::exit_and_dispatch::<$Traits>() }
                }

                unsafe fn enter_cpu_lock() {
                    // Safety: forwarded contract
                    unsafe { imp::enter_cpu_lock::<$Traits>() }
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    // Safety: forwarded contract
                    unsafe { imp::try_enter_cpu_lock::<$Traits>() }
                }

                unsafe fn leave_cpu_lock() {
                    // Safety: forwarded contract
                    unsafe { imp::leave_cpu_lock::<$Traits>() }
                }

                unsafe fn initialize_task_state(task: &'static tern_kernel::TaskCb<Self>) {
                    // Safety: forwarded contract
                    unsafe { imp::initialize_task_state::<$Traits>(task) }
                }

                fn is_cpu_lock_active() -> bool {
                    imp::is_cpu_lock_active::<$Traits>()
                }

                fn is_task_context() -> bool {
                    imp::is_task_context()
                }

                fn is_interrupt_context() -> bool {
                    imp::is_interrupt_context()
                }

                fn saved_stack_pointer(task: &tern_kernel::TaskCb<Self>) -> Option<usize> {
                    Some(imp::saved_stack_pointer(&task.port_task_state))
                }

                fn core_id() -> usize {
                    imp::core_id()
                }

                unsafe fn notify_core(core: usize) {
                    // Safety: forwarded contract
                    unsafe { imp::notify_core(core) }
                }

                unsafe fn start_secondary_core() {
                    // Safety: forwarded contract
                    unsafe { $crate::core1_launch::<$Traits>() }
                }

                fn halt() -> ! {
                    imp::halt()
                }
            }

            impl PortTimer for $Traits {
                unsafe fn start_tick(rate_hz: u32) {
                    // Safety: forwarded contract
                    unsafe { imp::start_systick(rate_hz) }
                }

                unsafe fn hires_us() -> u64 {
                    imp::timer_us()
                }

                fn idle_wait() {
                    if <$Traits as PortOptions>::USE_WFI {
                        imp::wfi();
                    }
                }
            }

            #[unsafe(naked)]
            #[no_mangle]
            unsafe extern "C" fn PendSV() {
                core::arch::naked_asm!(
                    "ldr r0, ={handler}",
                    "bx r0",
                    handler = sym imp::handle_pend_sv::<$Traits>,
                );
            }

            #[unsafe(naked)]
            #[no_mangle]
            unsafe extern "C" fn SVCall() {
                core::arch::naked_asm!(
                    "ldr r0, ={handler}",
                    "bx r0",
                    handler = sym imp::handle_svcall::<$Traits>,
                );
            }

            #[no_mangle]
            extern "C" fn SysTick() {
                // SysTick is only enabled on core 0
                // Safety: interrupt context, CPU Lock inactive
                unsafe { <$Traits as PortToKernel>::timer_tick() }
            }

            #[no_mangle]
            extern "C" fn SIO_IRQ_PROC0() {
                imp::drain_fifo();
                // Safety: interrupt context, CPU Lock inactive
                unsafe { <$Traits as PortToKernel>::ipi_notified() }
            }

            #[no_mangle]
            extern "C" fn SIO_IRQ_PROC1() {
                imp::drain_fifo();
                // Safety: interrupt context, CPU Lock inactive
                unsafe { <$Traits as PortToKernel>::ipi_notified() }
            }
        };
    };
}

/// Implementation details used by [`use_port!`]. Not part of the public
/// API.
#[cfg(target_os = "none")]
#[doc(hidden)]
pub mod imp {
    pub use crate::threading::*;
}
