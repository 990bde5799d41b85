//! CPU Lock, context switching, and the exception handler bodies.
use core::{cell::UnsafeCell, mem::MaybeUninit, slice, sync::atomic::{compiler_fence, Ordering}};

use tern_kernel::{KernelCfg1, KernelTraits, PortToKernel, TaskCb};

/// The SIO spinlock reserved for the kernel (the highest-numbered one, by
/// convention the least likely to collide with SDK users).
const KERNEL_SPINLOCK: usize = 31;

/// Port-specific per-task state: the saved process stack pointer. Must stay
/// the first field of `TaskCb` (offset zero) - the context-switch code
/// loads it with a zero-displacement `ldr`.
#[derive(Debug)]
#[repr(C)]
pub struct TaskState {
    sp: UnsafeCell<u32>,
}

// Safety: `sp` is only accessed by the owning core's dispatcher and under
// CPU Lock
unsafe impl Sync for TaskState {}

impl tern_kernel::utils::Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        sp: UnsafeCell::new(0),
    };
}

pub fn saved_stack_pointer(state: &TaskState) -> usize {
    // Safety: racing writes only happen while the task is being dispatched,
    // in which case the kernel doesn't ask for its stack pointer
    (unsafe { *state.sp.get() }) as usize
}

// ---------------------------------------------------------------------------
// Per-core critical-section state

struct CsState {
    /// Critical-section nesting depth. Non-zero == CPU Lock active.
    depth: UnsafeCell<u32>,
    /// Whether PRIMASK was set when the outermost section was entered.
    primask_was_active: UnsafeCell<bool>,
}

// Safety: each core only touches its own element, with interrupts masked
unsafe impl Sync for CsState {}

static CS: [CsState; 2] = [
    CsState {
        depth: UnsafeCell::new(0),
        primask_was_active: UnsafeCell::new(false),
    },
    CsState {
        depth: UnsafeCell::new(0),
        primask_was_active: UnsafeCell::new(false),
    },
];

#[inline(always)]
pub fn core_id() -> usize {
    // SIO.CPUID reads 0 on core 0 and 1 on core 1
    unsafe { (*rp2040_pac::SIO::ptr()).cpuid.read().bits() as usize }
}

#[inline(always)]
fn sio() -> &'static rp2040_pac::sio::RegisterBlock {
    // Safety: SIO is always accessible and its per-core registers don't
    // race between cores
    unsafe { &*rp2040_pac::SIO::ptr() }
}

/// `SIO.SPINLOCK31`. Reading returns zero while the lock is held elsewhere
/// and claims it otherwise; any write releases it.
const SPINLOCK: *mut u32 = (0xd000_0100 + KERNEL_SPINLOCK * 4) as *mut u32;

/// Enter a (nestable) critical section: mask interrupts and, on the
/// outermost entry of an SMP kernel, take the kernel spinlock.
///
/// This is also what the kernel's CPU Lock maps to.
pub fn enter_critical<Traits: KernelCfg1>() {
    let primask_was_active = cortex_m::register::primask::read().is_inactive();
    cortex_m::interrupt::disable();

    let cs = &CS[core_id()];
    // Safety: interrupts are masked, and this core owns its element
    unsafe {
        let depth = &mut *cs.depth.get();
        if *depth == 0 {
            if Traits::NUM_CORES > 1 {
                // The spinlock register claims the lock on a non-zero read
                while SPINLOCK.read_volatile() == 0 {}
            }
            *cs.primask_was_active.get() = primask_was_active;
        }
        *depth += 1;
    }

    // Keep memory accesses inside the critical section
    compiler_fence(Ordering::Acquire);
}

/// Leave a critical section entered with [`enter_critical`]. The outermost
/// exit releases the spinlock and restores the saved interrupt mask state.
pub fn exit_critical<Traits: KernelCfg1>() {
    compiler_fence(Ordering::Release);

    let cs = &CS[core_id()];
    // Safety: interrupts are masked (we are inside the section)
    unsafe {
        let depth = &mut *cs.depth.get();
        debug_assert!(*depth > 0);
        *depth -= 1;
        if *depth == 0 {
            if Traits::NUM_CORES > 1 {
                // Safety: any write releases the spinlock
                SPINLOCK.write_volatile(1);
            }
            if *cs.primask_was_active.get() {
                cortex_m::interrupt::enable();
            }
        }
    }
}

pub unsafe fn enter_cpu_lock<Traits: KernelCfg1>() {
    enter_critical::<Traits>();
}

pub unsafe fn leave_cpu_lock<Traits: KernelCfg1>() {
    exit_critical::<Traits>();
}

pub unsafe fn try_enter_cpu_lock<Traits: KernelCfg1>() -> bool {
    if is_cpu_lock_active::<Traits>() {
        false
    } else {
        enter_critical::<Traits>();
        true
    }
}

pub fn is_cpu_lock_active<Traits: KernelCfg1>() -> bool {
    let cs = &CS[core_id()];
    // Safety: plain word read of this core's own counter
    unsafe { *cs.depth.get() != 0 }
}

pub fn is_task_context() -> bool {
    // All tasks use PSP; handlers and the startup code use MSP
    cortex_m::register::control::read().spsel() == cortex_m::register::control::Spsel::Psp
        && !is_interrupt_context()
}

#[inline]
pub fn is_interrupt_context() -> bool {
    // IPSR.Exception != 0
    cortex_m::peripheral::SCB::vect_active()
        != cortex_m::peripheral::scb::VectActive::ThreadMode
}

pub fn wfi() {
    cortex_m::asm::wfi();
}

pub fn halt() -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::wfi();
    }
}

/// Ring the reschedule doorbell of the sibling core: a word through the
/// inter-core FIFO raises its `SIO_IRQ_PROC` interrupt.
///
/// Harmless if the target core hasn't started yet - the launch handshake
/// drains the FIFO first.
pub unsafe fn notify_core(_core: usize) {
    let sio = sio();
    if sio.fifo_st.read().rdy().bit_is_set() {
        sio.fifo_wr.write(|w| unsafe { w.bits(1) });
    }
    cortex_m::asm::sev();
}

/// Drain this core's inbound FIFO and clear its sticky error flags. The
/// doorbell carries no payload; the kernel's message rings live in SRAM.
pub fn drain_fifo() {
    let sio = sio();
    while sio.fifo_st.read().vld().bit_is_set() {
        let _ = sio.fifo_rd.read();
    }
    // Clear ROE/WOF by writing any value
    sio.fifo_st.write(|w| unsafe { w.bits(0xff) });
}

// ---------------------------------------------------------------------------
// Dispatching

/// Set the lowest exception priority for PendSV and SVCall on the current
/// core so the dispatcher can never preempt another handler.
pub fn init_exception_priorities() {
    // Safety: we own these two exceptions per the port's hardware contract
    unsafe {
        let mut peripherals = cortex_m::Peripherals::steal();
        peripherals
            .SCB
            .set_priority(cortex_m::peripheral::scb::SystemHandler::SVCall, 0xc0);
        peripherals
            .SCB
            .set_priority(cortex_m::peripheral::scb::SystemHandler::PendSV, 0xc0);
    }
}

/// The address of the current core's running-task slot, for the naked
/// handlers below.
extern "C" fn running_slot<Traits: KernelTraits>() -> *mut *mut TaskCb<Traits> {
    tern_kernel::running_task_slot::<Traits>(core_id())
}

/// Elect the next task to run on the current core. Called from the PendSV
/// handler between the save and restore phases.
extern "C" fn choose_task<Traits: KernelTraits>() {
    // Safety: PendSV runs with CPU Lock inactive (it's the lowest priority
    // and the kernel never pends it while holding the lock on this core)
    unsafe {
        enter_cpu_lock::<Traits>();
        <Traits as PortToKernel>::choose_running_task();
        leave_cpu_lock::<Traits>();
    }
}

/// The PendSV handler: the context switch.
///
/// Saves the interrupted task's `r4-r11` below its exception frame on the
/// PSP, elects the next task, and returns into its restored frame. A null
/// running task (first dispatch on this core, or a task that exited) has no
/// context worth saving.
///
/// # Safety
///
/// Must be installed as the PendSV handler, at the lowest exception
/// priority.
#[unsafe(naked)]
pub unsafe extern "C" fn handle_pend_sv<Traits: KernelTraits>() {
    core::arch::naked_asm!(
        "
        bl      {running_slot}
        ldr     r1, [r0]
        cmp     r1, #0
        beq     0f

        // Save the outgoing context below the hardware-stacked frame:
        // [r4-r7, r8-r11] at psp-32, and record the new stack pointer in
        // the task control block (offset 0)
        mrs     r2, psp
        subs    r2, #32
        str     r2, [r1]
        stmia   r2!, {{r4-r7}}
        mov     r4, r8
        mov     r5, r9
        mov     r6, r10
        mov     r7, r11
        stmia   r2!, {{r4-r7}}
    0:
        mov     r8, r0
        bl      {choose_task}
        mov     r0, r8

        // Restore the incoming context. After `System::start` there is
        // always a running task (the idle tasks never block).
        ldr     r1, [r0]
        ldr     r2, [r1]
        adds    r2, #16
        ldmia   r2!, {{r4-r7}}
        mov     r8, r4
        mov     r9, r5
        mov     r10, r6
        mov     r11, r7
        msr     psp, r2
        subs    r2, #32
        ldmia   r2!, {{r4-r7}}

        // Return to Thread mode on the process stack
        ldr     r0, ={exc_return}
        bx      r0
        ",
        running_slot = sym running_slot::<Traits>,
        choose_task = sym choose_task::<Traits>,
        exc_return = const 0xfffffffdu32,
    );
}

/// The SVCall handler: restore-only dispatch used once per core to enter
/// the first task from the startup (MSP) context.
///
/// # Safety
///
/// Must be installed as the SVCall handler; the current core's running task
/// must have been elected.
#[unsafe(naked)]
pub unsafe extern "C" fn handle_svcall<Traits: KernelTraits>() {
    core::arch::naked_asm!(
        "
        bl      {running_slot}
        ldr     r1, [r0]
        ldr     r2, [r1]
        adds    r2, #16
        ldmia   r2!, {{r4-r7}}
        mov     r8, r4
        mov     r9, r5
        mov     r10, r6
        mov     r11, r7
        msr     psp, r2
        subs    r2, #32
        ldmia   r2!, {{r4-r7}}
        ldr     r0, ={exc_return}
        bx      r0
        ",
        running_slot = sym running_slot::<Traits>,
        exc_return = const 0xfffffffdu32,
    );
}

/// Transfer control to the elected first task, discarding the startup
/// context.
///
/// Precondition: CPU Lock active (released here), a running task elected
/// for this core.
pub unsafe fn dispatch_first_task<Traits: KernelTraits>() -> ! {
    init_exception_priorities();

    // Safety: CPU Lock is active per this function's contract
    unsafe { leave_cpu_lock::<Traits>() };

    // The SVCall handler performs a restore-only dispatch
    // Safety: Thread mode with interrupts enabled; SVCall is installed
    unsafe { core::arch::asm!("svc 0") };

    // Not reached: the SVC return goes into the first task
    unreachable!()
}

/// Yield the processor by pending PendSV.
///
/// Precondition: CPU Lock inactive.
pub unsafe fn yield_cpu() {
    // Make preceding memory operations visible to the dispatcher
    compiler_fence(Ordering::Release);

    cortex_m::peripheral::SCB::set_pendsv();

    // Ensure PendSV is taken before the next operation (in a task context;
    // in a handler it's taken at exception return)
    cortex_m::asm::dsb();
    cortex_m::asm::isb();

    compiler_fence(Ordering::Acquire);
}

/// Discard the exited task's context and dispatch the next one.
///
/// Precondition: CPU Lock active (released here); the running-task slot has
/// been cleared, so PendSV skips the save phase and this context is never
/// resumed.
pub unsafe fn exit_and_dispatch<Traits: KernelTraits>() -> ! {
    // Safety: CPU Lock is active per this function's contract
    unsafe { leave_cpu_lock::<Traits>() };

    cortex_m::peripheral::SCB::set_pendsv();

    loop {
        cortex_m::asm::wfi();
    }
}

/// Build the initial exception frame so the task starts from its entry
/// point with its parameter in `r0` and returns into the kernel's exit
/// path.
///
/// Stack layout at dispatch, growing downward:
///
/// ```text
///   +56  xPSR      (Thumb bit set)
///   +48  PC        (entry point)
///   +44  LR        (task exit trampoline)
///   +32  r12, r3, r2, r1
///   +32  r0        (entry parameter)
///   + 0  r4-r11    (software-saved block)
/// ```
///
/// Precondition: CPU Lock active; the task is not running on any core.
pub unsafe fn initialize_task_state<Traits: KernelTraits>(task: &'static TaskCb<Traits>) {
    // Safety: CPU Lock active per this function's contract
    let attr = unsafe { task.attr() };
    let stack = attr.stack;

    let mut sp = stack
        .base()
        .wrapping_add(stack.len())
        .cast::<MaybeUninit<u32>>();

    // Exception frame (automatically restored as part of the exception
    // return sequence)
    let exc_frame = unsafe {
        sp = sp.wrapping_sub(8);
        slice::from_raw_parts_mut(sp, 8)
    };

    // r0: parameter to the entry point
    exc_frame[0] = MaybeUninit::new(attr.param as u32);
    // r1-r3, r12: don't care
    // lr: the return address - a task entry function returning terminates
    // the task
    exc_frame[5] = MaybeUninit::new(task_exit_trampoline::<Traits> as usize as u32);
    // pc: the entry point. The Thumb bit must be clear in an exception
    // frame's return address
    exc_frame[6] = MaybeUninit::new(attr.entry as usize as u32 & !1);
    // xPSR: Thumb mode
    exc_frame[7] = MaybeUninit::new(0x0100_0000);

    // Software-saved block (r4-r11): don't care
    sp = sp.wrapping_sub(8);

    // Safety: the dispatcher is the only other accessor, and the task isn't
    // dispatchable yet
    unsafe { *task.port_task_state.sp.get() = sp as u32 };
}

extern "C" fn task_exit_trampoline<Traits: KernelTraits>() -> ! {
    // Safety: called in the context of a task whose entry function returned
    unsafe { tern_kernel::task::exit_current_task::<Traits>() }
}

// ---------------------------------------------------------------------------
// SysTick (the tick source, core 0 only)

/// Start the kernel tick. SysTick counts the 1 MHz watchdog tick reference
/// (`CLKSOURCE = 0`), so the reload value is simply `1_000_000 / rate`.
///
/// Precondition: CPU Lock active, core 0, clocks initialized by
/// [`crate::init_clock`] (or equivalent).
pub unsafe fn start_systick(rate_hz: u32) {
    let reload = 1_000_000 / rate_hz;

    // Safety: the port owns SysTick per the hardware contract
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };
    peripherals.SYST.set_clock_source(
        cortex_m::peripheral::syst::SystClkSource::External,
    );
    peripherals.SYST.set_reload(reload - 1);
    peripherals.SYST.clear_current();
    peripherals.SYST.enable_interrupt();
    peripherals.SYST.enable_counter();
}

/// The 64-bit 1 µs clock, assembled from the TIMER block's raw counter
/// halves. The high half is read twice to detect a carry in between.
pub fn timer_us() -> u64 {
    // Safety: read-only access to free-running counter registers
    let timer = unsafe { &*rp2040_pac::TIMER::ptr() };
    loop {
        let hi = timer.timerawh.read().bits();
        let lo = timer.timerawl.read().bits();
        if timer.timerawh.read().bits() == hi {
            return (hi as u64) << 32 | lo as u64;
        }
    }
}
