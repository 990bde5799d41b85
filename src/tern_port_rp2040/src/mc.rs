//! Core 1 bring-up.
use core::{mem::MaybeUninit, sync::atomic::{AtomicBool, Ordering}};

use tern_kernel::KernelTraits;

use crate::PortOptions;

/// Core 1's interrupt (MSP) stack. Sized generously; [`PortOptions`] lets
/// an application trim it, but the backing storage here covers the largest
/// supported configuration.
const CORE1_STACK_WORDS: usize = 4096 / 4;

static CORE1_STACK: Core1Stack = Core1Stack(MaybeUninit::uninit());

#[repr(align(8))]
struct Core1Stack(MaybeUninit<[u32; CORE1_STACK_WORDS]>);

// Safety: only core 1 uses this memory, as its MSP stack
unsafe impl Sync for Core1Stack {}

static CORE1_STARTED: AtomicBool = AtomicBool::new(false);

/// Reset core 1 and launch it into the kernel's secondary-core entry path.
///
/// Implements the bootrom's FIFO launch handshake: after a PSM reset,
/// core 1 sits in the bootrom waiting for the sequence `0, 0, 1, VTOR, SP,
/// PC` on its FIFO, echoing each word back.
///
/// # Safety
///
///  - Must be called from core 0, exactly once, after `System::start`
///    elected core 0's first task.
pub unsafe fn core1_launch<Traits: KernelTraits + PortOptions>() {
    let already_started = CORE1_STARTED.swap(true, Ordering::AcqRel);
    debug_assert!(!already_started);

    // Safety: the PSM and SIO blocks are always accessible; only this
    // function touches core 1's reset bits
    let psm = unsafe { &*rp2040_pac::PSM::ptr() };
    let sio = unsafe { &*rp2040_pac::SIO::ptr() };

    // Reset core 1
    psm.frce_off.modify(|_, w| w.proc1().set_bit());
    while psm.frce_off.read().proc1().bit_is_clear() {}
    psm.frce_off.modify(|_, w| w.proc1().clear_bit());

    // Both cores share one vector table; core 1 only ever takes the
    // exceptions this port installs handlers for
    // Safety: read-only register access
    let vector_table = unsafe { (*cortex_m::peripheral::SCB::PTR).vtor.read() };

    let stack_top = {
        let base = CORE1_STACK.0.as_ptr() as usize;
        let size = <Traits as PortOptions>::CORE1_STACK_SIZE.min(CORE1_STACK_WORDS * 4);
        base + size
    };

    let cmd_seq: [u32; 6] = [
        0,
        0,
        1,
        vector_table,
        stack_top as u32,
        core1_entry::<Traits> as usize as u32,
    ];

    let mut i = 0;
    while i < cmd_seq.len() {
        let cmd = cmd_seq[i];

        // Drain the FIFO before sending a zero; core 1 interprets a
        // non-empty FIFO as a botched handshake
        if cmd == 0 {
            while sio.fifo_st.read().vld().bit_is_set() {
                let _ = sio.fifo_rd.read();
            }
            // Core 1 may be sleeping on the FIFO
            cortex_m::asm::sev();
        }

        // Send the command word
        while sio.fifo_st.read().rdy().bit_is_clear() {}
        sio.fifo_wr.write(|w| unsafe { w.bits(cmd) });
        cortex_m::asm::sev();

        // Core 1 echoes each word; a mismatch restarts the sequence
        while sio.fifo_st.read().vld().bit_is_clear() {
            cortex_m::asm::wfe();
        }
        if sio.fifo_rd.read().bits() == cmd {
            i += 1;
        } else {
            i = 0;
        }
    }

    log::debug!("core 1 launched");
}

/// Core 1 enters here from the bootrom, on its own MSP stack, with the
/// shared vector table installed.
unsafe extern "C" fn core1_entry<Traits: KernelTraits>() -> ! {
    crate::threading::drain_fifo();

    // Unmask this core's doorbell interrupt
    // Safety: SIO_IRQ_PROC1 belongs to the port
    unsafe { cortex_m::peripheral::NVIC::unmask(rp2040_pac::Interrupt::SIO_IRQ_PROC1) };

    // Safety: called on core 1 after `System::start` on core 0
    unsafe { tern_kernel::System::<Traits>::enter_secondary_core() }
}

/// Enable core 0's doorbell interrupt. Call before `System::start`.
pub fn enable_core0_doorbell() {
    // Safety: SIO_IRQ_PROC0 belongs to the port
    unsafe { cortex_m::peripheral::NVIC::unmask(rp2040_pac::Interrupt::SIO_IRQ_PROC0) };
}
