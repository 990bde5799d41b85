//! Dual-core demo for the Raspberry Pi Pico.
//!
//! Core 1 runs a producer task that sends a heartbeat message across the
//! inter-core channel once per second; core 0 runs a monitor task that
//! consumes the heartbeats and toggles the on-board LED. The health monitor
//! feeds the watchdog while everything stays within its thresholds.
#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod demo {
    use cortex_m_rt::entry;
    use rp2040_pac as pac;
    use tern_kernel::{
        ipc,
        task::{Task, TaskOptions},
        utils::{AlignedStorage, Init, RawCell},
        Affinity, Config, Region, System, WAIT_FOREVER,
    };

    // The second-stage bootloader; the bootrom copies it into SRAM and
    // jumps to it
    #[link_section = ".boot_loader"]
    #[used]
    pub static BOOT_LOADER: [u8; 256] = rp2040_boot2::BOOT_LOADER_W25Q080;

    tern_kernel::build! {
        pub struct SystemTraits;

        priority_levels: 8,
        num_cores: 2,
        max_tasks: 8,
        max_mutexes: 2,
        max_semaphores: 2,
        max_queues: 2,
        max_event_groups: 1,
        max_stream_buffers: 1,
        max_timers: 4,
        ipc_ring_depth: 8,
        error_history_len: 8,
        trace_buffer_len: 32,
        idle_stack_size: 1024,
    }
    tern_port_rp2040::use_port!(unsafe SystemTraits);

    impl tern_port_rp2040::PortOptions for SystemTraits {}

    type Kernel = System<SystemTraits>;

    const HEARTBEAT_TAG: u32 = 0x7e41;

    macro_rules! task_stack {
        ($name:ident, $len:expr) => {
            static $name: RawCell<AlignedStorage<$len, 8>> = RawCell::new(Init::INIT);
        };
    }

    task_stack!(MONITOR_STACK, 2048);
    task_stack!(PRODUCER_STACK, 2048);

    fn stack_of<const LEN: usize>(cell: &'static RawCell<AlignedStorage<LEN, 8>>) -> Region {
        // Safety: each static is handed to exactly one task
        unsafe { Region::from_raw_parts(cell.get() as *mut u8, LEN) }
    }

    /// Core 1: announce a heartbeat once per second.
    fn producer(_: usize) {
        let mut beat = 0u32;
        loop {
            beat = beat.wrapping_add(1);
            let message = ipc::Message::new(HEARTBEAT_TAG, [beat, 0, 0]);
            let _ = ipc::send::<SystemTraits>(0, message, WAIT_FOREVER);
            let _ = tern_kernel::task::delay::<SystemTraits>(1000);
        }
    }

    /// Core 0: toggle the LED for every heartbeat from core 1.
    fn monitor(_: usize) {
        loop {
            if let Ok(message) = ipc::receive::<SystemTraits>(WAIT_FOREVER) {
                if message.tag == HEARTBEAT_TAG {
                    led_toggle();
                }
            }
        }
    }

    const LED_PIN: usize = 25;

    fn led_init(io_bank0: &pac::io_bank0::RegisterBlock, resets: &pac::resets::RegisterBlock) {
        resets
            .reset
            .modify(|_, w| w.io_bank0().clear_bit().pads_bank0().clear_bit());
        while resets.reset_done.read().io_bank0().bit_is_clear() {}

        // Route the pin to SIO (function 5) and drive it as an output
        io_bank0.gpio[LED_PIN]
            .gpio_ctrl
            .write(|w| unsafe { w.funcsel().bits(5) });
        // Safety: SIO GPIO registers are write-to-set
        let sio = unsafe { &*pac::SIO::ptr() };
        sio.gpio_oe_set.write(|w| unsafe { w.bits(1 << LED_PIN) });
    }

    fn led_toggle() {
        // Safety: write-to-xor register, safe from any context
        let sio = unsafe { &*pac::SIO::ptr() };
        sio.gpio_out_xor.write(|w| unsafe { w.bits(1 << LED_PIN) });
    }

    #[entry]
    fn main() -> ! {
        // Safety: the sole owner of the peripherals at reset
        let p = unsafe { pac::Peripherals::steal() };

        tern_port_rp2040::init_clock(
            &p.CLOCKS,
            &p.XOSC,
            &p.PLL_SYS,
            &p.PLL_USB,
            &p.RESETS,
            &p.WATCHDOG,
        );
        led_init(&p.IO_BANK0, &p.RESETS);
        tern_port_rp2040::enable_core0_doorbell();

        // Safety: once, before the scheduler starts
        unsafe { tern_port_rp2040::watchdog::start(2_000_000) };

        Kernel::init(&Config {
            health_check_period: 250,
            watchdog_feed: Some(tern_port_rp2040::watchdog::feed),
            ..Config::default()
        })
        .unwrap();

        Task::<SystemTraits>::create(&TaskOptions {
            priority: 3,
            stack: stack_of(&MONITOR_STACK),
            entry: monitor,
            param: 0,
            affinity: Affinity::Core0,
            name: Some("monitor"),
        })
        .unwrap();

        Task::<SystemTraits>::create(&TaskOptions {
            priority: 2,
            stack: stack_of(&PRODUCER_STACK),
            entry: producer,
            param: 0,
            affinity: Affinity::Core1,
            name: Some("producer"),
        })
        .unwrap();

        Kernel::start()
    }

    #[panic_handler]
    fn panic(_info: &core::panic::PanicInfo) -> ! {
        cortex_m::interrupt::disable();
        loop {
            cortex_m::asm::wfi();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
