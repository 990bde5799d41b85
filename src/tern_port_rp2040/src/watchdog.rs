//! Watchdog feed helpers for the kernel's health monitor.
//!
//! The kernel's contract is feed-only: wire [`feed`] into
//! `Config::watchdog_feed` and the health monitor keeps the dog fed for as
//! long as every check passes. Arming the watchdog is the application's
//! decision, made once at startup with [`start`].
use rp2040_pac as pac;

/// The watchdog counter decrements twice per 1 µs tick (RP2040-E1), so the
/// load value is in half-microseconds.
fn load_value(timeout_us: u32) -> u32 {
    (timeout_us.saturating_mul(2)).min(0xff_ffff)
}

static mut TIMEOUT_US: u32 = 0;

/// Arm the watchdog with the given timeout. Requires the 1 MHz tick
/// reference started by [`crate::init_clock`].
///
/// # Safety
///
/// Call once, before `System::start`, from core 0.
pub unsafe fn start(timeout_us: u32) {
    // Safety: single-core startup context per this function's contract
    let watchdog = unsafe { &*pac::WATCHDOG::ptr() };
    unsafe { TIMEOUT_US = timeout_us };

    watchdog
        .load
        .write(|w| unsafe { w.bits(load_value(timeout_us)) });
    watchdog.ctrl.modify(|_, w| w.enable().set_bit());
}

/// Reload the watchdog counter. Safe to call from any context.
pub fn feed() {
    // Safety: `TIMEOUT_US` is written once during startup
    let timeout_us = unsafe { TIMEOUT_US };
    if timeout_us == 0 {
        return;
    }
    // Safety: the LOAD register is write-only and races benignly
    let watchdog = unsafe { &*pac::WATCHDOG::ptr() };
    watchdog
        .load
        .write(|w| unsafe { w.bits(load_value(timeout_us)) });
}
