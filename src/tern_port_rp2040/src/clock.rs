//! Clock tree bring-up for a Raspberry Pi Pico-class board.
use rp2040_pac as pac;

/// The crystal frequency the Pico ships with.
const XOSC_MHZ: u32 = 12;

/// Configure the clock tree:
///
///  - `clk_sys` = 125 MHz from `pll_sys`
///  - `clk_ref` = 48 MHz from `pll_usb`
///  - `clk_peri` = 48 MHz from `pll_usb`
///  - watchdog tick = 1 MHz, which clocks both SysTick (the kernel tick)
///    and the TIMER block (the 64-bit µs clock)
pub fn init_clock(
    clocks: &pac::clocks::RegisterBlock,
    xosc: &pac::xosc::RegisterBlock,
    pll_sys: &pac::pll_sys::RegisterBlock,
    pll_usb: &pac::pll_sys::RegisterBlock,
    resets: &pac::resets::RegisterBlock,
    watchdog: &pac::watchdog::RegisterBlock,
) {
    // Disable the resuscitation circuit while reconfiguring
    clocks.clk_sys_resus_ctrl.write(|w| w.enable().clear_bit());

    // Park clk_ref and clk_sys on the ring oscillator while the PLLs are
    // reconfigured
    clocks.clk_ref_ctrl.modify(|_, w| w.src().rosc_clksrc_ph());
    clocks.clk_sys_ctrl.modify(|_, w| w.src().clk_ref());
    while clocks.clk_ref_selected.read().bits() != 1 {}
    while clocks.clk_sys_selected.read().bits() != 1 {}

    // Cycle both PLLs through reset
    resets
        .reset
        .modify(|_, w| w.pll_sys().set_bit().pll_usb().set_bit());
    resets
        .reset
        .modify(|_, w| w.pll_sys().clear_bit().pll_usb().clear_bit());
    while resets.reset_done.read().pll_sys().bit_is_clear() {}
    while resets.reset_done.read().pll_usb().bit_is_clear() {}

    // Start the crystal oscillator
    xosc.ctrl.write(|w| w.freq_range()._1_15mhz());
    xosc.startup
        .write(|w| unsafe { w.bits((XOSC_MHZ * 1000 + 128) / 256) });
    xosc.ctrl.modify(|_, w| w.enable().enable());
    while xosc.status.read().stable().bit_is_clear() {}

    // 12 MHz * 125 / 6 / 2 = 125 MHz
    configure_pll(pll_sys, 125, 6, 2);
    // 12 MHz * 40 / 5 / 2 = 48 MHz
    configure_pll(pll_usb, 40, 5, 2);

    // pll_sys → clk_sys
    clocks
        .clk_sys_ctrl
        .modify(|_, w| w.auxsrc().clksrc_pll_sys());
    clocks
        .clk_sys_ctrl
        .modify(|_, w| w.src().clksrc_clk_sys_aux());

    // pll_usb → clk_ref
    clocks
        .clk_ref_ctrl
        .modify(|_, w| w.auxsrc().clksrc_pll_usb());
    clocks
        .clk_ref_ctrl
        .modify(|_, w| w.src().clksrc_clk_ref_aux());

    // clk_ref / 48 = the 1 MHz tick reference for SysTick, TIMER, and the
    // watchdog
    watchdog.tick.write(|w| unsafe { w.cycles().bits(48) });

    // pll_usb → clk_peri
    clocks
        .clk_peri_ctrl
        .write(|w| w.auxsrc().clksrc_pll_usb().enable().set_bit());
}

/// Bring one PLL from powered-down to locked with the given dividers,
/// assuming the 12 MHz crystal reference.
fn configure_pll(
    pll: &pac::pll_sys::RegisterBlock,
    fbdiv: u16,
    post_div1: u8,
    post_div2: u8,
) {
    // Power everything down during reconfiguration
    pll.pwr.write(|w| {
        w.vcopd()
            .set_bit()
            .postdivpd()
            .set_bit()
            .dsmpd()
            .set_bit()
            .pd()
            .set_bit()
    });

    pll.cs.write(|w| unsafe { w.refdiv().bits(1) });
    pll.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits(fbdiv) });

    // Power up the VCO and wait for lock
    pll.pwr.modify(|_, w| w.vcopd().clear_bit().pd().clear_bit());
    while pll.cs.read().lock().bit_is_clear() {}

    // Engage the post dividers
    pll.prim
        .write(|w| unsafe { w.postdiv1().bits(post_div1).postdiv2().bits(post_div2) });
    pll.pwr.modify(|_, w| w.postdivpd().clear_bit());
}
