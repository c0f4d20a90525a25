use crate::regs::{otgsc, portsc1, usbcmd, usbmode, Reg, UsbRegisters};
use crate::state::{spin_while, TransferError};
use crate::{Config, Speed};
use core::ptr;

// System control blocks touched while bringing up USB0.
const CGU_BASE_USB0_CLK: usize = 0x4005_0060;
const CCU1_CLK_M3_USB0_CFG: usize = 0x4005_1428;
const CCU1_CLK_M3_USB0_STAT: usize = 0x4005_142c;
const SCU_SFSP6_3: usize = 0x4008_630c;
const SCU_SFSP6_6: usize = 0x4008_6318;
const SCU_SFSP8_1: usize = 0x4008_6404;
const SCU_SFSP8_2: usize = 0x4008_6408;
const CREG_CREG0: usize = 0x4004_3004;

// BASE_USB0_CLK: autoblock, fed from PLL0USB.
const BASE_USB0_CLK_PLL0USB: u32 = (0x07 << 24) | (1 << 11);
// CREG0 bit that powers down the USB0 PHY when set.
const CREG0_USB0PHY: u32 = 1 << 5;

/// Route PLL0USB to the USB0 branch clock, mux the VBUS/power pins and power up the PHY.
///
/// PLL0USB must already be running at 480 MHz.
///
/// # Safety
///
/// Writes directly to the CGU, CCU1, SCU and CREG blocks.  Must only be called once during board
/// bring-up, before `Driver::init()`, on an LPC18xx.
pub unsafe fn enable_usb0_clock_and_pins() {
    ptr::write_volatile(CGU_BASE_USB0_CLK as *mut u32, BASE_USB0_CLK_PLL0USB);
    let cfg = CCU1_CLK_M3_USB0_CFG as *mut u32;
    ptr::write_volatile(cfg, ptr::read_volatile(cfg) | 1);
    while ptr::read_volatile(CCU1_CLK_M3_USB0_STAT as *const u32) & 1 == 0 {}

    // USB0_PWR_EN, USB0_PWR_FAULT and the two port indicator outputs.
    ptr::write_volatile(SCU_SFSP6_3 as *mut u32, 1);
    ptr::write_volatile(SCU_SFSP6_6 as *mut u32, 3);
    ptr::write_volatile(SCU_SFSP8_1 as *mut u32, 1);
    ptr::write_volatile(SCU_SFSP8_2 as *mut u32, 1);

    let creg0 = CREG_CREG0 as *mut u32;
    ptr::write_volatile(creg0, ptr::read_volatile(creg0) & !CREG0_USB0PHY);
}

/// Reset the controller core and put it in device mode at the configured speed.
pub(crate) fn init_controller<R: UsbRegisters>(
    regs: &R,
    config: &Config,
) -> Result<(), TransferError> {
    regs.modify(Reg::UsbCmd, |v| v | usbcmd::RST);
    spin_while(regs, config.spin_limit, |r| {
        r.read(Reg::UsbCmd) & usbcmd::RST != 0
    })?;

    regs.write(Reg::UsbMode, usbmode::CM_DEVICE | usbmode::SLOM);
    match config.speed {
        Speed::High => regs.modify(Reg::PortSc1, |v| v & !portsc1::PFSC),
        Speed::Full => regs.modify(Reg::PortSc1, |v| v | portsc1::PFSC),
    }
    regs.write(Reg::OtgSc, otgsc::VD | otgsc::OT);
    Ok(())
}
