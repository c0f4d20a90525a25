use static_assertions::const_assert_eq;
use vcell::VolatileCell;

/// Number of ENDPTCTRLn registers implemented by the LPC18xx USB0 controller.
pub const NUM_HW_ENDPOINTS: usize = 6;

/// Base address of the USB0 register block.
pub const USB0_BASE: usize = 0x4000_6000;

/// Device-mode registers used by the driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Reg {
    UsbCmd,
    UsbSts,
    UsbIntr,
    FrIndex,
    DeviceAddr,
    EndpointListAddr,
    EndptNak,
    EndptNakEn,
    PortSc1,
    OtgSc,
    UsbMode,
    EndptSetupStat,
    EndptPrime,
    EndptFlush,
    EndptStat,
    EndptComplete,
    EndptCtrl(usize),
}

/// Access to the USB0 device registers.
///
/// The controller only ever talks to the hardware through this trait, which lets the host test
/// suite substitute a simulated register file.
pub trait UsbRegisters {
    fn read(&self, reg: Reg) -> u32;
    fn write(&self, reg: Reg, value: u32);

    /// Read-modify-write.  Must not be used on the write-1-to-clear status registers.
    fn modify(&self, reg: Reg, f: impl FnOnce(u32) -> u32) {
        self.write(reg, f(self.read(reg)));
    }
}

pub mod usbcmd {
    pub const RS: u32 = 1 << 0;
    pub const RST: u32 = 1 << 1;
    pub const SUTW: u32 = 1 << 13;
    pub const ITC_MASK: u32 = 0xff << 16;
}

// USBSTS and USBINTR share the same bit positions.
pub mod usbsts {
    pub const UI: u32 = 1 << 0;
    pub const UEI: u32 = 1 << 1;
    pub const PCI: u32 = 1 << 2;
    pub const URI: u32 = 1 << 6;
    pub const SRI: u32 = 1 << 7;
    pub const SLI: u32 = 1 << 8;
}

pub mod portsc1 {
    pub const FPR: u32 = 1 << 6;
    pub const PFSC: u32 = 1 << 24;
    pub const PSPD_SHIFT: u32 = 26;
    pub const PSPD_MASK: u32 = 0x3;
    pub const PSPD_HIGH: u32 = 2;
}

pub mod usbmode {
    pub const CM_DEVICE: u32 = 0x2;
    pub const SLOM: u32 = 1 << 3;
}

pub mod otgsc {
    pub const VD: u32 = 1 << 0;
    pub const OT: u32 = 1 << 3;
}

pub mod deviceaddr {
    pub const USBADRA: u32 = 1 << 24;
    pub const USBADR_SHIFT: u32 = 25;
}

// ENDPTCTRLn.  The IN half is the OUT half shifted left by IN_SHIFT.
pub mod endptctrl {
    pub const RXS: u32 = 1 << 0;
    pub const RXT_SHIFT: u32 = 2;
    pub const RXR: u32 = 1 << 6;
    pub const RXE: u32 = 1 << 7;
    pub const TXS: u32 = 1 << 16;
    pub const TXR: u32 = 1 << 22;
    pub const TXE: u32 = 1 << 23;
    pub const IN_SHIFT: u32 = 16;
    pub const HALF_MASK: u32 = 0xffff;
    /// Control endpoint 0 with both directions enabled.
    pub const CONTROL0: u32 = RXE | TXE;
}

#[repr(C)]
pub struct Usb0RegisterBlock {
    _reserved000: [u8; 0x140],
    usbcmd: VolatileCell<u32>,           // 0x0140
    usbsts: VolatileCell<u32>,           // 0x0144
    usbintr: VolatileCell<u32>,          // 0x0148
    frindex: VolatileCell<u32>,          // 0x014c
    _reserved150: [u8; 0x04],
    deviceaddr: VolatileCell<u32>,       // 0x0154
    endpointlistaddr: VolatileCell<u32>, // 0x0158
    _reserved15c: [u8; 0x1c],
    endptnak: VolatileCell<u32>,         // 0x0178
    endptnaken: VolatileCell<u32>,       // 0x017c
    _reserved180: [u8; 0x04],
    portsc1: VolatileCell<u32>,          // 0x0184
    _reserved188: [u8; 0x1c],
    otgsc: VolatileCell<u32>,            // 0x01a4
    usbmode: VolatileCell<u32>,          // 0x01a8
    endptsetupstat: VolatileCell<u32>,   // 0x01ac
    endptprime: VolatileCell<u32>,       // 0x01b0
    endptflush: VolatileCell<u32>,       // 0x01b4
    endptstat: VolatileCell<u32>,        // 0x01b8
    endptcomplete: VolatileCell<u32>,    // 0x01bc
    endptctrl: [VolatileCell<u32>; NUM_HW_ENDPOINTS], // 0x01c0 to 0x01d8
}

// Sanity check our layout
const_assert_eq!(core::mem::offset_of!(Usb0RegisterBlock, usbcmd), 0x140);
const_assert_eq!(core::mem::offset_of!(Usb0RegisterBlock, deviceaddr), 0x154);
const_assert_eq!(core::mem::offset_of!(Usb0RegisterBlock, endptnak), 0x178);
const_assert_eq!(core::mem::offset_of!(Usb0RegisterBlock, portsc1), 0x184);
const_assert_eq!(core::mem::offset_of!(Usb0RegisterBlock, otgsc), 0x1a4);
const_assert_eq!(core::mem::offset_of!(Usb0RegisterBlock, endptcomplete), 0x1bc);
const_assert_eq!(core::mem::offset_of!(Usb0RegisterBlock, endptctrl), 0x1c0);

impl Usb0RegisterBlock {
    fn cell(&self, reg: Reg) -> &VolatileCell<u32> {
        match reg {
            Reg::UsbCmd => &self.usbcmd,
            Reg::UsbSts => &self.usbsts,
            Reg::UsbIntr => &self.usbintr,
            Reg::FrIndex => &self.frindex,
            Reg::DeviceAddr => &self.deviceaddr,
            Reg::EndpointListAddr => &self.endpointlistaddr,
            Reg::EndptNak => &self.endptnak,
            Reg::EndptNakEn => &self.endptnaken,
            Reg::PortSc1 => &self.portsc1,
            Reg::OtgSc => &self.otgsc,
            Reg::UsbMode => &self.usbmode,
            Reg::EndptSetupStat => &self.endptsetupstat,
            Reg::EndptPrime => &self.endptprime,
            Reg::EndptFlush => &self.endptflush,
            Reg::EndptStat => &self.endptstat,
            Reg::EndptComplete => &self.endptcomplete,
            Reg::EndptCtrl(n) => &self.endptctrl[n],
        }
    }
}

/// The memory-mapped USB0 controller.
pub struct Usb0 {
    block: &'static Usb0RegisterBlock,
}

impl Usb0 {
    /// # Safety
    ///
    /// The caller must be the only owner of the USB0 peripheral.
    pub unsafe fn steal() -> Self {
        Self {
            block: &*(USB0_BASE as *const Usb0RegisterBlock),
        }
    }
}

impl UsbRegisters for Usb0 {
    fn read(&self, reg: Reg) -> u32 {
        self.block.cell(reg).get()
    }

    fn write(&self, reg: Reg, value: u32) {
        self.block.cell(reg).set(value)
    }
}

/// ENDPTPRIME/ENDPTFLUSH/ENDPTCOMPLETE bit for an endpoint.
pub(crate) const fn endpoint_bit(index: usize, is_in: bool) -> u32 {
    if is_in {
        1 << (index + 16)
    } else {
        1 << index
    }
}
