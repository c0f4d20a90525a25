use crate::descriptor::NUM_ENDPOINTS;
use crate::driver::Driver;
use crate::endpoint::{BusEvent, EndpointEvent};
use crate::fmt::{error, trace};
use crate::regs::{endpoint_bit, usbsts, Reg, UsbRegisters};
use crate::state::{BUS_WAKER, ENDPOINT_MASK};
use embassy_usb_driver::{Direction, EndpointAddress};

/// USB0 interrupt handler for use with `State`.
///
/// Masks the controller interrupts and wakes the task running `Bus::poll()`, which services them
/// and unmasks them again.  `regs` is typically a fresh `Usb0` handle.
pub fn on_bus_interrupt<R: UsbRegisters>(regs: &R) {
    regs.write(Reg::UsbIntr, 0);
    BUS_WAKER.wake();
}

impl<'d, R: UsbRegisters> Driver<'d, R> {
    /// Service the USB0 interrupt.
    ///
    /// Latches and acknowledges the enabled status bits, then handles them in a fixed order:
    /// reset, suspend, start of frame, port change, transfer completion, transfer errors.
    /// Handlers run synchronously from here.
    pub fn on_interrupt(&mut self) {
        let regs = self.usb.regs();
        let sts = regs.read(Reg::UsbSts) & regs.read(Reg::UsbIntr);
        let complete = regs.read(Reg::EndptComplete);
        regs.write(Reg::UsbSts, sts);
        trace!("irq sts={:#x} complete={:#x}", sts, complete);

        let reset = sts & usbsts::URI != 0;
        if reset {
            if let Err(e) = self.usb.reset() {
                error!("bus reset failed: {:?}", e);
            }
            self.notify_bus(BusEvent::Reset);
        }

        if sts & usbsts::SLI != 0 {
            self.notify_bus(BusEvent::Suspend);
        }

        if sts & usbsts::SRI != 0 {
            if self.usb.iso_mask != 0 {
                self.usb.reprime_isochronous();
            } else {
                self.notify_bus(BusEvent::StartOfFrame);
            }
        }

        if sts & usbsts::PCI != 0 {
            self.usb.update_speed();
            let high_speed = self.usb.high_speed;
            self.notify_bus(BusEvent::Resume { high_speed });
        }

        // A reset in the same interrupt already retired every descriptor the completion bits
        // refer to.
        if sts & usbsts::UI != 0 && !reset {
            self.dispatch_transfers(complete);
        }

        if sts & usbsts::UEI != 0 {
            self.dispatch_errors(complete);
        }
    }

    fn dispatch_transfers(&mut self, complete: u32) {
        if self.usb.regs().read(Reg::EndptSetupStat) & 1 != 0 {
            self.notify_endpoint(0, EndpointEvent::Setup);
        }

        let in_complete = (complete >> 16) & ENDPOINT_MASK;
        for index in 0..NUM_ENDPOINTS {
            if in_complete & (1 << index) != 0 {
                self.usb
                    .regs()
                    .write(Reg::EndptComplete, endpoint_bit(index, true));
                self.notify_endpoint(index, EndpointEvent::In);
            }
        }

        // OUT completions stay latched until the handler reads the data, so only report the
        // ones that are new since the last interrupt.
        let out_complete = complete & ENDPOINT_MASK;
        let fresh = (out_complete ^ self.usb.cmpl_pending) & out_complete;
        for index in 0..NUM_ENDPOINTS {
            let bit = endpoint_bit(index, false);
            if fresh & bit != 0 {
                self.usb.cmpl_pending |= bit;
                self.notify_endpoint(index, EndpointEvent::Out);
            }
        }
    }

    fn dispatch_errors(&mut self, complete: u32) {
        for index in 0..NUM_ENDPOINTS {
            for direction in [Direction::Out, Direction::In] {
                let is_in = direction == Direction::In;
                if complete & endpoint_bit(index, is_in) == 0 {
                    continue;
                }
                let endpoint = EndpointAddress::from_parts(index, direction);
                let status = self.usb.error_status(endpoint);
                error!("transfer error on {:?}: {:#x}", endpoint, status);
                self.notify_bus(BusEvent::Error { endpoint, status });
            }
        }
    }
}
