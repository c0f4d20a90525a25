// Bus-level and per-endpoint control operations, used by the chapter 9 request handling.

use crate::descriptor::token;
use crate::fmt::{trace, warn};
use crate::regs::{deviceaddr, endpoint_bit, endptctrl, portsc1, usbcmd, Reg, UsbRegisters};
use crate::state::{slot_of, ControllerState, Shared, TransferError};
use core::cell::RefCell;
use core::future::poll_fn;
use embassy_usb_driver::{Direction, EndpointAddress, Event, Unsupported};

impl<'d, R: UsbRegisters> ControllerState<'d, R> {
    /// Attach to (true) or detach from (false) the bus by setting the run/stop bit.
    pub fn connect(&mut self, connect: bool) {
        trace!("connect {}", connect);
        if connect {
            self.regs().modify(Reg::UsbCmd, |v| v | usbcmd::RS);
        } else {
            self.regs().modify(Reg::UsbCmd, |v| v & !usbcmd::RS);
        }
    }

    /// Set the device address.  The controller applies it after the status stage completes.
    pub fn set_address(&mut self, address: u8) {
        trace!("set_address {}", address);
        self.regs().write(
            Reg::DeviceAddr,
            ((address as u32) << deviceaddr::USBADR_SHIFT) | deviceaddr::USBADRA,
        );
    }

    /// Signal remote wakeup to the host.
    pub fn wake_up(&mut self) {
        self.regs().modify(Reg::PortSc1, |v| v | portsc1::FPR);
    }

    /// Enter (true) or leave (false) the configured state.
    ///
    /// Leaving it drops every non-control endpoint and returns their buffer space to the pool.
    pub fn configure(&mut self, configured: bool) {
        trace!("configure {}", configured);
        if !configured {
            self.release_endpoints();
        }
    }

    pub fn enable_endpoint(&mut self, addr: EndpointAddress) -> Result<(), TransferError> {
        slot_of(addr)?;
        let bit = enable_bit(addr);
        self.regs()
            .modify(Reg::EndptCtrl(addr.index()), |v| v | bit);
        Ok(())
    }

    pub fn disable_endpoint(&mut self, addr: EndpointAddress) -> Result<(), TransferError> {
        slot_of(addr)?;
        let bit = enable_bit(addr);
        self.regs()
            .modify(Reg::EndptCtrl(addr.index()), |v| v & !bit);
        Ok(())
    }

    /// Flush an endpoint and reset its data toggle.  OUT endpoints are primed to receive again.
    pub fn reset_endpoint(&mut self, addr: EndpointAddress) -> Result<(), TransferError> {
        trace!("reset_endpoint {:?}", addr);
        self.flush_endpoint(addr)?;

        let toggle = match addr.direction() {
            Direction::Out => endptctrl::RXR,
            Direction::In => endptctrl::TXR,
        };
        self.regs()
            .modify(Reg::EndptCtrl(addr.index()), |v| v | toggle);

        if addr.is_out() {
            let mps = self.max_packet_size(addr) as usize;
            self.prime(addr, mps)?;
        }
        Ok(())
    }

    /// Cancel whatever is queued on an endpoint.
    pub(crate) fn flush_endpoint(&mut self, addr: EndpointAddress) -> Result<(), TransferError> {
        let slot = slot_of(addr)?;
        self.clear_queue_head_status(slot);

        let bit = endpoint_bit(addr.index(), addr.is_in());
        self.regs().write(Reg::EndptFlush, bit);
        self.spin_while(|r| r.read(Reg::EndptFlush) & bit != 0)?;
        self.retire_descriptor(slot);
        Ok(())
    }

    pub fn set_stall(&mut self, addr: EndpointAddress) -> Result<(), TransferError> {
        trace!("set_stall {:?}", addr);
        slot_of(addr)?;
        let bit = stall_bit(addr);
        self.regs()
            .modify(Reg::EndptCtrl(addr.index()), |v| v | bit);
        Ok(())
    }

    /// Clear a stall and reset the data toggle.  IN endpoints are also flushed.
    pub fn clear_stall(&mut self, addr: EndpointAddress) -> Result<(), TransferError> {
        trace!("clear_stall {:?}", addr);
        slot_of(addr)?;
        let index = addr.index();
        let (stall, toggle) = match addr.direction() {
            Direction::Out => (endptctrl::RXS, endptctrl::RXR),
            Direction::In => (endptctrl::TXS, endptctrl::TXR),
        };
        self.regs().modify(Reg::EndptCtrl(index), |v| v & !stall);
        self.regs().modify(Reg::EndptCtrl(index), |v| v | toggle);
        if addr.is_in() {
            self.spin_while(|r| r.read(Reg::EndptCtrl(index)) & stall != 0)?;
            self.reset_endpoint(addr)?;
        }
        Ok(())
    }

    /// False for an endpoint that does not exist.
    pub fn is_stalled(&self, addr: EndpointAddress) -> bool {
        slot_of(addr).is_ok()
            && self.regs().read(Reg::EndptCtrl(addr.index())) & stall_bit(addr) != 0
    }

    /// Current (micro)frame number.
    pub fn frame_number(&self) -> u16 {
        ((self.regs().read(Reg::FrIndex) >> 3) & 0x07ff) as u16
    }

    /// Whether the last port change negotiated high speed.
    pub fn is_high_speed(&self) -> bool {
        self.high_speed
    }

    fn clear_queue_head_status(&mut self, slot: usize) {
        self.queue_head_token_and(slot, !(token::ACTIVE | token::HALTED));
    }
}

pub struct Bus<'d, R: UsbRegisters> {
    state: &'d RefCell<Shared<'d, R>>,
}

impl<'d, R: UsbRegisters> Bus<'d, R> {
    pub(crate) fn new(state: &'d RefCell<Shared<'d, R>>) -> Self {
        Self { state }
    }
}

impl<'d, R: UsbRegisters> embassy_usb_driver::Bus for Bus<'d, R> {
    async fn enable(&mut self) {
        self.state.borrow_mut().usb.connect(true);
    }

    async fn disable(&mut self) {
        self.state.borrow_mut().usb.connect(false);
    }

    async fn poll(&mut self) -> Event {
        poll_fn(|cx| self.state.borrow_mut().poll_bus(cx)).await
    }

    fn endpoint_set_enabled(&mut self, ep_addr: EndpointAddress, enabled: bool) {
        trace!("endpoint_set_enabled ep={:?} en={}", ep_addr, enabled);
        self.state.borrow_mut().set_enabled(ep_addr, enabled);
    }

    fn endpoint_set_stalled(&mut self, ep_addr: EndpointAddress, stalled: bool) {
        trace!("endpoint_set_stalled ep={:?} en={}", ep_addr, stalled);
        self.state.borrow_mut().set_stalled(ep_addr, stalled);
    }

    fn endpoint_is_stalled(&mut self, ep_addr: EndpointAddress) -> bool {
        self.state.borrow().usb.is_stalled(ep_addr)
    }

    async fn remote_wakeup(&mut self) -> Result<(), Unsupported> {
        let mut shared = self.state.borrow_mut();
        if !shared.is_suspended() {
            warn!("remote wakeup while not suspended");
        }
        shared.usb.wake_up();
        Ok(())
    }
}

fn enable_bit(addr: EndpointAddress) -> u32 {
    match addr.direction() {
        Direction::Out => endptctrl::RXE,
        Direction::In => endptctrl::TXE,
    }
}

fn stall_bit(addr: EndpointAddress) -> u32 {
    match addr.direction() {
        Direction::Out => endptctrl::RXS,
        Direction::In => endptctrl::TXS,
    }
}
