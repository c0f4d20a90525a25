use crate::fmt::trace;
use crate::regs::UsbRegisters;
use crate::state::{ControllerState, Shared};
use core::cell::RefCell;
use core::future::poll_fn;
use embassy_usb_driver::{Direction, EndpointAddress, EndpointError, EndpointInfo, EndpointType};

/// Transfer events delivered to the handler registered for a logical endpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointEvent {
    /// A SETUP packet is waiting on endpoint 0.  Read it with `ControllerState::read()`.
    Setup,
    /// An OUT transfer finished.  Reported once until the data is consumed with `read()`.
    Out,
    /// An IN transfer finished and the endpoint buffer is free again.
    In,
}

/// Device-wide events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusEvent {
    /// The host reset the bus.  Every endpoint other than endpoint 0 is gone.
    Reset,
    Suspend,
    /// Port status changed, typically on resume or once speed negotiation finishes.
    Resume { high_speed: bool },
    /// Start of frame, only reported when no isochronous endpoint consumed it.
    StartOfFrame,
    /// A transfer failed.  `status` holds the descriptor's halted/buffer/transaction error bits.
    Error { endpoint: EndpointAddress, status: u8 },
}

/// Receives transfer events for one logical endpoint.
///
/// The handler gets the controller so it can move data during the callback.  Callbacks run in
/// interrupt context and must not block.
pub trait EndpointHandler<R: UsbRegisters> {
    fn on_event(&mut self, usb: &mut ControllerState<'_, R>, ep: usize, event: EndpointEvent);
}

pub trait BusHandler {
    fn on_bus_event(&mut self, event: BusEvent);
}

pub struct EndpointIn<'d, R: UsbRegisters> {
    state: &'d RefCell<Shared<'d, R>>,
    pub(crate) info: EndpointInfo,
}

pub struct EndpointOut<'d, R: UsbRegisters> {
    state: &'d RefCell<Shared<'d, R>>,
    pub(crate) info: EndpointInfo,
}

impl<'d, R: UsbRegisters> EndpointIn<'d, R> {
    pub(crate) fn new(
        state: &'d RefCell<Shared<'d, R>>,
        index: usize,
        ep_type: EndpointType,
        max_packet_size: u16,
        interval_ms: u8,
    ) -> Self {
        Self {
            state,
            info: EndpointInfo {
                addr: EndpointAddress::from_parts(index, Direction::In),
                ep_type,
                max_packet_size,
                interval_ms,
            },
        }
    }

    pub(crate) fn state(&self) -> &'d RefCell<Shared<'d, R>> {
        self.state
    }
}

impl<'d, R: UsbRegisters> EndpointOut<'d, R> {
    pub(crate) fn new(
        state: &'d RefCell<Shared<'d, R>>,
        index: usize,
        ep_type: EndpointType,
        max_packet_size: u16,
        interval_ms: u8,
    ) -> Self {
        Self {
            state,
            info: EndpointInfo {
                addr: EndpointAddress::from_parts(index, Direction::Out),
                ep_type,
                max_packet_size,
                interval_ms,
            },
        }
    }
}

impl<'d, R: UsbRegisters> embassy_usb_driver::Endpoint for EndpointIn<'d, R> {
    fn info(&self) -> &EndpointInfo {
        &self.info
    }

    async fn wait_enabled(&mut self) {
        let addr = self.info.addr;
        poll_fn(|cx| self.state.borrow_mut().poll_enabled(cx, addr)).await
    }
}

impl<'d, R: UsbRegisters> embassy_usb_driver::Endpoint for EndpointOut<'d, R> {
    fn info(&self) -> &EndpointInfo {
        &self.info
    }

    async fn wait_enabled(&mut self) {
        let addr = self.info.addr;
        poll_fn(|cx| self.state.borrow_mut().poll_enabled(cx, addr)).await
    }
}

impl<'d, R: UsbRegisters> embassy_usb_driver::EndpointOut for EndpointOut<'d, R> {
    /// Wait for the next packet.  Every call consumes exactly one packet, so `buf` must not be
    /// larger than the max packet size.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, EndpointError> {
        let index = self.info.addr.index();
        trace!("OUT EP{} read len={}", index, buf.len());
        if buf.len() > self.info.max_packet_size as usize {
            return Err(EndpointError::BufferOverflow);
        }
        poll_fn(|cx| self.state.borrow_mut().poll_read(cx, index, buf)).await
    }
}

impl<'d, R: UsbRegisters> embassy_usb_driver::EndpointIn for EndpointIn<'d, R> {
    /// Queue one packet.  Returns once the controller owns it, which may be before the host has
    /// collected it.
    async fn write(&mut self, buf: &[u8]) -> Result<(), EndpointError> {
        let index = self.info.addr.index();
        trace!("IN EP{} write: {:?}", index, buf);
        if buf.len() > self.info.max_packet_size as usize {
            return Err(EndpointError::BufferOverflow);
        }
        poll_fn(|cx| self.state.borrow_mut().poll_write(cx, index, buf)).await
    }
}
