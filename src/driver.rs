use crate::bus::Bus;
use crate::control_pipe::ControlPipe;
use crate::descriptor::{DescriptorRing, NUM_ENDPOINTS, POOL_SIZE};
use crate::endpoint::{BusEvent, BusHandler, EndpointEvent, EndpointHandler};
use crate::endpoint::{EndpointIn, EndpointOut};
use crate::fmt::{error, info, trace, warn};
use crate::phy::init_controller;
use crate::regs::{usbsts, Reg, UsbRegisters};
use crate::state::{buffer_len, in_slot, out_slot, ControllerState, Shared, TransferError};
use crate::state::{EP0_MAX_PACKET_SIZE, EP0_POOL_BYTES};
use crate::Config;
use core::cell::RefCell;
use embassy_usb_driver::{Direction, EndpointAllocError, EndpointType};

/// The USB device: the controller plus the handlers its interrupt dispatches to.
///
/// The board owns one of these and calls `on_interrupt()` from the USB0 interrupt.  Foreground
/// code that needs the controller (for instance to disconnect after a firmware update) has to
/// exclude the interrupt while it does so, typically by keeping the driver in a critical-section
/// mutex.
pub struct Driver<'d, R: UsbRegisters> {
    pub(crate) usb: ControllerState<'d, R>,
    pub(crate) ep_handlers: [Option<&'d mut dyn EndpointHandler<R>>; NUM_ENDPOINTS],
    pub(crate) bus_handler: Option<&'d mut dyn BusHandler>,
}

impl<'d, R: UsbRegisters> Driver<'d, R> {
    /// `ring` is handed to the controller's DMA engine and must not move while the driver exists.
    pub fn new(regs: R, ring: &'d mut DescriptorRing, config: Config) -> Self {
        Self {
            usb: ControllerState::new(regs, ring, config),
            ep_handlers: [(); NUM_ENDPOINTS].map(|_| None),
            bus_handler: None,
        }
    }

    /// Bring up the controller in device mode and perform an initial bus reset.
    ///
    /// Register handlers first: SOF and error interrupts are only enabled when a bus handler
    /// exists.  The device stays disconnected until `connect(true)`.
    pub fn init(&mut self) -> Result<(), TransferError> {
        info!("usb init");
        let config = self.usb.config;
        init_controller(self.usb.regs(), &config)?;

        let mut intr = usbsts::UI | usbsts::PCI | usbsts::SLI | usbsts::URI;
        if self.bus_handler.is_some() {
            intr |= usbsts::SRI | usbsts::UEI;
        }
        self.usb.regs().write(Reg::UsbIntr, intr);
        self.usb.reset()
    }

    /// Register the handler for a logical endpoint, replacing any previous one.
    pub fn on_event(&mut self, ep: usize, handler: &'d mut dyn EndpointHandler<R>) {
        if ep >= NUM_ENDPOINTS {
            warn!("no endpoint {} to register a handler for", ep);
            return;
        }
        self.ep_handlers[ep] = Some(handler);
    }

    pub fn on_bus_event(&mut self, handler: &'d mut dyn BusHandler) {
        self.bus_handler = Some(handler);
    }

    pub fn connect(&mut self, connect: bool) {
        self.usb.connect(connect);
    }

    /// The controller, for foreground operations and endpoint setup.
    pub fn controller(&mut self) -> &mut ControllerState<'d, R> {
        &mut self.usb
    }

    pub(crate) fn notify_endpoint(&mut self, ep: usize, event: EndpointEvent) {
        match self.ep_handlers[ep].as_deref_mut() {
            Some(handler) => handler.on_event(&mut self.usb, ep, event),
            None => warn!("ep{} {:?} with no handler", ep, event),
        }
    }

    pub(crate) fn notify_bus(&mut self, event: BusEvent) {
        if let Some(handler) = self.bus_handler.as_deref_mut() {
            handler.on_bus_event(event);
        }
    }
}

/// `embassy_usb_driver::Driver` over the controller, obtained from `State::driver()`.
///
/// Endpoint numbers are handed out in order, starting at 1 for each direction, and every
/// allocation reserves its buffer space up front so that enabling the endpoints later cannot run
/// the pool dry.
pub struct UsbDriver<'d, R: UsbRegisters> {
    state: &'d RefCell<Shared<'d, R>>,
    pool_used: usize,
}

impl<'d, R: UsbRegisters> UsbDriver<'d, R> {
    pub(crate) fn new(state: &'d RefCell<Shared<'d, R>>) -> Self {
        Self {
            state,
            pool_used: EP0_POOL_BYTES,
        }
    }

    fn alloc_endpoint(
        &mut self,
        direction: Direction,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) -> Result<usize, EndpointAllocError> {
        let slot_of = |index| match direction {
            Direction::Out => out_slot(index),
            Direction::In => in_slot(index),
        };
        let mut shared = self.state.borrow_mut();

        let Some(index) = (0..NUM_ENDPOINTS).find(|&index| {
            // Endpoint 0 is reserved for the control pipe.
            (index == 0) == (ep_type == EndpointType::Control)
                && shared.allocated[slot_of(index)].is_none()
        }) else {
            error!("no free {:?} endpoint for {:?}", direction, ep_type);
            return Err(EndpointAllocError);
        };

        if index != 0 {
            let len = buffer_len(ep_type, max_packet_size);
            if self.pool_used + len > POOL_SIZE {
                error!(
                    "not enough buffer space for a {}-byte endpoint: {} of {} used",
                    len, self.pool_used, POOL_SIZE
                );
                return Err(EndpointAllocError);
            }
            self.pool_used += len;
        }

        trace!("allocating endpoint {} {:?}", index, direction);
        shared.allocated[slot_of(index)] = Some((ep_type, max_packet_size));
        Ok(index)
    }
}

impl<'d, R: UsbRegisters> embassy_usb_driver::Driver<'d> for UsbDriver<'d, R> {
    type EndpointOut = EndpointOut<'d, R>;
    type EndpointIn = EndpointIn<'d, R>;
    type ControlPipe = ControlPipe<'d, R>;
    type Bus = Bus<'d, R>;

    fn alloc_endpoint_in(
        &mut self,
        ep_type: EndpointType,
        max_packet_size: u16,
        interval_ms: u8,
    ) -> Result<Self::EndpointIn, EndpointAllocError> {
        trace!(
            "alloc_endpoint_in(type={:?}, mps={}, interval={}ms)",
            ep_type,
            max_packet_size,
            interval_ms,
        );
        let index = self.alloc_endpoint(Direction::In, ep_type, max_packet_size)?;
        Ok(EndpointIn::new(
            self.state,
            index,
            ep_type,
            max_packet_size,
            interval_ms,
        ))
    }

    fn alloc_endpoint_out(
        &mut self,
        ep_type: EndpointType,
        max_packet_size: u16,
        interval_ms: u8,
    ) -> Result<Self::EndpointOut, EndpointAllocError> {
        trace!(
            "alloc_endpoint_out(type={:?}, mps={}, interval={}ms)",
            ep_type,
            max_packet_size,
            interval_ms,
        );
        let index = self.alloc_endpoint(Direction::Out, ep_type, max_packet_size)?;
        Ok(EndpointOut::new(
            self.state,
            index,
            ep_type,
            max_packet_size,
            interval_ms,
        ))
    }

    /// # Panics
    ///
    /// If `control_max_packet_size` is not 64, the only size the endpoint 0 descriptors are built
    /// for.
    fn start(mut self, control_max_packet_size: u16) -> (Self::Bus, Self::ControlPipe) {
        if control_max_packet_size != EP0_MAX_PACKET_SIZE {
            panic!(
                "unsupported control endpoint max packet size {}",
                control_max_packet_size
            );
        }

        let (Ok(ep_out), Ok(ep_in)) = (
            self.alloc_endpoint_out(EndpointType::Control, control_max_packet_size, 0),
            self.alloc_endpoint_in(EndpointType::Control, control_max_packet_size, 0),
        ) else {
            panic!("control endpoint already allocated");
        };

        trace!("start");
        self.state.borrow_mut().start();

        (Bus::new(self.state), ControlPipe::new(ep_in, ep_out))
    }
}
