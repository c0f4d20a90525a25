use crate::descriptor::{capabilities, token, DescriptorRing, NUM_ENDPOINTS, NUM_SLOTS, POOL_SIZE, TERMINATE};
use crate::driver::UsbDriver;
use crate::fmt::{error, info, trace, warn};
use crate::phy::init_controller;
use crate::regs::{endpoint_bit, endptctrl, portsc1, usbcmd, usbmode, usbsts, Reg, UsbRegisters};
use crate::Config;
use core::cell::RefCell;
use core::sync::atomic::{compiler_fence, Ordering};
use core::task::{Context, Poll};
use embassy_sync::waitqueue::AtomicWaker;
use embassy_usb_driver::{
    Direction, EndpointAddress, EndpointAllocError, EndpointError, EndpointType, Event,
};

/// Max packet size of the control endpoint.
pub const EP0_MAX_PACKET_SIZE: u16 = 64;

// The first part of the buffer pool always belongs to endpoint 0 OUT and IN.
pub(crate) const EP0_POOL_BYTES: usize = 2 * EP0_MAX_PACKET_SIZE as usize;

/// Mask covering one bit per logical endpoint in the ENDPTxxx registers.
pub(crate) const ENDPOINT_MASK: u32 = (1 << NUM_ENDPOINTS) - 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferError {
    /// The endpoint's transfer descriptor is still owned by the controller.
    Busy,
    /// A bounded busy-wait on the controller ran out.
    Timeout,
    /// The payload does not fit in the endpoint buffer, or the caller's buffer is too small.
    BufferOverflow,
    /// The endpoint has not been configured.
    Disabled,
}

impl From<TransferError> for EndpointError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::BufferOverflow => EndpointError::BufferOverflow,
            TransferError::Busy | TransferError::Timeout | TransferError::Disabled => {
                EndpointError::Disabled
            }
        }
    }
}

pub(crate) const fn out_slot(index: usize) -> usize {
    index * 2
}

pub(crate) const fn in_slot(index: usize) -> usize {
    index * 2 + 1
}

/// Descriptor slot of an endpoint direction, or `Disabled` for an endpoint number the controller
/// does not have.
pub(crate) fn slot_of(addr: EndpointAddress) -> Result<usize, TransferError> {
    if addr.index() >= NUM_ENDPOINTS {
        return Err(TransferError::Disabled);
    }
    Ok(match addr.direction() {
        Direction::Out => out_slot(addr.index()),
        Direction::In => in_slot(addr.index()),
    })
}

/// Software view of one endpoint direction.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct EndpointSlot {
    // Offset into the buffer pool, None until the endpoint has been configured.
    pub(crate) buf_offset: Option<usize>,
    // Bytes reserved at buf_offset.
    pub(crate) buf_len: usize,
    pub(crate) max_packet_size: u16,
    pub(crate) isochronous: bool,
}

/// Buffer bytes an endpoint needs: one packet, or three for isochronous endpoints.
pub(crate) fn buffer_len(ep_type: EndpointType, max_packet_size: u16) -> usize {
    let packets = match ep_type {
        EndpointType::Isochronous => 3,
        _ => 1,
    };
    packets * max_packet_size as usize
}

/// Busy-wait until `busy` returns false.
///
/// With no spin limit this blocks forever if the controller never acknowledges, which is how the
/// controller is documented to behave.  A limit turns a wedged controller into a Timeout error.
pub(crate) fn spin_while<R: UsbRegisters>(
    regs: &R,
    limit: Option<u32>,
    mut busy: impl FnMut(&R) -> bool,
) -> Result<(), TransferError> {
    let mut spins: u32 = 0;
    while busy(regs) {
        if let Some(limit) = limit {
            if spins >= limit {
                return Err(TransferError::Timeout);
            }
            spins += 1;
        }
        core::hint::spin_loop();
    }
    Ok(())
}

/// Owns the controller registers plus the descriptor memory and tracks per-endpoint state.
///
/// Everything that touches the transfer descriptors goes through here.  The interrupt dispatcher
/// and the endpoint handlers it calls are the only users, and they are serialized by the fact that
/// they all need `&mut ControllerState`.
pub struct ControllerState<'d, R: UsbRegisters> {
    regs: R,
    ring: &'d mut DescriptorRing,
    pub(crate) config: Config,
    pub(crate) endpoints: [EndpointSlot; NUM_SLOTS],
    // Bump allocator high-water mark in the buffer pool.
    buf_used: usize,
    // ENDPTPRIME bits of the isochronous OUT endpoints, re-primed every frame.
    pub(crate) iso_mask: u32,
    // OUT completions already reported to a handler but not yet consumed with read().
    pub(crate) cmpl_pending: u32,
    pub(crate) high_speed: bool,
}

impl<'d, R: UsbRegisters> ControllerState<'d, R> {
    pub fn new(regs: R, ring: &'d mut DescriptorRing, config: Config) -> Self {
        Self {
            regs,
            ring,
            config,
            endpoints: [EndpointSlot::default(); NUM_SLOTS],
            buf_used: EP0_POOL_BYTES,
            iso_mask: 0,
            cmpl_pending: 0,
            high_speed: false,
        }
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub(crate) fn spin_while(&self, busy: impl FnMut(&R) -> bool) -> Result<(), TransferError> {
        spin_while(&self.regs, self.config.spin_limit, busy)
    }

    /// Bring the controller back to its just-reset state.
    ///
    /// Disables every non-control endpoint, discards all pending status, flushes every primed
    /// buffer, rebuilds the endpoint 0 descriptors and primes endpoint 0 OUT to receive.  Every
    /// endpoint other than endpoint 0 is de-configured, so the host has to configure the device
    /// again before using them.
    pub fn reset(&mut self) -> Result<(), TransferError> {
        trace!("controller reset");
        self.cmpl_pending = 0;

        for n in 1..NUM_ENDPOINTS {
            self.regs
                .modify(Reg::EndptCtrl(n), |v| v & !(endptctrl::RXE | endptctrl::TXE));
        }

        self.regs.write(Reg::EndptNak, 0xffff_ffff);
        self.regs.write(Reg::EndptNakEn, 0);
        self.regs.write(Reg::UsbSts, 0xffff_ffff);
        let setup = self.regs.read(Reg::EndptSetupStat);
        self.regs.write(Reg::EndptSetupStat, setup);
        let complete = self.regs.read(Reg::EndptComplete);
        self.regs.write(Reg::EndptComplete, complete);
        self.spin_while(|r| r.read(Reg::EndptPrime) != 0)?;
        self.regs.write(Reg::EndptFlush, 0xffff_ffff);
        self.spin_while(|r| r.read(Reg::EndptFlush) != 0)?;
        // Interrupt on every transfer rather than batching them up.
        self.regs.modify(Reg::UsbCmd, |v| v & !usbcmd::ITC_MASK);

        self.ring.clear_descriptors();
        self.release_endpoints();

        let ep0 = EndpointSlot {
            buf_offset: None,
            buf_len: EP0_MAX_PACKET_SIZE as usize,
            max_packet_size: EP0_MAX_PACKET_SIZE,
            isochronous: false,
        };
        self.endpoints[out_slot(0)] = EndpointSlot {
            buf_offset: Some(0),
            ..ep0
        };
        self.endpoints[in_slot(0)] = EndpointSlot {
            buf_offset: Some(EP0_MAX_PACKET_SIZE as usize),
            ..ep0
        };

        let mps = EP0_MAX_PACKET_SIZE as u32;
        for slot in [out_slot(0), in_slot(0)] {
            let td_address = self.ring.td_address(slot);
            let td = &mut self.ring.td[slot];
            td.next_dtd = TERMINATE;
            td.set_token((mps << token::TOTAL_BYTES_SHIFT) | token::IOC);
            let qh = &mut self.ring.qh.0[slot];
            qh.next_dtd = td_address;
        }
        self.ring.qh.0[out_slot(0)].cap = ((mps & 0x0eff) << capabilities::MAX_PACKET_SHIFT)
            | capabilities::ZLT
            | capabilities::IOS;
        self.ring.qh.0[in_slot(0)].cap =
            (mps << capabilities::MAX_PACKET_SHIFT) | capabilities::ZLT | capabilities::IOS;

        self.regs
            .write(Reg::EndpointListAddr, self.ring.qh_list_address());
        self.regs.modify(Reg::UsbMode, |v| v | usbmode::SLOM);
        self.regs.write(Reg::EndptCtrl(0), endptctrl::CONTROL0);

        self.prime(EndpointAddress::from_parts(0, Direction::Out), mps as usize)
    }

    /// Forget every non-control endpoint and rewind the buffer pool to just past endpoint 0.
    pub(crate) fn release_endpoints(&mut self) {
        for slot in &mut self.endpoints[2..] {
            *slot = EndpointSlot::default();
        }
        self.buf_used = EP0_POOL_BYTES;
        self.iso_mask = 0;
    }

    fn allocate_buffer(&mut self, size: usize) -> Result<usize, EndpointAllocError> {
        if self.buf_used + size > POOL_SIZE {
            error!(
                "endpoint buffer pool exhausted: {} used, {} requested",
                self.buf_used, size
            );
            return Err(EndpointAllocError);
        }
        let offset = self.buf_used;
        self.buf_used += size;
        Ok(offset)
    }

    /// Configure an endpoint direction from its descriptor values.
    ///
    /// The first configuration of an endpoint reserves `max_packet_size` bytes from the buffer
    /// pool, three times that for isochronous endpoints so a high-bandwidth microframe fits.  The
    /// transfer descriptor is reset, and the endpoint is enabled with its data toggle
    /// reset.
    pub fn try_configure_endpoint(
        &mut self,
        addr: EndpointAddress,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) -> Result<(), EndpointAllocError> {
        let index = addr.index();
        let Ok(slot) = slot_of(addr) else {
            error!("endpoint {:?} out of range", addr);
            return Err(EndpointAllocError);
        };
        trace!(
            "configure endpoint {:?} type={:?} mps={}",
            addr,
            ep_type,
            max_packet_size
        );

        let isochronous = ep_type == EndpointType::Isochronous;
        if self.endpoints[slot].buf_offset.is_none() {
            let buf_len = buffer_len(ep_type, max_packet_size);
            let offset = self.allocate_buffer(buf_len)?;
            self.endpoints[slot] = EndpointSlot {
                buf_offset: Some(offset),
                buf_len,
                max_packet_size,
                isochronous,
            };
        }
        if isochronous && addr.is_out() {
            self.iso_mask |= endpoint_bit(index, false);
            self.regs.modify(Reg::UsbIntr, |v| v | usbsts::SRI);
        }

        if let Some(offset) = self.endpoints[slot].buf_offset {
            let buffer = self.ring.buffer_address(offset);
            let td = &mut self.ring.td[slot];
            td.clear();
            td.next_dtd = TERMINATE;
            td.buffer[0] = buffer;
        }
        self.ring.qh.0[slot].cap =
            ((max_packet_size as u32) << capabilities::MAX_PACKET_SHIFT) | capabilities::ZLT;

        let type_bits = match ep_type {
            EndpointType::Control => 0,
            EndpointType::Isochronous => 1,
            EndpointType::Bulk => 2,
            EndpointType::Interrupt => 3,
        };
        let shift = if addr.is_in() { endptctrl::IN_SHIFT } else { 0 };
        let bits = (type_bits << endptctrl::RXT_SHIFT) | endptctrl::RXR | endptctrl::RXE;
        self.regs.modify(Reg::EndptCtrl(index), |v| {
            (v & !(endptctrl::HALF_MASK << shift)) | (bits << shift)
        });
        Ok(())
    }

    /// Like `try_configure_endpoint()`, but running out of buffer space is fatal.
    ///
    /// The endpoint table is fixed when the firmware is built, so a failure here means the
    /// descriptors and the pool size disagree.
    pub fn configure_endpoint(
        &mut self,
        addr: EndpointAddress,
        ep_type: EndpointType,
        max_packet_size: u16,
    ) {
        if self
            .try_configure_endpoint(addr, ep_type, max_packet_size)
            .is_err()
        {
            panic!("unable to configure endpoint {:?}", addr);
        }
    }

    /// Zero for an endpoint that is not configured or does not exist.
    pub fn max_packet_size(&self, addr: EndpointAddress) -> u16 {
        slot_of(addr).map_or(0, |slot| self.endpoints[slot].max_packet_size)
    }

    /// Hand an endpoint's buffer to the controller for a transfer of `len` bytes.
    ///
    /// `len` may not exceed the buffer reserved for the endpoint.
    pub fn prime(&mut self, addr: EndpointAddress, len: usize) -> Result<(), TransferError> {
        let slot = slot_of(addr)?;
        let ep = self.endpoints[slot];
        let offset = ep.buf_offset.ok_or(TransferError::Disabled)?;
        if len > ep.buf_len {
            warn!("prime {:?}: {} bytes into a {} byte buffer", addr, len, ep.buf_len);
            return Err(TransferError::BufferOverflow);
        }
        if self.ring.td[slot].is_active() {
            warn!("prime {:?}: descriptor still active", addr);
            return Err(TransferError::Busy);
        }

        // High-bandwidth isochronous endpoints send up to three packets per microframe.
        let mult = if ep.isochronous {
            let mps = ep.max_packet_size as usize;
            let packets = if len <= mps {
                1
            } else if len <= 2 * mps {
                2
            } else {
                3
            };
            packets << token::MULTO_SHIFT
        } else {
            0
        };

        let buffer = self.ring.buffer_address(offset);
        let td_address = self.ring.td_address(slot);
        let td = &mut self.ring.td[slot];
        td.next_dtd = TERMINATE;
        td.buffer[0] = buffer;
        td.set_token(
            mult | ((len as u32) << token::TOTAL_BYTES_SHIFT) | token::IOC | token::ACTIVE,
        );
        let qh = &mut self.ring.qh.0[slot];
        qh.next_dtd = td_address;
        qh.token &= !(token::ACTIVE | token::HALTED);

        // The descriptor writes must land before the controller is told to go.
        compiler_fence(Ordering::SeqCst);

        let bit = endpoint_bit(addr.index(), addr.is_in());
        self.regs.write(Reg::EndptPrime, bit);
        self.spin_while(|r| r.read(Reg::EndptPrime) & bit != 0)
    }

    /// Read from an OUT endpoint.
    ///
    /// On endpoint 0 with a SETUP packet pending this returns the 8 setup bytes.  Otherwise it
    /// copies whatever the last OUT transfer received, acknowledges the completion, and primes the
    /// endpoint to receive again.  If `buf` is too small the excess is dropped and
    /// `BufferOverflow` is returned after the endpoint has been re-armed.
    pub fn read(&mut self, index: usize, buf: &mut [u8]) -> Result<usize, TransferError> {
        if index == 0 && self.regs.read(Reg::EndptSetupStat) & 1 != 0 {
            return self.read_setup(buf);
        }

        let slot = slot_of(EndpointAddress::from_parts(index, Direction::Out))?;
        let ep = self.endpoints[slot];
        let offset = ep.buf_offset.ok_or(TransferError::Disabled)?;
        let received = ep
            .max_packet_size
            .saturating_sub(self.ring.td[slot].remaining_bytes()) as usize;
        let copied = received.min(buf.len());
        buf[..copied].copy_from_slice(&self.ring.pool.0[offset..offset + copied]);

        let bit = endpoint_bit(index, false);
        self.regs.write(Reg::EndptComplete, bit);
        self.cmpl_pending &= !bit;
        self.prime(
            EndpointAddress::from_parts(index, Direction::Out),
            ep.max_packet_size as usize,
        )?;

        if copied < received {
            warn!("read ep{}: {} bytes received, buffer holds {}", index, received, copied);
            return Err(TransferError::BufferOverflow);
        }
        Ok(received)
    }

    fn read_setup(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        self.regs.write(Reg::EndptSetupStat, 1);
        self.spin_while(|r| r.read(Reg::EndptSetupStat) & 1 != 0)?;

        // The controller clears the tripwire if another SETUP packet lands while we copy, in which
        // case the copy has to be redone.
        let mut attempts: u32 = 0;
        let words = loop {
            self.regs.modify(Reg::UsbCmd, |v| v | usbcmd::SUTW);
            let words = self.ring.qh.0[out_slot(0)].setup_words();
            if self.regs.read(Reg::UsbCmd) & usbcmd::SUTW != 0 {
                break words;
            }
            attempts += 1;
            if matches!(self.config.spin_limit, Some(limit) if attempts >= limit) {
                return Err(TransferError::Timeout);
            }
        };
        self.regs.modify(Reg::UsbCmd, |v| v & !usbcmd::SUTW);

        // Anything still queued on endpoint 0 belongs to the previous control transfer.
        let ep0 = endpoint_bit(0, false) | endpoint_bit(0, true);
        self.regs.write(Reg::EndptFlush, ep0);
        self.spin_while(|r| r.read(Reg::EndptFlush) & ep0 != 0)?;
        self.spin_while(|r| r.read(Reg::EndptSetupStat) & 1 != 0)?;
        self.retire_descriptor(out_slot(0));
        self.retire_descriptor(in_slot(0));

        self.prime(
            EndpointAddress::from_parts(0, Direction::Out),
            EP0_MAX_PACKET_SIZE as usize,
        )?;

        let bytes: [u8; 8] = bytemuck::cast(words);
        if buf.len() < bytes.len() {
            return Err(TransferError::BufferOverflow);
        }
        buf[..8].copy_from_slice(&bytes);
        trace!("setup {:?}", bytes);
        Ok(8)
    }

    /// Queue `data` on an IN endpoint.  The payload must fit in one max-size packet.
    pub fn write(&mut self, index: usize, data: &[u8]) -> Result<usize, TransferError> {
        let slot = slot_of(EndpointAddress::from_parts(index, Direction::In))?;
        let ep = self.endpoints[slot];
        let offset = ep.buf_offset.ok_or(TransferError::Disabled)?;
        if data.len() > ep.max_packet_size as usize {
            return Err(TransferError::BufferOverflow);
        }
        if self.ring.td[slot].is_active() {
            return Err(TransferError::Busy);
        }
        self.ring.pool.0[offset..offset + data.len()].copy_from_slice(data);
        self.prime(EndpointAddress::from_parts(index, Direction::In), data.len())?;
        Ok(data.len())
    }

    /// Re-arm every isochronous OUT endpoint for the new frame.
    pub(crate) fn reprime_isochronous(&mut self) {
        for index in 0..NUM_ENDPOINTS {
            if self.iso_mask & endpoint_bit(index, false) == 0 {
                continue;
            }
            let addr = EndpointAddress::from_parts(index, Direction::Out);
            let mps = self.max_packet_size(addr) as usize;
            if let Err(e) = self.prime(addr, mps) {
                warn!("iso ep{} not re-primed: {:?}", index, e);
            }
        }
    }

    /// Error bits of the last transfer on an endpoint.
    pub(crate) fn error_status(&self, addr: EndpointAddress) -> u8 {
        slot_of(addr).map_or(0, |slot| (self.ring.td[slot].token() & token::ERROR_MASK) as u8)
    }

    pub(crate) fn update_speed(&mut self) {
        let pspd = (self.regs.read(Reg::PortSc1) >> portsc1::PSPD_SHIFT) & portsc1::PSPD_MASK;
        self.high_speed = pspd == portsc1::PSPD_HIGH;
    }

    pub(crate) fn queue_head_token_and(&mut self, slot: usize, mask: u32) {
        self.ring.qh.0[slot].token &= mask;
    }

    #[cfg(test)]
    pub(crate) fn queue_head_token(&self, slot: usize) -> u32 {
        self.ring.qh.0[slot].token
    }

    pub(crate) fn transfer_active(&self, slot: usize) -> bool {
        self.ring.td[slot].is_active()
    }

    pub(crate) fn retire_descriptor(&mut self, slot: usize) {
        let td = &mut self.ring.td[slot];
        let retired = td.token() & !token::ACTIVE;
        td.set_token(retired);
    }

    #[cfg(test)]
    pub(crate) fn ring_mut(&mut self) -> &mut DescriptorRing {
        self.ring
    }
}

// Woken by `on_bus_interrupt()`.  Global because the interrupt handler has nothing else to reach.
pub(crate) static BUS_WAKER: AtomicWaker = AtomicWaker::new();

// Interrupt sources serviced by `Bus::poll()`.  SOF is added while isochronous OUT endpoints
// need re-priming.
const BUS_INTERRUPTS: u32 = usbsts::UI | usbsts::UEI | usbsts::PCI | usbsts::URI | usbsts::SLI;

/// Controller state for use with `embassy-usb`.
///
/// Owns the controller and is shared by the `UsbDriver` and the bus, control pipe and endpoints
/// it hands out.  The interrupt handler never touches it: `on_bus_interrupt()` only masks the
/// controller interrupts and wakes `Bus::poll()`, which does the work from task context.
pub struct State<'d, R: UsbRegisters> {
    pub(crate) shared: RefCell<Shared<'d, R>>,
}

impl<'d, R: UsbRegisters> State<'d, R> {
    /// `ring` is handed to the controller's DMA engine and must not move while the state exists.
    pub fn new(regs: R, ring: &'d mut DescriptorRing, config: Config) -> Self {
        Self {
            shared: RefCell::new(Shared::new(ControllerState::new(regs, ring, config))),
        }
    }

    /// The driver to pass to `embassy_usb::Builder`.
    pub fn driver(&'d self) -> UsbDriver<'d, R> {
        UsbDriver::new(&self.shared)
    }
}

// The RefCell is only ever borrowed inside a single poll, never across an await point.
pub(crate) struct Shared<'d, R: UsbRegisters> {
    pub(crate) usb: ControllerState<'d, R>,
    power_reported: bool,
    suspended: bool,
    // ENDPTxxx bits of the endpoints currently enabled.
    enabled: u32,
    // Type and max packet size of each endpoint handed out by the driver, applied whenever the
    // host enables it.
    pub(crate) allocated: [Option<(EndpointType, u16)>; NUM_SLOTS],
    wakers: [AtomicWaker; NUM_SLOTS],
}

impl<'d, R: UsbRegisters> Shared<'d, R> {
    fn new(usb: ControllerState<'d, R>) -> Self {
        Self {
            usb,
            power_reported: false,
            suspended: false,
            enabled: 0,
            allocated: [None; NUM_SLOTS],
            wakers: core::array::from_fn(|_| AtomicWaker::new()),
        }
    }

    /// Bring up the controller and perform an initial bus reset.  The device stays detached
    /// until `Bus::enable()`.
    pub(crate) fn start(&mut self) {
        info!("usb start");
        let config = self.usb.config;
        if let Err(e) = init_controller(self.usb.regs(), &config) {
            error!("controller init failed: {:?}", e);
        }
        self.bus_reset();
        self.unmask_interrupts();
    }

    fn bus_reset(&mut self) {
        if let Err(e) = self.usb.reset() {
            error!("bus reset failed: {:?}", e);
        }
        self.enabled = endpoint_bit(0, false) | endpoint_bit(0, true);
        for waker in &self.wakers {
            waker.wake();
        }
    }

    fn unmask_interrupts(&self) {
        let sof = if self.usb.iso_mask != 0 { usbsts::SRI } else { 0 };
        self.usb.regs().write(Reg::UsbIntr, BUS_INTERRUPTS | sof);
    }

    pub(crate) fn poll_bus(&mut self, cx: &mut Context) -> Poll<Event> {
        BUS_WAKER.register(cx.waker());

        // Anything not handled before an event is returned stays latched in USBSTS, so the
        // interrupt fires again as soon as it is unmasked.
        let result = self.process_interrupts();
        self.unmask_interrupts();
        result
    }

    fn process_interrupts(&mut self) -> Poll<Event> {
        // There is no VBUS sensing, so the bus counts as powered from the start.
        if !self.power_reported {
            self.power_reported = true;
            return Poll::Ready(Event::PowerDetected);
        }

        let sts = self.usb.regs().read(Reg::UsbSts) & (BUS_INTERRUPTS | usbsts::SRI);

        if sts & usbsts::URI != 0 {
            trace!("bus reset");
            self.usb.regs().write(Reg::UsbSts, usbsts::URI);
            self.suspended = false;
            self.bus_reset();
            return Poll::Ready(Event::Reset);
        }

        if sts & usbsts::SLI != 0 {
            self.usb.regs().write(Reg::UsbSts, usbsts::SLI);
            if !self.suspended {
                self.suspended = true;
                return Poll::Ready(Event::Suspend);
            }
        }

        if sts & usbsts::PCI != 0 {
            self.usb.regs().write(Reg::UsbSts, usbsts::PCI);
            self.usb.update_speed();
            if self.suspended {
                self.suspended = false;
                return Poll::Ready(Event::Resume);
            }
        }

        if sts & usbsts::SRI != 0 {
            self.usb.regs().write(Reg::UsbSts, usbsts::SRI);
            self.usb.reprime_isochronous();
        }

        if sts & (usbsts::UI | usbsts::UEI) != 0 {
            let regs = self.usb.regs();
            regs.write(Reg::UsbSts, sts & (usbsts::UI | usbsts::UEI));
            if regs.read(Reg::EndptSetupStat) & 1 != 0 {
                self.wakers[out_slot(0)].wake();
            }
            let complete = regs.read(Reg::EndptComplete);
            for index in 0..NUM_ENDPOINTS {
                for direction in [Direction::Out, Direction::In] {
                    let is_in = direction == Direction::In;
                    if complete & endpoint_bit(index, is_in) == 0 {
                        continue;
                    }
                    let addr = EndpointAddress::from_parts(index, direction);
                    if sts & usbsts::UEI != 0 {
                        let status = self.usb.error_status(addr);
                        if status != 0 {
                            error!("transfer error on {:?}: {:#x}", addr, status);
                        }
                    }
                    self.wakers[if is_in { in_slot(index) } else { out_slot(index) }].wake();
                }
            }
        }

        Poll::Pending
    }

    pub(crate) fn poll_setup(&mut self, cx: &mut Context) -> Poll<[u8; 8]> {
        self.wakers[out_slot(0)].register(cx.waker());
        if self.usb.regs().read(Reg::EndptSetupStat) & 1 == 0 {
            return Poll::Pending;
        }

        // Completions from the previous control transfer mean nothing now.
        let ep0 = endpoint_bit(0, false) | endpoint_bit(0, true);
        self.usb.regs().write(Reg::EndptComplete, ep0);

        let mut setup = [0u8; 8];
        match self.usb.read(0, &mut setup) {
            Ok(_) => {
                // A data stage still waiting on endpoint 0 IN belongs to the old request.
                self.wakers[in_slot(0)].wake();
                Poll::Ready(setup)
            }
            Err(e) => {
                error!("reading SETUP failed: {:?}", e);
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    pub(crate) fn poll_enabled(&mut self, cx: &mut Context, addr: EndpointAddress) -> Poll<()> {
        let Ok(slot) = slot_of(addr) else {
            return Poll::Pending;
        };
        self.wakers[slot].register(cx.waker());
        if self.enabled & endpoint_bit(addr.index(), addr.is_in()) != 0 {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    /// Take the data of a finished OUT transfer, which also re-arms the endpoint.
    pub(crate) fn poll_read(
        &mut self,
        cx: &mut Context,
        index: usize,
        buf: &mut [u8],
    ) -> Poll<Result<usize, EndpointError>> {
        let slot = out_slot(index);
        self.wakers[slot].register(cx.waker());
        let bit = endpoint_bit(index, false);
        if self.enabled & bit == 0 {
            return Poll::Ready(Err(EndpointError::Disabled));
        }
        let regs = self.usb.regs();
        if index == 0 && regs.read(Reg::EndptSetupStat) & 1 != 0 {
            trace!("SETUP arrived during the data stage");
            return Poll::Ready(Err(EndpointError::Disabled));
        }
        if regs.read(Reg::EndptComplete) & bit == 0 || self.usb.transfer_active(slot) {
            return Poll::Pending;
        }
        Poll::Ready(self.usb.read(index, buf).map_err(EndpointError::from))
    }

    /// Queue one packet once the previous one on the endpoint has gone out.
    pub(crate) fn poll_write(
        &mut self,
        cx: &mut Context,
        index: usize,
        data: &[u8],
    ) -> Poll<Result<(), EndpointError>> {
        let slot = in_slot(index);
        self.wakers[slot].register(cx.waker());
        let bit = endpoint_bit(index, true);
        if self.enabled & bit == 0 {
            return Poll::Ready(Err(EndpointError::Disabled));
        }
        if self.usb.transfer_active(slot) {
            return Poll::Pending;
        }
        self.usb.regs().write(Reg::EndptComplete, bit);
        Poll::Ready(
            self.usb
                .write(index, data)
                .map(|_| ())
                .map_err(EndpointError::from),
        )
    }

    pub(crate) fn set_enabled(&mut self, addr: EndpointAddress, enabled: bool) {
        let Ok(slot) = slot_of(addr) else {
            warn!("no endpoint {:?} to enable", addr);
            return;
        };
        if addr.index() == 0 {
            // The control endpoint stays on for as long as the controller runs.
            return;
        }
        let bit = endpoint_bit(addr.index(), addr.is_in());
        if enabled {
            let Some((ep_type, max_packet_size)) = self.allocated[slot] else {
                warn!("{:?} was never allocated", addr);
                return;
            };
            if self
                .usb
                .try_configure_endpoint(addr, ep_type, max_packet_size)
                .is_err()
            {
                return;
            }
            if addr.is_out() && !self.usb.transfer_active(slot) {
                if let Err(e) = self.usb.prime(addr, max_packet_size as usize) {
                    warn!("{:?} not primed: {:?}", addr, e);
                }
            }
            self.enabled |= bit;
        } else {
            self.enabled &= !bit;
            let result = self
                .usb
                .flush_endpoint(addr)
                .and_then(|_| self.usb.disable_endpoint(addr));
            if let Err(e) = result {
                warn!("disabling {:?}: {:?}", addr, e);
            }
        }
        self.unmask_interrupts();
        self.wakers[slot].wake();
    }

    pub(crate) fn set_stalled(&mut self, addr: EndpointAddress, stalled: bool) {
        let result = if stalled {
            self.usb.set_stall(addr)
        } else {
            self.usb.clear_stall(addr)
        };
        if let Err(e) = result {
            warn!("stall {:?} {}: {:?}", addr, stalled, e);
        }
        if let Ok(slot) = slot_of(addr) {
            self.wakers[slot].wake();
        }
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended
    }
}
