use crate::endpoint::{EndpointIn, EndpointOut};
use crate::fmt::{trace, warn};
use crate::regs::UsbRegisters;
use crate::state::{ControllerState, Shared, TransferError};
use core::cell::RefCell;
use core::future::poll_fn;
use embassy_usb_driver::{Direction, EndpointAddress, EndpointError};
use embassy_usb_driver::{EndpointIn as _, EndpointOut as _};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// A decoded SETUP packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(buf: &[u8; 8]) -> Self {
        Self {
            request_type: buf[0],
            request: buf[1],
            value: u16::from_le_bytes([buf[2], buf[3]]),
            index: u16::from_le_bytes([buf[4], buf[5]]),
            length: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0x3 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1f {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }
}

// Endpoint 0 data and status stage helpers.
impl<'d, R: UsbRegisters> ControllerState<'d, R> {
    /// Send the data stage of an IN control transfer.
    pub fn control_in(&mut self, data: &[u8]) -> Result<usize, TransferError> {
        trace!("control_in {} bytes", data.len());
        self.write(0, data)
    }

    /// Complete an OUT control transfer with a zero-length status packet.
    pub fn control_accept(&mut self) -> Result<(), TransferError> {
        trace!("control_accept");
        self.write(0, &[]).map(|_| ())
    }

    /// Refuse the request by stalling both directions of endpoint 0.
    pub fn control_reject(&mut self) -> Result<(), TransferError> {
        trace!("control_reject");
        self.set_stall(EndpointAddress::from_parts(0, Direction::Out))?;
        self.set_stall(EndpointAddress::from_parts(0, Direction::In))
    }
}

pub struct ControlPipe<'d, R: UsbRegisters> {
    ep_in: EndpointIn<'d, R>,
    ep_out: EndpointOut<'d, R>,
}

impl<'d, R: UsbRegisters> ControlPipe<'d, R> {
    pub(crate) fn new(ep_in: EndpointIn<'d, R>, ep_out: EndpointOut<'d, R>) -> Self {
        Self { ep_in, ep_out }
    }

    fn state(&self) -> &'d RefCell<Shared<'d, R>> {
        self.ep_in.state()
    }
}

impl<'d, R: UsbRegisters> embassy_usb_driver::ControlPipe for ControlPipe<'d, R> {
    fn max_packet_size(&self) -> usize {
        self.ep_in.info.max_packet_size as usize
    }

    async fn setup(&mut self) -> [u8; 8] {
        poll_fn(|cx| self.state().borrow_mut().poll_setup(cx)).await
    }

    async fn data_out(
        &mut self,
        buf: &mut [u8],
        _first: bool,
        _last: bool,
    ) -> Result<usize, EndpointError> {
        trace!("EP0: data_out reading {} bytes", buf.len());
        self.ep_out.read(buf).await
    }

    async fn data_in(&mut self, data: &[u8], _first: bool, last: bool) -> Result<(), EndpointError> {
        trace!("EP0: data_in write: {:?}", data);
        self.ep_in.write(data).await?;

        // The host acknowledges the last packet with a zero-length OUT status stage.
        if last {
            trace!("EP0: acknowledge IN");
            self.ep_out.read(&mut []).await?;
        }
        Ok(())
    }

    async fn accept(&mut self) {
        trace!("EP0: accept");
        if let Err(e) = self.ep_in.write(&[]).await {
            warn!("EP0: status stage not sent: {:?}", e);
        }
    }

    async fn reject(&mut self) {
        trace!("EP0: reject");
        if let Err(e) = self.state().borrow_mut().usb.control_reject() {
            warn!("EP0: stall failed: {:?}", e);
        }
    }

    async fn accept_set_address(&mut self, addr: u8) {
        trace!("EP0: address set to: {:#x}", addr);
        // USBADRA defers the new address until the status stage below has gone out.
        self.state().borrow_mut().usb.set_address(addr);
        self.accept().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorRing;
    use crate::mock::{self, MockRegisters};
    use crate::Config;

    #[test]
    fn parse_get_descriptor() {
        let setup = SetupPacket::parse(&[0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0xff, 0x00]);
        assert_eq!(setup.direction(), Direction::In);
        assert_eq!(setup.kind(), RequestKind::Standard);
        assert_eq!(setup.recipient(), Recipient::Device);
        assert_eq!(setup.request, 0x06);
        assert_eq!(setup.value, 0x0200);
        assert_eq!(setup.length, 255);
    }

    #[test]
    fn parse_class_interface_request() {
        let setup = SetupPacket::parse(&[0xa1, 0xfe, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00]);
        assert_eq!(setup.kind(), RequestKind::Class);
        assert_eq!(setup.recipient(), Recipient::Interface);
        assert_eq!(setup.index, 1);
    }

    #[test]
    fn status_and_reject() {
        let mut ring = DescriptorRing::new();
        let mut usb = ControllerState::new(MockRegisters::new(), &mut ring, Config::default());
        usb.reset().unwrap();

        usb.control_accept().unwrap();
        assert_eq!(mock::complete_in(&mut usb, 0), Some(std::vec![]));
        usb.control_in(&[1, 2]).unwrap();
        assert_eq!(mock::complete_in(&mut usb, 0), Some(std::vec![1, 2]));

        usb.control_reject().unwrap();
        assert!(usb.is_stalled(EndpointAddress::from_parts(0, Direction::In)));
        assert!(usb.is_stalled(EndpointAddress::from_parts(0, Direction::Out)));
    }
}
