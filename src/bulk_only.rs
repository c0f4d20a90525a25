//! Mass storage over bulk-only transport as an `embassy-usb` class.
//!
//! Same command set as `MscClass`, but driven by a task instead of endpoint events.  Classes on
//! `embassy-usb` cannot halt their endpoints, so a data phase the device does not fill is ended
//! with a short or zero-length packet on IN, or drained on OUT, and the CSW reports the residue.

use crate::fmt::{debug, trace, warn};
use crate::msc::{
    BlockDevice, Cbw, CommandStatus, Csw, Inquiry, Reply, Scsi, Sense, PACKET_SIZE,
    REQUEST_BULK_ONLY_RESET, REQUEST_GET_MAX_LUN,
};
use embassy_usb::control::{InResponse, OutResponse, Recipient, Request, RequestType};
use embassy_usb::driver::{Direction, Driver, Endpoint, EndpointError, EndpointIn, EndpointOut};
use embassy_usb::types::InterfaceNumber;
use embassy_usb::{Builder, Handler};

const CLASS_MASS_STORAGE: u8 = 0x08;
const SUBCLASS_SCSI: u8 = 0x06;
const PROTOCOL_BULK_ONLY: u8 = 0x50;

/// Class requests for the mass storage interface.
pub struct BulkOnlyControl {
    interface: InterfaceNumber,
}

impl BulkOnlyControl {
    pub const fn new() -> Self {
        Self {
            interface: InterfaceNumber(0),
        }
    }

    fn addressed_to_us(&self, req: &Request) -> bool {
        req.request_type == RequestType::Class
            && req.recipient == Recipient::Interface
            && req.index == self.interface.0 as u16
    }
}

impl Default for BulkOnlyControl {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for BulkOnlyControl {
    fn control_out(&mut self, req: Request, _data: &[u8]) -> Option<OutResponse> {
        if !self.addressed_to_us(&req) {
            return None;
        }
        match req.request {
            REQUEST_BULK_ONLY_RESET => {
                debug!("bulk-only reset");
                Some(OutResponse::Accepted)
            }
            _ => Some(OutResponse::Rejected),
        }
    }

    fn control_in<'a>(&'a mut self, req: Request, buf: &'a mut [u8]) -> Option<InResponse<'a>> {
        if !self.addressed_to_us(&req) {
            return None;
        }
        match req.request {
            REQUEST_GET_MAX_LUN if !buf.is_empty() => {
                // A single LUN, numbered 0.
                buf[0] = 0;
                Some(InResponse::Accepted(&buf[..1]))
            }
            _ => Some(InResponse::Rejected),
        }
    }
}

/// A bulk-only mass storage function serving `disk`.
pub struct BulkOnly<O, I, B> {
    ep_out: O,
    ep_in: I,
    disk: B,
    scsi: Scsi,
    response: [u8; PACKET_SIZE],
}

impl<O, I, B> BulkOnly<O, I, B>
where
    O: EndpointOut,
    I: EndpointIn,
    B: BlockDevice,
{
    /// Add the mass storage interface and its two 64-byte bulk endpoints to `builder`.
    pub fn new<'d, D>(
        builder: &mut Builder<'d, D>,
        control: &'d mut BulkOnlyControl,
        disk: B,
    ) -> Self
    where
        D: Driver<'d, EndpointOut = O, EndpointIn = I>,
    {
        let mut func = builder.function(CLASS_MASS_STORAGE, SUBCLASS_SCSI, PROTOCOL_BULK_ONLY);
        let mut iface = func.interface();
        control.interface = iface.interface_number();
        let mut alt = iface.alt_setting(CLASS_MASS_STORAGE, SUBCLASS_SCSI, PROTOCOL_BULK_ONLY, None);
        let ep_out = alt.endpoint_bulk_out(PACKET_SIZE as u16);
        let ep_in = alt.endpoint_bulk_in(PACKET_SIZE as u16);
        drop(func);

        builder.handler(control);
        Self::from_endpoints(ep_out, ep_in, disk)
    }

    /// Serve `disk` on endpoints that are already described to the host.
    pub fn from_endpoints(ep_out: O, ep_in: I, disk: B) -> Self {
        Self {
            ep_out,
            ep_in,
            disk,
            scsi: Scsi::new(Inquiry::default()),
            response: [0; PACKET_SIZE],
        }
    }

    pub fn with_inquiry(mut self, inquiry: Inquiry) -> Self {
        self.scsi.inquiry = inquiry;
        self
    }

    pub fn disk(&self) -> &B {
        &self.disk
    }

    pub fn disk_mut(&mut self) -> &mut B {
        &mut self.disk
    }

    /// Serve commands forever, pausing whenever the host de-configures the device.
    pub async fn run(&mut self) -> ! {
        loop {
            self.ep_out.wait_enabled().await;
            self.ep_in.wait_enabled().await;
            debug!("mass storage configured");
            self.scsi.sense = Sense::NONE;
            while self.serve_command().await.is_ok() {}
            debug!("mass storage endpoints disabled");
        }
    }

    /// Wait for one command block and carry it out, status included.
    pub(crate) async fn serve_command(&mut self) -> Result<(), EndpointError> {
        let mut packet = [0u8; PACKET_SIZE];
        let n = self.ep_out.read(&mut packet).await?;
        let Some(cbw) = Cbw::parse(&packet[..n]) else {
            warn!("ignoring invalid CBW of {} bytes", n);
            return Ok(());
        };
        trace!("cbw tag={:#x} op={:#x} len={}", cbw.tag, cbw.opcode(), cbw.data_len);

        let reply = self.scsi.execute(&self.disk, &cbw, &mut self.response);
        let (status, transferred) = match reply {
            Reply::NoData => (CommandStatus::Passed, self.skip_data(&cbw).await?),
            Reply::Data(len) if cbw.direction == Direction::In && cbw.data_len > 0 => {
                let len = len.min(cbw.data_len as usize);
                (CommandStatus::Passed, self.send_response(&cbw, len).await?)
            }
            Reply::Data(_) => (CommandStatus::PhaseError, self.skip_data(&cbw).await?),
            Reply::Transfer { bytes: 0, .. } if cbw.data_len == 0 => (CommandStatus::Passed, 0),
            Reply::Transfer {
                addr,
                bytes,
                direction,
            } if bytes == cbw.data_len && direction == cbw.direction => {
                let moved = match direction {
                    Direction::In => self.send_blocks(addr, bytes).await?,
                    Direction::Out => self.receive_blocks(addr, bytes).await?,
                };
                (CommandStatus::Passed, moved)
            }
            Reply::Transfer { bytes, .. } => {
                warn!(
                    "{} bytes but host expects {} bytes {:?}",
                    bytes,
                    cbw.data_len,
                    cbw.direction
                );
                (CommandStatus::PhaseError, self.skip_data(&cbw).await?)
            }
            Reply::Fail(sense) => {
                self.scsi.sense = sense;
                (CommandStatus::Failed, self.skip_data(&cbw).await?)
            }
        };

        let csw = Csw {
            tag: cbw.tag,
            residue: cbw.data_len.saturating_sub(transferred),
            status,
        };
        trace!("csw tag={:#x} status={:?}", csw.tag, csw.status);
        self.ep_in.write(&csw.to_bytes()).await
    }

    /// End a data phase the device has nothing for.  Returns the bytes that count as moved.
    async fn skip_data(&mut self, cbw: &Cbw) -> Result<u32, EndpointError> {
        if cbw.data_len == 0 {
            return Ok(0);
        }
        match cbw.direction {
            Direction::In => {
                self.ep_in.write(&[]).await?;
                Ok(0)
            }
            Direction::Out => {
                // The host sends the data regardless, so it has to be read and dropped.
                let mut packet = [0u8; PACKET_SIZE];
                let mut drained = 0;
                while drained < cbw.data_len {
                    let n = self.ep_out.read(&mut packet).await?;
                    drained += n as u32;
                    if n < PACKET_SIZE {
                        break;
                    }
                }
                debug!("discarded {} bytes", drained);
                Ok(0)
            }
        }
    }

    async fn send_response(&mut self, cbw: &Cbw, len: usize) -> Result<u32, EndpointError> {
        let response = self.response;
        for chunk in response[..len].chunks(PACKET_SIZE) {
            self.ep_in.write(chunk).await?;
        }
        // A response that is shorter than the host asked for but ends on a packet boundary still
        // needs a short packet to end the data phase.
        if (len as u32) < cbw.data_len && len % PACKET_SIZE == 0 {
            self.ep_in.write(&[]).await?;
        }
        Ok(len as u32)
    }

    async fn send_blocks(&mut self, mut addr: u32, bytes: u32) -> Result<u32, EndpointError> {
        trace!("In addr={:#x} bytes={}", addr, bytes);
        let mut remaining = bytes;
        let mut packet = [0u8; PACKET_SIZE];
        while remaining > 0 {
            let n = (remaining as usize).min(PACKET_SIZE);
            self.disk.read(addr, &mut packet[..n]);
            self.ep_in.write(&packet[..n]).await?;
            addr += n as u32;
            remaining -= n as u32;
        }
        Ok(bytes)
    }

    async fn receive_blocks(&mut self, mut addr: u32, bytes: u32) -> Result<u32, EndpointError> {
        trace!("Out addr={:#x} bytes={}", addr, bytes);
        let mut remaining = bytes;
        let mut packet = [0u8; PACKET_SIZE];
        while remaining > 0 {
            let received = self.ep_out.read(&mut packet).await?;
            let n = received.min(remaining as usize);
            self.disk.write(addr, &packet[..n]);
            addr += n as u32;
            remaining -= n as u32;
            if received < PACKET_SIZE {
                break;
            }
        }
        Ok(bytes - remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorRing;
    use crate::disk::FlashDisk;
    use crate::fat::{DirEntry, ATTR_ARCHIVE, LPC1768};
    use crate::mock::{self, MockRegisters, RecordingFlash};
    use crate::msc::opcode;
    use crate::sequencer::{SequencerConfig, SessionEnd, SessionSignal};
    use crate::state::State;
    use crate::Config;
    use core::future::Future;
    use core::pin::{pin, Pin};
    use core::task::Poll;
    use embassy_futures::poll_once;
    use embassy_usb::driver::{Bus as _, Driver as _, EndpointType};
    use std::collections::VecDeque;
    use std::vec::Vec;

    const EP: usize = 1;

    fn cbw(tag: u32, data_len: u32, dir_in: bool, cb: &[u8]) -> Vec<u8> {
        let mut b = std::vec![0u8; 31];
        b[0..4].copy_from_slice(b"USBC");
        b[4..8].copy_from_slice(&tag.to_le_bytes());
        b[8..12].copy_from_slice(&data_len.to_le_bytes());
        b[12] = if dir_in { 0x80 } else { 0 };
        b[14] = cb.len() as u8;
        b[15..15 + cb.len()].copy_from_slice(cb);
        b
    }

    fn rw10(op: u8, lba: u32, blocks: u16) -> [u8; 10] {
        let mut cb = [0u8; 10];
        cb[0] = op;
        cb[2..6].copy_from_slice(&lba.to_be_bytes());
        cb[7..9].copy_from_slice(&blocks.to_be_bytes());
        cb
    }

    /// Poll `fut` to completion, playing the host: OUT packets from `to_device` are delivered
    /// whenever the device waits, and every IN packet it queues is collected.
    fn exchange<F: Future>(
        state: &State<'_, MockRegisters>,
        mut fut: Pin<&mut F>,
        to_device: &mut VecDeque<Vec<u8>>,
    ) -> (F::Output, Vec<Vec<u8>>) {
        let mut from_device = Vec::new();
        loop {
            let ready = poll_once(fut.as_mut());
            let mut shared = state.shared.borrow_mut();
            if let Poll::Ready(out) = ready {
                // The CSW may still be waiting for the host.
                from_device.extend(mock::complete_in(&mut shared.usb, EP));
                return (out, from_device);
            }
            if let Some(data) = mock::complete_in(&mut shared.usb, EP) {
                from_device.push(data);
            } else if let Some(packet) = to_device.pop_front() {
                mock::complete_out(&mut shared.usb, EP, &packet);
            } else {
                panic!("device is waiting for a packet the host does not have");
            }
        }
    }

    fn packets(data: &[u8]) -> VecDeque<Vec<u8>> {
        data.chunks(PACKET_SIZE).map(|c| c.to_vec()).collect()
    }

    fn csw(b: &[u8]) -> (u32, u32, u8) {
        assert_eq!(b.len(), 13);
        assert_eq!(&b[0..4], b"USBS");
        let u32_at = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        (u32_at(4), u32_at(8), b[12])
    }

    macro_rules! configured_function {
        ($state:ident, $msc:ident, $disk:expr) => {
            let mut driver = $state.driver();
            let ep_out = driver
                .alloc_endpoint_out(EndpointType::Bulk, PACKET_SIZE as u16, 0)
                .unwrap();
            let ep_in = driver
                .alloc_endpoint_in(EndpointType::Bulk, PACKET_SIZE as u16, 0)
                .unwrap();
            let (mut bus, _control) = driver.start(64);
            bus.endpoint_set_enabled(ep_out.info().addr, true);
            bus.endpoint_set_enabled(ep_in.info().addr, true);
            let mut $msc = BulkOnly::from_endpoints(ep_out, ep_in, $disk);
        };
    }

    #[test]
    fn inquiry_then_boot_sector() {
        let signal = SessionSignal::new();
        let disk = FlashDisk::new(LPC1768, SequencerConfig::default(), RecordingFlash::default(), &signal);
        let mut ring = DescriptorRing::new();
        let state = State::new(MockRegisters::new(), &mut ring, Config::default());
        configured_function!(state, msc, disk);

        let mut host = packets(&cbw(3, 36, true, &[opcode::INQUIRY, 0, 0, 0, 36, 0]));
        let (result, sent) = exchange(&state, pin!(msc.serve_command()), &mut host);
        assert_eq!(result, Ok(()));
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0][8..16], b"MBED    ");
        assert_eq!(csw(&sent[1]), (3, 0, 0));

        let mut host = packets(&cbw(4, 512, true, &rw10(opcode::READ_10, 0, 1)));
        let (result, sent) = exchange(&state, pin!(msc.serve_command()), &mut host);
        assert_eq!(result, Ok(()));
        assert_eq!(sent.len(), 9);
        let data: Vec<u8> = sent[..8].concat();
        assert_eq!(&data[..3], &[0xeb, 0x3c, 0x90]);
        assert_eq!(&data[510..], &[0x55, 0xaa]);
        assert_eq!(csw(&sent[8]), (4, 0, 0));
    }

    #[test]
    fn firmware_copy_reaches_the_flash() {
        let signal = SessionSignal::new();
        let flash = RecordingFlash::default();
        let disk = FlashDisk::new(LPC1768, SequencerConfig::default(), flash.clone(), &signal);
        let mut ring = DescriptorRing::new();
        let state = State::new(MockRegisters::new(), &mut ring, Config::default());
        configured_function!(state, msc, disk);

        let mut root = [0u8; 512];
        root[..32].copy_from_slice(&DirEntry::volume_label(*b"MBED       ").to_bytes());
        let entry = DirEntry {
            name: *b"FIRMWARE",
            ext: *b"BIN",
            attributes: ATTR_ARCHIVE,
            first_cluster_lo: 2,
            size: 512,
            ..DirEntry::default()
        };
        root[32..64].copy_from_slice(&entry.to_bytes());

        for (tag, lba, data) in [(1, 3, root), (2, 5, [0xa5; 512])] {
            let mut host = packets(&cbw(tag, 512, false, &rw10(opcode::WRITE_10, lba, 1)));
            host.extend(packets(&data));
            let (result, sent) = exchange(&state, pin!(msc.serve_command()), &mut host);
            assert_eq!(result, Ok(()));
            assert_eq!(sent.len(), 1);
            assert_eq!(csw(&sent[0]), (tag, 0, 0));
        }

        assert_eq!(signal.try_take(), Some(SessionEnd::Flashed));
        assert_eq!(flash.programmed(), [(0, std::vec![0xa5; 512])]);
    }

    #[test]
    fn unfilled_data_phases_end_early() {
        let signal = SessionSignal::new();
        let disk = FlashDisk::new(LPC1768, SequencerConfig::default(), RecordingFlash::default(), &signal);
        let mut ring = DescriptorRing::new();
        let state = State::new(MockRegisters::new(), &mut ring, Config::default());
        configured_function!(state, msc, disk);

        // Out of range: a zero-length packet ends the IN phase, then a failed CSW.
        let mut host = packets(&cbw(5, 512, true, &rw10(opcode::READ_10, 5000, 1)));
        let (_, sent) = exchange(&state, pin!(msc.serve_command()), &mut host);
        assert_eq!(sent.len(), 2);
        assert!(sent[0].is_empty());
        assert_eq!(csw(&sent[1]), (5, 512, 1));

        let mut host = packets(&cbw(6, 18, true, &[opcode::REQUEST_SENSE, 0, 0, 0, 18, 0]));
        let (_, sent) = exchange(&state, pin!(msc.serve_command()), &mut host);
        assert_eq!((sent[0][2], sent[0][12]), (0x05, 0x21));
        assert_eq!(csw(&sent[1]), (6, 0, 0));

        // OUT data for a command that takes none is read and dropped.
        let mut host = packets(&cbw(7, 128, false, &[opcode::TEST_UNIT_READY, 0, 0, 0, 0, 0]));
        host.extend(packets(&[0u8; 128]));
        let (_, sent) = exchange(&state, pin!(msc.serve_command()), &mut host);
        assert!(host.is_empty());
        assert_eq!(csw(&sent[0]), (7, 128, 0));

        // Host wants 4 bytes of MODE SENSE(6) but as OUT: phase error.
        let mut host = packets(&cbw(8, 4, false, &[opcode::MODE_SENSE_6, 0, 0x3f, 0, 4, 0]));
        host.push_back(std::vec![0; 4]);
        let (_, sent) = exchange(&state, pin!(msc.serve_command()), &mut host);
        assert_eq!(csw(&sent[0]), (8, 4, 2));
    }

    #[test]
    fn invalid_command_block_is_ignored() {
        let signal = SessionSignal::new();
        let disk = FlashDisk::new(LPC1768, SequencerConfig::default(), RecordingFlash::default(), &signal);
        let mut ring = DescriptorRing::new();
        let state = State::new(MockRegisters::new(), &mut ring, Config::default());
        configured_function!(state, msc, disk);

        let mut host = packets(&[0x55; 31]);
        let (result, sent) = exchange(&state, pin!(msc.serve_command()), &mut host);
        assert_eq!(result, Ok(()));
        assert!(sent.is_empty());
    }

    #[test]
    fn disabled_endpoint_ends_the_command() {
        let signal = SessionSignal::new();
        let disk = FlashDisk::new(LPC1768, SequencerConfig::default(), RecordingFlash::default(), &signal);
        let mut ring = DescriptorRing::new();
        let state = State::new(MockRegisters::new(), &mut ring, Config::default());
        let mut driver = state.driver();
        let ep_out = driver
            .alloc_endpoint_out(EndpointType::Bulk, PACKET_SIZE as u16, 0)
            .unwrap();
        let ep_in = driver
            .alloc_endpoint_in(EndpointType::Bulk, PACKET_SIZE as u16, 0)
            .unwrap();
        let _pipes = driver.start(64);
        let mut msc = BulkOnly::from_endpoints(ep_out, ep_in, disk);

        assert_eq!(
            poll_once(pin!(msc.serve_command())),
            Poll::Ready(Err(EndpointError::Disabled))
        );
    }

    #[test]
    fn class_requests() {
        let mut control = BulkOnlyControl::new();
        control.interface = InterfaceNumber(1);
        let request = |request: u8, index: u8| {
            Request::parse(&[0xa1, request, 0, 0, index, 0, 1, 0])
        };

        let mut buf = [0xffu8; 8];
        match control.control_in(request(REQUEST_GET_MAX_LUN, 1), &mut buf) {
            Some(InResponse::Accepted(data)) => assert_eq!(data, &[0]),
            _ => panic!("GET MAX LUN not answered"),
        }
        assert!(control
            .control_in(request(REQUEST_GET_MAX_LUN, 0), &mut buf)
            .is_none());
        assert!(matches!(
            control.control_out(request(REQUEST_BULK_ONLY_RESET, 1), &[]),
            Some(OutResponse::Accepted)
        ));
        assert!(matches!(
            control.control_out(request(0x42, 1), &[]),
            Some(OutResponse::Rejected)
        ));
    }
}
