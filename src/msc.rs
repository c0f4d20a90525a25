//! USB mass storage over bulk-only transport.
//!
//! Implements the small set of SCSI commands that hosts issue to a removable flash drive, on one
//! pair of 64-byte bulk endpoints.  The class runs entirely from endpoint events: every OUT packet
//! is either a command block or write data, and every IN completion moves the data or status
//! phase along.

use crate::control_pipe::{Recipient, RequestKind, SetupPacket};
use crate::endpoint::{EndpointEvent, EndpointHandler};
use crate::fat::SECTOR_SIZE;
use crate::fmt::{debug, trace, warn};
use crate::regs::UsbRegisters;
use crate::state::{ControllerState, TransferError};
use embassy_usb_driver::{Direction, EndpointAddress, EndpointType};

pub const PACKET_SIZE: usize = 64;

const CBW_SIGNATURE: u32 = 0x4342_5355;
const CSW_SIGNATURE: u32 = 0x5342_5355;
const CBW_LEN: usize = 31;
const CSW_LEN: usize = 13;

pub const REQUEST_GET_MAX_LUN: u8 = 0xfe;
pub const REQUEST_BULK_ONLY_RESET: u8 = 0xff;

/// A disk addressed in bytes, in whole 512-byte blocks.
pub trait BlockDevice {
    fn block_count(&self) -> u32;

    fn read(&mut self, addr: u32, buf: &mut [u8]);

    /// Writes always succeed from the host's point of view.  A device that cannot use the data
    /// reports that some other way.
    fn write(&mut self, addr: u32, data: &[u8]);
}

pub(crate) mod opcode {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SENSE_6: u8 = 0x1a;
    pub const START_STOP_UNIT: u8 = 0x1b;
    pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1e;
    pub const READ_FORMAT_CAPACITIES: u8 = 0x23;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2a;
    pub const VERIFY_10: u8 = 0x2f;
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    pub const MODE_SENSE_10: u8 = 0x5a;
}

#[repr(u8)]
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandStatus {
    #[default]
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

/// Fixed-format sense data reported by REQUEST SENSE.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub const NONE: Sense = Sense::new(0x00, 0x00);
    pub const INVALID_COMMAND: Sense = Sense::new(0x05, 0x20);
    pub const LBA_OUT_OF_RANGE: Sense = Sense::new(0x05, 0x21);

    const fn new(key: u8, asc: u8) -> Self {
        Self { key, asc, ascq: 0 }
    }

    fn to_bytes(self) -> [u8; 18] {
        let mut b = [0u8; 18];
        b[0] = 0x70;
        b[2] = self.key;
        b[7] = 10;
        b[12] = self.asc;
        b[13] = self.ascq;
        b
    }
}

/// Identification returned by INQUIRY.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Inquiry {
    pub vendor: [u8; 8],
    pub product: [u8; 16],
    pub revision: [u8; 4],
}

impl Default for Inquiry {
    fn default() -> Self {
        Self {
            vendor: *b"MBED    ",
            product: *b"MBED USB DISK   ",
            revision: *b"1.0 ",
        }
    }
}

impl Inquiry {
    fn to_bytes(&self) -> [u8; 36] {
        let mut b = [0u8; 36];
        // Direct access block device, removable, SPC-2.
        b[1] = 0x80;
        b[2] = 0x04;
        b[3] = 0x02;
        b[4] = 36 - 5;
        b[8..16].copy_from_slice(&self.vendor);
        b[16..32].copy_from_slice(&self.product);
        b[32..36].copy_from_slice(&self.revision);
        b
    }
}

/// Command block wrapper.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Cbw {
    pub tag: u32,
    pub data_len: u32,
    pub direction: Direction,
    pub lun: u8,
    pub cb: [u8; 16],
}

impl Cbw {
    /// Returns None unless `b` is a valid, meaningful CBW.
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() != CBW_LEN {
            return None;
        }
        let u32_at = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        if u32_at(0) != CBW_SIGNATURE {
            return None;
        }
        let lun = b[13] & 0x0f;
        let cb_len = (b[14] & 0x1f) as usize;
        if lun != 0 || cb_len == 0 || cb_len > 16 {
            return None;
        }
        let mut cb = [0u8; 16];
        cb[..cb_len].copy_from_slice(&b[15..15 + cb_len]);
        Some(Self {
            tag: u32_at(4),
            data_len: u32_at(8),
            direction: if b[12] & 0x80 != 0 {
                Direction::In
            } else {
                Direction::Out
            },
            lun,
            cb,
        })
    }

    pub fn opcode(&self) -> u8 {
        self.cb[0]
    }

    /// Logical block address and block count of a READ(10), WRITE(10) or VERIFY(10).
    pub fn block_range(&self) -> (u32, u32) {
        let cb = &self.cb;
        let lba = u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]);
        let blocks = u16::from_be_bytes([cb[7], cb[8]]) as u32;
        (lba, blocks)
    }
}

/// Command status wrapper.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Csw {
    pub tag: u32,
    pub residue: u32,
    pub status: CommandStatus,
}

impl Csw {
    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut b = [0u8; CSW_LEN];
        b[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        b[4..8].copy_from_slice(&self.tag.to_le_bytes());
        b[8..12].copy_from_slice(&self.residue.to_le_bytes());
        b[12] = self.status as u8;
        b
    }
}

/// What a decoded command needs from the transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Reply {
    /// No data phase.
    NoData,
    /// Send the first `n` bytes of the response buffer.
    Data(usize),
    /// Move `bytes` bytes between the host and the disk, starting at byte `addr`.
    Transfer {
        addr: u32,
        bytes: u32,
        direction: Direction,
    },
    Fail(Sense),
}

/// The SCSI side of the function: command decoding plus the sense data it leaves behind.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Scsi {
    pub(crate) inquiry: Inquiry,
    pub(crate) sense: Sense,
}

impl Scsi {
    pub(crate) fn new(inquiry: Inquiry) -> Self {
        Self {
            inquiry,
            sense: Sense::NONE,
        }
    }

    /// Decode `cbw`.  Short responses are written into `response`.
    pub(crate) fn execute<D: BlockDevice>(
        &mut self,
        disk: &D,
        cbw: &Cbw,
        response: &mut [u8; PACKET_SIZE],
    ) -> Reply {
        let mut reply = |data: &[u8]| {
            response[..data.len()].copy_from_slice(data);
            Reply::Data(data.len())
        };
        match cbw.opcode() {
            opcode::TEST_UNIT_READY
            | opcode::START_STOP_UNIT
            | opcode::PREVENT_ALLOW_MEDIUM_REMOVAL
            | opcode::VERIFY_10
            | opcode::SYNCHRONIZE_CACHE_10 => Reply::NoData,
            opcode::REQUEST_SENSE => {
                let sense = self.sense.to_bytes();
                self.sense = Sense::NONE;
                reply(&sense)
            }
            opcode::INQUIRY => reply(&self.inquiry.to_bytes()),
            opcode::MODE_SENSE_6 => reply(&[0x03, 0, 0, 0]),
            opcode::MODE_SENSE_10 => reply(&[0, 0x06, 0, 0, 0, 0, 0, 0]),
            opcode::READ_FORMAT_CAPACITIES => {
                let mut b = [0u8; 12];
                b[3] = 8;
                b[4..8].copy_from_slice(&disk.block_count().to_be_bytes());
                // Formatted media, 512-byte blocks.
                b[8] = 0x02;
                b[9..12].copy_from_slice(&(SECTOR_SIZE as u32).to_be_bytes()[1..]);
                reply(&b)
            }
            opcode::READ_CAPACITY_10 => {
                let mut b = [0u8; 8];
                let last = disk.block_count().saturating_sub(1);
                b[0..4].copy_from_slice(&last.to_be_bytes());
                b[4..8].copy_from_slice(&(SECTOR_SIZE as u32).to_be_bytes());
                reply(&b)
            }
            op @ (opcode::READ_10 | opcode::WRITE_10) => {
                let (lba, blocks) = cbw.block_range();
                if lba as u64 + blocks as u64 > disk.block_count() as u64 {
                    warn!("lba {}+{} out of range", lba, blocks);
                    return Reply::Fail(Sense::LBA_OUT_OF_RANGE);
                }
                Reply::Transfer {
                    addr: lba * SECTOR_SIZE as u32,
                    bytes: blocks * SECTOR_SIZE as u32,
                    direction: if op == opcode::READ_10 {
                        Direction::In
                    } else {
                        Direction::Out
                    },
                }
            }
            op => {
                warn!("unsupported SCSI command {:#x}", op);
                Reply::Fail(Sense::INVALID_COMMAND)
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Stage {
    /// Waiting for a CBW.
    Command,
    DataOut,
    DataIn,
    /// The last data packet is queued.
    DataInLast,
    /// The CSW is queued.
    Status,
    /// A bulk endpoint is halted; the CSW follows once the host clears it.
    StallPending,
    /// An invalid CBW arrived.  Only a bulk-only reset gets out of here.
    NeedsReset,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Source {
    Response,
    Disk,
}

pub struct MscClass<D: BlockDevice> {
    disk: D,
    interface: u16,
    ep: usize,
    scsi: Scsi,
    stage: Stage,
    tag: u32,
    // dCBWDataTransferLength of the current command.
    expected: u32,
    transferred: u32,
    remaining: u32,
    addr: u32,
    source: Source,
    status: CommandStatus,
    response: [u8; PACKET_SIZE],
}

impl<D: BlockDevice> MscClass<D> {
    /// A mass storage function on `interface`, using the bulk OUT and IN endpoints numbered `ep`.
    pub fn new(disk: D, interface: u16, ep: usize) -> Self {
        Self {
            disk,
            interface,
            ep,
            scsi: Scsi::new(Inquiry::default()),
            stage: Stage::Command,
            tag: 0,
            expected: 0,
            transferred: 0,
            remaining: 0,
            addr: 0,
            source: Source::Response,
            status: CommandStatus::Passed,
            response: [0; PACKET_SIZE],
        }
    }

    pub fn with_inquiry(mut self, inquiry: Inquiry) -> Self {
        self.scsi.inquiry = inquiry;
        self
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }

    pub fn disk_mut(&mut self) -> &mut D {
        &mut self.disk
    }

    fn out_addr(&self) -> EndpointAddress {
        EndpointAddress::from_parts(self.ep, Direction::Out)
    }

    fn in_addr(&self) -> EndpointAddress {
        EndpointAddress::from_parts(self.ep, Direction::In)
    }

    /// Set up the bulk endpoints and start listening for commands.  Call on SET_CONFIGURATION.
    pub fn configure<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
    ) -> Result<(), TransferError> {
        usb.configure_endpoint(self.out_addr(), EndpointType::Bulk, PACKET_SIZE as u16);
        usb.configure_endpoint(self.in_addr(), EndpointType::Bulk, PACKET_SIZE as u16);
        self.stage = Stage::Command;
        self.scsi.sense = Sense::NONE;
        usb.reset_endpoint(self.out_addr())
    }

    /// Handle a class request addressed to this interface.  Returns false if the request is
    /// not ours.
    pub fn control_request<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
        setup: &SetupPacket,
    ) -> bool {
        if setup.kind() != RequestKind::Class
            || setup.recipient() != Recipient::Interface
            || setup.index != self.interface
        {
            return false;
        }
        let result = match (setup.request, setup.direction()) {
            (REQUEST_GET_MAX_LUN, Direction::In) if setup.value == 0 && setup.length >= 1 => {
                usb.control_in(&[0]).map(|_| ())
            }
            (REQUEST_BULK_ONLY_RESET, Direction::Out) if setup.value == 0 && setup.length == 0 => {
                self.reset(usb).and_then(|_| usb.control_accept())
            }
            _ => usb.control_reject(),
        };
        if let Err(e) = result {
            warn!("msc class request {:#x} failed: {:?}", setup.request, e);
        }
        true
    }

    /// Bulk-only reset: abandon the current command and wait for the next CBW.
    ///
    /// Halted endpoints stay halted until the host clears them.
    pub fn reset<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
    ) -> Result<(), TransferError> {
        debug!("bulk-only reset");
        self.stage = Stage::Command;
        self.remaining = 0;
        self.status = CommandStatus::Passed;
        usb.reset_endpoint(self.in_addr())
    }

    /// Clear a halt on one of the bulk endpoints, for CLEAR_FEATURE(ENDPOINT_HALT).
    pub fn clear_stall<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
        addr: EndpointAddress,
    ) -> Result<(), TransferError> {
        if self.stage == Stage::NeedsReset {
            trace!("{:?} stays halted until reset", addr);
            return Ok(());
        }
        usb.clear_stall(addr)?;
        if self.stage == Stage::StallPending {
            self.send_status(usb)?;
        }
        Ok(())
    }

    fn on_out<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
    ) -> Result<(), TransferError> {
        let mut packet = [0u8; PACKET_SIZE];
        let n = usb.read(self.ep, &mut packet)?;
        let packet = &packet[..n];
        match self.stage {
            Stage::DataOut => self.receive_data(usb, packet),
            // The host only sends a CBW after it has the previous CSW.
            Stage::Command | Stage::Status => self.receive_command(usb, packet),
            stage => {
                warn!("dropping {} byte OUT packet in {:?}", n, stage);
                Ok(())
            }
        }
    }

    fn on_in<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
    ) -> Result<(), TransferError> {
        match self.stage {
            Stage::DataIn => self.send_data(usb),
            Stage::DataInLast => self.finish_data_in(usb),
            Stage::Status => {
                self.stage = Stage::Command;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn receive_command<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
        packet: &[u8],
    ) -> Result<(), TransferError> {
        self.stage = Stage::Command;
        let Some(cbw) = Cbw::parse(packet) else {
            warn!("invalid CBW ({} bytes)", packet.len());
            usb.set_stall(self.out_addr())?;
            usb.set_stall(self.in_addr())?;
            self.stage = Stage::NeedsReset;
            return Ok(());
        };
        trace!(
            "cbw tag={:#x} op={:#x} len={}",
            cbw.tag,
            cbw.opcode(),
            cbw.data_len
        );
        self.tag = cbw.tag;
        self.expected = cbw.data_len;
        self.transferred = 0;
        self.remaining = 0;
        self.status = CommandStatus::Passed;

        match self.scsi.execute(&self.disk, &cbw, &mut self.response) {
            Reply::NoData => self.no_data(usb, &cbw),
            Reply::Data(n) => self.respond(usb, &cbw, n),
            Reply::Transfer {
                addr,
                bytes,
                direction,
            } => self.start_transfer(usb, &cbw, addr, bytes, direction),
            Reply::Fail(sense) => self.fail(usb, &cbw, sense),
        }
    }

    /// Return the short response sitting in the response buffer.
    fn respond<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
        cbw: &Cbw,
        len: usize,
    ) -> Result<(), TransferError> {
        if cbw.data_len == 0 || cbw.direction != Direction::In {
            return self.phase_error(usb, cbw);
        }
        let n = len.min(cbw.data_len as usize);
        self.source = Source::Response;
        self.remaining = n as u32;
        self.stage = Stage::DataIn;
        self.send_data(usb)
    }

    fn start_transfer<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
        cbw: &Cbw,
        addr: u32,
        bytes: u32,
        direction: Direction,
    ) -> Result<(), TransferError> {
        if bytes == 0 && cbw.data_len == 0 {
            return self.send_status(usb);
        }
        if bytes != cbw.data_len || cbw.direction != direction {
            warn!(
                "{} bytes but host expects {} bytes {:?}",
                bytes,
                cbw.data_len,
                cbw.direction
            );
            return self.phase_error(usb, cbw);
        }

        trace!("{:?} addr={:#x} bytes={}", direction, addr, bytes);
        self.addr = addr;
        self.remaining = bytes;
        match direction {
            Direction::In => {
                self.source = Source::Disk;
                self.stage = Stage::DataIn;
                self.send_data(usb)
            }
            Direction::Out => {
                self.stage = Stage::DataOut;
                Ok(())
            }
        }
    }

    fn send_data<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
    ) -> Result<(), TransferError> {
        let n = (self.remaining as usize).min(PACKET_SIZE);
        let mut packet = [0u8; PACKET_SIZE];
        match self.source {
            Source::Response => {
                let offset = self.transferred as usize;
                packet[..n].copy_from_slice(&self.response[offset..offset + n]);
            }
            Source::Disk => self.disk.read(self.addr, &mut packet[..n]),
        }
        usb.write(self.ep, &packet[..n])?;
        self.addr += n as u32;
        self.transferred += n as u32;
        self.remaining -= n as u32;
        if self.remaining == 0 {
            self.stage = Stage::DataInLast;
        }
        Ok(())
    }

    fn finish_data_in<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
    ) -> Result<(), TransferError> {
        // A short packet already told the host the data ended early.  After a full one the
        // endpoint has to be halted instead.
        if self.transferred < self.expected && self.transferred as usize % PACKET_SIZE == 0 {
            usb.set_stall(self.in_addr())?;
            self.stage = Stage::StallPending;
            return Ok(());
        }
        self.send_status(usb)
    }

    fn receive_data<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
        packet: &[u8],
    ) -> Result<(), TransferError> {
        let n = packet.len().min(self.remaining as usize);
        self.disk.write(self.addr, &packet[..n]);
        self.addr += n as u32;
        self.transferred += n as u32;
        self.remaining -= n as u32;
        if self.remaining == 0 {
            self.send_status(usb)?;
        }
        Ok(())
    }

    /// Finish a command without a data phase.
    fn no_data<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
        cbw: &Cbw,
    ) -> Result<(), TransferError> {
        if cbw.data_len > 0 {
            return self.halt(usb, cbw.direction);
        }
        self.send_status(usb)
    }

    fn fail<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
        cbw: &Cbw,
        sense: Sense,
    ) -> Result<(), TransferError> {
        self.scsi.sense = sense;
        self.status = CommandStatus::Failed;
        self.no_data(usb, cbw)
    }

    fn phase_error<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
        cbw: &Cbw,
    ) -> Result<(), TransferError> {
        self.status = CommandStatus::PhaseError;
        self.no_data(usb, cbw)
    }

    fn halt<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
        direction: Direction,
    ) -> Result<(), TransferError> {
        usb.set_stall(EndpointAddress::from_parts(self.ep, direction))?;
        self.stage = Stage::StallPending;
        Ok(())
    }

    fn send_status<R: UsbRegisters>(
        &mut self,
        usb: &mut ControllerState<'_, R>,
    ) -> Result<(), TransferError> {
        let csw = Csw {
            tag: self.tag,
            residue: self.expected.saturating_sub(self.transferred),
            status: self.status,
        };
        trace!("csw tag={:#x} status={:?}", csw.tag, csw.status);
        usb.write(self.ep, &csw.to_bytes())?;
        self.stage = Stage::Status;
        Ok(())
    }
}

impl<D: BlockDevice, R: UsbRegisters> EndpointHandler<R> for MscClass<D> {
    fn on_event(&mut self, usb: &mut ControllerState<'_, R>, ep: usize, event: EndpointEvent) {
        let result = match event {
            EndpointEvent::Out => self.on_out(usb),
            EndpointEvent::In => self.on_in(usb),
            EndpointEvent::Setup => Ok(()),
        };
        if let Err(e) = result {
            warn!("msc ep{} {:?}: {:?}", ep, event, e);
        }
    }
}
