//! Test doubles for the controller registers and the target flash service.

use crate::descriptor::token;
use crate::regs::{endpoint_bit, usbcmd, usbsts, Reg, UsbRegisters, NUM_HW_ENDPOINTS};
use crate::state::{in_slot, out_slot, ControllerState};
use crate::target::{FlashError, TargetFlash, TargetState};
use core::cell::{Cell, RefCell};
use std::rc::Rc;
use std::vec::Vec;

const NUM_REGS: usize = 16 + NUM_HW_ENDPOINTS;

/// A register file that behaves enough like the controller for the driver to make progress.
///
/// Status registers are write-1-to-clear, prime/flush/reset complete immediately, and primes are
/// recorded so tests can see what the driver armed.
pub(crate) struct MockRegisters {
    cells: [Cell<u32>; NUM_REGS],
    stuck_prime: Cell<u32>,
    primed: RefCell<Vec<u32>>,
}

fn index(reg: Reg) -> usize {
    match reg {
        Reg::UsbCmd => 0,
        Reg::UsbSts => 1,
        Reg::UsbIntr => 2,
        Reg::FrIndex => 3,
        Reg::DeviceAddr => 4,
        Reg::EndpointListAddr => 5,
        Reg::EndptNak => 6,
        Reg::EndptNakEn => 7,
        Reg::PortSc1 => 8,
        Reg::OtgSc => 9,
        Reg::UsbMode => 10,
        Reg::EndptSetupStat => 11,
        Reg::EndptPrime => 12,
        Reg::EndptFlush => 13,
        Reg::EndptStat => 14,
        Reg::EndptComplete => 15,
        Reg::EndptCtrl(n) => 16 + n,
    }
}

impl MockRegisters {
    pub(crate) fn new() -> Self {
        Self {
            cells: core::array::from_fn(|_| Cell::new(0)),
            stuck_prime: Cell::new(0),
            primed: RefCell::new(Vec::new()),
        }
    }

    /// Every value written to ENDPTPRIME so far.
    pub(crate) fn primed(&self) -> Vec<u32> {
        self.primed.borrow().clone()
    }

    /// Make the given ENDPTPRIME bits never clear.
    pub(crate) fn stick_prime(&self, bits: u32) {
        self.stuck_prime.set(bits);
    }

    /// Set bits the way the hardware would, bypassing write-1-to-clear.
    pub(crate) fn raise(&self, reg: Reg, bits: u32) {
        let cell = &self.cells[index(reg)];
        cell.set(cell.get() | bits);
    }
}

impl UsbRegisters for MockRegisters {
    fn read(&self, reg: Reg) -> u32 {
        self.cells[index(reg)].get()
    }

    fn write(&self, reg: Reg, value: u32) {
        let cell = &self.cells[index(reg)];
        match reg {
            Reg::UsbSts | Reg::EndptSetupStat | Reg::EndptComplete | Reg::EndptNak => {
                cell.set(cell.get() & !value)
            }
            Reg::EndptPrime => {
                self.primed.borrow_mut().push(value);
                self.raise(Reg::EndptStat, value);
                cell.set(value & self.stuck_prime.get());
            }
            Reg::EndptFlush => {
                let stat = &self.cells[index(Reg::EndptStat)];
                stat.set(stat.get() & !value);
                cell.set(0);
            }
            Reg::UsbCmd => cell.set(value & !usbcmd::RST),
            _ => cell.set(value),
        }
    }
}

/// Finish the OUT transfer primed on `index`, as if the host had sent `data`.
pub(crate) fn complete_out(usb: &mut ControllerState<'_, MockRegisters>, index: usize, data: &[u8]) {
    let slot = out_slot(index);
    let ep = usb.endpoints[slot];
    let offset = ep.buf_offset.expect("endpoint not configured");
    let remaining = ep.max_packet_size as u32 - data.len() as u32;
    let ring = usb.ring_mut();
    ring.pool.0[offset..offset + data.len()].copy_from_slice(data);
    ring.td[slot].set_token((remaining << token::TOTAL_BYTES_SHIFT) | token::IOC);
    usb.regs().raise(Reg::EndptComplete, endpoint_bit(index, false));
    usb.regs().raise(Reg::UsbSts, usbsts::UI);
}

/// Finish the IN transfer primed on `index`, returning what the host received.
pub(crate) fn complete_in(usb: &mut ControllerState<'_, MockRegisters>, index: usize) -> Option<Vec<u8>> {
    let slot = in_slot(index);
    let offset = usb.endpoints[slot].buf_offset?;
    let ring = usb.ring_mut();
    let td = &mut ring.td[slot];
    if !td.is_active() {
        return None;
    }
    let len = td.remaining_bytes() as usize;
    td.set_token(token::IOC);
    let data = ring.pool.0[offset..offset + len].to_vec();
    usb.regs().raise(Reg::EndptComplete, endpoint_bit(index, true));
    usb.regs().raise(Reg::UsbSts, usbsts::UI);
    Some(data)
}

/// Deliver a SETUP packet to endpoint 0.
pub(crate) fn receive_setup(usb: &mut ControllerState<'_, MockRegisters>, setup: [u8; 8]) {
    usb.ring_mut().qh.0[out_slot(0)].setup = bytemuck::cast(setup);
    usb.regs().raise(Reg::EndptSetupStat, 1);
    usb.regs().raise(Reg::UsbSts, usbsts::UI);
}

/// Fail the transfer on an endpoint with the given descriptor error bits.
pub(crate) fn fail_transfer(
    usb: &mut ControllerState<'_, MockRegisters>,
    index: usize,
    is_in: bool,
    status: u32,
) {
    let slot = if is_in { in_slot(index) } else { out_slot(index) };
    usb.ring_mut().td[slot].set_token(token::IOC | status);
    usb.regs().raise(Reg::EndptComplete, endpoint_bit(index, is_in));
    usb.regs().raise(Reg::UsbSts, usbsts::UEI);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FlashCall {
    State(TargetState),
    Init(u32),
    Erase,
    Program(u32, Vec<u8>),
}

/// A target flash that records every call into a shared log.
#[derive(Clone, Default)]
pub(crate) struct RecordingFlash {
    pub(crate) log: Rc<RefCell<Vec<FlashCall>>>,
    pub(crate) fail_erase: bool,
    pub(crate) fail_program_at: Option<u32>,
}

impl RecordingFlash {
    pub(crate) fn calls(&self) -> Vec<FlashCall> {
        self.log.borrow().clone()
    }

    pub(crate) fn programmed(&self) -> Vec<(u32, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                FlashCall::Program(addr, data) => Some((addr, data)),
                _ => None,
            })
            .collect()
    }
}

impl TargetFlash for RecordingFlash {
    fn init(&mut self, clock_hz: u32) -> Result<(), FlashError> {
        self.log.borrow_mut().push(FlashCall::Init(clock_hz));
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<(), FlashError> {
        self.log.borrow_mut().push(FlashCall::Erase);
        if self.fail_erase {
            return Err(FlashError::Algorithm);
        }
        Ok(())
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.log
            .borrow_mut()
            .push(FlashCall::Program(address, data.to_vec()));
        if self.fail_program_at == Some(address) {
            return Err(FlashError::Swd);
        }
        Ok(())
    }

    fn set_target_state(&mut self, state: TargetState) -> Result<(), FlashError> {
        self.log.borrow_mut().push(FlashCall::State(state));
        Ok(())
    }
}
