//! Device queue heads and transfer descriptors.
//!
//! The controller reads its endpoint configuration from a list of queue heads (one per endpoint
//! direction, OUT at index 2n and IN at 2n+1) whose base address is written to ENDPOINTLISTADDR.
//! Each queue head points at a single transfer descriptor, which in turn points at the endpoint's
//! slice of the buffer pool.  All of this memory is shared with the controller's DMA engine, so it
//! lives in one `DescriptorRing` that must stay at a fixed address once the controller has been
//! reset.

use core::ptr;
use static_assertions::const_assert_eq;

/// Number of logical endpoints handled by the driver, including endpoint 0.
pub const NUM_ENDPOINTS: usize = 4;
pub(crate) const NUM_SLOTS: usize = NUM_ENDPOINTS * 2;

/// Size of the endpoint buffer pool in bytes.
pub const POOL_SIZE: usize = 0x1000;

/// Terminate bit for next-descriptor pointers.
pub(crate) const TERMINATE: u32 = 1;

pub(crate) mod token {
    pub const ACTIVE: u32 = 1 << 7;
    pub const HALTED: u32 = 1 << 6;
    pub const ERROR_MASK: u32 = 0xe8;
    pub const MULTO_SHIFT: u32 = 10;
    pub const IOC: u32 = 1 << 15;
    pub const TOTAL_BYTES_SHIFT: u32 = 16;
    pub const TOTAL_BYTES_MASK: u32 = 0x7fff;
}

pub(crate) mod capabilities {
    pub const IOS: u32 = 1 << 15;
    pub const MAX_PACKET_SHIFT: u32 = 16;
    pub const ZLT: u32 = 1 << 29;
}

#[repr(C, align(64))]
pub struct QueueHead {
    pub(crate) cap: u32,
    pub(crate) current_dtd: u32,
    pub(crate) next_dtd: u32,
    pub(crate) token: u32,
    pub(crate) buffer: [u32; 5],
    _reserved: u32,
    pub(crate) setup: [u32; 2],
    _reserved1: [u32; 4],
}

const_assert_eq!(core::mem::size_of::<QueueHead>(), 64);

impl QueueHead {
    const ZERO: Self = Self {
        cap: 0,
        current_dtd: 0,
        next_dtd: 0,
        token: 0,
        buffer: [0; 5],
        _reserved: 0,
        setup: [0; 2],
        _reserved1: [0; 4],
    };

    /// The setup buffer, which the controller overwrites whenever a SETUP packet arrives.
    pub(crate) fn setup_words(&self) -> [u32; 2] {
        // Safety: plain reads of an aligned field we hold a reference to.
        unsafe { [ptr::read_volatile(&self.setup[0]), ptr::read_volatile(&self.setup[1])] }
    }
}

#[repr(C, align(32))]
pub struct TransferDescriptor {
    pub(crate) next_dtd: u32,
    token: u32,
    pub(crate) buffer: [u32; 5],
    _reserved: u32,
}

const_assert_eq!(core::mem::size_of::<TransferDescriptor>(), 32);

impl TransferDescriptor {
    const ZERO: Self = Self {
        next_dtd: 0,
        token: 0,
        buffer: [0; 5],
        _reserved: 0,
    };

    pub(crate) fn token(&self) -> u32 {
        // Safety: the controller updates the token behind our back, so always go through memory.
        unsafe { ptr::read_volatile(&self.token) }
    }

    pub(crate) fn set_token(&mut self, value: u32) {
        // Safety: see token()
        unsafe { ptr::write_volatile(&mut self.token, value) }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.token() & token::ACTIVE != 0
    }

    /// Bytes the controller did not transfer out of the last primed total.
    pub(crate) fn remaining_bytes(&self) -> u16 {
        ((self.token() >> token::TOTAL_BYTES_SHIFT) & token::TOTAL_BYTES_MASK) as u16
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::ZERO;
    }
}

#[repr(C, align(2048))]
pub(crate) struct QueueHeadList(pub(crate) [QueueHead; NUM_SLOTS]);

#[repr(C, align(4096))]
pub(crate) struct BufferPool(pub(crate) [u8; POOL_SIZE]);

/// Controller-visible memory: queue heads, transfer descriptors and packet buffers.
#[repr(C)]
pub struct DescriptorRing {
    pub(crate) qh: QueueHeadList,
    pub(crate) td: [TransferDescriptor; NUM_SLOTS],
    pub(crate) pool: BufferPool,
}

impl DescriptorRing {
    pub const fn new() -> Self {
        Self {
            qh: QueueHeadList([QueueHead::ZERO; NUM_SLOTS]),
            td: [TransferDescriptor::ZERO; NUM_SLOTS],
            pool: BufferPool([0; POOL_SIZE]),
        }
    }

    /// Zero every queue head and transfer descriptor.  Packet buffers are left alone.
    pub(crate) fn clear_descriptors(&mut self) {
        for qh in self.qh.0.iter_mut() {
            *qh = QueueHead::ZERO;
        }
        for td in self.td.iter_mut() {
            td.clear();
        }
    }

    pub(crate) fn qh_list_address(&self) -> u32 {
        self.qh.0.as_ptr() as usize as u32
    }

    pub(crate) fn td_address(&self, slot: usize) -> u32 {
        &self.td[slot] as *const TransferDescriptor as usize as u32
    }

    pub(crate) fn buffer_address(&self, offset: usize) -> u32 {
        self.pool.0.as_ptr().wrapping_add(offset) as usize as u32
    }
}

impl Default for DescriptorRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_alignment() {
        let ring = std::boxed::Box::new(DescriptorRing::new());
        let qh = ring.qh.0.as_ptr() as usize;
        assert_eq!(qh % 2048, 0);
        assert_eq!(ring.pool.0.as_ptr() as usize % 4096, 0);
        for td in ring.td.iter() {
            assert_eq!(td as *const TransferDescriptor as usize % 32, 0);
        }
    }

    #[test]
    fn remaining_bytes_decodes_token() {
        let mut td = TransferDescriptor::ZERO;
        td.set_token((40 << token::TOTAL_BYTES_SHIFT) | token::IOC | token::ACTIVE);
        assert!(td.is_active());
        assert_eq!(td.remaining_bytes(), 40);
        td.clear();
        assert!(!td.is_active());
        assert_eq!(td.remaining_bytes(), 0);
    }
}
