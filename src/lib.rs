#![cfg_attr(not(test), no_std)]

mod fmt;

mod bus;
pub mod bulk_only;
pub mod control_pipe;
mod descriptor;
pub mod disk;
mod driver;
mod endpoint;
pub mod fat;
mod interrupt;
#[cfg(test)]
mod mock;
pub mod msc;
mod phy;
pub mod regs;
pub mod sequencer;
mod state;
pub mod target;

pub use crate::bulk_only::{BulkOnly, BulkOnlyControl};
pub use crate::bus::Bus;
pub use crate::control_pipe::ControlPipe;
pub use crate::descriptor::{DescriptorRing, NUM_ENDPOINTS, POOL_SIZE};
pub use crate::disk::FlashDisk;
pub use crate::driver::{Driver, UsbDriver};
pub use crate::endpoint::{BusEvent, BusHandler, EndpointEvent, EndpointHandler};
pub use crate::endpoint::{EndpointIn, EndpointOut};
pub use crate::fat::{Geometry, VirtualFat};
pub use crate::interrupt::on_bus_interrupt;
pub use crate::msc::{BlockDevice, MscClass};
pub use crate::phy::enable_usb0_clock_and_pins;
pub use crate::sequencer::{AbortReason, Sequencer, SequencerConfig, SessionEnd, SessionSignal};
pub use crate::state::{ControllerState, State, TransferError, EP0_MAX_PACKET_SIZE};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Speed {
    Full,
    High,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Config {
    pub speed: Speed,
    /// Upper bound on polls of a controller busy bit before giving up with
    /// `TransferError::Timeout`.  `None` waits indefinitely.
    pub spin_limit: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            speed: Speed::Full,
            spin_limit: None,
        }
    }
}
