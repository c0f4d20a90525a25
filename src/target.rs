//! The target-programming service the firmware-update sequencer drives.
//!
//! This is implemented outside the crate, by whatever talks SWD to the target microcontroller.

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TargetState {
    /// Hold the target halted and ready for flash programming.
    ResetProgram,
    /// Release the target and let it run the new image.
    ResetRun,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// The debug port did not respond or returned a fault.
    Swd,
    /// The target's flash algorithm reported a failure.
    Algorithm,
}

pub trait TargetFlash {
    /// Load and initialize the flash algorithm, with the target core running at `clock_hz`.
    fn init(&mut self, clock_hz: u32) -> Result<(), FlashError>;

    fn erase_chip(&mut self) -> Result<(), FlashError>;

    /// Program one page.  `data` is always a full page.
    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    fn set_target_state(&mut self, state: TargetState) -> Result<(), FlashError>;
}
