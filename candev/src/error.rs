//! Error taxonomy of the character-device facade and the error-frame encoding

use candev_driver::ControllerError;
use candev_driver::frame::Dlc;
use embedded_can::StandardId;

/// Failure returned by a facade entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Non-blocking handle, and the operation would have to wait.
    WouldBlock,
    /// The open count would overflow.
    TooManyOpens,
    /// The pending remote-request table is full.
    NoRtrSlot,
    /// A controller operation failed; the inner value is the controller's
    /// error, propagated unchanged.
    Controller(ControllerError),
}

impl From<ControllerError> for Error {
    fn from(value: ControllerError) -> Self {
        Self::Controller(value)
    }
}

/// The receive ring was full and an incoming frame was dropped.
///
/// Interrupt-side only; the condition is also latched and surfaced to the
/// next `read` as an error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxOverflow;

/// `txdone` was reported while no transmission was outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NoPendingTx;

/// Outcome of a `txready` notification that did not schedule work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxReadyError {
    /// The software ring is empty; there is nothing to hand to the hardware.
    Idle,
    /// Deferred work is already scheduled and has not run yet.
    Scheduled,
}

/// Identifier carried by synthesized error frames.
pub const ERROR_INTERNAL_ID: StandardId = StandardId::new(0x200).unwrap();

/// DLC of synthesized error frames.
pub const ERROR_DLC: Dlc = Dlc::new(8).unwrap();

/// Payload byte of an error frame holding the latched status bits.
pub const ERROR_STATUS_BYTE: usize = 5;

/// Latch bit: an incoming frame was dropped because the receive ring was
/// full.
pub const ERROR_RX_OVERFLOW: u8 = 1 << 0;
