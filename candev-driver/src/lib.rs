//! Candev controller driver interface
//!
//! The crate provides the interface between a CAN controller driver and the
//! `candev` character-device upper half. Limited scope facilitates
//! compatibility across versions. Controller crates should depend on this
//! crate. Users of the character device should depend on the `candev` crate
//! instead.
//!
//! A [`Controller`] is the hardware-dependent half of the split driver: it
//! owns the peripheral, performs the actual transmission, and tells the upper
//! half about its transmit state. The upper half calls every `Controller`
//! method with its device lock held, which on interrupt-capable targets means
//! interrupts are masked for the duration of the call; implementations must
//! not block.
//!
//! Completion notifications flow the other way: the controller's interrupt
//! handler hands received frames and transmit completions to the upper half
//! (`CanDev::receive`, `CanDev::txdone`, `CanDev::txready` in `candev`).
//! A controller whose hardware queues outgoing frames internally reports
//! acceptance into that queue through [`SendOutcome::Complete`] instead of
//! re-entering the upper half from inside [`Controller::send`].

#![no_std]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod frame;

use embedded_can::Id;

use crate::frame::{Frame, Mtu};

/// Failure reported by a controller operation
///
/// The upper half propagates these to the caller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerError {
    /// The controller cannot take the request right now.
    Busy,
    /// The peripheral failed to carry out the request.
    Io,
    /// The request is not implemented by this controller.
    NotSupported,
    /// The request argument is out of range for this controller.
    InvalidArgument,
}

/// What happened to a frame accepted by [`Controller::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendOutcome {
    /// The transfer was started; completion arrives later through the
    /// interrupt handler.
    Queued,
    /// The frame was fully processed during the call (typically accepted
    /// into a hardware transmit FIFO). The upper half retires it immediately.
    Complete,
}

/// Operations of the hardware-dependent lower half
///
/// All methods are invoked with the upper half's device lock held and must
/// return without blocking.
pub trait Controller {
    /// Link flavor of this controller, fixing DLC decoding and the largest
    /// payload a frame may carry.
    const MTU: Mtu;

    /// Whether the hardware queues multiple outgoing frames internally.
    ///
    /// When set, transmit interrupts stay armed while the software ring is
    /// empty (the hardware queue may still be draining), and the controller
    /// is expected to report [`SendOutcome::Complete`] as frames enter its
    /// queue and to call the upper half's `txready` as slots free up.
    const HW_TX_FIFO: bool = false;

    /// Puts the peripheral into a known initial state. Called once when the
    /// device is created, before any open.
    fn reset(&mut self);

    /// Brings the peripheral up. Called on the first open.
    fn setup(&mut self) -> Result<(), ControllerError>;

    /// Disables the peripheral. Called on the last close, after both the
    /// software ring and the hardware transmit path have drained.
    fn shutdown(&mut self);

    /// Enables or disables receive interrupts.
    fn rx_interrupts(&mut self, enable: bool);

    /// Enables or disables transmit-completion interrupts.
    fn tx_interrupts(&mut self, enable: bool);

    /// Whether the hardware can accept another outgoing frame right now.
    fn tx_ready(&self) -> bool;

    /// Whether all previously accepted frames have left the hardware.
    fn tx_empty(&self) -> bool;

    /// Hands one frame to the hardware. Only called while [`tx_ready`]
    /// reports `true`.
    ///
    /// [`tx_ready`]: Controller::tx_ready
    fn send(&mut self, frame: &Frame) -> Result<SendOutcome, ControllerError>;

    /// Transmits a remote transmission request for `id`.
    fn remote_request(&mut self, id: Id) -> Result<(), ControllerError>;

    /// Controller-specific request forwarded verbatim from the character
    /// device's `ioctl` entry point.
    fn ioctl(&mut self, cmd: u32, arg: usize) -> Result<(), ControllerError> {
        let _ = (cmd, arg);
        Err(ControllerError::NotSupported)
    }
}
