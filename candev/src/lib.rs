//! # Candev
//!
//! This library provides the hardware-independent upper half of a CAN
//! character device for `no_std` environments: buffered, optionally blocking
//! reads and writes of serialized CAN frames on top of a controller-specific
//! lower half. It uses fixed-capacity buffers owned by the device, requiring
//! no dynamic memory allocation.
//!
//! ## Architecture
//!
//! ```text
//!  user tasks                       interrupt handler
//!  ┌────────────────────────┐       ┌─────────────────────────┐
//!  │ open/close  read write │       │ receive txdone txready  │
//!  └───────────┬────────────┘       └────────────┬────────────┘
//!              ▼                                 ▼
//!  ┌─────────────────────────────────────────────────────────┐
//!  │ CanDev        TX ring (head/queue/tail)                 │
//!  │               RX ring · RTR rendezvous · error latch    │
//!  └───────────────────────────┬─────────────────────────────┘
//!                              ▼
//!                   Controller (lower half)
//! ```
//!
//! Components:
//! * [`CanDev`] owns the buffering between user tasks and one controller:
//!   a transmit ring whose three cursors distinguish enqueued, in-flight,
//!   and completed frames, a receive ring, and a table of pending remote
//!   transmission requests served directly to their requesters.
//! * [`Handle`] is one open session; its `read` and `write` move whole
//!   serialized frames and park while their ring is empty or full.
//! * The [`driver`] crate defines the [`Controller`](driver::Controller)
//!   trait the lower half implements, and the frame object both halves
//!   exchange.
//! * [`TxReadyRunner`] is a worker task for controllers with hardware
//!   transmit queues, resuming stalled writers once queue space reappears.
//!
//! ## Concurrency model
//!
//! A single blocking mutex (`embassy_sync::blocking_mutex`) guards the whole
//! device state. Interrupt-side entry points run entirely inside one lock
//! section; on single-core targets instantiate the device with
//! `CriticalSectionRawMutex` so that those sections mask interrupts.
//! Facade operations never hold the lock across a suspension point: every
//! blocking point is a predicate wait that re-checks its ring in a fresh
//! lock section after each wake-up. Open and close are serialized end to end
//! by a dedicated async mutex that the data paths never touch.
//!
//! ## Examples
//!
//! ```
//! use candev::driver::{Controller, ControllerError, SendOutcome};
//! use candev::frame::{Frame, Mtu};
//! use candev::CanDev;
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//! use embedded_can::StandardId;
//! use static_cell::StaticCell;
//!
//! struct Echo;
//!
//! impl Controller for Echo {
//!     const MTU: Mtu = Mtu::Classic;
//!     fn reset(&mut self) {}
//!     fn setup(&mut self) -> Result<(), ControllerError> {
//!         Ok(())
//!     }
//!     fn shutdown(&mut self) {}
//!     fn rx_interrupts(&mut self, _enable: bool) {}
//!     fn tx_interrupts(&mut self, _enable: bool) {}
//!     fn tx_ready(&self) -> bool {
//!         true
//!     }
//!     fn tx_empty(&self) -> bool {
//!         true
//!     }
//!     fn send(&mut self, _frame: &Frame) -> Result<SendOutcome, ControllerError> {
//!         Ok(SendOutcome::Complete)
//!     }
//!     fn remote_request(&mut self, _id: embedded_can::Id) -> Result<(), ControllerError> {
//!         Ok(())
//!     }
//! }
//!
//! static DEVICE: StaticCell<CanDev<CriticalSectionRawMutex, Echo, 8, 8, 4>> = StaticCell::new();
//!
//! futures_executor::block_on(async {
//!     let dev = DEVICE.init(CanDev::new(Echo));
//!     let mut port = dev.open(false).await.unwrap();
//!
//!     let frame =
//!         Frame::data_frame(StandardId::new(0x123).unwrap(), &[0xaa, 0xbb], Mtu::Classic)
//!             .unwrap();
//!     let mut buf = [0u8; 16];
//!     let len = frame.emit(&mut buf, Mtu::Classic).unwrap();
//!     port.write(&buf[..len]).await.unwrap();
//!
//!     // received frames are handed in from the controller's interrupt handler
//!     dev.receive(frame).unwrap();
//!     let n = port.read(&mut buf).await.unwrap();
//!     assert_eq!(n, len);
//!
//!     port.close().await.unwrap();
//! });
//! ```

#![no_std]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod device;
mod error;
mod ring;
mod rtr;

pub use candev_driver as driver;
pub use candev_driver::frame;

pub use device::{CanDev, Handle, TxReadyRunner};
pub use error::{
    ERROR_DLC, ERROR_INTERNAL_ID, ERROR_RX_OVERFLOW, ERROR_STATUS_BYTE, Error, NoPendingTx,
    RxOverflow, TxReadyError,
};
