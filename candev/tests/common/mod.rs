//! Scripted stub controller and helpers shared by the facade test suites.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use candev::CanDev;
use candev::driver::{Controller, ControllerError, SendOutcome};
use candev::frame::{Frame, Mtu};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embedded_can::{Id, StandardId};

pub const MTU: Mtu = Mtu::Classic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendBehavior {
    /// Accept the frame; completion arrives later via `txdone`.
    Queue,
    /// Accept and complete the frame during the call, like a hardware FIFO.
    Complete,
    /// Reject the frame.
    Fail(ControllerError),
}

pub struct StubState {
    /// How many more frames the hardware will accept before `tx_ready`
    /// reports false. `usize::MAX` means always ready.
    pub ready_budget: usize,
    pub tx_empty: bool,
    pub behavior: SendBehavior,
    pub setup_result: Result<(), ControllerError>,
    pub remote_result: Result<(), ControllerError>,
    pub sent: Vec<Frame>,
    pub remote_requests: Vec<Id>,
    pub ioctls: Vec<(u32, usize)>,
    pub reset_calls: usize,
    pub setup_calls: usize,
    pub shutdown_calls: usize,
    pub rx_int: bool,
    pub tx_int: bool,
}

impl StubState {
    fn new() -> Self {
        Self {
            ready_budget: usize::MAX,
            tx_empty: true,
            behavior: SendBehavior::Queue,
            setup_result: Ok(()),
            remote_result: Ok(()),
            sent: Vec::new(),
            remote_requests: Vec::new(),
            ioctls: Vec::new(),
            reset_calls: 0,
            setup_calls: 0,
            shutdown_calls: 0,
            rx_int: false,
            tx_int: false,
        }
    }
}

/// Lower half driven entirely by a shared script the test body can edit.
pub struct Stub<const HW_FIFO: bool = false> {
    state: Rc<RefCell<StubState>>,
}

impl<const HW_FIFO: bool> Stub<HW_FIFO> {
    pub fn new() -> (Self, Rc<RefCell<StubState>>) {
        let state = Rc::new(RefCell::new(StubState::new()));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl<const HW_FIFO: bool> Controller for Stub<HW_FIFO> {
    const MTU: Mtu = MTU;
    const HW_TX_FIFO: bool = HW_FIFO;

    fn reset(&mut self) {
        self.state.borrow_mut().reset_calls += 1;
    }

    fn setup(&mut self) -> Result<(), ControllerError> {
        let mut s = self.state.borrow_mut();
        s.setup_calls += 1;
        s.setup_result
    }

    fn shutdown(&mut self) {
        self.state.borrow_mut().shutdown_calls += 1;
    }

    fn rx_interrupts(&mut self, enable: bool) {
        self.state.borrow_mut().rx_int = enable;
    }

    fn tx_interrupts(&mut self, enable: bool) {
        self.state.borrow_mut().tx_int = enable;
    }

    fn tx_ready(&self) -> bool {
        self.state.borrow().ready_budget > 0
    }

    fn tx_empty(&self) -> bool {
        self.state.borrow().tx_empty
    }

    fn send(&mut self, frame: &Frame) -> Result<SendOutcome, ControllerError> {
        let mut s = self.state.borrow_mut();
        match s.behavior {
            SendBehavior::Fail(e) => Err(e),
            behavior => {
                s.sent.push(*frame);
                if s.ready_budget != usize::MAX {
                    s.ready_budget -= 1;
                }
                Ok(match behavior {
                    SendBehavior::Complete => SendOutcome::Complete,
                    _ => SendOutcome::Queued,
                })
            }
        }
    }

    fn remote_request(&mut self, id: Id) -> Result<(), ControllerError> {
        let mut s = self.state.borrow_mut();
        s.remote_requests.push(id);
        s.remote_result
    }

    fn ioctl(&mut self, cmd: u32, arg: usize) -> Result<(), ControllerError> {
        self.state.borrow_mut().ioctls.push((cmd, arg));
        Ok(())
    }
}

/// Leaks a device around a fresh stub, the way board support would own it
/// statically.
pub fn leak_dev<const HW: bool, const TX: usize, const RX: usize, const NRTR: usize>() -> (
    &'static CanDev<CriticalSectionRawMutex, Stub<HW>, TX, RX, NRTR>,
    Rc<RefCell<StubState>>,
) {
    let (stub, state) = Stub::new();
    let dev = Box::leak(Box::new(CanDev::new(stub)));
    (dev, state)
}

pub fn std_id(raw: u16) -> Id {
    Id::Standard(StandardId::new(raw).unwrap())
}

pub fn data_frame(id: u16, data: &[u8]) -> Frame {
    Frame::data_frame(StandardId::new(id).unwrap(), data, MTU).unwrap()
}

/// Serializes `frames` back to back, as they travel through read and write.
pub fn encode(frames: &[Frame]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for frame in frames {
        let mut buf = [0u8; 96];
        let n = frame.emit(&mut buf, MTU).unwrap();
        bytes.extend_from_slice(&buf[..n]);
    }
    bytes
}

pub fn decode_all(mut bytes: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        let (frame, n) = Frame::parse(bytes, MTU).unwrap();
        frames.push(frame);
        bytes = &bytes[n..];
    }
    frames
}
