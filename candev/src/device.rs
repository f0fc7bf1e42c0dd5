//! Device state, character-device facade, and interrupt-side entry points
//!
//! One blocking mutex guards everything the interrupt side touches: the
//! controller, both rings, the rendezvous table, and the counters. On
//! single-core targets a `CriticalSectionRawMutex` makes every lock section a
//! masked-interrupt section, which is the only mutual exclusion the interrupt
//! entry points can rely on. Facade methods never hold the lock across a
//! suspension point; each blocking operation re-checks its ring predicate in
//! a fresh lock section after every wake-up.

use core::cell::RefCell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use embassy_sync::blocking_mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_sync::waitqueue::WakerRegistration;
use embassy_time::{Duration, Timer};
use embedded_can::Id;
use heapless::Deque;

use candev_driver::frame::{Frame, HEADER_LEN, Header};
use candev_driver::{Controller, ControllerError, SendOutcome};

use crate::error::{
    ERROR_DLC, ERROR_INTERNAL_ID, ERROR_RX_OVERFLOW, ERROR_STATUS_BYTE, Error, NoPendingTx,
    RxOverflow, TxReadyError,
};
use crate::ring::TxRing;
use crate::rtr::RtrTable;

/// How often the last close re-checks the transmit drain.
const DRAIN_POLL_PERIOD: Duration = Duration::from_millis(500);

/// Parked tasks a ring can track before wake-ups degrade to a broadcast
/// storm; waits stay correct beyond it, they just re-register more often.
const WAKE_SLOTS: usize = 8;

/// Wakers of every task parked on one ring predicate.
///
/// A counting semaphore would wake exactly one waiter per post; with wakers
/// the woken task may have been cancelled in the meantime, so a single-wake
/// scheme can strand the survivors. Waking all parked tasks instead lets the
/// re-checked ring predicate arbitrate, and each loser re-registers.
struct WakeList<const N: usize> {
    slots: [WakerRegistration; N],
}

impl<const N: usize> WakeList<N> {
    const fn new() -> Self {
        const SLOT: WakerRegistration = WakerRegistration::new();
        Self { slots: [SLOT; N] }
    }

    fn register(&mut self, waker: &core::task::Waker) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| !slot.occupied()) {
            slot.register(waker);
            return;
        }
        // No slot left: flush everyone and take the first; the flushed tasks
        // re-check their predicate and re-register.
        self.wake_all();
        self.slots[0].register(waker);
    }

    fn wake_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.wake();
        }
    }
}

/// Everything the interrupt side and the facade share under one lock.
struct Shared<C: Controller, const TX: usize, const RX: usize, const NRTR: usize> {
    lower: C,
    xmit: TxRing<TX>,
    recv: Deque<Frame, RX>,
    rtr: RtrTable<NRTR>,
    open_count: u8,
    n_rx_waiters: u32,
    n_tx_waiters: u32,
    error_latch: u8,
    rx_wakers: WakeList<WAKE_SLOTS>,
    tx_wakers: WakeList<WAKE_SLOTS>,
}

/// Why the transmit pump made no progress
enum XmitStall {
    /// The software ring is empty.
    Idle,
    /// The hardware would not take a frame.
    NotReady,
    /// The controller rejected a frame.
    Controller(ControllerError),
}

impl<C: Controller, const TX: usize, const RX: usize, const NRTR: usize> Shared<C, TX, RX, NRTR> {
    /// Hands enqueued frames to the hardware while it accepts them.
    ///
    /// `Ok` means at least one frame was handed over and none was rejected.
    /// Runs under the device lock; a controller that completes the frame
    /// during `send` gets its head-cursor advance and writer wake-up inline.
    fn transmit(&mut self) -> Result<(), XmitStall> {
        let (head, queue, tail) = self.xmit.cursors();
        trace!("xmit: head={} queue={} tail={}", head, queue, tail);

        if self.xmit.is_empty() {
            debug_assert!(self.xmit.all_queued());
            if !C::HW_TX_FIFO {
                // No hardware queue to drain, nothing buffered: completion
                // interrupts have no work left.
                self.lower.tx_interrupts(false);
            }
            return Err(XmitStall::Idle);
        }

        let mut outcome = Err(XmitStall::NotReady);
        while !self.xmit.all_queued() && self.lower.tx_ready() {
            debug_assert!(!self.xmit.is_empty());
            // The queue cursor moves before the send so that a completion
            // arriving from inside the call finds head < queue.
            let frame = self.xmit.next_for_hw();
            match self.lower.send(&frame) {
                Ok(SendOutcome::Queued) => outcome = Ok(()),
                Ok(SendOutcome::Complete) => {
                    outcome = Ok(());
                    self.retire_oldest();
                }
                Err(e) => {
                    error!("xmit: send failed: {:?}", e);
                    outcome = Err(XmitStall::Controller(e));
                    break;
                }
            }
        }

        self.lower.tx_interrupts(true);
        outcome
    }

    /// Retires the oldest in-flight frame and wakes parked writers.
    fn retire_oldest(&mut self) {
        self.xmit.ack_one();
        if self.n_tx_waiters > 0 {
            self.tx_wakers.wake_all();
        }
    }
}

/// The upper half of a CAN character device
///
/// Owns the buffering between user tasks and one [`Controller`], by way of a
/// bounded transmit ring, a bounded receive ring, and a table of pending
/// remote-request rendezvous. Created once per controller and shared by
/// reference with the controller's interrupt handler.
pub struct CanDev<M: RawMutex, C: Controller, const TX: usize, const RX: usize, const NRTR: usize> {
    state: blocking_mutex::Mutex<M, RefCell<Shared<C, TX, RX, NRTR>>>,
    /// Serializes whole open and close bodies; the data paths never take it.
    close_lock: Mutex<M, ()>,
    /// Single-shot hand-off from `txready` to the deferred runner.
    work: Signal<M, ()>,
}

impl<M: RawMutex, C: Controller, const TX: usize, const RX: usize, const NRTR: usize>
    CanDev<M, C, TX, RX, NRTR>
{
    /// Creates the device and resets the controller hardware.
    pub fn new(mut lower: C) -> Self {
        lower.reset();
        Self {
            state: blocking_mutex::Mutex::new(RefCell::new(Shared {
                lower,
                xmit: TxRing::new(),
                recv: Deque::new(),
                rtr: RtrTable::new(),
                open_count: 0,
                n_rx_waiters: 0,
                n_tx_waiters: 0,
                error_latch: 0,
                rx_wakers: WakeList::new(),
                tx_wakers: WakeList::new(),
            })),
            close_lock: Mutex::new(()),
            work: Signal::new(),
        }
    }

    /// Opens the device, bringing the hardware up on the first open.
    ///
    /// A non-blocking handle fails with [`Error::WouldBlock`] where a
    /// blocking one would park. The handle must be retired with
    /// [`Handle::close`]; dropping it leaks its open count.
    pub async fn open(&self, nonblocking: bool) -> Result<Handle<'_, M, C, TX, RX, NRTR>, Error> {
        let _guard = self.close_lock.lock().await;

        self.state.lock(|cell| {
            let mut s = cell.borrow_mut();
            let count = s.open_count.checked_add(1).ok_or(Error::TooManyOpens)?;
            debug!("open: count={}", count);

            if count == 1 {
                s.lower.setup().map_err(Error::Controller)?;
                s.xmit.clear();
                s.recv.clear();
                s.lower.rx_interrupts(true);
            }
            s.open_count = count;
            Ok::<(), Error>(())
        })?;

        Ok(Handle {
            dev: self,
            nonblocking,
        })
    }

    /// Hands a received frame to the upper half.
    ///
    /// Interrupt-side entry point; call with the controller's receive
    /// interrupt masked (any context on targets where the device mutex
    /// itself masks interrupts). A frame that completes a pending remote
    /// request goes straight to the requester and is not buffered. When the
    /// receive ring is full the frame is dropped and the overflow is latched
    /// for the next `read`.
    pub fn receive(&self, frame: Frame) -> Result<(), RxOverflow> {
        self.state.lock(|cell| {
            let mut s = cell.borrow_mut();
            trace!(
                "receive: id={} dlc={}",
                frame.header().raw_id(),
                frame.header().dlc.into_bits()
            );

            if s.rtr.resolve(&frame) {
                return Ok(());
            }

            if s.recv.push_back(frame).is_ok() {
                if s.n_rx_waiters > 0 {
                    s.rx_wakers.wake_all();
                }
                Ok(())
            } else {
                s.error_latch |= ERROR_RX_OVERFLOW;
                Err(RxOverflow)
            }
        })
    }

    /// Reports completion of the oldest in-flight transmission.
    ///
    /// Interrupt-side entry point. Retires the frame, feeds the hardware the
    /// next one, and wakes a parked writer. Fails with [`NoPendingTx`] when
    /// nothing is outstanding.
    pub fn txdone(&self) -> Result<(), NoPendingTx> {
        self.state.lock(|cell| {
            let mut s = cell.borrow_mut();
            let (head, queue, tail) = s.xmit.cursors();
            trace!("txdone: head={} queue={} tail={}", head, queue, tail);

            if s.xmit.is_empty() {
                return Err(NoPendingTx);
            }

            s.xmit.ack_one();
            let _ = s.transmit();
            if s.n_tx_waiters > 0 {
                s.tx_wakers.wake_all();
            }
            Ok(())
        })
    }

    /// Reports that the hardware transmit queue has room again.
    ///
    /// Interrupt-side entry point for controllers with a hardware FIFO:
    /// once the FIFO fills, `send` stops accepting frames and no completion
    /// per buffered frame will arrive, so a parked writer would hang without
    /// this nudge. Schedules the deferred pump (see [`TxReadyRunner`]) if
    /// the software ring holds work and no run is already pending.
    pub fn txready(&self) -> Result<(), TxReadyError> {
        self.state.lock(|cell| {
            let s = cell.borrow();
            let (head, queue, tail) = s.xmit.cursors();
            trace!(
                "txready: head={} queue={} tail={} waiters={}",
                head, queue, tail, s.n_tx_waiters
            );

            if s.xmit.is_empty() {
                return Err(TxReadyError::Idle);
            }
            if self.work.signaled() {
                return Err(TxReadyError::Scheduled);
            }
            self.work.signal(());
            Ok(())
        })
    }

    /// The worker that executes deferred `txready` work. Spawn its
    /// [`run`](TxReadyRunner::run) on an executor of the desired priority.
    pub fn txready_runner(&self) -> TxReadyRunner<'_, M, C, TX, RX, NRTR> {
        TxReadyRunner { dev: self }
    }

    fn txready_work(&self) {
        self.state.lock(|cell| {
            let mut s = cell.borrow_mut();
            if s.xmit.is_empty() {
                return;
            }
            // If the pump made progress there is new ring space; tell a
            // parked writer.
            if s.transmit().is_ok() && s.n_tx_waiters > 0 {
                s.tx_wakers.wake_all();
            }
        });
    }

    fn ring_wait(&self, kind: WaitKind) -> RingWait<'_, M, C, TX, RX, NRTR> {
        RingWait {
            dev: self,
            kind,
            counted: false,
        }
    }
}

/// An open session on a [`CanDev`]
///
/// Each handle accounts for one open. Retire it with [`close`](Self::close);
/// a dropped handle leaves the device opened.
pub struct Handle<'a, M: RawMutex, C: Controller, const TX: usize, const RX: usize, const NRTR: usize>
{
    dev: &'a CanDev<M, C, TX, RX, NRTR>,
    nonblocking: bool,
}

enum WriteStep {
    Enqueued,
    Finish(Result<usize, Error>),
    Wait,
}

impl<'a, M: RawMutex, C: Controller, const TX: usize, const RX: usize, const NRTR: usize>
    Handle<'a, M, C, TX, RX, NRTR>
{
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    /// Reads as many buffered frames as fit into `buffer`.
    ///
    /// Returns the number of serialized bytes. A buffer too small for even a
    /// payload-less frame reads zero bytes. If an internal error is latched,
    /// the first frame returned is a synthesized error frame (identifier
    /// [`ERROR_INTERNAL_ID`], the latched bits in byte
    /// [`ERROR_STATUS_BYTE`] of the payload) and the latch clears. Blocks
    /// while the receive ring is empty unless the handle is non-blocking.
    pub async fn read(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
        trace!("read: buflen={}", buffer.len());
        if buffer.len() < HEADER_LEN {
            return Ok(0);
        }

        loop {
            let step = self.dev.state.lock(|cell| {
                let mut s = cell.borrow_mut();

                if s.error_latch != 0 {
                    let mut data = [0u8; 8];
                    data[ERROR_STATUS_BYTE] = s.error_latch;
                    let frame = Frame::new(
                        Header {
                            id: ERROR_INTERNAL_ID.into(),
                            dlc: ERROR_DLC,
                            rtr: false,
                            error: true,
                        },
                        &data,
                    );
                    return match frame.emit(buffer, C::MTU) {
                        Some(n) => {
                            s.error_latch = 0;
                            Some(Ok(n))
                        }
                        // Too small for the error frame: report nothing and
                        // consume nothing.
                        None => Some(Ok(0)),
                    };
                }

                if s.recv.is_empty() {
                    if self.nonblocking {
                        return Some(Err(Error::WouldBlock));
                    }
                    return None;
                }

                let mut nread = 0;
                while let Some(front) = s.recv.front() {
                    let len = front.wire_len(C::MTU);
                    if nread + len > buffer.len() {
                        break;
                    }
                    unwrap!(front.emit(&mut buffer[nread..], C::MTU));
                    nread += len;
                    s.recv.pop_front();
                }
                Some(Ok(nread))
            });

            match step {
                Some(result) => return result,
                None => self.dev.ring_wait(WaitKind::RxFilled).await,
            }
        }
    }

    /// Enqueues the serialized frames in `buffer` for transmission.
    ///
    /// Returns the number of bytes accepted; trailing bytes that do not form
    /// a whole frame are left unconsumed. Blocks while the transmit ring is
    /// full unless the handle is non-blocking, in which case it returns the
    /// bytes accepted so far, or [`Error::WouldBlock`] if that is zero. If
    /// the hardware was idle at entry the transmit pump is kicked before
    /// returning.
    pub async fn write(&mut self, buffer: &[u8]) -> Result<usize, Error> {
        trace!("write: buflen={}", buffer.len());
        let dev = self.dev;
        let mut nsent = 0;

        // Whether the hardware needs a kick-start once frames are buffered.
        // A pending completion interrupt cannot arrive for an idle transmit
        // path, so nobody else will feed it.
        let mut inactive = dev.state.lock(|cell| cell.borrow_mut().lower.tx_empty());

        while buffer.len() - nsent >= HEADER_LEN {
            let Some((frame, len)) = Frame::parse(&buffer[nsent..], C::MTU) else {
                break;
            };

            loop {
                let step = dev.state.lock(|cell| {
                    let mut s = cell.borrow_mut();
                    if !s.xmit.is_full() {
                        s.xmit.enqueue(frame);
                        return WriteStep::Enqueued;
                    }

                    if self.nonblocking {
                        return WriteStep::Finish(if nsent == 0 {
                            Err(Error::WouldBlock)
                        } else {
                            Ok(nsent)
                        });
                    }

                    if inactive {
                        let _ = s.transmit();
                    }
                    WriteStep::Wait
                });

                match step {
                    WriteStep::Enqueued => break,
                    WriteStep::Finish(result) => return result,
                    WriteStep::Wait => {
                        dev.ring_wait(WaitKind::TxDrained).await;
                        inactive = dev.state.lock(|cell| cell.borrow_mut().lower.tx_empty());
                    }
                }
            }

            nsent += len;
        }

        if inactive {
            dev.state.lock(|cell| {
                let _ = cell.borrow_mut().transmit();
            });
        }
        Ok(nsent)
    }

    /// Issues a remote transmission request for `id` and waits for the
    /// answering frame.
    ///
    /// The rendezvous bypasses the receive ring: the response is routed
    /// directly here and other readers never observe it. Fails with
    /// [`Error::NoRtrSlot`] when too many requests are already pending.
    /// Dropping the future releases the slot.
    pub async fn rtr_read(&mut self, id: Id) -> Result<Frame, Error> {
        let dev = self.dev;
        let index = dev.state.lock(|cell| {
            let mut s = cell.borrow_mut();
            let index = s.rtr.register(id).ok_or(Error::NoRtrSlot)?;
            if let Err(e) = s.lower.remote_request(id) {
                s.rtr.cancel(index);
                return Err(Error::Controller(e));
            }
            Ok(index)
        })?;

        Ok(RtrWait {
            dev,
            index,
            finished: false,
        }
        .await)
    }

    /// Forwards a controller-specific request to the lower half.
    pub fn ioctl(&mut self, cmd: u32, arg: usize) -> Result<(), Error> {
        debug!("ioctl: cmd={} arg={}", cmd, arg);
        self.dev
            .state
            .lock(|cell| cell.borrow_mut().lower.ioctl(cmd, arg))
            .map_err(Error::Controller)
    }

    /// Closes the handle.
    ///
    /// The last close stops reception, waits for the software ring and then
    /// the hardware transmit path to drain (polling every 500 ms), and shuts
    /// the controller down.
    pub async fn close(self) -> Result<(), Error> {
        let dev = self.dev;
        let _guard = dev.close_lock.lock().await;

        let last = dev.state.lock(|cell| {
            let mut s = cell.borrow_mut();
            debug!("close: count={}", s.open_count);
            if s.open_count > 1 {
                s.open_count -= 1;
                false
            } else {
                s.open_count = 0;
                s.lower.rx_interrupts(false);
                true
            }
        });
        if !last {
            return Ok(());
        }

        // Outgoing frames are not abandoned: wait out the software ring,
        // then the hardware.
        loop {
            let empty = dev.state.lock(|cell| cell.borrow().xmit.is_empty());
            if empty {
                break;
            }
            Timer::after(DRAIN_POLL_PERIOD).await;
        }
        loop {
            let empty = dev.state.lock(|cell| cell.borrow_mut().lower.tx_empty());
            if empty {
                break;
            }
            Timer::after(DRAIN_POLL_PERIOD).await;
        }

        dev.state.lock(|cell| cell.borrow_mut().lower.shutdown());
        Ok(())
    }
}

/// Executes deferred transmit-ready work signalled by [`CanDev::txready`]
///
/// The pump may retire frames and wake writers, which must not happen at
/// interrupt level, so `txready` only raises a single-shot signal and this
/// worker performs the actual hand-off. Spawn [`run`](Self::run) on an
/// executor whose priority matches how promptly stalled writers should
/// resume.
pub struct TxReadyRunner<
    'a,
    M: RawMutex,
    C: Controller,
    const TX: usize,
    const RX: usize,
    const NRTR: usize,
> {
    dev: &'a CanDev<M, C, TX, RX, NRTR>,
}

impl<'a, M: RawMutex, C: Controller, const TX: usize, const RX: usize, const NRTR: usize>
    TxReadyRunner<'a, M, C, TX, RX, NRTR>
{
    pub async fn run(&mut self) -> ! {
        loop {
            self.dev.work.wait().await;
            self.dev.txready_work();
        }
    }
}

#[derive(Clone, Copy)]
enum WaitKind {
    /// Park until the receive ring holds a frame.
    RxFilled,
    /// Park until the transmit ring has a free slot.
    TxDrained,
}

/// Predicate wait on one of the rings, counted in the device's waiter
/// bookkeeping for exactly the span it is parked.
struct RingWait<'a, M: RawMutex, C: Controller, const TX: usize, const RX: usize, const NRTR: usize>
{
    dev: &'a CanDev<M, C, TX, RX, NRTR>,
    kind: WaitKind,
    counted: bool,
}

fn wait_step(
    ready: bool,
    counter: &mut u32,
    wakers: &mut WakeList<WAKE_SLOTS>,
    counted: &mut bool,
    cx: &mut Context<'_>,
) -> Poll<()> {
    if ready {
        if *counted {
            *counter -= 1;
            *counted = false;
        }
        Poll::Ready(())
    } else {
        if !*counted {
            *counter += 1;
            *counted = true;
        }
        wakers.register(cx.waker());
        Poll::Pending
    }
}

impl<M: RawMutex, C: Controller, const TX: usize, const RX: usize, const NRTR: usize> Future
    for RingWait<'_, M, C, TX, RX, NRTR>
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        this.dev.state.lock(|cell| {
            let mut guard = cell.borrow_mut();
            let s = &mut *guard;
            match this.kind {
                WaitKind::RxFilled => {
                    let ready = !s.recv.is_empty();
                    wait_step(ready, &mut s.n_rx_waiters, &mut s.rx_wakers, &mut this.counted, cx)
                }
                WaitKind::TxDrained => {
                    let ready = !s.xmit.is_full();
                    wait_step(ready, &mut s.n_tx_waiters, &mut s.tx_wakers, &mut this.counted, cx)
                }
            }
        })
    }
}

impl<M: RawMutex, C: Controller, const TX: usize, const RX: usize, const NRTR: usize> Drop
    for RingWait<'_, M, C, TX, RX, NRTR>
{
    fn drop(&mut self) {
        if self.counted {
            self.dev.state.lock(|cell| {
                let mut s = cell.borrow_mut();
                match self.kind {
                    WaitKind::RxFilled => s.n_rx_waiters -= 1,
                    WaitKind::TxDrained => s.n_tx_waiters -= 1,
                }
            });
        }
    }
}

/// Rendezvous wait on a registered remote-request slot. Dropping it releases
/// the slot.
struct RtrWait<'a, M: RawMutex, C: Controller, const TX: usize, const RX: usize, const NRTR: usize>
{
    dev: &'a CanDev<M, C, TX, RX, NRTR>,
    index: usize,
    finished: bool,
}

impl<M: RawMutex, C: Controller, const TX: usize, const RX: usize, const NRTR: usize> Future
    for RtrWait<'_, M, C, TX, RX, NRTR>
{
    type Output = Frame;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Frame> {
        let this = self.get_mut();
        this.dev.state.lock(|cell| {
            let mut s = cell.borrow_mut();
            match s.rtr.claim(this.index) {
                Some(frame) => {
                    this.finished = true;
                    Poll::Ready(frame)
                }
                None => {
                    s.rtr.register_waker(this.index, cx.waker());
                    Poll::Pending
                }
            }
        })
    }
}

impl<M: RawMutex, C: Controller, const TX: usize, const RX: usize, const NRTR: usize> Drop
    for RtrWait<'_, M, C, TX, RX, NRTR>
{
    fn drop(&mut self) {
        if !self.finished {
            self.dev
                .state
                .lock(|cell| cell.borrow_mut().rtr.cancel(self.index));
        }
    }
}
