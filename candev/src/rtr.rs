//! Pending remote-request rendezvous table
//!
//! A remote transmission request is a send-wait-receive operation: the
//! requesting task parks on a table slot, and the receive path routes the
//! first frame carrying the requested identifier straight into that slot
//! instead of the receive ring. The table is small and scanned linearly.

use candev_driver::frame::Frame;
use embassy_sync::waitqueue::WakerRegistration;
use embedded_can::Id;

enum SlotState {
    Free,
    /// A task is parked on this slot waiting for `id`.
    Waiting { id: Id },
    /// The response arrived; the parked task has not collected it yet.
    Delivered { frame: Frame },
}

struct RtrSlot {
    state: SlotState,
    waker: WakerRegistration,
}

pub(crate) struct RtrTable<const N: usize> {
    slots: [RtrSlot; N],
    /// Number of slots in the `Waiting` state.
    pending: u32,
}

impl<const N: usize> RtrTable<N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| RtrSlot {
                state: SlotState::Free,
                waker: WakerRegistration::new(),
            }),
            pending: 0,
        }
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Parks a request for `id` on the first free slot.
    pub fn register(&mut self, id: Id) -> Option<usize> {
        let index = self
            .slots
            .iter()
            .position(|slot| matches!(slot.state, SlotState::Free))?;
        self.slots[index].state = SlotState::Waiting { id };
        self.pending += 1;
        Some(index)
    }

    /// Delivers `frame` to every slot waiting for its identifier.
    ///
    /// Returns whether at least one slot matched; a matched frame does not
    /// also enter the receive ring.
    pub fn resolve(&mut self, frame: &Frame) -> bool {
        if self.pending == 0 {
            return false;
        }

        let mut matched = false;
        for slot in self.slots.iter_mut() {
            if let SlotState::Waiting { id } = slot.state {
                if id == frame.header().id {
                    slot.state = SlotState::Delivered { frame: *frame };
                    self.pending -= 1;
                    slot.waker.wake();
                    matched = true;
                }
            }
        }
        matched
    }

    /// Takes the delivered response out of a slot, freeing it.
    pub fn claim(&mut self, index: usize) -> Option<Frame> {
        let slot = &mut self.slots[index];
        match core::mem::replace(&mut slot.state, SlotState::Free) {
            SlotState::Delivered { frame } => Some(frame),
            other => {
                slot.state = other;
                None
            }
        }
    }

    /// Releases a slot whose requester gave up, delivered or not.
    pub fn cancel(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        match slot.state {
            SlotState::Waiting { .. } => {
                slot.state = SlotState::Free;
                self.pending -= 1;
            }
            SlotState::Delivered { .. } => slot.state = SlotState::Free,
            SlotState::Free => {}
        }
    }

    pub fn register_waker(&mut self, index: usize, waker: &core::task::Waker) {
        self.slots[index].waker.register(waker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candev_driver::frame::{Dlc, Mtu};
    use embedded_can::StandardId;
    use futures_test::task::new_count_waker;

    fn id(raw: u16) -> Id {
        Id::Standard(StandardId::new(raw).unwrap())
    }

    fn response(raw: u16, data: &[u8]) -> Frame {
        Frame::data_frame(StandardId::new(raw).unwrap(), data, Mtu::Classic).unwrap()
    }

    #[test]
    fn test_register_first_free_slot() {
        let mut table: RtrTable<3> = RtrTable::new();
        assert_eq!(table.register(id(1)), Some(0));
        assert_eq!(table.register(id(2)), Some(1));
        table.cancel(0);
        assert_eq!(table.register(id(3)), Some(0));
        assert_eq!(table.register(id(4)), Some(2));
        assert_eq!(table.register(id(5)), None);
        assert_eq!(table.pending(), 3);
    }

    #[test]
    fn test_resolve_delivers_and_wakes() {
        let (waker, count) = new_count_waker();
        let mut table: RtrTable<2> = RtrTable::new();

        let index = table.register(id(0x7)).unwrap();
        table.register_waker(index, &waker);
        assert_eq!(table.claim(index), None);

        assert!(!table.resolve(&response(0x8, &[9])));
        assert_eq!(count.get(), 0);

        let frame = response(0x7, &[1, 2, 3]);
        assert!(table.resolve(&frame));
        assert_eq!(count.get(), 1);
        assert_eq!(table.pending(), 0);

        let delivered = table.claim(index).unwrap();
        assert_eq!(delivered, frame);
        assert_eq!(delivered.data(Mtu::Classic), &[1, 2, 3]);

        // slot is free again
        assert_eq!(table.register(id(0x9)), Some(0));
    }

    #[test]
    fn test_resolve_matches_every_waiting_slot() {
        let mut table: RtrTable<3> = RtrTable::new();
        let a = table.register(id(0x7)).unwrap();
        let b = table.register(id(0x5)).unwrap();
        let c = table.register(id(0x7)).unwrap();

        let frame = response(0x7, &[0xaa]);
        assert!(table.resolve(&frame));
        assert_eq!(table.pending(), 1);
        assert_eq!(table.claim(a), Some(frame));
        assert_eq!(table.claim(c), Some(frame));
        assert_eq!(table.claim(b), None);
    }

    #[test]
    fn test_delivered_slot_is_occupied_until_claimed() {
        let mut table: RtrTable<1> = RtrTable::new();
        let index = table.register(id(0x7)).unwrap();
        assert!(table.resolve(&response(0x7, &[])));

        // delivered but unclaimed: no room for a new request
        assert_eq!(table.register(id(0x8)), None);
        assert!(table.claim(index).is_some());
        assert_eq!(table.register(id(0x8)), Some(0));
    }

    #[test]
    fn test_cancel_releases_pending_request() {
        let mut table: RtrTable<2> = RtrTable::new();
        let index = table.register(id(0x7)).unwrap();
        assert_eq!(table.pending(), 1);
        table.cancel(index);
        assert_eq!(table.pending(), 0);
        assert!(!table.resolve(&response(0x7, &[])));

        // cancelling a delivered slot only frees it
        let index = table.register(id(0x7)).unwrap();
        assert!(table.resolve(&response(0x7, &[])));
        table.cancel(index);
        assert_eq!(table.pending(), 0);
        assert_eq!(table.claim(index), None);
    }

    #[test]
    fn test_remote_frames_carry_requested_dlc() {
        let frame = Frame::remote_frame(StandardId::new(0x7).unwrap(), Dlc::new(3).unwrap());
        assert!(frame.header().rtr);
        assert_eq!(frame.header().dlc.byte_count(Mtu::Classic), 3);
    }
}
