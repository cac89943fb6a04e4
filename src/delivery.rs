//! Delivery records and the peer-linkage arena (§3 "Delivery", §9 design
//! note "Cyclic peer delivery linkage").
//!
//! A naive delivery pair could be modeled with raw mutable cross-pointers
//! (`a.peer = b`, `b.peer = a`). Per §9 this crate instead stores
//! deliveries in a [`DeliveryArena`] addressed by a stable [`DeliveryKey`]
//! (slot index + generation, to reject use-after-free accesses to a reused
//! slot); pairing becomes two key writes, gated by the core thread's
//! single-writer discipline (§5).

use std::collections::VecDeque;
use std::sync::Arc;

use crate::domain_types::DeliveryTag;
use crate::link::LinkId;
use crate::message::Message;

/// AMQP delivery outcome / disposition code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// No disposition has been applied yet.
    Received,
    /// Terminal: the message was processed successfully.
    Accepted,
    /// Terminal: the message was rejected as malformed or unprocessable.
    Rejected,
    /// Terminal: the message could not be routed or delivered.
    Released,
    /// Terminal: the message was modified and may be redelivered elsewhere.
    Modified,
}

impl Disposition {
    /// Whether this disposition is one of the four terminal AMQP outcomes.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Disposition::Received)
    }
}

/// Opaque, stable reference to a delivery stored in a [`DeliveryArena`].
///
/// Carries a generation counter so that a key captured before a slot was
/// reused (freed delivery, new delivery allocated in its place) compares
/// unequal to the new occupant and arena lookups against it return `None`
/// rather than aliasing the wrong delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    index: usize,
    generation: u64,
}

/// A single message traversal over one link (§3 "Delivery").
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The link this delivery was enqueued on.
    pub owning_link: LinkId,
    /// The inbound delivery that produced this outbound one, if any.
    pub peer: Option<DeliveryKey>,
    /// Shared, copy-on-forward message reference.
    pub message: Arc<Message>,
    /// Monotonically-assigned delivery tag.
    pub tag: DeliveryTag,
    /// Current disposition.
    pub disposition: Disposition,
    /// Whether this delivery has reached a terminal, settled state.
    pub settled: bool,
    /// Snapshot of the ingress annotation at the time this delivery was
    /// created, used by multicast-once's origin resolution.
    pub origin: Option<String>,
}

impl Delivery {
    /// A settled delivery must have no live peer linkage (§3 invariant).
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        !(self.settled && self.peer.is_some())
    }
}

struct Slot {
    delivery: Option<Delivery>,
    generation: u64,
}

/// Per-connection (or global, depending on the caller's granularity) arena
/// of deliveries, addressed by stable [`DeliveryKey`]s.
///
/// Single-writer: only the core thread ever calls `insert`/`remove`/
/// `get_mut` (§5 "Address table, forwarder array, router-node array:
/// core-thread-only mutation"); the arena itself carries no internal
/// synchronization because of that discipline.
#[derive(Default)]
pub struct DeliveryArena {
    slots: Vec<Slot>,
    free_list: VecDeque<usize>,
}

impl DeliveryArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new delivery, returning its stable key.
    pub fn insert(&mut self, delivery: Delivery) -> DeliveryKey {
        if let Some(index) = self.free_list.pop_front() {
            let slot = &mut self.slots[index];
            slot.delivery = Some(delivery);
            DeliveryKey {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len();
            self.slots.push(Slot {
                delivery: Some(delivery),
                generation: 0,
            });
            DeliveryKey { index, generation: 0 }
        }
    }

    /// Looks up a delivery by key, returning `None` if the slot was freed
    /// and possibly reused (stale key).
    #[must_use]
    pub fn get(&self, key: DeliveryKey) -> Option<&Delivery> {
        let slot = self.slots.get(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.delivery.as_ref()
    }

    /// Mutable lookup, same staleness semantics as [`DeliveryArena::get`].
    pub fn get_mut(&mut self, key: DeliveryKey) -> Option<&mut Delivery> {
        let slot = self.slots.get_mut(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.delivery.as_mut()
    }

    /// Forms bidirectional peer linkage between two deliveries.
    ///
    /// Per §9 (ii) and §4.2's "multicast peer linkage is documented as a
    /// known limitation": a peer's `peer` field is only ever set if it was
    /// previously `None`, so a multicast source's peer back-pointer stores
    /// only the most recently linked outbound delivery.
    pub fn link_peers(&mut self, a: DeliveryKey, b: DeliveryKey) {
        if let Some(delivery_a) = self.get_mut(a) {
            delivery_a.peer = Some(b);
        }
        if let Some(delivery_b) = self.get_mut(b) {
            if delivery_b.peer.is_none() {
                delivery_b.peer = Some(a);
            }
        }
    }

    /// Releases a delivery's slot once disposition has reached a terminal
    /// state on both sides or the owning connection has closed (§3
    /// invariant). Bumps the slot's generation so stale keys miss.
    pub fn remove(&mut self, key: DeliveryKey) -> Option<Delivery> {
        let slot = self.slots.get_mut(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        let delivery = slot.delivery.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push_back(key.index);
        Some(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::DeliveryTagAllocator;
    use crate::link::LinkId;

    fn sample_delivery(tag: DeliveryTag) -> Delivery {
        Delivery {
            owning_link: LinkId::generate(),
            peer: None,
            message: Arc::new(Message::new()),
            tag,
            disposition: Disposition::Received,
            settled: false,
            origin: None,
        }
    }

    #[test]
    fn stale_key_misses_after_removal_and_reuse() {
        let alloc = DeliveryTagAllocator::default();
        let mut arena = DeliveryArena::new();
        let first_key = arena.insert(sample_delivery(alloc.next()));
        arena.remove(first_key).unwrap();
        let second_key = arena.insert(sample_delivery(alloc.next()));

        assert_ne!(first_key, second_key);
        assert!(arena.get(first_key).is_none());
        assert!(arena.get(second_key).is_some());
    }

    #[test]
    fn link_peers_forms_symmetric_pair() {
        // §8 invariant 2
        let alloc = DeliveryTagAllocator::default();
        let mut arena = DeliveryArena::new();
        let a = arena.insert(sample_delivery(alloc.next()));
        let b = arena.insert(sample_delivery(alloc.next()));
        arena.link_peers(a, b);

        assert_eq!(arena.get(a).unwrap().peer, Some(b));
        assert_eq!(arena.get(b).unwrap().peer, Some(a));
    }

    #[test]
    fn multicast_peer_linkage_keeps_only_most_recent_back_pointer() {
        // §9 open question (i): a source delivery linked to two targets
        // only remembers the most recent target as its own `peer`.
        let alloc = DeliveryTagAllocator::default();
        let mut arena = DeliveryArena::new();
        let source = arena.insert(sample_delivery(alloc.next()));
        let target_a = arena.insert(sample_delivery(alloc.next()));
        let target_b = arena.insert(sample_delivery(alloc.next()));

        arena.link_peers(source, target_a);
        arena.link_peers(source, target_b);

        assert_eq!(arena.get(source).unwrap().peer, Some(target_b));
        // target_a's peer was set when it was still None, so it still
        // points back at source even though source has moved on.
        assert_eq!(arena.get(target_a).unwrap().peer, Some(source));
    }

    #[test]
    fn settled_delivery_with_no_peer_is_consistent() {
        let alloc = DeliveryTagAllocator::default();
        let mut delivery = sample_delivery(alloc.next());
        delivery.settled = true;
        assert!(delivery.is_consistent());
        delivery.peer = Some(DeliveryKey { index: 0, generation: 0 });
        assert!(!delivery.is_consistent());
    }
}
