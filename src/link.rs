//! Link objects and their lifecycle state machine (§3 "Link", §4.3).

use std::collections::VecDeque;

use crate::delivery::DeliveryKey;
use crate::domain_types::{ConnectionId, CreditCount};

pub use crate::domain_types::LinkId;

/// Direction of a link relative to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// The router receives messages on this link (an AMQP sender attaches
    /// to it).
    Incoming,
    /// The router sends messages on this link (an AMQP receiver attaches
    /// to it).
    Outgoing,
}

/// The four link classes named in §3 "Link".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// An ordinary client-facing message link.
    Normal,
    /// A router-to-router management/control link.
    Control,
    /// A router-to-router link carrying forwarded application data.
    InterRouterData,
    /// A router-to-router link carrying route-table control traffic.
    RouterControl,
}

/// The two-sided attach/detach lifecycle (§3 "Link", §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Allocated, not yet attached.
    Init,
    /// First attach sent/received, awaiting the second.
    Attaching,
    /// Both sides have attached; deliveries may flow.
    Attached,
    /// A detach has been sent or received; waiting for the other side.
    Detaching,
    /// Both sides have detached; the link is ready for teardown.
    Detached,
}

/// Bits identifying which of the four global link-ref lists a link
/// currently appears on (§3 "Link"). Hand-rolled rather than pulling in a
/// bitflags dependency for four bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkRefBits(u8);

impl LinkRefBits {
    /// On the address table's local consumer/producer ref list.
    pub const ADDRESS: Self = Self(1 << 0);
    /// On the set of links with pending deliveries.
    pub const DELIVERY: Self = Self(1 << 1);
    /// On the set of links with available credit.
    pub const FLOW: Self = Self(1 << 2);
    /// On the owning connection's link list.
    pub const CONNECTION: Self = Self(1 << 3);

    /// Returns whether `other`'s bits are all present.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the given bits.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clears the given bits.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// A link attached to a connection (§3 "Link").
#[derive(Debug)]
pub struct Link {
    id: LinkId,
    owning_connection: ConnectionId,
    direction: LinkDirection,
    link_type: LinkType,
    state: LinkState,
    /// Number of two-sided detach events observed so far (0, 1, or 2).
    detach_count: u8,
    capacity: usize,
    credit: CreditCount,
    drain_requested: bool,
    undelivered: VecDeque<DeliveryKey>,
    unsettled: VecDeque<DeliveryKey>,
    ref_bits: LinkRefBits,
}

impl Link {
    /// Creates a freshly-allocated link in [`LinkState::Init`].
    #[must_use]
    pub fn new(
        owning_connection: ConnectionId,
        direction: LinkDirection,
        link_type: LinkType,
        capacity: usize,
    ) -> Self {
        Self {
            id: LinkId::generate(),
            owning_connection,
            direction,
            link_type,
            state: LinkState::Init,
            detach_count: 0,
            capacity,
            credit: CreditCount::default(),
            drain_requested: false,
            undelivered: VecDeque::new(),
            unsettled: VecDeque::new(),
            ref_bits: LinkRefBits::default(),
        }
    }

    /// The link's stable identifier.
    #[must_use]
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// The connection this link is attached to.
    #[must_use]
    pub fn owning_connection(&self) -> ConnectionId {
        self.owning_connection
    }

    /// The link's direction.
    #[must_use]
    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    /// The link's class.
    #[must_use]
    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// The link's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// The configured capacity (max outstanding undelivered count).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Advances the attach state machine on the first attach (§4.3).
    pub fn first_attach(&mut self) {
        self.state = LinkState::Attaching;
    }

    /// Advances the attach state machine on the matching second attach.
    pub fn second_attach(&mut self) {
        if self.state == LinkState::Attaching {
            self.state = LinkState::Attached;
        }
    }

    /// Runs one side of the two-sided detach (§4.3 "Detach").
    ///
    /// `first = true` closes the local side and waits for the remote;
    /// `first = false` performs final teardown.
    pub fn detach(&mut self, first: bool) {
        self.detach_count = self.detach_count.saturating_add(1);
        self.state = if first {
            LinkState::Detaching
        } else {
            LinkState::Detached
        };
    }

    /// A `LOST` detach (connection drop) short-circuits both sides at once.
    pub fn detach_lost(&mut self) {
        self.detach_count = 2;
        self.state = LinkState::Detached;
    }

    /// Number of detach events observed (0, 1, or 2).
    #[must_use]
    pub fn detach_count(&self) -> u8 {
        self.detach_count
    }

    /// Applies a `link_flow` action's credit grant and drain flag (§4.3
    /// "Credit").
    pub fn apply_flow(&mut self, credit: CreditCount, drain: bool) {
        self.credit = credit;
        self.drain_requested = drain;
    }

    /// Current credit available to the producer side.
    #[must_use]
    pub fn credit(&self) -> CreditCount {
        self.credit
    }

    /// Whether a drain was requested on the last flow.
    #[must_use]
    pub fn drain_requested(&self) -> bool {
        self.drain_requested
    }

    /// Whether this link currently has credit to push a delivery.
    #[must_use]
    pub fn has_credit(&self) -> bool {
        self.credit.into_inner() > 0
    }

    /// Consumes one unit of credit, e.g. when the I/O bridge materializes a
    /// wire delivery from `undelivered`.
    pub fn consume_credit(&mut self) {
        self.credit = self.credit.consume_one();
    }

    /// Appends a delivery to the `undelivered` queue (FIFO per §5 "ordering
    /// guarantees").
    pub fn push_undelivered(&mut self, key: DeliveryKey) {
        self.undelivered.push_back(key);
    }

    /// Pops the next `undelivered` delivery, if any.
    pub fn pop_undelivered(&mut self) -> Option<DeliveryKey> {
        self.undelivered.pop_front()
    }

    /// Number of deliveries currently queued for this link, used by
    /// `ANYCAST_BALANCED`'s load comparison (§4.2).
    #[must_use]
    pub fn undelivered_depth(&self) -> usize {
        self.undelivered.len()
    }

    /// Moves a delivery onto the `unsettled` list after it has been pushed
    /// to the wire.
    pub fn push_unsettled(&mut self, key: DeliveryKey) {
        self.unsettled.push_back(key);
    }

    /// Removes a delivery from `unsettled` once both sides have reached a
    /// terminal, settled state (§4.3 "Disposition").
    pub fn remove_unsettled(&mut self, key: DeliveryKey) -> bool {
        if let Some(pos) = self.unsettled.iter().position(|k| *k == key) {
            self.unsettled.remove(pos);
            true
        } else {
            false
        }
    }

    /// Current ref-list membership bits.
    #[must_use]
    pub fn ref_bits(&self) -> LinkRefBits {
        self.ref_bits
    }

    /// Mutable access to ref-list membership bits.
    pub fn ref_bits_mut(&mut self) -> &mut LinkRefBits {
        &mut self.ref_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_link() -> Link {
        Link::new(ConnectionId::generate(), LinkDirection::Outgoing, LinkType::Normal, 100)
    }

    #[test]
    fn attach_lifecycle_advances_in_order() {
        let mut link = test_link();
        assert_eq!(link.state(), LinkState::Init);
        link.first_attach();
        assert_eq!(link.state(), LinkState::Attaching);
        link.second_attach();
        assert_eq!(link.state(), LinkState::Attached);
    }

    #[test]
    fn two_sided_detach_counts_to_two() {
        let mut link = test_link();
        link.detach(true);
        assert_eq!(link.state(), LinkState::Detaching);
        assert_eq!(link.detach_count(), 1);
        link.detach(false);
        assert_eq!(link.state(), LinkState::Detached);
        assert_eq!(link.detach_count(), 2);
    }

    #[test]
    fn lost_detach_short_circuits_to_two() {
        let mut link = test_link();
        link.detach_lost();
        assert_eq!(link.detach_count(), 2);
        assert_eq!(link.state(), LinkState::Detached);
    }

    #[test]
    fn ref_bits_track_membership() {
        let mut link = test_link();
        link.ref_bits_mut().insert(LinkRefBits::ADDRESS);
        link.ref_bits_mut().insert(LinkRefBits::DELIVERY);
        assert!(link.ref_bits().contains(LinkRefBits::ADDRESS));
        assert!(link.ref_bits().contains(LinkRefBits::DELIVERY));
        assert!(!link.ref_bits().contains(LinkRefBits::FLOW));
        link.ref_bits_mut().remove(LinkRefBits::ADDRESS);
        assert!(!link.ref_bits().contains(LinkRefBits::ADDRESS));
    }

    #[test]
    fn undelivered_is_fifo() {
        let mut link = test_link();
        let mut arena = crate::delivery::DeliveryArena::new();
        let first = arena.insert(sample());
        let second = arena.insert(sample());
        link.push_undelivered(first);
        link.push_undelivered(second);

        assert_eq!(link.undelivered_depth(), 2);
        assert_eq!(link.pop_undelivered(), Some(first));
        assert_eq!(link.pop_undelivered(), Some(second));
        assert_eq!(link.pop_undelivered(), None);
    }

    #[test]
    fn credit_consumption_saturates_at_zero() {
        let mut link = test_link();
        link.apply_flow(CreditCount::new(1), false);
        assert!(link.has_credit());
        link.consume_credit();
        assert!(!link.has_credit());
        link.consume_credit();
        assert!(!link.has_credit());
    }

    fn sample() -> crate::delivery::Delivery {
        crate::delivery::Delivery {
            owning_link: LinkId::generate(),
            peer: None,
            message: std::sync::Arc::new(crate::message::Message::new()),
            tag: crate::domain_types::DeliveryTag::new(0),
            disposition: crate::delivery::Disposition::Received,
            settled: false,
            origin: None,
        }
    }
}
