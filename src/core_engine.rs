//! The single core thread: action queue, general-work queue, and table
//! mutation (§4.1, §5).
//!
//! All mutation of the address table, link table, connection table, and
//! delivery arena happens inside [`RouterCore::apply`], called only from
//! the loop driven by [`RouterCore::run`]. External threads never touch
//! these collections directly; they submit [`Action`]s instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::address::{Address, Semantics};
use crate::bitmask::RouterBitMask;
use crate::connection::{Connection, ConnectionId};
use crate::delivery::{Delivery, DeliveryArena, DeliveryKey, Disposition};
use crate::domain_types::{AddressKey, CreditCount, DeliveryTagAllocator, MaskBit};
use crate::forwarder::{self, RoutingTables};
use crate::link::{Link, LinkDirection, LinkId, LinkType};
use crate::message::Message;
use crate::route_control::{self, RouterNode};

/// A general-work callback posted by the core thread for execution on an
/// I/O thread (§4.1 "General work"). Boxed rather than generic so the
/// queue can hold heterogeneous callbacks.
pub type GeneralWorkItem = Box<dyn FnOnce() + Send>;

/// Driver→core actions (§6 "Driver→core actions").
pub enum Action {
    /// A new connection has been accepted or dialed.
    ConnectionOpened {
        /// The connection record, already constructed by the caller.
        connection: Connection,
    },
    /// A connection has closed; all its links are torn down.
    ConnectionClosed {
        /// The closing connection.
        connection: ConnectionId,
    },
    /// First attach on a link (either side).
    LinkFirstAttach {
        /// The owning connection.
        connection: ConnectionId,
        /// Direction of the new link.
        direction: LinkDirection,
        /// Link class.
        link_type: LinkType,
        /// Configured capacity.
        capacity: usize,
        /// Address to bind as a local consumer (receiver links) or
        /// producer (sender links), if known at attach time.
        address: Option<AddressKey>,
    },
    /// Matching second attach for a previously first-attached link.
    LinkSecondAttach {
        /// The link being completed.
        link: LinkId,
    },
    /// Link detach, either side-initiated or a connection-loss cascade.
    LinkDetach {
        /// The link being torn down.
        link: LinkId,
        /// Whether this is a `LOST` detach (§4.3 "Detach").
        lost: bool,
    },
    /// A credit grant (`link_flow`, §4.3 "Credit").
    LinkFlow {
        /// The link receiving credit.
        link: LinkId,
        /// Granted credit count.
        credit: CreditCount,
        /// Whether a drain was requested.
        drain: bool,
    },
    /// An inbound message delivered on `link`, to be resolved against the
    /// address table (§4.2 "Resolution").
    LinkDeliver {
        /// The inbound link.
        link: LinkId,
        /// The message, already annotation-rewritten by the caller.
        message: Arc<Message>,
        /// Resolved ingress mask bit, `None` if this router is the
        /// ingress (§4.2, §4.4 step 5).
        origin_bit: Option<MaskBit>,
        /// Link-exclusion mask computed from the pre-rewrite trace
        /// (§4.4 step 1).
        link_exclusion: Option<RouterBitMask>,
    },
    /// An in-process delivery addressed directly by address key, bypassing
    /// an inbound link (`link_deliver_to`, §6).
    LinkDeliverTo {
        /// The target address key.
        address: AddressKey,
        /// The message to deliver.
        message: Arc<Message>,
    },
    /// A disposition update on an existing delivery (§4.3 "Disposition").
    DeliveryUpdateDisposition {
        /// The delivery being updated.
        delivery: DeliveryKey,
        /// New disposition.
        disposition: Disposition,
        /// Whether the delivery is now settled.
        settled: bool,
    },
    /// A peer router now advertises `address` (§4.6).
    MobileAdded {
        /// The address now advertised.
        address: AddressKey,
        /// The advertising router's mask bit.
        bit: MaskBit,
    },
    /// A peer router withdrew its advertisement of `address` (§4.6).
    MobileRemoved {
        /// The address no longer advertised.
        address: AddressKey,
        /// The withdrawing router's mask bit.
        bit: MaskBit,
    },
    /// A neighbor's control or data link was lost; triggers a route sweep
    /// (§4.6, `router_node.c`'s `qd_router_del_link_ref`).
    NeighborLinkLost {
        /// The lost neighbor's mask bit.
        neighbor_bit: MaskBit,
    },
    /// Topology for a peer router was (re)computed; (re)inserts its
    /// `RouterNode` entry, setting `next_hop`, `valid_origins`, and, for a
    /// direct neighbor, its control/data link pointers atomically relative
    /// to forwarding (§4.6).
    NeighborTopologyUpdated {
        /// The peer router's mask bit.
        bit: MaskBit,
        /// `None` for a direct neighbor (see `neighbor_links`); `Some` for
        /// a node reached via transit through another router.
        next_hop: Option<MaskBit>,
        /// Control and data link ids for a direct neighbor; `None` for a
        /// transit node.
        neighbor_links: Option<(LinkId, LinkId)>,
        /// The spanning-tree loop-suppression bitmask consulted by
        /// `MULTICAST_ONCE` (§4.2).
        valid_origins: RouterBitMask,
    },
}

/// The single-threaded decision engine (§1 "The core").
pub struct RouterCore {
    addresses: HashMap<AddressKey, Address>,
    links: HashMap<LinkId, Link>,
    connections: HashMap<ConnectionId, Connection>,
    deliveries: DeliveryArena,
    router_nodes: HashMap<MaskBit, RouterNode>,
    tag_alloc: DeliveryTagAllocator,
    self_bit: MaskBit,
    general_work_tx: mpsc::UnboundedSender<GeneralWorkItem>,
    running: Arc<AtomicBool>,
}

impl RouterCore {
    /// Creates a new core engine bound to `self_bit` in the mesh-wide
    /// bitmask, returning the engine and the receiving end of its
    /// general-work queue for an I/O thread to drain.
    #[must_use]
    pub fn new(self_bit: MaskBit) -> (Self, mpsc::UnboundedReceiver<GeneralWorkItem>) {
        let (general_work_tx, general_work_rx) = mpsc::unbounded_channel();
        let core = Self {
            addresses: HashMap::new(),
            links: HashMap::new(),
            connections: HashMap::new(),
            deliveries: DeliveryArena::new(),
            router_nodes: HashMap::new(),
            tag_alloc: DeliveryTagAllocator::default(),
            self_bit,
            general_work_tx,
            running: Arc::new(AtomicBool::new(true)),
        };
        (core, general_work_rx)
    }

    /// A shared shutdown flag the owning runtime can flip to request a
    /// graceful stop (§5 "Cancellation").
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Looks up an address by key without creating it.
    #[must_use]
    pub fn address(&self, key: &AddressKey) -> Option<&Address> {
        self.addresses.get(key)
    }

    /// Drives the core loop: receives actions and applies them in
    /// submission order until the channel closes (§4.1 "Algorithm").
    ///
    /// Unlike the original's condition-variable splice-and-batch, `tokio`'s
    /// MPSC channel already serializes delivery in submission order per
    /// sender, so each `recv` is one "acquire lock, pop one action" step;
    /// the effect (FIFO per submitter, arbitrary interleaving across
    /// submitters) is identical.
    #[instrument(skip_all, fields(self_bit = self.self_bit.into_inner()))]
    pub async fn run(&mut self, mut actions: mpsc::UnboundedReceiver<Action>) {
        while let Some(action) = actions.recv().await {
            let discard = !self.running.load(Ordering::Acquire);
            self.apply(action, discard);
        }
        info!("action channel closed, core loop exiting");
    }

    /// Applies one action. `discard` is true iff the core is shutting down
    /// (§4.1 "Failure": "the handler must still free action-owned
    /// resources when `discard`").
    fn apply(&mut self, action: Action, discard: bool) {
        match action {
            Action::ConnectionOpened { connection } => {
                debug!(connection = %connection.id(), "connection opened");
                self.connections.insert(connection.id(), connection);
            }
            Action::ConnectionClosed { connection } => self.close_connection(connection, discard),
            Action::LinkFirstAttach { connection, direction, link_type, capacity, address } => {
                self.first_attach(connection, direction, link_type, capacity, address);
            }
            Action::LinkSecondAttach { link } => {
                if let Some(l) = self.links.get_mut(&link) {
                    l.second_attach();
                }
            }
            Action::LinkDetach { link, lost } => self.detach_link(link, lost),
            Action::LinkFlow { link, credit, drain } => {
                if let Some(l) = self.links.get_mut(&link) {
                    l.apply_flow(credit, drain);
                }
            }
            Action::LinkDeliver { link, message, origin_bit, link_exclusion } => {
                self.deliver_on_link(link, message, origin_bit, link_exclusion, discard);
            }
            Action::LinkDeliverTo { address, message } => {
                self.deliver_to_address(&address, message, None, discard);
            }
            Action::DeliveryUpdateDisposition { delivery, disposition, settled } => {
                self.update_disposition(delivery, disposition, settled);
            }
            Action::MobileAdded { address, bit } => self.mobile_added(&address, bit),
            Action::MobileRemoved { address, bit } => self.mobile_removed(&address, bit),
            Action::NeighborLinkLost { neighbor_bit } => {
                route_control::router_link_lost(&mut self.router_nodes, &mut self.addresses, neighbor_bit);
            }
            Action::NeighborTopologyUpdated { bit, next_hop, neighbor_links, valid_origins } => {
                self.update_router_node(bit, next_hop, neighbor_links, valid_origins);
            }
        }
    }

    /// Inserts or replaces the `RouterNode` entry for `bit` (§4.6). A
    /// direct neighbor is distinguished by `neighbor_links` being present;
    /// otherwise `next_hop` must name the transit route.
    fn update_router_node(
        &mut self,
        bit: MaskBit,
        next_hop: Option<MaskBit>,
        neighbor_links: Option<(LinkId, LinkId)>,
        valid_origins: RouterBitMask,
    ) {
        let mut node = match (neighbor_links, next_hop) {
            (Some((control_link, data_link)), _) => {
                RouterNode::neighbor(bit, control_link, data_link)
            }
            (None, Some(hop)) => RouterNode::transit(bit, hop),
            (None, None) => {
                warn!(%bit, "topology update with neither neighbor links nor next_hop, ignoring");
                return;
            }
        };
        node.set_valid_origins(valid_origins);
        self.router_nodes.insert(bit, node);
    }

    fn first_attach(
        &mut self,
        connection: ConnectionId,
        direction: LinkDirection,
        link_type: LinkType,
        capacity: usize,
        address: Option<AddressKey>,
    ) {
        let Some(conn) = self.connections.get(&connection) else {
            warn!(%connection, "first_attach on unknown connection");
            return;
        };
        let mut link = Link::new(connection, direction, link_type, capacity);
        link.first_attach();
        let link_id = link.id();
        self.links.insert(link_id, link);
        conn.add_link(link_id);
        conn.activate(crate::connection::ConnectionWorkItem::FirstAttach(link_id));

        if let Some(key) = address {
            let addr = self
                .addresses
                .entry(key)
                .or_insert_with_key(|k| Address::new(k.clone(), Semantics::AnycastClosest));
            match direction {
                LinkDirection::Incoming => addr.add_producer_link(link_id),
                LinkDirection::Outgoing => addr.add_consumer_link(link_id),
            }
        }
    }

    fn detach_link(&mut self, link_id: LinkId, lost: bool) {
        let is_detached = {
            let Some(link) = self.links.get_mut(&link_id) else { return };
            if lost {
                link.detach_lost();
            } else {
                let first = link.state() != crate::link::LinkState::Detaching;
                link.detach(first);
            }
            link.state() == crate::link::LinkState::Detached
        };
        if !is_detached {
            return;
        }
        let owning = self.links[&link_id].owning_connection();
        for addr in self.addresses.values_mut() {
            addr.remove_consumer_link(link_id);
            addr.remove_producer_link(link_id);
        }
        if let Some(conn) = self.connections.get(&owning) {
            conn.remove_link(link_id);
        }
        self.links.remove(&link_id);
    }

    fn close_connection(&mut self, connection: ConnectionId, discard: bool) {
        let Some(conn) = self.connections.remove(&connection) else { return };
        let link_ids: Vec<LinkId> =
            self.links.iter().filter(|(_, l)| l.owning_connection() == connection).map(|(id, _)| *id).collect();
        for link_id in link_ids {
            self.detach_link(link_id, true);
        }
        if discard {
            debug!(%connection, "connection closed during shutdown, resources freed");
        }
        drop(conn);
    }

    /// Resolves an inbound delivery's address and hands it to the bound
    /// forwarder (§4.2).
    fn deliver_on_link(
        &mut self,
        link_id: LinkId,
        message: Arc<Message>,
        origin_bit: Option<MaskBit>,
        link_exclusion: Option<RouterBitMask>,
        discard: bool,
    ) {
        let Some(key) = message.address_key(None) else {
            warn!("message has no resolvable destination, releasing");
            return;
        };
        let inbound = self.register_inbound(link_id, Arc::clone(&message));
        self.forward_with_tables(&key, message, inbound, origin_bit, link_exclusion, false, discard);
    }

    fn deliver_to_address(
        &mut self,
        key: &AddressKey,
        message: Arc<Message>,
        inbound: Option<DeliveryKey>,
        discard: bool,
    ) {
        self.forward_with_tables(key, message, inbound, None, None, true, discard);
    }

    fn register_inbound(&mut self, link_id: LinkId, message: Arc<Message>) -> Option<DeliveryKey> {
        let tag = self.tag_alloc.next();
        let origin = message.annotations().ingress.clone();
        let delivery = Delivery {
            owning_link: link_id,
            peer: None,
            message,
            tag,
            disposition: Disposition::Received,
            settled: false,
            origin,
        };
        Some(self.deliveries.insert(delivery))
    }

    #[allow(clippy::too_many_arguments)]
    fn forward_with_tables(
        &mut self,
        key: &AddressKey,
        message: Arc<Message>,
        inbound: Option<DeliveryKey>,
        origin_bit: Option<MaskBit>,
        link_exclusion: Option<RouterBitMask>,
        exclude_inprocess: bool,
        discard: bool,
    ) {
        if discard {
            return;
        }
        let Some(address) = self.addresses.get_mut(key) else {
            if let Some(inbound_key) = inbound {
                if let Some(delivery) = self.deliveries.get_mut(inbound_key) {
                    delivery.disposition = Disposition::Released;
                    delivery.settled = true;
                }
            }
            warn!(%key, "no address binding, message released as unroutable");
            return;
        };
        let mut tables = RoutingTables {
            links: &mut self.links,
            connections: &self.connections,
            deliveries: &mut self.deliveries,
            self_bit: self.self_bit,
            tag_alloc: &self.tag_alloc,
            router_nodes: &self.router_nodes,
        };
        let fanout = forwarder::forward(
            &mut tables,
            address,
            message,
            inbound,
            origin_bit,
            exclude_inprocess,
            link_exclusion,
        );
        debug!(%key, fanout, "forwarded");
    }

    fn update_disposition(&mut self, key: DeliveryKey, disposition: Disposition, settled: bool) {
        let peer = {
            let Some(delivery) = self.deliveries.get_mut(key) else { return };
            delivery.disposition = disposition;
            delivery.settled = settled;
            delivery.peer
        };
        if let Some(peer_key) = peer {
            if let Some(peer_delivery) = self.deliveries.get_mut(peer_key) {
                peer_delivery.disposition = disposition;
                if settled {
                    peer_delivery.settled = true;
                }
            }
        }
        if settled {
            self.release_if_both_sides_settled(key);
            if let Some(peer_key) = peer {
                self.release_if_both_sides_settled(peer_key);
            }
        }
    }

    fn release_if_both_sides_settled(&mut self, key: DeliveryKey) {
        let Some(delivery) = self.deliveries.get(key) else { return };
        if !delivery.is_consistent() {
            return;
        }
        let settled = delivery.settled;
        let owning_link = delivery.owning_link;
        if settled {
            if let Some(link) = self.links.get_mut(&owning_link) {
                link.remove_unsettled(key);
            }
            self.deliveries.remove(key);
        }
    }

    /// §4.6: sets the advertising router's bit in `address.rnodes`.
    fn mobile_added(&mut self, key: &AddressKey, bit: MaskBit) {
        let addr = self
            .addresses
            .entry(key.clone())
            .or_insert_with_key(|k| Address::new(k.clone(), Semantics::MulticastOnce));
        addr.rnodes_mut().set(bit);
        info!(%key, bit = %bit, "mobile address advertised");
    }

    /// §4.6, §8 invariant 5: clears the bit; per the address GC invariant,
    /// does not itself reclaim the address record.
    fn mobile_removed(&mut self, key: &AddressKey, bit: MaskBit) {
        if let Some(addr) = self.addresses.get_mut(key) {
            addr.rnodes_mut().clear(bit);
            info!(%key, bit = %bit, "mobile address withdrawn");
        }
    }

    /// Posts a callback for execution outside the core thread (§4.1
    /// "General work"). Returns `false` if the receiving end has been
    /// dropped.
    pub fn post_general_work(&self, item: GeneralWorkItem) -> bool {
        self.general_work_tx.send(item).is_ok()
    }

    /// Sweeps addresses with no locals, no subscriptions, and an empty
    /// `rnodes` mask, per the GC-eligibility invariant (§3 "Address").
    /// Returns the number of addresses reclaimed.
    pub fn collect_garbage(&mut self) -> usize {
        let before = self.addresses.len();
        self.addresses.retain(|_, addr| !addr.gc_eligible());
        before - self.addresses.len()
    }
}

/// Drains the general-work queue strictly FIFO, one item at a time, per
/// §4.1: "general work is processed strictly in FIFO order, one item at a
/// time." Intended to be called from an I/O thread's zero-delay timer.
pub async fn drain_general_work(rx: &mut mpsc::UnboundedReceiver<GeneralWorkItem>) {
    while let Ok(item) = rx.try_recv() {
        item();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRole;

    fn bit(n: u8) -> MaskBit {
        MaskBit::try_new(n).unwrap()
    }

    #[tokio::test]
    async fn mobile_added_then_removed_clears_the_bit() {
        // §8 invariant 5
        let (mut core, _general_rx) = RouterCore::new(bit(0));
        let key = AddressKey::try_new("addr").unwrap();
        core.mobile_added(&key, bit(7));
        assert!(core.address(&key).unwrap().rnodes().is_set(bit(7)));
        core.mobile_removed(&key, bit(7));
        assert!(!core.address(&key).unwrap().rnodes().is_set(bit(7)));
    }

    #[test_log::test(tokio::test)]
    async fn unroutable_message_is_released_and_settled() {
        let (mut core, _general_rx) = RouterCore::new(bit(0));
        let connection = Connection::new(ConnectionRole::Normal, true, 250);
        let connection_id = connection.id();
        core.apply(Action::ConnectionOpened { connection }, false);
        core.apply(
            Action::LinkFirstAttach {
                connection: connection_id,
                direction: LinkDirection::Incoming,
                link_type: LinkType::Normal,
                capacity: 250,
                address: None,
            },
            false,
        );
        let link_id = *core.links.keys().next().unwrap();

        let mut message = Message::new();
        message.set_to_field(crate::domain_types::RawAddress::try_new("nobody-home").unwrap());
        let message = Arc::new(message);
        core.deliver_on_link(link_id, message, None, None, false);

        assert!(core.address(&AddressKey::try_new("nobody-home").unwrap()).is_none());
    }

    #[tokio::test]
    async fn neighbor_topology_update_populates_a_router_node_with_valid_origins() {
        // §4.6: a `NeighborTopologyUpdated` action is the only way to
        // populate `router_nodes` (besides the link-loss sweep removing
        // entries), and it must set `valid_origins` atomically with the
        // insert.
        let (mut core, _general_rx) = RouterCore::new(bit(0));
        let mut origins = RouterBitMask::empty();
        origins.set(bit(2));
        core.apply(
            Action::NeighborTopologyUpdated {
                bit: bit(4),
                next_hop: Some(bit(4)),
                neighbor_links: None,
                valid_origins: origins,
            },
            false,
        );
        let node = core.router_nodes.get(&bit(4)).unwrap();
        assert!(node.valid_origins().is_set(bit(2)));
        assert!(!node.is_neighbor());
    }

    #[tokio::test]
    async fn multicast_once_forwards_to_a_peer_whose_valid_origins_includes_the_message_origin() {
        // §4.2/§4.6 end-to-end: MobileAdded advertises a MulticastOnce
        // address at R4; NeighborTopologyUpdated gives R4 a valid_origins
        // mask that includes the inbound message's origin bit; delivery
        // should count transit fanout toward R4.
        let (mut core, _general_rx) = RouterCore::new(bit(1));
        let key = AddressKey::try_new("mcast-included").unwrap();
        let r4 = bit(4);
        let origin = bit(2);
        core.apply(Action::MobileAdded { address: key.clone(), bit: r4 }, false);

        let mut origins = RouterBitMask::empty();
        origins.set(origin);
        core.apply(
            Action::NeighborTopologyUpdated {
                bit: r4,
                next_hop: Some(r4),
                neighbor_links: None,
                valid_origins: origins,
            },
            false,
        );

        let connection = Connection::new(ConnectionRole::Normal, true, 250);
        let connection_id = connection.id();
        core.apply(Action::ConnectionOpened { connection }, false);
        core.apply(
            Action::LinkFirstAttach {
                connection: connection_id,
                direction: LinkDirection::Incoming,
                link_type: LinkType::Normal,
                capacity: 250,
                address: None,
            },
            false,
        );
        let link_id = *core.links.keys().next().unwrap();

        let mut message = Message::new();
        message.set_to_field(crate::domain_types::RawAddress::try_new("mcast-included").unwrap());
        let message = Arc::new(message);
        core.apply(
            Action::LinkDeliver { link: link_id, message, origin_bit: Some(origin), link_exclusion: None },
            false,
        );

        assert_eq!(core.address(&key).unwrap().stats().transit.into_inner(), 1);
    }

    #[tokio::test]
    async fn multicast_once_skips_a_peer_whose_valid_origins_excludes_the_message_origin() {
        let (mut core, _general_rx) = RouterCore::new(bit(1));
        let key = AddressKey::try_new("mcast-excluded").unwrap();
        let r4 = bit(4);
        let origin = bit(2);
        core.apply(Action::MobileAdded { address: key.clone(), bit: r4 }, false);

        // R4's valid_origins does not include `origin`.
        let mut origins = RouterBitMask::empty();
        origins.set(bit(9));
        core.apply(
            Action::NeighborTopologyUpdated {
                bit: r4,
                next_hop: Some(r4),
                neighbor_links: None,
                valid_origins: origins,
            },
            false,
        );

        let connection = Connection::new(ConnectionRole::Normal, true, 250);
        let connection_id = connection.id();
        core.apply(Action::ConnectionOpened { connection }, false);
        core.apply(
            Action::LinkFirstAttach {
                connection: connection_id,
                direction: LinkDirection::Incoming,
                link_type: LinkType::Normal,
                capacity: 250,
                address: None,
            },
            false,
        );
        let link_id = *core.links.keys().next().unwrap();

        let mut message = Message::new();
        message.set_to_field(crate::domain_types::RawAddress::try_new("mcast-excluded").unwrap());
        let message = Arc::new(message);
        core.apply(
            Action::LinkDeliver { link: link_id, message, origin_bit: Some(origin), link_exclusion: None },
            false,
        );

        assert_eq!(core.address(&key).unwrap().stats().transit.into_inner(), 0);
    }

    #[tokio::test]
    async fn garbage_collection_reclaims_empty_addresses() {
        let (mut core, _general_rx) = RouterCore::new(bit(0));
        let key = AddressKey::try_new("ephemeral").unwrap();
        core.mobile_added(&key, bit(3));
        core.mobile_removed(&key, bit(3));
        assert_eq!(core.collect_garbage(), 1);
        assert!(core.address(&key).is_none());
    }
}
