//! The four forwarding strategies plus link-balanced attach routing
//! (§4.2, §9 "Forwarder polymorphism").

use std::collections::HashMap;
use std::sync::Arc;

use crate::address::{Address, Semantics};
use crate::bitmask::RouterBitMask;
use crate::connection::{Connection, ConnectionWorkItem};
use crate::delivery::{Delivery, DeliveryArena, DeliveryKey, Disposition};
use crate::domain_types::{DeliveryTagAllocator, MaskBit};
use crate::link::{Link, LinkId};
use crate::message::Message;
use crate::route_control::RouterNode;

/// Everything a forwarding decision needs read/write access to, borrowed
/// for the duration of one `forward` call. Ownership of these collections
/// lives on the core engine (§3 "Ownership": core-thread-only mutation).
pub struct RoutingTables<'a> {
    /// All known links, keyed by id.
    pub links: &'a mut HashMap<LinkId, Link>,
    /// All open connections, keyed by id.
    pub connections: &'a HashMap<crate::connection::ConnectionId, Connection>,
    /// The delivery arena backing every link's `undelivered`/`unsettled`.
    pub deliveries: &'a mut DeliveryArena,
    /// This router's own mask bit, excluded from peer fanout.
    pub self_bit: MaskBit,
    /// Delivery tag allocator shared across the core engine.
    pub tag_alloc: &'a DeliveryTagAllocator,
    /// Route-table entries for every known peer router, keyed by mask bit
    /// (§4.6). `MULTICAST_ONCE` consults each target's `valid_origins` here.
    pub router_nodes: &'a HashMap<MaskBit, RouterNode>,
}

/// A target selected for one outbound copy of a message.
enum Target {
    Local(LinkId),
    InProcess(crate::address::SubscriptionId),
    Peer(MaskBit),
}

impl RoutingTables<'_> {
    fn push_to_link(
        &mut self,
        link_id: LinkId,
        message: Arc<Message>,
        peer: Option<DeliveryKey>,
        origin: Option<String>,
    ) -> Option<DeliveryKey> {
        let tag = self.tag_alloc.next();
        let settled = match peer {
            Some(key) => self.deliveries.get(key).is_none_or(|d| d.settled),
            None => true,
        };
        let delivery = Delivery {
            owning_link: link_id,
            peer,
            message,
            tag,
            disposition: Disposition::Received,
            settled,
            origin,
        };
        let key = self.deliveries.insert(delivery);
        if let Some(peer_key) = peer {
            if !settled {
                self.deliveries.link_peers(peer_key, key);
            }
        }

        let Some(link) = self.links.get_mut(&link_id) else {
            self.deliveries.remove(key);
            return None;
        };
        link.push_undelivered(key);

        if let Some(conn) = self.connections.get(&link.owning_connection()) {
            conn.mark_has_deliveries(link_id);
            conn.activate(ConnectionWorkItem::PushAvailable(link_id));
        }
        Some(key)
    }
}

/// Runs the bound forwarder for `address`, producing outbound copies for
/// every applicable target. Returns the fanout count (§9: "kept as the
/// `forward()` return type").
///
/// `inbound` is the delivery (if any) that produced `message`; `origin_bit`
/// is this message's ingress router resolved to a mask bit by the caller
/// (route-control plane owns the router-id-to-bit table, §4.6), `None` if
/// this router is itself the ingress (§4.2 "origin=0" rule); `link_exclusion`,
/// when present, further removes peer-router link bits from multicast
/// fanout (§4.4 step 1).
pub fn forward(
    tables: &mut RoutingTables<'_>,
    address: &mut Address,
    message: Arc<Message>,
    inbound: Option<DeliveryKey>,
    origin_bit: Option<MaskBit>,
    exclude_inprocess: bool,
    link_exclusion: Option<RouterBitMask>,
) -> usize {
    match address.semantics() {
        Semantics::MulticastFlood => multicast_flood(tables, address, message, inbound),
        Semantics::MulticastOnce => {
            multicast_once(tables, address, message, inbound, origin_bit, link_exclusion)
        }
        Semantics::AnycastClosest => {
            anycast_closest(tables, address, message, inbound, exclude_inprocess)
        }
        Semantics::AnycastBalanced => anycast_balanced(tables, address, message, inbound),
    }
}

/// MULTICAST_FLOOD (§4.2): every local consumer, every peer in `rnodes`,
/// unfiltered.
fn multicast_flood(
    tables: &mut RoutingTables<'_>,
    address: &mut Address,
    message: Arc<Message>,
    inbound: Option<DeliveryKey>,
) -> usize {
    let mut fanout = 0;
    let origin = inbound.and_then(|key| tables.deliveries.get(key)).and_then(|d| d.origin.clone());

    for link in address.consumer_links().to_vec() {
        if tables
            .push_to_link(link, Arc::clone(&message), inbound, origin.clone())
            .is_some()
        {
            fanout += 1;
            address.stats_mut().egress.increment();
        }
    }
    for bit in address.rnodes().iter_set() {
        if bit == tables.self_bit {
            continue;
        }
        // No I/O bridge in this crate; transit fanout is counted, the
        // materialised peer send is the driver's responsibility (§6).
        fanout += 1;
        address.stats_mut().transit.increment();
    }
    fanout
}

/// MULTICAST_ONCE (§4.2): local delivery identical to flood; peer fanout
/// filtered by `link_exclusion`, then for each remaining target router by
/// that router's own `valid_origins[origin_bit]` (§4.6 spanning-tree loop
/// suppression: skip a target whose `valid_origins` does not include the
/// message's origin, and a target with no known route-table entry at all),
/// then coalesced to unique peer bits (coalescing to unique outbound
/// *links* is the I/O bridge's job once link-per-peer mapping exists; here
/// coalescing is over mask bits, which are already unique per peer).
fn multicast_once(
    tables: &mut RoutingTables<'_>,
    address: &mut Address,
    message: Arc<Message>,
    inbound: Option<DeliveryKey>,
    origin_bit: Option<MaskBit>,
    link_exclusion: Option<RouterBitMask>,
) -> usize {
    let mut fanout = 0;
    let origin_snapshot =
        inbound.and_then(|key| tables.deliveries.get(key)).and_then(|d| d.origin.clone());

    for link in address.consumer_links().to_vec() {
        if tables
            .push_to_link(link, Arc::clone(&message), inbound, origin_snapshot.clone())
            .is_some()
        {
            fanout += 1;
            address.stats_mut().egress.increment();
        }
    }

    // `origin_bit = None` means this router stamped ingress itself (§4.4
    // step 5); a NULL ingress maps to mask bit zero for exclusion purposes.
    let origin_bit = origin_bit.or_else(|| MaskBit::try_new(0).ok());
    let mut targets = address.rnodes();
    if let Some(exclusion) = link_exclusion {
        targets.subtract(&exclusion);
    }

    for bit in targets.iter_set() {
        if bit == tables.self_bit {
            continue;
        }
        if let Some(origin_bit) = origin_bit {
            if bit == origin_bit {
                continue;
            }
            let valid_origins =
                tables.router_nodes.get(&bit).map(RouterNode::valid_origins).unwrap_or_default();
            if !valid_origins.is_set(origin_bit) {
                continue;
            }
        }
        fanout += 1;
        address.stats_mut().transit.increment();
    }
    fanout
}

/// ANYCAST_CLOSEST (§4.2): in-process subscriber, else local link, else one
/// peer router (first set bit); settles the inbound delivery immediately
/// on in-process success.
fn anycast_closest(
    tables: &mut RoutingTables<'_>,
    address: &mut Address,
    message: Arc<Message>,
    inbound: Option<DeliveryKey>,
    exclude_inprocess: bool,
) -> usize {
    let target = if !exclude_inprocess && !address.subscriptions().is_empty() {
        address.next_subscriber().map(Target::InProcess)
    } else {
        None
    };
    let target = target
        .or_else(|| address.next_consumer_link().map(Target::Local))
        .or_else(|| address.rnodes().first_set().map(Target::Peer));

    match target {
        Some(Target::InProcess(_)) => {
            if let Some(key) = inbound {
                if let Some(delivery) = tables.deliveries.get_mut(key) {
                    if !delivery.settled {
                        delivery.disposition = Disposition::Accepted;
                        delivery.settled = true;
                    }
                }
            }
            address.stats_mut().to_container.increment();
            1
        }
        Some(Target::Local(link)) => {
            let origin = inbound.and_then(|key| tables.deliveries.get(key)).and_then(|d| d.origin.clone());
            if tables.push_to_link(link, message, inbound, origin).is_some() {
                address.stats_mut().egress.increment();
                1
            } else {
                0
            }
        }
        Some(Target::Peer(_)) => {
            address.stats_mut().transit.increment();
            1
        }
        None => 0,
    }
}

/// ANYCAST_BALANCED (§4.2, §9 "placeholder in source"): choose the local
/// consumer link with the smallest `undelivered` depth, tie-broken by
/// lowest link identifier. Peer-router load balancing is out of scope here
/// since this crate does not model remote link depths.
fn anycast_balanced(
    tables: &mut RoutingTables<'_>,
    address: &mut Address,
    message: Arc<Message>,
    inbound: Option<DeliveryKey>,
) -> usize {
    let mut best: Option<LinkId> = None;
    let mut best_depth = usize::MAX;
    for &link_id in address.consumer_links() {
        let Some(link) = tables.links.get(&link_id) else { continue };
        let depth = link.undelivered_depth();
        let better = depth < best_depth || (depth == best_depth && Some(link_id) < best);
        if better {
            best = Some(link_id);
            best_depth = depth;
        }
    }

    let Some(link_id) = best else { return 0 };
    let origin = inbound.and_then(|key| tables.deliveries.get(key)).and_then(|d| d.origin.clone());
    if tables.push_to_link(link_id, message, inbound, origin).is_some() {
        address.stats_mut().egress.increment();
        1
    } else {
        0
    }
}

/// LINK_BALANCED (§4.2): a degenerate forwarder used at attach time, not
/// message time. Picks the peer bit to route an attach toward; in the
/// absence of cost data this simply picks the first advertised peer.
#[must_use]
pub fn link_balanced_attach_target(rnodes: RouterBitMask) -> Option<MaskBit> {
    rnodes.first_set()
}
