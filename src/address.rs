//! The address table (§3 "Address", §4.2 "Resolution").

use crate::bitmask::RouterBitMask;
use crate::connection::ConnectionId;
use crate::domain_types::{AddressKey, StatCounter};
use crate::link::LinkId;

/// The forwarding strategy bound to an address at creation time (§4.2,
/// §9 "Forwarder polymorphism").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantics {
    /// Deliver to every local consumer and every peer router, unfiltered.
    MulticastFlood,
    /// Deliver to every local consumer; filter peers by `valid_origins`.
    MulticastOnce,
    /// Deliver to exactly one destination, preferring in-process, then
    /// local, then a peer router.
    AnycastClosest,
    /// Deliver to exactly one destination, chosen by load.
    AnycastBalanced,
}

/// In-process subscription handle, opaque to the address table beyond
/// ordering for round-robin selection (§9 open question ii).
pub type SubscriptionId = u64;

/// Per-address traffic counters (§3 "Address" statistics).
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressStats {
    /// Deliveries sent out on a local consumer link.
    pub egress: StatCounter,
    /// Deliveries received on a local producer link.
    pub ingress: StatCounter,
    /// Deliveries forwarded to/from a peer router.
    pub transit: StatCounter,
    /// Deliveries handed to an in-process subscriber.
    pub to_container: StatCounter,
    /// Deliveries received from an in-process publisher.
    pub from_container: StatCounter,
}

/// A mobile destination address record (§3 "Address").
#[derive(Debug)]
pub struct Address {
    key: AddressKey,
    semantics: Semantics,
    local_consumer_links: Vec<LinkId>,
    local_producer_links: Vec<LinkId>,
    subscriptions: Vec<SubscriptionId>,
    rnodes: RouterBitMask,
    local: bool,
    block_deletion: bool,
    stats: AddressStats,
    /// Round-robin cursors for anycast-closest selection (§9 open question
    /// ii: index-based rotation rather than list-splicing).
    next_subscription: usize,
    next_consumer_link: usize,
}

impl Address {
    /// Creates a new, empty address record bound to `semantics`.
    #[must_use]
    pub fn new(key: AddressKey, semantics: Semantics) -> Self {
        Self {
            key,
            semantics,
            local_consumer_links: Vec::new(),
            local_producer_links: Vec::new(),
            subscriptions: Vec::new(),
            rnodes: RouterBitMask::empty(),
            local: false,
            block_deletion: false,
            stats: AddressStats::default(),
            next_subscription: 0,
            next_consumer_link: 0,
        }
    }

    /// The normalized lookup key.
    #[must_use]
    pub fn key(&self) -> &AddressKey {
        &self.key
    }

    /// The bound forwarding strategy.
    #[must_use]
    pub fn semantics(&self) -> Semantics {
        self.semantics
    }

    /// Whether at least one locally-attached producer or consumer exists
    /// for this address.
    #[must_use]
    pub fn local(&self) -> bool {
        self.local
    }

    /// Sets the `local` flag (derived, but left settable for the route
    /// control plane's bookkeeping).
    pub fn set_local(&mut self, local: bool) {
        self.local = local;
    }

    /// Whether garbage collection of this address is currently suppressed,
    /// e.g. because it is a configured (not purely mobile) address.
    #[must_use]
    pub fn block_deletion(&self) -> bool {
        self.block_deletion
    }

    /// Sets `block_deletion`.
    pub fn set_block_deletion(&mut self, block: bool) {
        self.block_deletion = block;
    }

    /// Registers a local consumer link.
    pub fn add_consumer_link(&mut self, link: LinkId) {
        self.local_consumer_links.push(link);
        self.local = true;
    }

    /// Removes a local consumer link, updating `local` if this was the last
    /// one and no producers remain either.
    pub fn remove_consumer_link(&mut self, link: LinkId) {
        self.local_consumer_links.retain(|l| *l != link);
        self.recompute_local();
    }

    /// Registers a local producer link.
    pub fn add_producer_link(&mut self, link: LinkId) {
        self.local_producer_links.push(link);
        self.local = true;
    }

    /// Removes a local producer link.
    pub fn remove_producer_link(&mut self, link: LinkId) {
        self.local_producer_links.retain(|l| *l != link);
        self.recompute_local();
    }

    fn recompute_local(&mut self) {
        self.local = !self.local_consumer_links.is_empty() || !self.local_producer_links.is_empty();
    }

    /// Read access to the local consumer link list.
    #[must_use]
    pub fn consumer_links(&self) -> &[LinkId] {
        &self.local_consumer_links
    }

    /// Adds an in-process subscriber.
    pub fn add_subscription(&mut self, sub: SubscriptionId) {
        self.subscriptions.push(sub);
    }

    /// Removes an in-process subscriber.
    pub fn remove_subscription(&mut self, sub: SubscriptionId) {
        self.subscriptions.retain(|s| *s != sub);
        if self.next_subscription >= self.subscriptions.len() {
            self.next_subscription = 0;
        }
    }

    /// Read access to the in-process subscription list.
    #[must_use]
    pub fn subscriptions(&self) -> &[SubscriptionId] {
        &self.subscriptions
    }

    /// Selects the next in-process subscriber in round-robin order,
    /// advancing the cursor (§4.2 "ANYCAST_CLOSEST", §9 open question ii).
    pub fn next_subscriber(&mut self) -> Option<SubscriptionId> {
        if self.subscriptions.is_empty() {
            return None;
        }
        let idx = self.next_subscription % self.subscriptions.len();
        self.next_subscription = (idx + 1) % self.subscriptions.len();
        Some(self.subscriptions[idx])
    }

    /// Selects the next local consumer link in round-robin order, advancing
    /// the cursor.
    pub fn next_consumer_link(&mut self) -> Option<LinkId> {
        if self.local_consumer_links.is_empty() {
            return None;
        }
        let idx = self.next_consumer_link % self.local_consumer_links.len();
        self.next_consumer_link = (idx + 1) % self.local_consumer_links.len();
        Some(self.local_consumer_links[idx])
    }

    /// The bitmask of peer routers currently advertising this address.
    #[must_use]
    pub fn rnodes(&self) -> RouterBitMask {
        self.rnodes
    }

    /// Mutable access to `rnodes`, used by the route-control plane's
    /// `mobile_added`/`mobile_removed` (§4.6).
    pub fn rnodes_mut(&mut self) -> &mut RouterBitMask {
        &mut self.rnodes
    }

    /// Per-address traffic statistics.
    #[must_use]
    pub fn stats(&self) -> &AddressStats {
        &self.stats
    }

    /// Mutable access to statistics, used by the forwarder after each copy.
    pub fn stats_mut(&mut self) -> &mut AddressStats {
        &mut self.stats
    }

    /// §3 "Address" invariant: eligible for garbage collection once it has
    /// no locals, no subscriptions, an empty `rnodes`, and is not pinned.
    #[must_use]
    pub fn gc_eligible(&self) -> bool {
        !self.block_deletion
            && self.local_consumer_links.is_empty()
            && self.local_producer_links.is_empty()
            && self.subscriptions.is_empty()
            && self.rnodes.is_empty()
    }
}

/// A local producer or consumer link's connection, kept alongside the
/// address table entries purely for statistics attribution; forwarding
/// itself addresses links directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalEndpoint {
    /// The link carrying traffic to/from this address.
    pub link: LinkId,
    /// The connection that owns `link`.
    pub connection: ConnectionId,
}
