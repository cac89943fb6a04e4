//! Route-table control plane: router-node bookkeeping and link-loss
//! re-validation (§4.6, §3 "Router node").

use std::collections::HashMap;

use crate::address::Address;
use crate::bitmask::RouterBitMask;
use crate::domain_types::{AddressKey, MaskBit};
use crate::link::LinkId;

/// A peer router's entry in the route table (§3 "Router node").
#[derive(Debug, Clone)]
pub struct RouterNode {
    mask_bit: MaskBit,
    /// `None` for a direct neighbor; `Some(bit)` for a node reached via
    /// transit through another router.
    next_hop: Option<MaskBit>,
    /// Set only for direct neighbors (§3 invariant: "a neighbor has both
    /// peer links set").
    control_link: Option<LinkId>,
    /// Set only for direct neighbors.
    data_link: Option<LinkId>,
    valid_origins: RouterBitMask,
    reachable: bool,
}

impl RouterNode {
    /// Creates a transit node reached via `next_hop`.
    #[must_use]
    pub fn transit(mask_bit: MaskBit, next_hop: MaskBit) -> Self {
        Self {
            mask_bit,
            next_hop: Some(next_hop),
            control_link: None,
            data_link: None,
            valid_origins: RouterBitMask::empty(),
            reachable: true,
        }
    }

    /// Creates a direct neighbor node with both peer links established.
    #[must_use]
    pub fn neighbor(mask_bit: MaskBit, control_link: LinkId, data_link: LinkId) -> Self {
        Self {
            mask_bit,
            next_hop: None,
            control_link: Some(control_link),
            data_link: Some(data_link),
            valid_origins: RouterBitMask::empty(),
            reachable: true,
        }
    }

    /// The node's mask bit.
    #[must_use]
    pub fn mask_bit(&self) -> MaskBit {
        self.mask_bit
    }

    /// Whether this node is a direct neighbor (both peer links present),
    /// per §3's "Router node" invariant.
    #[must_use]
    pub fn is_neighbor(&self) -> bool {
        self.next_hop.is_none() && self.control_link.is_some() && self.data_link.is_some()
    }

    /// The next-hop mask bit for a transit node, `None` for a neighbor.
    #[must_use]
    pub fn next_hop(&self) -> Option<MaskBit> {
        self.next_hop
    }

    /// The `valid_origins` bitmask used by `MULTICAST_ONCE` loop
    /// suppression (§4.2).
    #[must_use]
    pub fn valid_origins(&self) -> RouterBitMask {
        self.valid_origins
    }

    /// Replaces `valid_origins`, e.g. on a topology recomputation (§4.6).
    pub fn set_valid_origins(&mut self, mask: RouterBitMask) {
        self.valid_origins = mask;
    }

    /// Whether this node is currently considered reachable.
    #[must_use]
    pub fn reachable(&self) -> bool {
        self.reachable
    }

    fn mark_unreachable(&mut self) {
        self.reachable = false;
        self.control_link = None;
        self.data_link = None;
    }
}

/// Handles loss of a neighbor's control or data link (§4.6,
/// `router_node.c`'s `qd_router_del_link_ref` sweep, SPEC_FULL.md §2):
/// marks the neighbor and every node whose `next_hop` routed through it as
/// unreachable, and clears their mask bits from every address's `rnodes`.
pub fn router_link_lost(
    router_nodes: &mut HashMap<MaskBit, RouterNode>,
    addresses: &mut HashMap<AddressKey, Address>,
    neighbor_bit: MaskBit,
) {
    let mut affected = vec![neighbor_bit];
    if let Some(node) = router_nodes.get_mut(&neighbor_bit) {
        node.mark_unreachable();
    }
    for (bit, node) in router_nodes.iter_mut() {
        if node.next_hop == Some(neighbor_bit) {
            node.mark_unreachable();
            affected.push(*bit);
        }
    }

    for address in addresses.values_mut() {
        let rnodes = address.rnodes_mut();
        for bit in &affected {
            rnodes.clear(*bit);
        }
    }
}
