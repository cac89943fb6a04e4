//! Observability: structured event types and span helpers for the router
//! domain (§1 ambient stack, §5 "Atomic counters").

use serde::{Deserialize, Serialize};

use crate::domain_types::{ConnectionId, LinkId, MaskBit};

/// A structured, serializable event describing a topology or policy change,
/// for sinks that want more than a formatted log line (e.g. an event-bus
/// forwarder sitting behind `tracing-subscriber`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RouterEvent {
    LinkAttached { connection: ConnectionId, link: LinkId },
    LinkDetached { link: LinkId, lost: bool },
    MobileAddressAdded { address: String, bit: MaskBit },
    MobileAddressRemoved { address: String, bit: MaskBit },
    NeighborLost { neighbor_bit: MaskBit },
    PolicyDenied { connection: ConnectionId, action: &'static str, condition: &'static str },
}

/// Opens the per-action-batch span the core work loop runs under (§5
/// "Core work loop"), carrying the fields every subsequent `trace!`/
/// `debug!` call in that batch inherits.
pub fn action_batch_span(self_bit: MaskBit) -> tracing::Span {
    tracing::info_span!("router_core.action_batch", self_bit = self_bit.into_inner())
}

/// Opens the span a single forwarding decision runs under, so routing
/// detail (`trace!`) and the final fanout count (`debug!`) correlate.
pub fn forward_span(address: &str, semantics: &'static str) -> tracing::Span {
    tracing::debug_span!("router_core.forward", address, semantics)
}
