//! Connection/link protocol glue: the inbound annotation pipeline's
//! deferred link-exclusion step, and the attach/detach/credit/disposition
//! state machines tying [`crate::link`] and [`crate::message`] together
//! (§4.3, §4.4).

use std::collections::HashMap;

use crate::bitmask::RouterBitMask;
use crate::domain_types::MaskBit;
use crate::message::{rewrite_annotations_inbound, Message};

/// Computes the link-exclusion mask from a message's pre-rewrite `trace`
/// list (§4.4 step 1): the bitmask of neighbor routers that already appear
/// in the trace, which must not receive another copy of this message.
///
/// This is the piece `message::rewrite_annotations_inbound` explicitly
/// defers, since it needs the router-id-to-mask-bit mapping that the
/// route-control plane owns (§4.6), not `message.rs`.
#[must_use]
pub fn compute_link_exclusions(
    prior_trace: &[String],
    router_ids: &HashMap<String, MaskBit>,
) -> RouterBitMask {
    prior_trace.iter().filter_map(|id| router_ids.get(id).copied()).collect()
}

/// Resolves an `ingress` annotation string to its mask bit via the
/// router-id table, used to compute `origin_bit` for `MULTICAST_ONCE`
/// (§4.2: "compute the ingress router's mask bit ... by hashing it into
/// the address table").
#[must_use]
pub fn resolve_origin_bit(
    ingress: Option<&str>,
    router_ids: &HashMap<String, MaskBit>,
) -> Option<MaskBit> {
    ingress.and_then(|id| router_ids.get(id).copied())
}

/// Runs the full inbound pipeline for one message on a non-strip
/// connection: rewrites annotations, then resolves the link-exclusion mask
/// and origin bit a forwarder call needs (§4.4 steps 1-5).
pub struct InboundAnnotationResult {
    /// Mask of neighbor links excluded from this copy's peer fanout.
    pub link_exclusion: RouterBitMask,
    /// This message's ingress router resolved to a mask bit, `None` if
    /// this router stamped ingress itself.
    pub origin_bit: Option<MaskBit>,
}

/// Applies the annotation rewrite and resolves exclusion/origin data in one
/// step, for callers that have a router-id table in scope (the core
/// engine's connection/link-protocol layer).
pub fn run_inbound_pipeline(
    message: &mut Message,
    this_router_id: &str,
    strip_inbound: bool,
    router_ids: &HashMap<String, MaskBit>,
) -> InboundAnnotationResult {
    let (prior_trace, returned_ingress) =
        rewrite_annotations_inbound(message, this_router_id, strip_inbound);
    let link_exclusion = compute_link_exclusions(&prior_trace, router_ids);
    let origin_bit = resolve_origin_bit(returned_ingress.as_deref(), router_ids);
    InboundAnnotationResult { link_exclusion, origin_bit }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bit(n: u8) -> MaskBit {
        MaskBit::try_new(n).unwrap()
    }

    #[test]
    fn link_exclusions_cover_every_neighbor_already_in_trace() {
        // §8 scenario 1
        let mut router_ids = HashMap::new();
        router_ids.insert("R2".to_string(), bit(2));
        router_ids.insert("R3".to_string(), bit(3));

        let trace = vec!["R2".to_string()];
        let mask = compute_link_exclusions(&trace, &router_ids);
        assert!(mask.is_set(bit(2)));
        assert!(!mask.is_set(bit(3)));
    }

    #[test]
    fn run_inbound_pipeline_resolves_origin_bit_from_stamped_ingress() {
        let mut router_ids = HashMap::new();
        router_ids.insert("R0".to_string(), bit(0));

        let mut message = Message::new();
        message.annotations_mut().ingress = Some("R0".to_string());
        let result = run_inbound_pipeline(&mut message, "R1", false, &router_ids);
        assert_eq!(result.origin_bit, Some(bit(0)));
    }

    #[test]
    fn run_inbound_pipeline_yields_no_origin_bit_when_this_router_stamps_ingress() {
        let router_ids = HashMap::new();
        let mut message = Message::new();
        let result = run_inbound_pipeline(&mut message, "R1", false, &router_ids);
        assert_eq!(result.origin_bit, None);
        assert_eq!(message.annotations().ingress, Some("R1".to_string()));
    }
}
