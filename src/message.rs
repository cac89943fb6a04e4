//! Zero-copy chained-buffer AMQP message with lazy section parsing and the
//! router's own annotation rewrite pipeline (§3 "Message", §4.4).
//!
//! A [`Message`] owns an append-only list of [`Bytes`] buffers. Section
//! boundaries are identified lazily, by walking the described-type
//! descriptor codes the AMQP 1.0 encoding uses for `header`,
//! `delivery-annotations`, `message-annotations`, `properties`,
//! `application-properties`, and the body sections — never by fully
//! decoding a section's contents up front. This keeps `check_depth` cheap:
//! it only needs to walk past sections it isn't asked about.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::domain_types::{AddressKey, Phase, RawAddress};

/// AMQP described-type section codes used by the router's depth scanner.
///
/// These follow the AMQP 1.0 `amqp:*:list`/`amqp:*:map` descriptor codes
/// (e.g. `header` = `0x70`), encoded here as `0x00 0x53 <code>` (described
/// type, smallulong descriptor) to keep the scanner a byte-oriented
/// state machine rather than a full type decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageDepth {
    /// Fixed AMQP frame header (not a described section; always first).
    Header = 0x70,
    /// `delivery-annotations` (map).
    DeliveryAnnotations = 0x71,
    /// `message-annotations` (map).
    MessageAnnotations = 0x72,
    /// `properties` (list).
    Properties = 0x73,
    /// `application-properties` (map).
    ApplicationProperties = 0x74,
    /// Message body, any of `data`/`amqp-sequence`/`amqp-value`.
    Body = 0x75,
}

impl MessageDepth {
    /// The order in which sections appear on the wire.
    const ORDER: [MessageDepth; 6] = [
        MessageDepth::Header,
        MessageDepth::DeliveryAnnotations,
        MessageDepth::MessageAnnotations,
        MessageDepth::Properties,
        MessageDepth::ApplicationProperties,
        MessageDepth::Body,
    ];

    fn rank(self) -> usize {
        Self::ORDER.iter().position(|d| *d == self).unwrap()
    }

    /// Whether this section's AMQP encoding is required to be a list
    /// (`header`, `properties`) rather than a map.
    fn requires_list(self) -> bool {
        matches!(self, MessageDepth::Header | MessageDepth::Properties)
    }
}

/// Result of [`Message::check_depth`], per §4.4 "Depth validation".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthCheck {
    /// All sections up to and including the requested depth parsed cleanly.
    Ok,
    /// End-of-buffer was reached before the requested depth, and
    /// `receive_complete` is false — more bytes are expected.
    Incomplete,
    /// A section's encoded type does not match what AMQP mandates for that
    /// section (e.g. a map where a list is required).
    Invalid,
}

const TYPE_LIST8: u8 = 0xC0;
const TYPE_LIST32: u8 = 0xD0;
const TYPE_MAP8: u8 = 0xC1;
const TYPE_MAP32: u8 = 0xD1;

/// A rewriteable overlay of the router's own annotations, applied on top of
/// whatever `message-annotations` the message already carries.
///
/// Keys correspond to §6 "Wire compatibility": `x-opt-qd.trace`,
/// `x-opt-qd.ingress`, `x-opt-qd.to`, `x-opt-qd.phase`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterAnnotations {
    /// List of router ids the message has traversed, in order.
    pub trace: Vec<String>,
    /// The first router id that accepted this message into the mesh.
    pub ingress: Option<String>,
    /// Effective destination, overriding the `properties.to` field.
    pub to_override: Option<RawAddress>,
    /// Pipeline stage annotation.
    pub phase: Option<Phase>,
}

/// A message as received or being constructed for forwarding.
///
/// Invariants (§3): the buffer list is append-only during receive;
/// `receive_complete` becomes `true` exactly once and is monotonic;
/// `check_depth` is idempotent once reached.
#[derive(Debug, Clone)]
pub struct Message {
    buffers: Vec<Bytes>,
    receive_complete: bool,
    annotations: RouterAnnotations,
    application_properties: HashMap<String, String>,
    to_field: Option<RawAddress>,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// Creates an empty, incomplete message.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            receive_complete: false,
            annotations: RouterAnnotations::default(),
            application_properties: HashMap::new(),
            to_field: None,
        }
    }

    /// Appends a buffer to the chain. Valid only while the message has not
    /// been marked complete.
    pub fn append_buffer(&mut self, buf: Bytes) {
        debug_assert!(!self.receive_complete, "append after receive_complete");
        self.buffers.push(buf);
    }

    /// Marks the message as fully received. Monotonic: calling this twice
    /// is a no-op, never un-sets the flag.
    pub fn set_receive_complete(&mut self) {
        self.receive_complete = true;
    }

    /// Whether the message has been fully received.
    #[must_use]
    pub fn receive_complete(&self) -> bool {
        self.receive_complete
    }

    /// Number of buffers currently queued for this message, used against
    /// the [`Q2Watermarks`] to decide receive-side backpressure.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn total_len(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }

    fn byte_at(&self, index: usize) -> Option<u8> {
        let mut remaining = index;
        for buf in &self.buffers {
            if remaining < buf.len() {
                return Some(buf[remaining]);
            }
            remaining -= buf.len();
        }
        None
    }

    /// Walks the buffer chain counting complete AMQP sections, returning
    /// whether parsing to `depth` succeeded, is blocked on more bytes, or
    /// found a type mismatch. Idempotent and stable once reached (§4.4,
    /// §8 invariant 1).
    #[must_use]
    pub fn check_depth(&self, depth: MessageDepth) -> DepthCheck {
        let target_rank = depth.rank();
        let mut cursor = 0usize;
        let total = self.total_len();

        for &section in &MessageDepth::ORDER {
            if section.rank() > target_rank {
                break;
            }
            match self.scan_section(section, cursor, total) {
                Ok(Some(next_cursor)) => cursor = next_cursor,
                Ok(None) => {
                    return if self.receive_complete {
                        DepthCheck::Ok
                    } else {
                        DepthCheck::Incomplete
                    };
                }
                Err(()) => return DepthCheck::Invalid,
            }
        }
        DepthCheck::Ok
    }

    /// Scans one section starting at `cursor`. Returns `Ok(Some(next))` if
    /// the section parsed fully, `Ok(None)` if more bytes are needed, or
    /// `Err(())` on a type mismatch.
    fn scan_section(
        &self,
        section: MessageDepth,
        cursor: usize,
        total: usize,
    ) -> Result<Option<usize>, ()> {
        // Described-type header: 0x00 0x53 <code>
        if cursor + 3 > total {
            return Ok(None);
        }
        if self.byte_at(cursor) != Some(0x00) || self.byte_at(cursor + 1) != Some(0x53) {
            // Not a described type at all (e.g. fixed frame header at depth 0):
            // treat the fixed-size AMQP frame header specially.
            if section == MessageDepth::Header {
                return self.scan_fixed_header(cursor, total);
            }
            return Err(());
        }
        let type_pos = cursor + 3;
        if type_pos >= total {
            return Ok(None);
        }
        let type_byte = self.byte_at(type_pos).ok_or(())?;
        let is_list = matches!(type_byte, TYPE_LIST8 | TYPE_LIST32);
        let is_map = matches!(type_byte, TYPE_MAP8 | TYPE_MAP32);
        if !is_list && !is_map {
            return Err(());
        }
        if section.requires_list() && !is_list {
            return Err(());
        }
        if !section.requires_list() && !is_map {
            return Err(());
        }

        let (size_bytes, size_width): (usize, usize) = match type_byte {
            TYPE_LIST8 | TYPE_MAP8 => (1, 1),
            TYPE_LIST32 | TYPE_MAP32 => (4, 4),
            _ => unreachable!(),
        };
        let size_pos = type_pos + 1;
        if size_pos + size_bytes > total {
            return Ok(None);
        }
        let size = match size_width {
            1 => self.byte_at(size_pos).ok_or(())? as usize,
            4 => {
                let mut value = 0usize;
                for i in 0..4 {
                    value = (value << 8) | self.byte_at(size_pos + i).ok_or(())? as usize;
                }
                value
            }
            _ => unreachable!(),
        };
        let content_start = size_pos + size_bytes;
        let content_end = content_start + size;
        if content_end > total {
            return Ok(None);
        }
        Ok(Some(content_end))
    }

    /// The fixed, non-described 8-byte AMQP transport frame header treated
    /// as depth zero for routers that stamp it.
    fn scan_fixed_header(&self, cursor: usize, total: usize) -> Result<Option<usize>, ()> {
        const FIXED_HEADER_LEN: usize = 8;
        if cursor + FIXED_HEADER_LEN > total {
            return Ok(None);
        }
        Ok(Some(cursor + FIXED_HEADER_LEN))
    }

    /// Sets the `to` property field parsed from `properties` (normally done
    /// by lazy field access; exposed here for router address resolution).
    pub fn set_to_field(&mut self, to: RawAddress) {
        self.to_field = Some(to);
    }

    /// The properties' `to` field, if present.
    #[must_use]
    pub fn to_field(&self) -> Option<&RawAddress> {
        self.to_field.as_ref()
    }

    /// Sets an application-property, used by the policy gate's `user-id`
    /// proxy check (§4.5) and by test fixtures.
    pub fn set_application_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.application_properties.insert(key.into(), value.into());
    }

    /// Reads an application-property.
    #[must_use]
    pub fn application_property(&self, key: &str) -> Option<&str> {
        self.application_properties.get(key).map(String::as_str)
    }

    /// Read access to the router's own annotations.
    #[must_use]
    pub fn annotations(&self) -> &RouterAnnotations {
        &self.annotations
    }

    /// Mutable access, used by the annotation rewrite pipeline.
    pub fn annotations_mut(&mut self) -> &mut RouterAnnotations {
        &mut self.annotations
    }

    /// Resolves the effective destination address per §4.2 "Resolution":
    /// `to-override` takes precedence over the properties' `to` field.
    #[must_use]
    pub fn effective_destination(&self) -> Option<&RawAddress> {
        self.annotations.to_override.as_ref().or(self.to_field.as_ref())
    }

    /// Derives the normalized [`AddressKey`] for table lookup, applying an
    /// optional tenant-space prefix and phase character (§4.2).
    #[must_use]
    pub fn address_key(&self, tenant_space: Option<&str>) -> Option<AddressKey> {
        let raw = self.effective_destination()?;
        let mut key = String::new();
        if let Some(tenant) = tenant_space {
            key.push_str(tenant);
            key.push('/');
        }
        key.push_str(raw.as_ref());
        if let Some(phase) = self.annotations.phase {
            key.push('@');
            key.push_str(&phase.into_inner().to_string());
        }
        AddressKey::try_new(key).ok()
    }
}

/// Runs the inbound annotation rewrite pipeline described in §4.4, steps
/// 2-5. Step 1 (computing `link_exclusions` from the pre-rewrite trace) is
/// the caller's job (`protocol::compute_link_exclusions`) since it needs
/// the route table's router-id-to-link-bit mapping, which this module does
/// not own.
///
/// Returns the trace as it stood *before* this router appended itself (for
/// loop-suppression lookups) and the iterator to the inbound `ingress`
/// annotation — `None` if this router stamped it, matching the
/// "downstream multicast-once uses NULL ingress as origin=0" rule.
pub fn rewrite_annotations_inbound(
    message: &mut Message,
    this_router_id: &str,
    strip_inbound: bool,
) -> (Vec<String>, Option<String>) {
    if strip_inbound {
        let prior_trace = std::mem::take(&mut message.annotations_mut().trace);
        message.annotations_mut().ingress = None;
        return (prior_trace, None);
    }

    let prior_trace = message.annotations().trace.clone();

    // Step 2: append this router and write back.
    let mut new_trace = prior_trace.clone();
    new_trace.push(this_router_id.to_string());
    message.annotations_mut().trace = new_trace;

    // Step 3: preserve or synthesize ingress.
    let original_ingress = message.annotations().ingress.clone();
    let stamped_here = original_ingress.is_none();
    if stamped_here {
        message.annotations_mut().ingress = Some(this_router_id.to_string());
    }

    // Step 5: return NULL if this router stamped it.
    let returned_ingress = if stamped_here { None } else { original_ingress };
    (prior_trace, returned_ingress)
}

/// Receive-side buffer-depth watermark pair used to exert backpressure on
/// the transport (§6 "Q2 flow control", glossary "Q2").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Q2Watermarks {
    lower: usize,
    upper: usize,
}

impl Q2Watermarks {
    /// Builds a watermark pair. `lower` must be strictly less than `upper`.
    #[must_use]
    pub fn new(lower: usize, upper: usize) -> Self {
        debug_assert!(lower < upper, "Q2_LOWER must be < Q2_UPPER");
        Self { lower, upper }
    }

    /// Whether the receiver should signal block: buffer count has reached
    /// or exceeded the upper watermark.
    #[must_use]
    pub fn should_block(&self, buffer_count: usize) -> bool {
        buffer_count >= self.upper
    }

    /// Whether the receiver should signal unblock: buffer count has
    /// dropped below the lower watermark.
    #[must_use]
    pub fn should_unblock(&self, buffer_count: usize) -> bool {
        buffer_count < self.lower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(code: u8, type_byte: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x53, code, type_byte, content.len() as u8];
        out.extend_from_slice(content);
        out
    }

    #[test]
    fn depth_check_incomplete_then_ok() {
        // §8 scenario 6: feed first 4 bytes of a delivery-annotations
        // header with receive_complete=false.
        let full = section(MessageDepth::DeliveryAnnotations as u8, TYPE_MAP8, b"xx");
        let mut msg = Message::new();
        msg.append_buffer(Bytes::copy_from_slice(&full[..4]));
        assert_eq!(
            msg.check_depth(MessageDepth::DeliveryAnnotations),
            DepthCheck::Incomplete
        );

        msg.append_buffer(Bytes::copy_from_slice(&full[4..]));
        msg.set_receive_complete();
        assert_eq!(
            msg.check_depth(MessageDepth::DeliveryAnnotations),
            DepthCheck::Ok
        );
    }

    #[test]
    fn depth_check_invalid_on_type_mismatch() {
        // §8 scenario 6: delivery-annotations descriptor 0x71-style header
        // whose type is a map where... conversely here header (0x70)
        // requires a list; feeding a map is invalid.
        let bad = section(MessageDepth::Header as u8, TYPE_MAP8, b"xx");
        let mut msg = Message::new();
        // Prepend the fixed 8-byte frame header depth is handled specially;
        // since header descriptor-coded bytes are present we go straight to
        // the described-type branch.
        msg.append_buffer(Bytes::copy_from_slice(&bad));
        msg.set_receive_complete();
        assert_eq!(msg.check_depth(MessageDepth::Header), DepthCheck::Invalid);
    }

    #[test]
    fn depth_check_is_idempotent_once_reached() {
        // §8 invariant 1
        let full = section(MessageDepth::Properties as u8, TYPE_LIST8, b"abcd");
        let mut msg = Message::new();
        msg.append_buffer(Bytes::copy_from_slice(&full));
        msg.set_receive_complete();
        let first = msg.check_depth(MessageDepth::Properties);
        let second = msg.check_depth(MessageDepth::Properties);
        assert_eq!(first, second);
    }

    #[test]
    fn annotation_pipeline_appends_trace_and_stamps_ingress() {
        // §8 scenario 1 setup (trace/ingress halves; forwarding itself is
        // tested in forwarder.rs).
        let mut msg = Message::new();
        msg.annotations_mut().trace = vec!["R2".to_string()];
        let (prior_trace, returned_ingress) = rewrite_annotations_inbound(&mut msg, "R1", false);
        assert_eq!(prior_trace, vec!["R2".to_string()]);
        assert_eq!(msg.annotations().trace, vec!["R2".to_string(), "R1".to_string()]);
        assert_eq!(msg.annotations().ingress, Some("R1".to_string()));
        assert_eq!(returned_ingress, None);
    }

    #[test]
    fn annotation_pipeline_preserves_existing_ingress() {
        let mut msg = Message::new();
        msg.annotations_mut().ingress = Some("R0".to_string());
        let (_, returned_ingress) = rewrite_annotations_inbound(&mut msg, "R1", false);
        assert_eq!(msg.annotations().ingress, Some("R0".to_string()));
        assert_eq!(returned_ingress, Some("R0".to_string()));
    }

    #[test]
    fn effective_destination_prefers_to_override() {
        let mut msg = Message::new();
        msg.set_to_field(RawAddress::try_new("fallback").unwrap());
        assert_eq!(msg.effective_destination().unwrap().as_ref(), "fallback");
        msg.annotations_mut().to_override = Some(RawAddress::try_new("override").unwrap());
        assert_eq!(msg.effective_destination().unwrap().as_ref(), "override");
    }

    #[test]
    fn q2_backpressure_toggle() {
        // §8 scenario 5
        let q2 = Q2Watermarks::new(5, 8);
        assert!(q2.should_block(8));
        assert!(!q2.should_unblock(8));
        assert!(!q2.should_block(4));
        assert!(q2.should_unblock(4));
    }
}
