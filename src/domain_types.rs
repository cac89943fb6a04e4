//! Strongly-typed domain primitives shared across the router-core subsystem.
//!
//! Mirrors the host crate's pattern of wrapping every primitive that has
//! domain meaning (ids, counts, masks) in a `nutype` newtype so that, for
//! example, a `MaskBit` and a `RouterCost` can never be swapped by accident
//! at a call site.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally-unique identifier for a connection.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a new random connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Globally-unique identifier for a link.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    From, Into
))]
pub struct LinkId(Uuid);

impl LinkId {
    /// Creates a new random link id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Identifier of a delivery, stable for the lifetime of the traversal.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into
))]
pub struct DeliveryTag(u64);

/// Monotonic allocator for `DeliveryTag`s, guarded by a single `id_lock` per
/// §5 ("Identifier allocator: guarded by `id_lock`, monotonic 64-bit
/// counter").
#[derive(Debug, Default)]
pub struct DeliveryTagAllocator {
    next: std::sync::atomic::AtomicU64,
}

impl DeliveryTagAllocator {
    /// Allocates the next delivery tag.
    pub fn next(&self) -> DeliveryTag {
        let value = self.next.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        DeliveryTag::new(value)
    }
}

/// A router's position in the mesh-wide bitmask, `0..capacity`.
#[nutype(
    validate(less_or_equal = 255),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct MaskBit(u8);

/// Inter-router link cost; effective cost is `max(local, remote)` per §6.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 1
)]
pub struct RouterCost(u32);

/// A normalized, hashable address key (mobile destination string plus any
/// tenant-space prefix and phase character already folded in).
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 1024),
    derive(
        Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom, Into
    )
)]
pub struct AddressKey(String);

/// The un-normalized `to` field or `to-override` annotation value as seen on
/// the wire, before tenant-space/phase folding.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 1024),
    derive(
        Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom, Into
    )
)]
pub struct RawAddress(String);

/// Authenticated principal name, as handed to the core by the (out of scope)
/// authentication layer.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 256),
    derive(
        Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom, Into
    )
)]
pub struct UserName(String);

/// Vhost name for multi-tenant connections.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 256),
    derive(
        Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom, Into
    )
)]
pub struct VhostName(String);

/// Credit count on a link (AMQP `link-credit`).
#[nutype(
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, Into
    ),
    default = 0
)]
pub struct CreditCount(u32);

impl CreditCount {
    /// Saturating decrement by one, used when a delivery consumes credit.
    #[must_use]
    pub fn consume_one(self) -> Self {
        Self::new(self.into_inner().saturating_sub(1))
    }
}

/// An integer `phase` annotation value, used to route the same address
/// through distinct stages of a pipeline.
#[nutype(
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, Into
    ),
    default = 0
)]
pub struct Phase(i32);

/// Monotonic statistics counter (ingress/egress/transit/etc).
#[nutype(
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, Into
    ),
    default = 0
)]
pub struct StatCounter(u64);

impl StatCounter {
    /// Increments the counter by one.
    pub fn increment(&mut self) {
        *self = Self::new(self.into_inner() + 1);
    }
}

/// Count of I/O threads servicing listeners/connectors (§5 "N I/O
/// threads").
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct IoThreadCount(usize);

/// Capacity of the core's action queue (§5 "action_list").
#[nutype(
    validate(greater_or_equal = 16),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct ActionQueueCapacity(usize);

/// Capacity of the core's general-work (FIFO callback) queue.
#[nutype(
    validate(greater_or_equal = 16),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct GeneralWorkQueueCapacity(usize);

/// Capacity of a connection's per-connection `work_list` (§5 "work_lock").
#[nutype(
    validate(greater_or_equal = 4),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct ConnectionWorkListCapacity(usize);

/// Default per-link undelivered/unsettled capacity ceiling.
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct LinkCapacity(usize);

/// Q2 buffer-count watermark (§6 "Q2 flow control").
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Into
))]
pub struct Q2Watermark(usize);

/// This router's advertised id string, stamped into the `ingress`/`trace`
/// annotations (§4.4) and used as the router-id table key (§4.6).
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 256),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom, Into)
)]
pub struct RouterId(String);

/// The mesh area this router belongs to (inter-router connection property).
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 256),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom, Into)
)]
pub struct AreaId(String);

/// This router's AMQP container-id, advertised at Open.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 256),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef, TryFrom, Into)
)]
pub struct ContainerId(String);
