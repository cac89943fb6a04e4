//! The policy gate: connection/session/link admission, limit counters, and
//! pattern-based address approval (§4.5, SPEC_FULL.md §2 policy.c
//! supplement).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::connection::ConnectionId;
use crate::domain_types::{CreditCount, UserName, VhostName};
use crate::pattern::{CsvPatternSet, WildcardPatternTree};

/// AMQP close/detach condition name for limit denials (`policy.c`).
pub const CONDITION_RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
/// AMQP close/detach condition name for pattern-approval denials.
pub const CONDITION_UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
/// Literal description used when a connection is denied (`policy.c`).
pub const DESCRIPTION_CONNECTION_DENIED: &str = "connection disallowed by local policy";
/// Literal description used when a link is denied (`policy.c`).
pub const DESCRIPTION_LINK_DENIED: &str = "link disallowed by local policy";

/// Process-wide connection counters (§9 "Global mutable policy counters"):
/// a single owned record, mutated only under the admission path, read by
/// the management interface via atomic load.
#[derive(Debug, Default)]
pub struct GlobalConnectionCounters {
    current: AtomicU32,
    processed: AtomicU64,
    denied: AtomicU64,
}

impl GlobalConnectionCounters {
    /// Applies the socket-accept admission check against `max_connections`
    /// (§4.5 "Socket accept"). Returns whether the connection is admitted.
    pub fn admit(&self, max_connections: u32) -> bool {
        self.processed.fetch_add(1, Ordering::AcqRel);
        let current = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        if max_connections > 0 && current > max_connections {
            self.current.fetch_sub(1, Ordering::AcqRel);
            self.denied.fetch_add(1, Ordering::AcqRel);
            false
        } else {
            true
        }
    }

    /// Releases a previously-admitted connection's slot.
    pub fn release(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }

    /// Current open-connection count (`connectionsCurrent`).
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    /// Total connections processed (`connectionsProcessed`).
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Total connections denied (`connectionsDenied`).
    #[must_use]
    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Acquire)
    }
}

/// Per-vhost-group denial counters (`policy.c`'s `sessionDenied` /
/// `senderDenied` / `receiverDenied`), shared via `Arc` with every
/// connection admitted under the owning [`PolicySettings`].
#[derive(Debug, Default)]
pub struct DenialCounts {
    session_denied: AtomicU64,
    sender_denied: AtomicU64,
    receiver_denied: AtomicU64,
}

impl DenialCounts {
    /// Current `sessionDenied` count.
    #[must_use]
    pub fn session_denied(&self) -> u64 {
        self.session_denied.load(Ordering::Acquire)
    }

    /// Current `senderDenied` count.
    #[must_use]
    pub fn sender_denied(&self) -> u64 {
        self.sender_denied.load(Ordering::Acquire)
    }

    /// Current `receiverDenied` count.
    #[must_use]
    pub fn receiver_denied(&self) -> u64 {
        self.receiver_denied.load(Ordering::Acquire)
    }
}

/// Compiled per-user-group limits and pattern trees (§3 "PolicySettings").
pub struct PolicySettings {
    /// Maximum AMQP transport frame size.
    pub max_frame_size: u32,
    /// Maximum session incoming window.
    pub max_session_window: u32,
    /// Maximum concurrent sessions, 0 = unlimited.
    pub max_sessions: u32,
    /// Maximum concurrent sender links, 0 = unlimited.
    pub max_senders: u32,
    /// Maximum concurrent receiver links, 0 = unlimited.
    pub max_receivers: u32,
    /// Whether anonymous (no target address) senders are allowed.
    pub allow_anonymous_sender: bool,
    /// Whether a dynamic source is allowed on a receiver link.
    pub allow_dynamic_source: bool,
    /// Whether a message's `user-id` property may differ from the
    /// authenticated user (§4.5 "User-id proxy check").
    pub allow_user_id_proxy: bool,
    /// Compiled source address approval (tree preferred over CSV, per
    /// §4.5 "pattern against `targetParseTree || targets`").
    pub source_patterns: AddressPatterns,
    /// Compiled target address approval.
    pub target_patterns: AddressPatterns,
    /// Shared denial counters for this group.
    pub denial_counts: Arc<DenialCounts>,
}

/// Either mode of compiled pattern approval, mirroring §4.5's "CSV mode"
/// and "Tree mode".
pub enum AddressPatterns {
    /// Tokenized wildcard trie, tried first when both are present.
    Tree(WildcardPatternTree),
    /// Flat CSV pattern set.
    Csv(CsvPatternSet),
    /// No restriction configured; everything approved.
    Unrestricted,
}

impl AddressPatterns {
    fn approves(&self, candidate: &str, user: &str) -> bool {
        match self {
            AddressPatterns::Tree(tree) => tree.matches(candidate, user),
            AddressPatterns::Csv(csv) => csv.matches(candidate, user),
            AddressPatterns::Unrestricted => true,
        }
    }
}

/// Outcome of an admission check, carrying the AMQP close/detach payload
/// to apply on denial (§7 "PolicyDeny").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The request is approved.
    Allowed,
    /// Denied; close/detach with the named condition and description.
    Denied {
        /// AMQP condition name.
        condition: &'static str,
        /// Human-readable description attached to the condition.
        description: &'static str,
    },
}

impl Admission {
    /// Whether this outcome allows the request.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Per-connection session count, guarded by the connection's own
/// synchronization (the core thread, per §5).
#[derive(Debug, Default)]
pub struct SessionLinkCounts {
    sessions: u32,
    senders: u32,
    receivers: u32,
}

impl SessionLinkCounts {
    /// §4.5 "Session Begin": denies once `current == max_sessions`.
    pub fn admit_session(&mut self, settings: &PolicySettings) -> Admission {
        if settings.max_sessions > 0 && self.sessions >= settings.max_sessions {
            settings.denial_counts.session_denied.fetch_add(1, Ordering::AcqRel);
            return Admission::Denied {
                condition: CONDITION_RESOURCE_LIMIT_EXCEEDED,
                description: DESCRIPTION_CONNECTION_DENIED,
            };
        }
        self.sessions += 1;
        Admission::Allowed
    }

    /// §4.5 "Link Attach", sender side: limit check then pattern approval
    /// against the target address (or `allow_anonymous_sender` if none).
    pub fn admit_sender(
        &mut self,
        settings: &PolicySettings,
        target_address: Option<&str>,
        user: &UserName,
    ) -> Admission {
        if settings.max_senders > 0 && self.senders >= settings.max_senders {
            settings.denial_counts.sender_denied.fetch_add(1, Ordering::AcqRel);
            return Admission::Denied {
                condition: CONDITION_RESOURCE_LIMIT_EXCEEDED,
                description: DESCRIPTION_LINK_DENIED,
            };
        }
        let approved = match target_address {
            Some(addr) => settings.target_patterns.approves(addr, user.as_ref()),
            None => settings.allow_anonymous_sender,
        };
        if !approved {
            settings.denial_counts.sender_denied.fetch_add(1, Ordering::AcqRel);
            return Admission::Denied {
                condition: CONDITION_UNAUTHORIZED_ACCESS,
                description: DESCRIPTION_LINK_DENIED,
            };
        }
        self.senders += 1;
        Admission::Allowed
    }

    /// §4.5 "Link Attach", receiver side: symmetric to `admit_sender`,
    /// using `max_receivers` and `source_patterns`; a dynamic source also
    /// requires `allow_dynamic_source`.
    pub fn admit_receiver(
        &mut self,
        settings: &PolicySettings,
        source_address: Option<&str>,
        dynamic_source: bool,
        user: &UserName,
    ) -> Admission {
        if settings.max_receivers > 0 && self.receivers >= settings.max_receivers {
            settings.denial_counts.receiver_denied.fetch_add(1, Ordering::AcqRel);
            return Admission::Denied {
                condition: CONDITION_RESOURCE_LIMIT_EXCEEDED,
                description: DESCRIPTION_LINK_DENIED,
            };
        }
        let approved = if dynamic_source {
            settings.allow_dynamic_source
        } else {
            match source_address {
                Some(addr) => settings.source_patterns.approves(addr, user.as_ref()),
                None => false,
            }
        };
        if !approved {
            settings.denial_counts.receiver_denied.fetch_add(1, Ordering::AcqRel);
            return Admission::Denied {
                condition: CONDITION_UNAUTHORIZED_ACCESS,
                description: DESCRIPTION_LINK_DENIED,
            };
        }
        self.receivers += 1;
        Admission::Allowed
    }
}

/// §4.5 "User-id proxy check": an inbound message whose `user-id` is
/// non-empty and differs from the authenticated user is rejected without
/// core involvement when proxying is forbidden.
#[must_use]
pub fn check_user_id_proxy(
    allow_user_id_proxy: bool,
    message_user_id: Option<&str>,
    authenticated_user: &UserName,
) -> bool {
    if allow_user_id_proxy {
        return true;
    }
    match message_user_id {
        Some(uid) if !uid.is_empty() => uid == authenticated_user.as_ref(),
        _ => true,
    }
}

/// The out-of-process (or in-process library) policy engine the core
/// consumes (§6 "Policy interface"). Calls happen outside the core thread
/// and never while holding the action lock.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Resolves the authenticated user/host/vhost/connection-name tuple to
    /// a policy group name, or an empty string if none applies.
    async fn lookup_user(
        &self,
        user: &UserName,
        host_ip: &str,
        vhost: &VhostName,
        connection_name: &str,
        connection_id: ConnectionId,
    ) -> String;

    /// Resolves a group name to its compiled settings.
    async fn lookup_settings(&self, vhost: &VhostName, group: &str) -> Option<Arc<PolicySettings>>;

    /// Requests that the given connection be closed, e.g. after an
    /// out-of-band policy change.
    async fn close_connection(&self, connection_id: ConnectionId);
}

/// A concurrent cache in front of a [`PolicyEngine`]'s `lookup_settings`,
/// keyed by `(vhost, group)`. Admission runs on I/O threads, potentially
/// many at once (§6 "The engine is called outside the core thread"), so the
/// cache must support concurrent reads and writes without a single global
/// lock.
#[derive(Default)]
pub struct PolicySettingsCache {
    entries: DashMap<(VhostName, String), Arc<PolicySettings>>,
}

impl PolicySettingsCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Returns the cached settings for `(vhost, group)`, calling `engine`'s
    /// `lookup_settings` and populating the cache on a miss.
    pub async fn get_or_lookup(
        &self,
        engine: &dyn PolicyEngine,
        vhost: &VhostName,
        group: &str,
    ) -> Option<Arc<PolicySettings>> {
        let key = (vhost.clone(), group.to_string());
        if let Some(cached) = self.entries.get(&key) {
            return Some(Arc::clone(&cached));
        }
        let settings = engine.lookup_settings(vhost, group).await?;
        self.entries.insert(key, Arc::clone(&settings));
        Some(settings)
    }

    /// Drops every cached entry for `vhost`, e.g. after a policy reload.
    pub fn invalidate_vhost(&self, vhost: &VhostName) {
        self.entries.retain(|(v, _), _| v != vhost);
    }
}

/// Applies the transport-level limits a `PolicySettings` carries to an
/// AMQP Open (§4.5 "AMQP Open"): `maxFrameSize` and `channel-max =
/// maxSessions - 1`.
#[must_use]
pub fn transport_limits(settings: &PolicySettings) -> (u32, u16) {
    let channel_max = settings.max_sessions.saturating_sub(1).min(u32::from(u16::MAX)) as u16;
    (settings.max_frame_size, channel_max)
}

/// Converts a link-flow `credit` grant into the typed [`CreditCount`],
/// a small convenience used where policy code touches link state directly.
#[must_use]
pub fn credit_from_raw(value: u32) -> CreditCount {
    CreditCount::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_sender_cap(max_senders: u32) -> PolicySettings {
        PolicySettings {
            max_frame_size: 16384,
            max_session_window: 1000,
            max_sessions: 10,
            max_senders,
            max_receivers: 0,
            allow_anonymous_sender: false,
            allow_dynamic_source: false,
            allow_user_id_proxy: false,
            source_patterns: AddressPatterns::Unrestricted,
            target_patterns: AddressPatterns::Unrestricted,
            denial_counts: Arc::new(DenialCounts::default()),
        }
    }

    #[test]
    fn sender_cap_denies_the_third_attach() {
        // §8 scenario 3
        let settings = settings_with_sender_cap(2);
        let mut counts = SessionLinkCounts::default();
        let user = UserName::try_new("alice").unwrap();

        assert!(counts.admit_sender(&settings, Some("a"), &user).is_allowed());
        assert!(counts.admit_sender(&settings, Some("b"), &user).is_allowed());
        let third = counts.admit_sender(&settings, Some("c"), &user);
        assert_eq!(
            third,
            Admission::Denied {
                condition: CONDITION_RESOURCE_LIMIT_EXCEEDED,
                description: DESCRIPTION_LINK_DENIED,
            }
        );
        assert_eq!(settings.denial_counts.sender_denied(), 1);
    }

    #[test]
    fn user_id_proxy_rejected_when_disallowed_and_mismatched() {
        // §8 scenario 4
        let user = UserName::try_new("alice").unwrap();
        assert!(!check_user_id_proxy(false, Some("bob"), &user));
        assert!(check_user_id_proxy(false, Some("alice"), &user));
        assert!(check_user_id_proxy(false, None, &user));
        assert!(check_user_id_proxy(true, Some("bob"), &user));
    }

    #[test]
    fn socket_accept_admits_up_to_the_configured_max() {
        let counters = GlobalConnectionCounters::default();
        assert!(counters.admit(2));
        assert!(counters.admit(2));
        assert!(!counters.admit(2));
        assert_eq!(counters.denied(), 1);
        assert_eq!(counters.processed(), 3);
    }

    #[test]
    fn transport_limits_derive_channel_max_from_max_sessions() {
        let settings = settings_with_sender_cap(0);
        let (frame, channel_max) = transport_limits(&settings);
        assert_eq!(frame, 16384);
        assert_eq!(channel_max, 9);
    }

    struct CountingEngine {
        lookups: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl PolicyEngine for CountingEngine {
        async fn lookup_user(
            &self,
            _user: &UserName,
            _host_ip: &str,
            _vhost: &VhostName,
            _connection_name: &str,
            _connection_id: ConnectionId,
        ) -> String {
            String::new()
        }

        async fn lookup_settings(&self, _vhost: &VhostName, _group: &str) -> Option<Arc<PolicySettings>> {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            Some(Arc::new(settings_with_sender_cap(5)))
        }

        async fn close_connection(&self, _connection_id: ConnectionId) {}
    }

    #[tokio::test]
    async fn settings_cache_hits_after_the_first_lookup() {
        let engine = CountingEngine { lookups: std::sync::atomic::AtomicU32::new(0) };
        let cache = PolicySettingsCache::new();
        let vhost = VhostName::try_new("tenant-a").unwrap();

        cache.get_or_lookup(&engine, &vhost, "default").await.unwrap();
        cache.get_or_lookup(&engine, &vhost, "default").await.unwrap();

        assert_eq!(engine.lookups.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn invalidating_a_vhost_forces_a_fresh_lookup() {
        let engine = CountingEngine { lookups: std::sync::atomic::AtomicU32::new(0) };
        let cache = PolicySettingsCache::new();
        let vhost = VhostName::try_new("tenant-b").unwrap();

        cache.get_or_lookup(&engine, &vhost, "default").await.unwrap();
        cache.invalidate_vhost(&vhost);
        cache.get_or_lookup(&engine, &vhost, "default").await.unwrap();

        assert_eq!(engine.lookups.load(Ordering::Relaxed), 2);
    }
}
