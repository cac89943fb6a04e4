//! Error taxonomy for the router-core subsystem (§7 "Error handling design").
//!
//! `CoreError` realizes the six categories named in §7 as a closed enum: one
//! variant per category, each carrying the detail §7 names for it. None of
//! these unwind across the action boundary (§7 "Propagation") — action
//! handlers catch and record them via [`tracing`] plus the policy/denial
//! counters in [`crate::policy`] rather than propagating a `Result` out of
//! [`crate::core_engine::RouterCore::run`].

use thiserror::Error;

use crate::domain_types::{AddressKey, ConnectionId, LinkId};

/// Invalid compiled policy or unknown forwarding semantics, fatal at init
/// (§7 "ConfigError ... Fatal at init; logged; process exits").
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("field {field} failed validation: {reason}")]
    ValidationError { field: &'static str, reason: String },

    #[error("unknown forwarding semantics {0:?}")]
    UnknownSemantics(String),
}

/// Malformed AMQP or a depth-check `INVALID` result (§7 "ProtocolError").
/// The offending delivery is rejected and settled; the link and connection
/// remain open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message on link {link} failed depth check at field {field}")]
    DepthCheckInvalid { link: LinkId, field: &'static str },

    #[error("message on link {link} is incomplete")]
    Incomplete { link: LinkId },

    #[error("malformed annotation {name}: {reason}")]
    MalformedAnnotation { name: &'static str, reason: String },
}

/// Admission failure at socket accept, AMQP Open, Session Begin, or Link
/// Attach (§7 "PolicyDeny"). Carries the literal AMQP close/detach
/// condition and description that `policy.rs` stamps on the wire.
#[derive(Debug, Error)]
#[error("policy denied {action} for connection {connection}: {condition} ({description})")]
pub struct PolicyDeny {
    pub action: &'static str,
    pub connection: ConnectionId,
    pub condition: &'static str,
    pub description: &'static str,
}

/// No address binding exists for a delivery's destination (§7
/// "Unroutable"). The delivery is released with disposition `RELEASED`; the
/// link remains open.
#[derive(Debug, Error)]
#[error("no route for address {address}")]
pub struct UnroutableError {
    pub address: AddressKey,
}

/// Connection drop or write failure (§7 "Transient"). Triggers a `LOST`
/// detach cascade; resources are freed; no retry happens at this layer.
#[derive(Debug, Error)]
#[error("transient failure on connection {connection}: {reason}")]
pub struct TransientError {
    pub connection: ConnectionId,
    pub reason: String,
}

/// Invariant violation (§7 "Internal ... Aborts the process"), e.g. a
/// negative connection count or a delivery arena generation mismatch that
/// should be structurally impossible.
#[derive(Debug, Error)]
#[error("internal invariant violated: {0}")]
pub struct InternalError(pub String);

/// The union of every category in §7's taxonomy, for call sites that need a
/// single error type (e.g. a fallible action handler before it is split
/// into its category-specific recording path).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    PolicyDeny(#[from] PolicyDeny),

    #[error(transparent)]
    Unroutable(#[from] UnroutableError),

    #[error(transparent)]
    Transient(#[from] TransientError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl CoreError {
    /// Whether the process should abort on this error (§7 "Internal ...
    /// Aborts the process").
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Internal(_) | CoreError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_and_config_errors_are_fatal() {
        assert!(CoreError::from(InternalError("bad generation".into())).is_fatal());
        assert!(CoreError::from(ConfigError::UnknownSemantics("bogus".into())).is_fatal());
    }

    #[test]
    fn policy_deny_and_unroutable_are_not_fatal() {
        let deny = PolicyDeny {
            action: "link-attach",
            connection: ConnectionId::generate(),
            condition: "amqp:unauthorized-access",
            description: "link disallowed by local policy",
        };
        assert!(!CoreError::from(deny).is_fatal());
    }
}
