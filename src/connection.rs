//! Connections and their per-connection link-ref lists (§3 "Connection",
//! §5 "Shared-resource policy").

use std::collections::HashSet;
use std::sync::Mutex;

pub use crate::domain_types::ConnectionId;
use crate::domain_types::{RouterCost, VhostName};
use crate::link::LinkId;

/// A connection's role in the mesh (§3 "Connection").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// An ordinary client connection.
    Normal,
    /// A connection to/from a peer router.
    InterRouter,
    /// A link-route container connection.
    RouteContainer,
}

/// Flags controlling whether router annotations are stripped on ingress,
/// per the connection's trust boundary (§4.4).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotationStripFlags {
    /// Strip `x-opt-qd.*` annotations on inbound messages from this
    /// connection (client-facing connections that should not see or set
    /// router-internal state).
    pub strip_inbound: bool,
    /// Strip `x-opt-qd.*` annotations on outbound messages to this
    /// connection.
    pub strip_outbound: bool,
}

/// Connection-local state guarded by `work_lock` (§5): the work list,
/// undelivered-cursor bookkeeping, and the three link-ref lists.
///
/// Per §5 "Ordering guarantees": the connection is processed by at most one
/// I/O thread at a time, enforced by `activated`.
#[derive(Debug, Default)]
struct WorkState {
    work_list: Vec<ConnectionWorkItem>,
    links: HashSet<LinkId>,
    links_with_deliveries: HashSet<LinkId>,
    links_with_credit: HashSet<LinkId>,
    activated: bool,
}

/// An item posted to a connection's work list for the owning I/O thread to
/// act on (§4.1, §4.3 "Attach").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionWorkItem {
    /// Open a link on the wire (first attach), outbound from the core.
    FirstAttach(LinkId),
    /// Echo a second attach in response to a peer's first attach.
    SecondAttach(LinkId),
    /// Tear down a link on the wire.
    Detach(LinkId),
    /// Notify the I/O side that a link gained deliverable work.
    PushAvailable(LinkId),
}

/// A connection (§3 "Connection", §3 "Ownership").
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    role: ConnectionRole,
    inbound: bool,
    cost: RouterCost,
    vhost: Option<VhostName>,
    annotation_flags: AnnotationStripFlags,
    link_capacity: usize,
    work: Mutex<WorkState>,
}

impl Connection {
    /// Creates a new connection record.
    #[must_use]
    pub fn new(role: ConnectionRole, inbound: bool, link_capacity: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            role,
            inbound,
            cost: RouterCost::default(),
            vhost: None,
            annotation_flags: AnnotationStripFlags::default(),
            link_capacity,
            work: Mutex::new(WorkState::default()),
        }
    }

    /// The connection's stable identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connection's role.
    #[must_use]
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Whether this connection was accepted inbound (vs. dialed out).
    #[must_use]
    pub fn inbound(&self) -> bool {
        self.inbound
    }

    /// The effective inter-router cost, `max(local, remote)` per §6.
    #[must_use]
    pub fn cost(&self) -> RouterCost {
        self.cost
    }

    /// Applies the remote's advertised `qd.inter-router-cost` against the
    /// locally configured cost (§6 "Wire compatibility").
    pub fn negotiate_cost(&mut self, local: RouterCost, remote: RouterCost) {
        self.cost = local.max(remote);
    }

    /// The multi-tenant vhost this connection belongs to, if any.
    #[must_use]
    pub fn vhost(&self) -> Option<&VhostName> {
        self.vhost.as_ref()
    }

    /// Assigns the vhost, normally done once at AMQP Open.
    pub fn set_vhost(&mut self, vhost: VhostName) {
        self.vhost = Some(vhost);
    }

    /// The annotation-strip flags in effect for this connection.
    #[must_use]
    pub fn annotation_flags(&self) -> AnnotationStripFlags {
        self.annotation_flags
    }

    /// Sets the annotation-strip flags.
    pub fn set_annotation_flags(&mut self, flags: AnnotationStripFlags) {
        self.annotation_flags = flags;
    }

    /// The configured per-link capacity ceiling.
    #[must_use]
    pub fn link_capacity(&self) -> usize {
        self.link_capacity
    }

    /// Registers `link` on this connection's link list and its `CONNECTION`
    /// ref-list membership.
    pub fn add_link(&self, link: LinkId) {
        self.work.lock().unwrap().links.insert(link);
    }

    /// Removes `link` from all three ref lists, e.g. on detach teardown.
    pub fn remove_link(&self, link: LinkId) {
        let mut state = self.work.lock().unwrap();
        state.links.remove(&link);
        state.links_with_deliveries.remove(&link);
        state.links_with_credit.remove(&link);
    }

    /// Marks `link` as carrying pending deliveries.
    pub fn mark_has_deliveries(&self, link: LinkId) {
        self.work.lock().unwrap().links_with_deliveries.insert(link);
    }

    /// Clears a link's pending-deliveries membership, e.g. once its
    /// `undelivered` queue has drained.
    pub fn clear_has_deliveries(&self, link: LinkId) {
        self.work.lock().unwrap().links_with_deliveries.remove(&link);
    }

    /// Marks `link` as currently holding credit.
    pub fn mark_has_credit(&self, link: LinkId) {
        self.work.lock().unwrap().links_with_credit.insert(link);
    }

    /// Snapshot of links currently flagged as having pending deliveries.
    #[must_use]
    pub fn links_with_deliveries(&self) -> Vec<LinkId> {
        self.work.lock().unwrap().links_with_deliveries.iter().copied().collect()
    }

    /// Appends a work item and marks the connection activated, returning
    /// whether the caller is responsible for signalling the I/O thread
    /// (`true` the first time the connection transitions from idle).
    pub fn activate(&self, item: ConnectionWorkItem) -> bool {
        let mut state = self.work.lock().unwrap();
        state.work_list.push(item);
        if state.activated {
            false
        } else {
            state.activated = true;
            true
        }
    }

    /// Drains the work list for the owning I/O thread, clearing the
    /// activation flag.
    pub fn drain_work(&self) -> Vec<ConnectionWorkItem> {
        let mut state = self.work.lock().unwrap();
        state.activated = false;
        std::mem::take(&mut state.work_list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_signals_only_on_idle_to_busy_transition() {
        let conn = Connection::new(ConnectionRole::Normal, true, 250);
        let link = LinkId::generate();
        assert!(conn.activate(ConnectionWorkItem::PushAvailable(link)));
        assert!(!conn.activate(ConnectionWorkItem::PushAvailable(link)));

        let drained = conn.drain_work();
        assert_eq!(drained.len(), 2);
        assert!(conn.activate(ConnectionWorkItem::PushAvailable(link)));
    }

    #[test]
    fn cost_negotiation_takes_the_max() {
        let mut conn = Connection::new(ConnectionRole::InterRouter, false, 250);
        conn.negotiate_cost(RouterCost::try_new(5).unwrap(), RouterCost::try_new(9).unwrap());
        assert_eq!(conn.cost().into_inner(), 9);
    }

    #[test]
    fn link_ref_lists_track_membership() {
        let conn = Connection::new(ConnectionRole::Normal, true, 250);
        let link = LinkId::generate();
        conn.add_link(link);
        conn.mark_has_deliveries(link);
        assert_eq!(conn.links_with_deliveries(), vec![link]);
        conn.clear_has_deliveries(link);
        assert!(conn.links_with_deliveries().is_empty());
        conn.remove_link(link);
    }
}
