//! The I/O bridge boundary (§6 "I/O bridge callbacks", "Driver→core
//! actions"): the glue the wire driver is expected to implement. The wire
//! driver itself is out of scope (§1); this module defines the trait
//! seam and a loopback demo implementation for local smoke testing.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::connection::ConnectionId;
use crate::delivery::{DeliveryKey, Disposition};
use crate::domain_types::CreditCount;
use crate::link::LinkId;
use crate::message::Message;

/// Core→driver callbacks (§6). The core invokes these from the core thread
/// only; every handler must be non-blocking and schedule real work onto an
/// I/O thread rather than performing it inline.
#[async_trait]
pub trait IoBridge: Send + Sync {
    /// Wakes the I/O thread owning `connection` to drain its work list.
    async fn connection_activate(&self, connection: ConnectionId, awaken: bool);

    /// Requests that the driver open `link` on the wire (first attach).
    async fn link_first_attach(&self, connection: ConnectionId, link: LinkId);

    /// Requests that the driver echo a second attach for `link`.
    async fn link_second_attach(&self, link: LinkId);

    /// Requests that the driver tear down `link` on the wire.
    async fn link_detach(&self, link: LinkId, lost: bool);

    /// Notifies the driver of a credit/drain change on `link`.
    async fn link_flow(&self, link: LinkId, credit: CreditCount, drain: bool);

    /// Notifies the driver that `link` has offered deliveries.
    async fn link_offer(&self, link: LinkId, count: usize);

    /// Notifies the driver that a drain request on `link` has completed.
    async fn link_drained(&self, link: LinkId);

    /// Requests the driver drain credit on `link`.
    async fn link_drain(&self, link: LinkId);

    /// Requests that the driver push up to `credit` undelivered messages
    /// from `link` onto the wire.
    async fn link_push(&self, link: LinkId, credit: CreditCount);

    /// Hands the driver a materialized outbound delivery to encode.
    async fn link_deliver(&self, link: LinkId, delivery: DeliveryKey, message: Arc<Message>);

    /// Notifies the driver that a delivery's disposition changed and
    /// should be mirrored on the wire.
    async fn delivery_update(&self, delivery: DeliveryKey, disposition: Disposition, settled: bool);
}

/// A loopback `IoBridge` for local smoke testing (§0 "thin CLI binary...
/// wires a `RouterCore` to a loopback-only demo `IoBridge`"). Every
/// callback simply logs at trace level; no wire I/O is performed.
#[derive(Debug, Default)]
pub struct LoopbackBridge;

#[async_trait]
impl IoBridge for LoopbackBridge {
    async fn connection_activate(&self, connection: ConnectionId, awaken: bool) {
        tracing::trace!(%connection, awaken, "connection_activate");
    }

    async fn link_first_attach(&self, connection: ConnectionId, link: LinkId) {
        tracing::trace!(%connection, %link, "link_first_attach");
    }

    async fn link_second_attach(&self, link: LinkId) {
        tracing::trace!(%link, "link_second_attach");
    }

    async fn link_detach(&self, link: LinkId, lost: bool) {
        tracing::trace!(%link, lost, "link_detach");
    }

    async fn link_flow(&self, link: LinkId, credit: CreditCount, drain: bool) {
        tracing::trace!(%link, %credit, drain, "link_flow");
    }

    async fn link_offer(&self, link: LinkId, count: usize) {
        tracing::trace!(%link, count, "link_offer");
    }

    async fn link_drained(&self, link: LinkId) {
        tracing::trace!(%link, "link_drained");
    }

    async fn link_drain(&self, link: LinkId) {
        tracing::trace!(%link, "link_drain");
    }

    async fn link_push(&self, link: LinkId, credit: CreditCount) {
        tracing::trace!(%link, %credit, "link_push");
    }

    async fn link_deliver(&self, link: LinkId, delivery: DeliveryKey, _message: Arc<Message>) {
        tracing::trace!(%link, ?delivery, "link_deliver");
    }

    async fn delivery_update(&self, delivery: DeliveryKey, disposition: Disposition, settled: bool) {
        tracing::trace!(?delivery, ?disposition, settled, "delivery_update");
    }
}

/// Fans a batch of outbound deliveries out to the bridge concurrently
/// rather than one `await` at a time, since each `link_deliver` call is
/// independent I/O-thread work (§6: "All handlers must be non-blocking").
pub async fn deliver_many(bridge: &dyn IoBridge, deliveries: Vec<(LinkId, DeliveryKey, Arc<Message>)>) {
    join_all(
        deliveries.into_iter().map(|(link, delivery, message)| bridge.link_deliver(link, delivery, message)),
    )
    .await;
}
