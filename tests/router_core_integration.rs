//! End-to-end tests exercising `RouterCore` through its only public
//! surface — `Action` submission over the action channel — the way an
//! out-of-crate I/O driver would (§6 "Driver→core actions").

use std::sync::Arc;

use meshrouter_core::bitmask::RouterBitMask;
use meshrouter_core::core_engine::Action;
use meshrouter_core::domain_types::{AddressKey, MaskBit};
use meshrouter_core::message::Message;
use meshrouter_core::{RouterConfig, RouterCore};
use tokio::sync::mpsc;

fn bit(n: u8) -> MaskBit {
    MaskBit::try_new(n).unwrap()
}

#[tokio::test]
async fn mobile_advertisement_round_trip_through_the_action_channel() {
    // §8 invariant 5, driven through the public Action interface rather
    // than the crate-private apply() unit tests already cover.
    let (mut core, _general_rx) = RouterCore::new(bit(0));
    let (tx, rx) = mpsc::unbounded_channel();
    let key = AddressKey::try_new("mesh.wide.addr").unwrap();

    tx.send(Action::MobileAdded { address: key.clone(), bit: bit(5) }).unwrap();
    tx.send(Action::MobileRemoved { address: key.clone(), bit: bit(5) }).unwrap();
    drop(tx);

    core.run(rx).await;

    assert!(!core.address(&key).unwrap().rnodes().is_set(bit(5)));
    assert_eq!(core.collect_garbage(), 1);
    assert!(core.address(&key).is_none());
}

#[tokio::test]
async fn delivering_to_an_address_with_no_binding_is_released_not_queued() {
    // §7 "Unroutable": delivered via link_deliver_to, bypassing link
    // attach entirely.
    let (mut core, _general_rx) = RouterCore::new(bit(0));
    let (tx, rx) = mpsc::unbounded_channel();
    let address = AddressKey::try_new("nobody.home").unwrap();

    tx.send(Action::LinkDeliverTo { address: address.clone(), message: Arc::new(Message::new()) })
        .unwrap();
    drop(tx);

    core.run(rx).await;

    assert!(core.address(&address).is_none(), "an unroutable delivery must not create a binding");
}

#[tokio::test]
async fn multicast_once_forwards_through_a_neighbor_whose_valid_origins_allows_it() {
    // §4.2/§4.6, driven entirely through the public Action interface:
    // NeighborTopologyUpdated is the only way to populate route-table
    // entries, and MULTICAST_ONCE must consult a target's `valid_origins`
    // before counting it toward fanout. `LinkDeliverTo` resolves its
    // origin bit to 0 (this router is the ingress), so a neighbor whose
    // `valid_origins` includes bit 0 is a valid target.
    let (mut core, _general_rx) = RouterCore::new(bit(1));
    let (tx, rx) = mpsc::unbounded_channel();
    let key = AddressKey::try_new("mcast.allowed").unwrap();
    let neighbor = bit(4);

    tx.send(Action::MobileAdded { address: key.clone(), bit: neighbor }).unwrap();
    let mut valid_origins = RouterBitMask::empty();
    valid_origins.set(bit(0));
    tx.send(Action::NeighborTopologyUpdated {
        bit: neighbor,
        next_hop: Some(neighbor),
        neighbor_links: None,
        valid_origins,
    })
    .unwrap();
    tx.send(Action::LinkDeliverTo { address: key.clone(), message: Arc::new(Message::new()) })
        .unwrap();
    drop(tx);

    core.run(rx).await;

    assert_eq!(core.address(&key).unwrap().stats().transit.into_inner(), 1);
}

#[tokio::test]
async fn multicast_once_skips_a_neighbor_whose_valid_origins_disallows_it() {
    let (mut core, _general_rx) = RouterCore::new(bit(1));
    let (tx, rx) = mpsc::unbounded_channel();
    let key = AddressKey::try_new("mcast.blocked").unwrap();
    let neighbor = bit(4);

    tx.send(Action::MobileAdded { address: key.clone(), bit: neighbor }).unwrap();
    // valid_origins does not include bit 0, so this neighbor is not on the
    // spanning tree for messages this router itself originates.
    let mut valid_origins = RouterBitMask::empty();
    valid_origins.set(bit(9));
    tx.send(Action::NeighborTopologyUpdated {
        bit: neighbor,
        next_hop: Some(neighbor),
        neighbor_links: None,
        valid_origins,
    })
    .unwrap();
    tx.send(Action::LinkDeliverTo { address: key.clone(), message: Arc::new(Message::new()) })
        .unwrap();
    drop(tx);

    core.run(rx).await;

    assert_eq!(core.address(&key).unwrap().stats().transit.into_inner(), 0);
}

#[tokio::test]
async fn development_config_validates_and_seeds_a_usable_core() {
    let config = RouterConfig::development();
    config.validate().expect("development preset must be internally consistent");

    let self_bit = MaskBit::try_new(0).unwrap();
    let (core, _general_rx) = RouterCore::new(self_bit);
    assert!(core.address(&AddressKey::try_new("unseen").unwrap()).is_none());
}
