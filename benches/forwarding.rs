//! Forwarding-strategy throughput benchmarks (§4.2).

use std::collections::HashMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meshrouter_core::address::{Address, Semantics};
use meshrouter_core::connection::{Connection, ConnectionRole};
use meshrouter_core::delivery::DeliveryArena;
use meshrouter_core::domain_types::{AddressKey, DeliveryTagAllocator, MaskBit};
use meshrouter_core::forwarder::{self, RoutingTables};
use meshrouter_core::link::{Link, LinkDirection, LinkType};
use meshrouter_core::message::Message;

fn bench_anycast_closest_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("anycast_closest");

    for link_count in [1usize, 4, 16, 64] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("forward_one_message", link_count),
            &link_count,
            |b, &link_count| {
                b.iter_batched(
                    || {
                        let connection = Connection::new(ConnectionRole::Normal, true, 250);
                        let mut links = HashMap::new();
                        let mut connections = HashMap::new();
                        let mut address =
                            Address::new(AddressKey::try_new("bench").unwrap(), Semantics::AnycastClosest);
                        for _ in 0..link_count {
                            let mut link =
                                Link::new(connection.id(), LinkDirection::Outgoing, LinkType::Normal, 250);
                            link.first_attach();
                            link.second_attach();
                            address.add_consumer_link(link.id());
                            links.insert(link.id(), link);
                        }
                        connections.insert(connection.id(), connection);
                        (links, connections, address)
                    },
                    |(mut links, connections, mut address)| {
                        let mut deliveries = DeliveryArena::new();
                        let tag_alloc = DeliveryTagAllocator::default();
                        let router_nodes = HashMap::new();
                        let mut tables = RoutingTables {
                            links: &mut links,
                            connections: &connections,
                            deliveries: &mut deliveries,
                            self_bit: MaskBit::try_new(0).unwrap(),
                            tag_alloc: &tag_alloc,
                            router_nodes: &router_nodes,
                        };
                        let message = Arc::new(Message::new());
                        let fanout =
                            forwarder::forward(&mut tables, &mut address, message, None, None, false, None);
                        black_box(fanout);
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_anycast_closest_fanout);
criterion_main!(benches);
