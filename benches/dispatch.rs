#![allow(unused)]
extern crate methodtable;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use methodtable::prelude::*;
use std::hint::black_box;

const INTERFACES: u16 = 16;
const SLOTS: u16 = 8;

/// Dispatch map with `INTERFACES * SLOTS` standard entries and a default for each interface
fn dispatch_map() -> DispatchMapBuilder {
    let mut map = DispatchMapBuilder::new();
    for interface in 0..INTERFACES {
        for slot in 0..SLOTS {
            map.standard(interface, slot, interface * SLOTS + slot);
        }
        map.default_impl(interface, SLOTS, INTERFACES * SLOTS + interface);
    }
    map
}

/// Benchmark interface method resolution against a populated dispatch map.
///
/// Resolution scans the standard partition before the default one, so the last interface's
/// default implementation is the slowest lookup.
fn bench_dispatch(c: &mut Criterion) {
    let registry = TypeRegistry::new(RegistryConfig::unchecked(Target::X64));
    let header = DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Class)
        .with_attributes(TypeFlags::HAS_DISPATCH_MAP)
        .vtable_slots(INTERFACES * SLOTS + INTERFACES);

    let map = dispatch_map();
    let mut builder = registry.begin(&header).unwrap();
    builder.set_dispatch_map(&map).unwrap();
    let table = builder.publish().unwrap();
    let entries = map.counts().instance() as u64;

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));
    group.bench_function("resolve_first", |b| {
        b.iter(|| {
            black_box(table.resolve_interface_method(
                black_box(0),
                black_box(0),
                DispatchKind::Instance,
            ))
        });
    });
    group.bench_function("resolve_last_default", |b| {
        b.iter(|| {
            black_box(table.resolve_interface_method(
                black_box(INTERFACES - 1),
                black_box(SLOTS),
                DispatchKind::Instance,
            ))
        });
    });
    group.bench_function("resolve_miss", |b| {
        b.iter(|| {
            black_box(table.resolve_interface_method(
                black_box(INTERFACES),
                black_box(0),
                DispatchKind::Instance,
            ))
        });
    });
    group.finish();

    let mut group = c.benchmark_group("dispatch_encode");
    group.throughput(Throughput::Elements(entries));
    group.bench_function("encode", |b| {
        b.iter(|| black_box(black_box(&map).encode().unwrap()));
    });
    group.finish();
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
