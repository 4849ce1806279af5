#![allow(unused)]
extern crate methodtable;

use criterion::{criterion_group, criterion_main, Criterion};
use methodtable::descriptor::{descriptor_size, field_offset, present_fields};
use methodtable::prelude::*;
use std::hint::black_box;

/// Descriptor carrying every optional field, so each lookup walks the full sequence
fn populated_header() -> DescriptorHeader {
    DescriptorHeader::new(TypeShape::Object { base_size: 48 }, ElementType::Class)
        .with_attributes(
            TypeFlags::HAS_DISPATCH_MAP
                | TypeFlags::HAS_FINALIZER
                | TypeFlags::HAS_SEALED_VTABLE_ENTRIES,
        )
        .vtable_slots(16)
        .interfaces(4)
        .dynamic(DynamicTypeFlags::all())
}

/// Benchmark the offset calculator and the accessors built on it.
///
/// The offset of a late field is computed by walking every earlier one, so the cost grows
/// with the number of present fields. This measures the worst case on a dynamic descriptor.
fn bench_field_offsets(c: &mut Criterion) {
    let registry = TypeRegistry::new(RegistryConfig::unchecked(Target::X64));
    let table = registry.begin(&populated_header()).unwrap().publish().unwrap();
    let prefix = *table.prefix();
    let dynamic = table.dynamic_type_flags();
    let target = registry.target();

    let mut group = c.benchmark_group("offsets");
    group.bench_function("field_offset_last", |b| {
        b.iter(|| {
            black_box(field_offset(
                black_box(&prefix),
                &target,
                &dynamic,
                DescriptorField::DynamicThreadStaticsIndex,
            ))
        });
    });
    group.bench_function("descriptor_size", |b| {
        b.iter(|| black_box(descriptor_size(black_box(&prefix), &target, &dynamic)));
    });
    group.bench_function("present_fields", |b| {
        b.iter(|| black_box(present_fields(black_box(&prefix), &target, &dynamic)));
    });
    group.bench_function("accessor_thread_statics_index", |b| {
        b.iter(|| black_box(table.dynamic_thread_statics_index()));
    });
    group.finish();
}

criterion_group!(benches, bench_field_offsets);
criterion_main!(benches);
