//! Symbol lookups through the VM:
//!   cargo bench --features sim --bench intern_benchmark
//!
//! `cached` measures the lifecycle's symbol cache, `protected` a full barrier round trip
//! into the runtime for every value.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rubygate::{ToRuby, VM, Value};

const NAMES: [&str; 8] = [
    "each", "map", "inject", "to_s", "inspect", "freeze", "frozen?", "respond_to?",
];

fn intern_benchmark(c: &mut Criterion) {
    let vm = VM::shared();
    vm.setup().expect("VM setup");

    let mut group = c.benchmark_group("intern");
    group.bench_function(BenchmarkId::new("cached", NAMES.len()), |b| {
        b.iter(|| {
            for name in NAMES {
                black_box(vm.get_id(black_box(name)).expect("intern"));
            }
        })
    });

    let numbers: Vec<Value> = (0_i64..8)
        .map(|n| n.to_ruby(vm).expect("integer"))
        .collect();
    group.bench_function(BenchmarkId::new("protected", numbers.len()), |b| {
        b.iter(|| {
            for &number in &numbers {
                black_box(vm.inspect(black_box(number)).expect("inspect"));
            }
        })
    });
    group.finish();
}

criterion_group!(benches, intern_benchmark);
criterion_main!(benches);
