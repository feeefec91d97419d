use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use kestrel_engine::bytecode::{FunctionBuilder, FunctionDefinition};
use kestrel_engine::types::FieldDef;
use kestrel_engine::vm::gc::{GarbageCollector, GcOptions, RootSet};
use kestrel_engine::{Instruction, RuntimeConfig, TypeId, TypeProvider, Vm};

const HEAP_SIZE: usize = 16 * 1024 * 1024;

fn linked_class(types: &mut TypeProvider) -> TypeId {
    let node = types.declare_class("Node").unwrap();
    let int = types.int();
    types
        .define_class(node, vec![FieldDef::new("value", int), FieldDef::new("next", node)])
        .unwrap();
    node
}

/// Heap with `count` objects, every `keep_every`-th one rooted
fn populated(types: &TypeProvider, node: TypeId, count: usize, keep_every: usize) -> (GarbageCollector, RootSet) {
    let mut gc = GarbageCollector::new(HEAP_SIZE, GcOptions::default()).unwrap();
    let mut roots = RootSet::new();
    for i in 0..count {
        let address = gc.new_class(types, node).unwrap();
        if i % keep_every == 0 {
            roots.add_stack_root(address);
        }
    }
    (gc, roots)
}

fn bench_sweep(c: &mut Criterion) {
    let mut types = TypeProvider::new();
    let node = linked_class(&mut types);
    let mut group = c.benchmark_group("collect");

    for count in [1_000usize, 10_000, 100_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("mostly_garbage", count), &count, |b, &count| {
            b.iter_batched(
                || populated(&types, node, count, 10),
                |(mut gc, roots)| black_box(gc.collect(&types, &roots).unwrap()),
                BatchSize::LargeInput,
            );
        });
        group.bench_with_input(BenchmarkId::new("all_live", count), &count, |b, &count| {
            b.iter_batched(
                || populated(&types, node, count, 1),
                |(mut gc, roots)| black_box(gc.collect(&types, &roots).unwrap()),
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_compiled_churn(c: &mut Criterion) {
    // main allocates `n` nodes in a loop, keeping one, then collects
    let build = |n: i32| {
        let mut vm = Vm::new(RuntimeConfig {
            heap_size: HEAP_SIZE,
            ..RuntimeConfig::default()
        })
        .unwrap();
        let node = linked_class(vm.types_mut());
        let int = vm.types().int();
        let collect = vm.builtins().collect;

        let mut b = FunctionBuilder::new();
        let i = b.local(int);
        let keep = b.local(node);
        let top = b.label();
        let done = b.label();
        b.bind(top);
        b.emit(Instruction::LoadLocal(i));
        b.emit(Instruction::LoadInt(n));
        b.emit_branch(Instruction::BranchGreaterThanOrEqual, done);
        b.emit(Instruction::NewObject(node));
        b.emit(Instruction::StoreLocal(keep));
        b.emit(Instruction::LoadLocal(i));
        b.emit(Instruction::LoadInt(1));
        b.emit(Instruction::Add);
        b.emit(Instruction::StoreLocal(i));
        b.emit_branch(Instruction::Branch, top);
        b.bind(done);
        b.emit(Instruction::Call(collect));
        b.emit(Instruction::LoadLocal(i));
        b.emit(Instruction::Return);

        vm.add_function(FunctionDefinition::new("main", vec![], int), b.finish().unwrap())
            .unwrap();
        vm.load().unwrap();
        vm
    };

    c.bench_function("compiled_alloc_collect_10k", |b| {
        b.iter_batched(
            || build(10_000),
            |mut vm| black_box(vm.run_main().unwrap()),
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_sweep, bench_compiled_churn);
criterion_main!(benches);
