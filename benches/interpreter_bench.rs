//! Interpreter benchmarks using Criterion.
//!
//! Run with: `cargo bench --bench interpreter_bench`
//!
//! The middle number of the three in each result is the measurement:
//!   fibonacci/fib(10)    time: [4.8 µs  >>4.9 µs<<  5.1 µs]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use riptide::ir::{BlockType, Function, LoadOp, MemArg, Op, StoreOp};
use riptide::memory::{Memory, MemoryType, PAGE_SIZE};
use riptide::numeric::NumOp::*;
use riptide::table::TableType;
use riptide::types::RefType;
use riptide::{FuncType, Module, Runtime, Val, ValType};

const I32: ValType = ValType::I32;

// ── Module builders ───────────────────────────────────────────────────────────

fn exported(m: &mut Module, name: &str, params: &[ValType], results: &[ValType], locals: &[ValType], body: Vec<Op>) -> u32 {
    let f = m.add_function(Function::new(name, FuncType::new(params, results), locals.to_vec(), body));
    m.export(name, f);
    f
}

fn fib_module() -> Module {
    let mut m = Module::new();
    exported(
        &mut m,
        "fib",
        &[I32],
        &[I32],
        &[],
        vec![
            Op::LocalGet(0),
            Op::I32Const(1),
            Op::Num(I32LeS),
            Op::If(BlockType::Value(I32)),
            Op::LocalGet(0),
            Op::Else,
            Op::LocalGet(0),
            Op::I32Const(1),
            Op::Num(I32Sub),
            Op::Call(0),
            Op::LocalGet(0),
            Op::I32Const(2),
            Op::Num(I32Sub),
            Op::Call(0),
            Op::Num(I32Add),
            Op::End,
        ],
    );
    m
}

fn add_module() -> Module {
    let mut m = Module::new();
    exported(&mut m, "add", &[I32, I32], &[I32], &[], vec![Op::LocalGet(0), Op::LocalGet(1), Op::Num(I32Add)]);
    m
}

fn host_call_module() -> Module {
    let mut m = Module::new();
    let echo = m.register_host("echo", FuncType::new([I32], [I32]), |args, out| {
        out.push(args[0].clone());
        Ok(())
    });
    exported(&mut m, "call_host", &[I32], &[I32], &[], vec![Op::LocalGet(0), Op::Call(echo)]);
    m
}

/// `fill_sum(n)`: stores `i` at word `i` for `i < n`, then sums them back.
fn memory_loop_module() -> Module {
    let mut m = Module::new();
    m.add_memory(MemoryType::new(1, None));
    let counted = |body: Vec<Op>| {
        let mut ops = vec![
            Op::I32Const(0),
            Op::LocalSet(1),
            Op::Block(BlockType::Empty),
            Op::Loop(BlockType::Empty),
            Op::LocalGet(1),
            Op::LocalGet(0),
            Op::Num(I32GeU),
            Op::BrIf(1),
        ];
        ops.extend(body);
        ops.extend([
            Op::LocalGet(1),
            Op::I32Const(1),
            Op::Num(I32Add),
            Op::LocalSet(1),
            Op::Br(0),
            Op::End,
            Op::End,
        ]);
        ops
    };
    let mut body = counted(vec![
        Op::LocalGet(1),
        Op::I32Const(2),
        Op::Num(I32Shl),
        Op::LocalGet(1),
        Op::Store(StoreOp::I32Store, MemArg::new(0)),
    ]);
    body.extend(counted(vec![
        Op::LocalGet(2),
        Op::LocalGet(1),
        Op::I32Const(2),
        Op::Num(I32Shl),
        Op::Load(LoadOp::I32Load, MemArg::new(0)),
        Op::Num(I32Add),
        Op::LocalSet(2),
    ]));
    body.push(Op::LocalGet(2));
    exported(&mut m, "fill_sum", &[I32], &[I32], &[I32, I32], body);
    m
}

/// `dispatch(x, slot)` through a four-entry table of unary functions.
fn indirect_module() -> Module {
    let mut m = Module::new();
    let unary = m.add_type(FuncType::new([I32], [I32]));
    let funcs: Vec<u32> = (0..4)
        .map(|k| {
            m.add_function(Function::new(
                format!("f{k}"),
                FuncType::new([I32], [I32]),
                vec![],
                vec![Op::LocalGet(0), Op::I32Const(k), Op::Num(I32Add)],
            ))
        })
        .collect();
    m.add_table(TableType::new(RefType::Func, 4, None));
    m.add_func_elements(0, 0, &funcs);
    exported(
        &mut m,
        "dispatch",
        &[I32, I32],
        &[I32],
        &[],
        vec![Op::LocalGet(0), Op::LocalGet(1), Op::CallIndirect { ty: unary, table: 0 }],
    );
    m
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_fibonacci(c: &mut Criterion) {
    let module = fib_module();
    let rt = Runtime::new();
    let mut group = c.benchmark_group("fibonacci");
    for n in [10u32, 20, 25] {
        group.bench_with_input(BenchmarkId::new("fib", n), &n, |b, &n| {
            let mut inst = rt.instantiate(&module).unwrap();
            b.iter(|| black_box(inst.call("fib", &[Val::I32(black_box(n as i32))]).unwrap()));
        });
    }
    group.finish();
}

fn bench_simple_call(c: &mut Criterion) {
    let module = add_module();
    let rt = Runtime::new();
    let mut inst = rt.instantiate(&module).unwrap();
    c.bench_function("simple_call/add(3,4)", |b| {
        b.iter(|| black_box(inst.call("add", &[Val::I32(black_box(3)), Val::I32(black_box(4))]).unwrap()))
    });
}

fn bench_host_call(c: &mut Criterion) {
    let module = host_call_module();
    let rt = Runtime::new();
    let mut inst = rt.instantiate(&module).unwrap();
    c.bench_function("host_call/round_trip", |b| {
        b.iter(|| black_box(inst.call("call_host", &[Val::I32(black_box(42))]).unwrap()))
    });
}

fn bench_indirect_call(c: &mut Criterion) {
    let module = indirect_module();
    let rt = Runtime::new();
    let mut inst = rt.instantiate(&module).unwrap();
    let mut slot = 0;
    c.bench_function("call_indirect/dispatch", |b| {
        b.iter(|| {
            slot = (slot + 1) & 3;
            black_box(inst.call("dispatch", &[Val::I32(black_box(1)), Val::I32(slot)]).unwrap())
        })
    });
}

fn bench_memory_loop(c: &mut Criterion) {
    let module = memory_loop_module();
    let rt = Runtime::new();
    let mut inst = rt.instantiate(&module).unwrap();
    let mut group = c.benchmark_group("memory_loop");
    for n in [256i32, 4096] {
        group.bench_with_input(BenchmarkId::new("fill_sum", n), &n, |b, &n| {
            b.iter(|| black_box(inst.call("fill_sum", &[Val::I32(black_box(n))]).unwrap()))
        });
    }
    group.finish();
}

fn bench_cold_start(c: &mut Criterion) {
    let rt = Runtime::new();
    let mut group = c.benchmark_group("cold_start");

    let empty_module = Module::new();
    let fib = fib_module();
    let indirect = indirect_module();

    group.bench_function("empty_module", |b| b.iter(|| black_box(rt.instantiate(&empty_module).unwrap())));
    group.bench_function("fib_module", |b| b.iter(|| black_box(rt.instantiate(&fib).unwrap())));
    group.bench_function("table_module", |b| b.iter(|| black_box(rt.instantiate(&indirect).unwrap())));

    group.finish();
}

fn bench_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory");

    group.bench_function("write_i32", |b| {
        let mut m = Memory::new(MemoryType::new(1, None)).unwrap();
        let mut offset = 0u64;
        b.iter(|| {
            m.write_i32(black_box(offset % (PAGE_SIZE - 4)), black_box(0x0EAD_BEEF)).unwrap();
            offset = offset.wrapping_add(4);
        })
    });

    group.bench_function("read_i32", |b| {
        let m = Memory::new(MemoryType::new(1, None)).unwrap();
        let mut offset = 0u64;
        b.iter(|| {
            black_box(m.read_i32(black_box(offset % (PAGE_SIZE - 4))).unwrap());
            offset = offset.wrapping_add(4);
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_fibonacci,
    bench_simple_call,
    bench_host_call,
    bench_indirect_call,
    bench_memory_loop,
    bench_cold_start,
    bench_memory,
);
criterion_main!(benches);
