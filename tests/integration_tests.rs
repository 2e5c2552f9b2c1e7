//! End-to-end tests for the riptide interpreter.
//!
//! Each test builds a module with the builder API, instantiates it and calls
//! an export, exercising lowering and execution together.

mod common;

use std::sync::Arc;

use common::*;
use parking_lot::Mutex;
use riptide::global::GlobalType;
use riptide::ir::{BlockType, LoadOp, MemArg, Op, StoreOp};
use riptide::memory::MemoryType;
use riptide::module::ConstExpr;
use riptide::numeric::NumOp::*;
use riptide::trap::{Failure, Trap};
use riptide::{Config, FuncType, Module, Runtime, Val, ValType};

const I32: ValType = ValType::I32;
const I64: ValType = ValType::I64;
const F64: ValType = ValType::F64;

fn failure(r: riptide::Result<Vec<Val>>) -> Option<Failure> {
    r.err().and_then(|t| t.failure())
}

// ── Basic arithmetic ──────────────────────────────────────────────────────────

#[test]
fn test_i32_add() {
    let m = single_func("add", &[I32, I32], &[I32], vec![Op::LocalGet(0), Op::LocalGet(1), Op::Num(I32Add)]);
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("add", &i32s(&[10, 32])).unwrap(), i32s(&[42]));
    assert_eq!(inst.call("add", &i32s(&[i32::MAX, 1])).unwrap(), i32s(&[i32::MIN]));
}

#[test]
fn test_i32_sub_mul() {
    let m = single_func(
        "f",
        &[I32, I32],
        &[I32],
        vec![Op::LocalGet(0), Op::LocalGet(1), Op::Num(I32Sub), Op::I32Const(3), Op::Num(I32Mul)],
    );
    assert_eq!(run(&m, "f", &i32s(&[10, 4])).unwrap(), i32s(&[18]));
}

#[test]
fn test_division_traps() {
    let m = single_func("div", &[I32, I32], &[I32], vec![Op::LocalGet(0), Op::LocalGet(1), Op::Num(I32DivS)]);
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("div", &i32s(&[-7, 2])).unwrap(), i32s(&[-3]));
    assert_eq!(failure(inst.call("div", &i32s(&[5, 0]))), Some(Failure::IntDivideByZero));
    assert_eq!(failure(inst.call("div", &i32s(&[i32::MIN, -1]))), Some(Failure::IntOverflow));
    // A trap leaves the instance usable.
    assert_eq!(inst.call("div", &i32s(&[9, 3])).unwrap(), i32s(&[3]));
}

#[test]
fn test_rem_of_min_by_minus_one_is_zero() {
    let m = single_func("rem", &[I32, I32], &[I32], vec![Op::LocalGet(0), Op::LocalGet(1), Op::Num(I32RemS)]);
    assert_eq!(run(&m, "rem", &i32s(&[i32::MIN, -1])).unwrap(), i32s(&[0]));
}

#[test]
fn test_bitwise_and_shifts() {
    let m = single_func(
        "bits",
        &[I32],
        &[I32, I32, I32],
        vec![
            Op::LocalGet(0),
            Op::I32Const(0x0F),
            Op::Num(I32And),
            Op::LocalGet(0),
            Op::I32Const(33),
            Op::Num(I32Shl),
            Op::LocalGet(0),
            Op::Num(I32Popcnt),
        ],
    );
    assert_eq!(run(&m, "bits", &i32s(&[0xF3])).unwrap(), i32s(&[0x3, 0x1E6, 6]));
}

#[test]
fn test_i64_arithmetic() {
    let m = single_func("mul", &[I64, I64], &[I64], vec![Op::LocalGet(0), Op::LocalGet(1), Op::Num(I64Mul)]);
    assert_eq!(
        run(&m, "mul", &[Val::I64(1 << 40), Val::I64(3)]).unwrap(),
        vec![Val::I64(3 << 40)]
    );
}

#[test]
fn test_f64_sqrt_and_min() {
    let m = single_func(
        "f",
        &[F64, F64],
        &[F64, F64],
        vec![Op::LocalGet(0), Op::Num(F64Sqrt), Op::LocalGet(0), Op::LocalGet(1), Op::Num(F64Min)],
    );
    assert_eq!(
        run(&m, "f", &[Val::f64(16.0), Val::f64(-0.0)]).unwrap(),
        vec![Val::f64(4.0), Val::f64(-0.0)]
    );
}

#[test]
fn test_conversions() {
    let m = single_func(
        "conv",
        &[I32],
        &[I64, F64],
        vec![Op::LocalGet(0), Op::Num(I64ExtendI32U), Op::LocalGet(0), Op::Num(F64ConvertI32S)],
    );
    assert_eq!(run(&m, "conv", &i32s(&[-1])).unwrap(), vec![Val::I64(0xFFFF_FFFF), Val::f64(-1.0)]);
}

#[test]
fn test_trunc_of_nan() {
    let trapping = single_func("t", &[F64], &[I32], vec![Op::LocalGet(0), Op::Num(I32TruncF64S)]);
    let saturating = single_func("t", &[F64], &[I32], vec![Op::LocalGet(0), Op::Num(I32TruncSatF64S)]);
    assert_eq!(failure(run(&trapping, "t", &[Val::f64(f64::NAN)])), Some(Failure::InvalidConversionToInt));
    assert_eq!(run(&saturating, "t", &[Val::f64(f64::NAN)]).unwrap(), i32s(&[0]));
    assert_eq!(run(&saturating, "t", &[Val::f64(1e12)]).unwrap(), i32s(&[i32::MAX]));
}

// ── Locals, globals, select ───────────────────────────────────────────────────

#[test]
fn test_local_set_tee() {
    let mut m = Module::new();
    let f = m.add_function(func(
        "f",
        &[I32],
        &[I32],
        &[I32],
        vec![
            Op::LocalGet(0),
            Op::I32Const(2),
            Op::Num(I32Mul),
            Op::LocalTee(1),
            Op::LocalGet(1),
            Op::Num(I32Add),
        ],
    ));
    m.export("f", f);
    assert_eq!(run(&m, "f", &i32s(&[5])).unwrap(), i32s(&[20]));
}

#[test]
fn test_declared_locals_start_zeroed() {
    let mut m = Module::new();
    let f = m.add_function(func("f", &[], &[I64, F64], &[I64, F64], vec![Op::LocalGet(0), Op::LocalGet(1)]));
    m.export("f", f);
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("f", &[]).unwrap(), vec![Val::I64(0), Val::f64(0.0)]);
}

#[test]
fn test_short_and_wide_local_indices_agree() {
    // 300 locals push local 299 past the one-byte index form.
    let mut m = Module::new();
    let f = m.add_function(func(
        "f",
        &[I32],
        &[I32, I32],
        &[I32; 299],
        vec![Op::LocalGet(0), Op::LocalSet(299), Op::LocalGet(299), Op::LocalGet(0)],
    ));
    m.export("f", f);
    assert_eq!(run(&m, "f", &i32s(&[-77])).unwrap(), i32s(&[-77, -77]));
}

#[test]
fn test_select() {
    let m = single_func(
        "sel",
        &[I32, I32, I32],
        &[I32],
        vec![Op::LocalGet(0), Op::LocalGet(1), Op::LocalGet(2), Op::Select],
    );
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("sel", &i32s(&[1, 2, 1])).unwrap(), i32s(&[1]));
    assert_eq!(inst.call("sel", &i32s(&[1, 2, 0])).unwrap(), i32s(&[2]));
}

#[test]
fn test_mutable_global_counter() {
    let mut m = Module::new();
    let g = m.add_global(GlobalType::new(I32, true), ConstExpr::i32(40));
    let f = m.add_function(func(
        "bump",
        &[],
        &[I32],
        &[],
        vec![Op::GlobalGet(g), Op::I32Const(1), Op::Num(I32Add), Op::GlobalSet(g), Op::GlobalGet(g)],
    ));
    m.export("bump", f);
    let mut inst = instantiate(&m);
    inst.call("bump", &[]).unwrap();
    assert_eq!(inst.call("bump", &[]).unwrap(), i32s(&[42]));
    assert_eq!(inst.global(g), Some(Val::I32(42)));
}

#[test]
fn test_immutable_global_rejects_embedder_writes() {
    let mut m = Module::new();
    let g = m.add_global(GlobalType::new(I64, false), ConstExpr::i64(1));
    let mut inst = instantiate(&m);
    assert_eq!(inst.set_global(g, Val::I64(2)), Err(Trap::ImmutableGlobal(g)));
}

// ── Memory ────────────────────────────────────────────────────────────────────

fn with_memory(mut m: Module, min: u64, max: Option<u64>) -> Module {
    m.add_memory(MemoryType::new(min, max));
    m
}

#[test]
fn test_memory_store_load() {
    let m = with_memory(
        single_func(
            "rw",
            &[I32],
            &[I32],
            vec![
                Op::I32Const(8),
                Op::LocalGet(0),
                Op::Store(StoreOp::I32Store, MemArg::new(0)),
                Op::I32Const(8),
                Op::Load(LoadOp::I32Load, MemArg::new(0)),
            ],
        ),
        1,
        None,
    );
    assert_eq!(run(&m, "rw", &i32s(&[0x1234_5678])).unwrap(), i32s(&[0x1234_5678]));
}

#[test]
fn test_large_offsets_use_the_general_encoding() {
    let m = with_memory(
        single_func(
            "rw",
            &[],
            &[I32],
            vec![
                Op::I32Const(24),
                Op::I32Const(-3),
                Op::Store(StoreOp::I32Store, MemArg::new(1000)),
                Op::I32Const(1020),
                Op::Load(LoadOp::I32Load, MemArg::new(4)),
            ],
        ),
        1,
        None,
    );
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("rw", &[]).unwrap(), i32s(&[-3]));
    assert_eq!(inst.memory(0).unwrap().read_i32(1024).unwrap(), -3);
}

#[test]
fn test_narrow_loads_extend() {
    let m = with_memory(
        single_func(
            "narrow",
            &[],
            &[I32, I32, I64],
            vec![
                Op::I32Const(0),
                Op::I32Const(0x1FF),
                Op::Store(StoreOp::I32Store8, MemArg::new(0)),
                Op::I32Const(0),
                Op::Load(LoadOp::I32Load8S, MemArg::new(0)),
                Op::I32Const(0),
                Op::Load(LoadOp::I32Load8U, MemArg::new(0)),
                Op::I32Const(0),
                Op::Load(LoadOp::I64Load8S, MemArg::new(0)),
            ],
        ),
        1,
        None,
    );
    assert_eq!(run(&m, "narrow", &[]).unwrap(), vec![Val::I32(-1), Val::I32(255), Val::I64(-1)]);
}

#[test]
fn test_memory_out_of_bounds() {
    let m = with_memory(
        single_func("ld", &[I32], &[I32], vec![Op::LocalGet(0), Op::Load(LoadOp::I32Load, MemArg::new(0))]),
        1,
        None,
    );
    let mut inst = instantiate(&m);
    assert!(inst.call("ld", &i32s(&[65532])).is_ok());
    assert_eq!(failure(inst.call("ld", &i32s(&[65533]))), Some(Failure::OutOfBoundsMemoryAccess));
    assert_eq!(failure(inst.call("ld", &i32s(&[-1]))), Some(Failure::OutOfBoundsMemoryAccess));
}

#[test]
fn test_memory_grow() {
    let m = with_memory(
        single_func("grow", &[I32], &[I32, I32], vec![Op::LocalGet(0), Op::MemoryGrow(0), Op::MemorySize(0)]),
        1,
        Some(3),
    );
    let mut inst = instantiate(&m);
    inst.memory_mut(0).unwrap().write_i32(100, 7).unwrap();
    assert_eq!(inst.call("grow", &i32s(&[1])).unwrap(), i32s(&[1, 2]));
    assert_eq!(inst.call("grow", &i32s(&[2])).unwrap(), i32s(&[-1, 2]));
    assert_eq!(inst.call("grow", &i32s(&[1])).unwrap(), i32s(&[2, 3]));
    assert_eq!(inst.memory(0).unwrap().read_i32(100).unwrap(), 7);
}

#[test]
fn test_memory_grow_respects_config_limit() {
    let m = with_memory(single_func("grow", &[I32], &[I32], vec![Op::LocalGet(0), Op::MemoryGrow(0)]), 1, None);
    let rt = Runtime::with_config(Config::new().max_memory_pages(4));
    let mut inst = rt.instantiate(&m).unwrap();
    assert_eq!(inst.call("grow", &i32s(&[3])).unwrap(), i32s(&[1]));
    assert_eq!(inst.call("grow", &i32s(&[1])).unwrap(), i32s(&[-1]));
}

#[test]
fn test_data_segment() {
    let mut m = with_memory(
        single_func("read", &[], &[I32], vec![Op::I32Const(16), Op::Load(LoadOp::I32Load, MemArg::new(0))]),
        1,
        None,
    );
    m.add_data(0, ConstExpr::i32(16), vec![0xEF, 0xBE, 0xAD, 0xDE]);
    assert_eq!(run(&m, "read", &[]).unwrap(), i32s(&[0xDEAD_BEEFu32 as i32]));
}

#[test]
fn test_bulk_memory() {
    let mut m = Module::new();
    m.add_memory(MemoryType::new(1, None));
    let seg = m.add_passive_data(b"riptide".to_vec());
    let init = m.add_function(func(
        "init",
        &[I32, I32, I32],
        &[],
        &[],
        vec![Op::LocalGet(0), Op::LocalGet(1), Op::LocalGet(2), Op::MemoryInit { data: seg, memory: 0 }],
    ));
    let drop = m.add_function(func("drop", &[], &[], &[], vec![Op::DataDrop(seg)]));
    let copy = m.add_function(func(
        "copy",
        &[I32, I32, I32],
        &[],
        &[],
        vec![Op::LocalGet(0), Op::LocalGet(1), Op::LocalGet(2), Op::MemoryCopy { dst: 0, src: 0 }],
    ));
    let fill = m.add_function(func(
        "fill",
        &[I32, I32, I32],
        &[],
        &[],
        vec![Op::LocalGet(0), Op::LocalGet(1), Op::LocalGet(2), Op::MemoryFill(0)],
    ));
    for (name, f) in [("init", init), ("drop", drop), ("copy", copy), ("fill", fill)] {
        m.export(name, f);
    }
    let mut inst = instantiate(&m);

    inst.call("init", &i32s(&[10, 0, 7])).unwrap();
    inst.call("copy", &i32s(&[12, 10, 7])).unwrap();
    inst.call("fill", &i32s(&[10, '_' as i32, 2])).unwrap();
    let mut buf = [0u8; 9];
    inst.memory(0).unwrap().read(10, &mut buf).unwrap();
    assert_eq!(&buf, b"__riptide");

    assert_eq!(failure(inst.call("init", &i32s(&[0, 5, 3]))), Some(Failure::OutOfBoundsMemoryAccess));
    inst.call("drop", &[]).unwrap();
    assert_eq!(failure(inst.call("init", &i32s(&[0, 0, 1]))), Some(Failure::OutOfBoundsMemoryAccess));
    // Zero-length accesses at the very end are in bounds.
    inst.call("init", &i32s(&[65536, 0, 0])).unwrap();
    inst.call("fill", &i32s(&[65536, 0, 0])).unwrap();
    assert_eq!(failure(inst.call("fill", &i32s(&[65537, 0, 0]))), Some(Failure::OutOfBoundsMemoryAccess));
}

#[test]
fn test_memory64_addresses() {
    let mut m = single_func(
        "rw",
        &[I64],
        &[I64],
        vec![
            Op::LocalGet(0),
            Op::I64Const(-2),
            Op::Store(StoreOp::I64Store, MemArg::new(0)),
            Op::LocalGet(0),
            Op::Load(LoadOp::I64Load, MemArg::new(0)),
        ],
    );
    m.add_memory(MemoryType::new(1, None).index64());
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("rw", &[Val::I64(65528)]).unwrap(), vec![Val::I64(-2)]);
    assert_eq!(failure(inst.call("rw", &[Val::I64(-8)])), Some(Failure::OutOfBoundsMemoryAccess));
}

#[test]
fn test_multiple_memories() {
    let mut m = single_func(
        "mm",
        &[],
        &[I32],
        vec![
            Op::I32Const(0),
            Op::I32Const(77),
            Op::Store(StoreOp::I32Store, MemArg::new(4).memory(1)),
            Op::I32Const(0),
            Op::I32Const(4),
            Op::I32Const(4),
            Op::MemoryCopy { dst: 0, src: 1 },
            Op::I32Const(0),
            Op::Load(LoadOp::I32Load, MemArg::new(0)),
        ],
    );
    m.add_memory(MemoryType::new(1, None));
    m.add_memory(MemoryType::new(1, None));
    assert_eq!(run(&m, "mm", &[]).unwrap(), i32s(&[77]));
}

// ── Control flow ──────────────────────────────────────────────────────────────

#[test]
fn test_if_then_else() {
    let m = single_func(
        "abs",
        &[I32],
        &[I32],
        vec![
            Op::LocalGet(0),
            Op::I32Const(0),
            Op::Num(I32LtS),
            Op::If(BlockType::Value(I32)),
            Op::I32Const(0),
            Op::LocalGet(0),
            Op::Num(I32Sub),
            Op::Else,
            Op::LocalGet(0),
            Op::End,
        ],
    );
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("abs", &i32s(&[-5])).unwrap(), i32s(&[5]));
    assert_eq!(inst.call("abs", &i32s(&[7])).unwrap(), i32s(&[7]));
}

#[test]
fn test_block_br() {
    let m = single_func(
        "blk",
        &[],
        &[I32],
        vec![
            Op::Block(BlockType::Value(I32)),
            Op::I32Const(99),
            Op::Br(0),
            Op::I32Const(0),
            Op::End,
        ],
    );
    assert_eq!(run(&m, "blk", &[]).unwrap(), i32s(&[99]));
}

#[test]
fn test_br_if_not_taken_keeps_operands() {
    let m = single_func(
        "f",
        &[],
        &[I32],
        vec![
            Op::Block(BlockType::Value(I32)),
            Op::I32Const(10),
            Op::I32Const(3),
            Op::Num(I32Add),
            Op::I32Const(0),
            Op::BrIf(0),
            Op::End,
        ],
    );
    assert_eq!(run(&m, "f", &[]).unwrap(), i32s(&[13]));
}

#[test]
fn test_loop_sum() {
    let mut m = Module::new();
    let f = m.add_function(func(
        "sum",
        &[I32],
        &[I32],
        &[I32],
        vec![
            Op::Block(BlockType::Empty),
            Op::Loop(BlockType::Empty),
            Op::LocalGet(0),
            Op::Num(I32Eqz),
            Op::BrIf(1),
            Op::LocalGet(1),
            Op::LocalGet(0),
            Op::Num(I32Add),
            Op::LocalSet(1),
            Op::LocalGet(0),
            Op::I32Const(1),
            Op::Num(I32Sub),
            Op::LocalSet(0),
            Op::Br(0),
            Op::End,
            Op::End,
            Op::LocalGet(1),
        ],
    ));
    m.export("sum", f);
    assert_eq!(run(&m, "sum", &i32s(&[100])).unwrap(), i32s(&[5050]));
}

#[test]
fn test_unreachable() {
    let m = single_func("trap", &[], &[], vec![Op::Unreachable]);
    assert_eq!(run(&m, "trap", &[]), Err(Trap::from(Failure::Unreachable)));
}

// ── Calls ─────────────────────────────────────────────────────────────────────

#[test]
fn test_internal_call() {
    let mut m = Module::new();
    let mul = m.add_function(func("mul", &[I32, I32], &[I32], &[], vec![Op::LocalGet(0), Op::LocalGet(1), Op::Num(I32Mul)]));
    let square = m.add_function(func("square", &[I32], &[I32], &[], vec![Op::LocalGet(0), Op::LocalGet(0), Op::Call(mul)]));
    m.export("square", square);
    assert_eq!(run(&m, "square", &i32s(&[7])).unwrap(), i32s(&[49]));
}

#[test]
fn test_multi_value_call() {
    let mut m = Module::new();
    let divmod = m.add_function(func(
        "divmod",
        &[I32, I32],
        &[I32, I32],
        &[],
        vec![Op::LocalGet(0), Op::LocalGet(1), Op::Num(I32DivU), Op::LocalGet(0), Op::LocalGet(1), Op::Num(I32RemU)],
    ));
    let f = m.add_function(func(
        "f",
        &[],
        &[I32, I32, I32],
        &[],
        vec![Op::I32Const(1), Op::I32Const(17), Op::I32Const(5), Op::Call(divmod)],
    ));
    m.export("f", f);
    assert_eq!(run(&m, "f", &[]).unwrap(), i32s(&[1, 3, 2]));
}

fn countdown_module() -> Module {
    // down(n) = n == 0 ? 0 : down(n - 1) + 1
    let mut m = Module::new();
    let f = m.add_function(func(
        "down",
        &[I32],
        &[I32],
        &[],
        vec![
            Op::LocalGet(0),
            Op::Num(I32Eqz),
            Op::If(BlockType::Value(I32)),
            Op::I32Const(0),
            Op::Else,
            Op::LocalGet(0),
            Op::I32Const(1),
            Op::Num(I32Sub),
            Op::Call(0),
            Op::I32Const(1),
            Op::Num(I32Add),
            Op::End,
        ],
    ));
    m.export("down", f);
    m
}

#[test]
fn test_call_depth_limit() {
    let m = countdown_module();
    let rt = Runtime::with_config(Config::new().max_call_depth(100));
    let mut inst = rt.instantiate(&m).unwrap();
    assert_eq!(inst.call("down", &i32s(&[50])).unwrap(), i32s(&[50]));
    assert_eq!(failure(inst.call("down", &i32s(&[1000]))), Some(Failure::CallStackExhausted));
    assert_eq!(inst.call("down", &i32s(&[10])).unwrap(), i32s(&[10]));
}

#[test]
fn test_deep_recursion_within_default_limit() {
    assert_eq!(run(&countdown_module(), "down", &i32s(&[1000])).unwrap(), i32s(&[1000]));
}

#[test]
fn test_recursive_fibonacci() {
    let m = single_func(
        "fib",
        &[I32],
        &[I32],
        vec![
            Op::LocalGet(0),
            Op::I32Const(2),
            Op::Num(I32LtS),
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
    assert_eq!(run(&m, "fib", &i32s(&[20])).unwrap(), i32s(&[6765]));
}

// ── Host functions ────────────────────────────────────────────────────────────

#[test]
fn test_host_call() {
    let mut m = Module::new();
    let double = m.register_host("double", FuncType::new([I32], [I32]), |args, out| {
        out.push(Val::I32(args[0].as_i32().unwrap_or(0) * 2));
        Ok(())
    });
    let f = m.add_function(func("f", &[I32], &[I32], &[], vec![Op::LocalGet(0), Op::Call(double), Op::I32Const(1), Op::Num(I32Add)]));
    m.export("f", f);
    m.export("double", double);
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("f", &i32s(&[20])).unwrap(), i32s(&[41]));
    assert_eq!(inst.call("double", &i32s(&[4])).unwrap(), i32s(&[8]));
}

#[test]
fn test_host_multi_value() {
    let mut m = Module::new();
    let split = m.register_host("split", FuncType::new([I64], [I32, I32]), |args, out| {
        let v = args[0].as_i64().unwrap_or(0);
        out.extend([Val::I32((v >> 32) as i32), Val::I32(v as i32)]);
        Ok(())
    });
    let f = m.add_function(func("f", &[], &[I32], &[], vec![Op::I64Const(0x7_0000_0003), Op::Call(split), Op::Num(I32Sub)]));
    m.export("f", f);
    assert_eq!(run(&m, "f", &[]).unwrap(), i32s(&[4]));
}

#[test]
fn test_host_result_shape_is_checked() {
    let mut m = Module::new();
    let short = m.register_host("short", FuncType::new([], [I32, I32]), |_, out| {
        out.push(Val::I32(1));
        Ok(())
    });
    let wrong = m.register_host("wrong", FuncType::new([], [I32]), |_, out| {
        out.push(Val::I64(1));
        Ok(())
    });
    let a = m.add_function(func("a", &[], &[I32, I32], &[], vec![Op::Call(short)]));
    let b = m.add_function(func("b", &[], &[I32], &[], vec![Op::Call(wrong)]));
    m.export("a", a);
    m.export("b", b);
    let mut inst = instantiate(&m);
    assert_eq!(failure(inst.call("a", &[])), Some(Failure::InvalidMultiValueArity));
    assert_eq!(failure(inst.call("b", &[])), Some(Failure::InvalidTypeInMultiValue));
}

#[test]
fn test_host_error_propagates() {
    let mut m = Module::new();
    let boom = m.register_host("boom", FuncType::default(), |_, _| Err(Trap::HostError("boom".into())));
    let f = m.add_function(func("f", &[], &[], &[], vec![Op::Call(boom)]));
    m.export("f", f);
    assert_eq!(run(&m, "f", &[]), Err(Trap::HostError("boom".into())));
}

#[test]
fn test_host_calls_run_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let mut m = Module::new();
    let record = m.register_host("record", FuncType::new([I32], []), move |args, _| {
        sink.lock().push(args[0].as_i32().unwrap_or(-1));
        Ok(())
    });
    let f = m.add_function(func(
        "f",
        &[],
        &[],
        &[],
        vec![Op::I32Const(1), Op::Call(record), Op::I32Const(2), Op::Call(record), Op::I32Const(3), Op::Call(record)],
    ));
    m.export("f", f);
    run(&m, "f", &[]).unwrap();
    assert_eq!(*log.lock(), vec![1, 2, 3]);
}

// ── Embedding errors ──────────────────────────────────────────────────────────

#[test]
fn test_undefined_export() {
    let m = single_func("f", &[], &[], vec![]);
    assert_eq!(run(&m, "missing", &[]), Err(Trap::UndefinedExport("missing".into())));
}

#[test]
fn test_argument_type_mismatch() {
    let m = single_func("f", &[I32], &[], vec![]);
    let mut inst = instantiate(&m);
    assert!(matches!(inst.call("f", &[Val::I64(1)]), Err(Trap::TypeMismatch(_))));
    assert!(matches!(inst.call("f", &[]), Err(Trap::TypeMismatch(_))));
}
