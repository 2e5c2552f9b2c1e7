//! Branch resolution, multi-value labels and loop instrumentation.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use parking_lot::Mutex;
use riptide::ir::{BlockType, Op};
use riptide::numeric::NumOp::*;
use riptide::profile::BranchCounts;
use riptide::trap::Failure;
use riptide::{Config, FuncType, LoopReport, Module, Runtime, Val, ValType};

const I32: ValType = ValType::I32;

/// `sel(i)`: a three-entry `br_table` whose targets return 10, 11 and 12 and
/// whose default returns 99.
fn br_table_module() -> Module {
    single_func(
        "sel",
        &[I32],
        &[I32],
        vec![
            Op::Block(BlockType::Empty),
            Op::Block(BlockType::Empty),
            Op::Block(BlockType::Empty),
            Op::Block(BlockType::Empty),
            Op::LocalGet(0),
            Op::BrTable(vec![0, 1, 2], 3),
            Op::End,
            Op::I32Const(10),
            Op::Return,
            Op::End,
            Op::I32Const(11),
            Op::Return,
            Op::End,
            Op::I32Const(12),
            Op::Return,
            Op::End,
            Op::I32Const(99),
        ],
    )
}

/// `sum(n)` = n + (n - 1) + ... + 1, with `padding` dead-weight instructions
/// inside the loop body.
fn sum_module(padding: usize) -> Module {
    let mut body = vec![
        Op::Block(BlockType::Empty),
        Op::Loop(BlockType::Empty),
        Op::LocalGet(0),
        Op::Num(I32Eqz),
        Op::BrIf(1),
    ];
    for _ in 0..padding {
        body.extend([Op::I32Const(100_000), Op::Drop]);
    }
    body.extend([
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
    ]);
    let mut m = Module::new();
    let f = m.add_function(func("sum", &[I32], &[I32], &[I32], body));
    m.export("sum", f);
    m
}

// ── br_table ──────────────────────────────────────────────────────────────────

#[test]
fn br_table_selects_entries_in_range() {
    let mut inst = instantiate(&br_table_module());
    for (i, want) in [(0, 10), (1, 11), (2, 12)] {
        assert_eq!(inst.call("sel", &i32s(&[i])).unwrap(), i32s(&[want]), "index {i}");
    }
}

#[test]
fn br_table_out_of_range_takes_default() {
    let mut inst = instantiate(&br_table_module());
    for i in [3, 5, 1000, -1, i32::MIN] {
        assert_eq!(inst.call("sel", &i32s(&[i])).unwrap(), i32s(&[99]), "index {i}");
    }
}

#[test]
fn br_table_carries_values() {
    let m = single_func(
        "f",
        &[I32],
        &[I32],
        vec![
            Op::Block(BlockType::Value(I32)),
            Op::Block(BlockType::Value(I32)),
            Op::I32Const(5),
            Op::LocalGet(0),
            Op::BrTable(vec![0], 1),
            Op::End,
            Op::I32Const(100),
            Op::Num(I32Add),
            Op::End,
        ],
    );
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("f", &i32s(&[0])).unwrap(), i32s(&[105]));
    assert_eq!(inst.call("f", &i32s(&[1])).unwrap(), i32s(&[5]));
}

// ── Multi-value labels ────────────────────────────────────────────────────────

#[test]
fn block_params_are_consumed() {
    let mut m = Module::new();
    let ty = m.add_type(FuncType::new([I32, I32], [I32]));
    let f = m.add_function(func(
        "f",
        &[],
        &[I32],
        &[],
        vec![Op::I32Const(3), Op::I32Const(4), Op::Block(BlockType::Func(ty)), Op::Num(I32Add), Op::End],
    ));
    m.export("f", f);
    assert_eq!(run(&m, "f", &[]).unwrap(), i32s(&[7]));
}

#[test]
fn branch_drops_operands_below_the_label_values() {
    let mut m = Module::new();
    let ty = m.add_type(FuncType::new([], [I32, I32]));
    let f = m.add_function(func(
        "f",
        &[],
        &[I32],
        &[],
        vec![
            Op::Block(BlockType::Func(ty)),
            Op::I32Const(99),
            Op::I32Const(1),
            Op::I32Const(2),
            Op::Br(0),
            Op::End,
            Op::Num(I32Sub),
        ],
    ));
    m.export("f", f);
    assert_eq!(run(&m, "f", &[]).unwrap(), i32s(&[-1]));
}

#[test]
fn loop_params_feed_each_iteration() {
    // Counts down on the operand stack: loop (param i32) (result i32).
    let mut m = Module::new();
    let ty = m.add_type(FuncType::new([I32], [I32]));
    let f = m.add_function(func(
        "f",
        &[I32],
        &[I32],
        &[I32],
        vec![
            Op::LocalGet(0),
            Op::Loop(BlockType::Func(ty)),
            Op::LocalTee(1),
            Op::I32Const(1),
            Op::Num(I32Sub),
            Op::LocalGet(1),
            Op::I32Const(1),
            Op::Num(I32GtS),
            Op::BrIf(0),
            Op::End,
        ],
    ));
    m.export("f", f);
    assert_eq!(run(&m, "f", &i32s(&[10])).unwrap(), i32s(&[0]));
}

#[test]
fn branch_to_function_frame_returns() {
    let m = single_func(
        "f",
        &[I32],
        &[I32],
        vec![
            Op::I32Const(1),
            Op::LocalGet(0),
            Op::BrIf(0),
            Op::Drop,
            Op::I32Const(2),
        ],
    );
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("f", &i32s(&[1])).unwrap(), i32s(&[1]));
    assert_eq!(inst.call("f", &i32s(&[0])).unwrap(), i32s(&[2]));
}

#[test]
fn if_without_else_skips_body() {
    let m = single_func(
        "f",
        &[I32],
        &[I32],
        vec![
            Op::LocalGet(0),
            Op::If(BlockType::Empty),
            Op::I32Const(7),
            Op::LocalSet(0),
            Op::End,
            Op::LocalGet(0),
        ],
    );
    let mut inst = instantiate(&m);
    assert_eq!(inst.call("f", &i32s(&[0])).unwrap(), i32s(&[0]));
    assert_eq!(inst.call("f", &i32s(&[3])).unwrap(), i32s(&[7]));
}

#[test]
fn long_loop_bodies_branch_back_correctly() {
    let m = sum_module(60);
    assert_eq!(run(&m, "sum", &i32s(&[10])).unwrap(), i32s(&[55]));
}

// ── Instrumentation ───────────────────────────────────────────────────────────

#[test]
fn hot_loop_hook_reports_every_stride() {
    let reports: Arc<Mutex<Vec<LoopReport>>> = Arc::default();
    let sink = reports.clone();
    let config = Config::new().loop_report_stride(4).on_hot_loop(move |r| sink.lock().push(*r));
    let mut inst = Runtime::with_config(config).instantiate(&sum_module(0)).unwrap();
    assert_eq!(inst.call("sum", &i32s(&[10])).unwrap(), i32s(&[55]));

    let reports = reports.lock();
    let iterations: Vec<u64> = reports.iter().map(|r| r.iterations).collect();
    assert_eq!(iterations, vec![4, 8]);
    assert!(reports.iter().all(|r| r.func == 0 && r.offset == reports[0].offset));
}

#[test]
fn branch_profile_counts_outcomes() {
    let config = Config::new().branch_profiling(true);
    let mut inst = Runtime::with_config(config).instantiate(&sum_module(0)).unwrap();
    inst.call("sum", &i32s(&[10])).unwrap();

    let profile = inst.take_branch_profile().unwrap();
    let sites = profile.sites_of(0);
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].1, BranchCounts { taken: 1, not_taken: 10 });
    assert!(inst.branch_profile().unwrap().is_empty());
}

#[test]
fn branch_profile_is_off_by_default() {
    let mut inst = instantiate(&sum_module(0));
    inst.call("sum", &i32s(&[3])).unwrap();
    assert!(inst.branch_profile().is_none());
}

// ── Interruption ──────────────────────────────────────────────────────────────

#[test]
fn interrupt_cancels_a_spinning_loop() {
    let mut m = Module::new();
    let spin = m.add_function(func("spin", &[], &[], &[], vec![Op::Loop(BlockType::Empty), Op::Br(0), Op::End]));
    let one = m.add_function(func("one", &[], &[I32], &[], vec![Op::I32Const(1)]));
    m.export("spin", spin);
    m.export("one", one);

    let rt = Runtime::new();
    let mut inst = rt.instantiate(&m).unwrap();
    let handle = rt.interrupt_handle();
    let trigger = handle.clone();
    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        trigger.interrupt();
    });

    let err = inst.call("spin", &[]).unwrap_err();
    waker.join().unwrap();
    assert_eq!(err.failure(), Some(Failure::Cancelled));

    // The flag stays raised until cleared.
    assert_eq!(inst.call("one", &[]).unwrap_err().failure(), Some(Failure::Cancelled));
    handle.clear();
    assert_eq!(inst.call("one", &[]).unwrap(), vec![Val::I32(1)]);
}

#[test]
fn interrupt_reaches_every_instance_of_its_runtime() {
    let m = single_func("one", &[], &[I32], vec![Op::I32Const(1)]);
    let rt = Runtime::new();
    let mut idle = rt.instantiate(&m).unwrap();
    let mut other_runtime = instantiate(&m);

    let handle = rt.interrupt_handle();
    handle.interrupt();
    assert_eq!(idle.call("one", &[]).unwrap_err().failure(), Some(Failure::Cancelled));
    assert_eq!(rt.instantiate(&m).unwrap().call("one", &[]).unwrap_err().failure(), Some(Failure::Cancelled));
    assert_eq!(other_runtime.call("one", &[]).unwrap(), vec![Val::I32(1)]);

    handle.clear();
    assert_eq!(idle.call("one", &[]).unwrap(), vec![Val::I32(1)]);
}
