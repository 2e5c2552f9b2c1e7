//! The dispatch loop.
//!
//! One `match` on the opcode byte per instruction; the `0xFC`, `0xFD` and
//! `0xFE` families dispatch on a second `match`. Wasm-to-wasm calls push a
//! [`Frame`] and continue in the same loop, so guest recursion depth is bounded
//! by [`Config::max_call_depth`](crate::Config::max_call_depth) and never by
//! the host stack.
//!
//! Registers: `pc` is a byte offset into the current body, `bp` the first
//! local of the current activation, `sp` the first free slot. The operand
//! area of an activation starts at `bp + num_locals`.

use std::mem;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::bytecode::reader::{read_bytes16, read_i32, read_label, read_memarg, read_u128, read_u16, read_u32, read_u64};
use crate::bytecode::{vector as vop, *};
use crate::compiler::CompiledFunc;
use crate::config::LoopReport;
use crate::instance::{check_host_results, InstanceData};
use crate::memory::{AtomicOp, Memory};
use crate::numeric::{self, NumOp};
use crate::stack::ValueStack;
use crate::table::Table;
use crate::trap::{Failure, Result, Trap};
use crate::types::{FuncInst, FuncKind, FuncRef, Ref, Val};
use crate::vector::{self, LaneOp, LaneWidth, SimdLoadOp, SimdOp};

/// A suspended caller.
pub(crate) struct Frame {
    func: Arc<CompiledFunc>,
    /// Where the caller resumes.
    pc: usize,
    bp: usize,
    loops: u64,
}

/// How long a cross-instance call waits for its callee's lock between
/// interrupt polls.
const LOCK_SLICE: Duration = Duration::from_millis(10);

const I32_ADD: u8 = NumOp::I32Add.code() as u8;
const I32_SUB: u8 = NumOp::I32Sub.code() as u8;
const I32_LT_S: u8 = NumOp::I32LtS.code() as u8;

#[cold]
fn bad_opcode(op: u8, pc: usize) -> Trap {
    Trap::internal(format!("undecodable opcode {op:#04x} at offset {pc}"))
}

#[cold]
fn unknown(what: &str, index: u32) -> Trap {
    Trap::internal(format!("unknown {what} {index}"))
}

/// Lands on a label: keeps the top `arity` values, moved down to the
/// continuation height, and discards everything between. Returns the new `sp`.
#[inline(always)]
fn land(stack: &mut ValueStack, label: Label, operands: usize, sp: usize, refs: bool) -> usize {
    let target = operands + label.height as usize;
    let arity = label.arity as usize;
    let new_sp = target + arity;
    if sp != new_sp {
        let from = sp - arity;
        if label.kind == LABEL_PRIMITIVE {
            for i in 0..arity {
                stack.set_bits(target + i, stack.bits(from + i));
            }
            if refs {
                stack.clear_refs(target, sp);
            }
        } else {
            for i in 0..arity {
                stack.move_slot(from + i, target + i);
            }
            stack.clear_refs(new_sp, sp);
        }
    }
    new_sp
}

/// Two distinct elements of `v`, the first mutably.
fn pair_mut<T>(v: &mut [T], a: usize, b: usize) -> (&mut T, &T) {
    if a < b {
        let (lo, hi) = v.split_at_mut(b);
        (&mut lo[a], &hi[0])
    } else {
        let (lo, hi) = v.split_at_mut(a);
        (&mut hi[0], &lo[b])
    }
}

// ── Scalar memory access ─────────────────────────────────────────────────────

fn load_value(mem: &Memory, op: u8, index: u64, offset: u64) -> Result<u128> {
    Ok(match op {
        I32_LOAD | F32_LOAD => u32::from_le_bytes(mem.load(index, offset)?) as u128,
        I64_LOAD | F64_LOAD => u64::from_le_bytes(mem.load(index, offset)?) as u128,
        I32_LOAD8_S => mem.load::<1>(index, offset)?[0] as i8 as i32 as u32 as u128,
        I32_LOAD8_U | I64_LOAD8_U => mem.load::<1>(index, offset)?[0] as u128,
        I32_LOAD16_S => i16::from_le_bytes(mem.load(index, offset)?) as i32 as u32 as u128,
        I32_LOAD16_U | I64_LOAD16_U => u16::from_le_bytes(mem.load(index, offset)?) as u128,
        I64_LOAD8_S => mem.load::<1>(index, offset)?[0] as i8 as i64 as u64 as u128,
        I64_LOAD16_S => i16::from_le_bytes(mem.load(index, offset)?) as i64 as u64 as u128,
        I64_LOAD32_S => i32::from_le_bytes(mem.load(index, offset)?) as i64 as u64 as u128,
        I64_LOAD32_U => u32::from_le_bytes(mem.load(index, offset)?) as u128,
        _ => return Err(bad_opcode(op, 0)),
    })
}

fn store_value(mem: &mut Memory, op: u8, index: u64, offset: u64, bits: u128) -> Result<()> {
    match op {
        I32_STORE | F32_STORE | I64_STORE32 => mem.store(index, offset, (bits as u32).to_le_bytes()),
        I64_STORE | F64_STORE => mem.store(index, offset, (bits as u64).to_le_bytes()),
        I32_STORE8 | I64_STORE8 => mem.store(index, offset, [bits as u8]),
        I32_STORE16 | I64_STORE16 => mem.store(index, offset, (bits as u16).to_le_bytes()),
        _ => Err(bad_opcode(op, 0)),
    }
}

/// Reads `bytes` (1, 2, 4 or 8) little-endian bytes, zero-extended.
fn load_raw(mem: &Memory, index: u64, offset: u64, bytes: u32) -> Result<u64> {
    Ok(match bytes {
        1 => mem.load::<1>(index, offset)?[0] as u64,
        2 => u16::from_le_bytes(mem.load(index, offset)?) as u64,
        4 => u32::from_le_bytes(mem.load(index, offset)?) as u64,
        _ => u64::from_le_bytes(mem.load(index, offset)?),
    })
}

fn store_raw(mem: &mut Memory, index: u64, offset: u64, bytes: u32, v: u64) -> Result<()> {
    match bytes {
        1 => mem.store(index, offset, [v as u8]),
        2 => mem.store(index, offset, (v as u16).to_le_bytes()),
        4 => mem.store(index, offset, (v as u32).to_le_bytes()),
        _ => mem.store(index, offset, v.to_le_bytes()),
    }
}

impl InstanceData {
    /// Runs `func` with `args` on a fresh stack and returns its results.
    pub(crate) fn invoke(&mut self, func: Arc<CompiledFunc>, args: &[Val]) -> Result<Vec<Val>> {
        self.frames.clear();
        let outcome = self.enter(&func, args).and_then(|()| self.run(func.clone()));
        match outcome {
            Ok(()) => Ok(func
                .ty
                .results
                .iter()
                .enumerate()
                .map(|(i, &ty)| {
                    let r = self.stack.take_ref(i);
                    Val::from_slot(ty, self.stack.bits(i), r)
                })
                .collect()),
            Err(trap) => {
                self.stack.reset();
                self.frames.clear();
                Err(trap)
            }
        }
    }

    fn enter(&mut self, func: &CompiledFunc, args: &[Val]) -> Result<()> {
        self.stack.ensure(func.num_locals + func.max_stack, self.config.max_stack_slots)?;
        for (i, arg) in args.iter().enumerate() {
            let (bits, r) = arg.clone().into_slot();
            self.stack.set_bits(i, bits);
            self.stack.set_ref(i, r);
        }
        self.stack.zero(args.len(), func.num_locals);
        self.poll_interrupt()
    }

    #[inline]
    fn poll_interrupt(&self) -> Result<()> {
        if self.interrupt.load(Ordering::Relaxed) {
            debug!(instance = self.id, "activation cancelled");
            return Err(Trap::with_detail(Failure::Cancelled, "interrupted"));
        }
        Ok(())
    }

    /// Calls host function `func` with the top `params` slots as arguments.
    /// Returns the new `sp`.
    fn call_host(&mut self, func: &FuncInst, sp: usize) -> Result<usize> {
        let FuncKind::Host(host) = &func.kind else {
            return Err(Trap::internal("host call to a wasm function"));
        };
        let ty = &func.ty;
        let bp = sp - ty.params.len();

        let mut args = mem::take(&mut self.host_args);
        args.clear();
        for (i, &t) in ty.params.iter().enumerate() {
            let r = self.stack.take_ref(bp + i);
            args.push(Val::from_slot(t, self.stack.bits(bp + i), r));
        }
        let mut results = mem::take(&mut self.host_results);
        results.clear();

        trace!(params = args.len(), results = ty.results.len(), "host call");
        let outcome = host(&args, &mut results).and_then(|()| check_host_results(ty, &results));
        args.clear();
        self.host_args = args;
        if let Err(trap) = outcome {
            results.clear();
            self.host_results = results;
            return Err(trap);
        }

        let n = results.len();
        match n {
            0 => {}
            1 => {
                if let Some(v) = results.pop() {
                    let (bits, r) = v.into_slot();
                    self.stack.set_bits(bp, bits);
                    self.stack.set_ref(bp, r);
                }
            }
            _ => {
                for (i, v) in results.drain(..).enumerate() {
                    let (bits, r) = v.into_slot();
                    self.stack.set_bits(bp + i, bits);
                    self.stack.set_ref(bp + i, r);
                }
            }
        }
        self.host_results = results;
        Ok(bp + n)
    }

    /// Calls wasm function `index` of another instance with the top `params`
    /// slots as arguments. The callee runs on its own stack under its own
    /// lock; results are moved back into this stack. Returns the new `sp`.
    fn call_foreign(
        &mut self,
        func: &FuncInst,
        owner: &Weak<Mutex<InstanceData>>,
        instance: u64,
        index: u32,
        sp: usize,
    ) -> Result<usize> {
        if self.callers.contains(&instance) {
            return Err(Trap::InstanceBusy(instance));
        }
        let owner = owner.upgrade().ok_or(Trap::InstanceDropped(instance))?;
        let mut callee = loop {
            if let Some(guard) = owner.try_lock_for(LOCK_SLICE) {
                break guard;
            }
            self.poll_interrupt()?;
        };
        let body = callee.code.get(index as usize).cloned().flatten().ok_or_else(|| unknown("function body", index))?;

        let ty = &func.ty;
        let bp = sp - ty.params.len();
        let mut args = mem::take(&mut self.host_args);
        args.clear();
        for (i, &t) in ty.params.iter().enumerate() {
            let r = self.stack.take_ref(bp + i);
            args.push(Val::from_slot(t, self.stack.bits(bp + i), r));
        }

        trace!(from = self.id, to = instance, func = index, "cross-instance call");
        callee.callers.clear();
        callee.callers.extend_from_slice(&self.callers);
        callee.callers.push(self.id);
        let outcome = callee.invoke(body, &args);
        callee.callers.clear();
        drop(callee);
        args.clear();
        self.host_args = args;

        let results = outcome?;
        let n = results.len();
        for (i, v) in results.into_iter().enumerate() {
            let (bits, r) = v.into_slot();
            self.stack.set_bits(bp + i, bits);
            self.stack.set_ref(bp + i, r);
        }
        Ok(bp + n)
    }

    /// Resolves `call_indirect` through `table` at element `index`.
    fn resolve_indirect(&self, ty: u32, table: u32, index: u32) -> Result<FuncRef> {
        let table = self.tables.get(table as usize).ok_or_else(|| unknown("table", table))?;
        let func = match table.element(index) {
            None => {
                return Err(Trap::with_detail(
                    Failure::UndefinedElement,
                    format!("Element index '{index}' out of table bounds."),
                ))
            }
            Some(None) => {
                return Err(Trap::with_detail(
                    Failure::UninitializedElement,
                    format!("Table element at index {index} is uninitialized."),
                ))
            }
            Some(Some(Ref::Func(f))) => f,
            Some(Some(Ref::Extern(_))) => return Err(Trap::internal("extern reference in a call table")),
        };
        let expected = *self.type_classes.get(ty as usize).ok_or_else(|| unknown("type", ty))?;
        let class = func.inst().class;
        let same = if class.universe == expected.universe {
            class.id == expected.id
        } else {
            self.types.get(ty as usize).is_some_and(|t| *t == func.inst().ty)
        };
        if !same {
            return Err(Trap::with_detail(
                Failure::IndirectCallTypeMismatch,
                format!("element {index} has type {:?}", func.inst().ty),
            ));
        }
        Ok(func.clone())
    }

    fn memory_at(&self, index: u32) -> Result<&Memory> {
        self.memories.get(index as usize).ok_or_else(|| unknown("memory", index))
    }

    fn memory_at_mut(&mut self, index: u32) -> Result<&mut Memory> {
        self.memories.get_mut(index as usize).ok_or_else(|| unknown("memory", index))
    }

    fn table_at(&mut self, index: u32) -> Result<&mut Table> {
        self.tables.get_mut(index as usize).ok_or_else(|| unknown("table", index))
    }

    // ── Main loop ────────────────────────────────────────────────────────────

    /// Executes until the entry activation returns. Its results are left in
    /// slots `0..results`.
    fn run(&mut self, entry: Arc<CompiledFunc>) -> Result<()> {
        let mut func = entry;
        let mut pc = 0usize;
        let mut bp = 0usize;
        let mut sp = func.num_locals;
        let mut loops = 0u64;
        let loop_mask = self.config.loop_report_mask();

        'outer: loop {
            let f = func.clone();
            let code: &[u8] = &f.code;
            let operands = bp + f.num_locals;
            let refs = f.uses_refs;

            // ── Stack macros ─────────────────────────────────────────────────
            macro_rules! pop_u32 {
                () => {{
                    sp -= 1;
                    self.stack.u32(sp)
                }};
            }
            macro_rules! pop_u64 {
                () => {{
                    sp -= 1;
                    self.stack.u64(sp)
                }};
            }
            macro_rules! push_bits {
                ($v:expr) => {{
                    let v = $v;
                    self.stack.set_bits(sp, v);
                    sp += 1;
                }};
            }
            macro_rules! record {
                ($taken:expr) => {
                    if let Some(p) = &mut self.profile {
                        p.record(f.index, pc, $taken);
                    }
                };
            }

            // ── Call macros ──────────────────────────────────────────────────
            macro_rules! enter_wasm {
                ($callee:expr, $next:expr) => {{
                    let callee: Arc<CompiledFunc> = $callee;
                    if self.frames.len() + 2 > self.config.max_call_depth {
                        return Err(Trap::with_detail(
                            Failure::CallStackExhausted,
                            format!("call depth exceeds {}", self.config.max_call_depth),
                        ));
                    }
                    let new_bp = sp - callee.num_params;
                    self.stack.ensure(new_bp + callee.num_locals + callee.max_stack, self.config.max_stack_slots)?;
                    self.stack.zero(new_bp + callee.num_params, new_bp + callee.num_locals);
                    self.poll_interrupt()?;
                    sp = new_bp + callee.num_locals;
                    let caller = mem::replace(&mut func, callee);
                    self.frames.push(Frame { func: caller, pc: $next, bp, loops });
                    bp = new_bp;
                    pc = 0;
                    loops = 0;
                    continue 'outer;
                }};
            }
            macro_rules! dispatch {
                ($target:expr, $next:expr) => {{
                    let target: FuncRef = $target;
                    match &target.inst().kind {
                        FuncKind::Wasm { instance, index, .. } if *instance == self.id => {
                            let body = self.code.get(*index as usize).cloned().flatten();
                            match body {
                                Some(body) => enter_wasm!(body, $next),
                                None => return Err(unknown("function body", *index)),
                            }
                        }
                        FuncKind::Wasm { instance, index, owner } => {
                            sp = self.call_foreign(target.inst(), owner, *instance, *index, sp)?;
                            pc = $next;
                        }
                        FuncKind::Host(_) => {
                            sp = self.call_host(target.inst(), sp)?;
                            pc = $next;
                        }
                    }
                }};
            }

            loop {
                let op = code[pc];
                match op {
                    // ── Control ──────────────────────────────────────────────
                    UNREACHABLE => return Err(Failure::Unreachable.into()),
                    NOP => pc += 1,
                    LABEL_U8 | LABEL_U16 | LABEL_I32 => {
                        let (label, next) = read_label(code, pc);
                        sp = land(&mut self.stack, label, operands, sp, refs);
                        pc = next;
                    }
                    LOOP => {
                        loops += 1;
                        self.poll_interrupt()?;
                        if loops & loop_mask == 0 {
                            if let Some(hook) = &self.config.on_hot_loop {
                                let report = LoopReport { func: f.index, offset: pc as u32, iterations: loops };
                                trace!(func = f.index, offset = pc, iterations = loops, "hot loop");
                                hook(&report);
                            }
                        }
                        pc += 1;
                    }
                    IF => {
                        sp -= 1;
                        let taken = self.stack.i32(sp) != 0;
                        record!(taken);
                        pc = if taken { pc + 5 } else { jump(code, pc, pc + 1) };
                    }
                    ELSE => pc = jump(code, pc, pc + 1),
                    BR_U8 => pc -= code[pc + 1] as usize,
                    BR_I32 => pc = jump(code, pc, pc + 1),
                    BR_IF_U8 | BR_IF_I32 => {
                        sp -= 1;
                        let taken = self.stack.i32(sp) != 0;
                        record!(taken);
                        pc = match (taken, op) {
                            (false, BR_IF_U8) => pc + 2,
                            (false, _) => pc + 5,
                            (true, BR_IF_U8) => pc - code[pc + 1] as usize,
                            (true, _) => jump(code, pc, pc + 1),
                        };
                    }
                    BR_TABLE_U8 | BR_TABLE_I32 => {
                        let (n, entries) = if op == BR_TABLE_U8 {
                            (code[pc + 1] as u32, pc + 2)
                        } else {
                            (read_u32(code, pc + 1), pc + 5)
                        };
                        let index = pop_u32!().min(n - 1);
                        pc = jump(code, pc, entries + 4 * index as usize);
                    }
                    RETURN => {
                        let n = f.ty.results.len();
                        let from = sp - n;
                        if from != bp {
                            for i in 0..n {
                                if refs {
                                    self.stack.move_slot(from + i, bp + i);
                                } else {
                                    self.stack.set_bits(bp + i, self.stack.bits(from + i));
                                }
                            }
                        }
                        if refs {
                            self.stack.clear_refs(bp + n, sp);
                        }
                        sp = bp + n;
                        match self.frames.pop() {
                            Some(frame) => {
                                func = frame.func;
                                pc = frame.pc;
                                bp = frame.bp;
                                loops = frame.loops;
                                continue 'outer;
                            }
                            None => return Ok(()),
                        }
                    }
                    CALL_U8 | CALL_I32 => {
                        let (callee, next) = if op == CALL_U8 {
                            (code[pc + 1] as u32, pc + 2)
                        } else {
                            (read_u32(code, pc + 1), pc + 5)
                        };
                        match self.code.get(callee as usize).cloned().flatten() {
                            Some(body) => enter_wasm!(body, next),
                            None => {
                                let target = self.functions.get(callee as usize).cloned();
                                let target = target.ok_or_else(|| unknown("function", callee))?;
                                sp = self.call_host(target.inst(), sp)?;
                                pc = next;
                            }
                        }
                    }
                    CALL_INDIRECT_U8 | CALL_INDIRECT_I32 => {
                        let (ty, table, next) = if op == CALL_INDIRECT_U8 {
                            (code[pc + 1] as u32, code[pc + 2] as u32, pc + 3)
                        } else {
                            (read_u32(code, pc + 1), read_u32(code, pc + 5), pc + 9)
                        };
                        let index = pop_u32!();
                        let target = self.resolve_indirect(ty, table, index)?;
                        dispatch!(target, next);
                    }

                    // ── Parametric ───────────────────────────────────────────
                    DROP => {
                        sp -= 1;
                        if refs {
                            self.stack.clear(sp);
                        }
                        pc += 1;
                    }
                    SELECT => {
                        let cond = pop_u32!();
                        if cond == 0 {
                            self.stack.move_slot(sp - 1, sp - 2);
                        }
                        sp -= 1;
                        if refs {
                            self.stack.clear(sp);
                        }
                        pc += 1;
                    }

                    // ── Variables ────────────────────────────────────────────
                    LOCAL_GET_U8 | LOCAL_GET_I32 => {
                        let (i, next) = index_imm(code, pc, op == LOCAL_GET_U8);
                        push_bits!(self.stack.bits(bp + i));
                        pc = next;
                    }
                    LOCAL_SET_U8 | LOCAL_SET_I32 => {
                        let (i, next) = index_imm(code, pc, op == LOCAL_SET_U8);
                        sp -= 1;
                        self.stack.set_bits(bp + i, self.stack.bits(sp));
                        pc = next;
                    }
                    LOCAL_TEE_U8 | LOCAL_TEE_I32 => {
                        let (i, next) = index_imm(code, pc, op == LOCAL_TEE_U8);
                        self.stack.set_bits(bp + i, self.stack.bits(sp - 1));
                        pc = next;
                    }
                    LOCAL_GET_REF_U8 | LOCAL_GET_REF_I32 => {
                        let (i, next) = index_imm(code, pc, op == LOCAL_GET_REF_U8);
                        self.stack.copy(bp + i, sp);
                        sp += 1;
                        pc = next;
                    }
                    LOCAL_SET_REF_U8 | LOCAL_SET_REF_I32 => {
                        let (i, next) = index_imm(code, pc, op == LOCAL_SET_REF_U8);
                        sp -= 1;
                        self.stack.move_slot(sp, bp + i);
                        pc = next;
                    }
                    LOCAL_TEE_REF_U8 | LOCAL_TEE_REF_I32 => {
                        let (i, next) = index_imm(code, pc, op == LOCAL_TEE_REF_U8);
                        self.stack.copy(sp - 1, bp + i);
                        pc = next;
                    }
                    GLOBAL_GET_U8 | GLOBAL_GET_I32 => {
                        let (i, next) = index_imm(code, pc, op == GLOBAL_GET_U8);
                        let g = self.globals.get(i).ok_or_else(|| unknown("global", i as u32))?;
                        let (bits, r) = (g.bits(), g.reference());
                        self.stack.set_bits(sp, bits);
                        if r.is_some() {
                            self.stack.set_ref(sp, r);
                        }
                        sp += 1;
                        pc = next;
                    }
                    GLOBAL_SET_U8 | GLOBAL_SET_I32 => {
                        let (i, next) = index_imm(code, pc, op == GLOBAL_SET_U8);
                        sp -= 1;
                        let r = self.stack.take_ref(sp);
                        let bits = self.stack.bits(sp);
                        let g = self.globals.get_mut(i).ok_or_else(|| unknown("global", i as u32))?;
                        g.store(bits, r);
                        pc = next;
                    }

                    // ── References and tables ────────────────────────────────
                    REF_NULL => {
                        push_bits!(0);
                        pc += 2;
                    }
                    REF_IS_NULL => {
                        let null = self.stack.ref_is_null(sp - 1);
                        self.stack.clear(sp - 1);
                        self.stack.set_i32(sp - 1, null as i32);
                        pc += 1;
                    }
                    REF_FUNC => {
                        let i = read_u32(code, pc + 1);
                        let r = self.functions.get(i as usize).cloned().ok_or_else(|| unknown("function", i))?;
                        self.stack.set_bits(sp, 0);
                        self.stack.set_ref(sp, Some(Ref::Func(r)));
                        sp += 1;
                        pc += 5;
                    }
                    TABLE_GET => {
                        let t = read_u32(code, pc + 1);
                        let i = self.stack.u32(sp - 1);
                        let r = self.table_at(t)?.get(i)?;
                        self.stack.set_bits(sp - 1, 0);
                        self.stack.set_ref(sp - 1, r);
                        pc += 5;
                    }
                    TABLE_SET => {
                        let t = read_u32(code, pc + 1);
                        let r = self.stack.take_ref(sp - 1);
                        let i = self.stack.u32(sp - 2);
                        sp -= 2;
                        self.table_at(t)?.set(i, r)?;
                        pc += 5;
                    }

                    // ── Memory ───────────────────────────────────────────────
                    I32_LOAD..=I64_LOAD32_U => {
                        let (m, offset, next) = read_memarg(code, pc + 1);
                        let index = self.stack.u64(sp - 1);
                        let v = load_value(self.memory_at(m)?, op, index, offset)?;
                        self.stack.set_bits(sp - 1, v);
                        pc = next;
                    }
                    I32_STORE..=I64_STORE32 => {
                        let (m, offset, next) = read_memarg(code, pc + 1);
                        let v = self.stack.bits(sp - 1);
                        let index = self.stack.u64(sp - 2);
                        sp -= 2;
                        store_value(self.memory_at_mut(m)?, op, index, offset, v)?;
                        pc = next;
                    }
                    COMPACT_LOAD_FIRST..=COMPACT_STORE_LAST => {
                        let general = op - COMPACT_MEMORY_DELTA;
                        let offset = code[pc + 1] as u64;
                        if general <= I64_LOAD32_U {
                            let index = self.stack.u64(sp - 1);
                            let v = load_value(self.memory_at(0)?, general, index, offset)?;
                            self.stack.set_bits(sp - 1, v);
                        } else {
                            let v = self.stack.bits(sp - 1);
                            let index = self.stack.u64(sp - 2);
                            sp -= 2;
                            store_value(self.memory_at_mut(0)?, general, index, offset, v)?;
                        }
                        pc += 2;
                    }
                    MEMORY_SIZE => {
                        let m = read_u32(code, pc + 1);
                        let pages = self.memory_at(m)?.pages();
                        push_bits!(pages as u128);
                        pc += 5;
                    }
                    MEMORY_GROW => {
                        let m = read_u32(code, pc + 1);
                        let delta = self.stack.u64(sp - 1);
                        let limit = self.config.max_memory_pages;
                        let mem = self.memory_at_mut(m)?;
                        let failed = if mem.ty().index64 { u64::MAX as u128 } else { u32::MAX as u128 };
                        let v = mem.grow(delta, limit).map_or(failed, |old| old as u128);
                        self.stack.set_bits(sp - 1, v);
                        pc += 5;
                    }

                    // ── Constants and numerics ───────────────────────────────
                    I32_CONST_I8 => {
                        self.stack.set_i32(sp, code[pc + 1] as i8 as i32);
                        sp += 1;
                        pc += 2;
                    }
                    I64_CONST_I8 => {
                        self.stack.set_i64(sp, code[pc + 1] as i8 as i64);
                        sp += 1;
                        pc += 2;
                    }
                    I32_CONST_I32 | F32_CONST => {
                        push_bits!(read_u32(code, pc + 1) as u128);
                        pc += 5;
                    }
                    I64_CONST_I64 | F64_CONST => {
                        push_bits!(read_u64(code, pc + 1) as u128);
                        pc += 9;
                    }
                    // Fast paths for the commonest i32 operators.
                    I32_ADD => {
                        sp -= 1;
                        let v = self.stack.i32(sp - 1).wrapping_add(self.stack.i32(sp));
                        self.stack.set_i32(sp - 1, v);
                        pc += 1;
                    }
                    I32_SUB => {
                        sp -= 1;
                        let v = self.stack.i32(sp - 1).wrapping_sub(self.stack.i32(sp));
                        self.stack.set_i32(sp - 1, v);
                        pc += 1;
                    }
                    I32_LT_S => {
                        sp -= 1;
                        let v = self.stack.i32(sp - 1) < self.stack.i32(sp);
                        self.stack.set_i32(sp - 1, v as i32);
                        pc += 1;
                    }
                    NUMERIC_FIRST..=NUMERIC_LAST => {
                        let num = NumOp::from_code(op as u16).ok_or_else(|| bad_opcode(op, pc))?;
                        sp = self.numeric(num, sp)?;
                        pc += 1;
                    }

                    // ── Prefixed families ────────────────────────────────────
                    MISC => {
                        let sub = code[pc + 1];
                        let at = pc + 2;
                        pc = match sub {
                            0x00..=0x07 => {
                                let num = NumOp::from_code(0xFC00 | sub as u16).ok_or_else(|| bad_opcode(op, pc))?;
                                sp = self.numeric(num, sp)?;
                                at
                            }
                            misc::MEMORY_INIT => {
                                let (d, m) = (read_u32(code, at), read_u32(code, at + 4));
                                let n = pop_u32!() as u64;
                                let src = pop_u32!() as u64;
                                let dst = pop_u64!();
                                let data = self.data.get(d as usize).cloned().ok_or_else(|| unknown("data segment", d))?;
                                self.memory_at_mut(m)?.init(dst, &data, src, n)?;
                                at + 8
                            }
                            misc::DATA_DROP => {
                                let d = read_u32(code, at);
                                let seg = self.data.get_mut(d as usize).ok_or_else(|| unknown("data segment", d))?;
                                *seg = Arc::from(Vec::new());
                                at + 4
                            }
                            misc::MEMORY_COPY => {
                                let (dm, sm) = (read_u32(code, at), read_u32(code, at + 4));
                                let n = pop_u64!();
                                let src = pop_u64!();
                                let dst = pop_u64!();
                                if dm == sm {
                                    self.memory_at_mut(dm)?.copy_within(dst, src, n)?;
                                } else {
                                    self.memory_at(dm)?;
                                    self.memory_at(sm)?;
                                    let (to, from) = pair_mut(&mut self.memories, dm as usize, sm as usize);
                                    Memory::copy_between(to, from, dst, src, n)?;
                                }
                                at + 8
                            }
                            misc::MEMORY_FILL => {
                                let m = read_u32(code, at);
                                let n = pop_u64!();
                                let value = pop_u32!() as u8;
                                let dst = pop_u64!();
                                self.memory_at_mut(m)?.fill(dst, value, n)?;
                                at + 4
                            }
                            misc::TABLE_INIT => {
                                let (e, t) = (read_u32(code, at), read_u32(code, at + 4));
                                let n = pop_u32!();
                                let src = pop_u32!();
                                let dst = pop_u32!();
                                let seg = self.elements.get(e as usize).ok_or_else(|| unknown("element segment", e))?;
                                let table = self.tables.get_mut(t as usize).ok_or_else(|| unknown("table", t))?;
                                table.init(dst, seg, src, n)?;
                                at + 8
                            }
                            misc::ELEM_DROP => {
                                let e = read_u32(code, at);
                                let seg = self.elements.get_mut(e as usize).ok_or_else(|| unknown("element segment", e))?;
                                *seg = Vec::new();
                                at + 4
                            }
                            misc::TABLE_COPY => {
                                let (dt, st) = (read_u32(code, at), read_u32(code, at + 4));
                                let n = pop_u32!();
                                let src = pop_u32!();
                                let dst = pop_u32!();
                                if dt == st {
                                    self.table_at(dt)?.copy_within(dst, src, n)?;
                                } else {
                                    self.table_at(dt)?;
                                    self.table_at(st)?;
                                    let (to, from) = pair_mut(&mut self.tables, dt as usize, st as usize);
                                    Table::copy_between(to, from, dst, src, n)?;
                                }
                                at + 8
                            }
                            misc::TABLE_GROW => {
                                let t = read_u32(code, at);
                                let n = pop_u32!();
                                let init = self.stack.take_ref(sp - 1);
                                let limit = self.config.max_table_elements;
                                let old = self.table_at(t)?.grow(n, init, limit);
                                self.stack.set_i32(sp - 1, old.map_or(-1, |o| o as i32));
                                at + 4
                            }
                            misc::TABLE_SIZE => {
                                let t = read_u32(code, at);
                                let size = self.table_at(t)?.size();
                                push_bits!(size as u128);
                                at + 4
                            }
                            misc::TABLE_FILL => {
                                let t = read_u32(code, at);
                                let n = pop_u32!();
                                sp -= 1;
                                let r = self.stack.take_ref(sp);
                                let i = pop_u32!();
                                self.table_at(t)?.fill(i, r, n)?;
                                at + 4
                            }
                            _ => return Err(bad_opcode(op, pc)),
                        };
                    }
                    VECTOR => {
                        let sub = read_u16(code, pc + 1);
                        let at = pc + 3;
                        pc = self.vector(code, sub, at, &mut sp)?;
                    }
                    ATOMIC => {
                        let sub = code[pc + 1];
                        if sub == atomic::FENCE {
                            fence(Ordering::SeqCst);
                            pc += 2;
                        } else {
                            let a = AtomicOp::from_code(sub).ok_or_else(|| bad_opcode(op, pc))?;
                            let (m, offset, next) = read_memarg(code, pc + 2);
                            sp = self.atomic(a, m, offset, sp)?;
                            pc = next;
                        }
                    }
                    _ => return Err(bad_opcode(op, pc)),
                }
            }
        }
    }

    // ── Out-of-line families ─────────────────────────────────────────────────

    fn numeric(&mut self, op: NumOp, sp: usize) -> Result<usize> {
        if op.arity() == 1 {
            let v = numeric::eval(op, self.stack.bits(sp - 1), 0)?;
            self.stack.set_bits(sp - 1, v);
            Ok(sp)
        } else {
            let v = numeric::eval(op, self.stack.bits(sp - 2), self.stack.bits(sp - 1))?;
            self.stack.set_bits(sp - 2, v);
            Ok(sp - 1)
        }
    }

    /// Executes the `0xFD` instruction whose immediates start at `at`.
    /// Returns the next `pc`.
    fn vector(&mut self, code: &[u8], sub: u16, at: usize, sp: &mut usize) -> Result<usize> {
        let s = &mut self.stack;
        if let Some(load) = SimdLoadOp::from_code(sub) {
            let (m, offset, next) = read_memarg(code, at);
            let index = s.u64(*sp - 1);
            let mem = self.memories.get(m as usize).ok_or_else(|| unknown("memory", m))?;
            let v = match load {
                SimdLoadOp::Load => u128::from_le_bytes(mem.load(index, offset)?),
                _ => load.expand(load_raw(mem, index, offset, load.bytes())?),
            };
            s.set_bits(*sp - 1, v);
            return Ok(next);
        }
        match sub {
            vop::V128_STORE => {
                let (m, offset, next) = read_memarg(code, at);
                let v = s.bits(*sp - 1);
                let index = s.u64(*sp - 2);
                *sp -= 2;
                let mem = self.memories.get_mut(m as usize).ok_or_else(|| unknown("memory", m))?;
                mem.store(index, offset, v.to_le_bytes())?;
                Ok(next)
            }
            vop::V128_CONST => {
                s.set_bits(*sp, read_u128(code, at));
                *sp += 1;
                Ok(at + 16)
            }
            vop::SHUFFLE => {
                let lanes = read_bytes16(code, at);
                *sp -= 1;
                let v = vector::shuffle(s.bits(*sp - 1), s.bits(*sp), &lanes);
                s.set_bits(*sp - 1, v);
                Ok(at + 16)
            }
            vop::LANE_FIRST..=vop::LANE_LAST => {
                let op = LaneOp::from_code(sub).ok_or_else(|| bad_opcode(VECTOR, at))?;
                let lane = code[at];
                if op.is_replace() {
                    *sp -= 1;
                    let v = vector::replace_lane(op, s.bits(*sp - 1), s.bits(*sp), lane);
                    s.set_bits(*sp - 1, v);
                } else {
                    let v = vector::extract_lane(op, s.bits(*sp - 1), lane);
                    s.set_bits(*sp - 1, v);
                }
                Ok(at + 1)
            }
            vop::LOAD_LANE_FIRST..=vop::STORE_LANE_LAST => {
                let (width, store): (LaneWidth, bool) =
                    LaneWidth::from_code(sub).ok_or_else(|| bad_opcode(VECTOR, at))?;
                let (m, offset, next) = read_memarg(code, at);
                let lane = code[next];
                let v = s.bits(*sp - 1);
                let index = s.u64(*sp - 2);
                *sp -= 1;
                let mem = self.memories.get_mut(m as usize).ok_or_else(|| unknown("memory", m))?;
                if store {
                    *sp -= 1;
                    store_raw(mem, index, offset, width.bytes(), width.extract(v, lane))?;
                } else {
                    let raw = load_raw(mem, index, offset, width.bytes())?;
                    s.set_bits(*sp - 1, width.insert(v, raw, lane));
                }
                Ok(next + 1)
            }
            _ => {
                let op = SimdOp::from_code(sub).ok_or_else(|| bad_opcode(VECTOR, at))?;
                let arity = op.arity();
                let top = *sp - arity;
                let a = s.bits(top);
                let b = if arity > 1 { s.bits(top + 1) } else { 0 };
                let c = if arity > 2 { s.bits(top + 2) } else { 0 };
                s.set_bits(top, vector::eval(op, a, b, c));
                *sp = top + 1;
                Ok(at)
            }
        }
    }

    /// Executes a non-fence atomic. Returns the new `sp`.
    fn atomic(&mut self, op: AtomicOp, m: u32, offset: u64, sp: usize) -> Result<usize> {
        let s = &mut self.stack;
        let mem = self.memories.get_mut(m as usize).ok_or_else(|| unknown("memory", m))?;
        match op {
            AtomicOp::Load(w) => {
                let v = mem.atomic_load(s.u64(sp - 1), offset, w)?;
                s.set_u64(sp - 1, v);
                Ok(sp)
            }
            AtomicOp::Store(w) => {
                mem.atomic_store(s.u64(sp - 2), offset, w, s.u64(sp - 1))?;
                Ok(sp - 2)
            }
            AtomicOp::Rmw(rmw, w) => {
                let old = mem.atomic_rmw(s.u64(sp - 2), offset, w, rmw, s.u64(sp - 1))?;
                s.set_u64(sp - 2, old);
                Ok(sp - 1)
            }
            AtomicOp::Cmpxchg(w) => {
                let old = mem.atomic_cmpxchg(s.u64(sp - 3), offset, w, s.u64(sp - 2), s.u64(sp - 1))?;
                s.set_u64(sp - 3, old);
                Ok(sp - 2)
            }
            AtomicOp::Wait32 | AtomicOp::Wait64 => {
                let wide = op == AtomicOp::Wait64;
                let r = mem.atomic_wait(s.u64(sp - 3), offset, wide, s.u64(sp - 2), s.i64(sp - 1), &self.interrupt)?;
                s.set_i32(sp - 3, r as i32);
                Ok(sp - 2)
            }
            AtomicOp::Notify => {
                let woken = mem.atomic_notify(s.u64(sp - 2), offset, s.u32(sp - 1))?;
                s.set_i32(sp - 2, woken as i32);
                Ok(sp - 1)
            }
            AtomicOp::Fence => {
                fence(Ordering::SeqCst);
                Ok(sp)
            }
        }
    }
}

/// Target of the `i32` displacement stored at `at`, relative to the opcode at `pc`.
#[inline(always)]
fn jump(code: &[u8], pc: usize, at: usize) -> usize {
    (pc as isize + read_i32(code, at) as isize) as usize
}

/// Decodes a `u8` (short form) or `u32` index immediate after the opcode at `pc`.
#[inline(always)]
fn index_imm(code: &[u8], pc: usize, short: bool) -> (usize, usize) {
    if short {
        (code[pc + 1] as usize, pc + 2)
    } else {
        (read_u32(code, pc + 1) as usize, pc + 5)
    }
}
