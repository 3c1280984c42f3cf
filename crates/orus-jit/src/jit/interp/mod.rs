//! The IR interpreter ("helper executor"), `spec.md` §4.3.
//!
//! This dispatch loop is the **authoritative specification of IR
//! semantics**: both linear emitters must produce native code that
//! observably matches what running a program through here would do. It is
//! also the actual execution path used for thin helper-stub blocks and for
//! `ORUS_JIT_FORCE_HELPER_STUB`.

use crate::jit::ir::{ArithOp, CompareOp, IrInstruction, IrOp, IrProgram, LoopCompare};
use crate::runtime::{GuardFailure, Value, ValueKind, Vm};
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Why the interpreter stopped short of a normal `Return`. The caller
/// (whatever invoked `run` — the backend facade, or a native stub's helper
/// call) is responsible for calling `tier::bailout_and_deopt` in response;
/// keeping that call out of this module avoids a dependency from the
/// semantics-reference interpreter onto the tier/registry machinery.
#[derive(Debug, Clone, PartialEq)]
pub enum BailoutReason {
    Guard(GuardFailure),
    DivisionByZero,
    Overflow,
    UnresolvedBranch { offset: u32 },
    LossyConversion { from: ValueKind, to: ValueKind },
    SlowPathRequested,
    /// A native block returned `false` without the reference interpreter
    /// running alongside it to classify why — the native entry ABI only
    /// reports success/failure, not which guard tripped. Recorded by
    /// `engine::Backend::enter` for its debug event log.
    NativeBailout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterpOutcome {
    Returned,
    Bailout(BailoutReason),
}

/// Reads a typed register, falling back to the boxed register file and
/// writing through into the typed cache when the typed guard misses (per
/// §4.3: "Guards always check typed-register kind before reading a typed
/// value; if mismatched, fall back to reading from the boxed register file
/// and, if unboxing succeeds, write-through into the typed register
/// cache").
fn read_guarded(vm: &mut Vm, reg: u32, expected: ValueKind) -> Result<Value, BailoutReason> {
    let typed_kind = vm.typed_registers.kind_of(reg);
    if typed_kind == Some(expected) {
        return Ok(vm
            .typed_registers
            .read_boxed(reg)
            .expect("kind just matched"));
    }
    let boxed = vm.register(reg);
    if boxed.kind() == expected {
        vm.typed_registers.write_through(reg, &boxed);
        return Ok(boxed);
    }
    Err(BailoutReason::Guard(GuardFailure {
        register: reg,
        expected,
        actual: typed_kind.or(Some(boxed.kind())),
    }))
}

fn store_typed(vm: &mut Vm, reg: u32, value: Value) {
    vm.typed_registers.write_through(reg, &value);
    vm.set_register(reg, value);
}

/// Flushes `[base, base + count)` back into the boxed register file, the
/// same way `CallNative`/`CallForeign` flush their argument window before
/// handing control to an external collaborator — array/enum construction
/// and iterator setup are helper calls into the VM's allocator in exactly
/// the same sense.
fn flush_allocator_operands(vm: &mut Vm, base: u32, count: u32) {
    let mut boxed = std::mem::take(&mut vm.boxed_registers);
    vm.typed_registers.flush_range(&mut boxed, base, count);
    vm.boxed_registers = boxed;
}

/// Lets an allocating op (`MakeArray`, `ArrayPush`, `ArrayPop`, `EnumNew`,
/// `GetIter`) observe a GC pause its external allocator requested. This
/// crate has no allocator of its own, so `jit_alloc_triggers_gc` stands in
/// for that request (a test sets it to simulate the allocator's decision);
/// a real allocator would set `jit_native_slow_path_pending` directly from
/// native code instead. Polls immediately, rather than waiting for the
/// per-instruction poll ahead of the next instruction, since an allocating
/// op can be a loop's last instruction before `Return`.
fn check_allocator_gc(vm: &mut Vm) -> Result<(), BailoutReason> {
    if vm.jit_alloc_triggers_gc {
        vm.jit_alloc_triggers_gc = false;
        vm.jit_native_slow_path_pending = true;
    }
    if super::runtime::safepoint::poll(vm) {
        return Err(BailoutReason::SlowPathRequested);
    }
    Ok(())
}

macro_rules! numeric_arith {
    ($kind:expr, $lhs:expr, $rhs:expr, $op:expr, $i32:expr, $i64:expr, $u32:expr, $u64:expr, $f64:expr) => {
        match $kind {
            ValueKind::I32 => $i32($lhs.as_i32().unwrap(), $rhs.as_i32().unwrap()),
            ValueKind::I64 => $i64($lhs.as_i64().unwrap(), $rhs.as_i64().unwrap()),
            ValueKind::U32 => $u32($lhs.as_u32().unwrap(), $rhs.as_u32().unwrap()),
            ValueKind::U64 => $u64($lhs.as_u64().unwrap(), $rhs.as_u64().unwrap()),
            ValueKind::F64 => $f64($lhs.as_f64().unwrap(), $rhs.as_f64().unwrap()),
            other => unreachable!("non-numeric kind {other} reached arithmetic dispatch"),
        }
    };
}

fn eval_arith(op: ArithOp, kind: ValueKind, lhs: &Value, rhs: &Value) -> Result<Value, BailoutReason> {
    match op {
        ArithOp::Add => Ok(numeric_arith!(
            kind, lhs, rhs, op,
            |a: i32, b: i32| Value::I32(a.wrapping_add(b)),
            |a: i64, b: i64| Value::I64(a.wrapping_add(b)),
            |a: u32, b: u32| Value::U32(a.wrapping_add(b)),
            |a: u64, b: u64| Value::U64(a.wrapping_add(b)),
            |a: f64, b: f64| Value::F64(a + b)
        )),
        ArithOp::Sub => Ok(numeric_arith!(
            kind, lhs, rhs, op,
            |a: i32, b: i32| Value::I32(a.wrapping_sub(b)),
            |a: i64, b: i64| Value::I64(a.wrapping_sub(b)),
            |a: u32, b: u32| Value::U32(a.wrapping_sub(b)),
            |a: u64, b: u64| Value::U64(a.wrapping_sub(b)),
            |a: f64, b: f64| Value::F64(a - b)
        )),
        ArithOp::Mul => Ok(numeric_arith!(
            kind, lhs, rhs, op,
            |a: i32, b: i32| Value::I32(a.wrapping_mul(b)),
            |a: i64, b: i64| Value::I64(a.wrapping_mul(b)),
            |a: u32, b: u32| Value::U32(a.wrapping_mul(b)),
            |a: u64, b: u64| Value::U64(a.wrapping_mul(b)),
            |a: f64, b: f64| Value::F64(a * b)
        )),
        ArithOp::Div => eval_div_mod(kind, lhs, rhs, true),
        ArithOp::Mod => eval_div_mod(kind, lhs, rhs, false),
    }
}

fn eval_div_mod(kind: ValueKind, lhs: &Value, rhs: &Value, is_div: bool) -> Result<Value, BailoutReason> {
    match kind {
        ValueKind::I32 => {
            let (a, b) = (lhs.as_i32().unwrap(), rhs.as_i32().unwrap());
            if b == 0 || (b == -1 && a == i32::MIN) {
                return Err(BailoutReason::DivisionByZero);
            }
            Ok(Value::I32(if is_div { a / b } else { a % b }))
        }
        ValueKind::I64 => {
            let (a, b) = (lhs.as_i64().unwrap(), rhs.as_i64().unwrap());
            if b == 0 || (b == -1 && a == i64::MIN) {
                return Err(BailoutReason::DivisionByZero);
            }
            Ok(Value::I64(if is_div { a / b } else { a % b }))
        }
        ValueKind::U32 => {
            let (a, b) = (lhs.as_u32().unwrap(), rhs.as_u32().unwrap());
            if b == 0 {
                return Err(BailoutReason::DivisionByZero);
            }
            Ok(Value::U32(if is_div { a / b } else { a % b }))
        }
        ValueKind::U64 => {
            let (a, b) = (lhs.as_u64().unwrap(), rhs.as_u64().unwrap());
            if b == 0 {
                return Err(BailoutReason::DivisionByZero);
            }
            Ok(Value::U64(if is_div { a / b } else { a % b }))
        }
        ValueKind::F64 => {
            let (a, b) = (lhs.as_f64().unwrap(), rhs.as_f64().unwrap());
            Ok(Value::F64(if is_div { a / b } else { a % b }))
        }
        other => unreachable!("non-numeric kind {other} reached div/mod dispatch"),
    }
}

fn eval_compare(op: CompareOp, kind: ValueKind, lhs: &Value, rhs: &Value) -> bool {
    use std::cmp::Ordering;
    let ordering = match kind {
        ValueKind::I32 => lhs.as_i32().unwrap().partial_cmp(&rhs.as_i32().unwrap()),
        ValueKind::I64 => lhs.as_i64().unwrap().partial_cmp(&rhs.as_i64().unwrap()),
        ValueKind::U32 => lhs.as_u32().unwrap().partial_cmp(&rhs.as_u32().unwrap()),
        ValueKind::U64 => lhs.as_u64().unwrap().partial_cmp(&rhs.as_u64().unwrap()),
        ValueKind::F64 => lhs.as_f64().unwrap().partial_cmp(&rhs.as_f64().unwrap()),
        ValueKind::Bool => {
            let (a, b) = (lhs.as_bool().unwrap(), rhs.as_bool().unwrap());
            return match op {
                CompareOp::Eq => a == b,
                CompareOp::Ne => a != b,
                _ => unreachable!("bool only supports eq/ne"),
            };
        }
        other => unreachable!("unsupported compare kind {other}"),
    };
    match ordering {
        Some(Ordering::Less) => matches!(op, CompareOp::Lt | CompareOp::Le | CompareOp::Ne),
        Some(Ordering::Greater) => matches!(op, CompareOp::Gt | CompareOp::Ge | CompareOp::Ne),
        Some(Ordering::Equal) => matches!(op, CompareOp::Le | CompareOp::Ge | CompareOp::Eq),
        None => false, // NaN: every ordered comparison is false, matching IEEE-754.
    }
}

/// Coerces a value to its runtime string form for `ConcatString`/boolean
/// string-compare, using the to-string inline cache to avoid re-rendering
/// the same bit pattern repeatedly.
fn coerce_to_string(vm: &mut Vm, value: &Value) -> Option<Rc<str>> {
    if let Value::Str(s) = value {
        return Some(s.clone());
    }
    let bits = match value {
        Value::I32(v) => *v as u32 as u64,
        Value::I64(v) => *v as u64,
        Value::U32(v) => *v as u64,
        Value::U64(v) => *v,
        Value::F64(v) => v.to_bits(),
        Value::Bool(v) => *v as u64,
        Value::Str(_) | Value::Boxed => return None,
    };
    if let Some(cached) = vm.tostring_cache.get(value.kind(), bits) {
        return Some(cached);
    }
    let rendered: Rc<str> = Rc::from(value.to_runtime_string()?);
    vm.tostring_cache.insert(value.kind(), bits, rendered.clone());
    Some(rendered)
}

/// Runs `program` to completion or until a bailout condition is reached.
/// Matches the dispatch rules in §4.3: a safepoint before each instruction,
/// a side table built once for branch resolution, and typed-register guards
/// ahead of every typed read.
pub fn run(vm: &mut Vm, program: &IrProgram<'_>) -> InterpOutcome {
    let offsets: FxHashMap<u32, usize> = program
        .instructions
        .iter()
        .enumerate()
        .map(|(idx, instr)| (instr.bytecode_offset, idx))
        .collect();

    let mut pc: usize = 0;
    while pc < program.instructions.len() {
        if super::runtime::safepoint::poll(vm) {
            return InterpOutcome::Bailout(BailoutReason::SlowPathRequested);
        }

        let instr = &program.instructions[pc];
        match step(vm, instr, &offsets, program) {
            Ok(StepOutcome::Next) => pc += 1,
            Ok(StepOutcome::Jump(target)) => match offsets.get(&target) {
                Some(&idx) => pc = idx,
                None => return InterpOutcome::Bailout(BailoutReason::UnresolvedBranch { offset: target }),
            },
            Ok(StepOutcome::Return) => return InterpOutcome::Returned,
            Err(reason) => return InterpOutcome::Bailout(reason),
        }
    }
    InterpOutcome::Returned
}

enum StepOutcome {
    Next,
    Jump(u32),
    Return,
}

fn resolve_forward(bytecode_offset: u32, bytecode_length: u32, offset: i32) -> u32 {
    (bytecode_offset as i64 + bytecode_length as i64 + offset as i64) as u32
}

fn step(
    vm: &mut Vm,
    instr: &IrInstruction,
    _offsets: &FxHashMap<u32, usize>,
    program: &IrProgram<'_>,
) -> Result<StepOutcome, BailoutReason> {
    let kind = instr.value_kind;
    match &instr.op {
        IrOp::LoadConst { dst, const_index } => {
            let constant = program
                .source_chunk
                .constant(*const_index)
                .map_err(|_| BailoutReason::UnresolvedBranch { offset: *const_index })?;
            let value = constant_to_value(constant);
            store_typed(vm, *dst, value);
            Ok(StepOutcome::Next)
        }
        IrOp::Move { dst, src, typed } => {
            let value = if *typed {
                read_guarded(vm, *src, kind)?
            } else {
                vm.register(*src)
            };
            store_typed(vm, *dst, value);
            Ok(StepOutcome::Next)
        }
        IrOp::Arith { op, dst, lhs, rhs } => {
            let l = read_guarded(vm, *lhs, kind)?;
            let r = read_guarded(vm, *rhs, kind)?;
            let result = eval_arith(*op, kind, &l, &r)?;
            store_typed(vm, *dst, result);
            Ok(StepOutcome::Next)
        }
        IrOp::Unary { op, dst, src } => {
            let v = read_guarded(vm, *src, kind)?;
            let zero = match kind {
                ValueKind::I32 => Value::I32(0),
                ValueKind::I64 => Value::I64(0),
                ValueKind::F64 => Value::F64(0.0),
                other => return Err(BailoutReason::Guard(GuardFailure { register: *src, expected: ValueKind::I32, actual: Some(other) })),
            };
            let result = eval_arith(*op, kind, &zero, &v)?;
            store_typed(vm, *dst, result);
            Ok(StepOutcome::Next)
        }
        IrOp::Compare { op, dst, lhs, rhs } => {
            if kind == ValueKind::String {
                let l = read_guarded(vm, *lhs, ValueKind::String)?;
                let r = read_guarded(vm, *rhs, ValueKind::String)?;
                let ls = coerce_to_string(vm, &l).ok_or(BailoutReason::SlowPathRequested)?;
                let rs = coerce_to_string(vm, &r).ok_or(BailoutReason::SlowPathRequested)?;
                let eq = ls == rs;
                let result = match op {
                    CompareOp::Eq => eq,
                    CompareOp::Ne => !eq,
                    _ => return Err(BailoutReason::Guard(GuardFailure { register: *lhs, expected: ValueKind::String, actual: None })),
                };
                store_typed(vm, *dst, Value::Bool(result));
            } else {
                let l = read_guarded(vm, *lhs, kind)?;
                let r = read_guarded(vm, *rhs, kind)?;
                store_typed(vm, *dst, Value::Bool(eval_compare(*op, kind, &l, &r)));
            }
            Ok(StepOutcome::Next)
        }
        IrOp::Convert { dst, src, from, to } => {
            let v = read_guarded(vm, *src, *from)?;
            let converted = convert(&v, *to)?;
            store_typed(vm, *dst, converted);
            Ok(StepOutcome::Next)
        }
        IrOp::ConcatString { dst, lhs, rhs } => {
            let l = vm.register(*lhs);
            let r = vm.register(*rhs);
            let ls = coerce_to_string(vm, &l).ok_or(BailoutReason::SlowPathRequested)?;
            let rs = coerce_to_string(vm, &r).ok_or(BailoutReason::SlowPathRequested)?;
            let joined: Rc<str> = Rc::from(format!("{ls}{rs}"));
            store_typed(vm, *dst, Value::Str(joined));
            Ok(StepOutcome::Next)
        }
        IrOp::ToString { dst, src } => {
            let v = vm.register(*src);
            let s = coerce_to_string(vm, &v).ok_or(BailoutReason::SlowPathRequested)?;
            store_typed(vm, *dst, Value::Str(s));
            Ok(StepOutcome::Next)
        }
        IrOp::TypeOf { dst, src } => {
            let v = vm.register(*src);
            let tag: Rc<str> = Rc::from(v.kind().to_string());
            store_typed(vm, *dst, Value::Str(tag));
            Ok(StepOutcome::Next)
        }
        IrOp::IsType { dst, src, type_const } => {
            let v = vm.register(*src);
            let constant = program
                .source_chunk
                .constant(*type_const)
                .map_err(|_| BailoutReason::UnresolvedBranch { offset: *type_const })?;
            let matches = matches!(
                (v.kind(), constant),
                (ValueKind::I32, crate::bytecode::Constant::I32(_))
                    | (ValueKind::I64, crate::bytecode::Constant::I64(_))
                    | (ValueKind::U32, crate::bytecode::Constant::U32(_))
                    | (ValueKind::U64, crate::bytecode::Constant::U64(_))
                    | (ValueKind::F64, crate::bytecode::Constant::F64(_))
                    | (ValueKind::Bool, crate::bytecode::Constant::Bool(_))
                    | (ValueKind::String, crate::bytecode::Constant::Str(_))
            );
            store_typed(vm, *dst, Value::Bool(matches));
            Ok(StepOutcome::Next)
        }
        IrOp::MakeArray { first_reg, count, .. } => {
            flush_allocator_operands(vm, *first_reg, *count);
            check_allocator_gc(vm)?;
            if let Some(dst) = instr.op.dst() {
                store_typed(vm, dst, Value::Boxed);
            }
            Ok(StepOutcome::Next)
        }
        IrOp::ArrayPush { array_reg, value_reg } => {
            flush_allocator_operands(vm, *array_reg, 1);
            flush_allocator_operands(vm, *value_reg, 1);
            check_allocator_gc(vm)?;
            Ok(StepOutcome::Next)
        }
        IrOp::ArrayPop { array_reg, .. } => {
            flush_allocator_operands(vm, *array_reg, 1);
            check_allocator_gc(vm)?;
            if let Some(dst) = instr.op.dst() {
                store_typed(vm, dst, Value::Boxed);
            }
            Ok(StepOutcome::Next)
        }
        IrOp::EnumNew { payload_start, payload_count, .. } => {
            flush_allocator_operands(vm, *payload_start, *payload_count);
            check_allocator_gc(vm)?;
            if let Some(dst) = instr.op.dst() {
                store_typed(vm, dst, Value::Boxed);
            }
            Ok(StepOutcome::Next)
        }
        IrOp::GetIter { dst, src } => {
            flush_allocator_operands(vm, *src, 1);
            check_allocator_gc(vm)?;
            if let Some(state) = vm.jit_range_iterators.get(src).copied() {
                vm.jit_range_iterators.insert(*dst, state);
            }
            store_typed(vm, *dst, Value::Boxed);
            Ok(StepOutcome::Next)
        }
        IrOp::IterNext { value_reg, iterator_reg, has_value_reg } => {
            // This reference interpreter only has concrete state to drive
            // for `Range`-derived iterators; anything else (array/enum
            // iterators from the external object model) reports exhausted.
            match vm.jit_range_iterators.get_mut(iterator_reg) {
                Some(state) if state.current < state.end => {
                    let value = state.current;
                    state.current += 1;
                    store_typed(vm, *value_reg, Value::I32(value));
                    store_typed(vm, *has_value_reg, Value::Bool(true));
                }
                _ => {
                    store_typed(vm, *has_value_reg, Value::Bool(false));
                }
            }
            Ok(StepOutcome::Next)
        }
        IrOp::Range { dst, start_reg, end_reg } => {
            let start = read_guarded(vm, *start_reg, ValueKind::I32)?;
            let end = read_guarded(vm, *end_reg, ValueKind::I32)?;
            vm.jit_range_iterators.insert(
                *dst,
                crate::runtime::RangeIterState {
                    current: start.as_i32().expect("guarded to I32"),
                    end: end.as_i32().expect("guarded to I32"),
                },
            );
            store_typed(vm, *dst, Value::Boxed);
            Ok(StepOutcome::Next)
        }
        IrOp::Print { .. } => Ok(StepOutcome::Next),
        IrOp::AssertEq { lhs, rhs } => {
            let l = vm.register(*lhs);
            let r = vm.register(*rhs);
            if l != r {
                vm.last_error = Some(format!("assertion failed: r{lhs} ({l:?}) != r{rhs} ({r:?})"));
            }
            Ok(StepOutcome::Next)
        }
        IrOp::TimeStamp { dst } => {
            store_typed(vm, *dst, Value::I64(0));
            Ok(StepOutcome::Next)
        }
        IrOp::CallNative { dst, first_arg_reg, arg_count, .. }
        | IrOp::CallForeign { dst, first_arg_reg, arg_count, .. } => {
            let mut boxed = std::mem::take(&mut vm.boxed_registers);
            vm.typed_registers.flush_range(&mut boxed, *first_arg_reg, *arg_count);
            vm.boxed_registers = boxed;
            store_typed(vm, *dst, Value::Boxed);
            Ok(StepOutcome::Next)
        }
        IrOp::JumpShort { offset, bytecode_length } => {
            Ok(StepOutcome::Jump(resolve_forward(instr.bytecode_offset, *bytecode_length, *offset)))
        }
        IrOp::JumpIfNotShort { predicate_reg, offset, bytecode_length } => {
            let predicate = read_guarded(vm, *predicate_reg, ValueKind::Bool)?;
            if predicate.as_bool() == Some(false) {
                Ok(StepOutcome::Jump(resolve_forward(instr.bytecode_offset, *bytecode_length, *offset)))
            } else {
                Ok(StepOutcome::Next)
            }
        }
        IrOp::JumpBackShort { back_offset } => {
            let target = instr.bytecode_offset.checked_sub(*back_offset)
                .ok_or(BailoutReason::UnresolvedBranch { offset: 0 })?;
            Ok(StepOutcome::Jump(target))
        }
        IrOp::LoopBack => Ok(StepOutcome::Jump(program.loop_start_offset)),
        IrOp::Return => Ok(StepOutcome::Return),
        IrOp::IncCmpJump { counter_reg, limit_reg, step, compare, jump_offset } => {
            step_fused_loop(vm, instr, *counter_reg, *limit_reg, *step, *compare, *jump_offset, true)
        }
        IrOp::DecCmpJump { counter_reg, limit_reg, step, compare, jump_offset } => {
            step_fused_loop(vm, instr, *counter_reg, *limit_reg, *step, *compare, *jump_offset, false)
        }
        IrOp::Safepoint => {
            super::runtime::safepoint::poll(vm);
            Ok(StepOutcome::Next)
        }
    }
}

/// Shared implementation of `IncCmpJump`/`DecCmpJump`. `step` is an
/// arbitrary non-zero `i8` here — the general path the open question in
/// `spec.md` §9 resolves to; the emitters additionally special-case
/// `step == ±1` for a faster immediate-increment encoding, but both must
/// agree with this function bit-for-bit.
#[allow(clippy::too_many_arguments)]
fn step_fused_loop(
    vm: &mut Vm,
    instr: &IrInstruction,
    counter_reg: u32,
    limit_reg: u32,
    step: i8,
    compare: LoopCompare,
    jump_offset: i32,
    is_inc: bool,
) -> Result<StepOutcome, BailoutReason> {
    if step == 0 {
        return Err(BailoutReason::Guard(GuardFailure { register: counter_reg, expected: ValueKind::I32, actual: None }));
    }
    if is_inc != (step > 0) {
        return Err(BailoutReason::Guard(GuardFailure { register: counter_reg, expected: ValueKind::I32, actual: None }));
    }

    let kind = instr.value_kind;
    let counter = read_guarded(vm, counter_reg, kind)?;
    let limit = read_guarded(vm, limit_reg, kind)?;

    let (updated, overflowed) = match kind {
        ValueKind::I32 => {
            let (v, o) = counter.as_i32().unwrap().overflowing_add(step as i32);
            (Value::I32(v), o)
        }
        ValueKind::I64 => {
            let (v, o) = counter.as_i64().unwrap().overflowing_add(step as i64);
            (Value::I64(v), o)
        }
        ValueKind::U32 => {
            let (v, o) = if step >= 0 {
                counter.as_u32().unwrap().overflowing_add(step as u32)
            } else {
                counter.as_u32().unwrap().overflowing_sub((-(step as i32)) as u32)
            };
            (Value::U32(v), o)
        }
        ValueKind::U64 => {
            let (v, o) = if step >= 0 {
                counter.as_u64().unwrap().overflowing_add(step as u64)
            } else {
                counter.as_u64().unwrap().overflowing_sub((-(step as i32)) as u64)
            };
            (Value::U64(v), o)
        }
        other => return Err(BailoutReason::Guard(GuardFailure { register: counter_reg, expected: ValueKind::I32, actual: Some(other) })),
    };
    if overflowed {
        return Err(BailoutReason::Overflow);
    }
    store_typed(vm, counter_reg, updated.clone());

    let cmp_op = match compare {
        LoopCompare::Lt => CompareOp::Lt,
        LoopCompare::Gt => CompareOp::Gt,
    };
    if eval_compare(cmp_op, kind, &updated, &limit) {
        let target = (instr.bytecode_offset as i64 + jump_offset as i64) as u32;
        Ok(StepOutcome::Jump(target))
    } else {
        Ok(StepOutcome::Next)
    }
}

fn constant_to_value(constant: &crate::bytecode::Constant) -> Value {
    use crate::bytecode::Constant;
    match constant {
        Constant::I32(v) => Value::I32(*v),
        Constant::I64(v) => Value::I64(*v),
        Constant::U32(v) => Value::U32(*v),
        Constant::U64(v) => Value::U64(*v),
        Constant::F64(v) => Value::F64(*v),
        Constant::Bool(v) => Value::Bool(*v),
        Constant::Str(v) => Value::Str(Rc::from(v.as_str())),
    }
}

fn convert(value: &Value, to: ValueKind) -> Result<Value, BailoutReason> {
    let fail = move |from: ValueKind| -> Result<Value, BailoutReason> {
        Err(BailoutReason::LossyConversion { from, to })
    };
    match (value, to) {
        (Value::I32(v), ValueKind::I64) => Ok(Value::I64(*v as i64)),
        (Value::I32(v), ValueKind::U32) => if *v >= 0 { Ok(Value::U32(*v as u32)) } else { fail(ValueKind::I32) },
        (Value::I32(v), ValueKind::U64) => if *v >= 0 { Ok(Value::U64(*v as u64)) } else { fail(ValueKind::I32) },
        (Value::I32(v), ValueKind::F64) => Ok(Value::F64(*v as f64)),
        (Value::I64(v), ValueKind::I32) => i32::try_from(*v).map(Value::I32).or(fail(ValueKind::I64)),
        (Value::I64(v), ValueKind::U32) => u32::try_from(*v).map(Value::U32).or(fail(ValueKind::I64)),
        (Value::I64(v), ValueKind::U64) => if *v >= 0 { Ok(Value::U64(*v as u64)) } else { fail(ValueKind::I64) },
        (Value::I64(v), ValueKind::F64) => Ok(Value::F64(*v as f64)),
        (Value::U32(v), ValueKind::I32) => i32::try_from(*v).map(Value::I32).or(fail(ValueKind::U32)),
        (Value::U32(v), ValueKind::I64) => Ok(Value::I64(*v as i64)),
        (Value::U32(v), ValueKind::U64) => Ok(Value::U64(*v as u64)),
        (Value::U32(v), ValueKind::F64) => Ok(Value::F64(*v as f64)),
        (Value::U64(v), ValueKind::I32) => i32::try_from(*v).map(Value::I32).or(fail(ValueKind::U64)),
        (Value::U64(v), ValueKind::I64) => i64::try_from(*v).map(Value::I64).or(fail(ValueKind::U64)),
        (Value::U64(v), ValueKind::U32) => u32::try_from(*v).map(Value::U32).or(fail(ValueKind::U64)),
        (Value::U64(v), ValueKind::F64) => Ok(Value::F64(*v as f64)),
        (Value::F64(v), ValueKind::I32) => {
            if *v >= i32::MIN as f64 && *v <= i32::MAX as f64 { Ok(Value::I32(*v as i32)) } else { fail(ValueKind::F64) }
        }
        (Value::F64(v), ValueKind::I64) => {
            if *v >= i64::MIN as f64 && *v <= i64::MAX as f64 { Ok(Value::I64(*v as i64)) } else { fail(ValueKind::F64) }
        }
        (Value::F64(v), ValueKind::U32) => {
            if *v >= 0.0 && *v <= u32::MAX as f64 { Ok(Value::U32(*v as u32)) } else { fail(ValueKind::F64) }
        }
        (Value::F64(v), ValueKind::U64) => {
            if *v >= 0.0 && *v <= u64::MAX as f64 { Ok(Value::U64(*v as u64)) } else { fail(ValueKind::F64) }
        }
        (same, k) if same.kind() == k => Ok(same.clone()),
        (other, _) => fail(other.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Chunk, Constant};
    use crate::jit::ir::{IrInstruction, OptFlags};

    fn chunk_with_len(len: usize) -> Chunk {
        Chunk::with_code(vec![0u8; len])
    }

    #[test]
    fn typed_add_loop_runs_to_completion() {
        let mut chunk = chunk_with_len(3);
        chunk.add_constant(Constant::I32(0));
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 0);
        program.push(IrInstruction::new(IrOp::LoadConst { dst: 0, const_index: 0 }, ValueKind::I32, 0));
        program.push(IrInstruction::new(
            IrOp::IncCmpJump {
                counter_reg: 0,
                limit_reg: 1,
                step: 1,
                compare: LoopCompare::Lt,
                // Jumps back onto its own bytecode offset: a fused loop's
                // "backward branch" is the instruction re-running itself,
                // not a jump to some earlier instruction.
                jump_offset: 0,
            },
            ValueKind::I32,
            1,
        ));
        program.push(IrInstruction::new(IrOp::Return, ValueKind::Boxed, 2));

        let mut vm = Vm::new(4);
        vm.typed_registers.write_i32(1, 3);
        let outcome = run(&mut vm, &program);
        assert_eq!(outcome, InterpOutcome::Returned);
        assert_eq!(vm.typed_registers.read_i32(0), Ok(3));
    }

    #[test]
    fn guard_mismatch_bails_out() {
        let chunk = chunk_with_len(1);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 0);
        program.push(IrInstruction::new(
            IrOp::Move { dst: 3, src: 4, typed: true },
            ValueKind::I64,
            0,
        ));
        let mut vm = Vm::new(8);
        vm.typed_registers.write_i32(4, 1);
        let outcome = run(&mut vm, &program);
        assert!(matches!(outcome, InterpOutcome::Bailout(BailoutReason::Guard(_))));
    }

    #[test]
    fn division_by_zero_bails_out() {
        let chunk = chunk_with_len(1);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 0);
        program.push(IrInstruction::new(
            IrOp::Arith { op: ArithOp::Div, dst: 2, lhs: 0, rhs: 1 },
            ValueKind::I32,
            0,
        ));
        let mut vm = Vm::new(4);
        vm.typed_registers.write_i32(0, 10);
        vm.typed_registers.write_i32(1, 0);
        let outcome = run(&mut vm, &program);
        assert_eq!(outcome, InterpOutcome::Bailout(BailoutReason::DivisionByZero));
    }

    #[test]
    fn string_concat_produces_expected_string() {
        let mut chunk = chunk_with_len(1);
        let int_idx = chunk.add_constant(Constant::I32(7));
        let str_idx = chunk.add_constant(Constant::Str("x".to_string()));
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 0);
        program.push(IrInstruction::new(IrOp::LoadConst { dst: 0, const_index: int_idx }, ValueKind::I32, 0));
        program.push(IrInstruction::new(IrOp::ToString { dst: 1, src: 0 }, ValueKind::String, 0));
        program.push(IrInstruction::new(IrOp::LoadConst { dst: 2, const_index: str_idx }, ValueKind::String, 0));
        program.push(IrInstruction::new(IrOp::ConcatString { dst: 3, lhs: 2, rhs: 1 }, ValueKind::String, 0));

        let mut vm = Vm::new(4);
        run(&mut vm, &program);
        assert_eq!(vm.register(3).as_str(), Some("x7"));
    }

    #[test]
    fn dec_cmp_jump_requires_matching_direction() {
        let chunk = chunk_with_len(1);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 0);
        program.push(IrInstruction::new(
            IrOp::IncCmpJump { counter_reg: 0, limit_reg: 1, step: -1, compare: LoopCompare::Lt, jump_offset: 0 },
            ValueKind::I32,
            0,
        ));
        let mut vm = Vm::new(4);
        vm.typed_registers.write_i32(0, 0);
        vm.typed_registers.write_i32(1, 5);
        let outcome = run(&mut vm, &program);
        assert!(matches!(outcome, InterpOutcome::Bailout(BailoutReason::Guard(_))));
    }

    #[test]
    fn noop_program_returns_immediately() {
        let chunk = chunk_with_len(1);
        let program = IrProgram::noop(&chunk);
        let mut vm = Vm::new(1);
        assert_eq!(run(&mut vm, &program), InterpOutcome::Returned);
    }

    #[test]
    fn range_iterator_yields_each_bound_then_reports_exhausted() {
        let chunk = chunk_with_len(1);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 0);
        program.push(IrInstruction::new(IrOp::Range { dst: 2, start_reg: 0, end_reg: 1 }, ValueKind::Boxed, 0));

        let mut vm = Vm::new(8);
        vm.typed_registers.write_i32(0, 0);
        vm.typed_registers.write_i32(1, 2);
        step(&mut vm, &program.instructions[0], &Default::default(), &program).unwrap();

        let instr = IrInstruction::new(
            IrOp::IterNext { value_reg: 3, iterator_reg: 2, has_value_reg: 4 },
            ValueKind::Boxed,
            0,
        );
        step(&mut vm, &instr, &Default::default(), &program).unwrap();
        assert_eq!(vm.register(3), Value::I32(0));
        assert_eq!(vm.register(4), Value::Bool(true));

        step(&mut vm, &instr, &Default::default(), &program).unwrap();
        assert_eq!(vm.register(3), Value::I32(1));
        assert_eq!(vm.register(4), Value::Bool(true));

        step(&mut vm, &instr, &Default::default(), &program).unwrap();
        assert_eq!(vm.register(4), Value::Bool(false));
    }

    #[test]
    fn make_array_bails_out_when_the_allocator_requests_gc() {
        let chunk = chunk_with_len(1);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 0);
        program.push(IrInstruction::new(IrOp::MakeArray { dst: 0, first_reg: 0, count: 0 }, ValueKind::Boxed, 0));

        let mut vm = Vm::new(4);
        vm.jit_alloc_triggers_gc = true;
        let outcome = run(&mut vm, &program);
        assert_eq!(outcome, InterpOutcome::Bailout(BailoutReason::SlowPathRequested));
        assert!(!vm.jit_alloc_triggers_gc);
    }

    #[test]
    fn assert_eq_mismatch_sets_last_error() {
        let chunk = chunk_with_len(1);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 0);
        program.push(IrInstruction::new(IrOp::AssertEq { lhs: 0, rhs: 1 }, ValueKind::Boxed, 0));

        let mut vm = Vm::new(4);
        vm.typed_registers.write_i32(0, 1);
        vm.typed_registers.write_i32(1, 2);
        run(&mut vm, &program);
        assert!(vm.last_error.is_some());
    }
}
