//! End-to-end scenarios against the public `Backend` surface.
//!
//! Each test reproduces one of the literal scenarios this backend's
//! contract is specified against: compile a small program, run it through
//! `Backend::enter`, and check the VM state the contract promises.

use orus_jit::jit::ir::{ArithOp, IrInstruction, IrOp, IrProgram, LoopCompare, OptFlags};
use orus_jit::jit::tier::{ProfileSource, Tier};
use orus_jit::runtime::{Value, ValueKind, Vm};
use orus_jit::{Backend, BackendConfig, Chunk, Constant};
use std::rc::Rc;

struct FixedProfile(u64);

impl ProfileSource for FixedProfile {
    fn hit_count(&self, _function_index: u32, _loop_index: u32) -> u64 {
        self.0
    }
}

fn backend() -> Backend {
    Backend::create(BackendConfig::default()).expect("host supports the executable arena")
}

/// Scenario 1: a typed counting loop runs to completion and leaves the
/// counter register at the loop bound, with no deopts along the way.
#[test]
fn typed_add_loop_reaches_its_bound() {
    let mut chunk = Chunk::with_code(vec![0u8; 4]);
    let start = chunk.add_constant(Constant::I32(0));
    let bound = chunk.add_constant(Constant::I32(1_000_000));
    let chunk = Rc::new(chunk);

    let mut program = IrProgram::new(chunk.as_ref(), 1, 0, 0, 3);
    program.push(IrInstruction::new(IrOp::LoadConst { dst: 0, const_index: start }, ValueKind::I32, 0));
    program.push(IrInstruction::new(IrOp::LoadConst { dst: 1, const_index: bound }, ValueKind::I32, 1));
    program.push(IrInstruction::new(
        IrOp::IncCmpJump {
            counter_reg: 0,
            limit_reg: 1,
            step: 1,
            compare: LoopCompare::Lt,
            jump_offset: 0,
        },
        ValueKind::I32,
        2,
    ));
    program.push(IrInstruction::new(IrOp::Return, ValueKind::Boxed, 3));
    program.validate().expect("every offset lands inside the chunk");

    let mut backend = backend();
    let entry = backend.compile_ir(&program, chunk).expect("program compiles via some strategy");

    let mut vm = Vm::new(4);
    assert!(backend.enter(&mut vm, &entry));

    assert_eq!(vm.register(0), Value::I32(1_000_000));
    assert_eq!(vm.dispatch_count, 1);
    assert_eq!(vm.jit_native_type_deopts, 0);
    assert!(vm.jit_pending_trigger.is_none());
}

/// Scenario 2: a typed move that assumes the wrong register kind guards,
/// bails out, and demotes its loop to `Baseline` for the next dispatch.
#[test]
fn guard_mismatch_demotes_the_loop() {
    let chunk = Rc::new(Chunk::with_code(vec![0u8; 1]));
    let mut program = IrProgram::new(chunk.as_ref(), 2, 6, 0, 1);
    program.push(IrInstruction::new(
        IrOp::Move { dst: 3, src: 4, typed: true },
        ValueKind::I64,
        0,
    ));

    let mut backend = backend();
    let entry = backend.compile_ir(&program, chunk).expect("helper stub always compiles");

    let mut vm = Vm::new(8);
    vm.typed_registers.write_i32(4, 1);

    assert!(!backend.enter(&mut vm, &entry));
    assert_eq!(vm.jit_native_type_deopts, 1);
    assert!(vm.is_loop_blocked(6));
    assert!(vm.jit_pending_invalidate);
    assert_eq!(vm.jit_pending_trigger.map(|t| (t.function_index, t.loop_index)), Some((2, 6)));

    // The loop's specialization history was cleared by the demotion, so a
    // below-threshold observation stays on `Baseline` (the blocklist above
    // is what actually keeps the dispatcher from reconsidering it).
    let cold_profile = FixedProfile(10);
    let tier = backend.tier_of(2, 6, &cold_profile);
    assert_eq!(tier, Tier::Baseline);
}

/// Scenario 3: `ToString` + `ConcatString` produce the expected rendered
/// string through a full compile-and-enter round trip.
#[test]
fn string_concat_produces_expected_string() {
    let mut chunk = Chunk::with_code(vec![0u8; 5]);
    let int_idx = chunk.add_constant(Constant::I32(7));
    let str_idx = chunk.add_constant(Constant::Str("x".to_string()));
    let chunk = Rc::new(chunk);

    let mut program = IrProgram::new(chunk.as_ref(), 0, 0, 0, 4);
    program.push(IrInstruction::new(IrOp::LoadConst { dst: 0, const_index: int_idx }, ValueKind::I32, 0));
    program.push(IrInstruction::new(IrOp::ToString { dst: 1, src: 0 }, ValueKind::String, 1));
    program.push(IrInstruction::new(IrOp::LoadConst { dst: 2, const_index: str_idx }, ValueKind::String, 2));
    program.push(IrInstruction::new(IrOp::ConcatString { dst: 3, lhs: 2, rhs: 1 }, ValueKind::String, 3));
    program.push(IrInstruction::new(IrOp::Return, ValueKind::Boxed, 4));

    let mut backend = backend();
    let entry = backend.compile_ir(&program, chunk).expect("compiles");

    let mut vm = Vm::new(4);
    assert!(backend.enter(&mut vm, &entry));
    assert_eq!(vm.register(3).as_str(), Some("x7"));
}

/// Scenario 4: a `MakeArray` whose external allocator requests a GC pause
/// mid-run bails out right there, after the instruction ahead of it has
/// already run — not merely because of the unconditional per-instruction
/// preamble poll every op gets regardless of its own semantics.
#[test]
fn make_array_bails_out_when_its_allocator_requests_a_gc_pause() {
    let mut chunk = Chunk::with_code(vec![0u8; 3]);
    let const_idx = chunk.add_constant(Constant::I32(7));
    let chunk = Rc::new(chunk);

    let mut program = IrProgram::new(chunk.as_ref(), 3, 1, 0, 3);
    program.push(IrInstruction::new(IrOp::LoadConst { dst: 0, const_index: const_idx }, ValueKind::I32, 0));
    program.push(IrInstruction::new(
        IrOp::MakeArray { dst: 1, first_reg: 0, count: 0 },
        ValueKind::Boxed,
        1,
    ));
    program.push(IrInstruction::new(IrOp::Return, ValueKind::Boxed, 2));

    let mut backend = backend();
    let entry = backend.compile_ir(&program, chunk).expect("compiles");

    let mut vm = Vm::new(4);
    vm.jit_alloc_triggers_gc = true;

    assert!(!backend.enter(&mut vm, &entry));
    assert_eq!(vm.register(0), Value::I32(7), "the LoadConst ahead of MakeArray ran to completion");
    assert!(!vm.jit_alloc_triggers_gc, "MakeArray's helper path consumed the simulated GC request");
    assert!(!vm.jit_native_slow_path_pending, "the safepoint poll consumes the flag in turn");
    assert!(vm.is_loop_blocked(1));
}

/// Scenario 5: a vector-flagged pair of `AddI32` instructions and their
/// scalar counterparts agree on every register they touch, over many
/// random input pairs — the interpreter has no separate SIMD path to
/// diverge from the scalar one.
#[test]
fn vector_pair_matches_scalar_pair_differentially() {
    use rand::Rng;

    let chunk = Rc::new(Chunk::with_code(vec![0u8; 1]));

    let build = |flags: (OptFlags, OptFlags)| {
        let mut program = IrProgram::new(chunk.as_ref(), 0, 0, 0, 1);
        program.push(
            IrInstruction::new(
                IrOp::Arith { op: ArithOp::Add, dst: 4, lhs: 0, rhs: 1 },
                ValueKind::I32,
                0,
            )
            .with_flags(flags.0),
        );
        program.push(
            IrInstruction::new(
                IrOp::Arith { op: ArithOp::Add, dst: 5, lhs: 2, rhs: 3 },
                ValueKind::I32,
                0,
            )
            .with_flags(flags.1),
        );
        program.push(IrInstruction::new(IrOp::Return, ValueKind::Boxed, 0));
        program
    };

    let vectorized = build((OptFlags::VECTOR_HEAD, OptFlags::VECTOR_TAIL));
    let scalar = build((OptFlags::NONE, OptFlags::NONE));

    let mut rng = rand::thread_rng();
    for _ in 0..1000 {
        let inputs: [i32; 4] = [rng.gen(), rng.gen(), rng.gen(), rng.gen()];

        let mut vm_a = Vm::new(8);
        let mut vm_b = Vm::new(8);
        for (reg, value) in inputs.iter().enumerate() {
            vm_a.typed_registers.write_i32(reg as u32, *value);
            vm_b.typed_registers.write_i32(reg as u32, *value);
        }

        orus_jit::jit::interp::run(&mut vm_a, &vectorized);
        orus_jit::jit::interp::run(&mut vm_b, &scalar);

        assert_eq!(vm_a.typed_registers.read_i32(4), vm_b.typed_registers.read_i32(4));
        assert_eq!(vm_a.typed_registers.read_i32(5), vm_b.typed_registers.read_i32(5));
    }
}

/// Scenario 6: forcing the DynASM-style emitter still produces a working
/// entry that runs without faulting.
#[test]
fn dynasm_forced_fallback_runs_without_fault() {
    let mut backend = Backend::create(BackendConfig {
        force_dynasm: true,
        ..Default::default()
    })
    .expect("host supports the executable arena");

    let entry = backend.compile_noop().expect("the dynasm strategy always falls back cleanly");
    let mut vm = Vm::new(1);
    assert!(backend.enter(&mut vm, &entry));
    assert_eq!(vm.dispatch_count, 1);
}
