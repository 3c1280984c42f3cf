//! Parity & debug diagnostics.
//!
//! The corpus this backend is grounded on carries no logging crate inside
//! its JIT subsystem; the observed idiom for this concern is structured
//! data a caller inspects or renders, not log lines, so that's what lives
//! here: a disassembly listing, a parity counter comparing interpreted vs.
//! native outcomes, and a small ring buffer of recent backend events.

use crate::jit::interp::BailoutReason;
use crate::jit::ir::{IrOp, IrProgram};
use std::collections::VecDeque;

/// Ordered `(code_offset, mnemonic)` pairs produced by a linear emitter's
/// disassembly pass.
#[derive(Debug, Default, Clone)]
pub struct DisassemblyListing {
    entries: Vec<(u32, String)>,
}

impl DisassemblyListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, code_offset: u32, mnemonic: impl Into<String>) {
        self.entries.push((code_offset, mnemonic.into()));
    }

    pub fn entries(&self) -> &[(u32, String)] {
        &self.entries
    }
}

/// Builds a human-readable disassembly of `program`, one `(bytecode_offset,
/// mnemonic)` entry per IR instruction, for whichever strategy
/// `Backend::compile_ir` ends up using. This is IR-level text rather than a
/// true per-target disassembly of the emitted bytes: every strategy (linear
/// emitter, DynASM fallback, helper stub) implements the same IR semantics,
/// so the mnemonic an inspector cares about — "what operation runs here" —
/// is identical regardless of which one actually produced the machine code.
pub fn disassemble(program: &IrProgram<'_>) -> DisassemblyListing {
    let mut listing = DisassemblyListing::new();
    for instr in &program.instructions {
        listing.push(instr.bytecode_offset, mnemonic(&instr.op));
    }
    listing
}

fn mnemonic(op: &IrOp) -> String {
    match op {
        IrOp::LoadConst { dst, const_index } => format!("load.const r{dst}, #{const_index}"),
        IrOp::Move { dst, src, typed } => {
            format!("move{} r{dst}, r{src}", if *typed { ".typed" } else { "" })
        }
        IrOp::Arith { op, dst, lhs, rhs } => format!("{op:?}.arith r{dst}, r{lhs}, r{rhs}"),
        IrOp::Unary { op, dst, src } => format!("{op:?}.unary r{dst}, r{src}"),
        IrOp::Compare { op, dst, lhs, rhs } => format!("{op:?}.cmp r{dst}, r{lhs}, r{rhs}"),
        IrOp::Convert { dst, src, from, to } => format!("convert r{dst}, r{src} ({from} -> {to})"),
        IrOp::ConcatString { dst, lhs, rhs } => format!("concat.str r{dst}, r{lhs}, r{rhs}"),
        IrOp::ToString { dst, src } => format!("to.str r{dst}, r{src}"),
        IrOp::TypeOf { dst, src } => format!("type.of r{dst}, r{src}"),
        IrOp::IsType { dst, src, type_const } => format!("is.type r{dst}, r{src}, #{type_const}"),
        IrOp::MakeArray { dst, first_reg, count } => format!("make.array r{dst}, r{first_reg}, #{count}"),
        IrOp::ArrayPush { array_reg, value_reg } => format!("array.push r{array_reg}, r{value_reg}"),
        IrOp::ArrayPop { dst, array_reg } => format!("array.pop r{dst}, r{array_reg}"),
        IrOp::EnumNew { dst, type_const, variant_const, variant_index, payload_start, payload_count } => {
            format!(
                "enum.new r{dst}, #{type_const}, #{variant_const}, variant={variant_index}, payload=r{payload_start}..+{payload_count}"
            )
        }
        IrOp::GetIter { dst, src } => format!("get.iter r{dst}, r{src}"),
        IrOp::IterNext { value_reg, iterator_reg, has_value_reg } => {
            format!("iter.next r{value_reg}, r{iterator_reg}, has=r{has_value_reg}")
        }
        IrOp::Range { dst, start_reg, end_reg } => format!("range r{dst}, r{start_reg}, r{end_reg}"),
        IrOp::Print { src } => format!("print r{src}"),
        IrOp::AssertEq { lhs, rhs } => format!("assert.eq r{lhs}, r{rhs}"),
        IrOp::TimeStamp { dst } => format!("time.stamp r{dst}"),
        IrOp::CallNative { dst, first_arg_reg, arg_count, native_index } => {
            format!("call.native r{dst}, r{first_arg_reg}..+{arg_count}, #{native_index}")
        }
        IrOp::CallForeign { dst, first_arg_reg, arg_count, foreign_index } => {
            format!("call.foreign r{dst}, r{first_arg_reg}..+{arg_count}, #{foreign_index}")
        }
        IrOp::JumpShort { offset, .. } => format!("jump.short {offset:+}"),
        IrOp::JumpBackShort { back_offset } => format!("jump.back -{back_offset}"),
        IrOp::JumpIfNotShort { predicate_reg, offset, .. } => {
            format!("jump.if.not r{predicate_reg}, {offset:+}")
        }
        IrOp::LoopBack => "loop.back".to_string(),
        IrOp::Return => "return".to_string(),
        IrOp::IncCmpJump { counter_reg, limit_reg, step, compare, jump_offset } => {
            format!("inc.cmp.jump r{counter_reg}, r{limit_reg}, step={step}, {compare:?}, {jump_offset:+}")
        }
        IrOp::DecCmpJump { counter_reg, limit_reg, step, compare, jump_offset } => {
            format!("dec.cmp.jump r{counter_reg}, r{limit_reg}, step={step}, {compare:?}, {jump_offset:+}")
        }
        IrOp::Safepoint => "safepoint".to_string(),
    }
}

/// Per-category instruction counters built by `Backend::collect_parity`
/// (`spec.md` §6/§8): pure accounting over an `IrProgram`, with no
/// interpreted/native execution involved. `memory_ops + arithmetic_ops +
/// comparison_ops + safepoints + conversion_ops + helper_ops` always equals
/// the number of instructions categorized, per §8's testable property.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParityReport {
    /// `MakeArray`, `ArrayPush`, `ArrayPop`, `EnumNew`, `GetIter`, `IterNext`, `Range`.
    pub memory_ops: u64,
    /// `Arith`, `Unary`.
    pub arithmetic_ops: u64,
    /// `Compare`, `IsType`.
    pub comparison_ops: u64,
    /// `Safepoint`, plus the implicit per-instruction poll `IncCmpJump`/`DecCmpJump` fold in.
    pub safepoints: u64,
    /// `Convert`, `ToString`, `ConcatString`, `TypeOf`.
    pub conversion_ops: u64,
    /// `LoadConst`, `Move`, `Print`, `AssertEq`, `TimeStamp`, `CallNative`,
    /// `CallForeign`, and control flow (`JumpShort`, `JumpBackShort`,
    /// `JumpIfNotShort`, `LoopBack`, `Return`, `IncCmpJump`, `DecCmpJump`).
    pub helper_ops: u64,
}

impl ParityReport {
    pub fn record_memory(&mut self) {
        self.memory_ops += 1;
    }

    pub fn record_arithmetic(&mut self) {
        self.arithmetic_ops += 1;
    }

    pub fn record_comparison(&mut self) {
        self.comparison_ops += 1;
    }

    pub fn record_safepoint(&mut self) {
        self.safepoints += 1;
    }

    pub fn record_conversion(&mut self) {
        self.conversion_ops += 1;
    }

    pub fn record_helper(&mut self) {
        self.helper_ops += 1;
    }

    /// Total instructions categorized so far; the invariant `collect_parity`
    /// must preserve is that this equals the program's instruction count.
    pub fn total(&self) -> u64 {
        self.memory_ops
            + self.arithmetic_ops
            + self.comparison_ops
            + self.safepoints
            + self.conversion_ops
            + self.helper_ops
    }
}

/// One entry in a [`DebugEventLog`].
#[derive(Debug, Clone)]
pub enum DebugEvent {
    Compiled {
        function_index: u32,
        loop_index: u32,
        code_size: usize,
    },
    Bailout {
        function_index: u32,
        loop_index: u32,
        reason: BailoutReason,
    },
    Invalidated {
        function_index: u32,
        loop_index: u32,
    },
}

/// A fixed-capacity ring buffer of recent backend events, so tests and
/// tooling can inspect what happened without re-running the workload.
pub struct DebugEventLog {
    capacity: usize,
    events: VecDeque<DebugEvent>,
}

impl DebugEventLog {
    pub fn new(capacity: usize) -> Self {
        DebugEventLog {
            capacity: capacity.max(1),
            events: VecDeque::new(),
        }
    }

    pub fn record(&mut self, event: DebugEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn iter(&self) -> impl Iterator<Item = &DebugEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for DebugEventLog {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disassembly_listing_preserves_order() {
        let mut listing = DisassemblyListing::new();
        listing.push(0, "mov eax, 1");
        listing.push(5, "ret");
        assert_eq!(listing.entries()[0].1, "mov eax, 1");
        assert_eq!(listing.entries()[1].0, 5);
    }

    #[test]
    fn parity_report_total_sums_every_category() {
        let mut report = ParityReport::default();
        report.record_memory();
        report.record_arithmetic();
        report.record_comparison();
        report.record_safepoint();
        report.record_conversion();
        report.record_helper();
        assert_eq!(report.total(), 6);
    }

    #[test]
    fn disassemble_emits_one_entry_per_instruction() {
        use crate::bytecode::Chunk;
        use crate::jit::ir::{IrInstruction, IrOp, OptFlags};
        use crate::runtime::ValueKind;

        let _ = OptFlags::NONE;
        let chunk = Chunk::with_code(vec![0u8; 2]);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 2);
        program.push(IrInstruction::new(IrOp::LoadConst { dst: 0, const_index: 0 }, ValueKind::I32, 0));
        program.push(IrInstruction::new(IrOp::Return, ValueKind::Boxed, 1));

        let listing = disassemble(&program);
        assert_eq!(listing.entries().len(), 2);
        assert!(listing.entries()[0].1.starts_with("load.const"));
        assert_eq!(listing.entries()[1].1, "return");
    }

    #[test]
    fn event_log_evicts_oldest_past_capacity() {
        let mut log = DebugEventLog::new(2);
        log.record(DebugEvent::Invalidated { function_index: 0, loop_index: 0 });
        log.record(DebugEvent::Invalidated { function_index: 1, loop_index: 0 });
        log.record(DebugEvent::Invalidated { function_index: 2, loop_index: 0 });
        assert_eq!(log.len(), 2);
        let first = log.iter().next().unwrap();
        assert!(matches!(first, DebugEvent::Invalidated { function_index: 1, .. }));
    }
}
