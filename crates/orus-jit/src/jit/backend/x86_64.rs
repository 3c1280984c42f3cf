//! The x86-64 linear emitter (`spec.md` §4.4).
//!
//! Lowers the typed `I32` fast path straight to machine code: `LoadConst`,
//! `Move`, `Arith`/`Compare`, the fused `IncCmpJump`/`DecCmpJump` loop step,
//! `Safepoint`, and `Return`. Every other value kind and every other
//! operation (strings, arrays, enums, iterators, calls, `Convert`) returns
//! [`CodegenError::UnsupportedOp`], which sends the whole program to the
//! next strategy in the cascade — this emitter either lowers a block
//! entirely or not at all, it never partially compiles one.
//!
//! Virtual registers 0-3 are pinned to the callee-saved GPRs `r12`-`r15` for
//! the native block's whole lifetime: loaded once at entry via
//! [`helpers::try_load_i32`], stored back once before every exit via
//! [`helpers::store_i32`]. Pinning loop-carried state in callee-saved
//! registers means a `poll_native` call at a loop's safepoint can't clobber
//! it — `poll_native` only touches caller-saved registers per the System V
//! ABI. Registers beyond index 3 aren't modeled here (a real allocator would
//! spill); programs that use one fall back to the helper stub.

use super::{offset_index, CodeBuffer, CodegenError, PatchKind};
use crate::jit::ir::{ArithOp, CompareOp, IrOp, IrProgram, LoopCompare};
use crate::jit::runtime::{helpers, safepoint};
use crate::runtime::ValueKind;

const MAX_FAST_REGISTER: u32 = 3;

/// Maps a virtual register to the 4-bit encoding of its pinned physical
/// GPR (`r12`-`r15`), or `None` if it falls outside the fast bank.
fn physical_reg(virtual_reg: u32) -> Option<u8> {
    match virtual_reg {
        0 => Some(12),
        1 => Some(13),
        2 => Some(14),
        3 => Some(15),
        _ => None,
    }
}

/// Every virtual register this program touches, restricted to `0..=3`; used
/// both for the eligibility pre-check and to decide which registers the
/// prologue/epilogue load and store.
fn used_registers(program: &IrProgram<'_>) -> Result<Vec<u32>, CodegenError> {
    let mut regs = Vec::new();
    let mut note = |r: u32, regs: &mut Vec<u32>| -> Result<(), CodegenError> {
        if r > MAX_FAST_REGISTER {
            return Err(CodegenError::UnsupportedOp(format!("register {r} exceeds fast bank")));
        }
        if !regs.contains(&r) {
            regs.push(r);
        }
        Ok(())
    };
    for instr in &program.instructions {
        if instr.value_kind != ValueKind::I32 && operand_registers(&instr.op).next().is_some() {
            return Err(CodegenError::UnsupportedOp(format!("{:?} not I32", instr.op)));
        }
        for r in operand_registers(&instr.op) {
            note(r, &mut regs)?;
        }
    }
    Ok(regs)
}

/// Every register an op reads or writes, in no particular order.
fn operand_registers(op: &IrOp) -> impl Iterator<Item = u32> + '_ {
    let regs: Vec<u32> = match op {
        IrOp::LoadConst { dst, .. } => vec![*dst],
        IrOp::Move { dst, src, .. } => vec![*dst, *src],
        IrOp::Arith { dst, lhs, rhs, .. } => vec![*dst, *lhs, *rhs],
        IrOp::Compare { dst, lhs, rhs, .. } => vec![*dst, *lhs, *rhs],
        IrOp::IncCmpJump { counter_reg, limit_reg, .. }
        | IrOp::DecCmpJump { counter_reg, limit_reg, .. } => vec![*counter_reg, *limit_reg],
        IrOp::Safepoint | IrOp::Return | IrOp::LoopBack | IrOp::JumpShort { .. } | IrOp::JumpBackShort { .. } => {
            vec![]
        }
        _ => vec![],
    };
    regs.into_iter()
}

/// Rejects any instruction this emitter can't lower at all (before touching
/// the buffer), so `emit` either fully succeeds or fails up front.
pub(crate) fn check_supported(op: &IrOp) -> Result<(), CodegenError> {
    match op {
        IrOp::LoadConst { .. }
        | IrOp::Move { .. }
        | IrOp::Safepoint
        | IrOp::Return
        | IrOp::LoopBack
        | IrOp::JumpBackShort { .. } => Ok(()),
        IrOp::Arith { op, .. } => match op {
            ArithOp::Add | ArithOp::Sub | ArithOp::Mul => Ok(()),
            ArithOp::Div | ArithOp::Mod => Err(CodegenError::UnsupportedOp("div/mod".into())),
        },
        IrOp::Compare { .. } => Ok(()),
        IrOp::JumpShort { .. } => Ok(()),
        IrOp::IncCmpJump { .. } | IrOp::DecCmpJump { .. } => Ok(()),
        other => Err(CodegenError::UnsupportedOp(format!("{other:?}"))),
    }
}

pub fn emit(program: &IrProgram<'_>) -> Result<Vec<u8>, CodegenError> {
    for instr in &program.instructions {
        check_supported(&instr.op)?;
    }
    let active = used_registers(program)?;
    let offsets = offset_index(program);

    let mut buf = CodeBuffer::new();
    let mut ir_native_offsets = vec![0usize; program.instructions.len()];

    emit_prologue(&mut buf, &active)?;

    for (idx, instr) in program.instructions.iter().enumerate() {
        ir_native_offsets[idx] = buf.offset();
        emit_instruction(&mut buf, instr, &active, &offsets, program)?;
    }

    buf.resolve(&ir_native_offsets)
}

/// Pushes every pinned register, then loads each from the typed register
/// file through [`helpers::try_load_i32`]. If any load's guard misses, every
/// pushed register is popped back (undoing the whole prologue) and the
/// block returns `false` so the caller falls back to the interpreter — this
/// is the only place a guard miss can still occur once the tier controller
/// has decided a loop is hot enough to specialize, since it normally only
/// promotes loops whose registers have stayed monomorphic.
fn emit_prologue(buf: &mut CodeBuffer, active: &[u32]) -> Result<(), CodegenError> {
    for &reg in active {
        push_reg(buf, physical_reg(reg).expect("checked by used_registers"));
    }

    let mut guard_miss_jumps = Vec::new();
    for &reg in active {
        let p = physical_reg(reg).expect("checked by used_registers");
        mov_esi_imm32(buf, reg);
        sub_rsp_imm8(buf, 16);
        mov_rdx_rsp(buf);
        call_abs(buf, helpers::try_load_i32 as usize as u64);
        test_al_al(buf);
        guard_miss_jumps.push(buf.offset());
        buf.push_bytes(&[0x0F, 0x84, 0, 0, 0, 0]); // jz guard_miss (placeholder)
        mov_physical_from_stack(buf, p);
        add_rsp_imm8(buf, 16);
    }

    let guard_miss = buf.offset();
    // Exactly one load's temp slot is ever outstanding when a jz here fires
    // (the current iteration's — every prior iteration already popped its
    // own slot), so unwinding needs exactly one `add rsp, 16` regardless of
    // which register's guard missed.
    add_rsp_imm8(buf, 16);
    for &reg in active.iter().rev() {
        pop_reg(buf, physical_reg(reg).expect("checked"));
    }
    buf.push_bytes(&[0x31, 0xC0, 0xC3]); // xor eax,eax; ret

    for patch_offset in guard_miss_jumps {
        let rel = (guard_miss as i64 - (patch_offset as i64 + 6)) as i32;
        buf.bytes[patch_offset + 2..patch_offset + 6].copy_from_slice(&rel.to_le_bytes());
    }
    Ok(())
}

fn push_reg(buf: &mut CodeBuffer, reg: u8) {
    // push r12-r15 needs a REX.B prefix since their encoding is 8..=15.
    buf.push_u8(0x41);
    buf.push_u8(0x50 | (reg & 0x7));
}

fn pop_reg(buf: &mut CodeBuffer, reg: u8) {
    buf.push_u8(0x41);
    buf.push_u8(0x58 | (reg & 0x7));
}

/// `mov esi, imm32` — every helper call here passes the virtual register
/// index as its second argument in `esi`.
fn mov_esi_imm32(buf: &mut CodeBuffer, imm: u32) {
    buf.push_u8(0xBE);
    buf.push_u32_le(imm);
}

fn sub_rsp_imm8(buf: &mut CodeBuffer, imm: u8) {
    buf.push_bytes(&[0x48, 0x83, 0xEC, imm]);
}

fn add_rsp_imm8(buf: &mut CodeBuffer, imm: u8) {
    buf.push_bytes(&[0x48, 0x83, 0xC4, imm]);
}

fn mov_rdx_rsp(buf: &mut CodeBuffer) {
    // lea rdx, [rsp]
    buf.push_bytes(&[0x48, 0x8D, 0x14, 0x24]);
}

fn mov_physical_from_stack(buf: &mut CodeBuffer, physical: u8) {
    // mov r(12-15)d, dword [rsp]
    buf.push_u8(0x44);
    buf.push_u8(0x8B);
    buf.push_u8(0x04 | ((physical & 0x7) << 3));
    buf.push_u8(0x24);
}

fn test_al_al(buf: &mut CodeBuffer) {
    buf.push_bytes(&[0x84, 0xC0]);
}

fn call_abs(buf: &mut CodeBuffer, target: u64) {
    // mov rax, imm64; call rax
    buf.push_bytes(&[0x48, 0xB8]);
    buf.push_i64_le(target as i64);
    buf.push_bytes(&[0xFF, 0xD0]);
}

fn emit_instruction(
    buf: &mut CodeBuffer,
    instr: &crate::jit::ir::IrInstruction,
    active: &[u32],
    offsets: &rustc_hash::FxHashMap<u32, usize>,
    program: &IrProgram<'_>,
) -> Result<(), CodegenError> {
    match &instr.op {
        IrOp::LoadConst { dst, const_index } => {
            let constant = program
                .source_chunk
                .constant(*const_index)
                .map_err(|_| CodegenError::UnsupportedOp("constant out of range".into()))?;
            let imm = match constant {
                crate::bytecode::Constant::I32(v) => *v,
                _ => return Err(CodegenError::UnsupportedOp("non-i32 constant".into())),
            };
            let p = physical_reg(*dst).expect("checked");
            mov_physical_imm32(buf, p, imm as u32);
            Ok(())
        }
        IrOp::Move { dst, src, .. } => {
            let d = physical_reg(*dst).expect("checked");
            let s = physical_reg(*src).expect("checked");
            mov_physical_physical(buf, d, s);
            Ok(())
        }
        IrOp::Arith { op, dst, lhs, rhs } => {
            let d = physical_reg(*dst).expect("checked");
            let l = physical_reg(*lhs).expect("checked");
            let r = physical_reg(*rhs).expect("checked");
            if d != l {
                mov_physical_physical(buf, d, l);
            }
            match op {
                ArithOp::Add => add_physical_physical(buf, d, r),
                ArithOp::Sub => sub_physical_physical(buf, d, r),
                ArithOp::Mul => imul_physical_physical(buf, d, r),
                _ => unreachable!("checked in check_supported"),
            }
            Ok(())
        }
        IrOp::Compare { op, dst, lhs, rhs } => {
            let l = physical_reg(*lhs).expect("checked");
            let r = physical_reg(*rhs).expect("checked");
            let d = physical_reg(*dst).expect("checked");
            cmp_physical_physical(buf, l, r);
            setcc_into(buf, d, *op);
            Ok(())
        }
        IrOp::JumpShort { .. } => {
            let target = super::branch_target(instr, program).expect("branch");
            let target_idx = *offsets.get(&target).ok_or(CodegenError::RelocationOutOfRange)?;
            jmp_rel32(buf, target_idx);
            Ok(())
        }
        IrOp::JumpBackShort { .. } | IrOp::LoopBack => {
            let target = super::branch_target(instr, program).expect("branch");
            let target_idx = *offsets.get(&target).ok_or(CodegenError::RelocationOutOfRange)?;
            jmp_rel32(buf, target_idx);
            Ok(())
        }
        IrOp::IncCmpJump { counter_reg, limit_reg, step, compare, .. } => {
            emit_fused_loop(buf, active, offsets, program, instr, *counter_reg, *limit_reg, *step, *compare, true)
        }
        IrOp::DecCmpJump { counter_reg, limit_reg, step, compare, .. } => {
            emit_fused_loop(buf, active, offsets, program, instr, *counter_reg, *limit_reg, *step, *compare, false)
        }
        IrOp::Safepoint => {
            // poll_native returns true when the caller should stop and bail
            // to the interpreter; false means keep running, in which case
            // the pinned registers (just flushed to boxed storage, possibly
            // moved by GC) need reloading before the loop continues.
            emit_epilogue_store(buf, active);
            call_abs(buf, safepoint::poll_native as usize as u64);
            test_al_al(buf);
            let jnz_bail_patch = buf.offset();
            buf.push_bytes(&[0x0F, 0x85, 0, 0, 0, 0]); // jnz bail
            emit_reload(buf, active);
            let jmp_over_bail_patch = buf.offset();
            buf.push_u8(0xE9);
            buf.push_u32_le(0); // jmp continue
            let bail_label = buf.offset();
            let rel = (bail_label as i64 - (jnz_bail_patch as i64 + 6)) as i32;
            buf.bytes[jnz_bail_patch + 2..jnz_bail_patch + 6].copy_from_slice(&rel.to_le_bytes());
            emit_bail(buf, active);
            let continue_label = buf.offset();
            let rel = (continue_label as i64 - (jmp_over_bail_patch as i64 + 5)) as i32;
            buf.bytes[jmp_over_bail_patch + 1..jmp_over_bail_patch + 5].copy_from_slice(&rel.to_le_bytes());
            Ok(())
        }
        IrOp::Return => {
            emit_epilogue_store(buf, active);
            for &reg in active.iter().rev() {
                pop_reg(buf, physical_reg(reg).expect("checked"));
            }
            // mov al, 1; ret
            buf.push_bytes(&[0xB0, 0x01, 0xC3]);
            Ok(())
        }
        other => Err(CodegenError::UnsupportedOp(format!("{other:?}"))),
    }
}

/// Stores every pinned register back into the boxed/typed register file via
/// [`helpers::store_i32`]. Called before any exit (Return, a safepoint
/// bailout) so the rest of the VM always observes up-to-date values.
fn emit_epilogue_store(buf: &mut CodeBuffer, active: &[u32]) {
    for &reg in active {
        let p = physical_reg(reg).expect("checked");
        mov_edx_physical(buf, p);
        mov_esi_imm32(buf, reg);
        call_abs(buf, helpers::store_i32 as usize as u64);
    }
}

/// Re-runs the entry sequence's register loads (used when a safepoint asks
/// the native block to keep running after flushing).
fn emit_reload(buf: &mut CodeBuffer, active: &[u32]) {
    for &reg in active {
        let p = physical_reg(reg).expect("checked");
        mov_esi_imm32(buf, reg);
        sub_rsp_imm8(buf, 16);
        mov_rdx_rsp(buf);
        call_abs(buf, helpers::try_load_i32 as usize as u64);
        mov_physical_from_stack(buf, p);
        add_rsp_imm8(buf, 16);
    }
}

/// The shared "stop running native code, report failure" tail: pop every
/// pinned register back to the caller's values, then `xor eax,eax; ret`.
fn emit_bail(buf: &mut CodeBuffer, active: &[u32]) {
    for &reg in active.iter().rev() {
        pop_reg(buf, physical_reg(reg).expect("checked"));
    }
    buf.push_bytes(&[0x31, 0xC0, 0xC3]); // xor eax,eax; ret
}

fn mov_physical_imm32(buf: &mut CodeBuffer, physical: u8, imm: u32) {
    buf.push_u8(0x41); // REX.B
    buf.push_u8(0xB8 | (physical & 0x7));
    buf.push_u32_le(imm);
}

fn mov_physical_physical(buf: &mut CodeBuffer, dst: u8, src: u8) {
    // mov dst_d, src_d with REX.R/B for the extended registers.
    buf.push_u8(0x45);
    buf.push_u8(0x89);
    buf.push_u8(0xC0 | ((src & 0x7) << 3) | (dst & 0x7));
}

fn add_physical_physical(buf: &mut CodeBuffer, dst: u8, src: u8) {
    buf.push_u8(0x45);
    buf.push_u8(0x01);
    buf.push_u8(0xC0 | ((src & 0x7) << 3) | (dst & 0x7));
}

fn sub_physical_physical(buf: &mut CodeBuffer, dst: u8, src: u8) {
    buf.push_u8(0x45);
    buf.push_u8(0x29);
    buf.push_u8(0xC0 | ((src & 0x7) << 3) | (dst & 0x7));
}

fn imul_physical_physical(buf: &mut CodeBuffer, dst: u8, src: u8) {
    // two-operand imul: dst *= src
    buf.push_u8(0x45);
    buf.push_u8(0x0F);
    buf.push_u8(0xAF);
    buf.push_u8(0xC0 | ((dst & 0x7) << 3) | (src & 0x7));
}

fn cmp_physical_physical(buf: &mut CodeBuffer, lhs: u8, rhs: u8) {
    buf.push_u8(0x45);
    buf.push_u8(0x39);
    buf.push_u8(0xC0 | ((rhs & 0x7) << 3) | (lhs & 0x7));
}

fn mov_edx_physical(buf: &mut CodeBuffer, physical: u8) {
    buf.push_u8(0x44);
    buf.push_u8(0x89);
    buf.push_u8(0xC2 | ((physical & 0x7) << 3));
}

fn setcc_into(buf: &mut CodeBuffer, dst: u8, op: CompareOp) {
    let opcode = match op {
        CompareOp::Lt => 0x9C, // setl
        CompareOp::Le => 0x9E, // setle
        CompareOp::Gt => 0x9F, // setg
        CompareOp::Ge => 0x9D, // setge
        CompareOp::Eq => 0x94, // sete
        CompareOp::Ne => 0x95, // setne
    };
    // setcc al; movzx dst_d, al
    buf.push_bytes(&[0x0F, opcode, 0xC0]);
    buf.push_u8(0x41); // REX.B
    buf.push_u8(0x0F);
    buf.push_u8(0xB6);
    buf.push_u8(0xC0 | ((dst & 0x7) << 3));
}

fn jmp_rel32(buf: &mut CodeBuffer, target_ir_index: usize) {
    buf.push_u8(0xE9);
    buf.push_patch(target_ir_index, PatchKind::Rel32);
}

#[allow(clippy::too_many_arguments)]
fn emit_fused_loop(
    buf: &mut CodeBuffer,
    active: &[u32],
    offsets: &rustc_hash::FxHashMap<u32, usize>,
    program: &IrProgram<'_>,
    instr: &crate::jit::ir::IrInstruction,
    counter_reg: u32,
    limit_reg: u32,
    step: i8,
    compare: LoopCompare,
    is_inc: bool,
) -> Result<(), CodegenError> {
    if step == 0 || is_inc != (step > 0) {
        return Err(CodegenError::UnsupportedOp("inconsistent loop step".into()));
    }
    let counter = physical_reg(counter_reg).expect("checked");
    let limit = physical_reg(limit_reg).expect("checked");

    // add/sub counter, |step| (8-bit immediate form).
    buf.push_u8(0x41); // REX.B
    buf.push_u8(0x83);
    let modrm = if is_inc { 0xC0 } else { 0xE8 };
    buf.push_u8(modrm | (counter & 0x7));
    buf.push_u8(step.unsigned_abs());

    // jo -> bail: mirrors the reference interpreter's `overflowing_add`/
    // `overflowing_sub` deopt (step_fused_loop bails with Overflow) so a
    // wrapped counter never silently diverges from the interpreted path.
    let jo_patch = buf.offset();
    buf.push_bytes(&[0x0F, 0x80, 0, 0, 0, 0]); // jo rel32 (placeholder)

    cmp_physical_physical(buf, counter, limit);

    let target = super::branch_target(instr, program).expect("branch");
    let target_idx = *offsets.get(&target).ok_or(CodegenError::RelocationOutOfRange)?;
    // Jcc rel32: jump back into the loop while the comparison holds.
    let opcode = match compare {
        LoopCompare::Lt => 0x8C, // jl
        LoopCompare::Gt => 0x8F, // jg
    };
    buf.push_bytes(&[0x0F, opcode]);
    buf.push_patch(target_idx, PatchKind::Rel32);

    // Skip the overflow-bail block on the normal (non-overflowing) path.
    let jmp_over_bail_patch = buf.offset();
    buf.push_u8(0xE9);
    buf.push_u32_le(0);

    let bail_label = buf.offset();
    let rel = (bail_label as i64 - (jo_patch as i64 + 6)) as i32;
    buf.bytes[jo_patch + 2..jo_patch + 6].copy_from_slice(&rel.to_le_bytes());
    emit_bail(buf, active);

    let continue_label = buf.offset();
    let rel = (continue_label as i64 - (jmp_over_bail_patch as i64 + 5)) as i32;
    buf.bytes[jmp_over_bail_patch + 1..jmp_over_bail_patch + 5].copy_from_slice(&rel.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Chunk, Constant};
    use crate::jit::ir::IrInstruction;

    fn chunk_with_consts(consts: Vec<Constant>) -> Chunk {
        let mut chunk = Chunk::with_code(vec![0u8; 32]);
        for c in consts {
            chunk.add_constant(c);
        }
        chunk
    }

    #[test]
    fn emits_nonempty_code_for_return_only_program() {
        let chunk = chunk_with_consts(vec![]);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 1);
        program.push(IrInstruction::new(IrOp::Return, ValueKind::Boxed, 0));
        let bytes = emit(&program).expect("return-only program always lowers");
        assert!(!bytes.is_empty());
    }

    #[test]
    fn rejects_register_outside_fast_bank() {
        let chunk = chunk_with_consts(vec![Constant::I32(1)]);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 1);
        program.push(IrInstruction::new(
            IrOp::LoadConst { dst: 9, const_index: 0 },
            ValueKind::I32,
            0,
        ));
        assert!(emit(&program).is_err());
    }

    #[test]
    fn rejects_non_i32_arith() {
        let chunk = chunk_with_consts(vec![]);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 1);
        program.push(IrInstruction::new(
            IrOp::Arith { op: ArithOp::Add, dst: 0, lhs: 0, rhs: 1 },
            ValueKind::F64,
            0,
        ));
        assert!(emit(&program).is_err());
    }

    #[test]
    fn lowers_typed_add_loop() {
        let chunk = chunk_with_consts(vec![Constant::I32(0), Constant::I32(1_000_000)]);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 8);
        program.push(IrInstruction::new(
            IrOp::LoadConst { dst: 0, const_index: 0 },
            ValueKind::I32,
            0,
        ));
        program.push(IrInstruction::new(
            IrOp::LoadConst { dst: 1, const_index: 1 },
            ValueKind::I32,
            2,
        ));
        program.push(
            IrInstruction::new(
                IrOp::IncCmpJump {
                    counter_reg: 0,
                    limit_reg: 1,
                    step: 1,
                    compare: LoopCompare::Lt,
                    jump_offset: -4,
                },
                ValueKind::I32,
                4,
            ),
        );
        program.push(IrInstruction::new(IrOp::Return, ValueKind::Boxed, 6));
        let bytes = emit(&program).expect("typed add loop lowers natively");
        assert!(bytes.len() > 16);
    }
}
