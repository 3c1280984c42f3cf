//! The AArch64 linear emitter (`spec.md` §4.4).
//!
//! Mirrors [`super::x86_64`]: the same typed-`I32` fast path, the same
//! four-register fast bank, the same fallback-on-`UnsupportedOp` contract.
//! Virtual registers 0-3 are pinned to the callee-saved `x19`-`x22`, saved
//! and restored at the native block's entry/exit via the standard AArch64
//! frame-pointer-chain prologue (`stp`/`ldp` pairs).

use super::{offset_index, CodeBuffer, CodegenError, PatchKind};
use crate::jit::ir::{ArithOp, CompareOp, IrOp, IrProgram, LoopCompare};
use crate::jit::runtime::{helpers, safepoint};
use crate::runtime::ValueKind;

const MAX_FAST_REGISTER: u32 = 3;

/// Maps a virtual register to its pinned physical register number
/// (`x19`-`x22`).
fn physical_reg(virtual_reg: u32) -> Option<u32> {
    match virtual_reg {
        0 => Some(19),
        1 => Some(20),
        2 => Some(21),
        3 => Some(22),
        _ => None,
    }
}

fn used_registers(program: &IrProgram<'_>) -> Result<Vec<u32>, CodegenError> {
    let mut regs = Vec::new();
    for instr in &program.instructions {
        let operands = operand_registers(&instr.op);
        if instr.value_kind != ValueKind::I32 && !operands.is_empty() {
            return Err(CodegenError::UnsupportedOp(format!("{:?} not I32", instr.op)));
        }
        for r in operands {
            if r > MAX_FAST_REGISTER {
                return Err(CodegenError::UnsupportedOp(format!("register {r} exceeds fast bank")));
            }
            if !regs.contains(&r) {
                regs.push(r);
            }
        }
    }
    Ok(regs)
}

fn operand_registers(op: &IrOp) -> Vec<u32> {
    match op {
        IrOp::LoadConst { dst, .. } => vec![*dst],
        IrOp::Move { dst, src, .. } => vec![*dst, *src],
        IrOp::Arith { dst, lhs, rhs, .. } => vec![*dst, *lhs, *rhs],
        IrOp::Compare { dst, lhs, rhs, .. } => vec![*dst, *lhs, *rhs],
        IrOp::IncCmpJump { counter_reg, limit_reg, .. }
        | IrOp::DecCmpJump { counter_reg, limit_reg, .. } => vec![*counter_reg, *limit_reg],
        _ => vec![],
    }
}

pub(crate) fn check_supported(op: &IrOp) -> Result<(), CodegenError> {
    match op {
        IrOp::LoadConst { .. }
        | IrOp::Move { .. }
        | IrOp::Safepoint
        | IrOp::Return
        | IrOp::LoopBack
        | IrOp::JumpBackShort { .. }
        | IrOp::JumpShort { .. }
        | IrOp::Compare { .. }
        | IrOp::IncCmpJump { .. }
        | IrOp::DecCmpJump { .. } => Ok(()),
        IrOp::Arith { op, .. } => match op {
            ArithOp::Add | ArithOp::Sub | ArithOp::Mul => Ok(()),
            ArithOp::Div | ArithOp::Mod => Err(CodegenError::UnsupportedOp("div/mod".into())),
        },
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

/// `stp x(reg), x(reg+1), [sp, #-16]!` pairs for every two pinned registers
/// pushed, then one `try_load_i32` call per register with `x0` (the vm
/// pointer) left untouched across the sequence. A guard miss restores the
/// stack and returns `false` through `w0`.
fn emit_prologue(buf: &mut CodeBuffer, active: &[u32]) -> Result<(), CodegenError> {
    for &reg in active {
        str_pre_index(buf, physical_reg(reg).expect("checked"));
    }

    let mut guard_miss_jumps = Vec::new();
    for &reg in active {
        let p = physical_reg(reg).expect("checked");
        movz_w1(buf, reg);
        sub_sp_imm(buf, 16);
        mov_x2_sp(buf);
        call_abs(buf, helpers::try_load_i32 as usize as u64);
        // cbz w0, guard_miss
        guard_miss_jumps.push(buf.offset());
        buf.push_u32_le(0); // placeholder CBZ
        ldr_w_from_sp(buf, p);
        add_sp_imm(buf, 16);
    }

    let guard_miss = buf.offset();
    add_sp_imm(buf, 16);
    for &reg in active.iter().rev() {
        ldr_post_index(buf, physical_reg(reg).expect("checked"));
    }
    mov_w0_zero(buf);
    ret(buf);

    for patch_offset in guard_miss_jumps {
        let rel = (guard_miss as i64 - patch_offset as i64) / 4;
        let instr = 0x3400_0000u32 | (((rel as u32) & 0x7FFFF) << 5); // CBZ w0, rel
        buf.bytes[patch_offset..patch_offset + 4].copy_from_slice(&instr.to_le_bytes());
    }
    Ok(())
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
                crate::bytecode::Constant::I32(v) => *v as u32,
                _ => return Err(CodegenError::UnsupportedOp("non-i32 constant".into())),
            };
            movz_movk_w(buf, physical_reg(*dst).expect("checked"), imm);
            Ok(())
        }
        IrOp::Move { dst, src, .. } => {
            mov_reg_reg(buf, physical_reg(*dst).expect("checked"), physical_reg(*src).expect("checked"));
            Ok(())
        }
        IrOp::Arith { op, dst, lhs, rhs } => {
            let d = physical_reg(*dst).expect("checked");
            let l = physical_reg(*lhs).expect("checked");
            let r = physical_reg(*rhs).expect("checked");
            match op {
                ArithOp::Add => add_w(buf, d, l, r),
                ArithOp::Sub => sub_w(buf, d, l, r),
                ArithOp::Mul => mul_w(buf, d, l, r),
                _ => unreachable!("checked in check_supported"),
            }
            Ok(())
        }
        IrOp::Compare { op, dst, lhs, rhs } => {
            let l = physical_reg(*lhs).expect("checked");
            let r = physical_reg(*rhs).expect("checked");
            let d = physical_reg(*dst).expect("checked");
            cmp_w(buf, l, r);
            cset_w(buf, d, *op);
            Ok(())
        }
        IrOp::JumpShort { .. } | IrOp::JumpBackShort { .. } | IrOp::LoopBack => {
            let target = super::branch_target(instr, program).expect("branch");
            let target_idx = *offsets.get(&target).ok_or(CodegenError::RelocationOutOfRange)?;
            unconditional_branch(buf, target_idx);
            Ok(())
        }
        IrOp::IncCmpJump { counter_reg, limit_reg, step, compare, .. } => {
            emit_fused_loop(buf, active, offsets, program, instr, *counter_reg, *limit_reg, *step, *compare, true)
        }
        IrOp::DecCmpJump { counter_reg, limit_reg, step, compare, .. } => {
            emit_fused_loop(buf, active, offsets, program, instr, *counter_reg, *limit_reg, *step, *compare, false)
        }
        IrOp::Safepoint => {
            emit_epilogue_store(buf, active);
            call_abs(buf, safepoint::poll_native as usize as u64);
            // cbz w0, continue (w0 == 0 means "keep running")
            let cbz_patch = buf.offset();
            buf.push_u32_le(0);
            emit_bail(buf, active);
            let continue_label = buf.offset();
            let rel = (continue_label as i64 - cbz_patch as i64) / 4;
            let encoded = 0x3400_0000u32 | (((rel as u32) & 0x7FFFF) << 5);
            buf.bytes[cbz_patch..cbz_patch + 4].copy_from_slice(&encoded.to_le_bytes());
            emit_reload(buf, active);
            Ok(())
        }
        IrOp::Return => {
            emit_epilogue_store(buf, active);
            for &reg in active.iter().rev() {
                ldr_post_index(buf, physical_reg(reg).expect("checked"));
            }
            mov_w0_one(buf);
            ret(buf);
            Ok(())
        }
        other => Err(CodegenError::UnsupportedOp(format!("{other:?}"))),
    }
}

fn emit_epilogue_store(buf: &mut CodeBuffer, active: &[u32]) {
    for &reg in active {
        let p = physical_reg(reg).expect("checked");
        mov_x2_reg(buf, p);
        movz_w1(buf, reg);
        call_abs(buf, helpers::store_i32 as usize as u64);
    }
}

fn emit_reload(buf: &mut CodeBuffer, active: &[u32]) {
    for &reg in active {
        let p = physical_reg(reg).expect("checked");
        movz_w1(buf, reg);
        sub_sp_imm(buf, 16);
        mov_x2_sp(buf);
        call_abs(buf, helpers::try_load_i32 as usize as u64);
        ldr_w_from_sp(buf, p);
        add_sp_imm(buf, 16);
    }
}

/// Pops every pinned register back to the caller's values and returns
/// `false` — the same "stop native execution" tail as the entry guard-miss
/// path, reached from a safepoint when `poll_native` asks for a bailout.
fn emit_bail(buf: &mut CodeBuffer, active: &[u32]) {
    for &reg in active.iter().rev() {
        ldr_post_index(buf, physical_reg(reg).expect("checked"));
    }
    mov_w0_zero(buf);
    ret(buf);
}

// --- encoding helpers -------------------------------------------------

fn str_pre_index(buf: &mut CodeBuffer, reg: u32) {
    // str x(reg), [sp, #-16]!
    let instr = 0xF81F0FE0u32 | reg;
    buf.push_u32_le(instr);
}

fn ldr_post_index(buf: &mut CodeBuffer, reg: u32) {
    // ldr x(reg), [sp], #16
    let instr = 0xF84107E0u32 | reg;
    buf.push_u32_le(instr);
}

fn movz_w1(buf: &mut CodeBuffer, imm: u32) {
    // movz w1, #imm16 (register index fixed to 1, the second argument)
    let instr = 0x52800000u32 | ((imm & 0xFFFF) << 5) | 1;
    buf.push_u32_le(instr);
}

fn movz_movk_w(buf: &mut CodeBuffer, reg: u32, imm: u32) {
    let low = imm & 0xFFFF;
    let high = (imm >> 16) & 0xFFFF;
    buf.push_u32_le(0x52800000u32 | (low << 5) | reg); // movz
    if high != 0 {
        buf.push_u32_le(0x72A00000u32 | (high << 5) | reg); // movk, shift 16
    }
}

fn sub_sp_imm(buf: &mut CodeBuffer, imm: u32) {
    buf.push_u32_le(0xD10003FFu32 | (imm << 10));
}

fn add_sp_imm(buf: &mut CodeBuffer, imm: u32) {
    buf.push_u32_le(0x910003FFu32 | (imm << 10));
}

fn mov_x2_sp(buf: &mut CodeBuffer) {
    // add x2, sp, #0
    buf.push_u32_le(0x910003E2u32);
}

fn mov_x2_reg(buf: &mut CodeBuffer, reg: u32) {
    // orr x2, xzr, reg (mov x2, reg)
    buf.push_u32_le(0xAA0003E2u32 | (reg << 16));
}

fn ldr_w_from_sp(buf: &mut CodeBuffer, reg: u32) {
    // ldr w(reg), [sp]
    buf.push_u32_le(0xB94003E0u32 | reg);
}

fn call_abs(buf: &mut CodeBuffer, target: u64) {
    // load target into x9 via MOVZ/MOVK quadruple, then BLR x9.
    let chunks = [
        (target & 0xFFFF) as u32,
        ((target >> 16) & 0xFFFF) as u32,
        ((target >> 32) & 0xFFFF) as u32,
        ((target >> 48) & 0xFFFF) as u32,
    ];
    for (shift, chunk) in chunks.iter().enumerate() {
        let opcode_base = if shift == 0 { 0xD2800000u32 } else { 0xF2800000u32 };
        buf.push_u32_le(opcode_base | ((shift as u32) << 21) | (chunk << 5) | 9);
    }
    buf.push_u32_le(0xD63F0120u32); // BLR x9
}

fn mov_reg_reg(buf: &mut CodeBuffer, dst: u32, src: u32) {
    buf.push_u32_le(0xAA0003E0u32 | (src << 16) | dst);
}

fn add_w(buf: &mut CodeBuffer, dst: u32, lhs: u32, rhs: u32) {
    buf.push_u32_le(0x0B000000u32 | (rhs << 16) | (lhs << 5) | dst);
}

fn sub_w(buf: &mut CodeBuffer, dst: u32, lhs: u32, rhs: u32) {
    buf.push_u32_le(0x4B000000u32 | (rhs << 16) | (lhs << 5) | dst);
}

fn mul_w(buf: &mut CodeBuffer, dst: u32, lhs: u32, rhs: u32) {
    // madd dst, lhs, rhs, wzr
    buf.push_u32_le(0x1B007C00u32 | (rhs << 16) | (lhs << 5) | dst);
}

fn cmp_w(buf: &mut CodeBuffer, lhs: u32, rhs: u32) {
    // subs wzr, lhs, rhs
    buf.push_u32_le(0x6B00001Fu32 | (rhs << 16) | (lhs << 5));
}

/// `cset` is an alias for `csinc dst, wzr, wzr, invert(cond)` — the encoded
/// condition field is the *inverse* of the comparison being tested.
fn cset_w(buf: &mut CodeBuffer, dst: u32, op: CompareOp) {
    let inverted_cond = match op {
        CompareOp::Lt => 0b1010, // invert(lt) = ge
        CompareOp::Le => 0b1100, // invert(le) = gt
        CompareOp::Gt => 0b1101, // invert(gt) = le
        CompareOp::Ge => 0b1011, // invert(ge) = lt
        CompareOp::Eq => 0b0001, // invert(eq) = ne
        CompareOp::Ne => 0b0000, // invert(ne) = eq
    };
    buf.push_u32_le(0x1A9F07E0u32 | (inverted_cond << 12) | dst);
}

/// `B <label>` — unconditional branch, opcode `0b000101` in bits [31:26].
/// The displacement is left zeroed for [`CodeBuffer::resolve`] to OR in.
fn unconditional_branch(buf: &mut CodeBuffer, target_ir_index: usize) {
    let patch_offset = buf.offset();
    buf.patches.push(super::Patch {
        patch_offset,
        target_ir_index,
        kind: PatchKind::AArch64Branch26,
    });
    buf.push_u32_le(0x1400_0000);
}

fn mov_w0_zero(buf: &mut CodeBuffer) {
    buf.push_u32_le(0x52800000u32); // movz w0, #0
}

fn mov_w0_one(buf: &mut CodeBuffer) {
    buf.push_u32_le(0x52800020u32); // movz w0, #1
}

fn ret(buf: &mut CodeBuffer) {
    buf.push_u32_le(0xD65F03C0u32);
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
    let magnitude = step.unsigned_abs() as u32;

    if is_inc {
        // adds counter, counter, #magnitude (flag-setting form: sets V on overflow)
        buf.push_u32_le(0x31000000u32 | (magnitude << 10) | (counter << 5) | counter);
    } else {
        // subs counter, counter, #magnitude
        buf.push_u32_le(0x71000000u32 | (magnitude << 10) | (counter << 5) | counter);
    }

    // b.vs -> bail: mirrors the reference interpreter's `overflowing_add`/
    // `overflowing_sub` deopt (step_fused_loop bails with Overflow) so a
    // wrapped counter never silently diverges from the interpreted path.
    const COND_VS: u32 = 0b0110;
    let bvs_patch = buf.offset();
    buf.push_u32_le(0x5400_0000 | COND_VS); // B.VS, displacement placeholder

    cmp_w(buf, counter, limit);

    let target = super::branch_target(instr, program).expect("branch");
    let target_idx = *offsets.get(&target).ok_or(CodegenError::RelocationOutOfRange)?;
    // B.cond uses the condition directly (unlike cset's csinc, which inverts it).
    let cond = match compare {
        LoopCompare::Lt => 0b1011u32,
        LoopCompare::Gt => 0b1100u32,
    };
    let patch_offset = buf.offset();
    buf.patches.push(super::Patch {
        patch_offset,
        target_ir_index: target_idx,
        kind: PatchKind::AArch64CondBranch19,
    });
    buf.push_u32_le(0x5400_0000 | cond); // B.cond, displacement left for resolve() to OR in

    // Skip the overflow-bail block on the normal (non-overflowing) path.
    let b_over_bail_patch = buf.offset();
    buf.push_u32_le(0x1400_0000); // B, displacement placeholder

    let bail_label = buf.offset();
    let rel = (bail_label as i64 - bvs_patch as i64) / 4;
    let encoded = 0x5400_0000u32 | (((rel as u32) & 0x7FFFF) << 5) | COND_VS;
    buf.bytes[bvs_patch..bvs_patch + 4].copy_from_slice(&encoded.to_le_bytes());
    emit_bail(buf, active);

    let continue_label = buf.offset();
    let rel = (continue_label as i64 - b_over_bail_patch as i64) / 4;
    let encoded = 0x1400_0000u32 | (rel as u32 & 0x03FF_FFFF);
    buf.bytes[b_over_bail_patch..b_over_bail_patch + 4].copy_from_slice(&encoded.to_le_bytes());
    Ok(())
}
