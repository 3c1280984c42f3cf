//! Linear machine-code emitters (`spec.md` §4.4).
//!
//! Each target-arch emitter is a single-pass assembler over an
//! [`IrProgram`]: every encoding it uses has a fixed length regardless of
//! its operands, so a branch's displacement can be left as a zeroed
//! placeholder and patched once the whole program has been emitted and
//! every instruction's native offset is known — no separate layout pass
//! needed. An emitter that meets an operation it doesn't lower natively
//! returns [`CodegenError::UnsupportedOp`], which sends the whole program to
//! the next strategy in the cascade, ending in [`helper_stub`], which always
//! succeeds by delegating the entire program to the IR interpreter.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
pub mod dynasm;
pub mod helper_stub;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

use crate::jit::ir::{IrOp, IrProgram};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CodegenError {
    #[error("unsupported IR operation: {0}")]
    UnsupportedOp(String),
    #[error("emitted code exceeded the allotted buffer")]
    BufferOverflow,
    #[error("relocation target is out of the encoding's displacement range")]
    RelocationOutOfRange,
    #[error("no native emitter is available for this platform")]
    PlatformUnsupported,
    #[error("executable memory arena is unavailable: {0}")]
    ArenaUnavailable(String),
}

/// A branch relocation recorded while emitting: `patch_offset` is the byte
/// offset of the relocatable field, `target_ir_index` is the IR instruction
/// index it should end up pointing at. Resolved in one pass after every
/// instruction has been emitted and its native offset recorded.
pub(crate) struct Patch {
    pub patch_offset: usize,
    pub target_ir_index: usize,
    pub kind: PatchKind,
}

#[derive(Clone, Copy)]
pub(crate) enum PatchKind {
    /// x86-64 `Jcc`/`JMP rel32`: a 32-bit displacement relative to the byte
    /// immediately following the 4-byte field.
    Rel32,
    /// AArch64 unconditional `B`: a 26-bit, word-granularity signed offset
    /// packed into the low 26 bits of the instruction word.
    AArch64Branch26,
    /// AArch64 `CBNZ`: a 19-bit, word-granularity signed offset packed into
    /// bits [23:5] of the instruction word.
    AArch64CondBranch19,
}

/// A growable byte buffer with an attached patch list, shared by every
/// per-arch linear emitter. Each emitter pushes fixed-length encodings in a
/// single forward pass, recording a [`Patch`] wherever it doesn't yet know a
/// branch's native displacement, then calls [`CodeBuffer::resolve`] once
/// every IR instruction's native offset is known.
pub(crate) struct CodeBuffer {
    pub bytes: Vec<u8>,
    pub patches: Vec<Patch>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        CodeBuffer {
            bytes: Vec::new(),
            patches: Vec::new(),
        }
    }

    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    pub fn push_u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn push_u32_le(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_i64_le(&mut self, value: i64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Records a placeholder relocation at the buffer's current tail, then
    /// advances past it by pushing zeroed bytes (4 bytes for every
    /// [`PatchKind`] this backend uses).
    pub fn push_patch(&mut self, target_ir_index: usize, kind: PatchKind) {
        let patch_offset = self.offset();
        self.patches.push(Patch {
            patch_offset,
            target_ir_index,
            kind,
        });
        self.push_u32_le(0);
    }

    /// Resolves every recorded patch now that `ir_native_offsets[i]` holds
    /// the native byte offset of IR instruction `i`.
    pub fn resolve(mut self, ir_native_offsets: &[usize]) -> Result<Vec<u8>, CodegenError> {
        for patch in &self.patches {
            let target = *ir_native_offsets
                .get(patch.target_ir_index)
                .ok_or(CodegenError::RelocationOutOfRange)?;
            match patch.kind {
                PatchKind::Rel32 => {
                    let rel = target as i64 - (patch.patch_offset as i64 + 4);
                    let rel = i32::try_from(rel).map_err(|_| CodegenError::RelocationOutOfRange)?;
                    self.bytes[patch.patch_offset..patch.patch_offset + 4]
                        .copy_from_slice(&rel.to_le_bytes());
                }
                PatchKind::AArch64Branch26 => {
                    let rel = (target as i64 - patch.patch_offset as i64) / 4;
                    if !(-(1 << 25)..(1 << 25)).contains(&rel) {
                        return Err(CodegenError::RelocationOutOfRange);
                    }
                    let existing = u32::from_le_bytes(
                        self.bytes[patch.patch_offset..patch.patch_offset + 4]
                            .try_into()
                            .expect("4 bytes"),
                    );
                    let encoded = existing | ((rel as u32) & 0x03FF_FFFF);
                    self.bytes[patch.patch_offset..patch.patch_offset + 4]
                        .copy_from_slice(&encoded.to_le_bytes());
                }
                PatchKind::AArch64CondBranch19 => {
                    let rel = (target as i64 - patch.patch_offset as i64) / 4;
                    if !(-(1 << 18)..(1 << 18)).contains(&rel) {
                        return Err(CodegenError::RelocationOutOfRange);
                    }
                    let existing = u32::from_le_bytes(
                        self.bytes[patch.patch_offset..patch.patch_offset + 4]
                            .try_into()
                            .expect("4 bytes"),
                    );
                    let encoded = existing | (((rel as u32) & 0x7FFFF) << 5);
                    self.bytes[patch.patch_offset..patch.patch_offset + 4]
                        .copy_from_slice(&encoded.to_le_bytes());
                }
            }
        }
        Ok(self.bytes)
    }
}

/// Builds the `bytecode_offset -> IR instruction index` side table every
/// per-arch emitter needs to turn a branch's bytecode-offset target into an
/// IR index it can record a [`Patch`] against — the same mapping
/// `jit::interp::run` builds to drive the reference interpreter.
pub(crate) fn offset_index(program: &IrProgram<'_>) -> rustc_hash::FxHashMap<u32, usize> {
    program
        .instructions
        .iter()
        .enumerate()
        .map(|(idx, instr)| (instr.bytecode_offset, idx))
        .collect()
}

/// Resolves a branch instruction's bytecode-offset target using the exact
/// formulas `jit::interp::step` uses, so the native emitters and the
/// reference interpreter never disagree about where a jump lands. Returns
/// `None` for non-branch instructions and for `IncCmpJump`/`DecCmpJump`,
/// whose target the caller resolves directly (`bytecode_offset +
/// jump_offset`) since they carry no separate `bytecode_length`.
pub(crate) fn branch_target(
    instr: &crate::jit::ir::IrInstruction,
    program: &IrProgram<'_>,
) -> Option<u32> {
    match &instr.op {
        IrOp::JumpShort { offset, bytecode_length } => {
            Some((instr.bytecode_offset as i64 + *bytecode_length as i64 + *offset as i64) as u32)
        }
        IrOp::JumpIfNotShort { offset, bytecode_length, .. } => {
            Some((instr.bytecode_offset as i64 + *bytecode_length as i64 + *offset as i64) as u32)
        }
        IrOp::JumpBackShort { back_offset } => instr.bytecode_offset.checked_sub(*back_offset),
        IrOp::LoopBack => Some(program.loop_start_offset),
        IrOp::IncCmpJump { jump_offset, .. } | IrOp::DecCmpJump { jump_offset, .. } => {
            Some((instr.bytecode_offset as i64 + *jump_offset as i64) as u32)
        }
        _ => None,
    }
}

// Compiling a program and publishing it into the executable arena is done by
// `jit::engine::Backend::compile_ir`, the single live path from strategy
// selection through registry registration — this module only supplies the
// per-arch emitters and the shared `CodeBuffer`/relocation machinery above.
