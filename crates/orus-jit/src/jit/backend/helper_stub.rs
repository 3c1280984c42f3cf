//! The helper-stub strategy: the bottom of the compile cascade.
//!
//! This "emitter" never fails. It produces a tiny machine-code trampoline
//! that immediately tail-calls back into the IR interpreter, with a pointer
//! to the block's own (boxed, address-stable) [`OwnedIrProgram`] baked in as
//! an immediate. Used whenever the native linear emitter meets an operation
//! it doesn't lower (string/array/enum ops, foreign calls, anything outside
//! the typed-arithmetic fast path), so every program compiles to *something*
//! runnable through the uniform `extern "C" fn(*mut Vm) -> bool` native-entry
//! contract, even if that something is "go run the reference interpreter".

use super::CodegenError;
use crate::jit::ir::IrProgram;
use crate::jit::registry::OwnedIrProgram;
use crate::runtime::{DeoptTrigger, Vm};

/// Reconstructs a borrowed [`IrProgram`] from an [`OwnedIrProgram`] and runs
/// it through the reference interpreter.
///
/// # Safety
/// `vm` and `program_ptr` must both be valid for the duration of the call —
/// guaranteed by the trampoline [`emit`] produces only ever invoking this
/// with the address of a live `NativeBlock`'s boxed `program`.
pub extern "C" fn run_via_interpreter(vm: *mut Vm, program_ptr: *const OwnedIrProgram) -> bool {
    let owned = unsafe { &*program_ptr };
    let program = IrProgram {
        instructions: owned.instructions.clone(),
        source_chunk: owned.source_chunk.as_ref(),
        function_index: owned.function_index,
        loop_index: owned.loop_index,
        loop_start_offset: owned.loop_start_offset,
        loop_end_offset: owned.loop_end_offset,
    };
    let vm = unsafe { &mut *vm };
    match crate::jit::interp::run(vm, &program) {
        crate::jit::interp::InterpOutcome::Returned => true,
        crate::jit::interp::InterpOutcome::Bailout(_) => {
            vm.jit_pending_trigger.get_or_insert(DeoptTrigger {
                function_index: owned.function_index,
                loop_index: owned.loop_index,
                generation: 0,
            });
            vm.jit_pending_invalidate = true;
            false
        }
    }
}

/// Emits a trampoline that loads `program_ptr` into the native-entry ABI's
/// second argument slot and tail-jumps to [`run_via_interpreter`], leaving
/// the vm pointer (the first argument) untouched.
pub fn emit(program_ptr: *const OwnedIrProgram) -> Result<Vec<u8>, CodegenError> {
    let program_ptr = program_ptr as u64;
    let trampoline_ptr = run_via_interpreter as usize as u64;

    #[cfg(target_arch = "x86_64")]
    {
        Ok(emit_x86_64(program_ptr, trampoline_ptr))
    }
    #[cfg(target_arch = "aarch64")]
    {
        Ok(emit_aarch64(program_ptr, trampoline_ptr))
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = (program_ptr, trampoline_ptr);
        Err(CodegenError::PlatformUnsupported)
    }
}

/// `mov <arg1>, imm64(program_ptr); mov rax, imm64(trampoline); jmp rax`.
/// `<arg0>` (the vm pointer) is left untouched, matching the native-entry
/// ABI: arg0 stays arg0, arg1 becomes the program pointer. The argument
/// register pair differs by calling convention: System V (Linux/macOS) passes
/// the first two integer arguments in `rdi`/`rsi`, while Microsoft x64
/// (Windows) uses `rcx`/`rdx` — baking in the SysV register on a Windows host
/// would hand `run_via_interpreter` garbage in its real arg1 slot.
#[cfg(target_arch = "x86_64")]
fn emit_x86_64(program_ptr: u64, trampoline_ptr: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    #[cfg(target_os = "windows")]
    buf.extend_from_slice(&[0x48, 0xBA]); // REX.W + MOV rdx, imm64 (Win64 arg1)
    #[cfg(not(target_os = "windows"))]
    buf.extend_from_slice(&[0x48, 0xBE]); // REX.W + MOV rsi, imm64 (SysV arg1)
    buf.extend_from_slice(&program_ptr.to_le_bytes());
    buf.extend_from_slice(&[0x48, 0xB8]); // REX.W + MOV rax, imm64
    buf.extend_from_slice(&trampoline_ptr.to_le_bytes());
    buf.extend_from_slice(&[0xFF, 0xE0]); // JMP rax
    buf
}

/// Loads both 64-bit immediates via `MOVZ`/`MOVK` quadruples (AArch64 has no
/// single move-immediate-64 instruction), then `BR` to the trampoline.
/// `x0` (the vm pointer) is left untouched; the program pointer goes in
/// `x1`, matching the native-entry ABI's second argument.
#[cfg(target_arch = "aarch64")]
fn emit_aarch64(program_ptr: u64, trampoline_ptr: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(36);
    buf.extend_from_slice(&movz_movk_sequence(1, program_ptr));
    buf.extend_from_slice(&movz_movk_sequence(9, trampoline_ptr));
    buf.extend_from_slice(&0xD61F0120u32.to_le_bytes()); // BR x9
    buf
}

#[cfg(target_arch = "aarch64")]
fn movz_movk_sequence(reg: u32, imm64: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    let chunks = [
        (imm64 & 0xFFFF) as u32,
        ((imm64 >> 16) & 0xFFFF) as u32,
        ((imm64 >> 32) & 0xFFFF) as u32,
        ((imm64 >> 48) & 0xFFFF) as u32,
    ];
    for (shift_index, chunk) in chunks.iter().enumerate() {
        let hw = shift_index as u32;
        let opcode_base = if shift_index == 0 { 0xD2800000 } else { 0xF2800000 }; // MOVZ / MOVK, 64-bit
        let instr = opcode_base | (hw << 21) | (chunk << 5) | reg;
        buf.extend_from_slice(&instr.to_le_bytes());
    }
    buf
}
