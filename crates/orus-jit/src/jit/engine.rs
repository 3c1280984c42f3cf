//! External interfaces (`spec.md` §6).
//!
//! Resolves the Open Question in the design notes toward an inherent
//! `Backend` type rather than a vtable of free functions: `vtable()` hands
//! back a [`BackendVtable`] of `extern "C" fn` pointers (taking `&mut
//! Backend` as their first argument) for an interpreter that wants a
//! stable, by-value function-pointer surface rather than calling inherent
//! methods directly.

use crate::bytecode::Chunk;
use crate::jit::backend::{self, aarch64, x86_64, CodegenError};
use crate::jit::debug::{self, DebugEvent, DebugEventLog, DisassemblyListing, ParityReport};
use crate::jit::interp;
use crate::jit::ir::{IrOp, IrProgram};
use crate::jit::mem::{Arena, ArenaError};
use crate::jit::registry::{BlockHandle, NativeBlock, OwnedIrProgram, Registry};
use crate::jit::runtime::frame::{self, NativeFrame};
use crate::jit::tier::{ProfileSource, SelectedChunk, Tier, TierController};
use crate::runtime::Vm;
use std::rc::Rc;

/// Host targets the backend can report through [`Backend::availability`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    X86_64,
    AArch64,
    Riscv64,
    Native,
}

impl Target {
    fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Target::X86_64
        } else if cfg!(target_arch = "aarch64") {
            Target::AArch64
        } else if cfg!(target_arch = "riscv64") {
            Target::Riscv64
        } else {
            Target::Native
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityStatus {
    Ok,
    Unsupported,
}

#[derive(Debug, Clone)]
pub struct Availability {
    pub target: Target,
    pub status: AvailabilityStatus,
    pub message: String,
}

/// Compile-time tunables, populated once from the environment-variable
/// toggles in `spec.md` §6 at `Backend::create` time.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub force_unsupported: bool,
    pub force_helper_stub: bool,
    pub force_dynasm: bool,
    pub enable_linear_emitter: bool,
    pub force_linear_emitter: bool,
    /// `spec.md` §4.6: "If profiling is off: return the specialized chunk
    /// (best-effort)." Named as a negative so the derived `Default` (all
    /// fields `false`) keeps profiling on, matching every other toggle here.
    pub disable_profiling: bool,
}

impl BackendConfig {
    fn flag(name: &str) -> bool {
        std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// Reads the six recognized `ORUS_JIT_*` toggles from the process
    /// environment.
    pub fn from_env() -> Self {
        BackendConfig {
            force_unsupported: Self::flag("ORUS_JIT_FORCE_UNSUPPORTED"),
            force_helper_stub: Self::flag("ORUS_JIT_FORCE_HELPER_STUB"),
            force_dynasm: Self::flag("ORUS_JIT_FORCE_DYNASM"),
            enable_linear_emitter: Self::flag("ORUS_JIT_ENABLE_LINEAR_EMITTER"),
            force_linear_emitter: Self::flag("ORUS_JIT_FORCE_LINEAR_EMITTER"),
            disable_profiling: Self::flag("ORUS_JIT_DISABLE_PROFILING"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum JitError {
    #[error("allocation or page mapping failed: {0}")]
    OutOfMemory(String),
    #[error("assembly error: {0}")]
    AssemblyError(String),
    #[error("host architecture is not served or backend is disabled")]
    Unsupported,
    #[error("no live entry for code pointer")]
    UnknownEntry,
}

impl From<ArenaError> for JitError {
    fn from(err: ArenaError) -> Self {
        JitError::OutOfMemory(err.to_string())
    }
}

impl From<CodegenError> for JitError {
    fn from(err: CodegenError) -> Self {
        match err {
            CodegenError::PlatformUnsupported => JitError::Unsupported,
            CodegenError::ArenaUnavailable(msg) => JitError::OutOfMemory(msg),
            other => JitError::AssemblyError(other.to_string()),
        }
    }
}

/// A handle to a compiled native block, returned by `compile_noop` /
/// `compile_ir` and consumed by `release_entry` / `enter`.
#[derive(Debug, Clone, Copy)]
pub struct JITEntry {
    handle: BlockHandle,
    pub code_ptr: *const u8,
    pub function_index: u32,
    pub loop_index: u32,
}

/// The three emission strategies named in `spec.md`'s design notes ("model
/// as a small enum of strategy tokens"). `compile_ir` walks an ordered
/// subset of these, trying each in turn until one succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Linear,
    HelperStub,
    Dynasm,
}

fn strategy_order(config: &BackendConfig) -> Vec<Strategy> {
    if config.force_helper_stub {
        return vec![Strategy::HelperStub];
    }
    let mut order = Vec::new();
    if config.force_dynasm {
        order.push(Strategy::Dynasm);
    }
    if config.enable_linear_emitter || config.force_linear_emitter {
        order.push(Strategy::Linear);
    }
    order.push(Strategy::HelperStub);
    order
}

fn emit_linear(program: &IrProgram<'_>) -> Result<Vec<u8>, CodegenError> {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64::emit(program)
    }
    #[cfg(target_arch = "aarch64")]
    {
        aarch64::emit(program)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = program;
        Err(CodegenError::PlatformUnsupported)
    }
}

fn emit_strategy(
    strategy: Strategy,
    program: &IrProgram<'_>,
    program_ptr: *const OwnedIrProgram,
) -> Result<Vec<u8>, CodegenError> {
    match strategy {
        Strategy::Linear => emit_linear(program),
        Strategy::HelperStub => backend::helper_stub::emit(program_ptr),
        Strategy::Dynasm => backend::dynasm::emit(program_ptr),
    }
}

/// Ties the executable arena, the native-block registry, the tier
/// controller, and diagnostics together behind the operations `spec.md`
/// §6 names. Owned by the VM for the lifetime of its JIT usage; there is
/// exactly one `Backend` per VM instance.
pub struct Backend {
    config: BackendConfig,
    arena: Arena,
    registry: Registry,
    tier: TierController,
    events: DebugEventLog,
}

// SAFETY: `Backend` holds no thread-affine state beyond what `Registry`
// and `Arena` already guarantee (see their own `Send` notes); the backend
// is only ever driven from the interpreter thread per `spec.md` §5.
unsafe impl Send for Backend {}

impl Backend {
    /// Probes host architecture and W^X capability; returns `None` on
    /// failure (an arena that never became available).
    pub fn create(config: BackendConfig) -> Option<Self> {
        let arena = Arena::new();
        if !arena.is_available() {
            return None;
        }
        let mut tier = TierController::new();
        tier.set_profiling_enabled(!config.disable_profiling);
        Some(Backend {
            config,
            arena,
            registry: Registry::new(),
            tier,
            events: DebugEventLog::default(),
        })
    }

    pub fn is_available(&self) -> bool {
        !self.config.force_unsupported && self.arena.is_available()
    }

    pub fn availability(&self) -> Availability {
        let target = Target::host();
        if self.config.force_unsupported {
            return Availability {
                target,
                status: AvailabilityStatus::Unsupported,
                message: "ORUS_JIT_FORCE_UNSUPPORTED set".to_string(),
            };
        }
        if !self.arena.is_available() {
            return Availability {
                target,
                status: AvailabilityStatus::Unsupported,
                message: self.arena.diagnostic().unwrap_or("arena unavailable").to_string(),
            };
        }
        Availability {
            target,
            status: AvailabilityStatus::Ok,
            message: "ready".to_string(),
        }
    }

    /// Builds a one-instruction `Return` program and compiles it — used
    /// for bootstrapping and smoke tests.
    pub fn compile_noop(&mut self) -> Result<JITEntry, JitError> {
        let chunk = Rc::new(Chunk::with_code(vec![0u8; 1]));
        let program = IrProgram::noop(chunk.as_ref());
        self.compile_ir(&program, chunk)
    }

    /// Emits native code for `program`, trying the strategies
    /// `BackendConfig` selects in order, and publishes the result as
    /// executable memory.
    pub fn compile_ir(
        &mut self,
        program: &IrProgram<'_>,
        source_chunk: Rc<Chunk>,
    ) -> Result<JITEntry, JitError> {
        if self.config.force_unsupported {
            return Err(JitError::Unsupported);
        }
        if !self.arena.is_available() {
            return Err(JitError::OutOfMemory(
                self.arena.diagnostic().unwrap_or("arena unavailable").to_string(),
            ));
        }

        let function_index = program.function_index;
        let loop_index = program.loop_index;

        let owned_program = Box::new(OwnedIrProgram::from_program(program, source_chunk));
        let program_ptr = owned_program.as_ref() as *const OwnedIrProgram;

        let mut last_err = CodegenError::PlatformUnsupported;
        let mut bytes = None;
        for strategy in strategy_order(&self.config) {
            match emit_strategy(strategy, program, program_ptr) {
                Ok(b) => {
                    bytes = Some(b);
                    break;
                }
                Err(e) => last_err = e,
            }
        }
        let bytes = bytes.ok_or(last_err)?;

        let (ptr, capacity) = self.arena.alloc_executable(bytes.len())?;
        // SAFETY: `ptr` was just allocated with `capacity >= bytes.len()`
        // and is still RW (the arena only flips it RX in `make_executable`).
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        self.arena.make_executable(ptr, bytes.len())?;

        let code_ptr = ptr as *const u8;
        let block = NativeBlock {
            program: owned_program,
            code_ptr: ptr,
            code_capacity: capacity,
            disassembly: debug::disassemble(program),
        };
        let handle = self.registry.register(block);

        self.events.record(DebugEvent::Compiled {
            function_index,
            loop_index,
            code_size: bytes.len(),
        });

        Ok(JITEntry {
            handle,
            code_ptr,
            function_index,
            loop_index,
        })
    }

    /// Unlinks `entry` from the registry and releases its executable
    /// memory.
    pub fn release_entry(&mut self, entry: JITEntry) -> Result<(), JitError> {
        let block = self
            .registry
            .destroy_by_handle(entry.handle)
            .ok_or(JitError::UnknownEntry)?;
        self.arena.release_executable(block.code_ptr, block.code_capacity)?;
        Ok(())
    }

    /// Pure accounting: counts per-category IR instructions in `program`
    /// and checks every one against `target`'s supported opcode set,
    /// without emitting anything. Returns [`JitError::Unsupported`] if
    /// `target` itself isn't a host this backend can compile for, or if any
    /// individual instruction's opcode/kind can't be handled by it.
    pub fn collect_parity(
        &self,
        program: &IrProgram<'_>,
        target: Target,
        report: &mut ParityReport,
    ) -> Result<(), JitError> {
        let check_supported = match target {
            Target::X86_64 => x86_64::check_supported,
            Target::AArch64 => aarch64::check_supported,
            Target::Native if Target::host() == Target::X86_64 => x86_64::check_supported,
            Target::Native if Target::host() == Target::AArch64 => aarch64::check_supported,
            _ => return Err(JitError::Unsupported),
        };

        for instr in &program.instructions {
            if check_supported(&instr.op).is_err() {
                return Err(JitError::Unsupported);
            }
            match &instr.op {
                IrOp::MakeArray { .. }
                | IrOp::ArrayPush { .. }
                | IrOp::ArrayPop { .. }
                | IrOp::EnumNew { .. }
                | IrOp::GetIter { .. }
                | IrOp::IterNext { .. }
                | IrOp::Range { .. } => report.record_memory(),
                IrOp::Arith { .. } | IrOp::Unary { .. } => report.record_arithmetic(),
                IrOp::Compare { .. } | IrOp::IsType { .. } => report.record_comparison(),
                IrOp::Safepoint => report.record_safepoint(),
                IrOp::Convert { .. } | IrOp::ToString { .. } | IrOp::ConcatString { .. } | IrOp::TypeOf { .. } => {
                    report.record_conversion()
                }
                _ => report.record_helper(),
            }
        }
        Ok(())
    }

    /// Runs `entry` via `vtable`'s `{ enter, invalidate, flush }`
    /// contract: pushes a [`NativeFrame`], calls the native entry, checks
    /// the canary, and on a `false` return (bailout) demotes the owning
    /// loop through the tier controller.
    pub fn enter(&mut self, vm: &mut Vm, entry: &JITEntry) -> bool {
        vm.dispatch_count += 1;
        let block = match self.registry.get(entry.handle) {
            Some(block) => block,
            None => return false,
        };
        let native_entry: extern "C" fn(*mut Vm) -> bool =
            unsafe { std::mem::transmute(block.code_ptr) };

        let mut frame = NativeFrame::new(entry.function_index, entry.loop_index);
        // SAFETY: `frame` stays live (on this stack frame) until `pop`
        // below runs unconditionally on every exit path.
        unsafe { frame::push(vm, &mut frame) };
        let ran_to_completion = native_entry(vm as *mut Vm);
        // SAFETY: matches the `push` above; no other frame was pushed
        // beneath it since native code never nests `enter` calls directly.
        let canary_ok = unsafe { frame::pop(vm) };
        if !canary_ok {
            panic!("native frame canary corrupted for function {} loop {}", entry.function_index, entry.loop_index);
        }

        if !ran_to_completion {
            self.events.record(DebugEvent::Bailout {
                function_index: entry.function_index,
                loop_index: entry.loop_index,
                reason: interp::BailoutReason::NativeBailout,
            });
            self.tier.bailout_and_deopt(vm, &mut self.registry, entry.function_index, entry.loop_index);
        }
        ran_to_completion
    }

    /// Drops tier state for `(function_index, loop_index)` without
    /// touching the registry, so the next visit recompiles from scratch.
    pub fn invalidate(&mut self, function_index: u32, loop_index: u32) {
        self.tier.invalidate(function_index, loop_index);
        self.events.record(DebugEvent::Invalidated { function_index, loop_index });
    }

    /// Drops all tier state and releases every resident native block. Used
    /// on full chunk replacement or VM shutdown.
    pub fn flush(&mut self, _vm: &mut Vm) {
        for block in self.tier.flush(&mut self.registry) {
            let _ = self.arena.release_executable(block.code_ptr, block.code_capacity);
        }
    }

    /// Selects what the dispatcher should run this time for `(function,
    /// loop)`: the interpreter or a resident native block, per the current
    /// tier.
    pub fn select_chunk<'a>(
        &'a mut self,
        vm: &Vm,
        function_index: u32,
        loop_index: u32,
        profile: &dyn ProfileSource,
    ) -> SelectedChunk<'a> {
        self.tier.select_chunk(vm, &self.registry, function_index, loop_index, profile)
    }

    pub fn tier_of(&mut self, function_index: u32, loop_index: u32, profile: &dyn ProfileSource) -> Tier {
        self.tier.select_tier(function_index, loop_index, profile)
    }

    pub fn events(&self) -> &DebugEventLog {
        &self.events
    }

    /// The disassembly published for a live entry, for an external
    /// inspector (`spec.md` §4.7's "publish disassembly to an inspector").
    /// `None` once the entry has been released.
    pub fn disassembly(&self, entry: &JITEntry) -> Option<&DisassemblyListing> {
        self.registry.get(entry.handle).map(|block| &block.disassembly)
    }

    /// A stable, by-value function-pointer surface for an interpreter that
    /// wants `{ enter, invalidate, flush }` as raw function pointers rather
    /// than calling inherent methods on `&mut Backend` directly.
    pub fn vtable(&self) -> BackendVtable {
        BackendVtable {
            enter: vtable_enter,
            invalidate: vtable_invalidate,
            flush: vtable_flush,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct BackendVtable {
    pub enter: unsafe extern "C" fn(*mut Backend, *mut Vm, JITEntry) -> bool,
    pub invalidate: unsafe extern "C" fn(*mut Backend, u32, u32),
    pub flush: unsafe extern "C" fn(*mut Backend, *mut Vm),
}

/// # Safety
/// `backend` and `vm` must both point to live, exclusively-borrowed values
/// for the duration of the call.
unsafe extern "C" fn vtable_enter(backend: *mut Backend, vm: *mut Vm, entry: JITEntry) -> bool {
    (*backend).enter(&mut *vm, &entry)
}

/// # Safety
/// See [`vtable_enter`].
unsafe extern "C" fn vtable_invalidate(backend: *mut Backend, function_index: u32, loop_index: u32) {
    (*backend).invalidate(function_index, loop_index);
}

/// # Safety
/// See [`vtable_enter`].
unsafe extern "C" fn vtable_flush(backend: *mut Backend, vm: *mut Vm) {
    (*backend).flush(&mut *vm);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_reports_available_on_this_host() {
        let backend = Backend::create(BackendConfig::default());
        let Some(backend) = backend else { return };
        assert!(backend.is_available());
        assert_eq!(backend.availability().status, AvailabilityStatus::Ok);
    }

    #[test]
    fn force_unsupported_overrides_availability() {
        let Some(backend) = Backend::create(BackendConfig {
            force_unsupported: true,
            ..Default::default()
        }) else {
            return;
        };
        assert!(!backend.is_available());
        assert_eq!(backend.availability().status, AvailabilityStatus::Unsupported);
    }

    #[test]
    fn compile_noop_then_enter_runs_with_no_side_effects() {
        let Some(mut backend) = Backend::create(BackendConfig::default()) else { return };
        let entry = backend.compile_noop().expect("noop always compiles");
        let mut vm = Vm::new(4);
        assert!(backend.enter(&mut vm, &entry));
        assert_eq!(vm.dispatch_count, 1);
        assert!(vm.jit_pending_trigger.is_none());
        backend.release_entry(entry).expect("release succeeds");
    }

    #[test]
    fn forced_helper_stub_still_compiles_and_runs() {
        let Some(mut backend) = Backend::create(BackendConfig {
            force_helper_stub: true,
            ..Default::default()
        }) else {
            return;
        };
        let entry = backend.compile_noop().expect("helper stub never fails");
        let mut vm = Vm::new(1);
        assert!(backend.enter(&mut vm, &entry));
    }

    #[test]
    fn release_entry_removes_from_registry() {
        let Some(mut backend) = Backend::create(BackendConfig::default()) else { return };
        let entry = backend.compile_noop().unwrap();
        backend.release_entry(entry).unwrap();
        assert_eq!(backend.registry.len(), 0);
    }

    #[test]
    fn disassembly_is_published_for_a_live_entry() {
        let Some(mut backend) = Backend::create(BackendConfig::default()) else { return };
        let entry = backend.compile_noop().unwrap();
        let listing = backend.disassembly(&entry).expect("compiled entry has a listing");
        assert!(!listing.entries().is_empty());
        assert_eq!(listing.entries().last().unwrap().1, "return");
        backend.release_entry(entry).unwrap();
    }

    #[test]
    fn collect_parity_categorizes_every_instruction() {
        use crate::bytecode::Chunk;
        use crate::jit::ir::{ArithOp, IrInstruction, IrOp, OptFlags};
        use crate::runtime::ValueKind;

        let _ = OptFlags::NONE;
        let Some(backend) = Backend::create(BackendConfig::default()) else { return };
        let chunk = Chunk::with_code(vec![0u8; 3]);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 3);
        program.push(IrInstruction::new(IrOp::LoadConst { dst: 0, const_index: 0 }, ValueKind::I32, 0));
        program.push(IrInstruction::new(
            IrOp::Arith { op: ArithOp::Add, dst: 1, lhs: 0, rhs: 0 },
            ValueKind::I32,
            1,
        ));
        program.push(IrInstruction::new(IrOp::Return, ValueKind::Boxed, 2));

        let mut report = ParityReport::default();
        backend.collect_parity(&program, Target::host(), &mut report).expect("every op is supported");
        assert_eq!(report.total(), 3);
        assert_eq!(report.arithmetic_ops, 1);
        assert_eq!(report.helper_ops, 2);
    }

    #[test]
    fn collect_parity_rejects_an_opcode_the_target_cannot_emit() {
        use crate::bytecode::Chunk;
        use crate::jit::ir::{IrInstruction, IrOp, OptFlags};
        use crate::runtime::ValueKind;

        let _ = OptFlags::NONE;
        let Some(backend) = Backend::create(BackendConfig::default()) else { return };
        let chunk = Chunk::with_code(vec![0u8; 1]);
        let mut program = IrProgram::new(&chunk, 0, 0, 0, 1);
        program.push(IrInstruction::new(IrOp::MakeArray { dst: 0, first_reg: 0, count: 0 }, ValueKind::Boxed, 0));

        let mut report = ParityReport::default();
        let result = backend.collect_parity(&program, Target::host(), &mut report);
        assert_eq!(result, Err(JitError::Unsupported));
    }

    #[test]
    fn dynasm_forced_on_x86_64_produces_a_working_entry() {
        let Some(mut backend) = Backend::create(BackendConfig {
            force_dynasm: true,
            ..Default::default()
        }) else {
            return;
        };
        let entry = backend.compile_noop().expect("dynasm strategy falls back cleanly");
        let mut vm = Vm::new(1);
        assert!(backend.enter(&mut vm, &entry));
    }
}
