//! The native block registry (`spec.md` §4.2).
//!
//! A global, single-writer (with respect to compile/release, which only
//! ever happen on the interpreter thread) linked list of live
//! [`NativeBlock`]s. The specification describes this as an intrusive
//! singly-linked list for O(1) predecessor-based removal; this is the safe
//! Rust rendition of that same shape — a `Vec`-backed arena of slots linked
//! by index, with a free list for reclaimed slots — rather than raw
//! intrusive pointers, since nothing here needs to outlive the registry
//! that owns it.

use crate::bytecode::Chunk;
use crate::jit::debug::DisassemblyListing;
use crate::jit::ir::{IrInstruction, IrProgram};
use std::rc::Rc;

/// An index into the registry's slot arena, stable until the slot is
/// removed and its index reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle(usize);

/// A deep copy of the instructions a [`NativeBlock`] was compiled from,
/// plus a shared reference to the chunk they were lifted out of. Owning the
/// instructions (rather than keeping the borrow the translator used) lets
/// the translator's transient `IrProgram` be freed once compilation
/// finishes, per the ownership note in the design notes: the block *owns*
/// its program but *borrows* (via `Rc`) the chunk.
pub struct OwnedIrProgram {
    pub instructions: Vec<IrInstruction>,
    pub source_chunk: Rc<Chunk>,
    pub function_index: u32,
    pub loop_index: u32,
    pub loop_start_offset: u32,
    pub loop_end_offset: u32,
}

impl OwnedIrProgram {
    pub fn from_program(program: &IrProgram<'_>, source_chunk: Rc<Chunk>) -> Self {
        OwnedIrProgram {
            instructions: program.instructions.clone(),
            source_chunk,
            function_index: program.function_index,
            loop_index: program.loop_index,
            loop_start_offset: program.loop_start_offset,
            loop_end_offset: program.loop_end_offset,
        }
    }
}

/// Owns the compiled program and the executable-code allocation it lives
/// in. Created on a successful compile; destroyed when the corresponding
/// `JITEntry` is released.
///
/// `program` is boxed rather than inline so its address is stable for the
/// lifetime of the block: the helper-stub compile strategy bakes a pointer
/// to it directly into the emitted trampoline, and this `Registry` stores
/// blocks in a `Vec`-backed slot arena that can reallocate (and so move
/// `NativeBlock` itself) on growth. A `Box`'s pointee never moves when the
/// `Box` is moved, so the embedded pointer stays valid regardless.
pub struct NativeBlock {
    pub program: Box<OwnedIrProgram>,
    pub code_ptr: *mut u8,
    pub code_capacity: usize,
    /// The IR-level disassembly published for inspectors (`spec.md` §4.7),
    /// built once at compile time regardless of which emission strategy
    /// actually produced `code_ptr`'s bytes.
    pub disassembly: DisassemblyListing,
}

// SAFETY: `code_ptr` is only ever dereferenced through the arena's
// make_executable/release_executable calls, which themselves are `Sync`.
unsafe impl Send for NativeBlock {}

struct Slot {
    block: NativeBlock,
    next: Option<usize>,
}

/// Returned by [`Registry::find_by_code_ptr`]: the matching slot's index
/// plus its predecessor in the list (`None` if it is the head), so
/// `destroy` can unlink in O(1) without re-scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    index: usize,
    predecessor: Option<usize>,
}

#[derive(Default)]
pub struct Registry {
    slots: Vec<Option<Slot>>,
    head: Option<usize>,
    free_list: Vec<usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links `block` in at the head of the list and returns a stable handle.
    pub fn register(&mut self, block: NativeBlock) -> BlockHandle {
        let slot = Slot {
            block,
            next: self.head,
        };
        let index = if let Some(reused) = self.free_list.pop() {
            self.slots[reused] = Some(slot);
            reused
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        };
        self.head = Some(index);
        BlockHandle(index)
    }

    /// Scans the list for the block whose `code_ptr` matches. Returns both
    /// the slot index and its predecessor so the caller can remove it in
    /// O(1) via [`Registry::destroy`] without a second scan.
    pub fn find_by_code_ptr(&self, code_ptr: *const u8) -> Option<Lookup> {
        let mut predecessor = None;
        let mut current = self.head;
        while let Some(index) = current {
            let slot = self.slots[index].as_ref().expect("linked index is live");
            if slot.block.code_ptr as *const u8 == code_ptr {
                return Some(Lookup { index, predecessor });
            }
            predecessor = Some(index);
            current = slot.next;
        }
        None
    }

    pub fn get(&self, handle: BlockHandle) -> Option<&NativeBlock> {
        self.slots.get(handle.0)?.as_ref().map(|s| &s.block)
    }

    /// Finds the first live block compiled for `(function_index,
    /// loop_index)`. Used by the tier controller, which indexes blocks by
    /// the loop they cover rather than by code address.
    pub fn find_by_loop(&self, function_index: u32, loop_index: u32) -> Option<BlockHandle> {
        let mut current = self.head;
        while let Some(index) = current {
            let slot = self.slots[index].as_ref().expect("linked index is live");
            if slot.block.program.function_index == function_index
                && slot.block.program.loop_index == loop_index
            {
                return Some(BlockHandle(index));
            }
            current = slot.next;
        }
        None
    }

    /// Removes the slot identified by `lookup`, patching its predecessor's
    /// `next` link (or the list head) to skip over it, and returns the
    /// removed block so the caller can release its executable memory.
    pub fn destroy(&mut self, lookup: Lookup) -> NativeBlock {
        let removed = self.slots[lookup.index].take().expect("lookup stays valid between calls");
        match lookup.predecessor {
            Some(pred) => {
                self.slots[pred].as_mut().expect("predecessor is live").next = removed.next;
            }
            None => {
                self.head = removed.next;
            }
        }
        self.free_list.push(lookup.index);
        removed.block
    }

    /// Removes the block at `handle`, wherever it sits in the list. Prefer
    /// [`Registry::destroy`] with a [`Lookup`] already in hand from
    /// [`Registry::find_by_code_ptr`]; this variant re-scans for the
    /// predecessor, which is the price of indexing by `(function_index,
    /// loop_index)` instead of by code address.
    pub fn destroy_by_handle(&mut self, handle: BlockHandle) -> Option<NativeBlock> {
        self.slots.get(handle.0)?.as_ref()?;
        let mut predecessor = None;
        let mut current = self.head;
        while let Some(index) = current {
            if index == handle.0 {
                return Some(self.destroy(Lookup { index, predecessor }));
            }
            predecessor = Some(index);
            current = self.slots[index].as_ref().expect("linked index is live").next;
        }
        None
    }

    /// Removes and returns every live block, in list order. Used by
    /// `flush(vm)` to release all entries on chunk replacement or shutdown.
    pub fn drain(&mut self) -> Vec<NativeBlock> {
        let mut blocks = Vec::new();
        let mut current = self.head;
        while let Some(index) = current {
            let slot = self.slots[index].take().expect("linked index is live");
            current = slot.next;
            self.free_list.push(index);
            blocks.push(slot.block);
        }
        self.head = None;
        blocks
    }

    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut current = self.head;
        while let Some(index) = current {
            count += 1;
            current = self.slots[index].as_ref().expect("linked index is live").next;
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ValueKind;

    fn fixture_block(code_ptr: *mut u8) -> NativeBlock {
        let chunk = Rc::new(Chunk::with_code(vec![0u8; 1]));
        let mut program = IrProgram::new(chunk.as_ref(), 0, 0, 0, 0);
        program.push(IrInstruction::new(
            crate::jit::ir::IrOp::Return,
            ValueKind::Boxed,
            0,
        ));
        NativeBlock {
            program: Box::new(OwnedIrProgram::from_program(&program, chunk)),
            code_ptr,
            code_capacity: 64,
            disassembly: DisassemblyListing::new(),
        }
    }

    #[test]
    fn register_then_find_round_trips() {
        let mut registry = Registry::new();
        let ptr = 0x1000 as *mut u8;
        registry.register(fixture_block(ptr));
        let lookup = registry.find_by_code_ptr(ptr as *const u8).expect("found");
        assert_eq!(lookup.predecessor, None);
    }

    #[test]
    fn destroy_unlinks_middle_entry() {
        let mut registry = Registry::new();
        registry.register(fixture_block(0x1000 as *mut u8));
        registry.register(fixture_block(0x2000 as *mut u8));
        registry.register(fixture_block(0x3000 as *mut u8));
        assert_eq!(registry.len(), 3);

        let lookup = registry
            .find_by_code_ptr(0x2000 as *const u8)
            .expect("found middle");
        let removed = registry.destroy(lookup);
        assert_eq!(removed.code_ptr as usize, 0x2000);
        assert_eq!(registry.len(), 2);
        assert!(registry.find_by_code_ptr(0x2000 as *const u8).is_none());
        assert!(registry.find_by_code_ptr(0x1000 as *const u8).is_some());
        assert!(registry.find_by_code_ptr(0x3000 as *const u8).is_some());
    }

    #[test]
    fn drain_empties_registry() {
        let mut registry = Registry::new();
        registry.register(fixture_block(0x1000 as *mut u8));
        registry.register(fixture_block(0x2000 as *mut u8));
        let blocks = registry.drain();
        assert_eq!(blocks.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn find_by_loop_locates_matching_block() {
        let mut registry = Registry::new();
        registry.register(fixture_block(0x1000 as *mut u8));
        let handle = registry.find_by_loop(0, 0).expect("loop 0 registered");
        assert_eq!(registry.get(handle).unwrap().code_ptr as usize, 0x1000);
    }

    #[test]
    fn destroy_by_handle_unlinks_regardless_of_position() {
        let mut registry = Registry::new();
        registry.register(fixture_block(0x1000 as *mut u8));
        registry.register(fixture_block(0x2000 as *mut u8));
        let handle = registry.find_by_code_ptr(0x1000 as *const u8).map(|l| BlockHandle(l.index)).unwrap();
        let removed = registry.destroy_by_handle(handle).expect("removed");
        assert_eq!(removed.code_ptr as usize, 0x1000);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reclaimed_slot_is_reused() {
        let mut registry = Registry::new();
        registry.register(fixture_block(0x1000 as *mut u8));
        let lookup = registry.find_by_code_ptr(0x1000 as *const u8).unwrap();
        registry.destroy(lookup);
        registry.register(fixture_block(0x4000 as *mut u8));
        assert_eq!(registry.len(), 1);
    }
}
