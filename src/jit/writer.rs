//! Single-pass x86-64 machine-code writer.
//!
//! The Wasm value stack is materialized one-to-one on the native stack,
//! eight bytes per value. No value lives in a register across opcode
//! boundaries: every lowering pops its inputs, works in a small fixed
//! scratch set (`rax`, `rcx`, `rdx`, `xmm0`-`xmm2`) and pushes its
//! result. This buys a one-pass emitter with no register allocator.
//!
//! Register roles, stable across all emitted code:
//!
//! | register | role |
//! |----------|------|
//! | `rsp`    | native stack pointer = top of the Wasm value stack |
//! | `rbp`    | frame pointer, between params and locals |
//! | `rdi`    | host-state (`VmContext`) pointer |
//! | `rsi`    | linear-memory base |
//! | `ebx`    | remaining call-depth budget |
//!
//! Anything that clobbers `rdi`/`rsi` (host upcalls, `memory.size`,
//! `memory.grow`) saves and restores them at the opcode boundary and
//! reloads the memory base from the context header, which is the
//! authoritative view after a grow.
//!
//! Branches are emitted with placeholder 32-bit relative displacements
//! and patched when the target label resolves; a displacement outside
//! the signed 32-bit range aborts compilation loudly.

use crate::arena::CodeArena;
use crate::bridge::{
    call_host_function, current_memory, grow_memory, CTX_MEMORY_BASE, CTX_MEMORY_SIZE,
    CTX_SAVED_STACK, CTX_TRAP,
    TRAP_ARITHMETIC, TRAP_INDIRECT_OOB, TRAP_INDIRECT_TYPE, TRAP_MEMORY_OOB, TRAP_STACK_OVERFLOW,
    TRAP_UNREACHABLE,
};
use crate::error::VmError;
use crate::module::{FuncSig, ModuleInfo, ValType};
use smallvec::SmallVec;
use std::ptr;
use wasmparser::{BlockType, FunctionBody, Operator};

/// Emitted size of the entry thunk, the unwind stub and each error
/// trampoline.
pub(crate) const STUB_SIZE: usize = 16;
/// Emitted size of one host import thunk.
const HOST_THUNK_SIZE: usize = 51;
/// Fixed stride of one indirect-call jump-table entry, chosen so that
/// `index * stride + base` needs only an `imul`/`add` pair.
const TABLE_ELEMENT_SIZE: usize = 17;
const MAX_PROLOGUE_SIZE: usize = 21;
const MAX_EPILOGUE_SIZE: usize = 10;
/// Per-body allocation is `prologue + body_bytes * this + epilogue`.
/// Deliberately loose; the unused tail is reclaimed after emission.
const PER_INSTRUCTION_UPPER_BOUND: usize = 128;

/// Number of stubs emitted at the segment base: entry thunk, unwind
/// stub, five error trampolines.
const STUB_COUNT: usize = 7;

/// Fixed emission cost of the stub block.
pub(crate) fn stub_block_size() -> usize {
    STUB_COUNT * STUB_SIZE
}

/// Upper bound for the whole module's code, used to size the arena
/// reservation.
pub(crate) fn code_capacity_bound(
    num_imports: usize,
    table_slots: usize,
    code_section_bytes: usize,
    num_functions: usize,
) -> usize {
    stub_block_size()
        + num_imports * HOST_THUNK_SIZE
        + table_slots * TABLE_ELEMENT_SIZE
        + num_functions * (MAX_PROLOGUE_SIZE + MAX_EPILOGUE_SIZE)
        + code_section_bytes * PER_INSTRUCTION_UPPER_BOUND
}

/// Call-site bookkeeping for direct calls and table entries: either the
/// function is already emitted, or a list of sites waiting for it.
enum FuncReloc {
    Pending(SmallVec<[*mut u8; 4]>),
    Resolved(*mut u8),
}

impl Default for FuncReloc {
    fn default() -> Self {
        FuncReloc::Pending(SmallVec::new())
    }
}

enum FrameKind {
    Block,
    Loop { header: *mut u8 },
    If { else_site: Option<*mut u8> },
}

struct ControlFrame {
    kind: FrameKind,
    /// Forward-branch sites to patch at the frame's end label.
    end_sites: SmallVec<[*mut u8; 4]>,
    /// Wasm stack depth on entry to the frame.
    entry_depth: u32,
    /// Result count of the frame (0 or 1 in the MVP).
    arity: u32,
}

struct BodyState {
    frames: Vec<ControlFrame>,
    depth: u32,
    /// Set after `br`/`return`/`unreachable`/`br_table`; emission is
    /// suppressed until the enclosing frame closes.
    dead: bool,
    /// Nesting of skipped blocks while dead.
    skip: u32,
    /// True once the implicit function frame has closed.
    finished: bool,
}

/// The writer. One instance compiles one module; function bodies stream
/// through `compile_function` in code-section order.
pub(crate) struct CodeWriter<'m> {
    module: &'m ModuleInfo,
    global_addrs: Vec<*mut u64>,
    arena: CodeArena,
    segment: Option<crate::arena::SegmentHandle>,

    code_end: *mut u8,
    code: *mut u8,

    relocations: Vec<FuncReloc>,

    pub(crate) entry_thunk: *mut u8,
    exit_label: *mut u8,
    unwind_stub: *mut u8,
    fpe_handler: *mut u8,
    call_indirect_handler: *mut u8,
    type_error_handler: *mut u8,
    stack_overflow_handler: *mut u8,
    memory_error_handler: *mut u8,
    jmp_table: *mut u8,

    /// Signature of the function currently being compiled.
    current_sig: FuncSig,
    local_count: u32,

    has_lzcnt: bool,
    has_tzcnt: bool,
}

impl<'m> CodeWriter<'m> {
    /// Build the writer and emit the fixed preamble: entry thunk, unwind
    /// stub, error trampolines, host import thunks and the indirect-call
    /// jump table.
    pub(crate) fn new(
        module: &'m ModuleInfo,
        global_addrs: Vec<*mut u64>,
        mut arena: CodeArena,
    ) -> Result<Self, VmError> {
        let segment = arena.start_code();
        let mut writer = CodeWriter {
            module,
            global_addrs,
            arena,
            segment: Some(segment),
            code_end: ptr::null_mut(),
            code: ptr::null_mut(),
            relocations: Vec::new(),
            entry_thunk: ptr::null_mut(),
            exit_label: ptr::null_mut(),
            unwind_stub: ptr::null_mut(),
            fpe_handler: ptr::null_mut(),
            call_indirect_handler: ptr::null_mut(),
            type_error_handler: ptr::null_mut(),
            stack_overflow_handler: ptr::null_mut(),
            memory_error_handler: ptr::null_mut(),
            jmp_table: ptr::null_mut(),
            current_sig: FuncSig::new(Vec::new(), None),
            local_count: 0,
            has_lzcnt: is_x86_feature_detected!("lzcnt"),
            has_tzcnt: is_x86_feature_detected!("bmi1"),
        };
        writer.relocations.resize_with(module.num_functions(), FuncReloc::default);
        writer.emit_stubs()?;
        writer.emit_host_thunks()?;
        writer.emit_jump_table()?;
        Ok(writer)
    }

    // ---------------- low-level emission ----------------

    fn alloc_block(&mut self, size: usize) -> Result<(), VmError> {
        let start = self
            .arena
            .alloc(size)
            .map_err(|e| VmError::InternalError(format!("{e:#}")))?;
        self.code = start;
        self.code_end = unsafe { start.add(size) };
        Ok(())
    }

    fn emit(&mut self, bytes: &[u8]) {
        unsafe {
            assert!(
                self.code.add(bytes.len()) <= self.code_end,
                "code emission overran its allocation"
            );
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.code, bytes.len());
            self.code = self.code.add(bytes.len());
        }
    }

    fn emit_u32(&mut self, value: u32) {
        self.emit(&value.to_le_bytes());
    }

    fn emit_u64(&mut self, value: u64) {
        self.emit(&value.to_le_bytes());
    }

    fn emit_ptr(&mut self, value: usize) {
        self.emit_u64(value as u64);
    }

    /// Emit a placeholder 32-bit displacement and return its patch site.
    /// The poison value makes an unpatched site land at a recognizable
    /// address instead of silently continuing.
    fn emit_branch_target32(&mut self) -> *mut u8 {
        let site = self.code;
        let poison = 0xdead_beefu32.wrapping_sub(site as usize as u32);
        self.emit_u32(poison);
        site
    }

    fn fix_branch(site: *mut u8, target: *const u8) {
        let rel = target as i64 - (site as i64 + 4);
        assert!(
            i32::try_from(rel).is_ok(),
            "branch displacement exceeds the 32-bit relative range"
        );
        unsafe { ptr::write_unaligned(site as *mut i32, rel as i32) };
    }

    fn pad_with_int3(&mut self, block_start: *mut u8, size: usize) {
        while (self.code as usize) < block_start as usize + size {
            self.emit(&[0xcc]);
        }
    }

    // ---------------- fixed preamble ----------------

    fn emit_stubs(&mut self) -> Result<(), VmError> {
        self.alloc_block(stub_block_size())?;

        // Entry thunk. Arguments per the System V order: rdi = context,
        // rsi = memory base, rdx = target function, rcx = depth budget.
        // Records the stack pointer in the context header; this is the
        // landing state every trampoline and the unwind stub restore.
        let entry = self.code;
        self.emit(&[0x55]); // pushq %rbp
        self.emit(&[0x53]); // pushq %rbx
        self.emit(&[0x48, 0x89, 0x67, CTX_SAVED_STACK]); // movq %rsp, saved(%rdi)
        self.emit(&[0x89, 0xcb]); // movl %ecx, %ebx
        self.emit(&[0xff, 0xd2]); // callq *%rdx
        self.exit_label = self.code;
        self.emit(&[0x5b]); // popq %rbx
        self.emit(&[0x5d]); // popq %rbp
        self.emit(&[0xc3]); // retq
        self.pad_with_int3(entry, STUB_SIZE);
        self.entry_thunk = entry;

        // Unwind stub: the longjmp taken when a host call reported a
        // trap. The pending outcome is already parked in the context.
        let unwind = self.code;
        self.emit(&[0x48, 0x8b, 0x67, CTX_SAVED_STACK]); // movq saved(%rdi), %rsp
        self.emit(&[0xe9]); // jmp exit
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.exit_label);
        self.pad_with_int3(unwind, STUB_SIZE);
        self.unwind_stub = unwind;

        self.fpe_handler = self.emit_trampoline(TRAP_ARITHMETIC);
        self.call_indirect_handler = self.emit_trampoline(TRAP_INDIRECT_OOB);
        self.type_error_handler = self.emit_trampoline(TRAP_INDIRECT_TYPE);
        self.stack_overflow_handler = self.emit_trampoline(TRAP_STACK_OVERFLOW);
        self.memory_error_handler = self.emit_trampoline(TRAP_MEMORY_OOB);

        assert_eq!(self.code, self.code_end);
        Ok(())
    }

    /// A 16-byte trampoline: store the trap kind, restore the entry
    /// stack pointer, leave through the exit label.
    fn emit_trampoline(&mut self, trap_code: u32) -> *mut u8 {
        let start = self.code;
        self.emit(&[0xc7, 0x47, CTX_TRAP]); // movl $code, trap(%rdi)
        self.emit_u32(trap_code);
        self.emit(&[0x48, 0x8b, 0x67, CTX_SAVED_STACK]); // movq saved(%rdi), %rsp
        self.emit(&[0xe9]); // jmp exit
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.exit_label);
        debug_assert_eq!(self.code as usize - start as usize, STUB_SIZE);
        start
    }

    fn emit_host_thunks(&mut self) -> Result<(), VmError> {
        let num_imports = self.module.imports.len();
        if num_imports == 0 {
            return Ok(());
        }
        self.alloc_block(num_imports * HOST_THUNK_SIZE)?;
        for index in 0..num_imports as u32 {
            let start = self.code;
            self.start_function(index);
            self.emit_host_call(index);
            debug_assert_eq!(self.code as usize - start as usize, HOST_THUNK_SIZE);
        }
        assert_eq!(self.code, self.code_end);
        Ok(())
    }

    /// One import thunk: route through the central dispatch shim, then
    /// re-pin the memory base and check the trap flag.
    fn emit_host_call(&mut self, import_index: u32) {
        self.emit(&[0xba]); // movl $index, %edx
        self.emit_u32(import_index);
        self.emit(&[0x57]); // pushq %rdi
        self.emit(&[0x56]); // pushq %rsi
        // First Wasm argument: above saved rdi/rsi and the return
        // address.
        self.emit(&[0x48, 0x8d, 0x74, 0x24, 0x18]); // leaq 0x18(%rsp), %rsi
        self.emit_align_stack();
        self.emit(&[0x48, 0xb8]); // movabsq $call_host_function, %rax
        self.emit_ptr(call_host_function as usize);
        self.emit(&[0xff, 0xd0]); // callq *%rax
        self.emit_restore_stack();
        self.emit(&[0x5e]); // popq %rsi
        self.emit(&[0x5f]); // popq %rdi
        // Re-pin the memory base; the header keeps it at offset zero so
        // the reload needs no displacement byte.
        debug_assert_eq!(CTX_MEMORY_BASE, 0);
        self.emit(&[0x48, 0x8b, 0x37]); // movq (%rdi), %rsi
        self.emit(&[0x85, 0xd2]); // testl %edx, %edx
        self.emit(&[0x0f, 0x85]); // jnz unwind
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.unwind_stub);
        self.emit(&[0xc3]); // retq
    }

    fn emit_align_stack(&mut self) {
        // movq %rsp, %rcx; andq $-16, %rsp; push %rcx twice to keep the
        // alignment and the saved pointer together.
        self.emit(&[0x48, 0x89, 0xe1]);
        self.emit(&[0x48, 0x83, 0xe4, 0xf0]);
        self.emit(&[0x51]);
        self.emit(&[0x51]);
    }

    fn emit_restore_stack(&mut self) {
        self.emit(&[0x48, 0x8b, 0x24, 0x24]); // movq (%rsp), %rsp
    }

    fn emit_jump_table(&mut self) -> Result<(), VmError> {
        let Some(table) = &self.module.table else {
            return Ok(());
        };
        if table.slots.is_empty() {
            return Ok(());
        }
        self.alloc_block(table.slots.len() * TABLE_ELEMENT_SIZE)?;
        self.jmp_table = self.code;
        let slots = table.slots.clone();
        for slot in slots {
            let start = self.code;
            match slot {
                Some(func_index) => {
                    let token = self.module.func_type_token(func_index);
                    self.emit(&[0x81, 0xfa]); // cmpl $token, %edx
                    self.emit_u32(token);
                    self.emit(&[0x0f, 0x84]); // je function
                    let site = self.emit_branch_target32();
                    self.register_call(site, func_index);
                    self.emit(&[0xe9]); // jmp type error
                    let site = self.emit_branch_target32();
                    Self::fix_branch(site, self.type_error_handler);
                }
                None => {
                    self.emit(&[0xe9]); // jmp out-of-range error
                    let site = self.emit_branch_target32();
                    Self::fix_branch(site, self.call_indirect_handler);
                    self.pad_with_int3(start, TABLE_ELEMENT_SIZE);
                }
            }
            debug_assert_eq!(self.code as usize - start as usize, TABLE_ELEMENT_SIZE);
        }
        assert_eq!(self.code, self.code_end);
        Ok(())
    }

    // ---------------- relocation bookkeeping ----------------

    fn register_call(&mut self, site: *mut u8, func_index: u32) {
        match &mut self.relocations[func_index as usize] {
            FuncReloc::Resolved(addr) => Self::fix_branch(site, *addr),
            FuncReloc::Pending(sites) => sites.push(site),
        }
    }

    fn start_function(&mut self, func_index: u32) {
        let start = self.code;
        if let FuncReloc::Pending(sites) =
            std::mem::replace(&mut self.relocations[func_index as usize], FuncReloc::Resolved(start))
        {
            for site in sites {
                Self::fix_branch(site, start);
            }
        }
    }

    // ---------------- per-function driver ----------------

    /// Compile one function body. `func_index` is in the combined index
    /// space (imports first).
    pub(crate) fn compile_function(
        &mut self,
        func_index: u32,
        body: &FunctionBody<'_>,
    ) -> Result<(), VmError> {
        self.current_sig = self.module.func_sig(func_index).clone();
        log::trace!(
            "compiling function {} ({} params)",
            func_index,
            self.current_sig.params.len()
        );

        let mut local_count: u64 = 0;
        for local in body
            .get_locals_reader()
            .map_err(|e| VmError::InternalError(e.to_string()))?
        {
            let (count, _ty) = local.map_err(|e| VmError::InternalError(e.to_string()))?;
            local_count += count as u64;
        }
        if local_count > u32::MAX as u64 {
            return Err(VmError::ContractValidationFailure(
                "too many locals".to_string(),
            ));
        }
        self.local_count = local_count as u32;

        let body_bytes = body.range().end - body.range().start;
        let bound = MAX_PROLOGUE_SIZE + body_bytes * PER_INSTRUCTION_UPPER_BOUND + MAX_EPILOGUE_SIZE;
        self.alloc_block(bound)?;
        self.start_function(func_index);
        self.emit_prologue();

        let mut state = BodyState {
            frames: vec![ControlFrame {
                kind: FrameKind::Block,
                end_sites: SmallVec::new(),
                entry_depth: 0,
                arity: self.current_sig.result.is_some() as u32,
            }],
            depth: 0,
            dead: false,
            skip: 0,
            finished: false,
        };

        let mut reader = body
            .get_operators_reader()
            .map_err(|e| VmError::InternalError(e.to_string()))?;
        while !reader.eof() {
            let op = reader
                .read()
                .map_err(|e| VmError::InternalError(e.to_string()))?;
            self.emit_operator(&op, &mut state)?;
        }
        if !state.finished {
            return Err(VmError::InternalError(
                "function body ended without closing".to_string(),
            ));
        }

        // Return the unused tail of the upper-bound allocation.
        let end = self.code_end;
        let unused = end as usize - self.code as usize;
        self.arena.reclaim(self.code, unused);
        Ok(())
    }

    fn emit_prologue(&mut self) {
        let start = self.code;
        self.emit(&[0x55]); // pushq %rbp
        self.emit(&[0x48, 0x89, 0xe5]); // movq %rsp, %rbp
        if self.local_count > 0 {
            self.emit(&[0x48, 0x31, 0xc0]); // xorq %rax, %rax
            if self.local_count > 14 {
                // Zeroing loop beats straight-line pushes past this
                // point.
                self.emit(&[0xb9]); // movl $count, %ecx
                self.emit_u32(self.local_count);
                let top = self.code;
                self.emit(&[0x50]); // pushq %rax
                self.emit(&[0xff, 0xc9]); // decl %ecx
                self.emit(&[0x0f, 0x85]); // jnz loop
                let site = self.emit_branch_target32();
                Self::fix_branch(site, top);
            } else {
                for _ in 0..self.local_count {
                    self.emit(&[0x50]); // pushq %rax
                }
            }
        }
        debug_assert!(self.code as usize - start as usize <= MAX_PROLOGUE_SIZE);
    }

    fn emit_epilogue(&mut self) {
        let start = self.code;
        if self.current_sig.result.is_some() {
            self.emit(&[0x58]); // popq %rax
        }
        self.emit_multipop(self.local_count, false);
        self.emit(&[0x5d]); // popq %rbp
        self.emit(&[0xc3]); // retq
        debug_assert!(self.code as usize - start as usize <= MAX_EPILOGUE_SIZE);
    }

    /// Remove `count` slots from the value stack, optionally keeping the
    /// top value (a carried branch result) in place.
    fn emit_multipop(&mut self, count: u32, preserve_top: bool) {
        if preserve_top {
            if count == 0 {
                return;
            }
            self.emit(&[0x48, 0x8b, 0x04, 0x24]); // movq (%rsp), %rax
            self.emit(&[0x48, 0x81, 0xc4]); // addq $(count+1)*8, %rsp
            self.emit_u32((count + 1) * 8);
            self.emit(&[0x50]); // pushq %rax
        } else if count > 0 {
            self.emit(&[0x48, 0x81, 0xc4]); // addq $count*8, %rsp
            self.emit_u32(count * 8);
        }
    }

    // ---------------- control flow ----------------

    fn block_arity(ty: &BlockType) -> u32 {
        match ty {
            BlockType::Empty => 0,
            BlockType::Type(_) => 1,
            // Rejected by the MVP feature set before emission starts.
            BlockType::FuncType(_) => unreachable!("multi-value block type"),
        }
    }

    /// Emit the stack adjustment and jump for a branch to the frame at
    /// `relative_depth`. Returns nothing; forward sites are recorded on
    /// the frame.
    fn emit_branch(&mut self, state: &mut BodyState, relative_depth: u32) {
        let index = state.frames.len() - 1 - relative_depth as usize;
        let (arity, entry_depth, is_loop, header) = {
            let frame = &state.frames[index];
            let (is_loop, header) = match frame.kind {
                FrameKind::Loop { header } => (true, header),
                _ => (false, ptr::null_mut()),
            };
            // Branches to a loop re-enter its header and carry nothing.
            let arity = if is_loop { 0 } else { frame.arity };
            (arity, frame.entry_depth, is_loop, header)
        };
        let preserve = arity == 1;
        let pops = state.depth - entry_depth - arity;
        self.emit_multipop(pops, preserve);
        self.emit(&[0xe9]); // jmp target
        let site = self.emit_branch_target32();
        if is_loop {
            Self::fix_branch(site, header);
        } else {
            state.frames[index].end_sites.push(site);
        }
    }

    fn emit_br_if(&mut self, state: &mut BodyState, relative_depth: u32) {
        self.emit(&[0x58]); // popq %rax (condition)
        self.emit(&[0x85, 0xc0]); // testl %eax, %eax
        state.depth -= 1;

        let index = state.frames.len() - 1 - relative_depth as usize;
        let (arity, entry_depth, is_loop, header) = {
            let frame = &state.frames[index];
            let (is_loop, header) = match frame.kind {
                FrameKind::Loop { header } => (true, header),
                _ => (false, ptr::null_mut()),
            };
            let arity = if is_loop { 0 } else { frame.arity };
            (arity, frame.entry_depth, is_loop, header)
        };
        let preserve = arity == 1;
        let pops = state.depth - entry_depth - arity;

        if pops == 0 {
            // No adjustment needed; branch directly on the condition.
            self.emit(&[0x0f, 0x85]); // jnz target
            let site = self.emit_branch_target32();
            if is_loop {
                Self::fix_branch(site, header);
            } else {
                state.frames[index].end_sites.push(site);
            }
        } else {
            self.emit(&[0x0f, 0x84]); // jz skip
            let skip = self.emit_branch_target32();
            self.emit_multipop(pops, preserve);
            self.emit(&[0xe9]); // jmp target
            let site = self.emit_branch_target32();
            if is_loop {
                Self::fix_branch(site, header);
            } else {
                state.frames[index].end_sites.push(site);
            }
            Self::fix_branch(skip, self.code);
        }
    }

    /// `br_table`: a balanced binary search over the case indices. The
    /// range is widened by one so the default case falls out of the same
    /// algorithm, and every comparison only checks lower bounds, so
    /// values past the last case land on the default leaf.
    fn emit_br_table(
        &mut self,
        state: &mut BodyState,
        targets: &[u32],
        default: u32,
    ) {
        self.emit(&[0x58]); // popq %rax (selector)
        state.depth -= 1;

        struct Range {
            min: u32,
            max: u32,
            label: Option<*mut u8>,
        }
        let case_count = targets.len() as u32;
        let mut stack = vec![Range {
            min: 0,
            max: case_count + 1,
            label: None,
        }];

        for leaf in 0..=case_count {
            let relative_depth = if leaf < case_count {
                targets[leaf as usize]
            } else {
                default
            };
            loop {
                let Range { min, max, label } = stack.pop().expect("br_table range stack");
                if max - min > 1 {
                    if let Some(site) = label {
                        Self::fix_branch(site, self.code);
                    }
                    let mid = min + (max - min) / 2;
                    self.emit(&[0x3d]); // cmpl $mid, %eax
                    self.emit_u32(mid);
                    self.emit(&[0x0f, 0x83]); // jae upper half
                    let upper = self.emit_branch_target32();
                    stack.push(Range {
                        min: mid,
                        max,
                        label: Some(upper),
                    });
                    stack.push(Range {
                        min,
                        max: mid,
                        label: None,
                    });
                    continue;
                }
                debug_assert_eq!(min, leaf);

                let index = state.frames.len() - 1 - relative_depth as usize;
                let (arity, entry_depth, is_loop, header) = {
                    let frame = &state.frames[index];
                    let (is_loop, header) = match frame.kind {
                        FrameKind::Loop { header } => (true, header),
                        _ => (false, ptr::null_mut()),
                    };
                    let arity = if is_loop { 0 } else { frame.arity };
                    (arity, frame.entry_depth, is_loop, header)
                };
                let preserve = arity == 1;
                let pops = state.depth - entry_depth - arity;

                if pops == 0 {
                    if let Some(site) = label {
                        // The pending comparison branch can jump to the
                        // final target directly.
                        if is_loop {
                            Self::fix_branch(site, header);
                        } else {
                            state.frames[index].end_sites.push(site);
                        }
                        break;
                    }
                    self.emit(&[0xe9]); // jmp target
                    let site = self.emit_branch_target32();
                    if is_loop {
                        Self::fix_branch(site, header);
                    } else {
                        state.frames[index].end_sites.push(site);
                    }
                    break;
                }

                if let Some(site) = label {
                    Self::fix_branch(site, self.code);
                }
                self.emit_multipop(pops, preserve);
                self.emit(&[0xe9]); // jmp target
                let site = self.emit_branch_target32();
                if is_loop {
                    Self::fix_branch(site, header);
                } else {
                    state.frames[index].end_sites.push(site);
                }
                break;
            }
        }
        debug_assert!(stack.is_empty());
    }

    /// Close the innermost frame at `end`.
    fn close_frame(&mut self, state: &mut BodyState) {
        let frame = state.frames.pop().expect("control frame underflow");
        if state.frames.is_empty() {
            // Function end: every `return` and fallthrough meets here.
            for site in &frame.end_sites {
                Self::fix_branch(*site, self.code);
            }
            self.emit_epilogue();
            state.finished = true;
            state.dead = false;
            return;
        }
        if let FrameKind::If {
            else_site: Some(site),
        } = frame.kind
        {
            // If without an else: the false path joins at the end label.
            Self::fix_branch(site, self.code);
        }
        for site in &frame.end_sites {
            Self::fix_branch(*site, self.code);
        }
        state.depth = frame.entry_depth + frame.arity;
        state.dead = false;
    }

    // ---------------- operator dispatch ----------------

    fn emit_operator(&mut self, op: &Operator<'_>, state: &mut BodyState) -> Result<(), VmError> {
        if state.dead {
            match op {
                Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => {
                    state.skip += 1;
                }
                Operator::End => {
                    if state.skip > 0 {
                        state.skip -= 1;
                    } else {
                        self.close_frame(state);
                    }
                }
                Operator::Else => {
                    if state.skip == 0 {
                        // The then-arm ended dead; no jump over the else
                        // is needed.
                        let frame = state.frames.last_mut().expect("if frame");
                        if let FrameKind::If { else_site } = &mut frame.kind {
                            if let Some(site) = else_site.take() {
                                Self::fix_branch(site, self.code);
                            }
                        }
                        state.depth = state.frames.last().unwrap().entry_depth;
                        state.dead = false;
                    }
                }
                _ => {}
            }
            return Ok(());
        }

        match op {
            Operator::Unreachable => {
                self.emit_unreachable();
                state.dead = true;
            }
            Operator::Nop => {}
            Operator::Block { blockty } => {
                state.frames.push(ControlFrame {
                    kind: FrameKind::Block,
                    end_sites: SmallVec::new(),
                    entry_depth: state.depth,
                    arity: Self::block_arity(blockty),
                });
            }
            Operator::Loop { blockty } => {
                state.frames.push(ControlFrame {
                    kind: FrameKind::Loop { header: self.code },
                    end_sites: SmallVec::new(),
                    entry_depth: state.depth,
                    arity: Self::block_arity(blockty),
                });
            }
            Operator::If { blockty } => {
                self.emit(&[0x58]); // popq %rax
                self.emit(&[0x85, 0xc0]); // testl %eax, %eax
                self.emit(&[0x0f, 0x84]); // jz else/end
                let else_site = self.emit_branch_target32();
                state.depth -= 1;
                state.frames.push(ControlFrame {
                    kind: FrameKind::If {
                        else_site: Some(else_site),
                    },
                    end_sites: SmallVec::new(),
                    entry_depth: state.depth,
                    arity: Self::block_arity(blockty),
                });
            }
            Operator::Else => {
                // Jump the then-arm over the else body, then resolve the
                // false edge here.
                let arity = state.frames.last().unwrap().arity;
                let entry_depth = state.frames.last().unwrap().entry_depth;
                let preserve = arity == 1;
                let pops = state.depth - entry_depth - arity;
                self.emit_multipop(pops, preserve);
                self.emit(&[0xe9]); // jmp end
                let end_site = self.emit_branch_target32();
                let frame = state.frames.last_mut().unwrap();
                frame.end_sites.push(end_site);
                if let FrameKind::If { else_site } = &mut frame.kind {
                    if let Some(site) = else_site.take() {
                        Self::fix_branch(site, self.code);
                    }
                }
                state.depth = entry_depth;
            }
            Operator::End => self.close_frame(state),
            Operator::Br { relative_depth } => {
                self.emit_branch(state, *relative_depth);
                state.dead = true;
            }
            Operator::BrIf { relative_depth } => self.emit_br_if(state, *relative_depth),
            Operator::BrTable { targets } => {
                let default = targets.default();
                let cases: Vec<u32> = targets
                    .targets()
                    .collect::<Result<_, _>>()
                    .map_err(|e| VmError::InternalError(e.to_string()))?;
                self.emit_br_table(state, &cases, default);
                state.dead = true;
            }
            Operator::Return => {
                self.emit_branch(state, state.frames.len() as u32 - 1);
                state.dead = true;
            }
            Operator::Call { function_index } => self.emit_call(state, *function_index),
            Operator::CallIndirect { type_index, .. } => {
                self.emit_call_indirect(state, *type_index)
            }

            Operator::Drop => {
                self.emit(&[0x58]); // popq %rax
                state.depth -= 1;
            }
            Operator::Select => {
                self.emit(&[0x58]); // popq %rax (condition)
                self.emit(&[0x59]); // popq %rcx (false value)
                self.emit(&[0x85, 0xc0]); // testl %eax, %eax
                self.emit(&[0x48, 0x0f, 0x45, 0x0c, 0x24]); // cmovnzq (%rsp), %rcx
                self.emit(&[0x48, 0x89, 0x0c, 0x24]); // movq %rcx, (%rsp)
                state.depth -= 2;
            }

            Operator::LocalGet { local_index } => {
                self.emit(&[0x48, 0x8b, 0x85]); // movq disp32(%rbp), %rax
                self.emit_u32(self.local_offset(*local_index));
                self.emit(&[0x50]); // pushq %rax
                state.depth += 1;
            }
            Operator::LocalSet { local_index } => {
                self.emit(&[0x58]); // popq %rax
                self.emit(&[0x48, 0x89, 0x85]); // movq %rax, disp32(%rbp)
                self.emit_u32(self.local_offset(*local_index));
                state.depth -= 1;
            }
            Operator::LocalTee { local_index } => {
                self.emit(&[0x58]); // popq %rax
                self.emit(&[0x50]); // pushq %rax
                self.emit(&[0x48, 0x89, 0x85]); // movq %rax, disp32(%rbp)
                self.emit_u32(self.local_offset(*local_index));
            }

            Operator::GlobalGet { global_index } => {
                let addr = self.global_addrs[*global_index as usize] as usize;
                let ty = self.module.globals[*global_index as usize].ty;
                self.emit(&[0x48, 0xb8]); // movabsq $cell, %rax
                self.emit_ptr(addr);
                match ty {
                    ValType::I32 | ValType::F32 => self.emit(&[0x8b, 0x00]), // movl (%rax), %eax
                    ValType::I64 | ValType::F64 => self.emit(&[0x48, 0x8b, 0x00]), // movq
                }
                self.emit(&[0x50]); // pushq %rax
                state.depth += 1;
            }
            Operator::GlobalSet { global_index } => {
                let addr = self.global_addrs[*global_index as usize] as usize;
                self.emit(&[0x59]); // popq %rcx
                self.emit(&[0x48, 0xb8]); // movabsq $cell, %rax
                self.emit_ptr(addr);
                self.emit(&[0x48, 0x89, 0x08]); // movq %rcx, (%rax)
                state.depth -= 1;
            }

            // Loads. The native load opcode encodes the width and
            // extension; the shared helper does address arithmetic and
            // the bounds check.
            Operator::I32Load { memarg } => self.emit_load(memarg.offset as u32, 4, &[0x8b, 0x00]),
            Operator::I64Load { memarg } => {
                self.emit_load(memarg.offset as u32, 8, &[0x48, 0x8b, 0x00])
            }
            Operator::F32Load { memarg } => self.emit_load(memarg.offset as u32, 4, &[0x8b, 0x00]),
            Operator::F64Load { memarg } => {
                self.emit_load(memarg.offset as u32, 8, &[0x48, 0x8b, 0x00])
            }
            Operator::I32Load8S { memarg } => {
                self.emit_load(memarg.offset as u32, 1, &[0x0f, 0xbe, 0x00])
            }
            Operator::I32Load8U { memarg } => {
                self.emit_load(memarg.offset as u32, 1, &[0x0f, 0xb6, 0x00])
            }
            Operator::I32Load16S { memarg } => {
                self.emit_load(memarg.offset as u32, 2, &[0x0f, 0xbf, 0x00])
            }
            Operator::I32Load16U { memarg } => {
                self.emit_load(memarg.offset as u32, 2, &[0x0f, 0xb7, 0x00])
            }
            Operator::I64Load8S { memarg } => {
                self.emit_load(memarg.offset as u32, 1, &[0x48, 0x0f, 0xbe, 0x00])
            }
            Operator::I64Load8U { memarg } => {
                self.emit_load(memarg.offset as u32, 1, &[0x0f, 0xb6, 0x00])
            }
            Operator::I64Load16S { memarg } => {
                self.emit_load(memarg.offset as u32, 2, &[0x48, 0x0f, 0xbf, 0x00])
            }
            Operator::I64Load16U { memarg } => {
                self.emit_load(memarg.offset as u32, 2, &[0x0f, 0xb7, 0x00])
            }
            Operator::I64Load32S { memarg } => {
                self.emit_load(memarg.offset as u32, 4, &[0x48, 0x63, 0x00])
            }
            Operator::I64Load32U { memarg } => {
                self.emit_load(memarg.offset as u32, 4, &[0x8b, 0x00])
            }

            Operator::I32Store { memarg } => {
                self.emit_store(state, memarg.offset as u32, 4, &[0x89, 0x08])
            }
            Operator::I64Store { memarg } => {
                self.emit_store(state, memarg.offset as u32, 8, &[0x48, 0x89, 0x08])
            }
            Operator::F32Store { memarg } => {
                self.emit_store(state, memarg.offset as u32, 4, &[0x89, 0x08])
            }
            Operator::F64Store { memarg } => {
                self.emit_store(state, memarg.offset as u32, 8, &[0x48, 0x89, 0x08])
            }
            Operator::I32Store8 { memarg } => {
                self.emit_store(state, memarg.offset as u32, 1, &[0x88, 0x08])
            }
            Operator::I32Store16 { memarg } => {
                self.emit_store(state, memarg.offset as u32, 2, &[0x66, 0x89, 0x08])
            }
            Operator::I64Store8 { memarg } => {
                self.emit_store(state, memarg.offset as u32, 1, &[0x88, 0x08])
            }
            Operator::I64Store16 { memarg } => {
                self.emit_store(state, memarg.offset as u32, 2, &[0x66, 0x89, 0x08])
            }
            Operator::I64Store32 { memarg } => {
                self.emit_store(state, memarg.offset as u32, 4, &[0x89, 0x08])
            }

            Operator::MemorySize { .. } => {
                self.emit_current_memory();
                state.depth += 1;
            }
            Operator::MemoryGrow { .. } => {
                self.emit_grow_memory();
            }

            Operator::I32Const { value } => {
                self.emit(&[0xb8]); // movl $value, %eax
                self.emit_u32(*value as u32);
                self.emit(&[0x50]); // pushq %rax
                state.depth += 1;
            }
            Operator::I64Const { value } => {
                self.emit(&[0x48, 0xb8]); // movabsq $value, %rax
                self.emit_u64(*value as u64);
                self.emit(&[0x50]);
                state.depth += 1;
            }
            Operator::F32Const { value } => {
                self.emit(&[0xb8]);
                self.emit_u32(value.bits());
                self.emit(&[0x50]);
                state.depth += 1;
            }
            Operator::F64Const { value } => {
                self.emit(&[0x48, 0xb8]);
                self.emit_u64(value.bits());
                self.emit(&[0x50]);
                state.depth += 1;
            }

            Operator::I32Eqz => {
                self.emit(&[0x58]); // popq %rax
                self.emit(&[0x48, 0x31, 0xc9]); // xorq %rcx, %rcx
                self.emit(&[0x85, 0xc0]); // testl %eax, %eax
                self.emit(&[0x0f, 0x94, 0xc1]); // setz %cl
                self.emit(&[0x51]); // pushq %rcx
            }
            Operator::I64Eqz => {
                self.emit(&[0x58]);
                self.emit(&[0x48, 0x31, 0xc9]);
                self.emit(&[0x48, 0x85, 0xc0]); // testq %rax, %rax
                self.emit(&[0x0f, 0x94, 0xc1]);
                self.emit(&[0x51]);
            }

            Operator::I32Eq => self.emit_i32_relop(state, 0x94),
            Operator::I32Ne => self.emit_i32_relop(state, 0x95),
            Operator::I32LtS => self.emit_i32_relop(state, 0x9c),
            Operator::I32LtU => self.emit_i32_relop(state, 0x92),
            Operator::I32GtS => self.emit_i32_relop(state, 0x9f),
            Operator::I32GtU => self.emit_i32_relop(state, 0x97),
            Operator::I32LeS => self.emit_i32_relop(state, 0x9e),
            Operator::I32LeU => self.emit_i32_relop(state, 0x96),
            Operator::I32GeS => self.emit_i32_relop(state, 0x9d),
            Operator::I32GeU => self.emit_i32_relop(state, 0x93),

            Operator::I64Eq => self.emit_i64_relop(state, 0x94),
            Operator::I64Ne => self.emit_i64_relop(state, 0x95),
            Operator::I64LtS => self.emit_i64_relop(state, 0x9c),
            Operator::I64LtU => self.emit_i64_relop(state, 0x92),
            Operator::I64GtS => self.emit_i64_relop(state, 0x9f),
            Operator::I64GtU => self.emit_i64_relop(state, 0x97),
            Operator::I64LeS => self.emit_i64_relop(state, 0x9e),
            Operator::I64LeU => self.emit_i64_relop(state, 0x96),
            Operator::I64GeS => self.emit_i64_relop(state, 0x9d),
            Operator::I64GeU => self.emit_i64_relop(state, 0x93),

            Operator::F32Eq => self.emit_f32_relop(state, 0x00, false, false),
            Operator::F32Ne => self.emit_f32_relop(state, 0x00, false, true),
            Operator::F32Lt => self.emit_f32_relop(state, 0x01, false, false),
            Operator::F32Gt => self.emit_f32_relop(state, 0x01, true, false),
            Operator::F32Le => self.emit_f32_relop(state, 0x02, false, false),
            Operator::F32Ge => self.emit_f32_relop(state, 0x02, true, false),

            Operator::F64Eq => self.emit_f64_relop(state, 0x00, false, false),
            Operator::F64Ne => self.emit_f64_relop(state, 0x00, false, true),
            Operator::F64Lt => self.emit_f64_relop(state, 0x01, false, false),
            Operator::F64Gt => self.emit_f64_relop(state, 0x01, true, false),
            Operator::F64Le => self.emit_f64_relop(state, 0x02, false, false),
            Operator::F64Ge => self.emit_f64_relop(state, 0x02, true, false),

            Operator::I32Clz => self.emit_i32_clz(),
            Operator::I32Ctz => self.emit_i32_ctz(),
            Operator::I32Popcnt => {
                self.emit(&[0x58]); // popq %rax
                self.emit(&[0xf3, 0x0f, 0xb8, 0xc0]); // popcntl %eax, %eax
                self.emit(&[0x50]);
            }
            Operator::I32Add => self.emit_int_binop(state, &[0x01, 0xc8, 0x50]),
            Operator::I32Sub => self.emit_int_binop(state, &[0x29, 0xc8, 0x50]),
            Operator::I32Mul => self.emit_int_binop(state, &[0x0f, 0xaf, 0xc1, 0x50]),
            Operator::I32DivS => self.emit_i32_div_s(state),
            Operator::I32DivU => self.emit_i32_div_u(state),
            Operator::I32RemS => self.emit_i32_rem_s(state),
            Operator::I32RemU => self.emit_i32_rem_u(state),
            Operator::I32And => self.emit_int_binop(state, &[0x21, 0xc8, 0x50]),
            Operator::I32Or => self.emit_int_binop(state, &[0x09, 0xc8, 0x50]),
            Operator::I32Xor => self.emit_int_binop(state, &[0x31, 0xc8, 0x50]),
            Operator::I32Shl => self.emit_int_binop(state, &[0xd3, 0xe0, 0x50]),
            Operator::I32ShrS => self.emit_int_binop(state, &[0xd3, 0xf8, 0x50]),
            Operator::I32ShrU => self.emit_int_binop(state, &[0xd3, 0xe8, 0x50]),
            Operator::I32Rotl => self.emit_int_binop(state, &[0xd3, 0xc0, 0x50]),
            Operator::I32Rotr => self.emit_int_binop(state, &[0xd3, 0xc8, 0x50]),

            Operator::I64Clz => self.emit_i64_clz(),
            Operator::I64Ctz => self.emit_i64_ctz(),
            Operator::I64Popcnt => {
                self.emit(&[0x58]);
                self.emit(&[0xf3, 0x48, 0x0f, 0xb8, 0xc0]); // popcntq %rax, %rax
                self.emit(&[0x50]);
            }
            Operator::I64Add => self.emit_int_binop(state, &[0x48, 0x01, 0xc8, 0x50]),
            Operator::I64Sub => self.emit_int_binop(state, &[0x48, 0x29, 0xc8, 0x50]),
            Operator::I64Mul => self.emit_int_binop(state, &[0x48, 0x0f, 0xaf, 0xc1, 0x50]),
            Operator::I64DivS => self.emit_i64_div_s(state),
            Operator::I64DivU => self.emit_i64_div_u(state),
            Operator::I64RemS => self.emit_i64_rem_s(state),
            Operator::I64RemU => self.emit_i64_rem_u(state),
            Operator::I64And => self.emit_int_binop(state, &[0x48, 0x21, 0xc8, 0x50]),
            Operator::I64Or => self.emit_int_binop(state, &[0x48, 0x09, 0xc8, 0x50]),
            Operator::I64Xor => self.emit_int_binop(state, &[0x48, 0x31, 0xc8, 0x50]),
            Operator::I64Shl => self.emit_int_binop(state, &[0x48, 0xd3, 0xe0, 0x50]),
            Operator::I64ShrS => self.emit_int_binop(state, &[0x48, 0xd3, 0xf8, 0x50]),
            Operator::I64ShrU => self.emit_int_binop(state, &[0x48, 0xd3, 0xe8, 0x50]),
            Operator::I64Rotl => self.emit_int_binop(state, &[0x48, 0xd3, 0xc0, 0x50]),
            Operator::I64Rotr => self.emit_int_binop(state, &[0x48, 0xd3, 0xc8, 0x50]),

            Operator::F32Abs => {
                self.emit(&[0x58]); // popq %rax
                self.emit(&[0x25]); // andl $0x7fffffff, %eax
                self.emit_u32(0x7fff_ffff);
                self.emit(&[0x50]);
            }
            Operator::F32Neg => {
                self.emit(&[0x58]);
                self.emit(&[0x35]); // xorl $0x80000000, %eax
                self.emit_u32(0x8000_0000);
                self.emit(&[0x50]);
            }
            Operator::F32Ceil => self.emit_f32_round(0x0a),
            Operator::F32Floor => self.emit_f32_round(0x09),
            Operator::F32Trunc => self.emit_f32_round(0x0b),
            Operator::F32Nearest => self.emit_f32_round(0x08),
            Operator::F32Sqrt => {
                self.emit(&[0xf3, 0x0f, 0x51, 0x04, 0x24]); // sqrtss (%rsp), %xmm0
                self.emit(&[0xf3, 0x0f, 0x11, 0x04, 0x24]); // movss %xmm0, (%rsp)
            }
            Operator::F32Add => self.emit_f32_binop(state, 0x58),
            Operator::F32Sub => self.emit_f32_binop(state, 0x5c),
            Operator::F32Mul => self.emit_f32_binop(state, 0x59),
            Operator::F32Div => self.emit_f32_binop(state, 0x5e),
            Operator::F32Min => self.emit_f32_min_max(state, true),
            Operator::F32Max => self.emit_f32_min_max(state, false),
            Operator::F32Copysign => {
                self.emit(&[0x58]); // popq %rax (sign source)
                self.emit(&[0x25]); // andl $0x80000000, %eax
                self.emit_u32(0x8000_0000);
                self.emit(&[0x59]); // popq %rcx (magnitude)
                self.emit(&[0x81, 0xe1]); // andl $0x7fffffff, %ecx
                self.emit_u32(0x7fff_ffff);
                self.emit(&[0x09, 0xc8]); // orl %ecx, %eax
                self.emit(&[0x50]);
                state.depth -= 1;
            }

            Operator::F64Abs => {
                self.emit(&[0x59]); // popq %rcx
                self.emit(&[0x48, 0xb8]); // movabsq $0x7fff..., %rax
                self.emit_u64(0x7fff_ffff_ffff_ffff);
                self.emit(&[0x48, 0x21, 0xc8]); // andq %rcx, %rax
                self.emit(&[0x50]);
            }
            Operator::F64Neg => {
                self.emit(&[0x59]);
                self.emit(&[0x48, 0xb8]);
                self.emit_u64(0x8000_0000_0000_0000);
                self.emit(&[0x48, 0x31, 0xc8]); // xorq %rcx, %rax
                self.emit(&[0x50]);
            }
            Operator::F64Ceil => self.emit_f64_round(0x0a),
            Operator::F64Floor => self.emit_f64_round(0x09),
            Operator::F64Trunc => self.emit_f64_round(0x0b),
            Operator::F64Nearest => self.emit_f64_round(0x08),
            Operator::F64Sqrt => {
                self.emit(&[0xf2, 0x0f, 0x51, 0x04, 0x24]); // sqrtsd (%rsp), %xmm0
                self.emit(&[0xf2, 0x0f, 0x11, 0x04, 0x24]); // movsd %xmm0, (%rsp)
            }
            Operator::F64Add => self.emit_f64_binop(state, 0x58),
            Operator::F64Sub => self.emit_f64_binop(state, 0x5c),
            Operator::F64Mul => self.emit_f64_binop(state, 0x59),
            Operator::F64Div => self.emit_f64_binop(state, 0x5e),
            Operator::F64Min => self.emit_f64_min_max(state, true),
            Operator::F64Max => self.emit_f64_min_max(state, false),
            Operator::F64Copysign => {
                self.emit(&[0x59]); // popq %rcx (sign source)
                self.emit(&[0x48, 0xb8]); // movabsq $signbit, %rax
                self.emit_u64(0x8000_0000_0000_0000);
                self.emit(&[0x48, 0x21, 0xc1]); // andq %rax, %rcx
                self.emit(&[0x5a]); // popq %rdx (magnitude)
                self.emit(&[0x48, 0xf7, 0xd0]); // notq %rax
                self.emit(&[0x48, 0x21, 0xd0]); // andq %rdx, %rax
                self.emit(&[0x48, 0x09, 0xc8]); // orq %rcx, %rax
                self.emit(&[0x50]);
                state.depth -= 1;
            }

            Operator::I32WrapI64 => {
                // Zero the high half of the top slot in place.
                self.emit(&[0x31, 0xc0]); // xorl %eax, %eax
                self.emit(&[0x89, 0x44, 0x24, 0x04]); // movl %eax, 4(%rsp)
            }
            Operator::I32TruncF32S => {
                // cvttss2si 8(%rsp), %eax under a saved control word
                self.emit_f2i(&[0xf3, 0x0f, 0x2c, 0x44, 0x24, 0x08]);
                self.emit(&[0x89, 0x04, 0x24]); // movl %eax, (%rsp)
            }
            Operator::I32TruncF32U => {
                self.emit_f2i(&[0xf3, 0x48, 0x0f, 0x2c, 0x44, 0x24, 0x08]);
                self.emit(&[0x89, 0x04, 0x24]); // movl %eax, (%rsp)
                self.emit(&[0x48, 0xc1, 0xe8, 0x20]); // shrq $32, %rax
                self.emit(&[0x85, 0xc0]); // testl %eax, %eax
                self.emit(&[0x0f, 0x85]); // jnz arithmetic error
                let site = self.emit_branch_target32();
                Self::fix_branch(site, self.fpe_handler);
            }
            Operator::I32TruncF64S => {
                self.emit_f2i(&[0xf2, 0x0f, 0x2c, 0x44, 0x24, 0x08]);
                self.emit(&[0x48, 0x89, 0x04, 0x24]); // movq %rax, (%rsp)
            }
            Operator::I32TruncF64U => {
                self.emit_f2i(&[0xf2, 0x48, 0x0f, 0x2c, 0x44, 0x24, 0x08]);
                self.emit(&[0x48, 0x89, 0x04, 0x24]);
                self.emit(&[0x48, 0xc1, 0xe8, 0x20]); // shrq $32, %rax
                self.emit(&[0x85, 0xc0]);
                self.emit(&[0x0f, 0x85]);
                let site = self.emit_branch_target32();
                Self::fix_branch(site, self.fpe_handler);
            }
            Operator::I64ExtendI32S => {
                self.emit(&[0x48, 0x63, 0x04, 0x24]); // movslq (%rsp), %rax
                self.emit(&[0x48, 0x89, 0x04, 0x24]); // movq %rax, (%rsp)
            }
            Operator::I64ExtendI32U => {
                // The slot may carry stale high bits from reinterprets;
                // normalize it.
                self.emit(&[0x31, 0xc0]); // xorl %eax, %eax
                self.emit(&[0x89, 0x44, 0x24, 0x04]); // movl %eax, 4(%rsp)
            }
            Operator::I64TruncF32S => {
                self.emit_f2i(&[0xf3, 0x48, 0x0f, 0x2c, 0x44, 0x24, 0x08]);
                self.emit(&[0x48, 0x89, 0x04, 0x24]);
            }
            Operator::I64TruncF32U => self.emit_i64_trunc_u_f32(),
            Operator::I64TruncF64S => {
                self.emit_f2i(&[0xf2, 0x48, 0x0f, 0x2c, 0x44, 0x24, 0x08]);
                self.emit(&[0x48, 0x89, 0x04, 0x24]);
            }
            Operator::I64TruncF64U => self.emit_i64_trunc_u_f64(),

            Operator::F32ConvertI32S => {
                self.emit(&[0xf3, 0x0f, 0x2a, 0x04, 0x24]); // cvtsi2ssl (%rsp), %xmm0
                self.emit(&[0xf3, 0x0f, 0x11, 0x04, 0x24]); // movss %xmm0, (%rsp)
            }
            Operator::F32ConvertI32U => {
                // Zero-extended to 64 bits, then a 64-bit convert.
                self.emit(&[0x31, 0xc0]);
                self.emit(&[0x89, 0x44, 0x24, 0x04]);
                self.emit(&[0xf3, 0x48, 0x0f, 0x2a, 0x04, 0x24]); // cvtsi2ssq (%rsp), %xmm0
                self.emit(&[0xf3, 0x0f, 0x11, 0x04, 0x24]);
            }
            Operator::F32ConvertI64S => {
                self.emit(&[0xf3, 0x48, 0x0f, 0x2a, 0x04, 0x24]);
                self.emit(&[0xf3, 0x0f, 0x11, 0x04, 0x24]);
            }
            Operator::F32ConvertI64U => self.emit_f32_convert_u_i64(),
            Operator::F32DemoteF64 => {
                self.emit(&[0xf2, 0x0f, 0x5a, 0x04, 0x24]); // cvtsd2ss (%rsp), %xmm0
                self.emit(&[0xf3, 0x0f, 0x11, 0x04, 0x24]);
            }
            Operator::F64ConvertI32S => {
                self.emit(&[0xf2, 0x0f, 0x2a, 0x04, 0x24]); // cvtsi2sdl (%rsp), %xmm0
                self.emit(&[0xf2, 0x0f, 0x11, 0x04, 0x24]);
            }
            Operator::F64ConvertI32U => {
                self.emit(&[0x31, 0xc0]);
                self.emit(&[0x89, 0x44, 0x24, 0x04]);
                self.emit(&[0xf2, 0x48, 0x0f, 0x2a, 0x04, 0x24]); // cvtsi2sdq (%rsp), %xmm0
                self.emit(&[0xf2, 0x0f, 0x11, 0x04, 0x24]);
            }
            Operator::F64ConvertI64S => {
                self.emit(&[0xf2, 0x48, 0x0f, 0x2a, 0x04, 0x24]);
                self.emit(&[0xf2, 0x0f, 0x11, 0x04, 0x24]);
            }
            Operator::F64ConvertI64U => self.emit_f64_convert_u_i64(),
            Operator::F64PromoteF32 => {
                self.emit(&[0xf3, 0x0f, 0x5a, 0x04, 0x24]); // cvtss2sd (%rsp), %xmm0
                self.emit(&[0xf2, 0x0f, 0x11, 0x04, 0x24]);
            }

            Operator::I32ReinterpretF32
            | Operator::I64ReinterpretF64
            | Operator::F32ReinterpretI32
            | Operator::F64ReinterpretI64 => {}

            other => {
                return Err(VmError::ContractValidationFailure(format!(
                    "unsupported instruction {other:?}"
                )))
            }
        }
        Ok(())
    }

    // ---------------- calls ----------------

    fn emit_check_call_depth(&mut self) {
        self.emit(&[0xff, 0xcb]); // decl %ebx
        self.emit(&[0x0f, 0x84]); // jz stack overflow
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.stack_overflow_handler);
    }

    fn emit_check_call_depth_end(&mut self) {
        self.emit(&[0xff, 0xc3]); // incl %ebx
    }

    fn emit_call(&mut self, state: &mut BodyState, function_index: u32) {
        let sig = self.module.func_sig(function_index).clone();
        self.emit_check_call_depth();
        self.emit(&[0xe8]); // callq target
        let site = self.emit_branch_target32();
        self.register_call(site, function_index);
        self.emit_multipop(sig.params.len() as u32, false);
        if sig.result.is_some() {
            self.emit(&[0x50]); // pushq %rax
        }
        self.emit_check_call_depth_end();
        state.depth -= sig.params.len() as u32;
        state.depth += sig.result.is_some() as u32;
    }

    fn emit_call_indirect(&mut self, state: &mut BodyState, type_index: u32) {
        let sig = self.module.types[type_index as usize].clone();
        let token = self.module.type_tokens[type_index as usize];
        let table_size = self
            .module
            .table
            .as_ref()
            .map(|t| t.slots.len())
            .unwrap_or(0) as u32;

        self.emit_check_call_depth();
        self.emit(&[0x58]); // popq %rax (table index)
        self.emit(&[0x89, 0xc0]); // movl %eax, %eax (normalize high bits)
        self.emit(&[0x48, 0x3d]); // cmpq $table_size, %rax
        self.emit_u32(table_size);
        self.emit(&[0x0f, 0x83]); // jae out of range
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.call_indirect_handler);
        self.emit(&[0x48, 0x8d, 0x15]); // leaq table(%rip), %rdx
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.jmp_table);
        debug_assert!(TABLE_ELEMENT_SIZE <= 127);
        self.emit(&[0x6b, 0xc0, TABLE_ELEMENT_SIZE as u8]); // imull $17, %eax, %eax
        self.emit(&[0x48, 0x01, 0xd0]); // addq %rdx, %rax
        self.emit(&[0xba]); // movl $token, %edx
        self.emit_u32(token);
        self.emit(&[0xff, 0xd0]); // callq *%rax
        self.emit_multipop(sig.params.len() as u32, false);
        if sig.result.is_some() {
            self.emit(&[0x50]); // pushq %rax
        }
        self.emit_check_call_depth_end();
        state.depth -= 1 + sig.params.len() as u32;
        state.depth += sig.result.is_some() as u32;
    }

    // ---------------- memory ----------------

    fn local_offset(&self, local_index: u32) -> u32 {
        // Layout around the frame pointer:
        //   param0            <- rbp + 8*(nparams+1)
        //   ...
        //   paramN-1          <- rbp + 16
        //   return address
        //   saved rbp         <- rbp
        //   local0            <- rbp - 8
        let params = self.current_sig.params.len() as u32;
        if local_index < params {
            8 * (params - local_index + 1)
        } else {
            (-(8 * (local_index - params + 1) as i32)) as u32
        }
    }

    /// Pop the index, apply the static offset, bounds-check the access
    /// end against the context's memory size, add the base and run the
    /// caller-supplied load opcode, then push.
    fn emit_load(&mut self, offset: u32, size: u8, load_op: &[u8]) {
        self.emit(&[0x58]); // popq %rax
        self.emit_address_check(offset, size);
        self.emit(&[0x48, 0x01, 0xf0]); // addq %rsi, %rax
        self.emit(load_op);
        self.emit(&[0x50]); // pushq %rax
    }

    fn emit_store(&mut self, state: &mut BodyState, offset: u32, size: u8, store_op: &[u8]) {
        self.emit(&[0x59]); // popq %rcx (value)
        self.emit(&[0x58]); // popq %rax (index)
        self.emit_address_check(offset, size);
        self.emit(&[0x48, 0x01, 0xf0]); // addq %rsi, %rax
        self.emit(store_op);
        state.depth -= 2;
    }

    /// rax holds the raw 32-bit index. On exit rax holds the effective
    /// offset, checked so that `offset + size <= memory_size`. The
    /// arithmetic is 64-bit, so no unsigned wraparound is possible.
    fn emit_address_check(&mut self, offset: u32, size: u8) {
        self.emit(&[0x89, 0xc0]); // movl %eax, %eax (zero-extend)
        if offset >= 0x8000_0000 {
            self.emit(&[0xba]); // movl $offset, %edx
            self.emit_u32(offset);
            self.emit(&[0x48, 0x01, 0xd0]); // addq %rdx, %rax
        } else if offset != 0 {
            self.emit(&[0x48, 0x05]); // addq $offset, %rax
            self.emit_u32(offset);
        }
        self.emit(&[0x48, 0x8d, 0x50, size]); // leaq size(%rax), %rdx
        self.emit(&[0x48, 0x3b, 0x57, CTX_MEMORY_SIZE]); // cmpq size(%rdi), %rdx
        self.emit(&[0x0f, 0x87]); // ja memory error
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.memory_error_handler);
    }

    fn emit_current_memory(&mut self) {
        self.emit(&[0x57]); // pushq %rdi
        self.emit(&[0x56]); // pushq %rsi
        self.emit_align_stack();
        self.emit(&[0x48, 0xb8]); // movabsq $current_memory, %rax
        self.emit_ptr(current_memory as usize);
        self.emit(&[0xff, 0xd0]); // callq *%rax
        self.emit_restore_stack();
        self.emit(&[0x5e]); // popq %rsi
        self.emit(&[0x5f]); // popq %rdi
        self.emit(&[0x48, 0x8b, 0x37]); // movq (%rdi), %rsi
        self.emit(&[0x50]); // pushq %rax
    }

    fn emit_grow_memory(&mut self) {
        self.emit(&[0x58]); // popq %rax (page delta)
        self.emit(&[0x57]); // pushq %rdi
        self.emit(&[0x56]); // pushq %rsi
        self.emit(&[0x89, 0xc6]); // movl %eax, %esi (second argument)
        self.emit_align_stack();
        self.emit(&[0x48, 0xb8]); // movabsq $grow_memory, %rax
        self.emit_ptr(grow_memory as usize);
        self.emit(&[0xff, 0xd0]); // callq *%rax
        self.emit_restore_stack();
        self.emit(&[0x5e]); // popq %rsi
        self.emit(&[0x5f]); // popq %rdi
        self.emit(&[0x48, 0x8b, 0x37]); // movq (%rdi), %rsi (base may have moved)
        self.emit(&[0x50]); // pushq %rax
    }

    // ---------------- integer helpers ----------------

    /// Binop template: pop rcx (top), pop rax, run the supplied opcode
    /// bytes (which include the final push).
    fn emit_int_binop(&mut self, state: &mut BodyState, op: &[u8]) {
        self.emit(&[0x59]); // popq %rcx
        self.emit(&[0x58]); // popq %rax
        self.emit(op);
        state.depth -= 1;
    }

    fn emit_i32_relop(&mut self, state: &mut BodyState, setcc: u8) {
        self.emit(&[0x58]); // popq %rax
        self.emit(&[0x59]); // popq %rcx
        self.emit(&[0x48, 0x31, 0xd2]); // xorq %rdx, %rdx
        self.emit(&[0x39, 0xc1]); // cmpl %eax, %ecx
        self.emit(&[0x0f, setcc, 0xc2]); // setcc %dl
        self.emit(&[0x52]); // pushq %rdx
        state.depth -= 1;
    }

    fn emit_i64_relop(&mut self, state: &mut BodyState, setcc: u8) {
        self.emit(&[0x58]);
        self.emit(&[0x59]);
        self.emit(&[0x48, 0x31, 0xd2]);
        self.emit(&[0x48, 0x39, 0xc1]); // cmpq %rax, %rcx
        self.emit(&[0x0f, setcc, 0xc2]);
        self.emit(&[0x52]);
        state.depth -= 1;
    }

    fn emit_div_guard_zero(&mut self, wide: bool) {
        if wide {
            self.emit(&[0x48, 0x85, 0xc9]); // testq %rcx, %rcx
        } else {
            self.emit(&[0x85, 0xc9]); // testl %ecx, %ecx
        }
        self.emit(&[0x0f, 0x84]); // jz arithmetic error
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.fpe_handler);
    }

    fn emit_i32_div_s(&mut self, state: &mut BodyState) {
        self.emit(&[0x59]); // popq %rcx (divisor)
        self.emit(&[0x58]); // popq %rax (dividend)
        self.emit_div_guard_zero(false);
        // INT_MIN / -1 overflows the machine divide.
        self.emit(&[0x83, 0xf9, 0xff]); // cmpl $-1, %ecx
        self.emit(&[0x0f, 0x85]); // jne DIV
        let div = self.emit_branch_target32();
        self.emit(&[0x3d]); // cmpl $0x80000000, %eax
        self.emit_u32(0x8000_0000);
        self.emit(&[0x0f, 0x84]); // je arithmetic error
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.fpe_handler);
        Self::fix_branch(div, self.code);
        self.emit(&[0x99]); // cdq
        self.emit(&[0xf7, 0xf9]); // idivl %ecx
        self.emit(&[0x50]); // pushq %rax
        state.depth -= 1;
    }

    fn emit_i32_div_u(&mut self, state: &mut BodyState) {
        self.emit(&[0x59]);
        self.emit(&[0x58]);
        self.emit_div_guard_zero(false);
        self.emit(&[0x31, 0xd2]); // xorl %edx, %edx
        self.emit(&[0xf7, 0xf1]); // divl %ecx
        self.emit(&[0x50]);
        state.depth -= 1;
    }

    fn emit_i32_rem_s(&mut self, state: &mut BodyState) {
        self.emit(&[0x59]);
        self.emit(&[0x58]);
        self.emit_div_guard_zero(false);
        // INT_MIN % -1 is 0, not a fault.
        self.emit(&[0x83, 0xf9, 0xff]); // cmpl $-1, %ecx
        self.emit(&[0x0f, 0x84]); // je MINUS1
        let minus1 = self.emit_branch_target32();
        self.emit(&[0x99]); // cdq
        self.emit(&[0xf7, 0xf9]); // idivl %ecx
        self.emit(&[0xe9]); // jmp END
        let end = self.emit_branch_target32();
        Self::fix_branch(minus1, self.code);
        self.emit(&[0x31, 0xd2]); // xorl %edx, %edx
        Self::fix_branch(end, self.code);
        self.emit(&[0x52]); // pushq %rdx
        state.depth -= 1;
    }

    fn emit_i32_rem_u(&mut self, state: &mut BodyState) {
        self.emit(&[0x59]);
        self.emit(&[0x58]);
        self.emit_div_guard_zero(false);
        self.emit(&[0x31, 0xd2]);
        self.emit(&[0xf7, 0xf1]);
        self.emit(&[0x52]); // pushq %rdx (remainder)
        state.depth -= 1;
    }

    fn emit_i64_div_s(&mut self, state: &mut BodyState) {
        self.emit(&[0x59]);
        self.emit(&[0x58]);
        self.emit_div_guard_zero(true);
        self.emit(&[0x48, 0x83, 0xf9, 0xff]); // cmpq $-1, %rcx
        self.emit(&[0x0f, 0x85]); // jne DIV
        let div = self.emit_branch_target32();
        self.emit(&[0x48, 0xba]); // movabsq $INT64_MIN, %rdx
        self.emit_u64(0x8000_0000_0000_0000);
        self.emit(&[0x48, 0x39, 0xd0]); // cmpq %rdx, %rax
        self.emit(&[0x0f, 0x84]); // je arithmetic error
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.fpe_handler);
        Self::fix_branch(div, self.code);
        self.emit(&[0x48, 0x99]); // cqo
        self.emit(&[0x48, 0xf7, 0xf9]); // idivq %rcx
        self.emit(&[0x50]);
        state.depth -= 1;
    }

    fn emit_i64_div_u(&mut self, state: &mut BodyState) {
        self.emit(&[0x59]);
        self.emit(&[0x58]);
        self.emit_div_guard_zero(true);
        self.emit(&[0x48, 0x31, 0xd2]); // xorq %rdx, %rdx
        self.emit(&[0x48, 0xf7, 0xf1]); // divq %rcx
        self.emit(&[0x50]);
        state.depth -= 1;
    }

    fn emit_i64_rem_s(&mut self, state: &mut BodyState) {
        self.emit(&[0x59]);
        self.emit(&[0x58]);
        self.emit_div_guard_zero(true);
        self.emit(&[0x48, 0x83, 0xf9, 0xff]); // cmpq $-1, %rcx
        self.emit(&[0x0f, 0x84]); // je MINUS1
        let minus1 = self.emit_branch_target32();
        self.emit(&[0x48, 0x99]); // cqo
        self.emit(&[0x48, 0xf7, 0xf9]); // idivq %rcx
        self.emit(&[0xe9]); // jmp END
        let end = self.emit_branch_target32();
        Self::fix_branch(minus1, self.code);
        self.emit(&[0x31, 0xd2]); // xorl %edx, %edx
        Self::fix_branch(end, self.code);
        self.emit(&[0x52]);
        state.depth -= 1;
    }

    fn emit_i64_rem_u(&mut self, state: &mut BodyState) {
        self.emit(&[0x59]);
        self.emit(&[0x58]);
        self.emit_div_guard_zero(true);
        self.emit(&[0x48, 0x31, 0xd2]);
        self.emit(&[0x48, 0xf7, 0xf1]);
        self.emit(&[0x52]);
        state.depth -= 1;
    }

    fn emit_i32_clz(&mut self) {
        if self.has_lzcnt {
            self.emit(&[0x58]);
            self.emit(&[0xf3, 0x0f, 0xbd, 0xc0]); // lzcntl %eax, %eax
            self.emit(&[0x50]);
        } else {
            self.emit(&[0x58]);
            self.emit(&[0xb9]); // movl $-1, %ecx
            self.emit_u32(0xffff_ffff);
            self.emit(&[0x0f, 0xbd, 0xc0]); // bsrl %eax, %eax
            self.emit(&[0x0f, 0x44, 0xc1]); // cmovzl %ecx, %eax
            self.emit(&[0x83, 0xe8, 0x1f]); // subl $31, %eax
            self.emit(&[0xf7, 0xd8]); // negl %eax
            self.emit(&[0x50]);
        }
    }

    fn emit_i32_ctz(&mut self) {
        if self.has_tzcnt {
            self.emit(&[0x58]);
            self.emit(&[0xf3, 0x0f, 0xbc, 0xc0]); // tzcntl %eax, %eax
            self.emit(&[0x50]);
        } else {
            self.emit(&[0x58]);
            self.emit(&[0xb9]); // movl $32, %ecx
            self.emit_u32(32);
            self.emit(&[0x0f, 0xbc, 0xc0]); // bsfl %eax, %eax
            self.emit(&[0x0f, 0x44, 0xc1]); // cmovzl %ecx, %eax
            self.emit(&[0x50]);
        }
    }

    fn emit_i64_clz(&mut self) {
        if self.has_lzcnt {
            self.emit(&[0x58]);
            self.emit(&[0xf3, 0x48, 0x0f, 0xbd, 0xc0]); // lzcntq %rax, %rax
            self.emit(&[0x50]);
        } else {
            self.emit(&[0x58]);
            self.emit(&[0x48, 0xc7, 0xc1]); // movq $-1, %rcx
            self.emit_u32(0xffff_ffff);
            self.emit(&[0x48, 0x0f, 0xbd, 0xc0]); // bsrq %rax, %rax
            self.emit(&[0x48, 0x0f, 0x44, 0xc1]); // cmovzq %rcx, %rax
            self.emit(&[0x48, 0x83, 0xe8, 0x3f]); // subq $63, %rax
            self.emit(&[0x48, 0xf7, 0xd8]); // negq %rax
            self.emit(&[0x50]);
        }
    }

    fn emit_i64_ctz(&mut self) {
        if self.has_tzcnt {
            self.emit(&[0x58]);
            self.emit(&[0xf3, 0x48, 0x0f, 0xbc, 0xc0]); // tzcntq %rax, %rax
            self.emit(&[0x50]);
        } else {
            self.emit(&[0x58]);
            self.emit(&[0x48, 0xc7, 0xc1]); // movq $64, %rcx
            self.emit_u32(64);
            self.emit(&[0x48, 0x0f, 0xbc, 0xc0]); // bsfq %rax, %rax
            self.emit(&[0x48, 0x0f, 0x44, 0xc1]); // cmovzq %rcx, %rax
            self.emit(&[0x50]);
        }
    }

    fn emit_unreachable(&mut self) {
        self.emit(&[0xc7, 0x47, CTX_TRAP]); // movl $kind, trap(%rdi)
        self.emit_u32(TRAP_UNREACHABLE);
        self.emit(&[0x48, 0x8b, 0x67, CTX_SAVED_STACK]); // movq saved(%rdi), %rsp
        self.emit(&[0xe9]); // jmp exit
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.exit_label);
    }

    // ---------------- float helpers ----------------

    fn emit_f32_round(&mut self, mode: u8) {
        self.emit(&[0x66, 0x0f, 0x3a, 0x0a, 0x04, 0x24, mode]); // roundss $mode, (%rsp), %xmm0
        self.emit(&[0xf3, 0x0f, 0x11, 0x04, 0x24]); // movss %xmm0, (%rsp)
    }

    fn emit_f64_round(&mut self, mode: u8) {
        self.emit(&[0x66, 0x0f, 0x3a, 0x0b, 0x04, 0x24, mode]); // roundsd $mode, (%rsp), %xmm0
        self.emit(&[0xf2, 0x0f, 0x11, 0x04, 0x24]); // movsd %xmm0, (%rsp)
    }

    fn emit_f32_binop(&mut self, state: &mut BodyState, op: u8) {
        self.emit(&[0xf3, 0x0f, 0x10, 0x44, 0x24, 0x08]); // movss 8(%rsp), %xmm0
        self.emit(&[0xf3, 0x0f, op, 0x04, 0x24]); // OPss (%rsp), %xmm0
        self.emit(&[0x48, 0x8d, 0x64, 0x24, 0x08]); // leaq 8(%rsp), %rsp
        self.emit(&[0xf3, 0x0f, 0x11, 0x04, 0x24]); // movss %xmm0, (%rsp)
        state.depth -= 1;
    }

    fn emit_f64_binop(&mut self, state: &mut BodyState, op: u8) {
        self.emit(&[0xf2, 0x0f, 0x10, 0x44, 0x24, 0x08]); // movsd 8(%rsp), %xmm0
        self.emit(&[0xf2, 0x0f, op, 0x04, 0x24]); // OPsd (%rsp), %xmm0
        self.emit(&[0x48, 0x8d, 0x64, 0x24, 0x08]); // leaq 8(%rsp), %rsp
        self.emit(&[0xf2, 0x0f, 0x11, 0x04, 0x24]); // movsd %xmm0, (%rsp)
        state.depth -= 1;
    }

    fn emit_f32_relop(&mut self, state: &mut BodyState, predicate: u8, switched: bool, flipped: bool) {
        if switched {
            self.emit(&[0xf3, 0x0f, 0x10, 0x04, 0x24]); // movss (%rsp), %xmm0
            self.emit(&[0xf3, 0x0f, 0xc2, 0x44, 0x24, 0x08, predicate]); // cmpPs 8(%rsp)
        } else {
            self.emit(&[0xf3, 0x0f, 0x10, 0x44, 0x24, 0x08]); // movss 8(%rsp), %xmm0
            self.emit(&[0xf3, 0x0f, 0xc2, 0x04, 0x24, predicate]); // cmpPs (%rsp)
        }
        self.emit(&[0x66, 0x0f, 0x7e, 0xc0]); // movd %xmm0, %eax
        if flipped {
            self.emit(&[0xff, 0xc0]); // incl %eax: {-1,0} -> {0,1}
        } else {
            self.emit(&[0x83, 0xe0, 0x01]); // andl $1, %eax
        }
        self.emit(&[0x48, 0x8d, 0x64, 0x24, 0x10]); // leaq 16(%rsp), %rsp
        self.emit(&[0x50]); // pushq %rax
        state.depth -= 1;
    }

    fn emit_f64_relop(&mut self, state: &mut BodyState, predicate: u8, switched: bool, flipped: bool) {
        if switched {
            self.emit(&[0xf2, 0x0f, 0x10, 0x04, 0x24]); // movsd (%rsp), %xmm0
            self.emit(&[0xf2, 0x0f, 0xc2, 0x44, 0x24, 0x08, predicate]);
        } else {
            self.emit(&[0xf2, 0x0f, 0x10, 0x44, 0x24, 0x08]); // movsd 8(%rsp), %xmm0
            self.emit(&[0xf2, 0x0f, 0xc2, 0x04, 0x24, predicate]);
        }
        self.emit(&[0x66, 0x0f, 0x7e, 0xc0]); // movd %xmm0, %eax
        if flipped {
            self.emit(&[0xff, 0xc0]);
        } else {
            self.emit(&[0x83, 0xe0, 0x01]);
        }
        self.emit(&[0x48, 0x8d, 0x64, 0x24, 0x10]);
        self.emit(&[0x50]);
        state.depth -= 1;
    }

    /// `min`/`max` with the two Wasm quirks the plain SSE instructions
    /// miss: an unordered compare first (either operand NaN produces the
    /// canonical NaN), then an operand-order switch keyed on the raw
    /// bits of the top value so signed zeros order correctly.
    fn emit_f32_min_max(&mut self, state: &mut BodyState, is_min: bool) {
        let op: u8 = if is_min { 0x5d } else { 0x5f };
        self.emit(&[0xf3, 0x0f, 0x10, 0x44, 0x24, 0x08]); // movss 8(%rsp), %xmm0
        self.emit(&[0x0f, 0x2e, 0x04, 0x24]); // ucomiss (%rsp), %xmm0
        self.emit(&[0x0f, 0x8b]); // jnp ORDERED
        let ordered = self.emit_branch_target32();
        self.emit(&[0xb8]); // movl $canonical_nan, %eax
        self.emit_u32(0x7fc0_0000);
        self.emit(&[0x48, 0x83, 0xc4, 0x08]); // addq $8, %rsp
        self.emit(&[0x89, 0x04, 0x24]); // movl %eax, (%rsp)
        self.emit(&[0xe9]); // jmp DONE
        let done_nan = self.emit_branch_target32();
        Self::fix_branch(ordered, self.code);

        self.emit(&[0x8b, 0x04, 0x24]); // movl (%rsp), %eax
        self.emit(&[0x85, 0xc0]); // testl %eax, %eax
        self.emit(&[0x0f, 0x84]); // je ZERO
        let zero = self.emit_branch_target32();
        if is_min {
            self.emit(&[0xf3, 0x0f, 0x10, 0x44, 0x24, 0x08]); // movss 8(%rsp), %xmm0
            self.emit(&[0xf3, 0x0f, op, 0x04, 0x24]); // minss (%rsp), %xmm0
        } else {
            self.emit(&[0xf3, 0x0f, 0x10, 0x04, 0x24]); // movss (%rsp), %xmm0
            self.emit(&[0xf3, 0x0f, op, 0x44, 0x24, 0x08]); // maxss 8(%rsp), %xmm0
        }
        self.emit(&[0xe9]); // jmp DONE
        let done = self.emit_branch_target32();
        Self::fix_branch(zero, self.code);
        if is_min {
            self.emit(&[0xf3, 0x0f, 0x10, 0x04, 0x24]); // movss (%rsp), %xmm0
            self.emit(&[0xf3, 0x0f, op, 0x44, 0x24, 0x08]); // minss 8(%rsp), %xmm0
        } else {
            self.emit(&[0xf3, 0x0f, 0x10, 0x44, 0x24, 0x08]); // movss 8(%rsp), %xmm0
            self.emit(&[0xf3, 0x0f, op, 0x04, 0x24]); // maxss (%rsp), %xmm0
        }
        Self::fix_branch(done, self.code);
        self.emit(&[0x48, 0x83, 0xc4, 0x08]); // addq $8, %rsp
        self.emit(&[0xf3, 0x0f, 0x11, 0x04, 0x24]); // movss %xmm0, (%rsp)
        Self::fix_branch(done_nan, self.code);
        state.depth -= 1;
    }

    fn emit_f64_min_max(&mut self, state: &mut BodyState, is_min: bool) {
        let op: u8 = if is_min { 0x5d } else { 0x5f };
        self.emit(&[0xf2, 0x0f, 0x10, 0x44, 0x24, 0x08]); // movsd 8(%rsp), %xmm0
        self.emit(&[0x66, 0x0f, 0x2e, 0x04, 0x24]); // ucomisd (%rsp), %xmm0
        self.emit(&[0x0f, 0x8b]); // jnp ORDERED
        let ordered = self.emit_branch_target32();
        self.emit(&[0x48, 0xb8]); // movabsq $canonical_nan, %rax
        self.emit_u64(0x7ff8_0000_0000_0000);
        self.emit(&[0x48, 0x83, 0xc4, 0x08]); // addq $8, %rsp
        self.emit(&[0x48, 0x89, 0x04, 0x24]); // movq %rax, (%rsp)
        self.emit(&[0xe9]); // jmp DONE
        let done_nan = self.emit_branch_target32();
        Self::fix_branch(ordered, self.code);

        self.emit(&[0x48, 0x8b, 0x04, 0x24]); // movq (%rsp), %rax
        self.emit(&[0x48, 0x85, 0xc0]); // testq %rax, %rax
        self.emit(&[0x0f, 0x84]); // je ZERO
        let zero = self.emit_branch_target32();
        if is_min {
            self.emit(&[0xf2, 0x0f, 0x10, 0x44, 0x24, 0x08]); // movsd 8(%rsp), %xmm0
            self.emit(&[0xf2, 0x0f, op, 0x04, 0x24]); // minsd (%rsp), %xmm0
        } else {
            self.emit(&[0xf2, 0x0f, 0x10, 0x04, 0x24]); // movsd (%rsp), %xmm0
            self.emit(&[0xf2, 0x0f, op, 0x44, 0x24, 0x08]); // maxsd 8(%rsp), %xmm0
        }
        self.emit(&[0xe9]); // jmp DONE
        let done = self.emit_branch_target32();
        Self::fix_branch(zero, self.code);
        if is_min {
            self.emit(&[0xf2, 0x0f, 0x10, 0x04, 0x24]); // movsd (%rsp), %xmm0
            self.emit(&[0xf2, 0x0f, op, 0x44, 0x24, 0x08]); // minsd 8(%rsp), %xmm0
        } else {
            self.emit(&[0xf2, 0x0f, 0x10, 0x44, 0x24, 0x08]); // movsd 8(%rsp), %xmm0
            self.emit(&[0xf2, 0x0f, op, 0x04, 0x24]); // maxsd (%rsp), %xmm0
        }
        Self::fix_branch(done, self.code);
        self.emit(&[0x48, 0x83, 0xc4, 0x08]); // addq $8, %rsp
        self.emit(&[0xf2, 0x0f, 0x11, 0x04, 0x24]); // movsd %xmm0, (%rsp)
        Self::fix_branch(done_nan, self.code);
        state.depth -= 1;
    }

    /// Run a float-to-int conversion under a saved/restored control
    /// word; any invalid-operation signal becomes an arithmetic trap.
    /// The conversion opcode must address its operand at 8(%rsp) when it
    /// reads the value stack, because the control-word save occupies the
    /// top slot.
    fn emit_f2i(&mut self, op: &[u8]) {
        self.emit(&[0xb8, 0x80, 0x1f, 0x00, 0x00]); // movl $0x1f80, %eax
        self.emit(&[0x50]); // pushq %rax
        self.emit(&[0x0f, 0xae, 0x14, 0x24]); // ldmxcsr (%rsp)
        self.emit(op);
        self.emit(&[0x0f, 0xae, 0x1c, 0x24]); // stmxcsr (%rsp)
        self.emit(&[0x59]); // popq %rcx
        self.emit(&[0xf6, 0xc1, 0x01]); // testb $1, %cl (invalid op)
        self.emit(&[0x0f, 0x85]); // jnz arithmetic error
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.fpe_handler);
    }

    fn emit_i64_trunc_u_f32(&mut self) {
        // Values >= 2^63 need the subtract-and-set-sign dance; the sign
        // of the unadjusted conversion picks the path.
        self.emit(&[0xb8]); // movl $0x5f000000 (2^63 as f32), %eax
        self.emit_u32(0x5f00_0000);
        self.emit(&[0xf3, 0x0f, 0x10, 0x04, 0x24]); // movss (%rsp), %xmm0
        self.emit(&[0x89, 0x04, 0x24]); // movl %eax, (%rsp)
        self.emit(&[0xf3, 0x0f, 0x10, 0x0c, 0x24]); // movss (%rsp), %xmm1
        self.emit(&[0x0f, 0x28, 0xd0]); // movaps %xmm0, %xmm2
        self.emit(&[0xf3, 0x0f, 0x5c, 0xd1]); // subss %xmm1, %xmm2
        self.emit_f2i(&[0xf3, 0x48, 0x0f, 0x2c, 0xc2]); // cvttss2siq %xmm2, %rax
        self.emit(&[0x48, 0xb9]); // movabsq $0x8000000000000000, %rcx
        self.emit_u64(0x8000_0000_0000_0000);
        self.emit(&[0x48, 0x31, 0xc1]); // xorq %rax, %rcx
        self.emit(&[0xf3, 0x48, 0x0f, 0x2c, 0xc0]); // cvttss2siq %xmm0, %rax
        self.emit(&[0x48, 0x31, 0xd2]); // xorq %rdx, %rdx
        self.emit(&[0x0f, 0x2e, 0xc8]); // ucomiss %xmm0, %xmm1
        self.emit(&[0x48, 0x0f, 0x47, 0xd0]); // cmovaq %rax, %rdx
        self.emit(&[0x48, 0x0f, 0x46, 0xc1]); // cmovbeq %rcx, %rax
        self.emit(&[0x48, 0x89, 0x04, 0x24]); // movq %rax, (%rsp)
        self.emit(&[0x48, 0x0f, 0xba, 0xe2, 0x3f]); // btq $63, %rdx
        self.emit(&[0x0f, 0x82]); // jc arithmetic error
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.fpe_handler);
    }

    fn emit_i64_trunc_u_f64(&mut self) {
        self.emit(&[0x48, 0xb8]); // movabsq $0x43e0000000000000 (2^63), %rax
        self.emit_u64(0x43e0_0000_0000_0000);
        self.emit(&[0xf2, 0x0f, 0x10, 0x04, 0x24]); // movsd (%rsp), %xmm0
        self.emit(&[0x48, 0x89, 0x04, 0x24]); // movq %rax, (%rsp)
        self.emit(&[0xf2, 0x0f, 0x10, 0x0c, 0x24]); // movsd (%rsp), %xmm1
        self.emit(&[0x66, 0x0f, 0x28, 0xd0]); // movapd %xmm0, %xmm2
        self.emit(&[0xf2, 0x0f, 0x5c, 0xd1]); // subsd %xmm1, %xmm2
        self.emit_f2i(&[0xf2, 0x48, 0x0f, 0x2c, 0xc2]); // cvttsd2siq %xmm2, %rax
        self.emit(&[0x48, 0xb9]); // movabsq $0x8000000000000000, %rcx
        self.emit_u64(0x8000_0000_0000_0000);
        self.emit(&[0x48, 0x31, 0xc1]); // xorq %rax, %rcx
        self.emit(&[0xf2, 0x48, 0x0f, 0x2c, 0xc0]); // cvttsd2siq %xmm0, %rax
        self.emit(&[0x48, 0x31, 0xd2]); // xorq %rdx, %rdx
        self.emit(&[0x66, 0x0f, 0x2e, 0xc8]); // ucomisd %xmm0, %xmm1
        self.emit(&[0x48, 0x0f, 0x47, 0xd0]); // cmovaq %rax, %rdx
        self.emit(&[0x48, 0x0f, 0x46, 0xc1]); // cmovbeq %rcx, %rax
        self.emit(&[0x48, 0x89, 0x04, 0x24]); // movq %rax, (%rsp)
        self.emit(&[0x48, 0x0f, 0xba, 0xe2, 0x3f]); // btq $63, %rdx
        self.emit(&[0x0f, 0x82]); // jc arithmetic error
        let site = self.emit_branch_target32();
        Self::fix_branch(site, self.fpe_handler);
    }

    fn emit_f32_convert_u_i64(&mut self) {
        self.emit(&[0x48, 0x8b, 0x04, 0x24]); // movq (%rsp), %rax
        self.emit(&[0x48, 0x85, 0xc0]); // testq %rax, %rax
        self.emit(&[0x0f, 0x88]); // js LARGE
        let large = self.emit_branch_target32();
        self.emit(&[0xf3, 0x48, 0x0f, 0x2a, 0xc0]); // cvtsi2ssq %rax, %xmm0
        self.emit(&[0xe9]); // jmp DONE
        let done = self.emit_branch_target32();
        Self::fix_branch(large, self.code);
        // Halve with sticky low bit, convert, double: correctly rounded
        // for the high range.
        self.emit(&[0x48, 0x89, 0xc1]); // movq %rax, %rcx
        self.emit(&[0x48, 0xd1, 0xe8]); // shrq %rax
        self.emit(&[0x83, 0xe1, 0x01]); // andl $1, %ecx
        self.emit(&[0x48, 0x09, 0xc8]); // orq %rcx, %rax
        self.emit(&[0xf3, 0x48, 0x0f, 0x2a, 0xc0]); // cvtsi2ssq %rax, %xmm0
        self.emit(&[0xf3, 0x0f, 0x58, 0xc0]); // addss %xmm0, %xmm0
        Self::fix_branch(done, self.code);
        self.emit(&[0x31, 0xc0]); // xorl %eax, %eax
        self.emit(&[0x89, 0x44, 0x24, 0x04]); // movl %eax, 4(%rsp)
        self.emit(&[0xf3, 0x0f, 0x11, 0x04, 0x24]); // movss %xmm0, (%rsp)
    }

    fn emit_f64_convert_u_i64(&mut self) {
        self.emit(&[0x48, 0x8b, 0x04, 0x24]); // movq (%rsp), %rax
        self.emit(&[0x48, 0x85, 0xc0]); // testq %rax, %rax
        self.emit(&[0x0f, 0x88]); // js LARGE
        let large = self.emit_branch_target32();
        self.emit(&[0xf2, 0x48, 0x0f, 0x2a, 0xc0]); // cvtsi2sdq %rax, %xmm0
        self.emit(&[0xe9]); // jmp DONE
        let done = self.emit_branch_target32();
        Self::fix_branch(large, self.code);
        self.emit(&[0x48, 0x89, 0xc1]); // movq %rax, %rcx
        self.emit(&[0x48, 0xd1, 0xe8]); // shrq %rax
        self.emit(&[0x83, 0xe1, 0x01]); // andl $1, %ecx
        self.emit(&[0x48, 0x09, 0xc8]); // orq %rcx, %rax
        self.emit(&[0xf2, 0x48, 0x0f, 0x2a, 0xc0]); // cvtsi2sdq %rax, %xmm0
        self.emit(&[0xf2, 0x0f, 0x58, 0xc0]); // addsd %xmm0, %xmm0
        Self::fix_branch(done, self.code);
        self.emit(&[0xf2, 0x0f, 0x11, 0x04, 0x24]); // movsd %xmm0, (%rsp)
    }

    // ---------------- finalization ----------------

    /// Seal the segment and hand back the arena plus the resolved entry
    /// addresses (imports first, then internals).
    pub(crate) fn finish(mut self) -> Result<(CodeArena, *const u8, Vec<*const u8>), VmError> {
        let mut entries = Vec::with_capacity(self.relocations.len());
        for (index, reloc) in self.relocations.iter().enumerate() {
            match reloc {
                FuncReloc::Resolved(addr) => entries.push(*addr as *const u8),
                FuncReloc::Pending(sites) if sites.is_empty() => {
                    // Declared but never emitted: only possible for a
                    // module whose code section is missing bodies, which
                    // validation rejects.
                    return Err(VmError::InternalError(format!(
                        "function {index} was never emitted"
                    )));
                }
                FuncReloc::Pending(_) => {
                    return Err(VmError::InternalError(format!(
                        "unresolved call sites into function {index}"
                    )));
                }
            }
        }
        let segment = self.segment.take().expect("segment already sealed");
        self.arena.end_code(segment, true);
        Ok((self.arena, self.entry_thunk, entries))
    }
}
