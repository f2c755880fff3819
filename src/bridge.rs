//! The bridge between JITted code and host callbacks.
//!
//! JITted code addresses the leading fields of [`VmContext`] by fixed
//! byte offsets (the "context header"): the pinned memory-base register
//! is reloaded from it after every host upcall, error trampolines store
//! their trap kind into it, and the non-local exit path restores the
//! stack pointer recorded in it at entry. Everything after the header is
//! ordinary Rust state for the current invocation.
//!
//! Host callbacks never unwind across a JIT frame: the central shim
//! catches panics and typed errors, parks them in the context as the
//! pending outcome, and reports a trap flag that the emitted thunk turns
//! into a jump through the unwind stub.

use crate::error::VmError;
use crate::memory::LinearMemory;
use crate::module::{FuncSig, ModuleInfo};
use indexmap::IndexMap;
use std::panic::{self, AssertUnwindSafe};

/// Byte offsets of the context header, hard-coded into emitted code.
/// `VmContext` is `repr(C)`; a unit test pins these down.
pub(crate) const CTX_MEMORY_BASE: u8 = 0x00;
pub(crate) const CTX_MEMORY_SIZE: u8 = 0x08;
pub(crate) const CTX_SAVED_STACK: u8 = 0x10;
pub(crate) const CTX_TRAP: u8 = 0x18;

/// Trap codes written by the error trampolines. Zero means "no trap".
pub(crate) const TRAP_NONE: u32 = 0;
pub(crate) const TRAP_UNREACHABLE: u32 = 1;
pub(crate) const TRAP_ARITHMETIC: u32 = 2;
pub(crate) const TRAP_INDIRECT_OOB: u32 = 3;
pub(crate) const TRAP_INDIRECT_TYPE: u32 = 4;
pub(crate) const TRAP_STACK_OVERFLOW: u32 = 5;
pub(crate) const TRAP_MEMORY_OOB: u32 = 6;

/// Handler for one host function. Arguments arrive on the Wasm value
/// stack; results are returned widened to 64 bits.
pub type HostHandler = fn(&mut VmContext, &HostArgs) -> Result<u64, VmError>;

/// One registered host function: its Wasm signature and handler.
#[derive(Clone)]
pub struct HostFunction {
    pub sig: FuncSig,
    pub handler: HostHandler,
}

/// Registry of host functions keyed by `(module, field)`.
///
/// Populated once when the engine is built and read-only afterwards;
/// imports are resolved against it at module-translation time.
#[derive(Default)]
pub struct HostRegistry {
    functions: IndexMap<(String, String), HostFunction>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        module: &str,
        field: &str,
        sig: FuncSig,
        handler: HostHandler,
    ) {
        let prev = self.functions.insert(
            (module.to_string(), field.to_string()),
            HostFunction { sig, handler },
        );
        assert!(
            prev.is_none(),
            "host function {module}.{field} registered twice"
        );
    }

    pub fn lookup(&self, module: &str, field: &str) -> Option<&HostFunction> {
        // IndexMap requires an owned tuple key for the borrowed form of
        // a pair; a scan is fine at this registry size.
        self.functions
            .iter()
            .find(|((m, f), _)| m.as_str() == module && f.as_str() == field)
            .map(|(_, func)| func)
    }

    /// Resolve every import of `module` against the registry. Both the
    /// name and the declared signature must match.
    pub fn resolve(&self, module: &ModuleInfo) -> Result<Vec<ResolvedImport>, VmError> {
        let mut resolved = Vec::with_capacity(module.imports.len());
        for import in &module.imports {
            let func = self.lookup(&import.module, &import.field).ok_or_else(|| {
                VmError::ContractValidationFailure(format!(
                    "unresolved import {}.{}",
                    import.module, import.field
                ))
            })?;
            let declared = &module.types[import.type_index as usize];
            if *declared != func.sig {
                return Err(VmError::ContractValidationFailure(format!(
                    "import {}.{} signature mismatch",
                    import.module, import.field
                )));
            }
            resolved.push(ResolvedImport {
                arity: func.sig.params.len(),
                has_result: func.sig.result.is_some(),
                handler: func.handler,
            });
        }
        Ok(resolved)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// A linked import, indexed by import order.
#[derive(Copy, Clone)]
pub struct ResolvedImport {
    pub arity: usize,
    pub has_result: bool,
    pub handler: HostHandler,
}

/// View of the Wasm arguments of one host call.
///
/// The import thunk passes a pointer to the top of the value stack;
/// arguments were pushed left to right, so the first argument sits
/// deepest.
pub struct HostArgs {
    base: *const u64,
    count: usize,
}

impl HostArgs {
    pub fn get(&self, index: usize) -> u64 {
        assert!(index < self.count);
        unsafe { *self.base.add(self.count - 1 - index) }
    }

    pub fn as_i32(&self, index: usize) -> u32 {
        self.get(index) as u32
    }

    pub fn as_i64(&self, index: usize) -> i64 {
        self.get(index) as i64
    }
}

/// The host-state object passed to JITted code in the first argument
/// register.
///
/// The leading raw fields form the JIT-visible header; their offsets are
/// the `CTX_*` constants above. The remaining fields are only touched
/// from Rust.
#[repr(C)]
pub struct VmContext {
    pub(crate) memory_base: *mut u8,
    pub(crate) memory_size: u64,
    pub(crate) saved_stack: *mut u8,
    pub(crate) trap: u32,
    _reserved: u32,

    memory: *mut LinearMemory,
    imports: *const ResolvedImport,
    imports_len: usize,
    pub(crate) eei: crate::eei::EthereumInterface,
    pub(crate) pending: Option<VmError>,
}

impl VmContext {
    /// Wire up a context for one invocation. The memory and import table
    /// must outlive every entry into JITted code made with this context.
    pub(crate) fn new(
        memory: &mut LinearMemory,
        imports: &[ResolvedImport],
        eei: crate::eei::EthereumInterface,
    ) -> Self {
        Self {
            memory_base: memory.base(),
            memory_size: memory.size() as u64,
            saved_stack: std::ptr::null_mut(),
            trap: TRAP_NONE,
            _reserved: 0,
            memory: memory as *mut LinearMemory,
            imports: imports.as_ptr(),
            imports_len: imports.len(),
            eei,
            pending: None,
        }
    }

    pub(crate) fn memory(&mut self) -> &mut LinearMemory {
        unsafe { &mut *self.memory }
    }

    /// The pending host outcome, taken by the executor after JIT exit.
    pub(crate) fn take_pending(&mut self) -> Option<VmError> {
        self.pending.take()
    }
}

/// Value/flag pair returned to the import thunk: the result lands in the
/// accumulator, the trap flag in the second return register.
#[repr(C)]
pub struct HostCallResult {
    pub value: u64,
    pub unwound: u64,
}

/// Central dispatch target of every import thunk.
///
/// Calling convention (System V): `ctx` in the first argument register,
/// `stack` pointing at the top of the Wasm value stack, `idx` the import
/// index. A non-zero `unwound` flag tells the thunk to leave through the
/// unwind stub instead of returning to its caller.
pub(crate) extern "C" fn call_host_function(
    ctx: *mut VmContext,
    stack: *mut u64,
    idx: u32,
) -> HostCallResult {
    let ctx = unsafe { &mut *ctx };
    debug_assert!((idx as usize) < ctx.imports_len);
    let import = unsafe { *ctx.imports.add(idx as usize) };
    let args = HostArgs {
        base: stack,
        count: import.arity,
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| (import.handler)(&mut *ctx, &args)));
    match outcome {
        Ok(Ok(value)) => HostCallResult { value, unwound: 0 },
        Ok(Err(err)) => {
            ctx.pending = Some(err);
            HostCallResult {
                value: 0,
                unwound: 1,
            }
        }
        Err(_) => {
            ctx.pending = Some(VmError::InternalError(
                "host function panicked".to_string(),
            ));
            HostCallResult {
                value: 0,
                unwound: 1,
            }
        }
    }
}

/// `memory.size` upcall: the linear-memory allocator's view of the page
/// count is authoritative.
pub(crate) extern "C" fn current_memory(ctx: *mut VmContext) -> u64 {
    let ctx = unsafe { &mut *ctx };
    ctx.memory().pages() as u64
}

/// `memory.grow` upcall. Returns the previous page count, or -1 (as an
/// i32) on failure. Refreshes the context header so the thunk's reload
/// re-pins the (possibly re-committed) base and new size.
pub(crate) extern "C" fn grow_memory(ctx: *mut VmContext, pages: u32) -> u64 {
    let ctx = unsafe { &mut *ctx };
    match ctx.memory().grow(pages) {
        Some(old_pages) => {
            let (base, size) = {
                let memory = ctx.memory();
                (memory.base(), memory.size())
            };
            ctx.memory_base = base;
            ctx.memory_size = size as u64;
            old_pages as u64
        }
        None => u32::MAX as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ValType;
    use std::mem::offset_of;

    #[test]
    fn context_header_offsets() {
        assert_eq!(offset_of!(VmContext, memory_base), CTX_MEMORY_BASE as usize);
        assert_eq!(offset_of!(VmContext, memory_size), CTX_MEMORY_SIZE as usize);
        assert_eq!(offset_of!(VmContext, saved_stack), CTX_SAVED_STACK as usize);
        assert_eq!(offset_of!(VmContext, trap), CTX_TRAP as usize);
    }

    #[test]
    fn host_args_are_read_deepest_first() {
        // Stack grows down: the last-pushed argument has the lowest
        // address. Simulate [first, second] pushed in order.
        let slots = [7u64, 42u64]; // slots[0] = top of stack = second arg
        let args = HostArgs {
            base: slots.as_ptr(),
            count: 2,
        };
        assert_eq!(args.get(0), 42);
        assert_eq!(args.get(1), 7);
    }

    #[test]
    fn registry_rejects_signature_mismatch() {
        fn nop(_: &mut VmContext, _: &HostArgs) -> Result<u64, VmError> {
            Ok(0)
        }
        let mut registry = HostRegistry::new();
        registry.register(
            "ethereum",
            "useGas",
            FuncSig::new(vec![ValType::I64], None),
            nop,
        );

        let mut module = ModuleInfo::default();
        module.types = vec![FuncSig::new(vec![ValType::I32], None)];
        module.type_tokens = ModuleInfo::dedupe_types(&module.types);
        module.imports = vec![crate::module::ImportedFunc {
            module: "ethereum".to_string(),
            field: "useGas".to_string(),
            type_index: 0,
        }];
        assert!(matches!(
            registry.resolve(&module),
            Err(VmError::ContractValidationFailure(_))
        ));
    }
}
