//! Engine backends and the per-invocation executor.
//!
//! [`WasmEngine`] is the boundary the VM layer drives: one call per
//! contract invocation, a uniform [`ExecutionResult`] out. The JIT
//! engine compiles on first use, caches the sealed artifact per
//! destination address, and re-instantiates memory and globals for
//! every invocation.

use crate::bridge::{
    HostRegistry, VmContext, TRAP_ARITHMETIC, TRAP_INDIRECT_OOB, TRAP_INDIRECT_TYPE,
    TRAP_MEMORY_OOB, TRAP_NONE, TRAP_STACK_OVERFLOW, TRAP_UNREACHABLE,
};
use crate::eei::{register_eei, EthereumInterface};
use crate::error::{ExecutionResult, StatusCode, TrapKind, VmError};
use crate::host::{Address, HostInterface, Message};
use crate::memory::LinearMemory;
use crate::module::{ConstValue, ExportKind};
use crate::translate::{self, CompiledContract};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Maximum depth of nested JITted frames per invocation.
const CALL_DEPTH_LIMIT: u32 = 1024;

static BENCHMARKING: AtomicBool = AtomicBool::new(false);

/// Fence instantiation and execution timings into the log.
pub fn enable_benchmarking() {
    BENCHMARKING.store(true, Ordering::Relaxed);
}

fn benchmarking() -> bool {
    BENCHMARKING.load(Ordering::Relaxed)
}

/// One registered Wasm execution backend.
pub trait WasmEngine {
    /// Execute `code` under `msg`. `state_code` is the bytecode
    /// residing in state, used by `codeCopy` and friends even when the
    /// executable code was substituted.
    fn execute(
        &mut self,
        host: &mut dyn HostInterface,
        code: &[u8],
        state_code: &[u8],
        msg: &Message,
        meter_gas: bool,
    ) -> ExecutionResult;
}

/// Instantiate a backend by name. `"jit"` is the only backend built
/// into this crate.
pub fn create_engine(name: &str) -> Option<Box<dyn WasmEngine>> {
    match name {
        "jit" => Some(Box::new(JitEngine::new())),
        _ => None,
    }
}

pub(crate) fn has_wasm_preamble(code: &[u8]) -> bool {
    code.len() >= 8 && code[..4] == *b"\0asm"
}

pub(crate) fn wasm_version(code: &[u8]) -> Option<u32> {
    if code.len() < 8 {
        return None;
    }
    Some(u32::from_le_bytes([code[4], code[5], code[6], code[7]]))
}

fn trap_error(code: u32) -> Option<VmError> {
    let kind = match code {
        TRAP_NONE => return None,
        TRAP_UNREACHABLE => TrapKind::Unreachable,
        TRAP_ARITHMETIC => TrapKind::Arithmetic,
        TRAP_INDIRECT_OOB => TrapKind::CallIndirectOutOfRange,
        TRAP_INDIRECT_TYPE => TrapKind::CallIndirectTypeMismatch,
        TRAP_STACK_OVERFLOW => TrapKind::StackOverflow,
        TRAP_MEMORY_OOB => TrapKind::MemoryOutOfBounds,
        other => {
            return Some(VmError::InternalError(format!(
                "unknown trap code {other}"
            )))
        }
    };
    Some(VmError::Trap(kind))
}

struct CacheEntry {
    code: Vec<u8>,
    contract: CompiledContract,
}

/// The JIT backend.
pub struct JitEngine {
    registry: HostRegistry,
    cache: HashMap<Address, CacheEntry>,
}

impl JitEngine {
    pub fn new() -> Self {
        let mut registry = HostRegistry::new();
        register_eei(&mut registry);
        Self {
            registry,
            cache: HashMap::new(),
        }
    }

    /// Fetch or build the compiled artifact for `destination`. A cache
    /// hit is honoured only when the bytecode is identical, which also
    /// covers preload overrides.
    fn contract_for(
        &mut self,
        destination: Address,
        code: &[u8],
    ) -> Result<&CompiledContract, VmError> {
        use std::collections::hash_map::Entry;
        let registry = &self.registry;
        match self.cache.entry(destination) {
            Entry::Occupied(occupied) => {
                let slot = occupied.into_mut();
                if slot.code != code {
                    log::debug!("cached module is stale, recompiling");
                    *slot = CacheEntry {
                        code: code.to_vec(),
                        contract: translate::compile(code, registry)?,
                    };
                }
                Ok(&slot.contract)
            }
            Entry::Vacant(vacant) => {
                let built = CacheEntry {
                    code: code.to_vec(),
                    contract: translate::compile(code, registry)?,
                };
                Ok(&vacant.insert(built).contract)
            }
        }
    }

    fn run(
        &mut self,
        host: &mut dyn HostInterface,
        code: &[u8],
        state_code: &[u8],
        msg: &Message,
        meter_gas: bool,
    ) -> Result<ExecutionResult, VmError> {
        if !has_wasm_preamble(code) {
            return Err(VmError::ContractValidationFailure(
                "missing WebAssembly preamble".to_string(),
            ));
        }
        if wasm_version(code) != Some(1) {
            return Err(VmError::ContractValidationFailure(
                "unsupported WebAssembly version".to_string(),
            ));
        }

        let instantiation_started = Instant::now();
        let contract = self.contract_for(msg.destination, code)?;

        let memory_info = contract.module.memory.ok_or_else(|| {
            VmError::ContractValidationFailure("module declares no memory".to_string())
        })?;
        if contract.module.exports.get("memory") != Some(&ExportKind::Memory) {
            return Err(VmError::ContractValidationFailure(
                "\"memory\" export not found".to_string(),
            ));
        }
        let main_index = match contract.module.exports.get("main") {
            Some(ExportKind::Func(index)) => *index,
            Some(_) => {
                return Err(VmError::ContractValidationFailure(
                    "\"main\" is not a function".to_string(),
                ))
            }
            None => {
                return Err(VmError::ContractValidationFailure(
                    "\"main\" not found".to_string(),
                ))
            }
        };
        let main_sig = contract.module.func_sig(main_index);
        if !main_sig.params.is_empty() || main_sig.result.is_some() {
            return Err(VmError::ContractValidationFailure(
                "\"main\" must take no parameters and return nothing".to_string(),
            ));
        }

        let mut memory = LinearMemory::new(memory_info.initial, memory_info.maximum)?;
        for segment in &contract.module.data_segments {
            let end = segment.offset as u64 + segment.data.len() as u64;
            if end > memory.size() as u64 {
                return Err(VmError::ContractValidationFailure(
                    "data segment out of bounds".to_string(),
                ));
            }
            let start = segment.offset as usize;
            memory.as_mut_slice()[start..start + segment.data.len()]
                .copy_from_slice(&segment.data);
        }
        let inits: Vec<ConstValue> = contract.module.globals.iter().map(|g| g.init).collect();
        contract.jit.globals().reset(&inits);

        let eei = EthereumInterface::new(host, state_code, msg.clone(), meter_gas);
        let mut ctx = VmContext::new(&mut memory, &contract.imports, eei);

        let execution_started = Instant::now();
        unsafe {
            contract
                .jit
                .invoke(&mut ctx as *mut VmContext, main_index, CALL_DEPTH_LIMIT);
        }
        let execution_finished = Instant::now();
        if benchmarking() {
            log::info!(
                "instantiation {:?}, execution {:?}",
                execution_started - instantiation_started,
                execution_finished - execution_started
            );
        }

        let outcome = ctx.take_pending().or_else(|| trap_error(ctx.trap));
        let gas_left = ctx.eei.gas_left;
        match outcome {
            None => Ok(ExecutionResult::new(StatusCode::Success, gas_left, Vec::new())),
            Some(VmError::EndExecution) => {
                let status = if ctx.eei.revert {
                    StatusCode::Revert
                } else {
                    StatusCode::Success
                };
                let output = std::mem::take(&mut ctx.eei.output);
                Ok(ExecutionResult::new(status, gas_left, output))
            }
            Some(err) => Err(err),
        }
    }
}

impl Default for JitEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl WasmEngine for JitEngine {
    fn execute(
        &mut self,
        host: &mut dyn HostInterface,
        code: &[u8],
        state_code: &[u8],
        msg: &Message,
        meter_gas: bool,
    ) -> ExecutionResult {
        match self.run(host, code, state_code, msg, meter_gas) {
            Ok(result) => result,
            Err(err) => {
                log::debug!("execution failed: {err}");
                ExecutionResult::failure(err.status())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_detection() {
        assert!(has_wasm_preamble(b"\0asm\x01\0\0\0"));
        assert!(!has_wasm_preamble(b"\0as"));
        assert!(!has_wasm_preamble(b"60606040"));
        assert_eq!(wasm_version(b"\0asm\x01\0\0\0"), Some(1));
        assert_eq!(wasm_version(b"\0asm\x02\0\0\0"), Some(2));
    }

    #[test]
    fn trap_codes_round_trip() {
        assert!(trap_error(TRAP_NONE).is_none());
        assert!(matches!(
            trap_error(TRAP_STACK_OVERFLOW),
            Some(VmError::Trap(TrapKind::StackOverflow))
        ));
        assert!(matches!(
            trap_error(TRAP_MEMORY_OOB),
            Some(VmError::Trap(TrapKind::MemoryOutOfBounds))
        ));
    }
}
