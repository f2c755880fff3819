//! An ewasm virtual machine built around a single-pass x86-64 JIT.
//!
//! Contracts compiled to WebAssembly 1.0 are validated, lowered to
//! native code in one pass and executed against the Ethereum
//! Environment Interface. The host side of the world (state, storage,
//! sub-calls) stays behind the [`HostInterface`] trait; everything the
//! contract can observe flows through it.
//!
//! The execution pipeline per invocation:
//!
//! 1. decode and validate the binary;
//! 2. lower it to machine code in an executable arena;
//! 3. link its imports against the host-function registry;
//! 4. instantiate memory and globals and run `main`;
//! 5. fold the outcome into an [`ExecutionResult`].
//!
//! Only x86-64 is supported; the code writer emits System V machine
//! code directly.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod arena;
mod bridge;
pub mod capi;
mod eei;
mod engine;
mod error;
mod host;
mod jit;
mod memory;
mod module;
mod translate;
mod vm;

pub use crate::bridge::{
    HostArgs, HostFunction, HostHandler, HostRegistry, ResolvedImport, VmContext,
};
pub use crate::eei::register_eei;
pub use crate::engine::{create_engine, enable_benchmarking, JitEngine, WasmEngine};
pub use crate::error::{ExecutionResult, StatusCode, TrapKind, VmError};
pub use crate::host::{
    Address, Bytes32, CallKind, CallResult, CallStatus, HostInterface, Message, StorageStatus,
    TxContext, MSG_STATIC,
};
pub use crate::memory::WASM_PAGE_SIZE;
pub use crate::module::{FuncSig, ValType};
pub use crate::vm::{
    evm2wasm_address, runevm_address, sentinel_address, Evm1Mode, SetOptionResult, Vm,
};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
