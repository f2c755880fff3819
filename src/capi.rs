//! C-callable embedding surface.
//!
//! Four verbs over an opaque handle: create, destroy, execute and
//! set_option. The host supplies its state interface as a table of
//! function pointers plus an opaque context pointer; results carry a
//! release callback so the embedder controls the output buffer's
//! lifetime.

use crate::error::{ExecutionResult, StatusCode};
use crate::host::{
    Address, Bytes32, CallKind, CallResult, CallStatus, HostInterface, Message, StorageStatus,
    TxContext,
};
use crate::vm::{SetOptionResult, Vm};
use std::ffi::CStr;
use std::os::raw::{c_char, c_void};

pub const EWASM_SUCCESS: i32 = 0;
pub const EWASM_FAILURE: i32 = 1;
pub const EWASM_REVERT: i32 = 2;
pub const EWASM_OUT_OF_GAS: i32 = 3;
pub const EWASM_INVALID_MEMORY_ACCESS: i32 = 9;
pub const EWASM_STATIC_MODE_VIOLATION: i32 = 11;
pub const EWASM_CONTRACT_VALIDATION_FAILURE: i32 = 13;
pub const EWASM_ARGUMENT_OUT_OF_RANGE: i32 = 14;
pub const EWASM_INTERNAL_ERROR: i32 = -1;
pub const EWASM_REJECTED: i32 = -2;

pub const EWASM_CALL: i32 = 0;
pub const EWASM_DELEGATECALL: i32 = 1;
pub const EWASM_CALLCODE: i32 = 2;
pub const EWASM_CREATE: i32 = 3;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct EwasmMessage {
    pub kind: i32,
    pub flags: u32,
    pub depth: i32,
    pub gas: i64,
    pub destination: Address,
    pub sender: Address,
    pub input_data: *const u8,
    pub input_size: usize,
    pub value: Bytes32,
}

#[repr(C)]
pub struct EwasmResult {
    pub status_code: i32,
    pub gas_left: i64,
    pub output_data: *const u8,
    pub output_size: usize,
    pub release: Option<extern "C" fn(*const EwasmResult)>,
    pub create_address: Address,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct EwasmTxContext {
    pub tx_gas_price: Bytes32,
    pub tx_origin: Address,
    pub block_coinbase: Address,
    pub block_number: i64,
    pub block_timestamp: i64,
    pub block_gas_limit: i64,
    pub block_difficulty: Bytes32,
}

/// Host callbacks. Every function receives the embedder's opaque
/// context pointer first.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct EwasmHostInterface {
    pub account_exists: extern "C" fn(*mut c_void, *const Address) -> bool,
    pub get_storage: extern "C" fn(*mut c_void, *const Address, *const Bytes32, *mut Bytes32),
    pub set_storage:
        extern "C" fn(*mut c_void, *const Address, *const Bytes32, *const Bytes32) -> i32,
    pub get_balance: extern "C" fn(*mut c_void, *const Address, *mut Bytes32),
    pub get_code_size: extern "C" fn(*mut c_void, *const Address) -> usize,
    pub copy_code:
        extern "C" fn(*mut c_void, *const Address, usize, *mut u8, usize) -> usize,
    pub selfdestruct: extern "C" fn(*mut c_void, *const Address, *const Address),
    pub call: extern "C" fn(*mut c_void, *const EwasmMessage) -> EwasmResult,
    pub get_tx_context: extern "C" fn(*mut c_void, *mut EwasmTxContext),
    pub get_block_hash: extern "C" fn(*mut c_void, i64, *mut Bytes32),
    pub emit_log: extern "C" fn(
        *mut c_void,
        *const Address,
        *const u8,
        usize,
        *const Bytes32,
        usize,
    ),
}

/// Adapter from the C host table onto the engine's host trait.
struct CHost {
    interface: EwasmHostInterface,
    context: *mut c_void,
}

impl HostInterface for CHost {
    fn account_exists(&mut self, address: &Address) -> bool {
        (self.interface.account_exists)(self.context, address)
    }

    fn get_storage(&mut self, address: &Address, key: &Bytes32) -> Bytes32 {
        let mut value = [0u8; 32];
        (self.interface.get_storage)(self.context, address, key, &mut value);
        value
    }

    fn set_storage(&mut self, address: &Address, key: &Bytes32, value: &Bytes32) -> StorageStatus {
        match (self.interface.set_storage)(self.context, address, key, value) {
            0 => StorageStatus::Added,
            2 => StorageStatus::Unchanged,
            _ => StorageStatus::Modified,
        }
    }

    fn get_balance(&mut self, address: &Address) -> Bytes32 {
        let mut balance = [0u8; 32];
        (self.interface.get_balance)(self.context, address, &mut balance);
        balance
    }

    fn get_code_size(&mut self, address: &Address) -> usize {
        (self.interface.get_code_size)(self.context, address)
    }

    fn copy_code(&mut self, address: &Address, offset: usize, buf: &mut [u8]) -> usize {
        (self.interface.copy_code)(self.context, address, offset, buf.as_mut_ptr(), buf.len())
    }

    fn selfdestruct(&mut self, address: &Address, beneficiary: &Address) {
        (self.interface.selfdestruct)(self.context, address, beneficiary)
    }

    fn call(&mut self, msg: &Message) -> CallResult {
        let c_msg = EwasmMessage {
            kind: match msg.kind {
                CallKind::Call => EWASM_CALL,
                CallKind::DelegateCall => EWASM_DELEGATECALL,
                CallKind::CallCode => EWASM_CALLCODE,
                CallKind::Create => EWASM_CREATE,
            },
            flags: msg.flags,
            depth: msg.depth,
            gas: msg.gas,
            destination: msg.destination,
            sender: msg.sender,
            input_data: msg.input.as_ptr(),
            input_size: msg.input.len(),
            value: msg.value,
        };
        let raw = (self.interface.call)(self.context, &c_msg);
        let output = if raw.output_data.is_null() {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(raw.output_data, raw.output_size) }.to_vec()
        };
        let status = match raw.status_code {
            EWASM_SUCCESS => CallStatus::Success,
            EWASM_REVERT => CallStatus::Revert,
            _ => CallStatus::Failure,
        };
        let result = CallResult {
            status,
            gas_left: raw.gas_left,
            output,
            create_address: raw.create_address,
        };
        if let Some(release) = raw.release {
            release(&raw);
        }
        result
    }

    fn get_tx_context(&mut self) -> TxContext {
        let mut raw = EwasmTxContext::default();
        (self.interface.get_tx_context)(self.context, &mut raw);
        TxContext {
            tx_gas_price: raw.tx_gas_price,
            tx_origin: raw.tx_origin,
            block_coinbase: raw.block_coinbase,
            block_number: raw.block_number,
            block_timestamp: raw.block_timestamp,
            block_gas_limit: raw.block_gas_limit,
            block_difficulty: raw.block_difficulty,
        }
    }

    fn get_block_hash(&mut self, number: i64) -> Bytes32 {
        let mut hash = [0u8; 32];
        (self.interface.get_block_hash)(self.context, number, &mut hash);
        hash
    }

    fn emit_log(&mut self, address: &Address, data: &[u8], topics: &[Bytes32]) {
        (self.interface.emit_log)(
            self.context,
            address,
            data.as_ptr(),
            data.len(),
            topics.as_ptr(),
            topics.len(),
        )
    }
}

fn status_to_c(status: StatusCode) -> i32 {
    match status {
        StatusCode::Success => EWASM_SUCCESS,
        StatusCode::Revert => EWASM_REVERT,
        StatusCode::Failure => EWASM_FAILURE,
        StatusCode::OutOfGas => EWASM_OUT_OF_GAS,
        StatusCode::ArgumentOutOfRange => EWASM_ARGUMENT_OUT_OF_RANGE,
        StatusCode::InvalidMemoryAccess => EWASM_INVALID_MEMORY_ACCESS,
        StatusCode::StaticModeViolation => EWASM_STATIC_MODE_VIOLATION,
        StatusCode::ContractValidationFailure => EWASM_CONTRACT_VALIDATION_FAILURE,
        StatusCode::InternalError => EWASM_INTERNAL_ERROR,
        StatusCode::Rejected => EWASM_REJECTED,
    }
}

extern "C" fn release_result(result: *const EwasmResult) {
    unsafe {
        let result = &*result;
        if !result.output_data.is_null() {
            let slice = std::ptr::slice_from_raw_parts_mut(
                result.output_data as *mut u8,
                result.output_size,
            );
            drop(Box::from_raw(slice));
        }
    }
}

fn result_to_c(result: ExecutionResult) -> EwasmResult {
    let (output_data, output_size, release) = if result.output.is_empty() {
        (std::ptr::null(), 0, None)
    } else {
        let boxed: Box<[u8]> = result.output.into_boxed_slice();
        let size = boxed.len();
        (
            Box::into_raw(boxed) as *const u8,
            size,
            Some(release_result as extern "C" fn(*const EwasmResult)),
        )
    };
    EwasmResult {
        status_code: status_to_c(result.status_code),
        gas_left: result.gas_left,
        output_data,
        output_size,
        release,
        create_address: [0; 20],
    }
}

/// Allocate a VM instance. Destroy it with [`ewasm_jit_destroy`].
#[no_mangle]
pub extern "C" fn ewasm_jit_create() -> *mut Vm {
    Box::into_raw(Box::new(Vm::new()))
}

/// # Safety
///
/// `vm` must be a pointer returned by [`ewasm_jit_create`] that has not
/// been destroyed yet.
#[no_mangle]
pub unsafe extern "C" fn ewasm_jit_destroy(vm: *mut Vm) {
    if !vm.is_null() {
        drop(Box::from_raw(vm));
    }
}

/// # Safety
///
/// `vm` must be live; `name` and `value` must be NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn ewasm_jit_set_option(
    vm: *mut Vm,
    name: *const c_char,
    value: *const c_char,
) -> i32 {
    let vm = &mut *vm;
    let (Ok(name), Ok(value)) = (CStr::from_ptr(name).to_str(), CStr::from_ptr(value).to_str())
    else {
        return 2;
    };
    match vm.set_option(name, value) {
        SetOptionResult::Success => 0,
        SetOptionResult::InvalidName => 1,
        SetOptionResult::InvalidValue => 2,
    }
}

/// Execute one message.
///
/// # Safety
///
/// `vm`, `host` and `msg` must be live; `code` must reference
/// `code_size` readable bytes; the host callbacks must stay valid for
/// the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn ewasm_jit_execute(
    vm: *mut Vm,
    host: *const EwasmHostInterface,
    host_context: *mut c_void,
    msg: *const EwasmMessage,
    code: *const u8,
    code_size: usize,
) -> EwasmResult {
    let vm = &mut *vm;
    let raw_msg = &*msg;
    let message = Message {
        kind: match raw_msg.kind {
            EWASM_DELEGATECALL => CallKind::DelegateCall,
            EWASM_CALLCODE => CallKind::CallCode,
            EWASM_CREATE => CallKind::Create,
            _ => CallKind::Call,
        },
        flags: raw_msg.flags,
        depth: raw_msg.depth,
        gas: raw_msg.gas,
        destination: raw_msg.destination,
        sender: raw_msg.sender,
        input: if raw_msg.input_data.is_null() {
            Vec::new()
        } else {
            std::slice::from_raw_parts(raw_msg.input_data, raw_msg.input_size).to_vec()
        },
        value: raw_msg.value,
    };
    let mut adapter = CHost {
        interface: *host,
        context: host_context,
    };
    let code = std::slice::from_raw_parts(code, code_size);
    result_to_c(vm.execute(&mut adapter, &message, code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_release_frees_output() {
        let result = result_to_c(ExecutionResult::new(
            StatusCode::Success,
            7,
            vec![1, 2, 3],
        ));
        assert_eq!(result.status_code, EWASM_SUCCESS);
        assert_eq!(result.output_size, 3);
        let release = result.release.unwrap();
        release(&result);
    }

    #[test]
    fn empty_output_has_no_release() {
        let result = result_to_c(ExecutionResult::failure(StatusCode::OutOfGas));
        assert!(result.output_data.is_null());
        assert!(result.release.is_none());
    }
}
