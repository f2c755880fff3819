//! Shared test host and fixture helpers.
#![allow(dead_code)] // not every test binary uses every helper

use ewasm_jit::{
    Address, Bytes32, CallResult, CallStatus, HostInterface, JitEngine, Message, StorageStatus,
    TxContext, WasmEngine,
};
use std::collections::{HashMap, HashSet};

/// In-memory host backing the integration tests. Sub-calls return a
/// canned [`CallResult`] and are recorded for inspection.
pub struct MockHost {
    pub storage: HashMap<(Address, Bytes32), Bytes32>,
    pub balances: HashMap<Address, Bytes32>,
    pub code: HashMap<Address, Vec<u8>>,
    pub existing_accounts: HashSet<Address>,
    pub logs: Vec<(Address, Vec<u8>, Vec<Bytes32>)>,
    pub selfdestructs: Vec<(Address, Address)>,
    pub calls: Vec<Message>,
    pub call_result: CallResult,
    pub tx_context: TxContext,
}

impl Default for MockHost {
    fn default() -> Self {
        Self {
            storage: HashMap::new(),
            balances: HashMap::new(),
            code: HashMap::new(),
            existing_accounts: HashSet::new(),
            logs: Vec::new(),
            selfdestructs: Vec::new(),
            calls: Vec::new(),
            call_result: CallResult::failure(),
            tx_context: TxContext::default(),
        }
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(mut self, address: Address, low: u128) -> Self {
        let mut word = [0u8; 32];
        word[16..].copy_from_slice(&low.to_be_bytes());
        self.balances.insert(address, word);
        self.existing_accounts.insert(address);
        self
    }
}

impl HostInterface for MockHost {
    fn account_exists(&mut self, address: &Address) -> bool {
        self.existing_accounts.contains(address)
    }

    fn get_storage(&mut self, address: &Address, key: &Bytes32) -> Bytes32 {
        self.storage.get(&(*address, *key)).copied().unwrap_or([0; 32])
    }

    fn set_storage(&mut self, address: &Address, key: &Bytes32, value: &Bytes32) -> StorageStatus {
        let previous = self.storage.insert((*address, *key), *value);
        match previous {
            None => StorageStatus::Added,
            Some(old) if old == *value => StorageStatus::Unchanged,
            Some(_) => StorageStatus::Modified,
        }
    }

    fn get_balance(&mut self, address: &Address) -> Bytes32 {
        self.balances.get(address).copied().unwrap_or([0; 32])
    }

    fn get_code_size(&mut self, address: &Address) -> usize {
        self.code.get(address).map(Vec::len).unwrap_or(0)
    }

    fn copy_code(&mut self, address: &Address, offset: usize, buf: &mut [u8]) -> usize {
        let Some(code) = self.code.get(address) else {
            return 0;
        };
        let available = code.len().saturating_sub(offset);
        let count = available.min(buf.len());
        buf[..count].copy_from_slice(&code[offset..offset + count]);
        count
    }

    fn selfdestruct(&mut self, address: &Address, beneficiary: &Address) {
        self.selfdestructs.push((*address, *beneficiary));
    }

    fn call(&mut self, msg: &Message) -> CallResult {
        self.calls.push(msg.clone());
        self.call_result.clone()
    }

    fn get_tx_context(&mut self) -> TxContext {
        self.tx_context.clone()
    }

    fn get_block_hash(&mut self, number: i64) -> Bytes32 {
        let mut hash = [0u8; 32];
        if number != 0 {
            hash[24..].copy_from_slice(&number.to_be_bytes());
        }
        hash
    }

    fn emit_log(&mut self, address: &Address, data: &[u8], topics: &[Bytes32]) {
        self.logs.push((*address, data.to_vec(), topics.to_vec()));
    }
}

pub fn success_call(output: Vec<u8>, gas_left: i64) -> CallResult {
    CallResult {
        status: CallStatus::Success,
        gas_left,
        output,
        create_address: [0x11; 20],
    }
}

pub fn revert_call(output: Vec<u8>, gas_left: i64) -> CallResult {
    CallResult {
        status: CallStatus::Revert,
        gas_left,
        output,
        create_address: [0; 20],
    }
}

/// Compile `source` and execute its `main` with a fresh engine.
pub fn execute_wat(source: &str, host: &mut MockHost, msg: &Message) -> ewasm_jit::ExecutionResult {
    let _ = env_logger::builder().is_test(true).try_init();
    let wasm = wat::parse_str(source).expect("fixture must assemble");
    let mut engine = JitEngine::new();
    engine.execute(host, &wasm, &wasm, msg, false)
}

/// Same as [`execute_wat`] but with interface gas metering enabled.
pub fn execute_wat_metered(
    source: &str,
    host: &mut MockHost,
    msg: &Message,
) -> ewasm_jit::ExecutionResult {
    let wasm = wat::parse_str(source).expect("fixture must assemble");
    let mut engine = JitEngine::new();
    engine.execute(host, &wasm, &wasm, msg, true)
}

/// A module whose `main` stores the i32 produced by `expr` at offset 0
/// and finishes with the four little-endian bytes.
pub fn finish_i32(expr: &str) -> String {
    format!(
        r#"(module
             (import "ethereum" "finish" (func $finish (param i32 i32)))
             (memory (export "memory") 1)
             (func (export "main")
               (i32.store (i32.const 0) {expr})
               (call $finish (i32.const 0) (i32.const 4))))"#
    )
}

/// As [`finish_i32`] but for an i64-producing expression.
pub fn finish_i64(expr: &str) -> String {
    format!(
        r#"(module
             (import "ethereum" "finish" (func $finish (param i32 i32)))
             (memory (export "memory") 1)
             (func (export "main")
               (i64.store (i32.const 0) {expr})
               (call $finish (i32.const 0) (i32.const 8))))"#
    )
}

pub fn assert_finishes_i32(source_expr: &str, expected: i32) {
    let mut host = MockHost::new();
    let result = execute_wat(&finish_i32(source_expr), &mut host, &Message::default());
    assert_eq!(
        result.status_code,
        ewasm_jit::StatusCode::Success,
        "expression {source_expr:?} did not finish"
    );
    assert_eq!(
        result.output,
        expected.to_le_bytes(),
        "expression {source_expr:?} produced the wrong value"
    );
}

pub fn assert_finishes_i64(source_expr: &str, expected: i64) {
    let mut host = MockHost::new();
    let result = execute_wat(&finish_i64(source_expr), &mut host, &Message::default());
    assert_eq!(
        result.status_code,
        ewasm_jit::StatusCode::Success,
        "expression {source_expr:?} did not finish"
    );
    assert_eq!(
        result.output,
        expected.to_le_bytes(),
        "expression {source_expr:?} produced the wrong value"
    );
}

pub fn assert_traps(source_expr_i32: &str) {
    let mut host = MockHost::new();
    let result = execute_wat(
        &finish_i32(source_expr_i32),
        &mut host,
        &Message::default(),
    );
    assert_eq!(
        result.status_code,
        ewasm_jit::StatusCode::Failure,
        "expression {source_expr_i32:?} should trap"
    );
}
