//! VM-layer behaviour: EVM1 handling modes, contract preloads, create
//! deployments and option parsing.

mod common;

use common::{success_call, MockHost};
use ewasm_jit::{CallKind, Message, SetOptionResult, StatusCode, Vm};

const EVM1_BYTECODE: &[u8] = &[0x60, 0x60, 0x60, 0x40];

fn finish_contract() -> Vec<u8> {
    wat::parse_str(
        r#"(module
             (import "ethereum" "finish" (func $finish (param i32 i32)))
             (memory (export "memory") 1)
             (func (export "main")
               (i32.store (i32.const 0) (i32.const 7))
               (call $finish (i32.const 0) (i32.const 4))))"#,
    )
    .unwrap()
}

#[test]
fn wasm_contracts_execute_directly() {
    let mut vm = Vm::new();
    let mut host = MockHost::new();
    let code = finish_contract();
    let result = vm.execute(&mut host, &Message::default(), &code);
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(result.output, 7i32.to_le_bytes());
}

#[test]
fn evm1_bytecode_is_rejected_by_default() {
    let mut vm = Vm::new();
    let mut host = MockHost::new();
    let result = vm.execute(&mut host, &Message::default(), EVM1_BYTECODE);
    assert_eq!(result.status_code, StatusCode::Failure);
}

#[test]
fn fallback_mode_defers_to_the_client() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.set_option("evm1mode", "fallback"),
        SetOptionResult::Success
    );
    let mut host = MockHost::new();
    let result = vm.execute(&mut host, &Message::default(), EVM1_BYTECODE);
    assert_eq!(result.status_code, StatusCode::Rejected);
}

#[test]
fn evm2wasm_mode_runs_the_transcompiled_module() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.set_option("evm1mode", "evm2wasm"),
        SetOptionResult::Success
    );
    let mut host = MockHost::new();
    // The evm2wasm system contract "compiles" the input to a module
    // that finishes with 7.
    host.call_result = success_call(finish_contract(), 0);
    let result = vm.execute(&mut host, &Message::default(), EVM1_BYTECODE);
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(result.output, 7i32.to_le_bytes());
    assert_eq!(host.calls.len(), 1);
    assert_eq!(host.calls[0].destination, ewasm_jit::evm2wasm_address());
}

#[test]
fn evm2wasm_failure_is_a_validation_failure() {
    let mut vm = Vm::new();
    vm.set_option("evm1mode", "evm2wasm");
    let mut host = MockHost::new(); // sub-calls fail by default
    let result = vm.execute(&mut host, &Message::default(), EVM1_BYTECODE);
    assert_eq!(result.status_code, StatusCode::ContractValidationFailure);
}

#[test]
fn preloaded_contracts_override_the_executable_code() {
    let destination = [0x0f; 20];
    let path = std::env::temp_dir().join("ewasm-jit-preload-test.wasm");
    std::fs::write(&path, finish_contract()).unwrap();

    let mut vm = Vm::new();
    let name = format!("sys:0x{}", "0f".repeat(20));
    assert_eq!(
        vm.set_option(&name, path.to_str().unwrap()),
        SetOptionResult::Success
    );

    let mut host = MockHost::new();
    let msg = Message {
        destination,
        ..Message::default()
    };
    // The state code is not WebAssembly, but the preload replaces it.
    let result = vm.execute(&mut host, &msg, EVM1_BYTECODE);
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(result.output, 7i32.to_le_bytes());
    std::fs::remove_file(&path).ok();
}

#[test]
fn create_deployments_return_the_code() {
    let mut vm = Vm::new();
    let mut host = MockHost::new();
    let code = finish_contract();
    let msg = Message {
        kind: CallKind::Create,
        gas: 100_000,
        ..Message::default()
    };
    let result = vm.execute(&mut host, &msg, &code);
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(result.gas_left, 100_000);
    assert_eq!(result.output, code);
}

#[test]
fn create_with_input_fails_validation() {
    let mut vm = Vm::new();
    let mut host = MockHost::new();
    let code = finish_contract();
    let msg = Message {
        kind: CallKind::Create,
        input: vec![1],
        ..Message::default()
    };
    let result = vm.execute(&mut host, &msg, &code);
    assert_eq!(result.status_code, StatusCode::ContractValidationFailure);
}

#[test]
fn metered_create_routes_through_the_sentinel() {
    let mut vm = Vm::new();
    vm.set_option("metering", "true");
    let mut host = MockHost::new();
    // The sentinel echoes a (different) metered module back.
    host.call_result = success_call(finish_contract(), 0);
    let code = finish_contract();
    let msg = Message {
        kind: CallKind::Create,
        gas: 100_000,
        ..Message::default()
    };
    let result = vm.execute(&mut host, &msg, &code);
    assert_eq!(result.status_code, StatusCode::Success);
    assert!(!host.calls.is_empty());
    assert_eq!(host.calls[0].destination, ewasm_jit::sentinel_address());
}

#[test]
fn negative_startgas_is_an_internal_error() {
    let mut vm = Vm::new();
    let mut host = MockHost::new();
    let msg = Message {
        gas: -1,
        ..Message::default()
    };
    let result = vm.execute(&mut host, &msg, &finish_contract());
    assert_eq!(result.status_code, StatusCode::InternalError);
}
