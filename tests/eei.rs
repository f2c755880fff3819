//! Behaviour of the "ethereum" host module: data marshalling, gas
//! metering, static mode and sub-call plumbing.

mod common;

use common::{execute_wat, execute_wat_metered, revert_call, success_call, MockHost};
use ewasm_jit::{CallKind, Message, StatusCode, MSG_STATIC};

fn msg_with_input(input: &[u8]) -> Message {
    Message {
        input: input.to_vec(),
        gas: 1_000_000,
        ..Message::default()
    }
}

#[test]
fn call_data_round_trips() {
    let source = r#"(module
      (import "ethereum" "getCallDataSize" (func $size (result i32)))
      (import "ethereum" "callDataCopy" (func $copy (param i32 i32 i32)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (call $copy (i32.const 0) (i32.const 0) (call $size))
        (call $finish (i32.const 0) (call $size))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &msg_with_input(&[9, 8, 7, 6, 5]));
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(result.output, [9, 8, 7, 6, 5]);
}

#[test]
fn call_data_copy_past_the_input_is_invalid() {
    let source = r#"(module
      (import "ethereum" "callDataCopy" (func $copy (param i32 i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (call $copy (i32.const 0) (i32.const 2) (i32.const 8))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &msg_with_input(&[1, 2, 3]));
    assert_eq!(result.status_code, StatusCode::InvalidMemoryAccess);
}

#[test]
fn storage_store_and_load() {
    let source = r#"(module
      (import "ethereum" "storageStore" (func $sstore (param i32 i32)))
      (import "ethereum" "storageLoad" (func $sload (param i32 i32)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        ;; key at 0 (zero), value at 32
        (i32.store8 (i32.const 63) (i32.const 0x2a))
        (call $sstore (i32.const 0) (i32.const 32))
        (call $sload (i32.const 0) (i32.const 64))
        (call $finish (i32.const 64) (i32.const 32))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &msg_with_input(&[]));
    assert_eq!(result.status_code, StatusCode::Success);
    let mut expected = [0u8; 32];
    expected[31] = 0x2a;
    assert_eq!(result.output, expected);
    assert_eq!(host.storage.len(), 1);
}

#[test]
fn storage_store_in_static_mode_is_rejected() {
    let source = r#"(module
      (import "ethereum" "storageStore" (func $sstore (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (call $sstore (i32.const 0) (i32.const 32))))"#;
    let mut host = MockHost::new();
    let msg = Message {
        flags: MSG_STATIC,
        ..msg_with_input(&[])
    };
    let result = execute_wat(source, &mut host, &msg);
    assert_eq!(result.status_code, StatusCode::StaticModeViolation);
    assert!(host.storage.is_empty());
}

#[test]
fn caller_and_address_are_observable() {
    let source = r#"(module
      (import "ethereum" "getCaller" (func $caller (param i32)))
      (import "ethereum" "getAddress" (func $address (param i32)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (call $caller (i32.const 0))
        (call $address (i32.const 20))
        (call $finish (i32.const 0) (i32.const 40))))"#;
    let mut host = MockHost::new();
    let msg = Message {
        sender: [0xaa; 20],
        destination: [0xbb; 20],
        ..msg_with_input(&[])
    };
    let result = execute_wat(source, &mut host, &msg);
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(&result.output[..20], &[0xaa; 20]);
    assert_eq!(&result.output[20..], &[0xbb; 20]);
}

#[test]
fn call_value_is_little_endian_u128() {
    let source = r#"(module
      (import "ethereum" "getCallValue" (func $value (param i32)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (call $value (i32.const 0))
        (call $finish (i32.const 0) (i32.const 16))))"#;
    let mut host = MockHost::new();
    let mut value = [0u8; 32];
    value[16..].copy_from_slice(&0x0102_0304u128.to_be_bytes());
    let msg = Message {
        value,
        ..msg_with_input(&[])
    };
    let result = execute_wat(source, &mut host, &msg);
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(result.output, 0x0102_0304u128.to_le_bytes());
}

#[test]
fn external_balance_is_little_endian_u128() {
    let source = r#"(module
      (import "ethereum" "getExternalBalance" (func $balance (param i32 i32)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      ;; address placed at 0 by the data segment below
      (data (i32.const 0) "\cc\cc\cc\cc\cc\cc\cc\cc\cc\cc\cc\cc\cc\cc\cc\cc\cc\cc\cc\cc")
      (func (export "main")
        (call $balance (i32.const 0) (i32.const 32))
        (call $finish (i32.const 32) (i32.const 16))))"#;
    let mut host = MockHost::new().with_balance([0xcc; 20], 777);
    let result = execute_wat(source, &mut host, &msg_with_input(&[]));
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(result.output, 777u128.to_le_bytes());
}

#[test]
fn block_context_values_flow_through() {
    let source = r#"(module
      (import "ethereum" "getBlockNumber" (func $number (result i64)))
      (import "ethereum" "getBlockTimestamp" (func $timestamp (result i64)))
      (import "ethereum" "getBlockGasLimit" (func $limit (result i64)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (i64.store (i32.const 0) (call $number))
        (i64.store (i32.const 8) (call $timestamp))
        (i64.store (i32.const 16) (call $limit))
        (call $finish (i32.const 0) (i32.const 24))))"#;
    let mut host = MockHost::new();
    host.tx_context.block_number = 1234;
    host.tx_context.block_timestamp = 98765;
    host.tx_context.block_gas_limit = 8_000_000;
    let result = execute_wat(source, &mut host, &msg_with_input(&[]));
    assert_eq!(result.status_code, StatusCode::Success);
    let mut expected = Vec::new();
    expected.extend_from_slice(&1234i64.to_le_bytes());
    expected.extend_from_slice(&98765i64.to_le_bytes());
    expected.extend_from_slice(&8_000_000i64.to_le_bytes());
    assert_eq!(result.output, expected);
}

#[test]
fn use_gas_rejects_negative_amounts() {
    let source = r#"(module
      (import "ethereum" "useGas" (func $useGas (param i64)))
      (memory (export "memory") 1)
      (func (export "main")
        (call $useGas (i64.const -5))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &msg_with_input(&[]));
    assert_eq!(result.status_code, StatusCode::ArgumentOutOfRange);
}

#[test]
fn gas_left_reflects_interface_charges() {
    let source = r#"(module
      (import "ethereum" "getGasLeft" (func $gasLeft (result i64)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (i64.store (i32.const 0) (call $gasLeft))
        (call $finish (i32.const 0) (i32.const 8))))"#;
    let mut host = MockHost::new();
    let result = execute_wat_metered(source, &mut host, &msg_with_input(&[]));
    assert_eq!(result.status_code, StatusCode::Success);
    // The getGasLeft base charge itself is observable.
    let observed = i64::from_le_bytes(result.output.try_into().unwrap());
    assert_eq!(observed, 1_000_000 - 2);
}

#[test]
fn metering_is_off_by_default() {
    let source = r#"(module
      (import "ethereum" "getGasLeft" (func $gasLeft (result i64)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (i64.store (i32.const 0) (call $gasLeft))
        (call $finish (i32.const 0) (i32.const 8))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &msg_with_input(&[]));
    let observed = i64::from_le_bytes(result.output.try_into().unwrap());
    assert_eq!(observed, 1_000_000);
}

#[test]
fn logs_carry_topics_and_data() {
    let source = r#"(module
      (import "ethereum" "log" (func $log (param i32 i32 i32 i32 i32 i32 i32)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        ;; two topics at 0 and 32, three data bytes at 64
        (i32.store8 (i32.const 31) (i32.const 1))
        (i32.store8 (i32.const 63) (i32.const 2))
        (i32.store8 (i32.const 64) (i32.const 0xaa))
        (i32.store8 (i32.const 65) (i32.const 0xbb))
        (i32.store8 (i32.const 66) (i32.const 0xcc))
        (call $log (i32.const 64) (i32.const 3) (i32.const 2)
                   (i32.const 0) (i32.const 32) (i32.const 0) (i32.const 0))
        (call $finish (i32.const 0) (i32.const 0))))"#;
    let mut host = MockHost::new();
    let msg = Message {
        destination: [0x77; 20],
        ..msg_with_input(&[])
    };
    let result = execute_wat(source, &mut host, &msg);
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(host.logs.len(), 1);
    let (address, data, topics) = &host.logs[0];
    assert_eq!(address, &[0x77; 20]);
    assert_eq!(data, &[0xaa, 0xbb, 0xcc]);
    assert_eq!(topics.len(), 2);
    assert_eq!(topics[0][31], 1);
    assert_eq!(topics[1][31], 2);
}

#[test]
fn too_many_log_topics_are_rejected() {
    let source = r#"(module
      (import "ethereum" "log" (func $log (param i32 i32 i32 i32 i32 i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (call $log (i32.const 0) (i32.const 0) (i32.const 5)
                   (i32.const 0) (i32.const 0) (i32.const 0) (i32.const 0))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &msg_with_input(&[]));
    assert_eq!(result.status_code, StatusCode::ArgumentOutOfRange);
}

const SUBCALL_SOURCE: &str = r#"(module
  (import "ethereum" "call"
    (func $call (param i64 i32 i32 i32 i32) (result i32)))
  (import "ethereum" "getReturnDataSize" (func $rds (result i32)))
  (import "ethereum" "returnDataCopy" (func $rdc (param i32 i32 i32)))
  (import "ethereum" "finish" (func $finish (param i32 i32)))
  (memory (export "memory") 1)
  ;; callee address at 0, zero value at 32, call data at 64
  (data (i32.const 0) "\42\42\42\42\42\42\42\42\42\42\42\42\42\42\42\42\42\42\42\42")
  (func (export "main")
    ;; status code of the sub-call at 128
    (i32.store (i32.const 128)
      (call $call (i64.const 50000) (i32.const 0) (i32.const 32)
                  (i32.const 64) (i32.const 4)))
    ;; returned bytes after it
    (call $rdc (i32.const 132) (i32.const 0) (call $rds))
    (call $finish (i32.const 128) (i32.add (i32.const 4) (call $rds)))))"#;

#[test]
fn subcall_success_exposes_return_data() {
    let mut host = MockHost::new();
    host.call_result = success_call(vec![0xde, 0xad], 111);
    let result = execute_wat(SUBCALL_SOURCE, &mut host, &msg_with_input(&[1, 2, 3, 4]));
    assert_eq!(result.status_code, StatusCode::Success);
    let mut expected = Vec::new();
    expected.extend_from_slice(&0i32.to_le_bytes());
    expected.extend_from_slice(&[0xde, 0xad]);
    assert_eq!(result.output, expected);

    assert_eq!(host.calls.len(), 1);
    let child = &host.calls[0];
    assert_eq!(child.kind, CallKind::Call);
    assert_eq!(child.destination, [0x42; 20]);
    assert_eq!(child.depth, 1);
    assert_eq!(child.input, [0, 0, 0, 0]);
}

#[test]
fn subcall_revert_reports_status_two() {
    let mut host = MockHost::new();
    host.call_result = revert_call(vec![0x01], 7);
    let result = execute_wat(SUBCALL_SOURCE, &mut host, &msg_with_input(&[]));
    assert_eq!(result.status_code, StatusCode::Success);
    let mut expected = Vec::new();
    expected.extend_from_slice(&2i32.to_le_bytes());
    expected.push(0x01);
    assert_eq!(result.output, expected);
}

#[test]
fn subcall_failure_reports_status_one() {
    let mut host = MockHost::new();
    let result = execute_wat(SUBCALL_SOURCE, &mut host, &msg_with_input(&[]));
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(&result.output[..4], &1i32.to_le_bytes());
}

#[test]
fn deep_frames_cannot_call_further() {
    let mut host = MockHost::new();
    let msg = Message {
        depth: 1024,
        ..msg_with_input(&[])
    };
    let result = execute_wat(SUBCALL_SOURCE, &mut host, &msg);
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(&result.output[..4], &1i32.to_le_bytes());
    assert!(host.calls.is_empty());
}

#[test]
fn call_static_flags_the_child() {
    let source = r#"(module
      (import "ethereum" "callStatic"
        (func $callStatic (param i64 i32 i32 i32) (result i32)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (i32.store (i32.const 64)
          (call $callStatic (i64.const 1000) (i32.const 0)
                            (i32.const 32) (i32.const 4)))
        (call $finish (i32.const 64) (i32.const 4))))"#;
    let mut host = MockHost::new();
    host.call_result = success_call(Vec::new(), 0);
    let result = execute_wat(source, &mut host, &msg_with_input(&[]));
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(result.output, 0i32.to_le_bytes());
    assert_eq!(host.calls.len(), 1);
    assert_eq!(host.calls[0].flags & MSG_STATIC, MSG_STATIC);
}

#[test]
fn delegate_call_keeps_sender_and_value() {
    let source = r#"(module
      (import "ethereum" "callDelegate"
        (func $delegate (param i64 i32 i32 i32) (result i32)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (drop (call $delegate (i64.const 1000) (i32.const 0)
                              (i32.const 32) (i32.const 0)))
        (call $finish (i32.const 0) (i32.const 0))))"#;
    let mut host = MockHost::new();
    host.call_result = success_call(Vec::new(), 0);
    let mut value = [0u8; 32];
    value[31] = 9;
    let msg = Message {
        sender: [0x01; 20],
        value,
        ..msg_with_input(&[])
    };
    let result = execute_wat(source, &mut host, &msg);
    assert_eq!(result.status_code, StatusCode::Success);
    let child = &host.calls[0];
    assert_eq!(child.kind, CallKind::DelegateCall);
    assert_eq!(child.sender, [0x01; 20]);
    assert_eq!(child.value, value);
}

#[test]
fn value_bearing_call_in_static_mode_is_rejected() {
    let source = r#"(module
      (import "ethereum" "call"
        (func $call (param i64 i32 i32 i32 i32) (result i32)))
      (memory (export "memory") 1)
      (func (export "main")
        ;; non-zero value at offset 32
        (i32.store8 (i32.const 32) (i32.const 1))
        (drop (call $call (i64.const 1000) (i32.const 0) (i32.const 32)
                          (i32.const 64) (i32.const 0)))))"#;
    let mut host = MockHost::new().with_balance([0; 20], 1_000_000);
    let msg = Message {
        flags: MSG_STATIC,
        ..msg_with_input(&[])
    };
    let result = execute_wat(source, &mut host, &msg);
    assert_eq!(result.status_code, StatusCode::StaticModeViolation);
    assert!(host.calls.is_empty());
}

#[test]
fn create_returns_the_new_address() {
    let source = r#"(module
      (import "ethereum" "create"
        (func $create (param i32 i32 i32 i32) (result i32)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        ;; value at 0 (zero), init code at 16, result address at 64
        (i32.store (i32.const 100)
          (call $create (i32.const 0) (i32.const 16) (i32.const 4) (i32.const 64)))
        (call $finish (i32.const 64) (i32.const 20))))"#;
    let mut host = MockHost::new();
    host.call_result = success_call(Vec::new(), 0);
    let result = execute_wat(source, &mut host, &msg_with_input(&[]));
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(result.output, [0x11; 20]);
    assert_eq!(host.calls[0].kind, CallKind::Create);
}

#[test]
fn selfdestruct_ends_execution() {
    let source = r#"(module
      (import "ethereum" "selfDestruct" (func $sd (param i32)))
      (memory (export "memory") 1)
      (data (i32.const 0) "\33\33\33\33\33\33\33\33\33\33\33\33\33\33\33\33\33\33\33\33")
      (func (export "main")
        (call $sd (i32.const 0))
        ;; never reached
        (unreachable)))"#;
    let mut host = MockHost::new();
    let msg = Message {
        destination: [0x99; 20],
        ..msg_with_input(&[])
    };
    let result = execute_wat(source, &mut host, &msg);
    assert_eq!(result.status_code, StatusCode::Success);
    assert!(result.output.is_empty());
    assert_eq!(host.selfdestructs, vec![([0x99; 20], [0x33; 20])]);
}

#[test]
fn code_copy_reads_the_state_code() {
    let source = r#"(module
      (import "ethereum" "getCodeSize" (func $size (result i32)))
      (import "ethereum" "codeCopy" (func $copy (param i32 i32 i32)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (call $copy (i32.const 0) (i32.const 0) (i32.const 4))
        (call $finish (i32.const 0) (i32.const 4))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &msg_with_input(&[]));
    assert_eq!(result.status_code, StatusCode::Success);
    // The first bytes of any module are the preamble.
    assert_eq!(result.output, *b"\0asm");
}

#[test]
fn block_hash_reports_missing_blocks() {
    let source = r#"(module
      (import "ethereum" "getBlockHash" (func $hash (param i64 i32) (result i32)))
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        ;; status for a known block, then for an unknown one
        (i32.store (i32.const 64) (call $hash (i64.const 5) (i32.const 0)))
        (i32.store (i32.const 68) (call $hash (i64.const 0) (i32.const 32)))
        (call $finish (i32.const 64) (i32.const 8))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &msg_with_input(&[]));
    assert_eq!(result.status_code, StatusCode::Success);
    let mut expected = Vec::new();
    expected.extend_from_slice(&0i32.to_le_bytes());
    expected.extend_from_slice(&1i32.to_le_bytes());
    assert_eq!(result.output, expected);
}

#[test]
fn out_of_gas_inside_a_host_call_unwinds() {
    let source = r#"(module
      (import "ethereum" "storageLoad" (func $sload (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (call $sload (i32.const 0) (i32.const 32))))"#;
    let mut host = MockHost::new();
    let msg = Message {
        gas: 10, // below the storageLoad charge
        ..Message::default()
    };
    let result = execute_wat_metered(source, &mut host, &msg);
    assert_eq!(result.status_code, StatusCode::OutOfGas);
    assert_eq!(result.gas_left, 0);
}
