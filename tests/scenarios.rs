//! End-to-end execution scenarios: termination paths, traps and
//! validation rejections.

mod common;

use common::{execute_wat, MockHost};
use ewasm_jit::{Message, StatusCode};

#[test]
fn empty_finish_succeeds_with_no_output() {
    let source = r#"(module
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (call $finish (i32.const 0) (i32.const 0))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::Success);
    assert!(result.output.is_empty());
}

#[test]
fn revert_returns_the_written_bytes() {
    // 0xEFBEADDE little-endian lays down DE AD BE EF.
    let source = r#"(module
      (import "ethereum" "revert" (func $revert (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (i32.store (i32.const 0) (i32.const 0xEFBEADDE))
        (call $revert (i32.const 0) (i32.const 4))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::Revert);
    assert_eq!(result.output, [0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn burning_gas_in_a_loop_runs_out() {
    let source = r#"(module
      (import "ethereum" "useGas" (func $useGas (param i64)))
      (memory (export "memory") 1)
      (func (export "main") (local i32)
        (loop $burn
          (call $useGas (i64.const 1000000))
          (br $burn))))"#;
    let mut host = MockHost::new();
    let msg = Message {
        gas: 10,
        ..Message::default()
    };
    let result = execute_wat(source, &mut host, &msg);
    assert_eq!(result.status_code, StatusCode::OutOfGas);
    assert_eq!(result.gas_left, 0);
    assert!(result.output.is_empty());
}

#[test]
fn indirect_call_with_wrong_type_traps() {
    let source = r#"(module
      (type $takes_i32 (func (param i32)))
      (memory (export "memory") 1)
      (table 1 funcref)
      (elem (i32.const 0) $nullary)
      (func $nullary)
      (func (export "main")
        (call_indirect (type $takes_i32) (i32.const 42) (i32.const 0))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::Failure);
}

#[test]
fn indirect_call_out_of_range_traps() {
    let source = r#"(module
      (type $nullary (func))
      (memory (export "memory") 1)
      (table 1 funcref)
      (elem (i32.const 0) $f)
      (func $f)
      (func (export "main")
        (call_indirect (type $nullary) (i32.const 5))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::Failure);
}

#[test]
fn indirect_call_through_a_matching_slot_works() {
    let source = r#"(module
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (type $producer (func (result i32)))
      (memory (export "memory") 1)
      (table 2 funcref)
      (elem (i32.const 1) $forty_two)
      (func $forty_two (result i32) (i32.const 42))
      (func (export "main")
        (i32.store (i32.const 0)
          (call_indirect (type $producer) (i32.const 1)))
        (call $finish (i32.const 0) (i32.const 4))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(result.output, 42i32.to_le_bytes());
}

#[test]
fn uninitialized_table_slot_traps() {
    let source = r#"(module
      (type $nullary (func))
      (memory (export "memory") 1)
      (table 2 funcref)
      (elem (i32.const 0) $f)
      (func $f)
      (func (export "main")
        (call_indirect (type $nullary) (i32.const 1))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::Failure);
}

#[test]
fn division_by_zero_traps() {
    let source = r#"(module
      (memory (export "memory") 1)
      (func (export "main")
        (drop (i32.div_s (i32.const 1) (i32.const 0)))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::Failure);
}

#[test]
fn start_functions_fail_validation() {
    let source = r#"(module
      (memory (export "memory") 1)
      (func $init)
      (start $init)
      (func (export "main")))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::ContractValidationFailure);
}

#[test]
fn missing_main_fails_validation() {
    let source = r#"(module (memory (export "memory") 1))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::ContractValidationFailure);
}

#[test]
fn main_with_parameters_fails_validation() {
    let source = r#"(module
      (memory (export "memory") 1)
      (func (export "main") (param i32)))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::ContractValidationFailure);
}

#[test]
fn missing_memory_export_fails_validation() {
    let source = r#"(module
      (memory 1)
      (func (export "main")))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::ContractValidationFailure);
}

#[test]
fn non_wasm_bytecode_fails_validation() {
    let mut host = MockHost::new();
    let mut engine = ewasm_jit::JitEngine::new();
    use ewasm_jit::WasmEngine;
    let result = engine.execute(
        &mut host,
        b"\x60\x60\x60\x40",
        b"\x60\x60\x60\x40",
        &Message::default(),
        false,
    );
    assert_eq!(result.status_code, StatusCode::ContractValidationFailure);
}

#[test]
fn wrong_wasm_version_fails_validation() {
    let mut host = MockHost::new();
    let mut engine = ewasm_jit::JitEngine::new();
    use ewasm_jit::WasmEngine;
    let result = engine.execute(
        &mut host,
        b"\0asm\x02\0\0\0",
        b"\0asm\x02\0\0\0",
        &Message::default(),
        false,
    );
    assert_eq!(result.status_code, StatusCode::ContractValidationFailure);
}

#[test]
fn plain_return_is_success_with_empty_output() {
    let source = r#"(module
      (memory (export "memory") 1)
      (func (export "main")))"#;
    let mut host = MockHost::new();
    let msg = Message {
        gas: 5000,
        ..Message::default()
    };
    let result = execute_wat(source, &mut host, &msg);
    assert_eq!(result.status_code, StatusCode::Success);
    assert_eq!(result.gas_left, 5000);
    assert!(result.output.is_empty());
}

#[test]
fn unreachable_traps() {
    let source = r#"(module
      (memory (export "memory") 1)
      (func (export "main") (unreachable)))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::Failure);
}

#[test]
fn runaway_recursion_exhausts_the_call_depth_budget() {
    let source = r#"(module
      (memory (export "memory") 1)
      (func $spin (call $spin))
      (func (export "main") (call $spin)))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::Failure);
}

#[test]
fn out_of_bounds_load_is_an_invalid_memory_access() {
    let source = r#"(module
      (memory (export "memory") 1)
      (func (export "main")
        (drop (i32.load (i32.const 65536)))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::InvalidMemoryAccess);
}

#[test]
fn out_of_bounds_store_offset_is_caught() {
    // 65533 + 4-byte access crosses the one-page boundary.
    let source = r#"(module
      (memory (export "memory") 1)
      (func (export "main")
        (i32.store (i32.const 65533) (i32.const 7))))"#;
    let mut host = MockHost::new();
    let result = execute_wat(source, &mut host, &Message::default());
    assert_eq!(result.status_code, StatusCode::InvalidMemoryAccess);
}

#[test]
fn repeated_execution_reuses_the_cached_module() {
    let source = r#"(module
      (import "ethereum" "finish" (func $finish (param i32 i32)))
      (memory (export "memory") 1)
      (func (export "main")
        (i32.store (i32.const 0) (i32.const 7))
        (call $finish (i32.const 0) (i32.const 4))))"#;
    let wasm = wat::parse_str(source).unwrap();
    let mut host = MockHost::new();
    let mut engine = ewasm_jit::JitEngine::new();
    use ewasm_jit::WasmEngine;
    for _ in 0..3 {
        let result = engine.execute(&mut host, &wasm, &wasm, &Message::default(), false);
        assert_eq!(result.status_code, StatusCode::Success);
        assert_eq!(result.output, 7i32.to_le_bytes());
    }
}
