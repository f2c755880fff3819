//! The embedder-facing VM object.
//!
//! Owns the engine backend and the configuration surface: EVM1 handling
//! modes, sentinel metering, system-contract preloads and benchmarking.
//! `execute` is the single entry point per message.

use crate::engine::{self, create_engine, has_wasm_preamble, wasm_version, WasmEngine};
use crate::error::{ExecutionResult, StatusCode, VmError};
use crate::host::{Address, CallKind, CallStatus, HostInterface, Message, MSG_STATIC};
use indexmap::IndexMap;

/// How non-WebAssembly (EVM1) bytecode is handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Evm1Mode {
    /// Fail the invocation.
    Reject,
    /// Report `rejected` so the client falls back to its own EVM.
    Fallback,
    /// Transcompile through the evm2wasm system contract.
    Evm2Wasm,
    /// Interpret through the preloaded runevm contract.
    Runevm,
}

/// Outcome of [`Vm::set_option`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetOptionResult {
    Success,
    InvalidName,
    InvalidValue,
}

fn system_address(low_byte: u8) -> Address {
    let mut address = [0u8; 20];
    address[19] = low_byte;
    address
}

/// Address of the sentinel metering contract.
pub fn sentinel_address() -> Address {
    system_address(0x0a)
}

/// Address of the evm2wasm transcompiler contract.
pub fn evm2wasm_address() -> Address {
    system_address(0x0b)
}

/// Address of the runevm interpreter contract.
pub fn runevm_address() -> Address {
    system_address(0x0c)
}

/// The VM instance handed to the embedder.
pub struct Vm {
    engine: Box<dyn WasmEngine>,
    evm1mode: Evm1Mode,
    metering: bool,
    preloads: IndexMap<Address, Vec<u8>>,
}

impl Vm {
    pub fn new() -> Self {
        Self {
            engine: create_engine("jit").expect("built-in backend"),
            evm1mode: Evm1Mode::Reject,
            metering: false,
            preloads: IndexMap::new(),
        }
    }

    /// Recognized options: `evm1mode`, `metering`, `engine`,
    /// `benchmark` and `sys:<alias-or-hex-address>`.
    pub fn set_option(&mut self, name: &str, value: &str) -> SetOptionResult {
        match name {
            "evm1mode" => {
                self.evm1mode = match value {
                    "reject" => Evm1Mode::Reject,
                    "fallback" => Evm1Mode::Fallback,
                    "evm2wasm" => Evm1Mode::Evm2Wasm,
                    "runevm" => Evm1Mode::Runevm,
                    _ => return SetOptionResult::InvalidValue,
                };
                SetOptionResult::Success
            }
            "metering" => {
                match value {
                    "true" => self.metering = true,
                    "false" => self.metering = false,
                    _ => return SetOptionResult::InvalidValue,
                }
                SetOptionResult::Success
            }
            "benchmark" => {
                if value == "true" {
                    engine::enable_benchmarking();
                    SetOptionResult::Success
                } else {
                    SetOptionResult::InvalidValue
                }
            }
            "engine" => match create_engine(value) {
                Some(engine) => {
                    self.engine = engine;
                    SetOptionResult::Success
                }
                None => SetOptionResult::InvalidValue,
            },
            _ if name.starts_with("sys:") => self.set_sys_option(&name[4..], value),
            _ => SetOptionResult::InvalidName,
        }
    }

    fn set_sys_option(&mut self, name: &str, path: &str) -> SetOptionResult {
        let address = if let Some(hex) = name.strip_prefix("0x") {
            match parse_hex_address(hex) {
                Some(address) => address,
                None => {
                    log::debug!("failed to parse system contract address {name}");
                    return SetOptionResult::InvalidValue;
                }
            }
        } else {
            match name {
                "sentinel" => sentinel_address(),
                "evm2wasm" => evm2wasm_address(),
                "runevm" => runevm_address(),
                _ => {
                    log::debug!("unknown system contract alias {name}");
                    return SetOptionResult::InvalidValue;
                }
            }
        };
        let contents = match std::fs::read(path) {
            Ok(contents) if !contents.is_empty() => contents,
            _ => {
                log::debug!("failed to load contract source from {path}");
                return SetOptionResult::InvalidValue;
            }
        };
        log::debug!("loaded {} bytes of contract for {name}", contents.len());
        self.preloads.insert(address, contents);
        SetOptionResult::Success
    }

    /// Execute one message against `code`.
    pub fn execute(
        &mut self,
        host: &mut dyn HostInterface,
        msg: &Message,
        code: &[u8],
    ) -> ExecutionResult {
        match self.execute_inner(host, msg, code) {
            Ok(result) => result,
            Err(err) => {
                log::debug!("{err}");
                ExecutionResult::failure(err.status())
            }
        }
    }

    fn execute_inner(
        &mut self,
        host: &mut dyn HostInterface,
        msg: &Message,
        code: &[u8],
    ) -> Result<ExecutionResult, VmError> {
        if msg.gas < 0 {
            return Err(VmError::InternalError(
                "negative startgas supplied".to_string(),
            ));
        }

        let mut meter_interface_gas = true;

        // The bytecode residing in state; interface methods such as
        // codeCopy observe this even when the executable code below is
        // substituted.
        let state_code = code;
        let mut run_code: Vec<u8> = match self.preloads.get(&msg.destination) {
            Some(preload) => {
                log::debug!("overriding contract for destination");
                preload.clone()
            }
            None => code.to_vec(),
        };

        let is_wasm = has_wasm_preamble(&run_code);
        if !is_wasm {
            match self.evm1mode {
                Evm1Mode::Reject => {
                    log::debug!("non-WebAssembly input, failure");
                    return Ok(ExecutionResult::failure(StatusCode::Failure));
                }
                Evm1Mode::Fallback => {
                    log::debug!("non-WebAssembly input, deferring to the client");
                    return Ok(ExecutionResult::failure(StatusCode::Rejected));
                }
                Evm1Mode::Evm2Wasm => {
                    run_code = self.evm2wasm(host, &run_code)?;
                    if run_code.len() <= 8 {
                        return Err(VmError::ContractValidationFailure(
                            "transcompiling via evm2wasm failed".to_string(),
                        ));
                    }
                }
                Evm1Mode::Runevm => {
                    run_code = self.runevm(host)?;
                    if run_code.len() <= 8 {
                        return Err(VmError::ContractValidationFailure(
                            "interpreting via runevm failed".to_string(),
                        ));
                    }
                    // Runevm meters interface calls on its own.
                    meter_interface_gas = false;
                }
            }
        }

        if wasm_version(&run_code) != Some(1) {
            return Err(VmError::ContractValidationFailure(
                "contract has an invalid WebAssembly version".to_string(),
            ));
        }

        if msg.kind == CallKind::Create && is_wasm && self.metering {
            run_code = self.sentinel(host, &run_code)?;
            if !has_wasm_preamble(&run_code) || wasm_version(&run_code) != Some(1) {
                return Err(VmError::ContractValidationFailure(
                    "invalid contract or metering failed".to_string(),
                ));
            }
        }

        let mut result = if msg.kind == CallKind::Create {
            if !msg.input.is_empty() {
                return Err(VmError::ContractValidationFailure(
                    "create must carry no input".to_string(),
                ));
            }
            // Deployment: the code itself is the deployed artifact.
            ExecutionResult::new(StatusCode::Success, msg.gas, run_code)
        } else {
            let result = self
                .engine
                .execute(host, &run_code, state_code, msg, meter_interface_gas);
            if result.gas_left < 0 {
                return Err(VmError::InternalError(
                    "negative gas left after execution".to_string(),
                ));
            }
            result
        };

        // Meter deployed WebAssembly return values of a create.
        if msg.kind == CallKind::Create
            && !result.is_revert()
            && has_wasm_preamble(&result.output)
        {
            if wasm_version(&result.output) != Some(1) {
                return Err(VmError::ContractValidationFailure(
                    "deployed contract has an invalid WebAssembly version".to_string(),
                ));
            }
            if self.metering {
                let metered = self.sentinel(host, &result.output)?;
                result.output = metered;
                if !has_wasm_preamble(&result.output) || wasm_version(&result.output) != Some(1)
                {
                    return Err(VmError::ContractValidationFailure(
                        "invalid contract or metering failed".to_string(),
                    ));
                }
            }
        }

        Ok(result)
    }

    /// Run the sentinel over `input`, returning the validated and
    /// metered contract.
    fn sentinel(
        &mut self,
        host: &mut dyn HostInterface,
        input: &[u8],
    ) -> Result<Vec<u8>, VmError> {
        log::debug!("metering contract ({} bytes)", input.len());
        let (status, output) = call_system_contract(host, sentinel_address(), input);
        if status != CallStatus::Success {
            return Err(VmError::ContractValidationFailure(
                "sentinel has failed on contract, it is invalid".to_string(),
            ));
        }
        Ok(output)
    }

    /// Transcompile EVM1 bytecode through the evm2wasm contract.
    fn evm2wasm(
        &mut self,
        host: &mut dyn HostInterface,
        input: &[u8],
    ) -> Result<Vec<u8>, VmError> {
        log::debug!("calling evm2wasm ({} bytes)", input.len());
        let (status, output) = call_system_contract(host, evm2wasm_address(), input);
        if status != CallStatus::Success {
            return Err(VmError::ContractValidationFailure(
                "evm2wasm has failed".to_string(),
            ));
        }
        Ok(output)
    }

    /// Execute the preloaded runevm contract locally and return the
    /// interpreter module it produces.
    fn runevm(&mut self, host: &mut dyn HostInterface) -> Result<Vec<u8>, VmError> {
        let code = self
            .preloads
            .get(&runevm_address())
            .cloned()
            .ok_or_else(|| {
                VmError::ContractValidationFailure("runevm contract not preloaded".to_string())
            })?;
        log::debug!("calling runevm ({} bytes)", code.len());
        let msg = Message {
            kind: CallKind::Call,
            flags: MSG_STATIC,
            depth: 0,
            gas: i64::MAX,
            destination: runevm_address(),
            sender: [0; 20],
            input: Vec::new(),
            value: [0; 32],
        };
        let mut engine = create_engine("jit").expect("built-in backend");
        let result = engine.execute(host, &code, &code, &msg, false);
        if result.status_code != StatusCode::Success {
            return Err(VmError::ContractValidationFailure(
                "runevm has failed".to_string(),
            ));
        }
        if result.output.is_empty() {
            return Err(VmError::ContractValidationFailure(
                "runevm returned empty".to_string(),
            ));
        }
        if !has_wasm_preamble(&result.output) {
            return Err(VmError::ContractValidationFailure(
                "runevm result has no wasm preamble".to_string(),
            ));
        }
        Ok(result.output)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Static call into a system contract with unlimited gas; metering of
/// the system contracts themselves is not charged to the caller.
fn call_system_contract(
    host: &mut dyn HostInterface,
    address: Address,
    input: &[u8],
) -> (CallStatus, Vec<u8>) {
    let msg = Message {
        kind: CallKind::Call,
        flags: MSG_STATIC,
        depth: 0,
        gas: i64::MAX,
        destination: address,
        sender: [0; 20],
        input: input.to_vec(),
        value: [0; 32],
    };
    let result = host.call(&msg);
    let output = if result.status == CallStatus::Success {
        result.output
    } else {
        Vec::new()
    };
    (result.status, output)
}

fn parse_hex_address(hex: &str) -> Option<Address> {
    if hex.len() != 40 {
        return None;
    }
    let mut address = [0u8; 20];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let high = (chunk[0] as char).to_digit(16)?;
        let low = (chunk[1] as char).to_digit(16)?;
        address[i] = (high * 16 + low) as u8;
    }
    Some(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_addresses_parse() {
        assert_eq!(
            parse_hex_address("000000000000000000000000000000000000000a"),
            Some(sentinel_address())
        );
        assert_eq!(parse_hex_address("0a"), None);
        assert_eq!(
            parse_hex_address("zz0000000000000000000000000000000000000a"),
            None
        );
    }

    #[test]
    fn unknown_options_are_rejected() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.set_option("no-such-option", "1"),
            SetOptionResult::InvalidName
        );
        assert_eq!(
            vm.set_option("evm1mode", "bogus"),
            SetOptionResult::InvalidValue
        );
        assert_eq!(
            vm.set_option("evm1mode", "fallback"),
            SetOptionResult::Success
        );
        assert_eq!(vm.set_option("metering", "true"), SetOptionResult::Success);
        assert_eq!(
            vm.set_option("engine", "no-such-backend"),
            SetOptionResult::InvalidValue
        );
        assert_eq!(
            vm.set_option("sys:not-an-alias", "/nonexistent"),
            SetOptionResult::InvalidValue
        );
    }
}
