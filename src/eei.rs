//! The Ethereum Environment Interface.
//!
//! Implements every function of the `"ethereum"` import module on top of
//! the [`HostInterface`] boundary, including interface gas metering, the
//! static-mode rules and sub-call plumbing. Debug builds additionally
//! publish the `"debug"` module.

use crate::bridge::{HostArgs, HostRegistry, VmContext};
use crate::error::VmError;
use crate::host::{
    is_zero, Address, Bytes32, CallKind, CallResult, CallStatus, HostInterface, Message,
    TxContext, MSG_STATIC,
};
use crate::module::{FuncSig, ValType};

/// EVM gas schedule constants used for interface metering.
pub mod gas {
    pub const BASE: i64 = 2;
    pub const VERYLOW: i64 = 3;
    pub const COPY: i64 = 3;
    pub const BALANCE: i64 = 400;
    pub const BLOCKHASH: i64 = 800;
    pub const CALL: i64 = 700;
    pub const EXTCODE: i64 = 700;
    pub const LOG: i64 = 375;
    pub const LOG_DATA: i64 = 8;
    pub const LOG_TOPIC: i64 = 375;
    pub const STORAGE_LOAD: i64 = 200;
    pub const STORAGE_STORE_CREATE: i64 = 20000;
    pub const STORAGE_STORE_CHANGE: i64 = 5000;
    pub const CREATE: i64 = 32000;
    pub const SELFDESTRUCT: i64 = 5000;
    pub const VALUE_TRANSFER: i64 = 9000;
    pub const CALL_STIPEND: i64 = 2300;
    pub const NEW_ACCOUNT: i64 = 25000;
}

/// Maximum sub-call depth, as in the EVM.
const MAX_CALL_DEPTH: i32 = 1024;

/// Gas cost of copying `len` bytes, counted in 32-byte words.
fn copy_cost(len: u32) -> i64 {
    gas::COPY * ((len as i64 + 31) / 32)
}

/// The 63/64 rule: gas a sub-call may receive at most.
fn max_call_gas(gas: i64) -> i64 {
    gas - gas / 64
}

/// Per-invocation EEI state: the message being executed, the gas
/// counter, the result slot populated by `finish`/`revert` and the
/// return-data buffer of the last sub-call.
pub struct EthereumInterface {
    msg: Message,
    state_code: Vec<u8>,
    pub(crate) gas_left: i64,
    meter_gas: bool,
    /// Result slot: filled by `finish`/`revert`/`selfDestruct` before
    /// `EndExecution` is raised.
    pub(crate) revert: bool,
    pub(crate) output: Vec<u8>,
    last_return_data: Vec<u8>,
    tx_context: Option<TxContext>,
    host: *mut dyn HostInterface,
}

impl EthereumInterface {
    /// The host pointer must stay valid for the whole invocation; the
    /// executor guarantees this by scoping the context to one call into
    /// JITted code.
    pub(crate) fn new(
        host: &mut dyn HostInterface,
        state_code: &[u8],
        msg: Message,
        meter_gas: bool,
    ) -> Self {
        let gas_left = msg.gas;
        Self {
            msg,
            state_code: state_code.to_vec(),
            gas_left,
            meter_gas,
            revert: false,
            output: Vec::new(),
            last_return_data: Vec::new(),
            tx_context: None,
            host: unsafe {
                std::mem::transmute::<&mut dyn HostInterface, &'static mut dyn HostInterface>(
                    host,
                )
            } as *mut dyn HostInterface,
        }
    }

    fn host(&mut self) -> &mut dyn HostInterface {
        unsafe { &mut *self.host }
    }

    fn tx_context(&mut self) -> TxContext {
        if self.tx_context.is_none() {
            self.tx_context = Some(self.host().get_tx_context());
        }
        self.tx_context.clone().unwrap()
    }

    fn take_gas(&mut self, amount: i64) -> Result<(), VmError> {
        if amount > self.gas_left {
            self.gas_left = 0;
            return Err(VmError::OutOfGas);
        }
        self.gas_left -= amount;
        Ok(())
    }

    fn take_interface_gas(&mut self, amount: i64) -> Result<(), VmError> {
        if !self.meter_gas {
            return Ok(());
        }
        self.take_gas(amount)
    }

    fn ensure_not_static(&self, name: &'static str) -> Result<(), VmError> {
        if self.msg.is_static() {
            return Err(VmError::StaticModeViolation(name));
        }
        Ok(())
    }
}

/// 128-bit little-endian encoding used for balances, call values and gas
/// prices. Values that do not fit 128 bits are out of range.
fn u128_from_word(word: &Bytes32, what: &str) -> Result<u128, VmError> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(VmError::ArgumentOutOfRange(format!(
            "{what} does not fit into 128 bits"
        )));
    }
    let mut be = [0u8; 16];
    be.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(be))
}

impl VmContext {
    fn check_bounds(&mut self, offset: u32, len: u32) -> Result<(), VmError> {
        let end = offset as u64 + len as u64;
        if end > self.memory().size() as u64 {
            return Err(VmError::InvalidMemoryAccess(format!(
                "memory range {offset}..{end} exceeds {} bytes",
                self.memory().size()
            )));
        }
        Ok(())
    }

    fn mem_read(&mut self, offset: u32, len: u32) -> Result<Vec<u8>, VmError> {
        self.check_bounds(offset, len)?;
        let start = offset as usize;
        Ok(self.memory().as_slice()[start..start + len as usize].to_vec())
    }

    fn mem_write(&mut self, offset: u32, data: &[u8]) -> Result<(), VmError> {
        self.check_bounds(offset, data.len() as u32)?;
        let start = offset as usize;
        self.memory().as_mut_slice()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn load_address(&mut self, offset: u32) -> Result<Address, VmError> {
        let bytes = self.mem_read(offset, 20)?;
        let mut address = [0u8; 20];
        address.copy_from_slice(&bytes);
        Ok(address)
    }

    fn store_address(&mut self, address: &Address, offset: u32) -> Result<(), VmError> {
        self.mem_write(offset, address)
    }

    fn load_word(&mut self, offset: u32) -> Result<Bytes32, VmError> {
        let bytes = self.mem_read(offset, 32)?;
        let mut word = [0u8; 32];
        word.copy_from_slice(&bytes);
        Ok(word)
    }

    fn store_word(&mut self, word: &Bytes32, offset: u32) -> Result<(), VmError> {
        self.mem_write(offset, word)
    }

    /// Read a 128-bit little-endian value from contract memory.
    fn load_u128(&mut self, offset: u32) -> Result<u128, VmError> {
        let bytes = self.mem_read(offset, 16)?;
        let mut le = [0u8; 16];
        le.copy_from_slice(&bytes);
        Ok(u128::from_le_bytes(le))
    }

    /// Write a 256-bit word as a 128-bit little-endian value; fails when
    /// it exceeds 128 bits.
    fn store_u128(&mut self, word: &Bytes32, offset: u32, what: &str) -> Result<(), VmError> {
        let value = u128_from_word(word, what)?;
        self.mem_write(offset, &value.to_le_bytes())
    }

    /// Write a 256-bit word little-endian (used for block difficulty).
    fn store_u256_le(&mut self, word: &Bytes32, offset: u32) -> Result<(), VmError> {
        let mut le = *word;
        le.reverse();
        self.mem_write(offset, &le)
    }

    /// Copy `length` bytes of `source` starting at `source_offset` into
    /// contract memory at `result_offset`. Source overruns are invalid
    /// memory accesses, as in the reference EEI.
    fn copy_to_memory(
        &mut self,
        source: &[u8],
        source_offset: u32,
        result_offset: u32,
        length: u32,
    ) -> Result<(), VmError> {
        let end = source_offset as u64 + length as u64;
        if end > source.len() as u64 {
            return Err(VmError::InvalidMemoryAccess(
                "out of bounds source copy".to_string(),
            ));
        }
        let start = source_offset as usize;
        let data = source[start..start + length as usize].to_vec();
        self.mem_write(result_offset, &data)
    }

    /// Current contract's balance as a 128-bit value; values above 128
    /// bits trivially cover any transferable amount.
    fn own_balance_covers(&mut self, value: u128) -> bool {
        let destination = self.eei.msg.destination;
        let balance = self.eei.host().get_balance(&destination);
        if balance[..16].iter().any(|b| *b != 0) {
            return true;
        }
        let mut be = [0u8; 16];
        be.copy_from_slice(&balance[16..]);
        u128::from_be_bytes(be) >= value
    }

    fn do_call(
        &mut self,
        kind: CallKind,
        is_static_call: bool,
        gas: i64,
        address_offset: u32,
        value_offset: Option<u32>,
        data_offset: u32,
        data_length: u32,
    ) -> Result<u64, VmError> {
        self.eei.take_interface_gas(gas::CALL)?;
        let address = self.load_address(address_offset)?;
        let value = match value_offset {
            Some(offset) => self.load_u128(offset)?,
            None => 0,
        };
        if kind == CallKind::Call && self.eei.msg.is_static() && value != 0 {
            return Err(VmError::StaticModeViolation("call"));
        }
        if gas < 0 {
            return Err(VmError::ArgumentOutOfRange(
                "negative call gas".to_string(),
            ));
        }
        if value != 0 {
            self.eei.take_interface_gas(gas::VALUE_TRANSFER)?;
            if kind == CallKind::Call && !self.eei.host().account_exists(&address) {
                self.eei.take_interface_gas(gas::NEW_ACCOUNT)?;
            }
        }
        if self.eei.msg.depth >= MAX_CALL_DEPTH {
            return Ok(1);
        }
        if value != 0 && !self.own_balance_covers(value) {
            return Ok(1);
        }
        let input = self.mem_read(data_offset, data_length)?;

        let child_gas = gas.min(max_call_gas(self.eei.gas_left));
        self.eei.take_gas(child_gas)?;
        let stipend = if value != 0 { gas::CALL_STIPEND } else { 0 };

        let parent = &self.eei.msg;
        let mut value_word = [0u8; 32];
        value_word[16..].copy_from_slice(&value.to_be_bytes());
        let child = Message {
            kind,
            flags: parent.flags | if is_static_call { MSG_STATIC } else { 0 },
            depth: parent.depth + 1,
            gas: child_gas + stipend,
            destination: address,
            sender: match kind {
                CallKind::DelegateCall => parent.sender,
                _ => parent.destination,
            },
            input,
            value: match kind {
                CallKind::DelegateCall => parent.value,
                _ => value_word,
            },
        };

        let result = self.eei.host().call(&child);
        self.eei.last_return_data = result.output.clone();
        self.eei.gas_left += result.gas_left;
        Ok(call_status_code(&result))
    }

    fn do_create(
        &mut self,
        value_offset: u32,
        data_offset: u32,
        data_length: u32,
        result_offset: u32,
    ) -> Result<u64, VmError> {
        self.eei.ensure_not_static("create")?;
        self.eei.take_interface_gas(gas::CREATE)?;
        let value = self.load_u128(value_offset)?;
        if self.eei.msg.depth >= MAX_CALL_DEPTH {
            return Ok(1);
        }
        if value != 0 && !self.own_balance_covers(value) {
            return Ok(1);
        }
        let init_code = self.mem_read(data_offset, data_length)?;

        let child_gas = max_call_gas(self.eei.gas_left);
        self.eei.take_gas(child_gas)?;

        let parent = &self.eei.msg;
        let mut value_word = [0u8; 32];
        value_word[16..].copy_from_slice(&value.to_be_bytes());
        let child = Message {
            kind: CallKind::Create,
            flags: parent.flags,
            depth: parent.depth + 1,
            gas: child_gas,
            destination: [0; 20],
            sender: parent.destination,
            input: init_code,
            value: value_word,
        };

        let result = self.eei.host().call(&child);
        self.eei.gas_left += result.gas_left;
        match result.status {
            CallStatus::Success => {
                self.eei.last_return_data.clear();
                self.store_address(&result.create_address, result_offset)?;
                Ok(0)
            }
            CallStatus::Revert => {
                self.eei.last_return_data = result.output;
                Ok(2)
            }
            CallStatus::Failure => {
                self.eei.last_return_data.clear();
                Ok(1)
            }
        }
    }
}

fn call_status_code(result: &CallResult) -> u64 {
    match result.status {
        CallStatus::Success => 0,
        CallStatus::Failure => 1,
        CallStatus::Revert => 2,
    }
}

// Host handlers. Each reads its Wasm arguments positionally and widens
// the result to 64 bits; the declared signatures live in `register_eei`.

fn use_gas(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    let amount = args.as_i64(0);
    if amount < 0 {
        return Err(VmError::ArgumentOutOfRange("negative gas".to_string()));
    }
    ctx.eei.take_gas(amount)?;
    Ok(0)
}

fn get_gas_left(ctx: &mut VmContext, _args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    Ok(ctx.eei.gas_left as u64)
}

fn get_address(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    let destination = ctx.eei.msg.destination;
    ctx.store_address(&destination, args.as_i32(0))?;
    Ok(0)
}

fn get_external_balance(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BALANCE)?;
    let address = ctx.load_address(args.as_i32(0))?;
    let balance = ctx.eei.host().get_balance(&address);
    ctx.store_u128(&balance, args.as_i32(1), "account balance")?;
    Ok(0)
}

fn get_block_hash(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BLOCKHASH)?;
    let hash = ctx.eei.host().get_block_hash(args.as_i64(0));
    if is_zero(&hash) {
        return Ok(1);
    }
    ctx.store_word(&hash, args.as_i32(1))?;
    Ok(0)
}

fn get_call_data_size(ctx: &mut VmContext, _args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    Ok(ctx.eei.msg.input.len() as u64)
}

fn call_data_copy(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    let (result_offset, data_offset, length) = (args.as_i32(0), args.as_i32(1), args.as_i32(2));
    ctx.eei.take_interface_gas(gas::VERYLOW + copy_cost(length))?;
    let input = ctx.eei.msg.input.clone();
    ctx.copy_to_memory(&input, data_offset, result_offset, length)?;
    Ok(0)
}

fn get_caller(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    let sender = ctx.eei.msg.sender;
    ctx.store_address(&sender, args.as_i32(0))?;
    Ok(0)
}

fn get_call_value(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    let value = ctx.eei.msg.value;
    ctx.store_u128(&value, args.as_i32(0), "call value")?;
    Ok(0)
}

fn get_code_size(ctx: &mut VmContext, _args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    Ok(ctx.eei.state_code.len() as u64)
}

fn code_copy(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    let (result_offset, code_offset, length) = (args.as_i32(0), args.as_i32(1), args.as_i32(2));
    ctx.eei.take_interface_gas(gas::VERYLOW + copy_cost(length))?;
    let code = ctx.eei.state_code.clone();
    ctx.copy_to_memory(&code, code_offset, result_offset, length)?;
    Ok(0)
}

fn get_external_code_size(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::EXTCODE)?;
    let address = ctx.load_address(args.as_i32(0))?;
    Ok(ctx.eei.host().get_code_size(&address) as u64)
}

fn external_code_copy(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    let (address_offset, result_offset) = (args.as_i32(0), args.as_i32(1));
    let (code_offset, length) = (args.as_i32(2), args.as_i32(3));
    ctx.eei
        .take_interface_gas(gas::EXTCODE + copy_cost(length))?;
    let address = ctx.load_address(address_offset)?;
    let mut buf = vec![0u8; length as usize];
    let copied = ctx.eei.host().copy_code(&address, code_offset as usize, &mut buf);
    if copied != length as usize {
        return Err(VmError::InvalidMemoryAccess(
            "out of bounds external code copy".to_string(),
        ));
    }
    ctx.mem_write(result_offset, &buf)?;
    Ok(0)
}

fn get_block_coinbase(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    let coinbase = ctx.eei.tx_context().block_coinbase;
    ctx.store_address(&coinbase, args.as_i32(0))?;
    Ok(0)
}

fn get_block_difficulty(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    let difficulty = ctx.eei.tx_context().block_difficulty;
    ctx.store_u256_le(&difficulty, args.as_i32(0))?;
    Ok(0)
}

fn get_block_gas_limit(ctx: &mut VmContext, _args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    Ok(ctx.eei.tx_context().block_gas_limit as u64)
}

fn get_tx_gas_price(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    let price = ctx.eei.tx_context().tx_gas_price;
    ctx.store_u128(&price, args.as_i32(0), "transaction gas price")?;
    Ok(0)
}

fn emit_log(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.ensure_not_static("log")?;
    let (data_offset, length, topic_count) = (args.as_i32(0), args.as_i32(1), args.as_i32(2));
    if topic_count > 4 {
        return Err(VmError::ArgumentOutOfRange(
            "too many log topics".to_string(),
        ));
    }
    ctx.eei.take_interface_gas(
        gas::LOG + gas::LOG_DATA * length as i64 + gas::LOG_TOPIC * topic_count as i64,
    )?;
    let mut topics = Vec::with_capacity(topic_count as usize);
    for i in 0..topic_count {
        topics.push(ctx.load_word(args.as_i32(3 + i as usize))?);
    }
    let data = ctx.mem_read(data_offset, length)?;
    let address = ctx.eei.msg.destination;
    ctx.eei.host().emit_log(&address, &data, &topics);
    Ok(0)
}

fn get_block_number(ctx: &mut VmContext, _args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    Ok(ctx.eei.tx_context().block_number as u64)
}

fn get_block_timestamp(ctx: &mut VmContext, _args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    Ok(ctx.eei.tx_context().block_timestamp as u64)
}

fn get_tx_origin(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    let origin = ctx.eei.tx_context().tx_origin;
    ctx.store_address(&origin, args.as_i32(0))?;
    Ok(0)
}

fn storage_store(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.ensure_not_static("storageStore")?;
    let key = ctx.load_word(args.as_i32(0))?;
    let value = ctx.load_word(args.as_i32(1))?;
    let destination = ctx.eei.msg.destination;
    let current = ctx.eei.host().get_storage(&destination, &key);
    let cost = if is_zero(&current) && !is_zero(&value) {
        gas::STORAGE_STORE_CREATE
    } else {
        gas::STORAGE_STORE_CHANGE
    };
    ctx.eei.take_interface_gas(cost)?;
    let status = ctx.eei.host().set_storage(&destination, &key, &value);
    log::trace!(
        "storageStore {:02x?} -> {:?}",
        &key[28..],
        status
    );
    Ok(0)
}

fn storage_load(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::STORAGE_LOAD)?;
    let key = ctx.load_word(args.as_i32(0))?;
    let destination = ctx.eei.msg.destination;
    let value = ctx.eei.host().get_storage(&destination, &key);
    ctx.store_word(&value, args.as_i32(1))?;
    Ok(0)
}

fn finish(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    let data = ctx.mem_read(args.as_i32(0), args.as_i32(1))?;
    ctx.eei.revert = false;
    ctx.eei.output = data;
    Err(VmError::EndExecution)
}

fn revert(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    let data = ctx.mem_read(args.as_i32(0), args.as_i32(1))?;
    ctx.eei.revert = true;
    ctx.eei.output = data;
    Err(VmError::EndExecution)
}

fn get_return_data_size(ctx: &mut VmContext, _args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.take_interface_gas(gas::BASE)?;
    Ok(ctx.eei.last_return_data.len() as u64)
}

fn return_data_copy(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    let (result_offset, data_offset, length) = (args.as_i32(0), args.as_i32(1), args.as_i32(2));
    ctx.eei.take_interface_gas(gas::VERYLOW + copy_cost(length))?;
    let data = ctx.eei.last_return_data.clone();
    ctx.copy_to_memory(&data, data_offset, result_offset, length)?;
    Ok(0)
}

fn call(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.do_call(
        CallKind::Call,
        false,
        args.as_i64(0),
        args.as_i32(1),
        Some(args.as_i32(2)),
        args.as_i32(3),
        args.as_i32(4),
    )
}

fn call_code(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.do_call(
        CallKind::CallCode,
        false,
        args.as_i64(0),
        args.as_i32(1),
        Some(args.as_i32(2)),
        args.as_i32(3),
        args.as_i32(4),
    )
}

fn call_delegate(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.do_call(
        CallKind::DelegateCall,
        false,
        args.as_i64(0),
        args.as_i32(1),
        None,
        args.as_i32(2),
        args.as_i32(3),
    )
}

fn call_static(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.do_call(
        CallKind::Call,
        true,
        args.as_i64(0),
        args.as_i32(1),
        None,
        args.as_i32(2),
        args.as_i32(3),
    )
}

fn create(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.do_create(
        args.as_i32(0),
        args.as_i32(1),
        args.as_i32(2),
        args.as_i32(3),
    )
}

fn self_destruct(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    ctx.eei.ensure_not_static("selfDestruct")?;
    let beneficiary = ctx.load_address(args.as_i32(0))?;
    if !ctx.eei.host().account_exists(&beneficiary) {
        ctx.eei.take_interface_gas(gas::NEW_ACCOUNT)?;
    }
    ctx.eei.take_interface_gas(gas::SELFDESTRUCT)?;
    let destination = ctx.eei.msg.destination;
    ctx.eei.host().selfdestruct(&destination, &beneficiary);
    ctx.eei.revert = false;
    ctx.eei.output.clear();
    Err(VmError::EndExecution)
}

// Debug-build helpers published under the "debug" module.

fn debug_print32(_ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    log::debug!("debug.print32: {}", args.as_i32(0) as i32);
    Ok(0)
}

fn debug_print64(_ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    log::debug!("debug.print64: {}", args.as_i64(0));
    Ok(0)
}

fn debug_print_mem(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    let data = ctx.mem_read(args.as_i32(0), args.as_i32(1))?;
    log::debug!("debug.printMem: {}", String::from_utf8_lossy(&data));
    Ok(0)
}

fn debug_print_mem_hex(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    let data = ctx.mem_read(args.as_i32(0), args.as_i32(1))?;
    let hex: String = data.iter().map(|b| format!("{b:02x}")).collect();
    log::debug!("debug.printMemHex: {hex}");
    Ok(0)
}

fn debug_print_storage(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    let key = ctx.load_word(args.as_i32(0))?;
    let destination = ctx.eei.msg.destination;
    let value = ctx.eei.host().get_storage(&destination, &key);
    log::debug!("debug.printStorage: {}", String::from_utf8_lossy(&value));
    Ok(0)
}

fn debug_print_storage_hex(ctx: &mut VmContext, args: &HostArgs) -> Result<u64, VmError> {
    let key = ctx.load_word(args.as_i32(0))?;
    let destination = ctx.eei.msg.destination;
    let value = ctx.eei.host().get_storage(&destination, &key);
    let hex: String = value.iter().map(|b| format!("{b:02x}")).collect();
    log::debug!("debug.printStorageHex: {hex}");
    Ok(0)
}

/// Register the `"ethereum"` module (and, in debug builds, `"debug"`)
/// into `registry`.
pub fn register_eei(registry: &mut HostRegistry) {
    use ValType::{I32, I64};
    let sig = |params: &[ValType], result: Option<ValType>| FuncSig::new(params.to_vec(), result);

    registry.register("ethereum", "useGas", sig(&[I64], None), use_gas);
    registry.register("ethereum", "getGasLeft", sig(&[], Some(I64)), get_gas_left);
    registry.register("ethereum", "getAddress", sig(&[I32], None), get_address);
    registry.register(
        "ethereum",
        "getExternalBalance",
        sig(&[I32, I32], None),
        get_external_balance,
    );
    registry.register(
        "ethereum",
        "getBlockHash",
        sig(&[I64, I32], Some(I32)),
        get_block_hash,
    );
    registry.register(
        "ethereum",
        "getCallDataSize",
        sig(&[], Some(I32)),
        get_call_data_size,
    );
    registry.register(
        "ethereum",
        "callDataCopy",
        sig(&[I32, I32, I32], None),
        call_data_copy,
    );
    registry.register("ethereum", "getCaller", sig(&[I32], None), get_caller);
    registry.register("ethereum", "getCallValue", sig(&[I32], None), get_call_value);
    registry.register("ethereum", "getCodeSize", sig(&[], Some(I32)), get_code_size);
    registry.register(
        "ethereum",
        "codeCopy",
        sig(&[I32, I32, I32], None),
        code_copy,
    );
    registry.register(
        "ethereum",
        "getExternalCodeSize",
        sig(&[I32], Some(I32)),
        get_external_code_size,
    );
    registry.register(
        "ethereum",
        "externalCodeCopy",
        sig(&[I32, I32, I32, I32], None),
        external_code_copy,
    );
    registry.register(
        "ethereum",
        "getBlockCoinbase",
        sig(&[I32], None),
        get_block_coinbase,
    );
    registry.register(
        "ethereum",
        "getBlockDifficulty",
        sig(&[I32], None),
        get_block_difficulty,
    );
    registry.register(
        "ethereum",
        "getBlockGasLimit",
        sig(&[], Some(I64)),
        get_block_gas_limit,
    );
    registry.register(
        "ethereum",
        "getTxGasPrice",
        sig(&[I32], None),
        get_tx_gas_price,
    );
    registry.register(
        "ethereum",
        "log",
        sig(&[I32, I32, I32, I32, I32, I32, I32], None),
        emit_log,
    );
    registry.register(
        "ethereum",
        "getBlockNumber",
        sig(&[], Some(I64)),
        get_block_number,
    );
    registry.register(
        "ethereum",
        "getBlockTimestamp",
        sig(&[], Some(I64)),
        get_block_timestamp,
    );
    registry.register("ethereum", "getTxOrigin", sig(&[I32], None), get_tx_origin);
    registry.register(
        "ethereum",
        "storageStore",
        sig(&[I32, I32], None),
        storage_store,
    );
    registry.register(
        "ethereum",
        "storageLoad",
        sig(&[I32, I32], None),
        storage_load,
    );
    registry.register("ethereum", "finish", sig(&[I32, I32], None), finish);
    registry.register("ethereum", "revert", sig(&[I32, I32], None), revert);
    registry.register(
        "ethereum",
        "getReturnDataSize",
        sig(&[], Some(I32)),
        get_return_data_size,
    );
    registry.register(
        "ethereum",
        "returnDataCopy",
        sig(&[I32, I32, I32], None),
        return_data_copy,
    );
    registry.register(
        "ethereum",
        "call",
        sig(&[I64, I32, I32, I32, I32], Some(I32)),
        call,
    );
    registry.register(
        "ethereum",
        "callCode",
        sig(&[I64, I32, I32, I32, I32], Some(I32)),
        call_code,
    );
    registry.register(
        "ethereum",
        "callDelegate",
        sig(&[I64, I32, I32, I32], Some(I32)),
        call_delegate,
    );
    registry.register(
        "ethereum",
        "callStatic",
        sig(&[I64, I32, I32, I32], Some(I32)),
        call_static,
    );
    registry.register(
        "ethereum",
        "create",
        sig(&[I32, I32, I32, I32], Some(I32)),
        create,
    );
    registry.register(
        "ethereum",
        "selfDestruct",
        sig(&[I32], None),
        self_destruct,
    );

    if cfg!(debug_assertions) {
        registry.register("debug", "print32", sig(&[I32], None), debug_print32);
        registry.register("debug", "print64", sig(&[I64], None), debug_print64);
        registry.register("debug", "printMem", sig(&[I32, I32], None), debug_print_mem);
        registry.register(
            "debug",
            "printMemHex",
            sig(&[I32, I32], None),
            debug_print_mem_hex,
        );
        registry.register(
            "debug",
            "printStorage",
            sig(&[I32], None),
            debug_print_storage,
        );
        registry.register(
            "debug",
            "printStorageHex",
            sig(&[I32], None),
            debug_print_storage_hex,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_to_u128_bounds() {
        let mut word = [0u8; 32];
        word[31] = 9;
        assert_eq!(u128_from_word(&word, "x").unwrap(), 9);
        word[0] = 1;
        assert!(matches!(
            u128_from_word(&word, "x"),
            Err(VmError::ArgumentOutOfRange(_))
        ));
    }

    #[test]
    fn copy_cost_rounds_up_to_words() {
        assert_eq!(copy_cost(0), 0);
        assert_eq!(copy_cost(1), gas::COPY);
        assert_eq!(copy_cost(32), gas::COPY);
        assert_eq!(copy_cost(33), 2 * gas::COPY);
    }

    #[test]
    fn sixty_three_sixty_fourths() {
        assert_eq!(max_call_gas(6400), 6300);
        assert_eq!(max_call_gas(0), 0);
    }
}
