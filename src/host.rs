//! The boundary the engine presents to the blockchain host.
//!
//! Everything behind [`HostInterface`] is an external collaborator:
//! account state, storage, sub-calls and transaction context live on the
//! host side. The engine only marshals data across this boundary.

/// A 160-bit account address, big-endian raw bytes.
pub type Address = [u8; 20];

/// A 256-bit word, big-endian raw bytes. Used for storage keys/values,
/// balances, hashes and difficulty.
pub type Bytes32 = [u8; 32];

/// Kind of a call message, mirroring the EVM call family.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallKind {
    Call,
    CallCode,
    DelegateCall,
    Create,
}

/// Message flag: the current frame and everything below it may not
/// mutate state.
pub const MSG_STATIC: u32 = 1;

/// One call frame's worth of input, as handed over by the host.
#[derive(Clone, Debug)]
pub struct Message {
    pub kind: CallKind,
    pub flags: u32,
    pub depth: i32,
    pub gas: i64,
    pub destination: Address,
    pub sender: Address,
    pub input: Vec<u8>,
    pub value: Bytes32,
}

impl Message {
    pub fn is_static(&self) -> bool {
        self.flags & MSG_STATIC != 0
    }
}

impl Default for Message {
    fn default() -> Self {
        Self {
            kind: CallKind::Call,
            flags: 0,
            depth: 0,
            gas: i64::MAX,
            destination: [0; 20],
            sender: [0; 20],
            input: Vec::new(),
            value: [0; 32],
        }
    }
}

/// Status of a sub-call as reported by the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Failure,
    Revert,
}

/// Outcome of a sub-call or create performed through the host.
#[derive(Clone, Debug)]
pub struct CallResult {
    pub status: CallStatus,
    pub gas_left: i64,
    pub output: Vec<u8>,
    /// Address of the created contract, for successful creates.
    pub create_address: Address,
}

impl CallResult {
    pub fn failure() -> Self {
        Self {
            status: CallStatus::Failure,
            gas_left: 0,
            output: Vec::new(),
            create_address: [0; 20],
        }
    }
}

/// Per-transaction and per-block context values.
#[derive(Clone, Debug, Default)]
pub struct TxContext {
    pub tx_gas_price: Bytes32,
    pub tx_origin: Address,
    pub block_coinbase: Address,
    pub block_number: i64,
    pub block_timestamp: i64,
    pub block_gas_limit: i64,
    pub block_difficulty: Bytes32,
}

/// Effect of a storage store, used for gas accounting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StorageStatus {
    /// A zero slot became non-zero.
    Added,
    /// An existing slot changed or was cleared.
    Modified,
    /// The stored value equals the current value.
    Unchanged,
}

/// Blockchain state as seen by a running contract.
///
/// Sub-calls re-enter the host: `call` is expected to dispatch the child
/// message to a fresh engine instance and to provide transactional
/// semantics (reverted or trapped children leave no state changes).
pub trait HostInterface {
    fn account_exists(&mut self, address: &Address) -> bool;
    fn get_storage(&mut self, address: &Address, key: &Bytes32) -> Bytes32;
    fn set_storage(&mut self, address: &Address, key: &Bytes32, value: &Bytes32) -> StorageStatus;
    fn get_balance(&mut self, address: &Address) -> Bytes32;
    fn get_code_size(&mut self, address: &Address) -> usize;
    /// Copy code of `address` starting at `offset` into `buf`; returns
    /// the number of bytes copied.
    fn copy_code(&mut self, address: &Address, offset: usize, buf: &mut [u8]) -> usize;
    fn selfdestruct(&mut self, address: &Address, beneficiary: &Address);
    fn call(&mut self, msg: &Message) -> CallResult;
    fn get_tx_context(&mut self) -> TxContext;
    fn get_block_hash(&mut self, number: i64) -> Bytes32;
    fn emit_log(&mut self, address: &Address, data: &[u8], topics: &[Bytes32]);
}

pub(crate) fn is_zero(word: &Bytes32) -> bool {
    word.iter().all(|b| *b == 0)
}
