//! Decoded module description.
//!
//! `ModuleInfo` is the immutable metadata extracted from one contract
//! binary. Function bodies are not stored here: the translation layer
//! streams them straight into the JIT writer, which is the only consumer.

use indexmap::IndexMap;

/// Value types of the WebAssembly 1.0 MVP.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

/// A function signature. MVP functions return at most one value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FuncSig {
    pub params: Vec<ValType>,
    pub result: Option<ValType>,
}

impl FuncSig {
    pub fn new(params: Vec<ValType>, result: Option<ValType>) -> Self {
        Self { params, result }
    }
}

/// An imported function: `(module, field)` plus its declared type index.
#[derive(Clone, Debug)]
pub struct ImportedFunc {
    pub module: String,
    pub field: String,
    pub type_index: u32,
}

/// The function table: fixed slots, each optionally holding a function
/// index. Uninitialized slots trap on indirect calls.
#[derive(Clone, Debug, Default)]
pub struct TableInfo {
    pub slots: Vec<Option<u32>>,
}

/// Linear memory limits in pages.
#[derive(Copy, Clone, Debug)]
pub struct MemoryInfo {
    pub initial: u32,
    pub maximum: Option<u32>,
}

/// A constant initializer value, already evaluated.
#[derive(Copy, Clone, Debug)]
pub enum ConstValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl ConstValue {
    pub fn bits(self) -> u64 {
        match self {
            ConstValue::I32(v) => v as u32 as u64,
            ConstValue::I64(v) => v as u64,
            ConstValue::F32(v) => v.to_bits() as u64,
            ConstValue::F64(v) => v.to_bits(),
        }
    }
}

/// A global declaration with its evaluated initial value.
#[derive(Copy, Clone, Debug)]
pub struct GlobalInfo {
    pub ty: ValType,
    pub mutable: bool,
    pub init: ConstValue,
}

/// What an export refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExportKind {
    Func(u32),
    Table,
    Memory,
    Global(u32),
}

/// An active data segment, to be copied into memory at instantiation.
#[derive(Clone, Debug)]
pub struct DataSegment {
    pub offset: u32,
    pub data: Vec<u8>,
}

/// Decoded, immutable description of one contract binary.
#[derive(Clone, Debug, Default)]
pub struct ModuleInfo {
    /// Declared function signatures, in type-section order.
    pub types: Vec<FuncSig>,
    /// Canonical signature token per type index: the first type index
    /// with an identical signature. Indirect calls compare tokens, so
    /// structurally equal types are interchangeable in O(1).
    pub type_tokens: Vec<u32>,
    pub imports: Vec<ImportedFunc>,
    /// Type index of each internal function, in code order.
    pub functions: Vec<u32>,
    pub table: Option<TableInfo>,
    pub memory: Option<MemoryInfo>,
    pub globals: Vec<GlobalInfo>,
    pub exports: IndexMap<String, ExportKind>,
    pub data_segments: Vec<DataSegment>,
}

impl ModuleInfo {
    /// Total function count: imports first, then internals.
    pub fn num_functions(&self) -> usize {
        self.imports.len() + self.functions.len()
    }

    /// Signature of function `index` in the combined index space.
    pub fn func_sig(&self, index: u32) -> &FuncSig {
        &self.types[self.func_type_index(index) as usize]
    }

    /// Declared type index of function `index` in the combined space.
    pub fn func_type_index(&self, index: u32) -> u32 {
        let imports = self.imports.len() as u32;
        if index < imports {
            self.imports[index as usize].type_index
        } else {
            self.functions[(index - imports) as usize]
        }
    }

    /// Canonical type token of function `index`.
    pub fn func_type_token(&self, index: u32) -> u32 {
        self.type_tokens[self.func_type_index(index) as usize]
    }

    /// Compute the canonical token table for `types`.
    pub(crate) fn dedupe_types(types: &[FuncSig]) -> Vec<u32> {
        let mut tokens = Vec::with_capacity(types.len());
        let mut seen: IndexMap<&FuncSig, u32> = IndexMap::new();
        for (i, sig) in types.iter().enumerate() {
            let token = *seen.entry(sig).or_insert(i as u32);
            tokens.push(token);
        }
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tokens_collapse_duplicates() {
        let sig_v = FuncSig::new(vec![], None);
        let sig_i = FuncSig::new(vec![ValType::I32], Some(ValType::I32));
        let types = vec![sig_v.clone(), sig_i.clone(), sig_v, sig_i];
        assert_eq!(ModuleInfo::dedupe_types(&types), vec![0, 1, 0, 1]);
    }
}
