//! Contract binary to compiled module.
//!
//! Two passes over the byte stream: the wasmparser validator first
//! checks the whole module against the MVP feature set, then the
//! payload walk materializes [`ModuleInfo`] and streams every function
//! body through the JIT writer. Nothing is emitted for a module that
//! fails validation.

use crate::arena::CodeArena;
use crate::bridge::{HostRegistry, ResolvedImport};
use crate::error::VmError;
use crate::jit::{code_capacity_bound, CodeWriter, GlobalStore, JitModule};
use crate::module::{
    ConstValue, DataSegment, ExportKind, FuncSig, GlobalInfo, ImportedFunc, MemoryInfo,
    ModuleInfo, TableInfo, ValType,
};
use wasmparser::{
    ConstExpr, ExternalKind, FunctionBody, Operator, Parser, Payload, TypeRef, Validator,
    WasmFeatures,
};

/// A contract ready to execute: decoded metadata, linked imports and
/// sealed machine code.
pub(crate) struct CompiledContract {
    pub module: ModuleInfo,
    pub jit: JitModule,
    pub imports: Vec<ResolvedImport>,
}

fn mvp_features() -> WasmFeatures {
    let mut features = WasmFeatures::default();
    features.mutable_global = true;
    features.floats = true;
    features.saturating_float_to_int = false;
    features.sign_extension = false;
    features.reference_types = false;
    features.multi_value = false;
    features.bulk_memory = false;
    features.simd = false;
    features.relaxed_simd = false;
    features.threads = false;
    features.tail_call = false;
    features.multi_memory = false;
    features.exceptions = false;
    features.memory64 = false;
    features.extended_const = false;
    features.component_model = false;
    features.function_references = false;
    features.memory_control = false;
    features.gc = false;
    features
}

fn validation_error(message: impl Into<String>) -> VmError {
    VmError::ContractValidationFailure(message.into())
}

fn convert_valtype(ty: wasmparser::ValType) -> Result<ValType, VmError> {
    match ty {
        wasmparser::ValType::I32 => Ok(ValType::I32),
        wasmparser::ValType::I64 => Ok(ValType::I64),
        wasmparser::ValType::F32 => Ok(ValType::F32),
        wasmparser::ValType::F64 => Ok(ValType::F64),
        other => Err(validation_error(format!("unsupported value type {other:?}"))),
    }
}

fn convert_sig(ty: &wasmparser::FuncType) -> Result<FuncSig, VmError> {
    let params = ty
        .params()
        .iter()
        .map(|p| convert_valtype(*p))
        .collect::<Result<Vec<_>, _>>()?;
    let result = match ty.results() {
        [] => None,
        [single] => Some(convert_valtype(*single)?),
        _ => return Err(validation_error("multiple results")),
    };
    Ok(FuncSig::new(params, result))
}

/// Evaluate a constant initializer: a single constant followed by `end`.
/// Imported globals cannot appear because global imports are rejected.
fn eval_const_expr(expr: &ConstExpr<'_>) -> Result<ConstValue, VmError> {
    let mut reader = expr.get_operators_reader();
    let op = reader
        .read()
        .map_err(|e| validation_error(e.to_string()))?;
    let value = match op {
        Operator::I32Const { value } => ConstValue::I32(value),
        Operator::I64Const { value } => ConstValue::I64(value),
        Operator::F32Const { value } => ConstValue::F32(f32::from_bits(value.bits())),
        Operator::F64Const { value } => ConstValue::F64(f64::from_bits(value.bits())),
        other => {
            return Err(validation_error(format!(
                "unsupported constant initializer {other:?}"
            )))
        }
    };
    match reader.read() {
        Ok(Operator::End) => Ok(value),
        _ => Err(validation_error("malformed constant initializer")),
    }
}

fn const_u32(expr: &ConstExpr<'_>) -> Result<u32, VmError> {
    match eval_const_expr(expr)? {
        ConstValue::I32(v) => Ok(v as u32),
        _ => Err(validation_error("offset initializer is not an i32")),
    }
}

/// Decode `wasm` into metadata plus the raw function bodies, rejecting
/// everything the engine does not accept on top of plain validation:
/// start sections, non-function imports and out-of-range element
/// segments.
fn decode<'a>(wasm: &'a [u8]) -> Result<(ModuleInfo, Vec<FunctionBody<'a>>), VmError> {
    let mut module = ModuleInfo::default();
    let mut bodies = Vec::new();

    for payload in Parser::new(0).parse_all(wasm) {
        let payload = payload.map_err(|e| validation_error(e.to_string()))?;
        match payload {
            Payload::TypeSection(reader) => {
                for ty in reader.into_iter_err_on_gc_types() {
                    let ty = ty.map_err(|e| validation_error(e.to_string()))?;
                    module.types.push(convert_sig(&ty)?);
                }
                module.type_tokens = ModuleInfo::dedupe_types(&module.types);
            }
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.map_err(|e| validation_error(e.to_string()))?;
                    match import.ty {
                        TypeRef::Func(type_index) => module.imports.push(ImportedFunc {
                            module: import.module.to_string(),
                            field: import.name.to_string(),
                            type_index,
                        }),
                        _ => {
                            return Err(validation_error(format!(
                                "unsupported import kind for {}.{}",
                                import.module, import.name
                            )))
                        }
                    }
                }
            }
            Payload::FunctionSection(reader) => {
                for type_index in reader {
                    let type_index = type_index.map_err(|e| validation_error(e.to_string()))?;
                    module.functions.push(type_index);
                }
            }
            Payload::TableSection(reader) => {
                for table in reader {
                    let table = table.map_err(|e| validation_error(e.to_string()))?;
                    let size = table.ty.initial as usize;
                    module.table = Some(TableInfo {
                        slots: vec![None; size],
                    });
                }
            }
            Payload::MemorySection(reader) => {
                for memory in reader {
                    let memory = memory.map_err(|e| validation_error(e.to_string()))?;
                    module.memory = Some(MemoryInfo {
                        initial: memory.initial as u32,
                        maximum: memory.maximum.map(|max| max as u32),
                    });
                }
            }
            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global.map_err(|e| validation_error(e.to_string()))?;
                    module.globals.push(GlobalInfo {
                        ty: convert_valtype(global.ty.content_type)?,
                        mutable: global.ty.mutable,
                        init: eval_const_expr(&global.init_expr)?,
                    });
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export.map_err(|e| validation_error(e.to_string()))?;
                    let kind = match export.kind {
                        ExternalKind::Func => ExportKind::Func(export.index),
                        ExternalKind::Table => ExportKind::Table,
                        ExternalKind::Memory => ExportKind::Memory,
                        ExternalKind::Global => ExportKind::Global(export.index),
                        other => {
                            return Err(validation_error(format!(
                                "unsupported export kind {other:?}"
                            )))
                        }
                    };
                    module.exports.insert(export.name.to_string(), kind);
                }
            }
            Payload::StartSection { .. } => {
                return Err(validation_error("contract contains a start function"));
            }
            Payload::ElementSection(reader) => {
                for element in reader {
                    let element = element.map_err(|e| validation_error(e.to_string()))?;
                    let wasmparser::ElementKind::Active {
                        table_index,
                        offset_expr,
                    } = element.kind
                    else {
                        return Err(validation_error("unsupported element segment kind"));
                    };
                    if table_index.unwrap_or(0) != 0 {
                        return Err(validation_error("element segment targets unknown table"));
                    }
                    let offset = const_u32(&offset_expr)? as usize;
                    let wasmparser::ElementItems::Functions(items) = element.items else {
                        return Err(validation_error("unsupported element expressions"));
                    };
                    let table = module
                        .table
                        .as_mut()
                        .ok_or_else(|| validation_error("element segment without a table"))?;
                    let mut slot = offset;
                    for item in items {
                        let func_index = item.map_err(|e| validation_error(e.to_string()))?;
                        if slot >= table.slots.len() {
                            return Err(validation_error("element segment out of bounds"));
                        }
                        table.slots[slot] = Some(func_index);
                        slot += 1;
                    }
                }
            }
            Payload::DataSection(reader) => {
                for data in reader {
                    let data = data.map_err(|e| validation_error(e.to_string()))?;
                    let wasmparser::DataKind::Active {
                        memory_index,
                        offset_expr,
                    } = data.kind
                    else {
                        return Err(validation_error("unsupported passive data segment"));
                    };
                    if memory_index != 0 {
                        return Err(validation_error("data segment targets unknown memory"));
                    }
                    module.data_segments.push(DataSegment {
                        offset: const_u32(&offset_expr)?,
                        data: data.data.to_vec(),
                    });
                }
            }
            Payload::CodeSectionEntry(body) => {
                bodies.push(body);
            }
            _ => {}
        }
    }

    // Function indices referenced by the table must exist; the
    // validator guarantees this, so only assert in debug builds.
    debug_assert!(module
        .table
        .iter()
        .flat_map(|t| t.slots.iter().flatten())
        .all(|f| (*f as usize) < module.num_functions()));
    debug_assert_eq!(bodies.len(), module.functions.len());

    Ok((module, bodies))
}

/// Validate, decode, link and JIT-compile one contract binary.
pub(crate) fn compile(wasm: &[u8], registry: &HostRegistry) -> Result<CompiledContract, VmError> {
    Validator::new_with_features(mvp_features())
        .validate_all(wasm)
        .map_err(|e| validation_error(e.to_string()))?;

    let (module, bodies) = decode(wasm)?;
    let imports = registry.resolve(&module)?;

    let globals = GlobalStore::new(module.globals.len());
    let code_bytes: usize = bodies
        .iter()
        .map(|b| b.range().end - b.range().start)
        .sum();
    let capacity = code_capacity_bound(
        module.imports.len(),
        module.table.as_ref().map(|t| t.slots.len()).unwrap_or(0),
        code_bytes,
        module.functions.len(),
    );
    let arena = CodeArena::new(capacity)?;

    let mut writer = CodeWriter::new(&module, globals.cell_addrs(), arena)?;
    let num_imports = module.imports.len() as u32;
    for (index, body) in bodies.iter().enumerate() {
        writer.compile_function(num_imports + index as u32, body)?;
    }
    let jit = JitModule::from_writer(globals, writer)?;

    Ok(CompiledContract {
        module,
        jit,
        imports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eei::register_eei;

    fn registry() -> HostRegistry {
        let mut registry = HostRegistry::new();
        register_eei(&mut registry);
        registry
    }

    fn wat(source: &str) -> Vec<u8> {
        wat::parse_str(source).unwrap()
    }

    #[test]
    fn compiles_a_trivial_module() {
        let wasm = wat(
            r#"(module
                 (memory (export "memory") 1)
                 (func (export "main")))"#,
        );
        let contract = compile(&wasm, &registry()).unwrap();
        assert_eq!(contract.module.functions.len(), 1);
        assert!(contract.module.memory.is_some());
    }

    #[test]
    fn rejects_start_functions() {
        let wasm = wat(
            r#"(module
                 (func $init)
                 (start $init)
                 (func (export "main")))"#,
        );
        assert!(matches!(
            compile(&wasm, &registry()),
            Err(VmError::ContractValidationFailure(_))
        ));
    }

    #[test]
    fn rejects_unknown_imports() {
        let wasm = wat(
            r#"(module
                 (import "ethereum" "noSuchFunction" (func))
                 (func (export "main")))"#,
        );
        assert!(matches!(
            compile(&wasm, &registry()),
            Err(VmError::ContractValidationFailure(_))
        ));
    }

    #[test]
    fn rejects_signature_mismatches() {
        // useGas takes an i64, not an i32.
        let wasm = wat(
            r#"(module
                 (import "ethereum" "useGas" (func (param i32)))
                 (func (export "main")))"#,
        );
        assert!(matches!(
            compile(&wasm, &registry()),
            Err(VmError::ContractValidationFailure(_))
        ));
    }

    #[test]
    fn rejects_post_mvp_instructions() {
        let wasm = wat(
            r#"(module
                 (func (export "main")
                   (drop (i32.extend8_s (i32.const 1)))))"#,
        );
        assert!(matches!(
            compile(&wasm, &registry()),
            Err(VmError::ContractValidationFailure(_))
        ));
    }

    #[test]
    fn type_tokens_unify_duplicate_signatures() {
        let wasm = wat(
            r#"(module
                 (type (func (param i32) (result i32)))
                 (type (func (param i32) (result i32)))
                 (func (export "main")))"#,
        );
        let contract = compile(&wasm, &registry()).unwrap();
        assert_eq!(contract.module.type_tokens[0], contract.module.type_tokens[1]);
    }
}
