//! Global-variable lister (supplemented feature).
//!
//! Flags global variables whose static type transitively contains a
//! managed-pointer field — a global struct with a pointer member, or an
//! array of such structs. These are GC hazards: anything reachable from
//! a global stays alive across calls with no protection stack entry, so
//! if it's ever mutated without going through the runtime's write
//! barrier, the collector can lose track of it.

use rustc_hash::FxHashSet;

use llvm_ir::{Module as LlvmModule, Type, TypeRef};
use rootcheck_ir::Module;

#[derive(Debug, Clone)]
pub struct FlaggedGlobal {
    pub name: String,
    pub reason: &'static str,
}

/// List every global in `module` whose type embeds a managed-pointer
/// field, directly or through nested structs/arrays.
pub fn list_hazardous_globals(module: &Module) -> Vec<FlaggedGlobal> {
    let inner = module.inner();
    let mut out = Vec::new();

    for global in &inner.global_vars {
        if contains_pointer_field(inner, &global.ty, &mut FxHashSet::default()) {
            out.push(FlaggedGlobal {
                name: global.name.to_string(),
                reason: "type contains a pointer field reachable from a global root",
            });
        }
    }

    out
}

fn contains_pointer_field(module: &LlvmModule, ty: &TypeRef, seen: &mut FxHashSet<String>) -> bool {
    let key = format!("{ty:?}");
    if !seen.insert(key) {
        return false;
    }

    match ty.as_ref() {
        Type::PointerType { .. } => true,
        Type::ArrayType { element_type, .. } | Type::VectorType { element_type, .. } => {
            contains_pointer_field(module, element_type, seen)
        }
        Type::StructType { element_types, .. } => element_types
            .iter()
            .any(|f| contains_pointer_field(module, f, seen)),
        Type::NamedStructType { name } => module
            .types
            .named_struct_def(name)
            .and_then(|def| match def {
                llvm_ir::types::NamedStructDef::Defined(t) => Some(t.clone()),
                llvm_ir::types::NamedStructDef::Opaque => None,
            })
            .map(|t| contains_pointer_field(module, &t, seen))
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flagged_global_carries_a_reason() {
        let g = FlaggedGlobal {
            name: "g_env".to_string(),
            reason: "type contains a pointer field reachable from a global root",
        };
        assert!(!g.reason.is_empty());
    }
}
