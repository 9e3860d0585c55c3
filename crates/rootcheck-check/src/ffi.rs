//! FFI registration table checker (supplemented feature).
//!
//! The runtime exposes native functions to the host language through a
//! table of `{name, function pointer, arity}` entries. A mismatch
//! between the declared arity and the target function's actual parameter
//! count is a real, commonly-made bug (usually from editing one side of
//! the registration and forgetting the other), and it's entirely
//! syntactic to check.

use llvm_ir::{Constant, Type};
use rootcheck_ir::{Module, SourceLoc};

use crate::messenger::Messenger;

#[derive(Debug, Default)]
pub struct FfiCheckResult {
    pub entries_checked: usize,
}

/// Check every entry of the global named `table_global` against the
/// function it references.
pub fn check_ffi_table(module: &Module, table_global: &str, messenger: &mut Messenger) -> FfiCheckResult {
    let mut result = FfiCheckResult::default();

    let Some(global) = module
        .inner()
        .global_vars
        .iter()
        .find(|g| g.name.to_string().trim_start_matches('@') == table_global)
    else {
        messenger.error(
            "ffi_table",
            SourceLoc::unknown(),
            format!("registration table global `{table_global}` was not found"),
        );
        return result;
    };

    let Some(init) = &global.initializer else {
        messenger.error("ffi_table", SourceLoc::unknown(), "registration table has no initializer");
        return result;
    };

    for entry in array_elements(init) {
        let Some((func_name, declared_arity)) = struct_entry_func_and_arity(entry) else {
            continue;
        };
        result.entries_checked += 1;

        let Some(func) = module.function(&func_name) else {
            messenger.info(
                "ffi_table",
                SourceLoc::unknown(),
                format!("registration table references undefined function `{func_name}`"),
            );
            continue;
        };

        let actual_arity = func.parameters.len() as i64;
        if actual_arity != declared_arity {
            messenger.error(
                "ffi_table",
                SourceLoc::unknown(),
                format!(
                    "`{func_name}` is registered with arity {declared_arity} but takes {actual_arity} parameters"
                ),
            );
        }

        if !returns_managed_pointer(&func.return_type) {
            messenger.info(
                "ffi_table",
                SourceLoc::unknown(),
                format!("`{func_name}` is registered as a native entry point but does not return a managed pointer"),
            );
        }
    }

    result
}

fn array_elements(c: &Constant) -> Vec<&Constant> {
    match c {
        Constant::Array { elements, .. } => elements.iter().map(|e| e.as_ref()).collect(),
        _ => Vec::new(),
    }
}

fn struct_entry_func_and_arity(entry: &Constant) -> Option<(String, i64)> {
    let Constant::Struct { values, .. } = entry else {
        return None;
    };
    let mut func_name = None;
    let mut arity = None;
    for v in values {
        match v.as_ref() {
            Constant::GlobalReference { name, .. } => func_name = Some(name.to_string()),
            Constant::Int { value, .. } => arity = Some(*value as i64),
            _ => {}
        }
    }
    Some((func_name?, arity?))
}

fn returns_managed_pointer(ty: &Type) -> bool {
    matches!(ty, Type::PointerType { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_result_has_no_entries() {
        let r = FfiCheckResult::default();
        assert_eq!(r.entries_checked, 0);
    }
}
