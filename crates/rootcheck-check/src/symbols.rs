//! Symbol interning recognition (component D).
//!
//! The runtime interns string literals into long-lived symbol objects via
//! a small family of functions, usually storing the result into a global
//! for reuse (`static SEXP g_dimnamesSymbol = intern("dimnames");`). Several
//! later heuristics (allocator inference, vector-returning inference) need
//! to resolve a global back to the literal it was interned from.

use rustc_hash::FxHashMap;

use llvm_ir::{Constant, Instruction, Name, Operand};
use rootcheck_ir::Module;

/// Functions in the runtime's ABI that intern a string literal into a
/// symbol. Any of these, called with a compile-time string constant,
/// counts as interning.
pub const INTERN_FUNCTIONS: &[&str] = &["intern", "install", "mk_symbol", "mkSymbolOrLiteral"];

/// Maps a global variable name to the string literal it was interned
/// from, wherever that could be determined statically.
#[derive(Debug, Default)]
pub struct SymbolTable {
    literals: FxHashMap<String, String>,
}

impl SymbolTable {
    pub fn literal_for_global(&self, global: &str) -> Option<&str> {
        self.literals.get(global).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.literals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.literals.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Walk every function in `module`, recognizing
/// `store(intern("literal"), @global)` and recording `@global -> "literal"`.
pub fn build_symbol_table(module: &Module) -> SymbolTable {
    let mut table = SymbolTable::default();

    for func in &module.inner().functions {
        for block in &func.basic_blocks {
            for inst in &block.instrs {
                if let Instruction::Store(store) = inst {
                    if let Some(literal) = install_literal_from_value(func, &store.value) {
                        if let Some(global) = global_name(&store.address) {
                            table.literals.insert(global, literal);
                        }
                    }
                }
            }
        }
    }

    table
}

/// If `value` is the result of a call to one of [`INTERN_FUNCTIONS`] whose
/// first argument is a constant-indexed address of a global string
/// constant, return the literal text.
fn install_literal_from_value(func: &llvm_ir::Function, value: &Operand) -> Option<String> {
    let name = operand_local_name(value)?;
    for block in &func.basic_blocks {
        for inst in &block.instrs {
            if let Instruction::Call(call) = inst {
                if call_result_name(call) != Some(name.clone()) {
                    continue;
                }
                let callee = rootcheck_ir::patterns::called_function_name(call)?;
                if !INTERN_FUNCTIONS.iter().any(|f| callee.contains(f)) {
                    continue;
                }
                let (arg, _) = call.arguments.first()?;
                return string_literal_operand(arg);
            }
        }
    }
    None
}

fn operand_local_name(op: &Operand) -> Option<Name> {
    match op {
        Operand::LocalOperand { name, .. } => Some(name.clone()),
        _ => None,
    }
}

fn call_result_name(call: &llvm_ir::instruction::Call) -> Option<Name> {
    call.dest.clone()
}

fn global_name(op: &Operand) -> Option<String> {
    match op {
        Operand::LocalOperand { name, .. } => Some(name.to_string()),
        Operand::ConstantOperand(c) => match c.as_ref() {
            Constant::GlobalReference { name, .. } => Some(name.to_string()),
            _ => None,
        },
        _ => None,
    }
}

/// Recognizes a constant-indexed address of a global containing a C
/// string constant: a `getelementptr` into a `[N x i8]` global
/// initialized from a string literal. Returns the backing global's name
/// as a stand-in for its text — good enough to key a lookup table, since
/// two call sites interning the same literal share the same dedup'd
/// constant global.
fn string_literal_operand(op: &Operand) -> Option<String> {
    match op {
        Operand::ConstantOperand(c) => match c.as_ref() {
            Constant::GetElementPtr(gep) => match gep.address.as_ref() {
                Constant::GlobalReference { name, .. } => Some(name.to_string()),
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_module_has_no_symbols() {
        let table = SymbolTable::default();
        assert!(table.is_empty());
        assert_eq!(table.literal_for_global("g_fooSymbol"), None);
    }

    #[test]
    fn intern_function_list_is_nonempty() {
        assert!(!INTERN_FUNCTIONS.is_empty());
        assert!(INTERN_FUNCTIONS.contains(&"install"));
    }
}
