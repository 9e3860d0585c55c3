//! Allocator inference (component E).
//!
//! A function "allocates" if it can hand back a freshly-allocated,
//! unprotected managed pointer — either because it's one of the
//! runtime's base allocators, or because it returns the direct result of
//! a call to something already known to allocate. This is a
//! backward slot-flow approximation, not real dataflow: it only follows
//! the single-assignment case (`%x = call …; ret %x`), which is the
//! overwhelming majority of real C compiled at `-O0`/`-O1`.

use rustc_hash::FxHashSet;

use llvm_ir::{Instruction, Name, Terminator};
use rootcheck_ir::{patterns::called_function_name, Module};

/// The runtime's base allocating primitives — functions known to
/// allocate regardless of what they call.
pub const BASE_ALLOCATORS: &[&str] = &[
    "alloc_vector",
    "alloc_list",
    "alloc_env",
    "alloc_closure",
    "alloc_promise",
    "alloc_string",
    "duplicate_value",
];

/// Functions that must never be inferred as allocating even if they
/// happen to call something that does — interning helpers hand back a
/// long-lived, already-protected symbol, not a fresh unprotected value.
pub const NEVER_ALLOCATING: &[&str] = &[
    "intern",
    "install",
    "mk_symbol",
    "runtime_assert",
    "runtime_abort",
];

/// The set of function names inferred to allocate.
#[derive(Debug, Default)]
pub struct AllocatorSet {
    names: FxHashSet<String>,
}

impl AllocatorSet {
    pub fn allocates(&self, function: &str) -> bool {
        self.names.contains(function)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Infer the allocator set for every function defined in `module`,
/// context-insensitively: a function is flagged once if it can allocate
/// under any calling context.
pub fn infer_allocators(module: &Module) -> AllocatorSet {
    let never: FxHashSet<&str> = NEVER_ALLOCATING.iter().copied().collect();
    let mut allocating: FxHashSet<String> = BASE_ALLOCATORS
        .iter()
        .map(|s| s.to_string())
        .filter(|n| !never.contains(n.as_str()))
        .collect();

    loop {
        let mut changed = false;
        for func in &module.inner().functions {
            if never.contains(func.name.as_str()) || allocating.contains(&func.name) {
                continue;
            }
            if returns_result_of_allocating_call(func, &allocating) {
                allocating.insert(func.name.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    AllocatorSet { names: allocating }
}

fn returns_result_of_allocating_call(
    func: &llvm_ir::Function,
    allocating: &FxHashSet<String>,
) -> bool {
    for block in &func.basic_blocks {
        if let Terminator::Ret(ret) = &block.term {
            let Some(op) = &ret.return_operand else {
                continue;
            };
            let Some(name) = local_name(op) else {
                continue;
            };
            if let Some(callee) = defining_call_callee(func, &name) {
                if allocating.contains(&callee) {
                    return true;
                }
            }
        }
    }
    false
}

fn local_name(op: &llvm_ir::Operand) -> Option<Name> {
    match op {
        llvm_ir::Operand::LocalOperand { name, .. } => Some(name.clone()),
        _ => None,
    }
}

fn defining_call_callee(func: &llvm_ir::Function, slot: &Name) -> Option<String> {
    for block in &func.basic_blocks {
        for inst in &block.instrs {
            if let Instruction::Call(call) = inst {
                if call.dest.as_ref() == Some(slot) {
                    return called_function_name(call);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_allocators_seed_the_set() {
        let never: FxHashSet<&str> = NEVER_ALLOCATING.iter().copied().collect();
        for a in BASE_ALLOCATORS {
            assert!(!never.contains(a), "{a} is in both lists");
        }
    }

    #[test]
    fn empty_set_allocates_nothing() {
        let set = AllocatorSet::default();
        assert!(!set.allocates("alloc_vector"));
    }
}
