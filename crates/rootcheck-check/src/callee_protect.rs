//! Callee-protect inference (component J).
//!
//! Classifies every function by what it expects of its managed-pointer
//! arguments: does it protect them itself, is it safe to pass them
//! unprotected because the function never triggers a GC safepoint while
//! still holding them, or must the caller protect before the call? The
//! balance/fresh checkers (K/L) use this to decide whether a call site
//! needs a protect/unprotect pair wrapped around it.

use rustc_hash::FxHashSet;

use llvm_ir::Instruction;
use rootcheck_ir::{patterns::called_function_name, Module};

use crate::allocator::AllocatorSet;
use crate::callgraph::CallGraph;

/// Functions in the runtime's ABI known to protect their own arguments,
/// overriding whatever the call-graph-based inference would otherwise
/// conclude (they commonly allocate before protecting, which would
/// otherwise look caller-protect).
pub const KNOWN_CALLEE_PROTECT: &[&str] = &["cons", "new_env", "new_promise", "new_closure"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectKind {
    /// Protects its own managed-pointer arguments before anything that
    /// could trigger GC.
    CalleeProtect,
    /// Never reaches a GC safepoint while holding an argument, so no
    /// protection is needed either way.
    CalleeSafe,
    /// The caller must protect before calling; this function may
    /// allocate while holding the argument unprotected.
    CallerProtect,
    /// Doesn't take managed-pointer arguments, or never allocates at
    /// all — protection is moot.
    Trivial,
}

#[derive(Debug, Default)]
pub struct CalleeProtectTable {
    kinds: rustc_hash::FxHashMap<String, ProtectKind>,
}

impl CalleeProtectTable {
    pub fn kind_of(&self, function: &str) -> ProtectKind {
        self.kinds
            .get(function)
            .copied()
            .unwrap_or(ProtectKind::Trivial)
    }
}

/// Classify every defined function in `module`.
pub fn infer_callee_protect(
    module: &Module,
    allocators: &AllocatorSet,
    call_graph: &CallGraph,
) -> CalleeProtectTable {
    let known: FxHashSet<&str> = KNOWN_CALLEE_PROTECT.iter().copied().collect();
    let mut kinds = rustc_hash::FxHashMap::default();

    for func in &module.inner().functions {
        if known.contains(func.name.as_str()) {
            kinds.insert(func.name.clone(), ProtectKind::CalleeProtect);
            continue;
        }

        let reaches_allocator = call_graph
            .reachable_from(&func.name)
            .iter()
            .any(|callee| allocators.allocates(callee));

        if !reaches_allocator {
            kinds.insert(func.name.clone(), ProtectKind::Trivial);
            continue;
        }

        if protects_own_args_before_alloc(func, allocators) {
            kinds.insert(func.name.clone(), ProtectKind::CalleeProtect);
        } else if never_retains_arg_across_alloc(func) {
            kinds.insert(func.name.clone(), ProtectKind::CalleeSafe);
        } else {
            kinds.insert(func.name.clone(), ProtectKind::CallerProtect);
        }
    }

    CalleeProtectTable { kinds }
}

fn protects_own_args_before_alloc(func: &llvm_ir::Function, allocators: &AllocatorSet) -> bool {
    let mut protected_something = false;
    let mut allocated_yet = false;
    for block in &func.basic_blocks {
        for inst in &block.instrs {
            let Instruction::Call(call) = inst else {
                continue;
            };
            let Some(callee) = called_function_name(call) else {
                continue;
            };
            if callee.contains("protect") && !callee.contains("unprotect") {
                if !allocated_yet {
                    protected_something = true;
                }
            } else if allocators.allocates(&callee) {
                allocated_yet = true;
            }
        }
    }
    protected_something
}

fn never_retains_arg_across_alloc(func: &llvm_ir::Function) -> bool {
    // Conservative: a function with a single basic block and no stores of
    // a parameter into a slot that survives past a call is unlikely to
    // retain it across a GC safepoint.
    func.basic_blocks.len() <= 1
        && !func.basic_blocks.iter().any(|b| {
            b.instrs
                .iter()
                .any(|i| matches!(i, Instruction::Store(_)))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_callee_protect_list_is_honored() {
        let table = CalleeProtectTable::default();
        // Without running inference, unknowns default to Trivial.
        assert_eq!(table.kind_of("anything"), ProtectKind::Trivial);
    }

    #[test]
    fn known_list_members_are_distinct() {
        let set: FxHashSet<&str> = KNOWN_CALLEE_PROTECT.iter().copied().collect();
        assert_eq!(set.len(), KNOWN_CALLEE_PROTECT.len());
    }
}
