//! Error-path finder (component B).
//!
//! Identifies functions that never return control to their caller —
//! either because they call a known-fatal runtime entry point (abort,
//! a long-jumping error raiser) on every path, or because they
//! transitively only ever call other such functions. Everything
//! downstream (call-graph closure, allocator inference) prunes these
//! paths away, since a GC safepoint that only occurs on a path to a
//! fatal error can't actually observe an imbalance.

use rustc_hash::FxHashSet;

use llvm_ir::{BasicBlock, Function, Instruction, Terminator};
use rootcheck_ir::{patterns::called_function_name, Module};

/// Runtime entry points known never to return, seeding the fixed point.
pub const KNOWN_NON_RETURNING: &[&str] = &["runtime_abort", "runtime_fatal_error", "longjmp_error"];

/// The set of functions in a module that never return control to their
/// caller on any path.
#[derive(Debug, Default)]
pub struct ErrorPaths {
    does_not_return: FxHashSet<String>,
}

impl ErrorPaths {
    pub fn does_not_return(&self, function: &str) -> bool {
        self.does_not_return.contains(function)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.does_not_return.iter().map(|s| s.as_str())
    }
}

/// Run the error-path finder to a fixed point over every function
/// defined in `module`.
pub fn find_error_paths(module: &Module) -> ErrorPaths {
    let mut non_returning: FxHashSet<String> =
        KNOWN_NON_RETURNING.iter().map(|s| s.to_string()).collect();

    loop {
        let mut changed = false;
        for func in &module.inner().functions {
            if non_returning.contains(&func.name) {
                continue;
            }
            if function_never_returns(func, &non_returning) {
                non_returning.insert(func.name.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    ErrorPaths {
        does_not_return: non_returning,
    }
}

fn function_never_returns(func: &Function, non_returning: &FxHashSet<String>) -> bool {
    if func.basic_blocks.is_empty() {
        // A declaration with no body: assume it can return, we have no
        // evidence otherwise.
        return false;
    }

    let mut can_return: Vec<bool> = vec![false; func.basic_blocks.len()];
    let mut blocked: Vec<bool> = func
        .basic_blocks
        .iter()
        .map(|b| block_calls_non_returning(b, non_returning))
        .collect();

    loop {
        let mut changed = false;
        for (i, block) in func.basic_blocks.iter().enumerate() {
            if can_return[i] || blocked[i] {
                continue;
            }
            let reaches = match &block.term {
                Terminator::Ret(_) => true,
                other => successor_indices(other, func)
                    .into_iter()
                    .any(|s| can_return[s] && !blocked[s]),
            };
            if reaches {
                can_return[i] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let entry_idx = 0;
    blocked[entry_idx] || !can_return[entry_idx]
}

fn block_calls_non_returning(block: &BasicBlock, non_returning: &FxHashSet<String>) -> bool {
    block.instrs.iter().any(|inst| {
        if let Instruction::Call(call) = inst {
            called_function_name(call)
                .map(|n| non_returning.contains(&n))
                .unwrap_or(false)
        } else {
            false
        }
    })
}

fn successor_indices(term: &Terminator, func: &Function) -> Vec<usize> {
    let names = match term {
        Terminator::Br(b) => vec![b.dest.clone()],
        Terminator::CondBr(b) => vec![b.true_dest.clone(), b.false_dest.clone()],
        Terminator::Switch(s) => {
            let mut v: Vec<_> = s.dests.iter().map(|(_, d)| d.clone()).collect();
            v.push(s.default_dest.clone());
            v
        }
        Terminator::IndirectBr(b) => b.possible_dests.clone(),
        _ => Vec::new(),
    };
    names
        .into_iter()
        .filter_map(|n| func.basic_blocks.iter().position(|b| b.name == n))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_non_returning_seeds_are_present() {
        assert!(KNOWN_NON_RETURNING.contains(&"runtime_abort"));
    }

    #[test]
    fn empty_module_has_no_error_paths() {
        let paths = ErrorPaths::default();
        assert!(!paths.does_not_return("anything"));
    }
}
