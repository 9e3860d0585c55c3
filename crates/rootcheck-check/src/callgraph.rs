//! Call-graph transitive closure (component C).
//!
//! Builds a direct call-graph over a module's functions, then saturates
//! it into a transitive closure represented as one bitset per function.
//! Calls into functions that never return (component B) are pruned from
//! the closure — a call on a path to a fatal error can't actually reach
//! a GC safepoint. An optional whitelist restricts which callees count at
//! all, used by drivers that only care about reachability within a
//! specific subsystem (e.g. "does this reach the allocator").

use llvm_ir::Instruction;
use rootcheck_ir::{patterns::called_function_name, FunctionId, Module};

use crate::error_paths::ErrorPaths;

const WORD_BITS: usize = 64;

#[derive(Clone)]
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn new(n: usize) -> Self {
        Self {
            words: vec![0u64; n.div_ceil(WORD_BITS)],
        }
    }

    fn set(&mut self, i: usize) {
        self.words[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
    }

    fn get(&self, i: usize) -> bool {
        (self.words[i / WORD_BITS] >> (i % WORD_BITS)) & 1 != 0
    }

    /// OR `other` into `self`, returning whether anything changed.
    fn or_assign(&mut self, other: &BitSet) -> bool {
        let mut changed = false;
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            let new = *a | *b;
            if new != *a {
                changed = true;
            }
            *a = new;
        }
        changed
    }

    fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.words.len() * WORD_BITS).filter(move |&i| self.get(i))
    }
}

/// The transitive call-reachability relation over a module's functions.
pub struct CallGraph {
    names: Vec<String>,
    closure: Vec<BitSet>,
}

impl CallGraph {
    pub fn reaches(&self, from: FunctionId, to: FunctionId) -> bool {
        self.closure[from.index()].get(to.index())
    }

    pub fn reaches_named(&self, from: &str, to: &str) -> bool {
        let (Some(f), Some(t)) = (self.index_of(from), self.index_of(to)) else {
            return false;
        };
        self.reaches(FunctionId(f as u32), FunctionId(t as u32))
    }

    pub fn reachable_from(&self, from: &str) -> Vec<&str> {
        let Some(i) = self.index_of(from) else {
            return Vec::new();
        };
        self.closure[i]
            .iter_set()
            .map(|j| self.names[j].as_str())
            .collect()
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// Build the call-graph transitive closure for every defined function in
/// `module`. `whitelist`, when given, restricts which callee names
/// participate in edges at all (calls to anything else are ignored, as
/// if they were calls to an external leaf).
pub fn build_call_graph(
    module: &Module,
    error_paths: &ErrorPaths,
    whitelist: Option<&[&str]>,
) -> CallGraph {
    let ids = module.function_ids();
    let n = ids.len();
    let names: Vec<String> = ids.iter().map(|(_, name)| name.to_string()).collect();

    let mut closure: Vec<BitSet> = (0..n).map(|_| BitSet::new(n)).collect();

    for (id, name) in &ids {
        let i = id.index();
        closure[i].set(i);
        let Some(func) = module.function(name) else {
            continue;
        };
        for block in &func.basic_blocks {
            for inst in &block.instrs {
                let Instruction::Call(call) = inst else {
                    continue;
                };
                let Some(callee) = called_function_name(call) else {
                    continue;
                };
                if error_paths.does_not_return(&callee) {
                    continue;
                }
                if let Some(wl) = whitelist {
                    if !wl.contains(&callee.as_str()) {
                        continue;
                    }
                }
                if let Some(j) = names.iter().position(|n| n == &callee) {
                    closure[i].set(j);
                }
            }
        }
    }

    loop {
        let mut changed = false;
        for i in 0..n {
            let direct: Vec<usize> = closure[i].iter_set().collect();
            for j in direct {
                if i == j {
                    continue;
                }
                let other = closure[j].clone();
                if closure[i].or_assign(&other) {
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    CallGraph { names, closure }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitset_set_get_roundtrip() {
        let mut b = BitSet::new(200);
        b.set(5);
        b.set(130);
        assert!(b.get(5));
        assert!(b.get(130));
        assert!(!b.get(6));
    }

    #[test]
    fn or_assign_reports_change() {
        let mut a = BitSet::new(10);
        let mut b = BitSet::new(10);
        b.set(3);
        assert!(a.or_assign(&b));
        assert!(!a.or_assign(&b));
    }
}
