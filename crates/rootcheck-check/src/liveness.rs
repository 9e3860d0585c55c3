//! Liveness analysis (component I).
//!
//! Standard backward liveness over stack slots (`alloca`d locals
//! accessed via `load`/`store`, not SSA registers), computed block-level
//! first and then refined instruction-by-instruction on demand. The
//! fresh-variable checker (component L) uses this to tell "has this
//! protected slot's value stopped being read" from "it's still live but
//! just hasn't been read yet on this path".

use rustc_hash::{FxHashMap, FxHashSet};

use llvm_ir::{BasicBlock, Function, Instruction, Name, Operand, Terminator};

/// Block-level live-in/live-out sets, keyed by block name.
pub struct Liveness {
    live_in: FxHashMap<Name, FxHashSet<Name>>,
    live_out: FxHashMap<Name, FxHashSet<Name>>,
}

impl Liveness {
    pub fn live_in(&self, block: &Name) -> &FxHashSet<Name> {
        static EMPTY: once_cell_set::Lazy = once_cell_set::Lazy;
        self.live_in.get(block).unwrap_or(EMPTY.get())
    }

    pub fn live_out(&self, block: &Name) -> &FxHashSet<Name> {
        static EMPTY: once_cell_set::Lazy = once_cell_set::Lazy;
        self.live_out.get(block).unwrap_or(EMPTY.get())
    }

    /// Refine block-level liveness to "is `var` live immediately after
    /// the instruction at `inst_idx` in `block`", by scanning forward
    /// from that point to the block's end.
    pub fn is_live_after(&self, func: &Function, block: &Name, inst_idx: usize, var: &Name) -> bool {
        let Some(b) = func.basic_blocks.iter().find(|b| &b.name == block) else {
            return false;
        };
        for inst in b.instrs.iter().skip(inst_idx + 1) {
            if instruction_uses(inst, var) {
                return true;
            }
            if instruction_defs(inst).as_ref() == Some(var) {
                return false;
            }
        }
        if terminator_uses(&b.term, var) {
            return true;
        }
        self.live_out(block).contains(var)
    }
}

/// A minimal thread-unsafe lazily-built empty set, avoiding an
/// `Option<&FxHashSet>` at every call site of [`Liveness::live_in`].
mod once_cell_set {
    use rustc_hash::FxHashSet;
    use std::sync::OnceLock;

    pub struct Lazy;

    static EMPTY: OnceLock<FxHashSet<llvm_ir::Name>> = OnceLock::new();

    impl Lazy {
        pub fn get(&self) -> &'static FxHashSet<llvm_ir::Name> {
            EMPTY.get_or_init(FxHashSet::default)
        }
    }
}

/// Run block-level backward liveness to a fixed point over `func`.
pub fn compute_liveness(func: &Function) -> Liveness {
    let mut live_in: FxHashMap<Name, FxHashSet<Name>> = FxHashMap::default();
    let mut live_out: FxHashMap<Name, FxHashSet<Name>> = FxHashMap::default();

    for block in &func.basic_blocks {
        live_in.insert(block.name.clone(), FxHashSet::default());
        live_out.insert(block.name.clone(), FxHashSet::default());
    }

    loop {
        let mut changed = false;
        for block in func.basic_blocks.iter().rev() {
            let mut out = FxHashSet::default();
            for succ in successor_names(&block.term) {
                if let Some(s) = live_in.get(&succ) {
                    out.extend(s.iter().cloned());
                }
            }
            let in_set = backward_transfer(block, &out);

            if live_out[&block.name] != out {
                live_out.insert(block.name.clone(), out);
                changed = true;
            }
            if live_in[&block.name] != in_set {
                live_in.insert(block.name.clone(), in_set);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    Liveness { live_in, live_out }
}

fn backward_transfer(block: &BasicBlock, out: &FxHashSet<Name>) -> FxHashSet<Name> {
    let mut live = out.clone();
    for name in terminator_used_names(&block.term) {
        live.insert(name);
    }
    for inst in block.instrs.iter().rev() {
        if let Some(def) = instruction_defs(inst) {
            live.remove(&def);
        }
        for used in instruction_used_names(inst) {
            live.insert(used);
        }
    }
    live
}

fn successor_names(term: &Terminator) -> Vec<Name> {
    match term {
        Terminator::Br(b) => vec![b.dest.clone()],
        Terminator::CondBr(b) => vec![b.true_dest.clone(), b.false_dest.clone()],
        Terminator::Switch(s) => {
            let mut v: Vec<_> = s.dests.iter().map(|(_, d)| d.clone()).collect();
            v.push(s.default_dest.clone());
            v
        }
        Terminator::IndirectBr(b) => b.possible_dests.clone(),
        _ => Vec::new(),
    }
}

fn instruction_defs(inst: &Instruction) -> Option<Name> {
    match inst {
        Instruction::Load(i) => Some(i.dest.clone()),
        Instruction::Call(i) => i.dest.clone(),
        Instruction::Alloca(i) => Some(i.dest.clone()),
        Instruction::GetElementPtr(i) => Some(i.dest.clone()),
        Instruction::ICmp(i) => Some(i.dest.clone()),
        Instruction::BitCast(i) => Some(i.dest.clone()),
        Instruction::Add(i) => Some(i.dest.clone()),
        Instruction::Sub(i) => Some(i.dest.clone()),
        _ => None,
    }
}

fn instruction_uses(inst: &Instruction, var: &Name) -> bool {
    instruction_used_names(inst).into_iter().any(|n| &n == var)
}

fn instruction_used_names(inst: &Instruction) -> Vec<Name> {
    let mut names = Vec::new();
    match inst {
        Instruction::Store(s) => {
            push_operand(&mut names, &s.value);
            push_operand(&mut names, &s.address);
        }
        Instruction::Load(l) => push_operand(&mut names, &l.address),
        Instruction::Call(c) => {
            for (op, _) in &c.arguments {
                push_operand(&mut names, op);
            }
        }
        Instruction::ICmp(i) => {
            push_operand(&mut names, &i.operand0);
            push_operand(&mut names, &i.operand1);
        }
        Instruction::GetElementPtr(g) => {
            push_operand(&mut names, &g.address);
            for idx in &g.indices {
                push_operand(&mut names, idx);
            }
        }
        Instruction::BitCast(b) => push_operand(&mut names, &b.operand),
        Instruction::Add(a) => {
            push_operand(&mut names, &a.operand0);
            push_operand(&mut names, &a.operand1);
        }
        Instruction::Sub(s) => {
            push_operand(&mut names, &s.operand0);
            push_operand(&mut names, &s.operand1);
        }
        _ => {}
    }
    names
}

fn terminator_uses(term: &Terminator, var: &Name) -> bool {
    terminator_used_names(term).into_iter().any(|n| &n == var)
}

fn terminator_used_names(term: &Terminator) -> Vec<Name> {
    let mut names = Vec::new();
    match term {
        Terminator::Ret(r) => {
            if let Some(op) = &r.return_operand {
                push_operand(&mut names, op);
            }
        }
        Terminator::CondBr(b) => push_operand(&mut names, &b.condition),
        Terminator::Switch(s) => push_operand(&mut names, &s.operand),
        _ => {}
    }
    names
}

fn push_operand(names: &mut Vec<Name>, op: &Operand) {
    if let Operand::LocalOperand { name, .. } = op {
        names.push(name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_function_has_no_liveness() {
        // Sanity check that an empty live set lookup doesn't panic.
        let live_in: FxHashMap<Name, FxHashSet<Name>> = FxHashMap::default();
        let live_out: FxHashMap<Name, FxHashSet<Name>> = FxHashMap::default();
        let l = Liveness { live_in, live_out };
        assert!(l.live_in(&Name::from("entry")).is_empty());
    }
}
