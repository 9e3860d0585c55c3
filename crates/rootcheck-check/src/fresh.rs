//! Fresh-variable / unprotected-pointer checker (component L).
//!
//! Tracks which local slots hold a freshly-allocated managed pointer
//! that hasn't yet been protected, and flags any point where such a
//! slot is still live across a call that can trigger GC. Leans on
//! allocator inference (E), the context table and vector-returning
//! inference (F/G, to widen the allocator set with functions that are
//! only known to allocate in a specific call-site context), the guard
//! checkers (H, to drop a slot once a null check proves it was never
//! successfully allocated), liveness (I), and callee-protect
//! classification (J) to keep false positives down.

use rustc_hash::{FxHashMap, FxHashSet};

use llvm_ir::{BasicBlock, Function, Instruction, Name, Operand, Terminator};
use rootcheck_ir::{patterns::called_function_name, Module, SourceLoc};

use crate::allocator::AllocatorSet;
use crate::callee_protect::{CalleeProtectTable, ProtectKind};
use crate::context::ContextTable;
use crate::guards::{find_icmp_defining, recognize_guard_test};
use crate::liveness::{compute_liveness, Liveness};
use crate::messenger::{DeferredId, Messenger, Severity};
use crate::vector_infer::infer_vector_returning;

/// Matches [`crate::balance::MAX_DEPTH`] — both bound the same simulated
/// protection stack, just from two different checkers' points of view.
pub const MAX_PSTACK_SIZE: usize = crate::balance::MAX_DEPTH as usize;

const PROTECT_FNS: &[&str] = &["protect", "protect_with_index"];

/// Per-path state: which slots hold an unprotected fresh pointer (with a
/// count of how many unprotected allocations currently occupy that
/// slot — a slot reused across a loop body without an intervening
/// protect needs more than one protect to clear), a simulated
/// protection stack mirroring the runtime's own, and any conditional
/// "may be destroyed if used later" messages still waiting on a
/// confirming use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
struct FreshState {
    fresh: Vec<(Name, u32)>,
    pstack: Vec<Option<Name>>,
    confused: bool,
    cond_msgs: Vec<(Name, DeferredId)>,
}

impl FreshState {
    fn is_fresh(&self, name: &Name) -> bool {
        self.fresh.iter().any(|(n, _)| n == name)
    }

    fn bump(&mut self, name: Name) {
        if let Some(entry) = self.fresh.iter_mut().find(|(n, _)| n == &name) {
            entry.1 += 1;
        } else {
            self.fresh.push((name, 1));
        }
    }

    fn clear(&mut self, name: &Name) {
        self.fresh.retain(|(n, _)| n != name);
    }

    fn names(&self) -> impl Iterator<Item = &Name> {
        self.fresh.iter().map(|(n, _)| n)
    }
}

#[derive(Debug, Default)]
pub struct FreshCheckResult {
    pub functions_checked: usize,
}

/// Run the unprotected-pointer checker over every defined function.
pub fn check_fresh_variables(
    module: &Module,
    allocators: &AllocatorSet,
    callee_protect: &CalleeProtectTable,
    messenger: &mut Messenger,
) -> FreshCheckResult {
    let mut result = FreshCheckResult::default();
    let vector_sources = context_sensitive_vector_sources(module, allocators);

    for func in &module.inner().functions {
        if func.basic_blocks.is_empty() {
            continue;
        }
        result.functions_checked += 1;
        let liveness = compute_liveness(func);
        check_function(func, allocators, &vector_sources, callee_protect, &liveness, messenger);
    }

    result
}

/// Functions that aren't in the context-insensitive allocator set (E) but
/// whose bottom-context call sites are nonetheless known (via F/G) to
/// always return a fresh vector value — e.g. a thin wrapper whose body is
/// a single context-sensitive vector-returning call the allocator set's
/// backward slot-flow heuristic doesn't follow.
fn context_sensitive_vector_sources(module: &Module, allocators: &AllocatorSet) -> FxHashSet<String> {
    let symbols = crate::symbols::build_symbol_table(module);
    let mut table = ContextTable::new();
    let vectors = infer_vector_returning(module, &mut table, allocators, &symbols);

    module
        .function_ids()
        .into_iter()
        .filter_map(|(id, name)| {
            let call_id = table.context_insensitive_id(id)?;
            vectors.returns_vector(call_id).then(|| name.to_string())
        })
        .collect()
}

fn check_function(
    func: &Function,
    allocators: &AllocatorSet,
    vector_sources: &FxHashSet<String>,
    callee_protect: &CalleeProtectTable,
    liveness: &Liveness,
    messenger: &mut Messenger,
) {
    let mut visited: FxHashSet<(Name, FreshState)> = FxHashSet::default();
    let mut worklist: Vec<(Name, FreshState)> =
        vec![(func.basic_blocks[0].name.clone(), FreshState::default())];
    let mut visited_count = 0usize;

    while let Some((block_name, mut state)) = worklist.pop() {
        if !visited.insert((block_name.clone(), state.clone())) {
            continue;
        }
        visited_count += 1;
        if visited_count > crate::balance::MAX_STATES {
            messenger.error(&func.name, SourceLoc::unknown(), "too many states to analyze precisely");
            return;
        }

        let Some(block) = func.basic_blocks.iter().find(|b| b.name == block_name) else {
            continue;
        };

        for (idx, inst) in block.instrs.iter().enumerate() {
            match inst {
                Instruction::Call(call) => {
                    handle_call(
                        &func.name,
                        func,
                        call,
                        &block_name,
                        idx,
                        allocators,
                        vector_sources,
                        callee_protect,
                        liveness,
                        &mut state,
                        messenger,
                    );
                }
                Instruction::Store(store) => {
                    // A store of a tracked fresh value into anything but a
                    // plain local slot (e.g. into a struct field, a global)
                    // escapes our tracking; a store straight back into the
                    // same alloca it was just loaded from (a spill the
                    // compiler inserted, not an escape) leaves tracking
                    // alone.
                    if let Some(name) = local_name(&store.value) {
                        if !is_reload_of_same_slot(block, idx, &store.address, &name) {
                            state.clear(&name);
                        }
                    }
                }
                _ => {}
            }
        }

        match &block.term {
            Terminator::Ret(r) => {
                if let Some(Operand::LocalOperand { name, .. }) = &r.return_operand {
                    resolve_cond_msg(&mut state, name, messenger, true);
                    state.clear(name);
                }
                for (name, id) in state.cond_msgs.drain(..) {
                    let _ = name;
                    messenger.discard(id);
                }
                if !state.fresh.is_empty() && !state.confused {
                    messenger.info(
                        &func.name,
                        SourceLoc::unknown(),
                        "has a fresh unprotected pointer live at return",
                    );
                }
            }
            term => {
                for succ in successor_names(term) {
                    let mut next = state.clone();
                    narrow_on_guard(block, term, &succ, &mut next);
                    worklist.push((succ, next));
                }
            }
        }
    }
}

/// If `term` is a conditional branch on a recognized null-guard over a
/// tracked fresh pointer, drop that pointer from `next` on the edge
/// where it's provably null — a pointer that was never successfully
/// produced needs no protection.
fn narrow_on_guard(block: &BasicBlock, term: &Terminator, succ: &Name, next: &mut FreshState) {
    let Terminator::CondBr(condbr) = term else {
        return;
    };
    let Some(cond_name) = local_name(&condbr.condition) else {
        return;
    };
    let Some(cmp) = find_icmp_defining(block, &cond_name) else {
        return;
    };
    if rootcheck_ir::patterns::is_type_test_call(block, cmp) {
        return;
    }
    let Some((var, is_eq)) = recognize_guard_test(cmp) else {
        return;
    };
    if !next.is_fresh(&var) {
        return;
    }
    let this_is_true_edge = succ == &condbr.true_dest;
    let var_is_null_on_this_edge = this_is_true_edge == is_eq;
    if var_is_null_on_this_edge {
        next.clear(&var);
    }
}

/// True if the store at `idx` writes `name` straight back into the local
/// slot it was most recently loaded from, in the same block — the usual
/// shape of a compiler-inserted spill rather than a genuine escape.
fn is_reload_of_same_slot(block: &BasicBlock, idx: usize, store_addr: &Operand, name: &Name) -> bool {
    let Some(dest_slot) = local_name(store_addr) else {
        return false;
    };
    block.instrs[..idx].iter().rev().any(|inst| match inst {
        Instruction::Load(load) if &load.dest == name => {
            local_name(&load.address).as_ref() == Some(&dest_slot)
        }
        _ => false,
    })
}

/// Resolves a pending "may be destroyed if used later" message for
/// `name`: confirm it if `used` (the slot really was read again after
/// the callee-safe call that raised the worry), otherwise discard it.
fn resolve_cond_msg(state: &mut FreshState, name: &Name, messenger: &mut Messenger, used: bool) {
    state.cond_msgs.retain(|(n, id)| {
        if n == name {
            if used {
                messenger.confirm(*id);
            } else {
                messenger.discard(*id);
            }
            false
        } else {
            true
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn handle_call(
    func_name: &str,
    func: &Function,
    call: &llvm_ir::instruction::Call,
    block: &Name,
    idx: usize,
    allocators: &AllocatorSet,
    vector_sources: &FxHashSet<String>,
    callee_protect: &CalleeProtectTable,
    liveness: &Liveness,
    state: &mut FreshState,
    messenger: &mut Messenger,
) {
    let Some(callee) = called_function_name(call) else {
        return;
    };

    if PROTECT_FNS.iter().any(|f| &callee == f) {
        if let Some((arg, _)) = call.arguments.first() {
            if let Some(name) = local_name(arg) {
                state.clear(&name);
                resolve_cond_msg(state, &name, messenger, false);
                if state.pstack.len() < MAX_PSTACK_SIZE {
                    state.pstack.push(Some(name));
                } else {
                    state.confused = true;
                }
            }
        }
        return;
    }

    // Passing an unprotected fresh value straight into another call is
    // the sharpest case, regardless of what that call turns out to do
    // with it: the callee may trigger GC before getting a chance to
    // protect the argument itself.
    for (arg, _) in &call.arguments {
        if let Some(name) = local_name(arg) {
            if state.is_fresh(&name) {
                messenger.info(
                    func_name,
                    SourceLoc::unknown(),
                    "passes an unprotected allocation result directly to another allocating call",
                );
            }
        }
    }

    let is_allocating = allocators.allocates(&callee) || vector_sources.contains(&callee);
    let kind = callee_protect.kind_of(&callee);
    // Trivial only means "safe to call while holding a fresh pointer" when
    // the callee genuinely can't reach the allocator; an undeclared base
    // allocator also defaults to Trivial (it's external, so `callee_protect`
    // never classified it) and must still be treated as a safepoint.
    let may_reach_gc = kind != ProtectKind::CalleeSafe && (kind != ProtectKind::Trivial || is_allocating);

    if kind == ProtectKind::CalleeSafe {
        for (arg, _) in &call.arguments {
            if let Some(name) = local_name(arg) {
                if state.is_fresh(&name) {
                    let id = messenger.defer(
                        func_name,
                        Severity::Info,
                        SourceLoc::unknown(),
                        "passes a possibly unprotected pointer to a function that may destroy it if used later",
                    );
                    state.cond_msgs.push((name, id));
                }
            }
        }
    } else if may_reach_gc {
        let protected_by_callee: FxHashSet<Name> = if kind == ProtectKind::CalleeProtect {
            call.arguments.iter().filter_map(|(op, _)| local_name(op)).collect()
        } else {
            FxHashSet::default()
        };

        let still_fresh: Vec<Name> = state
            .names()
            .filter(|n| !protected_by_callee.contains(*n))
            .filter(|n| liveness.is_live_after(func, block, idx, n))
            .cloned()
            .collect();

        if !still_fresh.is_empty() {
            messenger.info(
                func_name,
                SourceLoc::unknown(),
                "calls a function that may trigger garbage collection while holding an unprotected pointer",
            );
        }

        // Using a fresh slot as an argument here resolves any pending
        // callee-safe worry about it: it really was used again.
        for (arg, _) in &call.arguments {
            if let Some(name) = local_name(arg) {
                resolve_cond_msg(state, &name, messenger, true);
            }
        }
    }

    if is_allocating {
        if let Some(dest) = &call.dest {
            state.bump(dest.clone());
        }
    }
}

fn local_name(op: &Operand) -> Option<Name> {
    match op {
        Operand::LocalOperand { name, .. } => Some(name.clone()),
        _ => None,
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_pstack_matches_balance_checker_depth() {
        assert_eq!(MAX_PSTACK_SIZE as i64, crate::balance::MAX_DEPTH);
    }

    #[test]
    fn fresh_state_default_is_empty() {
        let s = FreshState::default();
        assert!(s.fresh.is_empty());
        assert!(!s.confused);
    }

    #[test]
    fn bump_then_clear_round_trips() {
        let mut s = FreshState::default();
        let x = Name::from("x");
        s.bump(x.clone());
        s.bump(x.clone());
        assert!(s.is_fresh(&x));
        assert_eq!(s.fresh.iter().find(|(n, _)| n == &x).map(|(_, c)| *c), Some(2));
        s.clear(&x);
        assert!(!s.is_fresh(&x));
    }

    #[test]
    fn resolve_cond_msg_confirms_when_used() {
        let mut state = FreshState::default();
        let mut messenger = Messenger::new();
        let x = Name::from("x");
        let id = messenger.defer("f", Severity::Info, SourceLoc::unknown(), "maybe destroyed");
        state.cond_msgs.push((x.clone(), id));
        resolve_cond_msg(&mut state, &x, &mut messenger, true);
        assert_eq!(messenger.diagnostics().len(), 1);
        assert!(state.cond_msgs.is_empty());
    }

    #[test]
    fn resolve_cond_msg_discards_when_unused() {
        let mut state = FreshState::default();
        let mut messenger = Messenger::new();
        let x = Name::from("x");
        let id = messenger.defer("f", Severity::Info, SourceLoc::unknown(), "maybe destroyed");
        state.cond_msgs.push((x.clone(), id));
        resolve_cond_msg(&mut state, &x, &mut messenger, false);
        assert!(messenger.diagnostics().is_empty());
    }
}

/// Dominator-based extension of the max-allocating-argument heuristic
/// (supplemented feature, not restated in spec.md's component table): if
/// an argument to an allocating call is itself the fresh result of an
/// earlier allocating call in the same function, and no store between
/// that allocation and this call — on every path, i.e. on a dominating
/// block — captures it into a longer-lived location, flag it as an
/// allocating argument that escapes to the call before anything protects
/// it.
pub mod unescaped {
    use rustc_hash::FxHashMap;

    use llvm_ir::{Function, Instruction, Name};
    use llvm_ir_analysis::{CFGNode, FunctionAnalysis};
    use rootcheck_ir::{patterns::called_function_name, Module, SourceLoc};

    use crate::allocator::AllocatorSet;
    use crate::messenger::Messenger;

    use super::local_name;

    #[derive(Debug, Default)]
    pub struct UnescapedArgResult {
        pub call_sites_checked: usize,
    }

    pub fn find_unescaped_allocating_args(
        module: &Module,
        allocators: &AllocatorSet,
        messenger: &mut Messenger,
    ) -> UnescapedArgResult {
        let mut result = UnescapedArgResult::default();

        for func in &module.inner().functions {
            if func.basic_blocks.is_empty() {
                continue;
            }
            let analysis = FunctionAnalysis::new(func);
            let allocating_dests = allocating_call_dests(func, allocators);

            for block in &func.basic_blocks {
                for inst in &block.instrs {
                    let Instruction::Call(call) = inst else {
                        continue;
                    };
                    let Some(callee) = called_function_name(call) else {
                        continue;
                    };
                    if !allocators.allocates(&callee) {
                        continue;
                    }
                    result.call_sites_checked += 1;

                    for (arg, _) in &call.arguments {
                        let Some(name) = local_name(arg) else {
                            continue;
                        };
                        let Some(alloc_callee) = allocating_dests.get(&name) else {
                            continue;
                        };
                        if !has_dominating_capture(func, &analysis, &name, &block.name) {
                            messenger.info(
                                &func.name,
                                SourceLoc::unknown(),
                                format!(
                                    "passes the result of an allocating call to {alloc_callee} before it is captured anywhere a dominating protect could reach it"
                                ),
                            );
                        }
                    }
                }
            }
        }

        result
    }

    /// Maps every SSA-destination of an allocating call to that call's
    /// callee name.
    fn allocating_call_dests(func: &Function, allocators: &AllocatorSet) -> FxHashMap<Name, String> {
        let mut dests = FxHashMap::default();
        for block in &func.basic_blocks {
            for inst in &block.instrs {
                if let Instruction::Call(call) = inst {
                    if let Some(callee) = called_function_name(call) {
                        if allocators.allocates(&callee) {
                            if let Some(dest) = &call.dest {
                                dests.insert(dest.clone(), callee);
                            }
                        }
                    }
                }
            }
        }
        dests
    }

    /// True if some `store` of `name` exists in a block that dominates
    /// `use_block` (including `use_block` itself, as long as the store
    /// precedes every use within it) — i.e. `name` is captured into a
    /// longer-lived location before `use_block` is reached.
    fn has_dominating_capture(func: &Function, analysis: &FunctionAnalysis, name: &Name, use_block: &Name) -> bool {
        let dom_tree = analysis.dominator_tree();
        func.basic_blocks.iter().any(|block| {
            let captures_here = block
                .instrs
                .iter()
                .any(|inst| matches!(inst, Instruction::Store(s) if local_name(&s.value).as_ref() == Some(name)));
            captures_here && dom_tree.dominates(CFGNode::Block(&block.name), CFGNode::Block(use_block))
        })
    }
}
