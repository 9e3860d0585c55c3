//! Guard variable checkers (component H).
//!
//! A "guard" is a local whose value is tested on every path before it's
//! used, narrowing what the balance/fresh checkers (K/L) can assume about
//! it downstream — e.g. `if (x) { UNPROTECT(1); }` means the unprotect
//! only happens on the branch where `x` was nonzero. Two kinds of guard
//! show up in practice: a plain integer flag, and a managed pointer
//! tested against null. They're different enough in what counts as "the
//! same value" to warrant separate state lattices, but identical in how
//! the path interpreter drives them, so both implement [`GuardChecker`]
//! instead of duplicating that control flow.

use llvm_ir::{instruction::ICmp, BasicBlock, Instruction, IntPredicate, Name, Operand};

/// Either guard checker's belief about one variable's value, generic over
/// what "seen" means for that checker.
pub trait GuardChecker {
    type State: Clone + Copy + PartialEq + Eq + std::hash::Hash;

    /// The starting state for a guard variable before anything is known
    /// about it.
    fn bottom(&self) -> Self::State;

    /// Update belief about `var` after observing a conditional branch on
    /// it; returns the state to carry down the true and false edges.
    fn on_branch(&self, prior: Self::State, var_is_true_edge: bool) -> Self::State;

    /// Join two states arriving at the same program point from different
    /// paths.
    fn join(&self, a: Self::State, b: Self::State) -> Self::State;

    /// Compress a state into a small integer for use as part of a
    /// visited-states dedup key.
    fn pack(&self, state: Self::State) -> u8;
}

/// Belief about an integer-valued guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntGuardState {
    Unknown,
    Zero,
    Nonzero,
    SeenBoth,
}

pub struct IntGuardChecker;

impl GuardChecker for IntGuardChecker {
    type State = IntGuardState;

    fn bottom(&self) -> Self::State {
        IntGuardState::Unknown
    }

    fn on_branch(&self, _prior: Self::State, var_is_true_edge: bool) -> Self::State {
        if var_is_true_edge {
            IntGuardState::Nonzero
        } else {
            IntGuardState::Zero
        }
    }

    fn join(&self, a: Self::State, b: Self::State) -> Self::State {
        if a == b {
            a
        } else {
            IntGuardState::SeenBoth
        }
    }

    fn pack(&self, state: Self::State) -> u8 {
        match state {
            IntGuardState::Unknown => 0,
            IntGuardState::Zero => 1,
            IntGuardState::Nonzero => 2,
            IntGuardState::SeenBoth => 3,
        }
    }
}

/// Belief about a managed-pointer guard tested against null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtrGuardState {
    Unknown,
    Null,
    NonNull,
    SeenBoth,
}

pub struct PtrGuardChecker;

impl GuardChecker for PtrGuardChecker {
    type State = PtrGuardState;

    fn bottom(&self) -> Self::State {
        PtrGuardState::Unknown
    }

    fn on_branch(&self, _prior: Self::State, var_is_true_edge: bool) -> Self::State {
        if var_is_true_edge {
            PtrGuardState::NonNull
        } else {
            PtrGuardState::Null
        }
    }

    fn join(&self, a: Self::State, b: Self::State) -> Self::State {
        if a == b {
            a
        } else {
            PtrGuardState::SeenBoth
        }
    }

    fn pack(&self, state: Self::State) -> u8 {
        match state {
            PtrGuardState::Unknown => 0,
            PtrGuardState::Null => 1,
            PtrGuardState::NonNull => 2,
            PtrGuardState::SeenBoth => 3,
        }
    }
}

/// Recognizes `icmp eq/ne <var>, 0` (the integer-guard idiom) or
/// `icmp eq/ne <var>, null` (the pointer-guard idiom), returning the
/// tested local and whether equality (`var == 0`/`null`) is the
/// comparison, as opposed to inequality.
pub fn recognize_guard_test(cmp: &ICmp) -> Option<(Name, bool)> {
    let is_eq = match cmp.predicate {
        IntPredicate::EQ => true,
        IntPredicate::NE => false,
        _ => return None,
    };
    let var = match (&cmp.operand0, &cmp.operand1) {
        (Operand::LocalOperand { name, .. }, Operand::ConstantOperand(c))
            if is_zero_or_null(c) =>
        {
            name.clone()
        }
        (Operand::ConstantOperand(c), Operand::LocalOperand { name, .. })
            if is_zero_or_null(c) =>
        {
            name.clone()
        }
        _ => return None,
    };
    Some((var, is_eq))
}

/// Looks up the `icmp` instruction in `block` whose result is `dest` —
/// shared by the balance (K) and fresh-variable (L) checkers, both of
/// which need to trace a branch condition back to the comparison that
/// produced it before calling [`recognize_guard_test`].
pub fn find_icmp_defining<'a>(block: &'a BasicBlock, dest: &Name) -> Option<&'a ICmp> {
    block.instrs.iter().find_map(|inst| match inst {
        Instruction::ICmp(cmp) if &cmp.dest == dest => Some(cmp),
        _ => None,
    })
}

fn is_zero_or_null(c: &llvm_ir::Constant) -> bool {
    matches!(
        c,
        llvm_ir::Constant::Int { value: 0, .. } | llvm_ir::Constant::Null(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_guard_join_of_equal_states_is_stable() {
        let c = IntGuardChecker;
        assert_eq!(c.join(IntGuardState::Zero, IntGuardState::Zero), IntGuardState::Zero);
    }

    #[test]
    fn int_guard_join_of_different_states_is_seen_both() {
        let c = IntGuardChecker;
        assert_eq!(
            c.join(IntGuardState::Zero, IntGuardState::Nonzero),
            IntGuardState::SeenBoth
        );
    }

    #[test]
    fn ptr_guard_branch_narrows_correctly() {
        let c = PtrGuardChecker;
        assert_eq!(c.on_branch(PtrGuardState::Unknown, true), PtrGuardState::NonNull);
        assert_eq!(c.on_branch(PtrGuardState::Unknown, false), PtrGuardState::Null);
    }

    #[test]
    fn pack_is_distinct_per_state() {
        let c = IntGuardChecker;
        let mut packed: Vec<u8> = [
            IntGuardState::Unknown,
            IntGuardState::Zero,
            IntGuardState::Nonzero,
            IntGuardState::SeenBoth,
        ]
        .iter()
        .map(|s| c.pack(*s))
        .collect();
        packed.sort_unstable();
        packed.dedup();
        assert_eq!(packed.len(), 4);
    }
}
