//! Small, syntactic pattern recognizers shared by several checkers.
//!
//! These never look past a single instruction or a short, fixed chain of
//! instructions — anything that needs real dataflow belongs in
//! `rootcheck-check`, not here.

use llvm_ir::instruction::{Call, GetElementPtr, ICmp, Load, Store};
use llvm_ir::{BasicBlock, Constant, Instruction, Name, Operand};

/// How many casts/bitcasts `operand_feeds_from_call` will walk through
/// before giving up — the idiom this recognizes is a tag extraction
/// wrapped in at most a couple of narrowing casts, never an arbitrary
/// chain.
const MAX_HOPS: usize = 4;

/// Recognizes `icmp <pred> (…call…), <const>` — the "is this managed
/// value of this type" idiom, however many layers of truncation or
/// bitcast wrap the actual type-tag extraction call.
pub fn is_type_test_call(block: &BasicBlock, cmp: &ICmp) -> bool {
    operand_feeds_from_call(block, &cmp.operand0) || operand_feeds_from_call(block, &cmp.operand1)
}

/// True if `operand` is the (possibly cast) result of a `call`
/// instruction defined earlier in `block`.
fn operand_feeds_from_call(block: &BasicBlock, operand: &Operand) -> bool {
    let Operand::LocalOperand { name, .. } = operand else {
        return false;
    };
    let mut current = name.clone();
    for _ in 0..MAX_HOPS {
        let Some(defining) = block.instrs.iter().find(|inst| defines(inst, &current)) else {
            return false;
        };
        match defining {
            Instruction::Call(_) => return true,
            Instruction::BitCast(b) => match &b.operand {
                Operand::LocalOperand { name, .. } => current = name.clone(),
                _ => return false,
            },
            _ => return false,
        }
    }
    false
}

fn defines(inst: &Instruction, name: &Name) -> bool {
    match inst {
        Instruction::Call(c) => c.dest.as_ref() == Some(name),
        Instruction::BitCast(b) => &b.dest == name,
        _ => false,
    }
}

/// Recognizes a call that allocates a vector of a statically-known element
/// type, i.e. the element-type argument is a literal constant rather than
/// a value computed along some path.
pub fn is_alloc_vector_of_known_type(call: &Call) -> Option<u64> {
    let callee_name = called_function_name(call)?;
    if !callee_name.contains("allocVector") && !callee_name.contains("alloc_vector") {
        return None;
    }
    call.arguments.first().and_then(|(op, _)| match op {
        Operand::ConstantOperand(c) => match c.as_ref() {
            Constant::Int { value, .. } => Some(*value),
            _ => None,
        },
        _ => None,
    })
}

/// Recognizes `store <value>, <ptr>` where `<ptr>` is a GEP into a
/// struct field (as opposed to a plain local/global slot).
pub fn is_store_to_struct_field<'a>(
    store: &'a Store,
    gep_of: impl Fn(&Operand) -> Option<&'a GetElementPtr>,
) -> bool {
    gep_of(&store.address)
        .map(|gep| gep.indices.len() >= 2)
        .unwrap_or(false)
}

/// True if `slot` is only ever the destination of `store` instructions
/// within `stores_to_slot` (i.e. never has its address taken, never
/// aliased) — the precondition several heuristics rely on before trusting
/// a backward slot-flow approximation.
pub fn is_only_store_to_var(slot: &Name, all_stores: &[&Store]) -> bool {
    all_stores
        .iter()
        .all(|s| matches!(&s.address, Operand::LocalOperand { name, .. } if name == slot))
}

/// True if `load` reads the same slot that `store` most recently wrote,
/// under the syntactic assumption that both operate directly on a local
/// alloca (no intervening GEP/bitcast).
pub fn aliases_variable(load: &Load, store: &Store) -> bool {
    match (&load.address, &store.address) {
        (Operand::LocalOperand { name: a, .. }, Operand::LocalOperand { name: b, .. }) => a == b,
        _ => false,
    }
}

pub fn called_function_name(call: &Call) -> Option<String> {
    match &call.function {
        either::Either::Right(Operand::ConstantOperand(c)) => match c.as_ref() {
            Constant::GlobalReference { name, .. } => Some(name.to_string()),
            _ => None,
        },
        _ => None,
    }
}
