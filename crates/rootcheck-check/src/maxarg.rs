//! Too-many-allocating-arguments checker.
//!
//! A call site where more than one argument is itself the direct result
//! of an allocating call is a classic ordering bug: the compiler is free
//! to evaluate arguments in any order, so if two sibling arguments both
//! allocate, the first one's result can be collected before it's ever
//! protected. Purely syntactic — no dataflow needed beyond "is this
//! argument itself a call to an allocator".

use llvm_ir::{Instruction, Operand};
use rootcheck_ir::{patterns::called_function_name, Module, SourceLoc};

use crate::allocator::AllocatorSet;
use crate::messenger::Messenger;

#[derive(Debug, Default)]
pub struct MaxArgResult {
    pub call_sites_checked: usize,
}

pub fn check_max_allocating_args(
    module: &Module,
    allocators: &AllocatorSet,
    messenger: &mut Messenger,
) -> MaxArgResult {
    let mut result = MaxArgResult::default();

    for func in &module.inner().functions {
        for block in &func.basic_blocks {
            for inst in &block.instrs {
                let Instruction::Call(call) = inst else {
                    continue;
                };
                result.call_sites_checked += 1;

                let allocating_args = call
                    .arguments
                    .iter()
                    .filter(|(op, _)| is_allocating_call_result(func, op, allocators))
                    .count();

                if allocating_args > 1 {
                    let callee = called_function_name(call).unwrap_or_default();
                    messenger.info(
                        &func.name,
                        SourceLoc::unknown(),
                        format!(
                            "call to `{callee}` has {allocating_args} arguments that are themselves unprotected allocation results"
                        ),
                    );
                }
            }
        }
    }

    result
}

fn is_allocating_call_result(func: &llvm_ir::Function, op: &Operand, allocators: &AllocatorSet) -> bool {
    let Operand::LocalOperand { name, .. } = op else {
        return false;
    };
    for block in &func.basic_blocks {
        for inst in &block.instrs {
            if let Instruction::Call(call) = inst {
                if call.dest.as_ref() == Some(name) {
                    if let Some(callee) = called_function_name(call) {
                        return allocators.allocates(&callee);
                    }
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_result_checks_nothing() {
        assert_eq!(MaxArgResult::default().call_sites_checked, 0);
    }
}
