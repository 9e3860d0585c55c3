//! Vector-returning inference (component G).
//!
//! Builds on the context table (component F) to answer "does this call,
//! in this context, return a vector value" more precisely than the
//! context-insensitive allocator set can. The one hard-coded exception
//! mirrors the runtime's own special case: `getAttrib(x, dimnamesSymbol)`
//! returns a vector even though `getAttrib` in general returns an
//! arbitrary attribute value (which may be a list, `NULL`, or anything
//! else).

use rustc_hash::{FxHashMap, FxHashSet};

use llvm_ir::{Instruction, Terminator};
use rootcheck_ir::{patterns::called_function_name, FunctionId, Module};

use crate::allocator::AllocatorSet;
use crate::context::{AbstractArg, CalledFunctionId, Context, ContextTable};
use crate::symbols::SymbolTable;

const GET_ATTRIB: &str = "get_attrib";
const DIMNAMES_LITERAL_HINT: &str = "dimnames";

/// The set of call sites (by their interned [`CalledFunctionId`]) known
/// to return a vector value.
#[derive(Debug, Default)]
pub struct VectorReturnSet {
    ids: FxHashSet<CalledFunctionId>,
}

impl VectorReturnSet {
    pub fn returns_vector(&self, id: CalledFunctionId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Walk every call site in `module`, interning its abstracted arguments
/// into `table`, and flag call sites known to yield a vector value: base
/// vector allocators, functions whose body always returns the result of
/// one, and the `get_attrib(_, dimnamesSymbol)` special case.
pub fn infer_vector_returning(
    module: &Module,
    table: &mut ContextTable,
    allocators: &AllocatorSet,
    symbols: &SymbolTable,
) -> VectorReturnSet {
    let mut ids = FxHashSet::default();
    let ids_by_func = module.function_ids();

    for func in &module.inner().functions {
        for block in &func.basic_blocks {
            for inst in &block.instrs {
                let Instruction::Call(call) = inst else {
                    continue;
                };
                let Some(callee) = called_function_name(call) else {
                    continue;
                };
                let Some(&(callee_id, _)) = ids_by_func.iter().find(|(_, n)| *n == callee) else {
                    continue;
                };

                let ctx: Context = call
                    .arguments
                    .iter()
                    .map(|(op, _)| abstract_arg(op, symbols))
                    .collect();
                let call_id = table.intern(callee_id, ctx.clone());

                let is_vector = callee.contains("alloc_vector")
                    || allocators.allocates(&callee) && callee.contains("vector")
                    || is_dimnames_get_attrib(&callee, &ctx);

                if is_vector {
                    ids.insert(call_id);
                }
            }
        }
    }

    // A thin wrapper (`f(t) { return allocVector(t); }`) only returns a
    // vector in the contexts where its own vector-type argument is known;
    // propagate that one hop from the base allocator call sites already
    // classified above out to f's own call sites.
    let wrapper_args: FxHashMap<FunctionId, usize> = ids_by_func
        .iter()
        .filter_map(|&(id, name)| {
            let func = module.function(name)?;
            find_vector_wrapper_arg(func).map(|idx| (id, idx))
        })
        .collect();

    for (call_id, func_id, ctx) in table.iter() {
        if let Some(&idx) = wrapper_args.get(&func_id) {
            if matches!(ctx.get(idx), Some(AbstractArg::Symbol(_))) {
                ids.insert(call_id);
            }
        }
    }

    VectorReturnSet { ids }
}

fn abstract_arg(op: &llvm_ir::Operand, symbols: &SymbolTable) -> AbstractArg {
    match op {
        llvm_ir::Operand::ConstantOperand(c) => match c.as_ref() {
            llvm_ir::Constant::GlobalReference { name, .. } => {
                let global = name.to_string();
                match symbols.literal_for_global(&global) {
                    Some(lit) => AbstractArg::Symbol(std::rc::Rc::from(lit)),
                    None => AbstractArg::Bottom,
                }
            }
            llvm_ir::Constant::Int { value, .. } => AbstractArg::Symbol(std::rc::Rc::from(value.to_string())),
            _ => AbstractArg::Bottom,
        },
        _ => AbstractArg::Bottom,
    }
}

/// Recognizes `fn f(..., t, ...) { return allocVector(t); }`: a function
/// whose only return value is the direct result of a vector-allocating
/// call passed one of `f`'s own formal parameters unmodified. Returns
/// that parameter's index, since a call site of `f` only resolves to a
/// vector when the matching context slot is a known constant.
fn find_vector_wrapper_arg(func: &llvm_ir::Function) -> Option<usize> {
    for block in &func.basic_blocks {
        let Terminator::Ret(ret) = &block.term else {
            continue;
        };
        let Some(op) = &ret.return_operand else {
            continue;
        };
        let llvm_ir::Operand::LocalOperand { name, .. } = op else {
            continue;
        };
        let Some(call) = block.instrs.iter().find_map(|inst| match inst {
            Instruction::Call(c) if c.dest.as_ref() == Some(name) => Some(c),
            _ => None,
        }) else {
            continue;
        };
        let Some(callee) = called_function_name(call) else {
            continue;
        };
        if !callee.contains("alloc_vector") {
            continue;
        }
        let Some((arg_op, _)) = call.arguments.first() else {
            continue;
        };
        let llvm_ir::Operand::LocalOperand { name: arg_name, .. } = arg_op else {
            continue;
        };
        if let Some(idx) = func.parameters.iter().position(|p| &p.name == arg_name) {
            return Some(idx);
        }
    }
    None
}

fn is_dimnames_get_attrib(callee: &str, ctx: &[AbstractArg]) -> bool {
    if !callee.contains(GET_ATTRIB) {
        return false;
    }
    ctx.iter().any(|a| match a {
        AbstractArg::Symbol(s) => s.contains(DIMNAMES_LITERAL_HINT),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_has_no_vectors() {
        let set = VectorReturnSet::default();
        assert!(set.is_empty());
        assert!(!set.returns_vector(CalledFunctionId(0)));
    }

    #[test]
    fn dimnames_exception_requires_matching_symbol() {
        let ctx = vec![AbstractArg::Bottom, AbstractArg::Symbol(std::rc::Rc::from("other"))];
        assert!(!is_dimnames_get_attrib("get_attrib", &ctx));
        let ctx2 = vec![AbstractArg::Bottom, AbstractArg::Symbol(std::rc::Rc::from("dimnames"))];
        assert!(is_dimnames_get_attrib("get_attrib", &ctx2));
    }
}
