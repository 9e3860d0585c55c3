//! Context-sensitive called-function table (component F).
//!
//! Most checkers only need to know "does this function allocate", which
//! component E answers context-insensitively. A handful of call sites
//! (vector-returning inference, component G) need a sharper answer: "does
//! this function allocate a vector of type `T` *given that argument 2 is
//! the interned symbol `dimnames`*". This table interns
//! `(FunctionId, Context)` pairs into a dense [`CalledFunctionId`], so
//! those checkers can run their fixed point over call sites instead of
//! functions.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use rootcheck_ir::FunctionId;

/// A coarse abstraction of a single actual argument at a call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AbstractArg {
    /// Nothing useful is known about this argument.
    Bottom,
    /// The argument is always the same interned symbol at this call site.
    Symbol(Rc<str>),
    /// The argument is always a vector value.
    Vector,
}

/// The abstracted actual-argument list at a call site.
pub type Context = Box<[AbstractArg]>;

/// A dense id for one `(FunctionId, Context)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CalledFunctionId(pub u32);

/// Interns `(FunctionId, Context)` pairs. The all-[`AbstractArg::Bottom`]
/// context for a function is always interned first, so it is safe to
/// assume every function that has at least one call in the table also has
/// a context-insensitive entry.
#[derive(Default)]
pub struct ContextTable {
    entries: Vec<(FunctionId, Context)>,
    index: FxHashMap<(FunctionId, Context), CalledFunctionId>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `ctx` for `func`, inserting the all-bottom context first if
    /// this is the first time `func` is seen.
    pub fn intern(&mut self, func: FunctionId, ctx: Context) -> CalledFunctionId {
        if !self.entries.iter().any(|(f, _)| *f == func) {
            let bottom: Context = ctx.iter().map(|_| AbstractArg::Bottom).collect();
            self.insert(func, bottom);
        }
        self.insert(func, ctx)
    }

    fn insert(&mut self, func: FunctionId, ctx: Context) -> CalledFunctionId {
        if let Some(id) = self.index.get(&(func, ctx.clone())) {
            return *id;
        }
        let id = CalledFunctionId(self.entries.len() as u32);
        self.entries.push((func, ctx.clone()));
        self.index.insert((func, ctx), id);
        id
    }

    pub fn function_of(&self, id: CalledFunctionId) -> FunctionId {
        self.entries[id.0 as usize].0
    }

    pub fn context_of(&self, id: CalledFunctionId) -> &[AbstractArg] {
        &self.entries[id.0 as usize].1
    }

    /// The context-insensitive (all-bottom) entry for `func`, if any call
    /// site for it has been interned.
    pub fn context_insensitive_id(&self, func: FunctionId) -> Option<CalledFunctionId> {
        self.entries.iter().position(|(f, ctx)| {
            *f == func && ctx.iter().all(|a| matches!(a, AbstractArg::Bottom))
        }).map(|i| CalledFunctionId(i as u32))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every interned call-site context, in interning order.
    pub fn iter(&self) -> impl Iterator<Item = (CalledFunctionId, FunctionId, &Context)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, (f, ctx))| (CalledFunctionId(i as u32), *f, ctx))
    }
}

/// True if any argument in `ctx` is more precise than [`AbstractArg::Bottom`].
pub fn is_non_default_context(ctx: &[AbstractArg]) -> bool {
    ctx.iter().any(|a| !matches!(a, AbstractArg::Bottom))
}

/// Renders a context for diagnostic output: `⟨?,V,16⟩`, one symbol per
/// argument position (`?` for [`AbstractArg::Bottom`], `V` for
/// [`AbstractArg::Vector`], the interned text for [`AbstractArg::Symbol`]).
pub fn format_context(ctx: &[AbstractArg]) -> String {
    let rendered: Vec<&str> = ctx
        .iter()
        .map(|a| match a {
            AbstractArg::Bottom => "?",
            AbstractArg::Vector => "V",
            AbstractArg::Symbol(s) => s.as_ref(),
        })
        .collect();
    format!("⟨{}⟩", rendered.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_always_creates_bottom_context_first() {
        let mut table = ContextTable::new();
        let f = FunctionId(3);
        let ctx: Context = vec![AbstractArg::Symbol(Rc::from("dimnames"))].into_boxed_slice();
        let id = table.intern(f, ctx);

        assert!(table.context_insensitive_id(f).is_some());
        assert_eq!(table.function_of(id), f);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn same_context_interns_to_same_id() {
        let mut table = ContextTable::new();
        let f = FunctionId(0);
        let ctx1: Context = vec![AbstractArg::Vector].into_boxed_slice();
        let ctx2: Context = vec![AbstractArg::Vector].into_boxed_slice();

        let id1 = table.intern(f, ctx1);
        let id2 = table.intern(f, ctx2);
        assert_eq!(id1, id2);
    }
}
