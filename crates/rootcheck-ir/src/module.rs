//! Owns a parsed [`llvm_ir::Module`] plus the small amount of bookkeeping
//! every checker needs: a stable, sorted function list and the set of
//! function names that came from a linked-in module (so drivers can
//! restrict reporting to "the code we actually care about").

use std::path::Path;

use llvm_ir::Module as LlvmModule;
use rustc_hash::FxHashSet;

use crate::error::Error;
use crate::function::FunctionId;

/// A loaded, optionally-linked LLVM module, ready for analysis.
pub struct Module {
    inner: LlvmModule,
    /// Names of functions that were pulled in from a `--link`ed module,
    /// rather than defined in the base module.
    linked_names: FxHashSet<String>,
    /// Function names in a stable, deterministic order (by name).
    order: Vec<String>,
}

impl Module {
    /// Load a single base module, with no linking.
    pub fn load(base: &Path) -> Result<Self, Error> {
        let inner = parse_one(base)?;
        let mut m = Module {
            inner,
            linked_names: FxHashSet::default(),
            order: Vec::new(),
        };
        m.reindex();
        Ok(m)
    }

    /// Load a base module and link a second module into it, downgrading
    /// every global and function in the linked module to weak linkage
    /// first so that base-module definitions win on symbol clashes.
    pub fn load_and_link(base: &Path, link: &Path) -> Result<Self, Error> {
        let mut inner = parse_one(base)?;
        let mut other = parse_one(link)?;

        for func in &mut other.functions {
            func.linkage = llvm_ir::module::Linkage::WeakAny;
        }
        for global in &mut other.global_vars {
            global.linkage = llvm_ir::module::Linkage::WeakAny;
        }

        let linked_names: FxHashSet<String> = other
            .functions
            .iter()
            .map(|f| f.name.clone())
            .collect();

        inner.functions.extend(other.functions);
        inner.global_vars.extend(other.global_vars);

        let mut m = Module {
            inner,
            linked_names,
            order: Vec::new(),
        };
        m.reindex();
        Ok(m)
    }

    fn reindex(&mut self) {
        self.order = self.inner.functions.iter().map(|f| f.name.clone()).collect();
        self.order.sort();
    }

    /// Access the underlying parsed module.
    pub fn inner(&self) -> &LlvmModule {
        &self.inner
    }

    /// Function names in deterministic, sorted order.
    pub fn function_names(&self) -> &[String] {
        &self.order
    }

    /// True if `name` should be reported on: either there was no linked
    /// module (everything is "ours"), or `name` came from the linked
    /// module specifically, matching the convention that the base module
    /// is the trusted runtime and the linked module is the code under
    /// review.
    pub fn is_reportable(&self, name: &str) -> bool {
        self.linked_names.is_empty() || self.linked_names.contains(name)
    }

    /// Look up a function definition by name.
    pub fn function(&self, name: &str) -> Option<&llvm_ir::Function> {
        self.inner.functions.iter().find(|f| f.name == name)
    }

    /// Assign stable, dense ids to every defined function, in the same
    /// sorted order as [`Module::function_names`].
    pub fn function_ids(&self) -> Vec<(FunctionId, &str)> {
        self.order
            .iter()
            .enumerate()
            .map(|(i, n)| (FunctionId(i as u32), n.as_str()))
            .collect()
    }
}

fn parse_one(path: &Path) -> Result<LlvmModule, Error> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if ext == "ll" {
        LlvmModule::from_ir_path(path).map_err(|reason| Error::ParseIr {
            path: path.to_path_buf(),
            reason,
        })
    } else {
        LlvmModule::from_bc_path(path).map_err(|_| Error::ParseBitcode {
            path: path.to_path_buf(),
        })
    }
}
