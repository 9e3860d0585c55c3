//! Read-only facade over an `llvm-ir`-parsed module.
//!
//! This crate owns parsing and linking; every other crate in the
//! workspace sees only [`Module`], [`FunctionId`] and the syntactic
//! pattern recognizers in [`patterns`] — never `llvm_ir` types directly
//! outside of a handful of call sites.

pub mod error;
pub mod function;
pub mod location;
pub mod module;
pub mod patterns;

pub use error::Error;
pub use function::FunctionId;
pub use location::SourceLoc;
pub use module::Module;

/// Re-exported so downstream crates that genuinely need to inspect raw
/// IR (the checkers do, extensively) don't need their own `llvm-ir` dep
/// pinned to a matching version.
pub use llvm_ir;
