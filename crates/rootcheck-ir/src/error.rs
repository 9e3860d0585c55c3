use std::path::PathBuf;

/// Errors that can occur while loading or linking an LLVM module.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse bitcode at {path}")]
    ParseBitcode { path: PathBuf },

    #[error("failed to parse textual IR at {path}: {reason}")]
    ParseIr { path: PathBuf, reason: String },

    #[error("module has no source file name")]
    MissingSourceName,
}
