//! Best-effort source location extraction from debug metadata.

use std::path::PathBuf;

use llvm_ir::debugloc::{DebugLoc, HasDebugLoc};

/// A source location rendered as `path:line`, or left blank when the
/// module was compiled without debug info.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceLoc {
    pub path: Option<PathBuf>,
    pub line: Option<u32>,
}

impl SourceLoc {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn new(path: impl Into<PathBuf>, line: u32) -> Self {
        Self {
            path: Some(path.into()),
            line: Some(line),
        }
    }

    fn from_debug_loc(loc: Option<&DebugLoc>) -> Self {
        match loc {
            Some(dl) => {
                let mut path = PathBuf::new();
                if let Some(dir) = &dl.directory {
                    path.push(dir);
                }
                path.push(&dl.filename);
                Self {
                    path: Some(path),
                    line: Some(dl.line),
                }
            }
            None => Self::unknown(),
        }
    }

    /// Extract the location an instruction or terminator was compiled
    /// from, via its debug metadata attachment.
    pub fn of(instr: &impl HasDebugLoc) -> Self {
        Self::from_debug_loc(instr.get_debug_loc().as_ref())
    }

    /// `path line`, space-separated rather than this type's colon-joined
    /// `Display` — the format the safepoint-line lister uses, as opposed
    /// to the diagnostic formatter. `None` when the location is unknown.
    pub fn as_space_separated(&self) -> Option<String> {
        match (&self.path, self.line) {
            (Some(p), Some(l)) => Some(format!("{} {}", p.display(), l)),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.path, self.line) {
            (Some(p), Some(l)) => write!(f, "{}:{}", p.display(), l),
            (Some(p), None) => write!(f, "{}", p.display()),
            _ => write!(f, "<unknown location>"),
        }
    }
}
