//! Deduplicating diagnostic sink shared by every checker (component M).
//!
//! Each checker reports through a `Messenger` keyed to the function it is
//! currently analyzing. Messages are deduplicated per function so that a
//! path-sensitive interpreter visiting the same instruction along many
//! paths emits it once. Some checkers need to report a message only if a
//! later event confirms it matters — `defer`/`confirm`/`discard` model
//! that without the checker needing its own buffering.

use rustc_hash::FxHashSet;

use rootcheck_ir::SourceLoc;

/// How serious a diagnostic is. Ordered; `Error` is the only severity
/// that should ever affect a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Trace,
    Info,
    Error,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Error => "ERROR",
        }
    }
}

/// One reported fact about a function under analysis.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub function: String,
    pub severity: Severity,
    pub message: String,
    pub loc: SourceLoc,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}: {} ({})",
            self.severity.label(),
            self.function,
            self.message,
            self.loc
        )
    }
}

/// An id for a message that has been buffered but not yet decided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeferredId(usize);

struct Deferred {
    diag: Diagnostic,
}

/// Collects, deduplicates, and optionally defers diagnostics.
#[derive(Default)]
pub struct Messenger {
    min_severity: Option<Severity>,
    seen: FxHashSet<(String, String)>,
    emitted: Vec<Diagnostic>,
    pending: Vec<Option<Deferred>>,
}

impl Messenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only emit diagnostics at or above `min`. Used by drivers that only
    /// want `Error`-level output.
    pub fn with_min_severity(min: Severity) -> Self {
        Self {
            min_severity: Some(min),
            ..Self::default()
        }
    }

    pub fn debug(&mut self, function: &str, loc: SourceLoc, message: impl Into<String>) {
        self.report(function, Severity::Debug, loc, message.into());
    }

    pub fn trace(&mut self, function: &str, loc: SourceLoc, message: impl Into<String>) {
        self.report(function, Severity::Trace, loc, message.into());
    }

    pub fn info(&mut self, function: &str, loc: SourceLoc, message: impl Into<String>) {
        self.report(function, Severity::Info, loc, message.into());
    }

    pub fn error(&mut self, function: &str, loc: SourceLoc, message: impl Into<String>) {
        self.report(function, Severity::Error, loc, message.into());
    }

    fn report(&mut self, function: &str, severity: Severity, loc: SourceLoc, message: String) {
        if let Some(min) = self.min_severity {
            if severity < min {
                return;
            }
        }
        let key = (function.to_string(), message.clone());
        if !self.seen.insert(key) {
            return;
        }
        self.emitted.push(Diagnostic {
            function: function.to_string(),
            severity,
            message,
            loc,
        });
    }

    /// Buffer a message without deciding yet whether it will be shown.
    /// Used by the balance/fresh checkers for findings that only matter
    /// if a later event (e.g. reaching a return without cleanup) confirms
    /// them.
    pub fn defer(
        &mut self,
        function: &str,
        severity: Severity,
        loc: SourceLoc,
        message: impl Into<String>,
    ) -> DeferredId {
        let id = self.pending.len();
        self.pending.push(Some(Deferred {
            diag: Diagnostic {
                function: function.to_string(),
                severity,
                message: message.into(),
                loc,
            },
        }));
        DeferredId(id)
    }

    /// Flush a previously deferred message into the normal, deduplicated
    /// stream.
    pub fn confirm(&mut self, id: DeferredId) {
        if let Some(slot) = self.pending.get_mut(id.0) {
            if let Some(deferred) = slot.take() {
                self.report(
                    &deferred.diag.function,
                    deferred.diag.severity,
                    deferred.diag.loc,
                    deferred.diag.message,
                );
            }
        }
    }

    /// Drop a previously deferred message; it will never be shown.
    pub fn discard(&mut self, id: DeferredId) {
        if let Some(slot) = self.pending.get_mut(id.0) {
            *slot = None;
        }
    }

    /// All diagnostics emitted so far, in emission order.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.emitted
    }

    pub fn has_errors(&self) -> bool {
        self.emitted.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_identical_messages_per_function() {
        let mut m = Messenger::new();
        m.info("foo", SourceLoc::unknown(), "has unbalanced call");
        m.info("foo", SourceLoc::unknown(), "has unbalanced call");
        m.info("bar", SourceLoc::unknown(), "has unbalanced call");
        assert_eq!(m.diagnostics().len(), 2);
    }

    #[test]
    fn min_severity_filters_out_low_priority() {
        let mut m = Messenger::with_min_severity(Severity::Error);
        m.debug("foo", SourceLoc::unknown(), "protect call");
        m.info("foo", SourceLoc::unknown(), "suspicious");
        assert!(m.diagnostics().is_empty());
        m.error("foo", SourceLoc::unknown(), "too many states");
        assert_eq!(m.diagnostics().len(), 1);
    }

    #[test]
    fn deferred_messages_only_show_when_confirmed() {
        let mut m = Messenger::new();
        let id = m.defer("foo", Severity::Error, SourceLoc::unknown(), "leaked protect");
        assert!(m.diagnostics().is_empty());
        m.confirm(id);
        assert_eq!(m.diagnostics().len(), 1);
    }

    #[test]
    fn discarded_deferred_messages_never_show() {
        let mut m = Messenger::new();
        let id = m.defer("foo", Severity::Error, SourceLoc::unknown(), "leaked protect");
        m.discard(id);
        m.confirm(id);
        assert!(m.diagnostics().is_empty());
    }

    #[test]
    fn has_errors_checks_severity() {
        let mut m = Messenger::new();
        m.info("foo", SourceLoc::unknown(), "note");
        assert!(!m.has_errors());
        m.error("foo", SourceLoc::unknown(), "bad");
        assert!(m.has_errors());
    }
}
