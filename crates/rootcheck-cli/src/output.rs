//! Shared colored output for CLI subcommands.
//!
//! Uses `termcolor` for cross-platform colored terminal output. Respects
//! the `NO_COLOR` environment variable and the global `--color` flag.

use std::io::Write;

use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use rootcheck_check::{Diagnostic, Severity};

/// Resolve `ColorChoice` from the CLI flag and environment.
///
/// Priority: `NO_COLOR` env > `--color` flag > auto-detect TTY.
pub fn resolve_color_choice(flag: Option<&str>) -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() {
        return ColorChoice::Never;
    }
    match flag {
        Some("always") => ColorChoice::Always,
        Some("never") => ColorChoice::Never,
        _ => ColorChoice::Auto,
    }
}

pub struct StyledOutput {
    stdout: StandardStream,
}

impl StyledOutput {
    pub fn new(choice: ColorChoice) -> Self {
        Self {
            stdout: StandardStream::stdout(choice),
        }
    }

    fn write_styled(&mut self, text: &str, color: Color, bold: bool) {
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(color)).set_bold(bold);
        let _ = self.stdout.set_color(&spec);
        let _ = write!(self.stdout, "{text}");
        let _ = self.stdout.reset();
    }

    pub fn diagnostic(&mut self, diag: &Diagnostic) {
        let (color, bold) = match diag.severity {
            Severity::Error => (Color::Red, true),
            Severity::Info => (Color::Yellow, false),
            Severity::Trace => (Color::Cyan, false),
            Severity::Debug => (Color::White, false),
        };
        self.write_styled(&format!("[{}]", diag.severity.label()), color, bold);
        let _ = writeln!(self.stdout, " {}: {} ({})", diag.function, diag.message, diag.loc);
    }

    pub fn plain_line(&mut self, text: &str) {
        let _ = writeln!(self.stdout, "{text}");
    }

    pub fn success(&mut self, text: &str) {
        self.write_styled(text, Color::Green, true);
        let _ = writeln!(self.stdout);
    }

    /// A sanity-check line confirming two independent classifications of
    /// the same call site agree.
    pub fn good(&mut self, text: &str) {
        self.write_styled("GOOD: ", Color::Green, false);
        let _ = writeln!(self.stdout, "{text}");
    }

    /// A sanity-check line flagging two independent classifications of
    /// the same call site that disagree.
    pub fn bad(&mut self, text: &str) {
        self.write_styled("ERROR: ", Color::Red, true);
        let _ = writeln!(self.stdout, "{text}");
    }

    pub fn flush(&mut self) {
        let _ = self.stdout.flush();
    }
}
