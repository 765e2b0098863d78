//! Colored output for the launcher.
//!
//! Uses `termcolor` for cross-platform colored terminal output. Respects
//! the `NO_COLOR` environment variable.

use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Resolve the color choice from the environment.
pub fn resolve_color_choice() -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() {
        ColorChoice::Never
    } else {
        ColorChoice::Auto
    }
}

/// Styled output writer for the launcher.
pub struct Output {
    stderr: StandardStream,
    verbose: bool,
}

impl Output {
    /// Create an output writer; verbose gates the diagnostic lines.
    pub fn new(verbose: bool) -> Self {
        Self {
            stderr: StandardStream::stderr(resolve_color_choice()),
            verbose,
        }
    }

    /// One-line error report: `error: <category>: <cause>`.
    pub fn error(&mut self, category: &str, cause: &str) {
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(Color::Red)).set_bold(true);
        let _ = self.stderr.set_color(&spec);
        let _ = write!(self.stderr, "error");
        let _ = self.stderr.reset();
        let _ = writeln!(self.stderr, ": {}: {}", category, cause);
    }

    /// Diagnostic line, shown only with `--verbose`/`--debug`.
    pub fn verbose(&mut self, line: &str) {
        if !self.verbose {
            return;
        }
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(Color::Cyan));
        let _ = self.stderr.set_color(&spec);
        let _ = write!(self.stderr, "astc");
        let _ = self.stderr.reset();
        let _ = writeln!(self.stderr, ": {}", line);
    }
}
