//! Bash text generation helpers
//!
//! Every piece of operator-supplied text that ends up inside a generated
//! script is quoted by one of the functions here. Units and the script
//! assembler never build quoted strings themselves.

use std::fmt::Write;

/// ANSI escape for a green status marker (interpreted by `echo -e`)
pub const GREEN: &str = "\\033[0;32m";
/// ANSI escape for a red status marker
pub const RED: &str = "\\033[0;31m";
/// ANSI reset
pub const RESET: &str = "\\033[0m";

/// Escapes text for use inside a double-quoted bash string.
///
/// Backslash, double quote, dollar and backtick lose their special meaning;
/// everything else (including newlines) is kept as-is.
///
/// # Examples
///
/// ```
/// use drnet::core::shell::double_quoted;
///
/// assert_eq!(double_quoted(r#"say "hi""#), r#"say \"hi\""#);
/// assert_eq!(double_quoted("$HOME"), "\\$HOME");
/// ```
pub fn double_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Wraps text in single quotes so bash passes it through verbatim.
///
/// # Examples
///
/// ```
/// use drnet::core::shell::single_quoted;
///
/// assert_eq!(single_quoted("/etc/hosts"), "'/etc/hosts'");
/// assert_eq!(single_quoted("it's"), r"'it'\''s'");
/// ```
pub fn single_quoted(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Incremental writer for indented bash.
///
/// Single-line commands are indented to the current depth. Multi-line
/// fragments are written verbatim, since re-indenting them would change the
/// contents of quoted strings and heredocs.
#[derive(Debug, Default)]
pub struct ScriptWriter {
    out: String,
    depth: usize,
}

impl ScriptWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes one line at the current indentation.
    pub fn line(&mut self, text: impl AsRef<str>) -> &mut Self {
        for _ in 0..self.depth {
            self.out.push('\t');
        }
        let _ = writeln!(self.out, "{}", text.as_ref());
        self
    }

    /// Writes an operator-supplied command.
    pub fn command(&mut self, text: &str) -> &mut Self {
        let text = text.trim_end_matches('\n');
        if text.contains('\n') {
            let _ = writeln!(self.out, "{text}");
            self
        } else if text.trim().is_empty() {
            // Empty bodies are not valid inside `if` branches
            self.line(":")
        } else {
            self.line(text)
        }
    }

    pub fn blank(&mut self) -> &mut Self {
        self.out.push('\n');
        self
    }

    /// Writes `open`, the body one level deeper, then `close`.
    pub fn block(&mut self, open: &str, close: &str, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.line(open);
        self.depth += 1;
        body(self);
        self.depth -= 1;
        self.line(close)
    }

    /// Writes a sibling branch (`else`, `elif ...`) of the enclosing block.
    pub fn branch(&mut self, header: &str, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.depth = self.depth.saturating_sub(1);
        self.line(header);
        self.depth += 1;
        body(self);
        self
    }

    /// `echo -e` of a status line. `text` must already be safe for double quotes.
    pub fn echo(&mut self, text: &str) -> &mut Self {
        self.line(format!("echo -e \"{text}\""))
    }

    /// Appends to the script-level `fail_string` accumulator.
    pub fn append_failure(&mut self, text: &str) -> &mut Self {
        self.line(format!("fail_string=\"${{fail_string}}\\n{text}\""))
    }

    pub fn finish(self) -> String {
        self.out
    }
}
