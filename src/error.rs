//! Errors, source spans and tracebacks
//!
//! Runtime errors are `(name, message)` pairs. The builtin kinds only fix the
//! name; user code may throw errors with any name. While an error unwinds the
//! interpreter, the spans of the failing instruction and of every call site
//! are appended to the [`Traceback`], which renders them the way the `nestvm`
//! runner prints an unrecovered failure.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::rc::Rc;

/// Builtin error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Memory,
    Type,
    Value,
    Math,
    Call,
    Import,
    Interrupt,
}

impl ErrorKind {
    /// Name shown in tracebacks
    pub const fn name(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "Syntax Error",
            ErrorKind::Memory => "Memory Error",
            ErrorKind::Type => "Type Error",
            ErrorKind::Value => "Value Error",
            ErrorKind::Math => "Math Error",
            ErrorKind::Call => "Call Error",
            ErrorKind::Import => "Import Error",
            ErrorKind::Interrupt => "Interrupt",
        }
    }
}

/// A runtime error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name} - {message}")]
pub struct Error {
    pub name: Cow<'static, str>,
    pub message: Cow<'static, str>,
}

/// Allocation failure; built without allocating.
pub const OUT_OF_MEMORY: Error = Error {
    name: Cow::Borrowed("Memory Error"),
    message: Cow::Borrowed("failed to allocate memory"),
};

impl Error {
    /// Create an error of a builtin kind
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Error {
            name: Cow::Borrowed(kind.name()),
            message: message.into(),
        }
    }

    /// Create an error with an arbitrary name (`THROW_ERR`)
    pub fn custom(name: impl Into<Cow<'static, str>>, message: impl Into<Cow<'static, str>>) -> Self {
        Error {
            name: name.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub fn memory() -> Self {
        OUT_OF_MEMORY
    }

    pub fn type_error(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::Type, message)
    }

    pub fn value_error(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::Value, message)
    }

    pub fn math_error(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::Math, message)
    }

    pub fn call_error(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::Call, message)
    }

    pub fn import_error(message: impl Into<Cow<'static, str>>) -> Self {
        Error::new(ErrorKind::Import, message)
    }

    /// Whether the error carries the name of `kind`
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.name == kind.name()
    }

    /// The arity mismatch error raised by calls
    pub fn wrong_arg_num(expected: usize, passed: usize) -> Self {
        Error::call_error(format!(
            "the function expected at most {} argument{} but {} {} passed",
            expected,
            if expected == 1 { "" } else { "s" },
            passed,
            if passed == 1 { "was" } else { "were" },
        ))
    }
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Source text referenced by instruction spans
#[derive(Debug)]
pub struct SourceText {
    pub path: String,
    lines: Vec<String>,
}

impl SourceText {
    pub fn new(path: impl Into<String>, text: &str) -> Rc<Self> {
        Rc::new(SourceText {
            path: path.into(),
            lines: text.lines().map(str::to_owned).collect(),
        })
    }

    /// Line `n` (0-based)
    pub fn line(&self, n: usize) -> Option<&str> {
        self.lines.get(n).map(String::as_str)
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}

/// A 0-based line/column position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub line: usize,
    pub col: usize,
}

impl Pos {
    pub const fn new(line: usize, col: usize) -> Self {
        Pos { line, col }
    }
}

/// Source range of an instruction or call site; `end` is inclusive
#[derive(Debug, Clone, Default)]
pub struct Span {
    pub source: Option<Rc<SourceText>>,
    pub start: Pos,
    pub end: Pos,
}

impl Span {
    pub fn new(source: Rc<SourceText>, start: Pos, end: Pos) -> Self {
        Span {
            source: Some(source),
            start,
            end,
        }
    }

    /// Span with no source, skipped when rendering
    pub fn none() -> Self {
        Span::default()
    }

    fn same_position(&self, other: &Span) -> bool {
        let same_source = match (&self.source, &other.source) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_source && self.start == other.start && self.end == other.end
    }
}

/// Where an error was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorScope {
    #[default]
    None,
    /// Raised while an execution state is running
    Local,
    /// Raised outside of any execution (start-up, teardown)
    Global,
}

/// The pending error and the spans collected while unwinding it
#[derive(Debug, Default)]
pub struct Traceback {
    scope: ErrorScope,
    error: Option<Error>,
    /// Innermost span first
    positions: Vec<Span>,
}

const C_RED: &str = "\x1b[31m";
const C_GREEN: &str = "\x1b[32m";
const C_YELLOW: &str = "\x1b[33m";
const C_CYAN: &str = "\x1b[96m";
const C_RESET: &str = "\x1b[0m";

impl Traceback {
    pub fn new() -> Self {
        Traceback::default()
    }

    /// Replace the pending error and forget stale positions
    pub fn raise(&mut self, error: Error, scope: ErrorScope) {
        self.error = Some(error);
        self.scope = scope;
        self.positions.clear();
    }

    /// Record `error` at `span`; an error that is already pending only
    /// gains a position.
    pub fn propagate(&mut self, error: &Error, span: &Span) {
        if self.error.as_ref() != Some(error) {
            self.raise(error.clone(), ErrorScope::Local);
        }
        self.add_position(span.clone());
    }

    pub fn add_position(&mut self, span: Span) {
        self.positions.push(span);
    }

    #[inline]
    pub fn occurred(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn scope(&self) -> ErrorScope {
        self.scope
    }

    pub fn positions(&self) -> &[Span] {
        &self.positions
    }

    /// Take the pending error, clearing the traceback
    pub fn take(&mut self) -> Option<Error> {
        self.positions.clear();
        self.scope = ErrorScope::None;
        self.error.take()
    }

    pub fn clear(&mut self) {
        self.take();
    }

    /// Render the trace, outermost call first
    pub fn render(&self, color: bool) -> String {
        let mut out = String::new();
        let mut prev: Option<&Span> = None;
        let mut repeat_count = 0usize;

        for span in self.positions.iter().rev() {
            if span.source.is_none() {
                continue;
            }
            if prev.is_some_and(|p| p.same_position(span)) {
                repeat_count += 1;
                continue;
            }
            write_repeat(&mut out, repeat_count, color);
            repeat_count = 0;
            prev = Some(span);
            write_position(&mut out, span, color);
        }
        write_repeat(&mut out, repeat_count, color);

        if let Some(error) = &self.error {
            if color {
                let _ = writeln!(out, "{C_YELLOW}{}{C_RESET} - {}", error.name, error.message);
            } else {
                let _ = writeln!(out, "{} - {}", error.name, error.message);
            }
        }
        out
    }
}

fn write_repeat(out: &mut String, count: usize, color: bool) {
    if count == 0 {
        return;
    }
    if color {
        let _ = writeln!(out, "{C_RED}-- Previous position repeated {count} more times --{C_RESET}");
    } else {
        let _ = writeln!(out, "-- Previous position repeated {count} more times --");
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches([' ', '\t']).len()
}

fn write_position(out: &mut String, span: &Span, color: bool) {
    let Some(source) = &span.source else {
        return;
    };

    if color {
        let _ = write!(out, "File {C_GREEN}\"{}\"{C_RESET} at ", source.path);
    } else {
        let _ = write!(out, "File \"{}\" at ", source.path);
    }
    if span.start.line == span.end.line {
        if color {
            let _ = writeln!(out, "line {C_CYAN}{}{C_RESET}:", span.start.line + 1);
        } else {
            let _ = writeln!(out, "line {}:", span.start.line + 1);
        }
    } else if color {
        let _ = writeln!(
            out,
            "lines {C_CYAN}{}{C_RESET} to {C_CYAN}{}{C_RESET}:",
            span.start.line + 1,
            span.end.line + 1
        );
    } else {
        let _ = writeln!(out, "lines {} to {}:", span.start.line + 1, span.end.line + 1);
    }

    let last = span.end.line.max(span.start.line);
    let width = (last + 1).to_string().len();
    let keep_indent = (span.start.line..=last)
        .filter_map(|n| source.line(n))
        .filter(|l| !l.trim().is_empty())
        .map(indent_of)
        .min()
        .unwrap_or(0);

    for n in span.start.line..=last {
        let Some(text) = source.line(n) else {
            break;
        };
        let shown = text.get(keep_indent..).unwrap_or("");
        let line_len = shown.chars().count();
        let from = if n == span.start.line {
            span.start.col.saturating_sub(keep_indent)
        } else {
            indent_of(text).saturating_sub(keep_indent)
        };
        let to = if n == last {
            span.end.col.saturating_sub(keep_indent)
        } else {
            line_len.saturating_sub(1)
        };

        if color {
            let _ = writeln!(out, " {C_CYAN}{:>width$}{C_RESET} | {}", n + 1, shown);
        } else {
            let _ = writeln!(out, " {:>width$} | {}", n + 1, shown);
        }

        let underline = to.saturating_sub(from) + 1;
        if from == 0 && underline >= line_len {
            continue;
        }
        let pad = " ".repeat(width);
        let carets = "^".repeat(underline);
        if color {
            let _ = writeln!(out, "{pad}  | {}{C_RED}{carets}{C_RESET}", " ".repeat(from));
        } else {
            let _ = writeln!(out, "{pad}  | {}{carets}", " ".repeat(from));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source() -> Rc<SourceText> {
        SourceText::new(
            "demo.nsa",
            "func main()\n    PUSH_VAL 1\n    PUSH_VAL 0\n    STACK_OP /\nend\n",
        )
    }

    #[test]
    fn test_error_display() {
        let err = Error::math_error("division by zero");
        assert_eq!(err.to_string(), "Math Error - division by zero");
        assert!(err.is(ErrorKind::Math));
        assert!(!err.is(ErrorKind::Type));
    }

    #[test]
    fn test_memory_error_is_static() {
        let err = Error::memory();
        assert!(matches!(err.name, Cow::Borrowed(_)));
        assert!(matches!(err.message, Cow::Borrowed(_)));
        assert!(err.is(ErrorKind::Memory));
    }

    #[test]
    fn test_wrong_arg_num_message() {
        assert_eq!(
            Error::wrong_arg_num(1, 3).message,
            "the function expected at most 1 argument but 3 were passed"
        );
        assert_eq!(
            Error::wrong_arg_num(2, 1).message,
            "the function expected at most 2 arguments but 1 was passed"
        );
    }

    #[test]
    fn test_raise_clears_positions() {
        let src = sample_source();
        let mut tb = Traceback::new();
        tb.raise(Error::value_error("first"), ErrorScope::Local);
        tb.add_position(Span::new(src.clone(), Pos::new(1, 4), Pos::new(1, 13)));
        assert_eq!(tb.positions().len(), 1);

        tb.raise(Error::type_error("second"), ErrorScope::Global);
        assert!(tb.positions().is_empty());
        assert_eq!(tb.scope(), ErrorScope::Global);
        assert_eq!(tb.error().map(|e| e.message.as_ref()), Some("second"));
    }

    #[test]
    fn test_propagate_keeps_pending_error() {
        let src = sample_source();
        let err = Error::math_error("division by zero");
        let mut tb = Traceback::new();
        tb.propagate(&err, &Span::new(src.clone(), Pos::new(3, 4), Pos::new(3, 13)));
        tb.propagate(&err, &Span::new(src, Pos::new(1, 4), Pos::new(1, 13)));
        assert_eq!(tb.positions().len(), 2);
        assert_eq!(tb.scope(), ErrorScope::Local);
    }

    #[test]
    fn test_render_single_line() {
        let src = sample_source();
        let mut tb = Traceback::new();
        tb.propagate(
            &Error::math_error("division by zero"),
            &Span::new(src, Pos::new(3, 13), Pos::new(3, 13)),
        );
        let text = tb.render(false);
        let expected = "File \"demo.nsa\" at line 4:\n 4 | STACK_OP /\n   |          ^\nMath Error - division by zero\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_render_collapses_repeats() {
        let src = sample_source();
        let call_site = Span::new(src.clone(), Pos::new(1, 4), Pos::new(1, 13));
        let mut tb = Traceback::new();
        tb.raise(Error::call_error("too deep"), ErrorScope::Local);
        tb.add_position(Span::new(src, Pos::new(3, 4), Pos::new(3, 13)));
        for _ in 0..4 {
            tb.add_position(call_site.clone());
        }
        let text = tb.render(false);
        assert!(text.contains("-- Previous position repeated 3 more times --"));
        assert_eq!(text.matches("at line 2:").count(), 1);
        assert!(text.ends_with("Call Error - too deep\n"));
    }

    #[test]
    fn test_render_skips_sourceless_spans() {
        let mut tb = Traceback::new();
        tb.propagate(&Error::type_error("bad"), &Span::none());
        assert_eq!(tb.render(false), "Type Error - bad\n");
    }
}
