//! Structured errors for the Vesper scripting language.
//!
//! Every error surfaced out of the compiler or the virtual machine is a
//! [`ScriptError`]: a kind, a human message, an optional source span, a
//! stack trace, and optional hint/note lines. The [`ScriptError::friendly`]
//! renderer produces the annotated, caret-underlined form shown to users.

mod format;
mod suggest;

use std::fmt;

use strum::Display;
use thiserror::Error;

pub use format::render;
pub use suggest::{levenshtein, suggest, suggestion_hint};

/// Classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorKind {
    Syntax,
    Type,
    Name,
    Value,
    Args,
    Runtime,
    Import,
}

/// A resolved location in source code.
///
/// Lines and columns are 1-based; zero means "unknown" (synthetic code).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceSpan {
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub end_column: Option<usize>,
    pub source_line: Option<String>,
}

impl SourceSpan {
    pub fn new(file: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            file: file.into(),
            line,
            column,
            end_column: None,
            source_line: None,
        }
    }

    pub fn with_end_column(mut self, end_column: usize) -> Self {
        self.end_column = Some(end_column);
        self
    }

    pub fn with_source_line(mut self, text: impl Into<String>) -> Self {
        self.source_line = Some(text.into());
        self
    }

    pub fn is_known(&self) -> bool {
        self.line > 0
    }
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = if self.file.is_empty() {
            "<input>"
        } else {
            &self.file
        };
        write!(f, "{}:{}:{}", file, self.line, self.column)
    }
}

/// One entry of a stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.function.is_empty() {
            "<main>"
        } else {
            &self.function
        };
        let file = if self.file.is_empty() {
            "<input>"
        } else {
            &self.file
        };
        write!(f, "at {} ({}:{}:{})", name, file, self.line, self.column)
    }
}

/// A structured error with location, trace, and diagnostics.
#[derive(Error, Debug, Clone)]
#[error("{kind} error: {message}")]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Option<SourceSpan>,
    pub trace: Vec<TraceFrame>,
    pub hint: Option<String>,
    pub note: Option<String>,
    pub cause: Option<Box<ScriptError>>,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span: None,
            trace: Vec::new(),
            hint: None,
            note: None,
            cause: None,
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn name_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Name, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn args_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Args, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn with_span(mut self, span: SourceSpan) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_trace(mut self, trace: Vec<TraceFrame>) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_cause(mut self, cause: ScriptError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Render the annotated multi-line form with source snippet, caret
    /// underline, stack trace, and hint/note lines.
    pub fn friendly(&self) -> String {
        format::render(self, false)
    }

    /// Like [`friendly`](Self::friendly) with ANSI colors.
    pub fn friendly_colored(&self) -> String {
        format::render(self, true)
    }
}
