//! Friendly, annotated rendering of script errors.

use std::fmt::Write;

use crate::ScriptError;

const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";
const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Render an error in the annotated multi-line form:
///
/// ```text
/// <kind> error: <message>
///  --> <file>:<line>:<col>
///   | <source line>
///   |     ^^^^
/// Stack trace:
///   at <fn> (<file>:<line>:<col>)
/// hint: <suggestion>
/// note: <context>
/// ```
pub fn render(err: &ScriptError, color: bool) -> String {
    let (red, cyan, dim, bold, reset) = if color {
        (RED, CYAN, DIM, BOLD, RESET)
    } else {
        ("", "", "", "", "")
    };

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{red}{bold}{} error{reset}{bold}: {}{reset}",
        err.kind, err.message
    );

    if let Some(span) = &err.span {
        if span.is_known() {
            let _ = writeln!(out, " {cyan}-->{reset} {}", span);
            if let Some(line_text) = &span.source_line {
                let _ = writeln!(out, "  {dim}|{reset} {}", line_text);
                let width = span
                    .end_column
                    .filter(|&e| e > span.column)
                    .map(|e| e - span.column)
                    .unwrap_or(1);
                let pad = " ".repeat(span.column.saturating_sub(1));
                let _ = writeln!(out, "  {dim}|{reset} {pad}{red}{}{reset}", "^".repeat(width));
            }
        }
    }

    if !err.trace.is_empty() {
        let _ = writeln!(out, "Stack trace:");
        for frame in &err.trace {
            let _ = writeln!(out, "  {}", frame);
        }
    }

    if let Some(hint) = &err.hint {
        let _ = writeln!(out, "{cyan}hint{reset}: {}", hint);
    }
    if let Some(note) = &err.note {
        let _ = writeln!(out, "{dim}note{reset}: {}", note);
    }

    if let Some(cause) = &err.cause {
        let _ = writeln!(out, "caused by: {}", cause);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, SourceSpan, TraceFrame};

    fn sample() -> ScriptError {
        ScriptError::new(ErrorKind::Name, "undefined variable \"foa\"")
            .with_span(
                SourceSpan::new("demo.vsp", 2, 9)
                    .with_end_column(12)
                    .with_source_line("let x = foa + 1"),
            )
            .with_trace(vec![TraceFrame {
                function: String::new(),
                file: "demo.vsp".to_string(),
                line: 2,
                column: 9,
            }])
            .with_hint("did you mean \"foo\"?")
    }

    #[test]
    fn test_render_header() {
        let text = render(&sample(), false);
        assert!(text.starts_with("name error: undefined variable \"foa\""));
    }

    #[test]
    fn test_render_location_and_carets() {
        let text = render(&sample(), false);
        assert!(text.contains(" --> demo.vsp:2:9"));
        assert!(text.contains("| let x = foa + 1"));
        assert!(text.contains("|         ^^^"));
    }

    #[test]
    fn test_render_trace_and_hint() {
        let text = render(&sample(), false);
        assert!(text.contains("Stack trace:"));
        assert!(text.contains("at <main> (demo.vsp:2:9)"));
        assert!(text.contains("hint: did you mean \"foo\"?"));
    }

    #[test]
    fn test_render_without_span() {
        let err = ScriptError::runtime("step limit of 100 exceeded");
        let text = render(&err, false);
        assert_eq!(text, "runtime error: step limit of 100 exceeded\n");
    }

    #[test]
    fn test_colored_render_contains_ansi() {
        let text = render(&sample(), true);
        assert!(text.contains("\x1b[31m"));
        assert!(text.contains("\x1b[0m"));
    }
}
