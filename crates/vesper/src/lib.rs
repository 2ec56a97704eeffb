//! Vesper - an embeddable scripting language for Rust.
//!
//! Scripts compile to bytecode and run on a lightweight stack-based
//! virtual machine with closures, try/catch/finally, resource limits,
//! cooperative cancellation, and a pluggable execution observer.
//!
//! # Example
//!
//! ```
//! let result = vesper::eval("1 + 2 * 3").unwrap();
//! assert_eq!(result.to_string(), "7");
//! ```

use std::rc::Rc;

use thiserror::Error;

pub use vesper_bytecode as bytecode;
pub use vesper_compiler as compiler;
pub use vesper_error as errors;
pub use vesper_lexer as lexer;
pub use vesper_parser as parser;
pub use vesper_vm as vm;

pub use vesper_bytecode::Code;
pub use vesper_compiler::{CompileError, CompileOptions};
pub use vesper_error::{ErrorKind, ScriptError, SourceSpan, TraceFrame};
pub use vesper_lexer::{Lexer, Token, TokenKind};
pub use vesper_parser::{parse, ParseErrors, Parser, Program};
pub use vesper_vm::{
    builtin_globals, CancelHandle, ExecContext, ObserveMode, Observer, ObserverConfig, Value,
    Vm, VmError, VmOptions,
};

/// Any failure from the source-to-result pipeline.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("{0}")]
    Compile(#[from] CompileError),
    #[error("{0}")]
    Runtime(#[from] VmError),
}

impl EvalError {
    /// The underlying structured error.
    pub fn script_error(&self) -> &ScriptError {
        match self {
            EvalError::Compile(err) => err.script_error(),
            EvalError::Runtime(err) => &err.error,
        }
    }
}

/// Compile source against the default global environment plus the given
/// extra global names (in VM slot order).
pub fn compile_source(source: &str, extra_globals: &[String]) -> Result<Rc<Code>, CompileError> {
    let mut globals: Vec<String> = builtin_globals().into_iter().map(|(name, _)| name).collect();
    globals.extend(extra_globals.iter().cloned());
    vesper_compiler::compile(
        source,
        CompileOptions {
            globals,
            file: "<eval>".to_string(),
        },
    )
}

/// Parse, compile, and run a script.
pub fn eval(source: &str) -> Result<Value, EvalError> {
    eval_with_globals(source, Vec::new())
}

/// Parse, compile, and run a script with extra named globals.
///
/// ```
/// use vesper::Value;
///
/// let globals = vec![("answer".to_string(), Value::Int(40))];
/// let result = vesper::eval_with_globals("answer + 2", globals).unwrap();
/// assert_eq!(result.to_string(), "42");
/// ```
pub fn eval_with_globals(
    source: &str,
    globals: Vec<(String, Value)>,
) -> Result<Value, EvalError> {
    let names: Vec<String> = globals.iter().map(|(name, _)| name.clone()).collect();
    let code = compile_source(source, &names)?;

    let mut seeded = builtin_globals();
    seeded.extend(globals);
    let mut vm = Vm::new(code, VmOptions::new().with_globals(seeded));
    Ok(vm.run(&ExecContext::new())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;
    use vesper_vm::{CallEvent, ReturnEvent, StepEvent};

    fn eval_ok(source: &str) -> Value {
        match eval(source) {
            Ok(value) => value,
            Err(err) => panic!("eval failed for {:?}: {}", source, err),
        }
    }

    fn eval_int(source: &str, expected: i64) {
        match eval_ok(source) {
            Value::Int(n) => assert_eq!(n, expected, "source: {}", source),
            other => panic!("expected Int({}), got {:?} for {:?}", expected, other, source),
        }
    }

    fn eval_float(source: &str, expected: f64) {
        match eval_ok(source) {
            Value::Float(n) => {
                assert!((n - expected).abs() < 1e-9, "expected {}, got {}", expected, n)
            }
            other => panic!("expected Float({}), got {:?} for {:?}", expected, other, source),
        }
    }

    fn eval_bool(source: &str, expected: bool) {
        match eval_ok(source) {
            Value::Bool(b) => assert_eq!(b, expected, "source: {}", source),
            other => panic!("expected Bool({}), got {:?} for {:?}", expected, other, source),
        }
    }

    fn eval_str(source: &str, expected: &str) {
        match eval_ok(source) {
            Value::String(s) => assert_eq!(s.as_ref(), expected, "source: {}", source),
            other => panic!("expected {:?}, got {:?} for {:?}", expected, other, source),
        }
    }

    fn eval_nil(source: &str) {
        assert!(eval_ok(source).is_nil(), "source: {}", source);
    }

    fn eval_display(source: &str, expected: &str) {
        assert_eq!(eval_ok(source).to_string(), expected, "source: {}", source);
    }

    fn runtime_err(source: &str) -> VmError {
        match eval(source) {
            Err(EvalError::Runtime(err)) => err,
            Err(other) => panic!("expected runtime error for {:?}, got {}", source, other),
            Ok(value) => panic!("expected error for {:?}, got {:?}", source, value),
        }
    }

    // ------------------------------------------------------------------
    // Literals and arithmetic
    // ------------------------------------------------------------------

    #[test]
    fn test_literals() {
        eval_int("42", 42);
        eval_int("-17", -17);
        eval_int("0x10", 16);
        eval_int("0b1010", 10);
        eval_int("0755", 493);
        eval_float("3.25", 3.25);
        eval_float("1e3", 1000.0);
        eval_bool("true", true);
        eval_bool("false", false);
        eval_nil("nil");
        eval_str("\"hello\\nworld\"", "hello\nworld");
        eval_str("'single'", "single");
    }

    #[test]
    fn test_arithmetic() {
        eval_int("1 + 2 * 3", 7);
        eval_int("10 - 3", 7);
        eval_int("4 * 5", 20);
        eval_float("15 / 3", 5.0);
        eval_int("17 % 5", 2);
        eval_int("2 ** 10", 1024);
        eval_float("1.5 + 2.5", 4.0);
        eval_float("1 + 0.5", 1.5);
    }

    #[test]
    fn test_power_is_right_associative() {
        eval_int("2 ** 3 ** 2", 512);
    }

    #[test]
    fn test_unary_minus_binds_below_power() {
        eval_int("-2**2", -4);
        eval_int("(-2)**2", 4);
    }

    #[test]
    fn test_bitwise() {
        eval_int("6 & 3", 2);
        eval_int("6 | 3", 7);
        eval_int("6 ^ 3", 5);
        eval_int("1 << 4", 16);
        eval_int("16 >> 2", 4);
    }

    #[test]
    fn test_division_by_zero() {
        let err = runtime_err("1 / 0");
        assert_eq!(err.kind(), ErrorKind::Value);
        assert_eq!(err.message(), "division by zero");
        assert_eq!(runtime_err("1 % 0").message(), "division by zero");
    }

    #[test]
    fn test_comparisons() {
        eval_bool("1 == 1", true);
        eval_bool("1 == 1.0", true);
        eval_bool("1 != 2", true);
        eval_bool("1 < 2", true);
        eval_bool("2 <= 2", true);
        eval_bool("3 > 2", true);
        eval_bool("\"a\" < \"b\"", true);
    }

    #[test]
    fn test_comparisons_do_not_chain() {
        // (1 < 2) < 3 compares a bool with an int.
        let err = runtime_err("1 < 2 < 3");
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn test_logical_and_nullish() {
        eval_bool("true && true", true);
        eval_bool("true && false", false);
        eval_bool("false || true", true);
        eval_bool("!true", false);
        eval_bool("not false", true);
        eval_int("nil ?? 42", 42);
        eval_int("5 ?? 42", 5);
    }

    #[test]
    fn test_ternary() {
        eval_int("true ? 1 : 2", 1);
        eval_int("false ? 1 : 2", 2);
        eval_str("1 > 0 ? \"yes\" : \"no\"", "yes");
        eval_int("false ? 1 : true ? 2 : 3", 2);
    }

    #[test]
    fn test_type_mismatch_message() {
        let err = runtime_err("[1] + 1");
        assert_eq!(err.kind(), ErrorKind::Type);
        assert_eq!(err.message(), "unsupported operation for list: + on type int");
    }

    // ------------------------------------------------------------------
    // Variables and assignment
    // ------------------------------------------------------------------

    #[test]
    fn test_variables() {
        eval_int("let x = 10\nx", 10);
        eval_int("let x = 5\nlet y = 3\nx + y", 8);
        eval_int("let x = 1\nx = 2\nx", 2);
        eval_int("let x = 1\nx += 4\nx", 5);
        eval_int("let x = 10\nx /= 2\nint(x)", 5);
    }

    #[test]
    fn test_postfix() {
        eval_int("let x = 1\nx++\nx", 2);
        eval_int("let x = 1\nx--\nx", 0);
    }

    #[test]
    fn test_const_reassignment_fails_to_compile() {
        assert!(matches!(
            eval("const x = 1\nx = 2"),
            Err(EvalError::Compile(_))
        ));
    }

    #[test]
    fn test_undefined_variable_has_hint() {
        let Err(err) = eval("let total = 1\ntotla + 1") else {
            panic!("expected error")
        };
        let script_err = err.script_error();
        assert_eq!(script_err.kind, ErrorKind::Name);
        assert!(script_err.message.contains("undefined variable \"totla\""));
        assert_eq!(script_err.hint.as_deref(), Some("did you mean \"total\"?"));
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    #[test]
    fn test_strings() {
        eval_str("\"foo\" + \"bar\"", "foobar");
        eval_str("\"ab\" * 3", "ababab");
        eval_str("\"abc\"[1]", "b");
        eval_str("\"abc\"[-1]", "c");
        eval_str("\"hello\"[1:3]", "el");
        eval_bool("\"ell\" in \"hello\"", true);
        eval_bool("\"zz\" not in \"hello\"", true);
    }

    #[test]
    fn test_strings_index_by_scalar() {
        eval_int("len(\"héllo\")", 5);
        eval_str("\"héllo\"[1]", "é");
    }

    #[test]
    fn test_string_methods() {
        eval_int("\"hello\".len()", 5);
        eval_str("\"hello\".upper()", "HELLO");
        eval_str("\"HELLO\".lower()", "hello");
        eval_str("\"  hi  \".trim()", "hi");
        eval_bool("\"hello\".contains(\"ell\")", true);
        eval_display("\"a,b\".split(\",\")", "[\"a\", \"b\"]");
    }

    #[test]
    fn test_templates() {
        eval_str("`plain`", "plain");
        eval_str("let x = 1\n`a${x + 1}b`", "a2b");
        eval_str("`${\"s\"} and ${2}`", "s and 2");
    }

    // ------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------

    #[test]
    fn test_lists() {
        eval_int("[1, 2, 3][0]", 1);
        eval_int("[1, 2, 3][-1]", 3);
        eval_display("[1, 2] + [3]", "[1, 2, 3]");
        eval_display("[1, ...[2, 3], 4]", "[1, 2, 3, 4]");
        eval_display("[1, 2, 3, 4][1:3]", "[2, 3]");
        eval_bool("2 in [1, 2, 3]", true);
        eval_bool("5 not in [1, 2, 3]", true);
    }

    #[test]
    fn test_index_out_of_range() {
        let err = runtime_err("[1, 2][5]");
        assert_eq!(err.kind(), ErrorKind::Value);
        assert_eq!(err.message(), "index out of range");
    }

    #[test]
    fn test_slice_bounds_error() {
        let err = runtime_err("[1, 2][0:5]");
        assert_eq!(err.kind(), ErrorKind::Value);
        assert_eq!(err.message(), "slice bounds out of range");
    }

    #[test]
    fn test_list_methods() {
        eval_int("[1, 2, 3].len()", 3);
        eval_str("[1, 2, 3].join(\",\")", "1,2,3");
        eval_bool("[1, 2, 3].contains(2)", true);
        eval_int("[1, 2, 3].index(3)", 2);
        eval_display("[3, 1, 2].sort()", "[1, 2, 3]");
        eval_display("[1, 2].reverse()", "[2, 1]");
        eval_int("let l = [1]\nl.append(9)\nl[1]", 9);
        eval_int("[1, 2, 3, 4].reduce((a, b) => a + b, 0)", 10);
        eval_display("[1, 2, 3].map(x => x * 2)", "[2, 4, 6]");
        eval_display("[1, 2, 3, 4, 5].filter(x => x > 2)", "[3, 4, 5]");
    }

    #[test]
    fn test_chained_filter_map() {
        // Spec scenario: filter then map over a list.
        eval_display("let l = [1, 2, 3]\nl.filter(x => x > 1).map(x => x * 10)", "[20, 30]");
    }

    #[test]
    fn test_index_assignment() {
        eval_int("let l = [1, 2]\nl[0] = 9\nl[0]", 9);
        eval_int("let l = [1, 2]\nl[1] += 10\nl[1]", 12);
    }

    // ------------------------------------------------------------------
    // Maps
    // ------------------------------------------------------------------

    #[test]
    fn test_maps() {
        eval_int("{a: 1, b: 2}[\"a\"]", 1);
        eval_int("{a: 1}.a", 1);
        eval_int("let a = 7\n{a}.a", 7);
        eval_nil("{a: 1}[\"missing\"]");
        eval_bool("\"a\" in {a: 1}", true);
        eval_bool("\"b\" not in {a: 1}", true);
        eval_int("let m = {x: 1}\nm.x = 5\nm.x", 5);
        eval_int("let m = {x: 1}\nm[\"y\"] = 2\nm.y", 2);
        eval_display("{a: 1, ...{b: 2}}", "{\"a\": 1, \"b\": 2}");
    }

    #[test]
    fn test_map_iteration_sorted() {
        eval_display("keys({zebra: 1, apple: 2, mango: 3})", "[\"apple\", \"mango\", \"zebra\"]");
    }

    #[test]
    fn test_map_requires_string_keys() {
        let err = runtime_err("let m = {}\nm[1] = 2");
        assert_eq!(err.kind(), ErrorKind::Type);
        assert!(err.message().contains("map keys must be strings"));
    }

    #[test]
    fn test_missing_attribute_error() {
        let err = runtime_err("(1).x");
        assert_eq!(err.kind(), ErrorKind::Type);
        assert_eq!(err.message(), "attribute \"x\" not found on int object");
    }

    #[test]
    fn test_attribute_suggestion() {
        let err = runtime_err("{total: 1}.totla");
        assert_eq!(err.error.hint.as_deref(), Some("did you mean \"total\"?"));
    }

    // ------------------------------------------------------------------
    // Functions and closures
    // ------------------------------------------------------------------

    #[test]
    fn test_functions() {
        eval_int("let f = function() { return 42 }\nf()", 42);
        eval_int("let add = function(a, b) { return a + b }\nadd(3, 4)", 7);
        eval_int("let f = x => x * 2\nf(5)", 10);
        eval_int("let f = (x, y) => x + y\nf(2, 3)", 5);
        eval_int("let f = () => 1\nf()", 1);
    }

    #[test]
    fn test_implicit_return_of_last_expression() {
        eval_int("let f = function(x) { x + 1 }\nf(1)", 2);
    }

    #[test]
    fn test_parameter_defaults() {
        eval_int("function f(a, b = 10) { return a + b }\nf(1)", 11);
        eval_int("function f(a, b = 10) { return a + b }\nf(1, 2)", 3);
        eval_int("let f = (x = 4) => x * 2\nf()", 8);
    }

    #[test]
    fn test_rest_parameters() {
        eval_int("function f(a, ...rest) { return rest.len() }\nf(1, 2, 3, 4)", 3);
        eval_display("function f(...xs) { return xs }\nf(1, 2)", "[1, 2]");
        eval_display("function f(...xs) { return xs }\nf()", "[]");
    }

    #[test]
    fn test_arity_errors() {
        let err = runtime_err("function f(a, b) { return a }\nf(1, 2, 3)");
        assert_eq!(err.kind(), ErrorKind::Args);
        assert_eq!(err.message(), "function \"f\" takes 2 arguments (3 given)");

        let err = runtime_err("function f(a, b) { return a }\nf(1)");
        assert_eq!(err.kind(), ErrorKind::Args);
    }

    #[test]
    fn test_calling_non_callable() {
        let err = runtime_err("let x = 3\nx()");
        assert_eq!(err.kind(), ErrorKind::Type);
        assert_eq!(err.message(), "object is not callable (got int)");
    }

    #[test]
    fn test_spread_call() {
        eval_int("function add3(a, b, c) { return a + b + c }\nadd3(...[1, 2, 3])", 6);
        eval_int("function add3(a, b, c) { return a + b + c }\nadd3(1, ...[2, 3])", 6);
    }

    #[test]
    fn test_recursion() {
        // Spec scenario: fac(5) == 120.
        eval_int(
            "function fac(n) { if (n <= 1) { return 1 } else { return n * fac(n - 1) } }\nfac(5)",
            120,
        );
    }

    #[test]
    fn test_named_function_recursion_survives_rebinding() {
        eval_int(
            "function count(n) { return if n <= 0 { 0 } else { 1 + count(n - 1) } }\n\
             let saved = count\n\
             count = nil\n\
             saved(3)",
            3,
        );
    }

    #[test]
    fn test_closure_counter() {
        // Spec invariant: closure capture round-trip returns 3.
        eval_int(
            "let mk = (x) => () => { x = x + 1\nreturn x }\nlet c = mk(0)\nc()\nc()\nc()",
            3,
        );
    }

    #[test]
    fn test_closure_counter_function_syntax() {
        // Spec scenario: implicit return of the inner closure; [1, 2, 3].
        eval_display(
            "let mk = function(x) { function() { x++\nreturn x } }\nlet c = mk(0)\n[c(), c(), c()]",
            "[1, 2, 3]",
        );
    }

    #[test]
    fn test_cell_aliasing_both_directions() {
        // Frame write visible through the cell.
        eval_int(
            "function outer() { let x = 1\nlet get = () => x\nx = 2\nreturn get() }\nouter()",
            2,
        );
        // Cell write visible through the frame.
        eval_int(
            "function outer() { let x = 1\nlet set = () => { x = 5\nreturn nil }\nset()\nreturn x }\nouter()",
            5,
        );
    }

    #[test]
    fn test_shared_capture_between_closures() {
        eval_display(
            "function outer() {\n\
               let n = 0\n\
               let bump = () => { n = n + 1\nreturn n }\n\
               let read = () => n\n\
               bump()\nbump()\n\
               return [read(), bump()]\n\
             }\nouter()",
            "[2, 3]",
        );
    }

    #[test]
    fn test_destructured_parameters() {
        eval_int("let f = ({a, b}) => a + b\nf({a: 1, b: 2})", 3);
        eval_int("let f = ([a, b]) => a + b\nf([1, 2])", 3);
        eval_int("function f({a, b = 10}) { return a + b }\nf({a: 1})", 11);
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    #[test]
    fn test_if_expression() {
        eval_int("if true { 1 } else { 2 }", 1);
        eval_int("if false { 1 } else { 2 }", 2);
        eval_int("if 1 > 0 { 10 } else { 20 }", 10);
        eval_nil("if false { 1 }");
        eval_int("if false { 1 } else if true { 2 } else { 3 }", 2);
    }

    #[test]
    fn test_switch() {
        eval_str(
            "let x = 2\nswitch (x) { case 1: \"one\"\ncase 2, 3: \"few\"\ndefault: \"many\" }",
            "few",
        );
        eval_str("switch (99) { case 1: \"one\"\ndefault: \"other\" }", "other");
    }

    #[test]
    fn test_match() {
        eval_str("let x = 2\nmatch x { 1 => \"one\", 2 => \"two\", _ => \"other\" }", "two");
        eval_str("match 99 { 1 => \"one\", _ => \"default\" }", "default");
        eval_str("match 2 { 2 if false => \"no\", _ => \"guarded\" }", "guarded");
    }

    // ------------------------------------------------------------------
    // Destructuring
    // ------------------------------------------------------------------

    #[test]
    fn test_destructuring() {
        eval_int("let {a, b: c, d = 9} = {a: 1, b: 2}\na + c + d", 12);
        eval_int("let [a, b] = [1, 2]\na + b", 3);
        eval_int("let [a, b = 5] = [1]\na + b", 6);
        eval_int("let x, y = [1, 2]\nx + y", 3);
    }

    #[test]
    fn test_unpack_excess_is_error() {
        let err = runtime_err("let [a] = [1, 2]");
        assert_eq!(err.kind(), ErrorKind::Value);
        assert!(err.message().contains("too many values to unpack"));
    }

    // ------------------------------------------------------------------
    // Optional chaining and pipes
    // ------------------------------------------------------------------

    #[test]
    fn test_optional_chaining() {
        eval_nil("let m = nil\nm?.field");
        eval_nil("let m = nil\nm?.method()");
        eval_int("let m = {a: {b: 1}}\nm.a?.b", 1);
        eval_int("let m = {list: [1, 2]}\nm.list?.len()", 2);
    }

    #[test]
    fn test_pipe_operator() {
        eval_int("function double(x) { return x * 2 }\n5 |> double", 10);
        eval_int("function double(x) { return x * 2 }\n5 |> double |> double", 20);
        // Piping into a call binds the written arguments first.
        eval_int("function add(a, b) { return a + b }\n5 |> add(1)", 6);
    }

    #[test]
    fn test_pipe_across_lines() {
        eval_int("function double(x) { return x * 2 }\nlet r = 5\n|> double\nr", 10);
    }

    // ------------------------------------------------------------------
    // Exceptions
    // ------------------------------------------------------------------

    #[test]
    fn test_try_catch_basics() {
        eval_int("try { 1 } catch { 2 }", 1);
        eval_int("try { throw \"x\" } catch { 2 }", 2);
        eval_str("try { throw \"a\" } catch e { string(e) }", "a");
        eval_str("try { throw \"a\" } catch e { type(e) }", "error");
    }

    #[test]
    fn test_thrown_error_value_passes_through() {
        eval_str("let e = error(\"E\")\ntry { throw e } catch x { x.message }", "E");
        eval_str("try { throw 7 } catch e { string(e) }", "7");
    }

    #[test]
    fn test_runtime_errors_are_catchable() {
        eval_str("try { [1][9] } catch e { e.kind }", "value");
        eval_str("try { 1 / 0 } catch e { string(e) }", "division by zero");
        eval_int("try { nil() } catch { -1 }", -1);
    }

    #[test]
    fn test_finally_always_runs() {
        eval_bool("let r = false\ntry { 1 } finally { r = true }\nr", true);
        eval_bool(
            "let r = false\ntry { try { throw \"x\" } finally { r = true } } catch { nil }\nr",
            true,
        );
    }

    #[test]
    fn test_finally_runs_after_catch() {
        eval_display(
            "let log = []\n\
             try { throw \"x\" } catch e { log.append(\"catch\") } finally { log.append(\"fin\") }\n\
             log",
            "[\"catch\", \"fin\"]",
        );
    }

    #[test]
    fn test_throw_in_finally_replaces() {
        // Spec scenario: the finally-thrown value wins.
        eval_str(
            "try { try { throw \"a\" } finally { throw \"b\" } } catch e { string(e) }",
            "b",
        );
    }

    #[test]
    fn test_return_in_finally_overrides() {
        // Spec invariant: return-in-finally wins over the pending return.
        eval_int("function f() { try { return 1 } finally { return 2 } }\nf()", 2);
    }

    #[test]
    fn test_return_in_finally_suppresses_pending_error() {
        eval_int("function f() { try { throw \"x\" } finally { return 9 } }\nf()", 9);
    }

    #[test]
    fn test_return_in_catch_still_runs_finally() {
        eval_display(
            "let log = []\n\
             function f() {\n\
               try { throw \"x\" } catch e { return 1 } finally { log.append(\"fin\") }\n\
             }\n\
             let r = f()\n\
             [r, log]",
            "[1, [\"fin\"]]",
        );
    }

    #[test]
    fn test_return_through_finally_then_returns() {
        eval_display(
            "let log = []\n\
             function f() { try { return 1 } finally { log.append(\"fin\") } }\n\
             [f(), log]",
            "[1, [\"fin\"]]",
        );
    }

    #[test]
    fn test_catch_does_not_catch_its_own_throw() {
        eval_display(
            "let hits = []\n\
             try {\n\
               try { throw \"a\" } catch e { hits.append(\"inner\")\nthrow \"b\" }\n\
             } catch e { hits.append(string(e)) }\n\
             hits",
            "[\"inner\", \"b\"]",
        );
    }

    #[test]
    fn test_throw_unwinds_across_frames() {
        eval_str(
            "function deep() { throw \"deep\" }\n\
             function mid() { return deep() }\n\
             try { mid() } catch e { string(e) }",
            "deep",
        );
    }

    #[test]
    fn test_throw_inside_host_callback_reaches_outer_handler() {
        eval_str(
            "try { [1, 2].each(x => { throw \"cb\" }) } catch e { string(e) }",
            "cb",
        );
    }

    #[test]
    fn test_finally_without_catch_reraises() {
        eval_display(
            "let log = []\n\
             try {\n\
               try { throw \"x\" } finally { log.append(1) }\n\
             } catch e { log.append(2) }\n\
             log",
            "[1, 2]",
        );
    }

    #[test]
    fn test_uncaught_throw_surfaces() {
        let err = runtime_err("throw \"boom\"");
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn test_uncaught_error_has_trace_and_span() {
        let err = runtime_err("function f() { return [1][5] }\nfunction g() { return f() }\ng()");
        assert!(!err.error.trace.is_empty());
        assert!(err.error.span.is_some());
        let rendered = err.friendly();
        assert!(rendered.contains("Stack trace:"));
        assert!(rendered.contains("at f"));
    }

    // ------------------------------------------------------------------
    // Resource governance
    // ------------------------------------------------------------------

    fn vm_for(source: &str, options: VmOptions) -> Vm {
        let code = compile_source(source, &[]).expect("compile");
        Vm::new(code, options.with_globals(builtin_globals()))
    }

    #[test]
    fn test_step_limit_exceeded() {
        let mut vm = vm_for(
            "function spin(n) { return spin(n + 1) }\nspin(0)",
            VmOptions::new()
                .with_max_steps(500)
                .with_context_check_interval(10),
        );
        let err = vm.run(&ExecContext::new()).unwrap_err();
        assert!(err.fatal);
        assert!(err.message().contains("step limit of 500 exceeded"));
    }

    #[test]
    fn test_step_limit_not_hit_on_small_program() {
        let mut vm = vm_for(
            "1 + 2",
            VmOptions::new()
                .with_max_steps(1_000)
                .with_context_check_interval(1),
        );
        let result = vm.run(&ExecContext::new()).unwrap();
        assert!(result.equals(&Value::Int(3)));
    }

    #[test]
    fn test_step_limit_counts_host_callback_reentry() {
        // The loop body runs inside `each`'s callbacks; the VM-scoped
        // counter keeps accumulating across those re-entries.
        let mut vm = vm_for(
            "range(100000).each(x => x + 1)",
            VmOptions::new()
                .with_max_steps(2_000)
                .with_context_check_interval(10),
        );
        let err = vm.run(&ExecContext::new()).unwrap_err();
        assert!(err.message().contains("step limit"));
    }

    #[test]
    fn test_frame_overflow() {
        let err = runtime_err("function spin(n) { return spin(n + 1) }\nspin(0)");
        assert!(err.fatal);
        assert!(err.message().contains("stack overflow"));
    }

    #[test]
    fn test_resource_errors_bypass_catch() {
        // Fatal errors do not enter the handler machine.
        let mut vm = vm_for(
            "function spin(n) { return spin(n + 1) }\ntry { spin(0) } catch e { \"caught\" }",
            VmOptions::new().with_max_frame_depth(64),
        );
        let err = vm.run(&ExecContext::new()).unwrap_err();
        assert!(err.message().contains("stack overflow"));
    }

    #[test]
    fn test_value_stack_limit() {
        let mut vm = vm_for(
            "[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]",
            VmOptions::new()
                .with_max_value_stack_depth(8)
                .with_context_check_interval(1),
        );
        let err = vm.run(&ExecContext::new()).unwrap_err();
        assert!(err.message().contains("value stack limit"));
    }

    #[test]
    fn test_timeout() {
        let mut vm = vm_for(
            "let x = 1\nx + 1",
            VmOptions::new()
                .with_timeout(Duration::from_secs(0))
                .with_context_check_interval(1),
        );
        let err = vm.run(&ExecContext::new()).unwrap_err();
        assert_eq!(err.message(), "deadline exceeded");
    }

    #[test]
    fn test_cancellation() {
        let mut vm = vm_for("1 + 2", VmOptions::new());
        let ctx = ExecContext::new();
        ctx.cancel_handle().cancel();
        let err = vm.run(&ctx).unwrap_err();
        assert_eq!(err.message(), "execution cancelled");
    }

    // ------------------------------------------------------------------
    // Observer
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct Recorder {
        mode: Option<ObserveMode>,
        observe_calls: bool,
        observe_returns: bool,
        steps: Rc<RefCell<Vec<usize>>>,
        calls: Rc<RefCell<Vec<(String, usize)>>>,
        returns: Rc<RefCell<usize>>,
        halt_after: Option<usize>,
    }

    impl Observer for Recorder {
        fn config(&self) -> ObserverConfig {
            ObserverConfig {
                mode: self.mode.unwrap_or(ObserveMode::All),
                observe_calls: self.observe_calls,
                observe_returns: self.observe_returns,
            }
        }

        fn on_step(&mut self, event: &StepEvent) -> bool {
            self.steps.borrow_mut().push(event.line);
            match self.halt_after {
                Some(limit) => self.steps.borrow().len() < limit,
                None => true,
            }
        }

        fn on_call(&mut self, event: &CallEvent) -> bool {
            self.calls
                .borrow_mut()
                .push((event.function.to_string(), event.depth));
            true
        }

        fn on_return(&mut self, _event: &ReturnEvent) -> bool {
            *self.returns.borrow_mut() += 1;
            true
        }
    }

    #[test]
    fn test_observer_on_line_sees_distinct_lines() {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let observer = Recorder {
            mode: Some(ObserveMode::OnLine),
            steps: lines.clone(),
            ..Recorder::default()
        };
        let mut vm = vm_for(
            "let a = 1\nlet b = 2\nlet c = a + b",
            VmOptions::new().with_observer(Box::new(observer)),
        );
        vm.run(&ExecContext::new()).unwrap();

        let mut distinct: Vec<usize> = lines.borrow().clone();
        distinct.dedup();
        assert!(distinct.len() >= 3, "lines: {:?}", distinct);
        assert!(!lines.borrow().contains(&0));
    }

    #[test]
    fn test_observer_sampled_fires_less_than_all() {
        let all = Rc::new(RefCell::new(Vec::new()));
        let mut vm = vm_for(
            "let a = 1\nlet b = 2\na + b",
            VmOptions::new().with_observer(Box::new(Recorder {
                steps: all.clone(),
                ..Recorder::default()
            })),
        );
        vm.run(&ExecContext::new()).unwrap();
        let total = all.borrow().len();
        assert!(total > 0);

        let sampled = Rc::new(RefCell::new(Vec::new()));
        let mut vm = vm_for(
            "let a = 1\nlet b = 2\na + b",
            VmOptions::new().with_observer(Box::new(Recorder {
                mode: Some(ObserveMode::Sampled(3)),
                steps: sampled.clone(),
                ..Recorder::default()
            })),
        );
        vm.run(&ExecContext::new()).unwrap();
        let sampled_total = sampled.borrow().len();
        assert!(sampled_total > 0);
        assert!(sampled_total < total);
    }

    #[test]
    fn test_observer_none_mode_never_steps() {
        let steps = Rc::new(RefCell::new(Vec::new()));
        let mut vm = vm_for(
            "1 + 2",
            VmOptions::new().with_observer(Box::new(Recorder {
                mode: Some(ObserveMode::None),
                steps: steps.clone(),
                ..Recorder::default()
            })),
        );
        vm.run(&ExecContext::new()).unwrap();
        assert!(steps.borrow().is_empty());
    }

    #[test]
    fn test_observer_halts_execution() {
        let mut vm = vm_for(
            "let a = 1\nlet b = 2\na + b",
            VmOptions::new().with_observer(Box::new(Recorder {
                halt_after: Some(2),
                ..Recorder::default()
            })),
        );
        let err = vm.run(&ExecContext::new()).unwrap_err();
        assert!(err.fatal);
        assert_eq!(err.message(), "execution halted by observer");
    }

    #[test]
    fn test_observer_call_and_return_events() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let returns = Rc::new(RefCell::new(0));
        let mut vm = vm_for(
            "function inner() { return 1 }\nfunction outer() { return inner() }\nouter()",
            VmOptions::new().with_observer(Box::new(Recorder {
                mode: Some(ObserveMode::None),
                observe_calls: true,
                observe_returns: true,
                calls: calls.clone(),
                returns: returns.clone(),
                ..Recorder::default()
            })),
        );
        vm.run(&ExecContext::new()).unwrap();

        let calls = calls.borrow();
        // Depth reported is the callee's depth: outer at 2, inner at 3.
        assert!(calls.contains(&("outer".to_string(), 2)));
        assert!(calls.contains(&("inner".to_string(), 3)));
        assert!(*returns.borrow() >= 2);
    }

    #[test]
    fn test_observer_call_events_suppressed() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut vm = vm_for(
            "function f() { return 1 }\nf()",
            VmOptions::new().with_observer(Box::new(Recorder {
                mode: Some(ObserveMode::None),
                observe_calls: false,
                calls: calls.clone(),
                ..Recorder::default()
            })),
        );
        vm.run(&ExecContext::new()).unwrap();
        assert!(calls.borrow().is_empty());
    }

    // ------------------------------------------------------------------
    // Embedder API
    // ------------------------------------------------------------------

    #[test]
    fn test_globals_and_top_of_stack() {
        let mut vm = vm_for("let x = 5\nx * 2", VmOptions::new());
        let result = vm.run(&ExecContext::new()).unwrap();
        assert!(result.equals(&Value::Int(10)));
        // The result stays on the stack: depth 1 after a successful run.
        assert!(vm.top_of_stack().unwrap().equals(&Value::Int(10)));
        assert!(vm.get_global("x").unwrap().equals(&Value::Int(5)));
        assert!(vm.global_names().contains(&"x".to_string()));
    }

    #[test]
    fn test_eval_with_globals() {
        let globals = vec![("x".to_string(), Value::Int(100))];
        let result = eval_with_globals("x + 50", globals).unwrap();
        assert!(result.equals(&Value::Int(150)));
    }

    #[test]
    fn test_call_api() {
        let mut vm = vm_for("function add(a, b) { return a + b }", VmOptions::new());
        let ctx = ExecContext::new();
        vm.run(&ctx).unwrap();

        let add = vm.get_global("add").unwrap();
        let result = vm
            .call(&ctx, &add, vec![Value::Int(2), Value::Int(3)])
            .unwrap();
        assert!(result.equals(&Value::Int(5)));
    }

    #[test]
    fn test_call_reports_script_errors() {
        let mut vm = vm_for("function boom() { throw \"bad\" }", VmOptions::new());
        let ctx = ExecContext::new();
        vm.run(&ctx).unwrap();

        let boom = vm.get_global("boom").unwrap();
        let err = vm.call(&ctx, &boom, vec![]).unwrap_err();
        assert_eq!(err.message(), "bad");
    }

    #[test]
    fn test_run_code_preserves_globals() {
        let ctx = ExecContext::new();
        let mut vm = vm_for("let x = 42", VmOptions::new());
        vm.run(&ctx).unwrap();
        assert!(vm.get_global("x").unwrap().equals(&Value::Int(42)));

        // New code compiled against the VM's current global layout.
        let next = vesper_compiler::compile(
            "x + 1",
            CompileOptions {
                globals: vm.global_names(),
                file: "<repl>".to_string(),
            },
        )
        .unwrap();
        let result = vm.run_code(&ctx, next).unwrap();
        assert!(result.equals(&Value::Int(43)));
    }

    #[test]
    fn test_instruction_offset_skips_replayed_prefix() {
        // Spec scenario: re-compile the growing REPL source and skip the
        // instructions that already ran.
        let ctx = ExecContext::new();
        let prefix = compile_source("let x = 42", &[]).unwrap();
        let full = compile_source("let x = 42\nx + 1", &[]).unwrap();

        let mut vm = Vm::new(prefix.clone(), VmOptions::new().with_globals(builtin_globals()));
        vm.run(&ctx).unwrap();
        assert!(vm.get_global("x").unwrap().equals(&Value::Int(42)));

        // Skip the shared prefix (everything but its trailing Halt word).
        vm.set_ip(prefix.instructions.len() - 1).unwrap();
        let result = vm.run_code(&ctx, full).unwrap();
        assert!(result.equals(&Value::Int(43)));
    }

    #[test]
    fn test_set_ip_when_idle() {
        let mut vm = vm_for("1", VmOptions::new());
        assert!(vm.set_ip(0).is_ok());
    }

    #[test]
    fn test_host_objects() {
        #[derive(Debug)]
        struct Config;
        impl vesper_vm::HostObject for Config {
            fn type_name(&self) -> &str {
                "config"
            }
            fn get_attr(&self, name: &str) -> Option<Value> {
                (name == "port").then(|| Value::Int(8080))
            }
        }

        let globals = vec![(
            "config".to_string(),
            Value::Host(Rc::new(Config)),
        )];
        let result = eval_with_globals("config.port", globals).unwrap();
        assert!(result.equals(&Value::Int(8080)));

        let err = eval_with_globals(
            "config.missing",
            vec![("config".to_string(), Value::Host(Rc::new(Config)))],
        );
        assert!(matches!(err, Err(EvalError::Runtime(_))));
    }

    #[test]
    fn test_empty_program() {
        eval_nil("");
        eval_nil("// just a comment");
    }

    #[test]
    fn test_semicolons_and_newlines() {
        eval_int("let a = 1; let b = 2; a + b", 3);
        eval_int("1 +\n2", 3);
        eval_int("[1, 2, 3]\n.map(x => x + 1)\n.len()", 3);
    }
}
