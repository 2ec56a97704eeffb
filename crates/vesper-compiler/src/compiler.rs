//! Two-pass AST to bytecode compiler.
//!
//! Pass 1 hoists named function declarations so forward references
//! resolve; pass 2 emits instructions. Functions compile on a stack of
//! code builders, one per nesting level.

use std::rc::Rc;

use thiserror::Error;
use vesper_bytecode::{BinOp, CmpOp, Code, CodeBuilder, Constant, HandlerRecord, Op, Param, NO_TARGET};
use vesper_error::{suggestion_hint, ScriptError, SourceSpan};
use vesper_lexer::Pos;
use vesper_parser::{
    AssignAttrStmt, AssignStmt, AssignTarget, CallExpr, CaseClause, ConstStmt,
    DestructureListStmt, DestructureMapStmt, Expr, FuncLit, FuncParam, GetAttrExpr, IfExpr,
    IndexExpr, InExpr, InfixExpr, LetStmt, LetUnpackStmt, ListBinding, ListLit, MapBinding,
    MapLit, MatchExpr, MethodCallExpr, ParseErrors, Pattern, PipeExpr, PostfixStmt, PrefixExpr,
    Program, ReturnStmt, SliceExpr, Stmt, SwitchExpr, TemplateLit, TemplatePart, TernaryExpr,
    ThrowStmt, TryExpr,
};

use crate::symbol_table::{Resolution, Scope, ScopeStack, Symbol};

/// Positional arguments at a single call site are capped here.
pub const MAX_CALL_ARGS: usize = 256;

/// Errors from source-to-bytecode translation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("{0}")]
    Parse(#[from] ParseErrors),
    #[error("{0}")]
    Compile(ScriptError),
}

impl CompileError {
    /// The primary diagnostic, regardless of which phase produced it.
    pub fn script_error(&self) -> &ScriptError {
        match self {
            CompileError::Parse(errors) => errors.first(),
            CompileError::Compile(err) => err,
        }
    }
}

/// Compilation settings.
#[derive(Debug, Default)]
pub struct CompileOptions {
    /// Pre-seeded global names, in VM slot order.
    pub globals: Vec<String>,
    pub file: String,
}

/// Bytecode compiler.
pub struct Compiler {
    builders: Vec<CodeBuilder>,
    scopes: ScopeStack,
    source: Rc<str>,
    file: Rc<str>,
    func_counter: usize,
    error: Option<ScriptError>,
}

impl Compiler {
    pub fn new(source: &str, options: CompileOptions) -> Self {
        let source: Rc<str> = source.into();
        let file: Rc<str> = options.file.into();
        let main = CodeBuilder::new(
            "main".to_string(),
            String::new(),
            false,
            source.clone(),
            file.clone(),
        );

        let mut scopes = ScopeStack::new();
        for name in &options.globals {
            scopes.define(name);
        }

        Self {
            builders: vec![main],
            scopes,
            source,
            file,
            func_counter: 0,
            error: None,
        }
    }

    pub fn compile_program(mut self, program: &Program) -> Result<Rc<Code>, ScriptError> {
        self.hoist_functions(&program.stmts);

        let last = program.stmts.len().saturating_sub(1);
        for (i, stmt) in program.stmts.iter().enumerate() {
            self.compile_statement(stmt, i == last);
            if let Some(err) = self.error.take() {
                return Err(err);
            }
        }
        self.emit(Op::Halt);

        if let Some(err) = self.error.take() {
            return Err(err);
        }

        let global_count = self.scopes.current().local_count();
        let global_names = self.scopes.current().local_names();
        let main = self.builders.pop().expect("main builder");
        Ok(main.into_code(0, global_count, Vec::new(), global_names))
    }

    // -------------------------------------------------------------------
    // Infrastructure
    // -------------------------------------------------------------------

    fn b(&mut self) -> &mut CodeBuilder {
        self.builders.last_mut().expect("active builder")
    }

    fn emit(&mut self, op: Op) -> usize {
        self.b().emit(op as u16)
    }

    fn emit1(&mut self, op: Op, operand: u16) -> usize {
        self.b().emit1(op as u16, operand)
    }

    fn emit2(&mut self, op: Op, a: u16, b: u16) -> usize {
        self.b().emit2(op as u16, a, b)
    }

    /// Emit a forward jump with a placeholder target; returns the opcode
    /// offset for later patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit1(op, NO_TARGET)
    }

    /// Point a previously emitted jump at the current offset. Jump deltas
    /// are relative to the jump opcode itself.
    fn patch_jump(&mut self, at: usize) {
        let delta = (self.b().offset() - at) as u16;
        self.b().patch(at + 1, delta);
    }

    fn mark(&mut self, pos: Pos, end: Pos) {
        let end_column = if end.line == pos.line && end.column > pos.column {
            end.column_number()
        } else {
            pos.column_number() + 1
        };
        self.b()
            .set_span(pos.line_number(), pos.column_number(), end_column);
    }

    fn span_of(&self, pos: Pos, end: Pos) -> SourceSpan {
        let mut span = SourceSpan::new(
            self.file.to_string(),
            pos.line_number(),
            pos.column_number(),
        );
        if end.line == pos.line && end.column > pos.column {
            span = span.with_end_column(end.column_number());
        }
        if let Some(text) = self.source.lines().nth(pos.line) {
            span = span.with_source_line(text);
        }
        span
    }

    fn fail(&mut self, err: ScriptError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn fail_at(&mut self, err: ScriptError, pos: Pos, end: Pos) {
        let span = self.span_of(pos, end);
        self.fail(err.with_span(span));
    }

    fn hoist_functions(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            if let Stmt::Func(func) = stmt {
                if let Some(name) = &func.name {
                    self.scopes.define(&name.name);
                }
            }
        }
    }

    fn load_resolution(&mut self, resolution: &Resolution) {
        match resolution.scope {
            Scope::Local => self.emit1(Op::LoadLocal, resolution.symbol.index),
            Scope::Global => self.emit1(Op::LoadGlobal, resolution.symbol.index),
            Scope::Free => self.emit1(Op::LoadFree, resolution.free_index as u16),
        };
    }

    fn store_resolution(&mut self, resolution: &Resolution) {
        match resolution.scope {
            Scope::Local => self.emit1(Op::StoreLocal, resolution.symbol.index),
            Scope::Global => self.emit1(Op::StoreGlobal, resolution.symbol.index),
            Scope::Free => self.emit1(Op::StoreFree, resolution.free_index as u16),
        };
    }

    fn store_symbol(&mut self, symbol: &Symbol) {
        if self.scopes.is_root() {
            self.emit1(Op::StoreGlobal, symbol.index);
        } else {
            self.emit1(Op::StoreLocal, symbol.index);
        }
    }

    // -------------------------------------------------------------------
    // Statements
    // -------------------------------------------------------------------

    fn compile_statement(&mut self, stmt: &Stmt, keep_value: bool) {
        match stmt {
            Stmt::Let(s) => self.compile_let(s),
            Stmt::LetUnpack(s) => self.compile_let_unpack(s),
            Stmt::DestructureMap(s) => self.compile_destructure_map(s),
            Stmt::DestructureList(s) => self.compile_destructure_list(s),
            Stmt::Const(s) => self.compile_const(s),
            Stmt::Return(s) => self.compile_return(s),
            Stmt::Assign(s) => self.compile_assign(s),
            Stmt::AssignAttr(s) => self.compile_assign_attr(s),
            Stmt::Postfix(s) => self.compile_postfix(s),
            Stmt::Throw(s) => self.compile_throw(s),
            Stmt::Func(func) => self.compile_func_statement(func),
            Stmt::Expr(expr) => {
                self.compile_expr(expr);
                if !keep_value {
                    self.emit(Op::Pop);
                }
            }
        }
    }

    fn compile_let(&mut self, stmt: &LetStmt) {
        self.compile_expr(&stmt.value);
        let symbol = self.scopes.define(&stmt.name.name);
        self.store_symbol(&symbol);
    }

    fn compile_let_unpack(&mut self, stmt: &LetUnpackStmt) {
        self.compile_expr(&stmt.value);
        self.emit1(Op::Unpack, stmt.names.len() as u16);
        for name in &stmt.names {
            let symbol = self.scopes.define(&name.name);
            self.store_symbol(&symbol);
        }
    }

    fn compile_destructure_map(&mut self, stmt: &DestructureMapStmt) {
        self.compile_expr(&stmt.value);
        self.compile_map_bindings(&stmt.bindings);
        self.emit(Op::Pop);
    }

    /// Bind each key of the container at the top of the stack; leaves the
    /// container in place.
    fn compile_map_bindings(&mut self, bindings: &[MapBinding]) {
        for binding in bindings {
            self.emit1(Op::Copy, 0);
            let name_index = self.b().add_name(&binding.key) as u16;
            self.emit1(Op::LoadAttrOrNil, name_index);

            if let Some(default) = &binding.default {
                let done = self.emit_jump(Op::PopJumpIfNotNil);
                self.compile_expr(default);
                self.patch_jump(done);
            }

            let symbol = self.scopes.define(binding.target_name());
            self.store_symbol(&symbol);
        }
    }

    fn compile_destructure_list(&mut self, stmt: &DestructureListStmt) {
        self.compile_expr(&stmt.value);
        self.compile_list_bindings(&stmt.elements);
    }

    /// Unpack the container at the top of the stack into named bindings.
    fn compile_list_bindings(&mut self, elements: &[ListBinding]) {
        self.emit1(Op::Unpack, elements.len() as u16);
        for element in elements {
            if let Some(default) = &element.default {
                let done = self.emit_jump(Op::PopJumpIfNotNil);
                self.compile_expr(default);
                self.patch_jump(done);
            }
            let symbol = self.scopes.define(&element.name.name);
            self.store_symbol(&symbol);
        }
    }

    fn compile_const(&mut self, stmt: &ConstStmt) {
        self.compile_expr(&stmt.value);
        let symbol = self.scopes.define_constant(&stmt.name.name);
        self.store_symbol(&symbol);
    }

    fn compile_return(&mut self, stmt: &ReturnStmt) {
        match &stmt.value {
            Some(value) => self.compile_expr(value),
            None => {
                self.emit(Op::Nil);
            }
        }
        self.emit(Op::Return);
    }

    fn compile_assign(&mut self, stmt: &AssignStmt) {
        match &stmt.target {
            AssignTarget::Ident(ident) => {
                let Some(resolution) = self.scopes.resolve(&ident.name) else {
                    self.undefined_variable(&ident.name, ident.pos, ident.end());
                    return;
                };
                if resolution.symbol.constant {
                    self.fail_at(
                        ScriptError::value_error(format!(
                            "cannot assign to constant \"{}\"",
                            ident.name
                        )),
                        ident.pos,
                        ident.end(),
                    );
                    return;
                }

                if stmt.op == "=" {
                    self.compile_expr(&stmt.value);
                } else {
                    self.load_resolution(&resolution);
                    self.compile_expr(&stmt.value);
                    self.compile_compound_op(&stmt.op, stmt.op_pos);
                }
                self.store_resolution(&resolution);
            }
            AssignTarget::Index(index) => {
                self.compile_expr(&index.object);
                self.compile_expr(&index.index);

                if stmt.op == "=" {
                    self.compile_expr(&stmt.value);
                } else {
                    self.emit1(Op::Copy, 1);
                    self.emit1(Op::Copy, 1);
                    self.emit(Op::Index);
                    self.compile_expr(&stmt.value);
                    self.compile_compound_op(&stmt.op, stmt.op_pos);
                }
                self.emit(Op::StoreIndex);
            }
        }
    }

    fn compile_assign_attr(&mut self, stmt: &AssignAttrStmt) {
        self.compile_expr(&stmt.object);
        let name_index = self.b().add_name(&stmt.attr.name) as u16;

        if stmt.op == "=" {
            self.compile_expr(&stmt.value);
        } else {
            self.emit1(Op::Copy, 0);
            self.emit1(Op::LoadAttr, name_index);
            self.compile_expr(&stmt.value);
            self.compile_compound_op(&stmt.op, stmt.op_pos);
        }
        self.emit1(Op::StoreAttr, name_index);
    }

    fn compile_postfix(&mut self, stmt: &PostfixStmt) {
        let Expr::Ident(ident) = &stmt.operand else {
            self.fail_at(
                ScriptError::syntax("postfix operator requires a variable"),
                stmt.operand.pos(),
                stmt.operand.end(),
            );
            return;
        };
        let Some(resolution) = self.scopes.resolve(&ident.name) else {
            self.undefined_variable(&ident.name, ident.pos, ident.end());
            return;
        };

        self.load_resolution(&resolution);
        let one = self.b().add_constant(Constant::Int(1)) as u16;
        self.emit1(Op::LoadConst, one);
        let op = if stmt.op == "++" { BinOp::Add } else { BinOp::Sub };
        self.emit1(Op::BinaryOp, op as u16);
        self.store_resolution(&resolution);
    }

    fn compile_throw(&mut self, stmt: &ThrowStmt) {
        self.mark(stmt.throw_pos, stmt.value.end());
        self.compile_expr(&stmt.value);
        self.emit(Op::Throw);
    }

    fn compile_func_statement(&mut self, func: &Rc<FuncLit>) {
        let name = func.name.as_ref().expect("named function statement");
        self.scopes.define(&name.name);
        self.compile_function(func);
        if let Some(resolution) = self.scopes.resolve(&name.name) {
            self.store_resolution(&resolution);
        }
    }

    // -------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------

    fn compile_expr(&mut self, expr: &Expr) {
        self.mark(expr.pos(), expr.end());

        match expr {
            Expr::Int(lit) => {
                let index = self.b().add_constant(Constant::Int(lit.value)) as u16;
                self.emit1(Op::LoadConst, index);
            }
            Expr::Float(lit) => {
                let index = self.b().add_constant(Constant::Float(lit.value)) as u16;
                self.emit1(Op::LoadConst, index);
            }
            Expr::Bool(lit) => {
                self.emit(if lit.value { Op::True } else { Op::False });
            }
            Expr::Nil(_) => {
                self.emit(Op::Nil);
            }
            Expr::Str(lit) => {
                let index = self
                    .b()
                    .add_constant(Constant::String(lit.value.clone().into()))
                    as u16;
                self.emit1(Op::LoadConst, index);
            }
            Expr::Template(template) => self.compile_template(template),
            Expr::Ident(ident) => {
                let Some(resolution) = self.scopes.resolve(&ident.name) else {
                    self.undefined_variable(&ident.name, ident.pos, ident.end());
                    return;
                };
                self.load_resolution(&resolution);
            }
            Expr::Prefix(prefix) => self.compile_prefix(prefix),
            Expr::Infix(infix) => self.compile_infix(infix),
            Expr::Ternary(ternary) => self.compile_ternary(ternary),
            Expr::Spread(spread) => {
                match &spread.value {
                    Some(value) => self.compile_expr(value),
                    None => {
                        self.emit(Op::Nil);
                    }
                };
            }
            Expr::List(list) => self.compile_list(list),
            Expr::Map(map) => self.compile_map(map),
            Expr::Func(func) => self.compile_function(func),
            Expr::Call(call) => self.compile_call(call),
            Expr::GetAttr(attr) => self.compile_get_attr(attr),
            Expr::MethodCall(call) => self.compile_method_call(call),
            Expr::Index(index) => self.compile_index(index),
            Expr::Slice(slice) => self.compile_slice(slice),
            Expr::If(if_expr) => self.compile_if(if_expr),
            Expr::Switch(switch) => self.compile_switch(switch),
            Expr::Match(match_expr) => self.compile_match(match_expr),
            Expr::In(membership) => self.compile_in(membership),
            Expr::Pipe(pipe) => self.compile_pipe(pipe),
            Expr::Try(try_expr) => self.compile_try(try_expr),
        }
    }

    fn undefined_variable(&mut self, name: &str, pos: Pos, end: Pos) {
        let mut err = ScriptError::name_error(format!("undefined variable \"{}\"", name));
        if let Some(hint) = suggestion_hint(name, self.scopes.visible_names()) {
            err = err.with_hint(hint);
        }
        self.fail_at(err, pos, end);
    }

    fn compile_template(&mut self, template: &TemplateLit) {
        if let [TemplatePart::Text(text)] = template.parts.as_slice() {
            let index = self.b().add_constant(Constant::String(text.clone().into())) as u16;
            self.emit1(Op::LoadConst, index);
            return;
        }

        for part in &template.parts {
            match part {
                TemplatePart::Text(text) => {
                    let index =
                        self.b().add_constant(Constant::String(text.clone().into())) as u16;
                    self.emit1(Op::LoadConst, index);
                }
                TemplatePart::Interp(expr) => self.compile_expr(expr),
            }
        }
        self.emit1(Op::BuildString, template.parts.len() as u16);
    }

    fn compile_prefix(&mut self, prefix: &PrefixExpr) {
        self.compile_expr(&prefix.operand);
        match prefix.op.as_str() {
            "-" => {
                self.emit(Op::Negate);
            }
            "!" | "not" => {
                self.emit(Op::Not);
            }
            other => self.fail_at(
                ScriptError::syntax(format!("unknown prefix operator \"{}\"", other)),
                prefix.op_pos,
                prefix.op_pos.advance(other.len()),
            ),
        }
    }

    fn compile_infix(&mut self, infix: &InfixExpr) {
        match infix.op.as_str() {
            "&&" => {
                self.compile_expr(&infix.left);
                let short = self.emit_jump(Op::PopJumpIfFalse);
                self.compile_expr(&infix.right);
                let done = self.emit_jump(Op::Jump);
                self.patch_jump(short);
                self.emit(Op::False);
                self.patch_jump(done);
                return;
            }
            "||" => {
                self.compile_expr(&infix.left);
                let short = self.emit_jump(Op::PopJumpIfTrue);
                self.compile_expr(&infix.right);
                let done = self.emit_jump(Op::Jump);
                self.patch_jump(short);
                self.emit(Op::True);
                self.patch_jump(done);
                return;
            }
            "??" => {
                self.compile_expr(&infix.left);
                let done = self.emit_jump(Op::PopJumpIfNotNil);
                self.compile_expr(&infix.right);
                self.patch_jump(done);
                return;
            }
            _ => {}
        }

        self.compile_expr(&infix.left);
        self.compile_expr(&infix.right);
        self.mark(infix.left.pos(), infix.right.end());

        if let Some(op) = binary_op(&infix.op) {
            self.emit1(Op::BinaryOp, op as u16);
        } else if let Some(op) = compare_op(&infix.op) {
            self.emit1(Op::CompareOp, op as u16);
        } else {
            self.fail_at(
                ScriptError::syntax(format!("unknown operator \"{}\"", infix.op)),
                infix.op_pos,
                infix.op_pos.advance(infix.op.len()),
            );
        }
    }

    fn compile_ternary(&mut self, ternary: &TernaryExpr) {
        self.compile_expr(&ternary.condition);
        let otherwise = self.emit_jump(Op::PopJumpIfFalse);
        self.compile_expr(&ternary.consequence);
        let done = self.emit_jump(Op::Jump);
        self.patch_jump(otherwise);
        self.compile_expr(&ternary.otherwise);
        self.patch_jump(done);
    }

    fn compile_compound_op(&mut self, op: &str, pos: Pos) {
        let binop = match op {
            "+=" => BinOp::Add,
            "-=" => BinOp::Sub,
            "*=" => BinOp::Mul,
            "/=" => BinOp::Div,
            other => {
                self.fail_at(
                    ScriptError::syntax(format!("unknown compound operator \"{}\"", other)),
                    pos,
                    pos.advance(other.len()),
                );
                return;
            }
        };
        self.emit1(Op::BinaryOp, binop as u16);
    }

    fn compile_list(&mut self, list: &ListLit) {
        let has_spread = list.items.iter().any(|i| matches!(i, Expr::Spread(_)));
        if !has_spread {
            for item in &list.items {
                self.compile_expr(item);
            }
            self.emit1(Op::BuildList, list.items.len() as u16);
            return;
        }

        self.emit1(Op::BuildList, 0);
        for item in &list.items {
            if let Expr::Spread(spread) = item {
                if let Some(value) = &spread.value {
                    self.compile_expr(value);
                    self.emit(Op::ListExtend);
                }
            } else {
                self.compile_expr(item);
                self.emit(Op::ListAppend);
            }
        }
    }

    fn compile_map(&mut self, map: &MapLit) {
        let has_spread = map.items.iter().any(|i| i.key.is_none());
        if !has_spread {
            for item in &map.items {
                self.compile_map_key(item.key.as_ref().expect("map key"));
                self.compile_expr(&item.value);
            }
            self.emit1(Op::BuildMap, map.items.len() as u16);
            return;
        }

        self.emit1(Op::BuildMap, 0);
        for item in &map.items {
            match &item.key {
                None => {
                    self.compile_expr(&item.value);
                    self.emit(Op::MapMerge);
                }
                Some(key) => {
                    self.compile_map_key(key);
                    self.compile_expr(&item.value);
                    self.emit(Op::MapSet);
                }
            }
        }
    }

    fn compile_map_key(&mut self, key: &Expr) {
        // Bare identifier keys are the literal key name.
        if let Expr::Ident(ident) = key {
            let index = self
                .b()
                .add_constant(Constant::String(ident.name.clone().into())) as u16;
            self.emit1(Op::LoadConst, index);
        } else {
            self.compile_expr(key);
        }
    }

    fn compile_call(&mut self, call: &CallExpr) {
        self.compile_expr(&call.callee);

        let has_spread = call.args.iter().any(|a| matches!(a, Expr::Spread(_)));
        if has_spread {
            self.compile_arg_list(&call.args);
            self.mark(call.callee.pos(), call.rparen.advance(1));
            self.emit(Op::CallSpread);
            return;
        }

        if call.args.len() > MAX_CALL_ARGS {
            self.fail_at(
                ScriptError::args_error(format!(
                    "call with more than {} arguments",
                    MAX_CALL_ARGS
                )),
                call.lparen,
                call.rparen,
            );
            return;
        }

        for arg in &call.args {
            self.compile_expr(arg);
        }
        let argc = call.args.len();
        self.b().note_call_args(argc);
        self.mark(call.callee.pos(), call.rparen.advance(1));
        self.emit1(Op::Call, argc as u16);
    }

    /// Build a single argument list value, expanding spreads.
    fn compile_arg_list(&mut self, args: &[Expr]) {
        self.emit1(Op::BuildList, 0);
        for arg in args {
            if let Expr::Spread(spread) = arg {
                if let Some(value) = &spread.value {
                    self.compile_expr(value);
                    self.emit(Op::ListExtend);
                }
            } else {
                self.compile_expr(arg);
                self.emit(Op::ListAppend);
            }
        }
    }

    fn compile_get_attr(&mut self, attr: &GetAttrExpr) {
        self.compile_expr(&attr.object);
        let name_index = self.b().add_name(&attr.attr.name) as u16;
        self.mark(attr.object.pos(), attr.attr.end());

        if attr.optional {
            self.emit1(Op::Copy, 0);
            let nil_case = self.emit_jump(Op::PopJumpIfNil);
            self.emit1(Op::LoadAttr, name_index);
            let done = self.emit_jump(Op::Jump);
            self.patch_jump(nil_case);
            self.emit(Op::Pop);
            self.emit(Op::Nil);
            self.patch_jump(done);
        } else {
            self.emit1(Op::LoadAttr, name_index);
        }
    }

    fn compile_method_call(&mut self, call: &MethodCallExpr) {
        self.compile_expr(&call.object);
        let name_index = self.b().add_name(&call.method.name) as u16;
        self.mark(call.object.pos(), call.call.rparen.advance(1));

        let nil_case = if call.optional {
            self.emit1(Op::Copy, 0);
            Some(self.emit_jump(Op::PopJumpIfNil))
        } else {
            None
        };

        // The receiver is passed as the method's first argument.
        self.emit1(Op::Copy, 0);
        self.emit1(Op::LoadAttr, name_index);
        self.emit1(Op::Swap, 1);

        let has_spread = call.call.args.iter().any(|a| matches!(a, Expr::Spread(_)));
        if has_spread {
            self.emit1(Op::BuildList, 0);
            self.emit1(Op::Swap, 1);
            self.emit(Op::ListAppend);
            for arg in &call.call.args {
                if let Expr::Spread(spread) = arg {
                    if let Some(value) = &spread.value {
                        self.compile_expr(value);
                        self.emit(Op::ListExtend);
                    }
                } else {
                    self.compile_expr(arg);
                    self.emit(Op::ListAppend);
                }
            }
            self.emit(Op::CallSpread);
        } else {
            for arg in &call.call.args {
                self.compile_expr(arg);
            }
            let argc = call.call.args.len() + 1;
            self.b().note_call_args(argc);
            self.emit1(Op::Call, argc as u16);
        }

        if let Some(nil_case) = nil_case {
            let done = self.emit_jump(Op::Jump);
            self.patch_jump(nil_case);
            self.emit(Op::Pop);
            self.emit(Op::Nil);
            self.patch_jump(done);
        }
    }

    fn compile_index(&mut self, index: &IndexExpr) {
        self.compile_expr(&index.object);
        self.compile_expr(&index.index);
        self.mark(index.object.pos(), index.rbracket.advance(1));
        self.emit(Op::Index);
    }

    fn compile_slice(&mut self, slice: &SliceExpr) {
        self.compile_expr(&slice.object);
        match &slice.low {
            Some(low) => self.compile_expr(low),
            None => {
                self.emit(Op::Nil);
            }
        }
        match &slice.high {
            Some(high) => self.compile_expr(high),
            None => {
                self.emit(Op::Nil);
            }
        }
        self.mark(slice.object.pos(), slice.rbracket.advance(1));
        self.emit(Op::Slice);
    }

    fn compile_if(&mut self, if_expr: &IfExpr) {
        self.compile_expr(&if_expr.condition);
        let alt = self.emit_jump(Op::PopJumpIfFalse);

        self.compile_block_value(&if_expr.consequence.stmts);
        let done = self.emit_jump(Op::Jump);
        self.patch_jump(alt);

        match &if_expr.alternative {
            Some(alternative) => self.compile_block_value(&alternative.stmts),
            None => {
                self.emit(Op::Nil);
            }
        }
        self.patch_jump(done);
    }

    /// Compile a block whose last expression is the block's value.
    fn compile_block_value(&mut self, stmts: &[Stmt]) {
        if stmts.is_empty() {
            self.emit(Op::Nil);
            return;
        }
        let last = stmts.len() - 1;
        for (i, stmt) in stmts.iter().enumerate() {
            if i == last {
                match stmt {
                    Stmt::Expr(expr) => self.compile_expr(expr),
                    other => {
                        self.compile_statement(other, false);
                        self.emit(Op::Nil);
                    }
                }
            } else {
                self.compile_statement(stmt, false);
            }
        }
    }

    fn compile_switch(&mut self, switch: &SwitchExpr) {
        self.compile_expr(&switch.value);

        let mut done_jumps = Vec::new();
        let default = switch.cases.iter().find(|c| c.values.is_none());

        for case in switch.cases.iter().filter(|c| c.values.is_some()) {
            let CaseClause { values, body, .. } = case;
            let mut body_jumps = Vec::new();
            for value in values.as_ref().expect("case values") {
                self.emit1(Op::Copy, 0);
                self.compile_expr(value);
                self.emit1(Op::CompareOp, CmpOp::Eq as u16);
                body_jumps.push(self.emit_jump(Op::PopJumpIfTrue));
            }
            let next_case = self.emit_jump(Op::Jump);

            for jump in body_jumps {
                self.patch_jump(jump);
            }
            self.emit(Op::Pop);
            self.compile_block_value(&body.stmts);
            done_jumps.push(self.emit_jump(Op::Jump));
            self.patch_jump(next_case);
        }

        self.emit(Op::Pop);
        match default {
            Some(case) => self.compile_block_value(&case.body.stmts),
            None => {
                self.emit(Op::Nil);
            }
        }

        for jump in done_jumps {
            self.patch_jump(jump);
        }
    }

    fn compile_match(&mut self, match_expr: &MatchExpr) {
        self.compile_expr(&match_expr.subject);

        let mut done_jumps = Vec::new();

        for arm in &match_expr.arms {
            self.emit1(Op::Copy, 0);
            if let Pattern::Literal(pattern) = &arm.pattern {
                self.compile_expr(pattern);
            }
            self.emit1(Op::CompareOp, CmpOp::Eq as u16);
            let no_match = self.emit_jump(Op::PopJumpIfFalse);

            let no_guard = arm.guard.as_ref().map(|guard| {
                self.compile_expr(guard);
                self.emit_jump(Op::PopJumpIfFalse)
            });

            self.emit(Op::Pop);
            self.compile_expr(&arm.result);
            done_jumps.push(self.emit_jump(Op::Jump));

            self.patch_jump(no_match);
            if let Some(no_guard) = no_guard {
                self.patch_jump(no_guard);
            }
        }

        self.emit(Op::Pop);
        match &match_expr.default_arm {
            Some(arm) => self.compile_expr(&arm.result),
            None => {
                self.emit(Op::Nil);
            }
        }

        for jump in done_jumps {
            self.patch_jump(jump);
        }
    }

    fn compile_in(&mut self, membership: &InExpr) {
        self.compile_expr(&membership.right);
        self.compile_expr(&membership.left);
        self.mark(membership.left.pos(), membership.right.end());
        self.emit1(Op::Contains, u16::from(membership.negated));
    }

    fn compile_pipe(&mut self, pipe: &PipeExpr) {
        self.compile_expr(&pipe.stages[0]);

        for stage in &pipe.stages[1..] {
            if let Expr::Call(call) = stage {
                if call.args.iter().any(|a| matches!(a, Expr::Spread(_))) {
                    self.fail_at(
                        ScriptError::syntax("spread arguments are not supported in pipelines"),
                        call.lparen,
                        call.rparen,
                    );
                    return;
                }
                // Bind the written arguments into a partial, then feed the
                // piped value through it.
                self.compile_expr(&call.callee);
                for arg in &call.args {
                    self.compile_expr(arg);
                }
                self.emit1(Op::MakePartial, call.args.len() as u16);
            } else {
                self.compile_expr(stage);
            }
            self.emit1(Op::Swap, 1);
            self.b().note_call_args(1);
            self.emit1(Op::Call, 1);
        }
    }

    fn compile_try(&mut self, try_expr: &TryExpr) {
        let has_catch = try_expr.catch_block.is_some();
        let has_finally = try_expr.finally_block.is_some();

        let try_start = self.b().offset();
        let push_at = self.emit2(Op::PushExcept, NO_TARGET, NO_TARGET);

        self.compile_block_value(&try_expr.body.stmts);
        let try_end = self.b().offset();
        self.emit(Op::PopExcept);

        // Without a finally block PopExcept falls through, so the catch
        // block must be jumped over.
        let skip_catch = if has_catch && !has_finally {
            Some(self.emit_jump(Op::Jump))
        } else {
            None
        };

        let mut catch_start = None;
        let mut catch_var_slot = None;
        if let Some(catch_block) = &try_expr.catch_block {
            let offset = self.b().offset();
            catch_start = Some(offset);

            match &try_expr.catch_ident {
                Some(ident) => {
                    let symbol = self.scopes.define(&ident.name);
                    catch_var_slot = Some(symbol.index);
                    self.store_symbol(&symbol);
                }
                None => {
                    self.emit(Op::Pop);
                }
            }

            self.compile_block_value(&catch_block.stmts);
            if has_finally {
                self.emit(Op::PopExcept);
            }
        }

        let mut finally_start = None;
        if let Some(finally_block) = &try_expr.finally_block {
            let offset = self.b().offset();
            finally_start = Some(offset);
            for stmt in &finally_block.stmts {
                self.compile_statement(stmt, false);
            }
            self.emit(Op::EndFinally);
        }

        if let Some(skip_catch) = skip_catch {
            self.patch_jump(skip_catch);
        }

        if let Some(catch) = catch_start {
            self.b().patch(push_at + 1, (catch - push_at) as u16);
        }
        if let Some(finally) = finally_start {
            self.b().patch(push_at + 2, (finally - push_at) as u16);
        }

        self.b().add_handler(HandlerRecord {
            try_start,
            try_end,
            catch_start,
            finally_start,
            catch_var_slot,
        });
    }

    // -------------------------------------------------------------------
    // Functions
    // -------------------------------------------------------------------

    fn compile_function(&mut self, func: &FuncLit) {
        self.func_counter += 1;
        let id = format!("fn{}", self.func_counter);
        let func_name = func
            .name
            .as_ref()
            .map(|n| n.name.clone())
            .unwrap_or_default();

        self.scopes.enter_function();
        self.builders.push(CodeBuilder::new(
            id,
            func_name.clone(),
            func.name.is_some(),
            self.source.clone(),
            self.file.clone(),
        ));

        // Parameter slots come first, then the rest parameter, then the
        // function's own name for self-recursion.
        let mut patterns: Vec<(u16, &FuncParam)> = Vec::new();
        let mut params: Vec<Param> = Vec::new();

        for param in &func.params {
            match param {
                FuncParam::Ident { name, default } => {
                    self.scopes.define(&name.name);
                    let default = match default {
                        None => None,
                        Some(expr) => match literal_constant(expr) {
                            Some(constant) => Some(constant),
                            None => {
                                self.fail_at(
                                    ScriptError::syntax(
                                        "default parameter value must be a literal",
                                    ),
                                    expr.pos(),
                                    expr.end(),
                                );
                                None
                            }
                        },
                    };
                    params.push(Param {
                        name: name.name.clone(),
                        default,
                    });
                }
                FuncParam::MapPattern { .. } | FuncParam::ListPattern { .. } => {
                    let slot = self.scopes.current_mut().claim_slot();
                    patterns.push((slot, param));
                    params.push(Param {
                        name: "_".to_string(),
                        default: None,
                    });
                }
            }
        }

        let rest_param = func.rest_param.as_ref().map(|rest| {
            self.scopes.define(&rest.name);
            rest.name.clone()
        });

        let self_slot = match &func.name {
            Some(name) if !self.scopes.current().is_defined(&name.name) => {
                Some(self.scopes.define(&name.name).index)
            }
            _ => None,
        };

        {
            let builder = self.b();
            builder.params = params;
            builder.rest_param = rest_param;
            builder.self_slot = self_slot;
        }

        // Destructure pattern parameters into their named locals.
        for (slot, param) in patterns {
            self.emit1(Op::LoadLocal, slot);
            match param {
                FuncParam::MapPattern { bindings, .. } => {
                    self.compile_map_bindings(bindings);
                    self.emit(Op::Pop);
                }
                FuncParam::ListPattern { elements, .. } => {
                    self.compile_list_bindings(elements);
                }
                FuncParam::Ident { .. } => unreachable!(),
            }
        }

        self.hoist_functions(&func.body.stmts);

        let ends_with_return = matches!(func.body.stmts.last(), Some(Stmt::Return(_)));
        if ends_with_return {
            for stmt in &func.body.stmts {
                self.compile_statement(stmt, false);
            }
        } else {
            // The last expression of a body is its implicit return value.
            self.compile_block_value(&func.body.stmts);
            self.emit(Op::Return);
        }

        let scope = self.scopes.exit_function();
        let free_vars = scope.free_vars().to_vec();
        let local_count = scope.local_count();
        let local_names = scope.local_names();

        let builder = self.builders.pop().expect("function builder");
        let code = builder.into_code(local_count, 0, local_names, Vec::new());
        let const_index = self.b().add_constant(Constant::Function(code)) as u16;

        if free_vars.is_empty() {
            self.emit1(Op::LoadConst, const_index);
            return;
        }

        // Stage a cell per captured variable: defined here (depth 1) or
        // passed down from this function's own captures.
        for free in &free_vars {
            if free.depth == 1 {
                self.emit2(Op::MakeCell, free.symbol.index, 0);
            } else {
                let passthrough = self
                    .scopes
                    .current()
                    .get_free(&free.symbol.name)
                    .map(|r| r.free_index as u16)
                    .unwrap_or(0);
                self.emit2(Op::MakeCell, passthrough, 1);
            }
        }
        self.emit2(Op::LoadClosure, const_index, free_vars.len() as u16);
    }
}

fn binary_op(op: &str) -> Option<BinOp> {
    Some(match op {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "%" => BinOp::Rem,
        "**" => BinOp::Pow,
        "&" => BinOp::BitAnd,
        "|" => BinOp::BitOr,
        "^" => BinOp::BitXor,
        "<<" => BinOp::Shl,
        ">>" => BinOp::Shr,
        _ => return None,
    })
}

fn compare_op(op: &str) -> Option<CmpOp> {
    Some(match op {
        "<" => CmpOp::Lt,
        "<=" => CmpOp::Le,
        "==" => CmpOp::Eq,
        "!=" => CmpOp::Ne,
        ">" => CmpOp::Gt,
        ">=" => CmpOp::Ge,
        _ => return None,
    })
}

/// Literal expressions usable as parameter defaults.
fn literal_constant(expr: &Expr) -> Option<Constant> {
    match expr {
        Expr::Int(lit) => Some(Constant::Int(lit.value)),
        Expr::Float(lit) => Some(Constant::Float(lit.value)),
        Expr::Str(lit) => Some(Constant::String(lit.value.clone().into())),
        Expr::Bool(lit) => Some(Constant::Bool(lit.value)),
        Expr::Nil(_) => Some(Constant::Nil),
        Expr::Prefix(prefix) if prefix.op == "-" => match &prefix.operand {
            Expr::Int(lit) => Some(Constant::Int(-lit.value)),
            Expr::Float(lit) => Some(Constant::Float(-lit.value)),
            _ => None,
        },
        _ => None,
    }
}

/// Parse and compile source text in one step.
pub fn compile(source: &str, options: CompileOptions) -> Result<Rc<Code>, CompileError> {
    let program = vesper_parser::parse_with_file(source, &options.file)?;
    let compiler = Compiler::new(source, options);
    compiler
        .compile_program(&program)
        .map_err(CompileError::Compile)
}
