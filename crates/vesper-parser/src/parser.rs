//! Pratt parser for Vesper.

use std::fmt;
use std::rc::Rc;

use vesper_error::{ScriptError, SourceSpan};
use vesper_lexer::{Lexer, LexerState, Pos, Token, TokenKind};

use crate::ast::*;
use crate::continuation::{continues_line, joins_line};
use crate::precedence::Precedence;

/// Parsing stops collecting diagnostics after this many errors.
pub const MAX_ERRORS: usize = 16;

/// Nesting-depth guard against stack-blowing syntax.
pub const MAX_DEPTH: usize = 600;

/// Aggregate of all syntax errors from one parse, plus the partial AST.
#[derive(Debug)]
pub struct ParseErrors {
    pub errors: Vec<ScriptError>,
    pub partial: Program,
}

impl ParseErrors {
    pub fn first(&self) -> &ScriptError {
        &self.errors[0]
    }
}

impl fmt::Display for ParseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.errors[0])?;
        if self.errors.len() > 1 {
            write!(f, " (and {} more)", self.errors.len() - 1)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseErrors {}

/// Saved parser progress, for speculative parses (arrow parameter lists).
struct Checkpoint {
    lexer: LexerState,
    cur: Token,
    peek: Token,
    errors_len: usize,
}

/// Pratt parser over a token stream.
pub struct Parser {
    lexer: Lexer,
    file: String,
    cur: Token,
    peek: Token,
    errors: Vec<ScriptError>,
    depth: usize,
}

impl Parser {
    pub fn new(source: &str, file: &str) -> Self {
        let mut parser = Self {
            lexer: Lexer::new(source),
            file: file.to_string(),
            cur: Token::new(TokenKind::Eof, String::new(), Pos::default(), Pos::default()),
            peek: Token::new(TokenKind::Eof, String::new(), Pos::default(), Pos::default()),
            errors: Vec::new(),
            depth: 0,
        };
        parser.advance();
        parser.advance();
        parser
    }

    /// Parse the whole input. On failure the partial AST travels with the
    /// collected errors.
    pub fn parse(&mut self) -> Result<Program, ParseErrors> {
        let mut stmts = Vec::new();
        self.skip_terminators();

        while !self.at(TokenKind::Eof) && self.errors.len() < MAX_ERRORS {
            match self.parse_statement() {
                Some(stmt) => stmts.push(stmt),
                None => self.synchronize(),
            }
            self.skip_terminators();
        }

        let program = Program { stmts };
        if self.errors.is_empty() {
            Ok(program)
        } else {
            Err(ParseErrors {
                errors: std::mem::take(&mut self.errors),
                partial: program,
            })
        }
    }

    pub fn errors(&self) -> &[ScriptError] {
        &self.errors
    }

    // -------------------------------------------------------------------
    // Token plumbing
    // -------------------------------------------------------------------

    fn advance(&mut self) {
        let next = match self.lexer.next_token() {
            Ok(token) => token,
            Err(err) => {
                self.record(ScriptError::syntax(err.to_string()));
                Token::new(TokenKind::Eof, String::new(), self.peek.start, self.peek.start)
            }
        };
        self.cur = std::mem::replace(&mut self.peek, next);
    }

    /// Consume an operator token; when the continuation policy allows the
    /// line to end with it, also swallow following newlines.
    fn advance_after_operator(&mut self) {
        let kind = self.cur.kind;
        self.advance();
        if continues_line(kind) {
            self.skip_newlines();
        }
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.cur.kind == kind
    }

    fn peek_is(&self, kind: TokenKind) -> bool {
        self.peek.kind == kind
    }

    fn skip_newlines(&mut self) {
        while self.at(TokenKind::Newline) {
            self.advance();
        }
    }

    fn skip_terminators(&mut self) {
        while self.at(TokenKind::Newline) || self.at(TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            self.error_here(format!("expected {}", what));
            false
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            lexer: self.lexer.save(),
            cur: self.cur.clone(),
            peek: self.peek.clone(),
            errors_len: self.errors.len(),
        }
    }

    fn rewind(&mut self, checkpoint: Checkpoint) {
        self.lexer.restore(checkpoint.lexer);
        self.cur = checkpoint.cur;
        self.peek = checkpoint.peek;
        self.errors.truncate(checkpoint.errors_len);
    }

    // -------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------

    fn span_at(&self, pos: Pos, len: usize) -> SourceSpan {
        SourceSpan::new(self.file.clone(), pos.line_number(), pos.column_number())
            .with_end_column(pos.column_number() + len.max(1))
            .with_source_line(self.lexer.line_text(&pos))
    }

    fn record(&mut self, err: ScriptError) {
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(err);
        }
    }

    fn error_at(&mut self, message: impl Into<String>, pos: Pos, len: usize) {
        let span = self.span_at(pos, len);
        self.record(ScriptError::syntax(message).with_span(span));
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let pos = self.cur.start;
        let len = self.cur.literal.chars().count();
        self.error_at(message, pos, len);
    }

    /// Skip to the next plausible statement boundary after an error.
    fn synchronize(&mut self) {
        if !self.at(TokenKind::Eof) {
            self.advance();
        }
        while !self.at(TokenKind::Eof) {
            if self.at(TokenKind::Newline) || self.at(TokenKind::Semicolon) {
                self.advance();
                return;
            }
            match self.cur.kind {
                TokenKind::Let
                | TokenKind::Const
                | TokenKind::Function
                | TokenKind::Return
                | TokenKind::If
                | TokenKind::Switch
                | TokenKind::Match
                | TokenKind::Try
                | TokenKind::Throw => return,
                _ => self.advance(),
            }
        }
    }

    fn ident_here(&mut self) -> Option<Ident> {
        if !self.at(TokenKind::Ident) {
            self.error_here("expected identifier");
            return None;
        }
        let ident = Ident {
            pos: self.cur.start,
            name: self.cur.literal.clone(),
        };
        self.advance();
        Some(ident)
    }

    // -------------------------------------------------------------------
    // Statements
    // -------------------------------------------------------------------

    fn parse_statement(&mut self) -> Option<Stmt> {
        match self.cur.kind {
            TokenKind::Let => self.parse_let(),
            TokenKind::Const => self.parse_const(),
            TokenKind::Return => Some(self.parse_return()),
            TokenKind::Throw => self.parse_throw(),
            _ => self.parse_expression_statement(),
        }
    }

    fn parse_let(&mut self) -> Option<Stmt> {
        let let_pos = self.cur.start;
        self.advance();

        if self.at(TokenKind::LBrace) {
            let brace = self.cur.start;
            let bindings = self.parse_map_pattern()?;
            if bindings.is_empty() {
                self.error_at("empty destructuring pattern", brace, 1);
                return None;
            }
            if !self.expect(TokenKind::Eq, "'='") {
                return None;
            }
            self.skip_newlines();
            let value = self.parse_expression(Precedence::Lowest)?;
            return Some(Stmt::DestructureMap(DestructureMapStmt {
                let_pos,
                bindings,
                value,
            }));
        }

        if self.at(TokenKind::LBracket) {
            let bracket = self.cur.start;
            let elements = self.parse_list_pattern()?;
            if elements.is_empty() {
                self.error_at("empty destructuring pattern", bracket, 1);
                return None;
            }
            if !self.expect(TokenKind::Eq, "'='") {
                return None;
            }
            self.skip_newlines();
            let value = self.parse_expression(Precedence::Lowest)?;
            return Some(Stmt::DestructureList(DestructureListStmt {
                let_pos,
                elements,
                value,
            }));
        }

        let first = self.ident_here()?;

        if self.at(TokenKind::Comma) {
            let mut names = vec![first];
            while self.at(TokenKind::Comma) {
                self.advance();
                self.skip_newlines();
                names.push(self.ident_here()?);
            }
            if !self.expect(TokenKind::Eq, "'='") {
                return None;
            }
            self.skip_newlines();
            let value = self.parse_expression(Precedence::Lowest)?;
            return Some(Stmt::LetUnpack(LetUnpackStmt {
                let_pos,
                names,
                value,
            }));
        }

        if !self.expect(TokenKind::Eq, "'='") {
            return None;
        }
        self.skip_newlines();
        let value = self.parse_expression(Precedence::Lowest)?;
        Some(Stmt::Let(LetStmt {
            let_pos,
            name: first,
            value,
        }))
    }

    fn parse_const(&mut self) -> Option<Stmt> {
        let const_pos = self.cur.start;
        self.advance();
        let name = self.ident_here()?;
        if !self.expect(TokenKind::Eq, "'='") {
            return None;
        }
        self.skip_newlines();
        let value = self.parse_expression(Precedence::Lowest)?;
        Some(Stmt::Const(ConstStmt {
            const_pos,
            name,
            value,
        }))
    }

    fn parse_return(&mut self) -> Stmt {
        let return_pos = self.cur.start;
        self.advance();

        if self.at(TokenKind::Newline)
            || self.at(TokenKind::Semicolon)
            || self.at(TokenKind::Eof)
            || self.at(TokenKind::RBrace)
        {
            return Stmt::Return(ReturnStmt {
                return_pos,
                value: None,
            });
        }

        let value = self.parse_expression(Precedence::Lowest);
        Stmt::Return(ReturnStmt { return_pos, value })
    }

    fn parse_throw(&mut self) -> Option<Stmt> {
        let throw_pos = self.cur.start;
        self.advance();

        if self.at(TokenKind::Newline) || self.at(TokenKind::Eof) || self.at(TokenKind::RBrace) {
            self.error_at("throw requires a value", throw_pos, 5);
            return None;
        }

        let value = self.parse_expression(Precedence::Lowest)?;
        Some(Stmt::Throw(ThrowStmt { throw_pos, value }))
    }

    fn parse_expression_statement(&mut self) -> Option<Stmt> {
        let expr = self.parse_expression(Precedence::Lowest)?;

        if self.at(TokenKind::Eq) || self.is_compound_assign() {
            return self.parse_assignment(expr);
        }

        if self.at(TokenKind::PlusPlus) || self.at(TokenKind::MinusMinus) {
            // Postfix operators bind only on the operand's own line.
            if self.cur.start.line != expr.end().line {
                self.error_here("postfix operator must be on the same line as its operand");
                return None;
            }
            let op_pos = self.cur.start;
            let op = self.cur.literal.clone();
            self.advance();
            return Some(Stmt::Postfix(PostfixStmt {
                operand: expr,
                op,
                op_pos,
            }));
        }

        // A named function literal in statement position declares a binding.
        if let Expr::Func(func) = &expr {
            if func.name.is_some() {
                return Some(Stmt::Func(func.clone()));
            }
        }

        Some(Stmt::Expr(expr))
    }

    fn is_compound_assign(&self) -> bool {
        matches!(
            self.cur.kind,
            TokenKind::PlusEq | TokenKind::MinusEq | TokenKind::StarEq | TokenKind::SlashEq
        )
    }

    fn parse_assignment(&mut self, target: Expr) -> Option<Stmt> {
        let op_pos = self.cur.start;
        let op = self.cur.literal.clone();
        self.advance_after_operator();

        let value = self.parse_expression(Precedence::Lowest)?;

        match target {
            Expr::Ident(ident) => Some(Stmt::Assign(AssignStmt {
                target: AssignTarget::Ident(ident),
                op,
                op_pos,
                value,
            })),
            Expr::Index(index) => Some(Stmt::Assign(AssignStmt {
                target: AssignTarget::Index(index),
                op,
                op_pos,
                value,
            })),
            Expr::GetAttr(attr) => {
                if attr.optional {
                    self.error_at(
                        "optional chaining is not a valid assignment target",
                        attr.dot,
                        2,
                    );
                    return None;
                }
                Some(Stmt::AssignAttr(AssignAttrStmt {
                    object: attr.object,
                    attr: attr.attr,
                    op,
                    op_pos,
                    value,
                }))
            }
            other => {
                self.error_at("invalid assignment target", other.pos(), 1);
                None
            }
        }
    }

    // -------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------

    fn parse_expression(&mut self, precedence: Precedence) -> Option<Expr> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.error_here("maximum expression nesting depth exceeded");
            self.depth -= 1;
            return None;
        }
        let result = self.parse_expression_at(precedence);
        self.depth -= 1;
        result
    }

    fn parse_expression_at(&mut self, precedence: Precedence) -> Option<Expr> {
        let mut left = self.parse_prefix()?;

        loop {
            if self.at(TokenKind::Eof) || self.at(TokenKind::Semicolon) {
                break;
            }

            // A line starting with a chaining operator joins the previous one.
            if self.at(TokenKind::Newline) {
                if joins_line(self.peek.kind) {
                    self.advance();
                    continue;
                }
                break;
            }

            if precedence >= Precedence::of(self.cur.kind) {
                break;
            }

            left = match self.cur.kind {
                TokenKind::Plus
                | TokenKind::Minus
                | TokenKind::Star
                | TokenKind::Slash
                | TokenKind::Percent
                | TokenKind::StarStar
                | TokenKind::EqEq
                | TokenKind::BangEq
                | TokenKind::Lt
                | TokenKind::Gt
                | TokenKind::Le
                | TokenKind::Ge
                | TokenKind::AmpAmp
                | TokenKind::PipePipe
                | TokenKind::Amp
                | TokenKind::Pipe
                | TokenKind::Caret
                | TokenKind::Shl
                | TokenKind::Shr
                | TokenKind::QuestionQuestion => self.parse_infix(left)?,
                TokenKind::Question => self.parse_ternary(left)?,
                TokenKind::PipeGt => self.parse_pipe(left)?,
                TokenKind::LParen => self.parse_call(left)?,
                TokenKind::LBracket => self.parse_index(left)?,
                TokenKind::Dot => self.parse_attr(left, false)?,
                TokenKind::QuestionDot => self.parse_attr(left, true)?,
                TokenKind::In => self.parse_in(left, false)?,
                TokenKind::Not => self.parse_not_in(left)?,
                _ => break,
            };
        }

        Some(left)
    }

    fn parse_prefix(&mut self) -> Option<Expr> {
        match self.cur.kind {
            TokenKind::Ident => self.parse_ident(),
            TokenKind::Int => self.parse_int(),
            TokenKind::Float => self.parse_float(),
            TokenKind::Str => self.parse_str(),
            TokenKind::Template => self.parse_template(),
            TokenKind::True | TokenKind::False => {
                let node = BoolLit {
                    pos: self.cur.start,
                    value: self.at(TokenKind::True),
                };
                self.advance();
                Some(Expr::Bool(node))
            }
            TokenKind::Nil => {
                let node = NilLit {
                    pos: self.cur.start,
                };
                self.advance();
                Some(Expr::Nil(node))
            }
            TokenKind::Minus | TokenKind::Bang | TokenKind::Not => self.parse_unary(),
            TokenKind::LParen => self.parse_grouped(),
            TokenKind::LBracket => self.parse_list(),
            TokenKind::LBrace => self.parse_map(),
            TokenKind::If => self.parse_if(),
            TokenKind::Switch => self.parse_switch(),
            TokenKind::Match => self.parse_match(),
            TokenKind::Function => self.parse_func(),
            TokenKind::Ellipsis => self.parse_spread(),
            TokenKind::Try => self.parse_try(),
            other => {
                self.error_here(format!("unexpected token {}", other));
                None
            }
        }
    }

    fn parse_ident(&mut self) -> Option<Expr> {
        let ident = Ident {
            pos: self.cur.start,
            name: self.cur.literal.clone(),
        };
        self.advance();

        // `x => expr` arrow shorthand
        if self.at(TokenKind::Arrow) {
            let start = ident.pos;
            let params = vec![FuncParam::Ident {
                name: ident,
                default: None,
            }];
            return self.parse_arrow_func(start, params, None);
        }

        Some(Expr::Ident(ident))
    }

    fn parse_int(&mut self) -> Option<Expr> {
        let literal = self.cur.literal.clone();
        let parsed = if let Some(hex) = literal.strip_prefix("0x").or(literal.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16)
        } else if let Some(bin) = literal.strip_prefix("0b").or(literal.strip_prefix("0B")) {
            i64::from_str_radix(bin, 2)
        } else if literal.len() > 1 && literal.starts_with('0') {
            i64::from_str_radix(&literal[1..], 8)
        } else {
            literal.parse()
        };
        let Ok(value) = parsed else {
            self.error_here(format!("invalid integer literal \"{}\"", literal));
            return None;
        };
        let node = IntLit {
            pos: self.cur.start,
            literal,
            value,
        };
        self.advance();
        Some(Expr::Int(node))
    }

    fn parse_float(&mut self) -> Option<Expr> {
        let literal = self.cur.literal.clone();
        let Ok(value) = literal.parse::<f64>() else {
            self.error_here(format!("invalid float literal \"{}\"", literal));
            return None;
        };
        let node = FloatLit {
            pos: self.cur.start,
            literal,
            value,
        };
        self.advance();
        Some(Expr::Float(node))
    }

    fn parse_str(&mut self) -> Option<Expr> {
        let node = StrLit {
            pos: self.cur.start,
            value: self.cur.literal.clone(),
        };
        self.advance();
        Some(Expr::Str(node))
    }

    fn parse_template(&mut self) -> Option<Expr> {
        let token = self.cur.clone();
        self.advance();

        let mut parts = Vec::new();
        let mut text = String::new();
        let mut chars = token.literal.chars().peekable();

        while let Some(ch) = chars.next() {
            if ch == '$' && chars.peek() == Some(&'{') {
                chars.next();
                let mut inner = String::new();
                let mut depth = 1usize;
                for ch in chars.by_ref() {
                    match ch {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    inner.push(ch);
                }
                if depth != 0 {
                    self.error_at("unterminated template interpolation", token.start, 1);
                    return None;
                }
                if !text.is_empty() {
                    parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                }
                let expr = self.parse_embedded(&inner, token.start)?;
                parts.push(TemplatePart::Interp(expr));
            } else {
                text.push(ch);
            }
        }
        if !text.is_empty() || parts.is_empty() {
            parts.push(TemplatePart::Text(text));
        }

        Some(Expr::Template(TemplateLit {
            pos: token.start,
            end: token.end,
            parts,
        }))
    }

    fn parse_embedded(&mut self, source: &str, at: Pos) -> Option<Expr> {
        let mut sub = Parser::new(source, &self.file);
        let expr = sub.parse_expression(Precedence::Lowest);
        let complete = sub.at(TokenKind::Eof) || sub.at(TokenKind::Newline);
        if expr.is_none() || !sub.errors.is_empty() || !complete {
            self.error_at(
                format!("invalid expression \"{}\" in template interpolation", source),
                at,
                1,
            );
            return None;
        }
        expr
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let op_pos = self.cur.start;
        let op = self.cur.literal.clone();
        let is_minus = self.at(TokenKind::Minus);
        self.advance_after_operator();

        // Unary minus binds below `**`, so -2**2 reads as -(2**2).
        let operand_precedence = if is_minus {
            Precedence::Product
        } else {
            Precedence::Unary
        };
        let operand = self.parse_expression(operand_precedence)?;

        Some(Expr::Prefix(Box::new(PrefixExpr {
            op_pos,
            op,
            operand,
        })))
    }

    fn parse_infix(&mut self, left: Expr) -> Option<Expr> {
        let op_pos = self.cur.start;
        let op = self.cur.literal.clone();
        let precedence = Precedence::of(self.cur.kind);
        // `**` is right-associative; parse its right side one level looser.
        let right_precedence = if self.at(TokenKind::StarStar) {
            Precedence::Product
        } else {
            precedence
        };
        self.advance_after_operator();

        let right = self.parse_expression(right_precedence)?;

        Some(Expr::Infix(Box::new(InfixExpr {
            left,
            op_pos,
            op,
            right,
        })))
    }

    fn parse_ternary(&mut self, condition: Expr) -> Option<Expr> {
        let question_pos = self.cur.start;
        self.advance_after_operator();

        let consequence = self.parse_expression(Precedence::Lowest)?;
        if !self.expect(TokenKind::Colon, "':'") {
            return None;
        }
        self.skip_newlines();
        let otherwise = self.parse_expression(Precedence::Lowest)?;

        Some(Expr::Ternary(Box::new(TernaryExpr {
            condition,
            question_pos,
            consequence,
            otherwise,
        })))
    }

    fn parse_pipe(&mut self, first: Expr) -> Option<Expr> {
        let mut stages = vec![first];
        while self.at(TokenKind::PipeGt) {
            self.advance_after_operator();
            let stage = self.parse_expression(Precedence::Pipe)?;
            stages.push(stage);
        }
        Some(Expr::Pipe(PipeExpr { stages }))
    }

    fn parse_in(&mut self, left: Expr, negated: bool) -> Option<Expr> {
        self.advance_after_operator();
        let right = self.parse_expression(Precedence::Membership)?;
        Some(Expr::In(Box::new(InExpr {
            left,
            right,
            negated,
        })))
    }

    fn parse_not_in(&mut self, left: Expr) -> Option<Expr> {
        self.advance();
        if !self.at(TokenKind::In) {
            self.error_here("expected 'in' after 'not'");
            return None;
        }
        self.parse_in(left, true)
    }

    fn parse_spread(&mut self) -> Option<Expr> {
        let ellipsis = self.cur.start;
        self.advance();

        if self.at(TokenKind::Comma)
            || self.at(TokenKind::RParen)
            || self.at(TokenKind::RBracket)
            || self.at(TokenKind::RBrace)
        {
            return Some(Expr::Spread(Box::new(SpreadExpr {
                ellipsis,
                value: None,
            })));
        }

        let value = self.parse_expression(Precedence::Lowest)?;
        Some(Expr::Spread(Box::new(SpreadExpr {
            ellipsis,
            value: Some(value),
        })))
    }

    // -------------------------------------------------------------------
    // Collections
    // -------------------------------------------------------------------

    fn parse_list(&mut self) -> Option<Expr> {
        let lbracket = self.cur.start;
        self.advance();
        self.skip_newlines();

        let mut items = Vec::new();
        while !self.at(TokenKind::RBracket) && !self.at(TokenKind::Eof) {
            items.push(self.parse_expression(Precedence::Lowest)?);
            self.skip_newlines();
            if !self.at(TokenKind::Comma) {
                break;
            }
            self.advance();
            self.skip_newlines();
        }

        self.skip_newlines();
        if !self.at(TokenKind::RBracket) {
            self.error_here("expected ']'");
            return None;
        }
        let rbracket = self.cur.start;
        self.advance();

        Some(Expr::List(ListLit {
            lbracket,
            items,
            rbracket,
        }))
    }

    fn parse_map(&mut self) -> Option<Expr> {
        let lbrace = self.cur.start;
        self.advance();
        self.skip_newlines();

        let mut items = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            if self.at(TokenKind::Ellipsis) {
                self.advance();
                let value = self.parse_expression(Precedence::Lowest)?;
                items.push(MapItem { key: None, value });
            } else {
                let key = self.parse_expression(Precedence::Lowest)?;

                if self.at(TokenKind::Comma)
                    || self.at(TokenKind::RBrace)
                    || self.at(TokenKind::Newline)
                {
                    // `{ a }` shorthand for `{ a: a }`
                    if matches!(key, Expr::Ident(_)) {
                        items.push(MapItem {
                            key: Some(key.clone()),
                            value: key,
                        });
                    } else {
                        self.error_here("expected ':'");
                        return None;
                    }
                } else {
                    if !self.expect(TokenKind::Colon, "':'") {
                        return None;
                    }
                    self.skip_newlines();
                    let value = self.parse_expression(Precedence::Lowest)?;
                    items.push(MapItem {
                        key: Some(key),
                        value,
                    });
                }
            }

            self.skip_newlines();
            if !self.at(TokenKind::Comma) {
                break;
            }
            self.advance();
            self.skip_newlines();
        }

        self.skip_newlines();
        if !self.at(TokenKind::RBrace) {
            self.error_here("expected '}'");
            return None;
        }
        let rbrace = self.cur.start;
        self.advance();

        Some(Expr::Map(MapLit {
            lbrace,
            items,
            rbrace,
        }))
    }

    // -------------------------------------------------------------------
    // Grouping and functions
    // -------------------------------------------------------------------

    fn parse_grouped(&mut self) -> Option<Expr> {
        // `( ... ) =>` starts an arrow function; anything else is grouping.
        // Speculatively parse a parameter list and rewind when it fails.
        let start = self.cur.start;
        let checkpoint = self.checkpoint();
        if let Some((params, rest)) = self.try_parse_arrow_params() {
            return self.parse_arrow_func(start, params, rest);
        }
        self.rewind(checkpoint);

        self.advance();
        self.skip_newlines();
        let inner = self.parse_expression(Precedence::Lowest)?;
        self.skip_newlines();
        if !self.at(TokenKind::RParen) {
            self.error_here("expected ')'");
            return None;
        }
        self.advance();
        Some(inner)
    }

    /// Attempt `( params ) =>`, leaving the cursor on the arrow. Returns
    /// `None` without reporting when the tokens are not a parameter list.
    fn try_parse_arrow_params(&mut self) -> Option<(Vec<FuncParam>, Option<Ident>)> {
        self.advance(); // '('
        self.skip_newlines();

        let mut params = Vec::new();
        let mut rest = None;

        while !self.at(TokenKind::RParen) {
            if self.at(TokenKind::Ellipsis) {
                self.advance();
                if !self.at(TokenKind::Ident) {
                    return None;
                }
                rest = Some(Ident {
                    pos: self.cur.start,
                    name: self.cur.literal.clone(),
                });
                self.advance();
                self.skip_newlines();
                break;
            } else if self.at(TokenKind::LBrace) {
                let lbrace = self.cur.start;
                let bindings = self.parse_map_pattern()?;
                if bindings.is_empty() {
                    return None;
                }
                params.push(FuncParam::MapPattern { lbrace, bindings });
            } else if self.at(TokenKind::LBracket) {
                let lbracket = self.cur.start;
                let elements = self.parse_list_pattern()?;
                if elements.is_empty() {
                    return None;
                }
                params.push(FuncParam::ListPattern { lbracket, elements });
            } else if self.at(TokenKind::Ident) {
                let name = Ident {
                    pos: self.cur.start,
                    name: self.cur.literal.clone(),
                };
                self.advance();
                let default = if self.at(TokenKind::Eq) {
                    self.advance();
                    self.skip_newlines();
                    Some(self.parse_expression(Precedence::Lowest)?)
                } else {
                    None
                };
                params.push(FuncParam::Ident { name, default });
            } else {
                return None;
            }

            self.skip_newlines();
            if !self.at(TokenKind::Comma) {
                break;
            }
            self.advance();
            self.skip_newlines();
        }

        if !self.at(TokenKind::RParen) {
            return None;
        }
        self.advance();

        if !self.at(TokenKind::Arrow) {
            return None;
        }
        Some((params, rest))
    }

    fn parse_arrow_func(
        &mut self,
        start: Pos,
        params: Vec<FuncParam>,
        rest_param: Option<Ident>,
    ) -> Option<Expr> {
        self.advance_after_operator(); // '=>'

        let body = if self.at(TokenKind::LBrace) {
            self.parse_block()?
        } else {
            // Expression body becomes an implicit return.
            let expr = self.parse_expression(Precedence::Lowest)?;
            let pos = expr.pos();
            let end = expr.end();
            Block {
                lbrace: pos,
                stmts: vec![Stmt::Return(ReturnStmt {
                    return_pos: pos,
                    value: Some(expr),
                })],
                rbrace: end,
            }
        };

        Some(Expr::Func(Rc::new(FuncLit {
            start,
            name: None,
            params,
            rest_param,
            body,
        })))
    }

    fn parse_func(&mut self) -> Option<Expr> {
        let start = self.cur.start;
        self.advance();

        let name = if self.at(TokenKind::Ident) {
            let ident = Ident {
                pos: self.cur.start,
                name: self.cur.literal.clone(),
            };
            self.advance();
            Some(ident)
        } else {
            None
        };

        if !self.expect(TokenKind::LParen, "'('") {
            return None;
        }
        self.skip_newlines();

        let mut params = Vec::new();
        let mut rest_param = None;

        while !self.at(TokenKind::RParen) && !self.at(TokenKind::Eof) {
            if self.at(TokenKind::Ellipsis) {
                self.advance();
                rest_param = Some(self.ident_here()?);
                self.skip_newlines();
                break; // rest parameter must be last
            }

            if self.at(TokenKind::LBrace) {
                let lbrace = self.cur.start;
                let bindings = self.parse_map_pattern()?;
                if bindings.is_empty() {
                    self.error_at("empty destructuring pattern", lbrace, 1);
                    return None;
                }
                params.push(FuncParam::MapPattern { lbrace, bindings });
            } else if self.at(TokenKind::LBracket) {
                let lbracket = self.cur.start;
                let elements = self.parse_list_pattern()?;
                if elements.is_empty() {
                    self.error_at("empty destructuring pattern", lbracket, 1);
                    return None;
                }
                params.push(FuncParam::ListPattern { lbracket, elements });
            } else if self.at(TokenKind::Ident) {
                let ident = Ident {
                    pos: self.cur.start,
                    name: self.cur.literal.clone(),
                };
                self.advance();
                let default = if self.at(TokenKind::Eq) {
                    self.advance();
                    self.skip_newlines();
                    Some(self.parse_expression(Precedence::Lowest)?)
                } else {
                    None
                };
                params.push(FuncParam::Ident {
                    name: ident,
                    default,
                });
            } else {
                self.error_here("expected parameter");
                return None;
            }

            if !self.at(TokenKind::Comma) {
                break;
            }
            self.advance();
            self.skip_newlines();
        }

        if !self.expect(TokenKind::RParen, "')'") {
            return None;
        }

        let body = self.parse_block()?;

        Some(Expr::Func(Rc::new(FuncLit {
            start,
            name,
            params,
            rest_param,
            body,
        })))
    }

    /// `{ key, key: alias, key = default, ... }`, shared by `let`
    /// destructuring and function parameters. Consumes through `}`.
    fn parse_map_pattern(&mut self) -> Option<Vec<MapBinding>> {
        self.advance(); // '{'
        self.skip_newlines();

        let mut bindings = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            if !self.at(TokenKind::Ident) {
                self.error_here("expected identifier");
                return None;
            }
            let key = self.cur.literal.clone();
            self.advance();

            let alias = if self.at(TokenKind::Colon) {
                self.advance();
                Some(self.ident_here()?.name)
            } else {
                None
            };

            let default = if self.at(TokenKind::Eq) {
                self.advance();
                self.skip_newlines();
                Some(self.parse_expression(Precedence::Lowest)?)
            } else {
                None
            };

            bindings.push(MapBinding {
                key,
                alias,
                default,
            });

            if !self.at(TokenKind::Comma) {
                break;
            }
            self.advance();
            self.skip_newlines();
        }

        if !self.at(TokenKind::RBrace) {
            self.error_here("expected '}'");
            return None;
        }
        self.advance();
        Some(bindings)
    }

    /// `[ name, name = default, ... ]`; consumes through `]`.
    fn parse_list_pattern(&mut self) -> Option<Vec<ListBinding>> {
        self.advance(); // '['
        self.skip_newlines();

        let mut elements = Vec::new();
        while !self.at(TokenKind::RBracket) && !self.at(TokenKind::Eof) {
            if !self.at(TokenKind::Ident) {
                self.error_here("expected identifier");
                return None;
            }
            let name = Ident {
                pos: self.cur.start,
                name: self.cur.literal.clone(),
            };
            self.advance();

            let default = if self.at(TokenKind::Eq) {
                self.advance();
                self.skip_newlines();
                Some(self.parse_expression(Precedence::Lowest)?)
            } else {
                None
            };

            elements.push(ListBinding { name, default });

            if !self.at(TokenKind::Comma) {
                break;
            }
            self.advance();
            self.skip_newlines();
        }

        if !self.at(TokenKind::RBracket) {
            self.error_here("expected ']'");
            return None;
        }
        self.advance();
        Some(elements)
    }

    // -------------------------------------------------------------------
    // Blocks and control flow
    // -------------------------------------------------------------------

    fn parse_block(&mut self) -> Option<Block> {
        if !self.at(TokenKind::LBrace) {
            self.error_here("expected '{'");
            return None;
        }
        let lbrace = self.cur.start;
        self.advance();
        self.skip_terminators();

        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            if self.errors.len() >= MAX_ERRORS {
                break;
            }
            match self.parse_statement() {
                Some(stmt) => stmts.push(stmt),
                None => self.synchronize(),
            }
            self.skip_terminators();
        }

        if !self.at(TokenKind::RBrace) {
            self.error_here("expected '}'");
            return None;
        }
        let rbrace = self.cur.start;
        self.advance();

        Some(Block {
            lbrace,
            stmts,
            rbrace,
        })
    }

    fn parse_if(&mut self) -> Option<Expr> {
        let if_pos = self.cur.start;
        self.advance();

        let parenthesized = self.at(TokenKind::LParen);
        if parenthesized {
            self.advance();
        }
        let condition = self.parse_expression(Precedence::Lowest)?;
        if parenthesized && !self.expect(TokenKind::RParen, "')'") {
            return None;
        }

        let consequence = self.parse_block()?;

        let alternative = if self.at(TokenKind::Else) {
            self.advance();
            if self.at(TokenKind::If) {
                let nested = self.parse_if()?;
                let pos = nested.pos();
                let end = nested.end();
                Some(Block {
                    lbrace: pos,
                    stmts: vec![Stmt::Expr(nested)],
                    rbrace: end,
                })
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };

        Some(Expr::If(Box::new(IfExpr {
            if_pos,
            condition,
            consequence,
            alternative,
        })))
    }

    fn parse_switch(&mut self) -> Option<Expr> {
        let switch_pos = self.cur.start;
        self.advance();

        if !self.expect(TokenKind::LParen, "'('") {
            return None;
        }
        let value = self.parse_expression(Precedence::Lowest)?;
        if !self.expect(TokenKind::RParen, "')'") {
            return None;
        }

        if !self.at(TokenKind::LBrace) {
            self.error_here("expected '{'");
            return None;
        }
        let lbrace = self.cur.start;
        self.advance();
        self.skip_terminators();

        let mut cases = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            cases.push(self.parse_case()?);
            self.skip_terminators();
        }

        if !self.at(TokenKind::RBrace) {
            self.error_here("expected '}'");
            return None;
        }
        let rbrace = self.cur.start;
        self.advance();

        Some(Expr::Switch(Box::new(SwitchExpr {
            switch_pos,
            value,
            lbrace,
            cases,
            rbrace,
        })))
    }

    fn parse_case(&mut self) -> Option<CaseClause> {
        let case_pos = self.cur.start;
        let is_default = self.at(TokenKind::Default);
        if !self.at(TokenKind::Case) && !is_default {
            self.error_here("expected 'case' or 'default'");
            return None;
        }
        self.advance();

        let values = if is_default {
            None
        } else {
            let mut values = vec![self.parse_expression(Precedence::Lowest)?];
            while self.at(TokenKind::Comma) {
                self.advance();
                values.push(self.parse_expression(Precedence::Lowest)?);
            }
            Some(values)
        };

        if !self.at(TokenKind::Colon) {
            self.error_here("expected ':'");
            return None;
        }
        let colon = self.cur.start;
        self.advance();
        self.skip_terminators();

        let mut stmts = Vec::new();
        while !self.at(TokenKind::Case)
            && !self.at(TokenKind::Default)
            && !self.at(TokenKind::RBrace)
            && !self.at(TokenKind::Eof)
        {
            if self.errors.len() >= MAX_ERRORS {
                break;
            }
            match self.parse_statement() {
                Some(stmt) => stmts.push(stmt),
                None => self.synchronize(),
            }
            self.skip_terminators();
        }

        Some(CaseClause {
            case_pos,
            values,
            body: Block {
                lbrace: colon,
                stmts,
                rbrace: self.cur.start,
            },
        })
    }

    fn parse_match(&mut self) -> Option<Expr> {
        let match_pos = self.cur.start;
        self.advance();

        let subject = self.parse_expression(Precedence::Lowest)?;

        if !self.at(TokenKind::LBrace) {
            self.error_here("expected '{'");
            return None;
        }
        let lbrace = self.cur.start;
        self.advance();
        self.skip_terminators();

        let mut arms = Vec::new();
        let mut default_arm = None;

        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            let arm = self.parse_match_arm()?;
            if matches!(arm.pattern, Pattern::Wildcard(_)) {
                default_arm = Some(arm);
            } else {
                arms.push(arm);
            }
            if self.at(TokenKind::Comma) {
                self.advance();
            }
            self.skip_terminators();
        }

        if !self.at(TokenKind::RBrace) {
            self.error_here("expected '}'");
            return None;
        }
        let rbrace = self.cur.start;
        self.advance();

        Some(Expr::Match(Box::new(MatchExpr {
            match_pos,
            subject,
            lbrace,
            arms,
            default_arm,
            rbrace,
        })))
    }

    fn parse_match_arm(&mut self) -> Option<MatchArm> {
        let pattern = if self.at(TokenKind::Ident) && self.cur.literal == "_" {
            let pos = self.cur.start;
            self.advance();
            Pattern::Wildcard(pos)
        } else {
            Pattern::Literal(self.parse_expression(Precedence::Lowest)?)
        };

        let guard = if self.at(TokenKind::If) {
            self.advance();
            Some(self.parse_expression(Precedence::Lowest)?)
        } else {
            None
        };

        if !self.at(TokenKind::Arrow) {
            self.error_here("expected '=>'");
            return None;
        }
        self.advance_after_operator();

        let result = self.parse_expression(Precedence::Lowest)?;
        Some(MatchArm {
            pattern,
            guard,
            result,
        })
    }

    fn parse_try(&mut self) -> Option<Expr> {
        let try_pos = self.cur.start;
        self.advance();

        let body = self.parse_block()?;

        let mut catch_ident = None;
        let mut catch_block = None;
        let mut finally_block = None;

        if self.at(TokenKind::Catch) {
            self.advance();
            if self.at(TokenKind::Ident) {
                catch_ident = Some(Ident {
                    pos: self.cur.start,
                    name: self.cur.literal.clone(),
                });
                self.advance();
            }
            catch_block = Some(self.parse_block()?);
        }

        if self.at(TokenKind::Finally) {
            self.advance();
            finally_block = Some(self.parse_block()?);
        }

        if catch_block.is_none() && finally_block.is_none() {
            self.error_at("try requires a catch or finally block", try_pos, 3);
            return None;
        }

        Some(Expr::Try(Box::new(TryExpr {
            try_pos,
            body,
            catch_ident,
            catch_block,
            finally_block,
        })))
    }

    // -------------------------------------------------------------------
    // Postfix forms
    // -------------------------------------------------------------------

    fn parse_call(&mut self, callee: Expr) -> Option<Expr> {
        let (lparen, args, rparen) = self.parse_call_args()?;
        Some(Expr::Call(Box::new(CallExpr {
            callee,
            lparen,
            args,
            rparen,
        })))
    }

    fn parse_call_args(&mut self) -> Option<(Pos, Vec<Expr>, Pos)> {
        let lparen = self.cur.start;
        self.advance();
        self.skip_newlines();

        let mut args = Vec::new();
        while !self.at(TokenKind::RParen) && !self.at(TokenKind::Eof) {
            args.push(self.parse_expression(Precedence::Lowest)?);
            self.skip_newlines();
            if !self.at(TokenKind::Comma) {
                break;
            }
            self.advance();
            self.skip_newlines();
        }

        if !self.at(TokenKind::RParen) {
            self.error_here("expected ')'");
            return None;
        }
        let rparen = self.cur.start;
        self.advance();
        Some((lparen, args, rparen))
    }

    fn parse_index(&mut self, object: Expr) -> Option<Expr> {
        let lbracket = self.cur.start;
        self.advance();
        self.skip_newlines();

        // `[:high]`
        if self.at(TokenKind::Colon) {
            self.advance();
            self.skip_newlines();
            let high = if !self.at(TokenKind::RBracket) {
                Some(self.parse_expression(Precedence::Lowest)?)
            } else {
                None
            };
            if !self.at(TokenKind::RBracket) {
                self.error_here("expected ']'");
                return None;
            }
            let rbracket = self.cur.start;
            self.advance();
            return Some(Expr::Slice(Box::new(SliceExpr {
                object,
                lbracket,
                low: None,
                high,
                rbracket,
            })));
        }

        let index = self.parse_expression(Precedence::Lowest)?;

        // `[low:high]`
        if self.at(TokenKind::Colon) {
            self.advance();
            self.skip_newlines();
            let high = if !self.at(TokenKind::RBracket) {
                Some(self.parse_expression(Precedence::Lowest)?)
            } else {
                None
            };
            if !self.at(TokenKind::RBracket) {
                self.error_here("expected ']'");
                return None;
            }
            let rbracket = self.cur.start;
            self.advance();
            return Some(Expr::Slice(Box::new(SliceExpr {
                object,
                lbracket,
                low: Some(index),
                high,
                rbracket,
            })));
        }

        if !self.at(TokenKind::RBracket) {
            self.error_here("expected ']'");
            return None;
        }
        let rbracket = self.cur.start;
        self.advance();

        Some(Expr::Index(Box::new(IndexExpr {
            object,
            lbracket,
            index,
            rbracket,
        })))
    }

    fn parse_attr(&mut self, object: Expr, optional: bool) -> Option<Expr> {
        let dot = self.cur.start;
        self.advance();

        let attr = self.ident_here()?;

        if self.at(TokenKind::LParen) {
            let (lparen, args, rparen) = self.parse_call_args()?;
            return Some(Expr::MethodCall(Box::new(MethodCallExpr {
                object,
                dot,
                method: attr,
                call: CallArgs {
                    lparen,
                    args,
                    rparen,
                },
                optional,
            })));
        }

        Some(Expr::GetAttr(Box::new(GetAttrExpr {
            object,
            dot,
            attr,
            optional,
        })))
    }
}

/// Parse source text into a program.
pub fn parse(source: &str) -> Result<Program, ParseErrors> {
    parse_with_file(source, "")
}

/// Parse source text, attributing spans to `file`.
pub fn parse_with_file(source: &str, file: &str) -> Result<Program, ParseErrors> {
    Parser::new(source, file).parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        match parse(source) {
            Ok(program) => program,
            Err(errors) => panic!("parse failed for {:?}: {}", source, errors),
        }
    }

    fn parse_expr(source: &str) -> Expr {
        let program = parse_ok(source);
        assert_eq!(program.stmts.len(), 1, "source: {}", source);
        match &program.stmts[0] {
            Stmt::Expr(expr) => expr.clone(),
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn test_literals() {
        assert!(matches!(parse_expr("42"), Expr::Int(IntLit { value: 42, .. })));
        assert!(matches!(parse_expr("0xFF"), Expr::Int(IntLit { value: 255, .. })));
        assert!(matches!(parse_expr("0b101"), Expr::Int(IntLit { value: 5, .. })));
        assert!(matches!(parse_expr("0755"), Expr::Int(IntLit { value: 493, .. })));
        assert!(matches!(parse_expr("true"), Expr::Bool(BoolLit { value: true, .. })));
        assert!(matches!(parse_expr("nil"), Expr::Nil(_)));
        assert!(matches!(parse_expr("3.5"), Expr::Float(_)));
        assert!(matches!(parse_expr("\"hi\""), Expr::Str(_)));
    }

    #[test]
    fn test_precedence_product_over_sum() {
        let expr = parse_expr("1 + 2 * 3");
        let Expr::Infix(infix) = expr else {
            panic!("expected infix")
        };
        assert_eq!(infix.op, "+");
        assert!(matches!(infix.right, Expr::Infix(_)));
    }

    #[test]
    fn test_power_right_associative() {
        let expr = parse_expr("2 ** 3 ** 4");
        let Expr::Infix(infix) = expr else {
            panic!("expected infix")
        };
        assert_eq!(infix.op, "**");
        assert!(matches!(infix.right, Expr::Infix(_)));
    }

    #[test]
    fn test_unary_minus_binds_below_power() {
        // -2**2 parses as -(2**2)
        let expr = parse_expr("-2**2");
        let Expr::Prefix(prefix) = expr else {
            panic!("expected prefix, got {:?}", expr)
        };
        assert_eq!(prefix.op, "-");
        assert!(matches!(prefix.operand, Expr::Infix(_)));
    }

    #[test]
    fn test_comparisons_do_not_chain() {
        // a < b < c is (a < b) < c
        let expr = parse_expr("a < b < c");
        let Expr::Infix(outer) = expr else {
            panic!("expected infix")
        };
        assert_eq!(outer.op, "<");
        assert!(matches!(outer.left, Expr::Infix(_)));
        assert!(matches!(outer.right, Expr::Ident(_)));
    }

    #[test]
    fn test_ternary() {
        let expr = parse_expr("a ? 1 : 2");
        assert!(matches!(expr, Expr::Ternary(_)));
    }

    #[test]
    fn test_ternary_nested_right() {
        let expr = parse_expr("a ? 1 : b ? 2 : 3");
        let Expr::Ternary(outer) = expr else {
            panic!("expected ternary")
        };
        assert!(matches!(outer.otherwise, Expr::Ternary(_)));
    }

    #[test]
    fn test_pipe_operator() {
        let expr = parse_expr("a |> f |> g");
        let Expr::Pipe(pipe) = expr else {
            panic!("expected pipe")
        };
        assert_eq!(pipe.stages.len(), 3);
    }

    #[test]
    fn test_bitwise_or_is_not_pipe() {
        let expr = parse_expr("a | b");
        let Expr::Infix(infix) = expr else {
            panic!("expected infix")
        };
        assert_eq!(infix.op, "|");
    }

    #[test]
    fn test_nullish_coalescing() {
        let expr = parse_expr("a ?? 1");
        let Expr::Infix(infix) = expr else {
            panic!("expected infix")
        };
        assert_eq!(infix.op, "??");
    }

    #[test]
    fn test_collections() {
        assert!(matches!(parse_expr("[1, 2, 3]"), Expr::List(l) if l.items.len() == 3));
        assert!(matches!(parse_expr("[]"), Expr::List(l) if l.items.is_empty()));
        assert!(matches!(parse_expr("{a: 1, b: 2}"), Expr::Map(m) if m.items.len() == 2));
        assert!(matches!(parse_expr("{}"), Expr::Map(m) if m.items.is_empty()));
    }

    #[test]
    fn test_map_shorthand() {
        let Expr::Map(map) = parse_expr("{a, b: 2}") else {
            panic!("expected map")
        };
        assert_eq!(map.items.len(), 2);
        assert!(matches!(&map.items[0].key, Some(Expr::Ident(i)) if i.name == "a"));
        assert!(matches!(&map.items[0].value, Expr::Ident(i) if i.name == "a"));
    }

    #[test]
    fn test_newlines_inside_brackets() {
        let Expr::List(list) = parse_expr("[\n  1,\n  2,\n  3,\n]") else {
            panic!("expected list")
        };
        assert_eq!(list.items.len(), 3);
    }

    #[test]
    fn test_operator_at_end_of_line_continues() {
        let program = parse_ok("1 +\n2");
        assert_eq!(program.stmts.len(), 1);
        assert!(matches!(&program.stmts[0], Stmt::Expr(Expr::Infix(_))));
    }

    #[test]
    fn test_leading_dot_joins_line() {
        let program = parse_ok("list\n.map(f)\n.filter(g)");
        assert_eq!(program.stmts.len(), 1);
        assert!(matches!(&program.stmts[0], Stmt::Expr(Expr::MethodCall(_))));
    }

    #[test]
    fn test_leading_pipe_joins_line() {
        let program = parse_ok("x\n|> f");
        assert_eq!(program.stmts.len(), 1);
        assert!(matches!(&program.stmts[0], Stmt::Expr(Expr::Pipe(_))));
    }

    #[test]
    fn test_newline_separates_statements() {
        let program = parse_ok("let a = 1\nlet b = 2");
        assert_eq!(program.stmts.len(), 2);
    }

    #[test]
    fn test_semicolon_separates_statements() {
        let program = parse_ok("let a = 1; a + 1");
        assert_eq!(program.stmts.len(), 2);
    }

    #[test]
    fn test_postfix_requires_same_line() {
        assert!(parse("x\n++").is_err());
        let program = parse_ok("let x = 1\nx++");
        assert!(matches!(&program.stmts[1], Stmt::Postfix(_)));
    }

    #[test]
    fn test_arrow_functions() {
        assert!(matches!(parse_expr("x => x * 2"), Expr::Func(_)));
        assert!(matches!(parse_expr("() => 42"), Expr::Func(_)));
        let Expr::Func(func) = parse_expr("(x, y) => x + y") else {
            panic!("expected func")
        };
        assert_eq!(func.params.len(), 2);
        assert!(matches!(parse_expr("(x) => { return x }"), Expr::Func(_)));
    }

    #[test]
    fn test_arrow_function_with_default() {
        let Expr::Func(func) = parse_expr("(x = 1) => x") else {
            panic!("expected func")
        };
        assert!(matches!(
            &func.params[0],
            FuncParam::Ident { default: Some(_), .. }
        ));
    }

    #[test]
    fn test_arrow_function_destructured_params() {
        let Expr::Func(func) = parse_expr("({a, b}) => a + b") else {
            panic!("expected func")
        };
        assert!(matches!(&func.params[0], FuncParam::MapPattern { .. }));

        let Expr::Func(func) = parse_expr("([a, b]) => a + b") else {
            panic!("expected func")
        };
        assert!(matches!(&func.params[0], FuncParam::ListPattern { .. }));
    }

    #[test]
    fn test_grouped_expression_still_works() {
        let expr = parse_expr("(1 + 2) * 3");
        let Expr::Infix(infix) = expr else {
            panic!("expected infix")
        };
        assert_eq!(infix.op, "*");
    }

    #[test]
    fn test_function_literal() {
        // Named function literals in statement position declare a binding.
        let Stmt::Func(func) = parse_ok("function add(a, b) { return a + b }").stmts[0].clone()
        else {
            panic!("expected func statement")
        };
        assert_eq!(func.name.as_ref().unwrap().name, "add");
        assert_eq!(func.params.len(), 2);
    }

    #[test]
    fn test_function_defaults_and_rest() {
        let Stmt::Func(func) = parse_ok("function f(a, b = 2, ...rest) { return a }").stmts[0]
            .clone()
        else {
            panic!("expected func statement")
        };
        assert_eq!(func.params.len(), 2);
        assert!(matches!(&func.params[1], FuncParam::Ident { default: Some(_), .. }));
        assert_eq!(func.rest_param.as_ref().unwrap().name, "rest");
    }

    #[test]
    fn test_named_function_statement() {
        let program = parse_ok("function f() { return 1 }");
        assert!(matches!(&program.stmts[0], Stmt::Func(_)));
    }

    #[test]
    fn test_calls_indexing_attrs() {
        assert!(matches!(parse_expr("f(1, 2)"), Expr::Call(_)));
        assert!(matches!(parse_expr("xs[0]"), Expr::Index(_)));
        assert!(matches!(parse_expr("xs[1:3]"), Expr::Slice(_)));
        assert!(matches!(parse_expr("xs[:2]"), Expr::Slice(_)));
        assert!(matches!(parse_expr("xs[1:]"), Expr::Slice(_)));
        assert!(matches!(parse_expr("obj.field"), Expr::GetAttr(_)));
        assert!(matches!(parse_expr("obj.method(1)"), Expr::MethodCall(_)));
    }

    #[test]
    fn test_optional_chaining() {
        let Expr::GetAttr(attr) = parse_expr("a?.b") else {
            panic!("expected get attr")
        };
        assert!(attr.optional);

        let Expr::MethodCall(call) = parse_expr("a?.m()") else {
            panic!("expected method call")
        };
        assert!(call.optional);
    }

    #[test]
    fn test_optional_chain_not_assignable() {
        assert!(parse("a?.b = 1").is_err());
    }

    #[test]
    fn test_assignment_forms() {
        assert!(matches!(&parse_ok("x = 1").stmts[0], Stmt::Assign(_)));
        assert!(matches!(&parse_ok("xs[0] = 1").stmts[0], Stmt::Assign(_)));
        assert!(matches!(&parse_ok("o.a = 1").stmts[0], Stmt::AssignAttr(_)));
        let Stmt::Assign(assign) = &parse_ok("x += 2").stmts[0] else {
            panic!("expected assign")
        };
        assert_eq!(assign.op, "+=");
    }

    #[test]
    fn test_destructuring_statements() {
        assert!(matches!(
            &parse_ok("let {a, b: c, d = 1} = obj").stmts[0],
            Stmt::DestructureMap(_)
        ));
        assert!(matches!(
            &parse_ok("let [a, b = 2] = xs").stmts[0],
            Stmt::DestructureList(_)
        ));
        assert!(matches!(
            &parse_ok("let x, y = xs").stmts[0],
            Stmt::LetUnpack(_)
        ));
    }

    #[test]
    fn test_empty_destructuring_pattern_is_error() {
        assert!(parse("let {} = obj").is_err());
        assert!(parse("let [] = xs").is_err());
    }

    #[test]
    fn test_membership() {
        let Expr::In(membership) = parse_expr("x in xs") else {
            panic!("expected in")
        };
        assert!(!membership.negated);

        let Expr::In(membership) = parse_expr("x not in xs") else {
            panic!("expected not in")
        };
        assert!(membership.negated);
    }

    #[test]
    fn test_spread() {
        let Expr::List(list) = parse_expr("[1, ...xs, 2]") else {
            panic!("expected list")
        };
        assert!(matches!(list.items[1], Expr::Spread(_)));

        let Expr::Map(map) = parse_expr("{a: 1, ...other}") else {
            panic!("expected map")
        };
        assert!(map.items[1].key.is_none());

        let Expr::Call(call) = parse_expr("f(...xs)") else {
            panic!("expected call")
        };
        assert!(matches!(call.args[0], Expr::Spread(_)));
    }

    #[test]
    fn test_if_else_chain() {
        let Expr::If(if_expr) = parse_expr("if a { 1 } else if b { 2 } else { 3 }") else {
            panic!("expected if")
        };
        assert!(if_expr.alternative.is_some());
    }

    #[test]
    fn test_switch() {
        let Expr::Switch(switch) = parse_expr("switch (x) { case 1: a\ncase 2, 3: b\ndefault: c }")
        else {
            panic!("expected switch")
        };
        assert_eq!(switch.cases.len(), 3);
        assert!(switch.cases[2].values.is_none());
    }

    #[test]
    fn test_match() {
        let Expr::Match(m) = parse_expr("match x { 1 => \"one\", 2 if y => \"two\", _ => \"other\" }")
        else {
            panic!("expected match")
        };
        assert_eq!(m.arms.len(), 2);
        assert!(m.default_arm.is_some());
        assert!(m.arms[1].guard.is_some());
    }

    #[test]
    fn test_try_forms() {
        assert!(matches!(parse_expr("try { a } catch { b }"), Expr::Try(_)));
        let Expr::Try(t) = parse_expr("try { a } catch e { b } finally { c }") else {
            panic!("expected try")
        };
        assert!(t.catch_ident.is_some());
        assert!(t.finally_block.is_some());
        assert!(matches!(parse_expr("try { a } finally { c }"), Expr::Try(_)));
    }

    #[test]
    fn test_try_requires_catch_or_finally() {
        assert!(parse("try { a }").is_err());
    }

    #[test]
    fn test_throw_requires_value() {
        assert!(parse("throw").is_err());
        assert!(matches!(&parse_ok("throw \"boom\"").stmts[0], Stmt::Throw(_)));
    }

    #[test]
    fn test_template_interpolation() {
        let Expr::Template(template) = parse_expr("`a ${x + 1} b`") else {
            panic!("expected template")
        };
        assert_eq!(template.parts.len(), 3);
        assert!(matches!(&template.parts[0], TemplatePart::Text(t) if t == "a "));
        assert!(matches!(&template.parts[1], TemplatePart::Interp(Expr::Infix(_))));
        assert!(matches!(&template.parts[2], TemplatePart::Text(t) if t == " b"));
    }

    #[test]
    fn test_template_plain_text() {
        let Expr::Template(template) = parse_expr("`plain`") else {
            panic!("expected template")
        };
        assert_eq!(template.parts.len(), 1);
    }

    #[test]
    fn test_multiple_errors_collected() {
        let err = parse("let = 1\nlet = 2\nlet x = 3").unwrap_err();
        assert!(err.errors.len() >= 2);
        assert_eq!(err.partial.stmts.len(), 1);
    }

    #[test]
    fn test_partial_ast_on_error() {
        let err = parse("let a = 1\nlet = oops\nlet b = 2").unwrap_err();
        assert!(err.partial.stmts.len() >= 2);
    }

    #[test]
    fn test_error_has_span() {
        let err = parse("let = 1").unwrap_err();
        let span = err.first().span.as_ref().unwrap();
        assert_eq!(span.line, 1);
        assert!(span.source_line.as_deref() == Some("let = 1"));
    }

    #[test]
    fn test_depth_guard() {
        let source = format!("{}1{}", "(".repeat(700), ")".repeat(700));
        assert!(parse(&source).is_err());
    }
}
