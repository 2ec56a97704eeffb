//! AST node types.

use std::fmt;
use std::rc::Rc;

use vesper_lexer::Pos;

/// Expression nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(IntLit),
    Float(FloatLit),
    Bool(BoolLit),
    Nil(NilLit),
    Str(StrLit),
    Template(TemplateLit),
    Ident(Ident),
    Prefix(Box<PrefixExpr>),
    Infix(Box<InfixExpr>),
    Ternary(Box<TernaryExpr>),
    Spread(Box<SpreadExpr>),
    List(ListLit),
    Map(MapLit),
    Func(Rc<FuncLit>),
    Call(Box<CallExpr>),
    GetAttr(Box<GetAttrExpr>),
    MethodCall(Box<MethodCallExpr>),
    Index(Box<IndexExpr>),
    Slice(Box<SliceExpr>),
    If(Box<IfExpr>),
    Switch(Box<SwitchExpr>),
    Match(Box<MatchExpr>),
    In(Box<InExpr>),
    Pipe(PipeExpr),
    Try(Box<TryExpr>),
}

impl Expr {
    pub fn pos(&self) -> Pos {
        match self {
            Expr::Int(e) => e.pos,
            Expr::Float(e) => e.pos,
            Expr::Bool(e) => e.pos,
            Expr::Nil(e) => e.pos,
            Expr::Str(e) => e.pos,
            Expr::Template(e) => e.pos,
            Expr::Ident(e) => e.pos,
            Expr::Prefix(e) => e.op_pos,
            Expr::Infix(e) => e.left.pos(),
            Expr::Ternary(e) => e.condition.pos(),
            Expr::Spread(e) => e.ellipsis,
            Expr::List(e) => e.lbracket,
            Expr::Map(e) => e.lbrace,
            Expr::Func(e) => e.start,
            Expr::Call(e) => e.callee.pos(),
            Expr::GetAttr(e) => e.object.pos(),
            Expr::MethodCall(e) => e.object.pos(),
            Expr::Index(e) => e.object.pos(),
            Expr::Slice(e) => e.object.pos(),
            Expr::If(e) => e.if_pos,
            Expr::Switch(e) => e.switch_pos,
            Expr::Match(e) => e.match_pos,
            Expr::In(e) => e.left.pos(),
            Expr::Pipe(e) => e.stages.first().map(Expr::pos).unwrap_or_default(),
            Expr::Try(e) => e.try_pos,
        }
    }

    pub fn end(&self) -> Pos {
        match self {
            Expr::Int(e) => e.pos.advance(e.literal.chars().count()),
            Expr::Float(e) => e.pos.advance(e.literal.chars().count()),
            Expr::Bool(e) => e.pos.advance(if e.value { 4 } else { 5 }),
            Expr::Nil(e) => e.pos.advance(3),
            Expr::Str(e) => e.pos.advance(e.value.chars().count() + 2),
            Expr::Template(e) => e.end,
            Expr::Ident(e) => e.pos.advance(e.name.chars().count()),
            Expr::Prefix(e) => e.operand.end(),
            Expr::Infix(e) => e.right.end(),
            Expr::Ternary(e) => e.otherwise.end(),
            Expr::Spread(e) => e
                .value
                .as_ref()
                .map(Expr::end)
                .unwrap_or_else(|| e.ellipsis.advance(3)),
            Expr::List(e) => e.rbracket.advance(1),
            Expr::Map(e) => e.rbrace.advance(1),
            Expr::Func(e) => e.body.end(),
            Expr::Call(e) => e.rparen.advance(1),
            Expr::GetAttr(e) => e.attr.end(),
            Expr::MethodCall(e) => e.call.rparen.advance(1),
            Expr::Index(e) => e.rbracket.advance(1),
            Expr::Slice(e) => e.rbracket.advance(1),
            Expr::If(e) => e
                .alternative
                .as_ref()
                .map(Block::end)
                .unwrap_or_else(|| e.consequence.end()),
            Expr::Switch(e) => e.rbrace.advance(1),
            Expr::Match(e) => e.rbrace.advance(1),
            Expr::In(e) => e.right.end(),
            Expr::Pipe(e) => e.stages.last().map(Expr::end).unwrap_or_default(),
            Expr::Try(e) => e
                .finally_block
                .as_ref()
                .or(e.catch_block.as_ref())
                .map(Block::end)
                .unwrap_or_else(|| e.body.end()),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(e) => write!(f, "{}", e.literal),
            Expr::Float(e) => write!(f, "{}", e.literal),
            Expr::Bool(e) => write!(f, "{}", e.value),
            Expr::Nil(_) => write!(f, "nil"),
            Expr::Str(e) => write!(f, "\"{}\"", e.value),
            Expr::Template(e) => {
                write!(f, "`")?;
                for part in &e.parts {
                    match part {
                        TemplatePart::Text(text) => write!(f, "{}", text)?,
                        TemplatePart::Interp(expr) => write!(f, "${{{}}}", expr)?,
                    }
                }
                write!(f, "`")
            }
            Expr::Ident(e) => write!(f, "{}", e.name),
            Expr::Prefix(e) => write!(f, "({}{})", e.op, e.operand),
            Expr::Infix(e) => write!(f, "({} {} {})", e.left, e.op, e.right),
            Expr::Ternary(e) => {
                write!(f, "({} ? {} : {})", e.condition, e.consequence, e.otherwise)
            }
            Expr::Spread(e) => match &e.value {
                Some(value) => write!(f, "...{}", value),
                None => write!(f, "..."),
            },
            Expr::List(e) => {
                let items: Vec<String> = e.items.iter().map(Expr::to_string).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Expr::Map(e) => {
                let items: Vec<String> = e
                    .items
                    .iter()
                    .map(|item| match &item.key {
                        Some(key) => format!("{}: {}", key, item.value),
                        None => format!("...{}", item.value),
                    })
                    .collect();
                write!(f, "{{{}}}", items.join(", "))
            }
            Expr::Func(e) => {
                let params: Vec<String> = e.params.iter().map(FuncParam::to_string).collect();
                match &e.name {
                    Some(name) => write!(f, "function {}({}) {{ ... }}", name.name, params.join(", ")),
                    None => write!(f, "function({}) {{ ... }}", params.join(", ")),
                }
            }
            Expr::Call(e) => {
                let args: Vec<String> = e.args.iter().map(Expr::to_string).collect();
                write!(f, "{}({})", e.callee, args.join(", "))
            }
            Expr::GetAttr(e) => {
                write!(f, "{}{}{}", e.object, if e.optional { "?." } else { "." }, e.attr.name)
            }
            Expr::MethodCall(e) => {
                let args: Vec<String> = e.call.args.iter().map(Expr::to_string).collect();
                write!(
                    f,
                    "{}{}{}({})",
                    e.object,
                    if e.optional { "?." } else { "." },
                    e.method.name,
                    args.join(", ")
                )
            }
            Expr::Index(e) => write!(f, "{}[{}]", e.object, e.index),
            Expr::Slice(e) => {
                let low = e.low.as_ref().map(Expr::to_string).unwrap_or_default();
                let high = e.high.as_ref().map(Expr::to_string).unwrap_or_default();
                write!(f, "{}[{}:{}]", e.object, low, high)
            }
            Expr::If(e) => {
                write!(f, "if {} {{ ... }}", e.condition)?;
                if e.alternative.is_some() {
                    write!(f, " else {{ ... }}")?;
                }
                Ok(())
            }
            Expr::Switch(e) => write!(f, "switch ({}) {{ ... }}", e.value),
            Expr::Match(e) => write!(f, "match {} {{ ... }}", e.subject),
            Expr::In(e) => write!(
                f,
                "({} {} {})",
                e.left,
                if e.negated { "not in" } else { "in" },
                e.right
            ),
            Expr::Pipe(e) => {
                let stages: Vec<String> = e.stages.iter().map(Expr::to_string).collect();
                write!(f, "({})", stages.join(" |> "))
            }
            Expr::Try(e) => {
                write!(f, "try {{ ... }}")?;
                if e.catch_block.is_some() {
                    write!(f, " catch {{ ... }}")?;
                }
                if e.finally_block.is_some() {
                    write!(f, " finally {{ ... }}")?;
                }
                Ok(())
            }
        }
    }
}

/// Statement nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let(LetStmt),
    LetUnpack(LetUnpackStmt),
    DestructureMap(DestructureMapStmt),
    DestructureList(DestructureListStmt),
    Const(ConstStmt),
    Return(ReturnStmt),
    Assign(AssignStmt),
    AssignAttr(AssignAttrStmt),
    Postfix(PostfixStmt),
    Throw(ThrowStmt),
    Func(Rc<FuncLit>),
    Expr(Expr),
}

impl Stmt {
    pub fn pos(&self) -> Pos {
        match self {
            Stmt::Let(s) => s.let_pos,
            Stmt::LetUnpack(s) => s.let_pos,
            Stmt::DestructureMap(s) => s.let_pos,
            Stmt::DestructureList(s) => s.let_pos,
            Stmt::Const(s) => s.const_pos,
            Stmt::Return(s) => s.return_pos,
            Stmt::Assign(s) => match &s.target {
                AssignTarget::Ident(ident) => ident.pos,
                AssignTarget::Index(index) => index.object.pos(),
            },
            Stmt::AssignAttr(s) => s.object.pos(),
            Stmt::Postfix(s) => s.operand.pos(),
            Stmt::Throw(s) => s.throw_pos,
            Stmt::Func(s) => s.start,
            Stmt::Expr(e) => e.pos(),
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Let(s) => write!(f, "let {} = {}", s.name.name, s.value),
            Stmt::LetUnpack(s) => {
                let names: Vec<&str> = s.names.iter().map(|n| n.name.as_str()).collect();
                write!(f, "let {} = {}", names.join(", "), s.value)
            }
            Stmt::DestructureMap(s) => {
                let names: Vec<String> = s.bindings.iter().map(MapBinding::to_string).collect();
                write!(f, "let {{{}}} = {}", names.join(", "), s.value)
            }
            Stmt::DestructureList(s) => {
                let names: Vec<String> = s.elements.iter().map(ListBinding::to_string).collect();
                write!(f, "let [{}] = {}", names.join(", "), s.value)
            }
            Stmt::Const(s) => write!(f, "const {} = {}", s.name.name, s.value),
            Stmt::Return(s) => match &s.value {
                Some(value) => write!(f, "return {}", value),
                None => write!(f, "return"),
            },
            Stmt::Assign(s) => {
                let target = match &s.target {
                    AssignTarget::Ident(ident) => ident.name.clone(),
                    AssignTarget::Index(index) => format!("{}[{}]", index.object, index.index),
                };
                write!(f, "{} {} {}", target, s.op, s.value)
            }
            Stmt::AssignAttr(s) => {
                write!(f, "{}.{} {} {}", s.object, s.attr.name, s.op, s.value)
            }
            Stmt::Postfix(s) => write!(f, "{}{}", s.operand, s.op),
            Stmt::Throw(s) => write!(f, "throw {}", s.value),
            Stmt::Func(func) => write!(f, "{}", Expr::Func(func.clone())),
            Stmt::Expr(e) => write!(f, "{}", e),
        }
    }
}

// Literals

#[derive(Debug, Clone, PartialEq)]
pub struct IntLit {
    pub pos: Pos,
    pub literal: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatLit {
    pub pos: Pos,
    pub literal: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoolLit {
    pub pos: Pos,
    pub value: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NilLit {
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrLit {
    pub pos: Pos,
    pub value: String,
}

/// One piece of a backtick template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Interp(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateLit {
    pub pos: Pos,
    pub end: Pos,
    pub parts: Vec<TemplatePart>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub pos: Pos,
    pub name: String,
}

impl Ident {
    pub fn end(&self) -> Pos {
        self.pos.advance(self.name.chars().count())
    }
}

// Operators

#[derive(Debug, Clone, PartialEq)]
pub struct PrefixExpr {
    pub op_pos: Pos,
    pub op: String,
    pub operand: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfixExpr {
    pub left: Expr,
    pub op_pos: Pos,
    pub op: String,
    pub right: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TernaryExpr {
    pub condition: Expr,
    pub question_pos: Pos,
    pub consequence: Expr,
    pub otherwise: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpreadExpr {
    pub ellipsis: Pos,
    pub value: Option<Expr>,
}

// Collections

#[derive(Debug, Clone, PartialEq)]
pub struct ListLit {
    pub lbracket: Pos,
    pub items: Vec<Expr>,
    pub rbracket: Pos,
}

/// A map entry; `key` is `None` for spread entries.
#[derive(Debug, Clone, PartialEq)]
pub struct MapItem {
    pub key: Option<Expr>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapLit {
    pub lbrace: Pos,
    pub items: Vec<MapItem>,
    pub rbrace: Pos,
}

// Functions

/// One binding of a map destructuring pattern: `key`, `key: alias`, with
/// an optional default.
#[derive(Debug, Clone, PartialEq)]
pub struct MapBinding {
    pub key: String,
    pub alias: Option<String>,
    pub default: Option<Expr>,
}

impl MapBinding {
    pub fn target_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.key)
    }
}

impl fmt::Display for MapBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        if let Some(alias) = &self.alias {
            write!(f, ": {}", alias)?;
        }
        if let Some(default) = &self.default {
            write!(f, " = {}", default)?;
        }
        Ok(())
    }
}

/// One binding of a list destructuring pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct ListBinding {
    pub name: Ident,
    pub default: Option<Expr>,
}

impl fmt::Display for ListBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name.name)?;
        if let Some(default) = &self.default {
            write!(f, " = {}", default)?;
        }
        Ok(())
    }
}

/// A declared function parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum FuncParam {
    Ident { name: Ident, default: Option<Expr> },
    MapPattern { lbrace: Pos, bindings: Vec<MapBinding> },
    ListPattern { lbracket: Pos, elements: Vec<ListBinding> },
}

impl fmt::Display for FuncParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FuncParam::Ident { name, default } => {
                write!(f, "{}", name.name)?;
                if let Some(default) = default {
                    write!(f, " = {}", default)?;
                }
                Ok(())
            }
            FuncParam::MapPattern { bindings, .. } => {
                let parts: Vec<String> = bindings.iter().map(MapBinding::to_string).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            FuncParam::ListPattern { elements, .. } => {
                let parts: Vec<String> = elements.iter().map(ListBinding::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncLit {
    pub start: Pos,
    pub name: Option<Ident>,
    pub params: Vec<FuncParam>,
    pub rest_param: Option<Ident>,
    pub body: Block,
}

// Access

#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub callee: Expr,
    pub lparen: Pos,
    pub args: Vec<Expr>,
    pub rparen: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetAttrExpr {
    pub object: Expr,
    pub dot: Pos,
    pub attr: Ident,
    pub optional: bool,
}

/// An argument list applied to a named attribute of an object.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCallExpr {
    pub object: Expr,
    pub dot: Pos,
    pub method: Ident,
    pub call: CallArgs,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallArgs {
    pub lparen: Pos,
    pub args: Vec<Expr>,
    pub rparen: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexExpr {
    pub object: Expr,
    pub lbracket: Pos,
    pub index: Expr,
    pub rbracket: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SliceExpr {
    pub object: Expr,
    pub lbracket: Pos,
    pub low: Option<Expr>,
    pub high: Option<Expr>,
    pub rbracket: Pos,
}

// Control flow

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub lbrace: Pos,
    pub stmts: Vec<Stmt>,
    pub rbrace: Pos,
}

impl Block {
    pub fn end(&self) -> Pos {
        self.rbrace.advance(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfExpr {
    pub if_pos: Pos,
    pub condition: Expr,
    pub consequence: Block,
    pub alternative: Option<Block>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseClause {
    pub case_pos: Pos,
    /// `None` marks the default clause.
    pub values: Option<Vec<Expr>>,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchExpr {
    pub switch_pos: Pos,
    pub value: Expr,
    pub lbrace: Pos,
    pub cases: Vec<CaseClause>,
    pub rbrace: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Wildcard(Pos),
    Literal(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub result: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchExpr {
    pub match_pos: Pos,
    pub subject: Expr,
    pub lbrace: Pos,
    pub arms: Vec<MatchArm>,
    pub default_arm: Option<MatchArm>,
    pub rbrace: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InExpr {
    pub left: Expr,
    pub right: Expr,
    pub negated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipeExpr {
    pub stages: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TryExpr {
    pub try_pos: Pos,
    pub body: Block,
    pub catch_ident: Option<Ident>,
    pub catch_block: Option<Block>,
    pub finally_block: Option<Block>,
}

// Statements

#[derive(Debug, Clone, PartialEq)]
pub struct LetStmt {
    pub let_pos: Pos,
    pub name: Ident,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LetUnpackStmt {
    pub let_pos: Pos,
    pub names: Vec<Ident>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DestructureMapStmt {
    pub let_pos: Pos,
    pub bindings: Vec<MapBinding>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DestructureListStmt {
    pub let_pos: Pos,
    pub elements: Vec<ListBinding>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstStmt {
    pub const_pos: Pos,
    pub name: Ident,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStmt {
    pub return_pos: Pos,
    pub value: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Ident(Ident),
    Index(Box<IndexExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignStmt {
    pub target: AssignTarget,
    pub op: String,
    pub op_pos: Pos,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignAttrStmt {
    pub object: Expr,
    pub attr: Ident,
    pub op: String,
    pub op_pos: Pos,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostfixStmt {
    pub operand: Expr,
    pub op: String,
    pub op_pos: Pos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThrowStmt {
    pub throw_pos: Pos,
    pub value: Expr,
}

/// A parsed program.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}
