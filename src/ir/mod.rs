//! Typed IR for packet-processing pipelines: headers, parsers, controls,
//! tables and actions. The tree is persistent: nodes are `Rc`-shared, and
//! rewriting passes return new subtrees while unchanged subtrees stay shared
//! between the old and new roots.
//!
//! The IR arrives here already parsed and type-checked: expression types are
//! stored inline, declaration names are globally unique, and variable
//! declarations have been hoisted to the outer control scope.

use std::fmt;
use std::rc::Rc;

pub mod visit;

/// Shared pointer to an IR node.
pub type P<T> = Rc<T>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// Fixed-width bit field.
    Bits(u32),
    /// Variable-width bit field with a maximum width.
    Varbits(u32),
    Bool,
    /// A declared header type, by name.
    Header(String),
    /// A declared struct type, by name.
    Struct(String),
    /// Filled in by the upstream type checker; `Unknown` survives only where
    /// no pass consults the type.
    Unknown,
}

impl Type {
    pub fn bit_width(&self) -> Option<u32> {
        match self {
            Type::Bits(w) => Some(*w),
            _ => None,
        }
    }

    pub fn is_varbits(&self) -> bool {
        matches!(self, Type::Varbits(_))
    }

    pub fn header_name(&self) -> Option<&str> {
        match self {
            Type::Header(name) => Some(name),
            _ => None,
        }
    }
}

/// One field of a header layout. Field types are `Bits` or `Varbits`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub ty: Type,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A named ordered sequence of fields describing part of a packet layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderType {
    pub name: String,
    pub fields: Vec<HeaderField>,
}

impl HeaderType {
    pub fn new(name: impl Into<String>, fields: Vec<HeaderField>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructField {
    pub name: String,
    pub ty: Type,
}

/// A struct container, e.g. the `headers` struct holding one member per
/// extracted header, or the user metadata struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
    BitNot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprKind {
    /// Reference to a top-level name (a variable, table, state or instance).
    Path(String),
    /// `base.member` field or method selection.
    Member { base: P<Expression>, member: String },
    /// `method<type_args>(args)`. Extraction calls carry the extracted
    /// header type as a type argument.
    MethodCall {
        method: P<Expression>,
        type_args: Vec<Type>,
        args: Vec<P<Expression>>,
    },
    Binary {
        op: BinOp,
        left: P<Expression>,
        right: P<Expression>,
    },
    Unary { op: UnOp, expr: P<Expression> },
    Constant(i64),
    BoolLiteral(bool),
    /// The `default` keyset of a select case or switch label position.
    Default,
}

/// Expression node with its type stored inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    pub kind: ExprKind,
    pub ty: Type,
}

impl Expression {
    pub fn new(kind: ExprKind, ty: Type) -> P<Expression> {
        Rc::new(Expression { kind, ty })
    }

    pub fn path(name: impl Into<String>) -> P<Expression> {
        Self::new(ExprKind::Path(name.into()), Type::Unknown)
    }

    pub fn typed_path(name: impl Into<String>, ty: Type) -> P<Expression> {
        Self::new(ExprKind::Path(name.into()), ty)
    }

    pub fn member(base: P<Expression>, member: impl Into<String>, ty: Type) -> P<Expression> {
        Self::new(
            ExprKind::Member {
                base,
                member: member.into(),
            },
            ty,
        )
    }

    pub fn call(
        method: P<Expression>,
        type_args: Vec<Type>,
        args: Vec<P<Expression>>,
    ) -> P<Expression> {
        Self::new(
            ExprKind::MethodCall {
                method,
                type_args,
                args,
            },
            Type::Unknown,
        )
    }

    pub fn binary(op: BinOp, left: P<Expression>, right: P<Expression>) -> P<Expression> {
        Self::new(ExprKind::Binary { op, left, right }, Type::Unknown)
    }

    pub fn constant(value: i64) -> P<Expression> {
        Self::new(ExprKind::Constant(value), Type::Unknown)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Path(name) => write!(f, "{}", name),
            ExprKind::Member { base, member } => write!(f, "{}.{}", base, member),
            ExprKind::MethodCall { method, .. } => write!(f, "{}()", method),
            ExprKind::Binary { op, left, right } => write!(f, "({} {:?} {})", left, op, right),
            ExprKind::Unary { op, expr } => write!(f, "({:?} {})", op, expr),
            ExprKind::Constant(v) => write!(f, "{}", v),
            ExprKind::BoolLiteral(b) => write!(f, "{}", b),
            ExprKind::Default => write!(f, "default"),
        }
    }
}

/// The dotted name a dataflow fact is keyed by: a bare path yields its name,
/// a member chain rooted in a path yields the dotted string (`hdr.h.f`).
/// Computed expressions have no variable name.
pub fn variable_name(expr: &Expression) -> Option<String> {
    match &expr.kind {
        ExprKind::Path(name) => Some(name.clone()),
        ExprKind::Member { base, member } => {
            let prefix = variable_name(base)?;
            Some(format!("{}.{}", prefix, member))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchLabel {
    Name(String),
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchCase {
    pub label: SwitchLabel,
    /// Fall-through cases carry no body.
    pub body: Option<P<Statement>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Assignment {
        lhs: P<Expression>,
        rhs: P<Expression>,
    },
    If {
        condition: P<Expression>,
        then_branch: P<Statement>,
        else_branch: Option<P<Statement>>,
    },
    Switch {
        expression: P<Expression>,
        cases: Vec<SwitchCase>,
    },
    MethodCall(P<Expression>),
    Block(Vec<P<Statement>>),
    Empty,
}

impl Statement {
    pub fn assign(lhs: P<Expression>, rhs: P<Expression>) -> P<Statement> {
        Rc::new(Statement::Assignment { lhs, rhs })
    }

    pub fn call(expr: P<Expression>) -> P<Statement> {
        Rc::new(Statement::MethodCall(expr))
    }

    pub fn block(stmts: Vec<P<Statement>>) -> P<Statement> {
        Rc::new(Statement::Block(stmts))
    }
}

/// A select case: keyset expression and the target state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectCase {
    pub keyset: P<Expression>,
    /// Path expression naming the next state.
    pub next_state: P<Expression>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Unconditional transition to a named state.
    Direct(P<Expression>),
    Select {
        exprs: Vec<P<Expression>>,
        cases: Vec<SelectCase>,
    },
}

/// A parser state: component statements followed by a transition. The
/// terminal states `accept`/`reject` are referenced but never declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserState {
    pub name: String,
    pub components: Vec<P<Statement>>,
    pub transition: Option<Transition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserDecl {
    pub name: String,
    pub states: Vec<P<ParserState>>,
}

/// One key element of a table: the expression matched and its match kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyElement {
    pub expr: P<Expression>,
    pub match_kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDecl {
    pub name: String,
    pub keys: Vec<KeyElement>,
    /// Action list, by declared action name.
    pub actions: Vec<String>,
    pub default_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDecl {
    pub name: String,
    pub body: Vec<P<Statement>>,
}

/// A control pipeline: local actions and tables, then the apply body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDecl {
    pub name: String,
    pub actions: Vec<P<ActionDecl>>,
    pub tables: Vec<P<TableDecl>>,
    pub body: Vec<P<Statement>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decl {
    Header(P<HeaderType>),
    Struct(P<StructType>),
    Parser(P<ParserDecl>),
    Control(P<ControlDecl>),
}

impl Decl {
    pub fn name(&self) -> &str {
        match self {
            Decl::Header(h) => &h.name,
            Decl::Struct(s) => &s.name,
            Decl::Parser(p) => &p.name,
            Decl::Control(c) => &c.name,
        }
    }
}

/// Program root: declarations ordered as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub declarations: Vec<Decl>,
}

impl Program {
    pub fn new(declarations: Vec<Decl>) -> P<Program> {
        Rc::new(Program { declarations })
    }

    pub fn find_control(&self, name: &str) -> Option<&P<ControlDecl>> {
        self.declarations.iter().find_map(|d| match d {
            Decl::Control(c) if c.name == name => Some(c),
            _ => None,
        })
    }

    pub fn find_parser(&self) -> Option<&P<ParserDecl>> {
        self.declarations.iter().find_map(|d| match d {
            Decl::Parser(p) => Some(p),
            _ => None,
        })
    }
}
