//! Shared IR construction helpers for the integration tests. Programs are
//! built the way the upstream frontend would hand them over: expression
//! types filled in, declaration names unique, transitions explicit.

#![allow(dead_code)]

use std::rc::Rc;

use p4midend::ir::{
    ActionDecl, ControlDecl, Decl, ExprKind, Expression, HeaderField, HeaderType, KeyElement, P,
    ParserDecl, ParserState, Program, SelectCase, Statement, StructField, StructType, SwitchCase,
    SwitchLabel, TableDecl, Transition, Type,
};

pub fn header(name: &str, fields: &[(&str, Type)]) -> Decl {
    Decl::Header(Rc::new(HeaderType::new(
        name,
        fields
            .iter()
            .map(|(n, ty)| HeaderField::new(*n, ty.clone()))
            .collect(),
    )))
}

/// The `headers` container: one field per header, named after its type.
pub fn headers_struct(members: &[&str]) -> Decl {
    Decl::Struct(Rc::new(StructType {
        name: "headers".to_string(),
        fields: members
            .iter()
            .map(|m| StructField {
                name: m.to_string(),
                ty: Type::Header(m.to_string()),
            })
            .collect(),
    }))
}

pub fn num(value: i64) -> P<Expression> {
    Expression::constant(value)
}

pub fn hdr_path() -> P<Expression> {
    Expression::typed_path("hdr", Type::Struct("headers".to_string()))
}

pub fn meta_path() -> P<Expression> {
    Expression::typed_path("meta", Type::Struct("metadata".to_string()))
}

/// `hdr.<header>.<field>`, typed as a header member access.
pub fn hdr_field(header: &str, field: &str, width: u32) -> P<Expression> {
    let base = Expression::member(hdr_path(), header, Type::Header(header.to_string()));
    Expression::member(base, field, Type::Bits(width))
}

/// `meta.<field>`.
pub fn meta_field(field: &str) -> P<Expression> {
    Expression::member(meta_path(), field, Type::Bits(8))
}

/// `packet.extract<H>(hdr.H)`.
pub fn extract(header: &str) -> P<Statement> {
    let method = Expression::member(Expression::path("packet"), "extract", Type::Unknown);
    let arg = Expression::member(hdr_path(), header, Type::Header(header.to_string()));
    Statement::call(Expression::call(
        method,
        vec![Type::Header(header.to_string())],
        vec![arg],
    ))
}

pub fn state(
    name: &str,
    components: Vec<P<Statement>>,
    transition: Option<Transition>,
) -> P<ParserState> {
    Rc::new(ParserState {
        name: name.to_string(),
        components,
        transition,
    })
}

pub fn goto(target: &str) -> Option<Transition> {
    Some(Transition::Direct(Expression::path(target)))
}

pub fn select(on: P<Expression>, cases: &[(i64, &str)]) -> Option<Transition> {
    Some(Transition::Select {
        exprs: vec![on],
        cases: cases
            .iter()
            .map(|(value, target)| SelectCase {
                keyset: Expression::constant(*value),
                next_state: Expression::path(*target),
            })
            .collect(),
    })
}

pub fn parser(name: &str, states: Vec<P<ParserState>>) -> Decl {
    Decl::Parser(Rc::new(ParserDecl {
        name: name.to_string(),
        states,
    }))
}

pub fn action(name: &str, body: Vec<P<Statement>>) -> P<ActionDecl> {
    Rc::new(ActionDecl {
        name: name.to_string(),
        body,
    })
}

pub fn table(name: &str, keys: Vec<P<Expression>>, actions: &[&str]) -> P<TableDecl> {
    Rc::new(TableDecl {
        name: name.to_string(),
        keys: keys
            .into_iter()
            .map(|expr| KeyElement {
                expr,
                match_kind: "exact".to_string(),
            })
            .collect(),
        actions: actions.iter().map(|a| a.to_string()).collect(),
        default_action: None,
    })
}

/// `<table>.apply();`
pub fn apply(table: &str) -> P<Statement> {
    let method = Expression::member(Expression::path(table), "apply", Type::Unknown);
    Statement::call(Expression::call(method, Vec::new(), Vec::new()))
}

/// `<table>.apply().action_run`, the guard of an action-run switch.
pub fn apply_action_run(table: &str) -> P<Expression> {
    let method = Expression::member(Expression::path(table), "apply", Type::Unknown);
    let call = Expression::call(method, Vec::new(), Vec::new());
    Expression::member(call, "action_run", Type::Unknown)
}

pub fn if_stmt(condition: P<Expression>, then_branch: P<Statement>) -> P<Statement> {
    Rc::new(Statement::If {
        condition,
        then_branch,
        else_branch: None,
    })
}

pub fn if_else(
    condition: P<Expression>,
    then_branch: P<Statement>,
    else_branch: P<Statement>,
) -> P<Statement> {
    Rc::new(Statement::If {
        condition,
        then_branch,
        else_branch: Some(else_branch),
    })
}

pub fn switch_stmt(expression: P<Expression>, cases: Vec<(SwitchLabel, Option<P<Statement>>)>) -> P<Statement> {
    Rc::new(Statement::Switch {
        expression,
        cases: cases
            .into_iter()
            .map(|(label, body)| SwitchCase { label, body })
            .collect(),
    })
}

pub fn control(
    name: &str,
    actions: Vec<P<ActionDecl>>,
    tables: Vec<P<TableDecl>>,
    body: Vec<P<Statement>>,
) -> Decl {
    Decl::Control(Rc::new(ControlDecl {
        name: name.to_string(),
        actions,
        tables,
        body,
    }))
}

pub fn eq_const(lhs: P<Expression>, value: i64) -> P<Expression> {
    Expression::binary(p4midend::ir::BinOp::Eq, lhs, Expression::constant(value))
}

/// Find a header declaration by name.
pub fn find_header(prog: &Program, name: &str) -> Option<P<HeaderType>> {
    prog.declarations.iter().find_map(|d| match d {
        Decl::Header(h) if h.name == name => Some(Rc::clone(h)),
        _ => None,
    })
}

/// Find a parser state by name.
pub fn find_state(prog: &Program, name: &str) -> Option<P<ParserState>> {
    prog.find_parser().and_then(|p| {
        p.states
            .iter()
            .find(|s| s.name == name)
            .map(Rc::clone)
    })
}

/// The positional index of a declaration, by name.
pub fn decl_position(prog: &Program, name: &str) -> Option<usize> {
    prog.declarations.iter().position(|d| d.name() == name)
}

/// True when a statement is `packet.extract(hdr.<member>)` (no type args).
pub fn is_extract_of(stmt: &Statement, member: &str) -> bool {
    let call = match stmt {
        Statement::MethodCall(call) => call,
        _ => return false,
    };
    let (method, args) = match &call.kind {
        ExprKind::MethodCall { method, args, .. } => (method, args),
        _ => return false,
    };
    let is_extract = matches!(
        &method.kind,
        ExprKind::Member { member, .. } if member == "extract"
    );
    if !is_extract || args.len() != 1 {
        return false;
    }
    matches!(&args[0].kind, ExprKind::Member { member: m, .. } if m == member)
}
