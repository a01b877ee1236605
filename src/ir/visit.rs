//! Visitor infrastructure over the IR: a read-only `Inspector` with pre/post
//! hooks and an ancestor/context stack, and a rewriting `Transform` whose
//! walkers rebuild a node only when something underneath actually changed,
//! sharing every untouched subtree with the original root.

use std::rc::Rc;

use crate::ir::{
    ActionDecl, ControlDecl, Decl, ExprKind, Expression, HeaderType, KeyElement, P, ParserDecl,
    ParserState, Program, SelectCase, Statement, StructType, SwitchCase, TableDecl, Transition,
};
use crate::midend::errors::MidendError;

/// One ancestor entry. The walker pushes a frame before descending into the
/// corresponding child position and pops it afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Program,
    Parser(String),
    ParserState(String),
    Control(String),
    Table(String),
    Action(String),
    /// The expression child of a table key element.
    KeyElement,
    /// The callee position of a method call.
    MethodCallMethod,
    /// An argument of a method call. Treated as both read and written:
    /// without parameter directions an argument may be an out-parameter.
    MethodCallArg,
    /// The base expression of a member selection.
    Member,
    AssignmentLhs,
    AssignmentRhs,
    IfCondition,
    SwitchExpression,
    SwitchCase,
    SelectExpression,
    SelectCaseKeyset,
    /// A path expression naming the next parser state, either a direct
    /// transition target or the target of a select case.
    TransitionTarget,
}

#[derive(Debug, Clone)]
struct FrameEntry {
    frame: Frame,
    write: bool,
    read: bool,
}

/// Ancestor stack with write/read context, queried by pass hooks.
#[derive(Debug, Default)]
pub struct Ctx {
    frames: Vec<FrameEntry>,
}

impl Ctx {
    fn new() -> Self {
        Ctx { frames: Vec::new() }
    }

    fn push(&mut self, frame: Frame) {
        let (write, read) = match frame {
            Frame::AssignmentLhs => (true, false),
            Frame::AssignmentRhs => (false, true),
            Frame::MethodCallArg => (true, true),
            Frame::KeyElement
            | Frame::IfCondition
            | Frame::SwitchExpression
            | Frame::SelectExpression
            | Frame::SelectCaseKeyset
            | Frame::TransitionTarget => (false, true),
            // Structural frames and member bases inherit the current flags.
            _ => (self.is_write(), self.is_read()),
        };
        self.frames.push(FrameEntry { frame, write, read });
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    pub fn is_write(&self) -> bool {
        self.frames.last().map_or(false, |f| f.write)
    }

    pub fn is_read(&self) -> bool {
        self.frames.last().map_or(true, |f| f.read)
    }

    pub fn in_member(&self) -> bool {
        self.frames.iter().any(|f| f.frame == Frame::Member)
    }

    pub fn in_key_element(&self) -> bool {
        self.frames.iter().any(|f| f.frame == Frame::KeyElement)
    }

    pub fn in_method_call_arg(&self) -> bool {
        self.frames.iter().any(|f| f.frame == Frame::MethodCallArg)
    }

    pub fn in_transition_target(&self) -> bool {
        self.frames
            .iter()
            .any(|f| f.frame == Frame::TransitionTarget)
    }

    pub fn enclosing_table(&self) -> Option<&str> {
        self.frames.iter().rev().find_map(|f| match &f.frame {
            Frame::Table(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn enclosing_parser(&self) -> Option<&str> {
        self.frames.iter().rev().find_map(|f| match &f.frame {
            Frame::Parser(name) => Some(name.as_str()),
            _ => None,
        })
    }

}

/// Read-only traversal. Pre-hooks return whether to descend; any hook may
/// abort the whole traversal with an error, which is how invariant checks
/// surface. Default implementations visit everything.
#[allow(unused_variables)]
pub trait Inspector {
    fn pre_program(&mut self, prog: &Program, cx: &Ctx) -> Result<bool, MidendError> {
        Ok(true)
    }
    fn post_program(&mut self, prog: &Program, cx: &Ctx) -> Result<(), MidendError> {
        Ok(())
    }
    fn pre_header_type(&mut self, hdr: &P<HeaderType>, cx: &Ctx) -> Result<(), MidendError> {
        Ok(())
    }
    fn pre_struct_type(&mut self, st: &P<StructType>, cx: &Ctx) -> Result<(), MidendError> {
        Ok(())
    }
    fn pre_parser(&mut self, parser: &P<ParserDecl>, cx: &Ctx) -> Result<bool, MidendError> {
        Ok(true)
    }
    fn post_parser(&mut self, parser: &P<ParserDecl>, cx: &Ctx) -> Result<(), MidendError> {
        Ok(())
    }
    fn pre_parser_state(&mut self, state: &P<ParserState>, cx: &Ctx) -> Result<bool, MidendError> {
        Ok(true)
    }
    fn post_parser_state(&mut self, state: &P<ParserState>, cx: &Ctx) -> Result<(), MidendError> {
        Ok(())
    }
    fn pre_control(&mut self, ctrl: &P<ControlDecl>, cx: &Ctx) -> Result<bool, MidendError> {
        Ok(true)
    }
    fn post_control(&mut self, ctrl: &P<ControlDecl>, cx: &Ctx) -> Result<(), MidendError> {
        Ok(())
    }
    fn pre_table(&mut self, table: &P<TableDecl>, cx: &Ctx) -> Result<bool, MidendError> {
        Ok(true)
    }
    fn post_table(&mut self, table: &P<TableDecl>, cx: &Ctx) -> Result<(), MidendError> {
        Ok(())
    }
    fn pre_action(&mut self, action: &P<ActionDecl>, cx: &Ctx) -> Result<bool, MidendError> {
        Ok(true)
    }
    fn post_action(&mut self, action: &P<ActionDecl>, cx: &Ctx) -> Result<(), MidendError> {
        Ok(())
    }
    fn pre_statement(&mut self, stmt: &P<Statement>, cx: &Ctx) -> Result<bool, MidendError> {
        Ok(true)
    }
    fn post_statement(&mut self, stmt: &P<Statement>, cx: &Ctx) -> Result<(), MidendError> {
        Ok(())
    }
    fn pre_expression(&mut self, expr: &P<Expression>, cx: &Ctx) -> Result<bool, MidendError> {
        Ok(true)
    }
    fn post_expression(&mut self, expr: &P<Expression>, cx: &Ctx) -> Result<(), MidendError> {
        Ok(())
    }
}

pub fn walk_program<V: Inspector>(v: &mut V, prog: &Program) -> Result<(), MidendError> {
    let mut cx = Ctx::new();
    if v.pre_program(prog, &cx)? {
        cx.push(Frame::Program);
        for decl in &prog.declarations {
            match decl {
                Decl::Header(h) => v.pre_header_type(h, &cx)?,
                Decl::Struct(s) => v.pre_struct_type(s, &cx)?,
                Decl::Parser(p) => walk_parser(v, p, &mut cx)?,
                Decl::Control(c) => walk_control(v, c, &mut cx)?,
            }
        }
        cx.pop();
    }
    v.post_program(prog, &cx)
}

fn walk_parser<V: Inspector>(
    v: &mut V,
    parser: &P<ParserDecl>,
    cx: &mut Ctx,
) -> Result<(), MidendError> {
    if v.pre_parser(parser, cx)? {
        cx.push(Frame::Parser(parser.name.clone()));
        for state in &parser.states {
            walk_parser_state(v, state, cx)?;
        }
        cx.pop();
    }
    v.post_parser(parser, cx)
}

fn walk_parser_state<V: Inspector>(
    v: &mut V,
    state: &P<ParserState>,
    cx: &mut Ctx,
) -> Result<(), MidendError> {
    if v.pre_parser_state(state, cx)? {
        cx.push(Frame::ParserState(state.name.clone()));
        for stmt in &state.components {
            walk_statement(v, stmt, cx)?;
        }
        match &state.transition {
            Some(Transition::Direct(target)) => {
                cx.push(Frame::TransitionTarget);
                walk_expression(v, target, cx)?;
                cx.pop();
            }
            Some(Transition::Select { exprs, cases }) => {
                cx.push(Frame::SelectExpression);
                for e in exprs {
                    walk_expression(v, e, cx)?;
                }
                cx.pop();
                for case in cases {
                    cx.push(Frame::SelectCaseKeyset);
                    walk_expression(v, &case.keyset, cx)?;
                    cx.pop();
                    cx.push(Frame::TransitionTarget);
                    walk_expression(v, &case.next_state, cx)?;
                    cx.pop();
                }
            }
            None => {}
        }
        cx.pop();
    }
    v.post_parser_state(state, cx)
}

fn walk_control<V: Inspector>(
    v: &mut V,
    ctrl: &P<ControlDecl>,
    cx: &mut Ctx,
) -> Result<(), MidendError> {
    if v.pre_control(ctrl, cx)? {
        cx.push(Frame::Control(ctrl.name.clone()));
        for action in &ctrl.actions {
            walk_action(v, action, cx)?;
        }
        for table in &ctrl.tables {
            walk_table(v, table, cx)?;
        }
        for stmt in &ctrl.body {
            walk_statement(v, stmt, cx)?;
        }
        cx.pop();
    }
    v.post_control(ctrl, cx)
}

fn walk_action<V: Inspector>(
    v: &mut V,
    action: &P<ActionDecl>,
    cx: &mut Ctx,
) -> Result<(), MidendError> {
    if v.pre_action(action, cx)? {
        cx.push(Frame::Action(action.name.clone()));
        for stmt in &action.body {
            walk_statement(v, stmt, cx)?;
        }
        cx.pop();
    }
    v.post_action(action, cx)
}

fn walk_table<V: Inspector>(
    v: &mut V,
    table: &P<TableDecl>,
    cx: &mut Ctx,
) -> Result<(), MidendError> {
    if v.pre_table(table, cx)? {
        cx.push(Frame::Table(table.name.clone()));
        for key in &table.keys {
            cx.push(Frame::KeyElement);
            walk_expression(v, &key.expr, cx)?;
            cx.pop();
        }
        cx.pop();
    }
    v.post_table(table, cx)
}

pub fn walk_statement<V: Inspector>(
    v: &mut V,
    stmt: &P<Statement>,
    cx: &mut Ctx,
) -> Result<(), MidendError> {
    if v.pre_statement(stmt, cx)? {
        match &**stmt {
            // Source subtree before destination subtree, so field references
            // under the destination are recognized as writes.
            Statement::Assignment { lhs, rhs } => {
                cx.push(Frame::AssignmentRhs);
                walk_expression(v, rhs, cx)?;
                cx.pop();
                cx.push(Frame::AssignmentLhs);
                walk_expression(v, lhs, cx)?;
                cx.pop();
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => {
                cx.push(Frame::IfCondition);
                walk_expression(v, condition, cx)?;
                cx.pop();
                walk_statement(v, then_branch, cx)?;
                if let Some(e) = else_branch {
                    walk_statement(v, e, cx)?;
                }
            }
            Statement::Switch { expression, cases } => {
                cx.push(Frame::SwitchExpression);
                walk_expression(v, expression, cx)?;
                cx.pop();
                for case in cases {
                    if let Some(body) = &case.body {
                        cx.push(Frame::SwitchCase);
                        walk_statement(v, body, cx)?;
                        cx.pop();
                    }
                }
            }
            Statement::MethodCall(call) => walk_expression(v, call, cx)?,
            Statement::Block(stmts) => {
                for s in stmts {
                    walk_statement(v, s, cx)?;
                }
            }
            Statement::Empty => {}
        }
    }
    v.post_statement(stmt, cx)
}

pub fn walk_expression<V: Inspector>(
    v: &mut V,
    expr: &P<Expression>,
    cx: &mut Ctx,
) -> Result<(), MidendError> {
    if v.pre_expression(expr, cx)? {
        match &expr.kind {
            ExprKind::Member { base, .. } => {
                cx.push(Frame::Member);
                walk_expression(v, base, cx)?;
                cx.pop();
            }
            ExprKind::MethodCall { method, args, .. } => {
                cx.push(Frame::MethodCallMethod);
                walk_expression(v, method, cx)?;
                cx.pop();
                for arg in args {
                    cx.push(Frame::MethodCallArg);
                    walk_expression(v, arg, cx)?;
                    cx.pop();
                }
            }
            ExprKind::Binary { left, right, .. } => {
                walk_expression(v, left, cx)?;
                walk_expression(v, right, cx)?;
            }
            ExprKind::Unary { expr: inner, .. } => walk_expression(v, inner, cx)?,
            ExprKind::Path(_)
            | ExprKind::Constant(_)
            | ExprKind::BoolLiteral(_)
            | ExprKind::Default => {}
        }
    }
    v.post_expression(expr, cx)
}

/// Rewriting traversal. Hooks return `Some(replacement)` to substitute a
/// node; `None` keeps it. The walkers rebuild a parent only when a child was
/// replaced, so an untouched program comes back as the same shared root.
#[allow(unused_variables)]
pub trait Transform {
    fn program(&mut self, prog: &Program) -> Option<Program> {
        None
    }
    fn header_type(&mut self, hdr: &P<HeaderType>) -> Option<P<HeaderType>> {
        None
    }
    fn struct_type(&mut self, st: &P<StructType>) -> Option<P<StructType>> {
        None
    }
    /// Fires before the expression's children are rewritten; the replacement
    /// is itself walked, so a hook must not reproduce its own trigger.
    fn pre_expression(&mut self, expr: &P<Expression>) -> Option<P<Expression>> {
        None
    }
    fn post_statement(&mut self, stmt: &P<Statement>) -> Option<P<Statement>> {
        None
    }
    fn post_parser_state(&mut self, state: &P<ParserState>) -> Option<P<ParserState>> {
        None
    }
}

pub fn transform_program<T: Transform>(t: &mut T, prog: &P<Program>) -> P<Program> {
    let seeded = t.program(prog);
    let base: &Program = seeded.as_ref().unwrap_or(&**prog);
    let mut changed = seeded.is_some();
    let mut declarations = Vec::with_capacity(base.declarations.len());
    for decl in &base.declarations {
        let new_decl = match decl {
            Decl::Header(h) => {
                let nh = t.header_type(h).unwrap_or_else(|| Rc::clone(h));
                if !Rc::ptr_eq(&nh, h) {
                    changed = true;
                }
                Decl::Header(nh)
            }
            Decl::Struct(s) => {
                let ns = t.struct_type(s).unwrap_or_else(|| Rc::clone(s));
                if !Rc::ptr_eq(&ns, s) {
                    changed = true;
                }
                Decl::Struct(ns)
            }
            Decl::Parser(p) => {
                let np = transform_parser(t, p);
                if !Rc::ptr_eq(&np, p) {
                    changed = true;
                }
                Decl::Parser(np)
            }
            Decl::Control(c) => {
                let nc = transform_control(t, c);
                if !Rc::ptr_eq(&nc, c) {
                    changed = true;
                }
                Decl::Control(nc)
            }
        };
        declarations.push(new_decl);
    }
    if changed {
        Program::new(declarations)
    } else {
        Rc::clone(prog)
    }
}

fn transform_parser<T: Transform>(t: &mut T, parser: &P<ParserDecl>) -> P<ParserDecl> {
    let mut changed = false;
    let mut states = Vec::with_capacity(parser.states.len());
    for state in &parser.states {
        let ns = transform_parser_state(t, state);
        if !Rc::ptr_eq(&ns, state) {
            changed = true;
        }
        states.push(ns);
    }
    if changed {
        Rc::new(ParserDecl {
            name: parser.name.clone(),
            states,
        })
    } else {
        Rc::clone(parser)
    }
}

fn transform_parser_state<T: Transform>(t: &mut T, state: &P<ParserState>) -> P<ParserState> {
    let mut changed = false;
    let mut components = Vec::with_capacity(state.components.len());
    for stmt in &state.components {
        let ns = transform_statement(t, stmt);
        if !Rc::ptr_eq(&ns, stmt) {
            changed = true;
        }
        components.push(ns);
    }
    let transition = match &state.transition {
        Some(Transition::Direct(target)) => {
            let nt = transform_expression(t, target);
            if !Rc::ptr_eq(&nt, target) {
                changed = true;
            }
            Some(Transition::Direct(nt))
        }
        Some(Transition::Select { exprs, cases }) => {
            let mut nexprs = Vec::with_capacity(exprs.len());
            for e in exprs {
                let ne = transform_expression(t, e);
                if !Rc::ptr_eq(&ne, e) {
                    changed = true;
                }
                nexprs.push(ne);
            }
            let mut ncases = Vec::with_capacity(cases.len());
            for case in cases {
                let keyset = transform_expression(t, &case.keyset);
                let next_state = transform_expression(t, &case.next_state);
                if !Rc::ptr_eq(&keyset, &case.keyset) || !Rc::ptr_eq(&next_state, &case.next_state)
                {
                    changed = true;
                }
                ncases.push(SelectCase { keyset, next_state });
            }
            Some(Transition::Select {
                exprs: nexprs,
                cases: ncases,
            })
        }
        None => None,
    };
    let rebuilt = if changed {
        Rc::new(ParserState {
            name: state.name.clone(),
            components,
            transition,
        })
    } else {
        Rc::clone(state)
    };
    t.post_parser_state(&rebuilt).unwrap_or(rebuilt)
}

fn transform_control<T: Transform>(t: &mut T, ctrl: &P<ControlDecl>) -> P<ControlDecl> {
    let mut changed = false;
    let mut actions = Vec::with_capacity(ctrl.actions.len());
    for action in &ctrl.actions {
        let na = transform_action(t, action);
        if !Rc::ptr_eq(&na, action) {
            changed = true;
        }
        actions.push(na);
    }
    let mut tables = Vec::with_capacity(ctrl.tables.len());
    for table in &ctrl.tables {
        let nt = transform_table(t, table);
        if !Rc::ptr_eq(&nt, table) {
            changed = true;
        }
        tables.push(nt);
    }
    let mut body = Vec::with_capacity(ctrl.body.len());
    for stmt in &ctrl.body {
        let ns = transform_statement(t, stmt);
        if !Rc::ptr_eq(&ns, stmt) {
            changed = true;
        }
        body.push(ns);
    }
    if changed {
        Rc::new(ControlDecl {
            name: ctrl.name.clone(),
            actions,
            tables,
            body,
        })
    } else {
        Rc::clone(ctrl)
    }
}

fn transform_action<T: Transform>(t: &mut T, action: &P<ActionDecl>) -> P<ActionDecl> {
    let mut changed = false;
    let mut body = Vec::with_capacity(action.body.len());
    for stmt in &action.body {
        let ns = transform_statement(t, stmt);
        if !Rc::ptr_eq(&ns, stmt) {
            changed = true;
        }
        body.push(ns);
    }
    if changed {
        Rc::new(ActionDecl {
            name: action.name.clone(),
            body,
        })
    } else {
        Rc::clone(action)
    }
}

fn transform_table<T: Transform>(t: &mut T, table: &P<TableDecl>) -> P<TableDecl> {
    let mut changed = false;
    let mut keys = Vec::with_capacity(table.keys.len());
    for key in &table.keys {
        let ne = transform_expression(t, &key.expr);
        if !Rc::ptr_eq(&ne, &key.expr) {
            changed = true;
        }
        keys.push(KeyElement {
            expr: ne,
            match_kind: key.match_kind.clone(),
        });
    }
    if changed {
        Rc::new(TableDecl {
            name: table.name.clone(),
            keys,
            actions: table.actions.clone(),
            default_action: table.default_action.clone(),
        })
    } else {
        Rc::clone(table)
    }
}

pub fn transform_statement<T: Transform>(t: &mut T, stmt: &P<Statement>) -> P<Statement> {
    let rebuilt = match &**stmt {
        Statement::Assignment { lhs, rhs } => {
            let nrhs = transform_expression(t, rhs);
            let nlhs = transform_expression(t, lhs);
            if Rc::ptr_eq(&nlhs, lhs) && Rc::ptr_eq(&nrhs, rhs) {
                Rc::clone(stmt)
            } else {
                Rc::new(Statement::Assignment {
                    lhs: nlhs,
                    rhs: nrhs,
                })
            }
        }
        Statement::If {
            condition,
            then_branch,
            else_branch,
        } => {
            let ncond = transform_expression(t, condition);
            let nthen = transform_statement(t, then_branch);
            let nelse = else_branch.as_ref().map(|e| transform_statement(t, e));
            let unchanged = Rc::ptr_eq(&ncond, condition)
                && Rc::ptr_eq(&nthen, then_branch)
                && match (&nelse, else_branch) {
                    (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                };
            if unchanged {
                Rc::clone(stmt)
            } else {
                Rc::new(Statement::If {
                    condition: ncond,
                    then_branch: nthen,
                    else_branch: nelse,
                })
            }
        }
        Statement::Switch { expression, cases } => {
            let nexpr = transform_expression(t, expression);
            let mut changed = !Rc::ptr_eq(&nexpr, expression);
            let mut ncases = Vec::with_capacity(cases.len());
            for case in cases {
                let body = match &case.body {
                    Some(b) => {
                        let nb = transform_statement(t, b);
                        if !Rc::ptr_eq(&nb, b) {
                            changed = true;
                        }
                        Some(nb)
                    }
                    None => None,
                };
                ncases.push(SwitchCase {
                    label: case.label.clone(),
                    body,
                });
            }
            if changed {
                Rc::new(Statement::Switch {
                    expression: nexpr,
                    cases: ncases,
                })
            } else {
                Rc::clone(stmt)
            }
        }
        Statement::MethodCall(call) => {
            let ncall = transform_expression(t, call);
            if Rc::ptr_eq(&ncall, call) {
                Rc::clone(stmt)
            } else {
                Rc::new(Statement::MethodCall(ncall))
            }
        }
        Statement::Block(stmts) => {
            let mut changed = false;
            let mut nstmts = Vec::with_capacity(stmts.len());
            for s in stmts {
                let ns = transform_statement(t, s);
                if !Rc::ptr_eq(&ns, s) {
                    changed = true;
                }
                nstmts.push(ns);
            }
            if changed {
                Rc::new(Statement::Block(nstmts))
            } else {
                Rc::clone(stmt)
            }
        }
        Statement::Empty => Rc::clone(stmt),
    };
    t.post_statement(&rebuilt).unwrap_or(rebuilt)
}

pub fn transform_expression<T: Transform>(t: &mut T, expr: &P<Expression>) -> P<Expression> {
    let seeded = t.pre_expression(expr);
    let cur = seeded.unwrap_or_else(|| Rc::clone(expr));
    match &cur.kind {
        ExprKind::Member { base, member } => {
            let nbase = transform_expression(t, base);
            if Rc::ptr_eq(&nbase, base) {
                cur
            } else {
                Expression::new(
                    ExprKind::Member {
                        base: nbase,
                        member: member.clone(),
                    },
                    cur.ty.clone(),
                )
            }
        }
        ExprKind::MethodCall {
            method,
            type_args,
            args,
        } => {
            let nmethod = transform_expression(t, method);
            let mut changed = !Rc::ptr_eq(&nmethod, method);
            let mut nargs = Vec::with_capacity(args.len());
            for arg in args {
                let na = transform_expression(t, arg);
                if !Rc::ptr_eq(&na, arg) {
                    changed = true;
                }
                nargs.push(na);
            }
            if changed {
                Expression::new(
                    ExprKind::MethodCall {
                        method: nmethod,
                        type_args: type_args.clone(),
                        args: nargs,
                    },
                    cur.ty.clone(),
                )
            } else {
                cur
            }
        }
        ExprKind::Binary { op, left, right } => {
            let nleft = transform_expression(t, left);
            let nright = transform_expression(t, right);
            if Rc::ptr_eq(&nleft, left) && Rc::ptr_eq(&nright, right) {
                cur
            } else {
                Expression::new(
                    ExprKind::Binary {
                        op: *op,
                        left: nleft,
                        right: nright,
                    },
                    cur.ty.clone(),
                )
            }
        }
        ExprKind::Unary { op, expr: inner } => {
            let ninner = transform_expression(t, inner);
            if Rc::ptr_eq(&ninner, inner) {
                cur
            } else {
                Expression::new(
                    ExprKind::Unary {
                        op: *op,
                        expr: ninner,
                    },
                    cur.ty.clone(),
                )
            }
        }
        ExprKind::Path(_) | ExprKind::Constant(_) | ExprKind::BoolLiteral(_) | ExprKind::Default => {
            cur
        }
    }
}
