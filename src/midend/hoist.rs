//! Harmless-table hoisting: a table applied under an if-conditional can be
//! lifted out when its actions touch nothing the guard or the surrounding
//! flow cares about. The apply is removed from the conditional body and
//! re-emitted as a sibling statement immediately before the conditional.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::diag::Diagnostics;
use crate::ir::{
    variable_name, ControlDecl, Decl, ExprKind, Expression, P, Program, Statement, SwitchCase,
};
use crate::midend::errors::MidendError;
use crate::midend::summary::FuncInfo;
use crate::midend::tableflow::{TableFlowGraph, TableNodeId};

/// Any embedded method call makes an expression side-effecting.
fn has_side_effects(expr: &Expression) -> bool {
    match &expr.kind {
        ExprKind::MethodCall { .. } => true,
        ExprKind::Member { base, .. } => has_side_effects(base),
        ExprKind::Binary { left, right, .. } => has_side_effects(left) || has_side_effects(right),
        ExprKind::Unary { expr, .. } => has_side_effects(expr),
        _ => false,
    }
}

/// Every variable name an expression reads: bare paths and outermost member
/// chains.
fn collect_reads(expr: &Expression, out: &mut BTreeSet<String>) {
    match &expr.kind {
        ExprKind::Path(_) | ExprKind::Member { .. } => {
            if let Some(name) = variable_name(expr) {
                out.insert(name);
            } else if let ExprKind::Member { base, .. } = &expr.kind {
                collect_reads(base, out);
            }
        }
        ExprKind::MethodCall { method, args, .. } => {
            collect_reads(method, out);
            for arg in args {
                collect_reads(arg, out);
            }
        }
        ExprKind::Binary { left, right, .. } => {
            collect_reads(left, out);
            collect_reads(right, out);
        }
        ExprKind::Unary { expr, .. } => collect_reads(expr, out),
        _ => {}
    }
}

pub struct HoistHarmlessTables<'a> {
    graph: &'a TableFlowGraph,
    actions: &'a BTreeMap<String, FuncInfo>,
    diag: &'a Diagnostics,
    /// Harmless table name -> id of the conditional it may leave.
    harmless: BTreeMap<String, u32>,
    next_conditional_id: u32,
}

impl<'a> HoistHarmlessTables<'a> {
    pub fn new(
        graph: &'a TableFlowGraph,
        actions: &'a BTreeMap<String, FuncInfo>,
        diag: &'a Diagnostics,
    ) -> Self {
        HoistHarmlessTables {
            graph,
            actions,
            diag,
            harmless: BTreeMap::new(),
            next_conditional_id: 1,
        }
    }

    pub fn run(mut self, prog: &P<Program>) -> Result<P<Program>, MidendError> {
        self.collect_harmless()?;
        if self.harmless.is_empty() {
            return Ok(Rc::clone(prog));
        }
        for (name, if_id) in &self.harmless {
            self.diag.summary(format!(
                "hoisting harmless table {} out of conditional {}",
                name, if_id
            ));
        }

        // Conditional ids are assigned with the same preorder discipline the
        // flow builder used: ingress before egress, ifs and switches sharing
        // one counter.
        let mut declarations = Vec::with_capacity(prog.declarations.len());
        for decl in &prog.declarations {
            declarations.push(decl.clone());
        }
        for name in ["ingress", "egress"] {
            for decl in declarations.iter_mut() {
                if let Decl::Control(ctrl) = decl {
                    if ctrl.name == name {
                        *decl = Decl::Control(self.rewrite_control(ctrl));
                    }
                }
            }
        }
        Ok(Program::new(declarations))
    }

    fn collect_harmless(&mut self) -> Result<(), MidendError> {
        let mut names: Vec<(String, TableNodeId)> = Vec::new();
        let mut stack = vec![self.graph.start()];
        let mut seen: FxHashSet<TableNodeId> = FxHashSet::default();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = self.graph.node(id);
            if node.inside_conditional {
                names.push((node.name.clone(), id));
            }
            stack.extend(node.children.iter().copied());
        }
        names.sort();
        for (name, id) in names {
            if self.check_harmless(id)? {
                self.harmless.insert(name, self.graph.node(id).if_id);
            }
        }
        Ok(())
    }

    fn action_infos(&self, id: TableNodeId) -> Result<Vec<&FuncInfo>, MidendError> {
        self.graph
            .node(id)
            .actions
            .iter()
            .map(|act| {
                self.actions.get(act).ok_or_else(|| MidendError::UnknownAction {
                    table: self.graph.node(id).name.clone(),
                    action: act.clone(),
                })
            })
            .collect()
    }

    fn check_harmless(&self, id: TableNodeId) -> Result<bool, MidendError> {
        let node = self.graph.node(id);
        let guard = match &node.if_condition {
            Some(guard) => guard,
            None => return Ok(false),
        };
        let infos = self.action_infos(id)?;

        // Writes into packet headers have lasting effects.
        for func in &infos {
            if func.writes.iter().any(|w| w.starts_with("hdr")) {
                return Ok(false);
            }
        }

        // The guard must not conflict with the table's actions.
        if has_side_effects(guard) {
            return Ok(false);
        }
        let mut guard_reads = BTreeSet::new();
        collect_reads(guard, &mut guard_reads);
        for func in &infos {
            if func.writes.iter().any(|w| guard_reads.contains(w)) {
                return Ok(false);
            }
        }

        let mut visited = FxHashSet::default();
        for parent in &node.parents {
            if !self.check_upstream(id, *parent, &mut visited)? {
                return Ok(false);
            }
        }
        let mut checked: FxHashMap<TableNodeId, bool> = FxHashMap::default();
        for child in &node.children {
            if !self.check_downstream(id, *child, &mut checked)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Predecessors still inside the same conditional must not write anything
    /// the table reads.
    fn check_upstream(
        &self,
        table: TableNodeId,
        cur: TableNodeId,
        visited: &mut FxHashSet<TableNodeId>,
    ) -> Result<bool, MidendError> {
        if !visited.insert(cur) {
            return Ok(true);
        }
        if self.graph.node(cur).if_id != self.graph.node(table).if_id {
            return Ok(true);
        }
        self.diag.trace(format!(
            "upstream check {} against {}",
            self.graph.node(table).name,
            self.graph.node(cur).name
        ));
        let table_infos = self.action_infos(table)?;
        let cur_infos = self.action_infos(cur)?;
        for tf in &table_infos {
            for cf in &cur_infos {
                if tf.reads.iter().any(|r| cf.writes.contains(r)) {
                    return Ok(false);
                }
            }
        }
        for parent in &self.graph.node(cur).parents {
            if !self.check_upstream(table, *parent, visited)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Descendants beyond the conditional must neither read nor key on
    /// anything the table writes.
    fn check_downstream(
        &self,
        table: TableNodeId,
        cur: TableNodeId,
        checked: &mut FxHashMap<TableNodeId, bool>,
    ) -> Result<bool, MidendError> {
        if checked.contains_key(&cur) {
            return Ok(true);
        }
        checked.insert(cur, true);
        let table_node = self.graph.node(table);
        let cur_node = self.graph.node(cur);
        let still_inside = cur_node.if_id == table_node.if_id && cur_node.if_id != 0;
        if !still_inside {
            self.diag.trace(format!(
                "downstream check {} against {}",
                table_node.name, cur_node.name
            ));
            let table_infos = self.action_infos(table)?;
            let cur_infos = self.action_infos(cur)?;
            for tf in &table_infos {
                for cf in &cur_infos {
                    if tf.writes.iter().any(|w| cf.reads.contains(w)) {
                        return Ok(false);
                    }
                }
                if tf.writes.iter().any(|w| cur_node.keyreads.contains(w)) {
                    return Ok(false);
                }
            }
        }
        for child in &self.graph.node(cur).children {
            if !self.check_downstream(table, *child, checked)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_conditional_id;
        self.next_conditional_id += 1;
        id
    }

    fn rewrite_control(&mut self, ctrl: &P<ControlDecl>) -> P<ControlDecl> {
        let mut changed = false;
        let mut body = Vec::with_capacity(ctrl.body.len());
        for stmt in &ctrl.body {
            let ns = self.rewrite_statement(stmt);
            if !Rc::ptr_eq(&ns, stmt) {
                changed = true;
            }
            body.push(ns);
        }
        if changed {
            Rc::new(ControlDecl {
                name: ctrl.name.clone(),
                actions: ctrl.actions.clone(),
                tables: ctrl.tables.clone(),
                body,
            })
        } else {
            Rc::clone(ctrl)
        }
    }

    fn rewrite_statement(&mut self, stmt: &P<Statement>) -> P<Statement> {
        match &**stmt {
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let id = self.next_id();
                let nthen = self.rewrite_statement(then_branch);
                let nelse = else_branch.as_ref().map(|e| self.rewrite_statement(e));

                let mut hoisted: Vec<P<Statement>> = Vec::new();
                let mut hoisted_names: BTreeSet<String> = BTreeSet::new();
                let nthen = self.strip_harmless(&nthen, id, &mut hoisted, &mut hoisted_names);
                let nelse =
                    nelse.map(|e| self.strip_harmless(&e, id, &mut hoisted, &mut hoisted_names));

                let unchanged = hoisted.is_empty()
                    && Rc::ptr_eq(&nthen, then_branch)
                    && match (&nelse, else_branch) {
                        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                        (None, None) => true,
                        _ => false,
                    };
                if unchanged {
                    return Rc::clone(stmt);
                }
                let rebuilt_if = Rc::new(Statement::If {
                    condition: condition.clone(),
                    then_branch: nthen,
                    else_branch: nelse,
                });
                if hoisted.is_empty() {
                    rebuilt_if
                } else {
                    hoisted.push(rebuilt_if);
                    Statement::block(hoisted)
                }
            }
            Statement::Switch { expression, cases } => {
                let _id = self.next_id();
                let mut changed = false;
                let mut ncases = Vec::with_capacity(cases.len());
                for case in cases {
                    let body = case.body.as_ref().map(|b| {
                        let nb = self.rewrite_statement(b);
                        if !Rc::ptr_eq(&nb, b) {
                            changed = true;
                        }
                        nb
                    });
                    ncases.push(SwitchCase {
                        label: case.label.clone(),
                        body,
                    });
                }
                if changed {
                    Rc::new(Statement::Switch {
                        expression: expression.clone(),
                        cases: ncases,
                    })
                } else {
                    Rc::clone(stmt)
                }
            }
            Statement::Block(stmts) => {
                let mut changed = false;
                let mut nstmts = Vec::with_capacity(stmts.len());
                for s in stmts {
                    let ns = self.rewrite_statement(s);
                    if !Rc::ptr_eq(&ns, s) {
                        changed = true;
                    }
                    nstmts.push(ns);
                }
                if changed {
                    Statement::block(nstmts)
                } else {
                    Rc::clone(stmt)
                }
            }
            _ => Rc::clone(stmt),
        }
    }

    /// Remove applies of tables that are harmless with respect to the
    /// conditional `if_id`, leaving empty statements behind. Nested
    /// conditionals keep their own applies; they were handled when their own
    /// id was current.
    fn strip_harmless(
        &self,
        stmt: &P<Statement>,
        if_id: u32,
        hoisted: &mut Vec<P<Statement>>,
        hoisted_names: &mut BTreeSet<String>,
    ) -> P<Statement> {
        match &**stmt {
            Statement::MethodCall(call) => {
                if let Some(table) = applied_table_name(call) {
                    if self.harmless.get(&table) == Some(&if_id) {
                        if hoisted_names.insert(table) {
                            hoisted.push(Rc::clone(stmt));
                        }
                        return Rc::new(Statement::Empty);
                    }
                }
                Rc::clone(stmt)
            }
            Statement::Block(stmts) => {
                let mut changed = false;
                let mut nstmts = Vec::with_capacity(stmts.len());
                for s in stmts {
                    let ns = self.strip_harmless(s, if_id, hoisted, hoisted_names);
                    if !Rc::ptr_eq(&ns, s) {
                        changed = true;
                    }
                    nstmts.push(ns);
                }
                if changed {
                    Statement::block(nstmts)
                } else {
                    Rc::clone(stmt)
                }
            }
            _ => Rc::clone(stmt),
        }
    }
}

fn applied_table_name(call: &Expression) -> Option<String> {
    if let ExprKind::MethodCall { method, .. } = &call.kind {
        if let ExprKind::Member { base, member } = &method.kind {
            if member == "apply" {
                if let ExprKind::Path(name) = &base.kind {
                    return Some(name.clone());
                }
            }
        }
    }
    None
}

/// Hoist every provably harmless table out of its conditional; a program
/// with nothing to hoist comes back as the same shared root.
pub fn hoist_harmless_tables(
    prog: &P<Program>,
    graph: &TableFlowGraph,
    actions: &BTreeMap<String, FuncInfo>,
    diag: &Diagnostics,
) -> Result<P<Program>, MidendError> {
    HoistHarmlessTables::new(graph, actions, diag).run(prog)
}
