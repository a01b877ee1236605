//! Summary extraction: one traversal of the program that populates, per
//! action, the read/write sets and straight-line dataflow facts, and per
//! table, the key-read set, the action set and the combined per-variable
//! effect sets. The parser contributes through a pseudo-table and
//! pseudo-action both named `parser`.

use std::collections::{BTreeMap, BTreeSet};

use crate::diag::Diagnostics;
use crate::ir::visit::{walk_program, Ctx, Inspector};
use crate::ir::{
    variable_name, ActionDecl, ExprKind, Expression, P, ParserDecl, Program, Statement, TableDecl,
};
use crate::midend::dataflow::{Token, ValueSet};
use crate::midend::errors::MidendError;
use crate::midend::tableflow::{TableFlowGraph, TableNodeId};

/// Per-action (or parser pseudo-action) summary.
#[derive(Debug, Default, Clone)]
pub struct FuncInfo {
    pub reads: BTreeSet<String>,
    pub writes: BTreeSet<String>,
    /// Straight-line last assignment per variable: the source field when the
    /// RHS is a simple `hdr`/`meta` path, otherwise `Undefined`.
    pub dataflows: BTreeMap<String, Token>,
    /// Parallel semantics: every value assigned to the variable anywhere in
    /// the parser is observed simultaneously.
    pub edataflows: BTreeMap<String, BTreeSet<Token>>,
}

/// The name of the parser pseudo-table and pseudo-action.
pub const PARSER_TABLE: &str = "parser";

const NO_ACTION_PREFIX: &str = "NoAction";

pub struct ExtractSummaries<'a> {
    graph: &'a mut TableFlowGraph,
    actions: &'a mut BTreeMap<String, FuncInfo>,
    diag: &'a Diagnostics,
    current_table: Option<TableNodeId>,
    current_func: Option<String>,
}

impl<'a> ExtractSummaries<'a> {
    pub fn new(
        graph: &'a mut TableFlowGraph,
        actions: &'a mut BTreeMap<String, FuncInfo>,
        diag: &'a Diagnostics,
    ) -> Self {
        ExtractSummaries {
            graph,
            actions,
            diag,
            current_table: None,
            current_func: None,
        }
    }

    pub fn run(mut self, prog: &Program) -> Result<(), MidendError> {
        walk_program(&mut self, prog)
    }

    fn current_func_info(&mut self) -> Option<&mut FuncInfo> {
        let name = self.current_func.as_ref()?;
        self.actions.get_mut(name)
    }

    fn in_parser_table(&self) -> bool {
        self.current_table
            .map(|id| self.graph.node(id).name == PARSER_TABLE)
            .unwrap_or(false)
    }

    /// Combine the actions' effects into the table's per-variable effect
    /// sets: extended dataflow values (plus `NoChange`, since an action may
    /// not fire on every row), a scalar last assignment, or `NoChange` for
    /// an action that leaves the variable alone. `Undefined` collapses the
    /// whole set.
    fn combine_effects(&mut self, table: TableNodeId) -> Result<(), MidendError> {
        let table_name = self.graph.node(table).name.clone();
        let node_actions: Vec<String> = self.graph.node(table).actions.iter().cloned().collect();
        let mut written: BTreeSet<String> = BTreeSet::new();
        for act in &node_actions {
            let func = self
                .actions
                .get(act)
                .ok_or_else(|| MidendError::UnknownAction {
                    table: table_name.clone(),
                    action: act.clone(),
                })?;
            written.extend(func.writes.iter().cloned());
        }
        for var in written {
            let mut values = ValueSet::new();
            for act in &node_actions {
                let func = &self.actions[act];
                if let Some(evalues) = func.edataflows.get(&var) {
                    for value in evalues {
                        values.insert(value.clone());
                    }
                    values.insert(Token::NoChange);
                } else if let Some(value) = func.dataflows.get(&var) {
                    values.insert(value.clone());
                } else {
                    values.insert(Token::NoChange);
                }
            }
            if values.contains(&Token::Undefined) {
                values = ValueSet::singleton(Token::Undefined);
            }
            self.diag
                .detail(format!("{}: effect {} = {}", table_name, var, values));
            self.graph.node_mut(table).effects.insert(var, values);
        }
        Ok(())
    }
}

impl<'a> Inspector for ExtractSummaries<'a> {
    fn pre_table(&mut self, table: &P<TableDecl>, _cx: &Ctx) -> Result<bool, MidendError> {
        if let Some(active) = self.current_table {
            return Err(MidendError::CorruptTableState {
                active: self.graph.node(active).name.clone(),
                entered: table.name.clone(),
            });
        }
        let id = self.graph.node_id(&table.name);
        let node = self.graph.node_mut(id);
        node.keyreads.clear();
        for action in &table.actions {
            if !action.starts_with(NO_ACTION_PREFIX) {
                node.actions.insert(action.clone());
            }
        }
        self.current_table = Some(id);
        Ok(true)
    }

    fn post_table(&mut self, table: &P<TableDecl>, _cx: &Ctx) -> Result<(), MidendError> {
        let id = self.current_table.ok_or(MidendError::CorruptTableState {
            active: "<none>".to_string(),
            entered: table.name.clone(),
        })?;
        self.diag.structure(format!(
            "table {} reads={:?} actions={:?}",
            table.name,
            self.graph.node(id).keyreads,
            self.graph.node(id).actions
        ));
        self.combine_effects(id)?;
        self.current_table = None;
        Ok(())
    }

    fn pre_action(&mut self, action: &P<ActionDecl>, _cx: &Ctx) -> Result<bool, MidendError> {
        if action.name.starts_with(NO_ACTION_PREFIX) {
            return Ok(false);
        }
        if let Some(active) = &self.current_func {
            return Err(MidendError::CorruptActionState {
                active: active.clone(),
                entered: action.name.clone(),
            });
        }
        self.actions.entry(action.name.clone()).or_default();
        self.current_func = Some(action.name.clone());
        self.diag.trace(format!("summarizing action {}", action.name));
        Ok(true)
    }

    fn post_action(&mut self, action: &P<ActionDecl>, _cx: &Ctx) -> Result<(), MidendError> {
        if action.name.starts_with(NO_ACTION_PREFIX) {
            return Ok(());
        }
        if let Some(func) = self.current_func_info() {
            let (reads, writes) = (func.reads.clone(), func.writes.clone());
            self.diag.structure(format!(
                "action {} reads={:?} writes={:?}",
                action.name, reads, writes
            ));
        }
        self.current_func = None;
        Ok(())
    }

    fn pre_parser(&mut self, _parser: &P<ParserDecl>, _cx: &Ctx) -> Result<bool, MidendError> {
        let id = self.graph.node_id(PARSER_TABLE);
        self.graph
            .node_mut(id)
            .actions
            .insert(PARSER_TABLE.to_string());
        self.actions.entry(PARSER_TABLE.to_string()).or_default();
        self.current_table = Some(id);
        self.current_func = Some(PARSER_TABLE.to_string());
        Ok(true)
    }

    fn post_parser(&mut self, _parser: &P<ParserDecl>, _cx: &Ctx) -> Result<(), MidendError> {
        if let Some(func) = self.actions.get(PARSER_TABLE) {
            self.diag.structure(format!(
                "parser reads={:?} writes={:?}",
                func.reads, func.writes
            ));
        }
        let id = self.current_table.ok_or(MidendError::CorruptTableState {
            active: "<none>".to_string(),
            entered: PARSER_TABLE.to_string(),
        })?;
        self.combine_effects(id)?;
        self.current_func = None;
        self.current_table = None;
        Ok(())
    }

    fn pre_statement(&mut self, stmt: &P<Statement>, _cx: &Ctx) -> Result<bool, MidendError> {
        if let Statement::Assignment { lhs, rhs } = &**stmt {
            let lname = variable_name(lhs);
            let rname = variable_name(rhs);
            let in_parser = self.in_parser_table();
            if self.current_func.is_some() {
                if let Some(lname) = lname {
                    let value = match rname {
                        Some(r) if r.starts_with("hdr") || r.starts_with("meta") => Token::Field(r),
                        _ => Token::Undefined,
                    };
                    if let Some(func) = self.current_func_info() {
                        func.dataflows.insert(lname.clone(), value.clone());
                        if in_parser {
                            func.edataflows.entry(lname).or_default().insert(value);
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    fn post_expression(&mut self, expr: &P<Expression>, cx: &Ctx) -> Result<(), MidendError> {
        if !matches!(expr.kind, ExprKind::Member { .. }) || cx.in_member() {
            return Ok(());
        }
        let name = match variable_name(expr) {
            Some(name) => name,
            None => return Ok(()),
        };
        if cx.in_key_element() {
            if let Some(id) = self.current_table {
                self.graph.node_mut(id).keyreads.insert(name.clone());
            }
        }
        if cx.is_write() {
            if let Some(func) = self.current_func_info() {
                func.writes.insert(name.clone());
            }
            // An out-argument of a method call is not truly read, but the
            // call cannot be dropped without it, so it stays live.
            if cx.is_read() || cx.in_method_call_arg() {
                if let Some(func) = self.current_func_info() {
                    func.reads.insert(name);
                }
            }
        } else if let Some(func) = self.current_func_info() {
            func.reads.insert(name);
        }
        Ok(())
    }
}

/// Run summary extraction over the program.
pub fn extract_summaries(
    prog: &Program,
    graph: &mut TableFlowGraph,
    actions: &mut BTreeMap<String, FuncInfo>,
    diag: &Diagnostics,
) -> Result<(), MidendError> {
    ExtractSummaries::new(graph, actions, diag).run(prog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Expression, Statement, Type};
    use std::rc::Rc;

    fn meta_field(name: &str) -> P<Expression> {
        Expression::member(
            Expression::typed_path("meta", Type::Struct("metadata".into())),
            name,
            Type::Bits(8),
        )
    }

    fn hdr_field(header: &str, field: &str) -> P<Expression> {
        let base = Expression::member(
            Expression::typed_path("hdr", Type::Struct("headers".into())),
            header,
            Type::Header(format!("{}_t", header)),
        );
        Expression::member(base, field, Type::Bits(8))
    }

    #[test]
    fn action_summary_records_copy_dataflow() {
        let action = Rc::new(ActionDecl {
            name: "set_port".into(),
            body: vec![Statement::assign(meta_field("a"), hdr_field("h", "f"))],
        });
        let ctrl = Rc::new(crate::ir::ControlDecl {
            name: "ingress".into(),
            actions: vec![action],
            tables: vec![],
            body: vec![],
        });
        let prog = Program::new(vec![crate::ir::Decl::Control(ctrl)]);

        let mut graph = TableFlowGraph::new();
        let mut actions = BTreeMap::new();
        let diag = Diagnostics::silent();
        extract_summaries(&prog, &mut graph, &mut actions, &diag).unwrap();

        let func = &actions["set_port"];
        assert!(func.writes.contains("meta.a"));
        assert!(func.reads.contains("hdr.h.f"));
        assert_eq!(
            func.dataflows.get("meta.a"),
            Some(&Token::field("hdr.h.f"))
        );
        assert!(func.edataflows.is_empty());
    }

    #[test]
    fn computed_rhs_is_undefined() {
        let rhs = Expression::binary(
            crate::ir::BinOp::Add,
            hdr_field("h", "f"),
            Expression::constant(1),
        );
        let action = Rc::new(ActionDecl {
            name: "bump".into(),
            body: vec![Statement::assign(meta_field("a"), rhs)],
        });
        let ctrl = Rc::new(crate::ir::ControlDecl {
            name: "ingress".into(),
            actions: vec![action],
            tables: vec![],
            body: vec![],
        });
        let prog = Program::new(vec![crate::ir::Decl::Control(ctrl)]);

        let mut graph = TableFlowGraph::new();
        let mut actions = BTreeMap::new();
        let diag = Diagnostics::silent();
        extract_summaries(&prog, &mut graph, &mut actions, &diag).unwrap();

        assert_eq!(
            actions["bump"].dataflows.get("meta.a"),
            Some(&Token::Undefined)
        );
    }
}
