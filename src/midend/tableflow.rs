//! Table-flow graph: a DAG of table applications across the parser and the
//! ingress/egress pipelines, rooted at a synthetic start node, with
//! if/else and switch convergence modeled by synthesized merge nodes. The
//! dataflow solver propagates per-variable value sets over the finished DAG.

use std::collections::{BTreeMap, BTreeSet};

use id_arena::{Arena, Id};
use rustc_hash::FxHashSet;

use crate::diag::Diagnostics;
use crate::ir::{ExprKind, Expression, P, Program, Statement, SwitchLabel};
use crate::midend::dataflow::{Token, ValueSet};
use crate::midend::errors::MidendError;
use crate::midend::summary::FuncInfo;

pub type TableNodeId = Id<TableNode>;

/// One node of the table-flow DAG: a real table, the parser pseudo-table, or
/// a synthesized start/converge node.
#[derive(Debug, Default)]
pub struct TableNode {
    pub name: String,
    pub actions: BTreeSet<String>,
    pub keyreads: BTreeSet<String>,
    pub inside_conditional: bool,
    pub inside_switch: bool,
    /// Longest-path distance from start; 0 until the node is wired in.
    pub depth: usize,
    /// Id of the enclosing conditional, 0 if none.
    pub if_id: u32,
    pub if_condition: Option<P<Expression>>,
    pub dataflow_computed: bool,
    pub parents: BTreeSet<TableNodeId>,
    pub children: BTreeSet<TableNodeId>,
    /// Per-variable effect sets combined from the node's actions.
    pub effects: BTreeMap<String, ValueSet>,
    /// Lattice value observed by this node's keys (before the node fires).
    pub key_dataflows: BTreeMap<String, ValueSet>,
    /// Lattice value after the node fires.
    pub dataflows: BTreeMap<String, ValueSet>,
}

impl TableNode {
    fn named(name: impl Into<String>) -> Self {
        TableNode {
            name: name.into(),
            ..TableNode::default()
        }
    }
}

/// Arena-backed graph, nodes addressed by id, adjacency as ordered id sets.
#[derive(Debug)]
pub struct TableFlowGraph {
    nodes: Arena<TableNode>,
    by_name: BTreeMap<String, TableNodeId>,
    start: TableNodeId,
}

impl Default for TableFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TableFlowGraph {
    pub fn new() -> Self {
        let mut nodes = Arena::new();
        let start = nodes.alloc(TableNode::named("start"));
        let mut by_name = BTreeMap::new();
        by_name.insert("start".to_string(), start);
        TableFlowGraph {
            nodes,
            by_name,
            start,
        }
    }

    pub fn start(&self) -> TableNodeId {
        self.start
    }

    pub fn node(&self, id: TableNodeId) -> &TableNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: TableNodeId) -> &mut TableNode {
        &mut self.nodes[id]
    }

    pub fn lookup(&self, name: &str) -> Option<TableNodeId> {
        self.by_name.get(name).copied()
    }

    /// Fetch the node for `name`, creating an empty one on first use.
    pub fn node_id(&mut self, name: &str) -> TableNodeId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = self.nodes.alloc(TableNode::named(name));
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Allocate a synthesized node that is not addressable by name.
    fn alloc_synthetic(&mut self, name: String) -> TableNodeId {
        self.nodes.alloc(TableNode::named(name))
    }

    fn add_edge(&mut self, from: TableNodeId, to: TableNodeId) {
        self.nodes[to].parents.insert(from);
        self.nodes[from].children.insert(to);
    }

    /// Level-2 dump of every reachable node.
    pub fn print(&self, diag: &Diagnostics) {
        let mut visited = FxHashSet::default();
        self.print_from(self.start, &mut visited, diag);
    }

    fn print_from(
        &self,
        id: TableNodeId,
        visited: &mut FxHashSet<TableNodeId>,
        diag: &Diagnostics,
    ) {
        if !visited.insert(id) {
            return;
        }
        let node = &self.nodes[id];
        diag.structure(format!(
            "table {} depth={} if_id={}",
            node.name, node.depth, node.if_id
        ));
        let parents: Vec<&str> = node
            .parents
            .iter()
            .map(|p| self.nodes[*p].name.as_str())
            .collect();
        let children: Vec<&str> = node
            .children
            .iter()
            .map(|c| self.nodes[*c].name.as_str())
            .collect();
        diag.structure(format!(
            "  parents=({}) children=({})",
            parents.join(","),
            children.join(",")
        ));
        for child in node.children.clone() {
            self.print_from(child, visited, diag);
        }
    }
}

/// Branch state snapshotted at conditionals and reunified at joins.
#[derive(Debug, Clone, Copy)]
struct FlowState {
    current: TableNodeId,
}

/// Builds the table-flow DAG by walking the program's control flow: the
/// parser pseudo-node first, then the ingress and egress apply bodies.
pub struct BuildTableFlow<'a> {
    graph: &'a mut TableFlowGraph,
    actions: &'a BTreeMap<String, FuncInfo>,
    diag: &'a Diagnostics,
    /// Union of reads and writes over every action actually applied.
    variables: BTreeSet<String>,
    state: FlowState,
    /// Stack of (conditional id, guard) for open ifs and switches.
    conditionals: Vec<(u32, P<Expression>)>,
    if_depth: usize,
    inside_switch: bool,
    next_conditional_id: u32,
}

impl<'a> BuildTableFlow<'a> {
    pub fn new(
        graph: &'a mut TableFlowGraph,
        actions: &'a BTreeMap<String, FuncInfo>,
        diag: &'a Diagnostics,
    ) -> Self {
        let start = graph.start();
        BuildTableFlow {
            graph,
            actions,
            diag,
            variables: BTreeSet::new(),
            state: FlowState { current: start },
            conditionals: Vec::new(),
            if_depth: 0,
            inside_switch: false,
            next_conditional_id: 1,
        }
    }

    /// Build the graph and run the solver. Returns the variable universe.
    pub fn run(mut self, prog: &Program) -> Result<BTreeSet<String>, MidendError> {
        let parser = self
            .graph
            .lookup("parser")
            .ok_or(MidendError::MissingParser)?;
        let start = self.graph.start();
        self.graph.add_edge(start, parser);
        self.graph.node_mut(parser).depth = 1;
        self.state.current = parser;
        // The start node applies the parser, so its variables are tracked
        // like any applied table's.
        self.accumulate_action_vars(parser);

        for name in ["ingress", "egress"] {
            if let Some(ctrl) = prog.find_control(name) {
                self.diag.trace(format!("visiting {}", name));
                for stmt in &ctrl.body {
                    self.flow_statement(stmt)?;
                }
            }
        }

        self.graph.print(self.diag);
        solve(self.graph, &self.variables, self.diag);
        Ok(self.variables)
    }

    fn clone_state(&self) -> FlowState {
        self.state
    }

    /// Reunify with the flow state of the other branch. Identical tips need
    /// no merge; otherwise both tips feed a fresh converge node.
    fn merge_state(&mut self, other: FlowState, if_id: u32) {
        if self.state.current == other.current {
            return;
        }
        let a = self.state.current;
        let b = other.current;
        self.diag.detail(format!(
            "merging {} and {}",
            self.graph.node(a).name,
            self.graph.node(b).name
        ));
        let converge = self.graph.alloc_synthetic(format!("if_converge_{}", if_id));
        self.graph.add_edge(a, converge);
        self.graph.add_edge(b, converge);
        let depth = self
            .graph
            .node(a)
            .depth
            .max(self.graph.node(b).depth)
            + 1;
        let node = self.graph.node_mut(converge);
        node.if_id = if_id;
        node.depth = depth;
        self.state.current = converge;
    }

    fn flow_statement(&mut self, stmt: &P<Statement>) -> Result<(), MidendError> {
        match &**stmt {
            Statement::Assignment { lhs, rhs } => {
                self.flow_expression(rhs)?;
                self.flow_expression(lhs)?;
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let id = self.next_conditional_id;
                self.next_conditional_id += 1;
                self.conditionals.push((id, condition.clone()));
                self.if_depth += 1;
                self.flow_expression(condition)?;

                let before = self.clone_state();
                self.flow_statement(then_branch)?;
                let then_tip = self.clone_state();
                self.state = before;
                if let Some(e) = else_branch {
                    self.flow_statement(e)?;
                }
                self.merge_state(then_tip, id);

                self.if_depth -= 1;
                self.conditionals.pop();
            }
            Statement::Switch { expression, cases } => {
                self.flow_switch(expression, cases)?;
            }
            Statement::MethodCall(call) => self.flow_expression(call)?,
            Statement::Block(stmts) => {
                for s in stmts {
                    self.flow_statement(s)?;
                }
            }
            Statement::Empty => {}
        }
        Ok(())
    }

    fn flow_switch(
        &mut self,
        expression: &P<Expression>,
        cases: &[crate::ir::SwitchCase],
    ) -> Result<(), MidendError> {
        let id = self.next_conditional_id;
        self.next_conditional_id += 1;
        self.conditionals.push((id, expression.clone()));
        self.flow_expression(expression)?;
        let was_inside_switch = self.inside_switch;
        self.inside_switch = true;

        let switch_parent = self.clone_state();
        let mut tips: Vec<TableNodeId> = Vec::new();
        let mut default_case = false;
        for case in cases {
            if case.label == SwitchLabel::Default {
                default_case = true;
            }
            self.state = switch_parent;
            if let Some(body) = &case.body {
                self.flow_statement(body)?;
            }
            if !tips.contains(&self.state.current) {
                tips.push(self.state.current);
            }
        }
        if !default_case && !tips.contains(&switch_parent.current) {
            tips.push(switch_parent.current);
        }

        let converge = self.graph.alloc_synthetic("switch_converge".to_string());
        let mut depth = 0;
        for tip in tips {
            self.graph.add_edge(tip, converge);
            depth = depth.max(self.graph.node(tip).depth + 1);
        }
        let node = self.graph.node_mut(converge);
        node.if_id = id;
        node.depth = depth;
        self.state.current = converge;

        self.inside_switch = was_inside_switch;
        self.conditionals.pop();
        Ok(())
    }

    fn flow_expression(&mut self, expr: &P<Expression>) -> Result<(), MidendError> {
        match &expr.kind {
            ExprKind::MethodCall { method, args, .. } => {
                if let Some(table) = self.applied_table(method) {
                    self.apply_table(&table)?;
                }
                self.flow_expression(method)?;
                for arg in args {
                    self.flow_expression(arg)?;
                }
            }
            ExprKind::Member { base, .. } => self.flow_expression(base)?,
            ExprKind::Binary { left, right, .. } => {
                self.flow_expression(left)?;
                self.flow_expression(right)?;
            }
            ExprKind::Unary { expr: inner, .. } => self.flow_expression(inner)?,
            _ => {}
        }
        Ok(())
    }

    /// A method call applies a table when its receiver path names one.
    fn applied_table(&self, method: &P<Expression>) -> Option<String> {
        if let ExprKind::Member { base, .. } = &method.kind {
            if let ExprKind::Path(name) = &base.kind {
                if self.graph.lookup(name).is_some() {
                    return Some(name.clone());
                }
            }
        }
        None
    }

    fn accumulate_action_vars(&mut self, node: TableNodeId) {
        for act in self.graph.node(node).actions.clone() {
            if let Some(func) = self.actions.get(&act) {
                for var in &func.reads {
                    self.variables.insert(var.clone());
                }
                for var in &func.writes {
                    self.variables.insert(var.clone());
                }
            }
        }
    }

    fn apply_table(&mut self, name: &str) -> Result<(), MidendError> {
        let table = self
            .graph
            .lookup(name)
            .ok_or_else(|| MidendError::UnknownTable(name.to_string()))?;
        self.diag.trace(format!("table apply {}", name));
        self.accumulate_action_vars(table);

        let cur = self.state.current;
        if table == cur {
            return Err(MidendError::SelfLoop(name.to_string()));
        }
        let (table_depth, cur_depth) = (self.graph.node(table).depth, self.graph.node(cur).depth);
        if table_depth != 0 && table_depth < cur_depth {
            return Err(MidendError::BackEdge {
                from: self.graph.node(cur).name.clone(),
                to: name.to_string(),
            });
        }
        self.graph.add_edge(cur, table);
        self.graph.node_mut(table).depth = cur_depth + 1;
        self.diag
            .detail(format!("edge {} -> {}", self.graph.node(cur).name, name));
        self.state.current = table;

        if self.if_depth > 0 || self.inside_switch {
            let (if_id, if_condition) = self
                .conditionals
                .last()
                .cloned()
                .ok_or_else(|| MidendError::EmptyConditionalStack(name.to_string()))?;
            let node = self.graph.node_mut(table);
            node.inside_conditional = self.if_depth > 0;
            if self.inside_switch {
                node.inside_switch = true;
            }
            node.if_id = if_id;
            node.if_condition = Some(if_condition);
        }
        Ok(())
    }
}

/// Monotone propagation over the finished DAG. Every universe variable is
/// seeded `{Initial}` at start; a node fires once all its predecessors have,
/// merging their post-states, recording the merge as its key observation and
/// applying its own effect set.
fn solve(graph: &mut TableFlowGraph, variables: &BTreeSet<String>, diag: &Diagnostics) {
    let start = graph.start();
    {
        let node = graph.node_mut(start);
        for var in variables {
            node.dataflows
                .insert(var.clone(), ValueSet::singleton(Token::Initial));
        }
        node.dataflow_computed = true;
    }
    let children: Vec<TableNodeId> = graph.node(start).children.iter().copied().collect();
    for child in children {
        solve_node(graph, child, variables, diag);
    }
}

fn solve_node(
    graph: &mut TableFlowGraph,
    id: TableNodeId,
    variables: &BTreeSet<String>,
    diag: &Diagnostics,
) {
    if graph.node(id).dataflow_computed {
        return;
    }
    for parent in graph.node(id).parents.iter() {
        if !graph.node(*parent).dataflow_computed {
            return;
        }
    }
    diag.trace(format!("computing dataflow for {}", graph.node(id).name));
    let parents: Vec<TableNodeId> = graph.node(id).parents.iter().copied().collect();
    for var in variables {
        let mut merged = ValueSet::new();
        for parent in &parents {
            if let Some(flow) = graph.node(*parent).dataflows.get(var) {
                merged.merge(flow);
            }
        }
        graph
            .node_mut(id)
            .key_dataflows
            .insert(var.clone(), merged.clone());
        if let Some(effect) = graph.node(id).effects.get(var).cloned() {
            merged.transfer(&effect);
        }
        diag.detail(format!("{}: {} = {}", graph.node(id).name, var, merged));
        graph.node_mut(id).dataflows.insert(var.clone(), merged);
    }
    graph.node_mut(id).dataflow_computed = true;
    let children: Vec<TableNodeId> = graph.node(id).children.iter().copied().collect();
    for child in children {
        solve_node(graph, child, variables, diag);
    }
}

/// Build the table-flow DAG over already-collected summaries and solve it.
pub fn build_table_flow(
    prog: &Program,
    graph: &mut TableFlowGraph,
    actions: &BTreeMap<String, FuncInfo>,
    diag: &Diagnostics,
) -> Result<BTreeSet<String>, MidendError> {
    BuildTableFlow::new(graph, actions, diag).run(prog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_node_exists_and_is_addressable() {
        let graph = TableFlowGraph::new();
        assert_eq!(graph.node(graph.start()).name, "start");
        assert_eq!(graph.lookup("start"), Some(graph.start()));
    }

    #[test]
    fn node_id_is_create_or_fetch() {
        let mut graph = TableFlowGraph::new();
        let a = graph.node_id("t0");
        let b = graph.node_id("t0");
        assert_eq!(a, b);
        assert_eq!(graph.node(a).name, "t0");
    }
}
