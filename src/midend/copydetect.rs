//! Copy-candidate detection: walks every expression observed by a table (or
//! by the parser pseudo-table) and classifies metadata variables against the
//! solved lattice. A variable survives as a candidate only if every
//! observation sees the same single source field, possibly alongside the
//! initial token.

use std::collections::{BTreeMap, BTreeSet};

use crate::diag::Diagnostics;
use crate::ir::visit::{walk_program, Ctx, Inspector};
use crate::ir::{variable_name, Expression, P, Program};
use crate::midend::errors::MidendError;
use crate::midend::summary::PARSER_TABLE;
use crate::midend::tableflow::TableFlowGraph;

/// The set of metadata variables that are provably copies of a single source
/// field at every observation point, with that source.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CopyReport {
    pub candidates: BTreeMap<String, String>,
}

impl CopyReport {
    pub fn is_candidate(&self, var: &str) -> bool {
        self.candidates.contains_key(var)
    }

    pub fn source_of(&self, var: &str) -> Option<&str> {
        self.candidates.get(var).map(String::as_str)
    }
}

pub struct DetectCopy<'a> {
    graph: &'a TableFlowGraph,
    diag: &'a Diagnostics,
    candidates: BTreeMap<String, String>,
    non_candidates: BTreeSet<String>,
}

impl<'a> DetectCopy<'a> {
    pub fn new(graph: &'a TableFlowGraph, diag: &'a Diagnostics) -> Self {
        DetectCopy {
            graph,
            diag,
            candidates: BTreeMap::new(),
            non_candidates: BTreeSet::new(),
        }
    }

    pub fn run(mut self, prog: &Program) -> Result<CopyReport, MidendError> {
        walk_program(&mut self, prog)?;
        for (var, src) in &self.candidates {
            self.diag.summary(format!("copy candidate {} = {}", var, src));
        }
        Ok(CopyReport {
            candidates: self.candidates,
        })
    }

    fn observe(&mut self, var: String, source: Option<&str>) {
        match source {
            Some(src) => {
                if self.non_candidates.contains(&var) {
                    return;
                }
                match self.candidates.get(&var) {
                    // Two observations proposing different sources cannot
                    // both be substituted; the variable is no copy.
                    Some(existing) if existing != src => {
                        self.candidates.remove(&var);
                        self.non_candidates.insert(var);
                    }
                    Some(_) => {}
                    None => {
                        self.candidates.insert(var, src.to_string());
                    }
                }
            }
            None => {
                self.candidates.remove(&var);
                self.non_candidates.insert(var);
            }
        }
    }
}

impl<'a> Inspector for DetectCopy<'a> {
    fn post_expression(&mut self, expr: &P<Expression>, cx: &Ctx) -> Result<(), MidendError> {
        let table_name = if cx.enclosing_parser().is_some() {
            PARSER_TABLE
        } else {
            match cx.enclosing_table() {
                Some(name) => name,
                None => return Ok(()),
            }
        };
        let id = match self.graph.lookup(table_name) {
            Some(id) => id,
            None => return Ok(()),
        };
        let var = match variable_name(expr) {
            Some(name) => name,
            None => return Ok(()),
        };
        if !var.starts_with("meta") {
            return Ok(());
        }

        let node = self.graph.node(id);
        let flow = if cx.in_key_element() && node.key_dataflows.contains_key(&var) {
            node.key_dataflows.get(&var)
        } else {
            node.dataflows.get(&var)
        };
        let flow = match flow {
            Some(flow) => flow,
            None => return Ok(()),
        };
        self.diag
            .trace(format!("{}: {} observes {}", node.name, var, flow));
        let source = flow.copy_source().map(str::to_string);
        self.observe(var, source.as_deref());
        Ok(())
    }
}

/// Run copy detection against a solved table-flow graph.
pub fn detect_copies(
    prog: &Program,
    graph: &TableFlowGraph,
    diag: &Diagnostics,
) -> Result<CopyReport, MidendError> {
    DetectCopy::new(graph, diag).run(prog)
}
