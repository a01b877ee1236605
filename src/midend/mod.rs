//! Midend passes over the pipeline IR. Two independent pass managers thread
//! shared summary maps between their passes in a fixed order, the way the
//! surrounding compiler drives every midend stage: each either completes
//! cleanly or aborts the compilation with a `MidendError`.

use std::collections::{BTreeMap, BTreeSet};

use crate::diag::Diagnostics;
use crate::ir::{P, Program};

pub mod commoning;
pub mod copydetect;
pub mod dataflow;
pub mod errors;
pub mod hoist;
pub mod summary;
pub mod tableflow;

use copydetect::CopyReport;
use errors::MidendError;
use summary::FuncInfo;
use tableflow::TableFlowGraph;

/// Declaration names must be globally unique before any midend pass runs;
/// the uniquification pass upstream guarantees it, this check catches a
/// pipeline that skipped it.
fn check_preconditions(prog: &Program) -> Result<(), MidendError> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for decl in &prog.declarations {
        if !seen.insert(decl.name()) {
            return Err(MidendError::DuplicateDeclaration(decl.name().to_string()));
        }
    }
    Ok(())
}

/// Copy-candidate detection: summary extraction, table-flow construction
/// with the dataflow solver, then copy classification.
pub struct CopyVariableDetection<'a> {
    diag: &'a Diagnostics,
    graph: TableFlowGraph,
    actions: BTreeMap<String, FuncInfo>,
}

impl<'a> CopyVariableDetection<'a> {
    pub fn new(diag: &'a Diagnostics) -> Self {
        CopyVariableDetection {
            diag,
            graph: TableFlowGraph::new(),
            actions: BTreeMap::new(),
        }
    }

    pub fn run(mut self, prog: &P<Program>) -> Result<CopyReport, MidendError> {
        check_preconditions(prog)?;
        summary::extract_summaries(prog, &mut self.graph, &mut self.actions, self.diag)?;
        tableflow::build_table_flow(prog, &mut self.graph, &self.actions, self.diag)?;
        copydetect::detect_copies(prog, &self.graph, self.diag)
    }
}

/// Harmless-table hoisting: the same analyses, then the lifting transform.
pub struct HarmlessTableHoisting<'a> {
    diag: &'a Diagnostics,
}

impl<'a> HarmlessTableHoisting<'a> {
    pub fn new(diag: &'a Diagnostics) -> Self {
        HarmlessTableHoisting { diag }
    }

    pub fn run(self, prog: &P<Program>) -> Result<P<Program>, MidendError> {
        check_preconditions(prog)?;
        let mut graph = TableFlowGraph::new();
        let mut actions = BTreeMap::new();
        summary::extract_summaries(prog, &mut graph, &mut actions, self.diag)?;
        tableflow::build_table_flow(prog, &mut graph, &actions, self.diag)?;
        hoist::hoist_harmless_tables(prog, &graph, &actions, self.diag)
    }
}

/// Parser header commoning.
pub struct CommoningParser<'a> {
    diag: &'a Diagnostics,
}

impl<'a> CommoningParser<'a> {
    pub fn new(diag: &'a Diagnostics) -> Self {
        CommoningParser { diag }
    }

    pub fn run(self, prog: &P<Program>) -> Result<P<Program>, MidendError> {
        check_preconditions(prog)?;
        commoning::common_parser_headers(prog, self.diag)
    }
}

/// One-call conveniences mirroring the pass managers.
pub fn detect_copy_variables(
    prog: &P<Program>,
    diag: &Diagnostics,
) -> Result<CopyReport, MidendError> {
    CopyVariableDetection::new(diag).run(prog)
}

pub fn hoist_harmless(prog: &P<Program>, diag: &Diagnostics) -> Result<P<Program>, MidendError> {
    HarmlessTableHoisting::new(diag).run(prog)
}

pub fn common_headers(prog: &P<Program>, diag: &Diagnostics) -> Result<P<Program>, MidendError> {
    CommoningParser::new(diag).run(prog)
}
