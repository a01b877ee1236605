//! Errors raised by the midend passes. Every kind is fatal: a pass either
//! completes cleanly or aborts the compilation with one of these.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidendError {
    // Invariant violations (internal bug checks)
    CorruptTableState {
        active: String,
        entered: String,
    },
    CorruptActionState {
        active: String,
        entered: String,
    },
    BackEdge {
        from: String,
        to: String,
    },
    SelfLoop(String),
    EmptyConditionalStack(String),

    // Precondition failures (the upstream pipeline did not run)
    DuplicateDeclaration(String),
    MissingParser,
    UnknownAction {
        table: String,
        action: String,
    },
    UnknownTable(String),

    // Reserved-name collisions
    ReservedHeaderName(String),
}

impl std::fmt::Display for MidendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type(), self.message())
    }
}

impl std::error::Error for MidendError {}

impl MidendError {
    /// Get the error type name for display purposes
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::CorruptTableState { .. } => "CorruptTableState",
            Self::CorruptActionState { .. } => "CorruptActionState",
            Self::BackEdge { .. } => "BackEdge",
            Self::SelfLoop(_) => "SelfLoop",
            Self::EmptyConditionalStack(_) => "EmptyConditionalStack",
            Self::DuplicateDeclaration(_) => "DuplicateDeclaration",
            Self::MissingParser => "MissingParser",
            Self::UnknownAction { .. } => "UnknownAction",
            Self::UnknownTable(_) => "UnknownTable",
            Self::ReservedHeaderName(_) => "ReservedHeaderName",
        }
    }

    /// Get the error message without the type prefix
    pub fn message(&self) -> String {
        match self {
            Self::CorruptTableState { active, entered } => format!(
                "entered table '{}' while table '{}' is still being summarized",
                entered, active
            ),
            Self::CorruptActionState { active, entered } => format!(
                "entered action '{}' while action '{}' is still being summarized",
                entered, active
            ),
            Self::BackEdge { from, to } => format!(
                "table flow edge '{}' -> '{}' reaches back to a shallower node",
                from, to
            ),
            Self::SelfLoop(name) => {
                format!("table '{}' applied as its own immediate successor", name)
            }
            Self::EmptyConditionalStack(table) => format!(
                "table '{}' is flagged conditional but no conditional is open",
                table
            ),
            Self::DuplicateDeclaration(name) => format!(
                "declaration name '{}' is not globally unique; run name uniquification first",
                name
            ),
            Self::MissingParser => "program declares no parser".to_string(),
            Self::UnknownAction { table, action } => format!(
                "table '{}' lists action '{}' but no such action was summarized",
                table, action
            ),
            Self::UnknownTable(name) => format!("no table named '{}' in the flow graph", name),
            Self::ReservedHeaderName(name) => format!(
                "header name '{}' contains the reserved substring '_common_'",
                name
            ),
        }
    }
}
