//! Leveled diagnostic sink. Passes report what they saw and decided at
//! levels 1-4 (severity decreasing); diagnostics are traceability only and
//! never carry control flow.

use colored::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagLevel {
    /// Nothing at all; the default for tests.
    Silent,
    /// Pass results: copy candidates, synthesized headers, hoisted tables.
    Summary,
    /// Structure dumps: the table-flow graph, per-table summaries.
    Structure,
    /// Per-node traversal traces.
    Trace,
    /// Everything, including per-edge and per-variable detail.
    Detail,
}

impl DiagLevel {
    pub fn from_verbosity(level: u8) -> Self {
        match level {
            0 => DiagLevel::Silent,
            1 => DiagLevel::Summary,
            2 => DiagLevel::Structure,
            3 => DiagLevel::Trace,
            _ => DiagLevel::Detail,
        }
    }

    pub fn should_show(self, target: DiagLevel) -> bool {
        target <= self
    }
}

pub struct Diagnostics {
    level: DiagLevel,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::silent()
    }
}

impl Diagnostics {
    pub fn new(level: DiagLevel) -> Self {
        Self { level }
    }

    pub fn silent() -> Self {
        Self {
            level: DiagLevel::Silent,
        }
    }

    pub fn level(&self) -> DiagLevel {
        self.level
    }

    /// Level-1 result lines.
    pub fn summary(&self, message: impl AsRef<str>) {
        if self.level.should_show(DiagLevel::Summary) {
            println!("{} {}", "midend:".bright_blue().bold(), message.as_ref());
        }
    }

    /// Level-2 structure dumps.
    pub fn structure(&self, message: impl AsRef<str>) {
        if self.level.should_show(DiagLevel::Structure) {
            println!("  {}", message.as_ref());
        }
    }

    /// Level-3 traversal traces.
    pub fn trace(&self, message: impl AsRef<str>) {
        if self.level.should_show(DiagLevel::Trace) {
            println!("    {}", message.as_ref().dimmed());
        }
    }

    /// Level-4 per-variable detail.
    pub fn detail(&self, message: impl AsRef<str>) {
        if self.level.should_show(DiagLevel::Detail) {
            println!("      {}", message.as_ref().dimmed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering_gates_output() {
        assert!(DiagLevel::Structure.should_show(DiagLevel::Summary));
        assert!(!DiagLevel::Summary.should_show(DiagLevel::Structure));
        assert!(!DiagLevel::Silent.should_show(DiagLevel::Summary));
        assert!(DiagLevel::Detail.should_show(DiagLevel::Trace));
    }
}
