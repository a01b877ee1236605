pub mod diag;
pub mod ir;
pub mod midend;

// Re-export the pass entry points
pub use midend::{common_headers, detect_copy_variables, hoist_harmless};
pub use midend::{CommoningParser, CopyVariableDetection, HarmlessTableHoisting};

// Re-export the pieces callers thread between passes
pub use diag::{DiagLevel, Diagnostics};
pub use midend::copydetect::CopyReport;
pub use midend::errors::MidendError;
