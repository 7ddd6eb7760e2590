//! Engine modules: the coordinator that turns registered units into applied
//! ledger entries.

pub mod manager;

pub use manager::{
    BatchReport, BeforeBatchHook, ExecutionResult, HaltReason, MigrationManager, OperatorBlock,
    ValidationReport,
};
