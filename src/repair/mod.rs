//! Heuristic source repairs run against a materialized tree before the build.

pub mod deps;
pub mod exports;

pub use deps::{DependencyReconciler, ReconcileOutcome};
pub use exports::{ExportContractFixer, FixReport};
