//! # CMIP-IMR
//!
//! Constraint-aware Multi-department Inductive Miner with Repair: a
//! cross-department collaborative process mining engine. It consumes an
//! event log in which every event carries a case id, a timestamp, an
//! activity, the participating departments, and the messages and shared
//! resources it touches, and produces an integrated Petri net explaining
//! the log across all departments, together with quality metrics and, if
//! warranted, a repaired net with a higher F-measure.
//!
//! ## Pipeline
//!
//! ```text
//! CSV log
//!     ↓ (ingest)
//! EventLog + CollaborationMetadata
//!     ↓ (per-department discovery, DiscoveryOracle)
//! department nets
//!     ↓ (integration: SYNC merge, MSG:* and RES:* places)
//! N0 + markings
//!     ↓ (evaluation: fitness / precision / F)
//! diagnosis → CE-PNR repair loop → N1
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use cmip_imr::{run_cmip_imr, CmipImrOptions};
//! use std::path::Path;
//!
//! let result = run_cmip_imr(Path::new("log.csv"), &CmipImrOptions::default())?;
//! println!("N0 {}", result.n0.metrics.summary());
//! println!("N1 {}", result.n1.metrics.summary());
//! # Ok::<(), cmip_imr::CmipError>(())
//! ```
//!
//! The inductive-miner collaborator is injectable: anything implementing
//! [`DiscoveryOracle`] (including plain closures) can replace the built-in
//! [`InductiveMiner`], which is how tests substitute deterministic fakes.

pub mod diagnosis;
pub mod discovery;
pub mod engine;
pub mod evaluation;
pub mod event_log;
pub mod export;
pub mod ingest;
pub mod integration;
pub mod petri;
pub mod repair;

pub use diagnosis::{diagnose, Defect, Diagnosis};
pub use discovery::{
    discover_department_nets, DepartmentNet, DiscoveryOracle, InductiveMiner,
};
pub use engine::{
    run_cmip_imr, run_cmip_imr_with_oracle, run_on_log, CmipImrOptions, CmipImrResult,
    ModelSnapshot,
};
pub use evaluation::{evaluate_model, f_measure, Metrics, ReplayDiagnostics};
pub use event_log::{
    CollaborationMetadata, EventLog, EventRecord, MessageEndpoints, ResourceUsage,
};
pub use export::{from_pnml, to_dot, to_pnml};
pub use ingest::{load_and_prepare, load_csv_log};
pub use integration::integrate;
pub use petri::{Arc, Marking, NetStats, Node, PetriNet, PetriNetError, Place, PlaceId, Transition, TransitionId};
pub use repair::{
    adjust_resource_capacity, apply_ce_pnr, merge_sync_transitions, remove_resource_constraints,
    repair_message_arcs, repair_resource_arcs, run_ce_pnr, CePnrOptions, CePnrOutcome,
    RepairPass, RepairReport,
};

use thiserror::Error;

/// Engine errors
#[derive(Error, Debug)]
pub enum CmipError {
    /// Malformed log columns or unparseable timestamps. Fatal.
    #[error("ingestion error: {0}")]
    Ingestion(String),

    /// The inductive-miner oracle failed on a department projection. Fatal.
    #[error("discovery oracle error: {0}")]
    Oracle(String),

    /// Conformance computation failed internally; callers degrade to zero
    /// metrics instead of aborting.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("petri net error: {0}")]
    Net(#[from] petri::PetriNetError),

    #[error("pnml error: {0}")]
    Pnml(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CmipError {
    /// Exit code for the batch front-end: 2 ingestion, 3 oracle failure,
    /// 4 evaluation failure, 1 anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            CmipError::Ingestion(_) | CmipError::Io(_) => 2,
            CmipError::Oracle(_) => 3,
            CmipError::Evaluation(_) => 4,
            _ => 1,
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, CmipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_surface() {
        let _ = InductiveMiner::new();
        let _ = CmipImrOptions::default();
        let _ = PetriNet::new("smoke");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CmipError::Ingestion(String::new()).exit_code(), 2);
        assert_eq!(CmipError::Oracle(String::new()).exit_code(), 3);
        assert_eq!(CmipError::Evaluation(String::new()).exit_code(), 4);
        assert_eq!(CmipError::Pnml(String::new()).exit_code(), 1);
    }
}
