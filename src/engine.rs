//! CMIP-IMR pipeline
//!
//! Ties the components together: ingestion, per-department discovery,
//! integration, evaluation, diagnosis and CE-PNR repair. The result bundles
//! the initial model N0, the best repaired model N1, and everything needed
//! to explain how N1 was reached.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::diagnosis::{diagnose, Diagnosis};
use crate::discovery::{discover_department_nets, DiscoveryOracle, InductiveMiner};
use crate::evaluation::{evaluate_model, Metrics};
use crate::event_log::{CollaborationMetadata, EventLog};
use crate::ingest::load_and_prepare;
use crate::integration::integrate;
use crate::petri::{Marking, PetriNet};
use crate::repair::{run_ce_pnr, CePnrOptions, RepairReport};
use crate::Result;

/// Engine configuration with the published defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmipImrOptions {
    /// Inductive-miner noise threshold, in `[0, 0.5]`
    pub noise_threshold: f64,

    /// F-measure at which repair stops
    pub target_f_measure: f64,

    /// Upper bound on CE-PNR iterations
    pub max_iterations: usize,

    /// Allow dropping resource constraints when fitness is low
    pub remove_resources_if_low_fitness: bool,

    /// Fitness below which resource removal is considered
    pub fitness_threshold: f64,
}

impl Default for CmipImrOptions {
    fn default() -> Self {
        Self {
            noise_threshold: 0.2,
            target_f_measure: 0.95,
            max_iterations: 3,
            remove_resources_if_low_fitness: true,
            fitness_threshold: 0.8,
        }
    }
}

impl CmipImrOptions {
    pub fn with_noise_threshold(mut self, value: f64) -> Self {
        self.noise_threshold = value;
        self
    }

    pub fn with_target_f_measure(mut self, value: f64) -> Self {
        self.target_f_measure = value;
        self
    }

    pub fn with_max_iterations(mut self, value: usize) -> Self {
        self.max_iterations = value;
        self
    }

    pub fn with_remove_resources_if_low_fitness(mut self, value: bool) -> Self {
        self.remove_resources_if_low_fitness = value;
        self
    }

    pub fn with_fitness_threshold(mut self, value: f64) -> Self {
        self.fitness_threshold = value;
        self
    }

    fn ce_pnr(&self) -> CePnrOptions {
        CePnrOptions {
            target_f_measure: self.target_f_measure,
            max_iterations: self.max_iterations,
            remove_resources_if_low_fitness: self.remove_resources_if_low_fitness,
            fitness_threshold: self.fitness_threshold,
        }
    }
}

/// A net with its markings and quality measures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub net: PetriNet,
    pub initial_marking: Marking,
    pub final_marking: Marking,
    pub metrics: Metrics,
}

/// Full engine output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmipImrResult {
    /// Initial integrated model
    pub n0: ModelSnapshot,

    /// Best model after repair (never worse than N0)
    pub n1: ModelSnapshot,

    pub metadata: CollaborationMetadata,
    pub diagnosis: Diagnosis,

    /// Operator pass that produced N1, if repair improved on N0
    pub repair_report: Option<RepairReport>,

    /// CE-PNR iterations actually run
    pub iterations: usize,
}

impl CmipImrResult {
    /// Human-readable summary of the run.
    pub fn verification_report(&self) -> String {
        let mut lines = vec![
            "CMIP-IMR verification report".to_string(),
            String::new(),
            format!(
                "log: {} cases, {} events, departments: {}",
                self.metadata.total_cases,
                self.metadata.total_events,
                self.metadata.departments.join(", ")
            ),
            format!(
                "collaboration: {} sync tasks, {} messages, {} resources",
                self.metadata.sync_tasks.len(),
                self.metadata.messages.len(),
                self.metadata.resources.len()
            ),
            format!("diagnosis: {}", self.diagnosis.summary()),
            String::new(),
            format!("N0: {}", self.n0.metrics.summary()),
            format!("N1: {}", self.n1.metrics.summary()),
            format!(
                "improvement: fitness {:+.4}, precision {:+.4}, f-measure {:+.4}",
                self.n1.metrics.fitness - self.n0.metrics.fitness,
                self.n1.metrics.precision - self.n0.metrics.precision,
                self.n1.metrics.f_measure - self.n0.metrics.f_measure
            ),
            format!("iterations: {}", self.iterations),
        ];

        match &self.repair_report {
            Some(report) => {
                lines.push(format!(
                    "repairs: {} ({} message, {} resource, {} capacity, {} sync)",
                    report.total_repairs,
                    report.message_repairs,
                    report.resource_repairs,
                    report.capacity_repairs,
                    report.sync_repairs
                ));
                for action in &report.actions {
                    lines.push(format!("  - {}", action));
                }
            }
            None => lines.push("repairs: none improved on N0".to_string()),
        }
        lines.join("\n")
    }
}

/// Runs the full pipeline on a CSV log with the built-in miner.
pub fn run_cmip_imr(log_path: &Path, options: &CmipImrOptions) -> Result<CmipImrResult> {
    run_cmip_imr_with_oracle(log_path, options, &InductiveMiner::new())
}

/// Runs the full pipeline on a CSV log with a caller-supplied oracle.
pub fn run_cmip_imr_with_oracle(
    log_path: &Path,
    options: &CmipImrOptions,
    oracle: &dyn DiscoveryOracle,
) -> Result<CmipImrResult> {
    let (log, _) = load_and_prepare(log_path)?;
    run_on_log(log, options, oracle)
}

/// Runs the pipeline on an already-parsed log.
pub fn run_on_log(
    log: EventLog,
    options: &CmipImrOptions,
    oracle: &dyn DiscoveryOracle,
) -> Result<CmipImrResult> {
    let metadata = CollaborationMetadata::from_log(&log);
    info!(
        departments = metadata.departments.len(),
        sync_tasks = metadata.sync_tasks.len(),
        "starting cmip-imr"
    );

    let dept_nets =
        discover_department_nets(&log, &metadata, oracle, options.noise_threshold)?;
    let (n0_net, n0_im, n0_fm) = integrate(&dept_nets, &metadata)?;

    let n0_metrics = evaluate_model(&log, &n0_net, &n0_im, &n0_fm);
    info!(n0 = %n0_metrics.summary(), "initial model evaluated");

    let diagnosis = diagnose(&n0_net, &metadata);
    info!(defects = diagnosis.total(), "diagnosis complete");

    let outcome = run_ce_pnr(
        &log,
        &n0_net,
        &n0_im,
        &n0_fm,
        &n0_metrics,
        &metadata,
        &options.ce_pnr(),
    )?;
    info!(
        n1 = %outcome.metrics.summary(),
        iterations = outcome.iterations,
        "repair complete"
    );

    Ok(CmipImrResult {
        n0: ModelSnapshot {
            net: n0_net,
            initial_marking: n0_im,
            final_marking: n0_fm,
            metrics: n0_metrics,
        },
        n1: ModelSnapshot {
            net: outcome.net,
            initial_marking: outcome.initial_marking,
            final_marking: outcome.final_marking,
            metrics: outcome.metrics,
        },
        metadata,
        diagnosis,
        repair_report: outcome.report,
        iterations: outcome.iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = CmipImrOptions::default();
        assert_eq!(options.noise_threshold, 0.2);
        assert_eq!(options.target_f_measure, 0.95);
        assert_eq!(options.max_iterations, 3);
        assert!(options.remove_resources_if_low_fitness);
        assert_eq!(options.fitness_threshold, 0.8);
    }

    #[test]
    fn test_builder_style_options() {
        let options = CmipImrOptions::default()
            .with_noise_threshold(0.1)
            .with_target_f_measure(0.9)
            .with_max_iterations(5)
            .with_remove_resources_if_low_fitness(false)
            .with_fitness_threshold(0.7);
        assert_eq!(options.noise_threshold, 0.1);
        assert_eq!(options.target_f_measure, 0.9);
        assert_eq!(options.max_iterations, 5);
        assert!(!options.remove_resources_if_low_fitness);
        assert_eq!(options.fitness_threshold, 0.7);
    }
}
