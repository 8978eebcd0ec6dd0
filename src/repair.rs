//! Constraint-Enhanced Petri Net Repair (CE-PNR)
//!
//! Idempotent structural operators plus the fixed-point loop that applies
//! them toward a target F-measure. Every pass works on a deep copy; the
//! input net is never mutated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::event_log::{CollaborationMetadata, EventLog, MessageEndpoints, ResourceUsage};
use crate::evaluation::{evaluate_model, Metrics};
use crate::integration::{message_place_name, resource_place_name};
use crate::petri::{Marking, Node, PetriNet, PlaceId};
use crate::Result;

/// Minimal F-measure improvement considered worth another iteration.
const MIN_F_IMPROVEMENT: f64 = 0.005;

/// Loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CePnrOptions {
    pub target_f_measure: f64,
    pub max_iterations: usize,
    pub remove_resources_if_low_fitness: bool,
    pub fitness_threshold: f64,
}

impl Default for CePnrOptions {
    fn default() -> Self {
        Self {
            target_f_measure: 0.95,
            max_iterations: 3,
            remove_resources_if_low_fitness: true,
            fitness_threshold: 0.8,
        }
    }
}

/// What one operator pass did to the net
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub total_repairs: usize,
    pub message_repairs: usize,
    pub resource_repairs: usize,
    pub capacity_repairs: usize,
    pub sync_repairs: usize,
    pub actions: Vec<String>,
    pub remove_resources: bool,
    pub resource_capacity: u64,
}

/// One repaired model candidate
#[derive(Debug, Clone)]
pub struct RepairPass {
    pub net: PetriNet,
    pub initial_marking: Marking,
    pub final_marking: Marking,
    pub report: RepairReport,
}

/// Best model found by the loop
#[derive(Debug, Clone)]
pub struct CePnrOutcome {
    pub net: PetriNet,
    pub initial_marking: Marking,
    pub final_marking: Marking,
    pub metrics: Metrics,
    pub iterations: usize,
    pub report: Option<RepairReport>,
}

/// Creates any missing `MSG:*` place and adds any missing send/receive arc
/// for transitions carrying the endpoint labels.
pub fn repair_message_arcs(
    net: &mut PetriNet,
    messages: &BTreeMap<String, MessageEndpoints>,
) -> Result<Vec<String>> {
    let mut actions = Vec::new();

    for (msg_id, endpoints) in messages {
        let place_name = message_place_name(msg_id);
        let place = match net.place_by_name(&place_name) {
            Some(p) => p,
            None => {
                let p = net.add_place(place_name.as_str())?;
                actions.push(format!("created message place {}", place_name));
                p
            }
        };

        if let Some(sender) = &endpoints.sender {
            for t in net.transitions_with_label(sender) {
                if net.add_arc(Node::Transition(t), Node::Place(place))? {
                    actions.push(format!("added send arc {} -> {}", sender, place_name));
                }
            }
        }
        if let Some(receiver) = &endpoints.receiver {
            for t in net.transitions_with_label(receiver) {
                if net.add_arc(Node::Place(place), Node::Transition(t))? {
                    actions.push(format!("added receive arc {} -> {}", place_name, receiver));
                }
            }
        }
    }
    Ok(actions)
}

/// Creates any missing `RES:*` place (with `capacity` initial tokens) and
/// adds any missing request/release arc.
pub fn repair_resource_arcs(
    net: &mut PetriNet,
    initial_marking: &mut Marking,
    resources: &BTreeMap<String, ResourceUsage>,
    capacity: u64,
) -> Result<Vec<String>> {
    let mut actions = Vec::new();

    for (res_id, usage) in resources {
        let place_name = resource_place_name(res_id);
        let place = match net.place_by_name(&place_name) {
            Some(p) => p,
            None => {
                let p = net.add_place(place_name.as_str())?;
                initial_marking.set(p, capacity);
                actions.push(format!(
                    "created resource place {} (capacity={})",
                    place_name, capacity
                ));
                p
            }
        };

        for task in &usage.requested_by {
            for t in net.transitions_with_label(task) {
                if net.add_arc(Node::Place(place), Node::Transition(t))? {
                    actions.push(format!("added request arc {} -> {}", place_name, task));
                }
            }
        }
        for task in &usage.released_by {
            for t in net.transitions_with_label(task) {
                if net.add_arc(Node::Transition(t), Node::Place(place))? {
                    actions.push(format!("added release arc {} -> {}", task, place_name));
                }
            }
        }
    }
    Ok(actions)
}

fn resource_places(net: &PetriNet) -> Vec<(PlaceId, String)> {
    net.places()
        .filter(|(_, p)| p.name.starts_with("RES:"))
        .map(|(id, p)| (id, p.name.clone()))
        .collect()
}

/// Sets the initial token count of every resource place to `capacity`.
pub fn adjust_resource_capacity(
    net: &PetriNet,
    initial_marking: &mut Marking,
    capacity: u64,
) -> Vec<String> {
    let mut actions = Vec::new();
    for (place, name) in resource_places(net) {
        let old = initial_marking.tokens(place);
        if old != capacity {
            initial_marking.set(place, capacity);
            actions.push(format!(
                "adjusted capacity of {} ({} -> {})",
                name, old, capacity
            ));
        }
    }
    actions
}

/// Deletes every resource place together with its arcs and marking entry.
/// Used when resource scarcity crushes fitness; message constraints stay.
pub fn remove_resource_constraints(
    net: &mut PetriNet,
    initial_marking: &mut Marking,
) -> Vec<String> {
    let mut actions = Vec::new();
    for (place, name) in resource_places(net) {
        net.remove_place(place);
        initial_marking.remove_place(place);
        actions.push(format!("removed resource constraint {}", name));
    }
    actions
}

/// Collapses duplicate transitions of each sync activity onto the first
/// one, redirecting all arcs of the duplicates.
pub fn merge_sync_transitions(net: &mut PetriNet, sync_tasks: &[String]) -> Result<Vec<String>> {
    let mut actions = Vec::new();

    for task in sync_tasks {
        let matching = net.transitions_with_label(task);
        if matching.len() < 2 {
            continue;
        }
        let primary = matching[0];
        for &duplicate in &matching[1..] {
            let sources: Vec<Node> = net
                .in_arcs(Node::Transition(duplicate))
                .map(|a| a.source)
                .collect();
            let targets: Vec<Node> = net
                .out_arcs(Node::Transition(duplicate))
                .map(|a| a.target)
                .collect();
            for source in sources {
                net.add_arc(source, Node::Transition(primary))?;
            }
            for target in targets {
                net.add_arc(Node::Transition(primary), target)?;
            }
            net.remove_transition(duplicate);
        }
        actions.push(format!(
            "merged sync transitions for {} ({} -> 1)",
            task,
            matching.len()
        ));
    }
    Ok(actions)
}

/// One CE-PNR operator pass on a deep copy of the model.
pub fn apply_ce_pnr(
    net: &PetriNet,
    initial_marking: &Marking,
    final_marking: &Marking,
    metadata: &CollaborationMetadata,
    remove_resources: bool,
    resource_capacity: u64,
) -> Result<RepairPass> {
    let mut net = net.deep_copy();
    let mut im = initial_marking.clone();
    let fm = final_marking.clone();

    let message_actions = repair_message_arcs(&mut net, &metadata.messages)?;

    let resource_actions = if remove_resources {
        remove_resource_constraints(&mut net, &mut im)
    } else {
        repair_resource_arcs(&mut net, &mut im, &metadata.resources, resource_capacity)?
    };

    let capacity_actions = if !remove_resources && resource_capacity > 1 {
        adjust_resource_capacity(&net, &mut im, resource_capacity)
    } else {
        Vec::new()
    };

    let sync_actions = merge_sync_transitions(&mut net, &metadata.sync_tasks)?;

    let mut actions = Vec::new();
    actions.extend(message_actions.iter().cloned());
    actions.extend(resource_actions.iter().cloned());
    actions.extend(capacity_actions.iter().cloned());
    actions.extend(sync_actions.iter().cloned());

    let report = RepairReport {
        total_repairs: actions.len(),
        message_repairs: message_actions.len(),
        resource_repairs: resource_actions.len(),
        capacity_repairs: capacity_actions.len(),
        sync_repairs: sync_actions.len(),
        actions,
        remove_resources,
        resource_capacity,
    };

    Ok(RepairPass {
        net,
        initial_marking: im,
        final_marking: fm,
        report,
    })
}

/// The CE-PNR loop: policy selection, operator pass, re-evaluation, and the
/// three stop rules (target reached, diminishing returns, repair no-op).
/// Returns the best model seen; the initial model is the baseline.
pub fn run_ce_pnr(
    log: &EventLog,
    net: &PetriNet,
    initial_marking: &Marking,
    final_marking: &Marking,
    metrics: &Metrics,
    metadata: &CollaborationMetadata,
    options: &CePnrOptions,
) -> Result<CePnrOutcome> {
    let mut current_net = net.deep_copy();
    let mut current_im = initial_marking.clone();
    let mut current_fm = final_marking.clone();
    let mut current_metrics = metrics.clone();

    let mut best = CePnrOutcome {
        net: net.deep_copy(),
        initial_marking: initial_marking.clone(),
        final_marking: final_marking.clone(),
        metrics: metrics.clone(),
        iterations: 0,
        report: None,
    };

    let mut iteration = 0;
    while iteration < options.max_iterations {
        iteration += 1;

        let remove_resources = options.remove_resources_if_low_fitness
            && current_metrics.fitness < options.fitness_threshold;
        let resource_capacity = if !remove_resources && current_metrics.fitness < 0.9 {
            2
        } else {
            1
        };

        let pass = apply_ce_pnr(
            &current_net,
            &current_im,
            &current_fm,
            metadata,
            remove_resources,
            resource_capacity,
        )?;
        let pass_metrics = evaluate_model(log, &pass.net, &pass.initial_marking, &pass.final_marking);

        debug!(
            iteration,
            repairs = pass.report.total_repairs,
            remove_resources,
            resource_capacity,
            f_measure = pass_metrics.f_measure,
            "ce-pnr iteration"
        );

        if pass_metrics.f_measure > best.metrics.f_measure {
            best.net = pass.net.deep_copy();
            best.initial_marking = pass.initial_marking.clone();
            best.final_marking = pass.final_marking.clone();
            best.metrics = pass_metrics.clone();
            best.report = Some(pass.report.clone());
        }

        if pass_metrics.f_measure >= options.target_f_measure {
            info!(iteration, "target f-measure reached");
            break;
        }
        if (pass_metrics.f_measure - current_metrics.f_measure).abs() < MIN_F_IMPROVEMENT {
            info!(iteration, "diminishing returns, stopping");
            break;
        }
        if pass.report.total_repairs == 0
            && pass_metrics.f_measure <= current_metrics.f_measure
        {
            info!(iteration, "repair no-op, stopping");
            break;
        }

        current_net = pass.net;
        current_im = pass.initial_marking;
        current_fm = pass.final_marking;
        current_metrics = pass_metrics;
    }

    best.iterations = iteration;
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::MessageEndpoints;

    fn message_metadata() -> CollaborationMetadata {
        let mut messages = BTreeMap::new();
        messages.insert(
            "m1".to_string(),
            MessageEndpoints {
                sender: Some("A".to_string()),
                receiver: Some("B".to_string()),
            },
        );
        CollaborationMetadata {
            departments: vec!["X".to_string(), "Y".to_string()],
            sync_tasks: vec![],
            messages,
            resources: BTreeMap::new(),
            total_cases: 0,
            total_events: 0,
        }
    }

    fn labeled_net(labels: &[&str]) -> PetriNet {
        let mut net = PetriNet::new("test");
        for &label in labels {
            net.add_transition(format!("t_{}", label), Some(label)).unwrap();
        }
        net
    }

    #[test]
    fn test_repair_message_arcs_creates_structure() {
        let mut net = labeled_net(&["A", "B"]);
        let metadata = message_metadata();

        let actions = repair_message_arcs(&mut net, &metadata.messages).unwrap();
        assert_eq!(actions.len(), 3);

        let place = net.place_by_name("MSG:m1").unwrap();
        let a = net.transitions_with_label("A")[0];
        let b = net.transitions_with_label("B")[0];
        assert!(net.has_arc(Node::Transition(a), Node::Place(place)));
        assert!(net.has_arc(Node::Place(place), Node::Transition(b)));
    }

    #[test]
    fn test_repair_message_arcs_idempotent() {
        let mut net = labeled_net(&["A", "B"]);
        let metadata = message_metadata();

        repair_message_arcs(&mut net, &metadata.messages).unwrap();
        let snapshot = net.deep_copy();
        let second = repair_message_arcs(&mut net, &metadata.messages).unwrap();

        assert!(second.is_empty());
        assert_eq!(net, snapshot);
    }

    #[test]
    fn test_repair_resource_arcs_idempotent() {
        let mut net = labeled_net(&["A", "B"]);
        let mut im = Marking::new();
        let mut resources = BTreeMap::new();
        resources.insert(
            "r1".to_string(),
            ResourceUsage {
                requested_by: vec!["A".to_string()],
                released_by: vec!["B".to_string()],
            },
        );

        let first = repair_resource_arcs(&mut net, &mut im, &resources, 1).unwrap();
        assert_eq!(first.len(), 3);
        let place = net.place_by_name("RES:r1").unwrap();
        assert_eq!(im.tokens(place), 1);

        let snapshot = (net.deep_copy(), im.clone());
        let second = repair_resource_arcs(&mut net, &mut im, &resources, 1).unwrap();
        assert!(second.is_empty());
        assert_eq!((net, im), snapshot);
    }

    #[test]
    fn test_adjust_resource_capacity() {
        let mut net = labeled_net(&[]);
        let res = net.add_place("RES:r1").unwrap();
        let other = net.add_place("regular").unwrap();
        let mut im = Marking::new();
        im.set(res, 1);
        im.set(other, 1);

        let actions = adjust_resource_capacity(&net, &mut im, 3);
        assert_eq!(actions.len(), 1);
        assert_eq!(im.tokens(res), 3);
        assert_eq!(im.tokens(other), 1);

        // second application changes nothing
        assert!(adjust_resource_capacity(&net, &mut im, 3).is_empty());
    }

    #[test]
    fn test_remove_resource_constraints() {
        let mut net = labeled_net(&["A"]);
        let res = net.add_place("RES:r1").unwrap();
        let a = net.transitions_with_label("A")[0];
        net.add_arc(Node::Place(res), Node::Transition(a)).unwrap();
        let mut im = Marking::new();
        im.set(res, 1);

        let actions = remove_resource_constraints(&mut net, &mut im);
        assert_eq!(actions.len(), 1);
        assert!(net.place_by_name("RES:r1").is_none());
        assert_eq!(net.stats().arcs, 0);
        assert!(im.is_empty());

        // idempotent on the already-clean net
        assert!(remove_resource_constraints(&mut net, &mut im).is_empty());
    }

    #[test]
    fn test_merge_sync_transitions() {
        let mut net = PetriNet::new("test");
        let p1 = net.add_place("p1").unwrap();
        let p2 = net.add_place("p2").unwrap();
        let s1 = net.add_transition("X:s", Some("S")).unwrap();
        let s2 = net.add_transition("Y:s", Some("S")).unwrap();
        net.add_arc(Node::Place(p1), Node::Transition(s1)).unwrap();
        net.add_arc(Node::Place(p2), Node::Transition(s2)).unwrap();

        let sync = vec!["S".to_string()];
        let actions = merge_sync_transitions(&mut net, &sync).unwrap();
        assert_eq!(actions.len(), 1);

        let remaining = net.transitions_with_label("S");
        assert_eq!(remaining, vec![s1]);
        assert_eq!(net.preset(s1), vec![p1, p2]);

        // already merged
        assert!(merge_sync_transitions(&mut net, &sync).unwrap().is_empty());
    }

    #[test]
    fn test_apply_ce_pnr_preserves_input() {
        let net = labeled_net(&["A", "B"]);
        let im = Marking::new();
        let fm = Marking::new();
        let metadata = message_metadata();

        let pass = apply_ce_pnr(&net, &im, &fm, &metadata, false, 1).unwrap();
        assert!(pass.net.place_by_name("MSG:m1").is_some());
        // the input net is untouched
        assert!(net.place_by_name("MSG:m1").is_none());
        assert_eq!(pass.report.message_repairs, 3);
        assert_eq!(pass.report.total_repairs, 3);
    }
}
