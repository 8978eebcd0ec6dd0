//! Net integration
//!
//! Weaves the per-department nets into one integrated net: a namespace copy
//! with `dept:` prefixes, coalescing of synchronization transitions under a
//! shared `SYNC:<label>` name, then injection of `MSG:*` message places and
//! `RES:*` resource places from the collaboration metadata.

use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::discovery::DepartmentNet;
use crate::event_log::CollaborationMetadata;
use crate::petri::{Marking, Node, PetriNet, PlaceId, TransitionId};
use crate::Result;

/// Initial token count given to a resource place at integration time.
pub const DEFAULT_RESOURCE_CAPACITY: u64 = 1;

/// Prefix helpers shared with diagnosis and repair.
pub fn message_place_name(msg_id: &str) -> String {
    format!("MSG:{}", msg_id)
}

pub fn resource_place_name(res_id: &str) -> String {
    format!("RES:{}", res_id)
}

pub fn sync_transition_name(label: &str) -> String {
    format!("SYNC:{}", label)
}

/// Merges the department nets and injects the collaboration structure.
///
/// Department iteration follows the given (sorted) order, which fixes the
/// tie-breaking of sync coalescing. Labels named by the metadata but absent
/// from every department net are ignored; duplicate arcs are skipped.
pub fn integrate(
    dept_nets: &[DepartmentNet],
    metadata: &CollaborationMetadata,
) -> Result<(PetriNet, Marking, Marking)> {
    let sync_tasks: HashSet<&str> = metadata.sync_tasks.iter().map(String::as_str).collect();

    let mut net = PetriNet::new("integrated");
    let mut im = Marking::new();
    let mut fm = Marking::new();

    for dept in dept_nets {
        let mut place_map: HashMap<PlaceId, PlaceId> = HashMap::new();
        let mut trans_map: HashMap<TransitionId, TransitionId> = HashMap::new();

        for (old_id, place) in dept.net.places() {
            let new_id = net.add_place(format!("{}:{}", dept.department, place.name))?;
            place_map.insert(old_id, new_id);

            let initial = dept.initial_marking.tokens(old_id);
            if initial > 0 {
                im.set(new_id, initial);
            }
            let fin = dept.final_marking.tokens(old_id);
            if fin > 0 {
                fm.set(new_id, fin);
            }
        }

        for (old_id, transition) in dept.net.transitions() {
            let sync_label = transition
                .label
                .as_deref()
                .filter(|label| sync_tasks.contains(label));

            let new_id = match sync_label {
                Some(label) => {
                    let name = sync_transition_name(label);
                    match net.transition_by_name(&name) {
                        Some(existing) => existing,
                        None => net.add_transition(name, Some(label))?,
                    }
                }
                None => net.add_transition(
                    format!("{}:{}", dept.department, transition.name),
                    transition.label.as_deref(),
                )?,
            };
            trans_map.insert(old_id, new_id);
        }

        for arc in dept.net.arcs() {
            let source = map_node(arc.source, &place_map, &trans_map);
            let target = map_node(arc.target, &place_map, &trans_map);
            net.add_arc(source, target)?;
        }
    }

    for (msg_id, endpoints) in &metadata.messages {
        let place = net.add_place(message_place_name(msg_id))?;
        if let Some(sender) = &endpoints.sender {
            for t in net.transitions_with_label(sender) {
                net.add_arc(Node::Transition(t), Node::Place(place))?;
            }
        }
        if let Some(receiver) = &endpoints.receiver {
            for t in net.transitions_with_label(receiver) {
                net.add_arc(Node::Place(place), Node::Transition(t))?;
            }
        }
    }

    for (res_id, usage) in &metadata.resources {
        let place = net.add_place(resource_place_name(res_id))?;
        im.set(place, DEFAULT_RESOURCE_CAPACITY);

        for task in &usage.requested_by {
            for t in net.transitions_with_label(task) {
                net.add_arc(Node::Place(place), Node::Transition(t))?;
            }
        }
        for task in &usage.released_by {
            for t in net.transitions_with_label(task) {
                net.add_arc(Node::Transition(t), Node::Place(place))?;
            }
        }
    }

    debug!(
        places = net.stats().places,
        transitions = net.stats().transitions,
        arcs = net.stats().arcs,
        "integrated net assembled"
    );
    Ok((net, im, fm))
}

fn map_node(
    node: Node,
    place_map: &HashMap<PlaceId, PlaceId>,
    trans_map: &HashMap<TransitionId, TransitionId>,
) -> Node {
    match node {
        Node::Place(p) => Node::Place(place_map[&p]),
        Node::Transition(t) => Node::Transition(trans_map[&t]),
    }
}
