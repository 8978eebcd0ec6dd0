//! Structural defect diagnosis
//!
//! Checks the integrated net against the collaboration metadata and
//! enumerates defects in three families: messages, resources and
//! synchronization. Diagnosis never repairs; its output feeds the repair
//! operators.

use serde::{Deserialize, Serialize};

use crate::event_log::CollaborationMetadata;
use crate::integration::{message_place_name, resource_place_name};
use crate::petri::{Node, PetriNet};

/// One structural defect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Defect {
    MissingMessagePlace {
        message: String,
        description: String,
    },
    MissingSendArc {
        message: String,
        task: String,
        description: String,
    },
    MissingRecvArc {
        message: String,
        task: String,
        description: String,
    },
    MissingResourcePlace {
        resource: String,
        description: String,
    },
    MissingReqArc {
        resource: String,
        task: String,
        description: String,
    },
    MissingRelArc {
        resource: String,
        task: String,
        description: String,
    },
    MissingSyncTask {
        task: String,
        description: String,
    },
    DuplicateSyncTask {
        task: String,
        count: usize,
        description: String,
    },
}

impl Defect {
    pub fn description(&self) -> &str {
        match self {
            Defect::MissingMessagePlace { description, .. }
            | Defect::MissingSendArc { description, .. }
            | Defect::MissingRecvArc { description, .. }
            | Defect::MissingResourcePlace { description, .. }
            | Defect::MissingReqArc { description, .. }
            | Defect::MissingRelArc { description, .. }
            | Defect::MissingSyncTask { description, .. }
            | Defect::DuplicateSyncTask { description, .. } => description,
        }
    }
}

/// Defects grouped by family
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub message_defects: Vec<Defect>,
    pub resource_defects: Vec<Defect>,
    pub sync_defects: Vec<Defect>,
}

impl Diagnosis {
    pub fn total(&self) -> usize {
        self.message_defects.len() + self.resource_defects.len() + self.sync_defects.len()
    }

    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} defects ({} message, {} resource, {} sync)",
            self.total(),
            self.message_defects.len(),
            self.resource_defects.len(),
            self.sync_defects.len()
        )
    }
}

/// Enumerates all structural defects of the net with respect to the
/// metadata. Endpoint activities that label no transition in the net are
/// ignored, matching the integration policy.
pub fn diagnose(net: &PetriNet, metadata: &CollaborationMetadata) -> Diagnosis {
    Diagnosis {
        message_defects: diagnose_messages(net, metadata),
        resource_defects: diagnose_resources(net, metadata),
        sync_defects: diagnose_sync(net, metadata),
    }
}

fn diagnose_messages(net: &PetriNet, metadata: &CollaborationMetadata) -> Vec<Defect> {
    let mut defects = Vec::new();

    for (msg_id, endpoints) in &metadata.messages {
        let place_name = message_place_name(msg_id);
        let Some(place) = net.place_by_name(&place_name) else {
            defects.push(Defect::MissingMessagePlace {
                message: msg_id.clone(),
                description: format!("message place {} does not exist", place_name),
            });
            continue;
        };

        if let Some(sender) = &endpoints.sender {
            let senders = net.transitions_with_label(sender);
            if !senders.is_empty()
                && senders
                    .iter()
                    .any(|&t| !net.has_arc(Node::Transition(t), Node::Place(place)))
            {
                defects.push(Defect::MissingSendArc {
                    message: msg_id.clone(),
                    task: sender.clone(),
                    description: format!(
                        "message {} lacks send arc {} -> {}",
                        msg_id, sender, place_name
                    ),
                });
            }
        }
        if let Some(receiver) = &endpoints.receiver {
            let receivers = net.transitions_with_label(receiver);
            if !receivers.is_empty()
                && receivers
                    .iter()
                    .any(|&t| !net.has_arc(Node::Place(place), Node::Transition(t)))
            {
                defects.push(Defect::MissingRecvArc {
                    message: msg_id.clone(),
                    task: receiver.clone(),
                    description: format!(
                        "message {} lacks receive arc {} -> {}",
                        msg_id, place_name, receiver
                    ),
                });
            }
        }
    }
    defects
}

fn diagnose_resources(net: &PetriNet, metadata: &CollaborationMetadata) -> Vec<Defect> {
    let mut defects = Vec::new();

    for (res_id, usage) in &metadata.resources {
        let place_name = resource_place_name(res_id);
        let Some(place) = net.place_by_name(&place_name) else {
            defects.push(Defect::MissingResourcePlace {
                resource: res_id.clone(),
                description: format!("resource place {} does not exist", place_name),
            });
            continue;
        };

        for task in &usage.requested_by {
            let transitions = net.transitions_with_label(task);
            if !transitions.is_empty()
                && transitions
                    .iter()
                    .any(|&t| !net.has_arc(Node::Place(place), Node::Transition(t)))
            {
                defects.push(Defect::MissingReqArc {
                    resource: res_id.clone(),
                    task: task.clone(),
                    description: format!(
                        "resource {} lacks request arc {} -> {}",
                        res_id, place_name, task
                    ),
                });
            }
        }
        for task in &usage.released_by {
            let transitions = net.transitions_with_label(task);
            if !transitions.is_empty()
                && transitions
                    .iter()
                    .any(|&t| !net.has_arc(Node::Transition(t), Node::Place(place)))
            {
                defects.push(Defect::MissingRelArc {
                    resource: res_id.clone(),
                    task: task.clone(),
                    description: format!(
                        "resource {} lacks release arc {} -> {}",
                        res_id, task, place_name
                    ),
                });
            }
        }
    }
    defects
}

fn diagnose_sync(net: &PetriNet, metadata: &CollaborationMetadata) -> Vec<Defect> {
    let mut defects = Vec::new();

    for task in &metadata.sync_tasks {
        let matching = net.transitions_with_label(task);
        match matching.len() {
            0 => defects.push(Defect::MissingSyncTask {
                task: task.clone(),
                description: format!("sync task {} is absent from the model", task),
            }),
            1 => {}
            count => defects.push(Defect::DuplicateSyncTask {
                task: task.clone(),
                count,
                description: format!(
                    "sync task {} appears as {} transitions, expected one",
                    task, count
                ),
            }),
        }
    }
    defects
}
