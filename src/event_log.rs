//! Event log model and collaboration metadata
//!
//! The log is a flat sequence of event records, stable-sorted by case id and
//! timestamp; a case is the contiguous run sharing one case id. Collaboration
//! metadata (departments, synchronization tasks, message and resource
//! relations) is derived from the log once and drives integration, diagnosis
//! and repair.

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::{CmipError, Result};

/// A single event of the collaborative log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Case (process instance) identifier
    pub case_id: String,

    /// Activity name (the `tran` column)
    pub activity: String,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Departments that participated in the event
    pub roles: Vec<String>,

    /// Message ids sent by this event
    pub send_msg: Vec<String>,

    /// Message ids received by this event
    pub recv_msg: Vec<String>,

    /// Resource ids requested by this event
    pub req_res: Vec<String>,

    /// Resource ids released by this event
    pub rel_res: Vec<String>,
}

/// Ordered event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    /// All events, stable-sorted by (case_id, timestamp)
    pub events: Vec<EventRecord>,

    /// Unique case ids, sorted
    pub case_ids: Vec<String>,

    /// Unique activity names, sorted
    pub activities: Vec<String>,
}

impl EventLog {
    /// Builds a log from raw records. Records are stable-sorted by case id
    /// and timestamp, so ties keep their source order.
    pub fn from_events(mut events: Vec<EventRecord>) -> Result<Self> {
        if events.is_empty() {
            return Err(CmipError::Ingestion("event log is empty".to_string()));
        }

        events.sort_by(|a, b| {
            a.case_id
                .cmp(&b.case_id)
                .then(a.timestamp.cmp(&b.timestamp))
        });

        let case_ids: Vec<String> = events
            .iter()
            .map(|e| e.case_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let activities: Vec<String> = events
            .iter()
            .map(|e| e.activity.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Ok(Self {
            events,
            case_ids,
            activities,
        })
    }

    pub fn total_cases(&self) -> usize {
        self.case_ids.len()
    }

    pub fn total_events(&self) -> usize {
        self.events.len()
    }

    /// Per-case traces, in case id order.
    pub fn cases(&self) -> impl Iterator<Item = &[EventRecord]> {
        self.events.chunk_by(|a, b| a.case_id == b.case_id)
    }

    /// Projects the log onto one department: events whose `roles` contain
    /// the department, with per-case ordering preserved. The projection may
    /// be empty.
    pub fn project_department(&self, department: &str) -> EventLog {
        let events: Vec<EventRecord> = self
            .events
            .iter()
            .filter(|e| e.roles.iter().any(|r| r == department))
            .cloned()
            .collect();

        let case_ids: Vec<String> = events
            .iter()
            .map(|e| e.case_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let activities: Vec<String> = events
            .iter()
            .map(|e| e.activity.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        EventLog {
            events,
            case_ids,
            activities,
        }
    }
}

/// Sender and receiver activity of one message id. Either side may be
/// absent for one-sided messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEndpoints {
    pub sender: Option<String>,
    pub receiver: Option<String>,
}

/// Requesting and releasing activities of one resource id, in first-seen
/// order without duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub requested_by: Vec<String>,
    pub released_by: Vec<String>,
}

/// Collaboration structure derived from the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationMetadata {
    /// All department names, sorted
    pub departments: Vec<String>,

    /// Activities where two or more departments participate, sorted
    pub sync_tasks: Vec<String>,

    /// Message id to its endpoints
    pub messages: BTreeMap<String, MessageEndpoints>,

    /// Resource id to its usage
    pub resources: BTreeMap<String, ResourceUsage>,

    pub total_cases: usize,
    pub total_events: usize,
}

impl CollaborationMetadata {
    /// Derives the metadata in one pass over the log.
    ///
    /// Message endpoints are bound to the first-seen activity per message
    /// id; when a later event names a different activity for an already
    /// bound side, the first binding is kept and a warning is emitted.
    pub fn from_log(log: &EventLog) -> Self {
        let mut departments: BTreeSet<String> = BTreeSet::new();
        let mut sync_tasks: BTreeSet<String> = BTreeSet::new();
        let mut send_map: HashMap<String, String> = HashMap::new();
        let mut recv_map: HashMap<String, String> = HashMap::new();
        let mut req_map: HashMap<String, Vec<String>> = HashMap::new();
        let mut rel_map: HashMap<String, Vec<String>> = HashMap::new();

        for event in &log.events {
            departments.extend(event.roles.iter().cloned());
            if event.roles.len() >= 2 {
                sync_tasks.insert(event.activity.clone());
            }

            for msg in &event.send_msg {
                match send_map.get(msg) {
                    None => {
                        send_map.insert(msg.clone(), event.activity.clone());
                    }
                    Some(first) if first != &event.activity => {
                        warn!(
                            message = %msg,
                            first_sender = %first,
                            later_sender = %event.activity,
                            "message id has conflicting senders; keeping first-seen"
                        );
                    }
                    Some(_) => {}
                }
            }
            for msg in &event.recv_msg {
                match recv_map.get(msg) {
                    None => {
                        recv_map.insert(msg.clone(), event.activity.clone());
                    }
                    Some(first) if first != &event.activity => {
                        warn!(
                            message = %msg,
                            first_receiver = %first,
                            later_receiver = %event.activity,
                            "message id has conflicting receivers; keeping first-seen"
                        );
                    }
                    Some(_) => {}
                }
            }

            for res in &event.req_res {
                let tasks = req_map.entry(res.clone()).or_default();
                if !tasks.contains(&event.activity) {
                    tasks.push(event.activity.clone());
                }
            }
            for res in &event.rel_res {
                let tasks = rel_map.entry(res.clone()).or_default();
                if !tasks.contains(&event.activity) {
                    tasks.push(event.activity.clone());
                }
            }
        }

        let mut messages = BTreeMap::new();
        let msg_ids: BTreeSet<&String> = send_map.keys().chain(recv_map.keys()).collect();
        for msg in msg_ids {
            let endpoints = MessageEndpoints {
                sender: send_map.get(msg).cloned(),
                receiver: recv_map.get(msg).cloned(),
            };
            // A message with neither endpoint carries no structure.
            if endpoints.sender.is_some() || endpoints.receiver.is_some() {
                messages.insert(msg.clone(), endpoints);
            }
        }

        let mut resources = BTreeMap::new();
        let res_ids: BTreeSet<&String> = req_map.keys().chain(rel_map.keys()).collect();
        for res in res_ids {
            let usage = ResourceUsage {
                requested_by: req_map.get(res).cloned().unwrap_or_default(),
                released_by: rel_map.get(res).cloned().unwrap_or_default(),
            };
            if !usage.requested_by.is_empty() || !usage.released_by.is_empty() {
                resources.insert(res.clone(), usage);
            }
        }

        Self {
            departments: departments.into_iter().collect(),
            sync_tasks: sync_tasks.into_iter().collect(),
            messages,
            resources,
            total_cases: log.total_cases(),
            total_events: log.total_events(),
        }
    }
}
