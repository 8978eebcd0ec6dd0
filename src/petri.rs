//! Petri net value type
//!
//! Places and transitions are held in id-indexed vectors; removal leaves a
//! tombstone so ids stay stable across structural edits. Arcs reference nodes
//! by id, which makes a deep copy a plain `Clone`. All structural mutation
//! downstream of discovery goes through the methods here.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Structural errors raised by net mutators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PetriNetError {
    #[error("duplicate place name: {0}")]
    DuplicatePlace(String),

    #[error("duplicate transition name: {0}")]
    DuplicateTransition(String),

    #[error("arc must connect a place and a transition")]
    NotBipartite,

    #[error("arc references a node that is not in the net")]
    UnknownNode,
}

/// Stable identifier of a place
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PlaceId(usize);

impl PlaceId {
    /// Raw index, for renderers that need a compact node id.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Stable identifier of a transition
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TransitionId(usize);

impl TransitionId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Either endpoint of an arc
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Node {
    Place(PlaceId),
    Transition(TransitionId),
}

/// A place with a unique name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    pub name: String,
}

/// A transition with a unique name and an optional visible label.
///
/// A transition without a label is silent: it never matches a log activity
/// and may fire freely during replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub name: String,
    pub label: Option<String>,
}

impl Transition {
    pub fn is_silent(&self) -> bool {
        self.label.is_none()
    }
}

/// A directed arc between a place and a transition (either direction)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arc {
    pub source: Node,
    pub target: Node,
}

/// Token assignment over places. Zero-token entries are not stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Marking(BTreeMap<PlaceId, u64>);

impl Marking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens(&self, place: PlaceId) -> u64 {
        self.0.get(&place).copied().unwrap_or(0)
    }

    pub fn set(&mut self, place: PlaceId, count: u64) {
        if count == 0 {
            self.0.remove(&place);
        } else {
            self.0.insert(place, count);
        }
    }

    pub fn add(&mut self, place: PlaceId, count: u64) {
        if count > 0 {
            *self.0.entry(place).or_insert(0) += count;
        }
    }

    /// Removes up to `count` tokens, returning how many were actually taken.
    pub fn take(&mut self, place: PlaceId, count: u64) -> u64 {
        let have = self.tokens(place);
        let taken = have.min(count);
        self.set(place, have - taken);
        taken
    }

    pub fn remove_place(&mut self, place: PlaceId) {
        self.0.remove(&place);
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PlaceId, u64)> + '_ {
        self.0.iter().map(|(p, n)| (*p, *n))
    }

    /// True when `self` covers `other` place-wise.
    pub fn covers(&self, other: &Marking) -> bool {
        other.iter().all(|(p, n)| self.tokens(p) >= n)
    }
}

/// Place / transition / arc counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetStats {
    pub places: usize,
    pub transitions: usize,
    pub arcs: usize,
}

/// A labeled Petri net.
///
/// Invariants maintained by the mutators:
/// - arcs are bipartite (place to transition or transition to place),
/// - node names are unique within their class among live nodes,
/// - at most one arc per ordered (source, target) pair,
/// - removing a node cascades to every arc touching it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PetriNet {
    name: String,
    places: Vec<Option<Place>>,
    transitions: Vec<Option<Transition>>,
    arcs: Vec<Arc>,
}

impl PetriNet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            places: Vec::new(),
            transitions: Vec::new(),
            arcs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn add_place(&mut self, name: impl Into<String>) -> Result<PlaceId, PetriNetError> {
        let name = name.into();
        if self.place_by_name(&name).is_some() {
            return Err(PetriNetError::DuplicatePlace(name));
        }
        self.places.push(Some(Place { name }));
        Ok(PlaceId(self.places.len() - 1))
    }

    pub fn add_transition(
        &mut self,
        name: impl Into<String>,
        label: Option<&str>,
    ) -> Result<TransitionId, PetriNetError> {
        let name = name.into();
        if self.transition_by_name(&name).is_some() {
            return Err(PetriNetError::DuplicateTransition(name));
        }
        self.transitions.push(Some(Transition {
            name,
            label: label.map(str::to_owned),
        }));
        Ok(TransitionId(self.transitions.len() - 1))
    }

    /// Adds an arc. Returns `Ok(false)` when an identical arc already exists
    /// (the duplicate is skipped), `Ok(true)` when the arc was added.
    pub fn add_arc(&mut self, source: Node, target: Node) -> Result<bool, PetriNetError> {
        match (source, target) {
            (Node::Place(p), Node::Transition(t)) | (Node::Transition(t), Node::Place(p)) => {
                if self.place(p).is_none() || self.transition(t).is_none() {
                    return Err(PetriNetError::UnknownNode);
                }
            }
            _ => return Err(PetriNetError::NotBipartite),
        }
        if self.has_arc(source, target) {
            return Ok(false);
        }
        self.arcs.push(Arc { source, target });
        Ok(true)
    }

    pub fn has_arc(&self, source: Node, target: Node) -> bool {
        self.arcs
            .iter()
            .any(|a| a.source == source && a.target == target)
    }

    pub fn place(&self, id: PlaceId) -> Option<&Place> {
        self.places.get(id.0).and_then(Option::as_ref)
    }

    pub fn transition(&self, id: TransitionId) -> Option<&Transition> {
        self.transitions.get(id.0).and_then(Option::as_ref)
    }

    /// Live places in id order
    pub fn places(&self) -> impl Iterator<Item = (PlaceId, &Place)> {
        self.places
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|p| (PlaceId(i), p)))
    }

    /// Live transitions in id (insertion) order
    pub fn transitions(&self) -> impl Iterator<Item = (TransitionId, &Transition)> {
        self.transitions
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (TransitionId(i), t)))
    }

    pub fn arcs(&self) -> impl Iterator<Item = &Arc> {
        self.arcs.iter()
    }

    pub fn place_by_name(&self, name: &str) -> Option<PlaceId> {
        self.places().find(|(_, p)| p.name == name).map(|(id, _)| id)
    }

    pub fn transition_by_name(&self, name: &str) -> Option<TransitionId> {
        self.transitions()
            .find(|(_, t)| t.name == name)
            .map(|(id, _)| id)
    }

    /// All transitions carrying the given visible label, in insertion order.
    pub fn transitions_with_label(&self, label: &str) -> Vec<TransitionId> {
        self.transitions()
            .filter(|(_, t)| t.label.as_deref() == Some(label))
            .map(|(id, _)| id)
            .collect()
    }

    /// Removes a place and every arc touching it.
    pub fn remove_place(&mut self, id: PlaceId) {
        if self.place(id).is_none() {
            return;
        }
        let node = Node::Place(id);
        self.arcs.retain(|a| a.source != node && a.target != node);
        self.places[id.0] = None;
    }

    /// Removes a transition and every arc touching it.
    pub fn remove_transition(&mut self, id: TransitionId) {
        if self.transition(id).is_none() {
            return;
        }
        let node = Node::Transition(id);
        self.arcs.retain(|a| a.source != node && a.target != node);
        self.transitions[id.0] = None;
    }

    pub fn in_arcs(&self, node: Node) -> impl Iterator<Item = &Arc> {
        self.arcs.iter().filter(move |a| a.target == node)
    }

    pub fn out_arcs(&self, node: Node) -> impl Iterator<Item = &Arc> {
        self.arcs.iter().filter(move |a| a.source == node)
    }

    /// Input places of a transition, in arc insertion order.
    pub fn preset(&self, t: TransitionId) -> Vec<PlaceId> {
        self.in_arcs(Node::Transition(t))
            .filter_map(|a| match a.source {
                Node::Place(p) => Some(p),
                Node::Transition(_) => None,
            })
            .collect()
    }

    /// Output places of a transition, in arc insertion order.
    pub fn postset(&self, t: TransitionId) -> Vec<PlaceId> {
        self.out_arcs(Node::Transition(t))
            .filter_map(|a| match a.target {
                Node::Place(p) => Some(p),
                Node::Transition(_) => None,
            })
            .collect()
    }

    /// True when every marked place exists in the net.
    pub fn contains_marking(&self, marking: &Marking) -> bool {
        marking.iter().all(|(p, _)| self.place(p).is_some())
    }

    pub fn stats(&self) -> NetStats {
        NetStats {
            places: self.places().count(),
            transitions: self.transitions().count(),
            arcs: self.arcs.len(),
        }
    }

    /// Explicit deep copy. Node identity is positional, so a structural clone
    /// reproduces the full reference graph.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    /// Label-to-transitions lookup for replay.
    pub(crate) fn label_index(&self) -> HashMap<&str, Vec<TransitionId>> {
        let mut index: HashMap<&str, Vec<TransitionId>> = HashMap::new();
        for (id, t) in self.transitions() {
            if let Some(label) = t.label.as_deref() {
                index.entry(label).or_default().push(id);
            }
        }
        index
    }

    /// Silent transitions in insertion order.
    pub(crate) fn silent_transitions(&self) -> Vec<TransitionId> {
        self.transitions()
            .filter(|(_, t)| t.is_silent())
            .map(|(id, _)| id)
            .collect()
    }
}
