//! Conformance evaluation
//!
//! Token-replay fitness, escaping-edges precision and their harmonic
//! F-measure, computed on the integrated log against the integrated net.
//! The evaluator is read-only on the net: replay works on cloned markings.
//!
//! Precision follows the ETC escaping-edges idea over the log prefix
//! automaton: every prefix of every case (the complete trace included) is a
//! state weighted by its occurrence count; the state value is
//! `1 - |E \ R| / |E|` where `E` are the visible labels enabled in the
//! replayed marking under silent closure and `R` the observed log
//! continuations. States with an empty `E` are skipped.

use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::event_log::{EventLog, EventRecord};
use crate::petri::{Marking, PetriNet, PlaceId, TransitionId};
use crate::CmipError;

/// Bound on the silent-reachability searches: at most this many distinct
/// markings are explored per search.
const SILENT_SEARCH_CAP: usize = 1024;

/// Quality measures of one net against one log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub fitness: f64,
    pub precision: f64,
    pub f_measure: f64,
    pub details: ReplayDiagnostics,
}

impl Metrics {
    /// All-zero metrics carrying an error descriptor.
    pub fn degraded(error: String) -> Self {
        Self {
            fitness: 0.0,
            precision: 0.0,
            f_measure: 0.0,
            details: ReplayDiagnostics {
                error: Some(error),
                ..ReplayDiagnostics::default()
            },
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "fitness {:.4}, precision {:.4}, f-measure {:.4}",
            self.fitness, self.precision, self.f_measure
        )
    }
}

/// Replay side-channel: trace and token totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayDiagnostics {
    pub total_traces: usize,
    pub fitting_traces: usize,
    pub fitting_ratio: f64,
    pub total_consumed: u64,
    pub total_produced: u64,
    pub total_missing: u64,
    pub total_remaining: u64,
    pub error: Option<String>,
}

/// Harmonic mean of fitness and precision; zero when both are zero.
pub fn f_measure(fitness: f64, precision: f64) -> f64 {
    if fitness + precision == 0.0 {
        0.0
    } else {
        2.0 * fitness * precision / (fitness + precision)
    }
}

/// Evaluates the net against the log. Never fails: internal evaluation
/// errors degrade to zero metrics with the error recorded in `details`.
pub fn evaluate_model(log: &EventLog, net: &PetriNet, im: &Marking, fm: &Marking) -> Metrics {
    match replay_and_measure(log, net, im, fm) {
        Ok(metrics) => metrics,
        Err(e) => Metrics::degraded(e.to_string()),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TokenCounts {
    consumed: u64,
    produced: u64,
    missing: u64,
    remaining: u64,
}

impl TokenCounts {
    fn accumulate(&mut self, other: TokenCounts) {
        self.consumed += other.consumed;
        self.produced += other.produced;
        self.missing += other.missing;
        self.remaining += other.remaining;
    }
}

/// One state of the log prefix automaton
struct PrefixState {
    weight: u64,
    observed: BTreeSet<String>,
    marking: Marking,
}

struct EnablePlan {
    path: Vec<TransitionId>,
    transition: TransitionId,
}

struct Replayer<'a> {
    fm: &'a Marking,
    by_label: HashMap<&'a str, Vec<TransitionId>>,
    visibles: Vec<(TransitionId, &'a str)>,
    silents: Vec<TransitionId>,
    presets: HashMap<TransitionId, Vec<PlaceId>>,
    postsets: HashMap<TransitionId, Vec<PlaceId>>,
}

impl<'a> Replayer<'a> {
    fn new(net: &'a PetriNet, fm: &'a Marking) -> Self {
        let mut presets = HashMap::new();
        let mut postsets = HashMap::new();
        let mut visibles = Vec::new();
        for (id, t) in net.transitions() {
            presets.insert(id, net.preset(id));
            postsets.insert(id, net.postset(id));
            if let Some(label) = t.label.as_deref() {
                visibles.push((id, label));
            }
        }
        Self {
            fm,
            by_label: net.label_index(),
            visibles,
            silents: net.silent_transitions(),
            presets,
            postsets,
        }
    }

    fn preset(&self, t: TransitionId) -> &[PlaceId] {
        &self.presets[&t]
    }

    /// Number of input places lacking a token.
    fn deficit(&self, marking: &Marking, t: TransitionId) -> u64 {
        self.preset(t)
            .iter()
            .filter(|p| marking.tokens(**p) == 0)
            .count() as u64
    }

    fn fire(&self, marking: &mut Marking, t: TransitionId, counts: &mut TokenCounts) {
        for p in self.preset(t) {
            marking.take(*p, 1);
        }
        counts.consumed += self.presets[&t].len() as u64;
        for p in &self.postsets[&t] {
            marking.add(*p, 1);
        }
        counts.produced += self.postsets[&t].len() as u64;
    }

    /// Successor marking after firing a silent transition, without counting.
    fn silent_successor(&self, marking: &Marking, tau: TransitionId) -> Marking {
        let mut next = marking.clone();
        for p in self.preset(tau) {
            next.take(*p, 1);
        }
        for p in &self.postsets[&tau] {
            next.add(*p, 1);
        }
        next
    }

    /// Breadth-first search over silent firings for a marking enabling one
    /// of `candidates`. Falls back to the reachable marking (and candidate)
    /// with the smallest token deficit.
    fn enable_search(&self, start: &Marking, candidates: &[TransitionId]) -> EnablePlan {
        let mut best_deficit = u64::MAX;
        let mut best_path: Vec<TransitionId> = Vec::new();
        let mut best_transition = candidates[0];

        let mut visited: HashSet<Marking> = HashSet::new();
        let mut queue: VecDeque<(Marking, Vec<TransitionId>)> = VecDeque::new();
        visited.insert(start.clone());
        queue.push_back((start.clone(), Vec::new()));

        while let Some((marking, path)) = queue.pop_front() {
            for &t in candidates {
                let deficit = self.deficit(&marking, t);
                if deficit == 0 {
                    return EnablePlan {
                        path,
                        transition: t,
                    };
                }
                if deficit < best_deficit {
                    best_deficit = deficit;
                    best_path = path.clone();
                    best_transition = t;
                }
            }

            if visited.len() >= SILENT_SEARCH_CAP {
                continue;
            }
            for &tau in &self.silents {
                if self.deficit(&marking, tau) != 0 {
                    continue;
                }
                let next = self.silent_successor(&marking, tau);
                if visited.insert(next.clone()) {
                    let mut next_path = path.clone();
                    next_path.push(tau);
                    queue.push_back((next, next_path));
                }
            }
        }

        EnablePlan {
            path: best_path,
            transition: best_transition,
        }
    }

    /// Silent path toward the final marking: an exact match if reachable,
    /// otherwise the first covering marking, otherwise `None`.
    fn final_search(&self, start: &Marking) -> Option<Vec<TransitionId>> {
        let mut covering: Option<Vec<TransitionId>> = None;
        let mut visited: HashSet<Marking> = HashSet::new();
        let mut queue: VecDeque<(Marking, Vec<TransitionId>)> = VecDeque::new();
        visited.insert(start.clone());
        queue.push_back((start.clone(), Vec::new()));

        while let Some((marking, path)) = queue.pop_front() {
            if &marking == self.fm {
                return Some(path);
            }
            if covering.is_none() && marking.covers(self.fm) {
                covering = Some(path.clone());
            }

            if visited.len() >= SILENT_SEARCH_CAP {
                continue;
            }
            for &tau in &self.silents {
                if self.deficit(&marking, tau) != 0 {
                    continue;
                }
                let next = self.silent_successor(&marking, tau);
                if visited.insert(next.clone()) {
                    let mut next_path = path.clone();
                    next_path.push(tau);
                    queue.push_back((next, next_path));
                }
            }
        }
        covering
    }

    /// Replays one activity: fire directly if enabled, enable through silent
    /// transitions if possible, otherwise inject the missing tokens.
    fn step(&self, marking: &mut Marking, activity: &str, counts: &mut TokenCounts) {
        let Some(candidates) = self.by_label.get(activity) else {
            // activity unknown to the model
            counts.missing += 1;
            return;
        };

        if let Some(&t) = candidates.iter().find(|&&t| self.deficit(marking, t) == 0) {
            self.fire(marking, t, counts);
            return;
        }

        let plan = self.enable_search(marking, candidates);
        for &tau in &plan.path {
            self.fire(marking, tau, counts);
        }
        for p in self.preset(plan.transition).to_vec() {
            if marking.tokens(p) == 0 {
                counts.missing += 1;
                marking.add(p, 1);
            }
        }
        self.fire(marking, plan.transition, counts);
    }

    fn replay_trace(
        &self,
        trace: &[EventRecord],
        im: &Marking,
        prefix_states: &mut BTreeMap<Vec<String>, PrefixState>,
    ) -> TokenCounts {
        let mut marking = im.clone();
        let mut counts = TokenCounts::default();
        counts.produced += im.total();

        let mut prefix: Vec<String> = Vec::new();
        for event in trace {
            let state = prefix_states
                .entry(prefix.clone())
                .or_insert_with(|| PrefixState {
                    weight: 0,
                    observed: BTreeSet::new(),
                    marking: marking.clone(),
                });
            state.weight += 1;
            state.observed.insert(event.activity.clone());

            self.step(&mut marking, &event.activity, &mut counts);
            prefix.push(event.activity.clone());
        }
        let state = prefix_states.entry(prefix).or_insert_with(|| PrefixState {
            weight: 0,
            observed: BTreeSet::new(),
            marking: marking.clone(),
        });
        state.weight += 1;

        if let Some(path) = self.final_search(&marking) {
            for tau in path {
                self.fire(&mut marking, tau, &mut counts);
            }
        }
        for (p, want) in self.fm.iter() {
            let have = marking.tokens(p);
            if have < want {
                counts.missing += want - have;
            }
            counts.consumed += want;
            marking.set(p, have.saturating_sub(want));
        }
        counts.remaining += marking.total();
        counts
    }

    /// Visible labels enabled in the marking or in any marking reachable
    /// from it through silent transitions.
    fn enabled_labels(&self, start: &Marking) -> BTreeSet<&'a str> {
        let mut labels = BTreeSet::new();
        let mut visited: HashSet<Marking> = HashSet::new();
        let mut queue: VecDeque<Marking> = VecDeque::new();
        visited.insert(start.clone());
        queue.push_back(start.clone());

        while let Some(marking) = queue.pop_front() {
            for (t, label) in &self.visibles {
                if self.deficit(&marking, *t) == 0 {
                    labels.insert(*label);
                }
            }
            if visited.len() >= SILENT_SEARCH_CAP {
                continue;
            }
            for &tau in &self.silents {
                if self.deficit(&marking, tau) != 0 {
                    continue;
                }
                let next = self.silent_successor(&marking, tau);
                if visited.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        labels
    }
}

fn replay_and_measure(
    log: &EventLog,
    net: &PetriNet,
    im: &Marking,
    fm: &Marking,
) -> crate::Result<Metrics> {
    if !net.contains_marking(im) || !net.contains_marking(fm) {
        return Err(CmipError::Evaluation(
            "marking references a place outside the net".to_string(),
        ));
    }

    let replayer = Replayer::new(net, fm);
    let mut totals = TokenCounts::default();
    let mut prefix_states: BTreeMap<Vec<String>, PrefixState> = BTreeMap::new();
    let mut total_traces = 0usize;
    let mut fitting_traces = 0usize;

    for trace in log.cases() {
        let counts = replayer.replay_trace(trace, im, &mut prefix_states);
        total_traces += 1;
        if counts.missing == 0 && counts.remaining == 0 {
            fitting_traces += 1;
        }
        totals.accumulate(counts);
    }

    let fitness = 0.5 * (1.0 - totals.missing as f64 / totals.consumed.max(1) as f64)
        + 0.5 * (1.0 - totals.remaining as f64 / totals.produced.max(1) as f64);
    let fitness = fitness.clamp(0.0, 1.0);

    let mut value_sum = 0.0;
    let mut weight_sum = 0.0;
    for state in prefix_states.values() {
        let enabled = replayer.enabled_labels(&state.marking);
        if enabled.is_empty() {
            continue;
        }
        let escaping = enabled
            .iter()
            .filter(|label| !state.observed.contains(**label))
            .count();
        let value = 1.0 - escaping as f64 / enabled.len() as f64;
        value_sum += state.weight as f64 * value;
        weight_sum += state.weight as f64;
    }
    let precision = if weight_sum > 0.0 {
        (value_sum / weight_sum).clamp(0.0, 1.0)
    } else {
        1.0
    };

    Ok(Metrics {
        fitness,
        precision,
        f_measure: f_measure(fitness, precision),
        details: ReplayDiagnostics {
            total_traces,
            fitting_traces,
            fitting_ratio: fitting_traces as f64 / total_traces.max(1) as f64,
            total_consumed: totals.consumed,
            total_produced: totals.produced,
            total_missing: totals.missing,
            total_remaining: totals.remaining,
            error: None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::EventRecord;
    use crate::petri::Node;
    use chrono::{TimeZone, Utc};

    fn trace_log(variants: &[&[&str]]) -> EventLog {
        let mut events = Vec::new();
        for (i, variant) in variants.iter().enumerate() {
            for (j, activity) in variant.iter().enumerate() {
                events.push(EventRecord {
                    case_id: format!("c{:03}", i),
                    activity: activity.to_string(),
                    timestamp: Utc.timestamp_opt(1_700_000_000 + j as i64, 0).unwrap(),
                    roles: vec!["X".to_string()],
                    send_msg: vec![],
                    recv_msg: vec![],
                    req_res: vec![],
                    rel_res: vec![],
                });
            }
        }
        EventLog::from_events(events).unwrap()
    }

    /// source -> A -> p -> B -> sink, no silent transitions
    fn linear_net() -> (PetriNet, Marking, Marking) {
        let mut net = PetriNet::new("linear");
        let source = net.add_place("source").unwrap();
        let mid = net.add_place("mid").unwrap();
        let sink = net.add_place("sink").unwrap();
        let a = net.add_transition("a", Some("A")).unwrap();
        let b = net.add_transition("b", Some("B")).unwrap();
        net.add_arc(Node::Place(source), Node::Transition(a)).unwrap();
        net.add_arc(Node::Transition(a), Node::Place(mid)).unwrap();
        net.add_arc(Node::Place(mid), Node::Transition(b)).unwrap();
        net.add_arc(Node::Transition(b), Node::Place(sink)).unwrap();

        let mut im = Marking::new();
        im.set(source, 1);
        let mut fm = Marking::new();
        fm.set(sink, 1);
        (net, im, fm)
    }

    #[test]
    fn test_perfect_fit() {
        let (net, im, fm) = linear_net();
        let log = trace_log(&[&["A", "B"], &["A", "B"]]);
        let metrics = evaluate_model(&log, &net, &im, &fm);

        assert_eq!(metrics.fitness, 1.0);
        assert_eq!(metrics.precision, 1.0);
        assert_eq!(metrics.f_measure, 1.0);
        assert_eq!(metrics.details.total_traces, 2);
        assert_eq!(metrics.details.fitting_traces, 2);
        assert_eq!(metrics.details.total_missing, 0);
        assert_eq!(metrics.details.total_remaining, 0);
    }

    #[test]
    fn test_out_of_order_trace_counts_missing() {
        let (net, im, fm) = linear_net();
        let log = trace_log(&[&["B", "A"]]);
        let metrics = evaluate_model(&log, &net, &im, &fm);

        assert!(metrics.details.total_missing > 0);
        assert!(metrics.fitness < 1.0);
        assert_eq!(metrics.details.fitting_traces, 0);
    }

    #[test]
    fn test_unknown_activity_counts_missing() {
        let (net, im, fm) = linear_net();
        let log = trace_log(&[&["A", "ghost", "B"]]);
        let metrics = evaluate_model(&log, &net, &im, &fm);

        assert!(metrics.details.total_missing > 0);
        assert!(metrics.fitness < 1.0);
    }

    #[test]
    fn test_silent_transitions_bridge_replay() {
        // source -> tau -> p -> A -> sink
        let mut net = PetriNet::new("silent");
        let source = net.add_place("source").unwrap();
        let p = net.add_place("p").unwrap();
        let sink = net.add_place("sink").unwrap();
        let tau = net.add_transition("tau", None).unwrap();
        let a = net.add_transition("a", Some("A")).unwrap();
        net.add_arc(Node::Place(source), Node::Transition(tau)).unwrap();
        net.add_arc(Node::Transition(tau), Node::Place(p)).unwrap();
        net.add_arc(Node::Place(p), Node::Transition(a)).unwrap();
        net.add_arc(Node::Transition(a), Node::Place(sink)).unwrap();

        let mut im = Marking::new();
        im.set(source, 1);
        let mut fm = Marking::new();
        fm.set(sink, 1);

        let log = trace_log(&[&["A"]]);
        let metrics = evaluate_model(&log, &net, &im, &fm);
        assert_eq!(metrics.fitness, 1.0);
        assert_eq!(metrics.details.fitting_traces, 1);
    }

    #[test]
    fn test_precision_penalizes_unobserved_choice() {
        // source splits into A or B; the log only ever does A
        let mut net = PetriNet::new("choice");
        let source = net.add_place("source").unwrap();
        let sink = net.add_place("sink").unwrap();
        let a = net.add_transition("a", Some("A")).unwrap();
        let b = net.add_transition("b", Some("B")).unwrap();
        for t in [a, b] {
            net.add_arc(Node::Place(source), Node::Transition(t)).unwrap();
            net.add_arc(Node::Transition(t), Node::Place(sink)).unwrap();
        }

        let mut im = Marking::new();
        im.set(source, 1);
        let mut fm = Marking::new();
        fm.set(sink, 1);

        let log = trace_log(&[&["A"], &["A"]]);
        let metrics = evaluate_model(&log, &net, &im, &fm);
        assert_eq!(metrics.fitness, 1.0);
        assert!(metrics.precision < 1.0);
        assert!(metrics.f_measure < 1.0);
    }

    #[test]
    fn test_f_measure_definition() {
        assert_eq!(f_measure(0.0, 0.0), 0.0);
        assert_eq!(f_measure(1.0, 1.0), 1.0);
        let f = f_measure(0.5, 1.0);
        assert!((f - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_degraded_metrics_on_foreign_marking() {
        let (net, _, fm) = linear_net();

        // marking referencing a place the net does not contain
        let mut other = PetriNet::new("other");
        for i in 0..10 {
            other.add_place(format!("p{}", i)).unwrap();
        }
        let foreign = other.place_by_name("p9").unwrap();
        let mut im = Marking::new();
        im.set(foreign, 1);

        let log = trace_log(&[&["A"]]);
        let metrics = evaluate_model(&log, &net, &im, &fm);
        assert_eq!(metrics.fitness, 0.0);
        assert_eq!(metrics.precision, 0.0);
        assert_eq!(metrics.f_measure, 0.0);
        assert!(metrics.details.error.is_some());
    }

    #[test]
    fn test_remaining_tokens_counted() {
        // net with an extra initially marked place that nothing consumes
        let (mut net, mut im, fm) = linear_net();
        let stray = net.add_place("stray").unwrap();
        im.set(stray, 1);

        let log = trace_log(&[&["A", "B"]]);
        let metrics = evaluate_model(&log, &net, &im, &fm);
        assert_eq!(metrics.details.total_remaining, 1);
        assert!(metrics.fitness < 1.0);
        assert_eq!(metrics.details.fitting_traces, 0);
    }
}
