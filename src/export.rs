//! Net rendering and interchange
//!
//! Pure functions from a net value to DOT (Graphviz) text and to Petri Net
//! Markup Language, plus a PNML reader so exported nets can be loaded back.
//! Rasterization of the DOT output is the renderer's concern.

use std::fmt::Write as _;

use crate::petri::{Marking, Node, PetriNet};
use crate::{CmipError, Result};

/// Renders the net as deterministic Graphviz text. Places are circles
/// (doubled for final-marking places, annotated with their initial tokens),
/// transitions are boxes, silent transitions are filled black.
pub fn to_dot(net: &PetriNet, im: &Marking, fm: &Marking) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", escape_dot(net.name()));
    let _ = writeln!(out, "  rankdir=LR;");

    for (id, place) in net.places() {
        let tokens = im.tokens(id);
        let label = if tokens > 0 {
            format!("{}\\n{}", escape_dot(&place.name), tokens)
        } else {
            escape_dot(&place.name)
        };
        let peripheries = if fm.tokens(id) > 0 { 2 } else { 1 };
        let _ = writeln!(
            out,
            "  p{} [shape=circle, peripheries={}, label=\"{}\"];",
            id.index(),
            peripheries,
            label
        );
    }
    for (id, transition) in net.transitions() {
        match transition.label.as_deref() {
            Some(label) => {
                let _ = writeln!(
                    out,
                    "  t{} [shape=box, label=\"{}\"];",
                    id.index(),
                    escape_dot(label)
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "  t{} [shape=box, style=filled, fillcolor=black, label=\"\", width=0.15];",
                    id.index()
                );
            }
        }
    }
    for arc in net.arcs() {
        let _ = writeln!(out, "  {} -> {};", dot_node(arc.source), dot_node(arc.target));
    }
    out.push_str("}\n");
    out
}

fn dot_node(node: Node) -> String {
    match node {
        Node::Place(p) => format!("p{}", p.index()),
        Node::Transition(t) => format!("t{}", t.index()),
    }
}

fn escape_dot(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Serializes the net, its initial marking and its final marking as PNML.
pub fn to_pnml(net: &PetriNet, im: &Marking, fm: &Marking) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<pnml xmlns=\"http://www.pnml.org/version-2009/grammar/pnml\">\n");
    let _ = writeln!(
        out,
        "  <net id=\"{}\" type=\"http://www.pnml.org/version-2009/grammar/ptnet\">",
        escape_xml(net.name())
    );
    out.push_str("    <page id=\"page1\">\n");

    for (id, place) in net.places() {
        let _ = writeln!(out, "      <place id=\"p{}\">", id.index());
        let _ = writeln!(
            out,
            "        <name><text>{}</text></name>",
            escape_xml(&place.name)
        );
        let tokens = im.tokens(id);
        if tokens > 0 {
            let _ = writeln!(
                out,
                "        <initialMarking><text>{}</text></initialMarking>",
                tokens
            );
        }
        out.push_str("      </place>\n");
    }
    for (id, transition) in net.transitions() {
        let _ = writeln!(out, "      <transition id=\"t{}\">", id.index());
        let _ = writeln!(
            out,
            "        <name><text>{}</text></name>",
            escape_xml(&transition.name)
        );
        if let Some(label) = transition.label.as_deref() {
            let _ = writeln!(
                out,
                "        <toolspecific tool=\"cmip-imr\" version=\"1.0\" activity=\"{}\"/>",
                escape_xml(label)
            );
        }
        out.push_str("      </transition>\n");
    }
    for (index, arc) in net.arcs().enumerate() {
        let _ = writeln!(
            out,
            "      <arc id=\"a{}\" source=\"{}\" target=\"{}\"/>",
            index,
            dot_node(arc.source),
            dot_node(arc.target)
        );
    }
    out.push_str("    </page>\n");

    if !fm.is_empty() {
        out.push_str("    <finalmarkings>\n      <marking>\n");
        for (place, tokens) in fm.iter() {
            let _ = writeln!(
                out,
                "        <place idref=\"p{}\"><text>{}</text></place>",
                place.index(),
                tokens
            );
        }
        out.push_str("      </marking>\n    </finalmarkings>\n");
    }

    out.push_str("  </net>\n</pnml>\n");
    out
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Parses a PNML document produced by [`to_pnml`] (or any single-net P/T
/// document using the same vocabulary) back into a net and its markings.
pub fn from_pnml(input: &str) -> Result<(PetriNet, Marking, Marking)> {
    let doc = roxmltree::Document::parse(input)
        .map_err(|e| CmipError::Pnml(format!("invalid xml: {}", e)))?;

    let net_node = doc
        .descendants()
        .find(|n| n.has_tag_name("net"))
        .ok_or_else(|| CmipError::Pnml("no <net> element".to_string()))?;

    let mut net = PetriNet::new(net_node.attribute("id").unwrap_or("net"));
    let mut im = Marking::new();
    let mut fm = Marking::new();

    let mut place_ids = hashbrown::HashMap::new();
    let mut transition_ids = hashbrown::HashMap::new();

    for node in net_node.descendants().filter(|n| n.has_tag_name("place")) {
        // final-marking entries are <place idref=...> and carry no id
        let Some(xml_id) = node.attribute("id") else {
            continue;
        };
        let name = child_text(&node, "name").unwrap_or_else(|| xml_id.to_string());
        let place = net.add_place(name)?;
        place_ids.insert(xml_id.to_string(), place);

        if let Some(text) = child_text(&node, "initialMarking") {
            let tokens: u64 = text
                .trim()
                .parse()
                .map_err(|_| CmipError::Pnml(format!("bad initial marking on {}", xml_id)))?;
            im.set(place, tokens);
        }
    }

    for node in net_node
        .descendants()
        .filter(|n| n.has_tag_name("transition"))
    {
        let xml_id = node
            .attribute("id")
            .ok_or_else(|| CmipError::Pnml("transition without id".to_string()))?;
        let name = child_text(&node, "name").unwrap_or_else(|| xml_id.to_string());
        let label = node
            .children()
            .find(|c| c.has_tag_name("toolspecific"))
            .and_then(|c| c.attribute("activity"))
            .map(str::to_string);
        let transition = net.add_transition(name, label.as_deref())?;
        transition_ids.insert(xml_id.to_string(), transition);
    }

    for node in net_node.descendants().filter(|n| n.has_tag_name("arc")) {
        let source = node
            .attribute("source")
            .ok_or_else(|| CmipError::Pnml("arc without source".to_string()))?;
        let target = node
            .attribute("target")
            .ok_or_else(|| CmipError::Pnml("arc without target".to_string()))?;
        let source = resolve_node(source, &place_ids, &transition_ids)?;
        let target = resolve_node(target, &place_ids, &transition_ids)?;
        net.add_arc(source, target)?;
    }

    if let Some(markings) = net_node
        .descendants()
        .find(|n| n.has_tag_name("finalmarkings"))
    {
        for entry in markings.descendants().filter(|n| n.has_tag_name("place")) {
            let idref = entry
                .attribute("idref")
                .ok_or_else(|| CmipError::Pnml("final marking without idref".to_string()))?;
            let place = place_ids
                .get(idref)
                .ok_or_else(|| CmipError::Pnml(format!("unknown place idref {}", idref)))?;
            let tokens: u64 = entry
                .children()
                .find(|c| c.has_tag_name("text"))
                .and_then(|c| c.text())
                .unwrap_or("1")
                .trim()
                .parse()
                .map_err(|_| CmipError::Pnml(format!("bad final marking on {}", idref)))?;
            fm.set(*place, tokens);
        }
    }

    Ok((net, im, fm))
}

fn child_text(node: &roxmltree::Node, tag: &str) -> Option<String> {
    node.children()
        .find(|c| c.has_tag_name(tag))?
        .descendants()
        .find(|c| c.has_tag_name("text"))?
        .text()
        .map(str::to_string)
}

fn resolve_node(
    xml_id: &str,
    place_ids: &hashbrown::HashMap<String, crate::petri::PlaceId>,
    transition_ids: &hashbrown::HashMap<String, crate::petri::TransitionId>,
) -> Result<Node> {
    if let Some(place) = place_ids.get(xml_id) {
        return Ok(Node::Place(*place));
    }
    if let Some(transition) = transition_ids.get(xml_id) {
        return Ok(Node::Transition(*transition));
    }
    Err(CmipError::Pnml(format!("arc references unknown node {}", xml_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_net() -> (PetriNet, Marking, Marking) {
        let mut net = PetriNet::new("sample");
        let source = net.add_place("X:source").unwrap();
        let msg = net.add_place("MSG:m1").unwrap();
        let sink = net.add_place("X:sink").unwrap();
        let a = net.add_transition("X:t_A", Some("A")).unwrap();
        let tau = net.add_transition("X:exit", None).unwrap();
        net.add_arc(Node::Place(source), Node::Transition(a)).unwrap();
        net.add_arc(Node::Transition(a), Node::Place(msg)).unwrap();
        net.add_arc(Node::Place(msg), Node::Transition(tau)).unwrap();
        net.add_arc(Node::Transition(tau), Node::Place(sink)).unwrap();

        let mut im = Marking::new();
        im.set(source, 1);
        let mut fm = Marking::new();
        fm.set(sink, 1);
        (net, im, fm)
    }

    #[test]
    fn test_dot_output_shape() {
        let (net, im, fm) = sample_net();
        let dot = to_dot(&net, &im, &fm);

        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("shape=circle"));
        assert!(dot.contains("shape=box"));
        assert!(dot.contains("fillcolor=black"));
        assert!(dot.contains("p0 -> t0"));
        assert!(dot.contains("peripheries=2"));
    }

    #[test]
    fn test_pnml_round_trip() {
        let (net, im, fm) = sample_net();
        let pnml = to_pnml(&net, &im, &fm);
        let (net2, im2, fm2) = from_pnml(&pnml).unwrap();

        assert_eq!(net2.stats(), net.stats());
        for (_, place) in net.places() {
            assert!(net2.place_by_name(&place.name).is_some());
        }
        for (_, transition) in net.transitions() {
            let id = net2.transition_by_name(&transition.name).unwrap();
            assert_eq!(net2.transition(id).unwrap().label, transition.label);
        }
        assert_eq!(im2.total(), im.total());
        assert_eq!(fm2.total(), fm.total());
        let source = net2.place_by_name("X:source").unwrap();
        assert_eq!(im2.tokens(source), 1);
        let sink = net2.place_by_name("X:sink").unwrap();
        assert_eq!(fm2.tokens(sink), 1);
    }

    #[test]
    fn test_pnml_escaping() {
        let mut net = PetriNet::new("escape<&>");
        net.add_place("p<1>").unwrap();
        let pnml = to_pnml(&net, &Marking::new(), &Marking::new());
        let (net2, _, _) = from_pnml(&pnml).unwrap();
        assert!(net2.place_by_name("p<1>").is_some());
    }

    #[test]
    fn test_from_pnml_rejects_garbage() {
        assert!(from_pnml("not xml").is_err());
        assert!(from_pnml("<pnml></pnml>").is_err());
    }
}
