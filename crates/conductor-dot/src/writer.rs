//! Serialize a [`DotGraph`] back into DOT text that [`crate::parse`] accepts.
//!
//! Output is deterministic: attributes are emitted in key order, nodes in id
//! order, and edges in declaration order.

use std::fmt::Write;

use crate::ast::*;

const INDENT: &str = "    ";
const KEYWORDS: &[&str] = &["graph", "digraph", "subgraph", "node", "edge", "strict"];

/// Render `graph` as DOT source.
pub fn to_dot(graph: &DotGraph) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph {} {{", format_id(&graph.name));
    write_scope_defaults(
        &mut out,
        INDENT,
        &graph.attrs,
        &graph.node_defaults,
        &graph.edge_defaults,
    );
    write_body(&mut out, INDENT, &graph.nodes, &graph.edges);
    for sg in &graph.subgraphs {
        write_subgraph(&mut out, INDENT, sg);
    }
    out.push_str("}\n");
    out
}

fn write_subgraph(out: &mut String, indent: &str, sg: &SubgraphDef) {
    let inner = format!("{indent}{INDENT}");
    match &sg.name {
        Some(name) => {
            let _ = writeln!(out, "{indent}subgraph {} {{", format_id(name));
        }
        None => {
            let _ = writeln!(out, "{indent}subgraph {{");
        }
    }
    write_scope_defaults(out, &inner, &sg.attrs, &sg.node_defaults, &sg.edge_defaults);
    write_body(out, &inner, &sg.nodes, &sg.edges);
    let _ = writeln!(out, "{indent}}}");
}

fn write_scope_defaults(
    out: &mut String,
    indent: &str,
    attrs: &Attributes,
    node_defaults: &Attributes,
    edge_defaults: &Attributes,
) {
    for (keyword, map) in [("graph", attrs), ("node", node_defaults), ("edge", edge_defaults)] {
        if !map.is_empty() {
            let _ = writeln!(out, "{indent}{keyword} {}", format_attrs(map));
        }
    }
}

fn write_body(
    out: &mut String,
    indent: &str,
    nodes: &std::collections::BTreeMap<String, NodeDef>,
    edges: &[EdgeDef],
) {
    if !nodes.is_empty() {
        out.push('\n');
    }
    for node in nodes.values() {
        if node.attrs.is_empty() {
            let _ = writeln!(out, "{indent}{}", format_id(&node.id));
        } else {
            let _ = writeln!(
                out,
                "{indent}{} {}",
                format_id(&node.id),
                format_attrs(&node.attrs)
            );
        }
    }
    if !edges.is_empty() {
        out.push('\n');
    }
    for edge in edges {
        let _ = write!(
            out,
            "{indent}{} -> {}",
            format_id(&edge.from),
            format_id(&edge.to)
        );
        if !edge.attrs.is_empty() {
            let _ = write!(out, " {}", format_attrs(&edge.attrs));
        }
        out.push('\n');
    }
}

fn format_attrs(attrs: &Attributes) -> String {
    let parts: Vec<String> = attrs
        .iter()
        .map(|(k, v)| format!("{}={}", k, format_value(v)))
        .collect();
    format!("[{}]", parts.join(", "))
}

/// Strings are always quoted so that values such as `"10"` keep their text form.
pub fn format_value(value: &AttributeValue) -> String {
    match value {
        AttributeValue::String(s) => quote(s),
        other => other.to_string(),
    }
}

/// Emit `id` bare when it is a plain identifier, quoted otherwise.
pub fn format_id(id: &str) -> String {
    let mut chars = id.chars();
    let plain = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if plain && !KEYWORDS.contains(&id) {
        id.to_string()
    } else {
        quote(id)
    }
}

/// Quote and escape a string so the parser reads back the same characters.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}
