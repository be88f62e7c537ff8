use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Attribute map keyed by attribute name. Ordered so serialization is deterministic.
pub type Attributes = BTreeMap<String, AttributeValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct DotGraph {
    pub name: String,
    pub attrs: Attributes,
    pub nodes: BTreeMap<String, NodeDef>,
    pub edges: Vec<EdgeDef>,
    pub subgraphs: Vec<SubgraphDef>,
    pub node_defaults: Attributes,
    pub edge_defaults: Attributes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDef {
    pub id: String,
    pub attrs: Attributes,
    /// 1-based line of the node statement (or of the first edge mentioning it).
    pub line: usize,
    /// `false` when the node only appears as an edge endpoint.
    pub declared: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
    pub attrs: Attributes,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubgraphDef {
    pub name: Option<String>,
    pub attrs: Attributes,
    pub nodes: BTreeMap<String, NodeDef>,
    pub edges: Vec<EdgeDef>,
    pub node_defaults: Attributes,
    pub edge_defaults: Attributes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Duration(Duration),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Renders the value as plain text: strings unquoted, other values in their
/// literal DOT form.
impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Integer(i) => write!(f, "{i}"),
            AttributeValue::Float(x) => write!(f, "{x:?}"),
            AttributeValue::Boolean(b) => write!(f, "{b}"),
            AttributeValue::Duration(d) => f.write_str(&format_duration(*d)),
        }
    }
}

/// Format a duration with the largest unit that represents it exactly.
fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0ms".to_string();
    }
    const UNITS: [(u128, &str); 4] = [
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
    ];
    for (size, suffix) in UNITS {
        if ms % size == 0 {
            return format!("{}{}", ms / size, suffix);
        }
    }
    format!("{ms}ms")
}
