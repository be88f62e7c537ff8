//! Parser and writer for the Graphviz DOT subset used to describe pipelines.
//!
//! Parses `digraph Name { ... }` with nodes, edges, subgraphs, and typed attributes
//! into a [`DotGraph`], and renders a [`DotGraph`] back to text with [`to_dot`].
//!
//! # Example
//! ```
//! let dot = r#"digraph Pipeline { start -> build -> done }"#;
//! let graph = conductor_dot::parse(dot).unwrap();
//! assert_eq!(graph.name, "Pipeline");
//! assert_eq!(graph.edges.len(), 2);
//! ```

pub mod ast;
mod parser;
mod writer;

pub use ast::*;
pub use parser::{parse, parse_verbatim};
pub use writer::{format_id, quote, to_dot};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_simple_linear_pipeline() {
        let input = "digraph Test { start -> plan -> done }";
        let graph = parse(input).unwrap();
        assert_eq!(graph.name, "Test");
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.edges[0].from, "start");
        assert_eq!(graph.edges[0].to, "plan");
        assert_eq!(graph.edges[1].from, "plan");
        assert_eq!(graph.edges[1].to, "done");
        assert!(graph.nodes.contains_key("start"));
        assert!(graph.nodes.contains_key("plan"));
        assert!(graph.nodes.contains_key("done"));
    }

    #[test]
    fn parse_node_with_attributes() {
        let input = r#"digraph G {
            start [shape="Mdiamond", label="Begin"]
        }"#;
        let graph = parse(input).unwrap();
        let node = graph.nodes.get("start").unwrap();
        assert_eq!(
            node.attrs.get("shape"),
            Some(&AttributeValue::String("Mdiamond".to_string()))
        );
        assert_eq!(
            node.attrs.get("label"),
            Some(&AttributeValue::String("Begin".to_string()))
        );
    }

    #[test]
    fn parse_edge_with_attributes() {
        let input = r#"digraph G {
            A -> B [label="ok", weight=10]
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(
            graph.edges[0].attrs.get("label"),
            Some(&AttributeValue::String("ok".to_string()))
        );
        assert_eq!(
            graph.edges[0].attrs.get("weight"),
            Some(&AttributeValue::Integer(10))
        );
    }

    #[test]
    fn chained_edge_expansion() {
        let input = r#"digraph G {
            A -> B -> C [label="chain"]
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.edges[0].from, "A");
        assert_eq!(graph.edges[0].to, "B");
        assert_eq!(graph.edges[1].from, "B");
        assert_eq!(graph.edges[1].to, "C");
        // Both edges share the same attrs
        assert_eq!(
            graph.edges[0].attrs.get("label"),
            Some(&AttributeValue::String("chain".to_string()))
        );
        assert_eq!(
            graph.edges[1].attrs.get("label"),
            Some(&AttributeValue::String("chain".to_string()))
        );
    }

    #[test]
    fn parse_subgraph() {
        let input = r#"digraph G {
            subgraph cluster_inner {
                node [shape="box"]
                A -> B
            }
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.subgraphs.len(), 1);
        let sg = &graph.subgraphs[0];
        assert_eq!(sg.name.as_deref(), Some("cluster_inner"));
        assert!(sg.nodes.contains_key("A"));
        assert!(sg.nodes.contains_key("B"));
        assert_eq!(sg.edges.len(), 1);
        // node defaults should have been applied
        assert_eq!(
            sg.nodes.get("A").unwrap().attrs.get("shape"),
            Some(&AttributeValue::String("box".to_string()))
        );
    }

    #[test]
    fn duration_value_parsing() {
        let input = r#"digraph G {
            step [timeout=900s, delay=250ms, interval=15m]
        }"#;
        let graph = parse(input).unwrap();
        let node = graph.nodes.get("step").unwrap();
        assert_eq!(
            node.attrs.get("timeout"),
            Some(&AttributeValue::Duration(Duration::from_secs(900)))
        );
        assert_eq!(
            node.attrs.get("delay"),
            Some(&AttributeValue::Duration(Duration::from_millis(250)))
        );
        assert_eq!(
            node.attrs.get("interval"),
            Some(&AttributeValue::Duration(Duration::from_secs(15 * 60)))
        );
    }

    #[test]
    fn comment_stripping() {
        let input = r#"
            // This is a comment
            digraph G {
                /* block comment */
                A -> B // inline comment
            }
        "#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].from, "A");
        assert_eq!(graph.edges[0].to, "B");
    }

    #[test]
    fn reject_undirected_graph() {
        let input = "graph G { A -- B }";
        let result = parse(input);
        assert!(result.is_err());
    }

    #[test]
    fn reject_undirected_edges() {
        let input = "digraph G { A -- B }";
        let result = parse(input);
        assert!(result.is_err());
    }

    #[test]
    fn parse_graph_attrs() {
        let input = r#"digraph G {
            graph [rankdir="LR"]
            label = "My Graph"
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(
            graph.attrs.get("rankdir"),
            Some(&AttributeValue::String("LR".to_string()))
        );
        assert_eq!(
            graph.attrs.get("label"),
            Some(&AttributeValue::String("My Graph".to_string()))
        );
    }

    #[test]
    fn parse_node_and_edge_defaults() {
        let input = r#"digraph G {
            node [shape="ellipse"]
            edge [style="dashed"]
            A -> B
        }"#;
        let graph = parse(input).unwrap();
        // node defaults apply to nodes
        assert_eq!(
            graph.nodes.get("A").unwrap().attrs.get("shape"),
            Some(&AttributeValue::String("ellipse".to_string()))
        );
        // edge defaults apply to edges
        assert_eq!(
            graph.edges[0].attrs.get("style"),
            Some(&AttributeValue::String("dashed".to_string()))
        );
    }

    #[test]
    fn parse_float_attribute() {
        let input = r#"digraph G {
            A [weight=3.14]
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(
            graph.nodes.get("A").unwrap().attrs.get("weight"),
            Some(&AttributeValue::Float(3.14))
        );
    }

    #[test]
    fn parse_boolean_attribute() {
        let input = r#"digraph G {
            A [visible=true, hidden=false]
        }"#;
        let graph = parse(input).unwrap();
        let node = graph.nodes.get("A").unwrap();
        assert_eq!(
            node.attrs.get("visible"),
            Some(&AttributeValue::Boolean(true))
        );
        assert_eq!(
            node.attrs.get("hidden"),
            Some(&AttributeValue::Boolean(false))
        );
    }

    #[test]
    fn parse_qualified_key() {
        let input = r#"digraph G {
            A [worker.model="sonnet"]
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(
            graph.nodes.get("A").unwrap().attrs.get("worker.model"),
            Some(&AttributeValue::String("sonnet".to_string()))
        );
    }

    #[test]
    fn parse_string_escapes() {
        let input = r#"digraph G {
            A [label="line1\nline2\ttab\\slash\"quote"]
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(
            graph.nodes.get("A").unwrap().attrs.get("label"),
            Some(&AttributeValue::String(
                "line1\nline2\ttab\\slash\"quote".to_string()
            ))
        );
    }

    #[test]
    fn error_includes_line_and_col() {
        let input = "not_a_graph { }";
        let err = parse(input).unwrap_err();
        match err {
            conductor_types::ConductorError::ParseError { line, col, .. } => {
                assert!(line >= 1);
                assert!(col >= 1);
            }
            _ => panic!("expected ParseError"),
        }
    }

    #[test]
    fn semicolons_optional() {
        let input = r#"digraph G {
            A [label="first"];
            B [label="second"]
            A -> B;
            B -> C
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
    }

    #[test]
    fn duration_hours_and_days() {
        let input = r#"digraph G {
            A [ttl=2h, retention=7d]
        }"#;
        let graph = parse(input).unwrap();
        let node = graph.nodes.get("A").unwrap();
        assert_eq!(
            node.attrs.get("ttl"),
            Some(&AttributeValue::Duration(Duration::from_secs(2 * 3600)))
        );
        assert_eq!(
            node.attrs.get("retention"),
            Some(&AttributeValue::Duration(Duration::from_secs(7 * 86400)))
        );
    }

    #[test]
    fn node_and_edge_lines_are_recorded() {
        let input = "digraph G {\n  a [handler=\"start\"]\n\n  b\n  a -> b\n}";
        let graph = parse(input).unwrap();
        assert_eq!(graph.nodes["a"].line, 2);
        assert_eq!(graph.nodes["b"].line, 4);
        assert_eq!(graph.edges[0].line, 5);
    }

    #[test]
    fn edge_only_nodes_are_not_declared() {
        let graph = parse("digraph G { a; a -> b }").unwrap();
        assert!(graph.nodes["a"].declared);
        assert!(!graph.nodes["b"].declared);
    }

    #[test]
    fn later_declaration_marks_node_declared() {
        let graph = parse("digraph G {\n a -> b\n b [label=\"B\"]\n}").unwrap();
        let b = &graph.nodes["b"];
        assert!(b.declared);
        assert_eq!(b.line, 3);
        assert_eq!(b.attrs.get("label").and_then(|v| v.as_str()), Some("B"));
    }

    #[test]
    fn bare_identifier_value_is_string() {
        let graph = parse("digraph G { a [status=pending, handler=codergen] }").unwrap();
        let a = &graph.nodes["a"];
        assert_eq!(a.attrs.get("status").and_then(|v| v.as_str()), Some("pending"));
        assert_eq!(a.attrs.get("handler").and_then(|v| v.as_str()), Some("codergen"));
    }

    #[test]
    fn identifier_starting_with_true_is_not_boolean() {
        let graph = parse("digraph G { a [mode=trueish] }").unwrap();
        assert_eq!(
            graph.nodes["a"].attrs.get("mode"),
            Some(&AttributeValue::String("trueish".to_string()))
        );
    }

    #[test]
    fn quoted_node_ids() {
        let graph = parse(r#"digraph G { "step one" -> "step-two" }"#).unwrap();
        assert!(graph.nodes.contains_key("step one"));
        assert!(graph.nodes.contains_key("step-two"));
    }

    #[test]
    fn comment_markers_inside_strings_are_kept() {
        let graph = parse(r#"digraph G { a [url="http://x/*y*/"] }"#).unwrap();
        assert_eq!(
            graph.nodes["a"].attrs.get("url").and_then(|v| v.as_str()),
            Some("http://x/*y*/")
        );
    }

    #[test]
    fn unbalanced_braces_are_errors() {
        let err = parse("digraph G {\n a -> b\n").unwrap_err();
        assert_eq!(err.kind(), "parse_error");
        assert!(parse("digraph G { a [label=\"x\" }").is_err());
        assert!(parse("digraph G { a } }").is_err());
    }

    #[test]
    fn unterminated_string_is_error() {
        let err = parse("digraph G {\n a [label=\"oops]\n}").unwrap_err();
        match err {
            conductor_types::ConductorError::ParseError { line, .. } => assert!(line >= 2),
            other => panic!("expected ParseError, got {other:?}"),
        }
    }

    #[test]
    fn strict_graph_rejected() {
        assert!(parse("strict digraph G { a -> b }").is_err());
    }

    #[test]
    fn nested_subgraphs_are_flattened() {
        let input = r#"digraph G {
            subgraph outer {
                a -> b
                subgraph inner { c -> d }
            }
        }"#;
        let graph = parse(input).unwrap();
        assert_eq!(graph.subgraphs.len(), 2);
        assert_eq!(graph.subgraphs[1].name.as_deref(), Some("inner"));
    }

    #[test]
    fn writer_round_trip_preserves_graph() {
        let input = r#"digraph "Build Pipeline" {
            graph [goal="ship it"]
            node [shape="box"]
            start [handler="start", status="validated"]
            "impl one" [label="say \"hi\"\nthen leave", timeout=90s, retries=3]
            done [handler="exit", weight=1.5, gate=true]
            start -> "impl one" -> done
            done -> "impl one" [condition="fail", style="dashed"]
        }"#;
        let graph = parse(input).unwrap();
        let text = to_dot(&graph);
        let reparsed = parse(&text).unwrap();

        assert_eq!(reparsed.name, graph.name);
        assert_eq!(reparsed.attrs, graph.attrs);
        assert_eq!(reparsed.edges.len(), graph.edges.len());
        for (a, b) in graph.edges.iter().zip(&reparsed.edges) {
            assert_eq!((&a.from, &a.to, &a.attrs), (&b.from, &b.to, &b.attrs));
        }
        for (id, node) in &graph.nodes {
            assert_eq!(reparsed.nodes[id].attrs, node.attrs, "node {id}");
        }
        assert_eq!(
            reparsed.nodes["impl one"].attrs.get("timeout"),
            Some(&AttributeValue::Duration(Duration::from_secs(90)))
        );
    }

    #[test]
    fn writer_quotes_keywords_and_odd_ids() {
        assert_eq!(format_id("build_1"), "build_1");
        assert_eq!(format_id("node"), "\"node\"");
        assert_eq!(format_id("1st"), "\"1st\"");
        assert_eq!(format_id("a-b"), "\"a-b\"");
        assert_eq!(quote("a\"b\\c\n"), r#""a\"b\\c\n""#);
    }

    #[test]
    fn oversized_duration_is_a_parse_error() {
        let err = parse("digraph G { a [x=999999999999999999d] }").unwrap_err();
        assert!(matches!(err, conductor_types::ConductorError::ParseError { line: 1, .. }), "{err}");
        assert!(parse_verbatim("digraph G { a [x=99999999999999999h] }").is_err());
        // Still fits once the multiplier is applied.
        let graph = parse("digraph G { a [x=1000000d] }").unwrap();
        assert_eq!(
            graph.nodes["a"].attrs.get("x"),
            Some(&AttributeValue::Duration(Duration::from_secs(86_400_000_000)))
        );
    }

    #[test]
    fn verbatim_parse_keeps_source_tokens() {
        let input = r#"digraph P {
            graph [retries=03]
            a [bead_id=007, timeout=900s, weight=1.50, gate=true, style=dashed, label="x"]
        }"#;
        let graph = parse_verbatim(input).unwrap();
        let attrs = &graph.nodes["a"].attrs;
        let text = |k: &str| attrs.get(k).and_then(AttributeValue::as_str);
        assert_eq!(text("bead_id"), Some("007"));
        assert_eq!(text("timeout"), Some("900s"));
        assert_eq!(text("weight"), Some("1.50"));
        assert_eq!(text("gate"), Some("true"));
        assert_eq!(text("style"), Some("dashed"));
        assert_eq!(text("label"), Some("x"));
        assert_eq!(graph.attrs.get("retries").and_then(AttributeValue::as_str), Some("03"));

        // Written back quoted, so the text survives a second parse.
        let reparsed = parse_verbatim(&to_dot(&graph)).unwrap();
        assert_eq!(&reparsed.nodes["a"].attrs, attrs);
    }

    #[test]
    fn duration_display_uses_largest_exact_unit() {
        assert_eq!(AttributeValue::Duration(Duration::from_secs(900)).to_string(), "15m");
        assert_eq!(AttributeValue::Duration(Duration::from_millis(1500)).to_string(), "1500ms");
        assert_eq!(AttributeValue::Duration(Duration::from_secs(86400)).to_string(), "1d");
    }
}
