use std::collections::BTreeMap;
use std::time::Duration;

use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, opt, preceded, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{literal, take_while};
use winnow::{ModalResult, Parser};

use crate::ast::*;

/// How unquoted attribute values are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Literals {
    /// `10` becomes an integer, `900s` a duration, and so on.
    Typed,
    /// Every value is kept as the exact source token.
    Verbatim,
}

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

/// Strip `//` line comments and `/* */` block comments from the input.
///
/// Newlines inside block comments are kept so line numbers stay correct, and
/// string literals are copied verbatim (including embedded newlines).
pub(crate) fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'/') => {
                while let Some(&next) = chars.peek() {
                    if next == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    if next == '\n' {
                        out.push('\n');
                    }
                    prev = next;
                }
            }
            '"' => {
                out.push('"');
                while let Some(next) = chars.next() {
                    out.push(next);
                    if next == '\\' {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    } else if next == '"' {
                        break;
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Whitespace consumer (including newlines).
fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Parse an identifier: [A-Za-z_][A-Za-z0-9_]*
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Parse a node id: a plain identifier or a double-quoted string.
fn node_id(input: &mut &str) -> ModalResult<String> {
    alt((identifier.map(String::from), quoted_string)).parse_next(input)
}

/// Parse a qualified id: identifier ( '.' identifier )+  or plain identifier.
/// Returns the full dotted string.
fn qualified_or_plain_id(input: &mut &str) -> ModalResult<String> {
    let first = identifier.parse_next(input)?;
    let rest: Vec<&str> = repeat(0.., preceded('.', identifier)).parse_next(input)?;
    let mut s = first.to_string();
    for part in rest {
        s.push('.');
        s.push_str(part);
    }
    Ok(s)
}

/// Parse a double-quoted string with escape support. Raw newlines are kept.
fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = winnow::token::any
            .parse_next(input)
            .map_err(|_: ErrMode<ContextError>| make_cut_error("closing '\"' of quoted string"))?;
        match c {
            '"' => break,
            '\\' => {
                let esc = winnow::token::any.parse_next(input).map_err(
                    |_: ErrMode<ContextError>| make_cut_error("escape sequence after '\\'"),
                )?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    'r' => s.push('\r'),
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
            }
            other => s.push(other),
        }
    }
    Ok(s)
}

/// Parse a duration value: integer + suffix (ms, s, m, h, d).
fn duration_value(input: &mut &str) -> ModalResult<Duration> {
    let digits: &str = digit1.parse_next(input)?;
    let val: u64 = digits
        .parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))?;
    let suffix = alt(("ms", "s", "m", "h", "d")).parse_next(input)?;
    // A suffix followed by more identifier characters (e.g. `10seconds`) is not a duration.
    if input.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ErrMode::Backtrack(ContextError::new()));
    }
    let dur = match suffix {
        "ms" => Some(Duration::from_millis(val)),
        "s" => Some(Duration::from_secs(val)),
        "m" => val.checked_mul(60).map(Duration::from_secs),
        "h" => val.checked_mul(3600).map(Duration::from_secs),
        _ => val.checked_mul(86400).map(Duration::from_secs),
    };
    dur.ok_or_else(|| make_cut_error("duration small enough to fit in 64-bit seconds"))
}

/// Parse a boolean value.
fn boolean_value(input: &mut &str) -> ModalResult<bool> {
    let value =
        alt((literal("true").value(true), literal("false").value(false))).parse_next(input)?;
    if input.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ErrMode::Backtrack(ContextError::new()));
    }
    Ok(value)
}

/// Parse a float: optional sign, digits, '.', digits.
fn float_value(input: &mut &str) -> ModalResult<f64> {
    let s: &str = (opt(alt(('-', '+'))), digit1, '.', digit1)
        .take()
        .parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

/// Parse an integer: optional sign + digits.
fn integer_value(input: &mut &str) -> ModalResult<i64> {
    let s: &str = (opt(alt(('-', '+'))), digit1).take().parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

/// Parse an attribute value. Bare identifiers (`style=dashed`) are read as strings.
fn attr_value(input: &mut &str, literals: Literals) -> ModalResult<AttributeValue> {
    if literals == Literals::Verbatim {
        return alt((
            quoted_string.map(AttributeValue::String),
            alt((
                boolean_value.void(),
                duration_value.void(),
                float_value.void(),
                integer_value.void(),
                identifier.void(),
            ))
            .take()
            .map(|token: &str| AttributeValue::String(token.to_string())),
        ))
        .parse_next(input);
    }
    alt((
        quoted_string.map(AttributeValue::String),
        boolean_value.map(AttributeValue::Boolean),
        duration_value.map(AttributeValue::Duration),
        float_value.map(AttributeValue::Float),
        integer_value.map(AttributeValue::Integer),
        identifier.map(|s: &str| AttributeValue::String(s.to_string())),
    ))
    .parse_next(input)
}

/// Parse a single attribute: key '=' value.
fn attr(input: &mut &str, literals: Literals) -> ModalResult<(String, AttributeValue)> {
    let key = qualified_or_plain_id.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '='.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let value = (|i: &mut &str| attr_value(i, literals))
        .context(StrContext::Expected(StrContextValue::Description(
            "attribute value",
        )))
        .parse_next(input)
        .map_err(|e| e.cut())?;
    Ok((key, value))
}

/// Parse an attribute block: '[' attr ( ','? attr )* ']'
///
/// Once the opening bracket is consumed, a missing closing bracket is fatal
/// so the error points at the unbalanced block instead of backtracking.
fn attr_block(input: &mut &str, literals: Literals) -> ModalResult<Attributes> {
    let _ = '['.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    let mut attrs = BTreeMap::new();
    if let Some((k, v)) = opt(|i: &mut &str| attr(i, literals)).parse_next(input)? {
        attrs.insert(k, v);
        loop {
            let _ = ws.parse_next(input)?;
            let _ = opt(alt((',', ';'))).parse_next(input)?;
            let _ = ws.parse_next(input)?;
            match opt(|i: &mut &str| attr(i, literals)).parse_next(input)? {
                Some((k, v)) => {
                    attrs.insert(k, v);
                }
                None => break,
            }
        }
    }

    let _ = ws.parse_next(input)?;
    if opt(']').parse_next(input)?.is_none() {
        return Err(make_cut_error("closing ']' of attribute block"));
    }
    Ok(attrs)
}

/// Intermediate representation of a parsed statement, before we merge them into a DotGraph.
///
/// `Node` and `Edge` carry the remaining input length at the start of the
/// statement so the merge step can recover a line number.
enum Statement {
    GraphAttrs(Attributes),
    NodeDefaults(Attributes),
    EdgeDefaults(Attributes),
    Node(String, Attributes, usize),
    Edge(Vec<String>, Attributes, usize),
    Subgraph(Option<String>, Vec<Statement>),
    GraphAttrDecl(String, AttributeValue),
}

/// Parse `keyword [ ... ] ;?` for the graph/node/edge default statements.
fn defaults_stmt<'i>(
    keyword: &'static str,
    literals: Literals,
) -> impl FnMut(&mut &'i str) -> ModalResult<Attributes> {
    move |input: &mut &'i str| {
        let _ = literal(keyword).parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let attrs = attr_block(input, literals)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        Ok(attrs)
    }
}

/// Parse 'subgraph' identifier? '{' statement* '}'
fn subgraph_stmt(input: &mut &str, literals: Literals) -> ModalResult<Statement> {
    let _ = literal("subgraph").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = opt(identifier).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '{'.parse_next(input)?;
    let stmts = statements(input, literals)?;
    let _ = ws.parse_next(input)?;
    if opt('}').parse_next(input)?.is_none() {
        return Err(make_cut_error("closing '}' of subgraph"));
    }
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Statement::Subgraph(name.map(|s| s.to_string()), stmts))
}

/// Parse a node or edge statement. An edge starts as a node id then has '->'.
fn node_or_edge_stmt(input: &mut &str, literals: Literals) -> ModalResult<Statement> {
    let position = input.len();
    let bare_first = opt(identifier).parse_next(input)?;
    let first = match bare_first {
        Some(id) => id.to_string(),
        None => quoted_string.parse_next(input)?,
    };
    let _ = ws.parse_next(input)?;

    if opt(literal("->")).parse_next(input)?.is_some() {
        let mut chain = vec![first];
        loop {
            let _ = ws.parse_next(input)?;
            let next = node_id
                .context(StrContext::Expected(StrContextValue::Description(
                    "edge target identifier",
                )))
                .parse_next(input)
                .map_err(|e| e.cut())?;
            chain.push(next);
            let _ = ws.parse_next(input)?;
            if opt(literal("->")).parse_next(input)?.is_none() {
                break;
            }
        }

        let attrs = opt(|i: &mut &str| attr_block(i, literals))
            .parse_next(input)?
            .unwrap_or_default();
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Edge(chain, attrs, position));
    }

    if opt(literal("--")).parse_next(input)?.is_some() {
        return Err(make_cut_error(
            "only directed edges (->); undirected edges (--) are not supported",
        ));
    }

    if let Some(attrs) = opt(|i: &mut &str| attr_block(i, literals)).parse_next(input)? {
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Node(first, attrs, position));
    }

    // `key = value` at statement level is a graph attribute declaration.
    if bare_first.is_some() && opt('=').parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let val = attr_value(input, literals).map_err(|e| e.cut())?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::GraphAttrDecl(first, val));
    }

    let _ = opt(';').parse_next(input)?;
    Ok(Statement::Node(first, BTreeMap::new(), position))
}

/// Parse a single statement.
fn statement(input: &mut &str, literals: Literals) -> ModalResult<Statement> {
    let _ = ws.parse_next(input)?;
    alt((
        defaults_stmt("graph", literals).map(Statement::GraphAttrs),
        defaults_stmt("node", literals).map(Statement::NodeDefaults),
        defaults_stmt("edge", literals).map(Statement::EdgeDefaults),
        |i: &mut &str| subgraph_stmt(i, literals),
        |i: &mut &str| node_or_edge_stmt(i, literals),
    ))
    .parse_next(input)
}

/// Parse zero or more statements, stopping at a closing brace or end of input.
fn statements(input: &mut &str, literals: Literals) -> ModalResult<Vec<Statement>> {
    let mut stmts = Vec::new();
    loop {
        let _ = ws.parse_next(input)?;
        if input.is_empty() || input.starts_with('}') {
            break;
        }
        if input.starts_with(']') {
            return Err(make_cut_error("statement (found unmatched ']')"));
        }
        let stmt = statement(input, literals)?;
        stmts.push(stmt);
    }
    Ok(stmts)
}

/// Flattened result of merging one scope's statements.
struct Scope {
    attrs: Attributes,
    nodes: BTreeMap<String, NodeDef>,
    edges: Vec<EdgeDef>,
    subgraphs: Vec<SubgraphDef>,
    node_defaults: Attributes,
    edge_defaults: Attributes,
}

/// Merge statements into a DotGraph-like structure.
///
/// `line_of` maps a statement's remaining-input length back to a 1-based line.
fn merge_statements(
    stmts: Vec<Statement>,
    parent_node_defaults: &Attributes,
    parent_edge_defaults: &Attributes,
    line_of: &dyn Fn(usize) -> usize,
) -> Scope {
    let mut scope = Scope {
        attrs: BTreeMap::new(),
        nodes: BTreeMap::new(),
        edges: Vec::new(),
        subgraphs: Vec::new(),
        node_defaults: parent_node_defaults.clone(),
        edge_defaults: parent_edge_defaults.clone(),
    };

    for stmt in stmts {
        match stmt {
            Statement::GraphAttrs(attrs) => scope.attrs.extend(attrs),
            Statement::NodeDefaults(attrs) => scope.node_defaults.extend(attrs),
            Statement::EdgeDefaults(attrs) => scope.edge_defaults.extend(attrs),
            Statement::GraphAttrDecl(key, val) => {
                scope.attrs.insert(key, val);
            }
            Statement::Node(id, attrs, position) => {
                let line = line_of(position);
                match scope.nodes.get_mut(&id) {
                    // Repeated node statements merge their attributes.
                    Some(existing) => {
                        existing.attrs.extend(attrs);
                        if !existing.declared {
                            existing.declared = true;
                            existing.line = line;
                        }
                    }
                    None => {
                        let mut merged = scope.node_defaults.clone();
                        merged.extend(attrs);
                        scope.nodes.insert(
                            id.clone(),
                            NodeDef {
                                id,
                                attrs: merged,
                                line,
                                declared: true,
                            },
                        );
                    }
                }
            }
            Statement::Edge(chain, attrs, position) => {
                let line = line_of(position);
                // Expand chained edges: A -> B -> C => (A,B), (B,C)
                for pair in chain.windows(2) {
                    let mut merged = scope.edge_defaults.clone();
                    merged.extend(attrs.clone());
                    scope.edges.push(EdgeDef {
                        from: pair[0].clone(),
                        to: pair[1].clone(),
                        attrs: merged,
                        line,
                    });
                }
                for node_id in &chain {
                    let defaults = &scope.node_defaults;
                    scope
                        .nodes
                        .entry(node_id.clone())
                        .or_insert_with(|| NodeDef {
                            id: node_id.clone(),
                            attrs: defaults.clone(),
                            line,
                            declared: false,
                        });
                }
            }
            Statement::Subgraph(name, inner_stmts) => {
                let inner = merge_statements(
                    inner_stmts,
                    &scope.node_defaults,
                    &scope.edge_defaults,
                    line_of,
                );
                scope.subgraphs.push(SubgraphDef {
                    name,
                    attrs: inner.attrs,
                    nodes: inner.nodes,
                    edges: inner.edges,
                    node_defaults: inner.node_defaults,
                    edge_defaults: inner.edge_defaults,
                });
                // nested subgraphs get pushed into the parent's subgraphs list
                scope.subgraphs.extend(inner.subgraphs);
            }
        }
    }

    scope
}

/// Top-level parser: 'digraph' identifier '{' statements '}'.
fn parse_digraph(
    input: &mut &str,
    line_of: &dyn Fn(usize) -> usize,
    literals: Literals,
) -> ModalResult<DotGraph> {
    let _ = ws.parse_next(input)?;

    if input.starts_with("strict") {
        return Err(make_cut_error(
            "'digraph' keyword (strict graphs are not supported)",
        ));
    }

    if input.starts_with("graph") {
        let trimmed = input[5..].trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(make_cut_error(
                "'digraph' keyword (undirected graphs are not supported)",
            ));
        }
    }

    let _ = literal("digraph")
        .context(StrContext::Expected(StrContextValue::StringLiteral(
            "digraph",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = node_id
        .context(StrContext::Expected(StrContextValue::Description(
            "graph name identifier",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '{'.parse_next(input)?;
    let stmts = statements(input, literals)?;
    let _ = ws.parse_next(input)?;
    if opt('}').parse_next(input)?.is_none() {
        return Err(make_cut_error("closing '}' of digraph body"));
    }
    let _ = ws.parse_next(input)?;
    if !input.is_empty() {
        return Err(make_cut_error("end of input after closing '}'"));
    }

    let empty = BTreeMap::new();
    let scope = merge_statements(stmts, &empty, &empty, line_of);

    Ok(DotGraph {
        name,
        attrs: scope.attrs,
        nodes: scope.nodes,
        edges: scope.edges,
        subgraphs: scope.subgraphs,
        node_defaults: scope.node_defaults,
        edge_defaults: scope.edge_defaults,
    })
}

/// Compute 1-based (line, col) for the position where `remaining_len` bytes are left.
fn offset_to_line_col(stripped: &str, remaining_len: usize) -> (usize, usize) {
    let consumed = stripped.len().saturating_sub(remaining_len);
    let prefix = &stripped[..consumed];
    let line = prefix.matches('\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(pos) => prefix[pos + 1..].chars().count() + 1,
        None => prefix.chars().count() + 1,
    };
    (line, col)
}

/// Parse DOT text, typing unquoted attribute values.
pub fn parse(input: &str) -> conductor_types::Result<DotGraph> {
    parse_with(input, Literals::Typed)
}

/// Parse DOT text, keeping every attribute value as a string.
///
/// Unquoted values keep their exact source text, so `bead_id=007` stays
/// `"007"` and `timeout=900s` stays `"900s"`.
pub fn parse_verbatim(input: &str) -> conductor_types::Result<DotGraph> {
    parse_with(input, Literals::Verbatim)
}

fn parse_with(input: &str, literals: Literals) -> conductor_types::Result<DotGraph> {
    let stripped = strip_comments(input);
    let mut remaining = stripped.as_str();
    let line_of = |remaining_len: usize| offset_to_line_col(&stripped, remaining_len).0;

    let graph = parse_digraph(&mut remaining, &line_of, literals).map_err(|e| {
        let (line, col) = offset_to_line_col(&stripped, remaining.len());
        let message = format!("{}", e);

        // Extract a source snippet around the error location
        let snippet = remaining.chars().take(40).collect::<String>();
        let source_snippet = if snippet.is_empty() {
            None
        } else {
            Some(snippet)
        };

        conductor_types::ConductorError::ParseError {
            line,
            col,
            message,
            source_snippet,
        }
    })?;

    tracing::debug!(
        graph = %graph.name,
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        "Parsed DOT graph"
    );
    Ok(graph)
}
