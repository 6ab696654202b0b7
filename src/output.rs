//! Output node IR for generated source and its flattening into text plus a
//! block-id source map.

const INDENT: &str = "    ";

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Text(String),
    Group(Vec<OutputNode>),
    /// Brace-delimited, indented statement list.
    Block(Vec<OutputNode>),
    Infix {
        op: String,
        left: Box<OutputNode>,
        right: Box<OutputNode>,
    },
    Prefix {
        op: String,
        operand: Box<OutputNode>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputNode {
    pub kind: NodeKind,
    /// Originating block, recorded in the source map.
    pub id: Option<String>,
    pub blank_line_before: bool,
}

impl OutputNode {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            id: None,
            blank_line_before: false,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(NodeKind::Text(text.into()))
    }

    pub fn group(children: Vec<OutputNode>) -> Self {
        Self::new(NodeKind::Group(children))
    }

    pub fn block(statements: Vec<OutputNode>) -> Self {
        Self::new(NodeKind::Block(statements))
    }

    pub fn infix(left: OutputNode, op: &str, right: OutputNode) -> Self {
        Self::new(NodeKind::Infix {
            op: op.to_string(),
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn prefix(op: &str, operand: OutputNode) -> Self {
        Self::new(NodeKind::Prefix {
            op: op.to_string(),
            operand: Box::new(operand),
        })
    }

    /// A simple statement: its parts followed by `;`.
    pub fn stmt(mut parts: Vec<OutputNode>) -> Self {
        parts.push(Self::text(";"));
        Self::group(parts)
    }

    pub fn comma_separated(items: Vec<OutputNode>) -> Self {
        let mut children = Vec::with_capacity(items.len() * 2);
        for (index, item) in items.into_iter().enumerate() {
            if index > 0 {
                children.push(Self::text(", "));
            }
            children.push(item);
        }
        Self::group(children)
    }

    pub fn parenthesized(inner: OutputNode) -> Self {
        Self::group(vec![Self::text("("), inner, Self::text(")")])
    }

    /// `name(arg, ...)`
    pub fn call(callee: &str, args: Vec<OutputNode>) -> Self {
        Self::group(vec![
            Self::text(format!("{}(", callee)),
            Self::comma_separated(args),
            Self::text(")"),
        ])
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.tag(id);
        self
    }

    /// Sets the originating block unless one is already recorded.
    pub fn tag(&mut self, id: &str) {
        if self.id.is_none() {
            self.id = Some(id.to_string());
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Number, string or boolean literal.
    pub fn is_literal(&self) -> bool {
        let Some(text) = self.as_text() else {
            return false;
        };
        text == "true"
            || text == "false"
            || (text.len() >= 2 && text.starts_with('"') && text.ends_with('"'))
            || is_number_literal(text)
    }
}

fn is_number_literal(text: &str) -> bool {
    text.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.')
        && text
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
        && text.parse::<f64>().is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMapEntry {
    pub start: usize,
    pub length: usize,
    pub block_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMapEntry {
    pub start_line: usize,
    pub end_line: usize,
    pub block_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct Flattened {
    pub source: String,
    pub source_map: Vec<SourceMapEntry>,
}

/// Flattens a top-level statement list. Byte offsets in the source map are
/// ordered by start.
pub fn flatten(statements: &[OutputNode]) -> Flattened {
    let mut writer = Writer::default();
    writer.write_statements(statements, 0);
    Flattened {
        source: writer.out,
        source_map: writer.map,
    }
}

/// Text of a single expression node.
pub fn flatten_expression(node: &OutputNode) -> String {
    let mut writer = Writer::default();
    writer.write_node(node, 0);
    writer.out
}

/// Line-indexed variant of the source map (0-based, inclusive).
pub fn line_map(source: &str, source_map: &[SourceMapEntry]) -> Vec<LineMapEntry> {
    let line_starts = std::iter::once(0)
        .chain(source.match_indices('\n').map(|(i, _)| i + 1))
        .collect::<Vec<_>>();
    let line_of = |offset: usize| match line_starts.binary_search(&offset) {
        Ok(line) => line,
        Err(next) => next.saturating_sub(1),
    };
    source_map
        .iter()
        .map(|entry| {
            let end = entry.start + entry.length.saturating_sub(1);
            LineMapEntry {
                start_line: line_of(entry.start),
                end_line: line_of(end.max(entry.start)),
                block_id: entry.block_id.clone(),
            }
        })
        .collect()
}

fn precedence(op: &str) -> u8 {
    match op {
        "=" | "+=" | "-=" => 1,
        "||" => 2,
        "&&" => 3,
        "==" | "!=" | "===" | "!==" => 4,
        "<" | "<=" | ">" | ">=" => 5,
        "<<" | ">>" => 6,
        "+" | "-" => 7,
        "*" | "/" | "%" => 8,
        "**" => 9,
        _ => 10,
    }
}

fn operand_needs_parens(child: &OutputNode, parent_op: &str, is_right: bool) -> bool {
    let NodeKind::Infix { op, .. } = &child.kind else {
        return false;
    };
    let (child_prec, parent_prec) = (precedence(op), precedence(parent_op));
    if child_prec != parent_prec {
        return child_prec < parent_prec;
    }
    let right_assoc = parent_op == "**" || precedence(parent_op) == 1;
    is_right != right_assoc
}

#[derive(Default)]
struct Writer {
    out: String,
    map: Vec<SourceMapEntry>,
}

impl Writer {
    fn write_statements(&mut self, statements: &[OutputNode], indent: usize) {
        for (index, stmt) in statements.iter().enumerate() {
            if index > 0 && stmt.blank_line_before {
                self.out.push('\n');
            }
            self.push_indent(indent);
            self.write_node(stmt, indent);
            self.out.push('\n');
        }
    }

    fn push_indent(&mut self, indent: usize) {
        for _ in 0..indent {
            self.out.push_str(INDENT);
        }
    }

    fn write_node(&mut self, node: &OutputNode, indent: usize) {
        let start = self.out.len();
        let slot = node.id.as_ref().map(|id| {
            self.map.push(SourceMapEntry {
                start,
                length: 0,
                block_id: id.clone(),
            });
            self.map.len() - 1
        });

        match &node.kind {
            NodeKind::Text(text) => self.out.push_str(text),
            NodeKind::Group(children) => {
                for child in children {
                    self.write_node(child, indent);
                }
            }
            NodeKind::Block(statements) => {
                self.out.push_str("{\n");
                self.write_statements(statements, indent + 1);
                self.push_indent(indent);
                self.out.push('}');
            }
            NodeKind::Infix { op, left, right } => {
                self.write_operand(left, operand_needs_parens(left, op, false), indent);
                self.out.push(' ');
                self.out.push_str(op);
                self.out.push(' ');
                self.write_operand(right, operand_needs_parens(right, op, true), indent);
            }
            NodeKind::Prefix { op, operand } => {
                self.out.push_str(op);
                let wrap = matches!(operand.kind, NodeKind::Infix { .. });
                self.write_operand(operand, wrap, indent);
            }
        }

        if let Some(slot) = slot {
            self.map[slot].length = self.out.len() - start;
        }
    }

    fn write_operand(&mut self, node: &OutputNode, wrap: bool, indent: usize) {
        if wrap {
            self.out.push('(');
        }
        self.write_node(node, indent);
        if wrap {
            self.out.push(')');
        }
    }
}
