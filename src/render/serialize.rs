//! Tree serializer: flattens a snapshot of the live tree into text lines.
//!
//! Pure function of the snapshot: the same snapshot always yields the same
//! lines, and nothing here looks at event history.

use crate::node::{NodeKind, Reasoning};

/// Connector for an entry that has more siblings below it.
pub const CONTINUES: &str = "├";
/// Connector for the last entry at its level.
pub const LAST: &str = "└";
/// Indentation per depth level.
pub const INDENT: &str = "    ";

/// Observable state of a whole rendering session.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeSnapshot {
    pub root: NodeFrame,
}

/// Observable state of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFrame {
    pub name: String,
    pub kind: NodeKind,
    pub reasoning: Option<Reasoning>,
    pub steps: Vec<StepFrame>,
    pub output: String,
    /// Set once a non-root node has resolved; collapses the subtree.
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepFrame {
    Log(String),
    Call(NodeFrame),
}

impl NodeFrame {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            reasoning: None,
            steps: Vec::new(),
            output: String::new(),
            summary: None,
        }
    }

    fn has_output(&self) -> bool {
        !self.output.trim().is_empty()
    }
}

/// Serialize the tree into ordered lines.
pub fn serialize(tree: &TreeSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    write_node(&tree.root, 0, None, &mut lines);
    lines
}

/// Write one node. `position` is `None` for the root, otherwise whether the
/// node is the last entry in its parent's step list.
fn write_node(node: &NodeFrame, depth: usize, position: Option<bool>, out: &mut Vec<String>) {
    let is_root = position.is_none();

    if let Some(is_last) = position {
        // Header and summary lines hang off the parent's step list.
        let parent_indent = indent(depth.saturating_sub(1));
        let connector = connector(is_last);
        if let Some(summary) = &node.summary {
            out.push(format!(
                "{parent_indent}{connector} {}: _{}_",
                node.name,
                single_line(summary)
            ));
            return;
        }
        out.push(format!("{parent_indent}{connector} {}", node.name));
    }

    let own_indent = indent(depth);
    let has_output = node.has_output();
    let tail_is_last = is_root || !has_output;

    if let Some(reasoning) = &node.reasoning {
        let is_last = node.steps.is_empty() && tail_is_last;
        push_block(
            out,
            &format!("{own_indent}{} ", connector(is_last)),
            &reasoning_label(reasoning),
        );
    }

    let step_count = node.steps.len();
    for (i, step) in node.steps.iter().enumerate() {
        let is_last = i + 1 == step_count && tail_is_last;
        match step {
            StepFrame::Log(line) => {
                push_block(out, &format!("{own_indent}{} ", connector(is_last)), line);
            }
            StepFrame::Call(child) => write_node(child, depth + 1, Some(is_last), out),
        }
    }

    if has_output {
        if is_root {
            out.extend(node.output.trim_end().lines().map(str::to_string));
        } else {
            push_block(out, &format!("{own_indent}{LAST} "), node.output.trim_end());
        }
    }
}

fn connector(is_last: bool) -> &'static str {
    if is_last { LAST } else { CONTINUES }
}

fn indent(depth: usize) -> String {
    INDENT.repeat(depth)
}

/// Push `text` with `prefix` on its first line and matching blank padding on
/// continuation lines.
fn push_block(out: &mut Vec<String>, prefix: &str, text: &str) {
    let pad = " ".repeat(prefix.chars().count());
    let mut lines = text.lines();
    out.push(format!("{prefix}{}", lines.next().unwrap_or("")));
    out.extend(lines.map(|line| format!("{pad}{line}")));
}

fn reasoning_label(reasoning: &Reasoning) -> String {
    match reasoning.duration {
        Some(duration) => format!("💭 Thought for {}s", duration.as_secs().max(1)),
        None => match reasoning.text.trim().lines().last() {
            Some(latest) => format!("💭 {}", latest.trim()),
            None => "💭 Thinking…".to_string(),
        },
    }
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
