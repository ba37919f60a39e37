// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 the o2-rs contributors

//! Hierarchical address paths and the per-service method trie.
//!
//! A method is installed at a path below its service; the trie's
//! children and methods both keep insertion order, which is the
//! documented tie-break when a pattern matches more than one node.

pub mod pattern;

use crate::directory::Delivery;
use crate::process::Outbox;

/// A user message handler.
///
/// Closure capture replaces the C API's `user_data` pointer. The
/// return value of the original handler signature was ignored, so
/// handlers return unit here.
pub type Handler = Box<dyn FnMut(&mut Outbox<'_>, &Delivery<'_>)>;

/// One handler bound to a path, with its dispatch options.
pub struct Method {
    /// Expected typetag; `None` disables type checking.
    pub typespec: Option<String>,
    /// Attempt lossless argument coercion when the typespec differs
    /// from the message.
    pub coerce: bool,
    /// Materialize an argument vector for the handler; otherwise the
    /// handler extracts arguments itself.
    pub parse: bool,
    /// The handler.
    pub handler: Handler,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("typespec", &self.typespec)
            .field("coerce", &self.coerce)
            .field("parse", &self.parse)
            .finish_non_exhaustive()
    }
}

/// One node of a service's address trie.
#[derive(Debug, Default)]
pub struct PathNode {
    /// Children in insertion order, keyed by literal segment.
    pub children: Vec<(String, PathNode)>,
    /// Methods installed at this node, in insertion order.
    pub methods: Vec<Method>,
}

impl PathNode {
    /// Install a method at the path given by `segments` (relative to
    /// this node), creating intermediate nodes as needed.
    pub fn insert(&mut self, segments: &[&str], method: Method) {
        let mut node = self;
        for seg in segments {
            let idx = match node.children.iter().position(|(name, _)| name == seg) {
                Some(i) => i,
                None => {
                    node.children.push(((*seg).to_string(), PathNode::default()));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[idx].1;
        }
        node.methods.push(method);
    }

    /// Child-index paths of every node matching `segments`, pattern
    /// characters expanded, depth-first in insertion order.
    #[must_use]
    pub fn matches(&self, segments: &[&str], literal: bool) -> Vec<Vec<usize>> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        self.collect(segments, literal, &mut prefix, &mut out);
        out
    }

    fn collect(
        &self,
        segments: &[&str],
        literal: bool,
        prefix: &mut Vec<usize>,
        out: &mut Vec<Vec<usize>>,
    ) {
        let Some((seg, rest)) = segments.split_first() else {
            if !self.methods.is_empty() {
                out.push(prefix.clone());
            }
            return;
        };
        for (i, (name, child)) in self.children.iter().enumerate() {
            let hit = if literal {
                name == seg
            } else {
                pattern::match_segment(seg, name)
            };
            if hit {
                prefix.push(i);
                child.collect(rest, literal, prefix, out);
                prefix.pop();
            }
        }
    }

    /// Navigate to a node by a child-index path from [`PathNode::matches`].
    #[must_use]
    pub fn node_mut(&mut self, path: &[usize]) -> Option<&mut PathNode> {
        let mut node = self;
        for &i in path {
            node = &mut node.children.get_mut(i)?.1;
        }
        Some(node)
    }
}

/// Split an address into its segments, tolerating the `!` fast-path
/// prefix. `"/synth/vol"` and `"!synth/vol"` both yield
/// `["synth", "vol"]`.
#[must_use]
pub fn segments(address: &str) -> Vec<&str> {
    address
        .trim_start_matches(['/', '!'])
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

/// True when the address promises no pattern characters, either by the
/// `!` prefix hint or by actual content.
#[must_use]
pub fn is_literal(address: &str) -> bool {
    address.starts_with('!') || !pattern::has_pattern_chars(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Method {
        Method {
            typespec: None,
            coerce: false,
            parse: false,
            handler: Box::new(|_, _| {}),
        }
    }

    #[test]
    fn test_segments() {
        assert_eq!(segments("/synth/vol"), vec!["synth", "vol"]);
        assert_eq!(segments("!synth/vol"), vec!["synth", "vol"]);
        assert_eq!(segments("/synth"), vec!["synth"]);
        assert!(segments("/").is_empty());
    }

    #[test]
    fn test_insert_and_literal_match() {
        let mut root = PathNode::default();
        root.insert(&["a", "x"], noop());
        root.insert(&["b"], noop());
        assert_eq!(root.matches(&["a", "x"], true), vec![vec![0, 0]]);
        assert_eq!(root.matches(&["b"], true), vec![vec![1]]);
        assert!(root.matches(&["a"], true).is_empty(), "no method at /a");
        assert!(root.matches(&["c"], true).is_empty());
    }

    #[test]
    fn test_pattern_match_in_insertion_order() {
        let mut root = PathNode::default();
        root.insert(&["alpha"], noop());
        root.insert(&["beta"], noop());
        root.insert(&["gamma"], noop());
        let hits = root.matches(&["*a*"], false);
        // alpha, beta, gamma all contain 'a'; insertion order preserved.
        assert_eq!(hits, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_node_mut_follows_path() {
        let mut root = PathNode::default();
        root.insert(&["a", "b", "c"], noop());
        let path = root.matches(&["a", "b", "c"], true).remove(0);
        let node = root.node_mut(&path).expect("path resolves");
        assert_eq!(node.methods.len(), 1);
    }
}
