use std::collections::HashSet;

use crate::{api::CommentId, CommentForest, CommentNode};

/// Top-level comments whose replies are currently shown
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExpandedThreads(HashSet<CommentId>);

impl ExpandedThreads {
    pub fn new() -> ExpandedThreads {
        ExpandedThreads(HashSet::new())
    }

    pub fn is_expanded(&self, root: CommentId) -> bool {
        self.0.contains(&root)
    }

    /// Returns whether the thread is expanded after the toggle
    pub fn toggle(&mut self, root: CommentId) -> bool {
        if self.0.remove(&root) {
            false
        } else {
            self.0.insert(root);
            true
        }
    }

    pub fn expand(&mut self, root: CommentId) {
        self.0.insert(root);
    }

    pub fn collapse(&mut self, root: CommentId) {
        self.0.remove(&root);
    }

    /// Forget threads that are no longer top-level in `forest`
    pub fn retain_roots(&mut self, forest: &CommentForest) {
        let roots = forest.roots().iter().map(|r| r.id()).collect::<HashSet<_>>();
        self.0.retain(|id| roots.contains(id));
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThreadRow<'a> {
    pub node: &'a CommentNode,
    pub depth: usize,

    /// Number of transitive replies, shown or not
    pub reply_count: usize,
}

enum Visit<'a> {
    Enter(&'a CommentNode, usize),
    Exit(usize),
}

/// Display-ordered rows for `forest`
///
/// Top-level comments are always listed. The replies of a top-level comment
/// are all listed, at every depth, iff it is in `expanded`.
pub fn flatten<'a>(forest: &'a CommentForest, expanded: &ExpandedThreads) -> Vec<ThreadRow<'a>> {
    flatten_with(forest, |root| expanded.is_expanded(root))
}

/// Display-ordered rows for `forest`, with every thread expanded
pub fn flatten_all(forest: &CommentForest) -> Vec<ThreadRow<'_>> {
    flatten_with(forest, |_| true)
}

fn flatten_with(
    forest: &CommentForest,
    is_expanded: impl Fn(CommentId) -> bool,
) -> Vec<ThreadRow<'_>> {
    let mut rows = Vec::with_capacity(forest.roots().len());
    for root in forest.roots() {
        if !is_expanded(root.id()) {
            rows.push(ThreadRow {
                node: root,
                depth: 0,
                reply_count: root.reply_count(),
            });
            continue;
        }
        // Replies of a row are exactly the rows pushed between its Enter and
        // its Exit, which gives all reply counts in a single pass
        let mut stack = vec![Visit::Enter(root, 0)];
        while let Some(v) = stack.pop() {
            match v {
                Visit::Enter(node, depth) => {
                    stack.push(Visit::Exit(rows.len()));
                    rows.push(ThreadRow {
                        node,
                        depth,
                        reply_count: 0,
                    });
                    stack.extend(
                        node.children
                            .iter()
                            .rev()
                            .map(|c| Visit::Enter(c, depth + 1)),
                    );
                }
                Visit::Exit(row) => rows[row].reply_count = rows.len() - row - 1,
            }
        }
    }
    rows
}
