use std::collections::{HashMap, HashSet, VecDeque};

use crate::api::{Comment, CommentId};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommentNode {
    pub comment: Comment,

    /// Replies, in the order they appeared in the input
    pub children: Vec<CommentNode>,
}

impl CommentNode {
    pub fn id(&self) -> CommentId {
        self.comment.id
    }

    /// Number of transitive replies to this comment
    pub fn reply_count(&self) -> usize {
        let mut count = 0;
        let mut stack = self.children.iter().collect::<Vec<_>>();
        while let Some(n) = stack.pop() {
            count += 1;
            stack.extend(n.children.iter());
        }
        count
    }

    /// Ids of this comment and all of its transitive replies
    pub fn thread_ids(&self) -> Vec<CommentId> {
        let mut res = Vec::new();
        let mut stack = vec![self];
        while let Some(n) = stack.pop() {
            res.push(n.id());
            stack.extend(n.children.iter().rev());
        }
        res
    }
}

/// Reply threads of a comment section
///
/// Built from scratch from a flat list of comments, and never modified in
/// place afterwards: the transforms below all return a new forest.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommentForest {
    roots: Vec<CommentNode>,
    depths: HashMap<CommentId, usize>,
}

impl CommentForest {
    /// Assemble the reply threads of `comments`
    ///
    /// Input order need not be topological. Comments whose parent is absent
    /// become roots, as do comments caught in a parent cycle, so that every
    /// input comment appears exactly once. When an id is repeated, only its
    /// first occurrence is kept. Siblings keep their relative input order.
    pub fn build(comments: impl IntoIterator<Item = Comment>) -> CommentForest {
        // First pass: arena and id index
        let mut arena = Vec::<Option<Comment>>::new();
        let mut index = HashMap::<CommentId, usize>::new();
        for c in comments {
            if index.contains_key(&c.id) {
                tracing::warn!(comment=?c.id, "duplicate comment in snapshot, ignoring");
                continue;
            }
            index.insert(c.id, arena.len());
            arena.push(Some(c));
        }

        // Second pass: attach everyone to their parent, if it exists
        let n = arena.len();
        let mut parent = vec![None; n];
        let mut children = vec![Vec::new(); n];
        let mut roots = Vec::new();
        for (i, c) in arena.iter().enumerate() {
            let p = c
                .as_ref()
                .and_then(|c| c.parent_id)
                .and_then(|p| index.get(&p).copied())
                .filter(|&p| p != i);
            match p {
                Some(p) => {
                    parent[i] = Some(p);
                    children[p].push(i);
                }
                None => roots.push(i),
            }
        }

        // Nodes not reachable from a root hang off a parent cycle. Break each
        // cycle at its earliest member.
        let mut reached = vec![false; n];
        let mark = |from: usize, reached: &mut Vec<bool>, children: &Vec<Vec<usize>>| {
            let mut stack = vec![from];
            while let Some(i) = stack.pop() {
                reached[i] = true;
                stack.extend(children[i].iter().copied());
            }
        };
        for &r in &roots {
            mark(r, &mut reached, &children);
        }
        for i in 0..n {
            if reached[i] {
                continue;
            }
            let mut on_path = HashSet::new();
            let mut cur = i;
            while on_path.insert(cur) {
                match parent[cur] {
                    Some(p) => cur = p,
                    None => break,
                }
            }
            let mut earliest = cur;
            let mut walk = parent[cur];
            while let Some(w) = walk.filter(|&w| w != cur) {
                earliest = earliest.min(w);
                walk = parent[w];
            }
            tracing::warn!(
                comment=?arena[earliest].as_ref().map(|c| c.id),
                "reply cycle in comments, promoting to top-level"
            );
            if let Some(p) = parent[earliest].take() {
                children[p].retain(|&c| c != earliest);
            }
            roots.push(earliest);
            mark(earliest, &mut reached, &children);
        }
        roots.sort_unstable();

        // Depths, from the roots down
        let mut depths = HashMap::with_capacity(n);
        let mut stack = roots.iter().map(|&r| (r, 0)).collect::<Vec<_>>();
        while let Some((i, d)) = stack.pop() {
            if let Some(c) = &arena[i] {
                depths.insert(c.id, d);
            }
            stack.extend(children[i].iter().map(|&c| (c, d + 1)));
        }

        // Post-order, so that children are all built before their parent
        let mut post_order = Vec::with_capacity(n);
        let mut stack = roots.iter().map(|&r| (r, false)).collect::<Vec<_>>();
        while let Some((i, expanded)) = stack.pop() {
            if expanded {
                post_order.push(i);
            } else {
                stack.push((i, true));
                stack.extend(children[i].iter().map(|&c| (c, false)));
            }
        }
        let mut built = (0..n).map(|_| None).collect::<Vec<Option<CommentNode>>>();
        for i in post_order {
            let kids = children[i]
                .iter()
                .filter_map(|&c| built[c].take())
                .collect();
            if let Some(comment) = arena[i].take() {
                built[i] = Some(CommentNode {
                    comment,
                    children: kids,
                });
            }
        }
        let roots = roots.into_iter().filter_map(|r| built[r].take()).collect();

        CommentForest { roots, depths }
    }

    pub fn roots(&self) -> &[CommentNode] {
        &self.roots
    }

    /// Total number of comments in the forest
    pub fn len(&self) -> usize {
        self.depths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Number of reply hops from `id` up to its top-level comment
    pub fn depth_of(&self, id: CommentId) -> Option<usize> {
        self.depths.get(&id).copied()
    }

    pub fn find(&self, id: CommentId) -> Option<&CommentNode> {
        self.depths.get(&id)?;
        let mut stack = self.roots.iter().collect::<Vec<_>>();
        while let Some(n) = stack.pop() {
            if n.id() == id {
                return Some(n);
            }
            stack.extend(n.children.iter());
        }
        None
    }

    /// All comments, each thread listed parent first
    pub fn comments(&self) -> Vec<&Comment> {
        let mut res = Vec::with_capacity(self.len());
        let mut stack = self.roots.iter().rev().collect::<Vec<_>>();
        while let Some(n) = stack.pop() {
            res.push(&n.comment);
            stack.extend(n.children.iter().rev());
        }
        res
    }

    /// Forest with `comment` added, or replaced if its id is already present
    pub fn with_comment(&self, comment: Comment) -> CommentForest {
        let mut list = self.comments().into_iter().cloned().collect::<Vec<_>>();
        match list.iter_mut().find(|c| c.id == comment.id) {
            Some(c) => *c = comment,
            None => list.push(comment),
        }
        CommentForest::build(list)
    }

    /// Forest with the thread rooted at `root` removed
    pub fn without_thread(&self, root: CommentId) -> CommentForest {
        let removed = match self.find(root) {
            None => return self.clone(),
            Some(n) => n.thread_ids().into_iter().collect::<HashSet<_>>(),
        };
        CommentForest::build(
            self.comments()
                .into_iter()
                .filter(|c| !removed.contains(&c.id))
                .cloned(),
        )
    }
}

/// Ids of the thread rooted at `root`: `root` itself and every comment that
/// transitively replies to it, found by traversal from `root`
pub fn collect_thread(comments: &[Comment], root: CommentId) -> Vec<CommentId> {
    let mut replies = HashMap::<CommentId, Vec<CommentId>>::new();
    for c in comments {
        if let Some(p) = c.parent_id {
            replies.entry(p).or_default().push(c.id);
        }
    }
    let mut res = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        res.push(id);
        if let Some(r) = replies.get(&id) {
            queue.extend(r.iter().copied());
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use crate::{flatten_all, api::Uuid};

    #[test]
    fn builds_nested_threads() {
        let e = entity();
        let a = comment(&e, None, 0);
        let b = comment(&e, Some(a.id), 1);
        let c = comment(&e, Some(b.id), 2);
        let d = comment(&e, Some(a.id), 3);
        let z = comment(&e, None, 4);
        let f = CommentForest::build(vec![a.clone(), b.clone(), c.clone(), d.clone(), z.clone()]);
        assert_eq!(f.len(), 5);
        assert_eq!(f.roots().len(), 2);
        assert_eq!(f.roots()[0].id(), a.id);
        assert_eq!(f.roots()[1].id(), z.id);
        assert_eq!(
            f.roots()[0].children.iter().map(|n| n.id()).collect::<Vec<_>>(),
            vec![b.id, d.id]
        );
        assert_eq!(f.roots()[0].reply_count(), 3);
        assert_eq!(f.depth_of(c.id), Some(2));
        assert_eq!(f.find(c.id).map(|n| &n.comment), Some(&c));
        assert_eq!(f.find(CommentId(Uuid::new_v4())), None);
    }

    #[test]
    fn out_of_order_input() {
        let e = entity();
        let a = comment(&e, None, 0);
        let b = comment(&e, Some(a.id), 1);
        let c = comment(&e, Some(b.id), 2);
        let f = CommentForest::build(vec![c.clone(), b.clone(), a.clone()]);
        assert_eq!(f.roots().len(), 1);
        assert_eq!(f.depth_of(c.id), Some(2));
    }

    #[test]
    fn orphans_become_roots() {
        let e = entity();
        let a = comment(&e, None, 0);
        let ghost = comment(&e, Some(CommentId(Uuid::new_v4())), 1);
        let f = CommentForest::build(vec![a.clone(), ghost.clone()]);
        assert_eq!(f.roots().len(), 2);
        assert_eq!(f.depth_of(ghost.id), Some(0));
    }

    #[test]
    fn cycles_are_broken() {
        let e = entity();
        let mut a = comment(&e, None, 0);
        let b = comment(&e, Some(a.id), 1);
        let c = comment(&e, Some(b.id), 2);
        a.parent_id = Some(c.id);
        let f = CommentForest::build(vec![b.clone(), a.clone(), c.clone()]);
        assert_eq!(f.len(), 3);
        assert_eq!(f.roots().len(), 1);
        assert_eq!(f.roots()[0].id(), b.id);
        assert_eq!(f.depth_of(a.id), Some(2));
    }

    #[test]
    fn duplicates_keep_first() {
        let e = entity();
        let a = comment(&e, None, 0);
        let mut a2 = a.clone();
        a2.text = String::from("second");
        let f = CommentForest::build(vec![a.clone(), a2]);
        assert_eq!(f.len(), 1);
        assert_eq!(f.roots()[0].comment, a);
    }

    #[test]
    fn pure_transforms() {
        let e = entity();
        let a = comment(&e, None, 0);
        let b = comment(&e, Some(a.id), 1);
        let c = comment(&e, Some(b.id), 2);
        let d = comment(&e, Some(a.id), 3);
        let f = CommentForest::build(vec![a.clone(), b.clone(), c.clone()]);

        let g = f.with_comment(d.clone());
        assert_eq!(f.len(), 3);
        assert_eq!(g.len(), 4);
        assert_eq!(g.depth_of(d.id), Some(1));

        let mut edited = b.clone();
        edited.text = String::from("edited");
        let h = g.with_comment(edited.clone());
        assert_eq!(h.len(), 4);
        assert_eq!(h.find(b.id).map(|n| &n.comment), Some(&edited));

        let i = g.without_thread(b.id);
        assert_eq!(i.len(), 2);
        assert_eq!(i.find(c.id), None);
        assert_eq!(g.without_thread(a.id).len(), 0);
        assert_eq!(g.without_thread(CommentId(Uuid::new_v4())), g);
    }

    #[test]
    fn thread_collection() {
        let e = entity();
        let a = comment(&e, None, 0);
        let b = comment(&e, Some(a.id), 1);
        let c = comment(&e, Some(b.id), 2);
        let d = comment(&e, Some(a.id), 3);
        let z = comment(&e, None, 4);
        let all = vec![a.clone(), b.clone(), c.clone(), d.clone(), z.clone()];

        let thread = collect_thread(&all, a.id).into_iter().collect::<HashSet<_>>();
        assert_eq!(thread, HashSet::from([a.id, b.id, c.id, d.id]));
        let thread = collect_thread(&all, b.id).into_iter().collect::<HashSet<_>>();
        assert_eq!(thread, HashSet::from([b.id, c.id]));

        let missing = CommentId(Uuid::new_v4());
        assert_eq!(collect_thread(&all, missing), vec![missing]);
    }

    #[test]
    fn fuzz_any_parents() {
        // Arbitrary parent links, including cycles and self-references
        bolero::check!()
            .with_type::<Vec<Option<u8>>>()
            .cloned()
            .for_each(|parents| {
                let e = entity();
                let mut comments = (0..parents.len())
                    .map(|i| comment(&e, None, i as i64))
                    .collect::<Vec<_>>();
                let ids = comments.iter().map(|c| c.id).collect::<Vec<_>>();
                for (c, p) in comments.iter_mut().zip(parents.iter()) {
                    c.parent_id = p.map(|p| {
                        ids.get(p as usize)
                            .copied()
                            .unwrap_or_else(|| CommentId(Uuid::new_v4()))
                    });
                }
                let forest = CommentForest::build(comments);
                let rows = flatten_all(&forest);
                assert_eq!(rows.len(), ids.len());
                let seen = rows.iter().map(|r| r.node.id()).collect::<HashSet<_>>();
                assert_eq!(seen.len(), ids.len());
                for r in rows {
                    assert_eq!(forest.depth_of(r.node.id()), Some(r.depth));
                }
            });
    }
}
