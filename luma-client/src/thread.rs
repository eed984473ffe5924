use std::collections::HashSet;

use crate::{
    api::{Comment, CommentId, EntityRef},
    flatten, CommentForest, ExpandedThreads, Vote, VoteTracker,
};

/// One displayed row of a comment section
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadEntry {
    pub comment: Comment,
    pub depth: usize,
    pub reply_count: usize,
    pub vote: Option<Vote>,

    /// Local vote delta
    pub score: i64,

    /// Written locally but not yet seen in a snapshot
    pub pending: bool,

    /// Whether the replies of this top-level comment are shown
    pub expanded: bool,
}

/// Everything a comment section screen knows: the last snapshot, local
/// writes not yet reflected in it, and the interaction state
///
/// Snapshots and local changes can be applied in any order and converge to
/// the same result, comments being identified by their id.
#[derive(Clone, Debug)]
pub struct CommentThread {
    entity: EntityRef,
    snapshot: Vec<Comment>,
    has_snapshot: bool,
    pending: Vec<Comment>,
    /// Pending comments acknowledged by the store, stamped with its time
    confirmed: HashSet<CommentId>,
    hidden: HashSet<CommentId>,
    expanded: ExpandedThreads,
    votes: VoteTracker,
}

impl CommentThread {
    pub fn new(entity: EntityRef) -> CommentThread {
        CommentThread::with_votes(entity, VoteTracker::new())
    }

    pub fn with_votes(entity: EntityRef, votes: VoteTracker) -> CommentThread {
        CommentThread {
            entity,
            snapshot: Vec::new(),
            has_snapshot: false,
            pending: Vec::new(),
            confirmed: HashSet::new(),
            hidden: HashSet::new(),
            expanded: ExpandedThreads::new(),
            votes,
        }
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// Whether at least one snapshot was received
    pub fn is_loaded(&self) -> bool {
        self.has_snapshot
    }

    pub fn votes(&self) -> &VoteTracker {
        &self.votes
    }

    /// Replace the authoritative comment list
    pub fn apply_snapshot(&mut self, snapshot: Vec<Comment>) {
        let in_snapshot = snapshot.iter().map(|c| c.id).collect::<HashSet<_>>();
        let newest = snapshot.iter().map(|c| c.created_at).max();
        let confirmed = &self.confirmed;
        // A stored comment missing from a snapshot that holds a later one
        // was deleted before any snapshot could show it
        self.pending.retain(|c| {
            !in_snapshot.contains(&c.id)
                && !(confirmed.contains(&c.id) && newest.map_or(false, |n| c.created_at < n))
        });
        let pending = &self.pending;
        self.confirmed.retain(|id| pending.iter().any(|c| c.id == *id));
        // Deletions that went through no longer need hiding
        self.hidden
            .retain(|id| in_snapshot.contains(id) || pending.iter().any(|c| c.id == *id));
        self.snapshot = snapshot;
        self.has_snapshot = true;
    }

    pub fn insert_pending(&mut self, comment: Comment) {
        if self.get(comment.id).is_none() {
            self.pending.push(comment);
        }
    }

    /// Replace the pending copy with what the store actually saved
    pub fn confirm_pending(&mut self, stored: Comment) {
        if self.snapshot.iter().any(|c| c.id == stored.id) {
            self.discard_pending(stored.id);
            return;
        }
        self.confirmed.insert(stored.id);
        match self.pending.iter_mut().find(|c| c.id == stored.id) {
            Some(c) => *c = stored,
            None => self.pending.push(stored),
        }
    }

    pub fn discard_pending(&mut self, id: CommentId) {
        self.pending.retain(|c| c.id != id);
        self.confirmed.remove(&id);
    }

    pub fn is_pending(&self, id: CommentId) -> bool {
        self.pending.iter().any(|c| c.id == id)
    }

    pub fn hide(&mut self, ids: impl IntoIterator<Item = CommentId>) {
        self.hidden.extend(ids);
    }

    pub fn unhide(&mut self, ids: impl IntoIterator<Item = CommentId>) {
        for id in ids {
            self.hidden.remove(&id);
        }
    }

    pub fn get(&self, id: CommentId) -> Option<&Comment> {
        self.snapshot
            .iter()
            .chain(self.pending.iter())
            .find(|c| c.id == id)
    }

    /// Visible comments: the snapshot, then pending comments
    pub fn comments(&self) -> Vec<Comment> {
        self.snapshot
            .iter()
            .chain(self.pending.iter())
            .filter(|c| !self.hidden.contains(&c.id))
            .cloned()
            .collect()
    }

    pub fn forest(&self) -> CommentForest {
        CommentForest::build(self.comments())
    }

    pub fn is_expanded(&self, root: CommentId) -> bool {
        self.expanded.is_expanded(root)
    }

    pub fn toggle_thread(&mut self, root: CommentId) -> bool {
        self.expanded.toggle(root)
    }

    pub fn upvote(&mut self, id: CommentId) -> Option<Vote> {
        self.votes.upvote(id)
    }

    pub fn downvote(&mut self, id: CommentId) -> Option<Vote> {
        self.votes.downvote(id)
    }

    pub fn entries(&self) -> Vec<ThreadEntry> {
        let forest = self.forest();
        flatten(&forest, &self.expanded)
            .into_iter()
            .map(|row| {
                let id = row.node.id();
                ThreadEntry {
                    comment: row.node.comment.clone(),
                    depth: row.depth,
                    reply_count: row.reply_count,
                    vote: self.votes.vote(id),
                    score: self.votes.count(id),
                    pending: self.is_pending(id),
                    expanded: row.depth == 0 && self.expanded.is_expanded(id),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn ids(t: &CommentThread) -> Vec<CommentId> {
        t.comments().iter().map(|c| c.id).collect()
    }

    #[test]
    fn pending_then_snapshot() {
        let e = entity();
        let a = comment(&e, None, 0);
        let b = comment(&e, None, 1);
        let mut t = CommentThread::new(e);
        assert!(!t.is_loaded());
        t.apply_snapshot(vec![a.clone()]);
        t.insert_pending(b.clone());
        assert_eq!(ids(&t), vec![a.id, b.id]);
        assert!(t.entries()[1].pending);

        t.apply_snapshot(vec![a.clone(), b.clone()]);
        assert_eq!(ids(&t), vec![a.id, b.id]);
        assert!(!t.is_pending(b.id));

        // A late confirmation is a no-op
        t.confirm_pending(b.clone());
        assert_eq!(ids(&t), vec![a.id, b.id]);
    }

    #[test]
    fn snapshot_then_confirm() {
        let e = entity();
        let a = comment(&e, None, 0);
        let mut t = CommentThread::new(e);
        t.insert_pending(a.clone());
        let mut stored = a.clone();
        stored.created_at = stored.created_at + chrono::Duration::seconds(3);
        t.confirm_pending(stored.clone());
        assert_eq!(t.comments(), vec![stored.clone()]);
        t.apply_snapshot(vec![stored.clone()]);
        assert_eq!(t.comments(), vec![stored]);
    }

    #[test]
    fn stored_comment_deleted_before_any_snapshot_goes_away() {
        let e = entity();
        let a = comment(&e, None, 0);
        let mine = comment(&e, None, 1);
        let later = comment(&e, None, 2);
        let mut t = CommentThread::new(e);
        t.apply_snapshot(vec![a.clone()]);
        t.insert_pending(mine.clone());

        // Read before the write landed
        t.apply_snapshot(vec![a.clone()]);
        assert_eq!(ids(&t), vec![a.id, mine.id]);
        t.confirm_pending(mine.clone());
        t.apply_snapshot(vec![a.clone()]);
        assert_eq!(ids(&t), vec![a.id, mine.id]);
        assert!(t.is_pending(mine.id));

        // Deleted, then someone else commented
        t.apply_snapshot(vec![a.clone(), later.clone()]);
        assert_eq!(ids(&t), vec![a.id, later.id]);
        assert!(!t.is_pending(mine.id));
    }

    #[test]
    fn unconfirmed_comments_survive_newer_snapshots() {
        let e = entity();
        let mine = comment(&e, None, 0);
        let later = comment(&e, None, 5);
        let mut t = CommentThread::new(e);
        t.insert_pending(mine.clone());
        t.apply_snapshot(vec![later.clone()]);
        assert_eq!(ids(&t), vec![later.id, mine.id]);
    }

    #[test]
    fn fuzz_reconciliation_order_does_not_matter() {
        // Any interleaving of "local insert", "confirm" and "snapshot" for the
        // same comment ends with exactly one copy of it
        bolero::check!()
            .with_type::<Vec<u8>>()
            .cloned()
            .for_each(|ops| {
                let e = entity();
                let base = comment(&e, None, 0);
                let new = comment(&e, None, 1);
                let mut t = CommentThread::new(e);
                t.apply_snapshot(vec![base.clone()]);
                for op in &ops {
                    match op % 3 {
                        0 => t.insert_pending(new.clone()),
                        1 => t.confirm_pending(new.clone()),
                        _ => t.apply_snapshot(vec![base.clone(), new.clone()]),
                    }
                }
                t.apply_snapshot(vec![base.clone(), new.clone()]);
                assert_eq!(ids(&t), vec![base.id, new.id]);
                assert!(!t.is_pending(new.id));
            });
    }

    #[test]
    fn hidden_until_deletion_converges() {
        let e = entity();
        let a = comment(&e, None, 0);
        let b = comment(&e, None, 1);
        let mut t = CommentThread::new(e);
        t.apply_snapshot(vec![a.clone(), b.clone()]);
        t.hide([a.id]);
        assert_eq!(ids(&t), vec![b.id]);

        // Snapshot still containing a: still hidden
        t.apply_snapshot(vec![a.clone(), b.clone()]);
        assert_eq!(ids(&t), vec![b.id]);

        t.apply_snapshot(vec![b.clone()]);
        // If it came back, it would not be hidden anymore
        t.apply_snapshot(vec![a.clone(), b.clone()]);
        assert_eq!(ids(&t), vec![a.id, b.id]);

        t.hide([b.id]);
        t.unhide([b.id]);
        assert_eq!(ids(&t), vec![a.id, b.id]);
    }

    #[test]
    fn entries_carry_interaction_state() {
        let e = entity();
        let a = comment(&e, None, 0);
        let b = comment(&e, Some(a.id), 1);
        let mut t = CommentThread::new(e);
        t.apply_snapshot(vec![a.clone(), b.clone()]);
        assert_eq!(t.upvote(a.id), Some(Vote::Up));

        let entries = t.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reply_count, 1);
        assert_eq!(entries[0].vote, Some(Vote::Up));
        assert_eq!(entries[0].score, 1);
        assert!(!entries[0].expanded);

        assert!(t.toggle_thread(a.id));
        let entries = t.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].expanded);
        assert_eq!(entries[1].depth, 1);
        assert_eq!(entries[1].vote, None);
    }
}
