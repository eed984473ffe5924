use std::collections::{HashMap, HashSet};

use crate::{
    api::{CommentId, EntityRef},
    load_json, store_json, LocalStorage,
};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Vote {
    Up,
    Down,
}

/// Votes cast from this device
///
/// These are never sent to the backend: they only live in memory and in
/// local storage, so other users and devices do not see them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VoteTracker {
    upvoted: HashSet<CommentId>,
    downvoted: HashSet<CommentId>,
    counts: HashMap<CommentId, i64>,
}

#[derive(Default, serde::Deserialize, serde::Serialize)]
struct StoredVotes {
    upvoted: Vec<CommentId>,
    downvoted: Vec<CommentId>,
    counts: Vec<(CommentId, i64)>,
}

impl VoteTracker {
    pub fn new() -> VoteTracker {
        VoteTracker::default()
    }

    pub fn storage_key(entity: &EntityRef) -> String {
        format!("votes:{}:{}", entity.kind, entity.id.0)
    }

    pub fn vote(&self, id: CommentId) -> Option<Vote> {
        if self.upvoted.contains(&id) {
            Some(Vote::Up)
        } else if self.downvoted.contains(&id) {
            Some(Vote::Down)
        } else {
            None
        }
    }

    /// Local score delta of `id`
    pub fn count(&self, id: CommentId) -> i64 {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    fn bump(&mut self, id: CommentId, delta: i64) {
        let c = self.counts.entry(id).or_insert(0);
        *c += delta;
        if *c == 0 {
            self.counts.remove(&id);
        }
    }

    /// Toggle an upvote, replacing any downvote; returns the resulting vote
    pub fn upvote(&mut self, id: CommentId) -> Option<Vote> {
        if self.upvoted.remove(&id) {
            self.bump(id, -1);
            return None;
        }
        if self.downvoted.remove(&id) {
            self.bump(id, 1);
        }
        self.upvoted.insert(id);
        self.bump(id, 1);
        Some(Vote::Up)
    }

    /// Toggle a downvote, replacing any upvote; returns the resulting vote
    pub fn downvote(&mut self, id: CommentId) -> Option<Vote> {
        if self.downvoted.remove(&id) {
            self.bump(id, 1);
            return None;
        }
        if self.upvoted.remove(&id) {
            self.bump(id, -1);
        }
        self.downvoted.insert(id);
        self.bump(id, -1);
        Some(Vote::Down)
    }

    pub fn forget(&mut self, id: CommentId) {
        self.upvoted.remove(&id);
        self.downvoted.remove(&id);
        self.counts.remove(&id);
    }

    pub fn load(storage: &dyn LocalStorage, entity: &EntityRef) -> anyhow::Result<VoteTracker> {
        let stored: StoredVotes =
            load_json(storage, &VoteTracker::storage_key(entity))?.unwrap_or_default();
        let mut res = VoteTracker {
            upvoted: stored.upvoted.into_iter().collect(),
            downvoted: stored.downvoted.into_iter().collect(),
            counts: stored.counts.into_iter().filter(|(_, c)| *c != 0).collect(),
        };
        // A corrupted file could list an id in both sets
        let both = res
            .upvoted
            .intersection(&res.downvoted)
            .copied()
            .collect::<Vec<_>>();
        for id in both {
            tracing::warn!(comment=?id, "stored votes had both an upvote and a downvote");
            res.forget(id);
        }
        Ok(res)
    }

    pub fn save(&self, storage: &dyn LocalStorage, entity: &EntityRef) -> anyhow::Result<()> {
        store_json(
            storage,
            &VoteTracker::storage_key(entity),
            &StoredVotes {
                upvoted: self.upvoted.iter().copied().collect(),
                downvoted: self.downvoted.iter().copied().collect(),
                counts: self.counts.iter().map(|(id, c)| (*id, *c)).collect(),
            },
        )
    }
}
