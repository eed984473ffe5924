use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    api::{Backend, CommentId, EntityRef, Error},
    collect_thread, CommentStore, CommentThread, LiveSync, LocalStorage, Session, Subscription,
    SyncState, ThreadEntry, Vote, VoteTracker,
};

struct Shared {
    thread: Mutex<Option<CommentThread>>,
    revision: watch::Sender<u64>,
}

impl Shared {
    /// Run `f` on the thread of `entity`, if it is still the mounted one
    fn with_thread<R>(&self, entity: &EntityRef, f: impl FnOnce(&mut CommentThread) -> R) -> Option<R> {
        let res = {
            let mut thread = self.thread.lock();
            match thread.as_mut() {
                Some(t) if t.entity() == entity => Some(f(t)),
                _ => None,
            }
        };
        match res {
            Some(_) => self.bump(),
            None => tracing::debug!(entity=?entity.id, "discarding result for unmounted entity"),
        }
        res
    }

    fn read<R>(&self, entity: &EntityRef, f: impl FnOnce(&CommentThread) -> R) -> Option<R> {
        self.thread
            .lock()
            .as_ref()
            .filter(|t| t.entity() == entity)
            .map(f)
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

/// The comment section of one post or profile screen
///
/// Mounting an entity subscribes to its comments; user actions update the
/// local state immediately, then go through the store. Every change bumps
/// the revision published by `changes`, upon which `entries` should be
/// re-read.
pub struct CommentSection<B: ?Sized> {
    store: CommentStore<B>,
    sync: LiveSync<B>,
    storage: Arc<dyn LocalStorage>,
    shared: Arc<Shared>,
    subscription: Option<Subscription>,
}

impl<B: ?Sized + Backend + 'static> CommentSection<B> {
    pub fn new(backend: Arc<B>, session: Session, storage: Arc<dyn LocalStorage>) -> CommentSection<B> {
        let (revision, _) = watch::channel(0);
        CommentSection {
            store: CommentStore::new(backend.clone(), session),
            sync: LiveSync::new(backend),
            storage,
            shared: Arc::new(Shared {
                thread: Mutex::new(None),
                revision,
            }),
            subscription: None,
        }
    }

    pub fn with_retry_spacing(mut self, retry_spacing: Duration) -> CommentSection<B> {
        self.sync = self.sync.with_retry_spacing(retry_spacing);
        self
    }

    pub fn store(&self) -> &CommentStore<B> {
        &self.store
    }

    pub fn mounted(&self) -> Option<EntityRef> {
        self.shared.thread.lock().as_ref().map(|t| *t.entity())
    }

    /// Show the comments of `entity`, replacing whatever was shown before
    pub fn mount(&mut self, entity: EntityRef) {
        if self.mounted() == Some(entity) {
            return;
        }
        self.unmount();
        let votes = VoteTracker::load(&*self.storage, &entity).unwrap_or_else(|e| {
            tracing::warn!(entity=?entity.id, "failed loading stored votes: {e:#}");
            VoteTracker::new()
        });
        *self.shared.thread.lock() = Some(CommentThread::with_votes(entity, votes));
        self.shared.bump();
        let shared = self.shared.clone();
        self.subscription = Some(self.sync.subscribe(entity, move |comments| {
            shared.with_thread(&entity, |t| t.apply_snapshot(comments));
        }));
        tracing::debug!(entity=?entity.id, "mounted comment section");
    }

    pub fn unmount(&mut self) {
        // Dropping the subscription stops all deliveries
        self.subscription = None;
        if let Some(t) = self.shared.thread.lock().take() {
            tracing::debug!(entity=?t.entity().id, "unmounted comment section");
        }
        self.shared.bump();
    }

    /// Revision counter, bumped on every change of the displayed state
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn sync_state(&self) -> SyncState {
        self.subscription
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(SyncState::Idle)
    }

    /// Whether a section is mounted but its first snapshot did not arrive yet
    pub fn is_loading(&self) -> bool {
        matches!(self.shared.thread.lock().as_ref(), Some(t) if !t.is_loaded())
    }

    pub fn entries(&self) -> Vec<ThreadEntry> {
        self.shared
            .thread
            .lock()
            .as_ref()
            .map(|t| t.entries())
            .unwrap_or_default()
    }

    fn require_mounted(&self) -> Result<EntityRef, Error> {
        self.mounted()
            .ok_or_else(|| Error::Unknown(String::from("no comment section is mounted")))
    }

    /// Post a comment, or a reply to `parent_id`
    ///
    /// The comment is shown right away, and removed again if the write fails.
    pub async fn post(&self, parent_id: Option<CommentId>, text: String) -> Result<CommentId, Error> {
        let entity = self.require_mounted()?;
        let new = self.store.prepare_comment(&entity, parent_id, text)?;
        let id = new.id;
        let local = new.clone().into_comment(chrono::Utc::now());
        self.shared.with_thread(&entity, |t| t.insert_pending(local));
        match self.store.submit(new).await {
            Ok(stored) => {
                self.shared.with_thread(&entity, |t| t.confirm_pending(stored));
                Ok(id)
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::warn!(comment=?id, "failed posting comment: {e}");
                }
                self.shared.with_thread(&entity, |t| t.discard_pending(id));
                Err(e)
            }
        }
    }

    pub async fn edit(&self, id: CommentId, text: String) -> Result<(), Error> {
        self.require_mounted()?;
        self.store.edit_comment(id, text).await
    }

    /// Delete one comment, hiding it until the store confirms
    pub async fn delete(&self, id: CommentId) -> Result<(), Error> {
        let entity = self.require_mounted()?;
        let (comment, pending) = match self
            .shared
            .read(&entity, |t| t.get(id).cloned().map(|c| (c, t.is_pending(id))))
            .flatten()
        {
            Some(c) => c,
            None => return Ok(()),
        };
        if pending {
            return Err(Error::Unavailable(String::from(
                "comment is still being posted",
            )));
        }
        if !self.store.can_delete(&comment) {
            return Err(Error::PermissionDenied);
        }
        self.shared.with_thread(&entity, |t| t.hide([id]));
        if let Err(e) = self.store.delete_comment(id).await {
            self.shared.with_thread(&entity, |t| t.unhide([id]));
            return Err(e);
        }
        Ok(())
    }

    /// Delete a comment and all its replies, hiding them until the store
    /// confirms
    pub async fn delete_thread(&self, root: CommentId) -> Result<Vec<CommentId>, Error> {
        let entity = self.require_mounted()?;
        let local = self
            .shared
            .read(&entity, |t| t.get(root).cloned().map(|c| (c, t.comments())))
            .flatten();
        let (root_comment, comments) = match local {
            Some(l) => l,
            None => return Ok(Vec::new()),
        };
        if !self.store.can_delete_thread(&entity, &root_comment) {
            return Err(Error::PermissionDenied);
        }
        let hidden = collect_thread(&comments, root);
        self.shared.with_thread(&entity, |t| t.hide(hidden.iter().copied()));
        match self.store.delete_thread(&entity, root).await {
            Ok(ids) => Ok(ids),
            Err(e) => {
                self.shared.with_thread(&entity, |t| t.unhide(hidden));
                Err(e)
            }
        }
    }

    fn vote(&self, id: CommentId, f: impl FnOnce(&mut CommentThread) -> Option<Vote>) -> Option<Vote> {
        let entity = self.mounted()?;
        let (vote, votes) = self
            .shared
            .with_thread(&entity, |t| (f(t), t.votes().clone()))?;
        if let Err(e) = votes.save(&*self.storage, &entity) {
            tracing::warn!(comment=?id, "failed saving votes: {e:#}");
        }
        vote
    }

    pub fn upvote(&self, id: CommentId) -> Option<Vote> {
        self.vote(id, |t| t.upvote(id))
    }

    pub fn downvote(&self, id: CommentId) -> Option<Vote> {
        self.vote(id, |t| t.downvote(id))
    }

    /// Returns whether the thread is expanded after the toggle
    pub fn toggle_thread(&self, root: CommentId) -> bool {
        match self.mounted() {
            None => false,
            Some(entity) => self
                .shared
                .with_thread(&entity, |t| t.toggle_thread(root))
                .unwrap_or(false),
        }
    }
}
