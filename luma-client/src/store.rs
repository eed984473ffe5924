use std::{collections::HashSet, convert::TryFrom, sync::Arc};

use crate::{
    api::{Backend, Comment, CommentId, CommentRecord, EntityRef, Error, NewComment},
    Session,
};

/// Turn raw records into the comments of `entity`, in creation order
///
/// Records that do not validate, or that belong to another entity, are
/// dropped with a warning rather than failing the whole snapshot. A record
/// whose entity has the right id but another kind or owner counts as
/// belonging to another entity.
pub fn normalize_snapshot(entity: &EntityRef, records: Vec<CommentRecord>) -> Vec<Comment> {
    let mut seen = HashSet::new();
    let mut res = records
        .into_iter()
        .filter_map(|r| match Comment::try_from(r) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(entity=?entity.id, "dropping comment record: {e}");
                None
            }
        })
        .filter(|c| {
            if c.entity != *entity {
                tracing::warn!(comment=?c.id, "dropping comment from another entity");
                return false;
            }
            seen.insert(c.id)
        })
        .collect::<Vec<_>>();
    // Stable, so equal timestamps keep the store's order
    res.sort_by_key(|c| c.created_at);
    res
}

/// Comment operations against a backend, on behalf of one session
pub struct CommentStore<B: ?Sized> {
    backend: Arc<B>,
    session: Session,
}

impl<B: ?Sized> Clone for CommentStore<B> {
    fn clone(&self) -> Self {
        CommentStore {
            backend: self.backend.clone(),
            session: self.session.clone(),
        }
    }
}

impl<B: ?Sized + Backend> CommentStore<B> {
    pub fn new(backend: Arc<B>, session: Session) -> CommentStore<B> {
        CommentStore { backend, session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Validate a new comment without touching the backend
    pub fn prepare_comment(
        &self,
        entity: &EntityRef,
        parent_id: Option<CommentId>,
        text: String,
    ) -> Result<NewComment, Error> {
        let author_id = self.session.require_user()?;
        let comment = NewComment {
            id: CommentId::new(),
            entity: *entity,
            parent_id,
            author_id,
            author_name: self.session.name.clone(),
            text,
        };
        comment.validate()?;
        Ok(comment)
    }

    /// Write a prepared comment
    ///
    /// Submitting the same comment twice is harmless: if the first write
    /// landed but its response was lost, the stored copy is returned.
    pub async fn submit(&self, comment: NewComment) -> Result<Comment, Error> {
        match self.backend.insert_comment(comment.clone()).await {
            Err(Error::UuidAlreadyUsed(id)) if id == comment.id.0 => {
                let stored = self
                    .backend
                    .get_comment(comment.id)
                    .await?
                    .ok_or(Error::UuidAlreadyUsed(id))
                    .and_then(Comment::try_from)?;
                if stored.author_id != comment.author_id || stored.entity != comment.entity {
                    return Err(Error::UuidAlreadyUsed(id));
                }
                tracing::debug!(comment=?comment.id, "comment was already stored");
                Ok(stored)
            }
            res => res,
        }
    }

    pub async fn create_comment(
        &self,
        entity: &EntityRef,
        parent_id: Option<CommentId>,
        text: String,
    ) -> Result<CommentId, Error> {
        let comment = self.prepare_comment(entity, parent_id, text)?;
        Ok(self.submit(comment).await?.id)
    }

    async fn fetch(&self, id: CommentId) -> Result<Option<Comment>, Error> {
        match self.backend.get_comment(id).await? {
            None => Ok(None),
            Some(r) => Ok(Some(Comment::try_from(r)?)),
        }
    }

    pub async fn edit_comment(&self, id: CommentId, text: String) -> Result<(), Error> {
        let user = self.session.require_user()?;
        crate::api::validate_comment_text(&text)?;
        let comment = self.fetch(id).await?.ok_or(Error::NotFound(id))?;
        if comment.author_id != user {
            return Err(Error::PermissionDenied);
        }
        if !self.backend.update_comment_text(id, text).await? {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    /// Delete one comment; deleting an absent comment succeeds
    pub async fn delete_comment(&self, id: CommentId) -> Result<(), Error> {
        self.session.require_user()?;
        let comment = match self.fetch(id).await? {
            Some(c) => c,
            None => {
                tracing::debug!(comment=?id, "comment already deleted");
                return Ok(());
            }
        };
        if !self.can_delete(&comment) {
            return Err(Error::PermissionDenied);
        }
        match self.backend.remove_comments(&[id]).await {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_comments(&self, entity: &EntityRef) -> Result<Vec<Comment>, Error> {
        let records = self.backend.list_comments(entity.id).await?;
        Ok(normalize_snapshot(entity, records))
    }

    /// Every comment of the current user, on any entity, newest first
    pub async fn list_my_comments(&self) -> Result<Vec<Comment>, Error> {
        let user = self.session.require_user()?;
        let records = self.backend.list_comments_by_author(user).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| match Comment::try_from(r) {
                Ok(c) if c.author_id == user => Some(c),
                Ok(c) => {
                    tracing::warn!(comment=?c.id, "dropping comment by another author");
                    None
                }
                Err(e) => {
                    tracing::warn!(?user, "dropping comment record: {e}");
                    None
                }
            })
            .collect())
    }

    /// Delete `root` and all its transitive replies, in one atomic batch
    ///
    /// Returns the ids that were removed. An absent root is a successful
    /// no-op.
    pub async fn delete_thread(
        &self,
        entity: &EntityRef,
        root: CommentId,
    ) -> Result<Vec<CommentId>, Error> {
        self.session.require_user()?;
        let root_comment = match self.fetch(root).await? {
            Some(c) if c.entity.id == entity.id => c,
            _ => {
                tracing::debug!(comment=?root, "thread already deleted");
                return Ok(Vec::new());
            }
        };
        if !self.can_delete_thread(entity, &root_comment) {
            return Err(Error::PermissionDenied);
        }
        let ids = self.backend.remove_thread(entity.id, root).await?;
        tracing::debug!(comment=?root, removed = ids.len(), "deleted thread");
        Ok(ids)
    }

    /// Whether the current user may delete `comment`: they wrote it, or they
    /// own what it comments on
    pub fn can_delete(&self, comment: &Comment) -> bool {
        match self.session.user {
            None => false,
            Some(u) => comment.author_id == u || comment.entity.is_owner(u),
        }
    }

    pub fn can_delete_thread(&self, entity: &EntityRef, root: &Comment) -> bool {
        match self.session.user {
            None => false,
            Some(u) => entity.is_owner(u) || root.author_id == u,
        }
    }

    pub fn can_edit(&self, comment: &Comment) -> bool {
        self.session.user == Some(comment.author_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::UserId, testutil::*};
    use luma_mock_server::MockBackend;

    fn store(backend: &Arc<MockBackend>, user: UserId) -> CommentStore<MockBackend> {
        CommentStore::new(backend.clone(), Session::new(user, String::from("Ada")))
    }

    #[tokio::test]
    async fn create_and_list() {
        let backend = Arc::new(MockBackend::new());
        let e = entity();
        let s = store(&backend, user());
        let a = s.create_comment(&e, None, String::from("first")).await.unwrap();
        let b = s
            .create_comment(&e, Some(a), String::from("reply"))
            .await
            .unwrap();
        let listed = s.list_comments(&e).await.unwrap();
        assert_eq!(listed.iter().map(|c| c.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(listed[1].parent_id, Some(a));
        assert_eq!(listed[0].author_name, "Ada");
        assert!(!listed[0].is_original_poster);

        let op = store(&backend, e.owner_id);
        let c = op.create_comment(&e, None, String::from("op")).await.unwrap();
        let listed = op.list_comments(&e).await.unwrap();
        assert!(listed.iter().find(|x| x.id == c).unwrap().is_original_poster);
    }

    #[tokio::test]
    async fn validation_happens_before_the_store() {
        let backend = Arc::new(MockBackend::new());
        let e = entity();
        let s = store(&backend, user());
        assert_eq!(
            s.create_comment(&e, None, String::from("   ")).await,
            Err(Error::EmptyText)
        );
        let anon = CommentStore::new(backend.clone(), Session::anonymous());
        assert_eq!(
            anon.create_comment(&e, None, String::from("hi")).await,
            Err(Error::NotAuthenticated)
        );
        assert_eq!(backend.test_num_comments(), 0);
    }

    #[tokio::test]
    async fn resubmitting_is_harmless() {
        let backend = Arc::new(MockBackend::new());
        let e = entity();
        let s = store(&backend, user());
        let new = s.prepare_comment(&e, None, String::from("hi")).unwrap();
        let first = s.submit(new.clone()).await.unwrap();
        let second = s.submit(new).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.test_num_comments(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = Arc::new(MockBackend::new());
        let e = entity();
        let s = store(&backend, user());
        let a = s.create_comment(&e, None, String::from("hi")).await.unwrap();
        s.delete_comment(a).await.unwrap();
        s.delete_comment(a).await.unwrap();
        assert!(s.list_comments(&e).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_permissions() {
        let backend = Arc::new(MockBackend::new());
        let e = entity();
        let author = store(&backend, user());
        let stranger = store(&backend, user());
        let owner = store(&backend, e.owner_id);

        let a = author.create_comment(&e, None, String::from("hi")).await.unwrap();
        assert_eq!(stranger.delete_comment(a).await, Err(Error::PermissionDenied));
        assert_eq!(
            stranger.edit_comment(a, String::from("mine now")).await,
            Err(Error::PermissionDenied)
        );
        owner.delete_comment(a).await.unwrap();
        assert_eq!(backend.test_num_comments(), 0);
    }

    #[tokio::test]
    async fn edit() {
        let backend = Arc::new(MockBackend::new());
        let e = entity();
        let s = store(&backend, user());
        let a = s.create_comment(&e, None, String::from("hi")).await.unwrap();
        s.edit_comment(a, String::from("hello")).await.unwrap();
        let listed = s.list_comments(&e).await.unwrap();
        assert_eq!(listed[0].text, "hello");
        assert!(listed[0].updated_at.is_some());
        let missing = CommentId::new();
        assert_eq!(
            s.edit_comment(missing, String::from("x")).await,
            Err(Error::NotFound(missing))
        );
        assert_eq!(
            s.edit_comment(a, String::new()).await,
            Err(Error::EmptyText)
        );
    }

    #[tokio::test]
    async fn thread_deletion() {
        let backend = Arc::new(MockBackend::new());
        let e = entity();
        let owner = store(&backend, e.owner_id);
        let other = store(&backend, user());

        // A <- B <- C, A <- D, plus an unrelated Z
        let a = other.create_comment(&e, None, String::from("A")).await.unwrap();
        let b = other.create_comment(&e, Some(a), String::from("B")).await.unwrap();
        let c = other.create_comment(&e, Some(b), String::from("C")).await.unwrap();
        let d = other.create_comment(&e, Some(a), String::from("D")).await.unwrap();
        let z = other.create_comment(&e, None, String::from("Z")).await.unwrap();

        let removed = owner.delete_thread(&e, b).await.unwrap();
        assert_eq!(
            removed.into_iter().collect::<HashSet<_>>(),
            HashSet::from([b, c])
        );
        let left = owner.list_comments(&e).await.unwrap();
        assert_eq!(left.iter().map(|c| c.id).collect::<Vec<_>>(), vec![a, d, z]);

        let removed = owner.delete_thread(&e, a).await.unwrap();
        assert_eq!(
            removed.into_iter().collect::<HashSet<_>>(),
            HashSet::from([a, d])
        );
        assert_eq!(owner.delete_thread(&e, a).await.unwrap(), vec![]);

        let stranger = store(&backend, user());
        assert_eq!(
            stranger.delete_thread(&e, z).await,
            Err(Error::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn root_author_deletes_replies_of_others() {
        let backend = Arc::new(MockBackend::new());
        let e = entity();
        let alice = store(&backend, user());
        let bob = store(&backend, user());
        let a = alice.create_comment(&e, None, String::from("A")).await.unwrap();
        let b = bob.create_comment(&e, Some(a), String::from("B")).await.unwrap();

        let root = alice.list_comments(&e).await.unwrap().remove(0);
        assert!(alice.can_delete_thread(&e, &root));
        assert_eq!(bob.delete_thread(&e, a).await, Err(Error::PermissionDenied));
        let removed = alice.delete_thread(&e, a).await.unwrap();
        assert_eq!(
            removed.into_iter().collect::<HashSet<_>>(),
            HashSet::from([a, b])
        );
        assert_eq!(backend.test_num_comments(), 0);
    }

    #[tokio::test]
    async fn my_comments() {
        let backend = Arc::new(MockBackend::new());
        let me = store(&backend, user());
        let other = store(&backend, user());
        let a = me.create_comment(&entity(), None, String::from("A")).await.unwrap();
        other.create_comment(&entity(), None, String::from("B")).await.unwrap();
        let c = me.create_comment(&entity(), None, String::from("C")).await.unwrap();
        let mine = me.list_my_comments().await.unwrap();
        assert_eq!(mine.iter().map(|c| c.id).collect::<Vec<_>>(), vec![c, a]);

        let anon = CommentStore::new(backend.clone(), Session::anonymous());
        assert_eq!(anon.list_my_comments().await, Err(Error::NotAuthenticated));
    }

    #[tokio::test]
    async fn thread_deletion_is_atomic() {
        let backend = Arc::new(MockBackend::new());
        let e = entity();
        let owner = store(&backend, e.owner_id);
        let a = owner.create_comment(&e, None, String::from("A")).await.unwrap();
        owner.create_comment(&e, Some(a), String::from("B")).await.unwrap();
        backend.fail_writes(1);
        assert!(matches!(
            owner.delete_thread(&e, a).await,
            Err(Error::Unavailable(_))
        ));
        assert_eq!(backend.test_num_comments(), 2);
    }

    #[test]
    fn snapshot_normalization() {
        let e = entity();
        let a = comment(&e, None, 5);
        let b = comment(&e, None, 3);
        let foreign = comment(&entity(), None, 1);
        let forged = comment(
            &EntityRef {
                owner_id: user(),
                ..e
            },
            None,
            2,
        );
        let records = vec![
            CommentRecord::from(a.clone()),
            CommentRecord::default(),
            CommentRecord::from(foreign),
            CommentRecord::from(forged),
            CommentRecord::from(b.clone()),
            CommentRecord::from(a.clone()),
        ];
        assert_eq!(normalize_snapshot(&e, records), vec![b, a]);
    }
}
