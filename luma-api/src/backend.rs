use std::{pin::Pin, sync::Arc};

use async_trait::async_trait;

use crate::{Comment, CommentId, CommentRecord, EntityId, Error, NewComment, UserId};

pub type SnapshotStream =
    Pin<Box<dyn Send + futures::Stream<Item = Result<Vec<CommentRecord>, Error>>>>;

/// The document store holding comments
///
/// Records are returned as stored, and callers are responsible for validating
/// them. Errors that come from the transport rather than the store itself
/// must be reported as `Error::Unavailable`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// All comments of `entity`, ordered by ascending creation time
    async fn list_comments(&self, entity: EntityId) -> Result<Vec<CommentRecord>, Error>;

    async fn get_comment(&self, id: CommentId) -> Result<Option<CommentRecord>, Error>;

    /// All comments written by `author` across every entity, newest first
    async fn list_comments_by_author(&self, author: UserId) -> Result<Vec<CommentRecord>, Error>;

    /// Store a new comment, stamping it with the store's current time
    ///
    /// The first comment of an entity pins its `EntityRef`. Later comments
    /// that disagree with it, most notably on the owner, are refused with
    /// `Error::PermissionDenied`.
    async fn insert_comment(&self, comment: NewComment) -> Result<Comment, Error>;

    /// Returns false if the comment does not exist
    async fn update_comment_text(&self, id: CommentId, text: String) -> Result<bool, Error>;

    /// Remove all of `ids` at once, or none of them on failure
    ///
    /// Ids that are already absent are ignored. Returns the number of
    /// comments actually removed.
    async fn remove_comments(&self, ids: &[CommentId]) -> Result<usize, Error>;

    /// Remove `root` and every comment of `entity` that transitively replies
    /// to it, at once
    ///
    /// Returns the removed ids, which is empty if `root` is not a comment of
    /// `entity`.
    async fn remove_thread(&self, entity: EntityId, root: CommentId)
        -> Result<Vec<CommentId>, Error>;

    /// Stream of full snapshots of `entity`'s comments
    ///
    /// The first item is the current state, then one item is sent per change.
    async fn subscribe(&self, entity: EntityId) -> Result<SnapshotStream, Error>;
}

#[async_trait]
impl<B: ?Sized + Backend> Backend for Arc<B> {
    async fn list_comments(&self, entity: EntityId) -> Result<Vec<CommentRecord>, Error> {
        (**self).list_comments(entity).await
    }

    async fn get_comment(&self, id: CommentId) -> Result<Option<CommentRecord>, Error> {
        (**self).get_comment(id).await
    }

    async fn list_comments_by_author(&self, author: UserId) -> Result<Vec<CommentRecord>, Error> {
        (**self).list_comments_by_author(author).await
    }

    async fn insert_comment(&self, comment: NewComment) -> Result<Comment, Error> {
        (**self).insert_comment(comment).await
    }

    async fn update_comment_text(&self, id: CommentId, text: String) -> Result<bool, Error> {
        (**self).update_comment_text(id, text).await
    }

    async fn remove_comments(&self, ids: &[CommentId]) -> Result<usize, Error> {
        (**self).remove_comments(ids).await
    }

    async fn remove_thread(
        &self,
        entity: EntityId,
        root: CommentId,
    ) -> Result<Vec<CommentId>, Error> {
        (**self).remove_thread(entity, root).await
    }

    async fn subscribe(&self, entity: EntityId) -> Result<SnapshotStream, Error> {
        (**self).subscribe(entity).await
    }
}
