use std::convert::TryFrom;

use axum::{
    extract::{ws::Message, Path, State, WebSocketUpgrade},
    Json,
};
use futures::{SinkExt, StreamExt};
use luma_api::{
    AuthToken, Backend, Comment, CommentEdit, CommentId, CommentRecord, EntityId,
    Error as ApiError, NewComment, ThreadRemoval, UserId, Uuid,
};

use crate::{extractors::*, feeds, Error};

pub async fn whoami(Auth(user): Auth) -> Json<UserId> {
    Json(user)
}

pub async fn list_comments(
    Auth(_): Auth,
    State(backend): State<DynBackend>,
    Path(entity): Path<Uuid>,
) -> Result<Json<Vec<CommentRecord>>, Error> {
    Ok(Json(backend.list_comments(EntityId(entity)).await?))
}

pub async fn fetch_comment(
    Auth(_): Auth,
    State(backend): State<DynBackend>,
    Path(id): Path<Uuid>,
) -> Result<Json<Option<CommentRecord>>, Error> {
    Ok(Json(backend.get_comment(CommentId(id)).await?))
}

pub async fn list_my_comments(
    Auth(user): Auth,
    State(backend): State<DynBackend>,
) -> Result<Json<Vec<CommentRecord>>, Error> {
    Ok(Json(backend.list_comments_by_author(user).await?))
}

async fn fetch_existing(backend: &DynBackend, id: CommentId) -> Result<Comment, Error> {
    let record = backend
        .get_comment(id)
        .await?
        .ok_or(ApiError::NotFound(id))?;
    Ok(Comment::try_from(record)?)
}

pub async fn create_comment(
    Auth(user): Auth,
    State(backend): State<DynBackend>,
    Json(comment): Json<NewComment>,
) -> Result<Json<Comment>, Error> {
    comment.validate()?;
    if comment.author_id != user {
        return Err(Error::permission_denied());
    }
    Ok(Json(backend.insert_comment(comment).await?))
}

pub async fn edit_comment(
    Auth(user): Auth,
    State(backend): State<DynBackend>,
    Json(edit): Json<CommentEdit>,
) -> Result<(), Error> {
    luma_api::validate_comment_text(&edit.text)?;
    let comment = fetch_existing(&backend, edit.id).await?;
    if comment.author_id != user {
        return Err(Error::permission_denied());
    }
    if !backend.update_comment_text(edit.id, edit.text).await? {
        // Removed since we looked it up
        return Err(Error::Api(ApiError::NotFound(edit.id)));
    }
    Ok(())
}

/// Remove a batch of comments, each of which must be removable by the user
///
/// Ids that do not exist are ignored. If any of the others is not the user's
/// nor on an entity they own, nothing is removed.
pub async fn remove_comments(
    Auth(user): Auth,
    State(backend): State<DynBackend>,
    Json(ids): Json<Vec<CommentId>>,
) -> Result<Json<usize>, Error> {
    for id in &ids {
        let comment = match backend.get_comment(*id).await? {
            None => continue,
            Some(record) => Comment::try_from(record)?,
        };
        if comment.author_id != user && !comment.entity.is_owner(user) {
            tracing::info!(?user, comment=?id, "refusing removal of someone else's comment");
            return Err(Error::permission_denied());
        }
    }
    Ok(Json(backend.remove_comments(&ids).await?))
}

/// Remove a comment together with all its transitive replies
///
/// The comment's author and the entity owner may do so whoever wrote the
/// replies. A root that is absent or on another entity removes nothing.
pub async fn remove_thread(
    Auth(user): Auth,
    State(backend): State<DynBackend>,
    Json(removal): Json<ThreadRemoval>,
) -> Result<Json<Vec<CommentId>>, Error> {
    let root = match backend.get_comment(removal.root).await? {
        None => return Ok(Json(Vec::new())),
        Some(record) => Comment::try_from(record)?,
    };
    if root.entity.id != removal.entity {
        return Ok(Json(Vec::new()));
    }
    if root.author_id != user && !root.entity.is_owner(user) {
        tracing::info!(?user, root=?removal.root, "refusing removal of someone else's thread");
        return Err(Error::permission_denied());
    }
    Ok(Json(
        backend.remove_thread(removal.entity, removal.root).await?,
    ))
}

pub async fn comment_feed(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(entity): Path<Uuid>,
) -> Result<axum::response::Response, Error> {
    Ok(ws.on_upgrade(move |sock| {
        let (write, read) = sock.split();
        comment_feed_impl(EntityId(entity), write, read, state)
    }))
}

/// Authenticate a feed websocket, then pump snapshots to it
///
/// The first message must be the session token as text. It is answered with
/// "ok", or "permission denied" before closing.
pub async fn comment_feed_impl<W, R>(entity: EntityId, mut write: W, mut read: R, state: AppState)
where
    W: 'static + Send + Unpin + futures::Sink<Message>,
    <W as futures::Sink<Message>>::Error: Send,
    R: 'static + Send + Unpin + futures::Stream<Item = Result<Message, axum::Error>>,
{
    tracing::debug!(?entity, "comment feed websocket connected");
    if let Some(Ok(Message::Text(token))) = read.next().await {
        if let Ok(token) = Uuid::try_from(&token as &str) {
            if let Ok(user) = state.recover_session(AuthToken(token)).await {
                match state.backend.subscribe(entity).await {
                    Ok(snapshots) => {
                        if write.send(Message::Text(String::from("ok"))).await.is_ok() {
                            tracing::debug!(?user, ?entity, "comment feed websocket auth success");
                            feeds::pump_feed(entity, snapshots, write, read).await;
                        }
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(?err, ?entity, "failed subscribing to comment feed");
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
        }
        tracing::debug!(?token, "comment feed websocket auth failure");
        let _ = write
            .send(Message::Text(String::from("permission denied")))
            .await;
    }
}
