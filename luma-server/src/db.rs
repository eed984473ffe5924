use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
use luma_api::{
    AuthToken, Backend, Comment, CommentId, CommentRecord, EntityId, EntityKind, EntityRef,
    Error as ApiError, NewComment, SnapshotStream, Time, UserId, Uuid,
};
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::{extractors::SessionStore, CommentFeeds};

const COMMENT_COLUMNS: &str = "
    id, entity_kind, entity_id, entity_owner_id, parent_id, author_id, author_name,
    text, created_at, updated_at, is_original_poster
";

fn unavailable(err: anyhow::Error) -> ApiError {
    tracing::error!(?err, "comment database error");
    ApiError::Unavailable(String::from("comment database unavailable"))
}

fn record_from_row(row: &PgRow) -> anyhow::Result<CommentRecord> {
    let kind: String = row.try_get("entity_kind")?;
    // Unknown kinds are reported by the reader as a malformed record
    let entity = match kind.parse::<EntityKind>() {
        Err(_) => None,
        Ok(kind) => Some(EntityRef {
            kind,
            id: EntityId(row.try_get("entity_id")?),
            owner_id: UserId(row.try_get("entity_owner_id")?),
        }),
    };
    Ok(CommentRecord {
        id: Some(CommentId(row.try_get("id")?)),
        entity,
        parent_id: row.try_get::<Option<Uuid>, _>("parent_id")?.map(CommentId),
        author_id: Some(UserId(row.try_get("author_id")?)),
        author_name: row.try_get("author_name")?,
        text: Some(row.try_get("text")?),
        created_at: Some(row.try_get("created_at")?),
        updated_at: row.try_get("updated_at")?,
        is_original_poster: Some(row.try_get("is_original_poster")?),
    })
}

pub async fn fetch_comments(
    conn: &mut sqlx::PgConnection,
    entity: EntityId,
) -> anyhow::Result<Vec<CommentRecord>> {
    sqlx::query(&format!(
        "SELECT {COMMENT_COLUMNS} FROM comments WHERE entity_id = $1 ORDER BY created_at, id"
    ))
    .bind(entity.0)
    .fetch(&mut *conn)
    .map_err(anyhow::Error::from)
    .and_then(|row| async move { record_from_row(&row) })
    .try_collect::<Vec<_>>()
    .await
    .with_context(|| format!("fetching comments of entity {entity:?}"))
}

pub async fn fetch_comment(
    conn: &mut sqlx::PgConnection,
    id: CommentId,
) -> anyhow::Result<Option<CommentRecord>> {
    let row = sqlx::query(&format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE id = $1"))
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("fetching comment {id:?}"))?;
    row.as_ref().map(record_from_row).transpose()
}

/// Comment store backed by postgres, relaying snapshots to in-process feeds
#[derive(Clone, Debug)]
pub struct PgBackend {
    pool: PgPool,
    feeds: CommentFeeds,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> PgBackend {
        PgBackend {
            pool,
            feeds: CommentFeeds::new(),
        }
    }

    async fn snapshot(&self, entity: EntityId) -> anyhow::Result<Vec<CommentRecord>> {
        let mut conn = self.pool.acquire().await.context("acquiring db connection")?;
        fetch_comments(&mut *conn, entity).await
    }

    async fn relay(&self, entity: EntityId) {
        if !self.feeds.has_listeners(entity).await {
            return;
        }
        let _relaying = self.feeds.start_relay(entity).await;
        let snapshot = self.snapshot(entity).await.map_err(unavailable);
        self.feeds.relay_snapshot(entity, snapshot).await;
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn list_comments(&self, entity: EntityId) -> Result<Vec<CommentRecord>, ApiError> {
        self.snapshot(entity).await.map_err(unavailable)
    }

    async fn get_comment(&self, id: CommentId) -> Result<Option<CommentRecord>, ApiError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquiring db connection")
            .map_err(unavailable)?;
        fetch_comment(&mut *conn, id).await.map_err(unavailable)
    }

    async fn list_comments_by_author(&self, author: UserId) -> Result<Vec<CommentRecord>, ApiError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquiring db connection")
            .map_err(unavailable)?;
        sqlx::query(&format!(
            "SELECT {COMMENT_COLUMNS} FROM comments
             WHERE author_id = $1
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(author.0)
        .fetch(&mut *conn)
        .map_err(anyhow::Error::from)
        .and_then(|row| async move { record_from_row(&row) })
        .try_collect::<Vec<_>>()
        .await
        .with_context(|| format!("fetching comments of author {author:?}"))
        .map_err(unavailable)
    }

    async fn insert_comment(&self, comment: NewComment) -> Result<Comment, ApiError> {
        comment.validate()?;
        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning transaction")
            .map_err(unavailable)?;

        // Concurrent first comments wait on each other here, and the loser
        // reads the winner's row
        sqlx::query(
            "INSERT INTO entities (id, kind, owner_id) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(comment.entity.id.0)
        .bind(comment.entity.kind.to_string())
        .bind(comment.entity.owner_id.0)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("pinning entity {:?}", comment.entity.id))
        .map_err(unavailable)?;
        let pinned = sqlx::query("SELECT kind, owner_id FROM entities WHERE id = $1")
            .bind(comment.entity.id.0)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("fetching entity {:?}", comment.entity.id))
            .map_err(unavailable)?;
        let pinned_kind: String = pinned
            .try_get("kind")
            .context("reading entity kind")
            .map_err(unavailable)?;
        let pinned_owner: Uuid = pinned
            .try_get("owner_id")
            .context("reading entity owner")
            .map_err(unavailable)?;
        if pinned_kind != comment.entity.kind.to_string()
            || pinned_owner != comment.entity.owner_id.0
        {
            tracing::info!(entity=?comment.entity, "refusing comment disagreeing with its entity");
            return Err(ApiError::PermissionDenied);
        }

        if let Some(parent) = comment.parent_id {
            let parent_entity = sqlx::query("SELECT entity_id FROM comments WHERE id = $1")
                .bind(parent.0)
                .fetch_optional(&mut *tx)
                .await
                .with_context(|| format!("fetching parent comment {parent:?}"))
                .map_err(unavailable)?
                .map(|row| row.try_get::<Uuid, _>("entity_id"))
                .transpose()
                .context("reading parent entity")
                .map_err(unavailable)?;
            if parent_entity != Some(comment.entity.id.0) {
                return Err(ApiError::InvalidParent(parent));
            }
        }

        let is_original_poster = comment.entity.is_owner(comment.author_id);
        let created_at = sqlx::query(
            "
                INSERT INTO comments (
                    id, entity_kind, entity_id, entity_owner_id, parent_id,
                    author_id, author_name, text, is_original_poster
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT DO NOTHING
                RETURNING created_at
            ",
        )
        .bind(comment.id.0)
        .bind(comment.entity.kind.to_string())
        .bind(comment.entity.id.0)
        .bind(comment.entity.owner_id.0)
        .bind(comment.parent_id.map(|p| p.0))
        .bind(comment.author_id.0)
        .bind(comment.author_name.as_str())
        .bind(comment.text.as_str())
        .bind(is_original_poster)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("inserting comment {:?}", comment.id))
        .map_err(unavailable)?;
        let created_at: Time = match created_at {
            None => return Err(ApiError::UuidAlreadyUsed(comment.id.0)),
            Some(row) => row
                .try_get("created_at")
                .context("reading comment creation time")
                .map_err(unavailable)?,
        };
        tx.commit()
            .await
            .context("committing comment insertion")
            .map_err(unavailable)?;

        let comment = comment.into_comment(created_at);
        tracing::debug!(id=?comment.id, entity=?comment.entity.id, "stored new comment");
        self.relay(comment.entity.id).await;
        Ok(comment)
    }

    async fn update_comment_text(&self, id: CommentId, text: String) -> Result<bool, ApiError> {
        luma_api::validate_comment_text(&text)?;
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquiring db connection")
            .map_err(unavailable)?;
        let entity = sqlx::query(
            "
                UPDATE comments
                SET text = $2, updated_at = clock_timestamp()
                WHERE id = $1
                RETURNING entity_id
            ",
        )
        .bind(id.0)
        .bind(text.as_str())
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("updating comment {id:?}"))
        .map_err(unavailable)?;
        drop(conn);
        match entity {
            None => Ok(false),
            Some(row) => {
                let entity = EntityId(
                    row.try_get("entity_id")
                        .context("reading edited comment's entity")
                        .map_err(unavailable)?,
                );
                self.relay(entity).await;
                Ok(true)
            }
        }
    }

    async fn remove_comments(&self, ids: &[CommentId]) -> Result<usize, ApiError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.iter().map(|id| id.0).collect::<Vec<Uuid>>();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning transaction")
            .map_err(unavailable)?;
        let entities = sqlx::query("DELETE FROM comments WHERE id = ANY($1) RETURNING entity_id")
            .bind(&ids[..])
            .fetch(&mut *tx)
            .map_err(anyhow::Error::from)
            .and_then(|row| async move {
                row.try_get::<Uuid, _>("entity_id")
                    .map_err(anyhow::Error::from)
            })
            .try_collect::<Vec<Uuid>>()
            .await
            .with_context(|| format!("removing comments {ids:?}"))
            .map_err(unavailable)?;
        tx.commit()
            .await
            .context("committing comment removal")
            .map_err(unavailable)?;

        tracing::debug!(removed = entities.len(), "removed comments");
        for entity in entities.iter().copied().collect::<HashSet<_>>() {
            self.relay(EntityId(entity)).await;
        }
        Ok(entities.len())
    }

    async fn remove_thread(
        &self,
        entity: EntityId,
        root: CommentId,
    ) -> Result<Vec<CommentId>, ApiError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquiring db connection")
            .map_err(unavailable)?;
        // UNION rather than UNION ALL, so that a parent cycle terminates
        let removed = sqlx::query(
            "
                WITH RECURSIVE thread (id) AS (
                    SELECT id FROM comments WHERE id = $1 AND entity_id = $2
                    UNION
                    SELECT c.id FROM comments c
                    JOIN thread t ON c.parent_id = t.id
                    WHERE c.entity_id = $2
                )
                DELETE FROM comments WHERE id IN (SELECT id FROM thread)
                RETURNING id
            ",
        )
        .bind(root.0)
        .bind(entity.0)
        .fetch(&mut *conn)
        .map_err(anyhow::Error::from)
        .and_then(|row| async move {
            row.try_get::<Uuid, _>("id")
                .map(CommentId)
                .map_err(anyhow::Error::from)
        })
        .try_collect::<Vec<CommentId>>()
        .await
        .with_context(|| format!("removing thread {root:?}"))
        .map_err(unavailable)?;
        drop(conn);

        tracing::debug!(?root, removed = removed.len(), "removed thread");
        if !removed.is_empty() {
            self.relay(entity).await;
        }
        Ok(removed)
    }

    async fn subscribe(&self, entity: EntityId) -> Result<SnapshotStream, ApiError> {
        // Register before reading, so that no write can fall in between, and
        // read under the relay lock, so that no relay can overtake the read
        let (sender, stream) = self.feeds.add_listener(entity).await;
        let _relaying = self.feeds.start_relay(entity).await;
        let snapshot = self.list_comments(entity).await?;
        // Cannot fail, the stream is still alive
        let _ = sender.unbounded_send(Ok(snapshot));
        Ok(stream)
    }
}

/// Sessions written by the authentication service, read-only from here
#[derive(Clone, Debug)]
pub struct PgSessions(pub PgPool);

#[async_trait]
impl SessionStore for PgSessions {
    async fn resolve(&self, token: AuthToken) -> anyhow::Result<Option<UserId>> {
        let mut conn = self.0.acquire().await.context("acquiring db connection")?;
        let row = sqlx::query("SELECT user_id FROM sessions WHERE id = $1")
            .bind(token.0)
            .fetch_optional(&mut *conn)
            .await
            .context("looking up session")?;
        Ok(match row {
            None => None,
            Some(row) => Some(UserId(row.try_get("user_id")?)),
        })
    }
}
