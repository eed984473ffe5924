use crate::{CommentRecord, EntityId};

/// Messages pushed by the server on a comment feed websocket
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum FeedMessage {
    Pong,

    /// Full, ordered list of the entity's comments
    Snapshot {
        entity: EntityId,
        comments: Vec<CommentRecord>,
    },
}
