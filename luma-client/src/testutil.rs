use chrono::TimeZone;

use crate::api::{Comment, CommentId, EntityId, EntityRef, UserId, Uuid};

pub fn user() -> UserId {
    UserId(Uuid::new_v4())
}

pub fn entity() -> EntityRef {
    EntityRef::post(EntityId(Uuid::new_v4()), user())
}

/// Comment by a random user, created `secs` seconds after the epoch
pub fn comment(entity: &EntityRef, parent_id: Option<CommentId>, secs: i64) -> Comment {
    Comment {
        id: CommentId::new(),
        entity: *entity,
        parent_id,
        author_id: user(),
        author_name: String::from("Test User"),
        text: format!("comment number {secs}"),
        created_at: chrono::Utc.timestamp_opt(secs, 0).unwrap(),
        updated_at: None,
        is_original_poster: false,
    }
}
