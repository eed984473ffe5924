use std::convert::TryFrom;

use uuid::Uuid;

use crate::{
    validate_comment_text, validate_string, EntityId, EntityRef, Error, Time, UserId,
    ANONYMOUS_NAME,
};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct CommentId(pub Uuid);

impl CommentId {
    pub fn new() -> CommentId {
        CommentId(Uuid::new_v4())
    }
}

impl Default for CommentId {
    fn default() -> CommentId {
        CommentId::new()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub entity: EntityRef,

    /// None for top-level comments
    pub parent_id: Option<CommentId>,

    pub author_id: UserId,
    pub author_name: String,
    pub text: String,

    /// Assigned by the store at insertion time
    pub created_at: Time,
    pub updated_at: Option<Time>,

    /// Whether the author is the owner of the commented entity
    pub is_original_poster: bool,
}

impl Comment {
    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A comment as it is about to be written to the store
///
/// The id is chosen by the writer, so that an optimistic local copy and the
/// stored copy can be recognized as the same comment.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewComment {
    pub id: CommentId,
    pub entity: EntityRef,
    pub parent_id: Option<CommentId>,
    pub author_id: UserId,
    pub author_name: String,
    pub text: String,
}

impl NewComment {
    pub fn validate(&self) -> Result<(), Error> {
        validate_comment_text(&self.text)?;
        validate_string(&self.author_name)?;
        if self.parent_id == Some(self.id) {
            return Err(Error::InvalidParent(self.id));
        }
        Ok(())
    }

    pub fn into_comment(self, created_at: Time) -> Comment {
        let author_name = match self.author_name.trim() {
            "" => String::from(ANONYMOUS_NAME),
            _ => self.author_name,
        };
        Comment {
            id: self.id,
            is_original_poster: self.entity.is_owner(self.author_id),
            entity: self.entity,
            parent_id: self.parent_id,
            author_id: self.author_id,
            author_name,
            text: self.text,
            created_at,
            updated_at: None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentEdit {
    pub id: CommentId,
    pub text: String,
}

/// Removal of `root` and everything that transitively replies to it
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ThreadRemoval {
    pub entity: EntityId,
    pub root: CommentId,
}

/// A comment document as found in the store, before any validation
///
/// Documents written by older clients may lack fields, so everything is
/// optional here and checked when converting into a `Comment`.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct CommentRecord {
    pub id: Option<CommentId>,
    pub entity: Option<EntityRef>,
    pub parent_id: Option<CommentId>,
    pub author_id: Option<UserId>,
    pub author_name: Option<String>,
    pub text: Option<String>,
    pub created_at: Option<Time>,
    pub updated_at: Option<Time>,
    pub is_original_poster: Option<bool>,
}

impl TryFrom<CommentRecord> for Comment {
    type Error = Error;

    fn try_from(r: CommentRecord) -> Result<Comment, Error> {
        let missing = |field: &str| match r.id {
            Some(id) => Error::MalformedRecord(format!("comment {:?} has no {field}", id.0)),
            None => Error::MalformedRecord(format!("comment has no {field}")),
        };
        let id = r.id.ok_or_else(|| missing("id"))?;
        let entity = r.entity.ok_or_else(|| missing("entity"))?;
        let author_id = r.author_id.ok_or_else(|| missing("author"))?;
        let text = r
            .text
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| missing("text"))?;
        let created_at = r.created_at.ok_or_else(|| missing("creation time"))?;
        let author_name = match r.author_name {
            Some(n) if !n.trim().is_empty() => n,
            _ => String::from(ANONYMOUS_NAME),
        };
        Ok(Comment {
            id,
            is_original_poster: r
                .is_original_poster
                .unwrap_or_else(|| entity.is_owner(author_id)),
            entity,
            // A self-reference would make the comment its own ancestor
            parent_id: r.parent_id.filter(|p| *p != id),
            author_id,
            author_name,
            text,
            created_at,
            updated_at: r.updated_at,
        })
    }
}

impl From<Comment> for CommentRecord {
    fn from(c: Comment) -> CommentRecord {
        CommentRecord {
            id: Some(c.id),
            entity: Some(c.entity),
            parent_id: c.parent_id,
            author_id: Some(c.author_id),
            author_name: Some(c.author_name),
            text: Some(c.text),
            created_at: Some(c.created_at),
            updated_at: c.updated_at,
            is_original_poster: Some(c.is_original_poster),
        }
    }
}
