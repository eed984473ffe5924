mod backend;
pub use backend::{Backend, SnapshotStream};

mod comment;
pub use comment::{Comment, CommentEdit, CommentId, CommentRecord, NewComment, ThreadRemoval};

mod entity;
pub use entity::{EntityId, EntityKind, EntityRef};

mod error;
pub use error::Error;

mod feed;
pub use feed::FeedMessage;

mod user;
pub use user::{AuthToken, UserId};

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<chrono::Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

/// Maximum length of a comment's text, in bytes
pub const MAX_COMMENT_LEN: usize = 10_000;

/// Author name used for comments whose author did not give one
pub const ANONYMOUS_NAME: &str = "Anonymous";

// Strings go through postgres, which refuses null bytes in text columns
pub fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        return Err(Error::NullByteInString(String::from(s)));
    }
    Ok(())
}

pub fn validate_comment_text(text: &str) -> Result<(), Error> {
    if text.trim().is_empty() {
        return Err(Error::EmptyText);
    }
    if text.len() > MAX_COMMENT_LEN {
        return Err(Error::TextTooLong {
            len: text.len(),
            max: MAX_COMMENT_LEN,
        });
    }
    validate_string(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_text_validation() {
        assert_eq!(validate_comment_text(""), Err(Error::EmptyText));
        assert_eq!(validate_comment_text(" \n\t "), Err(Error::EmptyText));
        assert_eq!(
            validate_comment_text("a\0b"),
            Err(Error::NullByteInString(String::from("a\0b")))
        );
        let long = "x".repeat(MAX_COMMENT_LEN + 1);
        assert_eq!(
            validate_comment_text(&long),
            Err(Error::TextTooLong {
                len: MAX_COMMENT_LEN + 1,
                max: MAX_COMMENT_LEN,
            })
        );
        assert_eq!(validate_comment_text("be careful out there"), Ok(()));
    }
}
