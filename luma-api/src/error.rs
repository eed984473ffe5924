use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

use crate::CommentId;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Uuid already used {0}")]
    UuidAlreadyUsed(Uuid),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Comment text is empty")]
    EmptyText,

    #[error("Comment text is too long ({len} bytes, max {max})")]
    TextTooLong { len: usize, max: usize },

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Parent comment {0:?} is not part of this comment section")]
    InvalidParent(CommentId),

    #[error("Comment {0:?} not found")]
    NotFound(CommentId),

    #[error("Malformed comment record: {0}")]
    MalformedRecord(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::UuidAlreadyUsed(_) => StatusCode::CONFLICT,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
            Error::EmptyText => StatusCode::BAD_REQUEST,
            Error::TextTooLong { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::NotAuthenticated => StatusCode::UNAUTHORIZED,
            Error::InvalidParent(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::MalformedRecord(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Errors caught before any store call, or while ingesting records
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::NullByteInString(_)
                | Error::EmptyText
                | Error::TextTooLong { .. }
                | Error::InvalidParent(_)
                | Error::NotAuthenticated
                | Error::MalformedRecord(_)
        )
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, Error::PermissionDenied)
    }

    /// Errors after which retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::PermissionDenied => json!({
                "message": "permission denied",
                "type": "permission-denied",
            }),
            Error::UuidAlreadyUsed(u) => json!({
                "message": "uuid conflict",
                "type": "conflict-uuid",
                "uuid": u,
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
            Error::EmptyText => json!({
                "message": "comment text is empty",
                "type": "empty-text",
            }),
            Error::TextTooLong { len, max } => json!({
                "message": "comment text is too long",
                "type": "text-too-long",
                "len": len,
                "max": max,
            }),
            Error::NotAuthenticated => json!({
                "message": "not authenticated",
                "type": "not-authenticated",
            }),
            Error::InvalidParent(p) => json!({
                "message": "parent comment is not in this comment section",
                "type": "invalid-parent",
                "uuid": p.0,
            }),
            Error::NotFound(c) => json!({
                "message": "comment not found",
                "type": "not-found",
                "uuid": c.0,
            }),
            Error::MalformedRecord(msg) => json!({
                "message": msg,
                "type": "malformed-record",
            }),
            Error::Unavailable(msg) => json!({
                "message": msg,
                "type": "unavailable",
            }),
        })
        .expect("serializing error contents")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let message = || {
            String::from(
                data.get("message")
                    .and_then(|msg| msg.as_str())
                    .unwrap_or(""),
            )
        };
        let uuid = |what: &str| {
            data.get("uuid")
                .and_then(|uuid| uuid.as_str())
                .and_then(|uuid| Uuid::from_str(uuid).ok())
                .ok_or_else(|| anyhow!("error is {what} without a proper uuid"))
        };
        let number = |field: &str| {
            data.get(field)
                .and_then(|n| n.as_u64())
                .map(|n| n as usize)
                .ok_or_else(|| anyhow!("error is a too-long text without {field}"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(message()),
                "permission-denied" => Error::PermissionDenied,
                "conflict-uuid" => Error::UuidAlreadyUsed(uuid("a uuid conflict")?),
                "null-byte" => Error::NullByteInString(String::from(
                    data.get("string").and_then(|s| s.as_str()).ok_or_else(|| {
                        anyhow!("error is a null-byte-in-string without a string")
                    })?,
                )),
                "empty-text" => Error::EmptyText,
                "text-too-long" => Error::TextTooLong {
                    len: number("len")?,
                    max: number("max")?,
                },
                "not-authenticated" => Error::NotAuthenticated,
                "invalid-parent" => Error::InvalidParent(CommentId(uuid("an invalid parent")?)),
                "not-found" => Error::NotFound(CommentId(uuid("a missing comment")?)),
                "malformed-record" => Error::MalformedRecord(message()),
                "unavailable" => Error::Unavailable(message()),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_round_trip_through_json() {
        let id = Uuid::new_v4();
        let errors = [
            Error::Unknown(String::from("oops")),
            Error::PermissionDenied,
            Error::UuidAlreadyUsed(id),
            Error::NullByteInString(String::from("a\0")),
            Error::EmptyText,
            Error::TextTooLong { len: 12, max: 10 },
            Error::NotAuthenticated,
            Error::InvalidParent(CommentId(id)),
            Error::NotFound(CommentId(id)),
            Error::MalformedRecord(String::from("missing id")),
            Error::Unavailable(String::from("connection reset")),
        ];
        for e in errors {
            assert_eq!(Error::parse(&e.contents()).unwrap(), e);
        }
    }

    #[test]
    fn unknown_error_types_are_refused() {
        assert!(Error::parse(br#"{"type":"teapot"}"#).is_err());
        assert!(Error::parse(b"not json").is_err());
        assert!(Error::parse(br#"{"type":"conflict-uuid","uuid":"nope"}"#).is_err());
    }

    #[test]
    fn classification() {
        assert!(Error::EmptyText.is_validation());
        assert!(!Error::EmptyText.is_transient());
        assert!(Error::NotAuthenticated.is_validation());
        assert!(Error::PermissionDenied.is_permission());
        assert!(Error::Unavailable(String::new()).is_transient());
        assert!(Error::NotFound(CommentId(Uuid::new_v4())).is_not_found());
        assert_eq!(
            Error::PermissionDenied.status_code(),
            http::StatusCode::FORBIDDEN
        );
    }
}
