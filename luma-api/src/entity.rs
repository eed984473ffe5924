use std::{fmt, str::FromStr};

use uuid::Uuid;

use crate::{Error, UserId, STUB_UUID};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn stub() -> EntityId {
        EntityId(STUB_UUID)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum EntityKind {
    Post,
    Profile,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Post => "post",
            EntityKind::Profile => "profile",
        })
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<EntityKind, Error> {
        match s {
            "post" => Ok(EntityKind::Post),
            "profile" => Ok(EntityKind::Profile),
            _ => Err(Error::Unknown(format!("unknown entity kind {s:?}"))),
        }
    }
}

/// The post or profile a comment section hangs off
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,

    /// User who created the post or profile, and thus moderates its comments
    pub owner_id: UserId,
}

impl EntityRef {
    pub fn post(id: EntityId, owner_id: UserId) -> EntityRef {
        EntityRef {
            kind: EntityKind::Post,
            id,
            owner_id,
        }
    }

    pub fn profile(id: EntityId, owner_id: UserId) -> EntityRef {
        EntityRef {
            kind: EntityKind::Profile,
            id,
            owner_id,
        }
    }

    pub fn is_owner(&self, user: UserId) -> bool {
        self.owner_id == user
    }
}
