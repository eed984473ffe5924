use crate::api::{Error, UserId};

/// Who is using the comment section, as told by the auth service
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    pub user: Option<UserId>,
    pub name: String,
}

impl Session {
    pub fn new(user: UserId, name: String) -> Session {
        Session {
            user: Some(user),
            name,
        }
    }

    pub fn anonymous() -> Session {
        Session {
            user: None,
            name: String::new(),
        }
    }

    pub fn require_user(&self) -> Result<UserId, Error> {
        self.user.ok_or(Error::NotAuthenticated)
    }
}
