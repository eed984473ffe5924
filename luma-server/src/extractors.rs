use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{self, request},
};
use luma_api::{AuthToken, Backend, UserId, Uuid};

use crate::Error;

/// Resolves bearer tokens issued by the authentication service
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn resolve(&self, token: AuthToken) -> anyhow::Result<Option<UserId>>;
}

pub type DynBackend = Arc<dyn Backend>;
pub type DynSessions = Arc<dyn SessionStore>;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub backend: DynBackend,
    pub sessions: DynSessions,
}

impl AppState {
    pub async fn recover_session(&self, token: AuthToken) -> Result<UserId, Error> {
        self.sessions
            .resolve(token)
            .await?
            .ok_or_else(Error::not_authenticated)
    }
}

pub struct PreAuth(pub AuthToken);

#[async_trait]
impl<S: Sync> FromRequestParts<S> for PreAuth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, _state: &S) -> Result<PreAuth, Error> {
        let auth = req
            .headers
            .get(http::header::AUTHORIZATION)
            .ok_or_else(Error::not_authenticated)?;
        let auth = auth.to_str().map_err(|_| Error::not_authenticated())?;
        let mut auth = auth.split(' ');
        if !auth
            .next()
            .ok_or_else(Error::not_authenticated)?
            .eq_ignore_ascii_case("bearer")
        {
            return Err(Error::not_authenticated());
        }
        let token = auth.next().ok_or_else(Error::not_authenticated)?;
        if auth.next().is_some() {
            return Err(Error::not_authenticated());
        }
        let token = Uuid::try_from(token).map_err(|_| Error::not_authenticated())?;
        Ok(PreAuth(AuthToken(token)))
    }
}

pub struct Auth(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for Auth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, state: &AppState) -> Result<Auth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        Ok(Auth(state.recover_session(token).await?))
    }
}
