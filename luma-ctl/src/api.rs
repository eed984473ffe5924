use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{channel::mpsc, Sink, SinkExt, Stream, StreamExt};
use luma_api::{
    AuthToken, Backend, Comment, CommentEdit, CommentId, CommentRecord, EntityId, Error,
    FeedMessage, NewComment, SnapshotStream, ThreadRemoval, UserId,
};
use tokio_tungstenite::tungstenite::{self, Message};

// Pings are sent every PING_INTERVAL
const PING_INTERVAL: Duration = Duration::from_secs(10);
// If the interval between two pongs is more than DISCONNECT_INTERVAL, disconnect
const DISCONNECT_INTERVAL: Duration = Duration::from_secs(20);

type SnapshotSender = mpsc::UnboundedSender<Result<Vec<CommentRecord>, Error>>;

fn transport(err: impl std::fmt::Display) -> Error {
    tracing::warn!("request to comment server failed: {err}");
    Error::Unavailable(err.to_string())
}

fn decode_response<R>(status: reqwest::StatusCode, body: &[u8]) -> Result<R, Error>
where
    R: for<'de> serde::Deserialize<'de>,
{
    if status.is_success() {
        // Handlers returning nothing answer with an empty body
        let body = if body.is_empty() { &b"null"[..] } else { body };
        return serde_json::from_slice(body)
            .map_err(|e| Error::Unknown(format!("failed parsing server response: {e}")));
    }
    let err = match Error::parse(body) {
        Ok(err) => err,
        Err(_) if status.is_server_error() => {
            Error::Unavailable(format!("server answered {status}"))
        }
        Err(err) => Error::Unknown(format!(
            "server answered {status} with an unparseable error: {err:#}"
        )),
    };
    Err(err)
}

fn ws_url(host: &str, entity: EntityId) -> Result<String, Error> {
    let rest = host
        .strip_prefix("http")
        .ok_or_else(|| Error::Unknown(format!("host {host:?} is not an http(s) url")))?;
    Ok(format!("ws{rest}/ws/comment-feed/{}", entity.0))
}

fn decode_feed_message(msg: Message) -> Result<Option<FeedMessage>, Error> {
    let parsed = match msg {
        Message::Text(t) => serde_json::from_str(&t),
        Message::Binary(b) => serde_json::from_slice(&b),
        _ => return Ok(None),
    };
    parsed
        .map(Some)
        .map_err(|e| Error::MalformedRecord(format!("unparseable feed message: {e}")))
}

/// Comment store reached through a `luma-server` instance
pub struct HttpBackend {
    client: reqwest::Client,
    host: String,
    token: AuthToken,
}

impl HttpBackend {
    pub fn new(host: String, token: AuthToken) -> HttpBackend {
        HttpBackend {
            client: reqwest::Client::new(),
            host: String::from(host.trim_end_matches('/')),
            token,
        }
    }

    async fn run<R>(&self, req: reqwest::RequestBuilder) -> Result<R, Error>
    where
        R: for<'de> serde::Deserialize<'de>,
    {
        let resp = req.bearer_auth(self.token.0).send().await.map_err(transport)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(transport)?;
        decode_response(status, &body)
    }

    async fn get<R>(&self, path: &str) -> Result<R, Error>
    where
        R: for<'de> serde::Deserialize<'de>,
    {
        self.run(self.client.get(format!("{}/api/{path}", self.host)))
            .await
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, Error>
    where
        B: serde::Serialize,
        R: for<'de> serde::Deserialize<'de>,
    {
        self.run(self.client.post(format!("{}/api/{path}", self.host)).json(body))
            .await
    }

    pub async fn whoami(&self) -> Result<UserId, Error> {
        self.get("whoami").await
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn list_comments(&self, entity: EntityId) -> Result<Vec<CommentRecord>, Error> {
        self.get(&format!("list-comments/{}", entity.0)).await
    }

    async fn get_comment(&self, id: CommentId) -> Result<Option<CommentRecord>, Error> {
        self.get(&format!("fetch-comment/{}", id.0)).await
    }

    /// Only the session's own comments can be listed, other authors get none
    async fn list_comments_by_author(&self, author: UserId) -> Result<Vec<CommentRecord>, Error> {
        let mine: Vec<CommentRecord> = self.get("my-comments").await?;
        Ok(mine
            .into_iter()
            .filter(|r| r.author_id == Some(author))
            .collect())
    }

    async fn insert_comment(&self, comment: NewComment) -> Result<Comment, Error> {
        self.post("create-comment", &comment).await
    }

    async fn update_comment_text(&self, id: CommentId, text: String) -> Result<bool, Error> {
        match self.post::<_, ()>("edit-comment", &CommentEdit { id, text }).await {
            Ok(()) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn remove_comments(&self, ids: &[CommentId]) -> Result<usize, Error> {
        self.post("remove-comments", &ids).await
    }

    async fn remove_thread(
        &self,
        entity: EntityId,
        root: CommentId,
    ) -> Result<Vec<CommentId>, Error> {
        self.post("remove-thread", &ThreadRemoval { entity, root }).await
    }

    async fn subscribe(&self, entity: EntityId) -> Result<SnapshotStream, Error> {
        let url = ws_url(&self.host, entity)?;
        let (mut sock, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(transport)?;

        // Authenticate
        sock.send(Message::Text(self.token.0.to_string()))
            .await
            .map_err(transport)?;
        match sock.next().await {
            Some(Ok(Message::Text(t))) if t == "ok" => (),
            Some(Ok(Message::Text(t))) if t == "permission denied" => {
                return Err(Error::NotAuthenticated)
            }
            Some(Ok(msg)) => {
                return Err(Error::Unknown(format!(
                    "unexpected answer to feed authentication: {msg:?}"
                )))
            }
            Some(Err(e)) => return Err(transport(e)),
            None => return Err(transport("feed closed during authentication")),
        }
        tracing::debug!(?entity, "authenticated to comment feed");

        let (sender, receiver) = mpsc::unbounded();
        tokio::spawn(run_feed(entity, sock, sender));
        Ok(Box::pin(receiver))
    }
}

/// Relay snapshots from the websocket until it closes, stops answering pings,
/// or nobody listens anymore
async fn run_feed<S>(entity: EntityId, mut sock: S, sender: SnapshotSender)
where
    S: Unpin
        + Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>,
{
    let mut ping = tokio::time::interval(PING_INTERVAL);
    let mut last_pong = Instant::now();
    loop {
        tokio::select! {
            _ = ping.tick() => {
                if sender.is_closed() {
                    let _ = sock.close().await;
                    return;
                }
                if last_pong.elapsed() > DISCONNECT_INTERVAL {
                    tracing::warn!(?entity, "comment feed stopped answering pings");
                    return;
                }
                if let Err(err) = sock.send(Message::Text(String::from("ping"))).await {
                    tracing::warn!(?entity, ?err, "failed pinging comment feed");
                    return;
                }
            }
            msg = sock.next() => {
                let msg = match msg {
                    None | Some(Ok(Message::Close(_))) => {
                        tracing::debug!(?entity, "comment feed closed by server");
                        return;
                    }
                    Some(Err(err)) => {
                        tracing::warn!(?entity, ?err, "lost comment feed connection");
                        return;
                    }
                    Some(Ok(msg)) => msg,
                };
                match decode_feed_message(msg) {
                    Ok(None) => (),
                    Ok(Some(FeedMessage::Pong)) => last_pong = Instant::now(),
                    Ok(Some(FeedMessage::Snapshot { entity: e, comments })) if e == entity => {
                        if sender.unbounded_send(Ok(comments)).is_err() {
                            let _ = sock.close().await;
                            return;
                        }
                    }
                    Ok(Some(FeedMessage::Snapshot { entity: e, .. })) => {
                        tracing::warn!(?entity, other=?e, "ignoring snapshot of another entity");
                    }
                    Err(err) => {
                        tracing::warn!(?entity, "{err}");
                        let _ = sender.unbounded_send(Err(err));
                    }
                }
            }
        }
    }
}
