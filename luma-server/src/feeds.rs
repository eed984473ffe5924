use std::{collections::HashMap, sync::Arc};

use axum::extract::ws::Message;
use futures::{channel::mpsc, select, SinkExt, StreamExt};
use luma_api::{CommentRecord, EntityId, Error as ApiError, FeedMessage, SnapshotStream, Uuid};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

type Snapshot = Result<Vec<CommentRecord>, ApiError>;
type Listeners = HashMap<EntityId, HashMap<Uuid, mpsc::UnboundedSender<Snapshot>>>;
type RelayLocks = Arc<parking_lot::Mutex<HashMap<EntityId, Arc<Mutex<()>>>>>;

/// Listeners of each entity's comment list, fed full snapshots
#[derive(Clone, Debug)]
pub struct CommentFeeds {
    listeners: Arc<RwLock<Listeners>>,
    relaying: RelayLocks,
}

/// Exclusive right to read and send snapshots of one entity
///
/// Snapshots read while holding it reach listeners in the order they were
/// read, so a slow relay can never overwrite a newer list with an older one.
pub struct RelayGuard {
    entity: EntityId,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    relaying: RelayLocks,
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut relaying = self.relaying.lock();
        // Clones are only taken under the map lock: the map and this guard
        // being the last owners means nobody waits on it
        if Arc::strong_count(&self.lock) == 2 {
            relaying.remove(&self.entity);
        }
    }
}

fn forget_closed(listeners: &mut Listeners) {
    listeners.retain(|_, l| {
        l.retain(|_, s| !s.is_closed());
        !l.is_empty()
    });
}

impl CommentFeeds {
    pub fn new() -> CommentFeeds {
        CommentFeeds {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            relaying: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    /// Register a new listener for `entity`
    ///
    /// Listeners whose stream was dropped are forgotten on the next
    /// registration, relay or `has_listeners` check.
    pub async fn add_listener(&self, entity: EntityId) -> (mpsc::UnboundedSender<Snapshot>, SnapshotStream) {
        // Unbounded, so that relaying under the read-lock never waits on a
        // listener that itself waits for the write-lock
        let (sender, receiver) = mpsc::unbounded();
        let mut listeners = self.listeners.write().await;
        forget_closed(&mut listeners);
        listeners
            .entry(entity)
            .or_insert_with(HashMap::new)
            .insert(Uuid::new_v4(), sender.clone());
        (sender, Box::pin(receiver))
    }

    pub async fn has_listeners(&self, entity: EntityId) -> bool {
        let live = match self.listeners.read().await.get(&entity) {
            None => return false,
            Some(l) => l.values().any(|s| !s.is_closed()),
        };
        if !live {
            forget_closed(&mut *self.listeners.write().await);
        }
        live
    }

    /// Wait for the other relays of `entity` to be done
    pub async fn start_relay(&self, entity: EntityId) -> RelayGuard {
        let lock = {
            let mut relaying = self.relaying.lock();
            // Left over by relays cancelled while waiting
            relaying.retain(|_, l| Arc::strong_count(l) > 1);
            relaying.entry(entity).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        RelayGuard {
            entity,
            lock,
            guard: Some(guard),
            relaying: self.relaying.clone(),
        }
    }

    pub async fn relay_snapshot(&self, entity: EntityId, snapshot: Snapshot) {
        let mut dead = Vec::new();
        if let Some(listeners) = self.listeners.read().await.get(&entity) {
            for (id, s) in listeners {
                if s.unbounded_send(snapshot.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut feeds = self.listeners.write().await;
            if let Some(listeners) = feeds.get_mut(&entity) {
                for id in dead {
                    listeners.remove(&id);
                }
                if listeners.is_empty() {
                    feeds.remove(&entity);
                }
            }
        }
    }
}

impl Default for CommentFeeds {
    fn default() -> CommentFeeds {
        CommentFeeds::new()
    }
}

/// Forward snapshots of `entity` to a websocket until either side closes
///
/// Clients may send "ping" text messages at any time, which are answered with
/// `FeedMessage::Pong`. Anything else from the client ends the feed.
pub async fn pump_feed<W, R>(entity: EntityId, snapshots: SnapshotStream, mut write: W, read: R)
where
    W: 'static + Send + Unpin + futures::Sink<Message>,
    <W as futures::Sink<Message>>::Error: Send,
    R: 'static + Send + Unpin + futures::Stream<Item = Result<Message, axum::Error>>,
{
    let mut snapshots = snapshots.fuse();
    let mut read = read.fuse();
    macro_rules! send_message {
        ( $msg:expr ) => {{
            let msg: FeedMessage = $msg;
            let json = match serde_json::to_vec(&msg) {
                Ok(json) => json,
                Err(err) => {
                    tracing::error!(?err, ?entity, "failed serializing feed message to json");
                    continue;
                }
            };
            if write.send(Message::Binary(json)).await.is_err() {
                tracing::debug!(?entity, "comment feed websocket went away");
                return;
            }
        }};
    }
    loop {
        select! {
            snap = snapshots.next() => match snap {
                None => return,
                Some(Err(err)) => {
                    tracing::warn!(?err, ?entity, "comment feed failed, closing websocket");
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                Some(Ok(comments)) => send_message!(FeedMessage::Snapshot { entity, comments }),
            },
            msg = read.next() => match msg {
                None | Some(Ok(Message::Close(_))) => return,
                Some(Ok(Message::Text(msg))) if msg == "ping" => send_message!(FeedMessage::Pong),
                Some(msg) => {
                    tracing::warn!(?entity, "received unexpected message from client: {msg:?}");
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relay_reaches_live_listeners_only() {
        let feeds = CommentFeeds::new();
        let entity = EntityId::stub();
        let (_keep, mut a) = feeds.add_listener(entity).await;
        let (sender, b) = feeds.add_listener(entity).await;
        drop(sender);
        drop(b);
        assert!(feeds.has_listeners(entity).await);

        feeds.relay_snapshot(entity, Ok(vec![])).await;
        assert_eq!(a.next().await, Some(Ok(vec![])));
        assert_eq!(feeds.listeners.read().await.get(&entity).map(|l| l.len()), Some(1));

        // Nobody listening
        feeds.relay_snapshot(EntityId(Uuid::new_v4()), Ok(vec![])).await;
        assert!(futures::FutureExt::now_or_never(a.next()).is_none());
    }

    #[tokio::test]
    async fn listeners_are_forgotten_once_gone() {
        let feeds = CommentFeeds::new();
        let mut last = EntityId::stub();
        for _ in 0..100 {
            last = EntityId(Uuid::new_v4());
            let (sender, stream) = feeds.add_listener(last).await;
            drop((sender, stream));
        }
        assert!(feeds.listeners.read().await.len() <= 1);
        assert!(!feeds.has_listeners(last).await);
        assert!(feeds.listeners.read().await.is_empty());

        let (_sender, _stream) = feeds.add_listener(last).await;
        assert!(feeds.has_listeners(last).await);
    }

    #[tokio::test]
    async fn relays_of_one_entity_take_turns() {
        let feeds = CommentFeeds::new();
        let entity = EntityId::stub();
        let first = feeds.start_relay(entity).await;
        let mut second = Box::pin(feeds.start_relay(entity));
        assert!(futures::FutureExt::now_or_never(&mut second).is_none());

        // Other entities are not held up
        let other = feeds.start_relay(EntityId(Uuid::new_v4())).await;
        drop(other);

        drop(first);
        let second = second.await;
        assert_eq!(feeds.relaying.lock().len(), 1);
        drop(second);
        assert!(feeds.relaying.lock().is_empty());
    }

    #[tokio::test]
    async fn pump_answers_pings_and_forwards_snapshots() {
        let entity = EntityId::stub();
        let (snap_send, snap_recv) = mpsc::unbounded::<Snapshot>();
        let (ws_send, mut ws_out) = mpsc::unbounded::<Message>();
        let (mut client, ws_in) = mpsc::unbounded::<Result<Message, axum::Error>>();

        let pump = tokio::spawn(pump_feed(
            entity,
            Box::pin(snap_recv),
            ws_send.sink_map_err(|_| ()),
            ws_in,
        ));

        snap_send.unbounded_send(Ok(vec![])).unwrap();
        let msg = ws_out.next().await.unwrap();
        let Message::Binary(json) = msg else { panic!("unexpected message {msg:?}") };
        assert_eq!(
            serde_json::from_slice::<FeedMessage>(&json).unwrap(),
            FeedMessage::Snapshot { entity, comments: vec![] }
        );

        client.send(Ok(Message::Text(String::from("ping")))).await.unwrap();
        let msg = ws_out.next().await.unwrap();
        let Message::Binary(json) = msg else { panic!("unexpected message {msg:?}") };
        assert_eq!(serde_json::from_slice::<FeedMessage>(&json).unwrap(), FeedMessage::Pong);

        client.send(Ok(Message::Text(String::from("hello")))).await.unwrap();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn pump_closes_on_feed_error() {
        let entity = EntityId::stub();
        let (snap_send, snap_recv) = mpsc::unbounded::<Snapshot>();
        let (ws_send, mut ws_out) = mpsc::unbounded::<Message>();
        let (_client, ws_in) = mpsc::unbounded::<Result<Message, axum::Error>>();
        let pump = tokio::spawn(pump_feed(
            entity,
            Box::pin(snap_recv),
            ws_send.sink_map_err(|_| ()),
            ws_in,
        ));
        snap_send
            .unbounded_send(Err(ApiError::Unavailable(String::from("db down"))))
            .unwrap();
        assert!(matches!(ws_out.next().await, Some(Message::Close(None))));
        pump.await.unwrap();
    }
}
