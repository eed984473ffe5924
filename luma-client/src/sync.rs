use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

use crate::{
    api::{Backend, Comment, EntityRef},
    normalize_snapshot,
};

// Space each reconnect attempt by this much
const DEFAULT_RETRY_SPACING: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncState {
    Idle,
    Subscribing,
    Active,

    /// Connection lost or refused; a reconnection is pending
    Error,

    Unsubscribed,
}

type Callback = Box<dyn FnMut(Vec<Comment>) + Send>;

/// Keeps a callback fed with the full comment list of an entity
pub struct LiveSync<B: ?Sized> {
    backend: Arc<B>,
    retry_spacing: Duration,
}

impl<B: ?Sized> Clone for LiveSync<B> {
    fn clone(&self) -> Self {
        LiveSync {
            backend: self.backend.clone(),
            retry_spacing: self.retry_spacing,
        }
    }
}

impl<B: ?Sized + Backend + 'static> LiveSync<B> {
    pub fn new(backend: Arc<B>) -> LiveSync<B> {
        LiveSync {
            backend,
            retry_spacing: DEFAULT_RETRY_SPACING,
        }
    }

    pub fn with_retry_spacing(mut self, retry_spacing: Duration) -> LiveSync<B> {
        self.retry_spacing = retry_spacing;
        self
    }

    /// Call `on_snapshot` with every snapshot of `entity`'s comments, until
    /// the returned subscription is dropped or unsubscribed
    ///
    /// Connection errors are logged and followed by a reconnection. Must be
    /// called from within a tokio runtime.
    pub fn subscribe<F>(&self, entity: EntityRef, on_snapshot: F) -> Subscription
    where
        F: 'static + Send + FnMut(Vec<Comment>),
    {
        let callback: Arc<Mutex<Option<Callback>>> =
            Arc::new(Mutex::new(Some(Box::new(on_snapshot))));
        let (state_sender, state) = watch::channel(SyncState::Idle);
        let (cancel, cancelled) = oneshot::channel();
        let task = tokio::spawn(run_feed(
            self.backend.clone(),
            entity,
            self.retry_spacing,
            callback.clone(),
            state_sender,
            cancelled,
        ));
        Subscription {
            entity,
            callback,
            state,
            cancel: Some(cancel),
            task: Some(task),
        }
    }
}

fn deliver(callback: &Mutex<Option<Callback>>, comments: Vec<Comment>) {
    if let Some(cb) = callback.lock().as_mut() {
        cb(comments);
    }
}

async fn run_feed<B: ?Sized + Backend>(
    backend: Arc<B>,
    entity: EntityRef,
    retry_spacing: Duration,
    callback: Arc<Mutex<Option<Callback>>>,
    state: watch::Sender<SyncState>,
    mut cancelled: oneshot::Receiver<()>,
) {
    'reconnect: loop {
        state.send_replace(SyncState::Subscribing);
        tracing::debug!(entity=?entity.id, "subscribing to comment feed");
        let res = tokio::select! {
            _ = &mut cancelled => break 'reconnect,
            res = backend.subscribe(entity.id) => res,
        };
        match res {
            Err(e) => {
                tracing::warn!(entity=?entity.id, "failed subscribing to comment feed: {e}");
                state.send_replace(SyncState::Error);
            }
            Ok(mut feed) => loop {
                let item = tokio::select! {
                    _ = &mut cancelled => break 'reconnect,
                    item = feed.next() => item,
                };
                match item {
                    None => {
                        tracing::warn!(entity=?entity.id, "lost comment feed connection");
                        state.send_replace(SyncState::Error);
                        break;
                    }
                    Some(Err(e)) => {
                        // The feed may still recover by itself
                        tracing::warn!(entity=?entity.id, "error on comment feed: {e}");
                        state.send_replace(SyncState::Error);
                    }
                    Some(Ok(records)) => {
                        state.send_replace(SyncState::Active);
                        let comments = normalize_snapshot(&entity, records);
                        tracing::trace!(entity=?entity.id, num=comments.len(), "got comment snapshot");
                        deliver(&callback, comments);
                    }
                }
            },
        }
        tokio::select! {
            _ = &mut cancelled => break 'reconnect,
            _ = tokio::time::sleep(retry_spacing) => (),
        }
    }
    state.send_replace(SyncState::Unsubscribed);
    tracing::debug!(entity=?entity.id, "unsubscribed from comment feed");
}

/// A running subscription; dropping it unsubscribes
pub struct Subscription {
    entity: EntityRef,
    callback: Arc<Mutex<Option<Callback>>>,
    state: watch::Receiver<SyncState>,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    fn stop(&mut self) {
        // Once the callback is gone, no snapshot can be delivered anymore
        self.callback.lock().take();
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Stop the subscription and wait for its feed to be closed
    pub async fn unsubscribe(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("comment feed task failed: {e}");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}
