use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use luma_api::{
    Backend, Comment, CommentId, CommentRecord, EntityId, EntityRef, Error, NewComment,
    SnapshotStream, Time, UserId,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

type FeedSender = mpsc::UnboundedSender<Result<Vec<CommentRecord>, Error>>;

/// In-memory comment store, with live feeds and fault injection for tests
pub struct MockBackend(Mutex<State>);

struct State {
    /// Insertion order, which is also creation-time order
    docs: Vec<Doc>,
    /// Entity as given by its first comment
    entities: HashMap<EntityId, EntityRef>,
    last_time: Option<Time>,
    feeds: HashMap<EntityId, Vec<FeedSender>>,
    failing_writes: usize,
    failing_subscribes: usize,
}

struct Doc {
    entity: EntityId,
    record: CommentRecord,
}

impl State {
    /// Store time, strictly increasing across writes
    fn now(&mut self) -> Time {
        let mut now = chrono::Utc::now();
        if let Some(last) = self.last_time {
            if now <= last {
                now = last + chrono::Duration::microseconds(1);
            }
        }
        self.last_time = Some(now);
        now
    }

    fn snapshot(&self, entity: EntityId) -> Vec<CommentRecord> {
        self.docs
            .iter()
            .filter(|d| d.entity == entity)
            .map(|d| d.record.clone())
            .collect()
    }

    fn find(&self, id: CommentId) -> Option<&Doc> {
        self.docs.iter().find(|d| d.record.id == Some(id))
    }

    /// `root` and its transitive replies within `entity`
    fn thread(&self, entity: EntityId, root: CommentId) -> HashSet<CommentId> {
        let mut thread = HashSet::new();
        if !matches!(self.find(root), Some(d) if d.entity == entity) {
            return thread;
        }
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if !thread.insert(id) {
                continue;
            }
            queue.extend(
                self.docs
                    .iter()
                    .filter(|d| d.entity == entity && d.record.parent_id == Some(id))
                    .filter_map(|d| d.record.id),
            );
        }
        thread
    }

    fn remove(&mut self, ids: &HashSet<CommentId>) -> usize {
        let mut touched = HashSet::new();
        let before = self.docs.len();
        self.docs.retain(|d| match d.record.id {
            Some(id) if ids.contains(&id) => {
                touched.insert(d.entity);
                false
            }
            _ => true,
        });
        for entity in touched {
            self.relay_snapshot(entity);
        }
        before - self.docs.len()
    }

    fn relay_snapshot(&mut self, entity: EntityId) {
        let snapshot = self.snapshot(entity);
        if let Some(feeds) = self.feeds.get_mut(&entity) {
            feeds.retain_mut(|f| matches!(f.send(Ok(snapshot.clone())), Ok(())));
        }
    }

    fn check_write(&mut self) -> Result<(), Error> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(Error::Unavailable(String::from("injected write failure")));
        }
        Ok(())
    }
}

impl MockBackend {
    pub fn new() -> MockBackend {
        MockBackend(Mutex::new(State {
            docs: Vec::new(),
            entities: HashMap::new(),
            last_time: None,
            feeds: HashMap::new(),
            failing_writes: 0,
            failing_subscribes: 0,
        }))
    }

    /// Make the next `n` writes fail with `Error::Unavailable`
    pub fn fail_writes(&self, n: usize) {
        self.0.lock().failing_writes = n;
    }

    /// Make the next `n` subscriptions fail with `Error::Unavailable`
    pub fn fail_subscribes(&self, n: usize) {
        self.0.lock().failing_subscribes = n;
    }

    /// Push an error to every open feed, without closing them
    pub fn break_feeds(&self) {
        let mut s = self.0.lock();
        for feeds in s.feeds.values_mut() {
            feeds.retain_mut(|f| {
                matches!(
                    f.send(Err(Error::Unavailable(String::from("injected feed failure")))),
                    Ok(())
                )
            });
        }
    }

    /// Close every open feed, as a lost connection would
    pub fn drop_feeds(&self) {
        self.0.lock().feeds.clear();
    }

    /// Store a raw document, bypassing all validation
    pub fn inject_record(&self, entity: EntityId, record: CommentRecord) {
        let mut s = self.0.lock();
        s.docs.push(Doc { entity, record });
        s.relay_snapshot(entity);
    }

    /// Return the number of feeds that still have a listener
    pub fn test_num_feeds(&self) -> usize {
        self.0
            .lock()
            .feeds
            .values()
            .flat_map(|f| f.iter())
            .filter(|f| !f.is_closed())
            .count()
    }

    /// Return the current number of stored documents
    pub fn test_num_comments(&self) -> usize {
        self.0.lock().docs.len()
    }
}

impl Default for MockBackend {
    fn default() -> MockBackend {
        MockBackend::new()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn list_comments(&self, entity: EntityId) -> Result<Vec<CommentRecord>, Error> {
        Ok(self.0.lock().snapshot(entity))
    }

    async fn get_comment(&self, id: CommentId) -> Result<Option<CommentRecord>, Error> {
        Ok(self.0.lock().find(id).map(|d| d.record.clone()))
    }

    async fn list_comments_by_author(&self, author: UserId) -> Result<Vec<CommentRecord>, Error> {
        Ok(self
            .0
            .lock()
            .docs
            .iter()
            .rev()
            .filter(|d| d.record.author_id == Some(author))
            .map(|d| d.record.clone())
            .collect())
    }

    async fn insert_comment(&self, comment: NewComment) -> Result<Comment, Error> {
        comment.validate()?;
        let mut s = self.0.lock();
        s.check_write()?;
        if s.find(comment.id).is_some() {
            return Err(Error::UuidAlreadyUsed(comment.id.0));
        }
        if let Some(pinned) = s.entities.get(&comment.entity.id) {
            if *pinned != comment.entity {
                return Err(Error::PermissionDenied);
            }
        }
        if let Some(parent) = comment.parent_id {
            match s.find(parent) {
                Some(d) if d.entity == comment.entity.id => (),
                _ => return Err(Error::InvalidParent(parent)),
            }
        }
        let now = s.now();
        let comment = comment.into_comment(now);
        let entity = comment.entity.id;
        s.entities.insert(entity, comment.entity);
        s.docs.push(Doc {
            entity,
            record: CommentRecord::from(comment.clone()),
        });
        tracing::trace!(comment=?comment.id, "mock backend stored comment");
        s.relay_snapshot(entity);
        Ok(comment)
    }

    async fn update_comment_text(&self, id: CommentId, text: String) -> Result<bool, Error> {
        luma_api::validate_comment_text(&text)?;
        let mut s = self.0.lock();
        s.check_write()?;
        let now = s.now();
        let entity = match s.docs.iter_mut().find(|d| d.record.id == Some(id)) {
            None => return Ok(false),
            Some(d) => {
                d.record.text = Some(text);
                d.record.updated_at = Some(now);
                d.entity
            }
        };
        s.relay_snapshot(entity);
        Ok(true)
    }

    async fn remove_comments(&self, ids: &[CommentId]) -> Result<usize, Error> {
        let mut s = self.0.lock();
        s.check_write()?;
        let ids = ids.iter().copied().collect::<HashSet<_>>();
        Ok(s.remove(&ids))
    }

    async fn remove_thread(
        &self,
        entity: EntityId,
        root: CommentId,
    ) -> Result<Vec<CommentId>, Error> {
        let mut s = self.0.lock();
        s.check_write()?;
        let thread = s.thread(entity, root);
        s.remove(&thread);
        Ok(thread.into_iter().collect())
    }

    async fn subscribe(&self, entity: EntityId) -> Result<SnapshotStream, Error> {
        let mut s = self.0.lock();
        if s.failing_subscribes > 0 {
            s.failing_subscribes -= 1;
            return Err(Error::Unavailable(String::from(
                "injected subscription failure",
            )));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        // Cannot fail, the receiver is still alive
        let _ = sender.send(Ok(s.snapshot(entity)));
        s.feeds.entry(entity).or_default().push(sender);
        Ok(Box::pin(futures::stream::unfold(
            receiver,
            |mut receiver| async move { receiver.recv().await.map(|item| (item, receiver)) },
        )))
    }
}
