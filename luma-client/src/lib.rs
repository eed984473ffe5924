mod flatten;
pub use flatten::{flatten, flatten_all, ExpandedThreads, ThreadRow};

mod section;
pub use section::CommentSection;

mod session;
pub use session::Session;

mod storage;
pub use storage::{load_json, store_json, FileStorage, LocalStorage, MemoryStorage};

mod store;
pub use store::{normalize_snapshot, CommentStore};

mod sync;
pub use sync::{LiveSync, Subscription, SyncState};

mod thread;
pub use thread::{CommentThread, ThreadEntry};

mod tree;
pub use tree::{collect_thread, CommentForest, CommentNode};

mod votes;
pub use votes::{Vote, VoteTracker};

pub mod api {
    pub use luma_api::*;
}

#[cfg(test)]
mod testutil;
