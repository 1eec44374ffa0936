use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod http;
pub mod ids;
pub mod local;
pub mod memory;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use http::{DEFAULT_API_BASE_URL, DEFAULT_RESPONSE_TIMEOUT, HttpSessionStore};
pub use ids::{SessionId, ShareId, UserId};
pub use local::{FileLastSessionCache, LastSessionCache, MemoryLastSessionCache};
pub use memory::MemorySessionStore;
pub use types::{
    AnalysisMode, DEFAULT_LAST_MESSAGE, DEFAULT_SESSION_TITLE, EMPTY_LAST_MESSAGE, FileRef,
    HistoryEntry, LAST_MESSAGE_PREVIEW_CHARS, MessageRole, SessionRecord, TITLE_PREVIEW_CHARS,
    UNTITLED_SESSION_TITLE, preview,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Remote persistence for chat sessions keyed by session id.
///
/// Every method is a single request; implementations never retry.
pub trait SessionStore: Send + Sync {
    fn create_session<'a>(&'a self, user_id: &'a UserId) -> BoxFuture<'a, StorageResult<SessionId>>;
    fn list_sessions<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, StorageResult<Vec<SessionRecord>>>;
    fn fetch_history<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<Vec<HistoryEntry>>>;
    fn rename_session<'a>(
        &'a self,
        session_id: &'a SessionId,
        title: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn delete_session<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, StorageResult<()>>;
    fn share_session<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<ShareId>>;

    /// Records a completed exchange for stores that do not observe the
    /// completion endpoint themselves. The chat backend persists turns on its
    /// own, so the default does nothing.
    fn record_exchange<'a>(
        &'a self,
        _session_id: &'a SessionId,
        _entries: &'a [HistoryEntry],
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}
