use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::Utc;
use snafu::{OptionExt, ensure};
use tokio::sync::RwLock;

use super::error::{InvalidInputSnafu, NotFoundSnafu, StorageResult};
use super::ids::{SessionId, ShareId, UserId};
use super::types::{
    HistoryEntry, LAST_MESSAGE_PREVIEW_CHARS, MessageRole, SessionRecord, TITLE_PREVIEW_CHARS,
    preview,
};
use super::{BoxFuture, SessionStore};

#[derive(Debug, Clone)]
struct SessionRow {
    user_id: UserId,
    record: SessionRecord,
    history: Vec<HistoryEntry>,
    // The first recorded exchange replaces the placeholder title.
    titled: bool,
}

/// Process-local SessionStore with the same row semantics as the backend's
/// session collection. Used for offline runs and tests.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    rows: RwLock<HashMap<SessionId, SessionRow>>,
    shares: RwLock<HashMap<ShareId, SessionId>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a share id handed out by `share_session`.
    pub async fn shared_session(&self, share_id: &ShareId) -> Option<SessionId> {
        self.shares.read().await.get(share_id).cloned()
    }
}

impl SessionStore for MemorySessionStore {
    fn create_session<'a>(&'a self, user_id: &'a UserId) -> BoxFuture<'a, StorageResult<SessionId>> {
        Box::pin(async move {
            let id = SessionId::new_v4();
            let row = SessionRow {
                user_id: user_id.clone(),
                record: SessionRecord::new(id.clone()),
                history: Vec::new(),
                titled: false,
            };
            self.rows.write().await.insert(id.clone(), row);
            Ok(id)
        })
    }

    fn list_sessions<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, StorageResult<Vec<SessionRecord>>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            let mut sessions = rows
                .values()
                .filter(|row| &row.user_id == user_id)
                .map(|row| row.record.clone())
                .collect::<Vec<_>>();
            sessions.sort_by(sort_by_recent_desc);
            Ok(sessions)
        })
    }

    fn fetch_history<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<Vec<HistoryEntry>>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            let row = rows.get(session_id).context(NotFoundSnafu {
                stage: "memory-fetch-history",
                id: session_id.to_string(),
            })?;
            Ok(row.history.clone())
        })
    }

    fn rename_session<'a>(
        &'a self,
        session_id: &'a SessionId,
        title: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            ensure!(
                !title.trim().is_empty(),
                InvalidInputSnafu {
                    stage: "memory-rename-session",
                    details: "session title must not be blank".to_string(),
                }
            );

            let mut rows = self.rows.write().await;
            let row = rows.get_mut(session_id).context(NotFoundSnafu {
                stage: "memory-rename-session",
                id: session_id.to_string(),
            })?;
            row.record.title = title.trim().to_string();
            row.titled = true;
            Ok(())
        })
    }

    fn delete_session<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.rows
                .write()
                .await
                .remove(session_id)
                .context(NotFoundSnafu {
                    stage: "memory-delete-session",
                    id: session_id.to_string(),
                })?;
            self.shares
                .write()
                .await
                .retain(|_, shared| shared != session_id);
            Ok(())
        })
    }

    fn share_session<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<ShareId>> {
        Box::pin(async move {
            ensure!(
                self.rows.read().await.contains_key(session_id),
                NotFoundSnafu {
                    stage: "memory-share-session",
                    id: session_id.to_string(),
                }
            );

            let share_id = ShareId::new_v4();
            self.shares
                .write()
                .await
                .insert(share_id.clone(), session_id.clone());
            Ok(share_id)
        })
    }

    fn record_exchange<'a>(
        &'a self,
        session_id: &'a SessionId,
        entries: &'a [HistoryEntry],
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            let row = rows.get_mut(session_id).context(NotFoundSnafu {
                stage: "memory-record-exchange",
                id: session_id.to_string(),
            })?;

            if let Some(prompt) = entries
                .iter()
                .find(|entry| entry.role == MessageRole::User && !entry.content.trim().is_empty())
            {
                if !row.titled {
                    row.record.title = preview(&prompt.content, TITLE_PREVIEW_CHARS);
                    row.titled = true;
                }
                row.record.last_message = preview(&prompt.content, LAST_MESSAGE_PREVIEW_CHARS);
            }

            row.history.extend_from_slice(entries);
            row.record.touched_at = Some(Utc::now());
            Ok(())
        })
    }
}

fn sort_by_recent_desc(left: &SessionRecord, right: &SessionRecord) -> Ordering {
    right
        .touched_at
        .cmp(&left.touched_at)
        .then_with(|| right.id.cmp(&left.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::types::{DEFAULT_LAST_MESSAGE, DEFAULT_SESSION_TITLE};

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn sessions_are_scoped_to_their_user() {
        let store = MemorySessionStore::new();
        let alice = user("alice");
        let bob = user("bob");

        let alice_session = store.create_session(&alice).await.unwrap();
        store.create_session(&bob).await.unwrap();

        let listed = store.list_sessions(&alice).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, alice_session);
        assert_eq!(listed[0].title, DEFAULT_SESSION_TITLE);
        assert_eq!(listed[0].last_message, DEFAULT_LAST_MESSAGE);
    }

    #[tokio::test]
    async fn recorded_exchange_updates_previews_and_history() {
        let store = MemorySessionStore::new();
        let session = store.create_session(&user("u")).await.unwrap();

        let exchange = vec![
            HistoryEntry::new(
                MessageRole::User,
                "What did the court hold in the landmark privacy case?",
            ),
            HistoryEntry::new(MessageRole::Assistant, "It held that..."),
        ];
        store.record_exchange(&session, &exchange).await.unwrap();

        let listed = store.list_sessions(&user("u")).await.unwrap();
        assert_eq!(listed[0].title, "What did the court h...");
        assert_eq!(listed[0].last_message, "What did the court hold in the...");
        assert_eq!(store.fetch_history(&session).await.unwrap(), exchange);

        let follow_up = vec![HistoryEntry::new(MessageRole::User, "And the dissent?")];
        store.record_exchange(&session, &follow_up).await.unwrap();
        let listed = store.list_sessions(&user("u")).await.unwrap();
        assert_eq!(listed[0].title, "What did the court h...");
        assert_eq!(listed[0].last_message, "And the dissent?");
    }

    #[tokio::test]
    async fn rename_and_delete_of_missing_sessions_fail_with_not_found() {
        let store = MemorySessionStore::new();
        let missing = SessionId::parse("missing").unwrap();

        let rename = store.rename_session(&missing, "Title").await.unwrap_err();
        assert!(matches!(rename, StorageError::NotFound { .. }));

        let delete = store.delete_session(&missing).await.unwrap_err();
        assert!(matches!(delete, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn share_ids_resolve_until_the_session_is_deleted() {
        let store = MemorySessionStore::new();
        let session = store.create_session(&user("u")).await.unwrap();

        let share = store.share_session(&session).await.unwrap();
        assert_eq!(store.shared_session(&share).await, Some(session.clone()));

        store.delete_session(&session).await.unwrap();
        assert_eq!(store.shared_session(&share).await, None);
    }
}
