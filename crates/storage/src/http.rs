use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{
    BuildHttpClientSnafu, DecodePayloadSnafu, HttpRequestSnafu, HttpStatusSnafu, StorageResult,
};
use super::ids::{SessionId, ShareId, UserId};
use super::types::{EMPTY_LAST_MESSAGE, HistoryEntry, SessionRecord, UNTITLED_SESSION_TITLE};
use super::{BoxFuture, SessionStore};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8081";
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct CreateSessionBody<'a> {
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateSessionReply {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryReply {
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct UserChatsReply {
    #[serde(default)]
    chats: Vec<WireChat>,
}

#[derive(Debug, Deserialize)]
struct WireChat {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "lastMessage", default)]
    last_message: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
struct RenameBody<'a> {
    session_id: &'a str,
    title: &'a str,
}

#[derive(Debug, Serialize)]
struct SessionBody<'a> {
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ShareReply {
    share_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: String,
}

/// SessionStore backed by the chat backend's REST endpoints.
#[derive(Debug, Clone)]
pub struct HttpSessionStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSessionStore {
    pub fn new(base_url: &str, timeout: Duration) -> StorageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context(BuildHttpClientSnafu {
                stage: "http-store-new",
            })?;

        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_json<T>(response: reqwest::Response, stage: &'static str) -> StorageResult<T>
    where
        T: DeserializeOwned,
    {
        let status = response.status();
        let body = response.text().await.context(HttpRequestSnafu { stage })?;

        if !status.is_success() {
            return HttpStatusSnafu {
                stage,
                status: status.as_u16(),
                body: error_message(&body),
            }
            .fail();
        }

        serde_json::from_str(&body).context(DecodePayloadSnafu { stage })
    }

    async fn read_ack(response: reqwest::Response, stage: &'static str) -> StorageResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.context(HttpRequestSnafu { stage })?;
        HttpStatusSnafu {
            stage,
            status: status.as_u16(),
            body: error_message(&body),
        }
        .fail()
    }
}

impl SessionStore for HttpSessionStore {
    fn create_session<'a>(&'a self, user_id: &'a UserId) -> BoxFuture<'a, StorageResult<SessionId>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("/api/reset"))
                .json(&CreateSessionBody {
                    user_id: user_id.as_str(),
                })
                .send()
                .await
                .context(HttpRequestSnafu {
                    stage: "create-session-send",
                })?;

            let reply: CreateSessionReply =
                Self::read_json(response, "create-session-read").await?;
            SessionId::parse(&reply.session_id)
        })
    }

    fn list_sessions<'a>(
        &'a self,
        user_id: &'a UserId,
    ) -> BoxFuture<'a, StorageResult<Vec<SessionRecord>>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.url("/api/user-chats"))
                .query(&[("user_id", user_id.as_str())])
                .send()
                .await
                .context(HttpRequestSnafu {
                    stage: "list-sessions-send",
                })?;

            let reply: UserChatsReply = Self::read_json(response, "list-sessions-read").await?;
            let mut sessions = Vec::with_capacity(reply.chats.len());
            for chat in reply.chats {
                // A blank id cannot be addressed later, so the row is dropped.
                let Ok(id) = SessionId::parse(&chat.id) else {
                    tracing::warn!(raw_id = %chat.id, "skipping listed session with blank id");
                    continue;
                };
                sessions.push(SessionRecord {
                    id,
                    title: non_blank(chat.title, UNTITLED_SESSION_TITLE),
                    last_message: non_blank(chat.last_message, EMPTY_LAST_MESSAGE),
                    touched_at: chat.timestamp.as_deref().and_then(parse_timestamp),
                });
            }

            Ok(sessions)
        })
    }

    fn fetch_history<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<Vec<HistoryEntry>>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.url("/api/history"))
                .query(&[("session_id", session_id.as_str())])
                .send()
                .await
                .context(HttpRequestSnafu {
                    stage: "fetch-history-send",
                })?;

            let reply: HistoryReply = Self::read_json(response, "fetch-history-read").await?;
            Ok(reply.history)
        })
    }

    fn rename_session<'a>(
        &'a self,
        session_id: &'a SessionId,
        title: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("/api/rename-chat"))
                .json(&RenameBody {
                    session_id: session_id.as_str(),
                    title,
                })
                .send()
                .await
                .context(HttpRequestSnafu {
                    stage: "rename-session-send",
                })?;

            Self::read_ack(response, "rename-session-read").await
        })
    }

    fn delete_session<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("/api/delete-chat"))
                .json(&SessionBody {
                    session_id: session_id.as_str(),
                })
                .send()
                .await
                .context(HttpRequestSnafu {
                    stage: "delete-session-send",
                })?;

            Self::read_ack(response, "delete-session-read").await
        })
    }

    fn share_session<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> BoxFuture<'a, StorageResult<ShareId>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("/api/share"))
                .json(&SessionBody {
                    session_id: session_id.as_str(),
                })
                .send()
                .await
                .context(HttpRequestSnafu {
                    stage: "share-session-send",
                })?;

            let reply: ShareReply = Self::read_json(response, "share-session-read").await?;
            ShareId::parse(&reply.share_id)
        })
    }
}

fn non_blank(value: Option<String>, fallback: &str) -> String {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Accepts RFC 3339 stamps as well as the naive ISO stamps Python's
/// `datetime.isoformat()` emits for local times.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorReply>(body) {
        Ok(reply) => reply.error,
        Err(_) => body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_accept_naive_and_offset_forms() {
        let naive = parse_timestamp("2024-03-01T10:15:30.123456").unwrap();
        assert_eq!(naive.to_rfc3339(), "2024-03-01T10:15:30.123456+00:00");

        let offset = parse_timestamp("2024-03-01T10:15:30+02:00").unwrap();
        assert_eq!(offset.to_rfc3339(), "2024-03-01T08:15:30+00:00");

        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn error_bodies_prefer_backend_error_field() {
        assert_eq!(error_message(r#"{"error": "Session not found"}"#), "Session not found");
        assert_eq!(error_message("  bad gateway \n"), "bad gateway");
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let store = HttpSessionStore::with_client(reqwest::Client::new(), " http://host:1/ ");
        assert_eq!(store.base_url(), "http://host:1");
        assert_eq!(store.url("/api/reset"), "http://host:1/api/reset");
    }
}
