use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::ids::SessionId;

/// Title assigned by the backend to freshly created sessions.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";
/// Last-message preview assigned by the backend to freshly created sessions.
pub const DEFAULT_LAST_MESSAGE: &str = "Start a new conversation";
/// Title shown for listed sessions whose stored title is blank.
pub const UNTITLED_SESSION_TITLE: &str = "Untitled Chat";
/// Preview shown for listed sessions without any stored message.
pub const EMPTY_LAST_MESSAGE: &str = "No messages yet";
/// Characters of the first user message kept as a session title.
pub const TITLE_PREVIEW_CHARS: usize = 20;
/// Characters of the latest user message kept as the session preview.
pub const LAST_MESSAGE_PREVIEW_CHARS: usize = 30;

/// Truncates `text` to `max_chars` characters, marking the cut with `...`.
pub fn preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let mut characters = text.char_indices();
    match characters.nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Speaker of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Maps a backend role label onto a role.
    ///
    /// The history endpoint labels model turns `gemini`; anything that is not
    /// a user or system turn is treated as an assistant turn.
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Self::User,
            "system" => Self::System,
            _ => Self::Assistant,
        }
    }
}

impl Serialize for MessageRole {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageRole {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&raw))
    }
}

/// How the backend should analyse an attached file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    #[default]
    TextOnly,
    Visual,
    Full,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextOnly => "text_only",
            Self::Visual => "visual",
            Self::Full => "full",
        }
    }

    /// Files analysed visually are sent to the backend as scanned documents.
    pub fn is_scanned(&self) -> bool {
        !matches!(self, Self::TextOnly)
    }
}

/// Attachment metadata. Binary content never lives here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    #[serde(rename = "size", default)]
    pub size_bytes: u64,
    #[serde(rename = "analysisMode", default)]
    pub analysis_mode: AnalysisMode,
}

impl FileRef {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        size_bytes: u64,
        analysis_mode: AnalysisMode,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size_bytes,
            analysis_mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub title: String,
    pub last_message: String,
    pub touched_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            title: DEFAULT_SESSION_TITLE.to_string(),
            last_message: DEFAULT_LAST_MESSAGE.to_string(),
            touched_at: Some(Utc::now()),
        }
    }

    /// Case-insensitive substring match on the title or the last message.
    /// A blank query matches every record.
    pub fn matches_query(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        query.is_empty()
            || self.title.to_lowercase().contains(&query)
            || self.last_message.to_lowercase().contains(&query)
    }
}

/// One persisted turn as returned by the history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
}

impl HistoryEntry {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            files: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_cuts_on_character_boundaries() {
        assert_eq!(preview("short", 20), "short");
        assert_eq!(preview("exactly-ten", 11), "exactly-ten");
        assert_eq!(preview("  Überprüfung der Akten ", 5), "Überp...");
    }

    #[test]
    fn records_match_title_or_last_message_ignoring_case() {
        let mut record = SessionRecord::new(SessionId::parse("chat-1").unwrap());
        record.title = "Lease Dispute".to_string();
        record.last_message = "Is the deposit refundable?".to_string();

        assert!(record.matches_query("lease"));
        assert!(record.matches_query("  DEPOSIT "));
        assert!(record.matches_query(""));
        assert!(!record.matches_query("patent"));
    }

    #[test]
    fn history_roles_accept_backend_aliases() {
        let entries: Vec<HistoryEntry> = serde_json::from_str(
            r#"[
                {"role": "user", "content": "hi"},
                {"role": "gemini", "content": "hello"},
                {"role": "System", "content": "note"}
            ]"#,
        )
        .unwrap();

        let roles = entries.iter().map(|entry| entry.role).collect::<Vec<_>>();
        assert_eq!(
            roles,
            vec![MessageRole::User, MessageRole::Assistant, MessageRole::System]
        );
    }

    #[test]
    fn file_refs_use_browser_field_names() {
        let file: FileRef = serde_json::from_str(
            r#"{"name": "brief.pdf", "type": "application/pdf", "size": 2048, "analysisMode": "visual"}"#,
        )
        .unwrap();

        assert_eq!(file.mime_type, "application/pdf");
        assert_eq!(file.size_bytes, 2048);
        assert!(file.analysis_mode.is_scanned());

        let bare: FileRef = serde_json::from_str(r#"{"name": "notes.txt"}"#).unwrap();
        assert_eq!(bare.analysis_mode, AnalysisMode::TextOnly);
        assert!(!bare.analysis_mode.is_scanned());
    }
}
