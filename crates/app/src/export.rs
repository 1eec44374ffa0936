use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use counsel_storage::{HistoryEntry, MessageRole, SessionId};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::Message;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExportError {
    #[snafu(display("failed to encode transcript on `{stage}`: {source}"))]
    EncodeTranscript {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode transcript on `{stage}`: {source}"))]
    DecodeTranscript {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to create export directory {path:?} on `{stage}`: {source}"))]
    CreateExportDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write transcript to {path:?} on `{stage}`: {source}"))]
    WriteTranscript {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type ExportResult<T> = Result<T, ExportError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Portable JSON form of one transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub chat_id: String,
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ExportedMessage>,
}

impl ExportDocument {
    /// Builds a document from stored messages. The reply still streaming
    /// lives in the renderer's buffer and is never among them.
    pub fn from_messages(session_id: &SessionId, messages: &[Message], exported_at: DateTime<Utc>) -> Self {
        let messages = messages
            .iter()
            .map(|message| ExportedMessage {
                role: message.role,
                content: message.content.clone(),
                timestamp: message.created_at,
            })
            .collect();

        Self {
            chat_id: session_id.to_string(),
            exported_at,
            messages,
        }
    }

    pub fn to_json(&self) -> ExportResult<String> {
        serde_json::to_string_pretty(self).context(EncodeTranscriptSnafu {
            stage: "encode-export-document",
        })
    }

    pub fn from_json(raw: &str) -> ExportResult<Self> {
        serde_json::from_str(raw).context(DecodeTranscriptSnafu {
            stage: "decode-export-document",
        })
    }

    pub fn into_history(self) -> Vec<HistoryEntry> {
        self.messages
            .into_iter()
            .map(|message| HistoryEntry::new(message.role, message.content))
            .collect()
    }

    /// File name for this export. Characters outside `[A-Za-z0-9._-]` in the
    /// chat id become `_` so the name stays inside the target directory.
    pub fn file_name(&self) -> String {
        let chat_id = self
            .chat_id
            .chars()
            .map(|ch| match ch {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => ch,
                _ => '_',
            })
            .collect::<String>();
        format!("chat-export-{chat_id}.json")
    }

    /// Writes the document into `dir` through a temporary file and returns
    /// the final path.
    pub fn write_to_dir(&self, dir: &Path) -> ExportResult<PathBuf> {
        std::fs::create_dir_all(dir).context(CreateExportDirSnafu {
            stage: "create-export-directory",
            path: dir.to_path_buf(),
        })?;

        let path = dir.join(self.file_name());
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, self.to_json()?).context(WriteTranscriptSnafu {
            stage: "write-temporary-export",
            path: temp_path.clone(),
        })?;
        std::fs::rename(&temp_path, &path).context(WriteTranscriptSnafu {
            stage: "replace-export",
            path: path.clone(),
        })?;

        tracing::info!(path = %path.display(), "exported transcript");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatRenderer;

    fn session() -> SessionId {
        SessionId::parse("chat-9").unwrap()
    }

    #[test]
    fn export_preserves_order_and_round_trips() {
        let mut renderer = ChatRenderer::new();
        renderer.push_user("What is estoppel?", Vec::new());
        renderer.push_notice("Failed to get a response. Please try again.");
        renderer.push_user("Again please", Vec::new());

        let document = ExportDocument::from_messages(&session(), renderer.messages(), Utc::now());
        let json = document.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["chat_id"], "chat-9");
        assert_eq!(value["messages"].as_array().unwrap().len(), 3);
        assert_eq!(value["messages"][1]["role"], "system");

        let imported = ExportDocument::from_json(&json).unwrap().into_history();
        let pairs = imported
            .iter()
            .map(|entry| (entry.role, entry.content.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            pairs,
            vec![
                (MessageRole::User, "What is estoppel?"),
                (MessageRole::System, "Failed to get a response. Please try again."),
                (MessageRole::User, "Again please"),
            ]
        );
    }

    #[test]
    fn empty_transcript_exports_an_empty_array() {
        let document = ExportDocument::from_messages(&session(), &[], Utc::now());
        let value: serde_json::Value = serde_json::from_str(&document.to_json().unwrap()).unwrap();
        assert_eq!(value["messages"], serde_json::json!([]));
    }

    #[test]
    fn export_is_written_under_the_chat_id() {
        let temp = tempfile::tempdir().unwrap();
        let document = ExportDocument::from_messages(&session(), &[], Utc::now());

        let path = document.write_to_dir(&temp.path().join("exports")).unwrap();

        assert!(path.ends_with("chat-export-chat-9.json"));
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(ExportDocument::from_json(&written).unwrap(), document);
    }

    #[test]
    fn chat_ids_with_separators_stay_in_the_export_dir() {
        let temp = tempfile::tempdir().unwrap();
        let session_id = SessionId::parse("../team/chat 7").unwrap();
        let document = ExportDocument::from_messages(&session_id, &[], Utc::now());

        assert_eq!(document.file_name(), "chat-export-.._team_chat_7.json");
        let path = document.write_to_dir(temp.path()).unwrap();
        assert_eq!(path.parent(), Some(temp.path()));
        assert!(path.is_file());
    }

    #[test]
    fn malformed_documents_are_rejected() {
        let error = ExportDocument::from_json("{\"messages\": 3}").unwrap_err();
        assert!(matches!(error, ExportError::DecodeTranscript { .. }));
    }
}
