use counsel_llm::{ContextBlocks, EnrichmentFlags, ProviderMessage, StreamTarget};
use counsel_storage::{FileRef, HistoryEntry};

use super::message::{
    Message, MessageId, MessageStatus, Role, StreamState, StreamTransition,
    StreamTransitionRejection,
};

pub const FAILURE_NOTICE: &str = "Failed to get a response. Please try again.";

/// One row of the rendered transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedRow {
    /// `None` for the in-flight placeholder, which has no message yet.
    pub id: Option<MessageId>,
    pub role: Role,
    pub content: String,
    pub attachments: Vec<FileRef>,
    pub context: Option<ContextBlocks>,
    pub status: MessageStatus,
    pub in_progress: bool,
}

impl RenderedRow {
    fn from_message(message: &Message) -> Self {
        Self {
            id: Some(message.id),
            role: message.role,
            content: message.content.clone(),
            attachments: message.attachments.clone(),
            context: message.context.clone(),
            status: message.status.clone(),
            in_progress: false,
        }
    }
}

/// Message list of one session plus the in-flight streaming buffer.
///
/// Messages are append-only. While a stream is active its text lives in the
/// buffer and only becomes a message once the stream ends.
#[derive(Debug, Default)]
pub struct ChatRenderer {
    messages: Vec<Message>,
    stream_state: StreamState,
    buffer: String,
    pending_context: Option<ContextBlocks>,
    next_message_id: u64,
}

impl ChatRenderer {
    pub fn new() -> Self {
        Self {
            next_message_id: 1,
            ..Self::default()
        }
    }

    pub fn from_history(entries: Vec<HistoryEntry>) -> Self {
        let mut renderer = Self::new();
        for entry in entries {
            let id = renderer.alloc_message_id();
            let mut message = Message::new(id, entry.role, entry.content, MessageStatus::Done);
            message.attachments = entry.files;
            renderer.messages.push(message);
        }
        renderer
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn stream_state(&self) -> &StreamState {
        &self.stream_state
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_state.is_streaming()
    }

    pub fn active_target(&self) -> Option<&StreamTarget> {
        self.stream_state.active_target()
    }

    pub fn streaming_text(&self) -> Option<&str> {
        self.is_streaming().then_some(self.buffer.as_str())
    }

    pub fn push_user(&mut self, content: impl Into<String>, attachments: Vec<FileRef>) -> MessageId {
        let id = self.alloc_message_id();
        self.messages.push(Message::user(id, content, attachments));
        id
    }

    pub fn push_notice(&mut self, content: impl Into<String>) -> MessageId {
        let id = self.alloc_message_id();
        self.messages.push(Message::system_notice(id, content));
        id
    }

    /// Prior turns to send along with a new prompt. System notices stay local.
    pub fn provider_history(&self) -> Vec<ProviderMessage> {
        self.messages
            .iter()
            .filter(|message| message.role != Role::System)
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| ProviderMessage::new(message.role, message.content.clone()))
            .collect()
    }

    pub fn begin_stream(&mut self, target: StreamTarget) -> Result<(), StreamTransitionRejection> {
        self.stream_state = self.stream_state.apply(StreamTransition::Start(target))?;
        self.buffer.clear();
        self.pending_context = None;
        Ok(())
    }

    pub fn push_delta(&mut self, target: &StreamTarget, delta: &str) -> bool {
        if !self.stream_state.accepts_stream_event(target) {
            return false;
        }
        self.buffer.push_str(delta);
        true
    }

    pub fn set_context(&mut self, target: &StreamTarget, context: ContextBlocks) -> bool {
        if !self.stream_state.accepts_stream_event(target) {
            return false;
        }
        self.pending_context = (!context.is_empty()).then_some(context);
        true
    }

    /// Finalizes the buffer into an assistant message.
    pub fn complete(&mut self, target: &StreamTarget, honored: EnrichmentFlags) -> Option<MessageId> {
        self.stream_state = self
            .stream_state
            .apply(StreamTransition::Complete(target.clone()))
            .ok()?;

        let id = self.alloc_message_id();
        let content = std::mem::take(&mut self.buffer);
        let context = self.pending_context.take();
        self.messages.push(
            Message::new(id, Role::Assistant, content, MessageStatus::Done)
                .with_context(context, honored),
        );
        Some(id)
    }

    /// Drops the partial buffer and appends the fixed failure notice.
    pub fn fail(&mut self, target: &StreamTarget, reason: impl Into<String>) -> Option<MessageId> {
        self.stream_state = self
            .stream_state
            .apply(StreamTransition::Fail {
                target: target.clone(),
                message: reason.into(),
            })
            .ok()?;

        self.buffer.clear();
        self.pending_context = None;
        let id = self.alloc_message_id();
        self.messages.push(Message::new(
            id,
            Role::System,
            FAILURE_NOTICE,
            MessageStatus::Error(FAILURE_NOTICE.to_string()),
        ));
        Some(id)
    }

    /// Ends the stream on user request. Partial text survives as a cancelled
    /// assistant message; without partial text nothing is appended.
    pub fn cancel(&mut self, target: &StreamTarget) -> Option<MessageId> {
        self.stream_state = self
            .stream_state
            .apply(StreamTransition::Cancel(target.clone()))
            .ok()?;

        let content = std::mem::take(&mut self.buffer);
        let context = self.pending_context.take();
        if content.is_empty() {
            return None;
        }

        let id = self.alloc_message_id();
        self.messages.push(
            Message::new(id, Role::Assistant, content, MessageStatus::Cancelled)
                .with_context(context, EnrichmentFlags::default()),
        );
        Some(id)
    }

    pub fn rows(&self) -> Vec<RenderedRow> {
        let mut rows = self
            .messages
            .iter()
            .map(RenderedRow::from_message)
            .collect::<Vec<_>>();

        if let Some(target) = self.stream_state.active_target() {
            rows.push(RenderedRow {
                id: None,
                role: Role::Assistant,
                content: self.buffer.clone(),
                attachments: Vec::new(),
                context: self.pending_context.clone(),
                status: MessageStatus::Streaming(target.generation),
                in_progress: true,
            });
        }

        rows
    }

    fn alloc_message_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_message_id);
        self.next_message_id = self.next_message_id.saturating_add(1);
        id
    }
}
