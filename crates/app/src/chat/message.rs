use chrono::{DateTime, Utc};
use counsel_llm::{ContextBlocks, EnrichmentFlags, StreamGeneration, StreamTarget};
use counsel_storage::FileRef;

pub use counsel_storage::MessageRole as Role;

/// Client-local identifier for one message; never sent to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Creates a typed message identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Streaming(StreamGeneration),
    Done,
    Error(String),
    Cancelled,
}

impl MessageStatus {
    /// True only for replies that finished normally.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// One transcript entry as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub attachments: Vec<FileRef>,
    pub context: Option<ContextBlocks>,
    /// Enrichment flags that produced returned context for this reply.
    pub honored: EnrichmentFlags,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Creates a message with no attachments or context.
    pub fn new(
        id: MessageId,
        role: Role,
        content: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            attachments: Vec::new(),
            context: None,
            honored: EnrichmentFlags::default(),
            status,
            created_at: Utc::now(),
        }
    }

    /// Creates a finished user message.
    pub fn user(id: MessageId, content: impl Into<String>, attachments: Vec<FileRef>) -> Self {
        let mut message = Self::new(id, Role::User, content, MessageStatus::Done);
        message.attachments = attachments;
        message
    }

    /// Creates a finished system notice.
    pub fn system_notice(id: MessageId, content: impl Into<String>) -> Self {
        Self::new(id, Role::System, content, MessageStatus::Done)
    }

    /// Attaches returned context and the flags that produced it.
    pub fn with_context(mut self, context: Option<ContextBlocks>, honored: EnrichmentFlags) -> Self {
        self.context = context;
        self.honored = honored;
        self
    }
}

/// Stream state boundary for one transcript.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(StreamTarget),
    Done(StreamTarget),
    Error {
        target: StreamTarget,
        message: String,
    },
    Cancelled(StreamTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamTarget),
    Complete(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
    Cancel(StreamTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    TargetMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    pub fn active_target(&self) -> Option<&StreamTarget> {
        match self {
            Self::Streaming(target) => Some(target),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    pub fn accepts_stream_event(&self, target: &StreamTarget) -> bool {
        matches!(self, Self::Streaming(active) if active == target)
    }

    /// Applies one transition.
    ///
    /// Non-streaming states may start a new stream directly. Terminal
    /// transitions must name the active target exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(target) => self.apply_start(target),
            StreamTransition::Complete(target) => {
                self.apply_terminal(target, |target| Self::Done(target))
            }
            StreamTransition::Fail { target, message } => {
                self.apply_terminal(target, |target| Self::Error { target, message })
            }
            StreamTransition::Cancel(target) => {
                self.apply_terminal(target, |target| Self::Cancelled(target))
            }
        }
    }

    fn apply_start(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active != target => {
                Err(StreamTransitionRejection::AlreadyStreaming {
                    active: active.clone(),
                    attempted: target,
                })
            }
            Self::Streaming(_) => Ok(self.clone()),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Ok(Self::Streaming(target))
            }
        }
    }

    fn apply_terminal(
        &self,
        target: StreamTarget,
        next: impl FnOnce(StreamTarget) -> Self,
    ) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == target => Ok(next(target)),
            Self::Streaming(active) => Err(StreamTransitionRejection::TargetMismatch {
                active: active.clone(),
                attempted: target,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use counsel_storage::SessionId;

    fn target(session: &str, generation: u64) -> StreamTarget {
        StreamTarget::new(
            SessionId::parse(session).unwrap(),
            StreamGeneration::new(generation),
        )
    }

    #[test]
    fn second_start_with_other_target_is_rejected() {
        let state = StreamState::Idle.apply(StreamTransition::Start(target("a", 1))).unwrap();

        let rejection = state
            .apply(StreamTransition::Start(target("a", 2)))
            .unwrap_err();
        assert!(matches!(
            rejection,
            StreamTransitionRejection::AlreadyStreaming { .. }
        ));
    }

    #[test]
    fn terminal_transitions_require_the_active_target() {
        let state = StreamState::Streaming(target("a", 1));

        assert!(matches!(
            state.apply(StreamTransition::Complete(target("b", 1))),
            Err(StreamTransitionRejection::TargetMismatch { .. })
        ));
        assert_eq!(
            state.apply(StreamTransition::Cancel(target("a", 1))),
            Ok(StreamState::Cancelled(target("a", 1)))
        );
        assert_eq!(
            StreamState::Idle.apply(StreamTransition::Fail {
                target: target("a", 1),
                message: "x".to_string(),
            }),
            Err(StreamTransitionRejection::NoActiveStream)
        );
    }
}
