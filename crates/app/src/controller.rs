use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use counsel_llm::{
    Attachment, CompletionService, EnrichmentFlags, ProviderStreamHandle, StreamEventMapped,
    StreamEventPayload, StreamGeneration, StreamRequest, StreamTarget,
};
use counsel_storage::{
    DEFAULT_SESSION_TITLE, HistoryEntry, LAST_MESSAGE_PREVIEW_CHARS, LastSessionCache,
    SessionId, SessionRecord, SessionStore, ShareId, StorageResult, TITLE_PREVIEW_CHARS,
    UNTITLED_SESSION_TITLE, UserId, preview,
};

use crate::capability::{CapabilityResult, Clipboard, SpeechSynthesizer, UnavailableSnafu};
use crate::chat::{ChatRenderer, MessageId, RenderedRow, Role};
use crate::export::ExportDocument;

/// Where the controller stands with respect to the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Creating,
    Loading(SessionId),
    Active(SessionId),
}

impl Phase {
    /// Session being loaded or shown, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Loading(session_id) | Self::Active(session_id) => Some(session_id),
            Self::Uninitialized | Self::Creating => None,
        }
    }
}

/// Tags one history fetch so an older fetch of the same session is
/// recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadGeneration(pub u64);

impl LoadGeneration {
    /// Returns the generation that supersedes this one.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Sent(StreamTarget),
    /// Blank text and no attachments; nothing changed.
    Ignored,
    /// A reply is still streaming.
    Busy,
    /// No session is active yet.
    NotReady,
}

/// Non-fatal conditions surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    CreateFailed { fallback: SessionId, message: String },
    HistoryUnavailable { session_id: SessionId, message: String },
    SessionsUnavailable { message: String },
    RenameFailed { session_id: SessionId, message: String },
    DeleteFailed { session_id: SessionId, message: String },
    ShareFailed { session_id: SessionId, message: String },
    ShareLink { session_id: SessionId, url: String, copied: bool },
    ClipboardFailed { message: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateFailed { message, .. } => write!(
                formatter,
                "Could not start a new chat on the server, continuing locally: {message}"
            ),
            Self::HistoryUnavailable { message, .. } => {
                write!(formatter, "Could not load chat history: {message}")
            }
            Self::SessionsUnavailable { message } => {
                write!(formatter, "Could not load your chats: {message}")
            }
            Self::RenameFailed { message, .. } => {
                write!(formatter, "Could not rename chat: {message}")
            }
            Self::DeleteFailed { message, .. } => {
                write!(formatter, "Could not delete chat: {message}")
            }
            Self::ShareFailed { message, .. } => {
                write!(formatter, "Could not share chat: {message}")
            }
            Self::ShareLink { url, copied: true, .. } => {
                write!(formatter, "Share link copied to clipboard: {url}")
            }
            Self::ShareLink { url, copied: false, .. } => write!(formatter, "Share link: {url}"),
            Self::ClipboardFailed { message } => {
                write!(formatter, "Could not copy to clipboard: {message}")
            }
        }
    }
}

/// Result of background work, tagged with what it was issued for.
#[derive(Debug)]
pub enum ControllerEvent {
    SessionCreated {
        request: u64,
        result: StorageResult<SessionId>,
    },
    HistoryLoaded {
        session_id: SessionId,
        load: LoadGeneration,
        result: StorageResult<Vec<HistoryEntry>>,
    },
    SessionsListed {
        request: u64,
        result: StorageResult<Vec<SessionRecord>>,
    },
    SessionRenamed {
        session_id: SessionId,
        result: StorageResult<()>,
    },
    SessionDeleted {
        session_id: SessionId,
        result: StorageResult<()>,
    },
    SessionShared {
        session_id: SessionId,
        result: StorageResult<ShareId>,
    },
    ExchangeRecorded {
        session_id: SessionId,
        result: StorageResult<()>,
    },
    Stream(StreamEventMapped),
    /// The provider stream ended; harmless when a terminal event came first.
    StreamClosed(StreamTarget),
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub user_id: UserId,
    pub share_base_url: String,
}

impl ControllerOptions {
    /// Creates options for one user; share links are built under `share_base_url`.
    pub fn new(user_id: UserId, share_base_url: impl Into<String>) -> Self {
        Self {
            user_id,
            share_base_url: share_base_url.into(),
        }
    }
}

struct ActiveStream {
    target: StreamTarget,
    prompt: HistoryEntry,
    reader: JoinHandle<()>,
}

/// Owns the current session and its transcript, and reconciles them with the
/// session store and the completion service.
///
/// Actions update local state at once and start background work. The owner
/// feeds results back through [`SessionController::next_event`] and
/// [`SessionController::apply`], or drains everything with
/// [`SessionController::settle`]. Results that no longer match the current
/// phase are dropped.
pub struct SessionController {
    store: Arc<dyn SessionStore>,
    service: Arc<dyn CompletionService>,
    last_session: Arc<dyn LastSessionCache>,
    clipboard: Option<Arc<dyn Clipboard>>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    options: ControllerOptions,
    phase: Phase,
    local_only: bool,
    renderer: ChatRenderer,
    sessions: Vec<SessionRecord>,
    deleted: HashSet<SessionId>,
    notices: Vec<Notice>,
    create_request: u64,
    list_request: u64,
    load_generation: LoadGeneration,
    next_stream_generation: StreamGeneration,
    active_stream: Option<ActiveStream>,
    outstanding: usize,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
}

impl SessionController {
    /// Creates an idle controller; call [`SessionController::start`] to pick
    /// a session.
    pub fn new(
        store: Arc<dyn SessionStore>,
        service: Arc<dyn CompletionService>,
        last_session: Arc<dyn LastSessionCache>,
        options: ControllerOptions,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store,
            service,
            last_session,
            clipboard: None,
            synthesizer: None,
            options,
            phase: Phase::Uninitialized,
            local_only: false,
            renderer: ChatRenderer::new(),
            sessions: Vec::new(),
            deleted: HashSet::new(),
            notices: Vec::new(),
            create_request: 0,
            list_request: 0,
            load_generation: LoadGeneration(0),
            next_stream_generation: StreamGeneration::new(1),
            active_stream: None,
            outstanding: 0,
            events_tx,
            events_rx,
        }
    }

    /// Installs the clipboard used for share links and message copies.
    pub fn with_clipboard(mut self, clipboard: Arc<dyn Clipboard>) -> Self {
        self.clipboard = Some(clipboard);
        self
    }

    /// Installs the synthesizer used to read replies aloud.
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    /// Returns the current lifecycle phase.
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Returns the session being loaded or shown.
    pub fn current_session_id(&self) -> Option<&SessionId> {
        self.phase.session_id()
    }

    /// True when the current session only exists locally because the store
    /// could not create one.
    pub fn is_local_only(&self) -> bool {
        self.local_only
    }

    /// Returns the transcript of the current session.
    pub fn renderer(&self) -> &ChatRenderer {
        &self.renderer
    }

    /// Returns display rows, including the in-progress reply.
    pub fn rows(&self) -> Vec<RenderedRow> {
        self.renderer.rows()
    }

    /// Returns the sidebar list, most recent first.
    pub fn sessions(&self) -> &[SessionRecord] {
        &self.sessions
    }

    /// Returns listed sessions whose title or last message contains `query`,
    /// ignoring case. A blank query returns every session.
    pub fn search_sessions(&self, query: &str) -> Vec<&SessionRecord> {
        self.sessions
            .iter()
            .filter(|record| record.matches_query(query))
            .collect()
    }

    /// Returns notices not yet taken.
    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    /// Drains pending notices.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// True while a reply stream is open.
    pub fn is_streaming(&self) -> bool {
        self.active_stream.is_some()
    }

    /// True when no background work is outstanding.
    pub fn is_settled(&self) -> bool {
        self.outstanding == 0 && self.active_stream.is_none()
    }

    /// Resumes the last active session, or creates one when none is known.
    pub fn start(&mut self) {
        if self.phase != Phase::Uninitialized {
            return;
        }

        self.refresh_sessions();
        match self.last_session.load() {
            Ok(Some(session_id)) => {
                tracing::info!(session_id = %session_id, "resuming last active session");
                self.begin_load(session_id);
            }
            Ok(None) => self.begin_create(),
            Err(error) => {
                tracing::warn!(error = %error, "could not read last active session");
                self.begin_create();
            }
        }
    }

    /// Replaces the current session with a newly created one.
    pub fn create_new(&mut self) {
        self.begin_create();
    }

    /// Loads another session's history. Switching to the current session
    /// does nothing.
    pub fn switch_session(&mut self, session_id: SessionId) {
        if self.phase.session_id() == Some(&session_id) {
            return;
        }
        self.begin_load(session_id);
    }

    /// Refetches the sidebar list; only the newest response is applied.
    pub fn refresh_sessions(&mut self) {
        self.list_request = self.list_request.saturating_add(1);
        let request = self.list_request;
        let store = self.store.clone();
        let user_id = self.options.user_id.clone();
        self.spawn_request(async move {
            let result = store.list_sessions(&user_id).await;
            ControllerEvent::SessionsListed { request, result }
        });
    }

    /// Renames locally right away; a failed request is reported, never
    /// rolled back. Blank titles are ignored.
    pub fn rename(&mut self, session_id: &SessionId, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            return false;
        }

        if let Some(record) = self.session_record_mut(session_id) {
            record.title = title.to_string();
        }

        let store = self.store.clone();
        let session_id = session_id.clone();
        let title = title.to_string();
        self.spawn_request(async move {
            let result = store.rename_session(&session_id, &title).await;
            ControllerEvent::SessionRenamed { session_id, result }
        });
        true
    }

    /// Removes the session from the list right away. Deleting the current
    /// session moves to the first remaining one, or creates a new one.
    pub fn delete(&mut self, session_id: &SessionId) {
        self.sessions.retain(|record| record.id != *session_id);
        self.deleted.insert(session_id.clone());

        let store = self.store.clone();
        let deleted_id = session_id.clone();
        self.spawn_request(async move {
            let result = store.delete_session(&deleted_id).await;
            ControllerEvent::SessionDeleted {
                session_id: deleted_id,
                result,
            }
        });

        if self.phase.session_id() != Some(session_id) {
            return;
        }

        if let Err(error) = self.last_session.clear() {
            tracing::warn!(error = %error, "could not clear last active session");
        }
        match self.sessions.first().map(|record| record.id.clone()) {
            Some(next) => self.begin_load(next),
            None => self.begin_create(),
        }
    }

    /// Requests a share link, reported as a [`Notice::ShareLink`].
    pub fn share(&mut self, session_id: &SessionId) {
        let store = self.store.clone();
        let session_id = session_id.clone();
        self.spawn_request(async move {
            let result = store.share_session(&session_id).await;
            ControllerEvent::SessionShared { session_id, result }
        });
    }

    /// Builds the public link for a share id.
    pub fn share_url(&self, share_id: &ShareId) -> String {
        format!(
            "{}/shared/{share_id}",
            self.options.share_base_url.trim_end_matches('/')
        )
    }

    /// Appends the user message and starts streaming the reply.
    pub fn submit(
        &mut self,
        text: &str,
        attachments: Vec<Attachment>,
        enrichment: EnrichmentFlags,
    ) -> SubmitOutcome {
        let text = text.trim();
        if text.is_empty() && attachments.is_empty() {
            return SubmitOutcome::Ignored;
        }

        let Phase::Active(session_id) = &self.phase else {
            return SubmitOutcome::NotReady;
        };
        let session_id = session_id.clone();

        if self.active_stream.is_some() || self.renderer.is_streaming() {
            tracing::debug!(session_id = %session_id, "rejecting submit while a reply streams");
            return SubmitOutcome::Busy;
        }

        let generation = self.next_stream_generation;
        self.next_stream_generation = generation.next();
        let target = StreamTarget::new(session_id.clone(), generation);

        let files = attachments
            .iter()
            .map(|attachment| attachment.file.clone())
            .collect::<Vec<_>>();
        let history = self.renderer.provider_history();
        self.renderer.push_user(text, files.clone());
        if let Err(rejection) = self.renderer.begin_stream(target.clone()) {
            tracing::warn!(rejection = ?rejection, "stream could not start");
            return SubmitOutcome::Busy;
        }
        self.touch_session(&session_id, text);

        let request = StreamRequest::new(target.clone(), history, text)
            .with_user_id(self.options.user_id.clone())
            .with_attachments(attachments)
            .with_enrichment(enrichment);
        let mut prompt = HistoryEntry::new(Role::User, text);
        prompt.files = files;

        match self.service.stream_chat(request) {
            Ok(handle) => {
                tracing::info!(
                    session_id = %session_id,
                    generation = generation.0,
                    provider = %self.service.id(),
                    "streaming reply"
                );
                let reader = self.spawn_stream(handle);
                self.active_stream = Some(ActiveStream {
                    target: target.clone(),
                    prompt,
                    reader,
                });
            }
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "could not open stream");
                self.renderer.fail(&target, error.to_string());
            }
        }

        SubmitOutcome::Sent(target)
    }

    /// Cancels the streaming reply, keeping any partial text.
    pub fn stop(&mut self) -> bool {
        let Some(active) = self.active_stream.take() else {
            return false;
        };

        active.reader.abort();
        let kept = self.renderer.cancel(&active.target);
        tracing::info!(
            session_id = %active.target.session_id,
            kept_partial = kept.is_some(),
            "stream stopped by user"
        );
        true
    }

    /// Snapshots the finished transcript of the current session.
    pub fn export(&self) -> Option<ExportDocument> {
        let session_id = self.phase.session_id()?;
        Some(ExportDocument::from_messages(
            session_id,
            self.renderer.messages(),
            Utc::now(),
        ))
    }

    /// Reads a completed message aloud. Returns false when there is nothing
    /// to read or no synthesizer.
    pub fn speak_message(&self, message_id: MessageId) -> bool {
        let Some(synthesizer) = &self.synthesizer else {
            return false;
        };
        let Some(message) = self
            .renderer
            .message(message_id)
            .filter(|message| message.status.is_complete())
        else {
            return false;
        };

        synthesizer.speak(&message.content);
        true
    }

    /// Copies a completed message. Fails when no clipboard is installed.
    pub fn copy_message(&self, message_id: MessageId) -> CapabilityResult<bool> {
        let Some(clipboard) = &self.clipboard else {
            return UnavailableSnafu {
                stage: "copy-message",
                capability: "clipboard",
            }
            .fail();
        };
        let Some(message) = self
            .renderer
            .message(message_id)
            .filter(|message| message.status.is_complete())
        else {
            return Ok(false);
        };

        clipboard.write_text(&message.content)?;
        Ok(true)
    }

    /// Waits for the next background result.
    pub async fn next_event(&mut self) -> Option<ControllerEvent> {
        self.events_rx.recv().await
    }

    /// Applies events until no request or stream is outstanding.
    pub async fn settle(&mut self) {
        while !self.is_settled() {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            self.apply(event);
        }
    }

    /// Folds one background result into the controller state.
    pub fn apply(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Stream(event) => self.apply_stream_event(event),
            ControllerEvent::StreamClosed(target) => self.apply_stream_closed(target),
            event => {
                self.outstanding = self.outstanding.saturating_sub(1);
                self.apply_store_event(event);
            }
        }
    }

    fn apply_store_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::SessionCreated { request, result } => {
                self.apply_session_created(request, result)
            }
            ControllerEvent::HistoryLoaded {
                session_id,
                load,
                result,
            } => self.apply_history_loaded(session_id, load, result),
            ControllerEvent::SessionsListed { request, result } => {
                self.apply_sessions_listed(request, result)
            }
            ControllerEvent::SessionRenamed { session_id, result } => {
                if let Err(error) = result {
                    tracing::warn!(session_id = %session_id, error = %error, "rename failed");
                    self.notices.push(Notice::RenameFailed {
                        session_id,
                        message: error.to_string(),
                    });
                }
            }
            ControllerEvent::SessionDeleted { session_id, result } => {
                if let Err(error) = result {
                    tracing::warn!(session_id = %session_id, error = %error, "delete failed");
                    self.notices.push(Notice::DeleteFailed {
                        session_id,
                        message: error.to_string(),
                    });
                }
            }
            ControllerEvent::SessionShared { session_id, result } => {
                self.apply_session_shared(session_id, result)
            }
            ControllerEvent::ExchangeRecorded { session_id, result } => {
                if let Err(error) = result {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %error,
                        "could not record exchange"
                    );
                }
            }
            ControllerEvent::Stream(_) | ControllerEvent::StreamClosed(_) => {}
        }
    }

    fn apply_session_created(&mut self, request: u64, result: StorageResult<SessionId>) {
        if self.phase != Phase::Creating || request != self.create_request {
            tracing::debug!(request, "discarding stale session creation");
            return;
        }

        match result {
            Ok(session_id) => {
                tracing::info!(session_id = %session_id, "created session");
                if self.session_record_mut(&session_id).is_none() {
                    self.sessions.insert(0, SessionRecord::new(session_id.clone()));
                }
                self.begin_load(session_id);
                self.refresh_sessions();
            }
            Err(error) => {
                let fallback = SessionId::new_v4();
                tracing::warn!(
                    error = %error,
                    fallback = %fallback,
                    "session creation failed; continuing with a local session"
                );
                self.phase = Phase::Active(fallback.clone());
                self.local_only = true;
                self.renderer = ChatRenderer::new();
                self.remember(&fallback);
                self.sessions.insert(0, SessionRecord::new(fallback.clone()));
                self.notices.push(Notice::CreateFailed {
                    fallback,
                    message: error.to_string(),
                });
            }
        }
    }

    fn apply_history_loaded(
        &mut self,
        session_id: SessionId,
        load: LoadGeneration,
        result: StorageResult<Vec<HistoryEntry>>,
    ) {
        let current = matches!(&self.phase, Phase::Loading(loading) if *loading == session_id);
        if !current || load != self.load_generation {
            tracing::debug!(
                session_id = %session_id,
                load = load.0,
                "discarding stale history"
            );
            return;
        }

        match result {
            Ok(entries) => {
                tracing::info!(
                    session_id = %session_id,
                    message_count = entries.len(),
                    "session loaded"
                );
                self.renderer = ChatRenderer::from_history(entries);
            }
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "history fetch failed");
                self.renderer = ChatRenderer::new();
                self.notices.push(Notice::HistoryUnavailable {
                    session_id: session_id.clone(),
                    message: error.to_string(),
                });
            }
        }
        self.phase = Phase::Active(session_id);
    }

    fn apply_sessions_listed(&mut self, request: u64, result: StorageResult<Vec<SessionRecord>>) {
        if request != self.list_request {
            tracing::debug!(request, "discarding stale session list");
            return;
        }

        match result {
            Ok(mut sessions) => {
                sessions.retain(|record| !self.deleted.contains(&record.id));
                if let Some(current) = self.phase.session_id()
                    && !sessions.iter().any(|record| record.id == *current)
                    && let Some(record) = self
                        .sessions
                        .iter()
                        .find(|record| record.id == *current)
                        .cloned()
                {
                    sessions.insert(0, record);
                }
                self.sessions = sessions;
            }
            Err(error) => {
                tracing::warn!(error = %error, "session list fetch failed");
                self.notices.push(Notice::SessionsUnavailable {
                    message: error.to_string(),
                });
            }
        }
    }

    fn apply_session_shared(&mut self, session_id: SessionId, result: StorageResult<ShareId>) {
        let share_id = match result {
            Ok(share_id) => share_id,
            Err(error) => {
                tracing::warn!(session_id = %session_id, error = %error, "share failed");
                self.notices.push(Notice::ShareFailed {
                    session_id,
                    message: error.to_string(),
                });
                return;
            }
        };

        let url = self.share_url(&share_id);
        let copied = match &self.clipboard {
            Some(clipboard) => match clipboard.write_text(&url) {
                Ok(()) => true,
                Err(error) => {
                    self.notices.push(Notice::ClipboardFailed {
                        message: error.to_string(),
                    });
                    false
                }
            },
            None => false,
        };
        self.notices.push(Notice::ShareLink {
            session_id,
            url,
            copied,
        });
    }

    fn apply_stream_event(&mut self, event: StreamEventMapped) {
        let is_current = self
            .active_stream
            .as_ref()
            .is_some_and(|active| active.target == event.target);
        if !is_current {
            tracing::debug!(stream = ?event.target, "discarding stale stream event");
            return;
        }

        let target = event.target;
        match event.payload {
            StreamEventPayload::Delta(delta) => {
                self.renderer.push_delta(&target, &delta);
            }
            StreamEventPayload::Context(context) => {
                self.renderer.set_context(&target, context);
            }
            StreamEventPayload::Done { honored } => {
                let Some(active) = self.active_stream.take() else {
                    return;
                };
                let Some(message_id) = self.renderer.complete(&target, honored) else {
                    return;
                };
                tracing::info!(session_id = %target.session_id, "reply complete");
                self.record_exchange(active.prompt, message_id);
            }
            StreamEventPayload::Error(message) => {
                self.active_stream = None;
                tracing::warn!(
                    session_id = %target.session_id,
                    error = %message,
                    "reply stream failed"
                );
                self.renderer.fail(&target, message);
            }
        }
    }

    fn apply_stream_closed(&mut self, target: StreamTarget) {
        let is_current = self
            .active_stream
            .as_ref()
            .is_some_and(|active| active.target == target);
        if !is_current {
            return;
        }

        self.active_stream = None;
        tracing::warn!(
            session_id = %target.session_id,
            "reply stream closed without a terminal event"
        );
        self.renderer
            .fail(&target, "stream closed before a terminal event");
    }

    fn record_exchange(&mut self, prompt: HistoryEntry, reply_id: MessageId) {
        let Some(reply) = self.renderer.message(reply_id) else {
            return;
        };
        let Some(session_id) = self.phase.session_id().cloned() else {
            return;
        };

        let entries = vec![prompt, HistoryEntry::new(Role::Assistant, reply.content.clone())];
        let store = self.store.clone();
        self.spawn_request(async move {
            let result = store.record_exchange(&session_id, &entries).await;
            ControllerEvent::ExchangeRecorded { session_id, result }
        });
    }

    fn begin_create(&mut self) {
        self.abandon_stream();
        self.create_request = self.create_request.saturating_add(1);
        self.phase = Phase::Creating;
        self.local_only = false;
        self.renderer = ChatRenderer::new();

        let request = self.create_request;
        let store = self.store.clone();
        let user_id = self.options.user_id.clone();
        self.spawn_request(async move {
            let result = store.create_session(&user_id).await;
            ControllerEvent::SessionCreated { request, result }
        });
    }

    fn begin_load(&mut self, session_id: SessionId) {
        self.abandon_stream();
        self.load_generation = self.load_generation.next();
        self.phase = Phase::Loading(session_id.clone());
        self.local_only = false;
        self.renderer = ChatRenderer::new();
        self.remember(&session_id);

        let load = self.load_generation;
        let store = self.store.clone();
        self.spawn_request(async move {
            let result = store.fetch_history(&session_id).await;
            ControllerEvent::HistoryLoaded {
                session_id,
                load,
                result,
            }
        });
    }

    /// Drops the in-flight stream without touching the transcript, which is
    /// about to be replaced.
    fn abandon_stream(&mut self) {
        if let Some(active) = self.active_stream.take() {
            tracing::debug!(stream = ?active.target, "abandoning stream");
            active.reader.abort();
        }
    }

    fn remember(&self, session_id: &SessionId) {
        if let Err(error) = self.last_session.store(session_id) {
            tracing::warn!(
                session_id = %session_id,
                error = %error,
                "could not persist last active session"
            );
        }
    }

    fn touch_session(&mut self, session_id: &SessionId, text: &str) {
        let position = self
            .sessions
            .iter()
            .position(|record| record.id == *session_id);
        let mut record = match position {
            Some(position) => self.sessions.remove(position),
            None => SessionRecord::new(session_id.clone()),
        };

        if record.title == DEFAULT_SESSION_TITLE || record.title == UNTITLED_SESSION_TITLE {
            record.title = preview(text, TITLE_PREVIEW_CHARS);
        }
        record.last_message = preview(text, LAST_MESSAGE_PREVIEW_CHARS);
        record.touched_at = Some(Utc::now());
        self.sessions.insert(0, record);
    }

    fn session_record_mut(&mut self, session_id: &SessionId) -> Option<&mut SessionRecord> {
        self.sessions
            .iter_mut()
            .find(|record| record.id == *session_id)
    }

    fn spawn_request<F>(&mut self, request: F)
    where
        F: Future<Output = ControllerEvent> + Send + 'static,
    {
        self.outstanding = self.outstanding.saturating_add(1);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let _ = events_tx.send(request.await);
        });
    }

    /// Runs the provider worker and forwards its events until a terminal
    /// event or the end of the stream. Aborting the returned reader drops
    /// the stream, which cancels the worker.
    fn spawn_stream(&self, handle: ProviderStreamHandle) -> JoinHandle<()> {
        tokio::spawn(handle.worker);

        let events_tx = self.events_tx.clone();
        let mut stream = handle.stream;
        tokio::spawn(async move {
            let target = stream.target().clone();
            while let Some(event) = stream.recv().await {
                let terminal = event.is_terminal();
                if events_tx.send(ControllerEvent::Stream(event)).is_err() || terminal {
                    return;
                }
            }
            let _ = events_tx.send(ControllerEvent::StreamClosed(target));
        })
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.abandon_stream();
    }
}
