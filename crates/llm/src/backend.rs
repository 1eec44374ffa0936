use std::time::Duration;

use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use counsel_storage::MessageRole;

use super::decode::{SseItem, SseLines, Utf8Carry};
use super::provider::{
    BuildHttpClientSnafu, CompletionService, DecodeResponseSnafu, EmptyPromptSnafu,
    EncodeRequestSnafu, InvalidMimeTypeSnafu, ProviderConfig, ProviderError, ProviderResult,
    ProviderStreamHandle, ProviderWorker, ReadBodySnafu, ResponseStatusSnafu,
    ResponseTimeoutSnafu, SendRequestSnafu, StreamRequest, make_event_stream,
};
use super::stream::{
    ContextBlocks, EnrichmentFlags, StreamEventMapped, StreamEventPayload, StreamTarget,
};

pub const BACKEND_PROVIDER_ID: &str = "backend";
pub const CHAT_PATH: &str = "api/chat";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Serialize)]
struct WireHistoryEntry<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    additional_context: Option<WireContext>,
}

#[derive(Debug, Default, Deserialize)]
struct WireContext {
    #[serde(default)]
    legal_cases: Option<String>,
    #[serde(default)]
    news_articles: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    legal_cases_error: Option<String>,
    #[serde(default)]
    news_articles_error: Option<String>,
    #[serde(default)]
    summary_error: Option<String>,
}

impl WireContext {
    fn into_blocks(self, target: &StreamTarget) -> ContextBlocks {
        for (block, error) in [
            ("legal_cases", &self.legal_cases_error),
            ("news_articles", &self.news_articles_error),
            ("summary", &self.summary_error),
        ] {
            if let Some(error) = error {
                tracing::warn!(
                    session_id = %target.session_id,
                    block,
                    error = %error,
                    "backend could not produce context block"
                );
            }
        }

        ContextBlocks {
            legal_cases: non_blank(self.legal_cases),
            news_articles: non_blank(self.news_articles),
            summary: non_blank(self.summary),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Json,
    EventStream,
    Text,
}

impl BodyKind {
    fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(content_type) = content_type else {
            return Self::Json;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if essence == "text/event-stream" {
            Self::EventStream
        } else if essence.starts_with("text/") {
            Self::Text
        } else {
            Self::Json
        }
    }
}

/// Completion service backed by the chat backend's multipart `/api/chat`.
///
/// The backend answers either with one JSON payload or with an incremental
/// `text/*` body; both are mapped onto the same event stream.
pub struct BackendCompletionService {
    config: ProviderConfig,
    client: reqwest::Client,
    chat_url: String,
}

impl BackendCompletionService {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context(BuildHttpClientSnafu {
                stage: "backend-build-client",
            })?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: ProviderConfig, client: reqwest::Client) -> Self {
        let base_url = config.endpoint.trim_end_matches('/');
        let chat_url = format!("{base_url}/{CHAT_PATH}");
        Self {
            config,
            client,
            chat_url,
        }
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    fn build_form(request: &StreamRequest) -> ProviderResult<Form> {
        let history = request
            .history
            .iter()
            .filter(|message| message.role != MessageRole::System)
            .map(|message| WireHistoryEntry {
                role: message.role.as_str(),
                content: &message.content,
            })
            .collect::<Vec<_>>();
        let history = serde_json::to_string(&history).context(EncodeRequestSnafu {
            stage: "backend-encode-history",
        })?;

        let mut form = Form::new()
            .text("message", request.text.clone())
            .text("session_id", request.target.session_id.to_string())
            .text("history", history)
            .text("fetchCases", flag(request.enrichment.fetch_cases))
            .text("fetchNews", flag(request.enrichment.fetch_news))
            .text("summarize", flag(request.enrichment.summarize));

        if let Some(user_id) = &request.user_id {
            form = form.text("user_id", user_id.to_string());
        }

        for (index, attachment) in request.attachments.iter().enumerate() {
            let file = &attachment.file;
            let mime_type = match file.mime_type.trim() {
                "" => FALLBACK_MIME_TYPE,
                mime_type => mime_type,
            };
            let part = Part::bytes(attachment.content.to_vec())
                .file_name(file.name.clone())
                .mime_str(mime_type)
                .context(InvalidMimeTypeSnafu {
                    stage: "backend-attach-file",
                    name: file.name.clone(),
                    mime_type: mime_type.to_string(),
                })?;

            form = form
                .part(format!("file{index}"), part)
                .text(
                    format!("analysisMode{index}"),
                    file.analysis_mode.as_str().to_string(),
                )
                .text(
                    format!("isScanned{index}"),
                    flag(file.analysis_mode.is_scanned()),
                );
        }

        Ok(form)
    }

    async fn open_response(
        client: &reqwest::Client,
        chat_url: &str,
        timeout: Duration,
        form: Form,
    ) -> ProviderResult<reqwest::Response> {
        let send = client.post(chat_url).multipart(form).send();
        let response = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| {
                ResponseTimeoutSnafu {
                    stage: "backend-open-stream",
                    timeout,
                }
                .build()
            })?
            .context(SendRequestSnafu {
                stage: "backend-send-chat",
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return ResponseStatusSnafu {
                stage: "backend-chat-status",
                status: status.as_u16(),
                body: error_message(&body),
            }
            .fail();
        }

        Ok(response)
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        chat_url: String,
        timeout: Duration,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target.clone();
        let emit = |payload: StreamEventPayload| {
            event_tx
                .send(StreamEventMapped::new(target.clone(), payload))
                .is_ok()
        };

        let form = match Self::build_form(&request) {
            Ok(form) => form,
            Err(error) => {
                tracing::error!(target = ?target, error = %error, "failed to build chat request");
                emit(StreamEventPayload::Error(error.to_string()));
                return;
            }
        };

        let response = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(target = ?target, "chat request cancelled before response");
                return;
            }
            opened = Self::open_response(&client, &chat_url, timeout, form) => match opened {
                Ok(response) => response,
                Err(error) => {
                    tracing::error!(
                        target = ?target,
                        chat_url = %chat_url,
                        error = %error,
                        "failed to open chat stream"
                    );
                    emit(StreamEventPayload::Error(error.to_string()));
                    return;
                }
            }
        };

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let kind = BodyKind::from_content_type(content_type.as_deref());
        tracing::debug!(target = ?target, kind = ?kind, "chat response opened");

        if kind == BodyKind::Json {
            let body = tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(target = ?target, "chat reply cancelled while reading");
                    return;
                }
                body = response.bytes() => body,
            };

            match body
                .context(ReadBodySnafu {
                    stage: "backend-read-reply",
                })
                .and_then(|body| {
                    serde_json::from_slice::<ChatReply>(&body).context(DecodeResponseSnafu {
                        stage: "backend-decode-reply",
                    })
                }) {
                Ok(reply) => {
                    for payload in reply_events(reply, &target, request.enrichment) {
                        if !emit(payload) {
                            return;
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(target = ?target, error = %error, "unreadable chat reply");
                    emit(StreamEventPayload::Error(error.to_string()));
                }
            }
            return;
        }

        let mut body = Box::pin(response.bytes_stream());
        let mut carry = Utf8Carry::new();
        let mut lines = SseLines::new();

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(target = ?target, "chat stream cancelled");
                    return;
                }
                next_chunk = body.next() => match next_chunk {
                    Some(Ok(chunk)) => {
                        let text = carry.push(&chunk);
                        match text_events(kind, &mut lines, &text) {
                            TextEvents::Continue(payloads) => {
                                for payload in payloads {
                                    if !emit(payload) {
                                        return;
                                    }
                                }
                            }
                            TextEvents::Finished(payloads) => {
                                for payload in payloads {
                                    if !emit(payload) {
                                        return;
                                    }
                                }
                                emit(StreamEventPayload::Done {
                                    honored: EnrichmentFlags::default(),
                                });
                                return;
                            }
                        }
                    }
                    Some(Err(source)) => {
                        let error = ProviderError::ReadBody {
                            stage: "backend-stream-chunk",
                            source,
                        };
                        tracing::warn!(target = ?target, error = %error, "chat stream broke");
                        emit(StreamEventPayload::Error(error.to_string()));
                        return;
                    }
                    None => break,
                }
            }
        }

        let mut tail = text_events(kind, &mut lines, &carry.finish()).into_payloads();
        if kind == BodyKind::EventStream
            && let Some(SseItem::Data(data)) = lines.finish()
        {
            tail.push(StreamEventPayload::Delta(data));
        }
        for payload in tail {
            if !emit(payload) {
                return;
            }
        }
        emit(StreamEventPayload::Done {
            honored: EnrichmentFlags::default(),
        });
    }
}

impl CompletionService for BackendCompletionService {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Chat backend"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            request.has_prompt(),
            EmptyPromptSnafu {
                stage: "backend-stream-chat",
                target: request.target.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target.clone());
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.chat_url.clone(),
            self.config.response_timeout,
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

enum TextEvents {
    Continue(Vec<StreamEventPayload>),
    Finished(Vec<StreamEventPayload>),
}

impl TextEvents {
    fn into_payloads(self) -> Vec<StreamEventPayload> {
        match self {
            Self::Continue(payloads) | Self::Finished(payloads) => payloads,
        }
    }
}

fn text_events(kind: BodyKind, lines: &mut SseLines, text: &str) -> TextEvents {
    if kind != BodyKind::EventStream {
        let payloads = if text.is_empty() {
            Vec::new()
        } else {
            vec![StreamEventPayload::Delta(text.to_string())]
        };
        return TextEvents::Continue(payloads);
    }

    let mut payloads = Vec::new();
    for item in lines.push(text) {
        match item {
            SseItem::Data(data) => payloads.push(StreamEventPayload::Delta(data)),
            SseItem::Done => return TextEvents::Finished(payloads),
        }
    }
    TextEvents::Continue(payloads)
}

fn reply_events(
    reply: ChatReply,
    target: &StreamTarget,
    requested: EnrichmentFlags,
) -> Vec<StreamEventPayload> {
    let mut payloads = Vec::new();

    if let Some(response) = reply.response.filter(|response| !response.is_empty()) {
        payloads.push(StreamEventPayload::Delta(response));
    }

    let context = reply
        .additional_context
        .map(|context| context.into_blocks(target))
        .filter(|context| !context.is_empty());
    let honored = requested.honored_by(context.as_ref());
    if let Some(context) = context {
        payloads.push(StreamEventPayload::Context(context));
    }

    payloads.push(StreamEventPayload::Done { honored });
    payloads
}

fn flag(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
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
    use crate::stream::StreamGeneration;
    use counsel_storage::SessionId;

    fn target() -> StreamTarget {
        StreamTarget::new(SessionId::parse("s-1").unwrap(), StreamGeneration::new(3))
    }

    #[test]
    fn content_types_select_body_decoding() {
        assert_eq!(BodyKind::from_content_type(None), BodyKind::Json);
        assert_eq!(
            BodyKind::from_content_type(Some("application/json")),
            BodyKind::Json
        );
        assert_eq!(
            BodyKind::from_content_type(Some("text/event-stream; charset=utf-8")),
            BodyKind::EventStream
        );
        assert_eq!(
            BodyKind::from_content_type(Some("Text/Plain")),
            BodyKind::Text
        );
    }

    #[test]
    fn json_reply_maps_to_delta_context_and_honored_flags() {
        let reply: ChatReply = serde_json::from_str(
            r#"{
                "response": "Consideration is...",
                "additional_context": {
                    "legal_cases": "Carlill v Carbolic",
                    "news_articles_error": "quota exceeded",
                    "summary": "   "
                }
            }"#,
        )
        .unwrap();
        let requested = EnrichmentFlags {
            fetch_cases: true,
            fetch_news: true,
            summarize: true,
        };

        let payloads = reply_events(reply, &target(), requested);

        assert_eq!(
            payloads,
            vec![
                StreamEventPayload::Delta("Consideration is...".to_string()),
                StreamEventPayload::Context(ContextBlocks {
                    legal_cases: Some("Carlill v Carbolic".to_string()),
                    news_articles: None,
                    summary: None,
                }),
                StreamEventPayload::Done {
                    honored: EnrichmentFlags {
                        fetch_cases: true,
                        fetch_news: false,
                        summarize: false,
                    }
                },
            ]
        );
    }

    #[test]
    fn empty_reply_still_terminates() {
        let reply: ChatReply = serde_json::from_str("{}").unwrap();
        let payloads = reply_events(reply, &target(), EnrichmentFlags::default());
        assert_eq!(
            payloads,
            vec![StreamEventPayload::Done {
                honored: EnrichmentFlags::default()
            }]
        );
    }

    #[test]
    fn plain_text_chunks_pass_through_and_sse_stops_at_done() {
        let mut lines = SseLines::new();
        assert!(matches!(
            text_events(BodyKind::Text, &mut lines, "Hi "),
            TextEvents::Continue(payloads) if payloads == vec![StreamEventPayload::Delta("Hi ".to_string())]
        ));

        let events = text_events(BodyKind::EventStream, &mut lines, "data: !\n\ndata: [DONE]\n");
        assert!(matches!(
            events,
            TextEvents::Finished(payloads) if payloads == vec![StreamEventPayload::Delta("!".to_string())]
        ));
    }

    #[test]
    fn chat_url_joins_base_without_double_slash() {
        let config = ProviderConfig::new(BACKEND_PROVIDER_ID, "", "http://localhost:8081/");
        let service = BackendCompletionService::new(config).unwrap();
        assert_eq!(service.chat_url(), "http://localhost:8081/api/chat");
    }
}
