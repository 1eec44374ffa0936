use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use counsel_storage::MessageRole;

use super::provider::{
    CompletionService, CompletionsFailedSnafu, EmptyPromptSnafu, HttpClientSnafu,
    MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, ResponseTimeoutSnafu, StreamRequest,
    make_event_stream,
};
use super::stream::{EnrichmentFlags, StreamEventMapped, StreamEventPayload, StreamTarget};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
pub const DEFAULT_PREAMBLE: &str =
    "You are a helpful AI assistant. Answer questions concisely and accurately.";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Streams completions straight from an OpenAI-compatible endpoint.
///
/// No enrichment happens on this path, so every `Done` reports no honored
/// flags.
pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    pub fn model_id(&self) -> &str {
        self.config.model.as_deref().unwrap_or(DEFAULT_OPENAI_MODEL)
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            MessageRole::System => None,
            MessageRole::User => Some(RigMessage::user(message.content.clone())),
            MessageRole::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(request: &StreamRequest) -> String {
        let mut preamble_parts = vec![DEFAULT_PREAMBLE.to_string()];

        // Rig takes a single preamble, so system turns are folded into it.
        preamble_parts.extend(
            request
                .history
                .iter()
                .filter(|message| {
                    message.role == MessageRole::System && !message.content.trim().is_empty()
                })
                .map(|message| message.content.clone()),
        );

        preamble_parts.join("\n\n")
    }

    /// The user text followed by what the endpoint can read of each attachment:
    /// UTF-8 text files inline, anything else as a one-line note.
    fn prompt_text(request: &StreamRequest) -> String {
        let mut sections = Vec::new();
        if !request.text.trim().is_empty() {
            sections.push(request.text.clone());
        }

        for attachment in &request.attachments {
            let file = &attachment.file;
            let inline = file
                .mime_type
                .starts_with("text/")
                .then(|| std::str::from_utf8(&attachment.content).ok())
                .flatten();
            match inline {
                Some(text) => sections.push(format!("Content from {}:\n{text}", file.name)),
                None => sections.push(format!(
                    "[Attached file: {} ({}, {} bytes)]",
                    file.name, file.mime_type, file.size_bytes
                )),
            }
        }

        sections.join("\n\n")
    }

    async fn open_stream(
        config: &ProviderConfig,
        model_id: &str,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(model_id);

        let messages = request
            .history
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();
        let prompt = RigMessage::user(Self::prompt_text(request));

        let builder = model
            .completion_request(prompt)
            .messages(messages)
            .preamble(Self::merged_preamble(request));

        let timeout = config.response_timeout;
        tokio::time::timeout(timeout, builder.stream())
            .await
            .map_err(|_| {
                ResponseTimeoutSnafu {
                    stage: "open-stream",
                    timeout,
                }
                .build()
            })?
            .context(CompletionsFailedSnafu {
                stage: "open-stream",
            })
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: StreamTarget,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEventMapped::new(
            target,
            StreamEventPayload::Error(error.to_string()),
        ));
    }

    fn map_stream_item<R>(
        target: &StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin,
    {
        let payload = match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                StreamEventPayload::Delta(text.text)
            }
            // Reasoning and tool traffic has no place in the transcript.
            _ => return None,
        };

        Some(StreamEventMapped::new(target.clone(), payload))
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        model_id: String,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target.clone();
        let opened = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(target = ?target, "provider stream cancelled before opening");
                return;
            }
            opened = Self::open_stream(&config, &model_id, &request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    provider_id = %config.provider_id,
                    model_id = %model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Stop upstream IO promptly.
                    tracing::debug!(target = ?target, "provider stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(&target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, target, error);
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = event_tx.send(StreamEventMapped::new(
            target,
            StreamEventPayload::Done {
                honored: EnrichmentFlags::default(),
            },
        ));
    }
}

impl CompletionService for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            request.has_prompt(),
            EmptyPromptSnafu {
                stage: "stream-chat",
                target: request.target.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target.clone());
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            self.model_id().to_string(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Attachment;
    use crate::stream::StreamGeneration;
    use counsel_storage::{AnalysisMode, FileRef, SessionId};

    fn request(text: &str) -> StreamRequest {
        StreamRequest::new(
            StreamTarget::new(SessionId::parse("s").unwrap(), StreamGeneration::new(1)),
            vec![
                ProviderMessage::new(MessageRole::System, "Cite jurisdictions."),
                ProviderMessage::new(MessageRole::User, "Hello"),
            ],
            text,
        )
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let error = RigProviderAdapter::new(ProviderConfig::new("openai", " ", ""))
            .err()
            .unwrap();
        assert!(matches!(error, ProviderError::MissingApiKey { .. }));
    }

    #[test]
    fn model_defaults_unless_configured() {
        let adapter = RigProviderAdapter::new(ProviderConfig::new("openai", "k", "")).unwrap();
        assert_eq!(adapter.model_id(), DEFAULT_OPENAI_MODEL);

        let adapter =
            RigProviderAdapter::new(ProviderConfig::new("openai", "k", "").with_model("gpt-4.1"))
                .unwrap();
        assert_eq!(adapter.model_id(), "gpt-4.1");
    }

    #[test]
    fn system_turns_fold_into_default_preamble() {
        assert_eq!(
            RigProviderAdapter::merged_preamble(&request("Hi")),
            format!("{DEFAULT_PREAMBLE}\n\nCite jurisdictions.")
        );
    }

    #[test]
    fn attachments_are_described_in_the_prompt() {
        let request = request("Summarize these").with_attachments(vec![
            Attachment::new(
                FileRef::new("notes.txt", "text/plain", 5, AnalysisMode::TextOnly),
                "facts".as_bytes().to_vec(),
            ),
            Attachment::new(
                FileRef::new("scan.pdf", "application/pdf", 2048, AnalysisMode::Full),
                vec![0u8; 4],
            ),
        ]);

        assert_eq!(
            RigProviderAdapter::prompt_text(&request),
            "Summarize these\n\nContent from notes.txt:\nfacts\n\n[Attached file: scan.pdf (application/pdf, 2048 bytes)]"
        );
    }

    #[test]
    fn empty_prompt_is_rejected_before_spawning() {
        let adapter = RigProviderAdapter::new(ProviderConfig::new("openai", "k", "")).unwrap();
        let error = adapter.stream_chat(request("   ")).err().unwrap();
        assert!(matches!(error, ProviderError::EmptyPrompt { .. }));
    }
}
