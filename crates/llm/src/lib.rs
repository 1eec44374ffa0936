pub mod backend;
pub mod decode;
pub mod provider;
pub mod rig_adapter;
pub mod stream;

use std::sync::Arc;

pub use backend::{BACKEND_PROVIDER_ID, BackendCompletionService};
pub use provider::{
    Attachment, CompletionService, DEFAULT_RESPONSE_TIMEOUT, ProviderConfig, ProviderError,
    ProviderEventStream, ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker,
    StreamRequest, make_event_stream,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use stream::{
    ContextBlocks, EnrichmentFlags, StreamEventMapped, StreamEventPayload, StreamGeneration,
    StreamTarget,
};

/// Builds the completion service named by `config.provider_id`.
pub fn create_service(config: ProviderConfig) -> ProviderResult<Arc<dyn CompletionService>> {
    match config.provider_id.as_str() {
        BACKEND_PROVIDER_ID => Ok(Arc::new(BackendCompletionService::new(config)?)),
        RIG_OPENAI_PROVIDER_ID | "rig-openai" => Ok(Arc::new(RigProviderAdapter::new(config)?)),
        _ => provider::UnsupportedProviderSnafu {
            stage: "create-service",
            provider_id: config.provider_id,
        }
        .fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn services_are_selected_by_provider_id() {
        let backend =
            create_service(ProviderConfig::new("backend", "", "http://localhost:8081")).unwrap();
        assert_eq!(backend.id(), "backend");

        let openai = create_service(ProviderConfig::new("rig-openai", "sk-test", "")).unwrap();
        assert_eq!(openai.name(), "Rig OpenAI");

        let error = create_service(ProviderConfig::new("gemini", "", ""))
            .err()
            .unwrap();
        assert!(matches!(error, ProviderError::UnsupportedProvider { .. }));
    }
}
