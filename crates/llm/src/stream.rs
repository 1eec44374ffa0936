use counsel_storage::SessionId;
use serde::{Deserialize, Serialize};

/// Identifier for one streaming generation.
///
/// This must change on every submit so stale chunks can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamGeneration(pub u64);

impl StreamGeneration {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Stream routing key used for stale-chunk rejection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub session_id: SessionId,
    pub generation: StreamGeneration,
}

impl StreamTarget {
    pub fn new(session_id: SessionId, generation: StreamGeneration) -> Self {
        Self {
            session_id,
            generation,
        }
    }
}

/// Boolean toggles asking the backend for extra processing of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EnrichmentFlags {
    #[serde(rename = "fetchCases", default)]
    pub fetch_cases: bool,
    #[serde(rename = "fetchNews", default)]
    pub fetch_news: bool,
    #[serde(default)]
    pub summarize: bool,
}

impl EnrichmentFlags {
    pub fn any(&self) -> bool {
        self.fetch_cases || self.fetch_news || self.summarize
    }

    /// Flags that were both requested and backed by returned context.
    pub fn honored_by(&self, context: Option<&ContextBlocks>) -> Self {
        let Some(context) = context else {
            return Self::default();
        };

        Self {
            fetch_cases: self.fetch_cases && context.legal_cases.is_some(),
            fetch_news: self.fetch_news && context.news_articles.is_some(),
            summarize: self.summarize && context.summary.is_some(),
        }
    }
}

/// Supplementary content returned alongside an assistant reply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextBlocks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legal_cases: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub news_articles: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ContextBlocks {
    pub fn is_empty(&self) -> bool {
        self.legal_cases.is_none() && self.news_articles.is_none() && self.summary.is_none()
    }
}

/// Provider-agnostic stream payload mapped into chat domain language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Context(ContextBlocks),
    Done { honored: EnrichmentFlags },
    Error(String),
}

/// One stream event tagged with the generation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

impl StreamEventMapped {
    pub fn new(target: StreamTarget, payload: StreamEventPayload) -> Self {
        Self { target, payload }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            StreamEventPayload::Done { .. } | StreamEventPayload::Error(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn honored_flags_require_returned_context() {
        let requested = EnrichmentFlags {
            fetch_cases: true,
            fetch_news: true,
            summarize: false,
        };
        let context = ContextBlocks {
            legal_cases: Some("Roe v. Wade".to_string()),
            news_articles: None,
            summary: Some("short".to_string()),
        };

        let honored = requested.honored_by(Some(&context));
        assert!(honored.fetch_cases);
        assert!(!honored.fetch_news);
        assert!(!honored.summarize);
        assert_eq!(requested.honored_by(None), EnrichmentFlags::default());
    }
}
