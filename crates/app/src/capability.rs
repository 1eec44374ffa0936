//! Host capabilities the chat core talks to but does not implement: speech
//! capture, speech output and the clipboard.

use std::pin::Pin;
use std::sync::Mutex;

use futures::{Stream, StreamExt};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CapabilityError {
    #[snafu(display("{capability} is not available on this host"))]
    Unavailable {
        stage: &'static str,
        capability: &'static str,
    },
    #[snafu(display("{capability} rejected the request on `{stage}`: {details}"))]
    Rejected {
        stage: &'static str,
        capability: &'static str,
        details: String,
    },
}

pub type CapabilityResult<T> = Result<T, CapabilityError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFragment {
    pub text: String,
    pub is_final: bool,
}

impl TranscriptFragment {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = TranscriptFragment> + Send>>;

pub trait SpeechRecognizer: Send + Sync {
    /// Starts one capture; the stream ends when the recognizer stops listening.
    fn start_capture(&self) -> CapabilityResult<FragmentStream>;
}

pub trait SpeechSynthesizer: Send + Sync {
    /// Fire-and-forget.
    fn speak(&self, text: &str);
}

pub trait Clipboard: Send + Sync {
    fn write_text(&self, text: &str) -> CapabilityResult<()>;
}

/// Appends the final fragments to the current draft. Interim fragments are
/// previews and never reach the draft.
pub fn fold_transcript<'a>(
    draft: &str,
    fragments: impl IntoIterator<Item = &'a TranscriptFragment>,
) -> String {
    let spoken = fragments
        .into_iter()
        .filter(|fragment| fragment.is_final)
        .map(|fragment| fragment.text.as_str())
        .collect::<String>();
    let spoken = spoken.trim();

    match (draft.trim_end(), spoken) {
        (draft, "") => draft.to_string(),
        ("", spoken) => spoken.to_string(),
        (draft, spoken) => format!("{draft} {spoken}"),
    }
}

/// Runs one capture to completion and folds it into `draft`.
pub async fn dictate(recognizer: &dyn SpeechRecognizer, draft: &str) -> CapabilityResult<String> {
    let fragments = recognizer.start_capture()?.collect::<Vec<_>>().await;
    tracing::debug!(fragment_count = fragments.len(), "speech capture finished");
    Ok(fold_transcript(draft, &fragments))
}

/// Clipboard kept in process memory, for hosts without a system clipboard.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    contents: Mutex<Option<String>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Option<String> {
        self.contents
            .lock()
            .map(|contents| contents.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Clipboard for MemoryClipboard {
    fn write_text(&self, text: &str) -> CapabilityResult<()> {
        let mut contents = self
            .contents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *contents = Some(text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedRecognizer(Vec<TranscriptFragment>);

    impl SpeechRecognizer for ScriptedRecognizer {
        fn start_capture(&self) -> CapabilityResult<FragmentStream> {
            Ok(Box::pin(futures::stream::iter(self.0.clone())))
        }
    }

    struct MissingRecognizer;

    impl SpeechRecognizer for MissingRecognizer {
        fn start_capture(&self) -> CapabilityResult<FragmentStream> {
            UnavailableSnafu {
                stage: "start-capture",
                capability: "speech recognition",
            }
            .fail()
        }
    }

    #[test]
    fn only_final_fragments_reach_the_draft() {
        let fragments = [
            TranscriptFragment::interim("what is"),
            TranscriptFragment::final_text("what is adverse "),
            TranscriptFragment::final_text("possession "),
        ];

        assert_eq!(
            fold_transcript("Question:", &fragments),
            "Question: what is adverse possession"
        );
        assert_eq!(fold_transcript("", &fragments[..1]), "");
    }

    #[tokio::test]
    async fn dictation_folds_a_whole_capture() {
        let recognizer = ScriptedRecognizer(vec![
            TranscriptFragment::interim("hel"),
            TranscriptFragment::final_text("hello counsel"),
        ]);

        assert_eq!(dictate(&recognizer, "").await.unwrap(), "hello counsel");
        assert!(matches!(
            dictate(&MissingRecognizer, "draft").await,
            Err(CapabilityError::Unavailable { .. })
        ));
    }

    #[test]
    fn memory_clipboard_keeps_the_last_text() {
        let clipboard = MemoryClipboard::new();
        clipboard.write_text("first").unwrap();
        clipboard.write_text("second").unwrap();
        assert_eq!(clipboard.contents().as_deref(), Some("second"));
    }
}
