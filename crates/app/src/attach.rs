use std::path::{Path, PathBuf};

use counsel_llm::Attachment;
use counsel_storage::{AnalysisMode, FileRef};
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AttachError {
    #[snafu(display("failed to read attachment {path:?} on `{stage}`: {source}"))]
    ReadAttachment {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("attachment path {path:?} has no file name"))]
    MissingFileName { stage: &'static str, path: PathBuf },
    #[snafu(display("unknown analysis mode `{raw}`; expected text_only, visual or full"))]
    UnknownAnalysisMode { stage: &'static str, raw: String },
}

pub type AttachResult<T> = Result<T, AttachError>;

pub fn parse_analysis_mode(raw: &str) -> AttachResult<AnalysisMode> {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "" | "text" | "text_only" => Ok(AnalysisMode::TextOnly),
        "visual" => Ok(AnalysisMode::Visual),
        "full" => Ok(AnalysisMode::Full),
        _ => UnknownAnalysisModeSnafu {
            stage: "parse-analysis-mode",
            raw: raw.to_string(),
        }
        .fail(),
    }
}

pub fn infer_mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string()
}

/// Reads a local file into an attachment for the next turn.
pub async fn load_attachment(path: &Path, analysis_mode: AnalysisMode) -> AttachResult<Attachment> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .context(MissingFileNameSnafu {
            stage: "attachment-file-name",
            path: path.to_path_buf(),
        })?;

    let content = tokio::fs::read(path).await.context(ReadAttachmentSnafu {
        stage: "read-attachment",
        path: path.to_path_buf(),
    })?;

    let file = FileRef::new(
        name,
        infer_mime_type(path),
        content.len() as u64,
        analysis_mode,
    );
    tracing::debug!(
        name = %file.name,
        mime_type = %file.mime_type,
        size_bytes = file.size_bytes,
        "loaded attachment"
    );
    Ok(Attachment::new(file, content))
}
