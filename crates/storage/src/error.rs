use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("session '{id}' was not found"))]
    NotFound { stage: &'static str, id: String },
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
    #[snafu(display("invalid session store input on `{stage}`: {details}"))]
    InvalidInput {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to build session store http client"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("session store request failed on `{stage}`: {source}"))]
    HttpRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("session store returned status {status} on `{stage}`: {body}"))]
    HttpStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode session store payload on `{stage}`: {source}"))]
    DecodePayload {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("session store does not support `{operation}`"))]
    Unsupported {
        stage: &'static str,
        operation: &'static str,
    },
    #[snafu(display("failed to create local state directory at {path}"))]
    CreateStateDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to read local state from {path}"))]
    ReadLocalState {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write local state to {path}"))]
    WriteLocalState {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to encode local state for {path}"))]
    EncodeLocalState {
        stage: &'static str,
        path: String,
        source: serde_json::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
