use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::json;

use counsel_llm::{
    Attachment, BackendCompletionService, CompletionService, ContextBlocks, EnrichmentFlags,
    ProviderConfig, ProviderMessage, StreamEventPayload, StreamGeneration, StreamRequest,
    StreamTarget,
};
use counsel_storage::{AnalysisMode, FileRef, MessageRole, SessionId, UserId};

#[derive(Default)]
struct Backend {
    fields: Mutex<Vec<HashMap<String, String>>>,
}

async fn chat(State(backend): State<Arc<Backend>>, mut multipart: Multipart) -> Response {
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(file_name) = field.file_name() {
            fields.insert(format!("{name}.filename"), file_name.to_string());
            fields.insert(
                format!("{name}.type"),
                field.content_type().unwrap_or_default().to_string(),
            );
        }
        let value = field.bytes().await.unwrap();
        fields.insert(name, String::from_utf8_lossy(&value).into_owned());
    }
    let message = fields.get("message").cloned().unwrap_or_default();
    backend.fields.lock().unwrap().push(fields);

    match message.as_str() {
        "sse" => {
            let body = "data: Hi \n\ndata: the".as_bytes();
            let tail = "re\n\ndata: ¡olé!\n\ndata: [DONE]\n\n".as_bytes();
            // Byte 11 falls inside the two-byte '¡'.
            let split = 11;
            let chunks = vec![
                Ok::<_, std::io::Error>(Bytes::copy_from_slice(body)),
                Ok(Bytes::copy_from_slice(&tail[..split])),
                Ok(Bytes::copy_from_slice(&tail[split..])),
            ];
            Response::builder()
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(Body::from_stream(futures::stream::iter(chunks)))
                .unwrap()
        }
        "plain" => {
            let chunks = vec![
                Ok::<_, std::io::Error>(Bytes::from_static(&[0xc2])),
                Ok(Bytes::from_static(&[0xa7, b' ', b'2'])),
            ];
            Response::builder()
                .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(Body::from_stream(futures::stream::iter(chunks)))
                .unwrap()
        }
        "boom" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "model unavailable" })),
        )
            .into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!({ "response": "late" })).into_response()
        }
        _ => Json(json!({
            "session_id": "s-1",
            "response": "Hi there!",
            "additional_context": { "legal_cases": "Marbury v. Madison" }
        }))
        .into_response(),
    }
}

async fn spawn_backend() -> (String, Arc<Backend>) {
    let backend = Arc::new(Backend::default());
    let app = Router::new()
        .route("/api/chat", post(chat))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{address}"), backend)
}

fn service(base_url: &str, timeout: Duration) -> BackendCompletionService {
    BackendCompletionService::new(
        ProviderConfig::new("backend", "", base_url).with_response_timeout(timeout),
    )
    .unwrap()
}

fn target() -> StreamTarget {
    StreamTarget::new(SessionId::parse("s-1").unwrap(), StreamGeneration::new(1))
}

async fn collect(service: &BackendCompletionService, request: StreamRequest) -> Vec<StreamEventPayload> {
    let handle = service.stream_chat(request).unwrap();
    tokio::spawn(handle.worker);

    let mut stream = handle.stream;
    let mut payloads = Vec::new();
    while let Some(event) = stream.recv().await {
        assert_eq!(event.target, target());
        let terminal = event.is_terminal();
        payloads.push(event.payload);
        if terminal {
            break;
        }
    }
    payloads
}

fn deltas(payloads: &[StreamEventPayload]) -> String {
    payloads
        .iter()
        .filter_map(|payload| match payload {
            StreamEventPayload::Delta(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn json_reply_carries_context_and_multipart_fields() {
    let (base_url, backend) = spawn_backend().await;
    let service = service(&base_url, Duration::from_secs(5));

    let request = StreamRequest::new(
        target(),
        vec![
            ProviderMessage::new(MessageRole::User, "earlier"),
            ProviderMessage::new(MessageRole::Assistant, "reply"),
        ],
        "Hello",
    )
    .with_user_id(UserId::parse("user-7").unwrap())
    .with_enrichment(EnrichmentFlags {
        fetch_cases: true,
        fetch_news: false,
        summarize: true,
    })
    .with_attachments(vec![Attachment::new(
        FileRef::new("brief.pdf", "application/pdf", 3, AnalysisMode::Visual),
        b"pdf".to_vec(),
    )]);

    let payloads = collect(&service, request).await;
    assert_eq!(
        payloads,
        vec![
            StreamEventPayload::Delta("Hi there!".to_string()),
            StreamEventPayload::Context(ContextBlocks {
                legal_cases: Some("Marbury v. Madison".to_string()),
                ..ContextBlocks::default()
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

    let fields = backend.fields.lock().unwrap()[0].clone();
    assert_eq!(fields["message"], "Hello");
    assert_eq!(fields["session_id"], "s-1");
    assert_eq!(fields["user_id"], "user-7");
    assert_eq!(fields["fetchCases"], "true");
    assert_eq!(fields["fetchNews"], "false");
    assert_eq!(fields["summarize"], "true");
    assert_eq!(fields["file0"], "pdf");
    assert_eq!(fields["file0.filename"], "brief.pdf");
    assert_eq!(fields["file0.type"], "application/pdf");
    assert_eq!(fields["analysisMode0"], "visual");
    assert_eq!(fields["isScanned0"], "true");
    let history: serde_json::Value = serde_json::from_str(&fields["history"]).unwrap();
    assert_eq!(
        history,
        json!([
            { "role": "user", "content": "earlier" },
            { "role": "assistant", "content": "reply" }
        ])
    );
}

#[tokio::test]
async fn event_stream_deltas_arrive_in_order() {
    let (base_url, _) = spawn_backend().await;
    let service = service(&base_url, Duration::from_secs(5));

    let payloads = collect(&service, StreamRequest::new(target(), Vec::new(), "sse")).await;

    assert_eq!(deltas(&payloads), "Hi there¡olé!");
    assert_eq!(
        payloads.last(),
        Some(&StreamEventPayload::Done {
            honored: EnrichmentFlags::default()
        })
    );
}

#[tokio::test]
async fn plain_text_body_reassembles_split_code_points() {
    let (base_url, _) = spawn_backend().await;
    let service = service(&base_url, Duration::from_secs(5));

    let payloads = collect(&service, StreamRequest::new(target(), Vec::new(), "plain")).await;

    assert_eq!(deltas(&payloads), "§ 2");
    assert!(matches!(payloads.last(), Some(StreamEventPayload::Done { .. })));
}

#[tokio::test]
async fn backend_error_body_becomes_error_event() {
    let (base_url, _) = spawn_backend().await;
    let service = service(&base_url, Duration::from_secs(5));

    let payloads = collect(&service, StreamRequest::new(target(), Vec::new(), "boom")).await;

    match payloads.as_slice() {
        [StreamEventPayload::Error(message)] => {
            assert!(message.contains("500"));
            assert!(message.contains("model unavailable"));
        }
        other => panic!("unexpected payloads: {other:?}"),
    }
}

#[tokio::test]
async fn slow_backend_times_out() {
    let (base_url, _) = spawn_backend().await;
    let service = service(&base_url, Duration::from_millis(100));

    let payloads = collect(&service, StreamRequest::new(target(), Vec::new(), "slow")).await;

    assert!(matches!(payloads.as_slice(), [StreamEventPayload::Error(_)]));
}

#[tokio::test]
async fn dropping_the_stream_stops_the_worker() {
    let (base_url, _) = spawn_backend().await;
    let service = service(&base_url, Duration::from_secs(5));

    let handle = service
        .stream_chat(StreamRequest::new(target(), Vec::new(), "slow"))
        .unwrap();
    let worker = tokio::spawn(handle.worker);
    drop(handle.stream);

    tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .unwrap()
        .unwrap();
}
