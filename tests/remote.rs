//! HTTP speech endpoint client tests
//!
//! Runs against an in-process axum server on an ephemeral port

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};

use beacon_talk::config::RemoteConfig;
use beacon_talk::{Error, ErrorKind, HttpVoiceClient, RemoteVoiceClient};

mod common;

/// One multipart field as the server saw it
#[derive(Debug, Clone)]
struct SeenField {
    name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    data: Vec<u8>,
}

type Seen = Arc<Mutex<Vec<SeenField>>>;

async fn process(State(seen): State<Seen>, mut multipart: Multipart) -> impl IntoResponse {
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(ToString::to_string);
        let content_type = field.content_type().map(ToString::to_string);
        let data = field.bytes().await.unwrap().to_vec();
        seen.lock().unwrap().push(SeenField {
            name,
            file_name,
            content_type,
            data,
        });
    }

    (
        [(header::CONTENT_TYPE, "audio/mpeg; charset=binary")],
        b"spoken reply".to_vec(),
    )
}

async fn offline() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "model offline")
}

async fn welcome() -> Response {
    // No content type on purpose
    Response::new(Body::from(common::wav_bytes(32)))
}

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn client_for(addr: SocketAddr) -> HttpVoiceClient {
    HttpVoiceClient::new(&RemoteConfig {
        base_url: format!("http://{addr}"),
        ..RemoteConfig::default()
    })
}

#[tokio::test]
async fn test_submit_sends_file_field() {
    let seen: Seen = Arc::default();
    let router = Router::new()
        .route("/api/v1/voice/process", post(process))
        .with_state(seen.clone());
    let client = client_for(serve(router).await);

    let reply = client
        .submit(b"utterance-bytes".to_vec(), "audio/wav")
        .await
        .unwrap();

    assert_eq!(reply.data, b"spoken reply");
    assert_eq!(reply.mime, "audio/mpeg");

    let fields = seen.lock().unwrap().clone();
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].name, "file");
    assert_eq!(fields[0].file_name.as_deref(), Some("utterance.wav"));
    assert_eq!(fields[0].content_type.as_deref(), Some("audio/wav"));
    assert_eq!(fields[0].data, b"utterance-bytes");
}

#[tokio::test]
async fn test_submit_keeps_container_tag() {
    let seen: Seen = Arc::default();
    let router = Router::new()
        .route("/api/v1/voice/process", post(process))
        .with_state(seen.clone());
    let client = client_for(serve(router).await);

    client.submit(vec![1, 2, 3], "audio/webm").await.unwrap();

    let fields = seen.lock().unwrap().clone();
    assert_eq!(fields[0].file_name.as_deref(), Some("utterance.webm"));
    assert_eq!(fields[0].content_type.as_deref(), Some("audio/webm"));
}

#[tokio::test]
async fn test_submit_server_error() {
    let router = Router::new().route("/api/v1/voice/process", post(offline));
    let client = client_for(serve(router).await);

    let err = client.submit(vec![0; 16], "audio/wav").await.unwrap_err();
    match err {
        Error::RemoteProcessing { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "model offline");
        }
        other => panic!("expected remote processing error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_welcome_defaults_to_wav() {
    let router = Router::new().route("/api/v1/voice/welcome", get(welcome));
    let client = client_for(serve(router).await);

    let prompt = client.fetch_welcome_prompt().await.unwrap();
    assert_eq!(prompt.mime, "audio/wav");
    assert_eq!(prompt.data, common::wav_bytes(32));
}

#[tokio::test]
async fn test_welcome_missing() {
    let client = client_for(serve(Router::new()).await);

    let err = client.fetch_welcome_prompt().await.unwrap_err();
    assert!(matches!(err, Error::RemoteProcessing { status: 404, .. }));
    assert_eq!(err.kind(), ErrorKind::RemoteProcessing);
}

#[tokio::test]
async fn test_unreachable_endpoint() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client_for(addr)
        .submit(vec![0; 4], "audio/wav")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Http(_)));
    assert_eq!(err.kind(), ErrorKind::Other);
}
