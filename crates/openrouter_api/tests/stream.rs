use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use openrouter_api::{
    ChatCompletionRequest, ChatStreamEvent, OpenRouterClient, OpenRouterConfig, OpenRouterError,
};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

#[derive(Clone)]
struct ResponseChunk {
    delay_ms: u64,
    bytes: Vec<u8>,
}

#[derive(Clone)]
struct ScriptedResponse {
    status: u16,
    content_type: &'static str,
    chunks: Vec<ResponseChunk>,
}

struct ScriptedServer {
    base_url: String,
    request_count: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
    handle: JoinHandle<()>,
}

impl ScriptedServer {
    async fn new(scripts: Vec<ScriptedResponse>) -> Self {
        let scripts = Arc::new(scripts);
        let request_count = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("local TCP listener should bind");
        let addr = listener
            .local_addr()
            .expect("resolved local listener address");
        let base_url = format!("http://{addr}/v1");

        let handle = tokio::spawn({
            let scripts = Arc::clone(&scripts);
            let request_count = Arc::clone(&request_count);
            let bodies = Arc::clone(&bodies);

            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let scripts = Arc::clone(&scripts);
                    let request_count = Arc::clone(&request_count);
                    let bodies = Arc::clone(&bodies);
                    tokio::spawn(async move {
                        serve_one(socket, scripts, request_count, bodies).await;
                    });
                }
            }
        });

        Self {
            base_url,
            request_count,
            bodies,
            handle,
        }
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Acquire)
    }

    fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().expect("bodies lock").clone()
    }

    fn shutdown(&self) {
        self.handle.abort();
    }
}

fn response_sse(status: u16, frames: &[&str]) -> ScriptedResponse {
    ScriptedResponse {
        status,
        content_type: "text/event-stream",
        chunks: vec![ResponseChunk {
            delay_ms: 0,
            bytes: sse_frames(frames),
        }],
    }
}

fn response_json(status: u16, body: &str) -> ScriptedResponse {
    ScriptedResponse {
        status,
        content_type: "application/json",
        chunks: vec![ResponseChunk {
            delay_ms: 0,
            bytes: body.as_bytes().to_vec(),
        }],
    }
}

fn sse_frames(frames: &[&str]) -> Vec<u8> {
    let mut body = String::new();
    for frame in frames {
        body.push_str("data: ");
        body.push_str(frame);
        body.push_str("\n\n");
    }
    body.into_bytes()
}

fn request() -> ChatCompletionRequest {
    ChatCompletionRequest::new(
        "anthropic/claude-sonnet-4",
        vec![json!({"role": "user", "content": "zoom in"})],
    )
}

fn client(server: &ScriptedServer) -> OpenRouterClient {
    OpenRouterClient::new(OpenRouterConfig::new("sk-test").with_base_url(&server.base_url))
        .expect("client")
}

#[tokio::test]
async fn stream_delivers_deltas_and_finish_reason() {
    let server = ScriptedServer::new(vec![response_sse(
        200,
        &[
            r#"{"choices":[{"delta":{"content":"hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ],
    )])
    .await;

    let result = client(&server)
        .stream(&request(), None)
        .await
        .expect("stream should succeed");

    let text = result
        .events
        .iter()
        .filter_map(|event| match event {
            ChatStreamEvent::TextDelta { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect::<String>();
    assert_eq!(text, "hello");
    assert_eq!(result.finish_reason.as_deref(), Some("stop"));
    assert_eq!(server.bodies()[0]["model"], "anthropic/claude-sonnet-4");
    assert_eq!(server.bodies()[0]["stream"], true);

    server.shutdown();
}

#[tokio::test]
async fn stream_retries_transient_status_then_succeeds() {
    let server = ScriptedServer::new(vec![
        response_json(503, r#"{"error":{"message":"overloaded"}}"#),
        response_sse(200, &[r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#]),
    ])
    .await;

    let result = timeout(Duration::from_secs(12), client(&server).stream(&request(), None))
        .await
        .expect("retry path should be bounded")
        .expect("stream should eventually succeed");

    assert_eq!(result.finish_reason.as_deref(), Some("stop"));
    assert_eq!(server.request_count(), 2);

    server.shutdown();
}

#[tokio::test]
async fn stream_fails_fast_on_auth_errors() {
    let server = ScriptedServer::new(vec![response_json(
        401,
        r#"{"error":{"message":"No auth credentials found","code":401}}"#,
    )])
    .await;

    let error = client(&server)
        .stream(&request(), None)
        .await
        .expect_err("401 must fail");

    assert_eq!(error.status(), Some(StatusCode::UNAUTHORIZED));
    assert!(error.to_string().contains("No auth credentials found"));
    assert_eq!(server.request_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn stream_surfaces_mid_stream_errors() {
    let server = ScriptedServer::new(vec![response_sse(
        200,
        &[
            r#"{"choices":[{"delta":{"content":"partial"}}]}"#,
            r#"{"error":{"code":"server_error","message":"provider crashed"}}"#,
        ],
    )])
    .await;

    let mut seen = Vec::new();
    let error = client(&server)
        .stream_with_handler(&request(), None, |event| seen.push(event))
        .await
        .expect_err("error chunk must fail the stream");

    assert!(matches!(error, OpenRouterError::StreamFailed { .. }));
    assert_eq!(seen.len(), 1);

    server.shutdown();
}

#[tokio::test]
async fn stream_stops_when_cancelled_mid_stream() {
    let server = ScriptedServer::new(vec![ScriptedResponse {
        status: 200,
        content_type: "text/event-stream",
        chunks: vec![
            ResponseChunk {
                delay_ms: 0,
                bytes: sse_frames(&[r#"{"choices":[{"delta":{"content":"first"}}]}"#]),
            },
            ResponseChunk {
                delay_ms: 2_000,
                bytes: sse_frames(&[r#"{"choices":[{"delta":{"content":"late"}}]}"#]),
            },
        ],
    }])
    .await;

    let cancel = Arc::new(AtomicBool::new(false));
    let trigger = Arc::clone(&cancel);
    tokio::spawn(async move {
        sleep(Duration::from_millis(200)).await;
        trigger.store(true, Ordering::Release);
    });

    let mut seen = Vec::new();
    let error = timeout(
        Duration::from_secs(5),
        client(&server).stream_with_handler(&request(), Some(&cancel), |event| seen.push(event)),
    )
    .await
    .expect("cancellation should be prompt")
    .expect_err("cancelled stream must fail");

    assert!(matches!(error, OpenRouterError::Cancelled));
    assert!(seen.iter().all(|event| !matches!(
        event,
        ChatStreamEvent::TextDelta { delta } if delta == "late"
    )));

    server.shutdown();
}

#[tokio::test]
async fn stream_fails_when_a_frame_exceeds_the_buffer_limit() {
    let mut oversized = b"data: {\"choices\":[{\"delta\":{\"content\":\"".to_vec();
    oversized.extend(std::iter::repeat(b'a').take(4096));
    let server = ScriptedServer::new(vec![ScriptedResponse {
        status: 200,
        content_type: "text/event-stream",
        chunks: vec![ResponseChunk {
            delay_ms: 0,
            bytes: oversized,
        }],
    }])
    .await;

    let error = client(&server)
        .stream_with_buffer_limit(&request(), Some(1024), None, |_| {})
        .await
        .expect_err("an oversized frame must fail the stream");

    assert!(matches!(
        error,
        OpenRouterError::BufferOverflow { limit: 1024, .. }
    ));

    server.shutdown();
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

async fn serve_one(
    mut socket: TcpStream,
    scripts: Arc<Vec<ScriptedResponse>>,
    request_count: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
) {
    let Ok(body) = read_request(&mut socket).await else {
        return;
    };
    if let Ok(value) = serde_json::from_slice::<Value>(&body) {
        bodies.lock().expect("bodies lock").push(value);
    }

    let index = request_count.fetch_add(1, Ordering::AcqRel);
    let response = scripts
        .get(index)
        .cloned()
        .unwrap_or_else(|| response_json(500, r#"{"error":"unexpected request"}"#));

    let headers = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
        response.status,
        status_reason(response.status),
        response.content_type,
    );
    if socket.write_all(headers.as_bytes()).await.is_err() {
        return;
    }

    for chunk in response.chunks {
        if chunk.delay_ms > 0 {
            sleep(Duration::from_millis(chunk.delay_ms)).await;
        }
        let prefix = format!("{:X}\r\n", chunk.bytes.len());
        if socket.write_all(prefix.as_bytes()).await.is_err()
            || socket.write_all(&chunk.bytes).await.is_err()
            || socket.write_all(b"\r\n").await.is_err()
        {
            return;
        }
    }

    let _ = socket.write_all(b"0\r\n\r\n").await;
    let _ = socket.shutdown().await;
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut request = Vec::new();
    let mut buffer = [0_u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            return Ok(Vec::new());
        }
        request.extend_from_slice(&buffer[..n]);
        if let Some(position) = request.windows(4).position(|window| window == b"\r\n\r\n") {
            break position + 4;
        }
    };

    let head = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while request.len() < header_end + content_length {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buffer[..n]);
    }

    Ok(request[header_end..].to_vec())
}
