//! HTTP 接口
//!
//! - `POST /api/presentations/:id/chat`：一轮对话，响应体为叙述 + 哨兵 + 最终文档的纯文本流
//! - `POST /api/slides/parse`：服务端拆页与双通道解析
//! - `GET /api/health`、`GET /api/metrics`

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream;
use serde::{Deserialize, Serialize};

use crate::core::ShutdownManager;
use crate::observability::Metrics;
use crate::slides::{extract_title, LineClassifier, ParsedSlide};
use crate::turn::{TurnExecutor, TurnRequest, TurnSink};

pub struct AppState {
    pub executor: Arc<TurnExecutor>,
    pub classifier: LineClassifier,
    pub shutdown: ShutdownManager,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/presentations/:id/chat", post(api_chat))
        .route("/api/slides/parse", post(api_parse_slides))
        .route("/api/health", get(|| async { "OK" }))
        .route("/api/metrics", get(api_metrics))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub current_content: Option<String>,
}

/// 只取最后一条消息；轮次在独立任务中运行，客户端断开不影响它跑完
async fn api_chat(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, (StatusCode, String)> {
    let user_message = req
        .messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default();
    if user_message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message is required".to_string()));
    }
    if state.shutdown.is_shutdown() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "server is shutting down".to_string(),
        ));
    }

    let request = TurnRequest {
        document_id,
        user_message,
        current_content: req.current_content.unwrap_or_default(),
    };
    tracing::info!(
        document_id = %request.document_id,
        first_message = request.is_first_message(),
        "chat turn accepted"
    );

    let (sink, rx) = TurnSink::channel();
    let guard = state.shutdown.begin_turn();
    let executor = Arc::clone(&state.executor);
    tokio::spawn(async move {
        let _guard = guard;
        executor.run_turn(request, sink).await;
    });

    type BoxErr = Box<dyn std::error::Error + Send + Sync>;
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<Bytes, BoxErr>(Bytes::from(event.encode())), rx))
    });
    let mut res = Response::new(Body::from_stream(stream));
    let headers = res.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(res)
}

#[derive(Debug, Deserialize)]
pub struct ParseRequest {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ParseResponse {
    pub title: String,
    pub slides: Vec<ParsedSlide>,
}

async fn api_parse_slides(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ParseRequest>,
) -> Json<ParseResponse> {
    Json(ParseResponse {
        title: extract_title(&req.content),
        slides: state.classifier.parse_document(&req.content),
    })
}

async fn api_metrics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut value = Metrics::global().to_json();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("turns_in_flight".into(), state.shutdown.in_flight().into());
        obj.insert(
            "continuity".into(),
            state.executor.continuity_name().into(),
        );
    }
    Json(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::environment::{MockAgentScript, MockEnvironmentProvider, ReferenceFiles};
    use crate::protocol::split_response;
    use crate::store::MemoryKvStore;
    use crate::turn::build_executor;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(script: MockAgentScript) -> Router {
        let executor = build_executor(
            &AppConfig::default(),
            Arc::new(MemoryKvStore::new()),
            Arc::new(MockEnvironmentProvider::new(script)),
            ReferenceFiles::bundled(),
        );
        router(Arc::new(AppState {
            executor: Arc::new(executor),
            classifier: LineClassifier::default(),
            shutdown: ShutdownManager::new(),
        }))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(res: Response) -> String {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_chat_streams_narration_then_final_content() {
        let app = app(MockAgentScript {
            lines: vec![
                r#"{"type":"assistant","message":{"content":[{"text":"Hello "}]}}"#.into(),
                r#"{"type":"assistant","message":{"content":[{"text":"world"}]}}"#.into(),
                r#"{"type":"result","duration_ms":12,"session_id":"sess-1"}"#.into(),
            ],
            document_after: Some("# Tides\n---\n# Moon".into()),
            ..Default::default()
        });
        let res = app
            .oneshot(post_json(
                "/api/presentations/deck-1/chat",
                serde_json::json!({
                    "messages": [{"role": "user", "content": "A deck about tides"}],
                    "currentContent": ""
                }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(res.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");

        let body = body_string(res).await;
        let split = split_response(&body);
        assert!(split.narration.starts_with("[Creating secure environment...]"));
        assert!(split.narration.ends_with("[Running AI agent...]\n\nHello world"));
        assert_eq!(split.final_content, Some("# Tides\n---\n# Moon"));
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_last_message() {
        let res = app(MockAgentScript::default())
            .oneshot(post_json(
                "/api/presentations/deck-1/chat",
                serde_json::json!({
                    "messages": [{"role": "user", "content": "hi"}, {"role": "user", "content": "  "}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_parse_slides() {
        let res = app(MockAgentScript::default())
            .oneshot(post_json(
                "/api/slides/parse",
                serde_json::json!({ "content": "# Deck\n\tShown\nSpoken\n---\n# Two" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&body_string(res).await).unwrap();
        assert_eq!(value["title"], "Deck");
        assert_eq!(value["slides"][0]["visible"], "# Deck\nShown");
        assert_eq!(value["slides"][0]["notes"], "Spoken");
        assert_eq!(value["slides"][1]["visible"], "# Two");
    }

    #[tokio::test]
    async fn test_health() {
        let res = app(MockAgentScript::default())
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_string(res).await, "OK");
    }
}
