use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderName, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use docchat_relay::{
    ALL_FILES_KEY, ChatEntry, ChatError, ChatHistory, ChatOrchestrator, DocumentQuestion,
    PendingOutcome, Sender,
};
use futures::StreamExt as _;
use tracing::{debug, info, warn};

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<ChatOrchestrator>,
    history: ChatHistory,
}

impl AppState {
    pub fn new(orchestrator: ChatOrchestrator, history: ChatHistory) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            history,
        }
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    extracted_text: Option<String>,
    user_question: Option<String>,
    user_id: Option<String>,
    file_name: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/history/{user}/{file}", get(history_snapshot))
        .route("/api/history/{user}/{file}/stream", get(history_stream))
        .with_state(state)
}

/// Binds `listen` and serves until Ctrl-C.
pub async fn serve(listen: &str, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(address = %listener.local_addr()?, "docchat server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Response {
    let (Some(text), Some(question)) = (
        non_blank(request.extracted_text),
        non_blank(request.user_question),
    ) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing required parameters");
    };
    let file = non_blank(request.file_name).unwrap_or_else(|| ALL_FILES_KEY.to_string());
    let user = non_blank(request.user_id);

    if let Some(user) = &user {
        state
            .history
            .record(user, ChatEntry::new(&file, &question, Sender::User))
            .await;
    }

    let stream = match state
        .orchestrator
        .ask(DocumentQuestion::new(text, question))
        .await
    {
        Ok(stream) => stream,
        Err(ChatError::Validation(message)) => {
            debug!(%message, "chat request rejected");
            return error_response(StatusCode::BAD_REQUEST, "Missing required parameters");
        }
        Err(err) => {
            warn!(error = %err, "failed to open completion stream");
            if let Some(user) = &user {
                state
                    .history
                    .record(user, ChatEntry::new(&file, format!("Error: {err}"), Sender::Bot))
                    .await;
            }
            return error_response(StatusCode::BAD_GATEWAY, "Failed to query the completion API");
        }
    };

    let session_id = stream.session_id();
    let (relay, _abort, outcome) = stream.into_parts();
    if let Some(user) = user {
        tokio::spawn(record_answer(state.history.clone(), user, file, outcome));
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (HeaderName::from_static("x-session-id"), session_id.to_string()),
        ],
        Body::from_stream(relay),
    )
        .into_response()
}

async fn record_answer(history: ChatHistory, user: String, file: String, outcome: PendingOutcome) {
    let message = match outcome.wait().await {
        Ok(outcome) => match outcome.into_result() {
            Ok(answer) => answer,
            Err(failure) => format!("Error: {failure}"),
        },
        Err(err) => {
            warn!(error = %err, "session outcome lost");
            format!("Error: {err}")
        }
    };
    history
        .record(&user, ChatEntry::new(file, message, Sender::Bot))
        .await;
}

async fn history_snapshot(
    State(state): State<AppState>,
    Path((user, file)): Path<(String, String)>,
) -> Json<Vec<ChatEntry>> {
    Json(state.history.snapshot(&user, &file).await)
}

async fn history_stream(
    State(state): State<AppState>,
    Path((user, file)): Path<(String, String)>,
) -> impl IntoResponse {
    let stream = state
        .history
        .subscribe(&user, &file)
        .await
        .into_stream()
        .map(|entries| {
            let data = serde_json::to_string(&entries).unwrap_or_default();
            Ok::<Event, Infallible>(Event::default().event("history").data(data))
        });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
