//! HTTP ingress: `POST /v1/messages`, translating between the Anthropic
//! wire shape this binary exposes and the account-pool domain crate.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use pool_proxy::anthropic::{ErrorResponse, MessagesRequest};
use pool_proxy::handlers::{HandlerResult, MessageHandler, StreamingHandler};
use pool_proxy::pool::Outcome;
use pool_proxy::sse::SseStreamer;
use pool_proxy::wire::StreamChunk;
use tracing::{error, info, warn};

use crate::app::AppContext;

/// Build the router this binary serves.
pub fn router(state: AppContext) -> Router {
    Router::new().route("/v1/messages", post(messages)).with_state(state)
}

async fn messages(State(ctx): State<AppContext>, headers: HeaderMap, Json(request): Json<MessagesRequest>) -> Response {
    let anthropic_version = headers.get("anthropic-version").and_then(|v| v.to_str().ok()).unwrap_or("unknown");
    info!(model = %request.model, stream = request.stream, version = anthropic_version, "received /v1/messages");

    if request.stream {
        stream_messages(ctx, request).await
    } else {
        let handler = MessageHandler::new(&ctx.pool, &ctx.generation, &ctx.config, ctx.fallback_model.as_deref());
        match handler.handle(&request).await {
            HandlerResult::Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
            HandlerResult::Err(err) => (StatusCode::BAD_GATEWAY, Json(err)).into_response(),
        }
    }
}

async fn stream_messages(ctx: AppContext, request: MessagesRequest) -> Response {
    let model = request.model.clone();
    let streaming = StreamingHandler::new(&ctx.pool, &ctx.generation, &ctx.config, ctx.fallback_model.as_deref());

    match streaming.open_with_fallback(&request, &model).await {
        Ok((plan, streamer, resp)) => {
            ctx.pool.record_outcome(&plan, Outcome::Success, chrono::Utc::now()).await;
            let start_frame = Bytes::from(streamer.message_start().into_frame());
            let rest = chunked_event_stream(streamer, resp);
            let body = Body::from_stream(futures_util::stream::once(async move { Ok::<_, std::convert::Infallible>(start_frame) }).chain(rest));
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .header("cache-control", "no-cache")
                .body(body)
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "stream setup failed").into_response())
        }
        Err(e) => {
            warn!(error = %e, "failed to open upstream stream before any bytes were sent");
            let err = ErrorResponse::new(e.kind(), e.to_string());
            (StatusCode::BAD_GATEWAY, Json(err)).into_response()
        }
    }
}

/// Pull newline-delimited JSON chunks off the upstream response body and
/// translate each into SSE frames, finishing with the canonical terminal
/// sequence (or the synthetic `"error"` sequence on mid-stream failure).
fn chunked_event_stream(
    mut streamer: SseStreamer,
    resp: reqwest::Response,
) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> + Send + 'static {
    async_stream::stream! {
        let mut byte_stream = resp.bytes_stream();
        let mut buffer = Vec::new();
        let mut sent_any = false;
        let mut aborted = false;

        loop {
            match byte_stream.next().await {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        let text = String::from_utf8_lossy(&line);
                        let trimmed = text.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        if let Ok(chunk) = serde_json::from_str::<StreamChunk>(trimmed) {
                            for event in streamer.on_chunk(&chunk) {
                                sent_any = true;
                                yield Ok(Bytes::from(event.into_frame()));
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "upstream stream read error");
                    aborted = true;
                    break;
                }
                None => break,
            }
        }

        let terminal = if aborted && sent_any { streamer.abort() } else { streamer.finish(Some("end_turn".to_string())) };
        for event in terminal {
            yield Ok(Bytes::from(event.into_frame()));
        }
    }
}
