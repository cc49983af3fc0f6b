//! Log streaming handlers
//!
//! Both transports run the same pump; only the sink differs.

use axum::{
    extract::{Path, State, ws::WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::AppState;
use super::stream::{ChannelSink, WsSink};
use crate::logmux::{LineSink, PumpError, pump};

const STREAM_BUFFER: usize = 64;

/// GET /builds/{id}/logs
/// Stream build output as newline-delimited JSON
pub async fn stream_logs(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let (mut sink, response) = ChannelSink::ndjson(STREAM_BUFFER);
    tokio::spawn(async move { run_pump(&state, &id, &mut sink).await });
    response
}

/// GET /builds/{id}/logs/ws
/// Stream build output over a WebSocket
pub async fn stream_logs_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let mut sink = WsSink::new(socket);
        run_pump(&state, &id, &mut sink).await;
    })
}

async fn run_pump(state: &AppState, build_id: &str, sink: &mut dyn LineSink) {
    match pump(&state.mux, state.results.as_ref(), build_id, sink).await {
        Ok(lines) => debug!(build_id, lines, "Log stream finished"),
        Err(PumpError::CancelledByConsumer) => debug!(build_id, "Log viewer disconnected"),
        Err(e) => warn!(build_id, "Log stream failed: {}", e),
    }
}
