//! Kill handler
//!
//! Cancels a running build and streams progress while the pipeline tears
//! the build down.

use axum::{
    extract::{Path, State},
    response::Response,
};
use tracing::debug;

use super::AppState;
use super::stream::{ChannelSink, Envelope};
use crate::logmux::{LineSink, SinkError};

/// POST /builds/{id}/kill
/// `id` may be a unique prefix of the build id
pub async fn kill_build(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let (mut sink, response) = ChannelSink::ndjson(8);
    tokio::spawn(async move {
        if let Err(e) = run_kill(&state, &id, &mut sink).await {
            debug!(build_id = %id, "Kill stream ended early: {}", e);
        }
    });
    response
}

async fn run_kill(state: &AppState, id: &str, sink: &mut ChannelSink) -> Result<(), SinkError> {
    sink.send(Envelope::line(format!("Checking active builds for {}...", id)))
        .await?;

    let ctx = match state.valet.kill(id) {
        Ok(ctx) => ctx,
        Err(e) => {
            sink.send_error(&e.to_string()).await?;
            return sink.close().await;
        }
    };
    let build_id = ctx.build_id().to_string();

    sink.send(Envelope::line(format!(
        "An active build was found for {}, attempting to cancel...",
        build_id
    )))
    .await?;
    sink.send(Envelope::line("Performing build cleanup...")).await?;

    match tokio::time::timeout(state.kill_wait, ctx.wait_done()).await {
        Ok(()) => {
            sink.send(Envelope::line(format!(
                "Successfully killed build for {}",
                build_id
            )))
            .await?
        }
        Err(_) => {
            sink.send_error(&format!(
                "build {} was cancelled but cleanup did not finish within {}s",
                build_id,
                state.kill_wait.as_secs()
            ))
            .await?
        }
    }

    sink.close().await
}
