//! Streaming response plumbing shared by the log and kill endpoints
//!
//! Every message is a JSON envelope `{"type": "line"|"error"|"close", "data": ...}`.
//! Over HTTP the envelopes are written as newline-delimited JSON; over a
//! WebSocket each one is a text frame.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ws::{Message, WebSocket},
    http::header,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::logmux::{LineSink, SinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Line,
    Error,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub data: String,
}

impl Envelope {
    pub fn line(data: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Line,
            data: data.into(),
        }
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Error,
            data: data.into(),
        }
    }

    pub fn close() -> Self {
        Self {
            kind: EnvelopeKind::Close,
            data: String::new(),
        }
    }

    fn to_json(&self) -> Result<String, SinkError> {
        serde_json::to_string(self).map_err(|e| SinkError::Transport(e.to_string()))
    }
}

type Chunk = Result<String, io::Error>;

/// Sink feeding a chunked NDJSON response body
pub struct ChannelSink {
    tx: mpsc::Sender<Chunk>,
}

impl ChannelSink {
    /// Creates the sink and the response that drains it
    pub fn ndjson(buffer: usize) -> (Self, Response) {
        let (tx, rx) = mpsc::channel(buffer);
        let body = Body::from_stream(ReceiverStream::new(rx));
        let response = ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response();
        (Self { tx }, response)
    }

    pub async fn send(&mut self, envelope: Envelope) -> Result<(), SinkError> {
        let mut json = envelope.to_json()?;
        json.push('\n');
        // The receiver is dropped when the client goes away
        self.tx
            .send(Ok(json))
            .await
            .map_err(|_| SinkError::Disconnected)
    }
}

#[async_trait]
impl LineSink for ChannelSink {
    async fn send_line(&mut self, line: &[u8]) -> Result<(), SinkError> {
        self.send(Envelope::line(String::from_utf8_lossy(line))).await
    }

    async fn send_error(&mut self, message: &str) -> Result<(), SinkError> {
        self.send(Envelope::error(message)).await
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.send(Envelope::close()).await
    }
}

/// Sink writing envelopes as WebSocket text frames
///
/// Incoming frames are drained in the background so the socket notices when
/// the viewer closes it.
pub struct WsSink {
    tx: SplitSink<WebSocket, Message>,
}

impl WsSink {
    pub fn new(socket: WebSocket) -> Self {
        let (tx, mut rx) = socket.split();
        tokio::spawn(async move { while let Some(Ok(_)) = rx.next().await {} });
        Self { tx }
    }

    async fn send(&mut self, envelope: Envelope) -> Result<(), SinkError> {
        let json = envelope.to_json()?;
        self.tx
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| SinkError::Disconnected)
    }
}

#[async_trait]
impl LineSink for WsSink {
    async fn send_line(&mut self, line: &[u8]) -> Result<(), SinkError> {
        self.send(Envelope::line(String::from_utf8_lossy(line))).await
    }

    async fn send_error(&mut self, message: &str) -> Result<(), SinkError> {
        self.send(Envelope::error(message)).await
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.send(Envelope::close()).await?;
        self.tx
            .send(Message::Close(None))
            .await
            .map_err(|_| SinkError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_format() {
        let json = serde_json::to_string(&Envelope::line("BUILD | ok")).unwrap();
        assert_eq!(json, r#"{"type":"line","data":"BUILD | ok"}"#);

        let json = serde_json::to_string(&Envelope::close()).unwrap();
        assert_eq!(json, r#"{"type":"close","data":""}"#);
    }

    #[tokio::test]
    async fn test_dropped_response_disconnects_sink() {
        let (mut sink, response) = ChannelSink::ndjson(1);
        drop(response);
        assert!(matches!(
            sink.send_line(b"hello").await,
            Err(SinkError::Disconnected)
        ));
    }
}
