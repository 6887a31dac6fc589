//! Message-framed duplex transport
//!
//! The connection pumps only see [`FrameReader`] and [`FrameWriter`]; the
//! WebSocket upgrade (and its origin check) happens before a transport is
//! handed over.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::{Error, Result};
use tracing::debug;

/// Read half of a transport
#[async_trait]
pub trait FrameReader: Send {
    /// Next frame, or `None` once the peer has closed
    async fn read_frame(&mut self) -> Result<Option<Bytes>>;
}

/// Write half of a transport
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: Bytes) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Split an upgraded WebSocket into reader and writer halves
pub fn split_websocket(socket: WebSocket) -> (WsReader, WsWriter) {
    let (sink, stream) = socket.split();
    (WsReader { stream }, WsWriter { sink })
}

pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Peer sent close frame");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(Error::Transport(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

pub struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        // JSON events go out as text frames; anything else is relayed as binary
        let message = match String::from_utf8(frame.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.sink.send(Message::Close(None)).await;
        self.sink
            .close()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}
