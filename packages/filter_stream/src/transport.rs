//! The duplex transport underneath the shared connection.
//!
//! [`Transport`] opens one connection per target URL; [`TransportConnection`]
//! yields inbound text frames until the remote side goes away. The production
//! implementation is a WebSocket client.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{Result, StreamError};

/// Opens connections to a target URL.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Resolves once the transport reports "open", or fails if it errors first.
    async fn open(&self, url: &str) -> Result<Box<dyn TransportConnection>>;
}

/// One open transport.
#[async_trait]
pub trait TransportConnection: Send {
    /// Next inbound text frame.
    ///
    /// `None` means the remote side closed the connection; `Some(Err(_))`
    /// means the transport failed. Either ends the connection.
    async fn next_frame(&mut self) -> Option<Result<String>>;

    /// Close the connection from our side.
    async fn close(&mut self);
}

/// WebSocket transport built on `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn TransportConnection>> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(StreamError::from_tungstenite)?;
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportConnection for WsConnection {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "websocket closed by server");
                    return None;
                }
                // Ping/pong are answered by tungstenite; binary frames are not part of the protocol.
                Ok(_) => continue,
                Err(e) => return Some(Err(StreamError::from_tungstenite(e))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "websocket close failed");
        }
    }
}
