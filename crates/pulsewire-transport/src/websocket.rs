//! WebSocket client transport.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use pulsewire_core::{Connector, Link, LinkEvent, TransportError};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self,
        protocol::{CloseFrame, frame::coding::CloseCode},
        Message as WsMessage,
    },
};

/// Opens `ws://` and `wss://` links with tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Link>, TransportError> {
        let (stream, response) = connect_async(endpoint)
            .await
            .map_err(|e| TransportError::Handshake(describe(e)))?;
        tracing::debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsLink { stream }))
    }
}

fn describe(error: tungstenite::Error) -> String {
    match error {
        tungstenite::Error::Http(response) => match response.status().as_u16() {
            401 => "Unauthorized: endpoint rejected the credential".to_string(),
            403 => "Forbidden: access to endpoint denied".to_string(),
            code => format!("HTTP {code}"),
        },
        other => other.to_string(),
    }
}

/// An open WebSocket.
pub struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_event(&mut self) -> Option<LinkEvent> {
        loop {
            let event = match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => LinkEvent::Text(text.to_string()),
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => LinkEvent::Text(text),
                    Err(_) => {
                        tracing::warn!(len = data.len(), "Dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(WsMessage::Close(frame)) => match frame {
                    Some(f) => LinkEvent::Closed {
                        clean: f.code == CloseCode::Normal,
                        reason: format!("{} {}", u16::from(f.code), f.reason),
                    },
                    None => LinkEvent::Closed {
                        clean: false,
                        reason: "closed without status".to_string(),
                    },
                },
                // Transport-level ping/pong is answered by tungstenite itself.
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => continue,
                Err(e) => LinkEvent::Error(e.to_string()),
            };
            return Some(event);
        }
    }

    async fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            tracing::debug!(error = %e, "Error while closing WebSocket");
        }
    }
}
