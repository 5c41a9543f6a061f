//! WebSocket listener using tokio-tungstenite.
//!
//! One binary frame carries one CBOR-encoded message.

use futures_util::{SinkExt, StreamExt};
use shellroom_core::{encode_message, Message, RoomError, RoomResult, MAX_MESSAGE_SIZE};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// An accepted, upgraded client connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Bind and start accepting. Returns the bound address (useful with port 0)
/// and a receiver of upgraded connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> RoomResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RoomError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| RoomError::Transport(format!("WS local address: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
            if tx.is_closed() {
                debug!("connection receiver dropped, listener stopping");
                break;
            }
        }
    });

    Ok((local_addr, rx))
}

/// Send a binary frame.
pub async fn ws_send_binary(ws: &mut WebSocketStream<TcpStream>, data: &[u8]) -> RoomResult<()> {
    ws.send(WsMessage::Binary(data.to_vec()))
        .await
        .map_err(|e| RoomError::Transport(format!("WS send failed: {e}")))
}

/// Encode and send one protocol message.
pub async fn ws_send_message(
    ws: &mut WebSocketStream<TcpStream>,
    message: &Message,
) -> RoomResult<()> {
    let frame = encode_message(message)?;
    ws_send_binary(ws, &frame).await
}

/// Receive the next binary frame.
///
/// Returns `None` once the peer closes. Pings are answered, text frames
/// are ignored and frames over 1 MiB are rejected.
pub async fn ws_recv_binary(ws: &mut WebSocketStream<TcpStream>) -> RoomResult<Option<Vec<u8>>> {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Binary(data))) => {
                if data.len() > MAX_MESSAGE_SIZE {
                    return Err(RoomError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {MAX_MESSAGE_SIZE})",
                        data.len()
                    )));
                }
                return Ok(Some(data.to_vec()));
            }
            Some(Ok(WsMessage::Close(_))) => return Ok(None),
            Some(Ok(WsMessage::Ping(payload))) => {
                let _ = ws.send(WsMessage::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(RoomError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
