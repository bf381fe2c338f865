//! WebSocket client for the room relay.

use super::{SignalMessage, SignalingChannel, CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

type WsWriter = Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>>>;

/// Open the relay connection. Frames that are not a valid envelope are skipped.
pub async fn connect(url: &str) -> Result<SignalingChannel> {
    info!(url = %url.split('?').next().unwrap_or(""), "connecting to signaling relay");

    let ws_stream = match tokio::time::timeout(
        CONNECT_TIMEOUT,
        tokio_tungstenite::connect_async(url),
    )
    .await
    {
        Ok(Ok((ws_stream, _))) => ws_stream,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(Error::Signaling(format!(
                "connect timed out after {}s",
                CONNECT_TIMEOUT.as_secs()
            )))
        }
    };

    let (ws_write, ws_read) = ws_stream.split();
    let ws_write: WsWriter = Arc::new(Mutex::new(ws_write));

    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(write_loop(out_rx, Arc::clone(&ws_write)));
    tokio::spawn(read_loop(ws_read, ws_write, in_tx));

    Ok(SignalingChannel::new(out_tx, in_rx))
}

async fn write_loop(mut out_rx: mpsc::Receiver<SignalMessage>, ws_write: WsWriter) {
    while let Some(msg) = out_rx.recv().await {
        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(kind = msg.kind(), error = %e, "could not encode signaling message");
                continue;
            }
        };
        let mut writer = ws_write.lock().await;
        if let Err(e) = writer.send(WsMessage::Text(json.into())).await {
            warn!(error = %e, "signaling send failed");
            return;
        }
    }
    debug!("outbound side dropped, closing relay connection");
    let _ = ws_write.lock().await.close().await;
}

async fn read_loop(
    mut ws_read: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    ws_write: WsWriter,
    in_tx: mpsc::Sender<SignalMessage>,
) {
    while let Some(frame) = ws_read.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match SignalMessage::from_json(&text) {
                Ok(msg) => {
                    if in_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!(text = %text, error = %e, "unrecognized relay message"),
            },
            Ok(WsMessage::Ping(data)) => {
                let _ = ws_write.lock().await.send(WsMessage::Pong(data)).await;
            }
            Ok(WsMessage::Close(_)) => {
                info!("relay closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "websocket error");
                break;
            }
            _ => {}
        }
    }
}
