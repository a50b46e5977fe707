//! Protocol transport over a WebSocket
//!
//! The socket is split in two. The read half decodes frames and forwards
//! them to the control-plane loop; the write half is owned by one task that
//! drains the connection's [`Outbound`] queue, so frames leave in the order
//! the handler produced them.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

use crate::app::{LoopEvent, LoopHandle};
use crate::protocol::{codec, ConnectionInfo, Outbound, Outgoing};

fn encode(frame: Outgoing) -> Option<Message> {
    match frame {
        Outgoing::Text(value) => Some(Message::Text(codec::encode_text(&value))),
        Outgoing::Binary(value) => match codec::encode_binary(&value) {
            Ok(data) => Some(Message::Binary(data)),
            Err(e) => {
                tracing::error!("Failed to encode binary frame: {}", e);
                None
            }
        },
    }
}

/// Run one upgraded connection until either side closes it
pub async fn serve(socket: WebSocket, info: ConnectionInfo, handle: LoopHandle) {
    let id = handle.next_connection_id();
    let (outbound, mut queue) = Outbound::channel();
    if !handle.send(LoopEvent::Connected { id, info, outbound }) {
        return;
    }

    let (mut sink, mut stream) = socket.split();

    // Ends once the loop drops the handler's Outbound, or on a failed send
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            let Some(message) = encode(frame) else {
                continue;
            };
            if let Err(e) = sink.send(message).await {
                tracing::debug!(connection = id, "WebSocket send failed: {}", e);
                return;
            }
        }
        let _ = sink.close().await;
    });

    let mut writer_done = false;
    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            result = &mut writer => {
                writer_done = true;
                if let Err(e) = result {
                    tracing::warn!(connection = id, "WebSocket writer failed: {}", e);
                }
                break;
            }
        };
        let Some(message) = message else {
            break;
        };
        let frame = match message {
            Ok(Message::Text(text)) => codec::decode_text(&text),
            Ok(Message::Binary(data)) => codec::decode_binary(&data),
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(connection = id, "WebSocket read failed: {}", e);
                break;
            }
        };
        if !handle.send(LoopEvent::Inbound { id, frame }) {
            break;
        }
    }

    handle.send(LoopEvent::Closed { id });
    if !writer_done {
        if let Err(e) = writer.await {
            tracing::warn!(connection = id, "WebSocket writer failed: {}", e);
        }
    }
}
