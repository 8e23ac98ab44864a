use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use harvest_core::ids::UserId;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::connection::ChannelHandle;
use crate::server::AppState;

/// Drive one WebSocket for `user_id` until either side goes away.
///
/// The writer drains the connection's outbound queue and sends pings; the
/// reader feeds text frames to the gateway and records liveness. When either
/// half stops, the other is aborted and the registry entry for this
/// generation (and only this one) is removed.
pub async fn serve_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let config = Arc::clone(&state.config);
    let (payload_tx, mut payload_rx) = mpsc::channel::<Arc<String>>(config.max_send_queue);
    let handle = Arc::new(ChannelHandle::new(payload_tx, config.send_timeout));
    let generation = state.registry.connect(user_id.clone(), handle.clone()).await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_user = user_id.clone();
    let heartbeat = config.heartbeat_interval;
    let closing = handle.close_signal();
    let flush_limit = handle.send_timeout();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                biased;
                () = closing.cancelled() => {
                    // Flush what is already queued, but never wait on a stalled client.
                    let flush = async {
                        while let Ok(text) = payload_rx.try_recv() {
                            if ws_tx.send(WsMessage::Text((*text).clone().into())).await.is_err() {
                                break;
                            }
                        }
                    };
                    let _ = tokio::time::timeout(flush_limit, flush).await;

                    let close = CloseFrame {
                        code: close_code::NORMAL,
                        reason: String::from("connection closed by server").into(),
                    };
                    let _ = tokio::time::timeout(flush_limit, ws_tx.send(WsMessage::Close(Some(close)))).await;
                    break;
                }
                payload = payload_rx.recv() => match payload {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text((*text).clone().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    trace!(user_id = %writer_user, "sent ping");
                }
            }
        }
    });

    let reader_user = user_id.clone();
    let reader_handle = Arc::clone(&handle);
    let gateway = Arc::clone(&state.gateway);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            reader_handle.touch();
            match msg {
                WsMessage::Text(text) => gateway.dispatch(reader_user.clone(), text.as_str()),
                WsMessage::Close(_) => break,
                // Pongs only matter for liveness, recorded above.
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    debug!(user_id = %user_id, generation = %generation, age_ms = handle.age().as_millis() as u64, "socket closed");
    let _ = state.registry.disconnect_generation(&user_id, generation);
}
