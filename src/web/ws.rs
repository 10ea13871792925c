//! WebSocket input endpoint
//!
//! Each text frame is one client event. Decoded events go straight into the
//! circular queue in receive order; anything that fails to decode is dropped.
//! The literal text `close` ends the session.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::debug_throttled;
use crate::error::AppError;
use crate::input::{dispatch, parse_text, Inbound};
use crate::queue::CircularQueue;
use crate::state::AppState;
use crate::utils::LogThrottler;
use crate::web::registry::{CloseNotice, CLOSE_NORMAL};

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(queue) = state.queue.clone() else {
        return AppError::ServiceUnavailable("input queue is not configured".to_string())
            .into_response();
    };
    if state.shutdown.is_triggered() {
        return AppError::ServiceUnavailable("server is shutting down".to_string()).into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, queue))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, queue: Arc<CircularQueue>) {
    // Unregisters on every exit path
    let (guard, mut close_rx) = state.sockets.register();
    let client = guard.client().clone();
    let (mut sender, mut receiver) = socket.split();
    let throttler = LogThrottler::default();

    loop {
        tokio::select! {
            notice = close_rx.recv() => {
                if let Some(notice) = notice {
                    send_close(&mut sender, notice, &client.id).await;
                }
                break;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_text(&text) {
                        Ok(Inbound::Close) => {
                            debug!("WebSocket {} asked to close", client.id);
                            let notice = CloseNotice {
                                code: CLOSE_NORMAL,
                                reason: String::new(),
                                done: None,
                            };
                            send_close(&mut sender, notice, &client.id).await;
                            break;
                        }
                        Ok(Inbound::Event(record)) => {
                            if dispatch(&queue, &record) {
                                client.events_processed.fetch_add(1, Ordering::Relaxed);
                            } else {
                                debug_throttled!(throttler, "closed", "Queue closed, event from {} dropped", client.id);
                            }
                        }
                        Err(e) => {
                            debug_throttled!(throttler, "malformed", "Dropped message from {}: {}", client.id, e);
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket {} closed by client", client.id);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket {} receive error: {}", client.id, e);
                        break;
                    }
                    // Ping/pong handled by axum; binary frames carry no events
                    _ => {}
                }
            }
        }
    }
}

async fn send_close<S>(sender: &mut S, notice: CloseNotice, id: &str)
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let frame = CloseFrame {
        code: notice.code,
        reason: notice.reason.into(),
    };
    if let Err(e) = sender.send(Message::Close(Some(frame))).await {
        debug!("WebSocket {}: close frame not sent: {}", id, e);
    }
    if let Some(done) = notice.done {
        let _ = done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::lifecycle::ShutdownHandle;
    use crate::state::ServerMode;
    use crate::web::create_router;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

    async fn serve(state: Arc<AppState>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_router(state);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn interaction_state() -> Arc<AppState> {
        let queue = Arc::new(CircularQueue::in_process(8).unwrap());
        Arc::new(
            AppState::new(ServerMode::Interaction, AppConfig::default(), ShutdownHandle::new())
                .with_queue(queue),
        )
    }

    async fn wait_for_sockets(state: &AppState, expected: usize) {
        for _ in 0..100 {
            if state.sockets.len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} sockets, have {}", expected, state.sockets.len());
    }

    async fn next_close_code<S>(client: &mut S) -> u16
    where
        S: futures::Stream<Item = tungstenite::Result<WsMessage>> + Unpin,
    {
        loop {
            match client.next().await {
                Some(Ok(WsMessage::Close(Some(frame)))) => return u16::from(frame.code),
                Some(Ok(_)) => continue,
                other => panic!("socket ended without a close frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_events_reach_queue_in_order() {
        let state = interaction_state();
        let addr = serve(state.clone()).await;
        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();

        for text in [
            r#"{"type":"weel","deltaY":-1,"timestampInMs":10}"#,
            "{not json",
            r#"{"type":"mouseMove","x":3,"y":4,"ctrlKey":2,"shiftKey":0,"timestampInMs":11}"#,
            r#"{"type":"mouseMove","x":3,"y":4,"ctrlKey":1,"shiftKey":0,"timestampInMs":12}"#,
            "close",
        ] {
            client.send(WsMessage::Text(text.to_string())).await.unwrap();
        }
        assert_eq!(next_close_code(&mut client).await, CLOSE_NORMAL);

        let queue = state.queue.clone().unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue.dequeue().unwrap().to_words(),
            [1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 10.0, 0.0]
        );
        assert_eq!(
            queue.dequeue().unwrap().to_words(),
            [2.0, 0.0, 3.0, 4.0, 1.0, 0.0, 12.0, 0.0]
        );
        wait_for_sockets(&state, 0).await;
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let state = interaction_state();
        let addr = serve(state.clone()).await;
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        wait_for_sockets(&state, 1).await;
        drop(client);
        wait_for_sockets(&state, 0).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_sockets_and_refuses_new_ones() {
        let state = interaction_state();
        let addr = serve(state.clone()).await;
        let url = format!("ws://{}/ws", addr);
        let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        wait_for_sockets(&state, 1).await;

        state.shutdown.trigger();
        let report = state.close_connections().await;
        assert_eq!(report.sockets_notified, 1);
        assert_eq!(next_close_code(&mut client).await, 1001);

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 503);
            }
            other => panic!("late socket was accepted: {:?}", other.map(|_| ())),
        }
        let queue = state.queue.clone().unwrap();
        assert!(queue.is_empty());
    }
}
