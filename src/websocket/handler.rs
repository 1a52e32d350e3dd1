//! WebSocket session handling.
//!
//! One task per session bridging its bus queue to the socket. Client frames
//! are subscribe/unsubscribe only; anything malformed gets an error frame
//! and the session stays open. Book and ticker subscriptions receive an
//! initial snapshot frame; any delta queued ahead of it carries the same or
//! an older sequence and is dropped by the client's sequence check.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use uuid::Uuid;

use super::bus::SessionId;
use super::channels::{ClientMessage, FrameType, ServerFrame, Topic};
use crate::AppState;

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: Option<Uuid>) {
    let (mut sender, mut receiver) = socket.split();
    let (session_id, mut queue) = state.bus.register();
    tracing::debug!(session = %session_id, "websocket session opened");

    if send_frame(&mut sender, &ServerFrame::welcome(session_id))
        .await
        .is_err()
    {
        state.bus.unregister(session_id);
        return;
    }

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, session_id, user_id, &state);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        // Resets without a close handshake are routine.
                        tracing::debug!(session = %session_id, "websocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            frame = queue.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    // Queue closed: the bus evicted this session.
                    None => break,
                }
            }
        }
    }

    state.bus.unregister(session_id);
    tracing::debug!(session = %session_id, "websocket session closed");
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    sender.send(Message::Text(text)).await
}

/// All replies go through the session's bus queue so their order relative to
/// published deltas is preserved.
fn handle_client_message(
    text: &str,
    session_id: SessionId,
    user_id: Option<Uuid>,
    state: &Arc<AppState>,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(_) => {
            state
                .bus
                .send_to(session_id, ServerFrame::error("MALFORMED", "unparseable message"));
            return;
        }
    };

    match message {
        ClientMessage::Subscribe { channels } => {
            for channel in channels {
                subscribe_channel(&channel, session_id, user_id, state);
            }
        }
        ClientMessage::Unsubscribe { channels } => {
            for channel in channels {
                match Topic::parse(&channel) {
                    Some(topic) => {
                        state.bus.unsubscribe(session_id, &topic);
                        state
                            .bus
                            .send_to(session_id, ServerFrame::ack(FrameType::Unsubscribe, &topic));
                    }
                    None => {
                        state.bus.send_to(
                            session_id,
                            ServerFrame::error("INVALID_TOPIC", &format!("unknown channel {}", channel)),
                        );
                    }
                }
            }
        }
    }
}

fn subscribe_channel(
    channel: &str,
    session_id: SessionId,
    user_id: Option<Uuid>,
    state: &Arc<AppState>,
) {
    let Some(topic) = Topic::parse(channel) else {
        state.bus.send_to(
            session_id,
            ServerFrame::error("INVALID_TOPIC", &format!("unknown channel {}", channel)),
        );
        return;
    };

    // Validate before touching the registry: unknown pairs and foreign
    // private streams never get registered.
    match &topic {
        Topic::Orderbook(pair) | Topic::Ticker(pair) => {
            if state.registry.pair(pair).is_none() {
                state
                    .bus
                    .send_to(session_id, ServerFrame::error("UNKNOWN_PAIR", pair));
                return;
            }
        }
        Topic::Orders(owner) => {
            if user_id != Some(*owner) {
                state.bus.send_to(
                    session_id,
                    ServerFrame::error("FORBIDDEN", "orders stream is private"),
                );
                return;
            }
        }
        Topic::TickerAll | Topic::Trade(_) => {}
    }

    // Register first, then capture the snapshot: a delta that lands in the
    // queue before the snapshot overlaps it (same or older sequence), which
    // the client drops by sequence. Snapshotting first would let a delta
    // published in between be missed entirely, an undetectable gap.
    state.bus.subscribe(session_id, topic.clone());

    match &topic {
        Topic::Orderbook(pair) => {
            if let Ok(snapshot) = state.engine.snapshot(pair, state.config.bus.book_depth) {
                state.bus.send_to(
                    session_id,
                    ServerFrame::new(
                        FrameType::Orderbook,
                        Some(topic.name()),
                        serde_json::to_value(&snapshot).unwrap_or_default(),
                    ),
                );
            }
        }
        Topic::Ticker(pair) => {
            if let Ok(stats) = state.engine.pair_stats(pair) {
                let data = state.ticker.ticker(pair, &stats);
                state.bus.send_to(
                    session_id,
                    ServerFrame::new(
                        FrameType::Ticker,
                        Some(topic.name()),
                        serde_json::to_value(&data).unwrap_or_default(),
                    ),
                );
            }
        }
        Topic::TickerAll => {
            for pair in state.registry.pairs() {
                let Ok(stats) = state.engine.pair_stats(&pair.symbol) else {
                    continue;
                };
                let data = state.ticker.ticker(&pair.symbol, &stats);
                state.bus.send_to(
                    session_id,
                    ServerFrame::new(
                        FrameType::Ticker,
                        Some(Topic::TickerAll.name()),
                        serde_json::to_value(&data).unwrap_or_default(),
                    ),
                );
            }
        }
        Topic::Orders(_) | Topic::Trade(_) => {}
    }

    state
        .bus
        .send_to(session_id, ServerFrame::ack(FrameType::Subscribe, &topic));
}
