//! Engine-to-bus bridge.
//!
//! Consumes the engine's event stream outside any lock and turns it into
//! topic frames: depth-bounded book snapshots on `BookChanged`, trade frames,
//! private order frames, and coalesced ticker pushes on a minimum interval.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::bus::FanoutBus;
use super::channels::{FrameType, ServerFrame, Topic};
use crate::services::matching::{EngineEvent, MatchingEngine};
use crate::services::ticker::TickerService;

pub fn start_event_bridge(
    bus: Arc<FanoutBus>,
    engine: Arc<MatchingEngine>,
    ticker: Arc<TickerService>,
    book_depth: usize,
) {
    let mut rx = engine.subscribe_events();
    tokio::spawn(async move {
        info!("fan-out bridge started");
        loop {
            match rx.recv().await {
                Ok(EngineEvent::BookChanged { pair, .. }) => {
                    let Ok(snapshot) = engine.snapshot(&pair, book_depth) else {
                        continue;
                    };
                    let topic = Topic::Orderbook(pair);
                    let frame = ServerFrame::new(
                        FrameType::Orderbook,
                        Some(topic.name()),
                        serde_json::to_value(&snapshot).unwrap_or_default(),
                    );
                    bus.publish(&topic, frame);
                }
                Ok(EngineEvent::TradeExecuted(trade)) => {
                    ticker.record_trade(&trade.pair, trade.price, trade.amount, trade.timestamp);
                    let topic = Topic::Trade(trade.pair.clone());
                    let frame = ServerFrame::new(
                        FrameType::Trade,
                        Some(topic.name()),
                        serde_json::to_value(&trade).unwrap_or_default(),
                    );
                    bus.publish(&topic, frame);
                }
                Ok(EngineEvent::OrderUpdated(transition)) => {
                    let topic = Topic::Orders(transition.user_id);
                    let frame = ServerFrame::new(
                        FrameType::Orders,
                        Some(topic.name()),
                        serde_json::to_value(&transition).unwrap_or_default(),
                    );
                    bus.publish(&topic, frame);
                }
                Ok(EngineEvent::FillRecorded(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("fan-out bridge lagged {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("engine event channel closed, fan-out bridge stopping");
                    break;
                }
            }
        }
    });
}

/// Flush dirty tickers to `ticker@<pair>` and `ticker@all` on the configured
/// minimum interval.
pub fn start_ticker_flusher(
    bus: Arc<FanoutBus>,
    engine: Arc<MatchingEngine>,
    ticker: Arc<TickerService>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            for pair in ticker.take_dirty() {
                let Ok(stats) = engine.pair_stats(&pair) else {
                    continue;
                };
                let data = ticker.ticker(&pair, &stats);
                let value = serde_json::to_value(&data).unwrap_or_default();
                let topic = Topic::Ticker(pair.clone());
                bus.publish(
                    &topic,
                    ServerFrame::new(FrameType::Ticker, Some(topic.name()), value.clone()),
                );
                bus.publish(
                    &Topic::TickerAll,
                    ServerFrame::new(FrameType::Ticker, Some(Topic::TickerAll.name()), value),
                );
            }
        }
    });
}
