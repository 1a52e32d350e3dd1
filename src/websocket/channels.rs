//! Stream topic grammar and wire frames.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A subscription topic. The grammar is closed: anything that does not parse
/// is answered with an error frame and the session stays open.
///
/// `orderbook@<PAIR>` | `trade@<PAIR>` | `ticker@<PAIR>` | `ticker@all` |
/// `orders@<USERID>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Orderbook(String),
    Trade(String),
    Ticker(String),
    TickerAll,
    Orders(Uuid),
}

impl Topic {
    pub fn parse(input: &str) -> Option<Self> {
        let (kind, arg) = input.split_once('@')?;
        match kind {
            "orderbook" if !arg.is_empty() => Some(Topic::Orderbook(arg.to_string())),
            "trade" if !arg.is_empty() => Some(Topic::Trade(arg.to_string())),
            "ticker" if arg == "all" => Some(Topic::TickerAll),
            "ticker" if !arg.is_empty() => Some(Topic::Ticker(arg.to_string())),
            "orders" => Uuid::parse_str(arg).ok().map(Topic::Orders),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Topic::Orderbook(pair) => format!("orderbook@{}", pair),
            Topic::Trade(pair) => format!("trade@{}", pair),
            Topic::Ticker(pair) => format!("ticker@{}", pair),
            Topic::TickerAll => "ticker@all".to_string(),
            Topic::Orders(user) => format!("orders@{}", user),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Welcome,
    Subscribe,
    Unsubscribe,
    Orderbook,
    Trade,
    Ticker,
    Orders,
    Error,
}

/// Every server-to-client message: `{type, channel, data, timestamp}`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: i64,
}

impl ServerFrame {
    pub fn new(frame_type: FrameType, channel: Option<String>, data: serde_json::Value) -> Self {
        Self {
            frame_type,
            channel,
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn welcome(session_id: Uuid) -> Self {
        Self::new(
            FrameType::Welcome,
            None,
            serde_json::json!({ "session_id": session_id }),
        )
    }

    pub fn ack(frame_type: FrameType, topic: &Topic) -> Self {
        Self::new(
            frame_type,
            Some(topic.name()),
            serde_json::json!({ "channel": topic.name() }),
        )
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::new(
            FrameType::Error,
            None,
            serde_json::json!({ "code": code, "message": message }),
        )
    }
}
