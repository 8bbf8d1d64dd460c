//! Streaming condition-search session
//!
//! Frame builders and the parser for the broker's websocket protocol, plus a
//! thin session wrapper over `tokio-tungstenite`. The reconnect state machine
//! lives in [`crate::feed`].

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info};

use super::messages::{
    amount_from_value, normalize_symbol, BareFrame, ConditionRequestFrame, LoginFrame,
};
use crate::common::errors::{Result, TraderError};
use crate::common::types::{AccessToken, Candidate, OriginTag};

pub const TRNM_LOGIN: &str = "LOGIN";
pub const TRNM_PING: &str = "PING";
pub const TRNM_CONDITION_LIST: &str = "CNSRLST";
pub const TRNM_CONDITION_REQUEST: &str = "CNSRREQ";
pub const TRNM_REAL: &str = "REAL";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One decoded server frame
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Login acknowledgement; `code == "0"` on success
    Login { code: String, message: String },
    /// Keepalive that must be echoed back verbatim
    Ping(String),
    /// Available conditions as `(index, name)`
    ConditionList(Vec<(String, String)>),
    /// Symbols currently matching the subscribed condition
    Signals(Vec<Candidate>),
    /// Anything else (registration acks, unknown transactions)
    Other(String),
}

pub fn login_frame(token: &AccessToken) -> Result<String> {
    Ok(serde_json::to_string(&LoginFrame {
        trnm: TRNM_LOGIN.to_string(),
        token: token.as_str().to_string(),
    })?)
}

pub fn condition_list_frame() -> Result<String> {
    Ok(serde_json::to_string(&BareFrame {
        trnm: TRNM_CONDITION_LIST.to_string(),
    })?)
}

/// Real-time registration for condition `seq`
pub fn condition_request_frame(seq: &str) -> Result<String> {
    Ok(serde_json::to_string(&ConditionRequestFrame {
        trnm: TRNM_CONDITION_REQUEST.to_string(),
        seq: seq.to_string(),
        search_type: "1".to_string(),
        stex_tp: "K".to_string(),
    })?)
}

/// Decode one text frame; `now` stamps any candidates it carries.
pub fn parse_frame(text: &str, now: DateTime<Utc>) -> Result<StreamFrame> {
    let value: Value = serde_json::from_str(text)?;
    let trnm = value
        .get("trnm")
        .and_then(Value::as_str)
        .ok_or_else(|| TraderError::InvalidResponse("frame without trnm".into()))?;

    match trnm {
        TRNM_LOGIN => Ok(StreamFrame::Login {
            code: code_text(value.get("return_code")),
            message: value
                .get("return_msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        TRNM_PING => Ok(StreamFrame::Ping(text.to_string())),
        TRNM_CONDITION_LIST => Ok(StreamFrame::ConditionList(parse_condition_list(&value))),
        TRNM_REAL | TRNM_CONDITION_REQUEST => {
            let items = value.get("data").and_then(Value::as_array);
            match items {
                Some(items) => Ok(StreamFrame::Signals(
                    items.iter().filter_map(|item| parse_signal(item, now)).collect(),
                )),
                None => Ok(StreamFrame::Other(trnm.to_string())),
            }
        }
        other => Ok(StreamFrame::Other(other.to_string())),
    }
}

fn code_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        _ => String::new(),
    }
}

/// Entries come as `["0","name"]` or `"0^name"`.
fn parse_condition_list(value: &Value) -> Vec<(String, String)> {
    let Some(entries) = value.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::Array(parts) => {
                let index = parts.first().map(|v| code_text(Some(v)))?;
                let name = parts.get(1).map(|v| code_text(Some(v))).unwrap_or_default();
                Some((index, name))
            }
            Value::String(s) => {
                let (index, name) = s.split_once('^').unwrap_or((s.as_str(), ""));
                Some((index.trim().to_string(), name.trim().to_string()))
            }
            _ => None,
        })
        .filter(|(index, _)| !index.is_empty())
        .collect()
}

/// Signed decimal; unlike prices, change rates keep their sign.
fn signed_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            Decimal::from_str(cleaned.trim_start_matches('+')).ok()
        }
        _ => None,
    }
}

fn field<'a>(fields: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| fields.get(*key))
}

fn parse_signal(item: &Value, now: DateTime<Utc>) -> Option<Candidate> {
    // REAL items nest their fields under "values"; CNSRREQ items are flat
    let fields = item.get("values").unwrap_or(item);

    let symbol = field(fields, &["9001", "stk_cd", "jmcode"])
        .or_else(|| item.get("item"))
        .and_then(Value::as_str)
        .map(normalize_symbol)
        .filter(|s| !s.is_empty())?;

    let change = field(fields, &["12", "11", "pl_rt"])
        .and_then(signed_decimal)
        .unwrap_or_default();
    let strength = field(fields, &["15"]).and_then(signed_decimal);

    let candidate = Candidate::new(symbol, Candidate::score(change, strength), OriginTag::Rule)
        .arrived_at(now);
    match field(fields, &["10"]).and_then(amount_from_value) {
        Some(price) if price > Decimal::ZERO => Some(candidate.with_price(price)),
        _ => Some(candidate),
    }
}

/// Connected websocket split into halves
pub struct StreamSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

impl StreamSession {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to stream: {}", url);
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| TraderError::WebSocketConnection(e.to_string()))?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send_text(&mut self, text: String) -> Result<()> {
        debug!("Sending frame: {}", text);
        self.write.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Next text frame. `None` once the server closes the stream.
    pub async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.write.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!("Stream closed: {:?}", frame);
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.write.send(Message::Close(None)).await;
        let _ = self.write.close().await;
    }
}
