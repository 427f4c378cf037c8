//! External strategy collaboration.
//!
//! The strategy service is a message peer, never a shared-memory
//! collaborator: it receives `{symbol, backtest_timestamp}` and answers
//! with a structured reply whose `tool_calls` channel names the intended
//! trading actions. Only `placeOrder` and `cancelOrder` produce engine
//! calls; everything else is ignored.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use url::Url;
use vex_core::OrderId;

use crate::{BacktestError, BacktestResult};

/// One tool invocation in the strategy reply.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Structured reply returned by the strategy service.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StrategyReply {
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Free-form commentary; carried through for diagnostics only.
    #[serde(default)]
    pub summary: Option<String>,
}

/// Optional protective bracket attached to a placement.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TpslArgs {
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
}

/// Arguments of a `placeOrder` tool call, in the exchange's wire shape.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlaceOrderArgs {
    pub coin: String,
    pub is_buy: bool,
    pub sz: Decimal,
    /// Absent or zero means a market order.
    #[serde(default)]
    pub limit_px: Option<Decimal>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub tpsl: Option<TpslArgs>,
}

/// Arguments of a `cancelOrder` tool call.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CancelOrderArgs {
    pub oid: OrderId,
}

/// Actions the orchestrator extracts from a reply.
#[derive(Clone, Debug)]
pub enum StrategyAction {
    Place(PlaceOrderArgs),
    Cancel(CancelOrderArgs),
}

impl StrategyReply {
    /// Extract engine actions in declaration order. Unknown tools are
    /// ignored; malformed arguments are logged and skipped.
    #[must_use]
    pub fn actions(&self) -> Vec<StrategyAction> {
        let mut actions = Vec::new();
        for call in &self.tool_calls {
            match call.tool.as_str() {
                "placeOrder" => match serde_json::from_value(call.arguments.clone()) {
                    Ok(args) => actions.push(StrategyAction::Place(args)),
                    Err(err) => warn!(%err, "skipping malformed placeOrder arguments"),
                },
                "cancelOrder" => match serde_json::from_value(call.arguments.clone()) {
                    Ok(args) => actions.push(StrategyAction::Cancel(args)),
                    Err(err) => warn!(%err, "skipping malformed cancelOrder arguments"),
                },
                _ => {}
            }
        }
        actions
    }
}

/// The orchestrator's view of a strategy collaborator.
#[async_trait]
pub trait StrategyService: Send + Sync {
    /// One decision step at virtual time `at`. The timestamp is passed
    /// explicitly on every call so concurrent runs never interfere.
    async fn decide(&self, symbol: &str, at: DateTime<Utc>) -> BacktestResult<StrategyReply>;
}

#[derive(Serialize)]
struct DecideRequest<'a> {
    symbol: &'a str,
    backtest_timestamp: i64,
}

/// HTTP client for a remote strategy service.
pub struct HttpStrategyClient {
    http: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl HttpStrategyClient {
    /// Bind the client to the service URL with a bounded per-call timeout.
    pub fn new(url: Url, timeout: Duration) -> BacktestResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| BacktestError::StrategyUnavailable(err.to_string()))?;
        Ok(Self { http, url, timeout })
    }
}

#[async_trait]
impl StrategyService for HttpStrategyClient {
    async fn decide(&self, symbol: &str, at: DateTime<Utc>) -> BacktestResult<StrategyReply> {
        let request = DecideRequest {
            symbol,
            backtest_timestamp: at.timestamp(),
        };
        let response = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    BacktestError::StrategyTimeout(self.timeout)
                } else {
                    BacktestError::StrategyUnavailable(err.to_string())
                }
            })?;
        let response = response
            .error_for_status()
            .map_err(|err| BacktestError::StrategyUnavailable(err.to_string()))?;
        response
            .json::<StrategyReply>()
            .await
            .map_err(|err| BacktestError::StrategyUnavailable(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(calls: Value) -> StrategyReply {
        serde_json::from_value(json!({ "tool_calls": calls })).unwrap()
    }

    #[test]
    fn extracts_place_and_cancel_in_declaration_order() {
        let reply = reply(json!([
            {"tool": "placeOrder", "arguments": {"coin": "BTC", "is_buy": true, "sz": "0.5", "limit_px": "30000"}},
            {"tool": "latest_news", "arguments": {"limit": 5}},
            {"tool": "cancelOrder", "arguments": {"oid": 7}},
        ]));
        let actions = reply.actions();
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], StrategyAction::Place(args) if args.coin == "BTC"));
        assert!(matches!(&actions[1], StrategyAction::Cancel(args) if args.oid == 7));
    }

    #[test]
    fn malformed_arguments_are_skipped_not_fatal() {
        let reply = reply(json!([
            {"tool": "placeOrder", "arguments": {"coin": "BTC"}},
            {"tool": "placeOrder", "arguments": {"coin": "ETH", "is_buy": false, "sz": 2}},
        ]));
        let actions = reply.actions();
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], StrategyAction::Place(args) if args.coin == "ETH"));
    }

    #[test]
    fn tpsl_block_deserializes_with_either_leg_optional() {
        let reply = reply(json!([
            {"tool": "placeOrder", "arguments": {
                "coin": "BTC", "is_buy": true, "sz": "1",
                "tpsl": {"take_profit": "105", "stop_loss": "95"}
            }},
        ]));
        match &reply.actions()[0] {
            StrategyAction::Place(args) => {
                let tpsl = args.tpsl.as_ref().unwrap();
                assert_eq!(tpsl.take_profit, Some(Decimal::from(105)));
                assert_eq!(tpsl.stop_loss, Some(Decimal::from(95)));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn missing_tool_calls_channel_means_no_actions() {
        let reply: StrategyReply = serde_json::from_value(json!({"summary": "hold"})).unwrap();
        assert!(reply.actions().is_empty());
    }
}
