//! Wire types for the brokerage REST and streaming APIs
//!
//! Amounts arrive either as JSON numbers or as strings that may carry
//! thousands separators and a leading direction sign ("-70,100" is a
//! price of 70100 on a down tick), so every amount goes through
//! [`parse_amount`].

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::common::types::SUCCESS_CODE;

/// Broker code signalling the per-second request quota was hit
pub const RATE_LIMIT_CODE: &str = "5";

/// Message fragment used by the same condition
pub const RATE_LIMIT_MARKER: &str = "1700";

// ============================================================================
// Amount parsing
// ============================================================================

/// Parse a broker amount, dropping separators and the direction sign.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    let unsigned = cleaned.trim_start_matches(|c| c == '+' || c == '-');
    if unsigned.is_empty() {
        return None;
    }
    Decimal::from_str(unsigned).ok()
}

pub fn amount_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => parse_amount(s),
        Value::Number(n) => parse_amount(&n.to_string()),
        _ => None,
    }
}

fn amount<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(amount_from_value).unwrap_or_default())
}

fn text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

/// Strip the market prefix from a stock code ("A005930" → "005930").
pub fn normalize_symbol(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed.strip_prefix('A').unwrap_or(trimmed).to_string()
}

// ============================================================================
// Common response status
// ============================================================================

/// `return_code` / `return_msg` pair present on every response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReturnStatus {
    #[serde(default)]
    pub return_code: Option<Value>,
    #[serde(default)]
    pub return_msg: Option<String>,
}

impl ReturnStatus {
    /// Code as text; numbers and strings are both accepted
    pub fn code(&self) -> String {
        match &self.return_code {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.trim().to_string(),
            _ => String::new(),
        }
    }

    pub fn message(&self) -> String {
        self.return_msg.clone().unwrap_or_default()
    }

    /// Absent codes count as success; some endpoints omit them on success.
    pub fn is_success(&self) -> bool {
        let code = self.code();
        code.is_empty() || code == SUCCESS_CODE
    }

    pub fn is_rate_limited(&self) -> bool {
        self.code() == RATE_LIMIT_CODE || self.message().contains(RATE_LIMIT_MARKER)
    }
}

// ============================================================================
// REST: token
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub appkey: String,
    pub secretkey: String,
}

impl TokenRequest {
    pub fn client_credentials(app_key: &str, app_secret: &str) -> Self {
        Self {
            grant_type: "client_credentials".to_string(),
            appkey: app_key.to_string(),
            secretkey: app_secret.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default, alias = "access_token")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub status: ReturnStatus,
}

// ============================================================================
// REST: account
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct BalanceRequest {
    /// 3 = estimated figures
    pub qry_tp: String,
}

/// Deposit detail (kt00001)
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResponse {
    #[serde(default, deserialize_with = "amount")]
    pub ord_alow_amt: Decimal,
    #[serde(default, deserialize_with = "amount")]
    pub dnca_tot_amt: Decimal,
    #[serde(default, deserialize_with = "amount")]
    pub tot_evlu_amt: Decimal,
    #[serde(default, deserialize_with = "amount")]
    pub d2_entra: Decimal,
    #[serde(default, deserialize_with = "amount")]
    pub entr: Decimal,
    #[serde(flatten)]
    pub status: ReturnStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HoldingsRequest {
    pub qry_tp: String,
    pub dmst_stex_tp: String,
}

/// Account evaluation (kt00004)
#[derive(Debug, Clone, Deserialize)]
pub struct HoldingsResponse {
    #[serde(default)]
    pub stk_acnt_evlt_prst: Vec<HoldingRow>,
    #[serde(flatten)]
    pub status: ReturnStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HoldingRow {
    #[serde(default, deserialize_with = "text")]
    pub stk_cd: String,
    #[serde(default, deserialize_with = "amount")]
    pub rmnd_qty: Decimal,
    #[serde(default, alias = "avg_prc", deserialize_with = "amount")]
    pub pchs_avg_pric: Decimal,
    #[serde(default, deserialize_with = "amount")]
    pub cur_prc: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenOrdersRequest {
    pub dmst_stex_tp: String,
    pub qry_tp: String,
    pub trde_tp: String,
    pub all_stk_tp: String,
    pub stex_tp: String,
    pub stk_cd: String,
}

impl Default for OpenOrdersRequest {
    fn default() -> Self {
        Self {
            dmst_stex_tp: "0".to_string(),
            qry_tp: "0".to_string(),
            trde_tp: "0".to_string(),
            all_stk_tp: "0".to_string(),
            stex_tp: "0".to_string(),
            stk_cd: String::new(),
        }
    }
}

/// Unfilled orders (ka10075)
#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrdersResponse {
    #[serde(default, alias = "output")]
    pub oso: Vec<OpenOrderRow>,
    #[serde(flatten)]
    pub status: ReturnStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrderRow {
    #[serde(default, deserialize_with = "text")]
    pub stk_cd: String,
    #[serde(default, alias = "unex_qty", deserialize_with = "amount")]
    pub oso_qty: Decimal,
    #[serde(default, deserialize_with = "text")]
    pub ord_no: String,
    /// "매수" (buy) or "매도" (sell), possibly with a sign prefix
    #[serde(default, deserialize_with = "text")]
    pub io_tp_nm: String,
}

impl OpenOrderRow {
    pub fn is_sell(&self) -> bool {
        self.io_tp_nm.contains("매도")
    }
}

// ============================================================================
// REST: orders
// ============================================================================

/// Buy (kt10000) and sell (kt10001) body
#[derive(Debug, Clone, Serialize)]
pub struct OrderBody {
    pub dmst_stex_tp: String,
    pub stk_cd: String,
    pub ord_qty: String,
    /// Empty for market orders
    pub ord_uv: String,
    /// 0 = limit, 3 = market
    pub trde_tp: String,
    pub cond_uv: String,
}

/// Cancel (kt10003) body
#[derive(Debug, Clone, Serialize)]
pub struct CancelBody {
    pub dmst_stex_tp: String,
    pub orig_ord_no: String,
    pub stk_cd: String,
    pub cncl_qty: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    #[serde(default)]
    pub ord_no: Option<String>,
    #[serde(flatten)]
    pub status: ReturnStatus,
}

// ============================================================================
// REST: quotes
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PriceRequest {
    pub stk_cd: String,
}

/// Basic stock info (ka10001)
#[derive(Debug, Clone, Deserialize)]
pub struct PriceResponse {
    #[serde(default, deserialize_with = "amount")]
    pub cur_prc: Decimal,
    #[serde(flatten)]
    pub status: ReturnStatus,
}

// ============================================================================
// Streaming frames
// ============================================================================

/// LOGIN frame sent right after connecting
#[derive(Debug, Clone, Serialize)]
pub struct LoginFrame {
    pub trnm: String,
    pub token: String,
}

/// Frame carrying only a transaction name (CNSRLST)
#[derive(Debug, Clone, Serialize)]
pub struct BareFrame {
    pub trnm: String,
}

/// Real-time registration of one condition (CNSRREQ)
#[derive(Debug, Clone, Serialize)]
pub struct ConditionRequestFrame {
    pub trnm: String,
    pub seq: String,
    /// 1 = real-time
    pub search_type: String,
    pub stex_tp: String,
}
