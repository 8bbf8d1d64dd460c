//! REST gateway for the brokerage order-entry and account API

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::auth::{generate_signing_headers, SigningHeaders};
use super::messages::*;
use crate::common::errors::{Result, TraderError};
use crate::common::traits::BrokerGateway;
use crate::common::types::{
    AccessToken, Balance, BrokerHolding, OpenOrder, OrderAck, OrderKind, OrderRequest, Side,
};
use crate::config::types::BrokerConfig;

const TOKEN_PATH: &str = "/oauth2/token";
const ACCOUNT_PATH: &str = "/api/dostk/acnt";
const ORDER_PATH: &str = "/api/dostk/ordr";
const STOCK_INFO_PATH: &str = "/api/dostk/stkinfo";

/// Broker code for an expired or unknown token
const INVALID_TOKEN_CODE: &str = "8005";

/// Upper bound on continuation pages fetched for one query
const MAX_PAGES: usize = 20;

/// REST client implementing [`BrokerGateway`]
#[derive(Debug, Clone)]
pub struct RestBroker {
    /// HTTP client
    client: Client,
    /// Base URL, without trailing slash
    base_url: String,
    app_key: String,
    app_secret: String,
    /// Optional secret for signing order requests
    signing_secret: Option<String>,
    /// Exchange code sent with orders (KRX, NXT, ...)
    market_code: String,
}

impl RestBroker {
    pub fn new(base_url: &str, app_key: &str, app_secret: &str) -> Result<Self> {
        Self::with_timeout(base_url, app_key, app_secret, Duration::from_secs(5))
    }

    pub fn with_timeout(
        base_url: &str,
        app_key: &str,
        app_secret: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TraderError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
            signing_secret: None,
            market_code: "KRX".to_string(),
        })
    }

    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        let app_key = config
            .app_key
            .as_deref()
            .ok_or_else(|| TraderError::Configuration("broker.app_key is required".into()))?;
        let app_secret = config
            .app_secret
            .as_deref()
            .ok_or_else(|| TraderError::Configuration("broker.app_secret is required".into()))?;

        Ok(Self::with_timeout(
            &config.rest_url,
            app_key,
            app_secret,
            Duration::from_millis(config.request_timeout_ms),
        )?
        .with_market_code(&config.market_code)
        .with_signing_secret(config.signing_secret.clone()))
    }

    pub fn with_market_code(mut self, market_code: &str) -> Self {
        self.market_code = market_code.to_string();
        self
    }

    pub fn with_signing_secret(mut self, secret: Option<String>) -> Self {
        self.signing_secret = secret.filter(|s| !s.is_empty());
        self
    }

    fn signing_headers(&self, path: &str, body: &str) -> Result<Option<SigningHeaders>> {
        match &self.signing_secret {
            Some(secret) => Ok(Some(generate_signing_headers(
                &self.app_key,
                secret,
                "POST",
                path,
                body,
            )?)),
            None => Ok(None),
        }
    }

    /// POST one API call and decode the body.
    ///
    /// Returns the continuation key when the server says more pages exist.
    async fn call<B, R>(
        &self,
        path: &str,
        api_id: &str,
        body: &B,
        token: &AccessToken,
        next_key: Option<&str>,
    ) -> Result<(R, Option<String>)>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let payload = serde_json::to_string(body)?;
        debug!(api_id, "POST {}", url);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json;charset=UTF-8")
            .header("authorization", format!("Bearer {}", token.as_str()))
            .header("api-id", api_id)
            .header("cont-yn", if next_key.is_some() { "Y" } else { "N" })
            .header("next-key", next_key.unwrap_or(""));
        if path == ORDER_PATH {
            if let Some(headers) = self.signing_headers(path, &payload)? {
                request = headers.apply_to_request(request);
            }
        }

        let response = request.body(payload).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(TraderError::RateLimit {
                message: format!("{} throttled", api_id),
                retry_after_seconds: retry_after,
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(TraderError::Authentication(format!(
                "Server returned status {}: {}",
                status, body
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TraderError::InvalidResponse(format!(
                "Server returned status {}: {}",
                status, body
            )));
        }

        let more = response
            .headers()
            .get("cont-yn")
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.eq_ignore_ascii_case("Y"));
        let continuation = if more {
            response
                .headers()
                .get("next-key")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        } else {
            None
        };

        let parsed: R = response.json().await?;
        Ok((parsed, continuation))
    }

    /// Turn a non-success status on a query into an error.
    fn check(status: &ReturnStatus, api_id: &str) -> Result<()> {
        if status.is_rate_limited() {
            return Err(TraderError::RateLimit {
                message: format!("{}: {}", api_id, status.message()),
                retry_after_seconds: None,
            });
        }
        if status.code() == INVALID_TOKEN_CODE {
            return Err(TraderError::Authentication(status.message()));
        }
        if !status.is_success() {
            return Err(TraderError::Rejected {
                code: status.code(),
                message: status.message(),
            });
        }
        Ok(())
    }

    /// Turn an order reply into an ack; only throttling and token
    /// failures become errors.
    fn order_ack(response: OrderResponse) -> Result<OrderAck> {
        let status = response.status;
        if status.code() == INVALID_TOKEN_CODE {
            return Err(TraderError::Authentication(status.message()));
        }
        let ack = if status.is_success() {
            OrderAck::success(status.message())
        } else {
            OrderAck::failure(status.code(), status.message())
        };
        Ok(match response.ord_no.filter(|n| !n.trim().is_empty()) {
            Some(order_no) => ack.with_order_id(order_no.trim()),
            None => ack,
        })
    }

    fn order_body(&self, order: &OrderRequest) -> OrderBody {
        let (price, trade_type) = match order.kind {
            OrderKind::Limit => (order.price.trunc().to_string(), "0"),
            OrderKind::Market => (String::new(), "3"),
        };
        OrderBody {
            dmst_stex_tp: self.market_code.clone(),
            stk_cd: order.symbol.clone(),
            ord_qty: order.quantity.to_string(),
            ord_uv: price,
            trde_tp: trade_type.to_string(),
            cond_uv: String::new(),
        }
    }
}

fn quantity_of(value: Decimal) -> u64 {
    value.trunc().to_u64().unwrap_or(0)
}

#[async_trait]
impl BrokerGateway for RestBroker {
    #[instrument(skip(self))]
    async fn authenticate(&self) -> Result<AccessToken> {
        let url = format!("{}{}", self.base_url, TOKEN_PATH);
        let body = TokenRequest::client_credentials(&self.app_key, &self.app_secret);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json;charset=UTF-8")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TraderError::Authentication(format!(
                "Server returned status {}: {}",
                status, text
            )));
        }

        let parsed: TokenResponse = response.json().await?;
        match parsed.token.filter(|t| !t.is_empty()) {
            Some(token) if parsed.status.is_success() => {
                info!("Access token issued");
                Ok(AccessToken::new(token))
            }
            _ => Err(TraderError::Authentication(format!(
                "token request refused [{}]: {}",
                parsed.status.code(),
                parsed.status.message()
            ))),
        }
    }

    #[instrument(skip(self, token))]
    async fn get_balance(&self, token: &AccessToken) -> Result<Balance> {
        let request = BalanceRequest {
            qry_tp: "3".to_string(),
        };
        let (response, _): (BalanceResponse, _) =
            self.call(ACCOUNT_PATH, "kt00001", &request, token, None).await?;
        Self::check(&response.status, "kt00001")?;

        let orderable_cash = response.ord_alow_amt;
        let mut deposit = if response.dnca_tot_amt.is_zero() {
            response.d2_entra
        } else {
            response.dnca_tot_amt
        };
        let mut total_eval_amount = if response.tot_evlu_amt.is_zero() {
            response.entr
        } else {
            response.tot_evlu_amt
        };
        if deposit.is_zero() {
            deposit = orderable_cash;
        }
        if total_eval_amount.is_zero() {
            total_eval_amount = deposit;
        }

        Ok(Balance {
            orderable_cash,
            total_eval_amount,
            deposit,
        })
    }

    #[instrument(skip(self, token))]
    async fn get_holdings(&self, token: &AccessToken) -> Result<Vec<BrokerHolding>> {
        let request = HoldingsRequest {
            qry_tp: "0".to_string(),
            dmst_stex_tp: self.market_code.clone(),
        };

        let mut holdings = Vec::new();
        let mut next_key: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let (response, continuation): (HoldingsResponse, _) = self
                .call(ACCOUNT_PATH, "kt00004", &request, token, next_key.as_deref())
                .await?;
            Self::check(&response.status, "kt00004")?;

            holdings.extend(
                response
                    .stk_acnt_evlt_prst
                    .into_iter()
                    .map(|row| BrokerHolding {
                        symbol: normalize_symbol(&row.stk_cd),
                        quantity: quantity_of(row.rmnd_qty),
                        avg_cost: row.pchs_avg_pric,
                        current_price: row.cur_prc,
                    })
                    .filter(|h| h.quantity > 0 && !h.symbol.is_empty()),
            );

            match continuation {
                Some(key) => next_key = Some(key),
                None => return Ok(holdings),
            }
        }

        warn!(pages = MAX_PAGES, "Holdings paging stopped at page limit");
        Ok(holdings)
    }

    #[instrument(skip(self, token))]
    async fn get_open_orders(&self, token: &AccessToken) -> Result<Vec<OpenOrder>> {
        let (response, _): (OpenOrdersResponse, _) = self
            .call(ACCOUNT_PATH, "ka10075", &OpenOrdersRequest::default(), token, None)
            .await?;
        Self::check(&response.status, "ka10075")?;

        Ok(response
            .oso
            .into_iter()
            .filter(|row| !row.oso_qty.is_zero())
            .map(|row| OpenOrder {
                symbol: normalize_symbol(&row.stk_cd),
                side: if row.is_sell() { Side::Sell } else { Side::Buy },
                quantity: quantity_of(row.oso_qty),
                order_id: row.ord_no,
            })
            .collect())
    }

    #[instrument(skip(self, token), fields(symbol = %order.symbol, side = %order.side))]
    async fn submit_order(&self, order: &OrderRequest, token: &AccessToken) -> Result<OrderAck> {
        let api_id = match order.side {
            Side::Buy => "kt10000",
            Side::Sell => "kt10001",
        };
        let body = self.order_body(order);
        let (response, _): (OrderResponse, _) =
            self.call(ORDER_PATH, api_id, &body, token, None).await?;
        let ack = Self::order_ack(response)?;
        debug!(code = %ack.code, message = %ack.message, "Order reply");
        Ok(ack)
    }

    #[instrument(skip(self, token))]
    async fn cancel_order(
        &self,
        symbol: &str,
        quantity: u64,
        order_id: &str,
        token: &AccessToken,
    ) -> Result<OrderAck> {
        let body = CancelBody {
            dmst_stex_tp: self.market_code.clone(),
            orig_ord_no: order_id.to_string(),
            stk_cd: symbol.to_string(),
            cncl_qty: quantity.to_string(),
        };
        let (response, _): (OrderResponse, _) =
            self.call(ORDER_PATH, "kt10003", &body, token, None).await?;
        Self::order_ack(response)
    }

    #[instrument(skip(self, token))]
    async fn get_current_price(&self, symbol: &str, token: &AccessToken) -> Result<Decimal> {
        let request = PriceRequest {
            stk_cd: symbol.to_string(),
        };
        let (response, _): (PriceResponse, _) =
            self.call(STOCK_INFO_PATH, "ka10001", &request, token, None).await?;
        Self::check(&response.status, "ka10001")?;

        if response.cur_prc <= Decimal::ZERO {
            return Err(TraderError::InvalidResponse(format!(
                "no price for {}",
                symbol
            )));
        }
        Ok(response.cur_prc)
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}
