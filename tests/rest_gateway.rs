//! REST gateway against a mock brokerage API
//!
//! ```
//! cargo test --test rest_gateway
//! ```

mod common;

use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use serde_json::json;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use common::token;
use tranche_trader::broker::auth::{body_digest, sign_request};
use tranche_trader::{BrokerGateway, OrderRequest, RestBroker, Side, TraderError};

async fn broker(server: &MockServer) -> RestBroker {
    RestBroker::new(&server.uri(), "app-key", "app-secret").expect("client builds")
}

fn header_of(request: &Request, name: &str) -> Option<String> {
    request
        .headers
        .iter()
        .find(|(key, _)| key.as_str().eq_ignore_ascii_case(name))
        .map(|(_, values)| values.last().as_str().to_string())
}

// ============================================================================
// Token
// ============================================================================

#[tokio::test]
async fn test_authenticate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_partial_json(json!({
            "grant_type": "client_credentials",
            "appkey": "app-key",
            "secretkey": "app-secret"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "expires_dt": "20991231235959",
            "token_type": "bearer",
            "token": "issued-token",
            "return_code": 0,
            "return_msg": "ok"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let token = broker(&server).await.authenticate().await.unwrap();
    assert_eq!(token.as_str(), "issued-token");
}

#[tokio::test]
async fn test_authenticate_refused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "return_code": 3,
            "return_msg": "invalid app key"
        })))
        .mount(&server)
        .await;

    let result = broker(&server).await.authenticate().await;
    assert!(matches!(result, Err(TraderError::Authentication(_))), "{:?}", result);
}

// ============================================================================
// Account queries
// ============================================================================

#[tokio::test]
async fn test_balance() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/acnt"))
        .and(header("api-id", "kt00001"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ord_alow_amt": "000001500000",
            "dnca_tot_amt": "000002000000",
            "tot_evlu_amt": "000002100000",
            "return_code": 0,
            "return_msg": "ok"
        })))
        .mount(&server)
        .await;

    let balance = broker(&server).await.get_balance(&token()).await.unwrap();
    assert_eq!(balance.orderable_cash, dec!(1500000));
    assert_eq!(balance.deposit, dec!(2000000));
    assert_eq!(balance.total_eval_amount, dec!(2100000));
}

#[tokio::test]
async fn test_holdings_follow_continuation_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/acnt"))
        .and(header("api-id", "kt00004"))
        .and(header("cont-yn", "N"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cont-yn", "Y")
                .insert_header("next-key", "page-2")
                .set_body_json(json!({
                    "stk_acnt_evlt_prst": [
                        {"stk_cd": "A005930", "rmnd_qty": "000000000010", "pchs_avg_pric": "000000070000", "cur_prc": "-71000"}
                    ],
                    "return_code": 0
                })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/acnt"))
        .and(header("api-id", "kt00004"))
        .and(header("cont-yn", "Y"))
        .and(header("next-key", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "stk_acnt_evlt_prst": [
                {"stk_cd": "A000660", "rmnd_qty": "0", "pchs_avg_pric": "150000", "cur_prc": "151000"},
                {"stk_cd": "A035720", "rmnd_qty": "7", "avg_prc": "48000", "cur_prc": "+48500"}
            ],
            "return_code": 0
        })))
        .expect(1)
        .mount(&server)
        .await;

    let holdings = broker(&server).await.get_holdings(&token()).await.unwrap();

    let symbols: Vec<&str> = holdings.iter().map(|h| h.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["005930", "035720"]);
    assert_eq!(holdings[0].quantity, 10);
    assert_eq!(holdings[0].avg_cost, dec!(70000));
    assert_eq!(holdings[0].current_price, dec!(71000));
    assert_eq!(holdings[1].avg_cost, dec!(48000));
}

#[tokio::test]
async fn test_open_orders_sides() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/acnt"))
        .and(header("api-id", "ka10075"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "oso": [
                {"stk_cd": "005930", "oso_qty": "3", "ord_no": "0000101", "io_tp_nm": "-매도"},
                {"stk_cd": "A000660", "oso_qty": "2", "ord_no": "0000102", "io_tp_nm": "+매수"},
                {"stk_cd": "035720", "oso_qty": "0", "ord_no": "0000103", "io_tp_nm": "+매수"}
            ],
            "return_code": 0
        })))
        .mount(&server)
        .await;

    let orders = broker(&server).await.get_open_orders(&token()).await.unwrap();

    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].side, Side::Sell);
    assert_eq!(orders[0].order_id, "0000101");
    assert_eq!(orders[1].symbol, "000660");
    assert_eq!(orders[1].side, Side::Buy);
}

#[tokio::test]
async fn test_current_price_is_unsigned() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/stkinfo"))
        .and(header("api-id", "ka10001"))
        .and(body_partial_json(json!({"stk_cd": "005930"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "stk_cd": "005930",
            "cur_prc": "-71000",
            "return_code": 0
        })))
        .mount(&server)
        .await;

    let price = broker(&server)
        .await
        .get_current_price("005930", &token())
        .await
        .unwrap();
    assert_eq!(price, dec!(71000));
}

// ============================================================================
// Orders
// ============================================================================

#[tokio::test]
async fn test_limit_buy_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/ordr"))
        .and(header("api-id", "kt10000"))
        .and(body_partial_json(json!({
            "dmst_stex_tp": "KRX",
            "stk_cd": "005930",
            "ord_qty": "3",
            "ord_uv": "70100",
            "trde_tp": "0"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ord_no": "0000321",
            "return_code": 0,
            "return_msg": "order accepted"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ack = broker(&server)
        .await
        .submit_order(&OrderRequest::limit_buy("005930", 3, dec!(70100)), &token())
        .await
        .unwrap();

    assert!(ack.is_success());
    assert_eq!(ack.order_id.as_deref(), Some("0000321"));
}

#[tokio::test]
async fn test_sell_refusal_is_an_ack_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/ordr"))
        .and(header("api-id", "kt10001"))
        .and(body_partial_json(json!({"trde_tp": "3", "ord_uv": ""})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "return_code": "800033",
            "return_msg": "[800033] no sellable quantity"
        })))
        .mount(&server)
        .await;

    let ack = broker(&server)
        .await
        .submit_order(&OrderRequest::market_sell("005930", 10, dec!(71000)), &token())
        .await
        .unwrap();

    assert!(!ack.is_success());
    assert_eq!(ack.code, "800033");
}

#[tokio::test]
async fn test_cancel_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/ordr"))
        .and(header("api-id", "kt10003"))
        .and(body_partial_json(json!({
            "orig_ord_no": "0000321",
            "stk_cd": "005930",
            "cncl_qty": "2"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ord_no": "0000322",
            "return_code": 0,
            "return_msg": "cancelled"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ack = broker(&server)
        .await
        .cancel_order("005930", 2, "0000321", &token())
        .await
        .unwrap();
    assert!(ack.is_success());
}

#[tokio::test]
async fn test_order_calls_are_signed() {
    let server = MockServer::start().await;
    let secret = BASE64.encode(b"order-signing-secret");
    Mock::given(method("POST"))
        .and(path("/api/dostk/ordr"))
        .and(header("x-app-key", "app-key"))
        .and(header_exists("x-signature"))
        .and(header_exists("x-timestamp"))
        .and(header_exists("x-content-sha256"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ord_no": "0000401",
            "return_code": 0
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/acnt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ord_alow_amt": "1000000",
            "return_code": 0
        })))
        .expect(1)
        .mount(&server)
        .await;

    let broker = broker(&server).await.with_signing_secret(Some(secret.clone()));
    let ack = broker
        .submit_order(&OrderRequest::limit_buy("005930", 3, dec!(70100)), &token())
        .await
        .unwrap();
    assert!(ack.is_success());
    broker.get_balance(&token()).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let order = requests
        .iter()
        .find(|r| r.url.path() == "/api/dostk/ordr")
        .expect("order request");
    let body = String::from_utf8(order.body.clone()).unwrap();
    let header_value = |name: &str| header_of(order, name).unwrap();
    let timestamp: i64 = header_value("x-timestamp").parse().unwrap();
    let expected = sign_request(&secret, timestamp, "POST", "/api/dostk/ordr", &body).unwrap();

    assert_eq!(header_value("x-signature"), expected);
    assert_eq!(header_value("x-content-sha256"), body_digest(&body));

    // account queries go out unsigned
    let account = requests
        .iter()
        .find(|r| r.url.path() == "/api/dostk/acnt")
        .expect("balance request");
    assert_eq!(header_of(account, "x-signature"), None);
}

#[tokio::test]
async fn test_orders_unsigned_without_secret() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/ordr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ord_no": "0000402",
            "return_code": 0
        })))
        .mount(&server)
        .await;

    let broker = broker(&server).await.with_signing_secret(Some(String::new()));
    broker
        .submit_order(&OrderRequest::market_sell("005930", 1, dec!(70000)), &token())
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(header_of(&requests[0], "x-signature"), None);
    assert_eq!(header_of(&requests[0], "x-app-key"), None);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_http_429_is_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/acnt"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
        .mount(&server)
        .await;

    let err = broker(&server).await.get_balance(&token()).await.unwrap_err();
    assert!(err.is_transient());
    match err {
        TraderError::RateLimit {
            retry_after_seconds,
            ..
        } => assert_eq!(retry_after_seconds, Some(2)),
        other => panic!("expected rate limit, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rate_limit_return_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/acnt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "return_code": 5,
            "return_msg": "[1700] request limit exceeded"
        })))
        .mount(&server)
        .await;

    let result = broker(&server).await.get_balance(&token()).await;
    assert!(matches!(result, Err(TraderError::RateLimit { .. })), "{:?}", result);
}

#[tokio::test]
async fn test_expired_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/acnt"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/ordr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "return_code": 8005,
            "return_msg": "token expired"
        })))
        .mount(&server)
        .await;

    let broker = broker(&server).await;
    let result = broker.get_holdings(&token()).await;
    assert!(matches!(result, Err(TraderError::Authentication(_))), "{:?}", result);

    let result = broker
        .submit_order(&OrderRequest::limit_buy("005930", 1, dec!(70000)), &token())
        .await;
    assert!(matches!(result, Err(TraderError::Authentication(_))), "{:?}", result);
}

#[tokio::test]
async fn test_server_error_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/dostk/stkinfo"))
        .respond_with(ResponseTemplate::new(500).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let result = broker(&server).await.get_current_price("005930", &token()).await;
    match result {
        Err(TraderError::InvalidResponse(message)) => assert!(message.contains("500")),
        other => panic!("expected invalid response, got {:?}", other),
    }
}
