//! Brokerage gateways: live REST, in-memory paper account and the
//! condition-search stream

pub mod auth;
pub mod client;
pub mod messages;
pub mod paper;
pub mod rest;
pub mod websocket;

pub use client::build_gateway;
pub use paper::PaperBroker;
pub use rest::RestBroker;
pub use websocket::{parse_frame, StreamFrame, StreamSession};
