//! Gateway selection from configuration

use std::sync::Arc;
use tracing::info;

use super::paper::PaperBroker;
use super::rest::RestBroker;
use crate::common::errors::Result;
use crate::common::traits::BrokerGateway;
use crate::config::types::{BrokerConfig, BrokerMode};

/// Build the gateway named by `broker.mode`
pub fn build_gateway(config: &BrokerConfig) -> Result<Arc<dyn BrokerGateway>> {
    let gateway: Arc<dyn BrokerGateway> = match config.mode {
        BrokerMode::Rest => Arc::new(RestBroker::from_config(config)?),
        BrokerMode::Paper => Arc::new(PaperBroker::new(config.paper_initial_cash)),
    };
    info!(gateway = gateway.name(), "Broker gateway ready");
    Ok(gateway)
}
