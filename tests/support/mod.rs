#![allow(dead_code)]

pub mod stream_fixture;

use std::sync::Arc;

use flow_relay::{ChannelPublisher, FlowRelay, OutboundEvent, RelayConfig};
use tokio::sync::mpsc;

/// Relay wired to a channel publisher, plus the receiving end.
pub fn relay(config: &RelayConfig) -> (FlowRelay, mpsc::UnboundedReceiver<OutboundEvent>) {
    let (publisher, rx) = ChannelPublisher::channel();
    let relay = FlowRelay::from_config(config, Arc::new(publisher)).expect("relay");
    (relay, rx)
}

/// Configuration pointing at `base_url` with a test token.
pub fn flow_config(base_url: &str) -> RelayConfig {
    RelayConfig::builder()
        .flow_api_url(base_url)
        .flow_api_token("test-token")
        .build()
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
