//! RPC node metrics.
//!
//! Recorded through the global OpenTelemetry meter `evmrpc`; without an
//! installed meter provider every instrument is a no-op.

use std::time::Duration;

use opentelemetry::{
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};

/// Per-node instruments plus the labels every measurement carries.
#[derive(Clone)]
pub struct RpcMetrics {
    pub dials: Counter<u64>,
    pub dials_failed: Counter<u64>,
    pub dials_success: Counter<u64>,
    pub calls: Counter<u64>,
    pub calls_failed: Counter<u64>,
    pub calls_success: Counter<u64>,
    pub call_time_ms: Histogram<f64>,
    node: [KeyValue; 2],
}

impl RpcMetrics {
    pub fn new(meter: &Meter, chain_id: u64, node_name: &str) -> Self {
        Self {
            dials: meter
                .u64_counter("evmrpc.rpc_node_dials_total")
                .with_description("Total number of dial attempts to an RPC node")
                .build(),
            dials_failed: meter
                .u64_counter("evmrpc.rpc_node_dials_failed")
                .with_description("Dial attempts to an RPC node that failed")
                .build(),
            dials_success: meter
                .u64_counter("evmrpc.rpc_node_dials_success")
                .with_description("Dial attempts to an RPC node that succeeded")
                .build(),
            calls: meter
                .u64_counter("evmrpc.rpc_node_calls_total")
                .with_description("Total number of calls made to an RPC node")
                .build(),
            calls_failed: meter
                .u64_counter("evmrpc.rpc_node_calls_failed")
                .with_description("Calls to an RPC node that returned an error")
                .build(),
            calls_success: meter
                .u64_counter("evmrpc.rpc_node_calls_success")
                .with_description("Calls to an RPC node that succeeded")
                .build(),
            call_time_ms: meter
                .f64_histogram("evmrpc.rpc_call_time_ms")
                .with_description("Latency of one RPC call in milliseconds")
                .build(),
            node: [
                KeyValue::new("chain_id", chain_id.to_string()),
                KeyValue::new("node_name", node_name.to_string()),
            ],
        }
    }

    /// Instruments on the global `evmrpc` meter.
    pub fn global(chain_id: u64, node_name: &str) -> Self {
        Self::new(&opentelemetry::global::meter("evmrpc"), chain_id, node_name)
    }

    pub fn record_dial(&self) {
        self.dials.add(1, &self.node);
    }

    pub fn record_dial_result(&self, success: bool) {
        if success {
            self.dials_success.add(1, &self.node);
        } else {
            self.dials_failed.add(1, &self.node);
        }
    }

    pub fn record_call(&self, rpc_domain: &str, call_name: &str, success: bool, elapsed: Duration) {
        self.calls.add(1, &self.node);
        if success {
            self.calls_success.add(1, &self.node);
        } else {
            self.calls_failed.add(1, &self.node);
        }

        let [chain_id, node_name] = self.node.clone();
        self.call_time_ms.record(
            elapsed.as_secs_f64() * 1000.0,
            &[
                chain_id,
                node_name,
                KeyValue::new("rpc_domain", rpc_domain.to_string()),
                KeyValue::new("is_send_only", false),
                KeyValue::new("success", success),
                KeyValue::new("call_name", call_name.to_string()),
            ],
        );
    }
}

impl std::fmt::Debug for RpcMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcMetrics").field("node", &self.node).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_provider_is_a_noop() {
        let m = RpcMetrics::global(1, "node-1");
        m.record_dial();
        m.record_dial_result(false);
        m.record_call("node.example", "CallContext", true, Duration::from_millis(3));
        m.record_call("node.example", "CallContext", false, Duration::from_millis(3));
    }
}
