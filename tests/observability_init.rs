//! Runs in its own process: installing the global tracing subscriber here
//! would otherwise conflict with `#[traced_test]` unit tests in the lib.

use tether_rpc::observability::{init_tracing, init_tracing_with};
use tether_rpc::types::ObservabilityConfig;

#[test]
fn init_tracing_is_idempotent() {
    init_tracing();
    init_tracing_with(&ObservabilityConfig {
        log_level: "debug".into(),
        json_logs: true,
    });
}
