//! # Metrics
//!
//! Counter names emitted through the `metrics` facade. No exporter is installed here;
//! an embedding program installs whichever recorder it wants before building the
//! gateway, and without one the counters are no-ops.

use metrics::{describe_counter, Unit};

/// Requests by dispatch outcome (`responded`, `not_found`, `no_response`, `error`)
pub const REQUESTS_TOTAL: &str = "gateway_requests_total";

/// Pipeline step executions by policy and outcome (`continue`, `respond`, `fail`)
pub const POLICY_EXECUTIONS_TOTAL: &str = "gateway_policy_executions_total";

/// Reload attempts by outcome (`applied`, `rejected`)
pub const CONFIG_RELOADS_TOTAL: &str = "gateway_config_reloads_total";

/// Requests answered with 429 by `rate-limit`
pub const RATE_LIMITED_TOTAL: &str = "gateway_rate_limited_total";

/// Proxied requests by service and outcome
pub const UPSTREAM_REQUESTS_TOTAL: &str = "gateway_upstream_requests_total";

/// Register descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!(REQUESTS_TOTAL, Unit::Count, "Requests handled by the dispatcher");
    describe_counter!(POLICY_EXECUTIONS_TOTAL, Unit::Count, "Pipeline steps executed");
    describe_counter!(CONFIG_RELOADS_TOTAL, Unit::Count, "Configuration reload attempts");
    describe_counter!(RATE_LIMITED_TOTAL, Unit::Count, "Requests rejected by rate limiting");
    describe_counter!(UPSTREAM_REQUESTS_TOTAL, Unit::Count, "Requests forwarded to upstream services");
}
