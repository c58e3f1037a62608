// Structured logging
pub mod logging;

// Metric names and descriptions
pub mod metrics;

pub use logging::init_logging;
pub use metrics::describe_metrics;
