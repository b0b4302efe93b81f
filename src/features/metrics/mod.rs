pub mod service;

pub use service::{metrics_middleware, MetricsService};
