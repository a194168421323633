pub mod broker;
pub mod events;
pub mod keys;
pub mod metrics;

pub use broker::Broker;
pub use metrics::BrokerMetrics;
