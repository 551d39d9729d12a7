pub mod aggregator;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod fleet;
pub mod instance;
pub mod lease;
pub mod liveness;
pub mod memory_config;
pub mod metrics;
pub mod node;
pub mod patterns;
pub mod planner;
pub mod queue;
pub mod runner;
pub mod store;
pub mod telemetry;
pub mod validators;
pub mod warc;
pub mod worker;

#[cfg(feature = "distributed")]
pub mod s3_state;
#[cfg(feature = "distributed")]
pub mod sqs_queue;

pub use error::*;
