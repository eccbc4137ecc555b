// Core types and functionality for the Runloom workflow run engine

pub mod config;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod storage;
pub mod types;
pub mod workflow;

pub use config::{EngineConfig, StepRetryMode};
pub use error::{EngineError, EngineResult, StoreError, StoreResult};
pub use types::*;
