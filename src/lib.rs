pub mod broadcaster;
pub mod browser_pool;
pub mod browser_profile;
pub mod browser_setup;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod field_data;
pub mod http;
pub mod lighthouse;
pub mod limiter;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod singleflight;
pub mod synthesis;
pub mod utils;

pub use dispatcher::Dispatcher;
pub use error::{AuditError, AuditResult};
