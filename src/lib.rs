//! surge: a rate-shaped HTTP load generator.
//!
//! A plan describes a multi-step scenario and a load shape. The engine
//! turns the shape into a per-tick request vector, runs one scenario
//! iteration per scheduled slot and aggregates the results into a summary
//! that is checked against the plan's success criteria.

pub mod aggregator;
pub mod config;
pub mod cookie;
pub mod data;
pub mod engine;
pub mod env;
pub mod error;
pub mod expression;
pub mod extract;
pub mod faker;
pub mod inject;
pub mod model;
pub mod pool;
pub mod proxy;
pub mod report;
pub mod requester;
pub mod runtime;
pub mod scheduler;
pub mod transport;
pub mod validator;
pub mod value;

pub use config::PlanConfig;
pub use engine::Engine;
pub use error::{ErrorKind, PlanError, RequestError};
pub use model::*;
pub use report::{Report, ReportSink};
pub use scheduler::Outcome;
pub use value::Value;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
