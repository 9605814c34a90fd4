//! # Metron - Metric Monitoring Engine
//!
//! Metron schedules sampling of many heterogeneous metric sources (sensors,
//! system counters, network counters) at client-requested rates, and evaluates
//! client-registered boolean conditions over metric thresholds without polling
//! every source all the time.
//!
//! ## Core Concepts
//!
//! - **Metric Node**: the single authority for all monitoring of one metric
//! - **Timed monitor**: a sample delivered every period
//! - **Opportunistic monitor**: piggybacks on other sampling, forced only when stale
//! - **Condition**: an AND/OR tree of threshold leaves; only the leaves needed to
//!   decide the outcome watch their metric
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use metron::{Expression, MonitorEngine, Threshold};
//!
//! let engine = MonitorEngine::builder()
//!     .source(battery_source)
//!     .source(light_source)
//!     .build()?;
//!
//! let low_and_bright = Expression::below("battery", Threshold::Int { value: 15 })
//!     .and(Expression::above("light", Threshold::Float { value: 300.0 }));
//! engine.register_condition(&low_and_bright, Arc::new(|ev| println!("{ev:?}")), 0)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod metric;
pub mod time;
pub mod value;

// Scheduling and evaluation
pub mod condition;
pub mod engine;
pub mod monitor;

// Re-export primary types at crate root for convenience
pub use condition::{ConditionCallback, ConditionEvent, Expression};
pub use config::EngineConfig;
pub use engine::{EngineStats, MonitorEngine, MonitorEngineBuilder, SampleSink};
pub use error::{ExecutionError, MetronError, MetronResult, ValidationError};
pub use metric::{MetricId, MetricSource};
pub use monitor::{MetricNode, MonitorId, SampleCallback, SampleEvent};
pub use time::{Clock, ManualClock, Millis, MonotonicClock};
pub use value::{GeoPoint, MetricValue, Threshold, ValueKind};
