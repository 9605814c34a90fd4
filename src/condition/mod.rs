//! Composite conditions.
//!
//! A client [`Expression`] is compiled into a [`ConditionTree`] of threshold
//! leaves joined by AND/OR. Trees live in a [`ConditionRegistry`] owned by the
//! [`ConditionContext`] worker, which applies leaf signals one at a time.

pub mod context;
pub mod expr;
pub mod registry;
pub mod tree;

pub use context::ConditionContext;
pub use expr::{Expression, MAX_EXPRESSION_DEPTH};
pub use registry::{ConditionCallback, ConditionEvent, ConditionMonitor, ConditionRegistry};
pub use tree::{ConditionTree, LeafSpec, NodeIdx, NodeStatus, ThresholdHost};
