//! Autoscaling: metric analysis, decision records, and execution

pub mod decision;
pub mod engine;
pub mod executor;

pub use decision::{ScalingAction, ScalingDecision, ScalingThresholds};
pub use engine::AutoScalingEngine;
pub use executor::DecisionExecutor;
