//! Context propagation between stages.

mod execution;

pub use execution::{ExecutionContext, SEED_KEYS};
