//! Testing utilities for forgeflow pipelines.
//!
//! This module provides:
//! - Scripted workers and a shared call log
//! - A store that injects persistence failures
//! - A harness with a persisted pipeline and collecting sinks

mod fixtures;
mod mocks;

pub use fixtures::{
    architecture_project, fast_config, full_project, wait_until, TestHarness, TestHarnessBuilder,
};
pub use mocks::{
    default_output, scripted_dispatcher, CallLog, FlakyStore, ScriptStep, ScriptedWorker,
};
