#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use std::sync::{Arc, Once};

use tracing_subscriber::EnvFilter;
use weft_runtime::{Runtime, RuntimeConfig, TestClock};

static INIT_LOGGING: Once = Once::new();

/// Route `tracing` output to the test harness. `RUST_LOG` picks the level.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// A work-stealing runtime with a few workers.
pub fn runtime() -> Runtime {
    init_test_logging();
    Runtime::new(RuntimeConfig::new().with_workers(4)).expect("runtime should start")
}

/// A runtime on a virtual clock that only moves when the test says so.
pub fn test_runtime() -> (Runtime, TestClock) {
    init_test_logging();
    let clock = TestClock::new();
    let runtime = Runtime::builder()
        .config(RuntimeConfig::new().with_workers(2))
        .clock(Arc::new(clock.clone()))
        .build()
        .expect("runtime should start");
    (runtime, clock)
}

/// Proptest config with a fixed case count and no failure persistence.
pub fn test_proptest_config(cases: u32) -> proptest::test_runner::Config {
    proptest::test_runner::Config {
        cases,
        failure_persistence: None,
        ..proptest::test_runner::Config::default()
    }
}
