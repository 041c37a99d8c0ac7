//! Integration test suite for phasepool.
//!
//! These tests exercise the scheduler, the process executor and the
//! manifest runner together, with real child processes.
//!
//! # Test Categories
//!
//! - `scheduler_flow`: Dispatch order, fan-out/fan-in, worker bound, failures
//! - `process_limits`: Timeouts, memory breaches and timing under the monitor
//! - `bench_run`: Manifest cases end to end, including resume
//!
//! # CI Compatibility
//!
//! External tools are stood in for by `/bin/sh` scripts, including the
//! limit monitor, so nothing beyond a POSIX shell is required.

mod fixtures;

mod scheduler_flow;
